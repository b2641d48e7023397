//! Typed error variants produced while parsing a client request.
//!
//! Fetch failures are not represented as a `Result` error type here: per the
//! [`crate::fetcher::Fetcher`] contract, they are signalled to the buffer
//! itself via `fail()`, never propagated back to a caller that isn't blocked
//! on the fetch in the first place.

use std::io;

use thiserror::Error;

/// Reasons a client request's head could not be parsed into a route key.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The request head exceeded the 8 KiB read cap before `\r\n\r\n` was seen.
    #[error("request head exceeded the 8 KiB read limit")]
    HeadTooLarge,

    /// The client closed the connection before sending a complete head.
    #[error("client closed the connection before sending a complete request head")]
    ConnectionClosed,

    /// The request line did not start with `GET `.
    #[error("request method is missing or is not GET")]
    NotGet,

    /// No URL could be extracted between `GET ` and ` HTTP/`.
    #[error("request line is missing a URL")]
    MissingUrl,

    /// The extracted URL could not be split into host/port/path.
    #[error("request URL is malformed: {0}")]
    MalformedUrl(String),

    /// The underlying socket read failed.
    #[error("I/O error while reading the request head")]
    Io(#[from] io::Error),
}
