//! Request parsing and cache dispatch: the glue between a raw client
//! connection, the [`CacheIndex`], and a [`Fetcher`].
//!
//! [`RequestRouter::handle_connection`] is the Rust analogue of the source's
//! `handle_client`: read a bounded request head, parse it into a route key,
//! then either serve a cached hit (fast path or in-flight stream) or install
//! a fresh buffer and dispatch a producer for it.

use std::io::{Read, Write};
use std::sync::Arc;

use tracing::{info, warn};

use crate::buffer::StreamBuffer;
use crate::cache::CacheIndex;
use crate::error::ParseError;
use crate::fetcher::{spawn_producer, Fetcher};

/// Hard cap on the bytes read while looking for the end of a request head.
pub const MAX_HEAD_SIZE: usize = 8 * 1024;

const READ_CHUNK: usize = 512;

/// A parsed `GET` request: origin host/port plus the path to forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl ParsedRequest {
    /// The cache key: `host:port/path`, matching the source's `snprintf`
    /// composition of `url` so behavior stays comparable.
    pub fn cache_key(&self) -> String {
        format!("{}:{}{}", self.host, self.port, self.path)
    }
}

/// Read up to [`MAX_HEAD_SIZE`] bytes from `reader`, stopping as soon as a
/// `\r\n\r\n` terminator is seen. Returns [`ParseError::ConnectionClosed`] if
/// the peer closes before sending anything, and [`ParseError::HeadTooLarge`]
/// if the cap is hit without ever finding the terminator.
pub fn read_request_head<R: Read>(reader: &mut R) -> Result<Vec<u8>, ParseError> {
    let mut buf = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        if buf.len() >= MAX_HEAD_SIZE {
            return Err(ParseError::HeadTooLarge);
        }
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if ends_with_head_terminator(&buf) {
            break;
        }
    }

    if buf.is_empty() {
        return Err(ParseError::ConnectionClosed);
    }
    Ok(buf)
}

fn ends_with_head_terminator(buf: &[u8]) -> bool {
    buf.windows(4).any(|w| w == b"\r\n\r\n")
}

/// Parse a raw request head into a [`ParsedRequest`]. Only `GET` is
/// supported; anything else is rejected rather than silently proxied.
pub fn parse_request_head(head: &[u8]) -> Result<ParsedRequest, ParseError> {
    let text = String::from_utf8_lossy(head);

    let after_method = text.strip_prefix("GET ").ok_or(ParseError::NotGet)?;
    let url_end = after_method.find(" HTTP/").ok_or(ParseError::MissingUrl)?;
    let url = &after_method[..url_end];
    if url.is_empty() {
        return Err(ParseError::MissingUrl);
    }

    let url = url.strip_prefix("http://").unwrap_or(url);

    let (host_port, path) = match url.find('/') {
        Some(idx) => (&url[..idx], url[idx..].to_string()),
        None => (url, "/".to_string()),
    };

    if host_port.is_empty() {
        return Err(ParseError::MalformedUrl(url.to_string()));
    }

    let (host, port) = match host_port.split_once(':') {
        Some((h, p)) => {
            let port: u16 = p
                .parse()
                .map_err(|_| ParseError::MalformedUrl(url.to_string()))?;
            (h.to_string(), port)
        }
        None => (host_port.to_string(), 80),
    };

    if host.is_empty() {
        return Err(ParseError::MalformedUrl(url.to_string()));
    }

    Ok(ParsedRequest { host, port, path })
}

const RESPONSE_BAD_REQUEST: &[u8] = b"HTTP/1.0 400 Bad Request\r\n\r\n";
const RESPONSE_SERVER_ERROR: &[u8] = b"HTTP/1.0 500 Internal Server Error\r\n\r\n";

/// Ties a [`CacheIndex`] and a [`Fetcher`] together to serve one client
/// connection at a time. Stateless and cheap to clone-by-`Arc`; one instance
/// is shared across every connection thread the server spawns.
pub struct RequestRouter {
    cache: Arc<CacheIndex>,
    fetcher: Arc<dyn Fetcher>,
    initial_buffer_capacity: usize,
    max_response_size: usize,
}

impl RequestRouter {
    pub fn new(
        cache: Arc<CacheIndex>,
        fetcher: Arc<dyn Fetcher>,
        initial_buffer_capacity: usize,
        max_response_size: usize,
    ) -> Self {
        Self {
            cache,
            fetcher,
            initial_buffer_capacity,
            max_response_size,
        }
    }

    fn fresh_buffer(&self) -> Arc<StreamBuffer> {
        Arc::new(StreamBuffer::new(self.initial_buffer_capacity, self.max_response_size))
    }

    /// Serve one client connection end to end: parse its request head, route
    /// it through the cache, and stream a response back. Never panics on a
    /// malformed or disconnecting client; errors are logged and translated
    /// into a best-effort HTTP error line where a line can still be sent.
    pub fn handle_connection<S: Read + Write>(&self, mut stream: S) {
        let head = match read_request_head(&mut stream) {
            Ok(head) => head,
            Err(ParseError::ConnectionClosed) => return,
            Err(err) => {
                warn!(error = %err, "failed to read request head");
                let _ = stream.write_all(RESPONSE_BAD_REQUEST);
                return;
            }
        };

        let request = match parse_request_head(&head) {
            Ok(request) => request,
            Err(err) => {
                warn!(error = %err, "failed to parse request");
                let _ = stream.write_all(RESPONSE_BAD_REQUEST);
                return;
            }
        };

        let key = request.cache_key();
        let (buffer, fresh) = self.cache.get_or_create(&key, || self.fresh_buffer());

        let buffer = if fresh {
            info!(url = %key, "cache miss, dispatching fetch");
            spawn_producer(
                Arc::clone(&self.fetcher),
                request.host.clone(),
                request.port,
                request.path.clone(),
                Arc::clone(&buffer),
            );
            buffer
        } else if buffer.is_complete() && buffer.is_error() {
            // A stale, terminally-failed entry: treat as a miss, the same
            // way the source's own hit-detection falls through to a fresh
            // download when neither of its two branches matches. Installing
            // under the same key displaces the old entry instead of
            // duplicating it.
            info!(url = %key, "reusing errored entry as a miss, relaunching fetch");
            let replacement = self.fresh_buffer();
            self.cache.install(key.clone(), Arc::clone(&replacement));
            spawn_producer(
                Arc::clone(&self.fetcher),
                request.host.clone(),
                request.port,
                request.path.clone(),
                Arc::clone(&replacement),
            );
            replacement
        } else if buffer.is_complete() {
            info!(url = %key, size = buffer.len(), "cache hit, complete");
            buffer
        } else {
            info!(url = %key, "cache hit, streaming in progress");
            buffer
        };

        let result = if buffer.is_complete() && !buffer.is_error() {
            let _guard = buffer.attach_reader();
            buffer.write_complete_snapshot(&mut stream)
        } else {
            let guard = buffer.attach_reader();
            buffer.stream(&guard, &mut stream)
        };

        if let Err(err) = result {
            warn!(url = %key, error = %err, "error writing response to client");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_read_request_head_stops_at_terminator() {
        let mut reader = Cursor::new(b"GET / HTTP/1.0\r\n\r\ntrailing-garbage".to_vec());
        let head = read_request_head(&mut reader).unwrap();
        assert!(head.ends_with(b"\r\n\r\n"));
        assert!(!String::from_utf8_lossy(&head).contains("trailing"));
    }

    #[test]
    fn test_read_request_head_empty_connection_is_closed() {
        let mut reader = Cursor::new(Vec::<u8>::new());
        assert!(matches!(
            read_request_head(&mut reader),
            Err(ParseError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_read_request_head_over_cap_errors() {
        let mut data = Vec::new();
        data.extend(std::iter::repeat(b'x').take(MAX_HEAD_SIZE + 10));
        let mut reader = Cursor::new(data);
        assert!(matches!(read_request_head(&mut reader), Err(ParseError::HeadTooLarge)));
    }

    #[test]
    fn test_parse_absolute_form_url_with_explicit_port() {
        let head = b"GET http://example.test:8080/a/b HTTP/1.0\r\nHost: example.test\r\n\r\n";
        let parsed = parse_request_head(head).unwrap();
        assert_eq!(parsed.host, "example.test");
        assert_eq!(parsed.port, 8080);
        assert_eq!(parsed.path, "/a/b");
    }

    #[test]
    fn test_parse_defaults_to_port_80_and_root_path() {
        let head = b"GET http://example.test HTTP/1.0\r\n\r\n";
        let parsed = parse_request_head(head).unwrap();
        assert_eq!(parsed.host, "example.test");
        assert_eq!(parsed.port, 80);
        assert_eq!(parsed.path, "/");
    }

    #[test]
    fn test_parse_rejects_non_get_method() {
        let head = b"POST / HTTP/1.0\r\n\r\n";
        assert!(matches!(parse_request_head(head), Err(ParseError::NotGet)));
    }

    #[test]
    fn test_parse_rejects_missing_url() {
        let head = b"GET  HTTP/1.0\r\n\r\n";
        assert!(matches!(parse_request_head(head), Err(ParseError::MissingUrl)));
    }

    #[test]
    fn test_cache_key_matches_source_url_composition() {
        let parsed = ParsedRequest {
            host: "example.test".to_string(),
            port: 80,
            path: "/a".to_string(),
        };
        assert_eq!(parsed.cache_key(), "example.test:80/a");
    }

    struct StaticFetcher {
        calls: AtomicUsize,
        body: &'static [u8],
    }

    impl Fetcher for StaticFetcher {
        fn fetch(&self, _host: &str, _port: u16, _path: &str, buffer: Arc<StreamBuffer>) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            buffer.append(self.body).unwrap();
            buffer.complete();
        }
    }

    fn test_router(fetcher: Arc<StaticFetcher>) -> RequestRouter {
        RequestRouter::new(
            Arc::new(CacheIndex::with_defaults()),
            fetcher as Arc<dyn Fetcher>,
            1024,
            1024 * 1024,
        )
    }

    #[test]
    fn test_handle_connection_miss_then_hit_calls_fetcher_once() {
        let fetcher = Arc::new(StaticFetcher {
            calls: AtomicUsize::new(0),
            body: b"HTTP/1.0 200 OK\r\n\r\nbody",
        });
        let router = test_router(Arc::clone(&fetcher));

        let request = b"GET http://example.test/a HTTP/1.0\r\n\r\n".to_vec();
        let mut io = TestStream::new(request);
        router.handle_connection(&mut io);
        assert_eq!(io.written, b"HTTP/1.0 200 OK\r\n\r\nbody");

        // A little time for the producer thread in the miss path to finish
        // latching `complete` before the second request is issued.
        std::thread::sleep(Duration::from_millis(20));

        let mut io2 = TestStream::new(b"GET http://example.test/a HTTP/1.0\r\n\r\n".to_vec());
        router.handle_connection(&mut io2);
        assert_eq!(io2.written, b"HTTP/1.0 200 OK\r\n\r\nbody");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1, "second request must be a cache hit");
    }

    #[test]
    fn test_handle_connection_bad_request_gets_400() {
        let fetcher = Arc::new(StaticFetcher {
            calls: AtomicUsize::new(0),
            body: b"",
        });
        let router = test_router(fetcher);
        let mut io = TestStream::new(b"POST / HTTP/1.0\r\n\r\n".to_vec());
        router.handle_connection(&mut io);
        assert_eq!(io.written, RESPONSE_BAD_REQUEST);
    }

    /// A `Read + Write` test double: reads from a fixed request buffer and
    /// accumulates every write, so a single object can stand in for a socket.
    struct TestStream {
        request: Cursor<Vec<u8>>,
        written: Vec<u8>,
    }

    impl TestStream {
        fn new(request: Vec<u8>) -> Self {
            Self {
                request: Cursor::new(request),
                written: Vec::new(),
            }
        }
    }

    impl Read for TestStream {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.request.read(buf)
        }
    }

    impl Write for TestStream {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
}
