//! The listener: binds a TCP socket with `SO_REUSEADDR`, then spawns one
//! detached thread per accepted connection. Mirrors the source's `main`
//! accept loop (`socket` + `setsockopt(SO_REUSEADDR)` + `bind` + `listen`,
//! then `accept` in a loop handing each connection to its own thread).
//!
//! `std::net::TcpListener` has no pre-bind hook for socket options, so the
//! listening socket itself is built through `socket2` and converted once
//! bound.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;

use socket2::{Domain, Socket, Type};
use tracing::{error, info, warn};

use crate::cache::CacheIndex;
use crate::config::Config;
use crate::fetcher::Fetcher;
use crate::router::RequestRouter;

/// A bound, listening proxy server. Construct with [`Server::bind`], then
/// drive the accept loop with [`Server::serve`].
pub struct Server {
    listener: TcpListener,
    router: Arc<RequestRouter>,
}

impl Server {
    /// Bind a listener on `0.0.0.0:{config.port}` with `SO_REUSEADDR` set and
    /// the configured backlog, and build the [`RequestRouter`] that will
    /// handle every accepted connection.
    pub fn bind(config: &Config, fetcher: Arc<dyn Fetcher>) -> std::io::Result<Self> {
        let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();

        let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(config.listen_backlog)?;
        let listener: TcpListener = socket.into();

        let cache = Arc::new(CacheIndex::new(config.max_cache_size, config.cache_ttl));
        let router = Arc::new(RequestRouter::new(
            cache,
            fetcher,
            config.initial_buffer_capacity,
            config.max_response_size,
        ));

        info!(port = config.port, backlog = config.listen_backlog, "listening");
        Ok(Self { listener, router })
    }

    /// Build a [`Server`] around an already-bound, already-listening
    /// [`TcpListener`], for callers (tests, embedders) that want control
    /// over socket setup themselves.
    pub fn from_listener(listener: TcpListener, config: &Config, fetcher: Arc<dyn Fetcher>) -> Self {
        let cache = Arc::new(CacheIndex::new(config.max_cache_size, config.cache_ttl));
        let router = Arc::new(RequestRouter::new(
            cache,
            fetcher,
            config.initial_buffer_capacity,
            config.max_response_size,
        ));
        Self { listener, router }
    }

    /// The address actually bound, useful when `config.port` was `0`.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever, handing each to its own detached thread.
    /// A transient `accept` failure is logged and the loop continues, same
    /// as the source's `if (client_socket < 0) continue;`.
    pub fn serve(&self) -> ! {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.spawn_connection(stream, peer),
                Err(err) => {
                    warn!(error = %err, "accept failed, continuing");
                }
            }
        }
    }

    /// Accept and serve exactly one connection on the current thread.
    /// Intended for tests that want deterministic, non-threaded control.
    pub fn serve_one(&self) -> std::io::Result<()> {
        let (stream, _peer) = self.listener.accept()?;
        self.router.handle_connection(stream);
        Ok(())
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let router = Arc::clone(&self.router);
        let spawned = std::thread::Builder::new()
            .name(format!("cache-proxy-conn-{peer}"))
            .spawn(move || router.handle_connection(stream));
        if let Err(err) = spawned {
            error!(error = %err, %peer, "failed to spawn connection thread");
        }
    }
}
