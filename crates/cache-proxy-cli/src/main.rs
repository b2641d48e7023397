use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cache_proxy::{Config, Server, TcpFetcher};

/// Run the caching HTTP forward proxy.
#[derive(Parser, Debug)]
#[command(name = "cache-proxy", about = "Concurrent caching HTTP forward proxy")]
struct Args {
    /// TCP port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Maximum number of distinct URLs held in the cache
    #[arg(long)]
    max_cache_size: Option<usize>,

    /// Per-response ceiling in bytes
    #[arg(long)]
    max_response_size: Option<usize>,

    /// Cache entry time-to-live in seconds
    #[arg(long)]
    cache_ttl_secs: Option<u64>,

    /// listen() backlog
    #[arg(long)]
    backlog: Option<i32>,
}

fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = Config::from_env();
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(n) = args.max_cache_size {
        config.max_cache_size = n;
    }
    if let Some(n) = args.max_response_size {
        config.max_response_size = n;
    }
    if let Some(secs) = args.cache_ttl_secs {
        config.cache_ttl = std::time::Duration::from_secs(secs);
    }
    if let Some(backlog) = args.backlog {
        config.listen_backlog = backlog;
    }

    let server = Server::bind(&config, Arc::new(TcpFetcher))?;
    server.serve();
}
