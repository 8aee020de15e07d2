mod correlation;
mod error;
mod relay;
mod server;
mod tunnel;

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use mobile_proxy_core::DEFAULT_PORT;
use tracing_subscriber::EnvFilter;

use crate::relay::RelayConfig;

#[derive(Debug, Parser)]
#[clap(
    name = "mobile-proxy-server",
    about = "Relay HTTP requests to devices connected over WebSocket tunnels"
)]
struct Cli {
    /// Address to listen on.
    #[clap(long, env = "MOBILE_PROXY_LISTEN", default_value_t = format!("0.0.0.0:{DEFAULT_PORT}"))]
    listen: String,

    /// Maximum number of simultaneously connected devices.
    #[clap(long, env = "MOBILE_PROXY_MAX_CLIENTS", default_value_t = 200)]
    max_clients: usize,

    /// Maximum number of requests awaiting a device reply, across all devices.
    #[clap(
        long,
        env = "MOBILE_PROXY_POOL_SIZE",
        default_value_t = 20,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pool_size: u32,

    /// Seconds to wait for a device to reply before answering 500.
    #[clap(long, env = "MOBILE_PROXY_REPLY_TIMEOUT_SECS", default_value_t = 10)]
    reply_timeout_secs: u64,

    /// Seconds a request may wait for a free relay slot. Waits indefinitely when unset.
    #[clap(long, env = "MOBILE_PROXY_ALLOCATION_TIMEOUT_SECS")]
    allocation_timeout_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("mobile_proxy_server=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let config = server::ServerConfig {
        listen: cli.listen,
        relay: RelayConfig {
            max_clients: cli.max_clients,
            pool_size: cli.pool_size as usize,
            reply_timeout: Duration::from_secs(cli.reply_timeout_secs),
            allocation_timeout: cli.allocation_timeout_secs.map(Duration::from_secs),
        },
    };

    server::run(config).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_relay_defaults() {
        let cli = Cli::try_parse_from(["mobile-proxy-server"]).unwrap();
        let defaults = RelayConfig::default();
        assert_eq!(cli.listen, format!("0.0.0.0:{DEFAULT_PORT}"));
        assert_eq!(cli.max_clients, defaults.max_clients);
        assert_eq!(cli.pool_size as usize, defaults.pool_size);
        assert_eq!(Duration::from_secs(cli.reply_timeout_secs), defaults.reply_timeout);
        assert_eq!(cli.allocation_timeout_secs, None);
    }

    #[test]
    fn zero_pool_size_is_rejected() {
        assert!(Cli::try_parse_from(["mobile-proxy-server", "--pool-size", "0"]).is_err());
    }
}
