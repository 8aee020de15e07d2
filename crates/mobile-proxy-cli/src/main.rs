use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use mobile_proxy_client::TunnelClient;

#[derive(Debug, Parser)]
#[clap(
    name = "mobile-proxy",
    about = "Expose a local port through a mobile proxy tunnel"
)]
struct Cli {
    /// Local port to expose.
    #[clap(short, long)]
    port: u16,

    /// Tunnel server URL (e.g. "ws://proxy.example.com:3000").
    #[clap(short, long, env = "MOBILE_PROXY_SERVER")]
    server: String,

    /// Id this device registers under; requests arrive at /mobile/{client_id}/...
    #[clap(short, long, env = "MOBILE_PROXY_CLIENT_ID")]
    client_id: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("mobile_proxy_client=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let local_addr: SocketAddr = format!("127.0.0.1:{}", cli.port).parse()?;

    let handle = TunnelClient::new(&cli.server, cli.client_id, local_addr)
        .connect()
        .await?;

    eprintln!();
    eprintln!("  mobile proxy tunnel is live!");
    eprintln!();
    eprintln!("  Client id:   {}", handle.client_id());
    eprintln!(
        "  Forwarding:  {}/mobile/{}/ → {}",
        cli.server.trim_end_matches('/'),
        handle.client_id(),
        local_addr
    );
    eprintln!();

    tokio::signal::ctrl_c().await?;
    eprintln!("shutting down...");
    handle.close().await;

    Ok(())
}
