//! Remora rendezvous server — entry point.
//!
//! ```text
//! remora-rendezvous                       Listen on 0.0.0.0:41988
//! remora-rendezvous --listen 0.0.0.0:5000 Custom bind address
//! ```
//!
//! Pairs two peers per 48-bit session id, forwards their datagrams,
//! and answers HTTP probes on the same port with the server id.

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use remora_core::RendezvousServer;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "remora-rendezvous", about = "Remora session rendezvous server")]
struct Cli {
    /// Address to bind the UDP service and HTTP discovery listener.
    #[arg(short, long, default_value = "0.0.0.0:41988")]
    listen: String,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Init tracing.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("remora-rendezvous v{}", env!("CARGO_PKG_VERSION"));

    let server = RendezvousServer::bind(&cli.listen).await?;
    info!("listening on {}", server.local_addr());

    // Ctrl-C handler.
    let shutdown = CancellationToken::new();
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received — shutting down");
        shutdown_clone.cancel();
    });

    server.run(shutdown).await;

    Ok(())
}
