use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use clap_derive::Parser;
use peerdrop::config::RendezvousConfig;
use peerdrop::rendezvous::RendezvousServer;
use tokio::select;
use tracing::{info, Level};

#[derive(Parser)]
struct Args {
    #[clap(default_value = "0.0.0.0:3000")]
    bind_address: String,

    /// seconds between two heartbeat pings
    #[clap(long, default_value_t = 30)]
    heartbeat_secs: u64,

    /// group clients by their socket address even if an X-Forwarded-For header is present
    #[clap(long, default_value_t = false)]
    no_forwarded_for: bool,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let bind_addr: SocketAddr = args.bind_address.parse()?;
    let mut config = RendezvousConfig::new(bind_addr);
    config.heartbeat_interval = Duration::from_secs(args.heartbeat_secs.max(1));
    config.trust_forwarded_for = !args.no_forwarded_for;

    let server = RendezvousServer::new(config);

    select! {
        result = server.run() => { result }
        _ = tokio::signal::ctrl_c() => {
            info!("received Ctrl-C, exiting...");
            Ok(())
        }
    }
}
