use clap::Parser;
use clap_derive::Parser;
use peerdrop::client::{ClientCommand, PeerClient};
use peerdrop::config::PeerConfig;
use peerdrop::events::PeerEvent;
use peerdrop::protocol::PeerId;
use peerdrop::session::{PeerCommand, SessionState};
use peerdrop::transfer::OutgoingFile;
use tokio::select;
use tokio::sync::mpsc;
use tracing::{info, warn, Level};

/// A peer without UI: accepts every connection request, stores received files in the current
///  directory, and optionally sends files or a text to the first peer it sees.
#[derive(Parser)]
struct Args {
    #[clap(default_value = "ws://127.0.0.1:3000")]
    server_url: String,

    /// send this file to the first peer that shows up (repeatable)
    #[clap(long)]
    send: Vec<String>,

    /// send this text to the first peer that shows up
    #[clap(long)]
    text: Option<String>,

    /// use relayed channels only
    #[clap(long, default_value_t = false)]
    no_webrtc: bool,

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

    let mut config = PeerConfig::new(args.server_url.clone());
    config.direct_channel_capable = !args.no_webrtc;

    let client = PeerClient::new(config);
    let events = client.subscribe();
    let commands = client.commands();

    select! {
        result = client.run() => { result }
        result = handle_events(events, commands, args) => { result }
        _ = tokio::signal::ctrl_c() => {
            info!("received Ctrl-C, exiting...");
            Ok(())
        }
    }
}

async fn handle_events(mut events: tokio::sync::broadcast::Receiver<PeerEvent>, commands: mpsc::Sender<ClientCommand>, args: Args) -> anyhow::Result<()> {
    let mut outgoing = if args.send.is_empty() && args.text.is_none() { None } else { Some((args.send, args.text)) };
    let mut target: Option<PeerId> = None;

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                warn!("skipped {} events", n);
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
        };

        match event {
            PeerEvent::DisplayName(data) => info!("known as {} ({})", data.identity.display_name, data.identity.device_label),
            PeerEvent::PeersUpdated(data) => {
                for peer in &data.peers {
                    info!("peer: {} ({})", peer.display_name, peer.device_label);
                }
                if let Some(peer) = data.peers.first() {
                    request_target(&commands, &mut target, &outgoing, &peer.id).await?;
                }
            }
            PeerEvent::PeerJoined(data) => {
                info!("{} ({}) joined", data.peer.display_name, data.peer.device_label);
                request_target(&commands, &mut target, &outgoing, &data.peer.id).await?;
            }
            PeerEvent::PeerLeft(data) => info!("{} left", data.peer_id),
            PeerEvent::ConnectionRequested(data) => {
                info!("accepting connection request from {}", data.peer_id);
                commands.send(ClientCommand::Peer { peer_id: data.peer_id, command: PeerCommand::Accept }).await?;
            }
            PeerEvent::RequestDeclined(data) => info!("{} declined", data.peer_id),
            PeerEvent::SessionStateChanged(data) => {
                info!("{}: {:?} -> {:?}", data.peer_id, data.old_state, data.new_state);
                if data.new_state == SessionState::Connected && target.as_ref() == Some(&data.peer_id) {
                    if let Some((files, text)) = outgoing.take() {
                        send_to(&commands, &data.peer_id, files, text).await?;
                    }
                }
            }
            PeerEvent::Progress(data) => info!("{:?} {}: {:.0}%", data.direction, data.peer_id, data.progress * 100.0),
            PeerEvent::FileReceived(data) => {
                let name = std::path::Path::new(&data.file.name)
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "received.bin".to_string());
                tokio::fs::write(&name, &data.file.data).await?;
                info!("stored {} ({} bytes, {}) from {}", name, data.file.size, data.file.mime, data.peer_id);
            }
            PeerEvent::TextReceived(data) => info!("text from {}: {}", data.peer_id, data.text),
            PeerEvent::TransferCompleted(data) => info!("{} was delivered to {}", data.name, data.peer_id),
            PeerEvent::TransferFailed(data) => warn!("sending {} to {} failed: {}", data.name, data.peer_id, data.reason),
            PeerEvent::TransportStatus(_) => {}
            PeerEvent::ServerConnectivity(data) => info!("rendezvous server: {}", data.message),
        }
    }
}

async fn request_target(commands: &mpsc::Sender<ClientCommand>, target: &mut Option<PeerId>, outgoing: &Option<(Vec<String>, Option<String>)>, peer_id: &PeerId) -> anyhow::Result<()> {
    if outgoing.is_none() || target.is_some() {
        return Ok(());
    }
    info!("requesting connection to {}", peer_id);
    *target = Some(peer_id.clone());
    commands.send(ClientCommand::Peer { peer_id: peer_id.clone(), command: PeerCommand::RequestConnection }).await?;
    Ok(())
}

async fn send_to(commands: &mpsc::Sender<ClientCommand>, peer_id: &PeerId, files: Vec<String>, text: Option<String>) -> anyhow::Result<()> {
    let mut outgoing = Vec::new();
    for path in files {
        outgoing.push(OutgoingFile::from_path(&path).await?);
    }
    if !outgoing.is_empty() {
        commands.send(ClientCommand::Peer { peer_id: peer_id.clone(), command: PeerCommand::SendFiles(outgoing) }).await?;
    }
    if let Some(text) = text {
        commands.send(ClientCommand::Peer { peer_id: peer_id.clone(), command: PeerCommand::SendText(text) }).await?;
    }
    Ok(())
}
