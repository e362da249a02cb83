//! The top level of a peer: owns the rendezvous server connection and the peer registry, and
//!  processes commands from the application.

use std::sync::Arc;

use tokio::select;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::config::PeerConfig;
use crate::events::{PeerEvent, PeerEventNotifier};
use crate::protocol::PeerId;
use crate::registry::PeerRegistry;
use crate::server_connection::{ServerConnection, ServerLink};
use crate::session::PeerCommand;
use crate::transport::DefaultTransportFactory;

/// Lifecycle changes of the host application, e.g. a mobile app going to the background.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostLifecycle {
    Suspended,
    Resumed,
}

#[derive(Debug)]
pub enum ClientCommand {
    Peer { peer_id: PeerId, command: PeerCommand },
    Lifecycle(HostLifecycle),
    Shutdown,
}

pub struct PeerClient {
    events: Arc<PeerEventNotifier>,
    registry: Arc<PeerRegistry>,
    connection: ServerConnection,
    command_sender: mpsc::Sender<ClientCommand>,
    command_receiver: Mutex<mpsc::Receiver<ClientCommand>>,
}

impl PeerClient {
    pub fn new(config: PeerConfig) -> PeerClient {
        let config = Arc::new(config);
        let events = Arc::new(PeerEventNotifier::new(config.event_buffer_size));
        let link = Arc::new(ServerLink::new());

        let transports = Arc::new(DefaultTransportFactory::new(config.clone(), link.clone()));
        let registry = Arc::new(PeerRegistry::new(config.clone(), transports, events.clone()));
        let connection = ServerConnection::new(config.clone(), link, registry.clone(), events.clone());

        let (command_sender, command_receiver) = mpsc::channel(128);

        PeerClient {
            events,
            registry,
            connection,
            command_sender,
            command_receiver: Mutex::new(command_receiver),
        }
    }

    pub fn commands(&self) -> mpsc::Sender<ClientCommand> {
        self.command_sender.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// Runs until a [ClientCommand::Shutdown] is received, closing all sessions afterwards.
    pub async fn run(&self) -> anyhow::Result<()> {
        let mut commands = self.command_receiver.lock().await;

        let result = select! {
            result = self.connection.run() => result,
            _ = self.process_commands(&mut commands) => Ok(()),
        };

        info!("shutting down");
        self.registry.shut_down().await;
        result
    }

    async fn process_commands(&self, commands: &mut mpsc::Receiver<ClientCommand>) {
        while let Some(command) = commands.recv().await {
            if let ClientCommand::Shutdown = command {
                return;
            }
            if let Err(e) = self.on_command(command).await {
                warn!("command failed: {}", e);
            }
        }
    }

    async fn on_command(&self, command: ClientCommand) -> anyhow::Result<()> {
        debug!("client command: {:?}", command);
        match command {
            ClientCommand::Peer { peer_id, command } => self.registry.send_command(&peer_id, command).await,
            ClientCommand::Lifecycle(HostLifecycle::Suspended) => {
                self.connection.set_suspended(true);
                Ok(())
            }
            ClientCommand::Lifecycle(HostLifecycle::Resumed) => {
                self.connection.set_suspended(false);
                self.registry.refresh_all().await;
                Ok(())
            }
            ClientCommand::Shutdown => Ok(()),
        }
    }
}
