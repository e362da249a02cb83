//! One session per remote peer: the connection handshake, file and text transfer, and partition
//!  flow control. Each session runs as its own task and processes its inputs one at a time.

use std::future::pending;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tokio::select;
use tracing::debug;

use crate::protocol::PeerId;
use crate::transfer::OutgoingFile;
use crate::transport::{Frame, FrameHandler, TransportEvent};

pub mod connected_slot;
mod session_protocol;

pub use connected_slot::ConnectedSlot;
pub use session_protocol::SessionProtocol;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeDirection {
    /// we asked the remote peer to connect
    Outgoing,
    /// the remote peer asked us
    Incoming,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    HandshakePending(HandshakeDirection),
    Connected,
    Transferring,
    Disconnected,
}
impl SessionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected | SessionState::Transferring)
    }
}

/// user intents addressed to a single peer
#[derive(Debug)]
pub enum PeerCommand {
    RequestConnection,
    CancelRequest,
    Accept,
    Decline,
    Disconnect,
    SendFiles(Vec<OutgoingFile>),
    SendText(String),
}

#[derive(Debug)]
pub enum SessionInput {
    Frame(Frame),
    Command(PeerCommand),
    TransportEvent(TransportEvent),
    /// another session became connected: disconnect, then signal `done`
    Evict(oneshot::Sender<()>),
    Close,
}

#[derive(Clone, Debug)]
pub struct SessionHandle {
    peer_id: PeerId,
    inbox: mpsc::UnboundedSender<SessionInput>,
}

impl SessionHandle {
    pub fn new(peer_id: PeerId) -> (SessionHandle, mpsc::UnboundedReceiver<SessionInput>) {
        let (inbox, receiver) = mpsc::unbounded_channel();
        (SessionHandle { peer_id, inbox }, receiver)
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn is_alive(&self) -> bool {
        !self.inbox.is_closed()
    }

    /// returns `false` if the session terminated
    pub fn send(&self, input: SessionInput) -> bool {
        self.inbox.send(input).is_ok()
    }

    pub fn command(&self, command: PeerCommand) -> anyhow::Result<()> {
        if !self.send(SessionInput::Command(command)) {
            anyhow::bail!("session with {:?} terminated", self.peer_id);
        }
        Ok(())
    }

    pub fn evict(&self, done: oneshot::Sender<()>) -> bool {
        self.send(SessionInput::Evict(done))
    }

    pub fn close(&self) {
        self.send(SessionInput::Close);
    }
}

impl FrameHandler for SessionHandle {
    fn on_frame(&self, frame: Frame) {
        if !self.send(SessionInput::Frame(frame)) {
            debug!("dropping frame for terminated session with {:?}", self.peer_id);
        }
    }

    fn on_transport_event(&self, event: TransportEvent) {
        self.send(SessionInput::TransportEvent(event));
    }
}

pub async fn run_session(mut protocol: SessionProtocol, mut inbox: mpsc::UnboundedReceiver<SessionInput>) {
    loop {
        let ack_deadline = protocol.ack_deadline();

        select! {
            input = inbox.recv() => {
                let keep_running = match input {
                    Some(input) => protocol.on_input(input).await,
                    None => false,
                };
                if !keep_running {
                    break;
                }
            }
            _ = sleep_until_or_forever(ack_deadline) => {
                protocol.on_ack_timeout().await;
            }
        }
    }

    protocol.shut_down().await;
    debug!("session with {:?} terminated", protocol.peer_id());
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}
