use tokio::sync::broadcast;
use tracing::trace;

use crate::protocol::{PeerId, PeerIdentity};
use crate::session::SessionState;
use crate::transfer::ReceivedFile;
use crate::transport::TransportEvent;

/// Everything a UI (or any other consumer) observes about peers and transfers.
#[derive(Clone, Debug, PartialEq)]
pub enum PeerEvent {
    /// full roster as received from the rendezvous server
    PeersUpdated(PeersUpdatedData),
    PeerJoined(PeerJoinedData),
    PeerLeft(PeerLeftData),
    /// this client's own identity as assigned by the rendezvous server
    DisplayName(DisplayNameData),
    ConnectionRequested(ConnectionRequestedData),
    RequestDeclined(RequestDeclinedData),
    SessionStateChanged(SessionStateChangedData),
    Progress(ProgressData),
    FileReceived(FileReceivedData),
    TextReceived(TextReceivedData),
    TransferCompleted(TransferCompletedData),
    TransferFailed(TransferFailedData),
    /// low-level transport status, sent in addition to session state changes
    TransportStatus(TransportStatusData),
    ServerConnectivity(ServerConnectivityData),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeersUpdatedData {
    pub peers: Vec<PeerIdentity>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerJoinedData {
    pub peer: PeerIdentity,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerLeftData {
    pub peer_id: PeerId,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DisplayNameData {
    pub identity: PeerIdentity,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionRequestedData {
    pub peer_id: PeerId,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestDeclinedData {
    pub peer_id: PeerId,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionStateChangedData {
    pub peer_id: PeerId,
    pub old_state: SessionState,
    pub new_state: SessionState,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferDirection {
    Sending,
    Receiving,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProgressData {
    pub peer_id: PeerId,
    pub direction: TransferDirection,
    /// between 0.0 and 1.0
    pub progress: f64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileReceivedData {
    pub peer_id: PeerId,
    pub file: ReceivedFile,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextReceivedData {
    pub peer_id: PeerId,
    pub text: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferCompletedData {
    pub peer_id: PeerId,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferFailedData {
    pub peer_id: PeerId,
    pub name: String,
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportStatusData {
    pub peer_id: PeerId,
    pub event: TransportEvent,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConnectivityData {
    pub connected: bool,
    pub message: String,
}


pub struct PeerEventNotifier {
    sender: broadcast::Sender<PeerEvent>,
}
impl PeerEventNotifier {
    pub fn new(buffer_size: usize) -> PeerEventNotifier {
        let (sender, _) = broadcast::channel(buffer_size);

        PeerEventNotifier {
            sender
        }
    }

    /// A subscriber that falls more than `buffer_size` events behind loses the oldest ones,
    ///  received files included. Receiving progress is published in steps of
    ///  `progress_report_step` to keep the volume down.
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: PeerEvent) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}
