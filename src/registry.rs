use std::sync::Arc;

use anyhow::anyhow;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::PeerConfig;
use crate::events::{PeerEvent, PeerEventNotifier, PeerJoinedData, PeerLeftData, PeersUpdatedData};
use crate::protocol::{PeerId, PeerIdentity, SignalPayload};
use crate::session::{run_session, ConnectedSlot, PeerCommand, SessionHandle, SessionInput, SessionProtocol};
use crate::transport::{Frame, Transport, TransportFactory, TransportKind};

struct SessionEntry {
    handle: SessionHandle,
    transport: Arc<dyn Transport>,
    identity: Option<PeerIdentity>,
}
impl SessionEntry {
    async fn close(&self) {
        self.handle.close();
        self.transport.close().await;
    }
}

/// Keeps exactly one session per known remote peer, and routes everything addressed to a peer
///  to its session.
pub struct PeerRegistry {
    config: Arc<PeerConfig>,
    transports: Arc<dyn TransportFactory>,
    events: Arc<PeerEventNotifier>,
    connected_slot: Arc<ConnectedSlot>,
    sessions: RwLock<FxHashMap<PeerId, SessionEntry>>,
}

impl PeerRegistry {
    pub fn new(config: Arc<PeerConfig>, transports: Arc<dyn TransportFactory>, events: Arc<PeerEventNotifier>) -> PeerRegistry {
        PeerRegistry {
            config,
            transports,
            events,
            connected_slot: Arc::new(ConnectedSlot::new()),
            sessions: Default::default(),
        }
    }

    fn transport_kind_for(&self, peer: &PeerIdentity, is_caller: bool) -> TransportKind {
        if self.config.direct_channel_capable && peer.rtc_supported {
            TransportKind::direct(is_caller)
        }
        else {
            TransportKind::Relayed
        }
    }

    async fn create_session(&self, peer_id: &PeerId, kind: TransportKind, identity: Option<PeerIdentity>) -> anyhow::Result<SessionEntry> {
        debug!("creating session with {:?} ({:?})", peer_id, kind);
        let (handle, inbox) = SessionHandle::new(peer_id.clone());
        let transport = self.transports.create(peer_id, kind, Arc::new(handle.clone())).await?;

        let protocol = SessionProtocol::new(
            handle.clone(),
            self.config.clone(),
            transport.clone(),
            self.events.clone(),
            self.connected_slot.clone(),
        );
        tokio::spawn(run_session(protocol, inbox));

        Ok(SessionEntry {
            handle,
            transport,
            identity,
        })
    }

    /// A full roster from the rendezvous server: we are the new peer (or reconnected), so we
    ///  initiate direct channels to everybody.
    pub async fn on_peers(&self, peers: Vec<PeerIdentity>) -> anyhow::Result<()> {
        let mut sessions = self.sessions.write().await;
        for peer in &peers {
            if let Some(entry) = sessions.get_mut(&peer.id) {
                if entry.handle.is_alive() {
                    entry.identity = Some(peer.clone());
                    entry.transport.refresh().await;
                    continue;
                }
            }

            let kind = self.transport_kind_for(peer, true);
            let entry = self.create_session(&peer.id, kind, Some(peer.clone())).await?;
            if let Some(previous) = sessions.insert(peer.id.clone(), entry) {
                previous.close().await;
            }
        }
        drop(sessions);

        self.events.send_event(PeerEvent::PeersUpdated(PeersUpdatedData { peers }));
        Ok(())
    }

    /// A new peer joined: it is going to initiate, so we wait for its offer.
    pub async fn on_peer_joined(&self, peer: PeerIdentity) -> anyhow::Result<()> {
        info!("peer {:?} ({}) joined", peer.id, peer.display_name);
        let kind = self.transport_kind_for(&peer, false);

        let mut sessions = self.sessions.write().await;
        if let Some(previous) = sessions.remove(&peer.id) {
            debug!("{:?} re-joined, replacing its session", peer.id);
            previous.close().await;
        }
        let entry = self.create_session(&peer.id, kind, Some(peer.clone())).await?;
        sessions.insert(peer.id.clone(), entry);
        drop(sessions);

        self.events.send_event(PeerEvent::PeerJoined(PeerJoinedData { peer }));
        Ok(())
    }

    pub async fn on_peer_left(&self, peer_id: &PeerId) {
        info!("peer {:?} left", peer_id);
        let previous = self.sessions.write().await
            .remove(peer_id);

        match previous {
            Some(entry) => entry.close().await,
            None => debug!("unknown peer {:?} left", peer_id),
        }

        self.events.send_event(PeerEvent::PeerLeft(PeerLeftData { peer_id: peer_id.clone() }));
    }

    pub async fn on_signal(&self, sender: PeerId, payload: SignalPayload) -> anyhow::Result<()> {
        let transport = {
            let mut sessions = self.sessions.write().await;
            let existing = sessions.get(&sender)
                .filter(|e| e.handle.is_alive())
                .map(|e| e.transport.clone());
            match existing {
                Some(transport) => transport,
                None => {
                    if !self.config.direct_channel_capable {
                        warn!("ignoring signal from {:?}: direct channels are disabled", sender);
                        return Ok(());
                    }
                    let identity = sessions.get(&sender).and_then(|e| e.identity.clone());
                    let entry = self.create_session(&sender, TransportKind::DirectCallee, identity).await?;
                    let transport = entry.transport.clone();
                    if let Some(previous) = sessions.insert(sender.clone(), entry) {
                        previous.close().await;
                    }
                    transport
                }
            }
        };

        transport.on_signal(payload).await
    }

    pub async fn on_relayed_frame(&self, sender: PeerId, frame: Frame) -> anyhow::Result<()> {
        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.get(&sender) {
            if entry.handle.send(SessionInput::Frame(frame.clone())) {
                return Ok(());
            }
        }

        let identity = sessions.get(&sender).and_then(|e| e.identity.clone());
        let entry = self.create_session(&sender, TransportKind::Relayed, identity).await?;
        entry.handle.send(SessionInput::Frame(frame));
        if let Some(previous) = sessions.insert(sender, entry) {
            previous.close().await;
        }
        Ok(())
    }

    pub async fn send_command(&self, peer_id: &PeerId, command: PeerCommand) -> anyhow::Result<()> {
        let sessions = self.sessions.read().await;
        let entry = sessions.get(peer_id)
            .ok_or_else(|| anyhow!("unknown peer {:?}", peer_id))?;
        entry.handle.command(command)
    }

    /// re-establish every transport, e.g. after the host resumed
    pub async fn refresh_all(&self) {
        for entry in self.sessions.read().await.values() {
            entry.transport.refresh().await;
        }
    }

    pub async fn shut_down(&self) {
        let sessions = std::mem::take(&mut *self.sessions.write().await);
        for entry in sessions.values() {
            entry.close().await;
        }
    }

    pub async fn peer_ids(&self) -> Vec<PeerId> {
        let mut result = self.sessions.read().await
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        result.sort();
        result
    }

    pub async fn identity(&self, peer_id: &PeerId) -> Option<PeerIdentity> {
        self.sessions.read().await
            .get(peer_id)
            .and_then(|e| e.identity.clone())
    }

    pub fn connected_peer(&self) -> Option<PeerId> {
        self.connected_slot.holder()
    }
}
