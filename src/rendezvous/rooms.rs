use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::protocol::{PeerId, PeerIdentity, ServerMessage};
use crate::rendezvous::identity::RoomKey;

/// A client connected to the rendezvous server. Messages for it are queued in `outbound` and
///  written to the websocket by its connection task.
pub struct Member {
    pub identity: PeerIdentity,
    /// distinguishes a reconnected client from its previous (stale) connection
    pub connection_id: u64,
    pub outbound: mpsc::UnboundedSender<String>,
}
impl Member {
    fn send(&self, message: &ServerMessage) {
        match message.to_text() {
            Ok(text) => self.send_text(text),
            Err(e) => warn!("could not serialize {:?}: {}", message, e),
        }
    }

    fn send_text(&self, text: String) {
        if self.outbound.send(text).is_err() {
            debug!("connection to {:?} is closed", self.identity.id);
        }
    }
}

/// All rooms of the rendezvous server. Empty rooms are removed.
#[derive(Default)]
pub struct Rooms {
    rooms: FxHashMap<RoomKey, FxHashMap<PeerId, Member>>,
}

impl Rooms {
    pub fn new() -> Rooms {
        Default::default()
    }

    /// Adds `member` to the room: all existing members are notified, and the new member gets the
    ///  roster of the others. A previous connection of the same peer is replaced.
    pub fn join(&mut self, key: &RoomKey, member: Member) {
        let room = self.rooms.entry(key.clone()).or_default();
        let peer_id = member.identity.id.clone();

        if room.remove(&peer_id).is_some() {
            debug!("{:?} reconnected to room {:?}, replacing its previous connection", peer_id, key);
        }

        let joined = ServerMessage::PeerJoined { peer: member.identity.clone() };
        for other in room.values() {
            other.send(&joined);
        }

        let mut peers = room.values()
            .map(|m| m.identity.clone())
            .collect::<Vec<_>>();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        member.send(&ServerMessage::Peers { peers });

        debug!("{:?} joined room {:?} with {} other members", peer_id, key, room.len());
        room.insert(peer_id, member);
    }

    /// Removes a peer's connection from its room. Returns `false` if that connection was no
    ///  longer a member, e.g. because it was replaced by a newer connection of the same peer.
    pub fn leave(&mut self, key: &RoomKey, peer_id: &PeerId, connection_id: u64) -> bool {
        let room = match self.rooms.get_mut(key) {
            Some(room) => room,
            None => return false,
        };
        match room.get(peer_id) {
            Some(member) if member.connection_id == connection_id => {}
            _ => return false,
        }
        room.remove(peer_id);

        if room.is_empty() {
            debug!("room {:?} is empty - removing it", key);
            self.rooms.remove(key);
        }
        else {
            let left = ServerMessage::PeerLeft { peer_id: peer_id.clone() };
            for other in room.values() {
                other.send(&left);
            }
        }
        true
    }

    /// Forwards a message to the peer named in its `to` field, replacing `to` with `sender`.
    ///  Returns `false` if the message was dropped.
    pub fn relay(&self, key: &RoomKey, sender: &PeerId, message: Value) -> bool {
        let mut message = match message {
            Value::Object(map) => map,
            _ => {
                debug!("dropping non-object message from {:?}", sender);
                return false;
            }
        };

        let recipient = match message.remove("to") {
            Some(Value::String(to)) => PeerId::new(to),
            _ => {
                debug!("dropping message without recipient from {:?}", sender);
                return false;
            }
        };

        let member = self.rooms.get(key)
            .and_then(|room| room.get(&recipient));
        let member = match member {
            Some(member) => member,
            None => {
                debug!("dropping message from {:?}: {:?} is not in room {:?}", sender, recipient, key);
                return false;
            }
        };

        message.insert("sender".to_string(), Value::String(sender.to_string()));
        trace!("relaying from {:?} to {:?}", sender, recipient);
        member.send_text(Value::Object(message).to_string());
        true
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn members(&self, key: &RoomKey) -> Vec<PeerId> {
        let mut result = self.rooms.get(key)
            .map(|room| room.keys().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        result.sort();
        result
    }
}
