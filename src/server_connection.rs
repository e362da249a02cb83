//! Client side of the rendezvous connection: keeps a websocket to the server open, answers its
//!  pings, and hands everything else to the peer registry.

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context};
use futures::{SinkExt, StreamExt};
#[cfg(test)] use mockall::automock;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::{select, time};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{COOKIE, SET_COOKIE};
use tokio_tungstenite::tungstenite::http::{HeaderMap, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};

use crate::config::PeerConfig;
use crate::events::{DisplayNameData, PeerEvent, PeerEventNotifier, ServerConnectivityData};
use crate::protocol::{ClientMessage, PeerId, ServerMessage};
use crate::registry::PeerRegistry;
use crate::rendezvous::identity::{cookie_header, peer_id_from_cookie};
use crate::transport::relayed::unwrap_relayed;

/// Sends text messages to the rendezvous server. Transports use this to relay signals and
///  frames.
#[cfg_attr(test, automock)]
pub trait ServerSender: Send + Sync + 'static {
    fn send(&self, text: String) -> anyhow::Result<()>;
    fn is_connected(&self) -> bool;
}

/// The sending half of the current websocket connection, if there is one.
#[derive(Default)]
pub struct ServerLink {
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
}
impl ServerLink {
    pub fn new() -> ServerLink {
        Default::default()
    }

    fn attach(&self, outbound: mpsc::UnboundedSender<String>) {
        *self.outbound.lock().unwrap_or_else(|e| e.into_inner()) = Some(outbound);
    }

    fn detach(&self) {
        *self.outbound.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

impl ServerSender for ServerLink {
    fn send(&self, text: String) -> anyhow::Result<()> {
        match self.outbound.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            Some(outbound) => outbound.send(text)
                .map_err(|_| anyhow!("connection to rendezvous server is closed")),
            None => bail!("not connected to rendezvous server"),
        }
    }

    fn is_connected(&self) -> bool {
        self.outbound.lock().unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|outbound| !outbound.is_closed())
            .unwrap_or(false)
    }
}


pub struct ServerConnection {
    config: Arc<PeerConfig>,
    link: Arc<ServerLink>,
    registry: Arc<PeerRegistry>,
    events: Arc<PeerEventNotifier>,
    suspended: watch::Sender<bool>,
    /// the id the server assigned on the first connection, sent back as a cookie on reconnect
    peer_id: Mutex<Option<PeerId>>,
}

impl ServerConnection {
    pub fn new(config: Arc<PeerConfig>, link: Arc<ServerLink>, registry: Arc<PeerRegistry>, events: Arc<PeerEventNotifier>) -> ServerConnection {
        let (suspended, _) = watch::channel(false);
        ServerConnection {
            config,
            link,
            registry,
            events,
            suspended,
            peer_id: Mutex::new(None),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    pub fn peer_id(&self) -> Option<PeerId> {
        self.peer_id.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// While suspended, the connection is closed (after telling the server) and not re-opened.
    ///  Resuming reconnects right away.
    pub fn set_suspended(&self, suspended: bool) {
        self.suspended.send_replace(suspended);
    }

    /// Keeps reconnecting until the process terminates.
    pub async fn run(&self) -> anyhow::Result<()> {
        let mut suspended = self.suspended.subscribe();

        loop {
            let is_suspended = *suspended.borrow_and_update();
            if is_suspended {
                debug!("suspended - not connecting to rendezvous server");
                if suspended.changed().await.is_err() {
                    return Ok(());
                }
                continue;
            }

            match self.connect_and_serve(&mut suspended).await {
                Ok(()) => info!("connection to rendezvous server closed"),
                Err(e) => warn!("rendezvous server connection error: {}", e),
            }
            self.link.detach();

            if *suspended.borrow() {
                continue;
            }

            self.events.send_event(PeerEvent::ServerConnectivity(ServerConnectivityData {
                connected: false,
                message: format!("Connection lost. Retry in {} seconds...", self.config.reconnect_delay.as_secs()),
            }));

            select! {
                _ = time::sleep(self.config.reconnect_delay) => {}
                _ = suspended.changed() => {}
            }
        }
    }

    async fn connect_and_serve(&self, suspended: &mut watch::Receiver<bool>) -> anyhow::Result<()> {
        let endpoint = self.config.endpoint();
        debug!("connecting to rendezvous server at {}", endpoint);
        let mut request = endpoint.as_str().into_client_request()?;
        if let Some(peer_id) = self.peer_id() {
            request.headers_mut().insert(COOKIE, HeaderValue::from_str(&cookie_header(&peer_id))?);
        }

        let (ws, response) = connect_async(request).await
            .with_context(|| format!("connecting to {}", endpoint))?;
        if let Some(peer_id) = assigned_peer_id(response.headers()) {
            debug!("rendezvous server assigned id {}", peer_id);
            *self.peer_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(peer_id);
        }
        let (mut sink, mut stream) = ws.split();

        let (outbound, mut outbound_recv) = mpsc::unbounded_channel();
        self.link.attach(outbound);

        info!("connected to rendezvous server at {}", endpoint);
        self.events.send_event(PeerEvent::ServerConnectivity(ServerConnectivityData {
            connected: true,
            message: "Connected".to_string(),
        }));

        loop {
            select! {
                msg = stream.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            dispatch_server_message(&text, self.registry.as_ref(), self.link.as_ref(), self.events.as_ref()).await;
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                    }
                }
                text = outbound_recv.recv() => {
                    if let Some(text) = text {
                        sink.send(Message::Text(text)).await?;
                    }
                }
                changed = suspended.changed() => {
                    if changed.is_err() || *suspended.borrow() {
                        debug!("leaving rendezvous server");
                        sink.send(Message::Text(ClientMessage::Disconnect.to_text()?)).await.ok();
                        sink.close().await.ok();
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// the id from a `Set-Cookie` header of the server's handshake response, if there is one
fn assigned_peer_id(headers: &HeaderMap) -> Option<PeerId> {
    headers.get_all(SET_COOKIE).iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(peer_id_from_cookie)
}

pub async fn dispatch_server_message(text: &str, registry: &PeerRegistry, link: &dyn ServerSender, events: &PeerEventNotifier) {
    if let Err(e) = try_dispatch_server_message(text, registry, link, events).await {
        warn!("dropping message from rendezvous server: {}", e);
    }
}

async fn try_dispatch_server_message(text: &str, registry: &PeerRegistry, link: &dyn ServerSender, events: &PeerEventNotifier) -> anyhow::Result<()> {
    trace!("received from rendezvous server: {}", text);
    let value: Value = serde_json::from_str(text)?;

    let msg_type = value.get("type")
        .and_then(Value::as_str)
        .unwrap_or_default();

    if !ServerMessage::is_server_message_type(msg_type) {
        let (sender, frame) = unwrap_relayed(value)?;
        return registry.on_relayed_frame(sender, frame).await;
    }

    match serde_json::from_value::<ServerMessage>(value)? {
        ServerMessage::Peers { peers } => registry.on_peers(peers).await,
        ServerMessage::PeerJoined { peer } => registry.on_peer_joined(peer).await,
        ServerMessage::PeerLeft { peer_id } => {
            registry.on_peer_left(&peer_id).await;
            Ok(())
        }
        ServerMessage::Ping => link.send(ClientMessage::Pong.to_text()?),
        ServerMessage::DisplayName { peer } => {
            events.send_event(PeerEvent::DisplayName(DisplayNameData { identity: peer }));
            Ok(())
        }
        ServerMessage::Signal { sender, payload } => registry.on_signal(sender, payload).await,
    }
}


#[cfg(test)]
mod tests {
    use serde_json::json;
    use crate::events::PeerEvent;
    use crate::protocol::{PeerId, SignalPayload};
    use crate::test_util::event::await_event;
    use crate::test_util::registry::RegistryFixture;
    use crate::transport::TransportKind;
    use super::*;

    #[test]
    fn test_assigned_peer_id() {
        let mut headers = HeaderMap::new();
        assert_eq!(assigned_peer_id(&headers), None);

        headers.append(SET_COOKIE, HeaderValue::from_static("theme=dark"));
        headers.append(SET_COOKIE, HeaderValue::from_static("peerid=abc-123; SameSite=Strict; Secure"));
        assert_eq!(assigned_peer_id(&headers), Some(PeerId::new("abc-123")));
    }

    #[test]
    fn test_link_without_connection() {
        let link = ServerLink::new();
        assert!(!link.is_connected());
        assert!(link.send("x".to_string()).is_err());

        let (outbound, mut recv) = mpsc::unbounded_channel();
        link.attach(outbound);
        assert!(link.is_connected());
        link.send("hello".to_string()).unwrap();
        assert_eq!(recv.try_recv().unwrap(), "hello");

        drop(recv);
        assert!(!link.is_connected());

        link.detach();
        assert!(link.send("x".to_string()).is_err());
    }

    #[tokio::test]
    async fn test_ping_is_answered_with_pong() {
        let fixture = RegistryFixture::new(true);
        dispatch_server_message(r#"{"type":"ping"}"#, &fixture.registry, fixture.server.as_ref(), &fixture.events).await;
        assert_eq!(fixture.server.sent_values(), vec![json!({"type": "pong"})]);
    }

    #[tokio::test]
    async fn test_display_name() {
        let fixture = RegistryFixture::new(true);
        let mut events = fixture.events.subscribe();
        let msg = json!({"type": "display-name", "peer": {"id": "me", "displayName": "Blue Whale", "deviceLabel": "Linux", "rtcSupported": true}});
        dispatch_server_message(&msg.to_string(), &fixture.registry, fixture.server.as_ref(), &fixture.events).await;

        match events.try_recv().unwrap() {
            PeerEvent::DisplayName(data) => assert_eq!(data.identity.display_name, "Blue Whale"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_peers_signal_and_relayed_frames_reach_the_registry() {
        let fixture = RegistryFixture::new(true);

        let msg = json!({"type": "peers", "peers": [
            {"id": "a", "displayName": "A", "deviceLabel": "", "rtcSupported": true},
            {"id": "b", "displayName": "B", "deviceLabel": "", "rtcSupported": false},
        ]});
        dispatch_server_message(&msg.to_string(), &fixture.registry, fixture.server.as_ref(), &fixture.events).await;
        assert_eq!(fixture.transports.kind_of(&PeerId::new("a")), Some(TransportKind::DirectCaller));
        assert_eq!(fixture.transports.kind_of(&PeerId::new("b")), Some(TransportKind::Relayed));

        let msg = json!({"type": "signal", "sender": "a", "sdp": {"type": "answer", "sdp": "v=0"}});
        dispatch_server_message(&msg.to_string(), &fixture.registry, fixture.server.as_ref(), &fixture.events).await;
        assert_eq!(fixture.transports.transport(&PeerId::new("a")).unwrap().signals(), vec![
            SignalPayload { sdp: Some(json!({"type": "answer", "sdp": "v=0"})), ice: None },
        ]);

        // a relayed frame from an unknown sender creates a relayed session for it
        let mut events = fixture.events.subscribe();
        let msg = json!({"type": "peer-requested", "sender": "c"});
        dispatch_server_message(&msg.to_string(), &fixture.registry, fixture.server.as_ref(), &fixture.events).await;
        assert_eq!(fixture.transports.kind_of(&PeerId::new("c")), Some(TransportKind::Relayed));
        await_event(&mut events, |e| matches!(e, PeerEvent::ConnectionRequested(data) if data.peer_id == PeerId::new("c"))).await;
    }

    #[tokio::test]
    async fn test_malformed_messages_are_dropped() {
        let fixture = RegistryFixture::new(true);
        dispatch_server_message("not json", &fixture.registry, fixture.server.as_ref(), &fixture.events).await;
        dispatch_server_message(r#"{"type":"peer-left"}"#, &fixture.registry, fixture.server.as_ref(), &fixture.events).await;
        dispatch_server_message(r#"{"type":"header"}"#, &fixture.registry, fixture.server.as_ref(), &fixture.events).await;
        assert!(fixture.server.sent_values().is_empty());
        assert!(fixture.registry.peer_ids().await.is_empty());
    }
}
