use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio::{select, time};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::{COOKIE, SET_COOKIE, USER_AGENT};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, info, trace, warn};

use crate::config::RendezvousConfig;
use crate::protocol::{PeerId, PeerIdentity, ServerMessage};
use crate::rendezvous::identity::{device_label, display_name, peer_id_from_cookie, room_key, set_cookie_header, RoomKey};
use crate::rendezvous::rooms::{Member, Rooms};

const FORWARDED_FOR: &str = "x-forwarded-for";

/// What the server takes from a client's websocket upgrade request.
#[derive(Clone, Debug)]
pub struct Handshake {
    pub peer_id: PeerId,
    /// the id was generated for this connection and must be returned as a cookie
    pub is_new_id: bool,
    pub rtc_supported: bool,
    pub user_agent: String,
    pub forwarded_for: Option<String>,
}

impl Handshake {
    pub fn from_request(request: &Request) -> Handshake {
        let cookie_id = header(request, COOKIE.as_str()).and_then(peer_id_from_cookie);
        let is_new_id = cookie_id.is_none();

        Handshake {
            peer_id: cookie_id.unwrap_or_else(PeerId::random),
            is_new_id,
            rtc_supported: request.uri().path().contains("webrtc"),
            user_agent: header(request, USER_AGENT.as_str()).unwrap_or_default().to_string(),
            forwarded_for: header(request, FORWARDED_FOR).map(str::to_string),
        }
    }
}

fn header<'a>(request: &'a Request, name: &str) -> Option<&'a str> {
    request.headers().get(name)
        .and_then(|v| v.to_str().ok())
}

enum Departure {
    Disconnected,
    Closed,
    Evicted,
    Replaced,
}

pub struct RendezvousServer {
    config: Arc<RendezvousConfig>,
    rooms: Mutex<Rooms>,
    next_connection_id: AtomicU64,
}

impl RendezvousServer {
    pub fn new(config: RendezvousConfig) -> Arc<RendezvousServer> {
        Arc::new(RendezvousServer {
            config: Arc::new(config),
            rooms: Mutex::new(Rooms::new()),
            next_connection_id: AtomicU64::new(1),
        })
    }

    pub async fn bind(&self) -> anyhow::Result<TcpListener> {
        let listener = TcpListener::bind(self.config.bind_addr).await
            .with_context(|| format!("binding to {}", self.config.bind_addr))?;
        info!("rendezvous server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accepts connections until an error occurs, each connection is served by its own task.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            let (stream, remote) = listener.accept().await?;
            debug!("accepted TCP connection from {}", remote);
            tokio::spawn(self.clone().on_tcp_connection(stream, remote));
        }
    }

    async fn on_tcp_connection(self: Arc<Self>, stream: TcpStream, remote: SocketAddr) {
        let mut handshake = None;
        let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
            let parsed = Handshake::from_request(request);
            if parsed.is_new_id {
                match HeaderValue::from_str(&set_cookie_header(&parsed.peer_id)) {
                    Ok(value) => { response.headers_mut().append(SET_COOKIE, value); }
                    Err(e) => warn!("invalid cookie value for {:?}: {}", parsed.peer_id, e),
                }
            }
            handshake = Some(parsed);
            Ok(response)
        };

        let ws = match accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!("websocket handshake with {} failed: {}", remote, e);
                return;
            }
        };

        match handshake {
            Some(handshake) => self.serve_peer(ws, handshake, remote.ip()).await,
            None => warn!("no handshake data for connection from {}", remote),
        }
    }

    /// Serves one client connection: joins its room, runs the heartbeat, relays its messages,
    ///  and removes it from the room when the connection ends for whatever reason.
    #[tracing::instrument(skip(self, ws, handshake, remote), fields(peer = %handshake.peer_id))]
    pub async fn serve_peer<S>(&self, ws: WebSocketStream<S>, handshake: Handshake, remote: IpAddr)
    where S: AsyncRead + AsyncWrite + Unpin
    {
        let key = room_key(handshake.forwarded_for.as_deref(), remote, self.config.trust_forwarded_for);
        let identity = PeerIdentity {
            id: handshake.peer_id.clone(),
            display_name: display_name(&handshake.peer_id),
            device_label: device_label(&handshake.user_agent),
            rtc_supported: handshake.rtc_supported,
        };
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::SeqCst);
        info!("{} ({}, {}) connected from room {:?}", identity.display_name, identity.device_label, if identity.rtc_supported { "webrtc" } else { "fallback" }, key);

        let (outbound, outbound_recv) = mpsc::unbounded_channel();
        self.rooms.lock().await
            .join(&key, Member {
                identity: identity.clone(),
                connection_id,
                outbound: outbound.clone(),
            });

        // dropping our sender afterwards lets the connection notice when the room drops it
        let own_name = ServerMessage::DisplayName { peer: identity.clone() };
        let departure = match own_name.to_text() {
            Ok(text) => {
                let _ = outbound.send(text);
                drop(outbound);
                self.connection_loop(ws, &key, &identity.id, outbound_recv).await
            }
            Err(e) => Err(e),
        };

        match departure {
            Ok(Departure::Disconnected) => info!("{} disconnected", identity.display_name),
            Ok(Departure::Closed) => info!("connection to {} closed", identity.display_name),
            Ok(Departure::Evicted) => info!("{} stopped answering heartbeats - evicted", identity.display_name),
            Ok(Departure::Replaced) => debug!("{} reconnected, closing the previous connection", identity.display_name),
            Err(e) => info!("connection to {} failed: {}", identity.display_name, e),
        }

        self.rooms.lock().await
            .leave(&key, &identity.id, connection_id);
    }

    async fn connection_loop<S>(&self, ws: WebSocketStream<S>, key: &RoomKey, peer_id: &PeerId, mut outbound: mpsc::UnboundedReceiver<String>) -> anyhow::Result<Departure>
    where S: AsyncRead + AsyncWrite + Unpin
    {
        let (mut sink, mut stream) = ws.split();
        let interval = self.config.heartbeat_interval;
        let ping = ServerMessage::Ping.to_text()?;

        let mut heartbeat = time::interval(interval);
        let mut last_beat = Instant::now();

        let departure = loop {
            select! {
                _ = heartbeat.tick() => {
                    if last_beat.elapsed() >= interval * 2 {
                        break Departure::Evicted;
                    }
                    trace!("heartbeat");
                    sink.send(Message::Text(ping.clone())).await?;
                }
                msg = stream.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            match self.on_client_message(key, peer_id, &text).await {
                                ClientAction::Pong => last_beat = Instant::now(),
                                ClientAction::Disconnect => break Departure::Disconnected,
                                ClientAction::None => {}
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break Departure::Closed,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                    }
                }
                text = outbound.recv() => {
                    match text {
                        Some(text) => sink.send(Message::Text(text)).await?,
                        None => break Departure::Replaced,
                    }
                }
            }
        };

        sink.close().await.ok();
        Ok(departure)
    }

    async fn on_client_message(&self, key: &RoomKey, peer_id: &PeerId, text: &str) -> ClientAction {
        let message: Value = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                debug!("dropping malformed message: {}", e);
                return ClientAction::None;
            }
        };

        match message.get("type").and_then(Value::as_str) {
            Some("pong") => ClientAction::Pong,
            Some("disconnect") => ClientAction::Disconnect,
            _ => {
                self.rooms.lock().await
                    .relay(key, peer_id, message);
                ClientAction::None
            }
        }
    }
}

enum ClientAction {
    Pong,
    Disconnect,
    None,
}
