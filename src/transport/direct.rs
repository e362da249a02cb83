use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, trace, warn};
use webrtc::api::API;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::config::PeerConfig;
use crate::protocol::{ClientMessage, PeerFrame, PeerId, SignalPayload};
use crate::server_connection::ServerSender;
use crate::transport::{Frame, FrameHandler, Transport, TransportEvent};

const DATA_CHANNEL_LABEL: &str = "data-channel";

/// A WebRTC data channel to the remote peer, negotiated by exchanging signals through the
///  rendezvous server.
///
/// The caller side creates the data channel and the offer, and it re-negotiates as soon as the
///  channel is lost. The callee side answers offers and otherwise waits. All negotiation happens
///  in a single driver task, WebRTC callbacks only post commands to it.
pub struct DirectChannel {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<DirectCommand>,
}

struct Shared {
    peer_id: PeerId,
    is_caller: bool,
    config: Arc<PeerConfig>,
    server: Arc<dyn ServerSender>,
    handler: Arc<dyn FrameHandler>,
    api: API,
    data_channel: RwLock<Option<Arc<RTCDataChannel>>>,
    is_open: AtomicBool,
}

enum DirectCommand {
    Connect,
    Signal(SignalPayload),
    ChannelReady(u64, Arc<RTCDataChannel>),
    Opened(u64),
    Lost(u64),
    Close,
}

impl DirectChannel {
    pub fn new(peer_id: PeerId, is_caller: bool, config: Arc<PeerConfig>, server: Arc<dyn ServerSender>, handler: Arc<dyn FrameHandler>) -> anyhow::Result<Arc<DirectChannel>> {
        let mut media_engine = MediaEngine::default();
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let shared = Arc::new(Shared {
            peer_id,
            is_caller,
            config,
            server,
            handler,
            api,
            data_channel: Default::default(),
            is_open: AtomicBool::new(false),
        });

        let (commands, receiver) = mpsc::unbounded_channel();
        if is_caller {
            let _ = commands.send(DirectCommand::Connect);
        }

        tokio::spawn(run_negotiation(shared.clone(), commands.clone(), receiver));

        Ok(Arc::new(DirectChannel {
            shared,
            commands,
        }))
    }

    fn post(&self, command: DirectCommand) {
        if self.commands.send(command).is_err() {
            debug!("direct channel to {:?} was closed", self.shared.peer_id);
        }
    }
}

#[async_trait]
impl Transport for DirectChannel {
    async fn send(&self, frame: Frame) -> anyhow::Result<()> {
        let data_channel = self.shared.data_channel.read().await.clone();
        match data_channel {
            Some(dc) if dc.ready_state() == RTCDataChannelState::Open => {
                match frame {
                    Frame::Control(frame) => { dc.send_text(frame.to_text()?).await?; }
                    Frame::Chunk(data) => { dc.send(&data).await?; }
                }
                Ok(())
            }
            _ => {
                self.refresh().await;
                bail!("direct channel to {:?} is not open", self.shared.peer_id)
            }
        }
    }

    fn is_ready(&self) -> bool {
        self.shared.is_open.load(Ordering::Acquire)
    }

    async fn refresh(&self) {
        if !self.is_ready() {
            self.post(DirectCommand::Connect);
        }
    }

    async fn on_signal(&self, payload: SignalPayload) -> anyhow::Result<()> {
        self.commands.send(DirectCommand::Signal(payload))
            .map_err(|_| anyhow!("direct channel to {:?} was closed", self.shared.peer_id))
    }

    async fn close(&self) {
        self.post(DirectCommand::Close);
    }
}


#[derive(Debug, PartialEq, Eq)]
enum Attempt {
    Connect,
    GiveUp,
    Wait,
}

/// Decides when to (re-)negotiate. Every peer connection gets a new generation, and callbacks
///  of a connection that was torn down carry an outdated one.
#[derive(Debug)]
struct RetryPolicy {
    is_caller: bool,
    max_retries: u32,
    generation: u64,
    /// negotiations since the channel was last open
    failed_attempts: u32,
    gave_up: bool,
}

impl RetryPolicy {
    fn new(is_caller: bool, max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            is_caller,
            max_retries,
            generation: 0,
            failed_attempts: 0,
            gave_up: false,
        }
    }

    fn generation(&self) -> u64 {
        self.generation
    }

    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    fn is_current(&self, generation: u64) -> bool {
        generation == self.generation
    }

    /// only the calling side connects, and only while it has no peer connection
    fn on_connect_requested(&mut self, has_connection: bool) -> Attempt {
        if !self.is_caller || has_connection {
            return Attempt::Wait;
        }
        self.attempt()
    }

    /// the caller starts over, the callee waits for the next offer
    fn on_lost(&mut self) -> Attempt {
        if self.is_caller {
            self.attempt()
        }
        else {
            Attempt::Wait
        }
    }

    fn on_opened(&mut self) {
        self.failed_attempts = 0;
    }

    fn attempt(&mut self) -> Attempt {
        if self.gave_up {
            return Attempt::Wait;
        }

        self.failed_attempts += 1;
        if self.failed_attempts > self.max_retries {
            self.gave_up = true;
            Attempt::GiveUp
        }
        else {
            Attempt::Connect
        }
    }
}

/// state owned by the driver task
struct Negotiation {
    retries: RetryPolicy,
    peer_connection: Option<Arc<RTCPeerConnection>>,
    pending_candidates: Vec<RTCIceCandidateInit>,
}

async fn run_negotiation(shared: Arc<Shared>, commands: mpsc::UnboundedSender<DirectCommand>, mut receiver: mpsc::UnboundedReceiver<DirectCommand>) {
    let mut negotiation = Negotiation::new(&shared);

    while let Some(command) = receiver.recv().await {
        match command {
            DirectCommand::Connect => {
                let attempt = negotiation.retries.on_connect_requested(negotiation.peer_connection.is_some());
                negotiation.apply(attempt, &shared, &commands).await;
            }
            DirectCommand::Signal(payload) => {
                if let Err(e) = negotiation.on_signal(&shared, &commands, payload).await {
                    warn!("error processing signal from {:?}: {}", shared.peer_id, e);
                }
            }
            DirectCommand::ChannelReady(generation, dc) => {
                if negotiation.retries.is_current(generation) {
                    *shared.data_channel.write().await = Some(dc);
                }
            }
            DirectCommand::Opened(generation) => {
                if negotiation.retries.is_current(generation) {
                    info!("direct channel to {:?} is open", shared.peer_id);
                    negotiation.retries.on_opened();
                    shared.is_open.store(true, Ordering::Release);
                    shared.handler.on_transport_event(TransportEvent::Opened);
                }
            }
            DirectCommand::Lost(generation) => {
                if negotiation.retries.is_current(generation) && negotiation.peer_connection.is_some() {
                    debug!("direct channel to {:?} was lost", shared.peer_id);
                    negotiation.tear_down(&shared).await;
                    shared.handler.on_transport_event(TransportEvent::Closed);

                    let attempt = negotiation.retries.on_lost();
                    negotiation.apply(attempt, &shared, &commands).await;
                }
            }
            DirectCommand::Close => {
                negotiation.tear_down(&shared).await;
                break;
            }
        }
    }
    debug!("direct channel driver for {:?} terminated", shared.peer_id);
}

impl Negotiation {
    fn new(shared: &Shared) -> Negotiation {
        Negotiation {
            retries: RetryPolicy::new(shared.is_caller, shared.config.max_direct_channel_retries),
            peer_connection: None,
            pending_candidates: Vec::new(),
        }
    }

    async fn apply(&mut self, attempt: Attempt, shared: &Arc<Shared>, commands: &mpsc::UnboundedSender<DirectCommand>) {
        match attempt {
            Attempt::Connect => {
                if let Err(e) = self.try_connect(shared, commands).await {
                    warn!("error negotiating direct channel to {:?}: {}", shared.peer_id, e);
                    self.tear_down(shared).await;
                }
            }
            Attempt::GiveUp => {
                warn!("giving up on direct channel to {:?} after {} attempts", shared.peer_id, self.retries.max_retries);
                shared.handler.on_transport_event(TransportEvent::Failed);
            }
            Attempt::Wait => {}
        }
    }

    async fn try_connect(&mut self, shared: &Arc<Shared>, commands: &mpsc::UnboundedSender<DirectCommand>) -> anyhow::Result<()> {
        debug!("opening direct channel to {:?}", shared.peer_id);
        let pc = self.new_peer_connection(shared, commands).await?;

        let dc = pc.create_data_channel(DATA_CHANNEL_LABEL, Some(RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        })).await?;
        *shared.data_channel.write().await = Some(dc.clone());
        attach_data_channel(shared, &dc, self.retries.generation(), commands);

        let offer = pc.create_offer(None).await?;
        pc.set_local_description(offer).await?;
        send_local_description(shared, &pc).await
    }

    async fn new_peer_connection(&mut self, shared: &Arc<Shared>, commands: &mpsc::UnboundedSender<DirectCommand>) -> anyhow::Result<Arc<RTCPeerConnection>> {
        let generation = self.retries.next_generation();

        let ice_servers = if shared.config.ice_servers.is_empty() {
            Vec::new()
        }
        else {
            vec![RTCIceServer {
                urls: shared.config.ice_servers.clone(),
                ..Default::default()
            }]
        };

        let pc = Arc::new(shared.api.new_peer_connection(RTCConfiguration {
            ice_servers,
            ..Default::default()
        }).await?);

        let ice_shared = shared.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let shared = ice_shared.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => match serde_json::to_value(init) {
                            Ok(ice) => send_signal(&shared, SignalPayload { sdp: None, ice: Some(ice) }),
                            Err(e) => warn!("error serializing ICE candidate: {}", e),
                        }
                        Err(e) => warn!("error serializing ICE candidate: {}", e),
                    }
                }
            })
        }));

        let state_commands = commands.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let commands = state_commands.clone();
            Box::pin(async move {
                match state {
                    RTCPeerConnectionState::Failed
                    | RTCPeerConnectionState::Disconnected
                    | RTCPeerConnectionState::Closed => {
                        let _ = commands.send(DirectCommand::Lost(generation));
                    }
                    _ => {}
                }
            })
        }));

        if !shared.is_caller {
            let channel_shared = shared.clone();
            let channel_commands = commands.clone();
            pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let shared = channel_shared.clone();
                let commands = channel_commands.clone();
                Box::pin(async move {
                    let _ = commands.send(DirectCommand::ChannelReady(generation, dc.clone()));
                    attach_data_channel(&shared, &dc, generation, &commands);
                })
            }));
        }

        self.peer_connection = Some(pc.clone());
        Ok(pc)
    }

    async fn on_signal(&mut self, shared: &Arc<Shared>, commands: &mpsc::UnboundedSender<DirectCommand>, payload: SignalPayload) -> anyhow::Result<()> {
        if let Some(sdp) = payload.sdp {
            let description: RTCSessionDescription = serde_json::from_value(sdp)?;
            let is_offer = description.sdp_type == RTCSdpType::Offer;

            if is_offer && shared.is_caller {
                bail!("received an offer on the calling side");
            }

            if is_offer && self.peer_connection.is_some() {
                // the caller started over
                let was_open = shared.is_open.load(Ordering::Acquire);
                self.tear_down(shared).await;
                if was_open {
                    shared.handler.on_transport_event(TransportEvent::Closed);
                }
            }

            let pc = match &self.peer_connection {
                Some(pc) => pc.clone(),
                None if is_offer => self.new_peer_connection(shared, commands).await?,
                None => bail!("received an answer without a pending offer"),
            };

            pc.set_remote_description(description).await?;
            if is_offer {
                let answer = pc.create_answer(None).await?;
                pc.set_local_description(answer).await?;
                send_local_description(shared, &pc).await?;
            }

            for candidate in std::mem::take(&mut self.pending_candidates) {
                pc.add_ice_candidate(candidate).await?;
            }
        }

        if let Some(ice) = payload.ice {
            let candidate: RTCIceCandidateInit = serde_json::from_value(ice)?;
            match &self.peer_connection {
                Some(pc) if pc.remote_description().await.is_some() => {
                    pc.add_ice_candidate(candidate).await?;
                }
                _ => {
                    trace!("buffering ICE candidate until the remote description is known");
                    self.pending_candidates.push(candidate);
                }
            }
        }
        Ok(())
    }

    async fn tear_down(&mut self, shared: &Shared) {
        shared.is_open.store(false, Ordering::Release);
        *shared.data_channel.write().await = None;
        self.pending_candidates.clear();

        // invalidate callbacks of the old connection
        self.retries.next_generation();

        if let Some(pc) = self.peer_connection.take() {
            if let Err(e) = pc.close().await {
                debug!("error closing peer connection to {:?}: {}", shared.peer_id, e);
            }
        }
    }
}

fn attach_data_channel(shared: &Arc<Shared>, dc: &Arc<RTCDataChannel>, generation: u64, commands: &mpsc::UnboundedSender<DirectCommand>) {
    let open_commands = commands.clone();
    dc.on_open(Box::new(move || {
        let commands = open_commands.clone();
        Box::pin(async move {
            let _ = commands.send(DirectCommand::Opened(generation));
        })
    }));

    let close_commands = commands.clone();
    dc.on_close(Box::new(move || {
        let commands = close_commands.clone();
        Box::pin(async move {
            let _ = commands.send(DirectCommand::Lost(generation));
        })
    }));

    let handler = shared.handler.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let handler = handler.clone();
        Box::pin(async move {
            on_channel_message(handler.as_ref(), msg);
        })
    }));
}

fn on_channel_message(handler: &dyn FrameHandler, msg: DataChannelMessage) {
    if !msg.is_string {
        handler.on_frame(Frame::Chunk(msg.data));
        return;
    }

    let parsed = std::str::from_utf8(&msg.data)
        .map_err(anyhow::Error::from)
        .and_then(PeerFrame::from_text);
    match parsed {
        Ok(frame) => handler.on_frame(Frame::Control(frame)),
        Err(e) => warn!("dropping malformed frame on direct channel: {}", e),
    }
}

async fn send_local_description(shared: &Shared, pc: &RTCPeerConnection) -> anyhow::Result<()> {
    let description = pc.local_description().await
        .ok_or_else(|| anyhow!("no local description"))?;
    send_signal(shared, SignalPayload {
        sdp: Some(serde_json::to_value(description)?),
        ice: None,
    });
    Ok(())
}

fn send_signal(shared: &Shared, payload: SignalPayload) {
    let msg = ClientMessage::Signal {
        to: shared.peer_id.clone(),
        payload,
    };
    let result = msg.to_text()
        .and_then(|text| shared.server.send(text));
    if let Err(e) = result {
        debug!("could not send signal to {:?}: {}", shared.peer_id, e);
    }
}
