use std::sync::{Arc, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::time;

use crate::protocol::{PeerFrame, PeerId, SignalPayload};
use crate::server_connection::ServerSender;
use crate::transport::{Frame, FrameHandler, Transport, TransportEvent, TransportFactory, TransportKind};

const SENT_TIMEOUT: Duration = Duration::from_secs(5);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Records frames and transport events instead of processing them.
#[derive(Default)]
pub struct TrackingFrameHandler {
    frames: Mutex<Vec<Frame>>,
    transport_events: Mutex<Vec<TransportEvent>>,
}
impl TrackingFrameHandler {
    pub fn new() -> TrackingFrameHandler {
        Default::default()
    }

    pub fn frames(&self) -> Vec<Frame> {
        lock(&self.frames).clone()
    }

    pub fn transport_events(&self) -> Vec<TransportEvent> {
        lock(&self.transport_events).clone()
    }
}
impl FrameHandler for TrackingFrameHandler {
    fn on_frame(&self, frame: Frame) {
        lock(&self.frames).push(frame);
    }

    fn on_transport_event(&self, event: TransportEvent) {
        lock(&self.transport_events).push(event);
    }
}


/// A transport that records everything sent through it. Frames from the remote peer and status
///  changes are simulated with [TrackingTransport::deliver] and [TrackingTransport::emit].
pub struct TrackingTransport {
    peer_id: PeerId,
    kind: TransportKind,
    handler: Option<Arc<dyn FrameHandler>>,
    sent: Mutex<Vec<Frame>>,
    signals: Mutex<Vec<SignalPayload>>,
    ready: AtomicBool,
    refresh_count: AtomicUsize,
    closed: AtomicBool,
}

impl TrackingTransport {
    pub fn new(peer_id: PeerId, kind: TransportKind, handler: Option<Arc<dyn FrameHandler>>) -> TrackingTransport {
        TrackingTransport {
            peer_id,
            kind,
            handler,
            sent: Default::default(),
            signals: Default::default(),
            ready: AtomicBool::new(true),
            refresh_count: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// while not ready, every send fails
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn sent_frames(&self) -> Vec<Frame> {
        lock(&self.sent).clone()
    }

    pub fn take_sent(&self) -> Vec<Frame> {
        std::mem::take(&mut *lock(&self.sent))
    }

    pub fn sent_control_frames(&self) -> Vec<PeerFrame> {
        lock(&self.sent).iter()
            .filter_map(|f| match f {
                Frame::Control(frame) => Some(frame.clone()),
                Frame::Chunk(_) => None,
            })
            .collect()
    }

    pub fn signals(&self) -> Vec<SignalPayload> {
        lock(&self.signals).clone()
    }

    pub fn refresh_count(&self) -> usize {
        self.refresh_count.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// simulates a frame arriving from the remote peer
    pub fn deliver(&self, frame: Frame) {
        if let Some(handler) = &self.handler {
            handler.on_frame(frame);
        }
    }

    pub fn emit(&self, event: TransportEvent) {
        if let Some(handler) = &self.handler {
            handler.on_transport_event(event);
        }
    }

    /// waits until `expected` was sent, panicking if that does not happen in time
    pub async fn await_sent(&self, expected: PeerFrame) {
        let result = time::timeout(SENT_TIMEOUT, async {
            loop {
                if self.sent_control_frames().contains(&expected) {
                    return;
                }
                time::sleep(Duration::from_millis(5)).await;
            }
        }).await;

        if result.is_err() {
            panic!("{:?} was not sent to {:?}, sent frames: {:?}", expected, self.peer_id, self.sent_control_frames());
        }
    }
}

#[async_trait]
impl Transport for TrackingTransport {
    async fn send(&self, frame: Frame) -> anyhow::Result<()> {
        if !self.ready.load(Ordering::SeqCst) {
            self.refresh_count.fetch_add(1, Ordering::SeqCst);
            bail!("transport to {:?} is not ready", self.peer_id);
        }
        lock(&self.sent).push(frame);
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn refresh(&self) {
        self.refresh_count.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_signal(&self, payload: SignalPayload) -> anyhow::Result<()> {
        lock(&self.signals).push(payload);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}


/// Creates [TrackingTransport]s and remembers the most recent one per peer.
#[derive(Default)]
pub struct TrackingTransportFactory {
    transports: Mutex<FxHashMap<PeerId, Arc<TrackingTransport>>>,
    created: Mutex<Vec<(PeerId, TransportKind)>>,
}

impl TrackingTransportFactory {
    pub fn new() -> TrackingTransportFactory {
        Default::default()
    }

    pub fn transport(&self, peer_id: &PeerId) -> Option<Arc<TrackingTransport>> {
        lock(&self.transports).get(peer_id).cloned()
    }

    pub fn kind_of(&self, peer_id: &PeerId) -> Option<TransportKind> {
        self.transport(peer_id).map(|t| t.kind())
    }

    /// every transport ever created, in order
    pub fn created(&self) -> Vec<(PeerId, TransportKind)> {
        lock(&self.created).clone()
    }
}

#[async_trait]
impl TransportFactory for TrackingTransportFactory {
    async fn create(&self, peer_id: &PeerId, kind: TransportKind, handler: Arc<dyn FrameHandler>) -> anyhow::Result<Arc<dyn Transport>> {
        let transport = Arc::new(TrackingTransport::new(peer_id.clone(), kind, Some(handler)));
        lock(&self.transports).insert(peer_id.clone(), transport.clone());
        lock(&self.created).push((peer_id.clone(), kind));
        Ok(transport)
    }
}


/// Records messages for the rendezvous server.
pub struct TrackingServerSender {
    sent: Mutex<Vec<String>>,
    connected: AtomicBool,
}

impl Default for TrackingServerSender {
    fn default() -> Self {
        TrackingServerSender {
            sent: Default::default(),
            connected: AtomicBool::new(true),
        }
    }
}

impl TrackingServerSender {
    pub fn new() -> TrackingServerSender {
        Default::default()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn sent_texts(&self) -> Vec<String> {
        lock(&self.sent).clone()
    }

    /// sent messages parsed as JSON, messages that are no valid JSON are skipped
    pub fn sent_values(&self) -> Vec<Value> {
        lock(&self.sent).iter()
            .filter_map(|text| serde_json::from_str(text).ok())
            .collect()
    }
}

impl ServerSender for TrackingServerSender {
    fn send(&self, text: String) -> anyhow::Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            bail!("not connected to rendezvous server");
        }
        lock(&self.sent).push(text);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
