//! Transports carry session frames between two peers. A session does not care which transport
//!  it talks through, it only sees the [Transport] trait.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::PeerConfig;
use crate::protocol::{PeerFrame, PeerId, SignalPayload};
use crate::server_connection::ServerSender;

pub mod direct;
pub mod relayed;

#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Control(PeerFrame),
    Chunk(Bytes),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// the transport is (again) able to carry frames
    Opened,
    /// the transport lost its connection, it may recover by itself
    Closed,
    /// the transport gave up, the session has to be recreated
    Failed,
}

/// Receives everything a transport gets from the remote peer.
pub trait FrameHandler: Send + Sync + 'static {
    fn on_frame(&self, frame: Frame);
    fn on_transport_event(&self, event: TransportEvent);
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, frame: Frame) -> anyhow::Result<()>;

    fn is_ready(&self) -> bool;

    /// re-establish the underlying connection if it is gone, no-op otherwise
    async fn refresh(&self);

    async fn on_signal(&self, payload: SignalPayload) -> anyhow::Result<()>;

    async fn close(&self);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
    /// direct channel, this side creates the channel and the offer
    DirectCaller,
    /// direct channel, this side waits for the remote offer
    DirectCallee,
    Relayed,
}
impl TransportKind {
    pub fn direct(is_caller: bool) -> TransportKind {
        if is_caller {
            TransportKind::DirectCaller
        }
        else {
            TransportKind::DirectCallee
        }
    }

    pub fn is_direct(&self) -> bool {
        *self != TransportKind::Relayed
    }
}

#[async_trait]
pub trait TransportFactory: Send + Sync + 'static {
    async fn create(&self, peer_id: &PeerId, kind: TransportKind, handler: Arc<dyn FrameHandler>) -> anyhow::Result<Arc<dyn Transport>>;
}

pub struct DefaultTransportFactory {
    config: Arc<PeerConfig>,
    server: Arc<dyn ServerSender>,
}
impl DefaultTransportFactory {
    pub fn new(config: Arc<PeerConfig>, server: Arc<dyn ServerSender>) -> DefaultTransportFactory {
        DefaultTransportFactory {
            config,
            server,
        }
    }
}

#[async_trait]
impl TransportFactory for DefaultTransportFactory {
    async fn create(&self, peer_id: &PeerId, kind: TransportKind, handler: Arc<dyn FrameHandler>) -> anyhow::Result<Arc<dyn Transport>> {
        match kind {
            TransportKind::Relayed => {
                Ok(Arc::new(relayed::RelayedChannel::new(peer_id.clone(), self.server.clone(), handler)))
            }
            TransportKind::DirectCaller | TransportKind::DirectCallee => {
                let channel = direct::DirectChannel::new(
                    peer_id.clone(),
                    kind == TransportKind::DirectCaller,
                    self.config.clone(),
                    self.server.clone(),
                    handler,
                )?;
                Ok(channel)
            }
        }
    }
}
