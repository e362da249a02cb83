use std::sync::Arc;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde_json::{json, Value};
use tracing::{debug, trace};

use crate::protocol::{PeerFrame, PeerId, SignalPayload};
use crate::server_connection::ServerSender;
use crate::transport::{Frame, FrameHandler, Transport, TransportEvent};

const BINARY_TYPE: &str = "binary";

/// Sends frames through the rendezvous server: every frame is addressed to the remote peer with
///  a `to` field, and the server forwards it with a `sender` field instead.
pub struct RelayedChannel {
    peer_id: PeerId,
    server: Arc<dyn ServerSender>,
    handler: Arc<dyn FrameHandler>,
}

impl RelayedChannel {
    pub fn new(peer_id: PeerId, server: Arc<dyn ServerSender>, handler: Arc<dyn FrameHandler>) -> RelayedChannel {
        RelayedChannel {
            peer_id,
            server,
            handler,
        }
    }
}

#[async_trait]
impl Transport for RelayedChannel {
    async fn send(&self, frame: Frame) -> anyhow::Result<()> {
        let text = wrap_for_relay(&self.peer_id, &frame)?;
        trace!(to = ?self.peer_id, "sending relayed frame");
        self.server.send(text)
    }

    fn is_ready(&self) -> bool {
        self.server.is_connected()
    }

    async fn refresh(&self) {
        if self.server.is_connected() {
            self.handler.on_transport_event(TransportEvent::Opened);
        }
    }

    async fn on_signal(&self, _payload: SignalPayload) -> anyhow::Result<()> {
        debug!("received a signal for relayed peer {:?} - ignoring", self.peer_id);
        Ok(())
    }

    async fn close(&self) {
        trace!("closing relayed channel to {:?}", self.peer_id);
    }
}

pub fn wrap_for_relay(to: &PeerId, frame: &Frame) -> anyhow::Result<String> {
    let mut value = match frame {
        Frame::Control(frame) => frame.to_value()?,
        Frame::Chunk(data) => json!({
            "type": BINARY_TYPE,
            "data": STANDARD.encode(data),
        }),
    };

    value.as_object_mut()
        .ok_or_else(|| anyhow!("frame is not a JSON object"))?
        .insert("to".to_string(), json!(to));

    Ok(serde_json::to_string(&value)?)
}

/// Extracts sender and frame from a message forwarded by the rendezvous server.
pub fn unwrap_relayed(value: Value) -> anyhow::Result<(PeerId, Frame)> {
    let mut value = value;
    let obj = match value.as_object_mut() {
        Some(obj) => obj,
        None => bail!("relayed message is not a JSON object"),
    };

    let sender = match obj.remove("sender") {
        Some(Value::String(sender)) => PeerId::new(sender),
        _ => bail!("relayed message without sender"),
    };

    if obj.get("type").and_then(Value::as_str) == Some(BINARY_TYPE) {
        let data = obj.get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("binary frame without data"))?;
        let data = STANDARD.decode(data)?;
        return Ok((sender, Frame::Chunk(Bytes::from(data))));
    }

    let frame: PeerFrame = serde_json::from_value(value)?;
    Ok((sender, Frame::Control(frame)))
}
