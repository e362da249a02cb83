use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::Arc;

use anyhow::bail;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::PeerConfig;
use crate::events::{ConnectionRequestedData, FileReceivedData, PeerEvent, PeerEventNotifier, ProgressData, RequestDeclinedData, SessionStateChangedData, TextReceivedData, TransferCompletedData, TransferDirection, TransferFailedData, TransportStatusData};
use crate::protocol::{decode_text, FileHeader, PeerFrame, PeerId};
use crate::session::{ConnectedSlot, HandshakeDirection, PeerCommand, SessionHandle, SessionInput, SessionState};
use crate::transfer::{ChunkerEvent, FileChunker, FileDigester, OutgoingFile, ReceivedFile};
use crate::transport::{Frame, Transport, TransportEvent};

struct OutgoingTransfer {
    header: FileHeader,
    header_sent: bool,
    chunker: FileChunker,
    /// set while waiting for the receiver: for a partition acknowledgement, or for completion
    ack_deadline: Option<Instant>,
    ack_retries: u32,
}

#[derive(Default)]
struct TransferState {
    queue: VecDeque<OutgoingFile>,
    sending: Option<OutgoingTransfer>,

    digester: Option<FileDigester>,
    last_reported_progress: f64,
    last_published_progress: f64,
    last_acknowledged: u64,
    /// the sender ended the last partition of the received file, later ends are probes
    final_partition_seen: bool,
}

/// The state machine of a single peer session. It is driven by [super::run_session], one input at
///  a time.
pub struct SessionProtocol {
    peer_id: PeerId,
    myself: SessionHandle,
    config: Arc<PeerConfig>,
    transport: Arc<dyn Transport>,
    events: Arc<PeerEventNotifier>,
    connected_slot: Arc<ConnectedSlot>,

    state: SessionState,
    transfer: TransferState,
}

impl SessionProtocol {
    pub fn new(myself: SessionHandle, config: Arc<PeerConfig>, transport: Arc<dyn Transport>, events: Arc<PeerEventNotifier>, connected_slot: Arc<ConnectedSlot>) -> SessionProtocol {
        SessionProtocol {
            peer_id: myself.peer_id().clone(),
            myself,
            config,
            transport,
            events,
            connected_slot,
            state: SessionState::Idle,
            transfer: Default::default(),
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn ack_deadline(&self) -> Option<Instant> {
        self.transfer.sending.as_ref()
            .and_then(|s| s.ack_deadline)
    }

    /// returns `false` when the session should terminate
    pub async fn on_input(&mut self, input: SessionInput) -> bool {
        let result = match input {
            SessionInput::Frame(frame) => self.on_frame(frame).await,
            SessionInput::Command(command) => self.on_command(command).await,
            SessionInput::TransportEvent(event) => return self.on_transport_event(event).await,
            SessionInput::Evict(done) => {
                self.disconnect().await;
                let _ = done.send(());
                Ok(())
            }
            SessionInput::Close => return false,
        };

        if let Err(e) = result {
            warn!("session with {:?}: {}", self.peer_id, e);
        }
        true
    }

    pub async fn on_command(&mut self, command: PeerCommand) -> anyhow::Result<()> {
        trace!("command for {:?}: {:?}", self.peer_id, command);

        match command {
            PeerCommand::RequestConnection => {
                match self.state {
                    SessionState::Idle | SessionState::Disconnected => {
                        self.set_state(SessionState::HandshakePending(HandshakeDirection::Outgoing));
                        self.send_best_effort(PeerFrame::PeerRequested).await;
                    }
                    SessionState::HandshakePending(HandshakeDirection::Incoming) => {
                        self.enter_connected(true).await;
                    }
                    state => debug!("ignoring connection request to {:?} in state {:?}", self.peer_id, state),
                }
            }
            PeerCommand::CancelRequest => {
                if self.state == SessionState::HandshakePending(HandshakeDirection::Outgoing) {
                    self.send_best_effort(PeerFrame::PeerDisconnected).await;
                    self.set_state(SessionState::Idle);
                }
                else {
                    debug!("no pending request to {:?} to cancel", self.peer_id);
                }
            }
            PeerCommand::Accept => {
                if self.state != SessionState::HandshakePending(HandshakeDirection::Incoming) {
                    bail!("no pending connection request from {:?}", self.peer_id);
                }
                self.enter_connected(true).await;
            }
            PeerCommand::Decline => {
                if self.state != SessionState::HandshakePending(HandshakeDirection::Incoming) {
                    bail!("no pending connection request from {:?}", self.peer_id);
                }
                self.send_best_effort(PeerFrame::PeerDeclined).await;
                self.set_state(SessionState::Idle);
            }
            PeerCommand::Disconnect => {
                self.disconnect().await;
            }
            PeerCommand::SendFiles(files) => {
                self.transfer.queue.extend(files);
                self.start_next_file().await;
            }
            PeerCommand::SendText(text) => {
                if !self.state.is_connected() {
                    bail!("cannot send text to {:?}: not connected", self.peer_id);
                }
                self.transport.send(Frame::Control(PeerFrame::text(&text))).await?;
            }
        }
        Ok(())
    }

    pub async fn on_frame(&mut self, frame: Frame) -> anyhow::Result<()> {
        let frame = match frame {
            Frame::Chunk(data) => return self.on_chunk(&data).await,
            Frame::Control(frame) => frame,
        };
        trace!("frame from {:?}: {:?}", self.peer_id, frame);

        match frame {
            PeerFrame::PeerRequested => self.on_peer_requested().await,
            PeerFrame::PeerAccepted => {
                if self.state == SessionState::HandshakePending(HandshakeDirection::Outgoing) {
                    self.enter_connected(false).await;
                }
                else {
                    debug!("ignoring acceptance from {:?} in state {:?}", self.peer_id, self.state);
                }
            }
            PeerFrame::PeerDeclined => {
                if self.state == SessionState::HandshakePending(HandshakeDirection::Outgoing) {
                    self.set_state(SessionState::Idle);
                    self.events.send_event(PeerEvent::RequestDeclined(RequestDeclinedData { peer_id: self.peer_id.clone() }));
                }
            }
            PeerFrame::PeerDisconnected => self.on_peer_disconnected(),
            frame if !self.state.is_connected() => {
                bail!("dropping {:?} from {:?}: not connected", frame, self.peer_id);
            }
            PeerFrame::Header(header) => self.on_header(header).await,
            PeerFrame::Partition { offset } => self.on_partition(offset).await?,
            PeerFrame::PartitionReceived { offset } => self.on_partition_received(offset).await,
            PeerFrame::PartitionResend { offset } => self.on_partition_resend(offset).await,
            PeerFrame::Progress { progress } => {
                if self.transfer.sending.is_some() {
                    self.publish_progress(TransferDirection::Sending, progress.clamp(0.0, 1.0));
                }
            }
            PeerFrame::TransferComplete => self.on_transfer_complete().await,
            PeerFrame::Text { message } => {
                let text = decode_text(&message)?;
                self.events.send_event(PeerEvent::TextReceived(TextReceivedData {
                    peer_id: self.peer_id.clone(),
                    text,
                }));
            }
        }
        Ok(())
    }

    /// returns `false` if the transport gave up
    pub async fn on_transport_event(&mut self, event: TransportEvent) -> bool {
        debug!("transport to {:?}: {:?}", self.peer_id, event);
        self.events.send_event(PeerEvent::TransportStatus(TransportStatusData {
            peer_id: self.peer_id.clone(),
            event,
        }));

        match event {
            TransportEvent::Opened => {
                if self.ack_deadline().is_some() {
                    self.probe().await;
                }
                true
            }
            TransportEvent::Closed => true,
            TransportEvent::Failed => {
                self.abort_transfers("connection failed");
                self.connected_slot.release(&self.peer_id);
                self.set_state(SessionState::Disconnected);
                false
            }
        }
    }

    pub async fn on_ack_timeout(&mut self) {
        let max_retries = self.config.max_partition_retries;
        let exhausted = match self.transfer.sending.as_mut() {
            Some(sending) => {
                sending.ack_deadline = None;
                sending.ack_retries += 1;
                sending.ack_retries > max_retries
            }
            None => return,
        };

        if exhausted {
            self.fail_current("receiver stopped responding");
            self.start_next_file().await;
        }
        else {
            self.probe().await;
        }
    }

    pub async fn shut_down(&mut self) {
        self.abort_transfers("peer left");
        self.connected_slot.release(&self.peer_id);
    }

    async fn on_peer_requested(&mut self) {
        match self.state {
            SessionState::HandshakePending(HandshakeDirection::Outgoing) => {
                debug!("{:?} requested a connection while our request was pending - accepting", self.peer_id);
                self.enter_connected(true).await;
            }
            SessionState::HandshakePending(HandshakeDirection::Incoming) => {
                debug!("duplicate connection request from {:?}", self.peer_id);
            }
            state => {
                if state.is_connected() {
                    debug!("{:?} requested a new connection, dropping the current one", self.peer_id);
                    self.abort_transfers("peer reconnected");
                    self.connected_slot.release(&self.peer_id);
                }
                self.set_state(SessionState::HandshakePending(HandshakeDirection::Incoming));
                self.events.send_event(PeerEvent::ConnectionRequested(ConnectionRequestedData { peer_id: self.peer_id.clone() }));
            }
        }
    }

    fn on_peer_disconnected(&mut self) {
        match self.state {
            SessionState::Idle | SessionState::Disconnected => {}
            SessionState::HandshakePending(HandshakeDirection::Incoming) => {
                // the request was withdrawn
                self.set_state(SessionState::Idle);
            }
            _ => {
                self.abort_transfers("peer disconnected");
                self.connected_slot.release(&self.peer_id);
                self.set_state(SessionState::Disconnected);
            }
        }
    }

    /// At most one session is connected at any time: a previously connected session is
    ///  disconnected before this one transitions.
    async fn enter_connected(&mut self, send_accept: bool) {
        self.connected_slot.claim(self.myself.clone(), self.config.eviction_timeout).await;
        if send_accept {
            self.send_best_effort(PeerFrame::PeerAccepted).await;
        }
        self.set_state(SessionState::Connected);
        self.start_next_file().await;
    }

    async fn disconnect(&mut self) {
        if self.state != SessionState::Disconnected {
            self.send_best_effort(PeerFrame::PeerDisconnected).await;
        }
        self.abort_transfers("disconnected");
        self.connected_slot.release(&self.peer_id);
        self.set_state(SessionState::Disconnected);
    }

    async fn on_header(&mut self, header: FileHeader) {
        if let Some(digester) = &self.transfer.digester {
            if !digester.is_complete() {
                warn!("{:?} started a new file while {} was incomplete - discarding it", self.peer_id, digester.header().name);
            }
        }
        debug!("receiving {} ({} bytes) from {:?}", header.name, header.size, self.peer_id);

        let mut digester = FileDigester::new(header);
        let completed = digester.try_complete();
        self.transfer.digester = Some(digester);
        self.transfer.last_reported_progress = 0.0;
        self.transfer.last_published_progress = 0.0;
        self.transfer.last_acknowledged = 0;
        self.update_transfer_state();

        self.transfer.final_partition_seen = completed.is_some();

        if let Some(file) = completed {
            self.on_receive_progress(1.0).await;
            self.complete_received(file).await;
        }
    }

    async fn on_chunk(&mut self, data: &[u8]) -> anyhow::Result<()> {
        if !self.state.is_connected() {
            bail!("dropping chunk from {:?}: not connected", self.peer_id);
        }

        let step = match self.transfer.digester.as_mut() {
            Some(digester) if !digester.is_complete() => digester.accept(data),
            _ => bail!("dropping chunk from {:?}: no file header", self.peer_id),
        };

        self.on_receive_progress(step.progress).await;
        if let Some(file) = step.completed {
            self.complete_received(file).await;
        }
        Ok(())
    }

    async fn on_receive_progress(&mut self, progress: f64) {
        let last_published = self.transfer.last_published_progress;
        if progress - last_published >= self.config.progress_report_step || (progress >= 1.0 && last_published < 1.0) {
            self.transfer.last_published_progress = progress;
            self.publish_progress(TransferDirection::Receiving, progress);
        }

        let last_reported = self.transfer.last_reported_progress;
        if progress - last_reported >= self.config.progress_report_step || (progress >= 1.0 && last_reported < 1.0) {
            self.transfer.last_reported_progress = progress;
            self.send_best_effort(PeerFrame::Progress { progress }).await;
        }
    }

    async fn complete_received(&mut self, file: ReceivedFile) {
        info!("received {} ({} bytes) from {:?}", file.name, file.size, self.peer_id);
        self.send_best_effort(PeerFrame::TransferComplete).await;
        self.events.send_event(PeerEvent::FileReceived(FileReceivedData {
            peer_id: self.peer_id.clone(),
            file,
        }));
        self.update_transfer_state();
    }

    async fn on_partition(&mut self, offset: u64) -> anyhow::Result<()> {
        let (received, is_complete, size) = match &self.transfer.digester {
            Some(digester) => (digester.bytes_received(), digester.is_complete(), digester.header().size),
            None => bail!("partition frame from {:?} without a file header", self.peer_id),
        };

        if is_complete {
            if offset != size {
                return Ok(());
            }
            if self.transfer.final_partition_seen {
                debug!("{:?} probes a completed file - repeating the completion", self.peer_id);
                self.send_best_effort(PeerFrame::TransferComplete).await;
            }
            else {
                trace!("end of the last partition, completion was sent already");
                self.transfer.final_partition_seen = true;
            }
            return Ok(());
        }

        if received == offset {
            trace!("acknowledging partition ending at {}", offset);
            self.transfer.last_acknowledged = offset;
            self.send_best_effort(PeerFrame::PartitionReceived { offset }).await;
        }
        else {
            let resume_at = self.transfer.last_acknowledged;
            debug!("partition from {:?} ending at {} is incomplete ({} bytes received) - requesting resend from {}", self.peer_id, offset, received, resume_at);
            if let Some(digester) = self.transfer.digester.as_mut() {
                digester.truncate_to(resume_at);
            }
            self.send_best_effort(PeerFrame::PartitionResend { offset: resume_at }).await;
        }
        Ok(())
    }

    async fn on_partition_received(&mut self, offset: u64) {
        match self.transfer.sending.as_mut() {
            Some(sending) if sending.chunker.is_awaiting_ack() && sending.chunker.offset() == offset => {
                sending.chunker.next_partition();
                sending.ack_deadline = None;
                sending.ack_retries = 0;
            }
            _ => {
                debug!("ignoring acknowledgement for offset {} from {:?}", offset, self.peer_id);
                return;
            }
        }
        self.continue_sending().await;
    }

    async fn on_partition_resend(&mut self, offset: u64) {
        let result = match self.transfer.sending.as_mut() {
            Some(sending) if sending.chunker.is_awaiting_ack() && sending.chunker.partition_start() == offset => {
                debug!("{:?} requested resending the partition starting at {}", self.peer_id, offset);
                sending.ack_deadline = None;
                sending.chunker.repeat_partition().await
            }
            Some(sending) if sending.chunker.is_awaiting_ack() => {
                Err(anyhow::anyhow!("receiver requested a resend from {}, partition starts at {}", offset, sending.chunker.partition_start()))
            }
            _ => {
                debug!("ignoring resend request for offset {} from {:?}", offset, self.peer_id);
                return;
            }
        };

        match result {
            Ok(()) => self.continue_sending().await,
            Err(e) => {
                self.fail_current(e);
                self.start_next_file().await;
            }
        }
    }

    async fn on_transfer_complete(&mut self) {
        let sending = match self.transfer.sending.take() {
            Some(sending) if sending.header_sent && sending.chunker.offset() == sending.chunker.size() => sending,
            other => {
                debug!("ignoring completion from {:?}: no completely sent file in flight", self.peer_id);
                self.transfer.sending = other;
                return;
            }
        };

        info!("{} was received by {:?}", sending.header.name, self.peer_id);
        self.publish_progress(TransferDirection::Sending, 1.0);
        self.events.send_event(PeerEvent::TransferCompleted(TransferCompletedData {
            peer_id: self.peer_id.clone(),
            name: sending.header.name,
        }));
        self.update_transfer_state();
        self.start_next_file().await;
    }

    /// Starts the head of the queue unless a file is in flight. Files that cannot be read are
    ///  reported as failed, and the next one is tried.
    async fn start_next_file(&mut self) {
        while self.state.is_connected() && self.transfer.sending.is_none() {
            let file = match self.transfer.queue.pop_front() {
                Some(file) => file,
                None => break,
            };

            let header = file.header();
            info!("sending {} ({} bytes) to {:?}", header.name, header.size, self.peer_id);
            self.transfer.sending = Some(OutgoingTransfer {
                header,
                header_sent: false,
                chunker: FileChunker::new(file, self.config.chunk_size, self.config.max_partition_size),
                ack_deadline: None,
                ack_retries: 0,
            });
            self.update_transfer_state();
            self.publish_progress(TransferDirection::Sending, 0.0);

            if let Err(e) = self.pump().await {
                self.fail_current(e);
            }
        }
    }

    async fn continue_sending(&mut self) {
        if let Err(e) = self.pump().await {
            self.fail_current(e);
            self.start_next_file().await;
        }
    }

    /// Sends until the current partition ends, the file ends, or the transport fails, and then
    ///  waits for the receiver. Errors are failures to read the file.
    async fn pump(&mut self) -> anyhow::Result<()> {
        let sending = match self.transfer.sending.as_mut() {
            Some(sending) => sending,
            None => return Ok(()),
        };
        sending.ack_deadline = Some(Instant::now() + self.config.partition_ack_timeout);

        if !sending.header_sent {
            if let Err(e) = self.transport.send(Frame::Control(PeerFrame::Header(sending.header.clone()))).await {
                debug!("could not send file header to {:?}: {}", self.peer_id, e);
                return Ok(());
            }
            sending.header_sent = true;
        }

        loop {
            match sending.chunker.next_event().await? {
                Some(ChunkerEvent::Chunk(data)) => {
                    if let Err(e) = self.transport.send(Frame::Chunk(data)).await {
                        let offset = sending.chunker.end_partition();
                        debug!("could not send chunk to {:?}, pausing at {}: {}", self.peer_id, offset, e);
                        return Ok(());
                    }
                }
                Some(ChunkerEvent::PartitionEnd { offset, .. }) => {
                    trace!("partition ending at {} sent to {:?}", offset, self.peer_id);
                    if let Err(e) = self.transport.send(Frame::Control(PeerFrame::Partition { offset })).await {
                        debug!("could not send partition end to {:?}: {}", self.peer_id, e);
                    }
                    return Ok(());
                }
                None => return Ok(()),
            }
        }
    }

    /// Asks the receiver where it stands, or retries a header that could not be sent.
    async fn probe(&mut self) {
        let sending = match self.transfer.sending.as_mut() {
            Some(sending) => sending,
            None => return,
        };

        if !sending.header_sent {
            self.continue_sending().await;
            return;
        }

        let offset = sending.chunker.offset();
        debug!("probing {:?} for partition ending at {}", self.peer_id, offset);
        sending.ack_deadline = Some(Instant::now() + self.config.partition_ack_timeout);
        if let Err(e) = self.transport.send(Frame::Control(PeerFrame::Partition { offset })).await {
            debug!("could not probe {:?}: {}", self.peer_id, e);
        }
    }

    fn fail_current(&mut self, reason: impl Display) {
        if let Some(sending) = self.transfer.sending.take() {
            warn!("sending {} to {:?} failed: {}", sending.header.name, self.peer_id, reason);
            self.events.send_event(PeerEvent::TransferFailed(TransferFailedData {
                peer_id: self.peer_id.clone(),
                name: sending.header.name,
                reason: reason.to_string(),
            }));
        }
        self.update_transfer_state();
    }

    /// discards all transfer state, reporting outgoing files as failed
    fn abort_transfers(&mut self, reason: &str) {
        self.fail_current(reason);
        for file in std::mem::take(&mut self.transfer.queue) {
            self.events.send_event(PeerEvent::TransferFailed(TransferFailedData {
                peer_id: self.peer_id.clone(),
                name: file.name,
                reason: reason.to_string(),
            }));
        }
        if let Some(digester) = self.transfer.digester.take() {
            if !digester.is_complete() {
                debug!("discarding partially received {} from {:?}", digester.header().name, self.peer_id);
            }
        }
    }

    fn update_transfer_state(&mut self) {
        if !self.state.is_connected() {
            return;
        }

        let is_receiving = self.transfer.digester.as_ref()
            .map(|d| !d.is_complete())
            .unwrap_or(false);

        if self.transfer.sending.is_some() || is_receiving {
            self.set_state(SessionState::Transferring);
        }
        else {
            self.set_state(SessionState::Connected);
        }
    }

    fn set_state(&mut self, new_state: SessionState) {
        if new_state == self.state {
            return;
        }
        debug!("session with {:?}: {:?} -> {:?}", self.peer_id, self.state, new_state);
        let old_state = self.state;
        self.state = new_state;
        self.events.send_event(PeerEvent::SessionStateChanged(SessionStateChangedData {
            peer_id: self.peer_id.clone(),
            old_state,
            new_state,
        }));
    }

    fn publish_progress(&self, direction: TransferDirection, progress: f64) {
        self.events.send_event(PeerEvent::Progress(ProgressData {
            peer_id: self.peer_id.clone(),
            direction,
            progress,
        }));
    }

    async fn send_best_effort(&self, frame: PeerFrame) {
        if let Err(e) = self.transport.send(Frame::Control(frame)).await {
            debug!("could not send frame to {:?}: {}", self.peer_id, e);
        }
    }
}


#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::sync::{broadcast, mpsc};
    use crate::protocol::encode_text;
    use crate::test_util::event::drain_events;
    use crate::test_util::transport::TrackingTransport;
    use crate::transport::TransportKind;
    use super::*;

    struct TestSession {
        protocol: SessionProtocol,
        transport: Arc<TrackingTransport>,
        events: broadcast::Receiver<PeerEvent>,
        _inbox: mpsc::UnboundedReceiver<SessionInput>,
    }

    fn small_config() -> PeerConfig {
        let mut config = PeerConfig::new("ws://localhost:3000");
        config.chunk_size = 4;
        config.max_partition_size = 10;
        config.max_partition_retries = 2;
        config
    }

    fn session_with(peer: &str, config: PeerConfig) -> TestSession {
        let (handle, inbox) = SessionHandle::new(PeerId::new(peer));
        let transport = Arc::new(TrackingTransport::new(PeerId::new(peer), TransportKind::Relayed, None));
        let notifier = Arc::new(PeerEventNotifier::new(1024));
        let events = notifier.subscribe();

        let protocol = SessionProtocol::new(handle, Arc::new(config), transport.clone(), notifier, Arc::new(ConnectedSlot::new()));
        TestSession {
            protocol,
            transport,
            events,
            _inbox: inbox,
        }
    }

    async fn connected_session(peer: &str, config: PeerConfig) -> TestSession {
        let mut session = session_with(peer, config);
        session.protocol.on_frame(Frame::Control(PeerFrame::PeerRequested)).await.unwrap();
        session.protocol.on_command(PeerCommand::Accept).await.unwrap();
        assert_eq!(session.protocol.state(), SessionState::Connected);
        session.transport.take_sent();
        drain_events(&mut session.events);
        session
    }

    fn content(len: usize) -> Bytes {
        (0..len).map(|i| i as u8).collect::<Vec<_>>().into()
    }

    fn chunk(data: &Bytes, from: usize, to: usize) -> Frame {
        Frame::Chunk(data.slice(from..to))
    }

    fn control(frame: PeerFrame) -> Frame {
        Frame::Control(frame)
    }

    fn state_changes(events: &[PeerEvent]) -> Vec<(SessionState, SessionState)> {
        events.iter()
            .filter_map(|e| match e {
                PeerEvent::SessionStateChanged(data) => Some((data.old_state, data.new_state)),
                _ => None,
            })
            .collect()
    }

    fn progress_events(events: &[PeerEvent], direction: TransferDirection) -> Vec<f64> {
        events.iter()
            .filter_map(|e| match e {
                PeerEvent::Progress(data) if data.direction == direction => Some(data.progress),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_outgoing_handshake() {
        let mut session = session_with("bob", small_config());

        session.protocol.on_command(PeerCommand::RequestConnection).await.unwrap();
        assert_eq!(session.protocol.state(), SessionState::HandshakePending(HandshakeDirection::Outgoing));
        assert_eq!(session.transport.sent_control_frames(), vec![PeerFrame::PeerRequested]);

        session.protocol.on_frame(control(PeerFrame::PeerAccepted)).await.unwrap();
        assert_eq!(session.protocol.state(), SessionState::Connected);

        assert_eq!(state_changes(&drain_events(&mut session.events)), vec![
            (SessionState::Idle, SessionState::HandshakePending(HandshakeDirection::Outgoing)),
            (SessionState::HandshakePending(HandshakeDirection::Outgoing), SessionState::Connected),
        ]);
    }

    #[tokio::test]
    async fn test_incoming_request_is_never_auto_accepted() {
        let mut session = session_with("bob", small_config());

        session.protocol.on_frame(control(PeerFrame::PeerRequested)).await.unwrap();
        assert_eq!(session.protocol.state(), SessionState::HandshakePending(HandshakeDirection::Incoming));
        assert!(session.transport.sent_frames().is_empty());

        let events = drain_events(&mut session.events);
        assert!(events.contains(&PeerEvent::ConnectionRequested(ConnectionRequestedData { peer_id: PeerId::new("bob") })));

        session.protocol.on_command(PeerCommand::Accept).await.unwrap();
        assert_eq!(session.protocol.state(), SessionState::Connected);
        assert_eq!(session.transport.sent_control_frames(), vec![PeerFrame::PeerAccepted]);
    }

    #[tokio::test]
    async fn test_decline() {
        let mut session = session_with("bob", small_config());
        session.protocol.on_frame(control(PeerFrame::PeerRequested)).await.unwrap();
        session.protocol.on_command(PeerCommand::Decline).await.unwrap();

        assert_eq!(session.protocol.state(), SessionState::Idle);
        assert_eq!(session.transport.sent_control_frames(), vec![PeerFrame::PeerDeclined]);

        // nothing left to accept
        assert!(session.protocol.on_command(PeerCommand::Accept).await.is_err());
    }

    #[tokio::test]
    async fn test_declined_by_remote() {
        let mut session = session_with("bob", small_config());
        session.protocol.on_command(PeerCommand::RequestConnection).await.unwrap();
        session.protocol.on_frame(control(PeerFrame::PeerDeclined)).await.unwrap();

        assert_eq!(session.protocol.state(), SessionState::Idle);
        let events = drain_events(&mut session.events);
        assert!(events.contains(&PeerEvent::RequestDeclined(RequestDeclinedData { peer_id: PeerId::new("bob") })));
    }

    #[tokio::test]
    async fn test_cancel_request() {
        let mut session = session_with("bob", small_config());
        session.protocol.on_command(PeerCommand::RequestConnection).await.unwrap();
        session.protocol.on_command(PeerCommand::CancelRequest).await.unwrap();

        assert_eq!(session.protocol.state(), SessionState::Idle);
        assert_eq!(session.transport.sent_control_frames(), vec![PeerFrame::PeerRequested, PeerFrame::PeerDisconnected]);
    }

    #[tokio::test]
    async fn test_withdrawn_request() {
        let mut session = session_with("bob", small_config());
        session.protocol.on_frame(control(PeerFrame::PeerRequested)).await.unwrap();
        session.protocol.on_frame(control(PeerFrame::PeerDisconnected)).await.unwrap();
        assert_eq!(session.protocol.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_both_sides_request() {
        let mut session = session_with("bob", small_config());
        session.protocol.on_command(PeerCommand::RequestConnection).await.unwrap();
        session.protocol.on_frame(control(PeerFrame::PeerRequested)).await.unwrap();

        assert_eq!(session.protocol.state(), SessionState::Connected);
        assert_eq!(session.transport.sent_control_frames(), vec![PeerFrame::PeerRequested, PeerFrame::PeerAccepted]);

        // the remote side's acceptance of our request changes nothing
        session.protocol.on_frame(control(PeerFrame::PeerAccepted)).await.unwrap();
        assert_eq!(session.protocol.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_data_frames_require_connection() {
        let mut session = session_with("bob", small_config());

        let header = FileHeader { name: "x".to_string(), mime: "text/plain".to_string(), size: 1 };
        assert!(session.protocol.on_frame(control(PeerFrame::Header(header))).await.is_err());
        assert!(session.protocol.on_frame(Frame::Chunk(Bytes::from_static(b"x"))).await.is_err());
        assert!(session.protocol.on_frame(control(PeerFrame::text("hi"))).await.is_err());
        assert!(session.protocol.on_command(PeerCommand::SendText("hi".to_string())).await.is_err());

        assert_eq!(session.protocol.state(), SessionState::Idle);
        assert!(drain_events(&mut session.events).is_empty());
        assert!(session.transport.sent_frames().is_empty());
    }

    #[tokio::test]
    async fn test_new_handshake_after_disconnect() {
        let mut session = connected_session("bob", small_config()).await;

        session.protocol.on_command(PeerCommand::Disconnect).await.unwrap();
        assert_eq!(session.protocol.state(), SessionState::Disconnected);
        assert_eq!(session.transport.take_sent(), vec![control(PeerFrame::PeerDisconnected)]);

        session.protocol.on_frame(control(PeerFrame::PeerRequested)).await.unwrap();
        assert_eq!(session.protocol.state(), SessionState::HandshakePending(HandshakeDirection::Incoming));
    }

    #[tokio::test]
    async fn test_remote_disconnect_aborts_transfer() {
        let mut session = connected_session("bob", small_config()).await;
        session.protocol.on_command(PeerCommand::SendFiles(vec![
            OutgoingFile::from_bytes("a.bin", None, content(25)),
            OutgoingFile::from_bytes("b.bin", None, content(3)),
        ])).await.unwrap();

        session.protocol.on_frame(control(PeerFrame::PeerDisconnected)).await.unwrap();
        assert_eq!(session.protocol.state(), SessionState::Disconnected);
        assert_eq!(session.protocol.ack_deadline(), None);

        let failed = drain_events(&mut session.events).into_iter()
            .filter_map(|e| match e {
                PeerEvent::TransferFailed(data) => Some(data.name),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(failed, vec!["a.bin".to_string(), "b.bin".to_string()]);
    }

    #[tokio::test]
    async fn test_partition_flow_control() {
        let mut session = connected_session("bob", small_config()).await;
        let data = content(25);

        session.protocol.on_command(PeerCommand::SendFiles(vec![OutgoingFile::from_bytes("a.bin", Some("application/x-test"), data.clone())])).await.unwrap();
        assert_eq!(session.protocol.state(), SessionState::Transferring);
        assert_eq!(session.transport.take_sent(), vec![
            control(PeerFrame::Header(FileHeader { name: "a.bin".to_string(), mime: "application/x-test".to_string(), size: 25 })),
            chunk(&data, 0, 4),
            chunk(&data, 4, 8),
            chunk(&data, 8, 12),
            control(PeerFrame::Partition { offset: 12 }),
        ]);
        assert!(session.protocol.ack_deadline().is_some());

        // an acknowledgement for a different offset does not release the next partition
        session.protocol.on_frame(control(PeerFrame::PartitionReceived { offset: 8 })).await.unwrap();
        assert!(session.transport.take_sent().is_empty());

        session.protocol.on_frame(control(PeerFrame::PartitionReceived { offset: 12 })).await.unwrap();
        assert_eq!(session.transport.take_sent(), vec![
            chunk(&data, 12, 16),
            chunk(&data, 16, 20),
            chunk(&data, 20, 24),
            control(PeerFrame::Partition { offset: 24 }),
        ]);

        session.protocol.on_frame(control(PeerFrame::PartitionReceived { offset: 24 })).await.unwrap();
        assert_eq!(session.transport.take_sent(), vec![
            chunk(&data, 24, 25),
            control(PeerFrame::Partition { offset: 25 }),
        ]);

        session.protocol.on_frame(control(PeerFrame::Progress { progress: 0.5 })).await.unwrap();
        session.protocol.on_frame(control(PeerFrame::TransferComplete)).await.unwrap();
        assert_eq!(session.protocol.state(), SessionState::Connected);
        assert_eq!(session.protocol.ack_deadline(), None);

        let events = drain_events(&mut session.events);
        assert_eq!(progress_events(&events, TransferDirection::Sending), vec![0.0, 0.5, 1.0]);
        assert!(events.contains(&PeerEvent::TransferCompleted(TransferCompletedData { peer_id: PeerId::new("bob"), name: "a.bin".to_string() })));
    }

    #[tokio::test]
    async fn test_files_are_sent_one_at_a_time() {
        let mut session = connected_session("bob", small_config()).await;
        session.protocol.on_command(PeerCommand::SendFiles(vec![
            OutgoingFile::from_bytes("first", None, content(2)),
            OutgoingFile::from_bytes("second", None, content(3)),
        ])).await.unwrap();

        let headers = |frames: Vec<PeerFrame>| frames.into_iter()
            .filter_map(|f| match f {
                PeerFrame::Header(h) => Some(h.name),
                _ => None,
            })
            .collect::<Vec<_>>();

        assert_eq!(headers(session.transport.sent_control_frames()), vec!["first".to_string()]);
        session.protocol.on_frame(control(PeerFrame::TransferComplete)).await.unwrap();
        assert_eq!(headers(session.transport.sent_control_frames()), vec!["first".to_string(), "second".to_string()]);
    }

    #[tokio::test]
    async fn test_completion_before_the_file_was_sent_is_ignored() {
        let mut session = connected_session("bob", small_config()).await;
        session.protocol.on_command(PeerCommand::SendFiles(vec![OutgoingFile::from_bytes("a.bin", None, content(25))])).await.unwrap();
        session.transport.take_sent();
        drain_events(&mut session.events);

        session.protocol.on_frame(control(PeerFrame::TransferComplete)).await.unwrap();
        assert_eq!(session.protocol.state(), SessionState::Transferring);
        assert!(!drain_events(&mut session.events).iter().any(|e| matches!(e, PeerEvent::TransferCompleted(_))));

        // the transfer goes on as before
        session.protocol.on_frame(control(PeerFrame::PartitionReceived { offset: 12 })).await.unwrap();
        assert_eq!(session.transport.take_sent().last(), Some(&control(PeerFrame::Partition { offset: 24 })));
    }

    #[tokio::test]
    async fn test_session_task_sends_files() {
        let mut session = connected_session("bob", small_config()).await;
        let handle = session.protocol.myself.clone();
        let running = tokio::spawn(crate::session::run_session(session.protocol, session._inbox));

        handle.command(PeerCommand::SendFiles(vec![OutgoingFile::from_bytes("a.bin", None, content(6))])).unwrap();
        handle.send(SessionInput::Frame(control(PeerFrame::TransferComplete)));
        handle.close();
        tokio::time::timeout(std::time::Duration::from_secs(5), running).await.unwrap().unwrap();

        assert!(matches!(session.transport.sent_control_frames()[0], PeerFrame::Header(_)));
        let events = drain_events(&mut session.events);
        assert!(events.contains(&PeerEvent::TransferCompleted(TransferCompletedData { peer_id: PeerId::new("bob"), name: "a.bin".to_string() })));
    }

    #[tokio::test]
    async fn test_files_queued_before_connecting_start_on_connect() {
        let mut session = session_with("bob", small_config());
        session.protocol.on_command(PeerCommand::SendFiles(vec![OutgoingFile::from_bytes("early", None, content(2))])).await.unwrap();
        assert!(session.transport.sent_frames().is_empty());

        session.protocol.on_command(PeerCommand::RequestConnection).await.unwrap();
        session.protocol.on_frame(control(PeerFrame::PeerAccepted)).await.unwrap();
        assert!(matches!(session.transport.sent_control_frames()[1], PeerFrame::Header(_)));
    }

    #[tokio::test]
    async fn test_resend_requested_partition() {
        let mut session = connected_session("bob", small_config()).await;
        let data = content(25);
        session.protocol.on_command(PeerCommand::SendFiles(vec![OutgoingFile::from_bytes("a.bin", None, data.clone())])).await.unwrap();
        session.protocol.on_frame(control(PeerFrame::PartitionReceived { offset: 12 })).await.unwrap();
        session.transport.take_sent();

        session.protocol.on_frame(control(PeerFrame::PartitionResend { offset: 12 })).await.unwrap();
        assert_eq!(session.transport.take_sent(), vec![
            chunk(&data, 12, 16),
            chunk(&data, 16, 20),
            chunk(&data, 20, 24),
            control(PeerFrame::Partition { offset: 24 }),
        ]);
    }

    #[tokio::test]
    async fn test_unanswered_partition_is_probed_then_fails() {
        let mut session = connected_session("bob", small_config()).await;
        session.protocol.on_command(PeerCommand::SendFiles(vec![OutgoingFile::from_bytes("a.bin", None, content(25))])).await.unwrap();
        session.transport.take_sent();

        session.protocol.on_ack_timeout().await;
        assert_eq!(session.transport.take_sent(), vec![control(PeerFrame::Partition { offset: 12 })]);
        session.protocol.on_ack_timeout().await;
        assert_eq!(session.transport.take_sent(), vec![control(PeerFrame::Partition { offset: 12 })]);

        session.protocol.on_ack_timeout().await;
        assert!(session.transport.take_sent().is_empty());
        assert_eq!(session.protocol.state(), SessionState::Connected);
        assert_eq!(session.protocol.ack_deadline(), None);

        let events = drain_events(&mut session.events);
        assert!(events.iter().any(|e| matches!(e, PeerEvent::TransferFailed(data) if data.name == "a.bin")));
    }

    #[tokio::test]
    async fn test_transfer_resumes_when_transport_reopens() {
        let mut session = connected_session("bob", small_config()).await;
        let data = content(6);
        session.transport.set_ready(false);

        session.protocol.on_command(PeerCommand::SendFiles(vec![OutgoingFile::from_bytes("a.bin", None, data.clone())])).await.unwrap();
        assert!(session.transport.sent_frames().is_empty());
        assert!(session.protocol.ack_deadline().is_some());

        session.transport.set_ready(true);
        assert!(session.protocol.on_transport_event(TransportEvent::Opened).await);
        assert_eq!(session.transport.take_sent(), vec![
            control(PeerFrame::Header(FileHeader { name: "a.bin".to_string(), mime: crate::transfer::DEFAULT_MIME.to_string(), size: 6 })),
            chunk(&data, 0, 4),
            chunk(&data, 4, 6),
            control(PeerFrame::Partition { offset: 6 }),
        ]);
    }

    #[tokio::test]
    async fn test_transport_failure_ends_session() {
        let mut session = connected_session("bob", small_config()).await;
        assert!(!session.protocol.on_transport_event(TransportEvent::Failed).await);
        assert_eq!(session.protocol.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_receive_file() {
        let mut session = connected_session("bob", small_config()).await;
        let data = content(10);

        session.protocol.on_frame(control(PeerFrame::Header(FileHeader { name: "r.bin".to_string(), mime: String::new(), size: 10 }))).await.unwrap();
        assert_eq!(session.protocol.state(), SessionState::Transferring);

        session.protocol.on_frame(chunk(&data, 0, 4)).await.unwrap();
        session.protocol.on_frame(chunk(&data, 4, 8)).await.unwrap();
        session.protocol.on_frame(control(PeerFrame::Partition { offset: 8 })).await.unwrap();
        session.protocol.on_frame(chunk(&data, 8, 10)).await.unwrap();
        session.protocol.on_frame(control(PeerFrame::Partition { offset: 10 })).await.unwrap();

        assert_eq!(session.transport.sent_control_frames(), vec![
            PeerFrame::Progress { progress: 0.4 },
            PeerFrame::Progress { progress: 0.8 },
            PeerFrame::PartitionReceived { offset: 8 },
            PeerFrame::Progress { progress: 1.0 },
            PeerFrame::TransferComplete,
        ]);
        assert_eq!(session.protocol.state(), SessionState::Connected);

        // a sender that missed the completion probes the last partition again
        session.transport.take_sent();
        session.protocol.on_frame(control(PeerFrame::Partition { offset: 10 })).await.unwrap();
        assert_eq!(session.transport.sent_control_frames(), vec![PeerFrame::TransferComplete]);

        let events = drain_events(&mut session.events);
        assert_eq!(progress_events(&events, TransferDirection::Receiving), vec![0.4, 0.8, 1.0]);
        let received = events.iter()
            .find_map(|e| match e {
                PeerEvent::FileReceived(data) => Some(data.file.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(received.name, "r.bin");
        assert_eq!(received.mime, crate::transfer::DEFAULT_MIME);
        assert_eq!(received.data, data);
    }

    #[tokio::test]
    async fn test_receive_progress_is_published_in_steps() {
        let mut config = small_config();
        config.progress_report_step = 0.25;
        let mut session = connected_session("bob", config).await;
        let data = content(10);

        session.protocol.on_frame(control(PeerFrame::Header(FileHeader { name: "r.bin".to_string(), mime: String::new(), size: 10 }))).await.unwrap();
        for i in 0..10 {
            session.protocol.on_frame(chunk(&data, i, i + 1)).await.unwrap();
        }

        let events = drain_events(&mut session.events);
        assert_eq!(progress_events(&events, TransferDirection::Receiving), vec![0.3, 0.6, 0.9, 1.0]);
    }

    #[tokio::test]
    async fn test_receive_empty_file() {
        let mut session = connected_session("bob", small_config()).await;
        session.protocol.on_frame(control(PeerFrame::Header(FileHeader { name: "empty".to_string(), mime: "text/plain".to_string(), size: 0 }))).await.unwrap();

        assert_eq!(session.transport.sent_control_frames(), vec![
            PeerFrame::Progress { progress: 1.0 },
            PeerFrame::TransferComplete,
        ]);
        assert_eq!(session.protocol.state(), SessionState::Connected);
        let events = drain_events(&mut session.events);
        assert!(events.iter().any(|e| matches!(e, PeerEvent::FileReceived(data) if data.file.data.is_empty())));
    }

    #[tokio::test]
    async fn test_incomplete_partition_is_requested_again() {
        let mut session = connected_session("bob", small_config()).await;
        let data = content(20);
        session.protocol.on_frame(control(PeerFrame::Header(FileHeader { name: "r.bin".to_string(), mime: String::new(), size: 20 }))).await.unwrap();

        session.protocol.on_frame(chunk(&data, 0, 4)).await.unwrap();
        session.protocol.on_frame(chunk(&data, 4, 8)).await.unwrap();
        session.protocol.on_frame(chunk(&data, 8, 12)).await.unwrap();
        session.protocol.on_frame(control(PeerFrame::Partition { offset: 12 })).await.unwrap();

        // the chunk 16..20 got lost
        session.protocol.on_frame(chunk(&data, 12, 16)).await.unwrap();
        session.protocol.on_frame(control(PeerFrame::Partition { offset: 20 })).await.unwrap();

        let controls = session.transport.sent_control_frames();
        assert_eq!(controls.last(), Some(&PeerFrame::PartitionResend { offset: 12 }));

        session.protocol.on_frame(chunk(&data, 12, 16)).await.unwrap();
        session.protocol.on_frame(chunk(&data, 16, 20)).await.unwrap();
        let events = drain_events(&mut session.events);
        let received = events.iter()
            .find_map(|e| match e {
                PeerEvent::FileReceived(data) => Some(data.file.data.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(received, data);
    }

    #[tokio::test]
    async fn test_text() {
        let mut session = connected_session("bob", small_config()).await;

        session.protocol.on_frame(control(PeerFrame::Text { message: encode_text("Grüße 👋") })).await.unwrap();
        let events = drain_events(&mut session.events);
        assert_eq!(events, vec![PeerEvent::TextReceived(TextReceivedData { peer_id: PeerId::new("bob"), text: "Grüße 👋".to_string() })]);

        session.protocol.on_command(PeerCommand::SendText("ok ✓".to_string())).await.unwrap();
        assert_eq!(session.transport.sent_control_frames(), vec![PeerFrame::text("ok ✓")]);

        assert!(session.protocol.on_frame(control(PeerFrame::Text { message: "%%%".to_string() })).await.is_err());
    }

    async fn exchange(a: &mut TestSession, b: &mut TestSession) {
        loop {
            let from_a = a.transport.take_sent();
            let from_b = b.transport.take_sent();
            if from_a.is_empty() && from_b.is_empty() {
                return;
            }
            for frame in from_a {
                b.protocol.on_frame(frame).await.unwrap();
            }
            for frame in from_b {
                a.protocol.on_frame(frame).await.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_transfer_between_two_sessions() {
        let mut alice = session_with("bob", PeerConfig::new("ws://localhost:3000"));
        let mut bob = session_with("alice", PeerConfig::new("ws://localhost:3000"));

        alice.protocol.on_command(PeerCommand::RequestConnection).await.unwrap();
        exchange(&mut alice, &mut bob).await;
        bob.protocol.on_command(PeerCommand::Accept).await.unwrap();
        exchange(&mut alice, &mut bob).await;
        assert_eq!(alice.protocol.state(), SessionState::Connected);
        assert_eq!(bob.protocol.state(), SessionState::Connected);

        let data: Bytes = (0..2_500_000).map(|i: u32| (i % 253) as u8).collect::<Vec<_>>().into();
        alice.protocol.on_command(PeerCommand::SendFiles(vec![OutgoingFile::from_bytes("big.bin", None, data.clone())])).await.unwrap();
        exchange(&mut alice, &mut bob).await;

        let alice_events = drain_events(&mut alice.events);
        let bob_events = drain_events(&mut bob.events);

        for progress in [progress_events(&alice_events, TransferDirection::Sending), progress_events(&bob_events, TransferDirection::Receiving)] {
            assert!(progress.windows(2).all(|w| w[0] <= w[1]), "progress not monotonic: {:?}", progress);
            assert_eq!(progress.last(), Some(&1.0));
        }

        let received = bob_events.iter()
            .find_map(|e| match e {
                PeerEvent::FileReceived(data) => Some(data.file.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(received.data, data);
        assert!(alice_events.iter().any(|e| matches!(e, PeerEvent::TransferCompleted(_))));
        assert_eq!(alice.protocol.state(), SessionState::Connected);
        assert_eq!(bob.protocol.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_queued_files_arrive_in_order() {
        let mut alice = session_with("bob", small_config());
        let mut bob = session_with("alice", small_config());

        alice.protocol.on_command(PeerCommand::RequestConnection).await.unwrap();
        exchange(&mut alice, &mut bob).await;
        bob.protocol.on_command(PeerCommand::Accept).await.unwrap();
        exchange(&mut alice, &mut bob).await;

        let files = vec![("first", content(6)), ("second", content(25)), ("third", content(13)), ("fourth", content(0))];
        alice.protocol.on_command(PeerCommand::SendFiles(files.iter()
            .map(|(name, data)| OutgoingFile::from_bytes(*name, None, data.clone()))
            .collect()
        )).await.unwrap();
        exchange(&mut alice, &mut bob).await;

        let completed = drain_events(&mut alice.events).into_iter()
            .filter_map(|e| match e {
                PeerEvent::TransferCompleted(data) => Some(data.name),
                _ => None,
            })
            .collect::<Vec<_>>();
        let received = drain_events(&mut bob.events).into_iter()
            .filter_map(|e| match e {
                PeerEvent::FileReceived(data) => Some((data.file.name, data.file.data)),
                _ => None,
            })
            .collect::<Vec<_>>();

        assert_eq!(completed, vec!["first", "second", "third", "fourth"]);
        assert_eq!(received, files.into_iter().map(|(name, data)| (name.to_string(), data)).collect::<Vec<_>>());
        assert_eq!(alice.protocol.state(), SessionState::Connected);
        assert_eq!(bob.protocol.state(), SessionState::Connected);
    }
}
