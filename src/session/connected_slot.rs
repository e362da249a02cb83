use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time;
use tracing::{debug, warn};

use crate::protocol::PeerId;
use crate::session::SessionHandle;

/// Tracks the one session per local endpoint that may be connected at any time.
#[derive(Default)]
pub struct ConnectedSlot {
    current: Mutex<Option<SessionHandle>>,
}

impl ConnectedSlot {
    pub fn new() -> ConnectedSlot {
        Default::default()
    }

    /// Makes `handle` the connected session. A different session holding the slot is evicted
    ///  first, and this call returns only after it is disconnected (or `eviction_timeout` passed).
    pub async fn claim(&self, handle: SessionHandle, eviction_timeout: Duration) {
        let previous = {
            let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
            let previous = current.take();
            *current = Some(handle.clone());
            previous
        };

        let previous = match previous {
            Some(previous) if previous.peer_id() != handle.peer_id() => previous,
            _ => return,
        };

        debug!("evicting connected session with {:?} in favor of {:?}", previous.peer_id(), handle.peer_id());
        let (done, done_recv) = oneshot::channel();
        if !previous.evict(done) {
            return;
        }
        if time::timeout(eviction_timeout, done_recv).await.is_err() {
            warn!("session with {:?} did not disconnect in time", previous.peer_id());
        }
    }

    /// no-op unless `peer_id`'s session holds the slot
    pub fn release(&self, peer_id: &PeerId) {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if current.as_ref().map(|h| h.peer_id() == peer_id).unwrap_or(false) {
            *current = None;
        }
    }

    pub fn holder(&self) -> Option<PeerId> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|h| h.peer_id().clone())
    }
}


#[cfg(test)]
mod tests {
    use crate::session::SessionInput;
    use super::*;

    #[tokio::test]
    async fn test_claim_evicts_previous_holder() {
        let slot = ConnectedSlot::new();
        let (a, mut a_inbox) = SessionHandle::new(PeerId::new("a"));
        let (b, _b_inbox) = SessionHandle::new(PeerId::new("b"));

        slot.claim(a.clone(), Duration::from_secs(1)).await;
        assert_eq!(slot.holder(), Some(PeerId::new("a")));

        let responder = tokio::spawn(async move {
            match a_inbox.recv().await {
                Some(SessionInput::Evict(done)) => { done.send(()).ok(); }
                _ => panic!("expected eviction"),
            }
        });

        slot.claim(b.clone(), Duration::from_secs(1)).await;
        responder.await.unwrap();
        assert_eq!(slot.holder(), Some(PeerId::new("b")));

        slot.release(&PeerId::new("a"));
        assert_eq!(slot.holder(), Some(PeerId::new("b")));
        slot.release(&PeerId::new("b"));
        assert_eq!(slot.holder(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_does_not_wait_forever() {
        let slot = ConnectedSlot::new();
        let (a, _a_inbox) = SessionHandle::new(PeerId::new("a"));
        let (b, _b_inbox) = SessionHandle::new(PeerId::new("b"));

        slot.claim(a, Duration::from_secs(5)).await;
        slot.claim(b, Duration::from_secs(5)).await;
        assert_eq!(slot.holder(), Some(PeerId::new("b")));
    }

    #[tokio::test]
    async fn test_reclaim_by_same_peer() {
        let slot = ConnectedSlot::new();
        let (a, mut a_inbox) = SessionHandle::new(PeerId::new("a"));

        slot.claim(a.clone(), Duration::from_secs(1)).await;
        slot.claim(a, Duration::from_secs(1)).await;
        assert!(a_inbox.try_recv().is_err());
    }
}
