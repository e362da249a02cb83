use std::time::Duration;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::time;

use crate::events::PeerEvent;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Skips events until one matches `predicate`, panicking if none arrives in time.
pub async fn await_event<F>(events: &mut broadcast::Receiver<PeerEvent>, predicate: F) -> PeerEvent
where F: Fn(&PeerEvent) -> bool
{
    let result = time::timeout(EVENT_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event channel closed"),
            }
        }
    }).await;

    match result {
        Ok(event) => event,
        Err(_) => panic!("timed out waiting for event"),
    }
}

/// all events that are currently buffered, without waiting
pub fn drain_events(events: &mut broadcast::Receiver<PeerEvent>) -> Vec<PeerEvent> {
    let mut result = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => result.push(event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => return result,
        }
    }
}
