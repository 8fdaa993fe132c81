//! Fan-out of state deltas to observers of one account.
//!
//! The hub is owned by the account worker, which is the only producer, so
//! sequence numbers follow the order in which changes were applied. Each
//! observer gets a bounded channel; an observer that cannot keep up is
//! disconnected instead of blocking the worker, and must re-snapshot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cadence_core::config::BroadcastConfig;
use cadence_core::events::{Envelope, ServerMessage};
use cadence_core::types::Timestamp;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Liveness marker shared between the hub and an observer's transport.
#[derive(Debug, Clone)]
pub struct ObserverLiveness(Arc<Mutex<Instant>>);

impl ObserverLiveness {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(Instant::now())))
    }

    /// Record that the observer answered (heartbeat ack or any inbound frame).
    pub fn touch(&self) {
        *self.0.lock().unwrap_or_else(|p| p.into_inner()) = Instant::now();
    }

    fn last_seen(&self) -> Instant {
        *self.0.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// An attached observer's end of the stream. The first envelope is always a snapshot.
#[derive(Debug)]
pub struct Subscription {
    pub observer_id: u64,
    pub receiver: mpsc::Receiver<Arc<Envelope>>,
    pub liveness: ObserverLiveness,
}

struct ObserverSlot {
    sender: mpsc::Sender<Arc<Envelope>>,
    liveness: ObserverLiveness,
}

pub struct BroadcastHub {
    account_id: String,
    seq: u64,
    next_observer: u64,
    buffer: usize,
    heartbeat_timeout: Duration,
    observers: HashMap<u64, ObserverSlot>,
}

impl BroadcastHub {
    pub fn new(account_id: impl Into<String>, config: &BroadcastConfig) -> Self {
        Self {
            account_id: account_id.into(),
            seq: 0,
            next_observer: 1,
            buffer: config.observer_buffer.max(1),
            heartbeat_timeout: Duration::from_secs(config.heartbeat_timeout_secs),
            observers: HashMap::new(),
        }
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Sequence number of the last published delta.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Register an observer. `snapshot` is queued before the observer can see
    /// any delta, stamped with the current sequence so later deltas sort after it.
    pub fn attach(&mut self, snapshot: ServerMessage) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.buffer);
        let envelope = Arc::new(self.envelope(self.seq, snapshot));
        // A fresh channel always has room for one message.
        let _ = sender.try_send(envelope);

        let observer_id = self.next_observer;
        self.next_observer += 1;
        let liveness = ObserverLiveness::new();
        self.observers.insert(
            observer_id,
            ObserverSlot {
                sender,
                liveness: liveness.clone(),
            },
        );
        debug!(account_id = %self.account_id, observer_id, "Observer attached");
        Subscription {
            observer_id,
            receiver,
            liveness,
        }
    }

    pub fn detach(&mut self, observer_id: u64) {
        if self.observers.remove(&observer_id).is_some() {
            debug!(account_id = %self.account_id, observer_id, "Observer detached");
        }
    }

    /// Publish a delta to every observer without waiting on any of them.
    pub fn publish(&mut self, message: ServerMessage) -> u64 {
        self.seq += 1;
        let envelope = Arc::new(self.envelope(self.seq, message));
        let account_id = &self.account_id;
        self.observers.retain(|observer_id, slot| {
            match slot.sender.try_send(Arc::clone(&envelope)) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(%account_id, observer_id, "Observer buffer overflowed; disconnecting");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(%account_id, observer_id, "Observer channel closed");
                    false
                }
            }
        });
        self.seq
    }

    /// Drop observers that have been silent past the timeout, then send a heartbeat.
    pub fn heartbeat(&mut self) {
        let now = Instant::now();
        let timeout = self.heartbeat_timeout;
        let account_id = &self.account_id;
        self.observers.retain(|observer_id, slot| {
            let alive = now.duration_since(slot.liveness.last_seen()) <= timeout;
            if !alive {
                warn!(%account_id, observer_id, "Observer missed heartbeats; dropping");
            }
            alive
        });
        if !self.observers.is_empty() {
            self.publish(ServerMessage::Heartbeat);
        }
    }

    fn envelope(&self, seq: u64, message: ServerMessage) -> Envelope {
        Envelope {
            seq,
            account_id: self.account_id.clone(),
            timestamp: Timestamp::now(),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::events::ServerMessage;
    use cadence_core::types::{
        AutomationStatus, QuotaSnapshot, SafetyStatus, StopPhase,
    };
    use chrono::Utc;

    fn snapshot() -> ServerMessage {
        ServerMessage::Snapshot {
            queue: Vec::new(),
            safety: SafetyStatus::initial(Utc::now()),
            automation: AutomationStatus {
                phase: StopPhase::Running,
                enabled: true,
                suspended: false,
                stop: None,
                in_flight: None,
            },
            quota: QuotaSnapshot::default(),
        }
    }

    fn config(buffer: usize) -> BroadcastConfig {
        BroadcastConfig {
            observer_buffer: buffer,
            heartbeat_interval_secs: 15,
            heartbeat_timeout_secs: 45,
        }
    }

    #[tokio::test]
    async fn test_snapshot_precedes_deltas() {
        let mut hub = BroadcastHub::new("acct", &config(8));
        hub.publish(ServerMessage::Heartbeat);
        let mut sub = hub.attach(snapshot());
        hub.publish(ServerMessage::Error {
            message: "x".to_string(),
        });

        let first = sub.receiver.recv().await.unwrap();
        assert!(matches!(first.message, ServerMessage::Snapshot { .. }));
        assert_eq!(first.seq, 1);
        let second = sub.receiver.recv().await.unwrap();
        assert!(matches!(second.message, ServerMessage::Error { .. }));
        assert_eq!(second.seq, 2);
        assert_eq!(second.account_id, "acct");
    }

    #[tokio::test]
    async fn test_slow_observer_disconnected_without_blocking() {
        let mut hub = BroadcastHub::new("acct", &config(2));
        let mut slow = hub.attach(snapshot());
        let mut fast = hub.attach(snapshot());
        fast.receiver.recv().await.unwrap();

        hub.publish(ServerMessage::Heartbeat);
        fast.receiver.recv().await.unwrap();
        // Slow observer now holds snapshot + heartbeat; the next delta overflows it.
        hub.publish(ServerMessage::Heartbeat);
        assert_eq!(hub.observer_count(), 1);
        fast.receiver.recv().await.unwrap();

        // The slow observer drains what it had, then sees the channel closed.
        assert!(slow.receiver.recv().await.is_some());
        assert!(slow.receiver.recv().await.is_some());
        assert!(slow.receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_closed_observer_pruned_on_publish() {
        let mut hub = BroadcastHub::new("acct", &config(8));
        let sub = hub.attach(snapshot());
        drop(sub);
        hub.publish(ServerMessage::Heartbeat);
        assert_eq!(hub.observer_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_observer_dropped_after_timeout() {
        let mut hub = BroadcastHub::new("acct", &config(64));
        let quiet = hub.attach(snapshot());
        let chatty = hub.attach(snapshot());

        tokio::time::advance(Duration::from_secs(30)).await;
        chatty.liveness.touch();
        hub.heartbeat();
        assert_eq!(hub.observer_count(), 2);

        tokio::time::advance(Duration::from_secs(20)).await;
        hub.heartbeat();
        assert_eq!(hub.observer_count(), 1);
        drop(quiet);
    }

    #[tokio::test]
    async fn test_sequence_strictly_increases() {
        let mut hub = BroadcastHub::new("acct", &config(8));
        let a = hub.publish(ServerMessage::Heartbeat);
        let b = hub.publish(ServerMessage::Heartbeat);
        assert!(b > a);
        assert_eq!(hub.seq(), b);
    }

    #[test]
    fn test_detach() {
        let mut hub = BroadcastHub::new("acct", &config(8));
        let sub = hub.attach(snapshot());
        hub.detach(sub.observer_id);
        assert_eq!(hub.observer_count(), 0);
    }
}
