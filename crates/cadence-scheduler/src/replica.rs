//! Observer-side model of one account, rebuilt from a snapshot plus deltas.
//!
//! Used by consumers of the observer stream (and by tests) to check that
//! snapshot + replayed deltas reproduce the authoritative queue.

use std::collections::HashMap;

use cadence_core::events::{Envelope, ServerMessage};
use cadence_core::types::{
    AutomationStatus, QueueAction, QueueItem, QuotaSnapshot, SafetyAlert, SafetyStatus,
};
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct QueueReplica {
    last_seq: Option<u64>,
    order: Vec<Uuid>,
    items: HashMap<Uuid, QueueItem>,
    safety: Option<SafetyStatus>,
    automation: Option<AutomationStatus>,
    quota: Option<QuotaSnapshot>,
    alerts: Vec<SafetyAlert>,
}

impl QueueReplica {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one envelope. Returns `false` when it was stale or arrived before
    /// any snapshot, and was therefore ignored.
    pub fn apply(&mut self, envelope: &Envelope) -> bool {
        if let ServerMessage::Snapshot {
            queue,
            safety,
            automation,
            quota,
        } = &envelope.message
        {
            self.order = queue.iter().map(|item| item.id).collect();
            self.items = queue.iter().map(|item| (item.id, item.clone())).collect();
            self.safety = Some(safety.clone());
            self.automation = Some(automation.clone());
            self.quota = Some(quota.clone());
            self.alerts.clear();
            self.last_seq = Some(envelope.seq);
            return true;
        }

        match self.last_seq {
            Some(last) if envelope.seq > last => self.last_seq = Some(envelope.seq),
            _ => return false,
        }

        match &envelope.message {
            ServerMessage::QueueUpdate {
                action,
                item,
                position,
            } => match action {
                QueueAction::Removed => {
                    self.order.retain(|id| *id != item.id);
                    self.items.remove(&item.id);
                }
                QueueAction::Added | QueueAction::Updated => {
                    match position {
                        Some(position) => {
                            self.order.retain(|id| *id != item.id);
                            let at = (*position).min(self.order.len());
                            self.order.insert(at, item.id);
                        }
                        None if !self.items.contains_key(&item.id) => self.order.push(item.id),
                        None => {}
                    }
                    self.items.insert(item.id, item.clone());
                }
            },
            ServerMessage::QueueReordered { order } => {
                self.order = order.clone();
            }
            ServerMessage::SafetyUpdate { status } => self.safety = Some(status.clone()),
            ServerMessage::SafetyAlert { alert } => self.alerts.push(alert.clone()),
            ServerMessage::AutomationStatus { status } => self.automation = Some(status.clone()),
            ServerMessage::QuotaUpdate { quota } => self.quota = Some(quota.clone()),
            ServerMessage::Snapshot { .. }
            | ServerMessage::Heartbeat
            | ServerMessage::CommandResult { .. }
            | ServerMessage::Error { .. } => {}
        }
        true
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.last_seq
    }

    /// Items in queue order.
    pub fn items(&self) -> Vec<QueueItem> {
        self.order
            .iter()
            .filter_map(|id| self.items.get(id))
            .cloned()
            .collect()
    }

    pub fn safety(&self) -> Option<&SafetyStatus> {
        self.safety.as_ref()
    }

    pub fn automation(&self) -> Option<&AutomationStatus> {
        self.automation.as_ref()
    }

    pub fn quota(&self) -> Option<&QuotaSnapshot> {
        self.quota.as_ref()
    }

    /// Alerts received since the last snapshot.
    pub fn alerts(&self) -> &[SafetyAlert] {
        &self.alerts
    }
}
