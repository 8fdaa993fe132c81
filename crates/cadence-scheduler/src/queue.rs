//! Ordered work queue for one account.
//!
//! Items sort by `(priority desc, scheduled_at asc)` on insertion, but an item
//! is never placed ahead of one of its dependencies. Manual reorders permute
//! queued items within the slots they already occupy and are rejected if they
//! would break dependency order.

use std::collections::{HashMap, HashSet, VecDeque};

use cadence_core::types::{ActionType, ItemStatus, Priority, QueueCounts, QueueItem};
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::state_machine::validate_transition;

/// Terminal statuses remembered for removed items, for dependency checks.
const RESOLVED_LIMIT: usize = 10_000;

#[derive(Debug, Default)]
pub struct WorkQueue {
    order: Vec<Uuid>,
    items: HashMap<Uuid, QueueItem>,
    resolved: HashMap<Uuid, ItemStatus>,
    resolved_order: VecDeque<Uuid>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn get(&self, id: Uuid) -> Option<&QueueItem> {
        self.items.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: Uuid) -> Option<&mut QueueItem> {
        self.items.get_mut(&id)
    }

    pub fn order(&self) -> &[Uuid] {
        &self.order
    }

    pub fn position(&self, id: Uuid) -> Option<usize> {
        self.order.iter().position(|other| *other == id)
    }

    /// All items in queue order.
    pub fn items(&self) -> Vec<QueueItem> {
        self.order
            .iter()
            .filter_map(|id| self.items.get(id))
            .cloned()
            .collect()
    }

    /// Current status, including items already removed after retention.
    pub fn status_of(&self, id: Uuid) -> Option<ItemStatus> {
        self.items
            .get(&id)
            .map(|item| item.status)
            .or_else(|| self.resolved.get(&id).copied())
    }

    /// Insert a new item and return its position.
    pub fn insert(&mut self, item: QueueItem) -> Result<usize> {
        if self.items.contains_key(&item.id) || self.resolved.contains_key(&item.id) {
            return Err(SchedulerError::Validation(format!(
                "item {} already exists",
                item.id
            )));
        }
        for dep in &item.depends_on {
            match self.status_of(*dep) {
                None => return Err(SchedulerError::UnknownDependency(*dep)),
                Some(status @ (ItemStatus::Failed | ItemStatus::Cancelled)) => {
                    return Err(SchedulerError::Validation(format!(
                        "dependency {} already ended as {}",
                        dep, status
                    )));
                }
                Some(_) => {}
            }
        }
        let position = self.place(&item);
        self.order.insert(position, item.id);
        self.items.insert(item.id, item);
        Ok(position)
    }

    /// Apply a validated status transition, stamping lifecycle timestamps.
    pub fn transition(
        &mut self,
        id: Uuid,
        to: ItemStatus,
        now: DateTime<Utc>,
    ) -> Result<&mut QueueItem> {
        let item = self
            .items
            .get_mut(&id)
            .ok_or(SchedulerError::ItemNotFound(id))?;
        validate_transition(item.status, to)?;
        item.status = to;
        match to {
            ItemStatus::Processing => item.processing_started_at = Some(now),
            ItemStatus::Queued => item.completed_at = None,
            status if status.is_terminal() => item.completed_at = Some(now),
            _ => {}
        }
        Ok(item)
    }

    /// Change a queued item's priority and move it accordingly.
    pub fn set_priority(&mut self, id: Uuid, priority: Priority) -> Result<usize> {
        let item = self.items.get(&id).ok_or(SchedulerError::ItemNotFound(id))?;
        if item.status != ItemStatus::Queued {
            return Err(SchedulerError::NotQueued(id, item.status));
        }
        let mut updated = item.clone();
        updated.priority = priority;
        self.order.retain(|other| *other != id);
        let position = self.place(&updated);
        self.order.insert(position, id);
        self.items.insert(id, updated);
        Ok(position)
    }

    /// Permute the given queued items within the slots they occupy, in the
    /// requested order. Returns the full queue order afterwards.
    pub fn reorder(&mut self, ids: &[Uuid]) -> Result<Vec<Uuid>> {
        let unique: HashSet<_> = ids.iter().collect();
        if unique.len() != ids.len() {
            return Err(SchedulerError::Validation(
                "reorder list contains duplicate ids".to_string(),
            ));
        }
        let mut slots = Vec::with_capacity(ids.len());
        for id in ids {
            let item = self.items.get(id).ok_or(SchedulerError::ItemNotFound(*id))?;
            if item.status != ItemStatus::Queued {
                return Err(SchedulerError::NotQueued(*id, item.status));
            }
            if let Some(slot) = self.position(*id) {
                slots.push(slot);
            }
        }
        slots.sort_unstable();

        let previous = self.order.clone();
        for (slot, id) in slots.iter().zip(ids) {
            self.order[*slot] = *id;
        }
        if let Err(e) = self.check_dependency_order() {
            self.order = previous;
            return Err(e);
        }
        Ok(self.order.clone())
    }

    /// Queued items that are due, out of backoff, and whose dependencies all
    /// completed, in dispatch order.
    pub fn ready_candidates(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        self.order
            .iter()
            .filter(|id| {
                let item = &self.items[*id];
                item.status == ItemStatus::Queued
                    && item.scheduled_at <= now
                    && item.not_before.map_or(true, |t| t <= now)
                    && self.dependencies_completed(item)
            })
            .copied()
            .collect()
    }

    /// Rate-limited items whose cool-down has elapsed.
    pub fn cooled_down(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        self.order
            .iter()
            .filter(|id| {
                let item = &self.items[*id];
                item.status == ItemStatus::RateLimited && item.not_before.map_or(true, |t| t <= now)
            })
            .copied()
            .collect()
    }

    /// Open items that directly depend on `id`.
    pub fn dependents_of(&self, id: Uuid) -> Vec<Uuid> {
        self.order
            .iter()
            .filter(|other| {
                let item = &self.items[*other];
                !item.status.is_terminal() && item.depends_on.contains(&id)
            })
            .copied()
            .collect()
    }

    /// Items of `action_type` admitted but not yet holding or consuming quota.
    pub fn pending_of_type(&self, action_type: ActionType) -> u32 {
        self.items
            .values()
            .filter(|item| {
                item.action_type == action_type
                    && matches!(item.status, ItemStatus::Queued | ItemStatus::RateLimited)
            })
            .count() as u32
    }

    /// Items that have not reached a terminal state.
    pub fn open_items(&self) -> Vec<Uuid> {
        self.order
            .iter()
            .filter(|id| !self.items[*id].status.is_terminal())
            .copied()
            .collect()
    }

    pub fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for item in self.items.values() {
            counts.record(item.status);
        }
        counts
    }

    /// Terminal items older than the retention window.
    pub fn expired(&self, now: DateTime<Utc>, retention: Duration) -> Vec<Uuid> {
        self.order
            .iter()
            .filter(|id| {
                let item = &self.items[*id];
                item.status.is_terminal() && item.completed_at.is_some_and(|t| t + retention <= now)
            })
            .copied()
            .collect()
    }

    /// Remove an item, remembering its final status.
    pub fn remove(&mut self, id: Uuid) -> Option<QueueItem> {
        let item = self.items.remove(&id)?;
        self.order.retain(|other| *other != id);
        self.resolved.insert(id, item.status);
        self.resolved_order.push_back(id);
        while self.resolved_order.len() > RESOLVED_LIMIT {
            if let Some(oldest) = self.resolved_order.pop_front() {
                self.resolved.remove(&oldest);
            }
        }
        Some(item)
    }

    fn dependencies_completed(&self, item: &QueueItem) -> bool {
        item.depends_on
            .iter()
            .all(|dep| self.status_of(*dep) == Some(ItemStatus::Completed))
    }

    /// Insertion slot for `item`, which must not currently be in `order`.
    fn place(&self, item: &QueueItem) -> usize {
        let lower = item
            .depends_on
            .iter()
            .filter_map(|dep| self.position(*dep))
            .max()
            .map_or(0, |p| p + 1);
        let upper = self
            .order
            .iter()
            .position(|id| self.items[id].depends_on.contains(&item.id))
            .unwrap_or(self.order.len());
        let natural = self
            .order
            .iter()
            .position(|id| {
                let other = &self.items[id];
                !other.status.is_terminal() && ranks_before(item, other)
            })
            .unwrap_or(self.order.len());
        natural.min(upper).max(lower)
    }

    fn check_dependency_order(&self) -> Result<()> {
        let index: HashMap<Uuid, usize> = self
            .order
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, i))
            .collect();
        for (i, id) in self.order.iter().enumerate() {
            for dep in &self.items[id].depends_on {
                if index.get(dep).is_some_and(|dep_index| *dep_index > i) {
                    return Err(SchedulerError::DependencyOrderViolation {
                        item: *id,
                        dependency: *dep,
                    });
                }
            }
        }
        Ok(())
    }
}

fn ranks_before(a: &QueueItem, b: &QueueItem) -> bool {
    a.priority > b.priority || (a.priority == b.priority && a.scheduled_at < b.scheduled_at)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(priority: Priority, offset_secs: i64) -> QueueItem {
        let now = Utc::now();
        QueueItem {
            id: Uuid::new_v4(),
            account_id: "acct".to_string(),
            action_type: ActionType::Like,
            target: "urn:post:1".to_string(),
            payload: serde_json::Value::Null,
            priority,
            status: ItemStatus::Queued,
            scheduled_at: now + Duration::seconds(offset_secs),
            created_at: now,
            processing_started_at: None,
            completed_at: None,
            not_before: None,
            retry_count: 0,
            max_retries: 3,
            last_error: None,
            depends_on: Vec::new(),
            campaign_id: None,
            cancel_requested: false,
        }
    }

    fn depending_on(mut item: QueueItem, deps: &[Uuid]) -> QueueItem {
        item.depends_on = deps.to_vec();
        item
    }

    #[test]
    fn test_priority_then_schedule_order() {
        let mut queue = WorkQueue::new();
        let low = item(Priority::Low, 0);
        let early = item(Priority::Medium, -10);
        let late = item(Priority::Medium, 10);
        let urgent = item(Priority::Urgent, 60);
        let ids = [low.id, early.id, late.id, urgent.id];
        for it in [low, late, urgent, early] {
            queue.insert(it).unwrap();
        }
        assert_eq!(queue.order(), &[ids[3], ids[1], ids[2], ids[0]]);
    }

    #[test]
    fn test_dependent_never_inserted_ahead_of_dependency() {
        let mut queue = WorkQueue::new();
        let first = item(Priority::Low, 0);
        let first_id = first.id;
        queue.insert(first).unwrap();
        queue.insert(item(Priority::Medium, 0)).unwrap();
        let urgent_child = depending_on(item(Priority::Urgent, 0), &[first_id]);
        let child_id = urgent_child.id;
        let position = queue.insert(urgent_child).unwrap();

        assert!(queue.position(first_id).unwrap() < position);
        assert_eq!(queue.position(child_id), Some(position));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let mut queue = WorkQueue::new();
        let orphan = depending_on(item(Priority::Medium, 0), &[Uuid::new_v4()]);
        assert!(matches!(
            queue.insert(orphan),
            Err(SchedulerError::UnknownDependency(_))
        ));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_reorder_permutes_queued_items() {
        let mut queue = WorkQueue::new();
        let a = item(Priority::Medium, 0);
        let b = item(Priority::Medium, 1);
        let c = item(Priority::Medium, 2);
        let (a_id, b_id, c_id) = (a.id, b.id, c.id);
        for it in [a, b, c] {
            queue.insert(it).unwrap();
        }
        let order = queue.reorder(&[c_id, a_id]).unwrap();
        assert_eq!(order, vec![c_id, b_id, a_id]);
    }

    #[test]
    fn test_reorder_rejects_dependency_violation_and_restores() {
        let mut queue = WorkQueue::new();
        let parent = item(Priority::Medium, 0);
        let parent_id = parent.id;
        queue.insert(parent).unwrap();
        let child = depending_on(item(Priority::Medium, 5), &[parent_id]);
        let child_id = child.id;
        queue.insert(child).unwrap();
        let before = queue.order().to_vec();

        let err = queue.reorder(&[child_id, parent_id]).unwrap_err();
        match err {
            SchedulerError::DependencyOrderViolation { item, dependency } => {
                assert_eq!(item, child_id);
                assert_eq!(dependency, parent_id);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(queue.order(), before.as_slice());
    }

    #[test]
    fn test_reorder_only_queued_items() {
        let mut queue = WorkQueue::new();
        let a = item(Priority::Medium, 0);
        let b = item(Priority::Medium, 1);
        let (a_id, b_id) = (a.id, b.id);
        queue.insert(a).unwrap();
        queue.insert(b).unwrap();
        queue.transition(a_id, ItemStatus::Processing, Utc::now()).unwrap();
        assert!(matches!(
            queue.reorder(&[b_id, a_id]),
            Err(SchedulerError::NotQueued(id, ItemStatus::Processing)) if id == a_id
        ));
        assert!(matches!(
            queue.reorder(&[b_id, b_id]),
            Err(SchedulerError::Validation(_))
        ));
    }

    #[test]
    fn test_lowering_priority_stops_at_dependents() {
        let mut queue = WorkQueue::new();
        let parent = item(Priority::High, 0);
        let parent_id = parent.id;
        queue.insert(parent).unwrap();
        queue.insert(item(Priority::Medium, 0)).unwrap();
        let child = depending_on(item(Priority::Medium, 10), &[parent_id]);
        let child_id = child.id;
        queue.insert(child).unwrap();
        queue.insert(item(Priority::Low, 0)).unwrap();

        queue.set_priority(parent_id, Priority::Low).unwrap();
        assert!(queue.position(parent_id).unwrap() < queue.position(child_id).unwrap());
        assert_eq!(queue.get(parent_id).unwrap().priority, Priority::Low);
    }

    #[test]
    fn test_ready_candidates_respect_dependencies_and_backoff() {
        let mut queue = WorkQueue::new();
        let now = Utc::now();
        let parent = item(Priority::Medium, -5);
        let parent_id = parent.id;
        queue.insert(parent).unwrap();
        let child = depending_on(item(Priority::Medium, -5), &[parent_id]);
        let child_id = child.id;
        queue.insert(child).unwrap();
        let mut backing_off = item(Priority::Medium, -5);
        backing_off.not_before = Some(now + Duration::minutes(5));
        queue.insert(backing_off).unwrap();
        queue.insert(item(Priority::Medium, 3600)).unwrap();

        assert_eq!(queue.ready_candidates(now), vec![parent_id]);

        queue.transition(parent_id, ItemStatus::Processing, now).unwrap();
        queue.transition(parent_id, ItemStatus::Completed, now).unwrap();
        assert_eq!(queue.ready_candidates(now), vec![child_id]);
    }

    #[test]
    fn test_removed_item_still_satisfies_dependents() {
        let mut queue = WorkQueue::new();
        let now = Utc::now();
        let parent = item(Priority::Medium, -5);
        let parent_id = parent.id;
        queue.insert(parent).unwrap();
        queue.transition(parent_id, ItemStatus::Processing, now).unwrap();
        queue.transition(parent_id, ItemStatus::Completed, now).unwrap();

        assert_eq!(queue.expired(now, Duration::zero()), vec![parent_id]);
        queue.remove(parent_id).unwrap();
        assert_eq!(queue.status_of(parent_id), Some(ItemStatus::Completed));

        let child = depending_on(item(Priority::Medium, -1), &[parent_id]);
        let child_id = child.id;
        queue.insert(child).unwrap();
        assert_eq!(queue.ready_candidates(now), vec![child_id]);
    }

    #[test]
    fn test_pending_counts_exclude_in_flight() {
        let mut queue = WorkQueue::new();
        let a = item(Priority::Medium, 0);
        let a_id = a.id;
        queue.insert(a).unwrap();
        queue.insert(item(Priority::Medium, 0)).unwrap();
        queue.transition(a_id, ItemStatus::Processing, Utc::now()).unwrap();
        assert_eq!(queue.pending_of_type(ActionType::Like), 1);
        assert_eq!(queue.pending_of_type(ActionType::Comment), 0);
        let counts = queue.counts();
        assert_eq!(counts.queued, 1);
        assert_eq!(counts.processing, 1);
    }

    #[test]
    fn test_transition_stamps_timestamps() {
        let mut queue = WorkQueue::new();
        let a = item(Priority::Medium, 0);
        let a_id = a.id;
        queue.insert(a).unwrap();
        let start = Utc::now();
        queue.transition(a_id, ItemStatus::Processing, start).unwrap();
        let done = queue
            .transition(a_id, ItemStatus::Completed, start + Duration::seconds(1))
            .unwrap();
        assert_eq!(done.processing_started_at, Some(start));
        assert!(done.completed_at.unwrap() >= done.processing_started_at.unwrap());
        assert!(queue.transition(a_id, ItemStatus::Queued, start).is_err());
    }
}
