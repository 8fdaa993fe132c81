//! Per-account serialized worker.
//!
//! One task per account owns the queue, pacing, behaviour tracking, the
//! emergency-stop controller and the broadcast hub. Commands from the REST
//! and WebSocket surfaces arrive over an mpsc channel and are applied in
//! order; dispatch outcomes come back over a second channel. Nothing else
//! mutates queue state.

use std::sync::Arc;
use std::time::Duration;

use cadence_core::config::{CadenceConfig, RetryConfig, WorkingHours};
use cadence_core::events::{AccountSettings, ClientCommand, ServerMessage};
use cadence_core::types::{
    ActionType, AlertSeverity, AutomationOverview, AutomationStatus, ItemStatus, NewQueueItem,
    Priority, QueueAction, QueueItem, QuotaSnapshot, SafetyAlert, SafetyStatus, StopCause,
};
use cadence_safety::{
    AttemptOutcome, BehaviorTracker, EmergencyStopController, Evaluation, QuotaLedger,
    Reservation, SafetyInputs, SafetyScorer,
};
use chrono::{DateTime, Timelike, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broadcast::{BroadcastHub, Subscription};
use crate::client::{ActionClient, ActionOutcome};
use crate::error::{Result, SchedulerError};
use crate::pacing::Pacer;
use crate::queue::WorkQueue;

const COMMAND_BUFFER: usize = 256;
const OUTCOME_BUFFER: usize = 8;

type Reply<T> = oneshot::Sender<T>;

/// Messages accepted by an account worker.
#[derive(Debug)]
pub enum WorkerCommand {
    Schedule {
        item: NewQueueItem,
        reply: Reply<Result<QueueItem>>,
    },
    EmergencyStop {
        reason: Option<String>,
        compliance_violation: bool,
        reply: Reply<AutomationStatus>,
    },
    Resume {
        reply: Reply<Result<ResumeOutcome>>,
    },
    AdminResume {
        operator: String,
        reply: Reply<Result<ResumeOutcome>>,
    },
    Cancel {
        item_id: Uuid,
        reply: Reply<Result<QueueItem>>,
    },
    Retry {
        item_id: Uuid,
        reply: Reply<Result<QueueItem>>,
    },
    UpdatePriority {
        item_id: Uuid,
        priority: Priority,
        reply: Reply<Result<QueueItem>>,
    },
    Reorder {
        item_ids: Vec<Uuid>,
        reply: Reply<Result<Vec<Uuid>>>,
    },
    ClearQueue {
        reply: Reply<usize>,
    },
    AcknowledgeAlert {
        alert_id: Uuid,
        reply: Reply<Result<SafetyStatus>>,
    },
    List {
        reply: Reply<Vec<QueueItem>>,
    },
    Overview {
        reply: Reply<AutomationOverview>,
    },
    Automation {
        reply: Reply<AutomationStatus>,
    },
    Settings {
        reply: Reply<AccountSettings>,
    },
    UpdateSettings {
        settings: AccountSettings,
        reply: Reply<Result<AccountSettings>>,
    },
    Subscribe {
        reply: Reply<Subscription>,
    },
    Detach {
        observer_id: u64,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// Result of a resume or administrative clearance.
#[derive(Debug, Clone, Serialize)]
pub struct ResumeOutcome {
    /// `false` when automation was already running.
    pub resumed: bool,
    pub automation: AutomationStatus,
}

#[derive(Debug)]
struct DispatchResult {
    item_id: Uuid,
    outcome: ActionOutcome,
}

struct InFlight {
    item_id: Uuid,
    reservation: Reservation,
}

struct Timers {
    tick: Duration,
    heartbeat: Duration,
    health: Duration,
}

// =============================================================================
// Handle
// =============================================================================

/// Cloneable front door to one account's worker.
///
/// Mutations are forwarded to the worker task. Safety status and quota are read
/// directly from their shared, internally synchronized owners.
#[derive(Clone)]
pub struct AccountHandle {
    account_id: String,
    commands: mpsc::Sender<WorkerCommand>,
    ledger: Arc<QuotaLedger>,
    scorer: Arc<SafetyScorer>,
}

impl AccountHandle {
    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> WorkerCommand) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| SchedulerError::WorkerUnavailable)?;
        response.await.map_err(|_| SchedulerError::WorkerUnavailable)
    }

    pub async fn schedule(&self, item: NewQueueItem) -> Result<QueueItem> {
        self.request(|reply| WorkerCommand::Schedule { item, reply })
            .await?
    }

    pub async fn emergency_stop(
        &self,
        reason: Option<String>,
        compliance_violation: bool,
    ) -> Result<AutomationStatus> {
        self.request(|reply| WorkerCommand::EmergencyStop {
            reason,
            compliance_violation,
            reply,
        })
        .await
    }

    pub async fn resume(&self) -> Result<ResumeOutcome> {
        self.request(|reply| WorkerCommand::Resume { reply }).await?
    }

    pub async fn admin_resume(&self, operator: impl Into<String>) -> Result<ResumeOutcome> {
        let operator = operator.into();
        self.request(|reply| WorkerCommand::AdminResume { operator, reply })
            .await?
    }

    pub async fn cancel(&self, item_id: Uuid) -> Result<QueueItem> {
        self.request(|reply| WorkerCommand::Cancel { item_id, reply })
            .await?
    }

    pub async fn retry(&self, item_id: Uuid) -> Result<QueueItem> {
        self.request(|reply| WorkerCommand::Retry { item_id, reply })
            .await?
    }

    pub async fn update_priority(&self, item_id: Uuid, priority: Priority) -> Result<QueueItem> {
        self.request(|reply| WorkerCommand::UpdatePriority {
            item_id,
            priority,
            reply,
        })
        .await?
    }

    pub async fn reorder(&self, item_ids: Vec<Uuid>) -> Result<Vec<Uuid>> {
        self.request(|reply| WorkerCommand::Reorder { item_ids, reply })
            .await?
    }

    /// Cancel every non-terminal item. Returns how many were affected.
    pub async fn clear_queue(&self) -> Result<usize> {
        self.request(|reply| WorkerCommand::ClearQueue { reply })
            .await
    }

    pub async fn acknowledge_alert(&self, alert_id: Uuid) -> Result<SafetyStatus> {
        self.request(|reply| WorkerCommand::AcknowledgeAlert { alert_id, reply })
            .await?
    }

    pub async fn list(&self) -> Result<Vec<QueueItem>> {
        self.request(|reply| WorkerCommand::List { reply }).await
    }

    pub async fn overview(&self) -> Result<AutomationOverview> {
        self.request(|reply| WorkerCommand::Overview { reply }).await
    }

    pub async fn automation(&self) -> Result<AutomationStatus> {
        self.request(|reply| WorkerCommand::Automation { reply })
            .await
    }

    pub async fn settings(&self) -> Result<AccountSettings> {
        self.request(|reply| WorkerCommand::Settings { reply }).await
    }

    pub async fn update_settings(&self, settings: AccountSettings) -> Result<AccountSettings> {
        self.request(|reply| WorkerCommand::UpdateSettings { settings, reply })
            .await?
    }

    /// Attach an observer. The first envelope on the subscription is a snapshot.
    pub async fn subscribe(&self) -> Result<Subscription> {
        self.request(|reply| WorkerCommand::Subscribe { reply })
            .await
    }

    pub async fn detach(&self, observer_id: u64) {
        let _ = self
            .commands
            .send(WorkerCommand::Detach { observer_id })
            .await;
    }

    /// Stop the worker loop. Queued items are dropped with it.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| WorkerCommand::Shutdown { reply }).await
    }

    /// Latest published safety status, without a round trip to the worker.
    pub fn safety_status(&self) -> Arc<SafetyStatus> {
        self.scorer.current()
    }

    /// Full alert history, newest first.
    pub fn alerts(&self) -> Vec<SafetyAlert> {
        self.scorer.alert_history()
    }

    pub fn quota(&self) -> QuotaSnapshot {
        self.ledger.snapshot()
    }

    /// Apply an observer command. Returns the payload for the command result.
    pub async fn execute(&self, command: ClientCommand) -> Result<Option<serde_json::Value>> {
        let data = match command {
            ClientCommand::ScheduleConnection { request, note } => {
                let payload = match note {
                    Some(note) => serde_json::json!({ "note": note }),
                    None => serde_json::Value::Null,
                };
                let item = self
                    .schedule(request.into_item(ActionType::Connection, payload))
                    .await?;
                serde_json::to_value(item)?
            }
            ClientCommand::ScheduleEngagement {
                engagement,
                request,
                comment,
            } => {
                let action_type = ActionType::from(engagement);
                let payload = match comment {
                    Some(comment) => serde_json::json!({ "comment": comment }),
                    None => serde_json::Value::Null,
                };
                let item = self.schedule(request.into_item(action_type, payload)).await?;
                serde_json::to_value(item)?
            }
            ClientCommand::EmergencyStop {
                reason,
                compliance_violation,
            } => serde_json::to_value(self.emergency_stop(reason, compliance_violation).await?)?,
            ClientCommand::Resume => serde_json::to_value(self.resume().await?)?,
            ClientCommand::AdminResume { operator } => {
                serde_json::to_value(self.admin_resume(operator).await?)?
            }
            ClientCommand::CancelItem { item_id } => {
                serde_json::to_value(self.cancel(item_id).await?)?
            }
            ClientCommand::RetryItem { item_id } => {
                serde_json::to_value(self.retry(item_id).await?)?
            }
            ClientCommand::UpdatePriority { item_id, priority } => {
                serde_json::to_value(self.update_priority(item_id, priority).await?)?
            }
            ClientCommand::Reorder { item_ids } => {
                serde_json::json!({ "order": self.reorder(item_ids).await? })
            }
            ClientCommand::ClearQueue => {
                serde_json::json!({ "cancelled": self.clear_queue().await? })
            }
            ClientCommand::AcknowledgeAlert { alert_id } => {
                serde_json::to_value(self.acknowledge_alert(alert_id).await?)?
            }
            ClientCommand::HeartbeatAck => return Ok(None),
        };
        Ok(Some(data))
    }
}

// =============================================================================
// Worker
// =============================================================================

pub struct AccountWorker {
    account_id: String,
    queue: WorkQueue,
    pacer: Pacer,
    behavior: BehaviorTracker,
    stop: EmergencyStopController,
    ledger: Arc<QuotaLedger>,
    scorer: Arc<SafetyScorer>,
    hub: BroadcastHub,
    client: Arc<dyn ActionClient>,
    outcome_tx: mpsc::Sender<DispatchResult>,
    in_flight: Option<InFlight>,
    retry: RetryConfig,
    action_timeout: Duration,
    working_hours: Option<WorkingHours>,
}

impl AccountWorker {
    /// Start the worker task for `account_id` and return its handle.
    pub fn spawn(
        account_id: impl Into<String>,
        config: &CadenceConfig,
        client: Arc<dyn ActionClient>,
    ) -> Result<AccountHandle> {
        let account_id = account_id.into();
        let ledger = Arc::new(QuotaLedger::new(&config.quota)?);
        let scorer = Arc::new(SafetyScorer::new(config.safety.clone()));
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (outcome_tx, outcome_rx) = mpsc::channel(OUTCOME_BUFFER);

        let worker = AccountWorker {
            account_id: account_id.clone(),
            queue: WorkQueue::new(),
            pacer: Pacer::new(config.pacing.delays, &config.retry),
            behavior: BehaviorTracker::new(
                config.safety.error_window,
                chrono::Duration::seconds(config.safety.signal_horizon_secs as i64),
                config.pacing.working_hours,
            ),
            stop: EmergencyStopController::new(&config.safety),
            ledger: Arc::clone(&ledger),
            scorer: Arc::clone(&scorer),
            hub: BroadcastHub::new(account_id.clone(), &config.broadcast),
            client,
            outcome_tx,
            in_flight: None,
            retry: config.retry.clone(),
            action_timeout: Duration::from_secs(config.pacing.action_timeout_secs.max(1)),
            working_hours: config.pacing.working_hours,
        };
        let timers = Timers {
            tick: Duration::from_millis(config.pacing.tick_interval_ms.max(1)),
            heartbeat: Duration::from_secs(config.broadcast.heartbeat_interval_secs.max(1)),
            health: Duration::from_secs(config.safety.health_check_interval_secs.max(1)),
        };
        tokio::spawn(worker.run(command_rx, outcome_rx, timers));

        Ok(AccountHandle {
            account_id,
            commands: command_tx,
            ledger,
            scorer,
        })
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<WorkerCommand>,
        mut outcomes: mpsc::Receiver<DispatchResult>,
        timers: Timers,
    ) {
        let mut tick = interval(timers.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut heartbeat = interval(timers.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut health = interval(timers.health);
        health.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(account_id = %self.account_id, "Account worker started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(WorkerCommand::Shutdown { reply }) => {
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle(command),
                    None => break,
                },
                Some(result) = outcomes.recv() => self.on_outcome(result),
                _ = tick.tick() => self.on_tick(),
                _ = heartbeat.tick() => self.hub.heartbeat(),
                _ = health.tick() => self.evaluate_safety(Utc::now()),
            }
        }

        if let Some(in_flight) = self.in_flight.take() {
            self.ledger.release(in_flight.reservation);
        }
        info!(account_id = %self.account_id, "Account worker stopped");
    }

    fn handle(&mut self, command: WorkerCommand) {
        match command {
            WorkerCommand::Schedule { item, reply } => {
                let _ = reply.send(self.schedule(item));
            }
            WorkerCommand::EmergencyStop {
                reason,
                compliance_violation,
                reply,
            } => {
                let _ = reply.send(self.emergency_stop(reason, compliance_violation));
            }
            WorkerCommand::Resume { reply } => {
                let resumed = self.stop.resume(Utc::now()).map_err(SchedulerError::from);
                let _ = reply.send(resumed.map(|resumed| self.after_resume(resumed)));
            }
            WorkerCommand::AdminResume { operator, reply } => {
                let _ = reply.send(self.admin_resume(&operator));
            }
            WorkerCommand::Cancel { item_id, reply } => {
                let _ = reply.send(self.cancel(item_id));
            }
            WorkerCommand::Retry { item_id, reply } => {
                let _ = reply.send(self.retry_item(item_id));
            }
            WorkerCommand::UpdatePriority {
                item_id,
                priority,
                reply,
            } => {
                let _ = reply.send(self.update_priority(item_id, priority));
            }
            WorkerCommand::Reorder { item_ids, reply } => {
                let _ = reply.send(self.reorder(&item_ids));
            }
            WorkerCommand::ClearQueue { reply } => {
                let _ = reply.send(self.clear_queue());
            }
            WorkerCommand::AcknowledgeAlert { alert_id, reply } => {
                let _ = reply.send(self.acknowledge_alert(alert_id));
            }
            WorkerCommand::List { reply } => {
                let _ = reply.send(self.queue.items());
            }
            WorkerCommand::Overview { reply } => {
                let _ = reply.send(self.overview());
            }
            WorkerCommand::Automation { reply } => {
                let _ = reply.send(self.automation_status());
            }
            WorkerCommand::Settings { reply } => {
                let _ = reply.send(self.settings());
            }
            WorkerCommand::UpdateSettings { settings, reply } => {
                let _ = reply.send(self.update_settings(settings));
            }
            WorkerCommand::Subscribe { reply } => {
                let snapshot = self.snapshot();
                let _ = reply.send(self.hub.attach(snapshot));
            }
            WorkerCommand::Detach { observer_id } => self.hub.detach(observer_id),
            // Handled by the loop before dispatching here.
            WorkerCommand::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    // =========================================================================
    // Commands
    // =========================================================================

    fn schedule(&mut self, new: NewQueueItem) -> Result<QueueItem> {
        let action_type = new
            .action_type
            .ok_or_else(|| SchedulerError::Validation("action_type is required".to_string()))?;
        let target = new.target.trim();
        if target.is_empty() {
            return Err(SchedulerError::Validation(
                "target must not be empty".to_string(),
            ));
        }
        if action_type == ActionType::Comment
            && new.payload.get("comment").and_then(|c| c.as_str()).map_or(true, str::is_empty)
        {
            return Err(SchedulerError::Validation(
                "comment actions need comment text".to_string(),
            ));
        }
        let max_retries = new.max_retries.unwrap_or(self.retry.max_retries);
        if max_retries == 0 {
            return Err(SchedulerError::Validation(
                "max_retries must be at least 1".to_string(),
            ));
        }

        // Every admitted item must fit under the ceiling once dispatched.
        let pending = self.queue.pending_of_type(action_type);
        self.ledger.check_admission(action_type, pending + 1)?;

        let now = Utc::now();
        let mut depends_on = new.depends_on;
        depends_on.sort_unstable();
        depends_on.dedup();
        let item = QueueItem {
            id: Uuid::new_v4(),
            account_id: self.account_id.clone(),
            action_type,
            target: target.to_string(),
            payload: new.payload,
            priority: new.priority,
            status: ItemStatus::Queued,
            scheduled_at: new.scheduled_at.unwrap_or(now),
            created_at: now,
            processing_started_at: None,
            completed_at: None,
            not_before: None,
            retry_count: 0,
            max_retries,
            last_error: None,
            depends_on,
            campaign_id: new.campaign_id,
            cancel_requested: false,
        };
        let position = self.queue.insert(item.clone())?;
        debug!(
            account_id = %self.account_id,
            item_id = %item.id,
            action_type = %action_type,
            position,
            "Queue item scheduled"
        );
        self.hub.publish(ServerMessage::QueueUpdate {
            action: QueueAction::Added,
            item: item.clone(),
            position: Some(position),
        });
        Ok(item)
    }

    fn emergency_stop(&mut self, reason: Option<String>, compliance: bool) -> AutomationStatus {
        let cause = if compliance {
            StopCause::ComplianceViolation
        } else {
            StopCause::Manual
        };
        let reason = reason
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| "Emergency stop requested by operator".to_string());
        if self
            .stop
            .trigger(cause, reason, Utc::now(), self.in_flight.is_some())
        {
            self.on_phase_change();
        }
        self.automation_status()
    }

    fn after_resume(&mut self, resumed: bool) -> ResumeOutcome {
        if resumed {
            self.on_phase_change();
        }
        ResumeOutcome {
            resumed,
            automation: self.automation_status(),
        }
    }

    fn admin_resume(&mut self, operator: &str) -> Result<ResumeOutcome> {
        if operator.trim().is_empty() {
            return Err(SchedulerError::Validation(
                "operator must be named for administrative clearance".to_string(),
            ));
        }
        let resumed = self.stop.admin_resume(operator)?;
        Ok(self.after_resume(resumed))
    }

    fn cancel(&mut self, item_id: Uuid) -> Result<QueueItem> {
        let now = Utc::now();
        let status = self
            .queue
            .get(item_id)
            .ok_or(SchedulerError::ItemNotFound(item_id))?
            .status;
        match status {
            ItemStatus::Processing => {
                // The external call cannot be aborted; the outcome handler
                // finalizes the item instead of requeueing it.
                if let Some(item) = self.queue.get_mut(item_id) {
                    item.cancel_requested = true;
                }
                self.publish_item(QueueAction::Updated, item_id);
            }
            ItemStatus::Queued | ItemStatus::RateLimited => {
                self.queue.transition(item_id, ItemStatus::Cancelled, now)?;
                info!(account_id = %self.account_id, item_id = %item_id, "Queue item cancelled");
                self.publish_item(QueueAction::Updated, item_id);
                self.cascade_cancel(item_id, now);
            }
            other => return Err(SchedulerError::InvalidTransition(other, ItemStatus::Cancelled)),
        }
        self.item(item_id)
    }

    fn retry_item(&mut self, item_id: Uuid) -> Result<QueueItem> {
        let item = self.item(item_id)?;
        match item.status {
            ItemStatus::Failed => {
                self.ledger
                    .check_admission(item.action_type, self.queue.pending_of_type(item.action_type) + 1)?;
                self.queue
                    .transition(item_id, ItemStatus::Queued, Utc::now())?;
                if let Some(item) = self.queue.get_mut(item_id) {
                    item.retry_count = 0;
                    item.not_before = None;
                }
                // Re-placing through set_priority moves the item to its rank slot.
                self.queue.set_priority(item_id, item.priority)?;
                info!(account_id = %self.account_id, item_id = %item_id, "Failed item requeued");
                self.publish_item(QueueAction::Updated, item_id);
                self.item(item_id)
            }
            ItemStatus::Cancelled => self.schedule(NewQueueItem {
                action_type: Some(item.action_type),
                target: item.target,
                payload: item.payload,
                priority: item.priority,
                scheduled_at: None,
                max_retries: Some(item.max_retries),
                depends_on: item.depends_on,
                campaign_id: item.campaign_id,
            }),
            ItemStatus::Queued => {
                if let Some(queued) = self.queue.get_mut(item_id) {
                    queued.not_before = None;
                }
                self.publish_item(QueueAction::Updated, item_id);
                self.item(item_id)
            }
            other => Err(SchedulerError::InvalidTransition(other, ItemStatus::Queued)),
        }
    }

    fn update_priority(&mut self, item_id: Uuid, priority: Priority) -> Result<QueueItem> {
        let position = self.queue.set_priority(item_id, priority)?;
        debug!(account_id = %self.account_id, item_id = %item_id, %priority, position, "Priority updated");
        self.publish_item(QueueAction::Updated, item_id);
        self.item(item_id)
    }

    fn reorder(&mut self, item_ids: &[Uuid]) -> Result<Vec<Uuid>> {
        let order = self.queue.reorder(item_ids)?;
        self.hub.publish(ServerMessage::QueueReordered {
            order: order.clone(),
        });
        Ok(order)
    }

    fn clear_queue(&mut self) -> usize {
        let now = Utc::now();
        let open = self.queue.open_items();
        for id in &open {
            let processing = self
                .queue
                .get(*id)
                .is_some_and(|item| item.status == ItemStatus::Processing);
            if processing {
                if let Some(item) = self.queue.get_mut(*id) {
                    item.cancel_requested = true;
                }
            } else if let Err(e) = self.queue.transition(*id, ItemStatus::Cancelled, now) {
                warn!(account_id = %self.account_id, item_id = %id, error = %e, "Could not cancel item");
                continue;
            }
            self.publish_item(QueueAction::Updated, *id);
        }
        info!(account_id = %self.account_id, cancelled = open.len(), "Queue cleared");
        open.len()
    }

    fn acknowledge_alert(&mut self, alert_id: Uuid) -> Result<SafetyStatus> {
        let now = Utc::now();
        let evaluation = self
            .scorer
            .acknowledge(alert_id, now)
            .ok_or(SchedulerError::AlertNotFound(alert_id))?;
        let status = (*evaluation.status).clone();
        self.publish_evaluation(evaluation, now);
        Ok(status)
    }

    fn settings(&self) -> AccountSettings {
        AccountSettings {
            limits: self.ledger.limits(),
            delays: self.pacer.delays(),
            working_hours: self.working_hours,
        }
    }

    fn update_settings(&mut self, settings: AccountSettings) -> Result<AccountSettings> {
        settings
            .delays
            .validate()
            .map_err(|e| SchedulerError::Validation(e.to_string()))?;
        if let Some(hours) = settings.working_hours {
            hours
                .validate()
                .map_err(|e| SchedulerError::Validation(e.to_string()))?;
        }
        self.ledger.set_limits(settings.limits)?;
        self.pacer.set_delays(settings.delays);
        self.working_hours = settings.working_hours;
        self.behavior.set_working_hours(settings.working_hours);
        info!(
            account_id = %self.account_id,
            working_hours = ?settings.working_hours,
            "Account settings updated"
        );
        self.hub.publish(ServerMessage::QuotaUpdate {
            quota: self.ledger.snapshot(),
        });
        Ok(self.settings())
    }

    // =========================================================================
    // Dispatch loop
    // =========================================================================

    fn on_tick(&mut self) {
        let now = Utc::now();
        if self.stop.tick(now, self.in_flight.is_some()) {
            self.on_phase_change();
        }
        self.purge_expired(now);
        self.requeue_cooled_down(now);

        if self.in_flight.is_some() || !self.stop.may_dispatch() || !self.within_working_hours(now) {
            return;
        }
        for item_id in self.queue.ready_candidates(now) {
            let Some(action_type) = self.queue.get(item_id).map(|item| item.action_type) else {
                continue;
            };
            if !self.pacer.is_ready(action_type, now) {
                continue;
            }
            match self.ledger.reserve_at(action_type, now) {
                Ok(reservation) => {
                    self.dispatch(item_id, reservation, now);
                    return;
                }
                Err(denied) => {
                    debug!(account_id = %self.account_id, item_id = %item_id, reason = %denied, "Dispatch deferred");
                }
            }
        }
    }

    fn dispatch(&mut self, item_id: Uuid, reservation: Reservation, now: DateTime<Utc>) {
        let item = match self.queue.transition(item_id, ItemStatus::Processing, now) {
            Ok(item) => item.clone(),
            Err(e) => {
                warn!(account_id = %self.account_id, item_id = %item_id, error = %e, "Could not start dispatch");
                self.ledger.release(reservation);
                return;
            }
        };
        self.pacer.record_dispatch(item.action_type, now);
        self.behavior.record_dispatch(item.action_type, now);
        self.in_flight = Some(InFlight {
            item_id,
            reservation,
        });
        self.publish_item(QueueAction::Updated, item_id);
        info!(
            account_id = %self.account_id,
            item_id = %item_id,
            action_type = %item.action_type,
            attempt = item.retry_count + 1,
            "Dispatching queue item"
        );

        let client = Arc::clone(&self.client);
        let outcomes = self.outcome_tx.clone();
        let account_id = self.account_id.clone();
        let timeout = self.action_timeout;
        tokio::spawn(async move {
            let outcome = match tokio::time::timeout(timeout, client.perform(&account_id, &item)).await {
                Ok(outcome) => outcome,
                Err(_) => ActionOutcome::TransientFailure(format!(
                    "action timed out after {}s",
                    timeout.as_secs()
                )),
            };
            let _ = outcomes
                .send(DispatchResult {
                    item_id: item.id,
                    outcome,
                })
                .await;
        });
    }

    fn on_outcome(&mut self, result: DispatchResult) {
        let now = Utc::now();
        let Some(in_flight) = self.in_flight.take() else {
            warn!(account_id = %self.account_id, item_id = %result.item_id, "Outcome without an in-flight dispatch");
            return;
        };
        if in_flight.item_id != result.item_id {
            warn!(account_id = %self.account_id, item_id = %result.item_id, "Outcome for an unexpected item");
        }
        let item_id = in_flight.item_id;
        let reservation = in_flight.reservation;
        let cancel_requested = self
            .queue
            .get(item_id)
            .is_some_and(|item| item.cancel_requested);

        match result.outcome {
            ActionOutcome::Success => {
                self.ledger
                    .commit_at(reservation, AttemptOutcome::Succeeded, now);
                self.behavior.record_outcome(AttemptOutcome::Succeeded, now);
                info!(account_id = %self.account_id, item_id = %item_id, "Queue item completed");
                self.finish(item_id, ItemStatus::Completed, now);
            }
            ActionOutcome::TransientFailure(error) => {
                self.ledger.commit_at(reservation, AttemptOutcome::Failed, now);
                self.behavior.record_outcome(AttemptOutcome::Failed, now);
                self.on_failure(item_id, error, cancel_requested, now);
            }
            ActionOutcome::RateLimited { retry_after } => {
                self.ledger
                    .commit_at(reservation, AttemptOutcome::RateLimited, now);
                self.behavior
                    .record_outcome(AttemptOutcome::RateLimited, now);
                self.on_rate_limited(item_id, retry_after, cancel_requested, now);
            }
            ActionOutcome::Restricted { reason } => {
                self.ledger.commit_at(reservation, AttemptOutcome::Failed, now);
                self.behavior.record_outcome(AttemptOutcome::Failed, now);
                self.on_restricted(item_id, reason, cancel_requested, now);
            }
        }

        if self.stop.on_drained(now) {
            self.on_phase_change();
        }
        self.evaluate_safety(now);
        self.hub.publish(ServerMessage::QuotaUpdate {
            quota: self.ledger.snapshot_at(now),
        });
    }

    fn on_failure(&mut self, item_id: Uuid, error: String, cancel_requested: bool, now: DateTime<Utc>) {
        let Some(item) = self.queue.get_mut(item_id) else {
            return;
        };
        item.retry_count += 1;
        item.last_error = Some(error.clone());
        let retry_count = item.retry_count;
        let exhausted = retry_count >= item.max_retries;

        if cancel_requested {
            self.finish(item_id, ItemStatus::Cancelled, now);
            return;
        }
        if exhausted {
            warn!(
                account_id = %self.account_id,
                item_id = %item_id,
                retries = retry_count,
                error = %error,
                "Queue item failed permanently"
            );
            self.finish(item_id, ItemStatus::Failed, now);
            let (alert, evaluation) = self.scorer.raise(
                AlertSeverity::Warning,
                format!("Item {} failed after {} attempts: {}", item_id, retry_count, error),
                now,
            );
            self.hub.publish(ServerMessage::SafetyAlert { alert });
            self.publish_evaluation(evaluation, now);
            return;
        }

        let delay = self.pacer.backoff(retry_count);
        if let Err(e) = self.requeue(item_id, now + delay, now) {
            warn!(account_id = %self.account_id, item_id = %item_id, error = %e, "Could not requeue item");
            return;
        }
        info!(
            account_id = %self.account_id,
            item_id = %item_id,
            attempt = retry_count,
            backoff_ms = delay.num_milliseconds(),
            error = %error,
            "Queue item failed; retry scheduled"
        );
    }

    fn on_rate_limited(
        &mut self,
        item_id: Uuid,
        retry_after: Option<Duration>,
        cancel_requested: bool,
        now: DateTime<Utc>,
    ) {
        let Some(action_type) = self.queue.get(item_id).map(|item| item.action_type) else {
            return;
        };
        let cooldown = retry_after
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .unwrap_or_else(|| chrono::Duration::seconds(self.retry.rate_limit_cooldown_secs as i64));
        let until = now + cooldown;
        self.pacer.freeze(action_type, until);
        warn!(
            account_id = %self.account_id,
            item_id = %item_id,
            %action_type,
            frozen_until = %until,
            "Rate limited by platform; action type frozen"
        );

        if let Some(item) = self.queue.get_mut(item_id) {
            item.last_error = Some(format!("rate limited; retry after {}", until));
        }
        if cancel_requested {
            self.finish(item_id, ItemStatus::Cancelled, now);
            return;
        }
        match self.queue.transition(item_id, ItemStatus::RateLimited, now) {
            Ok(item) => item.not_before = Some(until),
            Err(e) => {
                warn!(account_id = %self.account_id, item_id = %item_id, error = %e, "Could not park rate-limited item");
                return;
            }
        }
        self.publish_item(QueueAction::Updated, item_id);
    }

    fn on_restricted(
        &mut self,
        item_id: Uuid,
        reason: String,
        cancel_requested: bool,
        now: DateTime<Utc>,
    ) {
        if let Some(item) = self.queue.get_mut(item_id) {
            item.last_error = Some(reason.clone());
        }
        if cancel_requested {
            self.finish(item_id, ItemStatus::Cancelled, now);
        } else if let Err(e) = self.requeue(item_id, now, now) {
            warn!(account_id = %self.account_id, item_id = %item_id, error = %e, "Could not requeue item");
        }
        if self.stop.trigger(
            StopCause::ComplianceViolation,
            format!("Platform restricted the account: {}", reason),
            now,
            false,
        ) {
            self.on_phase_change();
        }
    }

    /// Move a processing item to a terminal status and notify observers.
    fn finish(&mut self, item_id: Uuid, status: ItemStatus, now: DateTime<Utc>) {
        if let Err(e) = self.queue.transition(item_id, status, now) {
            warn!(account_id = %self.account_id, item_id = %item_id, error = %e, "Could not finalize item");
            return;
        }
        self.publish_item(QueueAction::Updated, item_id);
        if matches!(status, ItemStatus::Failed | ItemStatus::Cancelled) {
            self.cascade_cancel(item_id, now);
        }
    }

    /// Processing -> Failed -> Queued, eligible again from `not_before`.
    fn requeue(&mut self, item_id: Uuid, not_before: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
        self.queue.transition(item_id, ItemStatus::Failed, now)?;
        let item = self.queue.transition(item_id, ItemStatus::Queued, now)?;
        item.not_before = Some(not_before);
        self.publish_item(QueueAction::Updated, item_id);
        Ok(())
    }

    /// Cancel open items that can no longer run because `root` ended unsuccessfully.
    fn cascade_cancel(&mut self, root: Uuid, now: DateTime<Utc>) {
        let mut pending = vec![root];
        while let Some(ended) = pending.pop() {
            let Some(status) = self.queue.status_of(ended) else {
                continue;
            };
            for dependent in self.queue.dependents_of(ended) {
                let Some(item) = self.queue.get_mut(dependent) else {
                    continue;
                };
                item.last_error = Some(format!("dependency {} ended as {}", ended, status));
                if item.status == ItemStatus::Processing {
                    item.cancel_requested = true;
                } else if self
                    .queue
                    .transition(dependent, ItemStatus::Cancelled, now)
                    .is_ok()
                {
                    debug!(account_id = %self.account_id, item_id = %dependent, dependency = %ended, "Dependent item cancelled");
                    pending.push(dependent);
                }
                self.publish_item(QueueAction::Updated, dependent);
            }
        }
    }

    fn purge_expired(&mut self, now: DateTime<Utc>) {
        let retention = chrono::Duration::seconds(self.retry.retention_secs as i64);
        for id in self.queue.expired(now, retention) {
            if let Some(item) = self.queue.remove(id) {
                self.hub.publish(ServerMessage::QueueUpdate {
                    action: QueueAction::Removed,
                    item,
                    position: None,
                });
            }
        }
    }

    fn requeue_cooled_down(&mut self, now: DateTime<Utc>) {
        for id in self.queue.cooled_down(now) {
            match self.queue.transition(id, ItemStatus::Queued, now) {
                Ok(_) => {
                    debug!(account_id = %self.account_id, item_id = %id, "Rate-limit cool-down over");
                    self.publish_item(QueueAction::Updated, id);
                }
                Err(e) => warn!(account_id = %self.account_id, item_id = %id, error = %e, "Could not requeue item"),
            }
        }
    }

    fn within_working_hours(&self, now: DateTime<Utc>) -> bool {
        self.working_hours
            .map_or(true, |hours| hours.contains(now.hour()))
    }

    // =========================================================================
    // Safety and publication
    // =========================================================================

    fn evaluate_safety(&mut self, now: DateTime<Utc>) {
        let inputs = SafetyInputs {
            utilization: self.ledger.snapshot_at(now).peak_utilization(),
            error_rate: self.behavior.error_rate(now),
            risk_factors: self.behavior.risk_factors(now),
        };
        let evaluation = self.scorer.evaluate(inputs, now);
        self.publish_evaluation(evaluation, now);
    }

    /// Publish an evaluation and feed it to the stop controller, alert first so
    /// observers see why a stop happened before they see the stop.
    fn publish_evaluation(&mut self, evaluation: Evaluation, now: DateTime<Utc>) {
        if let Some(alert) = evaluation.transition {
            self.hub.publish(ServerMessage::SafetyAlert { alert });
        }
        let in_flight = self.in_flight.is_some();
        if self.stop.observe_score(&evaluation.status, now, in_flight) {
            self.on_phase_change();
        } else {
            self.hub.publish(ServerMessage::SafetyUpdate {
                status: (*evaluation.status).clone(),
            });
        }
    }

    fn on_phase_change(&mut self) {
        let status = self.scorer.set_suspended(!self.stop.may_dispatch());
        self.hub.publish(ServerMessage::SafetyUpdate {
            status: (*status).clone(),
        });
        let automation = self.automation_status();
        self.hub
            .publish(ServerMessage::AutomationStatus { status: automation });
    }

    fn publish_item(&mut self, action: QueueAction, item_id: Uuid) {
        let Some(item) = self.queue.get(item_id).cloned() else {
            return;
        };
        let position = self.queue.position(item_id);
        self.hub.publish(ServerMessage::QueueUpdate {
            action,
            item,
            position,
        });
    }

    fn item(&self, item_id: Uuid) -> Result<QueueItem> {
        self.queue
            .get(item_id)
            .cloned()
            .ok_or(SchedulerError::ItemNotFound(item_id))
    }

    fn automation_status(&self) -> AutomationStatus {
        self.stop
            .status(self.in_flight.as_ref().map(|f| f.item_id))
    }

    fn snapshot(&self) -> ServerMessage {
        ServerMessage::Snapshot {
            queue: self.queue.items(),
            safety: (*self.scorer.current()).clone(),
            automation: self.automation_status(),
            quota: self.ledger.snapshot(),
        }
    }

    fn overview(&self) -> AutomationOverview {
        let safety = self.scorer.current();
        AutomationOverview {
            account_id: self.account_id.clone(),
            counts: self.queue.counts(),
            safety_score: safety.score,
            safety_band: safety.band,
            overall: safety.overall,
            active_alerts: safety.active_alerts.len(),
            automation: self.automation_status(),
            quota: self.ledger.snapshot(),
        }
    }
}
