//! Wire model for the per-account observer channel.
//!
//! Outbound deltas and inbound commands are closed sets of tagged variants.
//! The transport only (de)serializes them; each component dispatches them
//! through a single typed `match`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{ActionDelays, ActionLimits, WorkingHours};
use crate::types::{
    ActionType, AutomationStatus, NewQueueItem, Priority, QueueAction, QueueItem, QuotaSnapshot,
    SafetyAlert, SafetyStatus, Timestamp,
};

/// Every state change an observer can receive.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Full state, always the first message on a new subscription.
    Snapshot {
        queue: Vec<QueueItem>,
        safety: SafetyStatus,
        automation: AutomationStatus,
        quota: QuotaSnapshot,
    },
    /// `position` is the item's index in the full queue order after the change;
    /// absent for removals.
    QueueUpdate {
        action: QueueAction,
        item: QueueItem,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        position: Option<usize>,
    },
    /// Explicit reorder of queued items; `order` lists the full queue order afterwards.
    QueueReordered {
        order: Vec<Uuid>,
    },
    SafetyUpdate {
        status: SafetyStatus,
    },
    SafetyAlert {
        alert: SafetyAlert,
    },
    AutomationStatus {
        status: AutomationStatus,
    },
    QuotaUpdate {
        quota: QuotaSnapshot,
    },
    Heartbeat,
    /// Reply to an inbound command, correlated by `request_id`.
    CommandResult {
        request_id: Option<String>,
        ok: bool,
        error: Option<String>,
        /// Same code a REST caller would see in the error body.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn event_name(&self) -> &'static str {
        match self {
            ServerMessage::Snapshot { .. } => "snapshot",
            ServerMessage::QueueUpdate { .. } => "queue_update",
            ServerMessage::QueueReordered { .. } => "queue_reordered",
            ServerMessage::SafetyUpdate { .. } => "safety_update",
            ServerMessage::SafetyAlert { .. } => "safety_alert",
            ServerMessage::AutomationStatus { .. } => "automation_status",
            ServerMessage::QuotaUpdate { .. } => "quota_update",
            ServerMessage::Heartbeat => "heartbeat",
            ServerMessage::CommandResult { .. } => "command_result",
            ServerMessage::Error { .. } => "error",
        }
    }
}

/// Sequenced, timestamped wrapper around every outbound message.
///
/// `seq` is strictly increasing per account; observers discard anything at or
/// below the last sequence they applied.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub seq: u64,
    pub account_id: String,
    pub timestamp: Timestamp,
    #[serde(flatten)]
    pub message: ServerMessage,
}

impl Envelope {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"type":"error","message":"serialization failed: {}"}}"#, e)
        })
    }
}

/// Engagement actions accepted by `schedule_engagement`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngagementKind {
    Like,
    Comment,
    ViewProfile,
    Follow,
}

impl From<EngagementKind> for ActionType {
    fn from(kind: EngagementKind) -> Self {
        match kind {
            EngagementKind::Like => ActionType::Like,
            EngagementKind::Comment => ActionType::Comment,
            EngagementKind::ViewProfile => ActionType::ViewProfile,
            EngagementKind::Follow => ActionType::Follow,
        }
    }
}

/// Fields shared by both schedule commands.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRequest {
    pub target: String,
    #[serde(default)]
    pub priority: Priority,
    pub scheduled_at: Option<chrono::DateTime<chrono::Utc>>,
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub depends_on: Vec<Uuid>,
    pub campaign_id: Option<String>,
}

impl ScheduleRequest {
    pub fn into_item(self, action_type: ActionType, payload: serde_json::Value) -> NewQueueItem {
        NewQueueItem {
            action_type: Some(action_type),
            target: self.target,
            payload,
            priority: self.priority,
            scheduled_at: self.scheduled_at,
            max_retries: self.max_retries,
            depends_on: self.depends_on,
            campaign_id: self.campaign_id,
        }
    }
}

/// Per-account settings surface.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccountSettings {
    pub limits: ActionLimits,
    pub delays: ActionDelays,
    /// UTC hours in which dispatch may run; `None` means around the clock.
    #[serde(default)]
    pub working_hours: Option<WorkingHours>,
}

/// Every command an observer may send.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    ScheduleConnection {
        #[serde(flatten)]
        request: ScheduleRequest,
        note: Option<String>,
    },
    ScheduleEngagement {
        engagement: EngagementKind,
        #[serde(flatten)]
        request: ScheduleRequest,
        comment: Option<String>,
    },
    EmergencyStop {
        reason: Option<String>,
        #[serde(default)]
        compliance_violation: bool,
    },
    Resume,
    /// Administrative clearance of a compliance stop.
    AdminResume {
        operator: String,
    },
    CancelItem {
        item_id: Uuid,
    },
    RetryItem {
        item_id: Uuid,
    },
    UpdatePriority {
        item_id: Uuid,
        priority: Priority,
    },
    Reorder {
        item_ids: Vec<Uuid>,
    },
    ClearQueue,
    AcknowledgeAlert {
        alert_id: Uuid,
    },
    HeartbeatAck,
}

/// Inbound frame: a command plus an optional correlation id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandFrame {
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub command: ClientCommand,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_envelope_shape() {
        let env = Envelope {
            seq: 7,
            account_id: "acct-1".to_string(),
            timestamp: Timestamp(1_700_000_000_000),
            message: ServerMessage::Heartbeat,
        };
        let value: serde_json::Value = serde_json::from_str(&env.to_json()).unwrap();
        assert_eq!(value["type"], "heartbeat");
        assert_eq!(value["seq"], 7);
        assert_eq!(value["account_id"], "acct-1");
        assert_eq!(value["timestamp"], 1_700_000_000_000i64);
    }

    #[test]
    fn test_parse_schedule_connection_frame() {
        let json = r#"{
            "request_id": "r-1",
            "type": "schedule_connection",
            "target": "https://example.com/in/jane",
            "priority": "high",
            "note": "Hi Jane"
        }"#;
        let frame: CommandFrame = serde_json::from_str(json).unwrap();
        assert_eq!(frame.request_id.as_deref(), Some("r-1"));
        match frame.command {
            ClientCommand::ScheduleConnection { request, note } => {
                assert_eq!(request.target, "https://example.com/in/jane");
                assert_eq!(request.priority, Priority::High);
                assert!(request.depends_on.is_empty());
                assert_eq!(note.as_deref(), Some("Hi Jane"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_engagement_frame() {
        let json = r#"{"type":"schedule_engagement","engagement":"comment","target":"urn:post:1","comment":"Great read"}"#;
        let frame: CommandFrame = serde_json::from_str(json).unwrap();
        match frame.command {
            ClientCommand::ScheduleEngagement {
                engagement,
                request,
                comment,
            } => {
                assert_eq!(ActionType::from(engagement), ActionType::Comment);
                assert_eq!(request.priority, Priority::Medium);
                assert_eq!(comment.as_deref(), Some("Great read"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_unit_commands() {
        let frame: CommandFrame = serde_json::from_str(r#"{"type":"resume"}"#).unwrap();
        assert_eq!(frame.command, ClientCommand::Resume);
        assert!(frame.request_id.is_none());

        let frame: CommandFrame =
            serde_json::from_str(r#"{"type":"emergency_stop","reason":"manual check"}"#).unwrap();
        assert_eq!(
            frame.command,
            ClientCommand::EmergencyStop {
                reason: Some("manual check".to_string()),
                compliance_violation: false
            }
        );
    }

    #[test]
    fn test_schedule_request_into_item() {
        let request = ScheduleRequest {
            target: "urn:post:9".to_string(),
            priority: Priority::Urgent,
            max_retries: Some(5),
            ..Default::default()
        };
        let item = request.into_item(ActionType::Like, serde_json::Value::Null);
        assert_eq!(item.action_type, Some(ActionType::Like));
        assert_eq!(item.priority, Priority::Urgent);
        assert_eq!(item.max_retries, Some(5));
        assert!(item.scheduled_at.is_none());
    }

    #[test]
    fn test_unknown_command_rejected() {
        let parsed: Result<CommandFrame, _> = serde_json::from_str(r#"{"type":"delete_everything"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_event_names() {
        assert_eq!(ServerMessage::Heartbeat.event_name(), "heartbeat");
        let msg = ServerMessage::Error {
            message: "x".to_string(),
        };
        assert_eq!(msg.event_name(), "error");
    }
}
