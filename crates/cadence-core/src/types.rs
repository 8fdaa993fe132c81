use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Time
// =============================================================================

/// Wall-clock instant in Unix milliseconds.
///
/// Every outbound message carries one so observers can compute delivery latency.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis())
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp_millis())
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.0).unwrap_or_default()
    }
}

// =============================================================================
// Actions
// =============================================================================

/// Social action types the engine can pace and dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Connection,
    Like,
    Comment,
    ViewProfile,
    Follow,
    Message,
}

impl ActionType {
    pub const ALL: [ActionType; 6] = [
        ActionType::Connection,
        ActionType::Like,
        ActionType::Comment,
        ActionType::ViewProfile,
        ActionType::Follow,
        ActionType::Message,
    ];

    /// Documented host-platform limits for this action (daily, weekly, monthly).
    pub fn platform_limits(&self) -> WindowLimits {
        match self {
            ActionType::Connection => WindowLimits::new(100, 300, 1_000),
            ActionType::Like => WindowLimits::new(300, 1_500, 5_000),
            ActionType::Comment => WindowLimits::new(100, 500, 2_000),
            ActionType::ViewProfile => WindowLimits::new(500, 2_500, 8_000),
            ActionType::Follow => WindowLimits::new(150, 750, 3_000),
            ActionType::Message => WindowLimits::new(150, 750, 3_000),
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionType::Connection => write!(f, "connection"),
            ActionType::Like => write!(f, "like"),
            ActionType::Comment => write!(f, "comment"),
            ActionType::ViewProfile => write!(f, "view_profile"),
            ActionType::Follow => write!(f, "follow"),
            ActionType::Message => write!(f, "message"),
        }
    }
}

impl std::str::FromStr for ActionType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connection" => Ok(ActionType::Connection),
            "like" => Ok(ActionType::Like),
            "comment" => Ok(ActionType::Comment),
            "view_profile" => Ok(ActionType::ViewProfile),
            "follow" => Ok(ActionType::Follow),
            "message" => Ok(ActionType::Message),
            _ => Err(format!("Unknown action type: {}", s)),
        }
    }
}

/// Quota accounting window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaWindow {
    Daily,
    Weekly,
    Monthly,
}

impl QuotaWindow {
    pub const ALL: [QuotaWindow; 3] = [QuotaWindow::Daily, QuotaWindow::Weekly, QuotaWindow::Monthly];
}

impl fmt::Display for QuotaWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaWindow::Daily => write!(f, "daily"),
            QuotaWindow::Weekly => write!(f, "weekly"),
            QuotaWindow::Monthly => write!(f, "monthly"),
        }
    }
}

/// Ceilings for one action type across the three windows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowLimits {
    pub daily: u32,
    pub weekly: u32,
    pub monthly: u32,
}

impl WindowLimits {
    pub const fn new(daily: u32, weekly: u32, monthly: u32) -> Self {
        Self {
            daily,
            weekly,
            monthly,
        }
    }

    pub fn get(&self, window: QuotaWindow) -> u32 {
        match window {
            QuotaWindow::Daily => self.daily,
            QuotaWindow::Weekly => self.weekly,
            QuotaWindow::Monthly => self.monthly,
        }
    }

    /// Scale every window by `fraction`, rounding down.
    pub fn scaled(&self, fraction: f64) -> Self {
        let scale = |v: u32| (v as f64 * fraction).floor() as u32;
        Self::new(scale(self.daily), scale(self.weekly), scale(self.monthly))
    }
}

// =============================================================================
// Queue items
// =============================================================================

/// Dispatch priority. Ordering follows urgency: `Urgent` sorts highest.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
            Priority::Urgent => write!(f, "urgent"),
        }
    }
}

/// Lifecycle of a queue item.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
    RateLimited,
}

impl ItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ItemStatus::Completed | ItemStatus::Failed | ItemStatus::Cancelled
        )
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemStatus::Queued => write!(f, "queued"),
            ItemStatus::Processing => write!(f, "processing"),
            ItemStatus::Completed => write!(f, "completed"),
            ItemStatus::Failed => write!(f, "failed"),
            ItemStatus::Cancelled => write!(f, "cancelled"),
            ItemStatus::RateLimited => write!(f, "rate_limited"),
        }
    }
}

/// One scheduled social action.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: Uuid,
    pub account_id: String,
    pub action_type: ActionType,
    /// Profile URL, post URN or similar reference understood by the action client.
    pub target: String,
    /// Free-form action parameters (connection note, comment text, ...).
    #[serde(default)]
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub status: ItemStatus,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Earliest time the item may be dispatched again (retry backoff, rate-limit cooldown).
    pub not_before: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub depends_on: Vec<Uuid>,
    pub campaign_id: Option<String>,
    /// Set when a cancel arrives while the item is in flight.
    #[serde(default)]
    pub cancel_requested: bool,
}

/// A submission accepted by the scheduler.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NewQueueItem {
    pub action_type: Option<ActionType>,
    pub target: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: Priority,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub depends_on: Vec<Uuid>,
    pub campaign_id: Option<String>,
}

/// Kind of queue delta.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueAction {
    Added,
    Updated,
    Removed,
}

/// Aggregate queue counts by status.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub rate_limited: usize,
}

impl QueueCounts {
    pub fn record(&mut self, status: ItemStatus) {
        match status {
            ItemStatus::Queued => self.queued += 1,
            ItemStatus::Processing => self.processing += 1,
            ItemStatus::Completed => self.completed += 1,
            ItemStatus::Failed => self.failed += 1,
            ItemStatus::Cancelled => self.cancelled += 1,
            ItemStatus::RateLimited => self.rate_limited += 1,
        }
    }
}

// =============================================================================
// Quota reporting
// =============================================================================

/// Usage within one window.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowUsage {
    pub window: QuotaWindow,
    pub used: u32,
    pub reserved: u32,
    pub ceiling: u32,
    pub resets_at: DateTime<Utc>,
}

/// Historical daily total for one action type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsagePoint {
    pub day: chrono::NaiveDate,
    pub count: u32,
}

/// Per-action usage report.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DailyUsageMetric {
    pub action_type: ActionType,
    pub current: u32,
    pub ceiling: u32,
    pub reset_at: DateTime<Utc>,
    pub windows: Vec<WindowUsage>,
    pub history: Vec<UsagePoint>,
    /// Highest `(used + reserved) / ceiling` across windows, 0.0 to 1.0.
    pub utilization: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub metrics: Vec<DailyUsageMetric>,
}

impl QuotaSnapshot {
    pub fn metric(&self, action_type: ActionType) -> Option<&DailyUsageMetric> {
        self.metrics.iter().find(|m| m.action_type == action_type)
    }

    /// Highest utilization across all action types.
    pub fn peak_utilization(&self) -> f64 {
        self.metrics
            .iter()
            .map(|m| m.utilization)
            .fold(0.0, f64::max)
    }
}

// =============================================================================
// Safety
// =============================================================================

/// Score band, from best to worst.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreBand {
    Excellent,
    Good,
    Fair,
    Warning,
    Critical,
    Emergency,
}

impl ScoreBand {
    pub fn severity(&self) -> AlertSeverity {
        match self {
            ScoreBand::Excellent | ScoreBand::Good | ScoreBand::Fair => AlertSeverity::Info,
            ScoreBand::Warning => AlertSeverity::Warning,
            ScoreBand::Critical | ScoreBand::Emergency => AlertSeverity::Critical,
        }
    }

    pub fn overall(&self) -> OverallStatus {
        match self {
            ScoreBand::Excellent | ScoreBand::Good | ScoreBand::Fair => OverallStatus::Healthy,
            ScoreBand::Warning => OverallStatus::Warning,
            ScoreBand::Critical | ScoreBand::Emergency => OverallStatus::Critical,
        }
    }
}

impl fmt::Display for ScoreBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScoreBand::Excellent => write!(f, "excellent"),
            ScoreBand::Good => write!(f, "good"),
            ScoreBand::Fair => write!(f, "fair"),
            ScoreBand::Warning => write!(f, "warning"),
            ScoreBand::Critical => write!(f, "critical"),
            ScoreBand::Emergency => write!(f, "emergency"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertSeverity::Info => write!(f, "info"),
            AlertSeverity::Warning => write!(f, "warning"),
            AlertSeverity::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Healthy,
    Warning,
    Critical,
    Suspended,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    #[default]
    Stable,
    Declining,
}

/// A recorded band transition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SafetyAlert {
    pub id: Uuid,
    pub severity: AlertSeverity,
    pub from_band: ScoreBand,
    pub to_band: ScoreBand,
    pub score: f64,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub acknowledged: bool,
    pub auto_resolved: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskFactorKind {
    /// Inter-dispatch delays are too regular.
    DelayUniformity,
    /// The same action type dominates the recent dispatch sequence.
    PatternRegularity,
    /// The platform answered with rate-limit signals recently.
    RateLimitSignals,
    /// Dispatches happened outside the configured working hours.
    OffHoursActivity,
}

/// A behavioural signal contributing negatively to the score.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RiskFactor {
    pub kind: RiskFactorKind,
    /// 0.0 (harmless) to 1.0 (maximal risk).
    pub severity: f64,
    pub description: String,
}

/// Immutable published health evaluation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SafetyStatus {
    /// Monotonic per-account publication counter.
    pub version: u64,
    pub score: f64,
    pub band: ScoreBand,
    pub overall: OverallStatus,
    pub active_alerts: Vec<SafetyAlert>,
    pub risk_factors: Vec<RiskFactor>,
    pub error_rate: f64,
    pub utilization: f64,
    pub last_check: DateTime<Utc>,
    pub next_check: DateTime<Utc>,
    pub trend: Trend,
}

impl SafetyStatus {
    /// Status before any evaluation has run.
    pub fn initial(next_check: DateTime<Utc>) -> Self {
        Self {
            version: 0,
            score: 100.0,
            band: ScoreBand::Excellent,
            overall: OverallStatus::Healthy,
            active_alerts: Vec::new(),
            risk_factors: Vec::new(),
            error_rate: 0.0,
            utilization: 0.0,
            last_check: Utc::now(),
            next_check,
            trend: Trend::Stable,
        }
    }
}

// =============================================================================
// Emergency stop
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopCause {
    Manual,
    ScoreCritical,
    ComplianceViolation,
}

impl fmt::Display for StopCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopCause::Manual => write!(f, "manual"),
            StopCause::ScoreCritical => write!(f, "score_critical"),
            StopCause::ComplianceViolation => write!(f, "compliance_violation"),
        }
    }
}

/// Emergency-stop state machine phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopPhase {
    Running,
    Stopping,
    Stopped,
    Eligible,
    AwaitingManualClearance,
}

impl fmt::Display for StopPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopPhase::Running => write!(f, "running"),
            StopPhase::Stopping => write!(f, "stopping"),
            StopPhase::Stopped => write!(f, "stopped"),
            StopPhase::Eligible => write!(f, "eligible"),
            StopPhase::AwaitingManualClearance => write!(f, "awaiting_manual_clearance"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmergencyStopRecord {
    pub active: bool,
    pub cause: StopCause,
    pub reason: String,
    pub requires_manual_clearance: bool,
    pub triggered_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub estimated_resume_at: Option<DateTime<Utc>>,
}

/// Dispatch-loop status as seen by observers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AutomationStatus {
    pub phase: StopPhase,
    pub enabled: bool,
    pub suspended: bool,
    pub stop: Option<EmergencyStopRecord>,
    pub in_flight: Option<Uuid>,
}

/// Aggregate view served by the overview endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AutomationOverview {
    pub account_id: String,
    pub counts: QueueCounts,
    pub safety_score: f64,
    pub safety_band: ScoreBand,
    pub overall: OverallStatus,
    pub active_alerts: usize,
    pub automation: AutomationStatus,
    pub quota: QuotaSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_action_type_round_trip_strings() {
        for at in ActionType::ALL {
            assert_eq!(ActionType::from_str(&at.to_string()).unwrap(), at);
        }
        assert!(ActionType::from_str("poke").is_err());
    }

    #[test]
    fn test_action_type_serde_snake_case() {
        let json = serde_json::to_string(&ActionType::ViewProfile).unwrap();
        assert_eq!(json, "\"view_profile\"");
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Urgent > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
        assert_eq!(Priority::default(), Priority::Medium);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(ItemStatus::Completed.is_terminal());
        assert!(ItemStatus::Failed.is_terminal());
        assert!(ItemStatus::Cancelled.is_terminal());
        assert!(!ItemStatus::Queued.is_terminal());
        assert!(!ItemStatus::Processing.is_terminal());
        assert!(!ItemStatus::RateLimited.is_terminal());
    }

    #[test]
    fn test_scaled_limits_round_down() {
        let limits = ActionType::Connection.platform_limits().scaled(0.15);
        assert_eq!(limits.daily, 15);
        assert_eq!(limits.weekly, 45);
        assert_eq!(limits.monthly, 150);
    }

    #[test]
    fn test_band_severity_mapping() {
        assert_eq!(ScoreBand::Good.severity(), AlertSeverity::Info);
        assert_eq!(ScoreBand::Warning.severity(), AlertSeverity::Warning);
        assert_eq!(ScoreBand::Critical.severity(), AlertSeverity::Critical);
        assert_eq!(ScoreBand::Emergency.severity(), AlertSeverity::Critical);
        assert_eq!(ScoreBand::Emergency.overall(), OverallStatus::Critical);
        assert_eq!(ScoreBand::Fair.overall(), OverallStatus::Healthy);
    }

    #[test]
    fn test_timestamp_millis_round_trip() {
        let ts = Timestamp::now();
        assert_eq!(Timestamp::from_datetime(ts.to_datetime()), ts);
    }

    #[test]
    fn test_queue_counts_record() {
        let mut counts = QueueCounts::default();
        counts.record(ItemStatus::Queued);
        counts.record(ItemStatus::Queued);
        counts.record(ItemStatus::Failed);
        assert_eq!(counts.queued, 2);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.completed, 0);
    }
}
