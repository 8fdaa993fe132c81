use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{CadenceError, Result};
use crate::types::{ActionType, QuotaWindow, ScoreBand, WindowLimits};

/// Default ceilings as a fraction of the host platform's documented limits.
pub const DEFAULT_CEILING_FRACTION: f64 = 0.15;

/// No configured ceiling may exceed this fraction of the platform limits.
pub const HARD_CEILING_FRACTION: f64 = 0.25;

/// Maximum ceilings any account or tier may be configured with.
pub fn hard_ceiling(action_type: ActionType) -> WindowLimits {
    action_type.platform_limits().scaled(HARD_CEILING_FRACTION)
}

/// Top-level configuration for the cadence engine.
///
/// Loaded from `~/.cadence/config.toml` by default. Every section is optional
/// and falls back to conservative defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub pacing: PacingConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub simulator: SimulatorConfig,
}

impl CadenceConfig {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: CadenceConfig = toml::from_str(&content)?;
        config.validate()?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration, falling back to defaults if the file is missing or invalid.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Check every section for values the engine refuses to run with.
    pub fn validate(&self) -> Result<()> {
        self.quota.limits.validate()?;
        self.pacing.validate()?;
        self.retry.validate()?;
        self.safety.validate()?;
        self.broadcast.validate()?;
        Ok(())
    }
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Address the API server binds to.
    pub bind: String,
    /// API server port.
    pub port: u16,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 3040,
            log_level: "info".to_string(),
        }
    }
}

// =============================================================================
// Quota
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub limits: ActionLimits,
    /// Seconds an uncommitted reservation is held before it returns to the pool.
    pub reservation_timeout_secs: u64,
    /// Number of trailing daily totals kept per action type.
    pub history_days: usize,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            limits: ActionLimits::default(),
            reservation_timeout_secs: 120,
            history_days: 7,
        }
    }
}

/// Per-action ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionLimits {
    pub connection: WindowLimits,
    pub like: WindowLimits,
    pub comment: WindowLimits,
    pub view_profile: WindowLimits,
    pub follow: WindowLimits,
    pub message: WindowLimits,
}

impl Default for ActionLimits {
    fn default() -> Self {
        let default_for = |at: ActionType| at.platform_limits().scaled(DEFAULT_CEILING_FRACTION);
        Self {
            connection: default_for(ActionType::Connection),
            like: default_for(ActionType::Like),
            comment: default_for(ActionType::Comment),
            view_profile: default_for(ActionType::ViewProfile),
            follow: default_for(ActionType::Follow),
            message: default_for(ActionType::Message),
        }
    }
}

impl ActionLimits {
    pub fn get(&self, action_type: ActionType) -> WindowLimits {
        match action_type {
            ActionType::Connection => self.connection,
            ActionType::Like => self.like,
            ActionType::Comment => self.comment,
            ActionType::ViewProfile => self.view_profile,
            ActionType::Follow => self.follow,
            ActionType::Message => self.message,
        }
    }

    pub fn set(&mut self, action_type: ActionType, limits: WindowLimits) {
        match action_type {
            ActionType::Connection => self.connection = limits,
            ActionType::Like => self.like = limits,
            ActionType::Comment => self.comment = limits,
            ActionType::ViewProfile => self.view_profile = limits,
            ActionType::Follow => self.follow = limits,
            ActionType::Message => self.message = limits,
        }
    }

    /// Reject (never clamp) limits above the hard ceiling or with shrinking windows.
    pub fn validate(&self) -> Result<()> {
        for action_type in ActionType::ALL {
            let limits = self.get(action_type);
            let max = hard_ceiling(action_type);
            for window in QuotaWindow::ALL {
                if limits.get(window) > max.get(window) {
                    return Err(CadenceError::CeilingAboveHardLimit {
                        action_type,
                        window,
                        requested: limits.get(window),
                        max: max.get(window),
                    });
                }
            }
            if limits.daily > limits.weekly || limits.weekly > limits.monthly {
                return Err(CadenceError::Config(format!(
                    "{} limits must satisfy daily <= weekly <= monthly",
                    action_type
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Pacing
// =============================================================================

/// Randomized delay inserted between two dispatches of the same action type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl DelayRange {
    pub const fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionDelays {
    pub connection: DelayRange,
    pub like: DelayRange,
    pub comment: DelayRange,
    pub view_profile: DelayRange,
    pub follow: DelayRange,
    pub message: DelayRange,
}

impl Default for ActionDelays {
    fn default() -> Self {
        Self {
            connection: DelayRange::new(45_000, 180_000),
            like: DelayRange::new(8_000, 40_000),
            comment: DelayRange::new(30_000, 120_000),
            view_profile: DelayRange::new(10_000, 60_000),
            follow: DelayRange::new(20_000, 90_000),
            message: DelayRange::new(60_000, 240_000),
        }
    }
}

impl ActionDelays {
    /// Same range for every action type.
    pub fn uniform(range: DelayRange) -> Self {
        Self {
            connection: range,
            like: range,
            comment: range,
            view_profile: range,
            follow: range,
            message: range,
        }
    }

    pub fn get(&self, action_type: ActionType) -> DelayRange {
        match action_type {
            ActionType::Connection => self.connection,
            ActionType::Like => self.like,
            ActionType::Comment => self.comment,
            ActionType::ViewProfile => self.view_profile,
            ActionType::Follow => self.follow,
            ActionType::Message => self.message,
        }
    }

    pub fn validate(&self) -> Result<()> {
        for action_type in ActionType::ALL {
            let range = self.get(action_type);
            if range.min_ms > range.max_ms {
                return Err(CadenceError::Config(format!(
                    "{} delay range has min_ms {} above max_ms {}",
                    action_type, range.min_ms, range.max_ms
                )));
            }
        }
        Ok(())
    }
}

/// Daily window (UTC hours) in which dispatch is allowed. Wraps past midnight
/// when `start_hour > end_hour`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingHours {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl WorkingHours {
    pub fn validate(&self) -> Result<()> {
        if self.start_hour > 23 || self.end_hour > 24 || self.start_hour == self.end_hour {
            return Err(CadenceError::Config(format!(
                "invalid working hours {}..{}",
                self.start_hour, self.end_hour
            )));
        }
        Ok(())
    }

    pub fn contains(&self, hour: u32) -> bool {
        if self.start_hour <= self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    /// Dispatch loop tick interval.
    pub tick_interval_ms: u64,
    /// Upper bound on a single external action call.
    pub action_timeout_secs: u64,
    pub delays: ActionDelays,
    pub working_hours: Option<WorkingHours>,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 500,
            action_timeout_secs: 60,
            delays: ActionDelays::default(),
            working_hours: None,
        }
    }
}

impl PacingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval_ms == 0 {
            return Err(CadenceError::Config(
                "pacing.tick_interval_ms must be positive".to_string(),
            ));
        }
        if let Some(hours) = self.working_hours {
            hours.validate()?;
        }
        self.delays.validate()
    }
}

// =============================================================================
// Retry
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Failed attempts after which an item becomes terminally failed.
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Cool-down applied when the platform signals a rate limit without a hint.
    pub rate_limit_cooldown_secs: u64,
    /// How long terminal items stay visible before removal.
    pub retention_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_ms: 30_000,
            max_backoff_ms: 15 * 60 * 1000,
            rate_limit_cooldown_secs: 15 * 60,
            retention_secs: 24 * 60 * 60,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(CadenceError::Config(
                "retry.max_retries must be at least 1".to_string(),
            ));
        }
        if self.base_backoff_ms > self.max_backoff_ms {
            return Err(CadenceError::Config(
                "retry.base_backoff_ms must not exceed retry.max_backoff_ms".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Safety scoring
// =============================================================================

/// Weights of each penalty component in the 0-100 score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub utilization: f64,
    pub error_rate: f64,
    pub risk: f64,
    pub alerts: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            utilization: 0.25,
            error_rate: 0.35,
            risk: 0.25,
            alerts: 0.15,
        }
    }
}

/// Lower bound (inclusive) of each band. Anything below `critical` is emergency.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BandThresholds {
    pub excellent: f64,
    pub good: f64,
    pub fair: f64,
    pub warning: f64,
    pub critical: f64,
}

impl Default for BandThresholds {
    fn default() -> Self {
        Self {
            excellent: 90.0,
            good: 75.0,
            fair: 60.0,
            warning: 45.0,
            critical: 30.0,
        }
    }
}

impl BandThresholds {
    pub fn band(&self, score: f64) -> ScoreBand {
        if score >= self.excellent {
            ScoreBand::Excellent
        } else if score >= self.good {
            ScoreBand::Good
        } else if score >= self.fair {
            ScoreBand::Fair
        } else if score >= self.warning {
            ScoreBand::Warning
        } else if score >= self.critical {
            ScoreBand::Critical
        } else {
            ScoreBand::Emergency
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Cadence of the periodic health evaluation.
    pub health_check_interval_secs: u64,
    /// Number of recent dispatch outcomes the error rate is computed over.
    pub error_window: usize,
    /// Outcomes and dispatches older than this no longer count toward the
    /// error rate or the pattern signals, so a paused account can recover.
    pub signal_horizon_secs: u64,
    pub weights: ScoreWeights,
    pub bands: BandThresholds,
    /// Score must stay above the warning band this long before a score stop is resume-eligible.
    pub recovery_window_secs: u64,
    /// Upper bound on how long Stopping waits for the in-flight dispatch.
    pub stop_drain_timeout_secs: u64,
    /// Resume automatically once a score-triggered stop becomes eligible.
    pub auto_resume: bool,
    /// Number of score samples kept for trend detection.
    pub trend_samples: usize,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: 30,
            error_window: 20,
            signal_horizon_secs: 15 * 60,
            weights: ScoreWeights::default(),
            bands: BandThresholds::default(),
            recovery_window_secs: 10 * 60,
            stop_drain_timeout_secs: 30,
            auto_resume: false,
            trend_samples: 5,
        }
    }
}

impl SafetyConfig {
    pub fn validate(&self) -> Result<()> {
        let w = &self.weights;
        let weights = [w.utilization, w.error_rate, w.risk, w.alerts];
        if weights.iter().any(|v| *v < 0.0 || !v.is_finite()) {
            return Err(CadenceError::Config(
                "safety.weights must be finite and non-negative".to_string(),
            ));
        }
        let b = &self.bands;
        let bands = [b.excellent, b.good, b.fair, b.warning, b.critical];
        if bands.windows(2).any(|pair| pair[0] <= pair[1])
            || b.excellent > 100.0
            || b.critical < 0.0
        {
            return Err(CadenceError::Config(
                "safety.bands must be strictly descending within 0..=100".to_string(),
            ));
        }
        if self.error_window == 0
            || self.health_check_interval_secs == 0
            || self.signal_horizon_secs == 0
        {
            return Err(CadenceError::Config(
                "safety.error_window, safety.health_check_interval_secs and safety.signal_horizon_secs must be positive"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Broadcast
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Per-observer outbound buffer; an observer that overflows it is disconnected.
    pub observer_buffer: usize,
    pub heartbeat_interval_secs: u64,
    /// Observers silent for longer than this are dropped.
    pub heartbeat_timeout_secs: u64,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            observer_buffer: 256,
            heartbeat_interval_secs: 15,
            heartbeat_timeout_secs: 45,
        }
    }
}

impl BroadcastConfig {
    pub fn validate(&self) -> Result<()> {
        if self.observer_buffer == 0 {
            return Err(CadenceError::Config(
                "broadcast.observer_buffer must be positive".to_string(),
            ));
        }
        if self.heartbeat_timeout_secs <= self.heartbeat_interval_secs {
            return Err(CadenceError::Config(
                "broadcast.heartbeat_timeout_secs must exceed heartbeat_interval_secs".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Simulated action client
// =============================================================================

/// Behaviour of the in-process simulated action client used when no real
/// network client is wired in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    pub success_rate: f64,
    pub rate_limit_rate: f64,
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            success_rate: 0.97,
            rate_limit_rate: 0.01,
            min_latency_ms: 300,
            max_latency_ms: 1_500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = CadenceConfig::default();
        config.validate().unwrap();
        assert_eq!(config.general.port, 3040);
        assert_eq!(config.quota.limits.connection.daily, 15);
        assert_eq!(config.retry.max_retries, 3);
    }

    #[test]
    fn test_default_limits_are_conservative_fraction() {
        let limits = ActionLimits::default();
        for at in ActionType::ALL {
            let platform = at.platform_limits();
            let configured = limits.get(at);
            assert!(configured.daily as f64 <= platform.daily as f64 * 0.17);
        }
    }

    #[test]
    fn test_limit_above_hard_ceiling_rejected_not_clamped() {
        let mut config = CadenceConfig::default();
        config.quota.limits.connection.daily = 80;
        let err = config.validate().unwrap_err();
        match err {
            CadenceError::CeilingAboveHardLimit {
                action_type,
                window,
                requested,
                max,
            } => {
                assert_eq!(action_type, ActionType::Connection);
                assert_eq!(window, QuotaWindow::Daily);
                assert_eq!(requested, 80);
                assert_eq!(max, 25);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(config.quota.limits.connection.daily, 80);
    }

    #[test]
    fn test_shrinking_windows_rejected() {
        let mut limits = ActionLimits::default();
        limits.like = WindowLimits::new(50, 40, 500);
        assert!(limits.validate().is_err());
    }

    #[test]
    fn test_inverted_delay_range_rejected() {
        let mut config = CadenceConfig::default();
        config.pacing.delays.comment = DelayRange::new(10, 5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bands_must_descend() {
        let mut config = CadenceConfig::default();
        config.safety.bands.fair = 80.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_band_lookup() {
        let bands = BandThresholds::default();
        assert_eq!(bands.band(95.0), ScoreBand::Excellent);
        assert_eq!(bands.band(90.0), ScoreBand::Excellent);
        assert_eq!(bands.band(80.0), ScoreBand::Good);
        assert_eq!(bands.band(72.0), ScoreBand::Fair);
        assert_eq!(bands.band(50.0), ScoreBand::Warning);
        assert_eq!(bands.band(44.9), ScoreBand::Critical);
        assert_eq!(bands.band(28.0), ScoreBand::Emergency);
    }

    #[test]
    fn test_working_hours_wrap() {
        let day = WorkingHours {
            start_hour: 9,
            end_hour: 17,
        };
        assert!(day.contains(9));
        assert!(!day.contains(17));
        let night = WorkingHours {
            start_hour: 22,
            end_hour: 6,
        };
        assert!(night.contains(23));
        assert!(night.contains(2));
        assert!(!night.contains(12));
    }

    #[test]
    fn test_empty_or_out_of_range_working_hours_rejected() {
        let empty = WorkingHours {
            start_hour: 9,
            end_hour: 9,
        };
        assert!(empty.validate().is_err());
        let late = WorkingHours {
            start_hour: 24,
            end_hour: 6,
        };
        assert!(late.validate().is_err());
        let mut config = CadenceConfig::default();
        config.pacing.working_hours = Some(late);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_partial_config_uses_defaults() {
        let content = r#"
[general]
log_level = "debug"

[quota.limits.connection]
daily = 10
weekly = 40
monthly = 120

[pacing.delays.like]
min_ms = 1000
max_ms = 2000
"#;
        let file = create_temp_config(content);
        let config = CadenceConfig::load(file.path()).unwrap();
        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.quota.limits.connection.daily, 10);
        assert_eq!(config.quota.limits.like.daily, 45);
        assert_eq!(config.pacing.delays.like.max_ms, 2000);
        assert_eq!(config.pacing.delays.comment, DelayRange::new(30_000, 120_000));
    }

    #[test]
    fn test_load_rejects_limit_above_ceiling() {
        let content = r#"
[quota.limits.follow]
daily = 500
weekly = 1000
monthly = 2000
"#;
        let file = create_temp_config(content);
        assert!(matches!(
            CadenceConfig::load(file.path()),
            Err(CadenceError::CeilingAboveHardLimit { .. })
        ));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = CadenceConfig::load_or_default(Path::new("/nonexistent/cadence.toml"));
        assert_eq!(config.general.log_level, "info");
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = CadenceConfig::default();
        config.pacing.working_hours = Some(WorkingHours {
            start_hour: 8,
            end_hour: 18,
        });
        config.save(&path).unwrap();

        let reloaded = CadenceConfig::load(&path).unwrap();
        assert_eq!(reloaded.quota.limits, config.quota.limits);
        assert_eq!(reloaded.pacing.working_hours, config.pacing.working_hours);
        assert_eq!(reloaded.safety.weights, config.safety.weights);
    }

    #[test]
    fn test_load_invalid_toml() {
        let file = create_temp_config("this is {{ not valid TOML");
        assert!(CadenceConfig::load(file.path()).is_err());
    }
}
