//! Per-account quota ledger.
//!
//! Single source of truth for "can this action run now without breaching
//! policy". Reservations are taken atomically under one lock, held with a
//! lease, and either committed after a real dispatch attempt or released.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use cadence_core::config::{ActionLimits, QuotaConfig};
use cadence_core::types::{
    ActionType, DailyUsageMetric, QuotaSnapshot, QuotaWindow, UsagePoint, WindowUsage,
};
use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc};
use tracing::{debug, warn};

use crate::error::{QuotaDenied, QuotaError};

/// Result of a dispatch attempt, as far as quota and scoring are concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded,
    Failed,
    RateLimited,
}

impl AttemptOutcome {
    /// Whether the attempt reached the platform and counts as usage.
    pub fn consumes_quota(&self) -> bool {
        matches!(self, AttemptOutcome::Succeeded | AttemptOutcome::Failed)
    }
}

/// Handle to one unit of reserved quota. Consumed by `commit` or `release`.
#[derive(Debug, PartialEq, Eq)]
pub struct Reservation {
    id: u64,
    action_type: ActionType,
}

impl Reservation {
    pub fn action_type(&self) -> ActionType {
        self.action_type
    }
}

#[derive(Debug)]
struct WindowCounter {
    window: QuotaWindow,
    used: u32,
    resets_at: DateTime<Utc>,
}

#[derive(Debug)]
struct ActionCounters {
    windows: [WindowCounter; 3],
    history: VecDeque<UsagePoint>,
}

#[derive(Debug)]
struct HeldReservation {
    action_type: ActionType,
    expires_at: DateTime<Utc>,
}

#[derive(Debug)]
struct LedgerState {
    limits: ActionLimits,
    counters: HashMap<ActionType, ActionCounters>,
    reservations: HashMap<u64, HeldReservation>,
    next_id: u64,
}

/// Quota ledger for one account.
pub struct QuotaLedger {
    state: Mutex<LedgerState>,
    reservation_timeout: Duration,
    history_days: usize,
}

impl QuotaLedger {
    pub fn new(config: &QuotaConfig) -> Result<Self, QuotaError> {
        Self::new_at(config, Utc::now())
    }

    pub fn new_at(config: &QuotaConfig, now: DateTime<Utc>) -> Result<Self, QuotaError> {
        config.limits.validate()?;
        let counters = ActionType::ALL
            .into_iter()
            .map(|at| (at, ActionCounters::starting_at(now)))
            .collect();
        Ok(Self {
            state: Mutex::new(LedgerState {
                limits: config.limits,
                counters,
                reservations: HashMap::new(),
                next_id: 1,
            }),
            reservation_timeout: Duration::seconds(config.reservation_timeout_secs as i64),
            history_days: config.history_days,
        })
    }

    /// Reserve one unit of `action_type`. Two concurrent callers can never both
    /// succeed on the last remaining unit.
    pub fn reserve(&self, action_type: ActionType) -> Result<Reservation, QuotaDenied> {
        self.reserve_at(action_type, Utc::now())
    }

    pub fn reserve_at(
        &self,
        action_type: ActionType,
        now: DateTime<Utc>,
    ) -> Result<Reservation, QuotaDenied> {
        let mut state = self.lock();
        state.roll_windows(now, self.history_days);
        state.expire_reservations(now);

        if let Some(denied) = state.first_exhausted_window(action_type, 1) {
            debug!(%action_type, window = %denied.window, "Quota reservation denied");
            return Err(denied);
        }

        let id = state.next_id;
        state.next_id += 1;
        state.reservations.insert(
            id,
            HeldReservation {
                action_type,
                expires_at: now + self.reservation_timeout,
            },
        );
        Ok(Reservation { id, action_type })
    }

    /// Record the outcome of a real dispatch attempt.
    ///
    /// Usage is recorded even when the lease has already expired, since the
    /// attempt did happen. Returns whether the reservation was still held.
    pub fn commit(&self, reservation: Reservation, outcome: AttemptOutcome) -> bool {
        self.commit_at(reservation, outcome, Utc::now())
    }

    pub fn commit_at(
        &self,
        reservation: Reservation,
        outcome: AttemptOutcome,
        now: DateTime<Utc>,
    ) -> bool {
        let mut state = self.lock();
        state.roll_windows(now, self.history_days);
        let held = state.reservations.remove(&reservation.id).is_some();
        if !held {
            warn!(
                action_type = %reservation.action_type,
                "Committing a reservation whose lease already expired"
            );
        }
        if outcome.consumes_quota() {
            if let Some(counters) = state.counters.get_mut(&reservation.action_type) {
                for counter in counters.windows.iter_mut() {
                    counter.used += 1;
                }
            }
        }
        held
    }

    /// Return an unused reservation to the pool.
    pub fn release(&self, reservation: Reservation) {
        self.lock().reservations.remove(&reservation.id);
    }

    /// Units that could still be reserved right now, across all windows.
    pub fn headroom(&self, action_type: ActionType) -> u32 {
        self.headroom_at(action_type, Utc::now())
    }

    pub fn headroom_at(&self, action_type: ActionType, now: DateTime<Utc>) -> u32 {
        let mut state = self.lock();
        state.roll_windows(now, self.history_days);
        state.expire_reservations(now);
        let limits = state.limits.get(action_type);
        let reserved = state.reserved_count(action_type);
        state.counters[&action_type]
            .windows
            .iter()
            .map(|c| limits.get(c.window).saturating_sub(c.used + reserved))
            .min()
            .unwrap_or(0)
    }

    /// Check whether `additional` more units would fit, without reserving.
    pub fn check_admission(
        &self,
        action_type: ActionType,
        additional: u32,
    ) -> Result<(), QuotaDenied> {
        let now = Utc::now();
        let mut state = self.lock();
        state.roll_windows(now, self.history_days);
        state.expire_reservations(now);
        match state.first_exhausted_window(action_type, additional) {
            Some(denied) => Err(denied),
            None => Ok(()),
        }
    }

    pub fn limits(&self) -> ActionLimits {
        self.lock().limits
    }

    /// Replace the ceilings. Limits above the hard ceiling are rejected as a whole.
    pub fn set_limits(&self, limits: ActionLimits) -> Result<(), QuotaError> {
        limits.validate()?;
        self.lock().limits = limits;
        Ok(())
    }

    pub fn snapshot(&self) -> QuotaSnapshot {
        self.snapshot_at(Utc::now())
    }

    pub fn snapshot_at(&self, now: DateTime<Utc>) -> QuotaSnapshot {
        let mut state = self.lock();
        state.roll_windows(now, self.history_days);
        state.expire_reservations(now);
        let metrics = ActionType::ALL
            .into_iter()
            .map(|at| state.metric(at))
            .collect();
        QuotaSnapshot { metrics }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LedgerState> {
        // The state is plain counters; a panic mid-update cannot leave it unusable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl LedgerState {
    fn reserved_count(&self, action_type: ActionType) -> u32 {
        self.reservations
            .values()
            .filter(|r| r.action_type == action_type)
            .count() as u32
    }

    fn first_exhausted_window(&self, action_type: ActionType, additional: u32) -> Option<QuotaDenied> {
        let limits = self.limits.get(action_type);
        let reserved = self.reserved_count(action_type);
        self.counters[&action_type].windows.iter().find_map(|c| {
            let ceiling = limits.get(c.window);
            if c.used + reserved + additional > ceiling {
                Some(QuotaDenied {
                    action_type,
                    window: c.window,
                    used: c.used,
                    reserved,
                    ceiling,
                })
            } else {
                None
            }
        })
    }

    fn expire_reservations(&mut self, now: DateTime<Utc>) {
        let before = self.reservations.len();
        self.reservations.retain(|_, r| r.expires_at > now);
        let expired = before - self.reservations.len();
        if expired > 0 {
            warn!(expired, "Released reservations that were never committed");
        }
    }

    /// Reset every window whose boundary has passed. Reservations are left
    /// untouched so in-flight work keeps counting against the new window.
    fn roll_windows(&mut self, now: DateTime<Utc>, history_days: usize) {
        for counters in self.counters.values_mut() {
            for i in 0..counters.windows.len() {
                if now < counters.windows[i].resets_at {
                    continue;
                }
                let window = counters.windows[i].window;
                if window == QuotaWindow::Daily {
                    let day = (counters.windows[i].resets_at - Duration::days(1)).date_naive();
                    counters.history.push_back(UsagePoint {
                        day,
                        count: counters.windows[i].used,
                    });
                    while counters.history.len() > history_days {
                        counters.history.pop_front();
                    }
                }
                counters.windows[i].used = 0;
                counters.windows[i].resets_at = next_reset(window, now);
            }
        }
    }

    fn metric(&self, action_type: ActionType) -> DailyUsageMetric {
        let limits = self.limits.get(action_type);
        let reserved = self.reserved_count(action_type);
        let counters = &self.counters[&action_type];
        let windows: Vec<WindowUsage> = counters
            .windows
            .iter()
            .map(|c| WindowUsage {
                window: c.window,
                used: c.used,
                reserved,
                ceiling: limits.get(c.window),
                resets_at: c.resets_at,
            })
            .collect();
        let utilization = windows
            .iter()
            .map(|w| {
                if w.ceiling == 0 {
                    1.0
                } else {
                    ((w.used + w.reserved) as f64 / w.ceiling as f64).min(1.0)
                }
            })
            .fold(0.0, f64::max);
        let daily = &counters.windows[0];
        DailyUsageMetric {
            action_type,
            current: daily.used,
            ceiling: limits.daily,
            reset_at: daily.resets_at,
            windows,
            history: counters.history.iter().cloned().collect(),
            utilization,
        }
    }
}

impl ActionCounters {
    fn starting_at(now: DateTime<Utc>) -> Self {
        let counter = |window| WindowCounter {
            window,
            used: 0,
            resets_at: next_reset(window, now),
        };
        Self {
            windows: [
                counter(QuotaWindow::Daily),
                counter(QuotaWindow::Weekly),
                counter(QuotaWindow::Monthly),
            ],
            history: VecDeque::new(),
        }
    }
}

/// Next UTC boundary for a window: midnight, Monday midnight, or the first of the month.
pub fn next_reset(window: QuotaWindow, now: DateTime<Utc>) -> DateTime<Utc> {
    let today = now.date_naive();
    let midnight = |date: chrono::NaiveDate| Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN));
    match window {
        QuotaWindow::Daily => midnight(today + Duration::days(1)),
        QuotaWindow::Weekly => {
            let days_until_monday = 7 - today.weekday().num_days_from_monday() as i64;
            midnight(today + Duration::days(days_until_monday))
        }
        QuotaWindow::Monthly => {
            let (year, month) = if today.month() == 12 {
                (today.year() + 1, 1)
            } else {
                (today.year(), today.month() + 1)
            };
            let first = chrono::NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(today);
            midnight(first)
        }
    }
}
