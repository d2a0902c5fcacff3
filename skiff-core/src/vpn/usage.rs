//! Daily usage accounting and quota checks
//!
//! `UsageLimitGuard` owns the persisted `DailyUsage` and answers whether a
//! connection may start or must end. The checks themselves are pure
//! functions so they can be exercised without storage or a clock.

use crate::api::PrecheckResponse;
use crate::config::LimitsConfig;
use crate::error::ApiError;
use crate::storage::{self, KeyValueStore, KEY_DAILY_USAGE};
use crate::types::User;
use crate::vpn::state::{FinishedSession, SessionStats};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

pub const REASON_TRAFFIC_EXCEEDED: &str = "Daily traffic limit exceeded";
pub const REASON_TIME_EXCEEDED: &str = "Daily time limit exceeded";
pub const REASON_BOTH_EXCEEDED: &str = "Daily traffic and time limits exceeded";

/// Traffic and time used on one UTC calendar day
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyUsage {
    pub date: NaiveDate,
    pub traffic_bytes: u64,
    pub time_seconds: u64,
}

impl DailyUsage {
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            traffic_bytes: 0,
            time_seconds: 0,
        }
    }

    /// This usage if it belongs to `today`, otherwise a zeroed record
    pub fn for_day(self, today: NaiveDate) -> Self {
        if self.date == today {
            self
        } else {
            Self::empty(today)
        }
    }
}

/// Quota class derived from the profile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserLimitTier {
    /// Administrators
    Unlimited,
    /// Subscribers with an active VIP role
    Elevated,
    /// Everyone else, including anonymous users
    Standard,
}

/// Derive the tier from role claims and subscription expiry
pub fn classify(user: Option<&User>, now: DateTime<Utc>) -> UserLimitTier {
    match user {
        Some(user) if user.is_admin() => UserLimitTier::Unlimited,
        Some(user) if user.is_vip_at(now) => UserLimitTier::Elevated,
        _ => UserLimitTier::Standard,
    }
}

/// Effective daily limits; zero means no limit on that resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub traffic_bytes: u64,
    pub time_secs: u64,
}

impl Limits {
    /// Per-account override where set, client default otherwise
    pub fn for_user(user: Option<&User>, defaults: &LimitsConfig) -> Self {
        let pick = |override_value: u64, default: u64| {
            if override_value > 0 {
                override_value
            } else {
                default
            }
        };
        Self {
            traffic_bytes: pick(
                user.map_or(0, |u| u.daily_traffic_limit),
                defaults.daily_traffic_bytes,
            ),
            time_secs: pick(
                user.map_or(0, |u| u.daily_time_limit),
                defaults.daily_time_secs,
            ),
        }
    }
}

/// Quota left on one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remaining {
    Unbounded,
    Limited(u64),
}

impl Remaining {
    fn of(limit: u64, used: u64) -> Self {
        if limit > 0 {
            Remaining::Limited(limit.saturating_sub(used))
        } else {
            Remaining::Unbounded
        }
    }

    /// Wire/display form: -1 for unbounded
    pub fn as_sentinel(&self) -> i64 {
        match self {
            Remaining::Unbounded => -1,
            Remaining::Limited(n) => i64::try_from(*n).unwrap_or(i64::MAX),
        }
    }
}

/// Outcome of a pre-connect quota check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitCheck {
    pub can_connect: bool,
    pub traffic_exceeded: bool,
    pub time_exceeded: bool,
    pub remaining_traffic: Remaining,
    pub remaining_time: Remaining,
    pub reason: Option<String>,
}

fn exceeded(limit: u64, used: u64) -> bool {
    limit > 0 && used >= limit
}

/// Client-side pre-connect check
///
/// Reaching a limit exactly already counts as exceeding it.
pub fn check_before_connect(tier: UserLimitTier, limits: Limits, usage: &DailyUsage) -> LimitCheck {
    if tier != UserLimitTier::Standard {
        return LimitCheck {
            can_connect: true,
            traffic_exceeded: false,
            time_exceeded: false,
            remaining_traffic: Remaining::Unbounded,
            remaining_time: Remaining::Unbounded,
            reason: None,
        };
    }

    let traffic_exceeded = exceeded(limits.traffic_bytes, usage.traffic_bytes);
    let time_exceeded = exceeded(limits.time_secs, usage.time_seconds);
    let reason = match (traffic_exceeded, time_exceeded) {
        (true, true) => Some(REASON_BOTH_EXCEEDED),
        (true, false) => Some(REASON_TRAFFIC_EXCEEDED),
        (false, true) => Some(REASON_TIME_EXCEEDED),
        (false, false) => None,
    };

    LimitCheck {
        can_connect: !traffic_exceeded && !time_exceeded,
        traffic_exceeded,
        time_exceeded,
        remaining_traffic: Remaining::of(limits.traffic_bytes, usage.traffic_bytes),
        remaining_time: Remaining::of(limits.time_secs, usage.time_seconds),
        reason: reason.map(str::to_string),
    }
}

/// Whether today's usage plus the live session has crossed a limit
pub fn check_during_session(
    tier: UserLimitTier,
    limits: Limits,
    usage: &DailyUsage,
    session: &SessionStats,
) -> bool {
    if tier != UserLimitTier::Standard {
        return false;
    }
    let traffic = usage.traffic_bytes.saturating_add(session.total_bytes());
    let time = usage.time_seconds.saturating_add(session.elapsed_seconds);
    exceeded(limits.traffic_bytes, traffic) || exceeded(limits.time_secs, time)
}

/// Simple exceeded/not answer for the status display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyLimitStatus {
    pub exceeded: bool,
    pub reason: Option<String>,
}

/// Whether a connect may proceed after consulting the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectDecision {
    Allowed,
    Rejected {
        reason: String,
        /// The rejection is quota related; offer an upgrade
        upgrade: bool,
    },
}

/// Owns `DailyUsage`
pub struct UsageLimitGuard {
    store: Arc<dyn KeyValueStore>,
    defaults: LimitsConfig,
    usage: Mutex<DailyUsage>,
    last_accumulated: Mutex<Option<u64>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

impl UsageLimitGuard {
    /// Load today's usage from `store`; a stale or unreadable record starts at zero
    pub fn new(store: Arc<dyn KeyValueStore>, defaults: LimitsConfig) -> Self {
        let today = today();
        let usage = match storage::load_json::<DailyUsage>(store.as_ref(), KEY_DAILY_USAGE) {
            Ok(Some(usage)) => usage.for_day(today),
            Ok(None) => DailyUsage::empty(today),
            Err(e) => {
                warn!(error = %e, "Failed to load daily usage, starting from zero");
                DailyUsage::empty(today)
            }
        };
        debug!(
            traffic = usage.traffic_bytes,
            time = usage.time_seconds,
            "Loaded daily usage"
        );

        Self {
            store,
            defaults,
            usage: Mutex::new(usage),
            last_accumulated: Mutex::new(None),
        }
    }

    /// Today's usage, rolling over to zero when the date has changed
    pub fn usage(&self) -> DailyUsage {
        let today = today();
        let mut usage = lock(&self.usage);
        if usage.date != today {
            info!(previous = %usage.date, "New day, resetting daily usage");
            *usage = DailyUsage::empty(today);
        }
        *usage
    }

    pub fn limits_for(&self, user: Option<&User>) -> Limits {
        Limits::for_user(user, &self.defaults)
    }

    pub fn check_before_connect(&self, user: Option<&User>) -> LimitCheck {
        check_before_connect(
            classify(user, Utc::now()),
            self.limits_for(user),
            &self.usage(),
        )
    }

    /// Quota state for display; Unlimited and Elevated are never exceeded
    pub fn check_daily_limit(&self, user: Option<&User>) -> DailyLimitStatus {
        let check = self.check_before_connect(user);
        let reason = if check.traffic_exceeded {
            Some("Daily traffic limit reached".to_string())
        } else if check.time_exceeded {
            Some("Daily time limit reached".to_string())
        } else {
            None
        };
        DailyLimitStatus {
            exceeded: !check.can_connect,
            reason,
        }
    }

    pub fn check_during_session(&self, user: Option<&User>, session: &SessionStats) -> bool {
        check_during_session(
            classify(user, Utc::now()),
            self.limits_for(user),
            &self.usage(),
            session,
        )
    }

    /// Fold a finished session into today's usage and persist it
    ///
    /// Returns false when this session was already accumulated.
    pub fn accumulate(&self, session: &FinishedSession) -> bool {
        {
            let mut last = lock(&self.last_accumulated);
            if *last == Some(session.session_id) {
                debug!(session_id = session.session_id, "Session already accumulated");
                return false;
            }
            *last = Some(session.session_id);
        }

        let traffic = session.stats.total_bytes();
        let time = session.duration_secs();
        let updated = {
            let today = today();
            let mut usage = lock(&self.usage);
            *usage = usage.for_day(today);
            usage.traffic_bytes = usage.traffic_bytes.saturating_add(traffic);
            usage.time_seconds = usage.time_seconds.saturating_add(time);
            *usage
        };
        info!(
            session_id = session.session_id,
            traffic,
            time,
            daily_traffic = updated.traffic_bytes,
            daily_time = updated.time_seconds,
            "Accumulated session usage"
        );
        self.persist(&updated);
        true
    }

    /// Replace today's totals with the backend's numbers
    pub fn adopt_server_totals(&self, traffic_bytes: u64, time_seconds: u64) {
        let updated = DailyUsage {
            date: today(),
            traffic_bytes,
            time_seconds,
        };
        *lock(&self.usage) = updated;
        debug!(traffic_bytes, time_seconds, "Adopted server usage totals");
        self.persist(&updated);
    }

    /// Decide a connect from the backend precheck, falling back to the local check
    ///
    /// A successful precheck is authoritative and its totals replace the
    /// local ones. Any failure other than a rejected token falls back to
    /// the client-side limits.
    pub fn decide(
        &self,
        precheck: &Result<PrecheckResponse, ApiError>,
        user: Option<&User>,
    ) -> ConnectDecision {
        match precheck {
            Ok(response) => {
                self.adopt_server_totals(response.daily_traffic_used, response.daily_time_used);
                if !response.can_connect {
                    let reason = response
                        .reject_reason
                        .clone()
                        .filter(|r| !r.is_empty())
                        .unwrap_or_else(|| "Connection denied".to_string());
                    let upgrade = reason.to_lowercase().contains("limit");
                    ConnectDecision::Rejected { reason, upgrade }
                } else if !response.node_allowed {
                    ConnectDecision::Rejected {
                        reason: "This server is not available on your plan".to_string(),
                        upgrade: true,
                    }
                } else {
                    ConnectDecision::Allowed
                }
            }
            Err(e) => {
                warn!(
                    error = %e,
                    "Connect precheck failed, using client-side limits (may differ from server plan)"
                );
                let check = self.check_before_connect(user);
                if check.can_connect {
                    ConnectDecision::Allowed
                } else {
                    ConnectDecision::Rejected {
                        reason: check.reason.unwrap_or_else(|| REASON_TRAFFIC_EXCEEDED.to_string()),
                        upgrade: true,
                    }
                }
            }
        }
    }

    fn persist(&self, usage: &DailyUsage) {
        if let Err(e) = storage::save_json(self.store.as_ref(), KEY_DAILY_USAGE, usage) {
            warn!(error = %e, "Failed to persist daily usage");
        }
    }
}
