//! Dynamic sleep adjustment.
//!
//! Every display gets the protocol's base delays scaled by three numbers:
//! a user multiplier, an adjustment factor that grows when a display keeps
//! failing tries and shrinks again once it behaves, and a short-term count
//! that grows with each retry of the exchange in progress.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use tracing::debug;
use crate::registry::{AtomicF64, Registry};
use crate::sleep::{scale, SleepEvent, SleepPolicy};
use crate::transport::DisplayPath;

/// Highest adjustment factor unless configured otherwise.
pub const DEFAULT_MAX_ADJUSTMENT_FACTOR: f64 = 3.0;

/// Exchanges between adjustment checks unless configured otherwise.
pub const DEFAULT_CHECK_INTERVAL: u32 = 2;

/// Tries needed in a window before its error rate is trusted.
const MIN_SAMPLE: u32 = 3;

/// Error free tries after which the factor is relaxed.
const RELAX_SAMPLE: u32 = 10;

const RELAX_DIVISOR: f64 = 1.5;

/// Error rate above which a window of `total` tries raises the factor.
fn error_threshold(total: u32) -> f64 {
    match total {
        0..=4 => 0.5,
        5..=10 => 0.3,
        _ => 0.1,
    }
}

/// The factor that follows `current` after a window with too many errors.
pub fn raised_factor(current: f64, user_multiplier: f64, ceiling: f64) -> f64 {
    let ratio = user_multiplier * current;
    let raised = if ratio <= 0.2 {
        ratio * 4.0 / user_multiplier
    } else if ratio <= 0.6 {
        ratio * 3.0 / user_multiplier
    } else if ratio <= 1.0 {
        ratio * 2.0 / user_multiplier
    } else if ratio <= 3.0 {
        ratio * 1.5 / user_multiplier
    } else {
        ceiling
    };

    raised.max(current).min(ceiling)
}

/// Adjustment state persisted between runs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DsaSnapshot {
    /// Multiplier applied on top of the user multiplier.
    pub adjustment_factor: f64,
    /// Exchanges between checks.
    pub check_interval: u32,
    /// Number of times the factor changed.
    #[serde(default)]
    pub total_adjustments: u32,
}

/// Adjustment window and factor of one display.
#[derive(Debug)]
pub struct DsaState {
    ok: AtomicU32,
    errors: AtomicU32,
    calls_since_check: AtomicU32,
    check_interval: AtomicU32,
    factor: AtomicF64,
    total_adjustments: AtomicU32,
}

impl DsaState {
    fn new(check_interval: u32) -> Self {
        DsaState {
            ok: AtomicU32::new(0),
            errors: AtomicU32::new(0),
            calls_since_check: AtomicU32::new(0),
            check_interval: AtomicU32::new(check_interval.max(1)),
            factor: AtomicF64::new(1.0),
            total_adjustments: AtomicU32::new(0),
        }
    }

    /// Counts a try in the current window.
    pub fn record_outcome(&self, ok: bool) {
        let counter = if ok { &self.ok } else { &self.errors };
        counter.fetch_add(1, Ordering::AcqRel);
    }

    /// The current adjustment factor.
    pub fn factor(&self) -> f64 {
        self.factor.load()
    }

    fn reset_window(&self) {
        self.ok.store(0, Ordering::Release);
        self.errors.store(0, Ordering::Release);
    }

    fn set_factor(&self, factor: f64) {
        self.factor.store(factor);
        self.total_adjustments.fetch_add(1, Ordering::AcqRel);
    }

    /// Called once per exchange; every `check_interval` calls, looks at
    /// the window and moves the factor.
    ///
    /// Returns the new factor when it changed.
    pub fn maybe_adjust(&self, user_multiplier: f64, ceiling: f64) -> Option<f64> {
        let calls = self.calls_since_check.fetch_add(1, Ordering::AcqRel) + 1;
        if calls < self.check_interval.load(Ordering::Acquire) {
            return None
        }
        self.calls_since_check.store(0, Ordering::Release);

        let ok = self.ok.load(Ordering::Acquire);
        let errors = self.errors.load(Ordering::Acquire);
        let total = ok + errors;
        if total < MIN_SAMPLE {
            return None
        }

        let current = self.factor();
        if errors as f64 / total as f64 > error_threshold(total) {
            let raised = raised_factor(current, user_multiplier, ceiling);
            self.reset_window();
            if raised != current {
                self.set_factor(raised);
                return Some(raised)
            }
        } else if errors == 0 && total >= RELAX_SAMPLE {
            self.reset_window();
            let relaxed = (current / RELAX_DIVISOR).max(1.0);
            if relaxed != current {
                self.set_factor(relaxed);
                return Some(relaxed)
            }
        }

        None
    }

    /// Copies the persistent part of the state.
    pub fn snapshot(&self) -> DsaSnapshot {
        DsaSnapshot {
            adjustment_factor: self.factor(),
            check_interval: self.check_interval.load(Ordering::Acquire),
            total_adjustments: self.total_adjustments.load(Ordering::Acquire),
        }
    }

    /// Replaces the state with a persisted one, clearing the window.
    pub fn restore(&self, snapshot: &DsaSnapshot, ceiling: f64) {
        let factor = if snapshot.adjustment_factor.is_finite() {
            snapshot.adjustment_factor.max(1.0).min(ceiling.max(1.0))
        } else {
            1.0
        };
        self.factor.store(factor);
        self.check_interval.store(snapshot.check_interval.max(1), Ordering::Release);
        self.total_adjustments.store(snapshot.total_adjustments, Ordering::Release);
        self.calls_since_check.store(0, Ordering::Release);
        self.reset_window();
    }
}

/// Sleep tuning state of one display.
#[derive(Debug)]
pub struct SleepData {
    user_multiplier: AtomicF64,
    short_term: AtomicU32,
    short_term_high: AtomicU32,
    dsa: DsaState,
}

/// Point-in-time copy of [`SleepData`].
#[derive(Clone, Debug, PartialEq)]
pub struct SleepSummary {
    /// User sleep multiplier.
    pub user_multiplier: f64,
    /// Short-term count of the exchange in progress or last run.
    pub short_term: u32,
    /// Highest short-term count seen.
    pub short_term_high: u32,
    /// Adjustment factor.
    pub adjustment_factor: f64,
    /// Exchanges between checks.
    pub check_interval: u32,
    /// Number of times the factor changed.
    pub total_adjustments: u32,
}

impl SleepData {
    pub(crate) fn new(user_multiplier: f64, check_interval: u32) -> Self {
        SleepData {
            user_multiplier: AtomicF64::new(user_multiplier),
            short_term: AtomicU32::new(1),
            short_term_high: AtomicU32::new(1),
            dsa: DsaState::new(check_interval),
        }
    }

    /// The user multiplier.
    pub fn user_multiplier(&self) -> f64 {
        self.user_multiplier.load()
    }

    pub(crate) fn set_user_multiplier(&self, multiplier: f64) {
        self.user_multiplier.store(multiplier)
    }

    /// The short-term count of the exchange in progress.
    pub fn short_term(&self) -> u32 {
        self.short_term.load(Ordering::Acquire)
    }

    /// Starts a new exchange at short-term count 1.
    pub fn reset_short_term(&self) {
        self.short_term.store(1, Ordering::Release);
    }

    /// Grows the short-term count for a retry.
    pub fn bump_short_term(&self) -> u32 {
        let count = self.short_term.fetch_add(1, Ordering::AcqRel) + 1;
        self.short_term_high.fetch_max(count, Ordering::AcqRel);
        count
    }

    /// Adaptive adjustment state.
    pub fn dsa(&self) -> &DsaState {
        &self.dsa
    }

    pub(crate) fn reset_stats(&self) {
        self.short_term_high.store(self.short_term(), Ordering::Release);
    }

    /// A copy of the state.
    pub fn summary(&self) -> SleepSummary {
        let dsa = self.dsa.snapshot();
        SleepSummary {
            user_multiplier: self.user_multiplier(),
            short_term: self.short_term(),
            short_term_high: self.short_term_high.load(Ordering::Acquire),
            adjustment_factor: dsa.adjustment_factor,
            check_interval: dsa.check_interval,
            total_adjustments: dsa.total_adjustments,
        }
    }
}

/// Options for [`DynamicSleep`].
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct DsaOptions {
    /// Whether the adjustment factor is tuned at all.
    pub dynamic: bool,
    /// Ceiling of the adjustment factor.
    pub max_adjustment_factor: f64,
}

impl Default for DsaOptions {
    fn default() -> Self {
        DsaOptions {
            dynamic: true,
            max_adjustment_factor: DEFAULT_MAX_ADJUSTMENT_FACTOR,
        }
    }
}

/// The [`SleepPolicy`] backed by the per-display data in a [`Registry`].
#[derive(Debug)]
pub struct DynamicSleep {
    registry: Arc<Registry>,
    options: DsaOptions,
}

impl DynamicSleep {
    /// Tunes the displays of `registry`.
    pub fn new(registry: Arc<Registry>, options: DsaOptions) -> Self {
        DynamicSleep {
            registry: registry,
            options: options,
        }
    }

    /// The options in effect.
    pub fn options(&self) -> &DsaOptions {
        &self.options
    }

    /// Loads a persisted state for `path`.
    pub fn restore(&self, path: &DisplayPath, snapshot: &DsaSnapshot) {
        let data = self.registry.get_or_create(path);
        data.sleep().dsa().restore(snapshot, self.options.max_adjustment_factor);
        debug!(display = %path, factor = data.sleep().dsa().factor(), "restored sleep adjustment");
    }

    /// The persistent state of `path`.
    pub fn snapshot(&self, path: &DisplayPath) -> DsaSnapshot {
        self.registry.get_or_create(path).sleep().dsa().snapshot()
    }
}

impl SleepPolicy for DynamicSleep {
    fn begin_exchange(&self, path: &DisplayPath) {
        let data = self.registry.get_or_create(path);
        let sleep = data.sleep();
        sleep.reset_short_term();
        if self.options.dynamic {
            if let Some(factor) = sleep.dsa().maybe_adjust(sleep.user_multiplier(), self.options.max_adjustment_factor) {
                debug!(display = %path, factor, "adjusted sleep factor");
            }
        }
    }

    fn record_outcome(&self, path: &DisplayPath, ok: bool) {
        if self.options.dynamic {
            self.registry.get_or_create(path).sleep().dsa().record_outcome(ok);
        }
    }

    fn note_retry(&self, path: &DisplayPath) {
        self.registry.get_or_create(path).sleep().bump_short_term();
    }

    fn adjusted_delay(&self, path: &DisplayPath, event: SleepEvent) -> Duration {
        let data = self.registry.get_or_create(path);
        let sleep = data.sleep();
        let factor = if self.options.dynamic { sleep.dsa().factor() } else { 1.0 };
        scale(event.base_delay(), sleep.user_multiplier() * factor * sleep.short_term() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy() -> (Arc<Registry>, DynamicSleep) {
        let registry = Arc::new(Registry::default());
        let policy = DynamicSleep::new(registry.clone(), DsaOptions::default());
        (registry, policy)
    }

    #[test]
    fn thresholds() {
        assert_eq!(error_threshold(3), 0.5);
        assert_eq!(error_threshold(10), 0.3);
        assert_eq!(error_threshold(11), 0.1);
    }

    #[test]
    fn raise_steps() {
        assert_eq!(raised_factor(1.0, 1.0, 3.0), 2.0);
        assert_eq!(raised_factor(2.0, 1.0, 3.0), 3.0);
        assert_eq!(raised_factor(1.0, 0.1, 3.0), 3.0);
        assert_eq!(raised_factor(1.0, 4.0, 3.0), 3.0);
        assert_eq!(raised_factor(3.0, 1.0, 3.0), 3.0);
    }

    #[test]
    fn small_windows_are_ignored() {
        let dsa = DsaState::new(1);
        dsa.record_outcome(false);
        dsa.record_outcome(false);
        assert_eq!(dsa.maybe_adjust(1.0, 3.0), None);
        assert_eq!(dsa.factor(), 1.0);
    }

    #[test]
    fn errors_raise_and_success_relaxes() {
        let dsa = DsaState::new(1);
        for _ in 0..3 {
            dsa.record_outcome(false);
        }
        assert_eq!(dsa.maybe_adjust(1.0, 3.0), Some(2.0));

        for _ in 0..RELAX_SAMPLE {
            dsa.record_outcome(true);
        }
        let relaxed = dsa.maybe_adjust(1.0, 3.0).unwrap();
        assert!((relaxed - 2.0 / 1.5).abs() < 1e-9);
        assert_eq!(dsa.snapshot().total_adjustments, 2);
    }

    #[test]
    fn checks_every_interval() {
        let dsa = DsaState::new(2);
        for _ in 0..4 {
            dsa.record_outcome(false);
        }
        assert_eq!(dsa.maybe_adjust(1.0, 3.0), None);
        assert_eq!(dsa.maybe_adjust(1.0, 3.0), Some(2.0));
    }

    #[test]
    fn restore_clamps() {
        let dsa = DsaState::new(2);
        dsa.restore(&DsaSnapshot { adjustment_factor: 50.0, check_interval: 0, total_adjustments: 4 }, 3.0);
        let snapshot = dsa.snapshot();
        assert_eq!(snapshot.adjustment_factor, 3.0);
        assert_eq!(snapshot.check_interval, 1);
        assert_eq!(snapshot.total_adjustments, 4);
    }

    #[test]
    fn delay_scales_with_retries() {
        let (registry, policy) = policy();
        let path = DisplayPath::i2c(5);
        registry.set_sleep_multiplier(&path, 2.0).unwrap();
        policy.begin_exchange(&path);
        assert_eq!(policy.adjusted_delay(&path, SleepEvent::WriteToRead), Duration::from_millis(80));
        policy.note_retry(&path);
        assert_eq!(policy.adjusted_delay(&path, SleepEvent::WriteToRead), Duration::from_millis(160));
        policy.begin_exchange(&path);
        assert_eq!(policy.adjusted_delay(&path, SleepEvent::PostSaveSettings), Duration::from_millis(400));
        assert_eq!(registry.summaries()[0].sleep.short_term_high, 2);
    }

    #[test]
    fn static_policy_ignores_factor() {
        let registry = Arc::new(Registry::default());
        let policy = DynamicSleep::new(registry.clone(), DsaOptions { dynamic: false, ..DsaOptions::default() });
        let path = DisplayPath::i2c(5);
        policy.restore(&path, &DsaSnapshot { adjustment_factor: 2.5, check_interval: 1, total_adjustments: 0 });
        policy.begin_exchange(&path);
        assert_eq!(policy.adjusted_delay(&path, SleepEvent::PostRead), Duration::from_millis(50));
    }

    proptest! {
        #[test]
        fn factor_never_exceeds_ceiling(
            outcomes in proptest::collection::vec(any::<bool>(), 0..200),
            multiplier in 0.05f64..5.0,
            ceiling in 1.0f64..6.0,
        ) {
            let dsa = DsaState::new(1);
            for ok in outcomes {
                dsa.record_outcome(ok);
                dsa.maybe_adjust(multiplier, ceiling);
                let factor = dsa.factor();
                prop_assert!(factor >= 1.0 && factor <= ceiling);
            }
        }
    }
}
