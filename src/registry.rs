//! Per-display runtime state shared between threads.
//!
//! Entries are created on first use and live as long as the registry so
//! that closed or removed displays keep their statistics. Each entry is a
//! set of atomics updated without locking by the one thread driving that
//! display. Operations spanning every display go through the
//! [`CrossDisplayLock`] instead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard};
use std::time::Duration;
use tracing::warn;
use crate::barrier::{CrossDisplayGuard, CrossDisplayLock};
use crate::dsa::{SleepData, SleepSummary, DEFAULT_CHECK_INTERVAL};
use crate::retry::{validate_max_tries, RetryOperation, RetryStats, TryOutcome, HISTOGRAM_BUCKETS};
use crate::transport::DisplayPath;
use crate::{Error, ErrorCode};

/// An `f64` stored in an `AtomicU64`.
#[derive(Debug)]
pub(crate) struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub(crate) fn new(value: f64) -> Self {
        AtomicF64(AtomicU64::new(value.to_bits()))
    }

    pub(crate) fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Release)
    }
}

/// Try ceiling and outcome histogram for one operation type.
#[derive(Debug)]
pub struct RetryCounters {
    current: AtomicU8,
    highest: AtomicU8,
    lowest: AtomicU8,
    histogram: [AtomicU32; HISTOGRAM_BUCKETS],
}

impl RetryCounters {
    fn new(max_tries: u8) -> Self {
        RetryCounters {
            current: AtomicU8::new(max_tries),
            highest: AtomicU8::new(max_tries),
            lowest: AtomicU8::new(max_tries),
            histogram: Default::default(),
        }
    }

    /// The try ceiling in effect.
    pub fn max_tries(&self) -> u8 {
        self.current.load(Ordering::Acquire)
    }

    fn set_max_tries(&self, tries: u8) {
        self.current.store(tries, Ordering::Release);
        self.highest.fetch_max(tries, Ordering::AcqRel);
        self.lowest.fetch_min(tries, Ordering::AcqRel);
    }

    fn record(&self, outcome: TryOutcome) -> Result<(), Error> {
        let bucket = outcome.bucket();
        match self.histogram.get(bucket) {
            Some(count) => {
                count.fetch_add(1, Ordering::AcqRel);
                Ok(())
            },
            None => Err(ErrorCode::Invalid(format!("{:?} outside the try histogram", outcome)).into()),
        }
    }

    fn reset(&self) {
        let current = self.max_tries();
        self.highest.store(current, Ordering::Release);
        self.lowest.store(current, Ordering::Release);
        for count in &self.histogram {
            count.store(0, Ordering::Release);
        }
    }

    /// A copy of the counters.
    pub fn summary(&self, operation: RetryOperation) -> RetrySummary {
        RetrySummary {
            operation: operation,
            current: self.max_tries(),
            highest: self.highest.load(Ordering::Acquire),
            lowest: self.lowest.load(Ordering::Acquire),
            histogram: self.histogram.iter().map(|c| c.load(Ordering::Acquire)).collect(),
        }
    }
}

/// Point-in-time copy of [`RetryCounters`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetrySummary {
    /// The operation type.
    pub operation: RetryOperation,
    /// Try ceiling in effect.
    pub current: u8,
    /// Highest ceiling ever set.
    pub highest: u8,
    /// Lowest ceiling ever set.
    pub lowest: u8,
    /// Outcome counts: fatal, exhausted, then success per try.
    pub histogram: Vec<u32>,
}

impl RetrySummary {
    /// Number of completed exchanges.
    pub fn total(&self) -> u32 {
        self.histogram.iter().sum()
    }

    /// Exchanges that succeeded on try `tries`.
    pub fn succeeded_on(&self, tries: u8) -> u32 {
        self.histogram.get(TryOutcome::Succeeded(tries).bucket()).cloned().unwrap_or(0)
    }

    /// Exchanges that ended with a fatal error.
    pub fn fatal(&self) -> u32 {
        self.histogram[TryOutcome::Fatal.bucket()]
    }

    /// Exchanges that ran out of tries.
    pub fn exhausted(&self) -> u32 {
        self.histogram[TryOutcome::Exhausted.bucket()]
    }
}

/// Runtime state of one display.
#[derive(Debug)]
pub struct PerDisplayData {
    path: DisplayPath,
    retries: [RetryCounters; 4],
    sleep: SleepData,
}

impl PerDisplayData {
    fn new(path: DisplayPath, defaults: &RegistryDefaults) -> Self {
        let tries = |op: RetryOperation| RetryCounters::new(defaults.max_tries[op.index()]);
        PerDisplayData {
            path: path,
            retries: [
                tries(RetryOperation::WriteOnly),
                tries(RetryOperation::WriteRead),
                tries(RetryOperation::MultiPartRead),
                tries(RetryOperation::MultiPartWrite),
            ],
            sleep: SleepData::new(defaults.sleep_multiplier, defaults.check_interval),
        }
    }

    /// The display this data belongs to.
    pub fn path(&self) -> &DisplayPath {
        &self.path
    }

    /// Counters for `op`.
    pub fn retries(&self, op: RetryOperation) -> &RetryCounters {
        &self.retries[op.index()]
    }

    /// Sleep tuning state.
    pub fn sleep(&self) -> &SleepData {
        &self.sleep
    }

    /// A copy of everything recorded for the display.
    pub fn summary(&self) -> DisplaySummary {
        DisplaySummary {
            path: self.path,
            retries: RetryOperation::ALL.iter()
                .map(|&op| self.retries(op).summary(op))
                .collect(),
            sleep: self.sleep.summary(),
        }
    }
}

/// Point-in-time copy of [`PerDisplayData`].
#[derive(Clone, Debug)]
pub struct DisplaySummary {
    /// The display.
    pub path: DisplayPath,
    /// Retry counters in [`RetryOperation::ALL`] order.
    pub retries: Vec<RetrySummary>,
    /// Sleep tuning state.
    pub sleep: SleepSummary,
}

impl DisplaySummary {
    /// Retry counters for `op`.
    pub fn retries(&self, op: RetryOperation) -> &RetrySummary {
        &self.retries[op.index()]
    }
}

/// Values new registry entries start with.
#[derive(Clone, Debug, PartialEq)]
pub struct RegistryDefaults {
    /// Try ceilings indexed by [`RetryOperation::index`].
    pub max_tries: [u8; 4],
    /// User sleep multiplier.
    pub sleep_multiplier: f64,
    /// Exchanges between adaptive sleep checks.
    pub check_interval: u32,
    /// Sleep after first taking the cross-display lock.
    pub grace: Duration,
}

impl Default for RegistryDefaults {
    fn default() -> Self {
        RegistryDefaults {
            max_tries: [
                RetryOperation::WriteOnly.default_max_tries(),
                RetryOperation::WriteRead.default_max_tries(),
                RetryOperation::MultiPartRead.default_max_tries(),
                RetryOperation::MultiPartWrite.default_max_tries(),
            ],
            sleep_multiplier: 1.0,
            check_interval: DEFAULT_CHECK_INTERVAL,
            grace: Duration::from_millis(0),
        }
    }
}

/// Map of display path to [`PerDisplayData`].
#[derive(Debug)]
pub struct Registry {
    displays: RwLock<HashMap<DisplayPath, Arc<PerDisplayData>>>,
    defaults: RwLock<RegistryDefaults>,
    barrier: CrossDisplayLock,
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new(RegistryDefaults::default())
    }
}

impl Registry {
    /// Creates an empty registry.
    pub fn new(defaults: RegistryDefaults) -> Self {
        Registry {
            barrier: CrossDisplayLock::new(defaults.grace),
            displays: Default::default(),
            defaults: RwLock::new(defaults),
        }
    }

    fn displays(&self) -> RwLockReadGuard<HashMap<DisplayPath, Arc<PerDisplayData>>> {
        self.displays.read().unwrap_or_else(|e| e.into_inner())
    }

    fn defaults(&self) -> RegistryDefaults {
        self.defaults.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// The data for `path`, created with the current defaults if absent.
    ///
    /// Waits while another thread runs a cross-display operation.
    pub fn get_or_create(&self, path: &DisplayPath) -> Arc<PerDisplayData> {
        self.barrier.wait_single();

        if let Some(data) = self.displays().get(path) {
            return data.clone()
        }

        let defaults = self.defaults();
        let mut displays = self.displays.write().unwrap_or_else(|e| e.into_inner());
        displays.entry(*path)
            .or_insert_with(|| Arc::new(PerDisplayData::new(*path, &defaults)))
            .clone()
    }

    /// The data for `path` if it has been created.
    pub fn get(&self, path: &DisplayPath) -> Option<Arc<PerDisplayData>> {
        self.barrier.wait_single();
        self.displays().get(path).cloned()
    }

    /// Number of displays with data.
    pub fn len(&self) -> usize {
        self.displays().len()
    }

    /// Whether no display has data yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Takes the cross-display lock, excluding single-display operations
    /// on other threads until dropped.
    pub fn lock_all(&self) -> CrossDisplayGuard {
        self.barrier.lock()
    }

    /// Sets the try ceiling for `op` on one display.
    pub fn set_max_tries(&self, path: &DisplayPath, op: RetryOperation, tries: u8) -> Result<(), Error> {
        let tries = validate_max_tries(tries)?;
        self.get_or_create(path).retries(op).set_max_tries(tries);
        Ok(())
    }

    /// Sets the try ceiling for `op` on every display, including ones
    /// created later.
    pub fn set_all_max_tries(&self, op: RetryOperation, tries: u8) -> Result<(), Error> {
        let tries = validate_max_tries(tries)?;
        let _guard = self.lock_all();
        self.defaults.write().unwrap_or_else(|e| e.into_inner()).max_tries[op.index()] = tries;
        for data in self.displays().values() {
            data.retries(op).set_max_tries(tries);
        }
        Ok(())
    }

    /// Sets the user sleep multiplier of one display.
    pub fn set_sleep_multiplier(&self, path: &DisplayPath, multiplier: f64) -> Result<(), Error> {
        let multiplier = validate_multiplier(multiplier)?;
        self.get_or_create(path).sleep().set_user_multiplier(multiplier);
        Ok(())
    }

    /// Sets the user sleep multiplier of every display, including ones
    /// created later.
    pub fn set_all_sleep_multipliers(&self, multiplier: f64) -> Result<(), Error> {
        let multiplier = validate_multiplier(multiplier)?;
        let _guard = self.lock_all();
        self.defaults.write().unwrap_or_else(|e| e.into_inner()).sleep_multiplier = multiplier;
        for data in self.displays().values() {
            data.sleep().set_user_multiplier(multiplier);
        }
        Ok(())
    }

    /// Calls `f` with every entry in path order while holding the
    /// cross-display lock.
    pub fn for_each<F: FnMut(&PerDisplayData)>(&self, mut f: F) {
        let _guard = self.lock_all();
        let mut entries: Vec<_> = self.displays().values().cloned().collect();
        entries.sort_by_key(|data| data.path);
        for data in &entries {
            f(data);
        }
    }

    /// A consistent copy of every entry, in path order.
    pub fn summaries(&self) -> Vec<DisplaySummary> {
        let mut summaries = Vec::new();
        self.for_each(|data| summaries.push(data.summary()));
        summaries
    }

    /// Clears histograms and high-water marks, keeping ceilings and sleep
    /// tuning.
    pub fn reset_stats(&self) {
        self.for_each(|data| {
            for retries in &data.retries {
                retries.reset();
            }
            data.sleep().reset_stats();
        });
    }
}

fn validate_multiplier(multiplier: f64) -> Result<f64, Error> {
    if multiplier > 0.0 && multiplier.is_finite() {
        Ok(multiplier)
    } else {
        Err(Error::Config(format!("sleep multiplier must be positive, got {}", multiplier)))
    }
}

impl RetryStats for Registry {
    fn max_tries(&self, display: &DisplayPath, op: RetryOperation) -> u8 {
        self.get_or_create(display).retries(op).max_tries()
    }

    fn record_tries(&self, path: &DisplayPath, op: RetryOperation, outcome: TryOutcome) -> Result<(), Error> {
        self.get_or_create(path).retries(op).record(outcome)
            .map_err(|e| {
                warn!(display = %path, %op, ?outcome, error = %e, "failed to record exchange outcome");
                e
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::MAX_MAX_TRIES;

    #[test]
    fn entries_are_created_once() {
        let registry = Registry::default();
        let path = DisplayPath::i2c(3);
        let a = registry.get_or_create(&path);
        let b = registry.get_or_create(&path);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        assert_eq!(a.retries(RetryOperation::WriteRead).max_tries(), 10);
    }

    #[test]
    fn ceiling_bounds_track_changes() {
        let registry = Registry::default();
        let path = DisplayPath::i2c(3);
        registry.set_max_tries(&path, RetryOperation::WriteRead, 3).unwrap();
        registry.set_max_tries(&path, RetryOperation::WriteRead, 12).unwrap();
        registry.set_max_tries(&path, RetryOperation::WriteRead, 5).unwrap();
        let summary = registry.get_or_create(&path).retries(RetryOperation::WriteRead).summary(RetryOperation::WriteRead);
        assert_eq!((summary.lowest, summary.current, summary.highest), (3, 5, 12));

        assert!(registry.set_max_tries(&path, RetryOperation::WriteRead, MAX_MAX_TRIES + 1).is_err());
        assert!(registry.set_max_tries(&path, RetryOperation::WriteRead, 0).is_err());
    }

    #[test]
    fn global_ceiling_applies_to_new_entries() {
        let registry = Registry::default();
        let old = DisplayPath::i2c(1);
        registry.get_or_create(&old);
        registry.set_all_max_tries(RetryOperation::WriteOnly, 7).unwrap();
        let new = DisplayPath::i2c(2);
        assert_eq!(registry.max_tries(&old, RetryOperation::WriteOnly), 7);
        assert_eq!(registry.max_tries(&new, RetryOperation::WriteOnly), 7);
    }

    #[test]
    fn histogram_counts_every_outcome() {
        let registry = Registry::default();
        let path = DisplayPath::i2c(9);
        let outcomes = [TryOutcome::Succeeded(1), TryOutcome::Succeeded(3), TryOutcome::Fatal, TryOutcome::Exhausted, TryOutcome::Succeeded(1)];
        for &outcome in &outcomes {
            registry.record_tries(&path, RetryOperation::WriteRead, outcome).unwrap();
        }
        let summary = registry.summaries().remove(0);
        let retries = summary.retries(RetryOperation::WriteRead);
        assert_eq!(retries.total(), outcomes.len() as u32);
        assert_eq!(retries.succeeded_on(1), 2);
        assert_eq!(retries.succeeded_on(3), 1);
        assert_eq!(retries.fatal(), 1);
        assert_eq!(retries.exhausted(), 1);

        registry.reset_stats();
        assert_eq!(registry.summaries()[0].retries(RetryOperation::WriteRead).total(), 0);
    }

    #[test]
    fn out_of_range_outcome_is_an_error() {
        let registry = Registry::default();
        let outcome = TryOutcome::Succeeded(MAX_MAX_TRIES + 1);
        assert!(registry.record_tries(&DisplayPath::i2c(0), RetryOperation::WriteOnly, outcome).is_err());
    }

    #[test]
    fn nested_cross_display_operations() {
        let registry = Registry::default();
        registry.get_or_create(&DisplayPath::i2c(0));
        let _guard = registry.lock_all();
        assert_eq!(registry.summaries().len(), 1);
        registry.set_all_max_tries(RetryOperation::WriteRead, 4).unwrap();
        assert_eq!(registry.max_tries(&DisplayPath::i2c(0), RetryOperation::WriteRead), 4);
    }

    #[test]
    fn atomic_f64() {
        let value = AtomicF64::new(1.5);
        assert_eq!(value.load(), 1.5);
        value.store(2.25);
        assert_eq!(value.load(), 2.25);
    }
}
