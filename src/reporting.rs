//! Live test-status reporting.
//!
//! Parsers and workers push suite and test lifecycle events to
//! [`TestRunListener`] implementations. Listeners take `&self` and are
//! expected to use interior mutability; they are shared across tasks as
//! `Arc<dyn TestRunListener>`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Final disposition of one executed test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TestStatus {
    Passed,
    Failed,
    Skipped,
    AssumptionViolated,
    Incomplete,
}

/// Receives suite and test lifecycle events as they happen.
///
/// All methods default to no-ops so implementations only override what
/// they care about.
pub trait TestRunListener: Send + Sync {
    /// A test suite has started; `count` is the expected number of tests
    /// when known, 0 otherwise.
    fn suite_started(&self, _suite: &str, _count: usize) {}

    /// A test suite ran to completion. `duration` is the device-reported
    /// execution time when available.
    fn suite_ended(&self, _suite: &str, _duration: Duration) {}

    /// A test suite failed to run to completion.
    fn suite_errored(&self, _suite: &str, _message: &str) {}

    fn test_started(&self, _class_name: &str, _test_name: &str) {}

    /// A test completed successfully.
    fn test_ended(
        &self,
        _class_name: &str,
        _test_name: &str,
        _test_no: i32,
        _duration: Duration,
        _output: &str,
    ) {
    }

    fn test_failed(
        &self,
        _class_name: &str,
        _test_name: &str,
        _test_no: i32,
        _output: &str,
        _stack: &str,
    ) {
    }

    fn test_ignored(&self, _class_name: &str, _test_name: &str, _test_no: i32, _output: &str) {}

    /// The test was skipped because a runtime assumption did not hold on
    /// this device.
    fn test_assumption_violated(
        &self,
        _class_name: &str,
        _test_name: &str,
        _test_no: i32,
        _reason: &str,
    ) {
    }
}

/// Snapshot of aggregate results collected by [`RunStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub suites_started: usize,
    pub suites_ended: usize,
    pub suites_errored: usize,
    pub tests_passed: usize,
    pub tests_failed: usize,
    pub tests_ignored: usize,
    pub assumption_violations: usize,
    /// (class, test) pairs of failed tests, in observed order.
    pub failures: Vec<(String, String)>,
}

impl StatsSnapshot {
    pub fn tests_run(&self) -> usize {
        self.tests_passed + self.tests_failed + self.tests_ignored + self.assumption_violations
    }
}

/// Counting listener. Cheap enough to attach to every run.
#[derive(Default)]
pub struct RunStats {
    inner: Mutex<StatsSnapshot>,
}

impl RunStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.inner.lock().expect("stats lock poisoned").clone()
    }
}

impl TestRunListener for RunStats {
    fn suite_started(&self, _suite: &str, _count: usize) {
        self.inner.lock().expect("stats lock poisoned").suites_started += 1;
    }

    fn suite_ended(&self, _suite: &str, _duration: Duration) {
        self.inner.lock().expect("stats lock poisoned").suites_ended += 1;
    }

    fn suite_errored(&self, _suite: &str, _message: &str) {
        self.inner.lock().expect("stats lock poisoned").suites_errored += 1;
    }

    fn test_ended(
        &self,
        _class_name: &str,
        _test_name: &str,
        _test_no: i32,
        _duration: Duration,
        _output: &str,
    ) {
        self.inner.lock().expect("stats lock poisoned").tests_passed += 1;
    }

    fn test_failed(
        &self,
        class_name: &str,
        test_name: &str,
        _test_no: i32,
        _output: &str,
        _stack: &str,
    ) {
        let mut stats = self.inner.lock().expect("stats lock poisoned");
        stats.tests_failed += 1;
        stats
            .failures
            .push((class_name.to_string(), test_name.to_string()));
    }

    fn test_ignored(&self, _class_name: &str, _test_name: &str, _test_no: i32, _output: &str) {
        self.inner.lock().expect("stats lock poisoned").tests_ignored += 1;
    }

    fn test_assumption_violated(
        &self,
        _class_name: &str,
        _test_name: &str,
        _test_no: i32,
        _reason: &str,
    ) {
        self.inner
            .lock()
            .expect("stats lock poisoned")
            .assumption_violations += 1;
    }
}

/// Per-status counts keyed by fully qualified test name. Mostly useful in
/// assertions and small summaries.
#[derive(Default)]
pub struct StatusIndex {
    inner: Mutex<HashMap<String, TestStatus>>,
}

impl StatusIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status_of(&self, class_name: &str, test_name: &str) -> Option<TestStatus> {
        self.inner
            .lock()
            .expect("status lock poisoned")
            .get(&format!("{class_name}.{test_name}"))
            .copied()
    }

    fn record(&self, class_name: &str, test_name: &str, status: TestStatus) {
        self.inner
            .lock()
            .expect("status lock poisoned")
            .insert(format!("{class_name}.{test_name}"), status);
    }
}

impl TestRunListener for StatusIndex {
    fn test_started(&self, class_name: &str, test_name: &str) {
        self.record(class_name, test_name, TestStatus::Incomplete);
    }

    fn test_ended(
        &self,
        class_name: &str,
        test_name: &str,
        _test_no: i32,
        _duration: Duration,
        _output: &str,
    ) {
        self.record(class_name, test_name, TestStatus::Passed);
    }

    fn test_failed(
        &self,
        class_name: &str,
        test_name: &str,
        _test_no: i32,
        _output: &str,
        _stack: &str,
    ) {
        self.record(class_name, test_name, TestStatus::Failed);
    }

    fn test_ignored(&self, class_name: &str, test_name: &str, _test_no: i32, _output: &str) {
        self.record(class_name, test_name, TestStatus::Skipped);
    }

    fn test_assumption_violated(
        &self,
        class_name: &str,
        test_name: &str,
        _test_no: i32,
        _reason: &str,
    ) {
        self.record(class_name, test_name, TestStatus::AssumptionViolated);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_accumulate_across_categories() {
        let stats = RunStats::new();
        stats.suite_started("suite1", 3);
        stats.test_ended("C", "a", 1, Duration::from_millis(5), "");
        stats.test_failed("C", "b", 2, "", "trace");
        stats.test_ignored("C", "c", 3, "");
        stats.suite_ended("suite1", Duration::from_secs(1));

        let snap = stats.snapshot();
        assert_eq!(snap.tests_run(), 3);
        assert_eq!(snap.tests_passed, 1);
        assert_eq!(snap.failures, vec![("C".to_string(), "b".to_string())]);
        assert_eq!(snap.suites_ended, 1);
        assert_eq!(snap.suites_errored, 0);
    }

    #[test]
    fn status_index_tracks_transitions() {
        let index = StatusIndex::new();
        index.test_started("C", "a");
        assert_eq!(index.status_of("C", "a"), Some(TestStatus::Incomplete));
        index.test_assumption_violated("C", "a", 1, "no network");
        assert_eq!(index.status_of("C", "a"), Some(TestStatus::AssumptionViolated));
        assert_eq!(index.status_of("C", "missing"), None);
    }
}
