//! Initial batching of testcases
//!
//! Streams the ordered testcase list into contiguous batches that share a
//! single action, respect the cardinality cap and stay under the aggregate
//! expected-runtime cap. Batches cover every input case exactly once, in
//! input order.

use crate::config::TestCase;

/// Aggregate expected-runtime cap per initial batch in seconds.
pub const MAX_BATCH_RUNTIME_SECS: f64 = 60.0;

/// An ordered group of testcases submitted to the solution as one subprocess
/// invocation. Always non-empty, never mixes actions.
#[derive(Debug, Clone)]
pub struct Batch {
    testcases: Vec<TestCase>,
}

impl Batch {
    fn new(testcases: Vec<TestCase>) -> Self {
        debug_assert!(!testcases.is_empty());
        Self { testcases }
    }

    pub fn len(&self) -> usize {
        self.testcases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.testcases.is_empty()
    }

    pub fn action(&self) -> &str {
        self.testcases[0].action()
    }

    pub fn testcases(&self) -> &[TestCase] {
        &self.testcases
    }

    /// Names of the member testcases, in order.
    pub fn names(&self) -> Vec<String> {
        self.testcases.iter().map(|tc| tc.name.clone()).collect()
    }

    /// Sum of the members' runtime allowances.
    pub fn expected_runtime_secs(&self) -> f64 {
        self.testcases
            .iter()
            .map(|tc| tc.runtime_allowance_secs)
            .sum()
    }

    /// Nominal wall-clock budget: member allowances plus the per-batch floor.
    pub fn allowance_secs(&self, minimum_testbatch_time_secs: f64) -> f64 {
        self.expected_runtime_secs() + minimum_testbatch_time_secs
    }

    /// Split at `len / 2`. Callers must hold `len >= 2` so both sides stay
    /// non-empty.
    pub fn bisect(self) -> (Batch, Batch) {
        let half = self.testcases.len() / 2;
        let mut left = self.testcases;
        let right = left.split_off(half);
        (Batch::new(left), Batch::new(right))
    }
}

/// Group the ordered testcase list into initial batches. An action boundary
/// closes the current batch before the cardinality and runtime caps are
/// considered, so a batch may be emitted below the cardinality cap purely on
/// an action change.
pub fn collect_batches(testcases: &[TestCase], max_testbatch_size: usize) -> Vec<Batch> {
    let mut batches = Vec::new();
    let mut current: Vec<TestCase> = Vec::new();
    let mut expected_runtime = 0.0;

    for testcase in testcases {
        if let Some(first) = current.first() {
            if first.action() != testcase.action() {
                batches.push(Batch::new(std::mem::take(&mut current)));
                expected_runtime = 0.0;
            }
        }
        expected_runtime += testcase.runtime_allowance_secs;
        current.push(testcase.clone());
        if current.len() >= max_testbatch_size || expected_runtime >= MAX_BATCH_RUNTIME_SECS {
            batches.push(Batch::new(std::mem::take(&mut current)));
            expected_runtime = 0.0;
        }
    }
    if !current.is_empty() {
        batches.push(Batch::new(current));
    }
    batches
}
