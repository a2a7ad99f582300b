//! Time-budgeted bisection scheduling
//!
//! Runs a batch as one solution invocation. A failed batch yields no usable
//! per-case output, so the scheduler recursively halves it to localize the
//! offender, deducting already-consumed wall time from the remaining budget
//! until every case has an individual verdict or the budget runs dry.

use std::future::Future;
use std::pin::Pin;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;
use tracing::debug;

use crate::batch::Batch;
use crate::config::RunnerConfig;
use crate::supervisor::{execute_supervised, ExecutionSpec, ProcessOutcome};

/// Verdict record for one leaf of the bisection tree.
#[derive(Debug, Serialize, Deserialize)]
pub struct BatchResult {
    pub testcases: Vec<String>,
    pub process: ProcessOutcome,
}

pub struct BatchScheduler<'a> {
    config: &'a RunnerConfig,
}

impl<'a> BatchScheduler<'a> {
    pub fn new(config: &'a RunnerConfig) -> Self {
        Self { config }
    }

    fn floor_secs(&self) -> f64 {
        self.config.meta.minimum_testbatch_time_secs
    }

    /// Run one initial batch under its nominal allowance and return the
    /// results of the bisection tree in depth-first, left-first order.
    pub async fn schedule(&self, batch: Batch) -> Result<Vec<BatchResult>> {
        let allowance = batch.allowance_secs(self.floor_secs());
        let mut results = Vec::new();
        self.schedule_with_budget(batch, allowance, &mut results)
            .await?;
        Ok(results)
    }

    fn schedule_with_budget<'s>(
        &'s self,
        batch: Batch,
        budget_secs: f64,
        results: &'s mut Vec<BatchResult>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + 's>> {
        Box::pin(async move {
            self.write_manifest(&batch).await?;

            let spec = ExecutionSpec::new([
                self.config.solution_path().to_string_lossy().into_owned(),
                self.config
                    .meta
                    .local_testcase_filename
                    .to_string_lossy()
                    .into_owned(),
            ])
            .with_deadline_secs(budget_secs)
            .with_output_cap(self.config.meta.limit_stdout_bytes);

            let attempt_start = Instant::now();
            let outcome = execute_supervised(&spec).await;
            let elapsed = attempt_start.elapsed().as_secs_f64();

            if outcome.is_success() || batch.len() <= 1 {
                results.push(BatchResult {
                    testcases: batch.names(),
                    process: outcome,
                });
                return Ok(());
            }

            let remaining = budget_secs - elapsed;
            let nominal = batch.allowance_secs(self.floor_secs());
            if remaining <= nominal / 2.0 {
                debug!(
                    "Batch of {} failed with {:.1}s left of {:.1}s nominal, not bisecting",
                    batch.len(),
                    remaining,
                    nominal
                );
                results.push(BatchResult {
                    testcases: batch.names(),
                    process: outcome,
                });
                return Ok(());
            }

            // Scale child budgets so the siblings together cannot spend more
            // than what is left of the parent's budget.
            let scale = remaining / nominal;
            let (left, right) = batch.bisect();
            let left_budget = left.allowance_secs(self.floor_secs()) * scale;
            let right_budget = right.allowance_secs(self.floor_secs()) * scale;
            debug!(
                "Bisecting failed batch into {}+{} case(s), scale {:.2}, budgets {:.1}s / {:.1}s",
                left.len(),
                right.len(),
                scale,
                left_budget,
                right_budget
            );
            self.schedule_with_budget(left, left_budget, results).await?;
            self.schedule_with_budget(right, right_budget, results).await?;
            Ok(())
        })
    }

    /// Rewrite the per-batch manifest the solution reads, keyed by testcase
    /// name. Contents of the previous invocation are not preserved.
    async fn write_manifest(&self, batch: &Batch) -> Result<()> {
        let mut testcases = serde_json::Map::new();
        for tc in batch.testcases() {
            testcases.insert(tc.name.clone(), tc.testcase_data.clone());
        }
        let manifest = json!({ "testcases": testcases });
        let path = &self.config.meta.local_testcase_filename;
        tokio::fs::write(path, serde_json::to_vec(&manifest)?)
            .await
            .with_context(|| format!("Failed to write testcase manifest {}", path.display()))
    }
}
