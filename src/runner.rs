//! Run orchestration and report assembly
//!
//! Drives one container run end to end: DUT directory, archive unpack,
//! setup step, then the batched test phase. All subprocess outcomes
//! accumulate into a single `RunReport` written to stdout by the caller.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::batch::collect_batches;
use crate::config::RunnerConfig;
use crate::scheduler::{BatchResult, BatchScheduler};
use crate::supervisor::{execute_supervised, ExecutionSpec, ProcessOutcome};
use crate::unpack;

/// Complete description of one container run.
#[derive(Debug, Serialize, Deserialize)]
pub struct RunReport {
    /// Outcome of the setup step, `null` when no setup script exists
    pub setup: Option<ProcessOutcome>,
    /// Depth-first, left-first leaves of every bisection tree, in input order
    pub testbatches: Vec<BatchResult>,
    /// Wall time of the whole run; absent when the test phase was skipped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_runtime_secs: Option<f64>,
}

/// Execute the configured run: unpack, setup, then every initial batch.
pub async fn run_tests(config: &RunnerConfig) -> Result<RunReport> {
    let run_start = Instant::now();

    let dut_dir = &config.meta.local_dut_dir;
    tokio::fs::create_dir_all(dut_dir)
        .await
        .with_context(|| format!("Failed to create DUT directory {}", dut_dir.display()))?;

    if let Some(archive) = &config.meta.local_testcase_tar_file {
        unpack::extract_tar(archive, dut_dir).await?;
    }

    let setup = run_setup(config).await;
    if let Some(outcome) = &setup {
        if !outcome.is_success() {
            warn!(
                "Setup step failed with status {:?}, skipping test phase",
                outcome.status
            );
            return Ok(RunReport {
                setup,
                testbatches: Vec::new(),
                total_runtime_secs: None,
            });
        }
    }

    let scheduler = BatchScheduler::new(config);
    let mut testbatches = Vec::new();
    for batch in collect_batches(&config.testcases, config.meta.max_testbatch_size) {
        debug!(
            "Scheduling batch of {} \"{}\" case(s), expected runtime {:.1}s",
            batch.len(),
            batch.action(),
            batch.expected_runtime_secs()
        );
        testbatches.extend(scheduler.schedule(batch).await?);
    }

    Ok(RunReport {
        setup,
        testbatches,
        total_runtime_secs: Some(run_start.elapsed().as_secs_f64()),
    })
}

/// Run the setup script when one is present. An absent script is not a
/// failure: `setup` stays `null` and the test phase proceeds.
async fn run_setup(config: &RunnerConfig) -> Option<ProcessOutcome> {
    let setup_path = config.setup_path();
    if !setup_path.exists() {
        debug!(
            "No setup script at {}, proceeding to tests",
            setup_path.display()
        );
        return None;
    }

    info!("Running setup script {}", setup_path.display());
    let spec = ExecutionSpec::new([setup_path.to_string_lossy().into_owned()])
        .with_deadline_secs(config.meta.max_setup_time_secs)
        .with_output_cap(config.meta.limit_stdout_bytes);
    Some(execute_supervised(&spec).await)
}
