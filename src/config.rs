//! Runner configuration
//!
//! Parses the JSON configuration document handed into the container by the
//! host orchestrator: a `meta` section with runner options and the ordered
//! testcase list. The configuration is immutable after load.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;

/// Recognized options from the `meta` section. Unknown keys are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct Meta {
    /// Directory the submission lives in; created if missing
    #[serde(default = "default_dut_dir")]
    pub local_dut_dir: PathBuf,
    /// Optional tar archive to extract into the DUT directory
    #[serde(default)]
    pub local_testcase_tar_file: Option<PathBuf>,
    /// Where each batch manifest is written before invoking the solution
    #[serde(default = "default_testcase_filename")]
    pub local_testcase_filename: PathBuf,
    /// Build script filename under the DUT directory (may be absent at runtime)
    #[serde(default = "default_setup_name")]
    pub setup_name: String,
    /// Solution executable filename under the DUT directory
    #[serde(default = "default_solution_name")]
    pub solution_name: String,
    /// Deadline for the build script in seconds
    #[serde(default = "default_max_setup_time_secs")]
    pub max_setup_time_secs: f64,
    /// Maximum number of testcases per initial batch
    #[serde(default = "default_max_testbatch_size")]
    pub max_testbatch_size: usize,
    /// Additive floor on every batch allowance; absorbs per-batch startup cost
    #[serde(default = "default_minimum_testbatch_time_secs")]
    pub minimum_testbatch_time_secs: f64,
    /// Head-truncation cap for captured stdout and stderr of every subprocess
    #[serde(default = "default_limit_stdout_bytes")]
    pub limit_stdout_bytes: usize,
    /// Emit diagnostic lines to stderr
    #[serde(default)]
    pub debug: bool,
}

fn default_dut_dir() -> PathBuf {
    PathBuf::from("/dut")
}

fn default_testcase_filename() -> PathBuf {
    PathBuf::from("/testcases.json")
}

fn default_setup_name() -> String {
    "setup".to_string()
}

fn default_solution_name() -> String {
    "solution".to_string()
}

fn default_max_setup_time_secs() -> f64 {
    30.0
}

fn default_max_testbatch_size() -> usize {
    1
}

fn default_minimum_testbatch_time_secs() -> f64 {
    0.5
}

fn default_limit_stdout_bytes() -> usize {
    1024 * 1024
}

impl Default for Meta {
    fn default() -> Self {
        Self {
            local_dut_dir: default_dut_dir(),
            local_testcase_tar_file: None,
            local_testcase_filename: default_testcase_filename(),
            setup_name: default_setup_name(),
            solution_name: default_solution_name(),
            max_setup_time_secs: default_max_setup_time_secs(),
            max_testbatch_size: default_max_testbatch_size(),
            minimum_testbatch_time_secs: default_minimum_testbatch_time_secs(),
            limit_stdout_bytes: default_limit_stdout_bytes(),
            debug: false,
        }
    }
}

/// A single testcase: batching metadata plus the opaque payload forwarded to
/// the solution untouched.
#[derive(Debug, Clone, Deserialize)]
pub struct TestCase {
    pub name: String,
    pub runtime_allowance_secs: f64,
    pub testcase_data: Value,
}

impl TestCase {
    /// Action tag used to group compatible testcases into batches.
    pub fn action(&self) -> &str {
        self.testcase_data
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }
}

/// The full configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    #[serde(default)]
    pub meta: Meta,
    pub testcases: Vec<TestCase>,
}

impl RunnerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse configuration file {}", path.display()))
    }

    /// Path of the solution executable inside the DUT directory.
    pub fn solution_path(&self) -> PathBuf {
        self.meta.local_dut_dir.join(&self.meta.solution_name)
    }

    /// Path of the build script inside the DUT directory.
    pub fn setup_path(&self) -> PathBuf {
        self.meta.local_dut_dir.join(&self.meta.setup_name)
    }
}
