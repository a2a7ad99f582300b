mod batch;
mod config;
mod runner;
mod scheduler;
mod supervisor;
mod unpack;

use std::io::Write;
use std::path::Path;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use crate::config::RunnerConfig;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let config_path = match std::env::args().nth(1) {
        Some(path) => path,
        None => {
            eprintln!("usage: dutrunner <config.json>");
            std::process::exit(1);
        }
    };
    let config = RunnerConfig::load(Path::new(&config_path))?;

    // Diagnostics go to stderr; stdout carries only the report document.
    let directive = if config.meta.debug {
        "dutrunner=debug"
    } else {
        "dutrunner=warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive.parse()?))
        .with_writer(std::io::stderr)
        .init();

    let report = runner::run_tests(&config).await?;

    let stdout = std::io::stdout();
    let mut handle = stdout.lock();
    serde_json::to_writer(&mut handle, &report)?;
    writeln!(handle)?;
    Ok(())
}
