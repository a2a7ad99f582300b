//! Test-artifact unpacking
//!
//! Extracts the configured tar archive into the DUT directory through the
//! system tar binary. A broken or missing archive aborts the run before any
//! report is produced.

use std::path::Path;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::info;

pub async fn extract_tar(archive: &Path, dest: &Path) -> Result<()> {
    info!("Extracting {} into {}", archive.display(), dest.display());
    let output = Command::new("tar")
        .arg("-x")
        .arg("-f")
        .arg(archive)
        .arg("-C")
        .arg(dest)
        .output()
        .await
        .context("Failed to run tar")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "Extraction of {} failed: {}",
            archive.display(),
            stderr.trim()
        );
    }
    Ok(())
}
