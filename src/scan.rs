use std::path::Path;

use anyhow::Context;
use tokio::process::Command;

/// Runs `oscap oval eval` over the downloaded definitions, producing the
/// results xml and the html report. oscap's exit status is not trusted;
/// anything on stderr marks the evaluation as failed.
pub async fn run_evaluator(
    definitions: &Path,
    results: &Path,
    report: &Path,
) -> anyhow::Result<()> {
    log::info!(
        "running: oscap oval eval --results {} --report {} {}",
        results.display(),
        report.display(),
        definitions.display()
    );
    let output = Command::new("oscap")
        .arg("oval")
        .arg("eval")
        .arg("--results")
        .arg(results)
        .arg("--report")
        .arg(report)
        .arg(definitions)
        .output()
        .await
        .context("running oscap")?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        anyhow::bail!("{stderr}");
    }
    Ok(())
}
