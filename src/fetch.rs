use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;

const ATTEMPTS: u32 = 4;
const RETRY_DELAY: Duration = Duration::from_secs(60);

/// Downloads the oval definitions feed to `dest`, retrying on any transport
/// error or non-success status. Returns the last error once attempts run out.
pub async fn download_definitions(url: &str, dest: &Path) -> anyhow::Result<()> {
    download_with_delay(url, dest, RETRY_DELAY).await
}

async fn download_with_delay(url: &str, dest: &Path, delay: Duration) -> anyhow::Result<()> {
    let mut last_err = None;
    for attempt in 1..=ATTEMPTS {
        log::info!("downloading {url} (try {attempt})");
        match try_download(url, dest).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                log::info!("error downloading: {e:#}");
                last_err = Some(e);
                if attempt < ATTEMPTS {
                    log::info!("sleeping for {} seconds", delay.as_secs());
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("download failed")))
}

async fn try_download(url: &str, dest: &Path) -> anyhow::Result<()> {
    let rsp = reqwest::get(url).await?.error_for_status()?;
    let rsp_bytes = rsp.bytes().await?;
    let mut file = File::create(dest)
        .with_context(|| format!("creating {}", dest.display()))?;
    file.write_all(&rsp_bytes)?;
    Ok(())
}
