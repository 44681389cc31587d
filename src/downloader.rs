use std::path::Path;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::AppError;
use crate::progress::{ProgressReporter, Stage};

pub const FETCH_MAX_RETRIES: u32 = 3;
const SUBPROCESS_GRACE: Duration = Duration::from_secs(5);

fn count_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+)\s*/\s*(\d+)").expect("count pattern compiles"))
}

fn percent_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+)%").expect("percent pattern compiles"))
}

/// `"3/12"` style line → total item count.
pub(crate) fn parse_item_total(line: &str) -> Option<u64> {
    let captures = count_pattern().captures(line)?;
    captures.get(2)?.as_str().parse().ok()
}

/// `"45%"` style line → stage-relative percent.
pub(crate) fn parse_percent(line: &str) -> Option<u8> {
    let captures = percent_pattern().captures(line)?;
    captures.get(1)?.as_str().parse().ok()
}

/// Run the external downloader against `url` with its working directory set
/// to `workdir`, scanning stdout for progress lines. A non-zero exit
/// surfaces the subprocess's own output as the failure detail.
pub async fn run_downloader(
    config: &Config,
    url: &str,
    workdir: &Path,
    reporter: Option<&ProgressReporter>,
    cancel: &CancellationToken,
) -> Result<(), AppError> {
    let mut command = Command::new(&config.downloader_path);
    command
        .args(&config.downloader_args)
        .arg(url)
        .current_dir(workdir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    info!(url, workdir = %workdir.display(), "starting downloader");
    let mut child = command.spawn()?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Subprocess("downloader stdout unavailable".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::Subprocess("downloader stderr unavailable".into()))?;

    let stderr_task = tokio::spawn(async move {
        let mut text = String::new();
        let _ = BufReader::new(stderr).read_to_string(&mut text).await;
        text
    });

    let mut lines = BufReader::new(stdout).lines();
    let mut stdout_lines: Vec<String> = Vec::new();
    let mut downloading = false;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("download cancelled, terminating downloader");
                terminate(&mut child).await;
                stderr_task.abort();
                return Err(AppError::Cancelled);
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        debug!(line = line.as_str(), "downloader output");
                        if let Some(reporter) = reporter {
                            if let Some(total) = parse_item_total(&line) {
                                reporter.set_total_tracks(total);
                            }
                            if let Some(percent) = parse_percent(&line) {
                                if !downloading {
                                    reporter.set_stage(Stage::Downloading);
                                    downloading = true;
                                }
                                reporter.update_download(percent);
                            }
                        }
                        stdout_lines.push(line);
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!("failed to read downloader output: {err}");
                        break;
                    }
                }
            }
        }
    }

    let status = child.wait().await?;
    let stderr_text = stderr_task.await.unwrap_or_default();
    if let Some(reporter) = reporter {
        reporter.set_stage(Stage::Processing);
    }

    if !status.success() {
        let detail = if stderr_text.trim().is_empty() {
            stdout_lines.join("\n")
        } else {
            stderr_text.trim().to_string()
        };
        error!(status = %status, "downloader failed");
        return Err(AppError::Subprocess(detail));
    }
    Ok(())
}

async fn terminate(child: &mut Child) {
    let _ = child.start_kill();
    if time::timeout(SUBPROCESS_GRACE, child.wait()).await.is_err() {
        let _ = child.kill().await;
    }
}

/// Fetch a URL to `path` with bounded retries and exponential backoff.
/// Transient network failures and timeouts retry; the last attempt's error
/// is surfaced verbatim. Cancellation removes the partial file.
pub async fn download_file(
    client: &reqwest::Client,
    url: &str,
    path: &Path,
    retries: u32,
    cancel: &CancellationToken,
) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        match fetch_once(client, url, path, cancel).await {
            Ok(()) => return Ok(()),
            Err(AppError::Cancelled) => return Err(AppError::Cancelled),
            Err(err) if err.is_transient() && attempt < retries => {
                let delay = Duration::from_secs(1 << attempt.min(6));
                warn!("download attempt {attempt} failed; retrying in {delay:?}: {err}");
                time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

async fn fetch_once(
    client: &reqwest::Client,
    url: &str,
    path: &Path,
    cancel: &CancellationToken,
) -> Result<(), AppError> {
    let mut response = client.get(url).send().await?;
    if response.status().is_server_error() {
        return Err(AppError::Network(format!("HTTP status {}", response.status())));
    }
    if !response.status().is_success() {
        return Err(AppError::HttpStatus(response.status()));
    }
    let mut file = tokio::fs::File::create(path).await?;
    loop {
        let chunk = match response.chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(err) => {
                drop(file);
                let _ = tokio::fs::remove_file(path).await;
                return Err(err.into());
            }
        };
        if cancel.is_cancelled() {
            drop(file);
            let _ = tokio::fs::remove_file(path).await;
            return Err(AppError::Cancelled);
        }
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_totals_are_parsed_from_progress_lines() {
        assert_eq!(parse_item_total("Track 3/12"), Some(12));
        assert_eq!(parse_item_total("  7 / 9 complete"), Some(9));
        assert_eq!(parse_item_total("no counters here"), None);
    }

    #[test]
    fn percentages_are_parsed_from_progress_lines() {
        assert_eq!(parse_percent("Downloading... 45%"), Some(45));
        assert_eq!(parse_percent("100%"), Some(100));
        assert_eq!(parse_percent("half done"), None);
    }

    #[tokio::test]
    async fn cancelled_download_removes_the_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cover.jpg");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let client = reqwest::Client::new();
        let result = download_file(
            &client,
            "http://127.0.0.1:9/none",
            &path,
            FETCH_MAX_RETRIES,
            &cancel,
        )
        .await;
        assert!(matches!(result, Err(AppError::Cancelled)));
        assert!(!path.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_hosts_exhaust_retries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cover.jpg");
        let client = reqwest::Client::new();
        let result = download_file(
            &client,
            "http://127.0.0.1:9/none",
            &path,
            2,
            &CancellationToken::new(),
        )
        .await;
        assert!(result.is_err());
    }
}
