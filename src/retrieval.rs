//! The retrieval task: fetches one identifier's artifacts with yt-dlp.
//!
//! Runs once per claimed job, entirely off the request path. Downloads land
//! in a hidden staging directory and are renamed into the identifier's
//! directory only after both media streams verified non-empty, so the cache
//! accessor can never observe a half-written file. No ffmpeg involved: the
//! video-only and audio-only streams are fetched separately and served as-is.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result, bail};

use crate::error::CacheError;
use crate::identity::VideoId;
use crate::ledger::JobLedger;
use crate::store::{self, MediaStore};

/// Name of the external downloading tool, resolved through PATH.
pub const DOWNLOADER_BIN: &str = "yt-dlp";

/// Video-only selection: mp4/avc1 for broadest browser support, then any
/// mp4, then HLS, then whatever is best.
const VIDEO_FORMAT: &str = "bestvideo[ext=mp4][vcodec^=avc1]/\
                            bestvideo[ext=mp4]/\
                            bestvideo[protocol^=m3u8]/\
                            bestvideo";

/// Audio-only selection: m4a first, then HLS, then best available.
const AUDIO_FORMAT: &str = "bestaudio[ext=m4a]/\
                            bestaudio[protocol^=m3u8]/\
                            bestaudio";

/// Canonical watch URL handed to the downloader.
pub fn watch_url(id: &VideoId) -> String {
    format!("https://www.youtube.com/watch?v={id}")
}

/// Runs `yt-dlp --version` to fail loudly when the tool is missing.
pub fn ensure_downloader_available() -> Result<()> {
    let status = Command::new(DOWNLOADER_BIN)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(_) => bail!("{DOWNLOADER_BIN} is installed but returned a failure status"),
        Err(err) => bail!("{DOWNLOADER_BIN} is not installed or not in PATH: {err}"),
    }
}

/// Executes one claimed retrieval job and records its outcome in the ledger.
pub fn run(
    store: &MediaStore,
    ledger: &dyn JobLedger,
    id: &VideoId,
    job_ref: &str,
) -> Result<(), CacheError> {
    ledger.mark_running(job_ref)?;
    tracing::info!(video_id = %id, job_ref, "starting retrieval");

    match download_artifacts(store, id, job_ref) {
        Ok(()) => {
            ledger.mark_succeeded(job_ref)?;
            tracing::info!(video_id = %id, job_ref, "artifacts cached");
            Ok(())
        }
        Err(err) => {
            if let Err(mark_err) = ledger.mark_failed(job_ref) {
                tracing::error!(
                    job_ref,
                    error = %mark_err,
                    "could not record retrieval failure in the ledger"
                );
            }
            Err(CacheError::RetrievalFailed {
                video_id: id.as_str().to_owned(),
                reason: format!("{err:#}"),
            })
        }
    }
}

/// Downloads into staging, verifies, and promotes. The staging directory is
/// removed on every exit path.
fn download_artifacts(store: &MediaStore, id: &VideoId, job_ref: &str) -> Result<()> {
    let staging = store.staging_dir(id, job_ref);
    fs::create_dir_all(&staging)
        .with_context(|| format!("creating staging directory {}", staging.display()))?;

    let result = fetch_into_staging(&staging, id)
        .and_then(|()| promote(&staging, &store.artifact_dir(id)));

    if let Err(err) = fs::remove_dir_all(&staging) {
        tracing::warn!(
            staging = %staging.display(),
            error = %err,
            "could not remove staging directory"
        );
    }

    result
}

fn fetch_into_staging(staging: &Path, id: &VideoId) -> Result<()> {
    let url = watch_url(id);

    run_download(&url, VIDEO_FORMAT, &staging.join("video.%(ext)s"))
        .context("downloading video stream")?;
    run_download(&url, AUDIO_FORMAT, &staging.join("audio.%(ext)s"))
        .context("downloading audio stream")?;
    fetch_thumbnail(&url, staging);

    // yt-dlp can exit zero and still leave nothing usable behind, so check
    // the outputs before anything becomes visible.
    store::newest_nonempty(staging, "video")
        .context("video download finished but output file is missing or empty")?;
    store::newest_nonempty(staging, "audio")
        .context("audio download finished but output file is missing or empty")?;

    Ok(())
}

/// One yt-dlp invocation for a single stream.
fn run_download(url: &str, format: &str, output_template: &Path) -> Result<()> {
    let mut command = Command::new(DOWNLOADER_BIN);
    command
        .arg("--no-playlist")
        .arg("--force-ipv4")
        .arg("--newline")
        .arg("--no-continue")
        .arg("--no-part")
        // Native HLS downloader, so the fallback formats work without ffmpeg.
        .arg("--hls-prefer-native")
        .arg("--retries")
        .arg("5")
        .arg("--fragment-retries")
        .arg("5")
        .arg("--retry-sleep")
        .arg("1:3")
        .arg("--no-warnings")
        .arg("--no-progress")
        .arg("--format")
        .arg(format)
        .arg("--output")
        .arg(output_template.to_string_lossy().to_string())
        .arg(url);

    let output = command
        .output()
        .with_context(|| format!("executing {DOWNLOADER_BIN}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "{DOWNLOADER_BIN} exited with {} for {url}: {}",
            output.status,
            stderr_tail(&stderr)
        );
    }

    Ok(())
}

/// Best-effort thumbnail download; never fails the job.
fn fetch_thumbnail(url: &str, staging: &Path) {
    let output_pattern = staging.join("thumbnail").to_string_lossy().to_string();

    let mut command = Command::new(DOWNLOADER_BIN);
    command
        .arg("--write-thumbnail")
        .arg("--skip-download")
        .arg("--no-warnings")
        .arg("--no-progress")
        .arg("--output")
        .arg(output_pattern)
        .arg(url);

    match command.status() {
        Ok(status) if status.success() => {}
        Ok(status) => {
            tracing::warn!(url, %status, "thumbnail download exited with failure status");
        }
        Err(err) => {
            tracing::warn!(url, error = %err, "thumbnail download could not be executed");
        }
    }
}

/// Moves every staged file into the final directory. Renames are atomic on
/// the same filesystem, and staging lives inside the artifact directory, so
/// readers only ever see complete files.
fn promote(staging: &Path, final_dir: &Path) -> Result<()> {
    fs::create_dir_all(final_dir)
        .with_context(|| format!("creating artifact directory {}", final_dir.display()))?;

    for entry in fs::read_dir(staging)
        .with_context(|| format!("reading staging directory {}", staging.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let target = final_dir.join(entry.file_name());
        fs::rename(entry.path(), &target)
            .with_context(|| format!("finalizing {}", target.display()))?;
    }

    Ok(())
}

/// Keeps error payloads readable when yt-dlp dumps pages of diagnostics.
fn stderr_tail(stderr: &str) -> String {
    const MAX_LINES: usize = 5;
    let lines: Vec<&str> = stderr.lines().filter(|line| !line.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(MAX_LINES);
    lines[start..].join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity;

    // End-to-end retrieval behavior (stubbed yt-dlp on PATH) is covered in
    // tests/retrieval_task.rs; only the pure helpers are tested here.

    #[test]
    fn watch_url_is_canonical() {
        let vid = identity::resolve("abc12345678").unwrap();
        assert_eq!(
            watch_url(&vid),
            "https://www.youtube.com/watch?v=abc12345678"
        );
    }

    #[test]
    fn stderr_tail_keeps_the_last_lines() {
        let noisy = (0..20)
            .map(|n| format!("line {n}"))
            .collect::<Vec<_>>()
            .join("\n");
        let tail = stderr_tail(&noisy);
        assert!(tail.contains("line 19"));
        assert!(!tail.contains("line 3"));
    }
}
