// Auricle - Audio Series Reader
// Copyright (C) 2025 Auricle Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Segmented/manifest transfer strategy (HLS/DASH).
//!
//! Hands the manifest URL to an external ffmpeg pipeline that demuxes and
//! remuxes the stream into a single audio container, forwarding custom
//! request headers. The source duration is probed first; progress is
//! computed from the `time=` stamps in the tool's log stream against that
//! duration, and an output that undershoots the source by more than 1% is
//! discarded as corrupt.
//!
//! An external process cannot block on our pause flag, so pausing kills
//! the tool and the item reverts to queued; a later resume restarts the
//! remux from zero. Cancellation terminates the process explicitly.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::process::Stdio;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::download::downloader::{TransferCtx, TransferOutcome};
use crate::error::{EngineError, Result};
use crate::source::MediaTrack;

/// The produced output may undershoot the source duration by at most this
/// fraction before it is treated as corrupt.
const DURATION_TOLERANCE: f64 = 0.01;

/// Tool log lines kept for error reporting.
const LOG_TAIL: usize = 8;

/// Whether a resolved media URL points at a segmented-stream manifest.
pub(crate) fn is_manifest_url(media_url: &str) -> bool {
    let path = match url::Url::parse(media_url) {
        Ok(parsed) => parsed.path().to_ascii_lowercase(),
        Err(_) => media_url.to_ascii_lowercase(),
    };
    path.ends_with(".m3u8") || path.ends_with(".mpd")
}

pub(crate) async fn run(
    ctx: &TransferCtx<'_>,
    media: &MediaTrack,
    tmp_dir: &Path,
    file_stem: &str,
) -> Result<TransferOutcome> {
    if ctx.pause.is_paused() {
        return Ok(TransferOutcome::Abandoned);
    }

    let source_duration = probe_duration(&media.url, Some(&media.headers)).await?;
    let total_ms = (source_duration * 1000.0) as u64;
    let output = tmp_dir.join(format!("{file_stem}.mka"));
    ctx.download.set_progress(0, total_ms);

    let mut command = Command::new("ffmpeg");
    command.arg("-y");
    if !media.headers.is_empty() {
        command.arg("-headers").arg(header_block(&media.headers));
    }
    command
        .arg("-i")
        .arg(&media.url)
        .arg("-vn")
        .arg("-c")
        .arg("copy")
        .arg(&output);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            EngineError::FfmpegNotFound
        } else {
            EngineError::RemuxFailed(format!("failed to spawn ffmpeg: {err}"))
        }
    })?;

    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| EngineError::RemuxFailed("failed to capture ffmpeg output".to_string()))?;
    let mut lines = BufReader::new(stderr).lines();
    let mut tail: VecDeque<String> = VecDeque::with_capacity(LOG_TAIL);

    loop {
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                terminate(&mut child, &output).await;
                return Ok(TransferOutcome::Cancelled);
            }
            // The tool cannot block on our flag; a pause kills it and the
            // item restarts from zero later.
            _ = ctx.pause.wait_until_paused() => {
                terminate(&mut child, &output).await;
                return Ok(TransferOutcome::Abandoned);
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Some(seconds) = parse_progress(&line) {
                        let done_ms = ((seconds * 1000.0) as u64).min(total_ms);
                        ctx.download.set_progress(done_ms, total_ms);
                    }
                    if tail.len() == LOG_TAIL {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(%err, "error reading remux tool output");
                    break;
                }
            }
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|err| EngineError::RemuxFailed(format!("ffmpeg did not exit cleanly: {err}")))?;
    if !status.success() {
        let _ = tokio::fs::remove_file(&output).await;
        let detail = tail
            .iter()
            .rev()
            .find(|l| !l.trim().is_empty())
            .cloned()
            .unwrap_or_default();
        return Err(EngineError::RemuxFailed(format!(
            "ffmpeg exited with {status}: {detail}"
        )));
    }

    // A segment fetch that stalls can still produce a zero exit with
    // truncated output; verify the duration before accepting it.
    let output_duration = probe_duration(&output.to_string_lossy(), None).await?;
    if output_duration < source_duration * (1.0 - DURATION_TOLERANCE) {
        let _ = tokio::fs::remove_file(&output).await;
        return Err(EngineError::RemuxFailed(format!(
            "output duration {output_duration:.1}s undershoots source {source_duration:.1}s"
        )));
    }

    ctx.download.set_progress(total_ms, total_ms);
    debug!(duration = source_duration, "remux complete");
    Ok(TransferOutcome::Completed)
}

/// Kill the tool and drop whatever it produced.
async fn terminate(child: &mut Child, output: &Path) {
    let _ = child.start_kill();
    let _ = child.wait().await;
    let _ = tokio::fs::remove_file(output).await;
}

/// `Key: Value` pairs joined with CRLF, the form the tool's `-headers`
/// option expects.
fn header_block(headers: &HashMap<String, String>) -> String {
    headers
        .iter()
        .map(|(key, value)| format!("{key}: {value}\r\n"))
        .collect()
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// Probe media duration in seconds via ffprobe.
async fn probe_duration(input: &str, headers: Option<&HashMap<String, String>>) -> Result<f64> {
    let mut command = Command::new("ffprobe");
    command.arg("-v").arg("error");
    if let Some(headers) = headers {
        if !headers.is_empty() {
            command.arg("-headers").arg(header_block(headers));
        }
    }
    command
        .arg("-print_format")
        .arg("json")
        .arg("-show_format")
        .arg(input)
        .stdin(Stdio::null());

    let probed = command.output().await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            EngineError::FfmpegNotFound
        } else {
            EngineError::RemuxFailed(format!("failed to spawn ffprobe: {err}"))
        }
    })?;

    if !probed.status.success() {
        return Err(EngineError::RemuxFailed(format!(
            "ffprobe failed for {input}"
        )));
    }

    let decoded: ProbeOutput = serde_json::from_slice(&probed.stdout)
        .map_err(|err| EngineError::RemuxFailed(format!("unreadable ffprobe output: {err}")))?;

    decoded
        .format
        .and_then(|f| f.duration)
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|d| *d > 0.0)
        .ok_or_else(|| EngineError::RemuxFailed(format!("no duration reported for {input}")))
}

/// Extract the elapsed output timestamp from a tool progress line.
fn parse_progress(line: &str) -> Option<f64> {
    let idx = line.find("time=")?;
    let rest = &line[idx + 5..];
    let end = rest.find(' ').unwrap_or(rest.len());
    parse_timestamp(&rest[..end])
}

/// Parse `HH:MM:SS.ss` into seconds.
fn parse_timestamp(timestamp: &str) -> Option<f64> {
    let parts: Vec<&str> = timestamp.split(':').collect();
    if parts.len() != 3 {
        return None;
    }
    let hours: f64 = parts[0].parse().ok()?;
    let minutes: f64 = parts[1].parse().ok()?;
    let seconds: f64 = parts[2].parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_urls_are_detected() {
        assert!(is_manifest_url("https://cdn.example/stream/master.m3u8"));
        assert!(is_manifest_url("https://cdn.example/audio.MPD?token=x"));
        assert!(!is_manifest_url("https://cdn.example/ch1.m4b"));
        assert!(!is_manifest_url("https://cdn.example/feed"));
    }

    #[test]
    fn timestamps_parse_to_seconds() {
        assert_eq!(parse_timestamp("00:00:30.50"), Some(30.5));
        assert_eq!(parse_timestamp("01:30:00.00"), Some(5400.0));
        assert_eq!(parse_timestamp("90.0"), None);
    }

    #[test]
    fn progress_lines_yield_elapsed_time() {
        let line = "size=1024kB time=00:01:23.45 bitrate=64.0kbits/s speed=2.0x";
        let parsed = parse_progress(line).unwrap();
        assert!((parsed - 83.45).abs() < 0.001);

        assert_eq!(parse_progress("no timestamps here"), None);
    }

    #[test]
    fn header_block_is_crlf_terminated() {
        let mut headers = HashMap::new();
        headers.insert("Referer".to_string(), "https://example.com".to_string());
        let block = header_block(&headers);
        assert_eq!(block, "Referer: https://example.com\r\n");
    }
}
