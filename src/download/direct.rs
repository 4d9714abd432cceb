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


//! Direct HTTP transfer strategy.
//!
//! Streams the remote body into a `.tmp` file inside the chapter's temp
//! directory, resuming from the partial file with a `Range` header when one
//! exists. Wrapped in a bounded retry (exponential backoff) for transient
//! network failures. Pause is advisory: the loop checks the flag before
//! each read and blocks in place, so resuming continues on the same
//! connection and byte offset.

use std::path::Path;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, warn};

use crate::download::downloader::{TransferCtx, TransferOutcome};
use crate::download::model::DownloadStatus;
use crate::error::{EngineError, Result};
use crate::file::paths::PathResolver;
use crate::source::MediaTrack;

const DOWNLOAD_BUFF_SZ: usize = 8 * 1024;

/// Run the direct strategy under its retry budget: `retries` extra
/// attempts with `2^attempt` second backoff, transient failures only.
pub(crate) async fn run(
    client: &Client,
    ctx: &TransferCtx<'_>,
    media: &MediaTrack,
    tmp_dir: &Path,
    file_stem: &str,
    retries: u32,
) -> Result<TransferOutcome> {
    let mut attempt = 0u32;
    loop {
        match transfer_once(client, ctx, media, tmp_dir, file_stem).await {
            Ok(outcome) => return Ok(outcome),
            Err(err) if err.is_transient() && attempt < retries => {
                attempt += 1;
                let backoff = Duration::from_secs(2u64.pow(attempt));
                warn!(%err, attempt, "transfer attempt failed, backing off");
                tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => return Ok(TransferOutcome::Cancelled),
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
            Err(err) => {
                return Err(EngineError::TransferFailed {
                    attempts: attempt + 1,
                    message: err.to_string(),
                })
            }
        }
    }
}

async fn transfer_once(
    client: &Client,
    ctx: &TransferCtx<'_>,
    media: &MediaTrack,
    tmp_dir: &Path,
    file_stem: &str,
) -> Result<TransferOutcome> {
    let partial = tmp_dir.join(format!("{file_stem}.{}", PathResolver::TMP_FILE_EXTENSION));
    let offset = match tokio::fs::metadata(&partial).await {
        Ok(meta) => meta.len(),
        Err(_) => 0,
    };

    let mut request = client.get(&media.url);
    for (key, value) in &media.headers {
        if !key.eq_ignore_ascii_case("range") {
            request = request.header(key, value);
        }
    }
    if offset > 0 {
        request = request.header("Range", format!("bytes={offset}-"));
    }

    let response = request.send().await.map_err(|err| EngineError::NetworkError {
        message: format!("request failed: {err}"),
        is_transient: true,
    })?;

    let (resume_at, total) = match response.status() {
        StatusCode::OK => {
            // Server ignored (or was never sent) the range; start over.
            (0, response.content_length().unwrap_or(0))
        }
        StatusCode::PARTIAL_CONTENT => {
            let content_range = response
                .headers()
                .get("content-range")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            let total = content_range
                .split('/')
                .nth(1)
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or_else(|| EngineError::NetworkError {
                    message: format!("invalid Content-Range: {content_range:?}"),
                    is_transient: false,
                })?;
            (offset, total)
        }
        StatusCode::RANGE_NOT_SATISFIABLE => {
            // The remote changed underneath our partial file.
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(EngineError::NetworkError {
                message: "range not satisfiable, restarting from zero".to_string(),
                is_transient: true,
            });
        }
        status if status.is_server_error() => {
            return Err(EngineError::NetworkError {
                message: format!("HTTP {status}"),
                is_transient: true,
            })
        }
        status => {
            return Err(EngineError::NetworkError {
                message: format!("HTTP {status}"),
                is_transient: false,
            })
        }
    };

    let file = if resume_at > 0 {
        OpenOptions::new().append(true).open(&partial).await?
    } else {
        File::create(&partial).await?
    };
    let mut writer = BufWriter::with_capacity(DOWNLOAD_BUFF_SZ, file);

    ctx.download.set_progress(resume_at, total);
    let mut written = resume_at;
    let mut stream = response.bytes_stream();

    loop {
        // Advisory pause, checked before each read. Blocking here keeps the
        // connection open so resume continues at the same offset.
        if ctx.pause.is_paused() {
            writer.flush().await?;
            ctx.publish_status(DownloadStatus::Queued);
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Ok(TransferOutcome::Cancelled),
                _ = ctx.pause.wait_while_paused() => {}
            }
            ctx.publish_status(DownloadStatus::Downloading);
        } else if ctx.download.status() == DownloadStatus::Queued {
            // A pause flickered past between checkpoints; reclaim the item.
            ctx.publish_status(DownloadStatus::Downloading);
        }

        let chunk = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                let _ = writer.flush().await;
                return Ok(TransferOutcome::Cancelled);
            }
            // Stop consuming the body the moment a pause lands, even when
            // data is already waiting.
            _ = ctx.pause.wait_until_paused() => continue,
            next = stream.next() => match next {
                None => break,
                Some(result) => result.map_err(|err| EngineError::NetworkError {
                    message: format!("stream error: {err}"),
                    is_transient: true,
                })?,
            }
        };

        writer.write_all(&chunk).await?;
        written += chunk.len() as u64;
        ctx.download.add_downloaded(chunk.len() as u64);
    }

    writer.flush().await?;

    if total > 0 && written < total {
        return Err(EngineError::NetworkError {
            message: format!("connection closed at {written}/{total} bytes"),
            is_transient: true,
        });
    }

    let final_name = tmp_dir.join(format!("{file_stem}.{}", final_extension(&media.url)));
    tokio::fs::rename(&partial, &final_name).await?;
    debug!(bytes = written, "direct transfer complete");
    Ok(TransferOutcome::Completed)
}

/// Extension for the completed artifact, taken from the media URL when it
/// names a recognized container.
fn final_extension(media_url: &str) -> &'static str {
    let ext = url::Url::parse(media_url)
        .ok()
        .and_then(|u| u.path().rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase()));
    match ext {
        Some(ext) => PathResolver::AUDIO_EXTENSIONS
            .iter()
            .find(|known| **known == ext)
            .copied()
            .unwrap_or("mp3"),
        None => "mp3",
    }
}
