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


//! Download unit of work, its state machine and the engine event stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::model::{Chapter, SourceId, Work};
use crate::source::MediaTrack;

/// Lifecycle of a download.
///
/// Legal transitions: `NotDownloaded → Queued → Downloading →
/// {Downloaded | Error}`, plus `Error → Queued` on an explicit re-queue and
/// `Downloading → Queued` when paused or descheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum DownloadStatus {
    NotDownloaded = 0,
    Queued = 1,
    Downloading = 2,
    Downloaded = 3,
    Error = 4,
}

impl DownloadStatus {
    /// Still wants scheduler attention (`status <= Downloading`).
    pub fn is_pending(self) -> bool {
        self <= DownloadStatus::Downloading
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DownloadStatus::Downloaded | DownloadStatus::Error)
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => DownloadStatus::NotDownloaded,
            1 => DownloadStatus::Queued,
            2 => DownloadStatus::Downloading,
            3 => DownloadStatus::Downloaded,
            _ => DownloadStatus::Error,
        }
    }
}

/// One unit of work: a chapter to fetch from its source.
///
/// Shared as `Arc<Download>` between queue snapshots, the scheduler and the
/// owning transfer task. Status and progress are atomics so observers read
/// them without locking; the scheduler and the owning task are the only
/// writers.
#[derive(Debug)]
pub struct Download {
    pub work: Arc<Work>,
    pub chapter: Arc<Chapter>,
    /// Hand the transfer to an OS-level downloader instead of running it
    /// internally.
    pub prefer_external: bool,
    status: AtomicU8,
    /// Units transferred so far: bytes for direct transfers, media
    /// milliseconds for remuxed ones. Monotonically non-decreasing while
    /// `Downloading`; reset on a new attempt.
    downloaded_units: AtomicU64,
    total_units: AtomicU64,
    media: Mutex<Option<MediaTrack>>,
}

impl Download {
    pub fn new(work: Arc<Work>, chapter: Arc<Chapter>) -> Self {
        Self::with_transfer(work, chapter, false)
    }

    pub fn with_transfer(work: Arc<Work>, chapter: Arc<Chapter>, prefer_external: bool) -> Self {
        Self {
            work,
            chapter,
            prefer_external,
            status: AtomicU8::new(DownloadStatus::NotDownloaded as u8),
            downloaded_units: AtomicU64::new(0),
            total_units: AtomicU64::new(0),
            media: Mutex::new(None),
        }
    }

    pub fn source_id(&self) -> SourceId {
        self.work.source_id
    }

    pub fn status(&self) -> DownloadStatus {
        DownloadStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: DownloadStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// `(downloaded, total)` in transfer units.
    pub fn progress(&self) -> (u64, u64) {
        (
            self.downloaded_units.load(Ordering::Acquire),
            self.total_units.load(Ordering::Acquire),
        )
    }

    pub fn progress_percent(&self) -> f64 {
        let (done, total) = self.progress();
        if total == 0 {
            0.0
        } else {
            (done as f64 / total as f64) * 100.0
        }
    }

    pub(crate) fn set_progress(&self, downloaded: u64, total: u64) {
        self.downloaded_units.store(downloaded, Ordering::Release);
        self.total_units.store(total, Ordering::Release);
    }

    pub(crate) fn add_downloaded(&self, units: u64) {
        self.downloaded_units.fetch_add(units, Ordering::AcqRel);
    }

    pub fn media(&self) -> Option<MediaTrack> {
        self.media.lock().unwrap().clone()
    }

    pub(crate) fn set_media(&self, media: MediaTrack) {
        *self.media.lock().unwrap() = Some(media);
    }

    /// Clear per-attempt state so the next attempt re-resolves its media
    /// and reports progress from zero.
    pub(crate) fn reset_attempt(&self) {
        *self.media.lock().unwrap() = None;
        self.set_progress(0, 0);
    }
}

/// Events broadcast by the engine, keyed by chapter id.
///
/// The UI and notification plumbing subscribe to this stream; nothing in
/// the engine blocks on slow consumers.
#[derive(Debug, Clone)]
pub enum DownloadEvent {
    StatusChanged {
        chapter_id: i64,
        status: DownloadStatus,
    },
    Progress {
        chapter_id: i64,
        downloaded: u64,
        total: u64,
    },
    /// A download settled in `Error`; carries display names for a toast.
    Failed {
        chapter_id: i64,
        work_title: String,
        chapter_name: String,
        reason: String,
    },
    /// Advisory only - the queue grew past a safety threshold.
    QueueWarning {
        queued: usize,
        max_from_one_source: usize,
        help_url: String,
    },
    /// A `prefer_external` download resolved its media; the host
    /// application takes it from here.
    HandedOff {
        chapter_id: i64,
        url: String,
        headers: HashMap<String, String>,
    },
}
