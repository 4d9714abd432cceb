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


//! Download scheduler and executor.
//!
//! A single long-lived scheduler task derives the active set from the live
//! queue on every queue change (plus an internal wake whenever a transfer
//! task finishes): pending downloads are grouped by source in queue order,
//! at most three distinct sources are taken, and the first pending item of
//! each becomes active. Tasks whose download fell out of that window are
//! cancelled and revert to queued; running transfers are never pre-empted
//! by arrival alone. Each active download runs as an independent task, so
//! one failing or cancelled transfer never disturbs its siblings.
//!
//! Per-download execution: free-space check, media resolution, temp
//! directory setup, a detached 50 ms progress sampler (aborted on every
//! exit path), strategy dispatch (direct vs. remux by URL), then the
//! exactly-one-artifact verification and atomic rename into place.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::download::model::{Download, DownloadEvent, DownloadStatus};
use crate::download::queue::DownloadQueue;
use crate::download::store::QueueStore;
use crate::download::{direct, remux};
use crate::error::{EngineError, Result};
use crate::file::disk::DiskProbe;
use crate::file::index::DownloadIndex;
use crate::file::paths::PathResolver;
use crate::source::SourceRegistry;

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long `stop` waits for a task to acknowledge cancellation before
/// aborting it.
const CANCEL_GRACE: Duration = Duration::from_secs(2);

/// Scheduler and transfer tuning.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Distinct sources transferring at once; one transfer per source.
    pub max_concurrent_sources: usize,
    /// Extra attempts for a failed direct transfer.
    pub transfer_retries: u32,
    /// Free-space floor checked before each transfer starts.
    pub min_free_bytes: u64,
    /// Progress sampler period.
    pub progress_interval: Duration,
    /// Advisory queue-size warning thresholds.
    pub warn_queued_total: usize,
    pub warn_queued_per_source: usize,
    /// Help link attached to the queue warning event.
    pub help_url: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sources: 3,
            transfer_retries: 2,
            min_free_bytes: 200 * 1024 * 1024,
            progress_interval: Duration::from_millis(50),
            warn_queued_total: 20,
            warn_queued_per_source: 10,
            help_url: "https://auricle.app/help/downloads".to_string(),
        }
    }
}

/// Advisory pause flag polled by the transfer strategies.
pub(crate) struct PauseFlag {
    state: watch::Sender<bool>,
}

impl PauseFlag {
    fn new() -> Self {
        let (state, _) = watch::channel(false);
        Self { state }
    }

    pub(crate) fn is_paused(&self) -> bool {
        *self.state.borrow()
    }

    fn pause(&self) {
        let _ = self.state.send_replace(true);
    }

    fn resume(&self) {
        let _ = self.state.send_replace(false);
    }

    /// Block until the flag is cleared.
    pub(crate) async fn wait_while_paused(&self) {
        let mut rx = self.state.subscribe();
        while *rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Block until the flag is set. Raced against reads so a transfer
    /// stops consuming data the moment a pause lands.
    pub(crate) async fn wait_until_paused(&self) {
        let mut rx = self.state.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

/// How a transfer strategy ended, other than by error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransferOutcome {
    Completed,
    /// Cancelled through the task's token; the canceller settles status.
    Cancelled,
    /// Gave up cooperatively (remux under pause); stays queued.
    Abandoned,
}

/// Shared handles a transfer strategy needs from its owning task.
pub(crate) struct TransferCtx<'a> {
    pub download: &'a Download,
    pub pause: &'a PauseFlag,
    pub cancel: &'a CancellationToken,
    pub events: &'a broadcast::Sender<DownloadEvent>,
}

impl TransferCtx<'_> {
    pub(crate) fn publish_status(&self, status: DownloadStatus) {
        self.download.set_status(status);
        let _ = self.events.send(DownloadEvent::StatusChanged {
            chapter_id: self.download.chapter.id,
            status,
        });
    }
}

/// How a download task settled, as seen by the scheduler.
enum Finished {
    Completed,
    HandedOff,
    Abandoned,
    Cancelled,
}

struct ActiveTask {
    source_id: i64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Aborts the progress sampler on every exit path.
struct SamplerGuard(JoinHandle<()>);

impl Drop for SamplerGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// The scheduler/executor core. Owns the live queue and the per-source
/// bounded set of running transfer tasks.
pub struct Downloader {
    config: DownloadConfig,
    client: reqwest::Client,
    queue: Arc<DownloadQueue>,
    store: Arc<QueueStore>,
    index: Arc<DownloadIndex>,
    registry: Arc<SourceRegistry>,
    disk: Arc<dyn DiskProbe>,
    events: broadcast::Sender<DownloadEvent>,
    pause: PauseFlag,
    active: Mutex<HashMap<i64, ActiveTask>>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
    wake: Notify,
}

impl Downloader {
    pub fn new(
        config: DownloadConfig,
        queue: Arc<DownloadQueue>,
        store: Arc<QueueStore>,
        index: Arc<DownloadIndex>,
        registry: Arc<SourceRegistry>,
        disk: Arc<dyn DiskProbe>,
    ) -> Result<Arc<Self>> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|err| EngineError::NetworkError {
                message: format!("failed to build HTTP client: {err}"),
                is_transient: false,
            })?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Arc::new(Self {
            config,
            client,
            queue,
            store,
            index,
            registry,
            disk,
            events,
            pause: PauseFlag::new(),
            active: Mutex::new(HashMap::new()),
            scheduler: Mutex::new(None),
            wake: Notify::new(),
        }))
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<DownloadQueue> {
        &self.queue
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: DownloadEvent) {
        let _ = self.events.send(event);
    }

    pub fn is_paused(&self) -> bool {
        self.pause.is_paused()
    }

    pub fn is_running(&self) -> bool {
        self.scheduler
            .lock()
            .unwrap()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    // ========================================================================
    // Queue mutation
    // ========================================================================

    /// Add downloads to the live queue and persist their identities.
    /// Idempotent per chapter: an already-queued chapter is not duplicated,
    /// but a duplicate that had settled in `Error` is reset for retry.
    pub async fn enqueue(&self, downloads: Vec<Arc<Download>>) -> Result<Vec<Arc<Download>>> {
        for download in &downloads {
            if download.status() == DownloadStatus::NotDownloaded {
                download.set_status(DownloadStatus::Queued);
            }
        }

        let (added, duplicates) = self.queue.add_all(downloads);

        for duplicate in &duplicates {
            if duplicate.status() == DownloadStatus::Error {
                duplicate.reset_attempt();
                self.publish_status(duplicate, DownloadStatus::Queued);
            }
        }
        for download in &added {
            self.emit(DownloadEvent::StatusChanged {
                chapter_id: download.chapter.id,
                status: DownloadStatus::Queued,
            });
        }

        self.store.add_all(&added).await?;
        self.wake.notify_one();
        Ok(added)
    }

    /// Remove every queued download matching the predicate, cancelling any
    /// running transfer among them.
    pub async fn remove_from_queue(
        &self,
        predicate: impl Fn(&Download) -> bool,
    ) -> Vec<Arc<Download>> {
        let removed = self.queue.remove_by(predicate);
        if removed.is_empty() {
            return removed;
        }

        {
            let mut active = self.active.lock().unwrap();
            for download in &removed {
                if let Some(task) = active.remove(&download.chapter.id) {
                    task.cancel.cancel();
                }
            }
        }

        let chapter_ids: Vec<i64> = removed.iter().map(|d| d.chapter.id).collect();
        if let Err(err) = self.store.remove_all(&chapter_ids).await {
            warn!(%err, "failed to remove downloads from the persistent queue");
        }
        for download in &removed {
            self.publish_status(download, DownloadStatus::NotDownloaded);
        }
        self.wake.notify_one();
        removed
    }

    // ========================================================================
    // Control surface
    // ========================================================================

    /// Start (or resume) scheduling. Also re-persists the pending queue so
    /// restored items are re-recorded once actually scheduled.
    pub fn start(self: &Arc<Self>) {
        self.pause.resume();
        self.ensure_scheduler();

        let downloader = Arc::clone(self);
        tokio::spawn(async move {
            let pending: Vec<Arc<Download>> = downloader
                .queue
                .snapshot()
                .iter()
                .filter(|d| d.status().is_pending())
                .cloned()
                .collect();
            if let Err(err) = downloader.store.add_all(&pending).await {
                warn!(%err, "failed to persist the download queue");
            }
        });
        self.wake.notify_one();
    }

    /// Pause all transfers. Running tasks block at their next pause
    /// checkpoint; every `Downloading` item reverts to `Queued`.
    /// Idempotent, never fails.
    pub fn pause(&self) {
        self.pause.pause();
        for download in self.queue.snapshot().iter() {
            if download.status() == DownloadStatus::Downloading {
                self.publish_status(download, DownloadStatus::Queued);
            }
        }
        debug!("downloads paused");
    }

    /// Cancel every running transfer and stop the scheduler. Items still
    /// mid-transfer are demoted to `Error` so they stay visible for manual
    /// retry. Idempotent, never fails.
    pub async fn stop(&self) {
        // Scheduler first, so a concurrent evaluation cannot start tasks
        // behind the drain below. Abort lands at its next await point,
        // after any in-flight evaluation has recorded its spawns.
        if let Some(handle) = self.scheduler.lock().unwrap().take() {
            handle.abort();
            let _ = tokio::time::timeout(CANCEL_GRACE, handle).await;
        }

        let tasks: Vec<ActiveTask> = {
            let mut active = self.active.lock().unwrap();
            active.drain().map(|(_, task)| task).collect()
        };
        for task in &tasks {
            task.cancel.cancel();
        }

        for download in self.queue.snapshot().iter() {
            if download.status() == DownloadStatus::Downloading {
                self.publish_status(download, DownloadStatus::Error);
            }
        }

        for task in tasks {
            let abort = task.handle.abort_handle();
            if tokio::time::timeout(CANCEL_GRACE, task.handle).await.is_err() {
                abort.abort();
            }
        }
        debug!("downloader stopped");
    }

    /// Stop everything and drop the whole queue, durably.
    pub async fn clear(&self) {
        self.stop().await;
        let removed = self.queue.clear();
        if let Err(err) = self.store.clear().await {
            warn!(%err, "failed to clear the persistent queue");
        }
        for download in removed {
            self.publish_status(&download, DownloadStatus::NotDownloaded);
        }
    }

    // ========================================================================
    // Scheduler
    // ========================================================================

    fn ensure_scheduler(self: &Arc<Self>) {
        let mut scheduler = self.scheduler.lock().unwrap();
        if scheduler.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }
        let downloader = Arc::clone(self);
        *scheduler = Some(tokio::spawn(async move {
            downloader.run_scheduler().await;
        }));
    }

    async fn run_scheduler(self: Arc<Self>) {
        debug!("scheduler started");
        let mut queue_rx = self.queue.subscribe();
        queue_rx.borrow_and_update();

        loop {
            self.evaluate();

            let has_pending = self
                .queue
                .snapshot()
                .iter()
                .any(|d| d.status().is_pending());
            let has_active = !self.active.lock().unwrap().is_empty();
            if !has_pending && !has_active {
                break;
            }

            tokio::select! {
                _ = queue_rx.changed() => {}
                _ = self.wake.notified() => {}
            }
        }
        debug!("scheduler stopped, queue fully settled");
    }

    /// One scheduling evaluation: compute the active window from the queue,
    /// cancel tasks that fell out of it, start tasks for newcomers.
    fn evaluate(self: &Arc<Self>) {
        let snapshot = self.queue.snapshot();
        let selected = select_active(&snapshot, self.config.max_concurrent_sources);
        let keep: Vec<i64> = selected.iter().map(|d| d.chapter.id).collect();

        let mut active = self.active.lock().unwrap();

        // Cancel tasks whose download fell out of the window (queue was
        // reordered, or their item settled). Displaced items go back to
        // Queued - they are still wanted, only descheduled.
        let dropped: Vec<i64> = active
            .keys()
            .filter(|id| !keep.contains(id))
            .copied()
            .collect();
        for chapter_id in dropped {
            if let Some(task) = active.remove(&chapter_id) {
                task.cancel.cancel();
                if let Some(download) = snapshot.iter().find(|d| d.chapter.id == chapter_id) {
                    if download.status() == DownloadStatus::Downloading {
                        self.publish_status(download, DownloadStatus::Queued);
                    }
                }
            }
        }

        if self.pause.is_paused() {
            return;
        }

        for download in selected {
            if active.contains_key(&download.chapter.id) {
                continue;
            }
            // A displaced task from the same source may still be unwinding;
            // never run two transfers against one source.
            if active
                .values()
                .any(|task| task.source_id == download.source_id())
            {
                continue;
            }

            let cancel = CancellationToken::new();
            let downloader = Arc::clone(self);
            let task_download = download.clone();
            let task_cancel = cancel.clone();
            let handle = tokio::spawn(async move {
                downloader.run_download(&task_download, &task_cancel).await;
                downloader
                    .active
                    .lock()
                    .unwrap()
                    .remove(&task_download.chapter.id);
                downloader.wake.notify_one();
            });

            active.insert(
                download.chapter.id,
                ActiveTask {
                    source_id: download.source_id(),
                    cancel,
                    handle,
                },
            );
        }
    }

    // ========================================================================
    // Per-download execution
    // ========================================================================

    async fn run_download(self: &Arc<Self>, download: &Arc<Download>, cancel: &CancellationToken) {
        let chapter_id = download.chapter.id;
        match self.download_chapter(download, cancel).await {
            Ok(Finished::Completed) => {
                self.publish_status(download, DownloadStatus::Downloaded);
                let (done, total) = download.progress();
                self.emit(DownloadEvent::Progress {
                    chapter_id,
                    downloaded: done,
                    total,
                });
                self.queue.remove(chapter_id);
                if let Err(err) = self.store.remove(chapter_id).await {
                    warn!(%err, chapter_id, "failed to drop completed download from store");
                }
                info!(
                    chapter = %download.chapter.name,
                    work = %download.work.title,
                    "download complete"
                );
            }
            Ok(Finished::HandedOff) => {
                self.queue.remove(chapter_id);
                if let Err(err) = self.store.remove(chapter_id).await {
                    warn!(%err, chapter_id, "failed to drop handed-off download from store");
                }
            }
            Ok(Finished::Abandoned) => {
                self.publish_status(download, DownloadStatus::Queued);
            }
            Ok(Finished::Cancelled) => {
                // Whoever cancelled the token settles the status.
            }
            Err(err) => {
                self.publish_status(download, DownloadStatus::Error);
                warn!(
                    %err,
                    chapter = %download.chapter.name,
                    work = %download.work.title,
                    "download failed"
                );
                self.emit(DownloadEvent::Failed {
                    chapter_id,
                    work_title: download.work.title.clone(),
                    chapter_name: download.chapter.name.clone(),
                    reason: err.to_string(),
                });
            }
        }
    }

    async fn download_chapter(
        self: &Arc<Self>,
        download: &Arc<Download>,
        cancel: &CancellationToken,
    ) -> Result<Finished> {
        let source = self
            .registry
            .get(download.source_id())
            .ok_or_else(|| {
                EngineError::StreamResolutionFailed(format!(
                    "source {} is not loaded",
                    download.source_id()
                ))
            })?;

        download.set_progress(0, 0);

        // Free space first; an undersized volume fails fast, no retry.
        let root = self.index.root();
        if let Some(free) = self.disk.free_space(&root) {
            if free < self.config.min_free_bytes {
                return Err(EngineError::InsufficientStorage {
                    need: self.config.min_free_bytes,
                    have: free,
                });
            }
        }

        // Resolve the stream descriptor unless a previous attempt cached one.
        let media = match download.media() {
            Some(media) => media,
            None => {
                let media = source
                    .resolve_media(&download.chapter)
                    .await
                    .map_err(|err| EngineError::StreamResolutionFailed(err.to_string()))?;
                download.set_media(media.clone());
                media
            }
        };

        if download.prefer_external {
            self.emit(DownloadEvent::HandedOff {
                chapter_id: download.chapter.id,
                url: media.url.clone(),
                headers: media.headers.clone(),
            });
            return Ok(Finished::HandedOff);
        }

        let work_dir = root
            .join(PathResolver::source_dir_name(source.name()))
            .join(PathResolver::work_dir_name(&download.work.title));
        tokio::fs::create_dir_all(&work_dir).await?;

        let chapter_dir_name = PathResolver::chapter_dir_name(
            &download.chapter.name,
            download.chapter.group.as_deref(),
        );
        let tmp_dir = work_dir.join(format!("{chapter_dir_name}{}", PathResolver::TMP_DIR_SUFFIX));
        tokio::fs::create_dir_all(&tmp_dir).await?;

        // Stale fragments from an aborted attempt are purged unless the
        // resolved stream is already partially downloaded and resumable.
        let is_direct = !remux::is_manifest_url(&media.url);
        let partial = tmp_dir.join(format!(
            "{chapter_dir_name}.{}",
            PathResolver::TMP_FILE_EXTENSION
        ));
        let resumable = is_direct
            && tokio::fs::metadata(&partial)
                .await
                .map(|m| m.len() > 0)
                .unwrap_or(false);
        if !resumable {
            purge_fragments(&tmp_dir).await;
        }

        self.publish_status(download, DownloadStatus::Downloading);
        let _sampler = SamplerGuard(self.spawn_progress_sampler(download.clone()));

        let ctx = TransferCtx {
            download,
            pause: &self.pause,
            cancel,
            events: &self.events,
        };

        let outcome = if is_direct {
            direct::run(
                &self.client,
                &ctx,
                &media,
                &tmp_dir,
                &chapter_dir_name,
                self.config.transfer_retries,
            )
            .await?
        } else {
            remux::run(&ctx, &media, &tmp_dir, &chapter_dir_name).await?
        };

        match outcome {
            TransferOutcome::Cancelled => return Ok(Finished::Cancelled),
            TransferOutcome::Abandoned => return Ok(Finished::Abandoned),
            TransferOutcome::Completed => {}
        }

        let final_dir = work_dir.join(&chapter_dir_name);
        finalize(&tmp_dir, &final_dir).await?;
        self.index
            .add_chapter(source.as_ref(), &download.work.title, &chapter_dir_name);

        Ok(Finished::Completed)
    }

    fn spawn_progress_sampler(&self, download: Arc<Download>) -> JoinHandle<()> {
        let events = self.events.clone();
        let interval = self.config.progress_interval;
        tokio::spawn(async move {
            let mut last = (u64::MAX, u64::MAX);
            loop {
                tokio::time::sleep(interval).await;
                let (downloaded, total) = download.progress();
                if (downloaded, total) != last {
                    last = (downloaded, total);
                    let _ = events.send(DownloadEvent::Progress {
                        chapter_id: download.chapter.id,
                        downloaded,
                        total,
                    });
                }
            }
        })
    }

    fn publish_status(&self, download: &Download, status: DownloadStatus) {
        download.set_status(status);
        self.emit(DownloadEvent::StatusChanged {
            chapter_id: download.chapter.id,
            status,
        });
    }
}

/// The scheduling window: group pending downloads by source in queue
/// order, take at most `max_sources` distinct sources, and from each the
/// first pending item. At most one transfer per source, bounded fan-out
/// across sources.
fn select_active(snapshot: &[Arc<Download>], max_sources: usize) -> Vec<Arc<Download>> {
    let mut sources_seen: Vec<i64> = Vec::new();
    let mut selected: Vec<Arc<Download>> = Vec::new();

    for download in snapshot.iter().filter(|d| d.status().is_pending()) {
        let source_id = download.source_id();
        if sources_seen.contains(&source_id) {
            continue;
        }
        if sources_seen.len() == max_sources {
            break;
        }
        sources_seen.push(source_id);
        selected.push(download.clone());
    }

    selected
}

/// Drop leftover partial-transfer files from a temp directory.
async fn purge_fragments(tmp_dir: &Path) {
    let Ok(mut entries) = tokio::fs::read_dir(tmp_dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(&format!(".{}", PathResolver::TMP_FILE_EXTENSION)) {
            let _ = tokio::fs::remove_file(entry.path()).await;
        }
    }
}

/// Verify the completed temp directory holds exactly one non-temporary
/// artifact, then atomically rename it into place.
pub(crate) async fn finalize(tmp_dir: &Path, final_dir: &Path) -> Result<()> {
    let mut entries = tokio::fs::read_dir(tmp_dir).await?;
    let mut artifacts = 0usize;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !PathResolver::is_temp_entry(&name) {
            artifacts += 1;
        }
    }
    if artifacts != 1 {
        return Err(EngineError::FinalizeFailed(format!(
            "expected exactly one artifact in {}, found {artifacts}",
            tmp_dir.display()
        )));
    }

    if final_dir.exists() {
        tokio::fs::remove_dir_all(final_dir).await.map_err(|err| {
            EngineError::FinalizeFailed(format!(
                "could not replace {}: {err}",
                final_dir.display()
            ))
        })?;
    }
    tokio::fs::rename(tmp_dir, final_dir).await.map_err(|err| {
        EngineError::FinalizeFailed(format!(
            "could not rename {} into place: {err}",
            tmp_dir.display()
        ))
    })?;
    Ok(())
}
