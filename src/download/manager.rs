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


//! Facade over the download engine.
//!
//! Composes the downloader, the filesystem index, the persistent stores and
//! the path rules behind the operations the rest of the application calls:
//! enqueue with policy filtering, queue control, membership/count/size
//! queries, immediate and deferred deletion, and folder renames that keep
//! the index in sync with the disk.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::download::downloader::{DownloadConfig, Downloader};
use crate::download::model::{Download, DownloadEvent, DownloadStatus};
use crate::download::pending::PendingDeletionStore;
use crate::download::queue::DownloadQueue;
use crate::download::store::QueueStore;
use crate::error::{EngineError, Result};
use crate::file::disk::{DiskProbe, SystemDiskProbe};
use crate::file::index::DownloadIndex;
use crate::file::paths::PathResolver;
use crate::model::{Chapter, Library, Work};
use crate::source::SourceRegistry;
use crate::storage::Database;

/// User policy applied when filtering chapters before enqueue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadPreferences {
    /// Skip chapters the user already finished.
    pub skip_read_chapters: bool,
    /// Categories whose works download read chapters anyway.
    pub skip_read_override_categories: Vec<i64>,
    /// Whether bookmarked chapters may be downloaded.
    pub allow_bookmarked: bool,
}

impl Default for DownloadPreferences {
    fn default() -> Self {
        Self {
            skip_read_chapters: true,
            skip_read_override_categories: Vec::new(),
            allow_bookmarked: false,
        }
    }
}

/// Whether a chapter passes the download policy.
fn passes_policy(prefs: &DownloadPreferences, work: &Work, chapter: &Chapter) -> bool {
    if chapter.read && prefs.skip_read_chapters {
        let overridden = work
            .category_ids
            .iter()
            .any(|c| prefs.skip_read_override_categories.contains(c));
        if !overridden {
            return false;
        }
    }
    if chapter.bookmarked && !prefs.allow_bookmarked {
        return false;
    }
    true
}

pub struct DownloadManager {
    downloader: Arc<Downloader>,
    index: Arc<DownloadIndex>,
    store: Arc<QueueStore>,
    pending: PendingDeletionStore,
    registry: Arc<SourceRegistry>,
    library: Arc<dyn Library>,
    prefs: RwLock<DownloadPreferences>,
}

impl DownloadManager {
    pub async fn new(
        db: &Database,
        registry: Arc<SourceRegistry>,
        library: Arc<dyn Library>,
        root: PathBuf,
        config: DownloadConfig,
        prefs: DownloadPreferences,
    ) -> Result<Arc<Self>> {
        Self::with_disk_probe(
            db,
            registry,
            library,
            root,
            config,
            prefs,
            Arc::new(SystemDiskProbe),
        )
        .await
    }

    pub async fn with_disk_probe(
        db: &Database,
        registry: Arc<SourceRegistry>,
        library: Arc<dyn Library>,
        root: PathBuf,
        config: DownloadConfig,
        prefs: DownloadPreferences,
        disk: Arc<dyn DiskProbe>,
    ) -> Result<Arc<Self>> {
        let queue = Arc::new(DownloadQueue::new());
        let store = Arc::new(QueueStore::new(db));
        let index = Arc::new(DownloadIndex::new(registry.clone(), root));
        let downloader = Downloader::new(
            config,
            queue,
            store.clone(),
            index.clone(),
            registry.clone(),
            disk,
        )?;

        Ok(Arc::new(Self {
            downloader,
            index,
            store,
            pending: PendingDeletionStore::new(db),
            registry,
            library,
            prefs: RwLock::new(prefs),
        }))
    }

    // ========================================================================
    // Observation
    // ========================================================================

    pub fn events(&self) -> broadcast::Receiver<DownloadEvent> {
        self.downloader.subscribe()
    }

    pub fn queue(&self) -> &Arc<DownloadQueue> {
        self.downloader.queue()
    }

    pub fn downloader(&self) -> &Arc<Downloader> {
        &self.downloader
    }

    pub fn preferences(&self) -> DownloadPreferences {
        self.prefs.read().unwrap().clone()
    }

    pub fn set_preferences(&self, prefs: DownloadPreferences) {
        *self.prefs.write().unwrap() = prefs;
    }

    // ========================================================================
    // Enqueue
    // ========================================================================

    /// Filter candidate chapters by user policy and queue the survivors.
    /// Returns how many entered the queue.
    pub async fn download_chapters(
        &self,
        work: &Work,
        chapters: Vec<Chapter>,
        autostart: bool,
    ) -> Result<usize> {
        let source = self.registry.get(work.source_id).ok_or_else(|| {
            EngineError::StreamResolutionFailed(format!(
                "source {} is not loaded",
                work.source_id
            ))
        })?;

        self.index.request_renewal(false);
        let prefs = self.preferences();
        let work_arc = Arc::new(work.clone());

        let mut downloads = Vec::new();
        for chapter in chapters {
            if !passes_policy(&prefs, work, &chapter) {
                continue;
            }
            if self.index.is_chapter_downloaded(
                source.as_ref(),
                &work.title,
                &chapter.name,
                chapter.group.as_deref(),
                false,
            ) {
                continue;
            }
            downloads.push(Arc::new(Download::new(
                work_arc.clone(),
                Arc::new(chapter),
            )));
        }

        let added = self.downloader.enqueue(downloads).await?;
        self.maybe_warn_queue_size();

        if autostart && !added.is_empty() && !self.downloader.is_paused() {
            self.downloader.start();
        }
        Ok(added.len())
    }

    /// Move a queued chapter to the head of the queue and make sure the
    /// scheduler is running. Takes effect at the next evaluation.
    pub fn download_now(&self, chapter_id: i64) {
        if self.downloader.queue().move_to_front(chapter_id) {
            self.downloader.start();
        }
    }

    /// Rebuild the live queue from the persistent store, discarding
    /// entries whose work or chapter no longer exists. The store is left
    /// empty; items are re-persisted once scheduling starts.
    pub async fn restore_queue(&self) -> Result<usize> {
        let restored = self.store.restore(self.library.as_ref()).await?;
        for download in &restored {
            download.set_status(DownloadStatus::Queued);
        }
        let (added, _) = self.downloader.queue().add_all(restored);
        if !added.is_empty() {
            info!(count = added.len(), "restored downloads into the queue");
        }
        Ok(added.len())
    }

    // ========================================================================
    // Control surface
    // ========================================================================

    pub fn start_downloads(&self) {
        self.downloader.start();
    }

    pub fn pause_downloads(&self) {
        self.downloader.pause();
    }

    pub async fn stop_downloads(&self) {
        self.downloader.stop().await;
    }

    pub async fn clear_queue(&self) {
        self.downloader.clear().await;
    }

    /// Drop every item still waiting in the queue; running transfers are
    /// left alone.
    pub async fn cancel_queued_downloads(&self) -> usize {
        self.downloader
            .remove_from_queue(|d| d.status() == DownloadStatus::Queued)
            .await
            .len()
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn is_chapter_downloaded(
        &self,
        chapter_name: &str,
        group: Option<&str>,
        work_title: &str,
        source_id: i64,
        skip_cache: bool,
    ) -> bool {
        let Some(source) = self.registry.get(source_id) else {
            return false;
        };
        self.index.request_renewal(false);
        self.index
            .is_chapter_downloaded(source.as_ref(), work_title, chapter_name, group, skip_cache)
    }

    /// Downloaded chapter count, for one work or globally.
    pub fn download_count(&self, work: Option<&Work>) -> usize {
        self.index.request_renewal(false);
        match work {
            Some(work) => self.index.work_download_count(work.source_id, &work.title),
            None => self.index.downloaded_count(),
        }
    }

    /// Downloaded bytes on disk, for one work or globally.
    pub async fn download_size(&self, work: Option<&Work>) -> u64 {
        self.index.request_renewal(false);
        match work {
            Some(work) => match self.registry.get(work.source_id) {
                Some(source) => {
                    self.index
                        .work_download_size(source.as_ref(), &work.title)
                        .await
                }
                None => 0,
            },
            None => self.index.download_size().await,
        }
    }

    pub fn storage_root(&self) -> PathBuf {
        self.index.root()
    }

    /// Move the engine to a different downloads root. Forces an index
    /// renewal against the new tree.
    pub fn set_storage_root(&self, root: PathBuf) {
        self.index.set_root(root);
    }

    // ========================================================================
    // Deletion
    // ========================================================================

    /// Delete chapters from disk immediately, dropping any queued entries
    /// for them and keeping the index in sync.
    pub async fn delete_chapters(&self, work: &Work, chapters: &[Chapter]) -> Result<()> {
        let chapter_ids: HashSet<i64> = chapters.iter().map(|c| c.id).collect();
        self.downloader
            .remove_from_queue(|d| chapter_ids.contains(&d.chapter.id))
            .await;

        let Some(source) = self.registry.get(work.source_id) else {
            return Ok(());
        };
        let work_dir = self.work_dir(source.name(), &work.title);

        let mut removed_names = Vec::new();
        for chapter in chapters {
            for name in
                PathResolver::valid_chapter_dir_names(&chapter.name, chapter.group.as_deref())
            {
                let dir = work_dir.join(&name);
                if dir.is_dir() {
                    if let Err(err) = tokio::fs::remove_dir_all(&dir).await {
                        warn!(%err, path = %dir.display(), "failed to delete chapter directory");
                    }
                }
                for ext in PathResolver::AUDIO_EXTENSIONS {
                    let file = work_dir.join(format!("{name}.{ext}"));
                    if file.is_file() {
                        if let Err(err) = tokio::fs::remove_file(&file).await {
                            warn!(%err, path = %file.display(), "failed to delete chapter file");
                        }
                    }
                }
                removed_names.push(name);
            }
        }
        self.index
            .remove_chapters(work.source_id, &work.title, &removed_names);

        // Drop the work folder once it has emptied out.
        if let Ok(mut entries) = tokio::fs::read_dir(&work_dir).await {
            if entries.next_entry().await.ok().flatten().is_none() {
                let _ = tokio::fs::remove_dir(&work_dir).await;
                self.index.remove_work(work.source_id, &work.title);
            }
        }
        Ok(())
    }

    /// Delete a whole work's downloads.
    pub async fn delete_work(&self, work: &Work) -> Result<()> {
        self.downloader
            .remove_from_queue(|d| d.work.id == work.id)
            .await;

        let Some(source) = self.registry.get(work.source_id) else {
            return Ok(());
        };
        let work_dir = self.work_dir(source.name(), &work.title);
        if work_dir.exists() {
            tokio::fs::remove_dir_all(&work_dir).await?;
        }
        self.index.remove_work(work.source_id, &work.title);
        Ok(())
    }

    /// Record finished chapters for deferred deletion (merged by work,
    /// de-duplicated by chapter).
    pub async fn enqueue_chapters_to_delete(
        &self,
        work: &Work,
        chapters: &[Chapter],
    ) -> Result<()> {
        let read: Vec<Chapter> = chapters.iter().filter(|c| c.read).cloned().collect();
        self.pending.add(work, &read).await
    }

    /// Execute and clear the whole deferred-deletion backlog.
    pub async fn delete_pending_chapters(&self) -> Result<()> {
        for (work, chapters) in self.pending.take_all().await? {
            self.delete_chapters(&work, &chapters).await?;
        }
        Ok(())
    }

    // ========================================================================
    // Renames
    // ========================================================================

    /// Follow a work title change with an on-disk rename.
    pub async fn rename_work_folder(
        &self,
        source_id: i64,
        old_title: &str,
        new_title: &str,
    ) -> Result<()> {
        let Some(source) = self.registry.get(source_id) else {
            return Ok(());
        };
        let source_dir = self
            .index
            .root()
            .join(PathResolver::source_dir_name(source.name()));
        let old_dir = source_dir.join(PathResolver::work_dir_name(old_title));
        let new_dir = source_dir.join(PathResolver::work_dir_name(new_title));

        if old_dir.is_dir() {
            tokio::fs::rename(&old_dir, &new_dir).await?;
            self.index.rename_work(source_id, old_title, new_title);
        }
        Ok(())
    }

    /// Follow a chapter name/group change with an on-disk rename. The old
    /// entry is located under any of its recognized names.
    pub async fn rename_chapter_folder(
        &self,
        work: &Work,
        old: &Chapter,
        new: &Chapter,
    ) -> Result<()> {
        let Some(source) = self.registry.get(work.source_id) else {
            return Ok(());
        };
        let work_dir = self.work_dir(source.name(), &work.title);
        let new_name = PathResolver::chapter_dir_name(&new.name, new.group.as_deref());

        for old_name in PathResolver::valid_chapter_dir_names(&old.name, old.group.as_deref()) {
            let old_dir = work_dir.join(&old_name);
            if old_dir.is_dir() {
                tokio::fs::rename(&old_dir, work_dir.join(&new_name)).await?;
                self.index
                    .rename_chapter(work.source_id, &work.title, &old_name, &new_name);
                return Ok(());
            }
            for ext in PathResolver::AUDIO_EXTENSIONS {
                let old_file = work_dir.join(format!("{old_name}.{ext}"));
                if old_file.is_file() {
                    tokio::fs::rename(&old_file, work_dir.join(format!("{new_name}.{ext}")))
                        .await?;
                    self.index
                        .rename_chapter(work.source_id, &work.title, &old_name, &new_name);
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn work_dir(&self, source_name: &str, work_title: &str) -> PathBuf {
        self.index
            .root()
            .join(PathResolver::source_dir_name(source_name))
            .join(PathResolver::work_dir_name(work_title))
    }

    /// Emit the advisory queue-size warning when thresholds are exceeded.
    /// Never blocks an operation.
    fn maybe_warn_queue_size(&self) {
        let config = self.downloader.config();
        let snapshot = self.downloader.queue().snapshot();
        let pending: Vec<_> = snapshot
            .iter()
            .filter(|d| d.status().is_pending())
            .collect();

        let mut per_source: HashMap<i64, usize> = HashMap::new();
        for download in &pending {
            *per_source.entry(download.source_id()).or_default() += 1;
        }
        let max_from_one_source = per_source.values().copied().max().unwrap_or(0);

        if pending.len() > config.warn_queued_total
            || max_from_one_source > config.warn_queued_per_source
        {
            self.downloader.emit(DownloadEvent::QueueWarning {
                queued: pending.len(),
                max_from_one_source,
                help_url: config.help_url.clone(),
            });
        }
    }
}
