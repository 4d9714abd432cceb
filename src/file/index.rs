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


//! In-memory index over the downloads tree.
//!
//! Mirrors the on-disk layout `root/source/work/chapter` so membership and
//! count queries never stat the filesystem. The filesystem stays
//! authoritative: the tree is renewed at most once per renewal interval
//! (default one hour), or immediately when the storage root changes or an
//! explicit invalidation resets the renewal timestamp.
//!
//! Renewal lists the top-level directories, maps each to a loaded source by
//! normalized name (waiting a bounded time for the plugin registry to
//! finish loading), then scans every matched source concurrently, one task
//! per source. In-progress `*_tmp` artifacts are never indexed.
//!
//! Mutations (a chapter finished, a work was deleted, a folder was renamed)
//! are synchronous and take effect without a renewal.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tracing::debug;

use crate::file::paths::PathResolver;
use crate::model::SourceId;
use crate::source::{ChapterSource, SourceRegistry};

/// How long a completed renewal stays fresh.
pub const DEFAULT_RENEWAL_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Upper bound on waiting for the source registry during a renewal.
const REGISTRY_WAIT: Duration = Duration::from_secs(30);

/// Poll step while waiting for the registry.
const REGISTRY_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Default, Clone)]
struct SourceNode {
    works: HashMap<String, WorkNode>,
}

#[derive(Debug, Default, Clone)]
struct WorkNode {
    chapters: HashSet<String>,
}

/// Cache of completed chapter directories, keyed source → work → chapter.
pub struct DownloadIndex {
    registry: Arc<SourceRegistry>,
    root: RwLock<PathBuf>,
    tree: Mutex<HashMap<SourceId, SourceNode>>,
    last_renewal: Mutex<Option<Instant>>,
    renewing: AtomicBool,
    renewal_interval: Duration,
    registry_wait: Duration,
}

/// Clears the in-flight flag even if a scan task is cancelled.
struct RenewGuard<'a>(&'a AtomicBool);

impl Drop for RenewGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl DownloadIndex {
    pub fn new(registry: Arc<SourceRegistry>, root: PathBuf) -> Self {
        Self::with_intervals(registry, root, DEFAULT_RENEWAL_INTERVAL, REGISTRY_WAIT)
    }

    pub fn with_intervals(
        registry: Arc<SourceRegistry>,
        root: PathBuf,
        renewal_interval: Duration,
        registry_wait: Duration,
    ) -> Self {
        Self {
            registry,
            root: RwLock::new(root),
            tree: Mutex::new(HashMap::new()),
            last_renewal: Mutex::new(None),
            renewing: AtomicBool::new(false),
            renewal_interval,
            registry_wait,
        }
    }

    /// Current downloads root.
    pub fn root(&self) -> PathBuf {
        self.root.read().unwrap().clone()
    }

    /// Point the index at a different downloads root; forces a renewal.
    pub fn set_root(self: &Arc<Self>, root: PathBuf) {
        *self.root.write().unwrap() = root;
        self.request_renewal(true);
    }

    /// Reset the renewal timestamp so the next query triggers a rebuild.
    pub fn invalidate(&self) {
        *self.last_renewal.lock().unwrap() = None;
    }

    fn is_stale(&self) -> bool {
        match *self.last_renewal.lock().unwrap() {
            Some(at) => at.elapsed() >= self.renewal_interval,
            None => true,
        }
    }

    /// Kick off a background renewal when the cache is stale and none is
    /// already in flight. Cheap to call from every query path.
    pub fn request_renewal(self: &Arc<Self>, force: bool) {
        if force {
            self.invalidate();
        }
        if !self.is_stale() || self.renewing.load(Ordering::Acquire) {
            return;
        }
        let index = Arc::clone(self);
        tokio::spawn(async move {
            index.renew_now().await;
        });
    }

    /// Rebuild the tree from the filesystem. Skipped when a renewal is
    /// already in flight; completes only once every source scan finished.
    pub async fn renew_now(&self) {
        if self.renewing.swap(true, Ordering::AcqRel) {
            return;
        }
        let _guard = RenewGuard(&self.renewing);

        let root = self.root();
        let mut top_dirs: Vec<(String, PathBuf)> = Vec::new();
        match tokio::fs::read_dir(&root).await {
            Ok(mut entries) => {
                while let Ok(Some(entry)) = entries.next_entry().await {
                    if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                        let name = entry.file_name().to_string_lossy().into_owned();
                        top_dirs.push((name, entry.path()));
                    }
                }
            }
            Err(err) => {
                debug!(root = %root.display(), %err, "downloads root not readable");
                *self.tree.lock().unwrap() = HashMap::new();
                *self.last_renewal.lock().unwrap() = Some(Instant::now());
                return;
            }
        }

        // Map directories to sources, waiting a bounded time for the plugin
        // registry when some directories are still unmatched.
        let deadline = Instant::now() + self.registry_wait;
        let matched: Vec<(SourceId, PathBuf)> = loop {
            let sources = self.registry.all();
            let matched: Vec<(SourceId, PathBuf)> = top_dirs
                .iter()
                .filter_map(|(name, path)| {
                    sources
                        .iter()
                        .find(|s| {
                            PathResolver::source_dir_name(s.name()).eq_ignore_ascii_case(name)
                        })
                        .map(|s| (s.id(), path.clone()))
                })
                .collect();

            if matched.len() == top_dirs.len()
                || self.registry.is_loaded()
                || Instant::now() >= deadline
            {
                if matched.len() < top_dirs.len() {
                    debug!(
                        unmatched = top_dirs.len() - matched.len(),
                        "directories without a loaded source"
                    );
                }
                break matched;
            }
            tokio::time::sleep(REGISTRY_POLL).await;
        };

        // One scan task per source, all concurrent.
        let scans = matched
            .into_iter()
            .map(|(id, path)| async move { (id, scan_source_dir(&path).await) });
        let scanned: HashMap<SourceId, SourceNode> = join_all(scans).await.into_iter().collect();

        *self.tree.lock().unwrap() = scanned;
        *self.last_renewal.lock().unwrap() = Some(Instant::now());
        debug!("download index renewed");
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Whether the chapter is present on disk, under its canonical or
    /// legacy directory name. With `skip_cache` the filesystem is consulted
    /// directly instead of the tree.
    pub fn is_chapter_downloaded(
        &self,
        source: &dyn ChapterSource,
        work_title: &str,
        chapter_name: &str,
        group: Option<&str>,
        skip_cache: bool,
    ) -> bool {
        let names = PathResolver::valid_chapter_dir_names(chapter_name, group);

        if skip_cache {
            let work_dir = self.work_dir(source.name(), work_title);
            return names.iter().any(|name| {
                if work_dir.join(name).is_dir() {
                    return true;
                }
                PathResolver::AUDIO_EXTENSIONS
                    .iter()
                    .any(|ext| work_dir.join(format!("{name}.{ext}")).is_file())
            });
        }

        let tree = self.tree.lock().unwrap();
        tree.get(&source.id())
            .and_then(|s| s.works.get(&PathResolver::work_dir_name(work_title)))
            .map(|w| names.iter().any(|n| w.chapters.contains(n)))
            .unwrap_or(false)
    }

    /// Number of downloaded chapters for one work.
    pub fn work_download_count(&self, source_id: SourceId, work_title: &str) -> usize {
        let tree = self.tree.lock().unwrap();
        tree.get(&source_id)
            .and_then(|s| s.works.get(&PathResolver::work_dir_name(work_title)))
            .map(|w| w.chapters.len())
            .unwrap_or(0)
    }

    /// Number of downloaded chapters across every source.
    pub fn downloaded_count(&self) -> usize {
        let tree = self.tree.lock().unwrap();
        tree.values()
            .flat_map(|s| s.works.values())
            .map(|w| w.chapters.len())
            .sum()
    }

    /// On-disk size of one work's downloaded chapters, in bytes. Membership
    /// comes from the tree; sizes are read from the filesystem.
    pub async fn work_download_size(&self, source: &dyn ChapterSource, work_title: &str) -> u64 {
        let names: Vec<String> = {
            let tree = self.tree.lock().unwrap();
            match tree
                .get(&source.id())
                .and_then(|s| s.works.get(&PathResolver::work_dir_name(work_title)))
            {
                Some(w) => w.chapters.iter().cloned().collect(),
                None => return 0,
            }
        };

        let work_dir = self.work_dir(source.name(), work_title);
        sized_entries(&work_dir, &names).await
    }

    /// Total on-disk size of all downloads, in bytes.
    pub async fn download_size(&self) -> u64 {
        let snapshot: Vec<(SourceId, Vec<(String, Vec<String>)>)> = {
            let tree = self.tree.lock().unwrap();
            tree.iter()
                .map(|(id, s)| {
                    (
                        *id,
                        s.works
                            .iter()
                            .map(|(w, n)| (w.clone(), n.chapters.iter().cloned().collect()))
                            .collect(),
                    )
                })
                .collect()
        };

        let root = self.root();
        let mut total = 0u64;
        for (source_id, works) in snapshot {
            let Some(source) = self.registry.get(source_id) else {
                continue;
            };
            let source_dir = root.join(PathResolver::source_dir_name(source.name()));
            for (work_dir_name, names) in works {
                total += sized_entries(&source_dir.join(work_dir_name), &names).await;
            }
        }
        total
    }

    // ========================================================================
    // Mutations - synchronous, no renewal required
    // ========================================================================

    /// Register one completed chapter directory. Missing source/work nodes
    /// are re-derived from the filesystem so a mutation right after startup
    /// does not lose sibling chapters.
    pub fn add_chapter(&self, source: &dyn ChapterSource, work_title: &str, chapter_dir: &str) {
        let work_dir_name = PathResolver::work_dir_name(work_title);
        let mut tree = self.tree.lock().unwrap();
        let source_node = tree.entry(source.id()).or_default();
        if !source_node.works.contains_key(&work_dir_name) {
            let derived = derive_work_node(&self.work_dir(source.name(), work_title));
            source_node.works.insert(work_dir_name.clone(), derived);
        }
        if let Some(work_node) = source_node.works.get_mut(&work_dir_name) {
            work_node.chapters.insert(chapter_dir.to_string());
        }
    }

    /// Forget one or more chapter directory names of a work.
    pub fn remove_chapters(&self, source_id: SourceId, work_title: &str, chapter_dirs: &[String]) {
        let mut tree = self.tree.lock().unwrap();
        if let Some(work) = tree
            .get_mut(&source_id)
            .and_then(|s| s.works.get_mut(&PathResolver::work_dir_name(work_title)))
        {
            for name in chapter_dirs {
                work.chapters.remove(name);
            }
        }
    }

    /// Forget an entire work.
    pub fn remove_work(&self, source_id: SourceId, work_title: &str) {
        let mut tree = self.tree.lock().unwrap();
        if let Some(source) = tree.get_mut(&source_id) {
            source.works.remove(&PathResolver::work_dir_name(work_title));
        }
    }

    /// Forget an entire source.
    pub fn remove_source(&self, source_id: SourceId) {
        self.tree.lock().unwrap().remove(&source_id);
    }

    /// Follow an on-disk rename of a work folder.
    pub fn rename_work(&self, source_id: SourceId, old_title: &str, new_title: &str) {
        let mut tree = self.tree.lock().unwrap();
        if let Some(source) = tree.get_mut(&source_id) {
            if let Some(node) = source.works.remove(&PathResolver::work_dir_name(old_title)) {
                source
                    .works
                    .insert(PathResolver::work_dir_name(new_title), node);
            }
        }
    }

    /// Follow an on-disk rename of a chapter entry.
    pub fn rename_chapter(
        &self,
        source_id: SourceId,
        work_title: &str,
        old_dir: &str,
        new_dir: &str,
    ) {
        let mut tree = self.tree.lock().unwrap();
        if let Some(work) = tree
            .get_mut(&source_id)
            .and_then(|s| s.works.get_mut(&PathResolver::work_dir_name(work_title)))
        {
            if work.chapters.remove(old_dir) {
                work.chapters.insert(new_dir.to_string());
            }
        }
    }

    fn work_dir(&self, source_name: &str, work_title: &str) -> PathBuf {
        self.root()
            .join(PathResolver::source_dir_name(source_name))
            .join(PathResolver::work_dir_name(work_title))
    }
}

/// Scan one source directory into its subtree.
async fn scan_source_dir(dir: &Path) -> SourceNode {
    let mut node = SourceNode::default();
    let Ok(mut works) = tokio::fs::read_dir(dir).await else {
        return node;
    };

    while let Ok(Some(work_entry)) = works.next_entry().await {
        if !work_entry
            .file_type()
            .await
            .map(|t| t.is_dir())
            .unwrap_or(false)
        {
            continue;
        }
        let work_name = work_entry.file_name().to_string_lossy().into_owned();
        let mut chapters = HashSet::new();

        if let Ok(mut entries) = tokio::fs::read_dir(work_entry.path()).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let name = entry.file_name().to_string_lossy().into_owned();
                if PathResolver::is_temp_entry(&name) {
                    continue;
                }
                let Ok(file_type) = entry.file_type().await else {
                    continue;
                };
                if file_type.is_dir() {
                    chapters.insert(name);
                } else if let Some(stem) = PathResolver::audio_archive_stem(&name) {
                    chapters.insert(stem.to_string());
                }
            }
        }

        node.works.insert(work_name, WorkNode { chapters });
    }

    node
}

/// Synchronous variant used when a mutation must re-derive a missing node.
fn derive_work_node(work_dir: &Path) -> WorkNode {
    let mut chapters = HashSet::new();
    if let Ok(entries) = std::fs::read_dir(work_dir) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if PathResolver::is_temp_entry(&name) {
                continue;
            }
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                chapters.insert(name);
            } else if let Some(stem) = PathResolver::audio_archive_stem(&name) {
                chapters.insert(stem.to_string());
            }
        }
    }
    WorkNode { chapters }
}

/// Sum the sizes of the work-dir entries backing the given chapter names.
async fn sized_entries(work_dir: &Path, names: &[String]) -> u64 {
    let Ok(mut entries) = tokio::fs::read_dir(work_dir).await else {
        return 0;
    };

    let mut total = 0u64;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if PathResolver::is_temp_entry(&file_name) {
            continue;
        }
        let is_match = names.contains(&file_name)
            || PathResolver::audio_archive_stem(&file_name)
                .map(|stem| names.iter().any(|n| n == stem))
                .unwrap_or(false);
        if !is_match {
            continue;
        }

        let Ok(file_type) = entry.file_type().await else {
            continue;
        };
        if file_type.is_dir() {
            total += dir_size(&entry.path()).await;
        } else if let Ok(meta) = entry.metadata().await {
            total += meta.len();
        }
    }
    total
}

/// Recursive directory size.
fn dir_size(path: &Path) -> Pin<Box<dyn Future<Output = u64> + Send + '_>> {
    Box::pin(async move {
        let Ok(mut entries) = tokio::fs::read_dir(path).await else {
            return 0;
        };
        let mut total = 0u64;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            if file_type.is_dir() {
                total += dir_size(&entry.path()).await;
            } else if let Ok(meta) = entry.metadata().await {
                total += meta.len();
            }
        }
        total
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::model::Chapter;
    use crate::source::MediaTrack;
    use async_trait::async_trait;

    struct TestSource {
        id: SourceId,
        name: String,
    }

    #[async_trait]
    impl ChapterSource for TestSource {
        fn id(&self) -> SourceId {
            self.id
        }

        fn name(&self) -> &str {
            &self.name
        }

        async fn resolve_media(&self, _chapter: &Chapter) -> Result<MediaTrack> {
            Ok(MediaTrack::new("http://localhost/"))
        }
    }

    fn registry_with(id: SourceId, name: &str) -> (Arc<SourceRegistry>, Arc<TestSource>) {
        let registry = Arc::new(SourceRegistry::new());
        let source = Arc::new(TestSource {
            id,
            name: name.to_string(),
        });
        registry.register(source.clone());
        registry.mark_loaded();
        (registry, source)
    }

    #[tokio::test]
    async fn renewal_indexes_directories_and_archives_but_not_temp() {
        let root = tempfile::tempdir().unwrap();
        let work = root.path().join("Night Radio").join("The Long Wave");
        std::fs::create_dir_all(work.join("Chapter 1")).unwrap();
        std::fs::write(work.join("Chapter 2.m4b"), b"audio").unwrap();
        std::fs::create_dir_all(work.join("Chapter 3_tmp")).unwrap();

        let (registry, source) = registry_with(1, "Night Radio");
        let index = DownloadIndex::new(registry, root.path().to_path_buf());
        index.renew_now().await;

        assert!(index.is_chapter_downloaded(&*source, "The Long Wave", "Chapter 1", None, false));
        assert!(index.is_chapter_downloaded(&*source, "The Long Wave", "Chapter 2", None, false));
        assert!(!index.is_chapter_downloaded(&*source, "The Long Wave", "Chapter 3", None, false));
        assert_eq!(index.work_download_count(1, "The Long Wave"), 2);
        assert_eq!(index.downloaded_count(), 2);
    }

    #[tokio::test]
    async fn source_directory_matching_is_case_insensitive() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("night radio").join("W").join("C")).unwrap();

        let (registry, source) = registry_with(1, "Night Radio");
        let index = DownloadIndex::new(registry, root.path().to_path_buf());
        index.renew_now().await;

        assert!(index.is_chapter_downloaded(&*source, "W", "C", None, false));
    }

    #[tokio::test]
    async fn mutations_take_effect_without_renewal() {
        let root = tempfile::tempdir().unwrap();
        let (registry, source) = registry_with(1, "Night Radio");
        let index = DownloadIndex::new(registry, root.path().to_path_buf());

        assert!(!index.is_chapter_downloaded(&*source, "W", "C", None, false));
        index.add_chapter(&*source, "W", "C");
        assert!(index.is_chapter_downloaded(&*source, "W", "C", None, false));

        index.remove_chapters(1, "W", &["C".to_string()]);
        assert!(!index.is_chapter_downloaded(&*source, "W", "C", None, false));
    }

    #[tokio::test]
    async fn add_chapter_rederives_siblings_from_disk() {
        let root = tempfile::tempdir().unwrap();
        let work = root.path().join("Night Radio").join("The Long Wave");
        std::fs::create_dir_all(work.join("Existing")).unwrap();

        let (registry, source) = registry_with(1, "Night Radio");
        let index = DownloadIndex::new(registry, root.path().to_path_buf());

        // No renewal has happened; registering a new chapter must pick up
        // the sibling already on disk.
        index.add_chapter(&*source, "The Long Wave", "Fresh");
        assert!(index.is_chapter_downloaded(&*source, "The Long Wave", "Existing", None, false));
        assert!(index.is_chapter_downloaded(&*source, "The Long Wave", "Fresh", None, false));
    }

    #[tokio::test]
    async fn legacy_chapter_names_are_recognized() {
        let root = tempfile::tempdir().unwrap();
        let work = root.path().join("Night Radio").join("The Long Wave");
        // Legacy scheme: the joined "group_name" string sanitized in one
        // pass keeps the group's trailing dot.
        std::fs::create_dir_all(work.join("Grp._Ch 5")).unwrap();

        let (registry, source) = registry_with(1, "Night Radio");
        let index = DownloadIndex::new(registry, root.path().to_path_buf());
        index.renew_now().await;

        assert!(index.is_chapter_downloaded(
            &*source,
            "The Long Wave",
            "Ch 5",
            Some("Grp."),
            false
        ));
    }

    #[tokio::test]
    async fn skip_cache_consults_filesystem() {
        let root = tempfile::tempdir().unwrap();
        let work = root.path().join("Night Radio").join("The Long Wave");
        std::fs::create_dir_all(work.join("Chapter 9")).unwrap();

        let (registry, source) = registry_with(1, "Night Radio");
        let index = DownloadIndex::new(registry, root.path().to_path_buf());

        // Never renewed: the cache says no, the filesystem says yes.
        assert!(!index.is_chapter_downloaded(&*source, "The Long Wave", "Chapter 9", None, false));
        assert!(index.is_chapter_downloaded(&*source, "The Long Wave", "Chapter 9", None, true));
    }

    #[tokio::test]
    async fn rename_work_and_chapter_keep_index_in_sync() {
        let root = tempfile::tempdir().unwrap();
        let (registry, source) = registry_with(1, "Night Radio");
        let index = DownloadIndex::new(registry, root.path().to_path_buf());

        index.add_chapter(&*source, "Old Title", "Ch 1");
        index.rename_work(1, "Old Title", "New Title");
        assert!(index.is_chapter_downloaded(&*source, "New Title", "Ch 1", None, false));
        assert!(!index.is_chapter_downloaded(&*source, "Old Title", "Ch 1", None, false));

        index.rename_chapter(1, "New Title", "Ch 1", "Ch 1 v2");
        assert!(index.is_chapter_downloaded(&*source, "New Title", "Ch 1 v2", None, false));
    }

    #[tokio::test]
    async fn work_size_counts_files_and_directories() {
        let root = tempfile::tempdir().unwrap();
        let work = root.path().join("Night Radio").join("The Long Wave");
        std::fs::create_dir_all(work.join("Chapter 1")).unwrap();
        std::fs::write(work.join("Chapter 1").join("part1.mp3"), vec![0u8; 100]).unwrap();
        std::fs::write(work.join("Chapter 2.m4b"), vec![0u8; 50]).unwrap();

        let (registry, source) = registry_with(1, "Night Radio");
        let index = DownloadIndex::new(registry, root.path().to_path_buf());
        index.renew_now().await;

        assert_eq!(index.work_download_size(&*source, "The Long Wave").await, 150);
        assert_eq!(index.download_size().await, 150);
    }
}
