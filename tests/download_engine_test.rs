//! End-to-end scenarios for the download engine.
//!
//! Transfers run against an in-process HTTP test server (range-aware, with
//! a controllable stall point) so the suite is hermetic: no live URLs, no
//! external tools.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};

use auricle_core::download::downloader::DownloadConfig;
use auricle_core::download::manager::{DownloadManager, DownloadPreferences};
use auricle_core::download::model::{DownloadEvent, DownloadStatus};
use auricle_core::error::{EngineError, Result as EngineResult};
use auricle_core::file::disk::DiskProbe;
use auricle_core::model::{Chapter, Library, SourceId, Work};
use auricle_core::source::{ChapterSource, MediaTrack, SourceRegistry};
use auricle_core::storage::Database;

// ============================================================================
// Test HTTP server
// ============================================================================

/// Minimal HTTP/1.1 file server. Supports `Range: bytes=N-` resume and an
/// optional stall point: each connection sends the first `stall_after`
/// bytes, then waits until [`TestServer::release`] is called.
struct TestServer {
    addr: std::net::SocketAddr,
    release_tx: watch::Sender<bool>,
    connections: Arc<AtomicUsize>,
}

impl TestServer {
    async fn start(body: Vec<u8>, stall_after: Option<usize>) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (release_tx, release_rx) = watch::channel(false);
        let connections = Arc::new(AtomicUsize::new(0));

        let body = Arc::new(body);
        let conns = connections.clone();
        tokio::spawn(async move {
            loop {
                let Ok((sock, _)) = listener.accept().await else {
                    break;
                };
                conns.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve_connection(
                    sock,
                    body.clone(),
                    stall_after,
                    release_rx.clone(),
                ));
            }
        });

        Self {
            addr,
            release_tx,
            connections,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Unblock every stalled (and future) connection.
    fn release(&self) {
        let _ = self.release_tx.send_replace(true);
    }

    fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

async fn serve_connection(
    mut sock: TcpStream,
    body: Arc<Vec<u8>>,
    stall_after: Option<usize>,
    mut release: watch::Receiver<bool>,
) {
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match sock.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                request.extend_from_slice(&buf[..n]);
                if request.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
        }
    }

    let text = String::from_utf8_lossy(&request);
    let offset = text
        .lines()
        .find(|line| line.to_ascii_lowercase().starts_with("range:"))
        .and_then(|line| line.split('=').nth(1))
        .and_then(|spec| spec.split('-').next())
        .and_then(|n| n.trim().parse::<usize>().ok())
        .unwrap_or(0)
        .min(body.len());

    let total = body.len();
    let header = if offset > 0 {
        format!(
            "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\n\
             Content-Range: bytes {}-{}/{}\r\nConnection: close\r\n\r\n",
            total - offset,
            offset,
            total - 1,
            total
        )
    } else {
        format!("HTTP/1.1 200 OK\r\nContent-Length: {total}\r\nConnection: close\r\n\r\n")
    };
    if sock.write_all(header.as_bytes()).await.is_err() {
        return;
    }

    let slice = &body[offset..];
    match stall_after {
        Some(stall) if !*release.borrow() => {
            let first = stall.saturating_sub(offset).min(slice.len());
            if sock.write_all(&slice[..first]).await.is_err() {
                return;
            }
            let _ = sock.flush().await;
            while !*release.borrow_and_update() {
                if release.changed().await.is_err() {
                    return;
                }
            }
            let _ = sock.write_all(&slice[first..]).await;
        }
        _ => {
            let _ = sock.write_all(slice).await;
        }
    }
    let _ = sock.flush().await;
    let _ = sock.shutdown().await;
}

// ============================================================================
// Fakes and fixtures
// ============================================================================

struct FakeSource {
    id: SourceId,
    name: String,
    urls: Mutex<HashMap<i64, String>>,
}

impl FakeSource {
    fn new(id: SourceId, name: &str) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: name.to_string(),
            urls: Mutex::new(HashMap::new()),
        })
    }

    fn set_url(&self, chapter_id: i64, url: String) {
        self.urls.lock().unwrap().insert(chapter_id, url);
    }
}

#[async_trait]
impl ChapterSource for FakeSource {
    fn id(&self) -> SourceId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn resolve_media(&self, chapter: &Chapter) -> EngineResult<MediaTrack> {
        self.urls
            .lock()
            .unwrap()
            .get(&chapter.id)
            .cloned()
            .map(MediaTrack::new)
            .ok_or_else(|| EngineError::StreamResolutionFailed("no media configured".to_string()))
    }
}

struct StubLibrary {
    works: Mutex<HashMap<i64, Work>>,
    chapters: Mutex<HashMap<i64, Chapter>>,
}

impl StubLibrary {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            works: Mutex::new(HashMap::new()),
            chapters: Mutex::new(HashMap::new()),
        })
    }

    fn insert(&self, work: &Work, chapters: &[Chapter]) {
        self.works.lock().unwrap().insert(work.id, work.clone());
        let mut map = self.chapters.lock().unwrap();
        for chapter in chapters {
            map.insert(chapter.id, chapter.clone());
        }
    }
}

#[async_trait]
impl Library for StubLibrary {
    async fn work(&self, id: i64) -> Option<Work> {
        self.works.lock().unwrap().get(&id).cloned()
    }

    async fn chapter(&self, id: i64) -> Option<Chapter> {
        self.chapters.lock().unwrap().get(&id).cloned()
    }
}

struct FixedProbe(u64);

impl DiskProbe for FixedProbe {
    fn free_space(&self, _path: &Path) -> Option<u64> {
        Some(self.0)
    }
}

struct TestEngine {
    manager: Arc<DownloadManager>,
    db: Database,
    registry: Arc<SourceRegistry>,
    root: PathBuf,
    _root_dir: tempfile::TempDir,
}

async fn build_engine(
    sources: &[Arc<FakeSource>],
    config: DownloadConfig,
    free_bytes: u64,
    library: Arc<StubLibrary>,
) -> TestEngine {
    init_tracing();
    let root_dir = tempfile::tempdir().unwrap();
    let db = Database::new_in_memory().await.unwrap();
    let registry = Arc::new(SourceRegistry::new());
    for source in sources {
        registry.register(source.clone());
    }
    registry.mark_loaded();

    let manager = DownloadManager::with_disk_probe(
        &db,
        registry.clone(),
        library,
        root_dir.path().to_path_buf(),
        config,
        DownloadPreferences::default(),
        Arc::new(FixedProbe(free_bytes)),
    )
    .await
    .unwrap();

    TestEngine {
        manager,
        db,
        registry,
        root: root_dir.path().to_path_buf(),
        _root_dir: root_dir,
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn work(id: i64, source_id: SourceId, title: &str) -> Work {
    Work {
        id,
        source_id,
        title: title.to_string(),
        category_ids: vec![],
    }
}

fn chapter(id: i64, work_id: i64, name: &str) -> Chapter {
    Chapter {
        id,
        work_id,
        name: name.to_string(),
        group: None,
        number: id as f64,
        read: false,
        bookmarked: false,
    }
}

fn body_of(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

fn status_of(engine: &TestEngine, chapter_id: i64) -> Option<DownloadStatus> {
    engine.manager.queue().get(chapter_id).map(|d| d.status())
}

fn downloading(engine: &TestEngine) -> Vec<(SourceId, i64)> {
    engine
        .manager
        .queue()
        .snapshot()
        .iter()
        .filter(|d| d.status() == DownloadStatus::Downloading)
        .map(|d| (d.source_id(), d.chapter.id))
        .collect()
}

fn drain_events(rx: &mut broadcast::Receiver<DownloadEvent>) -> Vec<DownloadEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    events
}

async fn queue_rows(db: &Database) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM DownloadQueue")
        .fetch_one(db.pool())
        .await
        .unwrap()
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn direct_download_completes_end_to_end() -> anyhow::Result<()> {
    let body = body_of(48 * 1024);
    let server = TestServer::start(body.clone(), None).await;

    let source = FakeSource::new(1, "Night Radio");
    let w = work(1, 1, "The Long Wave");
    let c = chapter(11, 1, "Chapter 1");
    source.set_url(11, server.url("/long-wave/ch1.m4b"));

    let engine = build_engine(
        &[source],
        DownloadConfig::default(),
        u64::MAX,
        StubLibrary::new(),
    )
    .await;
    let mut events = engine.manager.events();

    let queued = engine
        .manager
        .download_chapters(&w, vec![c.clone()], true)
        .await?;
    assert_eq!(queued, 1);

    assert!(
        wait_until(Duration::from_secs(10), || engine
            .manager
            .queue()
            .is_empty())
        .await,
        "download did not complete"
    );

    // The artifact landed under its canonical chapter directory.
    let artifact = engine
        .root
        .join("Night Radio")
        .join("The Long Wave")
        .join("Chapter 1")
        .join("Chapter 1.m4b");
    assert_eq!(tokio::fs::read(&artifact).await?, body);

    // No temp directory left behind.
    assert!(!engine
        .root
        .join("Night Radio")
        .join("The Long Wave")
        .join("Chapter 1_tmp")
        .exists());

    // The index learned about it without a renewal.
    assert!(engine
        .manager
        .is_chapter_downloaded("Chapter 1", None, "The Long Wave", 1, false));
    assert_eq!(engine.manager.download_count(Some(&w)), 1);

    // The persistent queue emptied out.
    assert_eq!(queue_rows(&engine.db).await, 0);

    // Status history is the legal path and nothing else.
    let history: Vec<DownloadStatus> = drain_events(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            DownloadEvent::StatusChanged { chapter_id, status } if chapter_id == 11 => {
                Some(status)
            }
            _ => None,
        })
        .collect();
    assert_eq!(
        history,
        vec![
            DownloadStatus::Queued,
            DownloadStatus::Downloading,
            DownloadStatus::Downloaded
        ]
    );

    // Re-requesting a downloaded chapter does not re-queue it.
    let requeued = engine.manager.download_chapters(&w, vec![c], true).await?;
    assert_eq!(requeued, 0);
    assert!(engine.manager.queue().is_empty());

    Ok(())
}

#[tokio::test]
async fn enqueue_is_idempotent_per_chapter() -> anyhow::Result<()> {
    let source = FakeSource::new(1, "Night Radio");
    let w = work(1, 1, "The Long Wave");

    let engine = build_engine(
        &[source],
        DownloadConfig::default(),
        u64::MAX,
        StubLibrary::new(),
    )
    .await;

    let first = engine
        .manager
        .download_chapters(&w, vec![chapter(11, 1, "Ch 1")], false)
        .await?;
    let second = engine
        .manager
        .download_chapters(&w, vec![chapter(11, 1, "Ch 1")], false)
        .await?;

    assert_eq!(first, 1);
    assert_eq!(second, 0);
    assert_eq!(engine.manager.queue().len(), 1);
    assert_eq!(queue_rows(&engine.db).await, 1);
    Ok(())
}

#[tokio::test]
async fn source_grouped_fairness_and_concurrency_bound() -> anyhow::Result<()> {
    // Every transfer stalls immediately so the active window stays visible.
    let server = TestServer::start(body_of(8 * 1024), Some(0)).await;

    let sources: Vec<Arc<FakeSource>> = (1..=4)
        .map(|id| FakeSource::new(id, &format!("Source {id}")))
        .collect();

    let engine = build_engine(
        &sources,
        DownloadConfig::default(),
        u64::MAX,
        StubLibrary::new(),
    )
    .await;

    // Four sources, two queued chapters each.
    for (i, source) in sources.iter().enumerate() {
        let source_id = source.id;
        let w = work(source_id, source_id, &format!("Work {source_id}"));
        let base = (i as i64 + 1) * 100;
        let chapters = vec![
            chapter(base + 1, w.id, &format!("Ch {}", base + 1)),
            chapter(base + 2, w.id, &format!("Ch {}", base + 2)),
        ];
        for c in &chapters {
            source.set_url(c.id, server.url(&format!("/s{source_id}/{}.mp3", c.id)));
        }
        engine.manager.download_chapters(&w, chapters, false).await?;
    }
    engine.manager.start_downloads();

    assert!(
        wait_until(Duration::from_secs(10), || downloading(&engine).len() == 3).await,
        "expected three active transfers"
    );
    // Settled: still exactly three, one per source, and source 4 idle.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let active = downloading(&engine);
    assert_eq!(active.len(), 3);
    let mut active_sources: Vec<SourceId> = active.iter().map(|(s, _)| *s).collect();
    active_sources.sort_unstable();
    active_sources.dedup();
    assert_eq!(active_sources.len(), 3, "one transfer per source");
    assert!(
        !active_sources.contains(&4),
        "the fourth source must wait for a slot"
    );

    // Releasing the stall lets the whole queue drain, source 4 included.
    server.release();
    assert!(
        wait_until(Duration::from_secs(20), || engine
            .manager
            .queue()
            .is_empty())
        .await,
        "queue did not drain"
    );
    assert_eq!(engine.manager.download_count(None), 8);
    Ok(())
}

#[tokio::test]
async fn pause_freezes_progress_and_resume_continues_from_offset() -> anyhow::Result<()> {
    let total = 256 * 1024;
    let server = TestServer::start(body_of(total), Some(1024)).await;

    let source = FakeSource::new(1, "Night Radio");
    let w = work(1, 1, "The Long Wave");
    let c = chapter(11, 1, "Chapter 1");
    source.set_url(11, server.url("/ch1.mp3"));

    let engine = build_engine(
        &[source],
        DownloadConfig::default(),
        u64::MAX,
        StubLibrary::new(),
    )
    .await;

    engine.manager.download_chapters(&w, vec![c], true).await?;

    // Let the transfer make some progress, then pause it mid-stream.
    assert!(
        wait_until(Duration::from_secs(10), || {
            engine
                .manager
                .queue()
                .get(11)
                .map(|d| d.progress().0 > 0)
                .unwrap_or(false)
        })
        .await,
        "transfer never started"
    );
    engine.manager.pause_downloads();

    assert!(
        wait_until(Duration::from_secs(5), || status_of(&engine, 11)
            == Some(DownloadStatus::Queued))
        .await,
        "paused item did not revert to queued"
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    let frozen = engine.manager.queue().get(11).unwrap().progress().0;
    assert!(frozen > 0);

    // Even with the server unblocked, a paused transfer must not advance.
    server.release();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(engine.manager.queue().get(11).unwrap().progress().0, frozen);

    // Resume: the transfer continues on the same connection and offset.
    engine.manager.start_downloads();
    assert!(
        wait_until(Duration::from_secs(10), || engine
            .manager
            .queue()
            .is_empty())
        .await,
        "download did not finish after resume"
    );

    let artifact = engine
        .root
        .join("Night Radio")
        .join("The Long Wave")
        .join("Chapter 1")
        .join("Chapter 1.mp3");
    assert_eq!(tokio::fs::metadata(&artifact).await?.len(), total as u64);
    assert_eq!(
        server.connection_count(),
        1,
        "resume must not reopen the connection"
    );
    Ok(())
}

#[tokio::test]
async fn disk_full_fails_fast_without_temp_dir() -> anyhow::Result<()> {
    let source = FakeSource::new(1, "Night Radio");
    let w = work(1, 1, "The Long Wave");
    let c = chapter(11, 1, "Chapter 1");
    source.set_url(11, "http://127.0.0.1:9/never-contacted.mp3".to_string());

    // Zero bytes free.
    let engine = build_engine(&[source], DownloadConfig::default(), 0, StubLibrary::new()).await;
    let mut events = engine.manager.events();

    engine.manager.download_chapters(&w, vec![c], true).await?;

    assert!(
        wait_until(Duration::from_secs(5), || status_of(&engine, 11)
            == Some(DownloadStatus::Error))
        .await,
        "expected the download to error"
    );

    // The temp directory (and in fact the whole source dir) was never created.
    assert!(!engine.root.join("Night Radio").exists());

    let failures: Vec<String> = drain_events(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            DownloadEvent::Failed { reason, .. } => Some(reason),
            _ => None,
        })
        .collect();
    assert!(
        failures.iter().any(|r| r.contains("insufficient storage")),
        "missing failure notification: {failures:?}"
    );
    Ok(())
}

#[tokio::test]
async fn restart_recovery_restores_order_and_clears_store() -> anyhow::Result<()> {
    let source = FakeSource::new(1, "Night Radio");
    let w = work(1, 1, "The Long Wave");
    let chapters = vec![
        chapter(11, 1, "Ch 1"),
        chapter(12, 1, "Ch 2"),
        chapter(13, 1, "Ch 3"),
    ];

    let library = StubLibrary::new();
    library.insert(&w, &chapters);

    let engine = build_engine(
        &[source],
        DownloadConfig::default(),
        u64::MAX,
        library.clone(),
    )
    .await;

    engine.manager.download_chapters(&w, chapters, false).await?;
    assert_eq!(queue_rows(&engine.db).await, 3);

    // Simulate a restart: a fresh manager over the same database has an
    // empty in-memory queue until it restores.
    let restarted = DownloadManager::with_disk_probe(
        &engine.db,
        engine.registry.clone(),
        library,
        engine.root.clone(),
        DownloadConfig::default(),
        DownloadPreferences::default(),
        Arc::new(FixedProbe(u64::MAX)),
    )
    .await?;
    assert!(restarted.queue().is_empty());

    let restored = restarted.restore_queue().await?;
    assert_eq!(restored, 3);

    let ids: Vec<i64> = restarted
        .queue()
        .snapshot()
        .iter()
        .map(|d| d.chapter.id)
        .collect();
    assert_eq!(ids, vec![11, 12, 13], "original order preserved");
    assert_eq!(queue_rows(&engine.db).await, 0, "store cleared by restore");
    Ok(())
}

#[tokio::test]
async fn queue_warning_emitted_above_thresholds() -> anyhow::Result<()> {
    let source = FakeSource::new(1, "Night Radio");
    let w = work(1, 1, "The Long Wave");

    let config = DownloadConfig {
        warn_queued_total: 2,
        ..Default::default()
    };
    let engine = build_engine(&[source], config, u64::MAX, StubLibrary::new()).await;
    let mut events = engine.manager.events();

    engine
        .manager
        .download_chapters(
            &w,
            vec![
                chapter(11, 1, "Ch 1"),
                chapter(12, 1, "Ch 2"),
                chapter(13, 1, "Ch 3"),
            ],
            false,
        )
        .await?;

    let warning = drain_events(&mut events).into_iter().find_map(|e| match e {
        DownloadEvent::QueueWarning {
            queued,
            max_from_one_source,
            help_url,
        } => Some((queued, max_from_one_source, help_url)),
        _ => None,
    });
    let (queued, max_from_one_source, help_url) = warning.expect("expected a queue warning");
    assert_eq!(queued, 3);
    assert_eq!(max_from_one_source, 3);
    assert!(!help_url.is_empty());
    Ok(())
}

#[tokio::test]
async fn delete_chapters_removes_files_and_index_entries() -> anyhow::Result<()> {
    let body = body_of(4 * 1024);
    let server = TestServer::start(body, None).await;

    let source = FakeSource::new(1, "Night Radio");
    let w = work(1, 1, "The Long Wave");
    let c = chapter(11, 1, "Chapter 1");
    source.set_url(11, server.url("/ch1.m4b"));

    let engine = build_engine(
        &[source],
        DownloadConfig::default(),
        u64::MAX,
        StubLibrary::new(),
    )
    .await;

    engine
        .manager
        .download_chapters(&w, vec![c.clone()], true)
        .await?;
    assert!(
        wait_until(Duration::from_secs(10), || engine
            .manager
            .queue()
            .is_empty())
        .await
    );
    assert_eq!(engine.manager.download_count(Some(&w)), 1);
    assert!(engine.manager.download_size(Some(&w)).await > 0);

    engine.manager.delete_chapters(&w, &[c]).await?;

    assert_eq!(engine.manager.download_count(Some(&w)), 0);
    assert!(!engine
        .manager
        .is_chapter_downloaded("Chapter 1", None, "The Long Wave", 1, false));
    assert!(!engine
        .root
        .join("Night Radio")
        .join("The Long Wave")
        .exists());
    Ok(())
}
