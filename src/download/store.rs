//! Durable record of the download queue.
//!
//! Only the *identity* of in-flight downloads is persisted - (work id,
//! chapter id) plus a monotonic position. Transfer progress is not; a
//! restored download restarts from the scheduling stage. Rows whose work or
//! chapter no longer exists in the library are discarded during restore,
//! and the table is cleared after a successful restore (items are persisted
//! again when they are actually scheduled).

use std::sync::Arc;

use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

use crate::download::model::Download;
use crate::error::Result;
use crate::model::Library;
use crate::storage::Database;

pub struct QueueStore {
    pool: SqlitePool,
}

impl QueueStore {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Persist downloads in queue order. Positions continue from the
    /// current maximum so ordering survives incremental adds.
    pub async fn add_all(&self, downloads: &[Arc<Download>]) -> Result<()> {
        if downloads.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        let base: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(position), 0) FROM DownloadQueue")
            .fetch_one(&mut *tx)
            .await?;
        let now = chrono::Utc::now().to_rfc3339();

        for (offset, download) in downloads.iter().enumerate() {
            sqlx::query(
                "INSERT OR REPLACE INTO DownloadQueue (chapter_id, work_id, position, created_at) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(download.chapter.id)
            .bind(download.work.id)
            .bind(base + 1 + offset as i64)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn remove(&self, chapter_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM DownloadQueue WHERE chapter_id = ?")
            .bind(chapter_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn remove_all(&self, chapter_ids: &[i64]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for chapter_id in chapter_ids {
            sqlx::query("DELETE FROM DownloadQueue WHERE chapter_id = ?")
                .bind(chapter_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM DownloadQueue")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn count(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM DownloadQueue")
            .fetch_one(&self.pool)
            .await?)
    }

    /// Rebuild the queue contents after a restart.
    ///
    /// Rows are resolved through the library in stored order; unresolvable
    /// or unreadable rows are dropped. The table is cleared afterwards.
    pub async fn restore(&self, library: &dyn Library) -> Result<Vec<Arc<Download>>> {
        let rows = sqlx::query(
            "SELECT chapter_id, work_id FROM DownloadQueue ORDER BY position ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut restored = Vec::new();
        for row in rows {
            let (chapter_id, work_id): (i64, i64) =
                match (row.try_get("chapter_id"), row.try_get("work_id")) {
                    (Ok(c), Ok(w)) => (c, w),
                    _ => {
                        warn!("dropping unreadable download queue row");
                        continue;
                    }
                };

            let Some(work) = library.work(work_id).await else {
                debug!(work_id, "discarding queued download for missing work");
                continue;
            };
            let Some(chapter) = library.chapter(chapter_id).await else {
                debug!(chapter_id, "discarding queued download for missing chapter");
                continue;
            };

            restored.push(Arc::new(Download::new(Arc::new(work), Arc::new(chapter))));
        }

        self.clear().await?;
        debug!(count = restored.len(), "restored download queue");
        Ok(restored)
    }
}
