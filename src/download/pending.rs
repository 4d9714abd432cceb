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


//! Deferred chapter deletions.
//!
//! "Finished listening, eligible for deletion" events are batched here so
//! the destructive filesystem work can run later in bulk (on app close or
//! an explicit flush) instead of racing the reader. Adds merge by work and
//! de-duplicate by chapter id; `take_all` returns and clears the backlog in
//! one transaction.

use sqlx::{Row, SqlitePool};
use tracing::warn;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{Chapter, Work};
use crate::storage::Database;

#[derive(Debug, Serialize, Deserialize)]
struct PendingPayload {
    work: Work,
    chapters: Vec<Chapter>,
}

pub struct PendingDeletionStore {
    pool: SqlitePool,
}

impl PendingDeletionStore {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Queue chapters of a work for later deletion. Repeated adds for the
    /// same work accumulate a de-duplicated chapter set.
    pub async fn add(&self, work: &Work, chapters: &[Chapter]) -> Result<()> {
        if chapters.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        let existing: Option<String> =
            sqlx::query_scalar("SELECT payload FROM PendingDeletions WHERE work_id = ?")
                .bind(work.id)
                .fetch_optional(&mut *tx)
                .await?;

        let mut merged = match existing.as_deref().map(serde_json::from_str::<PendingPayload>) {
            Some(Ok(payload)) => payload,
            Some(Err(err)) => {
                warn!(work_id = work.id, %err, "dropping corrupt pending-deletion record");
                PendingPayload {
                    work: work.clone(),
                    chapters: Vec::new(),
                }
            }
            None => PendingPayload {
                work: work.clone(),
                chapters: Vec::new(),
            },
        };

        for chapter in chapters {
            if !merged.chapters.iter().any(|c| c.id == chapter.id) {
                merged.chapters.push(chapter.clone());
            }
        }

        sqlx::query(
            "INSERT OR REPLACE INTO PendingDeletions (work_id, payload, updated_at) \
             VALUES (?, ?, ?)",
        )
        .bind(work.id)
        .bind(serde_json::to_string(&merged)?)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Return the whole backlog and clear it atomically. Corrupt payloads
    /// are dropped with a warning.
    pub async fn take_all(&self) -> Result<Vec<(Work, Vec<Chapter>)>> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query("SELECT work_id, payload FROM PendingDeletions")
            .fetch_all(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM PendingDeletions")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let mut batches = Vec::new();
        for row in rows {
            let payload: String = match row.try_get("payload") {
                Ok(p) => p,
                Err(_) => {
                    warn!("dropping unreadable pending-deletion row");
                    continue;
                }
            };
            match serde_json::from_str::<PendingPayload>(&payload) {
                Ok(decoded) => batches.push((decoded.work, decoded.chapters)),
                Err(err) => {
                    let work_id: i64 = row.try_get("work_id").unwrap_or(-1);
                    warn!(work_id, %err, "dropping corrupt pending-deletion record");
                }
            }
        }
        Ok(batches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn work() -> Work {
        Work {
            id: 1,
            source_id: 1,
            title: "W".to_string(),
            category_ids: vec![],
        }
    }

    fn chapter(id: i64) -> Chapter {
        Chapter {
            id,
            work_id: 1,
            name: format!("Ch {id}"),
            group: None,
            number: id as f64,
            read: true,
            bookmarked: false,
        }
    }

    #[tokio::test]
    async fn adds_merge_by_work_and_dedupe_chapters() {
        let db = Database::new_in_memory().await.unwrap();
        let store = PendingDeletionStore::new(&db);

        store.add(&work(), &[chapter(1), chapter(2)]).await.unwrap();
        store.add(&work(), &[chapter(2), chapter(3)]).await.unwrap();

        let batches = store.take_all().await.unwrap();
        assert_eq!(batches.len(), 1);
        let (w, chapters) = &batches[0];
        assert_eq!(w.id, 1);
        let mut ids: Vec<i64> = chapters.iter().map(|c| c.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn take_all_clears_backlog() {
        let db = Database::new_in_memory().await.unwrap();
        let store = PendingDeletionStore::new(&db);

        store.add(&work(), &[chapter(1)]).await.unwrap();
        assert_eq!(store.take_all().await.unwrap().len(), 1);
        assert!(store.take_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_payloads_are_dropped() {
        let db = Database::new_in_memory().await.unwrap();
        let store = PendingDeletionStore::new(&db);

        sqlx::query(
            "INSERT INTO PendingDeletions (work_id, payload, updated_at) \
             VALUES (7, 'not json', '2025-01-01T00:00:00Z')",
        )
        .execute(db.pool())
        .await
        .unwrap();
        store.add(&work(), &[chapter(1)]).await.unwrap();

        let batches = store.take_all().await.unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].0.id, 1);
    }
}
