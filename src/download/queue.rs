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


//! Observable download queue.
//!
//! The queue is published as an immutable snapshot (`Arc<Vec<_>>`) through a
//! watch channel: readers never observe a half-applied mutation, and the
//! scheduler plus any UI observers are woken on every change. All mutations
//! serialize through one internal lock. Insertion order is priority order;
//! "download now" moves an item to the front.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::download::model::Download;

/// Immutable view of the queue at one instant.
pub type QueueSnapshot = Arc<Vec<Arc<Download>>>;

pub struct DownloadQueue {
    /// Serializes read-modify-write cycles on the watch value.
    write: Mutex<()>,
    tx: watch::Sender<QueueSnapshot>,
}

impl Default for DownloadQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DownloadQueue {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Arc::new(Vec::new()));
        Self {
            write: Mutex::new(()),
            tx,
        }
    }

    /// Latest snapshot.
    pub fn snapshot(&self) -> QueueSnapshot {
        self.tx.borrow().clone()
    }

    /// Receiver that yields the current snapshot immediately and change
    /// notifications thereafter.
    pub fn subscribe(&self) -> watch::Receiver<QueueSnapshot> {
        self.tx.subscribe()
    }

    pub fn len(&self) -> usize {
        self.tx.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.borrow().is_empty()
    }

    pub fn contains(&self, chapter_id: i64) -> bool {
        self.tx.borrow().iter().any(|d| d.chapter.id == chapter_id)
    }

    pub fn get(&self, chapter_id: i64) -> Option<Arc<Download>> {
        self.tx
            .borrow()
            .iter()
            .find(|d| d.chapter.id == chapter_id)
            .cloned()
    }

    /// Append downloads, skipping chapters already queued. Returns the
    /// entries that were actually added, along with the duplicates that
    /// were already present (so callers can e.g. re-queue errored ones).
    pub fn add_all(
        &self,
        downloads: Vec<Arc<Download>>,
    ) -> (Vec<Arc<Download>>, Vec<Arc<Download>>) {
        let _guard = self.write.lock().unwrap();
        let mut next: Vec<Arc<Download>> = self.tx.borrow().as_ref().clone();
        let mut added = Vec::new();
        let mut duplicates = Vec::new();

        for download in downloads {
            match next.iter().find(|d| d.chapter.id == download.chapter.id) {
                Some(existing) => duplicates.push(existing.clone()),
                None => {
                    next.push(download.clone());
                    added.push(download);
                }
            }
        }

        if !added.is_empty() {
            self.tx.send_replace(Arc::new(next));
        }
        (added, duplicates)
    }

    /// Remove one chapter from the queue.
    pub fn remove(&self, chapter_id: i64) -> Option<Arc<Download>> {
        let _guard = self.write.lock().unwrap();
        let mut next: Vec<Arc<Download>> = self.tx.borrow().as_ref().clone();
        let pos = next.iter().position(|d| d.chapter.id == chapter_id)?;
        let removed = next.remove(pos);
        self.tx.send_replace(Arc::new(next));
        Some(removed)
    }

    /// Remove every download matching the predicate.
    pub fn remove_by(&self, predicate: impl Fn(&Download) -> bool) -> Vec<Arc<Download>> {
        let _guard = self.write.lock().unwrap();
        let current = self.tx.borrow().clone();
        let (removed, kept): (Vec<_>, Vec<_>) =
            current.iter().cloned().partition(|d| predicate(d));
        if !removed.is_empty() {
            self.tx.send_replace(Arc::new(kept));
        }
        removed
    }

    /// Empty the queue, returning what was in it.
    pub fn clear(&self) -> Vec<Arc<Download>> {
        let _guard = self.write.lock().unwrap();
        let current = self.tx.borrow().as_ref().clone();
        if !current.is_empty() {
            self.tx.send_replace(Arc::new(Vec::new()));
        }
        current
    }

    /// Move a chapter to the head of the queue ("download now"). Effective
    /// at the next scheduling evaluation.
    pub fn move_to_front(&self, chapter_id: i64) -> bool {
        let _guard = self.write.lock().unwrap();
        let mut next: Vec<Arc<Download>> = self.tx.borrow().as_ref().clone();
        let Some(pos) = next.iter().position(|d| d.chapter.id == chapter_id) else {
            return false;
        };
        if pos > 0 {
            let item = next.remove(pos);
            next.insert(0, item);
            self.tx.send_replace(Arc::new(next));
        }
        true
    }
}
