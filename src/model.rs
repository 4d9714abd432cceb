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


//! Domain records shared between the engine and its collaborators.
//!
//! The library database itself lives outside this crate; the engine only
//! needs the identifying and display fields of a work and its chapters,
//! plus a read-only resolution seam ([`Library`]) used when rebuilding the
//! queue after a restart.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Identifier of a loaded remote source.
pub type SourceId = i64;

/// An audio series as known to the library database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Work {
    pub id: i64,
    pub source_id: SourceId,
    pub title: String,
    /// Library categories the work is filed under; consulted by the
    /// download policy filter.
    #[serde(default)]
    pub category_ids: Vec<i64>,
}

/// A single chapter/episode of a work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub id: i64,
    pub work_id: i64,
    pub name: String,
    /// Release-group tag, when the source distinguishes uploads of the
    /// same chapter. Part of the on-disk directory name.
    pub group: Option<String>,
    /// Position within the work as reported by the source.
    pub number: f64,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub bookmarked: bool,
}

/// Read-only view of the library database.
///
/// Used by the queue store to resolve persisted (work id, chapter id) pairs
/// back into live domain objects after a restart; rows that no longer
/// resolve are silently discarded.
#[async_trait]
pub trait Library: Send + Sync {
    async fn work(&self, id: i64) -> Option<Work>;
    async fn chapter(&self, id: i64) -> Option<Chapter>;
}
