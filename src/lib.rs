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


//! Chapter download engine for the Auricle audio series reader.
//!
//! This crate owns everything between "the user tapped download" and "the
//! chapter is a verified directory on disk": a per-source bounded scheduler,
//! two transfer strategies (direct HTTP streaming and segmented-stream
//! remuxing), a crash-resilient queue store, and a lazily renewed filesystem
//! index that answers membership and size queries without stat storms.
//!
//! The presentation layer, media player, source plugin loader and library
//! database are collaborators behind the [`source::ChapterSource`],
//! [`model::Library`] and [`download::model::DownloadEvent`] seams.

pub mod download;
pub mod error;
pub mod file;
pub mod model;
pub mod source;
pub mod storage;

pub use download::downloader::{DownloadConfig, Downloader};
pub use download::manager::{DownloadManager, DownloadPreferences};
pub use download::model::{Download, DownloadEvent, DownloadStatus};
pub use error::{EngineError, Result};
