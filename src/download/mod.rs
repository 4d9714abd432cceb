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


//! Download scheduling, transfer execution and queue persistence.
//!
//! [`downloader::Downloader`] owns the live queue and runs at most one
//! transfer per source across at most three sources at a time. Transfers
//! are dispatched to [`direct`] (plain HTTP streaming into a temp file) or
//! [`remux`] (segmented/manifest streams remuxed by an external tool).
//! [`manager::DownloadManager`] is the facade the rest of the application
//! talks to.

pub mod direct;
pub mod downloader;
pub mod manager;
pub mod model;
pub mod pending;
pub mod queue;
pub mod remux;
pub mod store;

pub use downloader::{DownloadConfig, Downloader};
pub use manager::{DownloadManager, DownloadPreferences};
pub use model::{Download, DownloadEvent, DownloadStatus};
pub use queue::DownloadQueue;
