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


//! Filesystem concerns: naming, free-space probing and the download index.
//!
//! The filesystem is the authoritative record of what is downloaded; the
//! index in [`index`] is only a cache over it.

pub mod disk;
pub mod index;
pub mod paths;

pub use disk::{DiskProbe, SystemDiskProbe};
pub use index::DownloadIndex;
pub use paths::PathResolver;
