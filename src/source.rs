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


//! Source plugin seam: media resolution and the registry of loaded sources.
//!
//! Sources are loaded by an external plugin host. The engine only requires
//! the ability to resolve a chapter into a [`MediaTrack`] and to enumerate
//! what is currently loaded (the download index matches top-level directory
//! names against source names during renewal).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{Chapter, SourceId};

/// Secondary stream shipped alongside the main media, e.g. a commentary
/// track or timed transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SideTrack {
    pub url: String,
    pub language: Option<String>,
}

/// Resolved stream descriptor for one chapter.
///
/// Set on a download at most once per attempt and cleared when the attempt
/// is restarted, so a retry re-resolves against the source.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MediaTrack {
    pub url: String,
    /// Request headers the source requires (referer, auth cookies, ...).
    /// Forwarded verbatim to both transfer strategies.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub audio_tracks: Vec<SideTrack>,
    #[serde(default)]
    pub subtitle_tracks: Vec<SideTrack>,
}

impl MediaTrack {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// A loaded remote source capable of resolving chapter media.
#[async_trait]
pub trait ChapterSource: Send + Sync {
    fn id(&self) -> SourceId;

    /// Display name; also the basis of the source's directory name on disk.
    fn name(&self) -> &str;

    /// Resolve the stream descriptor for a chapter. This is a network call;
    /// failures surface as the enclosing download's error.
    async fn resolve_media(&self, chapter: &Chapter) -> Result<MediaTrack>;
}

/// Registry of currently loaded sources.
///
/// Plugin loading happens elsewhere and may finish after the engine starts.
/// `mark_loaded` flips once the initial load completes, so the index scan
/// can tell an unknown directory apart from a source that just has not
/// loaded yet.
#[derive(Default)]
pub struct SourceRegistry {
    sources: RwLock<Vec<Arc<dyn ChapterSource>>>,
    loaded: AtomicBool,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, source: Arc<dyn ChapterSource>) {
        self.sources.write().unwrap().push(source);
    }

    pub fn get(&self, id: SourceId) -> Option<Arc<dyn ChapterSource>> {
        self.sources
            .read()
            .unwrap()
            .iter()
            .find(|s| s.id() == id)
            .cloned()
    }

    pub fn all(&self) -> Vec<Arc<dyn ChapterSource>> {
        self.sources.read().unwrap().clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// Marks the initial plugin load as complete.
    pub fn mark_loaded(&self) {
        self.loaded.store(true, Ordering::Release);
    }
}
