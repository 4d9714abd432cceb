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


//! Deterministic directory naming for sources, works and chapters.
//!
//! Layout: `root/<source dir>/<work dir>/<chapter dir>`. All components are
//! sanitized for filesystem compatibility. Chapter directories carry the
//! release-group tag as a `<group>_<name>` prefix when present; an older
//! naming scheme sanitized the joined string in a single pass, and both
//! forms must be recognized when answering "is this downloaded".

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref WHITESPACE_RUN: Regex = Regex::new(r"\s+").unwrap();
}

/// Characters replaced during sanitization.
const INVALID_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Directory and file naming rules for the downloads tree.
pub struct PathResolver;

impl PathResolver {
    /// Suffix marking an in-progress chapter directory. Entries with this
    /// suffix are never indexed and never reported as downloaded.
    pub const TMP_DIR_SUFFIX: &'static str = "_tmp";

    /// Extension of partially transferred files inside a temp directory.
    pub const TMP_FILE_EXTENSION: &'static str = "tmp";

    /// Recognized audio container extensions. A completed chapter may be a
    /// directory of segments or a single file with one of these extensions.
    pub const AUDIO_EXTENSIONS: &'static [&'static str] =
        &["m4b", "m4a", "mp3", "aac", "mka", "ogg", "opus"];

    /// Replace invalid filename characters and collapse whitespace runs.
    pub fn sanitize(name: &str) -> String {
        let replaced: String = name
            .chars()
            .map(|c| {
                if INVALID_CHARS.contains(&c) || c.is_control() {
                    '_'
                } else {
                    c
                }
            })
            .collect();

        WHITESPACE_RUN
            .replace_all(&replaced, " ")
            .trim()
            .trim_end_matches('.')
            .to_string()
    }

    /// Directory name for a source, derived from its display name.
    pub fn source_dir_name(source_name: &str) -> String {
        Self::sanitize(source_name)
    }

    /// Directory name for a work, derived from its title.
    pub fn work_dir_name(title: &str) -> String {
        Self::sanitize(title)
    }

    /// Canonical chapter directory name: each part sanitized, then joined.
    pub fn chapter_dir_name(chapter_name: &str, group: Option<&str>) -> String {
        match group {
            Some(g) if !g.is_empty() => {
                format!("{}_{}", Self::sanitize(g), Self::sanitize(chapter_name))
            }
            _ => Self::sanitize(chapter_name),
        }
    }

    /// Chapter directory name as written by older releases: the raw
    /// `<group>_<name>` string sanitized in one pass.
    pub fn legacy_chapter_dir_name(chapter_name: &str, group: Option<&str>) -> String {
        match group {
            Some(g) if !g.is_empty() => Self::sanitize(&format!("{}_{}", g, chapter_name)),
            _ => Self::sanitize(chapter_name),
        }
    }

    /// Every directory name under which this chapter may exist on disk.
    pub fn valid_chapter_dir_names(chapter_name: &str, group: Option<&str>) -> Vec<String> {
        let canonical = Self::chapter_dir_name(chapter_name, group);
        let legacy = Self::legacy_chapter_dir_name(chapter_name, group);

        let mut names = vec![canonical];
        if !names.contains(&legacy) {
            names.push(legacy);
        }
        names
    }

    /// Whether a directory entry is an in-progress download artifact.
    pub fn is_temp_entry(file_name: &str) -> bool {
        file_name.ends_with(Self::TMP_DIR_SUFFIX)
            || file_name.ends_with(&format!(".{}", Self::TMP_FILE_EXTENSION))
    }

    /// For a single-file chapter archive, the chapter name it represents
    /// (the stem). `None` when the extension is not a recognized container.
    pub fn audio_archive_stem(file_name: &str) -> Option<&str> {
        let (stem, ext) = file_name.rsplit_once('.')?;
        if Self::AUDIO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) && !stem.is_empty() {
            Some(stem)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_invalid_characters() {
        assert_eq!(PathResolver::sanitize("Hour: One?"), "Hour_ One_");
        assert_eq!(PathResolver::sanitize("a/b\\c|d"), "a_b_c_d");
        assert_eq!(PathResolver::sanitize("Plain Name"), "Plain Name");
    }

    #[test]
    fn sanitize_collapses_whitespace_and_trailing_dots() {
        assert_eq!(PathResolver::sanitize("  spaced   out  "), "spaced out");
        assert_eq!(PathResolver::sanitize("Episode 1..."), "Episode 1");
    }

    #[test]
    fn chapter_dir_name_with_group() {
        assert_eq!(
            PathResolver::chapter_dir_name("Chapter 1", Some("DramaWorks")),
            "DramaWorks_Chapter 1"
        );
        assert_eq!(PathResolver::chapter_dir_name("Chapter 1", None), "Chapter 1");
        assert_eq!(
            PathResolver::chapter_dir_name("Chapter 1", Some("")),
            "Chapter 1"
        );
    }

    #[test]
    fn legacy_name_differs_when_group_ends_invalid() {
        // "Grp?" sanitized alone yields "Grp_"; joined first, the '?' is
        // still replaced but the underscore separator follows it unchanged.
        let canonical = PathResolver::chapter_dir_name("Ch 5", Some("Grp?"));
        let legacy = PathResolver::legacy_chapter_dir_name("Ch 5", Some("Grp?"));
        assert_eq!(canonical, "Grp__Ch 5");
        assert_eq!(legacy, "Grp__Ch 5");

        // A group with a trailing dot is where the two schemes diverge:
        // sanitizing parts trims the dot, sanitizing the joined string
        // keeps it (it is no longer trailing).
        let canonical = PathResolver::chapter_dir_name("Ch 5", Some("Grp."));
        let legacy = PathResolver::legacy_chapter_dir_name("Ch 5", Some("Grp."));
        assert_eq!(canonical, "Grp_Ch 5");
        assert_eq!(legacy, "Grp._Ch 5");
        assert_ne!(canonical, legacy);

        let names = PathResolver::valid_chapter_dir_names("Ch 5", Some("Grp."));
        assert_eq!(names.len(), 2);
    }

    #[test]
    fn temp_entries_are_recognized() {
        assert!(PathResolver::is_temp_entry("Chapter 1_tmp"));
        assert!(PathResolver::is_temp_entry("Chapter 1.tmp"));
        assert!(!PathResolver::is_temp_entry("Chapter 1"));
        assert!(!PathResolver::is_temp_entry("Chapter 1.m4b"));
    }

    #[test]
    fn audio_archive_stems() {
        assert_eq!(PathResolver::audio_archive_stem("Ch 1.m4b"), Some("Ch 1"));
        assert_eq!(PathResolver::audio_archive_stem("Ch 1.MP3"), Some("Ch 1"));
        assert_eq!(PathResolver::audio_archive_stem("Ch 1.txt"), None);
        assert_eq!(PathResolver::audio_archive_stem("noext"), None);
    }
}
