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


//! Free-space probing for the downloads volume.

use std::path::Path;

/// Probe for available bytes on the volume holding a path.
///
/// A trait so the scheduler's space check stays testable; the engine wires
/// in [`SystemDiskProbe`] by default.
pub trait DiskProbe: Send + Sync {
    /// Free bytes available to unprivileged writes at `path`, or `None`
    /// when it cannot be determined. An unknown amount never blocks a
    /// download.
    fn free_space(&self, path: &Path) -> Option<u64>;
}

/// statvfs-backed probe.
#[derive(Debug, Default)]
pub struct SystemDiskProbe;

impl DiskProbe for SystemDiskProbe {
    #[cfg(unix)]
    fn free_space(&self, path: &Path) -> Option<u64> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
        if rc != 0 {
            return None;
        }
        Some(stat.f_bavail as u64 * stat.f_frsize as u64)
    }

    #[cfg(not(unix))]
    fn free_space(&self, _path: &Path) -> Option<u64> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn system_probe_reports_space_for_tempdir() {
        let dir = tempfile::tempdir().unwrap();
        let free = SystemDiskProbe.free_space(dir.path());
        assert!(free.is_some());
    }

    #[test]
    fn system_probe_handles_missing_path() {
        let free = SystemDiskProbe.free_space(Path::new("/definitely/not/a/real/path"));
        assert!(free.is_none());
    }
}
