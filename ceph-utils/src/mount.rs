// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Inspecting the mount table and mounting block devices.

use crate::{BoxedExecutor, ExecutionError, MOUNT};
use camino::{Utf8Path, Utf8PathBuf};
use std::process::Command;

/// The kernel's view of mounted filesystems.
pub const PROC_MOUNTS: &str = "/proc/mounts";

/// Error returned by [`MountTable::read`].
#[derive(thiserror::Error, Debug)]
#[error("Could not read mount table {path}: {err}")]
pub struct ReadMountsError {
    path: Utf8PathBuf,
    #[source]
    err: std::io::Error,
}

/// Error returned by [`Mount::mount`].
#[derive(thiserror::Error, Debug)]
#[error("Failed to mount {device} at {mountpoint}: {err}")]
pub struct MountError {
    device: Utf8PathBuf,
    mountpoint: Utf8PathBuf,
    #[source]
    err: ExecutionError,
}

/// One line of the mount table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub target: Utf8PathBuf,
    pub fstype: String,
}

/// A snapshot of the mount table.
#[derive(Clone, Debug, Default)]
pub struct MountTable {
    entries: Vec<MountEntry>,
}

impl MountTable {
    /// Reads a mount table in `/proc/mounts` format from `path`.
    pub fn read(path: &Utf8Path) -> Result<Self, ReadMountsError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|err| ReadMountsError { path: path.to_owned(), err })?;
        Ok(Self::parse(&contents))
    }

    /// Parses `/proc/mounts` content.
    ///
    /// Each line is "source target fstype options dump pass", with spaces,
    /// tabs, newlines and backslashes inside a field written as octal
    /// escapes. Lines with fewer than three fields are skipped.
    pub fn parse(contents: &str) -> Self {
        let entries = contents
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let source = unescape(fields.next()?);
                let target = Utf8PathBuf::from(unescape(fields.next()?));
                let fstype = unescape(fields.next()?);
                Some(MountEntry { source, target, fstype })
            })
            .collect();
        Self { entries }
    }

    pub fn entries(&self) -> &[MountEntry] {
        &self.entries
    }

    /// Returns true if a filesystem is mounted exactly at `path`.
    pub fn is_mounted(&self, path: &Utf8Path) -> bool {
        let path = normalize(path);
        self.entries.iter().any(|e| normalize(&e.target) == path)
    }
}

fn normalize(path: &Utf8Path) -> Utf8PathBuf {
    path.components().collect()
}

fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let octal = std::str::from_utf8(&bytes[i + 1..i + 4])
                .ok()
                .and_then(|s| u8::from_str_radix(s, 8).ok());
            if let Some(b) = octal {
                out.push(b);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Wraps the `mount` command.
pub struct Mount {}

impl Mount {
    /// Mounts `device`, formatted as `fstype`, at `mountpoint`.
    pub fn mount(
        executor: &BoxedExecutor,
        device: &Utf8Path,
        mountpoint: &Utf8Path,
        fstype: &str,
    ) -> Result<(), MountError> {
        let mut command = Command::new(MOUNT);
        let cmd = command.args([
            "-t",
            fstype,
            device.as_str(),
            mountpoint.as_str(),
        ]);
        executor.execute(cmd).map_err(|err| MountError {
            device: device.to_owned(),
            mountpoint: mountpoint.to_owned(),
            err,
        })?;
        Ok(())
    }
}
