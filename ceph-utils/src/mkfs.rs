// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Creating filesystems on block devices.

use crate::{BoxedExecutor, ExecutionError, MKFS};
use camino::{Utf8Path, Utf8PathBuf};
use std::process::Command;

/// Error returned by [`Mkfs::make_filesystem`].
#[derive(thiserror::Error, Debug)]
#[error("Failed to format {device} as {fstype}: {err}")]
pub struct MakeFilesystemError {
    device: Utf8PathBuf,
    fstype: String,
    #[source]
    err: ExecutionError,
}

/// Wraps the `mkfs` command.
pub struct Mkfs {}

impl Mkfs {
    /// Formats `device` with a new `fstype` filesystem, destroying anything
    /// already on it.
    pub fn make_filesystem(
        executor: &BoxedExecutor,
        device: &Utf8Path,
        fstype: &str,
    ) -> Result<(), MakeFilesystemError> {
        let mut command = Command::new(MKFS);
        let cmd = command.args(["-t", fstype, device.as_str()]);
        executor.execute(cmd).map_err(|err| MakeFilesystemError {
            device: device.to_owned(),
            fstype: fstype.to_string(),
            err,
        })?;
        Ok(())
    }
}
