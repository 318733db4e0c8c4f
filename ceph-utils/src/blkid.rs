// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Probing block devices for filesystem signatures.

use crate::{BoxedExecutor, ExecutionError, BLKID};
use camino::{Utf8Path, Utf8PathBuf};
use std::process::Command;

/// `blkid` exits with this status when it finds nothing to report.
const BLKID_NOTHING_FOUND: i32 = 2;

/// Error returned by [`Blkid::filesystem_type`].
#[derive(thiserror::Error, Debug)]
#[error("Could not probe {device} for a filesystem: {err}")]
pub struct ProbeError {
    device: Utf8PathBuf,
    #[source]
    err: ExecutionError,
}

/// Wraps the `blkid` command.
pub struct Blkid {}

impl Blkid {
    /// Returns the type of the filesystem on `device`, or `None` if the
    /// device carries no recognizable filesystem signature.
    pub fn filesystem_type(
        executor: &BoxedExecutor,
        device: &Utf8Path,
    ) -> Result<Option<String>, ProbeError> {
        let mut command = Command::new(BLKID);
        let cmd = command.args(["-o", "value", "-s", "TYPE", device.as_str()]);
        match executor.execute(cmd) {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let fstype = stdout.trim();
                Ok((!fstype.is_empty()).then(|| fstype.to_string()))
            }
            Err(err) if err.exit_code() == Some(BLKID_NOTHING_FOUND) => {
                Ok(None)
            }
            Err(err) => Err(ProbeError { device: device.to_owned(), err }),
        }
    }
}
