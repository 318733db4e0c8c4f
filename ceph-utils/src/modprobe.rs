// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Loading kernel modules, now and on every boot.

use crate::{BoxedExecutor, ExecutionError, MODPROBE};
use camino::{Utf8Path, Utf8PathBuf};
use slog::{info, Logger};
use std::fs::OpenOptions;
use std::io::Write;
use std::process::Command;

/// Modules listed here are loaded at boot.
pub const MODULES_FILE: &str = "/etc/modules";

#[derive(thiserror::Error, Debug)]
enum LoadModuleErrorRaw {
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("Could not update {path}: {err}")]
    Persist { path: Utf8PathBuf, err: std::io::Error },
}

/// Error returned by [`Modprobe::load`].
#[derive(thiserror::Error, Debug)]
#[error("Failed to load kernel module {module}: {err}")]
pub struct LoadModuleError {
    module: String,
    #[source]
    err: LoadModuleErrorRaw,
}

/// Wraps the `modprobe` command.
pub struct Modprobe {}

impl Modprobe {
    /// Loads `module`, and lists it in `modules_file` so it is loaded again
    /// after a reboot. The module is listed at most once.
    pub fn load(
        log: &Logger,
        executor: &BoxedExecutor,
        module: &str,
        modules_file: &Utf8Path,
    ) -> Result<(), LoadModuleError> {
        let err = |err| LoadModuleError { module: module.to_string(), err };

        info!(log, "Loading kernel module"; "module" => module);
        let mut command = Command::new(MODPROBE);
        executor
            .execute(command.arg(module))
            .map_err(|e| err(LoadModuleErrorRaw::Execution(e)))?;

        Self::persist(log, module, modules_file).map_err(|e| {
            err(LoadModuleErrorRaw::Persist {
                path: modules_file.to_owned(),
                err: e,
            })
        })
    }

    fn persist(
        log: &Logger,
        module: &str,
        modules_file: &Utf8Path,
    ) -> std::io::Result<()> {
        let existing = match std::fs::read_to_string(modules_file) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e),
        };
        if existing.lines().any(|line| line.trim() == module) {
            return Ok(());
        }

        let mut file =
            OpenOptions::new().create(true).append(true).open(modules_file)?;
        if !existing.is_empty() && !existing.ends_with('\n') {
            writeln!(file)?;
        }
        writeln!(file, "{module}")?;
        info!(
            log, "Listed kernel module for loading at boot";
            "module" => module,
            "path" => %modules_file,
        );
        Ok(())
    }
}
