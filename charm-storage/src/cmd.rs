// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Facilities for command-line programs.

use std::process::exit;

/// Represents a general error for a command-line program.
#[derive(Debug)]
pub enum CmdError {
    /// Incorrect command-line arguments
    Usage(String),
    /// All other errors
    Failure(anyhow::Error),
}

impl From<anyhow::Error> for CmdError {
    fn from(err: anyhow::Error) -> Self {
        CmdError::Failure(err)
    }
}

/// Exits the current process on a fatal error.
///
/// Usage errors exit with status 2, every other failure with status 1. The
/// whole error chain is printed, so the stage that failed is always named.
pub fn fatal(cmd_error: CmdError) -> ! {
    let arg0_result = std::env::current_exe().ok();
    let arg0 = arg0_result
        .as_deref()
        .and_then(|pathbuf| pathbuf.file_stem())
        .and_then(|file_name| file_name.to_str())
        .unwrap_or("command");
    let (exit_code, message) = match cmd_error {
        CmdError::Usage(m) => (2, m),
        CmdError::Failure(e) => (1, format!("{e:?}")),
    };
    eprintln!("{arg0}: {message}");
    exit(exit_code);
}
