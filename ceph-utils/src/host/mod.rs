// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Running commands on the host.
//!
//! All commands issued by this crate go through an [Executor], which lets
//! tests substitute a [FakeExecutor] for the real [HostExecutor].

mod error;
mod executor;
mod input;
mod output;

pub use error::*;
pub use executor::*;
pub use input::*;
pub use output::*;
