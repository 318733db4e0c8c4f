// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Provisioning and attaching Ceph-backed storage for a charm unit.
//!
//! [provision] converges a pool, an image, a kernel mapping and a
//! filesystem into existence. [volume] moves a service's data directory
//! between local (ephemeral) storage and an external mount.

pub mod cmd;
pub mod config;
pub mod identity;
pub mod provision;
pub mod volume;

#[cfg(any(test, feature = "testing"))]
pub mod fakes;
