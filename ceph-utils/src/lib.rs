// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wrappers around the host commands used to provision Ceph-backed storage.

pub mod blkid;
pub mod host;
pub mod keyring;
pub mod mkfs;
pub mod modprobe;
pub mod mount;
pub mod rados;
pub mod rbd;
pub mod service;

#[cfg(any(test, feature = "testing"))]
pub mod fakes;

pub use host::{
    BoxedExecutor, CommandFailureInfo, ExecutionError, Executor, HostExecutor,
};

pub const CEPH: &str = "ceph";
pub const RADOS: &str = "rados";
pub const RBD: &str = "rbd";
pub const CEPH_AUTHTOOL: &str = "ceph-authtool";
pub const BLKID: &str = "blkid";
pub const MKFS: &str = "mkfs";
pub const MOUNT: &str = "mount";
pub const MODPROBE: &str = "modprobe";
pub const SERVICE: &str = "service";

/// Directory holding the Ceph client configuration and credentials.
pub const CEPH_CONF_DIR: &str = "/etc/ceph";

/// Output from a command that could not be understood.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("Failed to parse output: {0}")]
pub struct ParseError(pub String);
