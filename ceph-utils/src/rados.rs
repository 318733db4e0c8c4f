// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Utilities for managing RADOS pools.

use crate::{BoxedExecutor, ExecutionError, ParseError, CEPH, RADOS};
use std::fmt;
use std::process::Command;
use std::str::FromStr;

/// Placement groups used when the number of OSDs cannot be determined.
pub const DEFAULT_PLACEMENT_GROUPS: u32 = 200;

const PLACEMENT_GROUPS_PER_OSD: usize = 100;

/// The oldest release able to list OSDs as JSON.
const OSD_LIST_MIN_VERSION: CephVersion =
    CephVersion { major: 0, minor: 56, patch: 0 };

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Ceph execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Error returned by [`Rados::list_pools`].
#[derive(thiserror::Error, Debug)]
#[error("Could not list pools visible to client {service}: {err}")]
pub struct ListPoolsError {
    service: String,
    #[source]
    err: ExecutionError,
}

/// Error returned by [`Rados::list_osds`].
#[derive(thiserror::Error, Debug)]
#[error("Could not list OSDs: {err}")]
pub struct ListOsdsError {
    #[from]
    err: Error,
}

#[derive(thiserror::Error, Debug)]
enum CreatePoolErrorRaw {
    #[error(transparent)]
    ListOsds(#[from] ListOsdsError),

    #[error("Could not create pool: {0}")]
    Create(ExecutionError),

    #[error("Could not set replica count to {replicas}: {err}")]
    SetReplicas { replicas: u32, err: ExecutionError },
}

/// Error returned by [`Rados::create_pool`].
#[derive(thiserror::Error, Debug)]
#[error("Failed to create pool '{name}': {err}")]
pub struct CreatePoolError {
    name: String,
    #[source]
    err: CreatePoolErrorRaw,
}

/// A Ceph release number, as reported by `ceph -v`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct CephVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl fmt::Display for CephVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for CephVersion {
    type Err = ParseError;

    // Accepts "0.94.1", "10.2.11-0ubuntu0.16.04.1" and "0.48.2argonaut":
    // only the leading digits of each component are significant.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().splitn(3, '.').map(|part| {
            let digits: String =
                part.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse::<u32>().map_err(|_| {
                ParseError(format!("Bad version component in '{s}'"))
            })
        });
        let major = parts
            .next()
            .ok_or_else(|| ParseError(format!("Empty version '{s}'")))??;
        let minor = parts.next().transpose()?.unwrap_or(0);
        let patch = parts.next().transpose()?.unwrap_or(0);
        Ok(CephVersion { major, minor, patch })
    }
}

/// Computes the placement group count for a new pool.
///
/// Without a known (non-zero) OSD count this falls back to
/// [DEFAULT_PLACEMENT_GROUPS].
pub fn placement_group_count(osd_count: Option<usize>, replicas: u32) -> u32 {
    match osd_count {
        Some(osds) if osds > 0 && replicas > 0 => {
            let pgs = osds * PLACEMENT_GROUPS_PER_OSD / replicas as usize;
            u32::try_from(pgs).unwrap_or(u32::MAX)
        }
        _ => DEFAULT_PLACEMENT_GROUPS,
    }
}

/// Wraps commands for interacting with RADOS pools.
pub struct Rados {}

impl Rados {
    /// Lists the pools visible to the client `service`.
    ///
    /// `rados lspools` has no structured output mode; it prints one pool
    /// name per line.
    pub fn list_pools(
        executor: &BoxedExecutor,
        service: &str,
    ) -> Result<Vec<String>, ListPoolsError> {
        let mut command = Command::new(RADOS);
        let cmd = command.args(["--id", service, "lspools"]);
        let output = executor.execute(cmd).map_err(|err| ListPoolsError {
            service: service.to_string(),
            err,
        })?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect())
    }

    pub fn pool_exists(
        executor: &BoxedExecutor,
        service: &str,
        name: &str,
    ) -> Result<bool, ListPoolsError> {
        Ok(Self::list_pools(executor, service)?.iter().any(|p| p == name))
    }

    /// Returns the locally installed Ceph release.
    ///
    /// Returns `None` if the `ceph` binary cannot be run, or if its version
    /// string cannot be understood.
    pub fn version(
        executor: &BoxedExecutor,
    ) -> Result<Option<CephVersion>, ExecutionError> {
        let mut command = Command::new(CEPH);
        let cmd = command.arg("-v");
        let output = match executor.execute(cmd) {
            Ok(output) => output,
            Err(ExecutionError::ExecutionStart { .. }) => return Ok(None),
            Err(err) => return Err(err),
        };
        let stdout = String::from_utf8_lossy(&output.stdout);
        // "ceph version 17.2.6 (d7ff0d10...) quincy (stable)"
        Ok(stdout
            .split_whitespace()
            .nth(2)
            .and_then(|v| v.parse::<CephVersion>().ok()))
    }

    /// Lists the OSDs currently in the cluster.
    ///
    /// Returns `None` when the local Ceph release is too old to report them.
    pub fn list_osds(
        executor: &BoxedExecutor,
        service: &str,
    ) -> Result<Option<Vec<u32>>, ListOsdsError> {
        match Self::version(executor).map_err(Error::from)? {
            Some(version) if version >= OSD_LIST_MIN_VERSION => (),
            _ => return Ok(None),
        }

        let mut command = Command::new(CEPH);
        let cmd = command.args(["--id", service, "osd", "ls", "--format=json"]);
        let output = executor.execute(cmd).map_err(Error::from)?;
        let osds: Vec<u32> = serde_json::from_slice(&output.stdout)
            .map_err(|err| {
                Error::from(ParseError(format!("osd ls output: {err}")))
            })?;
        Ok(Some(osds))
    }

    /// Creates a new pool and sets its replica count.
    ///
    /// Returns the number of placement groups the pool was created with.
    pub fn create_pool(
        executor: &BoxedExecutor,
        service: &str,
        name: &str,
        replicas: u32,
    ) -> Result<u32, CreatePoolError> {
        let err = |err| CreatePoolError { name: name.to_string(), err };

        let osds = Self::list_osds(executor, service)
            .map_err(|e| err(CreatePoolErrorRaw::from(e)))?;
        let pgs = placement_group_count(osds.map(|o| o.len()), replicas);

        let mut command = Command::new(CEPH);
        let cmd = command.args([
            "--id",
            service,
            "osd",
            "pool",
            "create",
            name,
            &pgs.to_string(),
        ]);
        executor
            .execute(cmd)
            .map_err(|e| err(CreatePoolErrorRaw::Create(e)))?;

        let mut command = Command::new(CEPH);
        let cmd = command.args([
            "--id",
            service,
            "osd",
            "pool",
            "set",
            name,
            "size",
            &replicas.to_string(),
        ]);
        executor.execute(cmd).map_err(|e| {
            err(CreatePoolErrorRaw::SetReplicas { replicas, err: e })
        })?;
        Ok(pgs)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::host::{test_log, FakeExecutor, StaticHandler};

    #[test]
    fn test_placement_group_count() {
        assert_eq!(placement_group_count(Some(10), 2), 500);
        assert_eq!(placement_group_count(Some(3), 3), 100);
        assert_eq!(placement_group_count(None, 2), DEFAULT_PLACEMENT_GROUPS);
        assert_eq!(placement_group_count(Some(0), 2), DEFAULT_PLACEMENT_GROUPS);
    }

    #[test]
    fn test_parse_version() {
        let v: CephVersion = "0.94.1".parse().unwrap();
        assert_eq!(v, CephVersion { major: 0, minor: 94, patch: 1 });

        let v: CephVersion = "10.2.11-0ubuntu0.16.04.1".parse().unwrap();
        assert_eq!(v, CephVersion { major: 10, minor: 2, patch: 11 });

        let v: CephVersion = "0.48.2argonaut".parse().unwrap();
        assert!(v < OSD_LIST_MIN_VERSION);

        assert!("unknown".parse::<CephVersion>().is_err());
    }

    #[test]
    fn test_pool_exists_matches_whole_names() {
        let executor = FakeExecutor::new(test_log());
        let mut handler = StaticHandler::new();
        handler.expect_stdout("rados --id mysql lspools", "rbd\nmysql-old\n");
        handler.expect_stdout("rados --id mysql lspools", "rbd\nmysql\n");
        handler.register(&executor);
        let executor = executor.as_executor();

        assert!(!Rados::pool_exists(&executor, "mysql", "mysql").unwrap());
        assert!(Rados::pool_exists(&executor, "mysql", "mysql").unwrap());
    }

    #[test]
    fn test_create_pool_sizes_placement_groups_from_osds() {
        let executor = FakeExecutor::new(test_log());
        let mut handler = StaticHandler::new();
        handler.expect_stdout(
            "ceph -v",
            "ceph version 17.2.6 (d7ff0d10654d2280e08f1ab989c7cdf3064446a5) quincy (stable)",
        );
        handler.expect_stdout(
            "ceph --id mysql osd ls --format=json",
            "[0,1,2,3,4,5,6,7,8,9]",
        );
        handler.expect_ok("ceph --id mysql osd pool create mysql 500");
        handler.expect_ok("ceph --id mysql osd pool set mysql size 2");
        handler.register(&executor);

        let pgs =
            Rados::create_pool(&executor.as_executor(), "mysql", "mysql", 2)
                .unwrap();
        assert_eq!(pgs, 500);
    }

    #[test]
    fn test_create_pool_on_old_cluster_uses_default() {
        let executor = FakeExecutor::new(test_log());
        let mut handler = StaticHandler::new();
        handler.expect_stdout("ceph -v", "ceph version 0.48.2argonaut (commit:3e02b2fad88c2a95d9c0c86878f10d1beb780bfe)");
        handler.expect_ok("ceph --id mysql osd pool create mysql 200");
        handler.expect_ok("ceph --id mysql osd pool set mysql size 3");
        handler.register(&executor);

        let pgs =
            Rados::create_pool(&executor.as_executor(), "mysql", "mysql", 3)
                .unwrap();
        assert_eq!(pgs, DEFAULT_PLACEMENT_GROUPS);
    }

    #[test]
    fn test_create_pool_fails_if_replicas_cannot_be_set() {
        let executor = FakeExecutor::new(test_log());
        let mut handler = StaticHandler::new();
        handler.expect_stdout("ceph -v", "ceph version 0.48.2argonaut (x)");
        handler.expect_ok("ceph --id mysql osd pool create mysql 200");
        handler.expect_fail("ceph --id mysql osd pool set mysql size 3");
        handler.register(&executor);

        let err =
            Rados::create_pool(&executor.as_executor(), "mysql", "mysql", 3)
                .unwrap_err();
        assert!(
            err.to_string().contains("Failed to create pool 'mysql'"),
            "{err}"
        );
    }
}
