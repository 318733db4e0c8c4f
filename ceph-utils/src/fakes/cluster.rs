// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A fake Ceph cluster and block layer which answers the commands issued by
//! this crate.
//!
//! The state is shared between the [FakeCluster] handle and the handler
//! registered with a [FakeExecutor], so tests can seed it, run code against
//! the executor, and then inspect what changed.

use crate::host::{FakeExecutor, Input, Output, OutputExt};
use crate::{BLKID, CEPH, MKFS, MOUNT, RADOS, RBD};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FakePool {
    pub pg_num: u32,
    pub size: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FakeMapping {
    pub pool: String,
    pub image: String,
    pub device: String,
}

impl FakeMapping {
    /// The udev-managed alias of the mapped device.
    pub fn alias(&self) -> String {
        format!("/dev/rbd/{}/{}", self.pool, self.image)
    }
}

#[derive(Debug)]
pub struct ClusterState {
    /// Reported by `ceph -v`.
    pub version: String,
    pub osds: Vec<u32>,
    pub pools: BTreeMap<String, FakePool>,
    /// Image sizes in MiB, keyed by (pool, image).
    pub images: BTreeMap<(String, String), u64>,
    pub mappings: Vec<FakeMapping>,
    /// Filesystem type, keyed by kernel device name.
    pub filesystems: BTreeMap<String, String>,
    /// Mounted device, keyed by mount point.
    pub mounts: BTreeMap<String, String>,
    /// Programs (or "program subcommand") which fail when run.
    pub failing: BTreeSet<String>,
    /// Every command run against the cluster, in order.
    pub history: Vec<Input>,
}

impl Default for ClusterState {
    fn default() -> Self {
        Self {
            version: "17.2.6".to_string(),
            osds: vec![0, 1, 2],
            pools: BTreeMap::new(),
            images: BTreeMap::new(),
            mappings: vec![],
            filesystems: BTreeMap::new(),
            mounts: BTreeMap::new(),
            failing: BTreeSet::new(),
            history: vec![],
        }
    }
}

impl ClusterState {
    /// Resolves a device path, either the kernel name or the udev alias, to
    /// the kernel name of a mapped image.
    fn resolve_device(&self, device: &str) -> Option<String> {
        self.mappings
            .iter()
            .find(|m| m.device == device || m.alias() == device)
            .map(|m| m.device.clone())
    }
}

/// Returns true for commands which change cluster or host state.
pub fn is_mutating(input: &Input) -> bool {
    let args: Vec<&str> = input.args.iter().map(String::as_str).collect();
    match (input.program.as_str(), args.as_slice()) {
        (CEPH, [.., "osd", "pool", "create", _, _]) => true,
        (CEPH, [.., "osd", "pool", "set", _, _, _]) => true,
        (RBD, ["create", ..]) | (RBD, ["map", ..]) => true,
        (MKFS, _) | (MOUNT, _) => true,
        _ => false,
    }
}

#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes every command run by `executor` to this cluster.
    pub fn register(&self, executor: &FakeExecutor) {
        let state = self.state.clone();
        executor.set_handler(Box::new(move |input| {
            let mut state = state.lock().unwrap();
            state.history.push(input.clone());
            handle(&mut state, input)
        }));
    }

    pub fn state(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap()
    }

    /// Makes every command starting with `prefix` (e.g. "mkfs" or
    /// "rbd map") fail.
    pub fn fail(&self, prefix: &str) {
        self.state().failing.insert(prefix.to_string());
    }

    pub fn history(&self) -> Vec<Input> {
        self.state().history.clone()
    }

    /// The state-changing commands run so far.
    pub fn mutations(&self) -> Vec<Input> {
        self.state().history.iter().filter(|i| is_mutating(i)).cloned().collect()
    }

    pub fn clear_history(&self) {
        self.state().history.clear();
    }
}

fn not_found(what: &str) -> Output {
    Output::exit_code(2).set_stderr(format!("{what}: No such file or directory"))
}

fn handle(state: &mut ClusterState, input: Input) -> Output {
    let args: Vec<&str> = input.args.iter().map(String::as_str).collect();

    let failing = state.failing.iter().any(|prefix| {
        let mut words = prefix.split_whitespace();
        words.next() == Some(input.program.as_str())
            && words.all(|w| args.contains(&w))
    });
    if failing {
        return Output::failure().set_stderr("injected failure");
    }

    match (input.program.as_str(), args.as_slice()) {
        (CEPH, ["-v"]) => Output::success().set_stdout(format!(
            "ceph version {} (0000000000000000000000000000000000000000)\n",
            state.version
        )),
        (RADOS, ["--id", _, "lspools"]) => {
            let pools: String =
                state.pools.keys().map(|p| format!("{p}\n")).collect();
            Output::success().set_stdout(pools)
        }
        (CEPH, ["--id", _, "osd", "ls", "--format=json"]) => {
            Output::success().set_stdout(format!("{:?}", state.osds))
        }
        (CEPH, ["--id", _, "osd", "pool", "create", name, pg_num]) => {
            let Ok(pg_num) = pg_num.parse() else {
                return Output::exit_code(22).set_stderr("bad pg_num");
            };
            state
                .pools
                .entry(name.to_string())
                .or_insert(FakePool { pg_num, size: 3 });
            Output::success()
        }
        (CEPH, ["--id", _, "osd", "pool", "set", name, "size", size]) => {
            let Ok(size) = size.parse() else {
                return Output::exit_code(22).set_stderr("bad size");
            };
            match state.pools.get_mut(*name) {
                Some(pool) => {
                    pool.size = size;
                    Output::success()
                }
                None => not_found(name),
            }
        }
        (RBD, ["list", "--id", _, "--pool", pool, "--format=json"]) => {
            if !state.pools.contains_key(*pool) {
                return not_found(pool);
            }
            let images: Vec<&str> = state
                .images
                .keys()
                .filter(|(p, _)| p.as_str() == *pool)
                .map(|(_, i)| i.as_str())
                .collect();
            Output::success().set_stdout(format!("{images:?}"))
        }
        (RBD, ["create", image, "--size", size, "--id", _, "--pool", pool]) => {
            if !state.pools.contains_key(*pool) {
                return not_found(pool);
            }
            let Ok(size) = size.parse() else {
                return Output::exit_code(22).set_stderr("bad size");
            };
            let key = (pool.to_string(), image.to_string());
            if state.images.contains_key(&key) {
                return Output::exit_code(17).set_stderr("image already exists");
            }
            state.images.insert(key, size);
            Output::success()
        }
        (RBD, ["showmapped", "--format=json"]) => {
            let entries: Vec<String> = state
                .mappings
                .iter()
                .enumerate()
                .map(|(id, m)| {
                    format!(
                        r#"{{"id":"{id}","pool":"{}","namespace":"","name":"{}","snap":"-","device":"{}"}}"#,
                        m.pool, m.image, m.device
                    )
                })
                .collect();
            Output::success().set_stdout(format!("[{}]", entries.join(",")))
        }
        (RBD, ["map", spec, "--user", _, "--secret", _]) => {
            let Some((pool, image)) = spec.split_once('/') else {
                return Output::exit_code(22).set_stderr("bad image spec");
            };
            if !state.images.contains_key(&(pool.to_string(), image.to_string()))
            {
                return not_found(spec);
            }
            let device = format!("/dev/rbd{}", state.mappings.len());
            state.mappings.push(FakeMapping {
                pool: pool.to_string(),
                image: image.to_string(),
                device,
            });
            Output::success()
        }
        (BLKID, ["-o", "value", "-s", "TYPE", device]) => {
            match state
                .resolve_device(device)
                .and_then(|d| state.filesystems.get(&d))
            {
                Some(fstype) => Output::success().set_stdout(format!("{fstype}\n")),
                None => Output::exit_code(2),
            }
        }
        (MKFS, ["-t", fstype, device]) => match state.resolve_device(device) {
            Some(device) => {
                state.filesystems.insert(device, fstype.to_string());
                Output::success()
            }
            None => not_found(device),
        },
        (MOUNT, ["-t", fstype, device, mountpoint]) => {
            let Some(device) = state.resolve_device(device) else {
                return not_found(device);
            };
            if state.filesystems.get(&device).map(String::as_str) != Some(*fstype) {
                return Output::exit_code(32).set_stderr("wrong fs type");
            }
            state.mounts.insert(mountpoint.to_string(), device);
            Output::success()
        }
        _ => Output::exit_code(127)
            .set_stderr(format!("fake cluster cannot run: {input}")),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::host::test_log;
    use crate::rados::Rados;
    use crate::rbd::Rbd;
    use camino::Utf8Path;

    #[test]
    fn test_fake_cluster_tracks_state() {
        let executor = FakeExecutor::new(test_log());
        let cluster = FakeCluster::new();
        cluster.register(&executor);
        let executor = executor.as_executor();

        Rados::create_pool(&executor, "mysql", "mysql", 2).unwrap();
        assert!(Rados::pool_exists(&executor, "mysql", "mysql").unwrap());
        assert_eq!(
            cluster.state().pools["mysql"],
            FakePool { pg_num: 150, size: 2 }
        );

        Rbd::create_image(&executor, "mysql", "mysql", "mysql1", 1024).unwrap();
        Rbd::map(
            &executor,
            "mysql",
            "mysql",
            "mysql1",
            Utf8Path::new("/etc/ceph/ceph.client.mysql.key"),
        )
        .unwrap();
        let mapping = Rbd::find_mapping(&executor, "mysql", "mysql1")
            .unwrap()
            .unwrap();
        assert_eq!(mapping.device.as_str(), "/dev/rbd0");

        assert_eq!(cluster.mutations().len(), 4);
    }

    #[test]
    fn test_injected_failures() {
        let executor = FakeExecutor::new(test_log());
        let cluster = FakeCluster::new();
        cluster.register(&executor);
        cluster.fail("rbd map");
        let executor = executor.as_executor();

        Rados::create_pool(&executor, "mysql", "mysql", 2).unwrap();
        Rbd::create_image(&executor, "mysql", "mysql", "mysql1", 1).unwrap();
        assert!(Rbd::map(
            &executor,
            "mysql",
            "mysql",
            "mysql1",
            Utf8Path::new("/key")
        )
        .is_err());
        assert!(cluster.state().mappings.is_empty());
    }
}
