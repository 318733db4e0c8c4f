// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Moving a service's data directory between local and external storage.
//!
//! The service directory is either a plain directory (ephemeral storage) or
//! a symlink to the mount point of an external volume. Switching to external
//! storage moves any existing content aside to a preserved directory, which
//! is restored when switching back.

use camino::{Utf8Path, Utf8PathBuf};
use ceph_utils::mount::{Mount, MountError, MountTable};
use ceph_utils::service::{Service, ServiceError};
use ceph_utils::BoxedExecutor;
use slog::{info, warn, Logger};
use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::Arc;

/// Where the service's data should live.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VolumeDecision {
    Ephemeral,
    External(Utf8PathBuf),
}

impl FromStr for VolumeDecision {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "ephemeral" {
            Ok(VolumeDecision::Ephemeral)
        } else {
            Ok(VolumeDecision::External(Utf8PathBuf::from(s)))
        }
    }
}

impl fmt::Display for VolumeDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VolumeDecision::Ephemeral => write!(f, "ephemeral"),
            VolumeDecision::External(mountpoint) => write!(f, "{mountpoint}"),
        }
    }
}

/// What a path refers to, without following symlinks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    Symlink(Utf8PathBuf),
    File,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Owner {
    pub uid: u32,
    /// Left unchanged when `None`.
    pub gid: Option<u32>,
}

/// The filesystem operations the switcher needs.
///
/// None of these follow a symlink at the final path component.
pub trait Filesystem: Send + Sync {
    fn entry(&self, path: &Utf8Path) -> io::Result<Option<EntryKind>>;
    fn is_empty_dir(&self, path: &Utf8Path) -> io::Result<bool>;
    fn is_mounted(&self, path: &Utf8Path) -> io::Result<bool>;
    fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> io::Result<()>;
    fn symlink(&self, target: &Utf8Path, link: &Utf8Path) -> io::Result<()>;
    /// Removes a file or a symlink.
    fn remove_file(&self, path: &Utf8Path) -> io::Result<()>;
    /// Removes an empty directory.
    fn remove_dir(&self, path: &Utf8Path) -> io::Result<()>;
    /// Creates a directory and any missing parents.
    fn create_dir(&self, path: &Utf8Path) -> io::Result<()>;
    /// Every path below `root`, not descending into symlinked directories.
    fn walk(&self, root: &Utf8Path) -> io::Result<Vec<Utf8PathBuf>>;
    fn chown(&self, path: &Utf8Path, owner: Owner) -> io::Result<()>;
}

/// The real filesystem, with mounts read from a `/proc/mounts` style file.
pub struct HostFilesystem {
    mounts: Utf8PathBuf,
}

impl HostFilesystem {
    pub fn new(mounts: impl Into<Utf8PathBuf>) -> Self {
        Self { mounts: mounts.into() }
    }
}

impl Filesystem for HostFilesystem {
    fn entry(&self, path: &Utf8Path) -> io::Result<Option<EntryKind>> {
        let metadata = match std::fs::symlink_metadata(path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };
        let kind = if metadata.is_symlink() {
            let target = path.read_link_utf8()?;
            EntryKind::Symlink(target)
        } else if metadata.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::File
        };
        Ok(Some(kind))
    }

    fn is_empty_dir(&self, path: &Utf8Path) -> io::Result<bool> {
        Ok(path.read_dir_utf8()?.next().is_none())
    }

    fn is_mounted(&self, path: &Utf8Path) -> io::Result<bool> {
        let table = MountTable::read(&self.mounts).map_err(io::Error::other)?;
        Ok(table.is_mounted(path))
    }

    fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> io::Result<()> {
        std::fs::rename(from, to)
    }

    fn symlink(&self, target: &Utf8Path, link: &Utf8Path) -> io::Result<()> {
        std::os::unix::fs::symlink(target, link)
    }

    fn remove_file(&self, path: &Utf8Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    fn remove_dir(&self, path: &Utf8Path) -> io::Result<()> {
        std::fs::remove_dir(path)
    }

    fn create_dir(&self, path: &Utf8Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }

    fn walk(&self, root: &Utf8Path) -> io::Result<Vec<Utf8PathBuf>> {
        let mut paths = vec![];
        let mut pending = vec![root.to_owned()];
        while let Some(dir) = pending.pop() {
            for entry in dir.read_dir_utf8()? {
                let entry = entry?;
                if entry.file_type()?.is_dir() {
                    pending.push(entry.path().to_owned());
                }
                paths.push(entry.into_path());
            }
        }
        Ok(paths)
    }

    fn chown(&self, path: &Utf8Path, owner: Owner) -> io::Result<()> {
        std::os::unix::fs::lchown(path, Some(owner.uid), owner.gid)
    }
}

/// The observed state of the service directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServiceDirectoryState {
    Missing,
    PlainDirectory,
    SymlinkToExternal(Utf8PathBuf),
}

impl ServiceDirectoryState {
    fn satisfies(&self, decision: &VolumeDecision) -> bool {
        match (self, decision) {
            (ServiceDirectoryState::PlainDirectory, VolumeDecision::Ephemeral) => true,
            (
                ServiceDirectoryState::SymlinkToExternal(target),
                VolumeDecision::External(mountpoint),
            ) => target == mountpoint,
            _ => false,
        }
    }
}

impl fmt::Display for ServiceDirectoryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceDirectoryState::Missing => write!(f, "missing"),
            ServiceDirectoryState::PlainDirectory => write!(f, "plain directory"),
            ServiceDirectoryState::SymlinkToExternal(target) => {
                write!(f, "symlink to {target}")
            }
        }
    }
}

/// What [VolumeSwitcher::apply] did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transition {
    /// The directory already matched the decision; nothing was touched.
    Unchanged,
    /// The directory was switched away from the given state.
    Switched { from: ServiceDirectoryState },
}

#[derive(thiserror::Error, Debug)]
pub enum VolumeError {
    #[error("Invalid volume configuration: {0}")]
    Config(String),

    #[error("Could not inspect {path}: {err}")]
    Inspect {
        path: Utf8PathBuf,
        #[source]
        err: io::Error,
    },

    #[error("Unexpected {kind} at {path}")]
    UnexpectedEntry { path: Utf8PathBuf, kind: &'static str },

    #[error("Failed to {action} {path}: {err}")]
    Transition {
        action: &'static str,
        path: Utf8PathBuf,
        #[source]
        err: io::Error,
    },

    #[error("Service directory is a {found} after switching to {expected}")]
    Unresolved { expected: VolumeDecision, found: ServiceDirectoryState },

    #[error("Failed to change ownership of {path}: {err}")]
    Ownership {
        path: Utf8PathBuf,
        #[source]
        err: io::Error,
    },

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Mount(#[from] MountError),
}

fn transition_err<'a>(
    action: &'static str,
    path: &'a Utf8Path,
) -> impl FnOnce(io::Error) -> VolumeError + 'a {
    move |err| VolumeError::Transition { action, path: path.to_owned(), err }
}

/// Switches one service directory between ephemeral and external storage.
pub struct VolumeSwitcher {
    log: Logger,
    executor: BoxedExecutor,
    fs: Arc<dyn Filesystem>,
    service_dir: Utf8PathBuf,
    saved_dir: Utf8PathBuf,
    owner: Option<Owner>,
    services: Vec<String>,
}

impl VolumeSwitcher {
    /// Content displaced by external storage is kept at
    /// `<service_dir>.<saved_suffix>`.
    pub fn new(
        log: &Logger,
        executor: BoxedExecutor,
        fs: Arc<dyn Filesystem>,
        service_dir: impl Into<Utf8PathBuf>,
        saved_suffix: &str,
    ) -> Self {
        let service_dir: Utf8PathBuf = service_dir.into();
        let trimmed = service_dir.as_str().trim_end_matches('/');
        let service_dir = Utf8PathBuf::from(trimmed);
        let saved_dir = Utf8PathBuf::from(format!("{trimmed}.{saved_suffix}"));
        Self {
            log: log.new(slog::o!(
                "component" => "VolumeSwitcher",
                "service_dir" => service_dir.to_string(),
            )),
            executor,
            fs,
            service_dir,
            saved_dir,
            owner: None,
            services: vec![],
        }
    }

    /// Hands the live tree to `owner` after every switch.
    pub fn with_owner(mut self, owner: Owner) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Services stopped while the directory is switched.
    pub fn with_services(mut self, services: Vec<String>) -> Self {
        self.services = services;
        self
    }

    fn entry(&self, path: &Utf8Path) -> Result<Option<EntryKind>, VolumeError> {
        self.fs
            .entry(path)
            .map_err(|err| VolumeError::Inspect { path: path.to_owned(), err })
    }

    fn is_mounted(&self, path: &Utf8Path) -> Result<bool, VolumeError> {
        self.fs
            .is_mounted(path)
            .map_err(|err| VolumeError::Inspect { path: path.to_owned(), err })
    }

    /// Reads the current state of the service directory.
    pub fn state(&self) -> Result<ServiceDirectoryState, VolumeError> {
        match self.entry(&self.service_dir)? {
            None => Ok(ServiceDirectoryState::Missing),
            Some(EntryKind::Directory) => Ok(ServiceDirectoryState::PlainDirectory),
            Some(EntryKind::Symlink(target)) => {
                Ok(ServiceDirectoryState::SymlinkToExternal(target))
            }
            Some(EntryKind::File) => Err(VolumeError::UnexpectedEntry {
                path: self.service_dir.clone(),
                kind: "file",
            }),
        }
    }

    /// Returns true if the service directory is a symlink to a mounted path.
    pub fn storage_is_persistent(&self) -> Result<bool, VolumeError> {
        match self.state()? {
            ServiceDirectoryState::SymlinkToExternal(target) => {
                self.is_mounted(&target)
            }
            _ => Ok(false),
        }
    }

    /// Mounts `device` at `mountpoint` unless something is mounted there
    /// already, creating the mount point if needed.
    pub fn ensure_mounted(
        &self,
        device: &Utf8Path,
        mountpoint: &Utf8Path,
        fstype: &str,
    ) -> Result<(), VolumeError> {
        if self.is_mounted(mountpoint)? {
            info!(self.log, "Already mounted"; "mountpoint" => %mountpoint);
            return Ok(());
        }
        match self.entry(mountpoint)? {
            None => self
                .fs
                .create_dir(mountpoint)
                .map_err(transition_err("create", mountpoint))?,
            Some(EntryKind::Directory) => (),
            Some(_) => {
                return Err(VolumeError::UnexpectedEntry {
                    path: mountpoint.to_owned(),
                    kind: "non-directory mount point",
                })
            }
        }
        info!(
            self.log, "Mounting volume";
            "device" => %device,
            "mountpoint" => %mountpoint,
            "fstype" => fstype,
        );
        Mount::mount(&self.executor, device, mountpoint, fstype)?;
        Ok(())
    }

    /// Stops the dependent services ahead of a switch.
    pub fn before_change(&self) -> Result<(), VolumeError> {
        for service in &self.services {
            info!(self.log, "Stopping service"; "service" => service);
            Service::stop(&self.executor, service)?;
        }
        Ok(())
    }

    /// Confirms the service directory now matches `decision`.
    pub fn after_change(&self, decision: &VolumeDecision) -> Result<(), VolumeError> {
        let found = self.state()?;
        if !found.satisfies(decision) {
            return Err(VolumeError::Unresolved {
                expected: decision.clone(),
                found,
            });
        }
        Ok(())
    }

    /// Brings the service directory in line with `decision`.
    ///
    /// Dependent services are stopped only if something has to change. If
    /// any step after stopping them fails, they are left stopped.
    pub fn apply(&self, decision: &VolumeDecision) -> Result<Transition, VolumeError> {
        if let VolumeDecision::External(mountpoint) = decision {
            self.validate_external(mountpoint)?;
        }

        let current = self.state()?;
        if current.satisfies(decision) {
            info!(
                self.log, "Volume already configured";
                "decision" => %decision,
            );
            return Ok(Transition::Unchanged);
        }
        if matches!(decision, VolumeDecision::External(_))
            && current == ServiceDirectoryState::PlainDirectory
        {
            self.check_preservable()?;
        }

        info!(
            self.log, "Switching volume";
            "from" => %current,
            "to" => %decision,
        );
        self.before_change()?;
        if let Err(err) = self.switch(&current, decision) {
            warn!(
                self.log, "Volume switch failed, services left stopped";
                "services" => self.services.join(","),
                "error" => %err,
            );
            return Err(err);
        }
        for service in &self.services {
            info!(self.log, "Starting service"; "service" => service);
            Service::start(&self.executor, service)?;
        }
        info!(self.log, "Volume switched"; "decision" => %decision);
        Ok(Transition::Switched { from: current })
    }

    fn validate_external(&self, mountpoint: &Utf8Path) -> Result<(), VolumeError> {
        if mountpoint.as_str().is_empty() {
            return Err(VolumeError::Config("mount point is empty".to_string()));
        }
        if !mountpoint.is_absolute() {
            return Err(VolumeError::Config(format!(
                "mount point {mountpoint} is not absolute"
            )));
        }
        if !self.is_mounted(mountpoint)? {
            return Err(VolumeError::Config(format!(
                "nothing is mounted at {mountpoint}"
            )));
        }
        Ok(())
    }

    /// Content of a non-empty service directory can only be moved aside if
    /// nothing occupies the preserved directory's path.
    fn check_preservable(&self) -> Result<(), VolumeError> {
        if !self.is_empty_dir(&self.service_dir)?
            && self.entry(&self.saved_dir)?.is_some()
        {
            return Err(VolumeError::UnexpectedEntry {
                path: self.saved_dir.clone(),
                kind: "existing preserved directory",
            });
        }
        Ok(())
    }

    fn is_empty_dir(&self, path: &Utf8Path) -> Result<bool, VolumeError> {
        self.fs
            .is_empty_dir(path)
            .map_err(|err| VolumeError::Inspect { path: path.to_owned(), err })
    }

    fn switch(
        &self,
        current: &ServiceDirectoryState,
        decision: &VolumeDecision,
    ) -> Result<(), VolumeError> {
        match decision {
            VolumeDecision::Ephemeral => self.to_ephemeral(current)?,
            VolumeDecision::External(mountpoint) => {
                self.to_external(current, mountpoint)?
            }
        }
        self.after_change(decision)?;
        self.fix_ownership(decision)
    }

    fn to_ephemeral(&self, current: &ServiceDirectoryState) -> Result<(), VolumeError> {
        if let ServiceDirectoryState::SymlinkToExternal(target) = current {
            info!(self.log, "Removing link to external storage"; "target" => %target);
            self.fs
                .remove_file(&self.service_dir)
                .map_err(transition_err("remove", &self.service_dir))?;
        }

        match self.entry(&self.saved_dir)? {
            Some(EntryKind::Directory) => {
                info!(self.log, "Restoring preserved directory"; "saved_dir" => %self.saved_dir);
                self.fs
                    .rename(&self.saved_dir, &self.service_dir)
                    .map_err(transition_err("restore", &self.saved_dir))?;
            }
            None => {
                info!(self.log, "Creating empty service directory");
                self.fs
                    .create_dir(&self.service_dir)
                    .map_err(transition_err("create", &self.service_dir))?;
            }
            Some(_) => {
                return Err(VolumeError::UnexpectedEntry {
                    path: self.saved_dir.clone(),
                    kind: "non-directory preserved entry",
                })
            }
        }
        Ok(())
    }

    fn to_external(
        &self,
        current: &ServiceDirectoryState,
        mountpoint: &Utf8Path,
    ) -> Result<(), VolumeError> {
        match current {
            ServiceDirectoryState::Missing => (),
            ServiceDirectoryState::PlainDirectory => {
                if self.is_empty_dir(&self.service_dir)? {
                    self.fs
                        .remove_dir(&self.service_dir)
                        .map_err(transition_err("remove", &self.service_dir))?;
                } else {
                    info!(
                        self.log, "Preserving existing directory";
                        "saved_dir" => %self.saved_dir,
                    );
                    self.fs
                        .rename(&self.service_dir, &self.saved_dir)
                        .map_err(transition_err("preserve", &self.service_dir))?;
                }
            }
            ServiceDirectoryState::SymlinkToExternal(target) => {
                info!(
                    self.log, "Re-pointing link to external storage";
                    "old_target" => %target,
                );
                self.fs
                    .remove_file(&self.service_dir)
                    .map_err(transition_err("remove", &self.service_dir))?;
            }
        }

        self.fs
            .symlink(mountpoint, &self.service_dir)
            .map_err(transition_err("link", &self.service_dir))?;
        Ok(())
    }

    fn fix_ownership(&self, decision: &VolumeDecision) -> Result<(), VolumeError> {
        let Some(owner) = self.owner else {
            return Ok(());
        };

        let chown = |path: &Utf8Path| {
            self.fs.chown(path, owner).map_err(|err| VolumeError::Ownership {
                path: path.to_owned(),
                err,
            })
        };

        let root = match decision {
            VolumeDecision::Ephemeral => self.service_dir.as_path(),
            VolumeDecision::External(mountpoint) => {
                chown(&self.service_dir)?;
                mountpoint.as_path()
            }
        };
        chown(root)?;
        let paths = self.fs.walk(root).map_err(|err| VolumeError::Ownership {
            path: root.to_owned(),
            err,
        })?;
        for path in &paths {
            chown(path)?;
        }
        info!(
            self.log, "Fixed ownership";
            "root" => %root,
            "uid" => owner.uid,
            "entries" => paths.len() + 1,
        );
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fakes::fs::FakeFilesystem;
    use camino_tempfile::Utf8TempDir;
    use ceph_utils::host::{test_log, FakeExecutor, StaticHandler};

    const SERVICE_DIR: &str = "/var/lib/solr";
    const SAVED_DIR: &str = "/var/lib/solr.charm_saved";
    const VOLUME: &str = "/srv/volume";

    fn switcher(fs: &Arc<FakeFilesystem>, handler: StaticHandler) -> VolumeSwitcher {
        let log = test_log();
        let executor = FakeExecutor::new(log.clone());
        handler.register(&executor);
        VolumeSwitcher::new(
            &log,
            executor.as_executor(),
            fs.clone(),
            SERVICE_DIR,
            "charm_saved",
        )
        .with_services(vec!["jetty".to_string()])
    }

    fn restart_jetty(handler: &mut StaticHandler) {
        handler.expect_ok("service jetty stop");
        handler.expect_ok("service jetty start");
    }

    fn external() -> VolumeDecision {
        VolumeDecision::External(VOLUME.into())
    }

    #[test]
    fn test_parse_decision() {
        assert_eq!(
            "ephemeral".parse::<VolumeDecision>().unwrap(),
            VolumeDecision::Ephemeral
        );
        assert_eq!("/srv/volume".parse::<VolumeDecision>().unwrap(), external());
    }

    #[test]
    fn test_round_trip_preserves_content() {
        let fs = Arc::new(FakeFilesystem::new());
        fs.add_file("/var/lib/solr/data/index");
        fs.mount(VOLUME);

        let mut handler = StaticHandler::new();
        restart_jetty(&mut handler);
        restart_jetty(&mut handler);
        let switcher = switcher(&fs, handler);

        let transition = switcher.apply(&external()).unwrap();
        assert_eq!(
            transition,
            Transition::Switched { from: ServiceDirectoryState::PlainDirectory }
        );
        assert_eq!(
            switcher.state().unwrap(),
            ServiceDirectoryState::SymlinkToExternal(VOLUME.into())
        );
        assert!(switcher.storage_is_persistent().unwrap());
        assert_eq!(
            fs.kind("/var/lib/solr.charm_saved/data/index"),
            Some(EntryKind::File)
        );
        assert_eq!(fs.rename_count(), 1);

        switcher.apply(&VolumeDecision::Ephemeral).unwrap();
        assert_eq!(switcher.state().unwrap(), ServiceDirectoryState::PlainDirectory);
        assert!(!switcher.storage_is_persistent().unwrap());
        assert_eq!(fs.kind("/var/lib/solr/data/index"), Some(EntryKind::File));
        assert_eq!(fs.kind(SAVED_DIR), None);
        assert_eq!(fs.rename_count(), 2);
    }

    #[test]
    fn test_applying_same_decision_is_a_no_op() {
        let fs = Arc::new(FakeFilesystem::new());
        fs.mount(VOLUME);
        fs.add_symlink(SERVICE_DIR, VOLUME);

        // No commands expected: the services must not be stopped.
        let switcher = switcher(&fs, StaticHandler::new());
        assert_eq!(switcher.apply(&external()).unwrap(), Transition::Unchanged);

        fs.remove(SERVICE_DIR);
        fs.add_dir(SERVICE_DIR);
        assert_eq!(
            switcher.apply(&VolumeDecision::Ephemeral).unwrap(),
            Transition::Unchanged
        );
        assert_eq!(fs.rename_count(), 0);
    }

    #[test]
    fn test_external_twice_preserves_once() {
        let fs = Arc::new(FakeFilesystem::new());
        fs.add_file("/var/lib/solr/data/index");
        fs.mount(VOLUME);

        let mut handler = StaticHandler::new();
        restart_jetty(&mut handler);
        let switcher = switcher(&fs, handler);

        assert_eq!(
            switcher.apply(&external()).unwrap(),
            Transition::Switched { from: ServiceDirectoryState::PlainDirectory }
        );
        assert_eq!(switcher.apply(&external()).unwrap(), Transition::Unchanged);
        assert_eq!(fs.rename_count(), 1);
        assert_eq!(
            fs.kind("/var/lib/solr.charm_saved/data/index"),
            Some(EntryKind::File)
        );
    }

    #[test]
    fn test_empty_directory_is_not_preserved() {
        let fs = Arc::new(FakeFilesystem::new());
        fs.add_dir(SERVICE_DIR);
        fs.mount(VOLUME);

        let mut handler = StaticHandler::new();
        restart_jetty(&mut handler);
        let switcher = switcher(&fs, handler);

        switcher.apply(&external()).unwrap();
        assert_eq!(fs.rename_count(), 0);
        assert_eq!(fs.kind(SAVED_DIR), None);
    }

    #[test]
    fn test_symlink_is_repointed_without_rename() {
        let fs = Arc::new(FakeFilesystem::new());
        fs.mount("/srv/old");
        fs.mount(VOLUME);
        fs.add_symlink(SERVICE_DIR, "/srv/old");
        fs.add_file("/var/lib/solr.charm_saved/keep");

        let mut handler = StaticHandler::new();
        restart_jetty(&mut handler);
        let switcher = switcher(&fs, handler);

        switcher.apply(&external()).unwrap();
        assert_eq!(fs.kind(SERVICE_DIR), Some(EntryKind::Symlink(VOLUME.into())));
        assert_eq!(fs.kind("/var/lib/solr.charm_saved/keep"), Some(EntryKind::File));
        assert_eq!(fs.rename_count(), 0);
    }

    #[test]
    fn test_missing_directory_is_created_for_ephemeral() {
        let fs = Arc::new(FakeFilesystem::new());
        let mut handler = StaticHandler::new();
        restart_jetty(&mut handler);
        let switcher = switcher(&fs, handler);

        switcher.apply(&VolumeDecision::Ephemeral).unwrap();
        assert_eq!(fs.kind(SERVICE_DIR), Some(EntryKind::Directory));
    }

    #[test]
    fn test_unusable_mount_point_fails_before_stopping_services() {
        let fs = Arc::new(FakeFilesystem::new());
        fs.add_file("/var/lib/solr/data");
        fs.add_dir(VOLUME);
        let switcher = switcher(&fs, StaticHandler::new());

        for decision in [
            external(),
            VolumeDecision::External("srv/volume".into()),
            VolumeDecision::External("".into()),
        ] {
            let err = switcher.apply(&decision).unwrap_err();
            assert!(matches!(err, VolumeError::Config(_)), "{err}");
        }
        assert_eq!(switcher.state().unwrap(), ServiceDirectoryState::PlainDirectory);
    }

    #[test]
    fn test_failed_switch_leaves_services_stopped() {
        let fs = Arc::new(FakeFilesystem::new());
        fs.add_file("/var/lib/solr/data");
        fs.mount(VOLUME);
        fs.fail_renames();

        let mut handler = StaticHandler::new();
        handler.expect_ok("service jetty stop");
        let switcher = switcher(&fs, handler);

        let err = switcher.apply(&external()).unwrap_err();
        assert!(
            matches!(err, VolumeError::Transition { action: "preserve", .. }),
            "{err}"
        );
        assert_eq!(fs.kind("/var/lib/solr/data"), Some(EntryKind::File));
    }

    #[test]
    fn test_existing_preserved_directory_is_not_clobbered() {
        let fs = Arc::new(FakeFilesystem::new());
        fs.add_file("/var/lib/solr/new");
        fs.add_file("/var/lib/solr.charm_saved/old");
        fs.mount(VOLUME);

        // Refused before the services are stopped.
        let switcher = switcher(&fs, StaticHandler::new());

        let err = switcher.apply(&external()).unwrap_err();
        assert!(matches!(err, VolumeError::UnexpectedEntry { .. }), "{err}");
        assert_eq!(fs.kind("/var/lib/solr.charm_saved/old"), Some(EntryKind::File));
        assert_eq!(fs.rename_count(), 0);
    }

    #[test]
    fn test_ownership_is_fixed_on_external_tree() {
        let fs = Arc::new(FakeFilesystem::new());
        fs.add_dir(SERVICE_DIR);
        fs.mount(VOLUME);
        fs.add_file("/srv/volume/cores/core0/index");
        fs.add_file("/srv/unrelated");

        let owner = Owner { uid: 107, gid: None };
        let mut handler = StaticHandler::new();
        restart_jetty(&mut handler);
        let switcher = switcher(&fs, handler).with_owner(owner);

        switcher.apply(&external()).unwrap();
        for path in [
            SERVICE_DIR,
            VOLUME,
            "/srv/volume/cores",
            "/srv/volume/cores/core0",
            "/srv/volume/cores/core0/index",
        ] {
            assert_eq!(fs.owner(path), Some(owner), "{path}");
        }
        assert_eq!(fs.owner("/srv/unrelated"), None);
    }

    #[test]
    fn test_ensure_mounted() {
        let fs = Arc::new(FakeFilesystem::new());
        let mut handler = StaticHandler::new();
        handler.expect_ok("mount -t ext4 /dev/rbd/mysql/mysql1 /srv/volume");
        let switcher = switcher(&fs, handler);

        let device = Utf8Path::new("/dev/rbd/mysql/mysql1");
        switcher.ensure_mounted(device, Utf8Path::new(VOLUME), "ext4").unwrap();
        assert_eq!(fs.kind(VOLUME), Some(EntryKind::Directory));

        // Already mounted: no further commands.
        fs.mount(VOLUME);
        switcher.ensure_mounted(device, Utf8Path::new(VOLUME), "ext4").unwrap();
    }

    #[test]
    fn test_host_filesystem() {
        let dir = Utf8TempDir::new().unwrap();
        let mounts = dir.path().join("mounts");
        let volume = dir.path().join("volume");
        std::fs::write(&mounts, format!("/dev/rbd0 {volume} ext4 rw 0 0\n"))
            .unwrap();

        let fs = HostFilesystem::new(mounts);
        fs.create_dir(&volume.join("a/b")).unwrap();
        std::fs::write(volume.join("a/b/file"), "x").unwrap();
        let link = dir.path().join("link");
        fs.symlink(&volume, &link).unwrap();

        assert_eq!(fs.entry(&link).unwrap(), Some(EntryKind::Symlink(volume.clone())));
        assert_eq!(fs.entry(&volume).unwrap(), Some(EntryKind::Directory));
        assert_eq!(fs.entry(&dir.path().join("nope")).unwrap(), None);
        assert!(fs.is_mounted(&volume).unwrap());
        assert!(!fs.is_mounted(&link).unwrap());
        assert!(!fs.is_empty_dir(&volume).unwrap());

        let mut walked = fs.walk(&volume).unwrap();
        walked.sort();
        assert_eq!(
            walked,
            vec![volume.join("a"), volume.join("a/b"), volume.join("a/b/file")]
        );

        let owner = Owner { uid: uzers::get_current_uid(), gid: None };
        fs.chown(&link, owner).unwrap();
        fs.remove_file(&link).unwrap();
        assert_eq!(fs.entry(&link).unwrap(), None);
    }
}
