// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Converging Ceph-backed block storage into existence.
//!
//! [StorageProvisioner::ensure_storage] walks four stages in dependency
//! order: pool, image, kernel mapping, filesystem. Each stage first asks
//! the live system whether its postcondition already holds and only acts if
//! it does not, so the whole call can be repeated after any failure.
//!
//! The provisioner formats the device but never mounts it; mounting belongs
//! to [crate::volume::VolumeSwitcher::ensure_mounted].

use crate::identity::StorageIdentity;
use camino::{Utf8Path, Utf8PathBuf};
use ceph_utils::blkid::{Blkid, ProbeError};
use ceph_utils::mkfs::{MakeFilesystemError, Mkfs};
use ceph_utils::mount::{MountTable, ReadMountsError};
use ceph_utils::rados::{CreatePoolError, ListPoolsError, Rados};
use ceph_utils::rbd::{
    CreateImageError, ListImagesError, ListMappedError, MapError, Rbd,
};
use ceph_utils::BoxedExecutor;
use slog::{info, warn, Logger};
use std::fmt;

/// What the provisioned storage should look like.
///
/// Re-supplied on every run; never persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvisioningTarget {
    pub size_mb: u64,
    pub fstype: String,
    /// Path of the block device once the image is mapped.
    pub device: Utf8PathBuf,
    pub mount_point: Utf8PathBuf,
    pub replicas: u32,
}

/// Error returned by [ProvisioningTarget::validate].
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum InvalidTargetError {
    #[error("{0} name is empty")]
    EmptyName(&'static str),

    #[error("image size must be greater than zero")]
    ZeroSize,

    #[error("replica count must be at least one")]
    NoReplicas,

    #[error("invalid filesystem type '{0}'")]
    FilesystemType(String),

    #[error("{what} '{path}' is not an absolute path")]
    RelativePath { what: &'static str, path: Utf8PathBuf },
}

impl ProvisioningTarget {
    /// Checks the target before anything on the host is touched.
    pub fn validate(
        &self,
        identity: &StorageIdentity,
    ) -> Result<(), InvalidTargetError> {
        if identity.service.is_empty() {
            return Err(InvalidTargetError::EmptyName("service"));
        }
        if identity.pool.is_empty() {
            return Err(InvalidTargetError::EmptyName("pool"));
        }
        if identity.image.is_empty() {
            return Err(InvalidTargetError::EmptyName("image"));
        }
        if self.size_mb == 0 {
            return Err(InvalidTargetError::ZeroSize);
        }
        if self.replicas == 0 {
            return Err(InvalidTargetError::NoReplicas);
        }
        if self.fstype.is_empty()
            || !self.fstype.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(InvalidTargetError::FilesystemType(self.fstype.clone()));
        }
        for (what, path) in
            [("block device", &self.device), ("mount point", &self.mount_point)]
        {
            if !path.is_absolute() {
                return Err(InvalidTargetError::RelativePath {
                    what,
                    path: path.clone(),
                });
            }
        }
        Ok(())
    }
}

/// The provisioning stages, in the order they run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Validate,
    Pool,
    Image,
    Map,
    Format,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Validate => "validate",
            Stage::Pool => "pool",
            Stage::Image => "image",
            Stage::Map => "map",
            Stage::Format => "format",
        };
        write!(f, "{name}")
    }
}

#[derive(thiserror::Error, Debug)]
pub enum StageError {
    #[error("Invalid target: {0}")]
    InvalidTarget(#[from] InvalidTargetError),

    #[error(transparent)]
    ListPools(#[from] ListPoolsError),

    #[error(transparent)]
    CreatePool(#[from] CreatePoolError),

    #[error(transparent)]
    ListImages(#[from] ListImagesError),

    #[error(transparent)]
    CreateImage(#[from] CreateImageError),

    #[error(transparent)]
    ListMapped(#[from] ListMappedError),

    #[error(transparent)]
    Map(#[from] MapError),

    #[error(transparent)]
    ReadMounts(#[from] ReadMountsError),

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    MakeFilesystem(#[from] MakeFilesystemError),
}

/// Error returned by [StorageProvisioner::ensure_storage].
#[derive(thiserror::Error, Debug)]
#[error("Failed to ensure storage {identity} at the {stage} stage: {err}")]
pub struct EnsureStorageError {
    identity: String,
    pub stage: Stage,
    #[source]
    pub err: StageError,
}

/// The existence checks the provisioner consults before each stage.
///
/// Answers always come from the live system; nothing is cached between
/// calls.
pub trait StorageState {
    fn pool_exists(&self, identity: &StorageIdentity) -> Result<bool, StageError>;
    fn image_exists(&self, identity: &StorageIdentity) -> Result<bool, StageError>;
    fn is_mapped(&self, identity: &StorageIdentity) -> Result<bool, StageError>;
    fn is_mounted(&self, path: &Utf8Path) -> Result<bool, StageError>;
    /// The filesystem type on `device`, if it has one.
    fn filesystem_type(&self, device: &Utf8Path) -> Result<Option<String>, StageError>;
}

/// Answers [StorageState] queries from the cluster, the kernel's RBD
/// mappings, and the mount table.
pub struct HostStorageState {
    executor: BoxedExecutor,
    mounts: Utf8PathBuf,
}

impl HostStorageState {
    /// `mounts` is a file in `/proc/mounts` format, normally
    /// [ceph_utils::mount::PROC_MOUNTS].
    pub fn new(executor: BoxedExecutor, mounts: impl Into<Utf8PathBuf>) -> Self {
        Self { executor, mounts: mounts.into() }
    }
}

impl StorageState for HostStorageState {
    fn pool_exists(&self, identity: &StorageIdentity) -> Result<bool, StageError> {
        Ok(Rados::pool_exists(&self.executor, &identity.service, &identity.pool)?)
    }

    fn image_exists(&self, identity: &StorageIdentity) -> Result<bool, StageError> {
        Ok(Rbd::image_exists(
            &self.executor,
            &identity.service,
            &identity.pool,
            &identity.image,
        )?)
    }

    fn is_mapped(&self, identity: &StorageIdentity) -> Result<bool, StageError> {
        Ok(Rbd::find_mapping(&self.executor, &identity.pool, &identity.image)?
            .is_some())
    }

    fn is_mounted(&self, path: &Utf8Path) -> Result<bool, StageError> {
        Ok(MountTable::read(&self.mounts)?.is_mounted(path))
    }

    fn filesystem_type(&self, device: &Utf8Path) -> Result<Option<String>, StageError> {
        Ok(Blkid::filesystem_type(&self.executor, device)?)
    }
}

/// Creates whatever part of a unit's block storage is missing.
pub struct StorageProvisioner {
    log: Logger,
    executor: BoxedExecutor,
    state: Box<dyn StorageState>,
    keyfile: Utf8PathBuf,
}

impl StorageProvisioner {
    /// `keyfile` holds the secret used to map images; it must already exist
    /// (see [ceph_utils::keyring::CephClient::configure]).
    pub fn new(
        log: &Logger,
        executor: BoxedExecutor,
        state: Box<dyn StorageState>,
        keyfile: impl Into<Utf8PathBuf>,
    ) -> Self {
        Self {
            log: log.new(slog::o!("component" => "StorageProvisioner")),
            executor,
            state,
            keyfile: keyfile.into(),
        }
    }

    /// Ensures the pool, image, mapping and filesystem described by
    /// `identity` and `target` all exist.
    ///
    /// `system_services` depend on this storage. They are not stopped while
    /// provisioning runs.
    ///
    /// Nothing is rolled back on failure: the returned error names the stage
    /// that failed, and a later call resumes from there.
    pub fn ensure_storage(
        &self,
        identity: &StorageIdentity,
        target: &ProvisioningTarget,
        system_services: &[String],
    ) -> Result<(), EnsureStorageError> {
        let fail = |stage, err| EnsureStorageError {
            identity: identity.to_string(),
            stage,
            err,
        };

        target
            .validate(identity)
            .map_err(|e| fail(Stage::Validate, StageError::from(e)))?;

        info!(
            self.log, "ceph: Ensuring storage";
            "pool" => &identity.pool,
            "image" => &identity.image,
            "size_mb" => target.size_mb,
            "device" => %target.device,
            "dependent_services" => system_services.join(","),
        );

        self.ensure_pool(identity, target).map_err(|e| fail(Stage::Pool, e))?;
        self.ensure_image(identity, target).map_err(|e| fail(Stage::Image, e))?;
        self.ensure_mapped(identity).map_err(|e| fail(Stage::Map, e))?;
        self.ensure_formatted(target).map_err(|e| fail(Stage::Format, e))?;

        info!(self.log, "ceph: Storage is ready"; "device" => %target.device);
        Ok(())
    }

    fn ensure_pool(
        &self,
        identity: &StorageIdentity,
        target: &ProvisioningTarget,
    ) -> Result<(), StageError> {
        if self.state.pool_exists(identity)? {
            info!(self.log, "ceph: Pool exists"; "pool" => &identity.pool);
            return Ok(());
        }
        info!(self.log, "ceph: Creating new pool"; "pool" => &identity.pool);
        let pgs = Rados::create_pool(
            &self.executor,
            &identity.service,
            &identity.pool,
            target.replicas,
        )?;
        info!(
            self.log, "ceph: Created pool";
            "pool" => &identity.pool,
            "placement_groups" => pgs,
            "replicas" => target.replicas,
        );
        Ok(())
    }

    fn ensure_image(
        &self,
        identity: &StorageIdentity,
        target: &ProvisioningTarget,
    ) -> Result<(), StageError> {
        // An existing image is kept whatever its size.
        if self.state.image_exists(identity)? {
            info!(self.log, "ceph: RBD image exists"; "image" => &identity.image);
            return Ok(());
        }
        info!(
            self.log, "ceph: Creating RBD image";
            "image" => &identity.image,
            "size_mb" => target.size_mb,
        );
        Rbd::create_image(
            &self.executor,
            &identity.service,
            &identity.pool,
            &identity.image,
            target.size_mb,
        )?;
        Ok(())
    }

    fn ensure_mapped(&self, identity: &StorageIdentity) -> Result<(), StageError> {
        if self.state.is_mapped(identity)? {
            info!(self.log, "ceph: RBD image is mapped"; "image" => &identity.image);
            return Ok(());
        }
        info!(self.log, "ceph: Mapping RBD image as a block device"; "image" => &identity.image);
        Rbd::map(
            &self.executor,
            &identity.service,
            &identity.pool,
            &identity.image,
            &self.keyfile,
        )?;
        Ok(())
    }

    fn ensure_formatted(&self, target: &ProvisioningTarget) -> Result<(), StageError> {
        if self.state.is_mounted(&target.mount_point)? {
            info!(
                self.log, "ceph: Mount point is in use, not formatting";
                "mount_point" => %target.mount_point,
            );
            return Ok(());
        }
        if let Some(fstype) = self.state.filesystem_type(&target.device)? {
            if fstype != target.fstype {
                warn!(
                    self.log, "ceph: Device holds a different filesystem, leaving it";
                    "device" => %target.device,
                    "found" => &fstype,
                    "wanted" => &target.fstype,
                );
            } else {
                info!(
                    self.log, "ceph: Device is already formatted";
                    "device" => %target.device,
                    "fstype" => &fstype,
                );
            }
            return Ok(());
        }
        info!(
            self.log, "ceph: Formatting block device";
            "device" => %target.device,
            "fstype" => &target.fstype,
        );
        Mkfs::make_filesystem(&self.executor, &target.device, &target.fstype)?;
        Ok(())
    }
}
