// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Utilities for managing RBD images and their kernel mappings.

use crate::{BoxedExecutor, ExecutionError, ParseError, RBD};
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::process::Command;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("RBD execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Error returned by [`Rbd::list_images`].
#[derive(thiserror::Error, Debug)]
#[error("Could not list images in pool {pool}: {err}")]
pub struct ListImagesError {
    pool: String,
    #[source]
    err: Error,
}

/// Error returned by [`Rbd::create_image`].
#[derive(thiserror::Error, Debug)]
#[error("Failed to create image '{pool}/{image}' of {size_mb} MiB: {err}")]
pub struct CreateImageError {
    pool: String,
    image: String,
    size_mb: u64,
    #[source]
    err: ExecutionError,
}

/// Error returned by [`Rbd::list_mapped`].
#[derive(thiserror::Error, Debug)]
#[error("Could not list mapped images: {err}")]
pub struct ListMappedError {
    #[from]
    err: Error,
}

/// Error returned by [`Rbd::map`].
#[derive(thiserror::Error, Debug)]
#[error("Failed to map image '{pool}/{image}' as client {service}: {err}")]
pub struct MapError {
    pool: String,
    image: String,
    service: String,
    #[source]
    err: ExecutionError,
}

/// An image exposed as a local block device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MappedImage {
    pub pool: String,
    pub image: String,
    pub device: Utf8PathBuf,
}

#[derive(Deserialize)]
struct ShowMappedEntry {
    pool: String,
    name: String,
    device: Utf8PathBuf,
}

// Releases before Nautilus key the mappings by id; later ones emit a list.
#[derive(Deserialize)]
#[serde(untagged)]
enum ShowMapped {
    List(Vec<ShowMappedEntry>),
    ById(BTreeMap<String, ShowMappedEntry>),
}

fn parse_showmapped(stdout: &[u8]) -> Result<Vec<MappedImage>, ParseError> {
    if stdout.iter().all(u8::is_ascii_whitespace) {
        return Ok(vec![]);
    }
    let parsed: ShowMapped = serde_json::from_slice(stdout)
        .map_err(|err| ParseError(format!("showmapped output: {err}")))?;
    let entries = match parsed {
        ShowMapped::List(entries) => entries,
        ShowMapped::ById(entries) => entries.into_values().collect(),
    };
    Ok(entries
        .into_iter()
        .map(|e| MappedImage { pool: e.pool, image: e.name, device: e.device })
        .collect())
}

/// Wraps commands for interacting with RBD images.
pub struct Rbd {}

impl Rbd {
    /// Lists the images within `pool`.
    pub fn list_images(
        executor: &BoxedExecutor,
        service: &str,
        pool: &str,
    ) -> Result<Vec<String>, ListImagesError> {
        let err = |err| ListImagesError { pool: pool.to_string(), err };

        let mut command = Command::new(RBD);
        let cmd =
            command.args(["list", "--id", service, "--pool", pool, "--format=json"]);
        let output =
            executor.execute(cmd).map_err(|e| err(Error::Execution(e)))?;

        // Some releases print nothing at all for an empty pool.
        if output.stdout.iter().all(u8::is_ascii_whitespace) {
            return Ok(vec![]);
        }
        serde_json::from_slice(&output.stdout).map_err(|e| {
            err(Error::Parse(ParseError(format!("rbd list output: {e}"))))
        })
    }

    pub fn image_exists(
        executor: &BoxedExecutor,
        service: &str,
        pool: &str,
        image: &str,
    ) -> Result<bool, ListImagesError> {
        Ok(Self::list_images(executor, service, pool)?
            .iter()
            .any(|i| i == image))
    }

    /// Creates an image of `size_mb` megabytes within `pool`.
    pub fn create_image(
        executor: &BoxedExecutor,
        service: &str,
        pool: &str,
        image: &str,
        size_mb: u64,
    ) -> Result<(), CreateImageError> {
        let mut command = Command::new(RBD);
        let cmd = command.args([
            "create",
            image,
            "--size",
            &size_mb.to_string(),
            "--id",
            service,
            "--pool",
            pool,
        ]);
        executor.execute(cmd).map_err(|err| CreateImageError {
            pool: pool.to_string(),
            image: image.to_string(),
            size_mb,
            err,
        })?;
        Ok(())
    }

    /// Lists the images currently mapped by the kernel.
    pub fn list_mapped(
        executor: &BoxedExecutor,
    ) -> Result<Vec<MappedImage>, ListMappedError> {
        let mut command = Command::new(RBD);
        let cmd = command.args(["showmapped", "--format=json"]);
        let output = executor.execute(cmd).map_err(Error::from)?;
        Ok(parse_showmapped(&output.stdout).map_err(Error::from)?)
    }

    /// Returns the mapping of `pool/image`, if there is one.
    pub fn find_mapping(
        executor: &BoxedExecutor,
        pool: &str,
        image: &str,
    ) -> Result<Option<MappedImage>, ListMappedError> {
        Ok(Self::list_mapped(executor)?
            .into_iter()
            .find(|m| m.pool == pool && m.image == image))
    }

    /// Maps `pool/image` to a local block device, authenticating as
    /// `service` with the secret stored in `keyfile`.
    pub fn map(
        executor: &BoxedExecutor,
        service: &str,
        pool: &str,
        image: &str,
        keyfile: &Utf8Path,
    ) -> Result<(), MapError> {
        let mut command = Command::new(RBD);
        let cmd = command.args([
            "map",
            &format!("{pool}/{image}"),
            "--user",
            service,
            "--secret",
            keyfile.as_str(),
        ]);
        executor.execute(cmd).map_err(|err| MapError {
            pool: pool.to_string(),
            image: image.to_string(),
            service: service.to_string(),
            err,
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::host::{test_log, FakeExecutor, StaticHandler};

    #[test]
    fn test_parse_showmapped_list_form() {
        let json = r#"[{"id":"0","pool":"mysql","namespace":"","name":"mysql1","snap":"-","device":"/dev/rbd0"}]"#;
        let mapped = parse_showmapped(json.as_bytes()).unwrap();
        assert_eq!(
            mapped,
            vec![MappedImage {
                pool: "mysql".to_string(),
                image: "mysql1".to_string(),
                device: "/dev/rbd0".into(),
            }]
        );
    }

    #[test]
    fn test_parse_showmapped_keyed_form() {
        let json = r#"{"0":{"pool":"rbd","name":"other","snap":"-","device":"/dev/rbd0"},"1":{"pool":"mysql","name":"mysql1","snap":"-","device":"/dev/rbd1"}}"#;
        let mapped = parse_showmapped(json.as_bytes()).unwrap();
        assert_eq!(mapped.len(), 2);
        assert_eq!(mapped[1].device, Utf8PathBuf::from("/dev/rbd1"));
    }

    #[test]
    fn test_parse_showmapped_empty() {
        assert!(parse_showmapped(b"").unwrap().is_empty());
        assert!(parse_showmapped(b"[]\n").unwrap().is_empty());
        assert!(parse_showmapped(b"{}").unwrap().is_empty());
        assert!(parse_showmapped(b"rbd0 mysql").is_err());
    }

    #[test]
    fn test_find_mapping_requires_matching_pool() {
        let executor = FakeExecutor::new(test_log());
        let mut handler = StaticHandler::new();
        handler.expect_stdout(
            "rbd showmapped --format=json",
            r#"[{"id":"0","pool":"rbd","name":"mysql1","snap":"-","device":"/dev/rbd0"}]"#,
        );
        handler.register(&executor);

        let mapping =
            Rbd::find_mapping(&executor.as_executor(), "mysql", "mysql1")
                .unwrap();
        assert!(mapping.is_none());
    }

    #[test]
    fn test_image_exists() {
        let executor = FakeExecutor::new(test_log());
        let mut handler = StaticHandler::new();
        handler.expect_stdout(
            "rbd list --id mysql --pool mysql --format=json",
            "",
        );
        handler.expect_stdout(
            "rbd list --id mysql --pool mysql --format=json",
            r#"["mysql10","mysql1"]"#,
        );
        handler.register(&executor);
        let executor = executor.as_executor();

        assert!(!Rbd::image_exists(&executor, "mysql", "mysql", "mysql1")
            .unwrap());
        assert!(Rbd::image_exists(&executor, "mysql", "mysql", "mysql1")
            .unwrap());
    }

    #[test]
    fn test_map_passes_credentials() {
        let executor = FakeExecutor::new(test_log());
        let mut handler = StaticHandler::new();
        handler.expect_ok(
            "rbd map mysql/mysql1 --user mysql --secret /etc/ceph/ceph.client.mysql.key",
        );
        handler.register(&executor);

        Rbd::map(
            &executor.as_executor(),
            "mysql",
            "mysql",
            "mysql1",
            Utf8Path::new("/etc/ceph/ceph.client.mysql.key"),
        )
        .unwrap();
    }
}
