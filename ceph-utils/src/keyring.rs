// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Provisioning Ceph client credentials and configuration.
//!
//! Mapping an image needs a keyring, a bare key file, and a `ceph.conf`
//! naming the monitors. These are written before any storage is touched.

use crate::{BoxedExecutor, ExecutionError, CEPH_AUTHTOOL, CEPH_CONF_DIR};
use camino::Utf8PathBuf;
use slog::{info, Logger};
use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::os::unix::fs::OpenOptionsExt;
use std::process::Command;

/// Error returned by [`CephClient::create_keyring`].
#[derive(thiserror::Error, Debug)]
#[error("Failed to create keyring {path} for client {service}: {err}")]
pub struct CreateKeyringError {
    path: Utf8PathBuf,
    service: String,
    #[source]
    err: ExecutionError,
}

/// Error returned when a credential or configuration file cannot be written.
#[derive(thiserror::Error, Debug)]
#[error("Failed to write {path}: {err}")]
pub struct WriteFileError {
    path: Utf8PathBuf,
    #[source]
    err: std::io::Error,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigureError {
    #[error("No monitor hosts given for client {0}")]
    NoMonitors(String),

    #[error(transparent)]
    Keyring(#[from] CreateKeyringError),

    #[error(transparent)]
    Write(#[from] WriteFileError),
}

/// Contents of the cluster configuration file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CephConf {
    /// Authentication scheme, e.g. "cephx" or "none".
    pub auth: String,
    pub keyring: Utf8PathBuf,
    pub mon_hosts: Vec<String>,
    pub use_syslog: bool,
}

impl CephConf {
    pub fn render(&self) -> String {
        let mut out = String::from("[global]\n");
        let syslog = self.use_syslog;
        // Writing to a String cannot fail.
        let _ = write!(
            out,
            " auth supported = {auth}\n \
             keyring = {keyring}\n \
             mon host = {mon_hosts}\n \
             log to syslog = {syslog}\n \
             err to syslog = {syslog}\n \
             clog to syslog = {syslog}\n",
            auth = self.auth,
            keyring = self.keyring,
            mon_hosts = self.mon_hosts.join(","),
        );
        out
    }
}

/// The credentials of a single Ceph client, stored under one directory.
#[derive(Clone, Debug)]
pub struct CephClient {
    dir: Utf8PathBuf,
    service: String,
}

impl CephClient {
    /// A client whose files live in the standard [CEPH_CONF_DIR].
    pub fn new(service: impl Into<String>) -> Self {
        Self::with_dir(CEPH_CONF_DIR, service)
    }

    pub fn with_dir(dir: impl Into<Utf8PathBuf>, service: impl Into<String>) -> Self {
        Self { dir: dir.into(), service: service.into() }
    }

    pub fn keyring_path(&self) -> Utf8PathBuf {
        self.dir.join(format!("ceph.client.{}.keyring", self.service))
    }

    pub fn keyfile_path(&self) -> Utf8PathBuf {
        self.dir.join(format!("ceph.client.{}.key", self.service))
    }

    pub fn conf_path(&self) -> Utf8PathBuf {
        self.dir.join("ceph.conf")
    }

    /// Writes the keyring, key file and `ceph.conf` for this client.
    pub fn configure(
        &self,
        log: &Logger,
        executor: &BoxedExecutor,
        key: &str,
        auth: &str,
        mon_hosts: &[String],
        use_syslog: bool,
    ) -> Result<(), ConfigureError> {
        if mon_hosts.is_empty() {
            return Err(ConfigureError::NoMonitors(self.service.clone()));
        }
        self.create_keyring(log, executor, key)?;
        self.create_key_file(log, key)?;

        let conf = CephConf {
            auth: auth.to_string(),
            keyring: self.keyring_path(),
            mon_hosts: mon_hosts.to_vec(),
            use_syslog,
        };
        let path = self.conf_path();
        std::fs::write(&path, conf.render())
            .map_err(|err| WriteFileError { path: path.clone(), err })?;
        info!(
            log, "ceph: Wrote client configuration";
            "path" => %path,
            "mon_hosts" => conf.mon_hosts.join(","),
        );
        Ok(())
    }

    /// Creates (or recreates) the keyring holding `key`.
    pub fn create_keyring(
        &self,
        log: &Logger,
        executor: &BoxedExecutor,
        key: &str,
    ) -> Result<(), CreateKeyringError> {
        let path = self.keyring_path();
        if path.exists() {
            info!(log, "ceph: Keyring exists, replacing it"; "path" => %path);
        }
        let mut command = Command::new(CEPH_AUTHTOOL);
        let cmd = command.args([
            path.as_str(),
            "--create-keyring",
            &format!("--name=client.{}", self.service),
            &format!("--add-key={key}"),
        ]);
        executor.execute(cmd).map_err(|err| CreateKeyringError {
            path: path.clone(),
            service: self.service.clone(),
            err,
        })?;
        info!(log, "ceph: Created new keyring"; "path" => %path);
        Ok(())
    }

    /// Writes the bare secret used by `rbd map --secret`, readable only by
    /// its owner.
    pub fn create_key_file(
        &self,
        log: &Logger,
        key: &str,
    ) -> Result<(), WriteFileError> {
        let path = self.keyfile_path();
        if path.exists() {
            info!(log, "ceph: Keyfile exists, replacing it"; "path" => %path);
        }
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)
            .and_then(|mut file| file.write_all(key.as_bytes()))
            .map_err(|err| WriteFileError { path: path.clone(), err })?;
        info!(log, "ceph: Created new keyfile"; "path" => %path);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::host::{test_log, FakeExecutor, StaticHandler};
    use camino_tempfile::Utf8TempDir;

    #[test]
    fn test_render_conf() {
        let conf = CephConf {
            auth: "cephx".to_string(),
            keyring: "/etc/ceph/ceph.client.mysql.keyring".into(),
            mon_hosts: vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()],
            use_syslog: false,
        };
        assert_eq!(
            conf.render(),
            "[global]\n \
             auth supported = cephx\n \
             keyring = /etc/ceph/ceph.client.mysql.keyring\n \
             mon host = 10.0.0.1,10.0.0.2\n \
             log to syslog = false\n \
             err to syslog = false\n \
             clog to syslog = false\n"
        );
    }

    #[test]
    fn test_configure_writes_all_files() {
        let log = test_log();
        let dir = Utf8TempDir::new().unwrap();
        let client = CephClient::with_dir(dir.path(), "mysql");

        let executor = FakeExecutor::new(log.clone());
        let mut handler = StaticHandler::new();
        handler.expect_ok(format!(
            "ceph-authtool {} --create-keyring --name=client.mysql --add-key=AQBsecret==",
            client.keyring_path()
        ));
        handler.register(&executor);

        client
            .configure(
                &log,
                &executor.as_executor(),
                "AQBsecret==",
                "cephx",
                &["10.0.0.1".to_string()],
                true,
            )
            .unwrap();

        assert_eq!(
            std::fs::read_to_string(client.keyfile_path()).unwrap(),
            "AQBsecret=="
        );
        let conf = std::fs::read_to_string(client.conf_path()).unwrap();
        assert!(conf.contains("mon host = 10.0.0.1\n"), "{conf}");
        assert!(conf.contains("log to syslog = true\n"), "{conf}");
        assert!(conf.contains(&format!("keyring = {}\n", client.keyring_path())));
    }

    #[test]
    fn test_keyring_failure_stops_configuration() {
        let log = test_log();
        let dir = Utf8TempDir::new().unwrap();
        let client = CephClient::with_dir(dir.path(), "mysql");

        let executor = FakeExecutor::new(log.clone());
        let mut handler = StaticHandler::new();
        handler.expect_fail(format!(
            "ceph-authtool {} --create-keyring --name=client.mysql --add-key=k",
            client.keyring_path()
        ));
        handler.register(&executor);

        let err = client
            .configure(
                &log,
                &executor.as_executor(),
                "k",
                "cephx",
                &["10.0.0.1".to_string()],
                false,
            )
            .unwrap_err();
        assert!(matches!(err, ConfigureError::Keyring(_)));
        assert!(!client.keyfile_path().exists());
        assert!(!client.conf_path().exists());
    }

    #[test]
    fn test_missing_monitors_writes_nothing() {
        let log = test_log();
        let dir = Utf8TempDir::new().unwrap();
        let client = CephClient::with_dir(dir.path(), "mysql");

        // No commands expected.
        let executor = FakeExecutor::new(log.clone());
        StaticHandler::new().register(&executor);

        let err = client
            .configure(&log, &executor.as_executor(), "k", "cephx", &[], false)
            .unwrap_err();
        assert!(matches!(err, ConfigureError::NoMonitors(_)), "{err}");
        assert!(!client.keyring_path().exists());
        assert!(!client.keyfile_path().exists());
        assert!(!client.conf_path().exists());
    }
}
