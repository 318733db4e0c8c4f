// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! CLI invoked by the storage charm's hooks

use anyhow::{anyhow, Context};
use camino::{Utf8Path, Utf8PathBuf};
use ceph_utils::keyring::CephClient;
use ceph_utils::modprobe::{Modprobe, MODULES_FILE};
use ceph_utils::mount::PROC_MOUNTS;
use ceph_utils::{BoxedExecutor, HostExecutor, CEPH_CONF_DIR};
use charm_storage::cmd::{fatal, CmdError};
use charm_storage::config::{Config, DEFAULT_CONFIG_PATH};
use charm_storage::identity::UnitName;
use charm_storage::provision::{HostStorageState, StorageProvisioner};
use charm_storage::volume::{
    HostFilesystem, Owner, VolumeDecision, VolumeSwitcher,
};
use clap::{ArgAction, Args, Parser, Subcommand};
use slog::{info, Drain, Logger};
use std::sync::Arc;
use std::time::Duration;
use uzers::get_user_by_name;

#[derive(Debug, Parser)]
struct CharmStorage {
    /// charm-storage configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: Utf8PathBuf,
    /// unit name, e.g. "mysql/0"
    #[arg(long, env = "JUJU_UNIT_NAME")]
    unit: Option<UnitName>,
    #[arg(long, default_value = "info", value_parser = parse_log_level)]
    log_level: slog::Level,
    /// kill host commands running longer than this many seconds
    #[arg(long)]
    command_timeout: Option<u64>,
    #[command(subcommand)]
    command: CharmStorageCommand,
}

#[derive(Debug, Subcommand)]
enum CharmStorageCommand {
    /// Prepares the host when the Ceph relation is joined
    CephJoined,
    /// Configures the Ceph client and provisions this unit's storage
    CephChanged(CephChangedArgs),
    /// Moves the service directory onto a volume or back to local storage
    MountVolume(MountVolumeArgs),
}

#[derive(Debug, Args)]
struct CephChangedArgs {
    /// authentication scheme published by the Ceph relation
    #[arg(long)]
    auth: Option<String>,
    /// client secret published by the Ceph relation
    #[arg(long)]
    key: Option<String>,
    #[arg(long, action = ArgAction::Set, default_value_t = false)]
    use_syslog: bool,
    /// Ceph monitor addresses
    #[arg(long = "mon-host", num_args = 1..)]
    mon_hosts: Vec<String>,
}

#[derive(Debug, Args)]
struct MountVolumeArgs {
    /// keep the service directory on local storage
    #[arg(long, conflicts_with = "mountpoint", required_unless_present = "mountpoint")]
    ephemeral: bool,
    /// external volume to move the service directory onto
    #[arg(long)]
    mountpoint: Option<Utf8PathBuf>,
    /// block device to mount at the mount point first, if not yet mounted
    #[arg(long, requires = "mountpoint")]
    device: Option<Utf8PathBuf>,
}

fn parse_log_level(s: &str) -> anyhow::Result<slog::Level> {
    s.parse().map_err(|_| anyhow!("invalid log level {s:?}"))
}

fn main() {
    let args = CharmStorage::parse();
    let log = build_logger(args.log_level);
    let result = do_run(&log, args);
    // Flush the async drain before a possible exit.
    drop(log);
    if let Err(err) = result {
        fatal(err);
    }
}

fn build_logger(level: slog::Level) -> Logger {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog::LevelFilter::new(drain, level).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, slog::o!("component" => "charm-storage"))
}

fn build_executor(log: &Logger, timeout: Option<Duration>) -> BoxedExecutor {
    let executor = match timeout {
        Some(timeout) => HostExecutor::with_timeout(log.clone(), timeout),
        None => HostExecutor::new(log.clone()),
    };
    executor.as_executor()
}

fn do_run(log: &Logger, args: CharmStorage) -> Result<(), CmdError> {
    match args.command {
        CharmStorageCommand::CephJoined => Ok(ceph_joined(log)?),
        CharmStorageCommand::CephChanged(sub) => {
            let unit = args.unit.ok_or_else(|| {
                CmdError::Usage(
                    "unit name required: pass --unit or set JUJU_UNIT_NAME"
                        .to_string(),
                )
            })?;
            let config = Config::from_file(&args.config)
                .context("failed to load configuration")?;
            let timeout = args
                .command_timeout
                .map(Duration::from_secs)
                .or(config.commands.timeout());
            let executor = build_executor(log, timeout);
            Ok(ceph_changed(log, &executor, &unit, &config, sub)?)
        }
        CharmStorageCommand::MountVolume(sub) => {
            let config = Config::from_file(&args.config)
                .context("failed to load configuration")?;
            let timeout = args
                .command_timeout
                .map(Duration::from_secs)
                .or(config.commands.timeout());
            let executor = build_executor(log, timeout);
            Ok(mount_volume(log, &executor, &config, sub)?)
        }
    }
}

fn ceph_joined(log: &Logger) -> anyhow::Result<()> {
    info!(log, "Start Ceph relation joined");
    std::fs::create_dir_all(CEPH_CONF_DIR)
        .with_context(|| format!("could not create {CEPH_CONF_DIR}"))?;
    info!(log, "Finish Ceph relation joined");
    Ok(())
}

fn ceph_changed(
    log: &Logger,
    executor: &BoxedExecutor,
    unit: &UnitName,
    config: &Config,
    args: CephChangedArgs,
) -> Result<(), CmdError> {
    info!(log, "Start Ceph relation changed"; "unit" => %unit);
    let (Some(auth), Some(key)) = (args.auth.as_deref(), args.key.as_deref())
    else {
        info!(log, "Missing key or auth in relation");
        return Ok(());
    };
    if args.mon_hosts.is_empty() {
        return Err(CmdError::Usage(
            "at least one --mon-host is required".to_string(),
        ));
    }

    let ceph = config
        .ceph
        .as_ref()
        .context("configuration has no [ceph] section")?;
    let identity = ceph.identity(unit);
    let target = ceph.target(&identity);

    std::fs::create_dir_all(CEPH_CONF_DIR)
        .with_context(|| format!("could not create {CEPH_CONF_DIR}"))?;
    let client = CephClient::new(identity.service.clone());
    client
        .configure(log, executor, key, auth, &args.mon_hosts, args.use_syslog)
        .context("failed to configure Ceph client")?;
    Modprobe::load(log, executor, "rbd", Utf8Path::new(MODULES_FILE))
        .context("failed to load rbd kernel module")?;

    let state = HostStorageState::new(executor.clone(), PROC_MOUNTS);
    let provisioner = StorageProvisioner::new(
        log,
        executor.clone(),
        Box::new(state),
        client.keyfile_path(),
    );
    provisioner
        .ensure_storage(&identity, &target, &ceph.dependent_services)
        .context("failed to ensure Ceph storage")?;

    info!(log, "Finish Ceph relation changed");
    Ok(())
}

fn mount_volume(
    log: &Logger,
    executor: &BoxedExecutor,
    config: &Config,
    args: MountVolumeArgs,
) -> anyhow::Result<()> {
    let volume = config
        .volume
        .as_ref()
        .context("configuration has no [volume] section")?;
    let decision = match args.mountpoint {
        Some(mountpoint) if !args.ephemeral => {
            VolumeDecision::External(mountpoint)
        }
        _ => VolumeDecision::Ephemeral,
    };

    let user = get_user_by_name(&volume.service_user)
        .with_context(|| format!("no such user: {}", volume.service_user))?;
    let owner = Owner { uid: user.uid(), gid: None };

    let switcher = VolumeSwitcher::new(
        log,
        executor.clone(),
        Arc::new(HostFilesystem::new(PROC_MOUNTS)),
        volume.service_dir.clone(),
        &volume.saved_suffix,
    )
    .with_owner(owner)
    .with_services(volume.services.clone());

    if let (Some(device), VolumeDecision::External(mountpoint)) =
        (&args.device, &decision)
    {
        let fstype = config.ceph.as_ref().map_or("ext4", |c| c.fstype.as_str());
        switcher
            .ensure_mounted(device, mountpoint, fstype)
            .context("failed to mount volume")?;
    }

    let transition = switcher
        .apply(&decision)
        .context("storage could not be configured")?;
    info!(
        log, "Volume configured";
        "decision" => %decision,
        "transition" => ?transition,
    );
    Ok(())
}
