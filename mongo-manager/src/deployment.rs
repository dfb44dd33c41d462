// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The deployment orchestrator
//!
//! `init` is a straight-line state machine per topology: spawn processes in
//! dependency order, probe them, issue the cluster-formation commands, and
//! record everything in the descriptor.  `start` and `stop` replay the
//! descriptor and know nothing about topology beyond the one distinction
//! that matters at teardown: sharded deployments must see each process die
//! before the next one is signalled, because a config server that dies
//! before its shards leaves the shards stalling on it.

use crate::descriptor::{Descriptor, Sharded};
use crate::error::Error;
use crate::keyfile;
use crate::options::Options;
use crate::plan::{plan_deployment, DeploymentPlan, ProcessPlan};
use crate::probe::{self, ConnectMode, Prober};
use crate::spawn::{self, Signal};
use crate::version;
use camino::{Utf8Path, Utf8PathBuf};
use slog::Logger;
use std::time::Duration;

/// How long a TERM'd process may take to exit
pub const STOP_TIMEOUT: Duration = Duration::from_secs(15);

/// A deployment rooted at a directory, driven by validated [`Options`]
pub struct Deployment {
    options: Options,
    log: Logger,
}

impl Deployment {
    /// Validates `options` and returns the deployment handle
    ///
    /// Nothing touches the filesystem until [`Deployment::init()`],
    /// [`Deployment::start()`] or [`Deployment::stop()`] runs.
    pub fn new(options: Options, log: Logger) -> Result<Deployment, Error> {
        options.validate()?;
        Ok(Deployment { options, log })
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Provisions a new deployment
    ///
    /// Any error is decorated with the tail of every server log under the
    /// deployment directory.  Partial state is left as-is for inspection;
    /// the descriptor is persisted early enough that `stop` works on it.
    pub async fn init(&self) -> Result<(), Error> {
        match self.init_inner().await {
            Ok(()) => Ok(()),
            Err(error) => Err(self.attach_server_logs(error)),
        }
    }

    async fn init_inner(&self) -> Result<(), Error> {
        let descriptor_path = Descriptor::file_path(&self.options.dir);
        if descriptor_path.exists() {
            return Err(Error::AlreadyInitialized { path: descriptor_path });
        }
        std::fs::create_dir_all(&self.options.dir)
            .map_err(|e| Error::io(&self.options.dir, e))?;

        let server_version =
            version::detect(&self.options.mongod_path()).await?;
        info!(self.log, "detected server version";
            "version" => %server_version);

        match plan_deployment(&self.options, server_version) {
            DeploymentPlan::Standalone(process) => {
                self.init_standalone(process).await
            }
            DeploymentPlan::ReplicaSet { name, members, arbiter } => {
                self.init_replica_set(&name, &members, arbiter.as_ref()).await
            }
            DeploymentPlan::Sharded {
                config,
                config_replica_set,
                shards,
                routers,
            } => {
                self.init_sharded(
                    &config,
                    config_replica_set.as_deref(),
                    &shards,
                    &routers,
                )
                .await
            }
        }
    }

    async fn init_standalone(&self, process: ProcessPlan) -> Result<(), Error> {
        let pid = self.spawn_process(&process).await?;
        let mut start_cmd = process.argv.clone();

        if let Some((username, password)) = self.options.credentials() {
            let prober = Prober::new(&self.options, &self.log);
            let address = process.address();
            prober
                .wait_for_ping(
                    &address,
                    &ConnectMode::Direct,
                    probe::PING_RETRY_TIMEOUT,
                )
                .await?;
            prober
                .create_user(&address, &ConnectMode::Direct, username, password)
                .await?;

            // The server was started permissive so the root user could be
            // created; restart it with auth enforced.
            info!(self.log, "restarting standalone server with --auth");
            spawn::signal(pid, Signal::Terminate)?;
            spawn::wait_for_exit(
                pid,
                STOP_TIMEOUT,
                "standalone",
                &process.log_path(),
            )
            .await?;
            start_cmd.push(String::from("--auth"));
            spawn::spawn(
                &start_cmd,
                &process.log_path(),
                &process.pid_path(),
                spawn::SPAWN_TIMEOUT,
            )
            .await?;
        }

        let mut descriptor = Descriptor::new(Sharded::Unsharded(false), None);
        descriptor.push(process.dir.clone(), start_cmd);
        descriptor.store(&self.options.dir)?;
        info!(self.log, "standalone deployment initialized";
            "port" => process.port);
        Ok(())
    }

    async fn init_replica_set(
        &self,
        name: &str,
        members: &[ProcessPlan],
        arbiter: Option<&ProcessPlan>,
    ) -> Result<(), Error> {
        if self.options.auth_enabled() {
            keyfile::create_key(&self.options.key_file_path())?;
        }

        let mut descriptor = Descriptor::new(Sharded::Unsharded(false), None);
        for process in members.iter().chain(arbiter) {
            self.spawn_process(process).await?;
            descriptor.push(process.dir.clone(), process.argv.clone());
        }
        // Recorded before initiation so that a failure from here on still
        // leaves something `stop` can tear down.
        descriptor.store(&self.options.dir)?;

        let prober = Prober::new(&self.options, &self.log);
        let hosts: Vec<String> =
            members.iter().map(|m| m.address()).collect();
        let arbiter_address = arbiter.map(|a| a.address());

        for address in hosts.iter().chain(arbiter_address.iter()) {
            prober
                .wait_for_ping(
                    address,
                    &ConnectMode::Direct,
                    probe::PING_RETRY_TIMEOUT,
                )
                .await?;
        }
        prober
            .replica_set_initiate(
                &hosts[0],
                name,
                &hosts,
                arbiter_address.as_deref(),
                false,
            )
            .await?;
        // The arbiter is excluded: it never reports PRIMARY or SECONDARY.
        for address in &hosts {
            prober
                .wait_until_provisioned(address, probe::PROVISION_TIMEOUT)
                .await?;
        }

        let rs_mode = ConnectMode::ReplicaSet(name.to_string());
        prober
            .wait_for_ping(&hosts[0], &rs_mode, probe::PING_RETRY_TIMEOUT)
            .await?;

        if let Some((username, password)) = self.options.credentials() {
            prober
                .create_user(&hosts[0], &rs_mode, username, password)
                .await?;
            info!(self.log, "restarting replica set to enforce auth");
            self.stop().await?;
            self.start().await?;
            let authed =
                prober.clone().with_credentials(username, password);
            authed
                .wait_for_ping(&hosts[0], &rs_mode, probe::PING_RETRY_TIMEOUT)
                .await?;
        }

        info!(self.log, "replica set initialized"; "name" => name,
            "data_bearing" => members.len(),
            "arbiter" => arbiter.is_some());
        Ok(())
    }

    async fn init_sharded(
        &self,
        config: &ProcessPlan,
        config_replica_set: Option<&str>,
        shards: &[ProcessPlan],
        routers: &[ProcessPlan],
    ) -> Result<(), Error> {
        if self.options.auth_enabled() {
            keyfile::create_key(&self.options.key_file_path())?;
        }
        let prober = Prober::new(&self.options, &self.log);

        // Config server first; everything else depends on it.
        self.spawn_process(config).await?;
        let config_address = config.address();
        prober
            .wait_for_ping(
                &config_address,
                &ConnectMode::Direct,
                probe::PING_RETRY_TIMEOUT,
            )
            .await?;
        if let Some(csrs_name) = config_replica_set {
            prober
                .replica_set_initiate(
                    &config_address,
                    csrs_name,
                    &[config_address.clone()],
                    None,
                    true,
                )
                .await?;
            prober
                .wait_until_provisioned(
                    &config_address,
                    probe::PROVISION_TIMEOUT,
                )
                .await?;
        }

        // Each shard is a one-member replica set, fully formed before the
        // next one is considered.
        for shard in shards {
            let rs_name = shard
                .replica_set
                .as_deref()
                .expect("planned shard without a replica set name");
            self.spawn_process(shard).await?;
            let address = shard.address();
            prober
                .wait_for_ping(
                    &address,
                    &ConnectMode::Direct,
                    probe::PING_RETRY_TIMEOUT,
                )
                .await?;
            prober
                .replica_set_initiate(
                    &address,
                    rs_name,
                    &[address.clone()],
                    None,
                    false,
                )
                .await?;
            prober
                .wait_until_provisioned(&address, probe::PROVISION_TIMEOUT)
                .await?;
        }

        for router in routers {
            self.spawn_process(router).await?;
        }

        let mut descriptor = Descriptor::new(
            Sharded::Shards(shards.len() as u32),
            Some(routers.len() as u32),
        );
        for process in
            std::iter::once(config).chain(shards).chain(routers)
        {
            descriptor.push(process.dir.clone(), process.argv.clone());
        }
        descriptor.store(&self.options.dir)?;

        let router_address = routers[0].address();
        prober
            .wait_for_ping(
                &router_address,
                &ConnectMode::Direct,
                probe::PING_RETRY_TIMEOUT,
            )
            .await?;
        for shard in shards {
            let rs_name = shard
                .replica_set
                .as_deref()
                .expect("planned shard without a replica set name");
            // Older servers only commit the freshly formed set once a
            // replica-set-mode client has talked to it; ping it that way
            // before registration.
            prober
                .wait_for_ping(
                    &shard.address(),
                    &ConnectMode::ReplicaSet(rs_name.to_string()),
                    probe::PING_RETRY_TIMEOUT,
                )
                .await?;
            prober
                .add_shard(
                    &router_address,
                    &format!("{}/{}", rs_name, shard.address()),
                )
                .await?;
        }

        if let Some((username, password)) = self.options.credentials() {
            prober
                .create_user(
                    &router_address,
                    &ConnectMode::Direct,
                    username,
                    password,
                )
                .await?;
        }

        info!(self.log, "sharded cluster initialized";
            "shards" => shards.len(), "routers" => routers.len());
        Ok(())
    }

    /// Starts every recorded process in descriptor order
    ///
    /// Uses the recorded argv verbatim; no readiness probing beyond the
    /// spawner's own pid-file wait.
    pub async fn start(&self) -> Result<(), Error> {
        let descriptor = Descriptor::load(&self.options.dir)?;
        for dir in &descriptor.db_dirs {
            let Some(start_cmd) = descriptor.start_cmd(dir) else {
                warn!(self.log, "descriptor has no start command"; "dir" => %dir);
                continue;
            };
            let Some((log_path, pid_path)) = derived_paths(dir, start_cmd)
            else {
                warn!(self.log, "unusable start command recorded"; "dir" => %dir);
                continue;
            };
            info!(self.log, "starting recorded process"; "dir" => %dir);
            spawn::spawn(start_cmd, &log_path, &pid_path, spawn::SPAWN_TIMEOUT)
                .await?;
        }
        Ok(())
    }

    /// Stops every recorded process in reverse descriptor order
    ///
    /// Pid files are left in place; a second `stop` finds the processes
    /// already gone and does nothing.
    pub async fn stop(&self) -> Result<(), Error> {
        let descriptor = Descriptor::load(&self.options.dir)?;
        let sharded = descriptor.sharded.is_sharded();
        let mut pending: Vec<(String, u32, Utf8PathBuf)> = Vec::new();

        for dir in descriptor.db_dirs.iter().rev() {
            let Some(start_cmd) = descriptor.start_cmd(dir) else {
                continue;
            };
            let Some((log_path, pid_path)) = derived_paths(dir, start_cmd)
            else {
                continue;
            };
            let contents = match std::fs::read_to_string(&pid_path) {
                Ok(contents) => contents,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(self.log, "no pid file"; "dir" => %dir);
                    continue;
                }
                Err(e) => return Err(Error::io(pid_path, e)),
            };
            let pid: u32 = match contents.trim().parse() {
                Ok(pid) => pid,
                Err(_) => {
                    warn!(self.log, "ignoring malformed pid file";
                        "path" => %pid_path);
                    continue;
                }
            };

            let label =
                dir.file_name().unwrap_or_else(|| dir.as_str()).to_string();
            info!(self.log, "stopping {}", label; "pid" => pid);
            if !spawn::signal(pid, Signal::Terminate)? {
                debug!(self.log, "process already gone"; "pid" => pid);
                continue;
            }
            if sharded {
                // Each process must be fully down before the next TERM:
                // shards stall for about a minute if their config server
                // disappears first, and reverse-start order only protects
                // the config server if the waits are interleaved.
                spawn::wait_for_exit(pid, STOP_TIMEOUT, &label, &log_path)
                    .await?;
            } else {
                pending.push((label, pid, log_path));
            }
        }

        for (label, pid, log_path) in pending {
            spawn::wait_for_exit(pid, STOP_TIMEOUT, &label, &log_path).await?;
        }
        info!(self.log, "deployment stopped");
        Ok(())
    }

    async fn spawn_process(&self, process: &ProcessPlan) -> Result<u32, Error> {
        std::fs::create_dir_all(&process.dir)
            .map_err(|e| Error::io(&process.dir, e))?;
        info!(self.log, "starting {}", process.kind.binary_name();
            "dir" => %process.dir, "port" => process.port);
        spawn::spawn(
            &process.argv,
            &process.log_path(),
            &process.pid_path(),
            spawn::SPAWN_TIMEOUT,
        )
        .await
    }

    fn attach_server_logs(&self, error: Error) -> Error {
        let log_excerpts = spawn::collect_log_tails(&self.options.dir);
        if log_excerpts.is_empty() {
            return error;
        }
        Error::WithServerLogs { source: Box::new(error), log_excerpts }
    }
}

// Log and pid paths are not recorded in the descriptor; they follow from the
// recorded binary's basename.
fn derived_paths(
    dir: &Utf8Path,
    start_cmd: &[String],
) -> Option<(Utf8PathBuf, Utf8PathBuf)> {
    let basename = Utf8Path::new(start_cmd.first()?).file_name()?;
    Some((
        dir.join(format!("{}.log", basename)),
        dir.join(format!("{}.pid", basename)),
    ))
}
