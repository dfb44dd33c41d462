// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Topology planning
//!
//! Given validated [`Options`] and the detected server version, the planner
//! produces every process that must run: its data directory, port, and full
//! argv.  The plan is pure data; the orchestrator realizes it.  Argv is
//! assembled once here, version differences included (TLS flag spelling,
//! config server shape), so nothing downstream branches on version.
//!
//! Port allocation is deterministic from `base_port` (B):
//!
//! - standalone: B
//! - replica set: members on B..B+n-1, arbiter (if any) on B+n
//! - sharded: routers on B..B+M-1, config server on B+M, shards on
//!   B+M+1..B+M+S
//!
//! Note that in the sharded layout the routers get the lowest ports but are
//! started last; start order is config server, shards, routers.

use crate::options::{Options, Topology};
use crate::version::ServerVersion;
use camino::{Utf8Path, Utf8PathBuf};

/// First version whose config server must run as a replica set
const CSRS_MIN_VERSION: ServerVersion = ServerVersion::new(3, 4, 0);
/// First version that spells the TLS flag family `--tls*` rather than `--ssl*`
const TLS_FLAGS_MIN_VERSION: ServerVersion = ServerVersion::new(4, 2, 0);

/// Replica set name of a CSRS config server
pub const CONFIG_REPLICA_SET_NAME: &str = "csrs";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessKind {
    Mongod,
    Mongos,
}

impl ProcessKind {
    pub fn binary_name(&self) -> &'static str {
        match self {
            ProcessKind::Mongod => "mongod",
            ProcessKind::Mongos => "mongos",
        }
    }
}

/// One planned server process
#[derive(Debug, Clone)]
pub struct ProcessPlan {
    /// data directory (and home of the log and pid files)
    pub dir: Utf8PathBuf,
    pub port: u16,
    pub kind: ProcessKind,
    /// replica set this process belongs to, if any
    pub replica_set: Option<String>,
    /// full command line, element 0 the server binary
    pub argv: Vec<String>,
}

impl ProcessPlan {
    pub fn pid_path(&self) -> Utf8PathBuf {
        self.dir.join(format!("{}.pid", self.kind.binary_name()))
    }

    pub fn log_path(&self) -> Utf8PathBuf {
        self.dir.join(format!("{}.log", self.kind.binary_name()))
    }

    pub fn address(&self) -> String {
        format!("localhost:{}", self.port)
    }
}

/// The full deployment plan, shaped by topology
#[derive(Debug)]
pub enum DeploymentPlan {
    Standalone(ProcessPlan),
    ReplicaSet {
        name: String,
        members: Vec<ProcessPlan>,
        arbiter: Option<ProcessPlan>,
    },
    Sharded {
        config: ProcessPlan,
        /// `Some("csrs")` when the config server runs as a replica set
        config_replica_set: Option<String>,
        shards: Vec<ProcessPlan>,
        routers: Vec<ProcessPlan>,
    },
}

impl DeploymentPlan {
    /// All processes in start order (the descriptor's `db_dirs` order)
    pub fn processes(&self) -> Vec<&ProcessPlan> {
        match self {
            DeploymentPlan::Standalone(process) => vec![process],
            DeploymentPlan::ReplicaSet { members, arbiter, .. } => {
                members.iter().chain(arbiter.iter()).collect()
            }
            DeploymentPlan::Sharded { config, shards, routers, .. } => {
                std::iter::once(config)
                    .chain(shards.iter())
                    .chain(routers.iter())
                    .collect()
            }
        }
    }
}

/// Derives the deployment plan from options and server version
pub fn plan_deployment(
    options: &Options,
    version: ServerVersion,
) -> DeploymentPlan {
    match options.topology() {
        Topology::Standalone => {
            // Standalone auth uses `--auth` (added by the orchestrator after
            // the root user exists), not a key file.
            let dir = options.dir.join("standalone");
            let argv = mongod_argv(
                options,
                version,
                &dir,
                options.base_port,
                None,
                None,
                None,
                &options.mongod_passthrough_args,
            );
            DeploymentPlan::Standalone(ProcessPlan {
                dir,
                port: options.base_port,
                kind: ProcessKind::Mongod,
                replica_set: None,
                argv,
            })
        }

        Topology::ReplicaSet => {
            let name = options
                .replica_set
                .clone()
                .expect("replica-set topology without a set name");
            let key_file =
                options.auth_enabled().then(|| options.key_file_path());
            let n = options.data_nodes();

            let members = (0..n)
                .map(|i| {
                    let dir = options.dir.join(format!("rs{}", i + 1));
                    let port = options.base_port + i as u16;
                    let argv = mongod_argv(
                        options,
                        version,
                        &dir,
                        port,
                        Some(&name),
                        key_file.as_deref(),
                        None,
                        &options.mongod_passthrough_args,
                    );
                    ProcessPlan {
                        dir,
                        port,
                        kind: ProcessKind::Mongod,
                        replica_set: Some(name.clone()),
                        argv,
                    }
                })
                .collect();

            let arbiter = options.arbiter.then(|| {
                let dir = options.dir.join("arbiter");
                let port = options.base_port + n as u16;
                let argv = mongod_argv(
                    options,
                    version,
                    &dir,
                    port,
                    Some(&name),
                    key_file.as_deref(),
                    None,
                    &options.mongod_passthrough_args,
                );
                ProcessPlan {
                    dir,
                    port,
                    kind: ProcessKind::Mongod,
                    replica_set: Some(name.clone()),
                    argv,
                }
            });

            DeploymentPlan::ReplicaSet { name, members, arbiter }
        }

        Topology::Sharded => {
            let shard_count =
                options.sharded.expect("sharded topology without a count");
            let router_count = options.mongos;
            let key_file =
                options.auth_enabled().then(|| options.key_file_path());

            let config_port = options.base_port + router_count as u16;
            let csrs = options.csrs || version >= CSRS_MIN_VERSION;
            let config_replica_set =
                csrs.then(|| String::from(CONFIG_REPLICA_SET_NAME));
            let config_dir = options.dir.join(CONFIG_REPLICA_SET_NAME);
            let config = ProcessPlan {
                argv: mongod_argv(
                    options,
                    version,
                    &config_dir,
                    config_port,
                    config_replica_set.as_deref(),
                    key_file.as_deref(),
                    Some("--configsvr"),
                    &options.config_server_passthrough_args,
                ),
                dir: config_dir,
                port: config_port,
                kind: ProcessKind::Mongod,
                replica_set: config_replica_set.clone(),
            };

            let config_db = match &config_replica_set {
                Some(name) => format!("{}/localhost:{}", name, config_port),
                None => format!("localhost:{}", config_port),
            };

            let shards = (0..shard_count)
                .map(|i| {
                    let name = format!("shard{:02}", i + 1);
                    let dir = options.dir.join(&name);
                    let port = config_port + 1 + i as u16;
                    let argv = mongod_argv(
                        options,
                        version,
                        &dir,
                        port,
                        Some(&name),
                        key_file.as_deref(),
                        Some("--shardsvr"),
                        &options.mongod_passthrough_args,
                    );
                    ProcessPlan {
                        dir,
                        port,
                        kind: ProcessKind::Mongod,
                        replica_set: Some(name),
                        argv,
                    }
                })
                .collect();

            let routers = (0..router_count)
                .map(|i| {
                    let dir = options.dir.join(format!("router{:02}", i + 1));
                    let port = options.base_port + i as u16;
                    let argv = mongos_argv(
                        options,
                        version,
                        &dir,
                        port,
                        &config_db,
                        key_file.as_deref(),
                    );
                    ProcessPlan {
                        dir,
                        port,
                        kind: ProcessKind::Mongos,
                        replica_set: None,
                        argv,
                    }
                })
                .collect();

            DeploymentPlan::Sharded {
                config,
                config_replica_set,
                shards,
                routers,
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn mongod_argv(
    options: &Options,
    version: ServerVersion,
    dir: &Utf8Path,
    port: u16,
    replica_set: Option<&str>,
    key_file: Option<&Utf8Path>,
    role_flag: Option<&str>,
    class_passthrough: &[String],
) -> Vec<String> {
    let mut argv = vec![
        options.mongod_path().into_string(),
        String::from("--pidfilepath"),
        dir.join("mongod.pid").into_string(),
        String::from("--dbpath"),
        dir.as_str().to_string(),
        String::from("--port"),
        port.to_string(),
    ];
    if let Some(name) = replica_set {
        argv.push(String::from("--replSet"));
        argv.push(name.to_string());
    }
    if let Some(key_file) = key_file {
        argv.push(String::from("--keyFile"));
        argv.push(key_file.as_str().to_string());
    }
    if let Some(role_flag) = role_flag {
        argv.push(role_flag.to_string());
    }
    argv.extend(tls_args(options, version));
    argv.extend(options.passthrough_args.iter().cloned());
    argv.extend(class_passthrough.iter().cloned());
    argv
}

fn mongos_argv(
    options: &Options,
    version: ServerVersion,
    dir: &Utf8Path,
    port: u16,
    config_db: &str,
    key_file: Option<&Utf8Path>,
) -> Vec<String> {
    let mut argv = vec![
        options.mongos_path().into_string(),
        String::from("--pidfilepath"),
        dir.join("mongos.pid").into_string(),
        String::from("--port"),
        port.to_string(),
        String::from("--configdb"),
        config_db.to_string(),
    ];
    if let Some(key_file) = key_file {
        argv.push(String::from("--keyFile"));
        argv.push(key_file.as_str().to_string());
    }
    argv.extend(tls_args(options, version));
    argv.extend(options.passthrough_args.iter().cloned());
    argv.extend(options.mongos_passthrough_args.iter().cloned());
    argv
}

// Servers before 4.2 only understand the `--ssl*` flag family, and their mode
// strings say SSL where newer ones say TLS.
fn tls_args(options: &Options, version: ServerVersion) -> Vec<String> {
    let tls_spelling = version >= TLS_FLAGS_MIN_VERSION;
    let mut args = Vec::new();
    if let Some(mode) = &options.tls_mode {
        if tls_spelling {
            args.push(String::from("--tlsMode"));
            args.push(mode.clone());
        } else {
            args.push(String::from("--sslMode"));
            args.push(mode.replace("TLS", "SSL"));
        }
    }
    if let Some(cert) = &options.tls_certificate_key_file {
        args.push(String::from(if tls_spelling {
            "--tlsCertificateKeyFile"
        } else {
            "--sslPEMKeyFile"
        }));
        args.push(cert.as_str().to_string());
    }
    if let Some(ca) = &options.tls_ca_file {
        args.push(String::from(if tls_spelling {
            "--tlsCAFile"
        } else {
            "--sslCAFile"
        }));
        args.push(ca.as_str().to_string());
    }
    args
}
