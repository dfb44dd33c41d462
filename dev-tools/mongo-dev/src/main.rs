// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Developer tool for provisioning local MongoDB deployments.

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use mongo_manager::{Deployment, Options};
use slog::{o, Drain};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = MongoDevApp::parse();
    args.exec().await
}

/// Tools for provisioning local MongoDB deployments for testing.
#[derive(Clone, Debug, Parser)]
#[clap(version)]
struct MongoDevApp {
    /// Deployment root directory
    #[clap(long)]
    dir: Utf8PathBuf,

    #[clap(subcommand)]
    command: MongoDevCmd,
}

impl MongoDevApp {
    async fn exec(&self) -> anyhow::Result<()> {
        match &self.command {
            MongoDevCmd::Init(args) => args.exec(&self.dir).await,
            MongoDevCmd::Start => {
                let deployment =
                    deployment(Options::new(self.dir.clone()))?;
                deployment
                    .start()
                    .await
                    .context("starting recorded deployment")?;
                println!("mongo-dev: deployment started from {}", self.dir);
                Ok(())
            }
            MongoDevCmd::Stop => {
                let deployment =
                    deployment(Options::new(self.dir.clone()))?;
                deployment
                    .stop()
                    .await
                    .context("stopping recorded deployment")?;
                println!("mongo-dev: deployment stopped");
                Ok(())
            }
        }
    }
}

#[derive(Clone, Debug, Subcommand)]
enum MongoDevCmd {
    /// Provision a new deployment
    Init(InitArgs),
    /// Start every process recorded in the deployment descriptor
    Start,
    /// Stop every process recorded in the deployment descriptor
    Stop,
}

#[derive(Clone, Debug, Args)]
struct InitArgs {
    /// Directory containing the mongod/mongos binaries (default: $PATH)
    #[clap(long)]
    bin_dir: Option<Utf8PathBuf>,

    /// Lowest port to allocate; further ports are contiguous above it
    #[clap(long, default_value = "27017")]
    base_port: u16,

    /// Replica set name; selects a replica-set topology
    #[clap(long)]
    replica_set: Option<String>,

    /// Number of shards; selects a sharded topology
    #[clap(long)]
    sharded: Option<u32>,

    /// Number of mongos routers (sharded only)
    #[clap(long, default_value = "1")]
    mongos: u32,

    /// Run the config server as a replica set even on servers older than 3.4
    #[clap(long)]
    csrs: bool,

    /// Add an arbiter to the replica set
    #[clap(long, requires = "replica_set")]
    arbiter: bool,

    /// Number of data-bearing replica-set members (default 3, or 2 with an
    /// arbiter)
    #[clap(long, requires = "replica_set")]
    data_bearing_nodes: Option<u32>,

    /// Create this root user and enable authentication
    #[clap(long, requires = "password")]
    username: Option<String>,

    #[clap(long, requires = "username")]
    password: Option<String>,

    /// Server TLS mode (e.g. requireTLS)
    #[clap(long)]
    tls_mode: Option<String>,

    #[clap(long)]
    tls_certificate_key_file: Option<Utf8PathBuf>,

    #[clap(long)]
    tls_ca_file: Option<Utf8PathBuf>,

    /// Extra argument appended to every server command line (repeatable)
    #[clap(long = "passthrough-arg", value_name = "ARG")]
    passthrough_args: Vec<String>,

    /// Extra argument for non-config-server mongod processes (repeatable)
    #[clap(long = "mongod-passthrough-arg", value_name = "ARG")]
    mongod_passthrough_args: Vec<String>,

    /// Extra argument for mongos routers (repeatable)
    #[clap(long = "mongos-passthrough-arg", value_name = "ARG")]
    mongos_passthrough_args: Vec<String>,

    /// Extra argument for config servers (repeatable)
    #[clap(long = "config-server-passthrough-arg", value_name = "ARG")]
    config_server_passthrough_args: Vec<String>,
}

impl InitArgs {
    async fn exec(&self, dir: &Utf8PathBuf) -> anyhow::Result<()> {
        let mut options = Options::new(dir.clone());
        options.bin_dir = self.bin_dir.clone();
        options.base_port = self.base_port;
        options.replica_set = self.replica_set.clone();
        options.sharded = self.sharded;
        options.mongos = self.mongos;
        options.csrs = self.csrs;
        options.arbiter = self.arbiter;
        options.data_bearing_nodes = self.data_bearing_nodes;
        options.username = self.username.clone();
        options.password = self.password.clone();
        options.tls_mode = self.tls_mode.clone();
        options.tls_certificate_key_file =
            self.tls_certificate_key_file.clone();
        options.tls_ca_file = self.tls_ca_file.clone();
        options.passthrough_args = self.passthrough_args.clone();
        options.mongod_passthrough_args =
            self.mongod_passthrough_args.clone();
        options.mongos_passthrough_args =
            self.mongos_passthrough_args.clone();
        options.config_server_passthrough_args =
            self.config_server_passthrough_args.clone();

        let deployment = deployment(options)?;
        deployment.init().await.context("initializing deployment")?;
        println!("mongo-dev: deployment initialized under {}", dir);
        println!(
            "mongo-dev: run `mongo-dev --dir {} stop` to shut it down",
            dir
        );
        Ok(())
    }
}

fn deployment(options: Options) -> anyhow::Result<Deployment> {
    Ok(Deployment::new(options, root_logger())?)
}

fn root_logger() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    slog::Logger::root(drain, o!("component" => "mongo-dev"))
}
