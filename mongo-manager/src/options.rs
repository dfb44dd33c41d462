// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Deployment options
//!
//! A flat record: topology is discriminated by the presence of `replica_set`
//! and `sharded` rather than by distinct option types, and everything else is
//! a knob on top of that.  Inconsistent combinations are rejected by
//! [`Options::validate()`] before anything touches the filesystem.

use crate::error::Error;
use crate::keyfile::KEY_FILE_NAME;
use camino::Utf8PathBuf;

/// Default number of data-bearing replica-set members
const DEFAULT_DATA_BEARING_NODES: u32 = 3;
/// Default when an arbiter takes one of the voting slots
const DEFAULT_DATA_BEARING_NODES_WITH_ARBITER: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    Standalone,
    ReplicaSet,
    Sharded,
}

/// User-facing deployment options, one record for all topologies
#[derive(Debug, Clone)]
pub struct Options {
    /// deployment root; all data directories, logs, pid files, the key file
    /// and the descriptor live underneath it
    pub dir: Utf8PathBuf,
    /// directory containing `mongod`/`mongos`; `None` resolves on `PATH`
    pub bin_dir: Option<Utf8PathBuf>,
    /// lowest port allocated; the planner assigns contiguously upward
    pub base_port: u16,
    /// replica set name; presence selects the replica-set topology
    pub replica_set: Option<String>,
    /// number of shards; presence selects the sharded topology
    pub sharded: Option<u32>,
    /// number of mongos routers (sharded only)
    pub mongos: u32,
    /// force the config server to run as a one-member replica set even on
    /// servers older than 3.4
    pub csrs: bool,
    /// add an arbiter to the replica set
    pub arbiter: bool,
    /// data-bearing replica-set members; defaults to 3, or 2 with an arbiter
    pub data_bearing_nodes: Option<u32>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// server TLS mode string (`requireTLS` etc.); spelled per server version
    /// by the planner
    pub tls_mode: Option<String>,
    pub tls_certificate_key_file: Option<Utf8PathBuf>,
    pub tls_ca_file: Option<Utf8PathBuf>,
    /// extra argv appended to every server command line
    pub passthrough_args: Vec<String>,
    /// extra argv for non-config-server `mongod` processes
    pub mongod_passthrough_args: Vec<String>,
    /// extra argv for `mongos` routers
    pub mongos_passthrough_args: Vec<String>,
    /// extra argv for config servers
    pub config_server_passthrough_args: Vec<String>,
}

impl Options {
    /// Returns options for a standalone deployment rooted at `dir` with all
    /// defaults; callers set fields directly to select other topologies
    pub fn new(dir: impl Into<Utf8PathBuf>) -> Options {
        Options {
            dir: dir.into(),
            bin_dir: None,
            base_port: 27017,
            replica_set: None,
            sharded: None,
            mongos: 1,
            csrs: false,
            arbiter: false,
            data_bearing_nodes: None,
            username: None,
            password: None,
            tls_mode: None,
            tls_certificate_key_file: None,
            tls_ca_file: None,
            passthrough_args: Vec::new(),
            mongod_passthrough_args: Vec::new(),
            mongos_passthrough_args: Vec::new(),
            config_server_passthrough_args: Vec::new(),
        }
    }

    /// Rejects inconsistent option combinations
    pub fn validate(&self) -> Result<(), Error> {
        if self.username.is_some() != self.password.is_some() {
            return Err(Error::InvalidOptions(String::from(
                "username and password must be specified together",
            )));
        }
        if self.arbiter && self.replica_set.is_none() {
            return Err(Error::InvalidOptions(String::from(
                "arbiter requires replica_set",
            )));
        }
        if self.data_bearing_nodes.is_some() && self.replica_set.is_none() {
            return Err(Error::InvalidOptions(String::from(
                "data_bearing_nodes requires replica_set",
            )));
        }
        if self.sharded == Some(0) {
            return Err(Error::InvalidOptions(String::from(
                "sharded requires at least one shard",
            )));
        }
        if self.sharded.is_some() && self.mongos == 0 {
            return Err(Error::InvalidOptions(String::from(
                "a sharded deployment requires at least one mongos",
            )));
        }
        Ok(())
    }

    /// `sharded` wins when both discriminating fields are present.
    pub fn topology(&self) -> Topology {
        if self.sharded.is_some() {
            Topology::Sharded
        } else if self.replica_set.is_some() {
            Topology::ReplicaSet
        } else {
            Topology::Standalone
        }
    }

    pub fn auth_enabled(&self) -> bool {
        self.username.is_some()
    }

    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => Some((u, p)),
            _ => None,
        }
    }

    /// Number of data-bearing members with defaults applied
    pub fn data_nodes(&self) -> u32 {
        self.data_bearing_nodes.unwrap_or(if self.arbiter {
            DEFAULT_DATA_BEARING_NODES_WITH_ARBITER
        } else {
            DEFAULT_DATA_BEARING_NODES
        })
    }

    pub fn mongod_path(&self) -> Utf8PathBuf {
        match &self.bin_dir {
            Some(bin_dir) => bin_dir.join("mongod"),
            None => Utf8PathBuf::from("mongod"),
        }
    }

    pub fn mongos_path(&self) -> Utf8PathBuf {
        match &self.bin_dir {
            Some(bin_dir) => bin_dir.join("mongos"),
            None => Utf8PathBuf::from("mongos"),
        }
    }

    pub fn key_file_path(&self) -> Utf8PathBuf {
        self.dir.join(KEY_FILE_NAME)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_validate_rejects_lone_credentials() {
        let mut options = Options::new("/tmp/d");
        options.username = Some(String::from("root"));
        assert!(matches!(
            options.validate(),
            Err(Error::InvalidOptions(_))
        ));

        let mut options = Options::new("/tmp/d");
        options.password = Some(String::from("hunter2"));
        assert!(options.validate().is_err());

        let mut options = Options::new("/tmp/d");
        options.username = Some(String::from("root"));
        options.password = Some(String::from("hunter2"));
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_rs_flags_without_rs() {
        let mut options = Options::new("/tmp/d");
        options.arbiter = true;
        assert!(options.validate().is_err());

        let mut options = Options::new("/tmp/d");
        options.data_bearing_nodes = Some(5);
        assert!(options.validate().is_err());

        let mut options = Options::new("/tmp/d");
        options.replica_set = Some(String::from("rs0"));
        options.arbiter = true;
        options.data_bearing_nodes = Some(2);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_cluster() {
        let mut options = Options::new("/tmp/d");
        options.sharded = Some(0);
        assert!(options.validate().is_err());

        let mut options = Options::new("/tmp/d");
        options.sharded = Some(1);
        options.mongos = 0;
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_topology_discrimination() {
        let mut options = Options::new("/tmp/d");
        assert_eq!(options.topology(), Topology::Standalone);
        options.replica_set = Some(String::from("rs0"));
        assert_eq!(options.topology(), Topology::ReplicaSet);
        options.sharded = Some(2);
        assert_eq!(options.topology(), Topology::Sharded);
    }

    #[test]
    fn test_data_nodes_defaults() {
        let mut options = Options::new("/tmp/d");
        options.replica_set = Some(String::from("rs0"));
        assert_eq!(options.data_nodes(), 3);
        options.arbiter = true;
        assert_eq!(options.data_nodes(), 2);
        options.data_bearing_nodes = Some(5);
        assert_eq!(options.data_nodes(), 5);
    }

    #[test]
    fn test_binary_paths() {
        let mut options = Options::new("/tmp/d");
        assert_eq!(options.mongod_path(), Utf8PathBuf::from("mongod"));
        options.bin_dir = Some(Utf8PathBuf::from("/opt/mongodb/bin"));
        assert_eq!(
            options.mongod_path(),
            Utf8PathBuf::from("/opt/mongodb/bin/mongod")
        );
        assert_eq!(
            options.mongos_path(),
            Utf8PathBuf::from("/opt/mongodb/bin/mongos")
        );
    }
}
