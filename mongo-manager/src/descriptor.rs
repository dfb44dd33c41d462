// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The persisted deployment descriptor
//!
//! `init` records what it started in `mongo-manager.yml` at the deployment
//! root so that `start` and `stop` can operate from a cold process without
//! re-running the planner.  `db_dirs` is ordered: it is the start order, and
//! stop order is its reverse.  Each directory's full argv is recorded
//! verbatim, so restarting a deployment needs no knowledge of the options
//! that produced it.

use crate::error::Error;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Name of the descriptor file within the deployment directory
pub const DESCRIPTOR_FILE_NAME: &str = "mongo-manager.yml";

/// The `sharded` descriptor field: a shard count, or `false`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Sharded {
    Shards(u32),
    /// always serialized as `false`
    Unsharded(bool),
}

impl Sharded {
    pub fn count(&self) -> Option<u32> {
        match self {
            Sharded::Shards(n) => Some(*n),
            Sharded::Unsharded(_) => None,
        }
    }

    pub fn is_sharded(&self) -> bool {
        self.count().is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirSettings {
    /// argv recorded at init time; element 0 is the server binary
    pub start_cmd: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub sharded: Sharded,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mongos: Option<u32>,
    /// data directories in start order; stop order is the reverse
    pub db_dirs: Vec<Utf8PathBuf>,
    pub settings: BTreeMap<Utf8PathBuf, DirSettings>,
}

impl Descriptor {
    pub fn new(sharded: Sharded, mongos: Option<u32>) -> Descriptor {
        Descriptor {
            sharded,
            mongos,
            db_dirs: Vec::new(),
            settings: BTreeMap::new(),
        }
    }

    /// Path of the descriptor file for a deployment rooted at `dir`
    pub fn file_path(dir: &Utf8Path) -> Utf8PathBuf {
        dir.join(DESCRIPTOR_FILE_NAME)
    }

    /// Appends a directory to the start order, recording its argv
    pub fn push(&mut self, dir: Utf8PathBuf, start_cmd: Vec<String>) {
        self.settings.insert(dir.clone(), DirSettings { start_cmd });
        self.db_dirs.push(dir);
    }

    pub fn start_cmd(&self, dir: &Utf8Path) -> Option<&[String]> {
        self.settings.get(dir).map(|s| s.start_cmd.as_slice())
    }

    /// Loads the descriptor for the deployment rooted at `dir`
    pub fn load(dir: &Utf8Path) -> Result<Descriptor, Error> {
        let path = Descriptor::file_path(dir);
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NoDescriptor { path });
            }
            Err(e) => return Err(Error::io(path, e)),
        };
        serde_yaml::from_str(&contents)
            .map_err(|source| Error::DescriptorParse { path, source })
    }

    /// Writes the descriptor under `dir`
    pub fn store(&self, dir: &Utf8Path) -> Result<(), Error> {
        let path = Descriptor::file_path(dir);
        let contents = serde_yaml::to_string(self)
            .map_err(|source| Error::DescriptorEncode { path: path.clone(), source })?;
        std::fs::write(&path, contents).map_err(|e| Error::io(path, e))
    }
}
