// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Provision and manage local MongoDB deployments for testing
//!
//! This crate brings up a standalone server, a replica set, or a sharded
//! cluster (config server + shards + routers) on localhost, in the right
//! dependency order, optionally with authentication; records what it started
//! in a descriptor file; and tears the deployment down again in reverse
//! order from a cold process.  It is a development and test facility, not a
//! production cluster manager: nothing is supervised, restarted, or deployed
//! across hosts.
//!
//! The usual entry point is [`Deployment`], built from [`Options`]:
//!
//! ```no_run
//! # async fn example() -> Result<(), mongo_manager::Error> {
//! use mongo_manager::{Deployment, Options};
//!
//! let mut options = Options::new("/tmp/my-cluster");
//! options.replica_set = Some(String::from("rs0"));
//! let log = slog::Logger::root(slog::Discard, slog::o!());
//! let deployment = Deployment::new(options, log)?;
//! deployment.init().await?;
//! // ... run tests against localhost:27017-27019 ...
//! deployment.stop().await?;
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate slog;

pub mod deployment;
pub mod descriptor;
mod error;
pub mod keyfile;
pub mod options;
pub mod plan;
pub mod poll;
pub mod probe;
pub mod spawn;
pub mod version;

pub use deployment::Deployment;
pub use error::Error;
pub use options::Options;
