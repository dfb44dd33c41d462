// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Errors produced while provisioning or tearing down a deployment

use camino::Utf8PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("probing server version: {0}")]
    VersionProbe(String),

    #[error(
        "failed to start {label}: {reason}\n\
        recent output from {log_path}:\n{log_tail}"
    )]
    Spawn {
        label: String,
        reason: String,
        log_path: Utf8PathBuf,
        log_tail: String,
    },

    #[error("admin command {command:?} against {address} failed")]
    Probe {
        command: &'static str,
        address: String,
        #[source]
        source: mongodb::error::Error,
    },

    #[error(
        "{address} did not report PRIMARY or SECONDARY within {}s",
        .timeout.as_secs()
    )]
    ProvisionTimeout { address: String, timeout: Duration },

    #[error(
        "{label} (pid {pid}) did not exit within {}s of SIGTERM\n\
        recent output from {log_path}:\n{log_tail}",
        .timeout.as_secs()
    )]
    StopTimeout {
        label: String,
        pid: u32,
        timeout: Duration,
        log_path: Utf8PathBuf,
        log_tail: String,
    },

    #[error("router {router} rejected addShard for {shard}")]
    AddShard {
        router: String,
        shard: String,
        #[source]
        source: mongodb::error::Error,
    },

    #[error("sending {signal} to pid {pid}")]
    Signal {
        pid: u32,
        signal: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing deployment descriptor {path}")]
    DescriptorParse {
        path: Utf8PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("serializing deployment descriptor {path}")]
    DescriptorEncode {
        path: Utf8PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("no deployment descriptor found at {path}")]
    NoDescriptor { path: Utf8PathBuf },

    #[error("deployment already initialized ({path} exists)")]
    AlreadyInitialized { path: Utf8PathBuf },

    /// Wrapper applied to any error escaping `init`: the original error is
    /// preserved as the source and the tail of every server log in the
    /// deployment directory is appended for inspection.
    #[error("deployment init failed; server log excerpts follow\n{log_excerpts}")]
    WithServerLogs {
        #[source]
        source: Box<Error>,
        log_excerpts: String,
    },
}

impl Error {
    /// Shorthand for wrapping an `io::Error` with the path being operated on.
    pub(crate) fn io(path: impl Into<Utf8PathBuf>, source: std::io::Error) -> Error {
        Error::Io { path: path.into(), source }
    }
}
