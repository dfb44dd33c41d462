// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Detecting the version of the `mongod` binary
//!
//! Several planning decisions hang off the server version: whether the config
//! server may run as a replica set and which TLS flag family the server
//! understands.  The version is probed once per `init` by running
//! `mongod --version` and parsing the `db version vX.Y.Z` line it prints.

use crate::error::Error;
use camino::Utf8Path;
use std::fmt;

const VERSION_LINE_PREFIX: &str = "db version v";

/// A three-part MongoDB server version, ordered lexicographically
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ServerVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ServerVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> ServerVersion {
        ServerVersion { major, minor, patch }
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Runs `mongod --version` and parses the reported server version
///
/// The binary path must not contain whitespace.  This is rejected before
/// anything is executed rather than left to produce a confusing downstream
/// failure when the recorded argv is split back into words.
pub async fn detect(mongod: &Utf8Path) -> Result<ServerVersion, Error> {
    if mongod.as_str().contains(char::is_whitespace) {
        return Err(Error::VersionProbe(format!(
            "path to mongod ({:?}) must not contain whitespace",
            mongod
        )));
    }

    let output = tokio::process::Command::new(mongod.as_std_path())
        .arg("--version")
        .output()
        .await
        .map_err(|e| {
            Error::VersionProbe(format!(
                "running {:?} (is the binary installed and on your PATH?): {}",
                mongod, e
            ))
        })?;

    if !output.status.success() {
        return Err(Error::VersionProbe(format!(
            "{:?} --version exited with {}",
            mongod, output.status
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_version_output(&stdout).ok_or_else(|| {
        Error::VersionProbe(format!(
            "no \"{}X.Y.Z\" line in output of {:?} --version",
            VERSION_LINE_PREFIX, mongod
        ))
    })
}

/// Parses the first `db version vX.Y.Z` occurrence in `--version` output
pub fn parse_version_output(stdout: &str) -> Option<ServerVersion> {
    for line in stdout.lines() {
        if let Some(start) = line.find(VERSION_LINE_PREFIX) {
            let rest = &line[start + VERSION_LINE_PREFIX.len()..];
            if let Some(version) = parse_three_part(rest) {
                return Some(version);
            }
        }
    }
    None
}

// Accepts "X.Y.Z" with anything after the patch digits (e.g. "-rc0").
fn parse_three_part(s: &str) -> Option<ServerVersion> {
    let mut parts = s.splitn(3, '.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch_digits: String = parts
        .next()?
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    let patch = patch_digits.parse().ok()?;
    Some(ServerVersion::new(major, minor, patch))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_version_output() {
        let stdout = "db version v7.0.14\n\
            Build Info: {\n    \"version\": \"7.0.14\",\n\
            \"gitVersion\": \"ce59cfc6a3c5e5c067dca0d30697edd68d4f5188\"\n}\n";
        assert_eq!(
            parse_version_output(stdout),
            Some(ServerVersion::new(7, 0, 14))
        );

        let old = "db version v3.2.22\ngit version: abc\n";
        assert_eq!(parse_version_output(old), Some(ServerVersion::new(3, 2, 22)));

        let rc = "db version v4.2.0-rc5\n";
        assert_eq!(parse_version_output(rc), Some(ServerVersion::new(4, 2, 0)));

        assert_eq!(parse_version_output("no version here\n"), None);
        assert_eq!(parse_version_output("db version vgarbage\n"), None);
    }

    #[test]
    fn test_version_ordering() {
        assert!(ServerVersion::new(3, 4, 0) > ServerVersion::new(3, 2, 22));
        assert!(ServerVersion::new(4, 2, 0) > ServerVersion::new(4, 0, 28));
        assert!(ServerVersion::new(10, 0, 0) > ServerVersion::new(9, 9, 9));
        assert_eq!(ServerVersion::new(3, 4, 0), ServerVersion::new(3, 4, 0));
    }

    #[tokio::test]
    async fn test_detect_rejects_whitespace_path() {
        let error = detect(Utf8Path::new("/opt/my tools/mongod"))
            .await
            .expect_err("path with whitespace unexpectedly accepted");
        let message = error.to_string();
        assert!(message.contains("whitespace"), "message was: {}", message);
    }

    #[tokio::test]
    async fn test_detect_missing_binary() {
        let error = detect(Utf8Path::new("/nonexistent/mongod"))
            .await
            .expect_err("nonexistent binary unexpectedly probed");
        assert!(matches!(error, Error::VersionProbe(_)));
    }
}
