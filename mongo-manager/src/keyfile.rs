// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared key file for intra-cluster authentication
//!
//! When auth is enabled on a replica set or sharded cluster, every member
//! authenticates to its peers with a shared secret passed via `--keyFile`.
//! The server requires the file to contain 6-1024 base64 characters and to be
//! readable only by its owner.

use crate::error::Error;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use camino::Utf8Path;
use rand::rngs::OsRng;
use rand::RngCore;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;

/// Name of the key file within the deployment directory
pub const KEY_FILE_NAME: &str = ".key";

// 96 random bytes encode to 128 base64 characters, comfortably inside the
// server's 6-1024 character limit.
const KEY_BYTES: usize = 96;

/// Writes a fresh random key to `path` with permissions restricted to the
/// owner (0600)
pub fn create_key(path: &Utf8Path) -> Result<(), Error> {
    let mut bytes = [0u8; KEY_BYTES];
    OsRng.fill_bytes(&mut bytes);
    let encoded = STANDARD.encode(bytes);

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(|e| Error::io(path, e))?;
    file.write_all(encoded.as_bytes()).map_err(|e| Error::io(path, e))?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::os::unix::fs::MetadataExt;

    #[test]
    fn test_create_key() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join(KEY_FILE_NAME);
        create_key(&path).expect("failed to create key file");

        let metadata = std::fs::metadata(&path).unwrap();
        assert_eq!(metadata.mode() & 0o777, 0o600);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.len() >= 6 && contents.len() <= 1024);
        STANDARD.decode(contents.as_bytes()).expect("key is not base64");

        // A second key must not repeat the first.
        let other = dir.path().join("other.key");
        create_key(&other).unwrap();
        assert_ne!(contents, std::fs::read_to_string(&other).unwrap());
    }
}
