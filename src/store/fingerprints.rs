// Copyright 2020 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::warn;

use super::Result;
use crate::identities::{Device, KeyAlgorithm};

/// A long term public key a user accepted for a specific device.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    /// The id of the user owning the device.
    pub user_id: String,
    /// The id of the device.
    pub device_id: String,
    /// The algorithm of the accepted key.
    pub algorithm: KeyAlgorithm,
    /// The accepted public key.
    pub public_key: String,
}

impl Fingerprint {
    /// Create a fingerprint record for the ed25519 key of the given device.
    pub fn from_device(device: &Device) -> Self {
        Fingerprint {
            user_id: device.user_id().to_owned(),
            device_id: device.device_id().to_owned(),
            algorithm: KeyAlgorithm::Ed25519,
            public_key: device.ed25519().to_owned(),
        }
    }

    fn from_line(line: &str) -> Option<Self> {
        let fields: Vec<&str> = line.split_whitespace().collect();

        let [user_id, device_id, algorithm, public_key] = fields.as_slice() else {
            return None;
        };

        let algorithm: KeyAlgorithm = algorithm.parse().ok()?;

        Some(Fingerprint {
            user_id: (*user_id).to_owned(),
            device_id: (*device_id).to_owned(),
            algorithm,
            public_key: (*public_key).to_owned(),
        })
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.user_id, self.device_id, self.algorithm, self.public_key
        )
    }
}

/// Persistent set of fingerprints the user accepted.
///
/// The set is kept in a line-oriented text file, one record per line. Every
/// mutation rewrites the file through a sibling temporary path that is
/// renamed over the original once the write succeeded, a failed write leaves
/// the previous contents in place.
#[derive(Debug, Default)]
pub struct FingerprintStore {
    path: Option<PathBuf>,
    keys: HashSet<Fingerprint>,
}

impl FingerprintStore {
    /// Create a volatile fingerprint store that isn't backed by a file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the fingerprint store at the given path, creating it if it
    /// doesn't exist yet.
    ///
    /// Lines that can't be parsed as a fingerprint record are skipped.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut keys = HashSet::new();

        if path.is_file() {
            for line in fs::read_to_string(&path)?.lines() {
                let line = line.trim();

                if line.is_empty() || line.starts_with('#') {
                    continue;
                }

                match Fingerprint::from_line(line) {
                    Some(key) => {
                        keys.insert(key);
                    }
                    None => warn!("Skipping malformed fingerprint entry {}", line),
                }
            }
        }

        Ok(FingerprintStore { path: Some(path), keys })
    }

    /// Add a fingerprint to the store.
    ///
    /// Returns true if the fingerprint wasn't present before.
    pub fn add(&mut self, key: Fingerprint) -> Result<bool> {
        if !self.keys.insert(key) {
            return Ok(false);
        }

        self.save()?;
        Ok(true)
    }

    /// Remove a fingerprint from the store.
    ///
    /// Returns true if the fingerprint was present.
    pub fn remove(&mut self, key: &Fingerprint) -> Result<bool> {
        if !self.keys.remove(key) {
            return Ok(false);
        }

        self.save()?;
        Ok(true)
    }

    /// Is the given fingerprint present in the store.
    pub fn check(&self, key: &Fingerprint) -> bool {
        self.keys.contains(key)
    }

    /// Is the given fingerprint present in the store.
    pub fn contains(&self, key: &Fingerprint) -> bool {
        self.check(key)
    }

    fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let temporary_path = path.with_extension("tmp");

        {
            let mut file = fs::File::create(&temporary_path)?;
            writeln!(file, "# This file is managed by the library, do not edit.")?;

            for key in &self.keys {
                writeln!(file, "{key}")?;
            }

            file.sync_all()?;
        }

        fs::rename(&temporary_path, path)?;

        Ok(())
    }
}
