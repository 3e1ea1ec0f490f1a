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

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SignatureError;
use crate::responses::DeviceKeys;

/// The local trust state of a device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalTrust {
    /// The device has been verified by the user.
    Verified,
    /// The device has been blacklisted, no room keys will be shared with it.
    BlackListed,
    /// The device is ignored, it takes part in shares but is reported
    /// separately.
    Ignored,
    /// The user hasn't decided about the device yet.
    #[default]
    Unset,
}

/// The algorithm of a public key that a device advertises.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyAlgorithm {
    /// The long term ed25519 signing key of a device.
    Ed25519,
    /// The curve25519 key used as a ratchet input.
    Curve25519,
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KeyAlgorithm::Ed25519 => "ed25519",
            KeyAlgorithm::Curve25519 => "curve25519",
        };
        write!(f, "{name}")
    }
}

impl FromStr for KeyAlgorithm {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ed25519" => Ok(KeyAlgorithm::Ed25519),
            "curve25519" => Ok(KeyAlgorithm::Curve25519),
            _ => Err(()),
        }
    }
}

/// A device represents an E2EE capable client of a user.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Device {
    user_id: String,
    device_id: String,
    ed25519: String,
    curve25519: String,
    algorithms: Vec<String>,
    display_name: Option<String>,
    deleted: bool,
    trust_state: LocalTrust,
}

impl Device {
    /// Create a new device record from its identity keys.
    pub fn new(user_id: &str, device_id: &str, ed25519: &str, curve25519: &str) -> Self {
        Device {
            user_id: user_id.to_owned(),
            device_id: device_id.to_owned(),
            ed25519: ed25519.to_owned(),
            curve25519: curve25519.to_owned(),
            algorithms: vec![
                crate::OLM_ALGORITHM.to_owned(),
                crate::MEGOLM_ALGORITHM.to_owned(),
            ],
            display_name: None,
            deleted: false,
            trust_state: LocalTrust::Unset,
        }
    }

    /// Create a device record from the signed device keys of a keys query
    /// response.
    ///
    /// This only converts the wire form, it does not verify the self
    /// signature.
    pub(crate) fn from_keys(device_keys: &DeviceKeys) -> Result<Self, SignatureError> {
        let ed25519 = device_keys
            .get_key(KeyAlgorithm::Ed25519)
            .ok_or(SignatureError::MissingSigningKey)?;
        let curve25519 = device_keys
            .get_key(KeyAlgorithm::Curve25519)
            .ok_or(SignatureError::MissingSigningKey)?;

        Ok(Device {
            user_id: device_keys.user_id.clone(),
            device_id: device_keys.device_id.clone(),
            ed25519: ed25519.to_owned(),
            curve25519: curve25519.to_owned(),
            algorithms: device_keys.algorithms.clone(),
            display_name: device_keys
                .unsigned
                .as_ref()
                .and_then(|u| u.device_display_name.clone()),
            deleted: false,
            trust_state: LocalTrust::Unset,
        })
    }

    /// The unique id of the user that owns the device.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// The unique id of the device.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// The long term ed25519 fingerprint key of the device.
    pub fn ed25519(&self) -> &str {
        &self.ed25519
    }

    /// The curve25519 key the device uses to establish Olm sessions.
    pub fn curve25519(&self) -> &str {
        &self.curve25519
    }

    /// The human readable name of the device, if any was advertised.
    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    /// Has the device been deleted, either by the server or because its
    /// fingerprint changed.
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub(crate) fn mark_as_deleted(&mut self) {
        self.deleted = true;
    }

    /// Get the local trust state the user decided on for this device.
    pub fn trust_state(&self) -> LocalTrust {
        self.trust_state
    }

    pub(crate) fn set_trust_state(&mut self, state: LocalTrust) {
        self.trust_state = state;
    }

    /// Is the device considered to be verified.
    pub fn is_verified(&self) -> bool {
        self.trust_state == LocalTrust::Verified
    }

    /// Is the device considered to be blacklisted.
    pub fn is_blacklisted(&self) -> bool {
        self.trust_state == LocalTrust::BlackListed
    }
}

impl PartialEq for Device {
    /// Devices are compared by identity, the trust state and the deletion
    /// marker don't take part in the comparison.
    fn eq(&self, other: &Self) -> bool {
        self.user_id == other.user_id
            && self.device_id == other.device_id
            && self.ed25519 == other.ed25519
            && self.curve25519 == other.curve25519
    }
}

impl Eq for Device {}
