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

//! Typed payloads that the machine produces for a client to send out.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::responses::{DeviceKeys, OlmEventContent, SignedOneTimeKey};

/// The body of a to-device request distributing Olm encrypted events.
///
/// The events are always of type `m.room.encrypted`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ToDevicePayload {
    /// The encrypted content, per user and device.
    pub messages: HashMap<String, HashMap<String, OlmEventContent>>,
}

impl ToDevicePayload {
    /// The number of devices the payload addresses.
    pub fn message_count(&self) -> usize {
        self.messages.values().map(|d| d.len()).sum()
    }

    /// Does the payload address any device at all.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub(crate) fn add_message(&mut self, user_id: &str, device_id: &str, content: OlmEventContent) {
        self.messages
            .entry(user_id.to_owned())
            .or_default()
            .insert(device_id.to_owned(), content);
    }
}

/// The body of a keys upload request.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysUploadRequest {
    /// Our own signed device keys, uploaded once after account creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_keys: Option<DeviceKeys>,
    /// Fresh signed one-time keys, keyed by `signed_curve25519:<key_id>`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub one_time_keys: BTreeMap<String, SignedOneTimeKey>,
}

impl KeysUploadRequest {
    /// Does the request carry anything worth uploading.
    pub fn is_empty(&self) -> bool {
        self.device_keys.is_none() && self.one_time_keys.is_empty()
    }
}
