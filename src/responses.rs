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

//! Typed views over the parsed, schema validated server responses that the
//! [`OlmMachine`] consumes.
//!
//! The machine doesn't talk to a homeserver itself, a client drives it by
//! handing over these structures and sending out whatever the machine
//! returns.
//!
//! [`OlmMachine`]: crate::OlmMachine

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use vodozemac::olm::OlmMessage;

use crate::error::EventError;
use crate::identities::KeyAlgorithm;

/// All the server responses the machine knows how to absorb.
#[derive(Clone, Debug)]
pub enum Response {
    /// The response to a keys upload request.
    KeysUpload(KeysUploadResponse),
    /// The response to a keys query request.
    KeysQuery(KeysQueryResponse),
    /// The response to a one-time key claim request.
    KeysClaim(KeysClaimResponse),
    /// The encryption relevant parts of a sync response.
    Sync(SyncResponse),
}

/// The response to a keys upload request.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysUploadResponse {
    /// How many keys the server holds for us, per key algorithm.
    #[serde(default)]
    pub one_time_key_counts: BTreeMap<String, u64>,
}

/// The response to a keys query request.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysQueryResponse {
    /// The signed device keys, per user and device.
    #[serde(default)]
    pub device_keys: HashMap<String, HashMap<String, DeviceKeys>>,
    /// Homeservers that could not be reached.
    #[serde(default)]
    pub failures: HashMap<String, Value>,
}

/// The response to a one-time key claim request.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysClaimResponse {
    /// The claimed one-time keys, per user, device and key id.
    #[serde(default)]
    pub one_time_keys: HashMap<String, HashMap<String, BTreeMap<String, SignedOneTimeKey>>>,
    /// Homeservers that could not be reached.
    #[serde(default)]
    pub failures: HashMap<String, Value>,
}

/// The parts of a sync response that the machine consumes.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SyncResponse {
    /// Messages that were sent directly to our device.
    #[serde(default)]
    pub to_device: ToDevice,
    /// How many one-time keys the server currently holds for us.
    #[serde(default)]
    pub device_one_time_keys_count: BTreeMap<String, u64>,
}

/// The to-device section of a sync response.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ToDevice {
    /// The to-device events of this sync.
    #[serde(default)]
    pub events: Vec<ToDeviceEvent>,
}

/// An event that was sent directly to our device rather than into a room
/// timeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToDeviceEvent {
    /// The user that sent the event.
    pub sender: String,
    /// The type of the event.
    #[serde(rename = "type")]
    pub event_type: String,
    /// The content of the event.
    pub content: Value,
}

/// The signed, published identity keys of a device.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceKeys {
    /// The id of the user the device belongs to.
    pub user_id: String,
    /// The id of the device.
    pub device_id: String,
    /// The encryption algorithms the device supports.
    pub algorithms: Vec<String>,
    /// The public keys of the device, keyed by `<algorithm>:<device_id>`.
    pub keys: BTreeMap<String, String>,
    /// The signatures over the canonical form of this object.
    pub signatures: BTreeMap<String, BTreeMap<String, String>>,
    /// Additional unsigned data, not covered by the signature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsigned: Option<UnsignedDeviceInfo>,
}

impl DeviceKeys {
    /// Get one of the public keys of the device.
    pub fn get_key(&self, algorithm: KeyAlgorithm) -> Option<&str> {
        self.keys
            .get(&format!("{}:{}", algorithm, self.device_id))
            .map(|k| k.as_str())
    }
}

/// The unsigned part of the published device keys.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnsignedDeviceInfo {
    /// The display name the owner gave the device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_display_name: Option<String>,
}

/// A signed curve25519 one-time key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedOneTimeKey {
    /// The public part of the one-time key.
    pub key: String,
    /// The signatures over the canonical form of this object.
    pub signatures: BTreeMap<String, BTreeMap<String, String>>,
}

/// The content of an `m.room.encrypted` event using the Olm algorithm.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OlmEventContent {
    /// The algorithm that was used to encrypt the event.
    pub algorithm: String,
    /// The curve25519 key of the sending device.
    pub sender_key: String,
    /// The ciphertexts, keyed by the curve25519 key of the recipient.
    pub ciphertext: BTreeMap<String, CiphertextInfo>,
}

/// A single Olm ciphertext and its message type.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CiphertextInfo {
    /// The type of the message, 0 for a pre-key message, 1 for a normal one.
    #[serde(rename = "type")]
    pub message_type: u8,
    /// The base64 encoded ciphertext.
    pub body: String,
}

impl CiphertextInfo {
    /// Convert the wire form into a vodozemac message.
    pub(crate) fn to_message(&self) -> Result<OlmMessage, EventError> {
        match self.message_type {
            0 => vodozemac::olm::PreKeyMessage::from_base64(&self.body)
                .map(OlmMessage::PreKey)
                .map_err(|_| EventError::UnsupportedOlmType),
            1 => vodozemac::olm::Message::from_base64(&self.body)
                .map(OlmMessage::Normal)
                .map_err(|_| EventError::UnsupportedOlmType),
            _ => Err(EventError::UnsupportedOlmType),
        }
    }
}

impl From<&OlmMessage> for CiphertextInfo {
    fn from(message: &OlmMessage) -> Self {
        match message {
            OlmMessage::PreKey(m) => CiphertextInfo { message_type: 0, body: m.to_base64() },
            OlmMessage::Normal(m) => CiphertextInfo { message_type: 1, body: m.to_base64() },
        }
    }
}

/// The content of an `m.room.encrypted` event using the Megolm algorithm.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MegolmEventContent {
    /// The algorithm that was used to encrypt the event.
    pub algorithm: String,
    /// The curve25519 key of the sending device.
    pub sender_key: String,
    /// The base64 encoded ciphertext.
    pub ciphertext: String,
    /// The id of the group session that encrypted the event.
    pub session_id: String,
    /// The id of the sending device.
    pub device_id: String,
}

/// An encrypted event from a room timeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MegolmEvent {
    /// The user that sent the event.
    pub sender: String,
    /// The room the event was sent in.
    pub room_id: String,
    /// The encrypted content.
    pub content: MegolmEventContent,
}

/// The plaintext payload carried inside an Olm encrypted to-device event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DecryptedOlmEvent {
    /// The user that encrypted the event.
    pub sender: String,
    /// The device that encrypted the event.
    pub sender_device: String,
    /// The long term keys of the sending device.
    pub keys: OlmEventKeys,
    /// The user the event was encrypted for.
    pub recipient: String,
    /// The long term keys the sender believes the recipient to have.
    pub recipient_keys: OlmEventKeys,
    /// The type of the carried event.
    #[serde(rename = "type")]
    pub event_type: String,
    /// The content of the carried event.
    pub content: Value,
}

/// The ed25519 keys embedded in an Olm event payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OlmEventKeys {
    /// The long term ed25519 key of a device.
    pub ed25519: String,
}

/// The content of an `m.room_key` event, carrying a Megolm session key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoomKeyContent {
    /// The algorithm the exported session uses.
    pub algorithm: String,
    /// The room the session belongs to.
    pub room_id: String,
    /// The unique id of the session.
    pub session_id: String,
    /// The exported session key.
    pub session_key: String,
    /// The ratchet index the key was exported at.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_index: Option<u32>,
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::{CiphertextInfo, DeviceKeys, KeysQueryResponse};
    use crate::identities::KeyAlgorithm;

    #[test]
    fn device_keys_deserialization() {
        let json = json!({
            "user_id": "@alice:example.org",
            "device_id": "JLAFKJWSCS",
            "algorithms": ["m.olm.v1.curve25519-aes-sha2", "m.megolm.v1.aes-sha2"],
            "keys": {
                "curve25519:JLAFKJWSCS": "wjLpTLRqbqBzLs63aYaEv2Boi6cFEbbM/sSRQ2oAKk4",
                "ed25519:JLAFKJWSCS": "nE6W2fCblxDcOFmeEtCHNl8/l8bXcu7GKyAswA4r3mM"
            },
            "signatures": {
                "@alice:example.org": {
                    "ed25519:JLAFKJWSCS": "dSO80A01XiigH3uBiDVx/EjzaoycHcjq9lfQX0uWsqxl2giMIiSPR8a4d291W1ihKJL/a+myXS367WT6NAIcBA"
                }
            },
            "unsigned": {
                "device_display_name": "Alice's mobile phone"
            }
        });

        let device_keys: DeviceKeys = serde_json::from_value(json).unwrap();

        assert_eq!(
            device_keys.get_key(KeyAlgorithm::Ed25519),
            Some("nE6W2fCblxDcOFmeEtCHNl8/l8bXcu7GKyAswA4r3mM")
        );
        assert_eq!(
            device_keys.unsigned.unwrap().device_display_name.as_deref(),
            Some("Alice's mobile phone")
        );
    }

    #[test]
    fn missing_sections_default_to_empty() {
        let response: KeysQueryResponse = serde_json::from_value(json!({})).unwrap();
        assert!(response.device_keys.is_empty());
        assert!(response.failures.is_empty());
    }

    #[test]
    fn unknown_olm_message_types_are_rejected() {
        let info = CiphertextInfo { message_type: 2, body: "AAAA".to_owned() };
        assert!(info.to_message().is_err());
    }
}
