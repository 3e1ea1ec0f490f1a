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

use std::cmp::max;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use vodozemac::megolm::{GroupSession as InnerSession, SessionConfig, SessionKey};

use crate::responses::{MegolmEventContent, RoomKeyContent};

const ROTATION_PERIOD: Duration = Duration::from_millis(604800000);
const ROTATION_MESSAGES: u64 = 100;

/// Settings that control how group sessions behave.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EncryptionSettings {
    /// How long a session should be used before changing it.
    pub rotation_period: Duration,
    /// How many messages should be sent before changing the session.
    pub rotation_period_msgs: u64,
    /// Should devices the user decided to ignore still receive the room key.
    ///
    /// When this is disabled ignored devices are skipped the same way
    /// blacklisted ones are.
    pub share_with_ignored_devices: bool,
}

impl Default for EncryptionSettings {
    fn default() -> Self {
        Self {
            rotation_period: ROTATION_PERIOD,
            rotation_period_msgs: ROTATION_MESSAGES,
            share_with_ignored_devices: true,
        }
    }
}

/// Outbound group session.
///
/// Outbound group sessions are used to encrypt room messages for a group of
/// participants. The corresponding [`InboundGroupSession`] is distributed to
/// every participating device over Olm.
///
/// [`InboundGroupSession`]: super::InboundGroupSession
pub struct OutboundGroupSession {
    inner: InnerSession,
    session_id: String,
    room_id: String,
    device_id: String,
    sender_key: String,
    creation_time: Instant,
    message_count: u64,
    settings: EncryptionSettings,
    shared_with_set: HashMap<String, HashSet<String>>,
}

impl OutboundGroupSession {
    /// Create a new outbound group session for the given room.
    ///
    /// # Arguments
    ///
    /// * `device_id` - The id of the device that creates the session, our own
    ///   device id.
    ///
    /// * `sender_key` - The curve25519 key of the account that creates the
    ///   session, our own identity key.
    ///
    /// * `room_id` - The id of the room that the session is used in.
    ///
    /// * `settings` - Settings determining the rotation period of the
    ///   session.
    pub fn new(
        device_id: &str,
        sender_key: &str,
        room_id: &str,
        settings: EncryptionSettings,
    ) -> Self {
        let session = InnerSession::new(SessionConfig::default());
        let session_id = session.session_id().to_owned();

        OutboundGroupSession {
            inner: session,
            session_id,
            room_id: room_id.to_owned(),
            device_id: device_id.to_owned(),
            sender_key: sender_key.to_owned(),
            creation_time: Instant::now(),
            message_count: 0,
            settings,
            shared_with_set: HashMap::new(),
        }
    }

    /// Returns the unique identifier for this session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Get the room id of the room this session belongs to.
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Get the number of messages the session has already encrypted.
    pub fn message_count(&self) -> u64 {
        self.message_count
    }

    /// Get the current message index of the ratchet.
    ///
    /// Each message is sent with an increasing index. This returns the
    /// message index that will be used for the next encrypted message.
    pub fn message_index(&self) -> u32 {
        self.inner.message_index()
    }

    /// Get the session key of this session.
    ///
    /// A session key can be used to create an inbound group session that
    /// decrypts from the current ratchet index onwards.
    pub fn session_key(&self) -> SessionKey {
        self.inner.session_key()
    }

    /// Check if the session has expired and should be rotated.
    ///
    /// A session expires after some time or after enough messages have been
    /// encrypted using it, whichever comes first.
    pub fn expired(&self) -> bool {
        self.expired_at(Instant::now())
    }

    /// Check if the session counts as expired at the given point in time.
    pub fn expired_at(&self, now: Instant) -> bool {
        // The rotation period isn't sanity checked anywhere else, so clamp it
        // to an hour.
        let rotation_period = max(self.settings.rotation_period, Duration::from_secs(3600));

        self.message_count >= self.settings.rotation_period_msgs
            || now.saturating_duration_since(self.creation_time) >= rotation_period
    }

    /// Encrypt a room event with the given type and content.
    ///
    /// # Arguments
    ///
    /// * `event_type` - The type of the plaintext event.
    ///
    /// * `content` - The content of the event that should be encrypted.
    pub fn encrypt(&mut self, event_type: &str, content: &Value) -> MegolmEventContent {
        let payload = json!({
            "room_id": self.room_id,
            "type": event_type,
            "content": content,
        });

        let message = self.inner.encrypt(payload.to_string());
        self.message_count += 1;

        MegolmEventContent {
            algorithm: crate::MEGOLM_ALGORITHM.to_owned(),
            sender_key: self.sender_key.clone(),
            ciphertext: message.to_base64(),
            session_id: self.session_id.clone(),
            device_id: self.device_id.clone(),
        }
    }

    /// Get the session key as an `m.room_key` event content that can be
    /// encrypted for the participating devices.
    pub fn as_room_key_content(&self) -> RoomKeyContent {
        RoomKeyContent {
            algorithm: crate::MEGOLM_ALGORITHM.to_owned(),
            room_id: self.room_id.clone(),
            session_id: self.session_id.clone(),
            session_key: self.session_key().to_base64(),
            chain_index: Some(self.message_index()),
        }
    }

    /// Has the session been shared with the given device.
    pub fn is_shared_with(&self, user_id: &str, device_id: &str) -> bool {
        self.shared_with_set
            .get(user_id)
            .map(|d| d.contains(device_id))
            .unwrap_or(false)
    }

    /// Mark that the session key was handed out to the given device.
    pub(crate) fn mark_shared_with(&mut self, user_id: &str, device_id: &str) {
        self.shared_with_set
            .entry(user_id.to_owned())
            .or_default()
            .insert(device_id.to_owned());
    }
}

impl fmt::Debug for OutboundGroupSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundGroupSession")
            .field("session_id", &self.session_id)
            .field("room_id", &self.room_id)
            .field("message_count", &self.message_count)
            .finish()
    }
}
