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

use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use vodozemac::olm::{OlmMessage, PreKeyMessage, Session as InnerSession, SessionPickle};

use super::{canonical_json, Account};
use crate::error::{EventError, OlmResult};
use crate::identities::Device;
use crate::responses::{CiphertextInfo, OlmEventContent};

/// Cryptographic session that enables secure communication between two
/// devices.
pub struct Session {
    inner: InnerSession,
    session_id: String,
    sender_key: String,
    creation_time: SystemTime,
    last_use_time: SystemTime,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id())
            .field("sender_key", &self.sender_key)
            .finish()
    }
}

impl Session {
    /// Wrap a fresh ratchet state that communicates with the device owning
    /// the given curve25519 key.
    pub(crate) fn new(inner: InnerSession, sender_key: &str) -> Self {
        let session_id = inner.session_id().to_owned();
        let now = SystemTime::now();

        Session {
            inner,
            session_id,
            sender_key: sender_key.to_owned(),
            creation_time: now,
            last_use_time: now,
        }
    }

    /// Returns the unique identifier for this session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The curve25519 key of the device on the other end of this session.
    pub fn sender_key(&self) -> &str {
        &self.sender_key
    }

    /// The time the session was created at.
    pub fn creation_time(&self) -> SystemTime {
        self.creation_time
    }

    /// Check if a pre-key message was encrypted for this session.
    ///
    /// # Arguments
    ///
    /// * `message` - The pre-key Olm message that should be checked.
    pub fn matches(&self, message: &PreKeyMessage) -> bool {
        message.session_id() == self.session_id
    }

    /// Decrypt the given Olm message.
    ///
    /// Returns the decrypted plaintext or an error if decryption failed.
    ///
    /// # Arguments
    ///
    /// * `message` - The Olm message that should be decrypted.
    pub fn decrypt(&mut self, message: &OlmMessage) -> OlmResult<String> {
        let plaintext = self.inner.decrypt(message)?;
        self.last_use_time = SystemTime::now();

        Ok(String::from_utf8(plaintext).map_err(|_| EventError::InvalidPlaintext)?)
    }

    /// Encrypt the given event as an `m.room.encrypted` event content for
    /// the given device.
    ///
    /// The plaintext is wrapped into the standard Olm payload naming the
    /// sender, the recipient and both of their long term keys, so the
    /// receiving side can detect messages that were forwarded to the wrong
    /// device.
    pub fn encrypt(
        &mut self,
        account: &Account,
        recipient_device: &Device,
        event_type: &str,
        content: Value,
    ) -> OlmResult<OlmEventContent> {
        let payload = json!({
            "sender": account.user_id(),
            "sender_device": account.device_id(),
            "keys": {
                "ed25519": account.ed25519_key().to_base64(),
            },
            "recipient": recipient_device.user_id(),
            "recipient_keys": {
                "ed25519": recipient_device.ed25519(),
            },
            "type": event_type,
            "content": content,
        });

        let plaintext = canonical_json(&payload).map_err(|_| EventError::InvalidPlaintext)?;

        let message = self.inner.encrypt(&plaintext);
        self.last_use_time = SystemTime::now();

        let mut ciphertext = BTreeMap::new();
        ciphertext.insert(
            recipient_device.curve25519().to_owned(),
            CiphertextInfo::from(&message),
        );

        Ok(OlmEventContent {
            algorithm: crate::OLM_ALGORITHM.to_owned(),
            sender_key: account.curve25519_key().to_base64(),
            ciphertext,
        })
    }

    /// Store the session as a pickle that can be persisted.
    pub fn pickle(&self) -> PickledSession {
        PickledSession {
            pickle: self.inner.pickle(),
            sender_key: self.sender_key.clone(),
            creation_time: self.creation_time,
            last_use_time: self.last_use_time,
        }
    }

    /// Restore a session from a previously stored pickle.
    pub fn from_pickle(pickle: PickledSession) -> Self {
        let inner = InnerSession::from_pickle(pickle.pickle);
        let session_id = inner.session_id().to_owned();

        Session {
            inner,
            session_id,
            sender_key: pickle.sender_key,
            creation_time: pickle.creation_time,
            last_use_time: pickle.last_use_time,
        }
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.session_id() == other.session_id()
    }
}

/// A pickled version of a [`Session`].
///
/// Holds all the information that needs to be stored in a database to restore
/// a session.
#[derive(Serialize, Deserialize)]
pub struct PickledSession {
    /// The pickle of the underlying ratchet state.
    pub pickle: SessionPickle,
    /// The curve25519 key of the device on the other end of the session.
    pub sender_key: String,
    /// The timestamp that marks when the session was created.
    pub creation_time: SystemTime,
    /// The timestamp that marks when the session was last used to encrypt or
    /// decrypt a message.
    pub last_use_time: SystemTime,
}
