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

use serde::{Deserialize, Serialize};
use serde_json::Value;
use vodozemac::megolm::{
    InboundGroupSession as InnerSession, InboundGroupSessionPickle, MegolmMessage, SessionConfig,
    SessionKey,
};
use zeroize::Zeroizing;

use crate::error::{EventError, MegolmResult};
use crate::responses::MegolmEventContent;

/// Inbound group session.
///
/// Inbound group sessions are used to decrypt the room messages that a single
/// sending device encrypted with the matching outbound session.
pub struct InboundGroupSession {
    inner: InnerSession,
    session_id: String,
    sender_key: String,
    signing_key: String,
    room_id: String,
    first_known_index: u32,
}

impl InboundGroupSession {
    /// Create a new inbound group session for the given room.
    ///
    /// # Arguments
    ///
    /// * `sender_key` - The public curve25519 key of the account that sent us
    ///   the session.
    ///
    /// * `signing_key` - The public ed25519 key of the account that sent us
    ///   the session.
    ///
    /// * `room_id` - The id of the room that the session is used in.
    ///
    /// * `session_key` - The session key that was exported from the matching
    ///   outbound group session.
    pub fn new(
        sender_key: &str,
        signing_key: &str,
        room_id: &str,
        session_key: &SessionKey,
    ) -> Self {
        let session = InnerSession::new(session_key, SessionConfig::default());
        let session_id = session.session_id().to_owned();
        let first_known_index = session.first_known_index();

        InboundGroupSession {
            inner: session,
            session_id,
            sender_key: sender_key.to_owned(),
            signing_key: signing_key.to_owned(),
            room_id: room_id.to_owned(),
            first_known_index,
        }
    }

    /// Create an inbound group session from a received, base64 encoded
    /// session key.
    pub fn from_key_export(
        sender_key: &str,
        signing_key: &str,
        room_id: &str,
        session_key: &str,
    ) -> MegolmResult<Self> {
        let session_key = Zeroizing::new(session_key.to_owned());
        let session_key = SessionKey::from_base64(&session_key)?;

        Ok(Self::new(sender_key, signing_key, room_id, &session_key))
    }

    /// Returns the unique identifier for this session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Get the sender key that this session was received from.
    pub fn sender_key(&self) -> &str {
        &self.sender_key
    }

    /// Get the ed25519 key the session sender claimed to own.
    pub fn signing_key(&self) -> &str {
        &self.signing_key
    }

    /// The room where this session is used in.
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Get the first message index we know how to decrypt.
    pub fn first_known_index(&self) -> u32 {
        self.first_known_index
    }

    /// Decrypt the ciphertext of an `m.room.encrypted` event content.
    ///
    /// Returns the decrypted plaintext event and the ratchet index the
    /// message was encrypted at. Decrypting an index that was already seen
    /// reuses the stored message keys without advancing the session.
    pub fn decrypt(&mut self, content: &MegolmEventContent) -> MegolmResult<(Value, u32)> {
        let message = MegolmMessage::from_base64(&content.ciphertext)?;
        let decrypted = self.inner.decrypt(&message)?;

        let plaintext = String::from_utf8(decrypted.plaintext)
            .map_err(|_| EventError::InvalidPlaintext)?;

        Ok((serde_json::from_str(&plaintext)?, decrypted.message_index))
    }

    /// Store the session as a pickle that can be persisted.
    pub fn pickle(&self) -> PickledInboundGroupSession {
        PickledInboundGroupSession {
            pickle: self.inner.pickle(),
            sender_key: self.sender_key.clone(),
            signing_key: self.signing_key.clone(),
            room_id: self.room_id.clone(),
        }
    }

    /// Restore a session from a previously stored pickle.
    pub fn from_pickle(pickle: PickledInboundGroupSession) -> Self {
        let inner = InnerSession::from_pickle(pickle.pickle);
        let session_id = inner.session_id().to_owned();
        let first_known_index = inner.first_known_index();

        InboundGroupSession {
            inner,
            session_id,
            sender_key: pickle.sender_key,
            signing_key: pickle.signing_key,
            room_id: pickle.room_id,
            first_known_index,
        }
    }
}

impl fmt::Debug for InboundGroupSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundGroupSession")
            .field("session_id", &self.session_id())
            .field("room_id", &self.room_id)
            .finish()
    }
}

impl PartialEq for InboundGroupSession {
    fn eq(&self, other: &Self) -> bool {
        self.session_id() == other.session_id()
    }
}

/// A pickled version of an [`InboundGroupSession`].
///
/// Holds all the information that needs to be stored in a database to restore
/// an InboundGroupSession.
#[derive(Serialize, Deserialize)]
pub struct PickledInboundGroupSession {
    /// The pickle of the underlying ratchet state.
    pub pickle: InboundGroupSessionPickle,
    /// The public curve25519 key of the account that sent us the session.
    pub sender_key: String,
    /// The public ed25519 key of the account that sent us the session.
    pub signing_key: String,
    /// The id of the room that the session is used in.
    pub room_id: String,
}
