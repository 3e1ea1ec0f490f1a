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

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use vodozemac::olm::{Account as InnerAccount, AccountPickle, PreKeyMessage, SessionConfig};
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey, KeyId};

use super::{canonical_json, Session};
use crate::error::{OlmError, SignatureError};

/// Account holding the identity keys of the local device.
///
/// An account is the starting point of every Olm session, it holds the long
/// lived identity keys as well as the pool of one-time keys that remote
/// devices use to establish sessions with us.
pub struct Account {
    inner: InnerAccount,
    user_id: String,
    device_id: String,
    shared: bool,
    uploaded_key_count: u64,
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("shared", &self.shared)
            .finish()
    }
}

impl Account {
    /// Create a fresh account with new identity keys.
    pub fn new(user_id: &str, device_id: &str) -> Self {
        Account {
            inner: InnerAccount::new(),
            user_id: user_id.to_owned(),
            device_id: device_id.to_owned(),
            shared: false,
            uploaded_key_count: 0,
        }
    }

    /// The unique user id that owns this account.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// The unique device id of the device that holds this account.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// The public curve25519 identity key of the account.
    pub fn curve25519_key(&self) -> Curve25519PublicKey {
        self.inner.curve25519_key()
    }

    /// The public ed25519 signing key of the account.
    pub fn ed25519_key(&self) -> Ed25519PublicKey {
        self.inner.ed25519_key()
    }

    /// Has the account been published to the server at least once.
    pub fn shared(&self) -> bool {
        self.shared
    }

    pub(crate) fn mark_as_shared(&mut self) {
        self.shared = true;
    }

    /// How many one-time keys does the server currently hold for us.
    pub fn uploaded_key_count(&self) -> u64 {
        self.uploaded_key_count
    }

    pub(crate) fn update_uploaded_key_count(&mut self, count: u64) {
        self.uploaded_key_count = count;
    }

    /// The maximum number of one-time keys the account can hold.
    pub fn max_one_time_keys(&self) -> usize {
        self.inner.max_number_of_one_time_keys()
    }

    /// How many one-time keys can still be published before the pool is
    /// full.
    pub fn one_time_keys_remaining(&self) -> u64 {
        (self.max_one_time_keys() as u64).saturating_sub(self.uploaded_key_count)
    }

    /// Generate `count` fresh one-time keys.
    ///
    /// The keys stay in the unpublished pool until
    /// [`mark_keys_as_published()`](Self::mark_keys_as_published) is called.
    pub fn generate_one_time_keys(&mut self, count: usize) {
        self.inner.generate_one_time_keys(count);
    }

    /// Get the unpublished one-time keys of the account.
    pub fn one_time_keys(&self) -> HashMap<KeyId, Curve25519PublicKey> {
        self.inner.one_time_keys()
    }

    /// Move the generated one-time keys into the published pool.
    ///
    /// Once keys are published the underlying pool reports zero unpublished
    /// keys and the private halves are released when the account is pickled
    /// next.
    pub fn mark_keys_as_published(&mut self) {
        self.inner.mark_keys_as_published();
    }

    /// Sign the given message with the ed25519 key of the account.
    pub fn sign(&self, message: &str) -> String {
        self.inner.sign(message).to_base64()
    }

    /// Convert a JSON value to the canonical representation and sign the JSON
    /// string.
    pub fn sign_json(&self, json: &Value) -> Result<String, SignatureError> {
        Ok(self.sign(&canonical_json(json)?))
    }

    /// Create a new outbound session with the device owning the given
    /// identity key, consuming one of its one-time keys.
    pub(crate) fn create_outbound_session(
        &self,
        identity_key: Curve25519PublicKey,
        one_time_key: Curve25519PublicKey,
    ) -> Session {
        let session =
            self.inner
                .create_outbound_session(SessionConfig::default(), identity_key, one_time_key);

        Session::new(session, &identity_key.to_base64())
    }

    /// Create a new inbound session from a pre-key message.
    ///
    /// Returns the session and the plaintext of the message that created it.
    pub(crate) fn create_inbound_session(
        &mut self,
        sender_key: &str,
        message: &PreKeyMessage,
    ) -> Result<(Session, String), OlmError> {
        let identity_key = Curve25519PublicKey::from_base64(sender_key)?;
        let result = self.inner.create_inbound_session(identity_key, message)?;

        let plaintext = String::from_utf8(result.plaintext)
            .map_err(|_| crate::error::EventError::InvalidPlaintext)?;

        Ok((Session::new(result.session, sender_key), plaintext))
    }

    /// Store the account as a pickle that can be persisted.
    pub fn pickle(&self) -> PickledAccount {
        PickledAccount {
            pickle: self.inner.pickle(),
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            shared: self.shared,
            uploaded_key_count: self.uploaded_key_count,
        }
    }

    /// Restore an account from a previously stored pickle.
    pub fn from_pickle(pickle: PickledAccount) -> Self {
        Account {
            inner: InnerAccount::from_pickle(pickle.pickle),
            user_id: pickle.user_id,
            device_id: pickle.device_id,
            shared: pickle.shared,
            uploaded_key_count: pickle.uploaded_key_count,
        }
    }
}

/// A pickled version of an [`Account`].
///
/// Holds all the information that needs to be stored in a database to restore
/// an account.
#[derive(Serialize, Deserialize)]
pub struct PickledAccount {
    /// The pickle of the underlying ratchet state.
    pub pickle: AccountPickle,
    /// The user id of the account owner.
    pub user_id: String,
    /// The device id of the account.
    pub device_id: String,
    /// Was the account already published to the server.
    pub shared: bool,
    /// How many one-time keys the server holds for the account.
    pub uploaded_key_count: u64,
}
