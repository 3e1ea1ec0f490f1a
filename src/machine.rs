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

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use serde_json::{json, Value};
use tracing::{debug, info, warn};
use vodozemac::olm::OlmMessage;
use vodozemac::Curve25519PublicKey;

use crate::error::{EventError, MegolmError, MegolmResult, OlmError, OlmResult, ShareError};
use crate::identities::{Device, KeyAlgorithm, LocalTrust};
use crate::olm::{
    verify_json, Account, EncryptionSettings, InboundGroupSession, OutboundGroupSession,
};
use crate::requests::{KeysUploadRequest, ToDevicePayload};
use crate::responses::{
    DecryptedOlmEvent, DeviceKeys, KeysClaimResponse, KeysQueryResponse, KeysUploadResponse,
    MegolmEvent, MegolmEventContent, OlmEventContent, Response, SignedOneTimeKey, SyncResponse,
    ToDeviceEvent,
};
use crate::store::{
    CryptoStore, DeviceStore, Fingerprint, FingerprintStore, GroupSessionStore, MemoryStore,
    SessionStore, SledStore,
};
use crate::{MEGOLM_ALGORITHM, OLM_ALGORITHM};

const ONE_TIME_KEY_ALGORITHM: &str = "signed_curve25519";
const ROOM_KEY_TYPE: &str = "m.room_key";
const ROOM_ENCRYPTED_TYPE: &str = "m.room.encrypted";

/// State machine implementation of the Olm/Megolm encryption protocol.
///
/// The machine is strictly sans-I/O, it consumes parsed server responses and
/// produces payloads that the caller is expected to send out. Every mutation
/// is persisted through the configured [`CryptoStore`] before the operation
/// returns.
pub struct OlmMachine {
    /// The unique user id that owns this machine.
    user_id: String,
    /// The unique device id of the device that holds this machine.
    device_id: String,
    /// Our underlying Olm account holding our identity keys.
    account: Account,
    /// Persists all the encryption keys so a client can resume without
    /// creating new keys.
    store: Box<dyn CryptoStore>,
    /// The remote devices we know about.
    device_store: DeviceStore,
    /// The Olm sessions we established, grouped by the curve25519 key of the
    /// remote device.
    session_store: SessionStore,
    /// The Megolm sessions we can decrypt with.
    inbound_group_store: GroupSessionStore,
    /// The currently active outbound group sessions, at most one per room.
    outbound_group_sessions: HashMap<String, OutboundGroupSession>,
    /// The ed25519 fingerprints the user accepted.
    trust_store: FingerprintStore,
    /// The users we are sharing encrypted rooms with.
    tracked_users: HashSet<String>,
    /// The subset of the tracked users that need a keys query.
    users_for_key_query: HashSet<String>,
    /// The rotation and sharing settings for group sessions.
    settings: EncryptionSettings,
}

impl std::fmt::Debug for OlmMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OlmMachine")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .finish()
    }
}

impl OlmMachine {
    /// Create a new machine that keeps all of its state in memory.
    pub fn new(user_id: &str, device_id: &str) -> OlmResult<Self> {
        Self::with_store(
            user_id,
            device_id,
            Box::new(MemoryStore::new()),
            FingerprintStore::new(),
        )
    }

    /// Open a machine that persists its state inside the given directory.
    ///
    /// The pickled ratchet states are encrypted using the given passphrase,
    /// reopening an existing directory with a different passphrase fails.
    pub fn open(
        user_id: &str,
        device_id: &str,
        directory: impl AsRef<Path>,
        passphrase: &str,
    ) -> OlmResult<Self> {
        let directory = directory.as_ref();
        let store = SledStore::open(user_id, device_id, directory, passphrase)?;
        let trust_store =
            FingerprintStore::open(directory.join(format!("{user_id}_{device_id}.known_devices")))?;

        Self::with_store(user_id, device_id, Box::new(store), trust_store)
    }

    /// Create a machine on top of an arbitrary store implementation.
    pub fn with_store(
        user_id: &str,
        device_id: &str,
        mut store: Box<dyn CryptoStore>,
        trust_store: FingerprintStore,
    ) -> OlmResult<Self> {
        let account = match store.load_account()? {
            Some(account) => {
                debug!("Restored a pickled account");
                account
            }
            None => {
                debug!("Creating a new Olm account");
                let account = Account::new(user_id, device_id);
                store.save_account(&account)?;
                account
            }
        };

        let mut session_store = SessionStore::new();
        for session in store.load_sessions()? {
            session_store.add(session);
        }

        let mut inbound_group_store = GroupSessionStore::new();
        for session in store.load_inbound_group_sessions()? {
            inbound_group_store.add(session);
        }

        let device_store = DeviceStore::new();
        let mut devices = store.load_device_keys()?;
        // Live records go in first so a tombstone can never shadow them.
        devices.sort_by_key(|d| d.is_deleted());
        for device in devices {
            device_store.add(device);
        }

        Ok(OlmMachine {
            user_id: user_id.to_owned(),
            device_id: device_id.to_owned(),
            account,
            store,
            device_store,
            session_store,
            inbound_group_store,
            outbound_group_sessions: HashMap::new(),
            trust_store,
            tracked_users: HashSet::new(),
            users_for_key_query: HashSet::new(),
            settings: EncryptionSettings::default(),
        })
    }

    /// The unique user id that owns this machine.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// The unique device id of the device that holds this machine.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// The account holding the local identity keys.
    pub fn account(&self) -> &Account {
        &self.account
    }

    /// The registry of remote devices the machine knows about.
    pub fn device_store(&self) -> &DeviceStore {
        &self.device_store
    }

    /// Change the rotation and sharing settings for group sessions.
    ///
    /// Sessions that already exist keep the settings they were created with.
    pub fn set_encryption_settings(&mut self, settings: EncryptionSettings) {
        self.settings = settings;
    }

    /// Handle a parsed server response and update the internal state.
    pub fn handle_response(&mut self, response: &Response) -> OlmResult<()> {
        match response {
            Response::KeysUpload(r) => self.receive_keys_upload_response(r),
            Response::KeysQuery(r) => self.receive_keys_query_response(r).map(|_| ()),
            Response::KeysClaim(r) => self.receive_keys_claim_response(r),
            Response::Sync(r) => {
                self.receive_sync_response(r);
                Ok(())
            }
        }
    }

    /// Should account or one-time keys be uploaded to the server.
    pub fn should_upload_keys(&self) -> bool {
        if !self.account.shared() {
            return true;
        }

        // If the server has less than half of our maximum number of one-time
        // keys, tell the client to upload more.
        self.account.uploaded_key_count() < self.account.max_one_time_keys() as u64 / 2
    }

    /// Get the key upload request for the keys that need to be uploaded.
    ///
    /// Returns `None` if no upload is needed at the moment.
    pub fn keys_for_upload(&mut self) -> OlmResult<Option<KeysUploadRequest>> {
        if !self.should_upload_keys() {
            return Ok(None);
        }

        let device_keys = if self.account.shared() {
            None
        } else {
            Some(self.device_keys()?)
        };

        self.generate_one_time_keys();
        let one_time_keys = self.signed_one_time_keys()?;

        Ok(Some(KeysUploadRequest { device_keys, one_time_keys }))
    }

    /// Top the unpublished one-time key pool up so the server can be brought
    /// back to holding half of the maximum number of keys.
    fn generate_one_time_keys(&mut self) -> u64 {
        let max_on_server = self.account.max_one_time_keys() as u64 / 2;
        let unpublished = self.account.one_time_keys().len() as u64;

        let count = max_on_server
            .saturating_sub(self.account.uploaded_key_count())
            .saturating_sub(unpublished);

        self.account.generate_one_time_keys(count as usize);
        count
    }

    /// Sign our own device keys so they can be uploaded.
    fn device_keys(&self) -> Result<DeviceKeys, OlmError> {
        let mut keys = BTreeMap::new();
        keys.insert(
            format!("{}:{}", KeyAlgorithm::Curve25519, self.device_id),
            self.account.curve25519_key().to_base64(),
        );
        keys.insert(
            format!("{}:{}", KeyAlgorithm::Ed25519, self.device_id),
            self.account.ed25519_key().to_base64(),
        );

        let device_keys = json!({
            "user_id": self.user_id,
            "device_id": self.device_id,
            "algorithms": [OLM_ALGORITHM, MEGOLM_ALGORITHM],
            "keys": keys,
        });

        let signature = self.account.sign_json(&device_keys)?;

        let mut signature_map = BTreeMap::new();
        signature_map.insert(
            format!("{}:{}", KeyAlgorithm::Ed25519, self.device_id),
            signature,
        );
        let mut signatures = BTreeMap::new();
        signatures.insert(self.user_id.clone(), signature_map);

        Ok(DeviceKeys {
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            algorithms: vec![OLM_ALGORITHM.to_owned(), MEGOLM_ALGORITHM.to_owned()],
            keys,
            signatures,
            unsigned: None,
        })
    }

    /// Sign and prepare the unpublished one-time keys for an upload.
    fn signed_one_time_keys(&self) -> Result<BTreeMap<String, SignedOneTimeKey>, OlmError> {
        let mut one_time_keys = BTreeMap::new();

        for (key_id, key) in self.account.one_time_keys() {
            let key_json = json!({ "key": key.to_base64() });
            let signature = self.account.sign_json(&key_json)?;

            let mut signature_map = BTreeMap::new();
            signature_map.insert(
                format!("{}:{}", KeyAlgorithm::Ed25519, self.device_id),
                signature,
            );
            let mut signatures = BTreeMap::new();
            signatures.insert(self.user_id.clone(), signature_map);

            one_time_keys.insert(
                format!("{}:{}", ONE_TIME_KEY_ALGORITHM, key_id.to_base64()),
                SignedOneTimeKey { key: key.to_base64(), signatures },
            );
        }

        Ok(one_time_keys)
    }

    /// Receive a successful keys upload response.
    ///
    /// The uploaded one-time keys are marked as published and the new server
    /// side key count is recorded.
    pub fn receive_keys_upload_response(
        &mut self,
        response: &KeysUploadResponse,
    ) -> OlmResult<()> {
        if !self.account.shared() {
            debug!("Marking account as shared");
        }
        self.account.mark_as_shared();

        let count = response
            .one_time_key_counts
            .get(ONE_TIME_KEY_ALGORITHM)
            .copied()
            .unwrap_or_default();

        debug!(
            "Updated uploaded one-time key count {} -> {}, marking keys as published",
            self.account.uploaded_key_count(),
            count
        );

        self.account.update_uploaded_key_count(count);
        self.account.mark_keys_as_published();
        self.store.save_account(&self.account)?;

        Ok(())
    }

    /// Receive a successful keys query response.
    ///
    /// Every device with a valid self signature is stored or updated, a
    /// device whose signature doesn't verify is rejected without poisoning
    /// the rest of the response. Returns the devices that changed, an
    /// identical repeat application returns an empty list.
    pub fn receive_keys_query_response(
        &mut self,
        response: &KeysQueryResponse,
    ) -> OlmResult<Vec<Device>> {
        let mut changed = Vec::new();

        for (user_id, device_map) in &response.device_keys {
            self.users_for_key_query.remove(user_id);

            for (device_id, device_keys) in device_map {
                // We don't need our own device in the device store.
                if user_id == &self.user_id && device_id == &self.device_id {
                    continue;
                }

                if user_id != &device_keys.user_id || device_id != &device_keys.device_id {
                    warn!(
                        "Mismatch in the device keys payload of device {} from user {}",
                        device_id, user_id
                    );
                    continue;
                }

                let Some(signing_key) = device_keys.get_key(KeyAlgorithm::Ed25519) else {
                    continue;
                };

                let mut json = serde_json::to_value(device_keys)?;
                if verify_json(user_id, device_id, signing_key, &mut json).is_err() {
                    warn!(
                        "Failed to verify the device key signatures for {} {}",
                        user_id, device_id
                    );
                    continue;
                }

                let Ok(device) = Device::from_keys(device_keys) else {
                    continue;
                };

                if let Some(existing) = self.device_store.get(user_id, device_id) {
                    if existing == device && existing.display_name() == device.display_name() {
                        continue;
                    }

                    if !existing.is_deleted() && existing.ed25519() != device.ed25519() {
                        warn!(
                            "The fingerprint key of {} {} changed, marking the old \
                             device as deleted",
                            user_id, device_id
                        );
                        self.device_store.remove(user_id, device_id);

                        let mut tombstone = existing;
                        tombstone.mark_as_deleted();
                        changed.push(tombstone);
                    }
                }

                if self.device_store.add(device.clone()) {
                    info!("Found a new device {} {}", user_id, device_id);
                }
                changed.push(device);
            }

            // Devices the server no longer lists for the user were deleted.
            let stored = self.device_store.user_devices(user_id);
            for device in stored.devices() {
                if !device.is_deleted() && !device_map.contains_key(device.device_id()) {
                    info!("The device {} of {} was deleted", device.device_id(), user_id);
                    self.device_store.remove(user_id, device.device_id());

                    let mut tombstone = device.clone();
                    tombstone.mark_as_deleted();
                    changed.push(tombstone);
                }
            }
        }

        if !changed.is_empty() {
            self.store.save_device_keys(&changed)?;
        }

        Ok(changed)
    }

    /// Receive a successful one-time key claim response.
    ///
    /// A new outbound Olm session is created for every device with a validly
    /// signed one-time key, invalid entries are skipped.
    pub fn receive_keys_claim_response(&mut self, response: &KeysClaimResponse) -> OlmResult<()> {
        for (user_id, user_devices) in &response.one_time_keys {
            for (device_id, key_map) in user_devices {
                let Some(device) = self.device_store.get(user_id, device_id) else {
                    warn!(
                        "Tried to create an Olm session for {} {}, but the device is unknown",
                        user_id, device_id
                    );
                    continue;
                };

                let Some(one_time_key) = key_map
                    .iter()
                    .find(|(key_id, _)| key_id.starts_with(ONE_TIME_KEY_ALGORITHM))
                    .map(|(_, key)| key)
                else {
                    warn!(
                        "Tried to create an Olm session for {} {}, but the signed \
                         one-time key is missing",
                        user_id, device_id
                    );
                    continue;
                };

                let mut json = serde_json::to_value(one_time_key)?;
                if verify_json(user_id, device_id, device.ed25519(), &mut json).is_err() {
                    warn!(
                        "Failed to verify the one-time key signatures for {} {}",
                        user_id, device_id
                    );
                    continue;
                }

                info!("Creating an outbound Olm session for {} {}", user_id, device_id);

                if let Err(e) = self.create_session(&one_time_key.key, device.curve25519()) {
                    warn!(
                        "Error creating a new Olm session for {} {}: {}",
                        user_id, device_id, e
                    );
                }
            }
        }

        Ok(())
    }

    /// Create a new outbound Olm session with the device owning the given
    /// curve25519 key.
    ///
    /// An existing session is never replaced, the fresh session coexists and
    /// becomes the active one only if its session id sorts first.
    pub fn create_session(&mut self, one_time_key: &str, curve_key: &str) -> OlmResult<()> {
        let identity_key = Curve25519PublicKey::from_base64(curve_key)?;
        let one_time_key = Curve25519PublicKey::from_base64(one_time_key)?;

        let session = self.account.create_outbound_session(identity_key, one_time_key);

        self.store.save_session(&session)?;
        self.session_store.add(session);

        Ok(())
    }

    /// Get the devices we are missing Olm sessions for.
    ///
    /// The returned map can be used to issue a one-time key claim request.
    pub fn get_missing_sessions<'a>(
        &mut self,
        users: impl IntoIterator<Item = &'a str>,
    ) -> HashMap<String, HashMap<String, String>> {
        let mut missing: HashMap<String, HashMap<String, String>> = HashMap::new();

        for user_id in users {
            for device in self.device_store.active_user_devices(user_id) {
                if !self.session_store.contains_key(device.curve25519()) {
                    missing
                        .entry(user_id.to_owned())
                        .or_default()
                        .insert(device.device_id().to_owned(), ONE_TIME_KEY_ALGORITHM.to_owned());
                }
            }
        }

        missing
    }

    /// Handle the encryption relevant parts of a sync response.
    ///
    /// Encrypted to-device events are decrypted and dispatched, the one-time
    /// key count drives replenishment. Events that fail to decrypt or
    /// validate are dropped and logged, they never poison the batch.
    pub fn receive_sync_response(&mut self, response: &SyncResponse) -> Vec<DecryptedOlmEvent> {
        if let Some(count) = response
            .device_one_time_keys_count
            .get(ONE_TIME_KEY_ALGORITHM)
        {
            self.account.update_uploaded_key_count(*count);
        }

        let mut decrypted_events = Vec::new();

        for event in &response.to_device.events {
            if event.event_type != ROOM_ENCRYPTED_TYPE {
                continue;
            }

            match self.decrypt_to_device_event(event) {
                Ok(e) => decrypted_events.push(e),
                Err(e) => {
                    warn!(
                        "Failed to decrypt a to-device event from {}: {}",
                        event.sender, e
                    );
                }
            }
        }

        decrypted_events
    }

    /// Decrypt an Olm encrypted to-device event.
    ///
    /// The decrypted payload is validated against the claimed sender device
    /// and carried room keys are installed as inbound group sessions.
    pub fn decrypt_to_device_event(
        &mut self,
        event: &ToDeviceEvent,
    ) -> OlmResult<DecryptedOlmEvent> {
        let content: OlmEventContent = serde_json::from_value(event.content.clone())?;

        if content.algorithm != OLM_ALGORITHM {
            warn!("Received an encrypted event with an unsupported algorithm");
            return Err(EventError::UnsupportedAlgorithm.into());
        }

        let own_key = self.account.curve25519_key().to_base64();
        let Some(ciphertext) = content.ciphertext.get(&own_key) else {
            warn!("An Olm event doesn't contain a ciphertext for our key");
            return Err(EventError::MissingCiphertext.into());
        };

        let message = ciphertext.to_message()?;
        let plaintext = self.decrypt_olm_message(&content.sender_key, &message)?;

        let decrypted: DecryptedOlmEvent = serde_json::from_str(&plaintext)?;
        self.validate_olm_event(&event.sender, &content.sender_key, &decrypted)?;
        self.handle_decrypted_to_device_event(&content.sender_key, &decrypted)?;

        Ok(decrypted)
    }

    /// Decrypt an Olm message, trying every stored session of the sender.
    ///
    /// A pre-key message that no session can decrypt bootstraps a new
    /// inbound session, a normal message never does.
    fn decrypt_olm_message(
        &mut self,
        sender_key: &str,
        message: &OlmMessage,
    ) -> OlmResult<String> {
        if let Some(sessions) = self.session_store.sessions_mut(sender_key) {
            for session in sessions.iter_mut() {
                let mut matches = false;

                if let OlmMessage::PreKey(m) = message {
                    matches = session.matches(m);
                    if !matches {
                        continue;
                    }
                }

                match session.decrypt(message) {
                    Ok(plaintext) => {
                        self.store.save_session(session)?;
                        return Ok(plaintext);
                    }
                    Err(e) => {
                        // A pre-key message that matched the session has to
                        // decrypt with it.
                        if matches {
                            warn!(
                                "An Olm message from {} failed to decrypt with its \
                                 matching session: {}",
                                sender_key, e
                            );
                            return Err(OlmError::SessionWedged(sender_key.to_owned()));
                        }
                    }
                }
            }
        }

        match message {
            OlmMessage::Normal(_) => Err(OlmError::SessionWedged(sender_key.to_owned())),
            OlmMessage::PreKey(m) => {
                let (session, plaintext) = self.account.create_inbound_session(sender_key, m)?;

                info!(
                    "Created a new inbound Olm session with sender key {}",
                    sender_key
                );

                // The pre-key message used up a one-time key.
                self.store.save_account(&self.account)?;
                self.store.save_session(&session)?;
                self.session_store.add(session);

                Ok(plaintext)
            }
        }
    }

    /// Check the envelope of a decrypted Olm event against the outer,
    /// authenticated metadata.
    fn validate_olm_event(
        &self,
        sender: &str,
        sender_key: &str,
        event: &DecryptedOlmEvent,
    ) -> OlmResult<()> {
        if event.sender != sender {
            return Err(EventError::MismatchedSender.into());
        }

        if event.recipient != self.user_id {
            return Err(EventError::MismatchedRecipient.into());
        }

        if event.recipient_keys.ed25519 != self.account.ed25519_key().to_base64() {
            return Err(EventError::MismatchedKeys.into());
        }

        let device = self
            .device_store
            .get(&event.sender, &event.sender_device)
            .ok_or_else(|| {
                EventError::UnknownDevice(event.sender.clone(), event.sender_device.clone())
            })?;

        if device.ed25519() != event.keys.ed25519 || device.curve25519() != sender_key {
            return Err(EventError::MismatchedKeys.into());
        }

        Ok(())
    }

    fn handle_decrypted_to_device_event(
        &mut self,
        sender_key: &str,
        event: &DecryptedOlmEvent,
    ) -> OlmResult<()> {
        match event.event_type.as_str() {
            ROOM_KEY_TYPE => self.add_room_key(sender_key, event),
            t => {
                debug!("Received a decrypted to-device event of type {}", t);
                Ok(())
            }
        }
    }

    /// Install the room key carried by a decrypted `m.room_key` event.
    ///
    /// A key for a `(room, sender, session id)` triple we already know is a
    /// no-op, the existing session stays authoritative.
    fn add_room_key(&mut self, sender_key: &str, event: &DecryptedOlmEvent) -> OlmResult<()> {
        let content: crate::responses::RoomKeyContent =
            match serde_json::from_value(event.content.clone()) {
                Ok(c) => c,
                Err(e) => {
                    warn!("Received a malformed room key event: {}", e);
                    return Ok(());
                }
            };

        if content.algorithm != MEGOLM_ALGORITHM {
            warn!(
                "Received a room key with the unsupported algorithm {}",
                content.algorithm
            );
            return Ok(());
        }

        let session = match InboundGroupSession::from_key_export(
            sender_key,
            &event.keys.ed25519,
            &content.room_id,
            &content.session_key,
        ) {
            Ok(s) => s,
            Err(e) => {
                warn!("Received an invalid room key: {}", e);
                return Ok(());
            }
        };

        if self
            .inbound_group_store
            .contains(&content.room_id, sender_key, session.session_id())
        {
            debug!(
                "Ignoring a room key for the known session {}",
                session.session_id()
            );
            return Ok(());
        }

        info!("Received a new room key for room {}", content.room_id);

        self.store.save_inbound_group_session(&session)?;
        self.inbound_group_store.add(session);

        Ok(())
    }

    /// Create a fresh outbound group session for the given room.
    ///
    /// The matching inbound session for our own device is installed so we
    /// can decrypt our own messages. The new session hasn't been shared with
    /// anyone yet.
    pub fn create_outbound_group_session(&mut self, room_id: &str) -> OlmResult<()> {
        let session = OutboundGroupSession::new(
            &self.device_id,
            &self.account.curve25519_key().to_base64(),
            room_id,
            self.settings.clone(),
        );

        let inbound = InboundGroupSession::new(
            &self.account.curve25519_key().to_base64(),
            &self.account.ed25519_key().to_base64(),
            room_id,
            &session.session_key(),
        );

        debug!(
            "Created a new outbound group session {} for room {}",
            session.session_id(),
            room_id
        );

        self.store.save_inbound_group_session(&inbound)?;
        self.inbound_group_store.add(inbound);
        self.outbound_group_sessions.insert(room_id.to_owned(), session);

        Ok(())
    }

    /// Get the currently active outbound group session for the given room.
    pub fn outbound_group_session(&self, room_id: &str) -> Option<&OutboundGroupSession> {
        self.outbound_group_sessions.get(room_id)
    }

    /// Encrypt a room event with the Megolm session of the given room.
    ///
    /// A missing or expired session is replaced with a fresh one before
    /// encrypting, the caller needs to share the fresh session afterwards.
    pub fn encrypt_group_message(
        &mut self,
        room_id: &str,
        event_type: &str,
        content: &Value,
    ) -> OlmResult<MegolmEventContent> {
        let rotate = self
            .outbound_group_sessions
            .get(room_id)
            .map_or(true, |s| s.expired());

        if rotate {
            self.create_outbound_group_session(room_id)?;
        }

        let session = self
            .outbound_group_sessions
            .get_mut(room_id)
            .ok_or(OlmError::MissingSession)?;

        Ok(session.encrypt(event_type, content))
    }

    /// Decrypt a Megolm encrypted room event.
    ///
    /// Fails with a missing session error if we never received the room key,
    /// the driver may want to request it.
    pub fn decrypt_room_event(&mut self, event: &MegolmEvent) -> MegolmResult<(Value, u32)> {
        let content = &event.content;

        if content.algorithm != MEGOLM_ALGORITHM {
            return Err(EventError::UnsupportedAlgorithm.into());
        }

        let decrypted = {
            let session = self
                .inbound_group_store
                .get_mut(&event.room_id, &content.sender_key, &content.session_id)
                .ok_or(MegolmError::MissingSession)?;

            session.decrypt(content)?
        };

        if let Some(session) = self
            .inbound_group_store
            .get(&event.room_id, &content.sender_key, &content.session_id)
        {
            self.store.save_inbound_group_session(session)?;
        }

        Ok(decrypted)
    }

    /// Share the room key of the given room with the devices of the given
    /// users.
    ///
    /// Every target device needs a decided trust state: any device the user
    /// hasn't decided about aborts the share without mutating anything,
    /// blacklisted devices are silently skipped. Devices that already
    /// received this session are skipped, so repeating the call yields an
    /// empty payload.
    pub fn share_group_session<'a>(
        &mut self,
        room_id: &str,
        users: impl IntoIterator<Item = &'a str>,
    ) -> Result<ToDevicePayload, ShareError> {
        let mut unset = Vec::new();
        let mut targets = Vec::new();
        let mut ignored = Vec::new();

        for user_id in users {
            for device in self.device_store.active_user_devices(user_id) {
                match device.trust_state() {
                    LocalTrust::Verified => targets.push(device),
                    LocalTrust::Ignored => {
                        if self.settings.share_with_ignored_devices {
                            ignored
                                .push((device.user_id().to_owned(), device.device_id().to_owned()));
                            targets.push(device);
                        }
                    }
                    LocalTrust::Unset => {
                        unset.push((device.user_id().to_owned(), device.device_id().to_owned()))
                    }
                    // Blacklisted devices never show up as active.
                    LocalTrust::BlackListed => (),
                }
            }
        }

        if !unset.is_empty() {
            return Err(ShareError::UnsetTrust(unset));
        }

        if !ignored.is_empty() {
            debug!("Sharing a room key with the ignored devices {:?}", ignored);
        }

        let rotate = self
            .outbound_group_sessions
            .get(room_id)
            .map_or(true, |s| s.expired());

        if rotate {
            self.create_outbound_group_session(room_id)?;
        }

        let key_content = {
            let session = self
                .outbound_group_sessions
                .get(room_id)
                .ok_or(ShareError::Olm(OlmError::MissingSession))?;

            targets.retain(|d| !session.is_shared_with(d.user_id(), d.device_id()));

            serde_json::to_value(session.as_room_key_content())
                .map_err(|e| ShareError::Olm(e.into()))?
        };

        let missing: Vec<(String, String)> = targets
            .iter()
            .filter(|d| !self.session_store.contains_key(d.curve25519()))
            .map(|d| (d.user_id().to_owned(), d.device_id().to_owned()))
            .collect();

        if !missing.is_empty() {
            return Err(ShareError::MissingSessions(missing));
        }

        let mut payload = ToDevicePayload::default();
        let mut shared = Vec::new();

        for device in &targets {
            let session = self
                .session_store
                .get_mut(device.curve25519())
                .ok_or(ShareError::Olm(OlmError::MissingSession))?;

            let content =
                session.encrypt(&self.account, device, ROOM_KEY_TYPE, key_content.clone())?;

            self.store
                .save_session(session)
                .map_err(|e| ShareError::Olm(e.into()))?;

            payload.add_message(device.user_id(), device.device_id(), content);
            shared.push((device.user_id().to_owned(), device.device_id().to_owned()));
        }

        if let Some(session) = self.outbound_group_sessions.get_mut(room_id) {
            for (user_id, device_id) in shared {
                session.mark_shared_with(&user_id, &device_id);
            }
        }

        Ok(payload)
    }

    /// Mark the given device as verified and remember its fingerprint.
    ///
    /// Returns true if the device wasn't verified before. Changing the trust
    /// state never invalidates existing group sessions, it only affects
    /// future shares.
    pub fn verify_device(&mut self, device: &Device) -> OlmResult<bool> {
        self.set_trust_state(device, LocalTrust::Verified)?;

        let newly_added = self.trust_store.add(Fingerprint::from_device(device))?;
        Ok(newly_added)
    }

    /// Undo an earlier device verification.
    pub fn unverify_device(&mut self, device: &Device) -> OlmResult<bool> {
        self.set_trust_state(device, LocalTrust::Unset)?;

        let removed = self.trust_store.remove(&Fingerprint::from_device(device))?;
        Ok(removed)
    }

    /// Mark the given device as blacklisted, it is skipped on every future
    /// share.
    pub fn blacklist_device(&mut self, device: &Device) -> OlmResult<bool> {
        let was_blacklisted = self
            .device_store
            .get(device.user_id(), device.device_id())
            .map(|d| d.is_blacklisted())
            .unwrap_or(false);

        self.set_trust_state(device, LocalTrust::BlackListed)?;
        self.trust_store.remove(&Fingerprint::from_device(device))?;

        Ok(!was_blacklisted)
    }

    /// Undo an earlier device blacklisting.
    pub fn unblacklist_device(&mut self, device: &Device) -> OlmResult<bool> {
        let was_blacklisted = self
            .device_store
            .get(device.user_id(), device.device_id())
            .map(|d| d.is_blacklisted())
            .unwrap_or(false);

        self.set_trust_state(device, LocalTrust::Unset)?;
        Ok(was_blacklisted)
    }

    /// Mark the given device as ignored.
    ///
    /// Ignored devices take part in room key shares but are reported
    /// separately.
    pub fn ignore_device(&mut self, device: &Device) -> OlmResult<bool> {
        let was_ignored = self
            .device_store
            .get(device.user_id(), device.device_id())
            .map(|d| d.trust_state() == LocalTrust::Ignored)
            .unwrap_or(false);

        self.set_trust_state(device, LocalTrust::Ignored)?;
        Ok(!was_ignored)
    }

    /// Undo an earlier device ignore.
    pub fn unignore_device(&mut self, device: &Device) -> OlmResult<bool> {
        let was_ignored = self
            .device_store
            .get(device.user_id(), device.device_id())
            .map(|d| d.trust_state() == LocalTrust::Ignored)
            .unwrap_or(false);

        self.set_trust_state(device, LocalTrust::Unset)?;
        Ok(was_ignored)
    }

    /// Is the given device marked as verified.
    pub fn is_device_verified(&self, device: &Device) -> bool {
        self.device_store
            .get(device.user_id(), device.device_id())
            .map(|d| d.is_verified())
            .unwrap_or(false)
    }

    fn set_trust_state(&mut self, device: &Device, trust_state: LocalTrust) -> OlmResult<()> {
        if !self
            .device_store
            .set_trust_state(device.user_id(), device.device_id(), trust_state)
        {
            // The device wasn't in the registry yet.
            let mut device = device.clone();
            device.set_trust_state(trust_state);
            self.device_store.add(device);
        }

        if let Some(device) = self.device_store.get(device.user_id(), device.device_id()) {
            self.store.save_device_keys(&[device])?;
        }

        Ok(())
    }

    /// Update the set of tracked users.
    ///
    /// Users that weren't tracked before are queued up for a keys query.
    pub fn update_tracked_users<'a>(&mut self, users: impl IntoIterator<Item = &'a str>) {
        for user in users {
            if self.tracked_users.insert(user.to_owned()) {
                self.users_for_key_query.insert(user.to_owned());
            }
        }
    }

    /// Should the client issue a keys query request.
    pub fn should_query_keys(&self) -> bool {
        !self.users_for_key_query.is_empty()
    }

    /// Get the set of users that we need to query keys for.
    pub fn users_for_key_query(&self) -> HashSet<String> {
        self.users_for_key_query.clone()
    }
}

#[cfg(test)]
mod test {
    use std::collections::{BTreeMap, HashMap};

    use serde_json::json;

    use super::OlmMachine;
    use crate::error::{MegolmError, ShareError};
    use crate::identities::{Device, LocalTrust};
    use crate::olm::verify_json;
    use crate::responses::{
        KeysClaimResponse, KeysQueryResponse, KeysUploadResponse, MegolmEvent, MegolmEventContent,
        OlmEventContent, ToDeviceEvent,
    };
    use crate::store::Fingerprint;

    const ALICE_ID: &str = "@alice:example.org";
    const ALICE_DEVICE: &str = "ALDEVICE";
    const BOB_ID: &str = "@bob:example.org";
    const BOB_DEVICE: &str = "BOBDEVICE";
    const MALORY_ID: &str = "@malory:example.org";
    const MALORY_DEVICE: &str = "MALORYDEVICE";
    const TEST_ROOM: &str = "!test:example.org";

    fn machine(user_id: &str, device_id: &str) -> OlmMachine {
        OlmMachine::new(user_id, device_id).unwrap()
    }

    fn device_of(machine: &OlmMachine) -> Device {
        Device::new(
            machine.user_id(),
            machine.device_id(),
            &machine.account().ed25519_key().to_base64(),
            &machine.account().curve25519_key().to_base64(),
        )
    }

    fn keys_query_response_for(machine: &OlmMachine) -> KeysQueryResponse {
        let mut devices = HashMap::new();
        devices.insert(machine.device_id().to_owned(), machine.device_keys().unwrap());

        let mut device_keys = HashMap::new();
        device_keys.insert(machine.user_id().to_owned(), devices);

        KeysQueryResponse { device_keys, failures: HashMap::new() }
    }

    /// Generate and publish a one-time key, returning its public part.
    fn one_time_key_of(machine: &mut OlmMachine) -> String {
        machine.account.generate_one_time_keys(1);
        let key = machine
            .account
            .one_time_keys()
            .values()
            .next()
            .copied()
            .unwrap()
            .to_base64();
        machine.account.mark_keys_as_published();

        key
    }

    #[test]
    fn create_olm_machine() {
        let machine = machine(ALICE_ID, ALICE_DEVICE);
        assert!(machine.should_upload_keys());
    }

    #[test]
    fn keys_for_upload_cycle() {
        let mut machine = machine(ALICE_ID, ALICE_DEVICE);
        let ed25519_key = machine.account().ed25519_key().to_base64();

        let request = machine.keys_for_upload().unwrap().unwrap();

        let device_keys = request.device_keys.as_ref().unwrap();
        let mut json = serde_json::to_value(device_keys).unwrap();
        verify_json(ALICE_ID, ALICE_DEVICE, &ed25519_key, &mut json).unwrap();

        assert!(!request.one_time_keys.is_empty());
        let one_time_key = request.one_time_keys.values().next().unwrap();
        let mut json = serde_json::to_value(one_time_key).unwrap();
        verify_json(ALICE_ID, ALICE_DEVICE, &ed25519_key, &mut json).unwrap();

        let mut one_time_key_counts = BTreeMap::new();
        one_time_key_counts
            .insert("signed_curve25519".to_owned(), request.one_time_keys.len() as u64);
        machine
            .receive_keys_upload_response(&KeysUploadResponse { one_time_key_counts })
            .unwrap();

        assert!(!machine.should_upload_keys());
        assert!(machine.keys_for_upload().unwrap().is_none());
        assert!(machine.account.one_time_keys().is_empty());
    }

    #[test]
    fn key_counts_drive_replenishment() {
        let mut machine = machine(ALICE_ID, ALICE_DEVICE);

        let mut one_time_key_counts = BTreeMap::new();
        one_time_key_counts.insert("signed_curve25519".to_owned(), 50u64);
        machine
            .receive_keys_upload_response(&KeysUploadResponse { one_time_key_counts })
            .unwrap();

        assert!(!machine.should_upload_keys());

        // The server forgot most of our keys, the next sync tells us so.
        machine.account.update_uploaded_key_count(2);
        assert_eq!(
            machine.account.one_time_keys_remaining(),
            machine.account.max_one_time_keys() as u64 - 2
        );
        assert!(machine.should_upload_keys());
        assert!(machine.keys_for_upload().unwrap().is_some());
    }

    #[test]
    fn invalid_signatures_are_rejected() {
        let machine = machine(ALICE_ID, ALICE_DEVICE);

        let device_keys = machine.device_keys().unwrap();
        let mut json = serde_json::to_value(&device_keys).unwrap();

        let ret = verify_json(ALICE_ID, ALICE_DEVICE, "fake_key", &mut json);
        assert!(ret.is_err());

        // A verification doesn't eat the signatures of the object.
        let ed25519_key = machine.account().ed25519_key().to_base64();
        verify_json(ALICE_ID, ALICE_DEVICE, &ed25519_key, &mut json).unwrap();
    }

    #[test]
    fn keys_query_absorption() {
        let mut alice = machine(ALICE_ID, ALICE_DEVICE);
        let bob = machine(BOB_ID, BOB_DEVICE);
        let response = keys_query_response_for(&bob);

        let changed = alice.receive_keys_query_response(&response).unwrap();
        assert_eq!(changed.len(), 1);

        let device = alice.device_store().get(BOB_ID, BOB_DEVICE).unwrap();
        assert_eq!(device.ed25519(), bob.account().ed25519_key().to_base64());
        assert_eq!(device.trust_state(), LocalTrust::Unset);

        // The same response applied a second time changes nothing.
        let changed = alice.receive_keys_query_response(&response).unwrap();
        assert!(changed.is_empty());
    }

    #[test]
    fn tampered_device_keys_are_rejected() {
        let mut alice = machine(ALICE_ID, ALICE_DEVICE);
        let bob = machine(BOB_ID, BOB_DEVICE);

        let mut response = keys_query_response_for(&bob);
        let device_keys = response
            .device_keys
            .get_mut(BOB_ID)
            .unwrap()
            .get_mut(BOB_DEVICE)
            .unwrap();
        device_keys.keys.insert(
            format!("curve25519:{BOB_DEVICE}"),
            "wjLpTLRqbqBzLs63aYaEv2Boi6cFEbbM/sSRQ2oAKk4".to_owned(),
        );

        let changed = alice.receive_keys_query_response(&response).unwrap();

        assert!(changed.is_empty());
        assert!(alice.device_store().get(BOB_ID, BOB_DEVICE).is_none());
    }

    #[test]
    fn fingerprint_changes_mark_the_device_as_deleted() {
        let mut alice = machine(ALICE_ID, ALICE_DEVICE);

        let bob = machine(BOB_ID, BOB_DEVICE);
        alice
            .receive_keys_query_response(&keys_query_response_for(&bob))
            .unwrap();
        alice.verify_device(&device_of(&bob)).unwrap();

        // The same device id reappears with fresh identity keys.
        let imposter = machine(BOB_ID, BOB_DEVICE);
        let changed = alice
            .receive_keys_query_response(&keys_query_response_for(&imposter))
            .unwrap();
        assert_eq!(changed.len(), 2);

        let device = alice.device_store().get(BOB_ID, BOB_DEVICE).unwrap();
        assert_eq!(device.ed25519(), imposter.account().ed25519_key().to_base64());
        assert!(!device.is_deleted());
        // The replacement is never trusted automatically.
        assert_eq!(device.trust_state(), LocalTrust::Unset);

        // Both the tombstone and the new record were persisted.
        let stored = alice.store.load_device_keys().unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored.iter().filter(|d| d.is_deleted()).count(), 1);
    }

    #[test]
    fn devices_missing_from_a_query_are_deleted() {
        let mut alice = machine(ALICE_ID, ALICE_DEVICE);
        let bob = machine(BOB_ID, BOB_DEVICE);

        alice
            .receive_keys_query_response(&keys_query_response_for(&bob))
            .unwrap();
        assert!(!alice.device_store().get(BOB_ID, BOB_DEVICE).unwrap().is_deleted());

        let mut response = KeysQueryResponse::default();
        response.device_keys.insert(BOB_ID.to_owned(), HashMap::new());

        let changed = alice.receive_keys_query_response(&response).unwrap();
        assert_eq!(changed.len(), 1);
        assert!(alice.device_store().get(BOB_ID, BOB_DEVICE).unwrap().is_deleted());
    }

    #[test]
    fn keys_claim_creates_an_outbound_session() {
        let mut alice = machine(ALICE_ID, ALICE_DEVICE);
        let mut bob = machine(BOB_ID, BOB_DEVICE);

        alice
            .receive_keys_query_response(&keys_query_response_for(&bob))
            .unwrap();

        let upload = bob.keys_for_upload().unwrap().unwrap();
        let (key_id, one_time_key) = upload.one_time_keys.iter().next().unwrap();

        let mut key_map = BTreeMap::new();
        key_map.insert(key_id.clone(), one_time_key.clone());
        let mut devices = HashMap::new();
        devices.insert(BOB_DEVICE.to_owned(), key_map);
        let mut one_time_keys = HashMap::new();
        one_time_keys.insert(BOB_ID.to_owned(), devices);

        let response = KeysClaimResponse { one_time_keys, failures: HashMap::new() };
        alice.receive_keys_claim_response(&response).unwrap();

        let bob_curve25519 = bob.account().curve25519_key().to_base64();
        assert!(alice.session_store.get(&bob_curve25519).is_some());
        assert!(alice.get_missing_sessions([BOB_ID]).is_empty());
    }

    #[test]
    fn sharing_requires_olm_sessions() {
        let mut alice = machine(ALICE_ID, ALICE_DEVICE);
        let bob = machine(BOB_ID, BOB_DEVICE);
        let bob_device = device_of(&bob);

        alice.device_store().add(bob_device.clone());
        alice.verify_device(&bob_device).unwrap();

        let missing = alice.get_missing_sessions([BOB_ID]);
        assert!(missing[BOB_ID].contains_key(BOB_DEVICE));

        let err = alice.share_group_session(TEST_ROOM, [BOB_ID]).unwrap_err();
        assert!(matches!(err, ShareError::MissingSessions(_)));
    }

    #[test]
    fn trust_gated_share_and_olm_decrypt() {
        let mut alice = machine(ALICE_ID, ALICE_DEVICE);
        let mut bob = machine(BOB_ID, BOB_DEVICE);
        let malory = machine(MALORY_ID, MALORY_DEVICE);

        let alice_device = device_of(&alice);
        let bob_device = device_of(&bob);
        let malory_device = device_of(&malory);

        alice.device_store().add(bob_device.clone());
        alice.device_store().add(malory_device.clone());
        bob.device_store().add(alice_device.clone());

        let one_time_key = one_time_key_of(&mut bob);
        alice.create_session(&one_time_key, bob_device.curve25519()).unwrap();

        alice.create_outbound_group_session(TEST_ROOM).unwrap();
        let session_id = alice
            .outbound_group_session(TEST_ROOM)
            .unwrap()
            .session_id()
            .to_owned();

        // Bob's trust hasn't been decided on.
        let err = alice.share_group_session(TEST_ROOM, [BOB_ID]).unwrap_err();
        assert!(matches!(err, ShareError::UnsetTrust(_)));

        alice.verify_device(&bob_device).unwrap();

        // Malory's trust still hasn't.
        let err = alice
            .share_group_session(TEST_ROOM, [BOB_ID, MALORY_ID])
            .unwrap_err();
        assert!(matches!(err, ShareError::UnsetTrust(_)));

        alice.blacklist_device(&malory_device).unwrap();

        let payload = alice
            .share_group_session(TEST_ROOM, [BOB_ID, MALORY_ID])
            .unwrap();

        // Failed shares never rotated the session.
        assert_eq!(
            alice.outbound_group_session(TEST_ROOM).unwrap().session_id(),
            session_id
        );

        // The key went to Bob and only to Bob.
        assert!(!payload.messages.contains_key(MALORY_ID));
        assert_eq!(payload.message_count(), 1);
        let content: OlmEventContent = payload.messages[BOB_ID][BOB_DEVICE].clone();
        assert!(content.ciphertext.contains_key(bob_device.curve25519()));

        // Sharing again is a no-op.
        let payload = alice
            .share_group_session(TEST_ROOM, [BOB_ID, MALORY_ID])
            .unwrap();
        assert!(payload.is_empty());

        // Bob decrypts the room key, bootstrapping an inbound Olm session
        // and installing the group session.
        let event = ToDeviceEvent {
            sender: ALICE_ID.to_owned(),
            event_type: "m.room.encrypted".to_owned(),
            content: serde_json::to_value(&content).unwrap(),
        };

        let decrypted = bob.decrypt_to_device_event(&event).unwrap();
        assert_eq!(decrypted.event_type, "m.room_key");
        assert_eq!(decrypted.sender, ALICE_ID);

        assert!(bob.session_store.get(alice_device.curve25519()).is_some());
        assert!(bob
            .inbound_group_store
            .get(TEST_ROOM, alice_device.curve25519(), &session_id)
            .is_some());

        // A room message encrypted by Alice decrypts on Bob's side.
        let content = alice
            .encrypt_group_message(TEST_ROOM, "m.room.message", &json!({"body": "It's a secret to everybody"}))
            .unwrap();
        assert_eq!(content.session_id, session_id);

        let event = MegolmEvent {
            sender: ALICE_ID.to_owned(),
            room_id: TEST_ROOM.to_owned(),
            content,
        };

        let (plaintext, message_index) = bob.decrypt_room_event(&event).unwrap();
        assert_eq!(message_index, 0);
        assert_eq!(plaintext["content"]["body"], "It's a secret to everybody");
        assert_eq!(plaintext["room_id"], TEST_ROOM);
    }

    #[test]
    fn trust_state_transitions() {
        let mut alice = machine(ALICE_ID, ALICE_DEVICE);
        let bob = machine(BOB_ID, BOB_DEVICE);
        let bob_device = device_of(&bob);

        alice.device_store().add(bob_device.clone());
        assert!(!alice.is_device_verified(&bob_device));

        assert!(alice.verify_device(&bob_device).unwrap());
        assert!(alice.is_device_verified(&bob_device));
        assert!(alice.trust_store.check(&Fingerprint::from_device(&bob_device)));
        assert!(!alice.verify_device(&bob_device).unwrap());

        assert!(alice.unverify_device(&bob_device).unwrap());
        assert!(!alice.is_device_verified(&bob_device));
        assert!(!alice.trust_store.check(&Fingerprint::from_device(&bob_device)));

        alice.ignore_device(&bob_device).unwrap();
        assert_eq!(
            alice.device_store().get(BOB_ID, BOB_DEVICE).unwrap().trust_state(),
            LocalTrust::Ignored
        );
        alice.unignore_device(&bob_device).unwrap();

        alice.blacklist_device(&bob_device).unwrap();
        assert!(alice.device_store().active_user_devices(BOB_ID).is_empty());
        alice.unblacklist_device(&bob_device).unwrap();
        assert_eq!(alice.device_store().active_user_devices(BOB_ID).len(), 1);
    }

    #[test]
    fn ignored_devices_take_part_in_shares() {
        let mut alice = machine(ALICE_ID, ALICE_DEVICE);
        let mut bob = machine(BOB_ID, BOB_DEVICE);
        let bob_device = device_of(&bob);

        alice.device_store().add(bob_device.clone());
        alice.ignore_device(&bob_device).unwrap();

        let one_time_key = one_time_key_of(&mut bob);
        alice.create_session(&one_time_key, bob_device.curve25519()).unwrap();

        let payload = alice.share_group_session(TEST_ROOM, [BOB_ID]).unwrap();
        assert_eq!(payload.message_count(), 1);

        // With the sharing switch flipped they are skipped instead.
        let mut settings = crate::olm::EncryptionSettings::default();
        settings.share_with_ignored_devices = false;
        alice.set_encryption_settings(settings);
        alice.create_outbound_group_session(TEST_ROOM).unwrap();

        let payload = alice.share_group_session(TEST_ROOM, [BOB_ID]).unwrap();
        assert!(payload.is_empty());
    }

    #[test]
    fn outbound_sessions_rotate_after_enough_messages() {
        let mut alice = machine(ALICE_ID, ALICE_DEVICE);
        let content = json!({"body": "spam"});

        let first = alice
            .encrypt_group_message(TEST_ROOM, "m.room.message", &content)
            .unwrap();

        for _ in 0..99 {
            alice
                .encrypt_group_message(TEST_ROOM, "m.room.message", &content)
                .unwrap();
        }

        let rotated = alice
            .encrypt_group_message(TEST_ROOM, "m.room.message", &content)
            .unwrap();

        assert_ne!(first.session_id, rotated.session_id);
        assert_eq!(
            alice.outbound_group_session(TEST_ROOM).unwrap().message_count(),
            1
        );
    }

    #[test]
    fn unknown_group_sessions_are_reported_as_missing() {
        let mut bob = machine(BOB_ID, BOB_DEVICE);

        let event = MegolmEvent {
            sender: ALICE_ID.to_owned(),
            room_id: TEST_ROOM.to_owned(),
            content: MegolmEventContent {
                algorithm: crate::MEGOLM_ALGORITHM.to_owned(),
                sender_key: "Xjuu9d2KjHLGIHpCOCHS7hONQahapiwI1MhVmlPlCFM".to_owned(),
                ciphertext: "AwgAEnACgAkLmt6qF84IK++J7UDH2Za1YVchHyprqTqsg".to_owned(),
                session_id: "SESSIONID".to_owned(),
                device_id: ALICE_DEVICE.to_owned(),
            },
        };

        let err = bob.decrypt_room_event(&event).unwrap_err();
        assert!(matches!(err, MegolmError::MissingSession));
    }

    #[test]
    fn account_bootstrap_and_reload() {
        let dir = tempfile::tempdir().unwrap();

        let (curve25519, ed25519) = {
            let machine = OlmMachine::open("example", "DEVICEID", dir.path(), "DEFAULT_KEY").unwrap();
            (
                machine.account().curve25519_key().to_base64(),
                machine.account().ed25519_key().to_base64(),
            )
        };

        let machine = OlmMachine::open("example", "DEVICEID", dir.path(), "DEFAULT_KEY").unwrap();
        assert_eq!(machine.account().curve25519_key().to_base64(), curve25519);
        assert_eq!(machine.account().ed25519_key().to_base64(), ed25519);
    }

    #[test]
    fn reopening_with_a_wrong_passphrase_fails() {
        let dir = tempfile::tempdir().unwrap();

        drop(OlmMachine::open("example", "DEVICEID", dir.path(), "DEFAULT_KEY").unwrap());

        assert!(OlmMachine::open("example", "DEVICEID", dir.path(), "WRONG_KEY").is_err());
    }

    #[test]
    fn absorbed_device_keys_survive_a_reload() {
        let dir = tempfile::tempdir().unwrap();
        let bob = machine(BOB_ID, BOB_DEVICE);
        let bob_ed25519 = bob.account().ed25519_key().to_base64();

        {
            let mut machine =
                OlmMachine::open("example", "DEVICEID", dir.path(), "DEFAULT_KEY").unwrap();
            machine
                .receive_keys_query_response(&keys_query_response_for(&bob))
                .unwrap();
            let device = machine.device_store().get(BOB_ID, BOB_DEVICE).unwrap();
            assert_eq!(device.ed25519(), bob_ed25519);
        }

        let machine = OlmMachine::open("example", "DEVICEID", dir.path(), "DEFAULT_KEY").unwrap();
        let device = machine.device_store().get(BOB_ID, BOB_DEVICE).unwrap();
        assert_eq!(device.ed25519(), bob_ed25519);
    }

    #[test]
    fn group_sessions_survive_a_reload() {
        let dir = tempfile::tempdir().unwrap();

        let (curve25519, session_id) = {
            let mut machine =
                OlmMachine::open("example", "DEVICEID", dir.path(), "DEFAULT_KEY").unwrap();
            machine.create_outbound_group_session("!test_room").unwrap();

            (
                machine.account().curve25519_key().to_base64(),
                machine
                    .outbound_group_session("!test_room")
                    .unwrap()
                    .session_id()
                    .to_owned(),
            )
        };

        let machine = OlmMachine::open("example", "DEVICEID", dir.path(), "DEFAULT_KEY").unwrap();
        let session = machine
            .inbound_group_store
            .get("!test_room", &curve25519, &session_id)
            .unwrap();
        assert_eq!(session.session_id(), session_id);
    }

    #[test]
    fn verified_fingerprints_survive_a_reload() {
        let dir = tempfile::tempdir().unwrap();
        let bob = machine(BOB_ID, BOB_DEVICE);
        let bob_device = device_of(&bob);

        {
            let mut machine =
                OlmMachine::open("example", "DEVICEID", dir.path(), "DEFAULT_KEY").unwrap();
            machine
                .receive_keys_query_response(&keys_query_response_for(&bob))
                .unwrap();
            machine.verify_device(&bob_device).unwrap();
        }

        let machine = OlmMachine::open("example", "DEVICEID", dir.path(), "DEFAULT_KEY").unwrap();
        assert!(machine.is_device_verified(&bob_device));
        assert!(machine.trust_store.check(&Fingerprint::from_device(&bob_device)));
    }
}
