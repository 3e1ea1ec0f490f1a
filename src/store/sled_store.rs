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
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::{Batch, Config, Db, Tree};
use tracing::debug;

use super::{CryptoStore, CryptoStoreError, EncryptedPickleKey, PickleKey, Result};
use crate::identities::Device;
use crate::olm::{Account, InboundGroupSession, PickledAccount, PickledInboundGroupSession,
    PickledSession, Session};

const ACCOUNT_KEY: &str = "account";
const PICKLE_KEY_KEY: &str = "pickle_key";

trait EncodeKey {
    const SEPARATOR: u8 = 0xff;
    fn encode(&self) -> Vec<u8>;
}

impl EncodeKey for &str {
    fn encode(&self) -> Vec<u8> {
        [self.as_bytes(), &[Self::SEPARATOR]].concat()
    }
}

impl EncodeKey for (&str, &str) {
    fn encode(&self) -> Vec<u8> {
        [
            self.0.as_bytes(),
            &[Self::SEPARATOR],
            self.1.as_bytes(),
            &[Self::SEPARATOR],
        ]
        .concat()
    }
}

impl EncodeKey for (&str, &str, &str) {
    fn encode(&self) -> Vec<u8> {
        [
            self.0.as_bytes(),
            &[Self::SEPARATOR],
            self.1.as_bytes(),
            &[Self::SEPARATOR],
            self.2.as_bytes(),
            &[Self::SEPARATOR],
        ]
        .concat()
    }
}

/// A store persisting the encryption state in a sled database.
///
/// Every `(user id, device id)` pair gets its own database under the store
/// directory. Pickles are encrypted at rest with a pickle key that is
/// wrapped by the passphrase given at open time.
pub struct SledStore {
    inner: Db,
    pickle_key: PickleKey,

    account: Tree,
    sessions: Tree,
    inbound_group_sessions: Tree,
    devices: Tree,
}

impl fmt::Debug for SledStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SledStore").finish_non_exhaustive()
    }
}

impl SledStore {
    /// Open the store for the given account inside the given directory.
    ///
    /// The passphrase protects all the pickled ratchet states, opening an
    /// existing store with a different passphrase fails with an unpickling
    /// error.
    pub fn open(
        user_id: &str,
        device_id: &str,
        directory: impl AsRef<Path>,
        passphrase: &str,
    ) -> Result<Self> {
        let path = directory
            .as_ref()
            .join(format!("{user_id}_{device_id}.db"));

        debug!("Opening the crypto store at {:?}", path);

        let db = Config::new().temporary(false).path(path).open()?;

        let account = db.open_tree("account")?;
        let sessions = db.open_tree("sessions")?;
        let inbound_group_sessions = db.open_tree("inbound_group_sessions")?;
        let devices = db.open_tree("devices")?;

        let pickle_key = SledStore::get_or_create_pickle_key(passphrase, &db)?;

        Ok(SledStore {
            inner: db,
            pickle_key,
            account,
            sessions,
            inbound_group_sessions,
            devices,
        })
    }

    fn get_or_create_pickle_key(passphrase: &str, database: &Db) -> Result<PickleKey> {
        if let Some(stored) = database.get(PICKLE_KEY_KEY.encode())? {
            let encrypted: EncryptedPickleKey = serde_json::from_slice(&stored)
                .map_err(|_| CryptoStoreError::UnpicklingError)?;

            PickleKey::from_encrypted(passphrase, &encrypted)
        } else {
            let key = PickleKey::new()?;
            let encrypted = key.encrypt(passphrase)?;
            database.insert(PICKLE_KEY_KEY.encode(), serde_json::to_vec(&encrypted)?)?;

            Ok(key)
        }
    }

    fn serialize_value(&self, value: &impl Serialize) -> Result<Vec<u8>> {
        self.pickle_key.encrypt_value(&serde_json::to_vec(value)?)
    }

    fn deserialize_value<T: DeserializeOwned>(&self, value: &[u8]) -> Result<T> {
        let plaintext = self.pickle_key.decrypt_value(value)?;
        serde_json::from_slice(&plaintext).map_err(|_| CryptoStoreError::UnpicklingError)
    }
}

impl CryptoStore for SledStore {
    fn load_account(&self) -> Result<Option<Account>> {
        self.account
            .get(ACCOUNT_KEY.encode())?
            .map(|stored| {
                let pickle: PickledAccount = self.deserialize_value(&stored)?;
                Ok(Account::from_pickle(pickle))
            })
            .transpose()
    }

    fn save_account(&mut self, account: &Account) -> Result<()> {
        let value = self.serialize_value(&account.pickle())?;
        self.account.insert(ACCOUNT_KEY.encode(), value)?;
        self.inner.flush()?;

        Ok(())
    }

    fn save_session(&mut self, session: &Session) -> Result<()> {
        let key = (session.sender_key(), session.session_id()).encode();
        let value = self.serialize_value(&session.pickle())?;

        self.sessions.insert(key, value)?;
        self.inner.flush()?;

        Ok(())
    }

    fn load_sessions(&self) -> Result<Vec<Session>> {
        self.sessions
            .iter()
            .map(|entry| {
                let (_, stored) = entry?;
                let pickle: PickledSession = self.deserialize_value(&stored)?;
                Ok(Session::from_pickle(pickle))
            })
            .collect()
    }

    fn save_inbound_group_session(&mut self, session: &InboundGroupSession) -> Result<()> {
        let key = (session.room_id(), session.sender_key(), session.session_id()).encode();
        let value = self.serialize_value(&session.pickle())?;

        self.inbound_group_sessions.insert(key, value)?;
        self.inner.flush()?;

        Ok(())
    }

    fn load_inbound_group_sessions(&self) -> Result<Vec<InboundGroupSession>> {
        self.inbound_group_sessions
            .iter()
            .map(|entry| {
                let (_, stored) = entry?;
                let pickle: PickledInboundGroupSession = self.deserialize_value(&stored)?;
                Ok(InboundGroupSession::from_pickle(pickle))
            })
            .collect()
    }

    fn save_device_keys(&mut self, devices: &[Device]) -> Result<()> {
        let mut batch = Batch::default();

        for device in devices {
            let key = (device.user_id(), device.device_id(), device.ed25519()).encode();
            batch.insert(key, serde_json::to_vec(device)?);
        }

        self.devices.apply_batch(batch)?;
        self.inner.flush()?;

        Ok(())
    }

    fn load_device_keys(&self) -> Result<Vec<Device>> {
        self.devices
            .iter()
            .map(|entry| {
                let (_, stored) = entry?;
                Ok(serde_json::from_slice(&stored)?)
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::SledStore;
    use crate::identities::Device;
    use crate::olm::{Account, EncryptionSettings, InboundGroupSession, OutboundGroupSession};
    use crate::store::{CryptoStore, CryptoStoreError};

    fn open(directory: &std::path::Path) -> SledStore {
        SledStore::open("example", "DEVICEID", directory, "DEFAULT_KEY").unwrap()
    }

    #[test]
    fn account_round_trip() {
        let dir = tempfile::tempdir().unwrap();

        let account = Account::new("example", "DEVICEID");
        let curve25519 = account.curve25519_key();
        let ed25519 = account.ed25519_key();

        {
            let mut store = open(dir.path());
            assert!(store.load_account().unwrap().is_none());
            store.save_account(&account).unwrap();
        }

        let store = open(dir.path());
        let loaded = store.load_account().unwrap().unwrap();

        assert_eq!(loaded.curve25519_key(), curve25519);
        assert_eq!(loaded.ed25519_key(), ed25519);
    }

    #[test]
    fn wrong_passphrase_is_an_error() {
        let dir = tempfile::tempdir().unwrap();

        {
            let mut store = open(dir.path());
            store.save_account(&Account::new("example", "DEVICEID")).unwrap();
        }

        let result = SledStore::open("example", "DEVICEID", dir.path(), "WRONG_KEY");

        assert!(matches!(
            result.unwrap_err(),
            CryptoStoreError::UnpicklingError
        ));
    }

    #[test]
    fn session_round_trip() {
        let dir = tempfile::tempdir().unwrap();

        let alice = Account::new("example", "DEVICEID");
        let mut bob = Account::new("@bob:example.org", "BOBDEVICE");
        bob.generate_one_time_keys(1);
        let one_time_key = *bob.one_time_keys().values().next().unwrap();

        let session = alice.create_outbound_session(bob.curve25519_key(), one_time_key);
        let session_id = session.session_id().to_owned();

        {
            let mut store = open(dir.path());
            store.save_session(&session).unwrap();
        }

        let store = open(dir.path());
        let sessions = store.load_sessions().unwrap();

        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id(), session_id);
        assert_eq!(sessions[0].sender_key(), bob.curve25519_key().to_base64());
    }

    #[test]
    fn inbound_group_session_round_trip() {
        let dir = tempfile::tempdir().unwrap();

        let outbound = OutboundGroupSession::new(
            "DEVICEID",
            "sender+key",
            "!test_room",
            EncryptionSettings::default(),
        );
        let session = InboundGroupSession::new(
            "sender+key",
            "signing+key",
            "!test_room",
            &outbound.session_key(),
        );

        {
            let mut store = open(dir.path());
            store.save_inbound_group_session(&session).unwrap();
        }

        let store = open(dir.path());
        let sessions = store.load_inbound_group_sessions().unwrap();

        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id(), outbound.session_id());
        assert_eq!(sessions[0].room_id(), "!test_room");
    }

    #[test]
    fn fingerprint_changes_keep_both_records() {
        let dir = tempfile::tempdir().unwrap();

        let mut old = Device::new("@alice:example.org", "ALDEVICE", "old+key", "curve+key");
        old.mark_as_deleted();
        let new = Device::new("@alice:example.org", "ALDEVICE", "new+key", "curve+key");

        {
            let mut store = open(dir.path());
            store.save_device_keys(&[old, new]).unwrap();
        }

        let store = open(dir.path());
        let devices = store.load_device_keys().unwrap();

        assert_eq!(devices.len(), 2);
        assert_eq!(devices.iter().filter(|d| d.is_deleted()).count(), 1);
        assert_eq!(devices.iter().filter(|d| !d.is_deleted()).count(), 1);
    }
}
