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

use super::{CryptoStore, Result};
use crate::identities::Device;
use crate::olm::{Account, InboundGroupSession, PickledAccount, PickledInboundGroupSession,
    PickledSession, Session};

/// An in-memory only store that forgets all the keys once it's dropped.
///
/// Values are held in their pickled form, loading reconstructs them the same
/// way a persistent store would.
#[derive(Debug, Default)]
pub struct MemoryStore {
    account: Option<Vec<u8>>,
    sessions: HashMap<(String, String), Vec<u8>>,
    inbound_group_sessions: HashMap<(String, String, String), Vec<u8>>,
    devices: HashMap<(String, String, String), Vec<u8>>,
}

impl MemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl CryptoStore for MemoryStore {
    fn load_account(&self) -> Result<Option<Account>> {
        self.account
            .as_deref()
            .map(|bytes| {
                let pickle: PickledAccount = serde_json::from_slice(bytes)?;
                Ok(Account::from_pickle(pickle))
            })
            .transpose()
    }

    fn save_account(&mut self, account: &Account) -> Result<()> {
        self.account = Some(serde_json::to_vec(&account.pickle())?);
        Ok(())
    }

    fn save_session(&mut self, session: &Session) -> Result<()> {
        let key = (session.sender_key().to_owned(), session.session_id().to_owned());
        self.sessions.insert(key, serde_json::to_vec(&session.pickle())?);
        Ok(())
    }

    fn load_sessions(&self) -> Result<Vec<Session>> {
        self.sessions
            .values()
            .map(|bytes| {
                let pickle: PickledSession = serde_json::from_slice(bytes)?;
                Ok(Session::from_pickle(pickle))
            })
            .collect()
    }

    fn save_inbound_group_session(&mut self, session: &InboundGroupSession) -> Result<()> {
        let key = (
            session.room_id().to_owned(),
            session.sender_key().to_owned(),
            session.session_id().to_owned(),
        );
        self.inbound_group_sessions
            .insert(key, serde_json::to_vec(&session.pickle())?);
        Ok(())
    }

    fn load_inbound_group_sessions(&self) -> Result<Vec<InboundGroupSession>> {
        self.inbound_group_sessions
            .values()
            .map(|bytes| {
                let pickle: PickledInboundGroupSession = serde_json::from_slice(bytes)?;
                Ok(InboundGroupSession::from_pickle(pickle))
            })
            .collect()
    }

    fn save_device_keys(&mut self, devices: &[Device]) -> Result<()> {
        for device in devices {
            let key = (
                device.user_id().to_owned(),
                device.device_id().to_owned(),
                device.ed25519().to_owned(),
            );
            self.devices.insert(key, serde_json::to_vec(device)?);
        }
        Ok(())
    }

    fn load_device_keys(&self) -> Result<Vec<Device>> {
        self.devices
            .values()
            .map(|bytes| Ok(serde_json::from_slice(bytes)?))
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::MemoryStore;
    use crate::identities::Device;
    use crate::olm::Account;
    use crate::store::CryptoStore;

    #[test]
    fn account_round_trip() {
        let mut store = MemoryStore::new();
        assert!(store.load_account().unwrap().is_none());

        let account = Account::new("@alice:example.org", "ALDEVICE");
        let curve25519 = account.curve25519_key();

        store.save_account(&account).unwrap();

        let loaded = store.load_account().unwrap().unwrap();
        assert_eq!(loaded.curve25519_key(), curve25519);
    }

    #[test]
    fn devices_keep_their_tombstones() {
        let mut store = MemoryStore::new();

        let mut old = Device::new("@alice:example.org", "ALDEVICE", "old+key", "curve");
        old.mark_as_deleted();
        let new = Device::new("@alice:example.org", "ALDEVICE", "new+key", "curve");

        store.save_device_keys(&[old, new]).unwrap();

        let devices = store.load_device_keys().unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices.iter().filter(|d| d.is_deleted()).count(), 1);
    }
}
