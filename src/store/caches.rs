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

//! In-memory stores holding the live state of the machine.

use std::collections::HashMap;

use dashmap::{DashMap, ReadOnlyView};

use crate::identities::{Device, LocalTrust};
use crate::olm::{InboundGroupSession, Session};

/// In-memory store for Olm sessions, grouped by the curve25519 key of the
/// device on the other end.
///
/// The sessions of a device are kept sorted by their session id, the first
/// session of a group is the one used for encryption.
#[derive(Debug, Default)]
pub struct SessionStore {
    entries: HashMap<String, Vec<Session>>,
}

impl SessionStore {
    /// Create a new empty session store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session to the store.
    ///
    /// Returns false if an equal session is already present, the store is
    /// left untouched in that case.
    pub fn add(&mut self, session: Session) -> bool {
        let sessions = self.entries.entry(session.sender_key().to_owned()).or_default();

        match sessions.binary_search_by(|s| s.session_id().cmp(session.session_id())) {
            Ok(_) => false,
            Err(position) => {
                sessions.insert(position, session);
                true
            }
        }
    }

    /// Get the active session for the given device, the one with the
    /// smallest session id.
    pub fn get(&self, sender_key: &str) -> Option<&Session> {
        self.entries.get(sender_key).and_then(|s| s.first())
    }

    /// Get a mutable reference to the active session for the given device.
    pub fn get_mut(&mut self, sender_key: &str) -> Option<&mut Session> {
        self.entries.get_mut(sender_key).and_then(|s| s.first_mut())
    }

    /// Get all the sessions that were established with the given device.
    pub fn sessions(&self, sender_key: &str) -> Option<&[Session]> {
        self.entries.get(sender_key).map(|s| s.as_slice())
    }

    /// Get mutable access to all the sessions of the given device.
    pub fn sessions_mut(&mut self, sender_key: &str) -> Option<&mut Vec<Session>> {
        self.entries.get_mut(sender_key)
    }

    /// Does the given device have at least one established session.
    pub fn contains_key(&self, sender_key: &str) -> bool {
        self.entries.get(sender_key).map(|s| !s.is_empty()).unwrap_or(false)
    }

    /// Iterate over the `(curve25519 key, sorted sessions)` pairs of the
    /// store.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Session])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

/// In-memory store holding the inbound group sessions, keyed by the room
/// they belong to, the curve25519 key of the sender and their session id.
#[derive(Debug, Default)]
pub struct GroupSessionStore {
    entries: HashMap<String, HashMap<String, HashMap<String, InboundGroupSession>>>,
}

impl GroupSessionStore {
    /// Create a new empty group session store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an inbound group session to the store.
    ///
    /// Returns false if a session with the same `(room, sender, session id)`
    /// triple is already present. The existing session stays authoritative.
    pub fn add(&mut self, session: InboundGroupSession) -> bool {
        let sessions = self
            .entries
            .entry(session.room_id().to_owned())
            .or_default()
            .entry(session.sender_key().to_owned())
            .or_default();

        if sessions.contains_key(session.session_id()) {
            false
        } else {
            sessions.insert(session.session_id().to_owned(), session);
            true
        }
    }

    /// Get the session for the given room, sender and session id.
    pub fn get(
        &self,
        room_id: &str,
        sender_key: &str,
        session_id: &str,
    ) -> Option<&InboundGroupSession> {
        self.entries
            .get(room_id)
            .and_then(|m| m.get(sender_key))
            .and_then(|m| m.get(session_id))
    }

    /// Get mutable access to the session for the given room, sender and
    /// session id.
    pub fn get_mut(
        &mut self,
        room_id: &str,
        sender_key: &str,
        session_id: &str,
    ) -> Option<&mut InboundGroupSession> {
        self.entries
            .get_mut(room_id)
            .and_then(|m| m.get_mut(sender_key))
            .and_then(|m| m.get_mut(session_id))
    }

    /// Is the session with the given triple known to the store.
    pub fn contains(&self, room_id: &str, sender_key: &str, session_id: &str) -> bool {
        self.get(room_id, sender_key, session_id).is_some()
    }
}

/// A read-only view over all devices of a user.
pub struct UserDevices {
    entries: ReadOnlyView<String, Device>,
}

impl UserDevices {
    /// Get the device with the given device id.
    pub fn get(&self, device_id: &str) -> Option<Device> {
        self.entries.get(device_id).cloned()
    }

    /// Iterator over the ids of the devices of the user.
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    /// Iterator over the devices of the user.
    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.entries.values()
    }
}

enum AddOutcome {
    Insert,
    Replace,
    Update,
    Skip,
    Reject,
}

/// In-memory registry holding the devices of all the users we share an
/// encrypted room with.
#[derive(Clone, Debug, Default)]
pub struct DeviceStore {
    entries: DashMap<String, DashMap<String, Device>>,
}

impl DeviceStore {
    /// Create a new empty device registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device to the registry.
    ///
    /// Returns true if the device was newly stored. A device whose ed25519
    /// key conflicts with a live record for the same `(user, device id)`
    /// slot is silently rejected, the caller is expected to run the deletion
    /// path first.
    pub fn add(&self, device: Device) -> bool {
        let user_map = self.entries.entry(device.user_id().to_owned()).or_default();

        let outcome = match user_map.get(device.device_id()) {
            None => AddOutcome::Insert,
            Some(existing) => {
                if *existing == device {
                    AddOutcome::Skip
                } else if existing.is_deleted() {
                    AddOutcome::Replace
                } else if existing.ed25519() != device.ed25519() {
                    AddOutcome::Reject
                } else {
                    AddOutcome::Update
                }
            }
        };

        match outcome {
            AddOutcome::Insert | AddOutcome::Replace => {
                user_map.insert(device.device_id().to_owned(), device);
                true
            }
            AddOutcome::Update => {
                user_map.insert(device.device_id().to_owned(), device);
                false
            }
            AddOutcome::Skip | AddOutcome::Reject => false,
        }
    }

    /// Get the device with the given user and device id.
    pub fn get(&self, user_id: &str, device_id: &str) -> Option<Device> {
        self.entries
            .get(user_id)
            .and_then(|m| m.get(device_id).map(|d| d.value().clone()))
    }

    /// Flag the device with the given user and device id as deleted.
    ///
    /// Returns true if a device was found and flagged.
    pub fn remove(&self, user_id: &str, device_id: &str) -> bool {
        self.entries
            .get(user_id)
            .and_then(|m| m.get_mut(device_id).map(|mut d| d.mark_as_deleted()))
            .is_some()
    }

    /// Set the local trust state of the given device.
    ///
    /// Returns true if a device was found and updated.
    pub fn set_trust_state(&self, user_id: &str, device_id: &str, trust_state: LocalTrust) -> bool {
        self.entries
            .get(user_id)
            .and_then(|m| m.get_mut(device_id).map(|mut d| d.set_trust_state(trust_state)))
            .is_some()
    }

    /// Get a read-only view over all the devices of the given user.
    pub fn user_devices(&self, user_id: &str) -> UserDevices {
        if !self.entries.contains_key(user_id) {
            self.entries.insert(user_id.to_owned(), DashMap::new());
        }
        UserDevices {
            entries: self
                .entries
                .get(user_id)
                .expect("The user map was just inserted")
                .clone()
                .into_read_only(),
        }
    }

    /// Get the devices of a user that are neither deleted nor blacklisted.
    pub fn active_user_devices(&self, user_id: &str) -> Vec<Device> {
        self.entries
            .get(user_id)
            .map(|m| {
                m.iter()
                    .filter(|d| !d.is_deleted() && !d.is_blacklisted())
                    .map(|d| d.value().clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Get every device of the registry, deleted ones included.
    pub fn devices(&self) -> Vec<Device> {
        self.entries
            .iter()
            .flat_map(|u| u.value().iter().map(|d| d.value().clone()).collect::<Vec<_>>())
            .collect()
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::{DeviceStore, GroupSessionStore, SessionStore};
    use crate::identities::{Device, LocalTrust};
    use crate::olm::{Account, EncryptionSettings, InboundGroupSession, OutboundGroupSession};

    fn alice_device() -> Device {
        Device::new(
            "@alice:example.org",
            "ALDEVICE",
            "2MX1WOCAmE9eyywGdiMsQ4RxL2SIKVeyJXiSjVFycpA",
            "3MX1WOCAmE9eyywGdiMsQ4RxL2SIKVeyJXiSjVFycpA",
        )
    }

    fn session_for(account: &Account, remote: &mut Account) -> crate::olm::Session {
        remote.generate_one_time_keys(1);
        let one_time_key = *remote.one_time_keys().values().next().unwrap();
        remote.mark_keys_as_published();

        account.create_outbound_session(remote.curve25519_key(), one_time_key)
    }

    #[test]
    fn session_store_sorts_by_session_id() {
        let alice = Account::new("@alice:example.org", "ALDEVICE");
        let mut bob = Account::new("@bob:example.org", "BOBDEVICE");

        let first = session_for(&alice, &mut bob);
        let second = session_for(&alice, &mut bob);
        let third = session_for(&alice, &mut bob);

        let mut ids: Vec<String> = [&first, &second, &third]
            .iter()
            .map(|s| s.session_id().to_owned())
            .collect();
        ids.sort();
        let smallest = ids.first().unwrap().clone();

        let mut store = SessionStore::new();
        assert!(store.get(&bob.curve25519_key().to_base64()).is_none());

        assert!(store.add(first));
        assert!(store.add(second));
        assert!(store.add(third));

        let sender_key = bob.curve25519_key().to_base64();
        assert_eq!(store.get(&sender_key).unwrap().session_id(), smallest);

        let sessions = store.sessions(&sender_key).unwrap();
        let stored_ids: Vec<&str> = sessions.iter().map(|s| s.session_id()).collect();
        assert_eq!(stored_ids, ids.iter().map(|s| s.as_str()).collect::<Vec<_>>());
    }

    #[test]
    fn session_store_add_is_idempotent() {
        let alice = Account::new("@alice:example.org", "ALDEVICE");
        let mut bob = Account::new("@bob:example.org", "BOBDEVICE");

        let session = session_for(&alice, &mut bob);
        let duplicate = crate::olm::Session::from_pickle(session.pickle());

        let mut store = SessionStore::new();
        assert!(store.add(session));
        assert!(!store.add(duplicate));

        let sender_key = bob.curve25519_key().to_base64();
        assert_eq!(store.sessions(&sender_key).unwrap().len(), 1);
    }

    #[test]
    fn group_session_store_add_is_idempotent() {
        let outbound = OutboundGroupSession::new(
            "ALDEVICE",
            "2MX1WOCAmE9eyywGdiMsQ4RxL2SIKVeyJXiSjVFycpA",
            "!test:example.org",
            EncryptionSettings::default(),
        );

        let session = InboundGroupSession::new(
            "2MX1WOCAmE9eyywGdiMsQ4RxL2SIKVeyJXiSjVFycpA",
            "3MX1WOCAmE9eyywGdiMsQ4RxL2SIKVeyJXiSjVFycpA",
            "!test:example.org",
            &outbound.session_key(),
        );
        let duplicate = InboundGroupSession::from_pickle(session.pickle());
        let session_id = session.session_id().to_owned();

        let mut store = GroupSessionStore::new();

        assert!(!store.contains(
            "!test:example.org",
            "2MX1WOCAmE9eyywGdiMsQ4RxL2SIKVeyJXiSjVFycpA",
            &session_id
        ));
        assert!(store.add(session));
        assert!(!store.add(duplicate));
        assert!(store
            .get(
                "!test:example.org",
                "2MX1WOCAmE9eyywGdiMsQ4RxL2SIKVeyJXiSjVFycpA",
                &session_id
            )
            .is_some());
    }

    #[test]
    fn device_store_add_is_idempotent() {
        let store = DeviceStore::new();
        let device = alice_device();

        assert!(store.add(device.clone()));
        assert!(!store.add(device.clone()));

        assert_eq!(store.get(device.user_id(), device.device_id()).unwrap(), device);
    }

    #[test]
    fn device_store_rejects_a_live_fingerprint_conflict() {
        let store = DeviceStore::new();
        let device = alice_device();
        store.add(device.clone());

        let imposter = Device::new(
            device.user_id(),
            device.device_id(),
            "AmE9eyywGdiMsQ4RxL2SIKVeyJXiSjVFycpA2MX1WOC",
            device.curve25519(),
        );

        assert!(!store.add(imposter));
        assert_eq!(
            store.get(device.user_id(), device.device_id()).unwrap().ed25519(),
            device.ed25519()
        );
    }

    #[test]
    fn deleted_devices_are_not_active() {
        let store = DeviceStore::new();
        let device = alice_device();
        store.add(device.clone());

        assert_eq!(store.active_user_devices(device.user_id()).len(), 1);

        assert!(store.remove(device.user_id(), device.device_id()));
        assert!(store.get(device.user_id(), device.device_id()).unwrap().is_deleted());
        assert!(store.active_user_devices(device.user_id()).is_empty());
    }

    #[test]
    fn blacklisted_devices_are_not_active() {
        let store = DeviceStore::new();
        let device = alice_device();
        store.add(device.clone());

        store.set_trust_state(device.user_id(), device.device_id(), LocalTrust::BlackListed);
        assert!(store.active_user_devices(device.user_id()).is_empty());

        store.set_trust_state(device.user_id(), device.device_id(), LocalTrust::Verified);
        assert_eq!(store.active_user_devices(device.user_id()).len(), 1);
    }

    proptest! {
        #[test]
        fn device_store_add_twice_never_reports_new(
            user in "@[a-z]{1,8}:example\\.org",
            device_id in "[A-Z]{10}",
            ed25519 in "[A-Za-z0-9+/]{43}",
            curve25519 in "[A-Za-z0-9+/]{43}",
        ) {
            let store = DeviceStore::new();
            let device = Device::new(&user, &device_id, &ed25519, &curve25519);

            prop_assert!(store.add(device.clone()));
            prop_assert!(!store.add(device.clone()));
            prop_assert_eq!(store.user_devices(&user).devices().count(), 1);
        }
    }
}
