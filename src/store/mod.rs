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

//! Storage abstraction and the provided store implementations.

use core::fmt::Debug;
use std::io::Error as IoError;

use serde_json::Error as SerdeError;
use thiserror::Error;

use crate::identities::Device;
use crate::olm::{Account, InboundGroupSession, Session};

mod caches;
mod fingerprints;
mod memorystore;
mod pickle_key;
mod sled_store;

pub use caches::{DeviceStore, GroupSessionStore, SessionStore, UserDevices};
pub use fingerprints::{Fingerprint, FingerprintStore};
pub use memorystore::MemoryStore;
pub use sled_store::SledStore;
pub(crate) use pickle_key::{EncryptedPickleKey, PickleKey};

/// The error type for the storage layer.
#[derive(Error, Debug)]
pub enum CryptoStoreError {
    /// The store couldn't be read or written.
    #[error("can't read or write from the store")]
    Io(#[from] IoError),

    /// A value couldn't be (de)serialized for the store.
    #[error("error serializing data for the store")]
    Serialization(#[from] SerdeError),

    /// A stored pickle couldn't be decrypted, usually because the store was
    /// opened with the wrong passphrase.
    #[error("a pickle couldn't be decrypted, was the store opened with the right passphrase?")]
    UnpicklingError,

    /// A pickle couldn't be encrypted for the store.
    #[error("a pickle couldn't be encrypted for the store")]
    PicklingError,

    /// The underlying database returned an error.
    #[error("database error: {0}")]
    Database(#[from] sled::Error),
}

/// The result type of the storage layer.
pub type Result<T> = std::result::Result<T, CryptoStoreError>;

/// Trait abstracting over the storage backend for the encryption state.
///
/// Every mutating call persists synchronously, multi-row updates are applied
/// atomically so that a crash leaves either the pre- or the post-update
/// state behind.
pub trait CryptoStore: Debug {
    /// Load the account, if one was stored before.
    fn load_account(&self) -> Result<Option<Account>>;

    /// Save the account.
    fn save_account(&mut self, account: &Account) -> Result<()>;

    /// Save an Olm session.
    fn save_session(&mut self, session: &Session) -> Result<()>;

    /// Load every stored Olm session.
    fn load_sessions(&self) -> Result<Vec<Session>>;

    /// Save an inbound group session.
    fn save_inbound_group_session(&mut self, session: &InboundGroupSession) -> Result<()>;

    /// Load every stored inbound group session.
    fn load_inbound_group_sessions(&self) -> Result<Vec<InboundGroupSession>>;

    /// Save a batch of device records in one atomic write.
    fn save_device_keys(&mut self, devices: &[Device]) -> Result<()>;

    /// Load every stored device record, tombstones of deleted devices
    /// included.
    fn load_device_keys(&self) -> Result<Vec<Device>>;
}
