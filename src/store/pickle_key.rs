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

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use pbkdf2::pbkdf2_hmac;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

use super::{CryptoStoreError, Result};

const KDF_ROUNDS: u32 = 10_000;
const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const SALT_SIZE: usize = 16;

/// The key that encrypts pickled ratchet states before they hit the
/// database.
///
/// The key itself is random, it is stored next to the data it protects,
/// wrapped by a key derived from the store passphrase.
pub(crate) struct PickleKey {
    key: Zeroizing<Vec<u8>>,
}

impl PickleKey {
    /// Generate a fresh random pickle key.
    pub fn new() -> Result<Self> {
        let mut key = Zeroizing::new(vec![0u8; KEY_SIZE]);
        getrandom::getrandom(&mut key)
            .map_err(|_| CryptoStoreError::PicklingError)?;

        Ok(PickleKey { key })
    }

    /// Wrap the pickle key with the given passphrase so it can be stored.
    pub fn encrypt(&self, passphrase: &str) -> Result<EncryptedPickleKey> {
        let mut salt = vec![0u8; SALT_SIZE];
        getrandom::getrandom(&mut salt)
            .map_err(|_| CryptoStoreError::PicklingError)?;

        let wrapping_key = derive_key(passphrase, &salt);
        let blob = encrypt(&wrapping_key, &self.key)?;

        Ok(EncryptedPickleKey {
            kdf_rounds: KDF_ROUNDS,
            kdf_salt: BASE64.encode(salt),
            nonce: blob.nonce,
            ciphertext: blob.ciphertext,
        })
    }

    /// Unwrap a stored pickle key using the given passphrase.
    ///
    /// Fails with an unpickling error if the passphrase doesn't match the
    /// one the key was wrapped with.
    pub fn from_encrypted(passphrase: &str, encrypted: &EncryptedPickleKey) -> Result<Self> {
        let salt = BASE64
            .decode(&encrypted.kdf_salt)
            .map_err(|_| CryptoStoreError::UnpicklingError)?;

        let mut wrapping_key = Zeroizing::new(vec![0u8; KEY_SIZE]);
        pbkdf2_hmac::<Sha256>(
            passphrase.as_bytes(),
            &salt,
            encrypted.kdf_rounds,
            &mut wrapping_key,
        );

        let key = decrypt(
            &wrapping_key,
            &EncryptedBlob {
                nonce: encrypted.nonce.clone(),
                ciphertext: encrypted.ciphertext.clone(),
            },
        )?;

        Ok(PickleKey { key: Zeroizing::new(key) })
    }

    /// Encrypt a serialized pickle.
    pub fn encrypt_value(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let blob = encrypt(&self.key, plaintext)?;
        Ok(serde_json::to_vec(&blob)?)
    }

    /// Decrypt a previously encrypted pickle.
    pub fn decrypt_value(&self, value: &[u8]) -> Result<Vec<u8>> {
        let blob: EncryptedBlob =
            serde_json::from_slice(value).map_err(|_| CryptoStoreError::UnpicklingError)?;
        decrypt(&self.key, &blob)
    }
}

/// The stored form of the pickle key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct EncryptedPickleKey {
    /// How many PBKDF2 rounds were used to derive the wrapping key.
    pub kdf_rounds: u32,
    /// The salt of the key derivation, base64 encoded.
    pub kdf_salt: String,
    /// The AES-GCM nonce, base64 encoded.
    pub nonce: String,
    /// The wrapped key, base64 encoded.
    pub ciphertext: String,
}

#[derive(Serialize, Deserialize)]
struct EncryptedBlob {
    nonce: String,
    ciphertext: String,
}

fn derive_key(passphrase: &str, salt: &[u8]) -> Zeroizing<Vec<u8>> {
    let mut key = Zeroizing::new(vec![0u8; KEY_SIZE]);
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, KDF_ROUNDS, &mut key);
    key
}

fn encrypt(key: &[u8], plaintext: &[u8]) -> Result<EncryptedBlob> {
    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|_| CryptoStoreError::PicklingError)?;

    let mut nonce = vec![0u8; NONCE_SIZE];
    getrandom::getrandom(&mut nonce).map_err(|_| CryptoStoreError::PicklingError)?;

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoStoreError::PicklingError)?;

    Ok(EncryptedBlob {
        nonce: BASE64.encode(nonce),
        ciphertext: BASE64.encode(ciphertext),
    })
}

fn decrypt(key: &[u8], blob: &EncryptedBlob) -> Result<Vec<u8>> {
    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|_| CryptoStoreError::UnpicklingError)?;

    let nonce = BASE64
        .decode(&blob.nonce)
        .map_err(|_| CryptoStoreError::UnpicklingError)?;
    let ciphertext = BASE64
        .decode(&blob.ciphertext)
        .map_err(|_| CryptoStoreError::UnpicklingError)?;

    if nonce.len() != NONCE_SIZE {
        return Err(CryptoStoreError::UnpicklingError);
    }

    cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
        .map_err(|_| CryptoStoreError::UnpicklingError)
}
