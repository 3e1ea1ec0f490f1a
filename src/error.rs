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

use serde_json::Error as SerdeError;
use thiserror::Error;
use vodozemac::{
    megolm::{DecryptionError as MegolmDecryptionError, SessionKeyDecodeError},
    olm::{DecryptionError as OlmDecryptionError, SessionCreationError},
    DecodeError, KeyError,
};

use crate::store::CryptoStoreError;

pub type OlmResult<T> = Result<T, OlmError>;
pub type MegolmResult<T> = Result<T, MegolmError>;

/// Error representing a failure during a device to device cryptographic
/// operation.
#[derive(Error, Debug)]
pub enum OlmError {
    /// The event that should have been decrypted is malformed.
    #[error(transparent)]
    EventError(#[from] EventError),

    /// The received decrypted event couldn't be deserialized.
    #[error(transparent)]
    JsonError(#[from] SerdeError),

    /// A signature couldn't be created or checked.
    #[error(transparent)]
    Signature(#[from] SignatureError),

    /// The underlying Olm session operation returned an error.
    #[error("can't finish Olm Session operation {0}")]
    OlmSession(#[from] OlmDecryptionError),

    /// A new inbound session couldn't be created from a pre-key message.
    #[error("can't create a new Olm session {0}")]
    SessionCreation(#[from] SessionCreationError),

    /// A public key embedded in an event couldn't be decoded.
    #[error(transparent)]
    InvalidKey(#[from] KeyError),

    /// The storage layer returned an error.
    #[error("failed to read or write to the crypto store {0}")]
    Store(#[from] CryptoStoreError),

    /// The session with a device has become corrupted, none of the stored
    /// sessions were able to decrypt the message.
    #[error(
        "decryption failed likely because an Olm session with sender key {0} \
         was wedged"
    )]
    SessionWedged(String),

    /// Encryption failed because the device does not have a valid Olm session
    /// with us.
    #[error(
        "encryption failed because the device does not \
            have a valid Olm session with us"
    )]
    MissingSession,
}

/// Error representing a failure during a group encryption operation.
#[derive(Error, Debug)]
pub enum MegolmError {
    /// The event that should have been decrypted is malformed.
    #[error(transparent)]
    EventError(#[from] EventError),

    /// The received decrypted event couldn't be deserialized.
    #[error(transparent)]
    JsonError(#[from] SerdeError),

    /// Decryption failed because the session needed to decrypt the event is
    /// missing.
    #[error("decryption failed because the session to decrypt the message is missing")]
    MissingSession,

    /// The underlying group session operation returned an error.
    #[error("can't finish Megolm operation {0}")]
    Decryption(#[from] MegolmDecryptionError),

    /// The received session key couldn't be decoded.
    #[error("the session key isn't a valid Megolm session export {0}")]
    InvalidSessionKey(#[from] SessionKeyDecodeError),

    /// The ciphertext wasn't a valid Megolm message.
    #[error("the ciphertext isn't a valid Megolm message {0}")]
    Decode(#[from] DecodeError),

    /// The storage layer returned an error.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),
}

/// Error representing a failure while sharing an outbound group session with
/// the devices of the room members.
#[derive(Error, Debug)]
pub enum ShareError {
    /// Some of the recipient devices have never been marked as trusted nor
    /// blacklisted, the user needs to decide first.
    #[error(
        "refusing to share the room key, the trust state of the devices \
         {0:?} hasn't been decided yet"
    )]
    UnsetTrust(Vec<(String, String)>),

    /// Some of the recipient devices don't have an established Olm session,
    /// one-time keys need to be claimed for them first.
    #[error("missing Olm sessions for the devices {0:?}")]
    MissingSessions(Vec<(String, String)>),

    /// Encrypting the room key for a device failed.
    #[error(transparent)]
    Olm(#[from] OlmError),
}

/// Error for a received event that fails the envelope checks after it was
/// successfully decrypted.
#[derive(Error, Debug)]
pub enum EventError {
    #[error("the Olm message has a unsupported type")]
    UnsupportedOlmType,

    #[error("the Encrypted message has been encrypted with a unsupported algorithm")]
    UnsupportedAlgorithm,

    #[error("the Encrypted message doesn't contain a ciphertext for our device")]
    MissingCiphertext,

    #[error("the Encrypted message is missing the signing key of the sender")]
    MissingSigningKey,

    #[error("the sender of the plaintext doesn't match the sender of the encrypted message")]
    MismatchedSender,

    #[error("the event was encrypted for another user or device")]
    MismatchedRecipient,

    #[error("the keys of the message don't match the keys of the claimed sender device")]
    MismatchedKeys,

    #[error("the sender device {1} of {0} isn't known to us")]
    UnknownDevice(String, String),

    #[error("the decrypted plaintext wasn't valid UTF-8")]
    InvalidPlaintext,
}

/// Error type describing failures that happen when we check or create
/// signatures for a Matrix JSON object.
#[derive(Error, Debug)]
pub enum SignatureError {
    /// The provided JSON value that was signed and whose signature should be
    /// checked isn't a valid JSON object.
    #[error("the provided JSON value isn't an object")]
    NotAnObject,

    /// The provided JSON object doesn't contain a signature for the expected
    /// user and key.
    #[error("the provided JSON object doesn't contain a signatures field")]
    NoSignatureFound,

    /// The signing key that should create or check a signature is missing.
    #[error("the signing key is missing from the object that signed the message")]
    MissingSigningKey,

    /// The signature or the key weren't valid base64 encoded ed25519 values.
    #[error("the signature or the signing key couldn't be decoded")]
    MalformedSignature,

    /// The signed object couldn't be converted to canonical JSON.
    #[error("the object can't be converted to canonical JSON: {0}")]
    CanonicalJson(String),

    /// The signature couldn't be verified.
    #[error("the signature didn't match the provided key")]
    VerificationError,

    /// The signed object couldn't be deserialized.
    #[error(transparent)]
    JsonError(#[from] SerdeError),
}
