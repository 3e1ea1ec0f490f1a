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

#![doc = include_str!("../README.md")]
#![deny(
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications
)]

mod error;
mod identities;
mod machine;
pub mod olm;
mod requests;
mod responses;
pub mod store;

pub use error::{
    EventError, MegolmError, MegolmResult, OlmError, OlmResult, ShareError, SignatureError,
};
pub use identities::{Device, KeyAlgorithm, LocalTrust};
pub use machine::OlmMachine;
pub use requests::{KeysUploadRequest, ToDevicePayload};
pub use responses::{
    CiphertextInfo, DecryptedOlmEvent, DeviceKeys, KeysClaimResponse, KeysQueryResponse,
    KeysUploadResponse, MegolmEvent, MegolmEventContent, OlmEventContent, OlmEventKeys, Response,
    RoomKeyContent, SignedOneTimeKey, SyncResponse, ToDevice, ToDeviceEvent, UnsignedDeviceInfo,
};

/// The event encryption algorithm used for pairwise, device to device
/// encryption.
pub const OLM_ALGORITHM: &str = "m.olm.v1.curve25519-aes-sha2";

/// The event encryption algorithm used for room message encryption.
pub const MEGOLM_ALGORITHM: &str = "m.megolm.v1.aes-sha2";
