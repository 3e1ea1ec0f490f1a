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

use serde_json::Value;
use vodozemac::{Ed25519PublicKey, Ed25519Signature};

use crate::error::SignatureError;

/// Convert a JSON value to the Matrix canonical representation.
///
/// Keys are sorted, no insignificant whitespace is emitted and non-ASCII
/// characters stay unescaped.
pub(crate) fn canonical_json(json: &Value) -> Result<String, SignatureError> {
    cjson::to_string(json).map_err(|e| SignatureError::CanonicalJson(format!("{e:?}")))
}

/// Verify a signed JSON object.
///
/// The object must have a signatures key associated with an object of the
/// form `user_id: {key_id: signature}`. The `signatures` and `unsigned`
/// fields don't take part in the signature.
///
/// # Arguments
///
/// * `user_id` - The user who signed the JSON object.
///
/// * `device_id` - The device that signed the JSON object.
///
/// * `signing_key` - The public ed25519 key which was used to sign the JSON
///   object.
///
/// * `json` - The JSON object that should be verified.
pub(crate) fn verify_json(
    user_id: &str,
    device_id: &str,
    signing_key: &str,
    json: &mut Value,
) -> Result<(), SignatureError> {
    let json_object = json.as_object_mut().ok_or(SignatureError::NotAnObject)?;
    let unsigned = json_object.remove("unsigned");
    let signatures = json_object.remove("signatures");

    let canonical = cjson::to_string(json_object)
        .map_err(|e| SignatureError::CanonicalJson(format!("{e:?}")))?;

    if let Some(u) = unsigned {
        json_object.insert("unsigned".to_owned(), u);
    }

    let key_id = format!("ed25519:{device_id}");

    let signatures = signatures.ok_or(SignatureError::NoSignatureFound)?;

    let ret = (|| {
        let signature = signatures
            .get(user_id)
            .and_then(|u| u.get(&key_id))
            .and_then(|s| s.as_str())
            .ok_or(SignatureError::NoSignatureFound)?;

        let key = Ed25519PublicKey::from_base64(signing_key)
            .map_err(|_| SignatureError::MalformedSignature)?;
        let signature = Ed25519Signature::from_base64(signature)
            .map_err(|_| SignatureError::MalformedSignature)?;

        key.verify(canonical.as_bytes(), &signature)
            .map_err(|_| SignatureError::VerificationError)
    })();

    json_object.insert("signatures".to_owned(), signatures);

    ret
}
