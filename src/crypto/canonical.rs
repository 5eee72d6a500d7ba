//! Canonical byte form of an envelope, the sole signing input.
//!
//! The canonical form is the envelope serialized as JSON with the
//! `signature` and `encryption` members removed, every object's keys in
//! lexicographic order recursively, no insignificant whitespace, UTF-8.
//! Numbers render as serde_json emits them (plain integers, shortest
//! round-trip floats). Both ends must produce byte-identical output for the
//! same envelope, so this module is the single place that defines it.

use serde_json::Value;

use crate::artifact::BtpsEnvelope;
use crate::errors::Result;

/// Members excluded from the signing input.
const EXCLUDED_MEMBERS: [&str; 2] = ["signature", "encryption"];

/// Produce the canonical bytes of `envelope`.
///
/// The `document` is canonicalized exactly as it will travel: for an
/// encrypted envelope that is the base64 ciphertext string, so verifiers do
/// not need decryption keys.
pub fn canonical_bytes(envelope: &BtpsEnvelope) -> Result<Vec<u8>> {
    let mut value = serde_json::to_value(envelope)?;
    if let Value::Object(map) = &mut value {
        for member in EXCLUDED_MEMBERS {
            map.remove(member);
        }
    }
    // serde_json's default object representation is a BTreeMap, which makes
    // lexicographic key order hold recursively for free.
    Ok(serde_json::to_vec(&value)?)
}
