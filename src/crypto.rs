//! Digest helpers: SHA-256 hex digests and canonical JSON rendering.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Hash inputs (concatenate as bytes, SHA-256) and return lowercase hex.
pub fn hash_concat(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for p in parts {
        hasher.update(p);
    }
    hex::encode(hasher.finalize())
}

/// Render a value as compact JSON with object keys sorted at every level.
///
/// Going through `serde_json::Value` is what sorts the keys: its object map is
/// a `BTreeMap` as long as the `preserve_order` feature stays off.
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<String> {
    let value = serde_json::to_value(value)?;
    Ok(value.to_string())
}

/// SHA-256 hex digest of a value's canonical JSON form.
pub fn digest_canonical<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<String> {
    let json = canonical_json(value)?;
    Ok(hash_concat(&[json.as_bytes()]))
}
