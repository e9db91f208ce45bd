//! Cache value encoding.
//!
//! Values are stored as their JSON text. JSON objects and arrays are
//! additionally base64-encoded behind an `encoded:` prefix, and reads
//! reverse whichever form they find.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{de::DeserializeOwned, Serialize};

use crate::error::CacheError;

/// Prefix marking a base64-encoded JSON document.
pub const ENCODED_PREFIX: &str = "encoded:";

/// Encode `value` for storage under `key`.
pub fn encode_value<T: Serialize + ?Sized>(key: &str, value: &T) -> Result<String, CacheError> {
    let json = serde_json::to_string(value).map_err(|e| CacheError::Encoding {
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    if json.starts_with('{') || json.starts_with('[') {
        Ok(format!("{}{}", ENCODED_PREFIX, STANDARD.encode(json.as_bytes())))
    } else {
        Ok(json)
    }
}

/// Decode a stored value read from `key`.
pub fn decode_value<T: DeserializeOwned>(key: &str, stored: &str) -> Result<T, CacheError> {
    let encoding_error = |reason: String| CacheError::Encoding {
        key: key.to_string(),
        reason,
    };
    match stored.strip_prefix(ENCODED_PREFIX) {
        Some(payload) => {
            let bytes = STANDARD
                .decode(payload)
                .map_err(|e| encoding_error(e.to_string()))?;
            serde_json::from_slice(&bytes).map_err(|e| encoding_error(e.to_string()))
        }
        None => serde_json::from_str(stored).map_err(|e| encoding_error(e.to_string())),
    }
}
