//! Conversions between record fields and their column representations.
//!
//! Counters are `u32` in records and `BIGINT` in the schema; nested
//! collections are stored as JSON text.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::DbError;

/// Widen a counter for storage.
pub fn count_to_db(value: u32) -> i64 {
    i64::from(value)
}

/// Narrow a stored counter, saturating out-of-range values.
pub fn count_from_db(value: i64) -> u32 {
    if value <= 0 {
        return 0;
    }
    u32::try_from(value).unwrap_or(u32::MAX)
}

/// Narrow a stored port; out-of-range values read as 0.
pub fn port_from_db(value: i64) -> u16 {
    u16::try_from(value).unwrap_or(0)
}

/// Convert a row limit for binding.
pub fn limit_to_db(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Encode a nested collection as JSON text.
///
/// # Errors
///
/// Returns [`DbError::Serialization`] if the value cannot be encoded.
pub fn encode_json<T: Serialize + ?Sized>(value: &T) -> Result<String, DbError> {
    Ok(serde_json::to_string(value)?)
}

/// Decode a nested collection from JSON text.
///
/// # Errors
///
/// Returns [`DbError::Serialization`] if the text is not valid for `T`.
pub fn decode_json<T: DeserializeOwned>(text: &str) -> Result<T, DbError> {
    Ok(serde_json::from_str(text)?)
}
