/*!
 * Binary Serialization with bincode
 * Encoding for variable-length reply data
 */

use super::errors::{ServerError, ServerResult};
use serde::{de::DeserializeOwned, Serialize};

/// Serialize to binary bytes using bincode
#[inline]
pub fn to_vec<T: Serialize>(value: &T) -> ServerResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| ServerError::invalid_parameter(e.to_string()))
}

/// Deserialize from binary bytes using bincode
#[inline]
pub fn from_slice<T: DeserializeOwned>(bytes: &[u8]) -> ServerResult<T> {
    bincode::deserialize(bytes).map_err(|e| ServerError::invalid_parameter(e.to_string()))
}

/// Serialize into a reply buffer of at most `max_size` bytes
///
/// Oversized payloads are truncated, never rejected.
pub fn to_reply<T: Serialize>(value: &T, max_size: usize) -> ServerResult<Vec<u8>> {
    let mut bytes = to_vec(value)?;
    bytes.truncate(max_size);
    Ok(bytes)
}
