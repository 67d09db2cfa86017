//! Self-describing zstd framing for stored payloads
//!
//! Frames are `[tag][body]`: tag `N` is a raw body, tag `Z` a zstd body.

use crate::error::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};

const RAW: u8 = b'N';
const ZSTD: u8 = b'Z';

/// Compression preset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    #[default]
    None,
    /// zstd level 1
    Fast,
    /// zstd level 3
    Balanced,
    /// zstd level 19
    High,
}

impl Compression {
    /// zstd level, `None` when uncompressed
    #[must_use]
    pub fn zstd_level(self) -> Option<i32> {
        match self {
            Self::None => None,
            Self::Fast => Some(1),
            Self::Balanced => Some(3),
            Self::High => Some(19),
        }
    }
}

/// Frame `data` with the given preset
///
/// Falls back to a raw frame when compression does not shrink the body.
///
/// # Errors
/// Returns error if the zstd encoder fails
pub fn encode(data: &[u8], compression: Compression) -> StoreResult<Vec<u8>> {
    if let Some(level) = compression.zstd_level() {
        let compressed =
            zstd::encode_all(data, level).map_err(|e| StoreError::Compression(e.to_string()))?;
        if compressed.len() < data.len() {
            let mut framed = Vec::with_capacity(compressed.len() + 1);
            framed.push(ZSTD);
            framed.extend_from_slice(&compressed);
            return Ok(framed);
        }
    }
    let mut framed = Vec::with_capacity(data.len() + 1);
    framed.push(RAW);
    framed.extend_from_slice(data);
    Ok(framed)
}

/// Unwrap a frame written by [`encode`]
///
/// # Errors
/// Returns error on an unknown tag or a corrupt zstd body
pub fn decode(framed: &[u8]) -> StoreResult<Vec<u8>> {
    match framed.split_first() {
        Some((&RAW, body)) => Ok(body.to_vec()),
        Some((&ZSTD, body)) => {
            zstd::decode_all(body).map_err(|e| StoreError::Compression(e.to_string()))
        }
        Some((tag, _)) => Err(StoreError::Compression(format!("unknown frame tag {tag:#04x}"))),
        None => Err(StoreError::Compression("empty frame".to_string())),
    }
}
