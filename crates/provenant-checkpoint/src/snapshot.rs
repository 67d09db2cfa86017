//! Snapshot payloads: full states, per-key diffs and the on-tier blob format
//!
//! Blob layout (52-byte header + body):
//! - Bytes 0-3:   magic `PSNP`
//! - Bytes 4-7:   format version (u32 little-endian)
//! - Bytes 8-39:  BLAKE3 digest of the body
//! - Bytes 40-47: body length (u64 little-endian)
//! - Bytes 48-51: reserved
//! - Bytes 52+:   compression frame around the JSON-encoded [`SnapshotBlob`]

use chrono::{DateTime, Utc};
use provenant_store::{compression, Compression};
use provenant_types::{ContentHash, SnapshotId, StateMap, Value};
use serde::{Deserialize, Serialize};

const MAGIC: &[u8; 4] = b"PSNP";
const FORMAT_VERSION: u32 = 1;
const HEADER_SIZE: usize = 52;

/// One per-key change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DiffOp {
    Insert { key: String, value: Value },
    Replace { key: String, value: Value },
    Remove { key: String },
}

/// Ordered per-key changes turning one state into another
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDiff {
    pub ops: Vec<DiffOp>,
}

/// A diff that does not fit the state it is applied to
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiffError {
    #[error("insert of existing key {0}")]
    KeyExists(String),
    #[error("replace or remove of missing key {0}")]
    KeyMissing(String),
}

impl StateDiff {
    /// Changes from `old` to `new`
    #[must_use]
    pub fn between(old: &StateMap, new: &StateMap) -> Self {
        let mut ops = Vec::new();
        for (key, value) in new {
            match old.get(key) {
                None => ops.push(DiffOp::Insert {
                    key: key.clone(),
                    value: value.clone(),
                }),
                Some(prev) if prev != value => ops.push(DiffOp::Replace {
                    key: key.clone(),
                    value: value.clone(),
                }),
                Some(_) => {}
            }
        }
        for key in old.keys() {
            if !new.contains_key(key) {
                ops.push(DiffOp::Remove { key: key.clone() });
            }
        }
        Self { ops }
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Apply in order
    ///
    /// # Errors
    /// Returns error if an op does not match the state (a sign the diff
    /// belongs to a different parent)
    pub fn apply(&self, state: &mut StateMap) -> Result<(), DiffError> {
        for op in &self.ops {
            match op {
                DiffOp::Insert { key, value } => {
                    if state.contains_key(key) {
                        return Err(DiffError::KeyExists(key.clone()));
                    }
                    state.insert(key.clone(), value.clone());
                }
                DiffOp::Replace { key, value } => match state.get_mut(key) {
                    Some(slot) => *slot = value.clone(),
                    None => return Err(DiffError::KeyMissing(key.clone())),
                },
                DiffOp::Remove { key } => {
                    if state.remove(key).is_none() {
                        return Err(DiffError::KeyMissing(key.clone()));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Snapshot contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SnapshotBody {
    Full {
        state: StateMap,
        #[serde(default)]
        partial_results: StateMap,
    },
    Incremental {
        parent: SnapshotId,
        diff: StateDiff,
        #[serde(default)]
        partial_diff: StateDiff,
    },
}

/// Stored snapshot, at `snapshot/{id}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotBlob {
    pub id: SnapshotId,
    pub created_at: DateTime<Utc>,
    pub body: SnapshotBody,
}

/// Blob failed verification
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlobIntegrityError {
    #[error("blob too small: {size} bytes (minimum {minimum})")]
    TooSmall { size: usize, minimum: usize },

    #[error("invalid magic bytes: {found:?}")]
    InvalidMagic { found: [u8; 4] },

    #[error("unsupported format version {found} (supported up to {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("length mismatch: declared {declared}, actual {actual}")]
    LengthMismatch { declared: u64, actual: u64 },

    #[error("digest mismatch: expected {expected}, computed {computed}")]
    DigestMismatch {
        expected: ContentHash,
        computed: ContentHash,
    },

    #[error("undecodable body: {0}")]
    Decode(String),
}

/// Encode a blob with its integrity header
///
/// # Errors
/// Returns error if serialization or compression fails
pub fn encode_blob(blob: &SnapshotBlob, compression: Compression) -> Result<Vec<u8>, BlobIntegrityError> {
    let json = serde_json::to_vec(blob).map_err(|e| BlobIntegrityError::Decode(e.to_string()))?;
    let body = compression::encode(&json, compression)
        .map_err(|e| BlobIntegrityError::Decode(e.to_string()))?;
    let digest = ContentHash::compute(&body);

    let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(digest.as_bytes());
    out.extend_from_slice(&(body.len() as u64).to_le_bytes());
    out.extend_from_slice(&[0u8; 4]);
    out.extend_from_slice(&body);
    Ok(out)
}

fn array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

/// Verify and decode a blob
///
/// # Errors
/// Returns the first integrity check that fails
pub fn decode_blob(data: &[u8]) -> Result<SnapshotBlob, BlobIntegrityError> {
    if data.len() < HEADER_SIZE {
        return Err(BlobIntegrityError::TooSmall {
            size: data.len(),
            minimum: HEADER_SIZE,
        });
    }

    let magic: [u8; 4] = array(&data[0..4]);
    if &magic != MAGIC {
        return Err(BlobIntegrityError::InvalidMagic { found: magic });
    }
    let version = u32::from_le_bytes(array(&data[4..8]));
    if version > FORMAT_VERSION {
        return Err(BlobIntegrityError::UnsupportedVersion {
            found: version,
            supported: FORMAT_VERSION,
        });
    }
    let expected = ContentHash::new(array(&data[8..40]));
    let declared = u64::from_le_bytes(array(&data[40..48]));

    let body = &data[HEADER_SIZE..];
    let actual = body.len() as u64;
    if declared != actual {
        return Err(BlobIntegrityError::LengthMismatch { declared, actual });
    }
    if !expected.matches(body) {
        return Err(BlobIntegrityError::DigestMismatch {
            expected,
            computed: ContentHash::compute(body),
        });
    }

    let json = compression::decode(body).map_err(|e| BlobIntegrityError::Decode(e.to_string()))?;
    serde_json::from_slice(&json).map_err(|e| BlobIntegrityError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn state(pairs: &[(&str, i64)]) -> StateMap {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), Value::Int(*v)))
            .collect()
    }

    #[test]
    fn diff_covers_insert_replace_remove() {
        let old = state(&[("a", 1), ("b", 2), ("c", 3)]);
        let new = state(&[("a", 1), ("b", 20), ("d", 4)]);
        let diff = StateDiff::between(&old, &new);
        assert_eq!(diff.ops.len(), 3);

        let mut rebuilt = old.clone();
        diff.apply(&mut rebuilt).unwrap();
        assert_eq!(rebuilt, new);
    }

    #[test]
    fn diff_rejects_wrong_parent() {
        let diff = StateDiff::between(&state(&[("a", 1)]), &state(&[]));
        assert_eq!(
            diff.apply(&mut state(&[])),
            Err(DiffError::KeyMissing("a".into()))
        );
    }

    #[test]
    fn blob_round_trip_and_bit_flip() {
        let blob = SnapshotBlob {
            id: SnapshotId::new(),
            created_at: Utc::now(),
            body: SnapshotBody::Full {
                state: state(&[("rows", 42)]),
                partial_results: state(&[("chunk_0", 7)]),
            },
        };
        let bytes = encode_blob(&blob, Compression::Balanced).unwrap();
        assert_eq!(decode_blob(&bytes).unwrap(), blob);

        let mut flipped = bytes.clone();
        let last = flipped.len() - 1;
        flipped[last] ^= 0x01;
        assert!(matches!(
            decode_blob(&flipped),
            Err(BlobIntegrityError::DigestMismatch { .. })
        ));

        assert!(matches!(
            decode_blob(&bytes[..10]),
            Err(BlobIntegrityError::TooSmall { .. })
        ));
    }

    #[test]
    fn body_without_partial_results_still_decodes() {
        let json = r#"{"kind":"full","state":{"rows":{"type":"int","value":3}}}"#;
        let Ok(SnapshotBody::Full {
            state: decoded,
            partial_results,
        }) = serde_json::from_str::<SnapshotBody>(json)
        else {
            panic!("full body expected");
        };
        assert_eq!(decoded, state(&[("rows", 3)]));
        assert!(partial_results.is_empty());
    }

    fn arb_state() -> impl Strategy<Value = StateMap> {
        proptest::collection::btree_map("[a-f]{1,2}", any::<i64>().prop_map(Value::Int), 0..12)
    }

    proptest! {
        #[test]
        fn prop_diff_chain_rebuilds_every_state(states in proptest::collection::vec(arb_state(), 1..8)) {
            let mut rebuilt = states[0].clone();
            for pair in states.windows(2) {
                let diff = StateDiff::between(&pair[0], &pair[1]);
                diff.apply(&mut rebuilt).unwrap();
                prop_assert_eq!(&rebuilt, &pair[1]);
            }
        }
    }
}
