//! Placement policy: which tier and compression a checkpoint payload gets

use crate::model::{AccessFrequency, CheckpointLevel};
use provenant_store::{Compression, StorageLevel};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Where a payload is written and how it is compressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Placement {
    pub payload_level: StorageLevel,
    pub compression: Compression,
}

impl Placement {
    #[must_use]
    pub const fn new(payload_level: StorageLevel, compression: Compression) -> Self {
        Self {
            payload_level,
            compression,
        }
    }
}

/// Pick tier and compression for a payload
///
/// Archival rules win: anything kept longer than 30 days, analysis-level
/// checkpoints kept longer than 7 days, and rarely read payloads go to the
/// archive with high compression. Otherwise hot short-lived payloads stay in
/// memory uncompressed, other hot payloads go to local disk with fast
/// compression and the rest to local disk with balanced compression.
#[must_use]
pub fn select_placement(
    level: CheckpointLevel,
    retention: Duration,
    access: AccessFrequency,
) -> Placement {
    let archival = retention > 30 * DAY
        || (level == CheckpointLevel::Analysis && retention > 7 * DAY)
        || access == AccessFrequency::Low;
    if archival {
        return Placement::new(StorageLevel::Archive, Compression::High);
    }

    match access {
        AccessFrequency::High if retention <= HOUR => {
            Placement::new(StorageLevel::Memory, Compression::None)
        }
        AccessFrequency::High => Placement::new(StorageLevel::LocalDisk, Compression::Fast),
        _ => Placement::new(StorageLevel::LocalDisk, Compression::Balanced),
    }
}
