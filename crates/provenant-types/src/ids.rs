//! Identifier types
//!
//! Generated identifiers are ULIDs (time-sortable). Element ids are
//! caller-chosen strings because they name data living outside the DAG.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Ulid);

        impl $name {
            /// Generate a fresh identifier
            #[inline]
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Short prefix used in storage keys and log lines
            pub const PREFIX: &'static str = $prefix;
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ulid::DecodeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ulid::from_string(s).map(Self)
            }
        }
    };
}

ulid_id!(
    /// Identifier of one analysis run (one DAG)
    DagId,
    "dag"
);
ulid_id!(
    /// Identifier of one analysis step within a DAG
    NodeId,
    "node"
);
ulid_id!(
    /// Identifier of a checkpoint record
    CheckpointId,
    "checkpoint"
);
ulid_id!(
    /// Identifier of a stored snapshot blob
    SnapshotId,
    "snapshot"
);
ulid_id!(
    /// Identifier of one recovery attempt
    AttemptId,
    "recovery"
);
ulid_id!(
    /// Identifier of a failure analysis
    FailureId,
    "failure"
);
ulid_id!(
    /// Identity of one recovery strategy instance (fallback chains reject repeats)
    StrategyId,
    "strategy"
);

/// Identifier of a data element (document, entity, vector, summary, ...)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementId(String);

impl ElementId {
    /// Wrap an element id
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as str
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ElementId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ElementId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::borrow::Borrow<str> for ElementId {
    fn borrow(&self) -> &str {
        &self.0
    }
}
