//! Opaque pointers to data living outside the DAG

use crate::ids::ElementId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Kind of referenced data
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    Document,
    Entity,
    Relationship,
    Table,
    Vector,
    Graph,
    Summary,
    Other(String),
}

/// Typed pointer to a piece of data (document, entity, vector, ...)
///
/// Never dereferenced by the core. Identity for lineage purposes is the
/// element id alone; kind and location are descriptive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataReference {
    pub kind: ReferenceKind,
    pub id: ElementId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl DataReference {
    #[must_use]
    pub fn new(kind: ReferenceKind, id: impl Into<ElementId>) -> Self {
        Self {
            kind,
            id: id.into(),
            location: None,
        }
    }

    #[must_use]
    pub fn document(id: impl Into<ElementId>) -> Self {
        Self::new(ReferenceKind::Document, id)
    }

    #[must_use]
    pub fn entity(id: impl Into<ElementId>) -> Self {
        Self::new(ReferenceKind::Entity, id)
    }

    #[must_use]
    pub fn summary(id: impl Into<ElementId>) -> Self {
        Self::new(ReferenceKind::Summary, id)
    }

    #[must_use]
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

impl PartialEq for DataReference {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for DataReference {}

impl Hash for DataReference {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for DataReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.kind, self.id)
    }
}

/// A reference reached by tracing, with its contribution weight
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracedReference {
    pub reference: DataReference,
    /// Share of the traced element attributable to this reference
    pub weight: f64,
    /// Number of analysis steps between the two ends
    pub hops: usize,
}
