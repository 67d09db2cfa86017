//! Contribution weighting for lineage traces
//!
//! A hop weight says how much of a step's output is attributed to each of
//! its inputs. Weights multiply along a path and add across paths.

use provenant_types::ProvenanceStep;
use std::fmt::Debug;

/// Share of a step's output attributed to each consumed input
pub trait ContributionWeighting: Send + Sync + Debug {
    fn hop_weight(&self, step: &ProvenanceStep) -> f64;
}

/// Each input contributes `1 / fan_in`
#[derive(Debug, Clone, Copy, Default)]
pub struct InverseFanIn;

impl ContributionWeighting for InverseFanIn {
    fn hop_weight(&self, step: &ProvenanceStep) -> f64 {
        let fan_in = step.transformation.inputs.len().max(1);
        // fan-in of a single step is far below 2^52
        #[allow(clippy::cast_precision_loss)]
        let fan_in = fan_in as f64;
        1.0 / fan_in
    }
}

/// Every input is credited with the whole output
#[derive(Debug, Clone, Copy, Default)]
pub struct FullCredit;

impl ContributionWeighting for FullCredit {
    fn hop_weight(&self, _step: &ProvenanceStep) -> f64 {
        1.0
    }
}
