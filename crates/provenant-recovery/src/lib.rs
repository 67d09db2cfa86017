//! Provenant Recovery - failure classification and recovery
//!
//! A [`FailureClassifier`] turns a step failure into a [`FailureAnalysis`]
//! (category, downstream impact, recommended strategy chain). The
//! [`RecoveryEngine`] then walks that chain: retry with backoff, rollback to
//! a checkpoint, skip with incomplete descendants, or a manual pause that
//! [`RecoveryEngine::resume_manual`] picks up again.
//!
//! [`FailureAnalysis`]: provenant_types::FailureAnalysis

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod attempt;
pub mod classifier;
pub mod config;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod runner;

pub use attempt::{allowed_attempt_transitions, attempt_key, AttemptState, RecoveryAttempt};
pub use classifier::FailureClassifier;
pub use config::{ClassifierConfig, RecoveryConfig};
pub use engine::{RecoveryEngine, RecoveryOptions, RecoveryOutcome, RecoveryResult};
pub use error::{EngineResult, RecoveryError};
pub use ledger::{StrategyLedger, StrategyRecord};
pub use runner::{StepOutput, StepRunner};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
