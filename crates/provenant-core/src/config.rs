//! Workspace configuration
//!
//! One TOML document with a section per component:
//!
//! ```toml
//! [storage]
//! root = "/var/lib/provenant"
//! operation_timeout_ms = 2000
//!
//! [checkpoint]
//! full_snapshot_interval = 5
//! checkpoint_on_commit = "dag_node"  # or "none"
//!
//! [classifier]
//! rate_limit_pattern = "(?i)throttl"
//!
//! [recovery]
//! step_timeout_ms = 30000
//!
//! [telemetry]
//! filter = "provenant=debug,info"
//! json = true
//! ```
//!
//! Missing sections and fields take their defaults.

use crate::error::{CoreError, CoreResult};
use crate::telemetry::TelemetryConfig;
use provenant_checkpoint::CheckpointConfig;
use provenant_recovery::{ClassifierConfig, RecoveryConfig};
use provenant_store::StoreConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvenantConfig {
    pub storage: StoreConfig,
    pub checkpoint: CheckpointConfig,
    pub classifier: ClassifierConfig,
    pub recovery: RecoveryConfig,
    pub telemetry: TelemetryConfig,
}

impl ProvenantConfig {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document
    ///
    /// # Errors
    /// `ConfigParse` on malformed TOML, `Config` if a value is out of range
    pub fn from_toml_str(input: &str) -> CoreResult<Self> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file
    ///
    /// # Errors
    /// `ConfigIo` if the file cannot be read, otherwise as [`Self::from_toml_str`]
    pub fn load(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path).map_err(|source| CoreError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&input)
    }

    /// Serialize back to TOML
    ///
    /// # Errors
    /// `Config` if the value cannot be represented
    pub fn to_toml_string(&self) -> CoreResult<String> {
        toml::to_string_pretty(self).map_err(|e| CoreError::Config(e.to_string()))
    }

    /// Reject values no component can work with
    ///
    /// # Errors
    /// `Config` naming the offending field
    pub fn validate(&self) -> CoreResult<()> {
        if self.checkpoint.full_snapshot_interval == 0 {
            return Err(CoreError::Config(
                "checkpoint.full_snapshot_interval must be at least 1".to_string(),
            ));
        }
        if self.checkpoint.head_cache_capacity == 0 {
            return Err(CoreError::Config(
                "checkpoint.head_cache_capacity must be at least 1".to_string(),
            ));
        }
        if self.storage.operation_timeout_ms == 0 {
            return Err(CoreError::Config(
                "storage.operation_timeout_ms must be positive".to_string(),
            ));
        }
        if self.recovery.step_timeout_ms == 0 {
            return Err(CoreError::Config(
                "recovery.step_timeout_ms must be positive".to_string(),
            ));
        }
        if self.classifier.rate_limit_pattern.is_empty() {
            return Err(CoreError::Config(
                "classifier.rate_limit_pattern must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn with_storage(mut self, storage: StoreConfig) -> Self {
        self.storage = storage;
        self
    }

    #[must_use]
    pub fn with_checkpoint(mut self, checkpoint: CheckpointConfig) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    #[must_use]
    pub fn with_classifier(mut self, classifier: ClassifierConfig) -> Self {
        self.classifier = classifier;
        self
    }

    #[must_use]
    pub fn with_recovery(mut self, recovery: RecoveryConfig) -> Self {
        self.recovery = recovery;
        self
    }

    #[must_use]
    pub fn with_telemetry(mut self, telemetry: TelemetryConfig) -> Self {
        self.telemetry = telemetry;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use provenant_store::StorageLevel;

    #[test]
    fn partial_document_keeps_defaults() {
        let config = ProvenantConfig::from_toml_str(
            r#"
            [checkpoint]
            full_snapshot_interval = 4

            [recovery]
            record_level = "local_disk"

            [telemetry]
            json = true
            "#,
        )
        .unwrap();

        assert_eq!(config.checkpoint.full_snapshot_interval, 4);
        assert!(config.checkpoint.incremental);
        assert_eq!(
            config.checkpoint.checkpoint_on_commit,
            Some(provenant_checkpoint::CheckpointLevel::DagNode)
        );
        assert_eq!(config.recovery.record_level, StorageLevel::LocalDisk);
        assert!(config.telemetry.json);
        assert_eq!(config.classifier, ClassifierConfig::default());
    }

    #[test]
    fn round_trips_through_toml() {
        let config = ProvenantConfig::new()
            .with_checkpoint(CheckpointConfig::default().with_full_snapshot_interval(3))
            .with_classifier(ClassifierConfig::default().with_min_disk_bytes(42));
        let text = config.to_toml_string().unwrap();
        assert_eq!(ProvenantConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn commit_checkpoints_can_be_turned_off() {
        let config =
            ProvenantConfig::from_toml_str("[checkpoint]\ncheckpoint_on_commit = \"none\"\n")
                .unwrap();
        assert_eq!(config.checkpoint.checkpoint_on_commit, None);

        let text = config.to_toml_string().unwrap();
        assert!(text.contains(r#"checkpoint_on_commit = "none""#));
        assert_eq!(ProvenantConfig::from_toml_str(&text).unwrap(), config);

        let config = ProvenantConfig::from_toml_str(
            "[checkpoint]\ncheckpoint_on_commit = \"analysis\"\n",
        )
        .unwrap();
        assert_eq!(
            config.checkpoint.checkpoint_on_commit,
            Some(provenant_checkpoint::CheckpointLevel::Analysis)
        );
    }

    #[test]
    fn rejects_bad_values() {
        let err = ProvenantConfig::from_toml_str("[checkpoint]\nfull_snapshot_interval = 0\n")
            .unwrap_err();
        assert!(matches!(err, CoreError::Config(ref m) if m.contains("full_snapshot_interval")));

        let err = ProvenantConfig::from_toml_str("[checkpoint]\nhead_cache_capacity = 0\n")
            .unwrap_err();
        assert!(matches!(err, CoreError::Config(ref m) if m.contains("head_cache_capacity")));

        let err = ProvenantConfig::from_toml_str("[storage\n").unwrap_err();
        assert!(matches!(err, CoreError::ConfigParse(_)));
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("provenant.toml");
        assert!(matches!(
            ProvenantConfig::load(&path),
            Err(CoreError::ConfigIo { .. })
        ));

        std::fs::write(&path, "[recovery]\nstep_timeout_ms = 250\n").unwrap();
        let config = ProvenantConfig::load(&path).unwrap();
        assert_eq!(config.recovery.step_timeout_ms, 250);
    }
}
