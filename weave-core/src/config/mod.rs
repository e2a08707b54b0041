//! config — operator-tunable thresholds for tracking, identity and fusion
//!
//! Every field has a default, so a TOML file only needs to name what it
//! overrides:
//!
//! ```toml
//! [tracker]
//! iou_threshold = 0.65
//!
//! [fusion]
//! time_threshold_secs = 90.0
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::cache::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub tracker: TrackerConfig,
    pub identity: IdentityConfig,
    pub fusion: FusionConfig,
    pub store: StoreConfig,
}

/// Per-video tracklet matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Minimum IoU for a detection to continue a tracklet.
    pub iou_threshold: f32,
    /// Frames a tracked verdict may be reused before forcing arbitration.
    pub revalidate_interval: u32,
    /// Consecutive unmatched frames a tracklet survives.
    pub max_age: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            iou_threshold: 0.7,
            revalidate_interval: 5,
            max_age: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub face_threshold: f32,
    pub body_threshold: f32,
    /// Flag near-miss body matches as "suspected" (never changes the verdict).
    pub soft_match: bool,
    pub soft_match_threshold: f32,
    pub cache_validity_secs: u64,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            face_threshold: 0.65,
            body_threshold: 0.60,
            soft_match: true,
            soft_match_threshold: 0.55,
            cache_validity_secs: 24 * 60 * 60,
        }
    }
}

impl IdentityConfig {
    pub fn cache_validity(&self) -> TimeDelta {
        i64::try_from(self.cache_validity_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(TimeDelta::MAX)
    }

    pub fn soft_threshold(&self) -> Option<f32> {
        self.soft_match.then_some(self.soft_match_threshold)
    }
}

/// Session-merge gaps, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub time_threshold_secs: f64,
    pub stranger_merge_threshold_secs: f64,
    pub interaction_threshold_secs: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            time_threshold_secs: 60.0,
            stranger_merge_threshold_secs: 10.0,
            interaction_threshold_secs: 5.0,
        }
    }
}

/// Retry behaviour for gallery / cache backend calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 10,
            max_delay_ms: 1000,
        }
    }
}

impl StoreConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

impl EngineConfig {
    /// Parse a TOML file and validate it.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: EngineConfig = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let t = &self.tracker;
        ensure!(
            (0.0..=1.0).contains(&t.iou_threshold),
            "tracker.iou_threshold must be within [0, 1], got {}",
            t.iou_threshold
        );
        ensure!(
            t.revalidate_interval > 0,
            "tracker.revalidate_interval must be at least 1"
        );

        let i = &self.identity;
        for (name, value) in [
            ("identity.face_threshold", i.face_threshold),
            ("identity.body_threshold", i.body_threshold),
            ("identity.soft_match_threshold", i.soft_match_threshold),
        ] {
            ensure!(
                (-1.0..=1.0).contains(&value),
                "{name} must be a cosine similarity within [-1, 1], got {value}"
            );
        }
        if i.soft_match {
            ensure!(
                i.soft_match_threshold < i.body_threshold,
                "identity.soft_match_threshold ({}) must be below identity.body_threshold ({})",
                i.soft_match_threshold,
                i.body_threshold
            );
        }

        let f = &self.fusion;
        for (name, value) in [
            ("fusion.time_threshold_secs", f.time_threshold_secs),
            (
                "fusion.stranger_merge_threshold_secs",
                f.stranger_merge_threshold_secs,
            ),
            (
                "fusion.interaction_threshold_secs",
                f.interaction_threshold_secs,
            ),
        ] {
            ensure!(
                value.is_finite() && value >= 0.0,
                "{name} must be a non-negative number of seconds, got {value}"
            );
        }

        ensure!(
            self.store.max_attempts > 0,
            "store.max_attempts must be at least 1"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.tracker.revalidate_interval, 5);
        assert_eq!(config.identity.cache_validity(), TimeDelta::hours(24));
        assert_eq!(config.identity.soft_threshold(), Some(0.55));
    }

    #[test]
    fn partial_toml_keeps_remaining_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
            [tracker]
            iou_threshold = 0.5

            [fusion]
            time_threshold_secs = 90.0
            "#,
        )
        .unwrap();
        assert_eq!(config.tracker.iou_threshold, 0.5);
        assert_eq!(config.tracker.max_age, 3);
        assert_eq!(config.fusion.time_threshold_secs, 90.0);
        assert_eq!(config.fusion.interaction_threshold_secs, 5.0);
        assert_eq!(config.identity, IdentityConfig::default());
    }

    #[test]
    fn load_reads_and_validates_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[identity]\nbody_threshold = 0.7\nsoft_match = false").unwrap();
        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.identity.body_threshold, 0.7);
        assert_eq!(config.identity.soft_threshold(), None);
    }

    #[test]
    fn rejects_out_of_range_values() {
        let mut config = EngineConfig::default();
        config.tracker.iou_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.tracker.revalidate_interval = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.identity.soft_match_threshold = 0.9;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.fusion.time_threshold_secs = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = EngineConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(err.to_string().contains("failed to read config file"));
    }
}
