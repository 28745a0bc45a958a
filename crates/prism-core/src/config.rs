//! Build and pipeline configuration.

use serde::{Deserialize, Serialize};

use crate::device::{BuildFlags, RayTracingLimits};
use crate::error::{Error, Result};

/// Which side of the build/trace trade-off acceleration structures favor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuildPreference {
    /// Slower builds, faster traversal.
    #[default]
    FastTrace,
    /// Faster builds, slower traversal.
    FastBuild,
}

/// Configuration shared by the builders and the orchestrator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RtConfig {
    /// Number of ray types; each instance owns this many consecutive hit records.
    pub ray_type_count: u32,
    /// Maximum trace recursion depth.
    pub max_recursion_depth: u32,
    /// Largest ray payload any export may declare, in bytes.
    pub max_payload_size: u32,
    /// Largest hit attribute block any export may declare, in bytes.
    pub max_attribute_size: u32,
    pub build_preference: BuildPreference,
    /// Build the TLAS so transform-only changes can refit it.
    pub allow_update: bool,
    /// Submissions that may be in flight; informational for fence bookkeeping.
    pub frames_in_flight: u32,
}

impl Default for RtConfig {
    fn default() -> Self {
        Self {
            ray_type_count: 1,
            max_recursion_depth: 1,
            max_payload_size: 16,
            max_attribute_size: 8,
            build_preference: BuildPreference::FastTrace,
            allow_update: true,
            frames_in_flight: 2,
        }
    }
}

impl RtConfig {
    #[must_use]
    pub fn with_ray_types(mut self, ray_type_count: u32) -> Self {
        self.ray_type_count = ray_type_count;
        self
    }

    #[must_use]
    pub fn with_recursion_depth(mut self, depth: u32) -> Self {
        self.max_recursion_depth = depth;
        self
    }

    #[must_use]
    pub fn with_payload_size(mut self, bytes: u32) -> Self {
        self.max_payload_size = bytes;
        self
    }

    #[must_use]
    pub fn with_attribute_size(mut self, bytes: u32) -> Self {
        self.max_attribute_size = bytes;
        self
    }

    #[must_use]
    pub fn with_build_preference(mut self, preference: BuildPreference) -> Self {
        self.build_preference = preference;
        self
    }

    #[must_use]
    pub fn with_allow_update(mut self, allow_update: bool) -> Self {
        self.allow_update = allow_update;
        self
    }

    fn preference_flags(&self) -> BuildFlags {
        match self.build_preference {
            BuildPreference::FastTrace => BuildFlags::PREFER_FAST_TRACE,
            BuildPreference::FastBuild => BuildFlags::PREFER_FAST_BUILD,
        }
    }

    /// Flags for bottom-level builds. BLAS are never refit.
    pub fn blas_flags(&self) -> BuildFlags {
        self.preference_flags()
    }

    /// Flags for top-level builds.
    pub fn tlas_flags(&self) -> BuildFlags {
        if self.allow_update {
            self.preference_flags() | BuildFlags::ALLOW_UPDATE
        } else {
            self.preference_flags()
        }
    }

    /// Check the configuration against device limits.
    pub fn validate(&self, limits: &RayTracingLimits) -> Result<()> {
        if self.ray_type_count == 0 {
            return Err(Error::InvalidInput(
                "ray type count must be at least 1".to_string(),
            ));
        }
        if self.max_recursion_depth == 0 || self.max_recursion_depth > limits.max_recursion_depth
        {
            return Err(Error::UnsupportedFeature(format!(
                "recursion depth {} outside device range 1..={}",
                self.max_recursion_depth, limits.max_recursion_depth
            )));
        }
        if self.max_attribute_size > limits.max_attribute_size {
            return Err(Error::UnsupportedFeature(format!(
                "attribute size {} exceeds device limit {}",
                self.max_attribute_size, limits.max_attribute_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tlas_flags_follow_allow_update() {
        let config = RtConfig::default();
        assert!(config.tlas_flags().contains(BuildFlags::ALLOW_UPDATE));
        assert!(!config.blas_flags().contains(BuildFlags::ALLOW_UPDATE));

        let config = config
            .with_allow_update(false)
            .with_build_preference(BuildPreference::FastBuild);
        assert_eq!(config.tlas_flags(), BuildFlags::PREFER_FAST_BUILD);
    }

    #[test]
    fn validate_against_limits() {
        let limits = RayTracingLimits::default();
        assert!(RtConfig::default().validate(&limits).is_ok());
        assert!(matches!(
            RtConfig::default().with_recursion_depth(32).validate(&limits),
            Err(Error::UnsupportedFeature(_))
        ));
        assert!(matches!(
            RtConfig::default().with_ray_types(0).validate(&limits),
            Err(Error::InvalidInput(_))
        ));
        assert!(RtConfig::default()
            .with_attribute_size(64)
            .validate(&limits)
            .is_err());
    }
}
