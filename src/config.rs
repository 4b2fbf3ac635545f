//! Model configuration
//!
//! Layer widths, social feature constants, graph aggregation settings and
//! the rollout capacity limit. Configurations round-trip through JSON so a
//! checkpoint directory can carry the exact architecture it was saved with.

use crate::error::VrnnError;
use crate::VrnnResult;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Width of the decoded displacement (x, y).
pub const DISPLACEMENT_DIM: usize = 2;

/// Channels of the full agent state (position, velocity, acceleration).
pub const STATE_DIM: usize = 6;

/// What to do when a rollout batch exceeds `CapacityLimit::max_batch`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapacityPolicy {
    /// Keep the first `max_batch` rows and log a warning
    Truncate,
    /// Fail with `VrnnError::CapacityExceeded`
    Reject,
}

/// Hard limit on what the latent heads consume.
///
/// The heads read at most `max_hidden` hidden features and at most
/// `max_batch` rollout rows. Exactly `max_batch` rows pass untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacityLimit {
    pub max_batch: usize,
    pub max_hidden: usize,
    pub policy: CapacityPolicy,
}

impl Default for CapacityLimit {
    fn default() -> Self {
        Self {
            max_batch: 256,
            max_hidden: 256,
            policy: CapacityPolicy::Truncate,
        }
    }
}

/// Similarity-weighted graph aggregation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Whether the graph path runs at all
    pub enabled: bool,
    /// Heads of both multi-head attention passes
    pub heads: usize,
    /// Capacity of the aggregation history ring buffer
    pub history_capacity: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            heads: 8,
            history_capacity: 8,
        }
    }
}

/// Complete model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VrnnConfig {
    /// Number of future steps to predict
    pub horizon: usize,
    /// Number of observed steps the data pipeline supplies (informational)
    pub ob_horizon: usize,
    /// Neighbor visibility radius
    pub ob_radius: f64,
    /// Hidden width of the forward GRUs
    pub hidden_dim: usize,
    /// Hidden width of the backward (future) GRU
    pub backward_hidden_dim: usize,
    /// Width of attention keys and queries
    pub feature_dim: usize,
    /// Width of the self-kinematics embedding
    pub self_embed_dim: usize,
    /// Width of the neighbor embedding
    pub neighbor_embed_dim: usize,
    /// Width of the latent code
    pub z_dim: usize,
    /// Negative slope of the attention score nonlinearity
    pub attention_slope: f64,
    /// Upper clip of the time-to-closest-approach feature
    pub tau_max: f64,
    /// Treat `y.len() != horizon` as an error instead of a warning
    pub strict_horizon: bool,
    pub graph: GraphConfig,
    pub capacity: CapacityLimit,
}

impl Default for VrnnConfig {
    fn default() -> Self {
        Self {
            horizon: 12,
            ob_horizon: 8,
            ob_radius: 2.0,
            hidden_dim: 256,
            backward_hidden_dim: 256,
            feature_dim: 256,
            self_embed_dim: 128,
            neighbor_embed_dim: 128,
            z_dim: 32,
            attention_slope: 0.2,
            tau_max: 7.0,
            strict_horizon: false,
            graph: GraphConfig::default(),
            capacity: CapacityLimit::default(),
        }
    }
}

impl VrnnConfig {
    /// Stanford Drone Dataset in pixel coordinates.
    ///
    /// The rollout state is 512 wide; the latent heads still read the
    /// leading 256 features under the default hidden-width limit.
    pub fn sdd_pixel() -> Self {
        Self {
            ob_radius: 5.0,
            ob_horizon: 8,
            horizon: 12,
            hidden_dim: 512,
            ..Self::default()
        }
    }

    /// Small widths for tests and quick experiments
    pub fn tiny() -> Self {
        Self {
            horizon: 4,
            ob_horizon: 4,
            hidden_dim: 16,
            backward_hidden_dim: 16,
            feature_dim: 16,
            self_embed_dim: 8,
            neighbor_embed_dim: 8,
            z_dim: 4,
            graph: GraphConfig {
                heads: 2,
                ..GraphConfig::default()
            },
            ..Self::default()
        }
    }

    /// Input width of the latent heads after the hidden-width limit
    pub fn head_hidden_dim(&self) -> usize {
        self.hidden_dim.min(self.capacity.max_hidden)
    }

    /// Check the configuration for values the model cannot be built with
    pub fn validate(&self) -> VrnnResult<()> {
        let widths = [
            ("horizon", self.horizon),
            ("hidden_dim", self.hidden_dim),
            ("backward_hidden_dim", self.backward_hidden_dim),
            ("feature_dim", self.feature_dim),
            ("self_embed_dim", self.self_embed_dim),
            ("neighbor_embed_dim", self.neighbor_embed_dim),
            ("z_dim", self.z_dim),
            ("capacity.max_batch", self.capacity.max_batch),
            ("capacity.max_hidden", self.capacity.max_hidden),
        ];
        for (name, value) in widths {
            if value == 0 {
                return Err(VrnnError::InvalidConfig(format!("{} must be non-zero", name)));
            }
        }
        if self.ob_radius.is_nan() || self.ob_radius <= 0.0 {
            return Err(VrnnError::InvalidConfig(format!(
                "ob_radius must be positive, got {}",
                self.ob_radius
            )));
        }
        if self.tau_max < 0.0 {
            return Err(VrnnError::InvalidConfig(format!(
                "tau_max must be non-negative, got {}",
                self.tau_max
            )));
        }
        if self.graph.enabled {
            if self.graph.heads == 0 || self.hidden_dim % self.graph.heads != 0 {
                return Err(VrnnError::InvalidConfig(format!(
                    "hidden_dim {} is not divisible by graph.heads {}",
                    self.hidden_dim, self.graph.heads
                )));
            }
            if self.graph.history_capacity == 0 {
                return Err(VrnnError::InvalidConfig(
                    "graph.history_capacity must be non-zero".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Load a configuration from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> VrnnResult<Self> {
        let text = fs::read_to_string(path.as_ref())
            .map_err(|e| VrnnError::Io(format!("Failed to read config: {}", e)))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| VrnnError::SerializationError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as pretty JSON
    pub fn to_json_file(&self, path: impl AsRef<Path>) -> VrnnResult<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| VrnnError::SerializationError(e.to_string()))?;
        fs::write(path.as_ref(), text)
            .map_err(|e| VrnnError::Io(format!("Failed to write config: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = VrnnConfig::default();
        assert_eq!(config.horizon, 12);
        assert_eq!(config.hidden_dim, 256);
        assert_eq!(config.capacity.max_batch, 256);
        assert_eq!(config.capacity.max_hidden, 256);
        assert_eq!(config.graph.history_capacity, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_presets_validate() {
        assert!(VrnnConfig::sdd_pixel().validate().is_ok());
        assert!(VrnnConfig::tiny().validate().is_ok());
        // the wide preset keeps the default hidden-width limit
        let sdd = VrnnConfig::sdd_pixel();
        assert_eq!(sdd.capacity.max_hidden, 256);
        assert_eq!(sdd.head_hidden_dim(), 256);
    }

    #[test]
    fn test_head_hidden_dim_is_capped() {
        let mut config = VrnnConfig::tiny();
        config.hidden_dim = 20;
        config.graph.heads = 4;
        config.capacity.max_hidden = 16;
        assert_eq!(config.head_hidden_dim(), 16);
    }

    #[test]
    fn test_validate_rejects_bad_heads() {
        let mut config = VrnnConfig::tiny();
        config.graph.heads = 3;
        assert!(matches!(config.validate(), Err(VrnnError::InvalidConfig(_))));

        config.graph.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_width() {
        let config = VrnnConfig {
            z_dim: 0,
            ..VrnnConfig::tiny()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let config = VrnnConfig::sdd_pixel();
        config.to_json_file(&path).unwrap();

        let loaded = VrnnConfig::from_json_file(&path).unwrap();
        assert_eq!(loaded.hidden_dim, 512);
        assert_eq!(loaded.ob_radius, 5.0);
        assert_eq!(loaded.capacity.policy, CapacityPolicy::Truncate);
    }
}
