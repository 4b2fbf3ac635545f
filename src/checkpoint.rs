//! # Model Checkpointing
//!
//! Save and load forecaster weights together with the configuration they
//! were built from.
//!
//! ## File Format
//!
//! Checkpoints are stored as a directory containing:
//! - `config.json` - `CheckpointMetadata` (configuration, step, loss)
//! - `model.safetensors` - Model weights in safetensors format
//!
//! The graph aggregation history and bias variants created for narrow
//! inputs are runtime state and are not saved.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use social_vrnn::checkpoint::{save_checkpoint, load_checkpoint};
//!
//! save_checkpoint(model.config(), &varmap, "checkpoints/sdd", Some(step), Some(loss))?;
//! let (model, varmap, metadata) = load_checkpoint("checkpoints/sdd", &device)?;
//! ```

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use std::fs;
use std::path::Path;

use crate::config::VrnnConfig;
use crate::error::VrnnError;
use crate::model::SocialVrnn;
use crate::VrnnResult;

const CONFIG_FILE: &str = "config.json";
const WEIGHTS_FILE: &str = "model.safetensors";

/// Metadata stored with checkpoints
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CheckpointMetadata {
    /// Model configuration
    pub config: VrnnConfig,
    /// Training step when saved
    pub step: Option<usize>,
    /// Training loss when saved
    pub loss: Option<f64>,
    /// Seconds since the Unix epoch
    pub timestamp: String,
    /// Crate version that wrote the checkpoint
    pub version: String,
}

impl CheckpointMetadata {
    pub fn new(config: VrnnConfig) -> Self {
        Self {
            config,
            step: None,
            loss: None,
            timestamp: unix_timestamp(),
            version: crate::VERSION.to_string(),
        }
    }

    pub fn with_training_info(mut self, step: usize, loss: f64) -> Self {
        self.step = Some(step);
        self.loss = Some(loss);
        self
    }
}

fn unix_timestamp() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    format!("{}", secs)
}

/// Save a checkpoint directory
///
/// ```text
/// checkpoint_dir/
/// ├── config.json       # configuration and metadata
/// └── model.safetensors # weights
/// ```
pub fn save_checkpoint(
    config: &VrnnConfig,
    varmap: &VarMap,
    checkpoint_dir: impl AsRef<Path>,
    step: Option<usize>,
    loss: Option<f64>,
) -> VrnnResult<()> {
    let dir = checkpoint_dir.as_ref();

    fs::create_dir_all(dir)
        .map_err(|e| VrnnError::Io(format!("Failed to create checkpoint dir: {}", e)))?;

    let mut metadata = CheckpointMetadata::new(config.clone());
    if let (Some(s), Some(l)) = (step, loss) {
        metadata = metadata.with_training_info(s, l);
    }

    let config_json = serde_json::to_string_pretty(&metadata)
        .map_err(|e| VrnnError::SerializationError(e.to_string()))?;
    fs::write(dir.join(CONFIG_FILE), config_json)
        .map_err(|e| VrnnError::Io(format!("Failed to write config: {}", e)))?;

    varmap
        .save(dir.join(WEIGHTS_FILE))
        .map_err(|e| VrnnError::SerializationError(format!("Failed to save model: {}", e)))?;

    log::info!("Saved checkpoint to {:?}", dir);
    Ok(())
}

fn read_metadata(dir: &Path) -> VrnnResult<CheckpointMetadata> {
    let config_str = fs::read_to_string(dir.join(CONFIG_FILE))
        .map_err(|e| VrnnError::Io(format!("Failed to read config: {}", e)))?;
    serde_json::from_str(&config_str).map_err(|e| VrnnError::SerializationError(e.to_string()))
}

/// Load a checkpoint directory into a fresh model
pub fn load_checkpoint(
    checkpoint_dir: impl AsRef<Path>,
    device: &Device,
) -> VrnnResult<(SocialVrnn, VarMap, CheckpointMetadata)> {
    let dir = checkpoint_dir.as_ref();
    let metadata = read_metadata(dir)?;

    // build first so every variable exists, then overwrite with saved values
    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = SocialVrnn::new(metadata.config.clone(), vb)?;

    varmap
        .load(dir.join(WEIGHTS_FILE))
        .map_err(|e| VrnnError::SerializationError(format!("Failed to load model: {}", e)))?;

    log::info!("Loaded checkpoint from {:?}", dir);
    Ok((model, varmap, metadata))
}

/// Check if a checkpoint exists
pub fn checkpoint_exists(checkpoint_dir: impl AsRef<Path>) -> bool {
    let dir = checkpoint_dir.as_ref();
    dir.join(CONFIG_FILE).exists() && dir.join(WEIGHTS_FILE).exists()
}

/// List checkpoints under `checkpoints_root`, most advanced step first
pub fn list_checkpoints(
    checkpoints_root: impl AsRef<Path>,
) -> VrnnResult<Vec<(String, CheckpointMetadata)>> {
    let root = checkpoints_root.as_ref();
    let mut checkpoints = Vec::new();

    if !root.exists() {
        return Ok(checkpoints);
    }

    for entry in fs::read_dir(root)? {
        let path = entry?.path();
        if !(path.is_dir() && checkpoint_exists(&path)) {
            continue;
        }
        match read_metadata(&path) {
            Ok(metadata) => {
                let name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("unknown")
                    .to_string();
                checkpoints.push((name, metadata));
            }
            Err(e) => log::debug!("Skipping {:?}: {}", path, e),
        }
    }

    checkpoints.sort_by(|a, b| b.1.step.cmp(&a.1.step));
    Ok(checkpoints)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PredictParams;
    use crate::scene::SyntheticScene;
    use tempfile::TempDir;

    #[test]
    fn test_checkpoint_metadata() {
        let metadata = CheckpointMetadata::new(VrnnConfig::tiny()).with_training_info(1000, 0.5);
        assert_eq!(metadata.step, Some(1000));
        assert_eq!(metadata.loss, Some(0.5));
        assert_eq!(metadata.version, crate::VERSION);
    }

    #[test]
    fn test_save_and_load_checkpoint() {
        let device = Device::Cpu;
        let config = VrnnConfig {
            graph: crate::config::GraphConfig {
                enabled: false,
                ..Default::default()
            },
            ..VrnnConfig::tiny()
        };
        let (mut model, varmap) = SocialVrnn::new_random(config.clone(), &device).unwrap();

        let temp_dir = TempDir::new().unwrap();
        let checkpoint_path = temp_dir.path().join("test-checkpoint");
        save_checkpoint(&config, &varmap, &checkpoint_path, Some(100), Some(0.25)).unwrap();
        assert!(checkpoint_exists(&checkpoint_path));

        let (mut loaded, _varmap, metadata) = load_checkpoint(&checkpoint_path, &device).unwrap();
        assert_eq!(metadata.step, Some(100));
        assert_eq!(metadata.loss, Some(0.25));
        assert_eq!(loaded.config().hidden_dim, config.hidden_dim);

        // same weights: same deterministic forecast
        let scene = SyntheticScene::crossing(2, 4, config.horizon, &device).unwrap();
        let a: Vec<f32> = model
            .predict(&scene.scene(), &PredictParams::deterministic())
            .unwrap()
            .trajectory
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        let b: Vec<f32> = loaded
            .predict(&scene.scene(), &PredictParams::deterministic())
            .unwrap()
            .trajectory
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_list_checkpoints_sorted_by_step() {
        let device = Device::Cpu;
        let config = VrnnConfig::tiny();
        let (_model, varmap) = SocialVrnn::new_random(config.clone(), &device).unwrap();

        let root = TempDir::new().unwrap();
        save_checkpoint(&config, &varmap, root.path().join("early"), Some(10), Some(1.0)).unwrap();
        save_checkpoint(&config, &varmap, root.path().join("late"), Some(50), Some(0.5)).unwrap();
        fs::create_dir_all(root.path().join("empty")).unwrap();

        let found = list_checkpoints(root.path()).unwrap();
        let names: Vec<&str> = found.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["late", "early"]);
    }
}
