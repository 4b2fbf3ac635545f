//! # Social VRNN
//!
//! Multi-agent trajectory forecasting with a conditional variational
//! recurrent network. Agents are encoded from their observed motion and the
//! motion of nearby neighbors; the future is rolled out one displacement at
//! a time from a learned latent prior.
//!
//! ## Features
//! - Social features: velocity, acceleration, distance, bearing and minimum
//!   predicted distance to every neighbor
//! - Masked neighbor attention restricted to an observation radius
//! - Similarity-weighted graph aggregation with a bounded temporal history
//! - Forward/backward GRU encoding and a per-step latent prior/posterior
//! - Deterministic (prior mean) or seeded multi-sample inference
//! - GPU acceleration via candle-core
//!
//! ## Architecture
//!
//! ```text
//! x, neighbor ─► FeatureExtractor ─► EmbeddingNetworks ─┬─► NeighborAttention ─┐
//!                                                       │                      ├─► gru_fx ─► h
//!                                 state ─► GraphFusion ─┴──── (initial h) ─────┘
//!                                                                   │
//!               y ─► gru_by (training) ─► b ─► q(z|h,b)             ▼
//!                                                    p(z|h) ─► z ─► dec ─► d ─► Σ d + x_last
//! ```

// Core modules
pub mod attention;
pub mod embedding;
pub mod encoder;
pub mod error;
pub mod features;
pub mod graph;
pub mod latent;
pub mod model;
pub mod ops;
pub mod recurrent;

// Training and evaluation
pub mod checkpoint;
pub mod config;
pub mod eval;
pub mod loss;
pub mod scene;


// Re-exports
pub use attention::{MultiHeadAttention, NeighborAttention};
pub use checkpoint::{
    checkpoint_exists, list_checkpoints, load_checkpoint, save_checkpoint, CheckpointMetadata,
};
pub use config::{CapacityLimit, CapacityPolicy, GraphConfig, VrnnConfig};
pub use embedding::{EmbeddingNetworks, Mlp};
pub use encoder::{EncoderOutput, TemporalEncoder};
pub use error::VrnnError;
pub use eval::{displacement_errors, score_prediction, DisplacementErrors};
pub use features::{FeatureExtractor, SocialFeatures};
pub use graph::{AggregationHistory, GraphAggregator, GraphFusion, GraphOutput, Similarity};
pub use latent::{DiagonalGaussian, LatentNetworks, NoiseSource};
pub use loss::{LossBreakdown, LossSummary};
pub use model::{LearnOutput, PredictParams, Prediction, Scene, SocialVrnn, TrainParams};
pub use recurrent::GruCell;
pub use scene::SyntheticScene;

/// Result type for forecasting operations
pub type VrnnResult<T> = Result<T, VrnnError>;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        // Model
        SocialVrnn,
        Scene,
        PredictParams,
        TrainParams,
        Prediction,
        LearnOutput,
        Similarity,

        // Configuration
        VrnnConfig,
        CapacityLimit,
        CapacityPolicy,
        GraphConfig,

        // Training and evaluation
        LossBreakdown,
        LossSummary,
        DisplacementErrors,
        displacement_errors,
        score_prediction,
        SyntheticScene,

        // Result type
        VrnnResult,
        VrnnError,
    };
}
