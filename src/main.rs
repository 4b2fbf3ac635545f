//! Social VRNN demo driver
//!
//! Builds (or loads) a forecaster, fits it for a few steps on a synthetic
//! crossing scene and reports the forecast error.
//!
//! ## Usage
//!
//! ```bash
//! # Tiny model, 20 optimisation steps, 20 sampled forecasts
//! cargo run --release -- --preset tiny --steps 20 --samples 20 --seed 7
//!
//! # Resume from a checkpoint and save the result
//! cargo run --release -- -c checkpoints/sdd --save checkpoints/sdd --steps 100
//! ```

use candle_core::Device;
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use clap::{Parser, ValueEnum};
use social_vrnn::{
    checkpoint::{load_checkpoint, save_checkpoint},
    score_prediction, PredictParams, Similarity, SocialVrnn, SyntheticScene, TrainParams,
    VrnnConfig,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Preset {
    Default,
    SddPixel,
    Tiny,
}

/// Social VRNN trajectory forecaster
#[derive(Parser, Debug)]
#[command(name = "social_vrnn")]
#[command(about = "Fit and sample a social VRNN on a synthetic crossing scene")]
struct Args {
    /// JSON configuration file (overrides --preset)
    #[arg(long)]
    config: Option<String>,

    /// Built-in configuration
    #[arg(long, value_enum, default_value = "tiny")]
    preset: Preset,

    /// Checkpoint directory to start from
    #[arg(long, short = 'c')]
    checkpoint: Option<String>,

    /// Directory to save the final checkpoint to
    #[arg(long)]
    save: Option<String>,

    /// Agents in the synthetic scene
    #[arg(long, default_value = "4")]
    agents: usize,

    /// Optimisation steps before forecasting
    #[arg(long, default_value = "20")]
    steps: usize,

    /// Learning rate
    #[arg(long, default_value = "0.001")]
    lr: f64,

    /// Sampled forecasts (0 = prior mean)
    #[arg(long, short = 'n', default_value = "20")]
    samples: usize,

    /// Seed of the latent noise
    #[arg(long)]
    seed: Option<u64>,

    /// Scalar social similarity fed to the graph aggregation
    #[arg(long, default_value = "0.0")]
    similarity: f64,

    /// Print the final report as JSON
    #[arg(long)]
    json: bool,
}

fn select_device() -> Device {
    if cfg!(feature = "cuda") {
        match Device::cuda_if_available(0) {
            Ok(d) => {
                log::info!("Using device {:?}", d);
                d
            }
            Err(e) => {
                log::warn!("CUDA not available ({}), using CPU", e);
                Device::Cpu
            }
        }
    } else {
        Device::Cpu
    }
}

fn build_model(args: &Args, device: &Device) -> Result<(SocialVrnn, VarMap), Box<dyn std::error::Error>> {
    if let Some(ref path) = args.checkpoint {
        let (model, varmap, metadata) = load_checkpoint(path, device)?;
        log::info!(
            "Checkpoint step {:?}, loss {:?}, written by {}",
            metadata.step,
            metadata.loss,
            metadata.version
        );
        return Ok((model, varmap));
    }
    let config = match (&args.config, args.preset) {
        (Some(path), _) => VrnnConfig::from_json_file(path)?,
        (None, Preset::Default) => VrnnConfig::default(),
        (None, Preset::SddPixel) => VrnnConfig::sdd_pixel(),
        (None, Preset::Tiny) => VrnnConfig::tiny(),
    };
    Ok(SocialVrnn::new_random(config, device)?)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let device = select_device();
    let (mut model, varmap) = build_model(&args, &device)?;
    let config = model.config().clone();
    log::info!(
        "Model: hidden {}, z {}, horizon {}, graph {}",
        config.hidden_dim,
        config.z_dim,
        config.horizon,
        if config.graph.enabled { "on" } else { "off" }
    );

    let scene = SyntheticScene::crossing(args.agents, config.ob_horizon, config.horizon, &device)?;
    let similarity = Similarity::Scalar(args.similarity);

    let mut optimizer = AdamW::new(
        varmap.all_vars(),
        ParamsAdamW {
            lr: args.lr,
            ..Default::default()
        },
    )?;

    let mut last = None;
    for step in 0..args.steps {
        let params = TrainParams {
            similarity: similarity.clone(),
            seed: args.seed.map(|s| s.wrapping_add(step as u64)),
        };
        let output = model.train_step(&scene.scene(), &scene.y, &params)?;
        let loss = model.loss(&output)?;
        optimizer.backward_step(&loss.loss)?;

        let summary = loss.summary()?;
        if step % 10 == 0 || step + 1 == args.steps {
            log::info!("step {:4}  {}", step, summary);
        }
        last = Some(summary);
    }

    let params = PredictParams {
        n_predictions: args.samples,
        similarity,
        seed: args.seed,
    };
    let prediction = model.predict(&scene.scene(), &params)?;
    let scored = prediction.n_agents;
    let errors = score_prediction(&prediction, &scene.y)?;

    if args.json {
        let report = serde_json::json!({
            "steps": args.steps,
            "agents": scored,
            "samples": prediction.n_predictions,
            "loss": last,
            "errors": errors,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Forecast over {} agents, {} samples", scored, prediction.n_predictions);
        if let Some(summary) = last {
            println!("  final {}", summary);
        }
        println!("  {}", errors);
    }

    if let Some(ref dir) = args.save {
        let loss = last.map(|s| s.loss as f64);
        save_checkpoint(&config, &varmap, dir, Some(args.steps), loss)?;
    }

    Ok(())
}
