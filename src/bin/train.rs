#![recursion_limit = "256"]
use anyhow::{Context, Result};
use burn::config::Config;
use burn::tensor::backend::{AutodiffBackend, Backend};
use clap::Parser;
use egsc_burn::checkpoint::CheckpointIo;
use egsc_burn::data::build_loaders;
use egsc_burn::training::{NETS, Solver, TrainingConfig};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[cfg(feature = "cuda")]
type TrainBackend = burn::backend::Autodiff<burn_cuda::Cuda<f32, i32>>;
#[cfg(all(not(feature = "cuda"), feature = "wgpu"))]
type TrainBackend = burn::backend::Autodiff<burn::backend::WebGpu<f32, i32>>;
#[cfg(all(not(feature = "cuda"), not(feature = "wgpu")))]
type TrainBackend = burn::backend::Autodiff<burn::backend::NdArray<f32>>;

#[derive(Parser, Debug)]
#[command(about = "Train a multi-domain image translation GAN with Burn")]
struct Args {
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// Restore checkpoints of this iteration before training.
    #[arg(long, conflicts_with = "resume_latest")]
    resume_iter: Option<usize>,
    #[arg(long)]
    total_iters: Option<usize>,
    /// Resume from the newest `nets` checkpoint found in the model path.
    #[arg(long)]
    resume_latest: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = TrainingConfig::load(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;

    if let Some(total_iters) = args.total_iters {
        config.total_iters = total_iters;
    }
    if let Some(resume_iter) = args.resume_iter {
        config.resume_iter = resume_iter;
    }
    if args.resume_latest {
        let store = CheckpointIo::new(&config.model_path, NETS);
        match store.latest_iteration()? {
            Some(latest) => config.resume_iter = latest,
            None => info!("No checkpoint found in {}, starting fresh", config.model_path),
        }
    }

    train::<TrainBackend>(config, Default::default())
}

fn train<B: AutodiffBackend>(config: TrainingConfig, device: <B as Backend>::Device) -> Result<()> {
    let model_path = PathBuf::from(&config.model_path);
    std::fs::create_dir_all(&model_path)
        .with_context(|| format!("failed to create {}", model_path.display()))?;
    config
        .save(model_path.join("config.json"))
        .context("failed to save config.json")?;

    let loaders = build_loaders::<B>(&config, &device)?;
    let mut solver = Solver::<B>::new(config, device)?;
    solver.train(&loaders)?;
    info!(
        "Finished {} iterations, checkpoints in {}",
        solver.config().total_iters,
        solver.model_path().display()
    );
    Ok(())
}
