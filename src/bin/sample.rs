#![recursion_limit = "256"]
use anyhow::{Context, Result};
use burn::config::Config;
use burn::tensor::backend::Backend;
use clap::Parser;
use egsc_burn::TrainError;
use egsc_burn::checkpoint::checkpoint_file_name;
use egsc_burn::data::build_loaders;
use egsc_burn::fetcher::InputFetcher;
use egsc_burn::initialize::load_model;
use egsc_burn::model::WeightInit;
use egsc_burn::sampling::{EvalProfile, fetch_results};
use egsc_burn::training::{NETS_EMA, TrainingConfig};
use egsc_burn::utils::save_image_grid;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[cfg(feature = "cuda")]
type SampleBackend = burn_cuda::Cuda<f32, i32>;
#[cfg(all(not(feature = "cuda"), feature = "wgpu"))]
type SampleBackend = burn::backend::WebGpu<f32, i32>;
#[cfg(all(not(feature = "cuda"), not(feature = "wgpu")))]
type SampleBackend = burn::backend::NdArray<f32>;

#[derive(Parser, Debug)]
#[command(about = "Write an evaluation grid from trained EMA networks")]
struct Args {
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// Iteration of the `nets_ema` checkpoint in the model path.
    #[arg(long)]
    iter: usize,
    #[arg(long, value_enum, default_value_t = EvalProfile::Sr)]
    profile: EvalProfile,
    /// Target domain of every translation.
    #[arg(long, default_value_t = 1)]
    domain: usize,
    #[arg(long, default_value_t = 64)]
    batch_size: usize,
    #[arg(long, default_value = "results.jpg")]
    output: PathBuf,
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
    args.profile.apply(&mut config.model);
    config.val_batch_size = args.batch_size;

    sample::<SampleBackend>(&args, config, Default::default())
}

fn sample<B: Backend>(args: &Args, config: TrainingConfig, device: B::Device) -> Result<()> {
    let path = PathBuf::from(&config.model_path).join(checkpoint_file_name(NETS_EMA, args.iter));
    let nets = config
        .model
        .networks()?
        .init::<B>(WeightInit::Default, &device);
    let nets = load_model(nets, &path, &device)
        .with_context(|| format!("failed to load {}", path.display()))?;
    let features = config.model.feature_extractor().init::<B>(&device)?;

    let loaders = build_loaders::<B>(&config, &device)?;
    let batch = InputFetcher::new(loaders.val.as_ref(), &device)
        .next()
        .ok_or(TrainError::EmptyDataSource)
        .context("validation split produced no batch")?;

    let grid = fetch_results(&nets, &features, args.profile, &batch, args.domain, &device);
    save_image_grid(grid, args.profile.ncol(), &args.output)?;
    info!("Saved {:?} results to {}", args.profile, args.output.display());
    Ok(())
}
