use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use burn::config::Config;
use burn::data::dataloader::DataLoader;
use burn::module::{AutodiffModule, ModuleVisitor, Param};
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::{Adam, AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use tracing::{debug, info};

use crate::checkpoint::{CheckpointIo, Checkpointable};
use crate::components::{EMA_BETA, TrainedComponents};
use crate::error::TrainError;
use crate::fetcher::{InputFetcher, Inputs, RawBatch};
use crate::loss::LossTerms;
use crate::model::{
    Discriminator, FeatureExtractor, Generator, LossConfig, MappingNetwork, ModelConfig, Networks,
    StyleEncoder, WeightInit, compute_d_loss, compute_g_loss, to_unit_range,
};
use crate::sampling::debug_image;

/// Training configuration loaded from `config.json`.
#[derive(Config, Debug)]
pub struct TrainingConfig {
    pub model: ModelConfig,
    pub loss: LossConfig,
    #[config(default = 100000)]
    pub total_iters: usize,
    /// Iteration whose checkpoints are restored before training. Zero starts fresh.
    #[config(default = 0)]
    pub resume_iter: usize,
    #[config(default = 8)]
    pub batch_size: usize,
    #[config(default = 32)]
    pub val_batch_size: usize,
    #[config(default = 1e-4)]
    pub lr: f64,
    /// Learning rate of the mapping network.
    #[config(default = 1e-6)]
    pub f_lr: f64,
    #[config(default = 0.0)]
    pub beta1: f64,
    #[config(default = 0.99)]
    pub beta2: f64,
    #[config(default = 1e-4)]
    pub weight_decay: f64,
    #[config(default = 4)]
    pub num_workers: usize,
    #[config(default = 1000)]
    pub print_every: usize,
    /// Zero disables debug images.
    #[config(default = 5000)]
    pub sample_every: usize,
    #[config(default = 10000)]
    pub save_every: usize,
    #[config(default = 10)]
    pub num_outs_per_domain: usize,
    #[config(default = 0.5)]
    pub randcrop_prob: f64,
    #[config(default = "String::from(\"visda\")")]
    pub dataset: String,
    #[config(default = "String::from(\".data\")")]
    pub dataset_loc: String,
    #[config(default = "String::from(\"expr/checkpoints\")")]
    pub model_path: String,
    #[config(default = "String::from(\"expr/samples\")")]
    pub save_path: String,
    #[config(default = 42)]
    pub seed: u64,
}

impl TrainingConfig {
    fn adam(&self) -> AdamConfig {
        AdamConfig::new()
            .with_beta_1(self.beta1 as f32)
            .with_beta_2(self.beta2 as f32)
            .with_weight_decay(Some(WeightDecayConfig::new(self.weight_decay as f32)))
    }
}

/// Training and validation batches.
#[derive(Clone)]
pub struct Loaders<B: Backend> {
    pub src: Arc<dyn DataLoader<B, RawBatch<B>>>,
    pub val: Arc<dyn DataLoader<B, RawBatch<B>>>,
}

/// Adam bound to one network, with that network's learning rate.
#[derive(Clone)]
pub struct NetOptimizer<M: AutodiffModule<B>, B: AutodiffBackend> {
    optim: OptimizerAdaptor<Adam, M, B>,
    lr: f64,
}

impl<M: AutodiffModule<B>, B: AutodiffBackend> NetOptimizer<M, B> {
    fn new(config: &AdamConfig, lr: f64) -> Self {
        Self {
            optim: config.init(),
            lr,
        }
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }

    /// Apply `grads` to `module`. An empty gradient set leaves the module as it is.
    pub fn step(&mut self, module: M, grads: GradientsParams) -> M {
        if grads.is_empty() {
            return module;
        }
        self.optim.step(self.lr, module, grads)
    }

    fn load(self, record: NetOptimRecord<M, B>) -> Self {
        Self {
            optim: self.optim.load_record(record),
            lr: self.lr,
        }
    }
}

/// One optimizer per live network, keyed like [`Networks`].
#[derive(Clone)]
pub struct Optimizers<B: AutodiffBackend> {
    pub generator: NetOptimizer<Generator<B>, B>,
    pub mapping_network: NetOptimizer<MappingNetwork<B>, B>,
    pub style_encoder: NetOptimizer<StyleEncoder<B>, B>,
    pub discriminator: NetOptimizer<Discriminator<B>, B>,
}

type NetOptimRecord<M, B> = <OptimizerAdaptor<Adam, M, B> as Optimizer<M, B>>::Record;

/// Optimizer states in `generator, mapping_network, style_encoder, discriminator` order.
pub type OptimizersRecord<B> = (
    NetOptimRecord<Generator<B>, B>,
    NetOptimRecord<MappingNetwork<B>, B>,
    NetOptimRecord<StyleEncoder<B>, B>,
    NetOptimRecord<Discriminator<B>, B>,
);

impl<B: AutodiffBackend> Optimizers<B> {
    pub fn new(config: &TrainingConfig) -> Self {
        let adam = config.adam();
        Self {
            generator: NetOptimizer::new(&adam, config.lr),
            mapping_network: NetOptimizer::new(&adam, config.f_lr),
            style_encoder: NetOptimizer::new(&adam, config.lr),
            discriminator: NetOptimizer::new(&adam, config.lr),
        }
    }
}

impl<B: AutodiffBackend> Checkpointable<B> for Optimizers<B> {
    type Record = OptimizersRecord<B>;

    fn to_record(&self) -> Self::Record {
        (
            self.generator.optim.to_record(),
            self.mapping_network.optim.to_record(),
            self.style_encoder.optim.to_record(),
            self.discriminator.optim.to_record(),
        )
    }

    fn load_record(self, record: Self::Record) -> Self {
        let (generator, mapping_network, style_encoder, discriminator) = record;
        Self {
            generator: self.generator.load(generator),
            mapping_network: self.mapping_network.load(mapping_network),
            style_encoder: self.style_encoder.load(style_encoder),
            discriminator: self.discriminator.load(discriminator),
        }
    }
}

/// Moves the gradients of the visited parameters from `source` to `target`.
struct GradsExtractor<'a, B: AutodiffBackend> {
    source: &'a mut GradientsParams,
    target: &'a mut GradientsParams,
    _phantom: PhantomData<B>,
}

impl<'a, B: AutodiffBackend> GradsExtractor<'a, B> {
    fn new(source: &'a mut GradientsParams, target: &'a mut GradientsParams) -> Self {
        Self {
            source,
            target,
            _phantom: PhantomData,
        }
    }
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradsExtractor<'_, B> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        if let Some(grad) = self.source.remove::<B::InnerBackend, D>(param.id) {
            self.target.register::<B::InnerBackend, D>(param.id, grad);
        }
    }
}

fn extract_grads<B: AutodiffBackend, M: Module<B>>(
    module: &M,
    grads: &mut GradientsParams,
) -> GradientsParams {
    let mut extracted = GradientsParams::new();
    let mut extractor = GradsExtractor::<B>::new(grads, &mut extracted);
    module.visit(&mut extractor);
    extracted
}

/// Split the generator-objective gradients into generator and style-encoder sets. Whatever
/// reached the discriminator or the mapping network is dropped.
fn split_grads<B: AutodiffBackend>(
    nets: &Networks<B>,
    mut grads: GradientsParams,
) -> (GradientsParams, GradientsParams) {
    let generator = extract_grads(&nets.generator, &mut grads);
    let style_encoder = extract_grads(&nets.style_encoder, &mut grads);
    (generator, style_encoder)
}

/// Elapsed time as `H:MM:SS`.
fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, secs / 60 % 60, secs % 60)
}

/// Checkpoint prefix of the live networks.
pub const NETS: &str = "nets";
/// Checkpoint prefix of the EMA networks.
pub const NETS_EMA: &str = "nets_ema";
/// Checkpoint prefix of the optimizer states.
pub const OPTIMS: &str = "optims";

/// Owns the networks, their optimizers and checkpoint stores, and runs the training loop.
pub struct Solver<B: AutodiffBackend> {
    config: TrainingConfig,
    device: B::Device,
    components: TrainedComponents<B>,
    optims: Optimizers<B>,
    vgg: FeatureExtractor<B>,
    nets_ckpt: CheckpointIo,
    nets_ema_ckpt: CheckpointIo,
    optims_ckpt: CheckpointIo,
}

impl<B: AutodiffBackend> Solver<B> {
    /// Build every network and optimizer on `device`, restoring `config.resume_iter` if set.
    pub fn new(config: TrainingConfig, device: B::Device) -> Result<Self> {
        B::seed(&device, config.seed);

        let networks = config.model.networks()?;
        info!("Initializing networks with He initialization...");
        let live = networks.init::<B>(WeightInit::He, &device);
        let ema = networks.init::<B::InnerBackend>(WeightInit::Default, &device);
        live.log_parameter_counts();

        let vgg = config
            .model
            .feature_extractor()
            .init::<B>(&device)
            .context("failed to load the feature extractor")?;

        let model_path = PathBuf::from(&config.model_path);
        let mut solver = Self {
            optims: Optimizers::new(&config),
            components: TrainedComponents::new(live, ema).to_device(&device),
            vgg,
            nets_ckpt: CheckpointIo::new(&model_path, NETS),
            nets_ema_ckpt: CheckpointIo::new(&model_path, NETS_EMA),
            optims_ckpt: CheckpointIo::new(&model_path, OPTIMS),
            config,
            device,
        };

        if solver.config.resume_iter > 0 {
            solver.load_checkpoint(solver.config.resume_iter)?;
        }
        Ok(solver)
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn components(&self) -> &TrainedComponents<B> {
        &self.components
    }

    pub fn model_path(&self) -> &Path {
        Path::new(&self.config.model_path)
    }

    /// Save live networks, EMA networks and optimizers for `step`, keeping one older generation.
    pub fn save_checkpoint(&self, step: usize) -> crate::error::Result<()> {
        let retention = self.config.save_every;
        self.nets_ckpt
            .save::<B, _>(&self.components.live, step, retention)?;
        self.nets_ema_ckpt
            .save::<B::InnerBackend, _>(&self.components.ema, step, retention)?;
        self.optims_ckpt.save::<B, _>(&self.optims, step, retention)?;
        Ok(())
    }

    /// Restore every store from `step`. Networks load before optimizers so the parameter ids
    /// the optimizer state is keyed by are in place.
    pub fn load_checkpoint(&mut self, step: usize) -> crate::error::Result<()> {
        let live = self
            .nets_ckpt
            .load::<B, _>(self.components.live.clone(), step, &self.device)?;
        let ema = self
            .nets_ema_ckpt
            .load::<B::InnerBackend, _>(self.components.ema.clone(), step, &self.device)?;
        let optims = self
            .optims_ckpt
            .load::<B, _>(self.optims.clone(), step, &self.device)?;

        self.components = TrainedComponents::new(live, ema);
        self.optims = optims;
        Ok(())
    }

    /// Frozen feature activations of real images.
    fn real_features(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let vgg = self.vgg.valid();
        Tensor::from_inner(vgg.forward(to_unit_range(images).inner()))
    }

    /// One discriminator update followed by one generator/style-encoder update and the EMA step.
    pub fn train_step(
        &mut self,
        inputs: Inputs<B>,
    ) -> crate::error::Result<(LossTerms, LossTerms)> {
        let Inputs {
            x_src,
            d_src,
            x_src2,
            d_src2,
            ..
        } = inputs;
        let features_real = self.real_features(x_src.clone());

        let (d_loss, d_terms) = compute_d_loss(
            &self.components.live,
            &self.config.loss,
            x_src.clone(),
            features_real.clone(),
            d_src.clone(),
            d_src2.clone(),
            x_src2.clone(),
        )?;
        let grads =
            GradientsParams::from_grads(d_loss.backward(), &self.components.live.discriminator);
        let discriminator = self.components.live.discriminator.clone();
        self.components.live.discriminator = self.optims.discriminator.step(discriminator, grads);

        let (g_loss, g_terms) = compute_g_loss(
            &self.components.live,
            &self.vgg,
            &self.config.loss,
            x_src,
            features_real,
            d_src,
            d_src2,
            x_src2,
        )?;
        let grads = GradientsParams::from_grads(g_loss.backward(), &self.components.live);
        let (generator_grads, style_grads) = split_grads(&self.components.live, grads);
        let generator = self.components.live.generator.clone();
        self.components.live.generator = self.optims.generator.step(generator, generator_grads);
        let style_encoder = self.components.live.style_encoder.clone();
        self.components.live.style_encoder =
            self.optims.style_encoder.step(style_encoder, style_grads);

        self.components.update_ema(EMA_BETA);
        Ok((d_terms, g_terms))
    }

    /// Run iterations `resume_iter..total_iters`.
    pub fn train(&mut self, loaders: &Loaders<B>) -> Result<()> {
        let mut fetcher = InputFetcher::new(loaders.src.as_ref(), &self.device);
        let sample_inputs = if self.config.sample_every > 0 {
            let inputs = InputFetcher::new(loaders.val.as_ref(), &self.device)
                .next()
                .ok_or(TrainError::EmptyDataSource)
                .context("validation loader produced no batch")?;
            Some(inputs)
        } else {
            None
        };

        let save_path = PathBuf::from(&self.config.save_path);
        let start = Instant::now();
        info!("Start training...");

        for step in self.config.resume_iter..self.config.total_iters {
            let inputs = fetcher
                .next()
                .ok_or(TrainError::EmptyDataSource)
                .context("training loader produced no batch")?;
            let (d_terms, g_terms) = self
                .train_step(inputs)
                .with_context(|| format!("training step {step} failed"))?;

            let done = step + 1;
            if self.config.print_every > 0 && done % self.config.print_every == 0 {
                info!(
                    "Elapsed time [{}], Iteration [{}/{}], {} {}",
                    format_elapsed(start.elapsed()),
                    done,
                    self.config.total_iters,
                    d_terms.with_prefix("D/ref_"),
                    g_terms.with_prefix("G/ref_"),
                );
            }

            if let Some(inputs) = &sample_inputs
                && done % self.config.sample_every == 0
            {
                let path = debug_image(
                    &self.components.ema,
                    &self.vgg.valid(),
                    &inputs_to_inner(inputs),
                    self.config.model.num_domains,
                    self.config.num_outs_per_domain,
                    &save_path,
                    done,
                )?;
                debug!("wrote sample grid {}", path.display());
            }

            if self.config.save_every > 0 && done % self.config.save_every == 0 {
                self.save_checkpoint(done)
                    .with_context(|| format!("failed to save checkpoint {done}"))?;
            }
        }

        Ok(())
    }
}

fn inputs_to_inner<B: AutodiffBackend>(inputs: &Inputs<B>) -> Inputs<B::InnerBackend> {
    Inputs {
        x_src: inputs.x_src.clone().inner(),
        y_src: inputs.y_src.clone().inner(),
        d_src: inputs.d_src.clone().inner(),
        x_src2: inputs.x_src2.clone().inner(),
        d_src2: inputs.d_src2.clone().inner(),
    }
}
