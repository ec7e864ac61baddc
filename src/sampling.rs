//! Image grids produced from the EMA networks: periodic debug samples during training and the
//! evaluation grids written by the `sample` binary.

use std::path::{Path, PathBuf};

use anyhow::Result;
use burn::prelude::*;
use burn::tensor::Distribution;
use clap::ValueEnum;

use crate::fetcher::Inputs;
use crate::model::{FeatureExtractor, ModelConfig, Networks, to_unit_range};
use crate::utils::save_image_grid;

/// Most target domains shown in one debug grid.
const MAX_DEBUG_DOMAINS: usize = 5;

/// Source rows picked from the batch by the [`EvalProfile::Sr`] grid.
pub const SR_SOURCE_INDICES: [usize; 5] = [0, 15, 31, 50, 60];
const SR_LATENTS: usize = 5;
const MS_SOURCES: usize = 64;

/// Per-dataset evaluation settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EvalProfile {
    /// Synthetic-to-real: a few fixed sources, several latent codes each.
    Sr,
    /// MNIST to SVHN: many sources, each shown next to its translation.
    Ms,
}

impl EvalProfile {
    /// Override the architecture constants the profile was trained with.
    pub fn apply(&self, config: &mut ModelConfig) {
        match self {
            EvalProfile::Sr => {
                config.img_size = 256;
                config.bottleneck_blocks = 4;
                config.latent_dim = 16;
            }
            EvalProfile::Ms => {
                config.img_size = 32;
                config.num_classes = 10;
            }
        }
    }

    /// Images per row of the written grid.
    pub fn ncol(&self) -> usize {
        match self {
            EvalProfile::Sr => SR_SOURCE_INDICES.len(),
            EvalProfile::Ms => 10,
        }
    }
}

fn domain_ids<B: Backend>(domain: usize, len: usize, device: &B::Device) -> Tensor<B, 1, Int> {
    Tensor::full([len], domain as i64, device)
}

fn random_latent<B: Backend>(latent_dim: usize, device: &B::Device) -> Tensor<B, 2> {
    Tensor::random([1, latent_dim], Distribution::Normal(0.0, 1.0), device)
}

/// Translate `x_src` into every target domain with every latent code.
///
/// Returns the sources followed by one block of translations per `(domain, latent)` pair, in
/// domain-major order. Each latent code is a `[1, latent_dim]` row shared by the whole batch.
pub fn translate_using_latent<B: Backend>(
    nets: &Networks<B>,
    features: &FeatureExtractor<B>,
    x_src: Tensor<B, 4>,
    classes: Tensor<B, 1, Int>,
    target_domains: &[usize],
    latents: &[Tensor<B, 2>],
) -> Tensor<B, 4> {
    let [batch, _, _, _] = x_src.dims();
    let device = x_src.device();
    let feats = features.forward(to_unit_range(x_src.clone()));

    let mut blocks = vec![x_src.clone()];
    for &domain in target_domains {
        let domains = domain_ids::<B>(domain, batch, &device);
        for latent in latents {
            let style = nets.mapping_network.forward(
                latent.clone().repeat_dim(0, batch),
                Some(classes.clone()),
                domains.clone(),
            );
            blocks.push(
                nets.generator
                    .forward(x_src.clone(), Some(feats.clone()), style),
            );
        }
    }
    Tensor::cat(blocks, 0)
}

/// Write the latent-guided translation grid of a validation batch for `step`.
///
/// The file lands at `{save_path}/{step:06}_latent_psi_1.0.jpg`.
pub fn debug_image<B: Backend>(
    nets: &Networks<B>,
    features: &FeatureExtractor<B>,
    inputs: &Inputs<B>,
    num_domains: usize,
    num_outs_per_domain: usize,
    save_path: &Path,
    step: usize,
) -> Result<PathBuf> {
    let [batch, _, _, _] = inputs.x_src.dims();
    let device = inputs.x_src.device();
    let latent_dim = nets.mapping_network.latent_dim();

    let domains: Vec<usize> = (0..num_domains.min(MAX_DEBUG_DOMAINS)).collect();
    let latents: Vec<_> = (0..num_outs_per_domain)
        .map(|_| random_latent::<B>(latent_dim, &device))
        .collect();
    let grid = translate_using_latent(
        nets,
        features,
        inputs.x_src.clone(),
        inputs.y_src.clone(),
        &domains,
        &latents,
    );

    let path = save_path.join(format!("{step:06}_latent_psi_1.0.jpg"));
    save_image_grid(grid, batch, &path)?;
    Ok(path)
}

/// Evaluation grid of `batch` translated into `domain`, laid out for `profile`.
pub fn fetch_results<B: Backend>(
    nets: &Networks<B>,
    features: &FeatureExtractor<B>,
    profile: EvalProfile,
    batch: &Inputs<B>,
    domain: usize,
    device: &B::Device,
) -> Tensor<B, 4> {
    let [len, _, _, _] = batch.x_src.dims();
    let latent_dim = nets.mapping_network.latent_dim();

    match profile {
        EvalProfile::Sr => {
            let picked: Vec<i64> = SR_SOURCE_INDICES
                .iter()
                .filter(|&&idx| idx < len)
                .map(|&idx| idx as i64)
                .collect();
            let count = picked.len();
            let indices = Tensor::<B, 1, Int>::from_data(TensorData::new(picked, [count]), device);
            let x_src = batch.x_src.clone().select(0, indices.clone());
            let classes = batch.y_src.clone().select(0, indices);
            let latents: Vec<_> = (0..SR_LATENTS)
                .map(|_| random_latent::<B>(latent_dim, device))
                .collect();
            translate_using_latent(nets, features, x_src, classes, &[domain], &latents)
        }
        EvalProfile::Ms => {
            let count = len.min(MS_SOURCES);
            let x_src = batch.x_src.clone().slice([0..count]);
            let classes = batch.y_src.clone().slice([0..count]);
            let feats = features.forward(to_unit_range(x_src.clone()));
            let latent =
                Tensor::random([count, latent_dim], Distribution::Normal(0.0, 1.0), device);
            let style = nets.mapping_network.forward(
                latent,
                Some(classes),
                domain_ids::<B>(domain, count, device),
            );
            let x_fake = nets.generator.forward(x_src.clone(), Some(feats), style);

            let [_, channels, height, width] = x_src.dims();
            Tensor::stack::<5>(vec![x_src, x_fake], 1).reshape([2 * count, channels, height, width])
        }
    }
}
