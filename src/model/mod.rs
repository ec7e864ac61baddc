pub mod discriminator;
pub mod generator;
pub mod layers;
pub mod mapping;
pub mod registry;
pub mod vgg;

use std::path::PathBuf;

use burn::module::AutodiffModule;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use tracing::info;

use crate::checkpoint::Checkpointable;
use crate::loss::{
    LossTerms, adv_loss, cycle_loss, perceptual_loss, r1_reg, style_loss, style_reg_loss,
};

pub use discriminator::{Discriminator, DiscriminatorConfig, StyleEncoder, StyleEncoderConfig};
pub use generator::{Generator, GeneratorConfig};
pub use layers::WeightInit;
pub use mapping::{MappingNetwork, MappingNetworkConfig};
pub use vgg::{FeatureExtractor, FeatureExtractorConfig, to_unit_range};

/// Architecture hyperparameters shared by every network.
#[derive(Config, Debug)]
pub struct ModelConfig {
    #[config(default = 256)]
    pub img_size: usize,
    #[config(default = 2)]
    pub num_domains: usize,
    #[config(default = 5)]
    pub num_classes: usize,
    #[config(default = 16)]
    pub latent_dim: usize,
    #[config(default = 512)]
    pub hidden_dim: usize,
    #[config(default = 64)]
    pub style_dim: usize,
    #[config(default = 0)]
    pub n_unshared_layers: usize,
    /// Spatial size of the generator bottleneck.
    #[config(default = 64)]
    pub bottleneck_size: usize,
    #[config(default = 2)]
    pub bottleneck_blocks: usize,
    #[config(default = 512)]
    pub max_conv_dim: usize,
    /// Name looked up in [`registry`].
    #[config(default = "String::from(\"egsc\")")]
    pub model_type: String,
    #[config(default = 29)]
    pub feature_layers: usize,
    pub feature_weights: Option<PathBuf>,
}

/// Weighting for each loss term used during training.
#[derive(Config, Debug)]
pub struct LossConfig {
    #[config(default = 1.0)]
    pub lambda_reg: f64,
    #[config(default = 10.0)]
    pub lambda_cyc: f64,
    #[config(default = 0.1)]
    pub lambda_vae: f64,
    #[config(default = 0.1)]
    pub lambda_vgg: f64,
    #[config(default = 0.1)]
    pub lambda_gram: f64,
}

impl ModelConfig {
    /// Network configurations of the selected model type.
    pub fn networks(&self) -> crate::Result<NetworksConfig> {
        Ok(registry::lookup(&self.model_type)?(self))
    }

    pub fn feature_extractor(&self) -> FeatureExtractorConfig {
        FeatureExtractorConfig::new()
            .with_num_layers(self.feature_layers)
            .with_weights(self.feature_weights.clone())
    }
}

#[derive(Config, Debug)]
pub struct NetworksConfig {
    pub generator: GeneratorConfig,
    pub mapping_network: MappingNetworkConfig,
    pub style_encoder: StyleEncoderConfig,
    pub discriminator: DiscriminatorConfig,
}

impl NetworksConfig {
    pub fn init<B: Backend>(&self, init: WeightInit, device: &B::Device) -> Networks<B> {
        Networks {
            generator: self.generator.init(init, device),
            mapping_network: self.mapping_network.init(init, device),
            style_encoder: self.style_encoder.init(init, device),
            discriminator: self.discriminator.init(init, device),
        }
    }
}

/// The named set of networks trained together. Checkpoints key each member by field name.
#[derive(Module, Debug)]
pub struct Networks<B: Backend> {
    pub generator: Generator<B>,
    pub mapping_network: MappingNetwork<B>,
    pub style_encoder: StyleEncoder<B>,
    pub discriminator: Discriminator<B>,
}

impl<B: Backend> Networks<B> {
    pub const NAMES: [&'static str; 4] =
        ["generator", "mapping_network", "style_encoder", "discriminator"];

    /// Parameter count of every member, in [`Self::NAMES`] order.
    pub fn parameter_counts(&self) -> [(&'static str, usize); 4] {
        [
            (Self::NAMES[0], self.generator.num_params()),
            (Self::NAMES[1], self.mapping_network.num_params()),
            (Self::NAMES[2], self.style_encoder.num_params()),
            (Self::NAMES[3], self.discriminator.num_params()),
        ]
    }

    pub fn log_parameter_counts(&self) {
        for (name, count) in self.parameter_counts() {
            info!("Number of parameters of {name}: {count}");
        }
        info!(
            "Generator feature conditioning: {}, class-conditioned mapping: {}",
            self.generator.uses_features(),
            self.mapping_network.uses_classes()
        );
    }
}

impl<B: Backend> Checkpointable<B> for Networks<B> {
    type Record = NetworksRecord<B>;

    fn to_record(&self) -> Self::Record {
        self.clone().into_record()
    }

    fn load_record(self, record: Self::Record) -> Self {
        Module::load_record(self, record)
    }
}

/// Discriminator objective: real and fake adversarial terms plus the weighted R1 penalty.
///
/// The fake batch is synthesized without gradient tracking.
pub fn compute_d_loss<B: AutodiffBackend>(
    nets: &Networks<B>,
    loss: &LossConfig,
    x_real: Tensor<B, 4>,
    features_real: Tensor<B, 4>,
    d_org: Tensor<B, 1, Int>,
    d_trg: Tensor<B, 1, Int>,
    x_trg: Tensor<B, 4>,
) -> crate::Result<(Tensor<B, 1>, LossTerms)> {
    let loss_reg = r1_reg(x_real.clone(), |x| {
        nets.discriminator.forward(x, d_org.clone())
    })?;
    let loss_real = adv_loss(nets.discriminator.forward(x_real.clone(), d_org), 1)?;

    let x_fake = {
        let style_encoder = nets.style_encoder.valid();
        let generator = nets.generator.valid();
        let s_trg = style_encoder.forward(x_trg.inner(), d_trg.clone().inner());
        Tensor::from_inner(generator.forward(x_real.inner(), Some(features_real.inner()), s_trg))
    };
    let loss_fake = adv_loss(nets.discriminator.forward(x_fake, d_trg), 0)?;

    let total =
        loss_real.clone() + loss_fake.clone() + loss_reg.clone().mul_scalar(loss.lambda_reg);

    let mut terms = LossTerms::new();
    terms.push("real", &loss_real);
    terms.push("fake", &loss_fake);
    terms.push("reg", &loss_reg);
    Ok((total, terms))
}

/// Generator objective: adversarial, perceptual, Gram style, style-code regularization and
/// cycle-consistency terms.
#[allow(clippy::too_many_arguments)]
pub fn compute_g_loss<B: AutodiffBackend>(
    nets: &Networks<B>,
    vgg: &FeatureExtractor<B>,
    loss: &LossConfig,
    x_real: Tensor<B, 4>,
    features_real: Tensor<B, 4>,
    d_org: Tensor<B, 1, Int>,
    d_trg: Tensor<B, 1, Int>,
    x_ref: Tensor<B, 4>,
) -> crate::Result<(Tensor<B, 1>, LossTerms)> {
    let s_trg = nets.style_encoder.forward(x_ref, d_trg.clone());
    let x_fake = nets
        .generator
        .forward(x_real.clone(), Some(features_real.clone()), s_trg.clone());
    let loss_adv = adv_loss(nets.discriminator.forward(x_fake.clone(), d_trg), 1)?;

    let features_fake = vgg.forward(to_unit_range(x_fake.clone()));
    let loss_vgg = perceptual_loss(features_real.clone(), features_fake.clone());
    let loss_gram = style_loss(features_real, features_fake.clone());
    let loss_vae = style_reg_loss(s_trg);

    let s_org = nets.style_encoder.forward(x_real.clone(), d_org);
    let x_rec = nets.generator.forward(x_fake, Some(features_fake), s_org);
    let loss_cyc = cycle_loss(x_rec, x_real);

    let total = loss_adv.clone()
        + loss_cyc.clone().mul_scalar(loss.lambda_cyc)
        + loss_vgg.clone().mul_scalar(loss.lambda_vgg)
        + loss_gram.clone().mul_scalar(loss.lambda_gram)
        + loss_vae.clone().mul_scalar(loss.lambda_vae);

    let mut terms = LossTerms::new();
    terms.push("adv", &loss_adv);
    terms.push("vgg", &loss_vgg);
    terms.push("gram", &loss_gram);
    terms.push("vae", &loss_vae);
    terms.push("cyc", &loss_cyc);
    Ok((total, terms))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use burn::tensor::{Distribution, TensorData};

    type TestBackend = Autodiff<NdArray<f32>>;

    pub(crate) fn tiny_model_config() -> ModelConfig {
        ModelConfig::new()
            .with_img_size(16)
            .with_num_domains(2)
            .with_num_classes(3)
            .with_latent_dim(4)
            .with_hidden_dim(8)
            .with_style_dim(4)
            .with_bottleneck_size(8)
            .with_bottleneck_blocks(1)
            .with_max_conv_dim(8)
            .with_feature_layers(2)
    }

    #[test]
    fn composite_losses_report_every_term() {
        let device = Default::default();
        let config = tiny_model_config();
        let nets = config
            .networks()
            .unwrap()
            .init::<TestBackend>(WeightInit::He, &device);
        let vgg = config.feature_extractor().init::<TestBackend>(&device).unwrap();

        let image = || {
            Tensor::<TestBackend, 4>::random(
                [2, 3, 16, 16],
                Distribution::Uniform(-1.0, 1.0),
                &device,
            )
        };
        let x_real = image();
        let x_ref = image();
        let domains = |values: Vec<i64>| {
            Tensor::<TestBackend, 1, Int>::from_data(TensorData::new(values, [2]), &device)
        };
        let d_org = domains(vec![0, 1]);
        let d_trg = domains(vec![1, 0]);
        let features_real =
            Tensor::from_inner(vgg.valid().forward(to_unit_range(x_real.clone()).inner()));

        let (d_total, d_terms) = compute_d_loss(
            &nets,
            &LossConfig::new(),
            x_real.clone(),
            features_real.clone(),
            d_org.clone(),
            d_trg.clone(),
            x_ref.clone(),
        )
        .unwrap();
        let names: Vec<_> = d_terms.iter().map(|(name, _)| name).collect();
        assert_eq!(names, ["real", "fake", "reg"]);
        let expected = d_terms.get("real").unwrap()
            + d_terms.get("fake").unwrap()
            + d_terms.get("reg").unwrap();
        let d_total = d_total.into_scalar().elem::<f64>();
        assert!((d_total - expected).abs() < 1e-4);

        let (g_total, g_terms) = compute_g_loss(
            &nets,
            &vgg,
            &LossConfig::new(),
            x_real,
            features_real,
            d_org,
            d_trg,
            x_ref,
        )
        .unwrap();
        let names: Vec<_> = g_terms.iter().map(|(name, _)| name).collect();
        assert_eq!(names, ["adv", "vgg", "gram", "vae", "cyc"]);
        assert!(g_total.into_scalar().elem::<f64>().is_finite());
    }

    #[test]
    fn unknown_model_type_fails_at_build() {
        let config = tiny_model_config().with_model_type("stargan".to_string());
        assert!(config.networks().is_err());
    }

    #[test]
    fn configs_reload_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        tiny_model_config().with_num_domains(4).save(&path).unwrap();

        let loaded = ModelConfig::load(&path).unwrap();
        assert_eq!(loaded.num_domains, 4);
        assert_eq!(loaded.model_type, "egsc");
        assert_eq!(loaded.feature_weights, None);
        assert!(loaded.networks().is_ok());

        let loss = LossConfig::new().with_lambda_cyc(2.5);
        loss.save(dir.path().join("loss.json")).unwrap();
        let loss = LossConfig::load(dir.path().join("loss.json")).unwrap();
        assert_eq!(loss.lambda_cyc, 2.5);
        assert_eq!(loss.lambda_reg, 1.0);
    }
}
