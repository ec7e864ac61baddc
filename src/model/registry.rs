//! Model types selectable by name from the training configuration.

use crate::error::{Result, TrainError};
use crate::model::discriminator::{DiscriminatorConfig, StyleEncoderConfig};
use crate::model::generator::GeneratorConfig;
use crate::model::mapping::MappingNetworkConfig;
use crate::model::{ModelConfig, NetworksConfig};

/// Derives the network configurations of a model type.
pub type BuildFn = fn(&ModelConfig) -> NetworksConfig;

static MODEL_TYPES: &[(&str, BuildFn)] = &[
    ("egsc", build_egsc),
    ("sg", build_sg),
    ("sg_sem", build_sg_sem),
];

/// Resolve a model type name to its build function.
pub fn lookup(name: &str) -> Result<BuildFn> {
    MODEL_TYPES
        .iter()
        .find(|(key, _)| *key == name)
        .map(|(_, build)| *build)
        .ok_or_else(|| TrainError::UnknownModelType(name.to_string()))
}

pub fn model_types() -> impl Iterator<Item = &'static str> {
    MODEL_TYPES.iter().map(|(name, _)| *name)
}

fn base(config: &ModelConfig) -> NetworksConfig {
    NetworksConfig {
        generator: GeneratorConfig::new(
            config.img_size,
            config.style_dim,
            config.max_conv_dim,
            config.bottleneck_size,
            config.bottleneck_blocks,
        ),
        mapping_network: MappingNetworkConfig::new(
            config.latent_dim,
            config.style_dim,
            config.num_domains,
        )
        .with_hidden_dim(config.hidden_dim),
        style_encoder: StyleEncoderConfig::new(
            config.img_size,
            config.style_dim,
            config.num_domains,
            config.max_conv_dim,
        )
        .with_n_unshared_layers(config.n_unshared_layers),
        discriminator: DiscriminatorConfig::new(
            config.img_size,
            config.num_domains,
            config.max_conv_dim,
        ),
    }
}

/// Generator guided by frozen feature activations of the source image.
fn build_egsc(config: &ModelConfig) -> NetworksConfig {
    let mut nets = base(config);
    nets.generator = nets
        .generator
        .with_feature_channels(Some(config.feature_extractor().out_channels()));
    nets
}

fn build_sg(config: &ModelConfig) -> NetworksConfig {
    base(config)
}

/// Mapping network conditioned on semantic class labels.
fn build_sg_sem(config: &ModelConfig) -> NetworksConfig {
    let mut nets = base(config);
    nets.mapping_network = nets
        .mapping_network
        .with_num_classes(Some(config.num_classes));
    nets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_types_resolve() {
        let config = ModelConfig::new();
        for name in model_types() {
            assert!(lookup(name).is_ok(), "{name}");
        }
        let egsc = lookup("egsc").unwrap()(&config);
        assert_eq!(egsc.generator.feature_channels, Some(512));
        let sem = lookup("sg_sem").unwrap()(&config);
        assert_eq!(sem.mapping_network.num_classes, Some(config.num_classes));
        assert_eq!(lookup("sg").unwrap()(&config).generator.feature_channels, None);
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(matches!(
            lookup("udt"),
            Err(TrainError::UnknownModelType(name)) if name == "udt"
        ));
    }
}
