use crate::model::layers::{WeightInit, linear, select_domain};
use burn::nn::{Embedding, EmbeddingConfig, Linear};
use burn::prelude::*;
use burn::tensor::activation::relu;

/// Configuration for the latent-to-style mapping network.
#[derive(Config, Debug)]
pub struct MappingNetworkConfig {
    pub latent_dim: usize,
    pub style_dim: usize,
    pub num_domains: usize,
    #[config(default = 512)]
    pub hidden_dim: usize,
    /// Number of semantic classes whose embedding is added to the latent code.
    pub num_classes: Option<usize>,
}

/// Maps a latent code (and optionally a semantic class) to the style code of a domain.
#[derive(Module, Debug)]
pub struct MappingNetwork<B: Backend> {
    class_embedding: Option<Embedding<B>>,
    shared: Vec<Linear<B>>,
    unshared: Vec<Vec<Linear<B>>>,
}

impl MappingNetworkConfig {
    pub fn init<B: Backend>(&self, init: WeightInit, device: &B::Device) -> MappingNetwork<B> {
        let hidden = self.hidden_dim;
        let mut shared = vec![linear(self.latent_dim, hidden, init, device)];
        shared.extend((0..3).map(|_| linear(hidden, hidden, init, device)));

        let unshared = (0..self.num_domains)
            .map(|_| {
                let mut head: Vec<Linear<B>> =
                    (0..3).map(|_| linear(hidden, hidden, init, device)).collect();
                head.push(linear(hidden, self.style_dim, init, device));
                head
            })
            .collect();

        MappingNetwork {
            class_embedding: self
                .num_classes
                .map(|classes| EmbeddingConfig::new(classes, self.latent_dim).init(device)),
            shared,
            unshared,
        }
    }
}

impl<B: Backend> MappingNetwork<B> {
    pub fn forward(
        &self,
        latent: Tensor<B, 2>,
        classes: Option<Tensor<B, 1, Int>>,
        domains: Tensor<B, 1, Int>,
    ) -> Tensor<B, 2> {
        let mut h = match (&self.class_embedding, classes) {
            (Some(embedding), Some(classes)) => {
                let [batch, latent_dim] = latent.dims();
                let embedded = embedding
                    .forward(classes.unsqueeze_dim::<2>(1))
                    .reshape([batch, latent_dim]);
                latent.add(embedded)
            }
            _ => latent,
        };
        for layer in &self.shared {
            h = relu(layer.forward(h));
        }

        let per_domain = self
            .unshared
            .iter()
            .map(|head| {
                let last = head.len() - 1;
                head.iter().enumerate().fold(h.clone(), |x, (idx, layer)| {
                    let x = layer.forward(x);
                    if idx < last { relu(x) } else { x }
                })
            })
            .collect::<Vec<_>>();
        select_domain(Tensor::stack::<3>(per_domain, 1), domains)
    }

    pub fn uses_classes(&self) -> bool {
        self.class_embedding.is_some()
    }

    /// Width of the latent codes accepted by [`Self::forward`].
    pub fn latent_dim(&self) -> usize {
        self.shared
            .first()
            .map(|layer| layer.weight.dims()[0])
            .unwrap_or_default()
    }
}
