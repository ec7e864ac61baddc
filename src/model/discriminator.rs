use crate::model::layers::{LEAKY_SLOPE, ResBlk, WeightInit, conv2d, linear, select_domain};
use burn::nn::Linear;
use burn::nn::conv::Conv2d;
use burn::prelude::*;
use burn::tensor::activation::{leaky_relu, relu};

/// Shape of the downsampling trunk shared by the discriminator and the style encoder.
#[derive(Config, Debug)]
pub struct TrunkConfig {
    pub img_size: usize,
    pub max_conv_dim: usize,
}

impl TrunkConfig {
    fn base_dim(&self) -> usize {
        ((1 << 14) / self.img_size).min(self.max_conv_dim)
    }

    /// Downsampling blocks needed to reach a 4x4 map.
    fn repeat_num(&self) -> usize {
        (self.img_size.max(8).ilog2() - 2) as usize
    }

    /// Channels of the 1x1 trunk output.
    pub fn out_dim(&self) -> usize {
        let mut dim = self.base_dim();
        for _ in 0..self.repeat_num() {
            dim = (dim * 2).min(self.max_conv_dim);
        }
        dim
    }

    pub fn init<B: Backend>(&self, init: WeightInit, device: &B::Device) -> Trunk<B> {
        let mut dim_in = self.base_dim();
        let from_rgb = conv2d([3, dim_in], 3, 1, true, init, device);
        let mut blocks = Vec::with_capacity(self.repeat_num());
        for _ in 0..self.repeat_num() {
            let dim_out = (dim_in * 2).min(self.max_conv_dim);
            blocks.push(ResBlk::new(dim_in, dim_out, false, true, init, device));
            dim_in = dim_out;
        }
        Trunk {
            from_rgb,
            blocks,
            head: conv2d([dim_in, dim_in], 4, 0, true, init, device),
        }
    }
}

/// Convolutional trunk reducing an image to a `[batch, channels]` code.
#[derive(Module, Debug)]
pub struct Trunk<B: Backend> {
    from_rgb: Conv2d<B>,
    blocks: Vec<ResBlk<B>>,
    head: Conv2d<B>,
}

impl<B: Backend> Trunk<B> {
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = self.from_rgb.forward(images);
        for block in &self.blocks {
            x = block.forward(x);
        }
        let x = leaky_relu(self.head.forward(leaky_relu(x, LEAKY_SLOPE)), LEAKY_SLOPE);
        let [batch, channels, height, width] = x.dims();
        x.reshape([batch, channels * height * width])
    }
}

/// Configuration for the multi-domain discriminator.
#[derive(Config, Debug)]
pub struct DiscriminatorConfig {
    pub img_size: usize,
    pub num_domains: usize,
    pub max_conv_dim: usize,
}

/// Discriminator with one real/fake logit per domain.
#[derive(Module, Debug)]
pub struct Discriminator<B: Backend> {
    trunk: Trunk<B>,
    fc_domains: Linear<B>,
    num_domains: usize,
}

impl DiscriminatorConfig {
    pub fn init<B: Backend>(&self, init: WeightInit, device: &B::Device) -> Discriminator<B> {
        let trunk = TrunkConfig::new(self.img_size, self.max_conv_dim);
        Discriminator {
            fc_domains: linear(trunk.out_dim(), self.num_domains, init, device),
            trunk: trunk.init(init, device),
            num_domains: self.num_domains,
        }
    }
}

impl<B: Backend> Discriminator<B> {
    /// Logit of each sample for its own domain, shape `[batch, 1]`.
    pub fn forward(&self, images: Tensor<B, 4>, domains: Tensor<B, 1, Int>) -> Tensor<B, 2> {
        let logits = self.fc_domains.forward(self.trunk.forward(images));
        let [batch, _] = logits.dims();
        select_domain(logits.reshape([batch, self.num_domains, 1]), domains)
    }
}

/// Configuration for the per-domain style encoder.
#[derive(Config, Debug)]
pub struct StyleEncoderConfig {
    pub img_size: usize,
    pub style_dim: usize,
    pub num_domains: usize,
    pub max_conv_dim: usize,
    #[config(default = 0)]
    pub n_unshared_layers: usize,
}

/// Unshared projection from the trunk code to a style code.
#[derive(Module, Debug)]
pub struct StyleHead<B: Backend> {
    hidden: Vec<Linear<B>>,
    out: Linear<B>,
}

impl<B: Backend> StyleHead<B> {
    fn forward(&self, mut h: Tensor<B, 2>) -> Tensor<B, 2> {
        for layer in &self.hidden {
            h = relu(layer.forward(h));
        }
        self.out.forward(h)
    }
}

/// Encodes a reference image into the style code of a chosen domain.
#[derive(Module, Debug)]
pub struct StyleEncoder<B: Backend> {
    trunk: Trunk<B>,
    heads: Vec<StyleHead<B>>,
}

impl StyleEncoderConfig {
    pub fn init<B: Backend>(&self, init: WeightInit, device: &B::Device) -> StyleEncoder<B> {
        let trunk = TrunkConfig::new(self.img_size, self.max_conv_dim);
        let dim = trunk.out_dim();
        let heads = (0..self.num_domains)
            .map(|_| StyleHead {
                hidden: (0..self.n_unshared_layers)
                    .map(|_| linear(dim, dim, init, device))
                    .collect(),
                out: linear(dim, self.style_dim, init, device),
            })
            .collect();
        StyleEncoder {
            trunk: trunk.init(init, device),
            heads,
        }
    }
}

impl<B: Backend> StyleEncoder<B> {
    pub fn forward(&self, images: Tensor<B, 4>, domains: Tensor<B, 1, Int>) -> Tensor<B, 2> {
        let h = self.trunk.forward(images);
        let per_domain = self
            .heads
            .iter()
            .map(|head| head.forward(h.clone()))
            .collect::<Vec<_>>();
        select_domain(Tensor::stack::<3>(per_domain, 1), domains)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::{Distribution, TensorData};

    type TestBackend = NdArray<f32>;

    fn domains(ids: Vec<i64>) -> Tensor<TestBackend, 1, Int> {
        let len = ids.len();
        Tensor::from_data(TensorData::new(ids, [len]), &Default::default())
    }

    #[test]
    fn discriminator_emits_one_logit_per_sample() {
        let device = Default::default();
        let disc = DiscriminatorConfig::new(16, 3, 16).init::<TestBackend>(WeightInit::He, &device);
        let x = Tensor::random([2, 3, 16, 16], Distribution::Normal(0.0, 1.0), &device);
        assert_eq!(disc.forward(x, domains(vec![0, 2])).dims(), [2, 1]);
    }

    #[test]
    fn style_encoder_switches_heads_by_domain() {
        let device = Default::default();
        let encoder = StyleEncoderConfig::new(16, 4, 2, 16)
            .with_n_unshared_layers(1)
            .init::<TestBackend>(WeightInit::He, &device);
        let x = Tensor::<TestBackend, 4>::random(
            [1, 3, 16, 16],
            Distribution::Normal(0.0, 1.0),
            &device,
        );

        let s0 = encoder.forward(x.clone(), domains(vec![0]));
        let s1 = encoder.forward(x, domains(vec![1]));
        assert_eq!(s0.dims(), [1, 4]);
        assert!(s0.sub(s1).abs().sum().into_scalar() > 0.0);
    }

    #[test]
    fn trunk_width_is_capped() {
        let config = TrunkConfig::new(256, 512);
        assert_eq!(config.repeat_num(), 6);
        assert_eq!(config.out_dim(), 512);
    }
}
