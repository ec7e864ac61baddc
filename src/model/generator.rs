use crate::model::layers::{AdainResBlk, LEAKY_SLOPE, ResBlk, WeightInit, conv2d};
use burn::nn::conv::Conv2d;
use burn::nn::{InstanceNorm, InstanceNormConfig};
use burn::prelude::*;
use burn::tensor::activation::leaky_relu;
use burn::tensor::module::adaptive_avg_pool2d;

/// Configuration for the style-modulated encoder/decoder generator.
#[derive(Config, Debug)]
pub struct GeneratorConfig {
    pub img_size: usize,
    pub style_dim: usize,
    pub max_conv_dim: usize,
    pub bottleneck_size: usize,
    pub bottleneck_blocks: usize,
    /// Channels of the frozen feature maps added at the bottleneck; `None` disables them.
    pub feature_channels: Option<usize>,
}

/// Encoder of downsampling residual blocks, a mirrored AdaIN decoder, and an optional
/// projection of frozen image features into the bottleneck.
#[derive(Module, Debug)]
pub struct Generator<B: Backend> {
    from_rgb: Conv2d<B>,
    encode: Vec<ResBlk<B>>,
    decode: Vec<AdainResBlk<B>>,
    to_rgb_norm: InstanceNorm<B>,
    to_rgb: Conv2d<B>,
    feature_proj: Option<Conv2d<B>>,
    bottleneck_size: usize,
}

impl GeneratorConfig {
    /// Width of the first encoder stage.
    pub fn base_dim(&self) -> usize {
        ((1 << 14) / self.img_size).min(self.max_conv_dim)
    }

    pub fn num_downsamples(&self) -> usize {
        (self.img_size / self.bottleneck_size.max(1)).max(1).ilog2() as usize
    }

    pub fn init<B: Backend>(&self, init: WeightInit, device: &B::Device) -> Generator<B> {
        let base = self.base_dim();
        let mut dim_in = base;
        let mut encode = Vec::new();
        let mut decode = Vec::new();

        for _ in 0..self.num_downsamples() {
            let dim_out = (dim_in * 2).min(self.max_conv_dim);
            encode.push(ResBlk::new(dim_in, dim_out, true, true, init, device));
            decode.push(AdainResBlk::new(dim_out, dim_in, self.style_dim, true, init, device));
            dim_in = dim_out;
        }
        for _ in 0..self.bottleneck_blocks {
            encode.push(ResBlk::new(dim_in, dim_in, true, false, init, device));
            decode.push(AdainResBlk::new(dim_in, dim_in, self.style_dim, false, init, device));
        }
        decode.reverse();

        let feature_proj = self
            .feature_channels
            .map(|channels| conv2d([channels, dim_in], 1, 0, true, init, device));

        Generator {
            from_rgb: conv2d([3, base], 3, 1, true, init, device),
            encode,
            decode,
            to_rgb_norm: InstanceNormConfig::new(base).with_affine(true).init(device),
            to_rgb: conv2d([base, 3], 1, 0, true, init, device),
            feature_proj,
            bottleneck_size: self.bottleneck_size,
        }
    }
}

impl<B: Backend> Generator<B> {
    /// Translate `x` toward the style code `style`.
    ///
    /// `features` are ignored unless the generator was built with a feature projection.
    pub fn forward(
        &self,
        x: Tensor<B, 4>,
        features: Option<Tensor<B, 4>>,
        style: Tensor<B, 2>,
    ) -> Tensor<B, 4> {
        let mut x = self.from_rgb.forward(x);
        for block in &self.encode {
            x = block.forward(x);
        }

        if let (Some(proj), Some(features)) = (&self.feature_proj, features) {
            let size = self.bottleneck_size;
            x = x.add(proj.forward(adaptive_avg_pool2d(features, [size, size])));
        }

        for block in &self.decode {
            x = block.forward(x, style.clone());
        }
        let x = leaky_relu(self.to_rgb_norm.forward(x), LEAKY_SLOPE);
        self.to_rgb.forward(x)
    }

    pub fn uses_features(&self) -> bool {
        self.feature_proj.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    fn config() -> GeneratorConfig {
        GeneratorConfig::new(16, 4, 16, 4, 1)
    }

    #[test]
    fn keeps_image_shape() {
        let device = Default::default();
        let generator = config().init::<TestBackend>(WeightInit::He, &device);
        let x = Tensor::random([2, 3, 16, 16], Distribution::Normal(0.0, 1.0), &device);
        let s = Tensor::random([2, 4], Distribution::Normal(0.0, 1.0), &device);
        assert_eq!(generator.forward(x, None, s).dims(), [2, 3, 16, 16]);
        assert!(!generator.uses_features());
    }

    #[test]
    fn adds_projected_features_at_the_bottleneck() {
        let device = Default::default();
        let generator = config()
            .with_feature_channels(Some(5))
            .init::<TestBackend>(WeightInit::He, &device);
        let x = Tensor::random([1, 3, 16, 16], Distribution::Normal(0.0, 1.0), &device);
        let s = Tensor::random([1, 4], Distribution::Normal(0.0, 1.0), &device);
        let features = Tensor::random([1, 5, 8, 8], Distribution::Normal(0.0, 1.0), &device);

        let with = generator.forward(x.clone(), Some(features), s.clone());
        let without = generator.forward(x, None, s);
        assert_eq!(with.dims(), [1, 3, 16, 16]);
        let diff = with.sub(without).abs().sum().into_scalar();
        assert!(diff > 0.0);
    }

    #[test]
    fn stage_widths_follow_image_size() {
        let config = GeneratorConfig::new(256, 64, 512, 64, 2);
        assert_eq!(config.base_dim(), 64);
        assert_eq!(config.num_downsamples(), 2);
    }
}
