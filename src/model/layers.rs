use burn::module::Param;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{
    Initializer, InstanceNorm, InstanceNormConfig, Linear, LinearConfig, PaddingConfig2d,
};
use burn::prelude::*;
use burn::tensor::activation::leaky_relu;
use burn::tensor::module::{avg_pool2d, interpolate};
use burn::tensor::ops::{InterpolateMode, InterpolateOptions};

pub(crate) const LEAKY_SLOPE: f64 = 0.2;

/// Weight initialization applied to the conv and linear layers of a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightInit {
    /// Burn's default layer initializers, biases included.
    Default,
    /// Kaiming normal on fan-in with ReLU gain, zero biases.
    He,
}

impl WeightInit {
    fn initializer(&self) -> Option<Initializer> {
        match self {
            WeightInit::Default => None,
            WeightInit::He => Some(Initializer::KaimingNormal {
                gain: std::f64::consts::SQRT_2,
                fan_out_only: false,
            }),
        }
    }
}

fn zero_bias<B: Backend>(bias: Option<Param<Tensor<B, 1>>>) -> Option<Param<Tensor<B, 1>>> {
    bias.map(|param| param.map(|tensor| tensor.zeros_like()))
}

/// Conv layer with symmetric explicit padding.
pub fn conv2d<B: Backend>(
    channels: [usize; 2],
    kernel: usize,
    padding: usize,
    bias: bool,
    init: WeightInit,
    device: &B::Device,
) -> Conv2d<B> {
    let mut config = Conv2dConfig::new(channels, [kernel, kernel])
        .with_padding(PaddingConfig2d::Explicit(padding, padding))
        .with_bias(bias);
    if let Some(initializer) = init.initializer() {
        config = config.with_initializer(initializer);
    }
    let mut conv = config.init(device);
    if init == WeightInit::He {
        conv.bias = zero_bias(conv.bias);
    }
    conv
}

pub fn linear<B: Backend>(
    d_input: usize,
    d_output: usize,
    init: WeightInit,
    device: &B::Device,
) -> Linear<B> {
    let mut config = LinearConfig::new(d_input, d_output);
    if let Some(initializer) = init.initializer() {
        config = config.with_initializer(initializer);
    }
    let mut linear = config.init(device);
    if init == WeightInit::He {
        linear.bias = zero_bias(linear.bias);
    }
    linear
}

pub(crate) fn downsample<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    avg_pool2d(x, [2, 2], [2, 2], [0, 0], true, false)
}

pub(crate) fn upsample<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let [_, _, height, width] = x.dims();
    interpolate(
        x,
        [height * 2, width * 2],
        InterpolateOptions::new(InterpolateMode::Nearest),
    )
}

/// Instance normalization whose scale and shift are predicted from a style code.
#[derive(Module, Debug)]
pub struct AdaIn<B: Backend> {
    fc: Linear<B>,
    num_features: usize,
    epsilon: f64,
}

impl<B: Backend> AdaIn<B> {
    pub fn new(
        style_dim: usize,
        num_features: usize,
        init: WeightInit,
        device: &B::Device,
    ) -> Self {
        Self {
            fc: linear(style_dim, num_features * 2, init, device),
            num_features,
            epsilon: 1e-5,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>, style: Tensor<B, 2>) -> Tensor<B, 4> {
        let mean = x.clone().mean_dims(&[2, 3]);
        let var = x.clone().sub(mean.clone()).square().mean_dims(&[2, 3]);
        let norm = (x - mean).div((var + self.epsilon).sqrt());

        let batch = norm.dims()[0];
        let h = self.fc.forward(style);
        let gamma = h
            .clone()
            .slice_dim(1, 0..self.num_features)
            .reshape([batch, self.num_features, 1, 1]);
        let beta = h
            .slice_dim(1, self.num_features..self.num_features * 2)
            .reshape([batch, self.num_features, 1, 1]);
        norm.mul(gamma.add_scalar(1.0)).add(beta)
    }
}

/// Pre-activation residual block with optional instance norm and 2x downsampling.
#[derive(Module, Debug)]
pub struct ResBlk<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    norm1: Option<InstanceNorm<B>>,
    norm2: Option<InstanceNorm<B>>,
    shortcut: Option<Conv2d<B>>,
    downsample: bool,
}

impl<B: Backend> ResBlk<B> {
    pub fn new(
        dim_in: usize,
        dim_out: usize,
        normalize: bool,
        downsample: bool,
        init: WeightInit,
        device: &B::Device,
    ) -> Self {
        let norm = || {
            normalize.then(|| {
                InstanceNormConfig::new(dim_in)
                    .with_affine(true)
                    .init(device)
            })
        };
        Self {
            conv1: conv2d([dim_in, dim_in], 3, 1, true, init, device),
            conv2: conv2d([dim_in, dim_out], 3, 1, true, init, device),
            norm1: norm(),
            norm2: norm(),
            shortcut: (dim_in != dim_out)
                .then(|| conv2d([dim_in, dim_out], 1, 0, false, init, device)),
            downsample,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let shortcut = self.shortcut(x.clone());
        let residual = self.residual(x);
        shortcut.add(residual).div_scalar(std::f64::consts::SQRT_2)
    }

    fn shortcut(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = match &self.shortcut {
            Some(conv) => conv.forward(x),
            None => x,
        };
        if self.downsample { downsample(x) } else { x }
    }

    fn residual(&self, mut x: Tensor<B, 4>) -> Tensor<B, 4> {
        if let Some(norm) = &self.norm1 {
            x = norm.forward(x);
        }
        x = self.conv1.forward(leaky_relu(x, LEAKY_SLOPE));
        if self.downsample {
            x = downsample(x);
        }
        if let Some(norm) = &self.norm2 {
            x = norm.forward(x);
        }
        self.conv2.forward(leaky_relu(x, LEAKY_SLOPE))
    }
}

/// Residual block modulated by a style code, with optional 2x upsampling.
#[derive(Module, Debug)]
pub struct AdainResBlk<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    norm1: AdaIn<B>,
    norm2: AdaIn<B>,
    shortcut: Option<Conv2d<B>>,
    upsample: bool,
}

impl<B: Backend> AdainResBlk<B> {
    pub fn new(
        dim_in: usize,
        dim_out: usize,
        style_dim: usize,
        upsample: bool,
        init: WeightInit,
        device: &B::Device,
    ) -> Self {
        Self {
            conv1: conv2d([dim_in, dim_out], 3, 1, true, init, device),
            conv2: conv2d([dim_out, dim_out], 3, 1, true, init, device),
            norm1: AdaIn::new(style_dim, dim_in, init, device),
            norm2: AdaIn::new(style_dim, dim_out, init, device),
            shortcut: (dim_in != dim_out)
                .then(|| conv2d([dim_in, dim_out], 1, 0, false, init, device)),
            upsample,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>, style: Tensor<B, 2>) -> Tensor<B, 4> {
        let shortcut = self.shortcut(x.clone());
        let residual = self.residual(x, style);
        shortcut.add(residual).div_scalar(std::f64::consts::SQRT_2)
    }

    fn shortcut(&self, mut x: Tensor<B, 4>) -> Tensor<B, 4> {
        if self.upsample {
            x = upsample(x);
        }
        match &self.shortcut {
            Some(conv) => conv.forward(x),
            None => x,
        }
    }

    fn residual(&self, x: Tensor<B, 4>, style: Tensor<B, 2>) -> Tensor<B, 4> {
        let mut x = leaky_relu(self.norm1.forward(x, style.clone()), LEAKY_SLOPE);
        if self.upsample {
            x = upsample(x);
        }
        x = self.conv1.forward(x);
        x = leaky_relu(self.norm2.forward(x, style), LEAKY_SLOPE);
        self.conv2.forward(x)
    }
}

/// Pick, for every sample, the row of `per_domain` that belongs to its domain.
///
/// `per_domain` is `[batch, num_domains, dim]`, `domains` holds one id per sample.
pub fn select_domain<B: Backend>(
    per_domain: Tensor<B, 3>,
    domains: Tensor<B, 1, Int>,
) -> Tensor<B, 2> {
    let [batch, num_domains, dim] = per_domain.dims();
    let mask = domains
        .one_hot::<2>(num_domains)
        .float()
        .reshape([batch, num_domains, 1]);
    per_domain.mul(mask).sum_dim(1).reshape([batch, dim])
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::{Distribution, TensorData};

    type TestBackend = NdArray<f32>;

    #[test]
    fn resblk_downsamples_and_widens() {
        let device = Default::default();
        let block = ResBlk::<TestBackend>::new(4, 8, true, true, WeightInit::He, &device);
        let x = Tensor::random([2, 4, 8, 8], Distribution::Normal(0.0, 1.0), &device);
        assert_eq!(block.forward(x).dims(), [2, 8, 4, 4]);
    }

    #[test]
    fn adain_resblk_upsamples() {
        let device = Default::default();
        let block = AdainResBlk::<TestBackend>::new(8, 4, 6, true, WeightInit::Default, &device);
        let x = Tensor::random([2, 8, 4, 4], Distribution::Normal(0.0, 1.0), &device);
        let s = Tensor::random([2, 6], Distribution::Normal(0.0, 1.0), &device);
        assert_eq!(block.forward(x, s).dims(), [2, 4, 8, 8]);
    }

    #[test]
    fn he_init_zeroes_biases() {
        let device = Default::default();
        let layer = linear::<TestBackend>(3, 5, WeightInit::He, &device);
        let bias = layer.bias.unwrap().val().into_data().to_vec::<f32>().unwrap();
        assert!(bias.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn select_domain_picks_rows() {
        let device = Default::default();
        let per_domain = Tensor::<TestBackend, 3>::from_data(
            TensorData::new(vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0], [2, 2, 2]),
            &device,
        );
        let domains =
            Tensor::<TestBackend, 1, Int>::from_data(TensorData::new(vec![1i64, 0], [2]), &device);
        let picked = select_domain(per_domain, domains)
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        assert_eq!(picked, vec![3.0, 4.0, 5.0, 6.0]);
    }
}
