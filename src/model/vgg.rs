use std::path::PathBuf;

use burn::module::Ignored;
use burn::nn::PaddingConfig2d;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use burn::tensor::activation::relu;
use burn::tensor::module::max_pool2d;
use tracing::{info, warn};


/// Layer widths of the VGG19 `features` stack; 0 marks a 2x2 max pool.
const VGG19_PLAN: [usize; 21] = [
    64, 64, 0, 128, 128, 0, 256, 256, 256, 256, 0, 512, 512, 512, 512, 0, 512, 512, 512, 512, 0,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VggOp {
    Conv,
    Relu,
    MaxPool,
}

/// Frozen VGG19 prefix used for perceptual and style losses.
#[derive(Config, Debug)]
pub struct FeatureExtractorConfig {
    /// Number of `features` layers kept, counting convolutions, activations and pools.
    #[config(default = 29)]
    pub num_layers: usize,
    /// Pretrained weights stored as a named MessagePack record.
    pub weights: Option<PathBuf>,
}

#[derive(Module, Debug)]
pub struct FeatureExtractor<B: Backend> {
    convs: Vec<Conv2d<B>>,
    plan: Ignored<Vec<VggOp>>,
}

impl FeatureExtractorConfig {
    fn plan(&self) -> (Vec<VggOp>, Vec<[usize; 2]>) {
        let mut ops = Vec::new();
        let mut convs = Vec::new();
        let mut channels = 3;
        for width in VGG19_PLAN {
            if width == 0 {
                ops.push(VggOp::MaxPool);
            } else {
                ops.push(VggOp::Conv);
                ops.push(VggOp::Relu);
                convs.push([channels, width]);
                channels = width;
            }
        }
        ops.truncate(self.num_layers);
        let kept = ops.iter().filter(|op| **op == VggOp::Conv).count();
        convs.truncate(kept);
        (ops, convs)
    }

    /// Channels of the extracted activations.
    pub fn out_channels(&self) -> usize {
        self.plan().1.last().map(|[_, out]| *out).unwrap_or(3)
    }

    /// Build the extractor, load pretrained weights if configured, and freeze it.
    pub fn init<B: Backend>(&self, device: &B::Device) -> crate::Result<FeatureExtractor<B>> {
        let (ops, shapes) = self.plan();
        let convs = shapes
            .into_iter()
            .map(|channels| {
                Conv2dConfig::new(channels, [3, 3])
                    .with_padding(PaddingConfig2d::Explicit(1, 1))
                    .init(device)
            })
            .collect();
        let mut extractor = FeatureExtractor {
            convs,
            plan: Ignored(ops),
        };

        match &self.weights {
            Some(path) => {
                info!("Loading feature extractor weights from {}", path.display());
                let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
                extractor = extractor.load_file(path.clone(), &recorder, device)?;
            }
            None => warn!("no pretrained feature extractor weights configured, using random init"),
        }

        Ok(extractor.no_grad())
    }
}

impl<B: Backend> FeatureExtractor<B> {
    /// Activations of images normalized to `[0, 1]`.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut convs = self.convs.iter();
        let mut x = images;
        for op in self.plan.iter() {
            x = match op {
                VggOp::Conv => match convs.next() {
                    Some(conv) => conv.forward(x),
                    None => x,
                },
                VggOp::Relu => relu(x),
                VggOp::MaxPool => max_pool2d(x, [2, 2], [2, 2], [0, 0], [1, 1], false),
            };
        }
        x
    }
}

/// Map generator output from `[-1, 1]` to the `[0, 1]` range the extractor expects.
pub fn to_unit_range<B: Backend>(images: Tensor<B, 4>) -> Tensor<B, 4> {
    images.add_scalar(1.0).div_scalar(2.0)
}
