//! Live networks and their exponential-moving-average shadows.

use burn::module::{AutodiffModule, ModuleMapper, ModuleVisitor, Param};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

use crate::model::Networks;

/// Decay of the EMA shadow weights.
pub const EMA_BETA: f64 = 0.999;

/// Networks being optimized together with their EMA shadows of identical structure.
///
/// The shadows live on the inner backend and never track gradients.
#[derive(Debug, Clone)]
pub struct TrainedComponents<B: AutodiffBackend> {
    pub live: Networks<B>,
    pub ema: Networks<B::InnerBackend>,
}

impl<B: AutodiffBackend> TrainedComponents<B> {
    pub fn new(live: Networks<B>, ema: Networks<B::InnerBackend>) -> Self {
        Self { live, ema }
    }

    /// Move both sets of networks to `device`.
    pub fn to_device(self, device: &B::Device) -> Self {
        Self {
            live: self.live.fork(device),
            ema: self.ema.to_device(device),
        }
    }

    /// Pull the generator and style-encoder shadows toward the live weights.
    pub fn update_ema(&mut self, beta: f64) {
        let ema = self.ema.clone();
        self.ema = Networks {
            generator: moving_average(&self.live.generator.valid(), ema.generator, beta),
            style_encoder: moving_average(
                &self.live.style_encoder.valid(),
                ema.style_encoder,
                beta,
            ),
            ..ema
        };
    }
}

/// Returns `ema` with every parameter replaced by `beta * ema + (1 - beta) * live`.
///
/// `live` and `ema` must share one architecture; parameters are paired in visiting order.
pub fn moving_average<B: Backend, M: Module<B>>(live: &M, ema: M, beta: f64) -> M {
    let mut collector = ParamCollector::<B>::default();
    live.visit(&mut collector);
    let expected = collector.params.len();

    let mut mapper = EmaMapper {
        live: collector.params.into_iter(),
        beta,
        visited: 0,
    };
    let ema = ema.map(&mut mapper);
    debug_assert_eq!(mapper.visited, expected, "live and EMA networks differ in structure");
    ema
}

#[derive(Default)]
struct ParamCollector<B: Backend> {
    params: Vec<Tensor<B, 1>>,
}

impl<B: Backend> ModuleVisitor<B> for ParamCollector<B> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        let value = param.val();
        let count = value.shape().num_elements();
        self.params.push(value.reshape([count]));
    }
}

struct EmaMapper<B: Backend> {
    live: std::vec::IntoIter<Tensor<B, 1>>,
    beta: f64,
    visited: usize,
}

impl<B: Backend> ModuleMapper<B> for EmaMapper<B> {
    fn map_float<const D: usize>(&mut self, param: Param<Tensor<B, D>>) -> Param<Tensor<B, D>> {
        let Some(live) = self.live.next() else {
            return param;
        };
        self.visited += 1;
        let beta = self.beta;
        param.map(|ema| {
            let live = live.reshape(ema.shape());
            ema.mul_scalar(beta).add(live.mul_scalar(1.0 - beta))
        })
    }
}
