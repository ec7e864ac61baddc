//! Loss terms shared by the discriminator and generator objectives.

use std::fmt;

use burn::nn::loss::BinaryCrossEntropyLossConfig;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

use crate::error::{Result, TrainError};

/// Step size of the central difference used for the R1 parameter gradient.
const R1_PROBE_STEP: f64 = 1e-2;

/// Named scalar values of the terms of a composite loss, in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LossTerms {
    terms: Vec<(&'static str, f64)>,
}

impl LossTerms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the current value of a scalar loss tensor.
    pub fn push<B: Backend>(&mut self, name: &'static str, value: &Tensor<B, 1>) {
        self.terms.push((name, value.clone().into_scalar().elem::<f64>()));
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.terms
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| *value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, f64)> + '_ {
        self.terms.iter().copied()
    }

    /// Formats every term as `{prefix}{name}: [value]`.
    pub fn with_prefix<'a>(&'a self, prefix: &'a str) -> PrefixedTerms<'a> {
        PrefixedTerms {
            terms: self,
            prefix,
        }
    }
}

pub struct PrefixedTerms<'a> {
    terms: &'a LossTerms,
    prefix: &'a str,
}

impl fmt::Display for PrefixedTerms<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, (name, value)) in self.terms.iter().enumerate() {
            if idx > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}{name}: [{value:.4}]", self.prefix)?;
        }
        Ok(())
    }
}

/// Binary cross-entropy of `logits` against an all-real (1) or all-fake (0) target.
pub fn adv_loss<B: Backend>(logits: Tensor<B, 2>, target: i64) -> Result<Tensor<B, 1>> {
    let device = logits.device();
    let dims = logits.dims();
    let targets = match target {
        1 => Tensor::<B, 2, Int>::ones(dims, &device),
        0 => Tensor::<B, 2, Int>::zeros(dims, &device),
        other => return Err(TrainError::InvalidTarget(other)),
    };
    let loss = BinaryCrossEntropyLossConfig::new()
        .with_logits(true)
        .init(&device);
    Ok(loss.forward(logits, targets))
}

/// R1 gradient penalty `0.5 * mean_i ||d(sum D)/d x_i||^2` on real samples.
///
/// `critic` is the discriminator forward pass. The returned value is exact. Its gradient with
/// respect to the critic parameters is carried by a central difference of the critic along each
/// sample's normalized input gradient, scaled by the gradient norm; that term is added and
/// subtracted so it contributes nothing to the value.
pub fn r1_reg<B, F>(x_real: Tensor<B, 4>, critic: F) -> Result<Tensor<B, 1>>
where
    B: AutodiffBackend,
    F: Fn(Tensor<B, 4>) -> Tensor<B, 2>,
{
    let x_in = x_real.detach().require_grad();
    let expected = x_in.dims();
    let grads = critic(x_in.clone()).sum().backward();
    let grad = x_in.grad(&grads).ok_or_else(|| TrainError::ShapeMismatch {
        expected: expected.to_vec(),
        got: Vec::new(),
    })?;
    if grad.dims() != expected {
        return Err(TrainError::ShapeMismatch {
            expected: expected.to_vec(),
            got: grad.dims().to_vec(),
        });
    }

    let [batch, channels, height, width] = expected;
    let sq_norms = grad
        .clone()
        .square()
        .reshape([batch, channels * height * width])
        .sum_dim(1);
    let penalty = sq_norms.clone().mean().mul_scalar(0.5);

    let norms = sq_norms.sqrt().clamp_min(1e-12);
    let probe = grad
        .div(norms.clone().reshape([batch, 1, 1, 1]))
        .mul_scalar(R1_PROBE_STEP);
    let x_base = x_in.detach().inner();
    let x_plus = Tensor::<B, 4>::from_inner(x_base.clone() + probe.clone());
    let x_minus = Tensor::<B, 4>::from_inner(x_base - probe);
    let slope = (critic(x_plus) - critic(x_minus)).sum_dim(1);
    let surrogate = slope
        .mul(Tensor::from_inner(norms))
        .mean()
        .div_scalar(2.0 * R1_PROBE_STEP);

    Ok(surrogate.clone() - surrogate.detach() + Tensor::from_inner(penalty))
}

/// Gram matrix of feature maps `[a, b, c, d]` viewed as `[a * b, c * d]`, divided by
/// `a * b * c * d`.
pub fn gram_matrix<B: Backend>(features: Tensor<B, 4>) -> Tensor<B, 2> {
    let [a, b, c, d] = features.dims();
    let flat = features.reshape([a * b, c * d]);
    flat.clone()
        .matmul(flat.transpose())
        .div_scalar((a * b * c * d) as f64)
}

/// L1 distance between a reconstruction and its source.
pub fn cycle_loss<B: Backend>(x_rec: Tensor<B, 4>, x_real: Tensor<B, 4>) -> Tensor<B, 1> {
    x_rec.sub(x_real).abs().mean()
}

/// L1 distance between feature activations of real and generated images.
pub fn perceptual_loss<B: Backend>(
    features_real: Tensor<B, 4>,
    features_fake: Tensor<B, 4>,
) -> Tensor<B, 1> {
    features_fake.sub(features_real).abs().mean()
}

/// L1 distance between the Gram matrices of real and generated feature activations.
pub fn style_loss<B: Backend>(
    features_real: Tensor<B, 4>,
    features_fake: Tensor<B, 4>,
) -> Tensor<B, 1> {
    gram_matrix(features_fake)
        .sub(gram_matrix(features_real))
        .abs()
        .mean()
}

/// Mean squared style-code magnitude.
pub fn style_reg_loss<B: Backend>(style: Tensor<B, 2>) -> Tensor<B, 1> {
    style.square().mean()
}
