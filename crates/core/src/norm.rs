//! Batch normalisation after every convolution.
//!
//! Follows each [`QConv2d`](crate::conv::QConv2d) and absorbs any additive
//! bias, which is why the convolutions are built without one.

use candle_core::{Result, Tensor};
use candle_nn::{batch_norm, BatchNorm, BatchNormConfig, ModuleT, VarBuilder};

use qresnet_common::ResNetConfig;

/// Channel-wise batch norm over `(N, C, H, W)`.
pub struct Norm {
    inner: BatchNorm,
}

impl Norm {
    /// `vb` should be scoped to the layer prefix (e.g. `vb.pp("bn2a")`).
    pub fn new(num_features: usize, config: &ResNetConfig, vb: VarBuilder) -> Result<Self> {
        let bn_config = BatchNormConfig {
            eps: config.bn_eps,
            remove_mean: true,
            affine: true,
            momentum: config.bn_momentum,
        };
        Ok(Self {
            inner: batch_norm(num_features, bn_config, vb)?,
        })
    }

    /// Batch statistics (and a running-stat update) when `train`, running
    /// statistics otherwise.
    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        self.inner.forward_t(x, train)
    }

    /// Scale and shift.
    pub fn parameters(&self) -> Vec<Tensor> {
        match self.inner.weight_and_bias() {
            Some((w, b)) => vec![w.clone(), b.clone()],
            None => Vec::new(),
        }
    }
}
