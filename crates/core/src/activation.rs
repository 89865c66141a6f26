//! Nonlinearity selection.
//!
//! | activation bits | nonlinearity |
//! |-----------------|--------------|
//! | 1 | `clip(x, -1, 1)` |
//! | otherwise | `max(0, x)` |
//!
//! The width only counts while activation quantization is switched on.

use candle_core::{Result, Tensor};

use qresnet_common::{QuantConfig, FULL_PRECISION_BITS};

/// Pointwise nonlinearity used after the stem and inside every residual unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Nonlinearity {
    Relu,
    /// `clip(x, -1, 1)`.
    HardTanh,
}

impl Nonlinearity {
    /// Pick from the effective activation bit-width.
    pub fn for_activation_bits(bits: u32) -> Self {
        if bits == 1 {
            Self::HardTanh
        } else {
            Self::Relu
        }
    }

    /// Pick from a network's quantization settings: the clip applies only
    /// when inputs are actually quantized to 1 bit.
    pub fn for_quant(quant: &QuantConfig) -> Self {
        if quant.activations_enabled() {
            Self::for_activation_bits(quant.effective_activation_bits())
        } else {
            Self::for_activation_bits(FULL_PRECISION_BITS)
        }
    }

    #[inline]
    pub fn apply(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Relu => x.relu(),
            Self::HardTanh => x.clamp(-1f64, 1f64),
        }
    }
}
