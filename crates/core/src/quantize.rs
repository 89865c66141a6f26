//! Fake-quantization primitives with straight-through gradients.
//!
//! This module is the mathematical foundation of the network. Every
//! [`QConv2d`](crate::conv::QConv2d) delegates to the two quantizers built by
//! [`quantize_fns`] for the forward-pass quantization and the backward-pass
//! gradient routing.
//!
//! | bits | weights | activations |
//! |------|---------|-------------|
//! | ≥ 32 | identity | identity |
//! | 2..31 | `round(clip(w)·n)/n` | `round(clip(x)·n)/n` |
//! | 1 | `sign(w)·mean(|w|)` per filter | `clip(x, -1, 1)` |
//!
//! with `n = 2^(bits-1) - 1`. At 1 bit activations are clipped, never
//! binarized.

use candle_core::{DType, Error, Result, Tensor};

use qresnet_common::{check_bits, FULL_PRECISION_BITS};

// ── STE ─────────────────────────────────────────────────────────────────────

/// Clipped straight-through estimator.
///
/// `forward = q`, `∂out/∂x = 1` where `|x| <= 1` and `0` elsewhere.
///
/// The trick: `q.detach() + (x - x.detach()) · mask`. In the forward pass the
/// residual is zero so the output is `q`; in the backward pass the residual
/// contributes `mask` as the local gradient.
#[inline]
pub fn ste_clipped(x: &Tensor, q: &Tensor) -> Result<Tensor> {
    let mask = x.detach().abs()?.le(1f64)?.to_dtype(x.dtype())?;
    let residual = ((x - &x.detach())? * mask)?;
    q.detach() + residual
}

/// Number of positive levels for an `bits`-wide symmetric quantizer.
#[inline]
fn positive_levels(bits: u32) -> f64 {
    ((1u64 << (bits - 1)) - 1) as f64
}

/// `round(clip(x, -1, 1) · n) / n`, forward only.
fn uniform_forward(x: &Tensor, bits: u32) -> Result<Tensor> {
    let n = positive_levels(bits);
    x.clamp(-1f64, 1f64)?
        .affine(n, 0.0)?
        .round()?
        .affine(1.0 / n, 0.0)
}

/// `sign(w) · mean(|w|)` with one scale per output filter (axis 0), forward only.
///
/// Zero maps to `+scale`.
fn binarize_forward(w: &Tensor) -> Result<Tensor> {
    let signs = w.ge(0f64)?.to_dtype(w.dtype())?.affine(2.0, -1.0)?;
    let scale = if w.rank() < 2 {
        w.abs()?.mean_all()?
    } else {
        let filters = w.dim(0)?;
        let per_filter = w.flatten_from(1)?.abs()?.mean_keepdim(1)?;
        let mut shape = vec![1usize; w.rank()];
        shape[0] = filters;
        per_filter.reshape(shape)?
    };
    signs.broadcast_mul(&scale)
}

// ── Quantizers ──────────────────────────────────────────────────────────────

/// Weight transform selected by bit-width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightQuantizer {
    Identity,
    /// Per-filter sign binarization.
    Binary,
    Uniform { bits: u32 },
}

impl WeightQuantizer {
    pub fn new(bits: u32) -> Result<Self> {
        check_bits("weight", bits).map_err(Error::wrap)?;
        Ok(match bits {
            b if b >= FULL_PRECISION_BITS => Self::Identity,
            1 => Self::Binary,
            b => Self::Uniform { bits: b },
        })
    }

    /// Quantize `w` with straight-through gradients.
    pub fn apply(&self, w: &Tensor) -> Result<Tensor> {
        match self {
            Self::Identity => Ok(w.clone()),
            Self::Binary => ste_clipped(w, &binarize_forward(w)?),
            Self::Uniform { bits } => ste_clipped(w, &uniform_forward(w, *bits)?),
        }
    }

    pub fn is_identity(&self) -> bool {
        matches!(self, Self::Identity)
    }

    /// Storage bits per weight after quantization.
    pub fn bits(&self) -> u32 {
        match self {
            Self::Identity => FULL_PRECISION_BITS,
            Self::Binary => 1,
            Self::Uniform { bits } => *bits,
        }
    }
}

/// Activation transform selected by bit-width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationQuantizer {
    Identity,
    /// 1-bit relaxation: clip to [-1, 1], no binarization.
    Clip,
    Uniform { bits: u32 },
}

impl ActivationQuantizer {
    pub fn new(bits: u32) -> Result<Self> {
        check_bits("activation", bits).map_err(Error::wrap)?;
        Ok(match bits {
            b if b >= FULL_PRECISION_BITS => Self::Identity,
            1 => Self::Clip,
            b => Self::Uniform { bits: b },
        })
    }

    /// Quantize `x` with straight-through gradients.
    pub fn apply(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Identity => Ok(x.clone()),
            Self::Clip => ste_clipped(x, &x.clamp(-1f64, 1f64)?),
            Self::Uniform { bits } => ste_clipped(x, &uniform_forward(x, *bits)?),
        }
    }

    pub fn is_identity(&self) -> bool {
        matches!(self, Self::Identity)
    }
}

// ── Factory ─────────────────────────────────────────────────────────────────

/// The pair of transforms shared by every quantized layer of one network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantFns {
    pub weight: WeightQuantizer,
    pub activation: ActivationQuantizer,
}

impl QuantFns {
    /// Both transforms are identity.
    pub fn full_precision() -> Self {
        Self {
            weight: WeightQuantizer::Identity,
            activation: ActivationQuantizer::Identity,
        }
    }
}

/// Build the weight and activation quantizers for the given widths.
///
/// Fails with a wrapped [`ConfigError`](qresnet_common::ConfigError) when
/// either width is below 1.
pub fn quantize_fns(weight_bits: u32, activation_bits: u32) -> Result<QuantFns> {
    Ok(QuantFns {
        weight: WeightQuantizer::new(weight_bits)?,
        activation: ActivationQuantizer::new(activation_bits)?,
    })
}

// ── Debug helpers ───────────────────────────────────────────────────────────

/// Number of distinct values in `t` (exact f32 comparison).
pub fn distinct_levels(t: &Tensor) -> Result<usize> {
    let mut flat = t.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    flat.sort_by(|a, b| a.total_cmp(b));
    flat.dedup();
    Ok(flat.len())
}

/// Count `(< 0, >= 0)` entries.
pub fn sign_distribution(t: &Tensor) -> Result<(u64, u64)> {
    let flat = t.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    let (mut n_neg, mut n_pos) = (0u64, 0u64);
    for &v in &flat {
        if v < 0.0 {
            n_neg += 1;
        } else {
            n_pos += 1;
        }
    }
    Ok((n_neg, n_pos))
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};

    fn spread(dev: &Device) -> Tensor {
        // 64 values across [-1.5, 1.5] so clipping and rounding both matter.
        let vals: Vec<f32> = (0..64).map(|i| -1.5 + 3.0 * i as f32 / 63.0).collect();
        Tensor::from_vec(vals, (4, 16), dev).unwrap()
    }

    #[test]
    fn factory_selects_by_bits() {
        let fns = quantize_fns(32, 32).unwrap();
        assert_eq!(fns, QuantFns::full_precision());
        let fns = quantize_fns(1, 1).unwrap();
        assert_eq!(fns.weight, WeightQuantizer::Binary);
        assert_eq!(fns.activation, ActivationQuantizer::Clip);
        let fns = quantize_fns(4, 2).unwrap();
        assert_eq!(fns.weight, WeightQuantizer::Uniform { bits: 4 });
        assert_eq!(fns.activation, ActivationQuantizer::Uniform { bits: 2 });
        assert!(quantize_fns(64, 40).unwrap().weight.is_identity());
    }

    #[test]
    fn factory_rejects_zero_bits() {
        assert!(quantize_fns(0, 4).is_err());
        assert!(quantize_fns(4, 0).is_err());
    }

    #[test]
    fn uniform_levels_bounded() {
        let dev = Device::Cpu;
        let w = spread(&dev);
        for bits in [2u32, 4, 8] {
            let q = WeightQuantizer::new(bits).unwrap().apply(&w).unwrap();
            let levels = distinct_levels(&q).unwrap();
            assert!(levels <= 1 << bits, "bits={bits} levels={levels}");
            assert!(levels > 1);
        }
    }

    #[test]
    fn two_bit_values() {
        let dev = Device::Cpu;
        let w = Tensor::new(&[-1.7f32, -0.6, -0.2, 0.0, 0.4, 0.9, 3.0], &dev).unwrap();
        let q = WeightQuantizer::new(2).unwrap().apply(&w).unwrap();
        let vals: Vec<f32> = q.to_vec1().unwrap();
        // n = 1: round(clip(w)) → {-1, 0, 1}
        assert_eq!(vals, vec![-1.0, -1.0, 0.0, 0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn full_precision_is_identity() {
        let dev = Device::Cpu;
        let w = spread(&dev);
        let q = WeightQuantizer::new(32).unwrap().apply(&w).unwrap();
        let a: Vec<f32> = w.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = q.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn binary_weights_per_filter() {
        let dev = Device::Cpu;
        // Two filters of shape (1, 2, 2).
        let w = Tensor::from_vec(
            vec![0.5f32, -0.5, 0.0, 1.0, -0.1, -0.3, 0.2, 0.2],
            (2, 1, 2, 2),
            &dev,
        )
        .unwrap();
        let q = WeightQuantizer::Binary.apply(&w).unwrap();
        let vals: Vec<f32> = q.flatten_all().unwrap().to_vec1().unwrap();
        // filter 0: s = (0.5+0.5+0+1)/4 = 0.5; zero maps to +s
        // filter 1: s = (0.1+0.3+0.2+0.2)/4 = 0.2
        let expected = [0.5f32, -0.5, 0.5, 0.5, -0.2, -0.2, 0.2, 0.2];
        for (v, e) in vals.iter().zip(expected.iter()) {
            assert!((v - e).abs() < 1e-6, "{v} vs {e}");
        }
        let (neg, pos) = sign_distribution(&q).unwrap();
        assert_eq!((neg, pos), (3, 5));
    }

    #[test]
    fn one_bit_activation_clips() {
        let dev = Device::Cpu;
        let x = Tensor::new(&[-3.0f32, -0.25, 0.0, 0.7, 2.0], &dev).unwrap();
        let q = ActivationQuantizer::new(1).unwrap().apply(&x).unwrap();
        let vals: Vec<f32> = q.to_vec1().unwrap();
        assert_eq!(vals, vec![-1.0, -0.25, 0.0, 0.7, 1.0]);
    }

    #[test]
    fn ste_gradient_is_clipped_identity() {
        let dev = Device::Cpu;
        let x = Var::new(&[-2.0f32, -1.0, -0.3, 0.0, 0.6, 1.0, 1.5], &dev).unwrap();
        let expected = vec![0.0f32, 1.0, 1.0, 1.0, 1.0, 1.0, 0.0];

        for quant in [
            WeightQuantizer::Binary,
            WeightQuantizer::Uniform { bits: 2 },
            WeightQuantizer::Uniform { bits: 8 },
        ] {
            let y = quant.apply(x.as_tensor()).unwrap();
            let grads = y.sum_all().unwrap().backward().unwrap();
            let g: Vec<f32> = grads.get(x.as_tensor()).unwrap().to_vec1().unwrap();
            assert_eq!(g, expected, "{quant:?}");
        }

        for quant in [ActivationQuantizer::Clip, ActivationQuantizer::Uniform { bits: 4 }] {
            let y = quant.apply(x.as_tensor()).unwrap();
            let grads = y.sum_all().unwrap().backward().unwrap();
            let g: Vec<f32> = grads.get(x.as_tensor()).unwrap().to_vec1().unwrap();
            assert_eq!(g, expected, "{quant:?}");
        }
    }

    #[test]
    fn identity_gradient_everywhere() {
        let dev = Device::Cpu;
        let x = Var::new(&[-2.0f32, 0.5, 3.0], &dev).unwrap();
        let y = WeightQuantizer::Identity.apply(x.as_tensor()).unwrap();
        let grads = y.sum_all().unwrap().backward().unwrap();
        let g: Vec<f32> = grads.get(x.as_tensor()).unwrap().to_vec1().unwrap();
        assert_eq!(g, vec![1.0, 1.0, 1.0]);
    }
}
