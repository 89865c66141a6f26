//! Quantization-aware 2-D convolution.
//!
//! Each [`QConv2d`] stores full-precision (f32) latent weights. Forward uses
//! the quantized view of the weights (and optionally of the input); backward
//! reaches the latent weights through the straight-through estimator.

use candle_core::{Result, Tensor};
use candle_nn::{init, Init, VarBuilder};

use crate::layer::{l2_penalty, Layer};
use crate::quantize::{ActivationQuantizer, QuantFns, WeightQuantizer};

/// Same default as `candle_nn::conv2d`: fan-in scaled normal.
const CONV_INIT: Init = init::DEFAULT_KAIMING_NORMAL;

/// Per-layer convolution settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QConv2dConfig {
    pub filters: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub use_bias: bool,
    /// Quantize the weight before use.
    pub quantize_weight: bool,
    /// Quantize the input before convolving.
    pub quantize_activation: bool,
}

impl QConv2dConfig {
    /// Bias-free convolution with both quantization switches set to `quantize`.
    pub fn new(filters: usize, kernel_size: usize, stride: usize, quantize: bool) -> Self {
        Self {
            filters,
            kernel_size,
            stride,
            use_bias: false,
            quantize_weight: quantize,
            quantize_activation: quantize,
        }
    }

    /// "Same" padding for odd kernels.
    pub fn padding(&self) -> usize {
        self.kernel_size / 2
    }
}

/// Convolution whose weight and input may be fake-quantized.
///
/// Forward path:
/// 1. Quantize the input (if enabled for this layer).
/// 2. Quantize the weight (if enabled for this layer).
/// 3. Convolve with "same" padding and the configured stride.
/// 4. Add the bias (if any).
pub struct QConv2d {
    weight: Tensor,
    bias: Option<Tensor>,
    config: QConv2dConfig,
    weight_quant: Option<WeightQuantizer>,
    act_quant: Option<ActivationQuantizer>,
    weight_decay: f64,
}

impl QConv2d {
    /// `vb` should be scoped to the layer prefix (e.g. `vb.pp("conv2a")`).
    pub fn new(
        in_channels: usize,
        config: QConv2dConfig,
        quant: QuantFns,
        weight_decay: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        let k = config.kernel_size;
        let weight = vb.get_with_hints((config.filters, in_channels, k, k), "weight", CONV_INIT)?;
        let bias = if config.use_bias {
            Some(vb.get_with_hints(config.filters, "bias", Init::Const(0.))?)
        } else {
            None
        };

        // Identity quantizers are dropped so full precision skips the STE graph.
        let weight_quant = Some(quant.weight).filter(|q| config.quantize_weight && !q.is_identity());
        let act_quant =
            Some(quant.activation).filter(|q| config.quantize_activation && !q.is_identity());

        Ok(Self {
            weight,
            bias,
            config,
            weight_quant,
            act_quant,
            weight_decay,
        })
    }

    /// The weight as the convolution sees it.
    pub fn quantized_weight(&self) -> Result<Tensor> {
        match &self.weight_quant {
            Some(q) => q.apply(&self.weight),
            None => Ok(self.weight.clone()),
        }
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn config(&self) -> &QConv2dConfig {
        &self.config
    }

    /// Whether the weight is quantized below full precision.
    pub fn is_weight_quantized(&self) -> bool {
        self.weight_quant.is_some()
    }

    pub fn weight_quantizer(&self) -> Option<WeightQuantizer> {
        self.weight_quant
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = match &self.act_quant {
            Some(q) => q.apply(x)?,
            None => x.clone(),
        };
        let w = self.quantized_weight()?;
        let out = x.conv2d(&w, self.config.padding(), self.config.stride, 1, 1)?;
        match &self.bias {
            Some(b) => out.broadcast_add(&b.reshape((1, self.config.filters, 1, 1))?),
            None => Ok(out),
        }
    }
}

impl Layer for QConv2d {
    fn forward_t(&self, xs: &Tensor, _train: bool) -> Result<Tensor> {
        self.forward(xs)
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = vec![self.weight.clone()];
        params.extend(self.bias.iter().cloned());
        params
    }

    /// `weight_decay · Σ w²` over the latent kernel.
    fn regularization_loss(&self) -> Result<Tensor> {
        l2_penalty(&self.weight, self.weight_decay)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantize::quantize_fns;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn build(config: QConv2dConfig, quant: QuantFns, varmap: &VarMap) -> QConv2d {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        QConv2d::new(3, config, quant, 5e-4, vb.pp("conv")).unwrap()
    }

    #[test]
    fn same_padding_shapes() {
        let varmap = VarMap::new();
        let x = Tensor::randn(0f32, 1.0, (2, 3, 32, 32), &Device::Cpu).unwrap();

        let conv = build(QConv2dConfig::new(16, 3, 1, false), QuantFns::full_precision(), &varmap);
        assert_eq!(conv.forward(&x).unwrap().dims(), &[2, 16, 32, 32]);

        let varmap = VarMap::new();
        let conv = build(QConv2dConfig::new(8, 3, 2, false), QuantFns::full_precision(), &varmap);
        assert_eq!(conv.forward(&x).unwrap().dims(), &[2, 8, 16, 16]);

        let varmap = VarMap::new();
        let conv = build(QConv2dConfig::new(8, 1, 2, false), QuantFns::full_precision(), &varmap);
        assert_eq!(conv.forward(&x).unwrap().dims(), &[2, 8, 16, 16]);
    }

    #[test]
    fn weight_switch_controls_quantization() {
        let fns = quantize_fns(2, 32).unwrap();

        let varmap = VarMap::new();
        let mut cfg = QConv2dConfig::new(4, 3, 1, true);
        let conv = build(cfg, fns, &varmap);
        assert!(conv.is_weight_quantized());
        let levels = crate::quantize::distinct_levels(&conv.quantized_weight().unwrap()).unwrap();
        assert!(levels <= 3);

        // Stem-style override: same quantizers, weight switch off.
        cfg.quantize_weight = false;
        let conv = build(cfg, fns, &varmap);
        assert!(!conv.is_weight_quantized());
        let a: Vec<f32> = conv.weight().flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = conv.quantized_weight().unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn activation_quantization_applied_to_input() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let cfg = QConv2dConfig {
            quantize_weight: false,
            ..QConv2dConfig::new(2, 1, 1, true)
        };
        let clip = build(cfg, quantize_fns(32, 1).unwrap(), &varmap);
        let plain = build(
            QConv2dConfig::new(2, 1, 1, false),
            QuantFns::full_precision(),
            &varmap,
        );

        // Inputs already inside [-1, 1] are untouched by 1-bit clipping.
        let inside = Tensor::randn(0f32, 0.2, (1, 3, 4, 4), &dev).unwrap().clamp(-1f32, 1f32).unwrap();
        let a = clip.forward(&inside).unwrap();
        let b = plain.forward(&inside).unwrap();
        let diff = (a - b).unwrap().abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap();
        assert_eq!(diff, 0.0);

        // Large inputs are clipped before the convolution.
        let big = Tensor::ones((1, 3, 4, 4), DType::F32, &dev).unwrap().affine(5.0, 0.0).unwrap();
        let ones = Tensor::ones((1, 3, 4, 4), DType::F32, &dev).unwrap();
        let a = clip.forward(&big).unwrap();
        let b = plain.forward(&ones).unwrap();
        let diff = (a - b).unwrap().abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(diff < 1e-6);
    }

    #[test]
    fn l2_penalty_matches_weights() {
        let varmap = VarMap::new();
        let conv = build(QConv2dConfig::new(4, 3, 1, false), QuantFns::full_precision(), &varmap);
        let expected = conv.weight().sqr().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap() * 5e-4;
        let got = conv.regularization_loss().unwrap().to_scalar::<f32>().unwrap();
        assert!((expected - got).abs() < 1e-6);
        assert_eq!(conv.parameters().len(), 1);
    }

    #[test]
    fn optional_bias_is_added() {
        let varmap = VarMap::new();
        let cfg = QConv2dConfig {
            use_bias: true,
            ..QConv2dConfig::new(4, 3, 1, false)
        };
        let conv = build(cfg, QuantFns::full_precision(), &varmap);
        assert_eq!(conv.parameters().len(), 2);
        let x = Tensor::zeros((1, 3, 5, 5), DType::F32, &Device::Cpu).unwrap();
        // Zero bias init: zero input gives zero output.
        let y = conv.forward(&x).unwrap();
        assert_eq!(y.dims(), &[1, 4, 5, 5]);
        assert_eq!(y.abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap(), 0.0);
    }
}
