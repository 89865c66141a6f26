//! Residual unit and residual block.
//!
//! ```text
//! shortcut = first ? bn_sc(conv_sc_1x1(x, stride)) : x
//! h = act(bn2a(conv2a_3x3(x, stride)))
//! h = bn2b(conv2b_3x3(h))
//! out = act(h + shortcut)
//! ```

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

use qresnet_common::ResNetConfig;

use crate::activation::Nonlinearity;
use crate::conv::{QConv2d, QConv2dConfig};
use crate::layer::{sum_penalties, Layer};
use crate::norm::Norm;
use crate::quantize::QuantFns;

// ── ResidualUnit ────────────────────────────────────────────────────────────

/// Two quantized 3×3 convolutions with a shortcut.
///
/// The projection shortcut exists exactly on the first unit of a block; every
/// other unit must preserve its input shape, which is asserted at
/// construction.
pub struct ResidualUnit {
    conv2a: QConv2d,
    bn2a: Norm,
    conv2b: QConv2d,
    bn2b: Norm,
    shortcut: Option<(QConv2d, Norm)>,
    nonlinearity: Nonlinearity,
}

impl ResidualUnit {
    /// Build one unit.
    ///
    /// # Panics
    ///
    /// If `first` is false and the unit would change shape
    /// (`in_channels != output_depth` or `stride != 1`).
    pub fn new(
        in_channels: usize,
        output_depth: usize,
        stride: usize,
        first: bool,
        config: &ResNetConfig,
        quant: QuantFns,
        vb: VarBuilder,
    ) -> Result<Self> {
        assert!(
            first || (in_channels == output_depth && stride == 1),
            "identity shortcut needs a shape-preserving unit: in_channels={in_channels}, \
             output_depth={output_depth}, stride={stride}",
        );

        let q = &config.quantization;
        let conv_cfg = |kernel_size, stride| QConv2dConfig {
            quantize_weight: q.weights_enabled(),
            quantize_activation: q.activations_enabled(),
            ..QConv2dConfig::new(output_depth, kernel_size, stride, false)
        };
        let wd = config.weight_decay;

        let conv2a = QConv2d::new(in_channels, conv_cfg(3, stride), quant, wd, vb.pp("conv2a"))?;
        let bn2a = Norm::new(output_depth, config, vb.pp("bn2a"))?;
        let conv2b = QConv2d::new(output_depth, conv_cfg(3, 1), quant, wd, vb.pp("conv2b"))?;
        let bn2b = Norm::new(output_depth, config, vb.pp("bn2b"))?;

        let shortcut = if first {
            let conv = QConv2d::new(
                in_channels,
                conv_cfg(1, stride),
                quant,
                wd,
                vb.pp("conv_shortcut"),
            )?;
            let bn = Norm::new(output_depth, config, vb.pp("bn_shortcut"))?;
            Some((conv, bn))
        } else {
            None
        };

        Ok(Self {
            conv2a,
            bn2a,
            conv2b,
            bn2b,
            shortcut,
            nonlinearity: Nonlinearity::for_quant(q),
        })
    }

    pub fn has_projection(&self) -> bool {
        self.shortcut.is_some()
    }

    /// All convolutions of this unit with their layer names, main path first.
    pub fn convs(&self) -> Vec<(&'static str, &QConv2d)> {
        let mut out = vec![("conv2a", &self.conv2a), ("conv2b", &self.conv2b)];
        if let Some((conv, _)) = &self.shortcut {
            out.push(("conv_shortcut", conv));
        }
        out
    }
}

impl Layer for ResidualUnit {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let shortcut = match &self.shortcut {
            Some((conv, bn)) => bn.forward_t(&conv.forward(xs)?, train)?,
            None => xs.clone(),
        };

        let x = self.bn2a.forward_t(&self.conv2a.forward(xs)?, train)?;
        let x = self.nonlinearity.apply(&x)?;

        let x = self.bn2b.forward_t(&self.conv2b.forward(&x)?, train)?;

        let x = (x + shortcut)?;
        self.nonlinearity.apply(&x)
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = self.conv2a.parameters();
        params.extend(self.bn2a.parameters());
        params.extend(self.conv2b.parameters());
        params.extend(self.bn2b.parameters());
        if let Some((conv, bn)) = &self.shortcut {
            params.extend(conv.parameters());
            params.extend(bn.parameters());
        }
        params
    }

    fn regularization_loss(&self) -> Result<Tensor> {
        sum_penalties(self.convs().into_iter().map(|(_, c)| c.regularization_loss()))
    }
}

// ── ResidualBlock ───────────────────────────────────────────────────────────

/// A fixed run of residual units sharing output depth and quantization.
///
/// Unit 0 carries the stride and the projection shortcut; the rest keep shape.
pub struct ResidualBlock {
    units: Box<[ResidualUnit]>,
    output_depth: usize,
}

impl ResidualBlock {
    /// # Panics
    ///
    /// If `num_units == 0`.
    pub fn new(
        num_units: usize,
        in_channels: usize,
        output_depth: usize,
        stride: usize,
        config: &ResNetConfig,
        quant: QuantFns,
        vb: VarBuilder,
    ) -> Result<Self> {
        assert!(num_units >= 1, "a residual block needs at least one unit");

        let mut units = Vec::with_capacity(num_units);
        units.push(ResidualUnit::new(
            in_channels,
            output_depth,
            stride,
            true,
            config,
            quant,
            vb.pp("unit0"),
        )?);
        for i in 1..num_units {
            units.push(ResidualUnit::new(
                output_depth,
                output_depth,
                1,
                false,
                config,
                quant,
                vb.pp(format!("unit{i}")),
            )?);
        }

        Ok(Self {
            units: units.into_boxed_slice(),
            output_depth,
        })
    }

    pub fn units(&self) -> &[ResidualUnit] {
        &self.units
    }

    pub fn output_depth(&self) -> usize {
        self.output_depth
    }
}

impl Layer for ResidualBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = xs.clone();
        for unit in self.units.iter() {
            x = unit.forward_t(&x, train)?;
        }
        Ok(x)
    }

    fn parameters(&self) -> Vec<Tensor> {
        self.units.iter().flat_map(|u| u.parameters()).collect()
    }

    fn regularization_loss(&self) -> Result<Tensor> {
        sum_penalties(self.units.iter().map(|u| u.regularization_loss()))
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantize::quantize_fns;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use qresnet_common::QuantConfig;

    fn config(quant: QuantConfig) -> ResNetConfig {
        ResNetConfig {
            quantization: quant,
            ..Default::default()
        }
    }

    fn fns(config: &ResNetConfig) -> QuantFns {
        let q = &config.quantization;
        quantize_fns(q.effective_weight_bits(), q.effective_activation_bits()).unwrap()
    }

    #[test]
    fn first_unit_downsamples_and_projects() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let cfg = config(QuantConfig::with_bits(4, 4));
        let unit = ResidualUnit::new(16, 32, 2, true, &cfg, fns(&cfg), vb).unwrap();
        assert!(unit.has_projection());
        assert_eq!(unit.convs().len(), 3);

        let x = Tensor::randn(0f32, 1.0, (2, 16, 8, 8), &Device::Cpu).unwrap();
        let y = unit.forward_t(&x, false).unwrap();
        assert_eq!(y.dims(), &[2, 32, 4, 4]);
        // ReLU output.
        assert!(y.min_all().unwrap().to_scalar::<f32>().unwrap() >= 0.0);
    }

    #[test]
    fn later_units_preserve_shape() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let cfg = config(QuantConfig::disabled());
        let unit = ResidualUnit::new(8, 8, 1, false, &cfg, fns(&cfg), vb).unwrap();
        assert!(!unit.has_projection());

        let x = Tensor::randn(0f32, 1.0, (1, 8, 6, 6), &Device::Cpu).unwrap();
        assert_eq!(unit.forward_t(&x, true).unwrap().dims(), x.dims());
    }

    #[test]
    fn one_bit_activations_clip_output() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let cfg = config(QuantConfig::with_bits(2, 1));
        let unit = ResidualUnit::new(4, 4, 1, true, &cfg, fns(&cfg), vb).unwrap();

        let x = Tensor::randn(0f32, 3.0, (2, 4, 5, 5), &Device::Cpu).unwrap();
        let y = unit.forward_t(&x, true).unwrap();
        let max = y.abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(max <= 1.0);
        // Clipping keeps negative values, unlike ReLU.
        assert!(y.min_all().unwrap().to_scalar::<f32>().unwrap() < 0.0);
    }

    #[test]
    fn relu_kept_when_activation_switch_off() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let cfg = config(QuantConfig {
            quantize_activations: false,
            ..QuantConfig::with_bits(2, 1)
        });
        let unit = ResidualUnit::new(4, 4, 1, true, &cfg, fns(&cfg), vb).unwrap();

        let x = Tensor::randn(0f32, 3.0, (2, 4, 5, 5), &Device::Cpu).unwrap();
        let y = unit.forward_t(&x, true).unwrap();
        assert!(y.min_all().unwrap().to_scalar::<f32>().unwrap() >= 0.0);
        assert!(y.max_all().unwrap().to_scalar::<f32>().unwrap() > 1.0);
    }

    #[test]
    #[should_panic(expected = "identity shortcut")]
    fn mismatched_identity_unit_panics() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let cfg = config(QuantConfig::disabled());
        let _ = ResidualUnit::new(16, 32, 2, false, &cfg, fns(&cfg), vb);
    }

    #[test]
    fn block_wiring() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let cfg = config(QuantConfig::with_bits(8, 8));
        let block = ResidualBlock::new(3, 16, 32, 2, &cfg, fns(&cfg), vb).unwrap();
        assert_eq!(block.units().len(), 3);
        assert!(block.units()[0].has_projection());
        assert!(block.units()[1..].iter().all(|u| !u.has_projection()));
        assert_eq!(block.output_depth(), 32);

        let x = Tensor::randn(0f32, 1.0, (2, 16, 16, 16), &Device::Cpu).unwrap();
        assert_eq!(block.forward_t(&x, false).unwrap().dims(), &[2, 32, 8, 8]);

        // 7 convolutions: 3 units × 2 + 1 projection.
        let expected: f32 = block
            .units()
            .iter()
            .flat_map(|u| u.convs())
            .map(|(_, c)| c.weight().sqr().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap())
            .sum::<f32>()
            * cfg.weight_decay as f32;
        let got = block.regularization_loss().unwrap().to_scalar::<f32>().unwrap();
        assert!((expected - got).abs() / expected < 1e-4);
        // conv weights (7) + bn scale/shift (2 per norm, 7 norms)
        assert_eq!(block.parameters().len(), 7 + 14);
    }
}
