//! QResNet-20: the full quantization-aware CIFAR network.
//!
//! ```text
//! [N,32,32,3] ─permute─► [N,3,32,32]
//!   → conv1 (16, full precision) → bn1 → act
//!   → block1 (3 × 16, stride 1)
//!   → block2 (3 × 32, stride 2)
//!   → block3 (3 × 64, stride 2)
//!   → pool (8×8) → flatten → fc (class_num) → softmax
//! ```

use candle_core::{Module, Result, Tensor, D};
use candle_nn::{linear, Linear, VarBuilder};
use tracing::debug;

use qresnet_common::{PoolKind, QuantConfig, ResNetConfig, FULL_PRECISION_BITS, IMAGE_SIZE};

use crate::activation::Nonlinearity;
use crate::block::ResidualBlock;
use crate::conv::{QConv2d, QConv2dConfig};
use crate::layer::{l2_penalty, sum_penalties, Layer};
use crate::norm::Norm;
use crate::quantize::{distinct_levels, quantize_fns, QuantFns};

/// Stem output depth.
pub const STEM_DEPTH: usize = 16;

/// `(output_depth, stride)` of each residual block.
pub const BLOCKS: [(usize, usize); 3] = [(16, 1), (32, 2), (64, 2)];

/// Residual units per block.
pub const UNITS_PER_BLOCK: usize = 3;

/// Spatial side length entering the pool.
const FINAL_SIDE: usize = IMAGE_SIZE / 4;

// ── Dense ───────────────────────────────────────────────────────────────────

/// Fully connected classifier head with an L2-regularized kernel.
pub struct Dense {
    inner: Linear,
    weight_decay: f64,
}

impl Dense {
    pub fn new(in_features: usize, out_features: usize, weight_decay: f64, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            inner: linear(in_features, out_features, vb)?,
            weight_decay,
        })
    }

    pub fn weight(&self) -> &Tensor {
        self.inner.weight()
    }
}

impl Layer for Dense {
    fn forward_t(&self, xs: &Tensor, _train: bool) -> Result<Tensor> {
        self.inner.forward(xs)
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = vec![self.inner.weight().clone()];
        params.extend(self.inner.bias().cloned());
        params
    }

    /// Kernel only; the bias is not penalized.
    fn regularization_loss(&self) -> Result<Tensor> {
        l2_penalty(self.inner.weight(), self.weight_decay)
    }
}

// ── QResNet20 ───────────────────────────────────────────────────────────────

/// 20 weighted layers: stem, 18 residual convolutions, dense head.
pub struct QResNet20 {
    conv1: QConv2d,
    bn1: Norm,
    nonlinearity: Nonlinearity,
    blocks: [ResidualBlock; 3],
    pool: PoolKind,
    pool_size: usize,
    fc: Dense,
    config: ResNetConfig,
}

impl QResNet20 {
    /// Validate `config` and build every layer from `vb`.
    ///
    /// Parameters already present in the backing `VarMap` are reused, so two
    /// networks built from one `VarMap` share weights.
    pub fn new(vb: VarBuilder, config: &ResNetConfig) -> Result<Self> {
        config.validate().map_err(candle_core::Error::wrap)?;

        let q = &config.quantization;
        let quant = quantize_fns(q.effective_weight_bits(), q.effective_activation_bits())?;

        // The raw image is never quantized.
        let conv1 = QConv2d::new(
            3,
            QConv2dConfig::new(STEM_DEPTH, 3, 1, false),
            QuantFns::full_precision(),
            config.weight_decay,
            vb.pp("conv1"),
        )?;
        let bn1 = Norm::new(STEM_DEPTH, config, vb.pp("bn1"))?;

        let [(d1, s1), (d2, s2), (d3, s3)] = BLOCKS;
        let blocks = [
            ResidualBlock::new(UNITS_PER_BLOCK, STEM_DEPTH, d1, s1, config, quant, vb.pp("block1"))?,
            ResidualBlock::new(UNITS_PER_BLOCK, d1, d2, s2, config, quant, vb.pp("block2"))?,
            ResidualBlock::new(UNITS_PER_BLOCK, d2, d3, s3, config, quant, vb.pp("block3"))?,
        ];

        let side = FINAL_SIDE / config.pool_size;
        if side == 0 {
            candle_core::bail!(
                "pool_size {} exceeds the {FINAL_SIDE}×{FINAL_SIDE} feature map",
                config.pool_size
            );
        }
        let fc = Dense::new(d3 * side * side, config.class_num, config.weight_decay, vb.pp("fc"))?;

        debug!(
            weight_bits = q.effective_weight_bits(),
            activation_bits = q.effective_activation_bits(),
            class_num = config.class_num,
            "built QResNet20"
        );

        Ok(Self {
            conv1,
            bn1,
            nonlinearity: Nonlinearity::for_quant(q),
            blocks,
            pool: config.pool,
            pool_size: config.pool_size,
            fc,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &ResNetConfig {
        &self.config
    }

    pub fn blocks(&self) -> &[ResidualBlock; 3] {
        &self.blocks
    }

    /// Pre-softmax scores `[N, class_num]` for an NHWC batch `[N,32,32,3]`.
    pub fn logits_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let x = xs.permute((0, 3, 1, 2))?.contiguous()?;

        let x = self.bn1.forward_t(&self.conv1.forward(&x)?, train)?;
        let mut x = self.nonlinearity.apply(&x)?;

        for block in &self.blocks {
            x = block.forward_t(&x, train)?;
        }

        let x = match self.pool {
            PoolKind::Max => x.max_pool2d(self.pool_size)?,
            PoolKind::Avg => x.avg_pool2d(self.pool_size)?,
        };
        let x = x.flatten_from(1)?;
        self.fc.forward_t(&x, train)
    }

    /// Class probabilities `[N, class_num]`; each row sums to 1.
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        candle_nn::ops::softmax(&self.logits_t(xs, train)?, D::Minus1)
    }

    /// Inference forward (running batch-norm statistics).
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.forward_t(xs, false)
    }

    /// Every weighted layer in forward order, projections excluded.
    pub fn weighted_layer_count(&self) -> usize {
        let convs: usize = self
            .blocks
            .iter()
            .flat_map(|b| b.units())
            .map(|u| u.convs().iter().filter(|(name, _)| *name != "conv_shortcut").count())
            .sum();
        1 + convs + 1
    }

    /// Distinct value count of each convolution weight as used in forward.
    pub fn quantized_layer_levels(&self) -> Result<Vec<(String, usize)>> {
        let mut out = vec![(
            "conv1".to_string(),
            distinct_levels(&self.conv1.quantized_weight()?)?,
        )];
        for (b, block) in self.blocks.iter().enumerate() {
            for (u, unit) in block.units().iter().enumerate() {
                for (name, conv) in unit.convs() {
                    let levels = distinct_levels(&conv.quantized_weight()?)?;
                    out.push((format!("block{}.unit{u}.{name}", b + 1), levels));
                }
            }
        }
        Ok(out)
    }
}

impl Layer for QResNet20 {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        QResNet20::forward_t(self, xs, train)
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = self.conv1.parameters();
        params.extend(self.bn1.parameters());
        for block in &self.blocks {
            params.extend(block.parameters());
        }
        params.extend(self.fc.parameters());
        params
    }

    fn regularization_loss(&self) -> Result<Tensor> {
        let terms = std::iter::once(self.conv1.regularization_loss())
            .chain(self.blocks.iter().map(|b| b.regularization_loss()))
            .chain(std::iter::once(self.fc.regularization_loss()));
        sum_penalties(terms)
    }
}

/// `ModuleT` comes from candle's blanket impl and runs this eval forward.
impl Module for QResNet20 {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        QResNet20::forward(self, xs)
    }
}

// ── Compression statistics ──────────────────────────────────────────────────

/// Parameter counts and storage cost, from configuration alone.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressionStats {
    pub total_params: usize,
    pub quantized_params: usize,
    pub weight_bits: u32,
    /// `(quantized × weight_bits + rest × 32) / total`.
    pub effective_bits_per_param: f64,
    pub compression_ratio_vs_f32: f64,
}

/// Only residual convolution kernels count as quantized; the stem, batch
/// norm and the dense head stay full precision.
pub fn compression_stats(config: &ResNetConfig) -> CompressionStats {
    let quant: &QuantConfig = &config.quantization;
    let conv = |cin: usize, cout: usize, k: usize| cin * cout * k * k;
    let bn = |c: usize| 2 * c;

    let stem = conv(3, STEM_DEPTH, 3) + bn(STEM_DEPTH);

    let mut block_convs = 0;
    let mut block_norms = 0;
    let mut cin = STEM_DEPTH;
    for (depth, _) in BLOCKS {
        // Unit 0 with projection.
        block_convs += conv(cin, depth, 3) + conv(depth, depth, 3) + conv(cin, depth, 1);
        block_norms += 3 * bn(depth);
        for _ in 1..UNITS_PER_BLOCK {
            block_convs += 2 * conv(depth, depth, 3);
            block_norms += 2 * bn(depth);
        }
        cin = depth;
    }

    let side = FINAL_SIDE / config.pool_size.max(1);
    let fc_in = cin * side * side;
    let dense = fc_in * config.class_num + config.class_num;

    let total = stem + block_convs + block_norms + dense;
    let weight_bits = quant.effective_weight_bits().min(FULL_PRECISION_BITS);
    let quantized = if quant.weights_enabled() && weight_bits < FULL_PRECISION_BITS {
        block_convs
    } else {
        0
    };

    let bits_full = FULL_PRECISION_BITS as f64;
    let effective_bits = (quantized as f64 * weight_bits as f64
        + total.saturating_sub(quantized) as f64 * bits_full)
        / total.max(1) as f64;

    CompressionStats {
        total_params: total,
        quantized_params: quantized,
        weight_bits,
        effective_bits_per_param: effective_bits,
        compression_ratio_vs_f32: bits_full / effective_bits,
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn build(config: &ResNetConfig, varmap: &VarMap) -> QResNet20 {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        QResNet20::new(vb, config).unwrap()
    }

    fn images(n: usize) -> Tensor {
        Tensor::rand(0f32, 1.0, (n, IMAGE_SIZE, IMAGE_SIZE, 3), &Device::Cpu).unwrap()
    }

    fn quantized(w: u32, a: u32) -> ResNetConfig {
        ResNetConfig::from_hyperparams(5e-4, 10, true, w, a)
    }

    fn assert_probability_rows(probs: &Tensor, n: usize, classes: usize) {
        assert_eq!(probs.dims(), &[n, classes]);
        let rows: Vec<Vec<f32>> = probs.to_vec2().unwrap();
        for row in rows {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-5, "row sums to {sum}");
            assert!(row.iter().all(|p| *p >= 0.0));
        }
    }

    #[test]
    fn forward_gives_probability_rows() {
        for config in [ResNetConfig::default(), quantized(4, 4), quantized(1, 1), quantized(2, 8)] {
            let varmap = VarMap::new();
            let model = build(&config, &varmap);
            let probs = model.forward(&images(2)).unwrap();
            assert_probability_rows(&probs, 2, 10);
        }
    }

    #[test]
    fn training_forward_and_average_pool() {
        let config = ResNetConfig {
            pool: PoolKind::Avg,
            class_num: 7,
            ..quantized(8, 8)
        };
        let varmap = VarMap::new();
        let model = build(&config, &varmap);
        let probs = model.forward_t(&images(3), true).unwrap();
        assert_probability_rows(&probs, 3, 7);
    }

    #[test]
    fn smaller_pool_widens_the_head() {
        let config = ResNetConfig {
            pool_size: 4,
            ..Default::default()
        };
        let varmap = VarMap::new();
        let model = build(&config, &varmap);
        assert_eq!(model.fc.weight().dims(), &[10, 64 * 4]);
        assert_probability_rows(&model.forward(&images(1)).unwrap(), 1, 10);
    }

    #[test]
    fn usable_as_candle_module() {
        fn eval_probs<M: candle_core::ModuleT>(m: &M, xs: &Tensor) -> Tensor {
            m.forward_t(xs, false).unwrap()
        }
        let varmap = VarMap::new();
        let model = build(&quantized(4, 4), &varmap);
        let x = images(2);
        let a: Vec<Vec<f32>> = eval_probs(&model, &x).to_vec2().unwrap();
        let b: Vec<Vec<f32>> = Module::forward(&model, &x).unwrap().to_vec2().unwrap();
        let c: Vec<Vec<f32>> = model.forward(&x).unwrap().to_vec2().unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn eval_forward_is_deterministic() {
        let varmap = VarMap::new();
        let model = build(&quantized(2, 2), &varmap);
        let x = images(2);
        let a: Vec<Vec<f32>> = model.forward(&x).unwrap().to_vec2().unwrap();
        let b: Vec<Vec<f32>> = model.forward(&x).unwrap().to_vec2().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn disabled_matches_full_precision_widths() {
        let varmap = VarMap::new();
        let off = build(&ResNetConfig::default(), &varmap);
        let full = build(&quantized(32, 32), &varmap);
        let x = images(2);
        let a: Vec<Vec<f32>> = off.forward(&x).unwrap().to_vec2().unwrap();
        let b: Vec<Vec<f32>> = full.forward(&x).unwrap().to_vec2().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn invalid_config_fails_before_building() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = ResNetConfig {
            class_num: 0,
            ..Default::default()
        };
        assert!(QResNet20::new(vb.clone(), &config).is_err());
        assert!(QResNet20::new(vb.clone(), &quantized(0, 4)).is_err());
        let config = ResNetConfig {
            pool_size: 16,
            ..Default::default()
        };
        assert!(QResNet20::new(vb, &config).is_err());
    }

    #[test]
    fn twenty_weighted_layers() {
        let varmap = VarMap::new();
        let model = build(&ResNetConfig::default(), &varmap);
        assert_eq!(model.weighted_layer_count(), 20);
        // 18 block convs + 3 projections + stem.
        assert_eq!(model.quantized_layer_levels().unwrap().len(), 22);
    }

    #[test]
    fn stem_stays_full_precision() {
        let varmap = VarMap::new();
        let model = build(&quantized(2, 2), &varmap);
        let levels = model.quantized_layer_levels().unwrap();
        let (name, stem) = &levels[0];
        assert_eq!(name, "conv1");
        assert!(*stem > 3);
        assert!(levels[1..].iter().all(|(_, l)| *l <= 3));
    }

    #[test]
    fn regularization_covers_every_kernel() {
        let varmap = VarMap::new();
        let model = build(&ResNetConfig::default(), &varmap);
        let total = model.regularization_loss().unwrap().to_scalar::<f32>().unwrap();
        let by_parts = model.conv1.regularization_loss().unwrap().to_scalar::<f32>().unwrap()
            + model
                .blocks()
                .iter()
                .map(|b| b.regularization_loss().unwrap().to_scalar::<f32>().unwrap())
                .sum::<f32>()
            + model.fc.regularization_loss().unwrap().to_scalar::<f32>().unwrap();
        assert!(total > 0.0);
        assert!((total - by_parts).abs() / total < 1e-4);
    }

    #[test]
    fn compression_stats_from_config() {
        let full = compression_stats(&ResNetConfig::default());
        assert_eq!(full.quantized_params, 0);
        assert!((full.compression_ratio_vs_f32 - 1.0).abs() < 1e-12);

        let varmap = VarMap::new();
        let model = build(&ResNetConfig::default(), &varmap);
        let counted: usize = model.parameters().iter().map(|p| p.elem_count()).sum();
        assert_eq!(full.total_params, counted);

        let q = compression_stats(&quantized(2, 2));
        assert_eq!(q.total_params, full.total_params);
        assert!(q.quantized_params > q.total_params / 2);
        assert!(q.effective_bits_per_param < 32.0);
        assert!(q.compression_ratio_vs_f32 > 1.0);

        let weights_off = ResNetConfig {
            quantization: QuantConfig {
                quantize_weights: false,
                ..QuantConfig::with_bits(2, 2)
            },
            ..Default::default()
        };
        assert_eq!(compression_stats(&weights_off).quantized_params, 0);
    }
}
