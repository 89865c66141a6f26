//! # qresnet-core — layers and network
//!
//! Every compute primitive needed to build and train a quantization-aware
//! ResNet-20:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`quantize`] | STE helper, weight/activation quantizers, `quantize_fns` |
//! | [`conv`] | `QConv2d` with per-layer quantization switches |
//! | [`norm`] | `Norm` (batch normalisation) |
//! | [`activation`] | `Nonlinearity` (ReLU / clip) |
//! | [`block`] | `ResidualUnit`, `ResidualBlock` |
//! | [`model`] | `QResNet20`, `Dense`, `CompressionStats` |
//! | [`layer`] | the `Layer` trait and L2 penalty |
//!
//! All tensors are NCHW internally; [`QResNet20`] accepts NHWC image batches.

pub mod activation;
pub mod block;
pub mod conv;
pub mod layer;
pub mod model;
pub mod norm;
pub mod quantize;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use block::{ResidualBlock, ResidualUnit};
pub use conv::{QConv2d, QConv2dConfig};
pub use layer::{l2_penalty, Layer};
pub use model::{compression_stats, CompressionStats, Dense, QResNet20};
pub use quantize::{
    distinct_levels, quantize_fns, sign_distribution, ActivationQuantizer, QuantFns,
    WeightQuantizer,
};
