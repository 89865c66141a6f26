//! Model configuration for QResNet-20.
//!
//! Serialised as JSON next to checkpoints. Every field has a sensible default
//! so a minimal `{}` JSON produces the full-precision CIFAR-10 network.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Bit-width at (or above) which a quantizer degenerates to identity.
pub const FULL_PRECISION_BITS: u32 = 32;

// ── QuantConfig ─────────────────────────────────────────────────────────────

/// Mixed-precision quantization switches.
///
/// `weight_bits == 32 && activation_bits == 32` behaves exactly like
/// `enabled = false`. When `enabled` is false both effective widths are 32.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantConfig {
    /// Master switch (`quantilize`).
    #[serde(default)]
    pub enabled: bool,
    /// Weight bit-width. `1` binarizes per output filter.
    #[serde(default = "default_bits")]
    pub weight_bits: u32,
    /// Activation bit-width. `1` clips to [-1, 1] instead of binarizing.
    #[serde(default = "default_bits")]
    pub activation_bits: u32,
    /// Quantize convolution weights when enabled (`quantilize_w`).
    #[serde(default = "default_true")]
    pub quantize_weights: bool,
    /// Quantize convolution inputs when enabled (`quantilize_x`).
    #[serde(default = "default_true")]
    pub quantize_activations: bool,
}

impl Default for QuantConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            weight_bits: default_bits(),
            activation_bits: default_bits(),
            quantize_weights: true,
            quantize_activations: true,
        }
    }
}

impl QuantConfig {
    /// Quantization on, both halves, with the given widths.
    pub fn with_bits(weight_bits: u32, activation_bits: u32) -> Self {
        Self {
            enabled: true,
            weight_bits,
            activation_bits,
            ..Default::default()
        }
    }

    /// Full precision.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn effective_weight_bits(&self) -> u32 {
        if self.enabled {
            self.weight_bits
        } else {
            FULL_PRECISION_BITS
        }
    }

    pub fn effective_activation_bits(&self) -> u32 {
        if self.enabled {
            self.activation_bits
        } else {
            FULL_PRECISION_BITS
        }
    }

    /// Whether convolution weights (other than the stem) are quantized.
    pub fn weights_enabled(&self) -> bool {
        self.enabled && self.quantize_weights
    }

    /// Whether convolution inputs (other than the stem) are quantized.
    pub fn activations_enabled(&self) -> bool {
        self.enabled && self.quantize_activations
    }

    /// Reject bit-widths below 1, whether or not `enabled` is set.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_bits("weight", self.weight_bits)?;
        check_bits("activation", self.activation_bits)
    }
}

/// Fail when `bits` is not a usable width.
pub fn check_bits(kind: &'static str, bits: u32) -> Result<(), ConfigError> {
    if bits < 1 {
        return Err(ConfigError::InvalidBitWidth { kind, bits });
    }
    Ok(())
}

// ── ResNetConfig ────────────────────────────────────────────────────────────

/// Global pooling applied to the last block's 8×8 feature map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PoolKind {
    #[default]
    Max,
    Avg,
}

/// Configuration for the quantization-aware ResNet-20.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResNetConfig {
    /// Number of output classes.
    #[serde(default = "default_class_num")]
    pub class_num: usize,
    /// L2 coefficient for every convolution kernel and the dense kernel.
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    #[serde(default)]
    pub quantization: QuantConfig,
    #[serde(default)]
    pub pool: PoolKind,
    /// Pooling window (and stride).
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Batch-norm epsilon.
    #[serde(default = "default_bn_eps")]
    pub bn_eps: f64,
    /// Weight of the current batch in the running-statistics update.
    #[serde(default = "default_bn_momentum")]
    pub bn_momentum: f64,
}

// ── Default value functions ─────────────────────────────────────────────────

fn default_bits() -> u32 {
    4
}
fn default_true() -> bool {
    true
}
fn default_class_num() -> usize {
    10
}
fn default_weight_decay() -> f64 {
    5e-4
}
fn default_pool_size() -> usize {
    8
}
fn default_bn_eps() -> f64 {
    1e-3
}
fn default_bn_momentum() -> f64 {
    0.01
}

// ── Impl ────────────────────────────────────────────────────────────────────

impl Default for ResNetConfig {
    fn default() -> Self {
        Self {
            class_num: default_class_num(),
            weight_decay: default_weight_decay(),
            quantization: QuantConfig::default(),
            pool: PoolKind::Max,
            pool_size: default_pool_size(),
            bn_eps: default_bn_eps(),
            bn_momentum: default_bn_momentum(),
        }
    }
}

impl ResNetConfig {
    /// Build from the five externally supplied hyper-parameters.
    pub fn from_hyperparams(
        weight_decay: f64,
        class_num: usize,
        quantize: bool,
        weight_bits: u32,
        activation_bits: u32,
    ) -> Self {
        Self {
            class_num,
            weight_decay,
            quantization: QuantConfig {
                enabled: quantize,
                weight_bits,
                activation_bits,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Check every field. Called by the network constructor before any
    /// layer is allocated.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.quantization.validate()?;
        if self.class_num == 0 {
            return Err(ConfigError::NoClasses);
        }
        if !self.weight_decay.is_finite() || self.weight_decay < 0.0 {
            return Err(ConfigError::InvalidWeightDecay(self.weight_decay));
        }
        if self.pool_size == 0 {
            return Err(ConfigError::InvalidPoolSize);
        }
        if self.bn_eps.is_nan() || self.bn_eps <= 0.0 {
            return Err(ConfigError::InvalidBatchNorm {
                field: "bn_eps",
                value: self.bn_eps,
            });
        }
        if !(0.0..=1.0).contains(&self.bn_momentum) {
            return Err(ConfigError::InvalidBatchNorm {
                field: "bn_momentum",
                value: self.bn_momentum,
            });
        }
        Ok(())
    }

    /// Save config to a JSON file.
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&json)?;
        Ok(config)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
