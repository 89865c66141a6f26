//! Error types for configuration and dataset loading.

use std::path::PathBuf;

use thiserror::Error;

/// A configuration value that no network can be built from.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Bit-width below 1.
    #[error("invalid {kind} bit-width {bits}: must be at least 1")]
    InvalidBitWidth { kind: &'static str, bits: u32 },

    #[error("class_num must be at least 1")]
    NoClasses,

    #[error("weight decay must be finite and non-negative, got {0}")]
    InvalidWeightDecay(f64),

    #[error("pool size must be at least 1")]
    InvalidPoolSize,

    #[error("invalid batch-norm {field}: {value}")]
    InvalidBatchNorm { field: &'static str, value: f64 },
}

/// Failure while opening or reading an image dataset.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File length is not a whole number of records.
    #[error(
        "{}: {len} bytes is not a multiple of the {record_len}-byte record size",
        .path.display()
    )]
    Truncated {
        path: PathBuf,
        len: usize,
        record_len: usize,
    },

    #[error("no dataset files found under {}", .0.display())]
    Empty(PathBuf),

    #[error("pixel buffer has {actual} values, expected {expected}")]
    PixelCount { expected: usize, actual: usize },

    #[error("label {label} out of range for {class_num} classes")]
    LabelOutOfRange { label: u32, class_num: usize },
}
