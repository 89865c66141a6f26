//! # qresnet-common — Shared Primitives
//!
//! Types and utilities shared across every crate in the workspace:
//!
//! * **[`ResNetConfig`]** / **[`QuantConfig`]** — network hyper-parameters (serialised as JSON).
//! * **[`ConfigError`]** / **[`DatasetError`]** — typed failures.
//! * **[`CifarDataset`]** / **[`InMemoryDataset`]** — image loading & batching.
//! * **[`batch_to_tensors`]** — decoded batch → Candle tensors.

pub mod config;
pub mod data;
pub mod error;

pub use config::{check_bits, PoolKind, QuantConfig, ResNetConfig, FULL_PRECISION_BITS};
pub use data::{
    batch_to_tensors, check_labels, CifarDataset, ImageBatch, ImageDataset, InMemoryDataset,
    IMAGE_CHANNELS, IMAGE_SIZE, PIXELS_PER_IMAGE,
};
pub use error::{ConfigError, DatasetError};
