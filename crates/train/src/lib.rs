//! # qresnet-train — training loop
//!
//! Training, evaluation and checkpointing for QResNet-20:
//!
//! * **[`Trainer`]** — owns model + optimiser + schedule. One call to
//!   [`Trainer::step`] runs forward, cross-entropy + L2 penalty, backward,
//!   gradient clipping, AdamW, and schedule advancement.
//! * **[`LrScheduler`]** — warmup → cosine / linear / constant over the
//!   step budget resolved by [`step_budget`].
//! * **[`load_model`]** — rebuild a network from `config.json` + safetensors.

pub mod scheduler;
pub mod trainer;

pub use scheduler::{step_budget, LrDecay, LrScheduler};
pub use trainer::{evaluate, load_model, EvalMetrics, StepMetrics, Trainer, TrainerConfig};
