//! Trainer: encapsulates the full training loop.
//!
//! Decouples the compute graph (forward + loss + L2 penalty) from the
//! optimisation step (backward, gradient clipping, AdamW, schedule advance).

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use candle_core::{backprop::GradStore, DType, Device, Tensor, Var, D};
use candle_nn::{loss, ops, AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info};

use qresnet_common::{batch_to_tensors, ImageBatch, ImageDataset, ResNetConfig};
use qresnet_core::{compression_stats, Layer, QResNet20};

use crate::scheduler::{step_budget, LrDecay, LrScheduler};

// ── Config ──────────────────────────────────────────────────────────────────

/// All training hyper-parameters (CLI-level knobs).
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub batch_size: usize,
    /// 0 = unlimited (bounded by `max_epochs`).
    pub max_steps: usize,
    /// 0 = unlimited (bounded by `max_steps`).
    pub max_epochs: usize,
    pub lr: f64,
    pub lr_min: f64,
    pub lr_warmup_steps: usize,
    pub lr_decay: LrDecay,
    /// 0 disables clipping.
    pub grad_clip_max_norm: f64,
    pub label_smoothing: f64,
    pub save_every: usize,
    pub log_every: usize,
    pub eval_every: usize,
    /// 0 = the whole validation set.
    pub eval_batches: usize,
    pub output_dir: PathBuf,
    /// Seeds the per-epoch shuffle.
    pub seed: u64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            batch_size: 128,
            max_steps: 0,
            max_epochs: 1,
            lr: 1e-3,
            lr_min: 1e-5,
            lr_warmup_steps: 0,
            lr_decay: LrDecay::Cosine,
            grad_clip_max_norm: 0.0,
            label_smoothing: 0.0,
            save_every: 0,
            log_every: 100,
            eval_every: 0,
            eval_batches: 0,
            output_dir: PathBuf::from("checkpoints"),
            seed: 0,
        }
    }
}

/// Metrics returned after each training step.
#[derive(Debug, Clone)]
pub struct StepMetrics {
    pub step: usize,
    /// Cross-entropy plus L2 penalty.
    pub loss: f32,
    pub reg_loss: f32,
    /// Top-1 accuracy on the training batch.
    pub accuracy: f32,
    pub lr: f64,
    pub grad_norm: f64,
}

/// Result of [`Trainer::evaluate`].
#[derive(Debug, Clone, Copy)]
pub struct EvalMetrics {
    pub loss: f64,
    pub accuracy: f64,
    pub images: usize,
}

// ── Trainer ─────────────────────────────────────────────────────────────────

/// The training engine. Owns the model, optimiser, and LR schedule.
pub struct Trainer {
    pub model: QResNet20,
    pub varmap: VarMap,
    vars: Vec<Var>,
    optimizer: AdamW,
    lr_scheduler: LrScheduler,
    pub config: TrainerConfig,
    model_config: ResNetConfig,
    pub global_step: usize,
    device: Device,
}

impl Trainer {
    /// Construct a new Trainer. Builds the model from config.
    pub fn new(
        model_config: ResNetConfig,
        trainer_config: TrainerConfig,
        device: Device,
    ) -> anyhow::Result<Self> {
        if trainer_config.batch_size == 0 {
            anyhow::bail!("batch_size must be at least 1");
        }
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = QResNet20::new(vb, &model_config)?;
        let vars = trainable_vars(&varmap);

        let stats = compression_stats(&model_config);
        info!(
            total_params = stats.total_params,
            quantized_params = stats.quantized_params,
            weight_bits = stats.weight_bits,
            effective_bits = format!("{:.2}", stats.effective_bits_per_param),
            compression = format!("{:.2}x", stats.compression_ratio_vs_f32),
            "Model compression stats"
        );

        let lr_scheduler = LrScheduler::new(
            trainer_config.lr,
            trainer_config.lr_min,
            trainer_config.lr_warmup_steps,
            trainer_config.max_steps,
            trainer_config.lr_decay,
        );

        // L2 is part of the loss; decoupled decay would apply it twice.
        let optimizer = AdamW::new(
            vars.clone(),
            ParamsAdamW {
                lr: trainer_config.lr,
                weight_decay: 0.0,
                ..Default::default()
            },
        )?;

        Ok(Self {
            model,
            varmap,
            vars,
            optimizer,
            lr_scheduler,
            config: trainer_config,
            model_config,
            global_step: 0,
            device,
        })
    }

    /// One optimiser step on a single batch.
    pub fn step(&mut self, batch: &ImageBatch) -> anyhow::Result<StepMetrics> {
        if batch.is_empty() {
            anyhow::bail!("empty training batch");
        }
        let (images, labels) = batch_to_tensors(batch, &self.device)?;

        let logits = self.model.logits_t(&images, true)?;
        let ce = cross_entropy_with_label_smoothing(
            &logits,
            &labels,
            self.config.label_smoothing,
            self.model_config.class_num,
        )?;
        let reg = self.model.regularization_loss()?;
        let total_loss = (&ce + &reg)?;

        let loss_val = total_loss.to_scalar::<f32>()?;
        let reg_val = reg.to_scalar::<f32>()?;
        let accuracy = correct_count(&logits, &labels)? as f32 / batch.len() as f32;

        // Backward
        self.optimizer
            .set_learning_rate(self.lr_scheduler.current_lr());
        let mut grads = total_loss.backward()?;

        let grad_norm = clip_grad_norm(&mut grads, &self.vars, self.config.grad_clip_max_norm)?;

        self.optimizer.step(&grads)?;

        // Advance schedule
        let lr = self.lr_scheduler.current_lr();
        self.lr_scheduler.advance();
        self.global_step += 1;

        Ok(StepMetrics {
            step: self.global_step - 1,
            loss: loss_val,
            reg_loss: reg_val,
            accuracy,
            lr,
            grad_norm,
        })
    }

    /// Run epochs over `train` until `max_steps` or `max_epochs` is reached.
    ///
    /// With a validation set, evaluates every `eval_every` steps and appends
    /// `step,val_loss,val_accuracy` rows to `output_dir/metrics.csv`.
    /// Checkpoints every `save_every` steps. Returns the last step's metrics.
    pub fn fit(
        &mut self,
        train: &dyn ImageDataset,
        val: Option<&dyn ImageDataset>,
    ) -> anyhow::Result<Option<StepMetrics>> {
        if self.config.max_steps == 0 && self.config.max_epochs == 0 {
            anyhow::bail!("set max_steps or max_epochs; both are 0");
        }
        if train.num_images() == 0 {
            anyhow::bail!("training set is empty");
        }
        std::fs::create_dir_all(&self.config.output_dir)?;

        let steps_per_epoch = train.num_images().div_ceil(self.config.batch_size);
        let budget = step_budget(self.config.max_steps, self.config.max_epochs, steps_per_epoch);
        self.lr_scheduler = self.lr_scheduler.clone().with_total_steps(budget);
        info!(
            images = train.num_images(),
            steps_per_epoch,
            total_steps = budget,
            "Training schedule"
        );

        let mut metrics_file = match val {
            Some(_) => {
                let path = self.config.output_dir.join("metrics.csv");
                let mut f = std::fs::File::create(&path)
                    .with_context(|| format!("creating {}", path.display()))?;
                writeln!(f, "step,val_loss,val_accuracy")?;
                Some(f)
            }
            None => None,
        };

        let mut last = None;
        let mut epoch = 0usize;
        'epochs: loop {
            if self.config.max_epochs > 0 && epoch >= self.config.max_epochs {
                info!("Completed {} epochs", self.config.max_epochs);
                break;
            }
            debug!(epoch, step = self.global_step, "epoch start");
            let seed = self.config.seed.wrapping_add(epoch as u64);
            for batch in train.batches(self.config.batch_size, Some(seed)) {
                if self.step_limit_reached() {
                    break 'epochs;
                }
                let m = self.step(&batch)?;
                if self.config.log_every > 0 && m.step % self.config.log_every == 0 {
                    info!(
                        step = m.step,
                        epoch,
                        loss = format!("{:.4}", m.loss),
                        reg = format!("{:.4}", m.reg_loss),
                        acc = format!("{:.3}", m.accuracy),
                        lr = format!("{:.2e}", m.lr),
                        grad_norm = format!("{:.4}", m.grad_norm),
                        "train"
                    );
                }
                last = Some(m);
                self.eval_and_checkpoint(val, &mut metrics_file)?;
            }
            epoch += 1;
        }
        Ok(last)
    }

    fn step_limit_reached(&self) -> bool {
        self.config.max_steps > 0 && self.global_step >= self.config.max_steps
    }

    fn eval_and_checkpoint(
        &self,
        val: Option<&dyn ImageDataset>,
        metrics_file: &mut Option<std::fs::File>,
    ) -> anyhow::Result<()> {
        let step = self.global_step;

        if let (Some(val), Some(f)) = (val, metrics_file.as_mut()) {
            if self.config.eval_every > 0 && step % self.config.eval_every == 0 {
                let m = self.evaluate(val)?;
                info!(
                    step,
                    val_loss = format!("{:.4}", m.loss),
                    val_accuracy = format!("{:.4}", m.accuracy),
                    "eval"
                );
                writeln!(f, "{step},{},{}", m.loss, m.accuracy)?;
            }
        }

        if self.config.save_every > 0 && step % self.config.save_every == 0 {
            let path = self.save_checkpoint()?;
            info!(path = %path.display(), "Saved checkpoint");
        }
        Ok(())
    }

    /// Save checkpoint.
    pub fn save_checkpoint(&self) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(&self.config.output_dir)?;
        let path = self
            .config
            .output_dir
            .join(format!("checkpoint-{}.safetensors", self.global_step));
        self.varmap.save(&path)?;
        self.model_config
            .save(&self.config.output_dir.join("config.json"))?;
        Ok(path)
    }

    /// Save final model.
    pub fn save_final(&self) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(&self.config.output_dir)?;
        let path = self.config.output_dir.join("model.safetensors");
        self.varmap.save(&path)?;
        self.model_config
            .save(&self.config.output_dir.join("config.json"))?;
        Ok(path)
    }

    /// Validation loss (plain cross-entropy) and top-1 accuracy.
    pub fn evaluate(&self, val: &dyn ImageDataset) -> anyhow::Result<EvalMetrics> {
        evaluate(&self.model, val, self.config.batch_size, self.config.eval_batches, &self.device)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn model_config(&self) -> &ResNetConfig {
        &self.model_config
    }
}

// ── Evaluation / loading ────────────────────────────────────────────────────

/// Evaluate `model` over up to `max_batches` batches of `dataset`
/// (0 = all), in dataset order.
pub fn evaluate(
    model: &QResNet20,
    dataset: &dyn ImageDataset,
    batch_size: usize,
    max_batches: usize,
    device: &Device,
) -> anyhow::Result<EvalMetrics> {
    let batch_size = batch_size.max(1);
    let total_batches = dataset.num_images().div_ceil(batch_size);
    let limit = if max_batches == 0 {
        total_batches
    } else {
        max_batches.min(total_batches)
    };
    if limit == 0 {
        anyhow::bail!("evaluation set is empty");
    }

    let pb = ProgressBar::new(limit as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} batches")?
            .progress_chars("=>-"),
    );

    let mut loss_sum = 0.0f64;
    let mut correct = 0usize;
    let mut images = 0usize;
    for batch in dataset.batches(batch_size, None).take(limit) {
        let (x, labels) = batch_to_tensors(&batch, device)?;
        let logits = model.logits_t(&x, false)?;
        let l = loss::cross_entropy(&logits, &labels)?;
        loss_sum += l.to_scalar::<f32>()? as f64 * batch.len() as f64;
        correct += correct_count(&logits, &labels)?;
        images += batch.len();
        pb.inc(1);
    }
    pb.finish_and_clear();

    Ok(EvalMetrics {
        loss: loss_sum / images as f64,
        accuracy: correct as f64 / images as f64,
        images,
    })
}

/// Rebuild a network from `config` and load weights saved by
/// [`Trainer::save_checkpoint`] / [`Trainer::save_final`].
pub fn load_model(
    config: &ResNetConfig,
    weights: &Path,
    device: &Device,
) -> anyhow::Result<(QResNet20, VarMap)> {
    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = QResNet20::new(vb, config)?;
    varmap
        .load(weights)
        .with_context(|| format!("loading weights from {}", weights.display()))?;
    Ok((model, varmap))
}

/// Variables the optimiser updates; batch-norm running statistics excluded.
fn trainable_vars(varmap: &VarMap) -> Vec<Var> {
    let data = varmap.data().lock().unwrap_or_else(|e| e.into_inner());
    let mut named: Vec<(&String, &Var)> = data
        .iter()
        .filter(|(name, _)| !name.ends_with("running_mean") && !name.ends_with("running_var"))
        .collect();
    named.sort_by(|a, b| a.0.cmp(b.0));
    named.into_iter().map(|(_, v)| v.clone()).collect()
}

// ── Loss ────────────────────────────────────────────────────────────────────

/// Cross-entropy with label smoothing.
fn cross_entropy_with_label_smoothing(
    logits: &Tensor,
    labels: &Tensor,
    smoothing: f64,
    class_num: usize,
) -> candle_core::Result<Tensor> {
    if smoothing <= 0.0 {
        return loss::cross_entropy(logits, labels);
    }
    let log_probs = ops::log_softmax(logits, D::Minus1)?;
    let nll = loss::nll(&log_probs, labels)?;
    let uniform = log_probs.sum(D::Minus1)?.neg()?.mean_all()?;
    let s = smoothing;
    (nll.affine(1.0 - s, 0.0)? + uniform.affine(s / class_num as f64, 0.0)?)
}

fn correct_count(logits: &Tensor, labels: &Tensor) -> candle_core::Result<usize> {
    let predicted = logits.argmax(D::Minus1)?;
    let hits = predicted.eq(labels)?.to_dtype(DType::F32)?.sum_all()?;
    Ok(hits.to_scalar::<f32>()? as usize)
}

// ── Gradient utilities ──────────────────────────────────────────────────────

/// Total L2 norm of gradients; rescale so it is ≤ `max_norm` when
/// `max_norm > 0`. Returns the pre-clip norm.
fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> anyhow::Result<f64> {
    let mut total = 0.0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            total += g.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    let norm = total.sqrt().max(1e-12);
    if max_norm <= 0.0 || norm <= max_norm {
        return Ok(norm);
    }
    let scale = max_norm / norm;
    for var in vars {
        if let Some(g) = grads.remove(var.as_tensor()) {
            let clipped = g.affine(scale, 0.0)?;
            grads.insert(var.as_tensor(), clipped);
        }
    }
    Ok(norm)
}

// ── Tests ───────────────────────────────────────────────────────────────────
