use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::Device;
use clap::{Parser, Subcommand};
use tracing::info;

use qresnet_common::{check_labels, CifarDataset, ImageDataset, InMemoryDataset, ResNetConfig};
use qresnet_core::compression_stats;
use qresnet_train::{evaluate, load_model, LrDecay, Trainer, TrainerConfig};

#[derive(Parser, Debug)]
#[command(name = "qresnet", about = "Quantization-aware ResNet-20 for CIFAR-style images")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train from scratch on CIFAR binary batches (or synthetic data).
    Train(TrainArgs),
    /// Evaluate a trained model directory on a labelled set.
    Eval(EvalArgs),
    /// Print parameter counts and compression; per-layer levels with weights.
    Stats(StatsArgs),
    /// Write a config.json from the five network hyper-parameters.
    InitConfig(InitConfigArgs),
}

// ── Train ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct TrainArgs {
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// CIFAR-10 `.bin` file or a directory of them.
    #[arg(long, required_unless_present = "synthetic")]
    data_dir: Option<PathBuf>,
    /// Train on this many random images instead of `--data-dir`.
    #[arg(long, conflicts_with = "data_dir")]
    synthetic: Option<usize>,
    #[arg(long)]
    val_data_dir: Option<PathBuf>,
    #[arg(long, default_value = "checkpoints")]
    output_dir: PathBuf,
    #[arg(long, default_value = "128")]
    batch_size: usize,
    #[arg(long, default_value = "0")]
    max_steps: usize,
    #[arg(long, default_value = "10")]
    max_epochs: usize,
    #[arg(long, default_value = "1000")]
    save_every: usize,
    #[arg(long, default_value = "1e-3")]
    lr: f64,
    #[arg(long, default_value = "1e-5")]
    lr_min: f64,
    #[arg(long, default_value = "0")]
    lr_warmup_steps: usize,
    #[arg(long, default_value = "cosine", value_parser = ["cosine", "linear", "none"])]
    lr_decay: String,
    #[arg(long, default_value = "0.0")]
    grad_clip_max_norm: f64,
    #[arg(long, default_value = "0.0")]
    label_smoothing: f64,
    #[arg(long, default_value = "100")]
    log_every: usize,
    #[arg(long, default_value = "500")]
    eval_every: usize,
    #[arg(long, default_value = "0")]
    eval_batches: usize,
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

// ── Eval / Stats / InitConfig ──────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct EvalArgs {
    /// Directory holding `config.json` and `model.safetensors`.
    #[arg(long)]
    model_dir: PathBuf,
    /// Weights to load instead of `model.safetensors`.
    #[arg(long)]
    checkpoint: Option<PathBuf>,
    #[arg(long)]
    data_dir: PathBuf,
    #[arg(long, default_value_t = 256)]
    batch_size: usize,
    /// 0 = the whole set.
    #[arg(long, default_value_t = 0)]
    max_batches: usize,
}

#[derive(Parser, Debug)]
struct StatsArgs {
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// Also report distinct weight levels per convolution.
    #[arg(long)]
    checkpoint: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct InitConfigArgs {
    #[arg(long, default_value = "config.json")]
    output: PathBuf,
    #[arg(long, default_value_t = 5e-4)]
    weight_decay: f64,
    #[arg(long, default_value_t = 10)]
    class_num: usize,
    #[arg(long)]
    quantize: bool,
    #[arg(long, default_value_t = 4)]
    weight_bits: u32,
    #[arg(long, default_value_t = 4)]
    activation_bits: u32,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Train(args) => cmd_train(args),
        Command::Eval(args) => cmd_eval(args),
        Command::Stats(args) => cmd_stats(args),
        Command::InitConfig(args) => cmd_init_config(args),
    }
}

// ── Command implementations ────────────────────────────────────────────────────

fn cmd_train(args: TrainArgs) -> Result<()> {
    let model_config = if args.config.exists() {
        ResNetConfig::load(&args.config)?
    } else {
        let default = ResNetConfig::default();
        default.save(&args.config)?;
        info!(path = %args.config.display(), "Created default config");
        default
    };
    model_config.validate()?;

    let trainer_config = TrainerConfig {
        batch_size: args.batch_size,
        max_steps: args.max_steps,
        max_epochs: args.max_epochs,
        lr: args.lr,
        lr_min: args.lr_min,
        lr_warmup_steps: args.lr_warmup_steps,
        lr_decay: args.lr_decay.parse::<LrDecay>()?,
        grad_clip_max_norm: args.grad_clip_max_norm,
        label_smoothing: args.label_smoothing,
        save_every: args.save_every,
        log_every: args.log_every,
        eval_every: args.eval_every,
        eval_batches: args.eval_batches,
        output_dir: args.output_dir.clone(),
        seed: args.seed,
    };

    let train: Box<dyn ImageDataset> = match (&args.data_dir, args.synthetic) {
        (_, Some(n)) => {
            info!(images = n, "Using synthetic dataset");
            Box::new(InMemoryDataset::synthetic(n, model_config.class_num, args.seed))
        }
        (Some(dir), None) => Box::new(open_cifar(dir, model_config.class_num)?),
        (None, None) => anyhow::bail!("either --data-dir or --synthetic is required"),
    };
    let val = match &args.val_data_dir {
        Some(dir) => Some(open_cifar(dir, model_config.class_num)?),
        None => None,
    };

    let device = Device::cuda_if_available(0)?;
    let mut trainer = Trainer::new(model_config, trainer_config, device)?;

    let last = trainer.fit(train.as_ref(), val.as_ref().map(|v| v as &dyn ImageDataset))?;
    if let Some(m) = last {
        info!(step = m.step, loss = format!("{:.4}", m.loss), "final step");
    }

    let path = trainer.save_final()?;
    info!(path = %path.display(), "Training done");
    Ok(())
}

fn cmd_eval(args: EvalArgs) -> Result<()> {
    let config = ResNetConfig::load(&args.model_dir.join("config.json"))
        .with_context(|| format!("reading config in {}", args.model_dir.display()))?;
    let weights = args
        .checkpoint
        .clone()
        .unwrap_or_else(|| args.model_dir.join("model.safetensors"));

    let device = Device::cuda_if_available(0)?;
    let (model, _varmap) = load_model(&config, &weights, &device)?;
    let dataset = open_cifar(&args.data_dir, config.class_num)?;

    let m = evaluate(&model, &dataset, args.batch_size, args.max_batches, &device)?;
    println!(
        "images={} loss={:.4} accuracy={:.4}",
        m.images, m.loss, m.accuracy
    );
    Ok(())
}

fn cmd_stats(args: StatsArgs) -> Result<()> {
    let config = ResNetConfig::load(&args.config)?;
    config.validate()?;
    let q = &config.quantization;
    let stats = compression_stats(&config);

    println!("Quantization:      {}", if q.enabled { "on" } else { "off" });
    println!(
        "Bits (w / a):      {} / {}",
        q.effective_weight_bits(),
        q.effective_activation_bits()
    );
    println!("Total params:      {}", stats.total_params);
    println!("Quantized params:  {}", stats.quantized_params);
    println!("Bits per param:    {:.2}", stats.effective_bits_per_param);
    println!("Compression (f32): {:.2}x", stats.compression_ratio_vs_f32);

    if let Some(ref ckpt) = args.checkpoint {
        let (model, _varmap) = load_model(&config, ckpt, &Device::Cpu)?;
        println!();
        println!("Distinct weight levels per convolution:");
        for (name, levels) in model.quantized_layer_levels()? {
            println!("  {name:<28} {levels}");
        }
    }
    Ok(())
}

fn cmd_init_config(args: InitConfigArgs) -> Result<()> {
    let config = ResNetConfig::from_hyperparams(
        args.weight_decay,
        args.class_num,
        args.quantize,
        args.weight_bits,
        args.activation_bits,
    );
    config.validate()?;
    config.save(&args.output)?;
    info!(path = %args.output.display(), "Wrote config");
    Ok(())
}

fn open_cifar(path: &Path, class_num: usize) -> Result<CifarDataset> {
    let ds = CifarDataset::open(path)?;
    check_labels(&ds, class_num)?;
    info!(path = %path.display(), images = ds.num_images(), "Loaded CIFAR records");
    Ok(ds)
}
