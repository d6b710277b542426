use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use hypergan::hypernetwork::{ArchitectureHandler, TargetLayout};
use hypergan::training::{
    CheckpointMetadata, Cifar10Dataset, DataLoader, DataLoaderConfig, Dataset, SyntheticDataset, TrainingEvent,
};
use hypergan::{utils, Config, HyperGan, HyperGanTrainer};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hypergan")]
#[command(about = "HyperGAN - train a generator of image classifier weights", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a hypernetwork
    Train {
        /// Configuration file (JSON or YAML)
        #[arg(short, long, default_value = "config.json")]
        config: PathBuf,

        /// Directory holding the CIFAR-10 binary batches
        #[arg(long, conflicts_with = "synthetic")]
        data_dir: Option<PathBuf>,

        /// Train on N generated samples instead of a dataset on disk
        #[arg(long, value_name = "N")]
        synthetic: Option<usize>,

        /// Checkpoint directory to resume from
        #[arg(long)]
        resume: Option<PathBuf>,

        /// Stop after this many optimisation steps
        #[arg(long)]
        max_steps: Option<usize>,
    },

    /// Evaluate sampled classifiers from a checkpoint
    Evaluate {
        /// Checkpoint directory
        #[arg(short = 'k', long)]
        checkpoint: PathBuf,

        /// Directory holding the CIFAR-10 binary batches
        #[arg(long, conflicts_with = "synthetic")]
        data_dir: Option<PathBuf>,

        /// Evaluate on N generated samples
        #[arg(long, value_name = "N")]
        synthetic: Option<usize>,

        /// Classifiers sampled per test batch
        #[arg(short, long)]
        samples: Option<usize>,
    },

    /// Export generated classifier weights to a safetensors file
    Sample {
        /// Checkpoint directory; a fresh network is sampled when omitted
        #[arg(short = 'k', long)]
        checkpoint: Option<PathBuf>,

        /// Configuration file used when no checkpoint is given
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Number of classifiers to draw
        #[arg(short = 'n', long, default_value_t = 10)]
        count: usize,

        /// Output file
        #[arg(short, long, default_value = "samples.safetensors")]
        output: PathBuf,
    },

    /// Validate a configuration file or write a preset
    Config {
        /// Configuration file to validate
        #[arg(short, long, required_unless_present = "preset")]
        file: Option<PathBuf>,

        /// Preset to write instead
        #[arg(long, value_enum, conflicts_with = "file", requires = "output")]
        preset: Option<Preset>,

        /// Where to write the preset
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show system information
    Info,
}

#[derive(Clone, Copy, ValueEnum)]
enum Preset {
    Mednet,
    SmallCifar,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    let outcome = match cli.command {
        Commands::Train { config, data_dir, synthetic, resume, max_steps } => {
            train(config, data_dir, synthetic, resume, max_steps).await
        }
        Commands::Evaluate { checkpoint, data_dir, synthetic, samples } => {
            evaluate(checkpoint, data_dir, synthetic, samples)
        }
        Commands::Sample { checkpoint, config, count, output } => sample(checkpoint, config, count, output),
        Commands::Config { file, preset, output } => config_command(file, preset, output),
        Commands::Info => {
            show_system_info();
            Ok(())
        }
    };

    if let Err(e) = &outcome {
        error!("{:#}", e);
    }
    outcome
}

fn init_logging(cli: &Cli) {
    let default = if cli.quiet {
        "hypergan=warn"
    } else {
        match cli.verbose {
            0 => "hypergan=info",
            1 => "hypergan=debug",
            _ => "hypergan=trace",
        }
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if cli.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn train(
    config_path: PathBuf,
    data_dir: Option<PathBuf>,
    synthetic: Option<usize>,
    resume: Option<PathBuf>,
    max_steps: Option<usize>,
) -> Result<()> {
    let mut config = Config::from_file(&config_path).context("Failed to load configuration file")?;
    if resume.is_some() {
        config.training.resume_from = resume;
    }
    if max_steps.is_some() {
        config.training.max_steps = max_steps;
    }
    config.validate()?;
    info!("Configuration loaded from {}", config_path.display());

    let device = utils::select_device(&config.system.device)?;
    let layout = ArchitectureHandler::new().resolve(&config.target)?;
    let source = DataSource::from_args(data_dir, synthetic)?;

    let train_set = source.dataset(&layout, true, config.system.seed)?;
    let test_set = source.dataset(&layout, false, config.system.seed)?;
    info!("Data: {} training / {} test images", train_set.len(), test_set.len());

    let train_loader = DataLoader::new(
        train_set,
        DataLoaderConfig {
            batch_size: config.training.batch_size,
            shuffle: config.training.shuffle,
            drop_last: false,
            seed: config.system.seed,
        },
        device.clone(),
    )?;
    let test_loader = DataLoader::new(
        test_set,
        DataLoaderConfig {
            batch_size: config.training.batch_size,
            shuffle: false,
            drop_last: false,
            seed: config.system.seed,
        },
        device.clone(),
    )?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut trainer = HyperGanTrainer::new(config, device, train_loader, Some(test_loader))
        .context("Failed to initialise trainer")?
        .with_event_monitoring(tx);

    let monitor = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                TrainingEvent::EvaluationCompleted { step, report } => {
                    info!("[eval @ {}] accuracy {:.4}, loss {:.4}", step, report.accuracy, report.loss)
                }
                TrainingEvent::CheckpointSaved { path } => info!("Checkpoint: {}", path.display()),
                TrainingEvent::EpochCompleted { epoch, loss, accuracy } => {
                    info!("Epoch {} done: loss {:.4}, accuracy {:.4}", epoch, loss, accuracy)
                }
                TrainingEvent::Error { error } => warn!("Training error: {}", error),
                other => debug!("{:?}", other),
            }
        }
    });

    let result = trainer.train().await?;
    drop(trainer);
    monitor.await?;

    if !result.success {
        bail!(
            "training failed: {}",
            result.error_message.unwrap_or_else(|| "unknown error".to_string())
        );
    }
    info!(
        "Training finished after {} steps in {:.1}s",
        result.total_steps,
        result.training_duration.as_secs_f64()
    );
    if let Some(eval) = result.final_eval {
        info!("Final test accuracy {:.4}, loss {:.4}", eval.accuracy, eval.loss);
    }
    Ok(())
}

fn evaluate(
    checkpoint: PathBuf,
    data_dir: Option<PathBuf>,
    synthetic: Option<usize>,
    samples: Option<usize>,
) -> Result<()> {
    let mut config = checkpoint_config(&checkpoint)?;
    if let Some(samples) = samples {
        config.training.sample_batch = samples;
    }
    let mut gan = HyperGan::from_checkpoint(config, &checkpoint).context("Failed to restore checkpoint")?;

    let source = DataSource::from_args(data_dir, synthetic)?;
    let config = gan.config().clone();
    let test_set = source.dataset(gan.network().layout(), false, config.system.seed)?;
    let loader = DataLoader::new(
        test_set,
        DataLoaderConfig {
            batch_size: config.training.batch_size,
            shuffle: false,
            drop_last: false,
            seed: config.system.seed,
        },
        gan.device().clone(),
    )?;

    let report = gan.evaluate(&loader)?;
    info!(
        "Accuracy {:.4}, loss {:.4}, best single classifier loss {:.4} ({} classifiers)",
        report.accuracy, report.loss, report.best_sample_loss, report.samples_evaluated
    );
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn sample(checkpoint: Option<PathBuf>, config: Option<PathBuf>, count: usize, output: PathBuf) -> Result<()> {
    let mut gan = match (checkpoint, config) {
        (Some(checkpoint), _) => HyperGan::from_checkpoint(checkpoint_config(&checkpoint)?, &checkpoint)?,
        (None, Some(config)) => HyperGan::new(Config::from_file(&config)?)?,
        (None, None) => {
            warn!("No checkpoint or configuration given; sampling an untrained MedNet hypernetwork");
            HyperGan::new(Config::mednet())?
        }
    };
    gan.export_samples(count, &output)?;
    Ok(())
}

fn config_command(file: Option<PathBuf>, preset: Option<Preset>, output: Option<PathBuf>) -> Result<()> {
    if let (Some(preset), Some(output)) = (preset, output.as_ref()) {
        let config = match preset {
            Preset::Mednet => Config::mednet(),
            Preset::SmallCifar => Config::small_cifar(),
        };
        config.to_file(output)?;
        info!("Preset written to {}", output.display());
        return Ok(());
    }

    let Some(file) = file else {
        bail!("either --file or --preset with --output is required");
    };
    info!("Validating configuration file: {}", file.display());
    let config = Config::from_file(&file).context("Failed to load configuration file")?;
    let layout = ArchitectureHandler::new().resolve(&config.target)?;

    info!("Configuration is valid");
    info!("  - Target: {} ({} classes)", config.target.name(), layout.num_classes);
    info!("  - Latent: noise {} -> {} codes x {}", config.latent.noise_dim, layout.num_layers(), config.latent.code_dim);
    for layer in &layout.layers {
        info!("    {} weight {:?} bias {}", layer.name, layer.weight_shape(), layer.bias);
    }
    info!("  - Generated values per classifier: {}", layout.total_parameters());
    info!("  - Regularizer: {:?} (beta {})", config.discriminator.regularizer, config.discriminator.beta);
    info!(
        "  - Training: {} epochs, batch {}, {} classifiers per step",
        config.training.epochs, config.training.batch_size, config.training.sample_batch
    );
    Ok(())
}

/// Configuration stored alongside a checkpoint
fn checkpoint_config(checkpoint: &Path) -> Result<Config> {
    let metadata = CheckpointMetadata::read(checkpoint)
        .with_context(|| format!("Failed to read checkpoint metadata in {}", checkpoint.display()))?;
    info!("Checkpoint {} at step {}", checkpoint.display(), metadata.step);
    Ok(metadata.config)
}

enum DataSource {
    Cifar(PathBuf),
    Synthetic(usize),
}

impl DataSource {
    fn from_args(data_dir: Option<PathBuf>, synthetic: Option<usize>) -> Result<Self> {
        match (data_dir, synthetic) {
            (Some(dir), _) => Ok(Self::Cifar(dir)),
            (None, Some(n)) if n > 0 => Ok(Self::Synthetic(n)),
            (None, Some(_)) => bail!("--synthetic needs at least one sample"),
            (None, None) => bail!("pass --data-dir or --synthetic N"),
        }
    }

    fn dataset(&self, layout: &TargetLayout, train: bool, seed: u64) -> Result<Arc<dyn Dataset>> {
        match self {
            Self::Cifar(dir) => Ok(Arc::new(Cifar10Dataset::load(dir, train)?)),
            Self::Synthetic(n) => Ok(Arc::new(synthetic_split(*n, layout, train, seed)?)),
        }
    }
}

/// One split of the synthetic problem: both splits share the class templates of `seed`
/// and draw their samples from separate streams; the test split is a fifth of the size
fn synthetic_split(n: usize, layout: &TargetLayout, train: bool, seed: u64) -> Result<SyntheticDataset> {
    let (count, sample_seed) = if train {
        (n, seed.wrapping_add(1))
    } else {
        ((n / 5).max(1), seed.wrapping_add(2))
    };
    SyntheticDataset::with_seeds(count, layout.input, layout.num_classes, 0.5, seed, sample_seed)
}

fn show_system_info() {
    println!("HyperGAN - hypernetwork weight generation");
    println!();
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Target architectures:");
    println!("  mednet       5 generated layers, 3x32x32 input, 10 classes");
    println!("  small_cifar  4 generated layers, batch-statistics conv norm");
    println!("  custom       any conv/linear stack declared in the config");
    println!();
    println!("Hardware support:");

    #[cfg(feature = "cuda")]
    println!("  CUDA: enabled");
    #[cfg(not(feature = "cuda"))]
    println!("  CUDA: not compiled");

    #[cfg(feature = "metal")]
    println!("  Metal: enabled");
    #[cfg(not(feature = "metal"))]
    println!("  Metal: not compiled");

    #[cfg(feature = "accelerate")]
    println!("  Accelerate: enabled");
    #[cfg(not(feature = "accelerate"))]
    println!("  Accelerate: not compiled");

    println!("  CPU: enabled");
    println!();
    println!("Usage:");
    println!("  hypergan config --preset mednet --output mednet.yaml");
    println!("  hypergan train -c mednet.yaml --data-dir cifar-10-batches-bin");
    println!("  hypergan evaluate -k checkpoints/hypergan-00001000 --data-dir cifar-10-batches-bin");
    println!("  hypergan sample -k checkpoints/hypergan-00001000 -n 32 -o ensemble.safetensors");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sq_dist(a: &SyntheticDataset, i: usize, b: &SyntheticDataset, j: usize) -> f32 {
        let x = a.get(i).unwrap().0.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let y = b.get(j).unwrap().0.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        x.iter().zip(&y).map(|(p, q)| (p - q).powi(2)).sum()
    }

    #[test]
    fn synthetic_test_split_matches_training_classes() {
        let layout = ArchitectureHandler::new().resolve(&Config::small_cifar().target).unwrap();
        let train = synthetic_split(50, &layout, true, 8734).unwrap();
        let test = synthetic_split(50, &layout, false, 8734).unwrap();
        assert_eq!(test.len(), 10);

        // sample i has class i % 10 in both splits
        for i in 0..test.len() {
            let same = sq_dist(&test, i, &train, i);
            let other = sq_dist(&test, i, &train, (i + 1) % 10);
            assert!(same < other, "test sample {}: {} vs {}", i, same, other);
        }
    }
}
