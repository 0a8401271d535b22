//! Train the invoice layout classifier.
//!
//! Settings come from an optional JSON file, overridden by flags or their
//! environment variables.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use invoicify_trainer::{
    run_training, DevicePreference, LabelAlignment, LogConfig, Logger, TrainConfig,
};
use tracing::info;

#[derive(Parser)]
#[command(name = "train")]
#[command(about = "Fine-tune the invoice entity classifier")]
#[command(version)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, env = "TRAIN_CONFIG")]
    config: Option<PathBuf>,

    /// Dataset root holding img/, box/ and entities/
    #[arg(long, env = "TRAIN_DIR")]
    train_dir: Option<PathBuf>,

    #[arg(long, env = "BATCH_SIZE")]
    batch_size: Option<usize>,

    /// Number of entity classes
    #[arg(long, env = "NUM_LABELS")]
    num_labels: Option<usize>,

    /// cpu, cuda or metal
    #[arg(long, env = "DEVICE")]
    device: Option<DevicePreference>,

    #[arg(long, env = "LEARNING_RATE")]
    learning_rate: Option<f64>,

    #[arg(long, env = "NUM_EPOCHS")]
    num_epochs: Option<usize>,

    /// Maximum number of documents used
    #[arg(long, env = "MAX_SAMPLES")]
    max_samples: Option<usize>,

    #[arg(long, env = "SEED")]
    seed: Option<u64>,

    /// Checkpoint directory
    #[arg(short, long, env = "OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// Save a checkpoint every N epochs
    #[arg(long, env = "CHECKPOINT_EVERY")]
    checkpoint_every: Option<usize>,

    /// Safetensors file to start from
    #[arg(long, env = "PRETRAINED")]
    pretrained: Option<PathBuf>,

    /// constant or entity-text
    #[arg(long, env = "LABEL_ALIGNMENT")]
    label_alignment: Option<LabelAlignment>,

    /// Log directory
    #[arg(long, env = "LOG_DIR", default_value = "logs")]
    log_dir: PathBuf,

    /// Do not mirror log records on stderr
    #[arg(short, long)]
    quiet: bool,
}

impl Cli {
    fn into_config(self) -> Result<TrainConfig> {
        let mut config = match &self.config {
            Some(path) => TrainConfig::from_file(path)?,
            None => TrainConfig::default(),
        };

        if let Some(dir) = self.train_dir {
            config.train_dir = dir;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(num_labels) = self.num_labels {
            config.num_labels = num_labels;
        }
        if let Some(device) = self.device {
            config.device = device;
        }
        if let Some(lr) = self.learning_rate {
            config.learning_rate = lr;
        }
        if let Some(epochs) = self.num_epochs {
            config.num_epochs = epochs;
        }
        if let Some(max_samples) = self.max_samples {
            config.max_samples = max_samples;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(dir) = self.output_dir {
            config.output_dir = dir;
        }
        if self.checkpoint_every.is_some() {
            config.checkpoint_every = self.checkpoint_every;
        }
        if self.pretrained.is_some() {
            config.pretrained = self.pretrained;
        }
        if let Some(alignment) = self.label_alignment {
            config.label_alignment = alignment;
        }
        Ok(config)
    }
}

fn main() {
    let cli = Cli::parse();
    let log_config = LogConfig::from_env()
        .with_dir(&cli.log_dir)
        .with_console(!cli.quiet);

    let logger = match Logger::new(&log_config) {
        Ok(logger) => logger,
        Err(e) => {
            eprintln!("Failed to initialise logging: {e:#}");
            std::process::exit(1);
        }
    };
    if let Err(e) = logger.install() {
        eprintln!("{e:#}");
    }

    let result = cli.into_config().and_then(|config| {
        info!(config = ?config, "configuration loaded");
        run_training(config)
    });

    match result {
        Ok(report) => {
            println!(
                "Training complete. Model saved to {}",
                report.final_checkpoint.display()
            );
        }
        Err(e) => {
            logger.report(&e);
            eprintln!("Training failed: {e:#}");
            drop(logger);
            std::process::exit(1);
        }
    }
}
