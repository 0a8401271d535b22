//! # Invoicify Trainer
//!
//! Dataset assembly, batching and the optimisation loop that fits the
//! layout classifier from `invoicify-core` to a directory of scanned
//! invoices, plus the logging stack used by the `train` binary.

pub mod config;
pub mod data;
pub mod logging;
pub mod trainer;

pub use config::{DevicePreference, LabelAlignment, ModelSettings, TrainConfig};
pub use data::{Batch, BatchLoader, InvoiceDataset};
pub use logging::{LogConfig, Logger};
pub use trainer::{TrainReport, Trainer};

/// Build a trainer from `config` and run it to completion.
pub fn run_training(config: TrainConfig) -> anyhow::Result<TrainReport> {
    let mut trainer = Trainer::new(config)?;
    trainer.train()
}
