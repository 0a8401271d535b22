//! # Invoicify
//!
//! Train layout-aware entity extraction models for scanned invoices.
//!
//! This crate bundles [`invoicify_core`] (document loading, feature
//! encoding, the classifier) and [`invoicify_trainer`] (batching, the
//! optimisation loop, logging).
//!
//! ```no_run
//! use invoicify::{run_training, DevicePreference, TrainConfig};
//!
//! let config = TrainConfig::new()
//!     .with_train_dir("data/train")
//!     .with_device(DevicePreference::Cpu)
//!     .with_num_epochs(1);
//! let report = run_training(config)?;
//! println!("saved {}", report.final_checkpoint.display());
//! # Ok::<(), anyhow::Error>(())
//! ```

pub use invoicify_core as core;
pub use invoicify_trainer as trainer;

pub use invoicify_core::{
    AlignLabels, BoundingBox, ConstantLabels, EntityTextLabels, InvoiceModel, InvoicifyError,
    SampleStore,
};
pub use invoicify_trainer::{run_training, DevicePreference, TrainConfig, TrainReport, Trainer};
