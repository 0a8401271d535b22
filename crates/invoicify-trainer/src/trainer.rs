//! Training loop for the layout classifier.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use candle_core::Device;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use invoicify_core::{token_accuracy, InvoiceModel, InvoicifyError, ModelOutput};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::{LabelAlignment, TrainConfig};
use crate::data::{Batch, BatchLoader, InvoiceDataset};

/// Outcome of a completed run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TrainReport {
    /// Mean loss of each epoch, in order.
    pub epoch_losses: Vec<f32>,
    /// Mean per-box accuracy of each epoch, measured before each update.
    pub epoch_accuracies: Vec<f32>,
    /// Optimizer steps taken.
    pub steps: usize,
    /// Intermediate checkpoints written.
    pub checkpoints: Vec<PathBuf>,
    pub final_checkpoint: PathBuf,
}

/// Loss and accuracy averaged over the batches of one epoch, or taken from
/// a single step.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StepMetrics {
    pub loss: f32,
    pub accuracy: f32,
}

pub struct Trainer {
    config: TrainConfig,
    dataset: InvoiceDataset,
    loader: BatchLoader,
    model: InvoiceModel,
    optimizer: AdamW,
    device: Device,
    steps: usize,
}

impl Trainer {
    /// Open the dataset named by `config` and set up model and optimizer.
    pub fn new(config: TrainConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let dataset = InvoiceDataset::open(
            &config.train_dir,
            config.encoder_config(),
            config.num_labels,
            config.max_samples,
        )?;
        let dataset = match config.label_alignment {
            LabelAlignment::Constant => dataset,
            LabelAlignment::EntityText => {
                let aligner = config.entity_aligner();
                dataset.with_aligner(aligner)
            }
        };
        Self::with_dataset(config, dataset)
    }

    /// Train on an already assembled dataset.
    ///
    /// The dataset must check labels against the configured label count and
    /// encode pages at the configured image size.
    pub fn with_dataset(config: TrainConfig, dataset: InvoiceDataset) -> anyhow::Result<Self> {
        config.validate()?;
        if dataset.num_labels() != config.num_labels {
            return Err(InvoicifyError::InvalidConfig(format!(
                "dataset checks labels against {} classes but the model has {}",
                dataset.num_labels(),
                config.num_labels
            ))
            .into());
        }
        let image_size = config.encoder_config().image_size;
        if dataset.encoder_config().image_size != image_size {
            return Err(InvoicifyError::InvalidConfig(format!(
                "dataset encodes {}px pages but the model expects {image_size}px",
                dataset.encoder_config().image_size
            ))
            .into());
        }
        if dataset.is_empty() {
            return Err(InvoicifyError::EmptyDataset {
                path: dataset.store().root().to_path_buf(),
            }
            .into());
        }

        let device = config.device.select();
        let model = match &config.pretrained {
            Some(weights) => InvoiceModel::from_pretrained(config.layout_config(), weights, &device)?,
            None => InvoiceModel::new(config.layout_config(), &device)?,
        };
        let optimizer = AdamW::new(
            model.trainable_vars(),
            ParamsAdamW {
                lr: config.learning_rate,
                weight_decay: config.weight_decay,
                ..Default::default()
            },
        )
        .map_err(InvoicifyError::from)
        .context("failed to create optimizer")?;
        let loader = BatchLoader::new(dataset.len(), config.batch_size, config.seed);

        info!(
            samples = dataset.len(),
            parameters = model.num_parameters(),
            device = ?device,
            "trainer ready"
        );

        Ok(Self {
            config,
            dataset,
            loader,
            model,
            optimizer,
            device,
            steps: 0,
        })
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn model(&self) -> &InvoiceModel {
        &self.model
    }

    pub fn dataset(&self) -> &InvoiceDataset {
        &self.dataset
    }

    /// Optimizer steps taken so far.
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Run every epoch, then write the final checkpoint.
    pub fn train(&mut self) -> anyhow::Result<TrainReport> {
        let num_epochs = self.config.num_epochs;
        info!(
            epochs = num_epochs,
            batch_size = self.config.batch_size,
            batches_per_epoch = self.loader.num_batches(),
            lr = self.config.learning_rate,
            "starting training"
        );

        let mut report = TrainReport::default();
        for epoch in 0..num_epochs {
            let metrics = self.train_epoch(epoch)?;
            println!(
                "Epoch {}, Loss: {:.4}, Accuracy: {:.2}%",
                epoch + 1,
                metrics.loss,
                metrics.accuracy * 100.0
            );
            info!(
                epoch = epoch + 1,
                loss = metrics.loss,
                accuracy = metrics.accuracy,
                "epoch complete"
            );
            report.epoch_losses.push(metrics.loss);
            report.epoch_accuracies.push(metrics.accuracy);

            if self
                .config
                .checkpoint_every
                .is_some_and(|every| (epoch + 1) % every == 0)
            {
                let path = self.config.epoch_checkpoint_path(epoch + 1);
                self.save_checkpoint(&path)?;
                report.checkpoints.push(path);
            }
        }

        let final_checkpoint = self.config.final_checkpoint_path();
        self.save_checkpoint(&final_checkpoint)?;
        info!(path = %final_checkpoint.display(), steps = self.steps, "training complete");

        report.steps = self.steps;
        report.final_checkpoint = final_checkpoint;
        Ok(report)
    }

    /// One pass over the shuffled dataset; returns the mean batch metrics.
    pub fn train_epoch(&mut self, epoch: usize) -> anyhow::Result<StepMetrics> {
        self.loader.reshuffle(epoch);

        let mut total = StepMetrics::default();
        let mut batches = 0usize;
        while let Some(batch) = self
            .loader
            .next_batch(&self.dataset)
            .with_context(|| format!("failed to load batch in epoch {}", epoch + 1))?
        {
            let step = self.train_step(&batch)?;
            total.loss += step.loss;
            total.accuracy += step.accuracy;
            batches += 1;
        }

        if batches > 0 {
            total.loss /= batches as f32;
            total.accuracy /= batches as f32;
        }
        Ok(total)
    }

    /// Forward, backward and one optimizer update on `batch`.
    ///
    /// Gradients are computed fresh for every step.
    pub fn train_step(&mut self, batch: &Batch) -> anyhow::Result<StepMetrics> {
        let batch = batch.to_device(&self.device).map_err(InvoicifyError::from)?;
        let (loss, logits) = match self
            .model
            .forward(&batch.pixel_values, &batch.bbox, Some(&batch.labels))?
        {
            ModelOutput::Loss { loss, logits } => (loss, logits),
            ModelOutput::Logits(_) => bail!("model returned logits for a labelled batch"),
        };

        let value = loss.to_scalar::<f32>().map_err(InvoicifyError::from)?;
        if !value.is_finite() {
            return Err(InvoicifyError::NonFiniteLoss {
                loss: value,
                step: self.steps,
            }
            .into());
        }

        let accuracy = token_accuracy(&logits, &batch.labels).map_err(InvoicifyError::from)?;

        let grads = loss.backward().map_err(InvoicifyError::from)?;
        self.optimizer.step(&grads).map_err(InvoicifyError::from)?;
        self.steps += 1;
        debug!(step = self.steps, loss = value, accuracy, docs = batch.len(), "optimizer step");
        Ok(StepMetrics {
            loss: value,
            accuracy,
        })
    }

    /// Write every model parameter to `path`.
    pub fn save_checkpoint(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        self.model
            .save(path)
            .with_context(|| format!("failed to save checkpoint {}", path.display()))?;
        info!(path = %path.display(), "checkpoint saved");
        Ok(())
    }
}
