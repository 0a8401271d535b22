//! Training configuration.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Context;
use candle_core::Device;
use invoicify_core::{EncoderConfig, EntityTextLabels, InvoicifyError, LayoutConfig};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Samples used per run unless configured otherwise.
pub const DEFAULT_MAX_SAMPLES: usize = 50;

/// File name of the checkpoint written when training finishes.
pub const FINAL_CHECKPOINT: &str = "layoutlm_invoice.safetensors";

/// Preferred compute device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    Cpu,
    Cuda,
    Metal,
}

impl DevicePreference {
    /// Resolve the preference to a device, falling back to the CPU when the
    /// accelerator is not available.
    pub fn select(self) -> Device {
        match self {
            DevicePreference::Cpu => Device::Cpu,
            DevicePreference::Cuda => match Device::new_cuda(0) {
                Ok(device) => {
                    info!("Using CUDA device 0");
                    device
                }
                Err(e) => {
                    warn!(error = %e, "CUDA unavailable, falling back to CPU");
                    Device::Cpu
                }
            },
            DevicePreference::Metal => match Device::new_metal(0) {
                Ok(device) => {
                    info!("Using Metal device 0");
                    device
                }
                Err(e) => {
                    warn!(error = %e, "Metal unavailable, falling back to CPU");
                    Device::Cpu
                }
            },
        }
    }
}

impl fmt::Display for DevicePreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DevicePreference::Cpu => "cpu",
            DevicePreference::Cuda => "cuda",
            DevicePreference::Metal => "metal",
        };
        f.write_str(name)
    }
}

impl FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(DevicePreference::Cpu),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda),
            "metal" | "mps" => Ok(DevicePreference::Metal),
            other => Err(format!("unknown device {other:?}, expected cpu, cuda or metal")),
        }
    }
}

/// How per-box labels are derived from the entity annotations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LabelAlignment {
    /// Every box gets class 0.
    Constant,
    /// Box text matched against entity values.
    EntityText,
}

impl FromStr for LabelAlignment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "constant" => Ok(LabelAlignment::Constant),
            "entity-text" | "entity_text" => Ok(LabelAlignment::EntityText),
            other => Err(format!(
                "unknown label alignment {other:?}, expected constant or entity-text"
            )),
        }
    }
}

/// Model shape settings that are independent of the label count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub image_size: usize,
    pub patch_size: usize,
    pub hidden_size: usize,
}

impl Default for ModelSettings {
    fn default() -> Self {
        let layout = LayoutConfig::default();
        Self {
            image_size: layout.image_size,
            patch_size: layout.patch_size,
            hidden_size: layout.hidden_size,
        }
    }
}

/// Everything a training run needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Dataset root holding `img/`, `box/` and `entities/`.
    pub train_dir: PathBuf,
    pub batch_size: usize,
    pub num_labels: usize,
    pub device: DevicePreference,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub num_epochs: usize,
    /// Upper bound on the number of documents used.
    pub max_samples: usize,
    /// Seed of the per-epoch shuffle.
    pub seed: u64,
    /// Directory receiving checkpoints.
    pub output_dir: PathBuf,
    /// Write an intermediate checkpoint every this many epochs.
    pub checkpoint_every: Option<usize>,
    /// Safetensors file to initialise the model from.
    pub pretrained: Option<PathBuf>,
    pub label_alignment: LabelAlignment,
    /// Entity names in class order (class `i + 1`) for entity-text alignment.
    pub entity_labels: Vec<String>,
    pub model: ModelSettings,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            train_dir: PathBuf::from("data/train"),
            batch_size: 2,
            num_labels: 5,
            device: DevicePreference::Cuda,
            learning_rate: 5e-5,
            weight_decay: 0.01,
            num_epochs: 3,
            max_samples: DEFAULT_MAX_SAMPLES,
            seed: 42,
            output_dir: PathBuf::from("models"),
            checkpoint_every: None,
            pretrained: None,
            label_alignment: LabelAlignment::Constant,
            entity_labels: ["company", "date", "address", "total"]
                .into_iter()
                .map(String::from)
                .collect(),
            model: ModelSettings::default(),
        }
    }
}

impl TrainConfig {
    /// Create a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON configuration file. Missing keys take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Set the dataset root.
    pub fn with_train_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.train_dir = dir.into();
        self
    }

    /// Set the batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the number of output classes.
    pub fn with_num_labels(mut self, num_labels: usize) -> Self {
        self.num_labels = num_labels;
        self
    }

    /// Set the preferred device.
    pub fn with_device(mut self, device: DevicePreference) -> Self {
        self.device = device;
        self
    }

    /// Set the optimizer learning rate.
    pub fn with_learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    /// Set the number of epochs.
    pub fn with_num_epochs(mut self, num_epochs: usize) -> Self {
        self.num_epochs = num_epochs;
        self
    }

    /// Set the checkpoint directory.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Write intermediate checkpoints every `epochs` epochs.
    pub fn with_checkpoint_every(mut self, epochs: Option<usize>) -> Self {
        self.checkpoint_every = epochs;
        self
    }

    /// Set the label derivation rule.
    pub fn with_label_alignment(mut self, alignment: LabelAlignment) -> Self {
        self.label_alignment = alignment;
        self
    }

    /// Set the model shape.
    pub fn with_model(mut self, model: ModelSettings) -> Self {
        self.model = model;
        self
    }

    /// Layout classifier configuration for this run.
    pub fn layout_config(&self) -> LayoutConfig {
        LayoutConfig {
            image_size: self.model.image_size,
            patch_size: self.model.patch_size,
            hidden_size: self.model.hidden_size,
            num_labels: self.num_labels,
            ..LayoutConfig::default()
        }
    }

    /// Image preprocessing matching the model input size.
    ///
    /// Sizes beyond `u32` saturate; [`validate`](Self::validate) bounds them
    /// well below that.
    pub fn encoder_config(&self) -> EncoderConfig {
        let image_size = u32::try_from(self.model.image_size).unwrap_or(u32::MAX);
        EncoderConfig::default().with_image_size(image_size)
    }

    /// Entity-text aligner over the configured entity names.
    pub fn entity_aligner(&self) -> EntityTextLabels {
        EntityTextLabels::new(self.entity_labels.iter())
    }

    /// Path of the checkpoint written at the end of training.
    pub fn final_checkpoint_path(&self) -> PathBuf {
        self.output_dir.join(FINAL_CHECKPOINT)
    }

    /// Path of the intermediate checkpoint written after `epoch` (1-based).
    pub fn epoch_checkpoint_path(&self, epoch: usize) -> PathBuf {
        self.output_dir
            .join(format!("checkpoint_epoch_{epoch:03}.safetensors"))
    }

    /// Reject settings that cannot produce a training run.
    pub fn validate(&self) -> invoicify_core::Result<()> {
        let invalid = |reason: String| Err(InvoicifyError::InvalidConfig(reason));

        if self.batch_size == 0 {
            return invalid("batch_size must be positive".into());
        }
        if self.num_labels == 0 {
            return invalid("num_labels must be positive".into());
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return invalid(format!(
                "learning_rate must be a positive number, got {}",
                self.learning_rate
            ));
        }
        if self.max_samples == 0 {
            return invalid("max_samples must be positive".into());
        }
        if self.checkpoint_every == Some(0) {
            return invalid("checkpoint_every must be positive when set".into());
        }
        if self.label_alignment == LabelAlignment::EntityText {
            let needed = self.entity_aligner().num_classes();
            if needed > self.num_labels {
                return invalid(format!(
                    "entity-text alignment over {} entities needs at least {needed} labels, got {}",
                    self.entity_labels.len(),
                    self.num_labels
                ));
            }
        }
        self.layout_config()
            .validate()
            .map_err(InvoicifyError::InvalidConfig)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = TrainConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_samples, 50);
        assert_eq!(
            config.final_checkpoint_path(),
            PathBuf::from("models/layoutlm_invoice.safetensors")
        );
    }

    #[test]
    fn builder() {
        let config = TrainConfig::new()
            .with_train_dir("fixtures")
            .with_batch_size(4)
            .with_num_labels(3)
            .with_device(DevicePreference::Cpu)
            .with_learning_rate(1e-3)
            .with_num_epochs(7)
            .with_checkpoint_every(Some(2));

        assert_eq!(config.train_dir, PathBuf::from("fixtures"));
        assert_eq!(config.batch_size, 4);
        assert_eq!(config.layout_config().num_labels, 3);
        assert_eq!(config.num_epochs, 7);
        assert_eq!(
            config.epoch_checkpoint_path(2),
            PathBuf::from("models/checkpoint_epoch_002.safetensors")
        );
    }

    #[test]
    fn validate_rejects_bad_values() {
        assert!(TrainConfig::new().with_batch_size(0).validate().is_err());
        assert!(TrainConfig::new().with_learning_rate(f64::NAN).validate().is_err());
        assert!(TrainConfig::new().with_checkpoint_every(Some(0)).validate().is_err());

        let config = TrainConfig::new()
            .with_num_labels(4)
            .with_label_alignment(LabelAlignment::EntityText);
        assert!(config.validate().is_err());

        let config = TrainConfig::new().with_model(ModelSettings {
            image_size: 100,
            patch_size: 16,
            hidden_size: 8,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_errors_are_config_category() {
        let err = TrainConfig::new().with_batch_size(0).validate().unwrap_err();
        assert!(matches!(err, InvoicifyError::InvalidConfig(_)));
        assert_eq!(err.category(), invoicify_core::ErrorCategory::Config);
        assert_eq!(err.level(), tracing::Level::WARN);

        let err = TrainConfig::new()
            .with_model(ModelSettings {
                image_size: 100,
                patch_size: 16,
                hidden_size: 8,
            })
            .validate()
            .unwrap_err();
        assert_eq!(err.category(), invoicify_core::ErrorCategory::Config);
    }

    #[test]
    fn entity_text_needs_room_for_every_entity() {
        let config = TrainConfig::new().with_label_alignment(LabelAlignment::EntityText);
        assert_eq!(config.entity_aligner().num_classes(), 5);
        assert!(config.clone().with_num_labels(5).validate().is_ok());
        assert!(config.with_num_labels(4).validate().is_err());
    }

    #[test]
    fn oversized_image_is_rejected() {
        let config = TrainConfig::new().with_model(ModelSettings {
            image_size: 1 << 33,
            patch_size: 16,
            hidden_size: 8,
        });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("maximum"));
        assert_eq!(config.encoder_config().image_size, u32::MAX);

        let config = TrainConfig::new().with_model(ModelSettings {
            image_size: 512,
            patch_size: 16,
            hidden_size: 8,
        });
        assert!(config.validate().is_ok());
        assert_eq!(config.encoder_config().image_size, 512);
    }

    #[test]
    fn parse_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.json");
        std::fs::write(
            &path,
            r#"{"train_dir": "data/sroie", "device": "cpu", "num_epochs": 1,
                "label_alignment": "entity-text", "model": {"hidden_size": 32}}"#,
        )
        .unwrap();

        let config = TrainConfig::from_file(&path).unwrap();
        assert_eq!(config.train_dir, PathBuf::from("data/sroie"));
        assert_eq!(config.device, DevicePreference::Cpu);
        assert_eq!(config.label_alignment, LabelAlignment::EntityText);
        assert_eq!(config.model.hidden_size, 32);
        assert_eq!(config.model.image_size, 224);
        assert_eq!(config.batch_size, 2);
    }

    #[test]
    fn parse_device_names() {
        assert_eq!("CUDA".parse::<DevicePreference>(), Ok(DevicePreference::Cuda));
        assert_eq!("cpu".parse::<DevicePreference>(), Ok(DevicePreference::Cpu));
        assert!("tpu".parse::<DevicePreference>().is_err());
        assert_eq!(DevicePreference::Metal.to_string(), "metal");
    }

    #[test]
    fn cpu_preference_selects_cpu() {
        assert!(DevicePreference::Cpu.select().is_cpu());
    }
}
