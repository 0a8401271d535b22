//! # Layout Model
//!
//! Owns the trainable variables of the [`LayoutClassifier`] and handles
//! initialisation from a pretrained checkpoint and serialization.

pub mod layout;
pub mod loss;

use std::path::Path;

use candle_core::{DType, Device, Tensor, Var, D};
use candle_nn::{VarBuilder, VarMap};
use tracing::{debug, info, warn};

use crate::error::{InvoicifyError, Result};

pub use layout::{LayoutClassifier, LayoutConfig, ModelOutput, MAX_IMAGE_SIZE};
pub use loss::{token_accuracy, token_cross_entropy, IGNORE_INDEX};

/// Variables under this prefix form the task head and may be re-initialised
/// when a pretrained checkpoint was trained for a different label count.
const HEAD_PREFIX: &str = "classifier.";

/// Trainable invoice entity classifier.
pub struct InvoiceModel {
    varmap: VarMap,
    classifier: LayoutClassifier,
    device: Device,
}

impl InvoiceModel {
    /// Create a freshly initialised model for `config.num_labels` classes.
    pub fn new(config: LayoutConfig, device: &Device) -> Result<Self> {
        config.validate().map_err(InvoicifyError::InvalidConfig)?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let classifier = LayoutClassifier::new(config, vb)?;

        Ok(Self {
            varmap,
            classifier,
            device: device.clone(),
        })
    }

    /// Create a model and copy pretrained weights from a safetensors file.
    ///
    /// Every backbone tensor must be present with a matching shape. Head
    /// tensors that are missing or shaped for another label count keep
    /// their fresh initialisation.
    pub fn from_pretrained(
        config: LayoutConfig,
        weights: impl AsRef<Path>,
        device: &Device,
    ) -> Result<Self> {
        let weights = weights.as_ref();
        let model = Self::new(config, device)?;
        let pretrained = candle_core::safetensors::load(weights, device)
            .map_err(|e| InvoicifyError::ModelLoad(format!("{}: {e}", weights.display())))?;

        let data = model
            .varmap
            .data()
            .lock()
            .map_err(|_| InvoicifyError::ModelLoad("variable map lock poisoned".into()))?;
        let mut loaded = 0usize;
        for (name, var) in data.iter() {
            match pretrained.get(name) {
                Some(tensor) if tensor.dims() == var.dims() => {
                    var.set(&tensor.to_dtype(var.dtype())?)?;
                    loaded += 1;
                }
                _ if name.starts_with(HEAD_PREFIX) => {
                    warn!(tensor = %name, "classifier head not found in checkpoint, keeping fresh weights");
                }
                Some(tensor) => {
                    return Err(InvoicifyError::ModelLoad(format!(
                        "{name}: checkpoint shape {:?} does not match {:?}",
                        tensor.dims(),
                        var.dims()
                    )));
                }
                None => {
                    return Err(InvoicifyError::ModelLoad(format!(
                        "{name} missing from {}",
                        weights.display()
                    )));
                }
            }
        }
        drop(data);

        info!(path = %weights.display(), tensors = loaded, "loaded pretrained weights");
        Ok(model)
    }

    /// Get the model configuration.
    pub fn config(&self) -> &LayoutConfig {
        self.classifier.config()
    }

    /// Device holding the parameters.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// All trainable variables, for binding an optimizer.
    pub fn trainable_vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    /// Total number of scalar parameters.
    pub fn num_parameters(&self) -> usize {
        self.varmap
            .all_vars()
            .iter()
            .map(|v| v.as_tensor().elem_count())
            .sum()
    }

    /// Forward pass: loss with labels, logits without.
    pub fn forward(
        &self,
        pixel_values: &Tensor,
        bbox: &Tensor,
        labels: Option<&Tensor>,
    ) -> Result<ModelOutput> {
        Ok(self.classifier.forward(pixel_values, bbox, labels)?)
    }

    /// Most likely class per box, `[batch, num_boxes]`.
    pub fn predict(&self, pixel_values: &Tensor, bbox: &Tensor) -> Result<Vec<Vec<u32>>> {
        let logits = self.classifier.logits(pixel_values, bbox)?;
        Ok(logits.argmax(D::Minus1)?.to_vec2::<u32>()?)
    }

    /// Write every parameter to a safetensors file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        self.varmap.save(path)?;
        debug!(path = %path.display(), "saved model parameters");
        Ok(())
    }
}
