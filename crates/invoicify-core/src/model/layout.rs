use candle_core::{DType, Result, Tensor, D};
use candle_nn::{Conv2d, Conv2dConfig, Init, Linear, Module, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::encoder::COORD_SCALE;
use crate::types::BOX_COORDS;

use super::loss::token_cross_entropy;

/// Largest accepted page side length, in pixels.
pub const MAX_IMAGE_SIZE: usize = 4096;

/// Shape hyperparameters of the layout classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    /// Side length of the square page image.
    pub image_size: usize,
    /// Side length of one image patch.
    pub patch_size: usize,
    /// Width of patch and box embeddings.
    pub hidden_size: usize,
    /// Number of output classes.
    pub num_labels: usize,
    /// Layer norm epsilon.
    pub layer_norm_eps: f64,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            image_size: 224,
            patch_size: 16,
            hidden_size: 256,
            num_labels: 5,
            layer_norm_eps: 1e-5,
        }
    }
}

impl LayoutConfig {
    /// Number of patches along one side of the image.
    pub fn grid_size(&self) -> usize {
        self.image_size / self.patch_size
    }

    /// Checks that the shape parameters describe a buildable model.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.patch_size == 0 || self.image_size == 0 {
            return Err("image_size and patch_size must be positive".into());
        }
        if self.image_size > MAX_IMAGE_SIZE {
            return Err(format!(
                "image_size {} exceeds the maximum of {MAX_IMAGE_SIZE}",
                self.image_size
            ));
        }
        if self.image_size % self.patch_size != 0 {
            return Err(format!(
                "image_size {} is not a multiple of patch_size {}",
                self.image_size, self.patch_size
            ));
        }
        if self.hidden_size == 0 {
            return Err("hidden_size must be positive".into());
        }
        if self.num_labels == 0 {
            return Err("num_labels must be positive".into());
        }
        Ok(())
    }
}

/// Result of a forward pass.
#[derive(Debug, Clone)]
pub enum ModelOutput {
    /// Scalar training loss, returned when labels are given, with the
    /// logits it was computed from.
    Loss { loss: Tensor, logits: Tensor },
    /// `[batch, num_boxes, num_labels]` class scores.
    Logits(Tensor),
}

/// Box-level token classifier over page pixels and box geometry.
///
/// The page is cut into patches by a strided convolution. Every box embeds
/// its normalised corners, attends over the patches, and the fused
/// representation is classified.
pub struct LayoutClassifier {
    patch_embed: Conv2d,
    box_embed: Linear,
    norm_weight: Tensor,
    norm_bias: Tensor,
    fuse: Linear,
    classifier: Linear,
    config: LayoutConfig,
}

impl LayoutClassifier {
    /// Build the classifier, creating or fetching its weights through `vb`.
    pub fn new(config: LayoutConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_size;
        let patch_embed = candle_nn::conv2d(
            3,
            hidden,
            config.patch_size,
            Conv2dConfig {
                stride: config.patch_size,
                ..Default::default()
            },
            vb.pp("patch_embed"),
        )?;
        let box_embed = candle_nn::linear(BOX_COORDS, hidden, vb.pp("box_embed"))?;
        let norm_weight = vb.pp("norm").get_with_hints(hidden, "weight", Init::Const(1.0))?;
        let norm_bias = vb.pp("norm").get_with_hints(hidden, "bias", Init::Const(0.0))?;
        let fuse = candle_nn::linear(hidden, hidden, vb.pp("fuse"))?;
        // Named like a Hugging Face token classification head.
        let classifier = candle_nn::linear(hidden, config.num_labels, vb.pp("classifier"))?;

        Ok(Self {
            patch_embed,
            box_embed,
            norm_weight,
            norm_bias,
            fuse,
            classifier,
            config,
        })
    }

    /// Get the model configuration.
    pub fn config(&self) -> &LayoutConfig {
        &self.config
    }

    /// Class scores for every box.
    ///
    /// `pixel_values`: `[batch, 3, S, S]` f32
    /// `bbox`: `[batch, num_boxes, 8]` integer coordinates in `0..=1000`
    pub fn logits(&self, pixel_values: &Tensor, bbox: &Tensor) -> Result<Tensor> {
        // [batch, hidden, grid, grid] -> [batch, patches, hidden]
        let patches = self
            .patch_embed
            .forward(pixel_values)?
            .flatten_from(2)?
            .transpose(1, 2)?
            .contiguous()?;

        let coords = bbox
            .to_dtype(DType::F32)?
            .affine(1.0 / COORD_SCALE as f64, 0.0)?;
        let queries = self.box_embed.forward(&coords)?;

        let scale = (self.config.hidden_size as f64).sqrt();
        let scores = queries
            .matmul(&patches.transpose(1, 2)?.contiguous()?)?
            .affine(1.0 / scale, 0.0)?;
        let attention = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let context = attention.matmul(&patches)?;

        let hidden = self.layer_norm(&queries.add(&context)?)?;
        let hidden = self.fuse.forward(&hidden)?.gelu()?;
        self.classifier.forward(&hidden)
    }

    // Composed from primitive ops so that gradients flow through it.
    fn layer_norm(&self, x: &Tensor) -> Result<Tensor> {
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let variance = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let std = (variance + self.config.layer_norm_eps)?.sqrt()?;
        centered
            .broadcast_div(&std)?
            .broadcast_mul(&self.norm_weight)?
            .broadcast_add(&self.norm_bias)
    }

    /// Loss when `labels` is given, logits otherwise.
    pub fn forward(
        &self,
        pixel_values: &Tensor,
        bbox: &Tensor,
        labels: Option<&Tensor>,
    ) -> Result<ModelOutput> {
        let logits = self.logits(pixel_values, bbox)?;
        match labels {
            Some(labels) => {
                let loss = token_cross_entropy(&logits, labels)?;
                Ok(ModelOutput::Loss { loss, logits })
            }
            None => Ok(ModelOutput::Logits(logits)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn tiny_config() -> LayoutConfig {
        LayoutConfig {
            image_size: 16,
            patch_size: 8,
            hidden_size: 8,
            num_labels: 3,
            ..Default::default()
        }
    }

    fn inputs(device: &Device) -> (Tensor, Tensor) {
        let pixels = Tensor::zeros((2, 3, 16, 16), DType::F32, device).unwrap();
        let bbox = Tensor::new(
            &[
                [[0i64, 0, 500, 0, 500, 500, 0, 500], [500, 500, 1000, 500, 1000, 1000, 500, 1000]],
                [[0, 0, 10, 0, 10, 10, 0, 10], [0, 0, 0, 0, 0, 0, 0, 0]],
            ],
            device,
        )
        .unwrap();
        (pixels, bbox)
    }

    #[test]
    fn logits_shape() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = LayoutClassifier::new(tiny_config(), vb).unwrap();

        let (pixels, bbox) = inputs(&device);
        match model.forward(&pixels, &bbox, None).unwrap() {
            ModelOutput::Logits(logits) => assert_eq!(logits.dims(), &[2, 2, 3]),
            ModelOutput::Loss { .. } => panic!("expected logits"),
        }
    }

    #[test]
    fn loss_is_finite_scalar() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = LayoutClassifier::new(tiny_config(), vb).unwrap();

        let (pixels, bbox) = inputs(&device);
        let labels = Tensor::new(&[[0i64, 2], [1, -100]], &device).unwrap();
        match model.forward(&pixels, &bbox, Some(&labels)).unwrap() {
            ModelOutput::Loss { loss, logits } => {
                assert!(loss.dims().is_empty());
                assert_eq!(logits.dims(), &[2, 2, 3]);
                assert!(loss.to_scalar::<f32>().unwrap().is_finite());
            }
            ModelOutput::Logits(_) => panic!("expected loss"),
        }
    }

    #[test]
    fn validate_config() {
        assert!(LayoutConfig::default().validate().is_ok());
        let bad = LayoutConfig {
            image_size: 20,
            patch_size: 8,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let huge = LayoutConfig {
            image_size: 65536 * 2,
            patch_size: 16,
            ..Default::default()
        };
        assert!(huge.validate().unwrap_err().contains("maximum"));
        assert_eq!(tiny_config().grid_size(), 2);
    }
}
