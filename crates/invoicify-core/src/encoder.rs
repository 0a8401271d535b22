//! # Feature Encoder
//!
//! Turns a [`DocumentSample`] into the fixed-shape tensors consumed by the
//! layout classifier: a normalised pixel grid, box coordinates rescaled to a
//! page-independent `0..=1000` range, and one label id per box.

use candle_core::{Device, Tensor};
use image::imageops::FilterType;

use crate::error::{InvoicifyError, Result};
use crate::types::{BoundingBox, DocumentSample, EncodedExample, BOX_COORDS};

/// Upper bound of normalised box coordinates.
pub const COORD_SCALE: i64 = 1000;

/// Image preprocessing settings.
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderConfig {
    /// Side length of the square pixel grid.
    pub image_size: u32,
    /// Per-channel mean subtracted after scaling to `[0, 1]`.
    pub mean: [f32; 3],
    /// Per-channel standard deviation.
    pub std: [f32; 3],
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            image_size: 224,
            mean: [0.5; 3],
            std: [0.5; 3],
        }
    }
}

impl EncoderConfig {
    /// Set the side length of the pixel grid.
    pub fn with_image_size(mut self, image_size: u32) -> Self {
        self.image_size = image_size;
        self
    }
}

/// Converts documents into model inputs.
#[derive(Debug, Clone)]
pub struct FeatureEncoder {
    config: EncoderConfig,
    device: Device,
}

impl FeatureEncoder {
    /// Create an encoder producing tensors on the CPU.
    pub fn new(config: EncoderConfig) -> Self {
        Self {
            config,
            device: Device::Cpu,
        }
    }

    /// Get the encoder configuration.
    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Encode one document.
    ///
    /// `labels` must hold one class id per box of `sample`, in box order.
    pub fn encode(&self, sample: &DocumentSample, labels: &[u32]) -> Result<EncodedExample> {
        if labels.len() != sample.boxes.len() {
            return Err(InvoicifyError::Encoding(format!(
                "{}: {} labels for {} boxes",
                sample.stem,
                labels.len(),
                sample.boxes.len()
            )));
        }

        let (width, height) = sample.image.dimensions();
        let pixel_values = self.encode_pixels(&sample.image)?;
        let bbox = self.encode_boxes(&sample.boxes, width, height)?;
        let labels: Vec<i64> = labels.iter().map(|&l| i64::from(l)).collect();
        let labels = Tensor::from_vec(labels, sample.boxes.len(), &self.device)?;

        Ok(EncodedExample {
            pixel_values,
            bbox,
            labels,
        })
    }

    /// Resize, scale and normalise an RGB image into a `[3, S, S]` tensor.
    pub fn encode_pixels(&self, image: &image::RgbImage) -> Result<Tensor> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(InvoicifyError::Encoding("image has no pixels".into()));
        }

        let size = self.config.image_size;
        let resized = image::imageops::resize(image, size, size, FilterType::Triangle);

        let side = size as usize;
        let plane = side * side;
        let mut data = vec![0f32; 3 * plane];
        for (i, pixel) in resized.pixels().enumerate() {
            for c in 0..3 {
                let value = f32::from(pixel[c]) / 255.0;
                data[c * plane + i] = (value - self.config.mean[c]) / self.config.std[c];
            }
        }

        Ok(Tensor::from_vec(
            data,
            (3, side, side),
            &self.device,
        )?)
    }

    /// Rescale box corners to `0..=1000` relative to the page size.
    ///
    /// Returns a `[num_boxes, 8]` tensor in the same box order.
    pub fn encode_boxes(&self, boxes: &[BoundingBox], width: u32, height: u32) -> Result<Tensor> {
        if width == 0 || height == 0 {
            return Err(InvoicifyError::Encoding("image has no pixels".into()));
        }

        let mut data = Vec::with_capacity(boxes.len() * BOX_COORDS);
        for bbox in boxes {
            for (i, &coord) in bbox.coords.iter().enumerate() {
                let extent = if i % 2 == 0 { width } else { height };
                data.push(normalize_coord(coord, extent));
            }
        }
        Ok(Tensor::from_vec(data, (boxes.len(), BOX_COORDS), &self.device)?)
    }
}

fn normalize_coord(coord: i64, extent: u32) -> i64 {
    let scaled = (coord as f64 * COORD_SCALE as f64 / f64::from(extent)).round() as i64;
    scaled.clamp(0, COORD_SCALE)
}
