//! Dataset assembly and batching for layout training.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use invoicify_core::{
    AlignLabels, ConstantLabels, EncodedExample, EncoderConfig, FeatureEncoder, InvoicifyError,
    SampleStore, BOX_COORDS, IGNORE_INDEX,
};

/// Capped, index-addressable view over the documents of a dataset root.
///
/// Every access re-reads and re-encodes the document; nothing is cached.
pub struct InvoiceDataset {
    store: SampleStore,
    encoder: FeatureEncoder,
    aligner: Box<dyn AlignLabels>,
    max_samples: usize,
    num_labels: usize,
}

impl InvoiceDataset {
    /// Open the dataset under `root`, labelling every box with class 0.
    pub fn open(
        root: impl AsRef<Path>,
        encoder: EncoderConfig,
        num_labels: usize,
        max_samples: usize,
    ) -> invoicify_core::Result<Self> {
        Ok(Self {
            store: SampleStore::open(root)?,
            encoder: FeatureEncoder::new(encoder),
            aligner: Box::new(ConstantLabels::default()),
            max_samples,
            num_labels,
        })
    }

    /// Replace the box → label rule.
    pub fn with_aligner(mut self, aligner: impl AlignLabels + 'static) -> Self {
        self.aligner = Box::new(aligner);
        self
    }

    /// Number of usable samples: all paired documents, truncated to the cap.
    pub fn len(&self) -> usize {
        self.store.len().min(self.max_samples)
    }

    /// Returns `true` when there is nothing to train on.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of classes labels are checked against.
    pub fn num_labels(&self) -> usize {
        self.num_labels
    }

    /// Preprocessing applied to every page.
    pub fn encoder_config(&self) -> &EncoderConfig {
        self.encoder.config()
    }

    /// Underlying store.
    pub fn store(&self) -> &SampleStore {
        &self.store
    }

    /// Load, label and encode the sample at `index`.
    pub fn get(&self, index: usize) -> invoicify_core::Result<EncodedExample> {
        let len = self.len();
        if index >= len {
            return Err(InvoicifyError::IndexOutOfRange { index, len });
        }

        let sample = self.store.load(index)?;
        let labels = self.aligner.align(&sample.boxes, &sample.entities);
        if let Some(&label) = labels.iter().find(|&&l| l as usize >= self.num_labels) {
            return Err(InvoicifyError::LabelOutOfRange {
                label,
                num_labels: self.num_labels,
            });
        }
        self.encoder.encode(&sample, &labels)
    }
}

/// A stack of encoded examples padded to a common box count.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `[batch, 3, S, S]`
    pub pixel_values: Tensor,
    /// `[batch, max_boxes, 8]`, padded with zero boxes.
    pub bbox: Tensor,
    /// `[batch, max_boxes]`, padded with [`IGNORE_INDEX`].
    pub labels: Tensor,
}

impl Batch {
    /// Stack examples, padding shorter box lists.
    ///
    /// The padded box count is at least 1 so that documents without boxes
    /// still form a valid input.
    pub fn collate(examples: &[EncodedExample]) -> candle_core::Result<Self> {
        let max_boxes = examples
            .iter()
            .map(EncodedExample::num_boxes)
            .max()
            .unwrap_or(0)
            .max(1);

        let mut pixels = Vec::with_capacity(examples.len());
        let mut boxes = Vec::with_capacity(examples.len());
        let mut labels = Vec::with_capacity(examples.len());
        for example in examples {
            let device = example.labels.device();
            let pad = max_boxes - example.num_boxes();
            pixels.push(example.pixel_values.clone());
            if pad == 0 {
                boxes.push(example.bbox.clone());
                labels.push(example.labels.clone());
            } else if pad == max_boxes {
                boxes.push(Tensor::zeros((max_boxes, BOX_COORDS), DType::I64, device)?);
                labels.push(Tensor::full(IGNORE_INDEX, max_boxes, device)?);
            } else {
                boxes.push(example.bbox.pad_with_zeros(0, 0, pad)?);
                let padding = Tensor::full(IGNORE_INDEX, pad, device)?;
                labels.push(Tensor::cat(&[&example.labels, &padding], 0)?);
            }
        }

        Ok(Self {
            pixel_values: Tensor::stack(&pixels, 0)?,
            bbox: Tensor::stack(&boxes, 0)?,
            labels: Tensor::stack(&labels, 0)?,
        })
    }

    /// Number of documents in the batch.
    pub fn len(&self) -> usize {
        self.pixel_values.dims().first().copied().unwrap_or(0)
    }

    /// Returns `true` for a batch without documents.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy all tensors to `device`.
    pub fn to_device(&self, device: &Device) -> candle_core::Result<Self> {
        Ok(Self {
            pixel_values: self.pixel_values.to_device(device)?,
            bbox: self.bbox.to_device(device)?,
            labels: self.labels.to_device(device)?,
        })
    }
}

/// Walks a dataset in shuffled fixed-size batches.
///
/// Each epoch uses its own permutation derived from the base seed, so runs
/// with the same seed see the same batch order.
pub struct BatchLoader {
    indices: Vec<usize>,
    batch_size: usize,
    seed: u64,
    pos: usize,
}

impl BatchLoader {
    pub fn new(len: usize, batch_size: usize, seed: u64) -> Self {
        Self {
            indices: (0..len).collect(),
            batch_size: batch_size.max(1),
            seed,
            pos: 0,
        }
    }

    /// Number of batches per epoch, the last one possibly short.
    pub fn num_batches(&self) -> usize {
        self.indices.len().div_ceil(self.batch_size)
    }

    /// Reshuffle for a new epoch.
    ///
    /// The permutation depends only on the seed and `epoch`.
    pub fn reshuffle(&mut self, epoch: usize) {
        let len = self.indices.len();
        self.indices.clear();
        self.indices.extend(0..len);
        let mut rng = oorandom::Rand64::new(u128::from(self.seed.wrapping_add(epoch as u64)));
        for i in (1..self.indices.len()).rev() {
            let j = rng.rand_range(0..(i as u64 + 1)) as usize;
            self.indices.swap(i, j);
        }
        self.pos = 0;
    }

    /// Sample indices of the next batch, or `None` when the epoch is over.
    pub fn next_indices(&mut self) -> Option<&[usize]> {
        if self.pos >= self.indices.len() {
            return None;
        }
        let start = self.pos;
        self.pos = (start + self.batch_size).min(self.indices.len());
        Some(&self.indices[start..self.pos])
    }

    /// Load and collate the next batch from `dataset`.
    pub fn next_batch(
        &mut self,
        dataset: &InvoiceDataset,
    ) -> invoicify_core::Result<Option<Batch>> {
        let Some(indices) = self.next_indices() else {
            return Ok(None);
        };
        let examples = indices
            .iter()
            .map(|&i| dataset.get(i))
            .collect::<invoicify_core::Result<Vec<_>>>()?;
        Ok(Some(Batch::collate(&examples)?))
    }
}
