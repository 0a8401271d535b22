use candle_core::{DType, Result, Tensor, D};

/// Label value marking padded boxes that do not contribute to the loss.
pub const IGNORE_INDEX: i64 = -100;

/// Mean cross-entropy over every box whose label is not [`IGNORE_INDEX`].
///
/// `logits`: `[batch, num_boxes, num_labels]`, `labels`: `[batch, num_boxes]` i64.
/// Returns a scalar; `0` when every box is ignored.
pub fn token_cross_entropy(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let num_labels = logits.dim(D::Minus1)?;
    let logits = logits.reshape(((), num_labels))?;
    let labels = labels.flatten_all()?;

    let mask = labels.ge(0i64)?;
    let safe_labels = mask.where_cond(&labels, &labels.zeros_like()?)?;

    let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
    let picked = log_probs
        .gather(&safe_labels.unsqueeze(1)?, 1)?
        .squeeze(1)?;

    let weights = mask.to_dtype(picked.dtype())?;
    let total = picked.mul(&weights)?.sum_all()?.neg()?;
    let count = weights.sum_all()?.maximum(1.0)?;
    total.div(&count)
}

/// Fraction of non-ignored boxes whose argmax matches the label.
pub fn token_accuracy(logits: &Tensor, labels: &Tensor) -> Result<f32> {
    let predictions = logits.argmax(D::Minus1)?.to_dtype(DType::I64)?;
    let labels = labels.flatten_all()?;
    let predictions = predictions.flatten_all()?;

    let mask = labels.ge(0i64)?.to_dtype(DType::F32)?;
    let hits = predictions.eq(&labels)?.to_dtype(DType::F32)?.mul(&mask)?;

    let count = mask.sum_all()?.to_scalar::<f32>()?;
    if count == 0.0 {
        return Ok(0.0);
    }
    Ok(hits.sum_all()?.to_scalar::<f32>()? / count)
}
