/// Pixel-wise cross-entropy for segmentation
use candle_core::{DType, Result, Tensor, D};
use candle_nn::ops;

use crate::data::VOID_LABEL;

/// Cross-entropy between class scores and a label mask, skipping void pixels.
///
/// # Arguments
/// * `scores` - Class scores `[batch, n_class, height, width]`
/// * `target` - Labels `u32 [batch, height, width]`
/// * `size_average` - Divide by the number of labelled pixels instead of summing
///
/// # Returns
/// Scalar loss tensor. With no labelled pixel the loss is zero.
pub fn cross_entropy2d(scores: &Tensor, target: &Tensor, size_average: bool) -> Result<Tensor> {
    let (n, c, h, w) = scores.dims4()?;
    let (tn, th, tw) = target.dims3()?;
    if (tn, th, tw) != (n, h, w) {
        candle_core::bail!(
            "target shape {:?} does not match scores {:?}",
            target.dims(),
            scores.dims()
        );
    }

    // [n, c, h, w] -> [n * h * w, c]
    let log_p = ops::log_softmax(scores, 1)?
        .permute((0, 2, 3, 1))?
        .contiguous()?
        .reshape((n * h * w, c))?;

    let target = target.flatten_all()?.to_dtype(DType::U32)?;
    let valid = target.ne(VOID_LABEL)?;
    // Void pixels gather class 0 and are masked out afterwards
    let safe_target = valid.where_cond(&target, &target.zeros_like()?)?;

    let picked = log_p
        .gather(&safe_target.unsqueeze(1)?, 1)?
        .squeeze(1)?;
    let mask = valid.to_dtype(picked.dtype())?;
    let loss = (picked * &mask)?.sum_all()?.neg()?;

    if size_average {
        let count = mask.sum_all()?.to_dtype(DType::F32)?.to_scalar::<f32>()?;
        if count > 0.0 {
            return loss / count as f64;
        }
    }
    Ok(loss)
}

/// Most likely class per pixel, `u32 [batch, height, width]`
pub fn predict(scores: &Tensor) -> Result<Tensor> {
    scores.argmax(D::Minus(3))?.to_dtype(DType::U32)
}
