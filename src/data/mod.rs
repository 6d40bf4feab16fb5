/// Data loading for segmentation training
pub mod numpy_dataset;

pub use numpy_dataset::{DatasetMetadata, NumpySegDataset, SegDataLoader};

use candle_core::{Device, Result, Tensor};

/// Reserved label value for pixels excluded from the loss and the metrics
pub const VOID_LABEL: u32 = 255;

/// Finite, restartable source of `(image, label)` batches
///
/// Images are `f32 [batch, channels, height, width]`, labels `u32 [batch, height, width]`
/// with [`VOID_LABEL`] marking unlabeled pixels.
pub trait SegmentationLoader {
    /// Get next batch, `None` once the epoch is exhausted
    fn next_batch(&mut self, device: &Device) -> Result<Option<(Tensor, Tensor)>>;

    /// Restart from the beginning (re-shuffling if enabled)
    fn reset(&mut self);

    /// Get total number of batches per epoch
    fn num_batches(&self) -> usize;

    /// Get total number of examples
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
