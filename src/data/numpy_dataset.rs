/// NumPy segmentation dataset loader (.npy format)
use candle_core::{Device, Result, Tensor};
use ndarray::{s, Array3, Array4};
use ndarray_npy::ReadNpyExt;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use super::VOID_LABEL;

/// Metadata from dataset.json
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatasetMetadata {
    pub n_class: usize,
    #[serde(default)]
    pub class_names: Vec<String>,
    #[serde(default)]
    pub description: String,
}

/// Pre-transformed images and label masks
pub struct NumpySegDataset {
    images: Array4<f32>, // [N, C, H, W]
    labels: Array3<u32>, // [N, H, W]
    metadata: DatasetMetadata,
}

impl NumpySegDataset {
    /// Load a split from `<root>/<split>/{images,labels}.npy` and optional `dataset.json`.
    ///
    /// Label values that are negative or not below `n_class` become [`VOID_LABEL`].
    pub fn from_directory<P: AsRef<Path>>(
        root: P,
        split: &str,
        n_class: usize,
    ) -> crate::Result<Self> {
        let dir = root.as_ref().join(split);

        log::info!("Loading segmentation split from: {:?}", dir);

        let metadata_path = dir.join("dataset.json");
        let metadata: DatasetMetadata = if metadata_path.exists() {
            let file = File::open(&metadata_path)?;
            let reader = BufReader::new(file);
            serde_json::from_reader(reader)?
        } else {
            log::warn!("dataset.json not found, using n_class={}", n_class);
            DatasetMetadata {
                n_class,
                class_names: Vec::new(),
                description: split.to_string(),
            }
        };

        if metadata.n_class != n_class {
            return Err(crate::FcnError::Config(format!(
                "dataset declares {} classes, model expects {}",
                metadata.n_class, n_class
            )));
        }

        let images_path = dir.join("images.npy");
        let images = <Array4<f32> as ReadNpyExt>::read_npy(File::open(&images_path)?)
            .map_err(|e| std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Failed to read images.npy: {}", e)
            ))?;

        // Python saves integer labels as i64
        let labels_path = dir.join("labels.npy");
        let labels_i64 = <Array3<i64> as ReadNpyExt>::read_npy(File::open(&labels_path)?)
            .map_err(|e| std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Failed to read labels.npy: {}", e)
            ))?;

        Self::from_arrays(images, labels_i64, metadata)
    }

    /// Build from in-memory arrays
    pub fn from_arrays(
        images: Array4<f32>,
        labels: Array3<i64>,
        metadata: DatasetMetadata,
    ) -> crate::Result<Self> {
        let (n, _, h, w) = images.dim();
        if labels.dim() != (n, h, w) {
            return Err(crate::FcnError::Config(format!(
                "Shape mismatch: images {:?} vs labels {:?}",
                images.shape(),
                labels.shape()
            )));
        }

        let n_class = metadata.n_class as i64;
        let labels = labels.mapv(|x| {
            if x < 0 || x >= n_class {
                VOID_LABEL
            } else {
                x as u32
            }
        });

        log::info!(
            "Dataset loaded: {} examples, {}x{}, n_class={}",
            n,
            h,
            w,
            metadata.n_class
        );

        Ok(Self {
            images,
            labels,
            metadata,
        })
    }

    /// Get number of examples
    pub fn len(&self) -> usize {
        self.images.dim().0
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get metadata
    pub fn metadata(&self) -> &DatasetMetadata {
        &self.metadata
    }

    /// `(channels, height, width)` of every image
    pub fn image_dims(&self) -> (usize, usize, usize) {
        let (_, c, h, w) = self.images.dim();
        (c, h, w)
    }
}

/// Batching loader over a [`NumpySegDataset`]
pub struct SegDataLoader {
    dataset: NumpySegDataset,
    batch_size: usize,
    current_idx: usize,
    indices: Vec<usize>,
    shuffle: bool,
    rng: StdRng,
}

impl SegDataLoader {
    /// Create new data loader; `seed` drives the per-epoch shuffle.
    pub fn new(dataset: NumpySegDataset, batch_size: usize, shuffle: bool, seed: u64) -> Self {
        let indices: Vec<usize> = (0..dataset.len()).collect();

        let mut loader = Self {
            dataset,
            batch_size: batch_size.max(1),
            current_idx: 0,
            indices,
            shuffle,
            rng: StdRng::seed_from_u64(seed),
        };
        if shuffle {
            loader.indices.shuffle(&mut loader.rng);
        }
        loader
    }

    /// Get next batch (images, labels)
    pub fn next_batch(&mut self, device: &Device) -> Result<Option<(Tensor, Tensor)>> {
        if self.current_idx >= self.indices.len() {
            return Ok(None);
        }

        let end_idx = (self.current_idx + self.batch_size).min(self.indices.len());
        let batch_indices = &self.indices[self.current_idx..end_idx];
        let actual_batch_size = batch_indices.len();
        let (c, h, w) = self.dataset.image_dims();

        let mut image_data = Vec::with_capacity(actual_batch_size * c * h * w);
        let mut label_data = Vec::with_capacity(actual_batch_size * h * w);

        for &idx in batch_indices {
            image_data.extend(self.dataset.images.slice(s![idx, .., .., ..]).iter().copied());
            label_data.extend(self.dataset.labels.slice(s![idx, .., ..]).iter().copied());
        }

        self.current_idx = end_idx;

        let images = Tensor::from_vec(image_data, (actual_batch_size, c, h, w), device)?;
        let labels = Tensor::from_vec(label_data, (actual_batch_size, h, w), device)?;

        Ok(Some((images, labels)))
    }

    /// Reset loader for new epoch
    pub fn reset(&mut self) {
        self.current_idx = 0;

        if self.shuffle {
            self.indices.shuffle(&mut self.rng);
        }
    }

    /// Get number of batches
    pub fn num_batches(&self) -> usize {
        (self.dataset.len() + self.batch_size - 1) / self.batch_size
    }

    /// Get dataset reference
    pub fn dataset(&self) -> &NumpySegDataset {
        &self.dataset
    }
}

impl super::SegmentationLoader for SegDataLoader {
    fn next_batch(&mut self, device: &Device) -> Result<Option<(Tensor, Tensor)>> {
        SegDataLoader::next_batch(self, device)
    }

    fn reset(&mut self) {
        SegDataLoader::reset(self)
    }

    fn num_batches(&self) -> usize {
        SegDataLoader::num_batches(self)
    }

    fn len(&self) -> usize {
        self.dataset.len()
    }
}
