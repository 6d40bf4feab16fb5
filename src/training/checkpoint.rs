/// Training checkpoints with safetensors
///
/// One file holds the model parameters (`model.*`), the optimizer momentum
/// buffers (`optim.momentum.*`) and a JSON [`CheckpointMetadata`] record stored
/// in the safetensors header.
use candle_core::{Device, Tensor};
use safetensors::tensor::SafeTensors;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::optimizer::{Sgd, SgdState};
use crate::models::Fcn32s;

/// Bumped whenever the layout of a checkpoint changes
pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

const METADATA_KEY: &str = "checkpoint";
const MODEL_PREFIX: &str = "model.";
const MOMENTUM_PREFIX: &str = "optim.momentum.";

/// Checkpoint metadata
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CheckpointMetadata {
    pub schema_version: u32,
    /// Completed epochs at save time
    pub epoch: usize,
    /// Completed iterations at save time
    pub iteration: usize,
    /// Network architecture name
    pub arch: String,
    /// Lowest validation loss seen so far
    pub best_val_loss: Option<f64>,
    /// Optimizer hyperparameters
    pub optimizer: SgdState,
}

/// Training checkpoint
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub metadata: CheckpointMetadata,
    /// Model parameters by name
    pub model_state: HashMap<String, Tensor>,
    /// Momentum buffers by parameter name
    pub optimizer_state: HashMap<String, Tensor>,
}

impl Checkpoint {
    /// Snapshot the current model and optimizer.
    pub fn capture(
        model: &Fcn32s,
        optimizer: &Sgd,
        epoch: usize,
        iteration: usize,
        best_val_loss: Option<f64>,
    ) -> crate::Result<Self> {
        Ok(Self {
            metadata: CheckpointMetadata {
                schema_version: CHECKPOINT_SCHEMA_VERSION,
                epoch,
                iteration,
                arch: crate::models::FCN32S_ARCH.to_string(),
                best_val_loss,
                optimizer: optimizer.state(),
            },
            model_state: model.state_dict()?,
            optimizer_state: optimizer.momentum_buffers()?,
        })
    }

    /// Save checkpoint to file
    ///
    /// The file is written next to `path` first and renamed into place, so an
    /// interrupted save never leaves a truncated checkpoint behind.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> crate::Result<()> {
        let path = path.as_ref();
        let tmp = tmp_path(path);

        let mut tensors: Vec<(String, &Tensor)> = Vec::new();
        for (name, tensor) in &self.model_state {
            tensors.push((format!("{}{}", MODEL_PREFIX, name), tensor));
        }
        for (name, tensor) in &self.optimizer_state {
            tensors.push((format!("{}{}", MOMENTUM_PREFIX, name), tensor));
        }

        let mut header = HashMap::new();
        header.insert(METADATA_KEY.to_string(), serde_json::to_string(&self.metadata)?);

        if let Err(e) = safetensors::serialize_to_file(tensors, &Some(header), &tmp) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        if let Err(e) = std::fs::rename(&tmp, path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }

        log::info!(
            "Saved checkpoint (epoch {}, iteration {}) to {:?}",
            self.metadata.epoch,
            self.metadata.iteration,
            path
        );
        Ok(())
    }

    /// Load checkpoint from file
    ///
    /// # Arguments
    /// * `path` - Path to checkpoint file
    /// * `device` - Device to load tensors on
    ///
    /// # Returns
    /// Loaded checkpoint. Unreadable files, a missing metadata record or a
    /// different schema version are reported as [`crate::FcnError::Checkpoint`].
    pub fn load<P: AsRef<Path>>(path: P, device: &Device) -> crate::Result<Self> {
        let path = path.as_ref();
        let buffer = std::fs::read(path)
            .map_err(|e| crate::FcnError::Checkpoint(format!("cannot read {:?}: {}", path, e)))?;

        let corrupt = |e: &dyn std::fmt::Display| {
            crate::FcnError::Checkpoint(format!("corrupt checkpoint {:?}: {}", path, e))
        };

        let (_, header) = SafeTensors::read_metadata(&buffer).map_err(|e| corrupt(&e))?;
        let json = header
            .metadata()
            .as_ref()
            .and_then(|m| m.get(METADATA_KEY))
            .ok_or_else(|| {
                crate::FcnError::Checkpoint(format!("{:?} has no checkpoint metadata", path))
            })?;
        let metadata: CheckpointMetadata = serde_json::from_str(json).map_err(|e| {
            crate::FcnError::Checkpoint(format!("invalid metadata in {:?}: {}", path, e))
        })?;

        if metadata.schema_version != CHECKPOINT_SCHEMA_VERSION {
            return Err(crate::FcnError::Checkpoint(format!(
                "{:?} has schema version {}, expected {}",
                path, metadata.schema_version, CHECKPOINT_SCHEMA_VERSION
            )));
        }

        let tensors =
            candle_core::safetensors::load_buffer(&buffer, device).map_err(|e| corrupt(&e))?;

        let mut model_state = HashMap::new();
        let mut optimizer_state = HashMap::new();
        for (name, tensor) in tensors {
            if let Some(param) = name.strip_prefix(MODEL_PREFIX) {
                model_state.insert(param.to_string(), tensor);
            } else if let Some(param) = name.strip_prefix(MOMENTUM_PREFIX) {
                optimizer_state.insert(param.to_string(), tensor);
            } else {
                return Err(crate::FcnError::Checkpoint(format!(
                    "unexpected tensor {} in {:?}",
                    name, path
                )));
            }
        }

        Ok(Self {
            metadata,
            model_state,
            optimizer_state,
        })
    }

    /// Write the saved parameters and optimizer state back into `model` and `optimizer`.
    pub fn restore(&self, model: &Fcn32s, optimizer: &mut Sgd) -> crate::Result<()> {
        if self.metadata.arch != crate::models::FCN32S_ARCH {
            return Err(crate::FcnError::Checkpoint(format!(
                "checkpoint was written for {}, not {}",
                self.metadata.arch,
                crate::models::FCN32S_ARCH
            )));
        }

        // Both loads validate before writing; undo the optimizer if the model is rejected
        let previous = (optimizer.state(), optimizer.momentum_buffers()?);
        optimizer.load_state(&self.metadata.optimizer, &self.optimizer_state)?;
        if let Err(e) = model.load_state_dict(&self.model_state) {
            optimizer.load_state(&previous.0, &previous.1)?;
            return Err(e);
        }
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
