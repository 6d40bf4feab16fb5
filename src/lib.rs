//! FCN-32s semantic segmentation training
//!
//! Trains a fully-convolutional segmentation network on top of a VGG-16 feature
//! extractor with momentum SGD, interval validation and resumable checkpoints.
//!
//! # Architecture
//!
//! - **Layers**: a closed set of layer kinds the network is built from
//! - **Models**: the VGG-16 backbone, the FCN-32s network and backbone weight transfer
//! - **Training**: parameter partitioning, SGD, loss/metrics, checkpoints and the trainer loop
//!
//! # Example
//!
//! ```ignore
//! use fcn_train::{DeviceContext, FcnConfig, Fcn32s};
//!
//! let devices = DeviceContext::cpu();
//! let model = Fcn32s::new(FcnConfig::default(), devices.primary())?;
//! let scores = model.forward(&image)?;
//! ```

pub mod config;
pub mod data;
pub mod device;
pub mod layers;
pub mod models;
pub mod run;
pub mod training;

// Re-export commonly used items
pub use config::{BackboneConfig, FcnConfig};
pub use device::DeviceContext;
pub use models::{Fcn32s, Vgg16};

/// Library error types
#[derive(Debug, thiserror::Error)]
pub enum FcnError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Training error: {0}")]
    Training(String),

    #[error("Unexpected module: {0}")]
    UnexpectedModule(String),

    #[error("Frozen deconvolution {0} carries a bias")]
    FrozenBias(String),

    #[error("Shape mismatch at {layer}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        layer: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, FcnError>;
