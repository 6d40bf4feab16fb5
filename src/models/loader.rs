/// Backbone weight loading from safetensors files
use std::path::{Path, PathBuf};
use candle_core::{Device, DType};
use candle_nn::{VarBuilder, VarMap};
use crate::BackboneConfig;
use super::Vgg16;

/// Location of the pretrained VGG-16 weights under the user's data directory
pub fn pretrained_vgg16_path() -> PathBuf {
    let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_default();
    home.join("data/models/candle/vgg16.safetensors")
}

/// Load VGG-16 from a safetensors file
///
/// # Arguments
/// * `config` - Backbone configuration
/// * `weights_path` - Path to safetensors file with torchvision names
/// * `device` - Device to load model on
pub fn load_vgg16<P: AsRef<Path>>(
    config: BackboneConfig,
    weights_path: P,
    device: &Device,
) -> crate::Result<Vgg16> {
    let path = weights_path.as_ref();
    if !path.exists() {
        return Err(crate::FcnError::Model(format!(
            "pretrained weights not found at {}",
            path.display()
        )));
    }

    log::info!("Loading VGG-16 weights from {}", path.display());
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[path], DType::F32, device)? };

    Ok(Vgg16::new(config, vb)?)
}

/// VGG-16 with freshly initialized (untrained) weights
pub fn init_vgg16(config: BackboneConfig, device: &Device) -> crate::Result<Vgg16> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    Ok(Vgg16::new(config, vb)?)
}
