/// Configuration for the FCN-32s network and its VGG-16 backbone
///
/// Block widths and classifier width are configurable so reduced networks keep
/// the exact layer layout of the full-size one.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FcnConfig {
    /// Number of segmentation classes (including background)
    pub n_class: usize,

    /// Input image channels
    pub in_channels: usize,

    /// Output channels of the five convolution blocks
    pub widths: [usize; 5],

    /// Channels of the convolutionalized fully-connected layers (fc6, fc7)
    pub fc_width: usize,

    /// Kernel size of fc6 (spatial extent of pool5 in the backbone)
    pub fc_kernel: usize,

    /// Zero padding of the first convolution
    pub input_pad: usize,

    /// Channel dropout probability after fc6 and fc7
    pub dropout: f32,
}

impl Default for FcnConfig {
    fn default() -> Self {
        Self {
            n_class: 21, // PASCAL VOC: 20 classes + background
            in_channels: 3,
            widths: [64, 128, 256, 512, 512],
            fc_width: 4096,
            fc_kernel: 7,
            input_pad: 100,
            dropout: 0.5,
        }
    }
}

/// Number of 3x3 convolutions in each VGG-16 block
pub const BLOCK_DEPTHS: [usize; 5] = [2, 2, 3, 3, 3];

/// Upsampling factor of FCN-32s
pub const UPSAMPLE_STRIDE: usize = 32;

/// Offset of the crop applied after upsampling
pub const CROP_OFFSET: usize = 19;

impl FcnConfig {
    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.n_class == 0 {
            return Err(crate::FcnError::Config(
                "n_class must be > 0".to_string(),
            ));
        }

        if self.in_channels == 0 || self.widths.iter().any(|&w| w == 0) {
            return Err(crate::FcnError::Config(
                "in_channels and block widths must be > 0".to_string(),
            ));
        }

        if self.fc_width == 0 || self.fc_kernel == 0 {
            return Err(crate::FcnError::Config(
                "fc_width and fc_kernel must be > 0".to_string(),
            ));
        }

        if !(0.0..1.0).contains(&self.dropout) {
            return Err(crate::FcnError::Config(format!(
                "Invalid dropout: {}. Must be in [0, 1)",
                self.dropout
            )));
        }

        Ok(())
    }

    /// Backbone whose feature extractor matches this network
    pub fn backbone(&self) -> BackboneConfig {
        BackboneConfig {
            in_channels: self.in_channels,
            widths: self.widths,
            fc_width: self.fc_width,
            pool_size: self.fc_kernel,
            num_classes: 1000,
            dropout: self.dropout,
        }
    }

    /// Total number of feature convolutions
    pub fn num_feature_convs(&self) -> usize {
        BLOCK_DEPTHS.iter().sum()
    }
}

/// VGG-16 classification backbone configuration
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BackboneConfig {
    pub in_channels: usize,
    pub widths: [usize; 5],
    /// Width of the first two fully-connected layers
    pub fc_width: usize,
    /// Spatial extent of pool5 fed into the classifier
    pub pool_size: usize,
    /// Number of classification outputs
    pub num_classes: usize,
    pub dropout: f32,
}

impl Default for BackboneConfig {
    fn default() -> Self {
        FcnConfig::default().backbone()
    }
}

impl BackboneConfig {
    /// Input features of the first fully-connected layer
    pub fn flattened_features(&self) -> usize {
        self.widths[4] * self.pool_size * self.pool_size
    }
}

#[cfg(test)]
pub(crate) fn tiny_config() -> FcnConfig {
    FcnConfig {
        n_class: 3,
        in_channels: 3,
        widths: [2, 2, 4, 4, 4],
        fc_width: 8,
        fc_kernel: 7,
        input_pad: 100,
        dropout: 0.5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(FcnConfig::default().validate().is_ok());
        assert_eq!(FcnConfig::default().num_feature_convs(), 13);
    }

    #[test]
    fn test_invalid_configs() {
        let mut config = FcnConfig::default();
        config.n_class = 0;
        assert!(config.validate().is_err());

        let mut config = FcnConfig::default();
        config.widths[2] = 0;
        assert!(config.validate().is_err());

        let mut config = FcnConfig::default();
        config.dropout = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backbone_matches_features() {
        let backbone = FcnConfig::default().backbone();
        assert_eq!(backbone.flattened_features(), 512 * 7 * 7);
        assert_eq!(backbone.num_classes, 1000);
    }
}
