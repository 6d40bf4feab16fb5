/// VGG-16 classification backbone
///
/// Parameter names follow the torchvision layout (`features.{i}.weight`,
/// `classifier.{0,3,6}.weight`) so exported torchvision weights load directly.
use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Linear, VarBuilder};

use crate::config::{BackboneConfig, BLOCK_DEPTHS};

pub struct Vgg16 {
    config: BackboneConfig,
    features: Vec<Conv2d>,
    classifier: Vec<Linear>,
}

impl Vgg16 {
    /// Create new VGG-16
    ///
    /// # Arguments
    /// * `config` - Backbone configuration
    /// * `vb` - VarBuilder for parameter initialization or loading
    pub fn new(config: BackboneConfig, vb: VarBuilder) -> Result<Self> {
        let conv_cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };

        let mut features = Vec::new();
        let mut in_channels = config.in_channels;
        // torchvision index: every conv is followed by a ReLU, every block by a pool
        let mut index = 0;
        for (&depth, &width) in BLOCK_DEPTHS.iter().zip(config.widths.iter()) {
            for _ in 0..depth {
                features.push(candle_nn::conv2d(
                    in_channels,
                    width,
                    3,
                    conv_cfg,
                    vb.pp(format!("features.{}", index)),
                )?);
                in_channels = width;
                index += 2;
            }
            index += 1;
        }

        let classifier = vec![
            candle_nn::linear(
                config.flattened_features(),
                config.fc_width,
                vb.pp("classifier.0"),
            )?,
            candle_nn::linear(config.fc_width, config.fc_width, vb.pp("classifier.3"))?,
            candle_nn::linear(config.fc_width, config.num_classes, vb.pp("classifier.6"))?,
        ];

        Ok(Self {
            config,
            features,
            classifier,
        })
    }

    pub fn config(&self) -> &BackboneConfig {
        &self.config
    }

    /// Feature-extractor convolutions, in order
    pub fn features(&self) -> &[Conv2d] {
        &self.features
    }

    /// Fully-connected classifier layers, in order
    pub fn classifier(&self) -> &[Linear] {
        &self.classifier
    }
}

impl ModuleT for Vgg16 {
    /// Class logits `[batch, num_classes]`; the input must pool down to
    /// `pool_size x pool_size`.
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut h = xs.clone();
        let mut convs = self.features.iter();
        for &depth in BLOCK_DEPTHS.iter() {
            for conv in convs.by_ref().take(depth) {
                h = conv.forward(&h)?.relu()?;
            }
            h = h.max_pool2d(2)?;
        }

        let mut h = h.flatten_from(1)?;
        let dropout = candle_nn::Dropout::new(self.config.dropout);
        for (i, linear) in self.classifier.iter().enumerate() {
            h = linear.forward(&h)?;
            if i + 1 < self.classifier.len() {
                h = dropout.forward_t(&h.relu()?, train)?;
            }
        }
        Ok(h)
    }
}
