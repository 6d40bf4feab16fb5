/// FCN-32s segmentation network
use candle_core::{DType, Device, ModuleT, Result, Tensor};
use std::collections::HashMap;

use crate::config::{FcnConfig, BLOCK_DEPTHS, CROP_OFFSET, UPSAMPLE_STRIDE};
use crate::layers::{
    Conv2d, Dropout2d, FrozenDeconv, Layer, MaxPool2d, ParamStore, Parameter, Sequential,
};

pub mod loader;
pub mod transfer;
pub mod vgg;

pub use transfer::copy_params_from_vgg16;
pub use vgg::Vgg16;

/// Architecture tag stored in checkpoints
pub const FCN32S_ARCH: &str = "FCN32s";

/// One entry of the ordered module enumeration
#[derive(Debug, Clone, Copy)]
pub enum ModuleRef<'a> {
    /// The network root itself
    Network(&'a Fcn32s),
    Layer(&'a Layer),
}

impl std::fmt::Display for ModuleRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModuleRef::Network(_) => f.write_str(FCN32S_ARCH),
            ModuleRef::Layer(layer) => write!(f, "{}", layer),
        }
    }
}

/// Fully-convolutional network with a single 32x upsampling stage
///
/// Layout:
/// - `features`: five VGG-16 convolution blocks, each followed by ceil-mode pooling;
///   the first convolution pads by `input_pad` so small inputs still reach fc6
/// - `classifier`: fc6 / fc7 as convolutions with ReLU and channel dropout, then
///   `score_fr` producing one score map per class
/// - `upscore`: frozen bilinear deconvolution, cropped back to the input extent
#[derive(Debug)]
pub struct Fcn32s {
    config: FcnConfig,
    store: ParamStore,
    pub(crate) body: Vec<Layer>,
}

impl Fcn32s {
    /// Create new FCN-32s with zero-initialized learnable parameters
    pub fn new(config: FcnConfig, device: &Device) -> crate::Result<Self> {
        config.validate()?;

        let store = ParamStore::new(DType::F32, device);

        let mut features = Sequential::new("features");
        let mut in_channels = config.in_channels;
        for (block, (&depth, &width)) in BLOCK_DEPTHS.iter().zip(config.widths.iter()).enumerate() {
            for i in 0..depth {
                let name = format!("conv{}_{}", block + 1, i + 1);
                let padding = if block == 0 && i == 0 { config.input_pad } else { 1 };
                features.push(Layer::Conv2d(Conv2d::new(
                    &store,
                    &name,
                    in_channels,
                    width,
                    3,
                    padding,
                )?));
                features.push(Layer::Relu);
                in_channels = width;
            }
            features.push(Layer::MaxPool2d(MaxPool2d::new(2, 2, true)));
        }

        let mut classifier = Sequential::new("classifier");
        classifier.push(Layer::Conv2d(Conv2d::new(
            &store,
            "fc6",
            in_channels,
            config.fc_width,
            config.fc_kernel,
            0,
        )?));
        classifier.push(Layer::Relu);
        classifier.push(Layer::Dropout2d(Dropout2d::new(config.dropout)));
        classifier.push(Layer::Conv2d(Conv2d::new(
            &store,
            "fc7",
            config.fc_width,
            config.fc_width,
            1,
            0,
        )?));
        classifier.push(Layer::Relu);
        classifier.push(Layer::Dropout2d(Dropout2d::new(config.dropout)));
        classifier.push(Layer::Conv2d(Conv2d::new(
            &store,
            "score_fr",
            config.fc_width,
            config.n_class,
            1,
            0,
        )?));

        let upscore = FrozenDeconv::bilinear(
            "upscore",
            config.n_class,
            2 * UPSAMPLE_STRIDE,
            UPSAMPLE_STRIDE,
            store.dtype(),
            device,
        )?;

        log::debug!(
            "Built {} with {} parameter tensors on {:?}",
            FCN32S_ARCH,
            store.len(),
            device
        );

        Ok(Self {
            config,
            store,
            body: vec![
                Layer::Sequential(features),
                Layer::Sequential(classifier),
                Layer::FrozenDeconv(upscore),
            ],
        })
    }

    pub fn config(&self) -> &FcnConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        self.store.device()
    }

    /// Every module in registration order: the network, then each layer
    /// depth-first with containers before their children.
    pub fn modules(&self) -> Vec<ModuleRef<'_>> {
        let mut layers = Vec::new();
        for layer in &self.body {
            layer.collect(&mut layers);
        }

        std::iter::once(ModuleRef::Network(self))
            .chain(layers.into_iter().map(ModuleRef::Layer))
            .collect()
    }

    fn sequential(&self, name: &str) -> Option<&Sequential> {
        self.body.iter().find_map(|layer| match layer {
            Layer::Sequential(seq) if seq.name() == name => Some(seq),
            _ => None,
        })
    }

    /// Convolutions of the VGG-16 feature extractor, in order
    pub fn feature_convs(&self) -> Vec<&Conv2d> {
        self.sequential("features")
            .map(|seq| seq.convs())
            .unwrap_or_default()
    }

    /// Convolution of the classifier head by name (`fc6`, `fc7`, `score_fr`)
    pub fn classifier_conv(&self, name: &str) -> Option<&Conv2d> {
        self.sequential("classifier")?
            .convs()
            .into_iter()
            .find(|conv| conv.name() == name)
    }

    /// Learnable parameters in registration order, weight before bias
    pub fn named_parameters(&self) -> Vec<Parameter> {
        let mut layers = Vec::new();
        for layer in &self.body {
            layer.collect(&mut layers);
        }

        let mut params = Vec::new();
        for layer in layers {
            if let Layer::Conv2d(conv) = layer {
                params.push(conv.weight());
                params.extend(conv.bias());
            }
        }
        params
    }

    /// Snapshot of the learnable parameters keyed by name
    pub fn state_dict(&self) -> crate::Result<HashMap<String, Tensor>> {
        self.store.tensors()
    }

    /// Strictly load learnable parameters saved by [`Fcn32s::state_dict`].
    pub fn load_state_dict(&self, state: &HashMap<String, Tensor>) -> crate::Result<()> {
        self.store.load(state)
    }

    /// Copy every learnable parameter from `other`, across devices if needed.
    pub fn sync_from(&self, other: &Fcn32s) -> crate::Result<()> {
        self.store.copy_from(&other.store)
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.forward_t(xs, false)
    }
}

impl ModuleT for Fcn32s {
    /// Per-pixel class scores `[batch, n_class, height, width]`
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let (_, _, height, width) = xs.dims4()?;

        let mut h = xs.clone();
        for layer in &self.body {
            h = layer.forward_t(&h, train)?;
        }

        let (_, _, up_h, up_w) = h.dims4()?;
        if up_h < CROP_OFFSET + height || up_w < CROP_OFFSET + width {
            candle_core::bail!(
                "upsampled score map {}x{} too small for a {}x{} input",
                up_h,
                up_w,
                height,
                width
            );
        }

        h.narrow(2, CROP_OFFSET, height)?
            .narrow(3, CROP_OFFSET, width)?
            .contiguous()
    }
}
