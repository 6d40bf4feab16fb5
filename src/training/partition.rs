/// Partitioning of model parameters into optimizer groups
use crate::layers::{Layer, Parameter};
use crate::models::{Fcn32s, ModuleRef};

/// Which tensors of each convolution to collect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Weights,
    Biases,
}

/// How a module takes part in optimization
#[derive(Debug)]
pub enum Classification<'a> {
    /// Convolution with learnable parameters
    Learned(&'a crate::layers::Conv2d),
    /// Fixed upsampling, never optimized
    Frozen(&'a crate::layers::FrozenDeconv),
    /// Stateless or container module
    Skipped,
}

/// Classify one module; unknown layer kinds are rejected.
pub fn classify<'a>(module: ModuleRef<'a>) -> crate::Result<Classification<'a>> {
    let layer = match module {
        ModuleRef::Network(_) => return Ok(Classification::Skipped),
        ModuleRef::Layer(layer) => layer,
    };

    match layer {
        Layer::Conv2d(conv) => Ok(Classification::Learned(conv)),
        Layer::FrozenDeconv(deconv) => Ok(Classification::Frozen(deconv)),
        Layer::Relu | Layer::MaxPool2d(_) | Layer::Dropout2d(_) | Layer::Sequential(_) => {
            Ok(Classification::Skipped)
        }
        Layer::Opaque(_) => Err(crate::FcnError::UnexpectedModule(layer.to_string())),
    }
}

/// Count of modules per classification
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LayerCensus {
    pub visited: usize,
    pub learned: usize,
    pub frozen: usize,
    pub skipped: usize,
}

/// Classify every module of `model`.
pub fn census(model: &Fcn32s) -> crate::Result<LayerCensus> {
    let mut census = LayerCensus::default();
    for module in model.modules() {
        census.visited += 1;
        match classify(module)? {
            Classification::Learned(_) => census.learned += 1,
            Classification::Frozen(_) => census.frozen += 1,
            Classification::Skipped => census.skipped += 1,
        }
    }
    Ok(census)
}

/// Collect the weights or the biases of every learned layer in module order.
///
/// The frozen upsampling kernel is never collected. When collecting biases, a
/// frozen layer that carries one is a configuration error.
pub fn get_parameters(model: &Fcn32s, kind: ParamKind) -> crate::Result<Vec<Parameter>> {
    let mut params = Vec::new();

    for module in model.modules() {
        match classify(module)? {
            Classification::Learned(conv) => match kind {
                ParamKind::Weights => params.push(conv.weight()),
                ParamKind::Biases => params.extend(conv.bias()),
            },
            Classification::Frozen(deconv) => {
                if kind == ParamKind::Biases && deconv.bias().is_some() {
                    return Err(crate::FcnError::FrozenBias(deconv.name().to_string()));
                }
            }
            Classification::Skipped => {}
        }
    }

    Ok(params)
}
