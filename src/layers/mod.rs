/// Layer primitives for the segmentation network
///
/// The network is built only from the kinds enumerated by [`Layer`]:
/// - Convolutions with learnable weight and bias
/// - Frozen bilinear deconvolution (fixed upsampling kernel)
/// - ReLU, ceil-mode max pooling and channel dropout
/// - Sequential containers
///
/// [`Layer::Opaque`] lets callers inject a layer outside that set. It runs in the
/// forward pass but is rejected wherever parameters are enumerated.

pub mod conv;
pub mod dropout;
pub mod params;
pub mod pooling;
pub mod upsample;

pub use conv::Conv2d;
pub use dropout::Dropout2d;
pub use params::{ParamStore, Parameter};
pub use pooling::MaxPool2d;
pub use upsample::FrozenDeconv;

use candle_core::{Result, Tensor};

/// A layer whose kind is unknown to the architecture
pub trait OpaqueLayer: std::fmt::Debug + Send + Sync {
    fn name(&self) -> &str;
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor>;
}

#[derive(Debug)]
pub enum Layer {
    Conv2d(Conv2d),
    FrozenDeconv(FrozenDeconv),
    Relu,
    MaxPool2d(MaxPool2d),
    Dropout2d(Dropout2d),
    Sequential(Sequential),
    Opaque(Box<dyn OpaqueLayer>),
}

impl Layer {
    /// Short type tag used in logs and errors
    pub fn kind(&self) -> &'static str {
        match self {
            Layer::Conv2d(_) => "Conv2d",
            Layer::FrozenDeconv(_) => "FrozenDeconv",
            Layer::Relu => "ReLU",
            Layer::MaxPool2d(_) => "MaxPool2d",
            Layer::Dropout2d(_) => "Dropout2d",
            Layer::Sequential(_) => "Sequential",
            Layer::Opaque(_) => "Opaque",
        }
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            Layer::Conv2d(conv) => conv.forward(xs),
            Layer::FrozenDeconv(deconv) => deconv.forward(xs),
            Layer::Relu => xs.relu(),
            Layer::MaxPool2d(pool) => pool.forward(xs),
            Layer::Dropout2d(dropout) => dropout.forward_t(xs, train),
            Layer::Sequential(seq) => seq.forward_t(xs, train),
            Layer::Opaque(layer) => layer.forward_t(xs, train),
        }
    }

    /// Append this layer and, for containers, every nested layer depth-first.
    pub fn collect<'a>(&'a self, out: &mut Vec<&'a Layer>) {
        out.push(self);
        if let Layer::Sequential(seq) = self {
            for layer in &seq.layers {
                layer.collect(out);
            }
        }
    }
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Layer::Conv2d(conv) => write!(f, "Conv2d({})", conv.name()),
            Layer::FrozenDeconv(deconv) => write!(f, "FrozenDeconv({})", deconv.name()),
            Layer::Sequential(seq) => write!(f, "Sequential({})", seq.name()),
            Layer::Opaque(layer) => write!(f, "Opaque({})", layer.name()),
            other => f.write_str(other.kind()),
        }
    }
}

/// Ordered container of layers
#[derive(Debug)]
pub struct Sequential {
    name: String,
    pub(crate) layers: Vec<Layer>,
}

impl Sequential {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            layers: Vec::new(),
        }
    }

    pub fn push(&mut self, layer: Layer) {
        self.layers.push(layer);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Convolutions of this container, nested ones included, in order
    pub fn convs(&self) -> Vec<&Conv2d> {
        let mut all = Vec::new();
        for layer in &self.layers {
            layer.collect(&mut all);
        }
        all.into_iter()
            .filter_map(|layer| match layer {
                Layer::Conv2d(conv) => Some(conv),
                _ => None,
            })
            .collect()
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut xs = xs.clone();
        for layer in &self.layers {
            xs = layer.forward_t(&xs, train)?;
        }
        Ok(xs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[derive(Debug)]
    struct Identity;

    impl OpaqueLayer for Identity {
        fn name(&self) -> &str {
            "identity"
        }

        fn forward_t(&self, xs: &Tensor, _train: bool) -> Result<Tensor> {
            Ok(xs.clone())
        }
    }

    #[test]
    fn test_sequential_collects_depth_first() -> crate::Result<()> {
        let store = ParamStore::new(DType::F32, &Device::Cpu);

        let mut inner = Sequential::new("inner");
        inner.push(Layer::Conv2d(Conv2d::new(&store, "b", 2, 2, 1, 0)?));
        inner.push(Layer::Relu);

        let mut outer = Sequential::new("outer");
        outer.push(Layer::Conv2d(Conv2d::new(&store, "a", 1, 2, 3, 1)?));
        outer.push(Layer::Sequential(inner));
        outer.push(Layer::Opaque(Box::new(Identity)));

        let root = Layer::Sequential(outer);
        let mut visited = Vec::new();
        root.collect(&mut visited);

        let kinds: Vec<&str> = visited.iter().map(|l| l.kind()).collect();
        assert_eq!(
            kinds,
            ["Sequential", "Conv2d", "Sequential", "Conv2d", "ReLU", "Opaque"]
        );

        if let Layer::Sequential(seq) = &root {
            let names: Vec<&str> = seq.convs().iter().map(|c| c.name()).collect();
            assert_eq!(names, ["a", "b"]);
        }

        Ok(())
    }

    #[test]
    fn test_sequential_forward() -> crate::Result<()> {
        let device = Device::Cpu;
        let store = ParamStore::new(DType::F32, &device);

        let mut seq = Sequential::new("features");
        seq.push(Layer::Conv2d(Conv2d::new(&store, "conv", 1, 4, 3, 1)?));
        seq.push(Layer::Relu);
        seq.push(Layer::MaxPool2d(MaxPool2d::new(2, 2, true)));
        seq.push(Layer::Opaque(Box::new(Identity)));

        let x = Tensor::randn(0f32, 1.0, (1, 1, 5, 5), &device)?;
        let out = seq.forward_t(&x, true)?;

        assert_eq!(out.dims(), &[1, 4, 3, 3]);

        Ok(())
    }
}
