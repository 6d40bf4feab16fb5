/// 2D convolution with named learnable parameters
use candle_core::{Result, Tensor, Var};
use candle_nn::Init;

use super::params::{ParamStore, Parameter};

/// Stride-1 square convolution
///
/// Parameters are zero-initialized; real values come from the backbone
/// transfer or a checkpoint.
#[derive(Debug)]
pub struct Conv2d {
    name: String,
    weight: Var,
    bias: Option<Var>,
    padding: usize,
}

impl Conv2d {
    /// Create new convolution with bias
    ///
    /// # Arguments
    /// * `store` - Parameter store the weight and bias are registered in
    /// * `name` - Layer name, prefix of the parameter names
    /// * `in_channels` / `out_channels` - Channel counts
    /// * `kernel` - Square kernel size
    /// * `padding` - Zero padding on every side
    pub fn new(
        store: &ParamStore,
        name: &str,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        padding: usize,
    ) -> crate::Result<Self> {
        let weight = store.var(
            &format!("{}.weight", name),
            (out_channels, in_channels, kernel, kernel),
            Init::Const(0.),
        )?;
        let bias = store.var(&format!("{}.bias", name), out_channels, Init::Const(0.))?;

        Ok(Self {
            name: name.to_string(),
            weight,
            bias: Some(bias),
            padding,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn weight(&self) -> Parameter {
        Parameter::new(format!("{}.weight", self.name), self.weight.clone())
    }

    pub fn bias(&self) -> Option<Parameter> {
        self.bias
            .as_ref()
            .map(|bias| Parameter::new(format!("{}.bias", self.name), bias.clone()))
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let out = xs.conv2d(&self.weight, self.padding, 1, 1, 1)?;
        match &self.bias {
            Some(bias) => {
                let bias = bias.reshape((1, bias.dim(0)?, 1, 1))?;
                out.broadcast_add(&bias)
            }
            None => Ok(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_conv_shapes() -> crate::Result<()> {
        let device = Device::Cpu;
        let store = ParamStore::new(DType::F32, &device);

        let conv = Conv2d::new(&store, "conv1_1", 3, 8, 3, 100)?;
        assert_eq!(conv.weight().name, "conv1_1.weight");
        assert_eq!(conv.weight().tensor().dims(), &[8, 3, 3, 3]);
        assert_eq!(conv.bias().map(|b| b.name), Some("conv1_1.bias".to_string()));

        let x = Tensor::randn(0f32, 1.0, (1, 3, 4, 4), &device)?;
        let out = conv.forward(&x)?;
        assert_eq!(out.dims(), &[1, 8, 202, 202]);

        Ok(())
    }

    #[test]
    fn test_bias_is_added() -> crate::Result<()> {
        let device = Device::Cpu;
        let store = ParamStore::new(DType::F32, &device);
        let conv = Conv2d::new(&store, "fc", 2, 2, 1, 0)?;

        if let Some(bias) = conv.bias() {
            bias.var.set(&Tensor::new(&[1f32, -2.0], &device)?)?;
        }

        let x = Tensor::zeros((1, 2, 2, 2), DType::F32, &device)?;
        let out = conv.forward(&x)?;
        let per_channel = out.sum((0, 2, 3))?.to_vec1::<f32>()?;
        assert_eq!(per_channel, vec![4.0, -8.0]);

        Ok(())
    }
}
