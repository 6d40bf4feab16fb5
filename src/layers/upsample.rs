/// Fixed bilinear upsampling through a transposed convolution
use candle_core::{DType, Device, Result, Tensor};

/// Transposed convolution whose kernel is a constant bilinear filter.
///
/// The kernel is a plain tensor rather than a variable, so it never receives
/// gradients and is not part of the saved model state.
#[derive(Debug)]
pub struct FrozenDeconv {
    pub(crate) name: String,
    pub(crate) kernel: Tensor,
    pub(crate) bias: Option<Tensor>,
    pub(crate) stride: usize,
}

impl FrozenDeconv {
    /// Channel-wise bilinear upsampling, `channels -> channels`, no bias.
    pub fn bilinear(
        name: &str,
        channels: usize,
        kernel_size: usize,
        stride: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let kernel = bilinear_kernel(channels, kernel_size, device)?.to_dtype(dtype)?;
        Ok(Self {
            name: name.to_string(),
            kernel,
            bias: None,
            stride,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kernel(&self) -> &Tensor {
        &self.kernel
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let out = xs.conv_transpose2d(&self.kernel, 0, 0, self.stride, 1)?;
        match &self.bias {
            Some(bias) => out.broadcast_add(&bias.reshape((1, bias.dim(0)?, 1, 1))?),
            None => Ok(out),
        }
    }
}

/// 2D bilinear filter of `size x size`.
pub fn bilinear_filter(size: usize) -> Vec<f32> {
    let factor = ((size + 1) / 2) as f32;
    let center = if size % 2 == 1 {
        factor - 1.0
    } else {
        factor - 0.5
    };

    let mut filter = Vec::with_capacity(size * size);
    for row in 0..size {
        for col in 0..size {
            let fr = 1.0 - (row as f32 - center).abs() / factor;
            let fc = 1.0 - (col as f32 - center).abs() / factor;
            filter.push(fr * fc);
        }
    }
    filter
}

/// Transposed-convolution kernel `[channels, channels, size, size]` that
/// upsamples each channel independently.
pub fn bilinear_kernel(channels: usize, size: usize, device: &Device) -> Result<Tensor> {
    let filter = bilinear_filter(size);
    let plane = size * size;

    let mut data = vec![0f32; channels * channels * plane];
    for c in 0..channels {
        let offset = (c * channels + c) * plane;
        data[offset..offset + plane].copy_from_slice(&filter);
    }

    Tensor::from_vec(data, (channels, channels, size, size), device)
}
