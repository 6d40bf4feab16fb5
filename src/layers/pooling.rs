/// Max pooling with optional ceil-mode output sizing
use candle_core::{Result, Tensor};

#[derive(Debug, Clone, Copy)]
pub struct MaxPool2d {
    kernel: usize,
    stride: usize,
    ceil_mode: bool,
}

impl MaxPool2d {
    pub fn new(kernel: usize, stride: usize, ceil_mode: bool) -> Self {
        Self {
            kernel,
            stride,
            ceil_mode,
        }
    }

    /// Output extent for an input extent of `size`
    pub fn output_size(&self, size: usize) -> usize {
        let span = size.saturating_sub(self.kernel);
        if self.ceil_mode {
            (span + self.stride - 1) / self.stride + 1
        } else {
            span / self.stride + 1
        }
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = if self.ceil_mode {
            let (_, _, h, w) = xs.dims4()?;
            // Replicating the trailing row/column leaves every window maximum unchanged.
            let pad_h = self.trailing_pad(h);
            let pad_w = self.trailing_pad(w);
            let xs = if pad_h > 0 {
                xs.pad_with_same(2, 0, pad_h)?
            } else {
                xs.clone()
            };
            if pad_w > 0 {
                xs.pad_with_same(3, 0, pad_w)?
            } else {
                xs
            }
        } else {
            xs.clone()
        };

        xs.max_pool2d_with_stride(self.kernel, self.stride)
    }

    fn trailing_pad(&self, size: usize) -> usize {
        let needed = (self.output_size(size) - 1) * self.stride + self.kernel;
        needed.saturating_sub(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_output_size() {
        let ceil = MaxPool2d::new(2, 2, true);
        let floor = MaxPool2d::new(2, 2, false);

        assert_eq!(ceil.output_size(7), 4);
        assert_eq!(floor.output_size(7), 3);
        assert_eq!(ceil.output_size(8), 4);
        assert_eq!(floor.output_size(8), 4);
    }

    #[test]
    fn test_ceil_mode_keeps_border() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::arange(0f32, 9.0, &device)?.reshape((1, 1, 3, 3))?;

        let out = MaxPool2d::new(2, 2, true).forward(&x)?;
        assert_eq!(out.dims(), &[1, 1, 2, 2]);
        assert_eq!(
            out.flatten_all()?.to_vec1::<f32>()?,
            vec![4.0, 5.0, 7.0, 8.0]
        );

        let out = MaxPool2d::new(2, 2, false).forward(&x)?;
        assert_eq!(out.flatten_all()?.to_vec1::<f32>()?, vec![4.0]);

        Ok(())
    }
}
