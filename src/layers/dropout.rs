/// Channel-wise dropout
use candle_core::{Result, Tensor};

/// Zeroes whole feature maps with probability `p` during training and
/// rescales the survivors by `1 / (1 - p)`. Identity at evaluation time.
#[derive(Debug, Clone, Copy)]
pub struct Dropout2d {
    p: f32,
}

impl Dropout2d {
    pub fn new(p: f32) -> Self {
        Self { p }
    }

    pub fn p(&self) -> f32 {
        self.p
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        if !train || self.p == 0.0 {
            return Ok(xs.clone());
        }

        let (n, c, _, _) = xs.dims4()?;
        let keep = Tensor::rand(0f32, 1f32, (n, c, 1, 1), xs.device())?
            .ge(self.p)?
            .to_dtype(xs.dtype())?;
        let mask = (keep * (1.0 / (1.0 - self.p as f64)))?;

        xs.broadcast_mul(&mask)
    }
}
