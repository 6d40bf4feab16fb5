/// Data-parallel forward/backward across model replicas
use candle_core::{backprop::GradStore, DType, ModuleT, Tensor};

use super::loss::{cross_entropy2d, predict};
use crate::data::VOID_LABEL;
use crate::device::DeviceContext;
use crate::models::Fcn32s;

/// Result of one forward/backward pass over a full batch
pub struct ReplicaStep {
    /// Batch loss, already divided by the batch size (and the labelled pixel
    /// count when averaging)
    pub loss: f64,
    /// Gradients of the primary model's parameters, summed over replicas
    pub grads: GradStore,
    /// Predicted labels `u32 [batch, height, width]` on the primary device
    pub predictions: Tensor,
}

/// Replicas of the primary model, one per additional device
pub struct DataParallel {
    replicas: Vec<Fcn32s>,
}

impl DataParallel {
    /// Create a replica of `primary` on every device after the first.
    pub fn new(primary: &Fcn32s, devices: &DeviceContext) -> crate::Result<Self> {
        let mut replicas = Vec::with_capacity(devices.len().saturating_sub(1));
        for device in devices.devices().iter().skip(1) {
            let replica = Fcn32s::new(primary.config().clone(), device)?;
            replica.sync_from(primary)?;
            replicas.push(replica);
        }

        if !replicas.is_empty() {
            log::info!("Data parallel over {} devices", replicas.len() + 1);
        }
        Ok(Self { replicas })
    }

    /// Number of models sharing each batch, the primary included
    pub fn num_replicas(&self) -> usize {
        self.replicas.len() + 1
    }

    /// Forward and backward `images`/`labels` in training mode.
    ///
    /// The batch is split along its first axis; each chunk runs on its own thread
    /// and replica. Every chunk sums its pixel losses and divides by a normalizer
    /// computed over the whole batch: the batch size, times the labelled pixel
    /// count when `size_average` is set. The summed chunk losses and gradients
    /// therefore equal those of a single pass over the whole batch.
    pub fn forward_backward(
        &self,
        primary: &Fcn32s,
        images: &Tensor,
        labels: &Tensor,
        size_average: bool,
    ) -> crate::Result<ReplicaStep> {
        let batch_size = images.dim(0)?;
        if batch_size == 0 {
            return Err(crate::FcnError::Training("empty batch".to_string()));
        }

        let mut normalizer = batch_size as f64;
        if size_average {
            let labelled = labels
                .to_dtype(DType::U32)?
                .ne(VOID_LABEL)?
                .to_dtype(DType::F32)?
                .sum_all()?
                .to_scalar::<f32>()?;
            // Without labelled pixels the summed loss is zero anyway
            normalizer *= f64::from(labelled).max(1.0);
        }

        let models: Vec<&Fcn32s> = std::iter::once(primary).chain(self.replicas.iter()).collect();
        let chunks = split_batch(batch_size, models.len());

        let outputs = if chunks.len() == 1 {
            vec![replica_pass(primary, images, labels, normalizer)?]
        } else {
            std::thread::scope(|scope| {
                let handles: Vec<_> = chunks
                    .iter()
                    .zip(models.iter())
                    .map(|(&(start, len), &model)| {
                        scope.spawn(move || -> crate::Result<(f64, GradStore, Tensor)> {
                            let device = model.device();
                            let images = images.narrow(0, start, len)?.to_device(device)?;
                            let labels = labels.narrow(0, start, len)?.to_device(device)?;
                            replica_pass(model, &images, &labels, normalizer)
                        })
                    })
                    .collect();

                handles
                    .into_iter()
                    .map(|handle| {
                        handle.join().map_err(|_| {
                            crate::FcnError::Training("replica thread panicked".to_string())
                        })?
                    })
                    .collect::<crate::Result<Vec<_>>>()
            })?
        };

        let mut outputs = outputs.into_iter();
        let (mut loss, mut grads, first_pred) = outputs
            .next()
            .ok_or_else(|| crate::FcnError::Training("no replica produced output".to_string()))?;
        let mut predictions = vec![first_pred];

        let primary_params = primary.named_parameters();
        for ((replica_loss, replica_grads, pred), replica) in outputs.zip(self.replicas.iter()) {
            loss += replica_loss;
            predictions.push(pred.to_device(primary.device())?);

            for (param, replica_param) in primary_params.iter().zip(replica.named_parameters()) {
                let grad = match replica_grads.get(replica_param.tensor()) {
                    Some(grad) => grad.to_device(primary.device())?,
                    None => continue,
                };
                let summed = match grads.get(param.tensor()) {
                    Some(own) => (own + grad)?,
                    None => grad,
                };
                grads.insert(param.tensor(), summed);
            }
        }

        Ok(ReplicaStep {
            loss,
            grads,
            predictions: Tensor::cat(&predictions, 0)?,
        })
    }

    /// Copy the primary parameters into every replica.
    pub fn sync(&self, primary: &Fcn32s) -> crate::Result<()> {
        for replica in &self.replicas {
            replica.sync_from(primary)?;
        }
        Ok(())
    }
}

fn replica_pass(
    model: &Fcn32s,
    images: &Tensor,
    labels: &Tensor,
    normalizer: f64,
) -> crate::Result<(f64, GradStore, Tensor)> {
    let scores = model.forward_t(images, true)?;
    let loss = (cross_entropy2d(&scores, labels, false)? / normalizer)?;
    let grads = loss.backward()?;
    let value = loss.to_dtype(DType::F64)?.to_scalar::<f64>()?;
    Ok((value, grads, predict(&scores.detach())?))
}

/// `(start, len)` of each non-empty chunk when splitting `batch_size` items
/// over `parts` replicas as evenly as possible.
fn split_batch(batch_size: usize, parts: usize) -> Vec<(usize, usize)> {
    let parts = parts.clamp(1, batch_size.max(1));
    let base = batch_size / parts;
    let extra = batch_size % parts;

    let mut chunks = Vec::with_capacity(parts);
    let mut start = 0;
    for i in 0..parts {
        let len = base + usize::from(i < extra);
        if len > 0 {
            chunks.push((start, len));
        }
        start += len;
    }
    chunks
}
