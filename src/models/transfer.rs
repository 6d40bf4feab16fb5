/// Transfer of backbone parameters into the segmentation network
use candle_core::{Tensor, Var};

use super::{Fcn32s, Vgg16};

fn copy_into(dst: &Var, src: &Tensor) -> crate::Result<()> {
    dst.set(&src.to_dtype(dst.dtype())?.to_device(dst.device())?)?;
    Ok(())
}

/// Initialize `fcn` from a VGG-16 classification backbone.
///
/// The thirteen feature convolutions are copied position by position. The first
/// two classifier layers are reshaped into convolution kernels and copied into
/// `fc6` and `fc7`. `score_fr` keeps its own initialization.
///
/// Shapes are checked for every layer before anything is written, so a
/// mismatch leaves `fcn` untouched.
pub fn copy_params_from_vgg16(fcn: &Fcn32s, vgg: &Vgg16) -> crate::Result<()> {
    let dst_convs = fcn.feature_convs();
    let src_convs = vgg.features();
    if dst_convs.len() != src_convs.len() {
        return Err(crate::FcnError::ShapeMismatch {
            layer: "features".to_string(),
            expected: vec![dst_convs.len()],
            found: vec![src_convs.len()],
        });
    }

    // (layer name, destination, source) for every weight and bias
    let mut plan: Vec<(String, Var, Tensor)> = Vec::new();

    for (dst, src) in dst_convs.iter().zip(src_convs.iter()) {
        plan.push((dst.weight().name, dst.weight().var, src.weight().clone()));
        match (dst.bias(), src.bias()) {
            (Some(dst_bias), Some(src_bias)) => {
                plan.push((dst_bias.name, dst_bias.var, src_bias.clone()))
            }
            (None, None) => {}
            _ => {
                return Err(crate::FcnError::Model(format!(
                    "bias presence differs at {}",
                    dst.name()
                )))
            }
        }
    }

    for (name, linear) in ["fc6", "fc7"].iter().zip(vgg.classifier().iter()) {
        let dst = fcn
            .classifier_conv(name)
            .ok_or_else(|| crate::FcnError::Model(format!("{} not found", name)))?;

        let weight = dst.weight();
        let (out_features, in_features) = linear.weight().dims2()?;
        let expected = weight.tensor().dims().to_vec();
        if expected.len() != 4
            || expected[0] != out_features
            || expected[1] * expected[2] * expected[3] != in_features
        {
            return Err(crate::FcnError::ShapeMismatch {
                layer: weight.name,
                expected,
                found: vec![out_features, in_features],
            });
        }
        let kernel = linear.weight().reshape(weight.tensor().dims())?;
        plan.push((weight.name, weight.var, kernel));

        if let (Some(dst_bias), Some(src_bias)) = (dst.bias(), linear.bias()) {
            plan.push((dst_bias.name, dst_bias.var, src_bias.clone()));
        }
    }

    for (name, dst, src) in &plan {
        if dst.dims() != src.dims() {
            return Err(crate::FcnError::ShapeMismatch {
                layer: name.clone(),
                expected: dst.dims().to_vec(),
                found: src.dims().to_vec(),
            });
        }
    }

    for (_, dst, src) in &plan {
        copy_into(dst, src)?;
    }

    log::info!("Copied {} parameter tensors from VGG-16", plan.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tiny_config;
    use crate::models::loader::init_vgg16;
    use candle_core::Device;
    use std::collections::HashMap;

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .and_then(|d| d.abs())
            .and_then(|d| d.max_all())
            .and_then(|d| d.to_scalar::<f32>())
            .unwrap()
    }

    #[test]
    fn test_features_and_fc_layers_copied() -> crate::Result<()> {
        let device = Device::Cpu;
        let config = tiny_config();
        let fcn = Fcn32s::new(config.clone(), &device)?;
        let vgg = init_vgg16(config.backbone(), &device)?;

        copy_params_from_vgg16(&fcn, &vgg)?;

        for (dst, src) in fcn.feature_convs().iter().zip(vgg.features()) {
            assert_eq!(max_abs_diff(dst.weight().tensor(), src.weight()), 0.0);
        }

        let fc6 = fcn.classifier_conv("fc6").unwrap().weight();
        let flat = fc6.tensor().flatten_from(1)?;
        assert_eq!(max_abs_diff(&flat, vgg.classifier()[0].weight()), 0.0);

        // score_fr keeps its zero initialization
        let score = fcn.classifier_conv("score_fr").unwrap().weight();
        assert_eq!(score.tensor().abs()?.sum_all()?.to_scalar::<f32>()?, 0.0);

        Ok(())
    }

    #[test]
    fn test_transfer_is_idempotent() -> crate::Result<()> {
        let device = Device::Cpu;
        let config = tiny_config();
        let fcn = Fcn32s::new(config.clone(), &device)?;
        let vgg = init_vgg16(config.backbone(), &device)?;

        copy_params_from_vgg16(&fcn, &vgg)?;
        let once: HashMap<String, Vec<f32>> = fcn
            .state_dict()?
            .into_iter()
            .map(|(k, v)| (k, v.flatten_all().and_then(|t| t.to_vec1()).unwrap()))
            .collect();

        copy_params_from_vgg16(&fcn, &vgg)?;
        let twice: HashMap<String, Vec<f32>> = fcn
            .state_dict()?
            .into_iter()
            .map(|(k, v)| (k, v.flatten_all().and_then(|t| t.to_vec1()).unwrap()))
            .collect();

        assert_eq!(once, twice);

        Ok(())
    }

    #[test]
    fn test_shape_mismatch_is_fatal() -> crate::Result<()> {
        let device = Device::Cpu;
        let config = tiny_config();
        let fcn = Fcn32s::new(config.clone(), &device)?;

        let mut backbone = config.backbone();
        backbone.widths[1] += 1;
        let vgg = init_vgg16(backbone, &device)?;

        let result = copy_params_from_vgg16(&fcn, &vgg);
        assert!(matches!(result, Err(crate::FcnError::ShapeMismatch { .. })));

        // Nothing was written
        let conv1 = fcn.feature_convs()[0].weight();
        assert_eq!(conv1.tensor().abs()?.sum_all()?.to_scalar::<f32>()?, 0.0);

        Ok(())
    }

    #[test]
    fn test_fc_width_mismatch_is_fatal() -> crate::Result<()> {
        let device = Device::Cpu;
        let config = tiny_config();
        let fcn = Fcn32s::new(config.clone(), &device)?;

        let mut backbone = config.backbone();
        backbone.pool_size = 6;
        let vgg = init_vgg16(backbone, &device)?;

        assert!(matches!(
            copy_params_from_vgg16(&fcn, &vgg),
            Err(crate::FcnError::ShapeMismatch { .. })
        ));

        Ok(())
    }
}
