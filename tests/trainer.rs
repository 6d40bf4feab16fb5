use candle_core::{Device, Tensor};
use ndarray::{Array3, Array4};
use std::collections::HashMap;
use std::path::Path;

use fcn_train::data::{DatasetMetadata, NumpySegDataset, SegDataLoader};
use fcn_train::training::{
    Checkpoint, Sgd, Trainer, TrainerState, TrainingConfig, ValidationReport,
};
use fcn_train::{DeviceContext, Fcn32s, FcnConfig, FcnError, Result};

const SIZE: usize = 32;

fn small_config() -> FcnConfig {
    FcnConfig {
        n_class: 3,
        in_channels: 3,
        widths: [2, 2, 4, 4, 4],
        fc_width: 8,
        fc_kernel: 7,
        input_pad: 100,
        dropout: 0.0,
    }
}

fn dataset(n: usize) -> Result<NumpySegDataset> {
    let images = Array4::from_shape_fn((n, 3, SIZE, SIZE), |(i, c, y, x)| {
        ((i * 7 + c * 3 + y * 5 + x) % 11) as f32 / 11.0 - 0.5
    });
    let labels = Array3::from_shape_fn((n, SIZE, SIZE), |(i, y, x)| {
        if y == 0 {
            -1
        } else {
            ((i + x / 8) % 3) as i64
        }
    });
    let metadata = DatasetMetadata {
        n_class: 3,
        class_names: Vec::new(),
        description: "synthetic".to_string(),
    };
    NumpySegDataset::from_arrays(images, labels, metadata)
}

fn random_model(device: &Device) -> Result<Fcn32s> {
    let model = Fcn32s::new(small_config(), device)?;
    for param in model.named_parameters() {
        let values = Tensor::randn(0f32, 0.05, param.tensor().dims(), device)?;
        param.var.set(&values)?;
    }
    Ok(model)
}

fn training_config(
    out_dir: &Path,
    max_iteration: usize,
    interval_validate: usize,
) -> TrainingConfig {
    TrainingConfig {
        max_iteration,
        interval_validate,
        lr: 1e-4,
        momentum: 0.9,
        weight_decay: 5e-4,
        size_average: true,
        out_dir: out_dir.to_path_buf(),
    }
}

fn trainer(
    model: Fcn32s,
    devices: &DeviceContext,
    config: TrainingConfig,
    batch_size: usize,
) -> Result<Trainer<SegDataLoader, SegDataLoader>> {
    let optimizer = Sgd::for_fcn(&model, &config.sgd())?;
    Trainer::new(
        model,
        optimizer,
        devices,
        SegDataLoader::new(dataset(3)?, batch_size, true, 1337),
        SegDataLoader::new(dataset(2)?, 1, false, 1337),
        config,
    )
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    Ok((a - b)?.abs()?.max_all()?.to_scalar::<f32>()?)
}

#[test]
fn test_validates_at_interval_and_halts() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let devices = DeviceContext::cpu();
    let mut trainer = trainer(
        random_model(devices.primary())?,
        &devices,
        training_config(dir.path(), 10, 4),
        1,
    )?;
    assert_eq!(trainer.state(), TrainerState::Idle);

    trainer.train()?;

    assert_eq!(trainer.state(), TrainerState::Done);
    assert_eq!(trainer.iteration(), 10);
    // Three batches per epoch: iterations 4, 7 and 10 start a new epoch
    assert_eq!(trainer.epoch(), 3);

    let validated: Vec<usize> = trainer.validations().iter().map(|r| r.iteration).collect();
    assert_eq!(validated, vec![4, 8]);
    assert!(trainer.best_val_loss().is_some());

    for name in [
        "checkpoint_e1_i4.safetensors",
        "checkpoint_e2_i8.safetensors",
        "checkpoint.safetensors",
        "model_best.safetensors",
        "log.csv",
    ] {
        assert!(dir.path().join(name).exists(), "{} missing", name);
    }
    assert!(!dir.path().join("checkpoint_e3_i10.safetensors").exists());

    // Header, ten training rows and two validation rows
    let log = std::fs::read_to_string(dir.path().join("log.csv"))?;
    assert_eq!(log.lines().count(), 13);

    Ok(())
}

#[test]
fn test_resume_restores_position_and_parameters() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let devices = DeviceContext::cpu();

    let mut first = trainer(
        random_model(devices.primary())?,
        &devices,
        training_config(dir.path(), 4, 4),
        1,
    )?;
    first.train()?;
    let saved = first.model().state_dict()?;
    let checkpoint = dir.path().join("checkpoint.safetensors");

    let resumed_dir = tempfile::tempdir()?;
    let mut second = trainer(
        random_model(devices.primary())?,
        &devices,
        training_config(resumed_dir.path(), 7, 4),
        1,
    )?;
    second.resume(&checkpoint)?;

    assert_eq!(second.iteration(), 4);
    assert_eq!(second.epoch(), first.epoch());
    let (saved_best, restored_best) = (first.best_val_loss(), second.best_val_loss());
    assert!(saved_best.is_some());
    assert!((saved_best.unwrap_or(0.0) - restored_best.unwrap_or(f64::NAN)).abs() < 1e-9);
    assert_eq!(second.optimizer().state(), first.optimizer().state());

    let restored = second.model().state_dict()?;
    for (name, tensor) in &saved {
        assert_eq!(max_abs_diff(tensor, &restored[name])?, 0.0, "{}", name);
    }

    let buffers = first.optimizer().momentum_buffers()?;
    let restored_buffers = second.optimizer().momentum_buffers()?;
    assert_eq!(buffers.len(), restored_buffers.len());
    for (name, tensor) in &buffers {
        assert_eq!(max_abs_diff(tensor, &restored_buffers[name])?, 0.0, "{}", name);
    }

    // 4 + 3 iterations, the next validation would be at 8
    second.train()?;
    assert_eq!(second.iteration(), 7);
    assert!(second.validations().is_empty());

    Ok(())
}

#[test]
fn test_best_checkpoint_tracks_lowest_validation_loss() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let devices = DeviceContext::cpu();
    let mut first = trainer(
        random_model(devices.primary())?,
        &devices,
        training_config(dir.path(), 12, 2),
        1,
    )?;
    first.train()?;

    // First report with the lowest loss; ties keep the earlier one
    let lowest = first
        .validations()
        .iter()
        .fold(None, |best: Option<&ValidationReport>, report| match best {
            Some(best) if best.loss <= report.loss => Some(best),
            _ => Some(report),
        })
        .copied()
        .expect("six validations");
    assert_eq!(first.validations().len(), 6);
    assert_eq!(first.best_val_loss(), Some(lowest.loss));

    let best = Checkpoint::load(dir.path().join("model_best.safetensors"), devices.primary())?;
    assert_eq!(best.metadata.iteration, lowest.iteration);
    assert_eq!(best.metadata.best_val_loss, Some(lowest.loss));

    let latest = Checkpoint::load(dir.path().join("checkpoint.safetensors"), devices.primary())?;
    assert_eq!(latest.metadata.iteration, 12);
    assert_eq!(latest.metadata.best_val_loss, Some(lowest.loss));

    // A persisted best that no later validation can beat
    let mut unbeatable = latest;
    unbeatable.metadata.best_val_loss = Some(0.0);
    let unbeatable_path = dir.path().join("unbeatable.safetensors");
    unbeatable.save(&unbeatable_path)?;

    let resumed_dir = tempfile::tempdir()?;
    let mut second = trainer(
        random_model(devices.primary())?,
        &devices,
        training_config(resumed_dir.path(), 16, 2),
        1,
    )?;
    second.resume(&unbeatable_path)?;
    second.train()?;

    assert_eq!(second.validations().len(), 2);
    assert!(second.validations().iter().all(|r| r.loss > 0.0));
    assert_eq!(second.best_val_loss(), Some(0.0));
    assert!(!resumed_dir.path().join("model_best.safetensors").exists());

    let latest = Checkpoint::load(
        resumed_dir.path().join("checkpoint.safetensors"),
        devices.primary(),
    )?;
    assert_eq!(latest.metadata.iteration, 16);
    assert_eq!(latest.metadata.best_val_loss, Some(0.0));

    Ok(())
}

#[test]
fn test_resume_at_bound_does_nothing() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let devices = DeviceContext::cpu();

    let mut first = trainer(
        random_model(devices.primary())?,
        &devices,
        training_config(dir.path(), 4, 2),
        1,
    )?;
    first.train()?;

    let resumed_dir = tempfile::tempdir()?;
    let mut second = trainer(
        random_model(devices.primary())?,
        &devices,
        training_config(resumed_dir.path(), 4, 2),
        1,
    )?;
    second.resume(dir.path().join("checkpoint.safetensors"))?;
    let before = second.model().state_dict()?;

    second.train()?;
    assert_eq!(second.iteration(), 4);
    assert_eq!(second.state(), TrainerState::Done);

    let after = second.model().state_dict()?;
    for (name, tensor) in &before {
        assert_eq!(max_abs_diff(tensor, &after[name])?, 0.0, "{}", name);
    }

    // Only the header was written
    let log = std::fs::read_to_string(resumed_dir.path().join("log.csv"))?;
    assert_eq!(log.lines().count(), 1);

    Ok(())
}

#[test]
fn test_resume_from_missing_checkpoint_fails() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let devices = DeviceContext::cpu();
    let mut trainer = trainer(
        random_model(devices.primary())?,
        &devices,
        training_config(dir.path(), 4, 2),
        1,
    )?;

    let err = trainer.resume(dir.path().join("missing.safetensors")).unwrap_err();
    assert!(matches!(err, FcnError::Checkpoint(_)));
    assert_eq!(trainer.iteration(), 0);

    Ok(())
}

#[test]
fn test_validation_is_read_only() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let devices = DeviceContext::cpu();
    let mut config = small_config();
    config.dropout = 0.5;
    let model = Fcn32s::new(config, devices.primary())?;
    for param in model.named_parameters() {
        let values = Tensor::randn(0f32, 0.05, param.tensor().dims(), devices.primary())?;
        param.var.set(&values)?;
    }
    let mut trainer = trainer(model, &devices, training_config(dir.path(), 4, 2), 1)?;

    let before = trainer.model().state_dict()?;
    let first = trainer.validate()?;
    let second = trainer.validate()?;
    let after = trainer.model().state_dict()?;

    assert_eq!(first.loss, second.loss);
    assert_eq!(first.scores, second.scores);
    assert_eq!(trainer.iteration(), 0);
    for (name, tensor) in &before {
        assert_eq!(max_abs_diff(tensor, &after[name])?, 0.0, "{}", name);
    }

    Ok(())
}

#[test]
fn test_nan_loss_is_fatal() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let devices = DeviceContext::cpu();
    let model = random_model(devices.primary())?;
    let bias = model
        .named_parameters()
        .into_iter()
        .find(|p| p.name == "score_fr.bias")
        .expect("score_fr.bias");
    bias.var.set(&Tensor::new(&[f32::NAN, 0.0, 0.0], devices.primary())?)?;

    let mut trainer = trainer(model, &devices, training_config(dir.path(), 4, 2), 1)?;
    let err = trainer.train().unwrap_err();
    assert!(matches!(err, FcnError::Training(_)));
    assert_eq!(trainer.iteration(), 0);

    Ok(())
}

#[test]
fn test_data_parallel_matches_single_device() -> Result<()> {
    let device = Device::Cpu;
    let reference = random_model(&device)?;
    let before = reference.state_dict()?;

    // Two iterations of batch size 2 over three examples, no validation. The
    // learning rate keeps the update well above f32 rounding of the weights.
    type RunOutput = (HashMap<String, Tensor>, String);
    let run = |devices: DeviceContext, size_average: bool| -> Result<RunOutput> {
        let dir = tempfile::tempdir()?;
        let model = Fcn32s::new(small_config(), devices.primary())?;
        model.load_state_dict(&before)?;
        let config = TrainingConfig {
            lr: if size_average { 1e-1 } else { 1e-3 },
            weight_decay: 0.0,
            size_average,
            ..training_config(dir.path(), 2, 100)
        };
        let mut trainer = trainer(model, &devices, config, 2)?;
        trainer.train()?;
        let log = std::fs::read_to_string(dir.path().join("log.csv"))?;
        Ok((trainer.model().state_dict()?, log))
    };

    for size_average in [false, true] {
        let (a, log_a) = run(DeviceContext::cpu(), size_average)?;
        let (b, log_b) = run(DeviceContext::new(vec![Device::Cpu, Device::Cpu])?, size_average)?;

        let losses = |log: &str| -> Vec<f64> {
            log.lines()
                .skip(1)
                .filter_map(|line| line.split(',').nth(2).and_then(|v| v.parse().ok()))
                .collect()
        };
        let (losses_a, losses_b) = (losses(&log_a), losses(&log_b));
        assert_eq!(losses_a.len(), 2);
        for (la, lb) in losses_a.iter().zip(&losses_b) {
            assert!((la - lb).abs() <= 1e-4 * la.abs() + 1e-6, "{} vs {}", la, lb);
        }

        let mut moved = 0;
        for (name, start) in &before {
            let update_a = (&a[name] - start)?;
            let update_b = (&b[name] - start)?;
            let scale = update_a.abs()?.max_all()?.to_scalar::<f32>()?;
            if scale > 0.0 {
                moved += 1;
            }
            let diff = max_abs_diff(&update_a, &update_b)?;
            assert!(
                diff <= 1e-2 * scale + 1e-7,
                "size_average={} {}: {} (update {})",
                size_average,
                name,
                diff,
                scale
            );
        }
        assert!(moved > 0);
    }

    Ok(())
}
