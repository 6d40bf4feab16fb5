/// Training loop for FCN-32s
use candle_core::ModuleT;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::checkpoint::Checkpoint;
use super::loss::{cross_entropy2d, predict};
use super::metrics::{label_accuracy_score, ConfusionMatrix, SegmentationScores};
use super::optimizer::{Sgd, SgdConfig};
use super::parallel::DataParallel;
use super::runlog::RunLog;
use crate::data::SegmentationLoader;
use crate::device::DeviceContext;
use crate::models::Fcn32s;

/// Training configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Stop once this many iterations have completed
    pub max_iteration: usize,
    /// Validate and checkpoint every N iterations
    pub interval_validate: usize,
    /// Base learning rate
    pub lr: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    /// Average the loss over labelled pixels instead of summing
    pub size_average: bool,
    /// Run directory for `log.csv` and checkpoints
    pub out_dir: PathBuf,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            max_iteration: 100_000,
            interval_validate: 4000,
            lr: 1.0e-10,
            momentum: 0.99,
            weight_decay: 0.0005,
            size_average: false,
            out_dir: PathBuf::from("logs"),
        }
    }
}

impl TrainingConfig {
    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.interval_validate == 0 {
            return Err(crate::FcnError::Config(
                "interval_validate must be positive".to_string(),
            ));
        }

        if !(self.lr > 0.0) {
            return Err(crate::FcnError::Config(format!(
                "Invalid learning rate: {}. Must be positive",
                self.lr
            )));
        }

        if !(0.0..1.0).contains(&self.momentum) {
            return Err(crate::FcnError::Config(format!(
                "Invalid momentum: {}. Must be in [0, 1)",
                self.momentum
            )));
        }

        if self.weight_decay < 0.0 {
            return Err(crate::FcnError::Config(format!(
                "Invalid weight decay: {}",
                self.weight_decay
            )));
        }

        Ok(())
    }

    /// Optimizer settings of this run
    pub fn sgd(&self) -> SgdConfig {
        SgdConfig {
            lr: self.lr,
            momentum: self.momentum,
            weight_decay: self.weight_decay,
        }
    }
}

/// Where the trainer is in its loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerState {
    Idle,
    Running,
    Validating,
    Checkpointing,
    Done,
}

/// Outcome of one validation pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationReport {
    pub epoch: usize,
    pub iteration: usize,
    /// Mean over batches of the per-batch loss
    pub loss: f64,
    pub scores: SegmentationScores,
}

/// Trainer for FCN-32s
pub struct Trainer<T: SegmentationLoader, V: SegmentationLoader> {
    model: Fcn32s,
    optimizer: Sgd,
    parallel: DataParallel,
    train_loader: T,
    val_loader: V,
    config: TrainingConfig,
    run_log: RunLog,
    state: TrainerState,
    epoch: usize,
    iteration: usize,
    best_val_loss: Option<f64>,
    validations: Vec<ValidationReport>,
}

impl<T: SegmentationLoader, V: SegmentationLoader> Trainer<T, V> {
    /// Create new trainer
    ///
    /// `model` must live on the primary device of `devices`; one replica is
    /// created on each further device. The run directory is created if needed.
    pub fn new(
        model: Fcn32s,
        optimizer: Sgd,
        devices: &DeviceContext,
        train_loader: T,
        val_loader: V,
        config: TrainingConfig,
    ) -> crate::Result<Self> {
        config.validate()?;

        if !model.device().same_device(devices.primary()) {
            return Err(crate::FcnError::Config(format!(
                "model lives on {:?}, primary device is {:?}",
                model.device(),
                devices.primary()
            )));
        }

        std::fs::create_dir_all(&config.out_dir)?;
        let run_log = RunLog::create(config.out_dir.join("log.csv"))?;
        let parallel = DataParallel::new(&model, devices)?;

        Ok(Self {
            model,
            optimizer,
            parallel,
            train_loader,
            val_loader,
            config,
            run_log,
            state: TrainerState::Idle,
            epoch: 0,
            iteration: 0,
            best_val_loss: None,
            validations: Vec::new(),
        })
    }

    /// Restore model, optimizer and counters from a checkpoint before training.
    pub fn resume<P: AsRef<Path>>(&mut self, path: P) -> crate::Result<()> {
        let checkpoint = Checkpoint::load(path.as_ref(), self.model.device())?;
        checkpoint.restore(&self.model, &mut self.optimizer)?;
        self.parallel.sync(&self.model)?;

        self.epoch = checkpoint.metadata.epoch;
        self.iteration = checkpoint.metadata.iteration;
        self.best_val_loss = checkpoint.metadata.best_val_loss;

        log::info!(
            "Resumed from {:?} at epoch {}, iteration {}",
            path.as_ref(),
            self.epoch,
            self.iteration
        );
        Ok(())
    }

    /// Full training loop
    ///
    /// Runs until `max_iteration` iterations have completed, validating and
    /// checkpointing every `interval_validate` iterations.
    pub fn train(&mut self) -> crate::Result<()> {
        self.state = TrainerState::Running;
        log::info!(
            "Starting training at iteration {} (max {}), {} batches per epoch",
            self.iteration,
            self.config.max_iteration,
            self.train_loader.num_batches()
        );

        while self.iteration < self.config.max_iteration {
            let (images, labels) = match self.train_loader.next_batch(self.model.device())? {
                Some(batch) => batch,
                None => {
                    self.epoch += 1;
                    self.train_loader.reset();
                    log::info!("=== Epoch {} ===", self.epoch);
                    self.train_loader.next_batch(self.model.device())?.ok_or_else(|| {
                        crate::FcnError::Training("training loader is empty".to_string())
                    })?
                }
            };

            self.train_iteration(&images, &labels)?;

            if self.iteration % self.config.interval_validate == 0 {
                let report = self.validate()?;
                self.save_checkpoints(&report)?;
                self.state = TrainerState::Running;
            }
        }

        self.state = TrainerState::Done;
        log::info!("Training complete at iteration {}", self.iteration);
        Ok(())
    }

    /// Forward, backward and one optimizer step on a batch.
    fn train_iteration(
        &mut self,
        images: &candle_core::Tensor,
        labels: &candle_core::Tensor,
    ) -> crate::Result<()> {
        let step = self
            .parallel
            .forward_backward(&self.model, images, labels, self.config.size_average)?;
        if step.loss.is_nan() {
            return Err(crate::FcnError::Training(format!(
                "loss is nan while training at iteration {}",
                self.iteration
            )));
        }

        self.optimizer.step(&step.grads)?;
        self.parallel.sync(&self.model)?;
        self.iteration += 1;

        let truth = labels.flatten_all()?.to_vec1::<u32>()?;
        let pred = step.predictions.flatten_all()?.to_vec1::<u32>()?;
        let scores = label_accuracy_score(&[truth], &[pred], self.model.config().n_class);

        log::debug!(
            "Iteration {}: loss={:.4}, acc={:.4}, mean_iu={:.4}",
            self.iteration,
            step.loss,
            scores.acc,
            scores.mean_iu
        );
        self.run_log
            .train_row(self.epoch, self.iteration, step.loss, &scores)
    }

    /// Score the model on the whole validation set without updating it.
    pub fn validate(&mut self) -> crate::Result<ValidationReport> {
        self.state = TrainerState::Validating;
        self.val_loader.reset();

        let mut hist = ConfusionMatrix::new(self.model.config().n_class);
        let mut total_loss = 0.0;
        let mut num_batches = 0usize;

        while let Some((images, labels)) = self.val_loader.next_batch(self.model.device())? {
            let batch_size = images.dim(0)?;
            let scores = self.model.forward_t(&images, false)?;
            let loss = (cross_entropy2d(&scores, &labels, self.config.size_average)?
                / batch_size as f64)?
                .to_dtype(candle_core::DType::F64)?
                .to_scalar::<f64>()?;
            if loss.is_nan() {
                return Err(crate::FcnError::Training(
                    "loss is nan while validating".to_string(),
                ));
            }
            total_loss += loss;
            num_batches += 1;

            let pred = predict(&scores)?;
            hist.update(
                &labels.flatten_all()?.to_vec1::<u32>()?,
                &pred.flatten_all()?.to_vec1::<u32>()?,
            );
        }

        if num_batches == 0 {
            return Err(crate::FcnError::Training(
                "validation loader is empty".to_string(),
            ));
        }

        let report = ValidationReport {
            epoch: self.epoch,
            iteration: self.iteration,
            loss: total_loss / num_batches as f64,
            scores: hist.scores(),
        };

        log::info!(
            "Validation at iteration {}: loss={:.4}, acc={:.4}, acc_cls={:.4}, mean_iu={:.4}, fwavacc={:.4}",
            report.iteration,
            report.loss,
            report.scores.acc,
            report.scores.acc_cls,
            report.scores.mean_iu,
            report.scores.fwavacc
        );
        self.run_log
            .valid_row(report.epoch, report.iteration, report.loss, &report.scores)?;
        self.validations.push(report);

        Ok(report)
    }

    /// Write the snapshot, the latest checkpoint and, on a new best loss, the best model.
    fn save_checkpoints(&mut self, report: &ValidationReport) -> crate::Result<()> {
        self.state = TrainerState::Checkpointing;

        let is_best = self.best_val_loss.map_or(true, |best| report.loss < best);
        if is_best {
            self.best_val_loss = Some(report.loss);
        }

        let checkpoint = Checkpoint::capture(
            &self.model,
            &self.optimizer,
            self.epoch,
            self.iteration,
            self.best_val_loss,
        )?;

        let out_dir = &self.config.out_dir;
        checkpoint.save(out_dir.join(format!(
            "checkpoint_e{}_i{}.safetensors",
            self.epoch, self.iteration
        )))?;
        checkpoint.save(out_dir.join("checkpoint.safetensors"))?;
        if is_best {
            checkpoint.save(out_dir.join("model_best.safetensors"))?;
        }

        Ok(())
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn best_val_loss(&self) -> Option<f64> {
        self.best_val_loss
    }

    /// Every validation run so far, oldest first
    pub fn validations(&self) -> &[ValidationReport] {
        &self.validations
    }

    pub fn model(&self) -> &Fcn32s {
        &self.model
    }

    pub fn optimizer(&self) -> &Sgd {
        &self.optimizer
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }
}
