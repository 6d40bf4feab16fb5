/// Command-line entry point for FCN-32s training runs
use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::data::{NumpySegDataset, SegDataLoader};
use crate::device::DeviceContext;
use crate::models::{copy_params_from_vgg16, loader, Fcn32s};
use crate::training::{Sgd, Trainer, TrainingConfig};
use crate::FcnConfig;

/// Split used for training
pub const TRAIN_SPLIT: &str = "train";
/// Split used for validation
pub const VALID_SPLIT: &str = "seg11valid";

/// Named training setups
#[derive(ValueEnum, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TrainPreset {
    /// One device, backbone initialized without pretrained weights
    Single,
    /// Every listed device, pretrained backbone
    DataParallel,
}

impl TrainPreset {
    pub fn max_iteration(&self) -> usize {
        match self {
            TrainPreset::Single => 100_000,
            TrainPreset::DataParallel => 50_000,
        }
    }

    pub fn pretrained(&self) -> bool {
        matches!(self, TrainPreset::DataParallel)
    }

    pub fn multi_device(&self) -> bool {
        matches!(self, TrainPreset::DataParallel)
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "train_fcn32s", about = "Train FCN-32s for semantic segmentation")]
pub struct TrainArgs {
    /// Device id(s), comma separated.
    #[arg(short, long, value_delimiter = ',', required = true)]
    pub gpu: Vec<usize>,
    /// Checkpoint to resume from.
    #[arg(long)]
    pub resume: Option<PathBuf>,
    /// Training setup.
    #[arg(long, value_enum, default_value_t = TrainPreset::Single)]
    pub preset: TrainPreset,
    /// Max iteration (defaults to the preset's).
    #[arg(long)]
    pub max_iteration: Option<usize>,
    /// Learning rate.
    #[arg(long, default_value_t = 1.0e-10)]
    pub lr: f64,
    /// Weight decay.
    #[arg(long, default_value_t = 0.0005)]
    pub weight_decay: f64,
    /// Momentum.
    #[arg(long, default_value_t = 0.99)]
    pub momentum: f64,
    /// Initialize the backbone from pretrained weights (defaults to the preset's).
    #[arg(long)]
    pub pretrained: Option<bool>,
    /// Validate every N iterations.
    #[arg(long, default_value_t = 4000)]
    pub interval_validate: usize,
    /// Dataset root containing one directory per split.
    #[arg(long, default_value = "~/data/datasets")]
    pub dataset_root: String,
    /// Number of classes.
    #[arg(long, default_value_t = 21)]
    pub n_class: usize,
    /// Random seed.
    #[arg(long, default_value_t = 1337)]
    pub seed: u64,
    /// Directory receiving one subdirectory per run.
    #[arg(long, default_value = "logs")]
    pub out_root: PathBuf,
}

/// Resolved settings of one run, written to `config.json`
#[derive(Serialize, Debug, Clone)]
pub struct RunConfig {
    pub arch: String,
    pub preset: TrainPreset,
    pub gpu: Vec<usize>,
    pub resume: Option<PathBuf>,
    pub pretrained: bool,
    pub dataset_root: PathBuf,
    pub seed: u64,
    pub batch_size: usize,
    pub model: FcnConfig,
    pub training: TrainingConfig,
}

impl RunConfig {
    /// Apply preset defaults and explicit overrides.
    pub fn resolve(args: &TrainArgs, out_dir: PathBuf) -> Self {
        let model = FcnConfig {
            n_class: args.n_class,
            ..FcnConfig::default()
        };

        let training = TrainingConfig {
            max_iteration: args.max_iteration.unwrap_or_else(|| args.preset.max_iteration()),
            interval_validate: args.interval_validate,
            lr: args.lr,
            momentum: args.momentum,
            weight_decay: args.weight_decay,
            size_average: false,
            out_dir,
        };

        let gpu = if args.preset.multi_device() {
            args.gpu.clone()
        } else {
            args.gpu.iter().copied().take(1).collect()
        };

        Self {
            arch: crate::models::FCN32S_ARCH.to_string(),
            preset: args.preset,
            gpu,
            resume: args.resume.clone(),
            pretrained: args.pretrained.unwrap_or_else(|| args.preset.pretrained()),
            dataset_root: expand_home(&args.dataset_root),
            seed: args.seed,
            batch_size: 1,
            model,
            training,
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> crate::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~") {
        Some(rest) => {
            let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_default();
            home.join(rest.trim_start_matches('/'))
        }
        None => PathBuf::from(path),
    }
}

/// Run directory named after the current local time
pub fn timestamped_dir(out_root: &Path) -> PathBuf {
    out_root.join(chrono::Local::now().format("%Y%m%d_%H%M%S.%6f").to_string())
}

/// Load the training and validation splits, rejecting either one when empty.
pub fn load_splits(
    root: &Path,
    n_class: usize,
) -> anyhow::Result<(NumpySegDataset, NumpySegDataset)> {
    let train_set = NumpySegDataset::from_directory(root, TRAIN_SPLIT, n_class)?;
    if train_set.is_empty() {
        anyhow::bail!("training split {} is empty", TRAIN_SPLIT);
    }
    let val_set = NumpySegDataset::from_directory(root, VALID_SPLIT, n_class)?;
    if val_set.is_empty() {
        anyhow::bail!("validation split {} is empty", VALID_SPLIT);
    }
    Ok((train_set, val_set))
}

pub fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    let run = RunConfig::resolve(&args, timestamped_dir(&args.out_root));
    run.model.validate()?;
    run.training.validate()?;

    std::fs::create_dir_all(&run.training.out_dir)?;
    run.save(run.training.out_dir.join("config.json"))?;
    log::info!("Run directory: {}", run.training.out_dir.display());

    let devices = DeviceContext::from_ordinals(&run.gpu)?;
    let seeded = devices.set_seed(run.seed);
    log::info!("Devices: {:?}", devices.devices());

    // 1. datasets
    let (train_set, val_set) = load_splits(&run.dataset_root, run.model.n_class)?;
    let train_loader = SegDataLoader::new(train_set, run.batch_size, true, run.seed);
    let val_loader = SegDataLoader::new(val_set, run.batch_size, false, run.seed);

    // 2. model
    let model = Fcn32s::new(run.model.clone(), devices.primary())?;
    if run.resume.is_none() {
        let backbone = run.model.backbone();
        let vgg = if run.pretrained {
            loader::load_vgg16(backbone, loader::pretrained_vgg16_path(), devices.primary())?
        } else {
            log::warn!("Initializing from an untrained VGG-16");
            if !seeded {
                log::warn!("Device RNG is unseeded, this initialization is not reproducible");
            }
            loader::init_vgg16(backbone, devices.primary())?
        };
        copy_params_from_vgg16(&model, &vgg)?;
    }

    // 3. optimizer
    let optimizer = Sgd::for_fcn(&model, &run.training.sgd())?;

    let mut trainer = Trainer::new(
        model,
        optimizer,
        &devices,
        train_loader,
        val_loader,
        run.training.clone(),
    )?;
    if let Some(path) = &run.resume {
        trainer.resume(path)?;
    }

    trainer.train()?;
    if let Some(best) = trainer.best_val_loss() {
        log::info!("Best validation loss: {:.4}", best);
    }
    Ok(())
}
