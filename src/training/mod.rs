/// Training infrastructure for FCN-32s
pub mod checkpoint;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod parallel;
pub mod partition;
pub mod runlog;
pub mod trainer;

pub use checkpoint::{Checkpoint, CheckpointMetadata, CHECKPOINT_SCHEMA_VERSION};
pub use loss::cross_entropy2d;
pub use metrics::{label_accuracy_score, SegmentationScores};
pub use optimizer::{Sgd, SgdConfig};
pub use parallel::DataParallel;
pub use partition::{get_parameters, ParamKind};
pub use runlog::RunLog;
pub use trainer::{Trainer, TrainerState, TrainingConfig, ValidationReport};
