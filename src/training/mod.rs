/// Training infrastructure: losses, optimizers, clipping, metrics,
/// checkpoint selection and the epoch loop
pub mod checkpoint;
pub mod clip;
pub mod metrics;
pub mod objective;
pub mod optimizer;
pub mod selection;
pub mod trainer;

pub use checkpoint::{CheckpointMetadata, CheckpointPaths};
pub use objective::{Criterion, Objective, ObjectiveArgs};
pub use optimizer::{OptimizerKind, TrainOptimizer};
pub use selection::{BestMetricTracker, MetricDirection, PATIENCE_THRESHOLD};
pub use trainer::{EpochSummary, Trainer, TrainingConfig, TrainingHistory};
