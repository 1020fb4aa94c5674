/// Experiment configuration
///
/// Everything an invoking script needs to wire a training run together,
/// loadable from JSON so experiment variants can live outside the code.
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::training::checkpoint::CheckpointPaths;
use crate::training::objective::Objective;
use crate::training::optimizer::OptimizerKind;
use crate::training::TrainingConfig;

/// Kind of supervised task, which fixes the validation metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// Single-label classification, selected on accuracy
    Classification,
    /// Multi-label classification, selected on macro F1
    Multilabel,
    /// Regression, selected on validation loss
    Regression,
}

impl TaskKind {
    /// Objective used when none is given explicitly
    pub fn default_objective(&self) -> Objective {
        match self {
            TaskKind::Classification => Objective::CrossEntropy,
            TaskKind::Multilabel => Objective::BceWithLogits,
            TaskKind::Regression => Objective::Mse,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Classification => "classification",
            TaskKind::Multilabel => "multilabel",
            TaskKind::Regression => "regression",
        }
    }
}

impl Default for TaskKind {
    fn default() -> Self {
        TaskKind::Classification
    }
}

impl std::str::FromStr for TaskKind {
    type Err = crate::MultiBenchError;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "classification" => Ok(TaskKind::Classification),
            "multilabel" => Ok(TaskKind::Multilabel),
            "regression" => Ok(TaskKind::Regression),
            other => Err(crate::MultiBenchError::Config(format!(
                "Invalid task: {}. Must be 'classification', 'multilabel', or 'regression'",
                other
            ))),
        }
    }
}

/// Serializable description of one training run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Name of the benchmark dataset (used in robustness artifact names)
    pub example_name: String,

    /// Name of the method being evaluated
    pub method_name: String,

    /// Task type
    pub task: TaskKind,

    /// Number of training epochs
    pub epochs: usize,

    /// Batch size for all loaders
    pub batch_size: usize,

    /// Optimizer family
    pub optimizer: OptimizerKind,

    /// Learning rate
    pub learning_rate: f64,

    /// Weight decay
    pub weight_decay: f64,

    /// Gradient norm clipping threshold
    pub clip_norm: f64,

    /// Stop after too many epochs without improvement
    pub early_stop: bool,

    /// Report AUPRC on validation (binary classification)
    pub auprc: bool,

    /// Loss function; defaults to the task's natural objective
    pub objective: Option<Objective>,

    /// Cast every modality to f32 before encoding
    pub input_to_float: bool,

    /// Where the best multimodal bundle is written
    pub save: PathBuf,

    /// Where the best unimodal encoder is written
    pub save_encoder: PathBuf,

    /// Where the best unimodal head is written
    pub save_head: PathBuf,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        let paths = CheckpointPaths::default();
        Self {
            example_name: "default".to_string(),
            method_name: "My method".to_string(),
            task: TaskKind::Classification,
            epochs: 30,
            batch_size: 32,
            optimizer: OptimizerKind::RmsProp,
            learning_rate: 1e-3,
            weight_decay: 0.0,
            clip_norm: 8.0,
            early_stop: false,
            auprc: false,
            objective: None,
            input_to_float: true,
            save: paths.model,
            save_encoder: paths.encoder,
            save_head: paths.head,
        }
    }
}

impl ExperimentConfig {
    /// Read configuration from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let file = File::open(path.as_ref())?;
        let config: ExperimentConfig = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.epochs == 0 {
            return Err(crate::MultiBenchError::Config(
                "epochs must be > 0".to_string(),
            ));
        }

        if self.batch_size == 0 {
            return Err(crate::MultiBenchError::Config(
                "batch_size must be > 0".to_string(),
            ));
        }

        if !(self.learning_rate > 0.0) {
            return Err(crate::MultiBenchError::Config(format!(
                "learning_rate must be > 0, got {}",
                self.learning_rate
            )));
        }

        if self.weight_decay < 0.0 {
            return Err(crate::MultiBenchError::Config(format!(
                "weight_decay must be >= 0, got {}",
                self.weight_decay
            )));
        }

        if !(self.clip_norm > 0.0) {
            return Err(crate::MultiBenchError::Config(format!(
                "clip_norm must be > 0, got {}",
                self.clip_norm
            )));
        }

        if self.auprc && self.task != TaskKind::Classification {
            return Err(crate::MultiBenchError::Config(
                "auprc is only defined for classification tasks".to_string(),
            ));
        }

        Ok(())
    }

    /// Training-loop configuration for this experiment
    pub fn training_config(&self) -> TrainingConfig {
        TrainingConfig {
            epochs: self.epochs,
            task: self.task,
            optimizer: self.optimizer,
            learning_rate: self.learning_rate,
            weight_decay: self.weight_decay,
            objective: self.objective.unwrap_or_else(|| self.task.default_objective()).into(),
            clip_norm: self.clip_norm,
            early_stop: self.early_stop,
            auprc: self.auprc,
            input_to_float: self.input_to_float,
            checkpoint: CheckpointPaths {
                model: self.save.clone(),
                encoder: self.save_encoder.clone(),
                head: self.save_head.clone(),
            },
        }
    }
}
