//! MultiBench in Rust - supervised multimodal training on candle
//!
//! Training loops, checkpoint selection and robustness evaluation for
//! experiments that combine several unimodal encoders through a fusion
//! operator and a prediction head.
//!
//! # Architecture
//!
//! - **Encoders**: one per modality, map raw input to a representation
//! - **Fusion**: combines the per-modality representations
//! - **Head**: maps the fused representation to task predictions
//!
//! The [`training::Trainer`] drives either a [`MultimodalModel`] or a
//! [`UnimodalModel`] through epochs of optimization and validation, keeping
//! only the best checkpoint seen so far.
//!
//! # Example
//!
//! ```ignore
//! use multibench::{MultimodalModel, TaskKind};
//! use multibench::training::{Trainer, TrainingConfig};
//!
//! let model = MultimodalModel::new(varmap, encoders, Box::new(Concat), head)?;
//! let config = TrainingConfig { epochs: 30, task: TaskKind::Classification, ..Default::default() };
//! let mut trainer = Trainer::new(model, Vec::new(), config)?;
//! let history = trainer.train(&mut train_loader, &mut valid_loader, &device)?;
//! ```

pub mod config;
pub mod data;
pub mod eval;
pub mod layers;
pub mod models;
pub mod training;
pub mod utils;

// Re-export commonly used items
pub use config::{ExperimentConfig, TaskKind};
pub use data::{Batch, BatchDataLoader, ModalityInput};
pub use models::{ModelOutput, MultimodalModel, TrainableModel, UnimodalModel};

/// Library error types
#[derive(Debug, thiserror::Error)]
pub enum MultiBenchError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Data error: {0}")]
    Data(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Training error: {0}")]
    Training(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Safetensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),

    #[error("NumPy read error: {0}")]
    Npy(#[from] ndarray_npy::ReadNpyError),
}

pub type Result<T> = std::result::Result<T, MultiBenchError>;
