/// Model components with a uniform forward contract
///
/// Any encoder, fusion or head can be plugged into a model bundle as a
/// trait object. The stock implementations here cover:
/// - MLP encoders and heads (with optional dropout)
/// - Masked mean pooling for packed sequences
/// - Concatenation and sum fusion
///
/// Richer unimodal architectures implement the same traits.
use candle_core::{Module, Result, Tensor};

use crate::data::ModalityInput;

pub mod fusion;
pub mod mlp;
pub mod pooling;

pub use fusion::{Concat, Sum};
pub use mlp::{Identity, Mlp};
pub use pooling::MaskedMeanPool;

/// Maps one modality's raw input to a representation, one row per example
pub trait Encoder {
    fn forward(&self, input: &ModalityInput, train: bool) -> Result<Tensor>;
}

/// Combines per-modality representations into one joint representation
pub trait Fusion {
    fn forward(&self, reps: &[Tensor], train: bool) -> Result<Tensor>;
}

/// Maps a joint (or unimodal) representation to task predictions
pub trait Head {
    fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor>;
}

impl Head for candle_nn::Linear {
    fn forward(&self, x: &Tensor, _train: bool) -> Result<Tensor> {
        Module::forward(self, &x.flatten_from(1)?)
    }
}
