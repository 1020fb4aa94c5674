/// Sequence pooling for packed (variable-length) modalities
use candle_core::{DType, Module, Result, Tensor};
use candle_nn::{linear, Linear, VarBuilder};

use super::Encoder;
use crate::data::ModalityInput;

/// Mean over the valid time steps of each sequence.
///
/// `values`: [batch, max_len, features], `lengths`: [batch]. Padding past
/// each length is ignored; a zero length yields a zero vector.
pub fn masked_mean(values: &Tensor, lengths: &Tensor) -> Result<Tensor> {
    let (_batch, max_len, _features) = values.dims3()?;
    let device = values.device();

    let steps = Tensor::arange(0u32, max_len as u32, device)?.unsqueeze(0)?;
    let lengths = lengths.to_dtype(DType::U32)?.unsqueeze(1)?;
    // [batch, max_len], 1.0 on valid steps
    let mask = steps.broadcast_lt(&lengths)?.to_dtype(values.dtype())?;

    let summed = values.broadcast_mul(&mask.unsqueeze(2)?)?.sum(1)?;
    let counts = mask.sum_keepdim(1)?.maximum(1f32)?;
    summed.broadcast_div(&counts)
}

/// Masked mean pooling followed by a linear projection
pub struct MaskedMeanPool {
    proj: Linear,
}

impl MaskedMeanPool {
    pub fn new(features: usize, out_dim: usize, vb: VarBuilder) -> Result<Self> {
        let proj = linear(features, out_dim, vb.pp("proj"))?;
        Ok(Self { proj })
    }
}

impl Encoder for MaskedMeanPool {
    fn forward(&self, input: &ModalityInput, _train: bool) -> Result<Tensor> {
        let pooled = match input {
            ModalityInput::Packed { values, lengths } => masked_mean(values, lengths)?,
            // Dense sequences: every step is valid
            ModalityInput::Dense(values) => values.mean(1)?,
        };
        self.proj.forward(&pooled)
    }
}
