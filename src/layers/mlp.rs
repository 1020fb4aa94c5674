/// Feed-forward building blocks
use candle_core::{Module, Result, Tensor};
use candle_nn::{linear, Dropout, Linear, VarBuilder};

use super::{Encoder, Head};
use crate::data::ModalityInput;

/// Two-layer perceptron: linear -> ReLU -> (dropout) -> linear
///
/// Inputs of rank > 2 are flattened to [batch, features] first, so the
/// same block works on images, time series and tabular rows.
pub struct Mlp {
    fc1: Linear,
    fc2: Linear,
    dropout: Option<Dropout>,
}

impl Mlp {
    /// Create new MLP
    ///
    /// # Arguments
    /// * `in_dim` - Flattened input dimension
    /// * `hidden_dim` - Hidden layer width
    /// * `out_dim` - Output dimension
    /// * `vb` - VarBuilder for parameter initialization
    pub fn new(in_dim: usize, hidden_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Self> {
        let fc1 = linear(in_dim, hidden_dim, vb.pp("fc1"))?;
        let fc2 = linear(hidden_dim, out_dim, vb.pp("fc2"))?;
        Ok(Self {
            fc1,
            fc2,
            dropout: None,
        })
    }

    /// Apply dropout with probability `p` after the hidden activation
    pub fn with_dropout(mut self, p: f32) -> Self {
        self.dropout = Some(Dropout::new(p));
        self
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = x.flatten_from(1)?;
        let hidden = Module::forward(&self.fc1, &x)?.relu()?;
        let hidden = match self.dropout {
            Some(ref dropout) => dropout.forward(&hidden, train)?,
            None => hidden,
        };
        Module::forward(&self.fc2, &hidden)
    }
}

impl Encoder for Mlp {
    fn forward(&self, input: &ModalityInput, train: bool) -> Result<Tensor> {
        self.forward_t(input.values(), train)
    }
}

impl Head for Mlp {
    fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        self.forward_t(x, train)
    }
}

/// Passes the (flattened) input through unchanged
pub struct Identity;

impl Encoder for Identity {
    fn forward(&self, input: &ModalityInput, _train: bool) -> Result<Tensor> {
        input.values().flatten_from(1)
    }
}

impl Head for Identity {
    fn forward(&self, x: &Tensor, _train: bool) -> Result<Tensor> {
        x.flatten_from(1)
    }
}
