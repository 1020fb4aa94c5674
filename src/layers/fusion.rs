/// Parameter-free fusion operators
use candle_core::{Error, Result, Tensor};

use super::Fusion;

/// Concatenates flattened representations along the feature axis
pub struct Concat;

impl Fusion for Concat {
    fn forward(&self, reps: &[Tensor], _train: bool) -> Result<Tensor> {
        if reps.is_empty() {
            return Err(Error::Msg("Concat fusion needs at least one input".to_string()));
        }
        let flat = reps
            .iter()
            .map(|r| r.flatten_from(1))
            .collect::<Result<Vec<_>>>()?;
        Tensor::cat(&flat, 1)
    }
}

/// Elementwise sum of equally shaped representations
pub struct Sum;

impl Fusion for Sum {
    fn forward(&self, reps: &[Tensor], _train: bool) -> Result<Tensor> {
        let (first, rest) = reps
            .split_first()
            .ok_or_else(|| Error::Msg("Sum fusion needs at least one input".to_string()))?;
        rest.iter().try_fold(first.clone(), |acc, r| acc + r)
    }
}
