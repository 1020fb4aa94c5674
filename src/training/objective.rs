/// Loss functions used by the training and evaluation loops
///
/// `Objective` names the built-in losses and is what configuration files
/// select. A `Criterion` is what the loops actually call: either a built-in
/// objective or a caller-supplied closure that also sees the per-modality
/// representations, the fused representation and the raw inputs.
use std::fmt;
use std::sync::Arc;

use candle_core::{DType, Result, Tensor};
use candle_nn::loss;
use serde::{Deserialize, Serialize};

use crate::data::ModalityInput;

/// Training objective
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Objective {
    /// Softmax cross-entropy over class logits, targets are class indices
    CrossEntropy,
    /// Mean squared error
    Mse,
    /// Sigmoid + binary cross-entropy, one logit per label
    BceWithLogits,
}

impl Objective {
    /// Batch-mean loss as a scalar tensor
    ///
    /// Targets are adapted to what each loss expects: class indices lose a
    /// trailing unit dimension and become u32, float targets take the
    /// prediction's dtype and shape.
    pub fn loss(&self, pred: &Tensor, target: &Tensor) -> Result<Tensor> {
        match self {
            Objective::CrossEntropy => {
                let target = if target.rank() == pred.rank() {
                    target.squeeze(target.rank() - 1)?
                } else {
                    target.clone()
                };
                loss::cross_entropy(pred, &target.to_dtype(DType::U32)?)
            }
            Objective::Mse => {
                let target = float_target(pred, target)?;
                loss::mse(pred, &target)
            }
            Objective::BceWithLogits => {
                let target = float_target(pred, target)?;
                loss::binary_cross_entropy_with_logit(pred, &target)
            }
        }
    }
}

/// Intermediate state handed to a custom objective
#[derive(Debug, Clone, Copy)]
pub struct ObjectiveArgs<'a> {
    /// Per-modality representations, in encoder order
    pub reps: &'a [Tensor],
    /// Fusion output, absent for models that do not fuse
    pub fused: Option<&'a Tensor>,
    /// Batch inputs as fed to the model
    pub inputs: &'a [ModalityInput],
    /// Training pass (`false` during evaluation)
    pub train: bool,
}

/// Signature of a custom objective: (predictions, targets, args) -> scalar loss
pub type LossFn = dyn Fn(&Tensor, &Tensor, &ObjectiveArgs<'_>) -> Result<Tensor> + Send + Sync;

/// Loss called by the training and evaluation loops
#[derive(Clone)]
pub enum Criterion {
    Builtin(Objective),
    /// Targets are passed through untouched
    Custom(Arc<LossFn>),
}

impl Criterion {
    /// Wrap a closure as a custom objective
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&Tensor, &Tensor, &ObjectiveArgs<'_>) -> Result<Tensor> + Send + Sync + 'static,
    {
        Criterion::Custom(Arc::new(f))
    }

    /// Batch-mean loss as a scalar tensor
    pub fn loss(&self, pred: &Tensor, target: &Tensor, args: &ObjectiveArgs<'_>) -> Result<Tensor> {
        match self {
            Criterion::Builtin(objective) => objective.loss(pred, target),
            Criterion::Custom(f) => f(pred, target, args),
        }
    }

    /// The built-in objective, if any
    pub fn builtin(&self) -> Option<Objective> {
        match self {
            Criterion::Builtin(objective) => Some(*objective),
            Criterion::Custom(_) => None,
        }
    }
}

impl From<Objective> for Criterion {
    fn from(objective: Objective) -> Self {
        Criterion::Builtin(objective)
    }
}

impl fmt::Debug for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Criterion::Builtin(objective) => f.debug_tuple("Builtin").field(objective).finish(),
            Criterion::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Custom objectives compare by identity
impl PartialEq for Criterion {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Criterion::Builtin(a), Criterion::Builtin(b)) => a == b,
            (Criterion::Custom(a), Criterion::Custom(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl PartialEq<Objective> for Criterion {
    fn eq(&self, other: &Objective) -> bool {
        self.builtin() == Some(*other)
    }
}

fn float_target(pred: &Tensor, target: &Tensor) -> Result<Tensor> {
    let target = target.to_dtype(pred.dtype())?;
    if target.shape() != pred.shape() {
        // e.g. regression targets [batch] against predictions [batch, 1]
        target.reshape(pred.shape())
    } else {
        Ok(target)
    }
}
