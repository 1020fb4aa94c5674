/// Optimizers for the training loops
///
/// SGD and RMSprop follow the PyTorch update rules with coupled L2 weight
/// decay (the decay term is added to the gradient). AdamW comes from
/// candle-nn. All of them step from a `GradStore`, so gradients can be
/// clipped between backward and step.
use candle_core::backprop::GradStore;
use candle_core::{Result, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use serde::{Deserialize, Serialize};

/// Optimizer family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Sgd,
    RmsProp,
    AdamW,
}

impl Default for OptimizerKind {
    fn default() -> Self {
        OptimizerKind::RmsProp
    }
}

/// SGD configuration
#[derive(Debug, Clone)]
pub struct SgdConfig {
    /// Learning rate
    pub lr: f64,
    /// L2 penalty added to the gradient
    pub weight_decay: f64,
}

/// Plain stochastic gradient descent with weight decay
pub struct Sgd {
    vars: Vec<Var>,
    config: SgdConfig,
}

impl Optimizer for Sgd {
    type Config = SgdConfig;

    fn new(vars: Vec<Var>, config: SgdConfig) -> Result<Self> {
        let vars = vars.into_iter().filter(|v| v.dtype().is_float()).collect();
        Ok(Self { vars, config })
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        for var in &self.vars {
            if let Some(grad) = grads.get(var) {
                let grad = decayed_grad(var, grad, self.config.weight_decay)?;
                var.set(&var.sub(&(grad * self.config.lr)?)?)?;
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.config.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.config.lr = lr;
    }
}

/// RMSprop configuration
#[derive(Debug, Clone)]
pub struct RmsPropConfig {
    /// Learning rate
    pub lr: f64,
    /// Smoothing constant for the squared-gradient average
    pub alpha: f64,
    /// Term added to denominator for numerical stability
    pub eps: f64,
    /// L2 penalty added to the gradient
    pub weight_decay: f64,
}

impl Default for RmsPropConfig {
    fn default() -> Self {
        Self {
            lr: 1e-2,
            alpha: 0.99,
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }
}

/// Per-parameter state: running average of squared gradients
struct RmsPropVar {
    var: Var,
    square_avg: Tensor,
}

/// RMSprop
///
/// v = alpha * v + (1 - alpha) * g^2
/// param = param - lr * g / (sqrt(v) + eps)
pub struct RmsProp {
    vars: Vec<RmsPropVar>,
    config: RmsPropConfig,
}

impl Optimizer for RmsProp {
    type Config = RmsPropConfig;

    fn new(vars: Vec<Var>, config: RmsPropConfig) -> Result<Self> {
        let vars = vars
            .into_iter()
            .filter(|v| v.dtype().is_float())
            .map(|var| {
                let square_avg = var.zeros_like()?;
                Ok(RmsPropVar { var, square_avg })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { vars, config })
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        let alpha = self.config.alpha;
        for state in self.vars.iter_mut() {
            if let Some(grad) = grads.get(&state.var) {
                let grad = decayed_grad(&state.var, grad, self.config.weight_decay)?;

                state.square_avg = ((&state.square_avg * alpha)? + (grad.sqr()? * (1.0 - alpha))?)?;

                let denom = (state.square_avg.sqrt()? + self.config.eps)?;
                let update = (grad.div(&denom)? * self.config.lr)?;
                state.var.set(&state.var.sub(&update)?)?;
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.config.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.config.lr = lr;
    }
}

fn decayed_grad(var: &Var, grad: &Tensor, weight_decay: f64) -> Result<Tensor> {
    if weight_decay > 0.0 {
        grad + (var.as_tensor() * weight_decay)?
    } else {
        Ok(grad.clone())
    }
}

/// The optimizer driving a training run, chosen by `OptimizerKind`
pub enum TrainOptimizer {
    Sgd(Sgd),
    RmsProp(RmsProp),
    AdamW(AdamW),
}

impl TrainOptimizer {
    /// Build an optimizer over `vars`
    pub fn new(kind: OptimizerKind, vars: Vec<Var>, lr: f64, weight_decay: f64) -> Result<Self> {
        Ok(match kind {
            OptimizerKind::Sgd => TrainOptimizer::Sgd(Sgd::new(vars, SgdConfig { lr, weight_decay })?),
            OptimizerKind::RmsProp => TrainOptimizer::RmsProp(RmsProp::new(
                vars,
                RmsPropConfig {
                    lr,
                    weight_decay,
                    ..Default::default()
                },
            )?),
            OptimizerKind::AdamW => TrainOptimizer::AdamW(AdamW::new(
                vars,
                ParamsAdamW {
                    lr,
                    weight_decay,
                    ..Default::default()
                },
            )?),
        })
    }

    /// Apply one update from precomputed gradients
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        match self {
            TrainOptimizer::Sgd(opt) => opt.step(grads),
            TrainOptimizer::RmsProp(opt) => opt.step(grads),
            TrainOptimizer::AdamW(opt) => opt.step(grads),
        }
    }
}
