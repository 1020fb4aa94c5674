/// Inference-only evaluation
///
/// One pass over a loader with `train = false` and detached outputs: the
/// size-weighted loss plus the task measures (accuracy, micro/macro F1,
/// optional AUPRC). Used for per-epoch validation and by the robustness
/// harness.
use candle_core::{DType, Device, Tensor, D};
use candle_nn::ops;
use serde::{Deserialize, Serialize};

use crate::config::TaskKind;
use crate::data::BatchDataLoader;
use crate::models::TrainableModel;
use crate::training::metrics::{accuracy, auprc, f1_score, Average, RunningLoss};
use crate::training::objective::{Criterion, ObjectiveArgs};

pub mod robustness;

pub use robustness::{effective_robustness, relative_robustness, RobustnessOptions, RobustnessReport};

/// How an evaluation pass scores a model
#[derive(Debug, Clone, PartialEq)]
pub struct EvalSettings {
    pub objective: Criterion,
    pub task: TaskKind,
    /// Collect (P(class 1), label) pairs and report AUPRC
    pub auprc: bool,
    /// Cast modality values to f32 before the forward pass
    pub input_to_float: bool,
}

impl EvalSettings {
    /// Natural objective for the task, no AUPRC, float inputs
    pub fn for_task(task: TaskKind) -> Self {
        Self {
            objective: task.default_objective().into(),
            task,
            auprc: false,
            input_to_float: true,
        }
    }
}

/// Result of one evaluation pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalReport {
    pub task: TaskKind,
    /// Size-weighted mean loss
    pub loss: f64,
    pub num_examples: usize,
    pub accuracy: Option<f64>,
    pub f1_micro: Option<f64>,
    pub f1_macro: Option<f64>,
    pub auprc: Option<f64>,
}

impl EvalReport {
    /// Value driving checkpoint selection
    pub fn selection_metric(&self) -> f64 {
        match self.task {
            TaskKind::Classification => self.accuracy.unwrap_or(0.0),
            TaskKind::Multilabel => self.f1_macro.unwrap_or(0.0),
            TaskKind::Regression => self.loss,
        }
    }

    /// Name of the selection metric
    pub fn metric_name(task: TaskKind) -> &'static str {
        match task {
            TaskKind::Classification => "accuracy",
            TaskKind::Multilabel => "f1_macro",
            TaskKind::Regression => "valid_loss",
        }
    }

    /// Ordered (measure, value) pairs reported to the user
    pub fn measures(&self) -> Vec<(&'static str, f64)> {
        let mut measures = match self.task {
            TaskKind::Classification => vec![("Accuracy", self.accuracy.unwrap_or(0.0))],
            TaskKind::Multilabel => vec![
                ("F1 score (micro)", self.f1_micro.unwrap_or(0.0)),
                ("F1 score (macro)", self.f1_macro.unwrap_or(0.0)),
            ],
            TaskKind::Regression => vec![("MSE", self.loss)],
        };
        if let Some(value) = self.auprc {
            measures.push(("AUPRC", value));
        }
        measures
    }
}

/// Scalar loss tensor as f64
fn scalar(loss: &Tensor) -> candle_core::Result<f64> {
    loss.to_dtype(DType::F64)?.to_scalar::<f64>()
}

/// Evaluate `model` over every batch of `loader`
///
/// The loader is reset first. An empty loader is an error since no metric
/// can be computed from it.
pub fn evaluate<M, L>(
    model: &M,
    loader: &mut L,
    settings: &EvalSettings,
    device: &Device,
) -> crate::Result<EvalReport>
where
    M: TrainableModel + ?Sized,
    L: BatchDataLoader + ?Sized,
{
    loader.reset();

    let mut running = RunningLoss::new();
    let mut class_true: Vec<u32> = Vec::new();
    let mut class_pred: Vec<u32> = Vec::new();
    let mut label_true: Vec<Vec<f32>> = Vec::new();
    let mut label_pred: Vec<Vec<f32>> = Vec::new();
    let mut pts: Vec<(f64, u32)> = Vec::new();

    while let Some(batch) = loader.next_batch(device)? {
        let batch = if settings.input_to_float {
            batch.to_float()?
        } else {
            batch
        };

        let output = model.forward_outputs(&batch, false)?;
        let logits = output.logits.detach();
        let args = ObjectiveArgs {
            reps: &output.reps,
            fused: output.fused.as_ref(),
            inputs: &batch.inputs,
            train: false,
        };
        let loss = settings.objective.loss(&logits, &batch.target, &args)?;
        running.add(scalar(&loss)?, batch.len()?);

        match settings.task {
            TaskKind::Classification => {
                let truth = batch.target.flatten_all()?.to_dtype(DType::U32)?.to_vec1::<u32>()?;
                class_pred.extend(logits.argmax(D::Minus1)?.flatten_all()?.to_vec1::<u32>()?);

                if settings.auprc {
                    if logits.dim(D::Minus1)? < 2 {
                        return Err(crate::MultiBenchError::Training(
                            "AUPRC needs at least two class logits".to_string(),
                        ));
                    }
                    let positive = ops::softmax(&logits, D::Minus1)?
                        .narrow(1, 1, 1)?
                        .flatten_all()?
                        .to_dtype(DType::F64)?
                        .to_vec1::<f64>()?;
                    pts.extend(positive.into_iter().zip(truth.iter().copied()));
                }
                class_true.extend(truth);
            }
            TaskKind::Multilabel => {
                let pred = ops::sigmoid(&logits)?.round()?.to_dtype(DType::F32)?;
                label_pred.extend(pred.to_vec2::<f32>()?);
                label_true.extend(batch.target.to_dtype(DType::F32)?.to_vec2::<f32>()?);
            }
            TaskKind::Regression => {}
        }
    }

    if running.count() == 0 {
        return Err(crate::MultiBenchError::Training(
            "evaluation loader yielded no examples".to_string(),
        ));
    }

    let mut report = EvalReport {
        task: settings.task,
        loss: running.mean(),
        num_examples: running.count(),
        accuracy: None,
        f1_micro: None,
        f1_macro: None,
        auprc: None,
    };

    match settings.task {
        TaskKind::Classification => {
            report.accuracy = Some(accuracy(&class_true, &class_pred));
            if settings.auprc {
                report.auprc = Some(auprc(&pts));
            }
        }
        TaskKind::Multilabel => {
            report.f1_micro = Some(f1_score(&label_true, &label_pred, Average::Micro));
            report.f1_macro = Some(f1_score(&label_true, &label_pred, Average::Macro));
        }
        TaskKind::Regression => {}
    }

    Ok(report)
}

/// Evaluate on one test loader and log every measure
pub fn single_test<M, L>(
    model: &M,
    loader: &mut L,
    settings: &EvalSettings,
    device: &Device,
) -> crate::Result<EvalReport>
where
    M: TrainableModel + ?Sized,
    L: BatchDataLoader + ?Sized,
{
    let report = evaluate(model, loader, settings, device)?;
    for (name, value) in report.measures() {
        log::info!("{}: {:.4}", name, value);
    }
    Ok(report)
}
