/// Supervised training loop for multimodal and unimodal models
use std::collections::HashSet;

use candle_core::{DType, Device, Var};

use super::checkpoint::{CheckpointMetadata, CheckpointPaths};
use super::clip::clip_grad_norm;
use super::metrics::RunningLoss;
use super::objective::{Criterion, Objective, ObjectiveArgs};
use super::optimizer::{OptimizerKind, TrainOptimizer};
use super::selection::{BestMetricTracker, Observation};
use crate::config::TaskKind;
use crate::data::{Batch, BatchDataLoader};
use crate::eval::{evaluate, EvalReport, EvalSettings};
use crate::models::TrainableModel;

/// Training configuration
#[derive(Debug, Clone)]
pub struct TrainingConfig {
    /// Number of training epochs
    pub epochs: usize,
    /// Task type, fixes the selection metric
    pub task: TaskKind,
    /// Optimizer family
    pub optimizer: OptimizerKind,
    /// Learning rate
    pub learning_rate: f64,
    /// Weight decay
    pub weight_decay: f64,
    /// Loss function, built-in or custom
    pub objective: Criterion,
    /// Gradient norm clipping threshold
    pub clip_norm: f64,
    /// Stop once patience runs out
    pub early_stop: bool,
    /// Report validation AUPRC
    pub auprc: bool,
    /// Cast modality values to f32 before the forward pass
    pub input_to_float: bool,
    /// Where the best model is written
    pub checkpoint: CheckpointPaths,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 30,
            task: TaskKind::Classification,
            optimizer: OptimizerKind::RmsProp,
            learning_rate: 1e-3,
            weight_decay: 0.0,
            objective: Objective::CrossEntropy.into(),
            clip_norm: 8.0,
            early_stop: false,
            auprc: false,
            input_to_float: true,
            checkpoint: CheckpointPaths::default(),
        }
    }
}

impl TrainingConfig {
    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.epochs == 0 {
            return Err(crate::MultiBenchError::Config("epochs must be > 0".to_string()));
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

    /// Settings for the validation pass
    pub fn eval_settings(&self) -> EvalSettings {
        EvalSettings {
            objective: self.objective.clone(),
            task: self.task,
            auprc: self.auprc,
            input_to_float: self.input_to_float,
        }
    }
}

/// What happened in one epoch
#[derive(Debug, Clone, PartialEq)]
pub struct EpochSummary {
    /// 1-based
    pub epoch: usize,
    pub train_loss: f64,
    pub valid_loss: f64,
    /// Selection metric on the validation set
    pub metric: f64,
    pub auprc: Option<f64>,
    /// A new best checkpoint was written
    pub improved: bool,
}

/// Outcome of a training run
#[derive(Debug, Clone, Default)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochSummary>,
    pub best_epoch: Option<usize>,
    pub best_metric: f64,
    pub stopped_early: bool,
}

impl TrainingHistory {
    /// Epochs after which the checkpoint was (re)written
    pub fn saved_epochs(&self) -> Vec<usize> {
        self.epochs
            .iter()
            .filter(|e| e.improved)
            .map(|e| e.epoch)
            .collect()
    }
}

/// Trainer for any `TrainableModel`
pub struct Trainer<M: TrainableModel> {
    model: M,
    /// Model parameters, the set whose gradient norm is clipped
    model_vars: Vec<Var>,
    optimizer: TrainOptimizer,
    config: TrainingConfig,
    step: usize,
}

impl<M: TrainableModel> Trainer<M> {
    /// Create new trainer
    ///
    /// `extra_vars` are optimized alongside the model parameters, e.g. a
    /// learned fusion weighting kept outside the model bundle. They are
    /// updated but not included in gradient clipping. A var listed more than
    /// once is optimized once.
    pub fn new(model: M, extra_vars: Vec<Var>, config: TrainingConfig) -> crate::Result<Self> {
        config.validate()?;

        let mut seen = HashSet::new();
        let model_vars: Vec<Var> = model
            .trainable_vars()
            .into_iter()
            .filter(|v| seen.insert(v.id()))
            .collect();
        let mut vars = model_vars.clone();
        vars.extend(extra_vars.into_iter().filter(|v| seen.insert(v.id())));

        log::info!(
            "Optimizing {} tensors ({} parameters)",
            vars.len(),
            crate::utils::count_parameters(&vars)
        );

        let optimizer = TrainOptimizer::new(
            config.optimizer,
            vars,
            config.learning_rate,
            config.weight_decay,
        )?;

        Ok(Self {
            model,
            model_vars,
            optimizer,
            config,
            step: 0,
        })
    }

    /// Forward, loss, backward, clip, update. Returns the batch loss.
    pub fn train_step(&mut self, batch: &Batch) -> crate::Result<f64> {
        let batch = if self.config.input_to_float {
            batch.to_float()?
        } else {
            batch.clone()
        };

        let output = self.model.forward_outputs(&batch, true)?;
        let args = ObjectiveArgs {
            reps: &output.reps,
            fused: output.fused.as_ref(),
            inputs: &batch.inputs,
            train: true,
        };
        let loss = self.config.objective.loss(&output.logits, &batch.target, &args)?;

        let mut grads = loss.backward()?;
        let grad_norm = clip_grad_norm(&self.model_vars, &mut grads, self.config.clip_norm)?;
        self.optimizer.step(&grads)?;
        self.step += 1;

        let loss_val = loss.to_dtype(DType::F64)?.to_scalar::<f64>()?;
        log::debug!(
            "Step {}: loss={:.4}, grad_norm={:.4}",
            self.step,
            loss_val,
            grad_norm
        );
        Ok(loss_val)
    }

    /// Train for one epoch, returning the size-weighted mean loss
    pub fn train_epoch<L>(&mut self, loader: &mut L, device: &Device) -> crate::Result<f64>
    where
        L: BatchDataLoader + ?Sized,
    {
        let mut running = RunningLoss::new();
        loader.reset();

        while let Some(batch) = loader.next_batch(device)? {
            let size = batch.len()?;
            let loss = self.train_step(&batch)?;
            running.add(loss, size);
        }

        if running.count() == 0 {
            return Err(crate::MultiBenchError::Training(
                "training loader yielded no examples".to_string(),
            ));
        }
        Ok(running.mean())
    }

    /// Full training loop with best-model selection
    pub fn train<T, V>(
        &mut self,
        train_loader: &mut T,
        valid_loader: &mut V,
        device: &Device,
    ) -> crate::Result<TrainingHistory>
    where
        T: BatchDataLoader + ?Sized,
        V: BatchDataLoader + ?Sized,
    {
        log::info!(
            "Starting training for {} epochs ({} batches per epoch)",
            self.config.epochs,
            train_loader.num_batches()
        );

        let (history, _) = crate::utils::timed("Training", || {
            self.run_epochs(train_loader, valid_loader, device)
        });
        let history = history?;

        match history.best_epoch {
            Some(epoch) => log::info!(
                "Training complete: best {} {:.4} at epoch {}",
                EvalReport::metric_name(self.config.task),
                history.best_metric,
                epoch
            ),
            None => log::warn!("Training complete without any improving epoch, nothing saved"),
        }
        Ok(history)
    }

    fn run_epochs<T, V>(
        &mut self,
        train_loader: &mut T,
        valid_loader: &mut V,
        device: &Device,
    ) -> crate::Result<TrainingHistory>
    where
        T: BatchDataLoader + ?Sized,
        V: BatchDataLoader + ?Sized,
    {
        let settings = self.config.eval_settings();
        let metric_name = EvalReport::metric_name(self.config.task);
        let mut tracker = BestMetricTracker::for_task(self.config.task);
        let mut history = TrainingHistory::default();

        for epoch in 1..=self.config.epochs {
            let train_loss = self.train_epoch(train_loader, device)?;
            log::info!("Epoch {} train loss: {:.4}", epoch, train_loss);

            let report = evaluate(&self.model, valid_loader, &settings, device)?;
            let metric = report.selection_metric();
            log::info!(
                "Epoch {} valid loss: {:.4} {}: {:.4}",
                epoch,
                report.loss,
                metric_name,
                metric
            );
            if let Some(value) = report.auprc {
                log::info!("AUPRC: {:.4}", value);
            }

            let improved = tracker.observe(epoch, metric) == Observation::Improved;
            if improved {
                log::info!("Saving best");
                let metadata = CheckpointMetadata {
                    epoch,
                    metric_name: metric_name.to_string(),
                    metric,
                    task: self.config.task,
                };
                self.model.save_best(&self.config.checkpoint, &metadata)?;
            }

            history.epochs.push(EpochSummary {
                epoch,
                train_loss,
                valid_loss: report.loss,
                metric,
                auprc: report.auprc,
                improved,
            });

            if tracker.should_stop(self.config.early_stop) {
                log::info!(
                    "Early stopping at epoch {} (patience {})",
                    epoch,
                    tracker.patience()
                );
                history.stopped_early = true;
                break;
            }
        }

        history.best_epoch = tracker.best_epoch();
        history.best_metric = tracker.best();
        Ok(history)
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Optimizer steps taken so far
    pub fn step(&self) -> usize {
        self.step
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    use candle_core::Tensor;
    use candle_nn::{VarBuilder, VarMap};

    use crate::data::{ModalityInput, VecDataLoader};
    use crate::layers::{Concat, Encoder, Mlp};
    use crate::models::{MultimodalModel, UnimodalModel};
    use crate::training::checkpoint::{read_metadata, tensor_names};

    /// Two modalities; the class is the sign of the first feature of modality 0
    fn separable_batches(n_batches: usize, device: &Device) -> candle_core::Result<Vec<Batch>> {
        (0..n_batches)
            .map(|_| {
                let a = Tensor::randn(0f32, 1.0, (16, 3), device)?;
                let b = Tensor::randn(0f32, 1.0, (16, 4), device)?;
                let target = a.narrow(1, 0, 1)?.gt(0f32)?.to_dtype(DType::U32)?.squeeze(1)?;
                Ok(Batch::new(
                    vec![ModalityInput::Dense(a), ModalityInput::Dense(b)],
                    target,
                ))
            })
            .collect()
    }

    #[test]
    fn test_multimodal_checkpoint_is_best_epoch() -> crate::Result<()> {
        let device = Device::Cpu;
        let dir = tempfile::tempdir()?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let encoders: Vec<Box<dyn Encoder>> = vec![
            Box::new(Mlp::new(3, 8, 4, vb.pp("encoders.0"))?),
            Box::new(Mlp::new(4, 8, 4, vb.pp("encoders.1"))?),
        ];
        let head = Mlp::new(8, 8, 2, vb.pp("head"))?;
        let model = MultimodalModel::new(varmap, encoders, Box::new(Concat), Box::new(head))?;

        let config = TrainingConfig {
            epochs: 6,
            optimizer: OptimizerKind::AdamW,
            learning_rate: 1e-2,
            checkpoint: CheckpointPaths::in_dir(dir.path()),
            ..Default::default()
        };
        let mut trainer = Trainer::new(model, Vec::new(), config)?;

        let mut train = VecDataLoader::new(separable_batches(4, &device)?);
        let mut valid = VecDataLoader::new(separable_batches(2, &device)?);
        let history = trainer.train(&mut train, &mut valid, &device)?;

        assert_eq!(history.epochs.len(), 6);
        assert_eq!(trainer.step(), 24);
        assert!(!history.stopped_early);

        // Each save is a strict improvement over the previous one
        let saved = history.saved_epochs();
        let saved_metrics: Vec<f64> = saved.iter().map(|e| history.epochs[e - 1].metric).collect();
        assert!(saved_metrics.windows(2).all(|w| w[1] > w[0]));

        let best_epoch = history.best_epoch.expect("at least one improving epoch");
        assert_eq!(saved.last(), Some(&best_epoch));

        let metadata = read_metadata(dir.path().join("best.safetensors"))?;
        assert_eq!(metadata.epoch, best_epoch);
        assert_eq!(metadata.metric, history.best_metric);
        assert_eq!(metadata.metric_name, "accuracy");
        Ok(())
    }

    #[test]
    fn test_unimodal_saves_encoder_and_head() -> crate::Result<()> {
        let device = Device::Cpu;
        let dir = tempfile::tempdir()?;

        let encoder_vars = VarMap::new();
        let head_vars = VarMap::new();
        let encoder = Mlp::new(4, 8, 4, VarBuilder::from_varmap(&encoder_vars, DType::F32, &device))?;
        let head = Mlp::new(4, 8, 1, VarBuilder::from_varmap(&head_vars, DType::F32, &device))?;
        let model = UnimodalModel::new(Box::new(encoder), encoder_vars, Box::new(head), head_vars, 1);

        // Regression on modality 1
        let batches = (0..3)
            .map(|_| {
                let a = Tensor::randn(0f32, 1.0, (8, 3), &device)?;
                let b = Tensor::randn(0f32, 1.0, (8, 4), &device)?;
                let target = b.sum(1)?;
                Ok(Batch::new(vec![ModalityInput::Dense(a), ModalityInput::Dense(b)], target))
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        let mut train = VecDataLoader::new(batches.clone());
        let mut valid = VecDataLoader::new(batches);

        let config = TrainingConfig {
            epochs: 3,
            task: TaskKind::Regression,
            objective: Objective::Mse.into(),
            checkpoint: CheckpointPaths::in_dir(dir.path()),
            ..Default::default()
        };
        let mut trainer = Trainer::new(model, Vec::new(), config)?;
        let history = trainer.train(&mut train, &mut valid, &device)?;

        // Any finite loss beats the initial sentinel
        assert_eq!(history.saved_epochs().first(), Some(&1));

        let expected = vec!["fc1.bias", "fc1.weight", "fc2.bias", "fc2.weight"];
        assert_eq!(tensor_names(dir.path().join("encoder.safetensors"))?, expected);
        assert_eq!(tensor_names(dir.path().join("head.safetensors"))?, expected);
        assert!(!dir.path().join("best.safetensors").exists());

        let metadata = read_metadata(dir.path().join("head.safetensors"))?;
        assert_eq!(Some(metadata.epoch), history.best_epoch);
        assert_eq!(metadata.metric_name, "valid_loss");
        Ok(())
    }

    /// Fixed linear map with no trainable parameters; records every save
    struct Frozen {
        weight: Tensor,
        saves: RefCell<Vec<usize>>,
    }

    impl TrainableModel for Frozen {
        fn forward_batch(&self, batch: &Batch, _train: bool) -> candle_core::Result<Tensor> {
            batch.inputs[0].values().matmul(&self.weight)
        }

        fn trainable_vars(&self) -> Vec<Var> {
            Vec::new()
        }

        fn save_best(&self, _: &CheckpointPaths, metadata: &CheckpointMetadata) -> crate::Result<()> {
            self.saves.borrow_mut().push(metadata.epoch);
            Ok(())
        }
    }

    fn frozen_run(early_stop: bool) -> crate::Result<(TrainingHistory, Vec<usize>)> {
        let device = Device::Cpu;
        let model = Frozen {
            weight: Tensor::new(&[[0.5f32], [-0.25]], &device)?,
            saves: RefCell::new(Vec::new()),
        };
        let batch = Batch::new(
            vec![ModalityInput::Dense(Tensor::new(&[[1f32, 2.0], [3.0, 4.0]], &device)?)],
            Tensor::new(&[1f32, 0.0], &device)?,
        );
        let mut train = VecDataLoader::new(vec![batch.clone()]);
        let mut valid = VecDataLoader::new(vec![batch]);

        let config = TrainingConfig {
            epochs: 20,
            task: TaskKind::Regression,
            objective: Objective::Mse.into(),
            optimizer: OptimizerKind::Sgd,
            early_stop,
            ..Default::default()
        };
        let mut trainer = Trainer::new(model, Vec::new(), config)?;
        let history = trainer.train(&mut train, &mut valid, &device)?;
        let saves = trainer.into_model().saves.into_inner();
        Ok((history, saves))
    }

    #[test]
    fn test_early_stop_when_patience_exceeds_seven() -> crate::Result<()> {
        // Validation loss never changes: epoch 1 improves, every later epoch ties
        let (history, saves) = frozen_run(true)?;

        assert!(history.stopped_early);
        assert_eq!(history.epochs.len(), 9);
        assert_eq!(saves, vec![1]);
        assert_eq!(history.saved_epochs(), vec![1]);
        assert_eq!(history.best_epoch, Some(1));
        Ok(())
    }

    #[test]
    fn test_no_early_stop_runs_all_epochs() -> crate::Result<()> {
        let (history, saves) = frozen_run(false)?;

        assert!(!history.stopped_early);
        assert_eq!(history.epochs.len(), 20);
        assert_eq!(saves, vec![1]);
        Ok(())
    }

    /// x @ weight + bias, exposing only `weight` as a model parameter
    struct Affine {
        weight: Var,
        bias: Var,
    }

    impl Affine {
        fn new(device: &Device) -> candle_core::Result<Self> {
            Ok(Self {
                weight: Var::new(&[[1f32]], device)?,
                bias: Var::new(&[1f32], device)?,
            })
        }
    }

    impl TrainableModel for Affine {
        fn forward_batch(&self, batch: &Batch, _train: bool) -> candle_core::Result<Tensor> {
            batch.inputs[0]
                .values()
                .matmul(self.weight.as_tensor())?
                .broadcast_add(self.bias.as_tensor())
        }

        fn trainable_vars(&self) -> Vec<Var> {
            vec![self.weight.clone()]
        }

        fn save_best(&self, _: &CheckpointPaths, _: &CheckpointMetadata) -> crate::Result<()> {
            Ok(())
        }
    }

    fn scalar(var: &Var) -> candle_core::Result<f32> {
        var.as_tensor().flatten_all()?.to_vec1::<f32>().map(|v| v[0])
    }

    fn unit_batch(device: &Device) -> candle_core::Result<Batch> {
        Ok(Batch::new(
            vec![ModalityInput::Dense(Tensor::new(&[[1f32]], device)?)],
            Tensor::new(&[0f32], device)?,
        ))
    }

    fn sgd_config(clip_norm: f64) -> TrainingConfig {
        TrainingConfig {
            epochs: 1,
            task: TaskKind::Regression,
            objective: Objective::Mse.into(),
            optimizer: OptimizerKind::Sgd,
            learning_rate: 0.1,
            clip_norm,
            ..Default::default()
        }
    }

    #[test]
    fn test_shared_var_is_stepped_once() -> crate::Result<()> {
        let device = Device::Cpu;
        let model = Affine::new(&device)?;
        let weight = model.weight.clone();
        let bias = model.bias.clone();

        // The weight is already a model parameter and the bias is listed twice
        let extra = vec![weight.clone(), bias.clone(), bias.clone()];
        let mut trainer = Trainer::new(model, extra, sgd_config(8.0))?;
        trainer.train_step(&unit_batch(&device)?)?;

        // pred = 2, loss = 4, d/dw = d/db = 4: one step of 0.1 * 4 each
        assert!((scalar(&weight)? - 0.6).abs() < 1e-6);
        assert!((scalar(&bias)? - 0.6).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_extra_vars_are_not_clipped() -> crate::Result<()> {
        let device = Device::Cpu;
        let model = Affine::new(&device)?;
        let weight = model.weight.clone();
        let bias = model.bias.clone();

        let mut trainer = Trainer::new(model, vec![bias.clone()], sgd_config(1.0))?;
        trainer.train_step(&unit_batch(&device)?)?;

        // Model gradient 4 is clipped to norm 1, the extra gradient stays 4
        assert!((scalar(&weight)? - 0.9).abs() < 1e-5);
        assert!((scalar(&bias)? - 0.6).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_custom_objective_reads_reps() -> crate::Result<()> {
        use std::sync::{Arc, Mutex};

        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let encoders: Vec<Box<dyn Encoder>> = vec![
            Box::new(Mlp::new(3, 8, 4, vb.pp("encoders.0"))?),
            Box::new(Mlp::new(4, 8, 4, vb.pp("encoders.1"))?),
        ];
        let head = Mlp::new(8, 8, 2, vb.pp("head"))?;
        let model = MultimodalModel::new(varmap, encoders, Box::new(Concat), Box::new(head))?;

        // (train, number of reps, fused present) for every call
        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&calls);
        let objective = Criterion::custom(move |pred, target, args| {
            if let Ok(mut calls) = seen.lock() {
                calls.push((args.train, args.reps.len(), args.fused.is_some()));
            }
            // Cross-entropy plus a small penalty on the first modality's representation
            let penalty = (args.reps[0].sqr()?.mean_all()? * 1e-3)?;
            candle_nn::loss::cross_entropy(pred, target)? + penalty
        });

        let dir = tempfile::tempdir()?;
        let config = TrainingConfig {
            epochs: 2,
            objective,
            checkpoint: CheckpointPaths::in_dir(dir.path()),
            ..Default::default()
        };
        let mut trainer = Trainer::new(model, Vec::new(), config)?;

        let mut train = VecDataLoader::new(separable_batches(2, &device)?);
        let mut valid = VecDataLoader::new(separable_batches(1, &device)?);
        let history = trainer.train(&mut train, &mut valid, &device)?;
        assert!(history.epochs.iter().all(|e| e.train_loss.is_finite()));

        let calls = calls.lock().map_err(|_| crate::MultiBenchError::Training("poisoned".into()))?;
        // Per epoch: two training batches, then one validation batch
        let train_flags: Vec<bool> = calls.iter().map(|c| c.0).collect();
        assert_eq!(train_flags, vec![true, true, false, true, true, false]);
        assert!(calls.iter().all(|&(_, reps, fused)| reps == 2 && fused));
        Ok(())
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = TrainingConfig {
            clip_norm: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = TrainingConfig {
            task: TaskKind::Multilabel,
            auprc: true,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
