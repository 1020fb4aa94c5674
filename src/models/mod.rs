/// Model bundles driven by the training loops
///
/// A `MultimodalModel` owns one encoder per modality, a fusion operator and
/// a head, with every parameter registered in a single `VarMap`. A
/// `UnimodalModel` pairs one encoder with one head and keeps their
/// parameters apart so they can be saved as separate artifacts.
use candle_core::{Result, Tensor, Var};
use candle_nn::VarMap;

use crate::data::Batch;
use crate::layers::{Encoder, Fusion, Head};
use crate::training::checkpoint::{save_checkpoint, CheckpointMetadata, CheckpointPaths};

pub mod loader;

/// Logits plus the intermediate tensors a custom objective may read
#[derive(Debug, Clone)]
pub struct ModelOutput {
    pub logits: Tensor,
    /// Per-modality representations, in encoder order
    pub reps: Vec<Tensor>,
    /// Fusion output
    pub fused: Option<Tensor>,
}

/// What the trainer and the evaluation harness need from a model
pub trait TrainableModel {
    /// Predictions (logits) for a batch
    fn forward_batch(&self, batch: &Batch, train: bool) -> Result<Tensor>;

    /// Predictions with the intermediate representations that produced them
    ///
    /// Models without meaningful intermediates report none.
    fn forward_outputs(&self, batch: &Batch, train: bool) -> Result<ModelOutput> {
        Ok(ModelOutput {
            logits: self.forward_batch(batch, train)?,
            reps: Vec::new(),
            fused: None,
        })
    }

    /// Parameters updated by the optimizer
    fn trainable_vars(&self) -> Vec<Var>;

    /// Persist the current weights as the best model so far
    fn save_best(&self, paths: &CheckpointPaths, metadata: &CheckpointMetadata) -> crate::Result<()>;
}

/// Encoders + fusion + head
pub struct MultimodalModel {
    varmap: VarMap,
    encoders: Vec<Box<dyn Encoder>>,
    fusion: Box<dyn Fusion>,
    head: Box<dyn Head>,
}

impl MultimodalModel {
    /// Assemble a model; `varmap` must hold the parameters of all parts
    pub fn new(
        varmap: VarMap,
        encoders: Vec<Box<dyn Encoder>>,
        fusion: Box<dyn Fusion>,
        head: Box<dyn Head>,
    ) -> crate::Result<Self> {
        if encoders.is_empty() {
            return Err(crate::MultiBenchError::Model(
                "a multimodal model needs at least one encoder".to_string(),
            ));
        }

        Ok(Self {
            varmap,
            encoders,
            fusion,
            head,
        })
    }

    /// Representation of every modality, in encoder order
    pub fn encode(&self, batch: &Batch, train: bool) -> Result<Vec<Tensor>> {
        if batch.num_modalities() != self.encoders.len() {
            candle_core::bail!(
                "batch has {} modalities but the model has {} encoders",
                batch.num_modalities(),
                self.encoders.len()
            );
        }

        self.encoders
            .iter()
            .zip(batch.inputs.iter())
            .map(|(encoder, input)| encoder.forward(input, train))
            .collect()
    }

    /// encode -> fuse -> head
    pub fn forward(&self, batch: &Batch, train: bool) -> Result<Tensor> {
        Ok(self.forward_with_reps(batch, train)?.logits)
    }

    /// `forward`, keeping the per-modality and fused representations
    pub fn forward_with_reps(&self, batch: &Batch, train: bool) -> Result<ModelOutput> {
        let reps = self.encode(batch, train)?;
        let fused = self.fusion.forward(&reps, train)?;
        let logits = self.head.forward(&fused, train)?;
        Ok(ModelOutput {
            logits,
            reps,
            fused: Some(fused),
        })
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn num_modalities(&self) -> usize {
        self.encoders.len()
    }

    pub fn num_parameters(&self) -> usize {
        crate::utils::count_parameters(&self.varmap.all_vars())
    }
}

impl TrainableModel for MultimodalModel {
    fn forward_batch(&self, batch: &Batch, train: bool) -> Result<Tensor> {
        self.forward(batch, train)
    }

    fn forward_outputs(&self, batch: &Batch, train: bool) -> Result<ModelOutput> {
        self.forward_with_reps(batch, train)
    }

    fn trainable_vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    fn save_best(&self, paths: &CheckpointPaths, metadata: &CheckpointMetadata) -> crate::Result<()> {
        save_checkpoint(&self.varmap, &paths.model, metadata)
    }
}

/// One encoder + one head over a single selected modality
pub struct UnimodalModel {
    encoder: Box<dyn Encoder>,
    encoder_vars: VarMap,
    head: Box<dyn Head>,
    head_vars: VarMap,
    modality: usize,
}

impl UnimodalModel {
    /// `modality` indexes the batch inputs the encoder reads
    pub fn new(
        encoder: Box<dyn Encoder>,
        encoder_vars: VarMap,
        head: Box<dyn Head>,
        head_vars: VarMap,
        modality: usize,
    ) -> Self {
        Self {
            encoder,
            encoder_vars,
            head,
            head_vars,
            modality,
        }
    }

    pub fn forward(&self, batch: &Batch, train: bool) -> Result<Tensor> {
        Ok(self.forward_with_reps(batch, train)?.logits)
    }

    /// `forward`, keeping the encoder output as the only representation
    pub fn forward_with_reps(&self, batch: &Batch, train: bool) -> Result<ModelOutput> {
        let input = match batch.inputs.get(self.modality) {
            Some(input) => input,
            None => candle_core::bail!(
                "modality {} requested but the batch has {}",
                self.modality,
                batch.num_modalities()
            ),
        };
        let rep = self.encoder.forward(input, train)?;
        let logits = self.head.forward(&rep, train)?;
        Ok(ModelOutput {
            logits,
            reps: vec![rep],
            fused: None,
        })
    }

    pub fn modality(&self) -> usize {
        self.modality
    }

    pub fn encoder_vars(&self) -> &VarMap {
        &self.encoder_vars
    }

    pub fn head_vars(&self) -> &VarMap {
        &self.head_vars
    }

    pub fn num_parameters(&self) -> usize {
        crate::utils::count_parameters(&self.trainable_vars())
    }
}

impl TrainableModel for UnimodalModel {
    fn forward_batch(&self, batch: &Batch, train: bool) -> Result<Tensor> {
        self.forward(batch, train)
    }

    fn forward_outputs(&self, batch: &Batch, train: bool) -> Result<ModelOutput> {
        self.forward_with_reps(batch, train)
    }

    fn trainable_vars(&self) -> Vec<Var> {
        let mut vars = self.encoder_vars.all_vars();
        vars.extend(self.head_vars.all_vars());
        vars
    }

    fn save_best(&self, paths: &CheckpointPaths, metadata: &CheckpointMetadata) -> crate::Result<()> {
        save_checkpoint(&self.encoder_vars, &paths.encoder, metadata)?;
        save_checkpoint(&self.head_vars, &paths.head, metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ModalityInput;
    use crate::layers::{Concat, Mlp};
    use candle_core::{DType, Device};
    use candle_nn::VarBuilder;

    fn two_modality_batch(device: &Device) -> Result<Batch> {
        Ok(Batch::new(
            vec![
                ModalityInput::Dense(Tensor::randn(0f32, 1.0, (5, 3), device)?),
                ModalityInput::Dense(Tensor::randn(0f32, 1.0, (5, 2, 2), device)?),
            ],
            Tensor::zeros(5, DType::U32, device)?,
        ))
    }

    fn concat_model(device: &Device) -> crate::Result<MultimodalModel> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let encoders: Vec<Box<dyn Encoder>> = vec![
            Box::new(Mlp::new(3, 8, 4, vb.pp("encoders.0"))?),
            Box::new(Mlp::new(4, 8, 4, vb.pp("encoders.1"))?),
        ];
        let head = Mlp::new(8, 8, 3, vb.pp("head"))?;
        MultimodalModel::new(varmap, encoders, Box::new(Concat), Box::new(head))
    }

    #[test]
    fn test_multimodal_forward_shape() -> crate::Result<()> {
        let device = Device::Cpu;
        let model = concat_model(&device)?;
        let batch = two_modality_batch(&device)?;

        let logits = model.forward(&batch, false)?;
        assert_eq!(logits.dims(), &[5, 3]);
        assert_eq!(model.num_modalities(), 2);
        // 3*8+8 + 8*4+4 + 4*8+8 + 8*4+4 + 8*8+8 + 8*3+3
        assert_eq!(model.num_parameters(), 32 + 36 + 40 + 36 + 72 + 27);
        Ok(())
    }

    #[test]
    fn test_forward_with_reps_keeps_intermediates() -> crate::Result<()> {
        let device = Device::Cpu;
        let model = concat_model(&device)?;
        let batch = two_modality_batch(&device)?;

        let output = model.forward_outputs(&batch, false)?;
        assert_eq!(output.logits.dims(), &[5, 3]);
        assert_eq!(output.reps.len(), 2);
        assert_eq!(output.reps[1].dims(), &[5, 4]);
        assert_eq!(output.fused.as_ref().map(|f| f.dims().to_vec()), Some(vec![5, 8]));

        // Same logits as the plain forward pass
        let diff = (output.logits - model.forward(&batch, false)?)?
            .abs()?
            .sum_all()?
            .to_scalar::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }

    #[test]
    fn test_multimodal_arity_mismatch() -> crate::Result<()> {
        let device = Device::Cpu;
        let model = concat_model(&device)?;
        let mut batch = two_modality_batch(&device)?;
        batch.inputs.pop();

        assert!(model.forward(&batch, false).is_err());
        Ok(())
    }

    #[test]
    fn test_multimodal_needs_encoders() {
        let result = MultimodalModel::new(
            VarMap::new(),
            Vec::new(),
            Box::new(Concat),
            Box::new(crate::layers::Identity),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_unimodal_reads_selected_modality() -> crate::Result<()> {
        let device = Device::Cpu;
        let encoder_vars = VarMap::new();
        let head_vars = VarMap::new();
        let encoder = Mlp::new(
            4,
            6,
            5,
            VarBuilder::from_varmap(&encoder_vars, DType::F32, &device),
        )?;
        let head = Mlp::new(5, 6, 2, VarBuilder::from_varmap(&head_vars, DType::F32, &device))?;

        let model = UnimodalModel::new(Box::new(encoder), encoder_vars, Box::new(head), head_vars, 1);
        let batch = two_modality_batch(&device)?;

        assert_eq!(model.forward(&batch, true)?.dims(), &[5, 2]);
        assert_eq!(model.trainable_vars().len(), 8);

        let out_of_range = UnimodalModel::new(
            Box::new(crate::layers::Identity),
            VarMap::new(),
            Box::new(crate::layers::Identity),
            VarMap::new(),
            7,
        );
        assert!(out_of_range.forward(&batch, false).is_err());
        Ok(())
    }
}
