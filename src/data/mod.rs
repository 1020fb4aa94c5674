/// Batches, loaders and datasets for multimodal training
pub mod memory;
pub mod noise;
pub mod numpy_dataset;

pub use memory::VecDataLoader;
pub use noise::{noisy_family, NoiseKind};
pub use numpy_dataset::{
    DatasetMetadata, Labels, ModalityData, MultimodalDataLoader, MultimodalDataset,
};

use candle_core::{DType, Device, Result, Tensor};

/// One modality of a batch
#[derive(Debug, Clone)]
pub enum ModalityInput {
    /// Fixed-shape input, first dimension is the batch
    Dense(Tensor),
    /// Variable-length sequences padded to a common length.
    /// `values`: [batch, max_len, features], `lengths`: [batch]
    Packed { values: Tensor, lengths: Tensor },
}

impl ModalityInput {
    /// The value tensor (padded values for packed input)
    pub fn values(&self) -> &Tensor {
        match self {
            ModalityInput::Dense(t) => t,
            ModalityInput::Packed { values, .. } => values,
        }
    }

    /// Number of examples in this modality
    pub fn batch_size(&self) -> Result<usize> {
        self.values().dim(0)
    }

    /// Cast the values to f32, lengths stay untouched
    pub fn to_float(&self) -> Result<Self> {
        Ok(match self {
            ModalityInput::Dense(t) => ModalityInput::Dense(t.to_dtype(DType::F32)?),
            ModalityInput::Packed { values, lengths } => ModalityInput::Packed {
                values: values.to_dtype(DType::F32)?,
                lengths: lengths.clone(),
            },
        })
    }

    /// Move the tensors to `device`
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(match self {
            ModalityInput::Dense(t) => ModalityInput::Dense(t.to_device(device)?),
            ModalityInput::Packed { values, lengths } => ModalityInput::Packed {
                values: values.to_device(device)?,
                lengths: lengths.to_device(device)?,
            },
        })
    }

    pub fn is_packed(&self) -> bool {
        matches!(self, ModalityInput::Packed { .. })
    }
}

/// Per-modality inputs plus the target, which always comes last
#[derive(Debug, Clone)]
pub struct Batch {
    pub inputs: Vec<ModalityInput>,
    pub target: Tensor,
}

impl Batch {
    pub fn new(inputs: Vec<ModalityInput>, target: Tensor) -> Self {
        Self { inputs, target }
    }

    /// Number of examples, taken from the target
    pub fn len(&self) -> Result<usize> {
        self.target.dim(0)
    }

    pub fn num_modalities(&self) -> usize {
        self.inputs.len()
    }

    /// Cast all modality values to f32
    pub fn to_float(&self) -> Result<Self> {
        let inputs = self
            .inputs
            .iter()
            .map(|m| m.to_float())
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            inputs,
            target: self.target.clone(),
        })
    }

    /// Move every tensor of the batch to `device`
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        let inputs = self
            .inputs
            .iter()
            .map(|m| m.to_device(device))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            inputs,
            target: self.target.to_device(device)?,
        })
    }
}

/// Generic data loader trait
pub trait BatchDataLoader {
    /// Get next batch, `None` once the epoch is exhausted
    fn next_batch(&mut self, device: &Device) -> Result<Option<Batch>>;

    /// Reset loader for new epoch
    fn reset(&mut self);

    /// Get total number of batches
    fn num_batches(&self) -> usize;
}

impl<L: BatchDataLoader + ?Sized> BatchDataLoader for Box<L> {
    fn next_batch(&mut self, device: &Device) -> Result<Option<Batch>> {
        (**self).next_batch(device)
    }

    fn reset(&mut self) {
        (**self).reset()
    }

    fn num_batches(&self) -> usize {
        (**self).num_batches()
    }
}
