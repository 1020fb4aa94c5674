/// NumPy dataset loader for multimodal benchmark data (.npy format)
use candle_core::{Device, Result, Tensor};
use ndarray::{Array1, Array2, ArrayD, Axis, Ix1, Ix2};
use ndarray_npy::ReadNpyExt;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use super::{Batch, ModalityInput};
use crate::config::TaskKind;

/// Metadata from dataset.json
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatasetMetadata {
    /// Modality names, in batch order. Each has a `<name>.npy` file
    pub modalities: Vec<String>,
    #[serde(default)]
    pub task: TaskKind,
    /// Expected number of examples, checked on load; 0 leaves it unchecked
    #[serde(default)]
    pub num_examples: usize,
    #[serde(default)]
    pub description: String,
}

/// Values of one modality for every example
#[derive(Debug, Clone)]
pub struct ModalityData {
    pub name: String,
    /// [N, ...] feature array
    pub values: ArrayD<f32>,
    /// Valid sequence length per example, present for packed modalities
    pub lengths: Option<Array1<u32>>,
}

impl ModalityData {
    pub fn dense(name: impl Into<String>, values: ArrayD<f32>) -> Self {
        Self {
            name: name.into(),
            values,
            lengths: None,
        }
    }

    pub fn packed(name: impl Into<String>, values: ArrayD<f32>, lengths: Array1<u32>) -> Self {
        Self {
            name: name.into(),
            values,
            lengths: Some(lengths),
        }
    }

    fn num_examples(&self) -> usize {
        self.values.shape().first().copied().unwrap_or(0)
    }

    fn gather(&self, indices: &[usize], device: &Device) -> Result<ModalityInput> {
        let values = gather_rows(&self.values, indices, device)?;
        match self.lengths {
            Some(ref lengths) => {
                let picked: Vec<u32> = indices.iter().map(|&i| lengths[i]).collect();
                let lengths = Tensor::from_vec(picked, indices.len(), device)?;
                Ok(ModalityInput::Packed { values, lengths })
            }
            None => Ok(ModalityInput::Dense(values)),
        }
    }
}

/// Targets for every example
#[derive(Debug, Clone)]
pub enum Labels {
    /// Class index per example
    Classes(Array1<u32>),
    /// Row of targets per example (multilabel 0/1 or regression values)
    Values(Array2<f32>),
}

impl Labels {
    pub fn len(&self) -> usize {
        match self {
            Labels::Classes(c) => c.len(),
            Labels::Values(v) => v.nrows(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn gather(&self, indices: &[usize], device: &Device) -> Result<Tensor> {
        match self {
            Labels::Classes(c) => {
                let picked: Vec<u32> = indices.iter().map(|&i| c[i]).collect();
                Tensor::from_vec(picked, indices.len(), device)
            }
            Labels::Values(v) => {
                let rows = v.select(Axis(0), indices);
                let data: Vec<f32> = rows.iter().copied().collect();
                Tensor::from_vec(data, (indices.len(), v.ncols()), device)
            }
        }
    }
}

fn gather_rows(values: &ArrayD<f32>, indices: &[usize], device: &Device) -> Result<Tensor> {
    let rows = values.select(Axis(0), indices);
    let shape = rows.shape().to_vec();
    let data: Vec<f32> = rows.iter().copied().collect();
    Tensor::from_vec(data, shape, device)
}

/// Read a float array, accepting both float32 and float64 files
fn read_float_npy(path: &Path) -> crate::Result<ArrayD<f32>> {
    let as_f32 = match ArrayD::<f32>::read_npy(File::open(path)?) {
        Ok(values) => return Ok(values),
        Err(e) => e,
    };
    // Python pipelines usually save float64
    match ArrayD::<f64>::read_npy(File::open(path)?) {
        Ok(values) => Ok(values.mapv(|x| x as f32)),
        Err(as_f64) => Err(crate::MultiBenchError::Data(format!(
            "{:?}: not a float32 array ({}) nor a float64 array ({})",
            path, as_f32, as_f64
        ))),
    }
}

/// Read class indices or sequence lengths, accepting int64 and int32 files
fn read_index_npy(path: &Path) -> crate::Result<ArrayD<u32>> {
    let raw = match ArrayD::<i64>::read_npy(File::open(path)?) {
        Ok(values) => values,
        Err(as_i64) => match ArrayD::<i32>::read_npy(File::open(path)?) {
            Ok(values) => values.mapv(i64::from),
            Err(as_i32) => {
                return Err(crate::MultiBenchError::Data(format!(
                    "{:?}: not an int64 array ({}) nor an int32 array ({})",
                    path, as_i64, as_i32
                )));
            }
        },
    };

    if let Some(bad) = raw.iter().find(|&&x| u32::try_from(x).is_err()) {
        return Err(crate::MultiBenchError::Data(format!(
            "{:?}: value {} is not a valid index",
            path, bad
        )));
    }
    Ok(raw.mapv(|x| x as u32))
}

/// Multimodal dataset: one feature array per modality plus labels
#[derive(Debug, Clone)]
pub struct MultimodalDataset {
    modalities: Vec<ModalityData>,
    labels: Labels,
    metadata: DatasetMetadata,
}

impl MultimodalDataset {
    /// Build from in-memory arrays, validating that every array has N rows
    pub fn new(
        modalities: Vec<ModalityData>,
        labels: Labels,
        task: TaskKind,
    ) -> crate::Result<Self> {
        if modalities.is_empty() {
            return Err(crate::MultiBenchError::Data(
                "dataset needs at least one modality".to_string(),
            ));
        }

        let num_examples = labels.len();
        for modality in &modalities {
            if modality.num_examples() != num_examples {
                return Err(crate::MultiBenchError::Data(format!(
                    "Shape mismatch: modality '{}' has {} rows, labels have {}",
                    modality.name,
                    modality.num_examples(),
                    num_examples
                )));
            }
            if let Some(ref lengths) = modality.lengths {
                if lengths.len() != num_examples {
                    return Err(crate::MultiBenchError::Data(format!(
                        "Shape mismatch: modality '{}' has {} lengths for {} examples",
                        modality.name,
                        lengths.len(),
                        num_examples
                    )));
                }
            }
        }

        if task == TaskKind::Classification && !matches!(labels, Labels::Classes(_)) {
            return Err(crate::MultiBenchError::Data(
                "classification needs class-index labels".to_string(),
            ));
        }

        let metadata = DatasetMetadata {
            modalities: modalities.iter().map(|m| m.name.clone()).collect(),
            task,
            num_examples,
            description: String::new(),
        };

        Ok(Self {
            modalities,
            labels,
            metadata,
        })
    }

    /// Load from directory containing .npy files and dataset.json
    ///
    /// Layout: `<modality>.npy` per modality, optional `<modality>__lengths.npy`
    /// for packed sequences, and `labels.npy`.
    pub fn from_directory<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let dir = path.as_ref();

        log::info!("Loading NumPy dataset from: {:?}", dir);

        let metadata_path = dir.join("dataset.json");
        let file = File::open(&metadata_path)?;
        let metadata: DatasetMetadata = serde_json::from_reader(BufReader::new(file))?;

        let mut modalities = Vec::with_capacity(metadata.modalities.len());
        for name in &metadata.modalities {
            let values = read_float_npy(&dir.join(format!("{}.npy", name)))?;

            let lengths_path = dir.join(format!("{}__lengths.npy", name));
            let lengths = if lengths_path.exists() {
                let lengths = read_index_npy(&lengths_path)?
                    .into_dimensionality::<Ix1>()
                    .map_err(|e| crate::MultiBenchError::Data(format!("{}__lengths.npy: {}", name, e)))?;
                Some(lengths)
            } else {
                None
            };

            log::info!("Loaded modality '{}': shape {:?}", name, values.shape());
            modalities.push(ModalityData {
                name: name.clone(),
                values,
                lengths,
            });
        }

        let labels_path = dir.join("labels.npy");
        let labels = match metadata.task {
            TaskKind::Classification => {
                let raw = read_index_npy(&labels_path)?;
                let n = raw.shape().first().copied().unwrap_or(0);
                // Accept both [N] and [N, 1]
                let flat = raw
                    .into_shape(n)
                    .map_err(|e| crate::MultiBenchError::Data(format!("labels.npy: {}", e)))?;
                Labels::Classes(flat)
            }
            TaskKind::Multilabel | TaskKind::Regression => {
                let raw = read_float_npy(&labels_path)?;
                let values = if raw.ndim() == 1 {
                    let n = raw.len();
                    raw.into_shape((n, 1))
                        .map_err(|e| crate::MultiBenchError::Data(format!("labels.npy: {}", e)))?
                        .into_dimensionality::<Ix2>()
                } else {
                    raw.into_dimensionality::<Ix2>()
                }
                .map_err(|e| crate::MultiBenchError::Data(format!("labels.npy: {}", e)))?;
                Labels::Values(values)
            }
        };

        let mut dataset = Self::new(modalities, labels, metadata.task)?;
        if metadata.num_examples != 0 && metadata.num_examples != dataset.len() {
            return Err(crate::MultiBenchError::Data(format!(
                "dataset.json declares {} examples but the arrays hold {}",
                metadata.num_examples,
                dataset.len()
            )));
        }
        dataset.metadata.description = metadata.description;

        log::info!(
            "Dataset loaded: {} examples, {} modalities, task={}",
            dataset.len(),
            dataset.num_modalities(),
            dataset.metadata.task.as_str()
        );

        Ok(dataset)
    }

    /// Get number of examples
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn num_modalities(&self) -> usize {
        self.modalities.len()
    }

    /// Get metadata
    pub fn metadata(&self) -> &DatasetMetadata {
        &self.metadata
    }

    pub fn modality(&self, idx: usize) -> Option<&ModalityData> {
        self.modalities.get(idx)
    }

    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    /// Copy of this dataset with the values of one modality replaced
    pub fn with_modality_values(&self, idx: usize, values: ArrayD<f32>) -> crate::Result<Self> {
        let current = self.modalities.get(idx).ok_or_else(|| {
            crate::MultiBenchError::Data(format!("no modality at index {}", idx))
        })?;
        if current.values.shape() != values.shape() {
            return Err(crate::MultiBenchError::Data(format!(
                "Shape mismatch: replacement {:?} != original {:?}",
                values.shape(),
                current.values.shape()
            )));
        }

        let mut dataset = self.clone();
        dataset.modalities[idx].values = values;
        Ok(dataset)
    }

    /// Assemble the batch for the given example indices
    pub fn batch(&self, indices: &[usize], device: &Device) -> Result<Batch> {
        let inputs = self
            .modalities
            .iter()
            .map(|m| m.gather(indices, device))
            .collect::<Result<Vec<_>>>()?;
        let target = self.labels.gather(indices, device)?;
        Ok(Batch::new(inputs, target))
    }
}

/// Data loader for multimodal datasets
pub struct MultimodalDataLoader {
    dataset: MultimodalDataset,
    batch_size: usize,
    current_idx: usize,
    indices: Vec<usize>,
    shuffle: bool,
}

impl MultimodalDataLoader {
    /// Create new data loader
    pub fn new(dataset: MultimodalDataset, batch_size: usize, shuffle: bool) -> Self {
        let num_samples = dataset.len();
        let mut indices: Vec<usize> = (0..num_samples).collect();

        if shuffle {
            use rand::seq::SliceRandom;
            let mut rng = rand::thread_rng();
            indices.shuffle(&mut rng);
        }

        Self {
            dataset,
            batch_size: batch_size.max(1),
            current_idx: 0,
            indices,
            shuffle,
        }
    }

    /// Get next batch
    pub fn next_batch(&mut self, device: &Device) -> Result<Option<Batch>> {
        if self.current_idx >= self.indices.len() {
            return Ok(None);
        }

        let end_idx = (self.current_idx + self.batch_size).min(self.indices.len());
        let batch = self.dataset.batch(&self.indices[self.current_idx..end_idx], device)?;
        self.current_idx = end_idx;

        Ok(Some(batch))
    }

    /// Reset loader for new epoch
    pub fn reset(&mut self) {
        self.current_idx = 0;

        if self.shuffle {
            use rand::seq::SliceRandom;
            let mut rng = rand::thread_rng();
            self.indices.shuffle(&mut rng);
        }
    }

    /// Get number of batches
    pub fn num_batches(&self) -> usize {
        (self.dataset.len() + self.batch_size - 1) / self.batch_size
    }

    /// Get dataset reference
    pub fn dataset(&self) -> &MultimodalDataset {
        &self.dataset
    }
}

impl super::BatchDataLoader for MultimodalDataLoader {
    fn next_batch(&mut self, device: &Device) -> Result<Option<Batch>> {
        MultimodalDataLoader::next_batch(self, device)
    }

    fn reset(&mut self) {
        MultimodalDataLoader::reset(self)
    }

    fn num_batches(&self) -> usize {
        MultimodalDataLoader::num_batches(self)
    }
}
