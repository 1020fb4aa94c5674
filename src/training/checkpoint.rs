/// Model checkpointing with safetensors
///
/// A checkpoint is every variable of a `VarMap` written to one safetensors
/// file, with a `CheckpointMetadata` record embedded in the header.
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use candle_core::Tensor;
use candle_nn::VarMap;
use safetensors::tensor::{serialize_to_file, SafeTensors};
use serde::{Deserialize, Serialize};

use crate::config::TaskKind;

/// Header key holding the JSON-encoded metadata
const METADATA_KEY: &str = "multibench.checkpoint";

/// Checkpoint metadata
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CheckpointMetadata {
    /// Epoch (1-based) the weights come from
    pub epoch: usize,
    /// Name of the selection metric
    pub metric_name: String,
    /// Value of the selection metric at that epoch
    pub metric: f64,
    /// Task the model was trained for
    pub task: TaskKind,
}

impl CheckpointMetadata {
    fn to_header(&self) -> crate::Result<HashMap<String, String>> {
        let mut header = HashMap::new();
        header.insert(METADATA_KEY.to_string(), serde_json::to_string(self)?);
        Ok(header)
    }
}

/// Destinations of the best-model artifacts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointPaths {
    /// Whole multimodal bundle
    pub model: PathBuf,
    /// Unimodal encoder
    pub encoder: PathBuf,
    /// Unimodal head
    pub head: PathBuf,
}

impl Default for CheckpointPaths {
    fn default() -> Self {
        Self {
            model: PathBuf::from("best.safetensors"),
            encoder: PathBuf::from("encoder.safetensors"),
            head: PathBuf::from("head.safetensors"),
        }
    }
}

impl CheckpointPaths {
    /// All three artifacts under `dir` with their default file names
    pub fn in_dir<P: AsRef<Path>>(dir: P) -> Self {
        let defaults = Self::default();
        let dir = dir.as_ref();
        Self {
            model: dir.join(defaults.model),
            encoder: dir.join(defaults.encoder),
            head: dir.join(defaults.head),
        }
    }
}

/// Save every variable of `varmap` to `path`
///
/// Parent directories are created as needed; an existing file is replaced.
pub fn save_checkpoint<P: AsRef<Path>>(
    varmap: &VarMap,
    path: P,
    metadata: &CheckpointMetadata,
) -> crate::Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let tensors: Vec<(String, Tensor)> = {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| crate::MultiBenchError::Model("variable map lock poisoned".to_string()))?;
        let mut tensors: Vec<(String, Tensor)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().detach()))
            .collect();
        tensors.sort_by(|a, b| a.0.cmp(&b.0));
        tensors
    };

    serialize_to_file(tensors, &Some(metadata.to_header()?), path)?;

    log::debug!("Saved checkpoint to {:?} (epoch {})", path, metadata.epoch);
    Ok(())
}

/// Read the metadata embedded in a checkpoint
pub fn read_metadata<P: AsRef<Path>>(path: P) -> crate::Result<CheckpointMetadata> {
    let buffer = fs::read(path.as_ref())?;
    let (_, metadata) = SafeTensors::read_metadata(&buffer)?;

    let json = metadata
        .metadata()
        .as_ref()
        .and_then(|header| header.get(METADATA_KEY))
        .ok_or_else(|| {
            crate::MultiBenchError::Model(format!(
                "{:?} carries no checkpoint metadata",
                path.as_ref()
            ))
        })?;

    Ok(serde_json::from_str(json)?)
}

/// Sorted names of the tensors stored in a checkpoint
pub fn tensor_names<P: AsRef<Path>>(path: P) -> crate::Result<Vec<String>> {
    let buffer = fs::read(path.as_ref())?;
    let tensors = SafeTensors::deserialize(&buffer)?;
    let mut names: Vec<String> = tensors.names().into_iter().cloned().collect();
    names.sort();
    Ok(names)
}
