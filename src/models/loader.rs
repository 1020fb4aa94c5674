/// Weight loading from safetensors checkpoints
use std::path::Path;

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};

use super::{MultimodalModel, UnimodalModel};
use crate::training::checkpoint::{read_metadata, CheckpointMetadata, CheckpointPaths};

/// Overwrite the variables of `varmap` with the tensors stored in `path`
///
/// Every variable must be present in the file with a matching shape.
pub fn restore_weights<P: AsRef<Path>>(varmap: &mut VarMap, path: P) -> crate::Result<()> {
    varmap.load(path.as_ref())?;
    log::info!("Restored {} tensors from {:?}", varmap.all_vars().len(), path.as_ref());
    Ok(())
}

/// Read-only builder over a checkpoint, for wiring inference-only modules
///
/// # Arguments
/// * `weights_path` - Path to a safetensors file
/// * `device` - Device to load tensors on
pub fn frozen_var_builder<P: AsRef<Path>>(
    weights_path: P,
    device: &Device,
) -> crate::Result<VarBuilder<'static>> {
    let vb = unsafe {
        VarBuilder::from_mmaped_safetensors(&[weights_path.as_ref()], DType::F32, device)?
    };
    Ok(vb)
}

impl MultimodalModel {
    /// Load the weights of a best-model checkpoint into this model
    pub fn load_best<P: AsRef<Path>>(&mut self, path: P) -> crate::Result<CheckpointMetadata> {
        let metadata = read_metadata(path.as_ref())?;
        restore_weights(&mut self.varmap, path)?;
        Ok(metadata)
    }
}

impl UnimodalModel {
    /// Load encoder and head weights from their separate artifacts
    pub fn load_best(&mut self, paths: &CheckpointPaths) -> crate::Result<CheckpointMetadata> {
        let metadata = read_metadata(&paths.encoder)?;
        restore_weights(&mut self.encoder_vars, &paths.encoder)?;
        restore_weights(&mut self.head_vars, &paths.head)?;
        Ok(metadata)
    }
}
