/// Noise-perturbed copies of a dataset for robustness evaluation
///
/// One family is a list of datasets where a single modality is corrupted at
/// increasing noise levels. The first level is normally 0.0 (clean data).
use ndarray::ArrayD;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use super::MultimodalDataset;

/// How a modality is corrupted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoiseKind {
    /// Additive Gaussian noise with standard deviation = level
    Gaussian,
    /// Each entry is zeroed with probability = level
    Drop,
}

/// Corrupt `values` at the given noise level
pub fn perturb(
    values: &ArrayD<f32>,
    kind: NoiseKind,
    level: f32,
    rng: &mut StdRng,
) -> crate::Result<ArrayD<f32>> {
    if !level.is_finite() || level < 0.0 {
        return Err(crate::MultiBenchError::Config(format!(
            "noise level must be finite and >= 0, got {}",
            level
        )));
    }
    if level == 0.0 {
        return Ok(values.clone());
    }

    match kind {
        NoiseKind::Gaussian => {
            let normal = Normal::new(0.0f32, level)
                .map_err(|e| crate::MultiBenchError::Config(e.to_string()))?;
            Ok(values.mapv(|x| x + normal.sample(rng)))
        }
        NoiseKind::Drop => {
            if level > 1.0 {
                return Err(crate::MultiBenchError::Config(format!(
                    "drop probability must be <= 1, got {}",
                    level
                )));
            }
            Ok(values.mapv(|x| if rng.gen::<f32>() < level { 0.0 } else { x }))
        }
    }
}

/// Build one perturbed dataset per noise level for `modality`
pub fn noisy_family(
    dataset: &MultimodalDataset,
    modality: usize,
    kind: NoiseKind,
    levels: &[f32],
    seed: u64,
) -> crate::Result<Vec<MultimodalDataset>> {
    let clean = dataset
        .modality(modality)
        .ok_or_else(|| crate::MultiBenchError::Data(format!("no modality at index {}", modality)))?;

    let mut rng = StdRng::seed_from_u64(seed);
    let mut family = Vec::with_capacity(levels.len());
    for &level in levels {
        let values = perturb(&clean.values, kind, level, &mut rng)?;
        family.push(dataset.with_modality_values(modality, values)?);
    }

    log::debug!(
        "Built {} noisy copies of modality '{}' ({:?})",
        family.len(),
        clean.name,
        kind
    );

    Ok(family)
}
