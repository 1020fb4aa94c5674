/// Robustness evaluation over families of noise-perturbed test sets
///
/// Each noisy modality maps to an ordered list of loaders, one per noise
/// level from clean to most perturbed. Evaluating them in order yields one
/// curve per reported measure; each curve is summarized by its relative and
/// effective robustness and written out as a JSON artifact.
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use candle_core::Device;
use serde::{Deserialize, Serialize};

use super::{evaluate, single_test, EvalReport, EvalSettings};
use crate::data::BatchDataLoader;
use crate::models::TrainableModel;

/// Noise levels of an `n`-point curve, evenly spaced on [0, 1]
pub fn noise_levels(n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![0.0],
        _ => (0..n).map(|i| i as f64 / (n - 1) as f64).collect(),
    }
}

/// Trapezoidal area under `curve` over levels evenly spaced on [0, 1]
///
/// A single point has area equal to its value; an empty curve has none.
pub fn relative_robustness(curve: &[f64]) -> f64 {
    match curve.len() {
        0 => 0.0,
        1 => curve[0],
        n => {
            let dx = 1.0 / (n - 1) as f64;
            curve.windows(2).map(|w| (w[0] + w[1]) * 0.5 * dx).sum()
        }
    }
}

/// Relative robustness minus that of a baseline moved to the same clean score
///
/// Shifting a curve by a constant shifts its area by the same constant, so
/// the baseline needs no particular length. Without a baseline the
/// reference is a flat line at the clean score.
pub fn effective_robustness(curve: &[f64], baseline: Option<&[f64]>) -> f64 {
    let clean = match curve.first() {
        Some(&v) => v,
        None => return 0.0,
    };
    let reference = match baseline {
        Some(b) if !b.is_empty() => relative_robustness(b) - b[0] + clean,
        _ => clean,
    };
    relative_robustness(curve) - reference
}

/// Naming and output of a robustness run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RobustnessOptions {
    pub example_name: String,
    pub method_name: String,
    /// Directory receiving one JSON file per curve
    pub output_dir: PathBuf,
    /// Reference curves for effective robustness, keyed by measure name
    pub baselines: BTreeMap<String, Vec<f64>>,
}

impl Default for RobustnessOptions {
    fn default() -> Self {
        Self {
            example_name: "default".to_string(),
            method_name: "My method".to_string(),
            output_dir: PathBuf::from("."),
            baselines: BTreeMap::new(),
        }
    }
}

/// One measure across the noise levels of one modality
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobustnessCurve {
    pub method: String,
    pub example: String,
    pub noisy_modality: String,
    pub measure: String,
    pub levels: Vec<f64>,
    pub values: Vec<f64>,
    pub relative_robustness: f64,
    pub effective_robustness: f64,
}

impl RobustnessCurve {
    /// `{method}-{example}-{modality}-{measure}`
    pub fn artifact_name(&self) -> String {
        let name = format!(
            "{}-{}-{}-{}",
            self.method, self.example, self.noisy_modality, self.measure
        );
        name.replace(['/', '\\'], "_")
    }

    /// Write the curve as pretty JSON into `dir`, returning the file path
    pub fn write_json<P: AsRef<Path>>(&self, dir: P) -> crate::Result<PathBuf> {
        let path = dir.as_ref().join(format!("{}.json", self.artifact_name()));
        let writer = BufWriter::new(File::create(&path)?);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(path)
    }
}

/// Everything a robustness run measured
#[derive(Debug, Clone)]
pub struct RobustnessReport {
    pub clean: EvalReport,
    pub clean_seconds: f64,
    pub curves: Vec<RobustnessCurve>,
    pub artifacts: Vec<PathBuf>,
}

/// Clean test pass followed by one sweep per noisy modality
///
/// Model parameters are only read. For every key of `noisy` the loaders are
/// evaluated in order and each measure's values across them form a curve.
pub fn test<M, L>(
    model: &M,
    clean: &mut L,
    noisy: &mut BTreeMap<String, Vec<L>>,
    settings: &EvalSettings,
    options: &RobustnessOptions,
    device: &Device,
) -> crate::Result<RobustnessReport>
where
    M: TrainableModel + ?Sized,
    L: BatchDataLoader,
{
    let (clean_report, elapsed) = crate::utils::timed("Clean test", || {
        single_test(model, clean, settings, device)
    });
    let clean_report = clean_report?;

    fs::create_dir_all(&options.output_dir)?;

    let mut curves = Vec::new();
    let mut artifacts = Vec::new();

    for (noisy_modality, loaders) in noisy.iter_mut() {
        if loaders.is_empty() {
            log::warn!("No test sets for noisy modality {}, skipping", noisy_modality);
            continue;
        }
        log::info!("Testing on noisy data ({})...", noisy_modality);

        let mut per_measure: Vec<(&'static str, Vec<f64>)> = Vec::new();
        for loader in loaders.iter_mut() {
            let report = evaluate(model, loader, settings, device)?;
            for (measure, value) in report.measures() {
                match per_measure.iter_mut().find(|(name, _)| *name == measure) {
                    Some((_, values)) => values.push(value),
                    None => per_measure.push((measure, vec![value])),
                }
            }
        }

        for (measure, values) in per_measure {
            let baseline = options.baselines.get(measure).map(|b| b.as_slice());
            let curve = RobustnessCurve {
                method: options.method_name.clone(),
                example: options.example_name.clone(),
                noisy_modality: noisy_modality.clone(),
                measure: measure.to_string(),
                levels: noise_levels(values.len()),
                relative_robustness: relative_robustness(&values),
                effective_robustness: effective_robustness(&values, baseline),
                values,
            };

            log::info!(
                "relative robustness ({}, {}): {:.4}",
                noisy_modality,
                measure,
                curve.relative_robustness
            );
            log::info!(
                "effective robustness ({}, {}): {:.4}",
                noisy_modality,
                measure,
                curve.effective_robustness
            );

            let path = curve.write_json(&options.output_dir)?;
            log::info!("Curve saved as {:?}", path);
            artifacts.push(path);
            curves.push(curve);
        }
    }

    Ok(RobustnessReport {
        clean: clean_report,
        clean_seconds: elapsed.as_secs_f64(),
        curves,
        artifacts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TaskKind;
    use crate::data::{Batch, ModalityInput, VecDataLoader};
    use crate::training::checkpoint::{CheckpointMetadata, CheckpointPaths};
    use candle_core::{Tensor, Var};

    #[test]
    fn test_relative_robustness() {
        assert!((relative_robustness(&[1.0, 1.0, 1.0]) - 1.0).abs() < 1e-12);
        assert!((relative_robustness(&[1.0, 0.5, 0.0]) - 0.5).abs() < 1e-12);
        assert!((relative_robustness(&[0.8, 0.4]) - 0.6).abs() < 1e-12);
        assert_eq!(relative_robustness(&[0.7]), 0.7);
        assert_eq!(relative_robustness(&[]), 0.0);
    }

    #[test]
    fn test_effective_robustness() {
        // Flat reference at the clean score
        assert!((effective_robustness(&[1.0, 0.5, 0.0], None) + 0.5).abs() < 1e-12);
        assert!(effective_robustness(&[0.6, 0.6, 0.6], None).abs() < 1e-12);

        // Same degradation as the baseline, offset only
        let baseline = [0.8, 0.6, 0.4];
        assert!(effective_robustness(&[0.9, 0.7, 0.5], Some(&baseline)).abs() < 1e-12);

        // Degrades slower than the baseline
        assert!(effective_robustness(&[0.9, 0.9, 0.9], Some(&baseline)) > 0.0);
    }

    #[test]
    fn test_noise_levels() {
        assert_eq!(noise_levels(3), vec![0.0, 0.5, 1.0]);
        assert_eq!(noise_levels(1), vec![0.0]);
    }

    #[test]
    fn test_artifact_name() {
        let curve = RobustnessCurve {
            method: "LF".to_string(),
            example: "avmnist".to_string(),
            noisy_modality: "image/0".to_string(),
            measure: "Accuracy".to_string(),
            levels: Vec::new(),
            values: Vec::new(),
            relative_robustness: 0.0,
            effective_robustness: 0.0,
        };
        assert_eq!(curve.artifact_name(), "LF-avmnist-image_0-Accuracy");
    }

    /// Scores the first modality directly as logits
    struct Passthrough;

    impl TrainableModel for Passthrough {
        fn forward_batch(&self, batch: &Batch, _train: bool) -> candle_core::Result<Tensor> {
            Ok(batch.inputs[0].values().clone())
        }

        fn trainable_vars(&self) -> Vec<Var> {
            Vec::new()
        }

        fn save_best(&self, _: &CheckpointPaths, _: &CheckpointMetadata) -> crate::Result<()> {
            Ok(())
        }
    }

    /// Four examples, `wrong` of which are misclassified
    fn loader_with_errors(wrong: usize, device: &Device) -> crate::Result<VecDataLoader> {
        let rows: Vec<f32> = (0..4)
            .flat_map(|i| if i < wrong { [1.0, 0.0] } else { [0.0, 1.0] })
            .collect();
        let logits = Tensor::from_vec(rows, (4, 2), device)?;
        let labels = Tensor::new(&[1i64, 1, 1, 1], device)?;
        Ok(VecDataLoader::new(vec![Batch::new(
            vec![ModalityInput::Dense(logits)],
            labels,
        )]))
    }

    #[test]
    fn test_harness_collects_curve_across_levels() -> crate::Result<()> {
        let device = Device::Cpu;
        let dir = tempfile::tempdir()?;

        let mut clean = loader_with_errors(0, &device)?;
        let mut noisy = BTreeMap::new();
        noisy.insert(
            "audio".to_string(),
            vec![
                loader_with_errors(0, &device)?,
                loader_with_errors(1, &device)?,
                loader_with_errors(2, &device)?,
            ],
        );

        let options = RobustnessOptions {
            example_name: "toy".to_string(),
            output_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let settings = EvalSettings::for_task(TaskKind::Classification);
        let report = test(&Passthrough, &mut clean, &mut noisy, &settings, &options, &device)?;

        assert_eq!(report.clean.accuracy, Some(1.0));
        assert_eq!(report.curves.len(), 1);

        let curve = &report.curves[0];
        assert_eq!(curve.values, vec![1.0, 0.75, 0.5]);
        assert!((curve.relative_robustness - 0.75).abs() < 1e-12);

        let path = dir.path().join("My method-toy-audio-Accuracy.json");
        assert_eq!(report.artifacts, vec![path.clone()]);
        let written: RobustnessCurve = serde_json::from_reader(File::open(path)?)?;
        assert_eq!(&written, curve);
        Ok(())
    }
}
