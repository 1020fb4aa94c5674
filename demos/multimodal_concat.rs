/// Late-fusion classification on a synthetic two-modality dataset,
/// followed by a robustness sweep over Gaussian noise on the first modality
use std::collections::BTreeMap;

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use multibench::data::{
    noisy_family, Labels, ModalityData, MultimodalDataLoader, MultimodalDataset, NoiseKind,
};
use multibench::eval::{robustness, RobustnessOptions};
use multibench::layers::{Concat, Encoder, Mlp};
use multibench::training::Trainer;
use multibench::{ExperimentConfig, MultimodalModel, TaskKind};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

const SIGNAL_DIM: usize = 6;
const CONTEXT_DIM: usize = 4;

/// Class 1 when a fixed linear score over both modalities is positive
fn synthetic(n: usize, seed: u64) -> anyhow::Result<MultimodalDataset> {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0f32, 1.0)?;

    let signal = Array2::from_shape_fn((n, SIGNAL_DIM), |_| normal.sample(&mut rng));
    let context = Array2::from_shape_fn((n, CONTEXT_DIM), |_| normal.sample(&mut rng));
    let labels: Array1<u32> = (0..n)
        .map(|i| {
            let score = signal[[i, 0]] - 0.5 * signal[[i, 1]] + context[[i, 2]];
            u32::from(score > 0.0)
        })
        .collect();

    Ok(MultimodalDataset::new(
        vec![
            ModalityData::dense("signal", signal.into_dyn()),
            ModalityData::dense("context", context.into_dyn()),
        ],
        Labels::Classes(labels),
        TaskKind::Classification,
    )?)
}

fn build_model(device: &Device) -> anyhow::Result<MultimodalModel> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

    let encoders: Vec<Box<dyn Encoder>> = vec![
        Box::new(Mlp::new(SIGNAL_DIM, 32, 16, vb.pp("encoders.0"))?),
        Box::new(Mlp::new(CONTEXT_DIM, 32, 16, vb.pp("encoders.1"))?),
    ];
    let head = Mlp::new(32, 32, 2, vb.pp("head"))?.with_dropout(0.1);

    Ok(MultimodalModel::new(varmap, encoders, Box::new(Concat), Box::new(head))?)
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let device = if candle_core::utils::cuda_is_available() {
        Device::new_cuda(0)?
    } else {
        Device::Cpu
    };
    log::info!("Using device: {:?}", device);

    // Optional JSON experiment file as the first argument
    let mut config = match std::env::args().nth(1) {
        Some(path) => ExperimentConfig::from_json_file(path)?,
        None => ExperimentConfig {
            example_name: "synthetic".to_string(),
            method_name: "late-fusion".to_string(),
            epochs: 20,
            early_stop: true,
            auprc: true,
            ..Default::default()
        },
    };
    let run_dir = std::path::PathBuf::from("runs").join(&config.example_name);
    config.save = run_dir.join("best.safetensors");
    config.validate()?;

    let train = synthetic(1024, 0)?;
    let valid = synthetic(256, 1)?;
    let test = synthetic(256, 2)?;

    let mut train_loader = MultimodalDataLoader::new(train, config.batch_size, true);
    let mut valid_loader = MultimodalDataLoader::new(valid, config.batch_size, false);

    let model = build_model(&device)?;
    log::info!("Model parameters: {}", model.num_parameters());

    let training_config = config.training_config();
    let mut trainer = Trainer::new(model, Vec::new(), training_config.clone())?;
    let history = trainer.train(&mut train_loader, &mut valid_loader, &device)?;
    log::info!(
        "Saved after epochs {:?}, stopped early: {}",
        history.saved_epochs(),
        history.stopped_early
    );

    // Evaluate the best checkpoint, not the last epoch
    let mut model = trainer.into_model();
    let metadata = model.load_best(&config.save)?;
    log::info!("Loaded best model from epoch {}", metadata.epoch);

    let levels = [0.0, 0.25, 0.5, 0.75, 1.0];
    let mut noisy = BTreeMap::new();
    noisy.insert(
        "signal".to_string(),
        noisy_family(&test, 0, NoiseKind::Gaussian, &levels, 7)?
            .into_iter()
            .map(|d| MultimodalDataLoader::new(d, config.batch_size, false))
            .collect::<Vec<_>>(),
    );
    let mut clean_loader = MultimodalDataLoader::new(test, config.batch_size, false);

    let options = RobustnessOptions {
        example_name: config.example_name.clone(),
        method_name: config.method_name.clone(),
        output_dir: run_dir,
        ..Default::default()
    };
    let report = robustness::test(
        &model,
        &mut clean_loader,
        &mut noisy,
        &training_config.eval_settings(),
        &options,
        &device,
    )?;

    for curve in &report.curves {
        log::info!(
            "{}: relative {:.4}, effective {:.4}",
            curve.measure,
            curve.relative_robustness,
            curve.effective_robustness
        );
    }

    Ok(())
}
