/// Unimodal regression over a packed (variable-length) sequence modality
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use multibench::data::{Labels, ModalityData, MultimodalDataLoader, MultimodalDataset};
use multibench::eval::single_test;
use multibench::layers::{MaskedMeanPool, Mlp};
use multibench::training::{CheckpointPaths, Objective, OptimizerKind, Trainer, TrainingConfig};
use multibench::{TaskKind, UnimodalModel};
use ndarray::{Array1, Array2, Array3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

const MAX_LEN: usize = 12;
const FEATURES: usize = 3;

/// Modality 0 is a distractor; the target is the mean of feature 0 over the
/// valid steps of modality 1
fn synthetic(n: usize, seed: u64) -> anyhow::Result<MultimodalDataset> {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0f32, 1.0)?;

    let distractor = Array2::from_shape_fn((n, 5), |_| normal.sample(&mut rng));
    let lengths: Array1<u32> = (0..n).map(|_| rng.gen_range(1..=MAX_LEN as u32)).collect();
    let sequence = Array3::from_shape_fn((n, MAX_LEN, FEATURES), |(i, t, _)| {
        if t < lengths[i] as usize {
            normal.sample(&mut rng)
        } else {
            0.0
        }
    });

    let targets = Array2::from_shape_fn((n, 1), |(i, _)| {
        let len = lengths[i] as usize;
        (0..len).map(|t| sequence[[i, t, 0]]).sum::<f32>() / len as f32
    });

    Ok(MultimodalDataset::new(
        vec![
            ModalityData::dense("distractor", distractor.into_dyn()),
            ModalityData::packed("sequence", sequence.into_dyn(), lengths),
        ],
        Labels::Values(targets),
        TaskKind::Regression,
    )?)
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let device = Device::Cpu;

    let mut train_loader = MultimodalDataLoader::new(synthetic(800, 10)?, 32, true);
    let mut valid_loader = MultimodalDataLoader::new(synthetic(200, 11)?, 32, false);
    let mut test_loader = MultimodalDataLoader::new(synthetic(200, 12)?, 32, false);

    let encoder_vars = VarMap::new();
    let head_vars = VarMap::new();
    let encoder = MaskedMeanPool::new(
        FEATURES,
        16,
        VarBuilder::from_varmap(&encoder_vars, DType::F32, &device),
    )?;
    let head = Mlp::new(16, 16, 1, VarBuilder::from_varmap(&head_vars, DType::F32, &device))?;
    let model = UnimodalModel::new(Box::new(encoder), encoder_vars, Box::new(head), head_vars, 1);

    let config = TrainingConfig {
        epochs: 15,
        task: TaskKind::Regression,
        objective: Objective::Mse.into(),
        optimizer: OptimizerKind::AdamW,
        learning_rate: 5e-3,
        early_stop: true,
        checkpoint: CheckpointPaths::in_dir("runs/unimodal"),
        ..Default::default()
    };
    let settings = config.eval_settings();
    let paths = config.checkpoint.clone();

    let mut trainer = Trainer::new(model, Vec::new(), config)?;
    let history = trainer.train(&mut train_loader, &mut valid_loader, &device)?;
    log::info!("Best validation MSE {:.4}", history.best_metric);

    let mut model = trainer.into_model();
    model.load_best(&paths)?;
    let report = single_test(&model, &mut test_loader, &settings, &device)?;
    log::info!("Test MSE {:.4} over {} examples", report.loss, report.num_examples);

    Ok(())
}
