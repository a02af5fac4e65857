//! Fitting a [`DigitNet`] to a labeled dataset.
//!
//! The whole [`DigitModel`] (both convolution blocks and the dense head)
//! is trained end to end on the autodiff backend, with Adam on the mean
//! cross-entropy of each shuffled mini-batch. The trained module is then
//! moved to the inference backend.

use burn::backend::Autodiff;
use burn::module::AutodiffModule;
use burn::nn::loss::{CrossEntropyLoss, CrossEntropyLossConfig};
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::tensor::backend::Backend;
use burn::tensor::{ElementConversion, Int, Tensor, TensorData};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::dataset::{DEFAULT_SAMPLE_LIMIT, Dataset, DatasetError, LabeledSample};
use crate::network::{DigitModel, DigitNet, InferenceBackend, patch_batch};
use crate::types::CLASS_COUNT;

/// Backend the model is trained on.
pub type TrainingBackend = Autodiff<InferenceBackend>;

const ADAM_BETA1: f32 = 0.9;
const ADAM_BETA2: f32 = 0.999;
const ADAM_EPSILON: f32 = 1e-7;

/// Samples per forward pass when measuring holdout accuracy.
const EVALUATION_BATCH: usize = 256;

/// Training hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Samples per gradient step.
    pub batch_size: usize,
    /// Fraction of the dataset held out (from its end) for validation.
    pub validation_split: f32,
    /// Passes over the training samples.
    pub epochs: u32,
    /// Adam step size.
    pub learning_rate: f32,
    /// Number of samples requested from the dataset source.
    pub sample_limit: usize,
    /// Seed for weight initialization and batch shuffling.
    pub seed: u64,
}

impl TrainingConfig {
    /// Default mini-batch size.
    pub const DEFAULT_BATCH_SIZE: usize = 512;

    /// Default validation holdout.
    pub const DEFAULT_VALIDATION_SPLIT: f32 = 0.15;

    /// Default number of epochs.
    pub const DEFAULT_EPOCHS: u32 = 1;

    /// Default Adam learning rate.
    pub const DEFAULT_LEARNING_RATE: f32 = 0.001;

    /// Default seed.
    pub const DEFAULT_SEED: u64 = 42;

    /// Check that every field is usable.
    ///
    /// # Errors
    ///
    /// Returns [`TrainingError::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> Result<(), TrainingError> {
        if self.batch_size == 0 {
            return Err(TrainingError::InvalidConfig("batch_size must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.validation_split) {
            return Err(TrainingError::InvalidConfig(format!(
                "validation_split must be in [0, 1), got {}",
                self.validation_split
            )));
        }
        if self.epochs == 0 {
            return Err(TrainingError::InvalidConfig("epochs must be positive".into()));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(TrainingError::InvalidConfig(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if self.sample_limit == 0 {
            return Err(TrainingError::InvalidConfig("sample_limit must be positive".into()));
        }
        Ok(())
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batch_size: Self::DEFAULT_BATCH_SIZE,
            validation_split: Self::DEFAULT_VALIDATION_SPLIT,
            epochs: Self::DEFAULT_EPOCHS,
            learning_rate: Self::DEFAULT_LEARNING_RATE,
            sample_limit: DEFAULT_SAMPLE_LIMIT,
            seed: Self::DEFAULT_SEED,
        }
    }
}

/// Errors from training.
#[derive(Debug, thiserror::Error)]
pub enum TrainingError {
    /// A hyperparameter is out of range.
    #[error("invalid training config: {0}")]
    InvalidConfig(String),

    /// The dataset could not be used.
    #[error(transparent)]
    Dataset(#[from] DatasetError),

    /// The loss became NaN or infinite.
    #[error("training diverged")]
    Diverged,
}

/// Summary of a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    /// Samples used for fitting.
    pub training_samples: usize,
    /// Samples held out.
    pub validation_samples: usize,
    /// Epochs run.
    pub epochs: u32,
    /// Mean cross-entropy over the last epoch.
    pub mean_loss: f32,
    /// Fraction of held-out samples classified correctly, if any were
    /// held out.
    pub validation_accuracy: Option<f32>,
}

/// Train a fresh network on `dataset`.
///
/// Weights start from [`DigitModel::seeded`] with `config.seed`. The last
/// `validation_split` of the samples are held out. Training samples are
/// shuffled each epoch with a generator seeded from `config.seed`, so the
/// result is reproducible.
///
/// # Errors
///
/// Returns [`TrainingError::InvalidConfig`] for bad hyperparameters,
/// [`TrainingError::Dataset`] if no training samples remain after the
/// holdout, and [`TrainingError::Diverged`] if the loss stops being finite.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
pub fn train(
    dataset: &Dataset,
    config: &TrainingConfig,
) -> Result<(DigitNet, TrainingReport), TrainingError> {
    config.validate()?;
    let (training, validation) = dataset.split(config.validation_split);
    if training.is_empty() {
        return Err(DatasetError::Empty.into());
    }

    let device = <TrainingBackend as Backend>::Device::default();
    let mut model = DigitModel::<TrainingBackend>::seeded(config.seed, &device);
    let mut optimizer = AdamConfig::new()
        .with_beta_1(ADAM_BETA1)
        .with_beta_2(ADAM_BETA2)
        .with_epsilon(ADAM_EPSILON)
        .init::<TrainingBackend, DigitModel<TrainingBackend>>();
    let loss_fn: CrossEntropyLoss<TrainingBackend> = CrossEntropyLossConfig::new().init(&device);

    let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(1));
    let mut order: Vec<usize> = (0..training.len()).collect();
    let mut mean_loss = 0.0;

    for epoch in 0..config.epochs {
        order.shuffle(&mut rng);
        let mut epoch_loss = 0.0_f64;

        for batch in order.chunks(config.batch_size) {
            let images =
                patch_batch::<TrainingBackend>(batch.iter().map(|&i| &training[i].input), &device);
            let targets =
                label_batch::<TrainingBackend>(batch.iter().map(|&i| training[i].label), &device);

            let loss = loss_fn.forward(model.forward(images), targets);
            let batch_loss: f32 = loss.clone().into_scalar().elem();
            if !batch_loss.is_finite() {
                return Err(TrainingError::Diverged);
            }
            epoch_loss += f64::from(batch_loss) * batch.len() as f64;

            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optimizer.step(f64::from(config.learning_rate), model, grads);
        }

        mean_loss = (epoch_loss / training.len() as f64) as f32;
        log::debug!("epoch {}/{}: loss {mean_loss:.4}", epoch + 1, config.epochs);
    }

    let model = model.valid();
    let validation_accuracy =
        (!validation.is_empty()).then(|| accuracy(&model, validation, &device));

    let report = TrainingReport {
        training_samples: training.len(),
        validation_samples: validation.len(),
        epochs: config.epochs,
        mean_loss,
        validation_accuracy,
    };
    Ok((DigitNet::from_model(model), report))
}

fn label_batch<B: Backend>(
    labels: impl Iterator<Item = u8>,
    device: &B::Device,
) -> Tensor<B, 1, Int> {
    let labels: Vec<i64> = labels.map(i64::from).collect();
    let count = labels.len();
    Tensor::from_data(TensorData::new(labels, [count]), device)
}

/// Fraction of `samples` whose arg-max class matches the label.
#[allow(clippy::cast_precision_loss)]
fn accuracy(
    model: &DigitModel<InferenceBackend>,
    samples: &[LabeledSample],
    device: &<InferenceBackend as Backend>::Device,
) -> f32 {
    let correct: usize = samples
        .chunks(EVALUATION_BATCH)
        .map(|chunk| {
            let logits = model.forward(patch_batch(chunk.iter().map(|s| &s.input), device));
            let values = logits.into_data().to_vec::<f32>().unwrap_or_default();
            values
                .chunks_exact(CLASS_COUNT)
                .zip(chunk)
                .filter(|(row, s)| arg_max(row) == usize::from(s.label))
                .count()
        })
        .sum();
    correct as f32 / samples.len() as f32
}

fn arg_max(p: &[f32]) -> usize {
    p.iter()
        .enumerate()
        .fold((0, f32::MIN), |acc, (i, v)| if *v > acc.1 { (i, *v) } else { acc })
        .0
}
