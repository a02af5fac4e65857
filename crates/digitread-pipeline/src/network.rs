//! The digit network: two convolution blocks and a softmax head.
//!
//! ```text
//! 28x28x1 -> conv 5x5 (8, ReLU)  -> 24x24x8  -> max-pool 2x2 -> 12x12x8
//!         -> conv 5x5 (16, ReLU) -> 8x8x16   -> max-pool 2x2 -> 4x4x16
//!         -> flatten (256) -> dense (10) -> softmax
//! ```
//!
//! [`DigitModel`] is the burn module. It is generic over the backend so
//! the same definition trains on the autodiff backend and serves on
//! [`InferenceBackend`]. [`DigitNet`] wraps a trained model for inference
//! and owns its byte format: a `digitread-cnn/3` line followed by burn's
//! named MessagePack record. [`DigitNet::from_bytes`] re-checks every parameter
//! shape so a truncated or foreign file is reported as corrupt rather
//! than misread.

use std::sync::{Mutex, PoisonError};

use burn::backend::NdArray;
use burn::module::{Module, Param};
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{MaxPool2d, MaxPool2dConfig};
use burn::nn::{Linear, LinearConfig};
use burn::record::{FullPrecisionSettings, NamedMpkBytesRecorder, Recorder};
use burn::tensor::activation::{relu, softmax};
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::classify::{DigitClassifier, PATCH_SIDE, PatchTensor};
use crate::types::{CLASS_COUNT, RecognitionError};

/// CPU backend used to serve predictions.
pub type InferenceBackend = NdArray<f32>;

type InferenceDevice = <InferenceBackend as Backend>::Device;

// Must report a damaged body as `RecorderError`, never panic.
type ModelRecorder = NamedMpkBytesRecorder<FullPrecisionSettings>;

/// Convolution kernel side length.
pub const KERNEL_SIZE: usize = 5;

/// Filters in the first convolution.
pub const CONV1_FILTERS: usize = 8;

/// Filters in the second convolution.
pub const CONV2_FILTERS: usize = 16;

const INPUT_SIDE: usize = PATCH_SIDE as usize;
const CONV1_SIDE: usize = INPUT_SIDE - KERNEL_SIZE + 1;
const POOL1_SIDE: usize = CONV1_SIDE / 2;
const CONV2_SIDE: usize = POOL1_SIDE - KERNEL_SIZE + 1;
const POOL2_SIDE: usize = CONV2_SIDE / 2;

/// Length of the flattened feature vector fed to the dense head.
pub const FEATURE_LEN: usize = CONV2_FILTERS * POOL2_SIDE * POOL2_SIDE;

/// First line of every serialized model.
pub const MODEL_FORMAT: &str = "digitread-cnn/3";

/// Every parameter tensor, in [`DigitModel::parameters`] order.
pub(crate) const PARAMETER_SHAPES: [(&str, &[usize]); 6] = [
    ("conv1.weight", &[CONV1_FILTERS, 1, KERNEL_SIZE, KERNEL_SIZE]),
    ("conv1.bias", &[CONV1_FILTERS]),
    ("conv2.weight", &[CONV2_FILTERS, CONV1_FILTERS, KERNEL_SIZE, KERNEL_SIZE]),
    ("conv2.bias", &[CONV2_FILTERS]),
    ("dense.weight", &[FEATURE_LEN, CLASS_COUNT]),
    ("dense.bias", &[CLASS_COUNT]),
];

/// Errors from reading serialized network weights.
#[derive(Debug, thiserror::Error)]
pub enum ModelFormatError {
    /// The bytes do not start with [`MODEL_FORMAT`].
    #[error("unknown model format {0:?}")]
    UnknownFormat(String),

    /// The record could not be encoded or decoded.
    #[error("model record is unreadable: {0}")]
    Record(String),

    /// A parameter has the wrong shape.
    #[error("{name} has shape {actual:?}, expected {expected:?}")]
    Shape {
        /// Parameter name.
        name: &'static str,
        /// Expected dimensions.
        expected: Vec<usize>,
        /// Dimensions found.
        actual: Vec<usize>,
    },

    /// A parameter is NaN or infinite.
    #[error("{0} contains non-finite weights")]
    NonFinite(&'static str),
}

/// The convolutional digit classifier as a burn module.
#[derive(Module, Debug)]
pub struct DigitModel<B: Backend> {
    pub(crate) conv1: Conv2d<B>,
    pub(crate) conv2: Conv2d<B>,
    pool: MaxPool2d,
    pub(crate) dense: Linear<B>,
}

impl<B: Backend> DigitModel<B> {
    /// The architecture with burn's default initialization.
    #[must_use]
    pub fn new(device: &B::Device) -> Self {
        let kernel = [KERNEL_SIZE, KERNEL_SIZE];
        Self {
            conv1: Conv2dConfig::new([1, CONV1_FILTERS], kernel).init(device),
            conv2: Conv2dConfig::new([CONV1_FILTERS, CONV2_FILTERS], kernel).init(device),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            dense: LinearConfig::new(FEATURE_LEN, CLASS_COUNT).init(device),
        }
    }

    /// The architecture with Glorot-uniform weights drawn from a
    /// generator seeded with `seed`. Biases start at zero.
    ///
    /// The same seed always yields the same parameters.
    #[must_use]
    pub fn seeded(seed: u64, device: &B::Device) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let area = KERNEL_SIZE * KERNEL_SIZE;
        let mut model = Self::new(device);

        model.conv1.weight = glorot(
            &mut rng,
            [CONV1_FILTERS, 1, KERNEL_SIZE, KERNEL_SIZE],
            area,
            CONV1_FILTERS * area,
            device,
        );
        model.conv1.bias = Some(zeros(CONV1_FILTERS, device));
        model.conv2.weight = glorot(
            &mut rng,
            [CONV2_FILTERS, CONV1_FILTERS, KERNEL_SIZE, KERNEL_SIZE],
            CONV1_FILTERS * area,
            CONV2_FILTERS * area,
            device,
        );
        model.conv2.bias = Some(zeros(CONV2_FILTERS, device));
        model.dense.weight = glorot(
            &mut rng,
            [FEATURE_LEN, CLASS_COUNT],
            FEATURE_LEN,
            CLASS_COUNT,
            device,
        );
        model.dense.bias = Some(zeros(CLASS_COUNT, device));
        model
    }

    /// Both convolution blocks, flattened: `[batch, 1, 28, 28]` to
    /// `[batch, FEATURE_LEN]`.
    pub fn features(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.pool.forward(relu(self.conv1.forward(images)));
        let x = self.pool.forward(relu(self.conv2.forward(x)));
        x.flatten(1, 3)
    }

    /// Class logits: `[batch, 1, 28, 28]` to `[batch, 10]`.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.dense.forward(self.features(images))
    }

    /// Dimensions and values of every parameter, in
    /// [`PARAMETER_SHAPES`] order. A missing bias is empty.
    pub(crate) fn parameters(&self) -> Vec<(Vec<usize>, Vec<f32>)> {
        vec![
            flatten_param(Some(&self.conv1.weight)),
            flatten_param(self.conv1.bias.as_ref()),
            flatten_param(Some(&self.conv2.weight)),
            flatten_param(self.conv2.bias.as_ref()),
            flatten_param(Some(&self.dense.weight)),
            flatten_param(self.dense.bias.as_ref()),
        ]
    }

    fn check(&self) -> Result<(), ModelFormatError> {
        for ((dims, values), (name, expected)) in self.parameters().into_iter().zip(PARAMETER_SHAPES) {
            let count: usize = expected.iter().product();
            if dims != expected || values.len() != count {
                return Err(ModelFormatError::Shape {
                    name,
                    expected: expected.to_vec(),
                    actual: dims,
                });
            }
            if values.iter().any(|v| !v.is_finite()) {
                return Err(ModelFormatError::NonFinite(name));
            }
        }
        Ok(())
    }
}

/// Stack patches into a `[count, 1, 28, 28]` image batch.
pub(crate) fn patch_batch<'a, B: Backend>(
    patches: impl ExactSizeIterator<Item = &'a PatchTensor>,
    device: &B::Device,
) -> Tensor<B, 4> {
    let count = patches.len();
    let values: Vec<f32> = patches.flat_map(|p| p.values().iter().copied()).collect();
    Tensor::from_data(
        TensorData::new(values, [count, 1, INPUT_SIDE, INPUT_SIDE]),
        device,
    )
}

/// A trained network ready for inference.
///
/// The model sits behind a mutex so a shared `DigitNet` can be used from
/// several threads; each prediction runs on a cheap clone.
#[derive(Debug)]
pub struct DigitNet {
    model: Mutex<DigitModel<InferenceBackend>>,
    device: InferenceDevice,
}

impl DigitNet {
    /// A freshly initialized, untrained network. See
    /// [`DigitModel::seeded`].
    #[must_use]
    pub fn initialize(seed: u64) -> Self {
        Self::from_model(DigitModel::<InferenceBackend>::seeded(
            seed,
            &InferenceDevice::default(),
        ))
    }

    /// Wrap an existing model.
    #[must_use]
    pub fn from_model(model: DigitModel<InferenceBackend>) -> Self {
        Self {
            model: Mutex::new(model),
            device: InferenceDevice::default(),
        }
    }

    /// A copy of the underlying model.
    #[must_use]
    pub fn model(&self) -> DigitModel<InferenceBackend> {
        self.model
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Parse and validate serialized weights.
    ///
    /// # Errors
    ///
    /// Returns a [`ModelFormatError`] if the bytes carry another format
    /// line, the record cannot be decoded, or a parameter is mis-shaped
    /// or non-finite.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ModelFormatError> {
        let (tag, record) = match bytes.iter().position(|b| *b == b'\n') {
            Some(newline) => (&bytes[..newline], &bytes[newline + 1..]),
            None => (bytes, &[][..]),
        };
        if tag != MODEL_FORMAT.as_bytes() {
            let tag: String = String::from_utf8_lossy(tag).chars().take(40).collect();
            return Err(ModelFormatError::UnknownFormat(tag));
        }

        let device = InferenceDevice::default();
        let record: <DigitModel<InferenceBackend> as Module<InferenceBackend>>::Record =
            <ModelRecorder as Recorder<InferenceBackend>>::load(
                &ModelRecorder::default(),
                record.to_vec(),
                &device,
            )
            .map_err(|e| ModelFormatError::Record(format!("{e:?}")))?;
        let model = DigitModel::<InferenceBackend>::new(&device).load_record(record);
        model.check()?;
        Ok(Self::from_model(model))
    }

    /// Serialize the weights.
    ///
    /// # Errors
    ///
    /// Returns [`ModelFormatError::Record`] if the recorder fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ModelFormatError> {
        let record = <ModelRecorder as Recorder<InferenceBackend>>::record(
            &ModelRecorder::default(),
            self.model().into_record(),
            (),
        )
        .map_err(|e| ModelFormatError::Record(format!("{e:?}")))?;

        let mut bytes = Vec::with_capacity(MODEL_FORMAT.len() + 1 + record.len());
        bytes.extend_from_slice(MODEL_FORMAT.as_bytes());
        bytes.push(b'\n');
        bytes.extend_from_slice(&record);
        Ok(bytes)
    }

    /// Full forward pass with softmax.
    ///
    /// # Errors
    ///
    /// Returns [`RecognitionError::InferenceFailed`] if the output cannot
    /// be read back as ten probabilities.
    pub fn probabilities(&self, input: &PatchTensor) -> Result<[f32; CLASS_COUNT], RecognitionError> {
        let images = patch_batch::<InferenceBackend>(std::iter::once(input), &self.device);
        let output = softmax(self.model().forward(images), 1);
        let values = output
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| RecognitionError::InferenceFailed(format!("{e:?}")))?;
        <[f32; CLASS_COUNT]>::try_from(values.as_slice()).map_err(|_| {
            RecognitionError::InferenceFailed(format!(
                "expected {CLASS_COUNT} outputs, got {}",
                values.len()
            ))
        })
    }
}

impl DigitClassifier for DigitNet {
    fn predict(&self, input: &PatchTensor) -> Result<[f32; CLASS_COUNT], RecognitionError> {
        let probabilities = self.probabilities(input)?;
        if probabilities.iter().any(|p| !p.is_finite()) {
            return Err(RecognitionError::InferenceFailed(
                "forward pass produced non-finite output".into(),
            ));
        }
        Ok(probabilities)
    }
}

#[allow(clippy::cast_precision_loss)]
fn glorot<B: Backend, const D: usize>(
    rng: &mut StdRng,
    shape: [usize; D],
    fan_in: usize,
    fan_out: usize,
    device: &B::Device,
) -> Param<Tensor<B, D>> {
    let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
    let count = shape.iter().product();
    let values: Vec<f32> = (0..count).map(|_| rng.random_range(-limit..limit)).collect();
    Param::from_tensor(Tensor::from_data(TensorData::new(values, shape), device))
}

fn zeros<B: Backend>(len: usize, device: &B::Device) -> Param<Tensor<B, 1>> {
    Param::from_tensor(Tensor::zeros([len], device))
}

fn flatten_param<B: Backend, const D: usize>(
    param: Option<&Param<Tensor<B, D>>>,
) -> (Vec<usize>, Vec<f32>) {
    param.map_or_else(Default::default, |param| {
        let tensor = param.val();
        let dims = tensor.dims().to_vec();
        let values = tensor.into_data().to_vec::<f32>().unwrap_or_default();
        (dims, values)
    })
}
