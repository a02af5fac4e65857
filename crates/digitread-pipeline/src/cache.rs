//! The shared, lazily initialized digit classifier.
//!
//! [`ModelCache`] owns at most one trained network. The first
//! [`ModelCache::ensure_ready`] call loads it from the [`ModelStore`] or,
//! failing that, trains it from the [`DatasetSource`] and persists it.
//! Callers arriving while that attempt is running block on a condition
//! variable and share its outcome; the lock is never held while loading,
//! training, or classifying.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::classify::{self, DigitClassifier, PatchTensor};
use crate::dataset::DatasetSource;
use crate::network::DigitNet;
use crate::store::{MODEL_KEY, ModelStore};
use crate::train::{TrainingConfig, TrainingReport, train};
use crate::types::{CLASS_COUNT, DigitPrediction, RecognitionError, RgbaImage};

/// Lifecycle of the cached model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelStatus {
    /// No model is held.
    Absent,
    /// A load-or-train attempt is in flight.
    Initializing,
    /// A model is ready for inference.
    Ready,
}

/// Shared, read-only reference to a ready network.
#[derive(Debug, Clone)]
pub struct ModelHandle(Arc<DigitNet>);

impl ModelHandle {
    /// The underlying network.
    #[must_use]
    pub fn network(&self) -> &DigitNet {
        &self.0
    }

    /// Classify one glyph patch.
    ///
    /// # Errors
    ///
    /// See [`classify::classify`].
    pub fn classify(&self, patch: &RgbaImage) -> Result<DigitPrediction, RecognitionError> {
        classify::classify(self, patch)
    }
}

impl DigitClassifier for ModelHandle {
    fn predict(&self, input: &PatchTensor) -> Result<[f32; CLASS_COUNT], RecognitionError> {
        self.0.predict(input)
    }
}

enum State {
    Absent,
    Initializing,
    Ready(ModelHandle),
}

struct Inner {
    state: State,
    /// Number of load-or-train attempts started so far.
    attempts: u64,
    /// The most recent failed attempt and its message.
    last_failure: Option<(u64, String)>,
    last_report: Option<TrainingReport>,
}

/// Single-flight cache around the digit classifier.
pub struct ModelCache {
    store: Arc<dyn ModelStore>,
    dataset: Arc<dyn DatasetSource>,
    training: TrainingConfig,
    inner: Mutex<Inner>,
    settled: Condvar,
}

impl std::fmt::Debug for ModelCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelCache")
            .field("status", &self.status())
            .field("training", &self.training)
            .finish_non_exhaustive()
    }
}

type Outcome = Result<(ModelHandle, Option<TrainingReport>), String>;

impl ModelCache {
    /// An empty cache that persists to `store` and trains from `dataset`
    /// with `training`.
    #[must_use]
    pub fn new(
        store: Arc<dyn ModelStore>,
        dataset: Arc<dyn DatasetSource>,
        training: TrainingConfig,
    ) -> Self {
        Self {
            store,
            dataset,
            training,
            inner: Mutex::new(Inner {
                state: State::Absent,
                attempts: 0,
                last_failure: None,
                last_report: None,
            }),
            settled: Condvar::new(),
        }
    }

    /// Return the ready model, loading or training it first if needed.
    ///
    /// Idempotent. If another thread is already initializing, this call
    /// waits for that attempt and shares its result.
    ///
    /// # Errors
    ///
    /// Returns [`RecognitionError::ModelUnavailable`] if the model can be
    /// neither loaded nor trained. The cache is then `Absent` again and a
    /// later call retries.
    pub fn ensure_ready(&self) -> Result<ModelHandle, RecognitionError> {
        let mut inner = self.lock()?;
        let mut waited_on = None;

        let attempt = loop {
            if let State::Ready(handle) = &inner.state {
                return Ok(handle.clone());
            }
            if matches!(inner.state, State::Initializing) {
                waited_on = Some(inner.attempts);
                inner = self.settled.wait(inner).map_err(poisoned)?;
                continue;
            }
            if let (Some(waited), Some((failed, message))) = (waited_on, &inner.last_failure)
                && waited == *failed
            {
                return Err(RecognitionError::ModelUnavailable(message.clone()));
            }
            inner.attempts += 1;
            inner.state = State::Initializing;
            break inner.attempts;
        };
        drop(inner);

        let mut guard = Attempt {
            cache: self,
            attempt,
            outcome: None,
        };
        let result = self.load_or_train();
        guard.outcome = Some(result.as_ref().cloned().map_err(ToString::to_string));
        drop(guard);

        result.map(|(handle, _)| handle)
    }

    /// Classify a patch with the cached model.
    ///
    /// Never starts initialization.
    ///
    /// # Errors
    ///
    /// Returns [`RecognitionError::ModelUnavailable`] unless the cache is
    /// ready, and [`RecognitionError::InferenceFailed`] if classification
    /// fails.
    pub fn classify(&self, patch: &RgbaImage) -> Result<DigitPrediction, RecognitionError> {
        let handle = match &self.lock()?.state {
            State::Ready(handle) => handle.clone(),
            State::Absent | State::Initializing => {
                return Err(RecognitionError::ModelUnavailable(
                    "model is not loaded".into(),
                ));
            }
        };
        handle.classify(patch)
    }

    /// Drop the cached model.
    ///
    /// Handles already given out stay valid. The next
    /// [`ensure_ready`](Self::ensure_ready) loads or trains again. Has no
    /// effect while an attempt is in flight.
    pub fn dispose(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(inner.state, State::Ready(_)) {
            inner.state = State::Absent;
            log::debug!("disposed cached model");
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn status(&self) -> ModelStatus {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match inner.state {
            State::Absent => ModelStatus::Absent,
            State::Initializing => ModelStatus::Initializing,
            State::Ready(_) => ModelStatus::Ready,
        }
    }

    /// Report of the most recent training run, if this cache trained.
    #[must_use]
    pub fn last_training_report(&self) -> Option<TrainingReport> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_report
            .clone()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, RecognitionError> {
        self.inner.lock().map_err(poisoned)
    }

    fn load_or_train(&self) -> Result<(ModelHandle, Option<TrainingReport>), RecognitionError> {
        match self.store.load(MODEL_KEY) {
            Ok(Some(bytes)) => match DigitNet::from_bytes(&bytes) {
                Ok(net) => {
                    log::info!("loaded model {MODEL_KEY} from store");
                    return Ok((ModelHandle(Arc::new(net)), None));
                }
                Err(e) => log::warn!("stored model {MODEL_KEY} is corrupt, retraining: {e}"),
            },
            Ok(None) => log::info!("no stored model {MODEL_KEY}, training"),
            Err(e) => log::warn!("could not read stored model {MODEL_KEY}, training: {e}"),
        }

        let dataset = self
            .dataset
            .fetch(self.training.sample_limit)
            .map_err(|e| RecognitionError::ModelUnavailable(e.to_string()))?;
        let (net, report) = train(&dataset, &self.training)
            .map_err(|e| RecognitionError::ModelUnavailable(e.to_string()))?;
        log::info!(
            "trained model on {} samples ({} held out): loss {:.4}, validation accuracy {}",
            report.training_samples,
            report.validation_samples,
            report.mean_loss,
            report
                .validation_accuracy
                .map_or_else(|| "n/a".to_owned(), |a| format!("{:.1}%", a * 100.0)),
        );

        match net.to_bytes() {
            Ok(bytes) => {
                if let Err(e) = self.store.save(MODEL_KEY, &bytes) {
                    log::warn!("could not persist model {MODEL_KEY}: {e}");
                }
            }
            Err(e) => log::warn!("could not serialize model {MODEL_KEY}: {e}"),
        }

        Ok((ModelHandle(Arc::new(net)), Some(report)))
    }
}

/// Publishes the result of one load-or-train attempt when dropped, so
/// waiters are released even if the attempt unwinds.
struct Attempt<'a> {
    cache: &'a ModelCache,
    attempt: u64,
    outcome: Option<Outcome>,
}

impl Drop for Attempt<'_> {
    fn drop(&mut self) {
        let outcome = self
            .outcome
            .take()
            .unwrap_or_else(|| Err("model initialization was interrupted".into()));
        let mut inner = self
            .cache
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match outcome {
            Ok((handle, report)) => {
                inner.state = State::Ready(handle);
                if report.is_some() {
                    inner.last_report = report;
                }
            }
            Err(message) => {
                inner.state = State::Absent;
                inner.last_failure = Some((self.attempt, message));
            }
        }
        drop(inner);
        self.cache.settled.notify_all();
    }
}

fn poisoned<T>(_: PoisonError<T>) -> RecognitionError {
    RecognitionError::ModelUnavailable("model cache lock poisoned".into())
}
