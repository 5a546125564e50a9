//! # Stacked Inference
//!
//! The single entry point used by presentation code: a complete feature mapping
//! and an acquired [`ModelSet`] go in, a final label and probability come out.
//!
//! 1. The preprocessor builds the three per-group vectors.
//! 2. Each base learner scores its own vector.
//! 3. The base probabilities form the meta-feature vector, always in the order
//!    continuous, discrete, binary.
//! 4. The meta learner decides the label and reports its positive-class probability.
//!
//! Recording the result in the prediction history is a separate step; a storage
//! failure never takes the prediction away from the caller.

use crate::history::{HistoryStore, NewRecord, RecordId, StorageError};
use crate::learner::{InferenceError, Outcome, ProbabilisticClassifier};
use crate::preprocess::{FeatureVectors, MissingFeatureError, prepare};
use crate::provision::{ModelSet, ModelVariant};
use crate::schema::{FeatureGroup, FeatureMapping, FeatureValueError, check_values};
use ndarray::{Array1, array};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PredictError {
    #[error(transparent)]
    MissingFeature(#[from] MissingFeatureError),
    #[error(transparent)]
    InvalidFeature(#[from] FeatureValueError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
}

/// Positive-class probabilities of the three base learners.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BaseProbabilities {
    pub continuous: f64,
    pub discrete: f64,
    pub binary: f64,
}

impl BaseProbabilities {
    pub fn get(&self, group: FeatureGroup) -> f64 {
        match group {
            FeatureGroup::Continuous => self.continuous,
            FeatureGroup::Discrete => self.discrete,
            FeatureGroup::Binary => self.binary,
        }
    }

    /// The meta-feature vector in canonical group order.
    pub fn meta_features(&self) -> Array1<f64> {
        array![self.continuous, self.discrete, self.binary]
    }
}

/// The outcome of one stacked prediction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub label: Outcome,
    /// The meta learner's probability of [`Outcome::POSITIVE`], whatever the label.
    pub probability: f64,
    pub base: BaseProbabilities,
    pub variant: ModelVariant,
}

impl Prediction {
    /// Probability of the label being displayed: inverted for a negative label.
    pub fn displayed_probability(&self) -> f64 {
        if self.label.is_positive() {
            self.probability
        } else {
            1.0 - self.probability
        }
    }
}

/// Scores each feature group with its base learner.
pub fn score_base_layer(
    vectors: &FeatureVectors,
    models: &ModelSet,
) -> Result<BaseProbabilities, InferenceError> {
    let score = |group: FeatureGroup| {
        models
            .base_learner(group)
            .positive_probability(vectors.group(group))
    };
    Ok(BaseProbabilities {
        continuous: score(FeatureGroup::Continuous)?,
        discrete: score(FeatureGroup::Discrete)?,
        binary: score(FeatureGroup::Binary)?,
    })
}

/// Runs the meta learner over `[p_continuous, p_discrete, p_binary]`.
///
/// Returns the meta learner's label and, independently, its probability of the
/// positive outcome.
pub fn combine(
    meta: &dyn ProbabilisticClassifier,
    p_continuous: f64,
    p_discrete: f64,
    p_binary: f64,
) -> Result<(Outcome, f64), InferenceError> {
    let meta_features = BaseProbabilities {
        continuous: p_continuous,
        discrete: p_discrete,
        binary: p_binary,
    }
    .meta_features();
    let label = meta.predict(meta_features.view())?;
    let probability = meta.positive_probability(meta_features.view())?;
    Ok((label, probability))
}

/// Predicts the outcome for one patient.
///
/// A missing feature is reported before any domain violation, and nothing is
/// scored unless the whole mapping is valid.
pub fn predict(mapping: &FeatureMapping, models: &ModelSet) -> Result<Prediction, PredictError> {
    let vectors = prepare(mapping, models.scaling())?;
    check_values(mapping)?;

    let base = score_base_layer(&vectors, models)?;
    let (label, probability) = combine(
        models.meta().as_ref(),
        base.continuous,
        base.discrete,
        base.binary,
    )?;
    log::debug!(
        "{} base probabilities: continuous={:.4}, discrete={:.4}, binary={:.4}; meta={:.4} ({})",
        models.variant(),
        base.continuous,
        base.discrete,
        base.binary,
        probability,
        label.code()
    );

    Ok(Prediction {
        label,
        probability,
        base,
        variant: models.variant(),
    })
}

/// A delivered prediction together with the outcome of logging it.
#[derive(Debug)]
pub struct RecordedPrediction {
    pub prediction: Prediction,
    pub record: Result<RecordId, StorageError>,
}

/// Predicts, then appends the result to `history`.
///
/// A failed prediction appends nothing. A failed append is logged as a warning
/// and returned alongside the prediction instead of replacing it.
pub fn predict_and_record(
    mapping: &FeatureMapping,
    models: &ModelSet,
    history: &dyn HistoryStore,
    patient_id: &str,
    username: &str,
) -> Result<RecordedPrediction, PredictError> {
    let prediction = predict(mapping, models)?;
    let record = history.append(NewRecord {
        patient_id,
        username,
        features: mapping,
        label: prediction.label,
        probability: prediction.probability,
        variant: prediction.variant,
    });
    if let Err(e) = &record {
        log::warn!("Prediction for patient '{patient_id}' was not saved to history: {e}");
    }
    Ok(RecordedPrediction { prediction, record })
}
