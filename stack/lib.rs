#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

pub mod history;
pub mod learner;
pub mod meta;
pub mod naive_bayes;
pub mod predict;
pub mod preprocess;
pub mod provision;
pub mod schema;
pub mod stand_in;

pub use history::{
    HistoryStore, InMemoryHistory, NewRecord, PredictionRecord, RecordId, RecordSummary,
    StorageError, TsvHistory,
};
pub use learner::{InferenceError, Outcome, ProbabilisticClassifier};
pub use predict::{
    BaseProbabilities, PredictError, Prediction, RecordedPrediction, combine, predict,
    predict_and_record,
};
pub use preprocess::{FeatureVectors, MissingFeatureError, ScalingParameters, prepare};
pub use provision::{ModelProvider, ModelSet, ModelVariant, ProvisioningConfig, ProvisioningError};
pub use schema::{FeatureGroup, FeatureMapping};
