//! # Model Provisioning
//!
//! Supplies a matched [`ModelSet`] (three base learners, the meta learner and the
//! continuous scaling parameters) for the requested [`ModelVariant`].
//!
//! Each variant lives in one human-readable TOML artifact,
//! `<model_dir>/<variant>.toml`. When the artifact is absent it is synthesized
//! and published atomically (temporary file in the same directory, then rename),
//! so readers only ever see a complete artifact. A corrupt or incompatible
//! artifact is reported and left in place; it is never silently re-synthesized.
//!
//! [`ModelProvider`] is the explicit cache handle: at most one initialization
//! runs per variant, and later calls return the same `Arc<ModelSet>`.

use crate::learner::{FitError, Outcome, ProbabilisticClassifier};
use crate::meta::{LogisticMeta, META_FEATURES};
use crate::naive_bayes::{BernoulliNb, GaussianNb, MultinomialNb};
use crate::preprocess::{ScalingError, ScalingParameters};
use crate::schema::{FeatureGroup, SchemaFingerprint};
use crate::stand_in::{StandInLearner, StandInParams};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

/// Environment variable overriding the default model directory.
pub const MODEL_DIR_ENV: &str = "RLT_MODEL_DIR";
pub const DEFAULT_MODEL_DIR: &str = "models";

/// Seeds of the stand-in learners, in the order continuous, discrete, binary, meta.
pub const STAND_IN_SEEDS: [u64; 4] = [42, 43, 44, 45];

const DEFAULT_PLACEHOLDER_SEED: u64 = 2024;
const DEFAULT_PLACEHOLDER_SAMPLES: usize = 100;
/// Discrete placeholder counts are drawn from `0..DISCRETE_PLACEHOLDER_MAX`.
const DISCRETE_PLACEHOLDER_MAX: u32 = 5;

/// Which parameter bundle to use. Never mixed within one prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelVariant {
    /// Deterministic placeholder: always positive, probability near 0.8.
    StandIn,
    /// Fitted naive Bayes base layer and logistic meta learner.
    Trained,
}

impl ModelVariant {
    pub const ALL: [ModelVariant; 2] = [ModelVariant::StandIn, ModelVariant::Trained];

    /// Stable identifier used for artifact names and history records.
    pub fn as_str(self) -> &'static str {
        match self {
            ModelVariant::StandIn => "stand-in",
            ModelVariant::Trained => "trained",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        ModelVariant::ALL
            .into_iter()
            .find(|variant| variant.as_str() == name)
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum ProvisioningError {
    #[error("Failed to access model artifact '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Model artifact '{path}' is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Failed to serialize model artifact: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Model artifact '{path}' is incompatible with this build: {reason}")]
    Incompatible { path: PathBuf, reason: String },
    #[error("Failed to fit the {variant} model set: {source}")]
    Synthesis {
        variant: ModelVariant,
        #[source]
        source: FitError,
    },
    #[error("Failed to fit placeholder scaling parameters: {0}")]
    Scaling(#[from] ScalingError),
}

// ========================================================================================
//                                  Configuration
// ========================================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningConfig {
    /// Directory holding one artifact per variant.
    pub model_dir: PathBuf,
    /// Seed of the placeholder data used to synthesize the trained variant.
    pub placeholder_seed: u64,
    pub placeholder_samples: usize,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from(DEFAULT_MODEL_DIR),
            placeholder_seed: DEFAULT_PLACEHOLDER_SEED,
            placeholder_samples: DEFAULT_PLACEHOLDER_SAMPLES,
        }
    }
}

impl ProvisioningConfig {
    pub fn with_model_dir(model_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_dir: model_dir.into(),
            ..Self::default()
        }
    }

    /// Defaults, with the model directory taken from `RLT_MODEL_DIR` when set.
    pub fn from_env() -> Self {
        match std::env::var(MODEL_DIR_ENV) {
            Ok(dir) if !dir.trim().is_empty() => Self::with_model_dir(dir),
            _ => Self::default(),
        }
    }

    pub fn artifact_path(&self, variant: ModelVariant) -> PathBuf {
        self.model_dir.join(format!("{}.toml", variant.as_str()))
    }
}

// ========================================================================================
//                                  Model set
// ========================================================================================

/// A loaded, validated, read-only bundle of parameters for one variant.
#[derive(Debug)]
pub struct ModelSet {
    variant: ModelVariant,
    scaling: ScalingParameters,
    continuous: Arc<dyn ProbabilisticClassifier>,
    discrete: Arc<dyn ProbabilisticClassifier>,
    binary: Arc<dyn ProbabilisticClassifier>,
    meta: Arc<dyn ProbabilisticClassifier>,
}

impl ModelSet {
    /// Assembles a model set, checking every learner against the schema widths.
    pub fn new(
        variant: ModelVariant,
        scaling: ScalingParameters,
        continuous: Arc<dyn ProbabilisticClassifier>,
        discrete: Arc<dyn ProbabilisticClassifier>,
        binary: Arc<dyn ProbabilisticClassifier>,
        meta: Arc<dyn ProbabilisticClassifier>,
    ) -> Result<Self, String> {
        let checks = [
            ("continuous", &continuous, FeatureGroup::Continuous.width()),
            ("discrete", &discrete, FeatureGroup::Discrete.width()),
            ("binary", &binary, FeatureGroup::Binary.width()),
            ("meta", &meta, META_FEATURES),
        ];
        for (role, learner, expected) in checks {
            if learner.n_features() != expected {
                return Err(format!(
                    "{role} learner ({}) expects {} features, schema requires {expected}",
                    learner.name(),
                    learner.n_features()
                ));
            }
            if !learner.classes().contains(&Outcome::POSITIVE) {
                return Err(format!(
                    "{role} learner ({}) has no {} class",
                    learner.name(),
                    Outcome::POSITIVE.code()
                ));
            }
        }
        Ok(Self {
            variant,
            scaling,
            continuous,
            discrete,
            binary,
            meta,
        })
    }

    pub fn variant(&self) -> ModelVariant {
        self.variant
    }

    pub fn scaling(&self) -> &ScalingParameters {
        &self.scaling
    }

    pub fn base_learner(&self, group: FeatureGroup) -> &Arc<dyn ProbabilisticClassifier> {
        match group {
            FeatureGroup::Continuous => &self.continuous,
            FeatureGroup::Discrete => &self.discrete,
            FeatureGroup::Binary => &self.binary,
        }
    }

    pub fn meta(&self) -> &Arc<dyn ProbabilisticClassifier> {
        &self.meta
    }
}

// ========================================================================================
//                                  Artifact format
// ========================================================================================

/// Serialized parameters of one learner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearnerArtifact {
    StandIn(StandInParams),
    GaussianNb(GaussianNb),
    MultinomialNb(MultinomialNb),
    BernoulliNb(BernoulliNb),
    Logistic(LogisticMeta),
}

impl LearnerArtifact {
    fn into_learner(self) -> Arc<dyn ProbabilisticClassifier> {
        match self {
            LearnerArtifact::StandIn(params) => Arc::new(StandInLearner::new(params)),
            LearnerArtifact::GaussianNb(model) => Arc::new(model),
            LearnerArtifact::MultinomialNb(model) => Arc::new(model),
            LearnerArtifact::BernoulliNb(model) => Arc::new(model),
            LearnerArtifact::Logistic(model) => Arc::new(model),
        }
    }

    /// Checks fitted parameters for internal consistency. Stand-in learners carry
    /// only a seed and a width, which [`ModelSet::new`] checks.
    fn validate(&self) -> Result<(), String> {
        match self {
            LearnerArtifact::StandIn(_) => Ok(()),
            LearnerArtifact::GaussianNb(model) => model.validate(),
            LearnerArtifact::MultinomialNb(model) => model.validate(),
            LearnerArtifact::BernoulliNb(model) => model.validate(),
            LearnerArtifact::Logistic(model) => model.validate(),
        }
    }

    fn is_stand_in(&self) -> bool {
        matches!(self, LearnerArtifact::StandIn(_))
    }
}

/// The on-disk form of a [`ModelSet`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSetArtifact {
    pub variant: ModelVariant,
    pub schema: SchemaFingerprint,
    pub scaling: ScalingParameters,
    pub continuous: LearnerArtifact,
    pub discrete: LearnerArtifact,
    pub binary: LearnerArtifact,
    pub meta: LearnerArtifact,
}

impl ModelSetArtifact {
    /// Stand-in parameters: seeded placeholder learners and identity scaling.
    pub fn stand_in() -> Self {
        let [continuous, discrete, binary, meta] = STAND_IN_SEEDS;
        let stand_in = |seed: u64, n_features: usize| {
            LearnerArtifact::StandIn(StandInParams { seed, n_features })
        };
        Self {
            variant: ModelVariant::StandIn,
            schema: SchemaFingerprint::current(),
            scaling: ScalingParameters::identity(),
            continuous: stand_in(continuous, FeatureGroup::Continuous.width()),
            discrete: stand_in(discrete, FeatureGroup::Discrete.width()),
            binary: stand_in(binary, FeatureGroup::Binary.width()),
            meta: stand_in(meta, META_FEATURES),
        }
    }

    /// Fits every learner from seeded placeholder data. The result is only
    /// shape-compatible with real inputs; it carries no clinical signal.
    pub fn trained(config: &ProvisioningConfig) -> Result<Self, ProvisioningError> {
        let n = config.placeholder_samples;
        let mut rng = StdRng::seed_from_u64(config.placeholder_seed);
        let synthesis = |source: FitError| ProvisioningError::Synthesis {
            variant: ModelVariant::Trained,
            source,
        };

        let x_continuous = Array2::from_shape_fn((n, FeatureGroup::Continuous.width()), |_| {
            rng.gen_range(0.0..1.0)
        });
        let y_continuous = placeholder_labels(&mut rng, n);
        let x_discrete = Array2::from_shape_fn((n, FeatureGroup::Discrete.width()), |_| {
            f64::from(rng.gen_range(0..DISCRETE_PLACEHOLDER_MAX))
        });
        let y_discrete = placeholder_labels(&mut rng, n);
        let x_binary = Array2::from_shape_fn((n, FeatureGroup::Binary.width()), |_| {
            if rng.gen_bool(0.5) { 1.0 } else { 0.0 }
        });
        let y_binary = placeholder_labels(&mut rng, n);
        let x_meta = Array2::from_shape_fn((n, META_FEATURES), |_| rng.gen_range(0.0..1.0));
        let y_meta = placeholder_labels(&mut rng, n);

        // The Gaussian learner sees standardized inputs at prediction time, so it
        // is fitted on the same standardized placeholder data.
        let scaling = ScalingParameters::fit(x_continuous.view())?;
        let standardized = (&x_continuous - &scaling.mean()) / &scaling.scale();

        let continuous = GaussianNb::fit(standardized.view(), &y_continuous).map_err(synthesis)?;
        let discrete = MultinomialNb::fit(x_discrete.view(), &y_discrete).map_err(synthesis)?;
        let binary = BernoulliNb::fit(x_binary.view(), &y_binary).map_err(synthesis)?;
        let meta = LogisticMeta::fit(x_meta.view(), &y_meta).map_err(synthesis)?;

        Ok(Self {
            variant: ModelVariant::Trained,
            schema: SchemaFingerprint::current(),
            scaling,
            continuous: LearnerArtifact::GaussianNb(continuous),
            discrete: LearnerArtifact::MultinomialNb(discrete),
            binary: LearnerArtifact::BernoulliNb(binary),
            meta: LearnerArtifact::Logistic(meta),
        })
    }

    pub fn synthesize(
        variant: ModelVariant,
        config: &ProvisioningConfig,
    ) -> Result<Self, ProvisioningError> {
        match variant {
            ModelVariant::StandIn => Ok(Self::stand_in()),
            ModelVariant::Trained => Self::trained(config),
        }
    }

    /// Writes the artifact atomically: a sibling temporary file is fully written
    /// and flushed before being renamed over `path`.
    pub fn publish(&self, path: &Path) -> Result<(), ProvisioningError> {
        let io_error = |source| ProvisioningError::Io {
            path: path.to_path_buf(),
            source,
        };
        let toml_string = toml::to_string_pretty(self)?;
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).map_err(io_error)?;

        let mut staged = tempfile::Builder::new()
            .prefix(".staged-")
            .suffix(".toml")
            .tempfile_in(dir)
            .map_err(io_error)?;
        staged.write_all(toml_string.as_bytes()).map_err(io_error)?;
        staged.as_file().sync_all().map_err(io_error)?;
        staged.persist(path).map_err(|e| io_error(e.error))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ProvisioningError> {
        let toml_string = fs::read_to_string(path).map_err(|source| ProvisioningError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&toml_string).map_err(|source| ProvisioningError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Validates the artifact against the requested variant and the current
    /// schema, then builds the runtime model set.
    pub fn into_model_set(
        self,
        expected: ModelVariant,
        path: &Path,
    ) -> Result<ModelSet, ProvisioningError> {
        let incompatible = |reason: String| ProvisioningError::Incompatible {
            path: path.to_path_buf(),
            reason,
        };
        if self.variant != expected {
            return Err(incompatible(format!(
                "artifact holds the {} variant, {} was requested",
                self.variant, expected
            )));
        }
        if !self.schema.is_current() {
            return Err(incompatible(
                "artifact was built for a different feature schema".to_string(),
            ));
        }
        let stand_in_parts = [&self.continuous, &self.discrete, &self.binary, &self.meta]
            .iter()
            .filter(|artifact| artifact.is_stand_in())
            .count();
        let consistent = match expected {
            ModelVariant::StandIn => stand_in_parts == 4,
            ModelVariant::Trained => stand_in_parts == 0,
        };
        if !consistent {
            return Err(incompatible(format!(
                "{expected} artifact mixes stand-in and fitted learners"
            )));
        }

        let parts = [
            ("continuous", &self.continuous),
            ("discrete", &self.discrete),
            ("binary", &self.binary),
            ("meta", &self.meta),
        ];
        for (role, artifact) in parts {
            artifact
                .validate()
                .map_err(|reason| incompatible(format!("{role} learner: {reason}")))?;
        }

        ModelSet::new(
            self.variant,
            self.scaling,
            self.continuous.into_learner(),
            self.discrete.into_learner(),
            self.binary.into_learner(),
            self.meta.into_learner(),
        )
        .map_err(incompatible)
    }
}

fn placeholder_labels(rng: &mut StdRng, n: usize) -> Vec<Outcome> {
    (0..n)
        .map(|_| {
            if rng.gen_bool(0.5) {
                Outcome::FullyBeneficial
            } else {
                Outcome::NotFullyBeneficial
            }
        })
        .collect()
}

// ========================================================================================
//                                  Provider
// ========================================================================================

/// Lazily provisions and caches one [`ModelSet`] per variant.
#[derive(Debug)]
pub struct ModelProvider {
    config: ProvisioningConfig,
    stand_in: Mutex<Option<Arc<ModelSet>>>,
    trained: Mutex<Option<Arc<ModelSet>>>,
}

impl ModelProvider {
    pub fn new(config: ProvisioningConfig) -> Self {
        Self {
            config,
            stand_in: Mutex::new(None),
            trained: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ProvisioningConfig {
        &self.config
    }

    /// Returns the model set for `variant`, loading or synthesizing it on first use.
    ///
    /// The slot lock is held across the load so concurrent first calls run a
    /// single initialization.
    pub fn acquire(&self, variant: ModelVariant) -> Result<Arc<ModelSet>, ProvisioningError> {
        let slot = match variant {
            ModelVariant::StandIn => &self.stand_in,
            ModelVariant::Trained => &self.trained,
        };
        let mut cached = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(models) = cached.as_ref() {
            return Ok(Arc::clone(models));
        }

        let models = Arc::new(self.provision(variant)?);
        *cached = Some(Arc::clone(&models));
        Ok(models)
    }

    fn provision(&self, variant: ModelVariant) -> Result<ModelSet, ProvisioningError> {
        let path = self.config.artifact_path(variant);
        if !path.exists() {
            log::info!(
                "No {variant} model artifact at {}; synthesizing one",
                path.display()
            );
            ModelSetArtifact::synthesize(variant, &self.config)?.publish(&path)?;
        }

        log::info!("Loading {variant} model set from {}", path.display());
        let models = ModelSetArtifact::load(&path)?.into_model_set(variant, &path)?;
        log::debug!(
            "Loaded {variant} model set: {} / {} / {} / {}",
            models.continuous.name(),
            models.discrete.name(),
            models.binary.name(),
            models.meta.name()
        );
        Ok(models)
    }
}
