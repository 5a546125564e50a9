//! # Stand-in Learner
//!
//! A placeholder used by the stand-in model set for demos and tests. It always
//! decides [`Outcome::POSITIVE`] and reports a positive-class probability in a
//! narrow band around 0.8 so display code never sees a degenerate constant.
//! The band is a usability affordance with no statistical meaning.
//!
//! Each instance owns a seeded RNG: two instances built from the same seed
//! produce the same sequence, while learners with different seeds draw
//! independently.

use crate::learner::{InferenceError, Outcome, ProbabilisticClassifier, check_width};
use ndarray::{Array1, ArrayView1, array};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::{Mutex, PoisonError};

/// Negative-class mass is drawn uniformly from this range.
pub const NEGATIVE_MASS_BAND: Range<f64> = 0.1..0.3;

/// The persisted description of a stand-in learner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandInParams {
    pub seed: u64,
    pub n_features: usize,
}

#[derive(Debug)]
pub struct StandInLearner {
    params: StandInParams,
    rng: Mutex<StdRng>,
}

const STAND_IN_CLASSES: [Outcome; 2] = [Outcome::NotFullyBeneficial, Outcome::FullyBeneficial];

impl StandInLearner {
    pub const NAME: &'static str = "stand-in";

    pub fn new(params: StandInParams) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(params.seed)),
            params,
        }
    }
}

impl ProbabilisticClassifier for StandInLearner {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn classes(&self) -> &[Outcome] {
        &STAND_IN_CLASSES
    }

    fn n_features(&self) -> usize {
        self.params.n_features
    }

    fn predict_proba(&self, x: ArrayView1<f64>) -> Result<Array1<f64>, InferenceError> {
        check_width(Self::NAME, self.params.n_features, x)?;
        // A panic elsewhere cannot leave the generator in a torn state.
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let negative = rng.gen_range(NEGATIVE_MASS_BAND);
        Ok(array![negative, 1.0 - negative])
    }

    fn predict(&self, x: ArrayView1<f64>) -> Result<Outcome, InferenceError> {
        check_width(Self::NAME, self.params.n_features, x)?;
        Ok(Outcome::POSITIVE)
    }
}
