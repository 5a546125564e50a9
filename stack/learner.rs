//! # Learner Capability
//!
//! Every classifier in the ensemble, base or meta, is used through one capability:
//! given a feature vector, return class probabilities. Learners own their class
//! ordering, so callers always select the positive mass by label via
//! [`ProbabilisticClassifier::positive_probability`] instead of by column index.

use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The two outcomes of the ensemble.
///
/// The derived ordering sorts `FBTP` before `NFBTP`, matching the order in
/// which fitted learners store their classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Outcome {
    /// Fully-beneficial therapy patient.
    #[serde(rename = "FBTP")]
    FullyBeneficial,
    /// Not-fully-beneficial therapy patient.
    #[serde(rename = "NFBTP")]
    NotFullyBeneficial,
}

impl Outcome {
    pub const POSITIVE: Outcome = Outcome::FullyBeneficial;
    pub const NEGATIVE: Outcome = Outcome::NotFullyBeneficial;

    pub fn label(self) -> &'static str {
        match self {
            Outcome::FullyBeneficial => "fully-beneficial",
            Outcome::NotFullyBeneficial => "not-fully-beneficial",
        }
    }

    /// Short code used in artifacts and history files.
    pub fn code(self) -> &'static str {
        match self {
            Outcome::FullyBeneficial => "FBTP",
            Outcome::NotFullyBeneficial => "NFBTP",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "FBTP" => Some(Outcome::FullyBeneficial),
            "NFBTP" => Some(Outcome::NotFullyBeneficial),
            _ => None,
        }
    }

    pub fn is_positive(self) -> bool {
        self == Outcome::POSITIVE
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Shape or fitting problems inside a learner. These point at a provisioning or
/// schema defect rather than at user input.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InferenceError {
    #[error("{learner} expects {expected} features but received {found}")]
    FeatureCountMismatch {
        learner: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("{learner} has not been fitted")]
    NotFitted { learner: &'static str },
    #[error("{learner} has no probability mass for class {class}")]
    MissingClass {
        learner: &'static str,
        class: Outcome,
    },
    #[error("{learner} received an invalid value {value} at position {position}: {reason}")]
    InvalidInput {
        learner: &'static str,
        position: usize,
        value: f64,
        reason: &'static str,
    },
    #[error("{learner} assigns no finite likelihood to either class; an input value is too extreme to score")]
    DegenerateLikelihood { learner: &'static str },
    #[error("{learner} produced the invalid probability {value} for class {class}")]
    InvalidProbability {
        learner: &'static str,
        class: Outcome,
        value: f64,
    },
}

/// Failures while fitting a learner on placeholder data.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    #[error("Training data is empty")]
    Empty,
    #[error("Training matrix has {rows} rows but {labels} labels were supplied")]
    LabelCountMismatch { rows: usize, labels: usize },
    #[error("Training labels must contain both outcomes, found only {0}")]
    SingleClass(Outcome),
    #[error("{learner} cannot be fitted on the negative value {value}")]
    NegativeValue { learner: &'static str, value: f64 },
    #[error("Optimization failed for {learner}: {reason}")]
    Optimizer {
        learner: &'static str,
        reason: String,
    },
}

/// Validates a training set and returns its classes in sorted label order.
pub(crate) fn sorted_classes(rows: usize, labels: &[Outcome]) -> Result<Vec<Outcome>, FitError> {
    if rows == 0 {
        return Err(FitError::Empty);
    }
    if rows != labels.len() {
        return Err(FitError::LabelCountMismatch {
            rows,
            labels: labels.len(),
        });
    }
    let mut classes = labels.to_vec();
    classes.sort();
    classes.dedup();
    if classes.len() == 1 {
        return Err(FitError::SingleClass(classes[0]));
    }
    Ok(classes)
}

/// Checks that a deserialized class list names both outcomes exactly once.
pub(crate) fn check_outcome_pair(learner: &'static str, classes: &[Outcome]) -> Result<(), String> {
    if classes.len() != 2 || classes[0] == classes[1] {
        let codes: Vec<&str> = classes.iter().map(|class| class.code()).collect();
        return Err(format!(
            "{learner} must list both outcomes exactly once, found {codes:?}"
        ));
    }
    Ok(())
}

/// Row indices of `labels` equal to `class`.
pub(crate) fn rows_of(labels: &[Outcome], class: Outcome) -> Vec<usize> {
    labels
        .iter()
        .enumerate()
        .filter(|(_, label)| **label == class)
        .map(|(i, _)| i)
        .collect()
}

/// A fitted (or configured) classifier producing class probabilities.
pub trait ProbabilisticClassifier: fmt::Debug + Send + Sync {
    /// Human-readable learner kind, used in errors and logs.
    fn name(&self) -> &'static str;

    /// Classes in the column order of [`predict_proba`](Self::predict_proba).
    fn classes(&self) -> &[Outcome];

    /// Number of features the learner was fitted or configured for.
    fn n_features(&self) -> usize;

    /// Probabilities aligned with [`classes`](Self::classes).
    fn predict_proba(&self, x: ArrayView1<f64>) -> Result<Array1<f64>, InferenceError>;

    /// The most probable class.
    fn predict(&self, x: ArrayView1<f64>) -> Result<Outcome, InferenceError> {
        let proba = self.predict_proba(x)?;
        let classes = self.classes();
        proba
            .iter()
            .zip(classes)
            .fold(None, |best: Option<(f64, Outcome)>, (&p, &class)| match best {
                Some((best_p, _)) if best_p >= p => best,
                _ => Some((p, class)),
            })
            .map(|(_, class)| class)
            .ok_or(InferenceError::NotFitted {
                learner: self.name(),
            })
    }

    /// Probability mass assigned to [`Outcome::POSITIVE`], looked up by label.
    fn positive_probability(&self, x: ArrayView1<f64>) -> Result<f64, InferenceError> {
        let proba = self.predict_proba(x)?;
        let index = self
            .classes()
            .iter()
            .position(|class| class.is_positive())
            .ok_or(InferenceError::MissingClass {
                learner: self.name(),
                class: Outcome::POSITIVE,
            })?;
        let mass = proba.get(index).copied().ok_or(InferenceError::MissingClass {
            learner: self.name(),
            class: Outcome::POSITIVE,
        })?;
        if !(0.0..=1.0).contains(&mass) {
            return Err(InferenceError::InvalidProbability {
                learner: self.name(),
                class: Outcome::POSITIVE,
                value: mass,
            });
        }
        Ok(mass)
    }
}

/// Rejects vectors whose length differs from what the learner was fitted for.
pub(crate) fn check_width(
    learner: &'static str,
    expected: usize,
    x: ArrayView1<f64>,
) -> Result<(), InferenceError> {
    if x.len() != expected {
        return Err(InferenceError::FeatureCountMismatch {
            learner,
            expected,
            found: x.len(),
        });
    }
    Ok(())
}

/// Normalizes per-class joint log likelihoods into probabilities (log-sum-exp).
///
/// Fails when no class has a finite likelihood, which happens once an input is
/// large enough to overflow every class's density.
pub(crate) fn softmax_log(
    learner: &'static str,
    joint_log_likelihood: Array1<f64>,
) -> Result<Array1<f64>, InferenceError> {
    if joint_log_likelihood.iter().any(|v| v.is_nan()) {
        return Err(InferenceError::DegenerateLikelihood { learner });
    }
    let max = joint_log_likelihood
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return Err(InferenceError::DegenerateLikelihood { learner });
    }
    let shifted = joint_log_likelihood.mapv(|v| (v - max).exp());
    let total = shifted.sum();
    Ok(shifted / total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    /// A learner with fixed probabilities, for exercising the default methods.
    #[derive(Debug)]
    struct FixedLearner {
        classes: Vec<Outcome>,
        proba: Array1<f64>,
    }

    impl ProbabilisticClassifier for FixedLearner {
        fn name(&self) -> &'static str {
            "fixed"
        }
        fn classes(&self) -> &[Outcome] {
            &self.classes
        }
        fn n_features(&self) -> usize {
            1
        }
        fn predict_proba(&self, x: ArrayView1<f64>) -> Result<Array1<f64>, InferenceError> {
            check_width(self.name(), 1, x)?;
            Ok(self.proba.clone())
        }
    }

    #[test]
    fn test_positive_probability_follows_labels_not_positions() {
        let forward = FixedLearner {
            classes: vec![Outcome::FullyBeneficial, Outcome::NotFullyBeneficial],
            proba: array![0.9, 0.1],
        };
        let reversed = FixedLearner {
            classes: vec![Outcome::NotFullyBeneficial, Outcome::FullyBeneficial],
            proba: array![0.1, 0.9],
        };
        let x = array![0.0];
        assert_abs_diff_eq!(forward.positive_probability(x.view()).unwrap(), 0.9);
        assert_abs_diff_eq!(reversed.positive_probability(x.view()).unwrap(), 0.9);
        assert_eq!(reversed.predict(x.view()).unwrap(), Outcome::FullyBeneficial);
    }

    #[test]
    fn test_missing_positive_class_is_an_error() {
        let learner = FixedLearner {
            classes: vec![Outcome::NotFullyBeneficial],
            proba: array![1.0],
        };
        assert!(matches!(
            learner.positive_probability(array![0.0].view()),
            Err(InferenceError::MissingClass { .. })
        ));
    }

    #[test]
    fn test_width_mismatch() {
        let learner = FixedLearner {
            classes: vec![Outcome::FullyBeneficial, Outcome::NotFullyBeneficial],
            proba: array![0.5, 0.5],
        };
        assert_eq!(
            learner.predict_proba(array![0.0, 1.0].view()),
            Err(InferenceError::FeatureCountMismatch {
                learner: "fixed",
                expected: 1,
                found: 2
            })
        );
    }

    #[test]
    fn test_softmax_is_stable_for_large_magnitudes() {
        let p = softmax_log("test", array![-1000.0, -1001.0]).unwrap();
        assert_abs_diff_eq!(p.sum(), 1.0, epsilon = 1e-12);
        assert!(p[0] > p[1]);

        let one_sided = softmax_log("test", array![-5.0, f64::NEG_INFINITY]).unwrap();
        assert_eq!(one_sided, array![1.0, 0.0]);
    }

    #[test]
    fn test_softmax_without_a_finite_class_is_an_error() {
        for jll in [
            array![f64::NEG_INFINITY, f64::NEG_INFINITY],
            array![f64::INFINITY, 0.0],
            array![f64::NAN, -1.0],
        ] {
            assert_eq!(
                softmax_log("test", jll),
                Err(InferenceError::DegenerateLikelihood { learner: "test" })
            );
        }
    }

    #[test]
    fn test_non_finite_positive_mass_is_rejected() {
        let learner = FixedLearner {
            classes: vec![Outcome::FullyBeneficial, Outcome::NotFullyBeneficial],
            proba: array![f64::NAN, f64::NAN],
        };
        assert!(matches!(
            learner.positive_probability(array![0.0].view()),
            Err(InferenceError::InvalidProbability { .. })
        ));
    }

    #[test]
    fn test_outcome_pair_must_be_distinct() {
        assert!(check_outcome_pair("test", &[Outcome::POSITIVE, Outcome::NEGATIVE]).is_ok());
        assert!(check_outcome_pair("test", &[Outcome::NEGATIVE, Outcome::POSITIVE]).is_ok());
        assert!(check_outcome_pair("test", &[Outcome::POSITIVE, Outcome::POSITIVE]).is_err());
        assert!(check_outcome_pair("test", &[Outcome::POSITIVE]).is_err());
    }

    #[test]
    fn test_outcome_codes() {
        assert_eq!(Outcome::from_code("FBTP"), Some(Outcome::POSITIVE));
        assert_eq!(Outcome::from_code("NFBTP"), Some(Outcome::NEGATIVE));
        assert_eq!(Outcome::from_code("maybe"), None);
        assert_eq!(Outcome::NEGATIVE.to_string(), "not-fully-beneficial");
    }
}
