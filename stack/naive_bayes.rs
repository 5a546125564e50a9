//! # Naive Bayes Base Learners
//!
//! One naive Bayes family per feature group:
//!
//! - [`GaussianNb`] for the standardized continuous measurements,
//! - [`MultinomialNb`] for lesion counts and ordinal scores,
//! - [`BernoulliNb`] for presence/absence findings.
//!
//! All three store their classes in sorted label order and serialize to the TOML
//! model artifact as plain parameter tables. Fitting is closed-form.

use crate::learner::{
    FitError, InferenceError, Outcome, ProbabilisticClassifier, check_outcome_pair, check_width,
    rows_of, softmax_log, sorted_classes,
};
use itertools::izip;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Portion of the largest feature variance added to every variance for stability.
pub const VAR_SMOOTHING: f64 = 1e-9;
/// Additive (Laplace) smoothing for the count-based learners.
pub const DEFAULT_ALPHA: f64 = 1.0;

fn log_priors(labels: &[Outcome], classes: &[Outcome]) -> Array1<f64> {
    let n = labels.len() as f64;
    classes
        .iter()
        .map(|&class| (rows_of(labels, class).len() as f64 / n).ln())
        .collect()
}

fn ensure_fitted(
    learner: &'static str,
    classes: &[Outcome],
    class_log_prior: &Array1<f64>,
    per_class: &Array2<f64>,
) -> Result<(), InferenceError> {
    if classes.is_empty()
        || class_log_prior.len() != classes.len()
        || per_class.nrows() != classes.len()
    {
        return Err(InferenceError::NotFitted { learner });
    }
    Ok(())
}

/// Consistency checks for parameters read back from an artifact: both outcomes,
/// finite priors, and per-class tables of one common shape with finite entries.
fn validate_tables(
    learner: &'static str,
    classes: &[Outcome],
    class_log_prior: &Array1<f64>,
    tables: &[(&'static str, &Array2<f64>)],
) -> Result<(), String> {
    check_outcome_pair(learner, classes)?;
    if class_log_prior.len() != classes.len() {
        return Err(format!(
            "{learner} has {} class priors for {} classes",
            class_log_prior.len(),
            classes.len()
        ));
    }
    if class_log_prior.iter().any(|v| !v.is_finite()) {
        return Err(format!("{learner} has a non-finite class prior"));
    }
    let width = tables.first().map_or(0, |(_, table)| table.ncols());
    for (table_name, table) in tables {
        if table.dim() != (classes.len(), width) {
            return Err(format!(
                "{learner} {table_name} table has shape {:?}, expected [{}, {width}]",
                table.shape(),
                classes.len()
            ));
        }
        if table.iter().any(|v| !v.is_finite()) {
            return Err(format!("{learner} {table_name} table has non-finite entries"));
        }
    }
    Ok(())
}

fn ensure_non_negative(learner: &'static str, x: ArrayView1<f64>) -> Result<(), InferenceError> {
    match x.iter().position(|&v| !(v >= 0.0)) {
        Some(position) => Err(InferenceError::InvalidInput {
            learner,
            position,
            value: x[position],
            reason: "count features must be non-negative",
        }),
        None => Ok(()),
    }
}

// ========================================================================================
//                                   Gaussian
// ========================================================================================

/// Gaussian naive Bayes: one independent normal per (class, feature).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaussianNb {
    pub classes: Vec<Outcome>,
    pub var_smoothing: f64,
    pub class_log_prior: Array1<f64>,
    /// Per-class feature means, shape `[n_classes, n_features]`.
    pub theta: Array2<f64>,
    /// Per-class feature variances (already smoothed), shape `[n_classes, n_features]`.
    pub var: Array2<f64>,
}

impl GaussianNb {
    pub const NAME: &'static str = "Gaussian naive Bayes";

    pub fn fit(x: ArrayView2<f64>, labels: &[Outcome]) -> Result<Self, FitError> {
        let classes = sorted_classes(x.nrows(), labels)?;
        let max_variance = x
            .var_axis(Axis(0), 0.0)
            .iter()
            .copied()
            .fold(0.0, f64::max);
        let epsilon = (VAR_SMOOTHING * max_variance).max(f64::EPSILON);

        let n_features = x.ncols();
        let mut theta = Array2::zeros((classes.len(), n_features));
        let mut var = Array2::zeros((classes.len(), n_features));
        for (k, &class) in classes.iter().enumerate() {
            let rows = x.select(Axis(0), &rows_of(labels, class));
            let mean = rows
                .mean_axis(Axis(0))
                .unwrap_or_else(|| Array1::zeros(n_features));
            theta.row_mut(k).assign(&mean);
            var.row_mut(k)
                .assign(&(rows.var_axis(Axis(0), 0.0) + epsilon));
        }

        Ok(Self {
            class_log_prior: log_priors(labels, &classes),
            classes,
            var_smoothing: VAR_SMOOTHING,
            theta,
            var,
        })
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_tables(
            Self::NAME,
            &self.classes,
            &self.class_log_prior,
            &[("theta", &self.theta), ("var", &self.var)],
        )?;
        if self.var.iter().any(|&v| v <= 0.0) {
            return Err(format!("{} var table has non-positive variances", Self::NAME));
        }
        Ok(())
    }
}

impl ProbabilisticClassifier for GaussianNb {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn classes(&self) -> &[Outcome] {
        &self.classes
    }

    fn n_features(&self) -> usize {
        self.theta.ncols()
    }

    fn predict_proba(&self, x: ArrayView1<f64>) -> Result<Array1<f64>, InferenceError> {
        ensure_fitted(Self::NAME, &self.classes, &self.class_log_prior, &self.theta)?;
        check_width(Self::NAME, self.n_features(), x)?;

        let jll: Array1<f64> = izip!(
            self.class_log_prior.iter(),
            self.theta.rows(),
            self.var.rows()
        )
        .map(|(&log_prior, mean, variance)| {
            let log_density: f64 = izip!(x.iter(), mean.iter(), variance.iter())
                .map(|(&xj, &mj, &vj)| -0.5 * (2.0 * PI * vj).ln() - 0.5 * (xj - mj).powi(2) / vj)
                .sum();
            log_prior + log_density
        })
        .collect();

        softmax_log(Self::NAME, jll)
    }
}

// ========================================================================================
//                                   Multinomial
// ========================================================================================

/// Multinomial naive Bayes over non-negative counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultinomialNb {
    pub classes: Vec<Outcome>,
    pub alpha: f64,
    pub class_log_prior: Array1<f64>,
    /// Smoothed log probability of each feature given the class, `[n_classes, n_features]`.
    pub feature_log_prob: Array2<f64>,
}

impl MultinomialNb {
    pub const NAME: &'static str = "Multinomial naive Bayes";

    pub fn fit(x: ArrayView2<f64>, labels: &[Outcome]) -> Result<Self, FitError> {
        let classes = sorted_classes(x.nrows(), labels)?;
        if let Some(&value) = x.iter().find(|&&v| v < 0.0) {
            return Err(FitError::NegativeValue {
                learner: Self::NAME,
                value,
            });
        }

        let mut feature_log_prob = Array2::zeros((classes.len(), x.ncols()));
        for (k, &class) in classes.iter().enumerate() {
            let smoothed = x
                .select(Axis(0), &rows_of(labels, class))
                .sum_axis(Axis(0))
                + DEFAULT_ALPHA;
            let total = smoothed.sum();
            feature_log_prob
                .row_mut(k)
                .assign(&smoothed.mapv(|c| (c / total).ln()));
        }

        Ok(Self {
            class_log_prior: log_priors(labels, &classes),
            classes,
            alpha: DEFAULT_ALPHA,
            feature_log_prob,
        })
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_tables(
            Self::NAME,
            &self.classes,
            &self.class_log_prior,
            &[("feature_log_prob", &self.feature_log_prob)],
        )?;
        if self.feature_log_prob.iter().any(|&lp| lp > 0.0) {
            return Err(format!("{} has log probabilities above zero", Self::NAME));
        }
        Ok(())
    }
}

impl ProbabilisticClassifier for MultinomialNb {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn classes(&self) -> &[Outcome] {
        &self.classes
    }

    fn n_features(&self) -> usize {
        self.feature_log_prob.ncols()
    }

    fn predict_proba(&self, x: ArrayView1<f64>) -> Result<Array1<f64>, InferenceError> {
        ensure_fitted(
            Self::NAME,
            &self.classes,
            &self.class_log_prior,
            &self.feature_log_prob,
        )?;
        check_width(Self::NAME, self.n_features(), x)?;
        ensure_non_negative(Self::NAME, x)?;

        let jll = self.feature_log_prob.dot(&x) + &self.class_log_prior;
        softmax_log(Self::NAME, jll)
    }
}

// ========================================================================================
//                                   Bernoulli
// ========================================================================================

/// Bernoulli naive Bayes over binarized indicators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BernoulliNb {
    pub classes: Vec<Outcome>,
    pub alpha: f64,
    /// Values strictly above this threshold count as present.
    pub binarize: f64,
    pub class_log_prior: Array1<f64>,
    /// Log probability that each feature is present given the class, `[n_classes, n_features]`.
    pub feature_log_prob: Array2<f64>,
}

impl BernoulliNb {
    pub const NAME: &'static str = "Bernoulli naive Bayes";

    pub fn fit(x: ArrayView2<f64>, labels: &[Outcome]) -> Result<Self, FitError> {
        let classes = sorted_classes(x.nrows(), labels)?;
        let binarize = 0.0;
        let indicators = x.mapv(|v| if v > binarize { 1.0 } else { 0.0 });

        let mut feature_log_prob = Array2::zeros((classes.len(), x.ncols()));
        for (k, &class) in classes.iter().enumerate() {
            let rows = rows_of(labels, class);
            let denominator = rows.len() as f64 + 2.0 * DEFAULT_ALPHA;
            let present = indicators.select(Axis(0), &rows).sum_axis(Axis(0)) + DEFAULT_ALPHA;
            feature_log_prob
                .row_mut(k)
                .assign(&present.mapv(|c| (c / denominator).ln()));
        }

        Ok(Self {
            class_log_prior: log_priors(labels, &classes),
            classes,
            alpha: DEFAULT_ALPHA,
            binarize,
            feature_log_prob,
        })
    }

    /// Presence probabilities must lie strictly inside (0, 1) so that the
    /// absence term `ln(1 - p)` stays finite.
    pub fn validate(&self) -> Result<(), String> {
        validate_tables(
            Self::NAME,
            &self.classes,
            &self.class_log_prior,
            &[("feature_log_prob", &self.feature_log_prob)],
        )?;
        if self.feature_log_prob.iter().any(|&lp| lp >= 0.0) {
            return Err(format!(
                "{} has presence probabilities of one or more",
                Self::NAME
            ));
        }
        if !self.binarize.is_finite() {
            return Err(format!("{} has a non-finite binarize threshold", Self::NAME));
        }
        Ok(())
    }
}

impl ProbabilisticClassifier for BernoulliNb {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn classes(&self) -> &[Outcome] {
        &self.classes
    }

    fn n_features(&self) -> usize {
        self.feature_log_prob.ncols()
    }

    fn predict_proba(&self, x: ArrayView1<f64>) -> Result<Array1<f64>, InferenceError> {
        ensure_fitted(
            Self::NAME,
            &self.classes,
            &self.class_log_prior,
            &self.feature_log_prob,
        )?;
        check_width(Self::NAME, self.n_features(), x)?;

        let indicators = x.mapv(|v| if v > self.binarize { 1.0 } else { 0.0 });
        let absent_log_prob = self.feature_log_prob.mapv(|lp| (-lp.exp()).ln_1p());
        let jll = (&self.feature_log_prob - &absent_log_prob).dot(&indicators)
            + absent_log_prob.sum_axis(Axis(1))
            + &self.class_log_prior;
        softmax_log(Self::NAME, jll)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    const P: Outcome = Outcome::FullyBeneficial;
    const N: Outcome = Outcome::NotFullyBeneficial;

    #[test]
    fn test_gaussian_separates_well_spaced_classes() {
        let x = array![[-2.0, -1.9], [-2.1, -2.0], [-1.9, -2.1], [2.0, 2.1], [2.1, 1.9], [1.9, 2.0]];
        let labels = [N, N, N, P, P, P];
        let model = GaussianNb::fit(x.view(), &labels).unwrap();

        assert_eq!(model.classes, vec![P, N]);
        assert_abs_diff_eq!(model.theta[[0, 0]], 2.0, epsilon = 1e-12);
        assert!(model.positive_probability(array![2.0, 2.0].view()).unwrap() > 0.99);
        assert!(model.positive_probability(array![-2.0, -2.0].view()).unwrap() < 0.01);
        let proba = model.predict_proba(array![0.3, -0.1].view()).unwrap();
        assert_abs_diff_eq!(proba.sum(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_gaussian_rejects_wrong_width() {
        let x = array![[0.0], [1.0]];
        let model = GaussianNb::fit(x.view(), &[N, P]).unwrap();
        assert!(matches!(
            model.predict_proba(array![0.0, 1.0].view()),
            Err(InferenceError::FeatureCountMismatch {
                expected: 1,
                found: 2,
                ..
            })
        ));
    }

    #[test]
    fn test_multinomial_matches_hand_computed_likelihoods() {
        // Class P counts: [3, 1]; class N counts: [1, 3]. With alpha=1:
        // P: [4/6, 2/6], N: [2/6, 4/6]. Equal priors.
        let x = array![[3.0, 1.0], [1.0, 3.0]];
        let model = MultinomialNb::fit(x.view(), &[P, N]).unwrap();
        assert_abs_diff_eq!(model.feature_log_prob[[0, 0]], (4.0f64 / 6.0).ln(), epsilon = 1e-12);

        // Input [1, 0]: P has 4/6, N has 2/6 -> P probability 2/3.
        let p = model.positive_probability(array![1.0, 0.0].view()).unwrap();
        assert_abs_diff_eq!(p, 2.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_multinomial_rejects_negative_counts() {
        let x = array![[1.0], [2.0]];
        let model = MultinomialNb::fit(x.view(), &[P, N]).unwrap();
        assert!(matches!(
            model.predict_proba(array![-1.0].view()),
            Err(InferenceError::InvalidInput { position: 0, .. })
        ));
        assert!(matches!(
            MultinomialNb::fit(array![[-1.0], [2.0]].view(), &[P, N]),
            Err(FitError::NegativeValue { .. })
        ));
    }

    #[test]
    fn test_bernoulli_matches_hand_computed_likelihoods() {
        // P rows: [1], [1]; N rows: [0], [0]. alpha=1 -> P(present|P)=3/4, P(present|N)=1/4.
        let x = array![[1.0], [1.0], [0.0], [0.0]];
        let model = BernoulliNb::fit(x.view(), &[P, P, N, N]).unwrap();
        let present = model.positive_probability(array![1.0].view()).unwrap();
        let absent = model.positive_probability(array![0.0].view()).unwrap();
        assert_abs_diff_eq!(present, 0.75, epsilon = 1e-12);
        assert_abs_diff_eq!(absent, 0.25, epsilon = 1e-12);
    }

    #[test]
    fn test_fit_requires_both_outcomes() {
        let x = array![[1.0], [0.0]];
        assert_eq!(
            BernoulliNb::fit(x.view(), &[P, P]).unwrap_err(),
            FitError::SingleClass(P)
        );
        assert_eq!(
            GaussianNb::fit(x.view(), &[P]).unwrap_err(),
            FitError::LabelCountMismatch { rows: 2, labels: 1 }
        );
    }

    #[test]
    fn test_fitted_learners_validate() {
        let x = array![[3.0, 1.0], [1.0, 3.0], [0.0, 2.0], [2.0, 0.0]];
        let labels = [P, N, N, P];
        assert_eq!(GaussianNb::fit(x.view(), &labels).unwrap().validate(), Ok(()));
        assert_eq!(MultinomialNb::fit(x.view(), &labels).unwrap().validate(), Ok(()));
        assert_eq!(BernoulliNb::fit(x.view(), &labels).unwrap().validate(), Ok(()));
    }

    #[test]
    fn test_validate_rejects_inconsistent_parameters() {
        let x = array![[-2.0, 0.5, 1.0], [-1.0, 0.0, 2.0], [1.0, 1.5, 0.0], [2.0, 1.0, 1.0]];
        let labels = [N, N, P, P];

        let gaussian = GaussianNb::fit(x.view(), &labels).unwrap();
        let mut narrow_var = gaussian.clone();
        narrow_var.var = gaussian.var.slice(ndarray::s![.., ..2]).to_owned();
        assert!(narrow_var.validate().unwrap_err().contains("var table"));

        let mut zero_var = gaussian.clone();
        zero_var.var[[1, 0]] = 0.0;
        assert!(zero_var.validate().is_err());

        let mut duplicated = gaussian.clone();
        duplicated.classes = vec![P, P];
        assert!(duplicated.validate().unwrap_err().contains("exactly once"));

        let mut bad_prior = gaussian;
        bad_prior.class_log_prior[0] = f64::NAN;
        assert!(bad_prior.validate().is_err());

        let counts = x.mapv(f64::abs);
        let mut multinomial = MultinomialNb::fit(counts.view(), &labels).unwrap();
        multinomial.feature_log_prob[[0, 0]] = 0.5;
        assert!(multinomial.validate().is_err());

        let mut bernoulli = BernoulliNb::fit(x.view(), &labels).unwrap();
        bernoulli.feature_log_prob[[1, 2]] = 0.0;
        assert!(bernoulli.validate().is_err());
    }

    #[test]
    fn test_overflowing_inputs_are_an_error_not_nan() {
        let x = array![[0.0], [0.1], [0.9], [1.0]];
        let model = GaussianNb::fit(x.view(), &[N, N, P, P]).unwrap();
        assert_eq!(
            model.positive_probability(array![1e200].view()),
            Err(InferenceError::DegenerateLikelihood {
                learner: GaussianNb::NAME
            })
        );
    }

    #[test]
    fn test_unfitted_learner_reports_not_fitted() {
        let empty = MultinomialNb {
            classes: Vec::new(),
            alpha: DEFAULT_ALPHA,
            class_log_prior: Array1::zeros(0),
            feature_log_prob: Array2::zeros((0, 3)),
        };
        assert_eq!(
            empty.predict_proba(array![0.0, 0.0, 0.0].view()),
            Err(InferenceError::NotFitted {
                learner: MultinomialNb::NAME
            })
        );
    }
}
