//! # Meta Learner
//!
//! The second layer of the stack: a logistic regression over the three base-layer
//! probabilities, `[p_continuous, p_discrete, p_binary]`. Coefficients are
//! position-specific, so the order of the meta-feature vector matters.
//!
//! Fitting minimizes the L2-penalized negative log-likelihood with BFGS. The
//! intercept is not penalized.

use crate::learner::{
    FitError, InferenceError, Outcome, ProbabilisticClassifier, check_outcome_pair, check_width,
    sorted_classes,
};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, concatenate, s};
use serde::{Deserialize, Serialize};
use wolfe_bfgs::{Bfgs, BfgsSolution};

/// Width of the meta-feature vector: one probability per feature group.
pub const META_FEATURES: usize = 3;
/// Strength of the ridge penalty on the coefficients (inverse of sklearn's `C`).
pub const DEFAULT_L2_PENALTY: f64 = 1.0;

const BFGS_TOLERANCE: f64 = 1e-8;
const BFGS_MAX_ITERATIONS: usize = 200;
const DESCENT_MAX_ITERATIONS: usize = 20_000;

/// L2-regularized logistic regression producing the final decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticMeta {
    pub classes: Vec<Outcome>,
    pub intercept: f64,
    pub l2_penalty: f64,
    /// One coefficient per meta-feature, in meta-feature order.
    pub coefficients: Array1<f64>,
}

fn sigmoid(eta: f64) -> f64 {
    let eta = eta.clamp(-700.0, 700.0);
    1.0 / (1.0 + (-eta).exp())
}

/// `ln(1 + exp(eta))` without overflow.
fn softplus(eta: f64) -> f64 {
    if eta > 0.0 {
        eta + (-eta).exp().ln_1p()
    } else {
        eta.exp().ln_1p()
    }
}

impl LogisticMeta {
    pub const NAME: &'static str = "logistic meta-learner";

    pub fn fit(x: ArrayView2<f64>, labels: &[Outcome]) -> Result<Self, FitError> {
        Self::fit_with_penalty(x, labels, DEFAULT_L2_PENALTY)
    }

    pub fn fit_with_penalty(
        x: ArrayView2<f64>,
        labels: &[Outcome],
        l2_penalty: f64,
    ) -> Result<Self, FitError> {
        let classes = sorted_classes(x.nrows(), labels)?;
        let y: Array1<f64> = labels
            .iter()
            .map(|label| if label.is_positive() { 1.0 } else { 0.0 })
            .collect();
        // Leading column of ones carries the intercept.
        let intercept_column = Array2::<f64>::ones((x.nrows(), 1));
        let design = concatenate(Axis(1), &[intercept_column.view(), x.view()])
            .map_err(|e| FitError::Optimizer {
                learner: Self::NAME,
                reason: e.to_string(),
            })?;

        let objective = PenalizedLogLoss {
            design,
            y,
            l2_penalty,
        };
        let initial = Array1::zeros(x.ncols() + 1);

        let closure_objective = objective.clone();
        let cost_and_grad =
            move |theta: &Array1<f64>| -> (f64, Array1<f64>) { closure_objective.evaluate(theta) };

        let theta = match Bfgs::new(initial.clone(), cost_and_grad)
            .with_tolerance(BFGS_TOLERANCE)
            .with_max_iterations(BFGS_MAX_ITERATIONS)
            .run()
        {
            Ok(BfgsSolution {
                final_point,
                final_value,
                iterations,
                ..
            }) => {
                log::debug!(
                    "Meta-learner BFGS converged in {iterations} iterations (objective {final_value:.6})"
                );
                final_point
            }
            Err(e) => {
                log::warn!("Meta-learner BFGS failed ({e:?}); falling back to gradient descent");
                objective.gradient_descent(initial)
            }
        };

        if theta.iter().any(|v| !v.is_finite()) {
            return Err(FitError::Optimizer {
                learner: Self::NAME,
                reason: "non-finite coefficients".to_string(),
            });
        }

        Ok(Self {
            classes,
            intercept: theta[0],
            l2_penalty,
            coefficients: theta.slice(s![1..]).to_owned(),
        })
    }

    pub fn validate(&self) -> Result<(), String> {
        check_outcome_pair(Self::NAME, &self.classes)?;
        if !self.intercept.is_finite() || self.coefficients.iter().any(|c| !c.is_finite()) {
            return Err(format!("{} has non-finite coefficients", Self::NAME));
        }
        Ok(())
    }

    /// Positive-class probability from the linear predictor.
    fn positive_mass(&self, x: ArrayView1<f64>) -> Result<f64, InferenceError> {
        let eta = self.intercept + self.coefficients.dot(&x);
        if eta.is_nan() {
            return Err(InferenceError::DegenerateLikelihood {
                learner: Self::NAME,
            });
        }
        Ok(sigmoid(eta))
    }
}

impl ProbabilisticClassifier for LogisticMeta {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn classes(&self) -> &[Outcome] {
        &self.classes
    }

    fn n_features(&self) -> usize {
        self.coefficients.len()
    }

    fn predict_proba(&self, x: ArrayView1<f64>) -> Result<Array1<f64>, InferenceError> {
        if self.classes.len() != 2 || self.coefficients.is_empty() {
            return Err(InferenceError::NotFitted {
                learner: Self::NAME,
            });
        }
        check_width(Self::NAME, self.n_features(), x)?;

        let positive = self.positive_mass(x)?;
        Ok(self
            .classes
            .iter()
            .map(|class| {
                if class.is_positive() {
                    positive
                } else {
                    1.0 - positive
                }
            })
            .collect())
    }
}

#[derive(Debug, Clone)]
struct PenalizedLogLoss {
    design: Array2<f64>,
    y: Array1<f64>,
    l2_penalty: f64,
}

impl PenalizedLogLoss {
    fn evaluate(&self, theta: &Array1<f64>) -> (f64, Array1<f64>) {
        let eta = self.design.dot(theta);
        let loss: f64 = eta
            .iter()
            .zip(self.y.iter())
            .map(|(&e, &y)| softplus(e) - y * e)
            .sum();
        let weights = theta.slice(s![1..]);
        let cost = loss + 0.5 * self.l2_penalty * weights.dot(&weights);

        let residual = eta.mapv(sigmoid) - &self.y;
        let mut grad = self.design.t().dot(&residual);
        grad.slice_mut(s![1..])
            .scaled_add(self.l2_penalty, &weights);
        (cost, grad)
    }

    /// Fixed-step descent using a Lipschitz bound on the gradient.
    fn gradient_descent(&self, mut theta: Array1<f64>) -> Array1<f64> {
        let frobenius_sq = self.design.iter().map(|v| v * v).sum::<f64>();
        let step = 1.0 / (0.25 * frobenius_sq + self.l2_penalty);
        for iteration in 0..DESCENT_MAX_ITERATIONS {
            let (_, grad) = self.evaluate(&theta);
            let norm = grad.dot(&grad).sqrt();
            if norm < BFGS_TOLERANCE {
                log::debug!("Gradient descent converged after {iteration} iterations");
                break;
            }
            theta.scaled_add(-step, &grad);
        }
        theta
    }
}
