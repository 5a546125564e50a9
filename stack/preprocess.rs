//! # Preprocessing
//!
//! Splits a feature mapping into the three per-group vectors consumed by the base
//! learners and standardizes the continuous group. Pure functions only: nothing
//! here touches disk or logs.

use crate::schema::{FeatureGroup, FeatureMapping};
use ndarray::{Array1, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raised when the caller's mapping lacks a schema name. Never silently defaulted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Required feature '{name}' is missing from the input")]
pub struct MissingFeatureError {
    pub name: String,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScalingError {
    #[error("Scaling parameters cover {found} features, but the continuous group has {expected}")]
    LengthMismatch { expected: usize, found: usize },
    #[error("Mean and scale vectors differ in length ({means} vs {scales})")]
    UnevenVectors { means: usize, scales: usize },
    #[error("Scale for continuous feature {index} must be positive and finite, found {value}")]
    InvalidScale { index: usize, value: f64 },
    #[error("Mean for continuous feature {index} is not finite")]
    NonFiniteMean { index: usize },
}

/// Per-feature standardization for the continuous group:
/// `normalized = (raw - mean) / scale`.
///
/// Instances always match the continuous group's width; deserialization goes
/// through the same validation as [`ScalingParameters::new`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StandardizationTable")]
pub struct ScalingParameters {
    mean: Array1<f64>,
    scale: Array1<f64>,
}

#[derive(Deserialize)]
struct StandardizationTable {
    mean: Array1<f64>,
    scale: Array1<f64>,
}

impl TryFrom<StandardizationTable> for ScalingParameters {
    type Error = ScalingError;

    fn try_from(table: StandardizationTable) -> Result<Self, Self::Error> {
        ScalingParameters::new(table.mean, table.scale)
    }
}

impl ScalingParameters {
    pub fn new(mean: Array1<f64>, scale: Array1<f64>) -> Result<Self, ScalingError> {
        if mean.len() != scale.len() {
            return Err(ScalingError::UnevenVectors {
                means: mean.len(),
                scales: scale.len(),
            });
        }
        let expected = FeatureGroup::Continuous.width();
        if mean.len() != expected {
            return Err(ScalingError::LengthMismatch {
                expected,
                found: mean.len(),
            });
        }
        if let Some(index) = mean.iter().position(|m| !m.is_finite()) {
            return Err(ScalingError::NonFiniteMean { index });
        }
        if let Some((index, &value)) = scale
            .iter()
            .enumerate()
            .find(|(_, s)| !(s.is_finite() && **s > 0.0))
        {
            return Err(ScalingError::InvalidScale { index, value });
        }
        Ok(Self { mean, scale })
    }

    /// Mean 0 and scale 1 for every continuous feature; standardization is a no-op.
    pub fn identity() -> Self {
        let width = FeatureGroup::Continuous.width();
        Self {
            mean: Array1::zeros(width),
            scale: Array1::ones(width),
        }
    }

    /// Fits column means and population standard deviations of `samples`
    /// (`[n_samples, n_continuous]`). Constant columns get a scale of 1.0.
    pub fn fit(samples: ArrayView2<f64>) -> Result<Self, ScalingError> {
        let expected = FeatureGroup::Continuous.width();
        if samples.ncols() != expected || samples.nrows() == 0 {
            return Err(ScalingError::LengthMismatch {
                expected,
                found: samples.ncols(),
            });
        }
        let mean = samples
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(expected));
        let scale = samples
            .std_axis(Axis(0), 0.0)
            .mapv(|s| if s > 0.0 && s.is_finite() { s } else { 1.0 });
        Self::new(mean, scale)
    }

    pub fn mean(&self) -> ArrayView1<'_, f64> {
        self.mean.view()
    }

    pub fn scale(&self) -> ArrayView1<'_, f64> {
        self.scale.view()
    }

    pub fn transform(&self, raw: ArrayView1<f64>) -> Array1<f64> {
        (&raw - &self.mean) / &self.scale
    }
}

/// The three numeric vectors produced from one feature mapping, in schema order.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVectors {
    /// Standardized continuous values.
    pub continuous: Array1<f64>,
    pub discrete: Array1<f64>,
    pub binary: Array1<f64>,
}

impl FeatureVectors {
    pub fn group(&self, group: FeatureGroup) -> ArrayView1<'_, f64> {
        match group {
            FeatureGroup::Continuous => self.continuous.view(),
            FeatureGroup::Discrete => self.discrete.view(),
            FeatureGroup::Binary => self.binary.view(),
        }
    }
}

/// Builds the per-group vectors for `mapping`, standardizing the continuous one.
///
/// Groups are visited in canonical order, so the reported missing name is the
/// first absent one in the Full Feature Set.
pub fn prepare(
    mapping: &FeatureMapping,
    scaling: &ScalingParameters,
) -> Result<FeatureVectors, MissingFeatureError> {
    let raw_continuous = extract_group(mapping, FeatureGroup::Continuous)?;
    let discrete = extract_group(mapping, FeatureGroup::Discrete)?;
    let binary = extract_group(mapping, FeatureGroup::Binary)?;

    Ok(FeatureVectors {
        continuous: scaling.transform(raw_continuous.view()),
        discrete,
        binary,
    })
}

fn extract_group(
    mapping: &FeatureMapping,
    group: FeatureGroup,
) -> Result<Array1<f64>, MissingFeatureError> {
    group
        .names()
        .iter()
        .map(|&name| {
            mapping.get(name).copied().ok_or_else(|| MissingFeatureError {
                name: name.to_string(),
            })
        })
        .collect::<Result<Vec<f64>, _>>()
        .map(Array1::from_vec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{BINARY_FEATURES, CONTINUOUS_FEATURES, DISCRETE_FEATURES, zero_mapping};
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};

    fn ascending_mapping() -> FeatureMapping {
        let mut mapping = FeatureMapping::new();
        for (i, name) in CONTINUOUS_FEATURES.iter().enumerate() {
            mapping.insert(name.to_string(), i as f64 + 0.5);
        }
        for (i, name) in DISCRETE_FEATURES.iter().enumerate() {
            mapping.insert(name.to_string(), i as f64);
        }
        for (i, name) in BINARY_FEATURES.iter().enumerate() {
            mapping.insert(name.to_string(), (i % 2) as f64);
        }
        mapping
    }

    #[test]
    fn test_prepare_preserves_schema_order_and_lengths() {
        let vectors = prepare(&ascending_mapping(), &ScalingParameters::identity()).unwrap();
        assert_eq!(vectors.continuous.len(), CONTINUOUS_FEATURES.len());
        assert_eq!(vectors.discrete.len(), DISCRETE_FEATURES.len());
        assert_eq!(vectors.binary.len(), BINARY_FEATURES.len());
        assert_eq!(
            vectors.continuous,
            array![0.5, 1.5, 2.5, 3.5, 4.5, 5.5, 6.5, 7.5]
        );
        assert_eq!(vectors.discrete, array![0.0, 1.0, 2.0]);
        assert_eq!(vectors.binary, array![0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_identity_scaling_is_exact() {
        let mapping = ascending_mapping();
        let vectors = prepare(&mapping, &ScalingParameters::identity()).unwrap();
        for (i, name) in CONTINUOUS_FEATURES.iter().enumerate() {
            assert_eq!(vectors.continuous[i], mapping[*name]);
        }
    }

    #[test]
    fn test_standardization_uses_mean_and_scale() {
        let scaling = ScalingParameters::new(Array1::from_elem(8, 1.0), Array1::from_elem(8, 2.0))
            .unwrap();
        let vectors = prepare(&zero_mapping(), &scaling).unwrap();
        for &value in vectors.continuous.iter() {
            assert_abs_diff_eq!(value, -0.5, epsilon = 1e-12);
        }
        // Only the continuous group is scaled.
        assert_eq!(vectors.discrete, Array1::zeros(3));
    }

    #[test]
    fn test_missing_feature_in_any_group_is_named() {
        for name in crate::schema::all_features() {
            let mut mapping = zero_mapping();
            mapping.remove(name);
            let err = prepare(&mapping, &ScalingParameters::identity()).unwrap_err();
            assert_eq!(err.name, name);
        }
    }

    #[test]
    fn test_scaling_validation() {
        assert!(matches!(
            ScalingParameters::new(Array1::zeros(3), Array1::ones(3)),
            Err(ScalingError::LengthMismatch {
                expected: 8,
                found: 3
            })
        ));
        assert!(matches!(
            ScalingParameters::new(Array1::zeros(8), Array1::ones(7)),
            Err(ScalingError::UnevenVectors { .. })
        ));
        let mut scale = Array1::ones(8);
        scale[4] = 0.0;
        assert!(matches!(
            ScalingParameters::new(Array1::zeros(8), scale),
            Err(ScalingError::InvalidScale { index: 4, .. })
        ));
    }

    #[test]
    fn test_fit_replaces_constant_columns() {
        let mut samples = Array2::<f64>::zeros((4, 8));
        for (row, value) in [1.0, 2.0, 3.0, 4.0].into_iter().enumerate() {
            samples[[row, 0]] = value;
        }
        let scaling = ScalingParameters::fit(samples.view()).unwrap();
        assert_abs_diff_eq!(scaling.mean()[0], 2.5, epsilon = 1e-12);
        assert_abs_diff_eq!(scaling.scale()[0], 1.25f64.sqrt(), epsilon = 1e-12);
        assert_eq!(scaling.scale()[1], 1.0);
    }
}
