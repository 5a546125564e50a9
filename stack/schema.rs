//! # Feature Schema
//!
//! The fixed, ordered catalog of clinical features accepted by the ensemble.
//! Column names are not configurable: the position of a name inside its group
//! is the position of its value inside that group's feature vector, and every
//! other module treats these catalogs as the ground truth for both vector
//! layout and input validation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// A complete set of named feature values for one patient.
pub type FeatureMapping = BTreeMap<String, f64>;

/// Choline PET uptake statistics and blood markers, standardized before scoring.
pub const CONTINUOUS_FEATURES: [&str; 8] = [
    "Std. dev: g/mL_Choline_Bone+",
    "Min: g/mL_Choline_Liver",
    "Std. dev: g/mL_Choline_Bone-",
    "Peak: g/mL_Choline_Kidney",
    "Peak: g/mL_Choline_Bone-",
    "Neutrophils (G/L)",
    "Leukocytes (G/L)",
    "Alkaline Phosphatase (ALP) levels",
];

/// Lesion counts and ordinal scores, consumed raw.
pub const DISCRETE_FEATURES: [&str; 3] = [
    "Number of lymph node involvements (supradiaphragmatic)",
    "Number of lymph node involvements (subdiaphragmatic)",
    "Invasion score of Pelvis",
];

/// Presence/absence findings, consumed raw.
pub const BINARY_FEATURES: [&str; 3] = ["Liver involvement", "PSMA-/FDG+", "PSMA-/Choline+"];

/// The one discrete feature with an upper bound.
pub const PELVIS_INVASION_FEATURE: &str = "Invasion score of Pelvis";
pub const PELVIS_INVASION_MAX: f64 = 3.0;

/// One of the three feature groups, each scored by its own base learner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FeatureGroup {
    Continuous,
    Discrete,
    Binary,
}

impl FeatureGroup {
    /// Groups in the canonical order. This is also the order in which the base
    /// probabilities are assembled into the meta-feature vector.
    pub const ALL: [FeatureGroup; 3] = [
        FeatureGroup::Continuous,
        FeatureGroup::Discrete,
        FeatureGroup::Binary,
    ];

    pub fn names(self) -> &'static [&'static str] {
        match self {
            FeatureGroup::Continuous => &CONTINUOUS_FEATURES,
            FeatureGroup::Discrete => &DISCRETE_FEATURES,
            FeatureGroup::Binary => &BINARY_FEATURES,
        }
    }

    pub fn width(self) -> usize {
        self.names().len()
    }

    pub fn label(self) -> &'static str {
        match self {
            FeatureGroup::Continuous => "continuous",
            FeatureGroup::Discrete => "discrete",
            FeatureGroup::Binary => "binary",
        }
    }

    /// Finds the group a feature name belongs to, if any.
    pub fn of(name: &str) -> Option<FeatureGroup> {
        FeatureGroup::ALL
            .into_iter()
            .find(|group| group.names().contains(&name))
    }
}

impl fmt::Display for FeatureGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// The Full Feature Set: continuous, then discrete, then binary names.
pub fn all_features() -> impl Iterator<Item = &'static str> {
    FeatureGroup::ALL
        .into_iter()
        .flat_map(|group| group.names().iter().copied())
}

/// A mapping with every feature of the schema set to zero.
pub fn zero_mapping() -> FeatureMapping {
    all_features().map(|name| (name.to_string(), 0.0)).collect()
}

/// Errors for values that are present but outside the domain of their feature.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FeatureValueError {
    #[error("'{0}' is not part of the feature schema")]
    UnexpectedFeature(String),
    #[error("Feature '{name}' has a non-finite value ({value})")]
    NonFinite { name: String, value: f64 },
    #[error("Feature '{name}' must be non-negative, found {value}")]
    Negative { name: String, value: f64 },
    #[error("Discrete feature '{name}' must be a whole number, found {value}")]
    NotInteger { name: String, value: f64 },
    #[error("Feature '{name}' must not exceed {max}, found {value}")]
    OutOfRange { name: String, value: f64, max: f64 },
    #[error("Binary feature '{name}' must be 0 or 1, found {value}")]
    NotBinary { name: String, value: f64 },
}

/// Checks every supplied value against the domain of its feature.
///
/// Missing names are not reported here; the preprocessor owns that check so the
/// caller always learns about an absent feature first.
pub fn check_values(mapping: &FeatureMapping) -> Result<(), FeatureValueError> {
    for (name, &value) in mapping {
        let group = FeatureGroup::of(name)
            .ok_or_else(|| FeatureValueError::UnexpectedFeature(name.clone()))?;

        if !value.is_finite() {
            return Err(FeatureValueError::NonFinite {
                name: name.clone(),
                value,
            });
        }
        if value < 0.0 {
            return Err(FeatureValueError::Negative {
                name: name.clone(),
                value,
            });
        }

        match group {
            FeatureGroup::Continuous => {}
            FeatureGroup::Discrete => {
                if value.fract() != 0.0 {
                    return Err(FeatureValueError::NotInteger {
                        name: name.clone(),
                        value,
                    });
                }
                if name == PELVIS_INVASION_FEATURE && value > PELVIS_INVASION_MAX {
                    return Err(FeatureValueError::OutOfRange {
                        name: name.clone(),
                        value,
                        max: PELVIS_INVASION_MAX,
                    });
                }
            }
            FeatureGroup::Binary => {
                if value != 0.0 && value != 1.0 {
                    return Err(FeatureValueError::NotBinary {
                        name: name.clone(),
                        value,
                    });
                }
            }
        }
    }
    Ok(())
}

/// The schema a model artifact was built against, stored alongside its parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaFingerprint {
    pub continuous: Vec<String>,
    pub discrete: Vec<String>,
    pub binary: Vec<String>,
}

impl SchemaFingerprint {
    pub fn current() -> Self {
        let owned = |group: FeatureGroup| group.names().iter().map(|s| s.to_string()).collect();
        Self {
            continuous: owned(FeatureGroup::Continuous),
            discrete: owned(FeatureGroup::Discrete),
            binary: owned(FeatureGroup::Binary),
        }
    }

    pub fn is_current(&self) -> bool {
        *self == Self::current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_feature_set_is_grouped_in_order() {
        let names: Vec<&str> = all_features().collect();
                assert_eq!(names.len(), 14);
        assert_eq!(names[0], CONTINUOUS_FEATURES[0]);
        assert_eq!(names[8], DISCRETE_FEATURES[0]);
        assert_eq!(names[13], BINARY_FEATURES[2]);
    }

    #[test]
    fn test_group_lookup() {
        assert_eq!(
            FeatureGroup::of("Neutrophils (G/L)"),
            Some(FeatureGroup::Continuous)
        );
        assert_eq!(
            FeatureGroup::of(PELVIS_INVASION_FEATURE),
            Some(FeatureGroup::Discrete)
        );
        assert_eq!(FeatureGroup::of("PSMA-/FDG+"), Some(FeatureGroup::Binary));
        assert_eq!(FeatureGroup::of("Body weight"), None);
    }

    #[test]
    fn test_zero_mapping_passes_domain_checks() {
        let mapping = zero_mapping();
        assert_eq!(mapping.len(), all_features().count());
        assert!(check_values(&mapping).is_ok());
    }

    #[test]
    fn test_domain_violations_are_reported() {
        let mut mapping = zero_mapping();
        mapping.insert(PELVIS_INVASION_FEATURE.to_string(), 4.0);
        assert!(matches!(
            check_values(&mapping),
            Err(FeatureValueError::OutOfRange { .. })
        ));

        let mut mapping = zero_mapping();
        mapping.insert(DISCRETE_FEATURES[0].to_string(), 1.5);
        assert!(matches!(
            check_values(&mapping),
            Err(FeatureValueError::NotInteger { .. })
        ));

        let mut mapping = zero_mapping();
        mapping.insert("Liver involvement".to_string(), 2.0);
        assert!(matches!(
            check_values(&mapping),
            Err(FeatureValueError::NotBinary { .. })
        ));

        let mut mapping = zero_mapping();
        mapping.insert("Leukocytes (G/L)".to_string(), -0.1);
        assert!(matches!(
            check_values(&mapping),
            Err(FeatureValueError::Negative { .. })
        ));

        let mut mapping = zero_mapping();
        mapping.insert("Leukocytes (G/L)".to_string(), f64::NAN);
        assert!(matches!(
            check_values(&mapping),
            Err(FeatureValueError::NonFinite { .. })
        ));

        let mut mapping = zero_mapping();
        mapping.insert("Age".to_string(), 70.0);
        assert_eq!(
            check_values(&mapping),
            Err(FeatureValueError::UnexpectedFeature("Age".to_string()))
        );
    }

    #[test]
    fn test_fingerprint_detects_foreign_schema() {
        assert!(SchemaFingerprint::current().is_current());
        let mut foreign = SchemaFingerprint::current();
        foreign.binary.reverse();
        assert!(!foreign.is_current());
    }
}
