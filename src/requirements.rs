use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::apis::node_claim::NodeSelectorRequirementWithMinValues;
use crate::labels;

/// Node selector operator, serialized exactly as Kubernetes spells it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
    Gt,
    Lt,
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::In => write!(f, "In"),
            Self::NotIn => write!(f, "NotIn"),
            Self::Exists => write!(f, "Exists"),
            Self::DoesNotExist => write!(f, "DoesNotExist"),
            Self::Gt => write!(f, "Gt"),
            Self::Lt => write!(f, "Lt"),
        }
    }
}

/// How to treat a well-known key that the candidate constrains but the
/// requirement set does not mention.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compatibility {
    /// Undefined well-known keys are satisfied automatically.
    AllowUndefinedWellKnownLabels,
    /// Every key the candidate constrains must be mentioned, unless the
    /// candidate's own operator is negative.
    Strict,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequirementError {
    #[error("requirement {key}: operator {operator} takes exactly one integer value, got {values:?}")]
    InvalidBound {
        key: String,
        operator: Operator,
        values: Vec<String>,
    },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Incompatibility {
    #[error("label {key:?} does not have known values")]
    UndefinedLabel { key: String },
    #[error("key {key}, {candidate} not in {requested}")]
    Disjoint {
        key: String,
        requested: String,
        candidate: String,
    },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("minValues requirement is not met for {key}: need {required} distinct values, found {found}")]
pub struct MinValuesShortfall {
    pub key: String,
    pub required: usize,
    pub found: usize,
}

/// One key's allowed values.
///
/// Either a concrete set (`In`, `DoesNotExist` when empty) or a complement
/// set (`NotIn`, `Exists` when empty). Complement sets may carry integer
/// bounds from `Gt` / `Lt`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Requirement {
    key: String,
    complement: bool,
    values: BTreeSet<String>,
    greater_than: Option<i64>,
    less_than: Option<i64>,
    min_values: Option<usize>,
}

fn within_bounds(value: &str, greater_than: Option<i64>, less_than: Option<i64>) -> bool {
    if greater_than.is_none() && less_than.is_none() {
        return true;
    }
    let Ok(n) = value.parse::<i64>() else {
        return false;
    };
    greater_than.is_none_or(|gt| n > gt) && less_than.is_none_or(|lt| n < lt)
}

impl Requirement {
    pub fn new<I, V>(key: impl Into<String>, operator: Operator, values: I) -> Result<Self, RequirementError>
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        let key = key.into();
        let values: Vec<String> = values.into_iter().map(Into::into).collect();
        let mut requirement = Requirement {
            key,
            complement: false,
            values: BTreeSet::new(),
            greater_than: None,
            less_than: None,
            min_values: None,
        };
        match operator {
            Operator::In => requirement.values = values.into_iter().collect(),
            Operator::NotIn => {
                requirement.complement = true;
                requirement.values = values.into_iter().collect();
            }
            Operator::Exists => requirement.complement = true,
            Operator::DoesNotExist => {}
            Operator::Gt | Operator::Lt => {
                let bound = match values.as_slice() {
                    [single] => single.parse::<i64>().ok(),
                    _ => None,
                };
                let Some(bound) = bound else {
                    return Err(RequirementError::InvalidBound {
                        key: requirement.key,
                        operator,
                        values,
                    });
                };
                requirement.complement = true;
                if operator == Operator::Gt {
                    requirement.greater_than = Some(bound);
                } else {
                    requirement.less_than = Some(bound);
                }
            }
        }
        Ok(requirement)
    }

    /// `key In {values}`.
    pub fn in_values<I, V>(key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        Requirement {
            key: key.into(),
            complement: false,
            values: values.into_iter().map(Into::into).collect(),
            greater_than: None,
            less_than: None,
            min_values: None,
        }
    }

    pub fn with_min_values(mut self, min_values: Option<usize>) -> Self {
        self.min_values = min_values;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn min_values(&self) -> Option<usize> {
        self.min_values
    }

    pub fn operator(&self) -> Operator {
        if self.complement {
            if !self.values.is_empty() {
                Operator::NotIn
            } else if self.greater_than.is_some() {
                Operator::Gt
            } else if self.less_than.is_some() {
                Operator::Lt
            } else {
                Operator::Exists
            }
        } else if self.values.is_empty() {
            Operator::DoesNotExist
        } else {
            Operator::In
        }
    }

    /// The concrete values, or the excluded values of a complement set.
    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(String::as_str)
    }

    pub fn is_complement(&self) -> bool {
        self.complement
    }

    pub fn has(&self, value: &str) -> bool {
        let listed = self.values.contains(value);
        listed != self.complement && within_bounds(value, self.greater_than, self.less_than)
    }

    /// No value can satisfy this requirement.
    pub fn is_empty(&self) -> bool {
        !self.complement && self.values.is_empty()
    }

    /// The only allowed value, if the set is concrete and has exactly one.
    pub fn single_value(&self) -> Option<&str> {
        match (self.complement, self.values.len()) {
            (false, 1) => self.values.first().map(String::as_str),
            _ => None,
        }
    }

    fn is_negative(&self) -> bool {
        matches!(self.operator(), Operator::NotIn | Operator::DoesNotExist)
    }

    pub fn intersection(&self, other: &Requirement) -> Requirement {
        let complement = self.complement && other.complement;
        let greater_than = self.greater_than.max(other.greater_than);
        let less_than = match (self.less_than, other.less_than) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let min_values = self.min_values.max(other.min_values);

        if let (Some(gt), Some(lt)) = (greater_than, less_than) {
            if gt >= lt {
                return Requirement {
                    key: self.key.clone(),
                    complement: false,
                    values: BTreeSet::new(),
                    greater_than: None,
                    less_than: None,
                    min_values,
                };
            }
        }

        let values: BTreeSet<String> = match (self.complement, other.complement) {
            (true, true) => self.values.union(&other.values).cloned().collect(),
            (true, false) => other.values.difference(&self.values).cloned().collect(),
            (false, true) => self.values.difference(&other.values).cloned().collect(),
            (false, false) => self.values.intersection(&other.values).cloned().collect(),
        };
        let values = values
            .into_iter()
            .filter(|v| complement || within_bounds(v, greater_than, less_than))
            .collect();

        let (greater_than, less_than) = if complement {
            (greater_than, less_than)
        } else {
            (None, None)
        };
        Requirement {
            key: self.key.clone(),
            complement,
            values,
            greater_than,
            less_than,
            min_values,
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let operator = self.operator();
        match operator {
            Operator::In | Operator::NotIn => {
                let values: Vec<&str> = self.values().collect();
                write!(f, "{} {} [{}]", self.key, operator, values.join(", "))
            }
            Operator::Gt => write!(f, "{} Gt {}", self.key, self.greater_than.unwrap_or_default()),
            Operator::Lt => write!(f, "{} Lt {}", self.key, self.less_than.unwrap_or_default()),
            Operator::Exists | Operator::DoesNotExist => write!(f, "{} {}", self.key, operator),
        }
    }
}

/// A set of requirements keyed by label; at most one [`Requirement`] per key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Requirements(BTreeMap<String, Requirement>);

impl Requirements {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a claim's requirement list. Repeated keys are intersected.
    pub fn from_node_selector(
        requirements: &[NodeSelectorRequirementWithMinValues],
    ) -> Result<Requirements, RequirementError> {
        let mut out = Requirements::new();
        for r in requirements {
            out.add(Requirement::new(&r.key, r.operator, &r.values)?.with_min_values(r.min_values));
        }
        Ok(out)
    }

    pub fn add(&mut self, requirement: Requirement) {
        let merged = match self.0.get(&requirement.key) {
            Some(existing) => existing.intersection(&requirement),
            None => requirement,
        };
        self.0.insert(merged.key.clone(), merged);
    }

    pub fn with(mut self, requirement: Requirement) -> Self {
        self.add(requirement);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Requirement> {
        self.0.get(key)
    }

    pub fn has(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Requirement> {
        self.0.values()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Check whether `candidate` can satisfy this requirement set.
    ///
    /// Keys the candidate constrains but we don't are rejected unless the
    /// candidate's operator is negative or `policy` lets undefined well-known
    /// keys through. Keys both sides constrain must intersect, except when
    /// both sides are negative. Stops at the first mismatch.
    pub fn compatible(
        &self,
        candidate: &Requirements,
        policy: Compatibility,
    ) -> Result<(), Incompatibility> {
        for (key, theirs) in &candidate.0 {
            if self.has(key) || theirs.is_negative() {
                continue;
            }
            if policy == Compatibility::AllowUndefinedWellKnownLabels && labels::is_well_known(key) {
                continue;
            }
            return Err(Incompatibility::UndefinedLabel { key: key.clone() });
        }

        for (key, ours) in &self.0 {
            let Some(theirs) = candidate.get(key) else {
                continue;
            };
            if ours.intersection(theirs).is_empty() && !(ours.is_negative() && theirs.is_negative()) {
                return Err(Incompatibility::Disjoint {
                    key: key.clone(),
                    requested: ours.to_string(),
                    candidate: theirs.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Well-known keys pinned to a single value, suitable as node labels.
    pub fn labels(&self) -> BTreeMap<String, String> {
        self.0
            .iter()
            .filter(|(key, _)| labels::is_well_known(key))
            .filter_map(|(key, r)| Some((key.clone(), r.single_value()?.to_string())))
            .collect()
    }

    /// Check every `minValues` constraint against a pool of candidates.
    ///
    /// A key's count is the number of distinct concrete values the pool
    /// offers for it that this requirement set still allows.
    pub fn satisfies_min_values<'a>(
        &self,
        candidates: impl IntoIterator<Item = &'a Requirements> + Clone,
    ) -> Result<(), MinValuesShortfall> {
        for ours in self.0.values() {
            let Some(required) = ours.min_values else {
                continue;
            };
            let mut distinct = BTreeSet::new();
            for candidate in candidates.clone() {
                let Some(theirs) = candidate.get(&ours.key) else {
                    continue;
                };
                let allowed = ours.intersection(theirs);
                if !allowed.complement {
                    distinct.extend(allowed.values);
                }
            }
            if distinct.len() < required {
                return Err(MinValuesShortfall {
                    key: ours.key.clone(),
                    required,
                    found: distinct.len(),
                });
            }
        }
        Ok(())
    }
}

impl FromIterator<Requirement> for Requirements {
    fn from_iter<T: IntoIterator<Item = Requirement>>(iter: T) -> Self {
        let mut out = Requirements::new();
        for requirement in iter {
            out.add(requirement);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::labels::{ARCH, CAPACITY_TYPE, INSTANCE_CPU, INSTANCE_TYPE, ZONE};

    fn req(key: &str, operator: Operator, values: &[&str]) -> Requirement {
        Requirement::new(key, operator, values.iter().copied()).unwrap()
    }

    fn set(reqs: Vec<Requirement>) -> Requirements {
        reqs.into_iter().collect()
    }

    const PERMISSIVE: Compatibility = Compatibility::AllowUndefinedWellKnownLabels;

    #[test]
    fn operator_roundtrips_through_construction() {
        assert_eq!(req("k", Operator::In, &["a"]).operator(), Operator::In);
        assert_eq!(req("k", Operator::NotIn, &["a"]).operator(), Operator::NotIn);
        assert_eq!(req("k", Operator::Exists, &[]).operator(), Operator::Exists);
        assert_eq!(req("k", Operator::DoesNotExist, &[]).operator(), Operator::DoesNotExist);
        assert_eq!(req("k", Operator::Gt, &["3"]).operator(), Operator::Gt);
        assert_eq!(req("k", Operator::Lt, &["3"]).operator(), Operator::Lt);
    }

    #[test]
    fn bounds_need_a_single_integer() {
        assert!(Requirement::new("k", Operator::Gt, ["x"]).is_err());
        assert!(Requirement::new("k", Operator::Lt, ["1", "2"]).is_err());
        assert!(Requirement::new("k", Operator::Gt, Vec::<String>::new()).is_err());
    }

    #[test]
    fn has_respects_operator() {
        assert!(req("k", Operator::In, &["a", "b"]).has("a"));
        assert!(!req("k", Operator::In, &["a"]).has("c"));
        assert!(!req("k", Operator::NotIn, &["a"]).has("a"));
        assert!(req("k", Operator::NotIn, &["a"]).has("b"));
        assert!(req("k", Operator::Exists, &[]).has("anything"));
        assert!(!req("k", Operator::DoesNotExist, &[]).has("anything"));
        assert!(req("k", Operator::Gt, &["2"]).has("4"));
        assert!(!req("k", Operator::Gt, &["2"]).has("2"));
        assert!(!req("k", Operator::Lt, &["2"]).has("not-a-number"));
    }

    #[test]
    fn intersection_of_concrete_sets() {
        let r = req("k", Operator::In, &["a", "b"]).intersection(&req("k", Operator::In, &["b", "c"]));
        assert_eq!(r.values().collect::<Vec<_>>(), vec!["b"]);
        assert_eq!(r.operator(), Operator::In);
    }

    #[test]
    fn intersection_with_complement() {
        let r = req("k", Operator::In, &["a", "b"]).intersection(&req("k", Operator::NotIn, &["a"]));
        assert_eq!(r.values().collect::<Vec<_>>(), vec!["b"]);

        let both = req("k", Operator::NotIn, &["a"]).intersection(&req("k", Operator::NotIn, &["b"]));
        assert_eq!(both.operator(), Operator::NotIn);
        assert!(!both.has("a") && !both.has("b") && both.has("c"));
    }

    #[test]
    fn intersection_applies_bounds_to_concrete_values() {
        let r = req("k", Operator::Gt, &["2"]).intersection(&req("k", Operator::In, &["1", "4", "8"]));
        assert_eq!(r.values().collect::<Vec<_>>(), vec!["4", "8"]);
        assert!(!r.is_complement());
    }

    #[test]
    fn contradictory_bounds_are_empty() {
        let r = req("k", Operator::Gt, &["8"]).intersection(&req("k", Operator::Lt, &["4"]));
        assert!(r.is_empty());
    }

    #[test]
    fn intersection_keeps_largest_min_values() {
        let a = req("k", Operator::In, &["a"]).with_min_values(Some(2));
        let b = req("k", Operator::In, &["a"]).with_min_values(Some(3));
        assert_eq!(a.intersection(&b).min_values(), Some(3));
    }

    #[test]
    fn repeated_keys_are_intersected() {
        let reqs = set(vec![
            req(ZONE, Operator::In, &["a", "b"]),
            req(ZONE, Operator::In, &["b", "c"]),
        ]);
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs.get(ZONE).unwrap().single_value(), Some("b"));
    }

    #[test]
    fn compatible_when_values_intersect() {
        let claim = set(vec![req(ZONE, Operator::In, &["us-east-1a"])]);
        let candidate = set(vec![req(ZONE, Operator::In, &["us-east-1a", "us-east-1b"])]);
        assert!(claim.compatible(&candidate, PERMISSIVE).is_ok());
    }

    #[test]
    fn incompatible_when_values_disjoint() {
        let claim = set(vec![req(ZONE, Operator::In, &["us-east-1a"])]);
        let candidate = set(vec![req(ZONE, Operator::In, &["us-east-1b"])]);
        let err = claim.compatible(&candidate, PERMISSIVE).unwrap_err();
        assert!(matches!(err, Incompatibility::Disjoint { ref key, .. } if key == ZONE));
    }

    #[test]
    fn not_in_excludes_candidate_value() {
        let claim = set(vec![req(ARCH, Operator::NotIn, &["arm64"])]);
        let arm = set(vec![req(ARCH, Operator::In, &["arm64"])]);
        let amd = set(vec![req(ARCH, Operator::In, &["amd64"])]);
        assert!(claim.compatible(&arm, PERMISSIVE).is_err());
        assert!(claim.compatible(&amd, PERMISSIVE).is_ok());
    }

    #[test]
    fn negative_on_both_sides_is_compatible() {
        let claim = set(vec![req("gpu", Operator::DoesNotExist, &[])]);
        let candidate = set(vec![req("gpu", Operator::DoesNotExist, &[])]);
        assert!(claim.compatible(&candidate, Compatibility::Strict).is_ok());
    }

    #[test]
    fn claim_keys_unknown_to_candidate_are_unconstrained() {
        let claim = set(vec![req("team", Operator::In, &["payments"])]);
        let candidate = set(vec![req(ARCH, Operator::In, &["amd64"])]);
        assert!(claim.compatible(&candidate, PERMISSIVE).is_ok());
    }

    #[test]
    fn policy_decides_undefined_well_known_keys() {
        let claim = Requirements::new();
        let candidate = set(vec![req(INSTANCE_TYPE, Operator::In, &["m5.large"])]);
        assert!(claim.compatible(&candidate, PERMISSIVE).is_ok());
        assert_eq!(
            claim.compatible(&candidate, Compatibility::Strict),
            Err(Incompatibility::UndefinedLabel {
                key: INSTANCE_TYPE.to_string()
            })
        );
    }

    #[test]
    fn undefined_custom_keys_are_rejected_even_when_permissive() {
        let claim = Requirements::new();
        let candidate = set(vec![req("example.com/custom", Operator::In, &["x"])]);
        assert!(claim.compatible(&candidate, PERMISSIVE).is_err());

        let negative = set(vec![req("example.com/custom", Operator::NotIn, &["x"])]);
        assert!(claim.compatible(&negative, Compatibility::Strict).is_ok());
    }

    #[test]
    fn numeric_bounds_against_catalog_values() {
        let claim = set(vec![req(INSTANCE_CPU, Operator::Gt, &["2"])]);
        let small = set(vec![req(INSTANCE_CPU, Operator::In, &["2"])]);
        let large = set(vec![req(INSTANCE_CPU, Operator::In, &["4"])]);
        assert!(claim.compatible(&small, PERMISSIVE).is_err());
        assert!(claim.compatible(&large, PERMISSIVE).is_ok());
    }

    #[test]
    fn compatibility_is_order_independent() {
        let claim = set(vec![
            req(ZONE, Operator::In, &["a"]),
            req(CAPACITY_TYPE, Operator::In, &["spot"]),
        ]);
        let candidate = set(vec![
            req(CAPACITY_TYPE, Operator::In, &["on-demand"]),
            req(ZONE, Operator::In, &["a"]),
        ]);
        let reversed = set(vec![
            req(ZONE, Operator::In, &["a"]),
            req(CAPACITY_TYPE, Operator::In, &["on-demand"]),
        ]);
        assert_eq!(
            claim.compatible(&candidate, PERMISSIVE).is_ok(),
            claim.compatible(&reversed, PERMISSIVE).is_ok()
        );
        assert!(claim.compatible(&candidate, PERMISSIVE).is_err());
    }

    #[test]
    fn labels_only_include_single_valued_well_known_keys() {
        let reqs = set(vec![
            req(INSTANCE_TYPE, Operator::In, &["m5.large"]),
            req(ZONE, Operator::In, &["a", "b"]),
            req("team", Operator::In, &["x"]),
            req(ARCH, Operator::NotIn, &["arm64"]),
        ]);
        let labels = reqs.labels();
        assert_eq!(labels.len(), 1);
        assert_eq!(labels.get(INSTANCE_TYPE).map(String::as_str), Some("m5.large"));
    }

    #[test]
    fn min_values_counts_distinct_allowed_values() {
        let claim = set(vec![
            req(INSTANCE_TYPE, Operator::In, &["a", "b", "c"]).with_min_values(Some(2)),
        ]);
        let a = set(vec![req(INSTANCE_TYPE, Operator::In, &["a"])]);
        let b = set(vec![req(INSTANCE_TYPE, Operator::In, &["b"])]);
        let z = set(vec![req(INSTANCE_TYPE, Operator::In, &["z"])]);

        assert!(claim.satisfies_min_values([&a, &b]).is_ok());
        assert_eq!(
            claim.satisfies_min_values([&a, &z]),
            Err(MinValuesShortfall {
                key: INSTANCE_TYPE.to_string(),
                required: 2,
                found: 1
            })
        );
    }

    #[test]
    fn from_node_selector_carries_min_values() {
        let reqs = Requirements::from_node_selector(&[NodeSelectorRequirementWithMinValues {
            key: INSTANCE_TYPE.into(),
            operator: Operator::Exists,
            values: vec![],
            min_values: Some(3),
        }])
        .unwrap();
        assert_eq!(reqs.get(INSTANCE_TYPE).unwrap().min_values(), Some(3));
    }
}
