//! Multi-Dimensional Resource Algebra
//!
//! Resources are sparse, typed vectors: a mapping from resource-type name to
//! a non-negative quantity. Absent keys read as zero. All arithmetic is
//! element-wise; subtraction saturates at zero and never produces a negative
//! component. `Option<Resource>` models the unbounded case: `None` means "no
//! configured limit" for maxima and headroom.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::warn;

use crate::SchedulerError;

/// A single resource quantity. Quantities never go negative.
pub type Quantity = u64;

/// Sparse multi-dimensional resource vector.
///
/// Backed by a `BTreeMap` so iteration, display and comparisons are
/// deterministic regardless of insertion order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resource {
    resources: BTreeMap<String, Quantity>,
}

/// Equality is semantic: an explicit zero entry equals an absent key.
impl PartialEq for Resource {
    fn eq(&self, other: &Self) -> bool {
        self.resources
            .keys()
            .chain(other.resources.keys())
            .all(|name| self.get(name) == other.get(name))
    }
}

impl Eq for Resource {}

impl Resource {
    /// New empty (all-zero) resource.
    pub fn new() -> Self {
        Resource::default()
    }

    /// Build from explicit type/quantity pairs.
    pub fn from_map<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Quantity)>,
        K: Into<String>,
    {
        Resource {
            resources: entries
                .into_iter()
                .map(|(k, v)| (k.into(), v))
                .collect(),
        }
    }

    /// Parse from a configuration map of decimal-integer strings.
    ///
    /// Negative and non-numeric values are rejected with a configuration
    /// error; no partial resource is returned.
    pub fn from_conf(conf: &HashMap<String, String>) -> Result<Self, SchedulerError> {
        let mut resources = BTreeMap::new();
        for (name, value) in conf {
            let parsed: i64 = value.trim().parse().map_err(|_| {
                SchedulerError::Config(format!(
                    "invalid quantity '{value}' for resource type '{name}'"
                ))
            })?;
            if parsed < 0 {
                return Err(SchedulerError::Config(format!(
                    "negative quantity '{value}' for resource type '{name}'"
                )));
            }
            resources.insert(name.clone(), parsed as Quantity);
        }
        Ok(Resource { resources })
    }

    /// Quantity for a resource type; absent keys read as zero.
    pub fn get(&self, resource_type: &str) -> Quantity {
        self.resources.get(resource_type).copied().unwrap_or(0)
    }

    /// Set the quantity for a resource type.
    pub fn set(&mut self, resource_type: impl Into<String>, quantity: Quantity) {
        self.resources.insert(resource_type.into(), quantity);
    }

    /// True when every component is zero (or no components exist).
    pub fn is_zero(&self) -> bool {
        self.resources.values().all(|v| *v == 0)
    }

    /// Iterate over the resource types present in this vector.
    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.resources.keys().map(String::as_str)
    }

    /// Iterate over (type, quantity) pairs.
    pub fn entries(&self) -> impl Iterator<Item = (&str, Quantity)> {
        self.resources.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Element-wise sum.
    pub fn add(&self, other: &Resource) -> Resource {
        let mut out = self.clone();
        out.add_assign(other);
        out
    }

    /// Element-wise sum, in place.
    pub fn add_assign(&mut self, other: &Resource) {
        for (name, value) in &other.resources {
            *self.resources.entry(name.clone()).or_insert(0) += value;
        }
    }

    /// Element-wise subtraction, saturating at zero.
    pub fn sub(&self, other: &Resource) -> Resource {
        let mut out = self.clone();
        out.sub_assign_saturating(other);
        out
    }

    /// Element-wise subtraction in place, saturating at zero.
    ///
    /// An attempt to take a component below zero resets that component to
    /// zero; the caller is responsible for avoiding the underflow. The clamp
    /// is logged so accounting bugs stay visible.
    pub fn sub_assign_saturating(&mut self, other: &Resource) {
        for (name, value) in &other.resources {
            let current = self.resources.entry(name.clone()).or_insert(0);
            if *current < *value {
                warn!(
                    resource = %name,
                    have = *current,
                    subtract = *value,
                    "resource decrement underflow, clamping to zero"
                );
                *current = 0;
            } else {
                *current -= value;
            }
        }
    }

    /// Scalar multiply.
    pub fn multiply(&self, times: Quantity) -> Resource {
        Resource {
            resources: self
                .resources
                .iter()
                .map(|(k, v)| (k.clone(), v * times))
                .collect(),
        }
    }

    /// Element-wise minimum across the union of keys.
    ///
    /// A key missing on either side reads as zero, so the result carries an
    /// explicit zero for every type mentioned by only one operand.
    pub fn component_min(&self, other: &Resource) -> Resource {
        let mut out = BTreeMap::new();
        for name in self.resources.keys().chain(other.resources.keys()) {
            out.entry(name.clone())
                .or_insert_with(|| self.get(name).min(other.get(name)));
        }
        Resource { resources: out }
    }

    /// Element-wise maximum across the union of keys.
    pub fn component_max(&self, other: &Resource) -> Resource {
        let mut out = BTreeMap::new();
        for name in self.resources.keys().chain(other.resources.keys()) {
            out.entry(name.clone())
                .or_insert_with(|| self.get(name).max(other.get(name)));
        }
        Resource { resources: out }
    }

    /// True when this request fits within the given capacity: every component
    /// of `self` is at most the matching component of `capacity` (missing
    /// capacity keys read as zero).
    pub fn fits_in(&self, capacity: &Resource) -> bool {
        self.resources
            .iter()
            .all(|(name, value)| *value <= capacity.get(name))
    }

    /// Fits check against an optional capacity, where `None` means
    /// unbounded.
    pub fn fits_in_option(&self, capacity: Option<&Resource>) -> bool {
        match capacity {
            Some(cap) => self.fits_in(cap),
            None => true,
        }
    }

    /// True when some component of `self` is strictly below the matching
    /// component of `floor`. Used for the preemption trigger: a queue is
    /// starved when its usage sits below its guaranteed share.
    pub fn below_anywhere(&self, floor: &Resource) -> bool {
        floor
            .resources
            .iter()
            .any(|(name, value)| self.get(name) < *value)
    }

    /// Dominant share of this vector relative to a total capacity: the
    /// maximum over resource types of `self[k] / total[k]`. Types the total
    /// does not carry are skipped.
    pub fn dominant_share(&self, total: &Resource) -> f64 {
        let mut share: f64 = 0.0;
        for (name, value) in &self.resources {
            let cap = total.get(name);
            if cap > 0 {
                share = share.max(*value as f64 / cap as f64);
            }
        }
        share
    }
}

/// Element-wise minimum of two optional resources, where `None` means
/// unbounded and therefore never tightens the result.
pub fn min_option(a: Option<Resource>, b: Option<Resource>) -> Option<Resource> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.component_min(&b)),
        (Some(a), None) => Some(a),
        (None, b) => b,
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, (name, value)) in self.resources.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{name}:{value}")?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn res(entries: &[(&str, Quantity)]) -> Resource {
        Resource::from_map(entries.iter().map(|(k, v)| (k.to_string(), *v)))
    }

    #[test]
    fn test_from_conf_valid() {
        let mut conf = HashMap::new();
        conf.insert("memory".to_string(), "100".to_string());
        conf.insert("vcore".to_string(), "10".to_string());
        let parsed = Resource::from_conf(&conf).unwrap();
        assert_eq!(parsed.get("memory"), 100);
        assert_eq!(parsed.get("vcore"), 10);
        assert_eq!(parsed.get("unknown"), 0);
    }

    #[test]
    fn test_from_conf_rejects_negative_and_garbage() {
        let mut conf = HashMap::new();
        conf.insert("memory".to_string(), "-5".to_string());
        assert!(Resource::from_conf(&conf).is_err());

        conf.insert("memory".to_string(), "lots".to_string());
        assert!(Resource::from_conf(&conf).is_err());
    }

    #[test]
    fn test_add_and_sub() {
        let a = res(&[("memory", 100), ("vcore", 10)]);
        let b = res(&[("memory", 50)]);
        let sum = a.add(&b);
        assert_eq!(sum.get("memory"), 150);
        assert_eq!(sum.get("vcore"), 10);

        let diff = sum.sub(&a);
        assert_eq!(diff.get("memory"), 50);
        assert_eq!(diff.get("vcore"), 0);
    }

    #[test]
    fn test_sub_saturates_at_zero() {
        let a = res(&[("memory", 100)]);
        let b = res(&[("memory", 200), ("vcore", 1)]);
        let diff = a.sub(&b);
        assert!(diff.is_zero(), "expected zero vector, got {diff}");
    }

    #[test]
    fn test_multiply() {
        let a = res(&[("memory", 10), ("vcore", 1)]);
        let doubled = a.multiply(2);
        assert_eq!(doubled.get("memory"), 20);
        assert_eq!(doubled.get("vcore"), 2);
        assert!(a.multiply(0).is_zero());
    }

    #[test]
    fn test_component_min_union_zeroes_disjoint_keys() {
        let a = res(&[("first", 10), ("second", 5)]);
        let b = res(&[("third", 2)]);
        let min = a.component_min(&b);
        assert_eq!(min, res(&[("first", 0), ("second", 0), ("third", 0)]));
    }

    #[test]
    fn test_component_min_max_overlap() {
        let a = res(&[("first", 10), ("second", 5)]);
        let b = res(&[("first", 5), ("second", 10)]);
        assert_eq!(a.component_min(&b), res(&[("first", 5), ("second", 5)]));
        assert_eq!(a.component_max(&b), res(&[("first", 10), ("second", 10)]));
    }

    #[test]
    fn test_fits_in() {
        let req = res(&[("memory", 10)]);
        let cap = res(&[("memory", 10), ("vcore", 5)]);
        assert!(req.fits_in(&cap));
        // a key the capacity does not carry reads as zero
        let req = res(&[("memory", 10), ("gpu", 1)]);
        assert!(!req.fits_in(&cap));
        // None capacity is unbounded
        assert!(req.fits_in_option(None));
    }

    #[test]
    fn test_below_anywhere() {
        let used = res(&[("memory", 50)]);
        let guaranteed = res(&[("memory", 100)]);
        assert!(used.below_anywhere(&guaranteed));
        assert!(!guaranteed.below_anywhere(&used));
        assert!(!used.below_anywhere(&Resource::new()));
    }

    #[test]
    fn test_dominant_share() {
        let total = res(&[("memory", 200), ("vcore", 10)]);
        let used = res(&[("memory", 50), ("vcore", 5)]);
        let share = used.dominant_share(&total);
        assert!((share - 0.5).abs() < f64::EPSILON);
        assert_eq!(Resource::new().dominant_share(&total), 0.0);
    }

    #[test]
    fn test_min_option_none_is_unbounded() {
        let a = res(&[("memory", 10)]);
        assert_eq!(min_option(Some(a.clone()), None), Some(a.clone()));
        assert_eq!(min_option(None, Some(a.clone())), Some(a));
        assert_eq!(min_option(None, None), None);
    }
}
