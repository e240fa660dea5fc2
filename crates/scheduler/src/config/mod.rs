//! Scheduler Configuration
//!
//! The configuration document is YAML with a `partitions` root; each
//! partition names its queue tree recursively. Validation runs before any
//! state is installed: a bad document rejects the whole batch and leaves the
//! scheduler untouched.
//!
//! Quantities may be written as integers or strings in YAML; both forms are
//! accepted and validated as non-negative decimal integers.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::resources::Resource;
use crate::SchedulerError;

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SchedulerConfig {
    pub partitions: Vec<PartitionConfig>,
}

/// One partition: a named slice of the cluster with its own queue tree.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PartitionConfig {
    pub name: String,
    #[serde(default)]
    pub queues: Vec<QueueConfig>,
}

/// A queue declaration. `parent: true` marks an intermediate queue; a queue
/// with children is a parent regardless of the flag.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct QueueConfig {
    pub name: String,
    #[serde(default)]
    pub parent: bool,
    #[serde(default)]
    pub submitacl: String,
    #[serde(default)]
    pub properties: HashMap<String, String>,
    #[serde(default)]
    pub resources: ResourcesConfig,
    #[serde(default)]
    pub queues: Vec<QueueConfig>,
}

/// Guaranteed and max resource maps of a queue declaration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ResourcesConfig {
    #[serde(default)]
    pub guaranteed: HashMap<String, QuantityValue>,
    #[serde(default)]
    pub max: HashMap<String, QuantityValue>,
}

/// A quantity as written in YAML: a bare integer or a quoted string.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum QuantityValue {
    Number(i64),
    Text(String),
}

impl QuantityValue {
    fn as_text(&self) -> String {
        match self {
            QuantityValue::Number(value) => value.to_string(),
            QuantityValue::Text(value) => value.clone(),
        }
    }
}

fn to_conf_map(values: &HashMap<String, QuantityValue>) -> HashMap<String, String> {
    values
        .iter()
        .map(|(name, value)| (name.clone(), value.as_text()))
        .collect()
}

impl QueueConfig {
    /// A queue is a parent when flagged as such or when it declares
    /// children.
    pub fn is_parent(&self) -> bool {
        self.parent || !self.queues.is_empty()
    }

    /// Parsed guaranteed resources, `None` when not configured.
    pub fn guaranteed_resource(&self) -> Result<Option<Resource>, SchedulerError> {
        if self.resources.guaranteed.is_empty() {
            return Ok(None);
        }
        Resource::from_conf(&to_conf_map(&self.resources.guaranteed)).map(Some)
    }

    /// Parsed max resources, `None` when not configured (unbounded).
    pub fn max_resource(&self) -> Result<Option<Resource>, SchedulerError> {
        if self.resources.max.is_empty() {
            return Ok(None);
        }
        Resource::from_conf(&to_conf_map(&self.resources.max)).map(Some)
    }
}

impl SchedulerConfig {
    /// Look up a partition by name.
    pub fn partition(&self, name: &str) -> Option<&PartitionConfig> {
        self.partitions.iter().find(|p| p.name == name)
    }
}

/// Parse and validate a configuration document. Nothing is installed on
/// failure.
pub fn parse(document: &str) -> Result<SchedulerConfig, SchedulerError> {
    let config: SchedulerConfig = serde_yaml::from_str(document)
        .map_err(|err| SchedulerError::Config(format!("invalid configuration: {err}")))?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &SchedulerConfig) -> Result<(), SchedulerError> {
    if config.partitions.is_empty() {
        return Err(SchedulerError::Config(
            "configuration must declare at least one partition".to_string(),
        ));
    }
    let mut partition_names = HashSet::new();
    for partition in &config.partitions {
        if partition.name.is_empty() {
            return Err(SchedulerError::Config(
                "partition name must not be empty".to_string(),
            ));
        }
        if !partition_names.insert(partition.name.as_str()) {
            return Err(SchedulerError::Config(format!(
                "duplicate partition name '{}'",
                partition.name
            )));
        }
        if partition.queues.len() != 1 || partition.queues[0].name != "root" {
            return Err(SchedulerError::Config(format!(
                "partition '{}' must declare exactly one top-level queue named 'root'",
                partition.name
            )));
        }
        validate_queue(&partition.queues[0], &partition.name)?;
    }
    Ok(())
}

fn validate_queue(queue: &QueueConfig, partition: &str) -> Result<(), SchedulerError> {
    if queue.name.is_empty() || queue.name.contains('.') {
        return Err(SchedulerError::Config(format!(
            "invalid queue name '{}' in partition '{}'",
            queue.name, partition
        )));
    }
    let guaranteed = queue.guaranteed_resource()?;
    let max = queue.max_resource()?;
    if let (Some(guaranteed), Some(max)) = (&guaranteed, &max) {
        if !guaranteed.fits_in(max) {
            return Err(SchedulerError::Config(format!(
                "queue '{}' guaranteed {} exceeds max {}",
                queue.name, guaranteed, max
            )));
        }
    }
    let mut child_names = HashSet::new();
    for child in &queue.queues {
        if !child_names.insert(child.name.as_str()) {
            return Err(SchedulerError::Config(format!(
                "duplicate queue name '{}' under '{}'",
                child.name, queue.name
            )));
        }
        validate_queue(child, partition)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC: &str = r#"
partitions:
  -
    name: default
    queues:
      - name: root
        submitacl: "*"
        queues:
          - name: a
            resources:
              guaranteed:
                memory: 100000
                vcore: 10000
          - name: b
            properties:
              application.sort.policy: fifo
            resources:
              guaranteed:
                memory: "1000000"
                vcore: "10000"
"#;

    #[test]
    fn test_parse_basic_document() {
        let config = parse(BASIC).unwrap();
        assert_eq!(config.partitions.len(), 1);
        let partition = config.partition("default").unwrap();
        let root = &partition.queues[0];
        // root has children, so it is a parent without an explicit flag
        assert!(root.is_parent());
        assert_eq!(root.queues.len(), 2);
        let a = &root.queues[0];
        assert!(!a.is_parent());
        let guaranteed = a.guaranteed_resource().unwrap().unwrap();
        assert_eq!(guaranteed.get("memory"), 100_000);
        assert_eq!(guaranteed.get("vcore"), 10_000);
        // quoted quantities parse the same as bare integers
        let b = &root.queues[1];
        assert_eq!(
            b.guaranteed_resource().unwrap().unwrap().get("memory"),
            1_000_000
        );
        assert_eq!(b.properties["application.sort.policy"], "fifo");
    }

    #[test]
    fn test_reject_negative_quantity() {
        let document = r#"
partitions:
  - name: default
    queues:
      - name: root
        queues:
          - name: a
            resources:
              max:
                memory: -1
"#;
        assert!(matches!(parse(document), Err(SchedulerError::Config(_))));
    }

    #[test]
    fn test_reject_non_numeric_quantity() {
        let document = r#"
partitions:
  - name: default
    queues:
      - name: root
        queues:
          - name: a
            resources:
              max:
                memory: lots
"#;
        assert!(matches!(parse(document), Err(SchedulerError::Config(_))));
    }

    #[test]
    fn test_reject_duplicate_children() {
        let document = r#"
partitions:
  - name: default
    queues:
      - name: root
        queues:
          - name: a
          - name: a
"#;
        assert!(matches!(parse(document), Err(SchedulerError::Config(_))));
    }

    #[test]
    fn test_reject_guaranteed_over_max() {
        let document = r#"
partitions:
  - name: default
    queues:
      - name: root
        queues:
          - name: a
            resources:
              guaranteed:
                memory: 200
              max:
                memory: 100
"#;
        assert!(matches!(parse(document), Err(SchedulerError::Config(_))));
    }

    #[test]
    fn test_reject_missing_root() {
        let document = r#"
partitions:
  - name: default
    queues:
      - name: top
"#;
        assert!(matches!(parse(document), Err(SchedulerError::Config(_))));
    }

    #[test]
    fn test_reject_duplicate_partitions() {
        let document = r#"
partitions:
  - name: default
    queues:
      - name: root
  - name: default
    queues:
      - name: root
"#;
        assert!(matches!(parse(document), Err(SchedulerError::Config(_))));
    }
}
