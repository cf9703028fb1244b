//! Log records as shipped by fluent-bit's HTTP output.
//!
//! The pipeline itself is generic: it only needs a timestamp, an origin
//! string for the primary key, an optional caller-assigned id, and a way to
//! serialize the record as the stored value.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Capability required to turn a record into ledger operations.
pub trait Record: Serialize + Send + Sync + 'static {
    /// Logical timestamp in (fractional) seconds.
    fn timestamp(&self) -> f64;

    /// Logical origin of the record, the first component of its primary key.
    fn origin(&self) -> String;

    /// Caller-assigned identifier, if any. Empty identifiers count as absent.
    fn assigned_id(&self) -> Option<&str>;
}

/// Kubernetes metadata attached by the fluent-bit kubernetes filter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KubernetesMeta {
    pub pod_name: String,
    #[serde(rename = "namespace_name")]
    pub namespace: String,
    pub pod_id: String,
    pub labels: BTreeMap<String, String>,
    pub host: String,
    pub container_name: String,
    pub docker_id: String,
    pub container_hash: String,
    pub container_image: String,
}

/// One container log line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogRecord {
    pub date: f64,
    pub time: String,
    pub stream: String,
    #[serde(rename = "_p")]
    pub partial: String,
    pub log: String,
    pub assigned_id: String,
    pub kubernetes: KubernetesMeta,
}

impl LogRecord {
    /// Minimal record, mostly for tests and benches.
    pub fn new(date: f64, log: impl Into<String>) -> Self {
        LogRecord {
            date,
            log: log.into(),
            ..Default::default()
        }
    }

    pub fn with_pod(mut self, namespace: &str, pod_name: &str, host: &str) -> Self {
        self.kubernetes.namespace = namespace.to_string();
        self.kubernetes.pod_name = pod_name.to_string();
        self.kubernetes.host = host.to_string();
        self
    }

    pub fn with_assigned_id(mut self, id: impl Into<String>) -> Self {
        self.assigned_id = id.into();
        self
    }
}

impl Record for LogRecord {
    fn timestamp(&self) -> f64 {
        self.date
    }

    fn origin(&self) -> String {
        format!(
            "{}/{}@{}",
            self.kubernetes.namespace, self.kubernetes.pod_name, self.kubernetes.host
        )
    }

    fn assigned_id(&self) -> Option<&str> {
        if self.assigned_id.is_empty() {
            None
        } else {
            Some(&self.assigned_id)
        }
    }
}
