//! Usage report data model.
//!
//! A [`RawReport`] carries a deduplicated map of operation shapes plus one
//! [`OperationEvent`] per execution. Every event points at a shape through its
//! `operation_map_key`. The JSON form (camelCase) is what ends up on the wire.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identifier of a unique operation shape within a report.
pub type OperationKey = String;

/// A batch of usage telemetry for one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawReport {
    pub id: String,
    pub target: String,
    pub organization: String,
    pub map: BTreeMap<OperationKey, OperationRecord>,
    pub operations: Vec<OperationEvent>,
    /// Number of operation events
    pub size: usize,
}

/// Shape of a GraphQL operation. Never mutated once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRecord {
    pub key: OperationKey,
    /// Normalized operation document
    pub operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
    /// Schema coordinates touched by the operation
    pub fields: Vec<String>,
}

/// A single execution of an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationEvent {
    pub operation_map_key: OperationKey,
    /// Milliseconds since Unix epoch
    pub timestamp: u64,
    pub execution: Execution,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<OperationMetadata>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub ok: bool,
    /// Nanoseconds
    pub duration: u64,
    pub errors_total: u64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

impl RawReport {
    /// Create an empty report.
    pub fn new(
        id: impl Into<String>,
        target: impl Into<String>,
        organization: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            target: target.into(),
            organization: organization.into(),
            map: BTreeMap::new(),
            operations: Vec::new(),
            size: 0,
        }
    }

    /// Add an operation shape, keyed by `record.key`.
    pub fn insert_record(&mut self, record: OperationRecord) {
        self.map.insert(record.key.clone(), record);
    }

    /// Append an execution event and bump `size`.
    pub fn push_operation(&mut self, event: OperationEvent) {
        self.operations.push(event);
        self.size += 1;
    }

    /// Size units used by the buffer and the estimator: operation-map entries.
    pub fn units(&self) -> usize {
        self.map.len()
    }

    /// Number of operation events.
    pub fn operation_count(&self) -> usize {
        self.size
    }

    /// Remove operation events whose key is not in `map`, returning how many
    /// were removed.
    pub fn drop_dangling_operations(&mut self) -> usize {
        let before = self.operations.len();
        let map = &self.map;
        self.operations
            .retain(|op| map.contains_key(&op.operation_map_key));
        let dropped = before - self.operations.len();
        self.size = self.size.saturating_sub(dropped);
        dropped
    }

    /// True when the report carries neither shapes nor events.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty() && self.operations.is_empty()
    }
}

impl OperationRecord {
    pub fn new(key: impl Into<String>, operation: impl Into<String>, fields: Vec<String>) -> Self {
        Self {
            key: key.into(),
            operation: operation.into(),
            operation_name: None,
            fields,
        }
    }
}

impl OperationEvent {
    /// Successful execution without client metadata.
    pub fn ok(operation_map_key: impl Into<String>, timestamp: u64, duration: u64) -> Self {
        Self {
            operation_map_key: operation_map_key.into(),
            timestamp,
            execution: Execution {
                ok: true,
                duration,
                errors_total: 0,
            },
            metadata: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_operation_tracks_size() {
        let mut report = RawReport::new("r1", "target", "org");
        report.insert_record(OperationRecord::new("k1", "{ me { id } }", vec!["Query.me".into()]));
        report.push_operation(OperationEvent::ok("k1", 1_700_000_000_000, 1_000));
        report.push_operation(OperationEvent::ok("k1", 1_700_000_000_001, 2_000));

        assert_eq!(report.units(), 1);
        assert_eq!(report.operation_count(), 2);
        assert!(!report.is_empty());
    }

    #[test]
    fn test_drop_dangling_operations() {
        let mut report = RawReport::new("r1", "target", "org");
        report.insert_record(OperationRecord::new("k1", "{ a }", vec![]));
        report.push_operation(OperationEvent::ok("k1", 1, 1));
        report.push_operation(OperationEvent::ok("missing", 2, 1));
        report.push_operation(OperationEvent::ok("k1", 3, 1));

        assert_eq!(report.drop_dangling_operations(), 1);
        assert_eq!(report.operation_count(), 2);
        assert!(report.operations.iter().all(|op| op.operation_map_key == "k1"));
        assert_eq!(report.drop_dangling_operations(), 0);
    }

    #[test]
    fn test_wire_format_is_camel_case() {
        let mut report = RawReport::new("r1", "target", "org");
        report.insert_record(OperationRecord::new("k1", "{ me { id } }", vec![]));
        report.push_operation(OperationEvent::ok("k1", 1, 2));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["operations"][0]["operationMapKey"], "k1");
        assert_eq!(json["operations"][0]["execution"]["errorsTotal"], 0);
        assert!(json["map"]["k1"].get("operationName").is_none());
        assert!(json["operations"][0].get("metadata").is_none());
    }

    #[test]
    fn test_deserialize_with_client_metadata() {
        let json = r#"{
            "id": "r1",
            "target": "t",
            "organization": "o",
            "map": {"k": {"key": "k", "operation": "{ a }", "operationName": "A", "fields": ["Query.a"]}},
            "operations": [{
                "operationMapKey": "k",
                "timestamp": 10,
                "execution": {"ok": false, "duration": 5, "errorsTotal": 1},
                "metadata": {"client": {"name": "web", "version": "1.2.3"}}
            }],
            "size": 1
        }"#;

        let report: RawReport = serde_json::from_str(json).unwrap();
        assert_eq!(report.map["k"].operation_name.as_deref(), Some("A"));
        let client = report.operations[0]
            .metadata
            .as_ref()
            .and_then(|m| m.client.as_ref())
            .unwrap();
        assert_eq!(client.name, "web");
        assert!(!report.operations[0].execution.ok);
    }
}
