//! Telemetry items and batches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One unit of telemetry. The channel never looks inside `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryItem {
    /// Event name, e.g. "request" or "exception".
    pub name: String,
    /// When the item was produced.
    pub time: DateTime<Utc>,
    /// Producer-defined payload.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl TelemetryItem {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            time: Utc::now(),
            data,
        }
    }

    /// Wrap an arbitrary JSON document. Its `name` field is used when it is a
    /// string, otherwise the item is called "event".
    pub fn from_json(data: Value) -> Self {
        let name = data
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("event")
            .to_string();
        Self::new(name, data)
    }
}

/// Items captured at one flush, in enqueue order. Immutable once built.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    items: Vec<TelemetryItem>,
}

impl Batch {
    pub fn new(items: Vec<TelemetryItem>) -> Self {
        Self { items }
    }

    pub fn items(&self) -> &[TelemetryItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_json_takes_name_field() {
        let item = TelemetryItem::from_json(json!({"name": "request", "duration_ms": 12}));
        assert_eq!(item.name, "request");
        assert_eq!(item.data["duration_ms"], 12);
    }

    #[test]
    fn from_json_defaults_name() {
        let item = TelemetryItem::from_json(json!([1, 2, 3]));
        assert_eq!(item.name, "event");

        let item = TelemetryItem::from_json(json!({"name": 7}));
        assert_eq!(item.name, "event");
    }

    #[test]
    fn null_data_is_omitted() {
        let item = TelemetryItem::new("ping", Value::Null);
        let json = serde_json::to_string(&item).unwrap();
        assert!(!json.contains("\"data\""));
    }

    #[test]
    fn batch_preserves_order() {
        let batch = Batch::new(vec![
            TelemetryItem::new("a", Value::Null),
            TelemetryItem::new("b", Value::Null),
        ]);
        let names: Vec<&str> = batch.items().iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(batch.len(), 2);
        assert!(!batch.is_empty());
        assert!(Batch::default().is_empty());
    }
}
