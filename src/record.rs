use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// One application log entry as handed over by the host logging framework.
///
/// The timestamp is always written as `@timestamp` on the wire, which is
/// the field Elasticsearch index templates and Kibana expect.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LogEvent {
    #[serde(rename = "@timestamp")]
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub logger_name: String,
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl LogEvent {
    /// Build an event stamped with the current time and no properties.
    pub fn new(
        level: impl Into<String>,
        logger_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        LogEvent {
            timestamp: Utc::now(),
            level: level.into(),
            logger_name: logger_name.into(),
            message: Some(message.into()),
            module_path: None,
            file: None,
            line: None,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamp_is_serialized_as_at_timestamp() {
        let mut event = LogEvent::new("ERROR", "app::db", "connection lost");
        event.timestamp = Utc.with_ymd_and_hms(2024, 3, 5, 10, 0, 0).unwrap();

        let value = serde_json::to_value(&event).unwrap();
        let obj = value.as_object().unwrap();

        assert!(obj.contains_key("@timestamp"));
        assert!(!obj.contains_key("timestamp"));
        assert_eq!(obj["@timestamp"], "2024-03-05T10:00:00Z");
    }

    #[test]
    fn empty_optionals_are_omitted() {
        let event = LogEvent::new("INFO", "app", "hello");
        let value = serde_json::to_value(&event).unwrap();
        let obj = value.as_object().unwrap();

        assert!(!obj.contains_key("file"));
        assert!(!obj.contains_key("properties"));
        assert_eq!(obj["logger_name"], "app");
    }

    #[test]
    fn properties_are_nested() {
        let event = LogEvent::new("WARN", "app", "slow").with_property("elapsed_ms", 1200);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["properties"]["elapsed_ms"], 1200);
    }
}
