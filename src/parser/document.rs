use chrono::{DateTime, FixedOffset};
use serde_json::{Map, Value};

/// A parsed access-log record: a timezone-aware timestamp plus an open
/// mapping of heterogeneous fields.
///
/// The timestamp is kept typed because everything downstream needs it that
/// way (index pattern formatting, min/max cut-offs, stat bucketing);
/// `to_value` renders it back as the `@timestamp` field.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub timestamp: DateTime<FixedOffset>,
    pub fields: Map<String, Value>,
}

impl Document {
    pub fn new(timestamp: DateTime<FixedOffset>) -> Self {
        Self {
            timestamp,
            fields: Map::new(),
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.fields.get(key).and_then(Value::as_i64)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.fields.get(key).and_then(Value::as_f64)
    }

    /// Render the document as the JSON object shipped to the sink,
    /// with `@timestamp` as an RFC 3339 string.
    pub fn to_value(&self) -> Value {
        let mut fields = self.fields.clone();
        fields.insert(
            "@timestamp".to_string(),
            Value::String(self.timestamp.to_rfc3339()),
        );
        Value::Object(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_to_value_renders_timestamp() {
        let ts = FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2023, 1, 2, 3, 4, 5)
            .unwrap();
        let mut doc = Document::new(ts);
        doc.insert("status", 200);

        let value = doc.to_value();
        assert_eq!(
            value["@timestamp"],
            Value::String("2023-01-02T03:04:05+00:00".to_string())
        );
        assert_eq!(value["status"], Value::from(200));
    }

    #[test]
    fn test_to_value_preserves_offset() {
        let ts = FixedOffset::east_opt(3 * 3600)
            .unwrap()
            .with_ymd_and_hms(2023, 6, 1, 12, 0, 0)
            .unwrap();
        let doc = Document::new(ts);
        assert_eq!(
            doc.to_value()["@timestamp"],
            Value::String("2023-06-01T12:00:00+03:00".to_string())
        );
    }
}
