//! Producer/consumer handoff between the parsing filler and the bulk
//! flusher. The buffer is bounded by `chunk_size`; the flusher ships it when
//! it fills or when `max_delay` passes, whichever comes first.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Notify};
use tracing::info;

use crate::follower::RawLine;
use crate::parser::{AccessLogParser, Document};
use crate::stat::Stat;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// One document prepared for the bulk protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexAction {
    pub id: String,
    pub index: String,
    pub doc_type: Option<String>,
    pub source: Value,
}

impl IndexAction {
    /// The action as a single JSON object, the shape `--stdout` prints.
    pub fn to_value(&self) -> Value {
        let mut obj = serde_json::Map::new();
        obj.insert("_id".to_string(), Value::String(self.id.clone()));
        obj.insert("_index".to_string(), Value::String(self.index.clone()));
        if let Some(t) = &self.doc_type {
            obj.insert("_type".to_string(), Value::String(t.clone()));
        }
        obj.insert("_source".to_string(), self.source.clone());
        Value::Object(obj)
    }
}

/// A destination for bulk chunks. Implementations own their error handling:
/// the pipeline never fails because a chunk could not be delivered.
#[async_trait]
pub trait BulkSink: Send + Sync {
    async fn send_bulk(&self, actions: Vec<IndexAction>);
}

pub struct Pipeline {
    parser: AccessLogParser,
    index_pattern: String,
    doc_type: Option<String>,
    chunk_size: usize,
    max_delay: Duration,
    min_timestamp: Option<DateTime<Utc>>,
    max_timestamp: Option<DateTime<Utc>>,
    stat: Option<Arc<Stat>>,
}

impl Pipeline {
    pub fn new(
        parser: AccessLogParser,
        index_pattern: impl Into<String>,
        chunk_size: usize,
        max_delay: Duration,
    ) -> Self {
        Self {
            parser,
            index_pattern: index_pattern.into(),
            doc_type: None,
            chunk_size: chunk_size.max(1),
            max_delay,
            min_timestamp: None,
            max_timestamp: None,
            stat: None,
        }
    }

    pub fn with_doc_type(mut self, doc_type: Option<String>) -> Self {
        self.doc_type = doc_type;
        self
    }

    pub fn with_timestamp_bounds(
        mut self,
        min: Option<DateTime<Utc>>,
        max: Option<DateTime<Utc>>,
    ) -> Self {
        self.min_timestamp = min;
        self.max_timestamp = max;
        self
    }

    pub fn with_stat(mut self, stat: Option<Arc<Stat>>) -> Self {
        self.stat = stat;
        self
    }

    /// Run the filler and flusher until the input channel closes, then drain
    /// whatever is left. Every parsed document that survives the timestamp
    /// cut-offs reaches the sink at least once.
    pub async fn run(
        self,
        mut lines: mpsc::Receiver<RawLine>,
        sink: Arc<dyn BulkSink>,
    ) -> Result<(), PipelineError> {
        let buffer: Arc<Mutex<Vec<IndexAction>>> = Arc::new(Mutex::new(Vec::new()));
        let filled = Arc::new(Notify::new());
        let drained = Arc::new(Notify::new());
        let (eof_tx, eof_rx) = watch::channel(false);

        let filler = {
            let buffer = Arc::clone(&buffer);
            let filled = Arc::clone(&filled);
            let drained = Arc::clone(&drained);
            let parser = self.parser;
            let stat = self.stat;
            let index_pattern = self.index_pattern;
            let doc_type = self.doc_type;
            let chunk_size = self.chunk_size;
            let min_timestamp = self.min_timestamp;
            let max_timestamp = self.max_timestamp;

            tokio::spawn(async move {
                while let Some(raw) = lines.recv().await {
                    let Some(doc) = parser.parse(raw.inode, raw.offset, &raw.line) else {
                        continue;
                    };
                    let ts = doc.timestamp.with_timezone(&Utc);
                    if min_timestamp.is_some_and(|min| ts < min) {
                        continue;
                    }
                    if max_timestamp.is_some_and(|max| ts >= max) {
                        continue;
                    }
                    if let Some(stat) = &stat {
                        stat.hit(&doc);
                    }
                    let action = make_action(doc, &index_pattern, doc_type.as_deref());

                    let full = {
                        let mut buf = buffer.lock().unwrap();
                        buf.push(action);
                        buf.len() >= chunk_size
                    };
                    if full {
                        filled.notify_one();
                        drained.notified().await;
                    }
                }
                let _ = eof_tx.send(true);
                filled.notify_one();
            })
        };

        let flusher = {
            let buffer = Arc::clone(&buffer);
            let chunk_size = self.chunk_size;
            let max_delay = self.max_delay;

            tokio::spawn(async move {
                loop {
                    let at_eof = *eof_rx.borrow();
                    if !at_eof {
                        let _ = tokio::time::timeout(max_delay, filled.notified()).await;
                    }

                    let (snapshot, was_full) = {
                        let mut buf = buffer.lock().unwrap();
                        let was_full = buf.len() >= chunk_size;
                        (std::mem::take(&mut *buf), was_full)
                    };
                    // only a full buffer has a filler waiting on the other
                    // side of the rendezvous
                    if was_full {
                        drained.notify_one();
                    }
                    if !snapshot.is_empty() {
                        info!(records = snapshot.len(), "flushing");
                        sink.send_bulk(snapshot).await;
                    }
                    if at_eof {
                        break;
                    }
                }
            })
        };

        let (filler_res, flusher_res) = tokio::join!(filler, flusher);
        filler_res?;
        flusher_res?;
        Ok(())
    }
}

fn make_action(mut doc: Document, index_pattern: &str, doc_type: Option<&str>) -> IndexAction {
    let id = doc
        .remove("request_id")
        .and_then(|v| v.as_str().map(str::to_owned))
        .unwrap_or_default();
    let index = doc.timestamp.format(index_pattern).to_string();
    IndexAction {
        id,
        index,
        doc_type: doc_type.map(str::to_owned),
        source: doc.to_value(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};

    #[test]
    fn test_make_action_formats_index_and_pops_id() {
        let ts = FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2023, 1, 2, 3, 4, 5)
            .unwrap();
        let mut doc = Document::new(ts);
        doc.insert("request_id", "web1-7-0-1672628645");
        doc.insert("status", 200);

        let action = make_action(doc, "nginx-%Y.%m.%d", None);
        assert_eq!(action.id, "web1-7-0-1672628645");
        assert_eq!(action.index, "nginx-2023.01.02");
        assert_eq!(action.doc_type, None);
        assert!(action.source.get("request_id").is_none());
        assert_eq!(action.source["status"], serde_json::json!(200));
    }

    #[test]
    fn test_action_value_includes_type_when_set() {
        let ts = FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2023, 1, 2, 3, 4, 5)
            .unwrap();
        let mut doc = Document::new(ts);
        doc.insert("request_id", "id-1");

        let action = make_action(doc, "nginx-%Y.%m.%d", Some("access_log"));
        let value = action.to_value();
        assert_eq!(value["_type"], serde_json::json!("access_log"));
        assert_eq!(value["_index"], serde_json::json!("nginx-2023.01.02"));
    }
}
