use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::pipeline::{BulkSink, IndexAction};
use crate::sink::template;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("template file error: {0}")]
    TemplateFile(#[from] std::io::Error),

    #[error("template is not valid json: {0}")]
    TemplateJson(#[from] serde_json::Error),

    #[error("index sink unreachable: {0}")]
    Unreachable(String),
}

/// Streaming bulk adapter for an Elasticsearch-compatible cluster.
///
/// Chunks are delivered with per-document retry on throttling and
/// log-and-continue on everything else; a chunk is never allowed to take the
/// pipeline down.
pub struct ElasticSink {
    client: reqwest::Client,
    urls: Vec<String>,
    max_retries: usize,
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<BulkItem>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    index: Option<BulkItemStatus>,
}

#[derive(Debug, Deserialize)]
struct BulkItemStatus {
    #[serde(rename = "_id", default)]
    id: String,
    status: u16,
    error: Option<Value>,
}

impl ElasticSink {
    pub fn new(
        urls: Vec<String>,
        max_retries: usize,
        timeout: Duration,
    ) -> Result<Self, SinkError> {
        if urls.is_empty() {
            return Err(SinkError::Unreachable("no elastic url configured".to_string()));
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            urls,
            max_retries,
        })
    }

    /// Create the index template if it is missing (or unconditionally with
    /// `force`). Inability to reach the cluster here is a startup failure.
    pub async fn ensure_template(
        &self,
        name: &str,
        template_file: Option<&Path>,
        force: bool,
    ) -> Result<(), SinkError> {
        let mut last_error = None;
        for url in &self.urls {
            let endpoint = format!("{}/_template/{}", url.trim_end_matches('/'), name);
            let exists = match self.client.head(&endpoint).send().await {
                Ok(resp) => resp.status().is_success(),
                Err(e) => {
                    last_error = Some(e);
                    continue;
                }
            };

            if exists && !force {
                info!(template = name, "index template present");
                return Ok(());
            }

            let body = match template_file {
                Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
                None => template::default_template(),
            };
            self.client
                .put(&endpoint)
                .json(&body)
                .send()
                .await?
                .error_for_status()?;
            info!(template = name, "index template created");
            return Ok(());
        }
        Err(SinkError::Unreachable(
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no elastic url configured".to_string()),
        ))
    }

    fn bulk_body(&self, actions: &[IndexAction]) -> String {
        let mut body = String::new();
        for action in actions {
            let mut header = json!({ "_index": action.index, "_id": action.id });
            if let Some(t) = &action.doc_type {
                header["_type"] = Value::String(t.clone());
            }
            body.push_str(&json!({ "index": header }).to_string());
            body.push('\n');
            body.push_str(&action.source.to_string());
            body.push('\n');
        }
        body
    }

    /// POST one bulk body, trying the configured URLs in order.
    async fn post_bulk(&self, body: String) -> Result<BulkResponse, reqwest::Error> {
        let mut last_error = None;
        for url in &self.urls {
            let endpoint = format!("{}/_bulk", url.trim_end_matches('/'));
            let result = self
                .client
                .post(&endpoint)
                .header("content-type", "application/x-ndjson")
                .body(body.clone())
                .send()
                .await
                .and_then(|resp| resp.error_for_status());
            match result {
                Ok(resp) => return resp.json::<BulkResponse>().await,
                Err(e) => {
                    warn!(url = url.as_str(), error = %e, "bulk request failed, trying next url");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.expect("at least one elastic url"))
    }
}

#[async_trait]
impl BulkSink for ElasticSink {
    async fn send_bulk(&self, actions: Vec<IndexAction>) {
        let mut pending = actions;
        let mut attempt = 0usize;

        loop {
            let body = self.bulk_body(&pending);
            let response = match self.post_bulk(body).await {
                Ok(r) => r,
                Err(error) => {
                    // at-least-once degrades to best-effort on network faults
                    error!(%error, records = pending.len(), "bulk request failed, dropping chunk");
                    return;
                }
            };

            if !response.errors {
                return;
            }

            let mut throttled = Vec::new();
            for (action, item) in pending.into_iter().zip(response.items) {
                let Some(status) = item.index else { continue };
                if status.status == 429 {
                    throttled.push(action);
                } else if status.status >= 400 {
                    error!(
                        id = status.id.as_str(),
                        status = status.status,
                        error = %status.error.unwrap_or(serde_json::Value::Null),
                        "index request rejected"
                    );
                }
            }

            if throttled.is_empty() {
                return;
            }
            if attempt >= self.max_retries {
                error!(
                    records = throttled.len(),
                    "throttled documents exhausted retries, dropping"
                );
                return;
            }
            attempt += 1;
            let backoff = Duration::from_secs((1u64 << attempt).min(30));
            warn!(
                records = throttled.len(),
                attempt,
                backoff_secs = backoff.as_secs(),
                "retrying throttled documents"
            );
            tokio::time::sleep(backoff).await;
            pending = throttled;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink() -> ElasticSink {
        ElasticSink::new(
            vec!["http://localhost:9200".to_string()],
            3,
            Duration::from_secs(30),
        )
        .unwrap()
    }

    fn action(id: &str) -> IndexAction {
        IndexAction {
            id: id.to_string(),
            index: "nginx-2023.01.02".to_string(),
            doc_type: None,
            source: json!({"status": 200}),
        }
    }

    #[test]
    fn test_bulk_body_shape() {
        let body = sink().bulk_body(&[action("a"), action("b")]);
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 4);

        let header: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(header["index"]["_index"], json!("nginx-2023.01.02"));
        assert_eq!(header["index"]["_id"], json!("a"));
        assert!(header["index"].get("_type").is_none());

        let source: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(source, json!({"status": 200}));
        assert!(body.ends_with('\n'));
    }

    #[test]
    fn test_bulk_body_with_type() {
        let mut a = action("a");
        a.doc_type = Some("access_log".to_string());
        let body = sink().bulk_body(&[a]);
        let header: Value = serde_json::from_str(body.lines().next().unwrap()).unwrap();
        assert_eq!(header["index"]["_type"], json!("access_log"));
    }

    #[test]
    fn test_bulk_response_parsing() {
        let raw = r#"{
            "took": 3,
            "errors": true,
            "items": [
                {"index": {"_id": "a", "status": 201}},
                {"index": {"_id": "b", "status": 429, "error": {"type": "es_rejected_execution_exception"}}},
                {"index": {"_id": "c", "status": 400, "error": {"type": "mapper_parsing_exception"}}}
            ]
        }"#;
        let resp: BulkResponse = serde_json::from_str(raw).unwrap();
        assert!(resp.errors);
        assert_eq!(resp.items.len(), 3);
        let b = resp.items[1].index.as_ref().unwrap();
        assert_eq!(b.status, 429);
        assert!(b.error.is_some());
    }
}
