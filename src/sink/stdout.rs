use std::io::Write;

use async_trait::async_trait;
use tracing::warn;

use crate::pipeline::{BulkSink, IndexAction};

/// Prints bulk actions as JSON lines instead of indexing them.
#[derive(Default)]
pub struct StdoutSink;

impl StdoutSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BulkSink for StdoutSink {
    async fn send_bulk(&self, actions: Vec<IndexAction>) {
        let mut out = std::io::stdout().lock();
        for action in &actions {
            if let Err(error) = writeln!(out, "{}", action.to_value()) {
                warn!(%error, "stdout write failed, dropping chunk");
                return;
            }
        }
        let _ = out.flush();
    }
}
