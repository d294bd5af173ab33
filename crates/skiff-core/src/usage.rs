use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Bookkeeping side channel. Nothing in the session lifecycle depends on it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UsageEvent {
    SessionCreated {
        session_id: String,
        owner_id: String,
        repo: Option<String>,
    },
    MessageSent {
        session_id: String,
        chars: usize,
    },
    SessionTerminated {
        session_id: String,
    },
}

#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn record(&self, event: UsageEvent) -> anyhow::Result<()>;
}

pub struct LogUsageSink;

#[async_trait]
impl UsageSink for LogUsageSink {
    async fn record(&self, event: UsageEvent) -> anyhow::Result<()> {
        let payload = serde_json::to_string(&event)?;
        tracing::info!(target: "skiff.usage", usage = %payload, "usage recorded");
        Ok(())
    }
}

pub struct NoopUsageSink;

#[async_trait]
impl UsageSink for NoopUsageSink {
    async fn record(&self, _event: UsageEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Fire and forget: the caller never waits on the sink.
pub fn record_usage(sink: &Arc<dyn UsageSink>, event: UsageEvent) {
    let sink = sink.clone();
    tokio::spawn(async move {
        if let Err(e) = sink.record(event).await {
            tracing::warn!("Failed to record usage: {}", e);
        }
    });
}
