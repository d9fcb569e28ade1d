//! 実行監査
//!
//! `execute` 1回につき必ず1件のイベントを記録する（マニフェスト不正で失敗した場合を含む）。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::plugin_isolation::types::{ErrorKind, ExecutionResult};

/// 実行の結果
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure(ErrorKind),
}

impl From<&ExecutionResult> for AuditOutcome {
    fn from(result: &ExecutionResult) -> Self {
        match result.error_kind() {
            None => AuditOutcome::Success,
            Some(kind) => AuditOutcome::Failure(kind),
        }
    }
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditOutcome::Success => write!(f, "success"),
            AuditOutcome::Failure(kind) => write!(f, "{}", kind),
        }
    }
}

/// 監査イベント
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEvent {
    /// 実行ID
    pub execution_id: Uuid,
    /// プラグインID（マニフェストから読み取れた場合）
    pub plugin_id: Option<String>,
    /// 結果
    pub outcome: AuditOutcome,
    /// 所要時間（ミリ秒）
    pub duration_ms: u64,
    /// 記録時刻（UTC）
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        execution_id: Uuid,
        plugin_id: Option<String>,
        result: &ExecutionResult,
        duration_ms: u64,
    ) -> Self {
        Self {
            execution_id,
            plugin_id,
            outcome: AuditOutcome::from(result),
            duration_ms,
            timestamp: Utc::now(),
        }
    }
}

/// 監査イベントの書き込み先
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent);
}

/// tracing へ構造化イベントとして出力する（デフォルト）
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: AuditEvent) {
        let plugin_id = event.plugin_id.as_deref().unwrap_or("-");
        match event.outcome {
            AuditOutcome::Success => info!(
                target: "plugin_sandbox::audit",
                execution_id = %event.execution_id,
                plugin_id,
                outcome = %event.outcome,
                duration_ms = event.duration_ms,
                "plugin execution completed"
            ),
            AuditOutcome::Failure(_) => warn!(
                target: "plugin_sandbox::audit",
                execution_id = %event.execution_id,
                plugin_id,
                outcome = %event.outcome,
                duration_ms = event.duration_ms,
                "plugin execution failed"
            ),
        }
    }
}

/// メモリ上に保持する（組み込み・テスト用）
#[derive(Debug, Clone, Default)]
pub struct MemoryAuditSink {
    events: Arc<RwLock<Vec<AuditEvent>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }

    pub async fn clear(&self) {
        self.events.write().await.clear();
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: AuditEvent) {
        self.events.write().await.push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_sink_records_events() {
        let sink = MemoryAuditSink::new();
        assert!(sink.is_empty().await);

        let ok = ExecutionResult::success(json!(1));
        let failed = ExecutionResult::failure(ErrorKind::Timeout, "too slow");
        sink.record(AuditEvent::new(Uuid::new_v4(), Some("a".to_string()), &ok, 3))
            .await;
        sink.record(AuditEvent::new(Uuid::new_v4(), None, &failed, 5))
            .await;

        let events = sink.events().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].outcome, AuditOutcome::Success);
        assert_eq!(events[1].outcome, AuditOutcome::Failure(ErrorKind::Timeout));
        assert_eq!(events[1].plugin_id, None);

        sink.clear().await;
        assert_eq!(sink.len().await, 0);
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(AuditOutcome::Success.to_string(), "success");
        assert_eq!(
            AuditOutcome::Failure(ErrorKind::InvalidManifest).to_string(),
            ErrorKind::InvalidManifest.to_string()
        );
    }
}
