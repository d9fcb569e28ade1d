//! Plugin Isolation Types
//!
//! サンドボックス実行の要求・結果・状態の型定義

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// 実行失敗の種別
///
/// `ExecutionResult::Failure.kind` として呼び出し側に返される。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// マニフェスト検証失敗（境界は作成されない）
    InvalidManifest,
    /// 要求されたメモリ上限を確保できない
    ResourceExhausted,
    /// プラグインソースの構文エラー
    CompileError,
    /// 境界内で捕捉されなかった例外
    RuntimeError,
    /// ブローカーがブリッジ呼び出しを拒否した
    PermissionDenied,
    /// 実行時間の上限超過
    Timeout,
    /// 戻り値をJSONに変換できない
    UnserializableResult,
}

impl ErrorKind {
    /// マニフェストや制限を直せば再試行で回復できるか
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ErrorKind::InvalidManifest | ErrorKind::ResourceExhausted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidManifest => "InvalidManifest",
            ErrorKind::ResourceExhausted => "ResourceExhausted",
            ErrorKind::CompileError => "CompileError",
            ErrorKind::RuntimeError => "RuntimeError",
            ErrorKind::PermissionDenied => "PermissionDenied",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::UnserializableResult => "UnserializableResult",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 実行結果
///
/// JSON では `{"status":"success","value":..}` または
/// `{"status":"error","kind":..,"message":..}` として表現される。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum ExecutionResult {
    /// 成功（シリアライズ可能な戻り値）
    #[serde(rename = "success")]
    Success { value: Value },
    /// 失敗
    #[serde(rename = "error")]
    Failure { kind: ErrorKind, message: String },
}

impl ExecutionResult {
    pub fn success(value: Value) -> Self {
        ExecutionResult::Success { value }
    }

    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        ExecutionResult::Failure {
            kind,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionResult::Success { .. })
    }

    /// 失敗時の種別
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            ExecutionResult::Success { .. } => None,
            ExecutionResult::Failure { kind, .. } => Some(*kind),
        }
    }

    /// 成功時の値
    pub fn value(&self) -> Option<&Value> {
        match self {
            ExecutionResult::Success { value } => Some(value),
            ExecutionResult::Failure { .. } => None,
        }
    }
}

/// 呼び出し側が要求するリソース制限
///
/// 省略された値にはホスト設定のデフォルトが適用される。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionLimits {
    /// メモリ上限（バイト）
    pub memory_limit_bytes: Option<u64>,
    /// 実行時間上限（ミリ秒）
    pub timeout_millis: Option<u64>,
}

impl ExecutionLimits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit_bytes = Some(bytes);
        self
    }

    pub fn with_timeout_millis(mut self, millis: u64) -> Self {
        self.timeout_millis = Some(millis);
        self
    }
}

/// 実際に適用されるリソース制限
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveLimits {
    pub memory_limit_bytes: u64,
    pub timeout: Duration,
}

/// 実行ごとの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionState {
    Created,
    Validating,
    Provisioning,
    Running,
    Succeeded,
    Failed,
    /// 終端状態
    Disposed,
}

impl ExecutionState {
    /// `self` から `next` への遷移が許されるか
    pub fn can_transition_to(&self, next: ExecutionState) -> bool {
        use ExecutionState::*;
        match (self, next) {
            (Disposed, _) => false,
            (_, Disposed) => true,
            (Created, Validating) => true,
            (Validating, Provisioning) | (Validating, Failed) => true,
            (Provisioning, Running) | (Provisioning, Failed) => true,
            (Running, Succeeded) | (Running, Failed) => true,
            _ => false,
        }
    }
}

/// 1回の `execute` 呼び出しの記録
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    /// 実行ID
    pub execution_id: Uuid,
    /// プラグインID（マニフェストが読めなかった場合は不明）
    pub plugin_id: Option<String>,
    /// 実行結果
    pub result: ExecutionResult,
    /// 通過した状態の列
    pub states: Vec<ExecutionState>,
    /// 所要時間
    pub duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_result_wire_format() {
        let ok = ExecutionResult::success(json!(2));
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({"status": "success", "value": 2})
        );

        let err = ExecutionResult::failure(ErrorKind::Timeout, "deadline exceeded");
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            json!({"status": "error", "kind": "Timeout", "message": "deadline exceeded"})
        );
    }

    #[test]
    fn test_limits_camel_case() {
        let limits: ExecutionLimits =
            serde_json::from_value(json!({"timeoutMillis": 100})).unwrap();
        assert_eq!(limits.timeout_millis, Some(100));
        assert_eq!(limits.memory_limit_bytes, None);
    }

    #[test]
    fn test_state_transitions() {
        use ExecutionState::*;
        assert!(Created.can_transition_to(Validating));
        assert!(Validating.can_transition_to(Failed));
        assert!(Running.can_transition_to(Disposed));
        assert!(Created.can_transition_to(Disposed));
        assert!(!Disposed.can_transition_to(Disposed));
        assert!(!Running.can_transition_to(Validating));
        assert!(!Succeeded.can_transition_to(Failed));
    }

    #[test]
    fn test_recoverable_kinds() {
        assert!(ErrorKind::ResourceExhausted.is_recoverable());
        assert!(!ErrorKind::CompileError.is_recoverable());
        assert!(!ErrorKind::Timeout.is_recoverable());
    }
}
