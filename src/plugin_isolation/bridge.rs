//! ブリッジ
//!
//! 境界内に注入されるホスト関数の実体。すべての呼び出しは実 I/O の前に
//! [`CapabilityBroker`] を通過し、拒否された場合は `PermissionDenied` として境界内に返る。
//! I/O バックエンドはトレイトで差し替え可能。

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::config::BridgeConfig;
use crate::plugin_isolation::capability_broker::{normalize_path, CapabilityBroker, Decision, DenyReason};
use crate::plugin_isolation::manifest::CapabilityManifest;

/// ブリッジ呼び出しの失敗
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// ブローカーが拒否した
    #[error("{0}")]
    PermissionDenied(DenyReason),

    /// 引数が不正
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// I/O 失敗
    #[error("I/O error: {0}")]
    Io(String),

    /// 応答・ファイルが上限を超えた
    #[error("{0} exceeds the {1} byte limit")]
    TooLarge(String, u64),

    /// 実行あたりの呼び出し回数上限
    #[error("bridge call limit of {0} exceeded")]
    CallLimit(u32),

    /// 実行期限切れ
    #[error("execution deadline reached")]
    DeadlineExceeded,
}

impl BridgeError {
    /// 境界内で投げられる例外の `name`
    pub fn js_name(&self) -> &'static str {
        match self {
            BridgeError::PermissionDenied(_) => "PermissionDenied",
            BridgeError::InvalidRequest(_) => "TypeError",
            BridgeError::Io(_) => "IoError",
            BridgeError::TooLarge(..) | BridgeError::CallLimit(_) => "RangeError",
            BridgeError::DeadlineExceeded => "TimeoutError",
        }
    }
}

impl From<io::Error> for BridgeError {
    fn from(err: io::Error) -> Self {
        BridgeError::Io(err.to_string())
    }
}

/// HTTP 応答
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HttpResponse {
    pub status: u16,
    pub ok: bool,
    pub body: String,
}

/// ネットワーク I/O バックエンド
#[async_trait]
pub trait NetworkBackend: Send + Sync {
    /// `url` へ GET を発行する。リダイレクトは追従しないこと。
    async fn get(&self, url: &Url, max_bytes: u64) -> Result<HttpResponse, BridgeError>;
}

/// ファイル I/O バックエンド
#[async_trait]
pub trait FileBackend: Send + Sync {
    /// シンボリックリンクを解決した絶対パス
    async fn canonicalize(&self, path: &Path) -> Result<PathBuf, BridgeError>;

    /// UTF-8 テキストとして読み込む
    async fn read_to_string(&self, path: &Path, max_bytes: u64) -> Result<String, BridgeError>;
}

/// reqwest による HTTP バックエンド
#[derive(Debug, Clone)]
pub struct HttpNetworkBackend {
    client: reqwest::Client,
}

impl HttpNetworkBackend {
    pub fn new(config: &BridgeConfig) -> crate::error::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_millis(config.http_timeout_millis))
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl NetworkBackend for HttpNetworkBackend {
    async fn get(&self, url: &Url, max_bytes: u64) -> Result<HttpResponse, BridgeError> {
        let mut response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| BridgeError::Io(e.to_string()))?;

        if response.content_length().is_some_and(|len| len > max_bytes) {
            return Err(BridgeError::TooLarge("response body".to_string(), max_bytes));
        }

        let status = response.status();
        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| BridgeError::Io(e.to_string()))?
        {
            if (body.len() + chunk.len()) as u64 > max_bytes {
                return Err(BridgeError::TooLarge("response body".to_string(), max_bytes));
            }
            body.extend_from_slice(&chunk);
        }

        Ok(HttpResponse {
            status: status.as_u16(),
            ok: status.is_success(),
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }
}

/// tokio::fs によるファイルバックエンド
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileBackend;

#[async_trait]
impl FileBackend for LocalFileBackend {
    async fn canonicalize(&self, path: &Path) -> Result<PathBuf, BridgeError> {
        Ok(tokio::fs::canonicalize(path).await?)
    }

    async fn read_to_string(&self, path: &Path, max_bytes: u64) -> Result<String, BridgeError> {
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(BridgeError::Io(format!("'{}' is not a file", path.display())));
        }
        if metadata.len() > max_bytes {
            return Err(BridgeError::TooLarge(path.display().to_string(), max_bytes));
        }
        let bytes = tokio::fs::read(path).await?;
        String::from_utf8(bytes).map_err(|_| {
            BridgeError::Io(format!("'{}' is not valid UTF-8", path.display()))
        })
    }
}

/// 境界内から発行されるブリッジ呼び出し
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeCall {
    Fetch { url: String },
    ReadFile { path: String },
    WriteFile { path: String },
}

impl BridgeCall {
    fn name(&self) -> &'static str {
        match self {
            BridgeCall::Fetch { .. } => "fetch",
            BridgeCall::ReadFile { .. } => "fs.readFile",
            BridgeCall::WriteFile { .. } => "fs.writeFile",
        }
    }
}

/// 1回の実行に束縛されたブリッジ一式
///
/// マニフェスト・ブローカー・I/O バックエンドを保持する。実行間で共有されない。
pub struct BridgeSet {
    manifest: Arc<CapabilityManifest>,
    broker: CapabilityBroker,
    network: Arc<dyn NetworkBackend>,
    files: Arc<dyn FileBackend>,
    max_response_bytes: u64,
    max_file_bytes: u64,
    max_calls: u32,
    calls: AtomicU32,
    runtime: tokio::runtime::Handle,
}

impl BridgeSet {
    pub fn new(
        manifest: Arc<CapabilityManifest>,
        broker: CapabilityBroker,
        network: Arc<dyn NetworkBackend>,
        files: Arc<dyn FileBackend>,
        config: &BridgeConfig,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        Self {
            manifest,
            broker,
            network,
            files,
            max_response_bytes: config.max_response_bytes,
            max_file_bytes: config.max_file_bytes,
            max_calls: config.max_calls_per_execution,
            calls: AtomicU32::new(0),
            runtime,
        }
    }

    pub fn manifest(&self) -> &CapabilityManifest {
        &self.manifest
    }

    /// 実行済みのブリッジ呼び出し回数
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// ブリッジ呼び出しを実行する
    pub async fn dispatch(&self, call: &BridgeCall) -> Result<Value, BridgeError> {
        let count = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if count > self.max_calls {
            return Err(BridgeError::CallLimit(self.max_calls));
        }

        let result = match call {
            BridgeCall::Fetch { url } => self.fetch(url).await.map(|r| json!(r)),
            BridgeCall::ReadFile { path } => self.read_file(path).await.map(Value::String),
            BridgeCall::WriteFile { path } => self.write_file(path).map(|_| Value::Null),
        };

        match &result {
            Ok(_) => debug!(
                plugin_id = %self.manifest.id(),
                bridge = call.name(),
                "bridge call completed"
            ),
            Err(BridgeError::PermissionDenied(reason)) => warn!(
                plugin_id = %self.manifest.id(),
                bridge = call.name(),
                reason = %reason,
                "bridge call denied"
            ),
            Err(e) => debug!(
                plugin_id = %self.manifest.id(),
                bridge = call.name(),
                error = %e,
                "bridge call failed"
            ),
        }
        result
    }

    /// 境界スレッドから同期的に呼び出し、結果を JSON エンベロープで返す
    ///
    /// 期限までの残り時間で I/O を打ち切る。呼び出し元は tokio ランタイム外のスレッドであること。
    pub fn dispatch_blocking(&self, call: BridgeCall, deadline: Option<Instant>) -> String {
        let remaining = match deadline {
            Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) if !remaining.is_zero() => Some(remaining),
                _ => return envelope(Err(BridgeError::DeadlineExceeded)),
            },
            None => None,
        };

        let outcome = self.runtime.block_on(async {
            match remaining {
                Some(remaining) => tokio::time::timeout(remaining, self.dispatch(&call))
                    .await
                    .unwrap_or(Err(BridgeError::DeadlineExceeded)),
                None => self.dispatch(&call).await,
            }
        });
        envelope(outcome)
    }

    async fn fetch(&self, raw_url: &str) -> Result<HttpResponse, BridgeError> {
        let url = Url::parse(raw_url)
            .map_err(|e| BridgeError::InvalidRequest(format!("invalid URL '{}': {}", raw_url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(BridgeError::InvalidRequest(format!(
                "unsupported URL scheme '{}'",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| BridgeError::InvalidRequest(format!("URL '{}' has no host", raw_url)))?;

        if let Decision::Deny(reason) = self.broker.authorize_network(&self.manifest, host) {
            return Err(BridgeError::PermissionDenied(reason));
        }

        self.network.get(&url, self.max_response_bytes).await
    }

    async fn read_file(&self, raw_path: &str) -> Result<String, BridgeError> {
        let path = Path::new(raw_path);
        if let Decision::Deny(reason) = self.broker.authorize_filesystem_read(&self.manifest, path) {
            return Err(BridgeError::PermissionDenied(reason));
        }

        // 字句的に許可されたパスを、シンボリックリンク解決後にもう一度判定する
        let root = self
            .manifest
            .filesystem()
            .root()
            .ok_or(BridgeError::PermissionDenied(DenyReason::FilesystemDisabled))?;
        let lexical = normalize_path(&root.join(path));
        let resolved_root = self.files.canonicalize(root).await?;
        let resolved_target = self.files.canonicalize(&lexical).await?;
        if let Decision::Deny(reason) =
            self.broker
                .authorize_resolved_read(&self.manifest, &resolved_root, &resolved_target)
        {
            return Err(BridgeError::PermissionDenied(reason));
        }

        self.files
            .read_to_string(&resolved_target, self.max_file_bytes)
            .await
    }

    fn write_file(&self, raw_path: &str) -> Result<(), BridgeError> {
        match self
            .broker
            .authorize_filesystem_write(&self.manifest, Path::new(raw_path))
        {
            Decision::Deny(reason) => Err(BridgeError::PermissionDenied(reason)),
            // 書き込みバックエンドは存在しない
            Decision::Allow => Err(BridgeError::PermissionDenied(DenyReason::WriteNotPermitted)),
        }
    }
}

/// ブリッジ結果のエンベロープ
pub fn envelope(outcome: Result<Value, BridgeError>) -> String {
    let value = match outcome {
        Ok(value) => json!({"ok": true, "value": value}),
        Err(e) => json!({"ok": false, "kind": e.js_name(), "message": e.to_string()}),
    };
    value.to_string()
}
