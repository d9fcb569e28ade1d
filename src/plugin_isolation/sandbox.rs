//! プラグインサンドボックスホスト
//!
//! 1回の実行を端から端まで取りまとめる最上位のファサード。
//! マニフェスト検証 → 境界の生成 → ブリッジ注入 → コンパイル → 期限付き実行 → 破棄、
//! の順に進め、どの経路でも境界を破棄してから型付きの結果を返す。

use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SandboxConfig;
use crate::error::Result;
use crate::plugin_isolation::audit::{AuditEvent, AuditSink, TracingAuditSink};
use crate::plugin_isolation::bridge::{
    BridgeSet, FileBackend, HttpNetworkBackend, LocalFileBackend, NetworkBackend,
};
use crate::plugin_isolation::capability_broker::CapabilityBroker;
use crate::plugin_isolation::isolation_engine::{BoundaryError, BoundaryHandle, IsolationEngine};
use crate::plugin_isolation::manifest::{validate_manifest, CapabilityManifest, ManifestError, RawManifest};
use crate::plugin_isolation::store::{InMemoryManifestStore, ManifestStore};
use crate::plugin_isolation::types::{
    EffectiveLimits, ErrorKind, ExecutionLimits, ExecutionReport, ExecutionResult, ExecutionState,
};

/// 実行ごとの状態遷移を記録する
#[derive(Debug)]
struct StateTracker {
    execution_id: Uuid,
    current: ExecutionState,
    trail: Vec<ExecutionState>,
}

impl StateTracker {
    fn new(execution_id: Uuid) -> Self {
        Self {
            execution_id,
            current: ExecutionState::Created,
            trail: vec![ExecutionState::Created],
        }
    }

    /// 遷移する。許されない遷移は記録せずに `false` を返す。
    fn advance(&mut self, next: ExecutionState) -> bool {
        if !self.current.can_transition_to(next) {
            warn!(
                execution_id = %self.execution_id,
                from = ?self.current,
                to = ?next,
                "illegal execution state transition ignored"
            );
            return false;
        }
        self.current = next;
        self.trail.push(next);
        true
    }

    fn into_trail(self) -> Vec<ExecutionState> {
        self.trail
    }
}

/// [`PluginSandboxHost`] のビルダー
pub struct PluginSandboxHostBuilder {
    config: SandboxConfig,
    broker: CapabilityBroker,
    network: Option<Arc<dyn NetworkBackend>>,
    files: Option<Arc<dyn FileBackend>>,
    audit: Option<Arc<dyn AuditSink>>,
    store: Option<Arc<dyn ManifestStore>>,
}

impl PluginSandboxHostBuilder {
    fn new() -> Self {
        Self {
            config: SandboxConfig::default(),
            broker: CapabilityBroker::new(),
            network: None,
            files: None,
            audit: None,
            store: None,
        }
    }

    pub fn config(mut self, config: SandboxConfig) -> Self {
        self.config = config;
        self
    }

    pub fn network_backend(mut self, network: Arc<dyn NetworkBackend>) -> Self {
        self.network = Some(network);
        self
    }

    pub fn file_backend(mut self, files: Arc<dyn FileBackend>) -> Self {
        self.files = Some(files);
        self
    }

    pub fn audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn manifest_store(mut self, store: Arc<dyn ManifestStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Result<PluginSandboxHost> {
        self.config.validate()?;

        let network: Arc<dyn NetworkBackend> = match self.network {
            Some(network) => network,
            None => Arc::new(HttpNetworkBackend::new(&self.config.bridges)?),
        };
        let files = self.files.unwrap_or_else(|| Arc::new(LocalFileBackend));
        let audit = self.audit.unwrap_or_else(|| Arc::new(TracingAuditSink));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryManifestStore::new()));
        let engine = IsolationEngine::from_limits(&self.config.limits);

        info!(
            memory_budget_bytes = self.config.limits.memory_budget_bytes,
            default_timeout_ms = self.config.limits.default_timeout_millis,
            "plugin sandbox host initialized"
        );

        Ok(PluginSandboxHost {
            config: self.config,
            engine,
            broker: self.broker,
            network,
            files,
            audit,
            store,
        })
    }
}

/// プラグインサンドボックスホスト
///
/// 実行間で可変状態を共有しない。境界・ブリッジ・マニフェストはすべて
/// 1回の `execute` に閉じており、同時に何件でも実行できる。
pub struct PluginSandboxHost {
    config: SandboxConfig,
    engine: IsolationEngine,
    broker: CapabilityBroker,
    network: Arc<dyn NetworkBackend>,
    files: Arc<dyn FileBackend>,
    audit: Arc<dyn AuditSink>,
    store: Arc<dyn ManifestStore>,
}

impl std::fmt::Debug for PluginSandboxHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginSandboxHost")
            .field("config", &self.config)
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl PluginSandboxHost {
    /// 設定から既定のバックエンドでホストを構築する
    pub fn new(config: SandboxConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    pub fn builder() -> PluginSandboxHostBuilder {
        PluginSandboxHostBuilder::new()
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn engine(&self) -> &IsolationEngine {
        &self.engine
    }

    /// 要求された制限に既定値と上限を適用する
    ///
    /// メモリは上限超過を拒否し、実行時間は上限に切り詰める。
    pub fn resolve_limits(
        &self,
        requested: Option<ExecutionLimits>,
    ) -> std::result::Result<EffectiveLimits, BoundaryError> {
        let limits = &self.config.limits;
        let requested = requested.unwrap_or_default();

        let memory_limit_bytes = requested
            .memory_limit_bytes
            .unwrap_or(limits.default_memory_limit_bytes);
        if memory_limit_bytes == 0 {
            return Err(BoundaryError::ResourceExhausted(
                "memory limit must be greater than zero".to_string(),
            ));
        }
        if memory_limit_bytes > limits.max_memory_limit_bytes {
            return Err(BoundaryError::ResourceExhausted(format!(
                "requested memory limit of {} bytes exceeds the maximum of {} bytes",
                memory_limit_bytes, limits.max_memory_limit_bytes
            )));
        }

        let timeout_millis = requested
            .timeout_millis
            .unwrap_or(limits.default_timeout_millis)
            .clamp(1, limits.max_timeout_millis);

        Ok(EffectiveLimits {
            memory_limit_bytes,
            timeout: Duration::from_millis(timeout_millis),
        })
    }

    /// プラグインコードを実行する
    pub async fn execute(
        &self,
        code: &str,
        manifest: &RawManifest,
        limits: Option<ExecutionLimits>,
    ) -> ExecutionResult {
        self.execute_with_report(code, manifest, limits).await.result
    }

    /// 未検証の JSON マニフェストで実行する（構造エラーは `InvalidManifest`）
    pub async fn execute_json(
        &self,
        code: &str,
        manifest: Value,
        limits: Option<ExecutionLimits>,
    ) -> ExecutionResult {
        let manifest = RawManifest::from_value(manifest);
        self.execute_inner(code, manifest, limits).await.result
    }

    /// ストアに登録済みのマニフェストで実行する
    pub async fn execute_plugin(
        &self,
        plugin_id: &str,
        code: &str,
        limits: Option<ExecutionLimits>,
    ) -> ExecutionResult {
        let manifest = self.store.get(plugin_id).await.ok_or_else(|| {
            ManifestError::Shape(format!("no manifest registered for plugin '{}'", plugin_id))
        });
        self.execute_inner(code, manifest, limits).await.result
    }

    /// 実行し、状態遷移と所要時間を含む記録を返す
    pub async fn execute_with_report(
        &self,
        code: &str,
        manifest: &RawManifest,
        limits: Option<ExecutionLimits>,
    ) -> ExecutionReport {
        self.execute_inner(code, Ok(manifest.clone()), limits).await
    }

    async fn execute_inner(
        &self,
        code: &str,
        manifest: std::result::Result<RawManifest, ManifestError>,
        limits: Option<ExecutionLimits>,
    ) -> ExecutionReport {
        let execution_id = Uuid::new_v4();
        let started = Instant::now();
        let mut tracker = StateTracker::new(execution_id);
        let mut plugin_id = manifest
            .as_ref()
            .ok()
            .and_then(|raw| raw.display_id())
            .map(str::to_string);

        let mut boundary = None;
        let result = self
            .run_pipeline(
                execution_id,
                code,
                manifest,
                limits,
                &mut tracker,
                &mut boundary,
                &mut plugin_id,
            )
            .await;

        tracker.advance(if result.is_success() {
            ExecutionState::Succeeded
        } else {
            ExecutionState::Failed
        });

        // どの経路でも境界を破棄する
        if let Some(boundary) = boundary.take() {
            boundary.dispose();
        }
        tracker.advance(ExecutionState::Disposed);

        let duration = started.elapsed();
        match &result {
            ExecutionResult::Success { .. } => info!(
                execution_id = %execution_id,
                plugin_id = plugin_id.as_deref().unwrap_or("-"),
                duration_ms = duration.as_millis() as u64,
                "plugin execution succeeded"
            ),
            ExecutionResult::Failure { kind, message } => warn!(
                execution_id = %execution_id,
                plugin_id = plugin_id.as_deref().unwrap_or("-"),
                kind = %kind,
                duration_ms = duration.as_millis() as u64,
                "plugin execution failed: {}",
                message
            ),
        }

        self.audit
            .record(AuditEvent::new(
                execution_id,
                plugin_id.clone(),
                &result,
                duration.as_millis() as u64,
            ))
            .await;

        ExecutionReport {
            execution_id,
            plugin_id,
            result,
            states: tracker.into_trail(),
            duration,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_pipeline(
        &self,
        execution_id: Uuid,
        code: &str,
        manifest: std::result::Result<RawManifest, ManifestError>,
        limits: Option<ExecutionLimits>,
        tracker: &mut StateTracker,
        boundary_slot: &mut Option<BoundaryHandle>,
        plugin_id: &mut Option<String>,
    ) -> ExecutionResult {
        tracker.advance(ExecutionState::Validating);

        let manifest = match manifest.and_then(|raw| validate_manifest(&raw)) {
            Ok(manifest) => manifest,
            Err(e) => {
                debug!(execution_id = %execution_id, error = %e, "manifest rejected");
                return ExecutionResult::failure(ErrorKind::InvalidManifest, e.to_string());
            }
        };
        *plugin_id = Some(manifest.id().to_string());

        if code.len() as u64 > self.config.limits.max_code_bytes {
            return ExecutionResult::failure(
                ErrorKind::ResourceExhausted,
                format!(
                    "source of {} bytes exceeds the {} byte limit",
                    code.len(),
                    self.config.limits.max_code_bytes
                ),
            );
        }

        let limits = match self.resolve_limits(limits) {
            Ok(limits) => limits,
            Err(e) => return boundary_failure(e),
        };

        tracker.advance(ExecutionState::Provisioning);
        let boundary = match self.engine.create(limits.memory_limit_bytes).await {
            Ok(boundary) => boundary_slot.insert(boundary),
            Err(e) => return boundary_failure(e),
        };
        debug!(
            execution_id = %execution_id,
            plugin_id = %manifest.id(),
            boundary_id = %boundary.id(),
            memory_limit_bytes = limits.memory_limit_bytes,
            timeout_ms = limits.timeout.as_millis() as u64,
            "boundary provisioned"
        );

        if let Err(e) = boundary.install_bridges(self.bridge_set(manifest)).await {
            return boundary_failure(e);
        }

        let unit = match boundary.compile(code, limits.timeout).await {
            Ok(unit) => unit,
            Err(e) => return boundary_failure(e),
        };

        tracker.advance(ExecutionState::Running);
        match boundary.run(&unit, limits.timeout).await {
            Ok(value) => ExecutionResult::success(value),
            Err(e) => boundary_failure(e),
        }
    }

    fn bridge_set(&self, manifest: CapabilityManifest) -> Arc<BridgeSet> {
        Arc::new(BridgeSet::new(
            Arc::new(manifest),
            self.broker,
            self.network.clone(),
            self.files.clone(),
            &self.config.bridges,
            tokio::runtime::Handle::current(),
        ))
    }
}

fn boundary_failure(error: BoundaryError) -> ExecutionResult {
    let message = match &error {
        BoundaryError::Compile {
            message,
            line: Some(line),
        } => format!("{} (line {})", message, line),
        other => other.to_string(),
    };
    ExecutionResult::failure(error.kind(), message)
}
