//! プラグイン隔離
//!
//! 信頼できないプラグインコードを、宣言されたケイパビリティの範囲内だけで実行する。
//! 境界はホストのグローバル・ファイル・ネットワーク・環境変数への参照を持たず、
//! 外部への到達はブローカーを通過するブリッジ経由に限られる。

pub mod audit;
pub mod bridge;
pub mod capability_broker;
pub mod isolation_engine;
pub mod manifest;
mod marshal;
pub mod sandbox;
pub mod store;
mod types;

pub use audit::{AuditEvent, AuditOutcome, AuditSink, MemoryAuditSink, TracingAuditSink};
pub use bridge::{
    BridgeCall, BridgeError, BridgeSet, FileBackend, HttpNetworkBackend, HttpResponse,
    LocalFileBackend, NetworkBackend,
};
pub use capability_broker::{CapabilityBroker, Decision, DenyReason};
pub use isolation_engine::{
    BoundaryError, BoundaryHandle, CompiledUnit, EngineOptions, IsolationEngine, MemoryBudget,
};
pub use manifest::{
    validate_manifest, validate_manifest_value, CapabilityManifest, DomainPattern,
    FilesystemAccess, ManifestError, RawManifest, RawPermissions,
};
pub use sandbox::{PluginSandboxHost, PluginSandboxHostBuilder};
pub use store::{InMemoryManifestStore, ManifestStore};
pub use types::{
    EffectiveLimits, ErrorKind, ExecutionLimits, ExecutionReport, ExecutionResult, ExecutionState,
};
