//! マニフェストストア
//!
//! プラグインIDから登録済みのケイパビリティマニフェストを引く。

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::plugin_isolation::manifest::RawManifest;

/// マニフェストの参照先
#[async_trait]
pub trait ManifestStore: Send + Sync {
    async fn get(&self, plugin_id: &str) -> Option<RawManifest>;
}

/// メモリ上のマニフェストストア
#[derive(Debug, Clone, Default)]
pub struct InMemoryManifestStore {
    manifests: Arc<RwLock<HashMap<String, RawManifest>>>,
}

impl InMemoryManifestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登録する。同じIDの既存マニフェストは置き換えて返す。
    pub async fn put(&self, plugin_id: impl Into<String>, manifest: RawManifest) -> Option<RawManifest> {
        let plugin_id = plugin_id.into();
        debug!(plugin_id = %plugin_id, "manifest registered");
        self.manifests.write().await.insert(plugin_id, manifest)
    }

    pub async fn remove(&self, plugin_id: &str) -> Option<RawManifest> {
        self.manifests.write().await.remove(plugin_id)
    }

    pub async fn len(&self) -> usize {
        self.manifests.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.manifests.read().await.is_empty()
    }
}

#[async_trait]
impl ManifestStore for InMemoryManifestStore {
    async fn get(&self, plugin_id: &str) -> Option<RawManifest> {
        self.manifests.read().await.get(plugin_id).cloned()
    }
}
