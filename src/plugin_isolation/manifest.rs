//! ケイパビリティマニフェスト
//!
//! プラグインごとの宣言的な権限記述（許可ドメイン一覧とファイルシステムモード）と、
//! その検証を提供する。検証済みの [`CapabilityManifest`] だけがブローカーに渡される。

use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::plugin_isolation::capability_broker::normalize_path;

/// プラグインIDの最大長
const MAX_ID_LEN: usize = 128;
/// ホスト名の最大長（RFC 1035）
const MAX_HOSTNAME_LEN: usize = 253;
/// ラベルの最大長
const MAX_LABEL_LEN: usize = 63;

/// マニフェスト検証エラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManifestError {
    /// 構造が不正（型の不一致、未知のフィールドなど）
    #[error("malformed manifest: {0}")]
    Shape(String),

    /// 必須フィールドの欠落
    #[error("missing required field: {0}")]
    MissingField(String),

    /// プラグインIDが不正
    #[error("invalid plugin id: {0}")]
    InvalidId(String),

    /// ファイルシステムモードが `none` / `read-only` 以外
    #[error("invalid filesystem mode '{0}' (expected 'none' or 'read-only')")]
    InvalidFilesystemMode(String),

    /// ドメインパターンが不正
    #[error("invalid network domain pattern '{pattern}': {reason}")]
    InvalidDomainPattern { pattern: String, reason: String },

    /// ルートパスが不正
    #[error("invalid filesystem root '{root}': {reason}")]
    InvalidRoot { root: String, reason: String },
}

/// 未検証のマニフェスト（呼び出し側やストアから受け取る形）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawManifest {
    /// プラグインID（省略時は実行ごとに生成）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// 表示名
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// 権限
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<RawPermissions>,
}

/// 未検証の権限記述
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawPermissions {
    /// 許可ドメインパターン
    #[serde(default)]
    pub network: Vec<String>,
    /// `none` または `read-only`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesystem: Option<String>,
    /// `read-only` のスコープとなるルート
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
}

impl RawManifest {
    /// 権限なしのマニフェスト
    pub fn deny_all(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            name: None,
            permissions: Some(RawPermissions {
                network: Vec::new(),
                filesystem: Some("none".to_string()),
                root: None,
            }),
        }
    }

    pub fn with_network<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let permissions = self.permissions.get_or_insert_with(RawPermissions::default);
        permissions.network = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_read_only_root(mut self, root: impl Into<String>) -> Self {
        let permissions = self.permissions.get_or_insert_with(RawPermissions::default);
        permissions.filesystem = Some("read-only".to_string());
        permissions.root = Some(root.into());
        self
    }

    /// JSON 値から読み込む（構造エラーは `ManifestError::Shape`）
    pub fn from_value(value: serde_json::Value) -> Result<Self, ManifestError> {
        serde_json::from_value(value).map_err(|e| ManifestError::Shape(e.to_string()))
    }

    /// JSON 文字列から読み込む
    pub fn from_json_str(json: &str) -> Result<Self, ManifestError> {
        serde_json::from_str(json).map_err(|e| ManifestError::Shape(e.to_string()))
    }

    /// 表示用のID（未検証）
    pub fn display_id(&self) -> Option<&str> {
        self.id.as_deref().filter(|id| !id.trim().is_empty())
    }
}

/// 許可ドメインパターン
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DomainPattern {
    /// 完全一致（`api.example.com`）
    Exact(String),
    /// サブドメイン一致（`*.example.com`、`example.com` 自体には一致しない）
    Wildcard(String),
}

impl DomainPattern {
    /// パターンを解析・正規化する
    pub fn parse(raw: &str) -> Result<Self, ManifestError> {
        let invalid = |reason: &str| ManifestError::InvalidDomainPattern {
            pattern: raw.to_string(),
            reason: reason.to_string(),
        };

        let lowered = raw.to_ascii_lowercase();
        let normalized = lowered.strip_suffix('.').unwrap_or(&lowered);
        if normalized.is_empty() {
            return Err(invalid("empty pattern"));
        }

        let (wildcard, hostname) = match normalized.strip_prefix("*.") {
            Some(rest) => (true, rest),
            None => (false, normalized),
        };
        validate_hostname(hostname).map_err(|reason| invalid(&reason))?;

        Ok(if wildcard {
            DomainPattern::Wildcard(hostname.to_string())
        } else {
            DomainPattern::Exact(hostname.to_string())
        })
    }

    /// 正規化済みホスト名がこのパターンに一致するか
    ///
    /// 比較はアンカー付き: `*.example.com` は `api.example.com` に一致するが
    /// `example.com.evil.org` や `evilexample.com` には一致しない。
    pub fn matches(&self, host: &str) -> bool {
        match self {
            DomainPattern::Exact(name) => host == name,
            DomainPattern::Wildcard(suffix) => host
                .strip_suffix(suffix.as_str())
                .and_then(|prefix| prefix.strip_suffix('.'))
                .is_some_and(|label| !label.is_empty()),
        }
    }
}

impl fmt::Display for DomainPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DomainPattern::Exact(name) => f.write_str(name),
            DomainPattern::Wildcard(suffix) => write!(f, "*.{}", suffix),
        }
    }
}

impl Serialize for DomainPattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// ファイルシステムアクセスモード
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum FilesystemAccess {
    /// アクセス不可
    None,
    /// `root` 配下の読み取りのみ
    ReadOnly { root: PathBuf },
}

impl FilesystemAccess {
    pub fn root(&self) -> Option<&Path> {
        match self {
            FilesystemAccess::None => None,
            FilesystemAccess::ReadOnly { root } => Some(root),
        }
    }
}

/// 検証済みケイパビリティマニフェスト
///
/// 検証後は不変。フィールドは読み取り専用アクセサからのみ参照できる。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapabilityManifest {
    id: String,
    name: String,
    network: Vec<DomainPattern>,
    filesystem: FilesystemAccess,
}

impl CapabilityManifest {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 許可ドメインパターン（重複除去済み、宣言順）
    pub fn network(&self) -> &[DomainPattern] {
        &self.network
    }

    pub fn filesystem(&self) -> &FilesystemAccess {
        &self.filesystem
    }
}

/// マニフェストを検証する
///
/// 構造と値域の両方を検査し、不正な値は黙って捨てずにマニフェスト全体を拒否する。
pub fn validate_manifest(raw: &RawManifest) -> Result<CapabilityManifest, ManifestError> {
    let id = match raw.id.as_deref() {
        Some(id) => validate_id(id)?,
        None => format!("anonymous-{}", Uuid::new_v4()),
    };
    let name = raw.name.clone().unwrap_or_else(|| id.clone());

    let permissions = raw
        .permissions
        .as_ref()
        .ok_or_else(|| ManifestError::MissingField("permissions".to_string()))?;

    let mut seen = HashSet::new();
    let mut network = Vec::with_capacity(permissions.network.len());
    for raw_pattern in &permissions.network {
        let pattern = DomainPattern::parse(raw_pattern)?;
        if seen.insert(pattern.clone()) {
            network.push(pattern);
        }
    }

    let mode = permissions
        .filesystem
        .as_deref()
        .ok_or_else(|| ManifestError::MissingField("permissions.filesystem".to_string()))?;
    let filesystem = match mode {
        "none" => FilesystemAccess::None,
        "read-only" => match permissions.root.as_deref() {
            Some(root) => FilesystemAccess::ReadOnly {
                root: validate_root(root)?,
            },
            None => {
                debug!(plugin_id = %id, "read-only filesystem without root, treating as none");
                FilesystemAccess::None
            }
        },
        other => return Err(ManifestError::InvalidFilesystemMode(other.to_string())),
    };

    Ok(CapabilityManifest {
        id,
        name,
        network,
        filesystem,
    })
}

/// JSON 値を直接検証する
pub fn validate_manifest_value(
    value: serde_json::Value,
) -> Result<CapabilityManifest, ManifestError> {
    validate_manifest(&RawManifest::from_value(value)?)
}

fn validate_id(id: &str) -> Result<String, ManifestError> {
    if id.trim().is_empty() {
        return Err(ManifestError::InvalidId("id must not be empty".to_string()));
    }
    if id.len() > MAX_ID_LEN {
        return Err(ManifestError::InvalidId(format!(
            "id exceeds {} bytes",
            MAX_ID_LEN
        )));
    }
    if id.chars().any(char::is_control) {
        return Err(ManifestError::InvalidId(
            "id contains control characters".to_string(),
        ));
    }
    Ok(id.to_string())
}

fn validate_root(root: &str) -> Result<PathBuf, ManifestError> {
    let invalid = |reason: &str| ManifestError::InvalidRoot {
        root: root.to_string(),
        reason: reason.to_string(),
    };

    if root.contains('\0') {
        return Err(invalid("contains NUL byte"));
    }
    let path = Path::new(root);
    if !path.is_absolute() {
        return Err(invalid("root must be an absolute path"));
    }
    Ok(normalize_path(path))
}

fn validate_hostname(hostname: &str) -> Result<(), String> {
    if hostname.len() > MAX_HOSTNAME_LEN {
        return Err(format!("hostname exceeds {} characters", MAX_HOSTNAME_LEN));
    }
    for label in hostname.split('.') {
        if label.is_empty() {
            return Err("empty label".to_string());
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(format!("label exceeds {} characters", MAX_LABEL_LEN));
        }
        if label == "*" || label.contains('*') {
            return Err("wildcard is only allowed as the leading '*.' label".to_string());
        }
        if !label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(format!("label '{}' contains invalid characters", label));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(format!("label '{}' starts or ends with '-'", label));
        }
    }
    Ok(())
}
