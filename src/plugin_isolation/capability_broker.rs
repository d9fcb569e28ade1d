//! ケイパビリティブローカー
//!
//! 境界内からのブリッジ呼び出し（ネットワーク取得・ファイル読み取り）を許可するか否かを
//! 決定する唯一の権限者。判定は同期的かつ副作用なしで、I/O 自体は行わない。
//! 明示的に列挙されていないものはすべて拒否する。

use serde::Serialize;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use crate::plugin_isolation::manifest::{CapabilityManifest, FilesystemAccess};

/// 認可判定
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// 拒否理由
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DenyReason {
    /// マニフェストにネットワーク許可が一つもない
    NoNetworkGrant,
    /// 許可ドメインのいずれにも一致しない
    HostNotAllowed(String),
    /// ホスト名として解釈できない
    InvalidHost(String),
    /// ファイルシステムモードが `none`
    FilesystemDisabled,
    /// スコープ外のパス
    OutsideRoot(PathBuf),
    /// 書き込みは常に不可
    WriteNotPermitted,
    /// パスとして解釈できない
    InvalidPath(String),
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::NoNetworkGrant => write!(f, "network access is not granted"),
            DenyReason::HostNotAllowed(host) => {
                write!(f, "host '{}' is not in the network allow-list", host)
            }
            DenyReason::InvalidHost(host) => write!(f, "invalid host '{}'", host),
            DenyReason::FilesystemDisabled => write!(f, "filesystem access is not granted"),
            DenyReason::OutsideRoot(path) => {
                write!(f, "path '{}' is outside the permitted root", path.display())
            }
            DenyReason::WriteNotPermitted => write!(f, "filesystem writes are never permitted"),
            DenyReason::InvalidPath(path) => write!(f, "invalid path '{}'", path),
        }
    }
}

/// ケイパビリティブローカー
///
/// 状態を持たないため、複数の実行から同時に共有して呼び出せる。
#[derive(Debug, Clone, Copy, Default)]
pub struct CapabilityBroker;

impl CapabilityBroker {
    pub fn new() -> Self {
        Self
    }

    /// ネットワークアクセスを認可する
    pub fn authorize_network(&self, manifest: &CapabilityManifest, target_host: &str) -> Decision {
        let host = match normalize_host(target_host) {
            Some(host) => host,
            None => return Decision::Deny(DenyReason::InvalidHost(target_host.to_string())),
        };

        if manifest.network().is_empty() {
            return Decision::Deny(DenyReason::NoNetworkGrant);
        }

        if manifest.network().iter().any(|pattern| pattern.matches(&host)) {
            Decision::Allow
        } else {
            Decision::Deny(DenyReason::HostNotAllowed(host))
        }
    }

    /// ファイル読み取りを認可する（字句的な解決）
    ///
    /// 相対パスはスコープのルートを基準に解決する。`..` は解決してから判定するため、
    /// ルートを脱出するパスは拒否される。
    pub fn authorize_filesystem_read(&self, manifest: &CapabilityManifest, path: &Path) -> Decision {
        let root = match manifest.filesystem() {
            FilesystemAccess::None => return Decision::Deny(DenyReason::FilesystemDisabled),
            FilesystemAccess::ReadOnly { root } => root,
        };

        if has_nul(path) {
            return Decision::Deny(DenyReason::InvalidPath(path.display().to_string()));
        }

        let resolved = if path.is_absolute() {
            normalize_path(path)
        } else {
            normalize_path(&root.join(path))
        };

        if is_descendant(&resolved, root) {
            Decision::Allow
        } else {
            Decision::Deny(DenyReason::OutsideRoot(resolved))
        }
    }

    /// シンボリックリンク解決後のパスを認可する
    ///
    /// `resolved_root` と `resolved_target` はどちらも実ファイルシステム上で解決済みであること。
    pub fn authorize_resolved_read(
        &self,
        manifest: &CapabilityManifest,
        resolved_root: &Path,
        resolved_target: &Path,
    ) -> Decision {
        if matches!(manifest.filesystem(), FilesystemAccess::None) {
            return Decision::Deny(DenyReason::FilesystemDisabled);
        }

        if is_descendant(resolved_target, resolved_root) {
            Decision::Allow
        } else {
            Decision::Deny(DenyReason::OutsideRoot(resolved_target.to_path_buf()))
        }
    }

    /// ファイル書き込みを認可する（モードに関わらず常に拒否）
    pub fn authorize_filesystem_write(&self, _manifest: &CapabilityManifest, _path: &Path) -> Decision {
        Decision::Deny(DenyReason::WriteNotPermitted)
    }
}

/// パスを字句的に正規化する（`.` を除去し `..` を解決する）
///
/// ファイルシステムには触れない。ルートより上への `..` はルートに留まる。
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => normalized.push(prefix.as_os_str()),
            Component::RootDir => normalized.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            Component::Normal(part) => normalized.push(part),
        }
    }
    normalized
}

/// `path` が `root` の（自身を含まない）子孫か
fn is_descendant(path: &Path, root: &Path) -> bool {
    path != root && path.starts_with(root)
}

fn has_nul(path: &Path) -> bool {
    path.as_os_str().to_string_lossy().contains('\0')
}

/// 比較用にホスト名を正規化する
fn normalize_host(host: &str) -> Option<String> {
    let lowered = host.to_ascii_lowercase();
    let trimmed = lowered.strip_suffix('.').unwrap_or(&lowered);
    if trimmed.is_empty()
        || !trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return None;
    }
    Some(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin_isolation::manifest::{validate_manifest, RawManifest};

    fn manifest_with_network(patterns: &[&str]) -> CapabilityManifest {
        validate_manifest(&RawManifest::deny_all("net").with_network(patterns.iter().copied()))
            .unwrap()
    }

    fn manifest_with_root(root: &str) -> CapabilityManifest {
        validate_manifest(&RawManifest::deny_all("fs").with_read_only_root(root)).unwrap()
    }

    #[test]
    fn test_empty_allow_list_denies() {
        let broker = CapabilityBroker::new();
        let manifest = manifest_with_network(&[]);
        assert_eq!(
            broker.authorize_network(&manifest, "api.example.com"),
            Decision::Deny(DenyReason::NoNetworkGrant)
        );
    }

    #[test]
    fn test_exact_and_wildcard_hosts() {
        let broker = CapabilityBroker::new();
        let manifest = manifest_with_network(&["api.allowed.com", "*.example.com"]);

        assert!(broker.authorize_network(&manifest, "api.allowed.com").is_allowed());
        assert!(broker.authorize_network(&manifest, "API.Allowed.com.").is_allowed());
        assert!(broker.authorize_network(&manifest, "api.example.com").is_allowed());
        assert!(!broker.authorize_network(&manifest, "example.com").is_allowed());
        assert!(!broker.authorize_network(&manifest, "example.com.evil.org").is_allowed());
        assert!(!broker.authorize_network(&manifest, "evil.example").is_allowed());
        assert!(!broker.authorize_network(&manifest, "sub.api.allowed.com").is_allowed());
    }

    #[test]
    fn test_invalid_host_denied() {
        let broker = CapabilityBroker::new();
        let manifest = manifest_with_network(&["api.allowed.com"]);
        assert!(matches!(
            broker.authorize_network(&manifest, "api.allowed.com/evil"),
            Decision::Deny(DenyReason::InvalidHost(_))
        ));
        assert!(matches!(
            broker.authorize_network(&manifest, ""),
            Decision::Deny(DenyReason::InvalidHost(_))
        ));
    }

    #[test]
    fn test_filesystem_none_denies_every_path() {
        let broker = CapabilityBroker::new();
        let manifest = manifest_with_network(&[]);
        for path in ["/etc/passwd", "relative.txt", "/", "../x"] {
            assert_eq!(
                broker.authorize_filesystem_read(&manifest, Path::new(path)),
                Decision::Deny(DenyReason::FilesystemDisabled)
            );
        }
    }

    #[test]
    fn test_read_only_scope() {
        let broker = CapabilityBroker::new();
        let manifest = manifest_with_root("/srv/plugin");

        assert!(broker
            .authorize_filesystem_read(&manifest, Path::new("/srv/plugin/data.txt"))
            .is_allowed());
        assert!(broker
            .authorize_filesystem_read(&manifest, Path::new("notes/a.md"))
            .is_allowed());
        assert!(broker
            .authorize_filesystem_read(&manifest, Path::new("/srv/plugin/a/../b.txt"))
            .is_allowed());

        // ルート自身・兄弟ディレクトリ・脱出は拒否
        assert!(!broker
            .authorize_filesystem_read(&manifest, Path::new("/srv/plugin"))
            .is_allowed());
        assert!(!broker
            .authorize_filesystem_read(&manifest, Path::new("/srv/plugin2/x"))
            .is_allowed());
        assert_eq!(
            broker.authorize_filesystem_read(&manifest, Path::new("../../etc/passwd")),
            Decision::Deny(DenyReason::OutsideRoot(PathBuf::from("/etc/passwd")))
        );
        assert!(!broker
            .authorize_filesystem_read(&manifest, Path::new("/srv/plugin/../../etc/passwd"))
            .is_allowed());
    }

    #[test]
    fn test_writes_never_authorized() {
        let broker = CapabilityBroker::new();
        let manifest = manifest_with_root("/srv/plugin");
        assert_eq!(
            broker.authorize_filesystem_write(&manifest, Path::new("/srv/plugin/out.txt")),
            Decision::Deny(DenyReason::WriteNotPermitted)
        );
    }

    #[test]
    fn test_resolved_read() {
        let broker = CapabilityBroker::new();
        let manifest = manifest_with_root("/srv/plugin");
        assert!(broker
            .authorize_resolved_read(
                &manifest,
                Path::new("/real/plugin"),
                Path::new("/real/plugin/file.txt")
            )
            .is_allowed());
        assert!(!broker
            .authorize_resolved_read(&manifest, Path::new("/real/plugin"), Path::new("/etc/passwd"))
            .is_allowed());
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(Path::new("/a/./b/../c")), PathBuf::from("/a/c"));
        assert_eq!(normalize_path(Path::new("/../../etc")), PathBuf::from("/etc"));
        assert_eq!(normalize_path(Path::new("/a/b/")), PathBuf::from("/a/b"));
    }
}
