use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{Error, Result};

/// 環境変数のプレフィックス（例: `PLUGIN_SANDBOX__LIMITS__DEFAULT_TIMEOUT_MILLIS=2000`）
pub const ENV_PREFIX: &str = "PLUGIN_SANDBOX";

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub limits: LimitsConfig,
    pub bridges: BridgeConfig,
    pub logging: LoggingConfig,
}

/// 実行ごとのリソース制限とホスト全体の上限
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// 省略時のメモリ上限
    pub default_memory_limit_bytes: u64,
    /// 1実行で要求できるメモリ上限
    pub max_memory_limit_bytes: u64,
    /// 同時実行全体で予約できるメモリ量
    pub memory_budget_bytes: u64,
    /// 省略時の実行時間上限
    pub default_timeout_millis: u64,
    /// 要求できる実行時間の上限（超過分は切り詰める）
    pub max_timeout_millis: u64,
    /// タイムアウト後に境界の終了を待つ猶予
    pub teardown_grace_millis: u64,
    /// エンジンのネイティブスタック上限
    pub max_stack_bytes: u64,
    /// 受け付けるソースの最大サイズ
    pub max_code_bytes: u64,
    /// 戻り値のネストの最大深さ
    pub max_result_depth: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            default_memory_limit_bytes: 64 * MIB,
            max_memory_limit_bytes: 512 * MIB,
            memory_budget_bytes: 2048 * MIB,
            default_timeout_millis: 5_000,
            max_timeout_millis: 60_000,
            teardown_grace_millis: 50,
            max_stack_bytes: 512 * 1024,
            max_code_bytes: MIB,
            max_result_depth: 64,
        }
    }
}

/// ブリッジ（ネットワーク・ファイル）の設定
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub http_timeout_millis: u64,
    pub max_response_bytes: u64,
    pub max_file_bytes: u64,
    pub max_calls_per_execution: u32,
    pub user_agent: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            http_timeout_millis: 10_000,
            max_response_bytes: MIB,
            max_file_bytes: MIB,
            max_calls_per_execution: 256,
            user_agent: format!("plugin-sandbox/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// ログレベル / EnvFilter 指定 (trace, debug, info, warn, error)
    pub level: String,
    /// JSON 形式で出力
    pub json: bool,
    /// 指定時は日次ローテーションのファイルにも出力
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            directory: None,
        }
    }
}

impl SandboxConfig {
    /// デフォルト値 → 設定ファイル → 環境変数の順に読み込む
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = config::Config::builder();

        // デフォルト値を設定
        settings = settings.add_source(config::Config::try_from(&SandboxConfig::default())?);

        // 設定ファイル（指定時は必須、未指定時は既定の場所を試行）
        match path {
            Some(path) => {
                info!("Loading sandbox config: {}", path.display());
                settings = settings.add_source(config::File::from(path).required(true));
            }
            None => {
                for candidate in ["plugin-sandbox.toml", "config/plugin-sandbox.toml"] {
                    if Path::new(candidate).exists() {
                        info!("Loading sandbox config: {}", candidate);
                        settings = settings.add_source(config::File::with_name(candidate));
                        break;
                    }
                }
            }
        }

        // 環境変数で上書き
        settings = settings.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: SandboxConfig = settings.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// 値の整合性を検証
    pub fn validate(&self) -> Result<()> {
        let limits = &self.limits;
        let invalid = |msg: String| Err(Error::InvalidConfiguration(msg));

        if limits.default_memory_limit_bytes == 0 || limits.max_memory_limit_bytes == 0 {
            return invalid("memory limits must be non-zero".to_string());
        }
        if limits.default_memory_limit_bytes > limits.max_memory_limit_bytes {
            return invalid(format!(
                "default_memory_limit_bytes ({}) exceeds max_memory_limit_bytes ({})",
                limits.default_memory_limit_bytes, limits.max_memory_limit_bytes
            ));
        }
        if limits.max_memory_limit_bytes > limits.memory_budget_bytes {
            return invalid(format!(
                "max_memory_limit_bytes ({}) exceeds memory_budget_bytes ({})",
                limits.max_memory_limit_bytes, limits.memory_budget_bytes
            ));
        }
        if limits.default_timeout_millis == 0 || limits.max_timeout_millis == 0 {
            return invalid("timeouts must be non-zero".to_string());
        }
        if limits.default_timeout_millis > limits.max_timeout_millis {
            return invalid(format!(
                "default_timeout_millis ({}) exceeds max_timeout_millis ({})",
                limits.default_timeout_millis, limits.max_timeout_millis
            ));
        }
        if limits.max_stack_bytes == 0 || limits.max_code_bytes == 0 || limits.max_result_depth == 0
        {
            return invalid("stack, code and result depth limits must be non-zero".to_string());
        }
        if self.bridges.max_calls_per_execution == 0 {
            return invalid("bridges.max_calls_per_execution must be non-zero".to_string());
        }
        Ok(())
    }

    /// サンプル設定ファイルの内容を生成
    pub fn sample_toml() -> Result<String> {
        let body = toml::to_string_pretty(&SandboxConfig::default())
            .map_err(|e| Error::Internal(e.to_string()))?;

        Ok(format!(
            r#"# plugin-sandbox configuration
#
# plugin-sandbox.toml として保存してください
# 環境変数での上書きも可能です (例: {prefix}__LIMITS__DEFAULT_TIMEOUT_MILLIS=2000)

{body}
# [limits]
# default_memory_limit_bytes / default_timeout_millis = 呼び出し側が省略した場合の値
# max_memory_limit_bytes = これを超えるメモリ要求は ResourceExhausted
# memory_budget_bytes = 同時実行全体で予約できるメモリ量
# max_timeout_millis = これを超える実行時間の要求は切り詰め
#
# [logging]
# directory = 指定するとファイルにも出力 (日次ローテーション)
"#,
            prefix = ENV_PREFIX,
            body = body
        ))
    }
}
