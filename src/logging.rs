use anyhow::Result;
use std::fs;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingConfig;

/// ログファイル名のプレフィックス（日付が付与される）
const LOG_FILE_PREFIX: &str = "plugin-sandbox.log";

/// ログシステムを初期化
///
/// コンソールへは stderr に出力する（stdout は実行結果用）。
/// `directory` 指定時は日次ローテーションのファイルにも JSON で出力し、
/// そのフラッシュを保証するガードを返す。
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let env_filter = build_filter(&config.level);

    let console = if config.json {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed()
    };

    let (file_layer, guard) = match &config.directory {
        Some(dir) => {
            ensure_log_dir(dir)?;
            let (writer, guard) = non_blocking(rolling::daily(dir, LOG_FILE_PREFIX));
            let layer = fmt::layer().json().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console)
        .with(file_layer)
        .try_init()?;

    tracing::debug!(
        level = %config.level,
        json = config.json,
        directory = ?config.directory,
        "logging initialized"
    );

    Ok(guard)
}

/// `RUST_LOG` を優先し、なければ設定値、それも不正なら `info`
fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// ログディレクトリを確保
fn ensure_log_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
    }
    Ok(())
}
