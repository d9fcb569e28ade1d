use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::info;

use plugin_sandbox::logging;
use plugin_sandbox::plugin_isolation::validate_manifest_value;
use plugin_sandbox::{ExecutionLimits, PluginSandboxHost, SandboxConfig};

/// Capability-gated sandbox for untrusted JavaScript plugins
#[derive(Debug, Parser)]
#[command(name = "plugin-sandbox", version, about)]
struct Cli {
    /// 設定ファイル（TOML）
    #[arg(short, long, env = "PLUGIN_SANDBOX_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// プラグインコードを実行し、結果を JSON で出力する
    Run {
        /// マニフェスト（JSON）
        #[arg(long)]
        manifest: PathBuf,
        /// 実行するソースファイル
        #[arg(long, conflicts_with = "code", required_unless_present = "code")]
        file: Option<PathBuf>,
        /// 実行するソース（インライン）
        #[arg(long)]
        code: Option<String>,
        /// 実行時間上限（ミリ秒）
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// メモリ上限（バイト）
        #[arg(long)]
        memory_bytes: Option<u64>,
    },
    /// マニフェストを検証し、正規化した内容を出力する
    Validate {
        #[arg(long)]
        manifest: PathBuf,
    },
    /// サンプル設定を出力する
    SampleConfig,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    if let Command::SampleConfig = cli.command {
        print!("{}", SandboxConfig::sample_toml()?);
        return Ok(ExitCode::SUCCESS);
    }

    let config = SandboxConfig::load(cli.config.as_deref())?;
    let _guard = logging::init_logging(&config.logging)?;

    match cli.command {
        Command::Run {
            manifest,
            file,
            code,
            timeout_ms,
            memory_bytes,
        } => {
            let manifest = read_json(&manifest)?;
            let code = match (file, code) {
                (Some(path), _) => std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?,
                (None, Some(code)) => code,
                (None, None) => anyhow::bail!("either --file or --code is required"),
            };
            let limits = ExecutionLimits {
                memory_limit_bytes: memory_bytes,
                timeout_millis: timeout_ms,
            };

            let host = PluginSandboxHost::new(config)?;
            let result = host.execute_json(&code, manifest, Some(limits)).await;
            println!("{}", serde_json::to_string_pretty(&result)?);

            Ok(if result.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Validate { manifest } => match validate_manifest_value(read_json(&manifest)?) {
            Ok(validated) => {
                info!(plugin_id = %validated.id(), "manifest is valid");
                println!("{}", serde_json::to_string_pretty(&validated)?);
                Ok(ExitCode::SUCCESS)
            }
            Err(e) => {
                eprintln!("invalid manifest: {}", e);
                Ok(ExitCode::FAILURE)
            }
        },
        Command::SampleConfig => Ok(ExitCode::SUCCESS),
    }
}

fn read_json(path: &Path) -> Result<serde_json::Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("{} is not valid JSON", path.display()))
}
