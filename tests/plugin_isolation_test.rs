//! プラグイン隔離のシナリオテスト

use async_trait::async_trait;
use plugin_sandbox::plugin_isolation::{
    BridgeError, ExecutionState, HttpResponse, MemoryAuditSink, NetworkBackend,
};
use plugin_sandbox::{ErrorKind, ExecutionLimits, ExecutionResult, PluginSandboxHost, RawManifest};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use url::Url;

/// 呼び出されたホストを記録するだけのネットワークバックエンド
#[derive(Default)]
struct RecordingNetwork {
    hosts: Mutex<Vec<String>>,
}

#[async_trait]
impl NetworkBackend for RecordingNetwork {
    async fn get(&self, url: &Url, _max_bytes: u64) -> Result<HttpResponse, BridgeError> {
        let host = url.host_str().unwrap_or_default().to_string();
        self.hosts.lock().unwrap().push(host.clone());
        Ok(HttpResponse {
            status: 200,
            ok: true,
            body: format!("hello from {}", host),
        })
    }
}

fn host_with(network: Arc<RecordingNetwork>) -> PluginSandboxHost {
    PluginSandboxHost::builder()
        .network_backend(network)
        .audit_sink(Arc::new(MemoryAuditSink::new()))
        .build()
        .unwrap()
}

fn host() -> PluginSandboxHost {
    host_with(Arc::new(RecordingNetwork::default()))
}

fn no_fs_manifest() -> RawManifest {
    RawManifest::from_value(json!({
        "id": "calc",
        "name": "Calculator",
        "permissions": {"network": [], "filesystem": "none"}
    }))
    .unwrap()
}

fn failure_message(result: &ExecutionResult) -> &str {
    match result {
        ExecutionResult::Failure { message, .. } => message,
        ExecutionResult::Success { .. } => panic!("expected failure, got {:?}", result),
    }
}

#[tokio::test]
async fn test_scenario_simple_addition() {
    let result = host().execute("1+1", &no_fs_manifest(), None).await;
    assert_eq!(result, ExecutionResult::success(json!(2)));
    assert_eq!(
        serde_json::to_value(&result).unwrap(),
        json!({"status": "success", "value": 2})
    );
}

#[tokio::test]
async fn test_scenario_require_is_unavailable() {
    let result = host()
        .execute(
            "require('fs').readFileSync('/etc/passwd')",
            &no_fs_manifest(),
            None,
        )
        .await;
    assert!(matches!(
        result.error_kind(),
        Some(ErrorKind::RuntimeError) | Some(ErrorKind::PermissionDenied)
    ));
    assert!(failure_message(&result).contains("require"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_scenario_fetch_to_unlisted_host_denied() {
    let network = Arc::new(RecordingNetwork::default());
    let manifest = RawManifest::deny_all("fetcher").with_network(["api.allowed.com"]);

    let result = host_with(network.clone())
        .execute("fetch('http://evil.example')", &manifest, None)
        .await;

    assert_eq!(result.error_kind(), Some(ErrorKind::RuntimeError));
    assert!(failure_message(&result).starts_with("PermissionDenied:"));
    // 拒否された呼び出しは I/O に到達しない
    assert!(network.hosts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_scenario_infinite_loop_times_out() {
    let report = host()
        .execute_with_report(
            "while(true){}",
            &no_fs_manifest(),
            Some(ExecutionLimits::new().with_timeout_millis(100)),
        )
        .await;

    assert_eq!(report.result.error_kind(), Some(ErrorKind::Timeout));
    assert_eq!(report.states.last(), Some(&ExecutionState::Disposed));
    assert!(report.states.contains(&ExecutionState::Failed));
}

#[tokio::test]
async fn test_scenario_syntax_error() {
    let result = host().execute("syntax(((", &no_fs_manifest(), None).await;
    assert_eq!(result.error_kind(), Some(ErrorKind::CompileError));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wrapper_escape_is_compile_error() {
    let network = Arc::new(RecordingNetwork::default());
    let manifest = RawManifest::deny_all("fetcher").with_network(["api.allowed.com"]);

    for code in [
        "}); throw new Error('ran during compile'); (function(){",
        "}); fetch('http://api.allowed.com/leak'); (function(){",
    ] {
        let result = host_with(network.clone()).execute(code, &manifest, None).await;
        assert_eq!(result.error_kind(), Some(ErrorKind::CompileError), "{} -> {:?}", code, result);
        assert!(!failure_message(&result).contains("ran during compile"));
    }
    // コンパイルだけではブリッジに到達しない
    assert!(network.hosts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_wrapper_escape_loop_is_bounded() {
    let started = Instant::now();
    let result = tokio::time::timeout(
        Duration::from_secs(3),
        host().execute(
            "}); while(true){} (function(){",
            &no_fs_manifest(),
            Some(ExecutionLimits::new().with_timeout_millis(200)),
        ),
    )
    .await
    .expect("execution must settle within its timeout");

    assert_eq!(result.error_kind(), Some(ErrorKind::CompileError));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_timeout_is_bounded() {
    let started = Instant::now();
    let result = host()
        .execute(
            "let i = 0; for (;;) { i++; }",
            &no_fs_manifest(),
            Some(ExecutionLimits::new().with_timeout_millis(200)),
        )
        .await;
    let elapsed = started.elapsed();

    assert_eq!(result.error_kind(), Some(ErrorKind::Timeout));
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_millis(600), "took {:?}", elapsed);
}

#[tokio::test]
async fn test_timeout_cannot_be_caught_by_plugin() {
    let result = host()
        .execute(
            "let caught = 0; for (;;) { try { while (true) {} } catch (e) { caught++; } }",
            &no_fs_manifest(),
            Some(ExecutionLimits::new().with_timeout_millis(100)),
        )
        .await;
    assert_eq!(result.error_kind(), Some(ErrorKind::Timeout));
}

#[tokio::test]
async fn test_no_ambient_environment() {
    let result = host()
        .execute(
            r#"[
                typeof process,
                typeof require,
                typeof std,
                typeof os,
                typeof Deno,
                typeof globalThis.env,
                typeof __sandbox_fetch,
                typeof __sandbox_read_file,
            ]"#,
            &no_fs_manifest(),
            None,
        )
        .await;
    assert_eq!(result, ExecutionResult::success(json!(vec!["undefined"; 8])));

    let result = host()
        .execute("process.env.HOME", &no_fs_manifest(), None)
        .await;
    assert_eq!(result.error_kind(), Some(ErrorKind::RuntimeError));
}

#[tokio::test]
async fn test_bridges_cannot_be_replaced() {
    let result = host()
        .execute(
            r#"
            try { fetch = function () { return 'hijacked'; }; } catch (e) {}
            try { fs.readFile = null; } catch (e) {}
            try { delete globalThis.console; } catch (e) {}
            [typeof fetch, typeof fs.readFile, typeof console.log, Object.isFrozen(fs)]
            "#,
            &no_fs_manifest(),
            None,
        )
        .await;
    assert_eq!(
        result,
        ExecutionResult::success(json!(["function", "function", "function", true]))
    );
}

#[tokio::test]
async fn test_unserializable_results_rejected() {
    for code in [
        "(function () { return 1; })",
        "Symbol('x')",
        "({ nested: undefined })",
        "0 / 0",
        "[1, 2, () => 3]",
        "new Date(0)",
        "new Map([['a', 1]])",
        "new Set([1, 2])",
        "/pattern/g",
        "new Uint8Array([1, 2, 3])",
        "class Point { constructor() { this.x = 1; } }; new Point()",
        "({ get secret() { return 42; } })",
        "({ [Symbol('key')]: 1 })",
        "({ when: new Date(0) })",
    ] {
        let result = host().execute(code, &no_fs_manifest(), None).await;
        assert_eq!(
            result.error_kind(),
            Some(ErrorKind::UnserializableResult),
            "{} -> {:?}",
            code,
            result
        );
    }
}

#[tokio::test]
async fn test_structured_results() {
    let result = host()
        .execute(
            "({ name: 'report', items: [1, 2.5, 'three', null, false], meta: { ok: true } })",
            &no_fs_manifest(),
            None,
        )
        .await;
    assert_eq!(
        result,
        ExecutionResult::success(json!({
            "name": "report",
            "items": [1, 2.5, "three", null, false],
            "meta": {"ok": true}
        }))
    );

    let result = host()
        .execute("let total = 0; for (const n of [1, 2, 3]) { total += n; }", &no_fs_manifest(), None)
        .await;
    assert!(result.is_success());
}

#[tokio::test]
async fn test_uncaught_error_carries_name_and_message() {
    let result = host()
        .execute("throw new RangeError('out of range')", &no_fs_manifest(), None)
        .await;
    assert_eq!(result.error_kind(), Some(ErrorKind::RuntimeError));
    assert_eq!(failure_message(&result), "RangeError: out of range");
}

#[tokio::test]
async fn test_memory_ceiling_enforced() {
    let result = host()
        .execute(
            "const chunks = []; for (;;) { chunks.push(new Array(1 << 16).fill(chunks.length)); }",
            &no_fs_manifest(),
            Some(
                ExecutionLimits::new()
                    .with_memory_limit(8 * 1024 * 1024)
                    .with_timeout_millis(10_000),
            ),
        )
        .await;
    assert_eq!(result.error_kind(), Some(ErrorKind::ResourceExhausted));
}

#[tokio::test]
async fn test_memory_request_above_maximum_rejected() {
    let host = host();
    let too_much = host.config().limits.max_memory_limit_bytes + 1;
    let report = host
        .execute_with_report(
            "1",
            &no_fs_manifest(),
            Some(ExecutionLimits::new().with_memory_limit(too_much)),
        )
        .await;
    assert_eq!(report.result.error_kind(), Some(ErrorKind::ResourceExhausted));
    // 境界は作られていない
    assert!(!report.states.contains(&ExecutionState::Provisioning));
}

#[tokio::test]
async fn test_invalid_manifests_rejected() {
    let host = host();
    let manifests = [
        json!({"id": "x", "permissions": {"network": [], "filesystem": "read-write"}}),
        json!({"id": "x", "permissions": {"network": ["bad host!"], "filesystem": "none"}}),
        json!({"id": "x", "permissions": {"network": ["*.*.example.com"], "filesystem": "none"}}),
        json!({"id": "x", "permissions": {"network": "api.example.com", "filesystem": "none"}}),
        json!({"id": "x"}),
        json!({"id": "x", "permissions": {"network": [], "filesystem": "read-only", "root": "relative/dir"}}),
        json!("not an object"),
    ];
    for manifest in manifests {
        let result = host.execute_json("1", manifest.clone(), None).await;
        assert_eq!(
            result.error_kind(),
            Some(ErrorKind::InvalidManifest),
            "{} -> {:?}",
            manifest,
            result
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_read_only_without_root_behaves_as_none() {
    let manifest = RawManifest::from_value(json!({
        "id": "reader",
        "permissions": {"network": [], "filesystem": "read-only"}
    }))
    .unwrap();
    let result = host()
        .execute(
            "try { fs.readFile('/etc/hostname'); 'read' } catch (e) { e.name }",
            &manifest,
            None,
        )
        .await;
    assert_eq!(result, ExecutionResult::success(json!("PermissionDenied")));
}
