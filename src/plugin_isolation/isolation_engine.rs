//! 隔離エンジン
//!
//! 各実行を専用スレッド上の QuickJS ランタイムで動かす。ランタイムはホストの
//! オブジェクトへの参照を一切持たず、ブリッジとして注入された関数だけが外部と接続する。
//!
//! - メモリ上限はランタイムのアロケータ上限として強制する
//! - 実行時間は割り込みハンドラで強制する（ゲストの制御フローに依存しない）
//! - ホスト側でも期限を監視し、期限切れの境界は破棄して終了を待つ

use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::ffi::CStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{oneshot, Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};
use uuid::Uuid;

use rquickjs::{qjs, CatchResultExt, CaughtError, Context, Ctx, Function, Persistent, Runtime, Value};

use crate::config::LimitsConfig;
use crate::plugin_isolation::bridge::{envelope, BridgeCall, BridgeError, BridgeSet};
use crate::plugin_isolation::marshal::{MarshalError, Marshaller};
use crate::plugin_isolation::types::ErrorKind;

/// スタックトレースに現れるプラグインソースの名前
const SCRIPT_NAME: &CStr = c"plugin.js";

/// 境界スレッドのスタックに上乗せする余裕
const THREAD_STACK_HEADROOM: usize = 2 * 1024 * 1024;

/// メモリ上限到達とみなす残量
const MEMORY_LIMIT_SLACK: u64 = 256 * 1024;

/// コンソール出力1件あたりの最大文字数
const MAX_CONSOLE_CHARS: usize = 4096;

/// 境界内で最初に評価されるプレリュード
///
/// ネイティブ関数を閉じ込めた上でグローバルから削除し、書き換え不能な
/// `fetch` / `fs` / `console` だけを公開する。
const PRELUDE: &str = r#"
(function (global) {
  'use strict';
  const nativeFetch = global.__sandbox_fetch;
  const nativeReadFile = global.__sandbox_read_file;
  const nativeWriteFile = global.__sandbox_write_file;
  const nativeLog = global.__sandbox_log;
  delete global.__sandbox_fetch;
  delete global.__sandbox_read_file;
  delete global.__sandbox_write_file;
  delete global.__sandbox_log;

  const parse = JSON.parse;
  const stringify = JSON.stringify;
  const freeze = Object.freeze;
  const defineProperty = Object.defineProperty;
  const toText = String;

  class PermissionDenied extends Error {
    constructor(message) {
      super(message);
      this.name = 'PermissionDenied';
    }
  }

  function settle(raw) {
    const reply = parse(raw);
    if (reply.ok) {
      return reply.value;
    }
    if (reply.kind === 'PermissionDenied') {
      throw new PermissionDenied(reply.message);
    }
    const error = new Error(reply.message);
    error.name = reply.kind;
    throw error;
  }

  function describe(value) {
    if (typeof value === 'string') {
      return value;
    }
    try {
      const text = stringify(value);
      return text === undefined ? toText(value) : text;
    } catch (_) {
      return toText(value);
    }
  }

  function logger(level) {
    return function (...args) {
      nativeLog(level, args.map(describe).join(' '));
    };
  }

  function define(name, value) {
    defineProperty(global, name, {
      value: freeze(value),
      writable: false,
      enumerable: false,
      configurable: false,
    });
  }

  define('PermissionDenied', PermissionDenied);
  define('fetch', function fetch(url) {
    return settle(nativeFetch(toText(url)));
  });
  define('fs', {
    readFile(path) {
      return settle(nativeReadFile(toText(path)));
    },
    writeFile(path) {
      return settle(nativeWriteFile(toText(path)));
    },
  });
  define('console', {
    log: logger('info'),
    info: logger('info'),
    debug: logger('debug'),
    warn: logger('warn'),
    error: logger('error'),
  });
})(globalThis);
"#;

/// 境界の失敗
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BoundaryError {
    /// メモリ上限・予算・スレッドなどの資源不足
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// 構文エラー
    #[error("{message}")]
    Compile { message: String, line: Option<u32> },

    /// 捕捉されなかった例外
    #[error("{message}")]
    Runtime {
        message: String,
        stack: Option<String>,
    },

    /// 実行期限切れ
    #[error("execution exceeded the {0} ms time limit")]
    Timeout(u64),

    /// 戻り値を JSON に変換できない
    #[error("{0}")]
    Unserializable(String),

    /// 破棄済みの境界を操作した
    #[error("isolation boundary has been disposed")]
    Disposed,

    /// エンジン内部の失敗
    #[error("isolation engine failure: {0}")]
    Internal(String),
}

impl BoundaryError {
    /// 実行結果の分類へ対応付ける
    pub fn kind(&self) -> ErrorKind {
        match self {
            BoundaryError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            BoundaryError::Compile { .. } => ErrorKind::CompileError,
            BoundaryError::Runtime { .. } => ErrorKind::RuntimeError,
            BoundaryError::Timeout(_) => ErrorKind::Timeout,
            BoundaryError::Unserializable(_) => ErrorKind::UnserializableResult,
            BoundaryError::Disposed | BoundaryError::Internal(_) => ErrorKind::RuntimeError,
        }
    }
}

/// ホスト全体のメモリ予算
///
/// 各境界のメモリ上限を KiB 単位のセマフォ許可として予約する。
/// 予約は境界スレッドがランタイムを解放した時点で返却される。
#[derive(Debug, Clone)]
pub struct MemoryBudget {
    semaphore: Arc<Semaphore>,
    total_kib: u64,
}

/// 予約済みのメモリ
#[derive(Debug)]
pub struct MemoryReservation {
    _permit: OwnedSemaphorePermit,
    bytes: u64,
}

impl MemoryReservation {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl MemoryBudget {
    pub fn new(total_bytes: u64) -> Self {
        let total_kib = (total_bytes / 1024).min(Semaphore::MAX_PERMITS as u64);
        Self {
            semaphore: Arc::new(Semaphore::new(total_kib as usize)),
            total_kib,
        }
    }

    /// 予約可能な残量
    pub fn available_bytes(&self) -> u64 {
        self.semaphore.available_permits() as u64 * 1024
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_kib * 1024
    }

    /// 予算から `bytes` を予約する。残量不足なら待たずに失敗する。
    pub fn try_reserve(&self, bytes: u64) -> Result<MemoryReservation, BoundaryError> {
        let kib = bytes.div_ceil(1024);
        if kib > self.total_kib {
            return Err(BoundaryError::ResourceExhausted(format!(
                "memory request of {} bytes exceeds the host budget of {} bytes",
                bytes,
                self.total_bytes()
            )));
        }
        let permits = u32::try_from(kib).map_err(|_| {
            BoundaryError::ResourceExhausted(format!("memory request of {} bytes is too large", bytes))
        })?;

        let permit = self
            .semaphore
            .clone()
            .try_acquire_many_owned(permits)
            .map_err(|_| {
                BoundaryError::ResourceExhausted(format!(
                    "memory budget exhausted: requested {} bytes, {} bytes available",
                    bytes,
                    self.available_bytes()
                ))
            })?;

        Ok(MemoryReservation {
            _permit: permit,
            bytes,
        })
    }
}

/// 境界スレッドとホストで共有する制御状態
#[derive(Debug, Default)]
struct BoundaryControl {
    cancelled: AtomicBool,
    interrupted: AtomicBool,
    disposed: AtomicBool,
    exited: AtomicBool,
    exit_notify: Notify,
    deadline: Mutex<Option<Instant>>,
}

impl BoundaryControl {
    fn deadline(&self) -> Option<Instant> {
        self.deadline.lock().ok().and_then(|deadline| *deadline)
    }

    fn set_deadline(&self, deadline: Option<Instant>) {
        if let Ok(mut slot) = self.deadline.lock() {
            *slot = deadline;
        }
    }

    fn deadline_passed(&self) -> bool {
        self.deadline()
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// 割り込みハンドラから呼ばれる
    fn should_interrupt(&self) -> bool {
        let expired = self.cancelled.load(Ordering::SeqCst) || self.deadline_passed();
        if expired {
            self.interrupted.store(true, Ordering::SeqCst);
        }
        expired
    }

    fn mark_exited(&self) {
        self.exited.store(true, Ordering::SeqCst);
        self.exit_notify.notify_one();
    }
}

/// パニック時を含め、スレッド終了を必ず通知する
struct ExitGuard(Arc<BoundaryControl>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.mark_exited();
    }
}

enum Command {
    Compile {
        unit_id: u64,
        code: String,
        timeout: Duration,
        reply: oneshot::Sender<Result<(), BoundaryError>>,
    },
    InstallBridges {
        bridges: Arc<BridgeSet>,
        reply: oneshot::Sender<Result<(), BoundaryError>>,
    },
    Run {
        unit_id: u64,
        timeout: Duration,
        reply: oneshot::Sender<Result<JsonValue, BoundaryError>>,
    },
    Shutdown,
}

/// コンパイル済みのコード
///
/// 生成した境界でのみ実行できる。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledUnit {
    unit_id: u64,
    boundary_id: Uuid,
}

impl CompiledUnit {
    pub fn boundary_id(&self) -> Uuid {
        self.boundary_id
    }
}

/// 境界の生成パラメータ
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    pub max_stack_bytes: u64,
    pub max_result_depth: usize,
    pub teardown_grace: Duration,
}

impl From<&LimitsConfig> for EngineOptions {
    fn from(limits: &LimitsConfig) -> Self {
        Self {
            max_stack_bytes: limits.max_stack_bytes,
            max_result_depth: limits.max_result_depth,
            teardown_grace: Duration::from_millis(limits.teardown_grace_millis),
        }
    }
}

/// 隔離エンジン
///
/// 境界の生成とメモリ予算の管理を行う。複数の実行から共有される。
#[derive(Debug, Clone)]
pub struct IsolationEngine {
    options: EngineOptions,
    budget: MemoryBudget,
}

impl IsolationEngine {
    pub fn new(options: EngineOptions, budget: MemoryBudget) -> Self {
        Self { options, budget }
    }

    pub fn from_limits(limits: &LimitsConfig) -> Self {
        Self::new(
            EngineOptions::from(limits),
            MemoryBudget::new(limits.memory_budget_bytes),
        )
    }

    pub fn budget(&self) -> &MemoryBudget {
        &self.budget
    }

    /// 新しい境界を生成する
    ///
    /// メモリ上限を予算から予約し、専用スレッド上にランタイムを構築する。
    pub async fn create(&self, memory_limit_bytes: u64) -> Result<BoundaryHandle, BoundaryError> {
        if memory_limit_bytes == 0 {
            return Err(BoundaryError::ResourceExhausted(
                "memory limit must be greater than zero".to_string(),
            ));
        }
        let reservation = self.budget.try_reserve(memory_limit_bytes)?;

        let id = Uuid::new_v4();
        let control = Arc::new(BoundaryControl::default());
        let (commands, receiver) = mpsc::channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let setup = WorkerSetup {
            boundary_id: id,
            memory_limit_bytes,
            max_stack_bytes: self.options.max_stack_bytes,
            max_result_depth: self.options.max_result_depth,
            control: control.clone(),
            reservation,
        };
        let stack_size = usize::try_from(self.options.max_stack_bytes)
            .unwrap_or(usize::MAX)
            .saturating_mul(2)
            .saturating_add(THREAD_STACK_HEADROOM);

        std::thread::Builder::new()
            .name(format!("sandbox-{}", id.simple()))
            .stack_size(stack_size)
            .spawn(move || worker_main(setup, receiver, ready_tx))
            .map_err(|e| {
                BoundaryError::ResourceExhausted(format!("cannot start isolation thread: {}", e))
            })?;

        let handle = BoundaryHandle {
            id,
            memory_limit_bytes,
            teardown_grace: self.options.teardown_grace,
            commands,
            control,
            next_unit: AtomicU64::new(1),
        };

        match ready_rx.await {
            Ok(Ok(())) => {
                debug!(boundary_id = %id, memory_limit_bytes, "isolation boundary created");
                Ok(handle)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(BoundaryError::Internal(
                "isolation thread exited during setup".to_string(),
            )),
        }
    }
}

/// 境界へのハンドル
///
/// ドロップ時に破棄される。`dispose` は何度呼んでもよい。
#[derive(Debug)]
pub struct BoundaryHandle {
    id: Uuid,
    memory_limit_bytes: u64,
    teardown_grace: Duration,
    commands: mpsc::Sender<Command>,
    control: Arc<BoundaryControl>,
    next_unit: AtomicU64,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::Compile { .. } => "Compile",
            Command::InstallBridges { .. } => "InstallBridges",
            Command::Run { .. } => "Run",
            Command::Shutdown => "Shutdown",
        };
        f.write_str(name)
    }
}

impl BoundaryHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit_bytes
    }

    pub fn is_disposed(&self) -> bool {
        self.control.disposed.load(Ordering::SeqCst)
    }

    /// 境界スレッドが終了済みか
    pub fn has_exited(&self) -> bool {
        self.control.exited.load(Ordering::SeqCst)
    }

    /// ソースをバイトコードへコンパイルする
    ///
    /// 構文解析のみでコードは一切評価しない。`timeout` を過ぎた場合は境界を破棄する。
    pub async fn compile(&self, code: &str, timeout: Duration) -> Result<CompiledUnit, BoundaryError> {
        let unit_id = self.next_unit.fetch_add(1, Ordering::SeqCst);
        let (reply, rx) = oneshot::channel();
        self.send(Command::Compile {
            unit_id,
            code: code.to_string(),
            timeout,
            reply,
        })?;
        self.receive_within(rx, timeout).await?;
        Ok(CompiledUnit {
            unit_id,
            boundary_id: self.id,
        })
    }

    /// ブリッジを注入する
    pub async fn install_bridges(&self, bridges: Arc<BridgeSet>) -> Result<(), BoundaryError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::InstallBridges { bridges, reply })?;
        self.receive(rx).await
    }

    /// コンパイル済みのコードを期限付きで実行し、戻り値を JSON で返す
    pub async fn run(
        &self,
        unit: &CompiledUnit,
        timeout: Duration,
    ) -> Result<JsonValue, BoundaryError> {
        if unit.boundary_id != self.id {
            return Err(BoundaryError::Internal(
                "compiled unit belongs to a different boundary".to_string(),
            ));
        }

        let (reply, rx) = oneshot::channel();
        self.send(Command::Run {
            unit_id: unit.unit_id,
            timeout,
            reply,
        })?;
        self.receive_within(rx, timeout).await
    }

    /// 境界を破棄する
    ///
    /// 実行中のコードには割り込みがかかり、スレッドはランタイムとメモリ予約を解放して終了する。
    pub fn dispose(&self) {
        if self.control.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.control.cancelled.store(true, Ordering::SeqCst);
        // スレッドが既に終了していれば送信は失敗するが問題ない
        let _ = self.commands.send(Command::Shutdown);
        debug!(boundary_id = %self.id, "isolation boundary disposed");
    }

    /// スレッドの終了を最大 `grace` だけ待つ
    pub async fn wait_for_exit(&self, grace: Duration) -> bool {
        if self.has_exited() {
            return true;
        }
        let notified = tokio::time::timeout(grace, self.control.exit_notify.notified()).await;
        notified.is_ok() || self.has_exited()
    }

    fn send(&self, command: Command) -> Result<(), BoundaryError> {
        if self.is_disposed() {
            return Err(BoundaryError::Disposed);
        }
        self.commands
            .send(command)
            .map_err(|_| BoundaryError::Disposed)
    }

    async fn receive<T>(
        &self,
        rx: oneshot::Receiver<Result<T, BoundaryError>>,
    ) -> Result<T, BoundaryError> {
        rx.await.unwrap_or_else(|_| {
            Err(BoundaryError::Internal(
                "isolation thread exited unexpectedly".to_string(),
            ))
        })
    }

    /// 期限付きで応答を待つ。期限切れなら境界を破棄し、終了を猶予の範囲で待つ。
    async fn receive_within<T>(
        &self,
        rx: oneshot::Receiver<Result<T, BoundaryError>>,
        timeout: Duration,
    ) -> Result<T, BoundaryError> {
        match tokio::time::timeout(timeout, self.receive(rx)).await {
            Ok(result) => result,
            Err(_) => {
                let millis = timeout.as_millis() as u64;
                warn!(boundary_id = %self.id, timeout_ms = millis, "execution deadline reached, tearing down boundary");
                self.dispose();
                if !self.wait_for_exit(self.teardown_grace).await {
                    warn!(
                        boundary_id = %self.id,
                        grace_ms = self.teardown_grace.as_millis() as u64,
                        "isolation thread did not exit within the teardown grace"
                    );
                }
                Err(BoundaryError::Timeout(millis))
            }
        }
    }
}

impl Drop for BoundaryHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}

struct WorkerSetup {
    boundary_id: Uuid,
    memory_limit_bytes: u64,
    max_stack_bytes: u64,
    max_result_depth: usize,
    control: Arc<BoundaryControl>,
    reservation: MemoryReservation,
}

/// 境界スレッドが所有するエンジン状態
///
/// 永続化した値はランタイムより先に解放する必要があるため、フィールド順に意味がある。
struct Worker {
    inspector: Persistent<Function<'static>>,
    context: Context,
    runtime: Runtime,
    control: Arc<BoundaryControl>,
    max_result_depth: usize,
}

fn worker_main(
    setup: WorkerSetup,
    commands: mpsc::Receiver<Command>,
    ready: oneshot::Sender<Result<(), BoundaryError>>,
) {
    let _exit = ExitGuard(setup.control.clone());
    let boundary_id = setup.boundary_id;

    let worker = match Worker::new(&setup) {
        Ok(worker) => worker,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    if ready.send(Ok(())).is_err() {
        return;
    }

    let mut units: HashMap<u64, Persistent<Value<'static>>> = HashMap::new();
    while let Ok(command) = commands.recv() {
        match command {
            Command::Compile {
                unit_id,
                code,
                timeout,
                reply,
            } => {
                let result = worker.compile(&code, timeout).map(|unit| {
                    units.insert(unit_id, unit);
                });
                let _ = reply.send(result);
            }
            Command::InstallBridges { bridges, reply } => {
                let _ = reply.send(worker.install_bridges(bridges));
            }
            Command::Run {
                unit_id,
                timeout,
                reply,
            } => {
                let result = match units.remove(&unit_id) {
                    Some(unit) => worker.run(unit, timeout),
                    None => Err(BoundaryError::Internal(format!(
                        "unknown compiled unit {}",
                        unit_id
                    ))),
                };
                let _ = reply.send(result);
            }
            Command::Shutdown => break,
        }
    }

    drop(units);
    drop(worker);
    // ランタイム解放後に予約を返却する
    drop(setup.reservation);
    debug!(boundary_id = %boundary_id, "isolation thread exited");
}

impl Worker {
    fn new(setup: &WorkerSetup) -> Result<Self, BoundaryError> {
        let runtime = Runtime::new().map_err(|e| {
            BoundaryError::ResourceExhausted(format!("cannot create engine runtime: {}", e))
        })?;
        runtime.set_memory_limit(usize::try_from(setup.memory_limit_bytes).unwrap_or(usize::MAX));
        runtime.set_max_stack_size(usize::try_from(setup.max_stack_bytes).unwrap_or(usize::MAX));

        let control = setup.control.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || control.should_interrupt())));

        let context = Context::full(&runtime).map_err(|e| {
            BoundaryError::ResourceExhausted(format!(
                "cannot provision a boundary within {} bytes: {}",
                setup.memory_limit_bytes, e
            ))
        })?;

        // プラグインコードが組み込みを書き換える前に検査関数を確保する
        let inspector = context
            .with(|ctx| Marshaller::inspector(&ctx).map(|inspect| Persistent::save(&ctx, inspect)))
            .map_err(|e| {
                BoundaryError::ResourceExhausted(format!(
                    "cannot provision a boundary within {} bytes: {}",
                    setup.memory_limit_bytes, e
                ))
            })?;

        Ok(Self {
            inspector,
            context,
            runtime,
            control: setup.control.clone(),
            max_result_depth: setup.max_result_depth,
        })
    }

    fn arm_deadline(&self, timeout: Duration) {
        self.control.interrupted.store(false, Ordering::SeqCst);
        self.control.set_deadline(Some(Instant::now() + timeout));
    }

    fn compile(
        &self,
        code: &str,
        timeout: Duration,
    ) -> Result<Persistent<Value<'static>>, BoundaryError> {
        self.arm_deadline(timeout);
        let millis = timeout.as_millis() as u64;

        let result = self.context.with(|ctx| {
            compile_script(&ctx, code)
                .catch(&ctx)
                .map(|unit| Persistent::save(&ctx, unit))
                .map_err(|caught| classify(&self.control, caught, Some(millis)))
        });

        self.control.set_deadline(None);
        result
    }

    fn install_bridges(&self, bridges: Arc<BridgeSet>) -> Result<(), BoundaryError> {
        let plugin_id = bridges.manifest().id().to_string();
        self.context.with(|ctx| {
            install_natives(&ctx, &bridges, &self.control, plugin_id)
                .and_then(|_| ctx.eval::<(), _>(PRELUDE))
                .catch(&ctx)
                .map_err(|caught| {
                    BoundaryError::Internal(format!("cannot install bridges: {}", caught))
                })
        })
    }

    fn run(
        &self,
        unit: Persistent<Value<'static>>,
        timeout: Duration,
    ) -> Result<JsonValue, BoundaryError> {
        self.arm_deadline(timeout);
        let millis = timeout.as_millis() as u64;

        let (result, threw_null) = self.context.with(|ctx| {
            let value = match unit
                .restore(&ctx)
                .and_then(|unit| eval_compiled(&ctx, unit))
                .catch(&ctx)
            {
                Ok(value) => value,
                Err(caught) => {
                    let threw_null = matches!(&caught, CaughtError::Value(value) if value.is_null());
                    return (Err(classify(&self.control, caught, Some(millis))), threw_null);
                }
            };

            let marshaller = match self.inspector.clone().restore(&ctx) {
                Ok(inspect) => Marshaller::new(inspect, self.max_result_depth),
                Err(e) => {
                    return (
                        Err(BoundaryError::Internal(format!("marshalling unavailable: {}", e))),
                        false,
                    )
                }
            };

            let result = marshaller.to_json(&value).map_err(|e| match e {
                MarshalError::Unserializable(message) => {
                    if self.control.interrupted.load(Ordering::SeqCst) {
                        BoundaryError::Timeout(millis)
                    } else {
                        BoundaryError::Unserializable(message)
                    }
                }
                MarshalError::Engine(err) => {
                    let failed: rquickjs::Result<()> = Err(err);
                    match failed.catch(&ctx) {
                        Err(caught) => classify(&self.control, caught, Some(millis)),
                        Ok(()) => BoundaryError::Internal("marshalling failed".to_string()),
                    }
                }
            });
            (result, false)
        });

        let result = match result {
            // 期限後に得られた値は部分的な結果として扱わない
            Ok(_) if self.control.deadline_passed() => Err(BoundaryError::Timeout(millis)),
            // 上限付近でのアロケーション失敗は例外オブジェクトすら作れず null が投げられる
            Err(BoundaryError::Runtime { .. }) if threw_null && self.near_memory_limit() => Err(
                BoundaryError::ResourceExhausted("memory limit exceeded".to_string()),
            ),
            other => other,
        };
        self.control.set_deadline(None);

        self.runtime.run_gc();
        result
    }

    /// `with` の外でのみ呼ぶこと（ランタイムのロックを取る）
    fn near_memory_limit(&self) -> bool {
        let usage = self.runtime.memory_usage();
        let limit = usage.malloc_limit.max(0) as u64;
        let used = usage.malloc_size.max(0) as u64;
        limit > 0 && used + MEMORY_LIMIT_SLACK >= limit
    }
}

/// ソースをグローバルスクリプトとしてバイトコードへコンパイルする
///
/// 構文解析のみを行い、コードは評価しない。
fn compile_script<'js>(ctx: &Ctx<'js>, source: &str) -> rquickjs::Result<Value<'js>> {
    // 入力の直後に NUL 終端が必要
    let mut input = Vec::with_capacity(source.len() + 1);
    input.extend_from_slice(source.as_bytes());
    input.push(0);
    let flags = (qjs::JS_EVAL_TYPE_GLOBAL | qjs::JS_EVAL_FLAG_COMPILE_ONLY) as i32;

    // SAFETY: `Context::with` の内側で呼ばれるためコンテキストはロック済み。
    // 入力とファイル名はどちらも NUL 終端されている。
    unsafe {
        let raw = qjs::JS_Eval(
            ctx.as_raw().as_ptr(),
            input.as_ptr().cast(),
            source.len() as _,
            SCRIPT_NAME.as_ptr(),
            flags,
        );
        value_or_exception(ctx, raw)
    }
}

/// コンパイル済みのバイトコードを評価し、スクリプトの完了値を返す
fn eval_compiled<'js>(ctx: &Ctx<'js>, unit: Value<'js>) -> rquickjs::Result<Value<'js>> {
    // SAFETY: JS_EvalFunction は渡した参照を消費するため、複製した参照を渡す。
    // `unit` 自身の参照はドロップ時に解放される。
    unsafe {
        let ctx_ptr = ctx.as_raw().as_ptr();
        let function = qjs::JS_DupValue(ctx_ptr, unit.as_raw());
        let raw = qjs::JS_EvalFunction(ctx_ptr, function);
        value_or_exception(ctx, raw)
    }
}

/// # Safety
/// `raw` は `ctx` 上で生成され、所有権を持つ値であること
unsafe fn value_or_exception<'js>(ctx: &Ctx<'js>, raw: qjs::JSValue) -> rquickjs::Result<Value<'js>> {
    if qjs::JS_IsException(raw) {
        // 例外は `catch` でコンテキストから取り出す
        return Err(rquickjs::Error::Exception);
    }
    Ok(Value::from_raw(ctx.clone(), raw))
}

fn install_natives<'js>(
    ctx: &Ctx<'js>,
    bridges: &Arc<BridgeSet>,
    control: &Arc<BoundaryControl>,
    plugin_id: String,
) -> rquickjs::Result<()> {
    let globals = ctx.globals();

    let (b, c) = (bridges.clone(), control.clone());
    globals.set(
        "__sandbox_fetch",
        Function::new(ctx.clone(), move |url: String| -> String {
            bridge_call(&b, &c, BridgeCall::Fetch { url })
        })?,
    )?;

    let (b, c) = (bridges.clone(), control.clone());
    globals.set(
        "__sandbox_read_file",
        Function::new(ctx.clone(), move |path: String| -> String {
            bridge_call(&b, &c, BridgeCall::ReadFile { path })
        })?,
    )?;

    let (b, c) = (bridges.clone(), control.clone());
    globals.set(
        "__sandbox_write_file",
        Function::new(ctx.clone(), move |path: String| -> String {
            bridge_call(&b, &c, BridgeCall::WriteFile { path })
        })?,
    )?;

    globals.set(
        "__sandbox_log",
        Function::new(ctx.clone(), move |level: String, message: String| {
            plugin_log(&plugin_id, &level, &message)
        })?,
    )?;

    Ok(())
}

fn bridge_call(bridges: &BridgeSet, control: &BoundaryControl, call: BridgeCall) -> String {
    if control.cancelled.load(Ordering::SeqCst) {
        return envelope(Err(BridgeError::DeadlineExceeded));
    }
    bridges.dispatch_blocking(call, control.deadline())
}

/// 境界内のコンソール出力をトレースへ流す
fn plugin_log(plugin_id: &str, level: &str, message: &str) {
    let message: String = message.chars().take(MAX_CONSOLE_CHARS).collect();
    debug!(target: "plugin_sandbox::plugin_output", plugin_id, level, "{}", message);
}

/// エンジンの例外を分類する
fn classify(control: &BoundaryControl, caught: CaughtError<'_>, timeout_millis: Option<u64>) -> BoundaryError {
    // 期限切れのブリッジ呼び出しが投げた例外もタイムアウトとして扱う
    if control.interrupted.load(Ordering::SeqCst) || control.deadline_passed() {
        return BoundaryError::Timeout(timeout_millis.unwrap_or_default());
    }

    match caught {
        CaughtError::Exception(exception) => {
            let name = exception
                .as_object()
                .get::<_, Option<String>>("name")
                .ok()
                .flatten();
            let message = exception.message().unwrap_or_default();
            let stack = exception.stack().filter(|s| !s.trim().is_empty());

            if is_out_of_memory(&message) {
                return BoundaryError::ResourceExhausted(format!(
                    "memory limit exceeded: {}",
                    message
                ));
            }

            match name.as_deref() {
                Some("SyntaxError") => BoundaryError::Compile {
                    line: stack.as_deref().and_then(line_from_stack),
                    message: format!("SyntaxError: {}", message),
                },
                Some(name) if !name.is_empty() => BoundaryError::Runtime {
                    message: format!("{}: {}", name, message),
                    stack,
                },
                _ => BoundaryError::Runtime { message, stack },
            }
        }
        CaughtError::Value(value) => BoundaryError::Runtime {
            message: format!("uncaught exception: {}", describe_value(&value)),
            stack: None,
        },
        CaughtError::Error(rquickjs::Error::Allocation) => {
            BoundaryError::ResourceExhausted("memory limit exceeded".to_string())
        }
        CaughtError::Error(err) => {
            let message = err.to_string();
            if is_out_of_memory(&message) {
                BoundaryError::ResourceExhausted(format!("memory limit exceeded: {}", message))
            } else {
                BoundaryError::Runtime {
                    message,
                    stack: None,
                }
            }
        }
    }
}

fn is_out_of_memory(message: &str) -> bool {
    message.contains("out of memory")
}

fn describe_value(value: &Value<'_>) -> String {
    if let Some(text) = value.as_string().and_then(|s| s.to_string().ok()) {
        return text;
    }
    if let Some(number) = value.as_number() {
        return number.to_string();
    }
    if let Some(flag) = value.as_bool() {
        return flag.to_string();
    }
    format!("{:?}", value.type_of())
}

/// スタックトレースの先頭フレームから行番号を取り出す
///
/// `at <eval> (eval_script:3:5)` や `at eval_script:3` のような形式を想定する。
fn line_from_stack(stack: &str) -> Option<u32> {
    stack.lines().find_map(|frame| {
        let location = frame.trim().rsplit(' ').next()?;
        let location = location.trim_start_matches('(').trim_end_matches(')');
        let mut parts = location.rsplit(':');
        let last: u32 = parts.next()?.parse().ok()?;
        match parts.next().and_then(|p| p.parse::<u32>().ok()) {
            // file:line:column
            Some(line) => Some(line),
            // file:line
            None => Some(last),
        }
    })
}
