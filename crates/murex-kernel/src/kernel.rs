//! Kernel runtime — state machine around one embedded interpreter.
//!
//! Lifecycle: `Unknown → Initializing → Active ⇄ Busy`, terminal
//! `Terminated` (set by the kernel manager). Initialization is idempotent
//! and serialized; at most one `execute` is in flight at a time; every
//! event a run produces is published on the kernel's bus, typed channel
//! first and wildcard sink after, carrying the cached parent header.

use crate::interpreter::{value_to_text, Interpreter, InterpreterIo, IoSink};
use murex_types::bus::EventBus;
use murex_types::config::{InitializeOptions, KernelLang, KernelTuning};
use murex_types::error::{MurexError, MurexResult};
use murex_types::event::{
    DisplayData, ExecuteErrorData, ExecuteResultData, ExecutionStalledData, InputRequestData,
    KernelEvent, KernelLifecycleData, KernelMessage, StreamData, StreamName,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Byte written into the interrupt buffer to request cancellation (SIGINT).
pub const INTERRUPT_BYTE: u8 = 2;

/// Opaque kernel identifier assigned by the kernel manager.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KernelId(String);

impl KernelId {
    pub(crate) fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KernelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kernel lifecycle state, read-only to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelStatus {
    /// Constructed, interpreter not booted.
    Unknown,
    /// An initialization is in flight.
    Initializing,
    /// Ready for work.
    Active,
    /// An `execute` call is in flight.
    Busy,
    /// Destroyed by the kernel manager.
    Terminated,
}

impl fmt::Display for KernelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            KernelStatus::Unknown => "unknown",
            KernelStatus::Initializing => "initializing",
            KernelStatus::Active => "active",
            KernelStatus::Busy => "busy",
            KernelStatus::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Return value of `execute`: a boolean success plus the structured result
/// or error. Execution failures live here, never in the `Err` channel.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub success: bool,
    /// Last-expression value, when there was one.
    pub result: Option<Value>,
    pub error: Option<ExecuteErrorData>,
}

/// One embedded interpreter behind the kernel state machine.
pub struct KernelRuntime {
    id: KernelId,
    lang: KernelLang,
    /// Swapped on restart; cloned out for each call.
    interpreter: RwLock<Arc<dyn Interpreter>>,
    bus: EventBus<KernelMessage>,
    status: Mutex<KernelStatus>,
    initialized: AtomicBool,
    /// Serializes initialization; concurrent callers observe one in-flight
    /// boot and retry after a failure.
    init_lock: tokio::sync::Mutex<()>,
    /// Held for the duration of `execute`; `try_lock` failure is the busy
    /// rejection.
    exec_gate: tokio::sync::Mutex<()>,
    execution_count: AtomicU64,
    parent_header: Mutex<Option<Value>>,
    interrupt_buffer: Mutex<Option<Arc<AtomicU8>>>,
    pending_input: Mutex<Option<oneshot::Sender<String>>>,
    tuning: KernelTuning,
}

impl KernelRuntime {
    /// Wrap an interpreter. The kernel starts `Unknown` and uninitialized.
    pub fn new(lang: KernelLang, interpreter: Arc<dyn Interpreter>, tuning: KernelTuning) -> Arc<Self> {
        let max_listeners = tuning.max_listeners;
        Arc::new(Self {
            id: KernelId::generate(),
            lang,
            interpreter: RwLock::new(interpreter),
            bus: EventBus::new(max_listeners),
            status: Mutex::new(KernelStatus::Unknown),
            initialized: AtomicBool::new(false),
            init_lock: tokio::sync::Mutex::new(()),
            exec_gate: tokio::sync::Mutex::new(()),
            execution_count: AtomicU64::new(0),
            parent_header: Mutex::new(None),
            interrupt_buffer: Mutex::new(None),
            pending_input: Mutex::new(None),
            tuning,
        })
    }

    pub fn id(&self) -> &KernelId {
        &self.id
    }

    pub fn lang(&self) -> KernelLang {
        self.lang
    }

    /// Event bus for this kernel. Subscribe with `on` / `on_any`.
    pub fn bus(&self) -> &EventBus<KernelMessage> {
        &self.bus
    }

    pub fn status(&self) -> KernelStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Count of successful expression results so far.
    pub fn execution_count(&self) -> u64 {
        self.execution_count.load(Ordering::SeqCst)
    }

    fn set_status(&self, status: KernelStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    fn interp(&self) -> Arc<dyn Interpreter> {
        Arc::clone(&self.interpreter.read().unwrap_or_else(|e| e.into_inner()))
    }

    fn lifecycle_data(&self) -> KernelLifecycleData {
        KernelLifecycleData {
            kernel_id: self.id.to_string(),
        }
    }

    /// Publish an event on the typed channel and the wildcard sink,
    /// stamped with the cached parent header.
    fn emit(&self, event: KernelEvent) {
        let parent = self
            .parent_header
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        self.bus.emit(&KernelMessage::new(event, parent));
    }

    /// Cache the parent header (when given) and make sure the interpreter
    /// is booted. Every public entry point funnels through here.
    async fn setup(&self, parent_header: Option<Value>) -> MurexResult<()> {
        if let Some(parent) = parent_header {
            *self
                .parent_header
                .lock()
                .unwrap_or_else(|e| e.into_inner()) = Some(parent);
        }
        self.initialize(None).await
    }

    /// Boot the interpreter. Idempotent and serialized: concurrent callers
    /// wait on a single in-flight boot; once complete, further calls are
    /// no-ops. A failed boot resets to `Unknown` and later calls retry.
    pub async fn initialize(&self, options: Option<InitializeOptions>) -> MurexResult<()> {
        if self.status() == KernelStatus::Terminated {
            return Err(MurexError::KernelTerminated);
        }
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        let _guard = self.init_lock.lock().await;
        // A boot that finished while this caller waited on the lock.
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.status() == KernelStatus::Terminated {
            return Err(MurexError::KernelTerminated);
        }

        self.set_status(KernelStatus::Initializing);
        let options = options.unwrap_or_default();
        match self.interp().boot(&options).await {
            Ok(()) => {
                self.initialized.store(true, Ordering::Release);
                self.set_status(KernelStatus::Active);
                info!(kernel = %self.id, lang = %self.lang, "Kernel initialized");
                self.emit(KernelEvent::KernelReady(self.lifecycle_data()));
                Ok(())
            }
            Err(e) => {
                self.set_status(KernelStatus::Unknown);
                warn!(kernel = %self.id, error = %e, "Kernel initialization failed");
                Err(e)
            }
        }
    }

    /// Install the shared interrupt byte used by the interrupt protocol.
    /// Exactly one writer (the host) and one reader (the interpreter).
    pub fn set_interrupt_buffer(&self, buffer: Arc<AtomicU8>) {
        self.interp().install_interrupt_buffer(Arc::clone(&buffer));
        *self
            .interrupt_buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(buffer);
    }

    /// Run `code` to completion.
    ///
    /// Output produced along the way is republished as events; the return
    /// value summarizes success. User-code failures come back as
    /// `success: false`, never as `Err` — the error channel is reserved for
    /// protocol misuse (busy kernel, terminated kernel, failed boot).
    pub async fn execute(
        self: &Arc<Self>,
        code: &str,
        parent_header: Option<Value>,
    ) -> MurexResult<ExecutionOutcome> {
        self.setup(parent_header).await?;

        let _gate = self
            .exec_gate
            .try_lock()
            .map_err(|_| MurexError::KernelBusy)?;

        self.set_status(KernelStatus::Busy);
        self.emit(KernelEvent::KernelBusy(self.lifecycle_data()));

        // Stall watchdog: fires once if the run outlives the threshold.
        let stall_ms = self.tuning.stall_timeout_ms;
        let watchdog_kernel = Arc::clone(self);
        let watchdog = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(stall_ms)).await;
            warn!(kernel = %watchdog_kernel.id, elapsed_ms = stall_ms, "Execution stalled");
            watchdog_kernel.emit(KernelEvent::ExecutionStalled(ExecutionStalledData {
                kernel_id: watchdog_kernel.id.to_string(),
                elapsed_ms: stall_ms,
            }));
        });

        let io = InterpreterIo::new(Arc::new(KernelSink {
            kernel: Arc::clone(self),
        }));
        let run = self.interp().run(code, io).await;
        watchdog.abort();

        // A run that ended while an input request was outstanding leaves a
        // dangling sender; drop it so nothing replies into the void.
        self.pending_input
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        let outcome = match run {
            Ok(outcome) if outcome.is_error() => {
                let ename = outcome.ename.unwrap_or_else(|| "Error".to_string());
                let evalue = outcome.evalue.unwrap_or_default();
                if ename == "KeyboardInterrupt" {
                    // Frontends render the interrupt banner from stderr.
                    self.emit(KernelEvent::Stream(StreamData {
                        name: StreamName::Stderr,
                        text: format!("KeyboardInterrupt: {evalue}\n"),
                    }));
                }
                let error = ExecuteErrorData {
                    ename,
                    evalue,
                    traceback: outcome.traceback,
                };
                self.emit(KernelEvent::ExecuteError(error.clone()));
                ExecutionOutcome {
                    success: false,
                    result: None,
                    error: Some(error),
                }
            }
            Ok(outcome) => {
                let mut result = None;
                if let Some(value) = outcome.value {
                    if !value.is_null() {
                        let count = self.execution_count.fetch_add(1, Ordering::SeqCst) + 1;
                        let mut data = Map::new();
                        data.insert(
                            "text/plain".to_string(),
                            Value::String(value_to_text(&value)),
                        );
                        self.emit(KernelEvent::ExecuteResult(ExecuteResultData {
                            execution_count: count,
                            data,
                            metadata: Map::new(),
                        }));
                        result = Some(value);
                    }
                }
                ExecutionOutcome {
                    success: true,
                    result,
                    error: None,
                }
            }
            Err(host) => {
                let error = ExecuteErrorData {
                    ename: host.name().to_string(),
                    evalue: host.to_string(),
                    traceback: vec!["No traceback available".to_string()],
                };
                self.emit(KernelEvent::ExecuteError(error.clone()));
                ExecutionOutcome {
                    success: false,
                    result: None,
                    error: Some(error),
                }
            }
        };

        self.set_status(KernelStatus::Active);
        self.emit(KernelEvent::KernelIdle(self.lifecycle_data()));
        Ok(outcome)
    }

    /// Run `code` and stream the events it publishes.
    ///
    /// Returns the lazy event sequence plus a handle resolving to the same
    /// summary `execute` would return. Yielded events are exactly those
    /// published during the call, in publication order, and all precede the
    /// terminal result.
    pub fn execute_stream(
        self: &Arc<Self>,
        code: &str,
        parent_header: Option<Value>,
    ) -> (
        UnboundedReceiverStream<KernelMessage>,
        JoinHandle<MurexResult<ExecutionOutcome>>,
    ) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<KernelMessage>();
        let subscription = self.bus.on_any(move |message| {
            let _ = tx.send(message.clone());
        });

        let kernel = Arc::clone(self);
        let code = code.to_string();
        let handle = tokio::spawn(async move {
            let result = kernel.execute(&code, parent_header).await;
            // Dropping the forwarding handler closes the stream.
            kernel.bus.off_any(subscription);
            result
        });

        (UnboundedReceiverStream::new(rx), handle)
    }

    /// Fulfill the most recent outstanding input request. A reply with no
    /// outstanding request is a no-op.
    pub fn input_reply(&self, value: impl Into<String>) {
        let sender = self
            .pending_input
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match sender {
            Some(tx) => {
                let _ = tx.send(value.into());
            }
            None => {
                warn!(kernel = %self.id, "input_reply with no outstanding input request; ignoring")
            }
        }
    }

    /// Request cancellation of the running `execute`.
    ///
    /// Never blocks on the run itself: the shared-byte protocol waits a
    /// bounded ~100 ms for acknowledgement, the cooperative hook returns
    /// immediately, and the last resort synthesizes the interrupt events a
    /// frontend expects. The in-flight `execute` still returns normally
    /// (with `success: false` when the interrupt landed).
    pub async fn interrupt(&self) -> bool {
        let buffer = self
            .interrupt_buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        if let Some(buffer) = buffer {
            if self.interp().supports_interrupt_buffer() {
                buffer.store(INTERRUPT_BYTE, Ordering::SeqCst);
                let deadline = self.tuning.interrupt_ack_timeout_ms;
                let mut waited = 0u64;
                while waited < deadline {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    waited += 10;
                    if buffer.load(Ordering::SeqCst) == 0 {
                        debug!(kernel = %self.id, waited_ms = waited, "Interrupt acknowledged");
                        self.emit(KernelEvent::ExecutionInterrupted(self.lifecycle_data()));
                        return true;
                    }
                }
                let cleared = buffer.load(Ordering::SeqCst) == 0;
                if !cleared {
                    warn!(kernel = %self.id, "Interrupt byte not acknowledged in time");
                }
                return cleared;
            }
        }

        if self.interp().interrupt().await {
            self.emit(KernelEvent::ExecutionInterrupted(self.lifecycle_data()));
            return true;
        }

        // No buffer, no hook: synthesize what a frontend expects to see.
        self.emit(KernelEvent::Stream(StreamData {
            name: StreamName::Stderr,
            text: "KeyboardInterrupt: execution interrupted by user\n".to_string(),
        }));
        self.emit(KernelEvent::ExecuteError(ExecuteErrorData {
            ename: "KeyboardInterrupt".to_string(),
            evalue: "execution interrupted by user".to_string(),
            traceback: Vec::new(),
        }));
        self.emit(KernelEvent::ExecutionInterrupted(self.lifecycle_data()));
        true
    }

    // -- Interpreter delegations -------------------------------------------
    // Each caches the parent header first, then passes through.

    pub async fn complete(
        &self,
        code: &str,
        cursor: usize,
        parent_header: Option<Value>,
    ) -> MurexResult<Value> {
        self.setup(parent_header).await?;
        self.interp().complete(code, cursor).await
    }

    pub async fn inspect(
        &self,
        code: &str,
        cursor: usize,
        detail: u8,
        parent_header: Option<Value>,
    ) -> MurexResult<Value> {
        self.setup(parent_header).await?;
        self.interp().inspect(code, cursor, detail).await
    }

    pub async fn is_complete(&self, code: &str, parent_header: Option<Value>) -> MurexResult<Value> {
        self.setup(parent_header).await?;
        self.interp().is_complete(code).await
    }

    pub async fn comm_info(
        &self,
        target: Option<&str>,
        parent_header: Option<Value>,
    ) -> MurexResult<Value> {
        self.setup(parent_header).await?;
        self.interp().comm_info(target).await
    }

    pub async fn comm_open(&self, payload: Value, parent_header: Option<Value>) -> MurexResult<Value> {
        self.setup(parent_header).await?;
        self.interp().comm_open(payload).await
    }

    pub async fn comm_msg(&self, payload: Value, parent_header: Option<Value>) -> MurexResult<Value> {
        self.setup(parent_header).await?;
        self.interp().comm_msg(payload).await
    }

    pub async fn comm_close(
        &self,
        payload: Value,
        parent_header: Option<Value>,
    ) -> MurexResult<Value> {
        self.setup(parent_header).await?;
        self.interp().comm_close(payload).await
    }

    // -- Manager hooks ------------------------------------------------------

    /// Terminal transition; only the kernel manager calls this.
    pub(crate) fn mark_terminated(&self) {
        self.set_status(KernelStatus::Terminated);
        self.initialized.store(false, Ordering::Release);
        self.pending_input
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.emit(KernelEvent::KernelTerminated(self.lifecycle_data()));
    }

    /// Swap in a fresh interpreter, preserving the id and the bus, and boot
    /// it. Execution count and parent header reset with the new runtime.
    pub(crate) async fn replace_interpreter(
        &self,
        interpreter: Arc<dyn Interpreter>,
        options: Option<InitializeOptions>,
    ) -> MurexResult<()> {
        let _guard = self.init_lock.lock().await;
        {
            let mut slot = self.interpreter.write().unwrap_or_else(|e| e.into_inner());
            *slot = interpreter;
        }
        self.initialized.store(false, Ordering::Release);
        self.execution_count.store(0, Ordering::SeqCst);
        *self
            .parent_header
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = None;
        self.set_status(KernelStatus::Initializing);

        let options = options.unwrap_or_default();
        match self.interp().boot(&options).await {
            Ok(()) => {
                self.initialized.store(true, Ordering::Release);
                self.set_status(KernelStatus::Active);
                info!(kernel = %self.id, "Kernel restarted");
                self.emit(KernelEvent::KernelRestarted(self.lifecycle_data()));
                Ok(())
            }
            Err(e) => {
                self.set_status(KernelStatus::Unknown);
                warn!(kernel = %self.id, error = %e, "Kernel restart failed");
                self.emit(KernelEvent::KernelUnrecoverable(self.lifecycle_data()));
                Err(e)
            }
        }
    }
}

/// Bus adapter handed to the interpreter for one run.
struct KernelSink {
    kernel: Arc<KernelRuntime>,
}

impl IoSink for KernelSink {
    fn emit_stream(&self, name: StreamName, text: String) {
        self.kernel.emit(KernelEvent::Stream(StreamData { name, text }));
    }

    fn emit_display(&self, data: DisplayData) {
        self.kernel.emit(KernelEvent::DisplayData(data));
    }

    fn emit_update_display(&self, data: DisplayData) {
        self.kernel.emit(KernelEvent::UpdateDisplayData(data));
    }

    fn emit_clear_output(&self, wait: bool) {
        self.kernel
            .emit(KernelEvent::ClearOutput(murex_types::event::ClearOutputData {
                wait,
            }));
    }

    fn request_input(
        &self,
        prompt: String,
        password: bool,
    ) -> MurexResult<oneshot::Receiver<String>> {
        let mut slot = self
            .kernel
            .pending_input
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return Err(MurexError::InputRequestPending);
        }
        let (tx, rx) = oneshot::channel();
        *slot = Some(tx);
        drop(slot);
        self.kernel
            .emit(KernelEvent::InputRequest(InputRequestData {
                prompt,
                password,
            }));
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockInterpreter, MockInterrupt};
    use murex_types::event::KernelEventKind;
    use std::sync::Mutex as StdMutex;

    fn kernel_with(mock: MockInterpreter) -> Arc<KernelRuntime> {
        KernelRuntime::new(KernelLang::Python, Arc::new(mock), KernelTuning::default())
    }

    fn collect_kinds(kernel: &Arc<KernelRuntime>) -> Arc<StdMutex<Vec<KernelEventKind>>> {
        let kinds = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&kinds);
        kernel.bus().on_any(move |message| {
            sink.lock().unwrap().push(message.event.kind());
        });
        kinds
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let mock = MockInterpreter::new(KernelLang::Python);
        let boots = mock.boot_counter();
        let kernel = kernel_with(mock);

        kernel.initialize(None).await.unwrap();
        kernel.initialize(None).await.unwrap();
        assert_eq!(boots.load(Ordering::SeqCst), 1);
        assert_eq!(kernel.status(), KernelStatus::Active);
        assert!(kernel.is_initialized());
    }

    #[tokio::test]
    async fn test_failed_initialize_retries() {
        let mock = MockInterpreter::new(KernelLang::Python).failing_boots(1, "no runtime");
        let boots = mock.boot_counter();
        let kernel = kernel_with(mock);

        assert!(kernel.initialize(None).await.is_err());
        assert_eq!(kernel.status(), KernelStatus::Unknown);
        assert!(!kernel.is_initialized());

        kernel.initialize(None).await.unwrap();
        assert_eq!(boots.load(Ordering::SeqCst), 2);
        assert_eq!(kernel.status(), KernelStatus::Active);
    }

    #[tokio::test]
    async fn test_execute_success_emits_result() {
        let kernel = kernel_with(MockInterpreter::new(KernelLang::Python));
        let results = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&results);
        kernel
            .bus()
            .on(KernelEventKind::ExecuteResult, move |message| {
                if let KernelEvent::ExecuteResult(data) = &message.event {
                    sink.lock().unwrap().push(data.clone());
                }
            });

        let outcome = kernel.execute("1+1", None).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.result, Some(serde_json::json!(2)));
        assert_eq!(kernel.execution_count(), 1);

        let results = results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].execution_count, 1);
        assert_eq!(results[0].data["text/plain"], "2");
    }

    #[tokio::test]
    async fn test_execute_error_emits_execute_error() {
        let kernel = kernel_with(MockInterpreter::new(KernelLang::Python));
        let kinds = collect_kinds(&kernel);

        let outcome = kernel.execute("raise ValueError: bad input", None).await.unwrap();
        assert!(!outcome.success);
        let error = outcome.error.unwrap();
        assert_eq!(error.ename, "ValueError");
        assert_eq!(error.evalue, "bad input");
        assert_eq!(kernel.execution_count(), 0);
        assert!(kinds
            .lock()
            .unwrap()
            .contains(&KernelEventKind::ExecuteError));
    }

    #[tokio::test]
    async fn test_unit_result_emits_no_execute_result() {
        let kernel = kernel_with(MockInterpreter::new(KernelLang::Python));
        let kinds = collect_kinds(&kernel);

        let outcome = kernel.execute("pass", None).await.unwrap();
        assert!(outcome.success);
        assert!(outcome.result.is_none());
        assert_eq!(kernel.execution_count(), 0);
        assert!(!kinds
            .lock()
            .unwrap()
            .contains(&KernelEventKind::ExecuteResult));
    }

    #[tokio::test]
    async fn test_busy_status_during_execute() {
        let kernel = kernel_with(MockInterpreter::new(KernelLang::Python));
        kernel.initialize(None).await.unwrap();

        let running = Arc::clone(&kernel);
        let handle = tokio::spawn(async move { running.execute("sleep 200", None).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(kernel.status(), KernelStatus::Busy);

        // A second execute while busy is rejected.
        let err = kernel.execute("1+1", None).await.unwrap_err();
        assert!(matches!(err, MurexError::KernelBusy));

        handle.await.unwrap().unwrap();
        assert_eq!(kernel.status(), KernelStatus::Active);
    }

    #[tokio::test]
    async fn test_execute_stream_yields_events_then_result() {
        use tokio_stream::StreamExt;

        let kernel = kernel_with(MockInterpreter::new(KernelLang::Python));
        kernel.initialize(None).await.unwrap();

        let (stream, handle) = kernel.execute_stream("print hello", None);
        let outcome = handle.await.unwrap().unwrap();
        assert!(outcome.success);

        let events: Vec<KernelMessage> = stream.collect().await;
        let kinds: Vec<KernelEventKind> = events.iter().map(|m| m.event.kind()).collect();
        let stream_pos = kinds
            .iter()
            .position(|k| *k == KernelEventKind::Stream)
            .unwrap();
        let idle_pos = kinds
            .iter()
            .position(|k| *k == KernelEventKind::KernelIdle)
            .unwrap();
        assert!(stream_pos < idle_pos);
        assert_eq!(kinds.first(), Some(&KernelEventKind::KernelBusy));
    }

    #[tokio::test]
    async fn test_input_round_trip() {
        let kernel = kernel_with(MockInterpreter::new(KernelLang::Python));
        kernel.initialize(None).await.unwrap();

        let prompts = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&prompts);
        let replier = Arc::clone(&kernel);
        kernel
            .bus()
            .on(KernelEventKind::InputRequest, move |message| {
                if let KernelEvent::InputRequest(data) = &message.event {
                    sink.lock().unwrap().push(data.prompt.clone());
                    replier.input_reply("blue");
                }
            });

        let outcome = kernel.execute("input favorite color?", None).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.result, Some(serde_json::json!("blue")));
        assert_eq!(prompts.lock().unwrap().as_slice(), ["favorite color?"]);
    }

    #[tokio::test]
    async fn test_input_reply_without_request_is_noop() {
        let kernel = kernel_with(MockInterpreter::new(KernelLang::Python));
        kernel.input_reply("nobody asked");
    }

    #[tokio::test]
    async fn test_interrupt_with_buffer() {
        let kernel = kernel_with(MockInterpreter::new(KernelLang::Python).interrupt_mode(MockInterrupt::Buffer));
        kernel.initialize(None).await.unwrap();
        let buffer = Arc::new(AtomicU8::new(0));
        kernel.set_interrupt_buffer(Arc::clone(&buffer));

        let running = Arc::clone(&kernel);
        let handle = tokio::spawn(async move { running.execute("sleep 5000", None).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(kernel.interrupt().await);
        let outcome = handle.await.unwrap().unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.error.unwrap().ename, "KeyboardInterrupt");
        assert_eq!(buffer.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_interrupt_cooperative() {
        let kernel = kernel_with(
            MockInterpreter::new(KernelLang::Python).interrupt_mode(MockInterrupt::Cooperative),
        );
        kernel.initialize(None).await.unwrap();

        let running = Arc::clone(&kernel);
        let handle = tokio::spawn(async move { running.execute("sleep 5000", None).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(kernel.interrupt().await);
        let outcome = handle.await.unwrap().unwrap();
        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn test_interrupt_fallback_synthesizes_events() {
        let kernel = kernel_with(MockInterpreter::new(KernelLang::Python));
        kernel.initialize(None).await.unwrap();

        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        kernel.bus().on_any(move |message| {
            sink.lock().unwrap().push(message.event.clone());
        });

        assert!(kernel.interrupt().await);

        let events = events.lock().unwrap();
        match &events[0] {
            KernelEvent::Stream(data) => {
                assert_eq!(data.name, StreamName::Stderr);
                assert!(data.text.starts_with("KeyboardInterrupt: "));
                assert!(data.text.ends_with('\n'));
            }
            other => panic!("expected stream event, got {other:?}"),
        }
        match &events[1] {
            KernelEvent::ExecuteError(data) => assert_eq!(data.ename, "KeyboardInterrupt"),
            other => panic!("expected execute_error event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_keyboard_interrupt_outcome_prefixes_stderr() {
        let kernel = kernel_with(MockInterpreter::new(KernelLang::Python));
        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        kernel.bus().on_any(move |message| {
            sink.lock().unwrap().push(message.event.clone());
        });

        let outcome = kernel
            .execute("raise KeyboardInterrupt: stopped", None)
            .await
            .unwrap();
        assert!(!outcome.success);

        let events = events.lock().unwrap();
        let stream_pos = events
            .iter()
            .position(|e| matches!(e, KernelEvent::Stream(d) if d.text == "KeyboardInterrupt: stopped\n"))
            .expect("stderr prefix missing");
        let error_pos = events
            .iter()
            .position(|e| matches!(e, KernelEvent::ExecuteError(_)))
            .unwrap();
        assert!(stream_pos < error_pos);
    }

    #[tokio::test]
    async fn test_parent_header_is_stamped() {
        let kernel = kernel_with(MockInterpreter::new(KernelLang::Python));
        let headers = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&headers);
        kernel.bus().on_any(move |message| {
            sink.lock().unwrap().push(message.parent_header.clone());
        });

        let parent = serde_json::json!({"msg_id": "m-7"});
        kernel.execute("1+1", Some(parent.clone())).await.unwrap();

        let headers = headers.lock().unwrap();
        assert!(!headers.is_empty());
        // Every message published during the run carries the header.
        assert!(headers
            .iter()
            .all(|h| h.as_ref() == Some(&parent)));
    }

    #[tokio::test]
    async fn test_stall_watchdog_fires() {
        let tuning = KernelTuning {
            stall_timeout_ms: 50,
            ..Default::default()
        };
        let kernel = KernelRuntime::new(
            KernelLang::Python,
            Arc::new(MockInterpreter::new(KernelLang::Python)),
            tuning,
        );
        kernel.initialize(None).await.unwrap();
        let kinds = collect_kinds(&kernel);

        kernel.execute("sleep 200", None).await.unwrap();
        assert!(kinds
            .lock()
            .unwrap()
            .contains(&KernelEventKind::ExecutionStalled));
    }

    #[tokio::test]
    async fn test_terminated_kernel_rejects_execute() {
        let kernel = kernel_with(MockInterpreter::new(KernelLang::Python));
        kernel.initialize(None).await.unwrap();
        kernel.mark_terminated();

        let err = kernel.execute("1+1", None).await.unwrap_err();
        assert!(matches!(err, MurexError::KernelTerminated));
    }

    #[tokio::test]
    async fn test_delegations_pass_through() {
        let kernel = kernel_with(MockInterpreter::new(KernelLang::Python));
        let completion = kernel.complete("pri", 3, None).await.unwrap();
        assert!(completion.get("matches").is_some());

        let status = kernel.is_complete("1+1", None).await.unwrap();
        assert_eq!(status["status"], "complete");
    }
}
