//! The embedded-interpreter contract.
//!
//! The engine is deliberately agnostic about the code-execution backend:
//! everything behind [`Interpreter`] — package loading, language bindings,
//! sandboxing — is someone else's problem. The kernel runtime drives the
//! trait and translates its outcomes into events.

use async_trait::async_trait;
use murex_types::config::{InitializeOptions, KernelLang};
use murex_types::error::{MurexError, MurexResult};
use murex_types::event::{DisplayData, StreamName};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::AtomicU8;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Outcome of running a block of user code.
///
/// An error is signalled by `status == "error"` or a populated
/// `ename`/`evalue` pair; the kernel treats the two spellings identically.
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    /// `"ok"` or `"error"`.
    pub status: String,
    pub ename: Option<String>,
    pub evalue: Option<String>,
    pub traceback: Vec<String>,
    /// Value of the last expression; `None` is the interpreter's unit
    /// sentinel and produces no `execute_result` event.
    pub value: Option<Value>,
}

impl RunOutcome {
    /// Successful run, optionally carrying a last-expression value.
    pub fn ok(value: Option<Value>) -> Self {
        Self {
            status: "ok".to_string(),
            value,
            ..Default::default()
        }
    }

    /// Failed run.
    pub fn error(
        ename: impl Into<String>,
        evalue: impl Into<String>,
        traceback: Vec<String>,
    ) -> Self {
        Self {
            status: "error".to_string(),
            ename: Some(ename.into()),
            evalue: Some(evalue.into()),
            traceback,
            value: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == "error" || self.ename.is_some() || self.evalue.is_some()
    }
}

/// Side-channel handed to the interpreter for the duration of one run.
///
/// Output emission goes straight onto the kernel's event bus; input
/// requests ride the kernel's single-slot reply protocol.
#[derive(Clone)]
pub struct InterpreterIo {
    sink: Arc<dyn IoSink>,
}

/// Kernel-side backing for [`InterpreterIo`].
pub(crate) trait IoSink: Send + Sync {
    fn emit_stream(&self, name: StreamName, text: String);
    fn emit_display(&self, data: DisplayData);
    fn emit_update_display(&self, data: DisplayData);
    fn emit_clear_output(&self, wait: bool);
    fn request_input(&self, prompt: String, password: bool)
        -> MurexResult<oneshot::Receiver<String>>;
}

impl InterpreterIo {
    pub(crate) fn new(sink: Arc<dyn IoSink>) -> Self {
        Self { sink }
    }

    /// Write to stdout.
    pub fn stdout(&self, text: impl Into<String>) {
        self.sink.emit_stream(StreamName::Stdout, text.into());
    }

    /// Write to stderr.
    pub fn stderr(&self, text: impl Into<String>) {
        self.sink.emit_stream(StreamName::Stderr, text.into());
    }

    /// Publish a rich display payload.
    pub fn display(&self, data: DisplayData) {
        self.sink.emit_display(data);
    }

    /// Update a previously published display payload.
    pub fn update_display(&self, data: DisplayData) {
        self.sink.emit_update_display(data);
    }

    /// Ask the frontend to clear output.
    pub fn clear_output(&self, wait: bool) {
        self.sink.emit_clear_output(wait);
    }

    /// Suspend on an `input()`-style prompt until the host replies.
    ///
    /// Only one request may be outstanding per kernel; a second call before
    /// the reply fails with `InputRequestPending`.
    pub async fn input(&self, prompt: &str) -> MurexResult<String> {
        let rx = self.sink.request_input(prompt.to_string(), false)?;
        rx.await.map_err(|_| MurexError::InputCancelled)
    }

    /// Like [`input`](Self::input) but the reply must not be echoed.
    pub async fn getpass(&self, prompt: &str) -> MurexResult<String> {
        let rx = self.sink.request_input(prompt.to_string(), true)?;
        rx.await.map_err(|_| MurexError::InputCancelled)
    }
}

/// An embedded interpreter able to run user code.
///
/// Implementations are not thread-safe internally — the kernel runtime
/// guarantees at most one `run` in flight per interpreter.
#[async_trait]
pub trait Interpreter: Send + Sync {
    /// Language this interpreter executes.
    fn lang(&self) -> KernelLang;

    /// Load the runtime. Invoked once by the kernel's serialized
    /// initialization; a failure leaves the kernel uninitialized and a
    /// later call retries.
    async fn boot(&self, options: &InitializeOptions) -> MurexResult<()>;

    /// Run user code to completion, reporting side effects through `io`.
    ///
    /// User-code failures belong in the returned [`RunOutcome`]; an `Err`
    /// here means the host/interpreter machinery itself failed.
    async fn run(&self, code: &str, io: InterpreterIo) -> MurexResult<RunOutcome>;

    /// Whether this interpreter polls an installed interrupt buffer.
    fn supports_interrupt_buffer(&self) -> bool {
        false
    }

    /// Install the shared interrupt byte the interpreter should poll.
    fn install_interrupt_buffer(&self, _buffer: Arc<AtomicU8>) {}

    /// Cooperative interrupt entry point. Returns false when unsupported.
    async fn interrupt(&self) -> bool {
        false
    }

    async fn complete(&self, _code: &str, _cursor: usize) -> MurexResult<Value> {
        Err(MurexError::Interpreter("complete is not supported".into()))
    }

    async fn inspect(&self, _code: &str, _cursor: usize, _detail: u8) -> MurexResult<Value> {
        Err(MurexError::Interpreter("inspect is not supported".into()))
    }

    async fn is_complete(&self, _code: &str) -> MurexResult<Value> {
        Err(MurexError::Interpreter("is_complete is not supported".into()))
    }

    async fn comm_info(&self, _target: Option<&str>) -> MurexResult<Value> {
        Err(MurexError::Interpreter("comm_info is not supported".into()))
    }

    async fn comm_open(&self, _payload: Value) -> MurexResult<Value> {
        Err(MurexError::Interpreter("comm_open is not supported".into()))
    }

    async fn comm_msg(&self, _payload: Value) -> MurexResult<Value> {
        Err(MurexError::Interpreter("comm_msg is not supported".into()))
    }

    async fn comm_close(&self, _payload: Value) -> MurexResult<Value> {
        Err(MurexError::Interpreter("comm_close is not supported".into()))
    }
}

/// Creates interpreters for the kernel manager, one per kernel.
pub trait InterpreterFactory: Send + Sync {
    fn create(&self, lang: KernelLang) -> MurexResult<Arc<dyn Interpreter>>;
}

/// Recursively convert an interpreter-native value into host-native JSON.
///
/// Maps become records, sequences become arrays, scalars pass through.
/// Conversion failures surface as an error outcome, never a panic.
pub fn convert_native<T: Serialize>(value: &T) -> Result<Value, RunOutcome> {
    serde_json::to_value(value)
        .map_err(|e| RunOutcome::error("ConversionError", e.to_string(), Vec::new()))
}

/// Render a last-expression value the way `execute_result` reports it:
/// strings verbatim, everything else as compact JSON.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
