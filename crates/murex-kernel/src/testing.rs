//! Test support: a scriptable in-memory interpreter.
//!
//! `MockInterpreter` understands a tiny command language so tests can drive
//! every kernel path without a real runtime:
//!
//! - `1+1` — integer addition, evaluates to its sum
//! - `'text'` / `"text"` — a string literal
//! - `pass` (or empty) — the unit sentinel, no result
//! - `print <text>` — writes `<text>\n` to stdout
//! - `show <text>` — publishes a `display_data` payload
//! - `raise <Ename>: <message>` — an error outcome
//! - `input <prompt>` / `getpass <prompt>` — input round trip; evaluates to
//!   the reply
//! - `input2 <prompt>` — two overlapping input requests; exercises the
//!   single-slot rejection
//! - `sleep <ms>` — blocks cooperatively, honoring the configured interrupt
//!   mode

use crate::interpreter::{convert_native, Interpreter, InterpreterFactory, InterpreterIo, RunOutcome};
use async_trait::async_trait;
use murex_types::config::{InitializeOptions, KernelLang};
use murex_types::error::MurexResult;
use murex_types::event::DisplayData;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How the mock reacts to interrupts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MockInterrupt {
    /// Neither buffer nor cooperative hook; the kernel must synthesize.
    #[default]
    None,
    /// Polls the shared interrupt byte during `sleep`.
    Buffer,
    /// Exposes the cooperative `interrupt()` entry point.
    Cooperative,
}

/// Scriptable interpreter used across the workspace's tests.
pub struct MockInterpreter {
    lang: KernelLang,
    mode: MockInterrupt,
    boot_count: Arc<AtomicUsize>,
    /// Remaining boots that should fail.
    failing_boots: AtomicUsize,
    boot_error: String,
    last_boot: Mutex<Option<InitializeOptions>>,
    interrupted: AtomicBool,
    buffer: Mutex<Option<Arc<AtomicU8>>>,
}

impl MockInterpreter {
    pub fn new(lang: KernelLang) -> Self {
        Self {
            lang,
            mode: MockInterrupt::None,
            boot_count: Arc::new(AtomicUsize::new(0)),
            failing_boots: AtomicUsize::new(0),
            boot_error: String::new(),
            last_boot: Mutex::new(None),
            interrupted: AtomicBool::new(false),
            buffer: Mutex::new(None),
        }
    }

    /// Fail the next `count` boots with the given message.
    pub fn failing_boots(self, count: usize, message: impl Into<String>) -> Self {
        self.failing_boots.store(count, Ordering::SeqCst);
        Self {
            boot_error: message.into(),
            ..self
        }
    }

    pub fn interrupt_mode(self, mode: MockInterrupt) -> Self {
        Self { mode, ..self }
    }

    /// Shared boot counter, for idempotency assertions.
    pub fn boot_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.boot_count)
    }

    /// Options the most recent boot received.
    pub fn last_boot_options(&self) -> Option<InitializeOptions> {
        self.last_boot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn take_interrupt(&self) -> bool {
        match self.mode {
            MockInterrupt::Buffer => {
                let buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner()).clone();
                if let Some(buffer) = buffer {
                    if buffer.load(Ordering::SeqCst) != 0 {
                        buffer.store(0, Ordering::SeqCst);
                        return true;
                    }
                }
                false
            }
            MockInterrupt::Cooperative => self.interrupted.swap(false, Ordering::SeqCst),
            MockInterrupt::None => false,
        }
    }
}

fn eval_addition(code: &str) -> Option<i64> {
    let mut sum = 0i64;
    for part in code.split('+') {
        sum = sum.checked_add(part.trim().parse::<i64>().ok()?)?;
    }
    Some(sum)
}

fn string_literal(code: &str) -> Option<&str> {
    let bytes = code.as_bytes();
    if code.len() >= 2 {
        let first = bytes[0];
        if (first == b'\'' || first == b'"') && bytes[code.len() - 1] == first {
            return Some(&code[1..code.len() - 1]);
        }
    }
    None
}

#[async_trait]
impl Interpreter for MockInterpreter {
    fn lang(&self) -> KernelLang {
        self.lang
    }

    async fn boot(&self, options: &InitializeOptions) -> MurexResult<()> {
        self.boot_count.fetch_add(1, Ordering::SeqCst);
        *self.last_boot.lock().unwrap_or_else(|e| e.into_inner()) = Some(options.clone());
        if self.failing_boots.load(Ordering::SeqCst) > 0 {
            self.failing_boots.fetch_sub(1, Ordering::SeqCst);
            return Err(murex_types::MurexError::Interpreter(self.boot_error.clone()));
        }
        Ok(())
    }

    async fn run(&self, code: &str, io: InterpreterIo) -> MurexResult<RunOutcome> {
        let code = code.trim();

        if code.is_empty() || code == "pass" {
            return Ok(RunOutcome::ok(None));
        }

        if let Some(text) = code.strip_prefix("print ") {
            io.stdout(format!("{text}\n"));
            return Ok(RunOutcome::ok(None));
        }

        if let Some(detail) = code.strip_prefix("raise ") {
            let (ename, evalue) = match detail.split_once(':') {
                Some((name, message)) => (name.trim(), message.trim()),
                None => (detail.trim(), ""),
            };
            return Ok(RunOutcome::error(
                ename,
                evalue,
                vec![format!("{ename}: {evalue}")],
            ));
        }

        if let Some(ms) = code.strip_prefix("sleep ") {
            let total: u64 = ms.trim().parse().unwrap_or(0);
            let mut elapsed = 0u64;
            while elapsed < total {
                if self.take_interrupt() {
                    return Ok(RunOutcome::error(
                        "KeyboardInterrupt",
                        "execution interrupted by user",
                        Vec::new(),
                    ));
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
                elapsed += 5;
            }
            return Ok(RunOutcome::ok(None));
        }

        if let Some(prompt) = code.strip_prefix("input ") {
            let reply = io.input(prompt).await?;
            return Ok(RunOutcome::ok(Some(Value::String(reply))));
        }

        if let Some(prompt) = code.strip_prefix("input2 ") {
            // Two overlapping requests: the second must be rejected while
            // the first is still outstanding.
            let (first, second) = tokio::join!(io.input(prompt), io.input(prompt));
            let first = first?;
            return Ok(match second {
                Ok(second) => RunOutcome::ok(Some(json!({ "first": first, "second": second }))),
                Err(e) => RunOutcome::error("InputRequestPending", e.to_string(), Vec::new()),
            });
        }

        if let Some(prompt) = code.strip_prefix("getpass ") {
            let reply = io.getpass(prompt).await?;
            return Ok(RunOutcome::ok(Some(Value::String(reply))));
        }

        if let Some(text) = code.strip_prefix("show ") {
            let mut data = Map::new();
            data.insert("text/plain".to_string(), json!(text));
            io.display(DisplayData {
                data,
                metadata: Map::new(),
                transient: None,
            });
            return Ok(RunOutcome::ok(None));
        }

        if let Some(inner) = string_literal(code) {
            return Ok(RunOutcome::ok(Some(Value::String(inner.to_string()))));
        }

        if let Some(sum) = eval_addition(code) {
            return Ok(match convert_native(&sum) {
                Ok(value) => RunOutcome::ok(Some(value)),
                Err(error) => error,
            });
        }

        // Unknown statements execute to the unit sentinel.
        Ok(RunOutcome::ok(None))
    }

    fn supports_interrupt_buffer(&self) -> bool {
        self.mode == MockInterrupt::Buffer
    }

    fn install_interrupt_buffer(&self, buffer: Arc<AtomicU8>) {
        *self.buffer.lock().unwrap_or_else(|e| e.into_inner()) = Some(buffer);
    }

    async fn interrupt(&self) -> bool {
        if self.mode == MockInterrupt::Cooperative {
            self.interrupted.store(true, Ordering::SeqCst);
            return true;
        }
        false
    }

    async fn complete(&self, code: &str, cursor: usize) -> MurexResult<Value> {
        Ok(json!({
            "matches": [],
            "cursor_start": 0,
            "cursor_end": cursor,
            "code": code,
        }))
    }

    async fn inspect(&self, code: &str, _cursor: usize, detail: u8) -> MurexResult<Value> {
        Ok(json!({
            "found": false,
            "code": code,
            "detail_level": detail,
        }))
    }

    async fn is_complete(&self, _code: &str) -> MurexResult<Value> {
        Ok(json!({ "status": "complete" }))
    }

    async fn comm_info(&self, target: Option<&str>) -> MurexResult<Value> {
        Ok(json!({ "comms": {}, "target": target }))
    }

    async fn comm_open(&self, payload: Value) -> MurexResult<Value> {
        Ok(payload)
    }

    async fn comm_msg(&self, payload: Value) -> MurexResult<Value> {
        Ok(payload)
    }

    async fn comm_close(&self, payload: Value) -> MurexResult<Value> {
        Ok(payload)
    }
}

/// Factory producing [`MockInterpreter`]s, remembering the last one created
/// so tests can introspect boot options.
#[derive(Default)]
pub struct MockInterpreterFactory {
    mode: MockInterrupt,
    last_created: Mutex<Option<Arc<MockInterpreter>>>,
}

impl MockInterpreterFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_interrupt_mode(mode: MockInterrupt) -> Self {
        Self {
            mode,
            last_created: Mutex::new(None),
        }
    }

    /// The most recently created interpreter.
    pub fn last_created(&self) -> Option<Arc<MockInterpreter>> {
        self.last_created
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl InterpreterFactory for MockInterpreterFactory {
    fn create(&self, lang: KernelLang) -> MurexResult<Arc<dyn Interpreter>> {
        let interpreter = Arc::new(MockInterpreter::new(lang).interrupt_mode(self.mode));
        *self
            .last_created
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&interpreter));
        Ok(interpreter)
    }
}
