//! Murex kernel runtime — the embedded code-execution side of the engine.
//!
//! A [`kernel::KernelRuntime`] wraps one embedded interpreter behind a small
//! state machine: serialized idempotent initialization, at-most-one in-flight
//! execute, streaming event fan-out, an input-request round trip, and an
//! interrupt protocol. The [`manager::KernelManager`] owns kernels keyed by
//! opaque id and hands them to the agent control plane through the
//! [`manager::KernelProvider`] trait.

pub mod interpreter;
pub mod kernel;
pub mod manager;
pub mod testing;

pub use interpreter::{Interpreter, InterpreterFactory, InterpreterIo, RunOutcome};
pub use kernel::{ExecutionOutcome, KernelId, KernelRuntime, KernelStatus};
pub use manager::{KernelManager, KernelProvider};
