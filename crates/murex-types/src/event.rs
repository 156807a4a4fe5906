//! Event types for the kernel and agent-manager buses.
//!
//! Both enums serialize to the wildcard-channel envelope `{type, data}`
//! (adjacently tagged). A `KernelMessage` pairs an event with the parent
//! header the kernel has cached, so every published message carries it.

use crate::bus::BusEvent;
use crate::model::ModelSettings;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Kernel events
// ---------------------------------------------------------------------------

/// Output stream name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamName {
    Stdout,
    Stderr,
}

/// Text written to stdout or stderr during an execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamData {
    pub name: StreamName,
    pub text: String,
}

/// Rich display payload keyed by MIME type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DisplayData {
    pub data: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transient: Option<Value>,
}

/// Value of the last expression of a successful execute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResultData {
    pub execution_count: u64,
    pub data: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Error raised by user code or the interpreter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteErrorData {
    pub ename: String,
    pub evalue: String,
    #[serde(default)]
    pub traceback: Vec<String>,
}

/// Request to clear previously displayed output.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ClearOutputData {
    #[serde(default)]
    pub wait: bool,
}

/// The interpreter is waiting on `input()` / `getpass()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputRequestData {
    pub prompt: String,
    /// True for `getpass`-style prompts; the reply must not be echoed.
    pub password: bool,
}

/// Comm channel traffic relayed from the interpreter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommData {
    pub comm_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_name: Option<String>,
    #[serde(default)]
    pub data: Value,
}

/// Kernel lifecycle marker carrying the kernel id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelLifecycleData {
    pub kernel_id: String,
}

/// Emitted by the watchdog when an execute outlives the stall threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStalledData {
    pub kernel_id: String,
    pub elapsed_ms: u64,
}

/// Everything a kernel can publish.
///
/// Serializes to `{"type": "<snake_case name>", "data": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum KernelEvent {
    Stream(StreamData),
    DisplayData(DisplayData),
    UpdateDisplayData(DisplayData),
    ExecuteResult(ExecuteResultData),
    ExecuteError(ExecuteErrorData),
    ClearOutput(ClearOutputData),
    InputRequest(InputRequestData),
    CommOpen(CommData),
    CommMsg(CommData),
    CommClose(CommData),
    KernelReady(KernelLifecycleData),
    KernelBusy(KernelLifecycleData),
    KernelIdle(KernelLifecycleData),
    ExecutionStalled(ExecutionStalledData),
    KernelUnrecoverable(KernelLifecycleData),
    ExecutionInterrupted(KernelLifecycleData),
    KernelRestarted(KernelLifecycleData),
    KernelTerminated(KernelLifecycleData),
}

/// Discriminant used as the typed subscription key on a kernel bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelEventKind {
    Stream,
    DisplayData,
    UpdateDisplayData,
    ExecuteResult,
    ExecuteError,
    ClearOutput,
    InputRequest,
    CommOpen,
    CommMsg,
    CommClose,
    KernelReady,
    KernelBusy,
    KernelIdle,
    ExecutionStalled,
    KernelUnrecoverable,
    ExecutionInterrupted,
    KernelRestarted,
    KernelTerminated,
}

impl KernelEvent {
    pub fn kind(&self) -> KernelEventKind {
        match self {
            KernelEvent::Stream(_) => KernelEventKind::Stream,
            KernelEvent::DisplayData(_) => KernelEventKind::DisplayData,
            KernelEvent::UpdateDisplayData(_) => KernelEventKind::UpdateDisplayData,
            KernelEvent::ExecuteResult(_) => KernelEventKind::ExecuteResult,
            KernelEvent::ExecuteError(_) => KernelEventKind::ExecuteError,
            KernelEvent::ClearOutput(_) => KernelEventKind::ClearOutput,
            KernelEvent::InputRequest(_) => KernelEventKind::InputRequest,
            KernelEvent::CommOpen(_) => KernelEventKind::CommOpen,
            KernelEvent::CommMsg(_) => KernelEventKind::CommMsg,
            KernelEvent::CommClose(_) => KernelEventKind::CommClose,
            KernelEvent::KernelReady(_) => KernelEventKind::KernelReady,
            KernelEvent::KernelBusy(_) => KernelEventKind::KernelBusy,
            KernelEvent::KernelIdle(_) => KernelEventKind::KernelIdle,
            KernelEvent::ExecutionStalled(_) => KernelEventKind::ExecutionStalled,
            KernelEvent::KernelUnrecoverable(_) => KernelEventKind::KernelUnrecoverable,
            KernelEvent::ExecutionInterrupted(_) => KernelEventKind::ExecutionInterrupted,
            KernelEvent::KernelRestarted(_) => KernelEventKind::KernelRestarted,
            KernelEvent::KernelTerminated(_) => KernelEventKind::KernelTerminated,
        }
    }
}

impl KernelEventKind {
    /// Wire name of the event type, as it appears in the envelope.
    pub fn as_str(&self) -> &'static str {
        match self {
            KernelEventKind::Stream => "stream",
            KernelEventKind::DisplayData => "display_data",
            KernelEventKind::UpdateDisplayData => "update_display_data",
            KernelEventKind::ExecuteResult => "execute_result",
            KernelEventKind::ExecuteError => "execute_error",
            KernelEventKind::ClearOutput => "clear_output",
            KernelEventKind::InputRequest => "input_request",
            KernelEventKind::CommOpen => "comm_open",
            KernelEventKind::CommMsg => "comm_msg",
            KernelEventKind::CommClose => "comm_close",
            KernelEventKind::KernelReady => "kernel_ready",
            KernelEventKind::KernelBusy => "kernel_busy",
            KernelEventKind::KernelIdle => "kernel_idle",
            KernelEventKind::ExecutionStalled => "execution_stalled",
            KernelEventKind::KernelUnrecoverable => "kernel_unrecoverable",
            KernelEventKind::ExecutionInterrupted => "execution_interrupted",
            KernelEventKind::KernelRestarted => "kernel_restarted",
            KernelEventKind::KernelTerminated => "kernel_terminated",
        }
    }
}

/// A kernel event paired with the parent header cached at publish time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelMessage {
    #[serde(flatten)]
    pub event: KernelEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_header: Option<Value>,
}

impl KernelMessage {
    pub fn new(event: KernelEvent, parent_header: Option<Value>) -> Self {
        Self {
            event,
            parent_header,
        }
    }
}

impl BusEvent for KernelMessage {
    type Kind = KernelEventKind;

    fn kind(&self) -> KernelEventKind {
        self.event.kind()
    }
}

// ---------------------------------------------------------------------------
// Agent-manager events
// ---------------------------------------------------------------------------

/// Everything the agent manager (and the model registry) can publish.
///
/// Serializes to `{"type": "AGENT_CREATED", "data": {...}}` and so on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ManagerEvent {
    AgentCreated {
        agent_id: String,
    },
    AgentDestroyed {
        agent_id: String,
    },
    AgentError {
        agent_id: String,
        error: String,
    },
    ModelAdded {
        id: String,
        settings: ModelSettings,
    },
    ModelUpdated {
        id: String,
        old: ModelSettings,
        new: ModelSettings,
    },
    ModelRemoved {
        id: String,
    },
}

/// Typed subscription key on the agent-manager bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManagerEventKind {
    AgentCreated,
    AgentDestroyed,
    AgentError,
    ModelAdded,
    ModelUpdated,
    ModelRemoved,
}

impl ManagerEvent {
    pub fn kind(&self) -> ManagerEventKind {
        match self {
            ManagerEvent::AgentCreated { .. } => ManagerEventKind::AgentCreated,
            ManagerEvent::AgentDestroyed { .. } => ManagerEventKind::AgentDestroyed,
            ManagerEvent::AgentError { .. } => ManagerEventKind::AgentError,
            ManagerEvent::ModelAdded { .. } => ManagerEventKind::ModelAdded,
            ManagerEvent::ModelUpdated { .. } => ManagerEventKind::ModelUpdated,
            ManagerEvent::ModelRemoved { .. } => ManagerEventKind::ModelRemoved,
        }
    }
}

impl BusEvent for ManagerEvent {
    type Kind = ManagerEventKind;

    fn kind(&self) -> ManagerEventKind {
        ManagerEvent::kind(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_event_envelope() {
        let event = KernelEvent::Stream(StreamData {
            name: StreamName::Stderr,
            text: "oops\n".to_string(),
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "stream");
        assert_eq!(value["data"]["name"], "stderr");
        assert_eq!(value["data"]["text"], "oops\n");
    }

    #[test]
    fn test_kernel_message_flattens_envelope() {
        let message = KernelMessage::new(
            KernelEvent::ClearOutput(ClearOutputData { wait: true }),
            Some(serde_json::json!({"msg_id": "m-1"})),
        );
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "clear_output");
        assert_eq!(value["data"]["wait"], true);
        assert_eq!(value["parent_header"]["msg_id"], "m-1");
    }

    #[test]
    fn test_kernel_event_kind_names() {
        assert_eq!(KernelEventKind::ExecuteResult.as_str(), "execute_result");
        assert_eq!(
            KernelEventKind::UpdateDisplayData.as_str(),
            "update_display_data"
        );
        assert_eq!(
            KernelEventKind::ExecutionInterrupted.as_str(),
            "execution_interrupted"
        );
    }

    #[test]
    fn test_manager_event_envelope() {
        let event = ManagerEvent::ModelAdded {
            id: "m1".to_string(),
            settings: ModelSettings::new("m", "https://u"),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "MODEL_ADDED");
        assert_eq!(value["data"]["id"], "m1");
    }

    #[test]
    fn test_kernel_event_roundtrip() {
        let event = KernelEvent::ExecuteError(ExecuteErrorData {
            ename: "KeyboardInterrupt".to_string(),
            evalue: "interrupted".to_string(),
            traceback: vec![],
        });
        let json = serde_json::to_string(&event).unwrap();
        let parsed: KernelEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.kind(), KernelEventKind::ExecuteError);
    }
}
