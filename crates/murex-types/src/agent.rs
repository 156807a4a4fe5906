//! Agent configuration, chat transcript, and summary types.

use crate::config::KernelLang;
use crate::model::ModelSettings;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Separator between a namespace and an agent id in the effective id.
pub const NAMESPACE_SEPARATOR: char = ':';

/// Kind of code-execution kernel an agent may be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum KernelType {
    Python,
    Typescript,
    Javascript,
}

impl KernelType {
    /// Kernel language this agent-facing type maps to.
    pub fn lang(&self) -> KernelLang {
        match self {
            KernelType::Python => KernelLang::Python,
            KernelType::Typescript => KernelLang::TypeScript,
            KernelType::Javascript => KernelLang::JavaScript,
        }
    }
}

impl fmt::Display for KernelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelType::Python => write!(f, "PYTHON"),
            KernelType::Typescript => write!(f, "TYPESCRIPT"),
            KernelType::Javascript => write!(f, "JAVASCRIPT"),
        }
    }
}

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// One message in an agent's conversation history.
///
/// Carried opaquely by the engine; unknown fields survive a round trip
/// through the `extra` bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl ChatMessage {
    /// Build a plain message with the given role and content.
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
            tool_call_id: None,
            extra: HashMap::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(ChatRole::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(ChatRole::System, content)
    }
}

/// Configuration for creating an agent.
///
/// `id` must not contain the namespace separator; the effective id stored by
/// the agent manager is `namespace:id` when `namespace` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    #[serde(default)]
    pub namespace: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Registry id to resolve model settings from.
    #[serde(default)]
    pub model_id: Option<String>,
    /// Inline settings; takes precedence over `model_id` when present.
    #[serde(default)]
    pub model_settings: Option<ModelSettings>,
    /// Reasoning-loop step cap; clamped at the manager's `max_steps_cap`.
    #[serde(default)]
    pub max_steps: Option<u32>,
    #[serde(default)]
    pub kernel_type: Option<KernelType>,
    /// Attach a kernel during `create_agent` when a kernel type is known.
    #[serde(default)]
    pub auto_attach_kernel: bool,
    /// Code executed on the fresh kernel right after attach.
    #[serde(default)]
    pub startup_script: Option<String>,
    /// Environment entries injected into the kernel. Null values are
    /// skipped with a warning; everything else is coerced to a string.
    #[serde(default)]
    pub kernel_environs: Option<HashMap<String, Value>>,
}

impl AgentConfig {
    /// Minimal config with just an id and a display name.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            namespace: None,
            name: name.into(),
            description: None,
            model_id: None,
            model_settings: None,
            max_steps: None,
            kernel_type: None,
            auto_attach_kernel: false,
            startup_script: None,
            kernel_environs: None,
        }
    }

    /// The agent-manager map key: `namespace:id` when namespaced.
    pub fn effective_id(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}{NAMESPACE_SEPARATOR}{}", self.id),
            None => self.id.clone(),
        }
    }
}

/// Partial update applied to a live agent. `None` fields are left alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub model_id: Option<String>,
    pub model_settings: Option<ModelSettings>,
    pub max_steps: Option<u32>,
    pub startup_script: Option<String>,
    pub kernel_environs: Option<HashMap<String, Value>>,
}

/// Listing row returned by `list_agents`.
///
/// The namespace prefix is stripped from `id` and exposed separately.
#[derive(Debug, Clone, Serialize)]
pub struct AgentSummary {
    pub id: String,
    pub namespace: Option<String>,
    pub name: String,
    pub description: Option<String>,
    /// Model identifier of the agent's resolved settings.
    pub model: String,
    pub kernel_type: Option<KernelType>,
    pub has_kernel: bool,
    pub created: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
}

/// Aggregate counters reported by `get_stats`.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub total_agents: usize,
    pub max_agents: usize,
    /// Agent count per namespace; unnamespaced agents are not listed.
    pub agents_by_namespace: HashMap<String, usize>,
    pub agents_with_kernel: usize,
    pub registered_models: usize,
}

/// On-disk transcript format.
///
/// Serialized as `{"agentId", "messages", "savedAt", "metadata"}` — the
/// wire names are camelCase.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationData {
    pub agent_id: String,
    pub messages: Vec<ChatMessage>,
    /// ISO-8601 timestamp of the save.
    pub saved_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ConversationMetadata>,
}

/// Optional descriptive metadata stored alongside a transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMetadata {
    pub agent_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_description: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_id_with_namespace() {
        let mut config = AgentConfig::new("worker", "Worker");
        assert_eq!(config.effective_id(), "worker");
        config.namespace = Some("tenant1".to_string());
        assert_eq!(config.effective_id(), "tenant1:worker");
    }

    #[test]
    fn test_kernel_type_lang_mapping() {
        assert_eq!(KernelType::Python.lang(), KernelLang::Python);
        assert_eq!(KernelType::Typescript.lang(), KernelLang::TypeScript);
        assert_eq!(KernelType::Javascript.lang(), KernelLang::JavaScript);
    }

    #[test]
    fn test_kernel_type_serde() {
        assert_eq!(
            serde_json::to_string(&KernelType::Python).unwrap(),
            "\"PYTHON\""
        );
        let parsed: KernelType = serde_json::from_str("\"TYPESCRIPT\"").unwrap();
        assert_eq!(parsed, KernelType::Typescript);
    }

    #[test]
    fn test_chat_message_preserves_unknown_fields() {
        let json = r#"{"role":"assistant","content":"hi","tool_calls":[{"id":"t1"}]}"#;
        let message: ChatMessage = serde_json::from_str(json).unwrap();
        assert_eq!(message.role, ChatRole::Assistant);
        assert!(message.extra.contains_key("tool_calls"));
        let back = serde_json::to_value(&message).unwrap();
        assert!(back.get("tool_calls").is_some());
    }

    #[test]
    fn test_conversation_data_wire_names() {
        let data = ConversationData {
            agent_id: "a1".to_string(),
            messages: vec![ChatMessage::user("hello")],
            saved_at: Utc::now(),
            metadata: Some(ConversationMetadata {
                agent_name: "A".to_string(),
                agent_description: None,
            }),
        };
        let value = serde_json::to_value(&data).unwrap();
        assert!(value.get("agentId").is_some());
        assert!(value.get("savedAt").is_some());
        assert!(value["metadata"].get("agentName").is_some());
    }
}
