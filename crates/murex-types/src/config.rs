//! Configuration types for the agent manager, model registry, and kernels.

use crate::agent::KernelType;
use crate::model::ModelSettings;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// Language of an embedded code-execution kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelLang {
    Python,
    TypeScript,
    JavaScript,
}

impl fmt::Display for KernelLang {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelLang::Python => write!(f, "python"),
            KernelLang::TypeScript => write!(f, "typescript"),
            KernelLang::JavaScript => write!(f, "javascript"),
        }
    }
}

/// Host-directory mount exposed inside the interpreter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesystemMount {
    pub enabled: bool,
    /// Directory on the host to expose.
    pub host_root: PathBuf,
    /// Mount point seen by interpreter code.
    pub guest_mount: String,
}

/// Options passed to `KernelProvider::create_kernel`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelSpawnOptions {
    pub lang: KernelLang,
    /// Environment variables set in the interpreter before any user code.
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub filesystem: Option<FilesystemMount>,
}

impl KernelSpawnOptions {
    pub fn new(lang: KernelLang) -> Self {
        Self {
            lang,
            env: HashMap::new(),
            filesystem: None,
        }
    }
}

/// Options accepted by `KernelRuntime::initialize`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InitializeOptions {
    pub filesystem: Option<FilesystemMount>,
    pub env: HashMap<String, String>,
}

/// Tuning knobs for one kernel runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelTuning {
    /// Listener cap on the kernel event bus. Exceeding it warns, never errors.
    pub max_listeners: usize,
    /// An execute running longer than this emits `execution_stalled`.
    pub stall_timeout_ms: u64,
    /// Bounded wait for the interrupt buffer to be acknowledged.
    pub interrupt_ack_timeout_ms: u64,
}

impl Default for KernelTuning {
    fn default() -> Self {
        Self {
            max_listeners: 20,
            stall_timeout_ms: 30_000,
            interrupt_ack_timeout_ms: 100,
        }
    }
}

/// Options for the kernel manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelManagerOptions {
    /// Cap on concurrently live kernels.
    pub max_kernels: usize,
    pub tuning: KernelTuning,
}

impl Default for KernelManagerOptions {
    fn default() -> Self {
        Self {
            max_kernels: 20,
            tuning: KernelTuning::default(),
        }
    }
}

/// Options for the model registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelRegistryOptions {
    /// Ambient fallback returned when nothing else resolves.
    pub default_model_settings: ModelSettings,
    /// Registry id consulted when a caller names no model at all.
    pub default_model_id: Option<String>,
    /// When set, resolution rejects registry ids outside this list.
    pub allowed_models: Option<Vec<String>>,
    /// Whether inline (non-registry) settings are accepted.
    pub allow_custom_models: bool,
    /// Entries seeded at construction.
    pub initial_models: HashMap<String, ModelSettings>,
}

impl Default for ModelRegistryOptions {
    fn default() -> Self {
        Self {
            default_model_settings: ModelSettings::default(),
            default_model_id: None,
            allowed_models: None,
            allow_custom_models: true,
            initial_models: HashMap::new(),
        }
    }
}

/// Options for the agent manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentManagerOptions {
    /// Global agent cap.
    pub max_agents: usize,
    /// Per-namespace agent cap.
    pub max_agents_per_namespace: usize,
    pub default_model_settings: ModelSettings,
    pub default_model_id: Option<String>,
    pub default_max_steps: u32,
    /// Upper bound applied to any configured `max_steps`.
    pub max_steps_cap: u32,
    /// Directory for saved conversation files.
    pub agent_data_directory: PathBuf,
    /// Save each agent's transcript on destroy (best effort).
    pub auto_save_conversations: bool,
    /// Kernel type used when a config enables auto-attach without one.
    pub default_kernel_type: Option<KernelType>,
    pub allowed_models: Option<Vec<String>>,
    pub allow_custom_models: bool,
    /// Cap on the agent-manager event bus.
    pub max_listeners: usize,
}

impl Default for AgentManagerOptions {
    fn default() -> Self {
        Self {
            max_agents: 50,
            max_agents_per_namespace: 10,
            default_model_settings: ModelSettings::default(),
            default_model_id: None,
            default_max_steps: 10,
            max_steps_cap: 10,
            agent_data_directory: PathBuf::from("./agent_data"),
            auto_save_conversations: false,
            default_kernel_type: None,
            allowed_models: None,
            allow_custom_models: true,
            max_listeners: 100,
        }
    }
}

impl AgentManagerOptions {
    /// Registry options derived from the manager's model-policy fields,
    /// used when no external registry is injected.
    pub fn registry_options(&self) -> ModelRegistryOptions {
        ModelRegistryOptions {
            default_model_settings: self.default_model_settings.clone(),
            default_model_id: self.default_model_id.clone(),
            allowed_models: self.allowed_models.clone(),
            allow_custom_models: self.allow_custom_models,
            initial_models: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_lang_serde() {
        assert_eq!(
            serde_json::to_string(&KernelLang::TypeScript).unwrap(),
            "\"typescript\""
        );
        let parsed: KernelLang = serde_json::from_str("\"python\"").unwrap();
        assert_eq!(parsed, KernelLang::Python);
    }

    #[test]
    fn test_manager_defaults() {
        let options = AgentManagerOptions::default();
        assert_eq!(options.max_agents, 50);
        assert_eq!(options.max_agents_per_namespace, 10);
        assert_eq!(options.default_max_steps, 10);
        assert_eq!(options.max_steps_cap, 10);
        assert_eq!(options.agent_data_directory, PathBuf::from("./agent_data"));
        assert!(!options.auto_save_conversations);
        assert!(options.allow_custom_models);
        assert_eq!(options.max_listeners, 100);
    }

    #[test]
    fn test_kernel_tuning_defaults() {
        let tuning = KernelTuning::default();
        assert_eq!(tuning.max_listeners, 20);
        assert_eq!(tuning.interrupt_ack_timeout_ms, 100);
    }

    #[test]
    fn test_registry_defaults_allow_custom_models() {
        assert!(ModelRegistryOptions::default().allow_custom_models);
        // Partial deserialization picks up the same default.
        let parsed: ModelRegistryOptions = serde_json::from_str("{}").unwrap();
        assert!(parsed.allow_custom_models);
    }

    #[test]
    fn test_registry_options_inherit_policy() {
        let manager = AgentManagerOptions {
            allow_custom_models: false,
            default_model_id: Some("m1".to_string()),
            ..Default::default()
        };
        let registry = manager.registry_options();
        assert!(!registry.allow_custom_models);
        assert_eq!(registry.default_model_id.as_deref(), Some("m1"));
    }
}
