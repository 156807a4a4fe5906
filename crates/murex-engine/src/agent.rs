//! A live agent instance.
//!
//! The agent is the lifecycle holder for one conversational worker: its
//! resolved model settings, transcript, and (optionally) a weak handle to a
//! kernel owned by the kernel manager. The reasoning loop that drives the
//! chat-completion model lives outside this crate.

use chrono::{DateTime, Utc};
use murex_kernel::kernel::{KernelId, KernelRuntime};
use murex_types::agent::{AgentConfig, AgentSummary, AgentUpdate, ChatMessage, KernelType};
use murex_types::model::ModelSettings;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, Weak};
use tracing::debug;

/// Weak view of an attached kernel: the kernel manager stays the owner.
#[derive(Clone)]
pub struct KernelHandle {
    pub id: KernelId,
    pub kernel: Weak<KernelRuntime>,
}

/// Mutable portion of an agent, guarded as one unit.
struct AgentState {
    name: String,
    description: Option<String>,
    model_settings: ModelSettings,
    max_steps: u32,
    kernel_type: Option<KernelType>,
    kernel: Option<KernelHandle>,
    startup_script: Option<String>,
    kernel_environs: Option<HashMap<String, Value>>,
    last_used: Option<DateTime<Utc>>,
    startup_error: Option<String>,
}

/// One conversational worker.
pub struct Agent {
    effective_id: String,
    bare_id: String,
    namespace: Option<String>,
    created: DateTime<Utc>,
    max_steps_cap: u32,
    state: Mutex<AgentState>,
    history: Mutex<Vec<ChatMessage>>,
}

impl Agent {
    /// Build an agent from a validated config and already-resolved model
    /// settings. `max_steps` arrives clamped; the cap is kept for updates.
    pub fn new(
        config: &AgentConfig,
        model_settings: ModelSettings,
        max_steps: u32,
        max_steps_cap: u32,
    ) -> Self {
        Self {
            effective_id: config.effective_id(),
            bare_id: config.id.clone(),
            namespace: config.namespace.clone(),
            created: Utc::now(),
            max_steps_cap,
            state: Mutex::new(AgentState {
                name: config.name.clone(),
                description: config.description.clone(),
                model_settings,
                max_steps,
                kernel_type: config.kernel_type,
                kernel: None,
                startup_script: config.startup_script.clone(),
                kernel_environs: config.kernel_environs.clone(),
                last_used: None,
                startup_error: None,
            }),
            history: Mutex::new(Vec::new()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, AgentState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The agent-manager map key: `namespace:id` when namespaced.
    pub fn id(&self) -> &str {
        &self.effective_id
    }

    /// Id without the namespace prefix.
    pub fn bare_id(&self) -> &str {
        &self.bare_id
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn name(&self) -> String {
        self.state().name.clone()
    }

    pub fn description(&self) -> Option<String> {
        self.state().description.clone()
    }

    /// Copy of the resolved model settings.
    pub fn model_settings(&self) -> ModelSettings {
        self.state().model_settings.clone()
    }

    pub fn max_steps(&self) -> u32 {
        self.state().max_steps
    }

    pub fn kernel_type(&self) -> Option<KernelType> {
        self.state().kernel_type
    }

    pub fn kernel(&self) -> Option<KernelHandle> {
        self.state().kernel.clone()
    }

    pub fn kernel_id(&self) -> Option<KernelId> {
        self.state().kernel.as_ref().map(|handle| handle.id.clone())
    }

    pub fn has_kernel(&self) -> bool {
        self.state().kernel.is_some()
    }

    pub fn startup_script(&self) -> Option<String> {
        self.state().startup_script.clone()
    }

    pub fn kernel_environs(&self) -> Option<HashMap<String, Value>> {
        self.state().kernel_environs.clone()
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn last_used(&self) -> Option<DateTime<Utc>> {
        self.state().last_used
    }

    /// Stamp `last_used` with the current time.
    pub fn touch(&self) {
        self.state().last_used = Some(Utc::now());
    }

    /// Error message left behind by a failed startup script, if any.
    pub fn startup_error(&self) -> Option<String> {
        self.state().startup_error.clone()
    }

    pub fn set_startup_error(&self, message: &str) {
        self.state().startup_error = Some(message.to_string());
    }

    /// Apply a partial update. `resolved_settings` is the manager's
    /// re-resolution when the update named a model; `None` leaves the
    /// current settings alone.
    pub fn apply_update(&self, update: &AgentUpdate, resolved_settings: Option<ModelSettings>) {
        let mut state = self.state();
        if let Some(name) = &update.name {
            state.name = name.clone();
        }
        if let Some(description) = &update.description {
            state.description = Some(description.clone());
        }
        if let Some(settings) = resolved_settings {
            state.model_settings = settings;
        }
        if let Some(max_steps) = update.max_steps {
            state.max_steps = max_steps.min(self.max_steps_cap);
        }
        if let Some(script) = &update.startup_script {
            state.startup_script = Some(script.clone());
        }
        if let Some(environs) = &update.kernel_environs {
            state.kernel_environs = Some(environs.clone());
        }
    }

    /// Install a kernel handle. An attached kernel always implies a kernel
    /// type.
    pub fn attach_kernel(&self, id: KernelId, kernel: Weak<KernelRuntime>, kernel_type: KernelType) {
        let mut state = self.state();
        state.kernel = Some(KernelHandle { id, kernel });
        state.kernel_type = Some(kernel_type);
        state.startup_error = None;
    }

    /// Drop the kernel handle, returning the id it held. The kernel type is
    /// kept — the agent remains configured for that language.
    pub fn detach_kernel(&self) -> Option<KernelId> {
        let handle = self.state().kernel.take();
        handle.map(|h| h.id)
    }

    pub fn conversation_history(&self) -> Vec<ChatMessage> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_conversation_history(&self, messages: Vec<ChatMessage>) {
        *self.history.lock().unwrap_or_else(|e| e.into_inner()) = messages;
    }

    pub fn append_message(&self, message: ChatMessage) {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message);
        self.touch();
    }

    /// Listing row for `list_agents`.
    pub fn summary(&self) -> AgentSummary {
        let state = self.state();
        AgentSummary {
            id: self.bare_id.clone(),
            namespace: self.namespace.clone(),
            name: state.name.clone(),
            description: state.description.clone(),
            model: state.model_settings.model.clone(),
            kernel_type: state.kernel_type,
            has_kernel: state.kernel.is_some(),
            created: self.created,
            last_used: state.last_used,
        }
    }

    /// Final teardown: drops the transcript and any kernel handle. Kernel
    /// destruction itself is the manager's job.
    pub fn destroy(&self) {
        debug!(agent = %self.effective_id, "Agent torn down");
        self.state().kernel = None;
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}
