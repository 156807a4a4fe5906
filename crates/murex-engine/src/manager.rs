//! Agent manager — quota, namespace, and model-resolution control plane.
//!
//! The manager owns the agents map (keyed by effective id), consults the
//! model registry when creating or updating agents, and wires agents to
//! kernels obtained from a late-bound [`KernelProvider`]. Mutating
//! operations serialize on one async lock so the cap invariants stay exact;
//! reads go straight to the concurrent map.

use crate::agent::Agent;
use crate::conversation::ConversationStore;
use crate::registry::{ModelRegistry, ModelUsageSource};
use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use murex_kernel::manager::KernelProvider;
use murex_types::agent::{
    AgentConfig, AgentSummary, AgentUpdate, ChatMessage, ConversationData, ConversationMetadata,
    KernelType, ManagerStats, NAMESPACE_SEPARATOR,
};
use murex_types::bus::EventBus;
use murex_types::config::{AgentManagerOptions, KernelSpawnOptions};
use murex_types::error::{MurexError, MurexResult};
use murex_types::event::ManagerEvent;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock, Weak};
use tracing::{info, warn};

/// Default `keep_count` for [`AgentManager::cleanup_old_agents_in_namespace`].
pub const DEFAULT_CLEANUP_KEEP: usize = 5;

/// Control plane over agent instances.
pub struct AgentManager {
    options: AgentManagerOptions,
    /// Agents keyed by effective id (`namespace:id` when namespaced).
    agents: DashMap<String, Arc<Agent>>,
    registry: Arc<ModelRegistry>,
    kernel_manager: RwLock<Option<Arc<dyn KernelProvider>>>,
    store: ConversationStore,
    bus: Arc<EventBus<ManagerEvent>>,
    /// Serializes create/destroy so quota checks observe a stable map.
    write_lock: tokio::sync::Mutex<()>,
}

impl AgentManager {
    /// Build a manager with its own registry derived from `options`.
    pub fn new(options: AgentManagerOptions) -> Arc<Self> {
        let registry = Arc::new(ModelRegistry::new(options.registry_options()));
        Self::with_registry(options, registry)
    }

    /// Build a manager around an externally owned registry (its resolution
    /// policy governs; the manager's model-policy fields are ignored).
    pub fn with_registry(options: AgentManagerOptions, registry: Arc<ModelRegistry>) -> Arc<Self> {
        let bus = Arc::new(EventBus::new(options.max_listeners));
        let store = ConversationStore::new(options.agent_data_directory.clone());
        let manager = Arc::new(Self {
            options,
            agents: DashMap::new(),
            registry,
            kernel_manager: RwLock::new(None),
            store,
            bus,
            write_lock: tokio::sync::Mutex::new(()),
        });

        // Late wiring: the registry probes this manager for live model
        // references, and its MODEL_* events are forwarded onto our bus.
        let manager_dyn: Arc<dyn ModelUsageSource> = manager.clone();
        let usage_source: Weak<dyn ModelUsageSource> = Arc::downgrade(&manager_dyn);
        manager.registry.bind_usage_source(usage_source);
        let bridge = Arc::clone(&manager.bus);
        manager.registry.bus().on_any(move |event| bridge.emit(event));

        manager
    }

    /// Wire (or replace) the kernel manager this control plane uses.
    pub fn set_kernel_manager(&self, provider: Arc<dyn KernelProvider>) {
        *self
            .kernel_manager
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(provider);
    }

    fn kernel_provider(&self) -> Option<Arc<dyn KernelProvider>> {
        self.kernel_manager
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Event bus carrying `AGENT_*` and forwarded `MODEL_*` events.
    pub fn bus(&self) -> &EventBus<ManagerEvent> {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    // -- Creation -----------------------------------------------------------

    /// Create an agent, returning its effective id.
    ///
    /// Validation happens before any state is touched: non-empty id and
    /// name, no colon in the id, no duplicate effective id, global and
    /// per-namespace caps. Model settings resolve through the registry.
    /// With `auto_attach_kernel`, a startup-script failure rolls the agent
    /// back and propagates; any other attach failure keeps the agent and
    /// emits `AGENT_ERROR`.
    pub async fn create_agent(&self, config: AgentConfig) -> MurexResult<String> {
        let _write = self.write_lock.lock().await;

        if config.id.trim().is_empty() {
            return Err(MurexError::EmptyAgentId);
        }
        if config.name.trim().is_empty() {
            return Err(MurexError::EmptyAgentName);
        }
        if config.id.contains(NAMESPACE_SEPARATOR) {
            return Err(MurexError::AgentIdContainsColon);
        }

        let effective_id = config.effective_id();
        if self.agents.contains_key(&effective_id) {
            return Err(MurexError::DuplicateAgent(effective_id));
        }
        if self.agents.len() >= self.options.max_agents {
            return Err(MurexError::AgentQuotaExceeded(self.options.max_agents));
        }
        if let Some(namespace) = &config.namespace {
            let used = self.namespace_count(namespace);
            if used >= self.options.max_agents_per_namespace {
                return Err(MurexError::NamespaceQuotaExceeded {
                    namespace: namespace.clone(),
                    limit: self.options.max_agents_per_namespace,
                });
            }
        }

        let settings = self
            .registry
            .resolve(config.model_id.as_deref(), config.model_settings.as_ref())?;
        let max_steps = config
            .max_steps
            .unwrap_or(self.options.default_max_steps)
            .min(self.options.max_steps_cap);

        let agent = Arc::new(Agent::new(&config, settings, max_steps, self.options.max_steps_cap));
        self.agents.insert(effective_id.clone(), Arc::clone(&agent));
        info!(agent = %effective_id, "Agent created");
        self.bus.emit(&ManagerEvent::AgentCreated {
            agent_id: effective_id.clone(),
        });

        if config.auto_attach_kernel {
            let attach_type = config.kernel_type.or(self.options.default_kernel_type);
            if let (Some(kernel_type), true) = (attach_type, self.kernel_provider().is_some()) {
                if let Err(e) = self.attach_kernel_inner(&agent, kernel_type).await {
                    self.bus.emit(&ManagerEvent::AgentError {
                        agent_id: effective_id.clone(),
                        error: e.to_string(),
                    });
                    if e.is_startup_error() {
                        // Startup failure rolls the whole creation back.
                        self.agents.remove(&effective_id);
                        warn!(agent = %effective_id, error = %e, "Agent rolled back after startup failure");
                        return Err(e);
                    }
                    warn!(agent = %effective_id, error = %e, "Kernel auto-attach failed; agent kept");
                }
            }
        }

        Ok(effective_id)
    }

    // -- Reads --------------------------------------------------------------

    pub fn get_agent(&self, agent_id: &str) -> Option<Arc<Agent>> {
        self.agents.get(agent_id).map(|entry| Arc::clone(entry.value()))
    }

    fn require_agent(&self, agent_id: &str) -> MurexResult<Arc<Agent>> {
        self.get_agent(agent_id)
            .ok_or_else(|| MurexError::AgentNotFound(agent_id.to_string()))
    }

    pub fn agent_exists(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    pub fn agent_ids(&self) -> Vec<String> {
        self.agents.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    /// Listing rows, optionally filtered to one namespace, ordered by
    /// effective id. Ids come back with the namespace prefix stripped.
    pub fn list_agents(&self, namespace: Option<&str>) -> Vec<AgentSummary> {
        let mut rows: Vec<(String, AgentSummary)> = self
            .agents
            .iter()
            .filter(|entry| match namespace {
                Some(ns) => entry.value().namespace() == Some(ns),
                None => true,
            })
            .map(|entry| (entry.key().clone(), entry.value().summary()))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows.into_iter().map(|(_, summary)| summary).collect()
    }

    /// Agents with the given namespace. Linear scan over the map keys;
    /// bounded by `max_agents` (50 by default), so no index is kept.
    fn namespace_count(&self, namespace: &str) -> usize {
        let prefix = format!("{namespace}{NAMESPACE_SEPARATOR}");
        self.agents
            .iter()
            .filter(|entry| entry.key().starts_with(&prefix))
            .count()
    }

    // -- Updates ------------------------------------------------------------

    /// Apply a partial update. Naming a model (by id or inline settings)
    /// re-resolves through the registry before the agent sees the update.
    pub fn update_agent(&self, agent_id: &str, update: AgentUpdate) -> MurexResult<()> {
        let agent = self.require_agent(agent_id)?;
        let resolved = if update.model_id.is_some() || update.model_settings.is_some() {
            Some(
                self.registry
                    .resolve(update.model_id.as_deref(), update.model_settings.as_ref())?,
            )
        } else {
            None
        };
        agent.apply_update(&update, resolved);
        Ok(())
    }

    // -- Destruction --------------------------------------------------------

    pub async fn destroy_agent(&self, agent_id: &str) -> MurexResult<()> {
        let _write = self.write_lock.lock().await;
        self.destroy_agent_inner(agent_id).await
    }

    async fn destroy_agent_inner(&self, agent_id: &str) -> MurexResult<()> {
        let (key, agent) = self
            .agents
            .remove(agent_id)
            .ok_or_else(|| MurexError::AgentNotFound(agent_id.to_string()))?;

        if self.options.auto_save_conversations && !agent.conversation_history().is_empty() {
            if let Err(e) = self.save_for(&agent, None) {
                warn!(agent = %key, error = %e, "Auto-save before destroy failed");
            }
        }

        if let Some(kernel_id) = agent.kernel_id() {
            match self.kernel_provider() {
                Some(provider) => {
                    if let Err(e) = provider.destroy_kernel(&kernel_id).await {
                        warn!(agent = %key, kernel = %kernel_id, error = %e, "Kernel teardown failed");
                    }
                }
                None => {
                    warn!(agent = %key, kernel = %kernel_id, "No kernel manager to destroy held kernel")
                }
            }
        }

        agent.destroy();
        info!(agent = %key, "Agent destroyed");
        self.bus
            .emit(&ManagerEvent::AgentDestroyed { agent_id: key });
        Ok(())
    }

    /// Destroy all agents, or all agents in one namespace. Teardown fans
    /// out in parallel; the count of successfully destroyed agents comes
    /// back.
    pub async fn destroy_all(&self, namespace: Option<&str>) -> usize {
        let _write = self.write_lock.lock().await;
        let keys: Vec<String> = self
            .agents
            .iter()
            .filter(|entry| match namespace {
                Some(ns) => entry.value().namespace() == Some(ns),
                None => true,
            })
            .map(|entry| entry.key().clone())
            .collect();

        let results = join_all(keys.iter().map(|key| self.destroy_agent_inner(key))).await;
        results.into_iter().filter(Result::is_ok).count()
    }

    /// Trim a namespace to its `keep_count` most recently used agents
    /// (`last_used`, falling back to `created`). Per-agent failures are
    /// reported and skipped. Returns how many agents were removed.
    pub async fn cleanup_old_agents_in_namespace(
        &self,
        namespace: &str,
        keep_count: usize,
    ) -> usize {
        let _write = self.write_lock.lock().await;
        let mut candidates: Vec<(String, chrono::DateTime<Utc>)> = self
            .agents
            .iter()
            .filter(|entry| entry.value().namespace() == Some(namespace))
            .map(|entry| {
                let agent = entry.value();
                (
                    entry.key().clone(),
                    agent.last_used().unwrap_or_else(|| agent.created()),
                )
            })
            .collect();
        candidates.sort_by_key(|(_, stamp)| *stamp);

        let surplus = candidates.len().saturating_sub(keep_count);
        let mut removed = 0;
        for (key, _) in candidates.into_iter().take(surplus) {
            match self.destroy_agent_inner(&key).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(agent = %key, error = %e, "Cleanup failed for agent; continuing"),
            }
        }
        removed
    }

    // -- Kernel wiring ------------------------------------------------------

    /// Create a kernel of the mapped language and attach it to the agent.
    /// An already-attached kernel is destroyed first.
    pub async fn attach_kernel_to_agent(
        &self,
        agent_id: &str,
        kernel_type: KernelType,
    ) -> MurexResult<()> {
        let agent = self.require_agent(agent_id)?;
        self.attach_kernel_inner(&agent, kernel_type).await
    }

    async fn attach_kernel_inner(
        &self,
        agent: &Arc<Agent>,
        kernel_type: KernelType,
    ) -> MurexResult<()> {
        let provider = self.kernel_provider().ok_or(MurexError::NoKernelManager)?;

        if let Some(old_id) = agent.detach_kernel() {
            if let Err(e) = provider.destroy_kernel(&old_id).await {
                warn!(agent = %agent.id(), kernel = %old_id, error = %e, "Failed to destroy replaced kernel");
            }
        }

        let mut options = KernelSpawnOptions::new(kernel_type.lang());
        if let Some(environs) = agent.kernel_environs() {
            options.env = coerce_environs(&environs);
        }

        let kernel_id = provider.create_kernel(options).await?;
        let kernel = provider
            .get_kernel(&kernel_id)
            .ok_or_else(|| MurexError::KernelNotFound(kernel_id.to_string()))?;
        agent.attach_kernel(kernel_id.clone(), Arc::downgrade(&kernel), kernel_type);
        info!(agent = %agent.id(), kernel = %kernel_id, kernel_type = %kernel_type, "Kernel attached");

        if let Some(script) = agent.startup_script() {
            let failure = match kernel.execute(&script, None).await {
                Ok(outcome) if outcome.success => None,
                Ok(outcome) => Some(
                    outcome
                        .error
                        .map(|e| format!("{}: {}", e.ename, e.evalue))
                        .unwrap_or_else(|| "startup script failed".to_string()),
                ),
                Err(e) => Some(e.to_string()),
            };
            if let Some(message) = failure {
                agent.set_startup_error(&message);
                // Tear down the half-attached kernel before surfacing.
                if let Some(kernel_id) = agent.detach_kernel() {
                    if let Err(e) = provider.destroy_kernel(&kernel_id).await {
                        warn!(kernel = %kernel_id, error = %e, "Failed to destroy kernel after startup failure");
                    }
                }
                return Err(MurexError::StartupScript(message));
            }
        }

        Ok(())
    }

    /// Destroy the agent's held kernel (if any) via the manager, then
    /// detach.
    pub async fn detach_kernel_from_agent(&self, agent_id: &str) -> MurexResult<()> {
        let agent = self.require_agent(agent_id)?;
        if let Some(kernel_id) = agent.kernel_id() {
            let provider = self.kernel_provider().ok_or(MurexError::NoKernelManager)?;
            provider.destroy_kernel(&kernel_id).await?;
            agent.detach_kernel();
            info!(agent = %agent_id, kernel = %kernel_id, "Kernel detached");
        }
        Ok(())
    }

    // -- Conversations ------------------------------------------------------

    /// Persist the agent's transcript. Returns the written path.
    pub fn save_conversation(
        &self,
        agent_id: &str,
        filename: Option<&str>,
    ) -> MurexResult<PathBuf> {
        let agent = self.require_agent(agent_id)?;
        self.save_for(&agent, filename)
    }

    fn save_for(&self, agent: &Agent, filename: Option<&str>) -> MurexResult<PathBuf> {
        let data = ConversationData {
            agent_id: agent.id().to_string(),
            messages: agent.conversation_history(),
            saved_at: Utc::now(),
            metadata: Some(ConversationMetadata {
                agent_name: agent.name(),
                agent_description: agent.description(),
            }),
        };
        self.store.save(&data, filename)
    }

    /// Restore the agent's transcript from disk (newest save when no
    /// filename is given) and return it. Loading is best effort: on any
    /// failure the agent's history is left alone and an empty sequence
    /// comes back.
    pub fn load_conversation(
        &self,
        agent_id: &str,
        filename: Option<&str>,
    ) -> MurexResult<Vec<ChatMessage>> {
        let agent = self.require_agent(agent_id)?;
        let messages = self.store.load(agent.id(), filename);
        if !messages.is_empty() {
            agent.set_conversation_history(messages.clone());
        }
        Ok(messages)
    }

    pub fn clear_conversation(&self, agent_id: &str) -> MurexResult<()> {
        // Clearing is setting the empty transcript; both paths go through
        // the same agent method.
        self.set_conversation_history(agent_id, Vec::new())
    }

    pub fn set_conversation_history(
        &self,
        agent_id: &str,
        messages: Vec<ChatMessage>,
    ) -> MurexResult<()> {
        let agent = self.require_agent(agent_id)?;
        agent.set_conversation_history(messages);
        Ok(())
    }

    // -- Aggregates ---------------------------------------------------------

    pub fn get_stats(&self) -> ManagerStats {
        let mut agents_by_namespace: HashMap<String, usize> = HashMap::new();
        let mut agents_with_kernel = 0;
        for entry in self.agents.iter() {
            let agent = entry.value();
            if let Some(ns) = agent.namespace() {
                *agents_by_namespace.entry(ns.to_string()).or_default() += 1;
            }
            if agent.has_kernel() {
                agents_with_kernel += 1;
            }
        }
        ManagerStats {
            total_agents: self.agents.len(),
            max_agents: self.options.max_agents,
            agents_by_namespace,
            agents_with_kernel,
            registered_models: self.registry.model_count(),
        }
    }

    pub fn get_model_stats(&self) -> Vec<murex_types::model::ModelStats> {
        self.registry.model_stats()
    }
}

impl ModelUsageSource for AgentManager {
    fn models_in_use(&self) -> Vec<(String, String)> {
        self.agents
            .iter()
            .map(|entry| {
                let settings = entry.value().model_settings();
                (settings.model, settings.base_url)
            })
            .collect()
    }
}

/// Coerce agent-configured environment entries into kernel env strings.
/// Null entries are skipped with a warning; everything else stringifies.
fn coerce_environs(environs: &HashMap<String, Value>) -> HashMap<String, String> {
    let mut env = HashMap::new();
    for (key, value) in environs {
        match value {
            Value::Null => {
                warn!(variable = %key, "Skipping null kernel environment entry");
            }
            Value::String(s) => {
                env.insert(key.clone(), s.clone());
            }
            other => {
                env.insert(key.clone(), other.to_string());
            }
        }
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_coerce_environs_skips_null_and_stringifies() {
        let environs = HashMap::from([
            ("A".to_string(), json!("text")),
            ("B".to_string(), json!(7)),
            ("C".to_string(), json!(true)),
            ("D".to_string(), Value::Null),
        ]);
        let env = coerce_environs(&environs);
        assert_eq!(env.get("A").map(String::as_str), Some("text"));
        assert_eq!(env.get("B").map(String::as_str), Some("7"));
        assert_eq!(env.get("C").map(String::as_str), Some("true"));
        assert!(!env.contains_key("D"));
        assert_eq!(env.len(), 3);
    }
}
