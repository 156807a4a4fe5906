//! Model registry — named catalog of model settings with usage accounting.
//!
//! Every read hands out a clone so downstream mutation cannot leak into
//! stored entries. `MODEL_*` events are emitted after the mutation is
//! committed.

use chrono::Utc;
use murex_types::bus::EventBus;
use murex_types::config::ModelRegistryOptions;
use murex_types::error::{MurexError, MurexResult};
use murex_types::event::ManagerEvent;
use murex_types::model::{ModelRegistryEntry, ModelSettings, ModelStats};
use std::collections::HashMap;
use std::sync::{Mutex, RwLock, Weak};
use tracing::{debug, info};

/// Where the registry learns which `(model, base_url)` pairs are live.
///
/// The agent manager binds itself here after construction; the weak
/// reference keeps an externally owned registry from pinning a dead
/// manager.
pub trait ModelUsageSource: Send + Sync {
    /// Resolved settings pair of each live agent, one element per agent.
    fn models_in_use(&self) -> Vec<(String, String)>;
}

/// Named catalog of [`ModelSettings`] with resolution policy attached.
pub struct ModelRegistry {
    entries: Mutex<HashMap<String, ModelRegistryEntry>>,
    options: ModelRegistryOptions,
    usage_source: RwLock<Option<Weak<dyn ModelUsageSource>>>,
    bus: EventBus<ManagerEvent>,
}

impl ModelRegistry {
    pub fn new(options: ModelRegistryOptions) -> Self {
        let mut entries = HashMap::new();
        for (id, settings) in &options.initial_models {
            entries.insert(id.clone(), ModelRegistryEntry::new(id.clone(), settings.clone()));
        }
        Self {
            entries: Mutex::new(entries),
            options,
            usage_source: RwLock::new(None),
            bus: EventBus::new(100),
        }
    }

    /// Event bus carrying `MODEL_*` events. The agent manager forwards this
    /// wildcard sink onto its own bus.
    pub fn bus(&self) -> &EventBus<ManagerEvent> {
        &self.bus
    }

    /// Late-bind the agent-reference probe used by `remove_model` and
    /// `model_stats`.
    pub fn bind_usage_source(&self, source: Weak<dyn ModelUsageSource>) {
        *self
            .usage_source
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(source);
    }

    fn usage_pairs(&self) -> Vec<(String, String)> {
        let source = self
            .usage_source
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        source
            .and_then(|weak| weak.upgrade())
            .map(|probe| probe.models_in_use())
            .unwrap_or_default()
    }

    /// Insert a new entry. Returns false (and emits nothing) when the id
    /// is already taken.
    pub fn add_model(&self, id: &str, settings: ModelSettings) -> bool {
        {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            if entries.contains_key(id) {
                debug!(model = %id, "add_model: id already registered");
                return false;
            }
            entries.insert(id.to_string(), ModelRegistryEntry::new(id, settings.clone()));
        }
        info!(model = %id, "Model registered");
        self.bus.emit(&ManagerEvent::ModelAdded {
            id: id.to_string(),
            settings: settings.redacted(),
        });
        true
    }

    /// Remove an entry. Fails while any agent's resolved `(model, base_url)`
    /// pair matches; returns false when the id is absent.
    pub fn remove_model(&self, id: &str) -> MurexResult<bool> {
        let entry = {
            let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            match entries.get(id) {
                Some(entry) => entry.clone(),
                None => return Ok(false),
            }
        };

        let key = entry.settings.usage_key();
        let in_use = self
            .usage_pairs()
            .iter()
            .filter(|(model, url)| (model.as_str(), url.as_str()) == key)
            .count();
        if in_use > 0 {
            return Err(MurexError::ModelInUse {
                id: id.to_string(),
                count: in_use,
            });
        }

        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        info!(model = %id, "Model removed");
        self.bus.emit(&ManagerEvent::ModelRemoved { id: id.to_string() });
        Ok(true)
    }

    /// Replace an entry's settings in place. Agents that already resolved
    /// the old settings keep them. Returns false when the id is absent.
    pub fn update_model(&self, id: &str, settings: ModelSettings) -> bool {
        let old = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            match entries.get_mut(id) {
                Some(entry) => {
                    let old = entry.settings.clone();
                    entry.settings = settings.clone();
                    old
                }
                None => return false,
            }
        };
        info!(model = %id, "Model updated");
        self.bus.emit(&ManagerEvent::ModelUpdated {
            id: id.to_string(),
            old: old.redacted(),
            new: settings.redacted(),
        });
        true
    }

    pub fn get_model(&self, id: &str) -> Option<ModelRegistryEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    pub fn has_model(&self, id: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id)
    }

    pub fn list_models(&self) -> Vec<ModelRegistryEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Resolve effective model settings for an agent.
    ///
    /// Precedence: inline `settings` (if custom models are allowed), then
    /// `model_id`, then the configured default model id, then the ambient
    /// default settings. Always returns a copy.
    pub fn resolve(
        &self,
        model_id: Option<&str>,
        settings: Option<&ModelSettings>,
    ) -> MurexResult<ModelSettings> {
        if let Some(settings) = settings {
            if !self.options.allow_custom_models {
                return Err(MurexError::CustomModelsDisallowed);
            }
            return Ok(settings.clone());
        }

        if let Some(id) = model_id {
            return self.resolve_registered(id);
        }

        if let Some(default_id) = &self.options.default_model_id {
            return self.resolve_registered(default_id).map_err(|e| match e {
                MurexError::ModelNotFound(id) => MurexError::DefaultModelMissing(id),
                other => other,
            });
        }

        Ok(self.options.default_model_settings.clone())
    }

    fn resolve_registered(&self, id: &str) -> MurexResult<ModelSettings> {
        if let Some(allowed) = &self.options.allowed_models {
            if !allowed.iter().any(|m| m == id) {
                return Err(MurexError::ModelNotAllowed(id.to_string()));
            }
        }
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| MurexError::ModelNotFound(id.to_string()))?;
        entry.last_used = Some(Utc::now());
        Ok(entry.settings.clone())
    }

    /// Per-entry usage report, sorted by (agents using desc, last used
    /// desc, created desc).
    pub fn model_stats(&self) -> Vec<ModelStats> {
        let pairs = self.usage_pairs();
        let mut stats: Vec<ModelStats> = self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|entry| {
                let key = entry.settings.usage_key();
                let agents_using = pairs
                    .iter()
                    .filter(|(model, url)| (model.as_str(), url.as_str()) == key)
                    .count();
                ModelStats {
                    id: entry.id.clone(),
                    model: entry.settings.model.clone(),
                    base_url: entry.settings.base_url.clone(),
                    agents_using,
                    created: entry.created,
                    last_used: entry.last_used,
                }
            })
            .collect();
        stats.sort_by(|a, b| {
            b.agents_using
                .cmp(&a.agents_using)
                .then_with(|| b.last_used.cmp(&a.last_used))
                .then_with(|| b.created.cmp(&a.created))
        });
        stats
    }

    pub fn model_count(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}
