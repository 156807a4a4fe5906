//! Model settings and registry entry types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How to talk to a chat-completion endpoint.
///
/// Value semantics throughout: the registry and the agent manager clone at
/// every boundary so downstream mutation cannot leak back into stored
/// entries. Two settings refer to the same model for usage accounting when
/// their `(model, base_url)` pairs match.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// Model identifier (e.g. "claude-sonnet-4-20250514").
    pub model: String,
    /// Endpoint base URL.
    pub base_url: String,
    /// API key. Redacted in `Debug` output and in reported copies.
    pub api_key: String,
    /// Sampling temperature.
    pub temperature: f64,
    /// Optional completion token cap.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Optional nucleus-sampling cutoff.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
}

impl ModelSettings {
    /// Build settings from the two identity fields, other knobs defaulted.
    pub fn new(model: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    /// Equality key for "same model" determination.
    pub fn usage_key(&self) -> (&str, &str) {
        (&self.model, &self.base_url)
    }

    /// Whether `other` resolves to the same `(model, base_url)` pair.
    pub fn same_endpoint(&self, other: &ModelSettings) -> bool {
        self.usage_key() == other.usage_key()
    }

    /// Copy safe for reporting: the API key is masked.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.api_key.is_empty() {
            copy.api_key = "<redacted>".to_string();
        }
        copy
    }
}

impl fmt::Debug for ModelSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelSettings")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field(
                "api_key",
                &if self.api_key.is_empty() {
                    "<unset>"
                } else {
                    "<redacted>"
                },
            )
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("top_p", &self.top_p)
            .finish()
    }
}

/// A single named entry in the model registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRegistryEntry {
    /// Registry key, unique within one registry.
    pub id: String,
    /// The stored settings. Replaced wholesale by `update_model`.
    pub settings: ModelSettings,
    /// When the entry was registered.
    pub created: DateTime<Utc>,
    /// Stamped each time a resolve path hands the entry out.
    pub last_used: Option<DateTime<Utc>>,
}

impl ModelRegistryEntry {
    /// Wrap settings into a fresh entry stamped now.
    pub fn new(id: impl Into<String>, settings: ModelSettings) -> Self {
        Self {
            id: id.into(),
            settings,
            created: Utc::now(),
            last_used: None,
        }
    }
}

/// Usage report for one registry entry.
#[derive(Debug, Clone, Serialize)]
pub struct ModelStats {
    /// Registry key.
    pub id: String,
    /// Model identifier of the entry.
    pub model: String,
    /// Endpoint base URL of the entry.
    pub base_url: String,
    /// Number of agents whose resolved `(model, base_url)` pair matches.
    pub agents_using: usize,
    /// When the entry was registered.
    pub created: DateTime<Utc>,
    /// Last time a resolve path handed the entry out.
    pub last_used: Option<DateTime<Utc>>,
}
