//! The workspace error type.
//!
//! One enum covers the whole engine: validation failures surface before any
//! state is mutated, dependency lookups surface as "not found", startup
//! script failures are their own kind so callers can roll back agent
//! creation, and interpreter failures are translated into events rather than
//! thrown out of `execute`.

use thiserror::Error;

/// Result alias used across the workspace.
pub type MurexResult<T> = Result<T, MurexError>;

/// All errors produced by the Murex engine.
#[derive(Debug, Error)]
pub enum MurexError {
    // -- Validation (no side effects) ---------------------------------------
    /// Agent id was empty.
    #[error("Agent ID cannot be empty")]
    EmptyAgentId,

    /// Agent name was empty.
    #[error("Agent name cannot be empty")]
    EmptyAgentName,

    /// Agent id contained the namespace separator.
    #[error("Agent ID cannot contain colons")]
    AgentIdContainsColon,

    /// An agent with the same effective id already exists.
    #[error("Agent with ID {0} already exists")]
    DuplicateAgent(String),

    /// The global agent cap was reached.
    #[error("Maximum number of agents ({0}) reached")]
    AgentQuotaExceeded(usize),

    /// The per-namespace agent cap was reached.
    #[error("Maximum number of agents per namespace ({limit}) reached for namespace \"{namespace}\"")]
    NamespaceQuotaExceeded { namespace: String, limit: usize },

    /// Inline model settings were supplied but the manager disallows them.
    #[error("Custom model settings are not allowed. Use a model ID from the registry.")]
    CustomModelsDisallowed,

    /// The requested model id is excluded by the allowed-models list.
    #[error("Model {0} is not in the allowed models list")]
    ModelNotAllowed(String),

    /// The model is still referenced by at least one agent.
    #[error("Cannot remove model {id}: it is being used by {count} agent(s)")]
    ModelInUse { id: String, count: usize },

    /// A configured default model id is absent from the registry.
    #[error("Default model {0} is not in the registry")]
    DefaultModelMissing(String),

    // -- Dependency lookups -------------------------------------------------
    /// No agent stored under the given effective id.
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    /// No registry entry under the given model id.
    #[error("Model not found in registry: {0}")]
    ModelNotFound(String),

    /// The kernel manager does not know the given kernel id.
    #[error("Kernel not found: {0}")]
    KernelNotFound(String),

    /// A kernel operation was requested but no kernel manager is wired.
    #[error("No kernel manager is wired to the agent manager")]
    NoKernelManager,

    // -- Kernel runtime -----------------------------------------------------
    /// An `execute` call is already in flight on this kernel.
    #[error("Kernel is busy: an execute call is already in flight")]
    KernelBusy,

    /// The kernel was destroyed by its manager.
    #[error("Kernel has been terminated")]
    KernelTerminated,

    /// The kernel manager's cap was reached.
    #[error("Maximum number of kernels ({0}) reached")]
    KernelQuotaExceeded(usize),

    /// A second input request arrived while one was still outstanding.
    #[error("An input request is already outstanding")]
    InputRequestPending,

    /// The input reply channel was dropped before a reply arrived.
    #[error("Input request was cancelled")]
    InputCancelled,

    /// The embedded interpreter reported a failure outside user code.
    #[error("Interpreter error: {0}")]
    Interpreter(String),

    // -- Startup scripts ----------------------------------------------------
    /// An agent startup script failed during kernel attach.
    #[error("Agent startup script failed: {0}")]
    StartupScript(String),

    // -- Ambient ------------------------------------------------------------
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Anything that does not fit the categories above.
    #[error("{0}")]
    Internal(String),
}

impl MurexError {
    /// Whether this error originated from an agent startup script.
    ///
    /// `create_agent` rolls back the agent on startup-script failures and
    /// keeps it on every other attach failure, so the distinction matters.
    pub fn is_startup_error(&self) -> bool {
        matches!(self, MurexError::StartupScript(_))
    }

    /// Short kind name, used as the `ename` when a host-side failure is
    /// translated into an `execute_error` event.
    pub fn name(&self) -> &'static str {
        match self {
            MurexError::EmptyAgentId
            | MurexError::EmptyAgentName
            | MurexError::AgentIdContainsColon
            | MurexError::DuplicateAgent(_)
            | MurexError::AgentQuotaExceeded(_)
            | MurexError::NamespaceQuotaExceeded { .. }
            | MurexError::CustomModelsDisallowed
            | MurexError::ModelNotAllowed(_)
            | MurexError::ModelInUse { .. }
            | MurexError::DefaultModelMissing(_) => "ValidationError",
            MurexError::AgentNotFound(_)
            | MurexError::ModelNotFound(_)
            | MurexError::KernelNotFound(_)
            | MurexError::NoKernelManager => "NotFoundError",
            MurexError::KernelBusy => "KernelBusy",
            MurexError::KernelTerminated => "KernelTerminated",
            MurexError::KernelQuotaExceeded(_) => "KernelQuotaExceeded",
            MurexError::InputRequestPending => "InputRequestPending",
            MurexError::InputCancelled => "InputCancelled",
            MurexError::Interpreter(_) => "InterpreterError",
            MurexError::StartupScript(_) => "AgentStartupError",
            MurexError::Io(_) => "IoError",
            MurexError::Json(_) => "JsonError",
            MurexError::Internal(_) => "InternalError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_quota_message() {
        let err = MurexError::NamespaceQuotaExceeded {
            namespace: "ns1".to_string(),
            limit: 2,
        };
        assert_eq!(
            err.to_string(),
            "Maximum number of agents per namespace (2) reached for namespace \"ns1\""
        );
    }

    #[test]
    fn test_colon_message() {
        assert_eq!(
            MurexError::AgentIdContainsColon.to_string(),
            "Agent ID cannot contain colons"
        );
    }

    #[test]
    fn test_custom_models_message() {
        assert_eq!(
            MurexError::CustomModelsDisallowed.to_string(),
            "Custom model settings are not allowed. Use a model ID from the registry."
        );
    }

    #[test]
    fn test_model_in_use_message() {
        let err = MurexError::ModelInUse {
            id: "m1".to_string(),
            count: 1,
        };
        assert_eq!(
            err.to_string(),
            "Cannot remove model m1: it is being used by 1 agent(s)"
        );
    }

    #[test]
    fn test_startup_error_kind() {
        assert!(MurexError::StartupScript("boom".to_string()).is_startup_error());
        assert!(!MurexError::KernelBusy.is_startup_error());
    }
}
