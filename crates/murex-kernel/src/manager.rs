//! Kernel manager — factory and owner of kernel runtimes.

use crate::interpreter::InterpreterFactory;
use crate::kernel::{KernelId, KernelRuntime};
use async_trait::async_trait;
use dashmap::DashMap;
use murex_types::config::{InitializeOptions, KernelManagerOptions, KernelSpawnOptions};
use murex_types::error::{MurexError, MurexResult};
use std::sync::Arc;
use tracing::{debug, info};

/// The contract the agent control plane consumes.
///
/// Kernel ids are opaque; callers never parse them. `destroy_kernel` is
/// idempotent — destroying an unknown id succeeds silently.
#[async_trait]
pub trait KernelProvider: Send + Sync {
    async fn create_kernel(&self, options: KernelSpawnOptions) -> MurexResult<KernelId>;

    fn get_kernel(&self, id: &KernelId) -> Option<Arc<KernelRuntime>>;

    async fn destroy_kernel(&self, id: &KernelId) -> MurexResult<()>;
}

/// Owns kernel runtimes keyed by opaque id.
pub struct KernelManager {
    kernels: DashMap<KernelId, Arc<KernelRuntime>>,
    factory: Arc<dyn InterpreterFactory>,
    options: KernelManagerOptions,
}

impl KernelManager {
    pub fn new(factory: Arc<dyn InterpreterFactory>, options: KernelManagerOptions) -> Self {
        Self {
            kernels: DashMap::new(),
            factory,
            options,
        }
    }

    /// Ids of all live kernels.
    pub fn list_kernel_ids(&self) -> Vec<KernelId> {
        self.kernels.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn kernel_count(&self) -> usize {
        self.kernels.len()
    }

    /// Tear down the interpreter behind a kernel and boot a fresh one,
    /// preserving the kernel's id and its subscribers. Emits
    /// `kernel_restarted` on success, `kernel_unrecoverable` on a failed
    /// boot.
    pub async fn restart_kernel(&self, id: &KernelId) -> MurexResult<()> {
        let kernel = self
            .get_kernel(id)
            .ok_or_else(|| MurexError::KernelNotFound(id.to_string()))?;
        let interpreter = self.factory.create(kernel.lang())?;
        kernel.replace_interpreter(interpreter, None).await?;
        info!(kernel = %id, "Restarted kernel");
        Ok(())
    }
}

#[async_trait]
impl KernelProvider for KernelManager {
    async fn create_kernel(&self, options: KernelSpawnOptions) -> MurexResult<KernelId> {
        if self.kernels.len() >= self.options.max_kernels {
            return Err(MurexError::KernelQuotaExceeded(self.options.max_kernels));
        }

        let interpreter = self.factory.create(options.lang)?;
        let kernel = KernelRuntime::new(options.lang, interpreter, self.options.tuning.clone());
        let init = InitializeOptions {
            filesystem: options.filesystem,
            env: options.env,
        };
        kernel.initialize(Some(init)).await?;

        let id = kernel.id().clone();
        self.kernels.insert(id.clone(), kernel);
        info!(kernel = %id, lang = %options.lang, "Created kernel");
        Ok(id)
    }

    fn get_kernel(&self, id: &KernelId) -> Option<Arc<KernelRuntime>> {
        self.kernels.get(id).map(|entry| Arc::clone(entry.value()))
    }

    async fn destroy_kernel(&self, id: &KernelId) -> MurexResult<()> {
        match self.kernels.remove(id) {
            Some((_, kernel)) => {
                kernel.mark_terminated();
                info!(kernel = %id, "Destroyed kernel");
            }
            None => debug!(kernel = %id, "destroy_kernel on unknown id; ignoring"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KernelStatus;
    use crate::testing::MockInterpreterFactory;
    use murex_types::config::KernelLang;

    fn manager() -> KernelManager {
        KernelManager::new(
            Arc::new(MockInterpreterFactory::new()),
            KernelManagerOptions::default(),
        )
    }

    #[tokio::test]
    async fn test_create_initializes_kernel() {
        let manager = manager();
        let id = manager
            .create_kernel(KernelSpawnOptions::new(KernelLang::Python))
            .await
            .unwrap();
        let kernel = manager.get_kernel(&id).unwrap();
        assert!(kernel.is_initialized());
        assert_eq!(kernel.status(), KernelStatus::Active);
    }

    #[tokio::test]
    async fn test_spawn_env_reaches_interpreter() {
        let factory = Arc::new(MockInterpreterFactory::new());
        let manager = KernelManager::new(
            Arc::clone(&factory) as Arc<dyn InterpreterFactory>,
            KernelManagerOptions::default(),
        );

        let mut options = KernelSpawnOptions::new(KernelLang::Python);
        options
            .env
            .insert("API_TOKEN".to_string(), "t-123".to_string());
        manager.create_kernel(options).await.unwrap();

        let boot = factory.last_created().unwrap().last_boot_options().unwrap();
        assert_eq!(boot.env.get("API_TOKEN").map(String::as_str), Some("t-123"));
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let manager = manager();
        let id = manager
            .create_kernel(KernelSpawnOptions::new(KernelLang::Python))
            .await
            .unwrap();
        let kernel = manager.get_kernel(&id).unwrap();

        manager.destroy_kernel(&id).await.unwrap();
        assert_eq!(kernel.status(), KernelStatus::Terminated);
        assert!(manager.get_kernel(&id).is_none());

        // Second destroy of the same id is silently fine.
        manager.destroy_kernel(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_kernel_cap() {
        let manager = KernelManager::new(
            Arc::new(MockInterpreterFactory::new()),
            KernelManagerOptions {
                max_kernels: 1,
                ..Default::default()
            },
        );
        manager
            .create_kernel(KernelSpawnOptions::new(KernelLang::Python))
            .await
            .unwrap();
        let err = manager
            .create_kernel(KernelSpawnOptions::new(KernelLang::Python))
            .await
            .unwrap_err();
        assert!(matches!(err, MurexError::KernelQuotaExceeded(1)));
    }

    #[tokio::test]
    async fn test_restart_preserves_id_and_resets_count() {
        let manager = manager();
        let id = manager
            .create_kernel(KernelSpawnOptions::new(KernelLang::Python))
            .await
            .unwrap();
        let kernel = manager.get_kernel(&id).unwrap();

        kernel.execute("1+1", None).await.unwrap();
        assert_eq!(kernel.execution_count(), 1);

        manager.restart_kernel(&id).await.unwrap();
        let same = manager.get_kernel(&id).unwrap();
        assert_eq!(same.id(), kernel.id());
        assert_eq!(same.execution_count(), 0);
        assert!(same.is_initialized());
    }

    #[tokio::test]
    async fn test_restart_unknown_kernel_fails() {
        let manager = manager();
        let bogus: KernelId = serde_json::from_str("\"missing\"").unwrap();
        let err = manager.restart_kernel(&bogus).await.unwrap_err();
        assert!(matches!(err, MurexError::KernelNotFound(_)));
    }
}
