use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::dispatcher::Dispatcher;
use crate::gcs::{GcsClient, StorageBackend};
use crate::job_store::{JobStore, MemoryJobStore};
use crate::project_pool::{ProjectContext, ProjectPool};
use crate::scheduler::Scheduler;
use crate::vertex::{VertexBackend, VertexClient};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub host: String,
    pub port: u16,
    pub key_dir: PathBuf,
    pub bucket_name: String,
    pub region: String,
    pub model_id: String,
    pub max_concurrent_jobs: usize,
    pub job_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub cooldown_secs: u64,
    pub max_stage_retries: u32,
    pub stage_count: u32,
    pub request_timeout_secs: u64,
}

/// Explicitly constructed application state: the credential pool, the job
/// store, the backend clients and the dispatcher, shared by the HTTP
/// handlers and the scheduler task.
#[derive(Clone)]
pub struct AppState {
    pub config: OrchestratorConfig,
    pub pool: Arc<ProjectPool>,
    pub store: Arc<dyn JobStore>,
    pub vertex: Arc<dyn VertexBackend>,
    pub storage: Arc<dyn StorageBackend>,
    pub dispatcher: Arc<Dispatcher>,
}

impl AppState {
    pub fn new(config: OrchestratorConfig) -> anyhow::Result<Self> {
        let pool = Arc::new(ProjectPool::load(&config.key_dir, &config.region));
        let timeout = Duration::from_secs(config.request_timeout_secs);

        // Storage auth rides on the first loaded context. With an empty
        // pool the placeholder context leaves storage unusable, which
        // surfaces as per-dispatch failures rather than a startup abort.
        let storage_ctx = pool.first().unwrap_or_else(|| {
            log::warn!("Pool is empty; storage client has no credentials");
            ProjectContext {
                project_id: String::new(),
                token: String::new(),
                region: config.region.clone(),
                proxy: None,
            }
        });

        let vertex: Arc<dyn VertexBackend> = Arc::new(VertexClient::new(timeout));
        let storage: Arc<dyn StorageBackend> = Arc::new(GcsClient::new(
            config.bucket_name.clone(),
            storage_ctx,
            timeout,
        )?);
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());

        Ok(Self::with_backends(config, pool, store, vertex, storage))
    }

    /// Wire up state from pre-built components (tests, embedding).
    pub fn with_backends(
        config: OrchestratorConfig,
        pool: Arc<ProjectPool>,
        store: Arc<dyn JobStore>,
        vertex: Arc<dyn VertexBackend>,
        storage: Arc<dyn StorageBackend>,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(
            pool.clone(),
            store.clone(),
            vertex.clone(),
            storage.clone(),
            config.clone(),
        ));
        AppState {
            config,
            pool,
            store,
            vertex,
            storage,
            dispatcher,
        }
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            self.pool.clone(),
            self.store.clone(),
            self.vertex.clone(),
            self.storage.clone(),
            self.dispatcher.clone(),
            self.config.clone(),
        )
    }
}
