use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use anyhow::{Context, Result, bail};

use crate::app_state::OrchestratorConfig;
use crate::gcs::StorageBackend;
use crate::io_struct::{ChatReqInput, ChatResponse, SubmitJobReqInput, SubmitJobResponse};
use crate::job_store::{JobStatus, JobStore};
use crate::pipeline::{self, StageSource};
use crate::project_pool::ProjectPool;
use crate::vertex::VertexBackend;

/// Monotonic milliseconds since process start, for the cooldown deadline.
/// Wall-clock adjustments must not reopen or extend the cooldown window.
fn now_ms() -> u64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_millis() as u64
}

/// Executes one logical operation against the first credential in a
/// randomized pool traversal that succeeds.
///
/// The only shared mutable state is the cooldown deadline: a circuit
/// breaker tripped by total pool exhaustion. Exhausting every project
/// usually means quota or network trouble, not one bad credential, so the
/// breaker is global rather than per-project.
pub struct Dispatcher {
    pool: Arc<ProjectPool>,
    store: Arc<dyn JobStore>,
    vertex: Arc<dyn VertexBackend>,
    storage: Arc<dyn StorageBackend>,
    config: OrchestratorConfig,
    cooldown_until_ms: AtomicU64,
}

impl Dispatcher {
    pub fn new(
        pool: Arc<ProjectPool>,
        store: Arc<dyn JobStore>,
        vertex: Arc<dyn VertexBackend>,
        storage: Arc<dyn StorageBackend>,
        config: OrchestratorConfig,
    ) -> Self {
        Dispatcher {
            pool,
            store,
            vertex,
            storage,
            config,
            cooldown_until_ms: AtomicU64::new(0),
        }
    }

    fn cooldown_remaining_secs(&self) -> Option<u64> {
        let until = self.cooldown_until_ms.load(Ordering::Acquire);
        let now = now_ms();
        if now < until {
            Some((until - now).div_ceil(1000))
        } else {
            None
        }
    }

    pub fn cooldown_active(&self) -> bool {
        self.cooldown_remaining_secs().is_some()
    }

    fn trip_cooldown(&self) {
        let until = now_ms() + self.config.cooldown_secs * 1000;
        // Concurrent trips race to an equivalent deadline; last write wins.
        self.cooldown_until_ms.store(until, Ordering::Release);
    }

    fn check_cooldown(&self) -> Result<()> {
        if let Some(remaining) = self.cooldown_remaining_secs() {
            bail!(
                "System in cooldown ({}s). Retry in {remaining}s",
                self.config.cooldown_secs
            );
        }
        Ok(())
    }

    /// The shared submission path for stage 1 and every later stage:
    /// cooldown gate, shuffled traversal, cooldown trip on exhaustion.
    /// Returns the project id that accepted the job and the remote handle.
    pub async fn submit_with_failover(
        &self,
        display_name: &str,
        input_uri: &str,
        output_prefix: &str,
    ) -> Result<(String, String)> {
        self.check_cooldown()?;

        let candidates = self.pool.snapshot_shuffled();
        if candidates.is_empty() {
            bail!("No active projects loaded");
        }

        let mut last_error = String::new();
        for ctx in &candidates {
            log::info!("Dispatching {display_name} to {}...", ctx.project_id);
            match self
                .vertex
                .submit_batch_job(
                    ctx,
                    display_name,
                    &self.config.model_id,
                    input_uri,
                    output_prefix,
                )
                .await
            {
                Ok(handle) => return Ok((ctx.project_id.clone(), handle)),
                Err(e) => {
                    last_error = e.to_string();
                    log::warn!("Failed on {}: {last_error}", ctx.project_id);
                }
            }
        }

        log::error!("All projects failed. Triggering cooldown.");
        self.trip_cooldown();
        bail!("All projects failed: {last_error}");
    }

    /// Submit a new job: admission control, one-time stage-1 upload, then
    /// the failover traversal. Admission rejections and total traversal
    /// failure are terminal for this attempt; the caller sees one
    /// aggregated error, never per-project failures.
    pub async fn submit_job(
        &self,
        job_id: &str,
        request: &SubmitJobReqInput,
    ) -> Result<SubmitJobResponse> {
        let mut job = self
            .store
            .get(job_id)
            .with_context(|| format!("job {job_id} not found in store"))?;

        if let Some(remaining) = self.cooldown_remaining_secs() {
            let message = format!(
                "System in cooldown ({}s). Retry in {remaining}s",
                self.config.cooldown_secs
            );
            job.fail(message.clone());
            self.store.update(&job);
            bail!(message);
        }

        let running = self.store.running_count();
        if running >= self.config.max_concurrent_jobs {
            let message = format!(
                "Max concurrent jobs reached ({}). Retry later.",
                self.config.max_concurrent_jobs
            );
            job.fail(message.clone());
            self.store.update(&job);
            bail!(message);
        }

        // Upload stage-1 input once; failover attempts share the object.
        let item = pipeline::build_input_for_stage(
            1,
            self.config.stage_count,
            StageSource::Original {
                id: job_id,
                topic: &request.topic,
            },
        );
        let object_name = format!("{job_id}/stage_1/input.jsonl");
        let input_uri = match self.storage.upload_jsonl(&[item], &object_name).await {
            Ok(uri) => uri,
            Err(e) => {
                log::error!("Storage upload failed: {e}");
                job.fail(format!("Storage upload failed: {e}"));
                self.store.update(&job);
                return Err(e);
            }
        };
        job.input_uri = Some(input_uri.clone());
        self.store.update(&job);

        let display_name = format!("stage-1-{job_id}");
        let output_prefix = format!(
            "gs://{}/{job_id}/stage_1/output/",
            self.config.bucket_name
        );
        match self
            .submit_with_failover(&display_name, &input_uri, &output_prefix)
            .await
        {
            Ok((project_id, handle)) => {
                job.status = JobStatus::Running;
                job.current_stage = 1;
                job.used_project_id = Some(project_id.clone());
                job.remote_job_id = Some(handle);
                job.output_prefix = Some(output_prefix);
                job.touch();
                self.store.update(&job);
                Ok(SubmitJobResponse {
                    job_uuid: job_id.to_string(),
                    status: "STARTED".to_string(),
                    project: project_id,
                })
            }
            Err(e) => {
                job.fail(e.to_string());
                self.store.update(&job);
                Err(e)
            }
        }
    }

    /// Stateless chat dispatch with the same traversal and shared cooldown.
    pub async fn dispatch_chat(&self, req: &ChatReqInput) -> Result<ChatResponse> {
        self.check_cooldown()?;

        let candidates = self.pool.snapshot_shuffled();
        if candidates.is_empty() {
            bail!("No active projects loaded");
        }

        let model_id = req.model.as_deref().unwrap_or(&self.config.model_id);
        let mut last_error = String::new();
        for ctx in &candidates {
            match self.vertex.chat_completion(ctx, model_id, req).await {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    last_error = e.to_string();
                    log::warn!("Chat failed on {}: {last_error}", ctx.project_id);
                }
            }
        }

        self.trip_cooldown();
        bail!("All projects failed chat. Last error: {last_error}");
    }
}
