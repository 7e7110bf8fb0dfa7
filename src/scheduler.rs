use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;

use crate::app_state::OrchestratorConfig;
use crate::dispatcher::Dispatcher;
use crate::gcs::StorageBackend;
use crate::io_struct::RemoteJobState;
use crate::job_store::{Job, JobStatus, JobStore};
use crate::pipeline::{self, StageSource};
use crate::project_pool::ProjectPool;
use crate::vertex::VertexBackend;

/// Periodic sweep over all RUNNING jobs, advancing each through the stage
/// pipeline independently.
///
/// A single task drives the loop and the next tick waits for the previous
/// sweep to finish, so sweeps never overlap: every job record has exactly
/// one writer once the dispatcher hands it over.
pub struct Scheduler {
    pool: Arc<ProjectPool>,
    store: Arc<dyn JobStore>,
    vertex: Arc<dyn VertexBackend>,
    storage: Arc<dyn StorageBackend>,
    dispatcher: Arc<Dispatcher>,
    config: OrchestratorConfig,
}

impl Scheduler {
    pub fn new(
        pool: Arc<ProjectPool>,
        store: Arc<dyn JobStore>,
        vertex: Arc<dyn VertexBackend>,
        storage: Arc<dyn StorageBackend>,
        dispatcher: Arc<Dispatcher>,
        config: OrchestratorConfig,
    ) -> Self {
        Scheduler {
            pool,
            store,
            vertex,
            storage,
            dispatcher,
            config,
        }
    }

    pub async fn run(self) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.sweep_interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.sweep().await;
        }
    }

    /// One pass over the RUNNING jobs. A failure while handling one job is
    /// logged and never aborts the rest of the sweep.
    pub async fn sweep(&self) {
        let mut jobs = self.store.running_jobs();
        if jobs.is_empty() {
            return;
        }
        if jobs.len() > self.config.max_concurrent_jobs {
            // Advisory only; admission control happens at submission time.
            log::warn!(
                "RUNNING jobs exceed limit: {}/{}",
                jobs.len(),
                self.config.max_concurrent_jobs
            );
        }

        for job in &mut jobs {
            match self.process_job(job).await {
                Ok(true) => self.store.update(job),
                Ok(false) => {}
                Err(e) => log::error!("Failed to process job {}: {e}", job.id),
            }
        }
    }

    /// Returns Ok(true) when the job record was mutated and must be
    /// persisted, Ok(false) to leave it untouched until the next sweep.
    async fn process_job(&self, job: &mut Job) -> Result<bool> {
        // Zombie check against the job's own progress clock: any stage
        // advancement refreshes updated_at and resets the window.
        let idle_secs = Utc::now().signed_duration_since(job.updated_at).num_seconds();
        if idle_secs > self.config.job_timeout_secs as i64 {
            log::error!("Job {} timed out after {idle_secs}s without progress", job.id);
            job.fail("Timeout: Job stuck in RUNNING");
            return Ok(true);
        }

        // Lost bookkeeping is unrecoverable; retrying cannot restore a
        // missing reference.
        let Some(project_id) = job.used_project_id.clone() else {
            job.fail("Missing project assignment");
            return Ok(true);
        };
        let Some(ctx) = self.pool.lookup(&project_id) else {
            log::error!("Project {project_id} not found for job {}", job.id);
            job.fail(format!("Project {project_id} no longer in pool"));
            return Ok(true);
        };
        let Some(handle) = job.remote_job_id.clone() else {
            log::error!("Job {} missing remote job handle", job.id);
            job.fail("Missing remote job resource name");
            return Ok(true);
        };

        let state = match self.vertex.get_job_status(&ctx, &handle).await {
            Ok(state) => state,
            Err(e) => {
                // Transient poll failure: re-poll on the next sweep.
                log::warn!("Status poll for job {} deferred: {e}", job.id);
                return Ok(false);
            }
        };

        match state {
            RemoteJobState::Succeeded => self.advance_stage(job).await,
            RemoteJobState::Failed | RemoteJobState::Cancelled => {
                log::warn!("Job {} remote state: {state:?}", job.id);
                self.handle_stage_failure(job, format!("Remote job failed: {state:?}"))
                    .await
            }
            RemoteJobState::Pending | RemoteJobState::Running => Ok(false),
        }
    }

    /// The current stage finished remotely: either the whole pipeline is
    /// done, or the validated outputs become the next stage's input.
    async fn advance_stage(&self, job: &mut Job) -> Result<bool> {
        let stage = job.current_stage;
        if stage >= self.config.stage_count {
            log::info!("Job {} completed all {stage} stages", job.id);
            job.status = JobStatus::Completed;
            job.result_summary = Some(format!("Pipeline completed after {stage} stages"));
            job.touch();
            return Ok(true);
        }

        let Some(output_prefix) = job.output_prefix.clone() else {
            job.fail("Missing output location for finished stage");
            return Ok(true);
        };
        let object_prefix = output_prefix
            .strip_prefix(&format!("gs://{}/", self.config.bucket_name))
            .unwrap_or(&output_prefix)
            .to_string();

        let outputs = match self.storage.read_batch_output(&object_prefix).await {
            Ok(outputs) => outputs,
            Err(e) => {
                log::warn!("Output read for job {} deferred: {e}", job.id);
                return Ok(false);
            }
        };

        let next_stage = stage + 1;
        let mut next_items = Vec::new();
        let mut rejected = 0usize;
        for raw in &outputs {
            match pipeline::validate_output(stage, raw) {
                Ok(()) => next_items.push(pipeline::build_input_for_stage(
                    next_stage,
                    self.config.stage_count,
                    StageSource::Previous(raw),
                )),
                Err(reason) => {
                    rejected += 1;
                    log::warn!("Job {} stage {stage} item rejected: {reason}", job.id);
                }
            }
        }

        if next_items.is_empty() {
            return self
                .handle_stage_failure(
                    job,
                    format!(
                        "Stage {stage} produced no valid output ({} items, {rejected} rejected)",
                        outputs.len()
                    ),
                )
                .await;
        }

        let object_name = format!("{}/stage_{next_stage}/input.jsonl", job.id);
        let input_uri = match self.storage.upload_jsonl(&next_items, &object_name).await {
            Ok(uri) => uri,
            Err(e) => {
                log::warn!("Input upload for job {} deferred: {e}", job.id);
                return Ok(false);
            }
        };

        let display_name = format!("stage-{next_stage}-{}", job.id);
        let next_prefix = format!(
            "gs://{}/{}/stage_{next_stage}/output/",
            self.config.bucket_name, job.id
        );
        match self
            .dispatcher
            .submit_with_failover(&display_name, &input_uri, &next_prefix)
            .await
        {
            Ok((project_id, handle)) => {
                log::info!(
                    "Job {} advanced to stage {next_stage} on {project_id}",
                    job.id
                );
                job.current_stage = next_stage;
                job.used_project_id = Some(project_id);
                job.remote_job_id = Some(handle);
                job.input_uri = Some(input_uri);
                job.output_prefix = Some(next_prefix);
                job.touch();
                Ok(true)
            }
            Err(e) => {
                self.handle_stage_failure(job, format!("Resubmission for stage {next_stage} failed: {e}"))
                    .await
            }
        }
    }

    /// Bounded retry: below the ceiling the job stays RUNNING and the
    /// current stage is resubmitted for a fresh remote handle (re-polling
    /// a handle the external API already reports failed cannot succeed).
    /// At the ceiling the job is forced to FAILED with the recorded reason.
    async fn handle_stage_failure(&self, job: &mut Job, reason: String) -> Result<bool> {
        if job.retry_count >= self.config.max_stage_retries {
            log::error!("Job {} out of retries: {reason}", job.id);
            job.fail(reason);
            return Ok(true);
        }

        job.retry_count += 1;
        log::warn!(
            "Job {} stage {} failed ({reason}), retry {}/{}",
            job.id,
            job.current_stage,
            job.retry_count,
            self.config.max_stage_retries
        );

        if let (Some(input_uri), Some(output_prefix)) =
            (job.input_uri.clone(), job.output_prefix.clone())
        {
            let display_name = format!(
                "stage-{}-{}-retry-{}",
                job.current_stage, job.id, job.retry_count
            );
            match self
                .dispatcher
                .submit_with_failover(&display_name, &input_uri, &output_prefix)
                .await
            {
                Ok((project_id, handle)) => {
                    job.used_project_id = Some(project_id);
                    job.remote_job_id = Some(handle);
                }
                Err(e) => {
                    // Stay RUNNING; the next sweep retries the whole step.
                    log::warn!("Retry resubmission for job {} failed: {e}", job.id);
                }
            }
        }

        job.touch();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use anyhow::bail;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::{Value, json};

    use super::*;
    use crate::io_struct::{ChatReqInput, ChatResponse, StageItem};
    use crate::job_store::MemoryJobStore;
    use crate::project_pool::ProjectContext;

    #[derive(Clone, Copy)]
    enum ScriptedStatus {
        State(RemoteJobState),
        Transient,
    }

    struct SchedVertex {
        status: Mutex<ScriptedStatus>,
        submit_seq: AtomicU32,
        submit_fails: bool,
    }

    impl SchedVertex {
        fn with_status(status: ScriptedStatus) -> Self {
            SchedVertex {
                status: Mutex::new(status),
                submit_seq: AtomicU32::new(0),
                submit_fails: false,
            }
        }
    }

    #[async_trait]
    impl VertexBackend for SchedVertex {
        async fn submit_batch_job(
            &self,
            ctx: &ProjectContext,
            display_name: &str,
            _model_id: &str,
            _input_uri: &str,
            _output_prefix: &str,
        ) -> Result<String> {
            if self.submit_fails {
                bail!("submit rejected on {}", ctx.project_id);
            }
            let seq = self.submit_seq.fetch_add(1, Ordering::SeqCst);
            Ok(format!(
                "projects/{}/batchPredictionJobs/{display_name}-{seq}",
                ctx.project_id
            ))
        }

        async fn get_job_status(
            &self,
            _ctx: &ProjectContext,
            _resource_name: &str,
        ) -> Result<RemoteJobState> {
            match *self.status.lock().unwrap() {
                ScriptedStatus::State(state) => Ok(state),
                ScriptedStatus::Transient => bail!("connection reset"),
            }
        }

        async fn chat_completion(
            &self,
            _ctx: &ProjectContext,
            _model_id: &str,
            _req: &ChatReqInput,
        ) -> Result<ChatResponse> {
            bail!("chat not used by the scheduler")
        }
    }

    struct SchedStorage {
        outputs: Vec<Value>,
        uploads: Mutex<Vec<(String, Vec<StageItem>)>>,
    }

    impl SchedStorage {
        fn with_outputs(outputs: Vec<Value>) -> Self {
            SchedStorage {
                outputs,
                uploads: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl StorageBackend for SchedStorage {
        async fn upload_jsonl(&self, items: &[StageItem], object_name: &str) -> Result<String> {
            self.uploads
                .lock()
                .unwrap()
                .push((object_name.to_string(), items.to_vec()));
            Ok(format!("gs://bucket/{object_name}"))
        }

        async fn read_batch_output(&self, _prefix: &str) -> Result<Vec<Value>> {
            Ok(self.outputs.clone())
        }

        async fn ensure_bucket(&self) -> Result<()> {
            Ok(())
        }
    }

    fn test_config() -> OrchestratorConfig {
        OrchestratorConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            key_dir: "keys".into(),
            bucket_name: "bucket".to_string(),
            region: "us-central1".to_string(),
            model_id: "publishers/google/models/gemini-3-flash-preview".to_string(),
            max_concurrent_jobs: 5,
            job_timeout_secs: 7200,
            sweep_interval_secs: 60,
            cooldown_secs: 60,
            max_stage_retries: 3,
            stage_count: 7,
            request_timeout_secs: 600,
        }
    }

    fn running_job(id: &str, stage: u32) -> Job {
        let mut job = Job::new(id.to_string());
        job.status = JobStatus::Running;
        job.current_stage = stage;
        job.used_project_id = Some("P".to_string());
        job.remote_job_id = Some(format!("projects/P/batchPredictionJobs/stage-{stage}-{id}"));
        job.input_uri = Some(format!("gs://bucket/{id}/stage_{stage}/input.jsonl"));
        job.output_prefix = Some(format!("gs://bucket/{id}/stage_{stage}/output/"));
        job
    }

    fn output_with_text(custom_id: &str, text: &str) -> Value {
        json!({
            "custom_id": custom_id,
            "prediction": {
                "candidates": [
                    {"content": {"parts": [{"text": text}]}}
                ]
            }
        })
    }

    struct Harness {
        store: Arc<MemoryJobStore>,
        storage: Arc<SchedStorage>,
        scheduler: Scheduler,
    }

    fn harness(vertex: SchedVertex, storage: SchedStorage, config: OrchestratorConfig) -> Harness {
        let pool = Arc::new(ProjectPool::from_contexts(vec![ProjectContext {
            project_id: "P".to_string(),
            token: "token".to_string(),
            region: "us-central1".to_string(),
            proxy: None,
        }]));
        let store = Arc::new(MemoryJobStore::new());
        let vertex = Arc::new(vertex);
        let storage = Arc::new(storage);
        let dispatcher = Arc::new(Dispatcher::new(
            pool.clone(),
            store.clone(),
            vertex.clone(),
            storage.clone(),
            config.clone(),
        ));
        let scheduler = Scheduler::new(pool, store.clone(), vertex, storage.clone(), dispatcher, config);
        Harness {
            store,
            storage,
            scheduler,
        }
    }

    #[tokio::test]
    async fn test_zombie_job_is_forced_to_failed() {
        let h = harness(
            SchedVertex::with_status(ScriptedStatus::State(RemoteJobState::Running)),
            SchedStorage::with_outputs(vec![]),
            test_config(),
        );
        let mut job = running_job("job-1", 3);
        job.updated_at = Utc::now() - chrono::Duration::hours(3);
        h.store.insert(job);

        h.scheduler.sweep().await;

        let job = h.store.get("job-1").unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.result_summary.unwrap().contains("Timeout"));
    }

    #[tokio::test]
    async fn test_missing_handle_and_unknown_project_are_terminal() {
        let h = harness(
            SchedVertex::with_status(ScriptedStatus::State(RemoteJobState::Running)),
            SchedStorage::with_outputs(vec![]),
            test_config(),
        );
        let mut no_handle = running_job("no-handle", 1);
        no_handle.remote_job_id = None;
        h.store.insert(no_handle);

        let mut gone_project = running_job("gone-project", 1);
        gone_project.used_project_id = Some("missing".to_string());
        h.store.insert(gone_project);

        h.scheduler.sweep().await;

        let job = h.store.get("no-handle").unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.result_summary.unwrap().contains("remote job"));

        let job = h.store.get("gone-project").unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.result_summary.unwrap().contains("missing"));
    }

    #[tokio::test]
    async fn test_transient_poll_error_leaves_job_untouched() {
        let h = harness(
            SchedVertex::with_status(ScriptedStatus::Transient),
            SchedStorage::with_outputs(vec![]),
            test_config(),
        );
        let job = running_job("job-1", 2);
        let before = job.updated_at;
        h.store.insert(job);

        h.scheduler.sweep().await;

        let job = h.store.get("job-1").unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.updated_at, before);
    }

    #[tokio::test]
    async fn test_succeeded_stage_advances_with_validated_items_only() {
        let outputs = vec![
            output_with_text("job-1", "Chapter text one"),
            output_with_text("job-1", "As an AI, I cannot write this"),
            output_with_text("job-1", "Chapter text three"),
        ];
        let h = harness(
            SchedVertex::with_status(ScriptedStatus::State(RemoteJobState::Succeeded)),
            SchedStorage::with_outputs(outputs),
            test_config(),
        );
        let job = running_job("job-1", 6);
        let old_handle = job.remote_job_id.clone().unwrap();
        h.store.insert(job);

        h.scheduler.sweep().await;

        let job = h.store.get("job-1").unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.current_stage, 7);
        assert_ne!(job.remote_job_id.unwrap(), old_handle);
        assert_eq!(job.retry_count, 0);

        // The refused item was filtered out of the next batch.
        let uploads = h.storage.uploads.lock().unwrap();
        assert_eq!(uploads.len(), 1);
        let (object_name, items) = &uploads[0];
        assert_eq!(object_name, "job-1/stage_7/input.jsonl");
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|item| item.custom_id == "job-1"));
    }

    #[tokio::test]
    async fn test_final_stage_success_completes_the_job() {
        let h = harness(
            SchedVertex::with_status(ScriptedStatus::State(RemoteJobState::Succeeded)),
            SchedStorage::with_outputs(vec![output_with_text("job-1", "done")]),
            test_config(),
        );
        h.store.insert(running_job("job-1", 7));

        h.scheduler.sweep().await;

        let job = h.store.get("job-1").unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.result_summary.unwrap().contains("completed"));
        // Nothing was uploaded for a stage past the last one.
        assert!(h.storage.uploads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remote_failure_below_ceiling_resubmits_and_stays_running() {
        let h = harness(
            SchedVertex::with_status(ScriptedStatus::State(RemoteJobState::Failed)),
            SchedStorage::with_outputs(vec![]),
            test_config(),
        );
        let job = running_job("job-1", 2);
        let old_handle = job.remote_job_id.clone().unwrap();
        h.store.insert(job);

        h.scheduler.sweep().await;

        let job = h.store.get("job-1").unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.current_stage, 2);
        // Fresh handle for the resubmitted stage.
        assert_ne!(job.remote_job_id.unwrap(), old_handle);
    }

    #[tokio::test]
    async fn test_retry_ceiling_boundary() {
        let config = test_config();

        // One below the ceiling: stays RUNNING.
        let h = harness(
            SchedVertex::with_status(ScriptedStatus::State(RemoteJobState::Failed)),
            SchedStorage::with_outputs(vec![]),
            config.clone(),
        );
        let mut job = running_job("job-1", 2);
        job.retry_count = config.max_stage_retries - 1;
        h.store.insert(job);
        h.scheduler.sweep().await;
        let job = h.store.get("job-1").unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.retry_count, config.max_stage_retries);

        // At the ceiling: forced to FAILED with the recorded reason.
        let h = harness(
            SchedVertex::with_status(ScriptedStatus::State(RemoteJobState::Failed)),
            SchedStorage::with_outputs(vec![]),
            config.clone(),
        );
        let mut job = running_job("job-2", 2);
        job.retry_count = config.max_stage_retries;
        h.store.insert(job);
        h.scheduler.sweep().await;
        let job = h.store.get("job-2").unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.result_summary.unwrap().contains("Remote job failed"));
    }

    #[tokio::test]
    async fn test_all_outputs_invalid_counts_as_stage_failure() {
        let outputs = vec![
            output_with_text("job-1", ""),
            output_with_text("job-1", "I cannot continue"),
        ];
        let h = harness(
            SchedVertex::with_status(ScriptedStatus::State(RemoteJobState::Succeeded)),
            SchedStorage::with_outputs(outputs),
            test_config(),
        );
        h.store.insert(running_job("job-1", 3));

        h.scheduler.sweep().await;

        let job = h.store.get("job-1").unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.current_stage, 3);
    }

    #[tokio::test]
    async fn test_one_bad_job_does_not_block_the_sweep() {
        let h = harness(
            SchedVertex::with_status(ScriptedStatus::State(RemoteJobState::Running)),
            SchedStorage::with_outputs(vec![]),
            test_config(),
        );
        let mut broken = running_job("broken", 1);
        broken.remote_job_id = None;
        h.store.insert(broken);

        let mut zombie = running_job("zombie", 1);
        zombie.updated_at = Utc::now() - chrono::Duration::hours(3);
        h.store.insert(zombie);

        h.scheduler.sweep().await;

        assert_eq!(h.store.get("broken").unwrap().status, JobStatus::Failed);
        assert_eq!(h.store.get("zombie").unwrap().status, JobStatus::Failed);
    }
}
