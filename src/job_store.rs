use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    /// Terminal jobs are never mutated again by the scheduler.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Persistent record of one logical submission. Single-writer discipline:
/// the dispatcher performs PENDING -> RUNNING, the scheduler everything
/// after, and sweeps never overlap.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub current_stage: u32,
    pub used_project_id: Option<String>,
    pub remote_job_id: Option<String>,
    pub input_uri: Option<String>,
    pub output_prefix: Option<String>,
    pub retry_count: u32,
    pub result_summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(id: String) -> Self {
        let now = Utc::now();
        Job {
            id,
            status: JobStatus::Pending,
            current_stage: 0,
            used_project_id: None,
            remote_job_id: None,
            input_uri: None,
            output_prefix: None,
            retry_count: 0,
            result_summary: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.result_summary = Some(reason.into());
        self.touch();
    }
}

/// CRUD boundary over job records. A database-backed implementation is an
/// external concern; the orchestrator only needs these operations.
pub trait JobStore: Send + Sync {
    fn insert(&self, job: Job);
    fn get(&self, id: &str) -> Option<Job>;
    fn update(&self, job: &Job);
    fn running_jobs(&self) -> Vec<Job>;
    fn running_count(&self) -> usize;
}

/// In-memory store backed by a concurrent map.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: DashMap<String, Job>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemoryJobStore {
    fn insert(&self, job: Job) {
        self.jobs.insert(job.id.clone(), job);
    }

    fn get(&self, id: &str) -> Option<Job> {
        self.jobs.get(id).map(|entry| entry.clone())
    }

    fn update(&self, job: &Job) {
        self.jobs.insert(job.id.clone(), job.clone());
    }

    fn running_jobs(&self) -> Vec<Job> {
        self.jobs
            .iter()
            .filter(|entry| entry.status == JobStatus::Running)
            .map(|entry| entry.clone())
            .collect()
    }

    fn running_count(&self) -> usize {
        self.jobs
            .iter()
            .filter(|entry| entry.status == JobStatus::Running)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_job_starts_pending_at_stage_zero() {
        let job = Job::new("job-1".to_string());
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.current_stage, 0);
        assert_eq!(job.retry_count, 0);
        assert!(!job.status.is_terminal());
    }

    #[test]
    fn test_running_query_and_count() {
        let store = MemoryJobStore::new();
        let mut a = Job::new("a".to_string());
        a.status = JobStatus::Running;
        let mut b = Job::new("b".to_string());
        b.status = JobStatus::Failed;
        store.insert(a);
        store.insert(b);
        store.insert(Job::new("c".to_string()));

        assert_eq!(store.running_count(), 1);
        let running = store.running_jobs();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, "a");
    }

    #[test]
    fn test_update_replaces_record() {
        let store = MemoryJobStore::new();
        store.insert(Job::new("a".to_string()));
        let mut job = store.get("a").unwrap();
        job.fail("boom");
        store.update(&job);
        let job = store.get("a").unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.result_summary.as_deref(), Some("boom"));
    }
}
