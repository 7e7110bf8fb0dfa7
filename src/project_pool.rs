use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use rand::Rng;
use rand::seq::SliceRandom;
use serde_json::Value;

/// Key files whose project id matches this pattern are AI Studio keys and
/// cannot run batch jobs; they are skipped at load time.
const EXCLUDED_ID_PATTERN: &str = "gen-lang-client";

/// One set of credentials: a cloud project plus the auth material and
/// region needed to call its APIs. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct ProjectContext {
    pub project_id: String,
    pub token: String,
    pub region: String,
    pub proxy: Option<String>,
}

#[derive(Debug, Default)]
struct PoolSnapshot {
    contexts: Vec<ProjectContext>,
    by_id: HashMap<String, usize>,
}

impl PoolSnapshot {
    fn from_records(records: Vec<(String, Value)>, default_region: &str) -> Self {
        let mut snapshot = PoolSnapshot::default();
        for (source, record) in records {
            let project_id = record["project_id"].as_str().unwrap_or("").trim().to_string();
            if project_id.is_empty() {
                log::warn!("Key {source} is missing 'project_id', skipping");
                continue;
            }
            if snapshot.by_id.contains_key(&project_id) {
                log::warn!("Duplicate project_id {project_id} in {source}, skipping duplicate key");
                continue;
            }
            if project_id.contains(EXCLUDED_ID_PATTERN) {
                log::info!("Skipping AI Studio key: {project_id}");
                continue;
            }

            let token = record["token"]
                .as_str()
                .or_else(|| record["private_key"].as_str())
                .unwrap_or("")
                .to_string();
            let region = record["region"]
                .as_str()
                .unwrap_or(default_region)
                .to_string();
            let proxy = record["proxy"].as_str().map(|p| p.to_string());

            snapshot.by_id.insert(project_id.clone(), snapshot.contexts.len());
            snapshot.contexts.push(ProjectContext {
                project_id: project_id.clone(),
                token,
                region,
                proxy,
            });
            log::info!("Loaded project: {project_id}");
        }
        snapshot
    }
}

/// The pool of loaded project credentials.
///
/// Read-only after load except for an administrative `reload`, which swaps
/// the whole snapshot atomically: in-flight dispatch traversals see either
/// the old pool or the new one, never a half-updated mix. An empty pool is
/// a valid degraded state, signaled to callers via `Option`/empty vectors.
pub struct ProjectPool {
    snapshot: RwLock<Arc<PoolSnapshot>>,
}

impl ProjectPool {
    /// Scan `*.json` key files under `key_dir`. Malformed files and records
    /// are skipped with a logged warning, never a startup failure.
    pub fn load(key_dir: &Path, default_region: &str) -> Self {
        let snapshot = PoolSnapshot::from_records(read_key_records(key_dir), default_region);
        log::info!("Successfully loaded {} projects into pool", snapshot.contexts.len());
        ProjectPool {
            snapshot: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// Build a pool from already-constructed contexts (tests, embedding).
    pub fn from_contexts(contexts: Vec<ProjectContext>) -> Self {
        let mut snapshot = PoolSnapshot::default();
        for ctx in contexts {
            if snapshot.by_id.contains_key(&ctx.project_id) {
                continue;
            }
            snapshot.by_id.insert(ctx.project_id.clone(), snapshot.contexts.len());
            snapshot.contexts.push(ctx);
        }
        ProjectPool {
            snapshot: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// Administrative reload: rebuild from disk and swap the snapshot.
    pub fn reload(&self, key_dir: &Path, default_region: &str) {
        let snapshot = PoolSnapshot::from_records(read_key_records(key_dir), default_region);
        log::info!("Reloaded pool with {} projects", snapshot.contexts.len());
        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(snapshot);
    }

    fn current(&self) -> Arc<PoolSnapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.current().contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Uniform random choice; `None` for an empty pool, never a panic.
    pub fn pick_random(&self) -> Option<ProjectContext> {
        let snapshot = self.current();
        if snapshot.contexts.is_empty() {
            return None;
        }
        let mut rng = rand::rng();
        let index = rng.random_range(0..snapshot.contexts.len());
        Some(snapshot.contexts[index].clone())
    }

    pub fn lookup(&self, project_id: &str) -> Option<ProjectContext> {
        let snapshot = self.current();
        snapshot
            .by_id
            .get(project_id)
            .map(|&index| snapshot.contexts[index].clone())
    }

    /// A randomized full ordering of the pool, used for failover traversal.
    pub fn snapshot_shuffled(&self) -> Vec<ProjectContext> {
        let mut contexts = self.current().contexts.to_vec();
        let mut rng = rand::rng();
        contexts.shuffle(&mut rng);
        contexts
    }

    /// The first loaded context, used for one-time side actions at startup.
    pub fn first(&self) -> Option<ProjectContext> {
        self.current().contexts.first().cloned()
    }
}

fn read_key_records(key_dir: &Path) -> Vec<(String, Value)> {
    let entries = match std::fs::read_dir(key_dir) {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("Key directory {} not readable: {e}", key_dir.display());
            return Vec::new();
        }
    };

    let mut paths: Vec<_> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    let mut records = Vec::new();
    for path in paths {
        let source = path.display().to_string();
        match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<Value>(&content) {
                Ok(record) => records.push((source, record)),
                Err(e) => log::error!("Failed to parse key {source}: {e}"),
            },
            Err(e) => log::error!("Failed to read key {source}: {e}"),
        }
    }
    records
}
