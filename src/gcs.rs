use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::Value;

use crate::io_struct::StageItem;
use crate::project_pool::ProjectContext;

/// External storage boundary: JSONL batch input upload and batch output
/// readback. Tests inject in-memory fakes.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Upload the stage input batch as one JSON object per line; returns
    /// the storage URI of the created object.
    async fn upload_jsonl(&self, items: &[StageItem], object_name: &str) -> Result<String>;

    /// Read every prediction output object under the prefix. Objects that
    /// do not match the batch API's output naming convention are ignored.
    async fn read_batch_output(&self, prefix: &str) -> Result<Vec<Value>>;

    /// One-time side action: make sure the shared bucket exists. The
    /// caller logs and discards the outcome; it never blocks startup.
    async fn ensure_bucket(&self) -> Result<()>;
}

const STORAGE_API: &str = "https://storage.googleapis.com/storage/v1";
const STORAGE_UPLOAD_API: &str = "https://storage.googleapis.com/upload/storage/v1";

/// GCS JSON API client bound to the shared bucket, authenticated with one
/// project context (the first loaded one).
pub struct GcsClient {
    bucket: String,
    ctx: ProjectContext,
    client: reqwest::Client,
}

impl GcsClient {
    pub fn new(bucket: String, ctx: ProjectContext, timeout: Duration) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if let Some(proxy) = &ctx.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        Ok(GcsClient {
            bucket,
            ctx,
            client: builder.build()?,
        })
    }
}

/// Percent-encode an object name for use as a single URL path segment.
fn encode_object_name(name: &str) -> String {
    let mut encoded = String::with_capacity(name.len());
    for byte in name.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}

/// True for objects the batch API wrote as prediction output.
fn is_prediction_output(object_name: &str) -> bool {
    object_name.ends_with(".jsonl") && object_name.contains("prediction-")
}

#[async_trait]
impl StorageBackend for GcsClient {
    async fn upload_jsonl(&self, items: &[StageItem], object_name: &str) -> Result<String> {
        let lines = items
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?;
        let content = lines.join("\n");

        let url = format!("{STORAGE_UPLOAD_API}/b/{}/o", self.bucket);
        let resp = self
            .client
            .post(&url)
            .query(&[("uploadType", "media"), ("name", object_name)])
            .bearer_auth(&self.ctx.token)
            .header("content-type", "application/jsonl")
            .body(content)
            .send()
            .await
            .context("upload request failed")?;
        if !resp.status().is_success() {
            bail!("upload of {object_name} returned {}", resp.status());
        }

        let uri = format!("gs://{}/{}", self.bucket, object_name);
        log::info!("Uploaded input to {uri}");
        Ok(uri)
    }

    async fn read_batch_output(&self, prefix: &str) -> Result<Vec<Value>> {
        let url = format!("{STORAGE_API}/b/{}/o", self.bucket);
        let resp = self
            .client
            .get(&url)
            .query(&[("prefix", prefix)])
            .bearer_auth(&self.ctx.token)
            .send()
            .await
            .context("list request failed")?;
        if !resp.status().is_success() {
            bail!("listing {prefix} returned {}", resp.status());
        }
        let listing: Value = resp.json().await?;

        let mut results = Vec::new();
        let objects = listing["items"].as_array().cloned().unwrap_or_default();
        for object in objects {
            let Some(name) = object["name"].as_str() else {
                continue;
            };
            if !is_prediction_output(name) {
                continue;
            }
            let media_url = format!(
                "{STORAGE_API}/b/{}/o/{}",
                self.bucket,
                encode_object_name(name)
            );
            let resp = self
                .client
                .get(&media_url)
                .query(&[("alt", "media")])
                .bearer_auth(&self.ctx.token)
                .send()
                .await
                .with_context(|| format!("download of {name} failed"))?;
            if !resp.status().is_success() {
                bail!("download of {name} returned {}", resp.status());
            }
            let content = resp.text().await?;
            for line in content.lines().filter(|line| !line.trim().is_empty()) {
                match serde_json::from_str::<Value>(line) {
                    Ok(item) => results.push(item),
                    Err(e) => log::error!("Failed to parse line of {name}: {e}"),
                }
            }
        }
        log::info!("Read {} items from {prefix}", results.len());
        Ok(results)
    }

    async fn ensure_bucket(&self) -> Result<()> {
        let url = format!("{STORAGE_API}/b/{}", self.bucket);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.ctx.token)
            .send()
            .await
            .context("bucket lookup failed")?;
        if resp.status().is_success() {
            log::info!("Bucket {} already exists", self.bucket);
            return Ok(());
        }
        if resp.status() != reqwest::StatusCode::NOT_FOUND {
            bail!("bucket lookup returned {}", resp.status());
        }

        log::info!(
            "Bucket {} not found, creating in {}",
            self.bucket,
            self.ctx.region
        );
        let create_url = format!("{STORAGE_API}/b");
        let resp = self
            .client
            .post(&create_url)
            .query(&[("project", self.ctx.project_id.as_str())])
            .bearer_auth(&self.ctx.token)
            .json(&serde_json::json!({
                "name": self.bucket,
                "location": self.ctx.region,
            }))
            .send()
            .await
            .context("bucket create failed")?;
        if !resp.status().is_success() {
            bail!("bucket create returned {}", resp.status());
        }
        log::info!("Bucket {} created successfully", self.bucket);
        Ok(())
    }
}
