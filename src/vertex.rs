use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Value, json};

use crate::io_struct::{ChatReqInput, ChatResponse, GroundingSource, RemoteJobState};
use crate::project_pool::ProjectContext;

/// External batch + chat API boundary. One implementation talks to the
/// Vertex AI REST endpoints; tests inject scripted fakes.
#[async_trait]
pub trait VertexBackend: Send + Sync {
    /// Submit a batch prediction job; returns the opaque resource name.
    async fn submit_batch_job(
        &self,
        ctx: &ProjectContext,
        display_name: &str,
        model_id: &str,
        input_uri: &str,
        output_prefix: &str,
    ) -> Result<String>;

    async fn get_job_status(
        &self,
        ctx: &ProjectContext,
        resource_name: &str,
    ) -> Result<RemoteJobState>;

    async fn chat_completion(
        &self,
        ctx: &ProjectContext,
        model_id: &str,
        req: &ChatReqInput,
    ) -> Result<ChatResponse>;
}

/// HTTP client for the Vertex AI REST API. Clients are built per project
/// (a context may carry its own proxy) and cached by project id.
pub struct VertexClient {
    clients: DashMap<String, reqwest::Client>,
    timeout: Duration,
}

impl VertexClient {
    pub fn new(timeout: Duration) -> Self {
        VertexClient {
            clients: DashMap::new(),
            timeout,
        }
    }

    fn client_for(&self, ctx: &ProjectContext) -> Result<reqwest::Client> {
        if let Some(client) = self.clients.get(&ctx.project_id) {
            return Ok(client.clone());
        }
        let mut builder = reqwest::Client::builder().timeout(self.timeout);
        if let Some(proxy) = &ctx.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        let client = builder.build()?;
        self.clients.insert(ctx.project_id.clone(), client.clone());
        Ok(client)
    }

    fn base_url(ctx: &ProjectContext) -> String {
        format!("https://{}-aiplatform.googleapis.com/v1", ctx.region)
    }

    async fn post_json(
        &self,
        ctx: &ProjectContext,
        url: &str,
        body: &Value,
    ) -> Result<Value> {
        let resp = self
            .client_for(ctx)?
            .post(url)
            .bearer_auth(&ctx.token)
            .json(body)
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;
        let status = resp.status();
        let payload: Value = resp.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            bail!(
                "{} returned {status}: {}",
                ctx.project_id,
                payload["error"]["message"].as_str().unwrap_or("<no detail>")
            );
        }
        Ok(payload)
    }
}

#[async_trait]
impl VertexBackend for VertexClient {
    async fn submit_batch_job(
        &self,
        ctx: &ProjectContext,
        display_name: &str,
        model_id: &str,
        input_uri: &str,
        output_prefix: &str,
    ) -> Result<String> {
        let url = format!(
            "{}/projects/{}/locations/{}/batchPredictionJobs",
            Self::base_url(ctx),
            ctx.project_id,
            ctx.region
        );
        let body = json!({
            "displayName": display_name,
            "model": model_id,
            "inputConfig": {
                "instancesFormat": "jsonl",
                "gcsSource": {"uris": [input_uri]}
            },
            "outputConfig": {
                "predictionsFormat": "jsonl",
                "gcsDestination": {"outputUriPrefix": output_prefix}
            }
        });
        let payload = self.post_json(ctx, &url, &body).await?;
        let name = payload["name"]
            .as_str()
            .context("batch job response missing resource name")?;
        log::info!("Submitted batch job: {name}");
        Ok(name.to_string())
    }

    async fn get_job_status(
        &self,
        ctx: &ProjectContext,
        resource_name: &str,
    ) -> Result<RemoteJobState> {
        let url = format!("{}/{}", Self::base_url(ctx), resource_name);
        let resp = self
            .client_for(ctx)?
            .get(&url)
            .bearer_auth(&ctx.token)
            .send()
            .await
            .with_context(|| format!("status poll for {resource_name} failed"))?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            // Freshly submitted jobs may not be indexed yet; let the
            // caller re-poll instead of treating this as terminal.
            bail!("remote job {resource_name} not yet visible (404)");
        }
        if !status.is_success() {
            bail!("status poll for {resource_name} returned {status}");
        }
        let payload: Value = resp.json().await?;
        let state = payload["state"].as_str().unwrap_or("");
        Ok(RemoteJobState::from_state_name(state))
    }

    async fn chat_completion(
        &self,
        ctx: &ProjectContext,
        model_id: &str,
        req: &ChatReqInput,
    ) -> Result<ChatResponse> {
        let url = format!(
            "{}/projects/{}/locations/{}/publishers/google/models/{}:generateContent",
            Self::base_url(ctx),
            ctx.project_id,
            ctx.region,
            model_id
        );

        let mut generation_config = json!({
            "temperature": req.temperature,
            "topP": req.top_p,
            "topK": req.top_k,
        });
        if let Some(level) = &req.thinking_level {
            generation_config["thinkingConfig"] = json!({"thinkingLevel": level});
        }

        let mut body = json!({
            "contents": [
                {"role": "user", "parts": [{"text": req.query}]}
            ],
            "generationConfig": generation_config,
        });
        if let Some(sys_prompt) = &req.sys_prompt {
            body["systemInstruction"] = json!({"parts": [{"text": sys_prompt}]});
        }
        if req.use_search {
            body["tools"] = json!([{"googleSearch": {}}]);
        }

        let payload = self.post_json(ctx, &url, &body).await?;
        Ok(parse_chat_response(&payload))
    }
}

/// Flatten a generateContent response into text plus grounding sources.
pub fn parse_chat_response(payload: &Value) -> ChatResponse {
    let candidate = &payload["candidates"][0];
    let text = candidate["content"]["parts"]
        .as_array()
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part["text"].as_str())
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    let grounding_sources = candidate["groundingMetadata"]["groundingChunks"]
        .as_array()
        .map(|chunks| {
            chunks
                .iter()
                .filter_map(|chunk| {
                    let web = &chunk["web"];
                    web["uri"].as_str().map(|uri| GroundingSource {
                        title: web["title"].as_str().unwrap_or("").to_string(),
                        uri: uri.to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    ChatResponse {
        text,
        grounding_sources,
    }
}
