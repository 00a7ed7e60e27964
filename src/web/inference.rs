use anyhow::Context;
use serde::Deserialize;
use std::time::Duration;

use crate::config::InferenceConfig;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const FALLBACK_OUTPUT: &str = "No output from pipeline";

/// Client for an inference-observability pipeline's data-stream endpoint.
#[derive(Clone)]
pub struct InferenceClient {
    http: reqwest::blocking::Client,
    base_url: String,
    pipeline_id: String,
    api_key: String,
}

#[derive(Deserialize)]
struct StreamResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    results: Vec<serde_json::Value>,
}

impl InferenceClient {
    /// The API key comes from the environment variable the config names.
    pub fn from_config(config: &InferenceConfig) -> anyhow::Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .with_context(|| format!("environment variable {} is not set", config.api_key_env))?;
        let http = reqwest::blocking::Client::builder()
            .user_agent(concat!("mapfetch/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            pipeline_id: config.pipeline_id.clone(),
            api_key,
        })
    }

    /// Stream one user-query row through the pipeline and return the text the
    /// pipeline produced, or a fixed fallback when it produced none.
    pub fn stream_row(&self, user_query: &str) -> anyhow::Result<String> {
        let url = format!(
            "{}/inference-pipelines/{}/data-stream",
            self.base_url, self.pipeline_id
        );
        let body = serde_json::json!({
            "config": {
                "input_variable_names": ["user_query"],
                "output_column_name": "output",
                "num_of_token_column_name": "tokens",
                "cost_column_name": "cost",
                "timestamp_column_name": "timestamp",
            },
            "rows": [
                {"user_query": user_query},
            ],
        });
        log::debug!("Streaming row to inference pipeline {}", self.pipeline_id);
        let response: StreamResponse = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .context("sending row to inference pipeline")?
            .error_for_status()
            .context("inference pipeline rejected the row")?
            .json()
            .context("parsing inference pipeline response")?;

        if !response.success {
            return Ok(FALLBACK_OUTPUT.to_string());
        }
        Ok(response
            .results
            .first()
            .and_then(|result| result["output"].as_str())
            .map(str::to_string)
            .unwrap_or_else(|| FALLBACK_OUTPUT.to_string()))
    }
}
