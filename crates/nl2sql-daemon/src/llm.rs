//! Model client used to turn a question into raw (unprocessed) SQL text.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

const ERROR_BODY_PREVIEW_CHARS: usize = 500;

/// Everything the model needs to draft a statement for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub model: String,
    pub question: String,
    pub dialect: String,
    pub schema_text: String,
    pub limit_max: u64,
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model request error: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("model returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to decode model response: {0}")]
    Decode(#[source] reqwest::Error),
}

/// Source of raw model output. The compile handler only depends on this.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn generate_sql(&self, request: &GenerationRequest) -> Result<String, ModelError>;
}

/// Client for an Ollama server's non-streaming generate endpoint.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct GenerateBody<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GenerateReply {
    #[serde(default)]
    response: String,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ModelError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ModelError::Transport)?;
        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }

    fn generate_url(&self) -> String {
        format!("{}/api/generate", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl ModelClient for OllamaClient {
    async fn generate_sql(&self, request: &GenerationRequest) -> Result<String, ModelError> {
        let body = GenerateBody {
            model: &request.model,
            prompt: build_prompt(request),
            stream: false,
            options: GenerateOptions { temperature: 0.0 },
        };

        let response = self
            .http
            .post(self.generate_url())
            .json(&body)
            .send()
            .await
            .map_err(ModelError::Transport)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ModelError::Status {
                status: status.as_u16(),
                body: text.chars().take(ERROR_BODY_PREVIEW_CHARS).collect(),
            });
        }

        let reply: GenerateReply = response.json().await.map_err(ModelError::Decode)?;
        debug!(model = %request.model, chars = reply.response.len(), "model reply received");
        Ok(reply.response)
    }
}

pub fn build_prompt(request: &GenerationRequest) -> String {
    format!(
        "You write SQL for the {dialect} dialect.\n\
         Answer the question with exactly one read-only SELECT statement that uses only \
         the tables and columns listed in the schema.\n\
         Rules:\n\
         - List columns explicitly; never use SELECT *.\n\
         - End the statement with LIMIT n where n is at most {limit}.\n\
         - Place every JOIN before the WHERE clause.\n\
         - Wrap the statement in <SQL></SQL> tags and write nothing else.\n\
         \n\
         Schema:\n\
         {schema}\n\
         \n\
         Question: {question}\n",
        dialect = request.dialect,
        limit = request.limit_max,
        schema = request.schema_text,
        question = request.question,
    )
}
