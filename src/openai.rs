//! Minimal OpenAI / Azure OpenAI chat client for our use-cases.
//!
//! We only call chat.completions and request a JSON object; decoding and
//! schema checks happen downstream because models do not always comply.
//! Calls are instrumented and log model names, latencies, and usage (not contents).
//!
//! NOTE: We never log the API key.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::errors::UpstreamError;
use crate::model::{Prompt, TextModel};
use crate::util::trunc_for_log;

const DEFAULT_MODEL: &str = "gpt-4.1";
const DEFAULT_AZURE_API_VERSION: &str = "2024-02-15-preview";
const HTTP_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Provider {
  OpenAi,
  /// Azure routes by deployment name and authenticates with an `api-key` header.
  Azure { api_version: String },
}

#[derive(Clone)]
pub struct OpenAI {
  pub client: reqwest::Client,
  api_key: String,
  pub base_url: String,
  pub provider: Provider,
  pub generation_model: String,
  pub verification_model: String,
}

impl OpenAI {
  /// Construct the client from Azure variables if present, else from
  /// OPENAI_API_KEY; returns None when neither is configured.
  pub fn from_env() -> Option<Self> {
    let env = |k: &str| std::env::var(k).ok().filter(|v| !v.trim().is_empty());

    let (api_key, base_url, provider, generation_model, verification_model) =
      if let (Some(key), Some(endpoint)) = (env("AZURE_OPENAI_API_KEY"), env("AZURE_OPENAI_ENDPOINT")) {
        let deployment = env("AZURE_OPENAI_CHAT_DEPLOYMENT").unwrap_or_else(|| DEFAULT_MODEL.into());
        let api_version = env("AZURE_OPENAI_API_VERSION").unwrap_or_else(|| DEFAULT_AZURE_API_VERSION.into());
        let verifier = env("AZURE_OPENAI_VERIFICATION_DEPLOYMENT").unwrap_or_else(|| deployment.clone());
        (key, endpoint, Provider::Azure { api_version }, deployment, verifier)
      } else {
        let key = env("OPENAI_API_KEY")?;
        let base_url = env("OPENAI_BASE_URL").unwrap_or_else(|| "https://api.openai.com/v1".into());
        let generation = env("OPENAI_GENERATION_MODEL").unwrap_or_else(|| DEFAULT_MODEL.into());
        let verification = env("OPENAI_VERIFICATION_MODEL").unwrap_or_else(|| generation.clone());
        (key, base_url, Provider::OpenAi, generation, verification)
      };

    let client = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build().ok()?;

    Some(Self {
      client,
      api_key,
      base_url: base_url.trim_end_matches('/').to_string(),
      provider,
      generation_model,
      verification_model,
    })
  }

  pub fn generation(&self) -> ChatModel {
    ChatModel { api: self.clone(), model: self.generation_model.clone() }
  }

  pub fn verification(&self) -> ChatModel {
    ChatModel { api: self.clone(), model: self.verification_model.clone() }
  }

  fn endpoint(&self, model: &str) -> String {
    match &self.provider {
      Provider::OpenAi => format!("{}/chat/completions", self.base_url),
      Provider::Azure { api_version } => format!(
        "{}/openai/deployments/{}/chat/completions?api-version={}",
        self.base_url, model, api_version
      ),
    }
  }

  /// JSON-object chat completion returning the raw message text.
  #[instrument(level = "info", skip(self, system, user), fields(model = %model))]
  async fn chat_json_text(
    &self,
    model: &str,
    system: &str,
    user: &str,
    temperature: f32,
  ) -> Result<String, UpstreamError> {
    let req = ChatCompletionRequest {
      model: model.to_string(),
      messages: vec![
        ChatMessageReq { role: "system".into(), content: system.into() },
        ChatMessageReq { role: "user".into(), content: user.into() },
      ],
      temperature,
      response_format: Some(ResponseFormat { r#type: "json_object".into() }),
      max_tokens: None,
    };

    let builder = self.client.post(self.endpoint(model))
      .header(USER_AGENT, "mcq-backend/0.1")
      .header(CONTENT_TYPE, "application/json");
    let builder = match self.provider {
      Provider::OpenAi => builder.header(AUTHORIZATION, format!("Bearer {}", self.api_key)),
      Provider::Azure { .. } => builder.header("api-key", &self.api_key),
    };

    let start = Instant::now();
    let res = builder.json(&req).send().await.map_err(transport_error)?;

    if !res.status().is_success() {
      let status = res.status();
      let body = res.text().await.unwrap_or_default();
      let msg = extract_openai_error(&body).unwrap_or(body);
      return Err(classify_status(status, msg));
    }

    let body: ChatCompletionResponse = res.json().await.map_err(transport_error)?;
    if let Some(usage) = &body.usage {
      info!(prompt_tokens = ?usage.prompt_tokens, completion_tokens = ?usage.completion_tokens, total_tokens = ?usage.total_tokens, elapsed = ?start.elapsed(), "OpenAI usage");
    }
    let text = body.choices.into_iter().next()
      .and_then(|c| c.message.content)
      .unwrap_or_default();

    if text.trim().is_empty() {
      return Err(UpstreamError::EmptyResponse);
    }
    debug!(response = %trunc_for_log(&text, 500), "Raw model output");
    Ok(text)
  }
}

/// One model behind the shared client.
#[derive(Clone)]
pub struct ChatModel {
  api: OpenAI,
  model: String,
}

#[async_trait]
impl TextModel for ChatModel {
  async fn complete(&self, prompt: &Prompt) -> Result<String, UpstreamError> {
    self.api.chat_json_text(&self.model, &prompt.system, &prompt.user, prompt.temperature).await
  }

  fn model_name(&self) -> &str {
    &self.model
  }
}

fn transport_error(e: reqwest::Error) -> UpstreamError {
  if e.is_timeout() {
    UpstreamError::Timeout(HTTP_TIMEOUT)
  } else {
    UpstreamError::Transport(e.to_string())
  }
}

fn classify_status(status: StatusCode, message: String) -> UpstreamError {
  if status == StatusCode::TOO_MANY_REQUESTS {
    UpstreamError::RateLimited(message)
  } else {
    UpstreamError::Http { status: status.as_u16(), message }
  }
}

// --- Chat DTOs ---

#[derive(Serialize)]
struct ChatCompletionRequest {
  model: String,
  messages: Vec<ChatMessageReq>,
  temperature: f32,
  #[serde(skip_serializing_if = "Option::is_none")]
  response_format: Option<ResponseFormat>,
  #[serde(skip_serializing_if = "Option::is_none")]
  max_tokens: Option<u32>,
}
#[derive(Serialize)]
struct ChatMessageReq { role: String, content: String }
#[derive(Serialize)]
struct ResponseFormat { #[serde(rename = "type")] r#type: String }

#[derive(Deserialize)]
struct ChatCompletionResponse {
  choices: Vec<ChatChoice>,
  #[serde(default)] usage: Option<Usage>,
}
#[derive(Deserialize)]
struct ChatChoice { message: ChatMessageResp }
#[derive(Deserialize)]
struct ChatMessageResp { content: Option<String> }
#[derive(Deserialize)]
struct Usage {
  #[serde(default)] prompt_tokens: Option<u32>,
  #[serde(default)] completion_tokens: Option<u32>,
  #[serde(default)] total_tokens: Option<u32>,
}

/// Try to extract a clean error message from OpenAI error body.
fn extract_openai_error(body: &str) -> Option<String> {
  #[derive(Deserialize)]
  struct EWrap { error: EObj }
  #[derive(Deserialize)]
  struct EObj { message: String }
  match serde_json::from_str::<EWrap>(body) {
    Ok(w) => Some(w.error.message),
    Err(_) => None,
  }
}
