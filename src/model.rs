//! The text-generation capability consumed by the generator and the verifier.

use std::time::Duration;

use async_trait::async_trait;

use crate::errors::UpstreamError;

/// A fully rendered request for one model call.
#[derive(Clone, Debug, PartialEq)]
pub struct Prompt {
  pub system: String,
  pub user: String,
  pub temperature: f32,
}

impl Prompt {
  pub fn new(system: impl Into<String>, user: impl Into<String>, temperature: f32) -> Self {
    Self { system: system.into(), user: user.into(), temperature }
  }
}

/// Opaque remote text generator: prompt in, raw text out.
#[async_trait]
pub trait TextModel: Send + Sync {
  async fn complete(&self, prompt: &Prompt) -> Result<String, UpstreamError>;

  /// Name used in logs.
  fn model_name(&self) -> &str;
}

/// Run one model call under a hard deadline.
pub async fn complete_with_timeout(
  model: &dyn TextModel,
  prompt: &Prompt,
  timeout: Duration,
) -> Result<String, UpstreamError> {
  match tokio::time::timeout(timeout, model.complete(prompt)).await {
    Ok(result) => result,
    Err(_) => Err(UpstreamError::Timeout(timeout)),
  }
}
