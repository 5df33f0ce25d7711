//! Error types for the pipeline and the HTTP layer.
//!
//! Pipeline errors are split by policy: schema failures and upstream failures
//! both consume an attempt, but they stay distinct so callers can tell a bad
//! model answer from a bad network.

use std::time::Duration;

use axum::{
  http::StatusCode,
  response::{IntoResponse, Response},
  Json,
};
use serde::Serialize;
use thiserror::Error;

/// Failure talking to a remote text-generation capability.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpstreamError {
  #[error("model call timed out after {0:?}")]
  Timeout(Duration),

  #[error("model rate limited: {0}")]
  RateLimited(String),

  #[error("model HTTP {status}: {message}")]
  Http { status: u16, message: String },

  #[error("model transport error: {0}")]
  Transport(String),

  #[error("model returned no content")]
  EmptyResponse,
}

/// What exactly was wrong with a decoded generation payload.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchemaViolation {
  #[error("response is not a JSON object")]
  NotAnObject,

  #[error("missing 'questions' key")]
  MissingQuestions,

  #[error("'questions' must be a list")]
  QuestionsNotList,

  #[error("question is not an object")]
  QuestionNotObject,

  #[error("missing fields: {}", .0.join(", "))]
  MissingFields(Vec<&'static str>),

  #[error("field '{field}' {reason}")]
  InvalidField { field: &'static str, reason: String },

  #[error("must have exactly 4 options, got {0}")]
  OptionCount(usize),

  #[error("answer must be one of the options")]
  AnswerNotInOptions,

  #[error("expected {expected} questions, got {got}")]
  TooFewQuestions { expected: usize, got: usize },
}

/// Decoded generation output that does not match the question schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaValidationError {
  /// Zero-based chunk index within the topic-batch.
  pub chunk: usize,
  /// Zero-based question index within the chunk, when one question is at fault.
  pub question: Option<usize>,
  /// The same question's zero-based index in the assembled topic set.
  pub position: Option<usize>,
  pub violation: SchemaViolation,
}

impl std::fmt::Display for SchemaValidationError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match (self.question, self.position) {
      (Some(q), Some(p)) => write!(f, "chunk {}, question {} (topic question {}): {}", self.chunk, q, p, self.violation),
      (Some(q), None) => write!(f, "chunk {}, question {}: {}", self.chunk, q, self.violation),
      _ => write!(f, "chunk {}: {}", self.chunk, self.violation),
    }
  }
}

impl std::error::Error for SchemaValidationError {}

impl SchemaValidationError {
  pub fn batch(chunk: usize, violation: SchemaViolation) -> Self {
    Self { chunk, question: None, position: None, violation }
  }

  /// `offset` is the topic-level index of the chunk's first question.
  pub fn question(chunk: usize, offset: usize, question: usize, violation: SchemaViolation) -> Self {
    Self { chunk, question: Some(question), position: Some(offset + question), violation }
  }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GenerationError {
  #[error("schema validation failed: {0}")]
  Schema(#[from] SchemaValidationError),

  #[error(transparent)]
  Upstream(#[from] UpstreamError),
}

/// Terminal outcome of a topic-batch that produced no question set.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
  #[error("generation failed after {attempts} attempts: {last}")]
  Exhausted { attempts: u32, last: GenerationError },

  #[error("generation cancelled")]
  Cancelled,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CorpusError {
  #[error("corpus search timed out after {0:?}")]
  Timeout(Duration),

  #[error("corpus unavailable: {0}")]
  Unavailable(String),
}

#[derive(Debug, Clone, Error)]
pub enum AppError {
  #[error("Validation error: {0}")]
  ValidationError(String),

  #[error("Service unavailable: {0}")]
  Unavailable(String),
}

impl AppError {
  fn error_code(&self) -> &'static str {
    match self {
      AppError::ValidationError(_) => "VALIDATION_ERROR",
      AppError::Unavailable(_) => "UNAVAILABLE",
    }
  }

  pub fn status_code(&self) -> StatusCode {
    match self {
      AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
      AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
  }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
  pub success: bool,
  pub error: String,
  pub code: &'static str,
}

impl IntoResponse for AppError {
  fn into_response(self) -> Response {
    let body = ErrorResponse { success: false, error: self.to_string(), code: self.error_code() };
    (self.status_code(), Json(body)).into_response()
  }
}

pub type AppResult<T> = Result<T, AppError>;
