//! HTTP endpoint handlers. These are thin wrappers that forward to the pipeline.
//! Each handler is instrumented and logs parameters and basic result info.

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, Json};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::errors::{AppError, AppResult};
use crate::protocol::*;
use crate::state::AppState;

#[instrument(level = "info", skip(state))]
pub async fn http_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
  Json(HealthOut { ok: true, generation: state.orchestrator.is_some(), corpus: state.corpus_ready })
}

#[instrument(level = "info", skip(state, body), fields(topics = body.topics.len()))]
pub async fn http_post_questions(
  State(state): State<Arc<AppState>>,
  Json(body): Json<GeneratePaperIn>,
) -> AppResult<Json<PaperOut>> {
  let (subject, grade, topics) = body.validate(state.max_questions_per_topic)?;
  let orchestrator = state
    .orchestrator
    .as_ref()
    .ok_or_else(|| AppError::Unavailable("no generation model configured".into()))?;

  let paper_id = Uuid::new_v4().to_string();
  info!(target: "mcq_backend", %paper_id, %subject, %grade, topics = topics.len(), "Question paper requested");

  let outcomes = orchestrator.run_paper_with_timeout(topics, &state.shutdown).await;
  let topics: Vec<TopicOut> = outcomes.into_iter().map(TopicOut::from).collect();
  let success = topics.iter().any(TopicOut::succeeded);
  let questions: usize = topics.iter().map(|t| t.questions.len()).sum();
  info!(target: "mcq_backend", %paper_id, success, questions, "Question paper served");

  Ok(Json(PaperOut { success, paper_id, topics }))
}
