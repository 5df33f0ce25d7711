//! Retry orchestrator: the generate -> verify -> (accept | revise) state machine.
//!
//! Each topic-batch runs as its own state machine over shared, read-only
//! services. A paper runs many topic-batches concurrently; outcomes are
//! written into slots indexed by submission position, so the output order
//! never depends on which topic finished first.

use std::fmt;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::PipelineSettings;
use crate::context::ContextAssembler;
use crate::domain::{PipelineResult, TopicSpec};
use crate::errors::{GenerationError, PipelineError};
use crate::generator::{Generator, PromptMode, RevisionFeedback};
use crate::verifier::Verifier;

/// Attempts per topic-batch, the initial one included.
pub const MAX_ATTEMPTS: u32 = 2;
pub const EXHAUSTED_WARNING: &str = "maximum revision attempts reached";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
  Generating,
  Verifying,
  Accepted,
  Revising,
  Exhausted,
}

/// What happened in one generation attempt. Only kept for the run's logs.
#[derive(Debug)]
pub struct GenerationAttempt {
  pub attempt_index: u32,
  pub mode: &'static str,
  /// Number of questions decoded, or why the attempt produced none.
  pub outcome: Result<usize, GenerationError>,
}

impl fmt::Display for GenerationAttempt {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.outcome {
      Ok(n) => write!(f, "#{} {}: {} questions", self.attempt_index, self.mode, n),
      Err(e) => write!(f, "#{} {}: {}", self.attempt_index, self.mode, e),
    }
  }
}

/// Per-run bookkeeping for one topic-batch.
struct Run<'a> {
  topic: &'a TopicSpec,
  state: PipelineState,
  attempts: Vec<GenerationAttempt>,
}

impl<'a> Run<'a> {
  fn new(topic: &'a TopicSpec) -> Self {
    Self { topic, state: PipelineState::Generating, attempts: Vec::with_capacity(MAX_ATTEMPTS as usize) }
  }

  fn enter(&mut self, next: PipelineState) {
    debug!(target: "pipeline", topic = %self.topic.label(), from = ?self.state, to = ?next, "State transition");
    self.state = next;
  }

  fn record(&mut self, attempt_index: u32, mode: &PromptMode, outcome: Result<usize, GenerationError>) {
    self.attempts.push(GenerationAttempt { attempt_index, mode: mode.name(), outcome });
  }
}

impl Drop for Run<'_> {
  fn drop(&mut self) {
    let attempts = self.attempts.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ");
    debug!(target: "pipeline", topic = %self.topic.label(), state = ?self.state, %attempts, "Topic run finished");
  }
}

/// Outcome for one submitted topic, in submission order.
#[derive(Debug)]
pub struct TopicOutcome {
  pub topic: TopicSpec,
  pub result: Result<PipelineResult, PipelineError>,
}

pub struct Orchestrator {
  context: ContextAssembler,
  generator: Generator,
  verifier: Verifier,
  settings: PipelineSettings,
}

impl Orchestrator {
  pub fn new(context: ContextAssembler, generator: Generator, verifier: Verifier, settings: PipelineSettings) -> Self {
    Self { context, generator, verifier, settings }
  }

  /// Run one topic-batch to a terminal state, or stop early on cancellation.
  #[instrument(level = "info", skip(self, topic, cancel), fields(topic = %topic.label(), n = topic.num_questions))]
  pub async fn run_topic(&self, topic: &TopicSpec, cancel: &CancellationToken) -> Result<PipelineResult, PipelineError> {
    tokio::select! {
      biased;
      _ = cancel.cancelled() => {
        warn!(target: "pipeline", "Topic cancelled");
        Err(PipelineError::Cancelled)
      }
      result = self.drive(topic) => result,
    }
  }

  async fn drive(&self, topic: &TopicSpec) -> Result<PipelineResult, PipelineError> {
    let mut run = Run::new(topic);
    let context = self.context.build(topic).await;
    let mut mode = PromptMode::Initial;
    let mut attempt: u32 = 1;

    loop {
      let set = match self.generator.generate(topic, &context, &mode).await {
        Ok(set) => {
          run.record(attempt, &mode, Ok(set.len()));
          set
        }
        Err(err) => {
          warn!(target: "pipeline", attempt, error = %err, "Generation attempt failed");
          run.record(attempt, &mode, Err(err.clone()));
          if attempt >= MAX_ATTEMPTS {
            run.enter(PipelineState::Exhausted);
            return Err(PipelineError::Exhausted { attempts: attempt, last: err });
          }
          if matches!(err, GenerationError::Upstream(_)) {
            tokio::time::sleep(self.backoff(attempt)).await;
          }
          mode = PromptMode::Revision(RevisionFeedback::from_generation_failure(&err));
          run.enter(PipelineState::Revising);
          attempt += 1;
          run.enter(PipelineState::Generating);
          continue;
        }
      };

      run.enter(PipelineState::Verifying);
      let verification = self.verifier.verify(&set, topic, &context).await;

      if verification.is_accepted() {
        run.enter(PipelineState::Accepted);
        info!(target: "pipeline", attempt, confidence = verification.confidence_score, source = ?verification.source, "Question set accepted");
        return Ok(PipelineResult { question_set: set, verification, attempts_used: attempt, warning: None });
      }

      if attempt >= MAX_ATTEMPTS {
        run.enter(PipelineState::Exhausted);
        warn!(target: "pipeline", attempt, confidence = verification.confidence_score, "Maximum revision attempts reached; returning last set");
        return Ok(PipelineResult {
          question_set: set,
          verification,
          attempts_used: attempt,
          warning: Some(EXHAUSTED_WARNING.to_string()),
        });
      }

      info!(target: "pipeline", attempt, issues = verification.issues.len(), "Question set rejected; revising");
      mode = PromptMode::Revision(RevisionFeedback::from_verification(&verification, self.settings.improvement_threshold));
      run.enter(PipelineState::Revising);
      attempt += 1;
      run.enter(PipelineState::Generating);
    }
  }

  /// Exponential backoff with up to 50% jitter.
  fn backoff(&self, attempt: u32) -> Duration {
    let base = self.settings.retry_backoff().saturating_mul(1 << (attempt - 1).min(6));
    let jitter_ms = base.as_millis() as u64 / 2;
    if jitter_ms == 0 {
      return base;
    }
    base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
  }

  /// Run every topic concurrently (bounded) and return outcomes in submission order.
  #[instrument(level = "info", skip(self, topics, cancel), fields(topics = topics.len()))]
  pub async fn run_paper(&self, topics: Vec<TopicSpec>, cancel: &CancellationToken) -> Vec<TopicOutcome> {
    let mut slots: Vec<Option<Result<PipelineResult, PipelineError>>> = (0..topics.len()).map(|_| None).collect();

    {
      let topics = &topics;
      let mut running = stream::iter(0..topics.len())
        .map(|idx| async move { (idx, self.run_topic(&topics[idx], cancel).await) })
        .buffer_unordered(self.settings.max_concurrent_topics);

      while let Some((idx, result)) = running.next().await {
        debug!(target: "pipeline", slot = idx, ok = result.is_ok(), "Topic finished");
        slots[idx] = Some(result);
      }
    }

    topics
      .into_iter()
      .zip(slots)
      .map(|(topic, result)| TopicOutcome { topic, result: result.unwrap_or(Err(PipelineError::Cancelled)) })
      .collect()
  }

  /// `run_paper` under the configured paper deadline; late topics report `Cancelled`.
  pub async fn run_paper_with_timeout(&self, topics: Vec<TopicSpec>, parent: &CancellationToken) -> Vec<TopicOutcome> {
    let cancel = parent.child_token();
    let deadline = self.settings.paper_timeout();
    let watchdog = {
      let cancel = cancel.clone();
      tokio::spawn(async move {
        tokio::select! {
          _ = cancel.cancelled() => {}
          _ = tokio::time::sleep(deadline) => {
            warn!(target: "pipeline", ?deadline, "Paper deadline reached; cancelling remaining topics");
            cancel.cancel();
          }
        }
      })
    };

    let outcomes = self.run_paper(topics, &cancel).await;
    watchdog.abort();
    outcomes
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;

  use crate::config::Prompts;
  use crate::domain::VerdictSource;
  use crate::errors::{SchemaValidationError, SchemaViolation, UpstreamError};
  use crate::model::TextModel;
  use crate::test_utils::doubles::{FnModel, ScriptedModel};
  use crate::test_utils::fixtures;

  fn test_settings() -> PipelineSettings {
    PipelineSettings { retry_backoff_ms: 0, ..PipelineSettings::default() }
  }

  fn orchestrator_with(gen_model: Arc<dyn TextModel>, ver_model: Arc<dyn TextModel>, settings: PipelineSettings) -> Orchestrator {
    Orchestrator::new(
      ContextAssembler::new(None, &settings),
      Generator::new(gen_model, Prompts::default(), settings.clone()),
      Verifier::new(ver_model, Prompts::default(), settings.clone()),
      settings,
    )
  }

  fn orchestrator(gen_model: Arc<dyn TextModel>, ver_model: Arc<dyn TextModel>) -> Orchestrator {
    orchestrator_with(gen_model, ver_model, test_settings())
  }

  /// Answers every generation prompt with as many valid questions as it asks for.
  fn echo_generator(prefix: &'static str) -> FnModel {
    FnModel::new(move |p| {
      (Duration::ZERO, Ok(fixtures::questions_json(prefix, fixtures::requested_count(&p.user))))
    })
  }

  fn constant_verifier(verdict: &'static str, score: u8) -> FnModel {
    FnModel::new(move |_| (Duration::ZERO, Ok(fixtures::verdict_json(verdict, score))))
  }

  #[tokio::test]
  async fn accepted_on_first_attempt() {
    let gen_model = Arc::new(ScriptedModel::ok(vec![fixtures::questions_json("Q", 3)]));
    let ver_model = Arc::new(ScriptedModel::ok(vec![fixtures::verdict_json("ACCEPTED", 90)]));
    let orch = orchestrator(gen_model.clone(), ver_model.clone());

    let result = orch.run_topic(&fixtures::topic("Algebra", 3), &CancellationToken::new()).await.unwrap();

    assert_eq!(result.attempts_used, 1);
    assert_eq!(result.warning, None);
    assert_eq!(result.question_set.len(), 3);
    assert_eq!(result.verification.source, VerdictSource::Verifier);
    assert_eq!(gen_model.calls(), 1);
    assert_eq!(ver_model.calls(), 1);
  }

  #[tokio::test]
  async fn always_rejected_returns_last_set_with_warning() {
    let gen_model = Arc::new(ScriptedModel::ok(vec![
      fixtures::questions_json("first", 2),
      fixtures::questions_json("second", 2),
    ]));
    let ver_model = Arc::new(constant_verifier("REJECTED", 40));
    let orch = orchestrator(gen_model.clone(), ver_model.clone());

    let result = orch.run_topic(&fixtures::topic("Geometry", 2), &CancellationToken::new()).await.unwrap();

    assert_eq!(gen_model.calls(), 2);
    assert_eq!(ver_model.calls(), 2);
    assert_eq!(result.attempts_used, 2);
    assert_eq!(result.warning.as_deref(), Some(EXHAUSTED_WARNING));
    assert_eq!(result.question_set.questions[0].question_text, "second question 0");
    assert!(!result.verification.is_accepted());

    let prompts = gen_model.prompts();
    assert!(!prompts[0].user.contains("Original Issues"));
    assert!(prompts[1].user.contains("Original Issues"));
    assert!(prompts[1].user.contains("- Too easy"));
    assert!(prompts[1].user.contains("- Improve overall question quality and clarity"));
  }

  #[tokio::test]
  async fn schema_failure_consumes_an_attempt_without_verification() {
    let gen_model = Arc::new(ScriptedModel::ok(vec![
      "Here are your questions!".into(),
      fixtures::questions_json("Q", 1),
    ]));
    let ver_model = Arc::new(constant_verifier("ACCEPTED", 85));
    let orch = orchestrator(gen_model.clone(), ver_model.clone());

    let result = orch.run_topic(&fixtures::topic("Cells", 1), &CancellationToken::new()).await.unwrap();

    assert_eq!(result.attempts_used, 2);
    assert_eq!(result.warning, None);
    assert_eq!(ver_model.calls(), 1);
    assert!(gen_model.prompts()[1].user.contains("Previous output was not valid JSON or missing required fields."));
  }

  #[tokio::test]
  async fn upstream_failure_then_success() {
    let gen_model = Arc::new(ScriptedModel::new(vec![
      Err(UpstreamError::RateLimited("slow down".into())),
      Ok(fixtures::questions_json("Q", 2)),
    ]));
    let ver_model = Arc::new(constant_verifier("ACCEPTED", 85));
    let orch = orchestrator(gen_model.clone(), ver_model);

    let result = orch.run_topic(&fixtures::topic("Cells", 2), &CancellationToken::new()).await.unwrap();
    assert_eq!(result.attempts_used, 2);
    assert_eq!(result.question_set.len(), 2);
  }

  #[tokio::test]
  async fn failing_every_attempt_exhausts_the_topic() {
    let gen_model = Arc::new(ScriptedModel::ok(vec!["nope".into(), "still nope".into()]));
    let ver_model = Arc::new(constant_verifier("ACCEPTED", 85));
    let orch = orchestrator(gen_model.clone(), ver_model.clone());

    let err = orch.run_topic(&fixtures::topic("Cells", 1), &CancellationToken::new()).await.unwrap_err();

    assert_eq!(
      err,
      PipelineError::Exhausted {
        attempts: 2,
        last: GenerationError::Schema(SchemaValidationError::batch(0, SchemaViolation::MissingQuestions)),
      }
    );
    assert_eq!(gen_model.calls(), 2);
    assert_eq!(ver_model.calls(), 0);
  }

  #[tokio::test]
  async fn upstream_failure_on_final_attempt_is_terminal() {
    let gen_model = Arc::new(ScriptedModel::new(vec![
      Err(UpstreamError::RateLimited("slow down".into())),
      Err(UpstreamError::Http { status: 503, message: "overloaded".into() }),
    ]));
    let ver_model = Arc::new(constant_verifier("ACCEPTED", 85));
    let orch = orchestrator(gen_model.clone(), ver_model.clone());

    let err = orch.run_topic(&fixtures::topic("Cells", 1), &CancellationToken::new()).await.unwrap_err();

    assert_eq!(
      err,
      PipelineError::Exhausted {
        attempts: 2,
        last: GenerationError::Upstream(UpstreamError::Http { status: 503, message: "overloaded".into() }),
      }
    );
    assert_eq!(gen_model.calls(), 2);
    assert_eq!(ver_model.calls(), 0);
  }

  #[tokio::test]
  async fn schema_failure_retries_without_backoff() {
    let settings = PipelineSettings { retry_backoff_ms: 10_000, ..PipelineSettings::default() };
    let gen_model = Arc::new(ScriptedModel::ok(vec!["no json".into(), fixtures::questions_json("Q", 1)]));
    let orch = orchestrator_with(gen_model.clone(), Arc::new(constant_verifier("ACCEPTED", 85)), settings);

    let started = std::time::Instant::now();
    let result = orch.run_topic(&fixtures::topic("Cells", 1), &CancellationToken::new()).await.unwrap();

    assert_eq!(result.attempts_used, 2);
    assert!(started.elapsed() < Duration::from_secs(5));
  }

  #[test]
  fn attempt_summary_names_outcome() {
    let ok = GenerationAttempt { attempt_index: 1, mode: "initial", outcome: Ok(5) };
    assert_eq!(ok.to_string(), "#1 initial: 5 questions");
    let failed = GenerationAttempt {
      attempt_index: 2,
      mode: "revision",
      outcome: Err(UpstreamError::EmptyResponse.into()),
    };
    assert_eq!(failed.to_string(), "#2 revision: model returned no content");
  }

  #[tokio::test]
  async fn cancellation_aborts_in_flight_calls() {
    let gen_model = Arc::new(FnModel::new(|_| (Duration::from_secs(30), Ok(fixtures::questions_json("Q", 1)))));
    let ver_model = Arc::new(constant_verifier("ACCEPTED", 85));
    let orch = orchestrator(gen_model, ver_model.clone());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(20)).await;
      trigger.cancel();
    });

    let started = std::time::Instant::now();
    let err = orch.run_topic(&fixtures::topic("Cells", 1), &cancel).await.unwrap_err();
    assert_eq!(err, PipelineError::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(ver_model.calls(), 0);
  }

  #[tokio::test]
  async fn chunked_topic_returns_exactly_n_questions() {
    let gen_model = Arc::new(echo_generator("Q"));
    let orch = orchestrator(gen_model.clone(), Arc::new(constant_verifier("ACCEPTED", 90)));

    let result = orch.run_topic(&fixtures::topic("Algebra", 12), &CancellationToken::new()).await.unwrap();

    assert_eq!(gen_model.calls(), 3);
    assert_eq!(result.question_set.len(), 12);
    assert!(result.question_set.questions.iter().all(|q| q.options.len() == 4 && q.options.contains(&q.answer)));
  }

  #[tokio::test]
  async fn paper_outcomes_follow_submission_order() {
    // Algebra is slow, so Geometry finishes first
    let gen_model = Arc::new(FnModel::new(|p| {
      let n = fixtures::requested_count(&p.user);
      if p.user.contains("Topic: Algebra") {
        (Duration::from_millis(80), Ok(fixtures::questions_json("alg", n)))
      } else {
        (Duration::ZERO, Ok(fixtures::questions_json("geo", n)))
      }
    }));
    let orch = orchestrator(gen_model, Arc::new(constant_verifier("ACCEPTED", 90)));

    let topics = vec![fixtures::topic("Algebra", 3), fixtures::topic("Geometry", 2)];
    let outcomes = orch.run_paper(topics, &CancellationToken::new()).await;

    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0].topic.section_name, "Algebra");
    let algebra = outcomes[0].result.as_ref().unwrap();
    assert_eq!(algebra.question_set.topic, "Algebra");
    assert_eq!(algebra.question_set.len(), 3);
    assert!(algebra.question_set.questions.iter().all(|q| q.question_text.starts_with("alg")));

    assert_eq!(outcomes[1].topic.section_name, "Geometry");
    let geometry = outcomes[1].result.as_ref().unwrap();
    assert_eq!(geometry.question_set.len(), 2);
    assert!(geometry.question_set.questions.iter().all(|q| q.question_text.starts_with("geo")));
  }

  #[tokio::test]
  async fn failed_topic_does_not_discard_siblings() {
    let gen_model = Arc::new(FnModel::new(|p| {
      if p.user.contains("Topic: Broken") {
        (Duration::ZERO, Ok("not json".to_string()))
      } else {
        (Duration::ZERO, Ok(fixtures::questions_json("ok", fixtures::requested_count(&p.user))))
      }
    }));
    let orch = orchestrator(gen_model, Arc::new(constant_verifier("ACCEPTED", 90)));

    let topics = vec![fixtures::topic("Broken", 1), fixtures::topic("Fine", 2)];
    let outcomes = orch.run_paper(topics, &CancellationToken::new()).await;

    assert!(matches!(outcomes[0].result, Err(PipelineError::Exhausted { attempts: 2, .. })));
    assert_eq!(outcomes[1].result.as_ref().unwrap().question_set.len(), 2);
  }

  #[tokio::test]
  async fn cancelled_paper_reports_every_topic_cancelled() {
    let orch = orchestrator(Arc::new(echo_generator("Q")), Arc::new(constant_verifier("ACCEPTED", 90)));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcomes = orch.run_paper(vec![fixtures::topic("A", 1), fixtures::topic("B", 1)], &cancel).await;
    assert!(outcomes.iter().all(|o| o.result == Err(PipelineError::Cancelled)));
  }

  #[tokio::test]
  async fn paper_deadline_cancels_slow_topics() {
    let settings = PipelineSettings { paper_timeout_secs: 1, ..test_settings() };
    let gen_model = Arc::new(FnModel::new(|p| {
      let n = fixtures::requested_count(&p.user);
      let delay = if p.user.contains("Topic: Slow") { Duration::from_secs(30) } else { Duration::ZERO };
      (delay, Ok(fixtures::questions_json("Q", n)))
    }));
    let orch = orchestrator_with(gen_model, Arc::new(constant_verifier("ACCEPTED", 90)), settings);

    let topics = vec![fixtures::topic("Fast", 1), fixtures::topic("Slow", 1)];
    let outcomes = orch.run_paper_with_timeout(topics, &CancellationToken::new()).await;

    assert!(outcomes[0].result.is_ok());
    assert_eq!(outcomes[1].result, Err(PipelineError::Cancelled));
  }

  #[test]
  fn backoff_grows_with_attempts() {
    let settings = PipelineSettings { retry_backoff_ms: 100, ..PipelineSettings::default() };
    let orch = orchestrator_with(
      Arc::new(ScriptedModel::ok(vec![])),
      Arc::new(ScriptedModel::ok(vec![])),
      settings,
    );
    let first = orch.backoff(1);
    assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(150));
    let second = orch.backoff(2);
    assert!(second >= Duration::from_millis(200) && second <= Duration::from_millis(300));
    assert_eq!(orchestrator(Arc::new(ScriptedModel::ok(vec![])), Arc::new(ScriptedModel::ok(vec![]))).backoff(1), Duration::ZERO);
  }
}
