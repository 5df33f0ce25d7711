//! Generation client: prompt rendering, chunked generation calls, and schema validation.
//!
//! A topic asking for N questions is split into chunks of `chunk_size`; each
//! chunk is one model call. At most `max_concurrent_chunks` calls run at
//! once, and results are concatenated in chunk order so the set always reads
//! in request order.

use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use serde_json::{json, Map, Value};
use tracing::{debug, info, instrument, warn};

use crate::config::{PipelineSettings, Prompts};
use crate::decode::decode;
use crate::domain::{Question, QuestionSet, TopicSpec, VerificationResult};
use crate::errors::{GenerationError, SchemaValidationError, SchemaViolation};
use crate::model::{complete_with_timeout, Prompt, TextModel};
use crate::util::{bullet_list, fill_template, trunc_for_log};

const REQUIRED_FIELDS: [&str; 4] = ["question", "options", "answer", "explanation"];
const OPTION_COUNT: usize = 4;

/// Quality feedback folded into a revision prompt.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RevisionFeedback {
  pub issues: Vec<String>,
  pub suggestions: Vec<String>,
  /// One directive per quality category that scored below threshold.
  pub improvements: Vec<String>,
}

impl RevisionFeedback {
  pub fn from_verification(v: &VerificationResult, threshold: u8) -> Self {
    Self {
      issues: v.issues.clone(),
      suggestions: v.suggestions.clone(),
      improvements: v
        .category_scores
        .below(threshold)
        .into_iter()
        .map(|c| c.directive().to_string())
        .collect(),
    }
  }

  /// Feedback after an attempt that produced no usable question set.
  pub fn from_generation_failure(err: &GenerationError) -> Self {
    let issues = match err {
      GenerationError::Schema(e) => vec![
        "Previous output was not valid JSON or missing required fields.".to_string(),
        format!("Validation error: {e}"),
      ],
      GenerationError::Upstream(e) => vec![format!("Previous attempt failed: {e}")],
    };
    Self {
      issues,
      suggestions: vec!["Ensure output strictly follows the JSON schema.".into()],
      improvements: vec!["Return only JSON with the required fields.".into()],
    }
  }
}

/// Which prompt template a generation call uses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PromptMode {
  Initial,
  Revision(RevisionFeedback),
}

impl PromptMode {
  pub fn name(&self) -> &'static str {
    match self {
      PromptMode::Initial => "initial",
      PromptMode::Revision(_) => "revision",
    }
  }
}

/// Split `total` into batches of at most `size`: (12, 5) -> [5, 5, 2].
pub fn chunk_plan(total: usize, size: usize) -> Vec<usize> {
  let size = size.max(1);
  let mut left = total;
  let mut plan = Vec::new();
  while left > 0 {
    let n = left.min(size);
    plan.push(n);
    left -= n;
  }
  plan
}

pub struct Generator {
  model: Arc<dyn TextModel>,
  prompts: Prompts,
  settings: PipelineSettings,
}

impl Generator {
  pub fn new(model: Arc<dyn TextModel>, prompts: Prompts, settings: PipelineSettings) -> Self {
    Self { model, prompts, settings }
  }

  /// Render the prompt for one chunk of `topic`.
  pub fn render(&self, topic: &TopicSpec, context: &str, mode: &PromptMode) -> Prompt {
    let mut vars = topic.prompt_vars();
    let template = match mode {
      PromptMode::Initial => &self.prompts.generation_user_template,
      PromptMode::Revision(fb) => {
        vars.push(("quality_issues", bullet_list(&fb.issues, "No specific issues identified")));
        vars.push(("improvement_suggestions", bullet_list(&fb.suggestions, "No specific suggestions provided")));
        vars.push(("specific_improvements", bullet_list(&fb.improvements, "No specific improvements required")));
        &self.prompts.revision_user_template
      }
    };
    // context last, so passages that happen to contain `{...}` are not re-expanded
    vars.push(("context", context.to_string()));

    let pairs: Vec<(&str, &str)> = vars.iter().map(|(k, v)| (*k, v.as_str())).collect();
    Prompt::new(
      self.prompts.generation_system.clone(),
      fill_template(template, &pairs),
      self.settings.generation_temperature,
    )
  }

  /// Generate exactly `topic.num_questions` validated questions.
  #[instrument(level = "info", skip(self, topic, context, mode), fields(topic = %topic.label(), n = topic.num_questions, mode = mode.name()))]
  pub async fn generate(
    &self,
    topic: &TopicSpec,
    context: &str,
    mode: &PromptMode,
  ) -> Result<QuestionSet, GenerationError> {
    let plan = chunk_plan(topic.num_questions, self.settings.chunk_size);
    debug!(target: "pipeline", chunks = ?plan, "Generation chunk plan");

    let size = self.settings.chunk_size.max(1);
    let calls: Vec<_> = plan
      .into_iter()
      .enumerate()
      .map(|(idx, n)| self.generate_chunk(idx, idx * size, topic.with_num_questions(n), context, mode))
      .collect();
    let chunks: Vec<Vec<Question>> = stream::iter(calls)
      .buffered(self.settings.max_concurrent_chunks.max(1))
      .try_collect()
      .await?;

    let questions: Vec<Question> = chunks.into_iter().flatten().collect();
    info!(target: "pipeline", questions = questions.len(), "Generated question set");
    Ok(QuestionSet::new(topic.label(), questions))
  }

  async fn generate_chunk(
    &self,
    idx: usize,
    offset: usize,
    chunk_topic: TopicSpec,
    context: &str,
    mode: &PromptMode,
  ) -> Result<Vec<Question>, GenerationError> {
    let prompt = self.render(&chunk_topic, context, mode);
    let raw = complete_with_timeout(self.model.as_ref(), &prompt, self.settings.generation_timeout()).await?;
    debug!(target: "pipeline", chunk = idx, model = self.model.model_name(), raw = %trunc_for_log(&raw, 300), "Generation chunk response");

    let value = decode(&raw, json!({}));
    Ok(validate_chunk(&value, idx, offset, chunk_topic.num_questions)?)
  }
}

/// Check one decoded chunk against the question schema and return exactly `expected` questions.
/// `offset` is the topic-level index of the chunk's first question.
pub fn validate_chunk(value: &Value, chunk: usize, offset: usize, expected: usize) -> Result<Vec<Question>, SchemaValidationError> {
  let obj = value
    .as_object()
    .ok_or_else(|| SchemaValidationError::batch(chunk, SchemaViolation::NotAnObject))?;
  let items = obj
    .get("questions")
    .ok_or_else(|| SchemaValidationError::batch(chunk, SchemaViolation::MissingQuestions))?
    .as_array()
    .ok_or_else(|| SchemaValidationError::batch(chunk, SchemaViolation::QuestionsNotList))?;

  let mut questions = items
    .iter()
    .enumerate()
    .map(|(i, item)| validate_question(item).map_err(|v| SchemaValidationError::question(chunk, offset, i, v)))
    .collect::<Result<Vec<_>, _>>()?;

  if questions.len() < expected {
    return Err(SchemaValidationError::batch(
      chunk,
      SchemaViolation::TooFewQuestions { expected, got: questions.len() },
    ));
  }
  if questions.len() > expected {
    warn!(target: "pipeline", chunk, expected, got = questions.len(), "Dropping extra generated questions");
    questions.truncate(expected);
  }
  Ok(questions)
}

fn validate_question(item: &Value) -> Result<Question, SchemaViolation> {
  let obj = item.as_object().ok_or(SchemaViolation::QuestionNotObject)?;

  let missing: Vec<&'static str> = REQUIRED_FIELDS.into_iter().filter(|f| !obj.contains_key(*f)).collect();
  if !missing.is_empty() {
    return Err(SchemaViolation::MissingFields(missing));
  }

  let question_text = text_field(obj, "question")?;
  let explanation = text_field(obj, "explanation")?;
  let answer = text_field(obj, "answer")?;

  let options = obj["options"]
    .as_array()
    .and_then(|opts| {
      opts
        .iter()
        .map(|o| o.as_str().map(|s| s.trim().to_string()))
        .collect::<Option<Vec<_>>>()
    })
    .ok_or_else(|| SchemaViolation::InvalidField { field: "options", reason: "must be a list of strings".into() })?;
  if options.len() != OPTION_COUNT {
    return Err(SchemaViolation::OptionCount(options.len()));
  }
  if !options.iter().any(|o| *o == answer) {
    return Err(SchemaViolation::AnswerNotInOptions);
  }

  Ok(Question { question_text, options, answer, explanation })
}

fn text_field(obj: &Map<String, Value>, field: &'static str) -> Result<String, SchemaViolation> {
  match obj.get(field).and_then(Value::as_str).map(str::trim) {
    Some(s) if !s.is_empty() => Ok(s.to_string()),
    _ => Err(SchemaViolation::InvalidField { field, reason: "must be a non-empty string".into() }),
  }
}
