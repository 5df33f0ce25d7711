//! Loading agent configuration (prompts + pipeline tuning) from TOML.
//!
//! Every key is optional; anything missing keeps the built-in default.
//! See `AgentConfig`, `Prompts` and `PipelineSettings` for the schema.

use std::time::Duration;

use serde::Deserialize;
use tracing::{error, info, warn};

#[derive(Clone, Debug, Deserialize, Default)]
pub struct AgentConfig {
  #[serde(default)]
  pub prompts: Prompts,
  #[serde(default)]
  pub pipeline: PipelineSettings,
}

/// Prompt templates. Placeholders are `{name}`; literal JSON braces are fine.
///
/// Generation variables: subject, class_grade, topic, difficulty, bloom_level,
/// question_type, num_questions, instructions, context. Revision adds
/// quality_issues, improvement_suggestions, specific_improvements.
/// Verification uses the topic variables plus context and questions.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Prompts {
  pub generation_system: String,
  pub generation_user_template: String,
  pub revision_user_template: String,
  pub verification_system: String,
  pub verification_user_template: String,
}

const QUESTION_FORMAT: &str = r#"Output Format (Strict JSON):
{
  "questions": [
    {
      "question": "Your question text here.",
      "options": ["Option A", "Option B", "Option C", "Option D"],
      "answer": "Correct option here",
      "explanation": "Detailed explanation with reasoning."
    }
  ]
}

Rules:
- Each question must have exactly 4 options.
- The answer must match one of the options exactly.
- The explanation must justify why the answer is correct.
- No extra text outside JSON, no markdown fences."#;

impl Default for Prompts {
  fn default() -> Self {
    Self {
      generation_system: "You are a highly skilled educational question generator. Respond ONLY with strict JSON.".into(),
      generation_user_template: format!(
        "Generate exactly {{num_questions}} {{question_type}} questions for:\n\
         Subject: {{subject}}\nGrade: {{class_grade}}\nTopic: {{topic}}\n\
         Difficulty: {{difficulty}}\nBloom's Level: {{bloom_level}}\n\n\
         Context:\n{{context}}\n\nAdditional Instructions:\n{{instructions}}\n\n{QUESTION_FORMAT}"
      ),
      revision_user_template: format!(
        "You previously generated questions that did not meet quality requirements.\n\n\
         Context:\n{{context}}\n\nOriginal Issues:\n{{quality_issues}}\n\n\
         Suggestions:\n{{improvement_suggestions}}\n\nSpecific Improvements:\n{{specific_improvements}}\n\n\
         Generate exactly {{num_questions}} {{question_type}} questions for:\n\
         Subject: {{subject}}\nGrade: {{class_grade}}\nTopic: {{topic}}\n\
         Difficulty: {{difficulty}}\nBloom's Level: {{bloom_level}}\n\n\
         Instructions:\n{{instructions}}\n\n{QUESTION_FORMAT}"
      ),
      verification_system: "You are an expert educational assessment evaluator with deep knowledge of Bloom's taxonomy, difficulty calibration, and subject-specific pedagogy. Reply as compact JSON.".into(),
      verification_user_template: r#"Question Details:
Subject: {subject}
Grade: {class_grade}
Topic: {topic}
Difficulty: {difficulty}
Bloom's Level: {bloom_level}
Question Type: {question_type}

Context:
{context}

Questions to Evaluate:
{questions}

Evaluate the questions for relevance to the context and topic, difficulty alignment,
Bloom's taxonomy alignment, subject and grade appropriateness, and overall quality
(clarity, correctness, completeness). Score each category 0-100, list specific issues
and improvement suggestions, and give an overall verdict.

Return JSON with exactly this schema:
{
  "overall_verdict": "ACCEPTED" | "REJECTED",
  "confidence_score": <integer>,
  "detailed_feedback": {
    "relevance_score": <integer>,
    "difficulty_alignment": <integer>,
    "bloom_taxonomy_alignment": <integer>,
    "subject_grade_alignment": <integer>,
    "overall_quality": <integer>
  },
  "specific_issues": ["..."],
  "improvement_suggestions": ["..."]
}"#
        .into(),
    }
  }
}

/// Pipeline tuning knobs. Defaults match production behaviour.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
  /// Questions requested per generation call.
  pub chunk_size: usize,
  /// Passages retrieved from the corpus per topic.
  pub context_top_k: usize,
  /// Token budget for the assembled context.
  pub context_token_budget: usize,
  /// Model name used to pick the tokenizer for context budgeting.
  pub tokenizer_model: String,
  /// Category scores strictly below this produce a revision directive.
  pub improvement_threshold: u8,
  pub generation_timeout_secs: u64,
  pub verification_timeout_secs: u64,
  pub search_timeout_secs: u64,
  /// Upper bound on topic-batches running at once.
  pub max_concurrent_topics: usize,
  /// Upper bound on chunk calls in flight for one topic-batch.
  pub max_concurrent_chunks: usize,
  /// Largest `numQuestions` a topic may ask for.
  pub max_questions_per_topic: usize,
  /// Caller-level deadline for a whole paper.
  pub paper_timeout_secs: u64,
  /// Base delay before retrying after an upstream failure.
  pub retry_backoff_ms: u64,
  pub generation_temperature: f32,
  pub verification_temperature: f32,
}

impl Default for PipelineSettings {
  fn default() -> Self {
    Self {
      chunk_size: 5,
      context_top_k: 4,
      context_token_budget: 1000,
      tokenizer_model: "gpt-4".into(),
      improvement_threshold: 70,
      generation_timeout_secs: 90,
      verification_timeout_secs: 60,
      search_timeout_secs: 10,
      max_concurrent_topics: 4,
      max_concurrent_chunks: 3,
      max_questions_per_topic: 50,
      paper_timeout_secs: 600,
      retry_backoff_ms: 500,
      generation_temperature: 0.0,
      verification_temperature: 0.0,
    }
  }
}

impl PipelineSettings {
  /// Clamp values that would make the pipeline misbehave.
  pub fn sanitized(mut self) -> Self {
    if self.chunk_size == 0 {
      warn!(target: "mcq_backend", "chunk_size must be at least 1; using 1");
      self.chunk_size = 1;
    }
    if self.max_concurrent_topics == 0 {
      warn!(target: "mcq_backend", "max_concurrent_topics must be at least 1; using 1");
      self.max_concurrent_topics = 1;
    }
    if self.max_concurrent_chunks == 0 {
      warn!(target: "mcq_backend", "max_concurrent_chunks must be at least 1; using 1");
      self.max_concurrent_chunks = 1;
    }
    if self.max_questions_per_topic == 0 {
      warn!(target: "mcq_backend", "max_questions_per_topic must be at least 1; using 1");
      self.max_questions_per_topic = 1;
    }
    for (name, secs) in [
      ("generation_timeout_secs", &mut self.generation_timeout_secs),
      ("verification_timeout_secs", &mut self.verification_timeout_secs),
      ("search_timeout_secs", &mut self.search_timeout_secs),
      ("paper_timeout_secs", &mut self.paper_timeout_secs),
    ] {
      if *secs == 0 {
        warn!(target: "mcq_backend", setting = name, "timeout must be at least 1 second; using 1");
        *secs = 1;
      }
    }
    if self.improvement_threshold > 100 {
      warn!(target: "mcq_backend", threshold = self.improvement_threshold, "improvement_threshold above 100; using 100");
      self.improvement_threshold = 100;
    }
    self
  }

  pub fn generation_timeout(&self) -> Duration {
    Duration::from_secs(self.generation_timeout_secs)
  }

  pub fn verification_timeout(&self) -> Duration {
    Duration::from_secs(self.verification_timeout_secs)
  }

  pub fn search_timeout(&self) -> Duration {
    Duration::from_secs(self.search_timeout_secs)
  }

  pub fn paper_timeout(&self) -> Duration {
    Duration::from_secs(self.paper_timeout_secs)
  }

  pub fn retry_backoff(&self) -> Duration {
    Duration::from_millis(self.retry_backoff_ms)
  }
}

/// Parse an agent config from TOML text.
pub fn parse_agent_config(s: &str) -> Result<AgentConfig, toml::de::Error> {
  toml::from_str::<AgentConfig>(s).map(|mut cfg| {
    cfg.pipeline = cfg.pipeline.sanitized();
    cfg
  })
}

/// Attempt to load `AgentConfig` from AGENT_CONFIG_PATH. On any parsing/IO error, returns None.
pub fn load_agent_config_from_env() -> Option<AgentConfig> {
  let path = std::env::var("AGENT_CONFIG_PATH").ok()?;
  match std::fs::read_to_string(&path) {
    Ok(s) => match parse_agent_config(&s) {
      Ok(cfg) => {
        info!(target: "mcq_backend", %path, "Loaded agent config (TOML)");
        Some(cfg)
      }
      Err(e) => {
        error!(target: "mcq_backend", %path, error = %e, "Failed to parse TOML config");
        None
      }
    },
    Err(e) => {
      error!(target: "mcq_backend", %path, error = %e, "Failed to read TOML config file");
      None
    }
  }
}
