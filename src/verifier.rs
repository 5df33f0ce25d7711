//! Verification client: scores a generated question set with a second model.
//!
//! `verify` never fails. An unusable answer becomes a default-accept and an
//! unreachable verifier becomes a lower-confidence accept; both are tagged
//! with a `VerdictSource` so the degradation is visible downstream.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use crate::config::{PipelineSettings, Prompts};
use crate::decode::decode;
use crate::domain::{
  Category, CategoryScores, QuestionSet, TopicSpec, Verdict, VerdictSource, VerificationResult,
};
use crate::model::{complete_with_timeout, Prompt, TextModel};
use crate::util::{fill_template, trunc_for_log};

pub struct Verifier {
  model: Arc<dyn TextModel>,
  prompts: Prompts,
  settings: PipelineSettings,
}

impl Verifier {
  pub fn new(model: Arc<dyn TextModel>, prompts: Prompts, settings: PipelineSettings) -> Self {
    Self { model, prompts, settings }
  }

  pub fn render(&self, set: &QuestionSet, topic: &TopicSpec, context: &str) -> Prompt {
    let questions = serde_json::to_string_pretty(&set.questions).unwrap_or_default();
    let mut vars = topic.prompt_vars();
    vars.push(("questions", questions));
    vars.push(("context", context.to_string()));
    let pairs: Vec<(&str, &str)> = vars.iter().map(|(k, v)| (*k, v.as_str())).collect();

    Prompt::new(
      self.prompts.verification_system.clone(),
      fill_template(&self.prompts.verification_user_template, &pairs),
      self.settings.verification_temperature,
    )
  }

  #[instrument(level = "info", skip(self, set, topic, context), fields(topic = %topic.label(), questions = set.len()))]
  pub async fn verify(&self, set: &QuestionSet, topic: &TopicSpec, context: &str) -> VerificationResult {
    let prompt = self.render(set, topic, context);

    let raw = match complete_with_timeout(self.model.as_ref(), &prompt, self.settings.verification_timeout()).await {
      Ok(raw) => raw,
      Err(e) => {
        warn!(target: "pipeline", error = %e, "Verifier unavailable; accepting with reduced confidence");
        return VerificationResult::unavailable_accept();
      }
    };
    debug!(target: "pipeline", model = self.model.model_name(), raw = %trunc_for_log(&raw, 300), "Verifier response");

    match parse_verification(&decode(&raw, json!({}))) {
      Some(result) => {
        info!(target: "pipeline", verdict = %result.verdict, confidence = result.confidence_score, "Verification complete");
        result
      }
      None => {
        warn!(target: "pipeline", preview = %trunc_for_log(&raw, 200), "Malformed verifier output; using default accept");
        VerificationResult::default_accept()
      }
    }
  }
}

/// Strict reading of the verifier's JSON. Any missing or mistyped verdict,
/// confidence or category score yields None.
pub fn parse_verification(v: &Value) -> Option<VerificationResult> {
  let verdict = Verdict::parse(v.get("overall_verdict")?.as_str()?)?;
  let confidence_score = score(v.get("confidence_score")?)?;

  let feedback = v.get("detailed_feedback")?;
  let mut scores = [0u8; 5];
  for (slot, category) in scores.iter_mut().zip(Category::ALL) {
    *slot = score(feedback.get(category.key())?)?;
  }
  let [relevance_score, difficulty_alignment, bloom_taxonomy_alignment, subject_grade_alignment, overall_quality] = scores;

  Some(VerificationResult {
    verdict,
    confidence_score,
    category_scores: CategoryScores {
      relevance_score,
      difficulty_alignment,
      bloom_taxonomy_alignment,
      subject_grade_alignment,
      overall_quality,
    },
    issues: strings(v.get("specific_issues")),
    suggestions: strings(v.get("improvement_suggestions")),
    source: VerdictSource::Verifier,
  })
}

/// 0..=100 from a number or numeric string, rounded and clamped.
fn score(v: &Value) -> Option<u8> {
  let f = match v {
    Value::Number(n) => n.as_f64()?,
    Value::String(s) => s.trim().parse::<f64>().ok()?,
    _ => return None,
  };
  f.is_finite().then(|| f.round().clamp(0.0, 100.0) as u8)
}

fn strings(v: Option<&Value>) -> Vec<String> {
  match v {
    Some(Value::Array(items)) => items
      .iter()
      .filter_map(|i| i.as_str())
      .map(str::trim)
      .filter(|s| !s.is_empty())
      .map(String::from)
      .collect(),
    Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
    _ => vec![],
  }
}
