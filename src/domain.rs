//! Domain models: topic requests, questions, verification verdicts and pipeline results.

use serde::{Deserialize, Serialize};

/// Raw topic entry as submitted by callers (camelCase, loosely typed).
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicRequest {
  #[serde(default)] pub section_name: Option<String>,
  #[serde(default)] pub difficulty: Option<String>,
  #[serde(default)] pub bloom_level: Option<String>,
  #[serde(default)] pub question_type: Option<String>,
  /// Number or numeric string; anything else falls back to 1.
  #[serde(default)] pub num_questions: Option<serde_json::Value>,
  #[serde(default)] pub additional_instructions: Option<String>,
}

/// One topic-batch request with every default already resolved.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TopicSpec {
  pub subject: String,
  pub class_grade: String,
  pub section_name: String,
  pub difficulty: String,
  pub bloom_level: String,
  pub question_type: String,
  pub num_questions: usize,
  pub additional_instructions: String,
}

const DEFAULT_DIFFICULTY: &str = "Medium";
const DEFAULT_BLOOM_LEVEL: &str = "Remember";
const DEFAULT_QUESTION_TYPE: &str = "MCQ";
const UNKNOWN: &str = "Unknown";

impl TopicSpec {
  /// Merge a topic entry with the paper-level subject and grade.
  pub fn from_request(subject: &str, class_grade: &str, req: TopicRequest) -> Self {
    fn or_default(v: Option<String>, default: &str) -> String {
      match v.map(|s| s.trim().to_string()) {
        Some(s) if !s.is_empty() => s,
        _ => default.to_string(),
      }
    }

    Self {
      subject: subject.trim().to_string(),
      class_grade: class_grade.trim().to_string(),
      section_name: req.section_name.unwrap_or_default().trim().to_string(),
      difficulty: or_default(req.difficulty, DEFAULT_DIFFICULTY),
      bloom_level: or_default(req.bloom_level, DEFAULT_BLOOM_LEVEL),
      question_type: or_default(req.question_type, DEFAULT_QUESTION_TYPE),
      num_questions: parse_num_questions(req.num_questions.as_ref()),
      additional_instructions: req.additional_instructions.unwrap_or_default().trim().to_string(),
    }
  }

  /// Label used to tag the resulting question set.
  pub fn label(&self) -> &str {
    &self.section_name
  }

  /// The same topic asking for a different number of questions (used per chunk).
  pub fn with_num_questions(&self, n: usize) -> Self {
    Self { num_questions: n.max(1), ..self.clone() }
  }

  /// Template variables shared by every prompt that describes this topic.
  pub fn prompt_vars(&self) -> Vec<(&'static str, String)> {
    let shown = |s: &str| if s.is_empty() { UNKNOWN.to_string() } else { s.to_string() };
    vec![
      ("subject", shown(&self.subject)),
      ("class_grade", shown(&self.class_grade)),
      ("topic", shown(&self.section_name)),
      ("difficulty", self.difficulty.clone()),
      ("bloom_level", self.bloom_level.clone()),
      ("question_type", self.question_type.clone()),
      ("num_questions", self.num_questions.to_string()),
      ("instructions", self.additional_instructions.clone()),
    ]
  }
}

/// Positive integer from a loosely typed value; 1 on anything unusable.
pub fn parse_num_questions(raw: Option<&serde_json::Value>) -> usize {
  let n = match raw {
    Some(serde_json::Value::Number(n)) => n
      .as_i64()
      .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)),
    Some(serde_json::Value::String(s)) => s.trim().parse::<i64>().ok(),
    _ => None,
  };
  match n {
    Some(n) if n >= 1 => n as usize,
    _ => 1,
  }
}

/// A single multiple-choice question. Field names match the model's JSON output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
  #[serde(rename = "question")]
  pub question_text: String,
  pub options: Vec<String>,
  pub answer: String,
  pub explanation: String,
}

/// Ordered questions generated for one topic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QuestionSet {
  pub topic: String,
  pub questions: Vec<Question>,
}

impl QuestionSet {
  pub fn new(topic: impl Into<String>, questions: Vec<Question>) -> Self {
    Self { topic: topic.into(), questions }
  }

  pub fn len(&self) -> usize {
    self.questions.len()
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
  Accepted,
  Rejected,
}

impl Verdict {
  /// Case-insensitive parse of a verifier verdict string.
  pub fn parse(s: &str) -> Option<Self> {
    match s.trim().to_ascii_uppercase().as_str() {
      "ACCEPTED" => Some(Verdict::Accepted),
      "REJECTED" => Some(Verdict::Rejected),
      _ => None,
    }
  }
}

impl std::fmt::Display for Verdict {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Verdict::Accepted => write!(f, "ACCEPTED"),
      Verdict::Rejected => write!(f, "REJECTED"),
    }
  }
}

/// The five fixed quality categories scored by the verifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Category {
  Relevance,
  DifficultyAlignment,
  BloomTaxonomyAlignment,
  SubjectGradeAlignment,
  OverallQuality,
}

impl Category {
  pub const ALL: [Category; 5] = [
    Category::Relevance,
    Category::DifficultyAlignment,
    Category::BloomTaxonomyAlignment,
    Category::SubjectGradeAlignment,
    Category::OverallQuality,
  ];

  /// Key used in the verifier's `detailed_feedback` object.
  pub fn key(self) -> &'static str {
    match self {
      Category::Relevance => "relevance_score",
      Category::DifficultyAlignment => "difficulty_alignment",
      Category::BloomTaxonomyAlignment => "bloom_taxonomy_alignment",
      Category::SubjectGradeAlignment => "subject_grade_alignment",
      Category::OverallQuality => "overall_quality",
    }
  }

  /// Revision directive emitted when this category scores below threshold.
  pub fn directive(self) -> &'static str {
    match self {
      Category::Relevance => "Improve relevance to the provided context",
      Category::DifficultyAlignment => "Better align with the specified difficulty level",
      Category::BloomTaxonomyAlignment => "Better align with the specified Bloom's taxonomy level",
      Category::SubjectGradeAlignment => "Make questions more appropriate for the subject and grade level",
      Category::OverallQuality => "Improve overall question quality and clarity",
    }
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryScores {
  pub relevance_score: u8,
  pub difficulty_alignment: u8,
  pub bloom_taxonomy_alignment: u8,
  pub subject_grade_alignment: u8,
  pub overall_quality: u8,
}

impl CategoryScores {
  pub fn uniform(score: u8) -> Self {
    Self {
      relevance_score: score,
      difficulty_alignment: score,
      bloom_taxonomy_alignment: score,
      subject_grade_alignment: score,
      overall_quality: score,
    }
  }

  pub fn get(&self, category: Category) -> u8 {
    match category {
      Category::Relevance => self.relevance_score,
      Category::DifficultyAlignment => self.difficulty_alignment,
      Category::BloomTaxonomyAlignment => self.bloom_taxonomy_alignment,
      Category::SubjectGradeAlignment => self.subject_grade_alignment,
      Category::OverallQuality => self.overall_quality,
    }
  }

  /// Categories scoring strictly below `threshold`, in fixed category order.
  pub fn below(&self, threshold: u8) -> Vec<Category> {
    Category::ALL.into_iter().filter(|c| self.get(*c) < threshold).collect()
  }
}

/// Where a verification result came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictSource {
  /// Parsed from a well-formed verifier answer.
  Verifier,
  /// Verifier answered, but not with a usable verdict; default-accept substituted.
  DegradedMalformed,
  /// Verifier call failed; lower-confidence default-accept substituted.
  DegradedUnavailable,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VerificationResult {
  pub verdict: Verdict,
  pub confidence_score: u8,
  pub category_scores: CategoryScores,
  pub issues: Vec<String>,
  pub suggestions: Vec<String>,
  pub source: VerdictSource,
}

impl VerificationResult {
  /// Substitute used when the verifier answered with something unusable.
  pub fn default_accept() -> Self {
    Self {
      verdict: Verdict::Accepted,
      confidence_score: 80,
      category_scores: CategoryScores::uniform(80),
      issues: vec![],
      suggestions: vec![],
      source: VerdictSource::DegradedMalformed,
    }
  }

  /// Substitute used when the verifier could not be reached at all.
  pub fn unavailable_accept() -> Self {
    Self {
      verdict: Verdict::Accepted,
      confidence_score: 70,
      category_scores: CategoryScores::uniform(70),
      issues: vec!["Verification process encountered an error".into()],
      suggestions: vec!["Consider manual review of generated questions".into()],
      source: VerdictSource::DegradedUnavailable,
    }
  }

  pub fn is_accepted(&self) -> bool {
    self.verdict == Verdict::Accepted
  }
}

/// Final result of one topic-batch pipeline run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PipelineResult {
  pub question_set: QuestionSet,
  pub verification: VerificationResult,
  pub attempts_used: u32,
  pub warning: Option<String>,
}
