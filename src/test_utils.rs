//! Shared fixtures and test doubles for unit tests.

pub mod fixtures {
  use serde_json::{json, Value};

  use crate::domain::{TopicRequest, TopicSpec};

  pub fn topic(label: &str, num_questions: usize) -> TopicSpec {
    let req = TopicRequest {
      section_name: Some(label.to_string()),
      num_questions: Some(json!(num_questions)),
      ..Default::default()
    };
    TopicSpec::from_request("Mathematics", "8", req)
  }

  pub fn question(prefix: &str, i: usize) -> Value {
    json!({
      "question": format!("{prefix} question {i}"),
      "options": ["A", "B", "C", "D"],
      "answer": "A",
      "explanation": format!("{prefix} explanation {i}")
    })
  }

  /// Valid generation output with `n` questions numbered from `start`.
  pub fn questions_json_from(prefix: &str, start: usize, n: usize) -> String {
    let qs: Vec<Value> = (start..start + n).map(|i| question(prefix, i)).collect();
    json!({ "questions": qs }).to_string()
  }

  pub fn questions_json(prefix: &str, n: usize) -> String {
    questions_json_from(prefix, 0, n)
  }

  /// Well-formed verifier output with every category at `score`.
  pub fn verdict_json(verdict: &str, score: u8) -> String {
    json!({
      "overall_verdict": verdict,
      "confidence_score": score,
      "detailed_feedback": {
        "relevance_score": score,
        "difficulty_alignment": score,
        "bloom_taxonomy_alignment": score,
        "subject_grade_alignment": score,
        "overall_quality": score
      },
      "specific_issues": if verdict == "REJECTED" { vec!["Too easy"] } else { vec![] },
      "improvement_suggestions": if verdict == "REJECTED" { vec!["Add distractors"] } else { vec![] }
    })
    .to_string()
  }

  /// Reads N back out of a rendered "Generate exactly N ..." prompt.
  pub fn requested_count(user_prompt: &str) -> usize {
    user_prompt
      .split("Generate exactly ")
      .nth(1)
      .and_then(|rest| rest.split_whitespace().next())
      .and_then(|n| n.parse().ok())
      .unwrap_or(0)
  }
}

pub mod doubles {
  use std::collections::VecDeque;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Mutex;
  use std::time::Duration;

  use async_trait::async_trait;

  use crate::errors::UpstreamError;
  use crate::model::{Prompt, TextModel};

  /// Replays canned responses in order and records every prompt it saw.
  /// Once the script runs out it keeps answering with an empty response error.
  pub struct ScriptedModel {
    responses: Mutex<VecDeque<Result<String, UpstreamError>>>,
    prompts: Mutex<Vec<Prompt>>,
  }

  impl ScriptedModel {
    pub fn new(responses: Vec<Result<String, UpstreamError>>) -> Self {
      Self { responses: Mutex::new(responses.into()), prompts: Mutex::new(vec![]) }
    }

    pub fn ok(responses: Vec<String>) -> Self {
      Self::new(responses.into_iter().map(Ok).collect())
    }

    pub fn calls(&self) -> usize {
      self.prompts.lock().unwrap().len()
    }

    pub fn prompts(&self) -> Vec<Prompt> {
      self.prompts.lock().unwrap().clone()
    }
  }

  #[async_trait]
  impl TextModel for ScriptedModel {
    async fn complete(&self, prompt: &Prompt) -> Result<String, UpstreamError> {
      self.prompts.lock().unwrap().push(prompt.clone());
      self.responses.lock().unwrap().pop_front().unwrap_or(Err(UpstreamError::EmptyResponse))
    }

    fn model_name(&self) -> &str {
      "scripted"
    }
  }

  type Responder = dyn Fn(&Prompt) -> (Duration, Result<String, UpstreamError>) + Send + Sync;

  /// Computes each answer from the prompt, after an optional delay.
  pub struct FnModel {
    respond: Box<Responder>,
    calls: AtomicUsize,
  }

  impl FnModel {
    pub fn new<F>(respond: F) -> Self
    where
      F: Fn(&Prompt) -> (Duration, Result<String, UpstreamError>) + Send + Sync + 'static,
    {
      Self { respond: Box::new(respond), calls: AtomicUsize::new(0) }
    }

    pub fn calls(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
    }
  }

  #[async_trait]
  impl TextModel for FnModel {
    async fn complete(&self, prompt: &Prompt) -> Result<String, UpstreamError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      let (delay, result) = (self.respond)(prompt);
      if !delay.is_zero() {
        tokio::time::sleep(delay).await;
      }
      result
    }

    fn model_name(&self) -> &str {
      "fn"
    }
  }
}
