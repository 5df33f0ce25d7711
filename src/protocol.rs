//! Public protocol structs for the HTTP endpoints (serde ready).
//! Field names are camelCase to match existing question-paper clients.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{Question, TopicRequest, TopicSpec, Verdict, VerdictSource};
use crate::errors::{AppError, PipelineError};
use crate::pipeline::TopicOutcome;

/// Request body for `POST /api/v1/questions`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratePaperIn {
    #[serde(default)]
    pub subject_name: Option<String>,
    /// Grades arrive as strings or bare numbers.
    #[serde(default)]
    pub class_grade: Option<Value>,
    #[serde(default)]
    pub topics: Vec<TopicRequest>,
}

impl GeneratePaperIn {
    /// Check the request and resolve topic defaults; returns (subject, grade, topics).
    /// A topic asking for more than `max_questions` questions is rejected.
    pub fn validate(self, max_questions: usize) -> Result<(String, String, Vec<TopicSpec>), AppError> {
        let subject = self
            .subject_name
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AppError::ValidationError("subjectName is required".into()))?;
        let grade = match self.class_grade {
            Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
            Some(Value::Number(n)) => n.to_string(),
            _ => return Err(AppError::ValidationError("classGrade is required".into())),
        };
        if self.topics.is_empty() {
            return Err(AppError::ValidationError("topics must contain at least one topic".into()));
        }
        let topics = self
            .topics
            .into_iter()
            .map(|r| TopicSpec::from_request(&subject, &grade, r))
            .collect::<Vec<_>>();
        if let Some(t) = topics.iter().find(|t| t.num_questions > max_questions) {
            return Err(AppError::ValidationError(format!(
                "topic '{}' asks for {} questions; at most {} allowed",
                t.section_name, t.num_questions, max_questions
            )));
        }
        Ok((subject, grade, topics))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaperOut {
    pub success: bool,
    pub paper_id: String,
    pub topics: Vec<TopicOut>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicStatus {
    /// Verifier accepted the set (possibly by degrading to accept).
    Accepted,
    /// Attempts ran out while still rejected; best-effort set returned.
    Unverified,
    Failed,
    Cancelled,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicOut {
    pub topic: String,
    pub status: TopicStatus,
    pub questions: Vec<Question>,
    pub attempts_used: Option<u32>,
    pub verdict: Option<Verdict>,
    pub confidence_score: Option<u8>,
    pub verdict_source: Option<VerdictSource>,
    pub warning: Option<String>,
    pub error: Option<String>,
}

impl TopicOut {
    pub fn succeeded(&self) -> bool {
        matches!(self.status, TopicStatus::Accepted | TopicStatus::Unverified)
    }
}

impl From<TopicOutcome> for TopicOut {
    fn from(o: TopicOutcome) -> Self {
        let topic = o.topic.section_name;
        match o.result {
            Ok(r) => TopicOut {
                topic,
                status: if r.verification.is_accepted() { TopicStatus::Accepted } else { TopicStatus::Unverified },
                questions: r.question_set.questions,
                attempts_used: Some(r.attempts_used),
                verdict: Some(r.verification.verdict),
                confidence_score: Some(r.verification.confidence_score),
                verdict_source: Some(r.verification.source),
                warning: r.warning,
                error: None,
            },
            Err(e) => TopicOut {
                topic,
                status: match e {
                    PipelineError::Cancelled => TopicStatus::Cancelled,
                    _ => TopicStatus::Failed,
                },
                questions: vec![],
                attempts_used: None,
                verdict: None,
                confidence_score: None,
                verdict_source: None,
                warning: None,
                error: Some(e.to_string()),
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthOut {
    pub ok: bool,
    pub generation: bool,
    pub corpus: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_grade_is_accepted() {
        let body: GeneratePaperIn = serde_json::from_value(json!({
            "subjectName": "Science",
            "classGrade": 7,
            "topics": [{ "sectionName": "Cells", "numQuestions": 2 }]
        }))
        .unwrap();
        let (subject, grade, topics) = body.validate(50).unwrap();
        assert_eq!(subject, "Science");
        assert_eq!(grade, "7");
        assert_eq!(topics.len(), 1);
        assert_eq!(topics[0].class_grade, "7");
        assert_eq!(topics[0].num_questions, 2);
    }

    #[test]
    fn missing_paper_fields_are_rejected() {
        let no_subject: GeneratePaperIn =
            serde_json::from_value(json!({ "classGrade": "7", "topics": [{}] })).unwrap();
        assert!(matches!(no_subject.validate(50), Err(AppError::ValidationError(m)) if m.contains("subjectName")));

        let no_topics: GeneratePaperIn =
            serde_json::from_value(json!({ "subjectName": "Science", "classGrade": "7", "topics": [] })).unwrap();
        assert!(matches!(no_topics.validate(50), Err(AppError::ValidationError(m)) if m.contains("topics")));
    }

    #[test]
    fn oversized_topics_are_rejected() {
        for n in [json!(51), json!(1e300), json!("5000")] {
            let body: GeneratePaperIn = serde_json::from_value(json!({
                "subjectName": "Science",
                "classGrade": "7",
                "topics": [{ "sectionName": "Cells", "numQuestions": 2 }, { "sectionName": "Atoms", "numQuestions": n }]
            }))
            .unwrap();
            assert!(matches!(body.validate(50), Err(AppError::ValidationError(m)) if m.contains("'Atoms'")));
        }
    }
}
