//! Context assembly: fetch reference passages for a topic and fit them to a token budget.
//!
//! Retrieval is best-effort. A missing corpus, a search error or a search
//! timeout all produce an empty context; generation proceeds without it.

use std::sync::Arc;
use std::time::Duration;

use tiktoken_rs::CoreBPE;
use tracing::{debug, instrument, warn};

use crate::config::PipelineSettings;
use crate::corpus::SearchCapability;
use crate::domain::TopicSpec;
use crate::errors::CorpusError;

const FALLBACK_QUERY: &str = "general content";

/// Counts and truncates text in model tokens.
#[derive(Clone)]
pub struct TokenBudget {
  bpe: Arc<CoreBPE>,
  max_tokens: usize,
}

impl TokenBudget {
  /// Tokenizer for `model`, or cl100k_base when the model name is unknown.
  pub fn for_model(model: &str, max_tokens: usize) -> Option<Self> {
    let bpe = match tiktoken_rs::get_bpe_from_model(model) {
      Ok(bpe) => bpe,
      Err(e) => {
        warn!(target: "mcq_backend", %model, error = %e, "Unknown tokenizer model; using cl100k_base");
        tiktoken_rs::cl100k_base().ok()?
      }
    };
    Some(Self { bpe: Arc::new(bpe), max_tokens })
  }

  pub fn count(&self, text: &str) -> usize {
    self.bpe.encode_ordinary(text).len()
  }

  /// The longest token prefix of `text` within the budget.
  pub fn truncate(&self, text: &str) -> String {
    let tokens = self.bpe.encode_ordinary(text);
    if tokens.len() <= self.max_tokens {
      return text.to_string();
    }
    // A cut can land inside a multi-byte character; back off until it decodes.
    let mut n = self.max_tokens;
    while n > 0 {
      if let Ok(s) = self.bpe.decode(tokens[..n].to_vec()) {
        return s;
      }
      n -= 1;
    }
    String::new()
  }
}

pub struct ContextAssembler {
  corpus: Option<Arc<dyn SearchCapability>>,
  budget: Option<TokenBudget>,
  top_k: usize,
  search_timeout: Duration,
}

impl ContextAssembler {
  pub fn new(corpus: Option<Arc<dyn SearchCapability>>, settings: &PipelineSettings) -> Self {
    let budget = TokenBudget::for_model(&settings.tokenizer_model, settings.context_token_budget);
    if budget.is_none() {
      warn!(target: "mcq_backend", "No tokenizer available; context will not be truncated");
    }
    Self {
      corpus,
      budget,
      top_k: settings.context_top_k,
      search_timeout: settings.search_timeout(),
    }
  }

  /// Reference text for `topic`, possibly empty.
  #[instrument(level = "info", skip(self, topic), fields(topic = %topic.label()))]
  pub async fn build(&self, topic: &TopicSpec) -> String {
    let Some(corpus) = &self.corpus else {
      return String::new();
    };

    let query = search_query(topic);
    let passages = match self.search(corpus.as_ref(), &query).await {
      Ok(p) => p,
      Err(e) => {
        warn!(target: "pipeline", %query, error = %e, "Context retrieval failed; continuing without context");
        return String::new();
      }
    };

    let joined = passages.iter().map(|p| p.trim()).collect::<Vec<_>>().join("\n");
    let Some(budget) = &self.budget else {
      return joined;
    };
    let context = budget.truncate(&joined);
    debug!(target: "pipeline", %query, passages = passages.len(), tokens = budget.count(&context), "Context assembled");
    context
  }

  /// Top-k passages for `query`, bounded by the search timeout.
  async fn search(&self, corpus: &dyn SearchCapability, query: &str) -> Result<Vec<String>, CorpusError> {
    tokio::time::timeout(self.search_timeout, corpus.similarity_search(query, self.top_k))
      .await
      .map_err(|_| CorpusError::Timeout(self.search_timeout))?
  }
}

fn search_query(topic: &TopicSpec) -> String {
  let q = format!("{} {}", topic.subject, topic.section_name).trim().to_string();
  if q.is_empty() { FALLBACK_QUERY.to_string() } else { q }
}
