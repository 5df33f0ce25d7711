//! Reference corpus: the similarity-search capability and a local, in-memory implementation.
//!
//! The pipeline only depends on `SearchCapability`. `LocalCorpus` loads text
//! files from a directory, splits them into overlapping passages, and ranks
//! passages by lexical overlap with the query.

use std::collections::HashSet;
use std::path::Path;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::errors::CorpusError;

pub const CHUNK_CHARS: usize = 1000;
pub const CHUNK_OVERLAP: usize = 200;

/// Opaque "query + k -> passages" search over the reference corpus.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SearchCapability: Send + Sync {
    async fn similarity_search(&self, query: &str, k: usize) -> Result<Vec<String>, CorpusError>;
}

#[derive(Clone, Debug, Default)]
pub struct LocalCorpus {
    passages: Vec<Passage>,
}

#[derive(Clone, Debug)]
struct Passage {
    text: String,
    terms: HashSet<String>,
}

impl LocalCorpus {
    pub fn from_documents<I, S>(docs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let passages = docs
            .into_iter()
            .flat_map(|d| split_passages(d.as_ref(), CHUNK_CHARS, CHUNK_OVERLAP))
            .map(|text| Passage { terms: terms(&text), text })
            .collect();
        Self { passages }
    }

    /// Load every `.txt` / `.md` file in `dir` (non-recursive, sorted by name).
    pub fn load_dir(dir: &Path) -> std::io::Result<Self> {
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.is_file()
                    && matches!(
                        p.extension().and_then(|x| x.to_str()),
                        Some("txt") | Some("md")
                    )
            })
            .collect();
        paths.sort();

        let mut docs = Vec::with_capacity(paths.len());
        for path in &paths {
            match std::fs::read_to_string(path) {
                Ok(s) => docs.push(s),
                Err(e) => warn!(target: "mcq_backend", path = %path.display(), error = %e, "Skipping unreadable corpus file"),
            }
        }

        let corpus = Self::from_documents(docs);
        info!(target: "mcq_backend", dir = %dir.display(), files = paths.len(), passages = corpus.len(), "Loaded local corpus");
        Ok(corpus)
    }

    pub fn len(&self) -> usize {
        self.passages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }

    /// Top-`k` passages by number of shared query terms; ties keep corpus order.
    fn rank(&self, query: &str, k: usize) -> Vec<String> {
        let wanted = terms(query);
        let mut scored: Vec<(usize, usize)> = self
            .passages
            .iter()
            .enumerate()
            .map(|(i, p)| (p.terms.intersection(&wanted).count(), i))
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        scored
            .into_iter()
            .take(k)
            .map(|(_, i)| self.passages[i].text.clone())
            .collect()
    }
}

#[async_trait]
impl SearchCapability for LocalCorpus {
    async fn similarity_search(&self, query: &str, k: usize) -> Result<Vec<String>, CorpusError> {
        if self.passages.is_empty() {
            return Err(CorpusError::Unavailable("corpus is empty".into()));
        }
        Ok(self.rank(query, k))
    }
}

/// Windows of at most `size` characters sharing about `overlap` characters with
/// the previous one. A window prefers to end after a paragraph break, then a
/// line break, then a space, as long as that keeps it at least half full.
fn split_passages(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.iter().all(|c| c.is_whitespace()) {
        return vec![];
    }
    let size = size.max(1);
    let mut out = Vec::new();
    let mut start = 0;
    loop {
        let hard_end = (start + size).min(chars.len());
        let end = if hard_end == chars.len() {
            hard_end
        } else {
            boundary(&chars, start + size / 2, hard_end).unwrap_or(hard_end)
        };
        let passage: String = chars[start..end].iter().collect();
        if !passage.trim().is_empty() {
            out.push(passage);
        }
        if end == chars.len() {
            break;
        }
        start = end.saturating_sub(overlap).max(start + 1);
    }
    out
}

/// Cut position just after the best separator in `chars[lo..hi]`.
fn boundary(chars: &[char], lo: usize, hi: usize) -> Option<usize> {
    let window = chars.get(lo..hi)?;
    let paragraph = window.windows(2).rposition(|w| w == ['\n', '\n']).map(|i| i + 2);
    let line = || window.iter().rposition(|c| *c == '\n').map(|i| i + 1);
    let space = || window.iter().rposition(|c| *c == ' ').map(|i| i + 1);
    paragraph.or_else(line).or_else(space).map(|i| lo + i)
}

fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(|t| t.to_lowercase())
        .collect()
}
