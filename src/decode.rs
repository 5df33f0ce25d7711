//! Fault-tolerant JSON extraction from model output.
//!
//! Models are asked for strict JSON but routinely wrap it in markdown fences,
//! prefix a `json` tag, or surround it with prose. `decode` tries, in order:
//! fence stripping, language-tag stripping, a direct parse, the greedy
//! outermost `{...}` span, and a string-aware balanced scan. If all of that
//! fails it logs and hands back the caller's fallback. It never fails.

use serde_json::Value;
use tracing::{debug, warn};

use crate::util::trunc_for_log;

const FENCE: &str = "```";

/// Extract a JSON value from `text`, or return `fallback` unchanged.
pub fn decode(text: &str, fallback: Value) -> Value {
  let candidate = strip_language_tag(strip_fence(text.trim())).trim();

  if let Ok(v) = serde_json::from_str::<Value>(candidate) {
    return v;
  }

  if let Some(span) = greedy_object_span(text) {
    match serde_json::from_str::<Value>(span) {
      Ok(v) => return v,
      Err(e) => debug!(target: "mcq_backend", error = %e, "Greedy JSON span did not parse"),
    }
  }

  if let Some(span) = balanced_object_span(text) {
    match serde_json::from_str::<Value>(span) {
      Ok(v) => return v,
      Err(e) => debug!(target: "mcq_backend", error = %e, "Balanced JSON span did not parse"),
    }
  }

  warn!(target: "mcq_backend", preview = %trunc_for_log(text, 200), "Failed to parse JSON; returning fallback");
  fallback
}

/// Take the segment inside a leading fence, e.g. "```json\n{..}\n```" -> "json\n{..}\n".
fn strip_fence(s: &str) -> &str {
  let Some(rest) = s.strip_prefix(FENCE) else {
    return s;
  };
  match rest.find(FENCE) {
    Some(end) => &rest[..end],
    None => rest,
  }
}

fn strip_language_tag(s: &str) -> &str {
  let t = s.trim_start();
  match t.get(..4) {
    Some(tag) if tag.eq_ignore_ascii_case("json") => &t[4..],
    _ => t,
  }
}

/// First `{` through last `}`.
fn greedy_object_span(s: &str) -> Option<&str> {
  let start = s.find('{')?;
  let end = s.rfind('}')?;
  (end > start).then(|| &s[start..=end])
}

/// First `{` through its matching `}`, ignoring braces inside strings.
fn balanced_object_span(s: &str) -> Option<&str> {
  let start = s.find('{')?;
  let mut depth = 0usize;
  let mut in_string = false;
  let mut escaped = false;

  for (offset, ch) in s[start..].char_indices() {
    if in_string {
      if escaped {
        escaped = false;
      } else if ch == '\\' {
        escaped = true;
      } else if ch == '"' {
        in_string = false;
      }
      continue;
    }
    match ch {
      '"' => in_string = true,
      '{' => depth += 1,
      '}' => {
        depth -= 1;
        if depth == 0 {
          return Some(&s[start..start + offset + 1]);
        }
      }
      _ => {}
    }
  }
  None
}
