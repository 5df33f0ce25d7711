//! Small utility helpers used across modules.

/// Very small and safe string templating.
/// Replaces occurrences of `{key}` in the template with provided values.
/// Literal JSON braces in templates are left alone unless they spell a key.
pub fn fill_template(tpl: &str, pairs: &[(&str, &str)]) -> String {
  let mut out = tpl.to_string();
  for (k, v) in pairs {
    let needle = format!("{{{}}}", k);
    out = out.replace(&needle, v);
  }
  out
}

/// Render items as a "- item" list, or `empty` when there are none.
pub fn bullet_list<S: AsRef<str>>(items: &[S], empty: &str) -> String {
  if items.is_empty() {
    return empty.to_string();
  }
  items
    .iter()
    .map(|s| format!("- {}", s.as_ref()))
    .collect::<Vec<_>>()
    .join("\n")
}

/// Log-safe truncation for large strings.
/// Avoids spamming logs with huge request/response payloads.
pub fn trunc_for_log(s: &str, max: usize) -> String {
  if s.len() <= max {
    return s.to_string();
  }
  let mut cut = max;
  while !s.is_char_boundary(cut) {
    cut -= 1;
  }
  format!("{}… ({} bytes total)", &s[..cut], s.len())
}
