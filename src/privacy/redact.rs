//! Regex-based secret redaction

use regex::Regex;
use std::sync::OnceLock;

/// Tokens shorter than this are fully masked
const MIN_PARTIAL_MASK_LEN: usize = 18;

/// A compiled redaction rule.
///
/// `secret_group` selects the capture group holding the secret; the rest of
/// the match (a `Bearer ` prefix, a `password=` key) is kept as-is.
struct RedactRule {
    #[allow(dead_code)]
    name: &'static str,
    pattern: Regex,
    secret_group: usize,
}

/// Secret redactor over a fixed rule set
pub struct Redactor {
    rules: Vec<RedactRule>,
}

impl Redactor {
    /// Build the default rule set
    pub fn new() -> Self {
        let specs: [(&'static str, &'static str, usize); 6] = [
            (
                "bearer",
                r"(?i)\bbearer\s+([A-Za-z0-9._~+/\-]{8,}=*)",
                1,
            ),
            (
                "key_value",
                r#"(?i)\b(?:api[_-]?key|access[_-]?token|auth[_-]?token|token|secret|password|passwd)\b["']?\s*[=:]\s*["']?([^\s"',;&]+)"#,
                1,
            ),
            ("openai_key", r"\b(sk-[A-Za-z0-9_\-]{8,})", 1),
            ("slack_token", r"\b(xox[baprs]-[A-Za-z0-9\-]{10,})", 1),
            ("github_token", r"\b(gh[pousr]_[A-Za-z0-9]{20,})", 1),
            ("github_pat", r"\b(github_pat_[A-Za-z0-9_]{20,})", 1),
        ];

        let rules = specs
            .into_iter()
            .filter_map(|(name, pattern, secret_group)| {
                match Regex::new(pattern) {
                    Ok(pattern) => Some(RedactRule {
                        name,
                        pattern,
                        secret_group,
                    }),
                    Err(e) => {
                        tracing::error!(rule = name, "Invalid redaction pattern: {}", e);
                        None
                    }
                }
            })
            .collect();

        Self { rules }
    }

    /// Redact every secret found in `text`
    pub fn redact(&self, text: &str) -> String {
        let mut spans: Vec<(usize, usize)> = Vec::new();
        for rule in &self.rules {
            for caps in rule.pattern.captures_iter(text) {
                if let Some(secret) = caps.get(rule.secret_group) {
                    spans.push((secret.start(), secret.end()));
                }
            }
        }
        if spans.is_empty() {
            return text.to_string();
        }

        // Merge overlapping spans, then replace back to front.
        spans.sort();
        let mut merged: Vec<(usize, usize)> = Vec::with_capacity(spans.len());
        for (start, end) in spans {
            match merged.last_mut() {
                Some(last) if start <= last.1 => last.1 = last.1.max(end),
                _ => merged.push((start, end)),
            }
        }

        let mut result = text.to_string();
        for (start, end) in merged.into_iter().rev() {
            let masked = mask_token(&text[start..end]);
            result.replace_range(start..end, &masked);
        }
        result
    }

    /// Check whether `text` contains anything that would be redacted
    pub fn contains_secret(&self, text: &str) -> bool {
        self.rules.iter().any(|rule| rule.pattern.is_match(text))
    }
}

impl Default for Redactor {
    fn default() -> Self {
        Self::new()
    }
}

/// Mask a token, keeping the first 6 and last 4 characters of long values
pub fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() < MIN_PARTIAL_MASK_LEN {
        return "***".to_string();
    }
    let head: String = chars[..6].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}…{}", head, tail)
}

/// Redact secrets using the shared default rule set
pub fn redact_secrets(text: &str) -> String {
    static REDACTOR: OnceLock<Redactor> = OnceLock::new();
    REDACTOR.get_or_init(Redactor::new).redact(text)
}
