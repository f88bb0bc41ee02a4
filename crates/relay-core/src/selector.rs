use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

/// Judges how well an agent's purpose fits a query. Implementations must be
/// side-effect free; the orchestrator may call them any number of times.
pub trait Selector: Send + Sync {
    /// Fit of `purpose` for `query`, in `[0, 1]`.
    fn score(&self, query: &str, purpose: &str) -> f64;

    /// Split a request into ordered subtasks. Only the planner uses this.
    fn decompose(&self, query: &str) -> Vec<String>;
}

static TOKEN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[a-z0-9]+").expect("static regex"));

static STEP_SEPARATOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\s*(?:;|\n|,?\s+and then\s+|,?\s+then\s+|,?\s+after that\s+)\s*")
        .expect("static regex")
});

const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "of", "to", "for", "in", "on", "and", "or", "me", "my", "please", "with",
    "all", "is", "are", "it", "this", "that", "from", "by", "some", "what", "show", "give",
];

/// Token-overlap selector. Good enough for keyword-style purposes and for
/// tests; real deployments inject a model-backed scorer instead.
#[derive(Clone, Debug, Default)]
pub struct LexicalSelector;

impl LexicalSelector {
    pub fn new() -> Self {
        Self
    }

    fn tokens(text: &str) -> HashSet<String> {
        let lower = text.to_lowercase();
        TOKEN
            .find_iter(&lower)
            .map(|m| m.as_str())
            .filter(|t| !STOP_WORDS.contains(t))
            .map(fold_plural)
            .collect()
    }
}

fn fold_plural(token: &str) -> String {
    if token.len() > 3 && token.ends_with('s') && !token.ends_with("ss") {
        token[..token.len() - 1].to_string()
    } else {
        token.to_string()
    }
}

impl Selector for LexicalSelector {
    fn score(&self, query: &str, purpose: &str) -> f64 {
        let query_tokens = Self::tokens(query);
        if query_tokens.is_empty() {
            return 0.0;
        }
        let purpose_tokens = Self::tokens(purpose);
        let shared = query_tokens.intersection(&purpose_tokens).count();
        (shared as f64 / query_tokens.len() as f64).clamp(0.0, 1.0)
    }

    fn decompose(&self, query: &str) -> Vec<String> {
        STEP_SEPARATOR
            .split(query)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    }
}
