//! Response validation.
//!
//! An ordered rule chain runs over every candidate post: non-empty, length,
//! content safety, duplication. Any failing rule aborts the pipeline with a
//! terminal validation failure; warnings are surfaced but do not block.
//!
//! Content safety goes through the [`SafetyClassifier`] seam. The built-in
//! [`LexiconClassifier`] scores category keyword matches; deployments with
//! a real moderation backend implement the trait over it.

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::warn;

use crate::prompt::normalize;

/// Outcome of the whole chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass { warnings: Vec<String> },
    Fail { reason: String },
}

impl Verdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Pass { .. })
    }
}

/// Scores text for unsafe content; 0.0 is clean, 1.0 is certain.
#[async_trait]
pub trait SafetyClassifier: Send + Sync {
    async fn score(&self, text: &str) -> f32;
}

struct CategoryPattern {
    name: &'static str,
    regex: Regex,
    /// Scale applied to the match-count confidence; advisory categories
    /// contribute less.
    weight: f32,
}

fn category_patterns() -> &'static [CategoryPattern] {
    static PATTERNS: OnceLock<Vec<CategoryPattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let build = |name, pattern: &str, weight| CategoryPattern {
            name,
            regex: Regex::new(pattern).expect("valid pattern"),
            weight,
        };
        vec![
            build(
                "spam",
                r"(?i)\b(buy|sell|discount|offer|click|subscribe|win|lottery|prize)\b",
                1.0,
            ),
            build("offensive", r"(?i)\b(hate|stupid|idiot|dumb)\b", 1.0),
            build(
                "misleading",
                r"(?i)\b(guarantee|guaranteed|foolproof|risk-free)\b",
                0.5,
            ),
            build("harmful", r"(?i)\b(threat|attack|destroy)\b", 1.0),
        ]
    })
}

/// Keyword-lexicon classifier. Each category's confidence scales with its
/// match count (0.2 per match, capped at 1.0); the overall score is the
/// highest weighted category.
#[derive(Debug, Default, Clone, Copy)]
pub struct LexiconClassifier;

impl LexiconClassifier {
    pub fn new() -> Self {
        Self
    }

    fn category_scores(text: &str) -> Vec<(&'static str, f32)> {
        category_patterns()
            .iter()
            .filter_map(|p| {
                let matches = p.regex.find_iter(text).count();
                (matches > 0).then(|| (p.name, (matches as f32 * 0.2).min(1.0) * p.weight))
            })
            .collect()
    }
}

#[async_trait]
impl SafetyClassifier for LexiconClassifier {
    async fn score(&self, text: &str) -> f32 {
        Self::category_scores(text)
            .into_iter()
            .map(|(_, score)| score)
            .fold(0.0, f32::max)
    }
}

/// The validation rule chain.
pub struct ResponseValidator {
    max_len: usize,
    safety_threshold: f32,
    classifier: Box<dyn SafetyClassifier>,
}

impl ResponseValidator {
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len,
            safety_threshold: 0.5,
            classifier: Box::new(LexiconClassifier::new()),
        }
    }

    pub fn with_classifier(mut self, classifier: Box<dyn SafetyClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_safety_threshold(mut self, threshold: f32) -> Self {
        self.safety_threshold = threshold;
        self
    }

    /// Run the chain. `recent_posts` are the tenant's latest published
    /// texts for the duplication check.
    pub async fn validate(&self, text: &str, recent_posts: &[String]) -> Verdict {
        let mut warnings = Vec::new();

        if text.trim().is_empty() {
            return Verdict::Fail {
                reason: "empty response".to_string(),
            };
        }

        let normalized = normalize(text);
        let length = normalized.chars().count();
        if length > self.max_len {
            return Verdict::Fail {
                reason: format!("response length {length} exceeds limit {}", self.max_len),
            };
        }

        let score = self.classifier.score(text).await;
        if score >= self.safety_threshold {
            return Verdict::Fail {
                reason: format!("content safety score {score:.2} at or above threshold"),
            };
        }
        if score > 0.0 {
            warnings.push(format!("content safety score {score:.2}"));
        }

        let folded = normalized.to_lowercase();
        if recent_posts
            .iter()
            .any(|prior| normalize(prior).to_lowercase() == folded)
        {
            return Verdict::Fail {
                reason: "duplicate of a recently published post".to_string(),
            };
        }

        for warning in &warnings {
            warn!(%warning, "validation warning");
        }
        Verdict::Pass { warnings }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> ResponseValidator {
        ResponseValidator::new(280)
    }

    #[tokio::test]
    async fn clean_text_passes() {
        let verdict = validator().validate("A calm note about shipping.", &[]).await;
        assert!(verdict.is_pass());
    }

    #[tokio::test]
    async fn empty_text_fails() {
        let verdict = validator().validate("   \n\t ", &[]).await;
        assert!(matches!(verdict, Verdict::Fail { reason } if reason.contains("empty")));
    }

    #[tokio::test]
    async fn over_length_fails_after_normalization() {
        let text = "x".repeat(281);
        let verdict = validator().validate(&text, &[]).await;
        assert!(matches!(verdict, Verdict::Fail { reason } if reason.contains("length")));

        // Whitespace runs collapse before measuring, so 200 chars with
        // padded gaps still passes.
        let padded = "word  ".repeat(40);
        assert!(validator().validate(&padded, &[]).await.is_pass());
    }

    #[tokio::test]
    async fn spammy_text_fails_safety() {
        let text = "Click now to win a prize! Subscribe for a discount offer!";
        let verdict = validator().validate(text, &[]).await;
        assert!(matches!(verdict, Verdict::Fail { reason } if reason.contains("safety")));
    }

    #[tokio::test]
    async fn mild_match_warns_but_passes() {
        let text = "We offer a quiet take on testing today.";
        match validator().validate(text, &[]).await {
            Verdict::Pass { warnings } => assert_eq!(warnings.len(), 1),
            other => panic!("expected pass, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_is_case_and_whitespace_insensitive() {
        let recent = vec!["Hello   World".to_string()];
        let verdict = validator().validate("hello world", &recent).await;
        assert!(matches!(verdict, Verdict::Fail { reason } if reason.contains("duplicate")));

        let verdict = validator().validate("hello worlds", &recent).await;
        assert!(verdict.is_pass());
    }

    struct StrictClassifier;

    #[async_trait]
    impl SafetyClassifier for StrictClassifier {
        async fn score(&self, _text: &str) -> f32 {
            1.0
        }
    }

    #[tokio::test]
    async fn custom_classifier_is_honoured() {
        let validator = validator().with_classifier(Box::new(StrictClassifier));
        let verdict = validator.validate("anything at all", &[]).await;
        assert!(!verdict.is_pass());
    }

    #[test]
    fn lexicon_scores_scale_with_matches() {
        let scores = LexiconClassifier::category_scores("win win win");
        assert_eq!(scores.len(), 1);
        assert_eq!(scores[0].0, "spam");
        assert!((scores[0].1 - 0.6).abs() < 1e-3);
    }
}
