//! Relevance scoring of listing descriptions against a skill profile.
//!
//! Scoring has two steps. First the profile's skills are matched as
//! case-insensitive substrings of the description. Only when at least one
//! skill is present is the similarity model consulted; otherwise the score
//! is exactly zero.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use jfind_core::SkillProfile;
use regex::Regex;
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "jfind-scoring";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScoringError {
    #[error("empty vocabulary; neither document contains a token")]
    EmptyVocabulary,
    #[error("similarity model failed: {0}")]
    Model(String),
}

/// A document-pair similarity in percent (0 to 100).
pub trait TextSimilarity: Send + Sync {
    fn similarity(&self, profile_text: &str, description: &str) -> Result<f64, ScoringError>;
}

/// TF-IDF vectors fitted on the two-document corpus `{profile, description}`, compared by cosine.
///
/// Tokens are lowercased runs of two or more word characters. IDF is smoothed
/// (`ln((1 + n) / (1 + df)) + 1`) and rows are L2-normalized, so a
/// document without tokens scores zero against anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct TfIdfCosine;

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\b\w\w+\b").expect("token pattern compiles"))
}

pub fn tokenize(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    token_pattern()
        .find_iter(&lowered)
        .map(|m| m.as_str().to_string())
        .collect()
}

fn term_counts(text: &str) -> BTreeMap<String, f64> {
    let mut counts = BTreeMap::new();
    for token in tokenize(text) {
        *counts.entry(token).or_insert(0.0) += 1.0;
    }
    counts
}

impl TfIdfCosine {
    fn weighted(counts: &BTreeMap<String, f64>, idf: &BTreeMap<&str, f64>) -> BTreeMap<String, f64> {
        counts
            .iter()
            .map(|(term, tf)| (term.clone(), tf * idf.get(term.as_str()).copied().unwrap_or(1.0)))
            .collect()
    }

    fn norm(vector: &BTreeMap<String, f64>) -> f64 {
        vector.values().map(|w| w * w).sum::<f64>().sqrt()
    }
}

impl TextSimilarity for TfIdfCosine {
    fn similarity(&self, profile_text: &str, description: &str) -> Result<f64, ScoringError> {
        let docs = [term_counts(profile_text), term_counts(description)];
        let n_docs = docs.len() as f64;

        let mut document_frequency: BTreeMap<&str, f64> = BTreeMap::new();
        for doc in &docs {
            for term in doc.keys() {
                *document_frequency.entry(term.as_str()).or_insert(0.0) += 1.0;
            }
        }
        if document_frequency.is_empty() {
            return Err(ScoringError::EmptyVocabulary);
        }

        let idf = document_frequency
            .into_iter()
            .map(|(term, df)| (term, ((1.0 + n_docs) / (1.0 + df)).ln() + 1.0))
            .collect::<BTreeMap<_, _>>();

        let profile = Self::weighted(&docs[0], &idf);
        let listing = Self::weighted(&docs[1], &idf);
        let denominator = Self::norm(&profile) * Self::norm(&listing);
        if denominator == 0.0 {
            return Ok(0.0);
        }

        let dot = profile
            .iter()
            .filter_map(|(term, w)| listing.get(term).map(|other| w * other))
            .sum::<f64>();
        Ok((dot / denominator * 100.0).clamp(0.0, 100.0))
    }
}

/// Skills from the profile that occur in the description, ignoring case.
pub fn find_present_skills(profile: &SkillProfile, description: &str) -> BTreeSet<String> {
    let haystack = description.to_lowercase();
    profile
        .skills()
        .iter()
        .filter(|skill| haystack.contains(skill.as_str()))
        .cloned()
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct Relevance {
    pub found_skills: BTreeSet<String>,
    pub matching_percentage: f64,
}

pub struct RelevanceScorer {
    model: Box<dyn TextSimilarity>,
}

impl Default for RelevanceScorer {
    fn default() -> Self {
        Self::new(Box::new(TfIdfCosine))
    }
}

impl RelevanceScorer {
    pub fn new(model: Box<dyn TextSimilarity>) -> Self {
        Self { model }
    }

    pub fn score(&self, profile: &SkillProfile, description: &str) -> Relevance {
        let found_skills = find_present_skills(profile, description);
        if found_skills.is_empty() {
            return Relevance {
                found_skills,
                matching_percentage: 0.0,
            };
        }

        let matching_percentage = match self.model.similarity(profile.raw(), description) {
            Ok(value) if value.is_finite() => value.clamp(0.0, 100.0),
            Ok(value) => {
                warn!(value, "similarity was not finite; scoring 0");
                0.0
            }
            Err(err) => {
                warn!(error = %err, "similarity failed; scoring 0");
                0.0
            }
        };
        Relevance {
            found_skills,
            matching_percentage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingSimilarity {
        calls: Arc<AtomicUsize>,
        result: Result<f64, ScoringError>,
    }

    impl TextSimilarity for CountingSimilarity {
        fn similarity(&self, _profile_text: &str, _description: &str) -> Result<f64, ScoringError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    fn counting(result: Result<f64, ScoringError>) -> (RelevanceScorer, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let scorer = RelevanceScorer::new(Box::new(CountingSimilarity {
            calls: calls.clone(),
            result,
        }));
        (scorer, calls)
    }

    #[test]
    fn finds_case_insensitive_substrings() {
        let profile = SkillProfile::from_skills(["python", "sql"]);
        let found = find_present_skills(&profile, "Looking for a Python developer");
        assert_eq!(found, BTreeSet::from(["python".to_string()]));
    }

    #[test]
    fn find_present_skills_is_repeatable() {
        let profile = SkillProfile::parse("Rust, Tokio, sql");
        let text = "Async Rust services on TOKIO with PostgreSQL";
        let first = find_present_skills(&profile, text);
        assert_eq!(first, find_present_skills(&profile, text));
        assert_eq!(first.len(), 3);
    }

    #[test]
    fn no_skill_means_zero_without_calling_model() {
        let (scorer, calls) = counting(Ok(99.0));
        let profile = SkillProfile::from_skills(["python", "sql"]);
        let relevance = scorer.score(&profile, "We need a chef");
        assert!(relevance.found_skills.is_empty());
        assert_eq!(relevance.matching_percentage, 0.0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn repeated_skill_scores_positive() {
        let scorer = RelevanceScorer::default();
        let profile = SkillProfile::from_skills(["python"]);
        let relevance = scorer.score(&profile, "python python python");
        assert_eq!(relevance.found_skills, BTreeSet::from(["python".to_string()]));
        assert!(relevance.matching_percentage > 0.0);
        assert!((relevance.matching_percentage - 100.0).abs() < 1e-9);
    }

    #[test]
    fn model_failure_downgrades_to_zero() {
        let (scorer, calls) = counting(Err(ScoringError::EmptyVocabulary));
        let profile = SkillProfile::from_skills(["c"]);
        let relevance = scorer.score(&profile, "c and c++");
        assert_eq!(relevance.found_skills.len(), 1);
        assert_eq!(relevance.matching_percentage, 0.0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn tfidf_matches_reference_weights() {
        // idf(shared) = 1, idf(unique) = ln(1.5) + 1
        let unique = 1.5f64.ln() + 1.0;
        let expected = 100.0 / (1.0 + unique * unique);
        let got = TfIdfCosine.similarity("rust sql", "rust go").unwrap();
        assert!((got - expected).abs() < 1e-9, "got {got}, expected {expected}");
    }

    #[test]
    fn tfidf_ignores_single_character_tokens() {
        assert_eq!(tokenize("C, R and Go"), vec!["and", "go"]);
        assert_eq!(TfIdfCosine.similarity("c", "c r").unwrap_err(), ScoringError::EmptyVocabulary);
        assert_eq!(TfIdfCosine.similarity("c", "golang").unwrap(), 0.0);
    }

    #[test]
    fn tfidf_handles_cyrillic_tokens() {
        let got = TfIdfCosine.similarity("python, разработчик", "Ищем Python разработчика").unwrap();
        assert!(got > 0.0 && got < 100.0);
    }

    #[test]
    fn disjoint_documents_score_zero() {
        assert_eq!(TfIdfCosine.similarity("haskell", "we need a chef").unwrap(), 0.0);
    }
}
