//! Deterministic metrics that need no model calls.

use std::collections::HashMap;

use kensa_core::config::{EvaluatorPreset, EvaluatorSelection};
use kensa_core::error::{KensaError, MetricError, Result};

use crate::dataset::TARGETS_KEY;
use crate::metric::{DeterministicMetric, MetricDefinition};

/// Name and one-line description of every builtin metric.
pub const BUILTINS: [(&str, &str); 7] = [
    ("exact_match", "1 if the trimmed output equals the ground truth, else 0"),
    ("token_count", "number of whitespace-separated tokens in the output"),
    ("toxicity", "share of flagged vocabulary in the output, 0 (clean) to 1"),
    ("perplexity", "unigram perplexity of the output under the ground truth"),
    ("flesch_kincaid_grade_level", "Flesch-Kincaid readability grade"),
    ("ari_grade_level", "Automated Readability Index grade"),
    ("token_f1", "token-overlap F1 between output and ground truth"),
];

/// Names selected by the `default` preset for question answering.
const QUESTION_ANSWERING: [&str; 5] = [
    "toxicity",
    "perplexity",
    "flesch_kincaid_grade_level",
    "ari_grade_level",
    "exact_match",
];

const TOXIC_TERMS: [&str; 24] = [
    "hate", "racist", "sexist", "homophobic", "transphobic", "bigot", "slur", "kill", "murder",
    "attack", "hurt", "destroy", "damn", "hell", "shit", "fuck", "ass", "idiot", "stupid",
    "moron", "threaten", "bully", "harass", "stalk",
];

/// Lowercased word tokens with surrounding punctuation removed.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .collect()
}

fn require_ground_truth<'a>(ground_truth: Option<&'a str>) -> std::result::Result<&'a str, MetricError> {
    ground_truth.ok_or_else(|| MetricError::MissingContext(TARGETS_KEY.into()))
}

fn require_words(output: &str) -> std::result::Result<Vec<&str>, MetricError> {
    let words: Vec<&str> = output
        .split_whitespace()
        .filter(|w| w.chars().any(char::is_alphanumeric))
        .collect();
    if words.is_empty() {
        return Err(MetricError::InvalidInput("output has no words".into()));
    }
    Ok(words)
}

fn sentence_count(text: &str) -> usize {
    let count = text
        .split(['.', '!', '?'])
        .filter(|s| s.chars().any(char::is_alphanumeric))
        .count();
    count.max(1)
}

/// Vowel-group syllable estimate with a silent trailing `e`.
fn syllables(word: &str) -> usize {
    let word: Vec<char> = word
        .chars()
        .filter(|c| c.is_alphabetic())
        .flat_map(char::to_lowercase)
        .collect();
    if word.is_empty() {
        return 0;
    }
    let is_vowel = |c: char| matches!(c, 'a' | 'e' | 'i' | 'o' | 'u' | 'y');
    let mut count = 0;
    let mut prev_vowel = false;
    for &c in &word {
        let v = is_vowel(c);
        if v && !prev_vowel {
            count += 1;
        }
        prev_vowel = v;
    }
    let n = word.len();
    if n > 2 && word[n - 1] == 'e' && !is_vowel(word[n - 2]) && word[n - 2] != 'l' {
        count -= 1;
    }
    count.max(1)
}

pub struct ExactMatch;

impl DeterministicMetric for ExactMatch {
    fn name(&self) -> &str {
        "exact_match"
    }

    fn greater_is_better(&self) -> bool {
        true
    }

    fn requires_ground_truth(&self) -> bool {
        true
    }

    fn compute(&self, output: &str, ground_truth: Option<&str>) -> std::result::Result<f64, MetricError> {
        let expected = require_ground_truth(ground_truth)?;
        Ok(if output.trim() == expected.trim() { 1.0 } else { 0.0 })
    }
}

pub struct TokenCount;

impl DeterministicMetric for TokenCount {
    fn name(&self) -> &str {
        "token_count"
    }

    fn greater_is_better(&self) -> bool {
        true
    }

    fn compute(&self, output: &str, _ground_truth: Option<&str>) -> std::result::Result<f64, MetricError> {
        Ok(output.split_whitespace().count() as f64)
    }
}

/// Flagged-vocabulary detector: each distinct flagged term adds 0.2, capped at 1.
pub struct Toxicity {
    terms: Vec<String>,
}

impl Default for Toxicity {
    fn default() -> Self {
        Self {
            terms: TOXIC_TERMS.iter().map(|t| t.to_string()).collect(),
        }
    }
}

impl Toxicity {
    pub fn with_terms(terms: Vec<String>) -> Self {
        Self {
            terms: terms.into_iter().map(|t| t.to_lowercase()).collect(),
        }
    }
}

impl DeterministicMetric for Toxicity {
    fn name(&self) -> &str {
        "toxicity"
    }

    fn greater_is_better(&self) -> bool {
        false
    }

    fn compute(&self, output: &str, _ground_truth: Option<&str>) -> std::result::Result<f64, MetricError> {
        let tokens = tokenize(output);
        let matched = self
            .terms
            .iter()
            .filter(|term| tokens.iter().any(|t| t == *term))
            .count();
        Ok((matched as f64 * 0.2).min(1.0))
    }
}

/// Perplexity of the output under an add-one smoothed unigram model of the ground truth.
pub struct Perplexity;

impl DeterministicMetric for Perplexity {
    fn name(&self) -> &str {
        "perplexity"
    }

    fn greater_is_better(&self) -> bool {
        false
    }

    fn requires_ground_truth(&self) -> bool {
        true
    }

    fn compute(&self, output: &str, ground_truth: Option<&str>) -> std::result::Result<f64, MetricError> {
        let reference = tokenize(require_ground_truth(ground_truth)?);
        let tokens = tokenize(output);
        if tokens.is_empty() {
            return Err(MetricError::InvalidInput("output has no words".into()));
        }

        let mut counts: HashMap<&str, usize> = HashMap::new();
        for t in &reference {
            *counts.entry(t.as_str()).or_default() += 1;
        }
        // One extra vocabulary slot for unseen tokens.
        let denom = (reference.len() + counts.len() + 1) as f64;
        let log_prob: f64 = tokens
            .iter()
            .map(|t| {
                let c = counts.get(t.as_str()).copied().unwrap_or(0);
                ((c + 1) as f64 / denom).ln()
            })
            .sum();
        Ok((-log_prob / tokens.len() as f64).exp())
    }
}

pub struct FleschKincaidGrade;

impl DeterministicMetric for FleschKincaidGrade {
    fn name(&self) -> &str {
        "flesch_kincaid_grade_level"
    }

    fn greater_is_better(&self) -> bool {
        false
    }

    fn compute(&self, output: &str, _ground_truth: Option<&str>) -> std::result::Result<f64, MetricError> {
        let words = require_words(output)?;
        let n_words = words.len() as f64;
        let n_sentences = sentence_count(output) as f64;
        let n_syllables: usize = words.iter().map(|w| syllables(w)).sum();
        Ok(0.39 * (n_words / n_sentences) + 11.8 * (n_syllables as f64 / n_words) - 15.59)
    }
}

pub struct AriGrade;

impl DeterministicMetric for AriGrade {
    fn name(&self) -> &str {
        "ari_grade_level"
    }

    fn greater_is_better(&self) -> bool {
        false
    }

    fn compute(&self, output: &str, _ground_truth: Option<&str>) -> std::result::Result<f64, MetricError> {
        let words = require_words(output)?;
        let n_words = words.len() as f64;
        let n_sentences = sentence_count(output) as f64;
        let n_chars = output.chars().filter(|c| c.is_alphanumeric()).count() as f64;
        Ok(4.71 * (n_chars / n_words) + 0.5 * (n_words / n_sentences) - 21.43)
    }
}

pub struct TokenF1;

impl DeterministicMetric for TokenF1 {
    fn name(&self) -> &str {
        "token_f1"
    }

    fn greater_is_better(&self) -> bool {
        true
    }

    fn requires_ground_truth(&self) -> bool {
        true
    }

    fn compute(&self, output: &str, ground_truth: Option<&str>) -> std::result::Result<f64, MetricError> {
        let predicted = tokenize(output);
        let reference = tokenize(require_ground_truth(ground_truth)?);
        if predicted.is_empty() && reference.is_empty() {
            return Ok(1.0);
        }
        if predicted.is_empty() || reference.is_empty() {
            return Ok(0.0);
        }
        let mut remaining: HashMap<&str, usize> = HashMap::new();
        for t in &reference {
            *remaining.entry(t.as_str()).or_default() += 1;
        }
        let mut overlap = 0usize;
        for t in &predicted {
            if let Some(n) = remaining.get_mut(t.as_str()) {
                if *n > 0 {
                    *n -= 1;
                    overlap += 1;
                }
            }
        }
        if overlap == 0 {
            return Ok(0.0);
        }
        let precision = overlap as f64 / predicted.len() as f64;
        let recall = overlap as f64 / reference.len() as f64;
        Ok(2.0 * precision * recall / (precision + recall))
    }
}

/// Look up a builtin metric by name.
pub fn builtin(name: &str) -> Option<MetricDefinition> {
    let def = match name {
        "exact_match" => MetricDefinition::deterministic(ExactMatch),
        "token_count" => MetricDefinition::deterministic(TokenCount),
        "toxicity" => MetricDefinition::deterministic(Toxicity::default()),
        "perplexity" => MetricDefinition::deterministic(Perplexity),
        "flesch_kincaid_grade_level" => MetricDefinition::deterministic(FleschKincaidGrade),
        "ari_grade_level" => MetricDefinition::deterministic(AriGrade),
        "token_f1" => MetricDefinition::deterministic(TokenF1),
        _ => return None,
    };
    Some(def)
}

/// Resolve an evaluator selection against whether the dataset has targets.
///
/// The `default` preset silently drops metrics that need ground truth when
/// there is none; an explicit list naming one is a configuration error.
pub fn select(selection: &EvaluatorSelection, has_targets: bool) -> Result<Vec<MetricDefinition>> {
    match selection {
        EvaluatorSelection::Preset(EvaluatorPreset::None) => Ok(Vec::new()),
        EvaluatorSelection::Preset(EvaluatorPreset::Default) => Ok(QUESTION_ANSWERING
            .iter()
            .filter_map(|name| builtin(name))
            .filter(|m| has_targets || !m.requires_ground_truth())
            .collect()),
        EvaluatorSelection::Custom(names) => names
            .iter()
            .map(|name| {
                let metric = builtin(name).ok_or_else(|| {
                    KensaError::Config(format!("unknown builtin metric '{name}'"))
                })?;
                if metric.requires_ground_truth() && !has_targets {
                    return Err(KensaError::Config(format!(
                        "metric '{name}' needs a targets column"
                    )));
                }
                Ok(metric)
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(defs: &[MetricDefinition]) -> Vec<&str> {
        defs.iter().map(|d| d.name()).collect()
    }

    #[test]
    fn tokenize_strips_punctuation() {
        assert_eq!(
            tokenize("Hello, World! It's (fine)."),
            vec!["hello", "world", "it's", "fine"]
        );
    }

    #[test]
    fn exact_match_trims() {
        assert_eq!(ExactMatch.compute("  Paris \n", Some("Paris")).unwrap(), 1.0);
        assert_eq!(ExactMatch.compute("paris", Some("Paris")).unwrap(), 0.0);
        assert!(matches!(
            ExactMatch.compute("x", None),
            Err(MetricError::MissingContext(_))
        ));
    }

    #[test]
    fn token_count_whitespace() {
        assert_eq!(TokenCount.compute("one two  three\nfour", None).unwrap(), 4.0);
        assert_eq!(TokenCount.compute("", None).unwrap(), 0.0);
    }

    #[test]
    fn toxicity_scores() {
        let tox = Toxicity::default();
        assert_eq!(tox.compute("A polite and helpful answer.", None).unwrap(), 0.0);
        let one = tox.compute("That is stupid.", None).unwrap();
        assert!((one - 0.2).abs() < 1e-9);
        // Repeated terms count once; substrings do not match.
        let same = tox.compute("stupid stupid STUPID", None).unwrap();
        assert!((same - 0.2).abs() < 1e-9);
        assert_eq!(tox.compute("a classic assessment", None).unwrap(), 0.0);
        let capped = tox
            .compute("hate kill murder attack hurt destroy idiot", None)
            .unwrap();
        assert_eq!(capped, 1.0);
    }

    #[test]
    fn toxicity_custom_terms() {
        let tox = Toxicity::with_terms(vec!["Synergy".into()]);
        assert!((tox.compute("pure synergy", None).unwrap() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn perplexity_lower_for_matching_text() {
        let gt = "The useEffect hook tells React that your component needs to do something after render";
        let close = Perplexity.compute("The useEffect hook runs after render", Some(gt)).unwrap();
        let far = Perplexity
            .compute("Bananas are yellow fruit grown in tropical climates", Some(gt))
            .unwrap();
        assert!(close < far, "close={close} far={far}");
        assert!(close >= 1.0);
    }

    #[test]
    fn perplexity_requires_words_and_ground_truth() {
        assert!(matches!(
            Perplexity.compute("   ", Some("gt")),
            Err(MetricError::InvalidInput(_))
        ));
        assert!(matches!(
            Perplexity.compute("text", None),
            Err(MetricError::MissingContext(_))
        ));
    }

    #[test]
    fn syllable_estimates() {
        assert_eq!(syllables("cat"), 1);
        assert_eq!(syllables("make"), 1);
        assert_eq!(syllables("table"), 2);
        assert_eq!(syllables("component"), 3);
        assert_eq!(syllables("the"), 1);
    }

    #[test]
    fn readability_grades() {
        let simple = "The cat sat. The dog ran.";
        let dense = "Asynchronous reconciliation necessitates comprehensive understanding of \
                     component lifecycle semantics and declarative rendering abstractions.";
        let fk_simple = FleschKincaidGrade.compute(simple, None).unwrap();
        let fk_dense = FleschKincaidGrade.compute(dense, None).unwrap();
        assert!(fk_dense > fk_simple);
        let ari_simple = AriGrade.compute(simple, None).unwrap();
        let ari_dense = AriGrade.compute(dense, None).unwrap();
        assert!(ari_dense > ari_simple);
        assert!(FleschKincaidGrade.compute("...", None).is_err());
    }

    #[test]
    fn token_f1_overlap() {
        assert_eq!(TokenF1.compute("the cat sat", Some("the cat sat")).unwrap(), 1.0);
        assert_eq!(TokenF1.compute("dog", Some("cat")).unwrap(), 0.0);
        // precision 2/4, recall 2/2
        let f1 = TokenF1.compute("the cat is here", Some("the cat")).unwrap();
        assert!((f1 - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(TokenF1.compute("", Some("")).unwrap(), 1.0);
    }

    #[test]
    fn every_listed_builtin_resolves() {
        for (name, _) in BUILTINS {
            let def = builtin(name).unwrap();
            assert_eq!(def.name(), name);
        }
        assert!(builtin("bleu").is_none());
    }

    #[test]
    fn default_selection_with_targets() {
        let defs = select(&EvaluatorSelection::default(), true).unwrap();
        assert_eq!(
            names(&defs),
            vec![
                "toxicity",
                "perplexity",
                "flesch_kincaid_grade_level",
                "ari_grade_level",
                "exact_match"
            ]
        );
    }

    #[test]
    fn default_selection_without_targets() {
        let defs = select(&EvaluatorSelection::default(), false).unwrap();
        assert_eq!(
            names(&defs),
            vec!["toxicity", "flesch_kincaid_grade_level", "ari_grade_level"]
        );
    }

    #[test]
    fn none_and_custom_selection() {
        let none = select(&EvaluatorSelection::Preset(EvaluatorPreset::None), true).unwrap();
        assert!(none.is_empty());

        let custom = select(
            &EvaluatorSelection::Custom(vec!["token_count".into(), "token_f1".into()]),
            true,
        )
        .unwrap();
        assert_eq!(names(&custom), vec!["token_count", "token_f1"]);

        let err = select(&EvaluatorSelection::Custom(vec!["bleu".into()]), true).unwrap_err();
        assert!(matches!(err, KensaError::Config(_)));

        let err = select(&EvaluatorSelection::Custom(vec!["exact_match".into()]), false)
            .unwrap_err();
        assert!(err.to_string().contains("targets"));
    }
}
