use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use kensa_core::config::{RetryPolicy, ScoreClampPolicy};
use kensa_core::error::MetricError;

use crate::aggregate::Aggregation;
use crate::cancel::RunGuard;
use crate::dataset::EvaluationCase;
use crate::judge::JudgeMetric;

/// What a metric sees for one case.
#[derive(Debug, Clone, Copy)]
pub struct MetricInput<'a> {
    pub case: &'a EvaluationCase,
    pub output: &'a str,
}

impl<'a> MetricInput<'a> {
    pub fn new(case: &'a EvaluationCase, output: &'a str) -> Self {
        Self { case, output }
    }
}

/// A pure function of the output and, optionally, the ground truth.
pub trait DeterministicMetric: Send + Sync {
    fn name(&self) -> &str;

    fn greater_is_better(&self) -> bool;

    fn requires_ground_truth(&self) -> bool {
        false
    }

    fn aggregations(&self) -> Vec<Aggregation> {
        Aggregation::DEFAULT.to_vec()
    }

    fn compute(&self, output: &str, ground_truth: Option<&str>) -> Result<f64, MetricError>;
}

/// Why a metric could not score a case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    JudgeParse,
    ScoreOutOfRange,
    JudgeModel,
    MissingContext,
    InvalidInput,
    Cancelled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::JudgeParse => "judge_parse",
            FailureKind::ScoreOutOfRange => "score_out_of_range",
            FailureKind::JudgeModel => "judge_model",
            FailureKind::MissingContext => "missing_context",
            FailureKind::InvalidInput => "invalid_input",
            FailureKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Score, or recorded failure, of one metric on one case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MetricOutcome {
    Scored {
        score: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        justification: Option<String>,
    },
    Failed {
        kind: FailureKind,
        reason: String,
    },
}

impl MetricOutcome {
    pub fn scored(score: f64) -> Self {
        MetricOutcome::Scored {
            score,
            justification: None,
        }
    }

    pub fn cancelled() -> Self {
        MetricOutcome::Failed {
            kind: FailureKind::Cancelled,
            reason: "run cancelled before scoring".into(),
        }
    }

    pub fn score(&self) -> Option<f64> {
        match self {
            MetricOutcome::Scored { score, .. } => Some(*score),
            MetricOutcome::Failed { .. } => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, MetricOutcome::Failed { .. })
    }

    /// Table cell rendering.
    pub fn cell(&self) -> String {
        match self {
            MetricOutcome::Scored { score, .. } => format!("{score}"),
            MetricOutcome::Failed { kind, reason } => format!("ERROR({kind}): {reason}"),
        }
    }
}

impl From<MetricError> for MetricOutcome {
    fn from(err: MetricError) -> Self {
        let kind = match &err {
            MetricError::JudgeParse(_) => FailureKind::JudgeParse,
            MetricError::ScoreOutOfRange { .. } => FailureKind::ScoreOutOfRange,
            MetricError::JudgeModel(_) => FailureKind::JudgeModel,
            MetricError::MissingContext(_) => FailureKind::MissingContext,
            MetricError::InvalidInput(_) => FailureKind::InvalidInput,
        };
        MetricOutcome::Failed {
            kind,
            reason: err.to_string(),
        }
    }
}

/// Settings shared by every metric evaluation in a run.
#[derive(Debug, Clone, Default)]
pub struct ScoringPolicy {
    pub retry: RetryPolicy,
    pub clamp: ScoreClampPolicy,
}

/// A named, scorable metric.
#[derive(Clone)]
pub enum MetricDefinition {
    Deterministic(Arc<dyn DeterministicMetric>),
    Judge(Arc<JudgeMetric>),
}

impl fmt::Debug for MetricDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricDefinition::Deterministic(m) => {
                f.debug_tuple("Deterministic").field(&m.name()).finish()
            }
            MetricDefinition::Judge(m) => f.debug_tuple("Judge").field(&m.name()).finish(),
        }
    }
}

impl MetricDefinition {
    pub fn deterministic(metric: impl DeterministicMetric + 'static) -> Self {
        MetricDefinition::Deterministic(Arc::new(metric))
    }

    pub fn judge(metric: JudgeMetric) -> Self {
        MetricDefinition::Judge(Arc::new(metric))
    }

    pub fn name(&self) -> &str {
        match self {
            MetricDefinition::Deterministic(m) => m.name(),
            MetricDefinition::Judge(m) => m.name(),
        }
    }

    pub fn greater_is_better(&self) -> bool {
        match self {
            MetricDefinition::Deterministic(m) => m.greater_is_better(),
            MetricDefinition::Judge(m) => m.greater_is_better(),
        }
    }

    pub fn aggregations(&self) -> Vec<Aggregation> {
        match self {
            MetricDefinition::Deterministic(m) => m.aggregations(),
            MetricDefinition::Judge(m) => m.aggregations().to_vec(),
        }
    }

    /// Context columns every case must provide.
    pub fn required_columns(&self) -> Vec<String> {
        match self {
            MetricDefinition::Deterministic(_) => Vec::new(),
            MetricDefinition::Judge(m) => m.grading_context_columns().to_vec(),
        }
    }

    pub fn requires_ground_truth(&self) -> bool {
        match self {
            MetricDefinition::Deterministic(m) => m.requires_ground_truth(),
            MetricDefinition::Judge(_) => false,
        }
    }

    /// Score one case. Failures are recorded, never raised.
    pub async fn evaluate(
        &self,
        input: &MetricInput<'_>,
        policy: &ScoringPolicy,
        guard: &RunGuard,
    ) -> MetricOutcome {
        match self {
            MetricDefinition::Deterministic(m) => {
                let computed = m
                    .compute(input.output, input.case.ground_truth.as_deref())
                    .and_then(|score| {
                        if score.is_finite() {
                            Ok(score)
                        } else {
                            Err(MetricError::InvalidInput(format!(
                                "{} produced a non-finite score",
                                m.name()
                            )))
                        }
                    });
                match computed {
                    Ok(score) => MetricOutcome::scored(score),
                    Err(e) => e.into(),
                }
            }
            MetricDefinition::Judge(m) => m.evaluate(input, policy, guard).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Length;

    impl DeterministicMetric for Length {
        fn name(&self) -> &str {
            "length"
        }

        fn greater_is_better(&self) -> bool {
            true
        }

        fn compute(&self, output: &str, _ground_truth: Option<&str>) -> Result<f64, MetricError> {
            Ok(output.len() as f64)
        }
    }

    struct Broken;

    impl DeterministicMetric for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn greater_is_better(&self) -> bool {
            false
        }

        fn compute(&self, _output: &str, _ground_truth: Option<&str>) -> Result<f64, MetricError> {
            Ok(f64::NAN)
        }
    }

    #[tokio::test]
    async fn deterministic_scores() {
        let case = EvaluationCase::new(0, "q");
        let def = MetricDefinition::deterministic(Length);
        let outcome = def
            .evaluate(
                &MetricInput::new(&case, "four"),
                &ScoringPolicy::default(),
                &RunGuard::unbounded(),
            )
            .await;
        assert_eq!(outcome.score(), Some(4.0));
        assert_eq!(def.name(), "length");
        assert_eq!(def.aggregations(), Aggregation::DEFAULT.to_vec());
        assert!(def.required_columns().is_empty());
    }

    #[tokio::test]
    async fn non_finite_becomes_failure() {
        let case = EvaluationCase::new(0, "q");
        let outcome = MetricDefinition::deterministic(Broken)
            .evaluate(
                &MetricInput::new(&case, "x"),
                &ScoringPolicy::default(),
                &RunGuard::unbounded(),
            )
            .await;
        assert!(matches!(
            outcome,
            MetricOutcome::Failed { kind: FailureKind::InvalidInput, .. }
        ));
    }

    #[test]
    fn error_to_outcome() {
        let outcome: MetricOutcome = MetricError::JudgeParse("no score".into()).into();
        assert_eq!(
            outcome.cell(),
            "ERROR(judge_parse): could not parse judge response: no score"
        );
        assert!(outcome.is_failed());
        assert_eq!(outcome.score(), None);
    }

    #[test]
    fn outcome_serde() {
        let json = serde_json::to_value(MetricOutcome::Scored {
            score: 4.0,
            justification: Some("clear".into()),
        })
        .unwrap();
        assert_eq!(json["status"], "scored");
        assert_eq!(json["score"], 4.0);

        let json = serde_json::to_value(MetricOutcome::cancelled()).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["kind"], "cancelled");
    }
}
