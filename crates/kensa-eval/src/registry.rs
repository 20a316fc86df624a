use std::collections::BTreeMap;

use kensa_core::error::{DatasetError, KensaError, Result};

use crate::cancel::RunGuard;
use crate::dataset::Dataset;
use crate::metric::{MetricDefinition, MetricInput, MetricOutcome, ScoringPolicy};

/// The metrics evaluated in a run, in registration order.
#[derive(Debug, Clone, Default)]
pub struct MetricRegistry {
    metrics: Vec<MetricDefinition>,
    policy: ScoringPolicy,
}

impl MetricRegistry {
    pub fn new(policy: ScoringPolicy) -> Self {
        Self {
            metrics: Vec::new(),
            policy,
        }
    }

    /// Add a metric; names must be unique.
    pub fn register(&mut self, metric: MetricDefinition) -> Result<()> {
        if self.get(metric.name()).is_some() {
            return Err(KensaError::Config(format!(
                "metric '{}' is already registered",
                metric.name()
            )));
        }
        tracing::debug!(metric = metric.name(), "registered metric");
        self.metrics.push(metric);
        Ok(())
    }

    pub fn extend(&mut self, metrics: impl IntoIterator<Item = MetricDefinition>) -> Result<()> {
        for metric in metrics {
            self.register(metric)?;
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&MetricDefinition> {
        self.metrics.iter().find(|m| m.name() == name)
    }

    pub fn metrics(&self) -> &[MetricDefinition] {
        &self.metrics
    }

    pub fn names(&self) -> Vec<&str> {
        self.metrics.iter().map(|m| m.name()).collect()
    }

    pub fn policy(&self) -> &ScoringPolicy {
        &self.policy
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Check every grading-context column and ground-truth need against the dataset.
    pub fn validate_columns(&self, dataset: &Dataset) -> std::result::Result<(), DatasetError> {
        for metric in &self.metrics {
            for column in metric.required_columns() {
                if !dataset.has_column(&column) {
                    return Err(DatasetError::MissingColumn { column, row: None });
                }
            }
            if metric.requires_ground_truth() && !dataset.has_targets {
                return Err(DatasetError::MissingColumn {
                    column: crate::dataset::TARGETS_KEY.into(),
                    row: None,
                });
            }
        }
        Ok(())
    }

    /// Score one case with every metric. A failing metric never affects the others.
    pub async fn evaluate_all(
        &self,
        input: &MetricInput<'_>,
        guard: &RunGuard,
    ) -> BTreeMap<String, MetricOutcome> {
        let mut outcomes = BTreeMap::new();
        for metric in &self.metrics {
            let outcome = metric.evaluate(input, &self.policy, guard).await;
            outcomes.insert(metric.name().to_string(), outcome);
        }
        outcomes
    }
}
