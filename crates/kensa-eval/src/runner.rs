use std::collections::BTreeMap;
use std::time::Instant;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use kensa_core::config::EvalSettings;
use kensa_core::error::{KensaError, Result, TemplateError};

use crate::adapter::{ModelAdapter, ModelOutput};
use crate::builtins;
use crate::cancel::RunGuard;
use crate::dataset::{Dataset, DatasetProvider, EvaluationCase};
use crate::metric::{MetricDefinition, MetricInput, ScoringPolicy};
use crate::registry::MetricRegistry;
use crate::result::{CaseStatus, DetailRow, EvaluationResult, MetricSummary, RunState};

/// What the generation phase produced for one case.
#[derive(Debug)]
enum Generated {
    Output(ModelOutput),
    Failed {
        error: String,
        retries: u32,
        latency_ms: u64,
    },
    Cancelled,
}

/// Drives a model over a dataset and scores every output.
pub struct EvaluationRunner {
    adapter: ModelAdapter,
    settings: EvalSettings,
    extra_metrics: Vec<MetricDefinition>,
    cancel: CancellationToken,
}

impl EvaluationRunner {
    pub fn new(adapter: ModelAdapter, settings: EvalSettings) -> Self {
        Self {
            adapter,
            settings,
            extra_metrics: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Evaluate `metric` in addition to the selected builtins.
    pub fn with_metric(mut self, metric: MetricDefinition) -> Self {
        self.extra_metrics.push(metric);
        self
    }

    pub fn with_metrics(mut self, metrics: impl IntoIterator<Item = MetricDefinition>) -> Self {
        self.extra_metrics.extend(metrics);
        self
    }

    /// Use an externally owned token, e.g. one cancelled on Ctrl-C.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn settings(&self) -> &EvalSettings {
        &self.settings
    }

    /// The registry a run over `dataset` would use: selected builtins, then extra metrics.
    pub fn build_registry(&self, dataset: &Dataset) -> Result<MetricRegistry> {
        let mut registry = MetricRegistry::new(ScoringPolicy {
            retry: self.settings.retry,
            clamp: self.settings.score_clamp,
        });
        registry.extend(builtins::select(&self.settings.evaluators, dataset.has_targets)?)?;
        registry.extend(self.extra_metrics.iter().cloned())?;
        Ok(registry)
    }

    /// Every check that can fail before the first model call.
    pub fn prepare(&self, dataset: &Dataset) -> Result<MetricRegistry> {
        self.settings.validate()?;
        if let Some(var) = self
            .adapter
            .template()
            .unresolved(|c| dataset.has_column(c))
            .first()
        {
            return Err(TemplateError::MissingVariable(var.to_string()).into());
        }
        let registry = self.build_registry(dataset)?;
        registry.validate_columns(dataset)?;
        Ok(registry)
    }

    /// Load the dataset from `provider` and run.
    pub async fn run(&self, provider: &dyn DatasetProvider) -> Result<EvaluationResult> {
        let dataset = provider.load().inspect_err(|e| {
            tracing::error!(state = %RunState::Failed, "dataset load failed: {e}");
        })?;
        self.run_dataset(&dataset).await
    }

    pub async fn run_dataset(&self, dataset: &Dataset) -> Result<EvaluationResult> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let clock = Instant::now();
        let mut state = RunState::Pending;

        let registry = self.prepare(dataset).inspect_err(|e| {
            tracing::error!(%run_id, state = %RunState::Failed, "run validation failed: {e}");
        })?;

        let guard = RunGuard::new(self.cancel.clone(), self.settings.drain_timeout());
        let workers = self.settings.concurrency.workers();
        tracing::info!(
            %run_id,
            dataset = %dataset.name,
            cases = dataset.len(),
            metrics = ?registry.names(),
            model = self.adapter.model_name(),
            workers,
            "starting evaluation run"
        );

        transition(run_id, &mut state, RunState::Generating);
        let generated = self.generate_all(dataset, &guard, workers).await.inspect_err(|e| {
            tracing::error!(%run_id, state = %RunState::Failed, "run aborted: {e}");
        })?;

        transition(run_id, &mut state, RunState::Scoring);
        let rows = self.score_all(dataset, generated, &registry, &guard, workers).await;

        transition(run_id, &mut state, RunState::Aggregating);
        let summary: BTreeMap<String, MetricSummary> = registry
            .metrics()
            .iter()
            .map(|m| (m.name().to_string(), MetricSummary::from_rows(m, &rows)))
            .collect();

        let terminal = if guard.is_cancelled() {
            RunState::Cancelled
        } else {
            RunState::Complete
        };
        transition(run_id, &mut state, terminal);
        tracing::info!(
            %run_id,
            state = %state,
            elapsed_ms = clock.elapsed().as_millis() as u64,
            failed_cases = rows.iter().filter(|r| r.status != CaseStatus::Ok).count(),
            "evaluation run finished"
        );

        Ok(EvaluationResult {
            run_id,
            dataset_name: dataset.name.clone(),
            model: self.adapter.model_name().to_string(),
            state,
            started_at,
            finished_at: Some(Utc::now()),
            summary,
            rows,
        })
    }

    async fn generate_all(
        &self,
        dataset: &Dataset,
        guard: &RunGuard,
        workers: usize,
    ) -> Result<Vec<(usize, Generated)>> {
        let mut pending = stream::iter(
            dataset
                .cases
                .iter()
                .map(|case| async move { (case.id, self.generate_case(case, guard).await) }),
        )
        .buffer_unordered(workers);

        let mut generated = Vec::with_capacity(dataset.len());
        while let Some((case_id, outcome)) = pending.next().await {
            generated.push((case_id, outcome?));
        }
        generated.sort_by_key(|(id, _)| *id);
        Ok(generated)
    }

    async fn generate_case(&self, case: &EvaluationCase, guard: &RunGuard) -> Result<Generated> {
        let start = Instant::now();
        let call = self.adapter.generate_until(case, guard.token());
        match guard.run(call).await {
            None | Some(Err(KensaError::Cancelled)) => Ok(Generated::Cancelled),
            Some(Ok(output)) => Ok(Generated::Output(output)),
            Some(Err(e @ KensaError::Generation { retries, .. })) if self.settings.continue_on_error => {
                tracing::warn!(case_id = case.id, retries, "recording failed case: {e}");
                Ok(Generated::Failed {
                    error: e.to_string(),
                    retries,
                    latency_ms: start.elapsed().as_millis() as u64,
                })
            }
            Some(Err(e)) => Err(e),
        }
    }

    async fn score_all(
        &self,
        dataset: &Dataset,
        generated: Vec<(usize, Generated)>,
        registry: &MetricRegistry,
        guard: &RunGuard,
        workers: usize,
    ) -> Vec<DetailRow> {
        let mut rows: Vec<DetailRow> = stream::iter(generated.into_iter().filter_map(
            |(id, generated)| dataset.cases.get(id).map(|case| (case, generated)),
        ))
        .map(|(case, generated)| score_case(case, generated, registry, guard))
        .buffer_unordered(workers)
        .collect()
        .await;
        rows.sort_by_key(|r| r.case_id);
        rows
    }
}

async fn score_case(
    case: &EvaluationCase,
    generated: Generated,
    registry: &MetricRegistry,
    guard: &RunGuard,
) -> DetailRow {
    let mut row = DetailRow {
        case_id: case.id,
        input: case.input.clone(),
        ground_truth: case.ground_truth.clone(),
        output: None,
        retries: 0,
        latency_ms: 0,
        status: CaseStatus::Ok,
        error: None,
        metrics: BTreeMap::new(),
    };
    match generated {
        Generated::Output(output) => {
            row.metrics = registry
                .evaluate_all(&MetricInput::new(case, &output.text), guard)
                .await;
            tracing::debug!(case_id = case.id, "scored case");
            row.retries = output.retries;
            row.latency_ms = output.latency_ms;
            row.output = Some(output.text);
        }
        Generated::Failed {
            error,
            retries,
            latency_ms,
        } => {
            row.status = CaseStatus::GenerationFailed;
            row.retries = retries;
            row.latency_ms = latency_ms;
            row.error = Some(error);
        }
        Generated::Cancelled => {
            row.status = CaseStatus::Cancelled;
        }
    }
    row
}

fn transition(run_id: Uuid, state: &mut RunState, next: RunState) {
    tracing::debug!(%run_id, from = %state, to = %next, "run state");
    *state = next;
}
