use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use kensa_core::error::Result;

use crate::aggregate::{self, AggregateValue, Aggregation};
use crate::metric::{MetricDefinition, MetricOutcome};

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Generating,
    Scoring,
    Aggregating,
    Complete,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Complete | RunState::Failed | RunState::Cancelled)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Pending => "pending",
            RunState::Generating => "generating",
            RunState::Scoring => "scoring",
            RunState::Aggregating => "aggregating",
            RunState::Complete => "complete",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Ok,
    GenerationFailed,
    Cancelled,
}

impl fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CaseStatus::Ok => "ok",
            CaseStatus::GenerationFailed => "generation_failed",
            CaseStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Per-case record: output plus every metric outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailRow {
    pub case_id: usize,
    pub input: String,
    #[serde(default)]
    pub ground_truth: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
    pub retries: u32,
    pub latency_ms: u64,
    pub status: CaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metrics: BTreeMap<String, MetricOutcome>,
}

/// Aggregates of one metric across the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub greater_is_better: bool,
    /// Cases the metric scored.
    pub scored: usize,
    /// Cases where the metric recorded a failure.
    pub failed: usize,
    pub aggregates: BTreeMap<Aggregation, AggregateValue>,
}

impl MetricSummary {
    /// Summarize one metric over the rows that carry an outcome for it.
    pub fn from_rows(metric: &MetricDefinition, rows: &[DetailRow]) -> Self {
        let outcomes: Vec<&MetricOutcome> = rows
            .iter()
            .filter_map(|r| r.metrics.get(metric.name()))
            .collect();
        let scores: Vec<f64> = outcomes.iter().filter_map(|o| o.score()).collect();
        Self {
            greater_is_better: metric.greater_is_better(),
            scored: scores.len(),
            failed: outcomes.iter().filter(|o| o.is_failed()).count(),
            aggregates: aggregate::compute(&metric.aggregations(), &scores),
        }
    }
}

/// Everything a run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub run_id: Uuid,
    pub dataset_name: String,
    pub model: String,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub summary: BTreeMap<String, MetricSummary>,
    pub rows: Vec<DetailRow>,
}

impl EvaluationResult {
    /// Flat `metric/aggregation -> value` map; undefined aggregates are omitted.
    pub fn metrics(&self) -> BTreeMap<String, f64> {
        self.summary
            .iter()
            .flat_map(|(name, s)| {
                s.aggregates
                    .iter()
                    .filter_map(move |(agg, v)| v.value().map(|v| (format!("{name}/{agg}"), v)))
            })
            .collect()
    }

    pub fn aggregate(&self, metric: &str, aggregation: Aggregation) -> Option<AggregateValue> {
        self.summary
            .get(metric)
            .and_then(|s| s.aggregates.get(&aggregation))
            .copied()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Tab-delimited per-case table with a header row.
    pub fn detail_tsv(&self) -> String {
        let metric_names: Vec<&String> = self.summary.keys().collect();
        let justified: BTreeSet<&str> = self
            .rows
            .iter()
            .flat_map(|r| r.metrics.iter())
            .filter_map(|(name, o)| match o {
                MetricOutcome::Scored {
                    justification: Some(_),
                    ..
                } => Some(name.as_str()),
                _ => None,
            })
            .collect();

        let mut header: Vec<String> = [
            "case_id",
            "inputs",
            "ground_truth",
            "outputs",
            "status",
            "retries",
            "latency_ms",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        for name in &metric_names {
            header.push(format!("{name}/score"));
            if justified.contains(name.as_str()) {
                header.push(format!("{name}/justification"));
            }
        }

        let mut out = header.join("\t");
        out.push('\n');
        for row in &self.rows {
            let mut cells = vec![
                row.case_id.to_string(),
                tsv_cell(&row.input),
                tsv_cell(row.ground_truth.as_deref().unwrap_or("")),
                tsv_cell(row.output.as_deref().or(row.error.as_deref()).unwrap_or("")),
                row.status.to_string(),
                row.retries.to_string(),
                row.latency_ms.to_string(),
            ];
            for name in &metric_names {
                let outcome = row.metrics.get(name.as_str());
                cells.push(tsv_cell(&outcome.map(MetricOutcome::cell).unwrap_or_default()));
                if justified.contains(name.as_str()) {
                    let just = match outcome {
                        Some(MetricOutcome::Scored {
                            justification: Some(j),
                            ..
                        }) => j.as_str(),
                        _ => "",
                    };
                    cells.push(tsv_cell(just));
                }
            }
            out.push_str(&cells.join("\t"));
            out.push('\n');
        }
        out
    }

    /// Aligned text table of every metric's aggregates.
    pub fn summary_table(&self) -> String {
        let aggs: BTreeSet<Aggregation> = self
            .summary
            .values()
            .flat_map(|s| s.aggregates.keys().copied())
            .collect();

        let mut header = vec!["metric".to_string()];
        header.extend(aggs.iter().map(|a| a.to_string()));
        header.push("scored".into());
        header.push("failed".into());

        let mut table = vec![header];
        for (name, s) in &self.summary {
            let mut line = vec![name.clone()];
            for agg in &aggs {
                line.push(
                    s.aggregates
                        .get(agg)
                        .map(|v| v.to_string())
                        .unwrap_or_else(|| "-".into()),
                );
            }
            line.push(s.scored.to_string());
            line.push(s.failed.to_string());
            table.push(line);
        }

        let widths: Vec<usize> = (0..table[0].len())
            .map(|col| table.iter().map(|r| r[col].chars().count()).max().unwrap_or(0))
            .collect();

        let mut out = format!(
            "run {} | dataset {} | model {} | {}\n",
            self.run_id, self.dataset_name, self.model, self.state
        );
        for (i, line) in table.iter().enumerate() {
            let padded: Vec<String> = line
                .iter()
                .zip(&widths)
                .map(|(cell, &w)| format!("{cell:<w$}"))
                .collect();
            out.push_str(padded.join("  ").trim_end());
            out.push('\n');
            if i == 0 {
                let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
                out.push_str(&rule.join("  "));
                out.push('\n');
            }
        }
        out
    }
}

fn tsv_cell(text: &str) -> String {
    text.replace(['\t', '\n', '\r'], " ")
}
