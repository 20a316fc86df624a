pub mod adapter;
pub mod aggregate;
pub mod builtins;
pub mod cancel;
pub mod dataset;
pub mod judge;
pub mod metric;
pub mod presets;
pub mod registry;
pub mod result;
pub mod runner;
pub mod template;

pub mod prelude {
    pub use crate::adapter::{ModelAdapter, ModelOutput};
    pub use crate::aggregate::{AggregateValue, Aggregation};
    pub use crate::cancel::RunGuard;
    pub use crate::dataset::{
        ColumnMapping, Dataset, DatasetProvider, EvaluationCase, JsonFileDataset, RecordsDataset,
    };
    pub use crate::judge::{GradingExample, JudgeMetric, parse_judge_response};
    pub use crate::metric::{
        DeterministicMetric, FailureKind, MetricDefinition, MetricInput, MetricOutcome,
        ScoringPolicy,
    };
    pub use crate::registry::MetricRegistry;
    pub use crate::result::{CaseStatus, DetailRow, EvaluationResult, MetricSummary, RunState};
    pub use crate::runner::EvaluationRunner;
    pub use crate::template::InstructionTemplate;
}
