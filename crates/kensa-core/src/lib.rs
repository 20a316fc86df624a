pub mod config;
pub mod error;
pub mod message;
pub mod model;
pub mod retry;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{
        Concurrency, EvalSettings, EvaluatorPreset, EvaluatorSelection, RetryPolicy,
        ScoreClampPolicy,
    };
    pub use crate::error::{
        DatasetError, KensaError, MetricError, ModelError, Result, TemplateError,
    };
    pub use crate::message::{Message, UsageMetadata};
    pub use crate::model::{CallOptions, ChatModel, ChatResult};
    pub use crate::retry::{Attempted, with_retry, with_retry_until};
}
