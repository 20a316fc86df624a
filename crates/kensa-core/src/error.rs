use thiserror::Error;

/// Top-level error type for the kensa harness.
#[derive(Debug, Error)]
pub enum KensaError {
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    #[error("Metric error: {0}")]
    Metric(#[from] MetricError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Generation failed for case {case_id} after {retries} retries: {source}")]
    Generation {
        case_id: usize,
        retries: u32,
        #[source]
        source: ModelError,
    },

    #[error("Run cancelled")]
    Cancelled,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Failures reported by a hosted model backend.
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    #[error("API request failed: {0}")]
    ApiRequest(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Server error (HTTP {status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Rate limited: retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },
}

impl ModelError {
    /// Whether a retry has a reasonable chance of succeeding.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ModelError::ApiRequest(_)
                | ModelError::Timeout(_)
                | ModelError::ServerError { .. }
                | ModelError::RateLimited { .. }
        )
    }

    /// Server-provided backoff hint, if any.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            ModelError::RateLimited { retry_after_secs } => *retry_after_secs,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum DatasetError {
    #[error("dataset contains no rows")]
    Empty,

    #[error("missing column '{column}'{}", .row.map(|r| format!(" in row {r}")).unwrap_or_default())]
    MissingColumn { column: String, row: Option<usize> },

    #[error("failed to parse dataset: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("unclosed '{{' in template")]
    Unclosed,

    #[error("template has no input placeholder ({{question}} or {{input}})")]
    NoInputPlaceholder,

    #[error("missing variable: {0}")]
    MissingVariable(String),
}

#[derive(Debug, Clone, Error)]
pub enum MetricError {
    #[error("could not parse judge response: {0}")]
    JudgeParse(String),

    #[error("score {score} outside bounds [{min}, {max}]")]
    ScoreOutOfRange { score: f64, min: u32, max: u32 },

    #[error("judge model failed: {0}")]
    JudgeModel(ModelError),

    #[error("missing grading context '{0}'")]
    MissingContext(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, KensaError>;
