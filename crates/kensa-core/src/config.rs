use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{KensaError, Result};

/// Bounded exponential backoff for transient model failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub base_delay_ms: u64,
    /// Upper bound for a single delay.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self::new(1)
    }

    pub fn with_base_delay_ms(mut self, ms: u64) -> Self {
        self.base_delay_ms = ms;
        self
    }

    /// Delay before retry number `retry` (1-based). A server hint wins when it
    /// asks for a longer pause, but never beyond `max_delay_ms`.
    pub fn delay_for(&self, retry: u32, hint_secs: Option<u64>) -> Duration {
        let shift = retry.saturating_sub(1).min(20);
        let backoff = self.base_delay_ms.saturating_mul(1u64 << shift);
        let hinted = hint_secs.map(|s| s.saturating_mul(1000)).unwrap_or(0);
        Duration::from_millis(backoff.max(hinted).min(self.max_delay_ms))
    }
}

/// How cases are scheduled within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Concurrency {
    #[default]
    Sequential,
    Parallel { workers: usize },
}

impl Concurrency {
    pub fn workers(&self) -> usize {
        match self {
            Concurrency::Sequential => 1,
            Concurrency::Parallel { workers } => (*workers).max(1),
        }
    }
}

/// What to do with a judge score outside the rubric's bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreClampPolicy {
    /// Pull the score to the nearest bound.
    Clamp,
    /// Record the score as a parse failure.
    #[default]
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluatorPreset {
    /// The question-answering builtin set.
    Default,
    /// No builtin metrics; only extra metrics are evaluated.
    None,
}

/// Which builtin metrics a run evaluates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EvaluatorSelection {
    Preset(EvaluatorPreset),
    Custom(Vec<String>),
}

impl Default for EvaluatorSelection {
    fn default() -> Self {
        EvaluatorSelection::Preset(EvaluatorPreset::Default)
    }
}

/// Run-level settings, constructed once and passed explicitly to the runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalSettings {
    pub evaluators: EvaluatorSelection,
    pub retry: RetryPolicy,
    pub concurrency: Concurrency,
    pub score_clamp: ScoreClampPolicy,
    /// Record failed cases and keep going instead of aborting the run.
    pub continue_on_error: bool,
    /// Grace period for in-flight calls once the run is cancelled.
    pub drain_timeout_ms: u64,
}

impl Default for EvalSettings {
    fn default() -> Self {
        Self {
            evaluators: EvaluatorSelection::default(),
            retry: RetryPolicy::default(),
            concurrency: Concurrency::default(),
            score_clamp: ScoreClampPolicy::default(),
            continue_on_error: true,
            drain_timeout_ms: 0,
        }
    }
}

impl EvalSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_concurrency(mut self, concurrency: Concurrency) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_score_clamp(mut self, policy: ScoreClampPolicy) -> Self {
        self.score_clamp = policy;
        self
    }

    pub fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    pub fn with_evaluators(mut self, evaluators: EvaluatorSelection) -> Self {
        self.evaluators = evaluators;
        self
    }

    pub fn with_drain_timeout_ms(mut self, ms: u64) -> Self {
        self.drain_timeout_ms = ms;
        self
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let settings: Self = serde_yaml::from_str(yaml)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(KensaError::Config(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if let Concurrency::Parallel { workers: 0 } = self.concurrency {
            return Err(KensaError::Config(
                "concurrency.workers must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
