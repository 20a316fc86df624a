use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use kensa_core::config::RetryPolicy;
use kensa_core::error::{KensaError, Result};
use kensa_core::message::UsageMetadata;
use kensa_core::model::{CallOptions, ChatModel};
use kensa_core::retry::with_retry_until;
use tokio_util::sync::CancellationToken;

use crate::dataset::EvaluationCase;
use crate::template::InstructionTemplate;

/// Text produced by the model under test for one case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelOutput {
    pub case_id: usize,
    pub text: String,
    /// Retries performed before the successful call.
    pub retries: u32,
    pub latency_ms: u64,
    #[serde(default)]
    pub usage: Option<UsageMetadata>,
}

/// Wraps the model under test with its instructions, parameters and retry policy.
#[derive(Clone)]
pub struct ModelAdapter {
    model: Arc<dyn ChatModel>,
    template: InstructionTemplate,
    options: CallOptions,
    retry: RetryPolicy,
}

impl ModelAdapter {
    pub fn new(model: Arc<dyn ChatModel>, template: InstructionTemplate) -> Self {
        Self {
            model,
            template,
            options: CallOptions::default(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_options(mut self, options: CallOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn template(&self) -> &InstructionTemplate {
        &self.template
    }

    pub fn model_name(&self) -> &str {
        self.model.model_name()
    }

    /// Produce the model output for one case.
    pub async fn generate(&self, case: &EvaluationCase) -> Result<ModelOutput> {
        self.generate_until(case, &CancellationToken::new()).await
    }

    /// As [`generate`](Self::generate), but retries stop once `cancel` fires.
    /// A call interrupted that way yields `KensaError::Cancelled`.
    pub async fn generate_until(
        &self,
        case: &EvaluationCase,
        cancel: &CancellationToken,
    ) -> Result<ModelOutput> {
        let messages = self.template.render(case)?;
        let start = Instant::now();
        let attempted = with_retry_until(&self.retry, cancel, || {
            self.model.generate(&messages, &self.options)
        })
        .await;
        let latency_ms = start.elapsed().as_millis() as u64;

        if attempted.interrupted {
            return Err(KensaError::Cancelled);
        }
        let retries = attempted.retries;
        let result = attempted.result.map_err(|source| KensaError::Generation {
            case_id: case.id,
            retries,
            source,
        })?;
        tracing::debug!(
            case_id = case.id,
            retries = attempted.retries,
            latency_ms,
            "generated output"
        );
        Ok(ModelOutput {
            case_id: case.id,
            text: result.text,
            retries: attempted.retries,
            latency_ms,
            usage: result.usage,
        })
    }
}
