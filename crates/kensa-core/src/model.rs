use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::message::{Message, UsageMetadata};

/// Options controlling a ChatModel invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallOptions {
    /// Maximum tokens to generate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Sampling temperature (0.0 - 2.0).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    /// Nucleus sampling cutoff.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,

    /// Stop sequences.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

impl CallOptions {
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Result of a chat model generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResult {
    /// The generated text.
    pub text: String,

    /// Token usage metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageMetadata>,
}

/// Trait for chat language models.
///
/// This is the generation capability shared by the model adapter and the
/// judge metrics. Implementations handle API communication, request
/// formatting, and response parsing for a specific provider, and classify
/// failures into [`ModelError`] so callers can decide what to retry.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Generate a response for the given messages.
    async fn generate(
        &self,
        messages: &[Message],
        options: &CallOptions,
    ) -> std::result::Result<ChatResult, ModelError>;

    /// Return the model name/identifier.
    fn model_name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockChatModel {
        response: String,
    }

    #[async_trait]
    impl ChatModel for MockChatModel {
        async fn generate(
            &self,
            _messages: &[Message],
            _options: &CallOptions,
        ) -> std::result::Result<ChatResult, ModelError> {
            Ok(ChatResult {
                text: self.response.clone(),
                usage: Some(UsageMetadata {
                    input_tokens: 10,
                    output_tokens: 5,
                    total_tokens: 15,
                }),
            })
        }

        fn model_name(&self) -> &str {
            "mock-model"
        }
    }

    #[tokio::test]
    async fn mock_chat_model_generate() {
        let model = MockChatModel {
            response: "Hello!".into(),
        };
        let messages = vec![Message::user("Hi")];
        let result = model
            .generate(&messages, &CallOptions::default())
            .await
            .unwrap();
        assert_eq!(result.text, "Hello!");
        assert!(result.usage.is_some());
        assert_eq!(model.model_name(), "mock-model");
    }

    #[test]
    fn call_options_default() {
        let opts = CallOptions::default();
        assert!(opts.max_tokens.is_none());
        assert!(opts.temperature.is_none());
        assert!(opts.stop.is_empty());
    }

    #[test]
    fn call_options_yaml() {
        let opts: CallOptions = serde_yaml::from_str("temperature: 0.0\nmax_tokens: 256\n").unwrap();
        assert_eq!(opts, CallOptions::default().with_temperature(0.0).with_max_tokens(256));
    }
}
