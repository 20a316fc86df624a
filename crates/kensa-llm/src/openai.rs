//! OpenAI (and Azure OpenAI) Chat Completions API integration.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use kensa_core::error::ModelError;
use kensa_core::message::{Message, UsageMetadata};
use kensa_core::model::{CallOptions, ChatModel, ChatResult};

pub const OPENAI_API_BASE: &str = "https://api.openai.com/v1";

// ---------------------------------------------------------------------------
// Chat Completions API request/response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct OpenAIRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct OpenAIMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct OpenAIResponse {
    pub choices: Vec<OpenAIChoice>,
    pub usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
pub struct OpenAIChoice {
    pub message: OpenAIResponseMessage,
}

#[derive(Debug, Deserialize)]
pub struct OpenAIResponseMessage {
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OpenAIUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Deserialize)]
pub struct OpenAIError {
    pub error: OpenAIErrorDetail,
}

#[derive(Debug, Deserialize)]
pub struct OpenAIErrorDetail {
    pub message: String,
}

/// Where requests are sent and how they authenticate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `Authorization: Bearer` against `{base}/chat/completions`.
    OpenAI { base_url: String },
    /// `api-key` header against
    /// `{base}/openai/deployments/{deployment}/chat/completions?api-version=..`.
    Azure { base_url: String, api_version: String },
}

/// Map a non-success HTTP status and body to a [`ModelError`].
pub fn classify_http_error(status: u16, body: &str, retry_after_secs: Option<u64>) -> ModelError {
    let message = serde_json::from_str::<OpenAIError>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.to_string());
    match status {
        401 | 403 => ModelError::Auth(message),
        408 => ModelError::Timeout(message),
        429 => ModelError::RateLimited { retry_after_secs },
        400..=499 => ModelError::InvalidRequest(format!("HTTP {status}: {message}")),
        _ => ModelError::ServerError { status, message },
    }
}

// ---------------------------------------------------------------------------
// OpenAIChatModel
// ---------------------------------------------------------------------------

pub struct OpenAIChatModel {
    api_key: String,
    model_id: String,
    endpoint: Endpoint,
    timeout: Option<Duration>,
    client: reqwest::Client,
}

impl OpenAIChatModel {
    pub fn new(api_key: String, model_id: String) -> Self {
        Self {
            api_key,
            model_id,
            endpoint: Endpoint::OpenAI {
                base_url: OPENAI_API_BASE.into(),
            },
            timeout: None,
            client: reqwest::Client::new(),
        }
    }

    /// An Azure OpenAI deployment; `model_id` is the deployment name.
    pub fn azure(
        api_key: String,
        deployment: String,
        base_url: String,
        api_version: String,
    ) -> Self {
        Self {
            endpoint: Endpoint::Azure {
                base_url,
                api_version,
            },
            ..Self::new(api_key, deployment)
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.endpoint = match self.endpoint {
            Endpoint::OpenAI { .. } => Endpoint::OpenAI {
                base_url: base_url.into(),
            },
            Endpoint::Azure { api_version, .. } => Endpoint::Azure {
                base_url: base_url.into(),
                api_version,
            },
        };
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn url(&self) -> String {
        match &self.endpoint {
            Endpoint::OpenAI { base_url } => {
                format!("{}/chat/completions", base_url.trim_end_matches('/'))
            }
            Endpoint::Azure {
                base_url,
                api_version,
            } => format!(
                "{}/openai/deployments/{}/chat/completions?api-version={}",
                base_url.trim_end_matches('/'),
                self.model_id,
                api_version
            ),
        }
    }

    pub fn build_request(&self, messages: &[Message], options: &CallOptions) -> OpenAIRequest {
        let api_messages = messages
            .iter()
            .map(|msg| OpenAIMessage {
                role: msg.role().into(),
                content: msg.content().into(),
            })
            .collect();

        OpenAIRequest {
            // Azure takes the deployment from the URL.
            model: match self.endpoint {
                Endpoint::OpenAI { .. } => Some(self.model_id.clone()),
                Endpoint::Azure { .. } => None,
            },
            messages: api_messages,
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            top_p: options.top_p,
            stop: if options.stop.is_empty() {
                None
            } else {
                Some(options.stop.clone())
            },
        }
    }
}

#[async_trait]
impl ChatModel for OpenAIChatModel {
    async fn generate(
        &self,
        messages: &[Message],
        options: &CallOptions,
    ) -> Result<ChatResult, ModelError> {
        let request_body = self.build_request(messages, options);

        let mut request = self.client.post(self.url()).json(&request_body);
        request = match self.endpoint {
            Endpoint::OpenAI { .. } => {
                request.header("Authorization", format!("Bearer {}", self.api_key))
            }
            Endpoint::Azure { .. } => request.header("api-key", &self.api_key),
        };
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ModelError::Timeout(e.to_string())
            } else {
                ModelError::ApiRequest(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "failed to read response body".into());
            tracing::debug!(status = status.as_u16(), model = %self.model_id, "chat completion failed");
            return Err(classify_http_error(status.as_u16(), &body, retry_after));
        }

        let api_response: OpenAIResponse = response
            .json()
            .await
            .map_err(|e| ModelError::InvalidResponse(e.to_string()))?;

        let text = api_response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| ModelError::InvalidResponse("response contained no content".into()))?;

        let usage = api_response.usage.map(|u| UsageMetadata {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        });

        Ok(ChatResult { text, usage })
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_model() -> OpenAIChatModel {
        OpenAIChatModel::new("test-key".into(), "gpt-3.5-turbo".into())
    }

    #[test]
    fn build_request_basic() {
        let model = make_model();
        let messages = vec![
            Message::system("Answer the following question in two sentences"),
            Message::user("How does useEffect() work?"),
        ];
        let req = model.build_request(&messages, &CallOptions::default());
        assert_eq!(req.model.as_deref(), Some("gpt-3.5-turbo"));
        assert_eq!(req.messages.len(), 2);
        assert_eq!(req.messages[0].role, "system");
        assert_eq!(req.messages[1].role, "user");
        assert!(req.stop.is_none());
    }

    #[test]
    fn build_request_parameters() {
        let model = make_model();
        let options = CallOptions {
            temperature: Some(0.0),
            max_tokens: Some(128),
            stop: vec!["\n\n".into()],
            ..Default::default()
        };
        let req = model.build_request(&[Message::user("hi")], &options);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["temperature"], 0.0);
        assert_eq!(json["max_tokens"], 128);
        assert_eq!(json["stop"][0], "\n\n");
        assert!(json.get("top_p").is_none());
    }

    #[test]
    fn openai_url() {
        let model = make_model();
        assert_eq!(model.url(), "https://api.openai.com/v1/chat/completions");
        let model = make_model().with_base_url("http://localhost:8080/v1/");
        assert_eq!(model.url(), "http://localhost:8080/v1/chat/completions");
    }

    #[test]
    fn azure_url_and_body() {
        let model = OpenAIChatModel::azure(
            "key".into(),
            "qa-deploy".into(),
            "https://acme.openai.azure.com/".into(),
            "2023-05-15".into(),
        );
        assert_eq!(
            model.url(),
            "https://acme.openai.azure.com/openai/deployments/qa-deploy/chat/completions?api-version=2023-05-15"
        );
        let req = model.build_request(&[Message::user("hi")], &CallOptions::default());
        assert!(req.model.is_none());
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("\"model\""));
    }

    #[test]
    fn parse_response_text_and_usage() {
        let json = r#"{
            "choices": [{"message": {"content": "Hello!"}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        }"#;
        let resp: OpenAIResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.choices[0].message.content.as_deref(), Some("Hello!"));
        let usage = resp.usage.unwrap();
        assert_eq!(usage.total_tokens, 15);
    }

    #[test]
    fn classify_errors() {
        let body = r#"{"error": {"message": "Incorrect API key provided"}}"#;
        assert!(matches!(
            classify_http_error(401, body, None),
            ModelError::Auth(m) if m == "Incorrect API key provided"
        ));
        assert!(matches!(
            classify_http_error(429, "slow down", Some(7)),
            ModelError::RateLimited {
                retry_after_secs: Some(7)
            }
        ));
        assert!(matches!(
            classify_http_error(400, body, None),
            ModelError::InvalidRequest(_)
        ));
        assert!(matches!(
            classify_http_error(503, "unavailable", None),
            ModelError::ServerError { status: 503, .. }
        ));
        assert!(matches!(
            classify_http_error(408, "", None),
            ModelError::Timeout(_)
        ));
    }

    #[test]
    fn classified_errors_drive_retry_decisions() {
        assert!(classify_http_error(429, "", None).is_transient());
        assert!(classify_http_error(502, "", None).is_transient());
        assert!(!classify_http_error(401, "", None).is_transient());
        assert!(!classify_http_error(422, "", None).is_transient());
    }
}
