use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use kensa_core::error::KensaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Provider {
    #[serde(rename = "openai")]
    OpenAI,
    #[serde(rename = "azure-openai")]
    AzureOpenAI,
}

impl Provider {
    pub fn scheme(&self) -> &'static str {
        match self {
            Provider::OpenAI => "openai",
            Provider::AzureOpenAI => "azure-openai",
        }
    }

    pub fn default_models(&self) -> &[&str] {
        match self {
            Provider::OpenAI => &["gpt-4", "gpt-4o", "gpt-4o-mini", "gpt-3.5-turbo"],
            // Azure addresses deployments, not models.
            Provider::AzureOpenAI => &[],
        }
    }
}

/// A `"<provider>:/<model>"` reference such as `openai:/gpt-4`.
///
/// Parsed once at configuration time and resolved into a concrete
/// [`ChatModel`](kensa_core::model::ChatModel) by the factory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelRef {
    pub provider: Provider,
    /// Model id (OpenAI) or deployment name (Azure).
    pub model: String,
}

impl ModelRef {
    pub fn new(provider: Provider, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }

    pub fn openai(model: impl Into<String>) -> Self {
        Self::new(Provider::OpenAI, model)
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:/{}", self.provider.scheme(), self.model)
    }
}

impl FromStr for ModelRef {
    type Err = KensaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, model) = s.split_once(":/").ok_or_else(|| {
            KensaError::Config(format!(
                "invalid model reference '{s}', expected '<provider>:/<model>'"
            ))
        })?;
        let provider = match scheme {
            "openai" => Provider::OpenAI,
            "azure-openai" | "azure" => Provider::AzureOpenAI,
            other => {
                return Err(KensaError::Config(format!(
                    "unsupported model provider '{other}'"
                )));
            }
        };
        let model = model.trim_start_matches('/').trim();
        if model.is_empty() {
            return Err(KensaError::Config(format!(
                "model reference '{s}' has an empty model name"
            )));
        }
        Ok(Self::new(provider, model))
    }
}

impl Serialize for ModelRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ModelRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Connection settings for the hosted backends.
///
/// Built once at startup and handed to the factory; nothing in the library
/// reads the environment on its own.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderSettings {
    pub api_key: Option<String>,
    /// Overrides the OpenAI base URL; required for Azure.
    pub api_base: Option<String>,
    /// Azure `api-version` query parameter.
    pub api_version: Option<String>,
    /// `azure` routes `openai:/` references through the Azure endpoint.
    pub api_type: Option<String>,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl ProviderSettings {
    pub const DEFAULT_TIMEOUT_SECS: u64 = 60;
    pub const DEFAULT_AZURE_API_VERSION: &'static str = "2023-05-15";

    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: Some(api_key.into()),
            timeout_secs: Self::DEFAULT_TIMEOUT_SECS,
            ..Default::default()
        }
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = Some(base.into());
        self
    }

    pub fn with_api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = Some(version.into());
        self
    }

    pub fn with_api_type(mut self, api_type: impl Into<String>) -> Self {
        self.api_type = Some(api_type.into());
        self
    }

    /// The provider a reference resolves to once `api_type` is applied.
    pub fn effective_provider(&self, model_ref: &ModelRef) -> Provider {
        match self.api_type.as_deref() {
            Some(t) if t.eq_ignore_ascii_case("azure") || t.eq_ignore_ascii_case("azure-openai") => {
                Provider::AzureOpenAI
            }
            _ => model_ref.provider,
        }
    }

    /// Read the `OPENAI_API_*` variables and `OPENAI_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            api_key: non_empty("OPENAI_API_KEY"),
            api_base: non_empty("OPENAI_API_BASE"),
            api_version: non_empty("OPENAI_API_VERSION"),
            api_type: non_empty("OPENAI_API_TYPE"),
            timeout_secs: non_empty("OPENAI_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(Self::DEFAULT_TIMEOUT_SECS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn parse_openai_ref() {
        let r: ModelRef = "openai:/gpt-4".parse().unwrap();
        assert_eq!(r.provider, Provider::OpenAI);
        assert_eq!(r.model, "gpt-4");
        assert_eq!(r.to_string(), "openai:/gpt-4");
    }

    #[test]
    fn parse_azure_ref() {
        let r: ModelRef = "azure-openai:/my-deployment".parse().unwrap();
        assert_eq!(r.provider, Provider::AzureOpenAI);
        assert_eq!(r.model, "my-deployment");

        let short: ModelRef = "azure:/my-deployment".parse().unwrap();
        assert_eq!(short, r);
    }

    #[test]
    fn reject_malformed_refs() {
        assert!("gpt-4".parse::<ModelRef>().is_err());
        assert!("openai:/".parse::<ModelRef>().is_err());
        assert!("anthropic:/claude".parse::<ModelRef>().is_err());
    }

    #[test]
    fn model_ref_serde_as_string() {
        let r = ModelRef::openai("gpt-3.5-turbo");
        let json = serde_json::to_string(&r).unwrap();
        assert_eq!(json, "\"openai:/gpt-3.5-turbo\"");
        let back: ModelRef = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn provider_serialize() {
        assert_eq!(
            serde_json::to_string(&Provider::OpenAI).unwrap(),
            "\"openai\""
        );
        assert_eq!(
            serde_json::to_string(&Provider::AzureOpenAI).unwrap(),
            "\"azure-openai\""
        );
    }

    #[test]
    fn settings_from_lookup() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("OPENAI_API_KEY", "sk-test"),
            ("OPENAI_API_BASE", "https://example.openai.azure.com/"),
            ("OPENAI_API_VERSION", ""),
            ("OPENAI_API_TYPE", "azure"),
        ]);
        let settings = ProviderSettings::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(settings.api_key.as_deref(), Some("sk-test"));
        assert_eq!(
            settings.api_base.as_deref(),
            Some("https://example.openai.azure.com/")
        );
        assert!(settings.api_version.is_none());
        assert_eq!(settings.api_type.as_deref(), Some("azure"));
        assert_eq!(settings.timeout_secs, ProviderSettings::DEFAULT_TIMEOUT_SECS);
    }
}
