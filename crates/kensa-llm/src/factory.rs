use std::sync::Arc;
use std::time::Duration;

use kensa_core::error::{KensaError, Result};
use kensa_core::model::ChatModel;

use crate::openai::OpenAIChatModel;
use crate::provider::{ModelRef, Provider, ProviderSettings};

/// Resolve a model reference into a concrete ChatModel.
pub fn create_chat_model(
    model_ref: &ModelRef,
    settings: &ProviderSettings,
) -> Result<Arc<dyn ChatModel>> {
    let api_key = settings.api_key.clone().ok_or_else(|| {
        KensaError::Config(format!(
            "no API key configured for '{model_ref}' (set OPENAI_API_KEY)"
        ))
    })?;

    let mut model = match settings.effective_provider(model_ref) {
        Provider::OpenAI => {
            let model = OpenAIChatModel::new(api_key, model_ref.model.clone());
            match &settings.api_base {
                Some(base) => model.with_base_url(base.clone()),
                None => model,
            }
        }
        Provider::AzureOpenAI => {
            let base = settings.api_base.clone().ok_or_else(|| {
                KensaError::Config(format!(
                    "'{model_ref}' needs an API base URL (set OPENAI_API_BASE)"
                ))
            })?;
            let version = settings
                .api_version
                .clone()
                .unwrap_or_else(|| ProviderSettings::DEFAULT_AZURE_API_VERSION.into());
            OpenAIChatModel::azure(api_key, model_ref.model.clone(), base, version)
        }
    };
    if settings.timeout_secs > 0 {
        model = model.with_timeout(Duration::from_secs(settings.timeout_secs));
    }

    tracing::debug!(model = %model_ref, "resolved chat model");
    Ok(Arc::new(model))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openai::Endpoint;

    #[test]
    fn create_openai_model() {
        let model = create_chat_model(
            &ModelRef::openai("gpt-4"),
            &ProviderSettings::new("key"),
        )
        .unwrap();
        assert_eq!(model.model_name(), "gpt-4");
    }

    #[test]
    fn missing_key_is_config_error() {
        let err = create_chat_model(&ModelRef::openai("gpt-4"), &ProviderSettings::default())
            .err()
            .unwrap();
        assert!(matches!(err, KensaError::Config(_)));
    }

    #[test]
    fn azure_requires_base() {
        let r = ModelRef::new(Provider::AzureOpenAI, "deploy");
        let err = create_chat_model(&r, &ProviderSettings::new("key")).err().unwrap();
        assert!(err.to_string().contains("OPENAI_API_BASE"));

        let settings = ProviderSettings::new("key").with_api_base("https://acme.openai.azure.com");
        let model = create_chat_model(&r, &settings).unwrap();
        assert_eq!(model.model_name(), "deploy");
    }

    #[test]
    fn api_type_routes_openai_ref_to_azure() {
        let settings = ProviderSettings::new("key")
            .with_api_base("https://acme.openai.azure.com")
            .with_api_type("azure");
        assert_eq!(
            settings.effective_provider(&ModelRef::openai("gpt-35")),
            Provider::AzureOpenAI
        );
        let model = create_chat_model(&ModelRef::openai("gpt-35"), &settings).unwrap();
        assert_eq!(model.model_name(), "gpt-35");
    }

    #[test]
    fn azure_endpoint_uses_default_version() {
        let model = OpenAIChatModel::azure(
            "k".into(),
            "d".into(),
            "https://x".into(),
            ProviderSettings::DEFAULT_AZURE_API_VERSION.into(),
        );
        assert!(matches!(
            model.endpoint(),
            Endpoint::Azure { api_version, .. } if api_version == "2023-05-15"
        ));
    }
}
