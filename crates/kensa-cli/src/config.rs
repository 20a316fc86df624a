use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use kensa_core::config::EvalSettings;
use kensa_core::error::{KensaError, Result};
use kensa_core::model::{CallOptions, ChatModel};
use kensa_eval::aggregate::Aggregation;
use kensa_eval::adapter::ModelAdapter;
use kensa_eval::dataset::ColumnMapping;
use kensa_eval::judge::{GradingExample, JudgeMetric};
use kensa_eval::metric::MetricDefinition;
use kensa_eval::presets;
use kensa_eval::runner::EvaluationRunner;
use kensa_eval::template::InstructionTemplate;
use kensa_llm::provider::ModelRef;

fn default_user_template() -> String {
    "{question}".into()
}

fn default_true() -> bool {
    true
}

/// An evaluation described in YAML.
#[derive(Debug, Clone, Deserialize)]
pub struct EvalFile {
    /// Model under test, e.g. `openai:/gpt-3.5-turbo`.
    pub model: ModelRef,
    pub system_prompt: String,
    #[serde(default = "default_user_template")]
    pub user_template: String,
    #[serde(default)]
    pub parameters: CallOptions,
    #[serde(default)]
    pub dataset: ColumnMapping,
    #[serde(default)]
    pub settings: EvalSettings,
    #[serde(default)]
    pub extra_metrics: Vec<MetricSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MetricSpec {
    Preset(PresetSpec),
    Custom { custom: CustomMetricSpec },
}

#[derive(Debug, Clone, Deserialize)]
pub struct PresetSpec {
    pub preset: String,
    pub model: ModelRef,
    #[serde(default)]
    pub examples: Vec<GradingExample>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CustomMetricSpec {
    pub name: String,
    pub definition: String,
    pub grading_prompt: String,
    pub model: ModelRef,
    #[serde(default)]
    pub examples: Vec<GradingExample>,
    #[serde(default)]
    pub parameters: Option<CallOptions>,
    #[serde(default)]
    pub grading_context_columns: Vec<String>,
    #[serde(default)]
    pub aggregations: Option<Vec<Aggregation>>,
    #[serde(default = "default_true")]
    pub greater_is_better: bool,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub max_score: Option<u32>,
    #[serde(default = "default_true")]
    pub include_input: bool,
}

impl MetricSpec {
    pub fn model(&self) -> &ModelRef {
        match self {
            MetricSpec::Preset(p) => &p.model,
            MetricSpec::Custom { custom } => &custom.model,
        }
    }
}

impl CustomMetricSpec {
    fn build(&self, model: Arc<dyn ChatModel>) -> JudgeMetric {
        let mut metric = JudgeMetric::new(
            self.name.clone(),
            self.definition.clone(),
            self.grading_prompt.clone(),
            model,
        )
        .with_model_ref(self.model.to_string())
        .with_examples(self.examples.clone())
        .with_grading_context_columns(self.grading_context_columns.clone())
        .with_greater_is_better(self.greater_is_better);
        if let Some(params) = &self.parameters {
            metric = metric.with_parameters(params.clone());
        }
        if let Some(aggs) = &self.aggregations {
            metric = metric.with_aggregations(aggs.clone());
        }
        if let Some(version) = &self.version {
            metric = metric.with_version(version.clone());
        }
        if let Some(max) = self.max_score {
            metric = metric.with_max_score(max);
        }
        if !self.include_input {
            metric = metric.without_input();
        }
        metric
    }
}

impl EvalFile {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    pub fn template(&self, system_prompt: Option<&str>) -> Result<InstructionTemplate> {
        let system = system_prompt.unwrap_or(&self.system_prompt);
        Ok(InstructionTemplate::new(system, self.user_template.clone())?)
    }

    /// Every model reference in the file, model under test first.
    pub fn model_refs(&self) -> Vec<&ModelRef> {
        let mut refs = vec![&self.model];
        for spec in &self.extra_metrics {
            if !refs.contains(&spec.model()) {
                refs.push(spec.model());
            }
        }
        refs
    }

    /// Build the judge metrics, resolving each distinct model once.
    pub fn build_metrics(
        &self,
        resolve: &impl Fn(&ModelRef) -> Result<Arc<dyn ChatModel>>,
    ) -> Result<Vec<MetricDefinition>> {
        let mut cache: HashMap<String, Arc<dyn ChatModel>> = HashMap::new();
        let mut metrics = Vec::with_capacity(self.extra_metrics.len());
        for spec in &self.extra_metrics {
            let key = spec.model().to_string();
            let model = match cache.get(&key) {
                Some(m) => m.clone(),
                None => {
                    let m = resolve(spec.model())?;
                    cache.insert(key, m.clone());
                    m
                }
            };
            let metric = match spec {
                MetricSpec::Preset(p) => {
                    presets::preset(&p.preset, model, p.examples.clone())
                        .ok_or_else(|| {
                            KensaError::Config(format!(
                                "unknown preset '{}' (expected one of {:?})",
                                p.preset,
                                presets::PRESET_NAMES
                            ))
                        })?
                        .with_model_ref(p.model.to_string())
                }
                MetricSpec::Custom { custom } => custom.build(model),
            };
            metrics.push(MetricDefinition::judge(metric));
        }
        Ok(metrics)
    }

    /// Assemble a runner for this file.
    pub fn build_runner(
        &self,
        system_prompt: Option<&str>,
        resolve: &impl Fn(&ModelRef) -> Result<Arc<dyn ChatModel>>,
    ) -> Result<EvaluationRunner> {
        let adapter = ModelAdapter::new(resolve(&self.model)?, self.template(system_prompt)?)
            .with_options(self.parameters.clone())
            .with_retry(self.settings.retry);
        Ok(EvaluationRunner::new(adapter, self.settings.clone()).with_metrics(self.build_metrics(resolve)?))
    }
}
