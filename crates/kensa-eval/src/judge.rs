use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use kensa_core::config::ScoreClampPolicy;
use kensa_core::error::MetricError;
use kensa_core::message::Message;
use kensa_core::model::{CallOptions, ChatModel};
use kensa_core::retry::with_retry_until;

use crate::aggregate::Aggregation;
use crate::cancel::RunGuard;
use crate::metric::{MetricInput, MetricOutcome, ScoringPolicy};

static SCORE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^[\s*#>-]*score[\s*]*[:=]\s*\**\s*(-?\d+(?:\.\d+)?)").expect("valid regex")
});
static JUSTIFICATION_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)justification[\s*]*[:=]\s*(.+)").expect("valid regex")
});
static INTEGER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d+\b").expect("valid regex"));

/// A worked example shown to the judge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradingExample {
    pub input: String,
    pub output: String,
    pub score: u32,
    pub justification: String,
    #[serde(default)]
    pub grading_context: BTreeMap<String, String>,
}

impl GradingExample {
    pub fn new(
        input: impl Into<String>,
        output: impl Into<String>,
        score: u32,
        justification: impl Into<String>,
    ) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            score,
            justification: justification.into(),
            grading_context: BTreeMap::new(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.grading_context.insert(key.into(), value.into());
        self
    }
}

/// A metric scored by asking a judge model to grade against a rubric.
pub struct JudgeMetric {
    name: String,
    version: String,
    definition: String,
    grading_prompt: String,
    examples: Vec<GradingExample>,
    model: Arc<dyn ChatModel>,
    model_ref: Option<String>,
    parameters: CallOptions,
    grading_context_columns: Vec<String>,
    aggregations: Vec<Aggregation>,
    greater_is_better: bool,
    max_score: u32,
    include_input: bool,
}

impl JudgeMetric {
    pub fn new(
        name: impl Into<String>,
        definition: impl Into<String>,
        grading_prompt: impl Into<String>,
        model: Arc<dyn ChatModel>,
    ) -> Self {
        Self {
            name: name.into(),
            version: "v1".into(),
            definition: definition.into(),
            grading_prompt: grading_prompt.into(),
            examples: Vec::new(),
            model,
            model_ref: None,
            parameters: CallOptions::default().with_temperature(0.0),
            grading_context_columns: Vec::new(),
            aggregations: Aggregation::DEFAULT.to_vec(),
            greater_is_better: true,
            max_score: 5,
            include_input: true,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_examples(mut self, examples: Vec<GradingExample>) -> Self {
        self.examples = examples;
        self
    }

    pub fn with_model_ref(mut self, model_ref: impl Into<String>) -> Self {
        self.model_ref = Some(model_ref.into());
        self
    }

    pub fn with_parameters(mut self, parameters: CallOptions) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_grading_context_columns(mut self, columns: Vec<String>) -> Self {
        self.grading_context_columns = columns;
        self
    }

    pub fn with_aggregations(mut self, aggregations: Vec<Aggregation>) -> Self {
        self.aggregations = aggregations;
        self
    }

    pub fn with_greater_is_better(mut self, greater_is_better: bool) -> Self {
        self.greater_is_better = greater_is_better;
        self
    }

    /// Scores range over `1..=max_score`.
    pub fn with_max_score(mut self, max_score: u32) -> Self {
        self.max_score = max_score.max(1);
        self
    }

    /// Leave the case input out of the grading prompt.
    pub fn without_input(mut self) -> Self {
        self.include_input = false;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn model_ref(&self) -> Option<&str> {
        self.model_ref.as_deref()
    }

    pub fn grading_context_columns(&self) -> &[String] {
        &self.grading_context_columns
    }

    pub fn aggregations(&self) -> &[Aggregation] {
        &self.aggregations
    }

    pub fn greater_is_better(&self) -> bool {
        self.greater_is_better
    }

    pub fn max_score(&self) -> u32 {
        self.max_score
    }

    pub fn examples(&self) -> &[GradingExample] {
        &self.examples
    }

    /// Assemble the grading prompt for one case.
    pub fn build_prompt(&self, input: &MetricInput<'_>) -> Result<String, MetricError> {
        let mut context = BTreeMap::new();
        for column in &self.grading_context_columns {
            let value = input
                .case
                .context
                .get(column)
                .ok_or_else(|| MetricError::MissingContext(column.clone()))?;
            context.insert(column.as_str(), value.as_str());
        }

        let n = self.max_score;
        let mut p = String::new();
        let _ = writeln!(
            p,
            "Task:\nYou must return a single JSON object with two fields:\n\
             - \"score\": your integer score for the model's {name}, based on the rubric\n\
             - \"justification\": your reasoning about the model's {name} score\n",
            name = self.name
        );
        let _ = writeln!(
            p,
            "You are an impartial judge. You will be given an input that was sent to a machine \
             learning model, and you will be given an output that the model produced. You may \
             also be given additional information that was used by the model to generate the output.\n"
        );
        let _ = writeln!(
            p,
            "Your task is to determine a numerical score called {} based on the input and output.\n\
             A definition of {} and a grading rubric are provided below.\n\
             You must use the grading rubric to determine your score. You must also justify your score.\n",
            self.name, self.name
        );
        let _ = writeln!(
            p,
            "Examples could be included below for reference. Make sure to use them as references and \
             to understand them before completing the task.\n"
        );

        if self.include_input {
            let _ = writeln!(p, "Input:\n{}\n", input.case.input);
        }
        let _ = writeln!(p, "Output:\n{}\n", input.output);
        if !context.is_empty() {
            let _ = writeln!(p, "{}", render_context(&context));
        }

        let _ = writeln!(p, "Metric definition:\n{}\n", self.definition);
        let _ = writeln!(p, "Grading rubric:\n{}\n", self.grading_prompt);

        if !self.examples.is_empty() {
            let _ = writeln!(p, "Examples:");
            for (i, ex) in self.examples.iter().enumerate() {
                let _ = writeln!(p, "\nExample {}:", i + 1);
                if self.include_input {
                    let _ = writeln!(p, "Input:\n{}\n", ex.input);
                }
                let _ = writeln!(p, "Output:\n{}\n", ex.output);
                if !ex.grading_context.is_empty() {
                    let ctx = ex
                        .grading_context
                        .iter()
                        .map(|(k, v)| (k.as_str(), v.as_str()))
                        .collect();
                    let _ = writeln!(p, "{}", render_context(&ctx));
                }
                let graded = serde_json::json!({
                    "score": ex.score,
                    "justification": ex.justification,
                });
                let _ = writeln!(p, "{graded}");
            }
            let _ = writeln!(p);
        }

        let _ = write!(
            p,
            "You must return the following fields in your response as a JSON object:\n\
             {{\"score\": <integer from 1 to {n}>, \"justification\": \"<your reasoning>\"}}\n\
             Do not add additional new lines. Do not add any other fields."
        );
        Ok(p)
    }

    /// Grade one case. Judge failures are recorded in the outcome.
    pub async fn evaluate(
        &self,
        input: &MetricInput<'_>,
        policy: &ScoringPolicy,
        guard: &RunGuard,
    ) -> MetricOutcome {
        let prompt = match self.build_prompt(input) {
            Ok(p) => p,
            Err(e) => return e.into(),
        };
        let messages = vec![Message::user(prompt)];
        let call = with_retry_until(&policy.retry, guard.token(), || {
            self.model.generate(&messages, &self.parameters)
        });
        let attempted = match guard.run(call).await {
            Some(attempted) if !attempted.interrupted => attempted,
            _ => return MetricOutcome::cancelled(),
        };

        let parsed = attempted
            .result
            .map_err(MetricError::JudgeModel)
            .and_then(|r| parse_judge_response(&r.text, self.max_score, policy.clamp));
        match parsed {
            Ok((score, justification)) => MetricOutcome::Scored {
                score,
                justification,
            },
            Err(e) => {
                tracing::warn!(metric = %self.name, case_id = input.case.id, "judge failed: {e}");
                e.into()
            }
        }
    }
}

fn render_context(context: &BTreeMap<&str, &str>) -> String {
    let mut out = String::from("Additional information used by the model:\n");
    for (k, v) in context {
        let _ = writeln!(out, "key: {k}\nvalue:\n{v}");
    }
    out
}

fn bounded(score: f64, max: u32, clamp: ScoreClampPolicy) -> Result<f64, MetricError> {
    if score.fract() != 0.0 {
        return Err(MetricError::JudgeParse(format!(
            "score {score} is not an integer"
        )));
    }
    let min = 1.0;
    let upper = max as f64;
    if (min..=upper).contains(&score) {
        return Ok(score);
    }
    match clamp {
        ScoreClampPolicy::Clamp => Ok(score.clamp(min, upper)),
        ScoreClampPolicy::Reject => Err(MetricError::ScoreOutOfRange { score, min: 1, max }),
    }
}

fn json_candidate(text: &str) -> Option<serde_json::Map<String, Value>> {
    let trimmed = text.trim();
    if let Ok(Value::Object(map)) = serde_json::from_str(trimmed) {
        return Some(map);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str(&trimmed[start..=end]) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn json_score(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Extract `(score, justification)` from a judge reply.
///
/// Tries a JSON object first (bare, fenced or embedded in prose), then a
/// `score: N` line, then the first integer within `1..=max`. An explicit
/// score must be a whole number.
pub fn parse_judge_response(
    text: &str,
    max: u32,
    clamp: ScoreClampPolicy,
) -> Result<(f64, Option<String>), MetricError> {
    if let Some(map) = json_candidate(text) {
        if let Some(score) = map.get("score").and_then(json_score) {
            let justification = map
                .get("justification")
                .or_else(|| map.get("explanation"))
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string());
            return Ok((bounded(score, max, clamp)?, justification));
        }
    }

    if let Some(caps) = SCORE_LINE.captures(text) {
        if let Ok(score) = caps[1].parse::<f64>() {
            let justification = JUSTIFICATION_LINE
                .captures(text)
                .map(|c| c[1].trim().to_string());
            return Ok((bounded(score, max, clamp)?, justification));
        }
    }

    let in_range = INTEGER
        .find_iter(text)
        .filter_map(|m| m.as_str().parse::<u32>().ok())
        .find(|n| (1..=max).contains(n));
    if let Some(score) = in_range {
        return Ok((score as f64, Some(text.trim().to_string())));
    }

    let preview: String = text.chars().take(80).collect();
    Err(MetricError::JudgeParse(format!("no score found in '{preview}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::EvaluationCase;
    use kensa_core::error::ModelError;
    use kensa_llm::mock::ScriptedChatModel;

    const REJECT: ScoreClampPolicy = ScoreClampPolicy::Reject;

    fn professionalism(model: Arc<dyn ChatModel>) -> JudgeMetric {
        JudgeMetric::new(
            "professionalism",
            "Professionalism refers to the use of a formal, respectful, and appropriate style of communication.",
            "- Score 1: Language is extremely casual.\n- Score 5: Language is excessively formal.",
            model,
        )
        .with_examples(vec![GradingExample::new(
            "What is MLflow?",
            "MLflow is like your friendly neighborhood toolkit!",
            2,
            "The response is written in a casual tone.",
        )])
    }

    // --- parse_judge_response ---

    #[test]
    fn parse_bare_json() {
        let (score, just) =
            parse_judge_response(r#"{"score": 4, "justification": "Mostly formal"}"#, 5, REJECT)
                .unwrap();
        assert_eq!(score, 4.0);
        assert_eq!(just.as_deref(), Some("Mostly formal"));
    }

    #[test]
    fn parse_fenced_json() {
        let text = "Here is my grading:\n```json\n{\"score\": \"3\", \"justification\": \"ok\"}\n```\nThanks";
        let (score, just) = parse_judge_response(text, 5, REJECT).unwrap();
        assert_eq!(score, 3.0);
        assert_eq!(just.as_deref(), Some("ok"));
    }

    #[test]
    fn parse_score_lines() {
        let text = "score: 5\njustification: Uses a textbook register.\nVery formal.";
        let (score, just) = parse_judge_response(text, 5, REJECT).unwrap();
        assert_eq!(score, 5.0);
        assert_eq!(
            just.as_deref(),
            Some("Uses a textbook register.\nVery formal.")
        );
    }

    #[test]
    fn parse_markdown_score_line() {
        let (score, _) = parse_judge_response("**Score**: 2\nToo casual.", 5, REJECT).unwrap();
        assert_eq!(score, 2.0);
    }

    #[test]
    fn parse_first_integer_in_range() {
        let (score, just) =
            parse_judge_response("Out of 10 options I would give it a 3.", 5, REJECT).unwrap();
        assert_eq!(score, 3.0);
        assert!(just.unwrap().contains("give it a 3"));
    }

    #[test]
    fn out_of_range_rejected_or_clamped() {
        let text = r#"{"score": 7, "justification": "great"}"#;
        let err = parse_judge_response(text, 5, REJECT).unwrap_err();
        assert!(matches!(err, MetricError::ScoreOutOfRange { max: 5, .. }));

        let (score, _) = parse_judge_response(text, 5, ScoreClampPolicy::Clamp).unwrap();
        assert_eq!(score, 5.0);

        let (score, _) =
            parse_judge_response(r#"{"score": 0}"#, 5, ScoreClampPolicy::Clamp).unwrap();
        assert_eq!(score, 1.0);
    }

    #[test]
    fn fractional_score_rejected() {
        for text in [
            r#"{"score": 4.5, "justification": "x"}"#,
            r#"{"score": "3.2"}"#,
            "score: 2.5\njustification: between",
        ] {
            let err = parse_judge_response(text, 5, ScoreClampPolicy::Clamp).unwrap_err();
            assert!(matches!(err, MetricError::JudgeParse(_)), "{text}");
        }
        let (score, _) = parse_judge_response(r#"{"score": 4.0}"#, 5, REJECT).unwrap();
        assert_eq!(score, 4.0);
    }

    #[test]
    fn unparsable() {
        let err = parse_judge_response("I cannot evaluate this", 5, REJECT).unwrap_err();
        assert!(matches!(err, MetricError::JudgeParse(_)));
        let err = parse_judge_response("Rated 9 out of 10", 5, REJECT).unwrap_err();
        assert!(matches!(err, MetricError::JudgeParse(_)));
    }

    // --- prompt ---

    #[test]
    fn prompt_contains_rubric_examples_and_case() {
        let judge = professionalism(Arc::new(ScriptedChatModel::echo()));
        let case = EvaluationCase::new(0, "How does useEffect() work?");
        let prompt = judge
            .build_prompt(&MetricInput::new(&case, "It runs after render."))
            .unwrap();
        assert!(prompt.contains("Professionalism refers to"));
        assert!(prompt.contains("Score 5: Language is excessively formal"));
        assert!(prompt.contains("Example 1:"));
        assert!(prompt.contains(r#""score":2"#));
        assert!(prompt.contains("How does useEffect() work?"));
        assert!(prompt.contains("It runs after render."));
        assert!(prompt.contains(r#"{"score": <integer from 1 to 5>"#));
    }

    #[test]
    fn prompt_asks_for_json_only() {
        let judge = professionalism(Arc::new(ScriptedChatModel::echo()));
        let case = EvaluationCase::new(0, "q");
        let prompt = judge.build_prompt(&MetricInput::new(&case, "o")).unwrap();
        assert!(prompt.starts_with("Task:\nYou must return a single JSON object"));
        assert!(!prompt.contains("two lines"));
        assert!(!prompt.contains("\nscore: "));
        assert!(!prompt.contains("\njustification: "));
        assert_eq!(prompt.matches("JSON object").count(), 2);
    }

    #[test]
    fn prompt_includes_grading_context() {
        let judge = JudgeMetric::new("similarity", "def", "rubric", Arc::new(ScriptedChatModel::echo()))
            .with_grading_context_columns(vec!["targets".into()])
            .without_input();
        let case = EvaluationCase::new(0, "secret question").with_ground_truth("reference answer");
        let prompt = judge.build_prompt(&MetricInput::new(&case, "out")).unwrap();
        assert!(prompt.contains("key: targets"));
        assert!(prompt.contains("reference answer"));
        assert!(!prompt.contains("secret question"));
    }

    #[test]
    fn prompt_missing_context() {
        let judge = JudgeMetric::new("x", "d", "r", Arc::new(ScriptedChatModel::echo()))
            .with_grading_context_columns(vec!["context".into()]);
        let case = EvaluationCase::new(0, "q");
        let err = judge.build_prompt(&MetricInput::new(&case, "o")).unwrap_err();
        assert!(matches!(err, MetricError::MissingContext(ref c) if c == "context"));
    }

    // --- evaluate ---

    #[tokio::test]
    async fn evaluate_scores_with_justification() {
        let model = Arc::new(ScriptedChatModel::with_response(
            r#"{"score": 4, "justification": "Formal and clear"}"#,
        ));
        let judge = professionalism(model.clone());
        let case = EvaluationCase::new(0, "q");
        let outcome = judge
            .evaluate(
                &MetricInput::new(&case, "A formal answer."),
                &ScoringPolicy::default(),
                &RunGuard::unbounded(),
            )
            .await;
        assert_eq!(
            outcome,
            MetricOutcome::Scored {
                score: 4.0,
                justification: Some("Formal and clear".into())
            }
        );
        assert_eq!(model.call_count(), 1);
    }

    #[tokio::test]
    async fn judge_model_failure_recorded() {
        let model = Arc::new(
            ScriptedChatModel::with_response("{}")
                .failing_first(vec![ModelError::Auth("bad key".into())]),
        );
        let judge = professionalism(model);
        let case = EvaluationCase::new(0, "q");
        let outcome = judge
            .evaluate(
                &MetricInput::new(&case, "o"),
                &ScoringPolicy::default(),
                &RunGuard::unbounded(),
            )
            .await;
        assert!(matches!(
            outcome,
            MetricOutcome::Failed { kind: crate::metric::FailureKind::JudgeModel, .. }
        ));
    }

    #[tokio::test]
    async fn cancelled_guard_skips_call() {
        let model = Arc::new(ScriptedChatModel::with_response(r#"{"score": 3}"#));
        let judge = professionalism(model.clone());
        let guard = RunGuard::new(Default::default(), std::time::Duration::ZERO);
        guard.token().cancel();
        let case = EvaluationCase::new(0, "q");
        let outcome = judge
            .evaluate(&MetricInput::new(&case, "o"), &ScoringPolicy::default(), &guard)
            .await;
        assert_eq!(outcome, MetricOutcome::cancelled());
        assert_eq!(model.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_does_not_retry_after_cancel() {
        let guard = RunGuard::new(Default::default(), std::time::Duration::from_secs(10));
        let token = guard.token().clone();
        let model = Arc::new(ScriptedChatModel::new("judge", move |_: &[Message]| {
            token.cancel();
            Err(ModelError::ServerError {
                status: 503,
                message: "busy".into(),
            })
        }));
        let judge = professionalism(model.clone());
        let case = EvaluationCase::new(0, "q");
        let policy = ScoringPolicy {
            retry: kensa_core::config::RetryPolicy::new(3),
            ..ScoringPolicy::default()
        };
        let outcome = judge
            .evaluate(&MetricInput::new(&case, "o"), &policy, &guard)
            .await;
        assert_eq!(outcome, MetricOutcome::cancelled());
        assert_eq!(model.call_count(), 1);
    }
}
