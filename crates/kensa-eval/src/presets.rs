//! Ready-made judge metrics for question answering.

use std::sync::Arc;

use kensa_core::model::ChatModel;

use crate::dataset::TARGETS_KEY;
use crate::judge::{GradingExample, JudgeMetric};

pub const PRESET_NAMES: [&str; 3] = ["answer_similarity", "answer_correctness", "answer_relevance"];

const SIMILARITY_DEFINITION: &str = "Answer similarity is evaluated on the degree of semantic \
similarity of the provided output to the provided targets, which is the ground truth. Scores can \
be assigned based on the gradual similarity in meaning and description to the provided targets, \
where a higher score indicates greater alignment between the provided output and provided targets.";

const SIMILARITY_RUBRIC: &str = "Answer similarity: Below are the details for different scores:
- Score 1: The output has little to no semantic similarity to the provided targets.
- Score 2: The output displays partial semantic similarity to the provided targets on some aspects.
- Score 3: The output has moderate semantic similarity to the provided targets.
- Score 4: The output aligns with the provided targets in most aspects and has substantial semantic similarity.
- Score 5: The output closely aligns with the provided targets in all significant aspects.";

const CORRECTNESS_DEFINITION: &str = "Answer correctness is evaluated on the accuracy of the \
provided output based on the provided targets, which is the ground truth. Scores can be assigned \
based on the degree of semantic similarity and factual correctness of the provided output to the \
provided targets, where a higher score indicates higher degree of accuracy.";

const CORRECTNESS_RUBRIC: &str = "Answer correctness: Below are the details for different scores:
- Score 1: The output is completely incorrect. It is completely different from or contradicts the provided targets.
- Score 2: The output demonstrates some degree of semantic similarity and includes partially correct information. However, the output still has significant discrepancies with the provided targets or inaccuracies.
- Score 3: The output addresses a couple of aspects of the input accurately, aligning with the provided targets. However, there are still omissions or minor inaccuracies.
- Score 4: The output is mostly correct. It provides mostly accurate information, but there may be one or more minor omissions or inaccuracies.
- Score 5: The output is correct. It demonstrates a high degree of accuracy and semantic similarity to the targets.";

const RELEVANCE_DEFINITION: &str = "Answer relevance measures the appropriateness and \
applicability of the output with respect to the input. Scores should reflect the extent to which \
the output directly addresses the question provided in the input, and give lower scores for \
incomplete or redundant output.";

const RELEVANCE_RUBRIC: &str = "Answer relevance: Below are the details for different scores:
- Score 1: The output doesn't mention anything about the question or is completely irrelevant to the input.
- Score 2: The output provides some relevance to the question and answers one aspect of the question in the input.
- Score 3: The output mostly answers the question but is missing or hallucinating on one critical aspect.
- Score 4: The output answers the question in the input but contains some redundant information.
- Score 5: The output answers the question in the input with all critical aspects and no redundant information.";

fn similarity_example() -> GradingExample {
    GradingExample::new(
        "What is MLflow?",
        "MLflow is an open-source platform for managing machine learning workflows, including \
         experiment tracking, model packaging, versioning, and deployment, simplifying the ML lifecycle.",
        4,
        "The definition effectively explains what MLflow is its purpose, and its developer. \
         It could be more concise for a 5-score.",
    )
    .with_context(
        TARGETS_KEY,
        "MLflow is an open-source platform for managing the end-to-end machine learning (ML) \
         lifecycle. It was developed by Databricks, a company that specializes in big data and \
         machine learning solutions.",
    )
}

fn relevance_example() -> GradingExample {
    GradingExample::new(
        "How is MLflow related to Databricks?",
        "Databricks is a data engineering and analytics platform designed to help organizations \
         process and analyze large amounts of data. Databricks is a company specializing in big \
         data and machine learning solutions.",
        2,
        "The output provides relevant information about Databricks, mentioning it as a company \
         specializing in big data and machine learning solutions. However, it doesn't directly \
         address how MLflow is related to Databricks.",
    )
}

fn with_default_examples(mut extra: Vec<GradingExample>, default: GradingExample) -> Vec<GradingExample> {
    if extra.is_empty() {
        extra.push(default);
    }
    extra
}

/// Semantic similarity of the output to the targets column. The input is not shown to the judge.
pub fn answer_similarity(model: Arc<dyn ChatModel>, examples: Vec<GradingExample>) -> JudgeMetric {
    JudgeMetric::new("answer_similarity", SIMILARITY_DEFINITION, SIMILARITY_RUBRIC, model)
        .with_examples(with_default_examples(examples, similarity_example()))
        .with_grading_context_columns(vec![TARGETS_KEY.into()])
        .without_input()
}

/// Factual accuracy of the output against the targets column.
pub fn answer_correctness(model: Arc<dyn ChatModel>, examples: Vec<GradingExample>) -> JudgeMetric {
    JudgeMetric::new("answer_correctness", CORRECTNESS_DEFINITION, CORRECTNESS_RUBRIC, model)
        .with_examples(with_default_examples(examples, similarity_example()))
        .with_grading_context_columns(vec![TARGETS_KEY.into()])
}

/// How directly the output addresses the input. Needs no ground truth.
pub fn answer_relevance(model: Arc<dyn ChatModel>, examples: Vec<GradingExample>) -> JudgeMetric {
    JudgeMetric::new("answer_relevance", RELEVANCE_DEFINITION, RELEVANCE_RUBRIC, model)
        .with_examples(with_default_examples(examples, relevance_example()))
}

/// Build a preset by name.
pub fn preset(
    name: &str,
    model: Arc<dyn ChatModel>,
    examples: Vec<GradingExample>,
) -> Option<JudgeMetric> {
    match name {
        "answer_similarity" => Some(answer_similarity(model, examples)),
        "answer_correctness" => Some(answer_correctness(model, examples)),
        "answer_relevance" => Some(answer_relevance(model, examples)),
        _ => None,
    }
}
