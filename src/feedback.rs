//! Renders evaluated runs into the annotated transcript read by the optimizer model.
//!
//! Every function here is pure: identical inputs always give identical text.

use serde_json::Value;

use crate::evaluation::ExperimentRow;
use crate::schemas::{EvaluationResult, Example, Run};
use crate::utils::JsonMap;

/// Inputs are cut to this many characters to bound the transcript size.
pub const MAX_INPUT_CHARS: usize = 400;

fn json_text(map: &JsonMap) -> String {
    Value::Object(map.clone()).to_string()
}

/// Renders one annotation. Missing score, value and comment render as nothing.
pub fn format_feedback(feedback: &EvaluationResult) -> String {
    let val = match (&feedback.score, &feedback.value) {
        (Some(score), _) => format!("\nScore:[{}]", score),
        (None, Some(Value::String(value))) => format!("Value: {}", value),
        (None, Some(value)) => format!("Value: {}", value),
        (None, None) => String::new(),
    };
    let comment = match &feedback.comment {
        Some(comment) if !comment.is_empty() => format!("\n{}", comment),
        _ => String::new(),
    };
    format!("<feedback key={}>{}{}\n</feedback>", feedback.key, val, comment)
}

/// Renders a run, its reference example and its annotations as one `<example>` block.
pub fn format_run_with_feedback(run: &Run, example: &Example, feedback: &[EvaluationResult], id: usize) -> String {
    let all_feedback = feedback.iter().map(format_feedback).collect::<Vec<_>>().join("\n");
    let input: String = json_text(&run.inputs).chars().take(MAX_INPUT_CHARS).collect();
    let prediction = match (&run.outputs, &run.error) {
        (Some(outputs), _) => json_text(outputs),
        (None, Some(error)) => format!("Error: {}", error),
        (None, None) => "null".to_string(),
    };
    format!(
        "<example id={id}>\n<input>\n{input}\n</input>\n<prediction>\n{prediction}\n</prediction>\n<label>\n{label}\n</label>\n<annotations>\n{all_feedback}\n</annotations>\n</example>",
        label = json_text(&example.outputs),
    )
}

/// One block per row, in row order.
pub fn format_evaluation_results(rows: &[ExperimentRow]) -> Vec<String> {
    rows.iter()
        .enumerate()
        .map(|(idx, row)| format_run_with_feedback(&row.run, &row.example, &row.evaluation_results, idx))
        .collect()
}
