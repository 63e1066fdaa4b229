//! # Critique
//!
//! A model-graded [Evaluator]: a chat model reviews each run against its example and grades it from 1 to 10.
//! The grade is normalized into `[0, 1]` so it can serve as the primary score of an experiment.
//!
//! Replies go through the same decode-and-retry protocol as the optimizer: a reply that is not a valid critique is
//! sent back with the validation error.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::evaluation::Evaluator;
use crate::optimizer::{decode_json, invoke_with_retries, DecodeError};
use crate::prompt::PromptTemplate;
use crate::schemas::{EvaluationResult, Example, Run};
use crate::utils::llm::{ChatMessage, ChatModel};
use crate::utils::JsonMap;

pub const DEFAULT_CRITIQUE_KEY: &str = "ai_score";

const MIN_GRADE: f64 = 1.0;
const MAX_GRADE: f64 = 10.0;

const CRITIQUE_SYSTEM: &str = "You are a QA assurance agent shadowing a colleague. Review the input your colleague \
was given, the response they produced and the reference answer, then grade how well the response satisfies the need \
behind the input. {criteria}";

const CRITIQUE_REQUEST: &str = "<input>
{input}
</input>
<prediction>
{prediction}
</prediction>
<reference>
{reference}
</reference>

Respond with a single JSON object with these fields:
- \"score\": integer grade from 1 to 10 stating how well the prediction satisfied the user's need.
- \"comment\": step-by-step reasoning for the score.
- \"correction\": what a more appropriate response would have been, or null if none is needed.";

/// The wire shape of a critique reply.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Critique {
    pub score: f64,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub correction: Option<Value>,
}

/// Decodes a critique and checks that its grade is within 1 to 10.
pub fn decode_critique(raw: &str) -> Result<Critique, DecodeError> {
    let critique: Critique = decode_json(raw)?;
    if !(MIN_GRADE..=MAX_GRADE).contains(&critique.score) {
        return Err(DecodeError::Schema(format!("score must be between 1 and 10, got {}", critique.score)));
    }
    Ok(critique)
}

fn json_text(map: &JsonMap) -> String {
    Value::Object(map.clone()).to_string()
}

/// Grades runs with a chat model. Results are recorded under [CritiqueEvaluator::key].
pub struct CritiqueEvaluator<M: ChatModel> {
    model: Arc<M>,
    pub key: String,
    /// Extra grading instructions appended to the system message.
    pub criteria: String,
    /// Attempts per run, including the first one.
    pub max_attempts: usize,
}

impl<M: ChatModel> CritiqueEvaluator<M> {
    pub fn new(model: Arc<M>) -> Self {
        Self {
            model,
            key: DEFAULT_CRITIQUE_KEY.to_string(),
            criteria: String::new(),
            max_attempts: 3,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_criteria(mut self, criteria: impl Into<String>) -> Self {
        self.criteria = criteria.into();
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    fn build_messages(&self, run: &Run, example: &Example) -> Result<Vec<ChatMessage>> {
        let system = PromptTemplate::new(CRITIQUE_SYSTEM)?
            .construct_prompt()
            .try_fill("criteria", self.criteria.as_str())?
            .complete()?;
        let prediction = match (run.output_text(), &run.error) {
            (Some(text), _) => text.to_string(),
            (None, Some(error)) => format!("Error: {}", error),
            (None, None) => run.outputs.as_ref().map_or_else(|| "null".to_string(), json_text),
        };
        let request = PromptTemplate::new(CRITIQUE_REQUEST)?
            .construct_prompt()
            .try_fill("input", json_text(&run.inputs))?
            .try_fill("prediction", prediction)?
            .try_fill("reference", json_text(&example.outputs))?
            .complete()?;
        Ok(vec![ChatMessage::system(system.trim_end()), ChatMessage::user(request)])
    }
}

#[async_trait]
impl<M: ChatModel> Evaluator for CritiqueEvaluator<M> {
    async fn evaluate(&self, run: &Run, example: &Example) -> Result<EvaluationResult> {
        let messages = self.build_messages(run, example)?;
        let critique = invoke_with_retries(self.model.as_ref(), messages, self.max_attempts, decode_critique).await?;
        let mut result = EvaluationResult::new(self.key.as_str()).with_score(critique.score / MAX_GRADE);
        if !critique.comment.is_empty() {
            result = result.with_comment(critique.comment);
        }
        if let Some(correction) = critique.correction.filter(|c| !c.is_null()) {
            result = result.with_value(correction);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod test_critique {
    use std::sync::Arc;

    use serde_json::json;

    use super::{decode_critique, CritiqueEvaluator};
    use crate::evaluation::test_evaluation::{boxed, examples, EchoChain};
    use crate::evaluation::{EvalConfig, EvaluationHarness, Evaluator};
    use crate::optimizer::{DecodeError, ExtractionFailed};
    use crate::prompt::PromptTemplate;
    use crate::schemas::Run;
    use crate::utils::llm::mock::ScriptedModel;

    fn critique(score: i64, correction: serde_json::Value) -> String {
        json!({"score": score, "comment": "Misses the key fact.", "correction": correction}).to_string()
    }

    #[test]
    fn test_decode_critique() {
        let ok = decode_critique(&format!("Here is my review: {}", critique(7, json!(null)))).unwrap();
        assert_eq!(ok.score, 7.0);
        assert_eq!(ok.correction, None);
        assert!(matches!(decode_critique(&critique(0, json!(null))), Err(DecodeError::Schema(_))));
        assert!(matches!(decode_critique(&critique(11, json!(null))), Err(DecodeError::Schema(_))));
        assert!(matches!(decode_critique("{\"comment\": \"no score\"}"), Err(DecodeError::Schema(_))));
        assert!(matches!(decode_critique("looks fine to me"), Err(DecodeError::InvalidJson(_))));
    }

    #[tokio::test]
    async fn test_critique_normalizes_and_records() {
        let model = Arc::new(ScriptedModel::replying([critique(8, json!({"summary": "Paris is the capital."}))]));
        let evaluator = CritiqueEvaluator::new(model.clone()).with_criteria("Penalize made-up facts.");
        let example = &examples("d", &["capital of France"])[0];
        let mut run = Run::for_example("p", example);
        run.succeed("Lyon");

        let result = evaluator.evaluate(&run, example).await.unwrap();
        assert_eq!(result.key, "ai_score");
        assert_eq!(result.score, Some(0.8));
        assert_eq!(result.comment.as_deref(), Some("Misses the key fact."));
        assert_eq!(result.value, Some(json!({"summary": "Paris is the capital."})));

        let calls = model.calls.lock().unwrap();
        assert!(calls[0][0].content.ends_with("Penalize made-up facts."));
        assert!(calls[0][1].content.contains("<prediction>\nLyon\n</prediction>"));
        assert!(calls[0][1].content.contains("<reference>\n{\"summary\":\"capital of France\"}\n</reference>"));
    }

    #[tokio::test]
    async fn test_critique_retries_out_of_range_grade() {
        let model = Arc::new(ScriptedModel::replying([critique(42, json!(null)), critique(5, json!(null))]));
        let evaluator = CritiqueEvaluator::new(model.clone()).with_key("helpfulness");
        let example = &examples("d", &["hi"])[0];
        let mut run = Run::for_example("p", example);
        run.fail("timeout");

        let result = evaluator.evaluate(&run, example).await.unwrap();
        assert_eq!(result.key, "helpfulness");
        assert_eq!(result.score, Some(0.5));
        assert_eq!(result.value, None);

        let calls = model.calls.lock().unwrap();
        assert!(calls[0][1].content.contains("<prediction>\nError: timeout\n</prediction>"));
        assert_eq!(calls[1].len(), 4);
        assert!(calls[1][3].content.contains("got 42"));
    }

    #[tokio::test]
    async fn test_critique_failure_is_isolated_by_harness() {
        let model = Arc::new(ScriptedModel::replying([
            critique(9, json!(null)),
            "no idea".to_string(),
            "still no idea".to_string(),
        ]));
        let evaluator = CritiqueEvaluator::new(model.clone()).with_max_attempts(2);
        let harness = EvaluationHarness::new(EvalConfig { max_concurrency: 1, ..Default::default() });
        let chain = EchoChain { template: PromptTemplate::new("{text}").unwrap() };
        let results = harness.evaluate(&chain, &examples("d", &["a", "b"]), &[boxed(evaluator)]).await;
        assert_eq!(results.primary_scores(), vec![Some(0.9), None]);
        assert!(results.rows[1].evaluator_errors[0].contains("2 attempts"));
        assert_eq!(model.call_count(), 3);
        // the error type survives for callers evaluating directly
        let direct = CritiqueEvaluator::new(Arc::new(ScriptedModel::replying(["nope"]))).with_max_attempts(1);
        let example = &examples("d", &["a"])[0];
        let err = direct.evaluate(&Run::for_example("p", example), example).await.unwrap_err();
        assert!(err.downcast_ref::<ExtractionFailed>().is_some());
    }
}
