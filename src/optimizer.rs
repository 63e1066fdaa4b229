//! # Optimizer
//!
//! The optimizer sends an annotated transcript and the current prompt to a chat model and asks for an improved
//! prompt as a JSON object with the fields of [OptimizerOutput].
//!
//! Prompt templates are load-bearing: the chain built from the improved prompt binds inputs by placeholder name.
//! A reply is therefore accepted only when the improved prompt has *exactly* the placeholders of the current one.
//! A rejected reply is fed back to the model together with the validation error, up to
//! [OptimizerConfig::max_attempts] attempts in total; after that the step fails with [ExtractionFailed].

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::feedback::format_evaluation_results;
use crate::evaluation::ExperimentRow;
use crate::prompt::errors::PlaceholderMismatch;
use crate::prompt::PromptTemplate;
use crate::schemas::{EvaluationResult, RunQuery};
use crate::store::{DatasetStore, TraceStore};
use crate::utils::llm::{ChatMessage, ChatModel};
use crate::utils::postprocess::json::filter_to_json;
use crate::utils::token::{count_tokens_by_len, truncate_blocks, CountToken};

pub use errors::{DecodeError, ExtractionFailed};

/// Default system instructions. `{current_prompt}` receives the prompt being optimized.
pub const DEFAULT_META_PROMPT: &str = "You are an expert prompt engineer. You improve prompts for language-model \
applications using evaluated predictions: inputs, the predictions the current prompt produced, the reference labels and \
the annotations (scores and comments) left by evaluators and users.

Study where the predictions fall short of the labels and the annotations, then rewrite the prompt so the model does better \
on this task in general, not only on these examples.

The current prompt is:
<current_prompt>
{current_prompt}
</current_prompt>";

const OPTIMIZE_REQUEST: &str = "Given the following annotated/evaluated predictions, optimize the provided prompt.
<annotated_predictions>
{annotated_predictions}
</annotated_predictions>

Remember to first brainstorm, then plan, and finally generate the optimized prompt. Remember to retain all bracketed variable placeholders.

Respond with a single JSON object with exactly these string fields:
- \"task_objective\": What task is this prompt seeking to solve? What defines success here?
- \"brainstorm\": At least 3 bullet points brainstorming how to improve the prompt. Can focus on logical/correctness, style, or any other qualities that are salient, given the provided annotations.
- \"plan\": Proposed edits and citations on which feedback will be improved.
- \"improved_prompt\": The full text of the optimized prompt. Ensure that all the curly bracket {{variable_name}}'s are retained in the new prompt. These are: {input_variables}.";

const FIX_INSTRUCTION: &str = "Respond after fixing all validation errors.";

const PROJECT_RUN_LIMIT: usize = 100;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// System instructions; must contain the `{current_prompt}` placeholder.
    pub meta_prompt: String,
    /// Attempts per proposal, including the first one.
    pub max_attempts: usize,
    /// Token budget of the annotated transcript; leading example blocks are kept while they fit.
    pub max_transcript_tokens: Option<usize>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            meta_prompt: DEFAULT_META_PROMPT.to_string(),
            max_attempts: 3,
            max_transcript_tokens: None,
        }
    }
}

/// The wire shape of an optimizer reply.
#[derive(Debug, Clone, Deserialize)]
struct OptimizerReply {
    task_objective: String,
    brainstorm: String,
    plan: String,
    improved_prompt: String,
}

/// A validated optimizer reply. `improved_prompt` has the placeholders of the prompt it replaces.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerOutput {
    pub task_objective: String,
    pub brainstorm: String,
    pub plan: String,
    pub improved_prompt: PromptTemplate,
}

/// Locates the JSON object in a raw model reply and deserializes it into `T`.
pub fn decode_json<T: DeserializeOwned>(raw: &str) -> Result<T, DecodeError> {
    let value = filter_to_json(raw).map_err(|err| DecodeError::InvalidJson(err.to_string()))?;
    serde_json::from_value(value).map_err(|err| DecodeError::Schema(err.to_string()))
}

/// Decodes a raw model reply and checks it against the `required` placeholder set.
pub fn decode_optimizer_output(raw: &str, required: &BTreeSet<String>) -> Result<OptimizerOutput, DecodeError> {
    let reply: OptimizerReply = decode_json(raw)?;
    let improved_prompt = PromptTemplate::new(reply.improved_prompt).map_err(DecodeError::Syntax)?;
    PlaceholderMismatch::check(required, &improved_prompt.placeholders).map_err(DecodeError::Mismatch)?;
    Ok(OptimizerOutput {
        task_objective: reply.task_objective,
        brainstorm: reply.brainstorm,
        plan: reply.plan,
        improved_prompt,
    })
}

/// Invokes `model` until `decode` accepts a reply, feeding each rejection back as corrective context.
///
/// A failed model call also consumes an attempt. Attempts are strictly sequential.
pub async fn invoke_with_retries<M, T, D>(model: &M, mut messages: Vec<ChatMessage>, max_attempts: usize, decode: D) -> Result<T>
where
    M: ChatModel + ?Sized,
    D: Fn(&str) -> Result<T, DecodeError>,
{
    let max_attempts = max_attempts.max(1);
    let mut last_error = String::new();
    for attempt in 1..=max_attempts {
        let raw = match model.invoke(&messages).await {
            Ok(raw) => raw,
            Err(err) => {
                warn!("model call failed on attempt {}/{}: {:#}", attempt, max_attempts, err);
                last_error = format!("{:#}", err);
                continue;
            }
        };
        debug!("model reply on attempt {}:\n{}", attempt, raw);
        match decode(&raw) {
            Ok(value) => return Ok(value),
            Err(err) => {
                warn!("model reply rejected on attempt {}/{}: {}", attempt, max_attempts, err);
                last_error = err.to_string();
                messages.push(ChatMessage::assistant(raw));
                messages.push(ChatMessage::user(format!("{}\n{}", err, FIX_INSTRUCTION)));
            }
        }
    }
    Err(ExtractionFailed { attempts: max_attempts, last_error }.into())
}

#[cfg(feature = "openai")]
fn default_token_counter() -> Box<dyn CountToken + Send + Sync> {
    match crate::utils::token::tiktoken::Tiktoken::new("gpt-4o") {
        Ok(tiktoken) => Box::new(tiktoken),
        Err(err) => {
            warn!("tiktoken unavailable, counting transcript tokens by chars: {:#}", err);
            Box::new(count_tokens_by_len)
        }
    }
}

#[cfg(not(feature = "openai"))]
fn default_token_counter() -> Box<dyn CountToken + Send + Sync> {
    Box::new(count_tokens_by_len)
}

/// Proposes improved prompts with a chat model.
pub struct PromptOptimizer<M: ChatModel> {
    pub config: OptimizerConfig,
    model: Arc<M>,
    token_counter: Box<dyn CountToken + Send + Sync>,
}

impl<M: ChatModel> PromptOptimizer<M> {
    pub fn new(model: Arc<M>, config: OptimizerConfig) -> Self {
        Self {
            config,
            model,
            token_counter: default_token_counter(),
        }
    }

    /// Count transcript tokens with `counter` instead of characters.
    pub fn with_token_counter(mut self, counter: impl CountToken + Send + Sync + 'static) -> Self {
        self.token_counter = Box::new(counter);
        self
    }

    /// Joins example blocks into a transcript, honoring the token budget.
    pub fn transcript(&self, blocks: &[String]) -> String {
        match self.config.max_transcript_tokens {
            Some(budget) => truncate_blocks(blocks, self.token_counter.as_ref(), budget).join("\n"),
            None => blocks.join("\n"),
        }
    }

    /// Proposes an improved prompt using the configured meta prompt.
    pub async fn propose(&self, current_prompt: &PromptTemplate, annotated_predictions: &str) -> Result<OptimizerOutput> {
        self.propose_with(current_prompt, annotated_predictions, &self.config.meta_prompt).await
    }

    /// Proposes an improved prompt under explicit meta instructions.
    pub async fn propose_with(&self, current_prompt: &PromptTemplate, annotated_predictions: &str, meta_prompt: &str) -> Result<OptimizerOutput> {
        let required = current_prompt.placeholders.clone();
        let messages = Self::build_messages(current_prompt, annotated_predictions, meta_prompt)?;
        let request_tokens: usize = messages.iter().map(|m| self.token_counter.count_msg_token(m)).sum();
        debug!("optimizer request is about {} tokens", request_tokens);
        invoke_with_retries(self.model.as_ref(), messages, self.config.max_attempts, |raw| {
            decode_optimizer_output(raw, &required)
        }).await
    }

    /// Proposes an improved prompt for already evaluated rows.
    pub async fn propose_from_rows(&self, current_prompt: &PromptTemplate, rows: &[ExperimentRow]) -> Result<OptimizerOutput> {
        let transcript = self.transcript(&format_evaluation_results(rows));
        self.propose(current_prompt, &transcript).await
    }

    fn build_messages(current_prompt: &PromptTemplate, annotated_predictions: &str, meta_prompt: &str) -> Result<Vec<ChatMessage>> {
        let meta = PromptTemplate::new(meta_prompt)?;
        let mut system = meta.construct_prompt();
        if meta.placeholders.contains("current_prompt") {
            system.try_fill("current_prompt", current_prompt.str())?;
        }
        let system = system.complete()?;

        let request = PromptTemplate::new(OPTIMIZE_REQUEST)?;
        let input_variables = format!("{:?}", current_prompt.placeholders.iter().collect::<Vec<_>>());
        let user = request
            .construct_prompt()
            .try_fill("annotated_predictions", annotated_predictions)?
            .try_fill("input_variables", input_variables)?
            .complete()?;
        Ok(vec![ChatMessage::system(system), ChatMessage::user(user)])
    }

    /// Optimizes `prompt` from the logged root runs of `project_name` and the feedback attached to them.
    ///
    /// Runs whose reference example cannot be found are skipped.
    pub async fn optimize_over_project(&self,
                                       traces: &dyn TraceStore,
                                       datasets: &dyn DatasetStore,
                                       project_name: &str,
                                       prompt: &PromptTemplate) -> Result<OptimizerOutput> {
        let runs = traces
            .list_runs(&RunQuery::project(project_name).root_only().limit(PROJECT_RUN_LIMIT))
            .await?;
        let example_ids: Vec<String> = runs.iter().filter_map(|run| run.reference_example_id.clone()).collect();
        let examples: HashMap<String, _> = datasets
            .read_examples(&example_ids)
            .await?
            .into_iter()
            .map(|example| (example.id.clone(), example))
            .collect();
        let run_ids: Vec<String> = runs.iter().map(|run| run.id.clone()).collect();
        let mut feedback: HashMap<String, Vec<EvaluationResult>> = HashMap::new();
        for f in traces.list_feedback(&run_ids).await? {
            feedback.entry(f.run_id.clone()).or_default().push(f.into());
        }

        let rows: Vec<ExperimentRow> = runs
            .into_iter()
            .filter_map(|run| {
                let example = run.reference_example_id.as_ref().and_then(|id| examples.get(id))?.clone();
                let evaluation_results = feedback.remove(&run.id).unwrap_or_default();
                let primary_score = evaluation_results.first().and_then(|r| r.score).filter(|s| s.is_finite());
                Some(ExperimentRow { run, example, evaluation_results, evaluator_errors: Vec::new(), primary_score })
            })
            .collect();
        if rows.is_empty() {
            return Err(anyhow!("project {} has no root runs with reference examples", project_name));
        }
        self.propose_from_rows(prompt, &rows).await
    }
}

pub mod errors {
    use std::error::Error;
    use std::fmt;
    use std::fmt::Formatter;

    use crate::prompt::errors::{PlaceholderMismatch, TemplateSyntaxError};

    /// Why a single model reply was rejected.
    #[derive(Debug, Clone, PartialEq)]
    pub enum DecodeError {
        /// No JSON object could be located or parsed in the reply.
        InvalidJson(String),
        /// The JSON object does not have the expected fields.
        Schema(String),
        /// The improved prompt is not a valid template.
        Syntax(TemplateSyntaxError),
        /// The improved prompt does not keep the placeholders.
        Mismatch(PlaceholderMismatch),
    }

    impl fmt::Display for DecodeError {
        fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
            match self {
                DecodeError::InvalidJson(err) => write!(f, "Could not find a valid JSON object in the reply: {}", err),
                DecodeError::Schema(err) => write!(f, "The JSON object does not match the expected fields: {}", err),
                DecodeError::Syntax(err) => write!(f, "improved_prompt is not a valid template: {}", err),
                DecodeError::Mismatch(err) => write!(f, "{}", err),
            }
        }
    }

    impl Error for DecodeError {}

    /// The optimizer did not produce an acceptable reply within the attempt budget.
    #[derive(Debug, Clone)]
    pub struct ExtractionFailed {
        pub attempts: usize,
        pub last_error: String,
    }

    impl fmt::Display for ExtractionFailed {
        fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
            write!(f, "Could not extract in sufficient steps ({} attempts), last error: {}", self.attempts, self.last_error)
        }
    }

    impl Error for ExtractionFailed {}
}

#[cfg(test)]
pub(crate) mod test_optimizer {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use serde_json::json;

    use super::{decode_optimizer_output, DecodeError, ExtractionFailed, OptimizerConfig, PromptOptimizer};
    use crate::evaluation::test_evaluation::EchoChain;
    use crate::evaluation::{EvalConfig, EvaluationHarness};
    use crate::prompt::PromptTemplate;
    use crate::schemas::{EvaluationResult, Example, Run};
    use crate::store::{DatasetStore, InMemoryStore, TraceStore};
    use crate::utils::llm::mock::ScriptedModel;
    use crate::utils::llm::Role;

    pub(crate) fn reply(improved_prompt: &str) -> String {
        json!({
            "task_objective": "Summarize text",
            "brainstorm": "- be concise\n- keep facts\n- no fluff",
            "plan": "Ask for concision",
            "improved_prompt": improved_prompt,
        }).to_string()
    }

    fn required(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_decode_accepts_matching_placeholders() {
        let raw = format!("Sure! Here it is:\n{}", reply("Summarize concisely: {text}"));
        let output = decode_optimizer_output(&raw, &required(&["text"])).unwrap();
        assert_eq!(output.improved_prompt.str(), "Summarize concisely: {text}");
        assert_eq!(output.improved_prompt.placeholders, required(&["text"]));
    }

    #[test]
    fn test_decode_ignores_placeholders_in_prose() {
        let before = format!("I kept the {{text}} placeholder as asked.\n{}", reply("Summarize concisely: {text}"));
        let after = format!("{}\nNote: {{text}} is retained.", reply("Summarize concisely: {text}"));
        for raw in [before, after] {
            let output = decode_optimizer_output(&raw, &required(&["text"])).unwrap();
            assert_eq!(output.improved_prompt.str(), "Summarize concisely: {text}");
        }
    }

    #[test]
    fn test_decode_rejections() {
        let err = decode_optimizer_output(&reply("Summarize: {content}"), &required(&["text"])).unwrap_err();
        match err {
            DecodeError::Mismatch(mismatch) => {
                assert_eq!(mismatch.missing, required(&["text"]));
                assert_eq!(mismatch.extra, required(&["content"]));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(decode_optimizer_output("no json", &required(&[])), Err(DecodeError::InvalidJson(_))));
        assert!(matches!(decode_optimizer_output("{\"plan\": \"x\"}", &required(&[])), Err(DecodeError::Schema(_))));
        assert!(matches!(decode_optimizer_output(&reply("broken {text"), &required(&["text"])), Err(DecodeError::Syntax(_))));
        assert!(matches!(
            decode_optimizer_output(&reply("Summarize: {text} for {audience}"), &required(&["text"])),
            Err(DecodeError::Mismatch(_))
        ));
    }

    #[tokio::test]
    async fn test_propose_retries_with_corrective_context() {
        let model = Arc::new(ScriptedModel::replying([reply("Summarize: {content}"), reply("Summarize concisely: {text}")]));
        let optimizer = PromptOptimizer::new(model.clone(), OptimizerConfig::default());
        let current = PromptTemplate::new("Summarize: {text}").unwrap();
        let output = optimizer.propose(&current, "<example id=0></example>").await.unwrap();
        assert_eq!(output.improved_prompt.str(), "Summarize concisely: {text}");

        let calls = model.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert!(calls[0][0].content.contains("<current_prompt>\nSummarize: {text}\n</current_prompt>"));
        assert!(calls[0][1].content.contains("These are: [\"text\"]"));
        assert!(calls[0][1].content.contains("{variable_name}"));
        assert!(calls[0][1].content.contains("<example id=0></example>"));
        let retry = &calls[1];
        assert_eq!(retry.len(), 4);
        assert_eq!(retry[2].role, Role::Assistant);
        assert_eq!(retry[3].role, Role::User);
        assert!(retry[3].content.contains("Missing: {\"text\"}"));
        assert!(retry[3].content.ends_with("Respond after fixing all validation errors."));
    }

    #[tokio::test]
    async fn test_propose_exhausts_retries() {
        let model = Arc::new(ScriptedModel::replying(vec![reply("Summarize: {content}"); 5]));
        let optimizer = PromptOptimizer::new(model.clone(), OptimizerConfig::default());
        let current = PromptTemplate::new("Summarize: {text}").unwrap();
        let err = optimizer.propose(&current, "").await.unwrap_err();
        let failed = err.downcast_ref::<ExtractionFailed>().unwrap();
        assert_eq!(failed.attempts, 3);
        assert!(failed.last_error.contains("content"));
        assert_eq!(model.call_count(), 3);
    }

    #[tokio::test]
    async fn test_model_errors_consume_attempts() {
        let model = Arc::new(ScriptedModel::new([Err("rate limited".to_string()), Ok(reply("Better: {text}"))]));
        let optimizer = PromptOptimizer::new(model.clone(), OptimizerConfig::default());
        let output = optimizer.propose(&PromptTemplate::new("{text}").unwrap(), "").await.unwrap();
        assert_eq!(output.improved_prompt.str(), "Better: {text}");
        // nothing to correct after a failed call
        assert_eq!(model.calls.lock().unwrap()[1].len(), 2);
    }

    #[tokio::test]
    async fn test_transcript_budget() {
        let model = Arc::new(ScriptedModel::replying(Vec::<String>::new()));
        let config = OptimizerConfig { max_transcript_tokens: Some(10), ..Default::default() };
        let optimizer = PromptOptimizer::new(model, config).with_token_counter(|s: &str| s.split_whitespace().count());
        let blocks = vec!["one two three four five six".to_string(), "seven eight nine ten eleven".to_string()];
        assert_eq!(optimizer.transcript(&blocks), blocks[0]);
    }

    #[tokio::test]
    async fn test_optimize_over_project() {
        let store = Arc::new(InMemoryStore::new().with_dataset("tweets", [
            (json!({"text": "rust 2024"}).as_object().cloned().unwrap(), json!({"output": "Rust 2024 is out!"}).as_object().cloned().unwrap()),
        ]));
        let examples: Vec<Example> = store.list_examples("tweets").await.unwrap();
        let harness = EvaluationHarness::new(EvalConfig::default()).with_trace_store(store.clone());
        let prompt = PromptTemplate::new("Write a tweet about {text}").unwrap();
        let results = harness.evaluate_as("tweet-app", &EchoChain { template: prompt.clone() }, &examples, &[]).await;
        store.create_feedback(&results.rows[0].run.id, EvaluationResult::new("user_score").with_score(0.0).with_comment("too bland")).await.unwrap();
        // a run without a reference example is skipped
        let mut orphan = Run::for_example("tweet-app", &examples[0]);
        orphan.reference_example_id = None;
        store.create_run(orphan).await.unwrap();

        let model = Arc::new(ScriptedModel::replying([reply("Write a punchy tweet about {text}")]));
        let optimizer = PromptOptimizer::new(model.clone(), OptimizerConfig::default());
        let output = optimizer.optimize_over_project(store.as_ref(), store.as_ref(), "tweet-app", &prompt).await.unwrap();
        assert_eq!(output.improved_prompt.str(), "Write a punchy tweet about {text}");

        let transcript = model.calls.lock().unwrap()[0][1].content.clone();
        assert!(transcript.contains("<example id=0>"));
        assert!(!transcript.contains("<example id=1>"));
        assert!(transcript.contains("too bland"));

        let empty = optimizer.optimize_over_project(store.as_ref(), store.as_ref(), "nothing-here", &prompt).await;
        assert!(empty.is_err());
    }
}
