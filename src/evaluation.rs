//! # Evaluation
//!
//! The [EvaluationHarness] runs a chain over a list of examples, records one [Run] per example and applies every
//! [Evaluator] to it. The first evaluator is the *primary* one: the mean of its scores is the quality of the prompt
//! the chain was built from.
//!
//! LLM calls are unreliable, so failures are contained per example:
//! * a failing chain call is recorded on the run and evaluation continues,
//! * a failing evaluator leaves its result absent for that example only.
//!
//! Examples can be processed concurrently, but rows always come back in example order.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use log::{info, warn};
use serde::Deserialize;

use crate::chain::Chain;
use crate::prompt::PromptTemplate;
use crate::schemas::{new_id, EvaluationResult, Example, Run};
use crate::store::TraceStore;

/// Scores a run against the example it was produced from.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, run: &Run, example: &Example) -> Result<EvaluationResult>;
}

/// Blanket impl of Evaluator for plain functions and closures.
#[async_trait]
impl<F> Evaluator for F where F: Fn(&Run, &Example) -> Result<EvaluationResult> + Send + Sync {
    async fn evaluate(&self, run: &Run, example: &Example) -> Result<EvaluationResult> {
        self(run, example)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    /// Prefix of generated experiment (project) names.
    pub experiment_prefix: String,
    /// Only the first `max_examples` examples are evaluated when set.
    pub max_examples: Option<usize>,
    /// Upper bound of chain calls in flight.
    pub max_concurrency: usize,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            experiment_prefix: "prompt-optim".to_string(),
            max_examples: None,
            max_concurrency: 4,
        }
    }
}

/// Outcome of one example.
#[derive(Debug, Clone)]
pub struct ExperimentRow {
    pub run: Run,
    pub example: Example,
    /// Results of the evaluators that succeeded, in evaluator order.
    pub evaluation_results: Vec<EvaluationResult>,
    /// Error messages of the evaluators that failed.
    pub evaluator_errors: Vec<String>,
    /// Score of the primary evaluator, absent when it failed or gave no finite score.
    pub primary_score: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct ExperimentResults {
    pub experiment_name: String,
    pub rows: Vec<ExperimentRow>,
}

impl ExperimentResults {
    pub fn primary_scores(&self) -> Vec<Option<f64>> {
        self.rows.iter().map(|row| row.primary_score).collect()
    }

    /// Mean of the present primary scores, `None` when there is none.
    pub fn mean_score(&self) -> Option<f64> {
        let scores: Vec<f64> = self.rows.iter().filter_map(|row| row.primary_score).collect();
        if scores.is_empty() {
            None
        } else {
            Some(scores.iter().sum::<f64>() / scores.len() as f64)
        }
    }
}

pub struct EvaluationHarness {
    pub config: EvalConfig,
    trace_store: Option<Arc<dyn TraceStore>>,
}

impl EvaluationHarness {
    pub fn new(config: EvalConfig) -> Self {
        Self {
            config,
            trace_store: None,
        }
    }

    /// Emit runs and feedback to `store`. Writes are best-effort.
    pub fn with_trace_store(mut self, store: Arc<dyn TraceStore>) -> Self {
        self.trace_store = Some(store);
        self
    }

    /// A fresh experiment name from the configured prefix.
    pub fn experiment_name(&self) -> String {
        format!("{}-{}", self.config.experiment_prefix, &new_id()[..8])
    }

    /// Evaluates `chain` under a generated experiment name.
    pub async fn evaluate<C: Chain + ?Sized>(&self, chain: &C, examples: &[Example], evaluators: &[Box<dyn Evaluator>]) -> ExperimentResults {
        let name = self.experiment_name();
        self.evaluate_as(&name, chain, examples, evaluators).await
    }

    /// Evaluates `chain` on `examples`, recording runs under `experiment_name`.
    pub async fn evaluate_as<C: Chain + ?Sized>(&self,
                                                experiment_name: &str,
                                                chain: &C,
                                                examples: &[Example],
                                                evaluators: &[Box<dyn Evaluator>]) -> ExperimentResults {
        let examples = match self.config.max_examples {
            Some(max) if max < examples.len() => &examples[..max],
            _ => examples,
        };
        info!("running experiment {} over {} examples", experiment_name, examples.len());
        let rows = stream::iter(examples)
            .map(|example| self.run_example(experiment_name, chain, example, evaluators))
            .buffered(self.config.max_concurrency.max(1))
            .collect::<Vec<_>>()
            .await;
        ExperimentResults {
            experiment_name: experiment_name.to_string(),
            rows,
        }
    }

    /// Builds a chain from `prompt` and returns its mean primary score on `examples`.
    pub async fn score<F, C>(&self, prompt: &PromptTemplate, constructor: F, examples: &[Example], evaluators: &[Box<dyn Evaluator>]) -> Option<f64>
    where
        F: Fn(&PromptTemplate) -> C,
        C: Chain,
    {
        let chain = constructor(prompt);
        self.evaluate(&chain, examples, evaluators).await.mean_score()
    }

    async fn run_example<C: Chain + ?Sized>(&self,
                                            experiment_name: &str,
                                            chain: &C,
                                            example: &Example,
                                            evaluators: &[Box<dyn Evaluator>]) -> ExperimentRow {
        let mut run = Run::for_example(experiment_name, example);
        match chain.invoke(&example.inputs).await {
            Ok(output) => run.succeed(output),
            Err(err) => {
                warn!("chain failed on example {}: {:#}", example.id, err);
                run.fail(format!("{:#}", err));
            }
        }
        self.emit_run(&run).await;

        let mut evaluation_results = Vec::with_capacity(evaluators.len());
        let mut evaluator_errors = Vec::new();
        let mut primary_score = None;
        for (idx, evaluator) in evaluators.iter().enumerate() {
            match evaluator.evaluate(&run, example).await {
                Ok(result) => {
                    if idx == 0 {
                        primary_score = result.score.filter(|s| s.is_finite());
                    }
                    self.emit_feedback(&run.id, &result).await;
                    evaluation_results.push(result);
                }
                Err(err) => {
                    warn!("evaluator {} failed on example {}: {:#}", idx, example.id, err);
                    evaluator_errors.push(format!("{:#}", err));
                }
            }
        }
        ExperimentRow {
            run,
            example: example.clone(),
            evaluation_results,
            evaluator_errors,
            primary_score,
        }
    }

    async fn emit_run(&self, run: &Run) {
        if let Some(store) = &self.trace_store {
            if let Err(err) = store.create_run(run.clone()).await {
                warn!("failed to record run {}: {:#}", run.id, err);
            }
        }
    }

    async fn emit_feedback(&self, run_id: &str, result: &EvaluationResult) {
        if let Some(store) = &self.trace_store {
            if let Err(err) = store.create_feedback(run_id, result.clone()).await {
                warn!("failed to record feedback {} for run {}: {:#}", result.key, run_id, err);
            }
        }
    }
}
