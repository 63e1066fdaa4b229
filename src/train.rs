//! # Training loop
//!
//! Hill-climbing over prompts: each step evaluates the current prompt on a train sample, asks the
//! [PromptOptimizer] for a revision and scores the revision on an eval sample. The loop always continues from the
//! latest revision; the best candidate is tracked separately and reported in the [TrainingHistory].

use std::cmp::Ordering;
use std::sync::Arc;

use anyhow::Result;
use log::{debug, info};
use serde::Deserialize;

use crate::chain::Chain;
use crate::evaluation::{EvaluationHarness, Evaluator};
use crate::optimizer::PromptOptimizer;
use crate::prompt::PromptTemplate;
use crate::schemas::Example;
use crate::store::DatasetStore;
use crate::utils::diff::{diff_words, summarize};
use crate::utils::llm::ChatModel;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Number of optimization steps.
    pub steps: usize,
    /// Examples taken from the head of the train dataset.
    pub train_sample_size: usize,
    /// Examples taken from the head of the eval dataset.
    pub eval_sample_size: usize,
    /// Print a prompt diff after every step (needs the `terminal_printing` feature).
    pub print_diffs: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            steps: 5,
            train_sample_size: 15,
            eval_sample_size: 15,
            print_diffs: false,
        }
    }
}

/// A prompt evaluated at some step. Step 0 is the seed prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub step: usize,
    pub score: Option<f64>,
    pub prompt: PromptTemplate,
}

/// Result of [Trainer::train].
#[derive(Debug, Clone)]
#[readonly::make]
pub struct TrainingHistory {
    /// All candidates, best first. Ties keep step order and absent scores come last.
    #[readonly]
    pub candidates: Vec<Candidate>,
    #[readonly]
    pub best_score: Option<f64>,
    #[readonly]
    pub best_step: usize,
}

impl TrainingHistory {
    fn new(mut candidates: Vec<Candidate>, best_score: Option<f64>, best_step: usize) -> Self {
        // stable: equal scores keep step order
        candidates.sort_by(|a, b| compare_desc(a.score, b.score));
        Self {
            candidates,
            best_score,
            best_step,
        }
    }

    /// The best candidate.
    pub fn best(&self) -> Option<&Candidate> {
        self.candidates.first()
    }
}

/// Non-finite scores count as absent.
fn finite(score: Option<f64>) -> Option<f64> {
    score.filter(|s| s.is_finite())
}

fn compare_desc(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (finite(a), finite(b)) {
        (Some(a), Some(b)) => b.total_cmp(&a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Strict improvement. An absent score never improves and any present score beats an absent best.
pub(crate) fn improves(candidate: Option<f64>, best: Option<f64>) -> bool {
    match (finite(candidate), finite(best)) {
        (Some(candidate), Some(best)) => candidate > best,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

fn score_text(score: Option<f64>) -> String {
    score.map_or_else(|| "none".to_string(), |s| format!("{:.4}", s))
}

pub struct Trainer<M: ChatModel> {
    pub config: TrainConfig,
    datasets: Arc<dyn DatasetStore>,
    harness: EvaluationHarness,
    optimizer: PromptOptimizer<M>,
}

impl<M: ChatModel> Trainer<M> {
    pub fn new(config: TrainConfig, datasets: Arc<dyn DatasetStore>, harness: EvaluationHarness, optimizer: PromptOptimizer<M>) -> Self {
        Self {
            config,
            datasets,
            harness,
            optimizer,
        }
    }

    async fn sample(&self, dataset_name: &str, size: usize) -> Result<Vec<Example>> {
        let mut examples = self.datasets.list_examples(dataset_name).await?;
        examples.truncate(size);
        Ok(examples)
    }

    /// Mean primary score of the chain built from `prompt`.
    pub async fn eval_score<F, C>(&self, constructor: &F, prompt: &PromptTemplate, examples: &[Example], evaluators: &[Box<dyn Evaluator>]) -> Option<f64>
    where
        F: Fn(&PromptTemplate) -> C,
        C: Chain,
    {
        self.harness.score(prompt, constructor, examples, evaluators).await
    }

    /// One optimization step: evaluate `current` on the train sample and propose a revision.
    pub async fn step<F, C>(&self,
                            step_idx: usize,
                            constructor: &F,
                            current: &PromptTemplate,
                            train_examples: &[Example],
                            evaluators: &[Box<dyn Evaluator>]) -> Result<PromptTemplate>
    where
        F: Fn(&PromptTemplate) -> C,
        C: Chain,
    {
        let chain = constructor(current);
        let results = self.harness.evaluate(&chain, train_examples, evaluators).await;
        let output = self.optimizer.propose_from_rows(current, &results.rows).await?;
        let updated = output.improved_prompt;

        let (inserted, deleted) = summarize(&diff_words(current.str(), updated.str()));
        debug!("step {}: {} words inserted, {} words deleted", step_idx, inserted, deleted);
        #[cfg(feature = "terminal_printing")]
        if self.config.print_diffs {
            crate::utils::printing::print_prompt_diff(&format!("Updated Prompt (Step {})", step_idx), current.str(), updated.str());
        }
        Ok(updated)
    }

    /// Runs [TrainConfig::steps] optimization steps starting from `original`.
    ///
    /// Fails when a dataset cannot be read or the optimizer cannot produce a valid revision.
    pub async fn train<F, C>(&self,
                             constructor: F,
                             original: &PromptTemplate,
                             train_dataset: &str,
                             eval_dataset: &str,
                             evaluators: &[Box<dyn Evaluator>]) -> Result<TrainingHistory>
    where
        F: Fn(&PromptTemplate) -> C,
        C: Chain,
    {
        let train_examples = self.sample(train_dataset, self.config.train_sample_size).await?;
        let eval_examples = self.sample(eval_dataset, self.config.eval_sample_size).await?;

        let mut best_score = self.eval_score(&constructor, original, &eval_examples, evaluators).await;
        let mut best_step = 0;
        info!("Seed prompt score: {}", score_text(best_score));
        let mut candidates = Vec::with_capacity(self.config.steps + 1);
        candidates.push(Candidate { step: 0, score: best_score, prompt: original.clone() });

        let mut current = original.clone();
        for step_idx in 0..self.config.steps {
            let updated = self.step(step_idx, &constructor, &current, &train_examples, evaluators).await?;
            let score = self.eval_score(&constructor, &updated, &eval_examples, evaluators).await;
            if improves(score, best_score) {
                info!("New best score {} > {}. Updating selected prompt.", score_text(score), score_text(best_score));
                best_score = score;
                best_step = step_idx + 1;
            } else {
                info!("Underperformed ({} <= {}). Continuing", score_text(score), score_text(best_score));
            }
            candidates.push(Candidate { step: step_idx + 1, score, prompt: updated.clone() });
            current = updated;
        }
        info!("Best overall score: {}", score_text(best_score));
        info!("Best step: {}", best_step);
        Ok(TrainingHistory::new(candidates, best_score, best_step))
    }
}

#[cfg(test)]
mod test_train {
    use std::sync::Arc;

    use anyhow::{bail, Result};
    use serde_json::json;

    use super::{improves, Candidate, TrainConfig, Trainer, TrainingHistory};
    use crate::evaluation::test_evaluation::{boxed, EchoChain};
    use crate::evaluation::{EvalConfig, EvaluationHarness};
    use crate::optimizer::test_optimizer::reply;
    use crate::optimizer::{ExtractionFailed, OptimizerConfig, PromptOptimizer};
    use crate::prompt::PromptTemplate;
    use crate::schemas::{EvaluationResult, Example, Run};
    use crate::store::{DatasetNotFound, InMemoryStore};
    use crate::utils::llm::mock::ScriptedModel;
    use crate::utils::JsonMap;

    fn store() -> Arc<InMemoryStore> {
        let pair = |text: &str| -> (JsonMap, JsonMap) {
            (json!({"text": text}).as_object().cloned().unwrap(), json!({"summary": text}).as_object().cloned().unwrap())
        };
        Arc::new(InMemoryStore::new()
            .with_dataset("train", [pair("a long text"), pair("another long text")])
            .with_dataset("eval", [pair("held out text")]))
    }

    fn trainer(model: Arc<ScriptedModel>, steps: usize) -> Trainer<ScriptedModel> {
        Trainer::new(
            TrainConfig { steps, ..Default::default() },
            store(),
            EvaluationHarness::new(EvalConfig::default()),
            PromptOptimizer::new(model, OptimizerConfig::default()),
        )
    }

    fn concision(run: &Run, _: &Example) -> Result<EvaluationResult> {
        let score = if run.output_text().unwrap_or_default().contains("concisely") { 0.7 } else { 0.4 };
        Ok(EvaluationResult::new("concision").with_score(score))
    }

    fn echo(prompt: &PromptTemplate) -> EchoChain {
        EchoChain { template: prompt.clone() }
    }

    #[test]
    fn test_history_order_is_total() {
        let prompt = PromptTemplate::new("{text}").unwrap();
        let candidates = [Some(0.4), Some(f64::NAN), None, Some(0.7), Some(0.4)]
            .into_iter()
            .enumerate()
            .map(|(step, score)| Candidate { step, score, prompt: prompt.clone() })
            .collect();
        let history = TrainingHistory::new(candidates, Some(0.7), 3);
        let steps: Vec<usize> = history.candidates.iter().map(|c| c.step).collect();
        // NaN ranks with the absent scores, after every number
        assert_eq!(steps, vec![3, 0, 4, 1, 2]);
    }

    #[test]
    fn test_improves() {
        assert!(improves(Some(0.5), Some(0.4)));
        assert!(!improves(Some(0.4), Some(0.4)));
        assert!(!improves(None, Some(0.4)));
        assert!(!improves(None, None));
        assert!(improves(Some(0.0), None));
        assert!(!improves(Some(f64::NAN), None));
        assert!(improves(Some(0.1), Some(f64::NAN)));
    }

    #[tokio::test]
    async fn test_train_picks_better_revision() {
        let model = Arc::new(ScriptedModel::replying([reply("Summarize concisely: {text}")]));
        let trainer = trainer(model.clone(), 1);
        let seed = PromptTemplate::new("Summarize: {text}").unwrap();
        let history = trainer.train(echo, &seed, "train", "eval", &[boxed(concision)]).await.unwrap();

        assert_eq!(history.best_score, Some(0.7));
        assert_eq!(history.best_step, 1);
        let ranked: Vec<(Option<f64>, &str)> = history.candidates.iter().map(|c| (c.score, c.prompt.str())).collect();
        assert_eq!(ranked, vec![(Some(0.7), "Summarize concisely: {text}"), (Some(0.4), "Summarize: {text}")]);
        assert_eq!(history.best().unwrap().step, history.best_step);
        // the optimizer saw the train rows
        assert!(model.calls.lock().unwrap()[0][1].content.contains("another long text"));
    }

    #[tokio::test]
    async fn test_ties_keep_earliest() {
        let model = Arc::new(ScriptedModel::replying([
            reply("Summarize concisely: {text}"),
            reply("Please summarize concisely: {text}"),
            reply("Summarize: {text}"),
        ]));
        let trainer = trainer(model, 3);
        let seed = PromptTemplate::new("Summarize: {text}").unwrap();
        let history = trainer.train(echo, &seed, "train", "eval", &[boxed(concision)]).await.unwrap();

        assert_eq!(history.candidates.len(), 4);
        assert_eq!(history.best_step, 1);
        let steps: Vec<usize> = history.candidates.iter().map(|c| c.step).collect();
        assert_eq!(steps, vec![1, 2, 0, 3]);
    }

    #[tokio::test]
    async fn test_absent_scores_sort_last() {
        let model = Arc::new(ScriptedModel::replying([reply("Summarize concisely: {text}")]));
        let trainer = trainer(model, 1);
        let only_concise = |run: &Run, _: &Example| -> Result<EvaluationResult> {
            match run.output_text() {
                Some(text) if text.contains("concisely") => Ok(EvaluationResult::new("c").with_score(0.1)),
                _ => bail!("not concise"),
            }
        };
        let seed = PromptTemplate::new("Summarize: {text}").unwrap();
        let history = trainer.train(echo, &seed, "train", "eval", &[boxed(only_concise)]).await.unwrap();
        assert_eq!(history.best_score, Some(0.1));
        assert_eq!(history.best_step, 1);
        assert_eq!(history.candidates[1].score, None);
    }

    #[tokio::test]
    async fn test_rejected_reply_is_retried_within_step() {
        let steps = 1;
        let model = Arc::new(ScriptedModel::replying([reply("Summarize: {content}"), reply("Summarize concisely: {text}")]));
        let trainer = trainer(model.clone(), steps);
        let seed = PromptTemplate::new("Summarize: {text}").unwrap();
        let history = trainer.train(echo, &seed, "train", "eval", &[boxed(concision)]).await.unwrap();

        assert_eq!(history.candidates.len(), steps + 1);
        assert_eq!(model.call_count(), steps + 1);
        assert_eq!(history.best_step, 1);
        assert_eq!(history.best().unwrap().prompt.str(), "Summarize concisely: {text}");
        // the retry carried the rejected reply and its error
        let retry = model.calls.lock().unwrap()[1].clone();
        assert_eq!(retry.len(), 4);
        assert!(retry[3].content.contains("content"));
    }

    #[tokio::test]
    async fn test_extraction_failure_aborts() {
        let model = Arc::new(ScriptedModel::replying(vec![reply("Summarize: {content}"); 3]));
        let trainer = trainer(model.clone(), 2);
        let seed = PromptTemplate::new("Summarize: {text}").unwrap();
        let err = trainer.train(echo, &seed, "train", "eval", &[boxed(concision)]).await.unwrap_err();
        assert!(err.downcast_ref::<ExtractionFailed>().is_some());
        assert_eq!(model.call_count(), 3);
    }

    #[tokio::test]
    async fn test_missing_dataset() {
        let trainer = trainer(Arc::new(ScriptedModel::replying(Vec::<String>::new())), 1);
        let seed = PromptTemplate::new("Summarize: {text}").unwrap();
        let err = trainer.train(echo, &seed, "nope", "eval", &[boxed(concision)]).await.unwrap_err();
        assert!(err.downcast_ref::<DatasetNotFound>().is_some());
    }
}
