//! In-app feedback and few-shot datasets.
//!
//! Users rate responses with thumbs up or down. The rating is stored as feedback on the run, and a thumbs-up
//! on a response the user also approved (possibly after editing) is kept as an input/output pair in a dataset.
//! Approved pairs are sampled back into the prompt as few-shot examples.

use std::sync::Arc;

use anyhow::Result;
use log::info;
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::Value;

use crate::schemas::{EvaluationResult, Example};
use crate::store::{DatasetNotFound, DatasetStore, TraceStore};
use crate::utils::JsonMap;

/// Input key of approved examples.
pub const INPUT_KEY: &str = "input";
/// Output key of approved examples.
pub const OUTPUT_KEY: &str = "output";
/// Default number of sampled few-shot examples.
pub const DEFAULT_FEW_SHOTS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Thumbs {
    Up,
    Down,
}

impl Thumbs {
    pub fn score(self) -> f64 {
        match self {
            Thumbs::Up => 1.0,
            Thumbs::Down => 0.0,
        }
    }
}

/// Records user ratings and keeps approved examples in a dataset.
pub struct FeedbackCollector {
    datasets: Arc<dyn DatasetStore>,
    traces: Arc<dyn TraceStore>,
    pub dataset_name: String,
}

impl FeedbackCollector {
    pub fn new(datasets: Arc<dyn DatasetStore>, traces: Arc<dyn TraceStore>, dataset_name: impl Into<String>) -> Self {
        Self {
            datasets,
            traces,
            dataset_name: dataset_name.into(),
        }
    }

    /// Stores the rating of run `run_id` under `key`.
    ///
    /// On a thumbs-up with both `original_input` and `approved_output`, the pair is appended to the approved
    /// dataset, which is created on first use. Returns the example when one was added.
    pub async fn record(&self,
                        run_id: &str,
                        key: &str,
                        thumbs: Thumbs,
                        comment: Option<&str>,
                        original_input: Option<&str>,
                        approved_output: Option<&str>) -> Result<Option<Example>> {
        let mut result = EvaluationResult::new(key).with_score(thumbs.score());
        if let Some(comment) = comment {
            result = result.with_comment(comment);
        }
        self.traces.create_feedback(run_id, result).await?;

        match (thumbs, original_input, approved_output) {
            (Thumbs::Up, Some(input), Some(output)) => Ok(Some(self.add_example(input, output).await?)),
            _ => Ok(None),
        }
    }

    async fn add_example(&self, input: &str, output: &str) -> Result<Example> {
        let mut inputs = JsonMap::new();
        inputs.insert(INPUT_KEY.to_string(), Value::String(input.to_string()));
        let mut outputs = JsonMap::new();
        outputs.insert(OUTPUT_KEY.to_string(), Value::String(output.to_string()));

        match self.datasets.create_example(inputs.clone(), outputs.clone(), &self.dataset_name).await {
            Err(err) if err.downcast_ref::<DatasetNotFound>().is_some() => {
                info!("creating dataset {}", self.dataset_name);
                self.datasets.create_dataset(&self.dataset_name).await?;
                self.datasets.create_example(inputs, outputs, &self.dataset_name).await
            }
            other => other,
        }
    }

    /// Up to `k` approved examples sampled without replacement, rendered as a prompt section.
    ///
    /// Empty when the dataset is missing or has no examples.
    pub async fn few_shot_examples<R: Rng + ?Sized>(&self, k: usize, rng: &mut R) -> Result<String> {
        if !self.datasets.has_dataset(&self.dataset_name).await? {
            return Ok(String::new());
        }
        let examples = self.datasets.list_examples(&self.dataset_name).await?;
        if examples.is_empty() {
            return Ok(String::new());
        }
        let sampled = examples
            .choose_multiple(rng, k)
            .map(format_example)
            .collect::<Vec<_>>()
            .join("\n");
        Ok(format!("\n\nApproved Examples:\n{}\n", sampled))
    }
}

fn text_of(map: &JsonMap, key: &str) -> String {
    match map.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

/// Renders an approved example as an `<example>` block.
pub fn format_example(example: &Example) -> String {
    format!(
        "<example>\n    <original>\n    {}\n    </original>\n    <approved>\n    {}\n    </approved>\n</example>",
        text_of(&example.inputs, INPUT_KEY),
        text_of(&example.outputs, OUTPUT_KEY),
    )
}

#[cfg(test)]
mod test_fewshot {
    use std::sync::Arc;

    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::{format_example, FeedbackCollector, Thumbs};
    use crate::schemas::Example;
    use crate::store::{DatasetStore, InMemoryStore, TraceStore};

    fn collector(store: &Arc<InMemoryStore>) -> FeedbackCollector {
        FeedbackCollector::new(store.clone(), store.clone(), "Tweet Critic")
    }

    #[tokio::test]
    async fn test_record_creates_dataset() {
        let store = Arc::new(InMemoryStore::new());
        let collector = collector(&store);
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(collector.few_shot_examples(10, &mut rng).await.unwrap(), "");

        let added = collector
            .record("run-1", "user_score", Thumbs::Up, Some("nice"), Some("rust is fast"), Some("Rust is blazingly fast!"))
            .await
            .unwrap();
        assert!(added.is_some());
        assert!(store.has_dataset("Tweet Critic").await.unwrap());

        // thumbs-down and incomplete pairs only leave feedback
        collector.record("run-2", "user_score", Thumbs::Down, None, Some("a"), Some("b")).await.unwrap();
        collector.record("run-3", "user_score", Thumbs::Up, None, Some("a"), None).await.unwrap();
        assert_eq!(store.list_examples("Tweet Critic").await.unwrap().len(), 1);

        let feedback = store.list_feedback(&["run-1".to_string(), "run-2".to_string()]).await.unwrap();
        let scores: Vec<Option<f64>> = feedback.iter().map(|f| f.score).collect();
        assert_eq!(scores, vec![Some(1.0), Some(0.0)]);
        assert_eq!(feedback[0].comment.as_deref(), Some("nice"));
    }

    #[tokio::test]
    async fn test_few_shot_block() {
        let store = Arc::new(InMemoryStore::new());
        let collector = collector(&store);
        store.create_dataset("Tweet Critic").await.unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(collector.few_shot_examples(10, &mut rng).await.unwrap(), "");

        for i in 0..5 {
            collector.record("r", "k", Thumbs::Up, None, Some(&format!("in {}", i)), Some(&format!("out {}", i))).await.unwrap();
        }
        let block = collector.few_shot_examples(3, &mut rng).await.unwrap();
        assert!(block.starts_with("\n\nApproved Examples:\n<example>"));
        assert!(block.ends_with("</example>\n"));
        assert_eq!(block.matches("<example>").count(), 3);

        let all = collector.few_shot_examples(10, &mut rng).await.unwrap();
        assert_eq!(all.matches("<example>").count(), 5);
    }

    #[test]
    fn test_format_example() {
        let example = Example::new(
            "d",
            serde_json::json!({"input": "orig"}).as_object().cloned().unwrap(),
            serde_json::json!({"output": "approved"}).as_object().cloned().unwrap(),
        );
        assert_eq!(
            format_example(&example),
            "<example>\n    <original>\n    orig\n    </original>\n    <approved>\n    approved\n    </approved>\n</example>"
        );
    }
}
