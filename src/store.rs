//! Dataset and trace stores.
//!
//! The optimizer never owns persistence: examples live in a [DatasetStore], runs and feedback in a [TraceStore].
//! Both are passed explicitly to the components that need them. [InMemoryStore] implements both and is handy
//! for demos, tests and offline experiments.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::error::Error;
use std::fmt;
use std::fmt::Formatter;
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::schemas::{EvaluationResult, Example, Feedback, Run, RunQuery};
use crate::utils::JsonMap;

#[async_trait]
pub trait DatasetStore: Send + Sync {
    /// All examples of a dataset in insertion order.
    async fn list_examples(&self, dataset_name: &str) -> Result<Vec<Example>>;

    /// Examples by id. Unknown ids are skipped.
    async fn read_examples(&self, example_ids: &[String]) -> Result<Vec<Example>>;

    async fn has_dataset(&self, dataset_name: &str) -> Result<bool>;

    async fn create_dataset(&self, dataset_name: &str) -> Result<()>;

    /// Appends an example. Fails with [DatasetNotFound] when the dataset does not exist.
    async fn create_example(&self, inputs: JsonMap, outputs: JsonMap, dataset_name: &str) -> Result<Example>;
}

#[async_trait]
pub trait TraceStore: Send + Sync {
    async fn create_run(&self, run: Run) -> Result<()>;

    async fn list_runs(&self, query: &RunQuery) -> Result<Vec<Run>>;

    async fn create_feedback(&self, run_id: &str, result: EvaluationResult) -> Result<Feedback>;

    async fn list_feedback(&self, run_ids: &[String]) -> Result<Vec<Feedback>>;
}

/// Error when an operation targets a dataset that does not exist.
#[derive(Debug, Clone)]
pub struct DatasetNotFound {
    pub dataset_name: String,
}

impl fmt::Display for DatasetNotFound {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "DatasetNotFound: no dataset named {}", self.dataset_name)
    }
}

impl Error for DatasetNotFound {}

/// A process-local store of datasets, runs and feedback.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    datasets: RwLock<BTreeMap<String, Vec<Example>>>,
    runs: RwLock<Vec<Run>>,
    feedback: RwLock<Vec<Feedback>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates (or extends) a dataset from `(inputs, outputs)` pairs.
    pub fn with_dataset(self, dataset_name: &str, examples: impl IntoIterator<Item=(JsonMap, JsonMap)>) -> Self {
        if let Ok(mut datasets) = self.datasets.write() {
            let entries = datasets.entry(dataset_name.to_string()).or_default();
            entries.extend(examples.into_iter().map(|(inputs, outputs)| Example::new(dataset_name, inputs, outputs)));
        }
        self
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("in-memory store lock poisoned")
}

#[async_trait]
impl DatasetStore for InMemoryStore {
    async fn list_examples(&self, dataset_name: &str) -> Result<Vec<Example>> {
        let datasets = self.datasets.read().map_err(poisoned)?;
        datasets
            .get(dataset_name)
            .cloned()
            .ok_or_else(|| DatasetNotFound { dataset_name: dataset_name.to_string() }.into())
    }

    async fn read_examples(&self, example_ids: &[String]) -> Result<Vec<Example>> {
        let datasets = self.datasets.read().map_err(poisoned)?;
        let by_id: HashMap<&str, &Example> = datasets
            .values()
            .flatten()
            .map(|example| (example.id.as_str(), example))
            .collect();
        Ok(example_ids
            .iter()
            .filter_map(|id| by_id.get(id.as_str()).map(|example| (*example).clone()))
            .collect())
    }

    async fn has_dataset(&self, dataset_name: &str) -> Result<bool> {
        Ok(self.datasets.read().map_err(poisoned)?.contains_key(dataset_name))
    }

    async fn create_dataset(&self, dataset_name: &str) -> Result<()> {
        self.datasets.write().map_err(poisoned)?.entry(dataset_name.to_string()).or_default();
        Ok(())
    }

    async fn create_example(&self, inputs: JsonMap, outputs: JsonMap, dataset_name: &str) -> Result<Example> {
        let mut datasets = self.datasets.write().map_err(poisoned)?;
        let examples = datasets
            .get_mut(dataset_name)
            .ok_or_else(|| DatasetNotFound { dataset_name: dataset_name.to_string() })?;
        let example = Example::new(dataset_name, inputs, outputs);
        examples.push(example.clone());
        Ok(example)
    }
}

#[async_trait]
impl TraceStore for InMemoryStore {
    async fn create_run(&self, run: Run) -> Result<()> {
        self.runs.write().map_err(poisoned)?.push(run);
        Ok(())
    }

    async fn list_runs(&self, query: &RunQuery) -> Result<Vec<Run>> {
        let runs = self.runs.read().map_err(poisoned)?;
        let matching = runs.iter().filter(|run| query.matches(run)).cloned();
        Ok(match query.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        })
    }

    async fn create_feedback(&self, run_id: &str, result: EvaluationResult) -> Result<Feedback> {
        let feedback = Feedback::new(run_id, result);
        self.feedback.write().map_err(poisoned)?.push(feedback.clone());
        Ok(feedback)
    }

    async fn list_feedback(&self, run_ids: &[String]) -> Result<Vec<Feedback>> {
        let wanted: HashSet<&str> = run_ids.iter().map(String::as_str).collect();
        let feedback = self.feedback.read().map_err(poisoned)?;
        Ok(feedback.iter().filter(|f| wanted.contains(f.run_id.as_str())).cloned().collect())
    }
}
