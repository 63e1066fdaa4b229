//! Dataset-driven tests: run a test function over every example of a dataset, trace each execution and
//! record a pass/fail verdict as feedback on its run.

use std::future::Future;
use std::process::Command;

use anyhow::{bail, Result};
use lazy_static::lazy_static;
use log::{info, warn};
use tokio::sync::OnceCell;

use crate::schemas::{new_id, EvaluationResult, Example, Run};
use crate::store::{DatasetStore, TraceStore};

/// Tag put on every run recorded by a [DatasetTest].
pub const DATASET_TEST_TAG: &str = "dataset-test";

lazy_static! {
    /// Shared by all dataset tests of one process.
    static ref INVOCATION_ID: String = new_id()[..8].to_string();
    static ref GIT_HASH: OnceCell<String> = OnceCell::new();
}

const UNKNOWN_HASH: &str = "unknown";

fn read_git_short_hash() -> String {
    Command::new("git")
        .args(["rev-parse", "--short=7", "HEAD"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|hash| hash.trim().to_string())
        .filter(|hash| !hash.is_empty())
        .unwrap_or_else(|| UNKNOWN_HASH.to_string())
}

/// Short hash of the current git commit, `"unknown"` outside a repository.
///
/// `git` runs once per process on the blocking pool.
pub async fn git_short_hash() -> &'static str {
    GIT_HASH
        .get_or_init(|| async {
            tokio::task::spawn_blocking(read_git_short_hash).await.unwrap_or_else(|err| {
                warn!("could not resolve the git hash: {}", err);
                UNKNOWN_HASH.to_string()
            })
        })
        .await
        .as_str()
}

pub fn invocation_id() -> &'static str {
    INVOCATION_ID.as_str()
}

#[derive(Debug, Clone)]
pub struct DatasetTest {
    pub name: String,
    pub description: Option<String>,
    pub dataset_name: String,
    /// Runs go to `{name}-{git hash}-{invocation id}` unless set.
    pub project_name: Option<String>,
}

impl DatasetTest {
    pub fn new(name: impl Into<String>, dataset_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            dataset_name: dataset_name.into(),
            project_name: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_project(mut self, project_name: impl Into<String>) -> Self {
        self.project_name = Some(project_name.into());
        self
    }

    pub async fn project(&self) -> String {
        match &self.project_name {
            Some(project_name) => project_name.clone(),
            None => format!("{}-{}-{}", self.name, git_short_hash().await, invocation_id()),
        }
    }

    /// Runs `test_fn` on every example of the dataset in order.
    ///
    /// `test_fn` returns the output under test, or an error when the example fails. A failing example does not
    /// stop the others; the report collects all outcomes.
    pub async fn run<F, Fut>(&self, datasets: &dyn DatasetStore, traces: &dyn TraceStore, test_fn: F) -> Result<TestReport>
    where
        F: Fn(Example) -> Fut,
        Fut: Future<Output=Result<String>>,
    {
        let project_name = self.project().await;
        let examples = datasets.list_examples(&self.dataset_name).await?;
        info!("dataset test {} over {} examples, project {}", self.name, examples.len(), project_name);
        let mut outcomes = Vec::with_capacity(examples.len());
        for example in examples {
            let mut run = Run::for_example(&project_name, &example);
            run.tags = vec![DATASET_TEST_TAG.to_string(), invocation_id().to_string()];
            let example_id = example.id.clone();
            let feedback = match test_fn(example).await {
                Ok(output) => {
                    run.succeed(output);
                    self.verdict(None)
                }
                Err(err) => {
                    warn!("dataset test {} failed on example {}: {:#}", self.name, example_id, err);
                    run.fail(format!("{:#}", err));
                    self.verdict(Some(format!("{:#}", err)))
                }
            };
            traces.create_run(run.clone()).await?;
            traces.create_feedback(&run.id, feedback).await?;
            outcomes.push(TestOutcome { example_id, run_id: run.id, error: run.error });
        }
        Ok(TestReport { project_name, outcomes })
    }

    fn verdict(&self, error: Option<String>) -> EvaluationResult {
        let description = self.description.clone().unwrap_or_default();
        let result = EvaluationResult::new(self.name.as_str());
        match error {
            None => result.with_score(1.0).with_value("Pass").with_comment(description),
            Some(error) => result
                .with_score(0.0)
                .with_value("Fail")
                .with_comment(format!("Failed with error {}\n{}", error, description)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestOutcome {
    pub example_id: String,
    pub run_id: String,
    pub error: Option<String>,
}

impl TestOutcome {
    pub fn passed(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct TestReport {
    pub project_name: String,
    pub outcomes: Vec<TestOutcome>,
}

impl TestReport {
    pub fn passed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.passed()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.passed()
    }

    /// Errors with every failure message when an example failed.
    pub fn assert_all_passed(&self) -> Result<()> {
        let failures: Vec<String> = self
            .outcomes
            .iter()
            .filter_map(|o| o.error.as_ref().map(|e| format!("example {}: {}", o.example_id, e)))
            .collect();
        if !failures.is_empty() {
            bail!("{} of {} examples failed:\n{}", failures.len(), self.outcomes.len(), failures.join("\n"));
        }
        Ok(())
    }
}
