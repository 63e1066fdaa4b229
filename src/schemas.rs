//! Records exchanged with dataset and trace stores.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::utils::JsonMap;

/// Key under which a chain's text output is stored in [Run::outputs].
pub const OUTPUT_KEY: &str = "output";

/// An input/expected-output pair of a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Example {
    pub id: String,
    pub dataset_name: String,
    pub inputs: JsonMap,
    pub outputs: JsonMap,
}

impl Example {
    pub fn new(dataset_name: impl Into<String>, inputs: JsonMap, outputs: JsonMap) -> Self {
        Self {
            id: new_id(),
            dataset_name: dataset_name.into(),
            inputs,
            outputs,
        }
    }
}

/// One execution of a chain against a single example.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub project_name: String,
    #[serde(default)]
    pub reference_example_id: Option<String>,
    pub inputs: JsonMap,
    #[serde(default)]
    pub outputs: Option<JsonMap>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default = "default_true")]
    pub is_root: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl Run {
    /// A root run of `example` in `project_name`, not yet executed.
    pub fn for_example(project_name: impl Into<String>, example: &Example) -> Self {
        Self {
            id: new_id(),
            project_name: project_name.into(),
            reference_example_id: Some(example.id.clone()),
            inputs: example.inputs.clone(),
            outputs: None,
            error: None,
            is_root: true,
            tags: Vec::new(),
        }
    }

    /// Records a successful text output.
    pub fn succeed(&mut self, output: impl Into<String>) {
        let mut outputs = JsonMap::new();
        outputs.insert(OUTPUT_KEY.to_string(), Value::String(output.into()));
        self.outputs = Some(outputs);
        self.error = None;
    }

    /// Records a failure.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.outputs = None;
        self.error = Some(error.into());
    }

    /// The text output, when the run succeeded with one.
    pub fn output_text(&self) -> Option<&str> {
        self.outputs.as_ref()?.get(OUTPUT_KEY)?.as_str()
    }
}

/// A scored and/or commented judgement of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub key: String,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub comment: Option<String>,
}

impl EvaluationResult {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            score: None,
            value: None,
            comment: None,
        }
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }

    pub fn with_value(mut self, value: impl Into<Value>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

/// An [EvaluationResult] persisted against a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub id: String,
    pub run_id: String,
    pub key: String,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub comment: Option<String>,
}

impl Feedback {
    pub fn new(run_id: impl Into<String>, result: EvaluationResult) -> Self {
        Self {
            id: new_id(),
            run_id: run_id.into(),
            key: result.key,
            score: result.score,
            value: result.value,
            comment: result.comment,
        }
    }
}

impl From<Feedback> for EvaluationResult {
    fn from(feedback: Feedback) -> Self {
        Self {
            key: feedback.key,
            score: feedback.score,
            value: feedback.value,
            comment: feedback.comment,
        }
    }
}

/// Filter for listing runs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunQuery {
    pub project_name: String,
    pub is_root: Option<bool>,
    pub limit: Option<usize>,
}

impl RunQuery {
    pub fn project(project_name: impl Into<String>) -> Self {
        Self {
            project_name: project_name.into(),
            ..Default::default()
        }
    }

    pub fn root_only(mut self) -> Self {
        self.is_root = Some(true);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, run: &Run) -> bool {
        run.project_name == self.project_name && self.is_root.map_or(true, |is_root| run.is_root == is_root)
    }
}

pub(crate) fn new_id() -> String {
    Uuid::new_v4().to_string()
}
