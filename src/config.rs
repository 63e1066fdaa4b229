//! Settings of all components in one JSON document. Every section and field is optional.
//!
//! ```json
//! {
//!     "eval": {"max_concurrency": 8},
//!     "optimizer": {"max_attempts": 5},
//!     "train": {"steps": 3, "print_diffs": true},
//!     "conversation": {"model": "gpt-4o-mini", "backoff": {"max_retries": 5}}
//! }
//! ```

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::evaluation::EvalConfig;
use crate::optimizer::OptimizerConfig;
use crate::train::TrainConfig;
#[cfg(feature = "openai")]
use crate::utils::llm::openai::ConversationConfig;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub eval: EvalConfig,
    pub optimizer: OptimizerConfig,
    pub train: TrainConfig,
    #[cfg(feature = "openai")]
    pub conversation: ConversationConfig,
}

impl Settings {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).with_context(|| format!("failed to read settings from {}", path.display()))?;
        Self::from_json_str(&json).with_context(|| format!("invalid settings in {}", path.display()))
    }
}
