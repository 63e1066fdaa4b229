pub mod llm;
pub mod postprocess;
pub mod token;
pub mod retry;
pub mod diff;
pub mod prompt_processing;
#[cfg(feature = "terminal_printing")]
pub mod printing;

use serde_json::{Map, Value};

pub type JsonMap = Map<String, Value>;
