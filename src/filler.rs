use serde_json::Value;

use crate::prompt::PartialPrompt;
use crate::utils::JsonMap;
use anyhow::{anyhow, Result};

pub trait FillPlaceholders {
    fn placeholders_to_fill(&self) -> &Vec<String>;
}

pub trait FillWith<CTX>: FillPlaceholders {
    fn fill_with(&self, partial_prompt: &mut PartialPrompt, context: CTX) -> Result<CTX>;
}

/// Fills placeholders from the input map of an example or a run.
///
/// String values are inserted as-is; any other JSON value is inserted in its compact JSON form.
#[derive(Debug, Clone)]
pub struct InputsFiller {
    placeholders_to_fill: Vec<String>,
}

impl InputsFiller {
    pub fn new(placeholders: impl IntoIterator<Item=impl Into<String>>) -> Self {
        Self {
            placeholders_to_fill: placeholders.into_iter().map(Into::into).collect(),
        }
    }

    /// Renders one input value as prompt text.
    pub fn value_to_text(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

impl FillPlaceholders for InputsFiller {
    fn placeholders_to_fill(&self) -> &Vec<String> {
        &self.placeholders_to_fill
    }
}

impl<'a> FillWith<&'a JsonMap> for InputsFiller {
    fn fill_with(&self, partial_prompt: &mut PartialPrompt, inputs: &'a JsonMap) -> Result<&'a JsonMap> {
        for placeholder in &self.placeholders_to_fill {
            let value = inputs
                .get(placeholder)
                .ok_or_else(|| anyhow!("input `{}` is required by the prompt but missing from {:?}", placeholder, inputs.keys().collect::<Vec<_>>()))?;
            partial_prompt.try_fill(placeholder.as_str(), Self::value_to_text(value))?;
        }
        Ok(inputs)
    }
}
