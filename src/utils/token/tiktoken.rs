use anyhow::{anyhow, Result};
pub use tiktoken_rs::{get_bpe_from_model, CoreBPE};

use crate::utils::token::CountToken;

/// Counter using the Tiktoken tokenizer.
#[derive(Clone)]
#[readonly::make]
pub struct Tiktoken {
    /// The model family of the tokenizer. read-only.
    #[readonly]
    pub model: String,
    /// The tokenizer. read-only.
    #[readonly]
    pub bpe: CoreBPE,
}

impl Tiktoken {
    /// Create a new Tiktoken counter. Models of the GPT-4 and GPT-3.5 families are supported;
    /// newer GPT-4 variants are counted with the GPT-4 tokenizer, which is a close approximation.
    pub fn new(model: impl Into<String>) -> Result<Self> {
        let model = model.into();
        let family = Self::family_of(&model).ok_or_else(|| anyhow!("model {} is not supported", model))?;
        let bpe_model = if family.starts_with("gpt-3.5") { "gpt-3.5-turbo" } else { "gpt-4" };
        let bpe = get_bpe_from_model(bpe_model)?;
        Ok(Tiktoken {
            model: family.to_string(),
            bpe,
        })
    }

    fn family_of(model: &str) -> Option<&'static str> {
        ["gpt-4o", "gpt-4-turbo", "gpt-4-32k", "gpt-4", "gpt-3.5-turbo"]
            .into_iter()
            .find(|family| model.starts_with(family))
    }
}

impl CountToken for Tiktoken {
    fn count_token(&self, string: &str) -> usize {
        self.bpe.encode_with_special_tokens(string).len()
    }
}
