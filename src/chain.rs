//! Executable chains built from prompt templates.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::filler::{FillWith, InputsFiller};
use crate::prompt::PromptTemplate;
use crate::utils::llm::{ChatMessage, ChatModel};
use crate::utils::JsonMap;

/// Anything that maps example inputs to a text output.
#[async_trait]
pub trait Chain: Send + Sync {
    async fn invoke(&self, inputs: &JsonMap) -> Result<String>;
}

#[async_trait]
impl<C: Chain + ?Sized> Chain for Box<C> {
    async fn invoke(&self, inputs: &JsonMap) -> Result<String> {
        (**self).invoke(inputs).await
    }
}

/// `prompt | model | text`: fills a template from the inputs and sends it as the user turn.
pub struct PromptChain<M: ChatModel> {
    pub template: PromptTemplate,
    pub system: Option<String>,
    pub model: Arc<M>,
    filler: InputsFiller,
}

impl<M: ChatModel> PromptChain<M> {
    pub fn new(template: PromptTemplate, model: Arc<M>) -> Self {
        let filler = InputsFiller::new(template.placeholders.iter().cloned());
        Self {
            template,
            system: None,
            model,
            filler,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// The messages that would be sent for `inputs`.
    pub fn render(&self, inputs: &JsonMap) -> Result<Vec<ChatMessage>> {
        let mut partial = self.template.construct_prompt();
        self.filler.fill_with(&mut partial, inputs)?;
        let user = partial.complete()?;
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &self.system {
            messages.push(ChatMessage::system(system.as_str()));
        }
        messages.push(ChatMessage::user(user));
        Ok(messages)
    }
}

#[async_trait]
impl<M: ChatModel> Chain for PromptChain<M> {
    async fn invoke(&self, inputs: &JsonMap) -> Result<String> {
        let messages = self.render(inputs)?;
        self.model.invoke(&messages).await
    }
}
