//! [ChatModel] backed by the OpenAI chat completion API (or any compatible endpoint).

use std::error::Error;
use std::fmt;
use std::fmt::Formatter;

use anyhow::Result;
use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use log::debug;
use serde::Deserialize;

use crate::utils::llm::{ChatMessage, ChatModel, Role};
use crate::utils::retry::{retry_with_backoff, BackoffPolicy};

/// Request settings of a conversation, mirroring the arguments of a chat completion request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    pub model: String,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u16>,
    /// Falls back to the `OPENAI_API_KEY` environment variable.
    pub api_key: Option<String>,
    /// Falls back to the public OpenAI endpoint.
    pub api_base: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            temperature: None,
            top_p: None,
            max_tokens: None,
            api_key: None,
            api_base: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Failure of a single chat completion call.
#[derive(Debug)]
pub enum ModelCallError {
    Timeout { after_ms: u64 },
    EmptyReply,
    Api(OpenAIError),
}

impl ModelCallError {
    /// Network failures, timeouts and rate limits are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            ModelCallError::Timeout { .. } => true,
            ModelCallError::EmptyReply => false,
            ModelCallError::Api(OpenAIError::Reqwest(_)) => true,
            ModelCallError::Api(OpenAIError::ApiError(api_error)) => {
                let message = api_error.message.to_lowercase();
                message.contains("rate limit") || message.contains("overloaded") || message.contains("server error")
            }
            ModelCallError::Api(_) => false,
        }
    }
}

impl fmt::Display for ModelCallError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ModelCallError::Timeout { after_ms } => write!(f, "model call timed out after {}ms", after_ms),
            ModelCallError::EmptyReply => write!(f, "model returned no message content"),
            ModelCallError::Api(err) => write!(f, "model call failed: {}", err),
        }
    }
}

impl Error for ModelCallError {}

/// Chat model speaking the OpenAI chat completion protocol.
#[derive(Clone, Debug)]
pub struct OpenAIChat {
    pub client: Client<OpenAIConfig>,
    pub config: ConversationConfig,
}

impl OpenAIChat {
    pub fn new(config: ConversationConfig) -> Self {
        let mut openai_config = OpenAIConfig::new();
        if let Some(api_key) = &config.api_key {
            openai_config = openai_config.with_api_key(api_key);
        }
        if let Some(api_base) = &config.api_base {
            openai_config = openai_config.with_api_base(api_base);
        }
        Self {
            client: Client::with_config(openai_config),
            config,
        }
    }

    fn to_request_message(message: &ChatMessage) -> Result<ChatCompletionRequestMessage, OpenAIError> {
        let message = match message.role {
            Role::System => ChatCompletionRequestSystemMessageArgs::default()
                .content(message.content.as_str())
                .build()?
                .into(),
            Role::User => ChatCompletionRequestUserMessageArgs::default()
                .content(message.content.as_str())
                .build()?
                .into(),
            Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                .content(message.content.as_str())
                .build()?
                .into(),
        };
        Ok(message)
    }

    async fn request_once(&self, messages: &[ChatCompletionRequestMessage]) -> Result<String, ModelCallError> {
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(self.config.model.as_str()).messages(messages.to_vec());
        if let Some(temperature) = self.config.temperature {
            args.temperature(temperature);
        }
        if let Some(top_p) = self.config.top_p {
            args.top_p(top_p);
        }
        if let Some(max_tokens) = self.config.max_tokens {
            args.max_tokens(max_tokens);
        }
        let request = args.build().map_err(ModelCallError::Api)?;
        let timeout = self.config.backoff.call_timeout();
        let response = tokio::time::timeout(timeout, self.client.chat().create(request))
            .await
            .map_err(|_| ModelCallError::Timeout { after_ms: self.config.backoff.call_timeout_ms })?
            .map_err(ModelCallError::Api)?;
        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or(ModelCallError::EmptyReply)
    }
}

#[async_trait]
impl ChatModel for OpenAIChat {
    async fn invoke(&self, messages: &[ChatMessage]) -> Result<String> {
        let request_messages = messages
            .iter()
            .map(Self::to_request_message)
            .collect::<Result<Vec<_>, _>>()?;
        debug!("invoking {} with {} messages", self.config.model, request_messages.len());
        let reply = retry_with_backoff(&self.config.backoff, ModelCallError::is_transient, || {
            self.request_once(&request_messages)
        }).await?;
        Ok(reply)
    }
}
