use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::{AiProvider, AppConfig};
use crate::error::GenerationFault;
use crate::http_client::build_http_client;
use crate::style::{ExampleExchange, StyleProfile};

/// How many trailing context turns are replayed to the model.
const CONTEXT_TURNS: usize = 5;
/// Cohere preambles get a short sample of examples, not the whole set.
const COHERE_EXAMPLES: usize = 3;
const TEMPERATURE: f32 = 0.8;

/// One prior message in the conversation, as the model sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextTurn {
    pub text: String,
    pub is_owner: bool,
}

#[async_trait]
pub trait ResponsePort: Send + Sync {
    /// Produce a reply to `message` in the owner's style.
    async fn generate(
        &self,
        message: &str,
        context: &[ContextTurn],
        sender_label: Option<&str>,
    ) -> Result<String, GenerationFault>;
}

pub fn build_responder(config: &AppConfig, style: Arc<StyleProfile>) -> Result<Arc<dyn ResponsePort>> {
    let api_key = config.active_api_key().unwrap_or_default().to_string();
    let timeout = config.request_timeout();
    let responder: Arc<dyn ResponsePort> = match config.ai_provider {
        AiProvider::OpenAi => Arc::new(OpenAiResponder::new(
            config.openai_api_url.clone(),
            api_key,
            config.openai_model.clone(),
            style,
            timeout,
        )?),
        AiProvider::Cohere => Arc::new(CohereResponder::new(
            config.cohere_api_url.clone(),
            api_key,
            config.cohere_model.clone(),
            style,
            timeout,
        )?),
    };
    Ok(responder)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f32,
    max_tokens: usize,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

fn last_turns(context: &[ContextTurn]) -> &[ContextTurn] {
    &context[context.len().saturating_sub(CONTEXT_TURNS)..]
}

fn labelled(message: &str, sender_label: Option<&str>) -> String {
    match sender_label.map(str::trim).filter(|l| !l.is_empty()) {
        Some(label) => format!("{}: {}", label, message),
        None => message.to_string(),
    }
}

fn finish_reply(raw: &str) -> Result<String, GenerationFault> {
    let reply = raw.trim();
    if reply.is_empty() {
        return Err(GenerationFault::Empty);
    }
    Ok(reply.to_string())
}

fn style_fault(error: anyhow::Error) -> GenerationFault {
    GenerationFault::Style(format!("{:#}", error))
}

/// Chat messages for an OpenAI-compatible completion: instructions, every
/// example as a user/assistant pair, recent turns, then the new message.
pub fn build_openai_messages(
    instructions: &str,
    examples: &[ExampleExchange],
    context: &[ContextTurn],
    message: &str,
    sender_label: Option<&str>,
) -> Vec<Message> {
    let mut messages = vec![Message::new("system", instructions)];

    for example in examples {
        messages.push(Message::new("user", example.prompt.clone()));
        messages.push(Message::new("assistant", example.response.clone()));
    }

    for turn in last_turns(context) {
        let role = if turn.is_owner { "assistant" } else { "user" };
        messages.push(Message::new(role, turn.text.clone()));
    }

    messages.push(Message::new("user", labelled(message, sender_label)));
    messages
}

#[derive(Clone)]
pub struct OpenAiResponder {
    api_url: String,
    api_key: String,
    model: String,
    style: Arc<StyleProfile>,
    client: reqwest::Client,
}

impl OpenAiResponder {
    pub fn new(
        api_url: String,
        api_key: String,
        model: String,
        style: Arc<StyleProfile>,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            style,
            client: build_http_client(timeout).context("Failed to build model HTTP client")?,
        })
    }
}

#[async_trait]
impl ResponsePort for OpenAiResponder {
    async fn generate(
        &self,
        message: &str,
        context: &[ContextTurn],
        sender_label: Option<&str>,
    ) -> Result<String, GenerationFault> {
        let instructions = self.style.render_instructions().map_err(style_fault)?;
        let examples = self.style.example_exchanges().map_err(style_fault)?;
        let max_tokens = self.style.max_reply_length().map_err(style_fault)?;

        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages: build_openai_messages(&instructions, &examples, context, message, sender_label),
            temperature: TEMPERATURE,
            max_tokens,
        };

        let url = format!("{}/chat/completions", self.api_url);
        let mut req = self.client.post(&url).json(&request);
        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = req
            .send()
            .await
            .map_err(|e| GenerationFault::Request(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            return Err(GenerationFault::Status { status, body });
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| GenerationFault::Parse(e.to_string()))?;

        let content = completion
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or(GenerationFault::Empty)?;

        finish_reply(content)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CohereTurn {
    pub role: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
struct CohereChatRequest {
    model: String,
    message: String,
    preamble: String,
    chat_history: Vec<CohereTurn>,
    temperature: f32,
    max_tokens: usize,
}

#[derive(Debug, Deserialize)]
struct CohereChatResponse {
    #[serde(default)]
    text: String,
}

/// Instructions followed by a handful of examples as `Q:`/`A:` pairs.
pub fn build_cohere_preamble(instructions: &str, examples: &[ExampleExchange]) -> String {
    let mut preamble = instructions.to_string();
    let sample: Vec<&ExampleExchange> = examples.iter().take(COHERE_EXAMPLES).collect();
    if !sample.is_empty() {
        preamble.push_str("\n\nEXAMPLES OF HOW I RESPOND:");
        for example in sample {
            preamble.push_str(&format!("\nQ: {}\nA: {}", example.prompt, example.response));
        }
    }
    preamble
}

pub fn build_cohere_history(context: &[ContextTurn]) -> Vec<CohereTurn> {
    last_turns(context)
        .iter()
        .map(|turn| CohereTurn {
            role: if turn.is_owner { "CHATBOT" } else { "USER" },
            message: turn.text.clone(),
        })
        .collect()
}

#[derive(Clone)]
pub struct CohereResponder {
    api_url: String,
    api_key: String,
    model: String,
    style: Arc<StyleProfile>,
    client: reqwest::Client,
}

impl CohereResponder {
    pub fn new(
        api_url: String,
        api_key: String,
        model: String,
        style: Arc<StyleProfile>,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            style,
            client: build_http_client(timeout).context("Failed to build model HTTP client")?,
        })
    }
}

#[async_trait]
impl ResponsePort for CohereResponder {
    async fn generate(
        &self,
        message: &str,
        context: &[ContextTurn],
        sender_label: Option<&str>,
    ) -> Result<String, GenerationFault> {
        let instructions = self.style.render_instructions().map_err(style_fault)?;
        let examples = self.style.example_exchanges().map_err(style_fault)?;
        let max_tokens = self.style.max_reply_length().map_err(style_fault)?;

        let request = CohereChatRequest {
            model: self.model.clone(),
            message: labelled(message, sender_label),
            preamble: build_cohere_preamble(&instructions, &examples),
            chat_history: build_cohere_history(context),
            temperature: TEMPERATURE,
            max_tokens,
        };

        let url = format!("{}/v1/chat", self.api_url);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| GenerationFault::Request(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            return Err(GenerationFault::Status { status, body });
        }

        let reply: CohereChatResponse = response
            .json()
            .await
            .map_err(|e| GenerationFault::Parse(e.to_string()))?;

        finish_reply(&reply.text)
    }
}
