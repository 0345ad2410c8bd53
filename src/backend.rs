//! Generation backends: the language model that writes the raw answer text.

use anyhow::Result;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{BackendConfig, Provider};
use crate::segmenter::{C_CODE_MARKER, MANIM_CODE_MARKER};

/// Produces raw answer text for a question.
pub trait GenerationBackend: Send + Sync {
    fn generate<'a>(&'a self, question: &'a str) -> BoxFuture<'a, Result<String>>;

    fn describe(&self) -> String;
}

pub fn build_prompt(question: &str) -> String {
    format!(
        "Solve the following physics problem step by step. Show every calculation and explain the reasoning.

After the solution, write a complete, runnable C program that simulates the physics in the problem and prints the relevant results to standard output. Put the line `{c_marker}` immediately before the C code.

Then write a complete Python script containing a Manim scene that visualizes the problem or its solution. Put the line `{manim_marker}` immediately before the Manim code.

Physics problem:
{question}

Solution:",
        c_marker = C_CODE_MARKER,
        manim_marker = MANIM_CODE_MARKER,
        question = question,
    )
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

pub struct OllamaBackend {
    base_url: String,
    model: String,
    temperature: f32,
    client: reqwest::Client,
}

impl OllamaBackend {
    pub fn new(base_url: String, model: String, temperature: f32, client: reqwest::Client) -> Self {
        OllamaBackend {
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            temperature,
            client,
        }
    }

    async fn chat(&self, question: &str) -> Result<String> {
        let request = OllamaChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: build_prompt(question),
            }],
            stream: false,
            options: OllamaOptions {
                temperature: self.temperature,
            },
        };

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("Ollama API error ({}): {}", status, body));
        }

        let ollama_response: OllamaChatResponse = response.json().await?;
        Ok(ollama_response.message.content)
    }
}

impl GenerationBackend for OllamaBackend {
    fn generate<'a>(&'a self, question: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(self.chat(question))
    }

    fn describe(&self) -> String {
        format!("ollama {} at {}", self.model, self.base_url)
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Chat completions against an OpenAI-compatible local server such as LM Studio.
pub struct OpenAiCompatibleBackend {
    base_url: String,
    model: String,
    temperature: f32,
    client: reqwest::Client,
}

impl OpenAiCompatibleBackend {
    pub fn new(base_url: String, model: String, temperature: f32, client: reqwest::Client) -> Self {
        OpenAiCompatibleBackend {
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            temperature,
            client,
        }
    }

    async fn complete(&self, question: &str) -> Result<String> {
        let request = CompletionRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: build_prompt(question),
            }],
            temperature: self.temperature,
        };

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            // Local servers ignore the key but some reject a missing header.
            .bearer_auth("not-needed")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("Chat completion error ({}): {}", status, body));
        }

        let completion: CompletionResponse = response.json().await?;
        completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| anyhow::anyhow!("Chat completion returned no content"))
    }
}

impl GenerationBackend for OpenAiCompatibleBackend {
    fn generate<'a>(&'a self, question: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(self.complete(question))
    }

    fn describe(&self) -> String {
        format!("openai-compatible {} at {}", self.model, self.base_url)
    }
}

impl BackendConfig {
    /// Validates the configuration and constructs the backend it names.
    pub fn build(&self) -> Result<Arc<dyn GenerationBackend>> {
        if self.model.trim().is_empty() {
            anyhow::bail!("No model configured");
        }
        if !(self.host.starts_with("http://") || self.host.starts_with("https://")) {
            anyhow::bail!("Backend host must be an http(s) URL, got '{}'", self.host);
        }

        let mut builder = reqwest::Client::builder();
        if let Some(secs) = self.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        let client = builder.build()?;

        let backend: Arc<dyn GenerationBackend> = match self.provider {
            Provider::Ollama => Arc::new(OllamaBackend::new(
                self.host.clone(),
                self.model.clone(),
                self.temperature,
                client,
            )),
            Provider::OpenAi => Arc::new(OpenAiCompatibleBackend::new(
                self.host.clone(),
                self.model.clone(),
                self.temperature,
                client,
            )),
        };
        Ok(backend)
    }
}
