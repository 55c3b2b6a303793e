//! LLM client abstraction.
//!
//! `generate(prompt, schema)` returns the model's JSON object or a
//! `ProviderError`. Callers validate the JSON against their own typed
//! schema; anything that does not fit is treated as malformed output.
//! Supports Ollama and OpenAI-compatible backends, plus a scripted fake for
//! tests.

use crate::config::{LlmConfig, LlmProvider};
use async_trait::async_trait;
use deskmate_shared::ProviderError;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

/// System + user prompt pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

/// Structured-output contract handed to the backend.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResponseSchema {
    /// Stable name, e.g. "causes"
    pub name: &'static str,
    /// JSON shape shown to the model
    pub description: &'static str,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(&self, prompt: &Prompt, schema: &ResponseSchema)
        -> Result<Value, ProviderError>;

    /// Short backend label for logs, e.g. "ollama:qwen2.5:7b-instruct".
    fn name(&self) -> String;
}

/// Build the configured backend, or `None` for rule-based mode.
pub fn client_from_config(config: &LlmConfig) -> Option<Arc<dyn LlmClient>> {
    if !config.is_usable() {
        info!("LLM backend not configured, using rule-based mode");
        return None;
    }
    match HttpLlmClient::new(config) {
        Ok(client) => {
            info!("LLM backend: {}", client.name());
            Some(Arc::new(client))
        }
        Err(e) => {
            info!("LLM backend unavailable ({}), using rule-based mode", e);
            None
        }
    }
}

/// Real client over HTTP.
pub struct HttpLlmClient {
    config: LlmConfig,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpLlmClient {
    pub fn new(config: &LlmConfig) -> Result<Self, ProviderError> {
        if !config.enabled {
            return Err(ProviderError::Disabled);
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ProviderError::Http(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self {
            config: config.clone(),
            api_key: config.api_key(),
            client,
        })
    }

    fn timeout_ms(&self) -> u64 {
        self.config.timeout_secs * 1000
    }

    fn send_error(&self, e: reqwest::Error) -> ProviderError {
        if e.is_timeout() {
            ProviderError::Timeout(self.timeout_ms())
        } else {
            ProviderError::Http(format!("request failed: {}", e))
        }
    }

    async fn call_ollama(
        &self,
        prompt: &Prompt,
        schema: &ResponseSchema,
    ) -> Result<Value, ProviderError> {
        let url = format!("{}/api/generate", self.config.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.config.model,
            "system": prompt.system,
            "prompt": with_schema(&prompt.user, schema),
            "stream": false,
            "format": "json",
            "options": { "num_predict": self.config.max_tokens },
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.send_error(e))?;
        check_status(response.status(), "Ollama")?;

        let envelope: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(format!("unreadable response: {}", e)))?;
        let text = envelope
            .get("response")
            .and_then(|v| v.as_str())
            .ok_or(ProviderError::EmptyResponse)?;
        parse_json_object(text)
    }

    async fn call_openai(
        &self,
        prompt: &Prompt,
        schema: &ResponseSchema,
    ) -> Result<Value, ProviderError> {
        let base = self.config.base_url.trim_end_matches('/');
        let url = if base.ends_with("/v1") {
            format!("{}/chat/completions", base)
        } else {
            format!("{}/v1/chat/completions", base)
        };
        let body = serde_json::json!({
            "model": self.config.model,
            "messages": [
                {"role": "system", "content": prompt.system},
                {"role": "user", "content": with_schema(&prompt.user, schema)},
            ],
            "response_format": {"type": "json_object"},
            "max_tokens": self.config.max_tokens,
            "temperature": 0.2,
        });

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await.map_err(|e| self.send_error(e))?;
        check_status(response.status(), "OpenAI-compatible API")?;

        let envelope: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(format!("unreadable response: {}", e)))?;
        let text = envelope
            .get("choices")
            .and_then(|v| v.get(0))
            .and_then(|v| v.get("message"))
            .and_then(|v| v.get("content"))
            .and_then(|v| v.as_str())
            .ok_or(ProviderError::EmptyResponse)?;
        parse_json_object(text)
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn generate(
        &self,
        prompt: &Prompt,
        schema: &ResponseSchema,
    ) -> Result<Value, ProviderError> {
        debug!(
            "LLM call [{}] schema={} prompt={} chars",
            self.config.model,
            schema.name,
            prompt.system.len() + prompt.user.len()
        );
        match self.config.provider {
            LlmProvider::Ollama => self.call_ollama(prompt, schema).await,
            LlmProvider::Openai => self.call_openai(prompt, schema).await,
        }
    }

    fn name(&self) -> String {
        let provider = match self.config.provider {
            LlmProvider::Ollama => "ollama",
            LlmProvider::Openai => "openai",
        };
        format!("{}:{}", provider, self.config.model)
    }
}

fn with_schema(user: &str, schema: &ResponseSchema) -> String {
    format!(
        "{}\n\nRespond with a single JSON object matching this schema:\n{}",
        user, schema.description
    )
}

fn check_status(status: reqwest::StatusCode, backend: &str) -> Result<(), ProviderError> {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(ProviderError::RateLimited);
    }
    if !status.is_success() {
        return Err(ProviderError::Http(format!("HTTP {} from {}", status, backend)));
    }
    Ok(())
}

/// The whole text must be one JSON object. No scraping of surrounding prose.
pub fn parse_json_object(text: &str) -> Result<Value, ProviderError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ProviderError::EmptyResponse);
    }
    let value: Value = serde_json::from_str(trimmed)
        .map_err(|e| ProviderError::Malformed(format!("output is not valid JSON: {}", e)))?;
    if !value.is_object() {
        return Err(ProviderError::Malformed("output is not a JSON object".to_string()));
    }
    Ok(value)
}

/// Scripted client for tests. Responses are queued per schema name; the
/// last queued response repeats.
#[derive(Default)]
pub struct FakeLlmClient {
    scripts: Mutex<HashMap<&'static str, Vec<Result<Value, ProviderError>>>>,
    delay: Option<Duration>,
    call_count: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl FakeLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(
        self,
        schema: &'static str,
        response: Result<Value, ProviderError>,
    ) -> Self {
        {
            let mut scripts = self.scripts.lock().unwrap_or_else(|e| e.into_inner());
            scripts.entry(schema).or_default().push(response);
        }
        self
    }

    /// Sleep before answering, to exercise timeouts.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// User prompts received so far.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl LlmClient for FakeLlmClient {
    async fn generate(
        &self,
        prompt: &Prompt,
        schema: &ResponseSchema,
    ) -> Result<Value, ProviderError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(prompt.user.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let mut scripts = self.scripts.lock().unwrap_or_else(|e| e.into_inner());
        match scripts.get_mut(schema.name) {
            Some(queue) if queue.len() > 1 => queue.remove(0),
            Some(queue) if queue.len() == 1 => queue[0].clone(),
            _ => Err(ProviderError::EmptyResponse),
        }
    }

    fn name(&self) -> String {
        "fake".to_string()
    }
}
