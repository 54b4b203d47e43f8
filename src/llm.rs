use std::cell::{Cell, RefCell};
use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

const CHAT_COMPLETIONS_PATH: &str = "chat/completions";
const MODELS_PATH: &str = "models";
const AVAILABILITY_TIMEOUT: Duration = Duration::from_secs(2);

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434/v1";
pub const DEFAULT_API_KEY: &str = "ollama";
pub const DEFAULT_MODEL: &str = "qwen2.5-coder:3b";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_TOKENS: u32 = 100;
pub const DEFAULT_TEMPERATURE: f32 = 0.3;

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("backend returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("backend returned an empty or invalid command")]
    EmptyResponse,

    #[error("unexpected response: {0}")]
    InvalidResponse(String),

    #[error("failed to start runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

/// Something that turns a prompt into text.
pub trait Generator {
    fn generate(&self, prompt: &str, system: &str, timeout: Duration) -> Result<String, GenerationError>;
}

/// Settings for an OpenAI-compatible endpoint. Every field is optional in
/// the config file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    #[serde(rename = "timeout_secs", with = "duration_secs")]
    pub timeout: Duration,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: DEFAULT_API_KEY.to_string(),
            model: DEFAULT_MODEL.to_string(),
            timeout: DEFAULT_TIMEOUT,
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
        }
    }
}

mod duration_secs {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs.max(0.0))
            .map_err(|e| D::Error::custom(format!("invalid timeout_secs {}: {}", secs, e)))
    }
}

impl LlmConfig {
    /// Overlay values from a lookup function (usually the environment).
    /// Blank values are ignored.
    pub fn apply_getter(mut self, mut getter: impl FnMut(&str) -> Option<String>) -> Self {
        let mut get = |key: &str| getter(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get("ZIST_LLM_BASE_URL") {
            self.base_url = url.trim().to_string();
        }
        if let Some(key) = get("ZIST_LLM_API_KEY").or_else(|| get("OPENAI_API_KEY")) {
            self.api_key = key.trim().to_string();
        }
        if let Some(model) = get("ZIST_LLM_MODEL") {
            self.model = model.trim().to_string();
        }
        if let Some(timeout) = get("ZIST_LLM_TIMEOUT_SECS")
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|secs| *secs > 0.0)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        {
            self.timeout = timeout;
        }
        self
    }

    /// Replace blank or zero values with the defaults.
    pub fn sanitized(mut self) -> Self {
        let defaults = LlmConfig::default();
        if self.base_url.trim().is_empty() {
            self.base_url = defaults.base_url;
        }
        if self.api_key.trim().is_empty() {
            self.api_key = defaults.api_key;
        }
        if self.model.trim().is_empty() {
            self.model = defaults.model;
        }
        if self.timeout.is_zero() {
            self.timeout = defaults.timeout;
        }
        if self.max_tokens == 0 {
            self.max_tokens = defaults.max_tokens;
        }
        if self.temperature <= 0.0 {
            self.temperature = defaults.temperature;
        }
        self
    }

    pub fn chat_endpoint(&self) -> String {
        build_endpoint(&self.base_url, CHAT_COMPLETIONS_PATH)
    }

    pub fn models_endpoint(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        let base = base.strip_suffix(CHAT_COMPLETIONS_PATH).unwrap_or(base);
        build_endpoint(base, MODELS_PATH)
    }
}

fn build_endpoint(base_url: &str, path: &str) -> String {
    let trimmed = base_url.trim_end_matches('/');
    if trimmed.ends_with(path) {
        trimmed.to_string()
    } else {
        format!("{trimmed}/{path}")
    }
}

/// Client for `chat/completions` on an OpenAI-compatible server (OpenAI,
/// Ollama, llama.cpp...).
#[derive(Debug)]
pub struct OpenAiClient {
    config: LlmConfig,
}

impl OpenAiClient {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            config: config.sanitized(),
        }
    }

    pub fn config(&self) -> &LlmConfig {
        &self.config
    }

    /// Whether the endpoint answers a model listing quickly.
    pub fn is_available(&self) -> bool {
        let runtime = match tokio::runtime::Runtime::new() {
            Ok(rt) => rt,
            Err(_) => return false,
        };

        runtime.block_on(async {
            let request = async {
                let client = build_client(AVAILABILITY_TIMEOUT)?;
                client
                    .get(self.config.models_endpoint())
                    .bearer_auth(&self.config.api_key)
                    .send()
                    .await?
                    .error_for_status()
            };
            matches!(tokio::time::timeout(AVAILABILITY_TIMEOUT, request).await, Ok(Ok(_)))
        })
    }

    fn build_body(&self, prompt: &str, system: &str) -> Value {
        let mut messages = Vec::new();
        if !system.trim().is_empty() {
            messages.push(json!({ "role": "system", "content": system.trim() }));
        }
        messages.push(json!({ "role": "user", "content": prompt }));

        json!({
            "model": self.config.model,
            "messages": messages,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
        })
    }

    async fn complete(&self, prompt: &str, system: &str, timeout: Duration) -> Result<String, GenerationError> {
        let body = self.build_body(prompt, system);
        debug!("req: {:?}", body);

        let res = build_client(timeout)?
            .post(self.config.chat_endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(GenerationError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let data: Value = res.json().await?;
        extract_content(&data)
    }
}

impl Generator for OpenAiClient {
    fn generate(&self, prompt: &str, system: &str, timeout: Duration) -> Result<String, GenerationError> {
        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(async {
            match tokio::time::timeout(timeout, self.complete(prompt, system, timeout)).await {
                Ok(Err(GenerationError::Request(e))) if e.is_timeout() => Err(GenerationError::Timeout(timeout)),
                Ok(result) => result,
                Err(_) => Err(GenerationError::Timeout(timeout)),
            }
        })
    }
}

fn build_client(timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder().timeout(timeout).build()
}

fn extract_content(data: &Value) -> Result<String, GenerationError> {
    let choices = data["choices"]
        .as_array()
        .ok_or_else(|| GenerationError::InvalidResponse(format!("no choices in {data}")))?;

    let content = choices
        .first()
        .and_then(|choice| choice["message"]["content"].as_str())
        .ok_or_else(|| GenerationError::InvalidResponse(format!("no message content in {data}")))?;

    if content.trim().is_empty() {
        return Err(GenerationError::EmptyResponse);
    }
    Ok(content.to_string())
}

/// Returns canned responses in order, repeating the last one. Counts calls
/// and keeps the last prompt so callers can inspect what was sent.
#[derive(Debug, Default)]
pub struct StaticGenerator {
    responses: Vec<String>,
    calls: Cell<usize>,
    last_prompt: RefCell<Option<String>>,
}

impl StaticGenerator {
    pub fn new(response: impl Into<String>) -> Self {
        Self::with_responses(vec![response.into()])
    }

    pub fn with_responses(responses: Vec<String>) -> Self {
        Self {
            responses,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.last_prompt.borrow().clone()
    }
}

impl Generator for StaticGenerator {
    fn generate(&self, prompt: &str, _system: &str, _timeout: Duration) -> Result<String, GenerationError> {
        let call = self.calls.get();
        self.calls.set(call + 1);
        *self.last_prompt.borrow_mut() = Some(prompt.to_string());

        self.responses
            .get(call)
            .or_else(|| self.responses.last())
            .cloned()
            .ok_or(GenerationError::EmptyResponse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_handle_trailing_paths() {
        let cfg = LlmConfig {
            base_url: "https://example.com/v1/".into(),
            ..Default::default()
        };
        assert_eq!(cfg.chat_endpoint(), "https://example.com/v1/chat/completions");
        assert_eq!(cfg.models_endpoint(), "https://example.com/v1/models");

        let cfg = LlmConfig {
            base_url: "https://example.com/v1/chat/completions".into(),
            ..Default::default()
        };
        assert_eq!(cfg.chat_endpoint(), "https://example.com/v1/chat/completions");
        assert_eq!(cfg.models_endpoint(), "https://example.com/v1/models");
    }

    #[test]
    fn getter_overrides_and_falls_back() {
        let getter = |key: &str| match key {
            "ZIST_LLM_MODEL" => Some("gpt-4o-mini".to_string()),
            "OPENAI_API_KEY" => Some("sk-legacy".to_string()),
            "ZIST_LLM_BASE_URL" => Some("  ".to_string()),
            "ZIST_LLM_TIMEOUT_SECS" => Some("1.5".to_string()),
            _ => None,
        };
        let cfg = LlmConfig::default().apply_getter(getter);
        assert_eq!(cfg.model, "gpt-4o-mini");
        assert_eq!(cfg.api_key, "sk-legacy");
        assert_eq!(cfg.base_url, DEFAULT_BASE_URL);
        assert_eq!(cfg.timeout, Duration::from_millis(1500));
    }

    #[test]
    fn getter_ignores_unrepresentable_timeouts() {
        for value in ["inf", "NaN", "1e30", "-3", "soon"] {
            let cfg = LlmConfig::default()
                .apply_getter(|key| (key == "ZIST_LLM_TIMEOUT_SECS").then(|| value.to_string()));
            assert_eq!(cfg.timeout, DEFAULT_TIMEOUT, "{}", value);
        }
    }

    #[test]
    fn sanitized_fills_blanks() {
        let cfg = LlmConfig {
            base_url: String::new(),
            api_key: " ".into(),
            model: String::new(),
            timeout: Duration::ZERO,
            max_tokens: 0,
            temperature: 0.0,
        }
        .sanitized();
        assert_eq!(cfg, LlmConfig::default());
    }

    #[test]
    fn config_deserializes_partial_json() {
        let cfg: LlmConfig = serde_json::from_str(r#"{"model": "llama3", "timeout_secs": 10}"#).unwrap();
        assert_eq!(cfg.model, "llama3");
        assert_eq!(cfg.timeout, Duration::from_secs(10));
        assert_eq!(cfg.base_url, DEFAULT_BASE_URL);
    }

    #[test]
    fn oversized_timeout_is_a_parse_error() {
        let err = serde_json::from_str::<LlmConfig>(r#"{"timeout_secs": 1e30}"#).unwrap_err();
        assert!(err.to_string().contains("timeout_secs"), "{}", err);
    }

    #[test]
    fn body_includes_system_prompt_when_present() {
        let client = OpenAiClient::new(LlmConfig::default());
        let body = client.build_body("list files", "be terse");
        assert_eq!(body["messages"].as_array().unwrap().len(), 2);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["model"], DEFAULT_MODEL);

        let body = client.build_body("list files", "  ");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn extracts_first_choice() {
        let data = json!({ "choices": [{ "message": { "content": "ls -la" } }] });
        assert_eq!(extract_content(&data).unwrap(), "ls -la");

        let empty = json!({ "choices": [{ "message": { "content": "  " } }] });
        assert!(matches!(extract_content(&empty), Err(GenerationError::EmptyResponse)));

        let bad = json!({ "error": "nope" });
        assert!(matches!(extract_content(&bad), Err(GenerationError::InvalidResponse(_))));
    }

    #[test]
    fn unreachable_endpoint_fails_cleanly() {
        let client = OpenAiClient::new(LlmConfig {
            base_url: "http://127.0.0.1:9/v1".into(),
            ..Default::default()
        });
        let err = client.generate("hi", "", Duration::from_millis(500)).unwrap_err();
        assert!(matches!(err, GenerationError::Request(_) | GenerationError::Timeout(_)));
        assert!(!client.is_available());
    }

    #[test]
    fn static_generator_replays_responses() {
        let generator = StaticGenerator::with_responses(vec!["a".into(), "b".into()]);
        let t = Duration::from_secs(1);
        assert_eq!(generator.generate("p1", "", t).unwrap(), "a");
        assert_eq!(generator.generate("p2", "", t).unwrap(), "b");
        assert_eq!(generator.generate("p3", "", t).unwrap(), "b");
        assert_eq!(generator.calls(), 3);
        assert_eq!(generator.last_prompt().as_deref(), Some("p3"));
    }
}
