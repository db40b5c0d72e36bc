//! Model client for AI inference using OpenAI-compatible API.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::sleep;

/// Default number of retry attempts for failed requests.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay between retry attempts in seconds.
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 2;

/// Unrecovered model transport failure. `code` is the HTTP status when the
/// server answered at all.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{}{message}", .code.map(|c| format!("HTTP {}: ", c)).unwrap_or_default())]
pub struct TransportError {
    pub code: Option<u16>,
    pub message: String,
}

/// Raw reply text from the model. Empty when the server answered without a
/// usable choice.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelResponse {
    pub raw_content: String,
}

/// Sends conversation history to a model.
///
/// Implementations own their retry policy; an `Err` means retries are exhausted.
#[async_trait]
pub trait ModelTransport: Send + Sync {
    async fn send(
        &self,
        messages: &[Value],
        model_name: &str,
    ) -> Result<ModelResponse, TransportError>;
}

/// Failure of a single HTTP attempt.
#[derive(Error, Debug)]
enum AttemptError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("API error: {body}")]
    Api { status: u16, body: String },
}

impl AttemptError {
    /// Network errors, rate limits and server errors are worth retrying.
    fn is_retryable(&self) -> bool {
        match self {
            AttemptError::Request(e) => !e.is_builder(),
            AttemptError::Api { status, .. } => *status == 429 || *status >= 500,
        }
    }

    fn code(&self) -> Option<u16> {
        match self {
            AttemptError::Request(e) => e.status().map(|s| s.as_u16()),
            AttemptError::Api { status, .. } => Some(*status),
        }
    }
}

/// Configuration for the AI model.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub base_url: String,
    pub api_key: String,
    pub model_name: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub frequency_penalty: f32,
    pub extra_body: HashMap<String, Value>,
    /// Maximum number of retry attempts for failed requests.
    pub max_retries: u32,
    /// Delay between retry attempts in seconds.
    pub retry_delay_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        let mut extra_body = HashMap::new();
        extra_body.insert("skip_special_tokens".to_string(), json!(false));

        Self {
            base_url: "http://localhost:8000/v1".to_string(),
            api_key: "EMPTY".to_string(),
            model_name: "autoglm-phone-9b".to_string(),
            max_tokens: 3000,
            temperature: 0.0,
            top_p: 0.85,
            frequency_penalty: 0.2,
            extra_body,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_secs: DEFAULT_RETRY_DELAY_SECS,
        }
    }
}

impl ModelConfig {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    pub fn with_model_name(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = model_name.into();
        self
    }

    /// Set the maximum number of retry attempts for failed requests.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the delay between retry attempts in seconds.
    pub fn with_retry_delay(mut self, delay_secs: u64) -> Self {
        self.retry_delay_secs = delay_secs;
        self
    }
}

/// OpenAI API response structures. Every level is optional so that a
/// malformed success body degrades to an empty reply.
#[derive(Debug, Default, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    content: Option<String>,
}

/// Client for interacting with OpenAI-compatible vision-language models.
pub struct ModelClient {
    config: ModelConfig,
    client: Client,
}

impl ModelClient {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn request_body(&self, messages: &[Value], model_name: &str) -> Value {
        let mut body = json!({
            "messages": messages,
            "model": model_name,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
            "top_p": self.config.top_p,
            "frequency_penalty": self.config.frequency_penalty,
        });

        if let Value::Object(ref mut map) = body {
            for (key, value) in &self.config.extra_body {
                map.insert(key.clone(), value.clone());
            }
        }

        body
    }

    /// Send a single request to the API.
    async fn send_once(&self, url: &str, body: &Value) -> Result<ModelResponse, AttemptError> {
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.config.api_key)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(AttemptError::Api {
                status: status.as_u16(),
                body: text,
            });
        }

        Ok(ModelResponse {
            raw_content: extract_content(&text),
        })
    }
}

#[async_trait]
impl ModelTransport for ModelClient {
    async fn send(
        &self,
        messages: &[Value],
        model_name: &str,
    ) -> Result<ModelResponse, TransportError> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let body = self.request_body(messages, model_name);
        let max_attempts = self.config.max_retries + 1;

        let mut last_error: Option<AttemptError> = None;
        for attempt in 1..=max_attempts {
            match self.send_once(&url, &body).await {
                Ok(response) => return Ok(response),
                Err(e) if !e.is_retryable() => {
                    return Err(TransportError {
                        code: e.code(),
                        message: e.to_string(),
                    });
                }
                Err(e) => {
                    if attempt < max_attempts {
                        tracing::warn!(
                            "Model request failed (attempt {}/{}): {}. Retrying in {}s",
                            attempt,
                            max_attempts,
                            e,
                            self.config.retry_delay_secs
                        );
                        sleep(Duration::from_secs(self.config.retry_delay_secs)).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(TransportError {
            code: last_error.as_ref().and_then(AttemptError::code),
            message: format!(
                "Max retries exceeded after {} attempts: {}",
                max_attempts,
                last_error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "Unknown error".to_string())
            ),
        })
    }
}

/// Content of the first choice, or empty when there is none.
fn extract_content(body: &str) -> String {
    let completion: ChatCompletionResponse = serde_json::from_str(body).unwrap_or_else(|e| {
        tracing::warn!("Unparseable completion body: {}", e);
        ChatCompletionResponse::default()
    });

    completion
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message)
        .and_then(|message| message.content)
        .unwrap_or_default()
}

/// Helper for building conversation messages.
pub struct MessageBuilder;

impl MessageBuilder {
    pub fn create_system_message(content: &str) -> Value {
        json!({
            "role": "system",
            "content": content
        })
    }

    /// Create a user message with optional base64-encoded PNG image.
    pub fn create_user_message(text: &str, image_base64: Option<&str>) -> Value {
        let mut content = Vec::new();

        if let Some(img_data) = image_base64 {
            content.push(json!({
                "type": "image_url",
                "image_url": {
                    "url": format!("data:image/png;base64,{}", img_data)
                }
            }));
        }

        content.push(json!({
            "type": "text",
            "text": text
        }));

        json!({
            "role": "user",
            "content": content
        })
    }

    /// Create an assistant message in the reasoning/answer format.
    pub fn create_assistant_message(thinking: &str, action: &str) -> Value {
        json!({
            "role": "assistant",
            "content": format!("<think>{}</think><answer>{}</answer>", thinking, action)
        })
    }

    /// Remove image content from a message to save context space.
    pub fn remove_images_from_message(message: &mut Value) {
        if let Some(Value::Array(arr)) = message.get_mut("content") {
            arr.retain(|item| {
                item.get("type")
                    .and_then(|t| t.as_str())
                    .map(|t| t == "text")
                    .unwrap_or(false)
            });
        }
    }

    /// Build screen info string for the model.
    pub fn build_screen_info(current_app: &str) -> String {
        json!({
            "current_app": current_app
        })
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_config_default() {
        let config = ModelConfig::default();
        assert_eq!(config.base_url, "http://localhost:8000/v1");
        assert_eq!(config.model_name, "autoglm-phone-9b");
        assert_eq!(config.max_retries, DEFAULT_MAX_RETRIES);
    }

    #[test]
    fn test_extract_content() {
        let body =
            r#"{"choices":[{"message":{"content":"<answer>do(action=\"Back\")</answer>"}}]}"#;
        assert_eq!(extract_content(body), "<answer>do(action=\"Back\")</answer>");
    }

    #[test]
    fn test_missing_choice_is_empty_reply() {
        assert_eq!(extract_content(r#"{"choices":[]}"#), "");
        assert_eq!(extract_content(r#"{"choices":[{"message":{}}]}"#), "");
        assert_eq!(extract_content("<html>gateway</html>"), "");
    }

    #[test]
    fn test_retryable_status() {
        let server = AttemptError::Api { status: 503, body: String::new() };
        let limited = AttemptError::Api { status: 429, body: String::new() };
        let rejected = AttemptError::Api { status: 401, body: String::new() };
        assert!(server.is_retryable());
        assert!(limited.is_retryable());
        assert!(!rejected.is_retryable());
        assert_eq!(rejected.code(), Some(401));
    }

    #[test]
    fn test_transport_error_display() {
        let with_code = TransportError {
            code: Some(502),
            message: "bad gateway".to_string(),
        };
        let without = TransportError {
            code: None,
            message: "connection refused".to_string(),
        };
        assert_eq!(with_code.to_string(), "HTTP 502: bad gateway");
        assert_eq!(without.to_string(), "connection refused");
    }

    #[test]
    fn test_request_body_merges_extra() {
        let client = ModelClient::new(ModelConfig::default());
        let body = client.request_body(&[], "other-model");
        assert_eq!(body["model"], "other-model");
        assert_eq!(body["skip_special_tokens"], false);
    }

    #[test]
    fn test_message_builder() {
        let system_msg = MessageBuilder::create_system_message("You are an assistant");
        assert_eq!(system_msg["role"], "system");

        let mut user_msg = MessageBuilder::create_user_message("Look at this", Some("base64data"));
        assert_eq!(user_msg["content"][0]["type"], "image_url");
        MessageBuilder::remove_images_from_message(&mut user_msg);
        assert_eq!(user_msg["content"].as_array().unwrap().len(), 1);
        assert_eq!(user_msg["content"][0]["type"], "text");

        let assistant = MessageBuilder::create_assistant_message("hmm", "do(action=\"Home\")");
        assert_eq!(
            assistant["content"],
            "<think>hmm</think><answer>do(action=\"Home\")</answer>"
        );
    }
}
