use serde_json::json;

use crate::agent::message::{Message, MessageRole};
use crate::provider::Provider;

const ANTHROPIC_VERSION: &str = "2023-06-01";
/// Wall-clock cap on a single HTTP round trip.
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(600);

/// One generation call: ordered messages in, text out.
#[derive(Clone, Debug)]
pub struct CompletionRequest {
    pub model: String,
    pub max_tokens: u32,
    pub system: Option<String>,
    pub messages: Vec<Message>,
}

impl CompletionRequest {
    /// Content of the most recent user message (the prompt, for single-shot calls).
    pub fn last_user_text(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("{0}")]
    Other(String),
}

impl BackendError {
    /// Rate-limit and overload failures are worth retrying; everything else is fatal.
    pub fn is_transient(&self) -> bool {
        is_retryable(&self.to_string())
    }
}

/// Check if a failure description carries a rate-limit or overload signature.
pub fn is_retryable(error: &str) -> bool {
    let lower = error.to_lowercase();
    lower.contains("429")
        || lower.contains("529")
        || lower.contains("rate_limit")
        || lower.contains("rate limit")
        || lower.contains("overloaded")
}

/// Text-generation service. Constructed once per process and injected.
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, BackendError>;
}

/// `Backend` over the provider's HTTP API.
pub struct HttpBackend {
    client: reqwest::Client,
    provider: Provider,
}

impl HttpBackend {
    pub fn new(provider: Provider) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { client, provider })
    }

    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    async fn post(
        &self,
        request: reqwest::RequestBuilder,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, BackendError> {
        let resp = request.json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp.json().await?)
    }
}

#[async_trait::async_trait]
impl Backend for HttpBackend {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, BackendError> {
        let model = self.provider.resolve_model(&request.model);
        match &self.provider {
            Provider::Anthropic { api_key, base_url } => {
                let body = anthropic_body(&model, request);
                let url = format!("{}/v1/messages", base_url.trim_end_matches('/'));
                let builder = self
                    .client
                    .post(url)
                    .header("x-api-key", api_key)
                    .header("anthropic-version", ANTHROPIC_VERSION);
                let value = self.post(builder, body).await?;
                anthropic_text(&value)
            }
            Provider::OpenRouter { api_key, base_url } => {
                let body = chat_completions_body(&model, request);
                let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));
                let builder = self.client.post(url).bearer_auth(api_key);
                let value = self.post(builder, body).await?;
                chat_completions_text(&value)
            }
        }
    }
}

fn anthropic_body(model: &str, request: &CompletionRequest) -> serde_json::Value {
    let messages: Vec<serde_json::Value> = request
        .messages
        .iter()
        .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
        .collect();
    let mut body = json!({
        "model": model,
        "max_tokens": request.max_tokens,
        "messages": messages,
    });
    if let Some(system) = &request.system {
        body["system"] = json!(system);
    }
    body
}

fn anthropic_text(value: &serde_json::Value) -> Result<String, BackendError> {
    value
        .get("content")
        .and_then(|c| c.as_array())
        .and_then(|blocks| {
            blocks
                .iter()
                .find(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
        })
        .and_then(|b| b.get("text"))
        .and_then(|t| t.as_str())
        .map(String::from)
        .ok_or_else(|| BackendError::Malformed("no text content block".into()))
}

fn chat_completions_body(model: &str, request: &CompletionRequest) -> serde_json::Value {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    if let Some(system) = &request.system {
        messages.push(json!({"role": "system", "content": system}));
    }
    messages.extend(
        request
            .messages
            .iter()
            .map(|m| json!({"role": m.role.as_str(), "content": m.content})),
    );
    json!({
        "model": model,
        "max_tokens": request.max_tokens,
        "messages": messages,
    })
}

fn chat_completions_text(value: &serde_json::Value) -> Result<String, BackendError> {
    if let Some(err) = value.get("error") {
        // OpenRouter reports upstream failures inside a 200 body.
        return Err(BackendError::Other(format!("provider error: {err}")));
    }
    value
        .pointer("/choices/0/message/content")
        .and_then(|t| t.as_str())
        .map(String::from)
        .ok_or_else(|| BackendError::Malformed("no choices[0].message.content".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderKind;

    fn request(system: Option<&str>) -> CompletionRequest {
        CompletionRequest {
            model: "m".into(),
            max_tokens: 128,
            system: system.map(String::from),
            messages: vec![Message::user("first"), Message::assistant("a"), Message::user("second")],
        }
    }

    // ── Construction ──

    #[test]
    fn http_backend_builds_for_each_provider() {
        for kind in [ProviderKind::Anthropic, ProviderKind::OpenRouter] {
            let backend = HttpBackend::new(Provider::new(kind, "key".into(), None)).unwrap();
            assert_eq!(backend.provider().kind(), kind);
        }
    }

    // ── Classification ──

    #[test]
    fn retryable_signatures() {
        assert!(is_retryable("API error (429): too many requests"));
        assert!(is_retryable("API error (529): {\"type\":\"overloaded_error\"}"));
        assert!(is_retryable("Rate limit exceeded"));
        assert!(is_retryable("{\"type\":\"rate_limit_error\"}"));
        assert!(is_retryable("Overloaded"));
    }

    #[test]
    fn fatal_signatures() {
        assert!(!is_retryable("API error (401): invalid x-api-key"));
        assert!(!is_retryable("malformed response: no text content block"));
        assert!(!is_retryable("API error (400): prompt is too long"));
    }

    #[test]
    fn api_error_status_participates_in_classification() {
        let e = BackendError::Api {
            status: 529,
            body: String::new(),
        };
        assert!(e.is_transient());
        let e = BackendError::Api {
            status: 403,
            body: "forbidden".into(),
        };
        assert!(!e.is_transient());
    }

    // ── Request shaping ──

    #[test]
    fn last_user_text_skips_assistant() {
        assert_eq!(request(None).last_user_text(), "second");
    }

    #[test]
    fn anthropic_body_carries_system_separately() {
        let body = anthropic_body("claude", &request(Some("sys")));
        assert_eq!(body["system"], json!("sys"));
        assert_eq!(body["messages"].as_array().unwrap().len(), 3);
        assert_eq!(body["messages"][1]["role"], json!("assistant"));
        assert_eq!(body["max_tokens"], json!(128));
    }

    #[test]
    fn anthropic_body_omits_absent_system() {
        let body = anthropic_body("claude", &request(None));
        assert!(body.get("system").is_none());
    }

    #[test]
    fn chat_body_prepends_system_message() {
        let body = chat_completions_body("m", &request(Some("sys")));
        let msgs = body["messages"].as_array().unwrap();
        assert_eq!(msgs.len(), 4);
        assert_eq!(msgs[0]["role"], json!("system"));
        assert_eq!(msgs[3]["content"], json!("second"));
    }

    // ── Response parsing ──

    #[test]
    fn anthropic_text_picks_first_text_block() {
        let value = json!({"content": [
            {"type": "thinking", "thinking": "hmm"},
            {"type": "text", "text": "answer"},
        ]});
        assert_eq!(anthropic_text(&value).unwrap(), "answer");
    }

    #[test]
    fn anthropic_text_without_blocks_is_malformed() {
        let err = anthropic_text(&json!({"content": []})).unwrap_err();
        assert!(matches!(err, BackendError::Malformed(_)));
    }

    #[test]
    fn chat_text_reads_first_choice() {
        let value = json!({"choices": [{"message": {"content": "hi"}}]});
        assert_eq!(chat_completions_text(&value).unwrap(), "hi");
    }

    #[test]
    fn chat_text_surfaces_embedded_error() {
        let value = json!({"error": {"code": 429, "message": "Rate limit exceeded"}});
        let err = chat_completions_text(&value).unwrap_err();
        assert!(err.is_transient());
    }
}
