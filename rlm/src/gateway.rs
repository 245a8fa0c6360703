use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use crate::agent::message::Message;
use crate::backend::{Backend, BackendError, CompletionRequest};

/// Attempts per logical call, including the first.
pub const DEFAULT_MAX_ATTEMPTS: usize = 5;
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);
pub const DEFAULT_BATCH_WORKERS: usize = 8;
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("backend error: {0}")]
    Fatal(#[source] BackendError),
    #[error("backend still failing after {attempts} attempts: {source}")]
    Exhausted {
        attempts: usize,
        #[source]
        source: BackendError,
    },
}

/// Capped exponential backoff for transient failures.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Model used when a query does not name one.
    pub model: String,
    pub max_tokens: u32,
    /// Upper bound on concurrent calls inside one batch.
    pub batch_workers: usize,
    pub retry: RetryPolicy,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-5-20250929".to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            batch_workers: DEFAULT_BATCH_WORKERS,
            retry: RetryPolicy::default(),
        }
    }
}

/// Per-call overrides of the gateway defaults.
#[derive(Clone, Debug, Default)]
pub struct QueryOptions {
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub system: Option<String>,
}

/// Uniform call + retry wrapper around a [`Backend`].
pub struct Gateway {
    backend: Arc<dyn Backend>,
    config: GatewayConfig,
}

impl Gateway {
    pub fn new(backend: Arc<dyn Backend>, config: GatewayConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    fn request(&self, messages: Vec<Message>, options: &QueryOptions) -> CompletionRequest {
        CompletionRequest {
            model: options
                .model
                .clone()
                .unwrap_or_else(|| self.config.model.clone()),
            max_tokens: options.max_tokens.unwrap_or(self.config.max_tokens),
            system: options.system.clone(),
            messages,
        }
    }

    /// Run one request, retrying transient failures with capped exponential backoff.
    pub async fn call(&self, request: &CompletionRequest) -> Result<String, GatewayError> {
        let policy = &self.config.retry;
        let max_attempts = policy.max_attempts.max(1);
        let mut backoff = policy.initial_backoff;
        let mut attempt = 1;
        loop {
            match self.backend.complete(request).await {
                Ok(text) => return Ok(text),
                Err(e) if !e.is_transient() => return Err(GatewayError::Fatal(e)),
                Err(e) if attempt >= max_attempts => {
                    return Err(GatewayError::Exhausted {
                        attempts: attempt,
                        source: e,
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        "Retrying backend call (attempt {}/{}) after {:.1}s: {}",
                        attempt + 1,
                        max_attempts,
                        backoff.as_secs_f64(),
                        e
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(policy.max_backoff);
                    attempt += 1;
                }
            }
        }
    }

    /// Send a whole conversation.
    pub async fn call_messages(
        &self,
        messages: &[Message],
        options: &QueryOptions,
    ) -> Result<String, GatewayError> {
        let request = self.request(messages.to_vec(), options);
        self.call(&request).await
    }

    /// Send a single prompt as one user message.
    pub async fn query(&self, prompt: &str, options: &QueryOptions) -> Result<String, GatewayError> {
        let request = self.request(vec![Message::user(prompt)], options);
        self.call(&request).await
    }

    /// Send prompts concurrently; results come back in input order.
    ///
    /// At most `min(batch_workers, prompts.len())` calls are in flight. The first
    /// failure fails the whole batch and drops the calls still running.
    pub async fn query_batched(
        &self,
        prompts: &[String],
        options: &QueryOptions,
    ) -> Result<Vec<String>, GatewayError> {
        if prompts.is_empty() {
            return Ok(Vec::new());
        }
        let workers = self.config.batch_workers.clamp(1, prompts.len());
        tracing::debug!("dispatching batch of {} prompts on {workers} workers", prompts.len());

        let mut pending = futures::stream::iter(prompts.iter().enumerate())
            .map(|(index, prompt)| async move { (index, self.query(prompt, options).await) })
            .buffer_unordered(workers);

        let mut done: Vec<(usize, String)> = Vec::with_capacity(prompts.len());
        while let Some((index, result)) = pending.next().await {
            done.push((index, result?));
        }
        done.sort_by_key(|(index, _)| *index);
        Ok(done.into_iter().map(|(_, text)| text).collect())
    }
}
