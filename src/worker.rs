//! The unit of work behind every queued request.
//!
//! The executor only knows the [`Worker`] trait: give it a task, get back the
//! output path plus token usage, or an error that is final for that task.
//! [`AnthropicWorker`] is the production implementation; it owns retry and
//! backoff for transient API failures so the core never re-runs a task.

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::anthropic::{
    AnthropicClient, AnthropicError, Message, MessageSender, MessagesRequest, MessagesResponse,
    ModelTier,
};
use crate::cost::TokenUsage;
use crate::error::WorkerError;
use crate::plan::MigrationTask;

/// What a worker reports for a finished task.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerOutput {
    pub output_path: PathBuf,
    /// Model that served the request, used to price the usage.
    pub model: String,
    pub usage: TokenUsage,
}

impl WorkerOutput {
    pub fn tokens_used(&self) -> u64 {
        self.usage.total()
    }
}

pub trait Worker: Send + Sync + 'static {
    fn execute(
        &self,
        task: &MigrationTask,
    ) -> impl Future<Output = Result<WorkerOutput, WorkerError>> + Send;
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries before the task is reported as failed.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
        }
    }
}

impl RetryConfig {
    /// Calculate the delay for a given retry attempt using exponential backoff.
    /// delay = base_delay_ms * 2^(attempt - 1)
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        self.base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
    }
}

const SYSTEM_PROMPT: &str = "You are a technical writer migrating an existing project's \
documentation into a new, consistently structured documentation set. Preserve every fact \
from the source. Respond with the complete migrated markdown document and nothing else.";

fn build_request(model: ModelTier, max_tokens: u32, task: &MigrationTask, source: &str) -> MessagesRequest {
    MessagesRequest {
        model: model.api_id().to_string(),
        max_tokens,
        system: Some(SYSTEM_PROMPT.to_string()),
        messages: vec![Message::user(format!(
            "Document type: {doc_type}\nSource file: {source_path}\nTarget file: {target_path}\n\n\
             Migrate the following document:\n\n{source}",
            doc_type = task.doc_type,
            source_path = task.source_path.display(),
            target_path = task.target_path.display(),
        ))],
    }
}

/// Migrates one document per call through the Anthropic Messages API.
pub struct AnthropicWorker<S = AnthropicClient> {
    sender: S,
    model: ModelTier,
    max_tokens: u32,
    retry: RetryConfig,
}

impl<S: MessageSender> AnthropicWorker<S> {
    pub fn new(sender: S, model: ModelTier, max_tokens: u32, retry: RetryConfig) -> Self {
        Self {
            sender,
            model,
            max_tokens,
            retry,
        }
    }

    async fn send_with_retry(
        &self,
        req: &MessagesRequest,
    ) -> Result<MessagesResponse, AnthropicError> {
        let mut attempt = 0;
        loop {
            match self.sender.send_message(req).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    let delay_ms = self
                        .retry
                        .delay_for_attempt(attempt)
                        .max(e.retry_after_ms().unwrap_or(0));
                    warn!(
                        attempt,
                        max = self.retry.max_retries,
                        delay_ms,
                        error = %e,
                        "retrying API call"
                    );
                    sleep(Duration::from_millis(delay_ms)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl<S: MessageSender + 'static> Worker for AnthropicWorker<S> {
    async fn execute(&self, task: &MigrationTask) -> Result<WorkerOutput, WorkerError> {
        let source = tokio::fs::read_to_string(&task.source_path)
            .await
            .map_err(|source| WorkerError::ReadSource {
                path: task.source_path.clone(),
                source,
            })?;

        let req = build_request(self.model, self.max_tokens, task, &source);
        let response = self.send_with_retry(&req).await?;
        let text = response.text();
        if text.trim().is_empty() {
            return Err(WorkerError::EmptyResponse);
        }

        let write_err = |source| WorkerError::WriteTarget {
            path: task.target_path.clone(),
            source,
        };
        if let Some(parent) = task.target_path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
        }
        tokio::fs::write(&task.target_path, text)
            .await
            .map_err(write_err)?;

        let usage = TokenUsage::new(response.usage.input_tokens, response.usage.output_tokens)
            .with_cache(
                response.usage.cache_creation_input_tokens,
                response.usage.cache_read_input_tokens,
            );
        debug!(target = %task.target_path.display(), tokens = usage.total(), "document migrated");

        let model = if response.model.is_empty() {
            req.model
        } else {
            response.model
        };
        Ok(WorkerOutput {
            output_path: task.target_path.clone(),
            model,
            usage,
        })
    }
}
