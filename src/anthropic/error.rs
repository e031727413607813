//! Tipos de erro para o cliente da API Anthropic.
//!
//! Define [`AnthropicError`] com variantes para rate limiting, erros da API
//! e erros de rede, além da classificação de retentativa usada pelo worker.

use thiserror::Error;

/// Erros que podem ocorrer ao interagir com a API da Anthropic.
#[derive(Debug, Error)]
pub enum AnthropicError {
    /// O servidor retornou HTTP 429 (rate limit).
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Erro retornado pela API (ex.: 401 chave inválida, 529 sobrecarga).
    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    /// Falha de rede subjacente (DNS, conexão recusada, timeout).
    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),
}

impl AnthropicError {
    /// Indica se vale a pena retentar a chamada.
    ///
    /// 429, 5xx (incluindo 529 overloaded) e falhas de rede são transitórios;
    /// os demais 4xx indicam uma requisição que falhará de novo.
    pub fn is_retryable(&self) -> bool {
        match self {
            AnthropicError::RateLimited { .. } => true,
            AnthropicError::ApiError { status, .. } => *status >= 500 || *status == 408,
            AnthropicError::NetworkError(_) => true,
        }
    }

    /// Atraso sugerido pelo servidor, quando houver.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            AnthropicError::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }
}
