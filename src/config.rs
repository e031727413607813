//! Configuração do docforge carregada a partir de `docforge.toml`.
//!
//! A struct [`DocforgeConfig`] reúne os limites de taxa, orçamento e
//! concorrência de uma migração. Campos ausentes no arquivo usam defaults.
//! A variável de ambiente `ANTHROPIC_API_KEY` tem precedência sobre o arquivo,
//! e as flags da CLI têm precedência sobre ambos.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::anthropic::ModelTier;
use crate::rate_limiter::Tier;
use crate::worker::RetryConfig;

/// Nome do arquivo de configuração procurado no diretório do projeto.
pub const CONFIG_FILE: &str = "docforge.toml";

/// Configuração de nível superior carregada de `docforge.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DocforgeConfig {
    /// Chave da API Anthropic.
    pub api_key: String,

    /// Modelo usado para migrar os documentos.
    pub model: ModelTier,

    /// Tier de limites de taxa da conta.
    pub tier: Tier,

    /// Sobrescreve o limite de requisições por minuto do tier.
    pub requests_per_minute: Option<u32>,

    /// Sobrescreve o limite de tokens por minuto do tier.
    pub tokens_per_minute: Option<u32>,

    /// Máximo de documentos em processamento simultâneo.
    pub max_concurrent: usize,

    /// Teto de custo em dólares; ausente significa ilimitado.
    pub max_cost: Option<f64>,

    /// Interrompe tarefas pendentes na primeira falha.
    pub stop_on_error: bool,

    /// Máximo de retentativas por chamada à API.
    pub max_retries: u32,

    /// Atraso base em milissegundos para backoff exponencial.
    pub base_delay_ms: u64,

    /// Limite de tokens de saída por documento.
    pub max_tokens: u32,

    /// Diretório do estado persistido e do lock, relativo ao projeto.
    pub state_dir: PathBuf,
}

impl Default for DocforgeConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: ModelTier::Sonnet,
            tier: Tier::default(),
            requests_per_minute: None,
            tokens_per_minute: None,
            max_concurrent: 3,
            max_cost: None,
            stop_on_error: false,
            max_retries: 3,
            base_delay_ms: 1000,
            max_tokens: 8192,
            state_dir: PathBuf::from(".docforge"),
        }
    }
}

impl DocforgeConfig {
    /// Carrega `docforge.toml` de `project_dir`, ou os defaults se o arquivo
    /// não existir.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let path = project_dir.join(CONFIG_FILE);
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            toml::from_str::<DocforgeConfig>(&contents)
                .with_context(|| format!("Invalid configuration in {}", path.display()))?
        } else {
            Self::default()
        };

        // Variável de ambiente tem precedência sobre o arquivo para a chave API.
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY")
            && !key.is_empty()
        {
            config.api_key = key;
        }

        if config.state_dir.is_relative() {
            config.state_dir = project_dir.join(&config.state_dir);
        }
        config.validate()?;
        Ok(config)
    }

    /// Rejeita combinações que tornariam a execução impossível.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            bail!("max_concurrent must be at least 1");
        }
        if let Some(max) = self.max_cost
            && !(max.is_finite() && max > 0.0)
        {
            bail!("max_cost must be a positive amount, got {max}");
        }
        if self.requests_per_minute == Some(0) || self.tokens_per_minute == Some(0) {
            bail!("rate limit overrides must be greater than zero");
        }
        Ok(())
    }

    /// Tier efetivo, aplicando as sobrescritas de limites.
    pub fn effective_tier(&self) -> Tier {
        if self.requests_per_minute.is_none() && self.tokens_per_minute.is_none() {
            return self.tier;
        }
        Tier::custom(
            self.requests_per_minute
                .unwrap_or_else(|| self.tier.requests_per_minute()),
            self.tokens_per_minute
                .unwrap_or_else(|| self.tier.tokens_per_minute()),
        )
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            base_delay_ms: self.base_delay_ms,
        }
    }
}
