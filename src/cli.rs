//! Interface de linha de comando do docforge baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (migrate, estimate,
//! status, unlock) e flags globais que sobrescrevem o `docforge.toml`.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::anthropic::ModelTier;
use crate::config::DocforgeConfig;
use crate::rate_limiter::Tier;

/// docforge: migração de documentação com limites de taxa e orçamento.
#[derive(Debug, Parser)]
#[command(name = "docforge", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Diretório do projeto (onde ficam `docforge.toml` e o estado).
    #[arg(long, short = 'C', global = true, default_value = ".")]
    pub project_dir: PathBuf,

    /// Nível de modelo a usar nesta execução.
    #[arg(long, global = true)]
    pub model: Option<ModelArg>,

    /// Tier de limites de taxa (tier1..tier4).
    #[arg(long, global = true)]
    pub tier: Option<Tier>,

    /// Teto de custo em dólares para a execução.
    #[arg(long, global = true)]
    pub max_cost: Option<f64>,

    /// Máximo de documentos processados em paralelo.
    #[arg(long, global = true)]
    pub concurrency: Option<usize>,

    /// Número máximo de retentativas por chamada à API.
    #[arg(long, global = true)]
    pub max_retries: Option<u32>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

/// Argumento de modelo aceito pela CLI, mapeado para [`ModelTier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModelArg {
    /// Modelo rápido e econômico para documentos simples.
    Haiku,
    /// Modelo equilibrado, padrão para a maioria das migrações.
    Sonnet,
    /// Modelo mais capaz para documentação densa.
    Opus,
}

impl From<ModelArg> for ModelTier {
    fn from(arg: ModelArg) -> Self {
        match arg {
            ModelArg::Haiku => ModelTier::Haiku,
            ModelArg::Sonnet => ModelTier::Sonnet,
            ModelArg::Opus => ModelTier::Opus,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Executa o plano de migração sob o lock do projeto.
    Migrate {
        /// Arquivo JSON do plano gerado pelo planner.
        plan: PathBuf,

        /// Continua a execução anterior, pulando documentos já migrados.
        #[arg(long)]
        resume: bool,

        /// Cancela as tarefas pendentes na primeira falha.
        #[arg(long)]
        stop_on_error: bool,
    },

    /// Estima tokens e custo de um plano sem chamar a API.
    Estimate {
        /// Arquivo JSON do plano.
        plan: PathBuf,
    },

    /// Mostra o estado persistido da última execução.
    Status,

    /// Mostra ou remove o lock de migração.
    Unlock {
        /// Remove o lock mesmo que pertença a um processo ativo.
        #[arg(long)]
        force: bool,
    },
}

impl Cli {
    /// Aplica as flags globais sobre a configuração carregada do arquivo.
    pub fn apply_overrides(&self, config: &mut DocforgeConfig) {
        if let Some(model) = self.model {
            config.model = model.into();
        }
        if let Some(tier) = self.tier {
            config.tier = tier;
        }
        if let Some(max_cost) = self.max_cost {
            config.max_cost = Some(max_cost);
        }
        if let Some(concurrency) = self.concurrency {
            config.max_concurrent = concurrency;
        }
        if let Some(max_retries) = self.max_retries {
            config.max_retries = max_retries;
        }
        if let Command::Migrate {
            stop_on_error: true,
            ..
        } = self.command
        {
            config.stop_on_error = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_migrate_subcommand() {
        let cli = Cli::parse_from(["docforge", "migrate", "plan.json", "--resume"]);
        match cli.command {
            Command::Migrate {
                plan,
                resume,
                stop_on_error,
            } => {
                assert_eq!(plan, PathBuf::from("plan.json"));
                assert!(resume);
                assert!(!stop_on_error);
            }
            _ => panic!("expected Migrate command"),
        }
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from([
            "docforge",
            "--model",
            "opus",
            "--tier",
            "tier3",
            "--max-cost",
            "12.5",
            "--concurrency",
            "4",
            "--max-retries",
            "5",
            "--verbose",
            "status",
        ]);
        assert!(cli.verbose);
        assert_eq!(cli.model, Some(ModelArg::Opus));
        assert_eq!(cli.tier, Some(Tier::Tier3));
        assert_eq!(cli.max_cost, Some(12.5));
        assert_eq!(cli.concurrency, Some(4));
        assert_eq!(cli.max_retries, Some(5));
    }

    #[test]
    fn cli_rejects_unknown_tier() {
        assert!(Cli::try_parse_from(["docforge", "--tier", "gold", "status"]).is_err());
    }

    #[test]
    fn overrides_win_over_config() {
        let cli = Cli::parse_from([
            "docforge",
            "--model",
            "haiku",
            "--concurrency",
            "8",
            "migrate",
            "plan.json",
            "--stop-on-error",
        ]);
        let mut config = DocforgeConfig::default();
        cli.apply_overrides(&mut config);
        assert_eq!(config.model, ModelTier::Haiku);
        assert_eq!(config.max_concurrent, 8);
        assert!(config.stop_on_error);
        assert!(config.max_cost.is_none());
    }

    #[test]
    fn cli_parses_unlock_force() {
        let cli = Cli::parse_from(["docforge", "unlock", "--force"]);
        assert!(matches!(cli.command, Command::Unlock { force: true }));
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
