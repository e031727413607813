//! Interface de terminal do docforge: barra de progresso e saída colorida.
//!
//! Usa `indicatif` para a barra de progresso da migração e `console` para
//! estilização com cores. O [`RunProgress`] recebe os eventos do executor
//! e os relatórios finais são impressos pelas funções `print_*`.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::executor::ExecutorCallbacks;
use crate::lock::LockRecord;
use crate::orchestrator::{Estimate, RunReport};
use crate::state::{Stage, WorkflowState};

/// Barra de progresso de uma execução de migração.
///
/// Cada documento concluído é impresso em verde e cada falha em vermelho,
/// acima da barra, sem interromper a animação.
pub struct RunProgress {
    // Barra de progresso do indicatif.
    pb: ProgressBar,
}

impl RunProgress {
    /// Inicia a barra para `total` documentos.
    pub fn start(total: usize) -> Self {
        let pb = ProgressBar::new(total as u64);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.cyan} [{elapsed_precise}] {bar:30.cyan/blue} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");
        pb.set_style(style);
        pb.enable_steady_tick(Duration::from_millis(100));
        Self { pb }
    }

    /// Callbacks do executor que alimentam esta barra.
    pub fn callbacks(&self) -> ExecutorCallbacks {
        let on_progress = self.pb.clone();
        let on_complete = self.pb.clone();
        let on_error = self.pb.clone();
        let green = Style::new().green().bold();
        let red = Style::new().red().bold();

        ExecutorCallbacks::new()
            .on_progress(move |done, total, task| {
                on_progress.set_length(total as u64);
                on_progress.set_position(done as u64);
                if let Some(task) = task {
                    on_progress.set_message(task.target_path.display().to_string());
                }
            })
            .on_task_complete(move |result| {
                on_complete.println(format!(
                    "  {} {} ({} tokens, {})",
                    green.apply_to("✓"),
                    result.task.target_path.display(),
                    result.tokens_used,
                    format_cost(result.cost)
                ));
            })
            .on_task_error(move |task, error| {
                on_error.println(format!(
                    "  {} {}: {error}",
                    red.apply_to("✗"),
                    task.target_path.display()
                ));
            })
    }

    /// Remove a barra do terminal.
    pub fn finish(&self) {
        self.pb.finish_and_clear();
    }
}

/// Formata um valor em dólares com quatro casas decimais.
pub fn format_cost(cost: f64) -> String {
    format!("${cost:.4}")
}

/// Formata uma duração como `1m 05s` ou `12.3s`.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 60 {
        format!("{}m {:02}s", secs / 60, secs % 60)
    } else {
        format!("{:.1}s", d.as_secs_f64())
    }
}

fn stage_style(stage: Stage) -> Style {
    match stage {
        Stage::Completed => Style::new().green().bold(),
        Stage::Failed => Style::new().red().bold(),
        _ => Style::new().yellow(),
    }
}

/// Imprime o resumo final da execução com o detalhamento de custo por modelo.
pub fn print_report(report: &RunReport) {
    let bold = Style::new().bold();
    let dim = Style::new().dim();
    let result = &report.result;

    println!();
    println!("{}", stage_style(report.stage).apply_to("─── Migration Summary ───"));
    println!("  Stage:      {}", stage_style(report.stage).apply_to(report.stage));
    println!("  Completed:  {}", result.completed.len());
    println!("  Failed:     {}", result.failed.len());
    if report.skipped > 0 {
        println!("  Skipped:    {} (done in an earlier run)", report.skipped);
    }
    println!("  Duration:   {}", format_duration(result.total_time));
    println!("  Tokens:     {}", result.total_tokens);
    println!("  Cost:       {}", bold.apply_to(format_cost(result.total_cost)));
    if let Some(max) = report.cost.max_cost {
        println!("  Budget:     {}", format_cost(max));
    }
    if report.cost.cache_savings > 0.0 {
        println!("  Cache saved {}", format_cost(report.cost.cache_savings));
    }

    if !report.cost.by_model.is_empty() {
        println!();
        for (model, usage) in &report.cost.by_model {
            println!(
                "  {}  {} calls, {} in / {} out, {}",
                dim.apply_to(model),
                usage.requests,
                usage.input_tokens,
                usage.output_tokens,
                format_cost(usage.cost)
            );
        }
    }

    if !result.failed.is_empty() {
        println!();
        let red = Style::new().red();
        for task in &result.failed {
            println!(
                "  {} {}: {}",
                red.apply_to("✗"),
                task.target_path.display(),
                task.error.as_deref().unwrap_or("unknown error")
            );
        }
    }

    if let Some(halt) = &report.halted {
        println!();
        println!("  {}", Style::new().red().bold().apply_to(halt));
    } else if report.stage == Stage::Migrating {
        println!();
        println!("  Run `docforge migrate <plan> --resume` to retry the failed documents.");
    }
}

/// Imprime a estimativa de tokens e custo de um plano.
pub fn print_estimate(estimate: &Estimate, model: &str) {
    println!("  Documents:  {}", estimate.tasks);
    println!("  Model:      {model}");
    println!("  Input:      ~{} tokens", estimate.input_tokens);
    println!("  Output:     ~{} tokens", estimate.output_tokens);
    println!(
        "  Cost:       ~{}",
        Style::new().bold().apply_to(format_cost(estimate.cost))
    );
    match estimate.max_cost {
        Some(max) if estimate.exceeds_budget() => println!(
            "  {} estimate exceeds the budget of {}",
            Style::new().red().bold().apply_to("!"),
            format_cost(max)
        ),
        Some(max) => println!("  Budget:     {} (fits)", format_cost(max)),
        None => println!("  Budget:     unlimited"),
    }
}

/// Imprime o estado persistido e o lock atual.
pub fn print_status(state: Option<&WorkflowState>, can_resume: bool, lock: Option<&LockRecord>) {
    let Some(state) = state else {
        println!("  No migration has been started in this project.");
        return;
    };

    println!("  Stage:      {}", stage_style(state.current_stage).apply_to(state.current_stage));
    println!("  Version:    {}", state.version);
    println!("  Started:    {}", state.started_at.to_rfc3339());
    println!("  Updated:    {}", state.updated_at.to_rfc3339());
    println!("  API calls:  {}", state.api_call_count);
    println!("  Tokens:     {}", state.total_tokens);
    println!("  Cost:       {}", format_cost(state.total_cost));
    if let Some(remaining) = state.remaining_budget() {
        println!("  Remaining:  {}", format_cost(remaining));
    }
    if let Some(progress) = &state.migration {
        use crate::plan::TaskStatus;
        println!(
            "  Documents:  {} completed, {} failed, {} in progress",
            progress.count(TaskStatus::Completed),
            progress.count(TaskStatus::Failed),
            progress.count(TaskStatus::InProgress)
        );
    }
    println!("  Resumable:  {}", if can_resume { "yes" } else { "no" });

    if !state.checkpoints.is_empty() {
        println!();
        let dim = Style::new().dim();
        for checkpoint in &state.checkpoints {
            println!(
                "  {} {:<13} {}",
                dim.apply_to(checkpoint.timestamp.format("%Y-%m-%d %H:%M:%S")),
                checkpoint.stage.to_string(),
                checkpoint.description
            );
        }
    }

    if let Some(lock) = lock {
        println!();
        print_lock(lock);
    }
}

/// Imprime o dono do lock de migração.
pub fn print_lock(lock: &LockRecord) {
    println!(
        "  {} locked by pid {} for {}",
        Style::new().yellow().apply_to("●"),
        lock.pid,
        format_duration(lock.age())
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn costs_use_four_decimals() {
        assert_eq!(format_cost(0.036), "$0.0360");
        assert_eq!(format_cost(12.0), "$12.0000");
    }

    #[test]
    fn durations_switch_to_minutes() {
        assert_eq!(format_duration(Duration::from_millis(12_340)), "12.3s");
        assert_eq!(format_duration(Duration::from_secs(65)), "1m 05s");
    }
}
