//! Interface de terminal do wetloop: spinners e saída colorida.
//!
//! Usa as crates `indicatif` para spinners de progresso e `console` para
//! estilização com cores. O [`JobProgress`] acompanha visualmente a espera
//! por um job no workcell, alimentado pelo callback de transição.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::lifecycle::JobStatus;
use crate::optimizer::{RunRecord, StopReason};
use crate::transfer::{ResourceSummary, TransferPlan};

/// Indicador visual de progresso para um job no workcell.
///
/// Exibe um spinner animado durante a espera, mudanças de status em amarelo
/// e o resumo final da execução em verde ou vermelho.
pub struct JobProgress {
    // Barra de progresso/spinner do indicatif.
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
}

impl JobProgress {
    /// Inicia o spinner com a descrição da espera.
    pub fn start(description: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(description.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    /// Registra uma mudança de status; chamado uma vez por status distinto.
    pub fn transition(&self, round: Option<u32>, status: JobStatus, elapsed: Duration) {
        let minutes = elapsed.as_secs() / 60;
        let prefix = round.map(|r| format!("round {r}: ")).unwrap_or_default();
        self.pb.println(format!(
            "  {} {prefix}{status} ({minutes}m elapsed)",
            self.yellow.apply_to("→")
        ));
        self.pb.set_message(format!("{prefix}{status}"));
    }

    /// Finaliza o spinner.
    pub fn finish(&self) {
        self.pb.finish_and_clear();
    }

    /// Imprime o resumo da execução com estilo colorido.
    pub fn print_run(&self, record: &RunRecord) {
        let (style, label) = match &record.stop_reason {
            Some(StopReason::Completed) => (&self.green, "completed".to_string()),
            Some(StopReason::PlateExhausted { next_column }) => (
                &self.yellow,
                format!("stopped: no column {next_column} on the plate"),
            ),
            Some(StopReason::SeedWellsExhausted { round }) => (
                &self.yellow,
                format!("stopped: no seed well left for round {round}"),
            ),
            Some(StopReason::Aborted { round, error }) => {
                (&self.red, format!("aborted in round {round}: {error}"))
            }
            None => (&self.yellow, "unfinished".to_string()),
        };
        println!();
        println!("{}", style.apply_to(format!("─── Run {} ───", record.run_id)));
        println!("  {label}");
        for round in &record.rounds {
            let next = round
                .updated_center
                .as_ref()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "  round {} (column {}): {} → {}",
                round.round, round.column, round.center, next
            );
        }
        println!("  final center: {}", record.final_center);
    }
}

/// Imprime um plano de transferências sem spinner.
pub fn print_plan(plan: &TransferPlan, summary: &ResourceSummary) {
    let dim = Style::new().dim();
    for well in &plan.wells {
        println!("  {} {:?}: {}", well.well, well.role, well.composition);
    }
    println!();
    for t in &plan.transfers {
        println!(
            "  {} → {} {:>4} µL {}",
            t.source,
            t.destination,
            t.volume,
            dim.apply_to(format!("{:?}", t.tip_policy))
        );
    }
    println!();
    println!(
        "{}",
        serde_json::to_string_pretty(summary).unwrap_or_default()
    );
}
