//! Interface de linha de comando do wetloop baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (run, plan, status,
//! cancel) e flags globais (--workcell, --verbose).

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::composition::{Composition, Supplement};

/// Otimização em malha fechada de meios de cultura num workcell.
#[derive(Debug, Parser)]
#[command(name = "wetloop", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// URL do workcell; tem precedência sobre `WORKCELL_URL` e o arquivo.
    #[arg(long, global = true)]
    pub workcell: Option<String>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

/// Volumes de suplemento em µL.
#[derive(Debug, Clone, Copy, Args)]
pub struct CompositionArgs {
    #[arg(long, default_value_t = 20)]
    pub glucose: i32,

    #[arg(long, default_value_t = 10)]
    pub nacl: i32,

    #[arg(long, default_value_t = 15)]
    pub mgso4: i32,
}

impl CompositionArgs {
    pub fn composition(&self) -> Composition {
        Composition::new([
            (Supplement::Glucose, self.glucose),
            (Supplement::NaCl, self.nacl),
            (Supplement::MgSO4, self.mgso4),
        ])
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Executa o ciclo de otimização sobre uma placa.
    Run {
        /// Código de barras da placa experimental.
        #[arg(long)]
        target: String,

        /// Número de rodadas (uma coluna por rodada).
        #[arg(long, default_value_t = 5)]
        rounds: u32,

        /// Definição de job já registrada no workcell.
        #[arg(long, conflicts_with = "definition_file")]
        definition_id: Option<i64>,

        /// Arquivo de definição a registrar caso ainda não exista.
        #[arg(long)]
        definition_file: Option<PathBuf>,

        /// Nome sob o qual a definição é procurada e registrada.
        #[arg(long, default_value = "wetloop media optimization")]
        definition_name: String,

        #[command(flatten)]
        center: CompositionArgs,
    },

    /// Mostra as transferências de uma coluna sem falar com o workcell.
    Plan {
        #[command(flatten)]
        center: CompositionArgs,

        /// Coluna de destino (1-12).
        #[arg(long, default_value_t = 2)]
        column: u8,

        /// Passo da perturbação; usa o da configuração se omitido.
        #[arg(long)]
        delta: Option<i32>,
    },

    /// Consulta o status atual de um job.
    Status {
        /// Identificador do job no workcell.
        job: String,
    },

    /// Cancela um job no workcell.
    Cancel {
        /// Identificador do job no workcell.
        job: String,

        /// Confirma o cancelamento; sem esta flag nada é cancelado.
        #[arg(long, default_value_t = false)]
        confirm: bool,
    },
}
