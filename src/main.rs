use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use wetloop::cli::{Cli, Command, CompositionArgs};
use wetloop::composition::{self, Composition};
use wetloop::config::WetloopConfig;
use wetloop::lifecycle::{JobHandle, LifecycleController};
use wetloop::measurement::WorkcellMeasurements;
use wetloop::optimizer::{OptimizerLoop, OptimizerSettings, StopReason};
use wetloop::registration::{find_definition, register_definition};
use wetloop::transfer::{PlateLayout, TransferPlanner};
use wetloop::ui::{self, JobProgress};
use wetloop::workcell::WorkcellClient;

fn init_tracing(verbose: bool) {
    let default = if verbose { "wetloop=debug" } else { "wetloop=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = WetloopConfig::load()?;
    if let Some(url) = cli.workcell {
        config.workcell_url = url;
    }

    match cli.command {
        Command::Run {
            target,
            rounds,
            definition_id,
            definition_file,
            definition_name,
            center,
        } => {
            run(
                &config,
                target,
                rounds,
                definition_id,
                definition_file.as_deref(),
                &definition_name,
                center,
            )
            .await
        }
        Command::Plan {
            center,
            column,
            delta,
        } => plan(&config, center, column, delta),
        Command::Status { job } => status(&config, &job).await,
        Command::Cancel { job, confirm } => cancel(&config, &job, confirm).await,
    }
}

fn client(config: &WetloopConfig) -> Result<WorkcellClient> {
    Ok(WorkcellClient::with_retry(
        &config.workcell_url,
        config.lifecycle.read_retry(),
    )?)
}

fn planner(config: &WetloopConfig) -> TransferPlanner {
    TransferPlanner::new(
        PlateLayout::default(),
        config.bounds,
        config.planner.max_transfers,
    )
}

/// Uses the given id, else the registered definition with `name`, else
/// registers `file` under `name`.
async fn resolve_definition(
    client: &WorkcellClient,
    id: Option<i64>,
    file: Option<&Path>,
    name: &str,
    timeout: Duration,
) -> Result<i64> {
    if let Some(id) = id {
        return Ok(id);
    }
    if let Some(id) = find_definition(client, name, timeout).await? {
        info!(definition = name, id, "using registered job definition");
        return Ok(id);
    }
    let Some(file) = file else {
        bail!("job definition '{name}' is not registered; pass --definition-file to upload it");
    };

    let code = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let file_name = file
        .file_name()
        .and_then(|n| n.to_str())
        .context("definition file has no usable file name")?;
    Ok(register_definition(client, name, file_name, &code, timeout).await?)
}

async fn run(
    config: &WetloopConfig,
    target: String,
    rounds: u32,
    definition_id: Option<i64>,
    definition_file: Option<&Path>,
    definition_name: &str,
    center: CompositionArgs,
) -> Result<()> {
    let client = client(config)?;
    let timeout = config.lifecycle.call_timeout();
    let definition_id =
        resolve_definition(&client, definition_id, definition_file, definition_name, timeout)
            .await?;

    let measurements =
        WorkcellMeasurements::new(&client, client.http().clone(), client.base_url(), timeout);
    let settings = OptimizerSettings {
        definition_id,
        target,
        rounds,
        first_column: config.optimizer.first_column,
        delta: config.optimizer.delta,
        learning_rate: config.optimizer.learning_rate,
        on_timeout: config.optimizer.on_timeout,
        poll: config.lifecycle.poll_policy(),
    };
    let optimizer = OptimizerLoop::new(&client, timeout, &measurements, planner(config), settings);

    let progress = JobProgress::start(&format!("running {rounds} round(s)"));
    let record = optimizer
        .run(&center.composition(), |round, status, elapsed| {
            progress.transition(Some(round), status, elapsed)
        })
        .await;
    progress.finish();

    let path = record.persist(&config.optimizer.run_dir)?;
    progress.print_run(&record);
    println!("History saved to {}", path.display());

    if let Some(StopReason::Aborted { round, error }) = &record.stop_reason {
        bail!("run aborted in round {round}: {error}");
    }
    Ok(())
}

fn plan(config: &WetloopConfig, center: CompositionArgs, column: u8, delta: Option<i32>) -> Result<()> {
    let requested = center.composition();
    let clamped: Composition = composition::clamp(&requested, &config.bounds)?;
    if clamped != requested {
        println!("center clamped from {requested} to {clamped}");
    }
    let (plan, summary) = planner(config).plan(
        &clamped,
        column,
        delta.unwrap_or(config.optimizer.delta),
    )?;
    ui::print_plan(&plan, &summary);
    Ok(())
}

async fn status(config: &WetloopConfig, job: &str) -> Result<()> {
    let client = client(config)?;
    let controller = LifecycleController::new(&client, config.lifecycle.call_timeout());
    let (status, payload) = controller.status(&JobHandle::from(job)).await?;
    println!("{job}: {status}");
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

async fn cancel(config: &WetloopConfig, job: &str, confirm: bool) -> Result<()> {
    let client = client(config)?;
    let controller = LifecycleController::new(&client, config.lifecycle.call_timeout());
    controller.cancel(&JobHandle::from(job), confirm).await?;
    println!("{job} cancelled");
    Ok(())
}
