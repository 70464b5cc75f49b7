//! The closed loop: plan a column, run it on the workcell, read growth back
//! and move the center composition along the measured gradient.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};
use uuid::Uuid;

use crate::composition::{self, Composition, Supplement};
use crate::error::WetloopError;
use crate::lifecycle::{JobOutcome, JobStatus, LifecycleController, PollPolicy};
use crate::measurement::{GrowthDeltas, MeasurementSource, PlateReadings};
use crate::transfer::{COLUMNS, ROWS, ResourceSummary, TransferPlan, TransferPlanner, WellAddress};
use crate::workcell::ToolInvoker;

pub const HISTORY_FILE: &str = "history.json";

/// What to do when a job outlives the poll policy's `max_wait`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Stop the run and record the timeout.
    #[default]
    Abort,
    /// Record a round without a center update and move to the next column.
    SkipRound,
}

#[derive(Debug, Clone)]
pub struct OptimizerSettings {
    pub definition_id: i64,
    /// Barcode of the experiment plate.
    pub target: String,
    pub rounds: u32,
    pub first_column: u8,
    pub delta: i32,
    pub learning_rate: f64,
    pub on_timeout: TimeoutPolicy,
    pub poll: PollPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopReason {
    Completed,
    PlateExhausted { next_column: u8 },
    /// Column 1 has no seed well left for this round.
    SeedWellsExhausted { round: u32 },
    Aborted { round: u32, error: String },
}

/// Everything that happened in one round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundRecord {
    pub round: u32,
    pub column: u8,
    pub center: Composition,
    pub plan: Option<TransferPlan>,
    pub summary: Option<ResourceSummary>,
    pub job: Option<JobOutcome>,
    pub readings: Option<PlateReadings>,
    pub deltas: Option<GrowthDeltas>,
    pub gradient: BTreeMap<Supplement, f64>,
    pub updated_center: Option<Composition>,
    pub error: Option<String>,
}

impl RoundRecord {
    fn new(round: u32, column: u8, center: &Composition) -> Self {
        Self {
            round,
            column,
            center: center.clone(),
            plan: None,
            summary: None,
            job: None,
            readings: None,
            deltas: None,
            gradient: BTreeMap::new(),
            updated_center: None,
            error: None,
        }
    }
}

/// Append-only log of a run, written to disk once the loop ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub target: String,
    pub definition_id: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub initial_center: Composition,
    pub final_center: Composition,
    pub rounds: Vec<RoundRecord>,
    pub stop_reason: Option<StopReason>,
}

impl RunRecord {
    fn new(settings: &OptimizerSettings, center: &Composition) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            target: settings.target.clone(),
            definition_id: settings.definition_id,
            started_at: Utc::now(),
            finished_at: None,
            initial_center: center.clone(),
            final_center: center.clone(),
            rounds: Vec::new(),
            stop_reason: None,
        }
    }

    fn finish(&mut self, reason: StopReason) {
        self.stop_reason = Some(reason);
        self.finished_at = Some(Utc::now());
    }

    /// Writes the record as pretty JSON to `<dir>/history.json`.
    pub fn persist(&self, dir: &Path) -> Result<PathBuf, WetloopError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(HISTORY_FILE);
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(path)
    }
}

/// Seed wells live in column 1, one row per round.
fn seed_well(round: u32) -> Option<WellAddress> {
    let row = ROWS.get(usize::try_from(round.checked_sub(1)?).ok()?)?;
    WellAddress::new(*row, 1)
}

fn well_list(wells: &[WellAddress]) -> String {
    let names: Vec<String> = wells.iter().map(|w| w.to_string()).collect();
    Value::from(names).to_string()
}

/// Moves each supplement by `round(learning_rate * gradient)` and re-clamps.
pub fn step_center(
    center: &Composition,
    deltas: &GrowthDeltas,
    learning_rate: f64,
    bounds: &composition::Bounds,
) -> Result<(Composition, BTreeMap<Supplement, f64>), WetloopError> {
    let mut gradient = BTreeMap::new();
    let mut proposed = center.clone();
    for supplement in Supplement::ALL {
        let g = deltas.gradient(supplement);
        gradient.insert(supplement, g);
        // No single step can usefully move more than a whole well.
        let reach = f64::from(bounds.well_capacity).abs();
        let step = (learning_rate * g).round().clamp(-reach, reach) as i32;
        proposed = proposed.with(supplement, center.get(supplement).saturating_add(step));
    }
    Ok((composition::clamp(&proposed, bounds)?, gradient))
}

pub struct OptimizerLoop<'a, C: ToolInvoker, M: MeasurementSource> {
    lifecycle: LifecycleController<'a, C>,
    measurements: &'a M,
    planner: TransferPlanner,
    settings: OptimizerSettings,
}

impl<'a, C: ToolInvoker, M: MeasurementSource> OptimizerLoop<'a, C, M> {
    pub fn new(
        client: &'a C,
        call_timeout: Duration,
        measurements: &'a M,
        planner: TransferPlanner,
        settings: OptimizerSettings,
    ) -> Self {
        Self {
            lifecycle: LifecycleController::new(client, call_timeout),
            measurements,
            planner,
            settings,
        }
    }

    /// Runs up to `settings.rounds` rounds starting from `initial`.
    ///
    /// Errors never escape: they end up in the record's stop reason or, for a
    /// skipped round, in that round's entry. `on_transition` receives the
    /// round number with every job status change.
    pub async fn run<F>(&self, initial: &Composition, mut on_transition: F) -> RunRecord
    where
        F: FnMut(u32, JobStatus, Duration),
    {
        let mut record = RunRecord::new(&self.settings, initial);
        let mut center = match composition::clamp(initial, &self.planner.bounds) {
            Ok(c) => c,
            Err(e) => {
                record.finish(StopReason::Aborted {
                    round: 0,
                    error: e.to_string(),
                });
                return record;
            }
        };
        record.final_center = center.clone();
        let mut monitoring: Vec<WellAddress> = Vec::new();

        for round in 1..=self.settings.rounds {
            let column = u32::from(self.settings.first_column) + round - 1;
            let Some(column) = u8::try_from(column).ok().filter(|c| *c <= COLUMNS) else {
                warn!(round, "no destination column left on the plate");
                record.finish(StopReason::PlateExhausted {
                    next_column: u8::try_from(column).unwrap_or(u8::MAX),
                });
                return record;
            };

            let Some(seed) = seed_well(round) else {
                warn!(round, "no seed well left in column 1");
                record.finish(StopReason::SeedWellsExhausted { round });
                return record;
            };

            info!(round, column, %seed, %center, "starting round");
            let mut entry = RoundRecord::new(round, column, &center);
            let result = self
                .run_round(round, column, &center, &mut monitoring, &mut entry, |s, e| {
                    on_transition(round, s, e)
                })
                .await;

            match result {
                Ok(updated) => {
                    info!(round, %updated, "center updated");
                    center = updated;
                    record.final_center = center.clone();
                    record.rounds.push(entry);
                }
                Err(e)
                    if e.is_wait_timeout() && self.settings.on_timeout == TimeoutPolicy::SkipRound =>
                {
                    warn!(round, error = %e, "job timed out, skipping round");
                    entry.error = Some(e.to_string());
                    record.rounds.push(entry);
                }
                Err(e) => {
                    warn!(round, error = %e, "aborting run");
                    entry.error = Some(e.to_string());
                    record.rounds.push(entry);
                    record.finish(StopReason::Aborted {
                        round,
                        error: e.to_string(),
                    });
                    return record;
                }
            }
        }

        record.finish(StopReason::Completed);
        record
    }

    async fn run_round<F>(
        &self,
        round: u32,
        column: u8,
        center: &Composition,
        monitoring: &mut Vec<WellAddress>,
        entry: &mut RoundRecord,
        on_transition: F,
    ) -> Result<Composition, WetloopError>
    where
        F: FnMut(JobStatus, Duration),
    {
        let (plan, summary) = self.planner.plan(center, column, self.settings.delta)?;
        let dest_wells = plan.destination_wells();
        monitoring.extend(dest_wells.iter().copied());
        entry.plan = Some(plan.clone());
        entry.summary = Some(summary);

        let last_round = round == self.settings.rounds
            || u32::from(column) >= u32::from(COLUMNS);
        let next_seed = if last_round {
            String::new()
        } else {
            seed_well(round + 1).map(|w| w.to_string()).unwrap_or_default()
        };
        let inputs = json!({
            "transfer_array": plan.to_transfer_array().to_string(),
            "dest_wells": well_list(&dest_wells),
            "monitoring_wells": well_list(monitoring),
            "seed_well": seed_well(round).map(|w| w.to_string()).unwrap_or_default(),
            "next_seed_well": next_seed,
        });
        let reason = format!("Round {round}/{} (column {column})", self.settings.rounds);

        let handle = self
            .lifecycle
            .submit(
                self.settings.definition_id,
                &self.settings.target,
                inputs,
                &reason,
            )
            .await?;
        let outcome = self
            .lifecycle
            .await_terminal(&handle, &self.settings.poll, on_transition)
            .await?;
        let status = outcome.status;
        entry.job = Some(outcome);
        if status != JobStatus::Completed {
            return Err(WetloopError::JobNotCompleted { handle, status });
        }

        let readings = self
            .measurements
            .fetch(&self.settings.target, column)
            .await?;
        let deltas = GrowthDeltas::from_readings(&readings, &self.planner.layout, column);
        entry.readings = Some(readings);

        let (updated, gradient) = step_center(
            center,
            &deltas,
            self.settings.learning_rate,
            &self.planner.bounds,
        )?;
        entry.deltas = Some(deltas);
        entry.gradient = gradient;
        entry.updated_center = Some(updated.clone());
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composition::Bounds;
    use crate::lifecycle::{STATUS_TOOL, SUBMIT_TOOL};
    use crate::measurement::MeasurementError;
    use crate::workcell::mock::ScriptedInvoker;
    use std::sync::Mutex;

    fn center() -> Composition {
        Composition::new([
            (Supplement::Glucose, 20),
            (Supplement::NaCl, 10),
            (Supplement::MgSO4, 15),
        ])
    }

    fn settings(rounds: u32, first_column: u8) -> OptimizerSettings {
        OptimizerSettings {
            definition_id: 3,
            target: "PLATE-1".into(),
            rounds,
            first_column,
            delta: 10,
            learning_rate: 5.0,
            on_timeout: TimeoutPolicy::Abort,
            poll: PollPolicy {
                poll_interval: Duration::from_millis(1),
                max_wait: Duration::from_secs(5),
                max_consecutive_failures: 2,
            },
        }
    }

    /// Every well starts at 0.1; the rows listed grow by the given amount.
    struct FixedGrowth {
        growth: Vec<(char, f64)>,
        columns: Mutex<Vec<u8>>,
    }

    impl FixedGrowth {
        fn new(growth: &[(char, f64)]) -> Self {
            Self {
                growth: growth.to_vec(),
                columns: Mutex::new(Vec::new()),
            }
        }
    }

    impl MeasurementSource for FixedGrowth {
        async fn fetch(&self, _target: &str, column: u8) -> Result<PlateReadings, MeasurementError> {
            self.columns.lock().unwrap().push(column);
            let mut readings = PlateReadings::default();
            for row in ROWS {
                let well = WellAddress::new(row, column).unwrap();
                let grown = self
                    .growth
                    .iter()
                    .find(|(r, _)| *r == row)
                    .map_or(0.0, |(_, g)| *g);
                readings.baseline.insert(well, 0.1);
                readings.endpoint.insert(well, 0.1 + grown);
            }
            Ok(readings)
        }
    }

    fn completing_workcell() -> ScriptedInvoker {
        ScriptedInvoker::new()
            .ok(SUBMIT_TOOL, json!({"uuid": "job-1"}))
            .ok(STATUS_TOOL, json!({"status": "running"}))
            .ok(STATUS_TOOL, json!({"status": "completed"}))
            .ok(STATUS_TOOL, json!({"status": "running"}))
            .ok(STATUS_TOOL, json!({"status": "completed"}))
    }

    #[tokio::test]
    async fn two_rounds_follow_the_gradient() {
        let workcell = completing_workcell();
        // Center grows 0.4, Glucose replicates 0.6, NaCl 0.2, MgSO4 0.4.
        let growth = FixedGrowth::new(&[
            ('B', 0.4),
            ('C', 0.6),
            ('D', 0.6),
            ('E', 0.2),
            ('F', 0.2),
            ('G', 0.4),
            ('H', 0.4),
        ]);
        let optimizer = OptimizerLoop::new(
            &workcell,
            Duration::from_secs(1),
            &growth,
            TransferPlanner::default(),
            settings(2, 2),
        );

        let mut transitions = Vec::new();
        let record = optimizer
            .run(&center(), |round, status, _| transitions.push((round, status)))
            .await;

        assert_eq!(record.stop_reason, Some(StopReason::Completed));
        assert_eq!(record.rounds.len(), 2);
        assert_eq!(*growth.columns.lock().unwrap(), vec![2, 3]);

        // round(5 * 0.2) = 1, round(5 * -0.2) = -1, MgSO4 unchanged.
        let first = record.rounds[0].updated_center.clone().unwrap();
        assert_eq!(first.get(Supplement::Glucose), 21);
        assert_eq!(first.get(Supplement::NaCl), 9);
        assert_eq!(first.get(Supplement::MgSO4), 15);
        assert_eq!(record.rounds[1].center, first);
        assert_eq!(record.final_center.get(Supplement::Glucose), 22);

        assert_eq!(
            transitions,
            vec![
                (1, JobStatus::Running),
                (1, JobStatus::Completed),
                (2, JobStatus::Running),
                (2, JobStatus::Completed),
            ]
        );
    }

    #[tokio::test]
    async fn job_inputs_carry_wells_and_seeds() {
        let workcell = completing_workcell();
        let growth = FixedGrowth::new(&[]);
        let optimizer = OptimizerLoop::new(
            &workcell,
            Duration::from_secs(1),
            &growth,
            TransferPlanner::default(),
            settings(2, 2),
        );
        optimizer.run(&center(), |_, _, _| {}).await;

        let submits = workcell.calls_to(SUBMIT_TOOL);
        assert_eq!(submits.len(), 2);

        let first = &submits[0]["inputs"];
        assert_eq!(first["plate_barcode"], "PLATE-1");
        assert_eq!(first["seed_well"], "A1");
        assert_eq!(first["next_seed_well"], "B1");
        let dest: Vec<String> =
            serde_json::from_str(first["dest_wells"].as_str().unwrap()).unwrap();
        assert_eq!(dest.first().map(String::as_str), Some("A2"));
        let transfers: Value =
            serde_json::from_str(first["transfer_array"].as_str().unwrap()).unwrap();
        assert_eq!(transfers[0], json!(["D1", "A2", 180]));

        let second = &submits[1]["inputs"];
        assert_eq!(second["seed_well"], "B1");
        assert_eq!(second["next_seed_well"], "");
        let monitoring: Vec<String> =
            serde_json::from_str(second["monitoring_wells"].as_str().unwrap()).unwrap();
        assert_eq!(monitoring.len(), 16);
        assert_eq!(submits[1]["reason"], "Round 2/2 (column 3)");
    }

    #[tokio::test]
    async fn plate_exhaustion_stops_without_error() {
        let workcell = completing_workcell();
        let growth = FixedGrowth::new(&[]);
        let optimizer = OptimizerLoop::new(
            &workcell,
            Duration::from_secs(1),
            &growth,
            TransferPlanner::default(),
            settings(3, 12),
        );
        let record = optimizer.run(&center(), |_, _, _| {}).await;

        assert_eq!(record.rounds.len(), 1);
        assert_eq!(
            record.stop_reason,
            Some(StopReason::PlateExhausted { next_column: 13 })
        );
        assert!(record.rounds[0].updated_center.is_some());
    }

    #[tokio::test]
    async fn run_stops_when_seed_wells_run_out() {
        let workcell = completing_workcell();
        let growth = FixedGrowth::new(&[]);
        let optimizer = OptimizerLoop::new(
            &workcell,
            Duration::from_secs(1),
            &growth,
            TransferPlanner::default(),
            settings(10, 2),
        );
        let record = optimizer.run(&center(), |_, _, _| {}).await;

        assert_eq!(
            record.stop_reason,
            Some(StopReason::SeedWellsExhausted { round: 9 })
        );
        assert_eq!(record.rounds.len(), 8);

        let submits = workcell.calls_to(SUBMIT_TOOL);
        assert_eq!(submits.len(), 8);
        assert!(submits.iter().all(|s| s["inputs"]["seed_well"] != ""));
        assert_eq!(submits[7]["inputs"]["seed_well"], "H1");
        assert_eq!(submits[7]["inputs"]["next_seed_well"], "");
    }

    #[tokio::test]
    async fn failed_job_aborts_the_run() {
        let workcell = ScriptedInvoker::new()
            .ok(SUBMIT_TOOL, json!({"uuid": "job-1"}))
            .ok(STATUS_TOOL, json!({"status": "failed"}));
        let growth = FixedGrowth::new(&[]);
        let optimizer = OptimizerLoop::new(
            &workcell,
            Duration::from_secs(1),
            &growth,
            TransferPlanner::default(),
            settings(3, 2),
        );
        let record = optimizer.run(&center(), |_, _, _| {}).await;

        match record.stop_reason {
            Some(StopReason::Aborted { round, error }) => {
                assert_eq!(round, 1);
                assert!(error.contains("FAILED"));
            }
            other => panic!("expected Aborted, got {other:?}"),
        }
        assert_eq!(record.rounds.len(), 1);
        assert!(record.rounds[0].job.is_some());
        assert!(record.rounds[0].updated_center.is_none());
        assert!(growth.columns.lock().unwrap().is_empty());
        assert_eq!(record.final_center, center());
    }

    #[tokio::test]
    async fn timeout_policy_decides_between_skip_and_abort() {
        let stuck = || {
            ScriptedInvoker::new()
                .ok(SUBMIT_TOOL, json!({"uuid": "job-1"}))
                .ok(STATUS_TOOL, json!({"status": "pending_approval"}))
        };
        let mut s = settings(2, 2);
        s.poll.max_wait = Duration::from_millis(10);

        let workcell = stuck();
        let growth = FixedGrowth::new(&[]);
        let abort = OptimizerLoop::new(
            &workcell,
            Duration::from_secs(1),
            &growth,
            TransferPlanner::default(),
            s.clone(),
        )
        .run(&center(), |_, _, _| {})
        .await;
        assert!(matches!(abort.stop_reason, Some(StopReason::Aborted { round: 1, .. })));
        assert_eq!(abort.rounds.len(), 1);

        s.on_timeout = TimeoutPolicy::SkipRound;
        let workcell = stuck();
        let skip = OptimizerLoop::new(
            &workcell,
            Duration::from_secs(1),
            &growth,
            TransferPlanner::default(),
            s,
        )
        .run(&center(), |_, _, _| {})
        .await;
        assert_eq!(skip.stop_reason, Some(StopReason::Completed));
        assert_eq!(skip.rounds.len(), 2);
        assert!(skip.rounds.iter().all(|r| r.error.is_some()));
        assert_eq!(skip.rounds[1].column, 3);
        assert_eq!(skip.final_center, center());
    }

    #[tokio::test]
    async fn plan_over_cap_aborts_before_submitting() {
        let workcell = completing_workcell();
        let growth = FixedGrowth::new(&[]);
        let planner = TransferPlanner::new(Default::default(), Bounds::default(), 10);
        let record = OptimizerLoop::new(
            &workcell,
            Duration::from_secs(1),
            &growth,
            planner,
            settings(1, 2),
        )
        .run(&center(), |_, _, _| {})
        .await;

        assert!(matches!(record.stop_reason, Some(StopReason::Aborted { .. })));
        assert!(workcell.calls_to(SUBMIT_TOOL).is_empty());
    }

    #[test]
    fn step_center_rounds_and_reclamps() {
        let deltas = GrowthDeltas {
            control: 0.0,
            center: 0.0,
            perturbed: BTreeMap::from([
                (Supplement::Glucose, vec![30.0, 30.0]),
                (Supplement::NaCl, vec![-5.0, -5.0]),
                (Supplement::MgSO4, vec![0.05, 0.05]),
            ]),
            abs_control: 0.0,
            abs_center: 0.0,
        };
        let (next, gradient) =
            step_center(&center(), &deltas, 5.0, &Bounds::default()).unwrap();
        // Glucose would be 170: capped at 90, then the base floor pulls it to 70.
        assert_eq!(next.get(Supplement::Glucose), 70);
        // NaCl 10 - 25 < 0 snaps to 0.
        assert_eq!(next.get(Supplement::NaCl), 0);
        // round(0.25) = 0.
        assert_eq!(next.get(Supplement::MgSO4), 15);
        assert_eq!(gradient[&Supplement::NaCl], -5.0);
    }

    #[test]
    fn huge_learning_rate_steps_are_bounded() {
        let deltas = GrowthDeltas {
            control: 0.0,
            center: 0.0,
            perturbed: BTreeMap::from([
                (Supplement::Glucose, vec![1.0, 1.0]),
                (Supplement::NaCl, vec![-1.0, -1.0]),
                (Supplement::MgSO4, vec![f64::NAN]),
            ]),
            abs_control: 0.0,
            abs_center: 0.0,
        };
        let bounds = Bounds::default();
        let (next, _) = step_center(&center(), &deltas, 1e12, &bounds).unwrap();
        for supplement in Supplement::ALL {
            let volume = next.get(supplement);
            assert!(volume >= 0 && volume <= bounds.max_supplement);
        }
        assert!(next.base_volume(bounds.well_capacity) >= bounds.min_base);
        // A NaN gradient leaves the axis where it was.
        assert_eq!(next.get(Supplement::MgSO4), 15);
    }

    #[test]
    fn seed_wells_walk_down_column_one() {
        assert_eq!(seed_well(1).unwrap().to_string(), "A1");
        assert_eq!(seed_well(8).unwrap().to_string(), "H1");
        assert_eq!(seed_well(9), None);
        assert_eq!(seed_well(0), None);
    }

    #[test]
    fn persist_writes_history_json() {
        let dir = tempfile::tempdir().unwrap();
        let mut record = RunRecord::new(&settings(1, 2), &center());
        record.finish(StopReason::PlateExhausted { next_column: 13 });

        let path = record.persist(&dir.path().join("runs")).unwrap();
        assert!(path.ends_with("runs/history.json"));

        let back: RunRecord = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back.run_id, record.run_id);
        assert_eq!(back.stop_reason, record.stop_reason);
        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["stop_reason"]["kind"], "plate_exhausted");
        assert_eq!(raw["initial_center"]["Glucose"], 20);
    }
}
