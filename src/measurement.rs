//! Growth measurements read back from the plate reader.
//!
//! The optimizer only depends on [`MeasurementSource`]; [`WorkcellMeasurements`]
//! is the implementation that talks to the workcell's datasets API.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

use crate::composition::Supplement;
use crate::transfer::{PlateLayout, RowRole, WellAddress};
use crate::workcell::{ToolInvoker, WorkcellError};

const PLATES_TOOL: &str = "list_culture_plates";
const DATASETS_PATH: &str = "/api/datasets/";
const CLIENT_HEADER: &str = "X-Monomer-Client";
const CLIENT_ID: &str = "desktop-frontend";
const OD600_WAVELENGTH: i64 = 600;

#[derive(Debug, Error)]
pub enum MeasurementError {
    #[error("plate '{barcode}' not found on the workcell")]
    PlateNotFound { barcode: String },

    #[error("no OD600 datasets for plate '{barcode}'")]
    NoDatasets { barcode: String },

    #[error("no OD600 readings for column {column} on plate '{barcode}'")]
    NoColumnReadings { barcode: String, column: u8 },

    #[error("datasets request failed: {0}")]
    Request(String),

    #[error("datasets API returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("could not decode datasets response: {reason}; body: {body}")]
    Decode { reason: String, body: String },

    #[error(transparent)]
    Workcell(#[from] WorkcellError),
}

/// Earliest and latest OD600 reading for every well of one column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlateReadings {
    pub baseline: BTreeMap<WellAddress, f64>,
    pub endpoint: BTreeMap<WellAddress, f64>,
}

impl PlateReadings {
    /// Growth over the run, `endpoint - baseline`. Missing wells read as 0.
    pub fn growth(&self, well: WellAddress) -> f64 {
        self.endpoint.get(&well).copied().unwrap_or(0.0)
            - self.baseline.get(&well).copied().unwrap_or(0.0)
    }

    pub fn endpoint_of(&self, well: WellAddress) -> f64 {
        self.endpoint.get(&well).copied().unwrap_or(0.0)
    }
}

/// Per-role growth for one round's column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrowthDeltas {
    pub control: f64,
    pub center: f64,
    /// Replicate deltas per perturbed supplement, in replicate order.
    pub perturbed: BTreeMap<Supplement, Vec<f64>>,
    pub abs_control: f64,
    pub abs_center: f64,
}

impl GrowthDeltas {
    pub fn from_readings(readings: &PlateReadings, layout: &PlateLayout, column: u8) -> Self {
        let mut deltas = GrowthDeltas {
            control: 0.0,
            center: 0.0,
            perturbed: BTreeMap::new(),
            abs_control: 0.0,
            abs_center: 0.0,
        };

        for (row, role) in &layout.rows {
            let Some(well) = WellAddress::new(*row, column) else {
                continue;
            };
            match role {
                RowRole::Control => {
                    deltas.control = readings.growth(well);
                    deltas.abs_control = readings.endpoint_of(well);
                }
                RowRole::Center => {
                    deltas.center = readings.growth(well);
                    deltas.abs_center = readings.endpoint_of(well);
                }
                RowRole::Perturbation { supplement, .. } => deltas
                    .perturbed
                    .entry(*supplement)
                    .or_default()
                    .push(readings.growth(well)),
            }
        }
        deltas
    }

    /// `mean(replicate deltas) - center delta` for one supplement axis.
    pub fn gradient(&self, supplement: Supplement) -> f64 {
        match self.perturbed.get(&supplement) {
            Some(reps) if !reps.is_empty() => {
                reps.iter().sum::<f64>() / reps.len() as f64 - self.center
            }
            _ => 0.0,
        }
    }
}

/// Source of baseline/endpoint readings for a plate column.
#[allow(async_fn_in_trait)]
pub trait MeasurementSource {
    async fn fetch(&self, target: &str, column: u8) -> Result<PlateReadings, MeasurementError>;
}

/// Reads OD600 datasets from the workcell.
///
/// The plate id is resolved from the barcode through the tool endpoint; the
/// readings come from the REST datasets API next to it.
pub struct WorkcellMeasurements<'a, C: ToolInvoker> {
    tools: &'a C,
    http: Client,
    base_url: String,
    timeout: Duration,
}

impl<'a, C: ToolInvoker> WorkcellMeasurements<'a, C> {
    pub fn new(tools: &'a C, http: Client, base_url: &str, timeout: Duration) -> Self {
        Self {
            tools,
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    async fn plate_uuid(&self, barcode: &str) -> Result<String, MeasurementError> {
        let plates = self
            .tools
            .invoke_read(PLATES_TOOL, json!({}), self.timeout)
            .await?;
        let list = match &plates {
            Value::Array(items) => items.as_slice(),
            _ => {
                return Err(WorkcellError::protocol(
                    PLATES_TOOL,
                    "expected a list of plates",
                    plates.to_string(),
                )
                .into());
            }
        };
        list.iter()
            .find(|p| p.get("barcode").and_then(Value::as_str) == Some(barcode))
            .and_then(|p| p.get("uuid").and_then(Value::as_str))
            .map(str::to_string)
            .ok_or_else(|| MeasurementError::PlateNotFound {
                barcode: barcode.to_string(),
            })
    }

    async fn datasets(&self) -> Result<Vec<Value>, MeasurementError> {
        let response = self
            .http
            .get(format!("{}{DATASETS_PATH}", self.base_url))
            .header(CLIENT_HEADER, CLIENT_ID)
            .query(&[("verbose", "1"), ("ordering", "-createdAt")])
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| MeasurementError::Request(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| MeasurementError::Request(e.to_string()))?;
        if !status.is_success() {
            return Err(MeasurementError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let value: Value = serde_json::from_str(&body).map_err(|e| MeasurementError::Decode {
            reason: e.to_string(),
            body: body.clone(),
        })?;
        match value {
            Value::Array(items) => Ok(items),
            Value::Object(mut map) => match map.remove("results") {
                Some(Value::Array(items)) => Ok(items),
                _ => Err(MeasurementError::Decode {
                    reason: "no results list".into(),
                    body,
                }),
            },
            _ => Err(MeasurementError::Decode {
                reason: "expected a list of datasets".into(),
                body,
            }),
        }
    }
}

impl<C: ToolInvoker> MeasurementSource for WorkcellMeasurements<'_, C> {
    async fn fetch(&self, target: &str, column: u8) -> Result<PlateReadings, MeasurementError> {
        let plate_uuid = self.plate_uuid(target).await?;
        let datasets = self.datasets().await?;
        let wells = column_wells(column);
        readings_for_plate(&datasets, &plate_uuid, &wells).map_err(|kind| match kind {
            Missing::Datasets => MeasurementError::NoDatasets {
                barcode: target.to_string(),
            },
            Missing::Readings => MeasurementError::NoColumnReadings {
                barcode: target.to_string(),
                column,
            },
        })
    }
}

fn column_wells(column: u8) -> Vec<WellAddress> {
    crate::transfer::ROWS
        .iter()
        .filter_map(|row| WellAddress::new(*row, column))
        .collect()
}

enum Missing {
    Datasets,
    Readings,
}

fn is_od600_for(dataset: &Value, plate_uuid: &str) -> bool {
    let meta = &dataset["metadata"];
    meta["resultMetadata"]["measurementWavelength"].as_i64() == Some(OD600_WAVELENGTH)
        && meta["plateMetadata"]["uuid"].as_str() == Some(plate_uuid)
}

fn reading(wells: &Value, well: WellAddress) -> Option<f64> {
    match wells.get(well.to_string())? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Picks the earliest and latest timestamps that carry a reading for the
/// column, across every OD600 dataset of the plate.
fn readings_for_plate(
    datasets: &[Value],
    plate_uuid: &str,
    wells: &[WellAddress],
) -> Result<PlateReadings, Missing> {
    let matching: Vec<&Value> = datasets
        .iter()
        .filter(|ds| is_od600_for(ds, plate_uuid))
        .collect();
    if matching.is_empty() {
        return Err(Missing::Datasets);
    }

    let mut by_timestamp: BTreeMap<&str, &Value> = BTreeMap::new();
    for ds in matching {
        let Some(results) = ds["structuredData"]["resultsByWell"].as_object() else {
            continue;
        };
        for (timestamp, values) in results {
            let has_column = wells
                .iter()
                .any(|w| reading(values, *w).is_some_and(|v| v != 0.0));
            if has_column {
                by_timestamp.insert(timestamp.as_str(), values);
            }
        }
    }

    let (Some((first_ts, first)), Some((last_ts, last))) =
        (by_timestamp.first_key_value(), by_timestamp.last_key_value())
    else {
        return Err(Missing::Readings);
    };
    debug!(baseline = first_ts, endpoint = last_ts, "selected OD600 timepoints");

    let pick = |values: &Value| {
        wells
            .iter()
            .map(|w| (*w, reading(values, *w).unwrap_or(0.0)))
            .collect::<BTreeMap<_, _>>()
    };
    Ok(PlateReadings {
        baseline: pick(*first),
        endpoint: pick(*last),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workcell::mock::ScriptedInvoker;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn well(s: &str) -> WellAddress {
        s.parse().unwrap()
    }

    fn dataset(plate: &str, wavelength: i64, results: Value) -> Value {
        json!({
            "metadata": {
                "resultMetadata": {"measurementWavelength": wavelength},
                "plateMetadata": {"uuid": plate}
            },
            "structuredData": {"resultsByWell": results}
        })
    }

    fn plates() -> ScriptedInvoker {
        ScriptedInvoker::new().ok(
            PLATES_TOOL,
            json!([
                {"barcode": "OTHER", "uuid": "p-0"},
                {"barcode": "PLATE-1", "uuid": "p-1"}
            ]),
        )
    }

    #[test]
    fn picks_earliest_and_latest_column_readings() {
        let datasets = vec![
            dataset(
                "p-1",
                600,
                json!({
                    "2026-01-01T12:00:00Z": {"A2": 0.50, "B2": "0.61"},
                    "2026-01-01T08:00:00Z": {"A2": 0.10, "B2": 0.11},
                    "2026-01-01T09:00:00Z": {"A3": 0.90}
                }),
            ),
            dataset("p-1", 450, json!({"2026-01-01T00:00:00Z": {"A2": 9.0}})),
            dataset("p-9", 600, json!({"2026-01-01T00:00:00Z": {"A2": 9.0}})),
        ];
        let readings = readings_for_plate(&datasets, "p-1", &column_wells(2)).ok().unwrap();

        assert_eq!(readings.baseline[&well("A2")], 0.10);
        assert_eq!(readings.endpoint[&well("A2")], 0.50);
        assert_eq!(readings.endpoint[&well("B2")], 0.61);
        // Wells absent from the reading default to zero.
        assert_eq!(readings.endpoint[&well("H2")], 0.0);
        assert_eq!(readings.baseline.len(), 8);
        assert!((readings.growth(well("A2")) - 0.40).abs() < 1e-9);
    }

    #[test]
    fn missing_datasets_and_readings_are_distinguished() {
        let none = readings_for_plate(&[], "p-1", &column_wells(2));
        assert!(matches!(none, Err(Missing::Datasets)));

        let other_column = vec![dataset("p-1", 600, json!({"t1": {"A5": 0.3}}))];
        let empty = readings_for_plate(&other_column, "p-1", &column_wells(2));
        assert!(matches!(empty, Err(Missing::Readings)));
    }

    #[test]
    fn growth_deltas_follow_layout_roles() {
        let layout = PlateLayout::default();
        let mut readings = PlateReadings::default();
        for (row, base, end) in [
            ('A', 0.1, 0.2),
            ('B', 0.1, 0.5),
            ('C', 0.1, 0.7),
            ('D', 0.1, 0.9),
            ('E', 0.1, 0.3),
            ('F', 0.1, 0.3),
        ] {
            let w = WellAddress::new(row, 4).unwrap();
            readings.baseline.insert(w, base);
            readings.endpoint.insert(w, end);
        }

        let deltas = GrowthDeltas::from_readings(&readings, &layout, 4);
        assert!((deltas.control - 0.1).abs() < 1e-9);
        assert!((deltas.center - 0.4).abs() < 1e-9);
        assert!((deltas.abs_center - 0.5).abs() < 1e-9);
        assert_eq!(deltas.perturbed[&Supplement::Glucose].len(), 2);

        // mean(0.6, 0.8) - 0.4
        assert!((deltas.gradient(Supplement::Glucose) - 0.3).abs() < 1e-9);
        assert!((deltas.gradient(Supplement::NaCl) + 0.2).abs() < 1e-9);
        // G/H unread: both replicates are zero growth.
        assert!((deltas.gradient(Supplement::MgSO4) + 0.4).abs() < 1e-9);
    }

    #[tokio::test]
    async fn fetch_reads_datasets_api() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/datasets/"))
            .and(query_param("verbose", "1"))
            .and(query_param("ordering", "-createdAt"))
            .and(header(CLIENT_HEADER, CLIENT_ID))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "count": 1,
                "results": [dataset("p-1", 600, json!({
                    "t0": {"B2": 0.05},
                    "t1": {"B2": 0.45}
                }))]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let tools = plates();
        let source = WorkcellMeasurements::new(
            &tools,
            Client::new(),
            &server.uri(),
            Duration::from_secs(5),
        );
        let readings = source.fetch("PLATE-1", 2).await.unwrap();
        assert_eq!(readings.baseline[&well("B2")], 0.05);
        assert_eq!(readings.endpoint[&well("B2")], 0.45);
    }

    #[tokio::test]
    async fn fetch_accepts_bare_array() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/datasets/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                dataset("p-1", 600, json!({"t0": {"C3": 0.2}}))
            ])))
            .mount(&server)
            .await;

        let tools = plates();
        let source =
            WorkcellMeasurements::new(&tools, Client::new(), &server.uri(), Duration::from_secs(5));
        let readings = source.fetch("PLATE-1", 3).await.unwrap();
        // A single timepoint is both baseline and endpoint.
        assert_eq!(readings.growth(well("C3")), 0.0);
        assert_eq!(readings.endpoint[&well("C3")], 0.2);
    }

    #[tokio::test]
    async fn unknown_plate_is_reported() {
        let tools = plates();
        let source = WorkcellMeasurements::new(
            &tools,
            Client::new(),
            "http://127.0.0.1:1",
            Duration::from_secs(1),
        );
        let err = source.fetch("MISSING", 2).await.unwrap_err();
        assert!(matches!(err, MeasurementError::PlateNotFound { .. }));
    }

    #[tokio::test]
    async fn server_error_keeps_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/datasets/"))
            .respond_with(ResponseTemplate::new(500).set_body_string("db down"))
            .mount(&server)
            .await;

        let tools = plates();
        let source =
            WorkcellMeasurements::new(&tools, Client::new(), &server.uri(), Duration::from_secs(5));
        match source.fetch("PLATE-1", 2).await.unwrap_err() {
            MeasurementError::Status { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "db down");
            }
            other => panic!("expected Status, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn no_plate_datasets_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/datasets/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": []})))
            .mount(&server)
            .await;

        let tools = plates();
        let source =
            WorkcellMeasurements::new(&tools, Client::new(), &server.uri(), Duration::from_secs(5));
        let err = source.fetch("PLATE-1", 2).await.unwrap_err();
        assert!(matches!(err, MeasurementError::NoDatasets { .. }));
    }
}
