use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use super::layout::{COLUMNS, PlateLayout, Reagent, RowRole, WellAddress};
use crate::composition::{self, Bounds, Composition, CompositionError, Supplement};

/// Default hard cap on transfers per job accepted by the liquid handler.
pub const DEFAULT_MAX_TRANSFERS: usize = 30;

/// How the pipette handles tips for one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TipPolicy {
    FreshPerTransfer,
    ReusePerSource,
}

/// One liquid move from the reagent plate to the experiment plate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub source: WellAddress,
    pub destination: WellAddress,
    /// Microliters, always positive.
    pub volume: i32,
    pub tip_policy: TipPolicy,
    pub reagent: Reagent,
}

/// Pipette size class a transfer volume falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipetteTier {
    /// Up to 50 uL.
    Small,
    /// 51 to 200 uL.
    Medium,
    /// 201 to 1000 uL.
    Large,
}

impl PipetteTier {
    pub fn for_volume(volume: i32) -> Option<Self> {
        match volume {
            v if v <= 0 => None,
            1..=50 => Some(PipetteTier::Small),
            51..=200 => Some(PipetteTier::Medium),
            201..=1000 => Some(PipetteTier::Large),
            _ => None,
        }
    }
}

/// Counts split by pipette tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierCounts {
    pub small: usize,
    pub medium: usize,
    pub large: usize,
}

impl TierCounts {
    fn bump(&mut self, tier: PipetteTier) {
        match tier {
            PipetteTier::Small => self.small += 1,
            PipetteTier::Medium => self.medium += 1,
            PipetteTier::Large => self.large += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.small + self.medium + self.large
    }
}

/// Consumables a plan needs on the deck.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSummary {
    /// Transfers per pipette tier.
    pub transfers: TierCounts,
    /// Tips per pipette tier. A reuse-tip source costs one tip, charged to the
    /// tier of its largest dispense; every other transfer costs one tip.
    pub tips: TierCounts,
    /// Distinct fresh-tip reagent wells drawn from.
    pub reagent_wells: usize,
}

impl ResourceSummary {
    pub fn from_transfers(transfers: &[Transfer]) -> Self {
        let mut summary = ResourceSummary::default();
        let mut reuse_max: Vec<(WellAddress, i32)> = Vec::new();
        let mut fresh_sources: Vec<WellAddress> = Vec::new();

        for transfer in transfers {
            let Some(tier) = PipetteTier::for_volume(transfer.volume) else {
                continue;
            };
            summary.transfers.bump(tier);
            match transfer.tip_policy {
                TipPolicy::FreshPerTransfer => {
                    summary.tips.bump(tier);
                    if !fresh_sources.contains(&transfer.source) {
                        fresh_sources.push(transfer.source);
                    }
                }
                TipPolicy::ReusePerSource => {
                    match reuse_max.iter_mut().find(|(s, _)| *s == transfer.source) {
                        Some((_, max)) => *max = (*max).max(transfer.volume),
                        None => reuse_max.push((transfer.source, transfer.volume)),
                    }
                }
            }
        }

        for (_, max) in reuse_max {
            if let Some(tier) = PipetteTier::for_volume(max) {
                summary.tips.bump(tier);
            }
        }
        summary.reagent_wells = fresh_sources.len();
        summary
    }
}

/// A destination well and the mixture it receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationWell {
    pub well: WellAddress,
    pub role: RowRole,
    pub composition: Composition,
}

/// Ordered transfer list for one column of the experiment plate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferPlan {
    pub column: u8,
    pub wells: Vec<DestinationWell>,
    pub transfers: Vec<Transfer>,
}

impl TransferPlan {
    /// `[[source, destination, volume], ...]` as consumed by the job template.
    pub fn to_transfer_array(&self) -> Value {
        Value::Array(
            self.transfers
                .iter()
                .map(|t| json!([t.source.to_string(), t.destination.to_string(), t.volume]))
                .collect(),
        )
    }

    pub fn destination_wells(&self) -> Vec<WellAddress> {
        self.wells.iter().map(|w| w.well).collect()
    }

    /// Composition planned for a row role, if present.
    pub fn composition_for(&self, role: RowRole) -> Option<&Composition> {
        self.wells
            .iter()
            .find(|w| w.role == role)
            .map(|w| &w.composition)
    }
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("plan needs {count} transfers, the device accepts at most {limit}")]
    ExceedsLimit {
        count: usize,
        limit: usize,
        transfers: Vec<Transfer>,
    },

    #[error("column {0} is not on the plate (1-12)")]
    ColumnOutOfRange(u8),

    #[error("layout has no source well for {0}")]
    MissingSource(Reagent),

    #[error("center composition {0} is not within bounds")]
    UnclampedCenter(Composition),

    #[error("no pipette can dispense {volume} uL from {from} to {to}")]
    VolumeOutOfRange {
        volume: i32,
        from: WellAddress,
        to: WellAddress,
    },

    #[error(transparent)]
    Composition(#[from] CompositionError),
}

/// Turns a center composition into the transfer list for one plate column.
#[derive(Debug, Clone)]
pub struct TransferPlanner {
    pub layout: PlateLayout,
    pub bounds: Bounds,
    pub max_transfers: usize,
}

impl Default for TransferPlanner {
    fn default() -> Self {
        Self {
            layout: PlateLayout::default(),
            bounds: Bounds::default(),
            max_transfers: DEFAULT_MAX_TRANSFERS,
        }
    }
}

impl TransferPlanner {
    pub fn new(layout: PlateLayout, bounds: Bounds, max_transfers: usize) -> Self {
        Self {
            layout,
            bounds,
            max_transfers,
        }
    }

    /// Plans one column: a control well, the center, and every perturbation
    /// replicate the layout defines.
    ///
    /// Transfers from reuse-tip sources come first, grouped by source and in
    /// row order, followed by fresh-tip transfers grouped by source address.
    pub fn plan(
        &self,
        center: &Composition,
        column: u8,
        delta: i32,
    ) -> Result<(TransferPlan, ResourceSummary), PlanError> {
        if !(1..=COLUMNS).contains(&column) {
            return Err(PlanError::ColumnOutOfRange(column));
        }
        if composition::clamp(center, &self.bounds)? != *center {
            return Err(PlanError::UnclampedCenter(center.clone()));
        }

        let mut wells = Vec::with_capacity(self.layout.rows.len());
        let mut transfers = Vec::new();

        for (row, role) in &self.layout.rows {
            let Some(destination) = WellAddress::new(*row, column) else {
                continue;
            };
            let (mix, base) = match role {
                RowRole::Control => (Composition::default(), self.bounds.well_capacity),
                RowRole::Center => (
                    center.clone(),
                    center.base_volume(self.bounds.well_capacity),
                ),
                RowRole::Perturbation { supplement, .. } => {
                    let mix = composition::perturb(center, *supplement, delta, &self.bounds)?;
                    let base = mix.base_volume(self.bounds.well_capacity);
                    (mix, base)
                }
            };

            self.push_transfer(&mut transfers, Reagent::Base, destination, base)?;
            for supplement in Supplement::ALL {
                self.push_transfer(
                    &mut transfers,
                    Reagent::Supplement(supplement),
                    destination,
                    mix.get(supplement),
                )?;
            }

            wells.push(DestinationWell {
                well: destination,
                role: *role,
                composition: mix,
            });
        }

        // Stable: row order survives inside each source group.
        transfers.sort_by_key(|t| (t.tip_policy != TipPolicy::ReusePerSource, t.source));

        if transfers.len() > self.max_transfers {
            return Err(PlanError::ExceedsLimit {
                count: transfers.len(),
                limit: self.max_transfers,
                transfers,
            });
        }

        let summary = ResourceSummary::from_transfers(&transfers);
        Ok((
            TransferPlan {
                column,
                wells,
                transfers,
            },
            summary,
        ))
    }

    fn push_transfer(
        &self,
        transfers: &mut Vec<Transfer>,
        reagent: Reagent,
        destination: WellAddress,
        volume: i32,
    ) -> Result<(), PlanError> {
        if volume <= 0 {
            return Ok(());
        }
        let source = self
            .layout
            .source_for(reagent)
            .ok_or(PlanError::MissingSource(reagent))?;
        if PipetteTier::for_volume(volume).is_none() {
            return Err(PlanError::VolumeOutOfRange {
                volume,
                from: source,
                to: destination,
            });
        }
        let tip_policy = if self.layout.reuses_tip(source) {
            TipPolicy::ReusePerSource
        } else {
            TipPolicy::FreshPerTransfer
        };
        transfers.push(Transfer {
            source,
            destination,
            volume,
            tip_policy,
            reagent,
        });
        Ok(())
    }
}
