//! Composition solver: keeps every proposed media mixture inside the
//! hardware and biology bounds of a single well.
//!
//! A [`Composition`] only lists supplement volumes. The base reagent fills the
//! rest of the well, so its volume is always derived from the bounds rather
//! than stored.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The supplements the optimizer is allowed to vary.
///
/// Declaration order is the fixed priority order used to break ties in
/// [`clamp`]: when two supplements are equally large, the one declared first
/// is reduced first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Supplement {
    Glucose,
    NaCl,
    MgSO4,
}

impl Supplement {
    /// All supplements, in tie-break priority order.
    pub const ALL: [Supplement; 3] = [Supplement::Glucose, Supplement::NaCl, Supplement::MgSO4];

    pub fn name(self) -> &'static str {
        match self {
            Supplement::Glucose => "Glucose",
            Supplement::NaCl => "NaCl",
            Supplement::MgSO4 => "MgSO4",
        }
    }
}

impl fmt::Display for Supplement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Volume limits for one well, all in microliters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    /// Total liquid volume of a filled well.
    #[serde(default = "default_well_capacity")]
    pub well_capacity: i32,
    /// Smallest non-zero supplement dispense the pipette can do reliably.
    #[serde(default = "default_min_supplement")]
    pub min_supplement: i32,
    /// Largest volume any single supplement may take.
    #[serde(default = "default_max_supplement")]
    pub max_supplement: i32,
    /// Minimum base reagent volume needed for growth.
    #[serde(default = "default_min_base")]
    pub min_base: i32,
    /// Amount removed from the largest supplement per reduction step.
    #[serde(default = "default_reduction_step")]
    pub reduction_step: i32,
}

fn default_well_capacity() -> i32 {
    180
}

fn default_min_supplement() -> i32 {
    1
}

fn default_max_supplement() -> i32 {
    90
}

fn default_min_base() -> i32 {
    90
}

fn default_reduction_step() -> i32 {
    10
}

impl Default for Bounds {
    fn default() -> Self {
        Self {
            well_capacity: default_well_capacity(),
            min_supplement: default_min_supplement(),
            max_supplement: default_max_supplement(),
            min_base: default_min_base(),
            reduction_step: default_reduction_step(),
        }
    }
}

impl Bounds {
    /// Rejects bounds no composition can satisfy.
    pub fn validate(&self) -> Result<(), CompositionError> {
        let count = Supplement::ALL.len() as i32;
        let reason = if self.well_capacity <= 0 {
            Some("well capacity must be positive".to_string())
        } else if self.min_supplement < 1 {
            Some("minimum supplement volume must be at least 1 uL".to_string())
        } else if self.max_supplement < self.min_supplement {
            Some(format!(
                "maximum supplement volume {} is below the minimum {}",
                self.max_supplement, self.min_supplement
            ))
        } else if self.reduction_step < 1 {
            Some("reduction step must be at least 1 uL".to_string())
        } else if self.min_base < 0
            || self.min_base + count * self.min_supplement > self.well_capacity
        {
            Some(format!(
                "min base {} + {count} x min supplement {} exceeds well capacity {}",
                self.min_base, self.min_supplement, self.well_capacity
            ))
        } else {
            None
        };

        match reason {
            Some(reason) => Err(CompositionError::InvalidBounds {
                reason,
                bounds: *self,
            }),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Error)]
pub enum CompositionError {
    #[error("contradictory bounds: {reason} ({bounds:?})")]
    InvalidBounds { reason: String, bounds: Bounds },

    #[error("composition {volumes:?} cannot keep {min_base} uL of base within {well_capacity} uL")]
    InvalidComposition {
        volumes: BTreeMap<Supplement, i32>,
        min_base: i32,
        well_capacity: i32,
    },
}

/// Supplement volumes for one well, in microliters.
///
/// Supplements that are absent read as zero, including for equality.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Composition {
    volumes: BTreeMap<Supplement, i32>,
}

impl Composition {
    pub fn new(volumes: impl IntoIterator<Item = (Supplement, i32)>) -> Self {
        Self {
            volumes: volumes.into_iter().collect(),
        }
    }

    pub fn get(&self, supplement: Supplement) -> i32 {
        self.volumes.get(&supplement).copied().unwrap_or(0)
    }

    /// Returns a copy with one supplement replaced.
    pub fn with(&self, supplement: Supplement, volume: i32) -> Self {
        let mut next = self.clone();
        next.volumes.insert(supplement, volume);
        next
    }

    /// Sum of all supplement volumes.
    pub fn supplement_total(&self) -> i32 {
        Supplement::ALL.iter().map(|s| self.get(*s)).sum()
    }

    /// Base reagent needed to fill the well.
    pub fn base_volume(&self, well_capacity: i32) -> i32 {
        well_capacity - self.supplement_total()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Supplement, i32)> + '_ {
        Supplement::ALL.iter().map(|s| (*s, self.get(*s)))
    }
}

impl PartialEq for Composition {
    fn eq(&self, other: &Self) -> bool {
        self.iter().eq(other.iter())
    }
}

impl Eq for Composition {}

impl fmt::Display for Composition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.iter().map(|(s, v)| format!("{s}={v}")).collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

/// Snaps a proposed composition into a hardware-valid one.
///
/// Each supplement is first snapped into `{0} ∪ [min, max]`, always rounding
/// toward the lower volume. While the base volume is below `min_base`, the
/// largest supplement is reduced by `reduction_step` (ties go to the earliest
/// entry of [`Supplement::ALL`]); a reduction that lands below `min_supplement`
/// goes to zero.
pub fn clamp(composition: &Composition, bounds: &Bounds) -> Result<Composition, CompositionError> {
    bounds.validate()?;

    let mut volumes: BTreeMap<Supplement, i32> = BTreeMap::new();
    for supplement in Supplement::ALL {
        let raw = composition.get(supplement);
        let snapped = if raw < bounds.min_supplement {
            0
        } else {
            raw.min(bounds.max_supplement)
        };
        volumes.insert(supplement, snapped);
    }

    let mut result = Composition { volumes };
    while result.base_volume(bounds.well_capacity) < bounds.min_base {
        let Some(largest) = largest_supplement(&result) else {
            break;
        };
        let reduced = result.get(largest) - bounds.reduction_step;
        let reduced = if reduced < bounds.min_supplement { 0 } else { reduced };
        result.volumes.insert(largest, reduced);
    }

    if result.base_volume(bounds.well_capacity) < bounds.min_base {
        return Err(CompositionError::InvalidComposition {
            volumes: result.volumes,
            min_base: bounds.min_base,
            well_capacity: bounds.well_capacity,
        });
    }

    Ok(result)
}

// First supplement in priority order holding the strictly largest volume;
// `None` once everything is zero.
fn largest_supplement(composition: &Composition) -> Option<Supplement> {
    let mut best: Option<(Supplement, i32)> = None;
    for (supplement, volume) in composition.iter() {
        if volume <= 0 {
            continue;
        }
        match best {
            Some((_, best_volume)) if volume <= best_volume => {}
            _ => best = Some((supplement, volume)),
        }
    }
    best.map(|(supplement, _)| supplement)
}

/// Offsets one supplement of `center` by `delta` and re-clamps the result.
/// `center` itself is left untouched.
pub fn perturb(
    center: &Composition,
    supplement: Supplement,
    delta: i32,
    bounds: &Bounds,
) -> Result<Composition, CompositionError> {
    let shifted = center.with(supplement, center.get(supplement) + delta);
    clamp(&shifted, bounds)
}
