//! Plate geometry and the role assigned to each destination row.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::composition::Supplement;

/// Row letters of a 96-well plate, top to bottom.
pub const ROWS: [char; 8] = ['A', 'B', 'C', 'D', 'E', 'F', 'G', 'H'];

/// Number of columns on a 96-well plate.
pub const COLUMNS: u8 = 12;

/// Number of replicate wells per perturbed supplement.
pub const REPLICATES: u8 = 2;

/// A well on a 96-well plate, e.g. `D1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WellAddress {
    row: char,
    column: u8,
}

impl WellAddress {
    /// Builds an address, returning `None` outside of rows A–H and columns 1–12.
    pub fn new(row: char, column: u8) -> Option<Self> {
        let row = row.to_ascii_uppercase();
        if ROWS.contains(&row) && (1..=COLUMNS).contains(&column) {
            Some(Self { row, column })
        } else {
            None
        }
    }

    pub fn row(&self) -> char {
        self.row
    }

    pub fn column(&self) -> u8 {
        self.column
    }
}

impl fmt::Display for WellAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.row, self.column)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseWellError(pub String);

impl fmt::Display for ParseWellError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid well address '{}'", self.0)
    }
}

impl std::error::Error for ParseWellError {}

impl FromStr for WellAddress {
    type Err = ParseWellError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.trim().chars();
        let row = chars.next().ok_or_else(|| ParseWellError(s.to_string()))?;
        let column: u8 = chars
            .as_str()
            .parse()
            .map_err(|_| ParseWellError(s.to_string()))?;
        WellAddress::new(row, column).ok_or_else(|| ParseWellError(s.to_string()))
    }
}

impl Serialize for WellAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for WellAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A liquid the planner can draw from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Reagent {
    /// Base growth medium that fills whatever the supplements leave.
    Base,
    Supplement(Supplement),
}

impl fmt::Display for Reagent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reagent::Base => f.write_str("Base"),
            Reagent::Supplement(s) => write!(f, "{s}"),
        }
    }
}

/// What a destination row holds in each round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowRole {
    /// Base reagent only, at full well capacity.
    Control,
    /// The current center composition.
    Center,
    /// The center with one supplement raised by the step size.
    Perturbation { supplement: Supplement, replicate: u8 },
}

/// Where every role and reagent lives on the two plates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlateLayout {
    /// Destination row for each role, in plate order.
    pub rows: Vec<(char, RowRole)>,
    /// Source well on the reagent plate for each reagent.
    pub sources: BTreeMap<Reagent, WellAddress>,
    /// Sources whose dispenses share a single tip.
    pub reuse_tip_sources: Vec<WellAddress>,
}

impl Default for PlateLayout {
    fn default() -> Self {
        let mut rows = vec![('A', RowRole::Control), ('B', RowRole::Center)];
        let mut letters = ROWS[2..].iter();
        for supplement in Supplement::ALL {
            for replicate in 1..=REPLICATES {
                if let Some(row) = letters.next() {
                    rows.push((
                        *row,
                        RowRole::Perturbation {
                            supplement,
                            replicate,
                        },
                    ));
                }
            }
        }

        let well = |row, column| WellAddress { row, column };
        let sources = BTreeMap::from([
            (Reagent::Supplement(Supplement::Glucose), well('A', 1)),
            (Reagent::Supplement(Supplement::NaCl), well('B', 1)),
            (Reagent::Supplement(Supplement::MgSO4), well('C', 1)),
            (Reagent::Base, well('D', 1)),
        ]);

        Self {
            rows,
            sources,
            reuse_tip_sources: vec![well('D', 1)],
        }
    }
}

impl PlateLayout {
    /// Destination wells for one column, in row order.
    pub fn destination_wells(&self, column: u8) -> Vec<WellAddress> {
        self.rows
            .iter()
            .filter_map(|(row, _)| WellAddress::new(*row, column))
            .collect()
    }

    /// Row letter holding `role`, if the layout uses it.
    pub fn row_for(&self, role: RowRole) -> Option<char> {
        self.rows
            .iter()
            .find(|(_, r)| *r == role)
            .map(|(row, _)| *row)
    }

    pub fn source_for(&self, reagent: Reagent) -> Option<WellAddress> {
        self.sources.get(&reagent).copied()
    }

    pub fn reuses_tip(&self, source: WellAddress) -> bool {
        self.reuse_tip_sources.contains(&source)
    }
}
