//! Transfer planner: turns a validated composition into the ordered list of
//! liquid moves for one column of the experiment plate.

mod layout;
mod plan;

pub use layout::{
    COLUMNS, ParseWellError, PlateLayout, REPLICATES, ROWS, Reagent, RowRole, WellAddress,
};
pub use plan::{
    DEFAULT_MAX_TRANSFERS, DestinationWell, PipetteTier, PlanError, ResourceSummary, TierCounts,
    TipPolicy, Transfer, TransferPlan, TransferPlanner,
};
