mod engine;
mod error;
mod solver;
mod types;

pub use engine::{
    cohort_report, outcomes_satisfy, scan_cohorts, simulate_cohort, trace_cohort,
};
pub use error::{Result, SwrError};
pub use solver::{
    GridCheck, RateSolution, SearchIteration, SearchTrace, SolverConfig, all_cohorts_succeed,
    find_solutions, truncate_to_basis_points,
};
pub use types::{
    CohortMonth, CohortOutcome, CohortReport, MarketHistory, MarketMonth, ScanMode, Strategy,
    SuccessRule,
};
