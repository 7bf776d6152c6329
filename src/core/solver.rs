use log::{debug, info, warn};
use serde::Serialize;

use super::engine::{outcomes_satisfy, scan_cohorts};
use super::error::{Result, SwrError};
use super::types::{CohortOutcome, CohortReport, MarketHistory, ScanMode, Strategy, SuccessRule};

const BASIS_POINTS_PER_UNIT: f64 = 10_000.0;

#[derive(Debug, Clone, Copy)]
pub struct SolverConfig {
    pub search_min: f64,
    pub search_max: f64,
    pub tolerance: f64,
    pub max_iterations: u32,
    pub scan: ScanMode,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            search_min: 0.0,
            search_max: 1.0,
            tolerance: 0.00005,
            max_iterations: 64,
            scan: ScanMode::Sequential,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchIteration {
    pub iteration: u32,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub candidate_rate: f64,
    pub succeeded: bool,
}

/// A grid rate scanned after bisection while settling the reported rate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GridCheck {
    pub rate: f64,
    pub succeeded: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchTrace {
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub converged: bool,
    pub iterations: Vec<SearchIteration>,
    pub grid_checks: Vec<GridCheck>,
}

impl SearchTrace {
    /// Highest candidate that satisfied every cohort, if any did.
    pub fn last_success(&self) -> Option<f64> {
        self.iterations
            .iter()
            .filter(|it| it.succeeded)
            .map(|it| it.candidate_rate)
            .last()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateSolution {
    pub safe_withdrawal_rate: f64,
    pub safe_adjustment_rate: f64,
    pub success_rule: SuccessRule,
    pub cohort_count: usize,
    pub withdrawal_search: SearchTrace,
    pub adjustment_search: SearchTrace,
}

/// Runs every cohort at the given rates and folds the outcomes with the
/// strategy's success rule.
///
/// Bisection relies on this being non-increasing in `withdrawal_rate`; that
/// holds for the survival balance when the adjustment rate is zero, but it is
/// assumed rather than checked once the reset rule is active.
pub fn all_cohorts_succeed(
    history: &MarketHistory,
    strategy: &Strategy,
    withdrawal_rate: f64,
    adjustment_rate: f64,
    scan: ScanMode,
) -> Result<bool> {
    let candidate = strategy.with_rates(withdrawal_rate, adjustment_rate);
    let outcomes: Vec<CohortOutcome> = scan_cohorts(history, &candidate, scan)?
        .iter()
        .map(CohortReport::outcome)
        .collect();
    Ok(outcomes_satisfy(&outcomes, candidate.success_rule))
}

/// Finds the highest withdrawal rate, then the highest adjustment rate at that
/// withdrawal rate, for which every cohort succeeds.
///
/// The rates already set on `strategy` are ignored.
pub fn find_solutions(
    history: &MarketHistory,
    strategy: &Strategy,
    config: SolverConfig,
) -> Result<RateSolution> {
    validate_config(config)?;
    let base = strategy.with_rates(0.0, 0.0);
    base.validate()?;

    let cohort_count = history.cohort_count(base.retirement_length);
    if cohort_count == 0 {
        return Err(SwrError::DegenerateInput {
            retirement_length: base.retirement_length,
            available: history.len(),
        });
    }

    info!(
        "solving {} cohorts of {} months under {}",
        cohort_count, base.retirement_length, base.success_rule
    );

    let (safe_withdrawal_rate, withdrawal_search) = search("withdrawal", config, |rate| {
        all_cohorts_succeed(history, &base, rate, 0.0, config.scan)
    })?;
    if withdrawal_search.last_success().is_none() {
        warn!(
            "no withdrawal rate in ({}, {}] succeeded for every cohort",
            config.search_min, config.search_max
        );
    }

    let (safe_adjustment_rate, adjustment_search) = search("adjustment", config, |rate| {
        all_cohorts_succeed(history, &base, safe_withdrawal_rate, rate, config.scan)
    })?;

    info!(
        "safe withdrawal rate {:.4}, safe adjustment rate {:.4}",
        safe_withdrawal_rate, safe_adjustment_rate
    );

    Ok(RateSolution {
        safe_withdrawal_rate,
        safe_adjustment_rate,
        success_rule: base.success_rule,
        cohort_count,
        withdrawal_search,
        adjustment_search,
    })
}

/// Truncates toward negative infinity onto the 0.0001 grid.
///
/// The result is the largest whole number of basis points not exceeding
/// `value`, so values like 0.57 (stored as 0.56999..., scaled to 5699.99...)
/// still come back as 0.57.
pub fn truncate_to_basis_points(value: f64) -> f64 {
    if !value.is_finite() {
        return value;
    }
    grid_rate(floor_basis_points(value))
}

fn floor_basis_points(value: f64) -> i64 {
    let mut basis_points = (value * BASIS_POINTS_PER_UNIT).floor() as i64;
    while grid_rate(basis_points + 1) <= value {
        basis_points += 1;
    }
    while grid_rate(basis_points) > value {
        basis_points -= 1;
    }
    basis_points
}

fn grid_rate(basis_points: i64) -> f64 {
    basis_points as f64 / BASIS_POINTS_PER_UNIT
}

/// Bisects for the highest succeeding rate and settles it on the grid.
fn search(
    label: &str,
    config: SolverConfig,
    mut succeeds: impl FnMut(f64) -> Result<bool>,
) -> Result<(f64, SearchTrace)> {
    let mut trace = bisect(label, config, &mut succeeds)?;
    let rate = settle_on_grid(label, config, &mut trace, &mut succeeds)?;
    Ok((rate, trace))
}

/// Picks the reported rate on the basis-point grid.
///
/// Starts from the final midpoint truncated to the grid. A grid rate that
/// bisection never scanned is checked, stepping down one basis point while it
/// fails. Success is not always monotone once the reset rule fires, so a grid
/// rate just below a succeeding midpoint can still fail. When the first grid
/// rate passes, the next one up is tried too if it still lies below the
/// failing upper bound.
fn settle_on_grid(
    label: &str,
    config: SolverConfig,
    trace: &mut SearchTrace,
    mut succeeds: impl FnMut(f64) -> Result<bool>,
) -> Result<f64> {
    let final_midpoint = trace
        .iterations
        .last()
        .map_or(trace.lower_bound, |it| it.candidate_rate);
    let lower_bound_tested = trace.last_success().is_some();
    let mut basis_points = floor_basis_points(final_midpoint);
    let mut stepped_down = false;
    let mut settled = false;

    for _ in 0..config.max_iterations {
        let rate = grid_rate(basis_points);
        if rate <= config.search_min || (lower_bound_tested && rate == trace.lower_bound) {
            settled = true;
            break;
        }
        let succeeded = succeeds(rate)?;
        debug!("{label} grid check {rate:.4} -> {succeeded}");
        trace.grid_checks.push(GridCheck { rate, succeeded });
        if succeeded {
            settled = true;
            break;
        }
        stepped_down = true;
        basis_points -= 1;
    }
    if !settled {
        warn!(
            "{label} grid walk stopped at {:.4} without a succeeding rate",
            grid_rate(basis_points)
        );
        return Ok(grid_rate(basis_points));
    }

    if !stepped_down {
        let next = grid_rate(basis_points + 1);
        if next < trace.upper_bound {
            let succeeded = succeeds(next)?;
            debug!("{label} grid check {next:.4} -> {succeeded}");
            trace.grid_checks.push(GridCheck {
                rate: next,
                succeeded,
            });
            if succeeded {
                basis_points += 1;
            }
        }
    }
    Ok(grid_rate(basis_points))
}

fn bisect(
    label: &str,
    config: SolverConfig,
    mut succeeds: impl FnMut(f64) -> Result<bool>,
) -> Result<SearchTrace> {
    let mut lo = config.search_min;
    let mut hi = config.search_max;
    let mut iterations = Vec::new();
    let mut it = 0;

    while hi - lo > config.tolerance && it < config.max_iterations {
        it += 1;
        let mid = (lo + hi) * 0.5;
        let succeeded = succeeds(mid)?;
        debug!("{label} search #{it}: [{lo:.6}, {hi:.6}] rate {mid:.6} -> {succeeded}");
        iterations.push(SearchIteration {
            iteration: it,
            lower_bound: lo,
            upper_bound: hi,
            candidate_rate: mid,
            succeeded,
        });

        if succeeded {
            lo = mid;
        } else {
            hi = mid;
        }
    }

    let converged = hi - lo <= config.tolerance;
    if !converged {
        warn!(
            "{label} search stopped after {} iterations with width {:.6}",
            config.max_iterations,
            hi - lo
        );
    }

    Ok(SearchTrace {
        lower_bound: lo,
        upper_bound: hi,
        converged,
        iterations,
        grid_checks: Vec::new(),
    })
}

fn validate_config(config: SolverConfig) -> Result<()> {
    if !config.search_min.is_finite() || !config.search_max.is_finite() {
        return Err(SwrError::invalid_configuration("search bounds must be finite"));
    }
    if config.search_min < 0.0 {
        return Err(SwrError::invalid_configuration("search_min must be >= 0"));
    }
    if config.search_max <= config.search_min {
        return Err(SwrError::invalid_configuration(
            "search_max must be greater than search_min",
        ));
    }
    if !config.tolerance.is_finite() || config.tolerance <= 0.0 {
        return Err(SwrError::invalid_configuration("tolerance must be > 0"));
    }
    if config.max_iterations == 0 {
        return Err(SwrError::invalid_configuration("max_iterations must be > 0"));
    }
    Ok(())
}
