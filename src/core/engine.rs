use log::trace;
use rayon::prelude::*;

use super::error::{Result, SwrError};
use super::types::{
    CohortMonth, CohortOutcome, CohortReport, MarketHistory, MarketMonth, ScanMode, Strategy,
    SuccessRule,
};

#[derive(Debug, Clone, Copy)]
struct CohortState {
    balance: f64,
    income: f64,
    inflation_factor: f64,
    equity_weight: f64,
    resets: u32,
}

impl CohortState {
    fn new(strategy: &Strategy) -> Self {
        Self {
            balance: strategy.savings,
            income: strategy.initial_withdrawal_rate / 12.0 * strategy.savings,
            inflation_factor: 1.0,
            equity_weight: strategy.initial_equity_weight,
            resets: 0,
        }
    }

    /// Applies one month and reports whether the reset rule fired.
    fn step(&mut self, month: &MarketMonth, strategy: &Strategy) -> bool {
        self.income *= 1.0 + month.inflation;
        self.balance = self.balance * month.blended_growth(self.equity_weight) - self.income;
        self.inflation_factor *= 1.0 + month.inflation;

        if self.equity_weight < 1.0 {
            self.equity_weight += strategy.glide_increment.min(1.0 - self.equity_weight);
        }

        let reset_income = strategy.adjustment_withdrawal_rate * self.balance / 12.0;
        if self.income < reset_income {
            self.income = reset_income;
            self.equity_weight = strategy.initial_equity_weight;
            self.resets += 1;
            return true;
        }
        false
    }

    fn outcome(&self, savings: f64) -> CohortOutcome {
        CohortOutcome {
            survived: self.balance > 0.0,
            preserved: self.balance > self.inflation_factor * savings,
        }
    }
}

fn run_cohort(
    window: &[MarketMonth],
    strategy: &Strategy,
    mut trace: Option<&mut Vec<CohortMonth>>,
) -> CohortState {
    let mut state = CohortState::new(strategy);
    for (idx, month) in window.iter().enumerate() {
        let reset = state.step(month, strategy);
        if reset {
            trace!(
                "reset at month {}: income raised to {:.2}, equity weight back to {:.4}",
                idx + 1,
                state.income,
                state.equity_weight
            );
        }
        if let Some(rows) = trace.as_deref_mut() {
            rows.push(CohortMonth {
                month: idx + 1,
                income: state.income,
                balance: state.balance,
                inflation_factor: state.inflation_factor,
                equity_weight: state.equity_weight,
                reset,
            });
        }
    }
    state
}

fn report_for(
    history: &MarketHistory,
    start_offset: usize,
    strategy: &Strategy,
) -> Result<CohortReport> {
    let window = history.window(start_offset, strategy.retirement_length)?;
    let state = run_cohort(window, strategy, None);
    let outcome = state.outcome(strategy.savings);
    Ok(CohortReport {
        start_offset,
        survived: outcome.survived,
        preserved: outcome.preserved,
        ending_balance: state.balance,
        ending_inflation_factor: state.inflation_factor,
        resets: state.resets,
    })
}

pub fn simulate_cohort(
    history: &MarketHistory,
    start_offset: usize,
    strategy: &Strategy,
) -> Result<CohortOutcome> {
    cohort_report(history, start_offset, strategy).map(|report| report.outcome())
}

pub fn cohort_report(
    history: &MarketHistory,
    start_offset: usize,
    strategy: &Strategy,
) -> Result<CohortReport> {
    strategy.validate()?;
    report_for(history, start_offset, strategy)
}

pub fn trace_cohort(
    history: &MarketHistory,
    start_offset: usize,
    strategy: &Strategy,
) -> Result<Vec<CohortMonth>> {
    strategy.validate()?;
    let window = history.window(start_offset, strategy.retirement_length)?;
    let mut rows = Vec::with_capacity(window.len());
    run_cohort(window, strategy, Some(&mut rows));
    Ok(rows)
}

/// Simulates every valid cohort, returned in start-offset order.
pub fn scan_cohorts(
    history: &MarketHistory,
    strategy: &Strategy,
    scan: ScanMode,
) -> Result<Vec<CohortReport>> {
    strategy.validate()?;
    let count = history.cohort_count(strategy.retirement_length);
    if count == 0 {
        return Err(SwrError::DegenerateInput {
            retirement_length: strategy.retirement_length,
            available: history.len(),
        });
    }

    match scan {
        ScanMode::Sequential => (0..count)
            .map(|start| report_for(history, start, strategy))
            .collect(),
        ScanMode::Parallel => (0..count)
            .into_par_iter()
            .map(|start| report_for(history, start, strategy))
            .collect(),
    }
}

/// True when every outcome meets `rule`. An empty slice is vacuously true;
/// callers that must reject zero cohorts do so before folding.
pub fn outcomes_satisfy(outcomes: &[CohortOutcome], rule: SuccessRule) -> bool {
    outcomes
        .iter()
        .fold(true, |all_ok, outcome| all_ok && outcome.satisfies(rule))
}
