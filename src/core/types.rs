use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::{Result, SwrError};

/// One month of market observations, all expressed as fractions.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketMonth {
    pub equity_price_return: f64,
    pub equity_dividend_yield: f64,
    pub bond_return: f64,
    pub inflation: f64,
}

impl MarketMonth {
    pub fn new(
        equity_price_return: f64,
        equity_dividend_yield: f64,
        bond_return: f64,
        inflation: f64,
    ) -> Self {
        Self {
            equity_price_return,
            equity_dividend_yield,
            bond_return,
            inflation,
        }
    }

    /// Gross growth of one unit of portfolio value held at `equity_weight`.
    pub fn blended_growth(&self, equity_weight: f64) -> f64 {
        equity_weight * (1.0 + self.equity_price_return) * (1.0 + self.equity_dividend_yield)
            + (1.0 - equity_weight) * (1.0 + self.bond_return)
    }
}

/// Chronologically ordered monthly history shared read-only by every cohort.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MarketHistory {
    months: Vec<MarketMonth>,
}

impl MarketHistory {
    pub fn new(months: Vec<MarketMonth>) -> Self {
        Self { months }
    }

    pub fn len(&self) -> usize {
        self.months.len()
    }

    pub fn is_empty(&self) -> bool {
        self.months.is_empty()
    }

    pub fn months(&self) -> &[MarketMonth] {
        &self.months
    }

    /// Number of valid start offsets, `0..=len - retirement_length`.
    pub fn cohort_count(&self, retirement_length: usize) -> usize {
        if retirement_length == 0 {
            return 0;
        }
        self.months
            .len()
            .checked_sub(retirement_length)
            .map_or(0, |spare| spare + 1)
    }

    /// Transition months for the cohort starting at `start`.
    ///
    /// The first withdrawal happens before any market move, so a cohort of
    /// `retirement_length` months only consumes `retirement_length - 1` records.
    pub fn window(&self, start: usize, retirement_length: usize) -> Result<&[MarketMonth]> {
        if retirement_length == 0 {
            return Err(SwrError::invalid_configuration(
                "retirement length must be at least one month",
            ));
        }
        let steps = retirement_length - 1;
        match start.checked_add(steps) {
            Some(end) if end <= self.months.len() => Ok(&self.months[start..end]),
            _ => Err(SwrError::InvalidRange {
                start,
                retirement_length,
                available: self.months.len(),
            }),
        }
    }
}

impl From<Vec<MarketMonth>> for MarketHistory {
    fn from(months: Vec<MarketMonth>) -> Self {
        Self::new(months)
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SuccessRule {
    /// The ending balance stays above zero.
    SurvivalOnly,
    /// The ending balance stays above the inflation-adjusted starting savings.
    #[default]
    PreserveRealValue,
}

impl SuccessRule {
    pub fn code(self) -> u8 {
        match self {
            SuccessRule::SurvivalOnly => 0,
            SuccessRule::PreserveRealValue => 1,
        }
    }
}

impl TryFrom<u8> for SuccessRule {
    type Error = SwrError;

    fn try_from(code: u8) -> Result<Self> {
        match code {
            0 => Ok(SuccessRule::SurvivalOnly),
            1 => Ok(SuccessRule::PreserveRealValue),
            other => Err(SwrError::invalid_configuration(format!(
                "unrecognized success rule {other}; expected 0 (survival-only) or 1 (preserve-real-value)"
            ))),
        }
    }
}

impl FromStr for SuccessRule {
    type Err = SwrError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "0" | "survival-only" | "survival_only" | "survivalOnly" | "survival" => {
                Ok(SuccessRule::SurvivalOnly)
            }
            "1" | "preserve-real-value" | "preserve_real_value" | "preserveRealValue"
            | "preserve" => Ok(SuccessRule::PreserveRealValue),
            other => Err(SwrError::invalid_configuration(format!(
                "unrecognized success rule '{other}'; expected survival-only or preserve-real-value"
            ))),
        }
    }
}

impl fmt::Display for SuccessRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuccessRule::SurvivalOnly => f.write_str("survival-only"),
            SuccessRule::PreserveRealValue => f.write_str("preserve-real-value"),
        }
    }
}

/// A retirement plan evaluated against every historical cohort.
///
/// Rates are annual fractions; the simulator divides them by 12.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Strategy {
    pub savings: f64,
    pub initial_withdrawal_rate: f64,
    pub adjustment_withdrawal_rate: f64,
    pub retirement_length: usize,
    pub initial_equity_weight: f64,
    pub glide_increment: f64,
    pub success_rule: SuccessRule,
}

impl Default for Strategy {
    fn default() -> Self {
        Self {
            savings: 100_000.0,
            initial_withdrawal_rate: 0.0,
            adjustment_withdrawal_rate: 0.0,
            retirement_length: 720,
            initial_equity_weight: 0.6,
            glide_increment: 0.005,
            success_rule: SuccessRule::PreserveRealValue,
        }
    }
}

impl Strategy {
    pub fn with_rates(self, initial_withdrawal_rate: f64, adjustment_withdrawal_rate: f64) -> Self {
        Self {
            initial_withdrawal_rate,
            adjustment_withdrawal_rate,
            ..self
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.savings.is_finite() || self.savings <= 0.0 {
            return Err(SwrError::invalid_configuration("savings must be > 0"));
        }
        if !self.initial_withdrawal_rate.is_finite() || self.initial_withdrawal_rate < 0.0 {
            return Err(SwrError::invalid_configuration(
                "initial withdrawal rate must be >= 0",
            ));
        }
        if !self.adjustment_withdrawal_rate.is_finite() || self.adjustment_withdrawal_rate < 0.0 {
            return Err(SwrError::invalid_configuration(
                "adjustment withdrawal rate must be >= 0",
            ));
        }
        if self.retirement_length == 0 {
            return Err(SwrError::invalid_configuration(
                "retirement length must be at least one month",
            ));
        }
        if !(0.0..=1.0).contains(&self.initial_equity_weight) {
            return Err(SwrError::invalid_configuration(
                "initial equity weight must be between 0 and 1",
            ));
        }
        if !self.glide_increment.is_finite() || self.glide_increment < 0.0 {
            return Err(SwrError::invalid_configuration(
                "glide increment must be >= 0",
            ));
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CohortOutcome {
    pub survived: bool,
    pub preserved: bool,
}

impl CohortOutcome {
    pub fn satisfies(self, rule: SuccessRule) -> bool {
        match rule {
            SuccessRule::SurvivalOnly => self.survived,
            SuccessRule::PreserveRealValue => self.preserved,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CohortReport {
    pub start_offset: usize,
    pub survived: bool,
    pub preserved: bool,
    pub ending_balance: f64,
    pub ending_inflation_factor: f64,
    pub resets: u32,
}

impl CohortReport {
    pub fn outcome(&self) -> CohortOutcome {
        CohortOutcome {
            survived: self.survived,
            preserved: self.preserved,
        }
    }
}

/// State of one cohort after a single monthly transition.
#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CohortMonth {
    pub month: usize,
    pub income: f64,
    pub balance: f64,
    pub inflation_factor: f64,
    pub equity_weight: f64,
    pub reset: bool,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum ScanMode {
    #[default]
    Sequential,
    Parallel,
}
