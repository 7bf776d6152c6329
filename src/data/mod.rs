//! Monthly market history loaded from CSV.
//!
//! Expected columns (extra columns such as a date are ignored):
//! `SPNominalYield`, `SPDividendYield`, `TenYearBondReturn`, `Inflation`.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::Deserialize;
use thiserror::Error;

use crate::core::{MarketHistory, MarketMonth};

#[derive(Error, Debug)]
pub enum DataError {
    #[error("failed to open market history {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed market history: {0}")]
    Csv(#[from] csv::Error),

    #[error("market history contains no rows")]
    Empty,

    #[error("non-finite {column} on data row {row}")]
    NonFinite { row: usize, column: &'static str },
}

#[derive(Debug, Deserialize)]
struct HistoryRow {
    #[serde(rename = "SPNominalYield")]
    equity_price_return: f64,
    #[serde(rename = "SPDividendYield")]
    equity_dividend_yield: f64,
    #[serde(rename = "TenYearBondReturn")]
    bond_return: f64,
    #[serde(rename = "Inflation")]
    inflation: f64,
}

impl HistoryRow {
    fn into_month(self, row: usize) -> Result<MarketMonth, DataError> {
        for (column, value) in [
            ("SPNominalYield", self.equity_price_return),
            ("SPDividendYield", self.equity_dividend_yield),
            ("TenYearBondReturn", self.bond_return),
            ("Inflation", self.inflation),
        ] {
            if !value.is_finite() {
                return Err(DataError::NonFinite { row, column });
            }
        }
        Ok(MarketMonth::new(
            self.equity_price_return,
            self.equity_dividend_yield,
            self.bond_return,
            self.inflation,
        ))
    }
}

pub fn load_history(path: impl AsRef<Path>) -> Result<MarketHistory, DataError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| DataError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let history = read_history(file)?;
    info!("loaded {} months of history from {}", history.len(), path.display());
    Ok(history)
}

pub fn read_history<R: Read>(reader: R) -> Result<MarketHistory, DataError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut months = Vec::new();
    for (idx, record) in csv_reader.deserialize::<HistoryRow>().enumerate() {
        months.push(record?.into_month(idx + 1)?);
    }
    if months.is_empty() {
        return Err(DataError::Empty);
    }

    debug!("parsed {} market history rows", months.len());
    Ok(MarketHistory::new(months))
}
