//! Assembles the validated inputs every analysis starts from: the pivoted
//! PSA table, the strategy configuration, the resolved perspective and the
//! willingness-to-pay grid.

use crate::data::config::{ConfigError, StrategyConfig};
use crate::data::psa::{
    PsaError, PsaTable, filter_perspective, intersect_strategies, read_psa_records,
};
use crate::grid::{GridError, Jurisdiction, validate_lambdas};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Input file not found: {}", .0.display())]
    FileNotFound(PathBuf),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Psa(#[from] PsaError),
    #[error(transparent)]
    Grid(#[from] GridError),
    #[error("Base strategy '{0}' has no rows in the selected PSA data.")]
    BaseMissing(String),
    #[error("Focal strategy '{0}' has no rows in the selected PSA data.")]
    UnknownFocal(String),
}

#[derive(Debug, Clone)]
pub struct AnalysisInputs {
    /// Balanced panel in configuration order; carries the price-adjusted cost
    /// of the focal strategy when it has a configured list price.
    pub table: PsaTable,
    pub config: StrategyConfig,
    /// Perspective as spelled in the configuration.
    pub perspective: String,
    pub focal: Option<String>,
    pub lambdas: Vec<f64>,
}

impl AnalysisInputs {
    pub fn base(&self) -> &str {
        &self.config.base
    }

    pub fn label<'a>(&'a self, strategy: &'a str) -> &'a str {
        self.config.label(strategy)
    }
}

fn require_file(path: &Path) -> Result<(), LoadError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(LoadError::FileNotFound(path.to_path_buf()))
    }
}

/// Reads, filters, aligns and pivots the PSA file against its configuration.
///
/// Without an explicit `lambda_grid` the Australian default grid is used.
pub fn load_analysis_inputs(
    psa_path: &Path,
    config_path: &Path,
    perspective: &str,
    focal: Option<&str>,
    lambda_grid: Option<Vec<f64>>,
) -> Result<AnalysisInputs, LoadError> {
    require_file(psa_path)?;
    require_file(config_path)?;

    let config = StrategyConfig::load(config_path)?;
    let resolved = config.resolve_perspective(perspective)?;
    let lambdas = match lambda_grid {
        Some(grid) => grid,
        None => {
            log::info!("No willingness-to-pay grid given; using the {} default", Jurisdiction::Au);
            Jurisdiction::Au.default_lambda_grid()
        }
    };
    validate_lambdas(&lambdas)?;

    let records = read_psa_records(psa_path)?;
    let records = filter_perspective(records, &resolved)?;
    let (records, order) = intersect_strategies(records, &config)?;
    if !order.contains(&config.base) {
        return Err(LoadError::BaseMissing(config.base.clone()));
    }
    let mut table = PsaTable::from_records(&records, &order)?;
    log::info!(
        "PSA panel for perspective '{}': {} draws x {} strategies",
        resolved,
        table.n_draws(),
        table.n_strategies()
    );

    if let Some(name) = focal {
        if table.strategy_index(name).is_none() {
            return Err(LoadError::UnknownFocal(name.to_string()));
        }
        match config.price(name) {
            Some(price) => table = table.with_price_adjusted_cost(name, price)?,
            None => log::warn!(
                "Focal strategy '{name}' has no configured list price; price analyses are unavailable"
            ),
        }
    }

    Ok(AnalysisInputs {
        table,
        config,
        perspective: resolved,
        focal: focal.map(str::to_string),
        lambdas,
    })
}
