//! # PSA Draw Loading and Validation
//!
//! Reads the long-format probabilistic sensitivity analysis table
//! (`draw, strategy, cost, effect[, perspective]`) and reshapes it into the
//! dense `[draw, strategy]` matrices consumed by every downstream stage.
//!
//! - Strict Schema: column names are fixed; lookup is case-insensitive.
//! - Balanced Panel: every strategy must carry exactly the same draw ids.
//!   This is validated by [`align_draws`], never assumed.
//! - Immutable Output: a [`PsaTable`] is never mutated once built. Stages
//!   that need a different view (a subsample, a price adjustment) get a new one.

use crate::data::config::{StrategyConfig, normalize_perspective};
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use polars::prelude::*;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::File;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PsaError {
    #[error("Error from the underlying Polars library: {0}")]
    Polars(#[from] PolarsError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("The required column '{0}' was not found in the PSA file.")]
    ColumnNotFound(String),
    #[error(
        "Column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error("Missing or null values were found in the PSA column '{0}'.")]
    MissingValues(String),
    #[error("Non-finite values (NaN or Infinity) were found in the PSA column '{0}'.")]
    NonFiniteValues(String),
    #[error("The PSA file has no rows for perspective '{0}'.")]
    NoRowsForPerspective(String),
    #[error("None of the configured strategies ({configured}) appear in the PSA data.")]
    NoOverlappingStrategies { configured: String },
    #[error("Strategy '{strategy}' has draw id {draw} more than once.")]
    DuplicateDraw { strategy: String, draw: i64 },
    #[error(
        "Draw IDs misaligned: strategy '{strategy}' has {found} draws but '{reference}' has {expected}, or the ids differ."
    )]
    DrawsMisaligned {
        strategy: String,
        reference: String,
        expected: usize,
        found: usize,
    },
    #[error("Strategy '{0}' is not present in the PSA table.")]
    UnknownStrategy(String),
    #[error("PSA matrices have inconsistent shapes: {0}")]
    ShapeMismatch(String),
}

/// One row of the long-format PSA file.
#[derive(Debug, Clone, PartialEq)]
pub struct PsaRecord {
    pub draw: i64,
    pub strategy: String,
    pub cost: f64,
    pub effect: f64,
    pub perspective: Option<String>,
}

/// Price adjustment applied to a single focal strategy.
#[derive(Debug, Clone)]
pub struct PriceAdjustment {
    pub focal: usize,
    pub list_price: f64,
    /// `K`: cost with the focal strategy's list price removed. Shape matches `cost`.
    pub k: Array2<f64>,
}

/// Balanced PSA panel: one row per draw, one column per strategy.
#[derive(Debug, Clone)]
pub struct PsaTable {
    strategies: Vec<String>,
    draws: Vec<i64>,
    cost: Array2<f64>,
    effect: Array2<f64>,
    adjustment: Option<PriceAdjustment>,
}

impl PsaTable {
    /// Builds a table from dense matrices, validating shapes and finiteness.
    pub fn from_arrays(
        strategies: Vec<String>,
        draws: Vec<i64>,
        cost: Array2<f64>,
        effect: Array2<f64>,
    ) -> Result<Self, PsaError> {
        let expected = (draws.len(), strategies.len());
        if cost.dim() != expected || effect.dim() != expected {
            return Err(PsaError::ShapeMismatch(format!(
                "expected {:?}, cost is {:?}, effect is {:?}",
                expected,
                cost.dim(),
                effect.dim()
            )));
        }
        if cost.iter().any(|v| !v.is_finite()) {
            return Err(PsaError::NonFiniteValues("cost".to_string()));
        }
        if effect.iter().any(|v| !v.is_finite()) {
            return Err(PsaError::NonFiniteValues("effect".to_string()));
        }
        Ok(Self {
            strategies,
            draws,
            cost,
            effect,
            adjustment: None,
        })
    }

    /// Pivots validated long-format records into a balanced panel, ordering
    /// columns by `strategy_order` and rows by ascending draw id.
    pub fn from_records(
        records: &[PsaRecord],
        strategy_order: &[String],
    ) -> Result<Self, PsaError> {
        let draws = align_draws(records)?;
        let draw_index: HashMap<i64, usize> =
            draws.iter().enumerate().map(|(i, &d)| (d, i)).collect();
        let strategy_index: HashMap<&str, usize> = strategy_order
            .iter()
            .enumerate()
            .map(|(i, s)| (s.as_str(), i))
            .collect();

        let mut cost = Array2::<f64>::zeros((draws.len(), strategy_order.len()));
        let mut effect = Array2::<f64>::zeros((draws.len(), strategy_order.len()));
        let mut filled = HashSet::new();
        for record in records {
            let Some(&col) = strategy_index.get(record.strategy.as_str()) else {
                continue;
            };
            let row = draw_index[&record.draw];
            cost[[row, col]] = record.cost;
            effect[[row, col]] = record.effect;
            filled.insert(col);
        }
        if let Some(missing) = strategy_order
            .iter()
            .enumerate()
            .find(|(i, _)| !filled.contains(i))
        {
            return Err(PsaError::UnknownStrategy(missing.1.clone()));
        }

        Self::from_arrays(strategy_order.to_vec(), draws, cost, effect)
    }

    pub fn strategies(&self) -> &[String] {
        &self.strategies
    }

    pub fn draws(&self) -> &[i64] {
        &self.draws
    }

    pub fn n_draws(&self) -> usize {
        self.draws.len()
    }

    pub fn n_strategies(&self) -> usize {
        self.strategies.len()
    }

    pub fn cost(&self) -> ArrayView2<'_, f64> {
        self.cost.view()
    }

    pub fn effect(&self) -> ArrayView2<'_, f64> {
        self.effect.view()
    }

    pub fn cost_of(&self, strategy: usize) -> ArrayView1<'_, f64> {
        self.cost.column(strategy)
    }

    pub fn effect_of(&self, strategy: usize) -> ArrayView1<'_, f64> {
        self.effect.column(strategy)
    }

    pub fn adjustment(&self) -> Option<&PriceAdjustment> {
        self.adjustment.as_ref()
    }

    pub fn strategy_index(&self, name: &str) -> Option<usize> {
        self.strategies.iter().position(|s| s == name)
    }

    pub fn require_strategy(&self, name: &str) -> Result<usize, PsaError> {
        self.strategy_index(name)
            .ok_or_else(|| PsaError::UnknownStrategy(name.to_string()))
    }

    /// Names from `wanted` that have no column in this table, in input order.
    pub fn missing_strategies(&self, wanted: &[String]) -> Vec<String> {
        wanted
            .iter()
            .filter(|name| self.strategy_index(name).is_none())
            .cloned()
            .collect()
    }

    /// Returns a copy carrying the price-adjusted cost column `K` for `focal`.
    pub fn with_price_adjusted_cost(
        &self,
        focal: &str,
        list_price: f64,
    ) -> Result<Self, PsaError> {
        let focal_idx = self.require_strategy(focal)?;
        let mut k = self.cost.clone();
        k.column_mut(focal_idx).mapv_inplace(|c| c - list_price);
        let mut adjusted = self.clone();
        adjusted.adjustment = Some(PriceAdjustment {
            focal: focal_idx,
            list_price,
            k,
        });
        Ok(adjusted)
    }

    /// Sub-panel restricted to the given row positions (not draw ids).
    pub fn select_rows(&self, rows: &[usize]) -> Self {
        Self {
            strategies: self.strategies.clone(),
            draws: rows.iter().map(|&r| self.draws[r]).collect(),
            cost: self.cost.select(Axis(0), rows),
            effect: self.effect.select(Axis(0), rows),
            adjustment: self.adjustment.as_ref().map(|adj| PriceAdjustment {
                focal: adj.focal,
                list_price: adj.list_price,
                k: adj.k.select(Axis(0), rows),
            }),
        }
    }
}

/// Checks the balanced-panel invariant and returns the shared, sorted draw ids.
pub fn align_draws(records: &[PsaRecord]) -> Result<Vec<i64>, PsaError> {
    let mut per_strategy: Vec<(&str, BTreeSet<i64>)> = Vec::new();
    for record in records {
        let position = match per_strategy
            .iter()
            .position(|(name, _)| *name == record.strategy)
        {
            Some(position) => position,
            None => {
                per_strategy.push((record.strategy.as_str(), BTreeSet::new()));
                per_strategy.len() - 1
            }
        };
        if !per_strategy[position].1.insert(record.draw) {
            return Err(PsaError::DuplicateDraw {
                strategy: record.strategy.clone(),
                draw: record.draw,
            });
        }
    }

    let Some(((reference, expected), rest)) = per_strategy.split_first() else {
        return Ok(Vec::new());
    };
    for (name, draws) in rest {
        if draws != expected {
            return Err(PsaError::DrawsMisaligned {
                strategy: name.to_string(),
                reference: reference.to_string(),
                expected: expected.len(),
                found: draws.len(),
            });
        }
    }
    Ok(expected.iter().copied().collect())
}

/// Keeps rows for the requested perspective. Files without a perspective
/// column are treated as single-perspective and pass through unchanged.
pub fn filter_perspective(
    records: Vec<PsaRecord>,
    perspective: &str,
) -> Result<Vec<PsaRecord>, PsaError> {
    if records.iter().all(|r| r.perspective.is_none()) {
        log::info!("PSA file has no perspective column; using all rows for '{perspective}'");
        return Ok(records);
    }
    let wanted = normalize_perspective(perspective);
    let kept: Vec<PsaRecord> = records
        .into_iter()
        .filter(|r| {
            r.perspective
                .as_deref()
                .is_some_and(|p| normalize_perspective(p) == wanted)
        })
        .collect();
    if kept.is_empty() {
        return Err(PsaError::NoRowsForPerspective(perspective.to_string()));
    }
    Ok(kept)
}

/// Drops rows for strategies that are not configured and returns the
/// surviving strategy order (configuration order). Configured strategies
/// absent from the data are reported as warnings.
pub fn intersect_strategies(
    records: Vec<PsaRecord>,
    config: &StrategyConfig,
) -> Result<(Vec<PsaRecord>, Vec<String>), PsaError> {
    let present: HashSet<&str> = records.iter().map(|r| r.strategy.as_str()).collect();
    let mut order = Vec::with_capacity(config.strategies.len());
    for name in &config.strategies {
        if present.contains(name.as_str()) {
            order.push(name.clone());
        } else {
            log::warn!("Configured strategy '{name}' has no rows in the selected PSA data");
        }
    }
    if order.is_empty() {
        return Err(PsaError::NoOverlappingStrategies {
            configured: config.strategies.join(", "),
        });
    }

    let configured: HashSet<&str> = order.iter().map(String::as_str).collect();
    let mut dropped = BTreeSet::new();
    let kept: Vec<PsaRecord> = records
        .into_iter()
        .filter(|r| {
            let keep = configured.contains(r.strategy.as_str());
            if !keep {
                dropped.insert(r.strategy.clone());
            }
            keep
        })
        .collect();
    if !dropped.is_empty() {
        log::debug!("Ignoring unconfigured strategies in PSA data: {dropped:?}");
    }
    Ok((kept, order))
}

/// Reads the PSA file into long-format records. `.tsv` files are tab
/// separated; everything else is parsed as comma separated.
pub fn read_psa_records(path: &Path) -> Result<Vec<PsaRecord>, PsaError> {
    let df = read_tabular(path)?;
    log::info!(
        "Loaded PSA file '{}' with {} rows",
        path.display(),
        df.height()
    );
    let name_map = build_case_insensitive_map(
        df.get_column_names()
            .into_iter()
            .map(|name| name.as_str().to_string()),
    );

    let draws = extract_i64_column(&df, &name_map, "draw")?;
    let strategies = extract_string_column(&df, &name_map, "strategy")?;
    let costs = extract_f64_column(&df, &name_map, "cost")?;
    let effects = extract_f64_column(&df, &name_map, "effect")?;
    let perspectives = if name_map.contains_key("perspective") {
        Some(extract_string_column(&df, &name_map, "perspective")?)
    } else {
        None
    };

    let negative = costs.iter().filter(|&&c| c < 0.0).count();
    if negative > 0 {
        log::warn!("PSA file contains {negative} negative cost values");
    }

    let mut records = Vec::with_capacity(draws.len());
    for (idx, ((draw, strategy), (cost, effect))) in draws
        .into_iter()
        .zip(strategies)
        .zip(costs.into_iter().zip(effects))
        .enumerate()
    {
        records.push(PsaRecord {
            draw,
            strategy,
            cost,
            effect,
            perspective: perspectives.as_ref().map(|p| p[idx].clone()),
        });
    }
    Ok(records)
}

pub(crate) fn read_tabular(path: &Path) -> Result<DataFrame, PsaError> {
    let separator = match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("tsv") | Some("tab") => b'\t',
        _ => b',',
    };
    let file = File::open(path)?;
    CsvReadOptions::default()
        .with_has_header(true)
        .map_parse_options(|options| options.with_separator(separator))
        .into_reader_with_file_handle(file)
        .finish()
        .map_err(PsaError::from)
}

pub(crate) fn build_case_insensitive_map<I, S>(names: I) -> HashMap<String, String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut map = HashMap::new();
    for name in names {
        let original = name.as_ref().to_string();
        map.insert(original.trim().to_ascii_lowercase(), original);
    }
    map
}

fn lookup_column<'a>(
    df: &'a DataFrame,
    map: &HashMap<String, String>,
    key: &str,
) -> Result<(&'a Column, String), PsaError> {
    let actual = map
        .get(key)
        .ok_or_else(|| PsaError::ColumnNotFound(key.to_string()))?;
    let column = df
        .column(actual)
        .map_err(|_| PsaError::ColumnNotFound(actual.clone()))?;
    Ok((column, actual.clone()))
}

pub(crate) fn extract_f64_column(
    df: &DataFrame,
    map: &HashMap<String, String>,
    key: &str,
) -> Result<Vec<f64>, PsaError> {
    let (series, actual) = lookup_column(df, map, key)?;
    if series.null_count() > 0 {
        return Err(PsaError::MissingValues(actual));
    }
    let dtype = series.dtype().clone();
    let casted = series
        .cast(&DataType::Float64)
        .map_err(|_| PsaError::ColumnWrongType {
            column_name: actual.clone(),
            expected_type: "float",
            found_type: dtype.to_string(),
        })?;
    if casted.null_count() > 0 {
        return Err(PsaError::ColumnWrongType {
            column_name: actual,
            expected_type: "float",
            found_type: dtype.to_string(),
        });
    }
    let values: Vec<f64> = casted.f64()?.into_no_null_iter().collect();
    if values.iter().any(|v| !v.is_finite()) {
        return Err(PsaError::NonFiniteValues(actual));
    }
    Ok(values)
}

pub(crate) fn extract_i64_column(
    df: &DataFrame,
    map: &HashMap<String, String>,
    key: &str,
) -> Result<Vec<i64>, PsaError> {
    let (series, actual) = lookup_column(df, map, key)?;
    if series.null_count() > 0 {
        return Err(PsaError::MissingValues(actual));
    }
    let dtype = series.dtype().clone();
    let casted = series
        .cast(&DataType::Int64)
        .map_err(|_| PsaError::ColumnWrongType {
            column_name: actual.clone(),
            expected_type: "integer",
            found_type: dtype.to_string(),
        })?;
    if casted.null_count() > 0 {
        return Err(PsaError::ColumnWrongType {
            column_name: actual,
            expected_type: "integer",
            found_type: dtype.to_string(),
        });
    }
    Ok(casted.i64()?.into_no_null_iter().collect())
}

fn extract_string_column(
    df: &DataFrame,
    map: &HashMap<String, String>,
    key: &str,
) -> Result<Vec<String>, PsaError> {
    let (series, actual) = lookup_column(df, map, key)?;
    if series.null_count() > 0 {
        return Err(PsaError::MissingValues(actual));
    }
    let casted = series.cast(&DataType::String)?;
    let mut values = Vec::with_capacity(casted.len());
    for value in casted.str()?.into_iter() {
        match value {
            Some(text) => values.push(text.trim().to_string()),
            None => return Err(PsaError::MissingValues(actual)),
        }
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn record(draw: i64, strategy: &str, cost: f64, effect: f64) -> PsaRecord {
        PsaRecord {
            draw,
            strategy: strategy.to_string(),
            cost,
            effect,
            perspective: None,
        }
    }

    #[test]
    fn align_draws_accepts_balanced_panel_in_any_row_order() {
        let records = vec![
            record(2, "A", 1.0, 1.0),
            record(1, "B", 1.0, 1.0),
            record(1, "A", 1.0, 1.0),
            record(2, "B", 1.0, 1.0),
        ];
        assert_eq!(align_draws(&records).expect("aligned"), vec![1, 2]);
    }

    #[test]
    fn align_draws_rejects_differing_ids_with_same_count() {
        let records = vec![
            record(1, "A", 1.0, 1.0),
            record(2, "A", 1.0, 1.0),
            record(1, "B", 1.0, 1.0),
            record(3, "B", 1.0, 1.0),
        ];
        let err = align_draws(&records).unwrap_err();
        assert!(err.to_string().contains("Draw IDs misaligned"), "{err}");
    }

    #[test]
    fn align_draws_rejects_duplicate_draw() {
        let records = vec![record(1, "A", 1.0, 1.0), record(1, "A", 2.0, 1.0)];
        assert!(matches!(
            align_draws(&records),
            Err(PsaError::DuplicateDraw { draw: 1, .. })
        ));
    }

    #[test]
    fn pivot_orders_columns_by_configuration() {
        let records = vec![
            record(1, "A", 10.0, 1.0),
            record(1, "B", 20.0, 2.0),
            record(2, "A", 11.0, 1.1),
            record(2, "B", 21.0, 2.1),
        ];
        let order = vec!["B".to_string(), "A".to_string()];
        let table = PsaTable::from_records(&records, &order).expect("pivot");
        assert_eq!(table.strategies(), order.as_slice());
        assert_eq!(table.cost()[[0, 0]], 20.0);
        assert_eq!(table.cost()[[1, 1]], 11.0);
        assert_eq!(table.effect()[[1, 0]], 2.1);
    }

    #[test]
    fn price_adjustment_only_touches_focal_column() {
        let records = vec![record(1, "A", 10.0, 1.0), record(1, "B", 500.0, 2.0)];
        let order = vec!["A".to_string(), "B".to_string()];
        let table = PsaTable::from_records(&records, &order).expect("pivot");
        let adjusted = table.with_price_adjusted_cost("B", 400.0).expect("adjust");
        let adj = adjusted.adjustment().expect("adjustment present");
        assert_eq!(adj.focal, 1);
        assert_eq!(adj.k[[0, 0]], 10.0);
        assert_eq!(adj.k[[0, 1]], 100.0);
        assert!(table.adjustment().is_none());
    }

    #[test]
    fn perspective_filter_matches_loosely_and_rejects_empty() {
        let mut a = record(1, "A", 1.0, 1.0);
        a.perspective = Some("Health_System".to_string());
        let mut b = record(1, "A", 2.0, 1.0);
        b.perspective = Some("societal".to_string());
        let kept = filter_perspective(vec![a.clone(), b.clone()], "health system").expect("rows");
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].cost, 1.0);
        assert!(matches!(
            filter_perspective(vec![a, b], "payer"),
            Err(PsaError::NoRowsForPerspective(_))
        ));
    }

    #[test]
    fn reads_csv_with_case_insensitive_headers() {
        let dir = tempdir().expect("temporary directory");
        let path = dir.path().join("psa.csv");
        fs::write(
            &path,
            "Draw,Strategy,Cost,Effect,Perspective\n1,Usual care,1000,2.0,societal\n1,Ketamine,1400,2.4,societal\n",
        )
        .expect("write psa");
        let records = read_psa_records(&path).expect("read");
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].strategy, "Ketamine");
        assert_eq!(records[1].cost, 1400.0);
        assert_eq!(records[0].perspective.as_deref(), Some("societal"));
    }

    #[test]
    fn rejects_nan_effects() {
        let dir = tempdir().expect("temporary directory");
        let path = dir.path().join("psa.csv");
        fs::write(&path, "draw,strategy,cost,effect\n1,A,1000,NaN\n1,B,1000,2.0\n")
            .expect("write psa");
        let err = read_psa_records(&path).unwrap_err();
        assert!(
            matches!(
                err,
                PsaError::NonFiniteValues(_)
                    | PsaError::MissingValues(_)
                    | PsaError::ColumnWrongType { .. }
            ),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn missing_column_is_named() {
        let dir = tempdir().expect("temporary directory");
        let path = dir.path().join("psa.csv");
        fs::write(&path, "draw,strategy,cost\n1,A,1000\n").expect("write psa");
        assert!(matches!(
            read_psa_records(&path),
            Err(PsaError::ColumnNotFound(c)) if c == "effect"
        ));
    }
}
