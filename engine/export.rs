//! Writers for every output table and the TOML run manifest.
//!
//! Tables are flat CSV files with one header row. Strategy names are written
//! with their configured display labels.

use crate::ceac::{CeacPoint, FrontierPoint};
use crate::data::config::{StrategyConfig, normalize_perspective};
use crate::grid::Jurisdiction;
use crate::incremental::{FrontierEntry, FrontierStatus, StrategySummary};
use crate::nmb::{NmbAnalysis, TieBreak};
use crate::vbp::{PriceProbability, ThresholdPrice, VbpPoint};
use crate::voi::evpi::EvpiPoint;
use crate::voi::evppi::{EvppiMethod, EvppiPoint};
use crate::voi::evsi::{EnbsAnalysis, EvsiSummary};
use serde::Serialize;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Failed to write output: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to write CSV output: {0}")]
    Csv(#[from] csv::Error),
    #[error("Failed to serialize the run manifest: {0}")]
    Toml(#[from] toml::ser::Error),
}

/// Writes output tables into one directory, labelling strategies from `config`.
pub struct OutputWriter<'a> {
    dir: PathBuf,
    config: &'a StrategyConfig,
}

#[derive(Serialize)]
struct CeacRow<'a> {
    strategy: &'a str,
    wtp: f64,
    probability: f64,
}

#[derive(Serialize)]
struct CeafRow<'a> {
    wtp: f64,
    best_strategy: &'a str,
    probability: f64,
}

#[derive(Serialize)]
struct ExpectedNmbRow<'a> {
    lambda: f64,
    strategy: &'a str,
    expected_nmb: f64,
}

#[derive(Serialize)]
struct ShareRow<'a> {
    lambda: f64,
    strategy: &'a str,
    share: f64,
}

#[derive(Serialize)]
struct IncrementalRow<'a> {
    strategy: &'a str,
    mean_cost: f64,
    mean_effect: f64,
    delta_cost: f64,
    delta_effect: f64,
    icer: f64,
    status: Option<FrontierStatus>,
    sequential_icer: Option<f64>,
}

#[derive(Serialize)]
struct VbpRow<'a> {
    therapy: &'a str,
    lambda: f64,
    threshold_price: f64,
    probability_ce: f64,
    base_strategy: &'a str,
}

#[derive(Serialize)]
struct ThresholdRow<'a> {
    therapy: &'a str,
    lambda: f64,
    threshold_price: f64,
}

#[derive(Serialize)]
struct PriceProbabilityRow<'a> {
    therapy: &'a str,
    lambda: f64,
    price: f64,
    probability: f64,
}

#[derive(Serialize)]
struct EvpiRow {
    #[serde(rename = "WTP_Threshold")]
    wtp: f64,
    #[serde(rename = "EVPI")]
    evpi: f64,
    #[serde(rename = "Population_EVPI")]
    population_evpi: f64,
}

#[derive(Serialize)]
struct EvppiRow<'a> {
    group: &'a str,
    wtp: f64,
    evppi: f64,
    method: String,
}

#[derive(Serialize)]
struct EvsiRow {
    sample_size: usize,
    mean: f64,
    sd: f64,
    p2_5: f64,
    p97_5: f64,
}

#[derive(Serialize)]
struct EnbsRow {
    sample_size: usize,
    evsi: f64,
    cost: f64,
    enbs: f64,
}

/// File-name fragment for a perspective: normalised, spaces as underscores.
pub fn perspective_slug(perspective: &str) -> String {
    normalize_perspective(perspective).replace(' ', "_")
}

impl<'a> OutputWriter<'a> {
    /// Creates `dir` (and any parents) when it does not exist.
    pub fn new(dir: &Path, config: &'a StrategyConfig) -> Result<Self, ExportError> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            config,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn label<'s>(&'s self, strategy: &'s str) -> &'s str {
        self.config.label(strategy)
    }

    fn write_rows<R, I>(&self, file_name: &str, rows: I) -> Result<PathBuf, ExportError>
    where
        R: Serialize,
        I: IntoIterator<Item = R>,
    {
        let path = self.dir.join(file_name);
        let mut writer = csv::Writer::from_path(&path)?;
        for row in rows {
            writer.serialize(row)?;
        }
        writer.flush()?;
        log::debug!("Wrote {}", path.display());
        Ok(path)
    }

    pub fn write_ceac(
        &self,
        jurisdiction: Jurisdiction,
        perspective: &str,
        points: &[CeacPoint],
    ) -> Result<PathBuf, ExportError> {
        let name = format!("ceac_{}_{}.csv", jurisdiction, perspective_slug(perspective));
        self.write_rows(
            &name,
            points.iter().map(|p| CeacRow {
                strategy: self.label(&p.strategy),
                wtp: p.wtp,
                probability: p.probability,
            }),
        )
    }

    pub fn write_ceaf(
        &self,
        jurisdiction: Jurisdiction,
        perspective: &str,
        points: &[FrontierPoint],
    ) -> Result<PathBuf, ExportError> {
        let name = format!("ceaf_{}_{}.csv", jurisdiction, perspective_slug(perspective));
        self.write_rows(
            &name,
            points.iter().map(|p| CeafRow {
                wtp: p.wtp,
                best_strategy: self.label(&p.best_strategy),
                probability: p.probability,
            }),
        )
    }

    /// Writes `nmb_expected.csv` and `optimal_share.csv`.
    pub fn write_nmb(&self, analysis: &NmbAnalysis) -> Result<Vec<PathBuf>, ExportError> {
        let strategies = analysis.strategies();
        let lambdas = analysis.lambdas();
        let expected = self.write_rows(
            "nmb_expected.csv",
            lambdas.iter().enumerate().flat_map(|(l, &lambda)| {
                strategies
                    .iter()
                    .enumerate()
                    .map(move |(s, name)| ExpectedNmbRow {
                        lambda,
                        strategy: self.label(name),
                        expected_nmb: analysis.expected[[l, s]],
                    })
            }),
        )?;
        let share = analysis.optimal_share();
        let share_ref = &share;
        let shares = self.write_rows(
            "optimal_share.csv",
            lambdas.iter().enumerate().flat_map(|(l, &lambda)| {
                strategies
                    .iter()
                    .enumerate()
                    .map(move |(s, name)| ShareRow {
                        lambda,
                        strategy: self.label(name),
                        share: share_ref[[l, s]],
                    })
            }),
        )?;
        Ok(vec![expected, shares])
    }

    /// Joins the incremental summary with the efficiency-frontier status.
    pub fn write_incremental(
        &self,
        summary: &[StrategySummary],
        frontier: &[FrontierEntry],
    ) -> Result<PathBuf, ExportError> {
        self.write_rows(
            "incremental.csv",
            summary.iter().map(|row| {
                let entry = frontier.iter().find(|e| e.strategy == row.strategy);
                IncrementalRow {
                    strategy: self.label(&row.strategy),
                    mean_cost: row.mean_cost,
                    mean_effect: row.mean_effect,
                    delta_cost: row.delta_cost,
                    delta_effect: row.delta_effect,
                    icer: row.icer,
                    status: entry.map(|e| e.status),
                    sequential_icer: entry.and_then(|e| e.sequential_icer),
                }
            }),
        )
    }

    pub fn write_vbp_curves(&self, points: &[VbpPoint]) -> Result<PathBuf, ExportError> {
        self.write_rows(
            "vbp_curves.csv",
            points.iter().map(|p| VbpRow {
                therapy: self.label(&p.therapy),
                lambda: p.lambda,
                threshold_price: p.threshold_price,
                probability_ce: p.probability_ce,
                base_strategy: self.label(&p.base_strategy),
            }),
        )
    }

    pub fn write_threshold_prices(&self, points: &[ThresholdPrice]) -> Result<PathBuf, ExportError> {
        self.write_rows(
            "threshold_prices.csv",
            points.iter().map(|p| ThresholdRow {
                therapy: self.label(&p.therapy),
                lambda: p.lambda,
                threshold_price: p.threshold_price,
            }),
        )
    }

    pub fn write_price_probability(
        &self,
        points: &[PriceProbability],
    ) -> Result<PathBuf, ExportError> {
        self.write_rows(
            "price_probability.csv",
            points.iter().map(|p| PriceProbabilityRow {
                therapy: self.label(&p.therapy),
                lambda: p.lambda,
                price: p.price,
                probability: p.probability,
            }),
        )
    }

    pub fn write_evpi(
        &self,
        jurisdiction: Jurisdiction,
        perspective: &str,
        points: &[EvpiPoint],
    ) -> Result<PathBuf, ExportError> {
        let name = format!("evpi_{}_{}.csv", jurisdiction, perspective_slug(perspective));
        self.write_rows(
            &name,
            points.iter().map(|p| EvpiRow {
                wtp: p.wtp,
                evpi: p.evpi,
                population_evpi: p.population_evpi,
            }),
        )
    }

    /// Writes `evppi_legacy.csv` or `evppi_regression.csv` depending on `method`.
    pub fn write_evppi(
        &self,
        method: EvppiMethod,
        points: &[EvppiPoint],
    ) -> Result<PathBuf, ExportError> {
        self.write_rows(
            &format!("evppi_{method}.csv"),
            points.iter().map(|p| EvppiRow {
                group: &p.group,
                wtp: p.wtp,
                evppi: p.evppi,
                method: p.method.to_string(),
            }),
        )
    }

    pub fn write_evsi(&self, summaries: &[EvsiSummary]) -> Result<PathBuf, ExportError> {
        self.write_rows(
            "evsi.csv",
            summaries.iter().map(|s| EvsiRow {
                sample_size: s.sample_size,
                mean: s.mean,
                sd: s.sd,
                p2_5: s.p2_5,
                p97_5: s.p97_5,
            }),
        )
    }

    pub fn write_enbs(&self, analysis: &EnbsAnalysis) -> Result<PathBuf, ExportError> {
        self.write_rows(
            "enbs.csv",
            analysis.points.iter().map(|p| EnbsRow {
                sample_size: p.sample_size,
                evsi: p.evsi,
                cost: p.cost,
                enbs: p.enbs,
            }),
        )
    }

    /// Saves the manifest as `summary.toml`.
    pub fn write_manifest(&self, manifest: &RunManifest) -> Result<PathBuf, ExportError> {
        let path = self.dir.join("summary.toml");
        let toml_string = toml::to_string_pretty(manifest)?;
        let mut file = BufWriter::new(fs::File::create(&path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(path)
    }
}

/// Bounds of the willingness-to-pay grid used by a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GridSummary {
    pub min: f64,
    pub max: f64,
    pub points: usize,
}

impl GridSummary {
    pub fn from_lambdas(lambdas: &[f64]) -> Self {
        let (min, max) = lambdas
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &l| (lo.min(l), hi.max(l)));
        Self {
            min,
            max,
            points: lambdas.len(),
        }
    }
}

/// Headline results repeated in the manifest so a run can be read at a glance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Headline {
    /// Strategy with the highest expected NMB at the largest λ of the grid.
    pub optimal_at_max_lambda: String,
    pub peak_evpi: f64,
    pub peak_evpi_wtp: f64,
    pub optimal_sample_size: Option<usize>,
}

/// Human-readable record of a `run`: inputs as resolved, and what was written.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunManifest {
    pub version: String,
    pub perspective: String,
    pub jurisdiction: Jurisdiction,
    pub base: String,
    pub focal: Option<String>,
    pub tie_break: TieBreak,
    pub seed: Option<u64>,
    pub strategies: Vec<String>,
    pub outputs: Vec<String>,
    pub lambda_grid: GridSummary,
    pub headline: Headline,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incremental::{efficiency_frontier, incremental_summary};
    use crate::nmb::compute_nmb;
    use crate::test_fixtures::constant_two_strategy_table;
    use tempfile::tempdir;

    fn config() -> StrategyConfig {
        StrategyConfig::from_yaml_str(
            r#"
base: Usual care
perspectives: [health_system]
strategies: [Usual care, Ketamine]
prices: {Ketamine: 300}
effects_unit: QALYs
currency: AUD
labels: {Ketamine: IV ketamine}
"#,
        )
        .expect("config")
    }

    #[test]
    fn ceac_file_is_named_by_country_and_perspective_and_uses_labels() {
        let dir = tempdir().unwrap();
        let config = config();
        let writer = OutputWriter::new(&dir.path().join("out"), &config).unwrap();
        let points = vec![CeacPoint {
            strategy: "Ketamine".to_string(),
            wtp: 50_000.0,
            probability: 0.9,
        }];
        let path = writer
            .write_ceac(Jurisdiction::Au, "Health System", &points)
            .unwrap();
        assert_eq!(path.file_name().unwrap(), "ceac_au_health_system.csv");
        let text = fs::read_to_string(path).unwrap();
        assert_eq!(text, "strategy,wtp,probability\nIV ketamine,50000.0,0.9\n");
    }

    #[test]
    fn evpi_headers_keep_their_published_names() {
        let dir = tempdir().unwrap();
        let config = config();
        let writer = OutputWriter::new(dir.path(), &config).unwrap();
        let path = writer
            .write_evpi(
                Jurisdiction::Nz,
                "societal",
                &[EvpiPoint {
                    wtp: 0.0,
                    evpi: 0.0,
                    population_evpi: 0.0,
                }],
            )
            .unwrap();
        let text = fs::read_to_string(path).unwrap();
        assert!(text.starts_with("WTP_Threshold,EVPI,Population_EVPI\n"));
    }

    #[test]
    fn incremental_table_carries_frontier_status() {
        let dir = tempdir().unwrap();
        let config = config();
        let writer = OutputWriter::new(dir.path(), &config).unwrap();
        let table = constant_two_strategy_table(10);
        let summary = incremental_summary(&table, "Usual care").unwrap();
        let frontier = efficiency_frontier(&table);
        let path = writer.write_incremental(&summary, &frontier).unwrap();
        let mut reader = csv::Reader::from_path(path).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(
            headers.iter().collect::<Vec<_>>(),
            [
                "strategy",
                "mean_cost",
                "mean_effect",
                "delta_cost",
                "delta_effect",
                "icer",
                "status",
                "sequential_icer"
            ]
        );
        let rows: Vec<csv::StringRecord> = reader.records().map(Result::unwrap).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[0][0], "Usual care");
        assert_eq!(&rows[0][6], "frontier");
        assert_eq!(&rows[0][7], "");
        assert_eq!(&rows[1][0], "IV ketamine");
        assert_eq!(&rows[1][6], "frontier");
    }

    #[test]
    fn nmb_tables_have_one_row_per_lambda_and_strategy() {
        let dir = tempdir().unwrap();
        let config = config();
        let writer = OutputWriter::new(dir.path(), &config).unwrap();
        let table = constant_two_strategy_table(4);
        let analysis = compute_nmb(&table, &[0.0, 50_000.0], None, TieBreak::Declared).unwrap();
        let paths = writer.write_nmb(&analysis).unwrap();
        for path in paths {
            let reader = csv::Reader::from_path(path).unwrap();
            assert_eq!(reader.into_records().count(), 4);
        }
    }

    #[test]
    fn manifest_round_trips_through_toml() {
        let dir = tempdir().unwrap();
        let config = config();
        let writer = OutputWriter::new(dir.path(), &config).unwrap();
        let manifest = RunManifest {
            version: "0.4.0".to_string(),
            perspective: "health_system".to_string(),
            jurisdiction: Jurisdiction::Au,
            base: "Usual care".to_string(),
            focal: Some("Ketamine".to_string()),
            tie_break: TieBreak::Declared,
            seed: None,
            strategies: vec!["Usual care".to_string(), "Ketamine".to_string()],
            outputs: vec!["incremental.csv".to_string()],
            lambda_grid: GridSummary::from_lambdas(&[0.0, 25_000.0, 50_000.0]),
            headline: Headline {
                optimal_at_max_lambda: "Ketamine".to_string(),
                peak_evpi: 12.5,
                peak_evpi_wtp: 25_000.0,
                optimal_sample_size: Some(200),
            },
        };
        let path = writer.write_manifest(&manifest).unwrap();
        let parsed: toml::Value = toml::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(parsed["jurisdiction"].as_str(), Some("au"));
        assert_eq!(parsed["tie_break"].as_str(), Some("declared"));
        assert_eq!(parsed["lambda_grid"]["points"].as_integer(), Some(3));
        assert_eq!(parsed["headline"]["optimal_sample_size"].as_integer(), Some(200));
        assert!(parsed.get("seed").is_none());
    }
}
