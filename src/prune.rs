//! Redundancy pruning.
//!
//! Two ordered correlation passes remove features that a curated
//! equivalence map declares interchangeable: a near-duplicate pass for
//! indices that are deterministic functions of their representative, then a
//! conservative strong-correlation pass on the reduced set. Removal is
//! always map-driven; the thresholds only gate whether a configured alias
//! actually collapses. Pairs above a looser exploratory view threshold are
//! reported but never removed.

use crate::error::{Result, StructureError};
use crate::stats::correlation_matrix;
use crate::table::FeatureTable;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// A curated family of interchangeable indices: aliases collapse onto the
/// representative whenever they exceed the pass threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquivalenceFamily {
    pub family: String,
    pub representative: String,
    pub aliases: Vec<String>,
}

/// Externally supplied pruning policy, one family list per pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruneConfig {
    pub near_duplicates: Vec<EquivalenceFamily>,
    pub strong_correlations: Vec<EquivalenceFamily>,
}

impl PruneConfig {
    /// Built-in map for the standard HRV index vocabulary. SD1 and SDSD are
    /// deterministic transforms of RMSSD on stationary interval series; the
    /// strong-correlation families carry indices that track their
    /// representative across recordings without being exact transforms.
    pub fn default_hrv() -> Self {
        PruneConfig {
            near_duplicates: vec![
                EquivalenceFamily {
                    family: "short_term_variability".to_string(),
                    representative: "RMSSD".to_string(),
                    aliases: vec!["SD1".to_string(), "SDSD".to_string()],
                },
                EquivalenceFamily {
                    family: "interval_level".to_string(),
                    representative: "MeanNN".to_string(),
                    aliases: vec!["MCVNN".to_string()],
                },
            ],
            strong_correlations: vec![
                EquivalenceFamily {
                    family: "overall_variability".to_string(),
                    representative: "SDNN".to_string(),
                    aliases: vec!["SD2".to_string(), "CVNN".to_string()],
                },
                EquivalenceFamily {
                    family: "interval_level".to_string(),
                    representative: "MeanNN".to_string(),
                    aliases: vec!["MedianNN".to_string()],
                },
            ],
        }
    }

    /// Load a policy from a JSON file.
    ///
    /// # Errors
    /// [`StructureError::Io`]/[`StructureError::Json`] on unreadable or
    /// malformed input.
    pub fn from_json_path(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Check every name the map references against a concrete table.
    ///
    /// Run once at pipeline start: a user-supplied map naming features the
    /// table does not have is a configuration mistake, not something to
    /// paper over.
    ///
    /// # Errors
    /// [`StructureError::Config`] naming the first unknown feature.
    pub fn validate_against(&self, table: &FeatureTable) -> Result<()> {
        for family in self
            .near_duplicates
            .iter()
            .chain(self.strong_correlations.iter())
        {
            for name in std::iter::once(&family.representative).chain(family.aliases.iter()) {
                if table.position(name).is_none() {
                    return Err(StructureError::Config(format!(
                        "pruning map family '{}' references unknown feature '{}'",
                        family.family, name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Thresholds for the two passes plus the exploratory view.
#[derive(Debug, Clone, Copy)]
pub struct PruneThresholds {
    /// Pass A: an alias is a numerically deterministic duplicate.
    pub near_duplicate: f64,
    /// Pass B removal: conservative strong-correlation collapse.
    pub removal: f64,
    /// Pass B view: looser listing of strongly related pairs, never removed.
    pub view: f64,
}

impl Default for PruneThresholds {
    fn default() -> Self {
        // The view threshold is intentionally looser than the removal
        // threshold; the listing is exploratory while removal stays
        // conservative.
        PruneThresholds {
            near_duplicate: 0.995,
            removal: 0.98,
            view: 0.95,
        }
    }
}

impl PruneThresholds {
    /// # Errors
    /// [`StructureError::Config`] if any threshold is outside (0, 1].
    pub fn validate(&self) -> Result<()> {
        for (label, value) in [
            ("near-duplicate", self.near_duplicate),
            ("removal", self.removal),
            ("view", self.view),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(StructureError::Config(format!(
                    "{label} threshold {value} outside (0, 1]"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrunePass {
    NearDuplicate,
    StrongCorrelation,
}

impl PrunePass {
    pub fn label(&self) -> &'static str {
        match self {
            PrunePass::NearDuplicate => "near_duplicate",
            PrunePass::StrongCorrelation => "strong_correlation",
        }
    }
}

/// One removal decision, kept for the artifact ledger.
#[derive(Debug, Clone)]
pub struct Removal {
    pub feature: String,
    pub family: String,
    pub representative: String,
    pub abs_r: f64,
    pub pass: PrunePass,
}

/// Everything the pruner decided: removals plus the exploratory pair view.
#[derive(Debug, Clone, Default)]
pub struct PruneReport {
    pub removals: Vec<Removal>,
    /// Pairs whose |r| exceeded the view threshold in pass B, surviving or
    /// not. Sorted by descending |r|.
    pub view_pairs: Vec<(String, String, f64)>,
}

/// Run both passes and return the reduced table with the decision ledger.
///
/// An alias configured in the map but no longer present in the input is
/// skipped, which makes the pruner idempotent on its own output; use
/// [`PruneConfig::validate_against`] up front to reject maps that never
/// matched the table at all.
///
/// # Errors
/// [`StructureError::Config`] on invalid thresholds;
/// [`StructureError::DegenerateData`] from correlation computation.
pub fn prune(
    table: &FeatureTable,
    config: &PruneConfig,
    thresholds: &PruneThresholds,
) -> Result<(FeatureTable, PruneReport)> {
    thresholds.validate()?;
    let mut report = PruneReport::default();

    let after_a = run_pass(
        table,
        &config.near_duplicates,
        thresholds.near_duplicate,
        PrunePass::NearDuplicate,
        &mut report,
    )?;
    info!(
        "Near-duplicate pass: {} -> {} features.",
        table.n_features(),
        after_a.n_features()
    );

    // Correlations are recomputed on the reduced set; the view listing is
    // taken from the same matrix pass B removes from.
    let corr = correlation_matrix(&after_a.data)?;
    for i in 0..after_a.n_features() {
        for j in (i + 1)..after_a.n_features() {
            let r = corr[[i, j]];
            if r.abs() > thresholds.view {
                report
                    .view_pairs
                    .push((after_a.names[i].clone(), after_a.names[j].clone(), r));
            }
        }
    }
    report
        .view_pairs
        .sort_by(|a, b| b.2.abs().partial_cmp(&a.2.abs()).unwrap_or(std::cmp::Ordering::Equal));
    for (a, b, r) in &report.view_pairs {
        info!("Strongly related pair (view): {a} ~ {b} (r = {r:.3})");
    }

    let after_b = run_pass(
        &after_a,
        &config.strong_correlations,
        thresholds.removal,
        PrunePass::StrongCorrelation,
        &mut report,
    )?;
    info!(
        "Strong-correlation pass: {} -> {} features.",
        after_a.n_features(),
        after_b.n_features()
    );

    Ok((after_b, report))
}

fn run_pass(
    table: &FeatureTable,
    families: &[EquivalenceFamily],
    threshold: f64,
    pass: PrunePass,
    report: &mut PruneReport,
) -> Result<FeatureTable> {
    let corr = correlation_matrix(&table.data)?;
    let mut remove = vec![false; table.n_features()];

    for family in families {
        let Some(rep_idx) = table.position(&family.representative) else {
            debug!(
                "{} pass: representative '{}' not present, skipping family '{}'.",
                pass.label(),
                family.representative,
                family.family
            );
            continue;
        };
        for alias in &family.aliases {
            let Some(alias_idx) = table.position(alias) else {
                debug!(
                    "{} pass: alias '{}' not present, skipping.",
                    pass.label(),
                    alias
                );
                continue;
            };
            if alias_idx == rep_idx {
                continue;
            }
            let abs_r = corr[[rep_idx, alias_idx]].abs();
            if abs_r > threshold {
                debug!(
                    "{} pass: removing '{}' (family '{}', |r| = {:.4} with '{}').",
                    pass.label(),
                    alias,
                    family.family,
                    abs_r,
                    family.representative
                );
                remove[alias_idx] = true;
                report.removals.push(Removal {
                    feature: alias.clone(),
                    family: family.family.clone(),
                    representative: family.representative.clone(),
                    abs_r,
                    pass,
                });
            } else {
                debug!(
                    "{} pass: alias '{}' below threshold (|r| = {:.4} <= {}), kept.",
                    pass.label(),
                    alias,
                    abs_r,
                    threshold
                );
            }
        }
    }

    let keep: Vec<usize> = (0..table.n_features()).filter(|&i| !remove[i]).collect();
    Ok(table.retain_columns(&keep))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn synthetic_table(names: &[&str], columns: Vec<Vec<f64>>) -> FeatureTable {
        let rows = columns[0].len();
        let mut data = Array2::<f64>::zeros((rows, columns.len()));
        for (c, col) in columns.iter().enumerate() {
            for (r, &v) in col.iter().enumerate() {
                data[[r, c]] = v;
            }
        }
        FeatureTable {
            names: names.iter().map(|s| s.to_string()).collect(),
            data,
            participants: (0..rows).map(|i| format!("p{i}")).collect(),
            databases: vec!["db".to_string(); rows],
        }
    }

    fn copy_pair_config() -> PruneConfig {
        PruneConfig {
            near_duplicates: vec![EquivalenceFamily {
                family: "copies".to_string(),
                representative: "a".to_string(),
                aliases: vec!["a_copy".to_string()],
            }],
            strong_correlations: vec![],
        }
    }

    #[test]
    fn test_exact_copy_removes_exactly_one() {
        let base: Vec<f64> = (0..50).map(|i| (i as f64 * 0.37).sin() * 10.0).collect();
        let copy = base.clone();
        let other: Vec<f64> = (0..50).map(|i| (i as f64 * 1.11).cos()).collect();
        let table = synthetic_table(&["a", "a_copy", "b"], vec![base, copy, other]);

        let (reduced, report) =
            prune(&table, &copy_pair_config(), &PruneThresholds::default()).expect("prune");
        assert_eq!(reduced.names, vec!["a", "b"]);
        assert_eq!(report.removals.len(), 1);
        assert_eq!(report.removals[0].feature, "a_copy");
        assert_eq!(report.removals[0].pass, PrunePass::NearDuplicate);
    }

    #[test]
    fn test_idempotent_on_own_output() {
        let base: Vec<f64> = (0..50).map(|i| (i as f64 * 0.37).sin() * 10.0).collect();
        let copy = base.clone();
        let other: Vec<f64> = (0..50).map(|i| (i as f64 * 1.11).cos()).collect();
        let table = synthetic_table(&["a", "a_copy", "b"], vec![base, copy, other]);

        let config = copy_pair_config();
        let thresholds = PruneThresholds::default();
        let (once, _) = prune(&table, &config, &thresholds).expect("first prune");
        let (twice, report) = prune(&once, &config, &thresholds).expect("second prune");
        assert_eq!(once.names, twice.names);
        assert!(report.removals.is_empty());
    }

    #[test]
    fn test_output_subset_of_input() {
        let cols: Vec<Vec<f64>> = (0..4)
            .map(|c| (0..30).map(|r| ((r * (c + 2)) as f64 * 0.17).sin()).collect())
            .collect();
        let table = synthetic_table(&["w", "x", "y", "z"], cols);
        let (reduced, _) =
            prune(&table, &copy_pair_config(), &PruneThresholds::default()).expect("prune");
        for name in &reduced.names {
            assert!(table.names.contains(name));
        }
    }

    #[test]
    fn test_uncorrelated_alias_not_removed() {
        let base: Vec<f64> = (0..50).map(|i| (i as f64 * 0.37).sin()).collect();
        let unrelated: Vec<f64> = (0..50).map(|i| (i as f64 * 2.3).cos()).collect();
        let table = synthetic_table(&["a", "a_copy"], vec![base, unrelated]);
        let (reduced, report) =
            prune(&table, &copy_pair_config(), &PruneThresholds::default()).expect("prune");
        assert_eq!(reduced.n_features(), 2);
        assert!(report.removals.is_empty());
    }

    #[test]
    fn test_family_with_several_aliases_collapses_in_one_pass() {
        let base: Vec<f64> = (0..40).map(|i| i as f64 * 0.5 + (i as f64 * 0.9).sin() * 0.01).collect();
        let scaled: Vec<f64> = base.iter().map(|v| v / std::f64::consts::SQRT_2).collect();
        let shifted: Vec<f64> = base.iter().map(|v| v + 3.0).collect();
        let other: Vec<f64> = (0..40).map(|i| (i as f64 * 1.7).cos()).collect();
        let table = synthetic_table(
            &["RMSSD", "SD1", "SDSD", "HF"],
            vec![base, scaled, shifted, other],
        );
        let config = PruneConfig {
            near_duplicates: vec![EquivalenceFamily {
                family: "short_term_variability".to_string(),
                representative: "RMSSD".to_string(),
                aliases: vec!["SD1".to_string(), "SDSD".to_string()],
            }],
            strong_correlations: vec![],
        };
        let (reduced, report) =
            prune(&table, &config, &PruneThresholds::default()).expect("prune");
        assert_eq!(reduced.names, vec!["RMSSD", "HF"]);
        assert_eq!(report.removals.len(), 2);
    }

    #[test]
    fn test_view_pairs_do_not_drive_removal() {
        // r ~ 0.97: above the view threshold, below both removal thresholds.
        let base: Vec<f64> = (0..60).map(|i| i as f64).collect();
        let noisy: Vec<f64> = base
            .iter()
            .enumerate()
            .map(|(i, v)| v + 6.0 * (i as f64 * 2.7).sin())
            .collect();
        let table = synthetic_table(&["a", "b"], vec![base, noisy]);
        let config = PruneConfig {
            near_duplicates: vec![],
            strong_correlations: vec![EquivalenceFamily {
                family: "pair".to_string(),
                representative: "a".to_string(),
                aliases: vec!["b".to_string()],
            }],
        };
        let (reduced, report) =
            prune(&table, &config, &PruneThresholds::default()).expect("prune");
        assert_eq!(reduced.n_features(), 2);
        assert!(report.removals.is_empty());
        assert_eq!(report.view_pairs.len(), 1);
    }

    #[test]
    fn test_validate_against_rejects_unknown_names() {
        let table = synthetic_table(
            &["a", "b"],
            vec![vec![1.0, 2.0, 3.0], vec![2.0, 1.0, 4.0]],
        );
        let config = PruneConfig {
            near_duplicates: vec![EquivalenceFamily {
                family: "ghost".to_string(),
                representative: "a".to_string(),
                aliases: vec!["missing".to_string()],
            }],
            strong_correlations: vec![],
        };
        let err = config.validate_against(&table).unwrap_err();
        assert!(matches!(err, StructureError::Config(_)));
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let thresholds = PruneThresholds {
            near_duplicate: 1.5,
            ..PruneThresholds::default()
        };
        assert!(thresholds.validate().is_err());
    }
}
