//! Factor extraction.
//!
//! A criterion ensemble proposes how many latent dimensions the adjusted
//! feature set carries, then a maximum-likelihood factor model with a
//! varimax rotation is fitted at the chosen count. Varimax plus ML trades
//! factor correlations away for interpretability: each factor should load a
//! distinct subset of indices, which is what the dimensionality question
//! needs. Criterion disagreement is reported, never treated as an error;
//! the final count is a caller decision with the consensus as default.

use crate::error::{Result, StructureError};
use crate::stats::{correlation_matrix, to_dmatrix};
use crate::table::FeatureTable;
use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::Normal;
use statrs::distribution::{ChiSquared, ContinuousCDF};

/// Uniqueness floor guarding against Heywood cases.
const PSI_FLOOR: f64 = 0.005;
const ML_MAX_ITERATIONS: usize = 500;
const ML_TOLERANCE: f64 = 1e-7;
const VARIMAX_MAX_ITERATIONS: usize = 1000;
const VARIMAX_EPSILON: f64 = 1e-5;
/// Same eigenvalue floor the network stage uses for singularity.
const SINGULARITY_TOLERANCE: f64 = 1e-10;

#[derive(Debug, Clone, Copy)]
pub struct FactorOptions {
    /// Caller-chosen factor count; overrides the consensus when set.
    pub k_override: Option<usize>,
    /// Upper bound for the BIC scan; defaults to the largest count with a
    /// non-negative test degrees-of-freedom.
    pub max_factors: Option<usize>,
    /// Loadings below this are blanked in the artifact, not in the model.
    pub loading_display_threshold: f64,
    /// Surrogate datasets drawn for Horn's parallel analysis.
    pub parallel_analysis_draws: usize,
    pub seed: u64,
}

impl Default for FactorOptions {
    fn default() -> Self {
        FactorOptions {
            k_override: None,
            max_factors: None,
            loading_display_threshold: 0.4,
            parallel_analysis_draws: 200,
            seed: 17,
        }
    }
}

/// One criterion's proposal.
#[derive(Debug, Clone)]
pub struct CriterionProposal {
    pub criterion: String,
    pub k: usize,
}

/// The full ensemble breakdown plus the count actually used downstream.
#[derive(Debug, Clone)]
pub struct FactorSelection {
    pub proposals: Vec<CriterionProposal>,
    pub consensus: usize,
    pub chosen: usize,
}

/// Likelihood-based fit summary of a factor model.
#[derive(Debug, Clone, Copy)]
pub struct FactorFitStats {
    pub discrepancy: f64,
    pub chi_square: f64,
    pub dof: i64,
    pub p_value: Option<f64>,
    pub bic: f64,
}

/// A fitted, rotated factor model over the table's features.
#[derive(Debug, Clone)]
pub struct FactorModel {
    pub names: Vec<String>,
    pub k: usize,
    /// features x k, varimax-rotated.
    pub loadings: DMatrix<f64>,
    pub uniquenesses: Vec<f64>,
    /// Dominant factor per feature (argmax |loading|).
    pub primary: Vec<usize>,
    pub stats: FactorFitStats,
}

/// Run selection and fitting in one step.
///
/// # Errors
/// Propagates selection and fit failures; rejects a `k_override` of 0 or
/// larger than the feature count.
pub fn extract_factors(
    table: &FeatureTable,
    options: &FactorOptions,
) -> Result<(FactorSelection, FactorModel)> {
    let selection = select_factor_count(table, options)?;
    info!(
        "Factor count: consensus {} from {:?}, using {}.",
        selection.consensus,
        selection
            .proposals
            .iter()
            .map(|p| format!("{}={}", p.criterion, p.k))
            .collect::<Vec<_>>(),
        selection.chosen
    );
    let model = fit_factor_model(table, selection.chosen)?;
    Ok((selection, model))
}

/// Criterion ensemble: Kaiser, parallel analysis, acceleration factor, and
/// BIC over ML fits. The consensus is the modal proposal, smallest on ties.
///
/// # Errors
/// [`StructureError::DegenerateData`] if the correlation matrix cannot be
/// built; [`StructureError::Config`] for an out-of-range override.
pub fn select_factor_count(
    table: &FeatureTable,
    options: &FactorOptions,
) -> Result<FactorSelection> {
    let p = table.n_features();
    let n = table.n_observations();
    if p < 3 {
        return Err(StructureError::DegenerateData(format!(
            "factor count selection needs at least 3 features, got {p}"
        )));
    }

    let corr = correlation_matrix(&table.data)?;
    let eigenvalues = sorted_eigenvalues(&to_dmatrix(&corr));

    let mut proposals = Vec::new();

    let kaiser = eigenvalues.iter().filter(|&&v| v > 1.0).count().max(1);
    proposals.push(CriterionProposal {
        criterion: "kaiser".to_string(),
        k: kaiser,
    });

    let reference = parallel_analysis_reference(
        n,
        p,
        options.parallel_analysis_draws,
        options.seed,
    )?;
    let mut pa = 0;
    for (real, surrogate) in eigenvalues.iter().zip(reference.iter()) {
        if real > surrogate {
            pa += 1;
        } else {
            break;
        }
    }
    proposals.push(CriterionProposal {
        criterion: "parallel_analysis".to_string(),
        k: pa.max(1),
    });

    proposals.push(CriterionProposal {
        criterion: "acceleration_factor".to_string(),
        k: acceleration_factor(&eigenvalues),
    });

    if let Some(k) = best_bic(table, options.max_factors) {
        proposals.push(CriterionProposal {
            criterion: "bic".to_string(),
            k,
        });
    }

    let consensus = modal_proposal(&proposals);
    let chosen = options.k_override.unwrap_or(consensus);
    validate_factor_count(chosen, p)?;

    Ok(FactorSelection {
        proposals,
        consensus,
        chosen,
    })
}

fn validate_factor_count(k: usize, p: usize) -> Result<()> {
    if k == 0 {
        return Err(StructureError::Config(
            "factor count must be at least 1".to_string(),
        ));
    }
    if k > p {
        return Err(StructureError::Config(format!(
            "factor count {k} exceeds feature count {p}"
        )));
    }
    Ok(())
}

fn modal_proposal(proposals: &[CriterionProposal]) -> usize {
    let mut counts: Vec<(usize, usize)> = Vec::new();
    for proposal in proposals {
        match counts.iter_mut().find(|(k, _)| *k == proposal.k) {
            Some((_, c)) => *c += 1,
            None => counts.push((proposal.k, 1)),
        }
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
        .map_or(1, |(k, _)| k)
}

fn sorted_eigenvalues(m: &DMatrix<f64>) -> Vec<f64> {
    let mut values: Vec<f64> = m
        .clone()
        .symmetric_eigen()
        .eigenvalues
        .iter()
        .cloned()
        .collect();
    values.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    values
}

/// Position-wise 95th-percentile eigenvalues of seeded standard-normal
/// surrogate tables with the observed shape (Horn's parallel analysis).
fn parallel_analysis_reference(
    n: usize,
    p: usize,
    draws: usize,
    seed: u64,
) -> Result<Vec<f64>> {
    if draws == 0 {
        return Err(StructureError::Config(
            "parallel analysis needs at least 1 draw".to_string(),
        ));
    }
    let normal = Normal::new(0.0, 1.0).map_err(|e| {
        StructureError::Config(format!("failed to build normal distribution: {e}"))
    })?;

    let mut per_position: Vec<Vec<f64>> = vec![Vec::with_capacity(draws); p];
    for draw in 0..draws {
        let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(draw as u64));
        let surrogate =
            ndarray::Array2::from_shape_fn((n, p), |_| rng.sample::<f64, _>(normal));
        let corr = correlation_matrix(&surrogate)?;
        for (position, value) in sorted_eigenvalues(&to_dmatrix(&corr)).into_iter().enumerate()
        {
            per_position[position].push(value);
        }
    }

    let quantile_index = ((draws as f64 * 0.95).ceil() as usize).saturating_sub(1);
    Ok(per_position
        .into_iter()
        .map(|mut values| {
            values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            values[quantile_index.min(values.len() - 1)]
        })
        .collect())
}

/// Largest second difference of the scree (Raiche's acceleration factor).
fn acceleration_factor(eigenvalues: &[f64]) -> usize {
    if eigenvalues.len() < 3 {
        return 1;
    }
    let mut best_position = 1;
    let mut best_value = f64::NEG_INFINITY;
    for i in 1..eigenvalues.len() - 1 {
        let second_difference = eigenvalues[i - 1] - 2.0 * eigenvalues[i] + eigenvalues[i + 1];
        if second_difference > best_value {
            best_value = second_difference;
            best_position = i;
        }
    }
    best_position.max(1)
}

/// Count of factors minimizing BIC over ML fits up to the bound. Counts
/// whose fit fails to converge are skipped; `None` if nothing fits.
fn best_bic(table: &FeatureTable, max_factors: Option<usize>) -> Option<usize> {
    let p = table.n_features();
    let dof_bound = (1..p)
        .take_while(|&k| (p - k) * (p - k) >= p + k)
        .last()
        .unwrap_or(1);
    let bound = max_factors.map_or(dof_bound, |m| m.min(dof_bound));

    let mut best: Option<(usize, f64)> = None;
    for k in 1..=bound {
        match fit_factor_model(table, k) {
            Ok(model) => {
                debug!("BIC scan: k = {k}, BIC = {:.2}.", model.stats.bic);
                if best.map_or(true, |(_, b)| model.stats.bic < b) {
                    best = Some((k, model.stats.bic));
                }
            }
            Err(e) => debug!("BIC scan: k = {k} failed ({e})."),
        }
    }
    best.map(|(k, _)| k)
}

/// Fit a maximum-likelihood factor model with `k` factors and rotate it.
///
/// The fit iterates eigendecompositions of the uniqueness-rescaled
/// correlation matrix with SMC starting values; uniquenesses are floored
/// against Heywood collapse.
///
/// # Errors
/// [`StructureError::Config`] for k = 0 or k beyond the feature count;
/// [`StructureError::DegenerateData`] for a singular correlation matrix or
/// a fit whose implied covariance cannot be inverted.
pub fn fit_factor_model(table: &FeatureTable, k: usize) -> Result<FactorModel> {
    let p = table.n_features();
    let n = table.n_observations();
    validate_factor_count(k, p)?;

    let corr = to_dmatrix(&correlation_matrix(&table.data)?);
    let min_eigenvalue = sorted_eigenvalues(&corr)
        .last()
        .copied()
        .unwrap_or(f64::NEG_INFINITY);
    if min_eigenvalue < SINGULARITY_TOLERANCE {
        return Err(StructureError::DegenerateData(format!(
            "correlation matrix is singular (smallest eigenvalue {min_eigenvalue:.3e})"
        )));
    }

    // SMC-based starting uniquenesses: 1/(S^-1)_ii equals one minus the
    // squared multiple correlation for a correlation matrix.
    let mut psi: Vec<f64> = match corr.clone().try_inverse() {
        Some(inverse) => (0..p)
            .map(|i| (1.0 / inverse[(i, i)]).clamp(PSI_FLOOR, 1.0))
            .collect(),
        None => vec![0.5; p],
    };

    let mut loadings = DMatrix::<f64>::zeros(p, k);
    let mut converged = false;
    for iteration in 0..ML_MAX_ITERATIONS {
        let scale: Vec<f64> = psi.iter().map(|v| v.sqrt()).collect();
        let rescaled = DMatrix::from_fn(p, p, |i, j| corr[(i, j)] / (scale[i] * scale[j]));
        let eigen = rescaled.symmetric_eigen();

        let mut order: Vec<usize> = (0..p).collect();
        order.sort_by(|&a, &b| {
            eigen.eigenvalues[b]
                .partial_cmp(&eigen.eigenvalues[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        for (factor, &position) in order.iter().take(k).enumerate() {
            let coefficient = (eigen.eigenvalues[position] - 1.0).max(0.0).sqrt();
            for i in 0..p {
                loadings[(i, factor)] =
                    scale[i] * eigen.eigenvectors[(i, position)] * coefficient;
            }
        }

        let mut delta: f64 = 0.0;
        for i in 0..p {
            let communality: f64 = (0..k).map(|j| loadings[(i, j)].powi(2)).sum();
            let updated = (1.0 - communality).clamp(PSI_FLOOR, 1.0);
            delta = delta.max((updated - psi[i]).abs());
            psi[i] = updated;
        }
        if delta < ML_TOLERANCE {
            debug!("ML factor fit converged after {} iteration(s).", iteration + 1);
            converged = true;
            break;
        }
    }
    if !converged {
        warn!("ML factor fit hit the iteration cap ({ML_MAX_ITERATIONS}); using last estimate.");
    }

    let stats = fit_statistics(&corr, &loadings, &psi, n, k)?;
    let rotated = varimax(&loadings)?;

    let primary = (0..p)
        .map(|i| {
            (0..k)
                .max_by(|&a, &b| {
                    rotated[(i, a)]
                        .abs()
                        .partial_cmp(&rotated[(i, b)].abs())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .unwrap_or(0)
        })
        .collect();

    Ok(FactorModel {
        names: table.names.clone(),
        k,
        loadings: rotated,
        uniquenesses: psi,
        primary,
        stats,
    })
}

fn fit_statistics(
    corr: &DMatrix<f64>,
    loadings: &DMatrix<f64>,
    psi: &[f64],
    n: usize,
    k: usize,
) -> Result<FactorFitStats> {
    let p = corr.nrows();
    let mut implied = loadings * loadings.transpose();
    for i in 0..p {
        implied[(i, i)] += psi[i];
    }

    let implied_det = implied.determinant();
    let observed_det = corr.determinant();
    let implied_inverse = implied.try_inverse().ok_or_else(|| {
        StructureError::DegenerateData("implied covariance is not invertible".to_string())
    })?;
    let trace = (&implied_inverse * corr).trace();
    let discrepancy =
        (implied_det.ln() - observed_det.ln() + trace - p as f64).max(0.0);

    // Bartlett's correction for the likelihood-ratio statistic.
    let correction = (n as f64 - 1.0) - (2.0 * p as f64 + 5.0) / 6.0 - 2.0 * k as f64 / 3.0;
    let chi_square = (correction * discrepancy).max(0.0);
    let dof = (((p - k) * (p - k)) as i64 - (p + k) as i64) / 2;
    let p_value = if dof > 0 {
        ChiSquared::new(dof as f64)
            .ok()
            .map(|dist| 1.0 - dist.cdf(chi_square))
    } else {
        None
    };
    let bic = chi_square - dof as f64 * (n as f64).ln();

    Ok(FactorFitStats {
        discrepancy,
        chi_square,
        dof,
        p_value,
        bic,
    })
}

/// Varimax rotation with Kaiser normalization (SVD iteration). Columns are
/// sign-fixed so each sums non-negative. A single factor only gets the sign
/// fix. Orthogonal, so per-feature communalities are preserved.
fn varimax(loadings: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    let p = loadings.nrows();
    let k = loadings.ncols();
    if k < 2 {
        let mut out = loadings.clone();
        fix_column_signs(&mut out);
        return Ok(out);
    }

    let row_norms: Vec<f64> = (0..p)
        .map(|i| (0..k).map(|j| loadings[(i, j)].powi(2)).sum::<f64>().sqrt())
        .collect();
    let normalized = DMatrix::from_fn(p, k, |i, j| {
        if row_norms[i] > 1e-12 {
            loadings[(i, j)] / row_norms[i]
        } else {
            0.0
        }
    });

    let mut rotation = DMatrix::<f64>::identity(k, k);
    let mut previous = 0.0;
    for _ in 0..VARIMAX_MAX_ITERATIONS {
        let rotated = &normalized * &rotation;
        let column_sums: DVector<f64> = rotated.map(|v| v * v).row_sum().transpose();
        let gradient = rotated.map(|v| v * v * v)
            - &rotated * DMatrix::from_diagonal(&(column_sums / p as f64));
        let target = normalized.transpose() * gradient;

        let svd = target.svd(true, true);
        let u = svd.u.as_ref().ok_or_else(|| {
            StructureError::DegenerateData("varimax SVD did not produce U".to_string())
        })?;
        let v_t = svd.v_t.as_ref().ok_or_else(|| {
            StructureError::DegenerateData("varimax SVD did not produce V^T".to_string())
        })?;
        rotation = u * v_t;

        let objective: f64 = svd.singular_values.iter().sum();
        if previous != 0.0 && objective < previous * (1.0 + VARIMAX_EPSILON) {
            break;
        }
        previous = objective;
    }

    let rotated = normalized * rotation;
    let mut out = DMatrix::from_fn(p, k, |i, j| rotated[(i, j)] * row_norms[i]);
    fix_column_signs(&mut out);
    Ok(out)
}

fn fix_column_signs(loadings: &mut DMatrix<f64>) {
    for j in 0..loadings.ncols() {
        let column_sum: f64 = (0..loadings.nrows()).map(|i| loadings[(i, j)]).sum();
        if column_sum < 0.0 {
            for i in 0..loadings.nrows() {
                loadings[(i, j)] = -loadings[(i, j)];
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn table_with(names: &[&str], columns: Vec<Vec<f64>>) -> FeatureTable {
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

    fn two_block_table() -> FeatureTable {
        let n = 60;
        let mut columns = Vec::new();
        let mut names = Vec::new();
        for k in 0..3 {
            columns.push(
                (0..n)
                    .map(|t| (0.37 * t as f64).sin() + 0.4 * (1.3 * t as f64 + k as f64).sin())
                    .collect(),
            );
            names.push(format!("a{k}"));
        }
        for k in 0..3 {
            columns.push(
                (0..n)
                    .map(|t| (0.53 * t as f64).cos() + 0.4 * (2.1 * t as f64 + k as f64).sin())
                    .collect(),
            );
            names.push(format!("b{k}"));
        }
        let name_refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
        table_with(&name_refs, columns)
    }

    #[test]
    fn test_loading_matrix_shape() {
        let table = two_block_table();
        let model = fit_factor_model(&table, 2).expect("fit");
        assert_eq!(model.loadings.nrows(), table.n_features());
        assert_eq!(model.loadings.ncols(), 2);
        assert_eq!(model.uniquenesses.len(), table.n_features());
        assert_eq!(model.primary.len(), table.n_features());
    }

    #[test]
    fn test_zero_factor_count_rejected() {
        let table = two_block_table();
        let err = fit_factor_model(&table, 0).unwrap_err();
        assert!(matches!(err, StructureError::Config(_)));
    }

    #[test]
    fn test_excess_factor_count_rejected() {
        let table = two_block_table();
        let err = fit_factor_model(&table, table.n_features() + 1).unwrap_err();
        assert!(matches!(err, StructureError::Config(_)));
    }

    #[test]
    fn test_two_blocks_split_across_primary_factors() {
        let table = two_block_table();
        let model = fit_factor_model(&table, 2).expect("fit");
        assert_eq!(model.primary[0], model.primary[1]);
        assert_eq!(model.primary[1], model.primary[2]);
        assert_eq!(model.primary[3], model.primary[4]);
        assert_eq!(model.primary[4], model.primary[5]);
        assert_ne!(model.primary[0], model.primary[3]);
    }

    #[test]
    fn test_consensus_recovers_two_factors() {
        let table = two_block_table();
        let selection =
            select_factor_count(&table, &FactorOptions::default()).expect("selection");
        assert!(selection.proposals.len() >= 3);
        assert_eq!(selection.consensus, 2);
        assert_eq!(selection.chosen, 2);
    }

    #[test]
    fn test_override_wins_over_consensus() {
        let table = two_block_table();
        let options = FactorOptions {
            k_override: Some(3),
            ..FactorOptions::default()
        };
        let selection = select_factor_count(&table, &options).expect("selection");
        assert_eq!(selection.chosen, 3);
    }

    #[test]
    fn test_varimax_preserves_communalities() {
        let raw = DMatrix::from_row_slice(
            4,
            2,
            &[0.8, 0.3, 0.7, 0.4, 0.2, 0.9, 0.1, 0.8],
        );
        let rotated = varimax(&raw).expect("rotation");
        for i in 0..4 {
            let before: f64 = (0..2).map(|j| raw[(i, j)].powi(2)).sum();
            let after: f64 = (0..2).map(|j| rotated[(i, j)].powi(2)).sum();
            assert!((before - after).abs() < 1e-9, "row {i}: {before} vs {after}");
        }
    }

    #[test]
    fn test_fit_statistics_populated() {
        let table = two_block_table();
        let model = fit_factor_model(&table, 2).expect("fit");
        assert!(model.stats.dof > 0);
        let p_value = model.stats.p_value.expect("p-value for positive dof");
        assert!((0.0..=1.0).contains(&p_value));
        assert!(model.stats.chi_square >= 0.0);
    }
}
