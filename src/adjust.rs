//! Confound adjustment.
//!
//! Several HRV indices scale with how long the recording ran, and a network
//! or factor structure discovered on raw indices would partly reflect that
//! shared dependence. Every feature is therefore replaced by its residual
//! after a simple least-squares regression on the confound column, and the
//! confound itself leaves the table.

use crate::error::{Result, StructureError};
use crate::stats::{mean_variance, ols_residuals};
use crate::table::FeatureTable;
use log::{info, warn};
use ndarray::{Array1, Array2};

/// Residual-variance floor below which an adjusted feature is dropped.
const VARIANCE_TOLERANCE: f64 = 1e-12;

/// Outcome of the adjustment stage.
#[derive(Debug, Clone)]
pub struct AdjustReport {
    /// Features dropped because nothing but the confound explained them.
    pub dropped: Vec<String>,
}

/// Regress the named confound out of every other feature.
///
/// The output table carries residuals in place of raw values and does not
/// contain the confound column. A feature whose residual variance falls
/// below tolerance is dropped with a warning instead of letting a
/// zero-variance column break the correlation and factor stages downstream.
///
/// # Errors
/// [`StructureError::Schema`] if the confound column is absent;
/// [`StructureError::DegenerateData`] if the confound has zero variance or
/// no features survive.
pub fn adjust_for_confound(
    table: &FeatureTable,
    confound: &str,
) -> Result<(FeatureTable, AdjustReport)> {
    let confound_idx = table.position(confound).ok_or_else(|| {
        StructureError::Schema(format!("confound column '{confound}' not found"))
    })?;
    let confound_values: Array1<f64> = table.column(confound_idx).to_owned();
    let (_, confound_var) = mean_variance(confound_values.view());
    if confound_var == 0.0 {
        return Err(StructureError::DegenerateData(format!(
            "confound column '{confound}' has zero variance"
        )));
    }

    let mut kept_names = Vec::new();
    let mut kept_residuals: Vec<Array1<f64>> = Vec::new();
    let mut dropped = Vec::new();

    for (idx, name) in table.names.iter().enumerate() {
        if idx == confound_idx {
            continue;
        }
        let residuals = ols_residuals(table.column(idx), confound_values.view())?;
        let (_, residual_var) = mean_variance(residuals.view());
        if residual_var < VARIANCE_TOLERANCE {
            warn!(
                "Dropping '{name}': variance {residual_var:.3e} after adjusting for '{confound}'."
            );
            dropped.push(name.clone());
            continue;
        }
        kept_names.push(name.clone());
        kept_residuals.push(residuals);
    }

    if kept_names.len() < 2 {
        return Err(StructureError::DegenerateData(format!(
            "{} feature(s) left after confound adjustment; need at least 2",
            kept_names.len()
        )));
    }
    info!(
        "Adjusted {} features for '{confound}' ({} dropped).",
        kept_names.len(),
        dropped.len()
    );

    let rows = table.n_observations();
    let mut data = Array2::<f64>::zeros((rows, kept_names.len()));
    for (c, residuals) in kept_residuals.iter().enumerate() {
        for (r, &v) in residuals.iter().enumerate() {
            data[[r, c]] = v;
        }
    }

    Ok((
        FeatureTable {
            names: kept_names,
            data,
            participants: table.participants.clone(),
            databases: table.databases.clone(),
        },
        AdjustReport { dropped },
    ))
}
