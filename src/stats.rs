//! Shared statistical primitives used by every pipeline stage.

use crate::error::{Result, StructureError};
use nalgebra::DMatrix;
use ndarray::{Array1, Array2, ArrayView1};

/// Pearson correlation coefficient between two equal-length series.
///
/// A zero-variance series yields `r = 0` rather than NaN; degenerate inputs
/// (mismatched lengths, fewer than two observations) are errors.
///
/// # Errors
/// Returns [`StructureError::DegenerateData`] on mismatched lengths or fewer
/// than two observations.
pub fn pearson(x: ArrayView1<f64>, y: ArrayView1<f64>) -> Result<f64> {
    if x.len() != y.len() {
        return Err(StructureError::DegenerateData(format!(
            "correlation requires equal lengths, got {} and {}",
            x.len(),
            y.len()
        )));
    }
    if x.len() < 2 {
        return Err(StructureError::DegenerateData(
            "correlation requires at least 2 observations".to_string(),
        ));
    }

    let n = x.len() as f64;
    let mean_x = x.sum() / n;
    let mean_y = y.sum() / n;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (&xi, &yi) in x.iter().zip(y.iter()) {
        let dx = xi - mean_x;
        let dy = yi - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }

    let denom = (var_x * var_y).sqrt();
    if denom == 0.0 {
        return Ok(0.0);
    }
    Ok(cov / denom)
}

/// Full pairwise Pearson correlation matrix over the columns of an
/// observations x features matrix. Symmetric with unit diagonal.
///
/// # Errors
/// Propagates [`pearson`] failures.
pub fn correlation_matrix(data: &Array2<f64>) -> Result<Array2<f64>> {
    let p = data.ncols();
    let mut corr = Array2::<f64>::zeros((p, p));
    for i in 0..p {
        corr[[i, i]] = 1.0;
        for j in (i + 1)..p {
            let r = pearson(data.column(i), data.column(j))?;
            corr[[i, j]] = r;
            corr[[j, i]] = r;
        }
    }
    Ok(corr)
}

/// Population mean and variance of a series (variance with divisor n).
pub fn mean_variance(x: ArrayView1<f64>) -> (f64, f64) {
    let n = x.len() as f64;
    if x.is_empty() {
        return (0.0, 0.0);
    }
    let mean = x.sum() / n;
    let var = x.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var)
}

/// Standardize every column to zero mean and unit variance.
///
/// A column whose standard deviation is numerically zero is centered but not
/// scaled, so it cannot inject NaN into a distance computation.
pub fn standardize_columns(data: &Array2<f64>) -> Array2<f64> {
    let mut out = data.clone();
    for mut col in out.columns_mut() {
        let (mean, var) = mean_variance(col.view());
        let sd = var.sqrt();
        if sd > 0.0 {
            col.mapv_inplace(|v| (v - mean) / sd);
        } else {
            col.mapv_inplace(|v| v - mean);
        }
    }
    out
}

/// Residuals of a simple least-squares regression of `y` on `x`.
///
/// # Errors
/// Returns [`StructureError::DegenerateData`] if the regressor has zero
/// variance, which leaves the slope undefined.
pub fn ols_residuals(y: ArrayView1<f64>, x: ArrayView1<f64>) -> Result<Array1<f64>> {
    let (mean_x, var_x) = mean_variance(x);
    if var_x == 0.0 {
        return Err(StructureError::DegenerateData(
            "regressor has zero variance".to_string(),
        ));
    }
    let (mean_y, _) = mean_variance(y);

    let n = x.len() as f64;
    let cov = x
        .iter()
        .zip(y.iter())
        .map(|(&xi, &yi)| (xi - mean_x) * (yi - mean_y))
        .sum::<f64>()
        / n;
    let slope = cov / var_x;
    let intercept = mean_y - slope * mean_x;

    Ok(y.iter()
        .zip(x.iter())
        .map(|(&yi, &xi)| yi - (intercept + slope * xi))
        .collect())
}

/// Copy an ndarray matrix into a nalgebra matrix for dense decompositions.
pub fn to_dmatrix(a: &Array2<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(a.nrows(), a.ncols(), |i, j| a[[i, j]])
}
