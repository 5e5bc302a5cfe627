//! Hierarchical clustering of features with bootstrap support.
//!
//! Features are standardized and agglomerated under Ward's minimum-variance
//! criterion; observation resampling then asks how often each branch of the
//! reference tree recurs, which is the support value reported per merge.
//! Replicates are independent, so they fan out over the rayon pool with a
//! deterministic per-replicate seed.

use crate::error::{Result, StructureError};
use crate::stats::standardize_columns;
use crate::table::FeatureTable;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use ndarray::Array2;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy)]
pub struct ClusterOptions {
    /// Bootstrap replicate count; more replicates trade speed for tighter
    /// support estimates.
    pub replicates: usize,
    pub seed: u64,
    pub show_progress: bool,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        ClusterOptions {
            replicates: 1000,
            seed: 17,
            show_progress: false,
        }
    }
}

/// One agglomeration step. Node ids follow the usual convention: leaves are
/// 0..p-1, merge `m` creates node `p + m`.
#[derive(Debug, Clone)]
pub struct Merge {
    pub id: usize,
    pub left: usize,
    pub right: usize,
    pub height: f64,
    /// Leaf indices under this node, sorted.
    pub members: Vec<usize>,
    /// Fraction of bootstrap replicates reproducing exactly this leaf set.
    pub support: f64,
}

/// The final dendrogram over features.
#[derive(Debug, Clone)]
pub struct ClusterTree {
    pub names: Vec<String>,
    pub merges: Vec<Merge>,
    /// Leaves in dendrogram traversal order, for presentation.
    pub leaf_order: Vec<usize>,
    pub replicates: usize,
}

/// Cluster the table's features and annotate branches with bootstrap
/// support.
///
/// # Errors
/// [`StructureError::DegenerateData`] with fewer than 2 features;
/// [`StructureError::Config`] for a zero replicate count.
pub fn build_cluster_tree(table: &FeatureTable, options: &ClusterOptions) -> Result<ClusterTree> {
    let p = table.n_features();
    let n = table.n_observations();
    if p < 2 {
        return Err(StructureError::DegenerateData(format!(
            "clustering needs at least 2 features, got {p}"
        )));
    }
    if options.replicates == 0 {
        return Err(StructureError::Config(
            "bootstrap replicate count must be at least 1".to_string(),
        ));
    }

    let standardized = standardize_columns(&table.data);
    let reference = ward_merges(&standardized);

    info!(
        "Bootstrapping {} replicate(s) over {} observations.",
        options.replicates, n
    );
    let progress = if options.show_progress {
        let bar = ProgressBar::new(options.replicates as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} replicates ({eta})")
        {
            bar.set_style(style.progress_chars("=> "));
        }
        bar
    } else {
        ProgressBar::hidden()
    };

    // Replicate r derives its seed from the base so results never depend on
    // rayon scheduling.
    let branch_sets: Vec<HashSet<Vec<usize>>> = (0..options.replicates)
        .into_par_iter()
        .map(|replicate| {
            let seed = options.seed.wrapping_add(replicate as u64);
            let branches = bootstrap_branches(&table.data, seed);
            progress.inc(1);
            branches
        })
        .collect();
    progress.finish_and_clear();

    let mut counts: HashMap<Vec<usize>, usize> = HashMap::new();
    for set in branch_sets {
        for members in set {
            *counts.entry(members).or_insert(0) += 1;
        }
    }

    let merges: Vec<Merge> = reference
        .into_iter()
        .map(|mut merge| {
            let hits = counts.get(&merge.members).copied().unwrap_or(0);
            merge.support = hits as f64 / options.replicates as f64;
            debug!(
                "Branch {:?}: support {:.3}.",
                merge.members, merge.support
            );
            merge
        })
        .collect();

    let leaf_order = traversal_order(p, &merges);

    Ok(ClusterTree {
        names: table.names.clone(),
        merges,
        leaf_order,
        replicates: options.replicates,
    })
}

/// One bootstrap replicate: resample observations with replacement,
/// restandardize, recluster, and return the branch leaf sets.
fn bootstrap_branches(data: &Array2<f64>, seed: u64) -> HashSet<Vec<usize>> {
    let n = data.nrows();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let rows: Vec<usize> = (0..n).map(|_| rng.random_range(0..n)).collect();
    let resampled = data.select(ndarray::Axis(0), &rows);
    let standardized = standardize_columns(&resampled);
    ward_merges(&standardized)
        .into_iter()
        .map(|merge| merge.members)
        .collect()
}

/// Ward minimum-variance agglomeration via Lance-Williams updates over
/// squared Euclidean feature-feature distances. Heights are reported on the
/// distance scale (square root of the merge criterion).
fn ward_merges(data: &Array2<f64>) -> Vec<Merge> {
    let p = data.ncols();
    let mut distance2 = vec![vec![0.0f64; p]; p];
    for i in 0..p {
        for j in (i + 1)..p {
            let mut sum = 0.0;
            for r in 0..data.nrows() {
                let diff = data[[r, i]] - data[[r, j]];
                sum += diff * diff;
            }
            distance2[i][j] = sum;
            distance2[j][i] = sum;
        }
    }

    // Slot i holds the cluster that absorbed everything merged into it.
    let mut alive = vec![true; p];
    let mut sizes = vec![1usize; p];
    let mut node_ids: Vec<usize> = (0..p).collect();
    let mut members: Vec<Vec<usize>> = (0..p).map(|i| vec![i]).collect();

    let mut merges = Vec::with_capacity(p.saturating_sub(1));
    for step in 0..p - 1 {
        let mut best = (0usize, 0usize);
        let mut best_value = f64::INFINITY;
        for i in 0..p {
            if !alive[i] {
                continue;
            }
            for j in (i + 1)..p {
                if alive[j] && distance2[i][j] < best_value {
                    best_value = distance2[i][j];
                    best = (i, j);
                }
            }
        }
        let (i, j) = best;

        let merged_id = p + step;
        let mut merged_members = members[i].clone();
        merged_members.extend(members[j].iter().copied());
        merged_members.sort_unstable();

        let size_i = sizes[i] as f64;
        let size_j = sizes[j] as f64;
        for k in 0..p {
            if !alive[k] || k == i || k == j {
                continue;
            }
            let size_k = sizes[k] as f64;
            let updated = ((size_i + size_k) * distance2[i][k]
                + (size_j + size_k) * distance2[j][k]
                - size_k * best_value)
                / (size_i + size_j + size_k);
            distance2[i][k] = updated;
            distance2[k][i] = updated;
        }

        merges.push(Merge {
            id: merged_id,
            left: node_ids[i],
            right: node_ids[j],
            height: best_value.max(0.0).sqrt(),
            members: merged_members.clone(),
            support: 0.0,
        });

        alive[j] = false;
        sizes[i] += sizes[j];
        node_ids[i] = merged_id;
        members[i] = merged_members;
    }
    merges
}

/// Depth-first leaf order of the final tree, left branch first.
fn traversal_order(p: usize, merges: &[Merge]) -> Vec<usize> {
    let Some(root) = merges.last() else {
        return (0..p).collect();
    };
    let mut order = Vec::with_capacity(p);
    let mut stack = vec![root.id];
    while let Some(node) = stack.pop() {
        if node < p {
            order.push(node);
        } else {
            let merge = &merges[node - p];
            // Right is pushed first so the left branch is emitted first.
            stack.push(merge.right);
            stack.push(merge.left);
        }
    }
    order
}
