//! Partial-correlation network construction.
//!
//! The correlation matrix of the adjusted table is inverted to a precision
//! matrix, rescaled to partial correlations, and thresholded into a weighted
//! undirected graph. Nodes carry normalized strength, closeness, and
//! betweenness; communities come from edge-betweenness removal with the
//! partition of maximal modularity kept for labeling.

use crate::error::{Result, StructureError};
use crate::stats::{correlation_matrix, to_dmatrix};
use crate::table::FeatureTable;
use log::{debug, info};
use ndarray::Array2;
use petgraph::algo::connected_components;
use petgraph::graph::{NodeIndex, UnGraph};

/// Eigenvalue floor below which the correlation matrix is treated as
/// singular. Collinear survivors of the pruning stage land many orders of
/// magnitude below this; legitimately ill-conditioned matrices stay above.
const SINGULARITY_TOLERANCE: f64 = 1e-10;

/// Tie tolerance for shortest-path length comparisons.
const PATH_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy)]
pub struct NetworkOptions {
    /// Edges with |partial r| at or below this never enter the graph.
    pub edge_threshold: f64,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        NetworkOptions { edge_threshold: 0.2 }
    }
}

impl NetworkOptions {
    /// # Errors
    /// [`StructureError::Config`] if the threshold is outside [0, 1).
    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.edge_threshold) {
            return Err(StructureError::Config(format!(
                "network edge threshold {} outside [0, 1)",
                self.edge_threshold
            )));
        }
        Ok(())
    }
}

/// Per-node annotations, in table column order.
#[derive(Debug, Clone)]
pub struct NodeMetrics {
    pub name: String,
    pub community: usize,
    pub degree: f64,
    pub closeness: f64,
    pub betweenness: f64,
}

#[derive(Debug, Clone)]
pub struct NetworkEdge {
    pub a: String,
    pub b: String,
    pub partial_r: f64,
}

/// The thresholded conditional-dependence graph with its annotations.
#[derive(Debug)]
pub struct PartialCorrelationGraph {
    pub graph: UnGraph<String, f64>,
    pub nodes: Vec<NodeMetrics>,
    pub edges: Vec<NetworkEdge>,
    pub n_communities: usize,
    pub modularity: f64,
}

/// Convert a correlation matrix into partial correlations by inverting it.
///
/// Each entry is the correlation of two features conditional on all others;
/// the result is symmetric with unit diagonal.
///
/// # Errors
/// [`StructureError::DegenerateData`] if the matrix is singular (perfectly
/// collinear features survived pruning); the stage reports this rather than
/// guessing around bad data.
pub fn partial_correlations(corr: &Array2<f64>) -> Result<Array2<f64>> {
    let p = corr.nrows();
    let m = to_dmatrix(corr);

    let min_eigenvalue = m
        .clone()
        .symmetric_eigen()
        .eigenvalues
        .iter()
        .cloned()
        .fold(f64::INFINITY, f64::min);
    if min_eigenvalue < SINGULARITY_TOLERANCE {
        return Err(StructureError::DegenerateData(format!(
            "correlation matrix is singular (smallest eigenvalue {min_eigenvalue:.3e}); \
             perfectly collinear features remain"
        )));
    }
    let precision = m.try_inverse().ok_or_else(|| {
        StructureError::DegenerateData("correlation matrix could not be inverted".to_string())
    })?;

    let mut partial = Array2::<f64>::zeros((p, p));
    for i in 0..p {
        partial[[i, i]] = 1.0;
        for j in (i + 1)..p {
            let value = -precision[(i, j)] / (precision[(i, i)] * precision[(j, j)]).sqrt();
            partial[[i, j]] = value;
            partial[[j, i]] = value;
        }
    }
    Ok(partial)
}

/// Build the annotated network over the adjusted feature table.
///
/// # Errors
/// Propagates correlation and inversion failures; rejects invalid options.
pub fn build_network(
    table: &FeatureTable,
    options: &NetworkOptions,
) -> Result<PartialCorrelationGraph> {
    options.validate()?;
    let p = table.n_features();
    if p < 2 {
        return Err(StructureError::DegenerateData(format!(
            "network construction needs at least 2 features, got {p}"
        )));
    }

    let corr = correlation_matrix(&table.data)?;
    let partial = partial_correlations(&corr)?;

    // Edges strictly above the threshold; weaker pairs are absent, not
    // zero-weight.
    let mut edge_list: Vec<(usize, usize, f64)> = Vec::new();
    for i in 0..p {
        for j in (i + 1)..p {
            let value = partial[[i, j]];
            if value.abs() > options.edge_threshold {
                edge_list.push((i, j, value));
            } else {
                debug!(
                    "Edge {} ~ {} below threshold (|partial r| = {:.3}), absent.",
                    table.names[i],
                    table.names[j],
                    value.abs()
                );
            }
        }
    }

    let mut graph = UnGraph::<String, f64>::with_capacity(p, edge_list.len());
    let node_indices: Vec<NodeIndex> = table
        .names
        .iter()
        .map(|name| graph.add_node(name.clone()))
        .collect();
    for &(i, j, w) in &edge_list {
        graph.add_edge(node_indices[i], node_indices[j], w);
    }
    info!(
        "Network: {} nodes, {} edges, {} connected component(s).",
        p,
        edge_list.len(),
        connected_components(&graph)
    );

    let (node_betweenness, _) = brandes_betweenness(p, &edge_list, &alive_all(&edge_list));
    let strengths = node_strengths(p, &edge_list);
    let closeness = closeness_centrality(p, &edge_list);
    let (communities, n_communities, modularity) = detect_communities(p, &edge_list);

    let pair_norm = if p > 2 {
        ((p - 1) * (p - 2)) as f64 / 2.0
    } else {
        1.0
    };
    let nodes = (0..p)
        .map(|i| NodeMetrics {
            name: table.names[i].clone(),
            community: communities[i],
            degree: strengths[i] / (p - 1) as f64,
            closeness: closeness[i],
            betweenness: node_betweenness[i] / pair_norm,
        })
        .collect();

    let edges = edge_list
        .iter()
        .map(|&(i, j, w)| NetworkEdge {
            a: table.names[i].clone(),
            b: table.names[j].clone(),
            partial_r: w,
        })
        .collect();

    Ok(PartialCorrelationGraph {
        graph,
        nodes,
        edges,
        n_communities,
        modularity,
    })
}

fn alive_all(edge_list: &[(usize, usize, f64)]) -> Vec<bool> {
    vec![true; edge_list.len()]
}

fn node_strengths(p: usize, edge_list: &[(usize, usize, f64)]) -> Vec<f64> {
    let mut strengths = vec![0.0; p];
    for &(i, j, w) in edge_list {
        strengths[i] += w.abs();
        strengths[j] += w.abs();
    }
    strengths
}

fn adjacency(
    p: usize,
    edge_list: &[(usize, usize, f64)],
    alive: &[bool],
) -> Vec<Vec<(usize, usize)>> {
    let mut neighbors: Vec<Vec<(usize, usize)>> = vec![Vec::new(); p];
    for (edge_id, &(i, j, _)) in edge_list.iter().enumerate() {
        if alive[edge_id] {
            neighbors[i].push((j, edge_id));
            neighbors[j].push((i, edge_id));
        }
    }
    neighbors
}

/// Single-source shortest paths over 1/|weight| lengths, with path counts
/// and predecessor lists for the Brandes accumulation. O(n^2) selection is
/// plenty at feature-table scale.
fn shortest_paths(
    p: usize,
    neighbors: &[Vec<(usize, usize)>],
    lengths: &[f64],
    source: usize,
) -> (Vec<f64>, Vec<f64>, Vec<Vec<(usize, usize)>>, Vec<usize>) {
    let mut dist = vec![f64::INFINITY; p];
    let mut sigma = vec![0.0; p];
    let mut preds: Vec<Vec<(usize, usize)>> = vec![Vec::new(); p];
    let mut visited = vec![false; p];
    let mut settled_order = Vec::with_capacity(p);

    dist[source] = 0.0;
    sigma[source] = 1.0;

    for _ in 0..p {
        let mut current = None;
        let mut best = f64::INFINITY;
        for v in 0..p {
            if !visited[v] && dist[v] < best {
                best = dist[v];
                current = Some(v);
            }
        }
        let Some(u) = current else { break };
        visited[u] = true;
        settled_order.push(u);

        for &(v, edge_id) in &neighbors[u] {
            let alt = dist[u] + lengths[edge_id];
            if alt < dist[v] - PATH_EPSILON {
                dist[v] = alt;
                sigma[v] = sigma[u];
                preds[v] = vec![(u, edge_id)];
            } else if (alt - dist[v]).abs() <= PATH_EPSILON {
                sigma[v] += sigma[u];
                preds[v].push((u, edge_id));
            }
        }
    }

    (dist, sigma, preds, settled_order)
}

/// Brandes betweenness for nodes and edges over the alive subgraph.
/// Unordered pairs are accumulated from both endpoints, so totals are
/// halved before returning.
fn brandes_betweenness(
    p: usize,
    edge_list: &[(usize, usize, f64)],
    alive: &[bool],
) -> (Vec<f64>, Vec<f64>) {
    let neighbors = adjacency(p, edge_list, alive);
    let lengths: Vec<f64> = edge_list.iter().map(|&(_, _, w)| 1.0 / w.abs()).collect();

    let mut node_scores = vec![0.0; p];
    let mut edge_scores = vec![0.0; edge_list.len()];

    for source in 0..p {
        let (_, sigma, preds, settled_order) = shortest_paths(p, &neighbors, &lengths, source);
        let mut delta = vec![0.0; p];
        for &w in settled_order.iter().rev() {
            for &(v, edge_id) in &preds[w] {
                let contribution = sigma[v] / sigma[w] * (1.0 + delta[w]);
                delta[v] += contribution;
                edge_scores[edge_id] += contribution;
            }
            if w != source {
                node_scores[w] += delta[w];
            }
        }
    }

    for score in node_scores.iter_mut() {
        *score /= 2.0;
    }
    for score in edge_scores.iter_mut() {
        *score /= 2.0;
    }
    (node_scores, edge_scores)
}

/// Wasserman-Faust closeness: within-component closeness scaled by the
/// component's share of the graph. Isolated nodes score zero.
fn closeness_centrality(p: usize, edge_list: &[(usize, usize, f64)]) -> Vec<f64> {
    let alive = alive_all(edge_list);
    let neighbors = adjacency(p, edge_list, &alive);
    let lengths: Vec<f64> = edge_list.iter().map(|&(_, _, w)| 1.0 / w.abs()).collect();

    (0..p)
        .map(|source| {
            let (dist, _, _, _) = shortest_paths(p, &neighbors, &lengths, source);
            let reachable: Vec<f64> = dist
                .iter()
                .enumerate()
                .filter(|&(v, d)| v != source && d.is_finite())
                .map(|(_, &d)| d)
                .collect();
            let r = reachable.len() as f64;
            let total: f64 = reachable.iter().sum();
            if total > 0.0 && p > 1 {
                (r / (p - 1) as f64) * (r / total)
            } else {
                0.0
            }
        })
        .collect()
}

fn component_labels(p: usize, edge_list: &[(usize, usize, f64)], alive: &[bool]) -> Vec<usize> {
    let neighbors = adjacency(p, edge_list, alive);
    let mut labels = vec![usize::MAX; p];
    let mut next = 0;
    for start in 0..p {
        if labels[start] != usize::MAX {
            continue;
        }
        let mut queue = vec![start];
        labels[start] = next;
        while let Some(u) = queue.pop() {
            for &(v, _) in &neighbors[u] {
                if labels[v] == usize::MAX {
                    labels[v] = next;
                    queue.push(v);
                }
            }
        }
        next += 1;
    }
    labels
}

/// Newman modularity of a partition over the full graph, edge weights taken
/// as |partial r|.
fn modularity(p: usize, edge_list: &[(usize, usize, f64)], labels: &[usize]) -> f64 {
    let total: f64 = edge_list.iter().map(|&(_, _, w)| w.abs()).sum();
    if total == 0.0 {
        return 0.0;
    }
    let strengths = node_strengths(p, edge_list);
    let two_m = 2.0 * total;

    let mut q = 0.0;
    for &(i, j, w) in edge_list {
        if labels[i] == labels[j] {
            q += w.abs() / total;
        }
    }
    for i in 0..p {
        for j in 0..p {
            if labels[i] == labels[j] {
                q -= strengths[i] * strengths[j] / (two_m * two_m);
            }
        }
    }
    q
}

/// Girvan-Newman: repeatedly remove the edge with the highest betweenness
/// and keep the component partition with maximal modularity. Deterministic
/// under fixed input order; betweenness ties resolve by first edge index.
fn detect_communities(p: usize, edge_list: &[(usize, usize, f64)]) -> (Vec<usize>, usize, f64) {
    let mut alive = alive_all(edge_list);

    let mut best_labels = component_labels(p, edge_list, &alive);
    let mut best_q = modularity(p, edge_list, &best_labels);

    while alive.iter().any(|&a| a) {
        let (_, edge_scores) = brandes_betweenness(p, edge_list, &alive);
        let mut target = None;
        let mut target_score = f64::NEG_INFINITY;
        for (edge_id, &score) in edge_scores.iter().enumerate() {
            if alive[edge_id] && score > target_score {
                target_score = score;
                target = Some(edge_id);
            }
        }
        let Some(edge_id) = target else { break };
        alive[edge_id] = false;

        let labels = component_labels(p, edge_list, &alive);
        let q = modularity(p, edge_list, &labels);
        if q > best_q + 1e-12 {
            best_q = q;
            best_labels = labels;
        }
    }

    let n_communities = best_labels.iter().max().map_or(0, |&m| m + 1);
    (best_labels, n_communities, best_q)
}
