//! TSV artifact writers.
//!
//! Every artifact lands at `<prefix>.<suffix>` with a header row and
//! tab-separated, fixed-precision values, for downstream plotting and
//! reporting tools.

use crate::cluster::ClusterTree;
use crate::error::Result;
use crate::factors::{FactorModel, FactorSelection};
use crate::network::PartialCorrelationGraph;
use crate::prune::PruneReport;
use crate::table::FeatureTable;
use log::info;
use std::fs::File;
use std::io::{BufWriter, Write};

fn create_output_file(prefix: &str, suffix: &str) -> Result<BufWriter<File>> {
    let filename = format!("{prefix}.{suffix}");
    Ok(BufWriter::new(File::create(&filename)?))
}

/// Reduced, adjusted feature table with its metadata columns.
pub fn write_feature_table(prefix: &str, table: &FeatureTable) -> Result<()> {
    let mut writer = create_output_file(prefix, "features.tsv")?;
    info!("Writing reduced feature table to {prefix}.features.tsv");

    write!(writer, "Participant\tDatabase")?;
    for name in &table.names {
        write!(writer, "\t{name}")?;
    }
    writeln!(writer)?;

    for row in 0..table.n_observations() {
        write!(writer, "{}\t{}", table.participants[row], table.databases[row])?;
        for col in 0..table.n_features() {
            write!(writer, "\t{:.6}", table.data[[row, col]])?;
        }
        writeln!(writer)?;
    }
    Ok(())
}

/// Ledger of pruning decisions plus the exploratory pair view.
pub fn write_prune_report(prefix: &str, report: &PruneReport) -> Result<()> {
    let mut writer = create_output_file(prefix, "pruned.tsv")?;
    info!("Writing pruning ledger to {prefix}.pruned.tsv");

    writeln!(writer, "Feature\tPass\tFamily\tRepresentative\tAbsR")?;
    for removal in &report.removals {
        writeln!(
            writer,
            "{}\t{}\t{}\t{}\t{:.4}",
            removal.feature,
            removal.pass.label(),
            removal.family,
            removal.representative,
            removal.abs_r
        )?;
    }
    writeln!(writer)?;
    writeln!(writer, "ViewFeatureA\tViewFeatureB\tR")?;
    for (a, b, r) in &report.view_pairs {
        writeln!(writer, "{a}\t{b}\t{r:.4}")?;
    }
    Ok(())
}

/// Edge list of the thresholded partial-correlation graph.
pub fn write_network_edges(prefix: &str, network: &PartialCorrelationGraph) -> Result<()> {
    let mut writer = create_output_file(prefix, "network.tsv")?;
    info!(
        "Writing {} network edge(s) to {prefix}.network.tsv",
        network.edges.len()
    );

    writeln!(writer, "FeatureA\tFeatureB\tPartialR")?;
    for edge in &network.edges {
        writeln!(writer, "{}\t{}\t{:.6}", edge.a, edge.b, edge.partial_r)?;
    }
    Ok(())
}

/// Per-node centrality and community annotations.
pub fn write_network_nodes(prefix: &str, network: &PartialCorrelationGraph) -> Result<()> {
    let mut writer = create_output_file(prefix, "centrality.tsv")?;
    info!("Writing node annotations to {prefix}.centrality.tsv");

    writeln!(writer, "Feature\tCommunity\tDegree\tCloseness\tBetweenness")?;
    for node in &network.nodes {
        writeln!(
            writer,
            "{}\t{}\t{:.6}\t{:.6}\t{:.6}",
            node.name, node.community, node.degree, node.closeness, node.betweenness
        )?;
    }
    Ok(())
}

/// Per-criterion factor-count breakdown with the consensus and chosen rows.
pub fn write_factor_selection(prefix: &str, selection: &FactorSelection) -> Result<()> {
    let mut writer = create_output_file(prefix, "nfactors.tsv")?;
    info!("Writing factor-count breakdown to {prefix}.nfactors.tsv");

    writeln!(writer, "Criterion\tFactors")?;
    for proposal in &selection.proposals {
        writeln!(writer, "{}\t{}", proposal.criterion, proposal.k)?;
    }
    writeln!(writer, "consensus\t{}", selection.consensus)?;
    writeln!(writer, "chosen\t{}", selection.chosen)?;
    Ok(())
}

/// Rotated loading matrix; loadings below the display threshold are
/// blanked, the model itself stays complete.
pub fn write_factor_loadings(
    prefix: &str,
    model: &FactorModel,
    display_threshold: f64,
) -> Result<()> {
    let mut writer = create_output_file(prefix, "loadings.tsv")?;
    info!(
        "Writing {}-factor loadings to {prefix}.loadings.tsv",
        model.k
    );

    write!(writer, "Feature")?;
    for factor in 1..=model.k {
        write!(writer, "\tF{factor}")?;
    }
    writeln!(writer, "\tPrimary\tUniqueness")?;

    for (i, name) in model.names.iter().enumerate() {
        write!(writer, "{name}")?;
        for j in 0..model.k {
            let loading = model.loadings[(i, j)];
            if loading.abs() >= display_threshold {
                write!(writer, "\t{loading:.4}")?;
            } else {
                write!(writer, "\t")?;
            }
        }
        writeln!(
            writer,
            "\tF{}\t{:.4}",
            model.primary[i] + 1,
            model.uniquenesses[i]
        )?;
    }
    Ok(())
}

/// Merge list of the dendrogram with support values, then the leaf order.
/// Leaves are their feature names; internal nodes are `node<N>`.
pub fn write_cluster_tree(prefix: &str, tree: &ClusterTree) -> Result<()> {
    let mut writer = create_output_file(prefix, "dendrogram.tsv")?;
    info!("Writing cluster tree to {prefix}.dendrogram.tsv");

    let p = tree.names.len();
    let label = |node: usize| {
        if node < p {
            tree.names[node].clone()
        } else {
            format!("node{node}")
        }
    };

    writeln!(writer, "Node\tLeft\tRight\tHeight\tSupport\tMembers")?;
    for merge in &tree.merges {
        let members: Vec<&str> = merge
            .members
            .iter()
            .map(|&leaf| tree.names[leaf].as_str())
            .collect();
        writeln!(
            writer,
            "node{}\t{}\t{}\t{:.6}\t{:.3}\t{}",
            merge.id,
            label(merge.left),
            label(merge.right),
            merge.height,
            merge.support,
            members.join(",")
        )?;
    }
    writeln!(writer)?;
    let ordered: Vec<&str> = tree
        .leaf_order
        .iter()
        .map(|&leaf| tree.names[leaf].as_str())
        .collect();
    writeln!(writer, "LeafOrder\t{}", ordered.join(","))?;
    Ok(())
}
