//! End-to-end pipeline scenarios over synthetic on-disk tables.

use hrv_structure::adjust::adjust_for_confound;
use hrv_structure::cluster::{build_cluster_tree, ClusterOptions};
use hrv_structure::factors::{extract_factors, FactorOptions};
use hrv_structure::network::{build_network, NetworkOptions};
use hrv_structure::output;
use hrv_structure::prune::{prune, EquivalenceFamily, PruneConfig, PruneThresholds};
use hrv_structure::table::load_feature_table;
use std::io::Write;
use tempfile::NamedTempFile;

/// 100 observations x 30 columns (Participant, Database, Recording_Length,
/// 27 features): three latent blocks, one exact duplicate pair, and one
/// feature that is a pure linear function of recording length.
fn write_synthetic_table() -> NamedTempFile {
    let n = 100;
    let mut header = vec![
        "Participant".to_string(),
        "Database".to_string(),
        "Recording_Length".to_string(),
    ];
    for c in 0..24 {
        header.push(format!("hrv_{c:02}"));
    }
    header.push("dup_base".to_string());
    header.push("dup_copy".to_string());
    header.push("len_tracker".to_string());

    let mut file = NamedTempFile::new().expect("create temp file");
    writeln!(file, "{}", header.join(",")).expect("write header");

    for i in 0..n {
        let t = i as f64;
        let latents = [
            (0.23 * t).sin(),
            (0.41 * t).cos(),
            (0.61 * t + 1.0).sin(),
        ];
        let length = 4.0 + 0.05 * t + 0.3 * (0.9 * t).sin();

        let mut row = vec![
            format!("p{i:03}"),
            if i % 2 == 0 { "fantasia" } else { "mit_bih" }.to_string(),
            format!("{length:.9}"),
        ];
        for c in 0..24 {
            let value =
                latents[c % 3] + 0.5 * ((1.1 + 0.07 * c as f64) * t + c as f64).sin();
            row.push(format!("{value:.6}"));
        }
        let dup = latents[0] + 0.3 * (2.9 * t).sin();
        row.push(format!("{dup:.6}"));
        row.push(format!("{dup:.6}"));
        row.push(format!("{:.9}", 2.5 * length - 1.0));
        writeln!(file, "{}", row.join(",")).expect("write row");
    }
    file
}

fn duplicate_map() -> PruneConfig {
    PruneConfig {
        near_duplicates: vec![EquivalenceFamily {
            family: "duplicates".to_string(),
            representative: "dup_base".to_string(),
            aliases: vec!["dup_copy".to_string()],
        }],
        strong_correlations: vec![],
    }
}

#[test]
fn test_duplicate_pair_loses_exactly_one_member() {
    let file = write_synthetic_table();
    let table =
        load_feature_table(file.path(), "Recording_Length", None).expect("load table");
    assert_eq!(table.n_observations(), 100);
    assert_eq!(table.n_features(), 28);

    let config = duplicate_map();
    config.validate_against(&table).expect("map matches table");
    let (pruned, report) =
        prune(&table, &config, &PruneThresholds::default()).expect("prune");

    assert_eq!(report.removals.len(), 1);
    assert_eq!(report.removals[0].feature, "dup_copy");
    assert!(pruned.names.contains(&"dup_base".to_string()));
    assert!(!pruned.names.contains(&"dup_copy".to_string()));
    assert_eq!(pruned.n_features(), 27);
}

#[test]
fn test_confound_saturated_feature_is_dropped() {
    let file = write_synthetic_table();
    let table =
        load_feature_table(file.path(), "Recording_Length", None).expect("load table");
    let (pruned, _) =
        prune(&table, &duplicate_map(), &PruneThresholds::default()).expect("prune");
    let (adjusted, report) =
        adjust_for_confound(&pruned, "Recording_Length").expect("adjust");

    assert!(report.dropped.contains(&"len_tracker".to_string()));
    assert!(!adjusted.names.contains(&"len_tracker".to_string()));
    assert!(!adjusted.names.contains(&"Recording_Length".to_string()));
    assert_eq!(adjusted.n_features(), 25);
}

#[test]
fn test_full_pipeline_writes_all_artifacts() {
    let file = write_synthetic_table();
    let table =
        load_feature_table(file.path(), "Recording_Length", None).expect("load table");
    let (pruned, prune_report) =
        prune(&table, &duplicate_map(), &PruneThresholds::default()).expect("prune");
    let (adjusted, _) = adjust_for_confound(&pruned, "Recording_Length").expect("adjust");

    let network = build_network(&adjusted, &NetworkOptions::default()).expect("network");
    for edge in &network.edges {
        assert!(edge.partial_r.abs() > 0.2);
    }

    let factor_options = FactorOptions {
        parallel_analysis_draws: 50,
        ..FactorOptions::default()
    };
    let (selection, model) = extract_factors(&adjusted, &factor_options).expect("factors");
    assert!(selection.proposals.len() >= 3);
    assert_eq!(model.loadings.nrows(), adjusted.n_features());
    assert_eq!(model.loadings.ncols(), model.k);

    let cluster_options = ClusterOptions {
        replicates: 50,
        seed: 7,
        show_progress: false,
    };
    let tree = build_cluster_tree(&adjusted, &cluster_options).expect("cluster");
    for merge in &tree.merges {
        assert!((0.0..=1.0).contains(&merge.support));
    }

    let dir = tempfile::tempdir().expect("tempdir");
    let prefix = dir.path().join("run").to_string_lossy().to_string();
    output::write_feature_table(&prefix, &adjusted).expect("features");
    output::write_prune_report(&prefix, &prune_report).expect("pruned");
    output::write_network_edges(&prefix, &network).expect("edges");
    output::write_network_nodes(&prefix, &network).expect("nodes");
    output::write_factor_selection(&prefix, &selection).expect("nfactors");
    output::write_factor_loadings(&prefix, &model, 0.4).expect("loadings");
    output::write_cluster_tree(&prefix, &tree).expect("dendrogram");

    for suffix in [
        "features.tsv",
        "pruned.tsv",
        "network.tsv",
        "centrality.tsv",
        "nfactors.tsv",
        "loadings.tsv",
        "dendrogram.tsv",
    ] {
        let path = format!("{prefix}.{suffix}");
        let content = std::fs::read_to_string(&path).expect("artifact readable");
        assert!(!content.is_empty(), "{path} is empty");
    }

    let features = std::fs::read_to_string(format!("{prefix}.features.tsv")).expect("read");
    let header = features.lines().next().expect("header");
    assert!(header.starts_with("Participant\tDatabase\t"));
    // Header carries exactly the adjusted feature set.
    assert_eq!(header.split('\t').count(), 2 + adjusted.n_features());
}

#[test]
fn test_prune_map_round_trips_through_json() {
    let map_json = r#"{
        "near_duplicates": [
            {
                "family": "duplicates",
                "representative": "dup_base",
                "aliases": ["dup_copy"]
            }
        ],
        "strong_correlations": []
    }"#;
    let mut map_file = NamedTempFile::new().expect("create map file");
    map_file.write_all(map_json.as_bytes()).expect("write map");
    let config = PruneConfig::from_json_path(map_file.path()).expect("parse map");
    assert_eq!(config.near_duplicates.len(), 1);
    assert_eq!(config.near_duplicates[0].representative, "dup_base");

    let file = write_synthetic_table();
    let table =
        load_feature_table(file.path(), "Recording_Length", None).expect("load table");
    let (pruned, _) = prune(&table, &config, &PruneThresholds::default()).expect("prune");
    assert_eq!(pruned.n_features(), 27);
}

#[test]
fn test_pruner_idempotent_across_full_reduction() {
    let file = write_synthetic_table();
    let table =
        load_feature_table(file.path(), "Recording_Length", None).expect("load table");
    let config = duplicate_map();
    let thresholds = PruneThresholds::default();
    let (once, _) = prune(&table, &config, &thresholds).expect("first prune");
    let (twice, second_report) = prune(&once, &config, &thresholds).expect("second prune");
    assert_eq!(once.names, twice.names);
    assert!(second_report.removals.is_empty());
}
