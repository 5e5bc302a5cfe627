// main.rs

// --- External Crate Imports ---
use anyhow::{anyhow, Context, Error, Result};
use clap::Parser;
use log::{info, warn};
use std::{path::PathBuf, time::Instant};

use hrv_structure::adjust::adjust_for_confound;
use hrv_structure::cluster::{build_cluster_tree, ClusterOptions};
use hrv_structure::factors::{extract_factors, FactorOptions};
use hrv_structure::network::{build_network, NetworkOptions};
use hrv_structure::output;
use hrv_structure::prune::{prune, PruneConfig, PruneThresholds};
use hrv_structure::table::load_feature_table;

// --- Main Function ---
fn main() -> Result<(), Error> {
    let total_time_start = Instant::now();
    let cli_args = cli::CliArgs::parse();

    // Initialize logger
    let log_level = cli_args
        .log_level
        .parse::<log::LevelFilter>()
        .unwrap_or_else(|_| {
            eprintln!(
                "Warning: Invalid log level '{}' provided. Defaulting to Info.",
                cli_args.log_level
            );
            log::LevelFilter::Info
        });
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_micros()
        .init();

    info!("Starting hrv_structure with args: {:?}", cli_args);

    // Configure Rayon thread pool (used by the bootstrap stage)
    let num_threads = cli_args.threads.unwrap_or_else(num_cpus::get);
    info!("Using {} threads for parallel operations.", num_threads);
    rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .build_global()?;

    // --- 1. Load Feature Table ---
    info!("Loading feature table from {}", cli_args.input.display());
    let delimiter = match cli_args.delimiter.as_deref() {
        None | Some("auto") => None,
        Some("tab") => Some(b'\t'),
        Some("comma") => Some(b','),
        Some(other) => {
            return Err(anyhow!(
                "Unsupported delimiter '{}'; expected 'auto', 'tab' or 'comma'.",
                other
            ))
        }
    };
    let table = load_feature_table(&cli_args.input, &cli_args.confound, delimiter)
        .with_context(|| format!("failed to load {}", cli_args.input.display()))?;
    info!(
        "Loaded {} observations x {} numeric columns.",
        table.n_observations(),
        table.n_features()
    );

    // --- 2. Redundancy Pruning ---
    let prune_config = match &cli_args.prune_map {
        Some(path) => {
            info!("Loading pruning map from {}", path.display());
            PruneConfig::from_json_path(path)
                .with_context(|| format!("failed to load pruning map {}", path.display()))?
        }
        None => {
            info!("Using the built-in HRV pruning map.");
            PruneConfig::default_hrv()
        }
    };
    // A user-supplied map must name real columns; the built-in map is only
    // a vocabulary and may partially match any given table.
    if cli_args.prune_map.is_some() {
        prune_config.validate_against(&table)?;
    }
    let (pruned_table, prune_report) =
        prune(&table, &prune_config, &PruneThresholds::default())?;
    info!(
        "Pruning removed {} feature(s); {} remain.",
        prune_report.removals.len(),
        pruned_table.n_features()
    );

    // --- 3. Confound Adjustment ---
    let (adjusted_table, adjust_report) =
        adjust_for_confound(&pruned_table, &cli_args.confound)?;
    if !adjust_report.dropped.is_empty() {
        warn!(
            "Confound adjustment dropped {} feature(s): {:?}",
            adjust_report.dropped.len(),
            adjust_report.dropped
        );
    }

    // --- 4. Partial-Correlation Network ---
    let network_options = NetworkOptions {
        edge_threshold: cli_args.network_threshold,
    };
    let network = build_network(&adjusted_table, &network_options)?;
    info!(
        "Network has {} edge(s), {} communit{}, modularity {:.3}.",
        network.edges.len(),
        network.n_communities,
        if network.n_communities == 1 { "y" } else { "ies" },
        network.modularity
    );

    // --- 5. Factor Model ---
    let factor_options = FactorOptions {
        k_override: cli_args.factors,
        max_factors: cli_args.max_factors,
        loading_display_threshold: cli_args.loading_threshold,
        parallel_analysis_draws: cli_args.parallel_analysis_draws,
        seed: cli_args.seed,
    };
    let (selection, model) = extract_factors(&adjusted_table, &factor_options)?;
    info!(
        "Fitted {}-factor model (chi^2 = {:.2}, dof = {}, BIC = {:.2}).",
        model.k, model.stats.chi_square, model.stats.dof, model.stats.bic
    );

    // --- 6. Bootstrapped Cluster Tree ---
    let cluster_options = ClusterOptions {
        replicates: cli_args.replicates,
        seed: cli_args.seed,
        show_progress: true,
    };
    let tree = build_cluster_tree(&adjusted_table, &cluster_options)?;

    // --- 7. Write Outputs ---
    let output_prefix_path = PathBuf::from(&cli_args.output_prefix);
    if let Some(parent) = output_prefix_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|e| {
                anyhow!("Failed to create output directory {}: {}", parent.display(), e)
            })?;
            info!("Created output directory: {}", parent.display());
        }
    }
    info!(
        "Writing artifacts with prefix '{}'...",
        cli_args.output_prefix
    );
    output::write_feature_table(&cli_args.output_prefix, &adjusted_table)?;
    output::write_prune_report(&cli_args.output_prefix, &prune_report)?;
    output::write_network_edges(&cli_args.output_prefix, &network)?;
    output::write_network_nodes(&cli_args.output_prefix, &network)?;
    output::write_factor_selection(&cli_args.output_prefix, &selection)?;
    output::write_factor_loadings(
        &cli_args.output_prefix,
        &model,
        cli_args.loading_threshold,
    )?;
    output::write_cluster_tree(&cli_args.output_prefix, &tree)?;

    info!(
        "hrv_structure finished successfully in {:.2?}.",
        total_time_start.elapsed()
    );
    Ok(())
}

// --- CLI Module ---

mod cli {
    use clap::Parser;
    use std::path::PathBuf;

    #[derive(Parser, Debug)]
    #[command(author, version, about = "HRV index structure discovery over a feature table.", long_about = None, propagate_version = true)]
    pub(crate) struct CliArgs {
        /// Feature table (TSV/CSV) with Participant, Database and confound columns.
        #[arg(short = 'i', long = "input", required = true)]
        pub(crate) input: PathBuf,

        #[arg(short = 'o', long = "out", required = true)]
        pub(crate) output_prefix: String,

        /// JSON file with the curated equivalence families; built-in HRV map if absent.
        #[arg(long = "prune-map")]
        pub(crate) prune_map: Option<PathBuf>,

        /// Name of the recording-length confound column.
        #[arg(long, default_value = "Recording_Length")]
        pub(crate) confound: String,

        /// Input delimiter: auto (by extension), tab, or comma.
        #[arg(long)]
        pub(crate) delimiter: Option<String>,

        /// Minimum |partial r| for a network edge.
        #[arg(long = "network-threshold", default_value_t = 0.2)]
        pub(crate) network_threshold: f64,

        /// Factor count; overrides the criterion consensus.
        #[arg(short = 'k', long)]
        pub(crate) factors: Option<usize>,

        /// Upper bound for the BIC factor scan.
        #[arg(long = "max-factors")]
        pub(crate) max_factors: Option<usize>,

        /// Loadings below this are blanked in the loadings artifact.
        #[arg(long = "loading-threshold", default_value_t = 0.4)]
        pub(crate) loading_threshold: f64,

        /// Surrogate datasets for Horn's parallel analysis.
        #[arg(long = "pa-draws", default_value_t = 200)]
        pub(crate) parallel_analysis_draws: usize,

        /// Bootstrap replicates for cluster branch support.
        #[arg(short = 'b', long, default_value_t = 1000)]
        pub(crate) replicates: usize,

        /// Seed for parallel analysis and bootstrap resampling.
        #[arg(long, default_value_t = 17)]
        pub(crate) seed: u64,

        #[arg(short = 't', long)]
        pub(crate) threads: Option<usize>,

        #[arg(long, default_value = "Info")]
        pub(crate) log_level: String,
    }
}
