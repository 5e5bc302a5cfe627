//! Structure discovery over HRV index tables.
//!
//! Heart-rate-variability research produces dozens of indices per recording,
//! many of which restate one another. Starting from a flat table of
//! per-recording indices, this crate reduces the feature space and describes
//! what remains:
//!
//! - [`prune`]: curated-map redundancy pruning at two correlation thresholds
//! - [`adjust`]: regressing recording length out of every index
//! - [`network`]: a thresholded partial-correlation graph with centrality
//!   and community annotations
//! - [`factors`]: factor-count criteria and a varimax-rotated
//!   maximum-likelihood factor model
//! - [`cluster`]: Ward clustering of features with bootstrap branch support
//!
//! Each stage consumes a [`table::FeatureTable`] and produces a reduced one
//! plus a side artifact; [`output`] writes every artifact as TSV.

pub mod adjust;
pub mod cluster;
pub mod error;
pub mod factors;
pub mod network;
pub mod output;
pub mod prune;
pub mod stats;
pub mod table;

pub use error::{Result, StructureError};
pub use table::FeatureTable;
