//! Live ingestion: new headers in, enriched block rows out.

pub mod enrichment;
pub mod pipeline;

pub use enrichment::{build_summary, enrich_block, EnrichmentContext};
pub use pipeline::{run_consumer, run_live, status_router, EnrichmentStats, PipelineStatus};
