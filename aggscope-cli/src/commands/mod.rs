pub mod aggregate;
pub mod entities;

pub use aggregate::{
    run_cardinality, run_date_histogram, run_filters, run_histogram, run_metric, run_percentiles,
    run_ranks, run_raw, run_stats,
};
pub use entities::list_entities;
