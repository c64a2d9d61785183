//! Aggregation facade over a document store
//!
//! This crate lets callers ask for statistical aggregations with nothing more
//! than field names, a metric operator, an optional filter and an entity
//! type. It builds the nested aggregation request tree, sends it to a
//! [`DocumentStore`], and flattens the nested response into plain Rust types.
//!
//! # Families
//!
//! - single metric (`sum`, `count`, `avg`, `min`, `max`)
//! - metric grouped by one field, or drilled down over two fields
//! - `stats`, globally or grouped
//! - `cardinality`
//! - `percentiles` / `percentile_ranks`
//! - named filter buckets
//! - numeric and date histograms
//!
//! # Example
//!
//! ```no_run
//! use aggscope::{AggregationService, IndexMetadata, IndexRegistry, MemoryStore,
//!     MetricOperator, StaticMetadata, Target};
//! use std::sync::Arc;
//!
//! # async fn demo() -> aggscope::Result<()> {
//! let source = StaticMetadata::new().with_entity("policy", IndexMetadata::new("policy"));
//! let registry = Arc::new(IndexRegistry::new(Arc::new(source)));
//! let service = AggregationService::new(Arc::new(MemoryStore::new()), registry);
//!
//! let total = service
//!     .metric("premium", MetricOperator::Sum, None, &Target::entity("policy"))
//!     .await?;
//! # let _ = total;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod operator;
pub mod query;
pub mod record;
pub mod registry;
pub mod response;
pub mod service;
pub mod store;
pub mod unflatten;

pub use config::Config;
pub use error::AggError;
pub use operator::MetricOperator;
pub use query::translator::{
    AggregationSettings, AggregationSpec, Grouping, MetricKind, NamedFilter, QueryTranslator,
};
pub use query::types::{AggregationKind, AggregationNode, AggregationRequest, DateInterval, Query};
pub use record::{DrillDownRecord, PercentileResult, StatsRecord};
pub use registry::{IndexMetadata, IndexPurpose, IndexRegistry, MetadataSource, StaticMetadata};
pub use response::{AggregationOutput, AggregationResponse, BucketEntries, ResponseBucket};
pub use service::{AggregationService, Target};
pub use store::{memory::MemoryStore, DocumentStore};
pub use unflatten::{Flattened, Unflattener};

/// Result type for aggregation operations
pub type Result<T> = std::result::Result<T, AggError>;
