//! Query filters, aggregation request trees and the translator that builds them

pub mod translator;
pub mod types;

pub use translator::{AggregationSpec, Grouping, MetricKind, NamedFilter, QueryTranslator};
pub use types::*;
