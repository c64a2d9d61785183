//! Document store abstraction
//!
//! A store executes one aggregation request against a set of indices and
//! returns the engine's nested response. [`memory::MemoryStore`] evaluates
//! requests locally; network-backed engines implement the same trait.

pub mod eval;
pub mod memory;

use async_trait::async_trait;

use crate::query::types::AggregationRequest;
use crate::response::AggregationResponse;
use crate::Result;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Run `request` over the union of `indices`.
    async fn execute(
        &self,
        request: &AggregationRequest,
        indices: &[String],
    ) -> Result<AggregationResponse>;
}
