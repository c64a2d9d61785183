//! Aggregation facade
//!
//! Each call resolves the target indices, builds an [`AggregationSpec`],
//! translates it, sends it to the [`DocumentStore`] in a single round trip and
//! flattens the response.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::operator::MetricOperator;
use crate::query::translator::{
    AggregationSettings, AggregationSpec, Grouping, MetricKind, NamedFilter, QueryTranslator,
};
use crate::query::types::{AggregationRequest, DateInterval, Query};
use crate::record::{DrillDownRecord, PercentileResult, StatsRecord};
use crate::registry::{IndexPurpose, IndexRegistry};
use crate::response::AggregationResponse;
use crate::store::DocumentStore;
use crate::unflatten::{Flattened, Unflattener};
use crate::Result;

/// Entity type a call runs for, with optional explicit indices overriding the
/// entity's configured ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub entity: String,
    pub indices: Vec<String>,
}

impl Target {
    pub fn entity(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            indices: Vec::new(),
        }
    }

    pub fn with_indices<I, S>(mut self, indices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.indices = indices.into_iter().map(Into::into).collect();
        self
    }
}

pub struct AggregationService {
    store: Arc<dyn DocumentStore>,
    registry: Arc<IndexRegistry>,
    translator: QueryTranslator,
}

impl AggregationService {
    pub fn new(store: Arc<dyn DocumentStore>, registry: Arc<IndexRegistry>) -> Self {
        Self::with_settings(store, registry, AggregationSettings::default())
    }

    pub fn with_settings(
        store: Arc<dyn DocumentStore>,
        registry: Arc<IndexRegistry>,
        settings: AggregationSettings,
    ) -> Self {
        Self {
            store,
            registry,
            translator: QueryTranslator::new(settings),
        }
    }

    /// One metric over all matched documents.
    pub async fn metric(
        &self,
        metric_field: &str,
        op: MetricOperator,
        filter: Option<&Query>,
        target: &Target,
    ) -> Result<f64> {
        let spec = spec(metric_field, MetricKind::Operator(op), filter, target);
        let response = self.execute(&spec, target, op.as_str()).await?;
        Unflattener::scalar(&response)
    }

    /// One metric per distinct value of `bucket_field`.
    pub async fn metric_by_bucket(
        &self,
        bucket_field: &str,
        metric_field: &str,
        op: MetricOperator,
        filter: Option<&Query>,
        target: &Target,
    ) -> Result<HashMap<String, f64>> {
        let spec = spec(metric_field, MetricKind::Operator(op), filter, target)
            .group_by(Grouping::terms(bucket_field));
        let response = self.execute(&spec, target, op.as_str()).await?;
        Unflattener::mapping(&response, Some(op))
    }

    /// One metric per pair of values of the two bucket fields, outer first.
    pub async fn drill_down(
        &self,
        bucket_fields: [&str; 2],
        metric_field: &str,
        op: MetricOperator,
        filter: Option<&Query>,
        target: &Target,
    ) -> Result<Vec<DrillDownRecord>> {
        let spec = spec(metric_field, MetricKind::Operator(op), filter, target)
            .group_by(Grouping::terms(bucket_fields[0]))
            .group_by(Grouping::terms(bucket_fields[1]));
        let response = self.execute(&spec, target, "drill_down").await?;
        Unflattener::drill_down(&response, Some(op))
    }

    pub async fn stats(
        &self,
        metric_field: &str,
        filter: Option<&Query>,
        target: &Target,
    ) -> Result<StatsRecord> {
        let spec = spec(metric_field, MetricKind::Stats, filter, target);
        let response = self.execute(&spec, target, "stats").await?;
        Unflattener::stats(&response)
    }

    pub async fn stats_by_bucket(
        &self,
        bucket_field: &str,
        metric_field: &str,
        filter: Option<&Query>,
        target: &Target,
    ) -> Result<HashMap<String, StatsRecord>> {
        let spec = spec(metric_field, MetricKind::Stats, filter, target)
            .group_by(Grouping::terms(bucket_field));
        let response = self.execute(&spec, target, "stats").await?;
        Unflattener::stats_by_key(&response)
    }

    /// Approximate number of distinct values of `metric_field`.
    pub async fn cardinality(
        &self,
        metric_field: &str,
        filter: Option<&Query>,
        target: &Target,
    ) -> Result<u64> {
        let spec = spec(metric_field, MetricKind::Cardinality, filter, target);
        let response = self.execute(&spec, target, "cardinality").await?;
        Unflattener::cardinality(&response)
    }

    /// Percentiles at `percents`, or at the configured defaults.
    pub async fn percentiles(
        &self,
        metric_field: &str,
        percents: Option<&[f64]>,
        filter: Option<&Query>,
        target: &Target,
    ) -> Result<PercentileResult> {
        let kind = MetricKind::Percentiles(percents.map(<[f64]>::to_vec));
        let spec = spec(metric_field, kind, filter, target);
        let response = self.execute(&spec, target, "percentiles").await?;
        Unflattener::percentiles(&response)
    }

    /// Percentage of values at or below each of `values`.
    pub async fn percentile_ranks(
        &self,
        metric_field: &str,
        values: &[f64],
        filter: Option<&Query>,
        target: &Target,
    ) -> Result<PercentileResult> {
        let kind = MetricKind::PercentileRanks(values.to_vec());
        let spec = spec(metric_field, kind, filter, target);
        let response = self.execute(&spec, target, "percentile_ranks").await?;
        Unflattener::percentiles(&response)
    }

    /// One metric per named filter, keyed by filter name.
    pub async fn filter_aggregation(
        &self,
        filters: &[NamedFilter],
        metric_field: &str,
        op: MetricOperator,
        filter: Option<&Query>,
        target: &Target,
    ) -> Result<HashMap<String, f64>> {
        let spec = spec(metric_field, MetricKind::Operator(op), filter, target)
            .group_by(Grouping::Filters(filters.to_vec()));
        let response = self.execute(&spec, target, "filters").await?;
        Unflattener::mapping(&response, Some(op))
    }

    /// One metric per fixed-width interval of `bucket_field`, ascending.
    pub async fn histogram(
        &self,
        bucket_field: &str,
        interval: f64,
        metric_field: &str,
        op: MetricOperator,
        filter: Option<&Query>,
        target: &Target,
    ) -> Result<Vec<(f64, f64)>> {
        let spec = spec(metric_field, MetricKind::Operator(op), filter, target)
            .group_by(Grouping::histogram(bucket_field, interval));
        let response = self.execute(&spec, target, "histogram").await?;
        Unflattener::histogram(&response, Some(op))
    }

    /// One metric per time interval of `bucket_field`.
    pub async fn date_histogram(
        &self,
        bucket_field: &str,
        interval: DateInterval,
        metric_field: &str,
        op: MetricOperator,
        filter: Option<&Query>,
        target: &Target,
    ) -> Result<BTreeMap<DateTime<Utc>, f64>> {
        let spec = spec(metric_field, MetricKind::Operator(op), filter, target)
            .group_by(Grouping::date_histogram(bucket_field, interval));
        let response = self.execute(&spec, target, "date_histogram").await?;
        Unflattener::date_histogram(&response, Some(op))
    }

    /// Run a caller-built spec for `entity`. Indices set on the spec override
    /// the entity's configured ones.
    pub async fn run(&self, spec: &AggregationSpec, entity: &str) -> Result<Flattened> {
        let target = Target::entity(entity).with_indices(spec.indices().iter().cloned());
        let response = self.execute(spec, &target, "run").await?;
        Unflattener::unflatten(spec, &response)
    }

    /// Send a hand-built request unchanged and return the raw response.
    pub async fn raw(
        &self,
        request: &AggregationRequest,
        target: &Target,
    ) -> Result<AggregationResponse> {
        let indices = self.resolve(target)?;
        tracing::debug!(entity = %target.entity, indices = ?indices, family = "raw", "Running aggregation");
        self.log_request(target, request)?;
        self.store.execute(request, &indices).await
    }

    async fn execute(
        &self,
        spec: &AggregationSpec,
        target: &Target,
        family: &str,
    ) -> Result<AggregationResponse> {
        let indices = self.resolve(target)?;
        let request = self.translator.translate(spec)?;
        tracing::debug!(
            entity = %target.entity,
            indices = ?indices,
            family,
            metric_field = spec.metric_field(),
            groupings = spec.depth(),
            "Running aggregation"
        );
        self.log_request(target, &request)?;
        self.store.execute(&request, &indices).await
    }

    fn resolve(&self, target: &Target) -> Result<Vec<String>> {
        self.registry
            .resolve(&target.entity, &target.indices, IndexPurpose::Search)
    }

    /// Log the request tree when the entity asks for it. Targets with
    /// explicit indices only consult metadata for registered entities.
    fn log_request(&self, target: &Target, request: &AggregationRequest) -> Result<()> {
        let print_log = match self.registry.metadata(&target.entity) {
            Ok(meta) => meta.print_log,
            Err(_) if !target.indices.is_empty() => false,
            Err(e) => return Err(e),
        };
        if print_log {
            let body = serde_json::to_string(request)?;
            tracing::info!(entity = %target.entity, request = %body, "Aggregation request");
        }
        Ok(())
    }
}

fn spec(
    metric_field: &str,
    metric: MetricKind,
    filter: Option<&Query>,
    target: &Target,
) -> AggregationSpec {
    AggregationSpec::new(metric_field, metric)
        .with_filter(filter.cloned())
        .with_indices(target.indices.clone())
}
