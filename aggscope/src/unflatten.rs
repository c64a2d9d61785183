//! Flattening of nested aggregation responses
//!
//! The extractors walk the node names the translator emits (`group`,
//! `subgroup`, `metric`) and fail with [`AggError::AggregationNotFound`] when a
//! node is missing or has an unexpected shape.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

use crate::error::AggError;
use crate::operator::MetricOperator;
use crate::query::translator::{AggregationSpec, Grouping, MetricKind, GROUP_AGG, METRIC_AGG, SUBGROUP_AGG};
use crate::record::{DrillDownRecord, PercentileResult, StatsRecord};
use crate::response::{AggregationOutput, AggregationResponse, BucketEntries, ResponseBucket};
use crate::Result;

/// Any flattened result, for callers that dispatch on the spec at runtime.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Flattened {
    Scalar(f64),
    Mapping(HashMap<String, f64>),
    DrillDown(Vec<DrillDownRecord>),
    Stats(StatsRecord),
    StatsByKey(HashMap<String, StatsRecord>),
    Cardinality(u64),
    Percentiles(PercentileResult),
    Histogram(Vec<(f64, f64)>),
    DateHistogram(BTreeMap<DateTime<Utc>, f64>),
}

/// Typed extractors for each result shape
pub struct Unflattener;

impl Unflattener {
    /// Flatten `response` into the shape `spec` implies.
    pub fn unflatten(spec: &AggregationSpec, response: &AggregationResponse) -> Result<Flattened> {
        let op = match spec.metric() {
            MetricKind::Operator(op) => Some(*op),
            _ => None,
        };

        match (spec.metric(), spec.groupings()) {
            (MetricKind::Operator(_), []) => Self::scalar(response).map(Flattened::Scalar),
            (MetricKind::Operator(_), [Grouping::Histogram { .. }]) => {
                Self::histogram(response, op).map(Flattened::Histogram)
            }
            (MetricKind::Operator(_), [Grouping::DateHistogram { .. }]) => {
                Self::date_histogram(response, op).map(Flattened::DateHistogram)
            }
            (MetricKind::Operator(_), [_]) => Self::mapping(response, op).map(Flattened::Mapping),
            (MetricKind::Operator(_), [_, _]) => {
                Self::drill_down(response, op).map(Flattened::DrillDown)
            }
            (MetricKind::Stats, []) => Self::stats(response).map(Flattened::Stats),
            (MetricKind::Stats, [_]) => Self::stats_by_key(response).map(Flattened::StatsByKey),
            (MetricKind::Cardinality, []) => {
                Self::cardinality(response).map(Flattened::Cardinality)
            }
            (MetricKind::Percentiles(_), []) | (MetricKind::PercentileRanks(_), []) => {
                Self::percentiles(response).map(Flattened::Percentiles)
            }
            (metric, groupings) => Err(AggError::InvalidAggregationSpec(format!(
                "no result shape for {:?} with {} grouping(s)",
                metric,
                groupings.len()
            ))),
        }
    }

    /// Single metric value. A `null` value means the metric had nothing to
    /// aggregate.
    pub fn scalar(response: &AggregationResponse) -> Result<f64> {
        let out = node(&response.aggregations, METRIC_AGG, METRIC_AGG)?;
        value(out, METRIC_AGG)?.ok_or_else(|| empty(METRIC_AGG))
    }

    /// Bucket key to metric value, one grouping level.
    pub fn mapping(
        response: &AggregationResponse,
        op: Option<MetricOperator>,
    ) -> Result<HashMap<String, f64>> {
        let buckets = top_buckets(response)?;
        let mut result = HashMap::with_capacity(buckets.len());
        for (key, bucket) in buckets.entries() {
            let path = format!("{}[{}].{}", GROUP_AGG, key, METRIC_AGG);
            if let Some(v) = bucket_metric(bucket, &path, op)? {
                result.insert(key, v);
            }
        }
        Ok(result)
    }

    /// Two grouping levels flattened into records, in engine order.
    pub fn drill_down(
        response: &AggregationResponse,
        op: Option<MetricOperator>,
    ) -> Result<Vec<DrillDownRecord>> {
        let outer = top_buckets(response)?;
        let mut records = Vec::new();

        for (outer_key, outer_bucket) in outer.entries() {
            if outer_bucket.doc_count == 0 {
                continue;
            }
            let path = format!("{}[{}].{}", GROUP_AGG, outer_key, SUBGROUP_AGG);
            let inner = buckets(node(&outer_bucket.sub_aggs, SUBGROUP_AGG, &path)?, &path)?;

            for (inner_key, inner_bucket) in inner.entries() {
                let metric_path = format!("{}[{}].{}", path, inner_key, METRIC_AGG);
                if let Some(v) = bucket_metric(inner_bucket, &metric_path, op)? {
                    records.push(DrillDownRecord::new(outer_key.clone(), inner_key, v));
                }
            }
        }
        Ok(records)
    }

    /// Statistics over the whole matched set.
    pub fn stats(response: &AggregationResponse) -> Result<StatsRecord> {
        let out = node(&response.aggregations, METRIC_AGG, METRIC_AGG)?;
        stats_record(out, METRIC_AGG)?.ok_or_else(|| empty(METRIC_AGG))
    }

    /// Statistics per bucket; buckets without values are left out.
    pub fn stats_by_key(response: &AggregationResponse) -> Result<HashMap<String, StatsRecord>> {
        let buckets = top_buckets(response)?;
        let mut result = HashMap::with_capacity(buckets.len());
        for (key, bucket) in buckets.entries() {
            if bucket.doc_count == 0 {
                continue;
            }
            let path = format!("{}[{}].{}", GROUP_AGG, key, METRIC_AGG);
            let out = node(&bucket.sub_aggs, METRIC_AGG, &path)?;
            match stats_record(out, &path)? {
                Some(record) => {
                    result.insert(key, record);
                }
                None => tracing::warn!(bucket = %key, "Omitting bucket without statistics"),
            }
        }
        Ok(result)
    }

    /// Approximate distinct value count.
    pub fn cardinality(response: &AggregationResponse) -> Result<u64> {
        let out = node(&response.aggregations, METRIC_AGG, METRIC_AGG)?;
        let v = value(out, METRIC_AGG)?.ok_or_else(|| empty(METRIC_AGG))?;
        Ok(v.max(0.0).round() as u64)
    }

    /// Percentiles or percentile ranks, ascending by marker.
    pub fn percentiles(response: &AggregationResponse) -> Result<PercentileResult> {
        let out = node(&response.aggregations, METRIC_AGG, METRIC_AGG)?;
        let AggregationOutput::Percentiles { values } = out else {
            return Err(wrong_shape(METRIC_AGG, "percentiles", out));
        };

        let mut entries = Vec::with_capacity(values.len());
        for (marker, v) in values {
            let key: f64 = marker.parse().map_err(|_| {
                AggError::AggregationNotFound(format!(
                    "{}: unparseable percentile marker '{}'",
                    METRIC_AGG, marker
                ))
            })?;
            let v = v.ok_or_else(|| empty(METRIC_AGG))?;
            entries.push((key, v));
        }
        Ok(PercentileResult::from_entries(entries))
    }

    /// Histogram bucket lower bound to metric value, ascending.
    pub fn histogram(
        response: &AggregationResponse,
        op: Option<MetricOperator>,
    ) -> Result<Vec<(f64, f64)>> {
        let buckets = top_buckets(response)?;
        let mut result = Vec::with_capacity(buckets.len());
        for (key, bucket) in buckets.entries() {
            let path = format!("{}[{}].{}", GROUP_AGG, key, METRIC_AGG);
            let Some(v) = bucket_metric(bucket, &path, op)? else {
                continue;
            };
            let lower = bucket.key_f64().ok_or_else(|| {
                AggError::AggregationNotFound(format!("{}: non-numeric histogram key '{}'", GROUP_AGG, key))
            })?;
            result.push((lower, v));
        }
        Ok(result)
    }

    /// Date histogram bucket start to metric value.
    pub fn date_histogram(
        response: &AggregationResponse,
        op: Option<MetricOperator>,
    ) -> Result<BTreeMap<DateTime<Utc>, f64>> {
        let buckets = top_buckets(response)?;
        let mut result = BTreeMap::new();
        for (key, bucket) in buckets.entries() {
            let path = format!("{}[{}].{}", GROUP_AGG, key, METRIC_AGG);
            let Some(v) = bucket_metric(bucket, &path, op)? else {
                continue;
            };
            result.insert(bucket_start(bucket)?, v);
        }
        Ok(result)
    }
}

fn node<'a>(
    aggs: &'a HashMap<String, AggregationOutput>,
    name: &str,
    path: &str,
) -> Result<&'a AggregationOutput> {
    aggs.get(name)
        .ok_or_else(|| AggError::AggregationNotFound(path.to_string()))
}

fn top_buckets(response: &AggregationResponse) -> Result<&BucketEntries> {
    buckets(node(&response.aggregations, GROUP_AGG, GROUP_AGG)?, GROUP_AGG)
}

fn buckets<'a>(out: &'a AggregationOutput, path: &str) -> Result<&'a BucketEntries> {
    match out {
        AggregationOutput::Buckets { buckets } => Ok(buckets),
        other => Err(wrong_shape(path, "buckets", other)),
    }
}

fn value(out: &AggregationOutput, path: &str) -> Result<Option<f64>> {
    match out {
        AggregationOutput::Value { value } => Ok(*value),
        other => Err(wrong_shape(path, "value", other)),
    }
}

fn stats_record(out: &AggregationOutput, path: &str) -> Result<Option<StatsRecord>> {
    let AggregationOutput::Stats {
        count,
        min,
        max,
        sum,
        avg,
    } = out
    else {
        return Err(wrong_shape(path, "stats", out));
    };
    if *count == 0 {
        return Ok(None);
    }
    match (min, max, sum, avg) {
        (Some(min), Some(max), Some(sum), Some(avg)) => Ok(Some(StatsRecord {
            count: *count,
            min: *min,
            max: *max,
            sum: *sum,
            avg: *avg,
        })),
        _ => Err(AggError::AggregationNotFound(format!(
            "{}: incomplete statistics",
            path
        ))),
    }
}

/// Metric value of one bucket, or `None` when the bucket is left out.
fn bucket_metric(
    bucket: &ResponseBucket,
    path: &str,
    op: Option<MetricOperator>,
) -> Result<Option<f64>> {
    if bucket.doc_count == 0 {
        return Ok(None);
    }
    let out = node(&bucket.sub_aggs, METRIC_AGG, path)?;
    match value(out, path)? {
        None => {
            tracing::warn!(path, doc_count = bucket.doc_count, "Omitting bucket with null metric");
            Ok(None)
        }
        Some(v) if v == 0.0 && op == Some(MetricOperator::Count) => {
            tracing::warn!(path, doc_count = bucket.doc_count, "Omitting bucket without counted values");
            Ok(None)
        }
        Some(v) => Ok(Some(v)),
    }
}

fn bucket_start(bucket: &ResponseBucket) -> Result<DateTime<Utc>> {
    if let Some(ms) = bucket.key_f64() {
        if let Some(ts) = Utc.timestamp_millis_opt(ms as i64).single() {
            return Ok(ts);
        }
    }
    bucket
        .key_as_string
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|ts| ts.with_timezone(&Utc))
        .ok_or_else(|| {
            AggError::AggregationNotFound(format!(
                "{}: bucket key '{}' is not a timestamp",
                GROUP_AGG,
                bucket.key_string()
            ))
        })
}

fn empty(path: &str) -> AggError {
    AggError::AggregationNotFound(format!("{}: no values aggregated", path))
}

fn wrong_shape(path: &str, expected: &str, found: &AggregationOutput) -> AggError {
    AggError::AggregationNotFound(format!(
        "{}: expected {} but found {}",
        path,
        expected,
        found.shape()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::types::DateInterval;
    use serde_json::json;

    fn response(aggs: serde_json::Value) -> AggregationResponse {
        serde_json::from_value(json!({"took": 1, "total": 5, "aggregations": aggs})).unwrap()
    }

    fn not_found<T: std::fmt::Debug>(result: Result<T>) -> String {
        match result {
            Err(AggError::AggregationNotFound(path)) => path,
            other => panic!("Expected AggregationNotFound, got {:?}", other),
        }
    }

    // ===================================================================
    // Scalars
    // ===================================================================

    #[test]
    fn test_scalar() {
        let resp = response(json!({"metric": {"value": 450.0}}));
        assert_eq!(Unflattener::scalar(&resp).unwrap(), 450.0);
    }

    #[test]
    fn test_scalar_zero_sum_is_a_value() {
        let resp = response(json!({"metric": {"value": 0.0}}));
        assert_eq!(Unflattener::scalar(&resp).unwrap(), 0.0);
    }

    #[test]
    fn test_scalar_null_not_found() {
        let resp = response(json!({"metric": {"value": null}}));
        not_found(Unflattener::scalar(&resp));
    }

    #[test]
    fn test_missing_node_names_path() {
        let resp = response(json!({}));
        assert_eq!(not_found(Unflattener::scalar(&resp)), "metric");
        assert_eq!(not_found(Unflattener::mapping(&resp, None)), "group");
    }

    #[test]
    fn test_wrong_shape_not_found() {
        let resp = response(json!({"group": {"value": 1.0}}));
        let msg = not_found(Unflattener::mapping(&resp, None));
        assert!(msg.contains("expected buckets"), "{}", msg);
    }

    // ===================================================================
    // One grouping level
    // ===================================================================

    #[test]
    fn test_mapping() {
        let resp = response(json!({
            "group": {"buckets": [
                {"key": "0101", "doc_count": 3, "metric": {"value": 300.0}},
                {"key": "0103", "doc_count": 2, "metric": {"value": 150.0}}
            ]}
        }));
        let map = Unflattener::mapping(&resp, Some(MetricOperator::Sum)).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map["0101"], 300.0);
        assert_eq!(map["0103"], 150.0);
    }

    #[test]
    fn test_mapping_omits_empty_and_null_buckets() {
        let resp = response(json!({
            "group": {"buckets": {
                "men": {"doc_count": 2, "metric": {"value": 7.0}},
                "none": {"doc_count": 0, "metric": {"value": 0.0}},
                "unset": {"doc_count": 3, "metric": {"value": null}}
            }}
        }));
        let map = Unflattener::mapping(&resp, Some(MetricOperator::Avg)).unwrap();
        assert_eq!(map, HashMap::from([("men".to_string(), 7.0)]));
    }

    #[test]
    fn test_mapping_omits_zero_counts_only_for_count() {
        let aggs = json!({
            "group": {"buckets": [{"key": "A", "doc_count": 2, "metric": {"value": 0.0}}]}
        });
        let resp = response(aggs);
        assert!(Unflattener::mapping(&resp, Some(MetricOperator::Count))
            .unwrap()
            .is_empty());
        assert_eq!(
            Unflattener::mapping(&resp, Some(MetricOperator::Sum)).unwrap()["A"],
            0.0
        );
    }

    #[test]
    fn test_mapping_empty_buckets() {
        let resp = response(json!({"group": {"buckets": []}}));
        assert!(Unflattener::mapping(&resp, None).unwrap().is_empty());
    }

    #[test]
    fn test_numeric_keys_render_as_integers() {
        let resp = response(json!({
            "group": {"buckets": [{"key": 2019.0, "doc_count": 1, "metric": {"value": 1.0}}]}
        }));
        assert!(Unflattener::mapping(&resp, None).unwrap().contains_key("2019"));
    }

    // ===================================================================
    // Drill-down
    // ===================================================================

    #[test]
    fn test_drill_down_preserves_order() {
        let resp = response(json!({
            "group": {"buckets": [
                {"key": "B", "doc_count": 2, "subgroup": {"buckets": [
                    {"key": "0103", "doc_count": 1, "metric": {"value": 20.0}},
                    {"key": "0101", "doc_count": 1, "metric": {"value": 10.0}}
                ]}},
                {"key": "A", "doc_count": 1, "subgroup": {"buckets": [
                    {"key": "0101", "doc_count": 1, "metric": {"value": 50.0}}
                ]}}
            ]}
        }));
        let records = Unflattener::drill_down(&resp, Some(MetricOperator::Sum)).unwrap();
        let flat: Vec<(&str, &str, f64)> = records
            .iter()
            .map(|r| (r.level_1_key(), r.level_2_key(), r.value()))
            .collect();
        assert_eq!(
            flat,
            vec![("B", "0103", 20.0), ("B", "0101", 10.0), ("A", "0101", 50.0)]
        );
    }

    #[test]
    fn test_drill_down_omits_empty_inner_buckets() {
        let resp = response(json!({
            "group": {"buckets": [
                {"key": "A", "doc_count": 3, "subgroup": {"buckets": [
                    {"key": "0101", "doc_count": 0, "metric": {"value": 0}},
                    {"key": "0102", "doc_count": 2, "metric": {"value": 0}},
                    {"key": "0103", "doc_count": 1, "metric": {"value": 1}}
                ]}},
                {"key": "B", "doc_count": 1, "subgroup": {"buckets": [
                    {"key": "0101", "doc_count": 1, "metric": {"value": null}}
                ]}}
            ]}
        }));
        let records = Unflattener::drill_down(&resp, Some(MetricOperator::Count)).unwrap();
        let flat: Vec<(&str, &str, f64)> = records
            .iter()
            .map(|r| (r.level_1_key(), r.level_2_key(), r.value()))
            .collect();
        assert_eq!(flat, vec![("A", "0103", 1.0)]);
    }

    #[test]
    fn test_drill_down_keeps_zero_sum() {
        let resp = response(json!({
            "group": {"buckets": [
                {"key": "A", "doc_count": 1, "subgroup": {"buckets": [
                    {"key": "0101", "doc_count": 1, "metric": {"value": 0.0}}
                ]}}
            ]}
        }));
        let records = Unflattener::drill_down(&resp, Some(MetricOperator::Sum)).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value(), 0.0);
    }

    #[test]
    fn test_drill_down_missing_subgroup() {
        let resp = response(json!({
            "group": {"buckets": [{"key": "A", "doc_count": 1, "metric": {"value": 1.0}}]}
        }));
        assert_eq!(
            not_found(Unflattener::drill_down(&resp, None)),
            "group[A].subgroup"
        );
    }

    // ===================================================================
    // Statistics
    // ===================================================================

    #[test]
    fn test_stats() {
        let resp = response(json!({
            "metric": {"count": 2, "min": 10.0, "max": 30.0, "sum": 40.0, "avg": 20.0}
        }));
        let stats = Unflattener::stats(&resp).unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.avg, 20.0);
    }

    #[test]
    fn test_stats_empty_set_not_found() {
        let resp = response(json!({
            "metric": {"count": 0, "min": null, "max": null, "sum": 0.0, "avg": null}
        }));
        not_found(Unflattener::stats(&resp));
    }

    #[test]
    fn test_stats_by_key() {
        let resp = response(json!({
            "group": {"buckets": [
                {"key": "0101", "doc_count": 1, "metric": {"count": 1, "min": 5.0, "max": 5.0, "sum": 5.0, "avg": 5.0}},
                {"key": "0102", "doc_count": 1, "metric": {"count": 0, "min": null, "max": null, "sum": 0.0, "avg": null}}
            ]}
        }));
        let map = Unflattener::stats_by_key(&resp).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map["0101"].sum, 5.0);
    }

    // ===================================================================
    // Distribution shapes
    // ===================================================================

    #[test]
    fn test_cardinality() {
        let resp = response(json!({"metric": {"value": 3}}));
        assert_eq!(Unflattener::cardinality(&resp).unwrap(), 3);
    }

    #[test]
    fn test_cardinality_null_not_found() {
        let resp = response(json!({"metric": {"value": null}}));
        assert_eq!(not_found(Unflattener::cardinality(&resp)), "metric: no values aggregated");
    }

    #[test]
    fn test_cardinality_zero_is_value() {
        let resp = response(json!({"metric": {"value": 0}}));
        assert_eq!(Unflattener::cardinality(&resp).unwrap(), 0);
    }

    #[test]
    fn test_percentiles_sorted_numeric() {
        let resp = response(json!({
            "metric": {"values": {"5.0": 1.5, "50.0": 20.0, "100.0": 90.0}}
        }));
        let p = Unflattener::percentiles(&resp).unwrap();
        assert_eq!(p.keys().collect::<Vec<_>>(), vec![5.0, 50.0, 100.0]);
        assert_eq!(p.get(50.0), Some(20.0));
    }

    #[test]
    fn test_percentiles_null_not_found() {
        let resp = response(json!({"metric": {"values": {"50.0": null}}}));
        not_found(Unflattener::percentiles(&resp));
    }

    #[test]
    fn test_histogram() {
        let resp = response(json!({
            "group": {"buckets": [
                {"key": 0.0, "doc_count": 2, "metric": {"value": 2.0}},
                {"key": 3.0, "doc_count": 0, "metric": {"value": 0.0}},
                {"key": 6.0, "doc_count": 1, "metric": {"value": 1.0}}
            ]}
        }));
        let hist = Unflattener::histogram(&resp, Some(MetricOperator::Count)).unwrap();
        assert_eq!(hist, vec![(0.0, 2.0), (6.0, 1.0)]);
    }

    #[test]
    fn test_date_histogram() {
        let resp = response(json!({
            "group": {"buckets": [
                {"key": 1_546_300_800_000i64, "key_as_string": "2019-01-01T00:00:00.000Z", "doc_count": 1, "metric": {"value": 5.0}},
                {"key": 1_546_308_000_000i64, "key_as_string": "2019-01-01T02:00:00.000Z", "doc_count": 2, "metric": {"value": 7.0}}
            ]}
        }));
        let hist = Unflattener::date_histogram(&resp, None).unwrap();
        let keys: Vec<String> = hist.keys().map(|k| k.to_rfc3339()).collect();
        assert_eq!(
            keys,
            vec!["2019-01-01T00:00:00+00:00", "2019-01-01T02:00:00+00:00"]
        );
        assert_eq!(hist.values().copied().collect::<Vec<_>>(), vec![5.0, 7.0]);
    }

    // ===================================================================
    // Dispatch
    // ===================================================================

    #[test]
    fn test_unflatten_dispatches_on_spec() {
        let spec = AggregationSpec::new("premium", MetricKind::Operator(MetricOperator::Sum))
            .group_by(Grouping::date_histogram("input_date", DateInterval::hours(2)));
        let resp = response(json!({
            "group": {"buckets": [{"key": 0, "doc_count": 1, "metric": {"value": 1.0}}]}
        }));
        assert!(matches!(
            Unflattener::unflatten(&spec, &resp).unwrap(),
            Flattened::DateHistogram(m) if m.len() == 1
        ));

        let spec = AggregationSpec::new("premium", MetricKind::Stats);
        let resp = response(json!({
            "metric": {"count": 1, "min": 1.0, "max": 1.0, "sum": 1.0, "avg": 1.0}
        }));
        assert!(matches!(
            Unflattener::unflatten(&spec, &resp).unwrap(),
            Flattened::Stats(_)
        ));
    }
}
