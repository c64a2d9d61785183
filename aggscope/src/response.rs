//! Aggregation response tree, in the shape an Elasticsearch search returns it

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Response of a single aggregation request
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AggregationResponse {
    /// Engine time in milliseconds
    #[serde(default)]
    pub took: u64,

    /// Number of documents matched by the request query
    #[serde(default)]
    pub total: u64,

    #[serde(default)]
    pub aggregations: HashMap<String, AggregationOutput>,
}

impl AggregationResponse {
    pub fn get(&self, name: &str) -> Option<&AggregationOutput> {
        self.aggregations.get(name)
    }
}

/// Result of one aggregation node.
///
/// Variant order matters for untagged deserialization: shapes with required
/// keys come before the permissive `Value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AggregationOutput {
    Buckets {
        buckets: BucketEntries,
    },
    Stats {
        count: u64,
        min: Option<f64>,
        max: Option<f64>,
        sum: Option<f64>,
        avg: Option<f64>,
    },
    Percentiles {
        values: BTreeMap<String, Option<f64>>,
    },
    Value {
        value: Option<f64>,
    },
}

impl AggregationOutput {
    pub fn shape(&self) -> &'static str {
        match self {
            AggregationOutput::Buckets { .. } => "buckets",
            AggregationOutput::Stats { .. } => "stats",
            AggregationOutput::Percentiles { .. } => "percentiles",
            AggregationOutput::Value { .. } => "value",
        }
    }
}

/// Bucket list, either ordered or keyed by bucket name (`filters`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BucketEntries {
    Vec(Vec<ResponseBucket>),
    Keyed(BTreeMap<String, ResponseBucket>),
}

impl BucketEntries {
    /// Buckets with their resolved keys, in response order.
    pub fn entries(&self) -> Vec<(String, &ResponseBucket)> {
        match self {
            BucketEntries::Vec(v) => v.iter().map(|b| (b.key_string(), b)).collect(),
            BucketEntries::Keyed(m) => m.iter().map(|(k, b)| (k.clone(), b)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            BucketEntries::Vec(v) => v.len(),
            BucketEntries::Keyed(m) => m.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseBucket {
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub key: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_as_string: Option<String>,
    pub doc_count: u64,
    #[serde(flatten)]
    pub sub_aggs: HashMap<String, AggregationOutput>,
}

impl ResponseBucket {
    pub fn new(key: Value, doc_count: u64) -> Self {
        Self {
            key,
            key_as_string: None,
            doc_count,
            sub_aggs: HashMap::new(),
        }
    }

    /// Bucket key as text: `key_as_string` when the engine supplied one.
    pub fn key_string(&self) -> String {
        if let Some(s) = &self.key_as_string {
            return s.clone();
        }
        match &self.key {
            Value::String(s) => s.clone(),
            Value::Number(n) => match n.as_f64() {
                Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 1e15 => {
                    format!("{}", f as i64)
                }
                _ => n.to_string(),
            },
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }

    /// Numeric key, for histogram buckets.
    pub fn key_f64(&self) -> Option<f64> {
        match &self.key {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deserialize_terms_with_sub_metric() {
        let out: AggregationOutput = serde_json::from_value(json!({
            "buckets": [
                {"key": "0101", "doc_count": 3, "metric": {"value": 300.0}},
                {"key": 103, "doc_count": 2, "metric": {"value": 150.0}}
            ]
        }))
        .unwrap();

        let AggregationOutput::Buckets { buckets } = out else {
            panic!("Expected buckets");
        };
        let entries = buckets.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, "0101");
        assert_eq!(entries[1].0, "103");
        assert_eq!(
            entries[0].1.sub_aggs.get("metric"),
            Some(&AggregationOutput::Value { value: Some(300.0) })
        );
    }

    #[test]
    fn test_deserialize_keyed_filters_buckets() {
        let out: AggregationOutput = serde_json::from_value(json!({
            "buckets": {
                "men": {"doc_count": 4, "metric": {"value": 2.0}},
                "women": {"doc_count": 0, "metric": {"value": 0.0}}
            }
        }))
        .unwrap();
        let AggregationOutput::Buckets { buckets } = out else {
            panic!("Expected buckets");
        };
        let keys: Vec<String> = buckets.entries().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["men", "women"]);
    }

    #[test]
    fn test_stats_not_mistaken_for_value() {
        let out: AggregationOutput = serde_json::from_value(json!({
            "count": 2, "min": 1.0, "max": 3.0, "avg": 2.0, "sum": 4.0
        }))
        .unwrap();
        assert_eq!(out.shape(), "stats");

        let out: AggregationOutput = serde_json::from_value(json!({"value": null})).unwrap();
        assert_eq!(out, AggregationOutput::Value { value: None });
    }

    #[test]
    fn test_percentiles_shape() {
        let out: AggregationOutput = serde_json::from_value(json!({
            "values": {"50.0": 12.5, "99.0": null}
        }))
        .unwrap();
        assert_eq!(out.shape(), "percentiles");
    }

    #[test]
    fn test_key_string_prefers_key_as_string() {
        let mut bucket = ResponseBucket::new(json!(1_570_000_000_000i64), 1);
        assert_eq!(bucket.key_string(), "1570000000000");
        bucket.key_as_string = Some("2019-10-02T07:06:40Z".to_string());
        assert_eq!(bucket.key_string(), "2019-10-02T07:06:40Z");

        assert_eq!(ResponseBucket::new(json!(50.0), 1).key_string(), "50");
        assert_eq!(ResponseBucket::new(json!(2.5), 1).key_string(), "2.5");
        assert_eq!(ResponseBucket::new(json!(true), 1).key_string(), "true");
    }
}
