//! Query filter and aggregation request types
//!
//! Both serialize to the Elasticsearch Query DSL / aggregation JSON shape, so a
//! network-backed [`DocumentStore`](crate::DocumentStore) can send them as-is.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use crate::error::AggError;

/// Aggregation request: a top-level filter plus named aggregation trees.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct AggregationRequest {
    /// Restriction applied before aggregating; `None` matches all documents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<Query>,

    /// Number of hits to return alongside the aggregations
    #[serde(default)]
    pub size: usize,

    #[serde(default, alias = "aggregations")]
    pub aggs: BTreeMap<String, AggregationNode>,
}

impl AggregationRequest {
    pub fn new(query: Option<Query>) -> Self {
        Self {
            query,
            size: 0,
            aggs: BTreeMap::new(),
        }
    }

    pub fn with_agg(mut self, name: impl Into<String>, node: AggregationNode) -> Self {
        self.aggs.insert(name.into(), node);
        self
    }
}

/// One node of an aggregation tree.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AggregationNode {
    #[serde(flatten)]
    pub kind: AggregationKind,

    #[serde(
        default,
        alias = "aggregations",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub aggs: BTreeMap<String, AggregationNode>,
}

impl AggregationNode {
    pub fn new(kind: AggregationKind) -> Self {
        Self {
            kind,
            aggs: BTreeMap::new(),
        }
    }

    /// Nest `node` under this one as `name`.
    pub fn with_sub(mut self, name: impl Into<String>, node: AggregationNode) -> Self {
        self.aggs.insert(name.into(), node);
        self
    }
}

/// Aggregation types
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationKind {
    // Metric aggregations
    Sum(FieldAgg),
    Avg(FieldAgg),
    Min(FieldAgg),
    Max(FieldAgg),
    ValueCount(FieldAgg),
    Stats(FieldAgg),
    Cardinality(FieldAgg),
    Percentiles(PercentilesAgg),
    PercentileRanks(PercentileRanksAgg),

    // Bucket aggregations
    Terms(TermsAgg),
    Histogram(HistogramAgg),
    DateHistogram(DateHistogramAgg),
    Filters(FiltersAgg),
}

impl AggregationKind {
    /// ES name of the aggregation type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Sum(_) => "sum",
            Self::Avg(_) => "avg",
            Self::Min(_) => "min",
            Self::Max(_) => "max",
            Self::ValueCount(_) => "value_count",
            Self::Stats(_) => "stats",
            Self::Cardinality(_) => "cardinality",
            Self::Percentiles(_) => "percentiles",
            Self::PercentileRanks(_) => "percentile_ranks",
            Self::Terms(_) => "terms",
            Self::Histogram(_) => "histogram",
            Self::DateHistogram(_) => "date_histogram",
            Self::Filters(_) => "filters",
        }
    }

    /// Field the aggregation reads, if it reads one.
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::Sum(f)
            | Self::Avg(f)
            | Self::Min(f)
            | Self::Max(f)
            | Self::ValueCount(f)
            | Self::Stats(f)
            | Self::Cardinality(f) => Some(&f.field),
            Self::Percentiles(p) => Some(&p.field),
            Self::PercentileRanks(p) => Some(&p.field),
            Self::Terms(t) => Some(&t.field),
            Self::Histogram(h) => Some(&h.field),
            Self::DateHistogram(d) => Some(&d.field),
            Self::Filters(_) => None,
        }
    }

    pub fn is_bucket(&self) -> bool {
        matches!(
            self,
            Self::Terms(_) | Self::Histogram(_) | Self::DateHistogram(_) | Self::Filters(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FieldAgg {
    pub field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing: Option<Value>,
}

impl FieldAgg {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            missing: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PercentilesAgg {
    pub field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percents: Option<Vec<f64>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PercentileRanksAgg {
    pub field: String,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TermsAgg {
    pub field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_doc_count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct HistogramAgg {
    pub field: String,
    pub interval: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_doc_count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DateHistogramAgg {
    pub field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calendar_interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_doc_count: Option<u64>,
}

impl DateHistogramAgg {
    pub fn new(field: impl Into<String>, interval: &DateInterval) -> Self {
        let (calendar_interval, fixed_interval) = match interval {
            DateInterval::Calendar(_) => (Some(interval.to_string()), None),
            DateInterval::Fixed(_) => (None, Some(interval.to_string())),
        };
        Self {
            field: field.into(),
            calendar_interval,
            fixed_interval,
            min_doc_count: None,
        }
    }

    /// Parse whichever interval key is set.
    pub fn interval(&self) -> Result<DateInterval, AggError> {
        match (&self.calendar_interval, &self.fixed_interval) {
            (Some(s), None) | (None, Some(s)) => s.parse(),
            (Some(_), Some(_)) => Err(AggError::InvalidQuery(
                "date_histogram accepts only one of calendar_interval and fixed_interval"
                    .to_string(),
            )),
            (None, None) => Err(AggError::InvalidQuery(format!(
                "date_histogram on '{}' has no interval",
                self.field
            ))),
        }
    }
}

/// Keyed filters: one bucket per named filter.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FiltersAgg {
    pub filters: BTreeMap<String, Query>,
}

/// Calendar-aware date histogram unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalendarUnit {
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

/// Interval for date histogram aggregation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateInterval {
    Calendar(CalendarUnit),
    Fixed(Duration),
}

impl DateInterval {
    pub fn hours(n: u32) -> Self {
        DateInterval::Fixed(Duration::hours(i64::from(n)))
    }

    pub fn minutes(n: u32) -> Self {
        DateInterval::Fixed(Duration::minutes(i64::from(n)))
    }

    pub fn days(n: u32) -> Self {
        DateInterval::Fixed(Duration::days(i64::from(n)))
    }
}

impl fmt::Display for DateInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DateInterval::Calendar(unit) => {
                let s = match unit {
                    CalendarUnit::Minute => "1m",
                    CalendarUnit::Hour => "1h",
                    CalendarUnit::Day => "1d",
                    CalendarUnit::Week => "1w",
                    CalendarUnit::Month => "1M",
                    CalendarUnit::Quarter => "1q",
                    CalendarUnit::Year => "1y",
                };
                f.write_str(s)
            }
            DateInterval::Fixed(d) => {
                let ms = d.num_milliseconds();
                const UNITS: [(i64, &str); 4] =
                    [(86_400_000, "d"), (3_600_000, "h"), (60_000, "m"), (1_000, "s")];
                for (size, suffix) in UNITS {
                    if ms != 0 && ms % size == 0 {
                        return write!(f, "{}{}", ms / size, suffix);
                    }
                }
                write!(f, "{}ms", ms)
            }
        }
    }
}

impl FromStr for DateInterval {
    type Err = AggError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let named = match s.to_lowercase().as_str() {
            "minute" => Some(CalendarUnit::Minute),
            "hour" => Some(CalendarUnit::Hour),
            "day" => Some(CalendarUnit::Day),
            "week" => Some(CalendarUnit::Week),
            "month" => Some(CalendarUnit::Month),
            "quarter" => Some(CalendarUnit::Quarter),
            "year" => Some(CalendarUnit::Year),
            _ => None,
        };
        if let Some(unit) = named {
            return Ok(DateInterval::Calendar(unit));
        }

        let invalid = || AggError::InvalidAggregationSpec(format!("invalid date interval '{}'", s));
        let split = s.find(|c: char| !c.is_ascii_digit()).ok_or_else(invalid)?;
        let (digits, unit) = s.split_at(split);
        let n: i64 = digits.parse().map_err(|_| invalid())?;
        if n <= 0 {
            return Err(invalid());
        }

        if n == 1 {
            let calendar = match unit {
                "m" => Some(CalendarUnit::Minute),
                "h" => Some(CalendarUnit::Hour),
                "d" => Some(CalendarUnit::Day),
                "w" => Some(CalendarUnit::Week),
                "M" => Some(CalendarUnit::Month),
                "q" => Some(CalendarUnit::Quarter),
                "y" => Some(CalendarUnit::Year),
                _ => None,
            };
            if let Some(unit) = calendar {
                return Ok(DateInterval::Calendar(unit));
            }
        }

        let fixed = match unit {
            "ms" => Duration::try_milliseconds(n),
            "s" => Duration::try_seconds(n),
            "m" => Duration::try_minutes(n),
            "h" => Duration::try_hours(n),
            "d" => Duration::try_days(n),
            _ => return Err(invalid()),
        };
        fixed.map(DateInterval::Fixed).ok_or_else(invalid)
    }
}

/// Query filter types
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Query {
    /// Match all documents
    MatchAll(MatchAllQuery),

    /// Match query (analyzed full-text)
    Match(HashMap<String, MatchQuery>),

    /// Match phrase query
    MatchPhrase(HashMap<String, MatchPhraseQuery>),

    /// Term query (exact match, not analyzed)
    Term(HashMap<String, TermValue>),

    /// Terms query (multiple exact matches)
    Terms(HashMap<String, Vec<Value>>),

    /// Range query
    Range(HashMap<String, RangeParams>),

    /// Bool query (must, should, must_not, filter)
    Bool(BoolQuery),

    /// Exists query
    Exists(ExistsQuery),

    /// Prefix query
    Prefix(HashMap<String, PrefixParams>),

    /// IDs query
    Ids(IdsQuery),
}

impl Query {
    pub fn match_all() -> Self {
        Query::MatchAll(MatchAllQuery { boost: None })
    }

    pub fn term(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Query::Term(HashMap::from([(
            field.into(),
            TermValue::Simple(value.into()),
        )]))
    }

    pub fn terms(field: impl Into<String>, values: Vec<Value>) -> Self {
        Query::Terms(HashMap::from([(field.into(), values)]))
    }

    pub fn matches(field: impl Into<String>, text: impl Into<String>) -> Self {
        Query::Match(HashMap::from([(
            field.into(),
            MatchQuery::Simple(text.into()),
        )]))
    }

    pub fn match_phrase(field: impl Into<String>, text: impl Into<String>) -> Self {
        Query::MatchPhrase(HashMap::from([(
            field.into(),
            MatchPhraseQuery::Simple(text.into()),
        )]))
    }

    pub fn range(field: impl Into<String>, params: RangeParams) -> Self {
        Query::Range(HashMap::from([(field.into(), params)]))
    }

    pub fn exists(field: impl Into<String>) -> Self {
        Query::Exists(ExistsQuery {
            field: field.into(),
        })
    }

    pub fn prefix(field: impl Into<String>, value: impl Into<String>) -> Self {
        Query::Prefix(HashMap::from([(
            field.into(),
            PrefixParams::Simple(value.into()),
        )]))
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct MatchAllQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boost: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MatchQuery {
    Simple(String),
    Object {
        query: String,
        #[serde(default)]
        operator: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MatchPhraseQuery {
    Simple(String),
    Object { query: String },
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum TermValue {
    Object {
        value: Value,
        #[serde(default)]
        boost: Option<f32>,
    },
    Simple(Value),
}

impl TermValue {
    pub fn value(&self) -> &Value {
        match self {
            TermValue::Object { value, .. } | TermValue::Simple(value) => value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct RangeParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gte: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gt: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lte: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lt: Option<Value>,
}

impl RangeParams {
    pub fn gte(mut self, v: impl Into<Value>) -> Self {
        self.gte = Some(v.into());
        self
    }

    pub fn gt(mut self, v: impl Into<Value>) -> Self {
        self.gt = Some(v.into());
        self
    }

    pub fn lte(mut self, v: impl Into<Value>) -> Self {
        self.lte = Some(v.into());
        self
    }

    pub fn lt(mut self, v: impl Into<Value>) -> Self {
        self.lt = Some(v.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct BoolQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub must: Option<QueryList>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub should: Option<QueryList>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub must_not: Option<QueryList>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<QueryList>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum QueryList {
    Single(Box<Query>),
    Multiple(Vec<Query>),
}

impl QueryList {
    pub fn as_slice(&self) -> &[Query] {
        match self {
            QueryList::Single(q) => std::slice::from_ref(q.as_ref()),
            QueryList::Multiple(v) => v,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ExistsQuery {
    pub field: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum PrefixParams {
    Simple(String),
    Object { value: String },
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct IdsQuery {
    pub values: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deserialize_term_object_form() {
        let q: Query = serde_json::from_value(json!({
            "term": {"status": {"value": "active", "boost": 2.0}}
        }))
        .unwrap();
        match q {
            Query::Term(m) => {
                let t = m.get("status").unwrap();
                assert_eq!(t.value(), &json!("active"));
                assert!(matches!(t, TermValue::Object { boost: Some(_), .. }));
            }
            _ => panic!("Expected Term"),
        }
    }

    #[test]
    fn test_deserialize_bool_single_must() {
        let q: Query = serde_json::from_value(json!({
            "bool": {"must": {"term": {"risk_code": "0101"}}}
        }))
        .unwrap();
        match q {
            Query::Bool(b) => assert_eq!(b.must.unwrap().as_slice().len(), 1),
            _ => panic!("Expected Bool"),
        }
    }

    #[test]
    fn test_range_builder_serializes_bounds() {
        let q = Query::range("premium", RangeParams::default().gte(10).lt(100));
        assert_eq!(
            serde_json::to_value(&q).unwrap(),
            json!({"range": {"premium": {"gte": 10, "lt": 100}}})
        );
    }

    #[test]
    fn test_node_serializes_es_shape() {
        let node = AggregationNode::new(AggregationKind::Terms(TermsAgg {
            field: "risk_code".to_string(),
            size: Some(100),
            min_doc_count: Some(1),
        }))
        .with_sub(
            "metric",
            AggregationNode::new(AggregationKind::Sum(FieldAgg::new("premium"))),
        );

        assert_eq!(
            serde_json::to_value(&node).unwrap(),
            json!({
                "terms": {"field": "risk_code", "size": 100, "min_doc_count": 1},
                "aggs": {"metric": {"sum": {"field": "premium"}}}
            })
        );
    }

    #[test]
    fn test_node_deserializes_with_aggregations_alias() {
        let node: AggregationNode = serde_json::from_value(json!({
            "histogram": {"field": "premium", "interval": 50.0},
            "aggregations": {"n": {"value_count": {"field": "proposal_no"}}}
        }))
        .unwrap();
        assert_eq!(node.kind.type_name(), "histogram");
        assert!(node.kind.is_bucket());
        assert_eq!(node.aggs["n"].kind.field(), Some("proposal_no"));
    }

    #[test]
    fn test_request_omits_missing_query() {
        let req = AggregationRequest::new(None).with_agg(
            "metric",
            AggregationNode::new(AggregationKind::Max(FieldAgg::new("premium"))),
        );
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({"size": 0, "aggs": {"metric": {"max": {"field": "premium"}}}})
        );
    }

    #[test]
    fn test_date_interval_parse() {
        assert_eq!(
            "day".parse::<DateInterval>().unwrap(),
            DateInterval::Calendar(CalendarUnit::Day)
        );
        assert_eq!(
            "1M".parse::<DateInterval>().unwrap(),
            DateInterval::Calendar(CalendarUnit::Month)
        );
        assert_eq!("2h".parse::<DateInterval>().unwrap(), DateInterval::hours(2));
        assert_eq!(
            "90s".parse::<DateInterval>().unwrap(),
            DateInterval::Fixed(Duration::seconds(90))
        );
        assert!("2M".parse::<DateInterval>().is_err());
        assert!("0h".parse::<DateInterval>().is_err());
        assert!("h".parse::<DateInterval>().is_err());
    }

    #[test]
    fn test_date_interval_out_of_range() {
        for s in ["9999999999999h", "9999999999999d", "999999999999999m"] {
            let err = s.parse::<DateInterval>().unwrap_err();
            assert_eq!(err.error_type(), "aggregation_initialization_exception");
        }
        // Overflowing i64 is rejected by the integer parse.
        assert!("99999999999999999999ms".parse::<DateInterval>().is_err());
        assert_eq!(
            "9999999999ms".parse::<DateInterval>().unwrap(),
            DateInterval::Fixed(Duration::milliseconds(9_999_999_999))
        );
    }

    #[test]
    fn test_date_interval_display() {
        assert_eq!(DateInterval::hours(2).to_string(), "2h");
        assert_eq!(DateInterval::minutes(90).to_string(), "90m");
        assert_eq!(DateInterval::days(1).to_string(), "1d");
        assert_eq!(
            DateInterval::Calendar(CalendarUnit::Quarter).to_string(),
            "1q"
        );
        assert_eq!(
            DateInterval::Fixed(Duration::milliseconds(1500)).to_string(),
            "1500ms"
        );
    }

    #[test]
    fn test_date_histogram_agg_picks_interval_key() {
        let fixed = DateHistogramAgg::new("input_date", &DateInterval::hours(2));
        assert_eq!(fixed.fixed_interval.as_deref(), Some("2h"));
        assert!(fixed.calendar_interval.is_none());
        assert_eq!(fixed.interval().unwrap(), DateInterval::hours(2));

        let cal = DateHistogramAgg::new(
            "input_date",
            &DateInterval::Calendar(CalendarUnit::Month),
        );
        assert_eq!(cal.calendar_interval.as_deref(), Some("1M"));
    }
}
