//! Translator from aggregation specs to aggregation request trees
//!
//! Every tree has the same skeleton: up to two grouping nodes named
//! [`GROUP_AGG`] and [`SUBGROUP_AGG`], with the metric node [`METRIC_AGG`] as
//! the innermost child. The unflattener walks the same names back out.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::error::AggError;
use crate::operator::MetricOperator;
use crate::query::types::*;
use crate::Result;

/// Name of the metric node
pub const METRIC_AGG: &str = "metric";
/// Name of the outer grouping node
pub const GROUP_AGG: &str = "group";
/// Name of the inner grouping node of a drill-down
pub const SUBGROUP_AGG: &str = "subgroup";

/// Maximum grouping depth
const MAX_GROUPINGS: usize = 2;

/// Percent breakpoints used when the caller supplies none
pub const DEFAULT_PERCENTS: [f64; 7] = [1.0, 5.0, 25.0, 50.0, 75.0, 95.0, 99.0];

/// Translator settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AggregationSettings {
    /// Maximum number of buckets requested from a terms grouping
    #[serde(default = "default_terms_size")]
    pub terms_size: usize,

    #[serde(default = "default_percents")]
    pub default_percents: Vec<f64>,
}

fn default_terms_size() -> usize {
    10_000
}

fn default_percents() -> Vec<f64> {
    DEFAULT_PERCENTS.to_vec()
}

impl Default for AggregationSettings {
    fn default() -> Self {
        Self {
            terms_size: default_terms_size(),
            default_percents: default_percents(),
        }
    }
}

/// What to compute over the metric field
#[derive(Debug, Clone, PartialEq)]
pub enum MetricKind {
    Operator(MetricOperator),
    Stats,
    Cardinality,
    /// Percent breakpoints; `None` uses the configured defaults
    Percentiles(Option<Vec<f64>>),
    /// Field values whose rank is requested
    PercentileRanks(Vec<f64>),
}

impl MetricKind {
    fn max_groupings(&self) -> usize {
        match self {
            MetricKind::Operator(_) => MAX_GROUPINGS,
            MetricKind::Stats => 1,
            MetricKind::Cardinality | MetricKind::Percentiles(_) | MetricKind::PercentileRanks(_) => 0,
        }
    }

    fn label(&self) -> String {
        match self {
            MetricKind::Operator(op) => op.to_string(),
            MetricKind::Stats => "stats".to_string(),
            MetricKind::Cardinality => "cardinality".to_string(),
            MetricKind::Percentiles(_) => "percentiles".to_string(),
            MetricKind::PercentileRanks(_) => "percentile_ranks".to_string(),
        }
    }
}

/// A caller-named filter producing one bucket
#[derive(Debug, Clone, PartialEq)]
pub struct NamedFilter {
    pub name: String,
    pub query: Query,
}

impl NamedFilter {
    pub fn new(name: impl Into<String>, query: Query) -> Self {
        Self {
            name: name.into(),
            query,
        }
    }
}

/// How documents are split into buckets
#[derive(Debug, Clone, PartialEq)]
pub enum Grouping {
    /// One bucket per distinct field value
    Terms(String),
    /// Fixed-width numeric intervals
    Histogram { field: String, interval: f64 },
    /// Calendar or fixed-duration time intervals
    DateHistogram { field: String, interval: DateInterval },
    /// One bucket per named filter
    Filters(Vec<NamedFilter>),
}

impl Grouping {
    pub fn terms(field: impl Into<String>) -> Self {
        Grouping::Terms(field.into())
    }

    pub fn histogram(field: impl Into<String>, interval: f64) -> Self {
        Grouping::Histogram {
            field: field.into(),
            interval,
        }
    }

    pub fn date_histogram(field: impl Into<String>, interval: DateInterval) -> Self {
        Grouping::DateHistogram {
            field: field.into(),
            interval,
        }
    }
}

/// A fully described aggregation call.
///
/// The number of groupings fixes the result shape: none gives a scalar, one a
/// flat mapping, two a drill-down list.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationSpec {
    metric_field: String,
    metric: MetricKind,
    groupings: Vec<Grouping>,
    filter: Option<Query>,
    indices: Vec<String>,
}

impl AggregationSpec {
    pub fn new(metric_field: impl Into<String>, metric: MetricKind) -> Self {
        Self {
            metric_field: metric_field.into(),
            metric,
            groupings: Vec::new(),
            filter: None,
            indices: Vec::new(),
        }
    }

    pub fn group_by(mut self, grouping: Grouping) -> Self {
        self.groupings.push(grouping);
        self
    }

    pub fn with_filter(mut self, filter: Option<Query>) -> Self {
        self.filter = filter;
        self
    }

    /// Explicit indices overriding the entity defaults.
    pub fn with_indices(mut self, indices: Vec<String>) -> Self {
        self.indices = indices;
        self
    }

    pub fn metric_field(&self) -> &str {
        &self.metric_field
    }

    pub fn metric(&self) -> &MetricKind {
        &self.metric
    }

    pub fn groupings(&self) -> &[Grouping] {
        &self.groupings
    }

    pub fn filter(&self) -> Option<&Query> {
        self.filter.as_ref()
    }

    pub fn indices(&self) -> &[String] {
        &self.indices
    }

    pub fn depth(&self) -> usize {
        self.groupings.len()
    }
}

/// Builds aggregation request trees from [`AggregationSpec`]s
#[derive(Debug, Clone, Default)]
pub struct QueryTranslator {
    settings: AggregationSettings,
}

impl QueryTranslator {
    pub fn new(settings: AggregationSettings) -> Self {
        Self { settings }
    }

    /// Translate a spec into a request tree, rejecting malformed specs before
    /// anything is sent.
    pub fn translate(&self, spec: &AggregationSpec) -> Result<AggregationRequest> {
        self.validate(spec)?;

        let mut name = METRIC_AGG;
        let mut node = AggregationNode::new(self.metric_kind(spec));

        for (depth, grouping) in spec.groupings.iter().enumerate().rev() {
            node = AggregationNode::new(self.grouping_kind(grouping)).with_sub(name, node);
            name = if depth == 0 { GROUP_AGG } else { SUBGROUP_AGG };
        }

        Ok(AggregationRequest::new(spec.filter.clone()).with_agg(name, node))
    }

    fn metric_kind(&self, spec: &AggregationSpec) -> AggregationKind {
        let field = spec.metric_field.as_str();
        match &spec.metric {
            MetricKind::Operator(op) => op.aggregation(field),
            MetricKind::Stats => AggregationKind::Stats(FieldAgg::new(field)),
            MetricKind::Cardinality => AggregationKind::Cardinality(FieldAgg::new(field)),
            MetricKind::Percentiles(percents) => AggregationKind::Percentiles(PercentilesAgg {
                field: field.to_string(),
                percents: Some(
                    percents
                        .clone()
                        .unwrap_or_else(|| self.settings.default_percents.clone()),
                ),
            }),
            MetricKind::PercentileRanks(values) => {
                AggregationKind::PercentileRanks(PercentileRanksAgg {
                    field: field.to_string(),
                    values: values.clone(),
                })
            }
        }
    }

    fn grouping_kind(&self, grouping: &Grouping) -> AggregationKind {
        match grouping {
            Grouping::Terms(field) => AggregationKind::Terms(TermsAgg {
                field: field.clone(),
                size: Some(self.settings.terms_size),
                min_doc_count: Some(1),
            }),
            Grouping::Histogram { field, interval } => AggregationKind::Histogram(HistogramAgg {
                field: field.clone(),
                interval: *interval,
                min_doc_count: Some(1),
            }),
            Grouping::DateHistogram { field, interval } => {
                let mut agg = DateHistogramAgg::new(field.clone(), interval);
                agg.min_doc_count = Some(1);
                AggregationKind::DateHistogram(agg)
            }
            Grouping::Filters(filters) => AggregationKind::Filters(FiltersAgg {
                filters: filters
                    .iter()
                    .map(|f| (f.name.clone(), f.query.clone()))
                    .collect::<BTreeMap<_, _>>(),
            }),
        }
    }

    fn validate(&self, spec: &AggregationSpec) -> Result<()> {
        require_field("metric", &spec.metric_field)?;

        let allowed = spec.metric.max_groupings();
        if spec.groupings.len() > allowed {
            return Err(invalid(format!(
                "{} supports at most {} grouping(s), got {}",
                spec.metric.label(),
                allowed,
                spec.groupings.len()
            )));
        }

        match &spec.metric {
            MetricKind::Percentiles(percents) => {
                let percents = percents
                    .as_deref()
                    .unwrap_or(&self.settings.default_percents);
                if percents.is_empty() {
                    return Err(invalid("percentiles need at least one percent".to_string()));
                }
                if let Some(p) = percents
                    .iter()
                    .find(|p| !p.is_finite() || **p < 0.0 || **p > 100.0)
                {
                    return Err(invalid(format!("percent {} is outside [0, 100]", p)));
                }
            }
            MetricKind::PercentileRanks(values) => {
                if values.is_empty() {
                    return Err(invalid(
                        "percentile ranks need at least one value".to_string(),
                    ));
                }
                if values.iter().any(|v| !v.is_finite()) {
                    return Err(invalid("percentile rank values must be finite".to_string()));
                }
            }
            _ => {}
        }

        for grouping in &spec.groupings {
            match grouping {
                Grouping::Terms(field) => {
                    require_field("bucket", field)?;
                    if self.settings.terms_size == 0 {
                        return Err(invalid("terms size must be positive".to_string()));
                    }
                }
                Grouping::Histogram { field, interval } => {
                    require_field("bucket", field)?;
                    if !interval.is_finite() || *interval <= 0.0 {
                        return Err(invalid(format!(
                            "histogram interval must be positive, got {}",
                            interval
                        )));
                    }
                }
                Grouping::DateHistogram { field, interval } => {
                    require_field("bucket", field)?;
                    if let DateInterval::Fixed(d) = interval {
                        if d.num_milliseconds() <= 0 {
                            return Err(invalid(
                                "date histogram interval must be positive".to_string(),
                            ));
                        }
                    }
                }
                Grouping::Filters(filters) => {
                    if filters.is_empty() {
                        return Err(invalid("filters grouping needs at least one filter".to_string()));
                    }
                    let mut seen = HashSet::new();
                    for f in filters {
                        require_field("filter name", &f.name)?;
                        if !seen.insert(f.name.as_str()) {
                            return Err(invalid(format!("duplicate filter name '{}'", f.name)));
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

fn require_field(what: &str, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(invalid(format!("{} field name must not be empty", what)));
    }
    Ok(())
}

fn invalid(msg: String) -> AggError {
    AggError::InvalidAggregationSpec(msg)
}
