//! Metric operator taxonomy

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::AggError;
use crate::query::types::{AggregationKind, FieldAgg};

/// Single-value metric operators supported by the simple aggregation families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricOperator {
    Sum,
    /// Number of values of the field (`value_count`)
    Count,
    #[serde(alias = "average")]
    Avg,
    Min,
    Max,
}

impl MetricOperator {
    pub const ALL: [MetricOperator; 5] = [
        MetricOperator::Sum,
        MetricOperator::Count,
        MetricOperator::Avg,
        MetricOperator::Min,
        MetricOperator::Max,
    ];

    /// Metric node computing this operator over `field`.
    pub fn aggregation(&self, field: &str) -> AggregationKind {
        let agg = FieldAgg::new(field);
        match self {
            MetricOperator::Sum => AggregationKind::Sum(agg),
            MetricOperator::Count => AggregationKind::ValueCount(agg),
            MetricOperator::Avg => AggregationKind::Avg(agg),
            MetricOperator::Min => AggregationKind::Min(agg),
            MetricOperator::Max => AggregationKind::Max(agg),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricOperator::Sum => "sum",
            MetricOperator::Count => "count",
            MetricOperator::Avg => "avg",
            MetricOperator::Min => "min",
            MetricOperator::Max => "max",
        }
    }
}

impl fmt::Display for MetricOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricOperator {
    type Err = AggError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sum" => Ok(MetricOperator::Sum),
            "count" | "value_count" => Ok(MetricOperator::Count),
            "avg" | "average" => Ok(MetricOperator::Avg),
            "min" => Ok(MetricOperator::Min),
            "max" => Ok(MetricOperator::Max),
            other => Err(AggError::InvalidAggregationSpec(format!(
                "unknown metric operator '{}'",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operator_maps_to_engine_aggregation() {
        let names: Vec<&str> = MetricOperator::ALL
            .iter()
            .map(|op| op.aggregation("premium").type_name())
            .collect();
        assert_eq!(names, vec!["sum", "value_count", "avg", "min", "max"]);
    }

    #[test]
    fn test_aggregation_reads_given_field() {
        for op in MetricOperator::ALL {
            assert_eq!(op.aggregation("premium").field(), Some("premium"));
        }
    }

    #[test]
    fn test_parse_round_trips_display() {
        for op in MetricOperator::ALL {
            assert_eq!(op.to_string().parse::<MetricOperator>().unwrap(), op);
        }
        assert_eq!("Average".parse::<MetricOperator>().unwrap(), MetricOperator::Avg);
        assert!("median".parse::<MetricOperator>().is_err());
    }
}
