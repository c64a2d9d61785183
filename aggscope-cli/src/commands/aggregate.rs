use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use std::collections::BTreeMap;

use aggscope::{
    AggregationRequest, AggregationService, DateInterval, MetricOperator, NamedFilter, Query,
    Target,
};

use crate::TargetArgs;

fn target(args: &TargetArgs) -> Target {
    Target::entity(args.entity.as_str()).with_indices(args.indices.iter().cloned())
}

fn parse_filter(args: &TargetArgs) -> Result<Option<Query>> {
    args.filter
        .as_deref()
        .map(|s| serde_json::from_str::<Query>(s).with_context(|| format!("Invalid --filter '{}'", s)))
        .transpose()
}

fn parse_op(op: &str) -> Result<MetricOperator> {
    Ok(op.parse::<MetricOperator>()?)
}

pub async fn run_metric(
    service: &AggregationService,
    args: &TargetArgs,
    field: &str,
    op: &str,
    buckets: &[String],
) -> Result<Value> {
    let op = parse_op(op)?;
    let filter = parse_filter(args)?;
    let target = target(args);

    let value = match buckets {
        [] => serde_json::to_value(service.metric(field, op, filter.as_ref(), &target).await?)?,
        [bucket] => {
            let map = service
                .metric_by_bucket(bucket, field, op, filter.as_ref(), &target)
                .await?;
            serde_json::to_value(map.into_iter().collect::<BTreeMap<_, _>>())?
        }
        [outer, inner] => serde_json::to_value(
            service
                .drill_down([outer.as_str(), inner.as_str()], field, op, filter.as_ref(), &target)
                .await?,
        )?,
        _ => bail!("at most two --bucket fields are supported, got {}", buckets.len()),
    };
    Ok(value)
}

pub async fn run_stats(
    service: &AggregationService,
    args: &TargetArgs,
    field: &str,
    bucket: Option<&str>,
) -> Result<Value> {
    let filter = parse_filter(args)?;
    let target = target(args);
    let value = match bucket {
        None => serde_json::to_value(service.stats(field, filter.as_ref(), &target).await?)?,
        Some(bucket) => {
            let map = service
                .stats_by_bucket(bucket, field, filter.as_ref(), &target)
                .await?;
            serde_json::to_value(map.into_iter().collect::<BTreeMap<_, _>>())?
        }
    };
    Ok(value)
}

pub async fn run_cardinality(
    service: &AggregationService,
    args: &TargetArgs,
    field: &str,
) -> Result<Value> {
    let filter = parse_filter(args)?;
    let count = service
        .cardinality(field, filter.as_ref(), &target(args))
        .await?;
    Ok(Value::from(count))
}

pub async fn run_percentiles(
    service: &AggregationService,
    args: &TargetArgs,
    field: &str,
    percents: &[f64],
) -> Result<Value> {
    let filter = parse_filter(args)?;
    let percents = (!percents.is_empty()).then_some(percents);
    let result = service
        .percentiles(field, percents, filter.as_ref(), &target(args))
        .await?;
    Ok(serde_json::to_value(result)?)
}

pub async fn run_ranks(
    service: &AggregationService,
    args: &TargetArgs,
    field: &str,
    values: &[f64],
) -> Result<Value> {
    let filter = parse_filter(args)?;
    let result = service
        .percentile_ranks(field, values, filter.as_ref(), &target(args))
        .await?;
    Ok(serde_json::to_value(result)?)
}

pub async fn run_filters(
    service: &AggregationService,
    args: &TargetArgs,
    field: &str,
    op: &str,
    named: &[String],
) -> Result<Value> {
    let op = parse_op(op)?;
    let filter = parse_filter(args)?;

    let mut filters = Vec::with_capacity(named.len());
    for entry in named {
        let (name, json) = entry
            .split_once('=')
            .ok_or_else(|| anyhow!("expected NAME=JSON, got '{}'", entry))?;
        let query: Query = serde_json::from_str(json)
            .with_context(|| format!("Invalid filter for '{}'", name))?;
        filters.push(NamedFilter::new(name, query));
    }

    let map = service
        .filter_aggregation(&filters, field, op, filter.as_ref(), &target(args))
        .await?;
    Ok(serde_json::to_value(map.into_iter().collect::<BTreeMap<_, _>>())?)
}

pub async fn run_histogram(
    service: &AggregationService,
    args: &TargetArgs,
    field: &str,
    op: &str,
    bucket: &str,
    interval: f64,
) -> Result<Value> {
    let op = parse_op(op)?;
    let filter = parse_filter(args)?;
    let buckets = service
        .histogram(bucket, interval, field, op, filter.as_ref(), &target(args))
        .await?;
    Ok(serde_json::to_value(buckets)?)
}

pub async fn run_date_histogram(
    service: &AggregationService,
    args: &TargetArgs,
    field: &str,
    op: &str,
    bucket: &str,
    interval: &str,
) -> Result<Value> {
    let op = parse_op(op)?;
    let interval: DateInterval = interval.parse()?;
    let filter = parse_filter(args)?;
    let buckets = service
        .date_histogram(bucket, interval, field, op, filter.as_ref(), &target(args))
        .await?;
    Ok(serde_json::to_value(buckets)?)
}

pub async fn run_raw(
    service: &AggregationService,
    entity: &str,
    indices: &[String],
    request: &str,
) -> Result<Value> {
    let body = match request.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read request from {}", path))?,
        None => request.to_string(),
    };
    let request: AggregationRequest =
        serde_json::from_str(&body).context("Invalid aggregation request")?;

    let target = Target::entity(entity).with_indices(indices.iter().cloned());
    let response = service.raw(&request, &target).await?;
    Ok(serde_json::to_value(response)?)
}
