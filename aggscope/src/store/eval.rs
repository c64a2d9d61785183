//! Local evaluation of query filters and aggregation trees over JSON documents
//!
//! Follows Elasticsearch semantics closely enough for the aggregations the
//! translator emits: terms buckets ordered by doc count, histograms with gap
//! buckets when `min_doc_count` is 0, `null` avg/min/max over empty sets and
//! exact percentiles.

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::error::AggError;
use crate::query::translator::DEFAULT_PERCENTS;
use crate::query::types::*;
use crate::response::{AggregationOutput, BucketEntries, ResponseBucket};
use crate::Result;

/// A stored document
pub type Document = Map<String, Value>;

/// Upper bound on buckets produced by a single histogram node
const MAX_BUCKETS: usize = 65_536;

/// Default `size` of a terms aggregation
const DEFAULT_TERMS_SIZE: usize = 10;

// ============================================================================
// Filters
// ============================================================================

/// Documents of `docs` matched by `query`.
pub fn filter<'a>(query: &Query, docs: &[&'a Document]) -> Result<Vec<&'a Document>> {
    let mut matched = Vec::new();
    for doc in docs {
        if matches(query, doc)? {
            matched.push(*doc);
        }
    }
    Ok(matched)
}

/// Whether `doc` satisfies `query`.
pub fn matches(query: &Query, doc: &Document) -> Result<bool> {
    let matched = match query {
        Query::MatchAll(_) => true,
        Query::Match(fields) => all_fields(fields, |field, q| {
            let (text, operator) = match q {
                MatchQuery::Simple(text) => (text.as_str(), None),
                MatchQuery::Object { query, operator } => (query.as_str(), operator.as_deref()),
            };
            let wanted = tokens(text);
            let present: HashSet<String> = field_values(doc, field)
                .into_iter()
                .filter_map(text_of)
                .flat_map(|s| tokens(&s))
                .collect();
            match operator.map(str::to_lowercase).as_deref() {
                Some("and") => !wanted.is_empty() && wanted.iter().all(|t| present.contains(t)),
                _ => wanted.iter().any(|t| present.contains(t)),
            }
        }),
        Query::MatchPhrase(fields) => all_fields(fields, |field, q| {
            let phrase = tokens(match q {
                MatchPhraseQuery::Simple(text) | MatchPhraseQuery::Object { query: text } => text,
            });
            field_values(doc, field)
                .into_iter()
                .filter_map(text_of)
                .any(|s| contains_phrase(&tokens(&s), &phrase))
        }),
        Query::Term(fields) => all_fields(fields, |field, term| {
            field_values(doc, field)
                .into_iter()
                .any(|v| term_eq(v, term.value()))
        }),
        Query::Terms(fields) => all_fields(fields, |field, terms| {
            field_values(doc, field)
                .into_iter()
                .any(|v| terms.iter().any(|t| term_eq(v, t)))
        }),
        Query::Range(fields) => {
            for (field, params) in fields {
                if !range_matches(doc, field, params)? {
                    return Ok(false);
                }
            }
            true
        }
        Query::Bool(b) => bool_matches(b, doc)?,
        Query::Exists(e) => !field_values(doc, &e.field).is_empty(),
        Query::Prefix(fields) => all_fields(fields, |field, p| {
            let prefix = match p {
                PrefixParams::Simple(v) | PrefixParams::Object { value: v } => v.as_str(),
            };
            field_values(doc, field)
                .into_iter()
                .any(|v| matches!(v, Value::String(s) if s.starts_with(prefix)))
        }),
        Query::Ids(ids) => match doc.get("_id").and_then(text_of) {
            Some(id) => ids.values.iter().any(|v| *v == id),
            None => false,
        },
    };
    Ok(matched)
}

fn all_fields<T>(fields: &HashMap<String, T>, f: impl Fn(&str, &T) -> bool) -> bool {
    fields.iter().all(|(field, v)| f(field, v))
}

fn bool_matches(b: &BoolQuery, doc: &Document) -> Result<bool> {
    for q in slice(&b.must).iter().chain(slice(&b.filter)) {
        if !matches(q, doc)? {
            return Ok(false);
        }
    }
    for q in slice(&b.must_not) {
        if matches(q, doc)? {
            return Ok(false);
        }
    }

    // `should` is only required when there is nothing else to satisfy.
    let should = slice(&b.should);
    if should.is_empty() || !slice(&b.must).is_empty() || !slice(&b.filter).is_empty() {
        return Ok(true);
    }
    for q in should {
        if matches(q, doc)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn slice(list: &Option<QueryList>) -> &[Query] {
    list.as_ref().map(QueryList::as_slice).unwrap_or(&[])
}

fn range_matches(doc: &Document, field: &str, params: &RangeParams) -> Result<bool> {
    let bounds: [(&Option<Value>, &[Ordering]); 4] = [
        (&params.gte, &[Ordering::Greater, Ordering::Equal]),
        (&params.gt, &[Ordering::Greater]),
        (&params.lte, &[Ordering::Less, Ordering::Equal]),
        (&params.lt, &[Ordering::Less]),
    ];
    for (bound, _) in &bounds {
        if let Some(b) = bound {
            if !matches!(b, Value::Number(_) | Value::String(_)) {
                return Err(AggError::InvalidQuery(format!(
                    "range bound on '{}' must be a number or string, got {}",
                    field, b
                )));
            }
        }
    }

    Ok(field_values(doc, field).into_iter().any(|v| {
        bounds.iter().all(|(bound, accepted)| match bound {
            Some(b) => compare(v, b).is_some_and(|o| accepted.contains(&o)),
            None => true,
        })
    }))
}

fn compare(value: &Value, bound: &Value) -> Option<Ordering> {
    match (numeric(value), numeric(bound)) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => match (value, bound) {
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            _ => None,
        },
    }
}

fn term_eq(field: &Value, term: &Value) -> bool {
    match (field, term) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Value::Number(a), Value::String(b)) => b.parse::<f64>().ok() == a.as_f64(),
        (Value::String(a), Value::Number(b)) => *a == b.to_string(),
        (a, b) => a == b,
    }
}

fn tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn contains_phrase(haystack: &[String], phrase: &[String]) -> bool {
    !phrase.is_empty() && haystack.windows(phrase.len()).any(|w| w == phrase)
}

// ============================================================================
// Field access
// ============================================================================

/// Non-null values of `path`, with arrays flattened. Dotted paths descend into
/// objects when no literal key matches.
pub fn field_values<'a>(doc: &'a Document, path: &str) -> Vec<&'a Value> {
    let mut out = Vec::new();
    if let Some(v) = doc.get(path) {
        collect(v, &mut out);
        return out;
    }
    if let Some((head, rest)) = path.split_once('.') {
        match doc.get(head) {
            Some(Value::Object(inner)) => return field_values(inner, rest),
            Some(Value::Array(items)) => {
                for item in items {
                    if let Value::Object(inner) = item {
                        out.extend(field_values(inner, rest));
                    }
                }
            }
            _ => {}
        }
    }
    out
}

fn collect<'a>(v: &'a Value, out: &mut Vec<&'a Value>) {
    match v {
        Value::Null => {}
        Value::Array(items) => items.iter().for_each(|i| collect(i, out)),
        other => out.push(other),
    }
}

fn text_of(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Numeric reading of a value; dates count as epoch milliseconds.
fn numeric(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .ok()
            .or_else(|| parse_date(s).map(|d| d.timestamp_millis() as f64)),
        _ => None,
    }
}

fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    let day = NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()?;
    Some(Utc.from_utc_datetime(&day.and_hms_opt(0, 0, 0)?))
}

fn timestamp(v: &Value) -> Option<DateTime<Utc>> {
    match v {
        Value::Number(n) => Utc.timestamp_millis_opt(n.as_f64()? as i64).single(),
        Value::String(s) => parse_date(s),
        _ => None,
    }
}

fn key_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ============================================================================
// Aggregations
// ============================================================================

/// Evaluate every named node of `aggs` over `docs`.
pub fn aggregate_all(
    aggs: &BTreeMap<String, AggregationNode>,
    docs: &[&Document],
) -> Result<HashMap<String, AggregationOutput>> {
    let mut out = HashMap::with_capacity(aggs.len());
    for (name, node) in aggs {
        out.insert(name.clone(), aggregate(node, docs)?);
    }
    Ok(out)
}

/// Evaluate one aggregation node over `docs`.
pub fn aggregate(node: &AggregationNode, docs: &[&Document]) -> Result<AggregationOutput> {
    if !node.kind.is_bucket() && !node.aggs.is_empty() {
        return Err(AggError::InvalidQuery(format!(
            "{} aggregation cannot have sub-aggregations",
            node.kind.type_name()
        )));
    }

    match &node.kind {
        AggregationKind::Sum(f) => Ok(value(Some(numbers(f, docs).iter().sum()))),
        AggregationKind::Avg(f) => {
            let vals = numbers(f, docs);
            Ok(value(
                (!vals.is_empty()).then(|| vals.iter().sum::<f64>() / vals.len() as f64),
            ))
        }
        AggregationKind::Min(f) => Ok(value(numbers(f, docs).into_iter().reduce(f64::min))),
        AggregationKind::Max(f) => Ok(value(numbers(f, docs).into_iter().reduce(f64::max))),
        AggregationKind::ValueCount(f) => Ok(value(Some(raw_values(f, docs).len() as f64))),
        AggregationKind::Stats(f) => Ok(stats(&numbers(f, docs))),
        AggregationKind::Cardinality(f) => {
            let distinct: HashSet<String> =
                raw_values(f, docs).iter().map(|v| key_text(v)).collect();
            Ok(value(Some(distinct.len() as f64)))
        }
        AggregationKind::Percentiles(p) => {
            let mut vals = numbers(&FieldAgg::new(p.field.as_str()), docs);
            vals.sort_by(f64::total_cmp);
            let percents = p
                .percents
                .clone()
                .unwrap_or_else(|| DEFAULT_PERCENTS.to_vec());
            let values = percents
                .iter()
                .map(|pct| (marker(*pct), percentile(&vals, *pct)))
                .collect();
            Ok(AggregationOutput::Percentiles { values })
        }
        AggregationKind::PercentileRanks(p) => {
            let mut vals = numbers(&FieldAgg::new(p.field.as_str()), docs);
            vals.sort_by(f64::total_cmp);
            let values = p
                .values
                .iter()
                .map(|v| (marker(*v), percentile_rank(&vals, *v)))
                .collect();
            Ok(AggregationOutput::Percentiles { values })
        }
        AggregationKind::Terms(t) => terms(t, &node.aggs, docs),
        AggregationKind::Histogram(h) => histogram(h, &node.aggs, docs),
        AggregationKind::DateHistogram(d) => date_histogram(d, &node.aggs, docs),
        AggregationKind::Filters(f) => {
            let mut buckets = BTreeMap::new();
            for (name, query) in &f.filters {
                let matched = filter(query, docs)?;
                buckets.insert(name.clone(), bucket(Value::Null, &node.aggs, &matched)?);
            }
            Ok(AggregationOutput::Buckets {
                buckets: BucketEntries::Keyed(buckets),
            })
        }
    }
}

fn value(v: Option<f64>) -> AggregationOutput {
    AggregationOutput::Value { value: v }
}

fn raw_values<'a>(f: &'a FieldAgg, docs: &[&'a Document]) -> Vec<&'a Value> {
    let mut out = Vec::new();
    for doc in docs {
        let vals = field_values(doc, &f.field);
        match (&f.missing, vals.is_empty()) {
            (Some(missing), true) => out.push(missing),
            _ => out.extend(vals),
        }
    }
    out
}

fn numbers(f: &FieldAgg, docs: &[&Document]) -> Vec<f64> {
    raw_values(f, docs)
        .into_iter()
        .filter_map(numeric)
        .filter(|v| !v.is_nan())
        .collect()
}

fn stats(vals: &[f64]) -> AggregationOutput {
    let sum: f64 = vals.iter().sum();
    let count = vals.len() as u64;
    AggregationOutput::Stats {
        count,
        min: vals.iter().copied().reduce(f64::min),
        max: vals.iter().copied().reduce(f64::max),
        sum: Some(sum),
        avg: (count > 0).then(|| sum / count as f64),
    }
}

/// Percentile key as the engine renders it (`50.0`, `99.9`).
fn marker(v: f64) -> String {
    format!("{:?}", v)
}

/// Exact percentile of sorted `vals` with linear interpolation between ranks.
fn percentile(sorted: &[f64], pct: f64) -> Option<f64> {
    match sorted.len() {
        0 => None,
        1 => Some(sorted[0]),
        n => {
            let rank = (pct / 100.0).clamp(0.0, 1.0) * (n - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            Some(sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64))
        }
    }
}

/// Share of sorted `vals` at or below `v`, in percent.
fn percentile_rank(sorted: &[f64], v: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let at_or_below = sorted.partition_point(|x| *x <= v);
    Some(at_or_below as f64 * 100.0 / sorted.len() as f64)
}

fn bucket(
    key: Value,
    aggs: &BTreeMap<String, AggregationNode>,
    docs: &[&Document],
) -> Result<ResponseBucket> {
    let mut b = ResponseBucket::new(key, docs.len() as u64);
    b.sub_aggs = aggregate_all(aggs, docs)?;
    Ok(b)
}

fn terms(
    t: &TermsAgg,
    aggs: &BTreeMap<String, AggregationNode>,
    docs: &[&Document],
) -> Result<AggregationOutput> {
    let mut groups: HashMap<String, (Value, Vec<&Document>)> = HashMap::new();
    for doc in docs {
        let mut seen = HashSet::new();
        for v in field_values(doc, &t.field) {
            let text = key_text(v);
            if seen.insert(text.clone()) {
                groups
                    .entry(text)
                    .or_insert_with(|| (v.clone(), Vec::new()))
                    .1
                    .push(*doc);
            }
        }
    }

    let min_doc_count = t.min_doc_count.unwrap_or(1) as usize;
    let mut ordered: Vec<(String, Value, Vec<&Document>)> = groups
        .into_iter()
        .filter(|(_, (_, d))| d.len() >= min_doc_count)
        .map(|(text, (key, d))| (text, key, d))
        .collect();

    // Sort by count descending, then key ascending
    ordered.sort_by(|a, b| b.2.len().cmp(&a.2.len()).then_with(|| a.0.cmp(&b.0)));
    ordered.truncate(t.size.unwrap_or(DEFAULT_TERMS_SIZE));

    let mut buckets = Vec::with_capacity(ordered.len());
    for (_, key, d) in ordered {
        buckets.push(bucket(key, aggs, &d)?);
    }
    Ok(AggregationOutput::Buckets {
        buckets: BucketEntries::Vec(buckets),
    })
}

fn histogram(
    h: &HistogramAgg,
    aggs: &BTreeMap<String, AggregationNode>,
    docs: &[&Document],
) -> Result<AggregationOutput> {
    if !h.interval.is_finite() || h.interval <= 0.0 {
        return Err(AggError::InvalidQuery(format!(
            "histogram interval must be positive, got {}",
            h.interval
        )));
    }

    let mut slots: BTreeMap<i64, Vec<&Document>> = BTreeMap::new();
    for doc in docs {
        let mut seen = HashSet::new();
        for v in field_values(doc, &h.field).into_iter().filter_map(numeric) {
            let slot = (v / h.interval).floor() as i64;
            if seen.insert(slot) {
                slots.entry(slot).or_default().push(*doc);
            }
        }
    }

    let keys = fill_gaps(slots.keys().copied(), h.min_doc_count, |slot| Some(slot + 1))?;
    let min_doc_count = h.min_doc_count.unwrap_or(0) as usize;
    let mut buckets = Vec::with_capacity(keys.len());
    for slot in keys {
        let d = slots.get(&slot).map(Vec::as_slice).unwrap_or(&[]);
        if d.len() < min_doc_count {
            continue;
        }
        buckets.push(bucket(Value::from(slot as f64 * h.interval), aggs, d)?);
    }
    Ok(AggregationOutput::Buckets {
        buckets: BucketEntries::Vec(buckets),
    })
}

fn date_histogram(
    d: &DateHistogramAgg,
    aggs: &BTreeMap<String, AggregationNode>,
    docs: &[&Document],
) -> Result<AggregationOutput> {
    let interval = d.interval()?;
    let step_ms = match interval {
        DateInterval::Fixed(step) if step.num_milliseconds() <= 0 => {
            return Err(AggError::InvalidQuery(
                "date_histogram interval must be positive".to_string(),
            ))
        }
        DateInterval::Fixed(step) => step.num_milliseconds(),
        DateInterval::Calendar(_) => 0,
    };

    let floor = |ts: DateTime<Utc>| -> Option<i64> {
        match interval {
            DateInterval::Calendar(unit) => calendar_floor(unit, ts).map(|t| t.timestamp_millis()),
            DateInterval::Fixed(_) => Some(ts.timestamp_millis().div_euclid(step_ms) * step_ms),
        }
    };

    let mut slots: BTreeMap<i64, Vec<&Document>> = BTreeMap::new();
    for doc in docs {
        let mut seen = HashSet::new();
        for ts in field_values(doc, &d.field).into_iter().filter_map(timestamp) {
            let start = floor(ts).ok_or_else(|| {
                AggError::InvalidQuery(format!("cannot bucket timestamp {} of '{}'", ts, d.field))
            })?;
            if seen.insert(start) {
                slots.entry(start).or_default().push(*doc);
            }
        }
    }

    let next = |start: i64| -> Option<i64> {
        match interval {
            DateInterval::Calendar(unit) => {
                let ts = Utc.timestamp_millis_opt(start).single()?;
                calendar_next(unit, ts).map(|t| t.timestamp_millis())
            }
            DateInterval::Fixed(_) => start.checked_add(step_ms),
        }
    };

    let keys = fill_gaps(slots.keys().copied(), d.min_doc_count, next)?;
    let min_doc_count = d.min_doc_count.unwrap_or(0) as usize;
    let mut buckets = Vec::with_capacity(keys.len());
    for start in keys {
        let members = slots.get(&start).map(Vec::as_slice).unwrap_or(&[]);
        if members.len() < min_doc_count {
            continue;
        }
        let mut b = bucket(Value::from(start), aggs, members)?;
        b.key_as_string = Utc
            .timestamp_millis_opt(start)
            .single()
            .map(|t| t.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string());
        buckets.push(b);
    }
    Ok(AggregationOutput::Buckets {
        buckets: BucketEntries::Vec(buckets),
    })
}

/// Bucket keys from the first to the last populated one. Empty keys in
/// between are only produced when `min_doc_count` is 0.
fn fill_gaps(
    populated: impl Iterator<Item = i64>,
    min_doc_count: Option<u64>,
    next: impl Fn(i64) -> Option<i64>,
) -> Result<Vec<i64>> {
    let populated: Vec<i64> = populated.collect();
    if min_doc_count.unwrap_or(0) > 0 {
        return Ok(populated);
    }
    let (Some(&first), Some(&last)) = (populated.first(), populated.last()) else {
        return Ok(populated);
    };

    let mut keys = vec![first];
    let mut current = first;
    while current < last {
        current = match next(current) {
            Some(n) if n > current => n,
            _ => break,
        };
        keys.push(current);
        if keys.len() > MAX_BUCKETS {
            return Err(AggError::InvalidQuery(format!(
                "histogram would produce more than {} buckets",
                MAX_BUCKETS
            )));
        }
    }
    Ok(keys)
}

fn calendar_floor(unit: CalendarUnit, ts: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let day = ts.date_naive();
    let (date, hour, minute) = match unit {
        CalendarUnit::Minute => (day, ts.hour(), ts.minute()),
        CalendarUnit::Hour => (day, ts.hour(), 0),
        CalendarUnit::Day => (day, 0, 0),
        CalendarUnit::Week => (
            day - Duration::days(day.weekday().num_days_from_monday() as i64),
            0,
            0,
        ),
        CalendarUnit::Month => (NaiveDate::from_ymd_opt(day.year(), day.month(), 1)?, 0, 0),
        CalendarUnit::Quarter => (
            NaiveDate::from_ymd_opt(day.year(), day.month0() / 3 * 3 + 1, 1)?,
            0,
            0,
        ),
        CalendarUnit::Year => (NaiveDate::from_ymd_opt(day.year(), 1, 1)?, 0, 0),
    };
    Some(Utc.from_utc_datetime(&date.and_hms_opt(hour, minute, 0)?))
}

fn calendar_next(unit: CalendarUnit, start: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match unit {
        CalendarUnit::Minute => start.checked_add_signed(Duration::minutes(1)),
        CalendarUnit::Hour => start.checked_add_signed(Duration::hours(1)),
        CalendarUnit::Day => start.checked_add_signed(Duration::days(1)),
        CalendarUnit::Week => start.checked_add_signed(Duration::weeks(1)),
        CalendarUnit::Month => start.checked_add_months(Months::new(1)),
        CalendarUnit::Quarter => start.checked_add_months(Months::new(3)),
        CalendarUnit::Year => start.checked_add_months(Months::new(12)),
    }
}
