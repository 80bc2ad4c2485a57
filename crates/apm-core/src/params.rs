//! Report request parameters
//!
//! Raw query-string values are validated into typed parameter structs before
//! any store is contacted; every failure here is [`Error::Validation`].

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::query::TagFilter;
use crate::time::from_epoch_nanos;
use crate::{Error, Result};

/// Reported timestamps are moved back by this many seconds
pub const TIME_BUFFER_SECS: i64 = 5 * 60;

/// Span search ends this many seconds before now at the latest
pub const INGEST_BUFFER_SECS: i64 = 30;

pub const DEFAULT_LIMIT: u64 = 100;

pub type RawParams = HashMap<String, String>;

fn get<'a>(raw: &'a RawParams, name: &str) -> Option<&'a str> {
    raw.get(name).map(|v| v.trim()).filter(|v| !v.is_empty())
}

fn required<'a>(raw: &'a RawParams, name: &str) -> Result<&'a str> {
    get(raw, name).ok_or_else(|| Error::Validation(format!("{} param missing in query", name)))
}

fn epoch_nanos(raw: &RawParams, name: &str) -> Result<i64> {
    required(raw, name)?.parse::<i64>().map_err(|_| {
        Error::Validation(format!("{} param is not in correct timestamp format", name))
    })
}

/// An epoch-nanosecond timestamp, moved back by [`TIME_BUFFER_SECS`]
pub fn parse_time(raw: &RawParams, name: &str) -> Result<DateTime<Utc>> {
    Ok(from_epoch_nanos(epoch_nanos(raw, name)?) - Duration::seconds(TIME_BUFFER_SECS))
}

/// An epoch-nanosecond timestamp, pulled back by [`INGEST_BUFFER_SECS`] when
/// it is that close to `now`
pub fn parse_time_minus_buffer(raw: &RawParams, name: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let time = from_epoch_nanos(epoch_nanos(raw, name)?);
    let buffer = Duration::seconds(INGEST_BUFFER_SECS);
    if time > now - buffer {
        Ok(time - buffer)
    } else {
        Ok(time)
    }
}

fn parse_u64(raw: &RawParams, name: &str) -> Result<Option<u64>> {
    get(raw, name)
        .map(|v| {
            v.parse::<u64>()
                .map_err(|_| Error::Validation(format!("{} param is not in correct format", name)))
        })
        .transpose()
}

fn parse_i64(raw: &RawParams, name: &str) -> Result<Option<i64>> {
    get(raw, name)
        .map(|v| {
            v.parse::<i64>()
                .map_err(|_| Error::Validation(format!("{} param is not in correct format", name)))
        })
        .transpose()
}

/// Step in seconds; must cover at least one bucket of `unit` seconds
fn parse_step(raw: &RawParams, unit: u64) -> Result<u64> {
    let step = parse_u64(raw, "step")?
        .ok_or_else(|| Error::Validation("step param missing in query".to_string()))?;
    if step < unit {
        return Err(Error::Validation(format!("step must be at least {} seconds", unit)));
    }
    Ok(step)
}

fn optional(raw: &RawParams, name: &str) -> Option<String> {
    get(raw, name).map(str::to_string)
}

fn time_range(raw: &RawParams) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let start = parse_time(raw, "start")?;
    let end = parse_time(raw, "end")?;
    if end < start {
        return Err(Error::Validation("end is before start".to_string()));
    }
    Ok((start, end))
}

/// Parameters of the services report and the service map
#[derive(Debug, Clone)]
pub struct ServicesParams {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ServicesParams {
    pub fn from_query(raw: &RawParams) -> Result<Self> {
        let (start, end) = time_range(raw)?;
        Ok(Self { start, end })
    }

    /// Length of the range in whole seconds
    pub fn period_secs(&self) -> i64 {
        self.end.timestamp() - self.start.timestamp()
    }
}

/// Parameters of the per-service bucketed reports
#[derive(Debug, Clone)]
pub struct ServiceOverviewParams {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub service: String,
    pub step_secs: u64,
}

impl ServiceOverviewParams {
    pub fn from_query(raw: &RawParams) -> Result<Self> {
        let (start, end) = time_range(raw)?;
        let step_secs = parse_step(raw, 60)?;
        let service = required(raw, "service")?.to_string();
        Ok(Self {
            start,
            end,
            service,
            step_secs,
        })
    }

    pub fn step_minutes(&self) -> u64 {
        self.step_secs / 60
    }
}

#[derive(Debug, Clone)]
pub struct TopEndpointsParams {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub service: String,
}

impl TopEndpointsParams {
    pub fn from_query(raw: &RawParams) -> Result<Self> {
        let (start, end) = time_range(raw)?;
        let service = required(raw, "service")?.to_string();
        Ok(Self { start, end, service })
    }
}

#[derive(Debug, Clone)]
pub struct UsageParams {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub service: Option<String>,
    pub step_hours: u64,
}

impl UsageParams {
    pub fn from_query(raw: &RawParams) -> Result<Self> {
        let (start, end) = time_range(raw)?;
        let step_hours = parse_step(raw, 3600)? / 3600;
        Ok(Self {
            start,
            end,
            service: optional(raw, "service"),
            step_hours,
        })
    }
}

/// Span attribute filters shared by span search and span aggregates
#[derive(Debug, Clone, Default)]
pub struct SpanFilter {
    pub service: Option<String>,
    pub operation: Option<String>,
    pub kind: Option<i64>,
    pub min_duration_nanos: Option<u64>,
    pub max_duration_nanos: Option<u64>,
    pub tags: Vec<TagFilter>,
}

impl SpanFilter {
    pub fn from_query(raw: &RawParams) -> Result<Self> {
        Ok(Self {
            service: optional(raw, "service"),
            operation: optional(raw, "operation"),
            kind: parse_i64(raw, "kind")?,
            min_duration_nanos: parse_u64(raw, "minDuration")?,
            max_duration_nanos: parse_u64(raw, "maxDuration")?,
            tags: TagFilter::parse_list(get(raw, "tags").unwrap_or_default())?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SpanSearchParams {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub filter: SpanFilter,
    pub limit: u64,
    pub offset: u64,
}

impl SpanSearchParams {
    /// `limit` defaults to [`DEFAULT_LIMIT`] and may not exceed `max_limit`
    pub fn from_query(raw: &RawParams, max_limit: u64, now: DateTime<Utc>) -> Result<Self> {
        let start = parse_time(raw, "start")?;
        let end = parse_time_minus_buffer(raw, "end", now)?;

        let limit = parse_u64(raw, "limit")?.unwrap_or(DEFAULT_LIMIT);
        if limit == 0 || limit > max_limit {
            return Err(Error::Validation(format!("limit must be within 1..={}", max_limit)));
        }
        let offset = parse_u64(raw, "offset")?.unwrap_or(0);

        Ok(Self {
            start,
            end,
            filter: SpanFilter::from_query(raw)?,
            limit,
            offset,
        })
    }
}

/// What a span aggregate measures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    Count,
    RatePerSec,
    Avg,
    P50,
    P95,
    P99,
}

impl Aggregation {
    /// Validate a `dimension` / `aggregation_option` pair
    pub fn parse(dimension: &str, option: &str) -> Result<Self> {
        match (dimension, option) {
            ("calls", "count") => Ok(Aggregation::Count),
            ("calls", "rate_per_sec") => Ok(Aggregation::RatePerSec),
            ("duration", "avg") => Ok(Aggregation::Avg),
            ("duration", "p50") => Ok(Aggregation::P50),
            ("duration", "p95") => Ok(Aggregation::P95),
            ("duration", "p99") => Ok(Aggregation::P99),
            ("calls", _) | ("duration", _) => Err(Error::Validation(format!(
                "given aggregation option: {} is not allowed with dimension: {}",
                option, dimension
            ))),
            _ => Err(Error::Validation(format!(
                "given dimension: {} is not allowed in query",
                dimension
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SpanAggregatesParams {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub step_secs: u64,
    pub aggregation: Aggregation,
    pub filter: SpanFilter,
}

impl SpanAggregatesParams {
    pub fn from_query(raw: &RawParams) -> Result<Self> {
        let (start, end) = time_range(raw)?;
        let step_secs = parse_step(raw, 60)?;
        let dimension = required(raw, "dimension")?;
        let option = required(raw, "aggregation_option")?;
        Ok(Self {
            start,
            end,
            step_secs,
            aggregation: Aggregation::parse(dimension, option)?,
            filter: SpanFilter::from_query(raw)?,
        })
    }

    pub fn step_minutes(&self) -> u64 {
        self.step_secs / 60
    }
}
