//! Report queries
//!
//! Each report issues one or more bound queries through the
//! [`QueryExecutor`], turns bucket timestamps into epoch nanoseconds and
//! merges sibling result sets with the helpers in [`merge`].

pub mod merge;
pub mod model;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::debug;

use crate::config::TableNames;
use crate::executor::QueryExecutor;
use crate::job::SPAN_KIND_SERVER;
use crate::params::{
    Aggregation, ServiceOverviewParams, ServicesParams, SpanAggregatesParams, SpanFilter, SpanSearchParams,
    TopEndpointsParams, UsageParams,
};
use crate::query::QueryBuilder;
use crate::store::Param;
use crate::time::{parse_store_datetime, to_epoch_nanos};
use crate::{Error, Result};

use merge::{BucketCounts, BucketKey};
use model::*;

/// Span kind of the calling side of a call
pub const SPAN_KIND_CLIENT: i64 = 3;

/// Condition selecting erroring spans
const ERROR_STATUS: &str = "(statusCode >= 500 OR statusCode = 2)";

const SPAN_COLUMNS: [&str; 9] = [
    "__time",
    "SpanId",
    "TraceId",
    "ServiceName",
    "Name",
    "Kind",
    "DurationNano",
    "TagsKeys",
    "TagsValues",
];

pub struct MetricsAggregationEngine {
    executor: Arc<QueryExecutor>,
    tables: TableNames,
}

/// Rollup rows are bucketed by the second
fn rollup_time(time: DateTime<Utc>) -> Param {
    Param::DateTime(time.timestamp())
}

/// Detail rows carry nanosecond timestamps
fn detail_time(time: DateTime<Utc>) -> Param {
    Param::DateTime64(to_epoch_nanos(time))
}

/// Epoch nanos of a bucket or span timestamp as the store renders it
fn bucket_nanos(time: &str) -> Result<i64> {
    parse_store_datetime(time)
        .map(to_epoch_nanos)
        .ok_or_else(|| Error::Decode(format!("unreadable bucket time '{}'", time)))
}

impl MetricsAggregationEngine {
    pub fn new(executor: Arc<QueryExecutor>, tables: TableNames) -> Self {
        Self { executor, tables }
    }

    async fn fetch<T: serde::de::DeserializeOwned>(&self, query: QueryBuilder) -> Result<Vec<T>> {
        let (sql, params) = query.build();
        debug!(query = %sql, params = params.len(), "running report query");
        self.executor.select(&sql, &params).await
    }

    /// Latency, calls, errors and 4xx per service over the whole range
    pub async fn services(&self, params: &ServicesParams) -> Result<Vec<ServiceItem>> {
        let range = vec![rollup_time(params.start), rollup_time(params.end)];
        let aggregated = &self.tables.aggregated;

        let mut primary = QueryBuilder::new(format!(
            "SELECT serviceName, quantileMerge(0.99)(quantile) AS p99, avgMerge(avg) AS avgDuration, \
             sum(count) AS numCalls FROM {} WHERE timestamp >= ? AND timestamp <= ?",
            aggregated
        ));
        primary.bind_all("", range.clone());
        primary
            .bind(" AND kind = ?", SPAN_KIND_SERVER)
            .push(" GROUP BY serviceName ORDER BY p99 DESC");
        let rows: Vec<ServiceRow> = self.fetch(primary).await?;

        let errors = self
            .count_by_service(range.clone(), &format!(" AND {}", ERROR_STATUS))
            .await?;
        let four_xx = self
            .count_by_service(range, " AND statusCode >= 400 AND statusCode < 500")
            .await?;

        let mut items: Vec<ServiceItem> = rows
            .into_iter()
            .map(|row| ServiceItem {
                service_name: row.service_name,
                p99: row.p99,
                avg_duration: row.avg_duration,
                num_calls: row.num_calls,
                call_rate: 0.0,
                num_errors: 0,
                error_rate: 0.0,
                num_4xx: 0,
                four_xx_rate: 0.0,
            })
            .collect();
        merge::merge_services(&mut items, &errors, &four_xx, params.period_secs() as f64);
        Ok(items)
    }

    async fn count_by_service(&self, range: Vec<Param>, condition: &str) -> Result<HashMap<String, u64>> {
        let mut query = QueryBuilder::new(format!(
            "SELECT serviceName AS key, sum(count) AS count FROM {} WHERE timestamp >= ? AND timestamp <= ?",
            self.tables.aggregated
        ));
        query.bind_all("", range);
        query
            .bind(" AND kind = ?", SPAN_KIND_SERVER)
            .push(condition)
            .push(" GROUP BY serviceName");
        let rows: Vec<KeyedCountRow> = self.fetch(query).await?;
        Ok(rows.into_iter().map(|row| (row.key, row.count)).collect())
    }

    /// Services seen during the last day
    pub async fn services_list(&self) -> Result<Vec<String>> {
        let query = QueryBuilder::new(format!(
            "SELECT DISTINCT serviceName AS name FROM {} WHERE toDate(timestamp) > now() - INTERVAL 1 DAY",
            self.tables.aggregated
        ));
        let rows: Vec<NameRow> = self.fetch(query).await?;
        Ok(rows.into_iter().map(|row| row.name).collect())
    }

    /// Start of a per-service bucketed rollup query, up to the `WHERE` range
    fn service_buckets(&self, select: &str, params: &ServiceOverviewParams, kind: i64) -> QueryBuilder {
        let mut query = QueryBuilder::default();
        query.bind(
            "SELECT toStartOfInterval(timestamp, toIntervalMinute(?)) AS time, ",
            Param::UInt(params.step_minutes()),
        );
        query.push(select).push(&format!(" FROM {} WHERE", self.tables.aggregated));
        query
            .bind_all(
                " timestamp >= ? AND timestamp <= ?",
                vec![rollup_time(params.start), rollup_time(params.end)],
            )
            .bind(" AND serviceName = ?", params.service.as_str())
            .bind(" AND kind = ?", kind);
        query
    }

    /// Latency quantiles, calls and errors per bucket for one service
    pub async fn service_overview(&self, params: &ServiceOverviewParams) -> Result<Vec<ServiceOverviewItem>> {
        let mut primary = self.service_buckets(
            "quantileMerge(0.99)(quantile) AS p99, quantileMerge(0.95)(quantile) AS p95, \
             quantileMerge(0.50)(quantile) AS p50, sum(count) AS numCalls",
            params,
            SPAN_KIND_SERVER,
        );
        primary.push(" GROUP BY time ORDER BY time DESC");
        let rows: Vec<OverviewRow> = self.fetch(primary).await?;

        let mut secondary = self.service_buckets("sum(count) AS count", params, SPAN_KIND_SERVER);
        secondary
            .push(&format!(" AND {}", ERROR_STATUS))
            .push(" GROUP BY time ORDER BY time DESC");
        let errors = self.bucket_counts(secondary).await?;

        let mut items = rows
            .into_iter()
            .map(|row| {
                Ok(ServiceOverviewItem {
                    timestamp: bucket_nanos(&row.time)?,
                    p50: row.p50,
                    p95: row.p95,
                    p99: row.p99,
                    num_calls: row.num_calls,
                    call_rate: 0.0,
                    num_errors: 0,
                    error_rate: 0.0,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        merge::merge_overview(&mut items, &errors, params.step_secs);
        Ok(items)
    }

    async fn bucket_counts(&self, query: QueryBuilder) -> Result<BucketCounts> {
        let rows: Vec<BucketCountRow> = self.fetch(query).await?;
        rows.into_iter()
            .map(|row| Ok((BucketKey::with_dimension(bucket_nanos(&row.time)?, row.key), row.count)))
            .collect()
    }

    /// Database calls per bucket and database system
    pub async fn db_overview(&self, params: &ServiceOverviewParams) -> Result<Vec<ServiceDbOverviewItem>> {
        let mut query = self.service_buckets(
            "avgMerge(avg) AS avgDuration, sum(count) AS numCalls, dbSystem",
            params,
            SPAN_KIND_CLIENT,
        );
        query.push(" AND dbName IS NOT NULL GROUP BY time, dbSystem ORDER BY time DESC");
        let rows: Vec<DbOverviewRow> = self.fetch(query).await?;

        rows.into_iter()
            .map(|row| {
                Ok(ServiceDbOverviewItem {
                    timestamp: bucket_nanos(&row.time)?,
                    db_system: row.db_system,
                    avg_duration: row.avg_duration,
                    num_calls: row.num_calls,
                    call_rate: merge::per_second(row.num_calls, params.step_secs as f64),
                })
            })
            .collect()
    }

    /// Average duration of external calls per bucket
    pub async fn external_avg_duration(&self, params: &ServiceOverviewParams) -> Result<Vec<ServiceExternalItem>> {
        let mut query = self.service_buckets("avgMerge(avg) AS avgDuration", params, SPAN_KIND_CLIENT);
        query.push(" AND externalHttpUrl IS NOT NULL GROUP BY time ORDER BY time DESC");
        let rows: Vec<ExternalRow> = self.fetch(query).await?;
        self.external_items(rows, params.step_secs)
    }

    /// Error rate of external calls per bucket and URL
    pub async fn external_errors(&self, params: &ServiceOverviewParams) -> Result<Vec<ServiceExternalItem>> {
        let mut errors_query = self.service_buckets(
            "sum(count) AS count, externalHttpUrl AS key",
            params,
            SPAN_KIND_CLIENT,
        );
        errors_query
            .push(&format!(" AND externalHttpUrl IS NOT NULL AND {}", ERROR_STATUS))
            .push(" GROUP BY time, externalHttpUrl ORDER BY time DESC");
        let errors = self.bucket_counts(errors_query).await?;

        let mut totals = QueryBuilder::default();
        totals.bind(
            "SELECT toStartOfInterval(timestamp, toIntervalMinute(?)) AS time, ",
            Param::UInt(params.step_minutes()),
        );
        totals
            .push(&format!(
                "avg(durationNano) AS avgDuration, count(1) AS numCalls, externalHttpUrl FROM {} WHERE",
                self.tables.final_spans
            ))
            .bind(" serviceName = ?", params.service.as_str())
            .bind_all(
                " AND timestamp >= ? AND timestamp <= ?",
                vec![detail_time(params.start), detail_time(params.end)],
            )
            .bind(" AND kind = ?", SPAN_KIND_CLIENT)
            .push(" AND externalHttpUrl IS NOT NULL GROUP BY time, externalHttpUrl ORDER BY time DESC");
        let rows: Vec<ExternalRow> = self.fetch(totals).await?;

        let mut items = self.external_items(rows, params.step_secs)?;
        merge::merge_external_errors(&mut items, &errors);
        Ok(items)
    }

    /// Average duration and calls of external calls per bucket and URL
    pub async fn external(&self, params: &ServiceOverviewParams) -> Result<Vec<ServiceExternalItem>> {
        let mut query = self.service_buckets(
            "avgMerge(avg) AS avgDuration, sum(count) AS numCalls, externalHttpUrl",
            params,
            SPAN_KIND_CLIENT,
        );
        query.push(" AND externalHttpUrl IS NOT NULL GROUP BY time, externalHttpUrl ORDER BY time DESC");
        let rows: Vec<ExternalRow> = self.fetch(query).await?;
        self.external_items(rows, params.step_secs)
    }

    fn external_items(&self, rows: Vec<ExternalRow>, step_secs: u64) -> Result<Vec<ServiceExternalItem>> {
        rows.into_iter()
            .map(|row| {
                Ok(ServiceExternalItem {
                    timestamp: bucket_nanos(&row.time)?,
                    external_http_url: row.external_http_url,
                    avg_duration: row.avg_duration,
                    num_calls: row.num_calls,
                    call_rate: merge::per_second(row.num_calls, step_secs as f64),
                    num_errors: 0,
                    error_rate: 0.0,
                })
            })
            .collect()
    }

    /// Latency quantiles and calls per operation of one service
    pub async fn top_endpoints(&self, params: &TopEndpointsParams) -> Result<Vec<TopEndpointsItem>> {
        let mut query = QueryBuilder::new(format!(
            "SELECT quantileMerge(0.5)(quantile) AS p50, quantileMerge(0.95)(quantile) AS p95, \
             quantileMerge(0.99)(quantile) AS p99, sum(count) AS numCalls, name FROM {} WHERE",
            self.tables.aggregated
        ));
        query
            .bind_all(
                " timestamp >= ? AND timestamp <= ?",
                vec![rollup_time(params.start), rollup_time(params.end)],
            )
            .bind(" AND kind = ?", SPAN_KIND_SERVER)
            .bind(" AND serviceName = ?", params.service.as_str())
            .push(" GROUP BY name");
        self.fetch(query).await
    }

    /// Promoted span counts per hour bucket, optionally for one service
    pub async fn usage(&self, params: &UsageParams) -> Result<Vec<UsageItem>> {
        let mut query = QueryBuilder::default();
        query.bind(
            "SELECT toStartOfInterval(timestamp, toIntervalHour(?)) AS time, ",
            Param::UInt(params.step_hours),
        );
        query
            .push(&format!("count(1) AS count FROM {} WHERE", self.tables.final_spans))
            .bind_all(
                " timestamp >= ? AND timestamp <= ?",
                vec![detail_time(params.start), detail_time(params.end)],
            );
        if let Some(service) = &params.service {
            query.bind(" AND serviceName = ?", service.as_str());
        }
        query.push(" GROUP BY time ORDER BY time ASC");

        let rows: Vec<BucketCountRow> = self.fetch(query).await?;
        rows.into_iter()
            .map(|row| {
                Ok(UsageItem {
                    timestamp: bucket_nanos(&row.time)?,
                    count: row.count,
                })
            })
            .collect()
    }

    /// Operation names of one service seen during the last day
    pub async fn operations(&self, service: &str) -> Result<Vec<String>> {
        if service.is_empty() {
            return Err(Error::Validation("service param not found".to_string()));
        }
        let mut query = QueryBuilder::new(format!("SELECT DISTINCT name FROM {} WHERE", self.tables.aggregated));
        query
            .bind(" serviceName = ?", service)
            .push(" AND toDate(timestamp) > now() - INTERVAL 1 DAY");
        let rows: Vec<NameRow> = self.fetch(query).await?;
        Ok(rows.into_iter().map(|row| row.name).collect())
    }

    /// Tag keys of one service seen during the last day
    pub async fn tags(&self, service: &str) -> Result<Vec<TagItem>> {
        let mut query = QueryBuilder::new(format!(
            "SELECT DISTINCT arrayJoin(tagsKeys) AS tagKeys FROM {} WHERE",
            self.tables.aggregated
        ));
        query
            .bind(" serviceName = ?", service)
            .push(" AND toDate(timestamp) > now() - INTERVAL 1 DAY");
        self.fetch(query).await
    }

    /// Newest promoted spans matching the filters, one page at a time
    pub async fn search_spans(&self, params: &SpanSearchParams) -> Result<SpanTable> {
        let mut query = QueryBuilder::new(format!(
            "SELECT timestamp, spanID, traceID, serviceName, name, kind, durationNano, tagsKeys, tagsValues \
             FROM {} WHERE",
            self.tables.final_spans
        ));
        query.bind_all(
            " timestamp >= ? AND timestamp <= ?",
            vec![detail_time(params.start), detail_time(params.end)],
        );
        apply_span_filter(&mut query, &params.filter, true);
        query.bind_all(
            " ORDER BY timestamp DESC LIMIT ? OFFSET ?",
            vec![Param::UInt(params.limit), Param::UInt(params.offset)],
        );

        let rows: Vec<SpanRow> = self.fetch(query).await?;
        span_table(rows, false)
    }

    /// Every span of one trace, references included
    pub async fn trace(&self, trace_id: &str) -> Result<SpanTable> {
        if trace_id.is_empty() {
            return Err(Error::Validation("traceID param not found".to_string()));
        }
        let mut query = QueryBuilder::new(format!(
            "SELECT timestamp, spanID, traceID, serviceName, name, kind, durationNano, tagsKeys, tagsValues, \
             references FROM {} WHERE",
            self.tables.final_spans
        ));
        query.bind(" traceID = ?", trace_id);

        let rows: Vec<SpanRow> = self.fetch(query).await?;
        span_table(rows, true)
    }

    /// One aggregate value per bucket
    pub async fn span_aggregates(&self, params: &SpanAggregatesParams) -> Result<Vec<SpanAggregateItem>> {
        let value = match params.aggregation {
            Aggregation::Count | Aggregation::RatePerSec => "sum(count)",
            Aggregation::Avg => "avgMerge(avg)",
            Aggregation::P50 => "quantileMerge(0.50)(quantile)",
            Aggregation::P95 => "quantileMerge(0.95)(quantile)",
            Aggregation::P99 => "quantileMerge(0.99)(quantile)",
        };

        let mut query = QueryBuilder::default();
        query.bind(
            "SELECT toStartOfInterval(timestamp, toIntervalMinute(?)) AS time, ",
            Param::UInt(params.step_minutes()),
        );
        query
            .push(&format!("{} AS value FROM {} WHERE", value, self.tables.aggregated))
            .bind_all(
                " timestamp >= ? AND timestamp <= ?",
                vec![rollup_time(params.start), rollup_time(params.end)],
            );
        apply_span_filter(&mut query, &params.filter, false);
        query.push(" GROUP BY time ORDER BY time");

        let rows: Vec<ValueRow> = self.fetch(query).await?;
        rows.into_iter()
            .map(|row| {
                let value = if params.aggregation == Aggregation::RatePerSec {
                    row.value / params.step_secs as f64
                } else {
                    row.value
                };
                Ok(SpanAggregateItem {
                    timestamp: bucket_nanos(&row.time)?,
                    value,
                })
            })
            .collect()
    }
}

/// Conditions on span attributes. The rollup table has no per-span duration
/// or tag values, so `detail` adds those only for the final table.
fn apply_span_filter(query: &mut QueryBuilder, filter: &SpanFilter, detail: bool) {
    if let Some(service) = &filter.service {
        query.bind(" AND serviceName = ?", service.as_str());
    }
    if let Some(operation) = &filter.operation {
        query.bind(" AND name = ?", operation.as_str());
    }
    if let Some(kind) = filter.kind {
        query.bind(" AND kind = ?", kind);
    }
    if !detail {
        return;
    }
    if let Some(min) = filter.min_duration_nanos {
        query.bind(" AND durationNano >= ?", min);
    }
    if let Some(max) = filter.max_duration_nanos {
        query.bind(" AND durationNano <= ?", max);
    }
    for tag in &filter.tags {
        tag.apply(query);
    }
}

fn span_table(rows: Vec<SpanRow>, with_references: bool) -> Result<SpanTable> {
    let mut columns: Vec<String> = SPAN_COLUMNS.iter().map(|c| c.to_string()).collect();
    if with_references {
        columns.push("References".to_string());
    }

    let events = rows
        .into_iter()
        .map(|row| {
            let mut event: Vec<Value> = vec![
                json!(bucket_nanos(&row.timestamp)?),
                json!(row.span_id),
                json!(row.trace_id),
                json!(row.service_name),
                json!(row.name),
                json!(row.kind),
                json!(row.duration_nano),
                json!(row.tags_keys),
                json!(row.tags_values),
            ];
            if with_references {
                event.push(row.references.unwrap_or(Value::Null));
            }
            Ok(event)
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(SpanTable { columns, events })
}
