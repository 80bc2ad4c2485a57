//! Row shapes read from the store and the report items built from them

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::de;

// ============================================================================
// Store rows
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ServiceRow {
    #[serde(deserialize_with = "de::string_or_default")]
    pub service_name: String,
    #[serde(deserialize_with = "de::f64_lenient")]
    pub p99: f64,
    #[serde(deserialize_with = "de::f64_lenient")]
    pub avg_duration: f64,
    #[serde(deserialize_with = "de::u64_lenient")]
    pub num_calls: u64,
}

/// A count grouped by one string dimension
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct KeyedCountRow {
    #[serde(deserialize_with = "de::string_or_default")]
    pub key: String,
    #[serde(deserialize_with = "de::u64_lenient")]
    pub count: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct OverviewRow {
    #[serde(deserialize_with = "de::string_or_default")]
    pub time: String,
    #[serde(deserialize_with = "de::f64_lenient")]
    pub p50: f64,
    #[serde(deserialize_with = "de::f64_lenient")]
    pub p95: f64,
    #[serde(deserialize_with = "de::f64_lenient")]
    pub p99: f64,
    #[serde(deserialize_with = "de::u64_lenient")]
    pub num_calls: u64,
}

/// A count per time bucket, optionally split by one string dimension
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct BucketCountRow {
    #[serde(deserialize_with = "de::string_or_default")]
    pub time: String,
    #[serde(default, deserialize_with = "de::string_or_default")]
    pub key: String,
    #[serde(deserialize_with = "de::u64_lenient")]
    pub count: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DbOverviewRow {
    #[serde(deserialize_with = "de::string_or_default")]
    pub time: String,
    #[serde(deserialize_with = "de::f64_lenient")]
    pub avg_duration: f64,
    #[serde(deserialize_with = "de::u64_lenient")]
    pub num_calls: u64,
    #[serde(default, deserialize_with = "de::string_or_default")]
    pub db_system: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ExternalRow {
    #[serde(deserialize_with = "de::string_or_default")]
    pub time: String,
    #[serde(deserialize_with = "de::f64_lenient")]
    pub avg_duration: f64,
    #[serde(default, deserialize_with = "de::u64_lenient")]
    pub num_calls: u64,
    #[serde(default, deserialize_with = "de::string_or_default")]
    pub external_http_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ValueRow {
    #[serde(deserialize_with = "de::string_or_default")]
    pub time: String,
    #[serde(deserialize_with = "de::f64_lenient")]
    pub value: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct NameRow {
    #[serde(deserialize_with = "de::string_or_default")]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SpanRow {
    #[serde(deserialize_with = "de::string_or_default")]
    pub timestamp: String,
    #[serde(rename = "spanID", deserialize_with = "de::string_or_default")]
    pub span_id: String,
    #[serde(rename = "traceID", deserialize_with = "de::string_or_default")]
    pub trace_id: String,
    #[serde(deserialize_with = "de::string_or_default")]
    pub service_name: String,
    #[serde(deserialize_with = "de::string_or_default")]
    pub name: String,
    #[serde(deserialize_with = "de::i64_lenient")]
    pub kind: i64,
    #[serde(deserialize_with = "de::u64_lenient")]
    pub duration_nano: u64,
    #[serde(default)]
    pub tags_keys: Vec<String>,
    #[serde(default)]
    pub tags_values: Vec<String>,
    #[serde(default)]
    pub references: Option<Value>,
}

// ============================================================================
// Report items
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceItem {
    pub service_name: String,
    pub p99: f64,
    pub avg_duration: f64,
    pub num_calls: u64,
    pub call_rate: f64,
    pub num_errors: u64,
    pub error_rate: f64,
    #[serde(rename = "num4XX")]
    pub num_4xx: u64,
    #[serde(rename = "fourXXRate")]
    pub four_xx_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceOverviewItem {
    pub timestamp: i64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub num_calls: u64,
    pub call_rate: f64,
    pub num_errors: u64,
    pub error_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDbOverviewItem {
    pub timestamp: i64,
    pub db_system: String,
    pub avg_duration: f64,
    pub num_calls: u64,
    pub call_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceExternalItem {
    pub timestamp: i64,
    pub external_http_url: String,
    pub avg_duration: f64,
    pub num_calls: u64,
    pub call_rate: f64,
    pub num_errors: u64,
    pub error_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopEndpointsItem {
    #[serde(deserialize_with = "de::string_or_default")]
    pub name: String,
    #[serde(deserialize_with = "de::f64_lenient")]
    pub p50: f64,
    #[serde(deserialize_with = "de::f64_lenient")]
    pub p95: f64,
    #[serde(deserialize_with = "de::f64_lenient")]
    pub p99: f64,
    #[serde(deserialize_with = "de::u64_lenient")]
    pub num_calls: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageItem {
    pub timestamp: i64,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagItem {
    #[serde(deserialize_with = "de::string_or_default")]
    pub tag_keys: String,
}

/// Spans as a column list plus one value array per span
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpanTable {
    pub columns: Vec<String>,
    pub events: Vec<Vec<Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpanAggregateItem {
    pub timestamp: i64,
    pub value: f64,
}
