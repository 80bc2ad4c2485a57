//! Service dependency map
//!
//! Spans are joined to their parents through an in-memory span id index;
//! every resolved (parent service, child service) pair is one call.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::TableNames;
use crate::executor::QueryExecutor;
use crate::params::ServicesParams;
use crate::store::{de, Param};
use crate::time::to_epoch_nanos;
use crate::Result;

/// Parent/child identity of one span
#[derive(Debug, Clone, Deserialize)]
pub struct SpanLink {
    #[serde(rename = "spanID", deserialize_with = "de::string_or_default")]
    pub span_id: String,
    #[serde(rename = "parentSpanID", default, deserialize_with = "de::string_or_default")]
    pub parent_span_id: String,
    #[serde(rename = "serviceName", deserialize_with = "de::string_or_default")]
    pub service_name: String,
}

impl SpanLink {
    pub fn new(span_id: &str, parent_span_id: &str, service_name: &str) -> Self {
        Self {
            span_id: span_id.to_string(),
            parent_span_id: parent_span_id.to_string(),
            service_name: service_name.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyEdge {
    pub parent: String,
    pub child: String,
    pub call_count: u64,
}

/// Collapse span links into service edges, ordered by parent then child.
///
/// Spans whose parent is unknown (roots, or parents outside the window) add
/// no edge.
pub fn build_edges(links: &[SpanLink]) -> Vec<DependencyEdge> {
    let services: HashMap<&str, &str> = links
        .iter()
        .map(|link| (link.span_id.as_str(), link.service_name.as_str()))
        .collect();

    let mut counts: HashMap<(&str, &str), u64> = HashMap::new();
    for link in links {
        let parent = services.get(link.parent_span_id.as_str()).copied().unwrap_or("");
        if parent.is_empty() {
            continue;
        }
        *counts.entry((parent, link.service_name.as_str())).or_insert(0) += 1;
    }

    let mut edges: Vec<DependencyEdge> = counts
        .into_iter()
        .map(|((parent, child), call_count)| DependencyEdge {
            parent: parent.to_string(),
            child: child.to_string(),
            call_count,
        })
        .collect();
    edges.sort_by(|a, b| (&a.parent, &a.child).cmp(&(&b.parent, &b.child)));
    edges
}

pub struct DependencyGraphBuilder {
    executor: Arc<QueryExecutor>,
    tables: TableNames,
}

impl DependencyGraphBuilder {
    pub fn new(executor: Arc<QueryExecutor>, tables: TableNames) -> Self {
        Self { executor, tables }
    }

    /// Service call graph of the promoted spans in the requested window
    pub async fn service_map(&self, params: &ServicesParams) -> Result<Vec<DependencyEdge>> {
        let sql = format!(
            "SELECT spanID, parentSpanID, serviceName FROM {} WHERE timestamp >= ? AND timestamp <= ?",
            self.tables.final_spans
        );
        let links: Vec<SpanLink> = self
            .executor
            .select(
                &sql,
                &[
                    Param::DateTime64(to_epoch_nanos(params.start)),
                    Param::DateTime64(to_epoch_nanos(params.end)),
                ],
            )
            .await?;

        let edges = build_edges(&links);
        debug!(spans = links.len(), edges = edges.len(), "built service map");
        Ok(edges)
    }
}
