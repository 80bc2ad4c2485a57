mod common;

use apm_core::params::ServicesParams;
use apm_core::store::{MockOutcome, MockStore};
use apm_core::time::to_epoch_nanos;
use apm_core::{DependencyEdge, DependencyGraphBuilder, Param, TableNames};
use chrono::{TimeZone, Utc};
use serde_json::json;

use common::{executor, PRIMARY, SECONDARY};

#[tokio::test]
async fn test_service_map_from_promoted_spans() {
    let store = MockStore::new();
    let executor = executor(&store, &[PRIMARY, SECONDARY]).await;
    store.on_select(SECONDARY, |_, _| MockOutcome::Fail("replica lagging".to_string()));
    store.on_select(PRIMARY, |_, _| {
        let spans = json!([
            {"spanID": "a", "parentSpanID": "", "serviceName": "frontend"},
            {"spanID": "b", "parentSpanID": "a", "serviceName": "cart"},
            {"spanID": "c", "parentSpanID": "a", "serviceName": "cart"},
            {"spanID": "d", "parentSpanID": "b", "serviceName": "redis"},
            {"spanID": "e", "parentSpanID": "gone", "serviceName": "search"},
            {"spanID": "f", "parentSpanID": null, "serviceName": "batch"},
        ]);
        let rows = spans
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|span| span.as_object().cloned())
            .collect();
        MockOutcome::Rows(rows)
    });

    let start = Utc.with_ymd_and_hms(2024, 3, 1, 11, 0, 0).unwrap();
    let end = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    let builder = DependencyGraphBuilder::new(executor, TableNames::default());
    let edges = builder.service_map(&ServicesParams { start, end }).await.unwrap();

    assert_eq!(
        edges,
        vec![
            DependencyEdge {
                parent: "cart".to_string(),
                child: "redis".to_string(),
                call_count: 1,
            },
            DependencyEdge {
                parent: "frontend".to_string(),
                child: "cart".to_string(),
                call_count: 2,
            },
        ]
    );

    let calls = store.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(
        calls[1].params,
        vec![
            Param::DateTime64(to_epoch_nanos(start)),
            Param::DateTime64(to_epoch_nanos(end))
        ]
    );

    let json = serde_json::to_value(&edges[1]).unwrap();
    assert_eq!(json, json!({"parent": "frontend", "child": "cart", "callCount": 2}));
}
