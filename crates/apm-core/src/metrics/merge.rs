//! Reconciling sibling aggregate result sets into report rows
//!
//! Secondary results are indexed by the same grouping the primary query used
//! and folded into the primary rows; a group absent from the secondary set
//! reads as zero. Rates follow float semantics, so a zero divisor yields
//! NaN or infinity instead of failing.

use std::collections::HashMap;

use super::model::{ServiceExternalItem, ServiceItem, ServiceOverviewItem};

/// Grouping of one aggregate bucket: epoch nanos plus an optional dimension
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub timestamp: i64,
    pub dimension: String,
}

impl BucketKey {
    pub fn at(timestamp: i64) -> Self {
        Self {
            timestamp,
            dimension: String::new(),
        }
    }

    pub fn with_dimension(timestamp: i64, dimension: impl Into<String>) -> Self {
        Self {
            timestamp,
            dimension: dimension.into(),
        }
    }
}

pub type BucketCounts = HashMap<BucketKey, u64>;

/// `count` per second over `seconds`
pub fn per_second(count: u64, seconds: f64) -> f64 {
    count as f64 / seconds
}

/// `errors` as a percentage of `calls`
pub fn error_percent(errors: u64, calls: u64) -> f64 {
    errors as f64 * 100.0 / calls as f64
}

/// Fold per-service error and 4xx counts in; rates are per second of the
/// whole queried range
pub fn merge_services(
    items: &mut [ServiceItem],
    errors: &HashMap<String, u64>,
    four_xx: &HashMap<String, u64>,
    period_secs: f64,
) {
    for item in items.iter_mut() {
        item.num_errors = errors.get(&item.service_name).copied().unwrap_or(0);
        item.num_4xx = four_xx.get(&item.service_name).copied().unwrap_or(0);
        item.call_rate = per_second(item.num_calls, period_secs);
        item.error_rate = per_second(item.num_errors, period_secs);
        item.four_xx_rate = per_second(item.num_4xx, period_secs);
    }
}

/// Fold per-bucket error counts into the service overview
pub fn merge_overview(items: &mut [ServiceOverviewItem], errors: &BucketCounts, step_secs: u64) {
    for item in items.iter_mut() {
        item.num_errors = errors.get(&BucketKey::at(item.timestamp)).copied().unwrap_or(0);
        item.error_rate = error_percent(item.num_errors, item.num_calls);
        item.call_rate = per_second(item.num_calls, step_secs as f64);
    }
}

/// Attach error counts per (bucket, URL) to the totals. The error rate is
/// only computed where errors were recorded; call counts are not reported.
pub fn merge_external_errors(items: &mut [ServiceExternalItem], errors: &BucketCounts) {
    for item in items.iter_mut() {
        let key = BucketKey::with_dimension(item.timestamp, item.external_http_url.as_str());
        if let Some(&num_errors) = errors.get(&key) {
            item.num_errors = num_errors;
            item.error_rate = error_percent(num_errors, item.num_calls);
        }
        item.num_calls = 0;
        item.call_rate = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overview(timestamp: i64, num_calls: u64) -> ServiceOverviewItem {
        ServiceOverviewItem {
            timestamp,
            p50: 1.0,
            p95: 2.0,
            p99: 3.0,
            num_calls,
            call_rate: 0.0,
            num_errors: 0,
            error_rate: 0.0,
        }
    }

    #[test]
    fn test_rates() {
        assert!((per_second(100, 60.0) - 1.6667).abs() < 1e-3);
        assert_eq!(error_percent(10, 100), 10.0);
        assert!(error_percent(0, 0).is_nan());
        assert!(per_second(5, 0.0).is_infinite());
    }

    #[test]
    fn test_overview_merge_matches_buckets() {
        let mut items = vec![overview(1000, 50), overview(2000, 40)];
        let errors: BucketCounts = [(BucketKey::at(1000), 5)].into_iter().collect();

        merge_overview(&mut items, &errors, 60);

        assert_eq!(items[0].num_errors, 5);
        assert_eq!(items[0].error_rate, 10.0);
        assert_eq!(items[1].num_errors, 0);
        assert_eq!(items[1].error_rate, 0.0);
        assert!((items[1].call_rate - 40.0 / 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_services_merge_keeps_4xx_apart() {
        let mut items = vec![ServiceItem {
            service_name: "frontend".to_string(),
            p99: 0.0,
            avg_duration: 0.0,
            num_calls: 600,
            call_rate: 0.0,
            num_errors: 0,
            error_rate: 0.0,
            num_4xx: 0,
            four_xx_rate: 0.0,
        }];
        let errors = [("frontend".to_string(), 6)].into_iter().collect();
        let four_xx = [("frontend".to_string(), 60)].into_iter().collect();

        merge_services(&mut items, &errors, &four_xx, 600.0);

        assert_eq!(items[0].num_errors, 6);
        assert_eq!(items[0].num_4xx, 60);
        assert_eq!(items[0].call_rate, 1.0);
        assert_eq!(items[0].error_rate, 0.01);
        assert_eq!(items[0].four_xx_rate, 0.1);
    }

    #[test]
    fn test_external_errors_keyed_by_url() {
        let total = |url: &str| ServiceExternalItem {
            timestamp: 1000,
            external_http_url: url.to_string(),
            avg_duration: 12.0,
            num_calls: 20,
            call_rate: 0.0,
            num_errors: 0,
            error_rate: 0.0,
        };
        let mut items = vec![total("http://billing"), total("http://search")];
        let errors: BucketCounts = [(BucketKey::with_dimension(1000, "http://billing"), 5)]
            .into_iter()
            .collect();

        merge_external_errors(&mut items, &errors);

        assert_eq!(items[0].num_errors, 5);
        assert_eq!(items[0].error_rate, 25.0);
        assert_eq!(items[1].num_errors, 0);
        assert_eq!(items[1].error_rate, 0.0);
        assert!(items.iter().all(|i| i.num_calls == 0 && i.call_rate == 0.0));
    }
}
