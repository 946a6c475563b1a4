use std::time::Duration;

use crate::api::{ExchangeInfo, SliExchangeSuccessRate, SliStatus};

/// Error/warning thresholds, in percentage points of failed exchanges.
///
/// The classification below intentionally checks `warning` before `error`
/// with strict comparisons, mirroring the established dashboard behavior.
/// With the natural ordering (`warning > error`) the policy is monotone.
#[derive(Clone, Copy, Debug)]
pub struct SliThresholds {
    pub error_percentage: f64,
    pub warning_percentage: f64,
}

/// Compute the exchange success-rate indicator between two successive
/// observations of the same app.
///
/// When no traffic was observed (`ΔT <= 0`) the record is still produced,
/// but with an empty percentage and no classification, so that an idle
/// interval is never reported as a success.
pub fn compute(
    previous: &ExchangeInfo,
    current: &ExchangeInfo,
    interval: Duration,
    thresholds: SliThresholds,
) -> SliExchangeSuccessRate {
    let delta_total = current.total - previous.total;
    let delta_failed = current.failed - previous.failed;

    let mut sli = SliExchangeSuccessRate {
        sampling_interval_duration: Some(format!("{}s", interval.as_secs())),
        sampling_interval_total: delta_total.max(0),
        sampling_interval_failed: delta_failed.max(0),
        last_timestamp: current.last_timestamp.clone(),
        ..SliExchangeSuccessRate::default()
    };

    if delta_total > 0 {
        let failure_percentage = delta_failed as f64 / delta_total as f64 * 100.0;
        sli.success_percentage = format!("{:.2}", 100.0 - failure_percentage);
        sli.status = if failure_percentage > thresholds.warning_percentage {
            Some(SliStatus::Error)
        } else if failure_percentage > thresholds.error_percentage {
            Some(SliStatus::Warning)
        } else {
            Some(SliStatus::Success)
        };
    }

    sli
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use chrono::{TimeZone, Utc};

    const THRESHOLDS: SliThresholds = SliThresholds {
        error_percentage: 5.0,
        warning_percentage: 10.0,
    };

    fn exchanges(total: i64, failed: i64) -> ExchangeInfo {
        ExchangeInfo {
            total,
            failed,
            succeeded: total - failed,
            ..ExchangeInfo::default()
        }
    }

    #[test]
    fn failure_above_warning_classifies_error() {
        let sli = compute(
            &exchanges(10, 0),
            &exchanges(20, 3),
            Duration::from_secs(60),
            THRESHOLDS,
        );
        // 3 failures out of 10 new exchanges: 30% > warning 10%
        assert_eq!(sli.success_percentage, "70.00");
        assert_eq!(sli.status, Some(SliStatus::Error));
        assert_eq!(sli.sampling_interval_total, 10);
        assert_eq!(sli.sampling_interval_failed, 3);
        assert_eq!(sli.sampling_interval_duration.as_deref(), Some("60s"));
    }

    #[test]
    fn failure_between_thresholds_classifies_warning() {
        let sli = compute(
            &exchanges(0, 0),
            &exchanges(100, 8),
            Duration::from_secs(60),
            THRESHOLDS,
        );
        assert_eq!(sli.success_percentage, "92.00");
        assert_eq!(sli.status, Some(SliStatus::Warning));
    }

    #[test]
    fn failure_below_error_classifies_success() {
        let sli = compute(
            &exchanges(10, 1),
            &exchanges(110, 1),
            Duration::from_secs(60),
            THRESHOLDS,
        );
        assert_eq!(sli.success_percentage, "100.00");
        assert_eq!(sli.status, Some(SliStatus::Success));
    }

    #[test]
    fn no_traffic_leaves_status_unset() {
        let sli = compute(
            &exchanges(10, 1),
            &exchanges(10, 1),
            Duration::from_secs(60),
            THRESHOLDS,
        );
        assert_eq!(sli.success_percentage, "");
        assert_eq!(sli.status, None);
        assert_eq!(sli.sampling_interval_total, 0);
        assert_eq!(sli.sampling_interval_failed, 0);
    }

    #[test]
    fn counter_reset_clamps_sampling_totals() {
        let sli = compute(
            &exchanges(100, 10),
            &exchanges(5, 0),
            Duration::from_secs(60),
            THRESHOLDS,
        );
        assert_eq!(sli.sampling_interval_total, 0);
        assert_eq!(sli.sampling_interval_failed, 0);
        assert_eq!(sli.status, None);
    }

    #[test]
    fn last_timestamp_copied_from_current() {
        let ts = Time(Utc.timestamp_opt(1_700_000_000, 0).unwrap());
        let mut current = exchanges(20, 0);
        current.last_timestamp = Some(ts.clone());
        let sli = compute(
            &exchanges(10, 0),
            &current,
            Duration::from_secs(60),
            THRESHOLDS,
        );
        assert_eq!(sli.last_timestamp, Some(ts));
    }

    #[test]
    fn classification_is_deterministic() {
        for _ in 0..3 {
            let a = compute(
                &exchanges(10, 0),
                &exchanges(20, 3),
                Duration::from_secs(60),
                THRESHOLDS,
            );
            let b = compute(
                &exchanges(10, 0),
                &exchanges(20, 3),
                Duration::from_secs(60),
                THRESHOLDS,
            );
            assert_eq!(a, b);
        }
    }
}
