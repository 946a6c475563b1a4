use std::collections::BTreeMap;
use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use tracing::{debug, warn};

use crate::api;
use crate::sli::SliThresholds;

const WATCH_NAMESPACE_ENV: &str = "WATCH_NAMESPACE";
const OPERATOR_NAMESPACE_ENV: &str = "NAMESPACE";
const LABEL_SELECTOR_ENV: &str = "LABEL_SELECTOR";
const POLL_INTERVAL_ENV: &str = "POLL_INTERVAL_SECONDS";
const OBSERVABILITY_PORT_ENV: &str = "OBSERVABILITY_PORT";
const SLI_ERROR_ENV: &str = "SLI_ERR_PERCENTAGE";
const SLI_WARNING_ENV: &str = "SLI_WARN_PERCENTAGE";
const SCRAPE_TIMEOUT_ENV: &str = "SCRAPE_TIMEOUT_SECONDS";

pub const DEFAULT_POLL_INTERVAL_SECONDS: u64 = 60;
pub const DEFAULT_OBSERVABILITY_PORT: u16 = 9876;
pub const DEFAULT_METRICS_PATH: &str = "observe/metrics";
pub const DEFAULT_HEALTH_PATH: &str = "observe/health";
pub const DEFAULT_SLI_ERROR_PERCENTAGE: f64 = 5.0;
pub const DEFAULT_SLI_WARNING_PERCENTAGE: f64 = 10.0;
pub const DEFAULT_SCRAPE_TIMEOUT_SECONDS: u64 = 10;

/// Process-wide knobs, resolved once at startup.
///
/// Precedence for the per-app tunables is annotation > environment > default;
/// the annotation side is resolved by the `*_for` helpers against the source
/// workload annotations.
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Namespace the operator watches; `None` means cluster-global.
    pub watch_namespace: Option<String>,
    /// Namespace the operator itself runs in, when known.
    pub operator_namespace: Option<String>,
    /// Label marking workloads for discovery; its value names the app.
    pub app_label: String,
    pub poll_interval: Duration,
    pub observability_port: u16,
    pub metrics_path: String,
    pub health_path: String,
    pub sli_error_percentage: f64,
    pub sli_warning_percentage: f64,
    pub scrape_timeout: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        OperatorConfig {
            watch_namespace: None,
            operator_namespace: None,
            app_label: api::APP_LABEL.to_owned(),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECONDS),
            observability_port: DEFAULT_OBSERVABILITY_PORT,
            metrics_path: DEFAULT_METRICS_PATH.to_owned(),
            health_path: DEFAULT_HEALTH_PATH.to_owned(),
            sli_error_percentage: DEFAULT_SLI_ERROR_PERCENTAGE,
            sli_warning_percentage: DEFAULT_SLI_WARNING_PERCENTAGE,
            scrape_timeout: Duration::from_secs(DEFAULT_SCRAPE_TIMEOUT_SECONDS),
        }
    }
}

impl OperatorConfig {
    /// Resolve the configuration from the process environment.
    pub fn from_env() -> Self {
        let defaults = OperatorConfig::default();

        let watch_namespace = non_empty(env::var(WATCH_NAMESPACE_ENV).ok());
        if watch_namespace.is_none() {
            debug!("operator is global to all namespaces");
        }

        OperatorConfig {
            watch_namespace,
            operator_namespace: non_empty(env::var(OPERATOR_NAMESPACE_ENV).ok()),
            app_label: non_empty(env::var(LABEL_SELECTOR_ENV).ok()).unwrap_or(defaults.app_label),
            poll_interval: Duration::from_secs(parse_or_default(
                POLL_INTERVAL_ENV,
                env::var(POLL_INTERVAL_ENV).ok(),
                DEFAULT_POLL_INTERVAL_SECONDS,
            )),
            observability_port: parse_or_default(
                OBSERVABILITY_PORT_ENV,
                env::var(OBSERVABILITY_PORT_ENV).ok(),
                DEFAULT_OBSERVABILITY_PORT,
            ),
            metrics_path: defaults.metrics_path,
            health_path: defaults.health_path,
            sli_error_percentage: parse_or_default(
                SLI_ERROR_ENV,
                env::var(SLI_ERROR_ENV).ok(),
                DEFAULT_SLI_ERROR_PERCENTAGE,
            ),
            sli_warning_percentage: parse_or_default(
                SLI_WARNING_ENV,
                env::var(SLI_WARNING_ENV).ok(),
                DEFAULT_SLI_WARNING_PERCENTAGE,
            ),
            scrape_timeout: Duration::from_secs(parse_or_default(
                SCRAPE_TIMEOUT_ENV,
                env::var(SCRAPE_TIMEOUT_ENV).ok(),
                DEFAULT_SCRAPE_TIMEOUT_SECONDS,
            )),
        }
    }

    /// True when the operator watches every namespace.
    pub fn is_global(&self) -> bool {
        self.watch_namespace.is_none()
    }

    /// Polling interval for one app, honoring the source workload annotation.
    pub fn poll_interval_for(&self, annotations: &BTreeMap<String, String>) -> Duration {
        match annotation(annotations, api::POLL_INTERVAL_ANNOTATION) {
            Some(raw) => Duration::from_secs(parse_or_default(
                api::POLL_INTERVAL_ANNOTATION,
                Some(raw),
                self.poll_interval.as_secs(),
            )),
            None => self.poll_interval,
        }
    }

    /// Observability port for one app, honoring the source workload annotation.
    pub fn observability_port_for(&self, annotations: &BTreeMap<String, String>) -> u16 {
        match annotation(annotations, api::OBSERVABILITY_PORT_ANNOTATION) {
            Some(raw) => parse_or_default(
                api::OBSERVABILITY_PORT_ANNOTATION,
                Some(raw),
                self.observability_port,
            ),
            None => self.observability_port,
        }
    }

    /// SLI thresholds for one app, honoring the source workload annotations.
    pub fn sli_thresholds_for(&self, annotations: &BTreeMap<String, String>) -> SliThresholds {
        let error_percentage = match annotation(annotations, api::SLI_ERROR_ANNOTATION) {
            Some(raw) => {
                parse_or_default(api::SLI_ERROR_ANNOTATION, Some(raw), self.sli_error_percentage)
            }
            None => self.sli_error_percentage,
        };
        let warning_percentage = match annotation(annotations, api::SLI_WARNING_ANNOTATION) {
            Some(raw) => parse_or_default(
                api::SLI_WARNING_ANNOTATION,
                Some(raw),
                self.sli_warning_percentage,
            ),
            None => self.sli_warning_percentage,
        };
        SliThresholds {
            error_percentage,
            warning_percentage,
        }
    }
}

fn annotation(annotations: &BTreeMap<String, String>, key: &str) -> Option<String> {
    non_empty(annotations.get(key).cloned())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Parse a knob, logging a warning and falling back to the default on failure.
/// Configuration errors never fail a reconcile.
fn parse_or_default<T>(name: &str, raw: Option<String>, default: T) -> T
where
    T: FromStr + Display + Copy,
{
    match raw {
        None => default,
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                warn!(
                    "cannot parse {} value {:?}, falling back to {}",
                    name, raw, default
                );
                default
            }
        },
    }
}
