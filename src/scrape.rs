use chrono::{TimeZone, Utc};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use prometheus_parse::{Sample, Scrape, Value};
use reqwest::{header::ACCEPT, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::api::{ExchangeInfo, PodInfo, RuntimeInfo};
use crate::config::OperatorConfig;

const APP_INFO_METRIC: &str = "app_info";
const EXCHANGES_TOTAL_METRIC: &str = "camel_exchanges_total";
const EXCHANGES_FAILED_METRIC: &str = "camel_exchanges_failed_total";
const EXCHANGES_SUCCEEDED_METRIC: &str = "camel_exchanges_succeeded_total";
const EXCHANGES_INFLIGHT_METRIC: &str = "camel_exchanges_inflight";
const EXCHANGES_LAST_TIMESTAMP_METRIC: &str = "camel_exchanges_last_timestamp";

const RUNTIME_PROVIDER_LABEL: &str = "camel_runtime_provider";
const RUNTIME_VERSION_LABEL: &str = "camel_runtime_version";
const CAMEL_VERSION_LABEL: &str = "camel_version";

/// Failure of a single scrape operation. These never cross the reconcile
/// boundary: they end up as free text in the pod-info `reason` field.
#[derive(Error, Debug)]
pub enum ScrapeError {
    #[error("{0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected HTTP status {0}")]
    HttpStatus(StatusCode),

    #[error("cannot parse health payload: {0}")]
    HealthParse(String),

    #[error("cannot parse metrics exposition: {0}")]
    MetricsParse(String),
}

#[derive(Deserialize)]
struct HealthReport {
    status: String,
}

/// What one successful metrics scrape contributes to the runtime view.
#[derive(Debug, Default, PartialEq)]
struct ScrapedMetrics {
    runtime_provider: Option<String>,
    runtime_version: Option<String>,
    camel_version: Option<String>,
    exchange: ExchangeInfo,
}

/// Per-pod scraper for the Camel observability endpoints.
///
/// Plain HTTP against the pod's routable address, no TLS, no proxy. All
/// requests share one client with a bounded timeout so a slow pod cannot
/// starve the reconcile worker pool.
#[derive(Clone)]
pub struct ObservabilityClient {
    http: reqwest::Client,
    health_path: String,
    metrics_path: String,
}

impl ObservabilityClient {
    pub fn new(config: &OperatorConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.scrape_timeout)
            .no_proxy()
            .build()
            .expect("build scrape HTTP client");
        ObservabilityClient {
            http,
            health_path: config.health_path.clone(),
            metrics_path: config.metrics_path.clone(),
        }
    }

    /// Observe one pod: scrape both endpoints and project the result into a
    /// pod-info record. Both scrapes are attempted even if the first fails;
    /// `ready` is the conjunction of both succeeding.
    pub async fn pod_info(&self, pod: &Pod, port: u16) -> PodInfo {
        let pod_status = pod.status.as_ref();
        let mut info = PodInfo {
            name: pod.name_any(),
            internal_ip: pod_status.and_then(|s| s.pod_ip.clone()),
            status: pod_status.and_then(|s| s.phase.clone()),
            uptime_timestamp: ready_transition_time(pod),
            ..PodInfo::default()
        };

        let Some(ip) = info.internal_ip.clone() else {
            info.reason = Some("pod has no routable IP address yet".to_owned());
            return info;
        };

        let mut reasons = Vec::new();
        let mut runtime = RuntimeInfo::default();

        match self.scrape_health(&ip, port).await {
            Ok(status) => {
                runtime.status = Some(status);
                info.observability_service.health_endpoint = Some(self.health_path.clone());
                info.observability_service.health_port = Some(i32::from(port));
            }
            Err(err) => reasons.push(format!("Could not scrape health endpoint: {err}")),
        }

        match self.scrape_metrics(&ip, port).await {
            Ok(metrics) => {
                runtime.runtime_provider = metrics.runtime_provider;
                runtime.runtime_version = metrics.runtime_version;
                runtime.camel_version = metrics.camel_version;
                runtime.exchange = metrics.exchange;
                info.observability_service.metrics_endpoint = Some(self.metrics_path.clone());
                info.observability_service.metrics_port = Some(i32::from(port));
            }
            Err(err) => reasons.push(format!("Could not scrape metrics endpoint: {err}")),
        }

        info.ready = reasons.is_empty();
        if !runtime.is_empty() {
            if runtime.status.is_none() {
                runtime.status = Some("Unknown".to_owned());
            }
            info.runtime = Some(runtime);
        }
        if !reasons.is_empty() {
            info.reason = Some(reasons.join("; "));
        }

        info
    }

    /// GET the health endpoint. 200 and 503 both carry a parsable payload
    /// (a DOWN runtime answers 503); anything else is a scrape failure.
    async fn scrape_health(&self, ip: &str, port: u16) -> Result<String, ScrapeError> {
        let url = format!("http://{ip}:{port}/{}", self.health_path);
        debug!("scraping health endpoint {url}");
        let response = self.http.get(&url).send().await?;
        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::SERVICE_UNAVAILABLE {
            return Err(ScrapeError::HttpStatus(status));
        }
        let body = response.bytes().await?;
        let report: HealthReport = serde_json::from_slice(&body)
            .map_err(|err| ScrapeError::HealthParse(err.to_string()))?;
        Ok(report.status)
    }

    async fn scrape_metrics(&self, ip: &str, port: u16) -> Result<ScrapedMetrics, ScrapeError> {
        let url = format!("http://{ip}:{port}/{}", self.metrics_path);
        debug!("scraping metrics endpoint {url}");
        let response = self
            .http
            .get(&url)
            .header(ACCEPT, "text/plain, */*")
            .send()
            .await?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(ScrapeError::HttpStatus(status));
        }
        let body = response.text().await?;
        parse_metrics(&body)
    }
}

/// Parse the text-format exposition and extract the Camel metric families.
fn parse_metrics(body: &str) -> Result<ScrapedMetrics, ScrapeError> {
    let scrape = Scrape::parse(body.lines().map(|line| Ok(line.to_owned())))
        .map_err(|err| ScrapeError::MetricsParse(err.to_string()))?;

    let mut metrics = ScrapedMetrics::default();

    let app_info: Vec<&Sample> = scrape
        .samples
        .iter()
        .filter(|s| s.metric == APP_INFO_METRIC)
        .collect();
    if app_info.len() != 1 {
        warn!(
            "expected exactly one {} sample, found {}",
            APP_INFO_METRIC,
            app_info.len()
        );
    }
    if let Some(sample) = app_info.first() {
        metrics.runtime_provider = sample.labels.get(RUNTIME_PROVIDER_LABEL).map(str::to_owned);
        metrics.runtime_version = sample.labels.get(RUNTIME_VERSION_LABEL).map(str::to_owned);
        metrics.camel_version = sample.labels.get(CAMEL_VERSION_LABEL).map(str::to_owned);
    }

    if let Some(total) = counter_value(&scrape.samples, EXCHANGES_TOTAL_METRIC) {
        metrics.exchange.total = total;
    }
    if let Some(failed) = counter_value(&scrape.samples, EXCHANGES_FAILED_METRIC) {
        metrics.exchange.failed = failed;
    }
    if let Some(succeeded) = counter_value(&scrape.samples, EXCHANGES_SUCCEEDED_METRIC) {
        metrics.exchange.succeeded = succeeded;
    }
    if let Some(pending) = gauge_value(&scrape.samples, EXCHANGES_INFLIGHT_METRIC) {
        metrics.exchange.pending = pending;
    }
    if let Some(millis) = gauge_value(&scrape.samples, EXCHANGES_LAST_TIMESTAMP_METRIC) {
        // the runtime reports 0 until the first exchange went through
        if millis > 0 {
            metrics.exchange.last_timestamp = Utc
                .timestamp_millis_opt(millis)
                .single()
                .map(Time);
        }
    }

    Ok(metrics)
}

fn counter_value(samples: &[Sample], name: &str) -> Option<i64> {
    let sample = samples.iter().find(|s| s.metric == name)?;
    match &sample.value {
        Value::Counter(v) => Some(*v as i64),
        Value::Gauge(v) | Value::Untyped(v) => {
            warn!("metric {name} is not typed as a counter, ingesting anyway");
            Some(*v as i64)
        }
        _ => {
            warn!("metric {name} has an unusable sample type");
            None
        }
    }
}

fn gauge_value(samples: &[Sample], name: &str) -> Option<i64> {
    let sample = samples.iter().find(|s| s.metric == name)?;
    match &sample.value {
        Value::Gauge(v) => Some(*v as i64),
        Value::Counter(v) | Value::Untyped(v) => {
            warn!("metric {name} is not typed as a gauge, ingesting anyway");
            Some(*v as i64)
        }
        _ => {
            warn!("metric {name} has an unusable sample type");
            None
        }
    }
}

/// Time at which the pod Ready condition last became true.
fn ready_transition_time(pod: &Pod) -> Option<Time> {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| {
            conditions
                .iter()
                .find(|c| c.type_ == "Ready" && c.status == "True")
        })
        .and_then(|c| c.last_transition_time.clone())
}
