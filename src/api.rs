use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, OwnerReference, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Label used to tag the workloads that should be mirrored as Camel applications.
pub const APP_LABEL: &str = "camel.apache.org/app";
/// Prefix of the annotations carried over from the source workload.
pub const DOMAIN_PREFIX: &str = "camel.apache.org/";

/// Annotation specifying from what kind of resource a CamelApp was imported.
pub const IMPORTED_KIND_ANNOTATION: &str = "camel.apache.org/imported-from-kind";
/// Annotation specifying from what resource a CamelApp was imported.
pub const IMPORTED_NAME_ANNOTATION: &str = "camel.apache.org/imported-from-name";
/// Annotation used to tag synthetic CamelApps.
pub const SYNTHETIC_ANNOTATION: &str = "camel.apache.org/is-synthetic";

/// Per-app override for the reconcile polling interval.
pub const POLL_INTERVAL_ANNOTATION: &str = "camel.apache.org/polling-interval-seconds";
/// Per-app override for the pod observability port.
pub const OBSERVABILITY_PORT_ANNOTATION: &str = "camel.apache.org/observability-services-port";
/// Per-app override for the SLI exchange error threshold.
pub const SLI_ERROR_ANNOTATION: &str = "camel.apache.org/sli-exchange-error-percentage";
/// Per-app override for the SLI exchange warning threshold.
pub const SLI_WARNING_ANNOTATION: &str = "camel.apache.org/sli-exchange-warning-percentage";

/// Condition reported when all backing pods could be observed.
pub const CONDITION_MONITORED: &str = "Monitored";
/// Condition reported when every backing pod runtime is UP.
pub const CONDITION_HEALTHY: &str = "Healthy";

/// Runtime status reported by a healthy Camel application.
pub const RUNTIME_STATUS_UP: &str = "UP";

/// Generate the Kubernetes wrapper struct "CamelApp" from our Spec and Status struct
///
/// The spec is empty on purpose: a CamelApp is a purely observational mirror of
/// some user-owned workload, and only its status carries data. This also
/// provides the hook for generating the CRD yaml (in crdgen.rs).
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "CamelApp",
    group = "camel.apache.org",
    version = "v1alpha1",
    namespaced
)]
#[kube(status = "CamelAppStatus", shortname = "capp", category = "camel")]
#[kube(printcolumn = r#"{"name":"Image","type":"string","jsonPath":".status.image"}"#)]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[kube(printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".status.replicas"}"#)]
#[kube(
    printcolumn = r#"{"name":"Healthy","type":"string","jsonPath":".status.conditions[?(@.type==\"Healthy\")].status"}"#
)]
#[kube(
    printcolumn = r#"{"name":"Monitored","type":"string","jsonPath":".status.conditions[?(@.type==\"Monitored\")].status"}"#
)]
#[kube(printcolumn = r#"{"name":"Info","type":"string","jsonPath":".status.info"}"#)]
#[kube(
    printcolumn = r#"{"name":"Exchange SLI","type":"string","jsonPath":".status.sliExchangeSuccessRate.successPercentage"}"#
)]
#[kube(
    printcolumn = r#"{"name":"Last Exchange","type":"date","jsonPath":".status.sliExchangeSuccessRate.lastTimestamp"}"#
)]
pub struct CamelAppSpec {}

/// The observed state of a CamelApp, set exclusively by the reconciler.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CamelAppStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<CamelAppPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pods: Vec<PodInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sli_exchange_success_rate: Option<SliExchangeSuccessRate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Phase of the mirrored application, derived from the source workload.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub enum CamelAppPhase {
    Running,
    Paused,
    Error,
    /// Reported for workload kinds whose phase derivation is not implemented
    /// (periodic jobs, serverless services).
    #[serde(rename = "TBD")]
    Tbd,
}

impl fmt::Display for CamelAppPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CamelAppPhase::Running => write!(f, "Running"),
            CamelAppPhase::Paused => write!(f, "Paused"),
            CamelAppPhase::Error => write!(f, "Error"),
            CamelAppPhase::Tbd => write!(f, "TBD"),
        }
    }
}

/// Observed state of a single backing pod.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodInfo {
    pub name: String,
    #[serde(default, rename = "internalIP", skip_serializing_if = "Option::is_none")]
    pub internal_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Time at which the pod Ready condition last became true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime_timestamp: Option<Time>,
    /// True iff both the health and the metrics scrape succeeded.
    #[serde(default)]
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "ObservabilityServiceInfo::is_empty")]
    pub observability_service: ObservabilityServiceInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeInfo>,
}

/// The observability endpoints actually used to scrape a pod.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObservabilityServiceInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_port: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_port: Option<i32>,
}

impl ObservabilityServiceInfo {
    pub fn is_empty(&self) -> bool {
        *self == ObservabilityServiceInfo::default()
    }
}

/// Runtime descriptor scraped from a pod.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeInfo {
    /// UP, DOWN or Unknown, as reported by the health endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camel_version: Option<String>,
    #[serde(default)]
    pub exchange: ExchangeInfo,
}

impl RuntimeInfo {
    /// True when nothing was learned about the runtime at all.
    pub fn is_empty(&self) -> bool {
        *self == RuntimeInfo::default()
    }

    /// Whether the descriptor part (provider and versions) carries data.
    pub fn has_descriptor(&self) -> bool {
        self.runtime_provider.is_some()
            || self.runtime_version.is_some()
            || self.camel_version.is_some()
    }

    /// Human readable one-liner, e.g. `quarkus - 3.18.3 (4.8.5)`.
    pub fn describe(&self) -> Option<String> {
        let provider = self.runtime_provider.as_deref()?;
        let runtime_version = self.runtime_version.as_deref().unwrap_or("unknown");
        let camel_version = self.camel_version.as_deref().unwrap_or("unknown");
        Some(format!("{provider} - {runtime_version} ({camel_version})"))
    }
}

/// Aggregated exchange counters reported by the Camel runtime.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeInfo {
    #[serde(default)]
    pub total: i64,
    #[serde(default)]
    pub succeeded: i64,
    #[serde(default)]
    pub failed: i64,
    #[serde(default)]
    pub pending: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_timestamp: Option<Time>,
}

/// Rolling success-rate indicator computed across two successive observations.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SliExchangeSuccessRate {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub success_percentage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling_interval_duration: Option<String>,
    #[serde(default)]
    pub sampling_interval_total: i64,
    #[serde(default)]
    pub sampling_interval_failed: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_timestamp: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SliStatus>,
}

/// Classification of the exchange success rate against the configured thresholds.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub enum SliStatus {
    Success,
    Warning,
    Error,
}

/// Build an empty CamelApp identified by (namespace, name).
pub fn new_app(namespace: &str, name: &str) -> CamelApp {
    let mut app = CamelApp::new(name, CamelAppSpec::default());
    app.metadata.namespace = Some(namespace.to_owned());
    app
}

/// Build a controller owner reference pointing at the source workload.
pub fn owner_reference(api_version: &str, kind: &str, name: &str, uid: &str) -> OwnerReference {
    OwnerReference {
        api_version: api_version.to_owned(),
        kind: kind.to_owned(),
        name: name.to_owned(),
        uid: uid.to_owned(),
        controller: Some(true),
        ..OwnerReference::default()
    }
}

/// Extract from the source workload the annotations that must be carried over
/// to the mirror CamelApp: every annotation under the camel.apache.org domain.
pub fn domain_annotations(source: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    source
        .iter()
        .filter(|(k, _)| k.starts_with(DOMAIN_PREFIX))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Upsert a condition, keeping the previous transition timestamp when the
/// condition status did not change.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        if existing.status == condition.status {
            condition.last_transition_time = existing.last_transition_time.clone();
        }
        *existing = condition;
    } else {
        conditions.push(condition);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn condition(type_: &str, status: &str, ts: i64) -> Condition {
        Condition {
            type_: type_.to_owned(),
            status: status.to_owned(),
            reason: "TestReason".to_owned(),
            message: "test".to_owned(),
            last_transition_time: Time(Utc.timestamp_opt(ts, 0).unwrap()),
            observed_generation: None,
        }
    }

    #[test]
    fn new_app_sets_identity() {
        let app = new_app("ns1", "demo");
        assert_eq!(app.metadata.name.as_deref(), Some("demo"));
        assert_eq!(app.metadata.namespace.as_deref(), Some("ns1"));
        assert!(app.status.is_none());
    }

    #[test]
    fn domain_annotations_filters_foreign_keys() {
        let mut source = BTreeMap::new();
        source.insert(
            "camel.apache.org/polling-interval-seconds".to_owned(),
            "30".to_owned(),
        );
        source.insert("app.kubernetes.io/name".to_owned(), "demo".to_owned());
        source.insert(
            "camel.apache.org/observability-services-port".to_owned(),
            "9999".to_owned(),
        );

        let carried = domain_annotations(&source);
        assert_eq!(carried.len(), 2);
        assert!(carried.keys().all(|k| k.starts_with(DOMAIN_PREFIX)));
    }

    #[test]
    fn set_condition_preserves_transition_time_when_status_unchanged() {
        let mut conditions = vec![condition(CONDITION_HEALTHY, "True", 100)];
        set_condition(&mut conditions, condition(CONDITION_HEALTHY, "True", 200));

        assert_eq!(conditions.len(), 1);
        assert_eq!(
            conditions[0].last_transition_time,
            Time(Utc.timestamp_opt(100, 0).unwrap())
        );
    }

    #[test]
    fn set_condition_updates_transition_time_on_status_change() {
        let mut conditions = vec![condition(CONDITION_HEALTHY, "True", 100)];
        set_condition(&mut conditions, condition(CONDITION_HEALTHY, "False", 200));

        assert_eq!(conditions.len(), 1);
        assert_eq!(
            conditions[0].last_transition_time,
            Time(Utc.timestamp_opt(200, 0).unwrap())
        );
    }

    #[test]
    fn set_condition_appends_new_types() {
        let mut conditions = vec![condition(CONDITION_HEALTHY, "True", 100)];
        set_condition(&mut conditions, condition(CONDITION_MONITORED, "False", 200));
        assert_eq!(conditions.len(), 2);
    }

    #[test]
    fn describe_renders_runtime_one_liner() {
        let runtime = RuntimeInfo {
            runtime_provider: Some("quarkus".to_owned()),
            runtime_version: Some("3.18.3".to_owned()),
            camel_version: Some("4.8.5".to_owned()),
            ..RuntimeInfo::default()
        };
        assert_eq!(runtime.describe().as_deref(), Some("quarkus - 3.18.3 (4.8.5)"));
        assert!(RuntimeInfo::default().describe().is_none());
    }

    #[test]
    fn phase_renders_like_kubernetes() {
        assert_eq!(CamelAppPhase::Running.to_string(), "Running");
        assert_eq!(CamelAppPhase::Tbd.to_string(), "TBD");
        let json = serde_json::to_string(&CamelAppPhase::Tbd).unwrap();
        assert_eq!(json, "\"TBD\"");
    }

    #[test]
    fn empty_status_serializes_to_empty_object() {
        let status = CamelAppStatus::default();
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value, serde_json::json!({}));
    }
}
