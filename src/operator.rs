use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::{future::BoxFuture, FutureExt, StreamExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::{
    api::{ListParams, Patch, PatchParams},
    runtime::{controller::Action, events::Reporter, watcher, Controller},
    Api, Client, ResourceExt,
};
use prometheus::{register_histogram_vec, HistogramVec};
use serde::Serialize;
use serde_json::json;
use tokio::{sync::RwLock, time::Instant};
use tracing::{debug, field, info, instrument, warn, Span};

use crate::adapter;
use crate::api::{
    self, set_condition, CamelApp, CamelAppStatus, PodInfo, RuntimeInfo, CONDITION_HEALTHY,
    CONDITION_MONITORED, RUNTIME_STATUS_UP,
};
use crate::config::OperatorConfig;
use crate::events;
use crate::patch;
use crate::scrape::ObservabilityClient;
use crate::sli;
use crate::{Error, Result};

/// Context for the reconciler
#[derive(Clone)]
struct Context {
    /// Kubernetes client
    client: Client,
    /// Process-wide configuration resolved at startup
    config: OperatorConfig,
    /// Shared scraper for the pod observability endpoints
    scraper: ObservabilityClient,
    /// Diagnostics read by the web server
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    metrics: Metrics,
    /// Last status write per app, used to recognize our own watch echoes
    status_writes: Arc<RwLock<HashMap<String, StatusWrite>>>,
}

#[derive(Clone)]
struct StatusWrite {
    resource_version: String,
    at: Instant,
}

#[instrument(skip(ctx, app), fields(trace_id))]
async fn reconcile(app: Arc<CamelApp>, ctx: Arc<Context>) -> Result<Action, Error> {
    let start = Instant::now();
    Span::current().record("trace_id", field::display(crate::telemetry::get_trace_id()));
    ctx.diagnostics.write().await.last_event = Utc::now();
    let reporter = ctx.diagnostics.read().await.reporter.clone();
    let name = app.name_any();
    let namespace = app.namespace().unwrap();
    let key = format!("{namespace}/{name}");
    let apps: Api<CamelApp> = Api::namespaced(ctx.client.clone(), &namespace);

    // A deleted app needs no work; the owner reference already cascades.
    let Some(fetched) = apps.get_opt(&name).await? else {
        ctx.status_writes.write().await.remove(&key);
        ctx.observe(&namespace, "reconciled", "", start);
        return Ok(Action::await_change());
    };

    let poll_interval = ctx.config.poll_interval_for(fetched.annotations());

    // Reconciles are driven by the periodic re-queue. A watch delivery that
    // still carries the resourceVersion of our own last status write is the
    // echo of that write, not new information.
    if let Some(write) = ctx.status_writes.read().await.get(&key) {
        if fetched.resource_version().as_deref() == Some(write.resource_version.as_str())
            && write.at.elapsed() < poll_interval / 2
        {
            debug!("skipping self-triggered reconcile of CamelApp \"{name}\" in {namespace}");
            ctx.observe(&namespace, "requeued", "", start);
            return Ok(Action::requeue(poll_interval - write.at.elapsed()));
        }
    }

    let mut target = fetched.clone();
    let mut failure = monitor(&ctx, &fetched, &mut target).await.err();

    // A failed pass still attempts the status patch before returning, so
    // whatever partial view it derived is not lost. A missing or unsupported
    // source produced nothing to write and only surfaces as an event.
    let skip_patch = matches!(
        failure.as_ref(),
        Some(Error::SourceMissing { .. } | Error::UnsupportedKind(_))
    );
    if !skip_patch {
        match apply_status(&apps, &name, &fetched, &target).await {
            Ok(Some(patched)) => {
                ctx.status_writes.write().await.insert(
                    key.clone(),
                    StatusWrite {
                        resource_version: patched.resource_version().unwrap_or_default(),
                        at: Instant::now(),
                    },
                );
            }
            Ok(None) => {}
            Err(patch_err) => {
                if failure.is_some() {
                    warn!(
                        "cannot patch status of CamelApp \"{name}\" in {namespace} after a failed pass: {patch_err}"
                    );
                } else {
                    failure = Some(patch_err);
                }
            }
        }
    }

    match failure {
        None => {
            if let Err(err) = events::notify_app_updated(
                ctx.client.clone(),
                reporter,
                Some(&fetched),
                &target,
            )
            .await
            {
                warn!("cannot publish AppUpdated event for {key}: {err}");
            }

            info!("Reconciled CamelApp \"{name}\" in {namespace}");
            ctx.observe(&namespace, "requeued", "", start);
            Ok(Action::requeue(poll_interval))
        }
        Some(err) => {
            if let Err(publish_err) = events::notify_app_error(
                ctx.client.clone(),
                reporter,
                Some(&fetched),
                Some(&target),
                &err,
            )
            .await
            {
                warn!("cannot publish AppError event for {key}: {publish_err}");
            }
            ctx.observe(&namespace, "errored", "PlatformError", start);
            Err(err)
        }
    }
}

/// One observation pass: look up the source workload and derive the status
/// from live state, mutating `target` as it goes. Per-pod scrape failures
/// stay inside the pod records; only cluster API failures and a missing
/// source abort the pass. An aborted pass leaves in `target` whatever it
/// derived up to that point, for the caller's status patch attempt.
async fn monitor(ctx: &Context, fetched: &CamelApp, target: &mut CamelApp) -> Result<()> {
    let namespace = fetched.namespace().unwrap_or_default();
    let annotations = fetched.annotations();
    let source_kind = annotations
        .get(api::IMPORTED_KIND_ANNOTATION)
        .cloned()
        .unwrap_or_default();
    let source_name = annotations
        .get(api::IMPORTED_NAME_ANNOTATION)
        .cloned()
        .unwrap_or_default();

    let source = adapter::lookup(&ctx.client, &source_kind, &namespace, &source_name)
        .await?
        .ok_or_else(|| Error::SourceMissing {
            kind: source_kind.clone(),
            namespace: namespace.clone(),
            name: source_name.clone(),
        })?;

    // fresh import of the domain annotations
    let mut target_annotations = api::domain_annotations(source.annotations());
    target_annotations.insert(api::IMPORTED_KIND_ANNOTATION.to_owned(), source_kind);
    target_annotations.insert(api::IMPORTED_NAME_ANNOTATION.to_owned(), source_name);
    target_annotations.insert(api::SYNTHETIC_ANNOTATION.to_owned(), "true".to_owned());
    target.metadata.annotations = Some(target_annotations);

    // zeroed status carrying the workload-level view first: if enumerating
    // the pods fails below, this much still reaches the status patch.
    // Conditions are carried over so a failed pass does not drop them.
    target.status = Some(CamelAppStatus {
        phase: Some(source.app_phase()),
        image: source.image(),
        replicas: Some(source.desired_replicas()),
        conditions: fetched
            .status
            .as_ref()
            .map(|s| s.conditions.clone())
            .unwrap_or_default(),
        ..CamelAppStatus::default()
    });

    let source_annotations = source.annotations();
    let port = ctx.config.observability_port_for(source_annotations);
    let pods = source.pods(ctx.client.clone(), &ctx.scraper, port).await?;

    let mut status = target.status.take().unwrap_or_default();
    status.pods = pods;

    let aggregated = aggregate_runtime(&status.pods);
    let previous_runtime = fetched
        .status
        .as_ref()
        .and_then(|s| aggregate_runtime(&s.pods));

    if let (Some(previous), Some(current)) = (&previous_runtime, &aggregated) {
        status.sli_exchange_success_rate = Some(sli::compute(
            &previous.exchange,
            &current.exchange,
            ctx.config.poll_interval_for(source_annotations),
            ctx.config.sli_thresholds_for(source_annotations),
        ));
    }

    status.info = aggregated.as_ref().and_then(RuntimeInfo::describe);

    let now = Time(Utc::now());
    let mut conditions = std::mem::take(&mut status.conditions);
    set_condition(
        &mut conditions,
        monitored_condition(&status.pods, source.desired_replicas(), &now),
    );
    set_condition(&mut conditions, healthy_condition(&status.pods, &now));
    status.conditions = conditions;

    target.status = Some(status);
    Ok(())
}

/// Patch the status subresource with the merge diff between the fetched and
/// the target object. An empty diff skips the API call entirely, which is
/// what makes an unchanged observation a no-op.
async fn apply_status(
    apps: &Api<CamelApp>,
    name: &str,
    fetched: &CamelApp,
    target: &CamelApp,
) -> Result<Option<CamelApp>> {
    let base = json!({
        "metadata": { "annotations": fetched.metadata.annotations.clone().unwrap_or_default() },
        "status": fetched.status.clone().unwrap_or_default(),
    });
    let desired = json!({
        "metadata": { "annotations": target.metadata.annotations.clone().unwrap_or_default() },
        "status": target.status.clone().unwrap_or_default(),
    });

    let diff = patch::merge_patch(&base, &desired);
    if patch::is_empty(&diff) {
        debug!("status of CamelApp \"{name}\" is unchanged");
        return Ok(None);
    }

    let patched = apps
        .patch_status(name, &PatchParams::default(), &Patch::Merge(&diff))
        .await?;
    Ok(Some(patched))
}

/// Aggregate a single runtime view across the pods of one app: the first
/// non-empty descriptor wins, exchange counters are summed and the last
/// exchange timestamp is the maximum across pods.
fn aggregate_runtime(pods: &[PodInfo]) -> Option<RuntimeInfo> {
    let mut aggregated: Option<RuntimeInfo> = None;
    for pod in pods {
        let Some(runtime) = &pod.runtime else {
            continue;
        };
        let view = aggregated.get_or_insert_with(RuntimeInfo::default);
        if !view.has_descriptor() && runtime.has_descriptor() {
            view.runtime_provider = runtime.runtime_provider.clone();
            view.runtime_version = runtime.runtime_version.clone();
            view.camel_version = runtime.camel_version.clone();
        }
        if view.status.is_none() {
            view.status = runtime.status.clone();
        }
        view.exchange.total += runtime.exchange.total;
        view.exchange.succeeded += runtime.exchange.succeeded;
        view.exchange.failed += runtime.exchange.failed;
        view.exchange.pending += runtime.exchange.pending;
        view.exchange.last_timestamp = match (
            view.exchange.last_timestamp.take(),
            runtime.exchange.last_timestamp.clone(),
        ) {
            (Some(a), Some(b)) => Some(if b.0 > a.0 { b } else { a }),
            (a, b) => b.or(a),
        };
    }
    aggregated
}

fn monitored_condition(pods: &[PodInfo], desired_replicas: i32, now: &Time) -> Condition {
    let ready = pods.iter().filter(|p| p.ready).count();
    let monitored = !pods.is_empty() && ready == pods.len();

    let mut message = if monitored {
        format!("every one of the {ready} pods can be monitored")
    } else if pods.is_empty() {
        "there is no pod to monitor".to_owned()
    } else {
        "some pods cannot be monitored".to_owned()
    };
    if desired_replicas >= 0 && ready != desired_replicas as usize {
        message = format!("{message}: {ready} out of {desired_replicas} pods available");
    }

    Condition {
        type_: CONDITION_MONITORED.to_owned(),
        status: if monitored { "True" } else { "False" }.to_owned(),
        reason: if monitored {
            "PodsMonitored"
        } else {
            "PodsNotMonitored"
        }
        .to_owned(),
        message,
        last_transition_time: now.clone(),
        observed_generation: None,
    }
}

fn healthy_condition(pods: &[PodInfo], now: &Time) -> Condition {
    let healthy = !pods.is_empty()
        && pods.iter().all(|p| {
            p.runtime
                .as_ref()
                .and_then(|r| r.status.as_deref())
                .map(|s| s == RUNTIME_STATUS_UP)
                .unwrap_or(false)
        });

    let message = if healthy {
        "every pod runtime reports UP".to_owned()
    } else if pods.is_empty() {
        "there is no pod to probe".to_owned()
    } else {
        "some pod runtimes do not report UP".to_owned()
    };

    Condition {
        type_: CONDITION_HEALTHY.to_owned(),
        status: if healthy { "True" } else { "False" }.to_owned(),
        reason: if healthy { "RuntimeUp" } else { "RuntimeNotUp" }.to_owned(),
        message,
        last_transition_time: now.clone(),
        observed_generation: None,
    }
}

// Prometheus metrics exposed on /metrics
#[derive(Clone)]
pub struct Metrics {
    pub reconcile_duration: HistogramVec,
}

impl Metrics {
    fn new() -> Self {
        let reconcile_histogram = register_histogram_vec!(
            "camel_app_reconcile_duration_seconds",
            "The duration of one CamelApp reconcile pass in seconds",
            &["namespace", "group", "version", "kind", "result", "tag"],
            vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]
        )
        .unwrap();

        Metrics {
            reconcile_duration: reconcile_histogram,
        }
    }
}

impl Context {
    fn observe(&self, namespace: &str, result: &str, tag: &str, start: Instant) {
        self.metrics
            .reconcile_duration
            .with_label_values(&[
                namespace,
                "camel.apache.org",
                "v1alpha1",
                "CamelApp",
                result,
                tag,
            ])
            .observe(start.elapsed().as_secs_f64());
    }
}

// Diagnostics to be exposed on the webserver
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}

impl Diagnostics {
    fn new() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "camel-dashboard-operator".into(),
        }
    }
}

/// Data owned by the Operator
#[derive(Clone)]
pub struct Operator {
    /// Diagnostics populated by the reconciler
    diagnostics: Arc<RwLock<Diagnostics>>,
}

fn error_policy(app: Arc<CamelApp>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!(
        "reconcile of CamelApp \"{}\" failed: {:?}",
        app.name_any(),
        error
    );
    Action::requeue(ctx.config.poll_interval)
}

/// Operator that owns the CamelApp controller and the synthetic watchers
impl Operator {
    /// Lifecycle initialization interface for the app
    ///
    /// This returns an `Operator` handle plus a future driving the controller
    /// and the source-workload watchers. It is up to `main` to await it.
    pub async fn new() -> (Self, BoxFuture<'static, ()>) {
        let client = Client::try_default().await.expect("Create Client");
        let config = OperatorConfig::from_env();
        let metrics = Metrics::new();
        let diagnostics = Arc::new(RwLock::new(Diagnostics::new()));
        let scraper = ObservabilityClient::new(&config);
        let context = Arc::new(Context {
            client: client.clone(),
            config: config.clone(),
            scraper,
            metrics,
            diagnostics: diagnostics.clone(),
            status_writes: Arc::new(RwLock::new(HashMap::new())),
        });

        let apps: Api<CamelApp> = match &config.watch_namespace {
            Some(namespace) => Api::namespaced(client.clone(), namespace),
            None => Api::all(client.clone()),
        };
        // Ensure the CRD is installed before loop-watching
        let _r = apps
            .list(&ListParams::default().limit(1))
            .await
            .expect("Is the CamelApp CRD installed? please run: cargo run --bin crdgen | kubectl apply -f -");

        let controller = Controller::new(apps, watcher::Config::default())
            .shutdown_on_signal()
            .run(reconcile, error_policy, context)
            .for_each(|res| async move {
                match res {
                    Ok(_) => {}
                    Err(err) => warn!("controller error: {err}"),
                }
            })
            .boxed();

        let watchers = crate::synthetic::run(client, config).boxed();
        let drive = async move {
            futures::future::join(controller, watchers).await;
        }
        .boxed();

        (Self { diagnostics }, drive)
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ExchangeInfo;
    use chrono::TimeZone;

    fn pod(name: &str, ready: bool, runtime: Option<RuntimeInfo>) -> PodInfo {
        PodInfo {
            name: name.to_owned(),
            ready,
            runtime,
            ..PodInfo::default()
        }
    }

    fn runtime(provider: Option<&str>, total: i64, failed: i64, last_ts: Option<i64>) -> RuntimeInfo {
        RuntimeInfo {
            status: Some(RUNTIME_STATUS_UP.to_owned()),
            runtime_provider: provider.map(str::to_owned),
            runtime_version: provider.map(|_| "3.18.3".to_owned()),
            camel_version: provider.map(|_| "4.8.5".to_owned()),
            exchange: ExchangeInfo {
                total,
                failed,
                succeeded: total - failed,
                pending: 0,
                last_timestamp: last_ts
                    .map(|s| Time(Utc.timestamp_opt(s, 0).unwrap())),
            },
        }
    }

    fn now() -> Time {
        Time(Utc.timestamp_opt(1_740_000_000, 0).unwrap())
    }

    #[test]
    fn aggregate_sums_counters_and_keeps_first_descriptor() {
        let pods = vec![
            pod("a", true, Some(runtime(Some("quarkus"), 10, 1, Some(100)))),
            pod("b", true, Some(runtime(Some("spring-boot"), 5, 2, Some(400)))),
            pod("c", false, None),
        ];

        let view = aggregate_runtime(&pods).expect("aggregated view");
        assert_eq!(view.runtime_provider.as_deref(), Some("quarkus"));
        assert_eq!(view.exchange.total, 15);
        assert_eq!(view.exchange.failed, 3);
        assert_eq!(view.exchange.succeeded, 12);
        assert_eq!(
            view.exchange.last_timestamp,
            Some(Time(Utc.timestamp_opt(400, 0).unwrap()))
        );
    }

    #[test]
    fn aggregate_takes_descriptor_from_any_pod() {
        let pods = vec![
            pod("a", true, Some(runtime(None, 3, 0, None))),
            pod("b", true, Some(runtime(Some("main"), 4, 0, None))),
        ];
        let view = aggregate_runtime(&pods).expect("aggregated view");
        assert_eq!(view.runtime_provider.as_deref(), Some("main"));
        assert_eq!(view.exchange.total, 7);
    }

    #[test]
    fn aggregate_of_runtime_less_pods_is_none() {
        let pods = vec![pod("a", false, None), pod("b", false, None)];
        assert!(aggregate_runtime(&pods).is_none());
        assert!(aggregate_runtime(&[]).is_none());
    }

    #[test]
    fn monitored_condition_is_true_when_all_pods_ready() {
        let pods = vec![
            pod("a", true, Some(runtime(Some("quarkus"), 1, 0, None))),
            pod("b", true, Some(runtime(None, 1, 0, None))),
        ];
        let condition = monitored_condition(&pods, 2, &now());
        assert_eq!(condition.status, "True");
        assert_eq!(condition.type_, CONDITION_MONITORED);
    }

    #[test]
    fn monitored_condition_reports_available_count_mismatch() {
        let pods = vec![
            pod("a", true, Some(runtime(Some("quarkus"), 1, 0, None))),
            pod("b", false, None),
        ];
        let condition = monitored_condition(&pods, 2, &now());
        assert_eq!(condition.status, "False");
        assert!(condition.message.contains("1 out of 2 pods available"));
    }

    #[test]
    fn monitored_condition_is_false_without_pods() {
        let condition = monitored_condition(&[], 0, &now());
        assert_eq!(condition.status, "False");
    }

    #[test]
    fn healthy_condition_requires_every_runtime_up() {
        let up = vec![
            pod("a", true, Some(runtime(Some("quarkus"), 1, 0, None))),
            pod("b", true, Some(runtime(None, 1, 0, None))),
        ];
        assert_eq!(healthy_condition(&up, &now()).status, "True");

        let mut degraded = up.clone();
        degraded[1].runtime.as_mut().unwrap().status = Some("DOWN".to_owned());
        assert_eq!(healthy_condition(&degraded, &now()).status, "False");

        let unprobed = vec![pod("a", false, None)];
        assert_eq!(healthy_condition(&unprobed, &now()).status, "False");
        assert_eq!(healthy_condition(&[], &now()).status, "False");
    }

    #[test]
    fn identical_observations_produce_an_empty_status_diff() {
        let pods = vec![pod("a", true, Some(runtime(Some("quarkus"), 10, 0, Some(100))))];
        let build = || {
            let mut status = CamelAppStatus {
                phase: Some(crate::api::CamelAppPhase::Running),
                image: Some("img:1".to_owned()),
                replicas: Some(1),
                pods: pods.clone(),
                ..CamelAppStatus::default()
            };
            status.info = aggregate_runtime(&status.pods)
                .as_ref()
                .and_then(RuntimeInfo::describe);
            let mut conditions = Vec::new();
            set_condition(&mut conditions, monitored_condition(&status.pods, 1, &now()));
            set_condition(&mut conditions, healthy_condition(&status.pods, &now()));
            status.conditions = conditions;
            status
        };

        let first = build();
        let second = build();
        assert_eq!(first, second);

        let diff = patch::merge_patch(
            &serde_json::to_value(&first).unwrap(),
            &serde_json::to_value(&second).unwrap(),
        );
        assert!(patch::is_empty(&diff));
    }
}
