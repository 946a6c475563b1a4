use std::fmt::Debug;

use futures::stream::BoxStream;
use futures::{stream, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
};
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{DeleteParams, PostParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn};

use crate::adapter::{KnativeService, SourceAdapter};
use crate::api::CamelApp;
use crate::config::OperatorConfig;

/// Lifecycle of the synthetic CamelApps is driven by the way we monitor the
/// host workloads: the watchers are filtered by the discovery label, so
/// labelling a resource surfaces as an add and unlabelling it as a delete.
enum SyntheticEvent {
    Added(SourceAdapter),
    Deleted(SourceAdapter),
}

/// Watch the source workload kinds and keep one synthetic CamelApp per
/// labeled workload. Runs until the watch streams end (i.e. forever, the
/// watcher re-establishes itself with backoff).
pub async fn run(client: Client, config: OperatorConfig) {
    let watcher_config = watcher::Config::default().labels(&config.app_label);
    let namespace = config.watch_namespace.as_deref();

    let mut streams: Vec<BoxStream<'static, Result<Vec<SyntheticEvent>, watcher::Error>>> = vec![
        watch_sources(
            scoped_api::<Deployment>(&client, namespace),
            watcher_config.clone(),
            SourceAdapter::from_deployment,
        ),
    ];

    if is_api_installed(&client, "batch/v1", "CronJob").await {
        streams.push(watch_sources(
            scoped_api::<CronJob>(&client, namespace),
            watcher_config.clone(),
            SourceAdapter::from_cronjob,
        ));
    } else {
        info!("batch/v1 CronJob is not available, skipping its watcher");
    }

    if is_api_installed(&client, "serving.knative.dev/v1", "Service").await
        && can_watch(&client, "serving.knative.dev", "services", namespace).await
    {
        streams.push(watch_sources(
            scoped_api::<KnativeService>(&client, namespace),
            watcher_config,
            SourceAdapter::from_knative_service,
        ));
    } else {
        info!("Knative serving is not available or not watchable, skipping its watcher");
    }

    let mut combined = stream::select_all(streams);
    while let Some(next) = combined.next().await {
        match next {
            Ok(events) => {
                for event in events {
                    match event {
                        SyntheticEvent::Added(adapter) => on_add(&client, &config, adapter).await,
                        SyntheticEvent::Deleted(adapter) => {
                            on_delete(&client, &config, adapter).await
                        }
                    }
                }
            }
            Err(err) => error!("failure while watching source workloads: {err}"),
        }
    }
}

fn watch_sources<K>(
    api: Api<K>,
    config: watcher::Config,
    wrap: fn(K) -> SourceAdapter,
) -> BoxStream<'static, Result<Vec<SyntheticEvent>, watcher::Error>>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    watcher(api, config)
        .default_backoff()
        .map(move |next| next.map(|event| events_for(event, wrap)))
        .boxed()
}

/// Project one watch event into synthetic lifecycle events. The initial
/// listing replays every labeled workload as an add, which the idempotent
/// handler absorbs.
fn events_for<K>(event: watcher::Event<K>, wrap: fn(K) -> SourceAdapter) -> Vec<SyntheticEvent> {
    match event {
        watcher::Event::Applied(obj) => vec![SyntheticEvent::Added(wrap(obj))],
        watcher::Event::Deleted(obj) => vec![SyntheticEvent::Deleted(wrap(obj))],
        watcher::Event::Restarted(objs) => objs
            .into_iter()
            .map(|obj| SyntheticEvent::Added(wrap(obj)))
            .collect(),
    }
}

/// A workload acquired the discovery label (or was first listed with it):
/// make sure its mirror CamelApp exists.
async fn on_add(client: &Client, config: &OperatorConfig, adapter: SourceAdapter) {
    let Some(app_name) = adapter.app_name(&config.app_label) else {
        warn!(
            "{} {} matched the watch but carries no {} label value",
            adapter.kind().as_str(),
            adapter.name(),
            config.app_label
        );
        return;
    };
    let namespace = adapter.namespace().unwrap_or_default();
    let apps: Api<CamelApp> = Api::namespaced(client.clone(), &namespace);

    match apps.get(&app_name).await {
        Ok(_) => debug!("synthetic CamelApp {namespace}/{app_name} already exists, skipping"),
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            let Some(app) = adapter.as_camel_app(&config.app_label) else {
                return;
            };
            match apps.create(&PostParams::default(), &app).await {
                Ok(_) => info!(
                    "created synthetic CamelApp {namespace}/{app_name} after {} {}",
                    adapter.kind().as_str(),
                    adapter.name()
                ),
                Err(kube::Error::Api(ae)) if ae.code == 409 => {
                    debug!("synthetic CamelApp {namespace}/{app_name} was created concurrently")
                }
                Err(err) => error!("cannot create synthetic CamelApp {namespace}/{app_name}: {err}"),
            }
        }
        Err(err) => error!("cannot load synthetic CamelApp {namespace}/{app_name}: {err}"),
    }
}

/// The discovery label disappeared (or the workload is gone): drop the
/// mirror. NotFound is fine, the owner reference may have cascaded first.
async fn on_delete(client: &Client, config: &OperatorConfig, adapter: SourceAdapter) {
    let Some(app_name) = adapter.app_name(&config.app_label) else {
        return;
    };
    let namespace = adapter.namespace().unwrap_or_default();
    let apps: Api<CamelApp> = Api::namespaced(client.clone(), &namespace);

    match apps.delete(&app_name, &DeleteParams::default()).await {
        Ok(_) => info!("deleted synthetic CamelApp {namespace}/{app_name}"),
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            debug!("synthetic CamelApp {namespace}/{app_name} is already gone")
        }
        Err(err) => error!("cannot delete synthetic CamelApp {namespace}/{app_name}: {err}"),
    }
}

fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

async fn is_api_installed(client: &Client, api_version: &str, kind: &str) -> bool {
    match client.list_api_group_resources(api_version).await {
        Ok(resources) => resources.resources.iter().any(|r| r.kind == kind),
        Err(err) => {
            debug!("cannot discover {api_version}: {err}");
            false
        }
    }
}

/// Ask the API server whether this service account may watch the resource.
async fn can_watch(client: &Client, group: &str, resource: &str, namespace: Option<&str>) -> bool {
    let review = SelfSubjectAccessReview {
        spec: SelfSubjectAccessReviewSpec {
            resource_attributes: Some(ResourceAttributes {
                group: Some(group.to_owned()),
                resource: Some(resource.to_owned()),
                verb: Some("watch".to_owned()),
                namespace: namespace.map(str::to_owned),
                ..ResourceAttributes::default()
            }),
            ..SelfSubjectAccessReviewSpec::default()
        },
        ..SelfSubjectAccessReview::default()
    };

    let reviews: Api<SelfSubjectAccessReview> = Api::all(client.clone());
    match reviews.create(&PostParams::default(), &review).await {
        Ok(created) => created.status.map(|s| s.allowed).unwrap_or(false),
        Err(err) => {
            warn!("cannot review watch permission for {group}/{resource}: {err}");
            false
        }
    }
}
