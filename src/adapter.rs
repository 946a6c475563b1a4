use std::collections::BTreeMap;
use std::str::FromStr;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{Container, Pod};
use kube::api::ListParams;
use kube::{Api, Client, ResourceExt};
use tracing::debug;

use crate::api::{
    self, domain_annotations, new_app, owner_reference, CamelApp, CamelAppPhase, PodInfo,
};
use crate::scrape::ObservabilityClient;
use crate::{Error, Result};

/// How many pods of one app are scraped at the same time.
const MAX_CONCURRENT_SCRAPES: usize = 4;

pub use knative::Service as KnativeService;

/// Minimal mirror of the Knative serving Service: we only watch it and read
/// its metadata, so the spec stays an open object.
mod knative {
    use kube::CustomResource;
    use schemars::JsonSchema;
    use serde::{Deserialize, Serialize};

    #[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
    #[kube(
        group = "serving.knative.dev",
        version = "v1",
        kind = "Service",
        namespaced
    )]
    pub struct ServiceSpec {}
}

/// The workload kinds that can back a Camel application.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    Deployment,
    CronJob,
    KnativeService,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Deployment => "Deployment",
            SourceKind::CronJob => "CronJob",
            SourceKind::KnativeService => "KnativeService",
        }
    }

    pub fn api_version(&self) -> &'static str {
        match self {
            SourceKind::Deployment => "apps/v1",
            SourceKind::CronJob => "batch/v1",
            SourceKind::KnativeService => "serving.knative.dev/v1",
        }
    }
}

impl FromStr for SourceKind {
    type Err = Error;

    fn from_str(kind: &str) -> Result<Self> {
        match kind {
            "Deployment" => Ok(SourceKind::Deployment),
            "CronJob" => Ok(SourceKind::CronJob),
            "KnativeService" => Ok(SourceKind::KnativeService),
            other => Err(Error::UnsupportedKind(other.to_owned())),
        }
    }
}

/// Uniform observational facade over a Camel application deployed outside the
/// operator lifecycle, one variant per host-workload kind.
///
/// CronJob and Knative Service are discovery stubs: their phase derivation is
/// not implemented yet, they report no pods and a replica count of -1.
pub enum SourceAdapter {
    Deployment(Box<Deployment>),
    CronJob(Box<CronJob>),
    KnativeService(Box<KnativeService>),
}

/// Look up the source workload a CamelApp was imported from and wrap it.
/// `Ok(None)` means the workload is gone.
pub async fn lookup(
    client: &Client,
    kind: &str,
    namespace: &str,
    name: &str,
) -> Result<Option<SourceAdapter>> {
    match SourceKind::from_str(kind)? {
        SourceKind::Deployment => {
            let deployments: Api<Deployment> = Api::namespaced(client.clone(), namespace);
            Ok(deployments
                .get_opt(name)
                .await?
                .map(SourceAdapter::from_deployment))
        }
        SourceKind::CronJob => {
            let cronjobs: Api<CronJob> = Api::namespaced(client.clone(), namespace);
            Ok(cronjobs.get_opt(name).await?.map(SourceAdapter::from_cronjob))
        }
        SourceKind::KnativeService => {
            let services: Api<KnativeService> = Api::namespaced(client.clone(), namespace);
            Ok(services
                .get_opt(name)
                .await?
                .map(SourceAdapter::from_knative_service))
        }
    }
}

impl SourceAdapter {
    pub fn from_deployment(deploy: Deployment) -> Self {
        SourceAdapter::Deployment(Box::new(deploy))
    }

    pub fn from_cronjob(cron: CronJob) -> Self {
        SourceAdapter::CronJob(Box::new(cron))
    }

    pub fn from_knative_service(ksvc: KnativeService) -> Self {
        SourceAdapter::KnativeService(Box::new(ksvc))
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            SourceAdapter::Deployment(_) => SourceKind::Deployment,
            SourceAdapter::CronJob(_) => SourceKind::CronJob,
            SourceAdapter::KnativeService(_) => SourceKind::KnativeService,
        }
    }

    pub fn name(&self) -> String {
        match self {
            SourceAdapter::Deployment(d) => d.name_any(),
            SourceAdapter::CronJob(c) => c.name_any(),
            SourceAdapter::KnativeService(s) => s.name_any(),
        }
    }

    pub fn namespace(&self) -> Option<String> {
        match self {
            SourceAdapter::Deployment(d) => d.namespace(),
            SourceAdapter::CronJob(c) => c.namespace(),
            SourceAdapter::KnativeService(s) => s.namespace(),
        }
    }

    fn uid(&self) -> Option<String> {
        match self {
            SourceAdapter::Deployment(d) => d.uid(),
            SourceAdapter::CronJob(c) => c.uid(),
            SourceAdapter::KnativeService(s) => s.uid(),
        }
    }

    fn labels(&self) -> &BTreeMap<String, String> {
        match self {
            SourceAdapter::Deployment(d) => d.labels(),
            SourceAdapter::CronJob(c) => c.labels(),
            SourceAdapter::KnativeService(s) => s.labels(),
        }
    }

    /// Annotations of the backing workload object.
    pub fn annotations(&self) -> &BTreeMap<String, String> {
        match self {
            SourceAdapter::Deployment(d) => d.annotations(),
            SourceAdapter::CronJob(c) => c.annotations(),
            SourceAdapter::KnativeService(s) => s.annotations(),
        }
    }

    /// Name of the mirrored app, i.e. the value of the discovery label.
    pub fn app_name(&self, label: &str) -> Option<String> {
        self.labels().get(label).cloned()
    }

    /// Phase of the backing Camel application.
    pub fn app_phase(&self) -> CamelAppPhase {
        match self {
            SourceAdapter::Deployment(d) => {
                let replicas = desired_replicas(d);
                let available = d
                    .status
                    .as_ref()
                    .and_then(|s| s.available_replicas)
                    .unwrap_or(0);
                if replicas == 0 {
                    CamelAppPhase::Paused
                } else if available == replicas {
                    CamelAppPhase::Running
                } else {
                    CamelAppPhase::Error
                }
            }
            SourceAdapter::CronJob(_) | SourceAdapter::KnativeService(_) => CamelAppPhase::Tbd,
        }
    }

    /// Container image of the backing Camel application.
    pub fn image(&self) -> Option<String> {
        match self {
            SourceAdapter::Deployment(d) => primary_container(d).and_then(|c| c.image.clone()),
            SourceAdapter::CronJob(_) | SourceAdapter::KnativeService(_) => None,
        }
    }

    /// Desired replicas; -1 when the notion does not apply to the kind.
    pub fn desired_replicas(&self) -> i32 {
        match self {
            SourceAdapter::Deployment(d) => desired_replicas(d),
            SourceAdapter::CronJob(_) | SourceAdapter::KnativeService(_) => -1,
        }
    }

    /// Enumerate the backing pods and scrape each of them.
    pub async fn pods(
        &self,
        client: Client,
        scraper: &ObservabilityClient,
        observability_port: u16,
    ) -> Result<Vec<PodInfo>> {
        let SourceAdapter::Deployment(deploy) = self else {
            return Ok(Vec::new());
        };
        let namespace = deploy.namespace().unwrap_or_default();
        let selector = match selector_labels(deploy) {
            Some(selector) => selector,
            None => {
                debug!("deployment {} has no pod selector", deploy.name_any());
                return Ok(Vec::new());
            }
        };

        let pods: Api<Pod> = Api::namespaced(client, &namespace);
        let backing = pods.list(&ListParams::default().labels(&selector)).await?;

        let infos = futures::stream::iter(backing.items.into_iter())
            .map(|pod| async move { scraper.pod_info(&pod, observability_port).await })
            .buffered(MAX_CONCURRENT_SCRAPES)
            .collect::<Vec<_>>()
            .await;

        Ok(infos)
    }

    /// Construct the mirror CamelApp for this workload: named after the
    /// discovery label value, annotated with the import origin, and owned by
    /// the source object so cleanup cascades.
    pub fn as_camel_app(&self, label: &str) -> Option<CamelApp> {
        let app_name = self.app_name(label)?;
        let namespace = self.namespace().unwrap_or_default();
        let mut app = new_app(&namespace, &app_name);

        let mut annotations = domain_annotations(self.annotations());
        annotations.insert(api::IMPORTED_NAME_ANNOTATION.to_owned(), self.name());
        annotations.insert(
            api::IMPORTED_KIND_ANNOTATION.to_owned(),
            self.kind().as_str().to_owned(),
        );
        annotations.insert(api::SYNTHETIC_ANNOTATION.to_owned(), "true".to_owned());
        app.metadata.annotations = Some(annotations);

        app.metadata.owner_references = Some(vec![owner_reference(
            self.kind().api_version(),
            self.kind().as_str(),
            &self.name(),
            &self.uid().unwrap_or_default(),
        )]);

        Some(app)
    }
}

fn desired_replicas(deploy: &Deployment) -> i32 {
    // the platform defaults an unset replica count to one
    deploy.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1)
}

/// The container running the Camel application: the one named after the
/// deployment when present, the first one otherwise.
fn primary_container(deploy: &Deployment) -> Option<&Container> {
    let containers = &deploy.spec.as_ref()?.template.spec.as_ref()?.containers;
    containers
        .iter()
        .find(|c| c.name == deploy.name_any())
        .or_else(|| containers.first())
}

fn selector_labels(deploy: &Deployment) -> Option<String> {
    let labels = deploy.spec.as_ref()?.selector.match_labels.as_ref()?;
    if labels.is_empty() {
        return None;
    }
    Some(
        labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(","),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{DeploymentSpec, DeploymentStatus};
    use k8s_openapi::api::core::v1::PodTemplateSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
    use kube::core::ObjectMeta;

    fn deployment(name: &str, replicas: Option<i32>, available: Option<i32>) -> Deployment {
        let mut labels = BTreeMap::new();
        labels.insert(api::APP_LABEL.to_owned(), "demo".to_owned());
        let mut annotations = BTreeMap::new();
        annotations.insert(
            "camel.apache.org/polling-interval-seconds".to_owned(),
            "30".to_owned(),
        );
        annotations.insert("team".to_owned(), "integrations".to_owned());

        let mut match_labels = BTreeMap::new();
        match_labels.insert("app".to_owned(), name.to_owned());

        Deployment {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some("ns1".to_owned()),
                uid: Some("uid-1234".to_owned()),
                labels: Some(labels),
                annotations: Some(annotations),
                ..ObjectMeta::default()
            },
            spec: Some(DeploymentSpec {
                replicas,
                selector: LabelSelector {
                    match_labels: Some(match_labels),
                    ..LabelSelector::default()
                },
                template: PodTemplateSpec {
                    spec: Some(k8s_openapi::api::core::v1::PodSpec {
                        containers: vec![Container {
                            name: name.to_owned(),
                            image: Some("img:1".to_owned()),
                            ..Container::default()
                        }],
                        ..k8s_openapi::api::core::v1::PodSpec::default()
                    }),
                    ..PodTemplateSpec::default()
                },
                ..DeploymentSpec::default()
            }),
            status: available.map(|a| DeploymentStatus {
                available_replicas: Some(a),
                ..DeploymentStatus::default()
            }),
            ..Deployment::default()
        }
    }

    #[test]
    fn phase_is_total_over_replica_combinations() {
        let cases = [
            (Some(0), Some(0), CamelAppPhase::Paused),
            (Some(0), None, CamelAppPhase::Paused),
            (Some(2), Some(2), CamelAppPhase::Running),
            (Some(2), Some(1), CamelAppPhase::Error),
            (Some(2), None, CamelAppPhase::Error),
            (Some(1), Some(2), CamelAppPhase::Error),
            (None, Some(1), CamelAppPhase::Running),
            (None, None, CamelAppPhase::Error),
        ];
        for (replicas, available, expected) in cases {
            let adapter = SourceAdapter::from_deployment(deployment("demo", replicas, available));
            assert_eq!(
                adapter.app_phase(),
                expected,
                "replicas={replicas:?} available={available:?}"
            );
        }
    }

    #[test]
    fn deployment_reports_image_and_replicas() {
        let adapter = SourceAdapter::from_deployment(deployment("demo", Some(2), Some(2)));
        assert_eq!(adapter.image().as_deref(), Some("img:1"));
        assert_eq!(adapter.desired_replicas(), 2);
    }

    #[test]
    fn primary_container_prefers_the_one_named_after_the_deployment() {
        let mut deploy = deployment("demo", Some(1), Some(1));
        let containers = &mut deploy
            .spec
            .as_mut()
            .unwrap()
            .template
            .spec
            .as_mut()
            .unwrap()
            .containers;
        containers.insert(
            0,
            Container {
                name: "sidecar".to_owned(),
                image: Some("sidecar:1".to_owned()),
                ..Container::default()
            },
        );

        let adapter = SourceAdapter::from_deployment(deploy);
        assert_eq!(adapter.image().as_deref(), Some("img:1"));
    }

    #[test]
    fn primary_container_falls_back_to_the_first_one() {
        let mut deploy = deployment("demo", Some(1), Some(1));
        deploy
            .spec
            .as_mut()
            .unwrap()
            .template
            .spec
            .as_mut()
            .unwrap()
            .containers[0]
            .name = "runner".to_owned();

        let adapter = SourceAdapter::from_deployment(deploy);
        assert_eq!(adapter.image().as_deref(), Some("img:1"));
    }

    #[test]
    fn as_camel_app_builds_the_mirror_resource() {
        let adapter = SourceAdapter::from_deployment(deployment("demo-deploy", Some(2), Some(2)));
        let app = adapter.as_camel_app(api::APP_LABEL).expect("app built");

        assert_eq!(app.metadata.name.as_deref(), Some("demo"));
        assert_eq!(app.metadata.namespace.as_deref(), Some("ns1"));

        let annotations = app.metadata.annotations.expect("annotations set");
        assert_eq!(
            annotations.get(api::IMPORTED_KIND_ANNOTATION).map(String::as_str),
            Some("Deployment")
        );
        assert_eq!(
            annotations.get(api::IMPORTED_NAME_ANNOTATION).map(String::as_str),
            Some("demo-deploy")
        );
        assert_eq!(
            annotations.get(api::SYNTHETIC_ANNOTATION).map(String::as_str),
            Some("true")
        );
        // domain annotations carried over, foreign ones dropped
        assert!(annotations.contains_key("camel.apache.org/polling-interval-seconds"));
        assert!(!annotations.contains_key("team"));

        let owners = app.metadata.owner_references.expect("owner set");
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].kind, "Deployment");
        assert_eq!(owners[0].api_version, "apps/v1");
        assert_eq!(owners[0].name, "demo-deploy");
        assert_eq!(owners[0].uid, "uid-1234");
        assert_eq!(owners[0].controller, Some(true));
    }

    #[test]
    fn as_camel_app_requires_the_discovery_label() {
        let mut deploy = deployment("demo-deploy", Some(1), Some(1));
        deploy.metadata.labels = None;
        let adapter = SourceAdapter::from_deployment(deploy);
        assert!(adapter.as_camel_app(api::APP_LABEL).is_none());
    }

    #[test]
    fn cronjob_adapter_is_a_discovery_stub() {
        let cron = CronJob {
            metadata: ObjectMeta {
                name: Some("nightly".to_owned()),
                namespace: Some("ns1".to_owned()),
                uid: Some("uid-c".to_owned()),
                labels: Some(
                    [(api::APP_LABEL.to_owned(), "nightly-app".to_owned())]
                        .into_iter()
                        .collect(),
                ),
                ..ObjectMeta::default()
            },
            ..CronJob::default()
        };
        let adapter = SourceAdapter::from_cronjob(cron);

        assert_eq!(adapter.app_phase(), CamelAppPhase::Tbd);
        assert_eq!(adapter.desired_replicas(), -1);
        assert_eq!(adapter.image(), None);

        let app = adapter.as_camel_app(api::APP_LABEL).expect("app built");
        let owners = app.metadata.owner_references.expect("owner set");
        assert_eq!(owners[0].api_version, "batch/v1");
        assert_eq!(owners[0].kind, "CronJob");
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let err = SourceKind::from_str("StatefulSet").unwrap_err();
        assert!(matches!(err, Error::UnsupportedKind(_)));
    }

    #[test]
    fn source_kind_round_trips_the_annotation_value() {
        for kind in [
            SourceKind::Deployment,
            SourceKind::CronJob,
            SourceKind::KnativeService,
        ] {
            assert_eq!(SourceKind::from_str(kind.as_str()).unwrap(), kind);
        }
    }
}
