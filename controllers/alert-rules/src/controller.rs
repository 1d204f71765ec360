//! Main controller implementation.
//!
//! Wires the per-kind watchers to their work queues and the queues to the
//! reconciler: startup cache synchronization (a hard precondition), one
//! pool of dispatch workers per workload kind, and cooperative shutdown.

use std::sync::Arc;
use std::time::Duration;

use crds::PrometheusRule;
use futures::future::{BoxFuture, FutureExt};
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::{Api, Client, Resource, ResourceExt};
use rule_templates::TemplateRegistry;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ControllerError;
use crate::legacy::LegacySync;
use crate::owner::OwnerResolver;
use crate::queue::WorkQueue;
use crate::reconciler::{Reconciler, WorkloadKind};
use crate::sink::{AlertSink, TracingSink};
use crate::watcher::{object_key, split_key, Cache, ResourceWatcher};

/// Where rendered rules are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputMode {
    /// Typed PrometheusRule resources, one per (workload, template) pair
    PrometheusRules,
    /// Legacy: one shared ConfigMap overwritten wholesale each pass
    ConfigMap {
        /// Namespace of the shared ConfigMap
        namespace: String,
        /// Name of the shared ConfigMap
        name: String,
    },
}

/// Runtime settings resolved from the environment by `main`.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Namespace to watch; `None` watches all namespaces
    pub namespace: Option<String>,
    /// Output mode for rendered rules
    pub output: OutputMode,
    /// How long startup may wait for the caches to synchronize
    pub cache_sync_timeout: Duration,
    /// Dispatch workers per workload kind
    pub workers_per_kind: usize,
}

#[derive(Clone)]
enum Dispatch {
    Crd(Arc<Reconciler>),
    Legacy(Arc<LegacySync>),
}

/// Main controller for annotation-derived alert rules.
pub struct Controller {
    watch_handles: Vec<JoinHandle<Result<(), ControllerError>>>,
    synced: Vec<BoxFuture<'static, ()>>,
    queues: Vec<(WorkloadKind, Arc<WorkQueue>)>,
    dispatch: Dispatch,
    cache_sync_timeout: Duration,
    workers_per_kind: usize,
}

impl Controller {
    /// Creates a controller instance: caches, watchers, queues, and the
    /// reconciler (or the legacy syncer) for the selected output mode.
    pub fn new(
        client: Client,
        templates: TemplateRegistry,
        settings: Settings,
    ) -> Result<Self, ControllerError> {
        info!("Initializing alert rules controller");

        if settings.workers_per_kind == 0 {
            return Err(ControllerError::InvalidConfig(
                "workers per kind must be at least 1".to_string(),
            ));
        }

        let sink: Arc<dyn AlertSink> = Arc::new(TracingSink);

        let ingresses: Cache<Ingress> = Cache::new();
        let deployments: Cache<Deployment> = Cache::new();
        let services: Cache<Service> = Cache::new();

        let ingress_queue = WorkQueue::new("Ingresses", Arc::clone(&sink));
        let deployment_queue = WorkQueue::new("Deployments", Arc::clone(&sink));
        let service_queue = WorkQueue::new("Services", Arc::clone(&sink));

        let mut watch_handles = Vec::new();
        let mut synced: Vec<BoxFuture<'static, ()>> = Vec::new();

        // Workload watchers enqueue their own key on every effective change.
        watch_handles.push(spawn_watcher(
            namespaced_api::<Ingress>(&client, settings.namespace.as_deref()),
            ingresses.clone(),
            "Ingress",
            enqueue_to(Arc::clone(&ingress_queue)),
        ));
        watch_handles.push(spawn_watcher(
            namespaced_api::<Deployment>(&client, settings.namespace.as_deref()),
            deployments.clone(),
            "Deployment",
            enqueue_to(Arc::clone(&deployment_queue)),
        ));
        watch_handles.push(spawn_watcher(
            namespaced_api::<Service>(&client, settings.namespace.as_deref()),
            services.clone(),
            "Service",
            enqueue_to(Arc::clone(&service_queue)),
        ));
        synced.push(wait_for(&ingresses));
        synced.push(wait_for(&deployments));
        synced.push(wait_for(&services));

        let dispatch = match settings.output {
            OutputMode::PrometheusRules => {
                let pods: Cache<Pod> = Cache::new();
                let replica_sets: Cache<ReplicaSet> = Cache::new();
                let rules: Cache<PrometheusRule> = Cache::new();

                // Pods and replica sets only feed the ownership resolver.
                watch_handles.push(spawn_watcher(
                    namespaced_api::<Pod>(&client, settings.namespace.as_deref()),
                    pods.clone(),
                    "Pod",
                    |_: &Pod| {},
                ));
                watch_handles.push(spawn_watcher(
                    namespaced_api::<ReplicaSet>(&client, settings.namespace.as_deref()),
                    replica_sets.clone(),
                    "ReplicaSet",
                    |_: &ReplicaSet| {},
                ));

                // A rule changed or deleted out from under us re-enqueues its
                // owning workload, closing the convergence loop.
                let to_ingress = Arc::clone(&ingress_queue);
                let to_deployment = Arc::clone(&deployment_queue);
                let to_service = Arc::clone(&service_queue);
                watch_handles.push(spawn_watcher(
                    namespaced_api::<PrometheusRule>(&client, settings.namespace.as_deref()),
                    rules.clone(),
                    "PrometheusRule",
                    move |rule: &PrometheusRule| {
                        let Some(owner) =
                            rule.owner_references().iter().find(|o| o.controller == Some(true))
                        else {
                            return;
                        };
                        let Some(namespace) = rule.namespace() else {
                            return;
                        };
                        let key = format!("{namespace}/{}", owner.name);
                        match owner.kind.as_str() {
                            "Ingress" => to_ingress.add(&key),
                            "Deployment" => to_deployment.add(&key),
                            "Service" => to_service.add(&key),
                            other => debug!("PrometheusRule owned by unmanaged kind {other}"),
                        }
                    },
                ));
                synced.push(wait_for(&pods));
                synced.push(wait_for(&replica_sets));
                synced.push(wait_for(&rules));

                let resolver = OwnerResolver::new(
                    services.clone(),
                    pods,
                    replica_sets,
                    deployments.clone(),
                );
                Dispatch::Crd(Arc::new(Reconciler::new(
                    client,
                    templates,
                    resolver,
                    ingresses,
                    deployments,
                    services,
                    rules,
                    Arc::clone(&sink),
                )))
            }
            OutputMode::ConfigMap { namespace, name } => Dispatch::Legacy(Arc::new(
                LegacySync::new(
                    client,
                    templates,
                    ingresses,
                    deployments,
                    services,
                    namespace,
                    name,
                    Arc::clone(&sink),
                ),
            )),
        };

        Ok(Self {
            watch_handles,
            synced,
            queues: vec![
                (WorkloadKind::Ingress, ingress_queue),
                (WorkloadKind::Deployment, deployment_queue),
                (WorkloadKind::Service, service_queue),
            ],
            dispatch,
            cache_sync_timeout: settings.cache_sync_timeout,
            workers_per_kind: settings.workers_per_kind,
        })
    }

    /// Runs the controller until shutdown or a watcher failure.
    pub async fn run(self) -> Result<(), ControllerError> {
        // Dispatching before the caches are complete would diff against a
        // partial world and delete rules that still exist.
        info!("Waiting for caches to synchronize");
        tokio::time::timeout(self.cache_sync_timeout, futures::future::join_all(self.synced))
            .await
            .map_err(|_| ControllerError::CacheSync(self.cache_sync_timeout))?;
        info!("Caches synchronized, starting workers");

        let mut worker_handles = Vec::new();
        for (kind, queue) in &self.queues {
            for _ in 0..self.workers_per_kind {
                worker_handles.push(tokio::spawn(run_worker(
                    Arc::clone(queue),
                    self.dispatch.clone(),
                    *kind,
                )));
            }
        }

        let failure = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                None
            }
            (joined, _, _) = futures::future::select_all(self.watch_handles) => {
                Some(match joined {
                    Err(e) => ControllerError::Watch(format!("watcher panicked: {e}")),
                    Ok(Err(e)) => e,
                    Ok(Ok(())) => ControllerError::Watch("watcher exited unexpectedly".to_string()),
                })
            }
        };

        // Ordered shutdown: stop accepting keys, drain, let in-flight
        // reconciliations finish, then return.
        for (_, queue) in &self.queues {
            queue.shut_down();
        }
        for handle in worker_handles {
            if let Err(e) = handle.await {
                warn!("worker task failed during shutdown: {e}");
            }
        }

        match failure {
            Some(error) => Err(error),
            None => {
                info!("Shutdown complete");
                Ok(())
            }
        }
    }
}

fn namespaced_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = kube::core::NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

fn enqueue_to<K>(queue: Arc<WorkQueue>) -> impl Fn(&K) + Send + Sync + 'static
where
    K: Resource + 'static,
{
    move |obj: &K| queue.add(&object_key(obj))
}

fn wait_for<K: Send + Sync + 'static>(cache: &Cache<K>) -> BoxFuture<'static, ()> {
    let cache = cache.clone();
    async move { cache.wait_synced().await }.boxed()
}

fn spawn_watcher<K, F>(
    api: Api<K>,
    cache: Cache<K>,
    kind: &'static str,
    on_change: F,
) -> JoinHandle<Result<(), ControllerError>>
where
    K: Resource + Clone + std::fmt::Debug + serde::de::DeserializeOwned + Send + Sync + 'static,
    F: Fn(&K) + Send + Sync + 'static,
{
    let watcher = ResourceWatcher::new(api, cache, kind);
    tokio::spawn(async move { watcher.run(on_change).await })
}

/// One dispatch worker: pulls keys, invokes the sync for its kind, and
/// feeds failures back into the queue's retry path. Malformed keys are
/// dropped after logging, never retried.
async fn run_worker(queue: Arc<WorkQueue>, dispatch: Dispatch, kind: WorkloadKind) {
    while let Some(key) = queue.get().await {
        let result = match split_key(&key) {
            None => {
                warn!("dropping malformed key {key:?} from the {} queue", kind.as_str());
                queue.forget(&key);
                Ok(())
            }
            Some((namespace, name)) => match &dispatch {
                Dispatch::Crd(reconciler) => reconciler.sync(kind, namespace, name).await,
                Dispatch::Legacy(legacy) => legacy.sync_all().await,
            },
        };

        match result {
            Ok(()) => {
                queue.forget(&key);
                debug!("successfully synced {} {key}", kind.as_str());
            }
            Err(e) => {
                warn!("error syncing {} {key}: {e}", kind.as_str());
                queue.retry(&key);
            }
        }
        queue.done(&key);
    }
}
