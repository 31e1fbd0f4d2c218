use chrono::Utc;
use pkg_state::label_index::LabelIndex;
use pkg_state::watch::{PodEvent, PodEventKind, PodEventLog};
use pkg_types::endpoint::{EndpointAddress, EndpointDiff, EndpointPort, EndpointSet, Endpoints};
use pkg_types::config::RetryConfig;
use pkg_types::pod::Pod;
use pkg_types::selector;
use pkg_types::service::{Service, TargetPort};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Notify, RwLock, watch};
use tracing::{debug, info, warn};

use crate::error::EndpointError;
use crate::publish::StatusSink;

/// Result of one reconciliation pass for a Service.
#[derive(Debug, Clone, Default)]
pub struct Reconciliation {
    pub endpoints: EndpointSet,
    pub diff: EndpointDiff,
    /// Matched, serving pods left out of the set, sorted by pod identity
    pub excluded: Vec<EndpointError>,
}

/// Recompute a Service's endpoint set from the label index and diff it
/// against `previous`.
///
/// Only pods in the Service's namespace that match its selector and are
/// Running and ready are considered. A Service with an empty selector
/// manages no endpoints.
pub fn reconcile_service(
    service: &Service,
    index: &LabelIndex,
    previous: &EndpointSet,
) -> Reconciliation {
    let mut excluded = Vec::new();
    let endpoints: EndpointSet = if service.selector.is_empty() {
        EndpointSet::default()
    } else {
        index
            .pods_in_namespace(&service.namespace)
            .into_iter()
            .filter(|pod| selector::matches(&service.selector, &pod.labels))
            .filter(|pod| pod.is_serving())
            .filter_map(|pod| match project(service, &pod) {
                Ok(Some(addr)) => Some((pod.key(), addr)),
                Ok(None) => None,
                Err(e) => {
                    excluded.push(e);
                    None
                }
            })
            .collect()
    };
    excluded.sort_by(|a, b| a.pod().cmp(b.pod()));

    let diff = endpoints.diff(previous);
    Reconciliation {
        endpoints,
        diff,
        excluded,
    }
}

/// Map each Service port onto the pod. `Ok(None)` when the pod has no IP yet.
fn project(service: &Service, pod: &Pod) -> Result<Option<EndpointAddress>, EndpointError> {
    let Some(ip) = pod.ip.clone() else {
        debug!(
            "Service {}: pod {} is ready but has no IP, skipping",
            service.key(),
            pod.key()
        );
        return Ok(None);
    };

    let mut ports = Vec::with_capacity(service.ports.len());
    for svc_port in &service.ports {
        let port = match svc_port.target() {
            TargetPort::Number(n) => n,
            TargetPort::Name(name) => match pod.named_port(&name) {
                Some(cp) => cp.container_port,
                None => {
                    return Err(EndpointError::PortNameNotFound {
                        service: service.key(),
                        pod: pod.key(),
                        port: name,
                    });
                }
            },
        };
        ports.push(EndpointPort {
            name: svc_port.name.clone(),
            port,
            protocol: svc_port.protocol.clone(),
        });
    }

    Ok(Some(EndpointAddress {
        ip,
        ports,
        ready: true,
    }))
}

/// Timing knobs of the endpoint controller.
#[derive(Debug, Clone)]
pub struct EndpointControllerConfig {
    /// Events for one Service arriving within this window share one recompute
    pub debounce: Duration,
    /// Period of the full resynchronization pass
    pub resync_interval: Duration,
    /// Backoff between attempts to publish after the sink failed
    pub publish_retry: RetryConfig,
}

impl Default for EndpointControllerConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(pkg_constants::controller::DEFAULT_DEBOUNCE_MS),
            resync_interval: Duration::from_secs(
                pkg_constants::controller::DEFAULT_RESYNC_INTERVAL_SECS,
            ),
            publish_retry: RetryConfig::default(),
        }
    }
}

/// Per-Service reconciliation loop handle.
struct ServiceWorker {
    spec: watch::Sender<Service>,
    dirty: Arc<Notify>,
    task: tokio::task::JoinHandle<()>,
}

/// Controller that keeps every registered Service's endpoint set in line
/// with the pod population.
///
/// A dispatcher task applies pod events to the label index and wakes the
/// workers of the Services the change could affect. Each Service has its own
/// worker, so Services reconcile independently.
#[derive(Clone)]
pub struct EndpointController {
    index: LabelIndex,
    events: PodEventLog,
    sink: Arc<dyn StatusSink>,
    config: EndpointControllerConfig,
    services: Arc<RwLock<HashMap<String, ServiceWorker>>>,
}

impl EndpointController {
    pub fn new(
        index: LabelIndex,
        events: PodEventLog,
        sink: Arc<dyn StatusSink>,
        config: EndpointControllerConfig,
    ) -> Self {
        Self {
            index,
            events,
            sink,
            config,
            services: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn index(&self) -> &LabelIndex {
        &self.index
    }

    /// Register a Service, or replace a registered one. Either
    /// way the Service is reconciled right away.
    pub async fn apply_service(&self, service: Service) {
        let key = service.key();
        let mut services = self.services.write().await;
        if let Some(worker) = services.get(&key) {
            info!("Service {}: spec updated (selector '{}')", key, service.selector);
            worker.spec.send_replace(service);
            return;
        }

        info!("Service {}: registered (selector '{}')", key, service.selector);
        let (spec_tx, spec_rx) = watch::channel(service);
        let dirty = Arc::new(Notify::new());
        let task = tokio::spawn(run_service_worker(
            self.index.clone(),
            self.sink.clone(),
            spec_rx,
            dirty.clone(),
            self.config.debounce,
            self.config.publish_retry.clone(),
        ));
        services.insert(
            key,
            ServiceWorker {
                spec: spec_tx,
                dirty,
                task,
            },
        );
    }

    /// Stop reconciling a Service and unpublish its endpoints.
    pub async fn remove_service(&self, namespace: &str, name: &str) -> anyhow::Result<()> {
        let key = format!("{}/{}", namespace, name);
        let Some(worker) = self.services.write().await.remove(&key) else {
            return Ok(());
        };
        worker.task.abort();
        let _ = worker.task.await;
        self.sink.remove_endpoints(namespace, name).await?;
        info!("Service {}: removed", key);
        Ok(())
    }

    /// Apply one pod event to the index and wake every Service whose
    /// selector matched the pod before or after the change.
    pub async fn handle_event(&self, event: &PodEvent) {
        let previous = match event.kind {
            PodEventKind::Created | PodEventKind::Updated => self.index.upsert(event.pod.clone()),
            PodEventKind::Deleted => self.index.remove(&event.pod.key()),
        };
        if event.kind != PodEventKind::Deleted
            && previous.as_deref().is_some_and(|p| *p == event.pod)
        {
            return;
        }

        let services = self.services.read().await;
        for worker in services.values() {
            let svc = worker.spec.borrow();
            if svc.namespace != event.pod.namespace {
                continue;
            }
            let before = previous
                .as_deref()
                .is_some_and(|p| selector::matches(&svc.selector, &p.labels));
            let after = event.kind != PodEventKind::Deleted
                && selector::matches(&svc.selector, &event.pod.labels);
            if before || after {
                worker.dirty.notify_one();
            }
        }
    }

    /// Re-list every pod, rebuild the index, and recompute every Service.
    /// Returns the sequence number the listing reflects.
    pub async fn resync(&self) -> u64 {
        let (seq, pods) = self.events.list().await;
        let count = pods.len();
        self.index.replace_all(pods);
        let services = self.services.read().await;
        for worker in services.values() {
            worker.dirty.notify_one();
        }
        info!(
            "EndpointController resync: {} pods, {} services (seq={})",
            count,
            services.len(),
            seq
        );
        seq
    }

    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "EndpointController started (debounce={}ms, resync={}s)",
                self.config.debounce.as_millis(),
                self.config.resync_interval.as_secs()
            );
            // Subscribe before listing so nothing between the two is lost.
            let mut rx = self.events.subscribe();
            let mut last_seq = self.resync().await;
            let mut resync = tokio::time::interval(self.config.resync_interval);
            resync.tick().await;

            loop {
                tokio::select! {
                    received = rx.recv() => match received {
                        Ok(event) => {
                            if event.seq <= last_seq {
                                continue;
                            }
                            if event.seq != last_seq + 1 {
                                warn!(
                                    "EndpointController: event gap ({} -> {}), resyncing",
                                    last_seq, event.seq
                                );
                                last_seq = self.resync().await;
                                continue;
                            }
                            self.handle_event(&event).await;
                            last_seq = event.seq;
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(
                                "EndpointController: lagged {} events, resyncing",
                                skipped
                            );
                            last_seq = self.resync().await;
                        }
                        Err(RecvError::Closed) => {
                            info!("EndpointController: event source closed");
                            break;
                        }
                    },
                    _ = resync.tick() => {
                        last_seq = self.resync().await;
                    }
                }
            }
        })
    }

    /// Stop every Service worker without unpublishing.
    pub async fn shutdown(&self) {
        let mut services = self.services.write().await;
        for (_, worker) in services.drain() {
            worker.task.abort();
        }
    }
}

async fn run_service_worker(
    index: LabelIndex,
    sink: Arc<dyn StatusSink>,
    mut spec: watch::Receiver<Service>,
    dirty: Arc<Notify>,
    debounce: Duration,
    retry: RetryConfig,
) {
    let mut previous = EndpointSet::default();
    // The sink holds `previous`.
    let mut synced = false;
    let mut failures = 0u32;
    let mut first = true;
    loop {
        if !first {
            let backoff = retry.delay_for(failures);
            tokio::select! {
                _ = dirty.notified() => {}
                _ = tokio::time::sleep(backoff), if failures > 0 => {}
                changed = spec.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            if !debounce.is_zero() {
                tokio::time::sleep(debounce).await;
            }
        }
        first = false;

        let service = spec.borrow_and_update().clone();
        let result = reconcile_service(&service, &index, &previous);
        for err in &result.excluded {
            warn!("{}", err);
        }
        if synced && result.diff.is_empty() {
            continue;
        }

        info!(
            "Service {}: endpoints {} ({} ready)",
            service.key(),
            result.diff,
            result.endpoints.len()
        );
        let record = Endpoints {
            service_name: service.name.clone(),
            namespace: service.namespace.clone(),
            endpoints: result.endpoints,
            updated_at: Utc::now(),
        };
        match sink.publish_endpoints(&record).await {
            Ok(()) => {
                previous = record.endpoints;
                synced = true;
                failures = 0;
            }
            Err(e) => {
                failures += 1;
                synced = false;
                warn!(
                    "Service {}: failed to publish endpoints (attempt {}): {}",
                    service.key(),
                    failures,
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish::MemoryPublisher;
    use async_trait::async_trait;
    use pkg_types::pod::{ContainerPort, PodPhase};
    use pkg_types::service::ServicePort;
    use pkg_types::statefulset::OrdinalStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn make_pod(name: &str, labels: &[(&str, &str)], ready: bool) -> Pod {
        let mut pod = Pod::new("default", name);
        pod.labels = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        pod.phase = PodPhase::Running;
        pod.ready = ready;
        pod.ip = Some(format!("10.0.0.{}", name.len()));
        pod.ports = vec![ContainerPort {
            name: Some("http".to_string()),
            container_port: 8080,
            protocol: "TCP".to_string(),
        }];
        pod
    }

    fn make_service(selector: &str, target: TargetPort) -> Service {
        Service {
            name: "web".to_string(),
            namespace: "default".to_string(),
            selector: selector.parse().unwrap(),
            ports: vec![ServicePort {
                name: "http".to_string(),
                port: 80,
                target_port: Some(target),
                protocol: "TCP".to_string(),
            }],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn selects_matching_ready_pods() {
        let index = LabelIndex::new();
        index.upsert(make_pod("p1", &[("app", "web"), ("tier", "frontend")], true));
        index.upsert(make_pod("p2", &[("app", "web"), ("tier", "backend")], true));
        index.upsert(make_pod("p3", &[("app", "web"), ("tier", "edge")], false));

        let svc = make_service("app=web, tier in (frontend,edge)", TargetPort::Number(8080));
        let result = reconcile_service(&svc, &index, &EndpointSet::default());

        assert_eq!(result.endpoints.identities(), vec!["default/p1"]);
        assert_eq!(result.diff.added, vec!["default/p1"]);
        assert!(result.excluded.is_empty());
    }

    #[test]
    fn never_includes_unready_or_non_running_pods() {
        let index = LabelIndex::new();
        index.upsert(make_pod("ready", &[("app", "web")], true));
        index.upsert(make_pod("unready", &[("app", "web")], false));
        let mut pending = make_pod("pending", &[("app", "web")], true);
        pending.phase = PodPhase::Pending;
        index.upsert(pending);
        let mut terminating = make_pod("terminating", &[("app", "web")], true);
        terminating.phase = PodPhase::Terminating;
        index.upsert(terminating);

        let svc = make_service("app=web", TargetPort::Number(8080));
        let result = reconcile_service(&svc, &index, &EndpointSet::default());
        assert_eq!(result.endpoints.identities(), vec!["default/ready"]);
        assert!(result.endpoints.iter().all(|(_, a)| a.ready));
    }

    #[test]
    fn empty_add_remove_roundtrip() {
        let index = LabelIndex::new();
        let svc = make_service("app=web", TargetPort::Number(8080));

        let empty = reconcile_service(&svc, &index, &EndpointSet::default());
        assert!(empty.endpoints.is_empty());
        assert!(empty.diff.is_empty());

        index.upsert(make_pod("p1", &[("app", "web")], true));
        let one = reconcile_service(&svc, &index, &empty.endpoints);
        assert_eq!(one.endpoints.len(), 1);
        assert_eq!(one.diff.added, vec!["default/p1"]);

        index.remove("default/p1");
        let back = reconcile_service(&svc, &index, &one.endpoints);
        assert!(back.endpoints.is_empty());
        assert_eq!(back.diff.removed, vec!["default/p1"]);
    }

    #[test]
    fn named_port_resolution_excludes_only_missing_pods() {
        let index = LabelIndex::new();
        index.upsert(make_pod("with-port", &[("app", "web")], true));
        let mut without = make_pod("without-port", &[("app", "web")], true);
        without.ports.clear();
        index.upsert(without);

        let svc = make_service("app=web", TargetPort::Name("http".to_string()));
        let result = reconcile_service(&svc, &index, &EndpointSet::default());

        assert_eq!(result.endpoints.identities(), vec!["default/with-port"]);
        assert_eq!(
            result.endpoints.sorted_pairs(),
            vec![("default/with-port".to_string(), "10.0.0.9".to_string(), 8080)]
        );
        assert_eq!(
            result.excluded,
            vec![EndpointError::PortNameNotFound {
                service: "default/web".to_string(),
                pod: "default/without-port".to_string(),
                port: "http".to_string(),
            }]
        );
    }

    #[test]
    fn empty_selector_and_other_namespaces_select_nothing() {
        let index = LabelIndex::new();
        let mut elsewhere = make_pod("p1", &[("app", "web")], true);
        elsewhere.namespace = "staging".to_string();
        index.upsert(elsewhere);
        index.upsert(make_pod("p2", &[("app", "api")], true));

        let scoped = make_service("app=web", TargetPort::Number(8080));
        assert!(reconcile_service(&scoped, &index, &EndpointSet::default())
            .endpoints
            .is_empty());

        let unselected = make_service("", TargetPort::Number(8080));
        assert!(reconcile_service(&unselected, &index, &EndpointSet::default())
            .endpoints
            .is_empty());
    }

    #[test]
    fn pods_without_ip_are_skipped() {
        let index = LabelIndex::new();
        let mut pod = make_pod("p1", &[("app", "web")], true);
        pod.ip = None;
        index.upsert(pod);
        let svc = make_service("app=web", TargetPort::Number(8080));
        let result = reconcile_service(&svc, &index, &EndpointSet::default());
        assert!(result.endpoints.is_empty());
        assert!(result.excluded.is_empty());
    }

    async fn wait_for_endpoints(sink: &MemoryPublisher, key: &str, want: usize) -> Endpoints {
        for _ in 0..200 {
            if let Some(eps) = sink.endpoints(key).await
                && eps.endpoints.len() == want
            {
                return eps;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("endpoints for {} never reached {}", key, want);
    }

    fn controller(sink: &MemoryPublisher, events: &PodEventLog) -> EndpointController {
        EndpointController::new(
            LabelIndex::new(),
            events.clone(),
            Arc::new(sink.clone()),
            EndpointControllerConfig {
                debounce: Duration::from_millis(20),
                resync_interval: Duration::from_secs(3600),
                publish_retry: RetryConfig {
                    initial_delay_ms: 10,
                    max_delay_ms: 40,
                    backoff_factor: 2.0,
                },
            },
        )
    }

    #[tokio::test]
    async fn follows_label_changes_and_deletions() {
        let events = PodEventLog::new(64);
        let sink = MemoryPublisher::new();
        let ctrl = controller(&sink, &events);
        ctrl.apply_service(make_service("app=web", TargetPort::Number(8080)))
            .await;
        let handle = ctrl.clone().start();

        events.apply(make_pod("p1", &[("app", "web")], true)).await;
        events.apply(make_pod("p2", &[("app", "web")], true)).await;
        wait_for_endpoints(&sink, "default/web", 2).await;

        // Relabel p1 away from the selector.
        events.apply(make_pod("p1", &[("app", "api")], true)).await;
        let eps = wait_for_endpoints(&sink, "default/web", 1).await;
        assert!(eps.endpoints.contains("default/p2"));

        events.delete("default/p2").await;
        wait_for_endpoints(&sink, "default/web", 0).await;

        ctrl.remove_service("default", "web").await.unwrap();
        assert!(sink.endpoints("default/web").await.is_none());
        handle.abort();
    }

    #[tokio::test]
    async fn selector_change_recomputes() {
        let events = PodEventLog::new(64);
        let sink = MemoryPublisher::new();
        let ctrl = controller(&sink, &events);
        events.apply(make_pod("p1", &[("app", "web")], true)).await;
        events.apply(make_pod("p2", &[("app", "api")], true)).await;
        let handle = ctrl.clone().start();

        ctrl.apply_service(make_service("app=web", TargetPort::Number(8080)))
            .await;
        wait_for_endpoints(&sink, "default/web", 1).await;

        ctrl.apply_service(make_service("app in (web,api)", TargetPort::Number(8080)))
            .await;
        wait_for_endpoints(&sink, "default/web", 2).await;
        handle.abort();
        ctrl.shutdown().await;
    }

    #[tokio::test]
    async fn coalesces_bursts() {
        let events = PodEventLog::new(256);
        let sink = MemoryPublisher::new();
        let ctrl = EndpointController::new(
            LabelIndex::new(),
            events.clone(),
            Arc::new(sink.clone()),
            EndpointControllerConfig {
                debounce: Duration::from_millis(200),
                resync_interval: Duration::from_secs(3600),
                ..Default::default()
            },
        );
        ctrl.apply_service(make_service("app=web", TargetPort::Number(8080)))
            .await;
        let handle = ctrl.clone().start();
        wait_for_endpoints(&sink, "default/web", 0).await;
        let before = sink.endpoint_publications().await;

        for i in 0..20 {
            events
                .apply(make_pod(&format!("p{}", i), &[("app", "web")], true))
                .await;
        }
        wait_for_endpoints(&sink, "default/web", 20).await;
        let after = sink.endpoint_publications().await;
        assert!(after - before < 20, "expected coalescing, got {} publications", after - before);
        handle.abort();
        ctrl.shutdown().await;
    }

    #[tokio::test]
    async fn resync_rebuilds_from_listing() {
        let events = PodEventLog::new(64);
        let sink = MemoryPublisher::new();
        let ctrl = controller(&sink, &events);
        // Stale entry that the event source no longer knows about.
        ctrl.index().upsert(make_pod("ghost", &[("app", "web")], true));
        events.apply(make_pod("p1", &[("app", "web")], true)).await;

        let seq = ctrl.resync().await;
        assert_eq!(seq, 1);
        assert!(ctrl.index().get_pod("default/ghost").is_none());

        ctrl.apply_service(make_service("app=web", TargetPort::Number(8080)))
            .await;
        let eps = wait_for_endpoints(&sink, "default/web", 1).await;
        assert!(eps.endpoints.contains("default/p1"));
        ctrl.shutdown().await;
    }

    /// Fails the endpoint publications whose 1-based number is in `failing`.
    struct FlakySink {
        inner: MemoryPublisher,
        calls: AtomicUsize,
        failing: Vec<usize>,
    }

    #[async_trait]
    impl StatusSink for FlakySink {
        async fn publish_endpoints(&self, endpoints: &Endpoints) -> anyhow::Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.failing.contains(&call) {
                anyhow::bail!("store unavailable");
            }
            self.inner.publish_endpoints(endpoints).await
        }

        async fn remove_endpoints(&self, namespace: &str, service: &str) -> anyhow::Result<()> {
            self.inner.remove_endpoints(namespace, service).await
        }

        async fn publish_ordinals(&self, status: &OrdinalStatus) -> anyhow::Result<()> {
            self.inner.publish_ordinals(status).await
        }
    }

    #[tokio::test]
    async fn failed_publish_is_retried_without_new_events() {
        let events = PodEventLog::new(64);
        let memory = MemoryPublisher::new();
        let sink = Arc::new(FlakySink {
            inner: memory.clone(),
            calls: AtomicUsize::new(0),
            failing: vec![2, 3],
        });
        let ctrl = EndpointController::new(
            LabelIndex::new(),
            events.clone(),
            sink.clone(),
            EndpointControllerConfig {
                debounce: Duration::from_millis(5),
                resync_interval: Duration::from_secs(3600),
                publish_retry: RetryConfig {
                    initial_delay_ms: 10,
                    max_delay_ms: 40,
                    backoff_factor: 2.0,
                },
            },
        );
        ctrl.apply_service(make_service("app=web", TargetPort::Number(8080)))
            .await;
        let handle = ctrl.clone().start();
        wait_for_endpoints(&memory, "default/web", 0).await;

        events.apply(make_pod("p1", &[("app", "web")], true)).await;
        let eps = wait_for_endpoints(&memory, "default/web", 1).await;
        assert!(eps.endpoints.contains("default/p1"));
        assert_eq!(sink.calls.load(Ordering::SeqCst), 4);
        handle.abort();
        ctrl.shutdown().await;
    }

    #[tokio::test]
    async fn lagging_dispatcher_recovers_by_relisting() {
        let events = PodEventLog::new(2);
        let sink = MemoryPublisher::new();
        let ctrl = controller(&sink, &events);
        ctrl.apply_service(make_service("app=web", TargetPort::Number(8080)))
            .await;
        let handle = ctrl.clone().start();
        wait_for_endpoints(&sink, "default/web", 0).await;

        // Stall the dispatcher on the service table while the log overflows.
        let stall = ctrl.services.write().await;
        for i in 0..10 {
            events
                .apply(make_pod(&format!("p{}", i), &[("app", "web")], true))
                .await;
        }
        assert!(events.events_since(0).await.is_none());
        drop(stall);

        let eps = wait_for_endpoints(&sink, "default/web", 10).await;
        assert!(eps.endpoints.contains("default/p0"));
        assert_eq!(ctrl.index().len(), 10);
        handle.abort();
        ctrl.shutdown().await;
    }
}
