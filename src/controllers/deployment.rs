use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
    time::Duration,
};

use anyhow::anyhow;
use futures_util::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    api::ListParams,
    runtime::{watcher, WatchStreamExt},
    Api, ResourceExt,
};
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// Relist cadence; heals watch events dropped without an error.
pub const RESYNC_PERIOD: Duration = Duration::from_secs(30);

/// Which namespaces the informer watches and serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespaceScope {
    All,
    Single(String),
    /// Watch everywhere, filter reads to the listed namespaces.
    Filtered(BTreeSet<String>),
}

impl NamespaceScope {
    /// Parse the configuration string: empty or `all` means every
    /// namespace, a comma-separated list restricts reads, anything else is
    /// a single namespace.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() || raw.eq_ignore_ascii_case("all") {
            return NamespaceScope::All;
        }
        if raw.contains(',') {
            let namespaces = raw
                .split(',')
                .map(str::trim)
                .filter(|ns| !ns.is_empty())
                .map(str::to_string)
                .collect();
            return NamespaceScope::Filtered(namespaces);
        }
        NamespaceScope::Single(raw.to_string())
    }

    pub fn allows(&self, namespace: &str) -> bool {
        match self {
            NamespaceScope::All => true,
            NamespaceScope::Single(ns) => ns == namespace,
            NamespaceScope::Filtered(namespaces) => namespaces.contains(namespace),
        }
    }
}

type Key = (String, String);

/// Long-lived watch over Deployments with an in-memory cache.
///
/// The cache is written only by the watch loop; readers take filtered
/// snapshots through [`names`](Self::names) and
/// [`names_with_namespace`](Self::names_with_namespace). Never authoritative
/// for reconciliation.
#[derive(Clone)]
pub struct DeploymentWatcher {
    scope: Arc<NamespaceScope>,
    store: Arc<RwLock<HashMap<Key, Deployment>>>,
    synced: Arc<AtomicBool>,
}

impl DeploymentWatcher {
    pub fn new(scope: NamespaceScope) -> Self {
        DeploymentWatcher {
            scope: Arc::new(scope),
            store: Arc::new(RwLock::new(HashMap::new())),
            synced: Arc::new(AtomicBool::new(false)),
        }
    }

    /// True once an initial listing has populated the cache.
    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Relaxed)
    }

    /// Deployment names in scope, sorted.
    pub fn names(&self) -> Vec<String> {
        let store = self.read();
        let mut names: Vec<String> = store
            .iter()
            .filter(|((ns, _), _)| self.scope.allows(ns))
            .map(|((_, name), _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// `(namespace, name)` pairs in scope, sorted.
    pub fn names_with_namespace(&self) -> Vec<(String, String)> {
        let store = self.read();
        let mut entries: Vec<(String, String)> =
            store.keys().filter(|(ns, _)| self.scope.allows(ns)).cloned().collect();
        entries.sort();
        entries
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Key, Deployment>> {
        self.store.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Key, Deployment>> {
        self.store.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn len(&self) -> usize {
        self.read().len()
    }

    pub(crate) fn on_applied(&self, dep: &Deployment) {
        let ns = dep.namespace().unwrap_or_default();
        let name = dep.name_any();
        let key = (ns.clone(), name.clone());

        let previous = { self.read().get(&key).cloned() };
        self.write().insert(key, dep.clone());

        match previous {
            None => {
                info!("deployment added: {ns}/{name} (cache size: {})", self.len());
            }
            Some(old) => {
                let changes = spec_changes(&old, dep);
                if !changes.is_empty() {
                    info!("deployment updated: {ns}/{name} - changes: {}", changes.join(", "));
                    return;
                }
                let status = status_changes(&old, dep);
                if !status.is_empty() {
                    info!(
                        "deployment status updated: {ns}/{name} - changes: {}",
                        status.join(", ")
                    );
                } else {
                    info!(
                        "deployment status updated: {ns}/{name} (generation: {} -> {})",
                        old.metadata.generation.unwrap_or(0),
                        dep.metadata.generation.unwrap_or(0)
                    );
                }
            }
        }
    }

    pub(crate) fn on_deleted(&self, dep: &Deployment) {
        let ns = dep.namespace().unwrap_or_default();
        let name = dep.name_any();
        self.write().remove(&(ns.clone(), name.clone()));
        info!("deployment deleted: {ns}/{name} (cache size: {})", self.len());
    }

    pub(crate) fn on_resync(&self, deployments: Vec<Deployment>) {
        let mut fresh = HashMap::with_capacity(deployments.len());
        for dep in deployments {
            let key = (dep.namespace().unwrap_or_default(), dep.name_any());
            fresh.insert(key, dep);
        }
        let count = fresh.len();
        *self.write() = fresh;
        self.synced.store(true, Ordering::Relaxed);
        debug!("deployment cache resynced with {count} deployments");
    }

    /// Watch Deployments until the token fires, relisting every
    /// [`RESYNC_PERIOD`] to keep the cache honest.
    pub async fn run(&self, client: kube::Client, shutdown: CancellationToken) -> Result<(), Error> {
        let api: Api<Deployment> = match self.scope.as_ref() {
            NamespaceScope::Single(ns) => Api::namespaced(client.clone(), ns),
            _ => Api::all(client.clone()),
        };

        info!("starting deployment informer");

        let mut stream = watcher(api.clone(), watcher::Config::default()).default_backoff().boxed();
        let mut resync = tokio::time::interval(RESYNC_PERIOD);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("deployment informer stopping");
                    return Ok(());
                }
                _ = resync.tick() => {
                    match api.list(&ListParams::default()).await {
                        Ok(list) => self.on_resync(list.items),
                        Err(err) => warn!("deployment relist failed: {err}"),
                    }
                }
                event = stream.next() => {
                    match event {
                        Some(Ok(watcher::Event::Applied(dep))) => self.on_applied(&dep),
                        Some(Ok(watcher::Event::Deleted(dep))) => self.on_deleted(&dep),
                        Some(Ok(watcher::Event::Restarted(deps))) => self.on_resync(deps),
                        Some(Err(err)) => warn!("deployment watch error: {err}"),
                        None => return Err(anyhow!("deployment watch stream ended").into()),
                    }
                }
            }
        }
    }
}

/// Spec-level differences worth a log line, in report order.
fn spec_changes(old: &Deployment, new: &Deployment) -> Vec<String> {
    let mut changes = Vec::new();

    let old_replicas = old.spec.as_ref().and_then(|spec| spec.replicas);
    let new_replicas = new.spec.as_ref().and_then(|spec| spec.replicas);
    if let (Some(old_replicas), Some(new_replicas)) = (old_replicas, new_replicas) {
        if old_replicas != new_replicas {
            changes.push(format!("replicas: {old_replicas} -> {new_replicas}"));
        }
    }

    let old_image = first_image(old);
    let new_image = first_image(new);
    if let (Some(old_image), Some(new_image)) = (old_image, new_image) {
        if old_image != new_image {
            changes.push(format!("image: {old_image} -> {new_image}"));
        }
    }

    if old.metadata.labels != new.metadata.labels {
        changes.push("labels changed".to_string());
    }

    if old.metadata.annotations != new.metadata.annotations {
        changes.push("annotations changed".to_string());
    }

    changes
}

/// Status replica counters, reported when nothing in the spec moved.
fn status_changes(old: &Deployment, new: &Deployment) -> Vec<String> {
    let fields: [(&str, fn(&Deployment) -> i32); 5] = [
        ("status.replicas", |dep| status_field(dep, |s| s.replicas)),
        ("status.availableReplicas", |dep| status_field(dep, |s| s.available_replicas)),
        ("status.updatedReplicas", |dep| status_field(dep, |s| s.updated_replicas)),
        ("status.readyReplicas", |dep| status_field(dep, |s| s.ready_replicas)),
        ("status.unavailableReplicas", |dep| status_field(dep, |s| s.unavailable_replicas)),
    ];

    let mut changes = Vec::new();
    for (label, get) in fields {
        let before = get(old);
        let after = get(new);
        if before != after {
            changes.push(format!("{label}: {before} -> {after}"));
        }
    }
    changes
}

fn status_field(
    dep: &Deployment,
    get: fn(&k8s_openapi::api::apps::v1::DeploymentStatus) -> Option<i32>,
) -> i32 {
    dep.status.as_ref().and_then(get).unwrap_or(0)
}

fn first_image(dep: &Deployment) -> Option<&str> {
    dep.spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .first()?
        .image
        .as_deref()
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::{
        apps::v1::{DeploymentSpec, DeploymentStatus},
        core::v1::{Container, PodSpec, PodTemplateSpec},
    };
    use kube::api::ObjectMeta;

    use super::*;

    fn deployment(ns: &str, name: &str, replicas: i32, image: &str) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(ns.to_string()),
                ..ObjectMeta::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "app".to_string(),
                            image: Some(image.to_string()),
                            ..Container::default()
                        }],
                        ..PodSpec::default()
                    }),
                    ..PodTemplateSpec::default()
                },
                ..DeploymentSpec::default()
            }),
            ..Deployment::default()
        }
    }

    #[test]
    fn scope_parsing() {
        assert_eq!(NamespaceScope::parse(""), NamespaceScope::All);
        assert_eq!(NamespaceScope::parse("all"), NamespaceScope::All);
        assert_eq!(NamespaceScope::parse("All"), NamespaceScope::All);
        assert_eq!(NamespaceScope::parse("tracing"), NamespaceScope::Single("tracing".to_string()));

        let scope = NamespaceScope::parse("a, b ,c");
        let expected: BTreeSet<String> =
            ["a", "b", "c"].into_iter().map(str::to_string).collect();
        assert_eq!(scope, NamespaceScope::Filtered(expected));
    }

    #[test]
    fn scope_filtering() {
        assert!(NamespaceScope::All.allows("anything"));
        assert!(NamespaceScope::Single("a".to_string()).allows("a"));
        assert!(!NamespaceScope::Single("a".to_string()).allows("b"));

        let scope = NamespaceScope::parse("a,b");
        assert!(scope.allows("a"));
        assert!(scope.allows("b"));
        assert!(!scope.allows("c"));
    }

    #[test]
    fn cache_tracks_apply_and_delete() {
        let watcher = DeploymentWatcher::new(NamespaceScope::All);
        let dep = deployment("default", "web", 1, "nginx:1.21");

        watcher.on_applied(&dep);
        assert_eq!(watcher.names(), vec!["web".to_string()]);
        assert_eq!(
            watcher.names_with_namespace(),
            vec![("default".to_string(), "web".to_string())]
        );

        watcher.on_deleted(&dep);
        assert!(watcher.names().is_empty());
    }

    #[test]
    fn readers_filter_to_allowed_namespaces() {
        let watcher = DeploymentWatcher::new(NamespaceScope::parse("a,b"));
        watcher.on_applied(&deployment("a", "one", 1, "img"));
        watcher.on_applied(&deployment("b", "two", 1, "img"));
        watcher.on_applied(&deployment("c", "three", 1, "img"));

        assert_eq!(watcher.names(), vec!["one".to_string(), "two".to_string()]);
    }

    #[test]
    fn resync_replaces_cache() {
        let watcher = DeploymentWatcher::new(NamespaceScope::All);
        watcher.on_applied(&deployment("default", "stale", 1, "img"));
        assert!(!watcher.is_synced());

        watcher.on_resync(vec![deployment("default", "fresh", 1, "img")]);
        assert!(watcher.is_synced());
        assert_eq!(watcher.names(), vec!["fresh".to_string()]);
    }

    #[test]
    fn diff_reports_spec_changes() {
        let old = deployment("default", "web", 2, "nginx:1.21");
        let mut new = deployment("default", "web", 3, "nginx:1.22");
        new.metadata.labels =
            Some([("team".to_string(), "obs".to_string())].into_iter().collect());

        let changes = spec_changes(&old, &new);
        assert_eq!(
            changes,
            vec![
                "replicas: 2 -> 3".to_string(),
                "image: nginx:1.21 -> nginx:1.22".to_string(),
                "labels changed".to_string(),
            ]
        );
    }

    #[test]
    fn diff_falls_back_to_status_deltas() {
        let old = deployment("default", "web", 2, "nginx:1.21");
        let mut new = old.clone();
        new.status = Some(DeploymentStatus {
            available_replicas: Some(2),
            ready_replicas: Some(2),
            ..DeploymentStatus::default()
        });

        assert!(spec_changes(&old, &new).is_empty());
        assert_eq!(
            status_changes(&old, &new),
            vec![
                "status.availableReplicas: 0 -> 2".to_string(),
                "status.readyReplicas: 0 -> 2".to_string(),
            ]
        );
    }

    #[test]
    fn diff_ignores_identical_objects() {
        let dep = deployment("default", "web", 2, "nginx:1.21");
        assert!(spec_changes(&dep, &dep).is_empty());
        assert!(status_changes(&dep, &dep).is_empty());
    }
}
