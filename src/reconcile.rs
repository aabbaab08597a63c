//! Digest reconciliation between desired and running container state.
//!
//! For every registered service the reconciler independently queries the
//! runtime for the image's content ID and for the running container's
//! backing image. Lookups run as one concurrent task per service; a failed
//! lookup is logged and leaves the corresponding registry fields untouched,
//! so stale values persist until a later cycle refreshes them.

use std::sync::Arc;

use futures_util::future::join_all;
use tracing::debug;

use crate::compose::ServiceRegistry;
use crate::runtime::{ContainerInfo, ContainerRuntime, ImageInfo};

/// Per-service reconciliation outcome.
struct Probe {
    name: String,
    image: Option<ImageInfo>,
    container: Option<ContainerInfo>,
}

/// Refreshes registry digests from the container runtime.
pub struct DigestReconciler {
    runtime: Arc<dyn ContainerRuntime>,
}

impl DigestReconciler {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    /// Reconcile every record in the registry.
    ///
    /// Returns the compose-project label observed on a running container,
    /// if any, for the caller to capture first-writer-wins.
    pub async fn reconcile(&self, registry: &mut ServiceRegistry) -> Option<String> {
        let targets: Vec<(String, String, Option<String>)> = registry
            .iter()
            .map(|record| {
                (
                    record.name.clone(),
                    record.image.clone(),
                    record.container.clone(),
                )
            })
            .collect();

        let probes = join_all(
            targets
                .into_iter()
                .map(|(name, image, container)| self.probe(name, image, container)),
        )
        .await;

        let mut project = None;
        for probe in probes {
            let Some(record) = registry.get_mut(&probe.name) else {
                continue;
            };

            if let Some(image) = probe.image {
                record.digest.image = Some(image.id);
            }
            if let Some(container) = probe.container {
                record.digest.container = Some(container.image_id);
                record.container_image = container.image_ref;
                if project.is_none() {
                    project = container.compose_project;
                }
            }
        }

        project
    }

    /// Independent image and container lookups for one service. Failures
    /// are logged and absorbed; they never affect sibling services.
    async fn probe(&self, name: String, image: String, container: Option<String>) -> Probe {
        debug!(service = %name, image = %image, "Checking image digest");

        let image_info = match self.runtime.inspect_image(&image).await {
            Ok(info) => Some(info),
            Err(e) => {
                debug!(service = %name, image = %image, error = %e, "Image inspect failed");
                None
            }
        };

        let container_info = match &container {
            Some(container_name) => {
                debug!(service = %name, container = %container_name, "Checking container digest");
                match self.runtime.inspect_container(container_name).await {
                    Ok(info) => Some(info),
                    Err(e) => {
                        debug!(
                            service = %name,
                            container = %container_name,
                            error = %e,
                            "Container inspect failed"
                        );
                        None
                    }
                }
            }
            None => None,
        };

        Probe {
            name,
            image: image_info,
            container: container_info,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::ServiceRecord;
    use crate::runtime::MockRuntime;

    fn record(name: &str, image: &str, container: Option<&str>) -> ServiceRecord {
        let mut record = ServiceRecord::new(name);
        record.image = image.to_string();
        record.container = container.map(str::to_string);
        record
    }

    #[tokio::test]
    async fn test_reconcile_updates_both_digests() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.set_image("app:1", "sha256:img");
        runtime.set_container("app-container", "sha256:run", "app:1", Some("stack"));

        let mut registry = ServiceRegistry::new();
        registry.insert(record("app", "app:1", Some("app-container")));

        let reconciler = DigestReconciler::new(runtime);
        let project = reconciler.reconcile(&mut registry).await;

        assert_eq!(project.as_deref(), Some("stack"));
        let app = registry.get("app").unwrap();
        assert_eq!(app.digest.image.as_deref(), Some("sha256:img"));
        assert_eq!(app.digest.container.as_deref(), Some("sha256:run"));
        assert_eq!(app.container_image.as_deref(), Some("app:1"));
    }

    #[tokio::test]
    async fn test_reconcile_failure_is_isolated_per_service() {
        let runtime = Arc::new(MockRuntime::new());
        // Only one of the two services is known to the runtime.
        runtime.set_image("good:1", "sha256:good");
        runtime.set_container("good-container", "sha256:good", "good:1", None);

        let mut registry = ServiceRegistry::new();
        registry.insert(record("good", "good:1", Some("good-container")));
        registry.insert(record("bad", "bad:1", Some("bad-container")));

        DigestReconciler::new(runtime)
            .reconcile(&mut registry)
            .await;

        assert_eq!(
            registry.get("good").unwrap().digest.image.as_deref(),
            Some("sha256:good")
        );
        assert!(registry.get("bad").unwrap().digest.image.is_none());
        assert!(registry.get("bad").unwrap().digest.container.is_none());
    }

    #[tokio::test]
    async fn test_reconcile_keeps_stale_values_on_failure() {
        let runtime = Arc::new(MockRuntime::new());

        let mut registry = ServiceRegistry::new();
        let mut stale = record("app", "app:1", Some("app-container"));
        stale.digest.image = Some("sha256:stale".to_string());
        stale.digest.container = Some("sha256:stale".to_string());
        stale.container_image = Some("app:1".to_string());
        registry.insert(stale);

        DigestReconciler::new(runtime)
            .reconcile(&mut registry)
            .await;

        let app = registry.get("app").unwrap();
        assert_eq!(app.digest.image.as_deref(), Some("sha256:stale"));
        assert_eq!(app.digest.container.as_deref(), Some("sha256:stale"));
        assert_eq!(app.container_image.as_deref(), Some("app:1"));
    }

    #[tokio::test]
    async fn test_project_capture_absent_without_label() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.set_container("app-container", "sha256:run", "app:1", None);

        let mut registry = ServiceRegistry::new();
        registry.insert(record("app", "app:1", Some("app-container")));

        let project = DigestReconciler::new(runtime)
            .reconcile(&mut registry)
            .await;
        assert!(project.is_none());
    }
}
