//! Container runtime interface and implementations.
//!
//! The trait abstracts everything the updater needs from the container
//! layer: image/container inspection, streamed pulls and image pruning go
//! through the engine API; the compose-level verbs (apply, one-off run,
//! container removal) shell out to `docker-compose`, with output logged and
//! only the process exit status interpreted.
//!
//! A mock implementation is provided for tests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Output;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::InspectContainerOptions;
use bollard::image::{CreateImageOptions, PruneImagesOptions};
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Label the compose CLI stamps onto managed containers.
const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";

/// Image state as reported by the runtime.
#[derive(Debug, Clone)]
pub struct ImageInfo {
    /// Content ID of the image.
    pub id: String,
    /// Image creation time.
    pub created_at: Option<DateTime<Utc>>,
}

/// Running-container state as reported by the runtime.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    /// Content ID of the image backing the container.
    pub image_id: String,
    /// Image reference the container was created with.
    pub image_ref: Option<String>,
    /// Compose project label, when the container carries one.
    pub compose_project: Option<String>,
}

/// File and project context for compose invocations.
#[derive(Debug, Clone)]
pub struct ComposeContext {
    pub project: String,
    pub working_dir: PathBuf,
    pub base_file: PathBuf,
    pub extra_files: Vec<PathBuf>,
    pub env_file: PathBuf,
}

/// Container runtime operations used by the updater.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Inspect an image by reference.
    async fn inspect_image(&self, image: &str) -> Result<ImageInfo>;

    /// Inspect a container by name.
    async fn inspect_container(&self, name: &str) -> Result<ContainerInfo>;

    /// Pull an image, consuming streamed progress until completion.
    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Recreate the named services from the compose files.
    async fn compose_apply(&self, ctx: &ComposeContext, services: &[String]) -> Result<()>;

    /// Run a one-off service with injected environment and entrypoint.
    async fn compose_run(
        &self,
        ctx: &ComposeContext,
        service: &str,
        env: &[(String, String)],
        entrypoint: &str,
    ) -> Result<()>;

    /// Force-remove a service's container.
    async fn compose_remove(&self, ctx: &ComposeContext, service: &str) -> Result<()>;

    /// Prune unused images.
    async fn prune_images(&self) -> Result<()>;
}

/// Runtime backed by the local Docker engine socket plus the compose CLI.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the local engine socket.
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("failed to connect to the Docker engine")?;
        Ok(Self { docker })
    }

    fn compose_command(ctx: &ComposeContext, with_files: bool) -> Command {
        let mut cmd = Command::new("docker-compose");
        cmd.current_dir(&ctx.working_dir);
        if with_files {
            cmd.arg("-f").arg(&ctx.base_file);
            for file in &ctx.extra_files {
                cmd.arg("-f").arg(file);
            }
        }
        cmd.arg("-p").arg(&ctx.project);
        cmd
    }

    async fn run_compose(mut cmd: Command, action: &str) -> Result<()> {
        debug!(action, "Running compose command");

        let output: Output = cmd
            .output()
            .await
            .with_context(|| format!("failed to spawn docker-compose {action}"))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stdout.trim().is_empty() {
            debug!(action, stdout = %stdout.trim(), "compose stdout");
        }
        if !stderr.trim().is_empty() {
            debug!(action, stderr = %stderr.trim(), "compose stderr");
        }

        if !output.status.success() {
            anyhow::bail!(
                "docker-compose {action} exited with {}: {}",
                output.status,
                stderr.trim()
            );
        }

        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn inspect_image(&self, image: &str) -> Result<ImageInfo> {
        let inspect = self
            .docker
            .inspect_image(image)
            .await
            .with_context(|| format!("failed to inspect image {image}"))?;

        let id = inspect
            .id
            .with_context(|| format!("image {image} has no content id"))?;
        let created_at = inspect
            .created
            .as_deref()
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Utc));

        Ok(ImageInfo { id, created_at })
    }

    async fn inspect_container(&self, name: &str) -> Result<ContainerInfo> {
        let inspect = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .with_context(|| format!("failed to inspect container {name}"))?;

        let image_id = inspect
            .image
            .with_context(|| format!("container {name} has no image id"))?;
        let config = inspect.config;
        let image_ref = config.as_ref().and_then(|c| c.image.clone());
        let compose_project = config
            .as_ref()
            .and_then(|c| c.labels.as_ref())
            .and_then(|labels| labels.get(COMPOSE_PROJECT_LABEL))
            .filter(|label| !label.is_empty())
            .cloned();

        Ok(ContainerInfo {
            image_id,
            image_ref,
            compose_project,
        })
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(item) = stream.next().await {
            match item {
                Ok(progress) => {
                    if let Some(status) = progress.status {
                        debug!(image, status = %status, "Pull progress");
                    }
                }
                // A mid-stream error does not fail the pull; the follow-up
                // inspect decides whether the image actually arrived.
                Err(e) => warn!(image, error = %e, "Pull progress error"),
            }
        }

        Ok(())
    }

    async fn compose_apply(&self, ctx: &ComposeContext, services: &[String]) -> Result<()> {
        info!(project = %ctx.project, services = ?services, "Recreating services");

        let mut cmd = Self::compose_command(ctx, true);
        cmd.arg("--env-file")
            .arg(&ctx.env_file)
            .arg("up")
            .arg("-d")
            .arg("--force-recreate")
            .arg("--remove-orphans")
            .args(services);

        Self::run_compose(cmd, "up").await
    }

    async fn compose_run(
        &self,
        ctx: &ComposeContext,
        service: &str,
        env: &[(String, String)],
        entrypoint: &str,
    ) -> Result<()> {
        info!(project = %ctx.project, service, "Running one-off service");

        // Detached: the one-off may recreate the container this process
        // runs in, so we must not wait on it.
        let mut cmd = Self::compose_command(ctx, true);
        cmd.arg("run").arg("-d");
        for (key, value) in env {
            cmd.arg("-e").arg(format!("{key}={value}"));
        }
        cmd.arg("--entrypoint").arg(entrypoint).arg(service);

        Self::run_compose(cmd, "run").await
    }

    async fn compose_remove(&self, ctx: &ComposeContext, service: &str) -> Result<()> {
        info!(project = %ctx.project, service, "Removing container");

        let mut cmd = Self::compose_command(ctx, true);
        cmd.arg("rm").arg("-f").arg(service);

        Self::run_compose(cmd, "rm").await
    }

    async fn prune_images(&self) -> Result<()> {
        let report = self
            .docker
            .prune_images(None::<PruneImagesOptions<String>>)
            .await
            .context("failed to prune images")?;

        info!(
            space_reclaimed = report.space_reclaimed.unwrap_or(0),
            "Pruned unused images"
        );
        Ok(())
    }
}

/// Recorded compose invocation, for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComposeCall {
    Apply { project: String, services: Vec<String> },
    Run { project: String, service: String },
    Remove { project: String, service: String },
}

/// Mock runtime for tests.
///
/// Image and container lookups answer from configured maps; compose verbs
/// and pulls are recorded instead of executed.
#[derive(Default)]
pub struct MockRuntime {
    images: Mutex<HashMap<String, ImageInfo>>,
    containers: Mutex<HashMap<String, ContainerInfo>>,
    calls: Mutex<Vec<ComposeCall>>,
    pulled: Mutex<Vec<String>>,
    pruned: Mutex<u32>,
    fail_apply: bool,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// A mock whose compose apply always fails.
    pub fn failing_apply() -> Self {
        Self {
            fail_apply: true,
            ..Self::default()
        }
    }

    pub fn set_image(&self, image: &str, id: &str) {
        self.images.lock().unwrap().insert(
            image.to_string(),
            ImageInfo {
                id: id.to_string(),
                created_at: Some(Utc::now()),
            },
        );
    }

    pub fn set_container(
        &self,
        name: &str,
        image_id: &str,
        image_ref: &str,
        compose_project: Option<&str>,
    ) {
        self.containers.lock().unwrap().insert(
            name.to_string(),
            ContainerInfo {
                image_id: image_id.to_string(),
                image_ref: Some(image_ref.to_string()),
                compose_project: compose_project.map(str::to_string),
            },
        );
    }

    pub fn calls(&self) -> Vec<ComposeCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Service lists passed to compose apply, in call order.
    pub fn applied_services(&self) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ComposeCall::Apply { services, .. } => Some(services),
                _ => None,
            })
            .collect()
    }

    /// One-off services run, in call order.
    pub fn run_services(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ComposeCall::Run { service, .. } => Some(service),
                _ => None,
            })
            .collect()
    }

    pub fn pulled_images(&self) -> Vec<String> {
        self.pulled.lock().unwrap().clone()
    }

    pub fn prune_count(&self) -> u32 {
        *self.pruned.lock().unwrap()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn inspect_image(&self, image: &str) -> Result<ImageInfo> {
        self.images
            .lock()
            .unwrap()
            .get(image)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no such image: {image}"))
    }

    async fn inspect_container(&self, name: &str) -> Result<ContainerInfo> {
        self.containers
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no such container: {name}"))
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        self.pulled.lock().unwrap().push(image.to_string());
        Ok(())
    }

    async fn compose_apply(&self, ctx: &ComposeContext, services: &[String]) -> Result<()> {
        self.calls.lock().unwrap().push(ComposeCall::Apply {
            project: ctx.project.clone(),
            services: services.to_vec(),
        });
        if self.fail_apply {
            anyhow::bail!("mock runtime configured to fail compose apply");
        }
        Ok(())
    }

    async fn compose_run(
        &self,
        ctx: &ComposeContext,
        service: &str,
        _env: &[(String, String)],
        _entrypoint: &str,
    ) -> Result<()> {
        self.calls.lock().unwrap().push(ComposeCall::Run {
            project: ctx.project.clone(),
            service: service.to_string(),
        });
        Ok(())
    }

    async fn compose_remove(&self, ctx: &ComposeContext, service: &str) -> Result<()> {
        self.calls.lock().unwrap().push(ComposeCall::Remove {
            project: ctx.project.clone(),
            service: service.to_string(),
        });
        Ok(())
    }

    async fn prune_images(&self) -> Result<()> {
        *self.pruned.lock().unwrap() += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ctx() -> ComposeContext {
        ComposeContext {
            project: "stack".to_string(),
            working_dir: PathBuf::from("/srv/stack"),
            base_file: PathBuf::from("/srv/stack/docker-compose.yml"),
            extra_files: vec![],
            env_file: PathBuf::from("/srv/stack/.env"),
        }
    }

    #[tokio::test]
    async fn test_mock_records_apply() {
        let runtime = MockRuntime::new();
        runtime
            .compose_apply(&test_ctx(), &["app".to_string()])
            .await
            .unwrap();

        assert_eq!(runtime.applied_services(), vec![vec!["app".to_string()]]);
    }

    #[tokio::test]
    async fn test_mock_failing_apply() {
        let runtime = MockRuntime::failing_apply();
        let result = runtime.compose_apply(&test_ctx(), &[]).await;
        assert!(result.is_err());
        // The call is still recorded.
        assert_eq!(runtime.applied_services().len(), 1);
    }

    #[tokio::test]
    async fn test_mock_inspect_unknown_image() {
        let runtime = MockRuntime::new();
        assert!(runtime.inspect_image("missing:latest").await.is_err());

        runtime.set_image("app:1", "sha256:abc");
        let info = runtime.inspect_image("app:1").await.unwrap();
        assert_eq!(info.id, "sha256:abc");
    }
}
