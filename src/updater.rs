//! The update orchestrator.
//!
//! Owns the status lifecycle and the in-memory service registry, and drives
//! the four operations — check, download, update, restart — against the
//! container runtime, the release feed, the status store and the update
//! entity. Also hosts the self-update bootstrap: the agent cannot
//! force-recreate its own container, so recreation is delegated to a
//! disposable helper service.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use futures_util::future::join_all;
use serde_yaml::Value;
use tracing::{debug, error, info, warn};

use crate::compose::{ComposeSynchronizer, ServiceRegistry};
use crate::config::{Config, CHANGELOG_FILENAMES};
use crate::entity::{StatusEvent, UpdateEntity};
use crate::error::UpdaterError;
use crate::reconcile::DigestReconciler;
use crate::release::{entries_most_recent_first, version_timestamp, ReleaseFeed};
use crate::runtime::{ComposeContext, ContainerRuntime};
use crate::state::{StatePatch, StatusStore, UpdateStatus};

/// Entrypoint the self-update helper executes inside its container.
const HELPER_ENTRYPOINT: &str = "/app/run.sh";

/// The orchestration engine.
///
/// Operations are serialized by the caller's event loop; the orchestrator
/// itself holds no lock around them.
pub struct Updater {
    config: Config,
    synchronizer: ComposeSynchronizer,
    reconciler: DigestReconciler,
    runtime: Arc<dyn ContainerRuntime>,
    release: Arc<dyn ReleaseFeed>,
    store: StatusStore,
    entity: Arc<dyn UpdateEntity>,

    registry: ServiceRegistry,
    /// Compose project name captured from a running container's label,
    /// first writer wins.
    project_name: Option<String>,
    /// Override manifests merged on the last synchronization, in merge
    /// order, reused as compose `-f` arguments.
    extra_files: Vec<PathBuf>,
}

impl Updater {
    pub fn new(
        config: Config,
        runtime: Arc<dyn ContainerRuntime>,
        release: Arc<dyn ReleaseFeed>,
        store: StatusStore,
        entity: Arc<dyn UpdateEntity>,
    ) -> Self {
        let synchronizer = ComposeSynchronizer::new(&config);
        let reconciler = DigestReconciler::new(Arc::clone(&runtime));

        Self {
            config,
            synchronizer,
            reconciler,
            runtime,
            release,
            store,
            entity,
            registry: ServiceRegistry::new(),
            project_name: None,
            extra_files: Vec::new(),
        }
    }

    /// Startup initialization. Errors here are fatal to the process:
    /// a half-initialized agent is worse than a restarted one.
    pub async fn init(&mut self) -> Result<()> {
        info!("Initializing updater");

        self.store.init().await?;
        self.sync().await?;

        // First run: publish the initial attributes from the persisted
        // record so observers always see a status.
        if self.entity.status().await.is_none() {
            let state = self.store.load().await?;
            self.entity
                .publish(StatusEvent {
                    event: None,
                    status: UpdateStatus::UpToDate,
                    available_update: None,
                    last_update: Some(state.updated_at),
                })
                .await;
        }

        self.recover_status().await?;
        self.remove_stale_helper().await;

        info!("Updater initialized");
        Ok(())
    }

    /// Command-dispatch entry point.
    ///
    /// Accepts the four operation tokens; anything else is ignored.
    /// Operation failures are normalized into the published taxonomy and
    /// surfaced as an attribute error instead of propagating.
    pub async fn handle_command(&mut self, token: &str) {
        debug!(command = token, "Handling command");

        let result = match token {
            "check" => self.check().await,
            "download" => self.download().await,
            "update" => self.update().await,
            "restart" => self.restart().await,
            _ => {
                debug!(command = token, "Ignoring unknown command");
                return;
            }
        };

        if let Err(e) = result {
            let err = UpdaterError::normalize(e);
            warn!(command = token, error = %err, "Command failed");
            self.entity.publish_error("event", &err).await;
        }
    }

    /// Reconnect/startup recovery: coerce statuses that cannot
    /// legitimately persist across a restart of the observing channel.
    /// Idempotent; terminal states are left unchanged.
    pub async fn recover_status(&mut self) -> Result<()> {
        let status = self.entity.status().await;
        debug!(status = ?status, "Reconciling published status");

        match status {
            Some(UpdateStatus::Downloading) => {
                // Download presumed interrupted; manifest and images are
                // still consistent enough to offer the update.
                self.entity
                    .publish_status(UpdateStatus::UpdateAvailable)
                    .await;
            }
            Some(UpdateStatus::Updating) => {
                self.finalize_updated().await?;
            }
            Some(UpdateStatus::Restarting) => {
                self.entity.publish_status(UpdateStatus::UpToDate).await;
            }
            _ => {}
        }

        Ok(())
    }

    /// Compare the feed's latest release to the persisted version.
    ///
    /// Failure to reach the feed (or the store) is swallowed and falls
    /// through to publishing `up-to-date`.
    pub async fn check(&mut self) -> Result<()> {
        info!("Checking for updates");

        match self.check_remote().await {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(e) => {
                info!(error = %e, "Update check failed");
            }
        }

        self.entity
            .publish(StatusEvent::new("check", UpdateStatus::UpToDate))
            .await;
        Ok(())
    }

    async fn check_remote(&mut self) -> Result<bool> {
        let latest = self.release.latest_version().await?;
        let state = self.store.load().await?;

        if state.version == latest {
            return Ok(false);
        }

        info!(version = %latest, "Update available");
        self.entity
            .publish(
                StatusEvent::new("check", UpdateStatus::DownloadAvailable)
                    .with_available_update(version_timestamp(&latest)),
            )
            .await;
        self.store
            .merge(StatePatch {
                available_version: Some(latest),
                ..Default::default()
            })
            .await?;

        Ok(true)
    }

    /// Fetch the published manifest and pull every registered image.
    pub async fn download(&mut self) -> Result<()> {
        info!("Starting download");

        self.synchronize_manifests()?;
        self.entity
            .publish(StatusEvent::new("download", UpdateStatus::Downloading))
            .await;

        if let Err(e) = self.try_download().await {
            // Revert one step: the release is still downloadable.
            self.entity
                .publish_status(UpdateStatus::DownloadAvailable)
                .await;
            warn!(error = %e, "Download failed");
            return Err(e);
        }

        self.entity
            .publish_status(UpdateStatus::UpdateAvailable)
            .await;
        info!("Download finished");
        Ok(())
    }

    async fn try_download(&mut self) -> Result<()> {
        self.fetch_compose_manifest().await?;
        self.sync().await?;
        self.pull_all_images().await
    }

    /// Recreate every drifted service onto the downloaded release.
    pub async fn update(&mut self) -> Result<()> {
        info!("Starting update");

        self.sync().await?;

        let prior = self.entity.status().await.unwrap_or(UpdateStatus::UpToDate);
        debug!(prior = %prior, "Status before update");
        self.entity
            .publish(StatusEvent::new("update", UpdateStatus::Updating))
            .await;

        if let Err(e) = self.try_update().await {
            self.entity.publish_status(prior).await;
            error!(error = %e, "Update failed");
            return Err(e);
        }

        // Housekeeping stays off the rollback path: the update is done.
        debug!("Clearing service registry");
        self.registry.clear();
        if let Err(e) = self.runtime.prune_images().await {
            warn!(error = %e, "Image prune failed");
        }

        info!("Update finished");
        Ok(())
    }

    async fn try_update(&mut self) -> Result<()> {
        let ctx = self.compose_context()?;

        let mut recreate = Vec::new();
        let mut self_update = false;
        for record in self.registry.iter() {
            if !record.needs_update() {
                continue;
            }
            // The agent cannot recreate its own container; divert it to
            // the helper-based bootstrap.
            if record.name == self.config.service_name {
                self_update = true;
                continue;
            }
            recreate.push(record.name.clone());
        }

        debug!(self_update, services = ?recreate, "Services to update");

        if !recreate.is_empty() {
            self.runtime.compose_apply(&ctx, &recreate).await?;
            info!(count = recreate.len(), "Services recreated");
        }

        self.download_changelogs().await?;

        let state = self.store.load().await?;
        self.store
            .merge(StatePatch {
                version: Some(state.available_version),
                ..Default::default()
            })
            .await?;

        if self_update {
            info!("Agent image changed, dispatching self-update");
            self.bootstrap_self(&ctx).await?;
        }

        self.finalize_updated().await?;
        Ok(())
    }

    /// Force-recreate every service not on the ignore list.
    pub async fn restart(&mut self) -> Result<()> {
        info!("Starting restart");

        self.synchronize_manifests()?;

        let prior = self.entity.status().await.unwrap_or(UpdateStatus::UpToDate);
        debug!(prior = %prior, "Status before restart");
        self.entity
            .publish(StatusEvent::new("restart", UpdateStatus::Restarting))
            .await;

        let ctx = match self.compose_context() {
            Ok(ctx) => ctx,
            Err(e) => {
                self.entity.publish_status(prior).await;
                return Err(e);
            }
        };

        let mut services: Vec<String> = self
            .registry
            .names()
            .into_iter()
            .filter(|name| !self.config.ignore_restart.contains(name))
            .collect();
        let self_restart = services.iter().any(|name| *name == self.config.service_name);
        services.retain(|name| *name != self.config.service_name);

        debug!(self_restart, services = ?services, "Services to restart");

        let result = self.runtime.compose_apply(&ctx, &services).await;

        // The prior status comes back on success and failure alike.
        self.entity.publish_status(prior).await;
        if let Err(e) = &result {
            error!(error = %e, "Restart failed");
        }

        // Self-restart happens regardless of how the direct recreate went.
        if self_restart {
            self.bootstrap_self(&ctx).await?;
        }

        info!("Restart finished");
        result
    }

    /// Re-synchronize manifests and reconcile digests against the runtime.
    pub async fn sync(&mut self) -> Result<()> {
        self.synchronize_manifests()?;

        let project = self.reconciler.reconcile(&mut self.registry).await;
        if self.project_name.is_none() {
            if let Some(project) = project {
                info!(project = %project, "Captured compose project name");
                self.project_name = Some(project);
            }
        }

        Ok(())
    }

    fn synchronize_manifests(&mut self) -> Result<()> {
        self.extra_files = self.synchronizer.synchronize(&mut self.registry)?;
        Ok(())
    }

    /// Current registry contents (exposed for integration tests).
    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// Captured compose project name, if any.
    pub fn project_name(&self) -> Option<&str> {
        self.project_name.as_deref()
    }

    fn compose_context(&self) -> Result<ComposeContext> {
        let project = self.project_name.clone().ok_or_else(|| {
            anyhow::Error::new(UpdaterError::Unknown(
                "compose project name is not defined".to_string(),
            ))
        })?;

        Ok(ComposeContext {
            project,
            working_dir: self.config.system_dir.clone(),
            base_file: self.config.compose_file_path(),
            extra_files: self.extra_files.clone(),
            env_file: self.config.env_file_path(),
        })
    }

    /// Fetch the remote compose manifest, require a parseable `services`
    /// section and write it over the local base manifest.
    async fn fetch_compose_manifest(&self) -> Result<()> {
        let result: Result<()> = async {
            let data = self.release.compose_manifest().await?;

            let doc: Value = serde_yaml::from_str(&data)?;
            if doc.get("services").filter(|v| v.is_mapping()).is_none() {
                anyhow::bail!("downloaded manifest has no services section");
            }

            tokio::fs::write(self.config.compose_file_path(), data).await?;
            Ok(())
        }
        .await;

        result.map_err(|e| {
            error!(error = %e, "Manifest download failed");
            anyhow::Error::new(UpdaterError::Unknown(
                "failed to download configuration files".to_string(),
            ))
        })
    }

    /// Concurrently pull every registered image, refreshing each record's
    /// image digest and creation time on completion. Sibling pulls are
    /// never cancelled; the first failure surfaces after all complete.
    async fn pull_all_images(&mut self) -> Result<()> {
        let targets: Vec<(String, String)> = self
            .registry
            .iter()
            .map(|record| (record.name.clone(), record.image.clone()))
            .collect();

        let results = join_all(targets.into_iter().map(|(name, image)| {
            let runtime = Arc::clone(&self.runtime);
            async move {
                info!(service = %name, image = %image, "Pulling image");
                let outcome = async {
                    runtime.pull_image(&image).await?;
                    runtime.inspect_image(&image).await
                }
                .await;
                (name, outcome)
            }
        }))
        .await;

        let mut first_error = None;
        for (name, outcome) in results {
            match outcome {
                Ok(info) => {
                    if let Some(record) = self.registry.get_mut(&name) {
                        record.digest.image = Some(info.id);
                        if let Some(created) = info.created_at {
                            record.created_at = Some(created.timestamp_millis());
                        }
                    }
                    debug!(service = %name, "Image pulled");
                }
                Err(e) => {
                    warn!(service = %name, error = %e, "Image pull failed");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Download the three most recent changelogs into the fixed files.
    async fn download_changelogs(&self) -> Result<()> {
        let result: Result<()> = async {
            let list = self.release.release_list().await?;
            let entries: Vec<String> = entries_most_recent_first(&list)
                .into_iter()
                .take(CHANGELOG_FILENAMES.len())
                .collect();

            debug!(entries = ?entries, "Downloading changelogs");

            let texts = join_all(entries.iter().map(|entry| self.release.changelog(entry))).await;

            tokio::fs::create_dir_all(self.config.changelog_dir()).await?;
            for (slot, text) in CHANGELOG_FILENAMES.iter().zip(texts) {
                let path = self.config.changelog_dir().join(format!("{slot}.md"));
                tokio::fs::write(path, text?).await?;
            }

            Ok(())
        }
        .await;

        result.map_err(|e| {
            error!(error = %e, "Changelog download failed");
            anyhow::Error::new(UpdaterError::Unknown(
                "failed to download changelogs".to_string(),
            ))
        })
    }

    /// Success tail of an update: publish the terminal status and persist
    /// the completion timestamp. Also used by crash recovery.
    async fn finalize_updated(&self) -> Result<()> {
        let now = Utc::now().timestamp_millis();

        self.entity
            .publish(StatusEvent {
                event: None,
                status: UpdateStatus::UpToDate,
                available_update: None,
                last_update: Some(now),
            })
            .await;
        self.store
            .merge(StatePatch {
                updated_at: Some(now),
                ..Default::default()
            })
            .await?;

        Ok(())
    }

    /// Delegate recreation of the agent's own container to the helper
    /// service. The helper recreates the container and exits; the
    /// environment overrides point it at the current compose context.
    async fn bootstrap_self(&self, ctx: &ComposeContext) -> Result<()> {
        info!(helper = %self.config.manager_service_name, "Dispatching self-update helper");

        let env = vec![
            (
                "DOCKER_COMPOSE_PATH".to_string(),
                self.config.compose_file_path().display().to_string(),
            ),
            ("PROJECT_NAME".to_string(), ctx.project.clone()),
            (
                "ENV_PATH".to_string(),
                self.config.env_file_path().display().to_string(),
            ),
        ];

        self.runtime
            .compose_run(ctx, &self.config.manager_service_name, &env, HELPER_ENTRYPOINT)
            .await
    }

    /// Remove a helper container left over from a previous cycle so a
    /// stale helper cannot block the next bootstrap.
    async fn remove_stale_helper(&self) {
        let Ok(ctx) = self.compose_context() else {
            warn!("No compose project captured, skipping stale helper removal");
            return;
        };

        if let Err(e) = self
            .runtime
            .compose_remove(&ctx, &self.config.manager_service_name)
            .await
        {
            warn!(error = %e, "Stale helper removal failed");
        }
    }
}
