//! Pub/sub device boundary for status and commands.
//!
//! The updater exposes its status through a device entity with attributes
//! and receives command tokens set on the `event` attribute. Only the
//! interface is modeled here; transport wiring lives with the external
//! collaborator, which feeds commands and online signals into the channels
//! carried by [`LocalEntity`].

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use crate::error::UpdaterError;
use crate::state::UpdateStatus;

/// One atomically published attribute set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    /// Operation name, when the publish is tied to one.
    pub event: Option<String>,
    pub status: UpdateStatus,
    /// Availability timestamp published with `download-available`.
    pub available_update: Option<i64>,
    /// Completion timestamp published with `up-to-date`.
    pub last_update: Option<i64>,
}

impl StatusEvent {
    pub fn new(event: &str, status: UpdateStatus) -> Self {
        Self {
            event: Some(event.to_string()),
            status,
            available_update: None,
            last_update: None,
        }
    }

    pub fn with_available_update(mut self, ts: Option<i64>) -> Self {
        self.available_update = ts;
        self
    }

    pub fn with_last_update(mut self, ts: i64) -> Self {
        self.last_update = Some(ts);
        self
    }
}

/// Published attribute error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeError {
    pub field: String,
    pub code: String,
    pub message: String,
}

/// The update entity as seen by the orchestrator.
#[async_trait]
pub trait UpdateEntity: Send + Sync {
    /// Currently published status attribute.
    async fn status(&self) -> Option<UpdateStatus>;

    /// Publish an attribute set atomically as one event.
    async fn publish(&self, event: StatusEvent);

    /// Publish the status attribute alone.
    async fn publish_status(&self, status: UpdateStatus);

    /// Publish a structured error against an attribute.
    async fn publish_error(&self, field: &str, error: &UpdaterError);
}

/// In-memory entity implementation.
///
/// Holds the published attributes, records events and errors, and carries
/// the command/online channels the external collaborator drives.
pub struct LocalEntity {
    attributes: RwLock<HashMap<String, String>>,
    events: RwLock<Vec<StatusEvent>>,
    errors: RwLock<Vec<AttributeError>>,
    command_tx: mpsc::Sender<String>,
    online_tx: mpsc::Sender<()>,
}

/// Receiving ends of the entity's subscription channels.
pub struct EntitySignals {
    /// Command tokens set on the `event` attribute.
    pub commands: mpsc::Receiver<String>,
    /// Transport online/reconnect notifications.
    pub online: mpsc::Receiver<()>,
}

impl LocalEntity {
    pub fn new() -> (Self, EntitySignals) {
        let (command_tx, commands) = mpsc::channel(16);
        let (online_tx, online) = mpsc::channel(4);

        (
            Self {
                attributes: RwLock::new(HashMap::new()),
                events: RwLock::new(Vec::new()),
                errors: RwLock::new(Vec::new()),
                command_tx,
                online_tx,
            },
            EntitySignals { commands, online },
        )
    }

    /// Feed a command token, as an attribute-set would.
    pub async fn send_command(&self, token: &str) {
        let _ = self.command_tx.send(token.to_string()).await;
    }

    /// Signal that the transport (re)connected.
    pub async fn signal_online(&self) {
        let _ = self.online_tx.send(()).await;
    }

    /// Events published so far, oldest first.
    pub async fn events(&self) -> Vec<StatusEvent> {
        self.events.read().await.clone()
    }

    /// Attribute errors published so far, oldest first.
    pub async fn errors(&self) -> Vec<AttributeError> {
        self.errors.read().await.clone()
    }

    pub async fn attribute(&self, name: &str) -> Option<String> {
        self.attributes.read().await.get(name).cloned()
    }
}

#[async_trait]
impl UpdateEntity for LocalEntity {
    async fn status(&self) -> Option<UpdateStatus> {
        let attributes = self.attributes.read().await;
        attributes
            .get("status")
            .and_then(|s| UpdateStatus::from_str(s))
    }

    async fn publish(&self, event: StatusEvent) {
        debug!(
            event = event.event.as_deref().unwrap_or(""),
            status = %event.status,
            "Publishing entity event"
        );

        let mut attributes = self.attributes.write().await;
        attributes.insert("status".to_string(), event.status.as_str().to_string());
        if let Some(name) = &event.event {
            attributes.insert("event".to_string(), name.clone());
        }
        if let Some(ts) = event.available_update {
            attributes.insert("available-update".to_string(), ts.to_string());
        }
        if let Some(ts) = event.last_update {
            attributes.insert("last-update".to_string(), ts.to_string());
        }
        drop(attributes);

        self.events.write().await.push(event);
    }

    async fn publish_status(&self, status: UpdateStatus) {
        debug!(status = %status, "Publishing status attribute");

        self.attributes
            .write()
            .await
            .insert("status".to_string(), status.as_str().to_string());
    }

    async fn publish_error(&self, field: &str, error: &UpdaterError) {
        self.errors.write().await.push(AttributeError {
            field: field.to_string(),
            code: error.code().to_string(),
            message: error.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_sets_attributes() {
        let (entity, _signals) = LocalEntity::new();

        entity
            .publish(
                StatusEvent::new("check", UpdateStatus::DownloadAvailable)
                    .with_available_update(Some(1_707_523_200_000)),
            )
            .await;

        assert_eq!(entity.status().await, Some(UpdateStatus::DownloadAvailable));
        assert_eq!(entity.attribute("event").await.as_deref(), Some("check"));
        assert_eq!(
            entity.attribute("available-update").await.as_deref(),
            Some("1707523200000")
        );
        assert_eq!(entity.events().await.len(), 1);
    }

    #[tokio::test]
    async fn test_publish_status_only_touches_status() {
        let (entity, _signals) = LocalEntity::new();
        entity
            .publish(StatusEvent::new("update", UpdateStatus::Updating))
            .await;

        entity.publish_status(UpdateStatus::UpToDate).await;

        assert_eq!(entity.status().await, Some(UpdateStatus::UpToDate));
        assert_eq!(entity.attribute("event").await.as_deref(), Some("update"));
        // A status publish is not an event.
        assert_eq!(entity.events().await.len(), 1);
    }

    #[tokio::test]
    async fn test_command_channel() {
        let (entity, mut signals) = LocalEntity::new();
        entity.send_command("check").await;
        assert_eq!(signals.commands.recv().await.as_deref(), Some("check"));
    }

    #[tokio::test]
    async fn test_publish_error() {
        let (entity, _signals) = LocalEntity::new();
        entity
            .publish_error("event", &UpdaterError::Unknown("boom".to_string()))
            .await;

        let errors = entity.errors().await;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, "UNKNOWN_ERROR");
        assert_eq!(errors[0].field, "event");
    }
}
