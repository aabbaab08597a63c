//! Configuration for the updater agent.

use std::path::PathBuf;

use anyhow::Result;

/// Logical names for the three persisted changelog files, most recent first.
pub const CHANGELOG_FILENAMES: [&str; 3] = ["current", "previous", "old"];

/// Updater agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Host directory holding the compose stack (manifests, env file).
    pub system_dir: PathBuf,

    /// Base compose manifest file name inside `system_dir`.
    pub compose_file: String,

    /// Environment file name inside `system_dir`.
    pub env_file: String,

    /// Base URL of the release feed.
    pub storage_url: String,

    /// Feed path of the comma-separated release list.
    pub releases_list_path: String,

    /// Feed path of the published compose manifest.
    pub compose_manifest_path: String,

    /// Feed path prefix for changelog files.
    pub changelog_path: String,

    /// Override manifest stems (without `.yml`) to skip during merge.
    pub ignore_compose_files: Vec<String>,

    /// Service names exempt from the restart operation.
    pub ignore_restart: Vec<String>,

    /// Compose service name of the agent itself.
    pub service_name: String,

    /// Compose service name of the disposable self-update helper.
    pub manager_service_name: String,

    /// Interval between scheduled update checks, in seconds.
    pub check_interval_secs: u64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let system_dir = std::env::var("UPDATER_SYSTEM_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/srv/stack"));

        let storage_url = std::env::var("UPDATER_STORAGE_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8080".to_string());

        let releases_list_path = std::env::var("UPDATER_RELEASES_LIST_PATH")
            .unwrap_or_else(|_| "releases/releases-list.csv".to_string());

        let compose_manifest_path = std::env::var("UPDATER_COMPOSE_MANIFEST_PATH")
            .unwrap_or_else(|_| "releases/docker-compose.yml".to_string());

        let changelog_path = std::env::var("UPDATER_CHANGELOG_PATH")
            .unwrap_or_else(|_| "releases/changelog".to_string());

        let ignore_compose_files = split_list(
            &std::env::var("UPDATER_IGNORE_COMPOSE_FILES").unwrap_or_default(),
        )
        .into_iter()
        .map(|name| name.trim_end_matches(".yml").to_string())
        .collect();

        let ignore_restart =
            split_list(&std::env::var("UPDATER_IGNORE_RESTART").unwrap_or_default());

        let service_name = std::env::var("UPDATER_SERVICE_NAME")
            .unwrap_or_else(|_| "stack-updater".to_string());

        let manager_service_name = std::env::var("UPDATER_MANAGER_SERVICE")
            .unwrap_or_else(|_| "stack-updater-manager".to_string());

        let check_interval_secs = std::env::var("UPDATER_CHECK_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(86_400);

        Ok(Self {
            system_dir,
            compose_file: "docker-compose.yml".to_string(),
            env_file: ".env".to_string(),
            storage_url,
            releases_list_path,
            compose_manifest_path,
            changelog_path,
            ignore_compose_files,
            ignore_restart,
            service_name,
            manager_service_name,
            check_interval_secs,
        })
    }

    /// Path of the base compose manifest.
    pub fn compose_file_path(&self) -> PathBuf {
        self.system_dir.join(&self.compose_file)
    }

    /// Path of the host environment file.
    pub fn env_file_path(&self) -> PathBuf {
        self.system_dir.join(&self.env_file)
    }

    /// Path of the persisted update state record.
    pub fn state_file_path(&self) -> PathBuf {
        self.system_dir.join("system").join("updater").join("state.json")
    }

    /// Directory holding the downloaded changelog files.
    pub fn changelog_dir(&self) -> PathBuf {
        self.system_dir.join("system").join("changelogs")
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_list() {
        assert_eq!(
            split_list("a.yml; b.yml;;c"),
            vec!["a.yml".to_string(), "b.yml".to_string(), "c".to_string()]
        );
        assert!(split_list("").is_empty());
    }

    #[test]
    fn test_derived_paths() {
        let config = Config {
            system_dir: PathBuf::from("/srv/stack"),
            compose_file: "docker-compose.yml".to_string(),
            env_file: ".env".to_string(),
            storage_url: String::new(),
            releases_list_path: String::new(),
            compose_manifest_path: String::new(),
            changelog_path: String::new(),
            ignore_compose_files: vec![],
            ignore_restart: vec![],
            service_name: "stack-updater".to_string(),
            manager_service_name: "stack-updater-manager".to_string(),
            check_interval_secs: 86_400,
        };

        assert_eq!(
            config.compose_file_path(),
            PathBuf::from("/srv/stack/docker-compose.yml")
        );
        assert_eq!(
            config.state_file_path(),
            PathBuf::from("/srv/stack/system/updater/state.json")
        );
        assert_eq!(
            config.changelog_dir(),
            PathBuf::from("/srv/stack/system/changelogs")
        );
    }
}
