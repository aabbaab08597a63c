//! Release feed client.
//!
//! The feed publishes a comma-separated release list, the current compose
//! manifest and one changelog file per release.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use tracing::debug;

use crate::config::Config;

/// Remote source of truth for releases.
#[async_trait]
pub trait ReleaseFeed: Send + Sync {
    /// Raw comma-separated release list.
    async fn release_list(&self) -> Result<String>;

    /// Raw compose manifest text.
    async fn compose_manifest(&self) -> Result<String>;

    /// Raw changelog text for a release-list entry.
    async fn changelog(&self, filename: &str) -> Result<String>;

    /// Identifier of the latest published release.
    async fn latest_version(&self) -> Result<String> {
        let list = self.release_list().await?;
        latest_from_list(&list)
            .ok_or_else(|| anyhow::anyhow!("release list is empty"))
    }
}

/// Derive the latest release identifier from the raw release list.
///
/// Takes the last comma-separated entry, strips a file extension and the
/// trailing dash-separated build counter, leaving the dated id:
/// `"2023-12-30-1,2024-02-10-1"` derives `"2024-02-10"`.
pub fn latest_from_list(list: &str) -> Option<String> {
    let last = list
        .replace('\n', "")
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .last()?
        .to_string();

    let base = last.split('.').next().unwrap_or(&last);
    let parts: Vec<&str> = base.split('-').collect();
    let id = if parts.len() > 1 {
        parts[..parts.len() - 1].join("-")
    } else {
        base.to_string()
    };

    Some(id)
}

/// Release-list entries, most recent first.
pub fn entries_most_recent_first(list: &str) -> Vec<String> {
    let mut entries: Vec<String> = list
        .replace('\n', "")
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect();
    entries.reverse();
    entries
}

/// UTC-midnight millisecond timestamp of a dated release id, when it parses.
pub fn version_timestamp(version: &str) -> Option<i64> {
    let date = NaiveDate::parse_from_str(version, "%Y-%m-%d").ok()?;
    let midnight = date.and_hms_opt(0, 0, 0)?;
    Some(midnight.and_utc().timestamp_millis())
}

/// HTTP release feed.
pub struct HttpReleaseFeed {
    client: reqwest::Client,
    base_url: String,
    releases_list_path: String,
    compose_manifest_path: String,
    changelog_path: String,
}

impl HttpReleaseFeed {
    pub fn new(config: &Config) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: config.storage_url.trim_end_matches('/').to_string(),
            releases_list_path: config.releases_list_path.clone(),
            compose_manifest_path: config.compose_manifest_path.clone(),
            changelog_path: config.changelog_path.clone(),
        }
    }

    async fn fetch_text(&self, path: &str) -> Result<String> {
        let url = format!("{}/{}", self.base_url, path);
        debug!(url = %url, "Fetching from release feed");

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("release feed returned {} for {}", response.status(), url);
        }

        Ok(response.text().await?)
    }
}

#[async_trait]
impl ReleaseFeed for HttpReleaseFeed {
    async fn release_list(&self) -> Result<String> {
        self.fetch_text(&self.releases_list_path).await
    }

    async fn compose_manifest(&self) -> Result<String> {
        self.fetch_text(&self.compose_manifest_path).await
    }

    async fn changelog(&self, filename: &str) -> Result<String> {
        if filename.is_empty() {
            anyhow::bail!("changelog filename is required");
        }
        self.fetch_text(&format!("{}/{}", self.changelog_path, filename))
            .await
    }
}

/// Fixed-content feed for tests.
#[derive(Debug, Clone, Default)]
pub struct StaticReleaseFeed {
    pub list: String,
    pub compose: String,
    pub changelogs: HashMap<String, String>,
    fail: bool,
}

impl StaticReleaseFeed {
    pub fn new(list: &str, compose: &str) -> Self {
        Self {
            list: list.to_string(),
            compose: compose.to_string(),
            changelogs: HashMap::new(),
            fail: false,
        }
    }

    /// A feed whose every fetch fails.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn with_changelog(mut self, entry: &str, text: &str) -> Self {
        self.changelogs.insert(entry.to_string(), text.to_string());
        self
    }
}

#[async_trait]
impl ReleaseFeed for StaticReleaseFeed {
    async fn release_list(&self) -> Result<String> {
        if self.fail {
            anyhow::bail!("static feed configured to fail");
        }
        Ok(self.list.clone())
    }

    async fn compose_manifest(&self) -> Result<String> {
        if self.fail {
            anyhow::bail!("static feed configured to fail");
        }
        Ok(self.compose.clone())
    }

    async fn changelog(&self, filename: &str) -> Result<String> {
        if self.fail {
            anyhow::bail!("static feed configured to fail");
        }
        self.changelogs
            .get(filename)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no changelog for {filename}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latest_from_list() {
        assert_eq!(
            latest_from_list("2023-12-30-1,2024-01-01-1,2024-02-10-1"),
            Some("2024-02-10".to_string())
        );
        assert_eq!(
            latest_from_list("2024-02-10-1.md"),
            Some("2024-02-10".to_string())
        );
        assert_eq!(latest_from_list("single"), Some("single".to_string()));
        assert_eq!(latest_from_list(""), None);
        assert_eq!(latest_from_list(",,"), None);
    }

    #[test]
    fn test_latest_from_list_ignores_newlines() {
        assert_eq!(
            latest_from_list("2024-01-01-1,\n2024-02-10-1\n"),
            Some("2024-02-10".to_string())
        );
    }

    #[test]
    fn test_entries_most_recent_first() {
        assert_eq!(
            entries_most_recent_first("a,b,c,d"),
            vec!["d", "c", "b", "a"]
        );
    }

    #[test]
    fn test_version_timestamp() {
        assert_eq!(version_timestamp("2024-02-10"), Some(1_707_523_200_000));
        assert_eq!(version_timestamp("Latest"), None);
    }

    #[tokio::test]
    async fn test_static_feed_latest_version() {
        let feed = StaticReleaseFeed::new("2024-01-01-1,2024-02-10-1", "");
        assert_eq!(feed.latest_version().await.unwrap(), "2024-02-10");
    }

    #[tokio::test]
    async fn test_failing_feed() {
        let feed = StaticReleaseFeed::failing();
        assert!(feed.latest_version().await.is_err());
        assert!(feed.compose_manifest().await.is_err());
    }
}
