//! Compose manifest synchronization and the in-memory service registry.
//!
//! The synchronizer loads the base compose manifest, deep-merges any
//! override manifests found next to it (lexicographic file order, leaf-level
//! override), resolves `${VAR}` image placeholders against the host
//! environment file and rebuilds the service registry from the result.
//!
//! The registry is a cache over disk + runtime state, rebuilt on every
//! operation: services that vanish from the merged manifest are dropped,
//! surviving services keep their digests and timestamps.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_yaml::Value;
use thiserror::Error;
use tracing::debug;

use crate::config::Config;
use crate::envfile::EnvFile;

/// Errors from compose manifest synchronization.
#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("failed to read manifest {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse manifest {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("manifest {path} has no services section")]
    MissingServices { path: PathBuf },
}

/// Content identifiers tracked per service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceDigests {
    /// Image content ID as known to the runtime (absent until pulled).
    pub image: Option<String>,
    /// Registry-reported digest. Reserved, never populated here.
    pub registry: Option<String>,
    /// Content ID of the image backing the running container.
    pub container: Option<String>,
}

/// One compose service, keyed by service name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub name: String,
    /// Resolved image reference after placeholder substitution.
    pub image: String,
    /// Configured container name, when the manifest specifies one.
    pub container: Option<String>,
    /// Image reference recorded by the running container's configuration.
    pub container_image: Option<String>,
    /// Image creation time, Unix milliseconds.
    pub created_at: Option<i64>,
    pub updated_at: Option<i64>,
    pub digest: ServiceDigests,
}

impl ServiceRecord {
    /// A fresh record with empty digest fields.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: String::new(),
            container: None,
            container_image: None,
            created_at: None,
            updated_at: None,
            digest: ServiceDigests::default(),
        }
    }

    /// Whether desired and running state have drifted apart.
    ///
    /// A service is update-pending iff its image digest differs from the
    /// digest backing the running container, or the manifest image reference
    /// differs from the one the container was created with. An absent
    /// container (no `container_image`) counts as drift.
    pub fn needs_update(&self) -> bool {
        self.digest.image != self.digest.container
            || self.container_image.as_deref() != Some(self.image.as_str())
    }
}

/// Manifest-declared fields of a service, before registry merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedService {
    pub image: String,
    pub container: Option<String>,
}

/// Mapping from service name to record, rebuilt on every synchronization.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    records: BTreeMap<String, ServiceRecord>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the registry's name set with the merged manifest's services.
    ///
    /// Orphans are deleted; surviving records keep digest and timestamp
    /// fields with `name`, `image` and `container` refreshed; new names get
    /// fresh records.
    pub fn apply(&mut self, services: BTreeMap<String, ParsedService>) {
        self.records.retain(|name, _| services.contains_key(name));

        for (name, parsed) in services {
            let record = self
                .records
                .entry(name.clone())
                .or_insert_with(|| ServiceRecord::new(name.clone()));
            record.name = name;
            record.image = parsed.image;
            record.container = parsed.container;
        }
    }

    pub fn get(&self, name: &str) -> Option<&ServiceRecord> {
        self.records.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ServiceRecord> {
        self.records.get_mut(name)
    }

    pub fn insert(&mut self, record: ServiceRecord) {
        self.records.insert(record.name.clone(), record);
    }

    /// Records in service-name order.
    pub fn iter(&self) -> impl Iterator<Item = &ServiceRecord> {
        self.records.values()
    }

    pub fn names(&self) -> Vec<String> {
        self.records.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

/// Loads and merges compose manifests, maintaining the service registry.
#[derive(Debug, Clone)]
pub struct ComposeSynchronizer {
    base_file: PathBuf,
    search_dir: PathBuf,
    env_file: PathBuf,
    base_stem: String,
    ignore: Vec<String>,
}

impl ComposeSynchronizer {
    pub fn new(config: &Config) -> Self {
        let base_file = config.compose_file_path();
        let base_stem = base_file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        Self {
            base_file,
            search_dir: config.system_dir.clone(),
            env_file: config.env_file_path(),
            base_stem,
            ignore: config.ignore_compose_files.clone(),
        }
    }

    /// Rebuild the registry from the base manifest plus overrides.
    ///
    /// Returns the override manifest paths in the order they were merged,
    /// for reuse as compose `-f` arguments. A missing or unparsable base or
    /// override manifest is a hard error.
    pub fn synchronize(
        &self,
        registry: &mut ServiceRegistry,
    ) -> Result<Vec<PathBuf>, ComposeError> {
        let mut services = self.load_services(&self.base_file)?.ok_or_else(|| {
            ComposeError::MissingServices {
                path: self.base_file.clone(),
            }
        })?;

        let extra_files = self.discover_override_files()?;
        for path in &extra_files {
            // Overrides without a services section merge as no-ops.
            if let Some(overlay) = self.load_services(path)? {
                deep_merge(&mut services, overlay);
            }
        }

        if !extra_files.is_empty() {
            debug!(count = extra_files.len(), "Merged override manifests");
        }

        let env = EnvFile::load(&self.env_file);
        let parsed = extract_services(&services, &env);
        registry.apply(parsed);

        Ok(extra_files)
    }

    fn load_services(&self, path: &Path) -> Result<Option<Value>, ComposeError> {
        let data = std::fs::read_to_string(path).map_err(|source| ComposeError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let doc: Value = serde_yaml::from_str(&data).map_err(|source| ComposeError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(doc.get("services").filter(|v| v.is_mapping()).cloned())
    }

    /// Sibling `.yml` manifests in lexicographic name order, excluding the
    /// base file and the configured ignore list.
    fn discover_override_files(&self) -> Result<Vec<PathBuf>, ComposeError> {
        let entries = std::fs::read_dir(&self.search_dir).map_err(|source| ComposeError::Io {
            path: self.search_dir.clone(),
            source,
        })?;

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| ComposeError::Io {
                path: self.search_dir.clone(),
                source,
            })?;
            let path = entry.path();

            if path.extension().and_then(|e| e.to_str()) != Some("yml") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if stem == self.base_stem || self.ignore.iter().any(|i| i == stem) {
                continue;
            }
            files.push(path);
        }

        files.sort();
        Ok(files)
    }
}

/// Deep-merge `overlay` into `base`: mappings merge key by key, everything
/// else is replaced by the overlay value.
fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(slot) => deep_merge(slot, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn extract_services(services: &Value, env: &EnvFile) -> BTreeMap<String, ParsedService> {
    let mut parsed = BTreeMap::new();

    let Some(mapping) = services.as_mapping() else {
        return parsed;
    };

    for (name, body) in mapping {
        let Some(name) = name.as_str() else {
            continue;
        };
        let image = body
            .get("image")
            .and_then(Value::as_str)
            .map(|image| env.resolve(image))
            .unwrap_or_default();
        let container = body
            .get("container_name")
            .and_then(Value::as_str)
            .map(str::to_string);

        parsed.insert(name.to_string(), ParsedService { image, container });
    }

    parsed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &Path) -> Config {
        Config {
            system_dir: dir.to_path_buf(),
            compose_file: "docker-compose.yml".to_string(),
            env_file: ".env".to_string(),
            storage_url: String::new(),
            releases_list_path: String::new(),
            compose_manifest_path: String::new(),
            changelog_path: String::new(),
            ignore_compose_files: vec!["skipme".to_string()],
            ignore_restart: vec![],
            service_name: "stack-updater".to_string(),
            manager_service_name: "stack-updater-manager".to_string(),
            check_interval_secs: 86_400,
        }
    }

    #[test]
    fn test_deep_merge_leaf_override() {
        let mut base: Value = serde_yaml::from_str(
            "app:\n  image: a:1\n  container_name: app\nother:\n  image: b:1\n",
        )
        .unwrap();
        let overlay: Value = serde_yaml::from_str("app:\n  image: a:2\n").unwrap();

        deep_merge(&mut base, overlay);

        assert_eq!(
            base.get("app").unwrap().get("image").unwrap().as_str(),
            Some("a:2")
        );
        // Neighboring keys survive a leaf-level override.
        assert_eq!(
            base.get("app")
                .unwrap()
                .get("container_name")
                .unwrap()
                .as_str(),
            Some("app")
        );
        assert_eq!(
            base.get("other").unwrap().get("image").unwrap().as_str(),
            Some("b:1")
        );
    }

    #[test]
    fn test_needs_update() {
        let mut record = ServiceRecord::new("app");
        record.image = "registry/app:1".to_string();

        // No container yet: drift.
        assert!(record.needs_update());

        record.container_image = Some("registry/app:1".to_string());
        record.digest.image = Some("sha256:a".to_string());
        record.digest.container = Some("sha256:a".to_string());
        assert!(!record.needs_update());

        record.digest.container = Some("sha256:b".to_string());
        assert!(record.needs_update());

        record.digest.container = Some("sha256:a".to_string());
        record.container_image = Some("registry/app:0".to_string());
        assert!(record.needs_update());
    }

    #[test]
    fn test_synchronize_merges_overrides_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("docker-compose.yml"),
            "services:\n  app:\n    image: base:1\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("b-override.yml"),
            "services:\n  app:\n    image: from-b:1\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("a-override.yml"),
            "services:\n  app:\n    image: from-a:1\n  extra:\n    image: extra:1\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("skipme.yml"),
            "services:\n  app:\n    image: ignored:1\n",
        )
        .unwrap();

        let sync = ComposeSynchronizer::new(&test_config(dir.path()));
        let mut registry = ServiceRegistry::new();
        let extra = sync.synchronize(&mut registry).unwrap();

        assert_eq!(
            extra,
            vec![
                dir.path().join("a-override.yml"),
                dir.path().join("b-override.yml")
            ]
        );
        // Later file (b) wins over earlier (a).
        assert_eq!(registry.get("app").unwrap().image, "from-b:1");
        assert_eq!(registry.get("extra").unwrap().image, "extra:1");

        // Same inputs, same result.
        let mut second = ServiceRegistry::new();
        sync.synchronize(&mut second).unwrap();
        assert_eq!(registry.names(), second.names());
        assert_eq!(registry.get("app"), second.get("app"));
    }

    #[test]
    fn test_synchronize_resolves_image_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "TAG=2.0\n").unwrap();
        std::fs::write(
            dir.path().join("docker-compose.yml"),
            "services:\n  app:\n    image: registry/app:${TAG:-latest}\n    container_name: app\n",
        )
        .unwrap();

        let sync = ComposeSynchronizer::new(&test_config(dir.path()));
        let mut registry = ServiceRegistry::new();
        sync.synchronize(&mut registry).unwrap();

        let record = registry.get("app").unwrap();
        assert_eq!(record.image, "registry/app:2.0");
        assert_eq!(record.container.as_deref(), Some("app"));
    }

    #[test]
    fn test_synchronize_prunes_orphans_and_preserves_digests() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("docker-compose.yml"),
            "services:\n  kept:\n    image: kept:1\n",
        )
        .unwrap();

        let mut registry = ServiceRegistry::new();
        let mut kept = ServiceRecord::new("kept");
        kept.digest.image = Some("sha256:kept".to_string());
        kept.created_at = Some(1_000);
        registry.insert(kept);
        registry.insert(ServiceRecord::new("orphan"));

        let sync = ComposeSynchronizer::new(&test_config(dir.path()));
        sync.synchronize(&mut registry).unwrap();

        assert!(registry.get("orphan").is_none());
        let kept = registry.get("kept").unwrap();
        assert_eq!(kept.image, "kept:1");
        assert_eq!(kept.digest.image.as_deref(), Some("sha256:kept"));
        assert_eq!(kept.created_at, Some(1_000));
    }

    #[test]
    fn test_synchronize_missing_base_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let sync = ComposeSynchronizer::new(&test_config(dir.path()));
        let mut registry = ServiceRegistry::new();

        assert!(matches!(
            sync.synchronize(&mut registry),
            Err(ComposeError::Io { .. })
        ));
    }

    #[test]
    fn test_synchronize_unparsable_override_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("docker-compose.yml"),
            "services:\n  app:\n    image: a:1\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.yml"), "services: [unbalanced\n").unwrap();

        let sync = ComposeSynchronizer::new(&test_config(dir.path()));
        let mut registry = ServiceRegistry::new();

        assert!(matches!(
            sync.synchronize(&mut registry),
            Err(ComposeError::Parse { .. })
        ));
    }
}
