//! World catalog: one directory per world, described by `manifest.json`.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::core::error::Error;
use crate::core::types::Result;
use crate::streaming::config::StreamingConfig;
use crate::streaming::store::PersistenceStore;

/// Current version of the world manifest format
pub const MANIFEST_VERSION: u32 = 1;

pub const MANIFEST_FILE: &str = "manifest.json";

/// World metadata stored next to its chunk records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldManifest {
    /// Format version for compatibility
    pub version: u32,
    /// Directory name of the world
    pub name: String,
    /// Creation time, seconds since the Unix epoch
    pub created_at: u64,
    /// Settings the world was created with
    pub config: StreamingConfig,
}

impl WorldManifest {
    pub fn new(name: impl Into<String>, config: StreamingConfig) -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            version: MANIFEST_VERSION,
            name: name.into(),
            created_at,
            config,
        }
    }

    pub fn read(world_dir: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(world_dir.join(MANIFEST_FILE))?;
        let manifest: Self =
            serde_json::from_str(&json).map_err(|e| Error::Serialization(e.to_string()))?;
        if manifest.version != MANIFEST_VERSION {
            return Err(Error::Serialization(format!(
                "unsupported manifest version {}",
                manifest.version
            )));
        }
        Ok(manifest)
    }

    pub fn write(&self, world_dir: &Path) -> Result<()> {
        let json =
            serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))?;
        std::fs::create_dir_all(world_dir)?;
        std::fs::write(world_dir.join(MANIFEST_FILE), json)?;
        Ok(())
    }
}

fn check_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && !name.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidConfig(format!("invalid world name {:?}", name)))
    }
}

impl PersistenceStore {
    /// Every world under `root` with a readable manifest, sorted by name.
    pub fn list_worlds(root: &Path) -> Result<Vec<WorldManifest>> {
        if !root.exists() {
            return Ok(Vec::new());
        }
        let mut worlds = Vec::new();
        for entry in std::fs::read_dir(root)? {
            let path = entry?.path();
            if !path.join(MANIFEST_FILE).is_file() {
                continue;
            }
            match WorldManifest::read(&path) {
                Ok(manifest) => worlds.push(manifest),
                Err(e) => log::warn!("Skipping world at {:?}: {}", path, e),
            }
        }
        worlds.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(worlds)
    }

    /// Create a new world directory and open its store.
    pub fn create_world(root: &Path, name: &str, config: StreamingConfig) -> Result<Self> {
        check_name(name)?;
        config.validate()?;
        let dir = root.join(name);
        if dir.join(MANIFEST_FILE).exists() {
            return Err(Error::InvalidConfig(format!("world {:?} already exists", name)));
        }

        let manifest = WorldManifest::new(name, config);
        manifest.write(&dir)?;
        log::info!("Created world {:?} (seed {})", name, manifest.config.terrain.seed);
        Ok(Self::open(&dir, manifest.config.grid)?.with_manifest(manifest))
    }

    /// Open an existing world by name.
    pub fn load_world(root: &Path, name: &str) -> Result<Self> {
        check_name(name)?;
        let dir = root.join(name);
        if !dir.join(MANIFEST_FILE).is_file() {
            return Err(Error::WorldNotFound(name.to_string()));
        }
        let manifest = WorldManifest::read(&dir)?;
        manifest.config.validate()?;
        log::info!("Loading world {:?}", name);
        Ok(Self::open(&dir, manifest.config.grid)?.with_manifest(manifest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_list_load() {
        let root = tempfile::tempdir().unwrap();
        assert!(PersistenceStore::list_worlds(root.path()).unwrap().is_empty());

        let mut config = StreamingConfig::default();
        config.terrain.seed = 1234;
        let store = PersistenceStore::create_world(root.path(), "beta", config.clone()).unwrap();
        assert_eq!(store.manifest().unwrap().config, config);
        drop(store);
        drop(PersistenceStore::create_world(root.path(), "alpha", StreamingConfig::default()).unwrap());

        let names: Vec<_> = PersistenceStore::list_worlds(root.path())
            .unwrap()
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(names, vec!["alpha", "beta"]);

        let store = PersistenceStore::load_world(root.path(), "beta").unwrap();
        assert_eq!(store.manifest().unwrap().config.terrain.seed, 1234);
    }

    #[test]
    fn test_duplicate_and_missing() {
        let root = tempfile::tempdir().unwrap();
        drop(PersistenceStore::create_world(root.path(), "w", StreamingConfig::default()).unwrap());
        assert!(matches!(
            PersistenceStore::create_world(root.path(), "w", StreamingConfig::default()),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            PersistenceStore::load_world(root.path(), "nope"),
            Err(Error::WorldNotFound(_))
        ));
        assert!(PersistenceStore::create_world(root.path(), "../escape", StreamingConfig::default()).is_err());
    }

    #[test]
    fn test_unreadable_manifest_is_skipped() {
        let root = tempfile::tempdir().unwrap();
        let bad = root.path().join("broken");
        std::fs::create_dir_all(&bad).unwrap();
        std::fs::write(bad.join(MANIFEST_FILE), "{ not json").unwrap();
        assert!(PersistenceStore::list_worlds(root.path()).unwrap().is_empty());
        assert!(matches!(
            PersistenceStore::load_world(root.path(), "broken"),
            Err(Error::Serialization(_))
        ));
    }
}
