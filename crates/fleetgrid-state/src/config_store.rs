//! ConfigStore — redb-backed persistence for versioned app configurations.
//!
//! Every `(name, version)` pair is stored once. Re-applying an identical
//! record is a no-op; applying a different record under an existing
//! version is rejected, so a published version never changes under the
//! hosts that run it.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::{debug, info};

use crate::error::{StateError, StateResult};
use crate::tables::APPS;
use crate::types::{AppConfiguration, AppName, Version, config_key};

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe configuration store backed by redb.
#[derive(Clone)]
pub struct ConfigStore {
    db: Arc<Database>,
}

impl ConfigStore {
    /// Open (or create) a persistent configuration store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "config store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory configuration store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory config store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(APPS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Store a new app configuration version.
    ///
    /// Returns `true` if the record was inserted, `false` if an identical
    /// record was already present. The existence check and the insert share
    /// one write transaction, so concurrent writers of the same version
    /// cannot overwrite each other.
    pub fn configure_app(&self, conf: &AppConfiguration) -> StateResult<bool> {
        let key = conf.table_key();
        let value = serde_json::to_vec(conf).map_err(map_err!(Serialize))?;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(APPS).map_err(map_err!(Table))?;
            let existing: Option<AppConfiguration> = match table
                .get(key.as_str())
                .map_err(map_err!(Read))?
            {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            if let Some(existing) = existing {
                if existing == *conf {
                    debug!(%key, "app configuration unchanged");
                    return Ok(false);
                }
                return Err(StateError::ImmutableVersion {
                    name: conf.name.clone(),
                    version: conf.version.to_string(),
                });
            }
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        info!(app = %conf.name, version = %conf.version, "app configured");
        Ok(true)
    }

    /// Look up one configuration version.
    pub fn get_app(&self, name: &str, version: &Version) -> StateResult<AppConfiguration> {
        self.get(&config_key(name, version))?
            .ok_or_else(|| StateError::AppNotFound {
                name: name.to_string(),
                version: version.to_string(),
            })
    }

    fn get(&self, key: &str) -> StateResult<Option<AppConfiguration>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(APPS).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let conf: AppConfiguration =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(conf))
            }
            None => Ok(None),
        }
    }

    /// List every stored configuration, sorted by name then version.
    pub fn list_apps(&self) -> StateResult<Vec<AppConfiguration>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(APPS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let conf: AppConfiguration =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(conf);
        }
        results.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.version.cmp(&b.version)));
        Ok(results)
    }

    /// All configured versions of `name`, oldest first.
    pub fn versions(&self, name: &str) -> StateResult<Vec<Version>> {
        Ok(self
            .list_apps()?
            .into_iter()
            .filter(|conf| conf.name == name)
            .map(|conf| conf.version)
            .collect())
    }

    /// Newest configured version of `name`.
    pub fn latest(&self, name: &str) -> StateResult<AppConfiguration> {
        self.list_apps()?
            .into_iter()
            .filter(|conf| conf.name == name)
            .next_back()
            .ok_or_else(|| StateError::AppNotFound {
                name: name.to_string(),
                version: "latest".to_string(),
            })
    }

    /// Distinct configured app names, sorted.
    pub fn app_names(&self) -> StateResult<Vec<AppName>> {
        let mut names: Vec<AppName> = self.list_apps()?.into_iter().map(|c| c.name).collect();
        names.dedup();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AppNeeds, AppType, RawConfig};
    use std::collections::HashMap;

    fn conf(name: &str, version: &str, target: u32) -> AppConfiguration {
        AppConfiguration {
            name: name.to_string(),
            app_type: AppType::Http,
            version: version.into(),
            min_deployment_count: 1,
            target_deployment_count: target,
            max_deployment_count: 0,
            raw_config: RawConfig {
                install_commands: vec![format!("install {name}")],
                remove_commands: vec![format!("remove {name}")],
            },
            docker_config: None,
            port_mappings: HashMap::new(),
            env: HashMap::new(),
            needs: AppNeeds::new(1, 1, 1),
        }
    }

    #[test]
    fn configure_and_get() {
        let store = ConfigStore::open_in_memory().unwrap();
        assert!(store.configure_app(&conf("web", "1", 2)).unwrap());

        let got = store.get_app("web", &"1".into()).unwrap();
        assert_eq!(got.target_deployment_count, 2);
        assert_eq!(got.raw_config.install_commands, vec!["install web"]);
    }

    #[test]
    fn unknown_version_is_not_found() {
        let store = ConfigStore::open_in_memory().unwrap();
        store.configure_app(&conf("web", "1", 2)).unwrap();

        let err = store.get_app("web", &"2".into()).unwrap_err();
        assert!(matches!(err, StateError::AppNotFound { .. }));
    }

    #[test]
    fn identical_reapply_is_noop() {
        let store = ConfigStore::open_in_memory().unwrap();
        assert!(store.configure_app(&conf("web", "1", 2)).unwrap());
        assert!(!store.configure_app(&conf("web", "1", 2)).unwrap());
    }

    #[test]
    fn versions_are_immutable() {
        let store = ConfigStore::open_in_memory().unwrap();
        store.configure_app(&conf("web", "1", 2)).unwrap();

        let err = store.configure_app(&conf("web", "1", 5)).unwrap_err();
        assert!(matches!(err, StateError::ImmutableVersion { .. }));
        assert_eq!(store.get_app("web", &"1".into()).unwrap().target_deployment_count, 2);
    }

    #[test]
    fn concurrent_writers_cannot_overwrite_a_version() {
        let store = ConfigStore::open_in_memory().unwrap();
        let handles: Vec<_> = (1..=8)
            .map(|target| {
                let store = store.clone();
                std::thread::spawn(move || store.configure_app(&conf("web", "1", target)))
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let winners: Vec<u32> = results
            .iter()
            .zip(1..=8)
            .filter(|(r, _)| matches!(r, Ok(true)))
            .map(|(_, target)| target)
            .collect();
        assert_eq!(winners.len(), 1);
        assert!(
            results
                .iter()
                .filter(|r| r.is_err())
                .all(|r| matches!(r, Err(StateError::ImmutableVersion { .. })))
        );
        assert_eq!(results.iter().filter(|r| r.is_err()).count(), 7);
        assert_eq!(
            store.get_app("web", &"1".into()).unwrap().target_deployment_count,
            winners[0]
        );
    }

    #[test]
    fn latest_uses_version_order() {
        let store = ConfigStore::open_in_memory().unwrap();
        store.configure_app(&conf("web", "9", 1)).unwrap();
        store.configure_app(&conf("web", "10", 1)).unwrap();
        store.configure_app(&conf("worker", "1", 1)).unwrap();

        assert_eq!(store.latest("web").unwrap().version, Version::from("10"));
        assert_eq!(
            store.versions("web").unwrap(),
            vec![Version::from("9"), Version::from("10")]
        );
        assert_eq!(store.app_names().unwrap(), vec!["web", "worker"]);
        assert!(store.latest("missing").is_err());
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.redb");

        {
            let store = ConfigStore::open(&path).unwrap();
            store.configure_app(&conf("web", "1", 3)).unwrap();
        }

        let store = ConfigStore::open(&path).unwrap();
        assert_eq!(store.get_app("web", &"1".into()).unwrap().target_deployment_count, 3);
    }
}
