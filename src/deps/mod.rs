//! Dependency handles shared by the cycle loop and the repair controller.
//!
//! Every handle lives in a [`DependencySlot`]. The repair controller may take
//! a broken handle out and put a rebuilt one back at any time, so users call
//! [`DependencySlot::current`] right before each use instead of caching the
//! handle for the run.

pub mod database;
pub mod http;
pub mod lazy;
pub mod remote;

pub use database::DatabaseHandle;
pub use http::{HttpEndpoint, ProbeResult};
pub use lazy::{LazyInit, LoadState};
pub use remote::{RemoteOutput, RemoteShell};

use crate::config::{DependenciesConfig, HttpEndpointConfig, RemoteShellConfig, SearchConfig};
use anyhow::Result;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

struct SlotState<T> {
    handle: Option<Arc<T>>,
    generation: u64,
}

/// A replaceable, shared handle.
pub struct DependencySlot<T> {
    inner: Arc<RwLock<SlotState<T>>>,
}

impl<T> Clone for DependencySlot<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for DependencySlot<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> DependencySlot<T> {
    pub fn empty() -> Self {
        Self {
            inner: Arc::new(RwLock::new(SlotState {
                handle: None,
                generation: 0,
            })),
        }
    }

    pub fn new(handle: T) -> Self {
        let slot = Self::empty();
        slot.replace(handle);
        slot
    }

    /// The handle to use right now, if one is installed.
    pub fn current(&self) -> Option<Arc<T>> {
        self.read().handle.clone()
    }

    /// Install a new handle; returns the new generation.
    pub fn replace(&self, handle: T) -> u64 {
        self.install(Arc::new(handle))
    }

    /// Like [`DependencySlot::replace`] for a handle that is already shared.
    pub fn install(&self, handle: Arc<T>) -> u64 {
        let mut state = self.write();
        state.handle = Some(handle);
        state.generation += 1;
        state.generation
    }

    /// Remove the handle so nobody picks up a known-broken one.
    pub fn take(&self) -> Option<Arc<T>> {
        self.write().handle.take()
    }

    /// Bumped on every `replace`.
    pub fn generation(&self) -> u64 {
        self.read().generation
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, SlotState<T>> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, SlotState<T>> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Clone)]
pub struct DatabaseDependency {
    pub path: PathBuf,
    pub slot: DependencySlot<DatabaseHandle>,
}

#[derive(Clone)]
pub struct HttpDependency {
    pub config: HttpEndpointConfig,
    pub slot: DependencySlot<HttpEndpoint>,
}

#[derive(Clone)]
pub struct SearchDependency {
    pub config: SearchConfig,
    /// Fixed at run start; never turned on by a repair.
    pub allow_substitute: bool,
    pub slot: DependencySlot<HttpEndpoint>,
}

#[derive(Clone)]
pub struct RemoteDependency {
    pub config: RemoteShellConfig,
    pub slot: DependencySlot<RemoteShell>,
}

/// All configured external dependencies of the driven pipeline.
#[derive(Clone, Default)]
pub struct Dependencies {
    pub database: Option<DatabaseDependency>,
    pub llm_api: Option<HttpDependency>,
    pub search: Option<SearchDependency>,
    pub vector_index: Option<HttpDependency>,
    pub remote_shell: Option<RemoteDependency>,
    pub request_timeout: Duration,
}

impl Dependencies {
    /// Build HTTP and remote-shell handles up front. The database slot starts
    /// empty; it is filled through [`Dependencies::open_database`].
    pub fn from_config(
        config: &DependenciesConfig,
        allow_substitute_search: bool,
        request_timeout: Duration,
    ) -> Result<Self> {
        let http = |cfg: &HttpEndpointConfig| -> Result<HttpDependency> {
            Ok(HttpDependency {
                config: cfg.clone(),
                slot: DependencySlot::new(HttpEndpoint::build(cfg, request_timeout, false)?),
            })
        };

        let search = match &config.search {
            Some(cfg) => Some(SearchDependency {
                config: cfg.clone(),
                allow_substitute: allow_substitute_search,
                slot: DependencySlot::new(HttpEndpoint::build(
                    &cfg.primary(),
                    request_timeout,
                    false,
                )?),
            }),
            None => None,
        };

        Ok(Self {
            database: config.database.as_ref().map(|db| DatabaseDependency {
                path: db.path.clone(),
                slot: DependencySlot::empty(),
            }),
            llm_api: config.llm_api.as_ref().map(http).transpose()?,
            search,
            vector_index: config.vector_index.as_ref().map(http).transpose()?,
            remote_shell: config.remote_shell.as_ref().map(|cfg| RemoteDependency {
                config: cfg.clone(),
                slot: DependencySlot::new(RemoteShell::from_config(cfg)),
            }),
            request_timeout,
        })
    }

    /// Start opening the database in the background.
    pub fn open_database(&self) -> LazyInit<DatabaseHandle> {
        let lazy = LazyInit::new();
        if let Some(db) = &self.database {
            let path = db.path.clone();
            lazy.start(async move {
                tokio::task::spawn_blocking(move || DatabaseHandle::open(&path)).await?
            });
        }
        lazy
    }

    /// The current database handle, if one is installed.
    pub fn database(&self) -> Option<Arc<DatabaseHandle>> {
        self.database.as_ref().and_then(|d| d.slot.current())
    }

    /// Environment describing the current handles, for command stages.
    pub fn stage_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        if let Some(db) = &self.database {
            env.insert(
                "SOAK_DATABASE_PATH".to_string(),
                db.path.display().to_string(),
            );
        }
        if let Some(api) = self.llm_api.as_ref().and_then(|d| d.slot.current()) {
            env.insert("SOAK_LLM_API_URL".to_string(), api.url().to_string());
        }
        if let Some(search) = self.search.as_ref().and_then(|d| d.slot.current()) {
            env.insert("SOAK_SEARCH_URL".to_string(), search.url().to_string());
            env.insert(
                "SOAK_SEARCH_PROVIDER".to_string(),
                if search.is_substitute() { "substitute" } else { "primary" }.to_string(),
            );
        }
        if let Some(index) = self.vector_index.as_ref().and_then(|d| d.slot.current()) {
            env.insert("SOAK_VECTOR_INDEX_URL".to_string(), index.url().to_string());
        }
        if let Some(remote) = self.remote_shell.as_ref().and_then(|d| d.slot.current()) {
            env.insert("SOAK_REMOTE_HOST".to_string(), remote.destination());
        }
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_replace_bumps_generation() {
        let slot: DependencySlot<String> = DependencySlot::empty();
        assert!(slot.current().is_none());
        assert_eq!(slot.generation(), 0);

        slot.replace("a".to_string());
        assert_eq!(slot.current().as_deref().map(String::as_str), Some("a"));
        assert_eq!(slot.replace("b".to_string()), 2);
    }

    #[test]
    fn test_slot_clones_share_state() {
        let slot = DependencySlot::new(1u32);
        let other = slot.clone();
        other.replace(2);
        assert_eq!(*slot.current().unwrap(), 2);
    }

    #[test]
    fn test_held_handle_survives_replacement() {
        let slot = DependencySlot::new("old".to_string());
        let held = slot.current().unwrap();
        slot.replace("new".to_string());
        assert_eq!(held.as_str(), "old");
        assert_eq!(slot.current().unwrap().as_str(), "new");
    }

    #[test]
    fn test_take_empties_slot() {
        let slot = DependencySlot::new(5u8);
        assert_eq!(*slot.take().unwrap(), 5);
        assert!(slot.current().is_none());
    }

    #[test]
    fn test_stage_env_reflects_current_handles() {
        let config = DependenciesConfig {
            search: Some(SearchConfig {
                url: "http://primary.local".into(),
                probe_path: "/".into(),
                api_key_env: None,
                substitute_url: Some("http://substitute.local".into()),
            }),
            ..Default::default()
        };
        let deps = Dependencies::from_config(&config, true, Duration::from_secs(1)).unwrap();
        let env = deps.stage_env();
        assert_eq!(env["SOAK_SEARCH_URL"], "http://primary.local");
        assert_eq!(env["SOAK_SEARCH_PROVIDER"], "primary");

        let search = deps.search.as_ref().unwrap();
        let substitute = search.config.substitute().unwrap();
        search
            .slot
            .replace(HttpEndpoint::build(&substitute, Duration::from_secs(1), true).unwrap());
        let env = deps.stage_env();
        assert_eq!(env["SOAK_SEARCH_URL"], "http://substitute.local");
        assert_eq!(env["SOAK_SEARCH_PROVIDER"], "substitute");
    }
}
