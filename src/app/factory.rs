use crate::{
    app::{backend::AppBackend, local::AppLocal, remote::AppRemote},
    config::Config,
    embeddings,
    items::{BackendJson, ITEMS_FILE},
    storage,
};
use anyhow::{Context, Result};
use homedir::my_home;
use std::path::PathBuf;
use std::sync::Arc;

pub const BASE_PATH_ENV: &str = "ITEMMATCH_BASE_PATH";
pub const ADDR_ENV: &str = "ITEMMATCH_ADDR";

pub struct AppFactory;

impl AppFactory {
    /// Daemon client when `ITEMMATCH_ADDR` is set, in-process otherwise.
    pub fn create_backend(paths: &AppPaths) -> Result<Box<dyn AppBackend>> {
        match Self::remote_addr() {
            Some(addr) => {
                log::info!("using remote backend: {addr}");
                Ok(Box::new(AppRemote::new(&addr)))
            }
            None => Ok(Box::new(Self::create_local_app(paths)?)),
        }
    }

    pub fn create_local_app(paths: &AppPaths) -> Result<AppLocal> {
        let config = Config::load_with(&paths.base_path)?;

        let storage = Arc::new(
            storage::BackendLocal::new(&paths.base_path)
                .context("failed to open item store directory")?,
        );
        let store = BackendJson::load(storage, ITEMS_FILE)
            .with_context(|| format!("failed to load {ITEMS_FILE}"))?;
        log::debug!("loaded {} items", store.len());

        let embedder = embeddings::build_embedder(&config.embedding)?;

        Ok(AppLocal::new(config, Arc::new(store), embedder))
    }

    pub fn remote_addr() -> Option<String> {
        std::env::var(ADDR_ENV)
            .ok()
            .map(|addr| addr.trim().to_string())
            .filter(|addr| !addr.is_empty())
    }

    pub fn get_paths() -> Result<AppPaths> {
        let base_path = Self::get_base_path()?;

        std::fs::create_dir_all(&base_path).with_context(|| {
            format!("failed to create base directory {}", base_path.display())
        })?;

        Ok(AppPaths { base_path })
    }

    fn get_base_path() -> Result<PathBuf> {
        if let Ok(base_path) = std::env::var(BASE_PATH_ENV) {
            return Ok(PathBuf::from(base_path));
        }

        let home = my_home()
            .context("could not determine home directory")?
            .context("home directory path is empty")?;
        Ok(home.join(".local/share/itemmatch"))
    }
}

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub base_path: PathBuf,
}
