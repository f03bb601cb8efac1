use std::env;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::backend::{LocalBackend, StoreBackend};
use crate::errors::StoreResult;
use crate::model::Entry;

/// Single entry point a panel talks to, whichever store is active.
pub struct FileSystem {
    current_path: PathBuf,
    local: LocalBackend,
    remote: Option<Box<dyn StoreBackend>>,
}

impl FileSystem {
    /// An empty `path` starts at the home directory.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            current_path: resolve_start_path(path.into()),
            local: LocalBackend,
            remote: None,
        }
    }

    pub fn current_path(&self) -> &Path {
        self.current_path.as_path()
    }

    pub fn set_current_path(&mut self, path: impl Into<PathBuf>) {
        self.current_path = resolve_start_path(path.into());
    }

    /// Moves one level up; the root stays where it is.
    pub fn parent_path(&mut self) -> &Path {
        if let Some(parent) = self.current_path.parent() {
            self.current_path = parent.to_path_buf();
        }
        self.current_path.as_path()
    }

    pub fn is_remote(&self) -> bool {
        self.remote.is_some()
    }

    /// The backend every operation is routed to.
    pub fn backend(&self) -> &dyn StoreBackend {
        match &self.remote {
            Some(remote) => remote.as_ref(),
            None => &self.local,
        }
    }

    /// Installs `backend` as the remote store, closing the one it replaces.
    ///
    /// The new backend is installed even when closing the old one fails; that
    /// close error is returned so the caller can report it.
    pub fn set_remote(&mut self, backend: Box<dyn StoreBackend>) -> StoreResult<()> {
        let closed = self.close_remote();
        info!(backend = backend.backend_name(), "remote store attached");
        self.remote = Some(backend);
        closed
    }

    /// Closes and detaches the remote store, falling back to the local disk.
    pub fn clear_remote(&mut self) -> StoreResult<()> {
        self.close_remote()
    }

    fn close_remote(&mut self) -> StoreResult<()> {
        let Some(mut previous) = self.remote.take() else {
            return Ok(());
        };
        debug!(backend = previous.backend_name(), "closing remote store");
        previous.close().inspect_err(|err| {
            warn!("failed to close previous remote store: {err}");
        })
    }

    pub fn list_files(&self, path: &Path) -> StoreResult<Vec<Entry>> {
        self.backend().list(path)
    }

    pub fn create_directory(&self, path: &Path) -> StoreResult<()> {
        self.backend().create_dir(path)
    }

    pub fn delete_file(&self, path: &Path) -> StoreResult<()> {
        self.backend().delete(path)
    }

    /// Re-lists the current directory.
    pub fn refresh(&self) -> StoreResult<Vec<Entry>> {
        self.list_files(self.current_path())
    }
}

fn resolve_start_path(path: PathBuf) -> PathBuf {
    if !path.as_os_str().is_empty() {
        return path;
    }
    env::var_os("HOME")
        .filter(|home| !home.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/"))
}
