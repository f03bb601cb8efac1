use std::path::{Path, PathBuf};

use tracing::debug;

use crate::errors::{StoreError, StoreResult};

/// Primitive operations a store exposes for recursive removal.
pub trait TreeOps {
    /// Whether `path` is a real directory. Symlinks are never followed.
    fn is_dir(&self, path: &Path) -> StoreResult<bool>;
    fn children(&self, path: &Path) -> StoreResult<Vec<PathBuf>>;
    fn remove_file(&self, path: &Path) -> StoreResult<()>;
    fn remove_dir(&self, path: &Path) -> StoreResult<()>;
}

/// Depth-first removal: children go first, then the emptied directory.
///
/// Stops at the first failure; anything already removed stays removed.
pub fn remove_tree<T>(ops: &T, path: &Path) -> StoreResult<()>
where
    T: TreeOps + ?Sized,
{
    if !ops.is_dir(path).map_err(delete_error)? {
        debug!(path = %path.display(), "unlink");
        return ops.remove_file(path);
    }

    for child in ops.children(path).map_err(delete_error)? {
        remove_tree(ops, child.as_path())?;
    }
    debug!(path = %path.display(), "rmdir");
    ops.remove_dir(path)
}

/// Failing to inspect a path while deleting it is still a delete failure.
fn delete_error(err: StoreError) -> StoreError {
    match err {
        StoreError::Read { path, source, .. } => StoreError::write("delete", path, source),
        other => other,
    }
}
