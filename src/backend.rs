use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::errors::{StoreError, StoreResult};
use crate::model::Entry;
use crate::progress::copy_with_progress;
use crate::tree::{TreeOps, remove_tree};

/// Capability set shared by the local disk and the remote SFTP store.
///
/// Progress callbacks receive `(transferred, total)` for the file currently
/// being streamed. Every file yields at least one callback and the last one
/// for a file has `transferred == total`.
pub trait StoreBackend {
    fn backend_name(&self) -> &'static str;
    fn list(&self, path: &Path) -> StoreResult<Vec<Entry>>;
    fn create_dir(&self, path: &Path) -> StoreResult<()>;
    fn delete(&self, path: &Path) -> StoreResult<()>;
    fn upload(
        &self,
        local_path: &Path,
        remote_path: &Path,
        on_progress: &mut dyn FnMut(u64, u64),
    ) -> StoreResult<()>;
    fn download(
        &self,
        remote_path: &Path,
        local_path: &Path,
        on_progress: &mut dyn FnMut(u64, u64),
    ) -> StoreResult<()>;
    fn close(&mut self) -> StoreResult<()>;
}

#[derive(Debug, Default, Clone)]
pub struct LocalBackend;

impl StoreBackend for LocalBackend {
    fn backend_name(&self) -> &'static str {
        "local"
    }

    fn list(&self, path: &Path) -> StoreResult<Vec<Entry>> {
        let dir_iter = fs::read_dir(path).map_err(|err| StoreError::read("list", path, err))?;

        let mut entries = Vec::new();
        for entry_result in dir_iter {
            let entry = entry_result.map_err(|err| StoreError::read("list", path, err))?;
            let entry_path = entry.path();
            // Entries can vanish between readdir and lstat.
            let metadata = match fs::symlink_metadata(&entry_path) {
                Ok(metadata) => metadata,
                Err(err) => {
                    debug!(path = %entry_path.display(), "skipping entry: {err}");
                    continue;
                }
            };
            entries.push(Entry {
                name: entry.file_name().to_string_lossy().to_string(),
                path: entry_path,
                size: metadata.len(),
                modified: metadata.modified().ok(),
                is_dir: metadata.file_type().is_dir(),
                permissions: local_permissions(&metadata),
            });
        }
        Ok(entries)
    }

    fn create_dir(&self, path: &Path) -> StoreResult<()> {
        fs::create_dir_all(path).map_err(|err| StoreError::write("mkdir", path, err))
    }

    fn delete(&self, path: &Path) -> StoreResult<()> {
        remove_tree(&LocalTree, path)
    }

    fn upload(
        &self,
        local_path: &Path,
        remote_path: &Path,
        on_progress: &mut dyn FnMut(u64, u64),
    ) -> StoreResult<()> {
        copy_local_tree("upload", local_path, remote_path, on_progress)
    }

    fn download(
        &self,
        remote_path: &Path,
        local_path: &Path,
        on_progress: &mut dyn FnMut(u64, u64),
    ) -> StoreResult<()> {
        copy_local_tree("download", remote_path, local_path, on_progress)
    }

    fn close(&mut self) -> StoreResult<()> {
        Ok(())
    }
}

pub(crate) struct LocalTree;

impl TreeOps for LocalTree {
    fn is_dir(&self, path: &Path) -> StoreResult<bool> {
        let metadata =
            fs::symlink_metadata(path).map_err(|err| StoreError::read("stat", path, err))?;
        Ok(metadata.file_type().is_dir())
    }

    fn children(&self, path: &Path) -> StoreResult<Vec<PathBuf>> {
        let mut children = Vec::new();
        for entry in fs::read_dir(path).map_err(|err| StoreError::read("list", path, err))? {
            let entry = entry.map_err(|err| StoreError::read("list", path, err))?;
            children.push(entry.path());
        }
        Ok(children)
    }

    fn remove_file(&self, path: &Path) -> StoreResult<()> {
        fs::remove_file(path).map_err(|err| StoreError::write("delete", path, err))
    }

    fn remove_dir(&self, path: &Path) -> StoreResult<()> {
        fs::remove_dir(path).map_err(|err| StoreError::write("delete", path, err))
    }
}

/// Streams one local file into `destination`, creating or truncating it.
pub(crate) fn copy_local_file(
    operation: &'static str,
    source: &Path,
    destination: &Path,
    on_progress: &mut dyn FnMut(u64, u64),
) -> StoreResult<u64> {
    let src_file = File::open(source).map_err(|err| StoreError::read(operation, source, err))?;
    let src_metadata = src_file
        .metadata()
        .map_err(|err| StoreError::read(operation, source, err))?;
    // Creating the destination would truncate the source.
    if is_same_file(source, &src_metadata, destination) {
        return Err(StoreError::unsupported(
            operation,
            format!(
                "{} and {} are the same file",
                source.display(),
                destination.display()
            ),
        ));
    }
    let total = src_metadata.len();
    let dst_file =
        File::create(destination).map_err(|err| StoreError::write(operation, destination, err))?;
    let mut writer = BufWriter::new(dst_file);

    copy_with_progress(src_file, &mut writer, total, on_progress)
        .map_err(|failure| failure.into_store_error(operation, source, destination))
}

/// Mirrors a local file or tree, creating every directory before its files.
fn copy_local_tree(
    operation: &'static str,
    source: &Path,
    destination: &Path,
    on_progress: &mut dyn FnMut(u64, u64),
) -> StoreResult<()> {
    walk_local_tree(operation, source, destination, &mut |entry_path, target, is_dir| {
        if is_dir {
            return fs::create_dir_all(target)
                .map_err(|err| StoreError::write(operation, target, err));
        }
        copy_local_file(operation, entry_path, target, &mut *on_progress).map(|_| ())
    })
}

/// Pre-order walk of a local file or tree. `visit` receives the local path,
/// the mirrored path under `destination`, and whether it is a directory.
pub(crate) fn walk_local_tree(
    operation: &'static str,
    source: &Path,
    destination: &Path,
    visit: &mut dyn FnMut(&Path, &Path, bool) -> StoreResult<()>,
) -> StoreResult<()> {
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.map_err(|err| {
            let path = err.path().unwrap_or(source).to_path_buf();
            StoreError::read(operation, path, err.into())
        })?;
        let relative = entry.path().strip_prefix(source).unwrap_or(Path::new(""));
        let target = if relative.as_os_str().is_empty() {
            destination.to_path_buf()
        } else {
            destination.join(relative)
        };

        let is_dir = entry.file_type().is_dir();
        debug!(
            source = %entry.path().display(),
            destination = %target.display(),
            is_dir,
            "{operation}"
        );
        visit(entry.path(), target.as_path(), is_dir)?;
    }
    Ok(())
}

#[cfg(unix)]
fn is_same_file(_source: &Path, source_metadata: &fs::Metadata, destination: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    fs::metadata(destination).is_ok_and(|existing| {
        existing.dev() == source_metadata.dev() && existing.ino() == source_metadata.ino()
    })
}

#[cfg(not(unix))]
fn is_same_file(source: &Path, _source_metadata: &fs::Metadata, destination: &Path) -> bool {
    match (fs::canonicalize(source), fs::canonicalize(destination)) {
        (Ok(source), Ok(destination)) => source == destination,
        _ => false,
    }
}

#[cfg(unix)]
fn local_permissions(metadata: &fs::Metadata) -> Option<String> {
    use std::os::unix::fs::PermissionsExt;

    Some(crate::model::format_permissions(metadata.permissions().mode()))
}

#[cfg(not(unix))]
fn local_permissions(_: &fs::Metadata) -> Option<String> {
    None
}
