use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::backend::{LocalTree, copy_local_file};
use crate::errors::{StoreError, StoreResult};
use crate::filesystem::FileSystem;
use crate::model::{TransferKind, TransferProgress};
use crate::tree::remove_tree;

pub type RenameFn = fn(&Path, &Path) -> io::Result<()>;

/// Copies and moves local files and trees, reporting per-chunk progress.
pub struct TransferEngine<'a> {
    on_progress: Box<dyn FnMut(&TransferProgress) + 'a>,
    rename: RenameFn,
}

impl<'a> TransferEngine<'a> {
    pub fn new(on_progress: impl FnMut(&TransferProgress) + 'a) -> Self {
        Self {
            on_progress: Box::new(on_progress),
            rename: rename_path,
        }
    }

    /// Replaces the rename used by the move fast path.
    pub fn with_rename(mut self, rename: RenameFn) -> Self {
        self.rename = rename;
        self
    }

    /// Copies or moves `source` into `destination_dir`, keeping its name.
    /// Returns the path the source ended up at.
    pub fn transfer(
        &mut self,
        source: &Path,
        destination_dir: &Path,
        kind: TransferKind,
    ) -> StoreResult<PathBuf> {
        let metadata = fs::metadata(source).map_err(|err| StoreError::read("stat", source, err))?;
        let name = source_name(source)?;
        let destination = destination_dir.join(name);

        let source_parent = source.parent().unwrap_or(Path::new(""));
        let resolved_source = resolve_path(source_parent).join(name);
        let resolved_destination = resolve_path(destination_dir).join(name);
        if resolved_destination == resolved_source {
            return Err(StoreError::unsupported(
                "transfer",
                format!(
                    "{} is already in {}",
                    name.to_string_lossy(),
                    destination_dir.display()
                ),
            ));
        }
        let source_target = fs::canonicalize(source).unwrap_or_else(|_| resolved_source.clone());
        if metadata.is_dir()
            && (resolved_destination.starts_with(&resolved_source)
                || resolved_destination.starts_with(&source_target))
        {
            return Err(StoreError::unsupported(
                "transfer",
                format!("cannot {kind} {} into itself", source.display()),
            ));
        }

        if kind == TransferKind::Move {
            match (self.rename)(source, destination.as_path()) {
                Ok(()) => {
                    info!(
                        source = %source.display(),
                        destination = %destination.display(),
                        "moved by rename"
                    );
                    (self.on_progress)(&TransferProgress::renamed(kind, name.to_string_lossy()));
                    return Ok(destination);
                }
                Err(err) => {
                    debug!(
                        source = %source.display(),
                        destination = %destination.display(),
                        "rename failed, falling back to copy: {err}"
                    );
                }
            }
        }

        if metadata.is_dir() {
            self.transfer_dir(source, destination.as_path(), kind)?;
        } else {
            self.transfer_file(source, destination.as_path(), kind)?;
        }
        info!(
            source = %source.display(),
            destination = %destination.display(),
            "{kind} finished"
        );
        Ok(destination)
    }

    fn transfer_dir(
        &mut self,
        source: &Path,
        destination: &Path,
        kind: TransferKind,
    ) -> StoreResult<()> {
        fs::create_dir_all(destination)
            .map_err(|err| StoreError::write("mkdir", destination, err))?;

        for entry in fs::read_dir(source).map_err(|err| StoreError::read("list", source, err))? {
            let entry = entry.map_err(|err| StoreError::read("list", source, err))?;
            let child_source = entry.path();
            let child_destination = destination.join(entry.file_name());
            let file_type = entry
                .file_type()
                .map_err(|err| StoreError::read("stat", child_source.as_path(), err))?;

            if file_type.is_dir() {
                self.transfer_dir(child_source.as_path(), child_destination.as_path(), kind)?;
            } else {
                self.transfer_file(child_source.as_path(), child_destination.as_path(), kind)?;
            }
        }

        if kind == TransferKind::Move {
            remove_tree(&LocalTree, source)?;
        }
        Ok(())
    }

    fn transfer_file(
        &mut self,
        source: &Path,
        destination: &Path,
        kind: TransferKind,
    ) -> StoreResult<()> {
        let label = source_name(source)?.to_string_lossy().to_string();
        let on_progress = &mut self.on_progress;
        copy_local_file(kind_operation(kind), source, destination, &mut |done, total| {
            on_progress(&TransferProgress::new(kind, label.as_str(), done, total))
        })?;

        if kind == TransferKind::Move {
            fs::remove_file(source).map_err(|err| StoreError::write("delete", source, err))?;
        }
        Ok(())
    }

    /// Moves `source` from one panel's store into the current directory of
    /// another panel's store.
    ///
    /// Local-to-local goes through [`TransferEngine::transfer`]; a copy that
    /// crosses stores uses the remote backend's upload or download. Moves
    /// across stores and remote-to-remote copies are refused.
    pub fn transfer_between(
        &mut self,
        source_fs: &FileSystem,
        source: &Path,
        destination_fs: &FileSystem,
        kind: TransferKind,
    ) -> StoreResult<PathBuf> {
        let destination_dir = destination_fs.current_path();
        match (source_fs.is_remote(), destination_fs.is_remote(), kind) {
            (false, false, _) => self.transfer(source, destination_dir, kind),
            (_, _, TransferKind::Move) => Err(StoreError::unsupported(
                "move",
                "moving between different stores is not supported",
            )),
            (true, true, TransferKind::Copy) => Err(StoreError::unsupported(
                "copy",
                "copying between two remote stores is not supported",
            )),
            (false, true, TransferKind::Copy) => {
                let target = destination_dir.join(source_name(source)?);
                self.cross_store_copy(source, &target, |source, target, progress| {
                    destination_fs.backend().upload(source, target, progress)
                })?;
                Ok(target)
            }
            (true, false, TransferKind::Copy) => {
                let target = destination_dir.join(source_name(source)?);
                self.cross_store_copy(source, &target, |source, target, progress| {
                    source_fs.backend().download(source, target, progress)
                })?;
                Ok(target)
            }
        }
    }

    fn cross_store_copy<F>(&mut self, source: &Path, target: &Path, run: F) -> StoreResult<()>
    where
        F: FnOnce(&Path, &Path, &mut dyn FnMut(u64, u64)) -> StoreResult<()>,
    {
        let label = source_name(source)?.to_string_lossy().to_string();
        let on_progress = &mut self.on_progress;
        run(source, target, &mut |done, total| {
            on_progress(&TransferProgress::new(
                TransferKind::Copy,
                label.as_str(),
                done,
                total,
            ))
        })?;
        info!(
            source = %source.display(),
            destination = %target.display(),
            "cross-store copy finished"
        );
        Ok(())
    }
}

fn rename_path(from: &Path, to: &Path) -> io::Result<()> {
    fs::rename(from, to)
}

/// Absolute form of `path` with symlinks resolved for the part that exists.
/// Components below the deepest existing ancestor are appended as written.
fn resolve_path(path: &Path) -> PathBuf {
    let mut existing = path;
    let mut missing = Vec::new();
    loop {
        let lookup = if existing.as_os_str().is_empty() {
            Path::new(".")
        } else {
            existing
        };
        if let Ok(resolved) = fs::canonicalize(lookup) {
            return missing
                .iter()
                .rev()
                .fold(resolved, |acc, part| acc.join(part));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name);
                existing = parent;
            }
            _ => return path.to_path_buf(),
        }
    }
}

fn source_name(source: &Path) -> StoreResult<&OsStr> {
    source.file_name().ok_or_else(|| {
        StoreError::read(
            "transfer",
            source,
            io::Error::new(io::ErrorKind::InvalidInput, "source path has no file name"),
        )
    })
}

fn kind_operation(kind: TransferKind) -> &'static str {
    match kind {
        TransferKind::Copy => "copy",
        TransferKind::Move => "move",
    }
}

#[cfg(test)]
mod tests {
    use super::TransferEngine;
    use crate::backend::LocalBackend;
    use crate::errors::StoreError;
    use crate::filesystem::FileSystem;
    use crate::model::{TransferKind, TransferProgress};
    use std::fs;
    use std::io;
    use std::path::Path;

    fn write(path: &Path, bytes: &[u8]) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(path, bytes).expect("write fixture");
    }

    fn cross_device(_: &Path, _: &Path) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::CrossesDevices,
            "invalid cross-device link",
        ))
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|idx| (idx % 251) as u8).collect()
    }

    #[test]
    fn copy_twice_overwrites_with_identical_bytes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let source = temp.path().join("src/data.bin");
        let bytes = payload(70_000);
        write(&source, &bytes);
        let dest_dir = temp.path().join("dst");
        write(&dest_dir.join("data.bin"), &payload(200_000));

        let mut engine = TransferEngine::new(|_| {});
        let first = engine
            .transfer(&source, &dest_dir, TransferKind::Copy)
            .expect("first copy");
        let second = engine
            .transfer(&source, &dest_dir, TransferKind::Copy)
            .expect("second copy");

        assert_eq!(first, second);
        assert_eq!(fs::read(&second).expect("read"), bytes);
        assert_eq!(fs::read(&source).expect("read source"), bytes);
    }

    #[test]
    fn single_file_progress_ends_complete_at_total() {
        let temp = tempfile::tempdir().expect("tempdir");
        let source = temp.path().join("big.bin");
        write(&source, &payload(100_000));
        let dest_dir = temp.path().join("out");
        fs::create_dir(&dest_dir).expect("mkdir");

        let mut records: Vec<TransferProgress> = Vec::new();
        {
            let mut engine = TransferEngine::new(|progress| records.push(progress.clone()));
            engine
                .transfer(&source, &dest_dir, TransferKind::Copy)
                .expect("copy");
        }

        assert!(!records.is_empty());
        let last = records.last().expect("last record");
        assert_eq!(last.transferred_size, 100_000);
        assert_eq!(last.total_size, 100_000);
        assert!(last.completed);
        assert_eq!(last.current_file, "big.bin");
        assert_eq!(last.kind, TransferKind::Copy);
        assert!((last.percentage - 100.0).abs() < f64::EPSILON);
        assert!(records[..records.len() - 1].iter().all(|record| !record.completed));
    }

    #[test]
    fn empty_file_still_gets_a_completed_record() {
        let temp = tempfile::tempdir().expect("tempdir");
        let source = temp.path().join("empty.txt");
        write(&source, b"");
        let dest_dir = temp.path().join("out");
        fs::create_dir(&dest_dir).expect("mkdir");

        let mut records: Vec<TransferProgress> = Vec::new();
        {
            let mut engine = TransferEngine::new(|progress| records.push(progress.clone()));
            engine
                .transfer(&source, &dest_dir, TransferKind::Copy)
                .expect("copy");
        }
        assert_eq!(records.len(), 1);
        assert!(records[0].completed);
        assert!(dest_dir.join("empty.txt").is_file());
    }

    #[test]
    fn same_volume_move_renames_with_one_record() {
        let temp = tempfile::tempdir().expect("tempdir");
        let source = temp.path().join("report.txt");
        write(&source, b"quarterly numbers");
        let dest_dir = temp.path().join("archive");
        fs::create_dir(&dest_dir).expect("mkdir");

        let mut records: Vec<TransferProgress> = Vec::new();
        let moved;
        {
            let mut engine = TransferEngine::new(|progress| records.push(progress.clone()));
            moved = engine
                .transfer(&source, &dest_dir, TransferKind::Move)
                .expect("move");
        }

        assert_eq!(records.len(), 1);
        assert!(records[0].completed);
        assert_eq!(records[0].total_size, 0);
        assert_eq!(records[0].kind, TransferKind::Move);
        assert!(!source.exists());
        assert_eq!(fs::read(moved).expect("read"), b"quarterly numbers");
    }

    #[test]
    fn failed_rename_falls_back_to_copy_and_delete() {
        let temp = tempfile::tempdir().expect("tempdir");
        let source = temp.path().join("photo.raw");
        let bytes = payload(90_000);
        write(&source, &bytes);
        let dest_dir = temp.path().join("other-volume");
        fs::create_dir(&dest_dir).expect("mkdir");

        let mut records: Vec<TransferProgress> = Vec::new();
        {
            let mut engine = TransferEngine::new(|progress| records.push(progress.clone()))
                .with_rename(cross_device);
            engine
                .transfer(&source, &dest_dir, TransferKind::Move)
                .expect("move");
        }

        assert!(!source.exists());
        assert_eq!(fs::read(dest_dir.join("photo.raw")).expect("read"), bytes);
        let last = records.last().expect("records");
        assert_eq!(last.transferred_size, 90_000);
        assert!(last.completed);
    }

    #[test]
    fn directory_move_fallback_mirrors_and_removes_source() {
        let temp = tempfile::tempdir().expect("tempdir");
        let source = temp.path().join("project");
        write(&source.join("README"), b"readme");
        write(&source.join("src/main.c"), b"int main(){}");
        write(&source.join("src/lib/util.c"), b"void util(){}");
        fs::create_dir_all(source.join("empty")).expect("mkdir");
        let dest_dir = temp.path().join("moved");
        fs::create_dir(&dest_dir).expect("mkdir");

        let mut engine = TransferEngine::new(|_| {}).with_rename(cross_device);
        let moved = engine
            .transfer(&source, &dest_dir, TransferKind::Move)
            .expect("move");

        assert!(!source.exists());
        assert_eq!(fs::read(moved.join("README")).expect("read"), b"readme");
        assert_eq!(fs::read(moved.join("src/main.c")).expect("read"), b"int main(){}");
        assert_eq!(
            fs::read(moved.join("src/lib/util.c")).expect("read"),
            b"void util(){}"
        );
        assert!(moved.join("empty").is_dir());
    }

    #[test]
    fn directory_copy_keeps_source() {
        let temp = tempfile::tempdir().expect("tempdir");
        let source = temp.path().join("tree");
        write(&source.join("a/b/c.txt"), b"c");
        let dest_dir = temp.path().join("copy");
        fs::create_dir(&dest_dir).expect("mkdir");

        let mut engine = TransferEngine::new(|_| {});
        let copied = engine
            .transfer(&source, &dest_dir, TransferKind::Copy)
            .expect("copy");

        assert!(source.join("a/b/c.txt").is_file());
        assert_eq!(fs::read(copied.join("a/b/c.txt")).expect("read"), b"c");
    }

    #[test]
    fn missing_source_is_read_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut engine = TransferEngine::new(|_| {});
        let err = engine
            .transfer(&temp.path().join("ghost"), temp.path(), TransferKind::Copy)
            .unwrap_err();
        assert!(matches!(err, StoreError::Read { .. }));
    }

    #[test]
    fn refuses_copy_onto_itself_or_into_own_subtree() {
        let temp = tempfile::tempdir().expect("tempdir");
        let file = temp.path().join("same.txt");
        write(&file, b"keep me");
        let tree = temp.path().join("tree");
        write(&tree.join("inner/x.txt"), b"x");

        let mut engine = TransferEngine::new(|_| {});
        let err = engine
            .transfer(&file, temp.path(), TransferKind::Copy)
            .unwrap_err();
        assert!(matches!(err, StoreError::Unsupported { .. }));
        assert_eq!(fs::read(&file).expect("read"), b"keep me");

        let err = engine
            .transfer(&tree, &tree.join("inner"), TransferKind::Copy)
            .unwrap_err();
        assert!(matches!(err, StoreError::Unsupported { .. }));
    }

    #[test]
    fn refuses_destination_that_aliases_the_source_directory() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join("dir");
        let file = dir.join("same.txt");
        write(&file, b"keep me");
        let tree = temp.path().join("tree");
        write(&tree.join("inner/x.txt"), b"x");

        let mut engine = TransferEngine::new(|_| {});
        for kind in [TransferKind::Copy, TransferKind::Move] {
            let err = engine
                .transfer(&file, &dir.join("..").join("dir"), kind)
                .unwrap_err();
            assert!(matches!(err, StoreError::Unsupported { .. }));
            assert_eq!(fs::read(&file).expect("read"), b"keep me");
        }

        let err = engine
            .transfer(
                &tree,
                &temp.path().join("tree/../tree/inner"),
                TransferKind::Copy,
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::Unsupported { .. }));
        assert!(!tree.join("inner/tree").exists());
    }

    #[cfg(unix)]
    #[test]
    fn refuses_destination_reached_through_a_symlink() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join("dir");
        let file = dir.join("same.txt");
        write(&file, b"keep me");
        let link = temp.path().join("shortcut");
        std::os::unix::fs::symlink(&dir, &link).expect("symlink");

        let mut engine = TransferEngine::new(|_| {});
        let err = engine
            .transfer(&file, &link, TransferKind::Copy)
            .unwrap_err();
        assert!(matches!(err, StoreError::Unsupported { .. }));
        assert_eq!(fs::read(&file).expect("read"), b"keep me");
    }

    #[test]
    fn failed_fallback_copy_keeps_source_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let source = temp.path().join("notes.txt");
        write(&source, b"draft");
        let dest_dir = temp.path().join("out");
        // A directory in the way makes creating the destination file fail.
        fs::create_dir_all(dest_dir.join("notes.txt")).expect("mkdir");

        let mut engine = TransferEngine::new(|_| {}).with_rename(cross_device);
        let err = engine
            .transfer(&source, &dest_dir, TransferKind::Move)
            .unwrap_err();

        assert!(matches!(err, StoreError::Write { .. }));
        assert_eq!(fs::read(&source).expect("read"), b"draft");
    }

    #[test]
    fn failed_fallback_copy_stops_before_later_siblings() {
        let temp = tempfile::tempdir().expect("tempdir");
        let source = temp.path().join("batch");
        for name in ["a.txt", "b.txt", "c.txt", "d.txt"] {
            write(&source.join(name), name.as_bytes());
        }
        let listing: Vec<String> = fs::read_dir(&source)
            .expect("read_dir")
            .map(|entry| entry.expect("entry").file_name().to_string_lossy().to_string())
            .collect();
        let copied = temp.path().join("out/batch");
        let blocked = copied.join(&listing[1]);
        fs::create_dir_all(&blocked).expect("mkdir");

        let mut engine = TransferEngine::new(|_| {}).with_rename(cross_device);
        let err = engine
            .transfer(&source, &temp.path().join("out"), TransferKind::Move)
            .unwrap_err();

        assert!(matches!(err, StoreError::Write { .. }));
        assert_eq!(err.path(), Some(&blocked));
        for name in &listing {
            assert_eq!(fs::read(source.join(name)).expect("source kept"), name.as_bytes());
        }
        assert_eq!(
            fs::read(copied.join(&listing[0])).expect("earlier sibling"),
            listing[0].as_bytes()
        );
        for name in &listing[2..] {
            assert!(!copied.join(name).exists(), "{name} should not be copied");
        }
    }

    #[test]
    fn panel_transfer_between_local_stores_uses_engine() {
        let temp = tempfile::tempdir().expect("tempdir");
        let source = temp.path().join("left/file.txt");
        write(&source, b"left side");
        let left = FileSystem::new(temp.path().join("left"));
        let right_dir = temp.path().join("right");
        fs::create_dir(&right_dir).expect("mkdir");
        let right = FileSystem::new(right_dir.clone());

        let mut engine = TransferEngine::new(|_| {});
        let target = engine
            .transfer_between(&left, &source, &right, TransferKind::Move)
            .expect("move");

        assert_eq!(target, right_dir.join("file.txt"));
        assert!(!source.exists());
        assert_eq!(
            right.refresh().expect("refresh")[0].name,
            "file.txt".to_string()
        );
    }

    #[test]
    fn panel_copy_to_remote_store_uploads_with_progress() {
        let temp = tempfile::tempdir().expect("tempdir");
        let source = temp.path().join("local/upload.bin");
        write(&source, &payload(50_000));
        let local = FileSystem::new(temp.path().join("local"));
        let remote_dir = temp.path().join("remote");
        fs::create_dir(&remote_dir).expect("mkdir");
        let mut remote = FileSystem::new(remote_dir.clone());
        remote.set_remote(Box::new(LocalBackend)).expect("attach");

        let mut records: Vec<TransferProgress> = Vec::new();
        {
            let mut engine = TransferEngine::new(|progress| records.push(progress.clone()));
            engine
                .transfer_between(&local, &source, &remote, TransferKind::Copy)
                .expect("upload");
        }

        assert!(source.exists());
        assert_eq!(
            fs::read(remote_dir.join("upload.bin")).expect("read"),
            payload(50_000)
        );
        let last = records.last().expect("records");
        assert!(last.completed);
        assert_eq!(last.current_file, "upload.bin");
    }

    #[test]
    fn panel_move_across_stores_is_unsupported() {
        let temp = tempfile::tempdir().expect("tempdir");
        let source = temp.path().join("keep.txt");
        write(&source, b"stay");
        let local = FileSystem::new(temp.path());
        let mut remote = FileSystem::new(temp.path().join("elsewhere"));
        remote.set_remote(Box::new(LocalBackend)).expect("attach");

        let mut engine = TransferEngine::new(|_| {});
        let err = engine
            .transfer_between(&local, &source, &remote, TransferKind::Move)
            .unwrap_err();
        assert!(matches!(err, StoreError::Unsupported { operation: "move", .. }));
        assert!(source.exists());

        let err = engine
            .transfer_between(&remote, &source, &remote, TransferKind::Copy)
            .unwrap_err();
        assert!(matches!(err, StoreError::Unsupported { operation: "copy", .. }));
    }
}
