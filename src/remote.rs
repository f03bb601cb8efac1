use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::mem;
use std::net::TcpStream;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use ssh2::{FileStat, Session, Sftp};
use tracing::{debug, info, warn};

use crate::backend::{StoreBackend, walk_local_tree};
use crate::errors::{ConnectPhase, StoreError, StoreResult};
use crate::model::{ConnectionConfig, Entry, format_permissions, is_dir_mode};
use crate::progress::copy_with_progress;
use crate::tree::{TreeOps, remove_tree};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Connected,
    Closed,
}

enum SessionState {
    Unconnected,
    Connected { session: Session, sftp: Sftp },
    Closed,
}

/// Store backend over one SSH session and one SFTP channel.
pub struct SftpBackend {
    endpoint: String,
    state: SessionState,
}

impl Default for SftpBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SftpBackend {
    pub fn new() -> Self {
        Self {
            endpoint: String::new(),
            state: SessionState::Unconnected,
        }
    }

    /// Builds a backend and connects it in one step.
    pub fn open(config: &ConnectionConfig) -> StoreResult<Self> {
        let mut backend = Self::new();
        backend.connect(config)?;
        Ok(backend)
    }

    pub fn state(&self) -> ConnectionState {
        match self.state {
            SessionState::Unconnected => ConnectionState::Unconnected,
            SessionState::Connected { .. } => ConnectionState::Connected,
            SessionState::Closed => ConnectionState::Closed,
        }
    }

    pub fn endpoint(&self) -> &str {
        self.endpoint.as_str()
    }

    pub fn connect(&mut self, config: &ConnectionConfig) -> StoreResult<()> {
        match self.state {
            SessionState::Unconnected => {}
            SessionState::Connected { .. } => {
                return Err(StoreError::unsupported(
                    "connect",
                    format!("already connected to {}", self.endpoint),
                ));
            }
            SessionState::Closed => {
                return Err(StoreError::unsupported(
                    "connect",
                    "backend was closed; create a new one",
                ));
            }
        }
        config.validate()?;

        let endpoint = config.endpoint();
        let (session, sftp) = open_session(config, endpoint.as_str())?;
        info!(endpoint = %endpoint, user = %config.username, "sftp session established");
        self.endpoint = endpoint;
        self.state = SessionState::Connected { session, sftp };
        Ok(())
    }

    fn sftp(&self, operation: &'static str) -> StoreResult<&Sftp> {
        match &self.state {
            SessionState::Connected { sftp, .. } => Ok(sftp),
            _ => Err(StoreError::NotConnected { operation }),
        }
    }
}

fn open_session(config: &ConnectionConfig, endpoint: &str) -> StoreResult<(Session, Sftp)> {
    let tcp = TcpStream::connect(endpoint)
        .map_err(|err| StoreError::connect(ConnectPhase::Dial, endpoint, err))?;

    let mut session = Session::new()
        .map_err(|err| StoreError::connect(ConnectPhase::Handshake, endpoint, err.into()))?;
    session.set_tcp_stream(tcp);
    session
        .handshake()
        .map_err(|err| StoreError::connect(ConnectPhase::Handshake, endpoint, err.into()))?;
    warn!(endpoint = %endpoint, "host key not verified");

    session
        .userauth_password(config.username.as_str(), config.password.as_str())
        .map_err(|err| StoreError::connect(ConnectPhase::Authenticate, endpoint, err.into()))?;
    if !session.authenticated() {
        return Err(StoreError::connect(
            ConnectPhase::Authenticate,
            endpoint,
            io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("server rejected credentials for {}", config.username),
            ),
        ));
    }

    let sftp = session
        .sftp()
        .map_err(|err| StoreError::connect(ConnectPhase::Channel, endpoint, err.into()))?;
    Ok((session, sftp))
}

impl StoreBackend for SftpBackend {
    fn backend_name(&self) -> &'static str {
        "sftp"
    }

    fn list(&self, path: &Path) -> StoreResult<Vec<Entry>> {
        let sftp = self.sftp("list")?;
        let entries = read_children(sftp, "list", path)?
            .into_iter()
            .map(|(name, stat)| Entry {
                path: path.join(name.as_str()),
                name,
                size: stat.size.unwrap_or(0),
                modified: stat.mtime.map(|secs| UNIX_EPOCH + Duration::from_secs(secs)),
                is_dir: stat.is_dir(),
                permissions: stat.perm.map(format_permissions),
            })
            .collect();
        Ok(entries)
    }

    fn create_dir(&self, path: &Path) -> StoreResult<()> {
        let sftp = self.sftp("mkdir")?;
        create_remote_dir_all(sftp, path)
    }

    fn delete(&self, path: &Path) -> StoreResult<()> {
        let sftp = self.sftp("delete")?;
        remove_tree(&SftpTree { sftp }, path)
    }

    fn upload(
        &self,
        local_path: &Path,
        remote_path: &Path,
        on_progress: &mut dyn FnMut(u64, u64),
    ) -> StoreResult<()> {
        let sftp = self.sftp("upload")?;
        walk_local_tree("upload", local_path, remote_path, &mut |source, target, is_dir| {
            if is_dir {
                return create_remote_dir_all(sftp, target);
            }
            upload_file(sftp, source, target, &mut *on_progress)
        })
    }

    fn download(
        &self,
        remote_path: &Path,
        local_path: &Path,
        on_progress: &mut dyn FnMut(u64, u64),
    ) -> StoreResult<()> {
        let sftp = self.sftp("download")?;
        let stat = sftp
            .stat(remote_path)
            .map_err(|err| StoreError::read("download", remote_path, err.into()))?;
        download_path(sftp, remote_path, &stat, local_path, on_progress)
    }

    /// Shuts the SFTP channel down, then disconnects the SSH session.
    fn close(&mut self) -> StoreResult<()> {
        match mem::replace(&mut self.state, SessionState::Closed) {
            SessionState::Unconnected => {
                self.state = SessionState::Unconnected;
                Ok(())
            }
            SessionState::Closed => Err(StoreError::NotConnected { operation: "close" }),
            SessionState::Connected { session, mut sftp } => {
                let channel = sftp.shutdown();
                drop(sftp);
                let transport = session.disconnect(None, "closing sftp session", None);
                info!(endpoint = %self.endpoint, "sftp session closed");

                channel.and(transport).map_err(|err| {
                    StoreError::connect(ConnectPhase::Close, self.endpoint.as_str(), err.into())
                })
            }
        }
    }
}

impl Drop for SftpBackend {
    fn drop(&mut self) {
        if matches!(self.state, SessionState::Connected { .. }) {
            if let Err(err) = self.close() {
                warn!("failed to close dropped sftp session: {err}");
            }
        }
    }
}

struct SftpTree<'a> {
    sftp: &'a Sftp,
}

impl TreeOps for SftpTree<'_> {
    fn is_dir(&self, path: &Path) -> StoreResult<bool> {
        let stat = self
            .sftp
            .lstat(path)
            .map_err(|err| StoreError::read("stat", path, err.into()))?;
        Ok(stat.perm.is_some_and(is_dir_mode))
    }

    fn children(&self, path: &Path) -> StoreResult<Vec<PathBuf>> {
        Ok(read_children(self.sftp, "delete", path)?
            .into_iter()
            .map(|(name, _)| path.join(name))
            .collect())
    }

    fn remove_file(&self, path: &Path) -> StoreResult<()> {
        self.sftp
            .unlink(path)
            .map_err(|err| StoreError::write("delete", path, err.into()))
    }

    fn remove_dir(&self, path: &Path) -> StoreResult<()> {
        self.sftp
            .rmdir(path)
            .map_err(|err| StoreError::write("delete", path, err.into()))
    }
}

fn read_children(
    sftp: &Sftp,
    operation: &'static str,
    path: &Path,
) -> StoreResult<Vec<(String, FileStat)>> {
    let listing = sftp
        .readdir(path)
        .map_err(|err| StoreError::read(operation, path, err.into()))?;

    let mut children = Vec::with_capacity(listing.len());
    for (entry_path, stat) in listing {
        let Some(name) = entry_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
        else {
            continue;
        };
        if name == "." || name == ".." {
            continue;
        }
        children.push((name, stat));
    }
    Ok(children)
}

fn create_remote_dir_all(sftp: &Sftp, path: &Path) -> StoreResult<()> {
    let mut current = PathBuf::new();
    for component in path.components() {
        current.push(component);
        if matches!(
            component,
            Component::RootDir | Component::Prefix(_) | Component::CurDir
        ) {
            continue;
        }

        match sftp.stat(current.as_path()) {
            Ok(stat) if stat.is_dir() => continue,
            Ok(_) => {
                return Err(StoreError::write(
                    "mkdir",
                    current,
                    io::Error::new(io::ErrorKind::AlreadyExists, "exists and is not a directory"),
                ));
            }
            Err(_) => {}
        }

        if let Err(err) = sftp.mkdir(current.as_path(), 0o755) {
            // Someone else may have created it between stat and mkdir.
            let created = sftp
                .stat(current.as_path())
                .map(|stat| stat.is_dir())
                .unwrap_or(false);
            if !created {
                return Err(StoreError::write("mkdir", current, err.into()));
            }
        }
        debug!(path = %current.display(), "remote mkdir");
    }
    Ok(())
}

fn upload_file(
    sftp: &Sftp,
    local_path: &Path,
    remote_path: &Path,
    on_progress: &mut dyn FnMut(u64, u64),
) -> StoreResult<()> {
    let local_file =
        File::open(local_path).map_err(|err| StoreError::read("upload", local_path, err))?;
    let total = local_file
        .metadata()
        .map_err(|err| StoreError::read("upload", local_path, err))?
        .len();
    let mut remote_file = sftp
        .create(remote_path)
        .map_err(|err| StoreError::write("upload", remote_path, err.into()))?;

    copy_with_progress(local_file, &mut remote_file, total, on_progress)
        .map_err(|failure| failure.into_store_error("upload", local_path, remote_path))?;
    Ok(())
}

fn download_path(
    sftp: &Sftp,
    remote_path: &Path,
    stat: &FileStat,
    local_path: &Path,
    on_progress: &mut dyn FnMut(u64, u64),
) -> StoreResult<()> {
    if !stat.is_dir() {
        return download_file(sftp, remote_path, stat, local_path, on_progress);
    }

    fs::create_dir_all(local_path).map_err(|err| StoreError::write("download", local_path, err))?;
    debug!(path = %local_path.display(), "local mkdir");
    for (name, child_stat) in read_children(sftp, "download", remote_path)? {
        download_path(
            sftp,
            remote_path.join(name.as_str()).as_path(),
            &child_stat,
            local_path.join(name.as_str()).as_path(),
            &mut *on_progress,
        )?;
    }
    Ok(())
}

fn download_file(
    sftp: &Sftp,
    remote_path: &Path,
    stat: &FileStat,
    local_path: &Path,
    on_progress: &mut dyn FnMut(u64, u64),
) -> StoreResult<()> {
    let remote_file = sftp
        .open(remote_path)
        .map_err(|err| StoreError::read("download", remote_path, err.into()))?;
    let total = stat.size.unwrap_or(0);
    let local_file =
        File::create(local_path).map_err(|err| StoreError::write("download", local_path, err))?;
    let mut writer = BufWriter::new(local_file);

    debug!(
        source = %remote_path.display(),
        destination = %local_path.display(),
        total,
        "download file"
    );
    copy_with_progress(remote_file, &mut writer, total, on_progress)
        .map_err(|failure| failure.into_store_error("download", remote_path, local_path))?;
    Ok(())
}
