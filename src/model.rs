use std::fmt;
use std::path::PathBuf;
use std::time::SystemTime;

use chrono::{DateTime, Local};

use crate::errors::{StoreError, StoreResult};

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFLNK: u32 = 0o120000;

/// One file-or-directory record produced by a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub modified: Option<SystemTime>,
    pub is_dir: bool,
    pub permissions: Option<String>,
}

impl Entry {
    pub fn modified_label(&self) -> String {
        match self.modified {
            Some(time) => DateTime::<Local>::from(time)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string(),
            None => "-".to_string(),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl ConnectionConfig {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.host.trim().is_empty() {
            return Err(StoreError::InvalidConfig {
                field: "host",
                reason: "must not be empty",
            });
        }
        if self.port == 0 {
            return Err(StoreError::InvalidConfig {
                field: "port",
                reason: "must be between 1 and 65535",
            });
        }
        if self.username.is_empty() {
            return Err(StoreError::InvalidConfig {
                field: "username",
                reason: "must not be empty",
            });
        }
        if self.password.is_empty() {
            return Err(StoreError::InvalidConfig {
                field: "password",
                reason: "must not be empty",
            });
        }
        Ok(())
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Copy,
    Move,
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Copy => f.write_str("copy"),
            Self::Move => f.write_str("move"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransferProgress {
    pub total_size: u64,
    pub transferred_size: u64,
    pub percentage: f64,
    pub current_file: String,
    pub completed: bool,
    pub kind: TransferKind,
}

impl TransferProgress {
    pub fn new(
        kind: TransferKind,
        current_file: impl Into<String>,
        transferred_size: u64,
        total_size: u64,
    ) -> Self {
        let completed = transferred_size == total_size;
        Self {
            total_size,
            transferred_size,
            percentage: percentage(transferred_size, total_size, completed),
            current_file: current_file.into(),
            completed,
            kind,
        }
    }

    /// Record emitted when a move finished through rename, without streaming.
    pub fn renamed(kind: TransferKind, current_file: impl Into<String>) -> Self {
        Self {
            total_size: 0,
            transferred_size: 0,
            percentage: 100.0,
            current_file: current_file.into(),
            completed: true,
            kind,
        }
    }
}

fn percentage(transferred: u64, total: u64, completed: bool) -> f64 {
    if total == 0 {
        return if completed { 100.0 } else { 0.0 };
    }
    transferred as f64 / total as f64 * 100.0
}

pub fn format_size(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{bytes} B");
    }
    let mut div = UNIT;
    let mut exp = 0usize;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    let suffix = ['K', 'M', 'G', 'T', 'P', 'E'][exp];
    format!("{:.1} {suffix}B", bytes as f64 / div as f64)
}

/// Renders a unix mode as `drwxr-xr-x`.
pub fn format_permissions(mode: u32) -> String {
    let kind = match mode & S_IFMT {
        S_IFDIR => 'd',
        S_IFLNK => 'l',
        _ => '-',
    };
    let mut out = String::with_capacity(10);
    out.push(kind);
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

pub fn is_dir_mode(mode: u32) -> bool {
    mode & S_IFMT == S_IFDIR
}
