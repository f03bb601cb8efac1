use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectPhase {
    Dial,
    Handshake,
    Authenticate,
    Channel,
    Close,
}

impl fmt::Display for ConnectPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Dial => "tcp dial",
            Self::Handshake => "ssh handshake",
            Self::Authenticate => "password authentication",
            Self::Channel => "sftp channel",
            Self::Close => "session close",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connect failed at {phase} for {endpoint}: {source}")]
    Connect {
        phase: ConnectPhase,
        endpoint: String,
        #[source]
        source: io::Error,
    },
    #[error("read failed during {operation} for {path}: {source}")]
    Read {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("write failed during {operation} for {path}: {source}")]
    Write {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{operation} is not supported: {reason}")]
    Unsupported {
        operation: &'static str,
        reason: String,
    },
    #[error("remote session is not connected ({operation})")]
    NotConnected { operation: &'static str },
    #[error("invalid connection setting {field}: {reason}")]
    InvalidConfig {
        field: &'static str,
        reason: &'static str,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    pub fn read(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Read {
            operation,
            path: path.into(),
            source,
        }
    }

    pub fn write(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Write {
            operation,
            path: path.into(),
            source,
        }
    }

    pub fn connect(phase: ConnectPhase, endpoint: impl Into<String>, source: io::Error) -> Self {
        Self::Connect {
            phase,
            endpoint: endpoint.into(),
            source,
        }
    }

    pub fn unsupported(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::Unsupported {
            operation,
            reason: reason.into(),
        }
    }

    /// Path the failing operation was working on, if any.
    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            Self::Read { path, .. } | Self::Write { path, .. } => Some(path),
            _ => None,
        }
    }
}
