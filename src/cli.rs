use std::env;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use xftp::filesystem::FileSystem;
use xftp::model::{ConnectionConfig, Entry, TransferKind, TransferProgress, format_size};
use xftp::remote::SftpBackend;
use xftp::transfer::TransferEngine;

#[derive(Debug, Parser)]
#[command(
    name = "xftp",
    version,
    about = "Copy and move files between the local disk and an SFTP server"
)]
pub struct Cli {
    /// SFTP server; when set, listing and directory commands act on the server.
    #[arg(long, env = "XFTP_HOST", global = true)]
    pub host: Option<String>,
    #[arg(long, env = "XFTP_PORT", default_value_t = 22, global = true)]
    pub port: u16,
    #[arg(long, env = "XFTP_USER", global = true)]
    pub user: Option<String>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List a directory.
    Ls { path: Option<PathBuf> },
    /// Create a directory and its parents.
    Mkdir { path: PathBuf },
    /// Delete a file or directory tree.
    Rm { path: PathBuf },
    /// Copy a local entry into a directory (uploads when --host is set).
    Cp {
        source: PathBuf,
        destination_dir: PathBuf,
    },
    /// Move a local entry into a local directory.
    Mv {
        source: PathBuf,
        destination_dir: PathBuf,
    },
    /// Upload a local entry into a remote directory.
    Put { local: PathBuf, remote_dir: PathBuf },
    /// Download a remote entry into a local directory.
    Get { remote: PathBuf, local_dir: PathBuf },
}

const PASSWORD_ENV: &str = "XFTP_PASSWORD";

pub fn run(cli: Cli) -> Result<()> {
    let mut panel = FileSystem::new(env::current_dir().unwrap_or_default());
    if let Some(config) = connection_config(&cli)? {
        let backend = SftpBackend::open(&config)
            .with_context(|| format!("connecting to {}", config.endpoint()))?;
        panel.set_remote(Box::new(backend))?;
        panel.set_current_path("/");
    }

    let outcome = run_command(&cli.command, &mut panel);

    if let Err(err) = panel.clear_remote() {
        warn!("failed to close remote session: {err}");
    }
    outcome
}

fn run_command(command: &Command, panel: &mut FileSystem) -> Result<()> {
    match command {
        Command::Ls { path } => {
            let path = path.clone().unwrap_or_else(|| panel.current_path().to_path_buf());
            let entries = panel
                .list_files(&path)
                .with_context(|| format!("listing {}", path.display()))?;
            let mut stdout = io::stdout().lock();
            for entry in &entries {
                writeln!(stdout, "{}", render_entry(entry))?;
            }
        }
        Command::Mkdir { path } => {
            panel
                .create_directory(path)
                .with_context(|| format!("creating {}", path.display()))?;
        }
        Command::Rm { path } => {
            panel
                .delete_file(path)
                .with_context(|| format!("deleting {}", path.display()))?;
        }
        Command::Cp {
            source,
            destination_dir,
        } => send(panel, source, destination_dir, TransferKind::Copy)?,
        Command::Mv {
            source,
            destination_dir,
        } => send(panel, source, destination_dir, TransferKind::Move)?,
        Command::Put { local, remote_dir } => {
            if !panel.is_remote() {
                bail!("put needs --host (or XFTP_HOST)");
            }
            send(panel, local, remote_dir, TransferKind::Copy)?;
        }
        Command::Get { remote, local_dir } => {
            if !panel.is_remote() {
                bail!("get needs --host (or XFTP_HOST)");
            }
            let destination = FileSystem::new(local_dir.clone());
            transfer(panel, remote, &destination, TransferKind::Copy)?;
        }
    }
    Ok(())
}

/// Sends a local entry into `destination_dir` on the panel's active store.
fn send(
    panel: &mut FileSystem,
    source: &Path,
    destination_dir: &Path,
    kind: TransferKind,
) -> Result<()> {
    let source_dir = source.parent().map(Path::to_path_buf).unwrap_or_default();
    let source_panel = FileSystem::new(source_dir);
    if panel.is_remote() {
        panel.set_current_path(destination_dir.to_path_buf());
        transfer(&source_panel, source, panel, kind)
    } else {
        let destination = FileSystem::new(destination_dir.to_path_buf());
        transfer(&source_panel, source, &destination, kind)
    }
}

fn transfer(
    source_panel: &FileSystem,
    source: &Path,
    destination_panel: &FileSystem,
    kind: TransferKind,
) -> Result<()> {
    let mut printer = ProgressPrinter::default();
    let target = {
        let mut engine = TransferEngine::new(|progress| printer.draw(progress));
        engine
            .transfer_between(source_panel, source, destination_panel, kind)
            .with_context(|| format!("{kind} {}", source.display()))?
    };

    let entries = destination_panel.refresh().with_context(|| {
        format!("listing {}", destination_panel.current_path().display())
    })?;
    info!(
        target = %target.display(),
        entries = entries.len(),
        "{kind} complete"
    );
    Ok(())
}

#[derive(Default)]
struct ProgressPrinter {
    last_file: String,
}

impl ProgressPrinter {
    fn draw(&mut self, progress: &TransferProgress) {
        let mut stderr = io::stderr().lock();
        if progress.current_file != self.last_file && !self.last_file.is_empty() {
            let _ = writeln!(stderr);
        }
        self.last_file.clone_from(&progress.current_file);
        let _ = write!(
            stderr,
            "\r{} {} {:5.1}% ({} / {})",
            progress.kind,
            progress.current_file,
            progress.percentage,
            format_size(progress.transferred_size),
            format_size(progress.total_size)
        );
        if progress.completed {
            let _ = writeln!(stderr);
            self.last_file.clear();
        }
    }
}

fn render_entry(entry: &Entry) -> String {
    let permissions = entry.permissions.as_deref().unwrap_or("----------");
    let suffix = if entry.is_dir { "/" } else { "" };
    format!(
        "{permissions} {:>10} {} {}{suffix}",
        format_size(entry.size),
        entry.modified_label(),
        entry.name
    )
}

fn connection_config(cli: &Cli) -> Result<Option<ConnectionConfig>> {
    let Some(host) = cli.host.clone() else {
        return Ok(None);
    };
    let username = cli
        .user
        .clone()
        .ok_or_else(|| anyhow!("--user (or XFTP_USER) is required with --host"))?;
    let password = env::var(PASSWORD_ENV)
        .with_context(|| format!("{PASSWORD_ENV} must hold the password for {username}@{host}"))?;

    let config = ConnectionConfig {
        host,
        port: cli.port,
        username,
        password,
    };
    config.validate()?;
    Ok(Some(config))
}

#[cfg(test)]
mod tests {
    use super::{Cli, Command, render_entry};
    use clap::Parser;
    use std::path::PathBuf;
    use xftp::model::Entry;

    #[test]
    fn parses_copy_with_global_connection_flags() {
        let cli = Cli::try_parse_from([
            "xftp", "cp", "--host", "files.example.org", "--user", "deploy", "a.txt", "/srv",
        ])
        .expect("parse");
        assert_eq!(cli.host.as_deref(), Some("files.example.org"));
        assert_eq!(cli.user.as_deref(), Some("deploy"));
        assert!(matches!(
            cli.command,
            Command::Cp { ref source, ref destination_dir }
                if source == &PathBuf::from("a.txt") && destination_dir == &PathBuf::from("/srv")
        ));
    }

    #[test]
    fn rejects_out_of_range_port() {
        assert!(Cli::try_parse_from(["xftp", "--port", "70000", "ls"]).is_err());
    }

    #[test]
    fn renders_directory_with_trailing_slash() {
        let line = render_entry(&Entry {
            name: "docs".to_string(),
            path: PathBuf::from("/srv/docs"),
            size: 4096,
            modified: None,
            is_dir: true,
            permissions: Some("drwxr-xr-x".to_string()),
        });
        assert!(line.starts_with("drwxr-xr-x"));
        assert!(line.ends_with("docs/"));
        assert!(line.contains("4.0 KB"));
    }
}
