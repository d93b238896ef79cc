//! Process seam between a session and the language server it talks to.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};

use crate::error::SessionError;
use crate::types::ServerDescriptor;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub type LaunchFut<'a> = Pin<Box<dyn Future<Output = Result<ServerIo, SessionError>> + Send + 'a>>;

/// Pipes of a freshly launched server.
pub struct ServerIo {
    /// Server stdout, read by the session.
    pub stdout: BoxedReader,
    /// Server stdin, written by the session.
    pub stdin: BoxedWriter,
    /// OS process, when there is one. In-memory servers have none.
    pub child: Option<Child>,
}

pub trait ServerLauncher: Send + Sync {
    fn launch<'a>(&'a self, descriptor: &'a ServerDescriptor) -> LaunchFut<'a>;
}

/// Spawns the configured command as a child process over stdio.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

impl ServerLauncher for ProcessLauncher {
    fn launch<'a>(&'a self, descriptor: &'a ServerDescriptor) -> LaunchFut<'a> {
        Box::pin(async move {
            let resolved = which::which(descriptor.command()).map_err(|_| {
                SessionError::LaunchCommandNotFound {
                    command: descriptor.command().to_string(),
                }
            })?;

            let mut cmd = Command::new(&resolved);
            cmd.args(descriptor.args())
                .current_dir(descriptor.root())
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .kill_on_drop(true);

            let mut child = cmd.spawn().map_err(|source| SessionError::Spawn {
                command: descriptor.command().to_string(),
                source,
            })?;

            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| SessionError::Transport("no stdout from child".into()))?;
            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| SessionError::Transport("no stdin from child".into()))?;

            tracing::info!(
                ecosystem = %descriptor.ecosystem(),
                command = %resolved.display(),
                pid = child.id(),
                "Spawned language server"
            );

            Ok(ServerIo {
                stdout: Box::new(stdout),
                stdin: Box::new(stdin),
                child: Some(child),
            })
        })
    }
}
