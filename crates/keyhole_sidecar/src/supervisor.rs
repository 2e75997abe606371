//! Parent-side process supervision (§4.8, §7): spawn the sidecar child
//! process, run the bootstrap handshake over its stdin/stdout, and
//! optionally respawn it after an unexpected exit — rewiring the shared
//! [`keyhole_ipc::Client`] to the new socket and token in place so callers
//! holding it never need to know a restart happened.

use crate::bootstrap::{read_message, write_message, BootState, ChildMessage, ParentMessage};
use keyhole_audit::{AuditLogger, RequestContext};
use keyhole_common::to_hex;
use keyhole_config::Config;
use keyhole_ipc::{Client, ClientError};
use rand::RngCore;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::BufReader;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("ipc client error: {0}")]
    Client(#[from] ClientError),
    #[error("child exited before completing the bootstrap handshake")]
    ChildDied,
    #[error("child reported an error during bootstrap: {0}")]
    ChildError(String),
    #[error("unexpected message from child during bootstrap")]
    UnexpectedMessage,
}

fn generate_ott() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    to_hex(&bytes)
}

struct ChildProcess {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
}

async fn spawn_child(binary: &std::path::Path) -> Result<ChildProcess, SupervisorError> {
    let mut child = Command::new(binary)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()?;
    let stdin = child.stdin.take().expect("spawned with a piped stdin");
    let stdout = child.stdout.take().expect("spawned with a piped stdout");
    Ok(ChildProcess { child, stdin, reader: BufReader::new(stdout) })
}

async fn bootstrap_once(
    proc: &mut ChildProcess,
    config: &Config,
    ott: &str,
    vault_passphrase: Option<String>,
    agent: Option<String>,
) -> Result<PathBuf, SupervisorError> {
    let msg = ParentMessage::Bootstrap {
        ott: ott.to_string(),
        config: config.clone(),
        vault_passphrase,
        agent,
    };
    write_message(&mut proc.stdin, &msg).await?;

    match read_message::<_, ChildMessage>(&mut proc.reader).await? {
        Some(ChildMessage::Ready { socket_path, .. }) => Ok(PathBuf::from(socket_path)),
        Some(ChildMessage::Error { message }) => Err(SupervisorError::ChildError(message)),
        Some(_) => Err(SupervisorError::UnexpectedMessage),
        None => Err(SupervisorError::ChildDied),
    }
}

/// A supervised sidecar child process plus the IPC client wired to its
/// socket. One `Supervisor` per agent process launch.
pub struct Supervisor {
    binary: PathBuf,
    config: Config,
    proc: Mutex<ChildProcess>,
    client: Arc<Client>,
}

impl Supervisor {
    /// Spawn the child, run the bootstrap handshake, and connect the IPC
    /// client to the socket it reports. `vault_passphrase` lets the parent
    /// unlock the vault immediately at boot instead of leaving the sidecar
    /// `pending_unlock` (§4.8).
    pub async fn spawn(
        binary: PathBuf,
        config: Config,
        vault_passphrase: Option<String>,
        agent: Option<String>,
    ) -> Result<Self, SupervisorError> {
        let ott = generate_ott();
        let mut proc = spawn_child(&binary).await?;
        let socket_path = bootstrap_once(&mut proc, &config, &ott, vault_passphrase, agent).await?;
        let client = Client::connect(socket_path, ott).await?;

        Ok(Self { binary, config, proc: Mutex::new(proc), client })
    }

    pub fn client(&self) -> Arc<Client> {
        self.client.clone()
    }

    /// Forward the vault passphrase once the operator supplies it out of
    /// band, for a sidecar that was started without one.
    pub async fn unlock(&self, passphrase: String) -> Result<(), SupervisorError> {
        let mut proc = self.proc.lock().await;
        write_message(&mut proc.stdin, &ParentMessage::Unlock { passphrase }).await?;
        match read_message::<_, ChildMessage>(&mut proc.reader).await? {
            Some(ChildMessage::Unlocked { state: BootState::Ready }) => Ok(()),
            Some(ChildMessage::Unlocked { .. }) => Ok(()),
            Some(ChildMessage::Error { message }) => Err(SupervisorError::ChildError(message)),
            Some(_) => Err(SupervisorError::UnexpectedMessage),
            None => Err(SupervisorError::ChildDied),
        }
    }

    /// True once the child process has exited on its own — a non-blocking
    /// poll, safe to call from a supervising loop between requests.
    pub async fn has_exited(&self) -> bool {
        let mut proc = self.proc.lock().await;
        matches!(proc.child.try_wait(), Ok(Some(_)))
    }

    /// Respawn the child after an unexpected exit (§7's "optional
    /// auto-restart") and rewire `client()`'s connection to the fresh
    /// socket and token. A respawned sidecar always comes back
    /// `pending_unlock`: the parent does not retain the vault passphrase in
    /// memory after the initial unlock, so whoever drives the supervisor
    /// must call [`Self::unlock`] again afterward if secrets are needed.
    pub async fn restart(&self, audit: &AuditLogger) -> Result<(), SupervisorError> {
        let new_ott = generate_ott();
        let mut new_proc = spawn_child(&self.binary).await?;
        let socket_path = bootstrap_once(&mut new_proc, &self.config, &new_ott, None, None).await?;

        self.client.update_connection(socket_path, new_ott).await?;
        *self.proc.lock().await = new_proc;

        audit.warn("sidecar.restarted", &RequestContext::new());
        Ok(())
    }

    /// Ask the child to shut down cleanly and wait for it to exit.
    pub async fn shutdown(&self) -> Result<(), SupervisorError> {
        let mut proc = self.proc.lock().await;
        write_message(&mut proc.stdin, &ParentMessage::Shutdown).await?;
        let _ = proc.child.wait().await;
        Ok(())
    }
}
