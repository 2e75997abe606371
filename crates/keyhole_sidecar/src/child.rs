//! The sidecar binary's own half of the bootstrap handshake (§4.8): read
//! one `Bootstrap` message from stdin, optionally unlock the vault right
//! away, bind the IPC socket, and report back over stdout. From there it
//! just answers `unlock`/`shutdown` control messages until told to stop.

use crate::bootstrap::{read_message, write_message, BootState, ChildMessage, ParentMessage};
use crate::handler::{BuildRuntimeError, SidecarHandler, SidecarRuntime, SwappableHandler};
use crate::state::Phase;
use keyhole_audit::{AuditError, AuditLogger};
use keyhole_config::Config;
use keyhole_ipc::{generate_socket_path, SidecarState as WireState};
use keyhole_vault::{SecretStore, StoreError, Vault};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use thiserror::Error;
use tokio::io::{stdin, stdout, BufReader};

#[derive(Debug, Error)]
pub enum ChildError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parent closed the bootstrap channel before sending Bootstrap")]
    NoBootstrap,
    #[error("parent sent an unexpected message before Bootstrap")]
    UnexpectedFirstMessage,
    #[error("vault error: {0}")]
    Vault(#[from] StoreError),
    #[error("ipc server error: {0}")]
    Server(#[from] keyhole_ipc::ServerError),
    #[error("runtime build error: {0}")]
    Runtime(#[from] BuildRuntimeError),
    #[error("audit logger error: {0}")]
    Audit(#[from] AuditError),
}

fn phase_to_boot_state(phase: Phase) -> BootState {
    match phase {
        Phase::Ready => BootState::Ready,
        _ => BootState::PendingUnlock,
    }
}

async fn unlock_and_install(
    config: &Config,
    vault_path: Option<&Path>,
    passphrase: &str,
    audit: Arc<AuditLogger>,
    handler: &SwappableHandler,
) -> Result<(), ChildError> {
    let vault_path = vault_path
        .ok_or_else(|| ChildError::Vault(StoreError::Malformed("no vault_path configured".to_string())))?;
    let vault = Vault::unlock(vault_path, passphrase)?;
    let secrets = vault.resolve_all()?;
    let runtime = SidecarRuntime::build(config, secrets)?;
    handler.install(SidecarHandler::new(runtime, audit)).await;
    Ok(())
}

/// Run the child side of the bootstrap handshake to completion: blocks
/// until the parent sends `shutdown`, the IPC server task dies, or the
/// bootstrap pipe closes.
pub async fn run() -> Result<(), ChildError> {
    let mut reader = BufReader::new(stdin());
    let mut writer = stdout();

    let first = read_message::<_, ParentMessage>(&mut reader).await?;
    let (ott, config, vault_passphrase) = match first {
        Some(ParentMessage::Bootstrap { ott, config, vault_passphrase, .. }) => (ott, config, vault_passphrase),
        Some(_) => return Err(ChildError::UnexpectedFirstMessage),
        None => return Err(ChildError::NoBootstrap),
    };

    let audit = Arc::new(AuditLogger::from_config(config.logging.as_ref())?);
    let socket_dir = config
        .socket_dir
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    let socket_path = generate_socket_path(&socket_dir);
    let vault_path = config.vault_path.clone().map(PathBuf::from);

    let handler = Arc::new(SwappableHandler::empty());

    let mut phase = if let Some(passphrase) = &vault_passphrase {
        unlock_and_install(&config, vault_path.as_deref(), passphrase, audit.clone(), &handler).await?;
        Phase::Ready
    } else {
        Phase::PendingUnlock
    };

    let wire_state = Arc::new(StdMutex::new(
        phase.as_wire_state().unwrap_or(WireState::PendingUnlock),
    ));

    let server = keyhole_ipc::Server::bind(
        &socket_path,
        ott,
        config.agents.clone(),
        handler.clone(),
        wire_state.clone(),
        audit.clone(),
    )?;

    write_message(
        &mut writer,
        &ChildMessage::Ready {
            socket_path: socket_path.display().to_string(),
            state: phase_to_boot_state(phase),
        },
    )
    .await?;

    let serve_task = tokio::spawn(server.serve());

    loop {
        match read_message::<_, ParentMessage>(&mut reader).await {
            Ok(Some(ParentMessage::Unlock { passphrase })) => {
                if phase.can_unlock() {
                    match unlock_and_install(&config, vault_path.as_deref(), &passphrase, audit.clone(), &handler).await {
                        Ok(()) => {
                            phase = Phase::Ready;
                            *wire_state.lock().unwrap_or_else(|p| p.into_inner()) = WireState::Ready;
                            write_message(&mut writer, &ChildMessage::Unlocked { state: BootState::Ready }).await?;
                        }
                        Err(e) => {
                            write_message(&mut writer, &ChildMessage::Error { message: e.to_string() }).await?;
                        }
                    }
                } else {
                    write_message(
                        &mut writer,
                        &ChildMessage::Error { message: "sidecar is not pending unlock".to_string() },
                    )
                    .await?;
                }
            }
            Ok(Some(ParentMessage::Shutdown)) | Ok(None) => {
                phase = Phase::ShuttingDown;
                break;
            }
            Ok(Some(ParentMessage::Bootstrap { .. })) => {
                // Already bootstrapped; the parent only ever sends this once.
            }
            Err(e) => return Err(e.into()),
        }
    }

    serve_task.abort();
    let _ = std::fs::remove_file(&socket_path);
    Ok(())
}
