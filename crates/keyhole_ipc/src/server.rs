//! The sidecar side of the channel (§4.6): binds the socket, authenticates
//! every frame, enforces the agent ACL (§4.7), and hands authenticated
//! requests off to a [`RequestHandler`].

use crate::framing::{read_frame, write_frame, FramingError};
use crate::wire::{health_response, IpcRequest, IpcResponse, SidecarState};
use async_trait::async_trait;
use keyhole_audit::{AuditLogger, RequestContext};
use keyhole_common::constant_time_eq;
use std::collections::{BTreeMap, BTreeSet};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use thiserror::Error;
use tokio::io::WriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex as AsyncMutex;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("socket at {0} is already live")]
    SocketLive(PathBuf),
}

/// What the sidecar does with an authenticated, ACL-cleared request.
/// Implemented by `keyhole_sidecar`, which wires in the Request Builder,
/// outbound client, and Response Masker.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, req: IpcRequest) -> IpcResponse;
}

/// If `path` exists, probe it with a connect: a live peer means another
/// sidecar owns it, a dead one means it's a stale node from an unclean
/// exit (§4.6 startup).
fn prepare_socket_path(path: &Path) -> Result<(), ServerError> {
    if !path.exists() {
        return Ok(());
    }
    match std::os::unix::net::UnixStream::connect(path) {
        Ok(_) => Err(ServerError::SocketLive(path.to_path_buf())),
        Err(_) => {
            std::fs::remove_file(path)?;
            Ok(())
        }
    }
}

fn set_owner_only(path: &Path) -> std::io::Result<()> {
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

pub struct Server<H: RequestHandler + 'static> {
    listener: UnixListener,
    ott: String,
    acl: BTreeMap<String, BTreeSet<String>>,
    handler: Arc<H>,
    state: Arc<Mutex<SidecarState>>,
    started_at: Instant,
    audit: Arc<AuditLogger>,
}

impl<H: RequestHandler + 'static> Server<H> {
    pub fn bind(
        socket_path: &Path,
        ott: String,
        acl: BTreeMap<String, BTreeSet<String>>,
        handler: Arc<H>,
        state: Arc<Mutex<SidecarState>>,
        audit: Arc<AuditLogger>,
    ) -> Result<Self, ServerError> {
        prepare_socket_path(socket_path)?;
        let listener = UnixListener::bind(socket_path)?;
        set_owner_only(socket_path)?;
        Ok(Self {
            listener,
            ott,
            acl,
            handler,
            state,
            started_at: Instant::now(),
            audit,
        })
    }

    /// Accept connections forever, each handled by its own task reading
    /// frames in a loop (§5: per-connection loop, no head-of-line blocking
    /// across connections or across request ids on the same connection).
    pub async fn serve(self) -> Result<(), ServerError> {
        loop {
            let (stream, _) = self.listener.accept().await?;
            let ott = self.ott.clone();
            let acl = self.acl.clone();
            let handler = self.handler.clone();
            let state = self.state.clone();
            let audit = self.audit.clone();
            let started_at = self.started_at;
            tokio::spawn(async move {
                handle_connection(stream, ott, acl, handler, state, started_at, audit).await;
            });
        }
    }
}

/// One connection's read loop decodes frames strictly in arrival order (so
/// framing never desyncs) but hands each authenticated request off to its
/// own task (§5: "each upstream fetch proceeds independently; responses
/// are written in completion order — no head-of-line blocking by id"). A
/// slow upstream call for request A must not delay the response to a fast
/// request B that arrived after it on the same socket; only the shared
/// writer needs serializing, since frames must still not interleave on
/// the wire.
async fn handle_connection<H: RequestHandler + 'static>(
    stream: UnixStream,
    ott: String,
    acl: BTreeMap<String, BTreeSet<String>>,
    handler: Arc<H>,
    state: Arc<Mutex<SidecarState>>,
    started_at: Instant,
    audit: Arc<AuditLogger>,
) {
    let (mut read_half, write_half) = tokio::io::split(stream);
    let writer: Arc<AsyncMutex<WriteHalf<UnixStream>>> = Arc::new(AsyncMutex::new(write_half));
    let mut in_flight = Vec::new();

    loop {
        let frame = match read_frame(&mut read_half).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => break,
            Err(FramingError::Oversize(_)) => break,
            Err(FramingError::Io(_)) => break,
        };

        let req: IpcRequest = match serde_json::from_slice(&frame) {
            Ok(req) => req,
            Err(e) => {
                let mut ctx = RequestContext::new();
                ctx.error = Some(e.to_string());
                audit.warn("request.malformed", &ctx);
                continue;
            }
        };

        let ott = ott.clone();
        let acl = acl.clone();
        let handler = handler.clone();
        let state = state.clone();
        let audit = audit.clone();
        let writer = writer.clone();
        in_flight.push(tokio::spawn(async move {
            let resp = dispatch(req, &ott, &acl, &handler, &state, started_at, &audit).await;
            let Ok(payload) = serde_json::to_vec(&resp) else { return };
            let mut w = writer.lock().await;
            let _ = write_frame(&mut *w, &payload).await;
        }));
        in_flight.retain(|h| !h.is_finished());
    }

    for h in in_flight {
        let _ = h.await;
    }
}

async fn dispatch<H: RequestHandler + 'static>(
    req: IpcRequest,
    ott: &str,
    acl: &BTreeMap<String, BTreeSet<String>>,
    handler: &Arc<H>,
    state: &Arc<Mutex<SidecarState>>,
    started_at: Instant,
    audit: &Arc<AuditLogger>,
) -> IpcResponse {
    if req.is_health_check() {
        let st = *state.lock().unwrap_or_else(|p| p.into_inner());
        return health_response(&req.id, st, started_at.elapsed().as_secs());
    }

    let current_state = *state.lock().unwrap_or_else(|p| p.into_inner());
    if current_state == SidecarState::PendingUnlock {
        return IpcResponse::error(req.id, 503, "sidecar is pending vault unlock");
    }

    if !constant_time_eq(req.ott.as_bytes(), ott.as_bytes()) {
        let mut ctx = RequestContext::new();
        ctx.service = Some(req.service.clone());
        ctx.agent = req.agent.clone();
        audit.warn("auth.invalid_token", &ctx);
        return IpcResponse::error(req.id, 403, "Invalid authentication token");
    }

    if let Some(agent) = &req.agent {
        if !acl.is_empty() {
            let allowed = acl.get(agent);
            let permitted = allowed.map(|s| s.contains(&req.service)).unwrap_or(false);
            if !permitted {
                let mut ctx = RequestContext::new();
                ctx.service = Some(req.service.clone());
                ctx.agent = Some(agent.clone());
                audit.warn("auth.forbidden_service", &ctx);
                return IpcResponse::error(req.id, 403, "Agent is not authorized for this service");
            }
        }
    }

    handler.handle(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::BodyEncoding;
    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct EchoHandler;

    #[async_trait]
    impl RequestHandler for EchoHandler {
        async fn handle(&self, req: IpcRequest) -> IpcResponse {
            IpcResponse {
                id: req.id,
                status: 200,
                headers: Default::default(),
                body: Some("ok".to_string()),
                body_encoding: BodyEncoding::Text,
                error: None,
                redacted: None,
            }
        }
    }

    async fn send_and_recv(stream: &mut UnixStream, req: &IpcRequest) -> IpcResponse {
        let payload = serde_json::to_vec(req).unwrap();
        write_frame(stream, &payload).await.unwrap();
        let resp_bytes = read_frame(stream).await.unwrap().unwrap();
        serde_json::from_slice(&resp_bytes).unwrap()
    }

    fn req(id: &str, ott: &str, service: &str, agent: Option<&str>) -> IpcRequest {
        IpcRequest {
            id: id.to_string(),
            ott: ott.to_string(),
            agent: agent.map(|s| s.to_string()),
            service: service.to_string(),
            method: "GET".to_string(),
            path: "/".to_string(),
            headers: Default::default(),
            body: None,
            body_encoding: BodyEncoding::Text,
        }
    }

    #[tokio::test]
    async fn rejects_invalid_token() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sock");
        let audit = Arc::new(AuditLogger::from_config(None).unwrap());
        let server = Server::bind(
            &path,
            "correct-token".to_string(),
            BTreeMap::new(),
            Arc::new(EchoHandler),
            Arc::new(Mutex::new(SidecarState::Ready)),
            audit,
        )
        .unwrap();
        tokio::spawn(server.serve());

        let mut client = UnixStream::connect(&path).await.unwrap();
        let resp = send_and_recv(&mut client, &req("1", "wrong-token", "github", None)).await;
        assert_eq!(resp.status, 403);
    }

    #[tokio::test]
    async fn enforces_agent_acl() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sock");
        let audit = Arc::new(AuditLogger::from_config(None).unwrap());
        let mut acl = BTreeMap::new();
        acl.insert("agent-a".to_string(), BTreeSet::from(["github".to_string()]));
        let server = Server::bind(
            &path,
            "tok".to_string(),
            acl,
            Arc::new(EchoHandler),
            Arc::new(Mutex::new(SidecarState::Ready)),
            audit,
        )
        .unwrap();
        tokio::spawn(server.serve());

        let mut client = UnixStream::connect(&path).await.unwrap();
        let resp = send_and_recv(&mut client, &req("1", "tok", "stripe", Some("agent-a"))).await;
        assert_eq!(resp.status, 403);

        let resp = send_and_recv(&mut client, &req("2", "tok", "github", Some("agent-a"))).await;
        assert_eq!(resp.status, 200);
    }

    #[tokio::test]
    async fn health_check_bypasses_auth_and_reflects_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sock");
        let audit = Arc::new(AuditLogger::from_config(None).unwrap());
        let server = Server::bind(
            &path,
            "tok".to_string(),
            BTreeMap::new(),
            Arc::new(EchoHandler),
            Arc::new(Mutex::new(SidecarState::PendingUnlock)),
            audit,
        )
        .unwrap();
        tokio::spawn(server.serve());

        let mut client = UnixStream::connect(&path).await.unwrap();
        let resp = send_and_recv(&mut client, &req("1", "garbage-token", "__health__", None)).await;
        assert_eq!(resp.status, 503);
    }

    #[tokio::test]
    async fn oversize_frame_destroys_connection_without_response() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sock");
        let audit = Arc::new(AuditLogger::from_config(None).unwrap());
        let server = Server::bind(
            &path,
            "tok".to_string(),
            BTreeMap::new(),
            Arc::new(EchoHandler),
            Arc::new(Mutex::new(SidecarState::Ready)),
            audit,
        )
        .unwrap();
        tokio::spawn(server.serve());

        let mut client = UnixStream::connect(&path).await.unwrap();
        let len = ((crate::framing::MAX_FRAME_SIZE + 1) as u32).to_be_bytes();
        client.write_all(&len).await.unwrap();

        let mut probe = [0u8; 1];
        let n = client.read(&mut probe).await.unwrap_or(0);
        assert_eq!(n, 0);
    }
}
