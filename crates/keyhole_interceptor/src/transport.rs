//! The agent-side patch surface (§4.9, §9 Design Notes). Rust has no
//! process-wide hook to rebind the standard HTTP client the way a
//! dynamic-language runtime can monkeypatch `fetch`/`http.request`. The
//! idiomatic equivalent named in §9 is "a wrapper transport the agent must
//! opt into": [`InterceptedTransport::install`] returns a handle that owns
//! both the IPC client and the agent's original transport, and every
//! outbound call the agent makes through that handle is routed through
//! [`Resolver::resolve`] first.

use crate::body::FinalizedBody;
use crate::resolver::Resolver;
use crate::response::{ResponseError, SyntheticResponse};
use async_trait::async_trait;
use keyhole_common::to_hex;
use keyhole_config::Config;
use keyhole_ipc::{BodyEncoding, Client, ClientError, IpcRequest};
use rand::RngCore;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// One outbound call as the agent's HTTP/fetch primitive sees it, before
/// host/path resolution decides whether it gets intercepted.
#[derive(Debug, Clone)]
pub struct OutboundCall {
    pub host: String,
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<FinalizedBody>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("ipc error: {0}")]
    Ipc(#[from] ClientError),
    #[error("{0}")]
    Response(#[from] ResponseError),
    #[error("original transport error: {0}")]
    Original(String),
}

/// The agent's real HTTP client, invoked on a resolver miss ("no match →
/// call the original primitive unchanged", §4.9) or after `uninstall()`.
#[async_trait]
pub trait OriginalTransport: Send + Sync {
    async fn call(&self, call: &OutboundCall) -> Result<SyntheticResponse, TransportError>;
}

fn generate_request_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    to_hex(&bytes)
}

fn lowercase_headers(headers: &[(String, String)]) -> BTreeMap<String, String> {
    headers.iter().map(|(k, v)| (k.to_ascii_lowercase(), v.clone())).collect()
}

/// An installed interceptor: a resolver plus the IPC client and the
/// agent's original transport it falls back to. Construct with
/// [`Self::install`]; `uninstall()` flips a flag that routes every
/// subsequent call straight to the original, restoring normal behavior
/// without tearing down the IPC connection.
pub struct InterceptedTransport<O: OriginalTransport> {
    resolver: Resolver,
    client: Arc<Client>,
    ott: String,
    agent: Option<String>,
    original: O,
    installed: AtomicBool,
}

impl<O: OriginalTransport> InterceptedTransport<O> {
    /// Build the resolver from `config` and mark the handle installed.
    /// (§9: "Implement as an explicit install()/uninstall() pair on a
    /// handle that owns the originals".)
    pub fn install(config: &Config, client: Arc<Client>, ott: String, agent: Option<String>, original: O) -> Self {
        Self {
            resolver: Resolver::build(config),
            client,
            ott,
            agent,
            original,
            installed: AtomicBool::new(true),
        }
    }

    /// Restore the original transport for all subsequent calls. Idempotent.
    pub fn uninstall(&self) {
        self.installed.store(false, Ordering::SeqCst);
    }

    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::SeqCst)
    }

    /// Route one outbound call: resolve host+path to a service, and if one
    /// matches (and the handle is still installed) relay it over IPC;
    /// otherwise fall through to the original transport unchanged.
    pub async fn dispatch(&self, call: OutboundCall) -> Result<SyntheticResponse, TransportError> {
        if !self.is_installed() {
            return self.original.call(&call).await;
        }
        let Some(service) = self.resolver.resolve(&call.host, &call.path) else {
            return self.original.call(&call).await;
        };
        let service = service.to_string();

        let (body, body_encoding) = match call.body {
            None => (None, BodyEncoding::Text),
            Some(FinalizedBody::Text(text)) => (Some(text), BodyEncoding::Text),
            Some(FinalizedBody::Binary(bytes)) => {
                (Some(keyhole_common::to_base64(&bytes)), BodyEncoding::Base64)
            }
        };

        let req = IpcRequest {
            id: generate_request_id(),
            ott: self.ott.clone(),
            agent: self.agent.clone(),
            service,
            method: call.method,
            path: call.path,
            headers: lowercase_headers(&call.headers),
            body,
            body_encoding,
        };

        let resp = self.client.send(req).await?;
        Ok(SyntheticResponse::from_ipc(resp)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::ResponseBody;
    use keyhole_config::load_from_str;
    use std::sync::Mutex;

    struct RecordingOriginal {
        calls: Mutex<Vec<OutboundCall>>,
    }

    impl RecordingOriginal {
        fn new() -> Self {
            Self { calls: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl OriginalTransport for RecordingOriginal {
        async fn call(&self, call: &OutboundCall) -> Result<SyntheticResponse, TransportError> {
            self.calls.lock().unwrap().push(call.clone());
            Ok(SyntheticResponse { status: 200, headers: vec![], body: ResponseBody::Text("passthrough".into()) })
        }
    }

    fn config() -> Config {
        load_from_str(
            r#"
services:
  github:
    domains: ["api.github.com"]
    auth: { type: bearer, secret_ref: "GH_TOKEN" }
"#,
        )
        .expect("valid config")
        .config
    }

    #[tokio::test]
    async fn unresolved_host_falls_through_to_original() {
        let cfg = config();
        let client = test_client().await;
        let original = RecordingOriginal::new();
        let handle = InterceptedTransport::install(&cfg, client, "ott".into(), None, original);

        let call = OutboundCall {
            host: "example.com".into(),
            method: "GET".into(),
            path: "/".into(),
            headers: vec![],
            body: None,
        };
        let resp = handle.dispatch(call).await.unwrap();
        assert!(matches!(resp.body, ResponseBody::Text(s) if s == "passthrough"));
        assert_eq!(handle.original.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn uninstalled_handle_always_falls_through() {
        let cfg = config();
        let client = test_client().await;
        let original = RecordingOriginal::new();
        let handle = InterceptedTransport::install(&cfg, client, "ott".into(), None, original);
        handle.uninstall();
        assert!(!handle.is_installed());

        let call = OutboundCall {
            host: "api.github.com".into(),
            method: "GET".into(),
            path: "/repos".into(),
            headers: vec![],
            body: None,
        };
        let resp = handle.dispatch(call).await.unwrap();
        assert!(matches!(resp.body, ResponseBody::Text(s) if s == "passthrough"));
    }

    /// A real but otherwise unused `Client`: the passthrough paths under
    /// test never reach `client.send`, but `Client::connect` still needs a
    /// live listener on the other end to succeed.
    async fn test_client() -> Arc<Client> {
        let dir = tempfile::tempdir().expect("tempdir");
        let socket_path = dir.path().join("keyhole-test.sock");
        let listener = tokio::net::UnixListener::bind(&socket_path).expect("bind test socket");
        tokio::spawn(async move {
            loop {
                let Ok((_stream, _)) = listener.accept().await else { break };
            }
        });
        let client = Client::connect(socket_path, "ott".into()).await.expect("connect");
        // Dropping `dir` only unlinks the path; the already-connected
        // stream's fd stays valid for the rest of the test.
        client
    }
}
