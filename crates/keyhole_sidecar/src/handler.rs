//! Wires the Request Builder, outbound HTTP client, and Response Masker
//! together behind one [`RequestHandler`] (§4: "control flow for one
//! request"). Built once at the `pending_unlock → ready` transition from
//! the resolved secret map, then read-only for the sidecar's lifetime
//! (§5) — the only mutation after that point is the one atomic swap that
//! installs a fresh [`SidecarHandler`] behind the shared `ArcSwap`-style
//! handle the IPC server holds.

use async_trait::async_trait;
use futures_util::StreamExt;
use keyhole_audit::{sanitize_path, AuditLogger, RequestContext};
use keyhole_config::{AuthSpec, Config, ResponseMaskingSpec, ServiceConfig, StreamingMode};
use keyhole_ipc::{BodyEncoding, IpcRequest, IpcResponse, RequestHandler};
use keyhole_mask::streaming::StreamingMasker;
use keyhole_mask::{BodyOutcome, Layer, MaskOutcome, ResponseMasker};
use keyhole_proxy::builder::{BodyInput, OutboundRequestSpec};
use keyhole_proxy::{DispatchError, OutboundClient};
use keyhole_registry::SecretRegistry;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildRuntimeError {
    #[error("masker for service '{0}': {1}")]
    Mask(String, #[source] keyhole_mask::MaskError),
    #[error("service '{service}' auth.secret_ref '{secret_ref}' did not resolve to a secret")]
    SecretNotResolved { service: String, secret_ref: String },
}

/// The sidecar's post-unlock, read-only state: per-service configuration,
/// the resolved secrets (keyed by `secret_ref`), the Secret Registry built
/// from them, and one compiled [`ResponseMasker`] per service.
pub struct SidecarRuntime {
    services: BTreeMap<String, ServiceConfig>,
    secrets: BTreeMap<String, String>,
    registry: SecretRegistry,
    maskers: BTreeMap<String, ResponseMasker>,
    outbound: OutboundClient,
}

impl SidecarRuntime {
    pub fn build(config: &Config, secrets: BTreeMap<String, String>) -> Result<Self, BuildRuntimeError> {
        let placeholders: HashSet<String> = config.services.values().map(|s| s.placeholder.clone()).collect();
        let registry = SecretRegistry::build(secrets.values().map(|s| s.as_str()), &placeholders);

        let mut maskers = BTreeMap::new();
        for (name, svc) in &config.services {
            // §4.8: "Secret resolution failure for any configured service is
            // fatal" — checked here, at unlock time, not deferred to the
            // first request that happens to hit this service.
            let secret_ref = svc.auth.secret_ref();
            if !secrets.contains_key(secret_ref) {
                return Err(BuildRuntimeError::SecretNotResolved {
                    service: name.clone(),
                    secret_ref: secret_ref.to_string(),
                });
            }
            let masker = ResponseMasker::new(svc.masking.clone())
                .map_err(|e| BuildRuntimeError::Mask(name.clone(), e))?;
            maskers.insert(name.clone(), masker);
        }

        Ok(Self {
            services: config.services.iter().map(|(n, s)| (n.clone(), s.clone())).collect(),
            secrets,
            registry,
            maskers,
            outbound: OutboundClient::new(),
        })
    }
}

pub struct SidecarHandler {
    runtime: SidecarRuntime,
    audit: Arc<AuditLogger>,
}

impl SidecarHandler {
    pub fn new(runtime: SidecarRuntime, audit: Arc<AuditLogger>) -> Self {
        Self { runtime, audit }
    }
}

fn outbound_spec(req: &IpcRequest) -> OutboundRequestSpec {
    OutboundRequestSpec {
        method: req.method.clone(),
        path: req.path.clone(),
        headers: req.headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        body: req.body.as_ref().map(|b| match req.body_encoding {
            BodyEncoding::Text => BodyInput::Text(b.clone()),
            BodyEncoding::Base64 => BodyInput::Base64(b.clone()),
        }),
    }
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Audit-log paths must never carry a query-param secret (§4.10). Only
/// `QueryParam`-auth services need stripping; everyone else's path is
/// already secret-free.
fn audit_path(service: &ServiceConfig, path: &str) -> String {
    match &service.auth {
        AuthSpec::QueryParam { param_name, .. } => sanitize_path(path, param_name),
        _ => path.to_string(),
    }
}

fn dispatch_status(err: &DispatchError) -> u16 {
    match err {
        DispatchError::Redirect(_) => 502,
        DispatchError::Http(_) => 502,
        DispatchError::Build(_) | DispatchError::InvalidMethod(_) => 502,
    }
}

#[async_trait]
impl RequestHandler for SidecarHandler {
    async fn handle(&self, req: IpcRequest) -> IpcResponse {
        let start = Instant::now();
        let id = req.id.clone();
        let agent = req.agent.clone();

        let Some(service) = self.runtime.services.get(&req.service) else {
            return IpcResponse::error(id, 404, format!("Unknown service '{}'", req.service));
        };

        let Some(secret) = self.runtime.secrets.get(service.auth.secret_ref()) else {
            return IpcResponse::error(id, 502, format!("Secret not resolved for service '{}'", req.service));
        };

        let path = audit_path(service, &req.path);
        let spec = outbound_spec(&req);

        let masker = self
            .runtime
            .maskers
            .get(&req.service)
            .expect("a masker is built for every configured service at runtime construction");

        let result = match service.masking.streaming_mode {
            StreamingMode::Buffer => self.run_buffered(service, secret, &spec, masker).await,
            StreamingMode::Stream => self.run_streaming(service, secret, &spec, masker).await,
        };

        let duration_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok((status, headers, outcome)) => {
                let mut ctx = RequestContext::new();
                ctx.service = Some(req.service.clone());
                ctx.method = Some(req.method.clone());
                ctx.path = Some(path);
                ctx.status = Some(status);
                ctx.duration_ms = Some(duration_ms);
                ctx.redacted = Some(outcome.redacted());
                ctx.layers_fired = Some(outcome.layers_fired.iter().map(layer_name).map(str::to_string).collect());
                if !outcome.heuristic_keys.is_empty() {
                    ctx.heuristic_keys = Some(outcome.heuristic_keys.clone());
                }
                ctx.agent = agent;
                self.audit.info("request.complete", &ctx);

                let redacted = Some(outcome.redacted());
                let header_map: BTreeMap<String, String> = headers.into_iter().collect();
                match outcome.body {
                    BodyOutcome::Text(text) => IpcResponse {
                        id,
                        status,
                        headers: header_map,
                        body: Some(text),
                        body_encoding: BodyEncoding::Text,
                        error: None,
                        redacted,
                    },
                    BodyOutcome::Binary(bytes) => IpcResponse {
                        id,
                        status,
                        headers: header_map,
                        body: Some(keyhole_common::to_base64(&bytes)),
                        body_encoding: BodyEncoding::Base64,
                        error: None,
                        redacted,
                    },
                }
            }
            Err(err) => {
                let status = dispatch_status(&err);
                let mut ctx = RequestContext::new();
                ctx.service = Some(req.service.clone());
                ctx.method = Some(req.method.clone());
                ctx.path = Some(path);
                ctx.status = Some(status);
                ctx.duration_ms = Some(duration_ms);
                ctx.agent = agent;
                ctx.error = Some(err.to_string());
                self.audit.error("request.upstream_error", &ctx);
                IpcResponse::error(id, status, err.to_string())
            }
        }
    }
}

fn layer_name(l: &Layer) -> &'static str {
    match l {
        Layer::L1Headers => "l1_headers",
        Layer::L2KnownSecrets => "l2_known_secrets",
        Layer::L3Heuristic => "l3_heuristic",
        Layer::L4JsonPaths => "l4_json_paths",
        Layer::L4Patterns => "l4_patterns",
    }
}

impl SidecarHandler {
    async fn run_buffered(
        &self,
        service: &ServiceConfig,
        secret: &str,
        spec: &OutboundRequestSpec,
        masker: &ResponseMasker,
    ) -> Result<(u16, Vec<(String, String)>, MaskOutcome), DispatchError> {
        let upstream = self.runtime.outbound.dispatch(service, secret, spec).await?;
        let content_type = header_value(&upstream.headers, "content-type").map(str::to_string);
        let (headers, l1_fired) = masker.scrub_headers(upstream.headers);
        let mut outcome = masker.mask_body(&self.runtime.registry, content_type.as_deref(), &upstream.body);
        if l1_fired {
            outcome.layers_fired.insert(0, Layer::L1Headers);
        }
        Ok((upstream.status, headers, outcome))
    }

    /// Streaming variant (§4.5.1): consume the upstream body as it
    /// arrives, running it through a [`StreamingMasker`] instead of
    /// buffering the whole response before masking. The sidecar's own IPC
    /// wire still carries exactly one response frame per request id (§5
    /// ordering guarantee), so the masked chunks are concatenated into one
    /// body here — the benefit is bounded peak memory and the streaming
    /// masker's cross-chunk-boundary safety property, not a second
    /// wire-level stream.
    async fn run_streaming(
        &self,
        service: &ServiceConfig,
        secret: &str,
        spec: &OutboundRequestSpec,
        masker: &ResponseMasker,
    ) -> Result<(u16, Vec<(String, String)>, MaskOutcome), DispatchError> {
        let resp = self.runtime.outbound.dispatch_stream(service, secret, spec).await?;
        let status = resp.status().as_u16();
        let raw_headers: Vec<(String, String)> = resp
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
            .collect();
        let content_type = header_value(&raw_headers, "content-type").map(str::to_string);
        let (headers, l1_fired) = masker.scrub_headers(raw_headers);

        let mut stream = resp.bytes_stream();
        let mut prefix: Vec<u8> = Vec::new();
        while prefix.len() < 512 {
            match stream.next().await {
                Some(Ok(bytes)) => prefix.extend_from_slice(&bytes),
                Some(Err(e)) => return Err(DispatchError::Http(e)),
                None => break,
            }
        }

        if ResponseMasker::is_binary(content_type.as_deref(), &prefix) {
            let mut body = prefix;
            while let Some(next) = stream.next().await {
                body.extend_from_slice(&next.map_err(DispatchError::Http)?);
            }
            return Ok((
                status,
                headers,
                MaskOutcome { body: BodyOutcome::Binary(body), layers_fired: Vec::new(), heuristic_keys: Vec::new() },
            ));
        }

        let spec_for_masking: &ResponseMaskingSpec = &service.masking;
        let mut streaming = StreamingMasker::new(spec_for_masking, &self.runtime.registry)
            .expect("masking patterns for this service were already validated in SidecarRuntime::build");

        let mut out = streaming.process_chunk(&self.runtime.registry, &prefix);
        loop {
            match stream.next().await {
                Some(Ok(bytes)) => {
                    out.extend(streaming.process_chunk(&self.runtime.registry, &bytes));
                }
                Some(Err(e)) => return Err(DispatchError::Http(e)),
                None => break,
            }
        }

        let mut outcome = streaming.flush(&self.runtime.registry, spec_for_masking);
        let tail = match &outcome.body {
            BodyOutcome::Text(t) => t.as_bytes().to_vec(),
            BodyOutcome::Binary(b) => b.clone(),
        };
        out.extend(tail);
        outcome.body = BodyOutcome::Text(String::from_utf8_lossy(&out).into_owned());
        if l1_fired {
            outcome.layers_fired.insert(0, Layer::L1Headers);
        }

        Ok((status, headers, outcome))
    }
}

/// Holds the post-unlock [`SidecarHandler`] behind an `RwLock`, installed
/// once vault unlock resolves secrets. Before that, every non-health
/// request already gets refused at the `PendingUnlock` state check in
/// `keyhole_ipc::server::dispatch` — this 503 only covers the narrow
/// window between that check and the handler actually being installed.
pub struct SwappableHandler {
    inner: tokio::sync::RwLock<Option<SidecarHandler>>,
}

impl SwappableHandler {
    pub fn empty() -> Self {
        Self { inner: tokio::sync::RwLock::new(None) }
    }

    pub async fn install(&self, handler: SidecarHandler) {
        *self.inner.write().await = Some(handler);
    }
}

#[async_trait]
impl RequestHandler for SwappableHandler {
    async fn handle(&self, req: IpcRequest) -> IpcResponse {
        match self.inner.read().await.as_ref() {
            Some(h) => h.handle(req).await,
            None => IpcResponse::error(req.id, 503, "sidecar is pending vault unlock"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyhole_config::DomainEntry;

    fn service() -> ServiceConfig {
        ServiceConfig {
            domains: vec![DomainEntry::Bare("127.0.0.1".to_string())],
            auth: AuthSpec::Bearer { secret_ref: "github-token".to_string() },
            headers: BTreeMap::new(),
            base_url: Some("http://127.0.0.1:1".to_string()),
            placeholder: "gh_placeholder".to_string(),
            sdk_env: BTreeMap::new(),
            masking: Default::default(),
        }
    }

    #[test]
    fn build_fails_fatally_when_a_configured_secret_never_resolved() {
        let mut services = keyhole_config::ServiceMap::new();
        services.insert("github".to_string(), service());
        let config = Config {
            services,
            agents: BTreeMap::new(),
            logging: None,
            socket_dir: None,
            vault_path: None,
        };
        let err = SidecarRuntime::build(&config, BTreeMap::new()).unwrap_err();
        assert!(matches!(
            err,
            BuildRuntimeError::SecretNotResolved { service, secret_ref }
                if service == "github" && secret_ref == "github-token"
        ));
    }

    #[test]
    fn audit_path_strips_query_param_secret() {
        let mut svc = service();
        svc.auth = AuthSpec::QueryParam { secret_ref: "r".to_string(), param_name: "api_key".to_string() };
        let path = audit_path(&svc, "/v1/things?api_key=sekrit&limit=10");
        assert_eq!(path, "/v1/things?limit=10");
    }

    #[test]
    fn audit_path_passes_through_for_bearer() {
        let svc = service();
        let path = audit_path(&svc, "/v1/things");
        assert_eq!(path, "/v1/things");
    }

    #[tokio::test]
    async fn unknown_service_is_404() {
        let config = Config {
            services: keyhole_config::ServiceMap::new(),
            agents: BTreeMap::new(),
            logging: None,
            socket_dir: None,
            vault_path: None,
        };
        let runtime = SidecarRuntime::build(&config, BTreeMap::new()).unwrap();
        let audit = Arc::new(AuditLogger::from_config(None).unwrap());
        let handler = SidecarHandler::new(runtime, audit);

        let req = IpcRequest {
            id: "1".to_string(),
            ott: "tok".to_string(),
            agent: None,
            service: "nope".to_string(),
            method: "GET".to_string(),
            path: "/".to_string(),
            headers: BTreeMap::new(),
            body: None,
            body_encoding: BodyEncoding::Text,
        };
        let resp = handler.handle(req).await;
        assert_eq!(resp.status, 404);
    }
}
