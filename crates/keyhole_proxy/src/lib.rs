//! keyhole_proxy
//!
//! The sidecar's outbound side: the Request Builder (§4.3) that injects
//! real credentials into a relayed agent request, and the Redirect Policy
//! (§4.4) that walks redirect chains by hand instead of letting the HTTP
//! client auto-follow them. Response masking happens one layer up, in
//! `keyhole_mask` — this crate only ever produces the raw upstream
//! response.

pub mod builder;
pub mod redirect;

pub use builder::{build_request, BodyInput, BuildError, BuiltRequest, OutboundRequestSpec};
pub use redirect::{next_hop, RedirectError, MAX_REDIRECT_HOPS};

use keyhole_config::ServiceConfig;
use reqwest::redirect::Policy;
use reqwest::{Client, Method};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Redirect(#[from] RedirectError),
    #[error("invalid http method '{0}'")]
    InvalidMethod(String),
    #[error("upstream request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// One upstream response, pre-masking: status, headers (as received), and
/// the raw body bytes.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Builds the initial request, then resolves at most [`MAX_REDIRECT_HOPS`]
/// redirects itself, applying the Redirect Policy at each hop, and returns
/// the final upstream response.
pub struct OutboundClient {
    http: Client,
}

impl OutboundClient {
    pub fn new() -> Self {
        let http = Client::builder()
            .redirect(Policy::none())
            .build()
            .expect("reqwest client with no redirect-follow must always build");
        Self { http }
    }

    pub async fn dispatch(
        &self,
        service: &ServiceConfig,
        secret: &str,
        req: &OutboundRequestSpec,
    ) -> Result<UpstreamResponse, DispatchError> {
        let resp = self.resolve_redirects(service, secret, req).await?;
        let status = resp.status().as_u16();
        let headers = response_headers(&resp);
        let body = resp.bytes().await?.to_vec();
        Ok(UpstreamResponse { status, headers, body })
    }

    /// Same redirect resolution as [`Self::dispatch`], but returns the
    /// final `reqwest::Response` unconsumed so the caller can stream its
    /// body chunk-by-chunk through a [`keyhole_mask`]-style streaming
    /// masker instead of buffering the whole thing in memory first.
    pub async fn dispatch_stream(
        &self,
        service: &ServiceConfig,
        secret: &str,
        req: &OutboundRequestSpec,
    ) -> Result<reqwest::Response, DispatchError> {
        self.resolve_redirects(service, secret, req).await
    }

    async fn resolve_redirects(
        &self,
        service: &ServiceConfig,
        secret: &str,
        req: &OutboundRequestSpec,
    ) -> Result<reqwest::Response, DispatchError> {
        let mut current = build_request(service, secret, req)?;
        let mut hops = 0u32;

        loop {
            let method = Method::from_str(&current.method)
                .map_err(|_| DispatchError::InvalidMethod(current.method.clone()))?;
            let mut builder = self.http.request(method, current.url.clone());
            for (k, v) in &current.headers {
                builder = builder.header(k, v);
            }
            if !current.body.is_empty() {
                builder = builder.body(current.body.clone());
            }

            let resp = builder.send().await?;
            let status = resp.status().as_u16();

            if redirect::is_redirect_status(status) {
                let location = resp
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.to_string());

                if let Some(location) = location {
                    if hops >= MAX_REDIRECT_HOPS {
                        return Err(RedirectError::TooManyHops(MAX_REDIRECT_HOPS).into());
                    }
                    hops += 1;
                    current = next_hop(&current, &location, service, secret)?;
                    continue;
                }
                // Missing Location: pass the redirect response through as-is.
            }

            return Ok(resp);
        }
    }
}

fn response_headers(resp: &reqwest::Response) -> Vec<(String, String)> {
    resp.headers()
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
        .collect()
}

impl Default for OutboundClient {
    fn default() -> Self {
        Self::new()
    }
}
