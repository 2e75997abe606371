//! Redirect Policy (§4.4): the sidecar never lets the underlying HTTP
//! client auto-follow a redirect, because doing so would silently decide
//! whether to carry the service's credential across a hop whose
//! trustworthiness has not been checked.

use crate::builder::{build_auth_headers, inject_query_param_auth, BuiltRequest};
use keyhole_config::{AuthSpec, ServiceConfig};
use thiserror::Error;
use url::Url;

pub const MAX_REDIRECT_HOPS: u32 = 10;

/// Headers carried across an untrusted hop — everything else, including
/// any re-applied credential, is stripped.
pub const UNTRUSTED_HOP_WHITELIST: &[&str] = &["content-type", "accept", "user-agent"];

const REDIRECT_STATUSES: &[u16] = &[301, 302, 303, 307, 308];

#[derive(Debug, Error)]
pub enum RedirectError {
    #[error("exceeded {0} redirect hops")]
    TooManyHops(u32),
    #[error("invalid redirect location '{0}': {1}")]
    InvalidLocation(String, #[source] url::ParseError),
}

pub fn is_redirect_status(status: u16) -> bool {
    REDIRECT_STATUSES.contains(&status)
}

fn host_is_trusted(host: &str, service: &ServiceConfig) -> bool {
    service.domains.iter().any(|d| d.host() == host)
}

/// Resolve `location` against `current.url` and decide whether the next
/// hop is trusted (same declared domain, string equality only — never
/// `localhost` for `127.0.0.1`) or untrusted.
pub fn next_hop(
    current: &BuiltRequest,
    location: &str,
    service: &ServiceConfig,
    secret: &str,
) -> Result<BuiltRequest, RedirectError> {
    let mut url = current
        .url
        .join(location)
        .map_err(|e| RedirectError::InvalidLocation(location.to_string(), e))?;

    let trusted = url
        .host_str()
        .map(|h| host_is_trusted(h, service))
        .unwrap_or(false);

    let headers = if trusted {
        let mut headers = current.headers.clone();
        for (k, v) in build_auth_headers(&service.auth, secret) {
            set_header(&mut headers, &k, v);
        }
        inject_query_param_auth(&mut url, &service.auth, secret);
        headers
    } else {
        let kept: Vec<(String, String)> = current
            .headers
            .iter()
            .filter(|(k, _)| UNTRUSTED_HOP_WHITELIST.iter().any(|w| w.eq_ignore_ascii_case(k)))
            .cloned()
            .collect();
        if let AuthSpec::QueryParam { param_name, .. } = &service.auth {
            strip_query_param(&mut url, param_name);
        }
        kept
    };

    Ok(BuiltRequest {
        url,
        method: current.method.clone(),
        headers,
        body: current.body.clone(),
    })
}

fn set_header(headers: &mut Vec<(String, String)>, name: &str, value: String) {
    match headers.iter().position(|(k, _)| k.eq_ignore_ascii_case(name)) {
        Some(idx) => headers[idx].1 = value,
        None => headers.push((name.to_string(), value)),
    }
}

fn strip_query_param(url: &mut Url, param_name: &str) {
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != param_name)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(&kept);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyhole_config::DomainEntry;
    use std::collections::BTreeMap;

    fn service(auth: AuthSpec, domain: &str) -> ServiceConfig {
        ServiceConfig {
            domains: vec![DomainEntry::Bare(domain.to_string())],
            auth,
            headers: BTreeMap::new(),
            base_url: Some(format!("https://{domain}")),
            placeholder: "sk-placeholder".to_string(),
            sdk_env: BTreeMap::new(),
            masking: Default::default(),
        }
    }

    fn request(url: &str) -> BuiltRequest {
        BuiltRequest {
            url: Url::parse(url).unwrap(),
            method: "GET".to_string(),
            headers: vec![
                ("Authorization".to_string(), "Bearer sekrit".to_string()),
                ("Content-Type".to_string(), "application/json".to_string()),
                ("User-Agent".to_string(), "agent-keyhole/0.1".to_string()),
            ],
            body: Vec::new(),
        }
    }

    #[test]
    fn trusted_hop_reapplies_auth() {
        let svc = service(AuthSpec::Bearer { secret_ref: "r".to_string() }, "api.example.com");
        let current = request("https://api.example.com/v1/a");
        let next = next_hop(&current, "https://api.example.com/v1/b", &svc, "sekrit").unwrap();
        let auth = next.headers.iter().find(|(k, _)| k == "Authorization").unwrap();
        assert_eq!(auth.1, "Bearer sekrit");
    }

    #[test]
    fn untrusted_hop_strips_authorization() {
        let svc = service(AuthSpec::Bearer { secret_ref: "r".to_string() }, "api.example.com");
        let current = request("https://api.example.com/v1/a");
        let next = next_hop(&current, "https://evil.example.org/steal", &svc, "sekrit").unwrap();
        assert!(!next.headers.iter().any(|(k, _)| k == "Authorization"));
        assert!(next.headers.iter().any(|(k, _)| k == "Content-Type"));
    }

    #[test]
    fn localhost_is_not_equal_to_loopback_ip() {
        let svc = service(AuthSpec::Bearer { secret_ref: "r".to_string() }, "localhost");
        let current = request("http://localhost/v1/a");
        let next = next_hop(&current, "http://127.0.0.1/v1/b", &svc, "sekrit").unwrap();
        assert!(!next.headers.iter().any(|(k, _)| k == "Authorization"));
    }

    #[test]
    fn untrusted_hop_strips_query_param_auth() {
        let svc = service(
            AuthSpec::QueryParam { secret_ref: "r".to_string(), param_name: "api_key".to_string() },
            "api.example.com",
        );
        let mut current = request("https://api.example.com/v1/a?api_key=sekrit");
        current.headers.retain(|(k, _)| k != "Authorization");
        let next = next_hop(&current, "https://evil.example.org/steal", &svc, "sekrit").unwrap();
        assert!(!next.url.query_pairs().any(|(k, _)| k == "api_key"));
    }
}
