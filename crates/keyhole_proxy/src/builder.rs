//! Request Builder (§4.3): turns one relayed agent request into a
//! concrete outbound HTTP request, injecting the service's real
//! credential and stripping everything the agent wasn't supposed to send
//! in the first place.

use keyhole_config::{AuthSpec, ServiceConfig};
use thiserror::Error;
use url::Url;

pub const USER_AGENT_VALUE: &str = "agent-keyhole/0.1";

/// The only agent-supplied headers ever forwarded upstream (§4.3 step 6).
/// Everything else — most importantly any agent-supplied `Authorization`
/// — is dropped on the floor.
pub const AGENT_HEADER_WHITELIST: &[&str] = &["content-type", "accept"];

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("invalid base url for service: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

#[derive(Debug, Clone)]
pub enum BodyInput {
    Text(String),
    Base64(String),
}

/// The relayed pieces of an agent request relevant to building an
/// outbound one. Deliberately independent of the IPC wire type so this
/// crate doesn't need to depend on it.
#[derive(Debug, Clone)]
pub struct OutboundRequestSpec {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<BodyInput>,
}

#[derive(Debug, Clone)]
pub struct BuiltRequest {
    pub url: Url,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

fn header_index(headers: &[(String, String)], name: &str) -> Option<usize> {
    headers.iter().position(|(k, _)| k.eq_ignore_ascii_case(name))
}

fn set_header(headers: &mut Vec<(String, String)>, name: &str, value: String) {
    match header_index(headers, name) {
        Some(idx) => headers[idx].1 = value,
        None => headers.push((name.to_string(), value)),
    }
}

/// Decode the body according to the agent's declared encoding (§4.3 step 7).
fn decode_body(body: &Option<BodyInput>) -> Vec<u8> {
    match body {
        None => Vec::new(),
        Some(BodyInput::Text(s)) => s.clone().into_bytes(),
        Some(BodyInput::Base64(b64)) => keyhole_common::from_base64(b64).unwrap_or_default(),
    }
}

/// `build_auth_headers(service)` (§4.3): the headers a trusted hop
/// re-applies verbatim, independent of any agent-supplied header.
pub fn build_auth_headers(auth: &AuthSpec, secret: &str) -> Vec<(String, String)> {
    match auth {
        AuthSpec::Bearer { .. } => vec![("Authorization".to_string(), format!("Bearer {secret}"))],
        AuthSpec::Basic { username, .. } => {
            let basic = match username {
                Some(user) => format!("{user}:{secret}"),
                None => format!("{secret}:"),
            };
            let encoded = keyhole_common::to_base64(basic.as_bytes());
            vec![("Authorization".to_string(), format!("Basic {encoded}"))]
        }
        AuthSpec::CustomHeader { header_name, .. } => vec![(header_name.clone(), secret.to_string())],
        AuthSpec::QueryParam { .. } => Vec::new(),
    }
}

/// `inject_query_param_auth(url, service)` (§4.3): set/overwrite the
/// service's query-param credential on `url` in place. A no-op for any
/// other auth kind.
pub fn inject_query_param_auth(url: &mut Url, auth: &AuthSpec, secret: &str) {
    if let AuthSpec::QueryParam { param_name, .. } = auth {
        let mut pairs: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| k != param_name)
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        pairs.push((param_name.clone(), secret.to_string()));
        url.query_pairs_mut().clear().extend_pairs(&pairs);
    }
}

/// Build the outbound request for one relayed agent call.
pub fn build_request(
    service: &ServiceConfig,
    secret: &str,
    req: &OutboundRequestSpec,
) -> Result<BuiltRequest, BuildError> {
    let base = service.resolved_base_url();
    let mut url = Url::parse(&format!("{}{}", base.trim_end_matches('/'), req.path))?;

    let mut headers = build_auth_headers(&service.auth, secret);
    inject_query_param_auth(&mut url, &service.auth, secret);

    for (k, v) in &service.headers {
        set_header(&mut headers, k, v.clone());
    }
    set_header(&mut headers, "User-Agent", USER_AGENT_VALUE.to_string());

    for (k, v) in &req.headers {
        if AGENT_HEADER_WHITELIST.iter().any(|w| w.eq_ignore_ascii_case(k)) {
            set_header(&mut headers, k, v.clone());
        }
    }

    Ok(BuiltRequest {
        url,
        method: req.method.clone(),
        headers,
        body: decode_body(&req.body),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyhole_config::DomainEntry;
    use std::collections::BTreeMap;

    fn service(auth: AuthSpec) -> ServiceConfig {
        ServiceConfig {
            domains: vec![DomainEntry::Bare("api.example.com".to_string())],
            auth,
            headers: BTreeMap::new(),
            base_url: Some("https://api.example.com".to_string()),
            placeholder: "sk-placeholder".to_string(),
            sdk_env: BTreeMap::new(),
            masking: Default::default(),
        }
    }

    fn req() -> OutboundRequestSpec {
        OutboundRequestSpec {
            method: "GET".to_string(),
            path: "/v1/things".to_string(),
            headers: vec![
                ("Authorization".to_string(), "Bearer agent-supplied".to_string()),
                ("Content-Type".to_string(), "application/json".to_string()),
            ],
            body: None,
        }
    }

    #[test]
    fn bearer_auth_header_is_exact() {
        let svc = service(AuthSpec::Bearer { secret_ref: "r".to_string() });
        let built = build_request(&svc, "sekrit", &req()).unwrap();
        let auth = built.headers.iter().find(|(k, _)| k == "Authorization").unwrap();
        assert_eq!(auth.1, "Bearer sekrit");
    }

    #[test]
    fn basic_auth_without_username() {
        let svc = service(AuthSpec::Basic { secret_ref: "r".to_string(), username: None });
        let built = build_request(&svc, "sekrit", &req()).unwrap();
        let auth = built.headers.iter().find(|(k, _)| k == "Authorization").unwrap();
        assert_eq!(auth.1, format!("Basic {}", keyhole_common::to_base64(b"sekrit:")));
    }

    #[test]
    fn basic_auth_with_username() {
        let svc = service(AuthSpec::Basic {
            secret_ref: "r".to_string(),
            username: Some("alice".to_string()),
        });
        let built = build_request(&svc, "sekrit", &req()).unwrap();
        let auth = built.headers.iter().find(|(k, _)| k == "Authorization").unwrap();
        assert_eq!(auth.1, format!("Basic {}", keyhole_common::to_base64(b"alice:sekrit")));
    }

    #[test]
    fn query_param_auth_is_injected_into_url() {
        let svc = service(AuthSpec::QueryParam {
            secret_ref: "r".to_string(),
            param_name: "api_key".to_string(),
        });
        let built = build_request(&svc, "sekrit", &req()).unwrap();
        assert!(built.url.query().unwrap().contains("api_key=sekrit"));
    }

    #[test]
    fn agent_supplied_authorization_header_is_dropped() {
        let svc = service(AuthSpec::Bearer { secret_ref: "r".to_string() });
        let built = build_request(&svc, "sekrit", &req()).unwrap();
        let auths: Vec<_> = built.headers.iter().filter(|(k, _)| k == "Authorization").collect();
        assert_eq!(auths.len(), 1);
        assert_eq!(auths[0].1, "Bearer sekrit");
    }

    #[test]
    fn agent_content_type_passes_through() {
        let svc = service(AuthSpec::Bearer { secret_ref: "r".to_string() });
        let built = build_request(&svc, "sekrit", &req()).unwrap();
        let ct = built.headers.iter().find(|(k, _)| k == "Content-Type").unwrap();
        assert_eq!(ct.1, "application/json");
    }

    #[test]
    fn user_agent_is_always_forced() {
        let svc = service(AuthSpec::Bearer { secret_ref: "r".to_string() });
        let built = build_request(&svc, "sekrit", &req()).unwrap();
        let ua = built.headers.iter().find(|(k, _)| k == "User-Agent").unwrap();
        assert_eq!(ua.1, USER_AGENT_VALUE);
    }
}
