//! keyhole_config
//!
//! Loads and validates the keyhole sidecar's YAML configuration file:
//! the `services` map (each a [`ServiceConfig`]), the optional `agents`
//! ACL table, and a handful of process-level knobs (`logging`,
//! `socket_dir`, `vault_path`). Webhook boot alerting is out of scope
//! (§1) and has no field here.
//!
//! Validation never fails fast on the first problem: every service and
//! every agent entry is checked, and [`ConfigError`]s accumulate into one
//! report so a human fixing the file sees every issue in one pass.

use serde::{Deserialize, Serialize};
use serde_yaml::Value as Yaml;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use thiserror::Error;

pub mod placeholder;

/// One entry in a service's domain list: a bare host, matched exactly, or
/// a host scoped to a path prefix (for multiplexed upstreams sharing one
/// hostname, e.g. a gateway fronting several logical services).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DomainEntry {
    Bare(String),
    Prefixed { host: String, path_prefix: String },
}

impl DomainEntry {
    pub fn host(&self) -> &str {
        match self {
            DomainEntry::Bare(h) => h,
            DomainEntry::Prefixed { host, .. } => host,
        }
    }
}

/// How a service authenticates outbound requests. A closed, exhaustively
/// matched tagged union — never model this as a trait hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthSpec {
    Bearer {
        secret_ref: String,
    },
    Basic {
        secret_ref: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
    },
    QueryParam {
        secret_ref: String,
        param_name: String,
    },
    CustomHeader {
        secret_ref: String,
        header_name: String,
    },
}

impl AuthSpec {
    pub fn secret_ref(&self) -> &str {
        match self {
            AuthSpec::Bearer { secret_ref }
            | AuthSpec::Basic { secret_ref, .. }
            | AuthSpec::QueryParam { secret_ref, .. }
            | AuthSpec::CustomHeader { secret_ref, .. } => secret_ref,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamingMode {
    Stream,
    Buffer,
}

impl Default for StreamingMode {
    fn default() -> Self {
        StreamingMode::Stream
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeuristicSpec {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_min_length")]
    pub min_length: u32,
    #[serde(default = "default_min_entropy")]
    pub min_entropy: f64,
    #[serde(default)]
    pub additional_key_names: Vec<String>,
}

fn default_true() -> bool {
    true
}
fn default_min_length() -> u32 {
    16
}
fn default_min_entropy() -> f64 {
    3.5
}

impl Default for HeuristicSpec {
    fn default() -> Self {
        Self {
            enabled: true,
            min_length: default_min_length(),
            min_entropy: default_min_entropy(),
            additional_key_names: Vec::new(),
        }
    }
}

/// Built-in heuristic key-name substrings (§4.5 L3), always active; user
/// `additional_key_names` are appended, never replace these.
pub const BUILTIN_HEURISTIC_KEY_NAMES: &[&str] = &[
    "token",
    "secret",
    "key",
    "password",
    "passwd",
    "credential",
    "auth",
    "api_key",
    "apikey",
    "access_token",
    "refresh_token",
    "id_token",
    "client_secret",
    "private_key",
    "signing_key",
    "encryption_key",
    "bearer",
    "session_id",
    "sid",
    "salt",
    "hash",
    "cert",
    "certificate",
    "webhook_secret",
    "signing_secret",
    "shared_secret",
    "passphrase",
    "conn_str",
    "connection_string",
    "dsn",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMaskingSpec {
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub json_paths: Vec<String>,
    #[serde(default)]
    pub streaming_mode: StreamingMode,
    #[serde(default = "default_window_cap")]
    pub streaming_window_cap: u32,
    #[serde(default)]
    pub heuristic: HeuristicSpec,
}

fn default_window_cap() -> u32 {
    200
}

impl Default for ResponseMaskingSpec {
    fn default() -> Self {
        Self {
            patterns: Vec::new(),
            json_paths: Vec::new(),
            streaming_mode: StreamingMode::default(),
            streaming_window_cap: default_window_cap(),
            heuristic: HeuristicSpec::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub domains: Vec<DomainEntry>,
    pub auth: AuthSpec,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub base_url: Option<String>,
    pub placeholder: String,
    #[serde(default)]
    pub sdk_env: BTreeMap<String, String>,
    #[serde(default)]
    pub masking: ResponseMaskingSpec,
}

impl ServiceConfig {
    /// Resolve the base URL, auto-deriving scheme from the first declared
    /// domain when not set explicitly: loopback/RFC1918 hosts get plain
    /// `http://`, everything else gets `https://`.
    pub fn resolved_base_url(&self) -> String {
        if let Some(u) = &self.base_url {
            return u.trim_end_matches('/').to_string();
        }
        let host = self.domains.first().map(|d| d.host()).unwrap_or("");
        let scheme = if is_loopback_or_private(host) {
            "http"
        } else {
            "https"
        };
        format!("{scheme}://{host}")
    }
}

fn is_loopback_or_private(host: &str) -> bool {
    if host == "localhost" {
        return true;
    }
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return match ip {
            std::net::IpAddr::V4(v4) => {
                v4.is_loopback()
                    || v4.octets()[0] == 10
                    || (v4.octets()[0] == 172 && (16..=31).contains(&v4.octets()[1]))
                    || (v4.octets()[0] == 192 && v4.octets()[1] == 168)
            }
            std::net::IpAddr::V6(v6) => v6.is_loopback(),
        };
    }
    false
}

/// The `services` map, keyed by name but ordered by YAML declaration order
/// rather than alphabetically. Declaration order is load-bearing: a
/// shared-host path-prefix tie (`keyhole_interceptor::resolver`) breaks by
/// "first declared wins," which only `BTreeMap` iteration order cannot
/// reproduce.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceMap(Vec<(String, ServiceConfig)>);

impl ServiceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert, overwriting an existing entry in place (keeping its original
    /// position) rather than moving it to the end.
    pub fn insert(&mut self, name: String, svc: ServiceConfig) {
        match self.0.iter_mut().find(|(n, _)| *n == name) {
            Some(existing) => existing.1 = svc,
            None => self.0.push((name, svc)),
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ServiceConfig> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, s)| s)
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn values(&self) -> impl Iterator<Item = &ServiceConfig> {
        self.0.iter().map(|(_, s)| s)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.iter().map(|(n, _)| n)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ServiceConfig)> {
        self.0.iter().map(|(n, s)| (n, s))
    }
}

impl std::ops::Index<&str> for ServiceMap {
    type Output = ServiceConfig;

    fn index(&self, name: &str) -> &ServiceConfig {
        self.get(name).expect("no service with that name")
    }
}

impl FromIterator<(String, ServiceConfig)> for ServiceMap {
    fn from_iter<I: IntoIterator<Item = (String, ServiceConfig)>>(iter: I) -> Self {
        let mut out = Self::new();
        for (name, svc) in iter {
            out.insert(name, svc);
        }
        out
    }
}

impl<'a> IntoIterator for &'a ServiceMap {
    type Item = (&'a String, &'a ServiceConfig);
    type IntoIter =
        std::iter::Map<std::slice::Iter<'a, (String, ServiceConfig)>, fn(&'a (String, ServiceConfig)) -> (&'a String, &'a ServiceConfig)>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter().map(|(n, s)| (n, s))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub sink: Option<String>,
    #[serde(default)]
    pub file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub services: ServiceMap,
    #[serde(default)]
    pub agents: BTreeMap<String, BTreeSet<String>>,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
    #[serde(default)]
    pub socket_dir: Option<String>,
    #[serde(default)]
    pub vault_path: Option<String>,
}

impl Config {
    /// Services an agent is allowed to call. Absent from `agents` ⇒ all
    /// services are visible (single-agent-deployment compatibility, §4.7).
    pub fn allowed_services(&self, agent: &str) -> Option<&BTreeSet<String>> {
        self.agents.get(agent)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid yaml: {0}")]
    InvalidYaml(String),
    #[error("missing required 'services' key")]
    MissingServices,
    #[error("service '{0}' has no domains")]
    ServiceNoDomains(String),
    #[error("service '{0}' auth is missing 'type'")]
    AuthMissingType(String),
    #[error("service '{0}' auth is missing 'secret_ref'")]
    AuthMissingSecretRef(String),
    #[error("service '{service}' auth.type '{got}' is not one of bearer, basic, query_param, custom_header")]
    AuthUnknownType { service: String, got: String },
    #[error("service '{0}' uses query_param auth but is missing 'param_name'")]
    QueryParamMissingName(String),
    #[error("service '{0}' uses custom_header auth but is missing 'header_name'")]
    CustomHeaderMissingName(String),
    #[error("domain '{domain}' is declared by both '{first}' and '{second}'")]
    DuplicateDomain {
        domain: String,
        first: String,
        second: String,
    },
    #[error("service '{service}' base_url '{got}' must start with http:// or https://")]
    BadBaseUrl { service: String, got: String },
    #[error("service '{service}' streaming_window_cap must be a positive integer, got {got}")]
    BadStreamingWindowCap { service: String, got: String },
    #[error("service '{service}' has an invalid regex pattern '{pattern}': {reason}")]
    InvalidRegex {
        service: String,
        pattern: String,
        reason: String,
    },
    #[error("service '{service}' json_path '{path}' must start with '$'")]
    BadJsonPath { service: String, path: String },
    #[error("service '{service}' heuristic.min_length must be a positive integer, got {got}")]
    BadMinLength { service: String, got: String },
    #[error("service '{service}' heuristic.min_entropy must be a positive number, got {got}")]
    BadMinEntropy { service: String, got: String },
    #[error("service '{service}' heuristic.additional_key_names must be a list of strings")]
    BadAdditionalKeyNames { service: String },
    #[error("service '{service}' sdk_env['{var}'] contains a template token other than {{{{placeholder}}}}: '{value}'")]
    BadSdkEnvTemplate {
        service: String,
        var: String,
        value: String,
    },
    #[error("agent '{agent}' references undeclared service '{service}'")]
    UndeclaredAgentService { agent: String, service: String },
}

#[derive(Debug, Error)]
#[error("{} configuration error(s):\n{}", .0.len(), render_errors(.0))]
pub struct ConfigErrors(pub Vec<ConfigError>);

fn render_errors(errs: &[ConfigError]) -> String {
    errs.iter()
        .map(|e| format!("  - {e}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// A streaming-mode unbounded-quantifier pattern without an `{n}` bound:
/// not a hard error, just a warning per §6 — matches longer than the
/// window cap silently will not be redacted (§9 open question ii).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning(pub String);

pub struct LoadResult {
    pub config: Config,
    pub warnings: Vec<ConfigWarning>,
}

pub fn load_from_str(yaml_src: &str) -> Result<LoadResult, ConfigErrors> {
    let root: Yaml = serde_yaml::from_str(yaml_src)
        .map_err(|e| ConfigErrors(vec![ConfigError::InvalidYaml(e.to_string())]))?;
    validate_and_build(&root)
}

pub fn load_from_path(path: impl AsRef<Path>) -> Result<LoadResult, ConfigErrors> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        ConfigErrors(vec![ConfigError::InvalidYaml(format!(
            "failed to read config file: {e}"
        ))])
    })?;
    load_from_str(&text)
}

fn validate_and_build(root: &Yaml) -> Result<LoadResult, ConfigErrors> {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let services_yaml = root.get("services");
    let services_yaml = match services_yaml {
        None => {
            errors.push(ConfigError::MissingServices);
            return Err(ConfigErrors(errors));
        }
        Some(v) => v,
    };

    let mut services = ServiceMap::new();
    let mut seen_bare_domains: BTreeMap<String, String> = BTreeMap::new();

    // `as_mapping()` preserves the order keys appeared in the YAML source
    // (serde_yaml is an order-preserving map), so `services` ends up in
    // declaration order rather than alphabetical order.
    if let Some(map) = services_yaml.as_mapping() {
        for (name_key, svc_yaml) in map {
            let name = name_key.as_str().unwrap_or("<non-string-key>").to_string();
            match build_service(&name, svc_yaml, &mut seen_bare_domains, &mut warnings) {
                Ok(svc) => {
                    services.insert(name, svc);
                }
                Err(mut errs) => errors.append(&mut errs),
            }
        }
    }
    // An empty mapping (`services: {}`) is valid; only total absence of the
    // key is rejected (checked above).

    let agents = parse_agents(root.get("agents"), &services, &mut errors);
    let logging = parse_logging(root.get("logging"));
    let socket_dir = root
        .get("socket_dir")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let vault_path = root
        .get("vault_path")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    if !errors.is_empty() {
        return Err(ConfigErrors(errors));
    }

    Ok(LoadResult {
        config: Config {
            services,
            agents,
            logging,
            socket_dir,
            vault_path,
        },
        warnings,
    })
}

fn build_service(
    name: &str,
    svc_yaml: &Yaml,
    seen_bare_domains: &mut BTreeMap<String, String>,
    warnings: &mut Vec<ConfigWarning>,
) -> Result<ServiceConfig, Vec<ConfigError>> {
    let mut errors = Vec::new();

    let domains = parse_domains(name, svc_yaml.get("domains"), seen_bare_domains, &mut errors);

    let auth = match parse_auth(name, svc_yaml.get("auth"), &mut errors) {
        Some(a) => a,
        None => AuthSpec::Bearer {
            secret_ref: String::new(),
        },
    };

    let headers = parse_string_map(svc_yaml.get("headers"));

    let base_url = svc_yaml
        .get("base_url")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    if let Some(u) = &base_url {
        if !(u.starts_with("http://") || u.starts_with("https://")) {
            errors.push(ConfigError::BadBaseUrl {
                service: name.to_string(),
                got: u.clone(),
            });
        }
    }

    let placeholder = svc_yaml
        .get("placeholder")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    let sdk_env = parse_string_map(svc_yaml.get("sdk_env"));
    for (var, value) in &sdk_env {
        if let Some(bad) = find_bad_template_token(value) {
            errors.push(ConfigError::BadSdkEnvTemplate {
                service: name.to_string(),
                var: var.clone(),
                value: bad,
            });
        }
    }

    let masking = parse_masking(name, svc_yaml.get("masking"), &mut errors, warnings);

    if !errors.is_empty() {
        return Err(errors);
    }

    Ok(ServiceConfig {
        domains,
        auth,
        headers,
        base_url,
        placeholder,
        sdk_env,
        masking,
    })
}

fn parse_domains(
    service: &str,
    domains_yaml: Option<&Yaml>,
    seen_bare_domains: &mut BTreeMap<String, String>,
    errors: &mut Vec<ConfigError>,
) -> Vec<DomainEntry> {
    let mut out = Vec::new();
    let seq = domains_yaml.and_then(|v| v.as_sequence());
    match seq {
        None => {
            errors.push(ConfigError::ServiceNoDomains(service.to_string()));
        }
        Some(seq) if seq.is_empty() => {
            errors.push(ConfigError::ServiceNoDomains(service.to_string()));
        }
        Some(seq) => {
            for d in seq {
                let entry = if let Some(s) = d.as_str() {
                    DomainEntry::Bare(s.to_string())
                } else if d.as_mapping().is_some() {
                    let host = d
                        .get("host")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    let path_prefix = d
                        .get("path_prefix")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    DomainEntry::Prefixed { host, path_prefix }
                } else {
                    continue;
                };

                if let DomainEntry::Bare(host) = &entry {
                    if let Some(first) = seen_bare_domains.get(host) {
                        if first != service {
                            errors.push(ConfigError::DuplicateDomain {
                                domain: host.clone(),
                                first: first.clone(),
                                second: service.to_string(),
                            });
                        }
                    } else {
                        seen_bare_domains.insert(host.clone(), service.to_string());
                    }
                }
                out.push(entry);
            }
        }
    }
    out
}

fn parse_auth(service: &str, auth_yaml: Option<&Yaml>, errors: &mut Vec<ConfigError>) -> Option<AuthSpec> {
    let auth_yaml = auth_yaml?;
    let ty = auth_yaml.get("type").and_then(|v| v.as_str());
    let secret_ref = auth_yaml.get("secret_ref").and_then(|v| v.as_str());

    let ty = match ty {
        Some(t) => t,
        None => {
            errors.push(ConfigError::AuthMissingType(service.to_string()));
            return None;
        }
    };
    let secret_ref = match secret_ref {
        Some(r) => r.to_string(),
        None => {
            errors.push(ConfigError::AuthMissingSecretRef(service.to_string()));
            return None;
        }
    };

    match ty {
        "bearer" => Some(AuthSpec::Bearer { secret_ref }),
        "basic" => {
            let username = auth_yaml
                .get("username")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
            Some(AuthSpec::Basic { secret_ref, username })
        }
        "query_param" => {
            let param_name = auth_yaml.get("param_name").and_then(|v| v.as_str());
            match param_name {
                Some(p) => Some(AuthSpec::QueryParam {
                    secret_ref,
                    param_name: p.to_string(),
                }),
                None => {
                    errors.push(ConfigError::QueryParamMissingName(service.to_string()));
                    None
                }
            }
        }
        "custom_header" => {
            let header_name = auth_yaml.get("header_name").and_then(|v| v.as_str());
            match header_name {
                Some(h) => Some(AuthSpec::CustomHeader {
                    secret_ref,
                    header_name: h.to_string(),
                }),
                None => {
                    errors.push(ConfigError::CustomHeaderMissingName(service.to_string()));
                    None
                }
            }
        }
        other => {
            errors.push(ConfigError::AuthUnknownType {
                service: service.to_string(),
                got: other.to_string(),
            });
            None
        }
    }
}

fn parse_string_map(v: Option<&Yaml>) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    if let Some(map) = v.and_then(|v| v.as_mapping()) {
        for (k, val) in map {
            if let (Some(k), Some(val)) = (k.as_str(), val.as_str()) {
                out.insert(k.to_string(), val.to_string());
            }
        }
    }
    out
}

/// `sdk_env` values may only contain the literal `{{placeholder}}` token;
/// any other `{{...}}` sequence is rejected. Returns the first offending
/// token, if any.
fn find_bad_template_token(value: &str) -> Option<String> {
    let mut rest = value;
    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        let end = after.find("}}")?;
        let token = &after[..end];
        if token != "placeholder" {
            return Some(format!("{{{{{token}}}}}"));
        }
        rest = &after[end + 2..];
    }
    None
}

fn parse_masking(
    service: &str,
    masking_yaml: Option<&Yaml>,
    errors: &mut Vec<ConfigError>,
    warnings: &mut Vec<ConfigWarning>,
) -> ResponseMaskingSpec {
    let mut out = ResponseMaskingSpec::default();
    let masking_yaml = match masking_yaml {
        Some(v) => v,
        None => return out,
    };

    if let Some(patterns) = masking_yaml.get("patterns").and_then(|v| v.as_sequence()) {
        for p in patterns {
            if let Some(p) = p.as_str() {
                match regex::Regex::new(p) {
                    Ok(_) => out.patterns.push(p.to_string()),
                    Err(e) => errors.push(ConfigError::InvalidRegex {
                        service: service.to_string(),
                        pattern: p.to_string(),
                        reason: e.to_string(),
                    }),
                }
            }
        }
    }

    if let Some(paths) = masking_yaml.get("json_paths").and_then(|v| v.as_sequence()) {
        for p in paths {
            if let Some(p) = p.as_str() {
                if !p.starts_with('$') {
                    errors.push(ConfigError::BadJsonPath {
                        service: service.to_string(),
                        path: p.to_string(),
                    });
                } else {
                    out.json_paths.push(p.to_string());
                }
            }
        }
    }

    if let Some(mode) = masking_yaml.get("streaming_mode").and_then(|v| v.as_str()) {
        out.streaming_mode = match mode {
            "buffer" => StreamingMode::Buffer,
            _ => StreamingMode::Stream,
        };
    }

    if let Some(cap) = masking_yaml.get("streaming_window_cap") {
        match cap.as_i64() {
            Some(n) if n > 0 => out.streaming_window_cap = n as u32,
            _ => errors.push(ConfigError::BadStreamingWindowCap {
                service: service.to_string(),
                got: yaml_display(cap),
            }),
        }
    }

    if let Some(h) = masking_yaml.get("heuristic") {
        if let Some(enabled) = h.get("enabled").and_then(|v| v.as_bool()) {
            out.heuristic.enabled = enabled;
        }
        if let Some(v) = h.get("min_length") {
            match v.as_i64() {
                Some(n) if n > 0 => out.heuristic.min_length = n as u32,
                _ => errors.push(ConfigError::BadMinLength {
                    service: service.to_string(),
                    got: yaml_display(v),
                }),
            }
        }
        if let Some(v) = h.get("min_entropy") {
            match v.as_f64() {
                Some(n) if n > 0.0 => out.heuristic.min_entropy = n,
                _ => errors.push(ConfigError::BadMinEntropy {
                    service: service.to_string(),
                    got: yaml_display(v),
                }),
            }
        }
        if let Some(v) = h.get("additional_key_names") {
            match v.as_sequence() {
                Some(seq) if seq.iter().all(|x| x.as_str().is_some()) => {
                    out.heuristic.additional_key_names =
                        seq.iter().map(|x| x.as_str().unwrap().to_string()).collect();
                }
                _ => errors.push(ConfigError::BadAdditionalKeyNames {
                    service: service.to_string(),
                }),
            }
        }
    }

    // Warn (don't reject): unbounded quantifier with no {n} bound in streaming mode.
    if out.streaming_mode == StreamingMode::Stream {
        for p in &out.patterns {
            if has_unbounded_quantifier_without_bound(p) {
                warnings.push(ConfigWarning(format!(
                    "service '{service}' pattern '{p}' has an unbounded quantifier with no {{n}} bound; \
                     matches longer than streaming_window_cap will not be redacted while streaming"
                )));
            }
        }
    }

    out
}

fn has_unbounded_quantifier_without_bound(pattern: &str) -> bool {
    let bytes = pattern.as_bytes();
    let mut i = 0;
    let mut prev_was_escape = false;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if prev_was_escape {
            prev_was_escape = false;
            i += 1;
            continue;
        }
        match c {
            '\\' => prev_was_escape = true,
            '+' | '*' => return true,
            '{' => {
                // `{m,n}` or `{m,}` are bounded-syntax; `{m,}` is still
                // unbounded above, but that's covered by its own check
                // below via the missing upper bound.
                if let Some(close) = pattern[i..].find('}') {
                    let inner = &pattern[i + 1..i + close];
                    if inner.ends_with(',') || (inner.contains(',') && !ends_with_number(inner)) {
                        return true;
                    }
                }
            }
            _ => {}
        }
        i += 1;
    }
    false
}

fn ends_with_number(s: &str) -> bool {
    s.rsplit(',').next().map(|x| !x.is_empty() && x.chars().all(|c| c.is_ascii_digit())).unwrap_or(false)
}

fn parse_agents(
    agents_yaml: Option<&Yaml>,
    services: &ServiceMap,
    errors: &mut Vec<ConfigError>,
) -> BTreeMap<String, BTreeSet<String>> {
    let mut out = BTreeMap::new();
    if let Some(map) = agents_yaml.and_then(|v| v.as_mapping()) {
        for (k, v) in map {
            let agent = k.as_str().unwrap_or_default().to_string();
            let mut allowed = BTreeSet::new();
            if let Some(seq) = v.as_sequence() {
                for s in seq {
                    if let Some(s) = s.as_str() {
                        if !services.contains_key(s) {
                            errors.push(ConfigError::UndeclaredAgentService {
                                agent: agent.clone(),
                                service: s.to_string(),
                            });
                        }
                        allowed.insert(s.to_string());
                    }
                }
            }
            out.insert(agent, allowed);
        }
    }
    out
}

fn parse_logging(v: Option<&Yaml>) -> Option<LoggingConfig> {
    let v = v?;
    Some(LoggingConfig {
        level: v.get("level").and_then(|x| x.as_str()).map(|s| s.to_string()),
        sink: v.get("sink").and_then(|x| x.as_str()).map(|s| s.to_string()),
        file: v.get("file").and_then(|x| x.as_str()).map(|s| s.to_string()),
    })
}

fn yaml_display(v: &Yaml) -> String {
    serde_yaml::to_string(v).unwrap_or_default().trim().to_string()
}
