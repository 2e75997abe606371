//! Host/path → service resolution (§4.9). Built once from [`Config`] at
//! `install()` time: an exact host→service map for bare domains, and a
//! per-host list of `(path_prefix, service)` sorted by descending prefix
//! length for domains scoped to a path.
//!
//! `keyhole_config::ServiceMap` preserves YAML declaration order, and the
//! per-host prefix list is built by iterating services in that order, then
//! sorted by prefix length with a *stable* sort — so ties in prefix length
//! break by "first declared wins" (§9 Open Question (i)), not alphabetical
//! service-name order.

use keyhole_config::{Config, DomainEntry};
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct PrefixEntry {
    path_prefix: String,
    service: String,
}

/// Strip a `:port` suffix from a host, respecting IPv6 literals
/// (`[::1]:8443` → `[::1]`) which contain colons of their own.
pub fn strip_port(host: &str) -> &str {
    if let Some(close) = host.rfind(']') {
        return &host[..=close];
    }
    match host.rfind(':') {
        Some(idx) => &host[..idx],
        None => host,
    }
}

pub struct Resolver {
    exact: HashMap<String, String>,
    prefixed: HashMap<String, Vec<PrefixEntry>>,
}

impl Resolver {
    pub fn build(config: &Config) -> Self {
        let mut exact = HashMap::new();
        let mut prefixed: HashMap<String, Vec<PrefixEntry>> = HashMap::new();

        for (service, svc_config) in &config.services {
            for domain in &svc_config.domains {
                match domain {
                    DomainEntry::Bare(host) => {
                        exact.insert(host.clone(), service.clone());
                    }
                    DomainEntry::Prefixed { host, path_prefix } => {
                        prefixed.entry(host.clone()).or_default().push(PrefixEntry {
                            path_prefix: path_prefix.clone(),
                            service: service.clone(),
                        });
                    }
                }
            }
        }

        for entries in prefixed.values_mut() {
            entries.sort_by(|a, b| b.path_prefix.len().cmp(&a.path_prefix.len()));
        }

        Self { exact, prefixed }
    }

    /// Resolve an outbound `(host, path)` pair to a configured service
    /// name, or `None` if the call should pass through unchanged.
    pub fn resolve(&self, host: &str, path: &str) -> Option<&str> {
        let host = strip_port(host);
        if let Some(service) = self.exact.get(host) {
            return Some(service.as_str());
        }
        self.prefixed
            .get(host)
            .and_then(|entries| entries.iter().find(|e| path.starts_with(&e.path_prefix)))
            .map(|e| e.service.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyhole_config::load_from_str;

    fn config(yaml: &str) -> Config {
        load_from_str(yaml).expect("valid config").config
    }

    #[test]
    fn strips_ipv4_style_port() {
        assert_eq!(strip_port("api.github.com:443"), "api.github.com");
    }

    #[test]
    fn strips_port_but_keeps_ipv6_brackets() {
        assert_eq!(strip_port("[::1]:8443"), "[::1]");
        assert_eq!(strip_port("[::1]"), "[::1]");
    }

    #[test]
    fn exact_host_resolves_over_no_match() {
        let cfg = config(
            r#"
services:
  github:
    domains: ["api.github.com"]
    auth: { type: bearer, secret_ref: "GH_TOKEN" }
"#,
        );
        let resolver = Resolver::build(&cfg);
        assert_eq!(resolver.resolve("api.github.com:443", "/repos"), Some("github"));
        assert_eq!(resolver.resolve("example.com", "/repos"), None);
    }

    #[test]
    fn longest_prefix_wins_on_shared_host() {
        let cfg = config(
            r#"
services:
  gateway_a:
    domains: [{ host: "gw.internal", path_prefix: "/a" }]
    auth: { type: bearer, secret_ref: "A_TOKEN" }
  gateway_b:
    domains: [{ host: "gw.internal", path_prefix: "/a/b" }]
    auth: { type: bearer, secret_ref: "B_TOKEN" }
"#,
        );
        let resolver = Resolver::build(&cfg);
        assert_eq!(resolver.resolve("gw.internal", "/a/b/widgets"), Some("gateway_b"));
        assert_eq!(resolver.resolve("gw.internal", "/a/widgets"), Some("gateway_a"));
        assert_eq!(resolver.resolve("gw.internal", "/other"), None);
    }

    #[test]
    fn equal_length_prefix_tie_breaks_by_declaration_order_not_alphabetical() {
        // "zeta" is declared first and would lose an alphabetical tie-break
        // to "alpha"; it must still win since declaration order is what
        // matters.
        let cfg = config(
            r#"
services:
  zeta:
    domains: [{ host: "gw.internal", path_prefix: "/a" }]
    auth: { type: bearer, secret_ref: "Z_TOKEN" }
  alpha:
    domains: [{ host: "gw.internal", path_prefix: "/a" }]
    auth: { type: bearer, secret_ref: "A_TOKEN" }
"#,
        );
        let resolver = Resolver::build(&cfg);
        assert_eq!(resolver.resolve("gw.internal", "/a/widgets"), Some("zeta"));
    }
}
