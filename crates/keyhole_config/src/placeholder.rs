//! Derives the process-wide placeholder environment (§6) that the agent
//! process merges into its own environment: each `sdk_env` key maps to
//! the owning service's `placeholder`, substituted for the
//! `{{placeholder}}` token in the configured template.

use crate::Config;
use std::collections::BTreeMap;

/// Build `{env_var_name: look-alike value}` across every configured
/// service. Later services in iteration order win on key collision
/// (services are iterated in `BTreeMap` — i.e. name — order, so collisions
/// are deterministic though config authors should avoid them).
pub fn build_placeholder_env(config: &Config) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for svc in config.services.values() {
        for (var, template) in &svc.sdk_env {
            let value = template.replace("{{placeholder}}", &svc.placeholder);
            out.insert(var.clone(), value);
        }
    }
    out
}
