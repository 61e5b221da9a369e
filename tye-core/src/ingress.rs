//! Ingress rules and request matching
//!
//! A rule may constrain the request host (exact, `*.domain`, or `*`, each with
//! an optional `:port` / `:*`) and a path prefix, and always names exactly one
//! target service. Rules are tried in registration order; the first match
//! wins. Overlapping rules are not disambiguated.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::model::Binding;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressRule {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    pub service: String,
    #[serde(default)]
    pub preserve_path: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressDescription {
    pub name: String,
    pub bindings: Vec<Binding>,
    pub rules: Vec<IngressRule>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostPattern {
    Any,
    /// `*.example.com`, stored as `.example.com`.
    Subdomain(String),
    Exact(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortPattern {
    /// No port given in the rule.
    Any,
    /// `:*`
    Wildcard,
    Exact(u16),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostMatcher {
    pub host: HostPattern,
    pub port: PortPattern,
}

impl HostMatcher {
    pub fn any() -> Self {
        Self {
            host: HostPattern::Any,
            port: PortPattern::Any,
        }
    }

    pub fn parse(pattern: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidHostPattern {
            pattern: pattern.to_string(),
        };
        let pattern_lc = pattern.trim().to_ascii_lowercase();
        if pattern_lc.is_empty() {
            return Ok(Self::any());
        }

        let (host, port) = match pattern_lc.rsplit_once(':') {
            Some((host, "*")) => (host, PortPattern::Wildcard),
            Some((host, port)) => (
                host,
                PortPattern::Exact(port.parse().map_err(|_| invalid())?),
            ),
            None => (pattern_lc.as_str(), PortPattern::Any),
        };

        let host = match host {
            "" | "*" => HostPattern::Any,
            h if h.starts_with("*.") => {
                let rest = &h[1..];
                if rest.len() < 2 || rest.contains('*') {
                    return Err(invalid());
                }
                HostPattern::Subdomain(rest.to_string())
            }
            h if h.contains('*') => return Err(invalid()),
            h => HostPattern::Exact(h.to_string()),
        };

        Ok(Self { host, port })
    }

    /// `request_host` is the raw `Host` header value, e.g. `a.example.com:8080`.
    pub fn matches(&self, request_host: &str) -> bool {
        let request_host = request_host.trim().to_ascii_lowercase();
        let (host, port) = split_host_port(&request_host);

        let host_ok = match &self.host {
            HostPattern::Any => true,
            HostPattern::Exact(h) => host == h,
            HostPattern::Subdomain(suffix) => host
                .strip_suffix(suffix.as_str())
                .is_some_and(|label| !label.is_empty() && !label.contains('.')),
        };

        let port_ok = match self.port {
            PortPattern::Any | PortPattern::Wildcard => true,
            PortPattern::Exact(p) => port.unwrap_or(80) == p,
        };

        host_ok && port_ok
    }
}

fn split_host_port(value: &str) -> (&str, Option<u16>) {
    match value.rsplit_once(':') {
        Some((host, port)) if !host.ends_with(']') || value.starts_with('[') => {
            match port.parse() {
                Ok(p) => (host, Some(p)),
                Err(_) => (value, None),
            }
        }
        _ => (value, None),
    }
}

#[derive(Clone, Debug)]
pub struct CompiledRule {
    pub host: HostMatcher,
    /// Normalised prefix without a trailing slash; empty matches every path.
    pub path: String,
    pub service: String,
    pub preserve_path: bool,
}

impl CompiledRule {
    pub fn compile(rule: &IngressRule) -> Result<Self, ConfigError> {
        let host = match &rule.host {
            Some(h) => HostMatcher::parse(h)?,
            None => HostMatcher::any(),
        };
        let path = rule
            .path
            .as_deref()
            .map(|p| p.trim_end_matches('/'))
            .unwrap_or("");
        let path = if path.is_empty() || path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        Ok(Self {
            host,
            path,
            service: rule.service.clone(),
            preserve_path: rule.preserve_path,
        })
    }

    /// Segment-aware, case-insensitive prefix match.
    pub fn matches_path(&self, path: &str) -> bool {
        if self.path.is_empty() {
            return true;
        }
        let prefix_len = self.path.len();
        if path.len() < prefix_len || !path.is_char_boundary(prefix_len) {
            return false;
        }
        let (head, tail) = path.split_at(prefix_len);
        head.eq_ignore_ascii_case(&self.path) && (tail.is_empty() || tail.starts_with('/'))
    }

    pub fn matches(&self, host: Option<&str>, path: &str) -> bool {
        let host_ok = match host {
            Some(h) => self.host.matches(h),
            None => self.host == HostMatcher::any(),
        };
        host_ok && self.matches_path(path)
    }

    /// Path and query to send downstream.
    pub fn rewrite(&self, path: &str, query: Option<&str>) -> String {
        let path = if self.preserve_path || self.path.is_empty() {
            path
        } else {
            &path[self.path.len().min(path.len())..]
        };
        let path = if path.is_empty() { "/" } else { path };
        match query {
            Some(q) if !q.is_empty() => format!("{}?{}", path, q),
            _ => path.to_string(),
        }
    }
}

/// Compiled, ordered rule set of one ingress.
#[derive(Clone, Debug, Default)]
pub struct IngressRoutes {
    rules: Vec<CompiledRule>,
}

impl IngressRoutes {
    pub fn compile(description: &IngressDescription) -> Result<Self, ConfigError> {
        let rules = description
            .rules
            .iter()
            .map(CompiledRule::compile)
            .collect::<Result<_, _>>()?;
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[CompiledRule] {
        &self.rules
    }

    /// First registered rule matching the request.
    pub fn route(&self, host: Option<&str>, path: &str) -> Option<&CompiledRule> {
        self.rules.iter().find(|r| r.matches(host, path))
    }
}
