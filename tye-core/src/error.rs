use std::path::PathBuf;

use thiserror::Error;

/// Problems found while loading or validating an application description.
/// All of them are fatal before any replica starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("no config file found, searched: {searched:?}")]
    NotFound { searched: Vec<PathBuf> },

    #[error(
        "invalid service name '{name}': use lowercase letters, digits and '-', at most 63 characters"
    )]
    InvalidServiceName { name: String },

    #[error("service '{name}' is defined more than once")]
    DuplicateService { name: String },

    #[error("service '{service}' must set exactly one of executable, project, image or external")]
    MissingRunInfo { service: String },

    #[error("port {port} is bound by both '{first}' and '{second}'")]
    DuplicatePort {
        port: u16,
        first: String,
        second: String,
    },

    #[error("service '{service}' has more than one binding named '{binding}'")]
    DuplicateBindingName { service: String, binding: String },

    #[error("service '{service}' must have at least one replica")]
    NoReplicas { service: String },

    #[error("ingress '{ingress}' has a rule targeting unknown service '{service}'")]
    UnknownIngressService { ingress: String, service: String },

    #[error("invalid ingress host pattern '{pattern}'")]
    InvalidHostPattern { pattern: String },
}

/// Why a single launch attempt failed. Absorbed by the replica slot that hit
/// it; the slot logs it and retries after a backoff.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("build of {project} exited with code {code:?}")]
    Build { project: PathBuf, code: Option<i32> },

    #[error("container runtime error: {0}")]
    Container(String),

    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),
}

/// Fatal proxy setup errors. Per-connection failures never surface here.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no free port available: {0}")]
    NoFreePort(#[source] std::io::Error),
}
