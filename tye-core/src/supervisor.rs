//! Supervisor trait for runtime backends
//!
//! A supervisor keeps `replicas` instances of every service it owns running
//! until the shared cancellation token fires, then tears them all down.
//! Different implementations drive different backends:
//! - OS processes (executables and cargo projects)
//! - containers through the local container runtime

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::backoff::BackoffPolicy;
use crate::model::ServiceType;
use crate::service::Application;

/// Host-wide knobs shared by every supervisor.
#[derive(Clone, Debug)]
pub struct HostOptions {
    /// How long a replica gets to exit after the stop signal before it is killed.
    pub grace_period: Duration,
    /// Delay between failed launch attempts (spawn, build or create errors).
    pub launch_backoff: BackoffPolicy,
    /// Delay before relaunching a replica that exited on its own.
    pub restart_delay: Duration,
    /// Attempts made to reach a dependency such as the container daemon.
    pub dependency_retries: u32,
    /// Delay between attempts to reach a dependency.
    pub dependency_backoff: BackoffPolicy,
    /// Run the build step for project services.
    pub build: bool,
    /// Run container services; when off they are skipped with a warning.
    pub docker: bool,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(5),
            launch_backoff: BackoffPolicy::default(),
            restart_delay: Duration::from_secs(1),
            dependency_retries: 5,
            dependency_backoff: BackoffPolicy {
                first: Duration::from_millis(500),
                max: Duration::from_secs(8),
                factor: 2.0,
            },
            build: true,
            docker: true,
        }
    }
}

#[async_trait]
pub trait Supervisor: Send + Sync {
    /// Human-readable name of this backend
    fn name(&self) -> &'static str;

    /// Whether services of this type are managed here.
    fn owns(&self, service_type: ServiceType) -> bool;

    /// Supervise every owned service of `app` until `token` is cancelled.
    ///
    /// Returns only after every replica it launched has reached `Removed`.
    /// Failures of individual replicas are absorbed and retried, never
    /// returned.
    async fn run(&self, app: Arc<Application>, token: CancellationToken);
}
