//! Logging setup and the replica diagnostics forwarder.

use std::sync::Arc;

use tokio::sync::broadcast::Receiver;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use tye_core::model::ReplicaState;
use tye_core::replica::ReplicaEvent;
use tye_core::service::{Application, Service};
use tye_core::state::{LogLine, LogStream};

/// Install the global subscriber. `RUST_LOG` wins over `level` when set.
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    fmt().with_env_filter(filter).init();
}

/// Re-emit every service's output lines and replica transitions as tracing
/// events under the `tye::replica` target. Must run before any supervisor
/// starts; subscriptions are taken before returning so nothing is missed.
pub fn forward_diagnostics(app: &Application, token: &CancellationToken, tasks: &mut JoinSet<()>) {
    for service in app.services().values() {
        let logs = service.logs().subscribe();
        let events = service.replica_events().subscribe();
        tasks.spawn(forward_service(service.clone(), logs, events, token.clone()));
    }
}

async fn forward_service(
    service: Arc<Service>,
    mut logs: Receiver<LogLine>,
    mut events: Receiver<ReplicaEvent>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            line = logs.recv() => match line {
                Ok(line) => match line.stream {
                    LogStream::Stdout => {
                        info!(target: "tye::replica", service = service.name(), "{}", line.display())
                    }
                    LogStream::Stderr | LogStream::System => {
                        warn!(target: "tye::replica", service = service.name(), "{}", line.display())
                    }
                },
                Err(RecvError::Lagged(n)) => {
                    warn!(target: "tye::replica", service = service.name(), skipped = n, "log lines dropped");
                }
                Err(RecvError::Closed) => break,
            },
            event = events.recv() => match event {
                Ok(event) => {
                    let replica = &event.replica;
                    match event.state {
                        ReplicaState::Started => info!(
                            target: "tye::replica",
                            service = service.name(),
                            replica = replica.name(),
                            pid = ?replica.pid(),
                            ports = ?replica.ports(),
                            "replica started"
                        ),
                        state => debug!(
                            target: "tye::replica",
                            service = service.name(),
                            replica = replica.name(),
                            ?state,
                            "replica transition"
                        ),
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    warn!(target: "tye::replica", service = service.name(), skipped = n, "replica events dropped");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
}
