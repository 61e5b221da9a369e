//! Round-robin TCP proxy
//!
//! One listener per published binding of a replicated service. Each inbound
//! connection is piped to the next internal port of a live replica. Services
//! with a single replica own their external port directly and get no
//! listener here.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::Receiver;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tye_core::backoff::sleep_or_cancel;
use tye_core::error::ProxyError;
use tye_core::model::ReplicaState;
use tye_core::replica::ReplicaEvent;
use tye_core::service::{Application, Service};

/// Pause after a failed accept (EMFILE and friends) before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Internal ports behind one external port, with per-port liveness.
#[derive(Debug)]
pub struct PortPool {
    ports: Vec<u16>,
    live: Vec<AtomicBool>,
    next: AtomicUsize,
}

impl PortPool {
    pub fn new(ports: Vec<u16>) -> Self {
        let live = ports.iter().map(|_| AtomicBool::new(false)).collect();
        Self {
            ports,
            live,
            next: AtomicUsize::new(0),
        }
    }

    /// Mark `port` as served (or not) by a running replica. Ports outside the
    /// pool are ignored.
    pub fn set_live(&self, port: u16, live: bool) {
        if let Some(i) = self.ports.iter().position(|p| *p == port) {
            self.live[i].store(live, Ordering::Relaxed);
        }
    }

    /// Next port in rotation. Only live ports are candidates unless none are
    /// live, in which case every port is.
    pub fn next(&self) -> Option<u16> {
        let live: Vec<u16> = self
            .ports
            .iter()
            .zip(&self.live)
            .filter(|(_, l)| l.load(Ordering::Relaxed))
            .map(|(p, _)| *p)
            .collect();
        let candidates = if live.is_empty() { &self.ports } else { &live };
        if candidates.is_empty() {
            return None;
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(candidates[i])
    }
}

/// Bind a listener for every replicated binding in `app` and spawn the
/// accept loops onto `tasks`. Returns the bound addresses.
///
/// Binding errors are returned before anything is spawned.
pub async fn start(
    app: &Application,
    token: &CancellationToken,
    tasks: &mut JoinSet<()>,
) -> Result<Vec<SocketAddr>, ProxyError> {
    let mut bound = Vec::new();
    for service in app.services().values() {
        let Some(map) = service.port_map() else {
            continue;
        };
        let mut pools = Vec::new();
        for (external, internal) in map {
            if internal.len() == 1 && internal[0] == *external {
                continue;
            }
            let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, *external));
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|source| ProxyError::Bind {
                    addr: addr.to_string(),
                    source,
                })?;
            let pool = Arc::new(PortPool::new(internal.clone()));
            bound.push((listener, pool.clone(), service.name().to_string()));
            pools.push(pool);
        }
        if !pools.is_empty() {
            let events = service.replica_events().subscribe();
            tasks.spawn(track_liveness(service.clone(), events, pools, token.clone()));
        }
    }

    let mut addrs = Vec::with_capacity(bound.len());
    for (listener, pool, service) in bound {
        let addr = listener.local_addr().map_err(|source| ProxyError::Bind {
            addr: service.clone(),
            source,
        })?;
        info!(service = %service, %addr, backends = ?pool.ports, "proxy listening");
        addrs.push(addr);
        tasks.spawn(accept_loop(listener, pool, service, token.clone()));
    }
    Ok(addrs)
}

/// Keep pool liveness in step with the service's replica events.
async fn track_liveness(
    service: Arc<Service>,
    mut events: Receiver<ReplicaEvent>,
    pools: Vec<Arc<PortPool>>,
    token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(event) => {
                let live = match event.state {
                    ReplicaState::Started | ReplicaState::Ready | ReplicaState::Healthy => true,
                    ReplicaState::Stopped | ReplicaState::Removed => false,
                    ReplicaState::Added => continue,
                };
                for port in event.replica.ports() {
                    for pool in &pools {
                        pool.set_live(port, live);
                    }
                }
            }
            Err(RecvError::Lagged(n)) => {
                warn!(service = service.name(), skipped = n, "proxy lagged behind replica events");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    pool: Arc<PortPool>,
    service: String,
    token: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (inbound, peer) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                if !accept_failed(&service, &e, &token).await {
                    break;
                }
                continue;
            }
        };
        let Some(port) = pool.next() else {
            continue;
        };
        tokio::spawn(pipe(inbound, peer, port, service.clone(), token.clone()));
    }
    debug!(service = %service, "proxy listener closed");
}

/// Log the error and wait before the next accept. `false` once cancelled.
async fn accept_failed(service: &str, error: &std::io::Error, token: &CancellationToken) -> bool {
    warn!(service, error = %error, "accept failed");
    sleep_or_cancel(ACCEPT_RETRY_DELAY, token).await
}

async fn pipe(
    mut inbound: TcpStream,
    peer: SocketAddr,
    port: u16,
    service: String,
    token: CancellationToken,
) {
    let mut outbound = match TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(service = %service, port, %peer, error = %e, "backend unavailable, dropping connection");
            return;
        }
    };
    let _ = inbound.set_nodelay(true);
    let _ = outbound.set_nodelay(true);

    tokio::select! {
        _ = token.cancelled() => {}
        result = tokio::io::copy_bidirectional(&mut inbound, &mut outbound) => {
            if let Err(e) = result {
                debug!(service = %service, port, error = %e, "proxied connection reset");
            }
        }
    }
}
