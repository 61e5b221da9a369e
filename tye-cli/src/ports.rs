//! Port allocation
//!
//! The only writer of `Service::port_map`. Runs once, before the proxy binds
//! and before any replica starts.

use std::net::{Ipv4Addr, TcpListener};

use tracing::debug;

use tye_core::error::ProxyError;
use tye_core::model::ServiceType;
use tye_core::service::{Application, PortMap, Service};

/// Assign internal ports for every managed service in `app`.
pub fn allocate(app: &Application) -> Result<(), ProxyError> {
    for service in app.services().values() {
        if service.service_type() == ServiceType::External {
            continue;
        }
        let map = port_map_for(service)?;
        debug!(service = service.name(), ?map, "ports assigned");
        if service.set_port_map(map).is_err() {
            debug!(service = service.name(), "port map already assigned");
        }
    }
    Ok(())
}

fn port_map_for(service: &Service) -> Result<PortMap, ProxyError> {
    let replicas = service.description().replicas;
    let published: Vec<u16> = service
        .description()
        .bindings
        .iter()
        .filter_map(|b| b.port)
        .collect();

    if replicas == 1 {
        return Ok(published.into_iter().map(|p| (p, vec![p])).collect());
    }

    let mut reserved = reserve(published.len() * replicas)?.into_iter();
    Ok(published
        .into_iter()
        .map(|p| (p, reserved.by_ref().take(replicas).collect()))
        .collect())
}

/// Ask the OS for `count` distinct ephemeral ports. All sockets are held
/// until every port is known so the same port cannot come back twice.
fn reserve(count: usize) -> Result<Vec<u16>, ProxyError> {
    let mut held = Vec::with_capacity(count);
    for _ in 0..count {
        let listener =
            TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).map_err(ProxyError::NoFreePort)?;
        held.push(listener);
    }
    held.iter()
        .map(|l| l.local_addr().map(|a| a.port()))
        .collect::<Result<_, _>>()
        .map_err(ProxyError::NoFreePort)
}
