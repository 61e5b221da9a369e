//! Runtime service graph
//!
//! `Service` wraps one immutable [`ServiceDescription`] with the mutable
//! runtime state the supervisors maintain. All of it is safe to share across
//! tasks: replicas live in a concurrent map keyed by replica name and the
//! port map is written once, before any replica starts.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use serde::Serialize;

use crate::bus::EventBus;
use crate::ingress::IngressDescription;
use crate::model::{
    ReplicaName, ReplicaState, ServiceDescription, ServiceName, ServiceState, ServiceType,
    derive_service_state,
};
use crate::replica::{ReplicaEvent, ReplicaSnapshot, ReplicaStatus};
use crate::state::LogLine;

/// External binding port -> internal ports, one per replica slot.
pub type PortMap = BTreeMap<u16, Vec<u16>>;

#[derive(Debug)]
pub struct Service {
    description: ServiceDescription,
    restarts: AtomicU64,
    replicas: DashMap<ReplicaName, Arc<ReplicaStatus>>,
    port_map: OnceLock<PortMap>,
    replica_events: EventBus<ReplicaEvent>,
    logs: EventBus<LogLine>,
}

impl Service {
    pub fn new(description: ServiceDescription) -> Self {
        Self {
            description,
            restarts: AtomicU64::new(0),
            replicas: DashMap::new(),
            port_map: OnceLock::new(),
            replica_events: EventBus::default(),
            logs: EventBus::default(),
        }
    }

    pub fn description(&self) -> &ServiceDescription {
        &self.description
    }

    pub fn name(&self) -> &str {
        &self.description.name
    }

    pub fn service_type(&self) -> ServiceType {
        self.description.run_info.service_type()
    }

    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    pub fn record_restart(&self) -> u64 {
        self.restarts.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn replica_events(&self) -> &EventBus<ReplicaEvent> {
        &self.replica_events
    }

    pub fn logs(&self) -> &EventBus<LogLine> {
        &self.logs
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    pub fn replica(&self, name: &str) -> Option<Arc<ReplicaStatus>> {
        self.replicas.get(name).map(|r| r.value().clone())
    }

    pub fn replicas(&self) -> Vec<Arc<ReplicaStatus>> {
        self.replicas.iter().map(|r| r.value().clone()).collect()
    }

    /// Derived from the current replica states.
    pub fn state(&self) -> ServiceState {
        derive_service_state(self.replicas.iter().map(|r| r.value().state()))
    }

    pub fn port_map(&self) -> Option<&PortMap> {
        self.port_map.get()
    }

    /// Install the port map. Only the first call wins; later calls get their
    /// map back as the error.
    pub fn set_port_map(&self, map: PortMap) -> Result<(), PortMap> {
        self.port_map.set(map)
    }

    /// Internal ports for replica slot `slot`, in binding order. Bindings
    /// without an external port contribute nothing.
    pub fn ports_for_slot(&self, slot: usize) -> Vec<u16> {
        let Some(map) = self.port_map.get() else {
            return Vec::new();
        };
        self.description
            .bindings
            .iter()
            .filter_map(|b| b.port)
            .filter_map(|port| map.get(&port).and_then(|ports| ports.get(slot)).copied())
            .collect()
    }

    /// Register a replica for a new launch attempt and announce it as `Added`.
    /// Only the owning supervisor calls this.
    pub fn add_replica(&self, replica: Arc<ReplicaStatus>) {
        self.replicas
            .insert(replica.name().to_string(), replica.clone());
        self.replica_events.publish(ReplicaEvent {
            state: ReplicaState::Added,
            replica,
        });
    }

    /// Move a replica forward and publish the transition. Backwards or
    /// repeated transitions are ignored and publish nothing.
    pub fn transition(&self, replica: &Arc<ReplicaStatus>, state: ReplicaState) -> bool {
        if !replica.advance(state) {
            return false;
        }
        self.replica_events.publish(ReplicaEvent {
            state,
            replica: replica.clone(),
        });
        true
    }

    /// Drop the replica from the map, then announce `Removed`.
    pub fn remove_replica(&self, replica: &Arc<ReplicaStatus>) {
        self.replicas.remove(replica.name());
        self.transition(replica, ReplicaState::Removed);
    }

    pub fn snapshot(&self) -> ServiceSnapshot {
        ServiceSnapshot {
            service_type: self.service_type(),
            description: self.description.clone(),
            restarts: self.restarts(),
            state: self.state(),
            replicas: self
                .replicas
                .iter()
                .map(|r| (r.key().clone(), r.value().snapshot()))
                .collect(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSnapshot {
    pub service_type: ServiceType,
    pub description: ServiceDescription,
    pub restarts: u64,
    pub state: ServiceState,
    pub replicas: BTreeMap<ReplicaName, ReplicaSnapshot>,
}

/// The whole set of services started together.
#[derive(Debug)]
pub struct Application {
    name: String,
    context_dir: PathBuf,
    services: BTreeMap<ServiceName, Arc<Service>>,
    ingress: Vec<IngressDescription>,
}

impl Application {
    pub fn new(
        name: impl Into<String>,
        context_dir: impl Into<PathBuf>,
        services: Vec<ServiceDescription>,
        ingress: Vec<IngressDescription>,
    ) -> Self {
        Self {
            name: name.into(),
            context_dir: context_dir.into(),
            services: services
                .into_iter()
                .map(|d| (d.name.clone(), Arc::new(Service::new(d))))
                .collect(),
            ingress,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory relative paths in the description resolve against.
    pub fn context_dir(&self) -> &Path {
        &self.context_dir
    }

    pub fn services(&self) -> &BTreeMap<ServiceName, Arc<Service>> {
        &self.services
    }

    pub fn service(&self, name: &str) -> Option<&Arc<Service>> {
        self.services.get(name)
    }

    pub fn ingress(&self) -> &[IngressDescription] {
        &self.ingress
    }

    pub fn snapshot(&self) -> ApplicationSnapshot {
        ApplicationSnapshot {
            name: self.name.clone(),
            services: self
                .services
                .iter()
                .map(|(name, svc)| (name.clone(), svc.snapshot()))
                .collect(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ApplicationSnapshot {
    pub name: String,
    pub services: BTreeMap<ServiceName, ServiceSnapshot>,
}
