//! Replica model
//!
//! A replica is one launch attempt of a service. Its status object is shared
//! (`Arc`) between the owning supervisor, the service's replica map and any
//! event subscriber; the supervisor keeps mutating it while the attempt runs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use crate::model::{ReplicaName, ReplicaState, ServiceName};

/// Fresh replica name: service name plus a random suffix.
pub fn replica_name(service: &str) -> ReplicaName {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", service, &id[..8])
}

#[derive(Debug, Default)]
pub struct ProcessDetails {
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub environment: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
pub struct ContainerDetails {
    pub container_id: Option<String>,
    pub docker_command: Option<String>,
    pub exit_code: Option<i64>,
    pub environment: BTreeMap<String, String>,
}

/// Backend-specific fields, mutated by the owning supervisor.
#[derive(Debug)]
pub enum ReplicaDetails {
    Process(Mutex<ProcessDetails>),
    Container(Mutex<ContainerDetails>),
}

#[derive(Debug)]
pub struct ReplicaStatus {
    name: ReplicaName,
    service: ServiceName,
    state: AtomicU8,
    ports: Mutex<Vec<u16>>,
    details: ReplicaDetails,
}

impl ReplicaStatus {
    pub fn process(service: &str) -> Self {
        Self::new(service, ReplicaDetails::Process(Mutex::default()))
    }

    pub fn container(service: &str) -> Self {
        Self::new(service, ReplicaDetails::Container(Mutex::default()))
    }

    fn new(service: &str, details: ReplicaDetails) -> Self {
        Self {
            name: replica_name(service),
            service: service.to_string(),
            state: AtomicU8::new(ReplicaState::Added.as_u8()),
            ports: Mutex::new(Vec::new()),
            details,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the owning service.
    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn state(&self) -> ReplicaState {
        ReplicaState::from_u8(self.state.load(Ordering::Acquire)).unwrap_or(ReplicaState::Removed)
    }

    /// Move to `next` if it lies strictly after the current state.
    /// Returns false (and leaves the state alone) otherwise.
    pub(crate) fn advance(&self, next: ReplicaState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if next.as_u8() <= current {
                return false;
            }
            match self.state.compare_exchange(
                current,
                next.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn ports(&self) -> Vec<u16> {
        self.ports.lock().clone()
    }

    pub fn set_ports(&self, ports: Vec<u16>) {
        *self.ports.lock() = ports;
    }

    pub fn details(&self) -> &ReplicaDetails {
        &self.details
    }

    pub fn pid(&self) -> Option<u32> {
        match &self.details {
            ReplicaDetails::Process(p) => p.lock().pid,
            ReplicaDetails::Container(_) => None,
        }
    }

    pub fn container_id(&self) -> Option<String> {
        match &self.details {
            ReplicaDetails::Process(_) => None,
            ReplicaDetails::Container(c) => c.lock().container_id.clone(),
        }
    }

    pub fn update_process(&self, f: impl FnOnce(&mut ProcessDetails)) {
        if let ReplicaDetails::Process(p) = &self.details {
            f(&mut p.lock());
        }
    }

    pub fn update_container(&self, f: impl FnOnce(&mut ContainerDetails)) {
        if let ReplicaDetails::Container(c) = &self.details {
            f(&mut c.lock());
        }
    }

    pub fn snapshot(&self) -> ReplicaSnapshot {
        let mut snapshot = ReplicaSnapshot {
            name: self.name.clone(),
            state: self.state(),
            ports: self.ports(),
            pid: None,
            exit_code: None,
            environment: None,
            container_id: None,
            docker_command: None,
        };
        match &self.details {
            ReplicaDetails::Process(p) => {
                let p = p.lock();
                snapshot.pid = p.pid;
                snapshot.exit_code = p.exit_code.map(i64::from);
                snapshot.environment = Some(p.environment.clone());
            }
            ReplicaDetails::Container(c) => {
                let c = c.lock();
                snapshot.container_id = c.container_id.clone();
                snapshot.docker_command = c.docker_command.clone();
                snapshot.exit_code = c.exit_code;
                snapshot.environment = Some(c.environment.clone());
            }
        }
        snapshot
    }
}

/// Serializable view of a replica for dashboards and API consumers.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSnapshot {
    pub name: ReplicaName,
    pub state: ReplicaState,
    pub ports: Vec<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_command: Option<String>,
}

/// One lifecycle transition. `replica` is the live status object, so fields
/// such as `pid` may already reflect a later state by the time it is read.
#[derive(Clone, Debug)]
pub struct ReplicaEvent {
    pub state: ReplicaState,
    pub replica: Arc<ReplicaStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replica_names_are_unique_and_prefixed() {
        let a = ReplicaStatus::process("api");
        let b = ReplicaStatus::process("api");
        assert!(a.name().starts_with("api_"));
        assert_ne!(a.name(), b.name());
        assert_eq!(a.service(), "api");
    }

    #[test]
    fn test_state_only_moves_forward() {
        let r = ReplicaStatus::process("api");
        assert_eq!(r.state(), ReplicaState::Added);
        assert!(r.advance(ReplicaState::Started));
        assert!(!r.advance(ReplicaState::Added));
        assert!(!r.advance(ReplicaState::Started));
        assert!(r.advance(ReplicaState::Stopped));
        assert!(!r.advance(ReplicaState::Healthy));
        assert!(r.advance(ReplicaState::Removed));
        assert_eq!(r.state(), ReplicaState::Removed);
    }

    #[test]
    fn test_removed_reachable_straight_from_added() {
        let r = ReplicaStatus::container("redis");
        assert!(r.advance(ReplicaState::Removed));
    }

    #[test]
    fn test_process_snapshot_shape() {
        let r = ReplicaStatus::process("api");
        r.set_ports(vec![5001]);
        r.update_process(|p| {
            p.pid = Some(4242);
            p.environment.insert("PORT".into(), "5001".into());
        });
        let json = serde_json::to_value(r.snapshot()).unwrap();
        assert_eq!(json["name"], r.name());
        assert_eq!(json["ports"], serde_json::json!([5001]));
        assert_eq!(json["pid"], 4242);
        assert_eq!(json["environment"]["PORT"], "5001");
        assert!(json.get("containerId").is_none());
    }

    #[test]
    fn test_container_updates_ignore_process_replicas() {
        let r = ReplicaStatus::process("api");
        r.update_container(|c| c.container_id = Some("abc".into()));
        assert_eq!(r.container_id(), None);
    }
}
