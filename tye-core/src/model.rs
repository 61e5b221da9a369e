use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub type ServiceName = String;
pub type ReplicaName = String;

/// How a service is launched.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RunInfo {
    /// A plain executable spawned as an OS process.
    Process {
        executable: PathBuf,
        working_dir: Option<PathBuf>,
        args: Vec<String>,
    },
    /// A cargo project, optionally built before every launch cycle.
    Project {
        project_path: PathBuf,
        args: Vec<String>,
        build: bool,
    },
    /// A container image run through the container runtime.
    Container { image: String, args: Vec<String> },
    /// Not managed locally; only contributes bindings for discovery.
    External,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Executable,
    Project,
    Container,
    External,
}

impl RunInfo {
    pub fn service_type(&self) -> ServiceType {
        match self {
            RunInfo::Process { .. } => ServiceType::Executable,
            RunInfo::Project { .. } => ServiceType::Project,
            RunInfo::Container { .. } => ServiceType::Container,
            RunInfo::External => ServiceType::External,
        }
    }
}

/// A network endpoint exposed by a service.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Binding {
    pub name: Option<String>,
    pub port: Option<u16>,
    pub container_port: Option<u16>,
    pub protocol: Option<String>,
    pub host: Option<String>,
    pub connection_string: Option<String>,
}

impl Binding {
    pub fn protocol(&self) -> &str {
        self.protocol.as_deref().unwrap_or("http")
    }

    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or("localhost")
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub name: String,
    pub value: String,
}

/// Desired state of one service. Never mutated once the application is built.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDescription {
    pub name: ServiceName,
    pub run_info: RunInfo,
    pub replicas: usize,
    pub bindings: Vec<Binding>,
    pub configuration: Vec<ConfigEntry>,
}

impl ServiceDescription {
    pub fn new(name: impl Into<ServiceName>, run_info: RunInfo) -> Self {
        Self {
            name: name.into(),
            run_info,
            replicas: 1,
            bindings: Vec::new(),
            configuration: Vec::new(),
        }
    }

    pub fn with_replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn with_binding(mut self, binding: Binding) -> Self {
        self.bindings.push(binding);
        self
    }

    pub fn with_config(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.configuration.push(ConfigEntry {
            name: name.into(),
            value: value.into(),
        });
        self
    }
}

/// Lifecycle states of a single replica, in the order they are entered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaState {
    Added,
    Started,
    Ready,
    Healthy,
    Stopped,
    Removed,
}

impl ReplicaState {
    /// Whether the backing process or container is still up.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            ReplicaState::Added | ReplicaState::Started | ReplicaState::Ready | ReplicaState::Healthy
        )
    }

    /// `Started`, `Ready` or `Healthy`.
    pub fn is_running(self) -> bool {
        matches!(
            self,
            ReplicaState::Started | ReplicaState::Ready | ReplicaState::Healthy
        )
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => ReplicaState::Added,
            1 => ReplicaState::Started,
            2 => ReplicaState::Ready,
            3 => ReplicaState::Healthy,
            4 => ReplicaState::Stopped,
            5 => ReplicaState::Removed,
            _ => return None,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Unknown,
    Starting,
    Started,
    Degraded,
    Failed,
    Stopped,
}

/// Aggregate state of a service, derived from its replicas' states.
pub fn derive_service_state<I>(states: I) -> ServiceState
where
    I: IntoIterator<Item = ReplicaState>,
{
    let states: Vec<ReplicaState> = states.into_iter().collect();
    if states.is_empty() {
        return ServiceState::Unknown;
    }

    let all = |s: ReplicaState| states.iter().all(|x| *x == s);
    if all(ReplicaState::Removed) {
        return ServiceState::Failed;
    }
    if all(ReplicaState::Stopped) {
        return ServiceState::Stopped;
    }

    let any_live = states.iter().any(|s| s.is_live());
    let any_down = states
        .iter()
        .any(|s| matches!(s, ReplicaState::Stopped | ReplicaState::Removed));
    if any_down {
        return if any_live {
            ServiceState::Degraded
        } else {
            ServiceState::Stopped
        };
    }

    if states.iter().all(|s| s.is_running()) {
        ServiceState::Started
    } else {
        ServiceState::Starting
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ReplicaState::*;

    #[test]
    fn test_service_state_table() {
        assert_eq!(derive_service_state([Added]), ServiceState::Starting);
        assert_eq!(
            derive_service_state([Started, Ready, Healthy]),
            ServiceState::Started
        );
        assert_eq!(derive_service_state([Stopped, Started]), ServiceState::Degraded);
        assert_eq!(derive_service_state([Stopped, Stopped]), ServiceState::Stopped);
        assert_eq!(derive_service_state([]), ServiceState::Unknown);
        assert_eq!(derive_service_state([Removed, Removed]), ServiceState::Failed);
        assert_eq!(derive_service_state([Removed, Added]), ServiceState::Degraded);
    }

    #[test]
    fn test_service_state_is_order_independent() {
        assert_eq!(
            derive_service_state([Started, Stopped]),
            derive_service_state([Stopped, Started])
        );
        assert_eq!(derive_service_state([Added, Started]), ServiceState::Starting);
        assert_eq!(derive_service_state([Started, Added]), ServiceState::Starting);
    }

    #[test]
    fn test_mixed_down_replicas_without_live_ones() {
        assert_eq!(derive_service_state([Stopped, Removed]), ServiceState::Stopped);
    }

    #[test]
    fn test_service_type_follows_run_info() {
        let process = RunInfo::Process {
            executable: "server".into(),
            working_dir: None,
            args: vec![],
        };
        assert_eq!(process.service_type(), ServiceType::Executable);
        assert_eq!(RunInfo::External.service_type(), ServiceType::External);
        let image = RunInfo::Container {
            image: "redis".into(),
            args: vec![],
        };
        assert_eq!(image.service_type(), ServiceType::Container);
    }

    #[test]
    fn test_replica_state_roundtrips_through_u8() {
        for state in [Added, Started, Ready, Healthy, Stopped, Removed] {
            assert_eq!(ReplicaState::from_u8(state.as_u8()), Some(state));
        }
        assert_eq!(ReplicaState::from_u8(42), None);
    }

    #[test]
    fn test_binding_defaults() {
        let b = Binding::default();
        assert_eq!(b.protocol(), "http");
        assert_eq!(b.host(), "localhost");
    }
}
