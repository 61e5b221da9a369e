//! Service discovery environment
//!
//! Every replica learns where the other services live through environment
//! variables derived from their bindings:
//!
//! - `SERVICE__<SERVICE>__HOST|PORT|PROTOCOL` (or `SERVICE__<SERVICE>__<BINDING>__*`)
//! - `<SERVICE>_SERVICE_HOST|PORT|PROTOCOL` (or `<SERVICE>_<BINDING>_SERVICE_*`)
//! - `CONNECTIONSTRING__<SERVICE>` (or `CONNECTIONSTRING__<SERVICE>__<BINDING>`)

use std::collections::BTreeMap;

use crate::model::{Binding, ServiceDescription};
use crate::service::Application;

const CONTAINER_HOST: &str = "host.docker.internal";

/// Where the replica receiving the environment runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnvTarget {
    Process,
    Container,
}

/// `my-api` -> `MY_API`
pub fn env_key(name: &str) -> String {
    name.to_uppercase().replace(['-', '.'], "_")
}

/// Discovery variables for one binding of service `service`.
pub fn binding_environment(
    service: &str,
    binding: &Binding,
    target: EnvTarget,
    env: &mut BTreeMap<String, String>,
) {
    let service_key = env_key(service);
    let (config_key, alias_key) = match &binding.name {
        Some(name) => {
            let binding_key = env_key(name);
            (
                format!("SERVICE__{}__{}", service_key, binding_key),
                format!("{}_{}_SERVICE", service_key, binding_key),
            )
        }
        None => (
            format!("SERVICE__{}", service_key),
            format!("{}_SERVICE", service_key),
        ),
    };

    if let Some(cs) = &binding.connection_string {
        let key = match &binding.name {
            Some(name) => format!("CONNECTIONSTRING__{}__{}", service_key, env_key(name)),
            None => format!("CONNECTIONSTRING__{}", service_key),
        };
        env.insert(key, cs.clone());
    }

    let Some(port) = binding.port else {
        return;
    };

    let host = match (target, binding.host()) {
        (EnvTarget::Container, "localhost" | "127.0.0.1") => CONTAINER_HOST,
        (_, host) => host,
    };
    let port = port.to_string();
    let protocol = binding.protocol();

    env.insert(format!("{}__HOST", config_key), host.to_string());
    env.insert(format!("{}__PORT", config_key), port.clone());
    env.insert(format!("{}__PROTOCOL", config_key), protocol.to_string());
    env.insert(format!("{}_HOST", alias_key), host.to_string());
    env.insert(format!("{}_PORT", alias_key), port);
    env.insert(format!("{}_PROTOCOL", alias_key), protocol.to_string());
}

/// Variables describing the replica's own bindings: `PORT`, `PORTS` and
/// `<BINDING>__PORT` for named bindings.
fn own_binding_environment(
    description: &ServiceDescription,
    ports: &[u16],
    target: EnvTarget,
    env: &mut BTreeMap<String, String>,
) {
    let exposed: Vec<(&Binding, u16)> = description
        .bindings
        .iter()
        .filter(|b| b.port.is_some())
        .zip(ports.iter().copied())
        .map(|(b, internal)| match target {
            EnvTarget::Process => (b, internal),
            EnvTarget::Container => (b, b.container_port.or(b.port).unwrap_or(80)),
        })
        .collect();

    let Some((_, first)) = exposed.first() else {
        return;
    };
    env.insert("PORT".into(), first.to_string());
    env.insert(
        "PORTS".into(),
        exposed
            .iter()
            .map(|(_, p)| p.to_string())
            .collect::<Vec<_>>()
            .join(";"),
    );
    for (binding, port) in &exposed {
        if let Some(name) = &binding.name {
            env.insert(format!("{}__PORT", env_key(name)), port.to_string());
        }
    }
}

/// Full environment for one replica of `service`.
///
/// Discovery variables for every other service come first, then the
/// replica's identity and port variables, then the service's own
/// configuration entries, which win on conflict.
pub fn replica_environment(
    app: &Application,
    service: &ServiceDescription,
    replica: &str,
    ports: &[u16],
    target: EnvTarget,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();

    for (name, other) in app.services() {
        if name == &service.name {
            continue;
        }
        for binding in &other.description().bindings {
            binding_environment(name, binding, target, &mut env);
        }
    }

    env.insert("APP_INSTANCE".into(), replica.to_string());
    own_binding_environment(service, ports, target, &mut env);

    for entry in &service.configuration {
        env.insert(entry.name.clone(), entry.value.clone());
    }

    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RunInfo;

    fn exe(name: &str) -> ServiceDescription {
        ServiceDescription::new(
            name,
            RunInfo::Process {
                executable: name.into(),
                working_dir: None,
                args: vec![],
            },
        )
    }

    fn app() -> Application {
        Application::new(
            "test",
            "/tmp",
            vec![
                exe("frontend")
                    .with_binding(Binding {
                        port: Some(8080),
                        ..Default::default()
                    })
                    .with_config("LOG_LEVEL", "debug"),
                exe("order-api")
                    .with_binding(Binding {
                        port: Some(5000),
                        protocol: Some("https".into()),
                        ..Default::default()
                    })
                    .with_binding(Binding {
                        name: Some("grpc".into()),
                        port: Some(5001),
                        ..Default::default()
                    }),
                ServiceDescription::new("db", RunInfo::External).with_binding(Binding {
                    connection_string: Some("Server=localhost;Database=shop".into()),
                    ..Default::default()
                }),
            ],
            vec![],
        )
    }

    #[test]
    fn test_default_binding_variables() {
        let app = app();
        let desc = app.service("frontend").unwrap().description().clone();
        let env = replica_environment(&app, &desc, "frontend_abc", &[8080], EnvTarget::Process);

        assert_eq!(env["SERVICE__ORDER_API__HOST"], "localhost");
        assert_eq!(env["SERVICE__ORDER_API__PORT"], "5000");
        assert_eq!(env["SERVICE__ORDER_API__PROTOCOL"], "https");
        assert_eq!(env["ORDER_API_SERVICE_HOST"], "localhost");
        assert_eq!(env["ORDER_API_SERVICE_PORT"], "5000");
        assert_eq!(env["ORDER_API_SERVICE_PROTOCOL"], "https");
    }

    #[test]
    fn test_named_binding_variables() {
        let app = app();
        let desc = app.service("frontend").unwrap().description().clone();
        let env = replica_environment(&app, &desc, "frontend_abc", &[8080], EnvTarget::Process);

        assert_eq!(env["SERVICE__ORDER_API__GRPC__PORT"], "5001");
        assert_eq!(env["SERVICE__ORDER_API__GRPC__PROTOCOL"], "http");
        assert_eq!(env["ORDER_API_GRPC_SERVICE_PORT"], "5001");
    }

    #[test]
    fn test_connection_string_and_no_self_discovery() {
        let app = app();
        let desc = app.service("frontend").unwrap().description().clone();
        let env = replica_environment(&app, &desc, "frontend_abc", &[8080], EnvTarget::Process);

        assert_eq!(
            env["CONNECTIONSTRING__DB"],
            "Server=localhost;Database=shop"
        );
        assert!(!env.contains_key("SERVICE__DB__PORT"));
        assert!(!env.contains_key("SERVICE__FRONTEND__PORT"));
        assert_eq!(env["LOG_LEVEL"], "debug");
        assert_eq!(env["APP_INSTANCE"], "frontend_abc");
    }

    #[test]
    fn test_own_ports_use_internal_ports() {
        let app = app();
        let desc = app.service("order-api").unwrap().description().clone();
        let env = replica_environment(
            &app,
            &desc,
            "order-api_1",
            &[41000, 41001],
            EnvTarget::Process,
        );
        assert_eq!(env["PORT"], "41000");
        assert_eq!(env["PORTS"], "41000;41001");
        assert_eq!(env["GRPC__PORT"], "41001");
    }

    #[test]
    fn test_container_target_rewrites_host_and_port() {
        let app = app();
        let desc = app.service("order-api").unwrap().description().clone();
        let env = replica_environment(
            &app,
            &desc,
            "order-api_1",
            &[41000, 41001],
            EnvTarget::Container,
        );
        assert_eq!(env["SERVICE__FRONTEND__HOST"], "host.docker.internal");
        assert_eq!(env["PORT"], "5000");
        assert_eq!(env["GRPC__PORT"], "5001");
    }

    #[test]
    fn test_service_without_bindings_gets_no_port() {
        let app = app();
        let desc = app.service("db").unwrap().description().clone();
        let env = replica_environment(&app, &desc, "db_1", &[], EnvTarget::Process);
        assert!(!env.contains_key("PORT"));
    }
}
