#![cfg(feature = "docker")]

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding};
use futures_util::StreamExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tye_core::backoff::{RetryError, retry, sleep_or_cancel};
use tye_core::env::{EnvTarget, replica_environment};
use tye_core::error::LaunchError;
use tye_core::model::{ReplicaState, RunInfo, ServiceType};
use tye_core::replica::ReplicaStatus;
use tye_core::service::{Application, Service};
use tye_core::state::{LogLine, LogStream};
use tye_core::supervisor::{HostOptions, Supervisor};

use super::process::publish_system;

/// Runs container services through the local Docker daemon.
pub struct DockerSupervisor {
    options: HostOptions,
}

impl DockerSupervisor {
    pub fn new(options: HostOptions) -> Self {
        Self { options }
    }

    /// Reach the daemon, retrying with capped exponential backoff.
    async fn connect(&self, token: &CancellationToken) -> Result<Docker, RetryError<String>> {
        let policy = self.options.dependency_backoff;
        retry(policy, self.options.dependency_retries, token, |_| async {
            let client = Docker::connect_with_local_defaults()
                .map_err(|e| format!("failed to connect to Docker: {}", e))?;
            client
                .ping()
                .await
                .map_err(|e| format!("Docker ping failed: {}", e))?;
            Ok::<_, String>(client)
        })
        .await
    }
}

#[async_trait]
impl Supervisor for DockerSupervisor {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn owns(&self, service_type: ServiceType) -> bool {
        service_type == ServiceType::Container
    }

    async fn run(&self, app: Arc<Application>, token: CancellationToken) {
        let owned: Vec<Arc<Service>> = app
            .services()
            .values()
            .filter(|s| self.owns(s.service_type()))
            .cloned()
            .collect();
        if owned.is_empty() {
            return;
        }
        if !self.options.docker {
            warn!(count = owned.len(), "container services skipped, docker disabled");
            return;
        }

        let client = match self.connect(&token).await {
            Ok(client) => client,
            Err(RetryError::Cancelled) => return,
            Err(RetryError::Exhausted { attempts, last }) => {
                error!(attempts, error = %last, "container runtime unavailable, container services will not run");
                for svc in &owned {
                    publish_system(svc, svc.name(), format!("[error] {}", last));
                }
                return;
            }
        };

        let mut slots = JoinSet::new();
        for service in owned {
            for slot in 0..service.description().replicas {
                slots.spawn(run_slot(
                    client.clone(),
                    app.clone(),
                    service.clone(),
                    slot,
                    self.options.clone(),
                    token.clone(),
                ));
            }
        }
        while slots.join_next().await.is_some() {}
    }
}

async fn run_slot(
    client: Docker,
    app: Arc<Application>,
    service: Arc<Service>,
    slot: usize,
    options: HostOptions,
    token: CancellationToken,
) {
    let RunInfo::Container { image, args } = &service.description().run_info else {
        return;
    };
    let mut failures: u32 = 0;

    while !token.is_cancelled() {
        let ports = service.ports_for_slot(slot);
        let replica = Arc::new(ReplicaStatus::container(service.name()));
        replica.set_ports(ports.clone());
        let env = replica_environment(
            &app,
            service.description(),
            replica.name(),
            &ports,
            EnvTarget::Container,
        );
        let mappings = port_mappings(&service, &ports);
        let shown = docker_command(replica.name(), image, args, &env, &mappings);
        replica.update_container(|c| {
            c.environment = env.clone();
            c.docker_command = Some(shown.clone());
        });
        service.add_replica(replica.clone());
        debug!(service = service.name(), command = %shown, "launching container");

        let launching = launch(&client, &replica, image, args, &env, &mappings);
        let container_id = match launch_or_cancel(&client, replica.name(), &token, launching).await {
            None => {
                debug!(service = service.name(), replica = replica.name(), "launch abandoned for shutdown");
                service.remove_replica(&replica);
                break;
            }
            Some(Ok(id)) => id,
            Some(Err(e)) => {
                warn!(service = service.name(), replica = replica.name(), error = %e, "container launch failed");
                publish_system(&service, replica.name(), format!("[error] {}", e));
                service.remove_replica(&replica);
                let delay = options.launch_backoff.next(failures);
                failures = failures.saturating_add(1);
                if !sleep_or_cancel(delay, &token).await {
                    break;
                }
                continue;
            }
        };
        failures = 0;

        replica.update_container(|c| c.container_id = Some(container_id.clone()));
        service.transition(&replica, ReplicaState::Started);
        info!(service = service.name(), replica = replica.name(), container = %short_id(&container_id), "container started");

        tokio::spawn(pump_logs(
            client.clone(),
            container_id.clone(),
            service.clone(),
            replica.name().to_string(),
            token.clone(),
        ));

        let code = wait_or_stop(&client, &container_id, &token, options.grace_period).await;
        replica.update_container(|c| c.exit_code = code);
        service.transition(&replica, ReplicaState::Stopped);

        discard(&client, &container_id).await;
        service.remove_replica(&replica);

        if token.is_cancelled() {
            debug!(service = service.name(), replica = replica.name(), "container stopped for shutdown");
            break;
        }

        let restarts = service.record_restart();
        warn!(service = service.name(), replica = replica.name(), exit_code = code, restarts, "container exited, restarting");
        publish_system(&service, replica.name(), format!("container exited with code: {:?}", code));
        if !sleep_or_cancel(options.restart_delay, &token).await {
            break;
        }
    }
}

/// `(host port, container port)` per exposed binding.
fn port_mappings(service: &Service, ports: &[u16]) -> Vec<(u16, u16)> {
    service
        .description()
        .bindings
        .iter()
        .filter(|b| b.port.is_some())
        .zip(ports.iter().copied())
        .map(|(b, host)| (host, b.container_port.or(b.port).unwrap_or(80)))
        .collect()
}

/// Equivalent CLI invocation, kept on the replica for display.
fn docker_command(
    name: &str,
    image: &str,
    args: &[String],
    env: &BTreeMap<String, String>,
    mappings: &[(u16, u16)],
) -> String {
    let mut parts = vec!["docker run -d".to_string(), format!("--name {}", name)];
    for (host, container) in mappings {
        parts.push(format!("-p {}:{}", host, container));
    }
    for key in env.keys() {
        parts.push(format!("-e {}", key));
    }
    parts.push(image.to_string());
    parts.extend(args.iter().cloned());
    parts.join(" ")
}

async fn ensure_image(client: &Docker, image: &str) -> Result<(), LaunchError> {
    if client.inspect_image(image).await.is_ok() {
        return Ok(());
    }
    info!(image, "pulling image");
    let options = CreateImageOptions {
        from_image: image.to_string(),
        ..Default::default()
    };
    let mut pull = client.create_image(Some(options), None, None);
    while let Some(progress) = pull.next().await {
        progress.map_err(|e| LaunchError::Container(format!("failed to pull {}: {}", image, e)))?;
    }
    Ok(())
}

async fn launch(
    client: &Docker,
    replica: &ReplicaStatus,
    image: &str,
    args: &[String],
    env: &BTreeMap<String, String>,
    mappings: &[(u16, u16)],
) -> Result<String, LaunchError> {
    ensure_image(client, image).await?;

    let mut exposed = HashMap::new();
    let mut bindings = HashMap::new();
    for (host, container) in mappings {
        let key = format!("{}/tcp", container);
        exposed.insert(key.clone(), HashMap::new());
        bindings.insert(
            key,
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".into()),
                host_port: Some(host.to_string()),
            }]),
        );
    }

    let config = Config {
        image: Some(image.to_string()),
        cmd: if args.is_empty() { None } else { Some(args.to_vec()) },
        env: Some(env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()),
        exposed_ports: Some(exposed),
        host_config: Some(HostConfig {
            port_bindings: Some(bindings),
            extra_hosts: Some(vec!["host.docker.internal:host-gateway".into()]),
            ..Default::default()
        }),
        ..Default::default()
    };

    let create = CreateContainerOptions {
        name: replica.name().to_string(),
        platform: None,
    };
    let response = client
        .create_container(Some(create), config)
        .await
        .map_err(|e| LaunchError::Container(format!("failed to create container: {}", e)))?;

    if let Err(e) = client
        .start_container(&response.id, None::<StartContainerOptions<String>>)
        .await
    {
        discard(client, &response.id).await;
        return Err(LaunchError::Container(format!("failed to start container: {}", e)));
    }

    Ok(response.id)
}

/// Race a launch against shutdown. On cancellation any container already
/// created under `name` is force-removed and `None` is returned.
async fn launch_or_cancel<F>(
    client: &Docker,
    name: &str,
    token: &CancellationToken,
    launching: F,
) -> Option<Result<String, LaunchError>>
where
    F: Future<Output = Result<String, LaunchError>>,
{
    tokio::select! {
        result = launching => Some(result),
        _ = token.cancelled() => {
            discard(client, name).await;
            None
        }
    }
}

/// Force-remove a container by id or name, ignoring a missing one.
async fn discard(client: &Docker, container: &str) {
    let remove = RemoveContainerOptions {
        force: true,
        ..Default::default()
    };
    if let Err(e) = client.remove_container(container, Some(remove)).await {
        debug!(container = %short_id(container), error = %e, "container removal failed");
    }
}

/// Wait for the container to exit; on cancellation stop it, giving it
/// `grace` before the daemon kills it.
async fn wait_or_stop(
    client: &Docker,
    id: &str,
    token: &CancellationToken,
    grace: Duration,
) -> Option<i64> {
    let mut wait = client.wait_container(id, None::<WaitContainerOptions<String>>);
    tokio::select! {
        result = wait.next() => match result {
            Some(Ok(response)) => Some(response.status_code),
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Some(code),
            Some(Err(e)) => {
                warn!(container = %short_id(id), error = %e, "lost track of container");
                None
            }
            None => None,
        },
        _ = token.cancelled() => {
            let options = StopContainerOptions { t: grace.as_secs().max(1) as i64 };
            if let Err(e) = client.stop_container(id, Some(options)).await {
                debug!(container = %short_id(id), error = %e, "stop failed");
            }
            client
                .inspect_container(id, None)
                .await
                .ok()
                .and_then(|c| c.state)
                .and_then(|s| s.exit_code)
        }
    }
}

async fn pump_logs(
    client: Docker,
    id: String,
    service: Arc<Service>,
    replica: String,
    token: CancellationToken,
) {
    let options = LogsOptions::<String> {
        follow: true,
        stdout: true,
        stderr: true,
        ..Default::default()
    };
    let mut stream = client.logs(&id, Some(options));
    loop {
        let next = tokio::select! {
            _ = token.cancelled() => break,
            next = stream.next() => next,
        };
        let (kind, message) = match next {
            Some(Ok(LogOutput::StdErr { message })) => (LogStream::Stderr, message),
            Some(Ok(LogOutput::StdOut { message } | LogOutput::Console { message })) => {
                (LogStream::Stdout, message)
            }
            Some(Ok(LogOutput::StdIn { .. })) => continue,
            Some(Err(_)) | None => break,
        };
        for line in String::from_utf8_lossy(&message).lines() {
            service
                .logs()
                .publish(LogLine::new(replica.as_str(), kind, line));
        }
    }
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap as Map;
    use tye_core::model::{Binding, ServiceDescription};

    fn redis() -> Service {
        Service::new(
            ServiceDescription::new(
                "redis",
                RunInfo::Container {
                    image: "redis:7".into(),
                    args: vec!["--appendonly".into(), "yes".into()],
                },
            )
            .with_binding(Binding {
                port: Some(6379),
                ..Default::default()
            })
            .with_binding(Binding {
                name: Some("admin".into()),
                port: Some(8001),
                container_port: Some(80),
                ..Default::default()
            }),
        )
    }

    #[test]
    fn test_port_mappings_use_container_ports() {
        let svc = redis();
        assert_eq!(
            port_mappings(&svc, &[40000, 40001]),
            vec![(40000, 6379), (40001, 80)]
        );
    }

    #[test]
    fn test_docker_command_rendering() {
        let env = Map::from([("PORT".to_string(), "6379".to_string())]);
        let cmd = docker_command(
            "redis_abcd1234",
            "redis:7",
            &["--appendonly".into(), "yes".into()],
            &env,
            &[(40000, 6379)],
        );
        assert_eq!(
            cmd,
            "docker run -d --name redis_abcd1234 -p 40000:6379 -e PORT redis:7 --appendonly yes"
        );
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0123456789abcdef"), "0123456789ab");
        assert_eq!(short_id("abc"), "abc");
    }

    #[cfg(unix)]
    fn unreachable_client() -> Docker {
        Docker::connect_with_unix("/nonexistent/tye-test.sock", 1, bollard::API_DEFAULT_VERSION)
            .unwrap()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_gives_way_to_shutdown() {
        let client = unreachable_client();
        let token = CancellationToken::new();
        token.cancel();

        let stuck = std::future::pending::<Result<String, LaunchError>>();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            launch_or_cancel(&client, "redis_abcd1234", &token, stuck),
        )
        .await
        .unwrap();
        assert!(result.is_none());

        let live = CancellationToken::new();
        let ready = async { Ok::<_, LaunchError>("0123456789abcdef".to_string()) };
        let result = launch_or_cancel(&client, "redis_abcd1234", &live, ready).await;
        assert_eq!(result.unwrap().unwrap(), "0123456789abcdef");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unreachable_daemon_fails_container_services_only() {
        // SAFETY: no other test in this binary reads DOCKER_HOST.
        unsafe { std::env::set_var("DOCKER_HOST", "unix:///nonexistent/tye-test.sock") };

        let worker = ServiceDescription::new(
            "worker",
            RunInfo::Process {
                executable: "sh".into(),
                working_dir: None,
                args: vec!["-c".into(), "sleep 30".into()],
            },
        );
        let cache = ServiceDescription::new(
            "cache",
            RunInfo::Container {
                image: "redis:7".into(),
                args: vec![],
            },
        );
        let app = Arc::new(Application::new(
            "test",
            std::env::temp_dir(),
            vec![redis().description().clone(), cache, worker],
            vec![],
        ));
        let mut container_logs: Vec<_> = ["redis", "cache"]
            .iter()
            .map(|name| app.service(name).unwrap().logs().subscribe())
            .collect();
        let worker = app.service("worker").unwrap().clone();
        let mut worker_logs = worker.logs().subscribe();

        let options = HostOptions {
            dependency_retries: 2,
            dependency_backoff: tye_core::backoff::BackoffPolicy::fixed(Duration::from_millis(1)),
            ..HostOptions::default()
        };
        let sup = DockerSupervisor::new(options);
        tokio::time::timeout(Duration::from_secs(10), sup.run(app.clone(), CancellationToken::new()))
            .await
            .unwrap();

        for logs in &mut container_logs {
            let line = logs.try_recv().unwrap();
            assert_eq!(line.stream, LogStream::System);
            assert!(line.text.starts_with("[error]"), "{}", line.text);
        }
        for name in ["redis", "cache"] {
            assert_eq!(app.service(name).unwrap().replica_count(), 0);
        }
        assert!(worker_logs.try_recv().is_err());
        assert_eq!(worker.replica_count(), 0);
        assert_eq!(worker.restarts(), 0);
    }
}
