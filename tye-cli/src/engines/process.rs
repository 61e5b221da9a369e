use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tye_core::backoff::sleep_or_cancel;
use tye_core::env::{EnvTarget, replica_environment};
use tye_core::error::LaunchError;
use tye_core::model::{ReplicaState, RunInfo, ServiceType};
use tye_core::replica::ReplicaStatus;
use tye_core::service::{Application, Service};
use tye_core::state::{LogLine, LogStream};
use tye_core::supervisor::{HostOptions, Supervisor};

/// Runs executables and cargo projects as OS processes, one restart loop per
/// replica slot.
pub struct ProcessSupervisor {
    options: HostOptions,
}

impl ProcessSupervisor {
    pub fn new(options: HostOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Supervisor for ProcessSupervisor {
    fn name(&self) -> &'static str {
        "process"
    }

    fn owns(&self, service_type: ServiceType) -> bool {
        matches!(service_type, ServiceType::Executable | ServiceType::Project)
    }

    async fn run(&self, app: Arc<Application>, token: CancellationToken) {
        let mut slots = JoinSet::new();
        for service in app.services().values() {
            if !self.owns(service.service_type()) {
                continue;
            }
            for slot in 0..service.description().replicas {
                slots.spawn(run_slot(
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

/// Launch, wait, relaunch for one replica slot until cancelled.
async fn run_slot(
    app: Arc<Application>,
    service: Arc<Service>,
    slot: usize,
    options: HostOptions,
    token: CancellationToken,
) {
    let mut failures: u32 = 0;

    while !token.is_cancelled() {
        if let Some(delay) = build_if_needed(&service, &options, &token, &mut failures).await {
            if !sleep_or_cancel(delay, &token).await {
                break;
            }
            continue;
        }
        if token.is_cancelled() {
            break;
        }

        let ports = service.ports_for_slot(slot);
        let replica = Arc::new(ReplicaStatus::process(service.name()));
        replica.set_ports(ports.clone());
        let env = replica_environment(
            &app,
            service.description(),
            replica.name(),
            &ports,
            EnvTarget::Process,
        );
        replica.update_process(|p| p.environment = env.clone());
        service.add_replica(replica.clone());

        let mut child = match spawn_replica(&app, &service, &env) {
            Ok(child) => child,
            Err(e) => {
                warn!(service = service.name(), replica = replica.name(), error = %e, "launch failed");
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

        let pid = child.id();
        replica.update_process(|p| p.pid = pid);
        service.transition(&replica, ReplicaState::Started);
        info!(service = service.name(), replica = replica.name(), pid, "replica started");

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_lines(stdout, service.clone(), replica.name().to_string(), LogStream::Stdout, token.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_lines(stderr, service.clone(), replica.name().to_string(), LogStream::Stderr, token.clone()));
        }

        let code = wait_or_stop(&mut child, &token, options.grace_period).await;
        replica.update_process(|p| p.exit_code = code);
        service.transition(&replica, ReplicaState::Stopped);
        service.remove_replica(&replica);

        if token.is_cancelled() {
            debug!(service = service.name(), replica = replica.name(), "replica stopped for shutdown");
            break;
        }

        let restarts = service.record_restart();
        warn!(
            service = service.name(),
            replica = replica.name(),
            exit_code = code,
            restarts,
            "replica exited, restarting"
        );
        publish_system(&service, replica.name(), format!("process exited with code: {:?}", code));
        if !sleep_or_cancel(options.restart_delay, &token).await {
            break;
        }
    }
}

/// Returns the delay to wait when the build failed, `None` to go ahead.
async fn build_if_needed(
    service: &Service,
    options: &HostOptions,
    token: &CancellationToken,
    failures: &mut u32,
) -> Option<Duration> {
    let RunInfo::Project { project_path, build: true, .. } = &service.description().run_info else {
        return None;
    };
    if !options.build {
        return None;
    }

    let manifest = manifest_path(project_path);
    match build_project(&manifest, service, token).await {
        Ok(()) => None,
        Err(_) if token.is_cancelled() => None,
        Err(e) => {
            warn!(service = service.name(), error = %e, "build failed");
            publish_system(service, service.name(), format!("[error] {}", e));
            let delay = options.launch_backoff.next(*failures);
            *failures = failures.saturating_add(1);
            Some(delay)
        }
    }
}

async fn build_project(
    manifest: &Path,
    service: &Service,
    token: &CancellationToken,
) -> Result<(), LaunchError> {
    publish_system(service, service.name(), format!("building {}", manifest.display()));

    let mut cmd = Command::new("cargo");
    cmd.arg("build")
        .arg("--manifest-path")
        .arg(manifest)
        .stdin(Stdio::null())
        .kill_on_drop(true);

    let output = tokio::select! {
        _ = token.cancelled() => return Err(LaunchError::Build { project: manifest.to_path_buf(), code: None }),
        out = cmd.output() => out.map_err(|source| LaunchError::Spawn { command: "cargo build".into(), source })?,
    };

    if output.status.success() {
        return Ok(());
    }
    for line in String::from_utf8_lossy(&output.stderr).lines() {
        service
            .logs()
            .publish(LogLine::new(service.name(), LogStream::Stderr, line));
    }
    Err(LaunchError::Build {
        project: manifest.to_path_buf(),
        code: output.status.code(),
    })
}

fn manifest_path(project: &Path) -> PathBuf {
    if project.is_dir() {
        project.join("Cargo.toml")
    } else {
        project.to_path_buf()
    }
}

fn spawn_replica(
    app: &Application,
    service: &Service,
    env: &std::collections::BTreeMap<String, String>,
) -> Result<Child, LaunchError> {
    let (mut cmd, shown) = match &service.description().run_info {
        RunInfo::Process {
            executable,
            working_dir,
            args,
        } => {
            let mut cmd = Command::new(executable);
            cmd.args(args);
            cmd.current_dir(working_dir.as_deref().unwrap_or(app.context_dir()));
            (cmd, executable.display().to_string())
        }
        RunInfo::Project {
            project_path, args, ..
        } => {
            let manifest = manifest_path(project_path);
            let mut cmd = Command::new("cargo");
            cmd.arg("run")
                .arg("--quiet")
                .arg("--manifest-path")
                .arg(&manifest)
                .arg("--")
                .args(args);
            if let Some(dir) = manifest.parent() {
                cmd.current_dir(dir);
            }
            (cmd, format!("cargo run --manifest-path {}", manifest.display()))
        }
        RunInfo::Container { .. } | RunInfo::External => {
            return Err(LaunchError::Spawn {
                command: service.name().to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "not a process-backed service",
                ),
            });
        }
    };

    cmd.envs(env);

    // New session so the whole process tree can be signalled at once
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }

    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.stdin(Stdio::null());
    cmd.kill_on_drop(true);

    cmd.spawn().map_err(|source| LaunchError::Spawn {
        command: shown,
        source,
    })
}

/// Wait for exit; on cancellation interrupt the process group, then kill it
/// after `grace`.
async fn wait_or_stop(child: &mut Child, token: &CancellationToken, grace: Duration) -> Option<i32> {
    let status = tokio::select! {
        status = child.wait() => status.ok(),
        _ = token.cancelled() => {
            signal_group(child, Signal::Interrupt);
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(status) => status.ok(),
                Err(_) => {
                    signal_group(child, Signal::Kill);
                    let _ = child.start_kill();
                    child.wait().await.ok()
                }
            }
        }
    };
    status.and_then(exit_code)
}

#[derive(Clone, Copy)]
enum Signal {
    Interrupt,
    Kill,
}

#[cfg(unix)]
fn signal_group(child: &Child, signal: Signal) {
    let Some(pid) = child.id() else {
        return;
    };
    let sig = match signal {
        Signal::Interrupt => libc::SIGINT,
        Signal::Kill => libc::SIGKILL,
    };
    unsafe {
        libc::killpg(pid as i32, sig);
    }
}

// Without process groups the caller's `start_kill` is the only stop.
#[cfg(not(unix))]
fn signal_group(_child: &Child, _signal: Signal) {}

#[cfg(unix)]
fn exit_code(status: std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.code().or_else(|| status.signal().map(|s| 128 + s))
}

#[cfg(not(unix))]
fn exit_code(status: std::process::ExitStatus) -> Option<i32> {
    status.code()
}

/// Forward output lines to the service's log subject.
pub(crate) async fn pump_lines<R>(
    reader: R,
    service: Arc<Service>,
    replica: String,
    stream: LogStream,
    token: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(text)) => {
                    service.logs().publish(LogLine::new(replica.as_str(), stream, text));
                }
                _ => break,
            },
        }
    }
}

pub(crate) fn publish_system(service: &Service, replica: &str, text: String) {
    service
        .logs()
        .publish(LogLine::new(replica, LogStream::System, text));
}
