//! Application processor
//!
//! Brings one `Application` up in dependency order (ports, proxy, ingress,
//! diagnostics, then supervisors) and tears it down with a single
//! cancellation.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tye_core::model::ServiceType;
use tye_core::service::Application;
use tye_core::supervisor::{HostOptions, Supervisor};

use crate::engines::ProcessSupervisor;
use crate::ingress::IngressServer;
use crate::{logging, ports, proxy};

/// Slack on top of the grace period for supervisors to report `Removed`.
const SHUTDOWN_MARGIN: Duration = Duration::from_secs(5);

pub struct ApplicationProcessor {
    options: HostOptions,
    supervisors: Vec<Arc<dyn Supervisor>>,
}

impl ApplicationProcessor {
    pub fn new(options: HostOptions) -> Self {
        let mut supervisors: Vec<Arc<dyn Supervisor>> =
            vec![Arc::new(ProcessSupervisor::new(options.clone()))];
        #[cfg(feature = "docker")]
        supervisors.push(Arc::new(crate::engines::DockerSupervisor::new(
            options.clone(),
        )));
        Self {
            options,
            supervisors,
        }
    }

    pub async fn start(&self, app: Arc<Application>) -> anyhow::Result<RunningApplication> {
        let token = CancellationToken::new();
        let mut tasks = JoinSet::new();

        match self.start_inner(&app, &token, &mut tasks).await {
            Ok(()) => Ok(RunningApplication {
                app,
                token,
                tasks,
                deadline: self.options.grace_period + SHUTDOWN_MARGIN,
            }),
            Err(e) => {
                token.cancel();
                tasks.shutdown().await;
                Err(e)
            }
        }
    }

    async fn start_inner(
        &self,
        app: &Arc<Application>,
        token: &CancellationToken,
        tasks: &mut JoinSet<()>,
    ) -> anyhow::Result<()> {
        ports::allocate(app).context("port allocation failed")?;

        let proxied = proxy::start(app, token, tasks).await?;
        debug!(listeners = proxied.len(), "proxy ready");

        for description in app.ingress() {
            let server = IngressServer::bind(app.clone(), description, token.clone()).await?;
            server.spawn(tasks);
        }

        logging::forward_diagnostics(app, token, tasks);

        for service in app.services().values() {
            let service_type = service.service_type();
            if service_type == ServiceType::External {
                debug!(service = service.name(), "external service, not launched");
            } else if !self.supervisors.iter().any(|s| s.owns(service_type)) {
                warn!(service = service.name(), ?service_type, "no backend available for service");
            }
        }

        for supervisor in &self.supervisors {
            let supervisor = supervisor.clone();
            let app = app.clone();
            let token = token.clone();
            tasks.spawn(async move {
                debug!(backend = supervisor.name(), "supervisor starting");
                supervisor.run(app, token).await;
                debug!(backend = supervisor.name(), "supervisor finished");
            });
        }

        info!(application = app.name(), services = app.services().len(), "application started");
        Ok(())
    }
}

/// A started application. Dropping it without `stop` leaves tasks running
/// until the runtime exits.
pub struct RunningApplication {
    app: Arc<Application>,
    token: CancellationToken,
    tasks: JoinSet<()>,
    deadline: Duration,
}

impl RunningApplication {
    /// Cancel everything and wait for replicas to be removed.
    pub async fn stop(mut self) {
        info!(application = self.app.name(), "stopping application");
        self.token.cancel();
        let drained = tokio::time::timeout(self.deadline, async {
            while self.tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                application = self.app.name(),
                "shutdown deadline passed, aborting remaining tasks"
            );
            self.tasks.shutdown().await;
        }
        info!(application = self.app.name(), "application stopped");
    }
}
