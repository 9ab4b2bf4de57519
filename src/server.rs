//! HTTP surface and gateway lifecycle.

use std::net::SocketAddr;
use std::sync::Arc;

use actix_web::dev::{Server, ServerHandle};
use actix_web::middleware::from_fn;
use actix_web::{App, HttpServer, web};
use anyhow::Context;

use crate::api::api_handlers::{handle_status, handle_translate, handle_unknown_route};
use crate::api::auth::require_bearer;
use crate::api::validation::InputValidator;
use crate::config::GatewayConfig;
use crate::scheduler::JobExecutor;
use crate::server_state::ServerState;
use crate::telemetry::{SAMPLE_INTERVAL, SysinfoProbe, TelemetryProbe, os_description};
use crate::worker::{WorkerLauncher, WorkerProcessManager};

/// Shared by every request handler.
pub struct GatewayContext {
    pub state: Arc<ServerState>,
    pub probe: Arc<dyn TelemetryProbe>,
    pub executor: JobExecutor,
    pub validator: InputValidator,
    pub os: String,
}

impl GatewayContext {
    pub fn new(
        state: Arc<ServerState>,
        probe: Arc<dyn TelemetryProbe>,
        executor: JobExecutor,
        validator: InputValidator,
    ) -> Self {
        GatewayContext {
            state,
            probe,
            executor,
            validator,
            os: os_description(),
        }
    }
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/status", web::post().to(handle_status))
        .route("/translate", web::post().to(handle_translate))
        .default_service(web::to(handle_unknown_route));
}

/// A bound but not yet running gateway. OS signals are left to the caller,
/// which drives [`GatewayHandle`].
pub struct Gateway {
    server: Server,
    handle: GatewayHandle,
}

impl Gateway {
    pub fn bind(
        config: &GatewayConfig,
        auth_secret: String,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> anyhow::Result<Gateway> {
        let state = Arc::new(ServerState::new(auth_secret, config.cpu_allocation_limit));
        let validator = InputValidator::new(config.check_url_reachability)
            .context("failed to build the URL reachability client")?;
        let ctx = web::Data::new(GatewayContext::new(
            state.clone(),
            Arc::new(SysinfoProbe::start(SAMPLE_INTERVAL)),
            JobExecutor::new(WorkerProcessManager::new(launcher)),
            validator,
        ));

        let server = HttpServer::new(move || {
            App::new()
                .app_data(ctx.clone())
                .wrap(from_fn(require_bearer))
                .configure(routes)
        })
        .shutdown_timeout(5)
        .disable_signals()
        .bind((config.host.as_str(), config.port))
        .with_context(|| format!("failed to bind {}:{}", config.host, config.port))?;

        let addrs = server.addrs();
        let server = server.run();
        state.set_running(true);
        tracing::info!(?addrs, cpu_allocation_limit = config.cpu_allocation_limit, "gateway listening");

        let handle = GatewayHandle {
            state,
            server: server.handle(),
            addrs,
        };
        Ok(Gateway { server, handle })
    }

    pub fn handle(&self) -> GatewayHandle {
        self.handle.clone()
    }

    /// Serves requests until the gateway is stopped.
    pub async fn run(self) -> std::io::Result<()> {
        let result = self.server.await;
        self.handle.state.cancel_active_job();
        self.handle.state.set_running(false);
        tracing::info!("gateway stopped");
        result
    }
}

/// Control surface used by the hosting shell.
#[derive(Clone)]
pub struct GatewayHandle {
    state: Arc<ServerState>,
    server: ServerHandle,
    addrs: Vec<SocketAddr>,
}

impl GatewayHandle {
    pub fn pause(&self) {
        let aborted = self.state.pause();
        tracing::info!(aborted, "gateway paused");
    }

    pub fn resume(&self) {
        self.state.resume();
        tracing::info!("gateway resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.state.snapshot().paused
    }

    pub fn set_cpu_allocation_limit(&self, limit: f64) {
        self.state.set_cpu_allocation_limit(limit);
        tracing::info!(limit, "cpu allocation limit updated");
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }

    /// Aborts the running job and shuts the HTTP server down.
    pub async fn stop(&self) {
        let aborted = self.state.cancel_active_job();
        self.state.set_running(false);
        tracing::info!(aborted, "gateway stopping");
        self.server.stop(true).await;
    }
}
