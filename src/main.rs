use hakoniwa::auth::AuthService;
use hakoniwa::catalog::Catalog;
use hakoniwa::cleaner::{InactivityCleaner, CLEANUP_INTERVAL};
use hakoniwa::config::Config;
use hakoniwa::gateway::GatewayServer;
use hakoniwa::kubernetes::{KubernetesOrchestrator, Orchestrator};
use hakoniwa::reconciler::{Reconciler, RECONCILE_INTERVAL};
use hakoniwa::services::Services;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

/// How long shutdown waits for in-flight work to drain
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hakoniwa=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config = Config::load().map_err(|e| {
        error!(error = %e, "Failed to load configuration");
        e
    })?;

    let catalog = Catalog::load(config.pod_template_path.as_deref()).map_err(|e| {
        error!(error = %e, "Failed to load instance type catalog");
        e
    })?;

    print_startup_banner(&config, &catalog);

    // Infrastructure
    let orchestrator: Arc<dyn Orchestrator> =
        Arc::new(KubernetesOrchestrator::new(&config).await.map_err(|e| {
            error!(error = %e, "Failed to create Kubernetes client");
            e
        })?);

    let auth = AuthService::with_oidc(&config).await.map_err(|e| {
        error!(error = %e, "Failed to initialize authentication");
        e
    })?;

    let bind_addr: SocketAddr = config.bind_addr().parse().map_err(|e| {
        error!(addr = %config.bind_addr(), "Invalid listen address");
        anyhow::anyhow!("invalid listen address: {}", e)
    })?;

    let services = Services::new(config, catalog, orchestrator, auth);

    // Background loops share a shutdown channel with the server
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconciler = Reconciler::new(
        Arc::clone(&services.registry),
        Arc::clone(&services.orchestrator),
    );
    let reconciler_handle = tokio::spawn(reconciler.run(RECONCILE_INTERVAL, shutdown_rx.clone()));

    let cleaner = InactivityCleaner::new(
        Arc::clone(&services.registry),
        Arc::clone(&services.orchestrator),
        services.config.instance_inactivity_timeout,
    );
    let cleaner_handle = tokio::spawn(cleaner.run(CLEANUP_INTERVAL, shutdown_rx.clone()));

    let gateway = GatewayServer::new(bind_addr, Arc::clone(&services), shutdown_rx.clone());
    let gateway_handle = tokio::spawn(async move {
        if let Err(e) = gateway.run().await {
            error!(error = %e, "Gateway server error");
            std::process::exit(1);
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown and wait for the loops and in-flight requests to drain
    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, async {
        let _ = gateway_handle.await;
        let _ = reconciler_handle.await;
        let _ = cleaner_handle.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config, catalog: &Catalog) {
    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        "Starting workspace gateway"
    );
    info!(
        addr = %config.bind_addr(),
        namespace = %config.kubernetes_namespace,
        swagger_ui = config.swagger_ui_enabled,
        "Server configuration"
    );
    info!(
        inactivity_timeout_secs = config.instance_inactivity_timeout.as_secs(),
        max_pod_count = config.max_pod_count,
        max_instances_per_user = config.max_instances_per_user,
        max_instances_per_user_per_type = config.max_instances_per_user_per_type,
        persistence = config.enable_persistence,
        "Instance limits"
    );
    info!(
        auth_methods = ?config.auth_methods,
        session_expiration_secs = config.session_expiration.as_secs(),
        auto_login = config.auth_auto_login,
        "Authentication"
    );
    info!(
        types = ?catalog.list().iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
        "Instance type catalog"
    );
}
