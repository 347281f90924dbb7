use dockgate::acme::{AcmeIssuer, Http01Challenges};
use dockgate::admin::{AdminServer, AdminState, PKG_NAME, VERSION};
use dockgate::certs::{CertificateIssuer, CertificateResolver};
use dockgate::config::Config;
use dockgate::docker::DockerRuntime;
use dockgate::reconciler::{periodic_sweep, trigger_channel, Reconciler, TriggerSource};
use dockgate::reload::{CommandEngine, ReloadCoordinator};
use dockgate::render::RenderOptions;
use dockgate::routes::RouteTable;
use dockgate::runtime::ContainerRuntime;
use dockgate::watcher::EventWatcher;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::filter::Directive;

/// How long tasks get to finish after the shutdown signal
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Config path is optional; without one everything comes from defaults and DOCKGATE_* variables
    let config_path = std::env::args().nth(1).map(PathBuf::from);

    let loaded = match &config_path {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    };
    let config = match loaded {
        Ok(config) => {
            init_logging(&config.server.log_level)?;
            config
        }
        Err(e) => {
            init_logging("info")?;
            error!(path = ?config_path, error = %e, "Failed to load configuration");
            return Err(e);
        }
    };

    match &config_path {
        Some(path) => info!(path = %path.display(), "Configuration loaded"),
        None => info!("No configuration file given, using defaults and environment"),
    }
    log_startup(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let docker = DockerRuntime::new(config.server.docker_host.as_deref(), &config.discovery)?;
    if let Err(e) = docker.ping().await {
        // Discovery failures are retried on every trigger; starting anyway keeps the engine serving
        warn!(error = %e, "Docker is not reachable yet");
    }
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(docker);
    let routes = Arc::new(RouteTable::new());

    let challenges = Http01Challenges::new();
    let issuer: Option<Arc<dyn CertificateIssuer>> = if config.tls.acme_enabled {
        Some(Arc::new(AcmeIssuer::new(&config.tls, challenges.clone())?))
    } else {
        info!("ACME disabled, serving fallback certificates only");
        None
    };
    let resolver =
        CertificateResolver::new(&config.tls, Arc::clone(&routes), issuer, shutdown_rx.clone())?;

    let fallback = resolver.fallback_material();
    let render_options = RenderOptions::from_config(
        &config,
        Some((fallback.cert_path.clone(), fallback.key_path.clone())),
    );

    let engine = Arc::new(CommandEngine::new(&config.engine));
    let coordinator = Arc::new(ReloadCoordinator::new(engine, config.engine.config_path.clone()));

    let (trigger, trigger_rx) = trigger_channel();

    let reconciler = Reconciler::new(
        &config,
        Arc::clone(&runtime),
        Arc::clone(&routes),
        Arc::clone(&coordinator),
        render_options,
    );
    let reconciler_handle = tokio::spawn(reconciler.run(trigger_rx, shutdown_rx.clone()));

    let watcher = EventWatcher::new(
        Arc::clone(&runtime),
        config.server.network.clone(),
        trigger.clone(),
    );
    let watcher_handle = tokio::spawn(watcher.run(shutdown_rx.clone()));

    let sweep_handle = tokio::spawn(periodic_sweep(
        trigger.clone(),
        config.discovery.sweep_interval(),
        shutdown_rx.clone(),
    ));

    let admin_server = AdminServer::new(
        SocketAddr::from((Ipv4Addr::LOCALHOST, config.server.admin_port)),
        AdminState {
            routes: Arc::clone(&routes),
            coordinator: Arc::clone(&coordinator),
            resolver: resolver.clone(),
            challenges,
        },
        shutdown_rx.clone(),
    );
    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!(error = %e, "Admin server error");
        }
    });

    trigger.fire(TriggerSource::Startup);

    // Wait for shutdown signal (Ctrl+C or SIGTERM); SIGHUP forces a reconciliation pass
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, reconciling routes");
                    trigger.fire(TriggerSource::Signal);
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    let joined = tokio::time::timeout(SHUTDOWN_GRACE, async {
        let _ = reconciler_handle.await;
        if let Ok(state) = watcher_handle.await {
            info!(reconnects = state.attempt, "Event watcher stopped");
        }
        let _ = sweep_handle.await;
        let _ = admin_handle.await;
    })
    .await;
    if joined.is_err() {
        warn!(grace_secs = SHUTDOWN_GRACE.as_secs(), "Tasks did not stop in time");
    }

    info!(
        generation = coordinator.applied_generation(),
        "Shutdown complete"
    );
    Ok(())
}

/// `RUST_LOG` still applies; the configured level only sets the dockgate target
fn init_logging(level: &str) -> anyhow::Result<()> {
    let directive: Directive = match format!("{}={}", PKG_NAME, level).parse() {
        Ok(directive) => directive,
        Err(_) => format!("{}=info", PKG_NAME).parse()?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(directive))
        .init();
    Ok(())
}

fn log_startup(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting");
    info!(
        network = %config.server.network,
        host_label = %config.discovery.host_label,
        upstream_label = %config.discovery.upstream_label,
        sweep_interval_secs = config.discovery.sweep_interval_secs,
        coalesce_window_ms = config.discovery.coalesce_window_ms,
        "Discovery settings"
    );
    info!(
        config_path = %config.engine.config_path.display(),
        validate = %config.engine.validate_command,
        reload = %config.engine.reload_command,
        http_port = config.server.http_port,
        https_port = config.server.https_port,
        "Serving engine settings"
    );
    info!(
        acme = config.tls.acme_enabled,
        store = %config.tls.store_dir.display(),
        shared = ?config.tls.shared_dir,
        renew_before_days = config.tls.renew_before_days,
        "TLS settings"
    );
    info!(admin_port = config.server.admin_port, "Admin API on localhost");
}
