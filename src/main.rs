use hostgate::config::Config;
use hostgate::events::{EventBus, Severity};
use hostgate::handler::HandlerRegistry;
use hostgate::listener::ListenerManager;
use hostgate::router::describe_canonical;
use hostgate::tenant::VirtualHostIndex;
use hostgate::{PKG_NAME, VERSION};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hostgate=info".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("hostgate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    let index = Arc::new(VirtualHostIndex::from_config(&config.tenants, &config.listeners));
    print_startup_banner(&config, &index);

    let events = EventBus::new();
    spawn_event_logger(&events);

    let manager = Arc::new(ListenerManager::new(
        &config.server,
        Arc::clone(&index),
        Arc::new(HandlerRegistry::default()),
        events,
    ));

    manager.start_all(&config.listeners).await.map_err(|e| {
        error!(port = e.port, error = %e, "Failed to start listeners");
        e
    })?;

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
            _ = manager.wait_stopped() => {}
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
            }
            _ = manager.wait_stopped() => {}
        }
    }

    manager.shutdown();

    if let Some(cause) = manager.fatal_cause() {
        error!(cause = %cause, "Listeners stopped after fatal error");
        anyhow::bail!("fatal error: {}", cause);
    }

    info!("Shutdown complete");
    Ok(())
}

/// Mirror bus events into the log so nothing published goes unseen
fn spawn_event_logger(events: &EventBus) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event logger lagged behind event bus");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            match event.severity {
                Severity::Info => debug!(kind = %event.kind, info = ?event.info, "{}", event.message),
                Severity::Warning => warn!(kind = %event.kind, cause = ?event.cause, info = ?event.info, "{}", event.message),
                Severity::Fatal => error!(kind = %event.kind, cause = ?event.cause, info = ?event.info, "{}", event.message),
            }
        }
    });
}

fn print_startup_banner(config: &Config, index: &VirtualHostIndex) {
    info!(name = PKG_NAME, version = VERSION, "Starting front door");
    info!(
        bind = %config.server.bind,
        cert_dir = ?config.server.cert_dir,
        server_identity = %config.server.server_identity,
        max_body_bytes = config.server.max_body_bytes,
        "Server configuration"
    );
    for listener in &config.listeners {
        info!(port = listener.port, encrypted = listener.encrypted, "Listener configured");
    }
    if index.is_empty() {
        warn!("No tenants configured; every request will be answered with 404");
    } else {
        info!(tenants = index.len(), "Tenants configured");
    }
    for tenant in index.tenants() {
        info!(
            tenant = %tenant.name,
            environment = %tenant.environment,
            ports = ?tenant.ports,
            hostnames = tenant.hostnames.len(),
            canonical = %describe_canonical(tenant),
            "Tenant configured"
        );
    }
}
