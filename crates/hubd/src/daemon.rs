//! `hubd run`: backends, engine and control socket
//!
//! Only wiring lives here. Every decision about rules, addresses or
//! connection state is made inside `hub-core`.

use anyhow::{Context, Result};
use hub_core::config::{DnsConfig, HubConfig, StoreConfig};
use hub_core::control::serve_connection;
use hub_core::model::IdentityKind;
use hub_core::traits::{DnsZone, HubStore, PacketFilter, VpnManagement};
use hub_core::{Backends, EngineEvent, FileStore, HubEngine, MemoryStore, MemoryZone};
use hub_dns_http::HttpZone;
use hub_iptables::IptablesFilter;
use hub_openvpn::OpenVpnManagement;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::UnixListenerStream;
use tracing::{debug, info, warn};

/// Hook scripts run as the VPN server's user
const SOCKET_MODE: u32 = 0o660;

/// Run the daemon until SIGTERM or SIGINT
pub async fn run_daemon(config: HubConfig) -> Result<()> {
    info!(
        "Overlay {} for {}, store {:?}, dns {}",
        config.subnet_key.overlay_subnet(),
        config.domain,
        config.store,
        config.dns.type_name()
    );

    let backends = build_backends(&config).await?;
    let (engine, events) = HubEngine::new(&config, backends)?;
    let engine = Arc::new(engine);
    tokio::spawn(log_events(events));

    let listener = bind_control_socket(&config.control_socket).await?;
    info!("Control socket listening on {}", config.control_socket.display());
    let server = tokio::spawn(serve_control(engine.clone(), listener));

    let shutdown = shutdown_signal()?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    tokio::spawn(async move {
        let name = shutdown.await;
        info!("Received shutdown signal: {}", name);
        let _ = shutdown_tx.send(());
    });

    let result = engine.run_with_shutdown(Some(shutdown_rx)).await;

    server.abort();
    if let Err(e) = tokio::fs::remove_file(&config.control_socket).await {
        debug!("Could not remove control socket: {}", e);
    }
    result.context("engine stopped with an error")
}

/// Construct the external systems named by the configuration
pub async fn build_backends(config: &HubConfig) -> Result<Backends> {
    let store: Arc<dyn HubStore> = match &config.store {
        StoreConfig::Memory => {
            warn!("Using the in-memory store; state is lost on exit");
            Arc::new(MemoryStore::new())
        }
        StoreConfig::File { path } => Arc::new(
            FileStore::new(path)
                .await
                .with_context(|| format!("opening store {}", path.display()))?,
        ),
    };

    let filter: Arc<dyn PacketFilter> = Arc::new(IptablesFilter::from_config(&config.firewall));

    let transports = config
        .transports
        .configured()
        .into_iter()
        .map(|(kind, management)| {
            info!("{} transport at {}", kind, management.endpoint);
            let client = OpenVpnManagement::new(transport_name(kind), management.clone());
            (kind, Arc::new(client) as Arc<dyn VpnManagement>)
        })
        .collect();

    let dns: Option<Arc<dyn DnsZone>> = match &config.dns {
        DnsConfig::Disabled => None,
        DnsConfig::Memory => Some(Arc::new(MemoryZone::new())),
        DnsConfig::Http { .. } => Some(Arc::new(HttpZone::from_config(&config.dns)?)),
    };

    Ok(Backends {
        store,
        filter,
        transports,
        dns,
    })
}

fn transport_name(kind: IdentityKind) -> &'static str {
    match kind {
        IdentityKind::Server => "openvpn-servers",
        IdentityKind::UserDevice => "openvpn-users",
    }
}

/// Bind the control socket, replacing a stale one left by a crash
pub async fn bind_control_socket(path: &Path) -> Result<UnixListener> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }

    if path.exists() {
        if UnixStream::connect(path).await.is_ok() {
            anyhow::bail!(
                "another daemon is already listening on {}",
                path.display()
            );
        }
        warn!("Removing stale control socket {}", path.display());
        tokio::fs::remove_file(path).await?;
    }

    let listener = UnixListener::bind(path)
        .with_context(|| format!("binding control socket {}", path.display()))?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(SOCKET_MODE)).await?;
    Ok(listener)
}

/// Accept control connections, one task each
pub async fn serve_control(engine: Arc<HubEngine>, listener: UnixListener) {
    let mut incoming = UnixListenerStream::new(listener);
    while let Some(stream) = incoming.next().await {
        match stream {
            Ok(stream) => {
                let engine = engine.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(&engine, stream).await {
                        warn!("Control connection ended with error: {}", e);
                    }
                });
            }
            Err(e) => warn!("Control socket accept failed: {}", e),
        }
    }
}

async fn log_events(mut events: mpsc::Receiver<EngineEvent>) {
    while let Some(event) = events.recv().await {
        match &event {
            EngineEvent::IdentityRejected { uuid, reason } => {
                warn!("Rejected {}: {}", uuid, reason)
            }
            EngineEvent::Stopped { reason } => info!("Engine stopped: {}", reason),
            other => debug!("Engine event: {:?}", other),
        }
    }
}

/// Resolves with the name of the first SIGTERM or SIGINT
fn shutdown_signal() -> Result<impl std::future::Future<Output = &'static str>> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to setup SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to setup SIGINT handler")?;

    Ok(async move {
        tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        }
    })
}
