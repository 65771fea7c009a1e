// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Engine wiring.
//
// Builds the registry, backend, payload spool, history, dispatcher and control
// surface from a `ServiceConfig`, starts the background tasks, and stops them
// in order on shutdown: refuse new work, drain in-flight jobs, then stop
// discovery.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use edgeprint_core::ServiceConfig;
use edgeprint_core::error::Result;
use edgeprint_print::discovery::scan_logged;
use edgeprint_print::{
    ControlServer, Dispatcher, HostBackend, JobHistory, LocalScan, MdnsDiscovery, PayloadStore,
    PrinterRegistry,
};

/// Overrides the config file location.
pub const CONFIG_ENV: &str = "EDGEPRINT_CONFIG";

const CONFIG_FILE: &str = "config.json";
const HISTORY_FILE: &str = "history.db";

/// Load the config from `EDGEPRINT_CONFIG` or `<data dir>/config.json`.
/// A missing file gives the defaults.
pub fn load_config(data_dir: &Path) -> Result<ServiceConfig> {
    let path = config_path(std::env::var_os(CONFIG_ENV).map(PathBuf::from), data_dir);
    let config = ServiceConfig::load(&path)?;
    info!(path = %path.display(), backend = ?config.backend, "configuration loaded");
    Ok(config)
}

fn config_path(explicit: Option<PathBuf>, data_dir: &Path) -> PathBuf {
    explicit
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| data_dir.join(CONFIG_FILE))
}

fn spool_dir(config: &ServiceConfig, data_dir: &Path) -> PathBuf {
    config
        .spool_dir
        .clone()
        .unwrap_or_else(|| data_dir.join("spool"))
}

/// A running engine.
pub struct Engine {
    dispatcher: Arc<Dispatcher<HostBackend>>,
    mdns: Option<MdnsDiscovery>,
    shutdown: watch::Sender<bool>,
    dispatch_task: JoinHandle<()>,
    tasks: Vec<JoinHandle<()>>,
    control_addr: SocketAddr,
}

impl Engine {
    /// Start every component.  Fails before any task is spawned if the
    /// spool, history or control listener cannot be set up.
    pub async fn start(config: ServiceConfig, data_dir: &Path) -> Result<Self> {
        config.validate()?;

        let payloads = PayloadStore::open(spool_dir(&config, data_dir))?;
        let swept = payloads.sweep_orphans(config.max_job_lifetime())?;
        debug!(swept, dir = %payloads.dir().display(), "spool ready");

        let history = if config.history_enabled {
            Some(Arc::new(JobHistory::open(data_dir.join(HISTORY_FILE))?))
        } else {
            None
        };

        let registry = Arc::new(PrinterRegistry::new());
        let backend = Arc::new(HostBackend::select(config.backend));
        let dispatcher = Arc::new(Dispatcher::new(
            config.clone(),
            Arc::clone(&registry),
            Arc::clone(&backend),
            payloads,
            history,
        )?);

        let listener = ControlServer::<HostBackend>::bind(&config.control_bind).await?;
        let control_addr = listener.local_addr()?;

        let (shutdown, rx) = watch::channel(false);
        let dispatch_task = dispatcher.spawn(rx.clone());
        let mut tasks = vec![
            ControlServer::new(Arc::clone(&dispatcher), config.max_payload_bytes).spawn(listener, rx.clone()),
            spawn_registry_sweeper(Arc::clone(&registry), &config, rx.clone()),
        ];
        if config.local_scan_interval_secs > 0 {
            tasks.push(spawn_local_scan(
                backend,
                Arc::clone(&registry),
                Duration::from_secs(config.local_scan_interval_secs),
                rx,
            ));
        }

        let mdns = if config.mdns_enabled {
            start_mdns(registry)
        } else {
            None
        };

        info!(control = %control_addr, mdns = mdns.is_some(), "engine started");
        Ok(Self {
            dispatcher,
            mdns,
            shutdown,
            dispatch_task,
            tasks,
            control_addr,
        })
    }

    /// Refuse new work, wait for the dispatcher to drain (bounded by the
    /// shutdown grace), then stop the remaining tasks and discovery.
    pub async fn shutdown(self) {
        info!(
            control = %self.control_addr,
            queued = self.dispatcher.queued_len(),
            in_flight = self.dispatcher.in_flight_len(),
            "shutting down"
        );
        let _ = self.shutdown.send(true);

        if let Err(e) = self.dispatch_task.await {
            warn!(error = %e, "dispatch task ended abnormally");
        }
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        if let Some(mdns) = self.mdns
            && let Err(e) = mdns.shutdown()
        {
            warn!(error = %e, "mDNS shutdown failed");
        }
    }
}

/// Run until Ctrl-C or SIGTERM, then shut down gracefully.
pub async fn run(config: ServiceConfig, data_dir: &Path) -> Result<()> {
    let engine = Engine::start(config, data_dir).await?;
    wait_for_signal().await;
    engine.shutdown().await;
    Ok(())
}

fn start_mdns(registry: Arc<PrinterRegistry>) -> Option<MdnsDiscovery> {
    let mut discovery = match MdnsDiscovery::new(registry) {
        Ok(d) => d,
        Err(e) => {
            warn!("mDNS discovery unavailable: {e}");
            return None;
        }
    };
    if let Err(e) = discovery.start() {
        warn!("mDNS browse failed to start: {e}");
        return None;
    }
    Some(discovery)
}

fn spawn_registry_sweeper(
    registry: Arc<PrinterRegistry>,
    config: &ServiceConfig,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let every = config.sweep_interval();
    let stale_after = config.stale_after();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let removed = registry.sweep(Utc::now(), stale_after);
                    if !removed.is_empty() {
                        debug!(count = removed.len(), "registry sweep");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

fn spawn_local_scan(
    backend: Arc<HostBackend>,
    registry: Arc<PrinterRegistry>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut scan = LocalScan::new();
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => scan_logged(&mut scan, backend.as_ref(), &registry).await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("interrupt received"),
                    _ = term.recv() => info!("SIGTERM received"),
                }
                return;
            }
            Err(e) => warn!(error = %e, "cannot listen for SIGTERM; Ctrl-C only"),
        }
    }
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("interrupt received"),
        Err(e) => warn!(error = %e, "cannot listen for Ctrl-C; stopping"),
    }
}
