//! Periodic liveness probing of every registered proxy
//!
//! Each cycle lists the fleet, probes all servers concurrently with a per-probe
//! timeout and writes `status`/`last_pinged` back for each one independently.
//! A cycle always classifies every server as online or offline; probe errors
//! never reach the caller, they end up in the [`CycleReport`] and the log.

use crate::config::HealthConfig;
use crate::error::{FleetError, FleetResult};
use crate::gateway::ServerGateway;
use crate::models::{Server, ServerStatus};
use crate::repository::FleetRepository;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Outcome of probing one server
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeDetail {
    pub server_id: String,
    pub name: String,
    pub status: ServerStatus,
    pub error: Option<String>,
    /// False when the status write failed
    pub persisted: bool,
}

/// Summary of one probe cycle
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub observed_at: DateTime<Utc>,
    pub total: usize,
    pub online: usize,
    pub offline: usize,
    pub details: Vec<ProbeDetail>,
}

impl CycleReport {
    fn from_details(observed_at: DateTime<Utc>, details: Vec<ProbeDetail>) -> Self {
        let online = details
            .iter()
            .filter(|d| d.status == ServerStatus::Online)
            .count();
        Self {
            observed_at,
            total: details.len(),
            online,
            offline: details.len() - online,
            details,
        }
    }
}

/// Result of checking a single server on demand
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerHealth {
    pub status: ServerStatus,
    pub last_pinged: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

struct MonitorInner {
    repo: Arc<dyn FleetRepository>,
    gateway: Arc<dyn ServerGateway>,
    probe_timeout: Duration,
    last_report: RwLock<Option<CycleReport>>,
}

struct RunningLoop {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    interval: Duration,
}

/// Owns the probe timer; `start`/`stop` are idempotent
pub struct HealthMonitor {
    inner: Arc<MonitorInner>,
    default_interval: Duration,
    running: Mutex<Option<RunningLoop>>,
}

impl HealthMonitor {
    pub fn new(
        repo: Arc<dyn FleetRepository>,
        gateway: Arc<dyn ServerGateway>,
        config: &HealthConfig,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                repo,
                gateway,
                probe_timeout: config.probe_timeout(),
                last_report: RwLock::new(None),
            }),
            default_interval: config.interval(),
            running: Mutex::new(None),
        }
    }

    pub fn default_interval(&self) -> Duration {
        self.default_interval
    }

    pub fn probe_timeout(&self) -> Duration {
        self.inner.probe_timeout
    }

    /// Run one cycle now, then keep cycling every `interval` until stopped
    pub async fn start(&self, interval: Duration) -> FleetResult<StartOutcome> {
        if interval.is_zero() || interval <= self.inner.probe_timeout {
            return Err(FleetError::InvalidRequest(format!(
                "health interval {:?} must be longer than the probe timeout {:?}",
                interval, self.inner.probe_timeout
            )));
        }

        let mut running = self.running.lock().await;
        if let Some(current) = running.as_ref() {
            if !current.task.is_finished() {
                info!(interval_ms = current.interval.as_millis() as u64, "Health monitor already running");
                return Ok(StartOutcome::AlreadyRunning);
            }
        }

        if let Err(e) = self.inner.run_cycle().await {
            error!(error = %e, "Initial health cycle failed");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(run_loop(inner, interval, shutdown_rx));

        info!(interval_ms = interval.as_millis() as u64, "Health monitor started");
        *running = Some(RunningLoop {
            shutdown_tx,
            task,
            interval,
        });
        Ok(StartOutcome::Started)
    }

    /// Prevent future cycles. A cycle already in flight runs to completion.
    /// Returns false when the monitor was not running.
    pub async fn stop(&self) -> bool {
        let mut running = self.running.lock().await;
        match running.take() {
            Some(current) => {
                let _ = current.shutdown_tx.send(true);
                let was_running = !current.task.is_finished();
                info!("Health monitor stopped");
                was_running
            }
            None => {
                debug!("Health monitor stop requested while not running");
                false
            }
        }
    }

    /// Interval of the running loop, or `None` when stopped
    pub async fn current_interval(&self) -> Option<Duration> {
        self.running
            .lock()
            .await
            .as_ref()
            .filter(|r| !r.task.is_finished())
            .map(|r| r.interval)
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.task.is_finished())
    }

    /// Probe every registered server once
    pub async fn check_all(&self) -> FleetResult<CycleReport> {
        self.inner.run_cycle().await
    }

    /// Probe a single server and persist the result
    pub async fn check_one(&self, server_id: &str) -> FleetResult<ServerHealth> {
        let server = self
            .inner
            .repo
            .find_server(server_id)?
            .ok_or_else(|| FleetError::server_not_found(server_id))?;

        let observed_at = Utc::now();
        let detail = self.inner.probe_and_record(&server, observed_at).await;
        Ok(ServerHealth {
            status: detail.status,
            last_pinged: Some(observed_at),
            error: detail.error,
        })
    }

    /// Most recent completed cycle, if any
    pub fn last_report(&self) -> Option<CycleReport> {
        self.inner.last_report.read().clone()
    }
}

async fn run_loop(inner: Arc<MonitorInner>, interval: Duration, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                if let Err(e) = inner.run_cycle().await {
                    error!(error = %e, "Health cycle failed");
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    debug!("Health loop exiting");
                    break;
                }
            }
        }
    }
}

impl MonitorInner {
    async fn run_cycle(&self) -> FleetResult<CycleReport> {
        let servers = self.repo.list_servers()?;
        let observed_at = Utc::now();

        let details = join_all(
            servers
                .iter()
                .map(|server| self.probe_and_record(server, observed_at)),
        )
        .await;

        let report = CycleReport::from_details(observed_at, details);
        info!(
            total = report.total,
            online = report.online,
            offline = report.offline,
            "Health cycle complete"
        );

        *self.last_report.write() = Some(report.clone());
        Ok(report)
    }

    async fn probe_and_record(&self, server: &Server, observed_at: DateTime<Utc>) -> ProbeDetail {
        let (status, probe_error) = self.classify(server).await;

        if let Some(reason) = &probe_error {
            warn!(server_id = %server.id, name = %server.name, error = %reason, "Server offline");
        } else {
            debug!(server_id = %server.id, name = %server.name, "Server online");
        }

        let persisted = match self.persist(&server.id, status, observed_at) {
            Ok(persisted) => persisted,
            Err(e) => {
                error!(server_id = %server.id, error = %e, "Failed to persist server status");
                false
            }
        };

        ProbeDetail {
            server_id: server.id.clone(),
            name: server.name.clone(),
            status,
            error: probe_error,
            persisted,
        }
    }

    async fn classify(&self, server: &Server) -> (ServerStatus, Option<String>) {
        match tokio::time::timeout(self.probe_timeout, self.gateway.probe(&server.address)).await {
            Ok(Ok(resp)) if resp.is_success() => (ServerStatus::Online, None),
            Ok(Ok(resp)) => (
                ServerStatus::Offline,
                Some(format!("admin endpoint returned HTTP {}", resp.status)),
            ),
            Ok(Err(e)) => (ServerStatus::Offline, Some(e.to_string())),
            Err(_) => (
                ServerStatus::Offline,
                Some(format!("probe timed out after {:?}", self.probe_timeout)),
            ),
        }
    }

    /// Write only the liveness fields; deployments own `active_config_id`
    fn persist(&self, server_id: &str, status: ServerStatus, observed_at: DateTime<Utc>) -> anyhow::Result<bool> {
        self.repo.update_server_liveness(server_id, status, observed_at)
    }
}
