//! Health monitoring tests for Proxyfleet

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use proxyfleet::config::{FleetConfig, HealthConfig, StoreBackend, StoreConfig};
use proxyfleet::error::FleetError;
use proxyfleet::fleet::FleetService;
use proxyfleet::gateway::{GatewayError, RawResponse, ServerGateway, ValidateOutcome};
use proxyfleet::health::StartOutcome;
use proxyfleet::models::{Configuration, Server, ServerAddress, ServerStatus};
use proxyfleet::repository::{open_repository, FleetRepository};

#[derive(Debug, Clone, Copy)]
enum Probe {
    Status(u16),
    Hang,
    Refused,
}

#[derive(Default)]
struct ProbeGateway {
    scripted: Mutex<HashMap<u16, Probe>>,
    probes: AtomicUsize,
}

impl ProbeGateway {
    fn script(&self, port: u16, probe: Probe) {
        self.scripted.lock().insert(port, probe);
    }

    fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServerGateway for ProbeGateway {
    async fn probe(&self, target: &ServerAddress) -> Result<RawResponse, GatewayError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let scripted = self
            .scripted
            .lock()
            .get(&target.port)
            .copied()
            .unwrap_or(Probe::Status(200));

        match scripted {
            Probe::Status(status) => Ok(RawResponse {
                status,
                body: String::new(),
            }),
            Probe::Hang => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(RawResponse {
                    status: 200,
                    body: String::new(),
                })
            }
            Probe::Refused => Err(GatewayError::ConnectionFailed("connection refused".to_string())),
        }
    }

    async fn validate(
        &self,
        _target: &ServerAddress,
        _content: &serde_json::Value,
    ) -> Result<ValidateOutcome, GatewayError> {
        Ok(ValidateOutcome::Valid)
    }

    async fn apply(
        &self,
        _target: &ServerAddress,
        _content: &serde_json::Value,
    ) -> Result<RawResponse, GatewayError> {
        Ok(RawResponse {
            status: 200,
            body: String::new(),
        })
    }
}

/// Repository whose server writes fail for one id, and which can let a
/// deployment land just before a liveness write
struct FlakyRepository {
    inner: Arc<dyn FleetRepository>,
    broken_id: Mutex<Option<String>>,
    deploy_before_liveness: Mutex<Option<String>>,
}

impl FleetRepository for FlakyRepository {
    fn create_server(&self, server: &Server) -> anyhow::Result<()> {
        self.inner.create_server(server)
    }

    fn find_server(&self, id: &str) -> anyhow::Result<Option<Server>> {
        self.inner.find_server(id)
    }

    fn list_servers(&self) -> anyhow::Result<Vec<Server>> {
        self.inner.list_servers()
    }

    fn update_server(&self, server: &Server) -> anyhow::Result<bool> {
        if self.broken_id.lock().as_deref() == Some(server.id.as_str()) {
            anyhow::bail!("disk I/O error");
        }
        self.inner.update_server(server)
    }

    fn update_server_liveness(
        &self,
        id: &str,
        status: ServerStatus,
        last_pinged: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        if self.broken_id.lock().as_deref() == Some(id) {
            anyhow::bail!("disk I/O error");
        }
        if let Some(config_id) = self.deploy_before_liveness.lock().clone() {
            if let Some(mut server) = self.inner.find_server(id)? {
                server.active_config_id = Some(config_id);
                self.inner.update_server(&server)?;
            }
        }
        self.inner.update_server_liveness(id, status, last_pinged)
    }

    fn delete_server(&self, id: &str) -> anyhow::Result<bool> {
        self.inner.delete_server(id)
    }

    fn create_configuration(&self, config: &Configuration) -> anyhow::Result<()> {
        self.inner.create_configuration(config)
    }

    fn find_configuration(&self, id: &str) -> anyhow::Result<Option<Configuration>> {
        self.inner.find_configuration(id)
    }

    fn list_configurations(&self) -> anyhow::Result<Vec<Configuration>> {
        self.inner.list_configurations()
    }

    fn update_configuration(&self, config: &Configuration) -> anyhow::Result<bool> {
        self.inner.update_configuration(config)
    }

    fn delete_configuration(&self, id: &str) -> anyhow::Result<bool> {
        self.inner.delete_configuration(id)
    }
}

fn fleet_config(interval_ms: u64, probe_timeout_ms: u64) -> FleetConfig {
    FleetConfig {
        store: StoreConfig::in_memory(StoreBackend::Sqlite),
        health: HealthConfig {
            enabled: true,
            interval_ms,
            probe_timeout_ms,
        },
        ..FleetConfig::default()
    }
}

struct Harness {
    fleet: FleetService,
    gateway: Arc<ProbeGateway>,
    repo: Arc<FlakyRepository>,
}

fn harness(interval_ms: u64, probe_timeout_ms: u64) -> Harness {
    harness_on(StoreBackend::Sqlite, interval_ms, probe_timeout_ms)
}

fn harness_on(backend: StoreBackend, interval_ms: u64, probe_timeout_ms: u64) -> Harness {
    let mut config = fleet_config(interval_ms, probe_timeout_ms);
    config.store = StoreConfig::in_memory(backend);
    let repo = Arc::new(FlakyRepository {
        inner: open_repository(&config.store).unwrap(),
        broken_id: Mutex::new(None),
        deploy_before_liveness: Mutex::new(None),
    });
    let gateway = Arc::new(ProbeGateway::default());
    let fleet = FleetService::new(
        Arc::clone(&repo) as Arc<dyn FleetRepository>,
        Arc::clone(&gateway) as Arc<dyn ServerGateway>,
        &config,
    );
    Harness { fleet, gateway, repo }
}

fn register(fleet: &FleetService, name: &str, port: u16) -> String {
    fleet
        .register_server(name, ServerAddress::new("127.0.0.1", port))
        .unwrap()
        .id
}

#[tokio::test]
async fn test_cycle_classifies_every_server() {
    let h = harness(60_000, 100);
    let ok = register(&h.fleet, "ok", 2001);
    let unavailable = register(&h.fleet, "unavailable", 2002);
    let hung = register(&h.fleet, "hung", 2003);
    let refused = register(&h.fleet, "refused", 2004);
    h.gateway.script(2002, Probe::Status(503));
    h.gateway.script(2003, Probe::Hang);
    h.gateway.script(2004, Probe::Refused);

    let report = h.fleet.check_all_servers().await.unwrap();

    assert_eq!(report.total, 4);
    assert_eq!(report.online, 1);
    assert_eq!(report.offline, 3);

    let status_of = |id: &str| h.fleet.get_server(id).unwrap();
    assert_eq!(status_of(&ok).status, ServerStatus::Online);
    assert_eq!(status_of(&unavailable).status, ServerStatus::Offline);
    assert_eq!(status_of(&hung).status, ServerStatus::Offline);
    assert_eq!(status_of(&refused).status, ServerStatus::Offline);

    for id in [&ok, &unavailable, &hung, &refused] {
        assert_eq!(status_of(id).last_pinged, Some(report.observed_at));
    }

    let hung_detail = report.details.iter().find(|d| d.server_id == hung).unwrap();
    assert!(hung_detail.error.as_deref().unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_probes_run_concurrently() {
    let h = harness(60_000, 200);
    for port in 2001..2006 {
        register(&h.fleet, &format!("hung-{}", port), port);
        h.gateway.script(port, Probe::Hang);
    }

    let started = std::time::Instant::now();
    let report = h.fleet.check_all_servers().await.unwrap();

    assert_eq!(report.offline, 5);
    // five sequential timeouts would take at least a second
    assert!(started.elapsed() < Duration::from_millis(900));
}

#[tokio::test]
async fn test_write_failure_does_not_stop_cycle() {
    let h = harness(60_000, 100);
    let a = register(&h.fleet, "a", 2001);
    let broken = register(&h.fleet, "broken", 2002);
    let c = register(&h.fleet, "c", 2003);
    *h.repo.broken_id.lock() = Some(broken.clone());

    let report = h.fleet.check_all_servers().await.unwrap();

    assert_eq!(report.total, 3);
    let broken_detail = report.details.iter().find(|d| d.server_id == broken).unwrap();
    assert!(!broken_detail.persisted);
    assert_eq!(broken_detail.status, ServerStatus::Online);

    for id in [&a, &c] {
        let server = h.fleet.get_server(id).unwrap();
        assert_eq!(server.status, ServerStatus::Online);
        assert!(server.last_pinged.is_some());
    }
    let server = h.fleet.get_server(&broken).unwrap();
    assert_eq!(server.status, ServerStatus::Unknown);
    assert_eq!(server.last_pinged, None);
}

#[tokio::test]
async fn test_probe_keeps_active_config() {
    let h = harness(60_000, 100);
    let id = register(&h.fleet, "edge", 2001);

    let mut server = h.fleet.get_server(&id).unwrap();
    server.active_config_id = Some("cfg-1".to_string());
    h.repo.update_server(&server).unwrap();

    let health = h.fleet.check_one_server(&id).await.unwrap();
    assert_eq!(health.status, ServerStatus::Online);

    let stored = h.fleet.get_server(&id).unwrap();
    assert_eq!(stored.active_config_id.as_deref(), Some("cfg-1"));
    assert_eq!(stored.last_pinged, health.last_pinged);
}

#[tokio::test]
async fn test_cycle_keeps_config_deployed_mid_cycle() {
    for backend in [StoreBackend::Sqlite, StoreBackend::Document] {
        let h = harness_on(backend, 60_000, 100);
        let id = register(&h.fleet, "edge", 2001);
        *h.repo.deploy_before_liveness.lock() = Some("cfg-new".to_string());

        let report = h.fleet.check_all_servers().await.unwrap();
        assert_eq!(report.online, 1);

        let stored = h.fleet.get_server(&id).unwrap();
        assert_eq!(stored.active_config_id.as_deref(), Some("cfg-new"), "{:?}", backend);
        assert_eq!(stored.status, ServerStatus::Online);
        assert_eq!(stored.last_pinged, Some(report.observed_at));
    }
}

#[tokio::test]
async fn test_check_one_unknown_server() {
    let h = harness(60_000, 100);
    let err = h.fleet.check_one_server("nope").await.unwrap_err();
    assert!(matches!(err, FleetError::NotFound { kind: "server", .. }));
    assert_eq!(h.gateway.probe_count(), 0);
}

#[tokio::test]
async fn test_start_runs_first_cycle_immediately() {
    let h = harness(60_000, 100);
    let id = register(&h.fleet, "edge", 2001);

    let outcome = h.fleet.start_health_monitor(None).await.unwrap();
    assert_eq!(outcome, StartOutcome::Started);
    assert_eq!(h.gateway.probe_count(), 1);
    assert_eq!(h.fleet.get_server(&id).unwrap().status, ServerStatus::Online);
    assert!(h.fleet.health_monitor().last_report().is_some());

    assert!(h.fleet.stop_health_monitor().await);
}

#[tokio::test]
async fn test_start_is_idempotent() {
    let h = harness(60_000, 100);

    assert_eq!(
        h.fleet.start_health_monitor(None).await.unwrap(),
        StartOutcome::Started
    );
    assert_eq!(
        h.fleet.start_health_monitor(Some(30_000)).await.unwrap(),
        StartOutcome::AlreadyRunning
    );
    assert!(h.fleet.health_monitor().is_running().await);

    assert!(h.fleet.stop_health_monitor().await);
    assert!(!h.fleet.stop_health_monitor().await);
    assert!(!h.fleet.health_monitor().is_running().await);
}

#[tokio::test]
async fn test_interval_must_exceed_probe_timeout() {
    let h = harness(60_000, 100);
    let err = h.fleet.start_health_monitor(Some(100)).await.unwrap_err();
    assert!(matches!(err, FleetError::InvalidRequest(_)));
    assert!(!h.fleet.health_monitor().is_running().await);
}

#[tokio::test]
async fn test_loop_keeps_cycling_until_stopped() {
    let h = harness(60_000, 20);
    register(&h.fleet, "edge", 2001);

    h.fleet.start_health_monitor(Some(50)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(h.fleet.stop_health_monitor().await);

    let after_stop = h.gateway.probe_count();
    assert!(after_stop >= 3, "only {} probes", after_stop);

    // a cycle already due when stop was called may still complete
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(h.gateway.probe_count() <= after_stop + 1);
}
