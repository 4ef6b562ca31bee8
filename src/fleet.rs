//! Entry points used by the control API

use crate::config::FleetConfig;
use crate::deploy::{DeploymentOrchestrator, DeploymentResult};
use crate::error::{FleetError, FleetResult};
use crate::gateway::{HttpGateway, ServerGateway};
use crate::health::{CycleReport, HealthMonitor, ServerHealth, StartOutcome};
use crate::models::{Configuration, Server, ServerAddress};
use crate::repository::{open_repository, FleetRepository};
use crate::validator::{self, ValidationReport};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub struct FleetService {
    repo: Arc<dyn FleetRepository>,
    orchestrator: DeploymentOrchestrator,
    monitor: HealthMonitor,
}

impl FleetService {
    pub fn new(
        repo: Arc<dyn FleetRepository>,
        gateway: Arc<dyn ServerGateway>,
        config: &FleetConfig,
    ) -> Self {
        Self {
            orchestrator: DeploymentOrchestrator::new(Arc::clone(&repo), Arc::clone(&gateway)),
            monitor: HealthMonitor::new(Arc::clone(&repo), gateway, &config.health),
            repo,
        }
    }

    /// Open the configured repository and an HTTP gateway
    pub fn from_config(config: &FleetConfig) -> anyhow::Result<Self> {
        let repo = open_repository(&config.store)?;
        let gateway: Arc<dyn ServerGateway> = Arc::new(HttpGateway::new(config.gateway.clone()));
        Ok(Self::new(repo, gateway, config))
    }

    pub fn health_monitor(&self) -> &HealthMonitor {
        &self.monitor
    }

    pub async fn apply_configuration(
        &self,
        config_id: &str,
        target_ids: Option<&[String]>,
    ) -> FleetResult<DeploymentResult> {
        self.orchestrator.apply(config_id, target_ids).await
    }

    pub async fn check_one_server(&self, server_id: &str) -> FleetResult<ServerHealth> {
        self.monitor.check_one(server_id).await
    }

    pub async fn check_all_servers(&self) -> FleetResult<CycleReport> {
        self.monitor.check_all().await
    }

    pub fn validate_configuration(&self, content: &serde_json::Value) -> ValidationReport {
        validator::check(content)
    }

    /// Start periodic probing; `None` uses the configured interval
    pub async fn start_health_monitor(&self, interval_ms: Option<u64>) -> FleetResult<StartOutcome> {
        let interval = interval_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.monitor.default_interval());
        self.monitor.start(interval).await
    }

    pub async fn stop_health_monitor(&self) -> bool {
        self.monitor.stop().await
    }

    // ==================== Registration ====================

    pub fn register_server(&self, name: &str, address: ServerAddress) -> FleetResult<Server> {
        if name.trim().is_empty() {
            return Err(FleetError::InvalidRequest("server name must not be empty".to_string()));
        }
        if address.host.trim().is_empty() || address.port == 0 {
            return Err(FleetError::InvalidRequest(
                "server address needs a host and a non-zero port".to_string(),
            ));
        }

        let server = Server::new(name.trim(), address);
        self.repo.create_server(&server)?;
        info!(server_id = %server.id, name = %server.name, "Server registered");
        Ok(server)
    }

    pub fn get_server(&self, server_id: &str) -> FleetResult<Server> {
        self.repo
            .find_server(server_id)?
            .ok_or_else(|| FleetError::server_not_found(server_id))
    }

    pub fn list_servers(&self) -> FleetResult<Vec<Server>> {
        Ok(self.repo.list_servers()?)
    }

    pub fn create_configuration(
        &self,
        name: &str,
        content: serde_json::Value,
        servers: Vec<String>,
    ) -> FleetResult<Configuration> {
        if name.trim().is_empty() {
            return Err(FleetError::InvalidRequest(
                "configuration name must not be empty".to_string(),
            ));
        }

        let config = Configuration::new(name.trim(), content).with_servers(servers);
        self.repo.create_configuration(&config)?;
        info!(config_id = %config.id, name = %config.name, "Configuration created");
        Ok(config)
    }

    pub fn get_configuration(&self, config_id: &str) -> FleetResult<Configuration> {
        self.repo
            .find_configuration(config_id)?
            .ok_or_else(|| FleetError::configuration_not_found(config_id))
    }

    pub fn list_configurations(&self) -> FleetResult<Vec<Configuration>> {
        Ok(self.repo.list_configurations()?)
    }
}
