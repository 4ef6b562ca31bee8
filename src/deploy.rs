//! Applying a stored configuration to one or more proxies
//!
//! Every target is processed on its own: a missing server, a rejected
//! document or an unreachable admin endpoint is recorded as a failure for
//! that target and the next one is attempted. Only an unknown configuration
//! or an empty target set abort the whole call.

use crate::error::{FleetError, FleetResult};
use crate::gateway::ServerGateway;
use crate::models::{ConfigStatus, Configuration, HistoryAction, HistoryEntry, Server, ServerStatus};
use crate::repository::FleetRepository;
use crate::validator::{self, ValidationReport};
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

pub const REASON_SERVER_NOT_FOUND: &str = "server not found";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetSuccess {
    pub server_id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetFailure {
    pub server_id: String,
    /// None when the server could not be loaded
    pub name: Option<String>,
    pub reason: String,
}

/// Per-call outcome; never persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeploymentResult {
    pub successes: Vec<TargetSuccess>,
    pub failures: Vec<TargetFailure>,
    pub success: bool,
    pub message: String,
}

impl DeploymentResult {
    fn new(successes: Vec<TargetSuccess>, failures: Vec<TargetFailure>) -> Self {
        let s = successes.len();
        let f = failures.len();

        let (success, message) = if s == 0 {
            (
                false,
                format!("Configuration failed to apply to any server. {} failed.", f),
            )
        } else if f == 0 {
            (true, format!("Configuration applied to {} server(s).", s))
        } else {
            (
                false,
                format!(
                    "Configuration partially applied. {} succeeded, {} failed.",
                    s, f
                ),
            )
        };

        Self {
            successes,
            failures,
            success,
            message,
        }
    }
}

/// Async mutexes keyed by entity id. An entry lives only while some caller
/// holds or waits on it.
#[derive(Default)]
struct EntityLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Held lock on one entity; drops its map entry when nobody else wants it
struct EntityGuard<'a> {
    locks: &'a EntityLocks,
    id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for EntityGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks.release(&self.id);
    }
}

impl EntityLocks {
    fn get(&self, id: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(id.to_string()).or_default().value())
    }

    async fn lock(&self, id: &str) -> EntityGuard<'_> {
        let guard = self.get(id).lock_owned().await;
        EntityGuard {
            locks: self,
            id: id.to_string(),
            guard: Some(guard),
        }
    }

    /// Lock every id in sorted order
    async fn lock_all(&self, ids: &[String]) -> Vec<EntityGuard<'_>> {
        let mut sorted: Vec<&String> = ids.iter().collect();
        sorted.sort();
        sorted.dedup();

        let mut guards = Vec::with_capacity(sorted.len());
        for id in sorted {
            guards.push(self.lock(id).await);
        }
        guards
    }

    fn release(&self, id: &str) {
        // the map's own reference is the only one left
        self.locks.remove_if(id, |_, m| Arc::strong_count(m) == 1);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.len()
    }
}

pub struct DeploymentOrchestrator {
    repo: Arc<dyn FleetRepository>,
    gateway: Arc<dyn ServerGateway>,
    /// Held for a whole deployment by every call touching the server
    server_locks: EntityLocks,
    /// Held around every read-modify-write of a configuration
    config_locks: EntityLocks,
}

impl DeploymentOrchestrator {
    pub fn new(repo: Arc<dyn FleetRepository>, gateway: Arc<dyn ServerGateway>) -> Self {
        Self {
            repo,
            gateway,
            server_locks: EntityLocks::default(),
            config_locks: EntityLocks::default(),
        }
    }

    /// Apply configuration `config_id` to `explicit_targets`, or to the
    /// configuration's own server set when no explicit targets are given
    pub async fn apply(
        &self,
        config_id: &str,
        explicit_targets: Option<&[String]>,
    ) -> FleetResult<DeploymentResult> {
        let config = self
            .repo
            .find_configuration(config_id)?
            .ok_or_else(|| FleetError::configuration_not_found(config_id))?;

        let targets = resolve_targets(&config, explicit_targets);
        if targets.is_empty() {
            return Err(FleetError::NoTargets);
        }

        info!(config_id, targets = targets.len(), "Deploying configuration");

        // Released only after the live status is written, so a concurrent
        // deployment to the same server sees this configuration as live.
        let _server_guards = self.server_locks.lock_all(&targets).await;

        let report = validator::check(&config.content);
        for warning in &report.warnings {
            warn!(config_id, warning = %warning, "Configuration warning");
        }

        let mut successes = Vec::new();
        let mut failures = Vec::new();
        let mut history = Vec::new();

        for server_id in &targets {
            match self.deploy_to_target(&config, &report, server_id).await {
                Ok(server) => {
                    info!(config_id, server_id = %server.id, name = %server.name, "Configuration applied");
                    history.push(
                        HistoryEntry::new(HistoryAction::Deployed)
                            .for_server(server.id.clone())
                            .with_note(format!("applied to {}", server.name)),
                    );
                    successes.push(TargetSuccess {
                        server_id: server.id,
                        name: server.name,
                    });
                }
                Err(failure) => {
                    warn!(config_id, server_id = %failure.server_id, reason = %failure.reason, "Deployment to server failed");
                    history.push(
                        HistoryEntry::new(HistoryAction::Failed)
                            .for_server(failure.server_id.clone())
                            .with_note(failure.reason.clone()),
                    );
                    failures.push(failure);
                }
            }
        }

        self.finish(config_id, history, !successes.is_empty()).await?;

        let result = DeploymentResult::new(successes, failures);
        info!(config_id, success = result.success, message = %result.message, "Deployment finished");
        Ok(result)
    }

    async fn deploy_to_target(
        &self,
        config: &Configuration,
        report: &ValidationReport,
        server_id: &str,
    ) -> Result<Server, TargetFailure> {
        let fail = |name: Option<&str>, err: FleetError| TargetFailure {
            server_id: server_id.to_string(),
            name: name.map(str::to_string),
            reason: err.to_string(),
        };

        let mut server = match self.repo.find_server(server_id) {
            Ok(Some(server)) => server,
            Ok(None) => {
                return Err(TargetFailure {
                    server_id: server_id.to_string(),
                    name: None,
                    reason: REASON_SERVER_NOT_FOUND.to_string(),
                })
            }
            Err(e) => return Err(fail(None, e.into())),
        };
        let name = Some(server.name.as_str());

        if report.has_errors {
            return Err(fail(name, FleetError::ValidationFailed(report.errors.join("; "))));
        }

        let validation = self
            .gateway
            .check_deployable(&server.address, &config.content)
            .await
            .map_err(|e| fail(name, e.into()))?;
        if !validation.is_valid {
            let message = validation
                .message
                .unwrap_or_else(|| "target rejected configuration".to_string());
            return Err(fail(name, FleetError::ValidationFailed(message)));
        }
        if validation.fallback {
            debug!(server_id, "Target validated by reachability only");
        }

        self.gateway
            .apply(&server.address, &config.content)
            .await
            .map_err(|e| fail(name, e.into()))?;

        self.supersede_others(&config.id, &server)
            .await
            .map_err(|e| fail(name, e))?;

        server.active_config_id = Some(config.id.clone());
        server.status = ServerStatus::Online;
        server.last_pinged = Some(Utc::now());
        match self.repo.update_server(&server) {
            Ok(true) => Ok(server),
            Ok(false) => Err(TargetFailure {
                server_id: server_id.to_string(),
                name: Some(server.name.clone()),
                reason: REASON_SERVER_NOT_FOUND.to_string(),
            }),
            Err(e) => Err(fail(Some(&server.name), e.into())),
        }
    }

    /// Demote every other live configuration on `server` back to draft
    async fn supersede_others(&self, config_id: &str, server: &Server) -> FleetResult<()> {
        let mut candidates: Vec<String> = self
            .repo
            .find_live_configurations_for_server(&server.id)?
            .into_iter()
            .map(|c| c.id)
            .collect();
        if let Some(active) = &server.active_config_id {
            if !candidates.contains(active) {
                candidates.push(active.clone());
            }
        }

        for other_id in candidates.iter().filter(|id| id.as_str() != config_id) {
            let _guard = self.config_locks.lock(other_id).await;

            let Some(mut other) = self.repo.find_configuration(other_id)? else {
                continue;
            };
            if other.status != ConfigStatus::Live {
                continue;
            }

            other.status = ConfigStatus::Draft;
            other.record(
                HistoryEntry::new(HistoryAction::Superseded)
                    .for_server(server.id.clone())
                    .with_note(format!("superseded by {}", config_id)),
            );
            self.repo.update_configuration(&other)?;
            info!(config_id = %other.id, superseded_by = config_id, server_id = %server.id, "Configuration superseded");
        }

        Ok(())
    }

    /// Append this call's history and mark the configuration live once
    async fn finish(&self, config_id: &str, history: Vec<HistoryEntry>, any_success: bool) -> FleetResult<()> {
        let _guard = self.config_locks.lock(config_id).await;

        let Some(mut config) = self.repo.find_configuration(config_id)? else {
            warn!(config_id, "Configuration disappeared during deployment");
            return Ok(());
        };

        for entry in history {
            config.record(entry);
        }
        if any_success {
            config.status = ConfigStatus::Live;
        }
        self.repo.update_configuration(&config)?;
        Ok(())
    }
}

fn resolve_targets(config: &Configuration, explicit: Option<&[String]>) -> Vec<String> {
    match explicit {
        Some(ids) if !ids.is_empty() => {
            let mut seen = HashSet::new();
            ids.iter()
                .filter(|id| seen.insert(id.as_str()))
                .cloned()
                .collect()
        }
        _ => config.servers.iter().cloned().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn success(id: &str) -> TargetSuccess {
        TargetSuccess {
            server_id: id.to_string(),
            name: id.to_string(),
        }
    }

    fn failure(id: &str) -> TargetFailure {
        TargetFailure {
            server_id: id.to_string(),
            name: None,
            reason: REASON_SERVER_NOT_FOUND.to_string(),
        }
    }

    #[test]
    fn test_result_all_succeeded() {
        let result = DeploymentResult::new(vec![success("a"), success("b")], vec![]);
        assert!(result.success);
        assert_eq!(result.message, "Configuration applied to 2 server(s).");
    }

    #[test]
    fn test_result_partial() {
        let result = DeploymentResult::new(vec![success("a")], vec![failure("b")]);
        assert!(!result.success);
        assert_eq!(
            result.message,
            "Configuration partially applied. 1 succeeded, 1 failed."
        );
    }

    #[test]
    fn test_result_none_succeeded() {
        let result = DeploymentResult::new(vec![], vec![failure("a"), failure("b")]);
        assert!(!result.success);
        assert_eq!(
            result.message,
            "Configuration failed to apply to any server. 2 failed."
        );

        let empty = DeploymentResult::new(vec![], vec![]);
        assert!(!empty.success);
    }

    #[test]
    fn test_resolve_targets_prefers_explicit_list() {
        let config = Configuration::new("c", serde_json::json!({})).with_servers(["s1", "s2"]);

        let explicit = vec!["s3".to_string(), "s3".to_string(), "s1".to_string()];
        assert_eq!(resolve_targets(&config, Some(explicit.as_slice())), vec!["s3", "s1"]);

        assert_eq!(resolve_targets(&config, Some(&[][..])), vec!["s1", "s2"]);
        assert_eq!(resolve_targets(&config, None), vec!["s1", "s2"]);
    }

    #[test]
    fn test_entity_locks_share_per_id() {
        let locks = EntityLocks::default();
        let a1 = locks.get("a");
        let a2 = locks.get("a");
        let b = locks.get("b");
        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));
    }

    #[tokio::test]
    async fn test_lock_all_tolerates_duplicates() {
        let locks = EntityLocks::default();
        let ids = vec!["b".to_string(), "a".to_string(), "b".to_string()];
        let guards = locks.lock_all(&ids).await;
        assert_eq!(guards.len(), 2);
        assert!(locks.get("a").try_lock().is_err());
        drop(guards);
        assert!(locks.get("a").try_lock().is_ok());
    }

    #[tokio::test]
    async fn test_released_locks_leave_no_entries() {
        let locks = EntityLocks::default();
        let ids: Vec<String> = (0..50).map(|i| format!("server-{}", i)).collect();

        let guards = locks.lock_all(&ids).await;
        assert_eq!(locks.len(), 50);
        drop(guards);
        assert_eq!(locks.len(), 0);

        let guard = locks.lock("server-1").await;
        drop(locks.lock("server-2").await);
        assert_eq!(locks.len(), 1);
        drop(guard);
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn test_entry_survives_while_a_waiter_holds_it() {
        let locks = Arc::new(EntityLocks::default());
        let first = locks.lock("a").await;

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _second = locks.lock("a").await;
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        drop(first);
        assert_eq!(locks.len(), 1);
        waiter.await.unwrap();
        assert_eq!(locks.len(), 0);
    }
}
