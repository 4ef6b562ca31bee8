//! Outbound HTTP client for proxy admin APIs
//!
//! One pooled hyper client is shared by every target; each request is bound to
//! `scheme://host:port` of the target and timeboxed. Nothing here retries.

use crate::config::GatewayConfig;
use crate::error::FleetError;
use crate::models::ServerAddress;
use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{ACCEPT, CONTENT_TYPE};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Longest response body excerpt carried in errors
const MAX_BODY_EXCERPT: usize = 512;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{0}")]
    ConnectionFailed(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("target returned {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("request build error: {0}")]
    RequestBuild(String),
}

impl From<GatewayError> for FleetError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::ConnectionFailed(_) | GatewayError::Timeout(_) => {
                FleetError::ConnectionFailed(err.to_string())
            }
            GatewayError::Rejected { .. } => FleetError::ApplyFailed(err.to_string()),
            GatewayError::RequestBuild(msg) => FleetError::InvalidRequest(msg),
        }
    }
}

/// Status and body of a completed admin request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

impl RawResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Answer of the target's validate-only verb
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidateOutcome {
    Valid,
    Invalid(String),
    /// The target does not implement the verb
    Unsupported,
}

/// Result of a deploy-time check against one target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetValidation {
    pub is_valid: bool,
    pub message: Option<String>,
    /// True when only reachability could be checked
    pub fallback: bool,
}

/// The remote verbs the fleet uses against a proxy admin API
#[async_trait]
pub trait ServerGateway: Send + Sync {
    /// GET the admin path
    async fn probe(&self, target: &ServerAddress) -> Result<RawResponse, GatewayError>;

    /// POST the document to the validate-only endpoint
    async fn validate(
        &self,
        target: &ServerAddress,
        content: &serde_json::Value,
    ) -> Result<ValidateOutcome, GatewayError>;

    /// POST the document to the admin path, replacing the running config
    async fn apply(
        &self,
        target: &ServerAddress,
        content: &serde_json::Value,
    ) -> Result<RawResponse, GatewayError>;

    /// Validate-only when supported, otherwise fall back to a reachability
    /// probe where any HTTP answer counts as valid
    async fn check_deployable(
        &self,
        target: &ServerAddress,
        content: &serde_json::Value,
    ) -> Result<TargetValidation, GatewayError> {
        match self.validate(target, content).await? {
            ValidateOutcome::Valid => Ok(TargetValidation {
                is_valid: true,
                message: None,
                fallback: false,
            }),
            ValidateOutcome::Invalid(message) => Ok(TargetValidation {
                is_valid: false,
                message: Some(message),
                fallback: false,
            }),
            ValidateOutcome::Unsupported => {
                debug!(host = %target.host, port = target.port, "Validate-only verb unsupported, probing instead");
                self.probe(target).await?;
                Ok(TargetValidation {
                    is_valid: true,
                    message: Some("validate-only unsupported; target reachable".to_string()),
                    fallback: true,
                })
            }
        }
    }
}

/// Request counters for the gateway
#[derive(Debug, Default)]
pub struct GatewayStats {
    pub probes: AtomicU64,
    pub validations: AtomicU64,
    pub applies: AtomicU64,
}

impl GatewayStats {
    pub fn get_probes(&self) -> u64 {
        self.probes.load(Ordering::Relaxed)
    }

    pub fn get_validations(&self) -> u64 {
        self.validations.load(Ordering::Relaxed)
    }

    pub fn get_applies(&self) -> u64 {
        self.applies.load(Ordering::Relaxed)
    }
}

/// hyper-backed [`ServerGateway`]
pub struct HttpGateway {
    client: Client<HttpConnector, Full<Bytes>>,
    config: GatewayConfig,
    stats: Arc<GatewayStats>,
}

impl HttpGateway {
    pub fn new(config: GatewayConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);
        connector.set_connect_timeout(Some(config.request_timeout()));

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(config.pool_idle_timeout())
            .build(connector);

        debug!(
            timeout_secs = config.request_timeout_secs,
            max_idle = config.pool_max_idle_per_host,
            "Gateway client initialized"
        );

        Self {
            client,
            config,
            stats: Arc::new(GatewayStats::default()),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<GatewayStats> {
        Arc::clone(&self.stats)
    }

    /// `scheme://host:port` for a target
    pub fn base_url(&self, target: &ServerAddress) -> String {
        base_url(&self.config.scheme, target)
    }

    async fn send(
        &self,
        method: Method,
        url: String,
        body: Option<&serde_json::Value>,
    ) -> Result<RawResponse, GatewayError> {
        let payload = match body {
            Some(value) => Bytes::from(
                serde_json::to_vec(value).map_err(|e| GatewayError::RequestBuild(e.to_string()))?,
            ),
            None => Bytes::new(),
        };

        let req = Request::builder()
            .method(method.clone())
            .uri(&url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .body(Full::new(payload))
            .map_err(|e| GatewayError::RequestBuild(e.to_string()))?;

        let timeout = self.config.request_timeout();
        let exchange = async {
            let response = self
                .client
                .request(req)
                .await
                .map_err(|e| GatewayError::ConnectionFailed(describe_client_error(&e)))?;
            let status = response.status().as_u16();
            let bytes = response
                .into_body()
                .collect()
                .await
                .map_err(|e| GatewayError::ConnectionFailed(e.to_string()))?
                .to_bytes();
            Ok::<_, GatewayError>(RawResponse {
                status,
                body: String::from_utf8_lossy(&bytes).into_owned(),
            })
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => {
                if let Ok(resp) = &result {
                    debug!(%method, %url, status = resp.status, "Admin request completed");
                }
                result
            }
            Err(_) => Err(GatewayError::Timeout(timeout)),
        }
    }
}

#[async_trait]
impl ServerGateway for HttpGateway {
    async fn probe(&self, target: &ServerAddress) -> Result<RawResponse, GatewayError> {
        self.stats.probes.fetch_add(1, Ordering::Relaxed);
        let url = format!("{}{}", self.base_url(target), target.normalized_admin_path());
        self.send(Method::GET, url, None).await
    }

    async fn validate(
        &self,
        target: &ServerAddress,
        content: &serde_json::Value,
    ) -> Result<ValidateOutcome, GatewayError> {
        self.stats.validations.fetch_add(1, Ordering::Relaxed);
        let url = format!("{}{}", self.base_url(target), validate_path(target));
        let resp = self.send(Method::POST, url, Some(content)).await?;
        Ok(classify_validate_response(&resp))
    }

    async fn apply(
        &self,
        target: &ServerAddress,
        content: &serde_json::Value,
    ) -> Result<RawResponse, GatewayError> {
        self.stats.applies.fetch_add(1, Ordering::Relaxed);
        let url = format!("{}{}", self.base_url(target), target.normalized_admin_path());
        let resp = self.send(Method::POST, url, Some(content)).await?;
        if resp.is_success() {
            Ok(resp)
        } else {
            Err(GatewayError::Rejected {
                status: resp.status,
                body: excerpt(&resp.body),
            })
        }
    }
}

pub fn base_url(scheme: &str, target: &ServerAddress) -> String {
    let host = target.host.trim();
    if host.contains(':') && !host.starts_with('[') {
        format!("{}://[{}]:{}", scheme, host, target.port)
    } else {
        format!("{}://{}:{}", scheme, host, target.port)
    }
}

pub fn validate_path(target: &ServerAddress) -> String {
    format!("{}/load/config?validate_only=1", target.admin_prefix())
}

fn classify_validate_response(resp: &RawResponse) -> ValidateOutcome {
    if resp.is_success() {
        return ValidateOutcome::Valid;
    }
    match StatusCode::from_u16(resp.status) {
        Ok(StatusCode::NOT_FOUND)
        | Ok(StatusCode::METHOD_NOT_ALLOWED)
        | Ok(StatusCode::NOT_IMPLEMENTED) => ValidateOutcome::Unsupported,
        _ => {
            let body = excerpt(&resp.body);
            if body.is_empty() {
                ValidateOutcome::Invalid(format!("target rejected configuration ({})", resp.status))
            } else {
                ValidateOutcome::Invalid(body)
            }
        }
    }
}

fn excerpt(body: &str) -> String {
    let body = body.trim();
    if body.len() <= MAX_BODY_EXCERPT {
        return body.to_string();
    }
    let mut end = MAX_BODY_EXCERPT;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

fn describe_client_error(err: &hyper_util::client::legacy::Error) -> String {
    use std::error::Error as _;
    match err.source() {
        Some(source) => format!("{}: {}", err, source),
        None => err.to_string(),
    }
}
