//! Control API over the fleet service
//!
//! JSON over HTTP/1.1 and HTTP/2. Every route except `/health` and `/version`
//! requires `Authorization: Bearer <token>`.

use crate::error::{ErrorCode, ErrorResponse, FleetError, FleetResult};
use crate::fleet::FleetService;
use crate::models::ServerAddress;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes};
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

#[derive(Debug, Deserialize)]
pub struct RegisterServerRequest {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub admin_path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateConfigurationRequest {
    pub name: String,
    pub content: serde_json::Value,
    #[serde(default)]
    pub servers: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ApplyRequest {
    #[serde(default)]
    pub servers: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StartMonitorRequest {
    pub interval_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
struct MonitorStatus {
    running: bool,
    interval_ms: u64,
    probe_timeout_ms: u64,
    last_report: Option<crate::health::CycleReport>,
}

/// Routes understood by the control API
#[derive(Debug, Clone, PartialEq, Eq)]
enum Route<'a> {
    Health,
    Version,
    ListServers,
    RegisterServer,
    CheckAllServers,
    GetServer(&'a str),
    CheckServer(&'a str),
    ListConfigurations,
    CreateConfiguration,
    GetConfiguration(&'a str),
    ApplyConfiguration(&'a str),
    Validate,
    MonitorStatus,
    StartMonitor,
    StopMonitor,
    NotFound,
}

fn route<'a>(method: &Method, path: &'a str) -> Route<'a> {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    match (method, segments.as_slice()) {
        (&Method::GET, ["health"]) => Route::Health,
        (&Method::GET, ["version"]) => Route::Version,

        (&Method::GET, ["servers"]) => Route::ListServers,
        (&Method::POST, ["servers"]) => Route::RegisterServer,
        (&Method::POST, ["servers", "check"]) => Route::CheckAllServers,
        (&Method::GET, ["servers", id]) if !id.is_empty() => Route::GetServer(*id),
        (&Method::POST, ["servers", id, "check"]) => Route::CheckServer(*id),

        (&Method::GET, ["configurations"]) => Route::ListConfigurations,
        (&Method::POST, ["configurations"]) => Route::CreateConfiguration,
        (&Method::GET, ["configurations", id]) if !id.is_empty() => Route::GetConfiguration(*id),
        (&Method::POST, ["configurations", id, "apply"]) => Route::ApplyConfiguration(*id),

        (&Method::POST, ["validate"]) => Route::Validate,

        (&Method::GET, ["health-monitor"]) => Route::MonitorStatus,
        (&Method::POST, ["health-monitor", "start"]) => Route::StartMonitor,
        (&Method::POST, ["health-monitor", "stop"]) => Route::StopMonitor,

        _ => Route::NotFound,
    }
}

/// Control API server
pub struct ControlApi {
    bind_addr: SocketAddr,
    fleet: Arc<FleetService>,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Arc<String>,
}

impl ControlApi {
    pub fn new(
        bind_addr: SocketAddr,
        fleet: Arc<FleetService>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            fleet,
            shutdown_rx,
            auth_token: Arc::new(auth_token),
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Control API listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let fleet = Arc::clone(&self.fleet);
                            let auth_token = Arc::clone(&self.auth_token);

                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let fleet = Arc::clone(&fleet);
                                    let token = Arc::clone(&auth_token);
                                    async move { Ok::<_, hyper::Error>(handle_request(req, fleet, token).await) }
                                });

                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(addr = %addr, error = %e, "Control API connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept control API connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Control API shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

fn check_auth<B>(req: &Request<B>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| auth.strip_prefix("Bearer ").unwrap_or(auth) == expected_token)
        .unwrap_or(false)
}

/// Route and serve one request
pub async fn handle_request<B>(
    req: Request<B>,
    fleet: Arc<FleetService>,
    auth_token: Arc<String>,
) -> Response<Full<Bytes>>
where
    B: Body,
    B::Error: std::fmt::Display,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let route = route(&method, &path);

    debug!(%method, %path, "Control API request");

    match route {
        Route::Health => return json_response(StatusCode::OK, r#"{"status":"ok"}"#),
        Route::Version => {
            let version = serde_json::json!({ "name": PKG_NAME, "version": VERSION });
            return json_response(StatusCode::OK, version.to_string());
        }
        _ => {}
    }

    if !check_auth(&req, &auth_token) {
        warn!(%path, "Unauthorized control API request");
        return error_response(ErrorCode::Unauthorized, "unauthorized");
    }

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return error_response(
                ErrorCode::InvalidRequest,
                format!("failed to read request body: {}", e),
            )
        }
    };

    match dispatch(route, &body, &fleet).await {
        Ok(response) => response,
        Err(e) => {
            match &e {
                FleetError::Storage(inner) => error!(%path, error = %inner, "Control API storage error"),
                other => debug!(%path, error = %other, "Control API request failed"),
            }
            let body = ErrorResponse::from(&e);
            json_response(e.code().status_code(), body.to_json())
        }
    }
}

async fn dispatch(route: Route<'_>, body: &Bytes, fleet: &FleetService) -> FleetResult<Response<Full<Bytes>>> {
    match route {
        Route::ListServers => ok_json(StatusCode::OK, &fleet.list_servers()?),
        Route::RegisterServer => {
            let req: RegisterServerRequest = parse_body(body)?;
            let mut address = ServerAddress::new(req.host, req.port);
            if let Some(path) = req.admin_path {
                address = address.with_admin_path(path);
            }
            ok_json(StatusCode::CREATED, &fleet.register_server(&req.name, address)?)
        }
        Route::CheckAllServers => ok_json(StatusCode::OK, &fleet.check_all_servers().await?),
        Route::GetServer(id) => ok_json(StatusCode::OK, &fleet.get_server(id)?),
        Route::CheckServer(id) => ok_json(StatusCode::OK, &fleet.check_one_server(id).await?),

        Route::ListConfigurations => ok_json(StatusCode::OK, &fleet.list_configurations()?),
        Route::CreateConfiguration => {
            let req: CreateConfigurationRequest = parse_body(body)?;
            ok_json(
                StatusCode::CREATED,
                &fleet.create_configuration(&req.name, req.content, req.servers)?,
            )
        }
        Route::GetConfiguration(id) => ok_json(StatusCode::OK, &fleet.get_configuration(id)?),
        Route::ApplyConfiguration(id) => {
            let req: ApplyRequest = parse_optional_body(body)?;
            let result = fleet.apply_configuration(id, req.servers.as_deref()).await?;
            ok_json(StatusCode::OK, &result)
        }

        Route::Validate => {
            let content: serde_json::Value = parse_body(body)?;
            ok_json(StatusCode::OK, &fleet.validate_configuration(&content))
        }

        Route::MonitorStatus => {
            let monitor = fleet.health_monitor();
            let current = monitor.current_interval().await;
            let status = MonitorStatus {
                running: current.is_some(),
                interval_ms: current.unwrap_or_else(|| monitor.default_interval()).as_millis() as u64,
                probe_timeout_ms: monitor.probe_timeout().as_millis() as u64,
                last_report: monitor.last_report(),
            };
            ok_json(StatusCode::OK, &status)
        }
        Route::StartMonitor => {
            let req: StartMonitorRequest = parse_optional_body(body)?;
            let outcome = fleet.start_health_monitor(req.interval_ms).await?;
            ok_json(StatusCode::OK, &serde_json::json!({ "outcome": outcome }))
        }
        Route::StopMonitor => {
            let stopped = fleet.stop_health_monitor().await;
            ok_json(StatusCode::OK, &serde_json::json!({ "stopped": stopped }))
        }

        Route::Health | Route::Version => Ok(json_response(StatusCode::OK, "{}")),
        Route::NotFound => Ok(error_response(ErrorCode::NotFound, "route not found")),
    }
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> FleetResult<T> {
    serde_json::from_slice(body).map_err(|e| FleetError::InvalidRequest(format!("invalid JSON body: {}", e)))
}

fn parse_optional_body<T: DeserializeOwned + Default>(body: &Bytes) -> FleetResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        Ok(T::default())
    } else {
        parse_body(body)
    }
}

// ==================== Helper Functions ====================

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

fn ok_json<T: Serialize>(status: StatusCode, value: &T) -> FleetResult<Response<Full<Bytes>>> {
    let body = serde_json::to_vec(value).map_err(|e| FleetError::Storage(e.into()))?;
    Ok(json_response(status, body))
}

fn error_response(code: ErrorCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    json_response(code.status_code(), ErrorResponse::new(code, message).to_json())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FleetConfig, StoreBackend, StoreConfig};

    fn fleet() -> Arc<FleetService> {
        let config = FleetConfig {
            store: StoreConfig::in_memory(StoreBackend::Document),
            ..FleetConfig::default()
        };
        Arc::new(FleetService::from_config(&config).unwrap())
    }

    fn request(method: Method, path: &str, token: Option<&str>, body: &str) -> Request<Full<Bytes>> {
        let mut builder = Request::builder().method(method).uri(path);
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        builder.body(Full::new(Bytes::from(body.to_string()))).unwrap()
    }

    async fn body_json(response: Response<Full<Bytes>>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_routing() {
        assert_eq!(route(&Method::GET, "/health"), Route::Health);
        assert_eq!(route(&Method::GET, "/servers/"), Route::ListServers);
        assert_eq!(route(&Method::POST, "/servers/check"), Route::CheckAllServers);
        assert_eq!(route(&Method::GET, "/servers/abc"), Route::GetServer("abc"));
        assert_eq!(route(&Method::POST, "/servers/abc/check"), Route::CheckServer("abc"));
        assert_eq!(
            route(&Method::POST, "/configurations/c1/apply"),
            Route::ApplyConfiguration("c1")
        );
        assert_eq!(route(&Method::DELETE, "/servers/abc"), Route::NotFound);
        assert_eq!(route(&Method::POST, "/health-monitor/stop"), Route::StopMonitor);
    }

    #[tokio::test]
    async fn test_health_needs_no_auth() {
        let response = handle_request(
            request(Method::GET, "/health", None, ""),
            fleet(),
            Arc::new("t".to_string()),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unauthorized() {
        let response = handle_request(
            request(Method::GET, "/servers", Some("wrong"), ""),
            fleet(),
            Arc::new("t".to_string()),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["code"], "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn test_register_then_list_servers() {
        let fleet = fleet();
        let token = Arc::new("t".to_string());

        let response = handle_request(
            request(
                Method::POST,
                "/servers",
                Some("t"),
                r#"{"name":"edge-1","host":"10.0.0.1","port":2019}"#,
            ),
            Arc::clone(&fleet),
            Arc::clone(&token),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = body_json(response).await;
        assert_eq!(created["status"], "unknown");
        assert_eq!(created["address"]["admin_path"], "/config/");

        let response = handle_request(request(Method::GET, "/servers", Some("t"), ""), fleet, token).await;
        let listed = body_json(response).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_apply_without_targets_is_bad_request() {
        let fleet = fleet();
        let config = fleet
            .create_configuration("site", serde_json::json!({}), vec![])
            .unwrap();

        let response = handle_request(
            request(Method::POST, &format!("/configurations/{}/apply", config.id), Some("t"), ""),
            fleet,
            Arc::new("t".to_string()),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], "NO_TARGETS");
    }

    #[tokio::test]
    async fn test_validate_route() {
        let response = handle_request(
            request(Method::POST, "/validate", Some("t"), "{}"),
            fleet(),
            Arc::new("t".to_string()),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let report = body_json(response).await;
        assert_eq!(report["has_errors"], true);
        assert_eq!(report["errors"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_body() {
        let response = handle_request(
            request(Method::POST, "/configurations", Some("t"), "{not json"),
            fleet(),
            Arc::new("t".to_string()),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn test_monitor_status_reports_running_interval() {
        let fleet = fleet();
        let token = Arc::new("t".to_string());

        let response = handle_request(
            request(Method::GET, "/health-monitor", Some("t"), ""),
            Arc::clone(&fleet),
            Arc::clone(&token),
        )
        .await;
        let status = body_json(response).await;
        assert_eq!(status["running"], false);
        assert_eq!(status["interval_ms"], 300_000);

        let response = handle_request(
            request(Method::POST, "/health-monitor/start", Some("t"), r#"{"interval_ms":45000}"#),
            Arc::clone(&fleet),
            Arc::clone(&token),
        )
        .await;
        assert_eq!(body_json(response).await["outcome"], "started");

        let response = handle_request(
            request(Method::GET, "/health-monitor", Some("t"), ""),
            Arc::clone(&fleet),
            Arc::clone(&token),
        )
        .await;
        let status = body_json(response).await;
        assert_eq!(status["running"], true);
        assert_eq!(status["interval_ms"], 45_000);

        assert!(fleet.stop_health_monitor().await);
    }
}
