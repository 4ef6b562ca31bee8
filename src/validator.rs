//! Static checks on a proxy configuration document before it is sent anywhere
//!
//! The document uses the proxy's native JSON layout:
//! `apps.http.servers.<name>.{listen, routes}`, where each route carries
//! `match` matcher sets and a `handle` list of handlers. Errors block a
//! deployment; warnings are reported but the target may still accept the
//! document.

use serde::Serialize;
use serde_json::{Map, Value};

/// Outcome of [`check`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub has_errors: bool,
    pub errors: Vec<String>,
    pub has_warnings: bool,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
        self.has_errors = true;
    }

    fn warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
        self.has_warnings = true;
    }

    pub fn is_valid(&self) -> bool {
        !self.has_errors
    }
}

pub const NO_HTTP_SERVERS: &str =
    "Configuration has no HTTP servers defined (apps.http.servers is missing or empty)";

/// Inclusive port range a server block listens on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PortRange {
    start: u16,
    end: u16,
}

impl PortRange {
    fn overlaps(&self, other: &PortRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    fn describe_overlap(&self, other: &PortRange) -> String {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        if start == end {
            format!("port {}", start)
        } else {
            format!("ports {}-{}", start, end)
        }
    }
}

struct ListenBlock<'a> {
    name: &'a str,
    ports: Vec<PortRange>,
    host_restricted: bool,
}

/// Check a configuration document. Pure: no I/O, no side effects.
pub fn check(content: &Value) -> ValidationReport {
    let mut report = ValidationReport::default();

    let Some(servers) = http_servers(content) else {
        report.error(NO_HTTP_SERVERS);
        return report;
    };

    let mut blocks = Vec::with_capacity(servers.len());
    for (name, block) in servers {
        let ports = listen_ports(name, block, &mut report);
        let routes = block.get("routes").and_then(Value::as_array);
        blocks.push(ListenBlock {
            name,
            ports,
            host_restricted: routes.is_some_and(|r| all_routes_host_matched(r)),
        });

        if let Some(routes) = routes {
            check_handlers(name, routes, &mut report);
        }
    }

    check_port_conflicts(&blocks, &mut report);

    report
}

fn http_servers(content: &Value) -> Option<&Map<String, Value>> {
    let servers = content
        .get("apps")?
        .get("http")?
        .get("servers")?
        .as_object()?;
    if servers.is_empty() {
        None
    } else {
        Some(servers)
    }
}

fn listen_ports(name: &str, block: &Value, report: &mut ValidationReport) -> Vec<PortRange> {
    let Some(listen) = block.get("listen").and_then(Value::as_array) else {
        return Vec::new();
    };

    let mut ports = Vec::new();
    for addr in listen {
        let Some(addr) = addr.as_str() else {
            report.warning(format!("Server '{}' has a non-string listen address: {}", name, addr));
            continue;
        };
        match parse_listen_address(addr) {
            Ok(Some(range)) => ports.push(range),
            Ok(None) => {}
            Err(reason) => report.warning(format!(
                "Server '{}' listen address '{}' is not checked for port conflicts: {}",
                name, addr, reason
            )),
        }
    }
    ports
}

/// Parse the port part of a listen address such as ":80", "0.0.0.0:443",
/// "tcp/[::1]:8080" or ":8000-8010". Unix sockets and placeholders such as
/// ":{env.HTTP_PORT}" yield `Ok(None)`; they are resolved by the proxy.
fn parse_listen_address(addr: &str) -> Result<Option<PortRange>, String> {
    let addr = addr.trim();
    if addr.contains('{') {
        return Ok(None);
    }
    let addr = match addr.split_once('/') {
        Some((network, rest)) if !network.contains(':') => {
            if network.starts_with("unix") {
                return Ok(None);
            }
            rest
        }
        _ => addr,
    };

    let port_part = match addr.rsplit_once(':') {
        Some((_, port)) => port,
        None => return Err("missing port".to_string()),
    };

    let parse = |s: &str| {
        s.parse::<u16>()
            .map_err(|_| format!("'{}' is not a valid port", s))
    };

    let range = match port_part.split_once('-') {
        Some((start, end)) => PortRange {
            start: parse(start)?,
            end: parse(end)?,
        },
        None => {
            let port = parse(port_part)?;
            PortRange { start: port, end: port }
        }
    };

    if range.start > range.end {
        return Err(format!("port range {}-{} is reversed", range.start, range.end));
    }
    Ok(Some(range))
}

/// True when the block has routes and every one of them only matches on
/// specific hosts
fn all_routes_host_matched(routes: &[Value]) -> bool {
    !routes.is_empty() && routes.iter().all(route_is_host_matched)
}

fn route_is_host_matched(route: &Value) -> bool {
    let Some(matchers) = route.get("match").and_then(Value::as_array) else {
        return false;
    };
    !matchers.is_empty()
        && matchers.iter().all(|set| {
            set.get("host")
                .and_then(Value::as_array)
                .is_some_and(|hosts| !hosts.is_empty())
        })
}

fn check_port_conflicts(blocks: &[ListenBlock<'_>], report: &mut ValidationReport) {
    for (i, a) in blocks.iter().enumerate() {
        for b in &blocks[i + 1..] {
            if a.host_restricted && b.host_restricted {
                continue;
            }
            let conflict = a
                .ports
                .iter()
                .find_map(|pa| b.ports.iter().find(|pb| pa.overlaps(pb)).map(|pb| pa.describe_overlap(pb)));
            if let Some(overlap) = conflict {
                report.error(format!(
                    "Port conflict: servers '{}' and '{}' both listen on {} and not every route is restricted to specific hosts",
                    a.name, b.name, overlap
                ));
            }
        }
    }
}

fn check_handlers(server: &str, routes: &[Value], report: &mut ValidationReport) {
    for (route_idx, route) in routes.iter().enumerate() {
        let Some(handlers) = route.get("handle").and_then(Value::as_array) else {
            continue;
        };

        for handler in handlers {
            match handler.get("handler").and_then(Value::as_str) {
                Some("reverse_proxy") => check_reverse_proxy(server, route_idx, handler, report),
                Some("subroute") => {
                    if let Some(nested) = handler.get("routes").and_then(Value::as_array) {
                        check_handlers(server, nested, report);
                    }
                }
                _ => {}
            }
        }
    }
}

fn check_reverse_proxy(server: &str, route_idx: usize, handler: &Value, report: &mut ValidationReport) {
    let has_upstreams = handler
        .get("upstreams")
        .and_then(Value::as_array)
        .is_some_and(|u| !u.is_empty());
    if !has_upstreams && handler.get("dynamic_upstreams").is_none() {
        report.warning(format!(
            "Server '{}' route {}: reverse_proxy has no upstreams",
            server, route_idx
        ));
    }

    let Some(lb) = handler.get("load_balancing") else {
        return;
    };

    if lb.get("policy").is_some() {
        report.warning(format!(
            "Server '{}' route {}: load_balancing.policy is deprecated, use load_balancing.selection_policy",
            server, route_idx
        ));
    }

    if let Some(policy) = lb.get("selection_policy").and_then(Value::as_str) {
        report.warning(format!(
            "Server '{}' route {}: load_balancing.selection_policy should be an object like {{\"policy\": \"{}\"}}",
            server, route_idx, policy
        ));
    }
}
