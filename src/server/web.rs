//! JSON control API.
//!
//! Small route surface over hyper: status/pool snapshots, operator-driven
//! rotation, single-flight refresh and an on-demand probe of the current
//! selection. Non-idempotent routes are POST-only.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use slog_scope::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::pool::check::check_http_via_proxy;
use crate::pool::dial::{dial_via_proxy, split_target};
use crate::pool::manager::ProxyManager;
use crate::pool::node::{ProxyKind, ProxyNode};
use crate::pool::refresh::Refresher;

const REFRESH_DEADLINE: Duration = Duration::from_secs(30);
const CHECK_DEADLINE: Duration = Duration::from_secs(20);
const DEFAULT_POOL_LIMIT: usize = 200;

pub struct WebState {
    pub fixed: Arc<ProxyManager>,
    pub auto: Option<Arc<ProxyManager>>,
    pub refresher: Arc<Refresher>,
    pub dial_timeout: Duration,
}

pub async fn serve(
    listener: TcpListener,
    state: Arc<WebState>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let local_addr = listener.local_addr()?;
    info!(
        "web_listener_started";
        "listen_addr" => local_addr.to_string()
    );
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _peer)) => {
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let state = Arc::clone(&state);
                                async move { handle(req, state).await }
                            });
                            if let Err(e) =
                                http1::Builder::new().serve_connection(io, service).await
                            {
                                debug!("web_connection_error"; "error" => e.to_string());
                            }
                        });
                    }
                    Err(e) => {
                        warn!("web_accept_error"; "error" => e.to_string());
                    }
                }
            }
        }
    }
}

async fn handle(
    req: Request<Incoming>,
    state: Arc<WebState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = parse_query(req.uri().query());

    let response = route(&method, &path, &query, &state).await;

    // Pollers are exempt from the access log.
    if path != "/api/status" && path != "/healthz" {
        info!(
            "http_api_request";
            "method" => method.to_string(),
            "path" => path.as_str(),
            "status" => response.status().as_u16(),
            "elapsed_ms" => started.elapsed().as_millis() as u64
        );
    }
    Ok(response)
}

async fn route(
    method: &Method,
    path: &str,
    query: &HashMap<String, String>,
    state: &WebState,
) -> Response<Full<Bytes>> {
    match (method, path) {
        (&Method::GET, "/healthz") => text_response(StatusCode::OK, "ok\n"),
        (&Method::GET, "/api/status") => match manager_for(state, query) {
            Ok(manager) => match serde_json::to_value(manager.status()) {
                Ok(value) => json_response(StatusCode::OK, value),
                Err(e) => json_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({"error": e.to_string()}),
                ),
            },
            Err(resp) => resp,
        },
        (&Method::GET, "/api/pool") => handle_pool(query, state),
        (&Method::POST, "/api/next") => handle_next(query, state),
        (&Method::POST, "/api/refresh") => handle_refresh(state).await,
        (&Method::POST, "/api/check") => handle_check(query, state).await,
        (_, "/api/next" | "/api/refresh" | "/api/check") => json_response(
            StatusCode::METHOD_NOT_ALLOWED,
            json!({"error": "method not allowed"}),
        ),
        _ => json_response(StatusCode::NOT_FOUND, json!({"error": "not found"})),
    }
}

fn handle_pool(query: &HashMap<String, String>, state: &WebState) -> Response<Full<Bytes>> {
    let manager = match manager_for(state, query) {
        Ok(m) => m,
        Err(resp) => return resp,
    };
    let limit = query
        .get("limit")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(DEFAULT_POOL_LIMIT);

    match query.get("type").map(String::as_str) {
        None | Some("") => {
            let items = manager.pool_snapshot(limit);
            json_response(
                StatusCode::OK,
                json!({"items": items, "pool_size": manager.pool_size()}),
            )
        }
        Some(kind_param) => {
            let Some(kind) = ProxyKind::parse(kind_param) else {
                return json_response(
                    StatusCode::BAD_REQUEST,
                    json!({"error": format!("unknown proxy type: {kind_param}")}),
                );
            };
            let items = manager.pool_snapshot_by_kind(kind, limit);
            json_response(
                StatusCode::OK,
                json!({
                    "type": kind.as_str(),
                    "items": items,
                    "pool_size": manager.pool_size_by_kind(kind),
                }),
            )
        }
    }
}

fn handle_next(query: &HashMap<String, String>, state: &WebState) -> Response<Full<Bytes>> {
    let manager = match manager_for(state, query) {
        Ok(m) => m,
        Err(resp) => return resp,
    };
    let kind_param = query
        .get("type")
        .map(String::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or("socks5");
    let Some(kind) = ProxyKind::parse(kind_param) else {
        return json_response(
            StatusCode::BAD_REQUEST,
            json!({"error": format!("unknown proxy type: {kind_param}")}),
        );
    };
    match manager.next(kind) {
        Some(node) => json_response(
            StatusCode::OK,
            json!({
                "status": "ok",
                "type": kind.as_str(),
                "new_proxy": node.to_string(),
            }),
        ),
        None => json_response(StatusCode::CONFLICT, json!({"status": "empty_pool"})),
    }
}

async fn handle_refresh(state: &WebState) -> Response<Full<Bytes>> {
    let report = match timeout(REFRESH_DEADLINE, state.refresher.refresh()).await {
        Ok(report) => report,
        Err(_) => {
            return json_response(
                StatusCode::BAD_GATEWAY,
                json!({"count": 0, "error": "refresh timed out"}),
            );
        }
    };
    match report.error {
        Some(err) if report.count > 0 => json_response(
            StatusCode::OK,
            json!({"count": report.count, "warning": err.to_string()}),
        ),
        Some(err) => json_response(
            StatusCode::BAD_GATEWAY,
            json!({"count": report.count, "error": err.to_string()}),
        ),
        None => json_response(StatusCode::OK, json!({"count": report.count})),
    }
}

async fn handle_check(query: &HashMap<String, String>, state: &WebState) -> Response<Full<Bytes>> {
    let manager = match manager_for(state, query) {
        Ok(m) => m,
        Err(resp) => return resp,
    };
    let kind_param = query
        .get("type")
        .map(String::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or("socks5");
    let Some(kind) = ProxyKind::parse(kind_param) else {
        return json_response(
            StatusCode::BAD_REQUEST,
            json!({"error": format!("unknown proxy type: {kind_param}")}),
        );
    };
    let Some(node) = manager.current(kind) else {
        return json_response(
            StatusCode::CONFLICT,
            json!({"valid": false, "error": "empty_pool"}),
        );
    };

    let target = query
        .get("target")
        .cloned()
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| default_check_target(kind).to_string());

    let start = Instant::now();
    if target.starts_with("http://") || target.starts_with("https://") {
        let outcome = timeout(
            CHECK_DEADLINE,
            check_http_via_proxy(&node, &target, state.dial_timeout),
        )
        .await;
        return match outcome {
            Ok(Ok(latency)) => check_response(&node, kind, &target, latency, None),
            Ok(Err(err)) => check_response(
                &node,
                kind,
                &target,
                start.elapsed().as_millis() as i64,
                Some(err.to_string()),
            ),
            Err(_) => check_response(
                &node,
                kind,
                &target,
                start.elapsed().as_millis() as i64,
                Some("check timed out".to_string()),
            ),
        };
    }

    let (host, port) = match split_target(&target) {
        Ok(parts) => parts,
        Err(_) => {
            return json_response(
                StatusCode::BAD_REQUEST,
                json!({"error": format!("target must be host:port or a http(s) url: {target}")}),
            );
        }
    };
    let want_tls = tls_requested(query.get("tls").map(String::as_str), port);

    let probe = async {
        let stream = dial_via_proxy(&node, &target, state.dial_timeout).await?;
        if want_tls {
            tls_probe(stream, &host).await?;
        }
        Ok::<(), Error>(())
    };
    let outcome = timeout(CHECK_DEADLINE, probe).await;
    let latency = (start.elapsed().as_millis() as i64).max(1);
    match outcome {
        Ok(Ok(())) => check_response(&node, kind, &target, latency, None),
        Ok(Err(err)) => check_response(&node, kind, &target, latency, Some(err.to_string())),
        Err(_) => check_response(
            &node,
            kind,
            &target,
            latency,
            Some("check timed out".to_string()),
        ),
    }
}

async fn tls_probe(stream: TcpStream, host: &str) -> Result<(), Error> {
    let connector = native_tls::TlsConnector::new().map_err(|e| Error::Tls(e.to_string()))?;
    let connector = tokio_native_tls::TlsConnector::from(connector);
    let tls = connector
        .connect(host, stream)
        .await
        .map_err(|e| Error::Tls(e.to_string()))?;
    drop(tls);
    Ok(())
}

/// `tls=1`/`true` forces the handshake, `tls=0`/`false` suppresses it, and
/// an unset parameter probes TLS only on the conventional port.
fn tls_requested(param: Option<&str>, port: u16) -> bool {
    match param {
        Some("1") | Some("true") => true,
        Some("0") | Some("false") => false,
        _ => port == 443,
    }
}

fn default_check_target(kind: ProxyKind) -> &'static str {
    match kind {
        ProxyKind::Http => "http://example.com/",
        ProxyKind::Socks5 => "example.com:443",
    }
}

fn check_response(
    node: &ProxyNode,
    kind: ProxyKind,
    target: &str,
    latency: i64,
    error: Option<String>,
) -> Response<Full<Bytes>> {
    let mut value = json!({
        "valid": error.is_none(),
        "latency": latency,
        "type": kind.as_str(),
        "proxy": node.to_string(),
        "target": target,
    });
    if let Some(err) = error {
        value["error"] = json!(err);
    }
    json_response(StatusCode::OK, value)
}

fn manager_for<'a>(
    state: &'a WebState,
    query: &HashMap<String, String>,
) -> Result<&'a Arc<ProxyManager>, Response<Full<Bytes>>> {
    match query.get("mode").map(String::as_str) {
        None | Some("") | Some("fixed") => Ok(&state.fixed),
        Some("auto") => state.auto.as_ref().ok_or_else(|| {
            json_response(
                StatusCode::NOT_FOUND,
                json!({"error": "auto pool not configured"}),
            )
        }),
        Some(other) => Err(json_response(
            StatusCode::BAD_REQUEST,
            json!({"error": format!("unknown mode: {other}")}),
        )),
    }
}

fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    let Some(query) = query else {
        return HashMap::new();
    };
    url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}

fn json_response(status: StatusCode, value: serde_json::Value) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from(value.to_string())));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/json; charset=utf-8"),
    );
    resp
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::fetch::ProxySource;
    use crate::pool::node::parse_proxy_line;
    use crate::pool::validate::ValidationConfig;

    #[test]
    fn test_parse_query() {
        let q = parse_query(Some("type=socks5&limit=10&mode="));
        assert_eq!(q.get("type").map(String::as_str), Some("socks5"));
        assert_eq!(q.get("limit").map(String::as_str), Some("10"));
        assert_eq!(q.get("mode").map(String::as_str), Some(""));
        assert!(parse_query(None).is_empty());
    }

    #[test]
    fn test_tls_requested() {
        assert!(tls_requested(Some("1"), 80));
        assert!(tls_requested(Some("true"), 80));
        assert!(!tls_requested(Some("0"), 443));
        assert!(!tls_requested(Some("false"), 443));
        assert!(tls_requested(None, 443));
        assert!(!tls_requested(None, 80));
    }

    fn test_state(auto: bool) -> Arc<WebState> {
        let fixed = Arc::new(ProxyManager::new());
        let auto_manager = auto.then(|| Arc::new(ProxyManager::new()));
        let mut managers = vec![Arc::clone(&fixed)];
        if let Some(a) = &auto_manager {
            managers.push(Arc::clone(a));
        }
        let refresher = Arc::new(
            Refresher::new(
                managers,
                vec![ProxySource {
                    // Connection refused immediately; refresh fails fast.
                    url: "http://127.0.0.1:1/feed".into(),
                    kind: String::new(),
                }],
                Vec::new(),
                ValidationConfig::default(),
                Duration::from_secs(1),
            )
            .unwrap(),
        );
        Arc::new(WebState {
            fixed,
            auto: auto_manager,
            refresher,
            dial_timeout: Duration::from_secs(1),
        })
    }

    async fn start_web(state: Arc<WebState>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, state, CancellationToken::new()));
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_healthz_and_status() {
        let state = test_state(false);
        state.fixed.set_pool(vec![
            parse_proxy_line("socks5://1.2.3.4:1080", "").unwrap(),
            parse_proxy_line("http://5.6.7.8:8080", "").unwrap(),
        ]);
        let base = start_web(state).await;
        let client = reqwest::Client::new();

        let resp = client.get(format!("{base}/healthz")).send().await.unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        assert_eq!(resp.text().await.unwrap(), "ok\n");

        let resp = client
            .get(format!("{base}/api/status"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        let status: serde_json::Value =
            serde_json::from_str(&resp.text().await.unwrap()).unwrap();
        assert_eq!(status["current_socks5"], "1.2.3.4:1080");
        assert_eq!(status["socks5_pool_size"], 1);
        assert_eq!(status["http_pool_size"], 1);
        assert_eq!(status["pool_size"], 2);
    }

    #[tokio::test]
    async fn test_next_rotates_and_conflicts_when_empty() {
        let state = test_state(false);
        state.fixed.set_pool(vec![
            parse_proxy_line("socks5://1.1.1.1:1080", "").unwrap(),
            parse_proxy_line("socks5://2.2.2.2:1080", "").unwrap(),
        ]);
        let base = start_web(Arc::clone(&state)).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{base}/api/next?type=socks5"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        let body: serde_json::Value = serde_json::from_str(&resp.text().await.unwrap()).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["new_proxy"], "socks5://2.2.2.2:1080");

        let resp = client
            .post(format!("{base}/api/next?type=http"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 409);

        // GET on a POST-only route.
        let resp = client
            .get(format!("{base}/api/next"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 405);
    }

    #[tokio::test]
    async fn test_pool_snapshot_routes() {
        let state = test_state(true);
        state.fixed.set_pool(vec![
            parse_proxy_line("socks5://1.1.1.1:1080", "").unwrap(),
            parse_proxy_line("http://2.2.2.2:8080", "").unwrap(),
        ]);
        let base = start_web(state).await;
        let client = reqwest::Client::new();

        let resp = client
            .get(format!("{base}/api/pool?limit=1"))
            .send()
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_str(&resp.text().await.unwrap()).unwrap();
        assert_eq!(body["pool_size"], 2);
        assert_eq!(body["items"].as_array().unwrap().len(), 1);

        let resp = client
            .get(format!("{base}/api/pool?type=http"))
            .send()
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_str(&resp.text().await.unwrap()).unwrap();
        assert_eq!(body["pool_size"], 1);
        assert_eq!(body["type"], "http");

        // The auto manager exists but has an empty pool.
        let resp = client
            .get(format!("{base}/api/pool?mode=auto"))
            .send()
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_str(&resp.text().await.unwrap()).unwrap();
        assert_eq!(body["pool_size"], 0);

        let resp = client
            .get(format!("{base}/api/pool?mode=bogus"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 400);
    }

    #[tokio::test]
    async fn test_refresh_route_total_failure() {
        let state = test_state(false);
        let base = start_web(state).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{base}/api/refresh"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 502);
        let body: serde_json::Value = serde_json::from_str(&resp.text().await.unwrap()).unwrap();
        assert_eq!(body["count"], 0);
        assert!(body["error"].as_str().unwrap().contains("fetch failed"));
    }

    #[tokio::test]
    async fn test_check_empty_pool() {
        let state = test_state(false);
        let base = start_web(state).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{base}/api/check"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 409);
        let body: serde_json::Value = serde_json::from_str(&resp.text().await.unwrap()).unwrap();
        assert_eq!(body["valid"], false);
    }

    #[tokio::test]
    async fn test_check_unreachable_upstream_reports_invalid() {
        let state = test_state(false);
        state
            .fixed
            .set_pool(vec![parse_proxy_line("socks5://127.0.0.1:1", "").unwrap()]);
        let base = start_web(state).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!(
                "{base}/api/check?target=127.0.0.1:9&tls=0&type=socks5"
            ))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        let body: serde_json::Value = serde_json::from_str(&resp.text().await.unwrap()).unwrap();
        assert_eq!(body["valid"], false);
        assert!(body["error"].as_str().is_some());
        assert_eq!(body["proxy"], "socks5://127.0.0.1:1");
    }
}
