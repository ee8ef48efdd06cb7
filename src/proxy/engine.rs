use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use bytes::Bytes;
use futures_util::future::join_all;
use http_body_util::BodyExt;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use super::client::BackendClients;
use super::{
    is_client_cancel, is_hop_by_hop_header, BackendResponse, NodeOutcome, MERGE_CONTENT_TYPE,
    MERGE_REMOVE_HEADERS,
};
use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::filter::{new_filter, Filter, FilterContext};
use crate::model::api::Mock;
use crate::model::{RequestMeta, RouteResult, RouteTable};

/// The data-plane front-end: accepts HTTP, drives selection, the filter
/// chain and backend dispatch, and assembles passthrough or merged
/// responses.
pub struct Proxy {
    config: Config,
    route_table: Arc<RouteTable>,
    filters: Vec<Box<dyn Filter>>,
    clients: BackendClients,
    stopped: AtomicBool,
}

impl Proxy {
    pub fn new(config: Config, route_table: Arc<RouteTable>) -> Result<Arc<Self>> {
        let mut filters: Vec<Box<dyn Filter>> = Vec::with_capacity(config.filters.len());
        for spec in &config.filters {
            let filter = new_filter(spec)?;
            info!("bootstrap: filter added <{}>", filter.name());
            filters.push(filter);
        }

        Ok(Arc::new(Self {
            config,
            route_table,
            filters,
            clients: BackendClients::new(),
            stopped: AtomicBool::new(false),
        }))
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Bind the ingress listener and serve until shutdown
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        let addr = self.config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| GatewayError::Internal(format!("bind {}: {}", addr, e)))?;

        info!("bootstrap: gateway proxy started at <{}>", addr);

        let app = Router::new()
            .fallback(handler)
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(&self));

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .map_err(|e| GatewayError::Internal(format!("ingress server: {}", e)))
    }

    pub async fn handle(self: &Arc<Self>, req: Request, peer: SocketAddr) -> Response {
        if self.is_stopped() {
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }

        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!("proxy: failed to read request body: {}", e);
                return StatusCode::BAD_REQUEST.into_response();
            }
        };

        let host = parts
            .headers
            .get("host")
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .or_else(|| parts.uri.host().map(String::from))
            .unwrap_or_default();
        let meta = RequestMeta::new(
            parts.method.to_string(),
            parts.uri.path().to_string(),
            host,
            parts.uri.query(),
            parts.headers,
            Some(peer.ip()),
        );

        let results = self.route_table.select(&meta).await;
        if results.is_empty() {
            return StatusCode::NOT_FOUND.into_response();
        }

        let merge = results[0].merge;
        let outcomes: Vec<NodeOutcome> = if merge {
            join_all(results.iter().map(|r| self.dispatch(&meta, &body, r))).await
        } else {
            vec![self.dispatch(&meta, &body, &results[0]).await]
        };

        for (result, outcome) in results.iter().zip(outcomes.iter()) {
            if outcome.is_err() {
                if let Some(mock) = &result.api.spec.mock {
                    debug!("proxy: rendering mock for <{}>", result.api.spec.url);
                    return render_mock(mock);
                }
                return status_response(outcome.code);
            }
        }

        if !merge {
            return match outcomes.into_iter().next().and_then(|o| o.res) {
                Some(res) => passthrough_response(res),
                None => StatusCode::BAD_GATEWAY.into_response(),
            };
        }

        merge_response(&results, &outcomes)
    }

    /// Forward one node: rewrite, pre filters, backend call, post/post-err
    /// filters.
    async fn dispatch(
        &self,
        meta: &RequestMeta,
        body: &Bytes,
        result: &RouteResult,
    ) -> NodeOutcome {
        let Some(svr) = &result.svr else {
            return NodeOutcome::fail(GatewayError::NoServer);
        };

        let node = result.node();
        let path_and_query = if node.rewrite.is_empty() {
            if meta.raw_query.is_empty() {
                meta.path.clone()
            } else {
                format!("{}?{}", meta.path, meta.raw_query)
            }
        } else {
            match result.api.rewrite_path(node, meta) {
                Some(rewritten) => {
                    debug!("proxy: rewrite, from=<{}> to=<{}>", meta.path, rewritten);
                    if meta.raw_query.is_empty() || rewritten.contains('?') {
                        rewritten
                    } else {
                        format!("{}?{}", rewritten, meta.raw_query)
                    }
                }
                None => {
                    warn!(
                        "proxy: rewrite not matches, origin=<{}> pattern=<{}>",
                        meta.path, node.rewrite
                    );
                    return NodeOutcome::fail(GatewayError::RewriteMismatch(meta.path.clone()));
                }
            }
        };

        let mut outbound_headers = axum::http::HeaderMap::new();
        for (name, value) in meta.headers.iter() {
            if !is_hop_by_hop_header(name) {
                outbound_headers.insert(name.clone(), value.clone());
            }
        }

        let mut ctx = FilterContext {
            req: meta,
            outbound_headers: &mut outbound_headers,
            api: &result.api,
            node_index: result.node_index,
            server: svr,
            analysis: self.route_table.analysis(),
            start_at: None,
            end_at: None,
            status: 0,
        };

        if let Err(e) = run_pre_filters(&self.filters, &mut ctx) {
            return NodeOutcome::fail(e);
        }

        let client = match self.clients.get(&svr.addr, &self.config.backend).await {
            Ok(client) => client,
            Err(e) => return NodeOutcome::fail(e),
        };

        let method = match reqwest::Method::from_bytes(meta.method.as_bytes()) {
            Ok(method) => method,
            Err(_) => {
                return NodeOutcome::fail_with_code(
                    GatewayError::Backend(format!("bad method {}", meta.method)),
                    StatusCode::BAD_REQUEST.as_u16(),
                )
            }
        };

        let url = format!("{}://{}{}", svr.schema, svr.addr, path_and_query);
        let request = client
            .request(method, &url)
            .headers(ctx.outbound_headers.clone())
            .body(body.clone());

        ctx.start_at = Some(Instant::now());
        let response = request.send().await;

        match response {
            Err(e) => {
                ctx.end_at = Some(Instant::now());

                if is_client_cancel(&e) {
                    return NodeOutcome::fail(GatewayError::ClientCancel);
                }

                warn!("proxy: failed, target=<{}> error: {}", svr.addr, e);
                ctx.status = StatusCode::SERVICE_UNAVAILABLE.as_u16();
                run_post_err_filters(&self.filters, &mut ctx);
                NodeOutcome::fail(GatewayError::Backend(e.to_string()))
            }
            Ok(res) => {
                let status = res.status().as_u16();
                let headers = res.headers().clone();
                let bytes = res.bytes().await;
                ctx.end_at = Some(Instant::now());
                ctx.status = status;

                let body = match bytes {
                    Ok(body) => body,
                    Err(e) => {
                        warn!("proxy: body read failed, target=<{}>: {}", svr.addr, e);
                        run_post_err_filters(&self.filters, &mut ctx);
                        return NodeOutcome::fail(GatewayError::Backend(e.to_string()));
                    }
                };

                if status >= 500 {
                    warn!("proxy: returns error code, target=<{}> code=<{}>", svr.addr, status);
                    run_post_err_filters(&self.filters, &mut ctx);
                    return NodeOutcome::fail_with_code(
                        GatewayError::Backend(format!("backend answered {}", status)),
                        status,
                    );
                }

                if let Err(e) = run_post_filters(&self.filters, &mut ctx) {
                    return NodeOutcome::fail(e);
                }

                NodeOutcome::ok(BackendResponse {
                    status,
                    headers,
                    body,
                })
            }
        }
    }
}

async fn handler(
    State(proxy): State<Arc<Proxy>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    proxy.handle(req, peer).await
}

fn run_pre_filters(filters: &[Box<dyn Filter>], ctx: &mut FilterContext<'_>) -> Result<()> {
    for filter in filters {
        if let Err(e) = filter.pre(ctx) {
            warn!("proxy: pre filter <{}> rejected: {}", filter.name(), e);
            return Err(e);
        }
    }
    Ok(())
}

fn run_post_filters(filters: &[Box<dyn Filter>], ctx: &mut FilterContext<'_>) -> Result<()> {
    for filter in filters {
        if let Err(e) = filter.post(ctx) {
            warn!("proxy: post filter <{}> rejected: {}", filter.name(), e);
            return Err(e);
        }
    }
    Ok(())
}

fn run_post_err_filters(filters: &[Box<dyn Filter>], ctx: &mut FilterContext<'_>) {
    for filter in filters.iter().rev() {
        filter.post_err(ctx);
    }
}

fn status_response(code: u16) -> Response {
    StatusCode::from_u16(code)
        .unwrap_or(StatusCode::BAD_GATEWAY)
        .into_response()
}

/// Single-node path: the backend's status and body, verbatim
fn passthrough_response(res: BackendResponse) -> Response {
    Response::builder()
        .status(StatusCode::from_u16(res.status).unwrap_or(StatusCode::BAD_GATEWAY))
        .body(Body::from(res.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn render_mock(mock: &Mock) -> Response {
    let mut builder = Response::builder().status(StatusCode::OK);
    if !mock.content_type.is_empty() {
        builder = builder.header(CONTENT_TYPE, &mock.content_type);
    }
    for pair in &mock.headers {
        builder = builder.header(&pair.name, &pair.value);
    }
    builder
        .body(Body::from(mock.value.clone()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Merge path: backend headers (minus the stripped set) copied over, bodies
/// composed into one JSON object keyed by each node's attrName.
fn merge_response(results: &[RouteResult], outcomes: &[NodeOutcome]) -> Response {
    let mut builder = Response::builder().status(StatusCode::OK);

    if let Some(headers) = builder.headers_mut() {
        for outcome in outcomes {
            let Some(res) = &outcome.res else { continue };
            for (name, value) in res.headers.iter() {
                if MERGE_REMOVE_HEADERS.contains(&name.as_str()) || is_hop_by_hop_header(name) {
                    continue;
                }
                headers.insert(name.clone(), value.clone());
            }
        }
    }

    let parts: Vec<(&str, &Bytes)> = results
        .iter()
        .zip(outcomes.iter())
        .filter_map(|(result, outcome)| {
            outcome
                .res
                .as_ref()
                .map(|res| (result.node().attr_name.as_str(), &res.body))
        })
        .collect();

    builder = builder.header(CONTENT_TYPE, MERGE_CONTENT_TYPE);
    builder
        .body(Body::from(compose_merge_body(&parts)))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn compose_merge_body(parts: &[(&str, &Bytes)]) -> Bytes {
    let mut buf = Vec::new();
    buf.push(b'{');
    for (index, (attr, body)) in parts.iter().enumerate() {
        if index > 0 {
            buf.push(b',');
        }
        buf.push(b'"');
        buf.extend_from_slice(attr.as_bytes());
        buf.extend_from_slice(b"\":");
        buf.extend_from_slice(body);
    }
    buf.push(b'}');
    Bytes::from(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FilterSpec;
    use crate::model::api::{ApiSpec, Node};
    use crate::model::{Analysis, ClusterSpec, ServerSpec};
    use crate::store::MemStore;
    use axum::routing::get;

    async fn spawn_backend(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn test_config() -> Config {
        Config {
            addr: ":0".to_string(),
            mgr_addr: ":0".to_string(),
            registry_addr: "mem://".to_string(),
            prefix: "/gateway".to_string(),
            filters: vec![
                FilterSpec {
                    name: "XFORWARD".to_string(),
                    external: false,
                },
                FilterSpec {
                    name: "ANALYSIS".to_string(),
                    external: false,
                },
            ],
            backend: Default::default(),
        }
    }

    async fn proxy_with(
        clusters: &[(&str, &str)], // (cluster, backend addr)
        apis: Vec<ApiSpec>,
    ) -> Arc<Proxy> {
        let rt = RouteTable::new(Arc::new(MemStore::new("/gateway")), Arc::new(Analysis::new()));

        for (cluster, backend) in clusters {
            rt.add_new_cluster(ClusterSpec {
                name: cluster.to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

            if !backend.is_empty() {
                if rt.get_server(backend).await.is_none() {
                    rt.add_new_server(ServerSpec {
                        addr: backend.to_string(),
                        external: true,
                        ..Default::default()
                    })
                    .await
                    .unwrap();
                }
                rt.bind(backend, cluster).await.unwrap();
            }
        }

        for api in apis {
            rt.add_new_api(api).await.unwrap();
        }

        Proxy::new(test_config(), rt).unwrap()
    }

    fn api(url: &str, nodes: Vec<Node>) -> ApiSpec {
        ApiSpec {
            url: url.to_string(),
            method: "GET".to_string(),
            nodes,
            ..Default::default()
        }
    }

    fn node(cluster: &str) -> Node {
        Node {
            cluster_name: cluster.to_string(),
            ..Default::default()
        }
    }

    fn get_request(path: &str) -> Request {
        Request::builder()
            .method("GET")
            .uri(path)
            .body(Body::empty())
            .unwrap()
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:5555".parse().unwrap()
    }

    async fn body_string(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_single_node_happy_path() {
        let backend = spawn_backend(
            Router::new().route("/hello", get(|| async { "hello from backend" })),
        )
        .await;
        let proxy = proxy_with(&[("c1", backend.as_str())], vec![api("/hello", vec![node("c1")])]).await;

        let response = proxy.handle(get_request("/hello"), peer()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "hello from backend");
    }

    #[tokio::test]
    async fn test_unmatched_request_is_404() {
        let proxy = proxy_with(&[("c1", "")], vec![api("/hello", vec![node("c1")])]).await;

        let response = proxy.handle(get_request("/nothing"), peer()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_empty_cluster_is_503() {
        let proxy = proxy_with(&[("c1", "")], vec![api("/hello", vec![node("c1")])]).await;

        let response = proxy.handle(get_request("/hello"), peer()).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_stopped_proxy_answers_503() {
        let proxy = proxy_with(&[("c1", "")], vec![]).await;
        proxy.stop();

        let response = proxy.handle(get_request("/hello"), peer()).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_rewrite_changes_outbound_path() {
        let backend = spawn_backend(Router::new().fallback(|req: Request| async move {
            req.uri().path().to_string()
        }))
        .await;

        let mut spec = api("/(.+)", vec![node("c1")]);
        spec.nodes[0].rewrite = "/v1/$1".to_string();
        let proxy = proxy_with(&[("c1", backend.as_str())], vec![spec]).await;

        let response = proxy.handle(get_request("/hello"), peer()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "/v1/hello");
    }

    #[tokio::test]
    async fn test_rewrite_mismatch_is_400() {
        // matched by domain (Any rule), so the url pattern has nothing to
        // capture and the rewrite cannot be expanded
        let mut spec = api("/users/(\\d+)", vec![node("c1")]);
        spec.domain = "api.example.com".to_string();
        spec.match_rule = crate::model::MatchRule::Any;
        spec.nodes[0].rewrite = "/v2/$1".to_string();
        // the backend is never dialed; the rewrite fails first
        let proxy = proxy_with(&[("c1", "127.0.0.1:1")], vec![spec]).await;

        let request = Request::builder()
            .method("GET")
            .uri("/users/abc")
            .header("host", "api.example.com")
            .body(Body::empty())
            .unwrap();

        let response = proxy.handle(request, peer()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_merge_composes_json() {
        let b1 = spawn_backend(Router::new().route("/combined", get(|| async { r#"{"x":1}"# }))).await;
        let b2 = spawn_backend(Router::new().route("/combined", get(|| async { r#"{"y":2}"# }))).await;

        let mut spec = api("/combined", vec![node("a"), node("b")]);
        spec.nodes[0].attr_name = "a".to_string();
        spec.nodes[1].attr_name = "b".to_string();

        let proxy = proxy_with(&[("a", b1.as_str()), ("b", b2.as_str())], vec![spec]).await;

        let response = proxy.handle(get_request("/combined"), peer()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            MERGE_CONTENT_TYPE
        );
        assert_eq!(body_string(response).await, r#"{"a":{"x":1},"b":{"y":2}}"#);
    }

    #[tokio::test]
    async fn test_mock_renders_on_backend_miss() {
        let mut spec = api("/hello", vec![node("c1")]);
        spec.mock = Some(Mock {
            value: r#"{"mocked":true}"#.to_string(),
            content_type: "application/json".to_string(),
            headers: Vec::new(),
        });
        let proxy = proxy_with(&[("c1", "")], vec![spec]).await;

        let response = proxy.handle(get_request("/hello"), peer()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, r#"{"mocked":true}"#);
    }

    #[tokio::test]
    async fn test_backend_5xx_propagates() {
        let backend = spawn_backend(Router::new().route(
            "/hello",
            get(|| async { (StatusCode::BAD_GATEWAY, "broken") }),
        ))
        .await;
        let proxy = proxy_with(&[("c1", backend.as_str())], vec![api("/hello", vec![node("c1")])]).await;

        let response = proxy.handle(get_request("/hello"), peer()).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_compose_merge_body_layout() {
        let first = Bytes::from_static(br#"{"x":1}"#);
        let second = Bytes::from_static(br#"{"y":2}"#);
        let body = compose_merge_body(&[("a", &first), ("b", &second)]);
        assert_eq!(&body[..], br#"{"a":{"x":1},"b":{"y":2}}"#);

        let empty: &[(&str, &Bytes)] = &[];
        assert_eq!(&compose_merge_body(empty)[..], b"{}");
    }
}
