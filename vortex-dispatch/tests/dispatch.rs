//! End-to-end dispatch against local origin servers.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use vortex_dispatch::{BackendServiceClientFactory, BackendServicesRouter};
use vortex_routing::metrics::MetricRegistry;
use vortex_routing::{
    BackendService, DispatchConfig, FactoryRef, HttpHandler, HttpRequest, Origin, ProxyError, RoutingStore,
    StickySessionConfig,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A running origin answering every request with its name.
struct TestOrigin {
    address: SocketAddr,
    hits: Arc<AtomicUsize>,
}

async fn spawn_origin(name: &'static str) -> TestOrigin {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&hits);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let counter = Arc::clone(&counter);
            tokio::spawn(async move {
                let service = service_fn(move |request: Request<hyper::body::Incoming>| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let path = request.uri().path().to_string();
                    async move {
                        Ok::<_, Infallible>(
                            Response::builder()
                                .header("x-path", path)
                                .body(Full::new(Bytes::from_static(name.as_bytes())))
                                .unwrap(),
                        )
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    TestOrigin { address, hits }
}

async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn origin(app: &str, id: &str, port: u16) -> Origin {
    Origin::new(app, id, "127.0.0.1", port)
}

fn router(metrics: &MetricRegistry) -> BackendServicesRouter {
    init_tracing();
    BackendServicesRouter::new(
        RoutingStore::new(),
        BackendServiceClientFactory::new(DispatchConfig::default(), metrics.clone()),
        "integration",
    )
}

fn get(uri: &str) -> HttpRequest {
    http::Request::builder().uri(uri).body(Bytes::new()).unwrap()
}

fn body(response: &http::Response<Bytes>) -> &str {
    std::str::from_utf8(response.body()).unwrap()
}

#[tokio::test]
async fn balances_across_origins_and_names_them() {
    let one = spawn_origin("shop-01").await;
    let two = spawn_origin("shop-02").await;
    let metrics = MetricRegistry::new();
    let router = router(&metrics);

    let mut service = BackendService::new(
        "shop",
        vec![
            origin("shop", "shop-01", one.address.port()),
            origin("shop", "shop-02", two.address.port()),
        ],
    );
    service.load_balancer = Some(FactoryRef::named("round-robin"));
    router.apply(vec![service]).unwrap();

    for _ in 0..4 {
        let response = router.handle(get("/")).await.unwrap();
        assert_eq!(response.headers()["X-Origin-Id"], body(&response));
    }

    assert_eq!(one.hits.load(Ordering::SeqCst), 2);
    assert_eq!(two.hits.load(Ordering::SeqCst), 2);
    assert_eq!(metrics.counter("origins.shop.shop-01.requests.success").count(), 2);
}

#[tokio::test]
async fn dead_origin_is_retried_elsewhere() {
    let live = spawn_origin("live").await;
    let metrics = MetricRegistry::new();
    let router = router(&metrics);

    let mut service = BackendService::new(
        "shop",
        vec![
            origin("shop", "dead", closed_port().await),
            origin("shop", "live", live.address.port()),
        ],
    );
    service.retry_policy = Some(FactoryRef {
        factory: "retry-n-times".into(),
        config: serde_json::json!({ "count": 1 }),
    });
    router.apply(vec![service]).unwrap();

    for _ in 0..6 {
        let response = router.handle(get("/")).await.unwrap();
        assert_eq!(body(&response), "live");
    }
    assert_eq!(live.hits.load(Ordering::SeqCst), 6);
    assert_eq!(metrics.counter("origins.shop.live.requests.success").count(), 6);
}

#[tokio::test]
async fn all_origins_down_surfaces_transport_error() {
    let metrics = MetricRegistry::new();
    let router = router(&metrics);
    let service = BackendService::new("shop", vec![origin("shop", "dead", closed_port().await)]);
    router.apply(vec![service]).unwrap();

    let error = router.handle(get("/")).await.unwrap_err();

    assert!(matches!(error, ProxyError::Transport { .. }));
    assert_eq!(metrics.counter("origins.shop.dead.requests.error").count(), 1);
}

#[tokio::test]
async fn sticky_sessions_pin_clients() {
    let one = spawn_origin("shop-01").await;
    let two = spawn_origin("shop-02").await;
    let router = router(&MetricRegistry::new());

    let mut service = BackendService::new(
        "shop",
        vec![
            origin("shop", "shop-01", one.address.port()),
            origin("shop", "shop-02", two.address.port()),
        ],
    );
    service.sticky_session = StickySessionConfig::enabled(3600);
    router.apply(vec![service]).unwrap();

    let first = router.handle(get("/")).await.unwrap();
    let pinned = body(&first).to_string();
    let cookie = first.headers()[http::header::SET_COOKIE].to_str().unwrap().to_string();
    assert_eq!(cookie, format!("vortex_origin_shop={pinned}; Max-Age=3600; Path=/; HttpOnly"));

    let pair = cookie.split(';').next().unwrap().to_string();
    for _ in 0..5 {
        let request = http::Request::builder()
            .uri("/")
            .header(http::header::COOKIE, pair.as_str())
            .body(Bytes::new())
            .unwrap();
        let response = router.handle(request).await.unwrap();
        assert_eq!(body(&response), pinned);
    }
}

#[tokio::test]
async fn routes_by_longest_path_and_rewrites() {
    let shop = spawn_origin("shop").await;
    let site = spawn_origin("site").await;
    let router = router(&MetricRegistry::new());

    let mut shop_service = BackendService::new("shop", vec![origin("shop", "shop-01", shop.address.port())]);
    shop_service.path = "/shop".into();
    shop_service.rewrites = vec![vortex_routing::RewriteRule::new("/shop/(.*)", "/$1")];
    let site_service = BackendService::new("site", vec![origin("site", "site-01", site.address.port())]);
    router.apply(vec![shop_service, site_service]).unwrap();

    let response = router.handle(get("/shop/cart")).await.unwrap();
    assert_eq!(body(&response), "shop");
    assert_eq!(response.headers()["x-path"], "/cart");

    let response = router.handle(get("/about")).await.unwrap();
    assert_eq!(body(&response), "site");
}

#[tokio::test]
async fn removed_services_leave_no_gauges_behind() {
    let one = spawn_origin("shop-01").await;
    let metrics = MetricRegistry::new();
    let router = router(&metrics);
    router
        .apply(vec![BackendService::new("shop", vec![origin("shop", "shop-01", one.address.port())])])
        .unwrap();

    router.handle(get("/")).await.unwrap();
    assert_eq!(
        metrics.gauge_value("origins.shop.shop-01.connectionspool.available-connections"),
        Some(1)
    );

    router.apply(Vec::new()).unwrap();

    assert!(metrics.gauge_names().is_empty());
    assert!(router.store().snapshot().is_empty());
}

#[tokio::test]
async fn admitted_requests_survive_reload() {
    let one = spawn_origin("shop-01").await;
    let router = router(&MetricRegistry::new());
    let mut service = BackendService::new("shop", vec![origin("shop", "shop-01", one.address.port())]);
    router.apply(vec![service.clone()]).unwrap();
    let old = router.proxy("shop").unwrap();

    let admitted = router.handle(get("/"));
    service.override_host_header = true;
    router.apply(vec![service]).unwrap();
    assert!(!old.is_stopped());
    assert_eq!(old.inventory().listener_count(), 0);

    let response = admitted.await.unwrap();
    assert_eq!(body(&response), "shop-01");

    for _ in 0..200 {
        if old.is_stopped() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    assert!(old.is_stopped());
    assert!(old.inventory().is_closed());

    let response = router.handle(get("/")).await.unwrap();
    assert_eq!(body(&response), "shop-01");
}

#[tokio::test]
async fn reloaded_service_keeps_reporting_pool_gauges() {
    let one = spawn_origin("shop-01").await;
    let metrics = MetricRegistry::new();
    let router = router(&metrics);
    let mut service = BackendService::new("shop", vec![origin("shop", "shop-01", one.address.port())]);
    router.apply(vec![service.clone()]).unwrap();
    let gauges = metrics.gauge_names();
    assert_eq!(gauges.len(), 8);

    service.override_host_header = true;
    router.apply(vec![service]).unwrap();

    assert_eq!(metrics.gauge_names(), gauges);
    router.handle(get("/")).await.unwrap();
    assert_eq!(
        metrics.gauge_value("origins.shop.shop-01.connectionspool.available-connections"),
        Some(1)
    );
}
