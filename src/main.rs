//! Stash server binary.
//!
//! An anonymous, ephemeral file drop. Uploads are streamed into a jailed
//! storage root under a global write budget, served back by path, and purged
//! by a periodic retention sweep that also starts the next budget cycle.

mod config;
mod error;
mod etag;
mod files;
mod http;
mod ids;
mod ingest;
mod landing;
mod logging;
mod quota;
mod storage;
mod sweeper;
mod upload;

use axum::Router;
use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::middleware;
use axum::routing::get;
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};

use crate::config::{Args, SHUTDOWN_GRACE_SECS};
use crate::http::{add_security_headers, build_cors_layer, resolve_client_ip};
use crate::ids::IdAllocator;
use crate::landing::LandingPage;
use crate::quota::QuotaGate;
use crate::storage::Storage;
use crate::sweeper::{RetentionPolicy, RetentionSweeper};

shadow!(build);

/// Starts the stash server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let listen = args.listen_addr()?;
    let storage = Arc::new(Storage::open(&args.storage_dir).await?);
    let quota = Arc::new(QuotaGate::new(args.max_write_bytes));
    let ids = Arc::new(IdAllocator::new());
    let page = Arc::new(match args.index_file.as_deref() {
        Some(path) => LandingPage::from_file(Path::new(path)).await?,
        None => LandingPage::embedded()?,
    });
    let policy = RetentionPolicy {
        interval: args.sweep_interval(),
        max_age: args.max_age(),
    };
    info!(
        root = ?storage.root_path(),
        max_write_bytes = quota.max_bytes(),
        sweep_interval = ?policy.interval,
        max_age = ?policy.max_age,
        "stash configured"
    );

    let mut app = build_router(storage.clone(), quota.clone(), ids, page);
    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let addr = tokio::net::lookup_host(listen.to_string())
        .await?
        .next()
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                format!("no address for {listen}"),
            )
        })?;
    let handle = Handle::new();

    RetentionSweeper::new(storage, quota, sweeper::backend(args.sweep_backend), policy).spawn();

    info!("Starting HTTP server at {}", addr);
    let server = axum_server::bind(addr)
        .handle(handle.clone())
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());

    tokio::select! {
        result = server => result?,
        _ = shutdown_signal(handle) => {}
    }

    Ok(())
}

fn build_router(
    storage: Arc<Storage>,
    quota: Arc<QuotaGate>,
    ids: Arc<IdAllocator>,
    page: Arc<LandingPage>,
) -> Router {
    Router::new()
        .route(
            "/",
            get(landing::landing_page)
                .post(upload::upload_root)
                .put(upload::upload_root)
                .fallback(files::not_found),
        )
        .route(
            "/{*path}",
            get(files::serve_file)
                .post(upload::upload_file)
                .put(upload::upload_file)
                .fallback(files::not_found),
        )
        .fallback(files::not_found)
        .layer(DefaultBodyLimit::disable())
        .layer(middleware::from_fn(add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip());
                    let client_ip = resolve_client_ip(request.headers(), connect_ip)
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(storage))
        .layer(Extension(quota))
        .layer(Extension(ids))
        .layer(Extension(page))
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(SHUTDOWN_GRACE_SECS)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body as AxumBody;
    use axum::http::{Method, StatusCode, header};
    use axum::response::Response;
    use http_body_util::BodyExt;
    use tempfile::tempdir;
    use tower::ServiceExt;

    use crate::ingest::tests::{multipart_body, multipart_content_type};

    struct TestApp {
        _temp: tempfile::TempDir,
        storage: Arc<Storage>,
        quota: Arc<QuotaGate>,
        router: Router,
    }

    async fn test_app(max_bytes: u64) -> TestApp {
        let temp = tempdir().expect("tempdir");
        let storage = Arc::new(
            Storage::open(temp.path().join("stash"))
                .await
                .expect("open storage"),
        );
        let quota = Arc::new(QuotaGate::new(max_bytes));
        let router = build_router(
            storage.clone(),
            quota.clone(),
            Arc::new(IdAllocator::new()),
            Arc::new(LandingPage::new("id=$__RANDOM_PATH base=$__SERVER_PATH".into())),
        );
        TestApp {
            _temp: temp,
            storage,
            quota,
            router,
        }
    }

    async fn send(
        app: &TestApp,
        method: Method,
        uri: &str,
        content_type: Option<&str>,
        body: impl Into<AxumBody>,
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(content_type) = content_type {
            builder = builder.header(header::CONTENT_TYPE, content_type);
        }
        app.router
            .clone()
            .oneshot(builder.body(body.into()).expect("request"))
            .await
            .expect("infallible")
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes()
            .to_vec()
    }

    #[tokio::test]
    async fn put_then_get_round_trips_bytes() {
        let app = test_app(1 << 20).await;
        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();

        let put = send(&app, Method::PUT, "/x", None, payload.clone()).await;
        assert_eq!(put.status(), StatusCode::OK);
        assert_eq!(put.headers().get(header::X_FRAME_OPTIONS).expect("xfo"), "DENY");

        let get = send(&app, Method::GET, "/x", None, AxumBody::empty()).await;
        assert_eq!(get.status(), StatusCode::OK);
        assert_eq!(body_bytes(get).await, payload);
    }

    #[tokio::test]
    async fn multipart_post_is_served_back() {
        let app = test_app(1 << 20).await;
        let body = multipart_body(&[("data", Some("f.bin"), b"form bytes".as_slice())]);

        let post = send(
            &app,
            Method::POST,
            "/sub/dir/f.bin?redirect=1",
            Some(&multipart_content_type()),
            body,
        )
        .await;
        assert_eq!(post.status(), StatusCode::FOUND);
        assert_eq!(post.headers().get(header::LOCATION).expect("location"), "./f.bin");

        let get = send(&app, Method::GET, "/sub/dir/f.bin", None, AxumBody::empty()).await;
        assert_eq!(body_bytes(get).await, b"form bytes");
    }

    #[tokio::test]
    async fn budget_exhaustion_blocks_until_sweep_reset() {
        let app = test_app(64).await;

        let full = send(&app, Method::PUT, "/full", None, vec![0u8; 64]).await;
        assert_eq!(full.status(), StatusCode::OK);

        let one_more = send(&app, Method::PUT, "/one", None, vec![1u8]).await;
        assert_eq!(one_more.status(), StatusCode::INTERNAL_SERVER_ERROR);

        app.quota.reset();
        let after_reset = send(&app, Method::PUT, "/one", None, vec![1u8]).await;
        assert_eq!(after_reset.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn post_to_root_is_rejected() {
        let app = test_app(1024).await;
        let response = send(&app, Method::POST, "/", None, "x").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(app.storage.root_path().is_dir());
    }

    #[tokio::test]
    async fn landing_page_suggests_distinct_ids() {
        let app = test_app(1024).await;
        let first = send(&app, Method::GET, "/", None, AxumBody::empty()).await;
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(
            first.headers().get(header::CONTENT_TYPE).expect("type"),
            "text/html; charset=UTF-8"
        );
        let first = String::from_utf8(body_bytes(first).await).expect("utf8");
        let second = send(&app, Method::GET, "/", None, AxumBody::empty()).await;
        let second = String::from_utf8(body_bytes(second).await).expect("utf8");

        assert!(first.starts_with("id="));
        assert!(first.ends_with(" base=/"));
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn missing_file_is_plain_404() {
        let app = test_app(1024).await;
        let response = send(&app, Method::GET, "/nothing/here", None, AxumBody::empty()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            body_bytes(response).await,
            b"error: No such file or directory (/nothing/here)."
        );
    }

    #[tokio::test]
    async fn unsupported_method_is_plain_404() {
        let app = test_app(1024).await;
        send(&app, Method::PUT, "/x", None, "keep").await;

        let response = send(&app, Method::DELETE, "/x", None, AxumBody::empty()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_bytes(response).await, b"error: No such file or directory (/x).");
        assert!(app.storage.root_path().join("x").is_file());
    }

    #[tokio::test]
    async fn encoded_question_mark_stays_in_object_name() {
        let app = test_app(1024).await;
        let plain = send(&app, Method::PUT, "/a", None, "plain").await;
        assert_eq!(plain.status(), StatusCode::OK);

        let encoded = send(&app, Method::PUT, "/a%3Fb?redirect=1", None, "encoded").await;
        assert_eq!(encoded.status(), StatusCode::FOUND);

        let root = app.storage.root_path();
        assert_eq!(std::fs::read(root.join("a")).expect("read a"), b"plain");
        assert_eq!(std::fs::read(root.join("a?b")).expect("read a?b"), b"encoded");
    }
}
