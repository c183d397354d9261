//! Integration tests for the single-flight refresh pipeline. Each test
//! spins a real HTTP backend on a loopback port, seeds the client with a
//! stale token, and drives the public API end to end.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
};
use reqwest::Method;
use serde_json::json;
use tokio::time::sleep;

use rally_client::{ApiClient, ApiConfig, ApiError, AuthEvent};
use rally_types::api::{Envelope, UserSummary};
use rally_types::session::SessionStore;

#[derive(Clone)]
struct Backend {
    valid_token: Arc<std::sync::Mutex<String>>,
    refresh_calls: Arc<AtomicUsize>,
    refresh_delay: Duration,
    refresh_fails: Arc<AtomicBool>,
    items_always_401: Arc<AtomicBool>,
    item_hits: Arc<std::sync::Mutex<Vec<String>>>,
}

async fn get_item(
    State(backend): State<Backend>,
    Path(tag): Path<String>,
    headers: HeaderMap,
) -> (StatusCode, Json<Envelope>) {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let expected = format!("Bearer {}", backend.valid_token.lock().unwrap());

    if backend.items_always_401.load(Ordering::SeqCst) || auth != expected {
        return (StatusCode::UNAUTHORIZED, Json(Envelope::err("unauthorized")));
    }

    backend.item_hits.lock().unwrap().push(tag.clone());
    (StatusCode::OK, Json(Envelope::ok(json!({"tag": tag}))))
}

async fn refresh(State(backend): State<Backend>) -> (StatusCode, Json<Envelope>) {
    let n = backend.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
    sleep(backend.refresh_delay).await;

    if backend.refresh_fails.load(Ordering::SeqCst) {
        return (StatusCode::UNAUTHORIZED, Json(Envelope::err("refresh denied")));
    }

    let token = format!("tok-{n}");
    *backend.valid_token.lock().unwrap() = token.clone();
    (
        StatusCode::OK,
        Json(Envelope::ok(json!({
            "accessToken": token,
            "userResponse": {"id": 1, "email": "vol@example.org"}
        }))),
    )
}

async fn public(headers: HeaderMap) -> (StatusCode, Json<Envelope>) {
    // Unauthenticated endpoint: reject if a token was attached anyway.
    if headers.contains_key("authorization") {
        return (StatusCode::BAD_REQUEST, Json(Envelope::err("unexpected token")));
    }
    (StatusCode::OK, Json(Envelope::ok(json!({"open": true}))))
}

async fn broken() -> (StatusCode, Json<Envelope>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(Envelope::err("boom")),
    )
}

async fn start_backend(refresh_delay: Duration) -> (Backend, String) {
    let backend = Backend {
        valid_token: Arc::new(std::sync::Mutex::new("tok-0".into())),
        refresh_calls: Arc::new(AtomicUsize::new(0)),
        refresh_delay,
        refresh_fails: Arc::new(AtomicBool::new(false)),
        items_always_401: Arc::new(AtomicBool::new(false)),
        item_hits: Arc::new(std::sync::Mutex::new(Vec::new())),
    };

    let app = Router::new()
        .route("/items/{tag}", get(get_item))
        .route("/auth/refresh", post(refresh))
        .route("/public", get(public))
        .route("/broken", get(broken))
        .with_state(backend.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (backend, format!("http://{addr}"))
}

fn new_client(base_url: &str, token: Option<&str>) -> (ApiClient, Arc<SessionStore>) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rally=debug".into()),
        )
        .try_init();

    let path = std::env::temp_dir().join(format!("rally_client_{}.json", uuid::Uuid::new_v4()));
    let store = Arc::new(SessionStore::open(path));
    if let Some(token) = token {
        store.set(
            token.into(),
            Some(UserSummary {
                id: 1,
                email: "vol@example.org".into(),
                full_name: None,
                roles: vec![],
            }),
        );
    }

    let client = ApiClient::new(ApiConfig::new(base_url), store.clone()).unwrap();
    (client, store)
}

#[tokio::test]
async fn concurrent_401s_collapse_into_one_refresh() {
    let (backend, url) = start_backend(Duration::from_millis(150)).await;
    let (client, store) = new_client(&url, Some("stale"));

    let (a, b, c, d) = tokio::join!(
        client.get("/items/a"),
        client.get("/items/b"),
        client.get("/items/c"),
        client.get("/items/d"),
    );

    for result in [a, b, c, d] {
        let envelope = result.unwrap();
        assert!(envelope.success);
    }
    assert_eq!(backend.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.access_token().as_deref(), Some("tok-1"));
}

#[tokio::test]
async fn queued_requests_replay_in_fifo_order() {
    let (backend, url) = start_backend(Duration::from_millis(300)).await;
    let (client, _store) = new_client(&url, Some("stale"));

    // A 401s first and becomes the refresher; B, C, D queue while the
    // refresh is in flight.
    let mut handles = Vec::new();
    for tag in ["A", "B", "C", "D"] {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            client.get(&format!("/items/{tag}")).await
        }));
        sleep(Duration::from_millis(50)).await;
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(backend.refresh_calls.load(Ordering::SeqCst), 1);
    let hits = backend.item_hits.lock().unwrap().clone();
    assert_eq!(hits, vec!["A", "B", "C", "D"]);
}

#[tokio::test]
async fn second_401_after_replay_does_not_refresh_again() {
    let (backend, url) = start_backend(Duration::from_millis(10)).await;
    backend.items_always_401.store(true, Ordering::SeqCst);
    let (client, _store) = new_client(&url, Some("stale"));

    let err = client.get("/items/x").await.unwrap_err();
    assert!(matches!(err, ApiError::Unauthorized));
    assert_eq!(backend.refresh_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn refresh_failure_clears_session_and_redirects() {
    let (backend, url) = start_backend(Duration::from_millis(10)).await;
    backend.refresh_fails.store(true, Ordering::SeqCst);
    let (client, store) = new_client(&url, Some("stale"));
    let mut events = client.auth_events();

    let err = client.get("/items/x").await.unwrap_err();
    assert!(matches!(err, ApiError::RefreshFailed(_)));

    assert!(store.access_token().is_none());
    assert!(store.current_user().is_none());
    assert_eq!(events.try_recv().unwrap(), AuthEvent::LoggedOut);
    assert_eq!(events.try_recv().unwrap(), AuthEvent::RedirectToLogin);
}

#[tokio::test]
async fn redirect_suppressed_on_public_routes() {
    let (backend, url) = start_backend(Duration::from_millis(10)).await;
    backend.refresh_fails.store(true, Ordering::SeqCst);
    let (client, _store) = new_client(&url, Some("stale"));
    client.set_current_path("/login");
    let mut events = client.auth_events();

    let _ = client.get("/items/x").await.unwrap_err();

    assert_eq!(events.try_recv().unwrap(), AuthEvent::LoggedOut);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn queued_requests_rejected_on_refresh_failure() {
    let (backend, url) = start_backend(Duration::from_millis(200)).await;
    backend.refresh_fails.store(true, Ordering::SeqCst);
    let (client, _store) = new_client(&url, Some("stale"));

    let refresher = {
        let client = client.clone();
        tokio::spawn(async move { client.get("/items/a").await })
    };
    sleep(Duration::from_millis(50)).await;
    let queued = {
        let client = client.clone();
        tokio::spawn(async move { client.get("/items/b").await })
    };

    let refresher = refresher.await.unwrap().unwrap_err();
    let queued = queued.await.unwrap().unwrap_err();
    assert!(matches!(refresher, ApiError::RefreshFailed(_)));
    assert!(matches!(queued, ApiError::RefreshFailed(_)));
    assert_eq!(backend.refresh_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn a_401_from_the_refresh_endpoint_is_terminal() {
    let (backend, url) = start_backend(Duration::from_millis(10)).await;
    backend.refresh_fails.store(true, Ordering::SeqCst);
    let (client, store) = new_client(&url, Some("stale"));

    let err = client
        .request(Method::POST, "/auth/refresh", None)
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Unauthorized));
    assert!(store.access_token().is_none());
    // Only the direct hit, no recursive refresh attempt.
    assert_eq!(backend.refresh_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn non_401_errors_propagate_without_refresh() {
    let (backend, url) = start_backend(Duration::from_millis(10)).await;
    let (client, _store) = new_client(&url, Some("tok-0"));

    let err = client.get("/broken").await.unwrap_err();
    match err {
        ApiError::Status { status, envelope } => {
            assert_eq!(status, 500);
            assert_eq!(envelope.unwrap().message.as_deref(), Some("boom"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(backend.refresh_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unauthenticated_requests_omit_the_header() -> anyhow::Result<()> {
    let (_backend, url) = start_backend(Duration::from_millis(10)).await;
    let (client, _store) = new_client(&url, None);

    let envelope = client.get("/public").await?;
    assert!(envelope.success);
    Ok(())
}

#[tokio::test]
async fn valid_token_passes_the_envelope_through() -> anyhow::Result<()> {
    let (backend, url) = start_backend(Duration::from_millis(10)).await;
    let (client, _store) = new_client(&url, Some("tok-0"));

    let envelope = client.get("/items/first").await?;
    assert!(envelope.success);
    assert_eq!(envelope.data.unwrap()["tag"], "first");
    assert_eq!(backend.refresh_calls.load(Ordering::SeqCst), 0);
    Ok(())
}
