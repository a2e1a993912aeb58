use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{HeaderMap, HeaderName, Method, StatusCode},
    middleware,
    routing::{get, post, MethodRouter},
    Json, Router,
};
use gnode_rest::Registry;
use gnode_shared::constants::API_VERSION;
use gnode_store::Database;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::objects;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};

/// Response header carrying the API version.
pub const API_VERSION_HEADER: HeaderName = HeaderName::from_static("g-node-version");

#[derive(Clone)]
pub struct AppState {
    /// One connection; requests are serialized at the store.
    pub db: Arc<Mutex<Database>>,
    pub registry: Arc<Registry>,
    pub rate_limiter: RateLimiter,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(db: Database, registry: Registry, config: ServerConfig) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            registry: Arc::new(registry),
            rate_limiter: RateLimiter::new(config.rate_limit_per_sec, config.rate_limit_burst),
            config: Arc::new(config),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    let collection = get(objects::list)
        .post(objects::create)
        .delete(objects::bulk_delete)
        .fallback(objects::invalid_method);
    let object = get(objects::get)
        .post(objects::update)
        .put(objects::update)
        .delete(objects::delete)
        .fallback(objects::invalid_method);
    let acl = get(objects::acl)
        .post(objects::update_acl)
        .put(objects::update_acl)
        .fallback(objects::invalid_method);
    let history = get(objects::history).fallback(objects::invalid_method);

    let router = Router::new()
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route("/admin/users", post(admin_create_user))
        .route(
            "/admin/friendships",
            post(admin_add_friendship).delete(admin_remove_friendship),
        );

    let router = [
        ("/api/:entity_type", collection),
        ("/api/:entity_type/:id", object),
        ("/api/:entity_type/:id/acl", acl),
        ("/api/:entity_type/:id/history", history),
    ]
    .into_iter()
    .fold(router, |router, (path, methods)| {
        with_trailing_slash(router, path, methods)
    });

    router
        .fallback(objects::not_found)
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Object URLs are published with a trailing slash; accept both forms.
fn with_trailing_slash(
    router: Router<AppState>,
    path: &str,
    methods: MethodRouter<AppState>,
) -> Router<AppState> {
    router
        .route(path, methods.clone())
        .route(&format!("{path}/"), methods)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct ServerInfoResponse {
    name: String,
    version: &'static str,
    api_version: &'static str,
    entity_types: Vec<&'static str>,
    default_max_results: usize,
}

#[derive(Deserialize)]
struct NewUserRequest {
    username: String,
}

#[derive(Serialize)]
struct NewUserResponse {
    id: i64,
    username: String,
    api_token: String,
}

#[derive(Deserialize)]
struct FriendshipRequest {
    a: String,
    b: String,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_info(State(state): State<AppState>) -> Json<ServerInfoResponse> {
    Json(ServerInfoResponse {
        name: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        api_version: API_VERSION,
        entity_types: state.registry.names().collect(),
        default_max_results: state.config.default_max_results,
    })
}

fn verify_admin_token(headers: &HeaderMap, config: &ServerConfig) -> Result<(), ServerError> {
    let Some(ref expected) = config.admin_token else {
        return Err(ServerError::Forbidden(
            "Admin API is disabled (no ADMIN_TOKEN configured)".into(),
        ));
    };

    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let token = auth.strip_prefix("Bearer ").unwrap_or(auth);

    // Constant-time comparison to prevent timing attacks on admin token.
    use subtle::ConstantTimeEq;
    let token_bytes = token.as_bytes();
    let expected_bytes = expected.as_bytes();
    if token_bytes.len() != expected_bytes.len()
        || token_bytes.ct_eq(expected_bytes).unwrap_u8() != 1
    {
        return Err(ServerError::Forbidden("Invalid admin token".into()));
    }

    Ok(())
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ServerError> {
    body.map(|Json(v)| v)
        .map_err(|e| ServerError::BadRequest(e.body_text()))
}

async fn admin_create_user(
    headers: HeaderMap,
    State(state): State<AppState>,
    body: Result<Json<NewUserRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<NewUserResponse>), ServerError> {
    verify_admin_token(&headers, &state.config)?;
    let req = json_body(body)?;

    let user = state.db.lock().await.create_user(&req.username)?;

    info!(user = %user.username, id = %user.id, "Admin created user");
    Ok((
        StatusCode::CREATED,
        Json(NewUserResponse {
            id: user.id.0,
            username: user.username,
            api_token: user.api_token,
        }),
    ))
}

async fn admin_add_friendship(
    headers: HeaderMap,
    State(state): State<AppState>,
    body: Result<Json<FriendshipRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ServerError> {
    verify_admin_token(&headers, &state.config)?;
    let req = json_body(body)?;

    let db = state.db.lock().await;
    let (a, b) = (db.user_by_name(&req.a)?, db.user_by_name(&req.b)?);
    db.add_friendship(a.id, b.id)?;

    info!(a = %a.username, b = %b.username, "Admin added friendship");
    Ok(Json(serde_json::json!({ "friends": true })))
}

async fn admin_remove_friendship(
    headers: HeaderMap,
    State(state): State<AppState>,
    body: Result<Json<FriendshipRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ServerError> {
    verify_admin_token(&headers, &state.config)?;
    let req = json_body(body)?;

    let db = state.db.lock().await;
    let (a, b) = (db.user_by_name(&req.a)?, db.user_by_name(&req.b)?);
    let removed = db.remove_friendship(a.id, b.id)?;

    info!(a = %a.username, b = %b.username, removed, "Admin removed friendship");
    Ok(Json(serde_json::json!({ "removed": removed })))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}
