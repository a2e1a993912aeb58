//! HTTP handlers for the `/api/<type>/...` object routes.
//!
//! Each handler authenticates the caller, cleans the query string, runs one
//! [`QueryEngine`] call under the database lock and frames the [`Reply`] in
//! the JSON envelope.

use axum::{
    body::Bytes,
    extract::{rejection::QueryRejection, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use gnode_rest::{QueryEngine, QueryOptions, Reply, RestError};
use gnode_shared::constants::API_VERSION;
use gnode_shared::LocalId;
use gnode_store::{Database, User};
use serde_json::{json, Value};

use crate::api::{AppState, API_VERSION_HEADER};
use crate::error::ServerError;

type Params = Result<Query<Vec<(String, String)>>, QueryRejection>;

// ---------------------------------------------------------------------------
// Collection routes: /api/:entity_type/
// ---------------------------------------------------------------------------

pub async fn list(
    State(state): State<AppState>,
    Path(entity_type): Path<String>,
    headers: HeaderMap,
    params: Params,
) -> Result<Response, ServerError> {
    let opts = options(&state, params);
    let (user, reply) = execute(&state, &headers, |engine, user| {
        engine.list(&entity_type, user.id, &opts?)
    })
    .await?;
    Ok(respond(&user, reply))
}

/// Create one object, or update every selected one with `bulk_update=1`.
pub async fn create(
    State(state): State<AppState>,
    Path(entity_type): Path<String>,
    headers: HeaderMap,
    params: Params,
    body: Bytes,
) -> Result<Response, ServerError> {
    let opts = options(&state, params);
    let (user, reply) = execute(&state, &headers, |engine, user| {
        let opts = opts?;
        if opts.bulk_update {
            engine.bulk_update(&entity_type, user.id, &body, &opts)
        } else {
            engine.create(&entity_type, user.id, &body, &opts)
        }
    })
    .await?;
    Ok(respond(&user, reply))
}

pub async fn bulk_delete(
    State(state): State<AppState>,
    Path(entity_type): Path<String>,
    headers: HeaderMap,
    params: Params,
) -> Result<Response, ServerError> {
    let opts = options(&state, params);
    let (user, reply) = execute(&state, &headers, |engine, user| {
        engine.bulk_delete(&entity_type, user.id, &opts?)
    })
    .await?;
    Ok(respond(&user, reply))
}

// ---------------------------------------------------------------------------
// Object routes: /api/:entity_type/:id/
// ---------------------------------------------------------------------------

/// Single object. Answers 304 when `If-None-Match` names the current ETag.
pub async fn get(
    State(state): State<AppState>,
    Path((entity_type, id)): Path<(String, String)>,
    headers: HeaderMap,
    params: Params,
) -> Result<Response, ServerError> {
    let id = local_id(&id);
    let opts = options(&state, params);
    let (user, reply) = execute(&state, &headers, |engine, user| {
        engine.get(&entity_type, id?, user.id, &opts?)
    })
    .await?;

    if let Some(tag) = &reply.version {
        if if_none_match(&headers, &tag.etag) {
            let mut response = StatusCode::NOT_MODIFIED.into_response();
            insert_validators(response.headers_mut(), &tag.etag, tag.last_modified);
            return Ok(response);
        }
    }
    Ok(respond(&user, reply))
}

pub async fn update(
    State(state): State<AppState>,
    Path((entity_type, id)): Path<(String, String)>,
    headers: HeaderMap,
    params: Params,
    body: Bytes,
) -> Result<Response, ServerError> {
    let id = local_id(&id);
    let opts = options(&state, params);
    let (user, reply) = execute(&state, &headers, |engine, user| {
        engine.update(&entity_type, id?, user.id, &body, &opts?)
    })
    .await?;
    Ok(respond(&user, reply))
}

pub async fn delete(
    State(state): State<AppState>,
    Path((entity_type, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ServerError> {
    let id = local_id(&id);
    let (user, reply) = execute(&state, &headers, |engine, user| {
        engine.delete(&entity_type, id?, user.id)
    })
    .await?;
    Ok(respond(&user, reply))
}

pub async fn history(
    State(state): State<AppState>,
    Path((entity_type, id)): Path<(String, String)>,
    headers: HeaderMap,
    params: Params,
) -> Result<Response, ServerError> {
    let id = local_id(&id);
    let opts = options(&state, params);
    let (user, reply) = execute(&state, &headers, |engine, user| {
        engine.history(&entity_type, id?, user.id, &opts?)
    })
    .await?;
    Ok(respond(&user, reply))
}

pub async fn acl(
    State(state): State<AppState>,
    Path((entity_type, id)): Path<(String, String)>,
    headers: HeaderMap,
    params: Params,
) -> Result<Response, ServerError> {
    let id = local_id(&id);
    let opts = options(&state, params);
    let (user, reply) = execute(&state, &headers, |engine, user| {
        engine.acl(&entity_type, id?, user.id, &opts?)
    })
    .await?;
    Ok(respond(&user, reply))
}

pub async fn update_acl(
    State(state): State<AppState>,
    Path((entity_type, id)): Path<(String, String)>,
    headers: HeaderMap,
    params: Params,
    body: Bytes,
) -> Result<Response, ServerError> {
    let id = local_id(&id);
    let opts = options(&state, params);
    let (user, reply) = execute(&state, &headers, |engine, user| {
        engine.update_acl(&entity_type, id?, user.id, &body, &opts?)
    })
    .await?;
    Ok(respond(&user, reply))
}

/// Method fallback on every object route.
pub async fn invalid_method() -> ServerError {
    ServerError::Rest(RestError::InvalidMethod)
}

/// Router fallback for paths no route matches.
pub async fn not_found() -> ServerError {
    ServerError::Rest(RestError::DoesNotExist)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Lock the store, authenticate and run `f`. The lock is released before
/// the reply is framed. Failures after authentication name the caller.
async fn execute<F>(state: &AppState, headers: &HeaderMap, f: F) -> Result<(User, Reply), ServerError>
where
    F: FnOnce(&QueryEngine<'_>, &User) -> gnode_rest::Result<Reply>,
{
    let db = state.db.lock().await;
    let user = authenticate(&db, headers)?;
    let engine = QueryEngine::new(&db, &state.registry);
    match f(&engine, &user) {
        Ok(reply) => Ok((user, reply)),
        Err(e) => Err(ServerError::from(e).for_user(&user.username)),
    }
}

/// Resolve `Authorization: Token <token>` (or `Bearer <token>`) to a user.
pub fn authenticate(db: &Database, headers: &HeaderMap) -> Result<User, ServerError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Token ").or_else(|| v.strip_prefix("Bearer ")))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(RestError::NotAuthenticated)?;

    match db.user_by_token(token)? {
        Some(user) => Ok(user),
        None => {
            tracing::debug!("unknown API token");
            Err(RestError::NotAuthenticated.into())
        }
    }
}

fn options(state: &AppState, params: Params) -> gnode_rest::Result<QueryOptions> {
    let Query(params) = params.map_err(|e| RestError::WrongParams(e.body_text()))?;
    QueryOptions::parse(&params, state.config.default_max_results)
}

/// Malformed identifiers are reported like missing objects.
fn local_id(raw: &str) -> gnode_rest::Result<LocalId> {
    raw.parse().map_err(|_| RestError::DoesNotExist)
}

/// Frame a reply in the JSON envelope.
fn respond(user: &User, reply: Reply) -> Response {
    let status = if reply.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };

    let mut body = reply.body;
    body.insert("message_type".into(), json!(reply.message_type.as_str()));
    body.insert("message".into(), json!(reply.message_type.text()));
    body.insert("logged_in_as".into(), json!(user.username));

    let mut response = (status, Json(Value::Object(body))).into_response();
    let headers = response.headers_mut();
    headers.insert(API_VERSION_HEADER, HeaderValue::from_static(API_VERSION));
    if let Some(tag) = &reply.version {
        insert_validators(headers, &tag.etag, tag.last_modified);
    }
    response
}

fn insert_validators(headers: &mut HeaderMap, etag: &str, last_modified: DateTime<Utc>) {
    if let Ok(value) = HeaderValue::try_from(format!("\"{etag}\"")) {
        headers.insert(header::ETAG, value);
    }
    let http_date = last_modified.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
    if let Ok(value) = HeaderValue::try_from(http_date) {
        headers.insert(header::LAST_MODIFIED, value);
    }
}

fn if_none_match(headers: &HeaderMap, etag: &str) -> bool {
    let Some(value) = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    value.split(',').map(str::trim).any(|candidate| {
        candidate == "*"
            || candidate.trim_start_matches("W/").trim_matches('"') == etag
    })
}
