//! Server management API.
//!
//! A POST to the socket path carries a `method` form parameter selecting
//! the operation; everything is gated by basic auth against the configured
//! secret user and password. Responses use bare status codes the way the
//! wire clients expect: 200 on success, 409 on conflicts, 404 for missing
//! documents, 401 when not authorized.

use std::sync::Arc;

use axum::extract::{Form, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use base64::Engine;
use serde::Deserialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc2822;
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::config::ServerConfig;
use crate::error::AppError;
use crate::store::{CreateMode, NewToken, Permissions};

#[derive(Debug, Default, Deserialize)]
pub struct ManagementRequest {
    pub method: Option<String>,
    #[serde(rename = "documentID")]
    pub document_id: Option<String>,
    pub token: Option<String>,
    #[serde(rename = "userID")]
    pub user_id: Option<String>,
    pub permissions: Option<String>,
    pub contents: Option<String>,
    pub expiration: Option<String>,
}

pub async fn handle(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Form(request): Form<ManagementRequest>,
) -> Response {
    match dispatch(state, &headers, request).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn dispatch(
    state: Arc<AppState>,
    headers: &HeaderMap,
    request: ManagementRequest,
) -> Result<Response, AppError> {
    let method = request.method.clone().unwrap_or_default();
    verify_auth(&state.config, headers)?;
    info!(method, "management request");

    match method.as_str() {
        "addToken" => add_token(&state, request).await,
        "updateUser" => update_user(&state, request).await,
        "createDocument" => create_document(&state, request).await,
        "deleteDocument" => delete_document(&state, request).await,
        "dumpDocument" => dump_document(&state, request, true).await,
        "checkDocument" => dump_document(&state, request, false).await,
        _ => Err(AppError::InvalidInput(
            "Unknown 'method' parameter".to_string(),
        )),
    }
}

fn verify_auth(config: &ServerConfig, headers: &HeaderMap) -> Result<(), AppError> {
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Basic "))
        .and_then(|value| {
            base64::engine::general_purpose::STANDARD
                .decode(value)
                .ok()
        })
        .and_then(|bytes| String::from_utf8(bytes).ok());

    // A server without configured secrets accepts no management calls.
    let configured = !config.secret_user.is_empty() || !config.secret_password.is_empty();

    let authorized = configured
        && provided.as_deref().is_some_and(|credentials| {
            let (user, password) = credentials.split_once(':').unwrap_or((credentials, ""));
            user == config.secret_user && password == config.secret_password
        });

    if !authorized {
        warn!("management request not authorized");
        return Err(AppError::Unauthorized);
    }
    Ok(())
}

fn must(value: Option<String>, name: &str) -> Result<String, AppError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::InvalidInput(format!("Missing {name}")))
}

async fn add_token(state: &AppState, request: ManagementRequest) -> Result<Response, AppError> {
    let doc_id = must(request.document_id, "documentID")?;
    let token = must(request.token, "token")?;
    let user_id = must(request.user_id, "userID")?;
    let expiration = must(request.expiration, "expiration")?;
    let permissions = request.permissions.unwrap_or_default();
    let contents = request.contents.unwrap_or_default();

    let expires_at = OffsetDateTime::parse(&expiration, &Rfc2822)
        .map_err(|_| AppError::InvalidInput("Incorrect expires format".to_string()))?
        .unix_timestamp();

    state
        .store
        .add_token(NewToken {
            token: &token,
            doc_id: &doc_id,
            user_id: &user_id,
            permissions: &permissions,
            expires_at,
            contents: contents.as_bytes(),
        })
        .await?;

    info!(token, doc_id, user_id, "token added");
    Ok(StatusCode::OK.into_response())
}

async fn update_user(state: &AppState, request: ManagementRequest) -> Result<Response, AppError> {
    let user_id = must(request.user_id, "userID")?;
    let permissions = request.permissions.unwrap_or_default();

    state.store.update_user(&user_id, &permissions).await?;
    state
        .hub
        .update_permissions(&user_id, Permissions::parse(&permissions));

    Ok(StatusCode::OK.into_response())
}

async fn create_document(
    state: &AppState,
    request: ManagementRequest,
) -> Result<Response, AppError> {
    let doc_id = must(request.document_id, "documentID")?;
    let contents = request
        .contents
        .ok_or_else(|| AppError::InvalidInput("Missing contents".to_string()))?;

    state
        .store
        .get_document(&doc_id, CreateMode::AlwaysCreate, contents.as_bytes())
        .await?;

    Ok(StatusCode::OK.into_response())
}

async fn delete_document(
    state: &AppState,
    request: ManagementRequest,
) -> Result<Response, AppError> {
    let doc_id = must(request.document_id, "documentID")?;

    state.hub.signal_document_deleted(&doc_id);
    state.store.delete_document(&doc_id).await?;

    Ok(StatusCode::OK.into_response())
}

async fn dump_document(
    state: &AppState,
    request: ManagementRequest,
    dump: bool,
) -> Result<Response, AppError> {
    let doc_id = must(request.document_id, "documentID")?;

    let fetched = state
        .store
        .get_document(&doc_id, CreateMode::NeverCreate, &[])
        .await?;

    if dump {
        Ok(([(header::CONTENT_TYPE, "text")], fetched.content).into_response())
    } else {
        Ok(StatusCode::OK.into_response())
    }
}
