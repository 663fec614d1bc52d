//! Auth gate, run before every task route, plus the `/auth/*` endpoints
//! (this node has no user accounts; they only say so).

use std::sync::Arc;

use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::ApiError;

#[derive(Debug, Clone, Default)]
pub enum AuthGate {
    /// Everything passes.
    #[default]
    NoAuth,
    /// `?token=` must match.
    Token(Arc<str>),
}

impl AuthGate {
    pub fn from_token(token: Option<String>) -> Self {
        match token {
            Some(token) if !token.is_empty() => AuthGate::Token(token.into()),
            _ => AuthGate::NoAuth,
        }
    }

    pub fn admits(&self, presented: Option<&str>) -> bool {
        match self {
            AuthGate::NoAuth => true,
            AuthGate::Token(expected) => presented == Some(&**expected),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    token: Option<String>,
}

pub async fn check_token(
    State(gate): State<AuthGate>,
    query: Result<Query<TokenQuery>, QueryRejection>,
    request: Request,
    next: Next,
) -> Response {
    let Query(query) = match query {
        Ok(query) => query,
        Err(e) => return ApiError::invalid(e.body_text()).into_response(),
    };
    if !gate.admits(query.token.as_deref()) {
        return ApiError::unauthorized().into_response();
    }
    next.run(request).await
}

/// Routes reachable without a token.
pub fn routes() -> Router {
    Router::new()
        .route("/auth/info", get(auth_info))
        .route("/auth/login", post(not_available))
        .route("/auth/register", post(not_available))
}

async fn auth_info() -> Json<Value> {
    Json(json!({
        "message": "Authentication not available on this node",
        "loginUrl": null,
        "registerUrl": null,
    }))
}

async fn not_available() -> Json<Value> {
    Json(json!({ "error": "Not available" }))
}
