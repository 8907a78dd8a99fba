use crate::{
    error::{AppError, Result},
    services::auth::OptionalSession,
    state::AppState,
};
use axum::{
    extract::{Query, State},
    response::Html,
    routing::get,
    Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, Default, Deserialize)]
pub struct IndexQuery {
    pub error: Option<String>,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/", get(index))
}

/// 首页：未登录显示登录按钮，已登录显示实时列表
async fn index(
    State(state): State<Arc<AppState>>,
    OptionalSession(user): OptionalSession,
    Query(query): Query<IndexQuery>,
) -> Result<Html<String>> {
    let data = json!({
        "user": user,
        "error_message": query.error.as_deref().map(sign_in_error_message),
        "flash_ms": state.config.submission_flash_ms,
    });

    let page = state
        .templates
        .render("index", &data)
        .map_err(|e| AppError::internal(&format!("Failed to render index page: {}", e)))?;

    Ok(Html(page))
}

/// Message shown for the `?error=` code set by the OAuth callback.
pub fn sign_in_error_message(code: &str) -> String {
    match code {
        "no_code" => "Sign-in was cancelled: no authorization code was received.".to_string(),
        "oauth_failed" => "Google sign-in failed. Please try again.".to_string(),
        "supabase_signin_failed" => "Could not start your session. Please try again.".to_string(),
        "access_denied" => "Google sign-in was cancelled.".to_string(),
        other => format!("Sign-in failed ({}).", other),
    }
}
