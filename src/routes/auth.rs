use crate::{
    error::Result,
    services::{
        auth::{SessionUser, STATE_COOKIE},
        identity::{CallbackFailure, CallbackParams, IdentityService},
    },
    state::AppState,
};
use axum::{
    extract::{Query, State},
    headers::Cookie,
    http::header::SET_COOKIE,
    response::{AppendHeaders, IntoResponse, Json, Redirect, Response},
    routing::{get, post},
    Router, TypedHeader,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, info};

/// `/auth` 下的浏览器跳转路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/google/login", get(google_login))
        .route("/google/callback", get(google_callback))
        .route("/logout", post(logout))
}

/// `/api/auth` 下的 JSON 路由
pub fn api_router() -> Router<Arc<AppState>> {
    Router::new().route("/me", get(get_current_user))
}

/// 跳转到 Google 授权页
/// GET /auth/google/login
async fn google_login(State(state): State<Arc<AppState>>) -> Result<Response> {
    let oauth_state = IdentityService::new_state();
    let location = state.identity.authorization_url(&oauth_state)?;

    debug!("Redirecting to Google consent page");

    Ok((
        AppendHeaders([(SET_COOKIE, state.sessions.state_cookie(&oauth_state))]),
        Redirect::to(&location),
    )
        .into_response())
}

/// OAuth 回调：所有失败都转成带错误码的跳转
/// GET /auth/google/callback
async fn google_callback(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CallbackParams>,
    cookies: Option<TypedHeader<Cookie>>,
) -> Response {
    let expected_state = cookies
        .as_ref()
        .and_then(|TypedHeader(cookies)| cookies.get(STATE_COOKIE))
        .filter(|value| !value.is_empty())
        .map(str::to_string);
    let clear_state = state.sessions.clear_state_cookie();
    let public_url = &state.config.public_url;

    let failure = match state
        .identity
        .complete_callback(params, expected_state.as_deref())
        .await
    {
        Ok(user) => match state.sessions.issue(&user) {
            Ok(token) => {
                info!("Session established for user {}", user.id);
                return (
                    AppendHeaders([
                        (SET_COOKIE, state.sessions.session_cookie(&token)),
                        (SET_COOKIE, clear_state),
                    ]),
                    Redirect::to(&format!("{}/", public_url)),
                )
                    .into_response();
            }
            Err(e) => {
                error!("Failed to issue session: {}", e);
                CallbackFailure::OAuthFailed
            }
        },
        Err(failure) => failure,
    };

    (
        AppendHeaders([(SET_COOKIE, clear_state)]),
        Redirect::to(&failure.redirect_location(public_url)),
    )
        .into_response()
}

/// 退出登录
/// POST /auth/logout
async fn logout(State(state): State<Arc<AppState>>) -> Response {
    (
        AppendHeaders([(SET_COOKIE, state.sessions.clear_cookie())]),
        Redirect::to(&format!("{}/", state.config.public_url)),
    )
        .into_response()
}

/// 获取当前用户信息
/// GET /api/auth/me
async fn get_current_user(user: SessionUser) -> Json<Value> {
    debug!("Getting current user info for user: {}", user.id);

    Json(json!({
        "success": true,
        "data": user
    }))
}
