use crate::{
    config::Config,
    error::{AppError, Result},
};
use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    headers::{authorization::Bearer, Authorization, Cookie},
    http::request::Parts,
    Extension, RequestPartsExt, TypedHeader,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

pub const SESSION_COOKIE: &str = "sb_session";
pub const STATE_COOKIE: &str = "sb_oauth_state";

const STATE_COOKIE_MAX_AGE_SECS: i64 = 600;

/// 当前会话的用户
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUser {
    pub id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
    pub iat: i64,
    pub exp: i64,
}

/// 会话签发与校验
pub struct SessionService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    ttl: Duration,
    secure_cookies: bool,
}

impl SessionService {
    pub fn new(config: &Config) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(config.session_secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.session_secret.as_bytes()),
            ttl: Duration::hours(config.session_ttl_hours),
            secure_cookies: config.public_url.starts_with("https://"),
        }
    }

    pub fn issue(&self, user: &SessionUser) -> Result<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: user.id,
            email: user.email.clone(),
            name: user.name.clone(),
            avatar_url: user.avatar_url.clone(),
            iat: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
        };

        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?)
    }

    /// 验证会话令牌
    pub fn verify(&self, token: &str) -> Result<SessionUser> {
        let validation = Validation::new(Algorithm::HS256);

        match decode::<Claims>(token, &self.decoding_key, &validation) {
            Ok(data) => Ok(SessionUser {
                id: data.claims.sub,
                email: data.claims.email,
                name: data.claims.name,
                avatar_url: data.claims.avatar_url,
            }),
            Err(e) => {
                debug!("Session verification failed: {}", e);
                Err(AppError::Jwt(e))
            }
        }
    }

    pub fn session_cookie(&self, token: &str) -> String {
        self.cookie(SESSION_COOKIE, token, self.ttl.num_seconds())
    }

    pub fn clear_cookie(&self) -> String {
        self.cookie(SESSION_COOKIE, "", 0)
    }

    pub fn state_cookie(&self, state: &str) -> String {
        self.cookie(STATE_COOKIE, state, STATE_COOKIE_MAX_AGE_SECS)
    }

    pub fn clear_state_cookie(&self) -> String {
        self.cookie(STATE_COOKIE, "", 0)
    }

    fn cookie(&self, name: &str, value: &str, max_age: i64) -> String {
        let mut cookie = format!(
            "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
            name, value, max_age
        );
        if self.secure_cookies {
            cookie.push_str("; Secure");
        }
        cookie
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for SessionUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self> {
        let Extension(sessions): Extension<Arc<SessionService>> = parts
            .extract::<Extension<Arc<SessionService>>>()
            .await
            .map_err(|_| AppError::Internal("Session service not found in request extensions".to_string()))?;

        // Bearer 优先，其次是会话 cookie
        if let Ok(TypedHeader(Authorization(bearer))) =
            parts.extract::<TypedHeader<Authorization<Bearer>>>().await
        {
            return sessions.verify(bearer.token());
        }

        let TypedHeader(cookies) = parts
            .extract::<TypedHeader<Cookie>>()
            .await
            .map_err(|_| AppError::unauthorized("Not signed in"))?;

        let token = cookies
            .get(SESSION_COOKIE)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| AppError::unauthorized("Not signed in"))?;

        sessions.verify(token)
    }
}

/// 可选的会话用户
pub struct OptionalSession(pub Option<SessionUser>);

#[async_trait]
impl<S> FromRequestParts<S> for OptionalSession
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self> {
        match SessionUser::from_request_parts(parts, state).await {
            Ok(user) => Ok(OptionalSession(Some(user))),
            Err(_) => Ok(OptionalSession(None)),
        }
    }
}
