//! Google sign-in, from authorization code to an established session.
//!
//! Every step either succeeds or maps to one [`CallbackFailure`]; nothing
//! is persisted until the backend has accepted the identity token.

use crate::{
    config::Config,
    error::{AppError, Result},
    services::auth::SessionUser,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::RngCore;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct GoogleTokens {
    pub access_token: String,
    pub id_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GoogleProfile {
    pub email: String,
    pub name: Option<String>,
    pub picture: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendUser {
    pub id: Uuid,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendSession {
    pub access_token: Option<String>,
    pub user: BackendUser,
}

#[derive(Debug, Serialize)]
struct IdTokenGrant<'a> {
    provider: &'a str,
    id_token: &'a str,
}

/// Query string of the provider redirect.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub error: Option<String>,
    pub state: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackFailure {
    /// The provider reported an error; its code is passed through.
    Provider(String),
    NoCode,
    OAuthFailed,
    SignInFailed,
}

impl CallbackFailure {
    pub fn code(&self) -> &str {
        match self {
            CallbackFailure::Provider(code) => code,
            CallbackFailure::NoCode => "no_code",
            CallbackFailure::OAuthFailed => "oauth_failed",
            CallbackFailure::SignInFailed => "supabase_signin_failed",
        }
    }

    pub fn redirect_location(&self, public_url: &str) -> String {
        format!("{}/?error={}", public_url, urlencoding::encode(self.code()))
    }
}

/// 身份引导服务
#[derive(Clone)]
pub struct IdentityService {
    client: Client,
    config: Config,
}

impl IdentityService {
    pub fn new(config: &Config) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    /// Google 授权页地址
    pub fn authorization_url(&self, state: &str) -> Result<String> {
        let mut url = Url::parse(&self.config.google_auth_url)
            .map_err(|e| AppError::Internal(format!("Invalid GOOGLE_AUTH_URL: {}", e)))?;

        url.query_pairs_mut()
            .append_pair("client_id", &self.config.google_client_id)
            .append_pair("redirect_uri", &self.config.callback_url())
            .append_pair("response_type", "code")
            .append_pair("scope", "openid email profile")
            .append_pair("access_type", "offline")
            .append_pair("prompt", "consent")
            .append_pair("state", state);

        Ok(url.into())
    }

    pub fn new_state() -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }

    /// 用授权码换取令牌
    pub async fn exchange_code(&self, code: &str) -> Result<GoogleTokens> {
        debug!("Exchanging authorization code for tokens");
        let redirect_uri = self.config.callback_url();

        let response = self
            .client
            .post(&self.config.google_token_url)
            .form(&[
                ("code", code),
                ("client_id", self.config.google_client_id.as_str()),
                ("client_secret", self.config.google_client_secret.as_str()),
                ("redirect_uri", redirect_uri.as_str()),
                ("grant_type", "authorization_code"),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("Token exchange failed with status {}: {}", status, body);
            return Err(AppError::OAuthExchange(format!("Token endpoint returned {}", status)));
        }

        Ok(response.json::<GoogleTokens>().await?)
    }

    pub async fn fetch_profile(&self, access_token: &str) -> Result<GoogleProfile> {
        let response = self
            .client
            .get(&self.config.google_userinfo_url)
            .bearer_auth(access_token)
            .send()
            .await?;

        if !response.status().is_success() {
            error!("Failed to fetch user info: {}", response.status());
            return Err(AppError::OAuthExchange(format!(
                "Userinfo endpoint returned {}",
                response.status()
            )));
        }

        Ok(response.json::<GoogleProfile>().await?)
    }

    /// 用 ID token 在后端建立会话
    pub async fn establish_session(&self, id_token: &str) -> Result<BackendSession> {
        let url = format!("{}/auth/v1/token?grant_type=id_token", self.config.supabase_url);

        let response = self
            .client
            .post(&url)
            .header("apikey", &self.config.supabase_anon_key)
            .bearer_auth(&self.config.supabase_anon_key)
            .json(&IdTokenGrant {
                provider: "google",
                id_token,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("Backend sign-in failed with status {}: {}", status, body);
            return Err(AppError::unauthorized("Backend rejected the identity token"));
        }

        Ok(response.json::<BackendSession>().await?)
    }

    /// Runs the whole callback. `expected_state` is the value stored by the
    /// login route, if any.
    pub async fn complete_callback(
        &self,
        params: CallbackParams,
        expected_state: Option<&str>,
    ) -> std::result::Result<SessionUser, CallbackFailure> {
        if let Some(error) = params.error.filter(|e| !e.is_empty()) {
            warn!("OAuth error from provider: {}", error);
            return Err(CallbackFailure::Provider(error));
        }

        let Some(code) = params.code.filter(|c| !c.is_empty()) else {
            warn!("No authorization code received");
            return Err(CallbackFailure::NoCode);
        };

        if let Some(expected) = expected_state {
            if params.state.as_deref() != Some(expected) {
                warn!("OAuth state mismatch");
                return Err(CallbackFailure::OAuthFailed);
            }
        }

        let tokens = self.exchange_code(&code).await.map_err(|e| {
            error!("OAuth callback error: {}", e);
            CallbackFailure::OAuthFailed
        })?;

        let profile = self.fetch_profile(&tokens.access_token).await.map_err(|e| {
            error!("OAuth callback error: {}", e);
            CallbackFailure::OAuthFailed
        })?;

        let session = self.establish_session(&tokens.id_token).await.map_err(|e| {
            error!("Backend sign-in error: {}", e);
            CallbackFailure::SignInFailed
        })?;

        info!("User {} signed in", session.user.id);

        Ok(SessionUser {
            id: session.user.id,
            email: session.user.email.unwrap_or(profile.email),
            name: profile.name,
            avatar_url: profile.picture,
        })
    }
}
