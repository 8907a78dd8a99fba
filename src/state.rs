use crate::{
    config::Config,
    error::{AppError, Result},
    services::{
        auth::SessionService, change_feed::ChangeFeed, identity::IdentityService,
        store::BookmarkStore, submission::SubmissionService,
    },
    utils::middleware::{build_rate_limiter, KeyedRateLimiter},
};
use handlebars::Handlebars;
use std::{sync::Arc, time::Duration};

const INDEX_TEMPLATE: &str = include_str!("../templates/index.hbs");

/// 应用程序的共享状态
#[derive(Clone)]
pub struct AppState {
    /// 应用配置
    pub config: Config,

    /// 书签存储
    pub store: Arc<dyn BookmarkStore>,

    /// 变更推送
    pub feed: ChangeFeed,

    pub sessions: Arc<SessionService>,
    pub identity: IdentityService,
    pub submission: SubmissionService,
    pub templates: Arc<Handlebars<'static>>,
    pub rate_limiter: Arc<KeyedRateLimiter>,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn BookmarkStore>, feed: ChangeFeed) -> Result<Self> {
        let mut templates = Handlebars::new();
        templates
            .register_template_string("index", INDEX_TEMPLATE)
            .map_err(|e| AppError::Internal(format!("Invalid index template: {}", e)))?;

        let submission = SubmissionService::new(
            store.clone(),
            Duration::from_millis(config.submission_flash_ms),
        );

        Ok(Self {
            sessions: Arc::new(SessionService::new(&config)),
            identity: IdentityService::new(&config)?,
            rate_limiter: Arc::new(build_rate_limiter(config.rate_limit_requests)),
            templates: Arc::new(templates),
            submission,
            store,
            feed,
            config,
        })
    }
}
