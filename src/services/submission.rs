use crate::{
    error::{AppError, Result},
    models::{
        bookmark::{Bookmark, CreateBookmarkRequest},
        realtime::SubmissionFrame,
    },
    services::{auth::SessionUser, store::BookmarkStore},
    utils::validation::validate_bookmark_input,
};
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

const FALLBACK_ERROR: &str = "Failed to add bookmark. Please try again.";

/// 添加书签表单的状态
#[derive(Debug, Clone, Default)]
pub struct SubmissionForm {
    pub url: String,
    pub title: String,
    pub error: Option<String>,
    pub success_until: Option<Instant>,
}

impl SubmissionForm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn success_visible(&self, now: Instant) -> bool {
        matches!(self.success_until, Some(until) if now < until)
    }

    /// Clears an expired success flag. Returns whether anything changed.
    pub fn dismiss_success_if_due(&mut self, now: Instant) -> bool {
        match self.success_until {
            Some(until) if now >= until => {
                self.success_until = None;
                true
            }
            _ => false,
        }
    }

    pub fn frame(&self, now: Instant) -> SubmissionFrame {
        SubmissionFrame {
            url: self.url.clone(),
            title: self.title.clone(),
            error: self.error.clone(),
            success: self.success_visible(now),
        }
    }
}

/// 书签提交服务
#[derive(Clone)]
pub struct SubmissionService {
    store: Arc<dyn BookmarkStore>,
    flash_duration: Duration,
}

impl SubmissionService {
    pub fn new(store: Arc<dyn BookmarkStore>, flash_duration: Duration) -> Self {
        Self {
            store,
            flash_duration,
        }
    }

    /// Validates and inserts. The new row reaches open views through the
    /// change feed only.
    pub async fn create(&self, user_id: Uuid, request: CreateBookmarkRequest) -> Result<Bookmark> {
        debug!("Creating bookmark for user {}", user_id);
        let bookmark = validate_bookmark_input(&request.url, &request.title)?;
        self.store.insert(user_id, bookmark).await
    }

    /// Form-driven submission: updates `form` in place on every outcome.
    pub async fn submit(&self, user: &SessionUser, form: &mut SubmissionForm) -> Result<Bookmark> {
        form.error = None;
        form.success_until = None;

        let request = CreateBookmarkRequest {
            url: form.url.clone(),
            title: form.title.clone(),
        };

        match self.create(user.id, request).await {
            Ok(bookmark) => {
                form.url.clear();
                form.title.clear();
                form.success_until = Some(Instant::now() + self.flash_duration);
                Ok(bookmark)
            }
            Err(e) => {
                if !matches!(e, AppError::Validation(_) | AppError::ValidatorError(_)) {
                    warn!("Error adding bookmark: {}", e);
                }
                form.error = Some(submission_message(&e));
                Err(e)
            }
        }
    }
}

fn submission_message(error: &AppError) -> String {
    match error {
        AppError::Validation(_) | AppError::ValidatorError(_) | AppError::Store(_) => {
            let message = error.user_message();
            if message.trim().is_empty() {
                FALLBACK_ERROR.to_string()
            } else {
                message
            }
        }
        _ => FALLBACK_ERROR.to_string(),
    }
}
