use crate::{
    error::{AppError, Result},
    models::{
        bookmark::{Bookmark, CreateBookmarkRequest, UpdateBookmarkRequest},
        response::ApiResponse,
    },
    services::auth::SessionUser,
    state::AppState,
    utils::validation::validate_absolute_url,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, put},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;
use validator::Validate;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(get_user_bookmarks).post(create_bookmark))
        .route("/:id", put(update_bookmark).delete(delete_bookmark))
}

/// Get user's bookmarks
/// GET /api/bookmarks
async fn get_user_bookmarks(
    State(state): State<Arc<AppState>>,
    user: SessionUser,
) -> Result<Json<Value>> {
    debug!("Getting bookmarks for user: {}", user.id);

    let bookmarks = state.store.list_for_user(user.id).await?;

    Ok(Json(json!({
        "success": true,
        "data": bookmarks
    })))
}

/// Create a bookmark
/// POST /api/bookmarks
async fn create_bookmark(
    State(state): State<Arc<AppState>>,
    user: SessionUser,
    Json(request): Json<CreateBookmarkRequest>,
) -> Result<(StatusCode, Json<ApiResponse<Bookmark>>)> {
    let bookmark = state.submission.create(user.id, request).await?;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success_with_message(bookmark, "Bookmark created successfully")),
    ))
}

/// Edit a bookmark's url or title
/// PUT /api/bookmarks/:id
async fn update_bookmark(
    State(state): State<Arc<AppState>>,
    user: SessionUser,
    Path(bookmark_id): Path<Uuid>,
    Json(request): Json<UpdateBookmarkRequest>,
) -> Result<Json<ApiResponse<Bookmark>>> {
    debug!("Updating bookmark {} for user {}", bookmark_id, user.id);

    let changes = UpdateBookmarkRequest {
        url: request.url.map(|url| url.trim().to_string()),
        title: request.title.map(|title| title.trim().to_string()),
    };

    if changes.is_empty() {
        return Err(AppError::bad_request("Nothing to update"));
    }
    changes.validate()?;
    if let Some(url) = &changes.url {
        validate_absolute_url(url)?;
    }

    let bookmark = state
        .store
        .update(user.id, bookmark_id, changes)
        .await?
        .ok_or_else(|| AppError::not_found("Bookmark"))?;

    Ok(Json(ApiResponse::success(bookmark)))
}

/// Delete a bookmark; deleting a missing id succeeds
/// DELETE /api/bookmarks/:id
async fn delete_bookmark(
    State(state): State<Arc<AppState>>,
    user: SessionUser,
    Path(bookmark_id): Path<Uuid>,
) -> Result<Json<Value>> {
    debug!("Deleting bookmark {} for user {}", bookmark_id, user.id);

    state.store.delete(user.id, bookmark_id).await?;

    Ok(Json(json!({
        "success": true,
        "message": "Bookmark removed"
    })))
}
