//! Sync endpoint routes.

use axum::{extract::State, routing::post, Json, Router};
use cuaderno_engine::protocol::{PULL_PATH, PUSH_PATH};
use cuaderno_engine::{PullRequest, PullResponse, PushRequest, PushResponse};

use crate::auth::AuthUser;
use crate::error::Result;
use crate::handlers::{handle_pull, handle_push};
use crate::AppState;

/// Create sync routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route(PULL_PATH, post(pull_handler))
        .route(PUSH_PATH, post(push_handler))
}

/// POST /sync/pull - Changes since the client's cursor.
async fn pull_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Json(request): Json<PullRequest>,
) -> Result<Json<PullResponse>> {
    let response = handle_pull(&state.pool, request).await?;
    Ok(Json(response))
}

/// POST /sync/push - Apply the client's queued changes.
async fn push_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Json(request): Json<PushRequest>,
) -> Result<Json<PushResponse>> {
    let response = handle_push(&state.pool, request).await?;
    Ok(Json(response))
}
