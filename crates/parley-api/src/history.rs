//! Out-of-band history retrieval. Pagination itself lives in
//! parley-db::history; these handlers adapt it to HTTP and keep the
//! blocking SQLite work off the async runtime.

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
};
use serde::Deserialize;
use tracing::error;

use parley_db::history::{DEFAULT_LIMIT, HistoryOptions};
use parley_types::api::{Claims, Direction, HistoryResponse, ThreadResponse};

use crate::auth::AppState;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Message id of the page boundary from a previous response
    pub cursor: Option<i64>,
    #[serde(default)]
    pub direction: Direction,
}

fn default_limit() -> u32 {
    DEFAULT_LIMIT
}

impl HistoryQuery {
    fn options(&self) -> HistoryOptions {
        HistoryOptions {
            limit: self.limit,
            cursor: self.cursor,
            direction: self.direction,
        }
    }
}

pub async fn room_history(
    State(state): State<AppState>,
    Path(room_id): Path<i64>,
    Query(query): Query<HistoryQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let db = state.db.clone();
    let user_id = claims.sub.to_string();
    let opts = query.options();

    let page = tokio::task::spawn_blocking(move || db.room_history(room_id, &user_id, opts))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            ApiError::Internal(anyhow::anyhow!("history task failed"))
        })??;

    Ok(Json(page))
}

pub async fn thread_history(
    State(state): State<AppState>,
    Path(message_id): Path<i64>,
    Query(query): Query<HistoryQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<ThreadResponse>, ApiError> {
    let db = state.db.clone();
    let user_id = claims.sub.to_string();
    let opts = query.options();

    let thread = tokio::task::spawn_blocking(move || db.thread_history(message_id, &user_id, opts))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            ApiError::Internal(anyhow::anyhow!("history task failed"))
        })??;

    Ok(Json(thread))
}
