use axum::{
    Extension, Json,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
};

use parley_types::api::{Claims, CreateRoomRequest};
use parley_types::models::{Room, RoomKind};

use crate::auth::AppState;
use crate::error::ApiError;

pub async fn create_room(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateRoomRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let name = req.name.trim();
    if name.is_empty() || name.len() > 64 {
        return Err(ApiError::Validation("room name must be 1-64 characters".into()));
    }

    let kind = req.kind.unwrap_or(RoomKind::Public);
    let description = req.description.unwrap_or_default();

    let row = state
        .db
        .create_room(name, kind.as_str(), &description, &claims.sub.to_string())?
        .ok_or_else(|| ApiError::Conflict("room name already taken".into()))?;

    Ok((StatusCode::CREATED, Json(row.into_room())))
}

pub async fn list_rooms(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<Room>>, ApiError> {
    let rows = state.db.list_rooms_for_user(&claims.sub.to_string())?;
    Ok(Json(rows.into_iter().map(|r| r.into_room()).collect()))
}
