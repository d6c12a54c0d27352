use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Message, RoomKind};

// -- JWT Claims --

/// JWT claims shared by the REST middleware and the WebSocket handshake.
/// Canonical definition lives here to eliminate duplication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub exp: usize,
}

// -- Auth --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub user_id: Uuid,
    pub token: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub user_id: Uuid,
    pub username: String,
    pub token: String,
}

// -- Rooms --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateRoomRequest {
    pub name: String,
    #[serde(default)]
    pub kind: Option<RoomKind>,
    #[serde(default)]
    pub description: Option<String>,
}

// -- History --

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Older,
    Newer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pagination {
    pub has_more: bool,
    pub next_cursor: Option<i64>,
    pub prev_cursor: Option<i64>,
}

/// Room history page. `data` is always newest-first regardless of the
/// fetch direction that produced it.
#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub data: Vec<Message>,
    pub pagination: Pagination,
}

/// Thread history: the root message plus a page of its replies under the
/// same pagination contract.
#[derive(Debug, Serialize, Deserialize)]
pub struct ThreadResponse {
    pub parent: Message,
    pub replies: Vec<Message>,
    pub pagination: Pagination,
}
