use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::auth;
use crate::config::{Config, IceServer};
use crate::error::{Error, Result};
use crate::hub::Hub;
use crate::ice;
use crate::session::{RoomInfo, SessionStore};
use crate::store::Store;

// ─── AppState ───────────────────────────────────────────────────────────────

pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub sessions: SessionStore,
    pub hub: Hub,
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn Store>) -> Arc<Self> {
        let sessions = SessionStore::new(store.clone(), &config);
        let hub = Hub::new(store.clone(), &config);
        Arc::new(Self {
            config,
            store,
            sessions,
            hub,
            http: reqwest::Client::new(),
        })
    }
}

/// All application routes.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/rooms", post(create_room))
        .route("/api/rooms/join", post(join_room))
        .route("/api/rooms/:room_id", get(get_room))
        .route("/ws/:room_id", get(crate::socket::ws_handler))
        .with_state(state)
}

// ─── Request / Response DTOs ────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateRoomRequest {
    pub name: String,
    pub credential: String,
    #[serde(default)]
    pub admin_code: Option<String>,
}

#[derive(Serialize)]
pub struct CreateRoomResponse {
    pub room_id: String,
    pub name: String,
    pub share_url: String,
    pub token: String,
    pub ice_servers: Vec<IceServer>,
}

#[derive(Deserialize)]
pub struct JoinRoomRequest {
    pub room_id: String,
    pub credential: String,
}

#[derive(Serialize)]
pub struct JoinRoomResponse {
    pub room_id: String,
    pub name: String,
    pub token: String,
    pub ice_servers: Vec<IceServer>,
}

// ─── POST /api/rooms — create a room ────────────────────────────────────────

pub async fn create_room(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<CreateRoomRequest>,
) -> Result<Json<CreateRoomResponse>> {
    check_rate_limit(
        &state.store,
        &format!("rl:create:{}", addr.ip()),
        state.config.create_limit_per_hour,
        Duration::from_secs(3600),
    )
    .await?;

    if let Some(expected) = &state.config.admin_code {
        if body.admin_code.as_deref() != Some(expected.as_str()) {
            return Err(Error::forbidden("room creation is restricted"));
        }
    }

    let room = state.sessions.create(&body.name, &body.credential).await?;

    let display_name = auth::random_display_name();
    let token = auth::create_token(
        &state.config.jwt_secret,
        &room.id,
        &room.host_id,
        &display_name,
        true,
        state.config.token_ttl.as_secs(),
    )?;

    info!(room_id = %room.id, name = %room.name, "room created");

    Ok(Json(CreateRoomResponse {
        share_url: format!("{}/join/{}", state.config.public_url, room.id),
        room_id: room.id,
        name: room.name,
        token,
        ice_servers: ice::ice_servers(&state.config, &state.store, &state.http).await,
    }))
}

// ─── POST /api/rooms/join — join a room ─────────────────────────────────────

pub async fn join_room(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<JoinRoomRequest>,
) -> Result<Json<JoinRoomResponse>> {
    check_rate_limit(
        &state.store,
        &format!("rl:join:{}:{}", body.room_id, addr.ip()),
        state.config.join_limit_per_minute,
        Duration::from_secs(60),
    )
    .await?;

    let room = state.sessions.get(&body.room_id).await?;
    if !state
        .sessions
        .verify_credential(&body.room_id, &body.credential)
        .await?
    {
        return Err(Error::unauthorized("invalid room credential"));
    }

    let participant_id = uuid::Uuid::new_v4().to_string();
    state
        .sessions
        .add_participant(&body.room_id, &participant_id)
        .await?;

    let display_name = auth::random_display_name();
    let token = auth::create_token(
        &state.config.jwt_secret,
        &room.id,
        &participant_id,
        &display_name,
        false,
        state.config.token_ttl.as_secs(),
    )?;

    info!(room_id = %room.id, participant_id = %participant_id, "participant joined");

    Ok(Json(JoinRoomResponse {
        room_id: room.id,
        name: room.name,
        token,
        ice_servers: ice::ice_servers(&state.config, &state.store, &state.http).await,
    }))
}

// ─── GET /api/rooms/:room_id — room details ─────────────────────────────────

pub async fn get_room(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<RoomInfo>> {
    let token = bearer_token(&headers)?;
    let claims = auth::verify_token(&state.config.jwt_secret, token)?;
    if claims.room_id != room_id {
        return Err(Error::forbidden("token does not grant access to this room"));
    }

    let room = state.sessions.get(&room_id).await?;
    Ok(Json(room.info()))
}

// ─── GET /health ────────────────────────────────────────────────────────────

pub async fn health(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>> {
    state.store.ping().await?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

// ─── Helpers ────────────────────────────────────────────────────────────────

fn bearer_token(headers: &HeaderMap) -> Result<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Error::unauthorized("missing authorization header"))?
        .strip_prefix("Bearer ")
        .ok_or_else(|| Error::unauthorized("malformed authorization header"))
}

async fn check_rate_limit(
    store: &Arc<dyn Store>,
    key: &str,
    limit: u64,
    window: Duration,
) -> Result<()> {
    let count = store.incr_window(key, window).await?;
    if count > limit {
        return Err(Error::RateLimited);
    }
    Ok(())
}

// ─── Tests ──────────────────────────────────────────────────────────────────
