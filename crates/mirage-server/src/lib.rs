// Copyright 2026 Mirage Contributors
// SPDX-License-Identifier: Apache-2.0

//! HTTP boundary for Mirage.
//!
//! Every lookup endpoint is served from a TTL cache keyed by route prefix
//! and normalised input; misses run the engine. Redistributed media is
//! fetched lazily on first request and cached the same way.

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use mirage::cache::{ttl, ResponseCache};
use mirage::media::FetchedMedia;
use mirage::targets::instagram::{self, Profile};
use mirage::targets::tiktok;
use mirage::{Engine, MirageError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

const PROFILE_PREFIX: &str = "instagram:user";
const STORY_PREFIX: &str = "instagram:story";
const HIGHLIGHT_PREFIX: &str = "instagram:highlight";
const POST_PREFIX: &str = "instagram:post";
const TIKTOK_POST_PREFIX: &str = "tiktok:post";
const TIKTOK_USER_PREFIX: &str = "tiktok:user";
const TIKTOK_POSTS_PREFIX: &str = "tiktok:posts";
const TIKTOK_REPOSTS_PREFIX: &str = "tiktok:reposts";
const MEDIA_PREFIX: &str = "media";

/// Media bodies kept in memory at once.
const MEDIA_CACHE_ENTRIES: usize = 256;
/// Bodies above this size are streamed through without being cached.
pub const MAX_CACHED_MEDIA_BYTES: usize = 2 * 1024 * 1024;

/// Shared by every handler.
pub struct AppState {
    pub engine: Arc<Engine>,
    responses: ResponseCache<Value>,
    media: ResponseCache<FetchedMedia>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            responses: ResponseCache::default(),
            media: ResponseCache::new(MEDIA_CACHE_ENTRIES),
        }
    }
}

/// Build the router with every endpoint.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/media/:filename", get(media))
        .route("/instagram/post", get(post))
        .route("/instagram/highlight/:id", get(highlight))
        .route("/instagram/:username", get(profile))
        .route("/instagram/:username/story", get(story))
        .route("/tiktok/post", get(tiktok_post))
        .route("/tiktok/:username", get(tiktok_profile))
        .route("/tiktok/:username/posts", get(tiktok_posts))
        .route("/tiktok/:username/reposts", get(tiktok_reposts))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ── errors ──────────────────────────────────────────────────────

/// A JSON error body: `{"error": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn file_not_found() -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: "File not found.".to_string(),
        }
    }
}

impl From<MirageError> for ApiError {
    fn from(e: MirageError) -> Self {
        let status =
            StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let message = match e {
            MirageError::Resolution(message) | MirageError::InvalidInput(message) => message,
            other => other.to_string(),
        };
        if status.is_server_error() {
            tracing::warn!("request failed with {status}: {message}");
        }
        Self { status, message }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Serve `prefix:key` from the response cache, computing it on a miss.
async fn cached<T, F, Fut>(
    cache: &ResponseCache<Value>,
    prefix: &str,
    key: &str,
    ttl: Duration,
    compute: F,
) -> Result<Value, MirageError>
where
    T: Serialize,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, MirageError>>,
{
    cache
        .get_or_try_insert_with(prefix, key, ttl, move || async move {
            let value = compute().await?;
            Ok::<Value, MirageError>(serde_json::to_value(value)?)
        })
        .await
}

// ── handlers ────────────────────────────────────────────────────

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn status(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "engine": state.engine.status(),
        "cache": {
            "responses": state.responses.len(),
            "media": state.media.len(),
        },
    }))
}

async fn media(
    State(state): State<Arc<AppState>>,
    Path(filename): Path<String>,
) -> ApiResult<Response> {
    let reference = state
        .engine
        .media
        .resolve(&filename)
        .map_err(|_| ApiError::file_not_found())?;

    let fetched = match state.media.get(MEDIA_PREFIX, &filename) {
        Some(fetched) => fetched,
        None => {
            let fetched = state.engine.fetcher.fetch(&reference).await?;
            if fetched.bytes.len() <= MAX_CACHED_MEDIA_BYTES {
                state
                    .media
                    .insert(MEDIA_PREFIX, &filename, fetched.clone(), ttl::MEDIA);
            } else {
                tracing::debug!("not caching {filename}: {} bytes", fetched.bytes.len());
            }
            fetched
        }
    };

    Ok(([(header::CONTENT_TYPE, fetched.content_type)], fetched.bytes).into_response())
}

/// Profile JSON, cached under the normalised username.
async fn profile_value(state: &AppState, raw: &str) -> Result<Value, MirageError> {
    let username = instagram::validate_username(raw)?;
    cached(&state.responses, PROFILE_PREFIX, &username, ttl::PROFILE, || {
        state.engine.instagram.profile(&username)
    })
    .await
}

async fn profile(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
) -> ApiResult<Json<Value>> {
    Ok(Json(profile_value(&state, &username).await?))
}

async fn story(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
) -> ApiResult<Json<Value>> {
    let profile: Profile = serde_json::from_value(profile_value(&state, &username).await?)
        .map_err(MirageError::from)?;
    let user_id = profile.id.clone();
    let feed = cached(&state.responses, STORY_PREFIX, &user_id, ttl::STORY, || {
        state.engine.instagram.story_for(profile)
    })
    .await?;
    Ok(Json(feed))
}

async fn highlight(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let id = instagram::normalize_highlight_id(&id);
    let highlight = cached(&state.responses, HIGHLIGHT_PREFIX, &id, ttl::HIGHLIGHT, || {
        state.engine.instagram.highlight(&id)
    })
    .await?;
    Ok(Json(highlight))
}

#[derive(Debug, Deserialize)]
struct PostParams {
    url: Option<String>,
}

async fn post(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PostParams>,
) -> ApiResult<Json<Value>> {
    let url = params
        .url
        .filter(|url| !url.trim().is_empty())
        .ok_or_else(|| MirageError::InvalidInput("A post URL is required.".into()))?;
    let post_id = instagram::parse_post_url(&url)
        .ok_or_else(|| MirageError::InvalidInput(instagram::UNRESOLVED_POST.into()))?;

    let post = cached(&state.responses, POST_PREFIX, &post_id, ttl::POST, || {
        state.engine.instagram.post(&url)
    })
    .await?;
    Ok(Json(post))
}

async fn tiktok_post(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PostParams>,
) -> ApiResult<Json<Value>> {
    let url = params
        .url
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty())
        .ok_or_else(|| MirageError::InvalidInput("A post URL is required.".into()))?;
    if !tiktok::is_post_url(&url) {
        return Err(MirageError::InvalidInput(tiktok::NOT_A_POST.into()).into());
    }

    let post = cached(&state.responses, TIKTOK_POST_PREFIX, &url, ttl::TIKTOK_POST, || {
        state.engine.tiktok.post(&url)
    })
    .await?;
    Ok(Json(post))
}

/// TikTok profile JSON, cached under the normalised username.
async fn tiktok_profile_value(state: &AppState, raw: &str) -> Result<Value, MirageError> {
    let username = tiktok::validate_username(raw)?;
    cached(&state.responses, TIKTOK_USER_PREFIX, &username, ttl::TIKTOK_USER, || {
        state.engine.tiktok.profile(&username)
    })
    .await
}

async fn tiktok_profile(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
) -> ApiResult<Json<Value>> {
    Ok(Json(tiktok_profile_value(&state, &username).await?))
}

async fn tiktok_posts(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
) -> ApiResult<Json<Value>> {
    let profile: tiktok::Profile =
        serde_json::from_value(tiktok_profile_value(&state, &username).await?)
            .map_err(MirageError::from)?;
    let key = profile.username.clone();
    let posts = cached(&state.responses, TIKTOK_POSTS_PREFIX, &key, ttl::TIKTOK_POSTS, || {
        state.engine.tiktok.posts_for(profile)
    })
    .await?;
    Ok(Json(posts))
}

async fn tiktok_reposts(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
) -> ApiResult<Json<Value>> {
    let profile: tiktok::Profile =
        serde_json::from_value(tiktok_profile_value(&state, &username).await?)
            .map_err(MirageError::from)?;
    let key = profile.username.clone();
    let reposts = cached(&state.responses, TIKTOK_REPOSTS_PREFIX, &key, ttl::TIKTOK_POSTS, || {
        state.engine.tiktok.reposts_for(profile)
    })
    .await?;
    Ok(Json(reposts))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_are_public_for_resolution() {
        let err = ApiError::from(MirageError::Resolution(instagram::UNRESOLVED_USER.into()));
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.message, instagram::UNRESOLVED_USER);

        let err = ApiError::from(MirageError::PoolSaturated { waiters: 64 });
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(err.message.contains("64"));

        let err = ApiError::from(MirageError::Fetch("upstream returned 403".into()));
        assert_eq!(err.status, StatusCode::BAD_GATEWAY);
    }
}
