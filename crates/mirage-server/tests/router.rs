//! Router tests: every route against a scripted engine, media against a
//! mock upstream.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;
use wiremock::matchers::{header as header_is, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mirage::backend::{ScriptedBackend, ScriptedPage};
use mirage::targets::instagram::{NO_ACTIVE_STORY, UNRESOLVED_USER};
use mirage::targets::tiktok;
use mirage::{Engine, ServiceConfig};
use mirage_server::{router, AppState, MAX_CACHED_MEDIA_BYTES};

// ─────────────────────── helpers ───────────────────────

struct Harness {
    app: Router,
    engine: Arc<Engine>,
    backend: ScriptedBackend,
}

async fn harness() -> Harness {
    harness_with_tiktok("http://127.0.0.1:9").await
}

async fn harness_with_tiktok(origin: &str) -> Harness {
    let backend = ScriptedBackend::new();
    let mut config = ServiceConfig {
        base_url: "http://mirage.test".into(),
        ..ServiceConfig::default()
    };
    config.pool.capacity = 2;
    config.pool.poll_interval = Duration::from_millis(20);
    config.race.settle_delay = Duration::ZERO;
    config.race.narrow_deadline = Duration::from_secs(2);
    config.race.broad_deadline = Duration::from_secs(3);
    config.tiktok.origin = origin.to_string();
    config.tiktok.retry_wait = Duration::from_millis(5);

    let engine = Arc::new(
        Engine::with_backend(Arc::new(backend.clone()), &config)
            .await
            .unwrap(),
    );
    let app = router(Arc::new(AppState::new(Arc::clone(&engine))));
    Harness {
        app,
        engine,
        backend,
    }
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Vec<u8>, Option<String>) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec();
    (status, body, content_type)
}

async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
    let (status, body, _) = get(app, uri).await;
    (status, serde_json::from_slice(&body).unwrap())
}

fn profile_page() -> ScriptedPage {
    let user = json!({
        "pk": "42",
        "username": "alice",
        "biography_with_entities": {},
        "profile_pic_url": "https://cdn.test/v/avatar.jpg",
        "edge_followed_by": {"count": 5}
    });
    ScriptedPage::html(format!(
        r#"<html><script type="application/json">{{"user": {user}}}</script></html>"#
    ))
}

// ─────────────────────── service routes ───────────────────────

#[tokio::test]
async fn test_health_and_status() {
    let h = harness().await;

    let (status, body) = get_json(&h.app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = get_json(&h.app, "/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["engine"]["pool"]["capacity"], 2);
    assert_eq!(body["engine"]["pool"]["idle"], 2);
    assert_eq!(body["engine"]["pool"]["backend"], "scripted");
    assert_eq!(body["cache"]["responses"], 0);
}

// ─────────────────────── instagram routes ───────────────────────

#[tokio::test]
async fn test_profile_is_cached() {
    let h = harness().await;
    h.backend.page("https://www.instagram.com/alice/", profile_page());

    let (status, body) = get_json(&h.app, "/instagram/Alice").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["username"], "alice");
    assert_eq!(body["statistics"]["followers"], 5);
    assert!(body["avatar"]["url"]
        .as_str()
        .unwrap()
        .starts_with("http://mirage.test/media/Instagram"));

    let (status, again) = get_json(&h.app, "/instagram/alice").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again, body);
    assert_eq!(h.backend.navigations_to("https://www.instagram.com/alice/"), 1);
}

#[tokio::test]
async fn test_profile_errors() {
    let h = harness().await;

    let (status, body) = get_json(&h.app, "/instagram/bad-name").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "- is not allowed in Instagram usernames");

    let (status, body) = get_json(&h.app, "/instagram/nobody").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], UNRESOLVED_USER);
    assert_eq!(h.engine.status().pool.idle, 2);
}

#[tokio::test]
async fn test_story_without_active_story() {
    let h = harness().await;
    h.backend
        .page("https://www.instagram.com/alice/", profile_page())
        .page(
            "https://www.instagram.com/stories/alice/",
            ScriptedPage::html("").with_final_url("https://www.instagram.com/alice/"),
        );

    let (status, body) = get_json(&h.app, "/instagram/alice/story").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], NO_ACTIVE_STORY);
}

#[tokio::test]
async fn test_post_requires_url() {
    let h = harness().await;

    let (status, body) = get_json(&h.app, "/instagram/post").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "A post URL is required.");

    let (status, body) = get_json(&h.app, "/instagram/post?url=https%3A%2F%2Fexample.com%2Fp%2Fx").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "The URL provided couldn't be resolved.");
}

#[tokio::test]
async fn test_highlight_route_rejects_non_numeric_ids() {
    let h = harness().await;
    let (status, body) = get_json(&h.app, "/instagram/highlight/abc").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "The highlight provided couldn't be resolved.");
}

// ─────────────────────── tiktok routes ───────────────────────

fn tiktok_profile_page() -> String {
    let blob = json!({
        "__DEFAULT_SCOPE__": {
            "webapp.user-detail": {
                "userInfo": {
                    "user": {
                        "id": "68",
                        "secUid": "MS4wLjABAAAA",
                        "uniqueId": "alice",
                        "nickname": "Alice",
                        "signature": "",
                        "avatarLarger": "https://p16.tiktokcdn.test/alice.jpeg"
                    },
                    "stats": {"followerCount": 7}
                }
            }
        }
    });
    format!(r#"<script id="__UNIVERSAL_DATA_FOR_REHYDRATION__">{blob}</script>"#)
}

#[tokio::test]
async fn test_tiktok_profile_and_posts_share_cached_user() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/@alice"))
        .respond_with(ResponseTemplate::new(200).set_body_string(tiktok_profile_page()))
        .expect(1)
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/creator/item_list/"))
        .and(query_param("secUid", "MS4wLjABAAAA"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status_code": 0,
            "itemList": [{
                "id": "7300000000000000001",
                "desc": "first",
                "author": {"id": "68", "uniqueId": "alice", "nickname": "Alice",
                           "avatarThumb": "https://p16.tiktokcdn.test/thumb.jpeg"},
                "stats": {"diggCount": 1, "commentCount": 0, "playCount": 10, "shareCount": 0},
                "video": {}
            }]
        })))
        .expect(1)
        .mount(&upstream)
        .await;

    let h = harness_with_tiktok(&upstream.uri()).await;

    let (status, profile) = get_json(&h.app, "/tiktok/@Alice").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(profile["username"], "alice");
    assert_eq!(profile["statistics"]["followers"], 7);

    let (status, posts) = get_json(&h.app, "/tiktok/alice/posts").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(posts["user"], profile);
    assert_eq!(posts["posts"][0]["statistics"]["views"], 10);
    assert!(posts["posts"][0]["video"]["url"]
        .as_str()
        .unwrap()
        .starts_with("http://mirage.test/media/TikTok"));

    let (_, again) = get_json(&h.app, "/tiktok/alice/posts").await;
    assert_eq!(again, posts);
    assert_eq!(h.engine.status().pool.idle, 2);
}

#[tokio::test]
async fn test_tiktok_reposts_with_upstream_error_status_are_empty() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/@alice"))
        .respond_with(ResponseTemplate::new(200).set_body_string(tiktok_profile_page()))
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/repost/item_list/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status_code": 10201})))
        .mount(&upstream)
        .await;

    let h = harness_with_tiktok(&upstream.uri()).await;
    let (status, body) = get_json(&h.app, "/tiktok/alice/reposts").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["user"]["username"], "alice");
    assert_eq!(body["posts"], json!([]));
}

#[tokio::test]
async fn test_tiktok_route_errors() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/@nobody"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
        .mount(&upstream)
        .await;
    let h = harness_with_tiktok(&upstream.uri()).await;

    let (status, body) = get_json(&h.app, "/tiktok/nobody").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], tiktok::UNRESOLVED_USER);

    let (status, body) = get_json(&h.app, "/tiktok/bad-name").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "- is not allowed in TikTok usernames");

    let (status, body) = get_json(&h.app, "/tiktok/post").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "A post URL is required.");

    let (status, body) =
        get_json(&h.app, "/tiktok/post?url=https%3A%2F%2Fwww.tiktok.com%2F%40alice").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], tiktok::NOT_A_POST);
}

// ─────────────────────── media ───────────────────────

#[tokio::test]
async fn test_unknown_media_is_not_found() {
    let h = harness().await;
    let (status, body) = get_json(&h.app, "/media/Instagramdeadbeef.jpg").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, json!({"error": "File not found."}));
}

#[tokio::test]
async fn test_media_is_fetched_once_with_referer() {
    let upstream = MockServer::start().await;
    let png = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0];
    Mock::given(method("GET"))
        .and(path("/v/cover.jpg"))
        .and(header_is("Referer", "https://www.instagram.com/alice/"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(png.to_vec()))
        .expect(1)
        .mount(&upstream)
        .await;

    let h = harness().await;
    let media = h
        .engine
        .media
        .publish(
            &format!("{}/v/cover.jpg", upstream.uri()),
            "Instagram",
            None,
            vec![(
                "Referer".to_string(),
                "https://www.instagram.com/alice/".to_string(),
            )],
        )
        .unwrap();
    let uri = format!("/media/{}", media.filename);

    let (status, body, content_type) = get(&h.app, &uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, png.to_vec());
    assert_eq!(content_type.as_deref(), Some("image/png"));

    let (status, again, _) = get(&h.app, &uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again, body);
}

#[tokio::test]
async fn test_oversized_media_is_not_kept_in_memory() {
    let upstream = MockServer::start().await;
    let body = vec![0u8; MAX_CACHED_MEDIA_BYTES + 1];
    Mock::given(method("GET"))
        .and(path("/v/long.mp4"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "video/mp4")
                .set_body_bytes(body.clone()),
        )
        .expect(2)
        .mount(&upstream)
        .await;

    let h = harness().await;
    let media = h
        .engine
        .media
        .publish(&format!("{}/v/long.mp4", upstream.uri()), "Instagram", None, vec![])
        .unwrap();
    let uri = format!("/media/{}", media.filename);

    for _ in 0..2 {
        let (status, served, _) = get(&h.app, &uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(served.len(), body.len());
    }

    let (_, snapshot) = get_json(&h.app, "/status").await;
    assert_eq!(snapshot["cache"]["media"], 0);
}

#[tokio::test]
async fn test_media_upstream_failure_is_bad_gateway() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&upstream)
        .await;

    let h = harness().await;
    let media = h
        .engine
        .media
        .publish(&format!("{}/v/gone.jpg", upstream.uri()), "Instagram", None, vec![])
        .unwrap();

    let (status, body) = get_json(&h.app, &format!("/media/{}", media.filename)).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(body["error"].as_str().unwrap().contains("403"));
}
