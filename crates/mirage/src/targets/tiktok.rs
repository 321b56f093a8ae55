//! TikTok: profiles, posts and reposts.
//!
//! TikTok answers plain HTTP, so no session is checked out. Profiles are
//! read from the rehydration blob embedded in the profile page; posts come
//! from the player API (single post) or the creator item lists (a user's
//! posts and reposts).

use super::{count, flag, pretty_url, require_text, retry, text, text_any, timestamp};
use crate::config::{TikTokConfig, DEFAULT_USER_AGENT};
use crate::error::MirageError;
use crate::locator;
use crate::media::{Media, MediaRedistributor};
use chrono::{DateTime, Utc};
use rand::Rng;
use regex::Regex;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

/// Public origin used for the links in every model.
pub const ORIGIN: &str = "https://www.tiktok.com";
/// Category prefix for redistributed media keys.
pub const MEDIA_CATEGORY: &str = "TikTok";

pub const NOT_A_POST: &str = "The URL provided doesn't appear to be a TikTok post.";
pub const UNRESOLVED_POST: &str = "The URL provided couldn't be resolved.";
pub const UNRESOLVED_USER: &str = "The user provided couldn't be resolved.";

const USER_SIGNATURE: &str = "userInfo";
/// Mirror serving watermark-free video by post id.
const VIDEO_MIRROR: &str = "https://tikwm.com/video/media/play";
const POSTS_PATH: &str = "/api/creator/item_list/";
const REPOSTS_PATH: &str = "/api/repost/item_list/";
const PAGE_SIZE: &str = "15";
const HEX_DIGITS: &[u8] = b"0123456789abcdefABCDEF";

// ── input validation ─────────────────────────────────────────────────────────

fn short_link_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^https?://(?:vt|vm|www)\.tiktok\.com/(?:t/)?[a-zA-Z\d]+/?$")
            .expect("short link pattern is valid")
    })
}

fn post_link_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^https?://(?:www\.)?tiktok\.com/[@\w.]+/(?:video|photo)/(\d+)")
            .expect("post link pattern is valid")
    })
}

/// Whether `url` is a short share link or a full post link.
pub fn is_post_url(url: &str) -> bool {
    short_link_pattern().is_match(url) || post_link_pattern().is_match(url)
}

/// The numeric id of a full post link.
pub fn post_id(url: &str) -> Option<String> {
    post_link_pattern()
        .captures(url)
        .and_then(|captures| captures.get(1))
        .map(|id| id.as_str().to_string())
}

/// Normalise a username: a leading `@` stripped, lower-cased.
pub fn validate_username(raw: &str) -> Result<String, MirageError> {
    let username = raw.trim().trim_start_matches('@').to_lowercase();
    if username.is_empty() {
        return Err(MirageError::InvalidInput("Usernames cannot be empty".into()));
    }
    if let Some(c) = username
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.')))
    {
        return Err(MirageError::InvalidInput(format!(
            "{c} is not allowed in TikTok usernames"
        )));
    }
    Ok(username)
}

fn profile_url(username: &str) -> String {
    format!("{ORIGIN}/@{username}")
}

/// Query for the creator item lists, with a fresh device id and fingerprint.
fn listing_query(sec_uid: &str) -> Vec<(&'static str, String)> {
    let mut rng = rand::thread_rng();
    let device_id: u64 = rng.gen_range(7_250_000_000_000_000_000..=7_351_147_085_025_500_000);
    let fingerprint: String = (0..7)
        .map(|_| HEX_DIGITS[rng.gen_range(0..HEX_DIGITS.len())] as char)
        .collect();

    let fixed = [
        ("aid", "1988"),
        ("app_language", "en"),
        ("app_name", "tiktok_web"),
        ("browser_language", "en-US"),
        ("browser_name", "Mozilla"),
        ("browser_online", "true"),
        ("browser_platform", "Win32"),
        ("browser_version", "5.0 (Windows)"),
        ("channel", "tiktok_web"),
        ("cookie_enabled", "true"),
        ("count", PAGE_SIZE),
        ("cursor", "0"),
        ("device_platform", "web_pc"),
        ("focus_state", "true"),
        ("from_page", "user"),
        ("history_len", "2"),
        ("is_fullscreen", "false"),
        ("is_page_visible", "true"),
        ("language", "en"),
        ("os", "windows"),
        ("priority_region", ""),
        ("referer", ""),
        ("region", "US"),
        ("screen_height", "1080"),
        ("screen_width", "1920"),
        ("type", "1"),
        ("tz_name", "UTC"),
        ("webcast_language", "en"),
    ];
    let mut query: Vec<(&'static str, String)> = fixed
        .into_iter()
        .map(|(key, value)| (key, value.to_string()))
        .collect();
    query.push(("device_id", device_id.to_string()));
    query.push(("secUid", sec_uid.to_string()));
    query.push(("verifyFp", format!("verify_{fingerprint}")));
    query
}

// ── models ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BioLink {
    pub url: String,
    pub pretty_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub title: String,
    pub starts_at: DateTime<Utc>,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserStatistics {
    pub followers: u64,
    pub following: u64,
    pub likes: u64,
    pub videos: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub sec_uid: String,
    pub username: String,
    pub nickname: String,
    pub biography: String,
    pub avatar: Media,
    pub is_verified: bool,
    pub is_private: bool,
    /// Room id of the live stream, when the user is live.
    pub live_id: Option<String>,
    pub link: Option<BioLink>,
    pub events: Vec<Event>,
    pub statistics: UserStatistics,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Author {
    pub id: String,
    pub sec_uid: Option<String>,
    pub username: String,
    pub full_name: String,
    pub avatar: Media,
    pub biography: Option<String>,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostStatistics {
    pub likes: u64,
    pub comments: u64,
    /// Always zero for posts read from the player API.
    pub views: u64,
    pub shares: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub author: Author,
    pub caption: String,
    pub statistics: PostStatistics,
    /// Set for videos; slideshows carry `images` instead.
    pub video: Option<Media>,
    pub images: Vec<Media>,
    pub created_at: Option<DateTime<Utc>>,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostList {
    pub user: Profile,
    pub posts: Vec<Post>,
}

// ── assembly ─────────────────────────────────────────────────────────────────

fn save(media: &MediaRedistributor, url: &str, extension: &str) -> Result<Media, MirageError> {
    media.publish(url, MEDIA_CATEGORY, Some(extension), Vec::new())
}

/// Last entry of a URL list; TikTok orders them by ascending quality.
fn last_url(value: &Value, pointer: &str) -> Result<String, MirageError> {
    value
        .pointer(pointer)
        .and_then(Value::as_array)
        .and_then(|urls| urls.last())
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| MirageError::Decode(format!("missing `{pointer}`")))
}

fn slideshow(
    media: &MediaRedistributor,
    item: &Value,
    images: &str,
    url_list: &str,
) -> Result<Vec<Media>, MirageError> {
    let Some(images) = item.pointer(images).and_then(Value::as_array) else {
        return Ok(Vec::new());
    };
    images
        .iter()
        .map(|image| save(media, &last_url(image, url_list)?, "jpg"))
        .collect()
}

/// Slideshow images, or the mirrored video when there are none.
fn post_media(
    media: &MediaRedistributor,
    id: &str,
    images: Vec<Media>,
) -> Result<(Option<Media>, Vec<Media>), MirageError> {
    if !images.is_empty() {
        return Ok((None, images));
    }
    let video = save(media, &format!("{VIDEO_MIRROR}/{id}.mp4"), "mp4")?;
    Ok((Some(video), images))
}

/// The `userInfo` mapping from a profile page's rehydration script.
fn rehydrated_user(html: &str) -> Option<Value> {
    static SELECTOR: OnceLock<Selector> = OnceLock::new();
    let selector = SELECTOR.get_or_init(|| {
        Selector::parse("script#__UNIVERSAL_DATA_FOR_REHYDRATION__")
            .expect("rehydration selector is valid")
    });

    let document = Html::parse_document(html);
    let script = document.select(selector).next()?;
    let blob: String = script.text().collect();
    let detail = locator::locate_in_value(Value::String(blob), USER_SIGNATURE)?;
    detail.get(USER_SIGNATURE).cloned()
}

fn event(raw: &Value) -> Option<Event> {
    let id = text(raw, "id")?;
    Some(Event {
        title: text(raw, "title").unwrap_or_default(),
        starts_at: timestamp(raw, "start_time").ok()?,
        url: format!("{ORIGIN}/live/event/{id}"),
        id,
    })
}

fn assemble_profile(media: &MediaRedistributor, user_info: &Value) -> Result<Profile, MirageError> {
    let user = user_info
        .get("user")
        .ok_or_else(|| MirageError::Decode("missing `user`".into()))?;
    let stats = user_info.get("stats").unwrap_or(&Value::Null);

    let username = require_text(user, "uniqueId")?;
    let link = user
        .pointer("/bioLink/link")
        .and_then(Value::as_str)
        .filter(|link| !link.is_empty())
        .map(|link| BioLink {
            url: link.to_string(),
            pretty_url: pretty_url(link),
        });
    let events = user
        .get("eventList")
        .and_then(Value::as_array)
        .map(|events| events.iter().filter_map(event).collect())
        .unwrap_or_default();

    Ok(Profile {
        id: require_text(user, "id")?,
        sec_uid: require_text(user, "secUid")?,
        nickname: text(user, "nickname").unwrap_or_default(),
        biography: text(user, "signature").unwrap_or_default(),
        avatar: save(media, &require_text(user, "avatarLarger")?, "jpg")?,
        is_verified: flag(user, "verified"),
        is_private: flag(user, "privateAccount"),
        live_id: text(user, "roomId").filter(|id| !id.is_empty()),
        link,
        events,
        statistics: UserStatistics {
            followers: count(stats, "/followerCount"),
            following: count(stats, "/followingCount"),
            likes: count(stats, "/heart"),
            videos: count(stats, "/videoCount"),
        },
        url: profile_url(&username),
        username,
    })
}

/// A post from the player API's `items` array.
fn player_post(media: &MediaRedistributor, item: &Value) -> Result<Post, MirageError> {
    let id = text_any(item, &["id_str", "id"])?;
    let info = item
        .get("author_info")
        .ok_or_else(|| MirageError::Decode("missing `author_info`".into()))?;
    let username = require_text(info, "unique_id")?;
    let author = Author {
        id: "0".to_string(),
        sec_uid: text(info, "secret_id"),
        full_name: text(info, "nickname").unwrap_or_default(),
        avatar: save(media, &last_url(info, "/avatar_url_list")?, "jpg")?,
        biography: None,
        url: profile_url(&username),
        username,
    };
    let statistics = PostStatistics {
        likes: count(item, "/statistics_info/digg_count"),
        comments: count(item, "/statistics_info/comment_count"),
        views: 0,
        shares: count(item, "/statistics_info/share_count"),
    };
    let images = slideshow(media, item, "/image_post_info/images", "/display_image/url_list")?;
    let (video, images) = post_media(media, &id, images)?;

    Ok(Post {
        url: format!("{}/video/{id}", author.url),
        caption: text(item, "desc").unwrap_or_else(|| "..".to_string()),
        created_at: timestamp(item, "create_time").ok(),
        id,
        author,
        statistics,
        video,
        images,
    })
}

/// A post from a creator item list.
fn listed_post(media: &MediaRedistributor, item: &Value) -> Result<Post, MirageError> {
    let id = require_text(item, "id")?;
    let raw_author = &item["author"];
    let username = require_text(raw_author, "uniqueId")?;
    let author = Author {
        id: require_text(raw_author, "id")?,
        sec_uid: text(raw_author, "secUid"),
        full_name: text(raw_author, "nickname").unwrap_or_default(),
        avatar: save(media, &require_text(raw_author, "avatarThumb")?, "jpg")?,
        biography: text(raw_author, "signature"),
        url: profile_url(&username),
        username,
    };
    let statistics = PostStatistics {
        likes: count(item, "/stats/diggCount"),
        comments: count(item, "/stats/commentCount"),
        views: count(item, "/stats/playCount"),
        shares: count(item, "/stats/shareCount"),
    };
    let images = slideshow(media, item, "/imagePost/images", "/imageURL/urlList")?;
    let (video, images) = post_media(media, &id, images)?;

    Ok(Post {
        url: format!("{}/video/{id}", author.url),
        caption: text(item, "desc").unwrap_or_else(|| "..".to_string()),
        created_at: timestamp(item, "createTime").ok(),
        id,
        author,
        statistics,
        video,
        images,
    })
}

fn is_complete_listing(item: &Value) -> bool {
    ["author", "stats", "video"]
        .iter()
        .all(|key| item.get(key).is_some())
}

fn fetch_error(e: reqwest::Error) -> MirageError {
    MirageError::Fetch(e.to_string())
}

// ── target ───────────────────────────────────────────────────────────────────

/// TikTok lookups over a shared HTTP client.
pub struct TikTok {
    client: reqwest::Client,
    media: Arc<MediaRedistributor>,
    config: TikTokConfig,
}

impl TikTok {
    pub fn new(media: Arc<MediaRedistributor>, config: TikTokConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .user_agent(DEFAULT_USER_AGENT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            media,
            config,
        }
    }

    /// Resolve a profile from its page.
    pub async fn profile(&self, username: &str) -> Result<Profile, MirageError> {
        let username = validate_username(username)?;
        let url = format!("{}/@{username}", self.config.origin);
        let html = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(fetch_error)?
            .text()
            .await
            .map_err(fetch_error)?;

        let user_info = rehydrated_user(&html)
            .ok_or_else(|| MirageError::Resolution(UNRESOLVED_USER.into()))?;
        assemble_profile(&self.media, &user_info).map_err(|e| {
            debug!("TikTok profile {username} did not assemble: {e}");
            MirageError::Resolution(UNRESOLVED_USER.into())
        })
    }

    /// Resolve a single post from a short or full link.
    pub async fn post(&self, url: &str) -> Result<Post, MirageError> {
        let url = url.trim();
        if !is_post_url(url) {
            return Err(MirageError::InvalidInput(NOT_A_POST.into()));
        }
        let resolved = if url.contains("video") || url.contains("photo") {
            url.to_string()
        } else {
            self.resolve_short_link(url).await?
        };
        let id = post_id(&resolved).ok_or_else(|| MirageError::InvalidInput(NOT_A_POST.into()))?;
        info!("fetching TikTok post {id}");

        let client = &self.client;
        let items_url = format!("{}/player/api/v1/items", self.config.origin);
        let (items_url, item_ids) = (items_url.as_str(), id.as_str());
        let data: Value = retry(self.config.attempts, self.config.retry_wait, move || async move {
            client
                .get(items_url)
                .query(&[("item_ids", item_ids)])
                .send()
                .await?
                .error_for_status()?
                .json::<Value>()
                .await
        })
        .await
        .map_err(|e| {
            debug!("TikTok post {id} lookup failed: {e}");
            MirageError::Resolution(UNRESOLVED_POST.into())
        })?;

        let item = data
            .pointer("/items/0")
            .ok_or_else(|| MirageError::Resolution(UNRESOLVED_POST.into()))?;
        player_post(&self.media, item).map_err(|e| {
            debug!("TikTok post {id} did not assemble: {e}");
            MirageError::Resolution(UNRESOLVED_POST.into())
        })
    }

    /// Follow a short link to the full post link it redirects to.
    async fn resolve_short_link(&self, url: &str) -> Result<String, MirageError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            debug!("short link {url} failed: {e}");
            MirageError::InvalidInput(NOT_A_POST.into())
        })?;
        if !response.status().is_success() {
            return Err(MirageError::InvalidInput(NOT_A_POST.into()));
        }
        Ok(response.url().to_string())
    }

    /// A user's latest posts.
    pub async fn posts(&self, username: &str) -> Result<PostList, MirageError> {
        let user = self.profile(username).await?;
        self.posts_for(user).await
    }

    /// Posts of an already resolved profile.
    pub async fn posts_for(&self, user: Profile) -> Result<PostList, MirageError> {
        self.listing(user, POSTS_PATH).await
    }

    /// A user's latest reposts.
    pub async fn reposts(&self, username: &str) -> Result<PostList, MirageError> {
        let user = self.profile(username).await?;
        self.reposts_for(user).await
    }

    /// Reposts of an already resolved profile.
    pub async fn reposts_for(&self, user: Profile) -> Result<PostList, MirageError> {
        self.listing(user, REPOSTS_PATH).await
    }

    async fn listing(&self, user: Profile, path: &str) -> Result<PostList, MirageError> {
        let url = format!("{}{path}", self.config.origin);
        let data: Value = self
            .client
            .get(&url)
            .query(&listing_query(&user.sec_uid))
            .send()
            .await
            .map_err(fetch_error)?
            .json()
            .await
            .map_err(fetch_error)?;

        let status = data.get("status_code").and_then(Value::as_i64);
        if status != Some(0) {
            debug!("{path} for {} answered status {status:?}", user.username);
            return Ok(PostList {
                user,
                posts: Vec::new(),
            });
        }

        let mut posts = Vec::new();
        for item in data
            .get("itemList")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter(|item| is_complete_listing(item))
        {
            match listed_post(&self.media, item) {
                Ok(post) => posts.push(post),
                Err(e) => debug!("skipping listed post: {e}"),
            }
        }
        Ok(PostList { user, posts })
    }
}
