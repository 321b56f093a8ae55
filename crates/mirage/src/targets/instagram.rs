//! Instagram: profiles, stories, highlights and posts.
//!
//! Profiles race the GraphQL / `web_profile_info` responses against the
//! server-rendered profile document. Stories and highlights are read from
//! the reels payload embedded in the page (highlights also watch the reels
//! endpoints). Posts evaluate the embed page's `window.__additionalData`.

use super::{
    count, flag, pretty_url, referer, require_text, string_at, text, text_any, timestamp,
};
use crate::backend::CapturedResponse;
use crate::config::RaceConfig;
use crate::error::MirageError;
use crate::media::{Media, MediaRedistributor};
use crate::race::{
    AnyOf, DecodeError, DocumentProbe, Extraction, ExtractionOutcome, ExtractionRace, MarkerText,
    Observer, RacePlan, RedirectedTo, Signal,
};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

pub const ORIGIN: &str = "https://www.instagram.com";
/// Category prefix for redistributed media keys.
pub const MEDIA_CATEGORY: &str = "Instagram";

const GRAPHQL_QUERY: &str = "https://www.instagram.com/graphql/query";
const PROFILE_SIGNATURE: &str = "biography_with_entities";
const STORY_SIGNATURE: &str = "xdt_api__v1__feed__reels_media";
const HIGHLIGHT_SIGNATURE: &str = "xdt_api__v1__feed__reels_media__connection";
const POST_SIGNATURE: &str = "shortcode_media";

pub const UNRESOLVED_USER: &str = "The user provided couldn't be resolved.";
pub const NO_ACTIVE_STORY: &str = "The user provided doesn't have an active story.";
pub const UNRESOLVED_HIGHLIGHT: &str = "The highlight provided couldn't be resolved.";
pub const UNRESOLVED_POST: &str = "The URL provided couldn't be resolved.";

/// Time spent collecting the highlight tray after a profile resolves.
const PROFILE_LINGER: Duration = Duration::from_secs(1);

// ── input validation ─────────────────────────────────────────────────────────

/// Normalise a username: quotes and a leading `@` stripped, lower-cased.
pub fn validate_username(raw: &str) -> Result<String, MirageError> {
    let username = raw.replace("'b", "").replace('\'', "").to_lowercase();
    if username.chars().count() > 30 {
        return Err(MirageError::InvalidInput(
            "Usernames must be less than 30 characters".into(),
        ));
    }

    let username = username.strip_prefix('@').unwrap_or(&username).to_string();
    if username.is_empty() {
        return Err(MirageError::InvalidInput("Usernames cannot be empty".into()));
    }
    if username.ends_with('.') {
        return Err(MirageError::InvalidInput(
            "Usernames cannot end with periods".into(),
        ));
    }
    if let Some(c) = username
        .chars()
        .find(|c| !c.is_alphanumeric() && *c != '_' && *c != '.')
    {
        return Err(MirageError::InvalidInput(format!(
            "{c} is not allowed in Instagram usernames"
        )));
    }
    Ok(username)
}

fn post_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^<?(https?://(?:www\.)?instagram\.com(?:/[^/]+)?/(?:p|tv|reel|reels)/(?P<post_id>[^/?#&]+))>?",
        )
        .expect("post regex is valid")
    })
}

/// The post id (shortcode) of a post, reel or IGTV URL.
pub fn parse_post_url(url: &str) -> Option<String> {
    post_pattern()
        .captures(url.trim())
        .and_then(|caps| caps.name("post_id"))
        .map(|m| m.as_str().to_string())
}

/// Highlight ids may arrive as `highlight:<id>`.
pub fn normalize_highlight_id(raw: &str) -> String {
    raw.rsplit(':').next().unwrap_or(raw).to_string()
}

fn profile_url(username: &str) -> String {
    format!("{ORIGIN}/{username}/")
}

// ── observers ────────────────────────────────────────────────────────────────

/// Profile JSON from GraphQL or `web_profile_info`, plus the highlight tray.
pub struct ProfileObserver {
    username: String,
}

impl ProfileObserver {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into().to_lowercase(),
        }
    }
}

impl Observer for ProfileObserver {
    fn name(&self) -> &str {
        "profile"
    }

    fn matches(&self, url: &str) -> bool {
        url.starts_with(GRAPHQL_QUERY) || url.contains("web_profile_info")
    }

    fn decode(&self, response: &CapturedResponse) -> Result<Signal, DecodeError> {
        let body = response.text();
        if body.contains("friendship_status") && body.to_lowercase().contains(&self.username) {
            let value: Value = serde_json::from_str(&body)?;
            return value
                .pointer("/data/user")
                .cloned()
                .map(Signal::Payload)
                .ok_or_else(|| DecodeError("profile response without data.user".into()));
        }
        if body.contains("highlights") {
            let value: Value = serde_json::from_str(&body)?;
            let edges = value
                .pointer("/data/highlights/edges")
                .and_then(Value::as_array)
                .ok_or_else(|| DecodeError("highlight tray without edges".into()))?;
            let nodes: Vec<Value> = edges.iter().filter_map(|e| e.get("node").cloned()).collect();
            return Ok(Signal::Auxiliary(Value::Array(nodes)));
        }
        Ok(Signal::Ignore)
    }
}

/// Highlight reels from GraphQL or the reels tray endpoint.
pub struct ReelsObserver;

impl Observer for ReelsObserver {
    fn name(&self) -> &str {
        "reels"
    }

    fn matches(&self, url: &str) -> bool {
        url.starts_with(GRAPHQL_QUERY) || url.contains("feed/reels_media")
    }

    fn decode(&self, response: &CapturedResponse) -> Result<Signal, DecodeError> {
        let body = response.text();
        if body.contains(HIGHLIGHT_SIGNATURE) {
            let value: Value = serde_json::from_str(&body)?;
            let connection = value
                .get("data")
                .ok_or_else(|| DecodeError("reels response without data".into()))?;
            return Ok(Signal::Payload(connection.clone()));
        }
        if response.url.contains("feed/reels_media") && body.contains("reels_media") {
            return Ok(Signal::Payload(serde_json::from_str(&body)?));
        }
        Ok(Signal::Ignore)
    }
}

// ── plans ────────────────────────────────────────────────────────────────────

pub fn profile_plan(username: &str, config: &RaceConfig) -> RacePlan {
    RacePlan::new(
        format!("instagram:user:{username}"),
        profile_url(username),
        config.broad_deadline,
    )
    .observe(ProfileObserver::new(username))
    .probe(DocumentProbe::InlineData {
        signature: PROFILE_SIGNATURE.into(),
    })
    .error_page(MarkerText::in_body("may be broken", UNRESOLVED_USER))
    .settle_delay(config.settle_delay)
    .linger(PROFILE_LINGER)
    .reserved()
}

pub fn story_plan(username: &str, user_id: &str, config: &RaceConfig) -> RacePlan {
    RacePlan::new(
        format!("instagram:story:{user_id}"),
        format!("{ORIGIN}/stories/{username}/"),
        config.narrow_deadline,
    )
    .referer(profile_url(username))
    .probe(DocumentProbe::InlineData {
        signature: STORY_SIGNATURE.into(),
    })
    .error_page(AnyOf(vec![
        Arc::new(RedirectedTo::new(profile_url(username), NO_ACTIVE_STORY)),
        Arc::new(MarkerText::in_title("Page not found", UNRESOLVED_USER)),
    ]))
    .settle_delay(Duration::ZERO)
}

pub fn highlight_plan(highlight_id: &str, config: &RaceConfig) -> RacePlan {
    RacePlan::new(
        format!("instagram:highlight:{highlight_id}"),
        format!("{ORIGIN}/stories/highlights/{highlight_id}/"),
        config.narrow_deadline,
    )
    .observe(ReelsObserver)
    .probe(DocumentProbe::InlineData {
        signature: HIGHLIGHT_SIGNATURE.into(),
    })
    .settle_delay(config.settle_delay)
}

pub fn post_plan(post_id: &str, config: &RaceConfig) -> RacePlan {
    RacePlan::new(
        format!("instagram:post:{post_id}"),
        format!("{ORIGIN}/p/{post_id}/embed/captioned"),
        config.narrow_deadline,
    )
    .probe(DocumentProbe::Script {
        expression: "window.__additionalData".into(),
        signature: POST_SIGNATURE.into(),
    })
    .settle_delay(config.settle_delay)
}

// ── models ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimpleUser {
    pub id: String,
    pub username: String,
    pub full_name: Option<String>,
    pub avatar: Media,
    pub is_verified: bool,
    pub is_private: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserStatistics {
    pub posts: u64,
    pub followers: u64,
    pub following: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BioLink {
    pub url: String,
    pub link_id: Option<String>,
    pub lynx_url: Option<String>,
    pub title: Option<String>,
    /// Markdown link with a shortened label.
    pub pretty_url: String,
}

impl BioLink {
    fn from_raw(raw: &Value) -> Option<Self> {
        let url = text(raw, "url")?;
        let pretty_url = pretty_url(&url);
        Some(Self {
            link_id: text(raw, "link_id"),
            lynx_url: text(raw, "lynx_url"),
            title: text(raw, "title").filter(|t| !t.is_empty()),
            url,
            pretty_url,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub username: String,
    pub full_name: Option<String>,
    pub biography: Option<String>,
    pub avatar: Media,
    pub is_verified: bool,
    pub is_private: bool,
    pub statistics: UserStatistics,
    pub links: Vec<BioLink>,
    pub highlights: Vec<Highlight>,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Story {
    pub id: String,
    pub taken_at: DateTime<Utc>,
    pub media_type: u8,
    pub media: Media,
    pub url: String,
    pub is_video: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryFeed {
    pub user: Profile,
    pub stories: Vec<Story>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Highlight {
    pub id: String,
    pub title: String,
    pub cover: Media,
    /// Only present when the highlight itself was requested.
    pub user: Option<SimpleUser>,
    pub items: Vec<Story>,
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostStatistics {
    pub likes: u64,
    pub comments: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub shortcode: String,
    pub caption: Option<String>,
    pub taken_at: DateTime<Utc>,
    pub media: Vec<Media>,
    pub user: SimpleUser,
    pub statistics: PostStatistics,
    pub url: String,
}

// ── assembly ─────────────────────────────────────────────────────────────────

struct Assembler<'a> {
    media: &'a MediaRedistributor,
    referer: String,
}

impl Assembler<'_> {
    fn save(&self, url: &str, extension: &str) -> Result<Media, MirageError> {
        self.media
            .publish(url, MEDIA_CATEGORY, Some(extension), referer(&self.referer))
    }

    fn simple_user(&self, raw: &Value) -> Result<SimpleUser, MirageError> {
        Ok(SimpleUser {
            id: text_any(raw, &["pk", "id"])?,
            username: require_text(raw, "username")?,
            full_name: text(raw, "full_name"),
            avatar: self.save(&require_text(raw, "profile_pic_url")?, "jpg")?,
            is_verified: flag(raw, "is_verified"),
            is_private: flag(raw, "is_private"),
        })
    }

    fn profile(&self, raw: &Value, trays: &[Value]) -> Result<Profile, MirageError> {
        let avatar_url = raw
            .pointer("/hd_profile_pic_url_info/url")
            .and_then(Value::as_str)
            .map(str::to_string)
            .map_or_else(|| require_text(raw, "profile_pic_url"), Ok)?;
        let username = require_text(raw, "username")?;

        let statistics = UserStatistics {
            posts: first_count(raw, &["/media_count", "/edge_owner_to_timeline_media/count"]),
            followers: first_count(raw, &["/follower_count", "/edge_followed_by/count"]),
            following: first_count(raw, &["/following_count", "/edge_follow/count"]),
        };

        let links = raw
            .get("bio_links")
            .and_then(Value::as_array)
            .map(|links| links.iter().filter_map(BioLink::from_raw).collect())
            .unwrap_or_default();

        let mut highlights = Vec::new();
        for node in trays.iter().filter_map(Value::as_array).flatten() {
            match self.highlight_cover(node) {
                Ok(highlight) => highlights.push(highlight),
                Err(e) => tracing::debug!("skipping malformed highlight: {e}"),
            }
        }

        Ok(Profile {
            id: text_any(raw, &["pk", "id"])?,
            full_name: text(raw, "full_name"),
            biography: text(raw, "biography"),
            avatar: self.save(&avatar_url, "jpg")?,
            is_verified: flag(raw, "is_verified"),
            is_private: flag(raw, "is_private"),
            statistics,
            links,
            highlights,
            url: format!("{ORIGIN}/{username}"),
            username,
        })
    }

    /// A tray entry: id, title and cover only.
    fn highlight_cover(&self, node: &Value) -> Result<Highlight, MirageError> {
        let id = normalize_highlight_id(&require_text(node, "id")?);
        Ok(Highlight {
            title: require_text(node, "title")?,
            cover: self.save(&string_at(node, "/cover_media/cropped_image_version/url")?, "jpg")?,
            user: None,
            items: Vec::new(),
            url: format!("{ORIGIN}/stories/highlights/{id}"),
            id,
        })
    }

    fn story(&self, item: &Value, username: &str) -> Result<Story, MirageError> {
        let id = text_any(item, &["pk", "id"])?;
        let media_type = item
            .get("media_type")
            .and_then(Value::as_u64)
            .and_then(|raw| u8::try_from(raw).ok())
            .unwrap_or(1);
        let media = if let Ok(url) = string_at(item, "/video_versions/0/url") {
            self.save(&url, "mp4")?
        } else {
            self.save(&string_at(item, "/image_versions2/candidates/0/url")?, "jpg")?
        };
        Ok(Story {
            url: format!("{ORIGIN}/stories/{username}/{id}"),
            taken_at: timestamp(item, "taken_at")?,
            is_video: media_type == 2,
            media_type,
            media,
            id,
        })
    }

    fn stories(&self, reel: &Value, username: &str) -> Result<Vec<Story>, MirageError> {
        let mut stories = reel
            .get("items")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .map(|item| self.story(item, username))
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?
            .unwrap_or_default();
        stories.sort_by(|a, b| b.taken_at.cmp(&a.taken_at));
        Ok(stories)
    }

    fn highlight(&self, reel: &Value) -> Result<Highlight, MirageError> {
        let mut highlight = self.highlight_cover(reel)?;
        let owner = reel
            .get("user")
            .ok_or_else(|| MirageError::Decode("highlight without owner".into()))?;
        let user = self.simple_user(owner)?;
        highlight.items = self.stories(reel, &user.username)?;
        highlight.user = Some(user);
        Ok(highlight)
    }

    fn post(&self, raw: &Value) -> Result<Post, MirageError> {
        let shortcode = require_text(raw, "shortcode")?;
        let owner = raw
            .get("owner")
            .ok_or_else(|| MirageError::Decode("post without owner".into()))?;

        let nodes: Vec<&Value> = match raw.pointer("/edge_sidecar_to_children/edges") {
            Some(Value::Array(edges)) => edges.iter().filter_map(|e| e.get("node")).collect(),
            _ => vec![raw],
        };
        let media = nodes
            .into_iter()
            .map(|node| match text(node, "video_url") {
                Some(video) => self.save(&video, "mp4"),
                None => self.save(&require_text(node, "display_url")?, "jpg"),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Post {
            id: text_any(raw, &["id", "pk"])?,
            caption: raw
                .pointer("/edge_media_to_caption/edges/0/node/text")
                .and_then(Value::as_str)
                .map(str::to_string),
            taken_at: timestamp(raw, "taken_at_timestamp")?,
            media,
            user: self.simple_user(owner)?,
            statistics: PostStatistics {
                likes: first_count(raw, &["/edge_liked_by/count", "/edge_media_preview_like/count"]),
                comments: count(raw, "/edge_media_to_comment/count"),
            },
            url: format!("{ORIGIN}/p/{shortcode}"),
            shortcode,
        })
    }
}

fn first_count(raw: &Value, pointers: &[&str]) -> u64 {
    pointers
        .iter()
        .find_map(|p| raw.pointer(p).and_then(Value::as_u64))
        .unwrap_or(0)
}

/// Reels from either the GraphQL connection or the tray endpoint shape.
fn reels(payload: &Value) -> Vec<Value> {
    if let Some(reels) = payload.get("reels_media").and_then(Value::as_array) {
        return reels.clone();
    }
    payload
        .pointer(&format!("/{HIGHLIGHT_SIGNATURE}/edges"))
        .and_then(Value::as_array)
        .map(|edges| edges.iter().filter_map(|e| e.get("node").cloned()).collect())
        .unwrap_or_default()
}

/// Map an outcome to the caller-facing error. Predicate reasons listed in
/// `public` are kept; everything else becomes `default`.
fn settle(
    outcome: ExtractionOutcome,
    default: &str,
    public: &[&str],
) -> Result<Extraction, MirageError> {
    match outcome {
        ExtractionOutcome::Success(extraction) => Ok(extraction),
        ExtractionOutcome::Failure(reason) if public.contains(&reason.as_str()) => {
            Err(MirageError::Resolution(reason))
        }
        ExtractionOutcome::Failure(reason) => {
            tracing::debug!("reporting failure as unresolved: {reason}");
            Err(MirageError::Resolution(default.to_string()))
        }
        ExtractionOutcome::Timeout { .. } => Err(MirageError::Resolution(default.to_string())),
    }
}

/// Assembly problems surface as "could not be resolved" too.
fn unresolved(default: &'static str) -> impl Fn(MirageError) -> MirageError {
    move |e| match e {
        MirageError::Decode(detail) => {
            tracing::warn!("payload did not match the expected shape: {detail}");
            MirageError::Resolution(default.to_string())
        }
        other => other,
    }
}

// ── client ───────────────────────────────────────────────────────────────────

/// Instagram lookups over a shared race engine.
pub struct Instagram {
    race: Arc<ExtractionRace>,
    media: Arc<MediaRedistributor>,
    config: RaceConfig,
}

impl Instagram {
    pub fn new(race: Arc<ExtractionRace>, media: Arc<MediaRedistributor>, config: RaceConfig) -> Self {
        Self {
            race,
            media,
            config,
        }
    }

    fn assembler(&self, referer: String) -> Assembler<'_> {
        Assembler {
            media: &self.media,
            referer,
        }
    }

    pub async fn profile(&self, username: &str) -> Result<Profile, MirageError> {
        let username = validate_username(username)?;
        let outcome = self.race.run(profile_plan(&username, &self.config)).await?;
        let extraction = settle(outcome, UNRESOLVED_USER, &[UNRESOLVED_USER])?;
        self.assembler(profile_url(&username))
            .profile(&extraction.payload, &extraction.auxiliary)
            .map_err(unresolved(UNRESOLVED_USER))
    }

    pub async fn story(&self, username: &str) -> Result<StoryFeed, MirageError> {
        let profile = self.profile(username).await?;
        self.story_for(profile).await
    }

    /// Stories of an already resolved profile.
    pub async fn story_for(&self, profile: Profile) -> Result<StoryFeed, MirageError> {
        let plan = story_plan(&profile.username, &profile.id, &self.config);
        let outcome = self.race.run(plan).await?;
        let extraction = settle(outcome, NO_ACTIVE_STORY, &[NO_ACTIVE_STORY, UNRESOLVED_USER])?;

        let reel = extraction
            .payload
            .pointer(&format!("/{STORY_SIGNATURE}/reels_media/0"))
            .ok_or_else(|| MirageError::Resolution(NO_ACTIVE_STORY.into()))?;
        let stories = self
            .assembler(format!("{ORIGIN}/stories/{}/", profile.username))
            .stories(reel, &profile.username)
            .map_err(unresolved(NO_ACTIVE_STORY))?;
        Ok(StoryFeed {
            user: profile,
            stories,
        })
    }

    pub async fn highlight(&self, highlight_id: &str) -> Result<Highlight, MirageError> {
        let highlight_id = normalize_highlight_id(highlight_id);
        if highlight_id.is_empty() || !highlight_id.chars().all(|c| c.is_ascii_digit()) {
            return Err(MirageError::InvalidInput(UNRESOLVED_HIGHLIGHT.into()));
        }
        let outcome = self.race.run(highlight_plan(&highlight_id, &self.config)).await?;
        let extraction = settle(outcome, UNRESOLVED_HIGHLIGHT, &[])?;

        let reel = reels(&extraction.payload)
            .into_iter()
            .next()
            .ok_or_else(|| MirageError::Resolution(UNRESOLVED_HIGHLIGHT.into()))?;
        self.assembler(format!("{ORIGIN}/stories/highlights/{highlight_id}/"))
            .highlight(&reel)
            .map_err(unresolved(UNRESOLVED_HIGHLIGHT))
    }

    pub async fn post(&self, url: &str) -> Result<Post, MirageError> {
        let post_id =
            parse_post_url(url).ok_or_else(|| MirageError::InvalidInput(UNRESOLVED_POST.into()))?;
        let plan = post_plan(&post_id, &self.config);
        let embed_url = plan.url.clone();
        let outcome = self.race.run(plan).await?;
        let extraction = settle(outcome, UNRESOLVED_POST, &[])?;

        let media = extraction
            .payload
            .get(POST_SIGNATURE)
            .ok_or_else(|| MirageError::Resolution(UNRESOLVED_POST.into()))?;
        self.assembler(embed_url)
            .post(media)
            .map_err(unresolved(UNRESOLVED_POST))
    }
}
