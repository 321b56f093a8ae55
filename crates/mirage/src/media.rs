//! Media redistribution.
//!
//! Remote media URLs (often signed and short-lived) are turned into stable
//! local references without touching the network. The bytes are fetched
//! only when a reference is resolved, using the headers recorded at
//! registration time.
//!
//! ## Keys
//!
//! `<category><hash><.ext>`: the FNV-1a hash of `filename` folded to 32
//! bits and rendered as 8 hex digits, where `filename` is the last
//! percent-decoded path segment of the source URL. The same category and
//! URL always produce the same key.

use crate::config::DEFAULT_USER_AGENT;
use crate::error::MirageError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::Hasher;
use std::time::{Duration, Instant};

/// Default number of registrations kept before LRU eviction.
pub const DEFAULT_MAX_ENTRIES: usize = 50_000;

/// A full registry drops this fraction of its capacity per eviction pass.
const EVICTION_DIVISOR: usize = 16;

/// A registered remote media item.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaReference {
    pub source_url: String,
    pub cache_key: String,
    /// Guessed from the extension; the fetch sniffs the real type.
    pub content_type: Option<String>,
    pub fetch_headers: Vec<(String, String)>,
}

/// A redistributed file as exposed to API consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Media {
    pub filename: String,
    pub url: String,
}

struct Entry {
    reference: MediaReference,
    last_accessed: Instant,
}

/// In-memory registry of redistributed media.
pub struct MediaRedistributor {
    base_url: String,
    entries: Mutex<HashMap<String, Entry>>,
    max_entries: usize,
}

impl MediaRedistributor {
    pub fn new(base_url: impl Into<String>, max_entries: usize) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            entries: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
        }
    }

    /// Record `source_url` under a stable key. No network I/O.
    ///
    /// An explicit `extension` overrides the one found in the URL.
    /// Registering the same URL again replaces the stored headers.
    pub fn register(
        &self,
        source_url: &str,
        category: &str,
        extension: Option<&str>,
        fetch_headers: Vec<(String, String)>,
    ) -> Result<MediaReference, MirageError> {
        let filename = derive_filename(source_url)?;
        let extension = match extension {
            Some(ext) => normalize_extension(&format!(".{}", ext.trim_start_matches('.'))),
            None => normalize_extension(extension_of(&filename)),
        };
        let cache_key = format!("{category}{}{extension}", hash_filename(&filename));

        let reference = MediaReference {
            source_url: source_url.to_string(),
            content_type: content_type_for_extension(&extension).map(str::to_string),
            cache_key: cache_key.clone(),
            fetch_headers,
        };

        let mut entries = self.entries.lock();
        if entries.len() >= self.max_entries && !entries.contains_key(&cache_key) {
            evict_lru(&mut entries, (self.max_entries / EVICTION_DIVISOR).max(1));
        }
        entries.insert(
            cache_key,
            Entry {
                reference: reference.clone(),
                last_accessed: Instant::now(),
            },
        );
        Ok(reference)
    }

    /// Look up a registration.
    pub fn resolve(&self, cache_key: &str) -> Result<MediaReference, MirageError> {
        let mut entries = self.entries.lock();
        match entries.get_mut(cache_key) {
            Some(entry) => {
                entry.last_accessed = Instant::now();
                Ok(entry.reference.clone())
            }
            None => Err(MirageError::NotFound(cache_key.to_string())),
        }
    }

    /// Public URL under which `cache_key` is served.
    pub fn reference_url(&self, cache_key: &str) -> String {
        format!("{}/media/{cache_key}", self.base_url)
    }

    /// Register and describe the result the way API responses embed it.
    pub fn publish(
        &self,
        source_url: &str,
        category: &str,
        extension: Option<&str>,
        fetch_headers: Vec<(String, String)>,
    ) -> Result<Media, MirageError> {
        let reference = self.register(source_url, category, extension, fetch_headers)?;
        Ok(Media {
            url: self.reference_url(&reference.cache_key),
            filename: reference.cache_key,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Drop the `count` least recently accessed registrations in one scan.
fn evict_lru(entries: &mut HashMap<String, Entry>, count: usize) {
    let mut by_age: Vec<(Instant, String)> = entries
        .iter()
        .map(|(key, entry)| (entry.last_accessed, key.clone()))
        .collect();
    let count = count.min(by_age.len());
    if count == 0 {
        return;
    }
    by_age.select_nth_unstable_by_key(count - 1, |(accessed, _)| *accessed);
    for (_, key) in by_age.into_iter().take(count) {
        entries.remove(&key);
    }
    tracing::debug!("evicted {count} media registrations");
}

/// Last path segment of the URL, percent-decoded.
fn derive_filename(source_url: &str) -> Result<String, MirageError> {
    let parsed = url::Url::parse(source_url)
        .map_err(|e| MirageError::InvalidInput(format!("invalid media URL {source_url}: {e}")))?;
    let segment = parsed
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or_default();
    let decoded = urlencoding::decode(segment)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| segment.to_string());
    Ok(decoded)
}

fn extension_of(filename: &str) -> &str {
    match filename.rfind('.') {
        Some(0) | None => "",
        Some(idx) => &filename[idx..],
    }
}

/// Lower-case and fold `heic`/`jpeg` into `jpg`. Keeps the leading dot.
pub fn normalize_extension(extension: &str) -> String {
    let lowered = extension.to_ascii_lowercase();
    match lowered.as_str() {
        ".jpeg" | ".heic" => ".jpg".to_string(),
        "." => String::new(),
        _ => lowered,
    }
}

fn hash_filename(filename: &str) -> String {
    let mut hasher = fnv::FnvHasher::default();
    hasher.write(filename.as_bytes());
    let hash = hasher.finish();
    format!("{:08x}", (hash ^ (hash >> 32)) as u32)
}

fn content_type_for_extension(extension: &str) -> Option<&'static str> {
    Some(match extension {
        ".jpg" => "image/jpeg",
        ".png" => "image/png",
        ".gif" => "image/gif",
        ".webp" => "image/webp",
        ".mp4" => "video/mp4",
        ".webm" => "video/webm",
        _ => return None,
    })
}

/// Content type from magic bytes.
pub fn sniff_content_type(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some("image/jpeg");
    }
    if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        return Some("image/png");
    }
    if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        return Some("image/gif");
    }
    if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return Some("image/webp");
    }
    if bytes.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        return Some("video/webm");
    }
    if bytes.len() >= 12 && &bytes[4..8] == b"ftyp" {
        return Some(match &bytes[8..12] {
            b"heic" | b"heix" | b"mif1" => "image/heic",
            _ => "video/mp4",
        });
    }
    None
}

/// Bytes fetched for a media reference.
#[derive(Debug, Clone)]
pub struct FetchedMedia {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// Performs the real upstream fetch for resolved references.
#[derive(Clone)]
pub struct MediaFetcher {
    client: reqwest::Client,
}

impl MediaFetcher {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .user_agent(DEFAULT_USER_AGENT)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    /// Fetch the bytes behind `reference`. Failures are reported verbatim
    /// and never retried.
    pub async fn fetch(&self, reference: &MediaReference) -> Result<FetchedMedia, MirageError> {
        let mut request = self.client.get(&reference.source_url);
        for (name, value) in &reference.fetch_headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| MirageError::Fetch(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(MirageError::Fetch(format!(
                "upstream returned {} for {}",
                status.as_u16(),
                reference.cache_key
            )));
        }

        let upstream_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .await
            .map_err(|e| MirageError::Fetch(e.to_string()))?
            .to_vec();

        let content_type = sniff_content_type(&bytes)
            .map(str::to_string)
            .or(upstream_type)
            .or_else(|| reference.content_type.clone())
            .unwrap_or_else(|| "application/octet-stream".to_string());

        tracing::debug!(
            "fetched {} ({} bytes, {content_type})",
            reference.cache_key,
            bytes.len()
        );
        Ok(FetchedMedia {
            bytes,
            content_type,
        })
    }
}

impl Default for MediaFetcher {
    fn default() -> Self {
        Self::new(Duration::from_secs(20))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn redistributor() -> MediaRedistributor {
        MediaRedistributor::new("http://127.0.0.1:1337/", DEFAULT_MAX_ENTRIES)
    }

    fn referer() -> Vec<(String, String)> {
        vec![("Referer".to_string(), "https://www.instagram.com/".to_string())]
    }

    #[test]
    fn test_register_is_deterministic() {
        let media = redistributor();
        let a = media
            .register("https://cdn.example/x/y/pic.JPEG?sig=1", "test", None, vec![])
            .unwrap();
        let b = media
            .register("https://cdn.example/x/y/pic.JPEG?sig=2", "test", None, vec![])
            .unwrap();
        assert_eq!(a.cache_key, b.cache_key);
        assert_eq!(media.len(), 1);
    }

    #[test]
    fn test_extension_is_normalized_and_resolves_unchanged() {
        let media = redistributor();
        let url = "https://cdn.example/x/y/pic.JPEG";
        let reference = media.register(url, "test", None, referer()).unwrap();
        assert!(reference.cache_key.starts_with("test"));
        assert!(reference.cache_key.ends_with(".jpg"));
        assert_eq!(reference.cache_key.len(), "test".len() + 8 + ".jpg".len());

        let resolved = media.resolve(&reference.cache_key).unwrap();
        assert_eq!(resolved.source_url, url);
        assert_eq!(resolved.fetch_headers, referer());
        assert_eq!(resolved.content_type.as_deref(), Some("image/jpeg"));
    }

    #[test]
    fn test_categories_do_not_collide() {
        let media = redistributor();
        let url = "https://cdn.example/a.mp4";
        let a = media.register(url, "Instagram", None, vec![]).unwrap();
        let b = media.register(url, "TikTok", None, vec![]).unwrap();
        assert_ne!(a.cache_key, b.cache_key);
        assert!(a.cache_key.ends_with(".mp4"));
    }

    #[test]
    fn test_explicit_extension_and_percent_decoding() {
        let media = redistributor();
        let a = media
            .register("https://cdn.example/v/clip%20one", "test", Some("mp4"), vec![])
            .unwrap();
        let b = media
            .register("https://cdn.example/w/clip one", "test", Some(".mp4"), vec![])
            .unwrap();
        assert_eq!(a.cache_key, b.cache_key);
        assert!(a.cache_key.ends_with(".mp4"));

        let heic = media
            .register("https://cdn.example/p/photo.heic", "test", None, vec![])
            .unwrap();
        assert!(heic.cache_key.ends_with(".jpg"));
    }

    #[test]
    fn test_resolve_unknown_key() {
        let err = redistributor().resolve("test00000000.jpg").unwrap_err();
        assert!(matches!(err, MirageError::NotFound(_)));
        assert_eq!(err.status_code(), 404);
    }

    #[test]
    fn test_invalid_url_rejected() {
        assert!(redistributor().register("not a url", "test", None, vec![]).is_err());
    }

    #[test]
    fn test_reference_url() {
        let media = redistributor();
        let published = media
            .publish("https://cdn.example/a.png", "test", None, vec![])
            .unwrap();
        assert!(published.url.starts_with("http://127.0.0.1:1337/media/test"));
        assert!(published.url.ends_with(&published.filename));
        assert!(published.filename.ends_with(".png"));
    }

    #[test]
    fn test_bounded_eviction() {
        let media = MediaRedistributor::new("http://localhost", 2);
        let first = media.register("https://cdn.example/1.jpg", "t", None, vec![]).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        let second = media.register("https://cdn.example/2.jpg", "t", None, vec![]).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        media.resolve(&first.cache_key).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        media.register("https://cdn.example/3.jpg", "t", None, vec![]).unwrap();

        assert_eq!(media.len(), 2);
        assert!(media.resolve(&first.cache_key).is_ok());
        assert!(media.resolve(&second.cache_key).is_err());
    }

    #[test]
    fn test_full_registry_evicts_in_batches() {
        let media = MediaRedistributor::new("http://localhost", 32);
        for i in 0..32 {
            media
                .register(&format!("https://cdn.example/{i}.jpg"), "t", None, vec![])
                .unwrap();
        }
        assert_eq!(media.len(), 32);

        media.register("https://cdn.example/a.jpg", "t", None, vec![]).unwrap();
        assert_eq!(media.len(), 31);
        media.register("https://cdn.example/b.jpg", "t", None, vec![]).unwrap();
        assert_eq!(media.len(), 32);
    }

    #[test]
    fn test_sniff_content_type() {
        assert_eq!(sniff_content_type(&[0xFF, 0xD8, 0xFF, 0xE0]), Some("image/jpeg"));
        assert_eq!(sniff_content_type(b"GIF89a...."), Some("image/gif"));
        assert_eq!(sniff_content_type(b"RIFF\0\0\0\0WEBPVP8 "), Some("image/webp"));
        assert_eq!(sniff_content_type(b"\0\0\0\x18ftypmp42"), Some("video/mp4"));
        assert_eq!(sniff_content_type(b"plain text"), None);
    }

    #[tokio::test]
    async fn test_fetch_forwards_headers_and_sniffs() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v/pic.jpg"))
            .and(header("Referer", "https://www.instagram.com/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0])
                    .insert_header("content-type", "application/octet-stream"),
            )
            .mount(&server)
            .await;

        let media = redistributor();
        let reference = media
            .register(&format!("{}/v/pic.jpg", server.uri()), "test", None, referer())
            .unwrap();
        let fetched = MediaFetcher::default().fetch(&reference).await.unwrap();
        assert_eq!(fetched.content_type, "image/png");
        assert_eq!(fetched.bytes.len(), 10);
    }

    #[tokio::test]
    async fn test_fetch_failure_passes_through() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let media = redistributor();
        let reference = media
            .register(&format!("{}/v/gone.mp4", server.uri()), "test", None, vec![])
            .unwrap();
        let err = MediaFetcher::default().fetch(&reference).await.unwrap_err();
        assert!(matches!(err, MirageError::Fetch(ref msg) if msg.contains("403")));
    }
}
