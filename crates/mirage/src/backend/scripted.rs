//! Deterministic in-memory backend.
//!
//! Pages are scripted up front: HTML, title, redirect target, the value a
//! script evaluation returns, and network responses that fire after a delay
//! once navigation starts. Counters expose how the engine used the backend.

use super::{Backend, CapturedResponse, NetworkTap, Session, UrlFilter};
use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// A scripted network response.
#[derive(Debug, Clone)]
pub struct ScriptedResponse {
    pub delay: Duration,
    pub response: CapturedResponse,
}

/// Everything a scripted navigation produces.
#[derive(Debug, Clone, Default)]
pub struct ScriptedPage {
    pub html: String,
    pub title: String,
    /// URL reported after navigation; defaults to the requested URL.
    pub final_url: Option<String>,
    /// Value returned by `evaluate`.
    pub eval: Option<Value>,
    pub responses: Vec<ScriptedResponse>,
    pub navigation_delay: Duration,
    pub fail_navigation: bool,
}

impl ScriptedPage {
    pub fn html(html: impl Into<String>) -> Self {
        Self {
            html: html.into(),
            ..Default::default()
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_final_url(mut self, url: impl Into<String>) -> Self {
        self.final_url = Some(url.into());
        self
    }

    pub fn with_eval(mut self, value: Value) -> Self {
        self.eval = Some(value);
        self
    }

    pub fn with_response(mut self, url: impl Into<String>, body: impl Into<Vec<u8>>, delay: Duration) -> Self {
        self.responses.push(ScriptedResponse {
            delay,
            response: CapturedResponse {
                url: url.into(),
                status: 200,
                body: body.into(),
            },
        });
        self
    }

    pub fn with_navigation_delay(mut self, delay: Duration) -> Self {
        self.navigation_delay = delay;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail_navigation = true;
        self
    }
}

/// Usage counters.
#[derive(Debug, Default)]
pub struct ScriptedStats {
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub navigations: AtomicUsize,
    pub resets: AtomicUsize,
}

/// Scripted backend; cheap to clone, clones share pages and counters.
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    pages: Arc<RwLock<HashMap<String, ScriptedPage>>>,
    stats: Arc<ScriptedStats>,
    taps: Arc<Mutex<Vec<mpsc::Sender<CapturedResponse>>>>,
    navigations_by_url: Arc<Mutex<HashMap<String, usize>>>,
    fail_resets: Arc<AtomicBool>,
    fail_open: Arc<AtomicBool>,
    reset_delay: Arc<Mutex<Duration>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the page served for `url`.
    pub fn page(&self, url: impl Into<String>, page: ScriptedPage) -> &Self {
        self.pages.write().insert(url.into(), page);
        self
    }

    pub fn stats(&self) -> &ScriptedStats {
        &self.stats
    }

    /// Total navigations to `url`, excluding health probes.
    pub fn navigations_to(&self, url: &str) -> usize {
        self.navigations_by_url.lock().get(url).copied().unwrap_or(0)
    }

    /// Taps that are still attached.
    pub fn open_taps(&self) -> usize {
        let mut taps = self.taps.lock();
        taps.retain(|tx| !tx.is_closed());
        taps.len()
    }

    /// Make every health probe fail.
    pub fn fail_resets(&self, fail: bool) {
        self.fail_resets.store(fail, Ordering::SeqCst);
    }

    /// Make every health probe take `delay`.
    pub fn slow_resets(&self, delay: Duration) {
        *self.reset_delay.lock() = delay;
    }

    /// Make `open_session` fail.
    pub fn fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn open_session(&self) -> Result<Box<dyn Session>> {
        if self.fail_open.load(Ordering::SeqCst) {
            bail!("scripted backend refuses new sessions");
        }
        self.stats.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            backend: self.clone(),
            current: None,
            current_url: "about:blank".to_string(),
            taps: Mutex::new(Vec::new()),
        }))
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

struct ScriptedSession {
    backend: ScriptedBackend,
    current: Option<ScriptedPage>,
    current_url: String,
    taps: Mutex<Vec<(UrlFilter, mpsc::Sender<CapturedResponse>)>>,
}

#[async_trait]
impl Session for ScriptedSession {
    async fn navigate(&mut self, url: &str, _referer: Option<&str>) -> Result<()> {
        self.backend.stats.navigations.fetch_add(1, Ordering::SeqCst);
        *self
            .backend
            .navigations_by_url
            .lock()
            .entry(url.to_string())
            .or_default() += 1;

        let page = self.backend.pages.read().get(url).cloned();
        let Some(page) = page else {
            bail!("net::ERR_NAME_NOT_RESOLVED at {url}");
        };

        // Responses only reach taps registered before navigation started.
        {
            let mut taps = self.taps.lock();
            taps.retain(|(_, tx)| !tx.is_closed());
            for scripted in &page.responses {
                let receivers: Vec<_> = taps
                    .iter()
                    .filter(|(filter, _)| filter(&scripted.response.url))
                    .map(|(_, tx)| tx.clone())
                    .collect();
                if receivers.is_empty() {
                    continue;
                }
                let scripted = scripted.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(scripted.delay).await;
                    for tx in receivers {
                        let _ = tx.send(scripted.response.clone()).await;
                    }
                });
            }
        }

        if !page.navigation_delay.is_zero() {
            tokio::time::sleep(page.navigation_delay).await;
        }
        if page.fail_navigation {
            bail!("net::ERR_CONNECTION_RESET at {url}");
        }

        self.current_url = page.final_url.clone().unwrap_or_else(|| url.to_string());
        self.current = Some(page);
        Ok(())
    }

    async fn content(&self) -> Result<String> {
        Ok(self
            .current
            .as_ref()
            .map(|p| p.html.clone())
            .unwrap_or_default())
    }

    async fn title(&self) -> Result<String> {
        Ok(self
            .current
            .as_ref()
            .map(|p| p.title.clone())
            .unwrap_or_default())
    }

    async fn current_url(&self) -> Result<String> {
        Ok(self.current_url.clone())
    }

    async fn evaluate(&self, _expression: &str) -> Result<Value> {
        Ok(self
            .current
            .as_ref()
            .and_then(|p| p.eval.clone())
            .unwrap_or(Value::Null))
    }

    async fn tap(&self, filter: UrlFilter) -> Result<NetworkTap> {
        let (tx, rx) = mpsc::channel(16);
        self.backend.taps.lock().push(tx.clone());
        self.taps.lock().push((filter, tx));
        Ok(NetworkTap::detached(rx))
    }

    async fn reset(&mut self) -> Result<()> {
        let delay = *self.backend.reset_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.backend.stats.resets.fetch_add(1, Ordering::SeqCst);
        if self.backend.fail_resets.load(Ordering::SeqCst) {
            bail!("scripted health probe failure");
        }
        self.current = None;
        self.current_url = "about:blank".to_string();
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.backend.stats.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_taps_registered_before_navigation_receive_responses() {
        let backend = ScriptedBackend::new();
        backend.page(
            "https://site.test/a",
            ScriptedPage::html("<html></html>").with_response(
                "https://site.test/api",
                b"{\"ok\":true}".to_vec(),
                Duration::from_millis(5),
            ),
        );

        let mut session = backend.open_session().await.unwrap();
        let mut tap = session.tap(Arc::new(|url: &str| url.contains("/api"))).await.unwrap();
        session.navigate("https://site.test/a", None).await.unwrap();

        let captured = tap.next().await.unwrap();
        assert_eq!(captured.url, "https://site.test/api");
        assert_eq!(backend.navigations_to("https://site.test/a"), 1);
    }

    #[tokio::test]
    async fn test_late_tap_misses_responses() {
        let backend = ScriptedBackend::new();
        backend.page(
            "https://site.test/a",
            ScriptedPage::html("").with_response("https://site.test/api", b"{}".to_vec(), Duration::ZERO),
        );

        let mut session = backend.open_session().await.unwrap();
        session.navigate("https://site.test/a", None).await.unwrap();
        let mut tap = session.tap(Arc::new(|_: &str| true)).await.unwrap();

        let next = tokio::time::timeout(Duration::from_millis(50), tap.next()).await;
        assert!(next.is_err());
    }

    #[tokio::test]
    async fn test_unknown_url_and_failing_page() {
        let backend = ScriptedBackend::new();
        backend.page("https://site.test/down", ScriptedPage::html("").failing());
        let mut session = backend.open_session().await.unwrap();

        assert!(session.navigate("https://nowhere.test/", None).await.is_err());
        assert!(session.navigate("https://site.test/down", None).await.is_err());
        assert_eq!(backend.stats().navigations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dropped_tap_is_detached() {
        let backend = ScriptedBackend::new();
        let session = backend.open_session().await.unwrap();
        let tap = session.tap(Arc::new(|_: &str| true)).await.unwrap();
        assert_eq!(backend.open_taps(), 1);
        drop(tap);
        assert_eq!(backend.open_taps(), 0);
    }
}
