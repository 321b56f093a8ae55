//! Browser backend abstraction.
//!
//! Defines the `Backend` and `Session` traits that abstract over the
//! browser engine (Chromium via chromiumoxide in production, a scripted
//! in-memory engine in tests).

pub mod chromium;
pub mod scripted;

use anyhow::Result;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use chromium::ChromiumBackend;
pub use scripted::{ScriptedBackend, ScriptedPage};

/// A network response captured from a session.
#[derive(Debug, Clone)]
pub struct CapturedResponse {
    /// URL of the request that produced this response.
    pub url: String,
    /// HTTP status code.
    pub status: u16,
    /// Decoded response body.
    pub body: Vec<u8>,
}

impl CapturedResponse {
    /// Body as UTF-8 text, lossily decoded.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Decides which responses a tap captures.
pub type UrlFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// A live subscription to a session's network responses.
///
/// Responses arrive in completion order. Dropping the tap detaches every
/// listener behind it.
pub struct NetworkTap {
    rx: mpsc::Receiver<CapturedResponse>,
    pump: Option<JoinHandle<()>>,
}

impl NetworkTap {
    /// Wrap a receiver fed by a background pump task.
    pub fn new(rx: mpsc::Receiver<CapturedResponse>, pump: JoinHandle<()>) -> Self {
        Self {
            rx,
            pump: Some(pump),
        }
    }

    /// A tap whose sender is held by the caller rather than a task.
    pub fn detached(rx: mpsc::Receiver<CapturedResponse>) -> Self {
        Self { rx, pump: None }
    }

    /// Stop listening. Buffered responses are discarded.
    pub fn detach(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.rx.close();
    }
}

impl Stream for NetworkTap {
    type Item = CapturedResponse;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for NetworkTap {
    fn drop(&mut self) {
        self.detach();
    }
}

/// A browser engine that can open sessions (tabs).
#[async_trait]
pub trait Backend: Send + Sync {
    /// Open a new session sharing the backend's browsing context.
    async fn open_session(&self) -> Result<Box<dyn Session>>;
    /// Close the backend connection.
    async fn shutdown(&self) -> Result<()>;
    /// Human-readable engine name for logs.
    fn name(&self) -> &'static str;
}

/// A single controllable browser tab.
#[async_trait]
pub trait Session: Send + Sync {
    /// Navigate to `url`, optionally presenting a referer.
    async fn navigate(&mut self, url: &str, referer: Option<&str>) -> Result<()>;
    /// Serialized HTML of the rendered document.
    async fn content(&self) -> Result<String>;
    /// Document title.
    async fn title(&self) -> Result<String>;
    /// Current URL after redirects.
    async fn current_url(&self) -> Result<String>;
    /// Evaluate a JavaScript expression and return its JSON value.
    async fn evaluate(&self, expression: &str) -> Result<serde_json::Value>;
    /// Subscribe to responses whose URL passes `filter`.
    async fn tap(&self, filter: UrlFilter) -> Result<NetworkTap>;
    /// Cheap health probe; leaves the tab on a blank page.
    async fn reset(&mut self) -> Result<()>;
    /// Close this session.
    async fn close(self: Box<Self>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_detached_tap_yields_sent_responses() {
        let (tx, rx) = mpsc::channel(4);
        let mut tap = NetworkTap::detached(rx);
        tx.send(CapturedResponse {
            url: "https://example.com/api".into(),
            status: 200,
            body: b"{}".to_vec(),
        })
        .await
        .unwrap();

        let captured = tap.next().await.unwrap();
        assert_eq!(captured.url, "https://example.com/api");
        assert_eq!(captured.text(), "{}");
    }

    #[tokio::test]
    async fn test_detach_closes_channel() {
        let (tx, rx) = mpsc::channel(4);
        let mut tap = NetworkTap::detached(rx);
        tap.detach();
        assert!(tx.is_closed());
        assert!(tap.next().await.is_none());
    }
}
