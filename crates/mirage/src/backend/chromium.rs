//! Chromium backend using chromiumoxide.

use super::{Backend, CapturedResponse, NetworkTap, Session, UrlFilter};
use crate::config::{BrowserConfig, ConnectionTarget};
use crate::cookies::Cookie;
use crate::error::MirageError;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::Engine as _;
use chromiumoxide::browser::{Browser, BrowserConfig as LaunchConfig};
use chromiumoxide::cdp::browser_protocol::emulation::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::network::{
    CookieParam, EnableParams, EventLoadingFinished, EventResponseReceived,
    GetResponseBodyParams, RequestId, TimeSinceEpoch,
};
use chromiumoxide::cdp::browser_protocol::page::NavigateParams;
use chromiumoxide::page::Page;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Responses buffered per tap before the pump waits on the consumer.
const TAP_BUFFER: usize = 32;

/// Finished loads remembered while their response event is still in flight.
const EARLY_FINISHED: usize = 64;

/// Pairs `responseReceived` with `loadingFinished` in either order.
#[derive(Default)]
struct PendingBodies {
    /// request id -> (url, status) for responses that passed the filter
    responses: HashMap<String, (String, u16)>,
    early: VecDeque<String>,
}

impl PendingBodies {
    /// Record a filtered response. Returns it when its load already finished.
    fn on_response(&mut self, request_id: &str, url: String, status: u16) -> Option<(String, u16)> {
        if let Some(pos) = self.early.iter().position(|id| id == request_id) {
            self.early.remove(pos);
            return Some((url, status));
        }
        self.responses.insert(request_id.to_string(), (url, status));
        None
    }

    /// Record a finished load. Returns the response it completes, if known.
    fn on_finished(&mut self, request_id: &str) -> Option<(String, u16)> {
        if let Some(entry) = self.responses.remove(request_id) {
            return Some(entry);
        }
        if self.early.len() == EARLY_FINISHED {
            self.early.pop_front();
        }
        self.early.push_back(request_id.to_string());
        None
    }
}

async fn read_body(page: &Page, request_id: RequestId, url: String, status: u16) -> Option<CapturedResponse> {
    let body = match page.execute(GetResponseBodyParams::new(request_id)).await {
        Ok(body) => body.result,
        Err(e) => {
            debug!("body unavailable for {url}: {e}");
            return None;
        }
    };
    let bytes = if body.base64_encoded {
        base64::engine::general_purpose::STANDARD
            .decode(body.body.as_bytes())
            .unwrap_or_default()
    } else {
        body.body.into_bytes()
    };
    Some(CapturedResponse { url, status, body: bytes })
}

/// Find a Chromium executable on this host.
pub fn find_chromium() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("MIRAGE_CHROMIUM_PATH") {
        let path = PathBuf::from(&p);
        if path.exists() {
            return Some(path);
        }
    }

    if let Some(home) = dirs::home_dir() {
        let candidates = [
            home.join(".mirage/chromium/chrome-linux64/chrome"),
            home.join(".mirage/chromium/chrome"),
        ];
        for c in candidates {
            if c.exists() {
                return Some(c);
            }
        }
    }

    ["google-chrome", "chromium", "chromium-browser"]
        .iter()
        .find_map(|bin| which::which(bin).ok())
}

/// One-shot fix attempted when the first connection fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remediation {
    /// Browser binary is missing.
    InstallBrowser,
    /// Host is missing shared libraries.
    InstallDependencies,
}

impl Remediation {
    /// Map a connection failure message to a fix, if one applies.
    pub fn classify(message: &str) -> Option<Self> {
        let lower = message.to_ascii_lowercase();
        if lower.contains("executable doesn't exist")
            || lower.contains("executable not found")
            || lower.contains("could not auto detect a chrome executable")
        {
            Some(Remediation::InstallBrowser)
        } else if lower.contains("missing dependencies")
            || lower.contains("error while loading shared libraries")
        {
            Some(Remediation::InstallDependencies)
        } else {
            None
        }
    }

    fn command<'a>(&self, config: &'a BrowserConfig) -> &'a [String] {
        match self {
            Remediation::InstallBrowser => &config.install_command,
            Remediation::InstallDependencies => &config.install_deps_command,
        }
    }

    async fn run(&self, config: &BrowserConfig) {
        let Some((program, args)) = self.command(config).split_first() else {
            warn!("no command configured for {self:?}");
            return;
        };
        warn!("running {self:?}: {program} {}", args.join(" "));
        match tokio::process::Command::new(program).args(args).output().await {
            Ok(output) if output.status.success() => info!("{self:?} finished"),
            Ok(output) => warn!(
                "{self:?} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Err(e) => warn!("{self:?} could not be started: {e}"),
        }
    }
}

/// Chromium backend shared by every pooled session.
pub struct ChromiumBackend {
    browser: Mutex<Option<Browser>>,
    handler: parking_lot::Mutex<Option<JoinHandle<()>>>,
    user_agent: String,
    locale: String,
    active_count: Arc<AtomicUsize>,
}

impl ChromiumBackend {
    /// Connect once, attempting a single remediation and retry on failure.
    pub async fn connect(config: &BrowserConfig, cookies: &[Cookie]) -> Result<Self, MirageError> {
        info!("connecting to Chromium ({})", describe_target(&config.target));
        let first = match Self::try_connect(config).await {
            Ok(backend) => Ok(backend),
            Err(err) => {
                let message = format!("{err:#}");
                match Remediation::classify(&message) {
                    Some(remedy) => {
                        remedy.run(config).await;
                        Self::try_connect(config).await
                    }
                    None => Err(err),
                }
            }
        };
        let backend = first.map_err(|e| MirageError::Connection(format!("{e:#}")))?;

        backend
            .apply_cookies(cookies)
            .await
            .map_err(|e| MirageError::Connection(format!("{e:#}")))?;
        info!("connected to Chromium, {} cookies applied", cookies.len());
        Ok(backend)
    }

    async fn try_connect(config: &BrowserConfig) -> Result<Self> {
        let (browser, mut handler) = match &config.target {
            ConnectionTarget::Remote { .. } => {
                let ws_url = config
                    .target
                    .ws_url()
                    .context("invalid remote browser endpoint")?;
                Browser::connect(ws_url)
                    .await
                    .context("failed to connect to remote browser")?
            }
            ConnectionTarget::Local {
                executable,
                headless,
            } => {
                let path = executable
                    .clone()
                    .or_else(find_chromium)
                    .context("Chromium executable not found")?;
                let mut builder = LaunchConfig::builder()
                    .chrome_executable(path)
                    .arg("--disable-gpu")
                    .arg("--no-sandbox")
                    .arg("--disable-dev-shm-usage")
                    .arg("--disable-extensions")
                    .arg(format!("--lang={}", config.locale));
                builder = if *headless {
                    builder.arg("--headless=new")
                } else {
                    builder.with_head()
                };
                let launch = builder
                    .build()
                    .map_err(|e| anyhow!("failed to build browser config: {e}"))?;
                Browser::launch(launch)
                    .await
                    .context("failed to launch Chromium")?
            }
        };

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("browser handler error: {e}");
                }
            }
        });

        Ok(Self {
            browser: Mutex::new(Some(browser)),
            handler: parking_lot::Mutex::new(Some(handler_task)),
            user_agent: config.user_agent.clone(),
            locale: config.locale.clone(),
            active_count: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Apply the persisted cookie set to the shared browsing context.
    async fn apply_cookies(&self, cookies: &[Cookie]) -> Result<()> {
        if cookies.is_empty() {
            return Ok(());
        }
        let params = cookies
            .iter()
            .map(cookie_param)
            .collect::<Result<Vec<_>>>()?;

        let guard = self.browser.lock().await;
        let browser = guard.as_ref().context("browser already shut down")?;
        let page = browser
            .new_page("about:blank")
            .await
            .context("failed to open cookie bootstrap page")?;
        page.set_cookies(params)
            .await
            .context("failed to apply cookies")?;
        let _ = page.close().await;
        Ok(())
    }

    /// Number of open sessions.
    pub fn active_sessions(&self) -> usize {
        self.active_count.load(Ordering::Relaxed)
    }
}

fn describe_target(target: &ConnectionTarget) -> String {
    match target {
        ConnectionTarget::Remote { endpoint, .. } => format!("remote {endpoint}"),
        ConnectionTarget::Local { .. } => "local launch".to_string(),
    }
}

fn cookie_param(cookie: &Cookie) -> Result<CookieParam> {
    let mut builder = CookieParam::builder()
        .name(cookie.name.clone())
        .value(cookie.value.clone())
        .domain(cookie.domain.clone())
        .path(cookie.path.clone())
        .secure(cookie.secure)
        .http_only(cookie.http_only);
    if let Some(expires) = cookie.expires {
        builder = builder.expires(TimeSinceEpoch::new(expires as f64));
    }
    builder
        .build()
        .map_err(|e| anyhow!("invalid cookie {}: {e}", cookie.name))
}

#[async_trait]
impl Backend for ChromiumBackend {
    async fn open_session(&self) -> Result<Box<dyn Session>> {
        let page = {
            let guard = self.browser.lock().await;
            let browser = guard.as_ref().context("browser already shut down")?;
            browser
                .new_page("about:blank")
                .await
                .context("failed to create new page")?
        };

        let mut agent = SetUserAgentOverrideParams::new(self.user_agent.clone());
        agent.accept_language = Some(self.locale.clone());
        page.execute(agent)
            .await
            .context("failed to override user agent")?;
        page.execute(EnableParams::default())
            .await
            .context("failed to enable network domain")?;

        self.active_count.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(ChromiumSession {
            page,
            active_count: Arc::clone(&self.active_count),
        }))
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(mut browser) = self.browser.lock().await.take() {
            browser.close().await.context("failed to close browser")?;
            let _ = browser.wait().await;
        }
        if let Some(handler) = self.handler.lock().take() {
            handler.abort();
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "chromium"
    }
}

/// A single Chromium tab.
pub struct ChromiumSession {
    page: Page,
    active_count: Arc<AtomicUsize>,
}

#[async_trait]
impl Session for ChromiumSession {
    async fn navigate(&mut self, url: &str, referer: Option<&str>) -> Result<()> {
        let mut params = NavigateParams::new(url);
        params.referrer = referer.map(str::to_string);
        self.page
            .goto(params)
            .await
            .with_context(|| format!("navigation to {url} failed"))?;
        Ok(())
    }

    async fn content(&self) -> Result<String> {
        self.page.content().await.context("failed to read document")
    }

    async fn title(&self) -> Result<String> {
        let title = self
            .page
            .get_title()
            .await
            .context("failed to read title")?;
        Ok(title.unwrap_or_default())
    }

    async fn current_url(&self) -> Result<String> {
        let url = self
            .page
            .url()
            .await
            .context("failed to get URL")?
            .map(|u| u.to_string())
            .unwrap_or_default();
        Ok(url)
    }

    async fn evaluate(&self, expression: &str) -> Result<serde_json::Value> {
        let result = self
            .page
            .evaluate(expression)
            .await
            .context("JS execution failed")?;

        result
            .into_value()
            .map_err(|e| anyhow!("failed to convert JS result: {e:?}"))
    }

    async fn tap(&self, filter: UrlFilter) -> Result<NetworkTap> {
        let mut responses = self
            .page
            .event_listener::<EventResponseReceived>()
            .await
            .context("failed to listen for responses")?;
        let mut finished = self
            .page
            .event_listener::<EventLoadingFinished>()
            .await
            .context("failed to listen for finished loads")?;

        let page = self.page.clone();
        let (tx, rx) = mpsc::channel(TAP_BUFFER);
        let pump = tokio::spawn(async move {
            let mut pending = PendingBodies::default();
            loop {
                let ready = tokio::select! {
                    biased;
                    Some(event) = responses.next() => {
                        if !filter(&event.response.url) {
                            continue;
                        }
                        pending
                            .on_response(
                                event.request_id.inner(),
                                event.response.url.clone(),
                                event.response.status as u16,
                            )
                            .map(|entry| (event.request_id.clone(), entry))
                    }
                    Some(event) = finished.next() => pending
                        .on_finished(event.request_id.inner())
                        .map(|entry| (event.request_id.clone(), entry)),
                    else => break,
                };
                let Some((request_id, (url, status))) = ready else {
                    continue;
                };
                let Some(captured) = read_body(&page, request_id, url, status).await else {
                    continue;
                };
                if tx.send(captured).await.is_err() {
                    break;
                }
            }
        });

        Ok(NetworkTap::new(rx, pump))
    }

    async fn reset(&mut self) -> Result<()> {
        self.page
            .goto("about:blank")
            .await
            .context("health probe navigation failed")?;
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.active_count.fetch_sub(1, Ordering::Relaxed);
        let _ = self.page.close().await;
        Ok(())
    }
}
