//! Extraction races.
//!
//! A race resolves one resource by letting several signal sources compete
//! for a single-assignment result cell under a deadline:
//!
//! - network observers, attached before navigation, decode matching
//!   responses as they complete;
//! - an error-page predicate checked right after navigation;
//! - a document probe that inspects the rendered page after a settle delay.
//!
//! The first writer wins. The deadline bounds the wait for that write; a
//! payload that lands in time is kept even if auxiliary collection runs
//! past it. When every source has finished without writing, the race fails
//! at once. Whatever happens, including cancellation of the caller,
//! listeners are detached and the session and resource lock are returned.

use crate::backend::{CapturedResponse, NetworkTap, Session, UrlFilter};
use crate::error::MirageError;
use crate::lock::LockRegistry;
use crate::locator;
use crate::pool::{PagePool, PooledSession};
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Failure reason when every signal source finished without a result.
pub const NO_SIGNAL: &str = "no signal matched";
use tokio::time::Instant;

// ── result cell ──────────────────────────────────────────────────────────────

/// A value container that accepts exactly one write.
pub struct ResultCell<T> {
    tx: parking_lot::Mutex<Option<oneshot::Sender<T>>>,
}

impl<T> ResultCell<T> {
    /// A cell and the receiver its single value is delivered to.
    pub fn new() -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: parking_lot::Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Store `value` if the cell is still empty. Returns whether this call
    /// was the one that filled it; later calls are no-ops.
    pub fn resolve(&self, value: T) -> bool {
        let Some(tx) = self.tx.lock().take() else {
            return false;
        };
        // A dropped receiver means nobody is waiting any more; the cell is
        // still considered filled.
        let _ = tx.send(value);
        true
    }

    pub fn is_resolved(&self) -> bool {
        self.tx.lock().is_none()
    }
}

// ── signals ──────────────────────────────────────────────────────────────────

/// What an observer made of a matching response.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    /// The payload the race is looking for.
    Payload(Value),
    /// Side data collected alongside the payload (e.g. a highlight tray).
    Auxiliary(Value),
    /// Matched the URL but carried nothing useful.
    Ignore,
}

/// A matched response body that could not be decoded. Never fatal.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct DecodeError(pub String);

impl From<serde_json::Error> for DecodeError {
    fn from(e: serde_json::Error) -> Self {
        DecodeError(e.to_string())
    }
}

impl From<DecodeError> for MirageError {
    fn from(e: DecodeError) -> Self {
        MirageError::Decode(e.0)
    }
}

/// Watches network responses for one URL pattern.
pub trait Observer: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;
    fn matches(&self, url: &str) -> bool;
    fn decode(&self, response: &CapturedResponse) -> Result<Signal, DecodeError>;
}

// ── error pages ──────────────────────────────────────────────────────────────

/// What the page looked like once navigation settled.
#[derive(Debug, Clone, Default)]
pub struct PageSnapshot {
    pub url: String,
    pub title: String,
    pub html: String,
}

impl PageSnapshot {
    async fn capture(session: &dyn Session) -> Self {
        Self {
            url: session.current_url().await.unwrap_or_default(),
            title: session.title().await.unwrap_or_default(),
            html: session.content().await.unwrap_or_default(),
        }
    }
}

/// Recognises a page that means "this resource does not resolve".
pub trait ErrorPagePredicate: Send + Sync {
    /// The failure reason, if `page` is an error page.
    fn check(&self, page: &PageSnapshot) -> Option<String>;
}

/// Where [`MarkerText`] looks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerScope {
    Title,
    Body,
}

/// A marker string appearing in the title or the document.
#[derive(Debug, Clone)]
pub struct MarkerText {
    pub marker: String,
    pub scope: MarkerScope,
    pub reason: String,
}

impl MarkerText {
    pub fn in_title(marker: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
            scope: MarkerScope::Title,
            reason: reason.into(),
        }
    }

    pub fn in_body(marker: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
            scope: MarkerScope::Body,
            reason: reason.into(),
        }
    }
}

impl ErrorPagePredicate for MarkerText {
    fn check(&self, page: &PageSnapshot) -> Option<String> {
        let haystack = match self.scope {
            MarkerScope::Title => &page.title,
            MarkerScope::Body => &page.html,
        };
        haystack.contains(&self.marker).then(|| self.reason.clone())
    }
}

/// Navigation ended somewhere under `prefix`.
#[derive(Debug, Clone)]
pub struct RedirectedTo {
    pub prefix: String,
    pub reason: String,
}

impl RedirectedTo {
    pub fn new(prefix: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            reason: reason.into(),
        }
    }
}

impl ErrorPagePredicate for RedirectedTo {
    fn check(&self, page: &PageSnapshot) -> Option<String> {
        page.url
            .starts_with(&self.prefix)
            .then(|| self.reason.clone())
    }
}

/// The first matching predicate wins.
pub struct AnyOf(pub Vec<Arc<dyn ErrorPagePredicate>>);

impl ErrorPagePredicate for AnyOf {
    fn check(&self, page: &PageSnapshot) -> Option<String> {
        self.0.iter().find_map(|predicate| predicate.check(page))
    }
}

// ── plans ────────────────────────────────────────────────────────────────────

/// How the rendered document is inspected.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentProbe {
    /// Network signals only.
    Disabled,
    /// Search the inline script blocks for a mapping holding `signature`.
    InlineData { signature: String },
    /// Evaluate `expression` and search its value for `signature`.
    Script {
        expression: String,
        signature: String,
    },
}

/// Everything one race needs to know.
#[derive(Clone)]
pub struct RacePlan {
    /// Resource key, `<category>:<kind>:<id>`.
    pub key: String,
    pub url: String,
    pub referer: Option<String>,
    pub observers: Vec<Arc<dyn Observer>>,
    pub probe: DocumentProbe,
    pub error_page: Option<Arc<dyn ErrorPagePredicate>>,
    pub settle_delay: Duration,
    pub deadline: Duration,
    /// Keep collecting auxiliary signals this long after the payload lands.
    pub linger: Duration,
    pub reserved: bool,
}

impl RacePlan {
    pub fn new(key: impl Into<String>, url: impl Into<String>, deadline: Duration) -> Self {
        Self {
            key: key.into(),
            url: url.into(),
            referer: None,
            observers: Vec::new(),
            probe: DocumentProbe::Disabled,
            error_page: None,
            settle_delay: Duration::from_millis(500),
            deadline,
            linger: Duration::ZERO,
            reserved: false,
        }
    }

    pub fn referer(mut self, referer: impl Into<String>) -> Self {
        self.referer = Some(referer.into());
        self
    }

    pub fn observe(mut self, observer: impl Observer + 'static) -> Self {
        self.observers.push(Arc::new(observer));
        self
    }

    pub fn probe(mut self, probe: DocumentProbe) -> Self {
        self.probe = probe;
        self
    }

    pub fn error_page(mut self, predicate: impl ErrorPagePredicate + 'static) -> Self {
        self.error_page = Some(Arc::new(predicate));
        self
    }

    pub fn settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn linger(mut self, linger: Duration) -> Self {
        self.linger = linger;
        self
    }

    pub fn reserved(mut self) -> Self {
        self.reserved = true;
        self
    }
}

// ── outcomes ─────────────────────────────────────────────────────────────────

/// Which signal source won.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalSource {
    Network,
    Document,
}

impl std::fmt::Display for SignalSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalSource::Network => write!(f, "network"),
            SignalSource::Document => write!(f, "document"),
        }
    }
}

/// A successful extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub payload: Value,
    pub auxiliary: Vec<Value>,
    pub source: SignalSource,
}

/// The single result of a race.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractionOutcome {
    Success(Extraction),
    Failure(String),
    Timeout { after: Duration },
}

impl ExtractionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExtractionOutcome::Success(_))
    }

    /// Failure and timeout both become "could not be resolved" errors.
    pub fn into_result(self) -> Result<Extraction, MirageError> {
        match self {
            ExtractionOutcome::Success(extraction) => Ok(extraction),
            ExtractionOutcome::Failure(reason) => Err(MirageError::Resolution(reason)),
            ExtractionOutcome::Timeout { after } => Err(MirageError::Timeout(after)),
        }
    }
}

enum Resolution {
    Payload(Value, SignalSource),
    Failure(String),
    /// The session itself misbehaved; it gets a health probe on release.
    Fault(String),
}

// ── race ─────────────────────────────────────────────────────────────────────

/// Runs plans against a shared pool, one race per resource key at a time.
pub struct ExtractionRace {
    pool: Arc<PagePool>,
    locks: LockRegistry<ExtractionOutcome>,
}

impl ExtractionRace {
    pub fn new(pool: Arc<PagePool>, max_locks: usize) -> Self {
        Self {
            pool,
            locks: LockRegistry::new(max_locks),
        }
    }

    pub fn pool(&self) -> &Arc<PagePool> {
        &self.pool
    }

    /// Resource keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.locks.len()
    }

    /// Resolve `plan`.
    ///
    /// Callers that queued on the same key while another race ran receive
    /// that race's outcome without a second navigation. Only pool admission
    /// errors are returned as `Err`; everything else is an outcome.
    pub async fn run(&self, plan: RacePlan) -> Result<ExtractionOutcome, MirageError> {
        let mut guard = self.locks.acquire(&plan.key).await;
        if let Some(outcome) = guard.shared() {
            tracing::debug!("{} served by the race that just finished", plan.key);
            return Ok(outcome);
        }

        let mut session = self.pool.checkout(plan.reserved).await?;
        let started = Instant::now();

        let (outcome, faulted) = contest(&mut session, &plan).await;

        if faulted {
            session.mark_faulted();
        }
        session.release().await;

        match &outcome {
            ExtractionOutcome::Success(extraction) => tracing::info!(
                "{} resolved via {} in {:?}",
                plan.key,
                extraction.source,
                started.elapsed()
            ),
            ExtractionOutcome::Failure(reason) => {
                tracing::warn!("{} could not be resolved: {reason}", plan.key)
            }
            ExtractionOutcome::Timeout { after } => {
                tracing::warn!("{} timed out after {after:?}", plan.key)
            }
        }

        guard.publish(outcome.clone());
        Ok(outcome)
    }
}

/// Race every signal source on `session`. Returns the outcome and whether
/// the session faulted.
async fn contest(session: &mut PooledSession, plan: &RacePlan) -> (ExtractionOutcome, bool) {
    // Listeners must exist before navigation starts.
    let mut tap = attach(session, &plan.observers).await;
    let (cell, mut rx) = ResultCell::<Resolution>::new();
    let auxiliary = parking_lot::Mutex::new(Vec::new());

    let network = observe(tap.as_mut(), &plan.observers, &cell, &auxiliary);
    let document = inspect(session, plan, &cell);
    let signals = async {
        tokio::join!(network, document);
        cell.resolve(Resolution::Failure(NO_SIGNAL.into()));
        std::future::pending::<Infallible>().await
    };

    let waited = tokio::time::timeout(plan.deadline, async {
        tokio::select! {
            resolution = &mut rx => resolution,
            never = signals => match never {},
        }
    })
    .await;

    let resolution = match waited {
        Ok(Ok(resolution)) => resolution,
        Ok(Err(_)) => return (ExtractionOutcome::Failure("result cell dropped".into()), false),
        Err(_) => return (ExtractionOutcome::Timeout { after: plan.deadline }, false),
    };

    match resolution {
        Resolution::Payload(payload, source) => {
            if let Some(tap) = tap.as_mut() {
                if !plan.linger.is_zero() {
                    let _ = tokio::time::timeout(
                        plan.linger,
                        collect_auxiliary(tap, &plan.observers, &auxiliary),
                    )
                    .await;
                }
            }
            let auxiliary = std::mem::take(&mut *auxiliary.lock());
            (
                ExtractionOutcome::Success(Extraction {
                    payload,
                    auxiliary,
                    source,
                }),
                false,
            )
        }
        Resolution::Failure(reason) => (ExtractionOutcome::Failure(reason), false),
        Resolution::Fault(reason) => (ExtractionOutcome::Failure(reason), true),
    }
}

async fn attach(session: &PooledSession, observers: &[Arc<dyn Observer>]) -> Option<NetworkTap> {
    if observers.is_empty() {
        return None;
    }
    let watched = observers.to_vec();
    let filter: UrlFilter = Arc::new(move |url: &str| watched.iter().any(|o| o.matches(url)));
    match session.tap(filter).await {
        Ok(tap) => Some(tap),
        Err(e) => {
            tracing::warn!("could not attach network observers: {e}");
            None
        }
    }
}

/// Apply observers to every captured response until the tap closes.
async fn observe(
    tap: Option<&mut NetworkTap>,
    observers: &[Arc<dyn Observer>],
    cell: &ResultCell<Resolution>,
    auxiliary: &parking_lot::Mutex<Vec<Value>>,
) {
    let Some(tap) = tap else {
        return;
    };
    while let Some(response) = tap.next().await {
        for observer in observers.iter().filter(|o| o.matches(&response.url)) {
            match observer.decode(&response) {
                Ok(Signal::Payload(payload)) => {
                    if cell.resolve(Resolution::Payload(payload, SignalSource::Network)) {
                        tracing::debug!("{} observer produced the payload", observer.name());
                    }
                }
                Ok(Signal::Auxiliary(value)) => auxiliary.lock().push(value),
                Ok(Signal::Ignore) => {}
                Err(e) => tracing::debug!("{} observer skipped {}: {e}", observer.name(), response.url),
            }
        }
    }
}

/// Drain auxiliary signals once the payload is known.
async fn collect_auxiliary(
    tap: &mut NetworkTap,
    observers: &[Arc<dyn Observer>],
    auxiliary: &parking_lot::Mutex<Vec<Value>>,
) {
    while let Some(response) = tap.next().await {
        for observer in observers.iter().filter(|o| o.matches(&response.url)) {
            if let Ok(Signal::Auxiliary(value)) = observer.decode(&response) {
                auxiliary.lock().push(value);
            }
        }
    }
}

/// Navigate, check for an error page, then probe the document.
async fn inspect(session: &mut PooledSession, plan: &RacePlan, cell: &ResultCell<Resolution>) {
    if let Err(e) = session.navigate(&plan.url, plan.referer.as_deref()).await {
        cell.resolve(Resolution::Fault(format!("navigation to {} failed: {e}", plan.url)));
        return;
    }

    if let Some(predicate) = &plan.error_page {
        let snapshot = PageSnapshot::capture(&**session).await;
        if let Some(reason) = predicate.check(&snapshot) {
            cell.resolve(Resolution::Failure(reason));
            return;
        }
    }

    let payload = match &plan.probe {
        DocumentProbe::Disabled => return,
        DocumentProbe::InlineData { signature } => {
            tokio::time::sleep(plan.settle_delay).await;
            match session.content().await {
                Ok(html) => locator::locate_in_html(&html, signature),
                Err(e) => {
                    tracing::debug!("document probe could not read {}: {e}", plan.url);
                    None
                }
            }
        }
        DocumentProbe::Script {
            expression,
            signature,
        } => {
            tokio::time::sleep(plan.settle_delay).await;
            match session.evaluate(expression).await {
                Ok(value) => locator::locate_in_value(value, signature),
                Err(e) => {
                    tracing::debug!("script probe failed on {}: {e}", plan.url);
                    None
                }
            }
        }
    };

    if let Some(payload) = payload {
        cell.resolve(Resolution::Payload(payload, SignalSource::Document));
    }
}
