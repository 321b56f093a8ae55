//! Bounded pool of browser sessions.
//!
//! Sessions are opened once at start-up and handed out for exclusive use.
//! A checkout returns a [`PooledSession`] guard; the session goes back to
//! the idle set when the guard is released or dropped, on every exit path.
//! Reserved checkouts may draw from a dedicated lane so slow interactive
//! lookups cannot starve fast ones.

use crate::backend::{Backend, NetworkTap, Session, UrlFilter};
use crate::config::PoolConfig;
use crate::error::MirageError;
use anyhow::bail;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LaneKind {
    General,
    Reserved,
}

impl LaneKind {
    fn as_str(self) -> &'static str {
        match self {
            LaneKind::General => "general",
            LaneKind::Reserved => "reserved",
        }
    }
}

struct Lane {
    idle: Mutex<Vec<Box<dyn Session>>>,
    capacity: usize,
    waiters: AtomicUsize,
    notify: Notify,
}

impl Lane {
    fn new(sessions: Vec<Box<dyn Session>>) -> Self {
        Self {
            capacity: sessions.len(),
            idle: Mutex::new(sessions),
            waiters: AtomicUsize::new(0),
            notify: Notify::new(),
        }
    }
}

/// Decrements the lane's waiter count however the checkout ends.
struct WaitTicket<'a>(&'a AtomicUsize);

impl Drop for WaitTicket<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Occupancy snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub backend: &'static str,
    pub capacity: usize,
    pub idle: usize,
    pub reserved_capacity: usize,
    pub reserved_idle: usize,
    pub waiters: usize,
    pub closed: bool,
}

/// The session pool.
pub struct PagePool {
    backend: Arc<dyn Backend>,
    general: Lane,
    reserved: Option<Lane>,
    config: PoolConfig,
    closed: AtomicBool,
}

impl PagePool {
    /// Open every session up front.
    pub async fn initialize(
        backend: Arc<dyn Backend>,
        config: PoolConfig,
    ) -> Result<Arc<Self>, MirageError> {
        let capacity = config.capacity.max(1);
        let general = open_sessions(backend.as_ref(), capacity).await?;
        let reserved = if config.reserved_capacity > 0 {
            Some(Lane::new(
                open_sessions(backend.as_ref(), config.reserved_capacity).await?,
            ))
        } else {
            None
        };

        tracing::info!(
            "session pool ready: {} general + {} reserved on {}",
            capacity,
            config.reserved_capacity,
            backend.name()
        );

        Ok(Arc::new(Self {
            backend,
            general: Lane::new(general),
            reserved,
            config,
            closed: AtomicBool::new(false),
        }))
    }

    fn lane(&self, kind: LaneKind) -> &Lane {
        match (kind, &self.reserved) {
            (LaneKind::Reserved, Some(lane)) => lane,
            _ => &self.general,
        }
    }

    /// Wait for an idle session.
    ///
    /// Waiting polls at `poll_interval` and also wakes as soon as a session
    /// is returned. Once `max_waiters` callers are already queued on the
    /// lane the checkout is rejected with [`MirageError::PoolSaturated`].
    pub async fn checkout(self: &Arc<Self>, reserved: bool) -> Result<PooledSession, MirageError> {
        let kind = if reserved && self.reserved.is_some() {
            LaneKind::Reserved
        } else {
            LaneKind::General
        };
        let lane = self.lane(kind);

        if let Some(session) = self.take_idle(lane)? {
            return Ok(self.hand_out(kind, session));
        }

        let queued = lane.waiters.fetch_add(1, Ordering::SeqCst);
        let _ticket = WaitTicket(&lane.waiters);
        if queued >= self.config.max_waiters {
            tracing::warn!("{} lane saturated with {queued} waiters", kind.as_str());
            return Err(MirageError::PoolSaturated { waiters: queued });
        }

        loop {
            if let Some(session) = self.take_idle(lane)? {
                return Ok(self.hand_out(kind, session));
            }
            tokio::select! {
                _ = lane.notify.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    fn take_idle(&self, lane: &Lane) -> Result<Option<Box<dyn Session>>, MirageError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MirageError::PoolClosed);
        }
        Ok(lane.idle.lock().pop())
    }

    fn hand_out(self: &Arc<Self>, kind: LaneKind, session: Box<dyn Session>) -> PooledSession {
        let lane = self.lane(kind);
        tracing::info!(
            "checked out {} session ({}/{} idle)",
            kind.as_str(),
            lane.idle.lock().len(),
            lane.capacity
        );
        PooledSession {
            session,
            pool: Arc::clone(self),
            kind,
            faulted: false,
            returned: false,
        }
    }

    /// Return a session to its lane, probing it first when configured.
    async fn checkin(&self, kind: LaneKind, mut session: Box<dyn Session>, faulted: bool) {
        if self.closed.load(Ordering::SeqCst) {
            if let Err(e) = session.close().await {
                tracing::debug!("closing session after teardown failed: {e}");
            }
            return;
        }

        if self.config.health_probe || faulted {
            if let Err(e) = session.reset().await {
                tracing::warn!("session failed health probe: {e}");
                session = self.replace(session).await;
            }
        }

        self.push_idle(kind, session);
    }

    /// Swap a broken session for a fresh one; keep the old one if that fails.
    async fn replace(&self, broken: Box<dyn Session>) -> Box<dyn Session> {
        match self.backend.open_session().await {
            Ok(fresh) => {
                if let Err(e) = broken.close().await {
                    tracing::debug!("closing broken session failed: {e}");
                }
                tracing::info!("replaced unhealthy session");
                fresh
            }
            Err(e) => {
                tracing::warn!("could not replace unhealthy session, keeping it: {e}");
                broken
            }
        }
    }

    fn push_idle(&self, kind: LaneKind, session: Box<dyn Session>) {
        let lane = self.lane(kind);
        let idle = {
            let mut idle = lane.idle.lock();
            idle.push(session);
            idle.len()
        };
        lane.notify.notify_one();
        tracing::info!(
            "released {} session ({}/{} idle)",
            kind.as_str(),
            idle,
            lane.capacity
        );
    }

    /// Close every idle session and the backend. Safe to call repeatedly;
    /// sessions still checked out are closed when they come back.
    pub async fn teardown(&self) -> Result<(), MirageError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut sessions: Vec<Box<dyn Session>> = self.general.idle.lock().drain(..).collect();
        if let Some(lane) = &self.reserved {
            sessions.extend(lane.idle.lock().drain(..));
        }
        let count = sessions.len();
        for session in sessions {
            if let Err(e) = session.close().await {
                tracing::debug!("closing session during teardown failed: {e}");
            }
        }

        self.general.notify.notify_waiters();
        if let Some(lane) = &self.reserved {
            lane.notify.notify_waiters();
        }

        self.backend
            .shutdown()
            .await
            .map_err(|e| MirageError::Connection(format!("backend shutdown failed: {e}")))?;
        tracing::info!("session pool torn down ({count} idle sessions closed)");
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        let (reserved_capacity, reserved_idle) = match &self.reserved {
            Some(lane) => (lane.capacity, lane.idle.lock().len()),
            None => (0, 0),
        };
        PoolStats {
            backend: self.backend.name(),
            capacity: self.general.capacity,
            idle: self.general.idle.lock().len(),
            reserved_capacity,
            reserved_idle,
            waiters: self.general.waiters.load(Ordering::SeqCst)
                + self
                    .reserved
                    .as_ref()
                    .map_or(0, |lane| lane.waiters.load(Ordering::SeqCst)),
            closed: self.closed.load(Ordering::SeqCst),
        }
    }
}

async fn open_sessions(
    backend: &dyn Backend,
    count: usize,
) -> Result<Vec<Box<dyn Session>>, MirageError> {
    let mut sessions = Vec::with_capacity(count);
    for _ in 0..count {
        let session = backend
            .open_session()
            .await
            .map_err(|e| MirageError::Connection(format!("failed to open session: {e}")))?;
        sessions.push(session);
    }
    Ok(sessions)
}

/// Exclusive handle to a pooled session.
///
/// Dereferences to the session. Prefer [`PooledSession::release`] on normal
/// paths; dropping the guard returns the session from a background task.
pub struct PooledSession {
    session: Box<dyn Session>,
    pool: Arc<PagePool>,
    kind: LaneKind,
    faulted: bool,
    returned: bool,
}

impl PooledSession {
    /// Force a health probe when this session is returned.
    pub fn mark_faulted(&mut self) {
        self.faulted = true;
    }

    /// Return the session and wait until it is idle again.
    ///
    /// The check-in runs on its own task, so it completes even if the
    /// caller is cancelled while waiting on the health probe.
    pub async fn release(mut self) {
        self.returned = true;
        let session = std::mem::replace(&mut self.session, Box::new(Released));
        let pool = Arc::clone(&self.pool);
        let (kind, faulted) = (self.kind, self.faulted);
        let checkin = tokio::spawn(async move { pool.checkin(kind, session, faulted).await });
        if let Err(e) = checkin.await {
            tracing::warn!("session check-in task failed: {e}");
        }
    }
}

impl Deref for PooledSession {
    type Target = dyn Session;

    fn deref(&self) -> &Self::Target {
        &*self.session
    }
}

impl DerefMut for PooledSession {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.session
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if self.returned {
            return;
        }
        let session = std::mem::replace(&mut self.session, Box::new(Released));
        let pool = Arc::clone(&self.pool);
        let (kind, faulted) = (self.kind, self.faulted);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { pool.checkin(kind, session, faulted).await });
            }
            // No runtime to probe on; hand it back as is.
            Err(_) => pool.push_idle(kind, session),
        }
    }
}

/// Placeholder left in a guard once its session has gone back to the pool.
struct Released;

#[async_trait]
impl Session for Released {
    async fn navigate(&mut self, _url: &str, _referer: Option<&str>) -> anyhow::Result<()> {
        bail!("session already released")
    }
    async fn content(&self) -> anyhow::Result<String> {
        bail!("session already released")
    }
    async fn title(&self) -> anyhow::Result<String> {
        bail!("session already released")
    }
    async fn current_url(&self) -> anyhow::Result<String> {
        bail!("session already released")
    }
    async fn evaluate(&self, _expression: &str) -> anyhow::Result<serde_json::Value> {
        bail!("session already released")
    }
    async fn tap(&self, _filter: UrlFilter) -> anyhow::Result<NetworkTap> {
        bail!("session already released")
    }
    async fn reset(&mut self) -> anyhow::Result<()> {
        bail!("session already released")
    }
    async fn close(self: Box<Self>) -> anyhow::Result<()> {
        Ok(())
    }
}
