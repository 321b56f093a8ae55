// Copyright 2026 Mirage Contributors
// SPDX-License-Identifier: Apache-2.0

//! Mirage, a browser-backed extraction engine.
//!
//! A bounded pool of browser sessions, per-resource locking, signal races
//! that resolve one outcome per request under a deadline, and lazy media
//! redistribution. [`Engine`] wires them together.

pub mod backend;
pub mod cache;
pub mod config;
pub mod cookies;
pub mod error;
pub mod locator;
pub mod lock;
pub mod media;
pub mod pool;
pub mod race;
pub mod targets;

pub use config::ServiceConfig;
pub use error::{MirageError, Result};
pub use media::{Media, MediaFetcher, MediaRedistributor, MediaReference};
pub use pool::{PagePool, PoolStats, PooledSession};
pub use race::{ExtractionOutcome, ExtractionRace, RacePlan};
pub use targets::instagram::Instagram;
pub use targets::tiktok::TikTok;

use backend::{Backend, ChromiumBackend};
use serde::Serialize;
use std::sync::Arc;

/// Snapshot reported by the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub pool: PoolStats,
    pub tracked_keys: usize,
    pub media_entries: usize,
}

/// The assembled engine: pool, race, media registry and site targets.
pub struct Engine {
    pub pool: Arc<PagePool>,
    pub race: Arc<ExtractionRace>,
    pub media: Arc<MediaRedistributor>,
    pub fetcher: MediaFetcher,
    pub instagram: Instagram,
    pub tiktok: TikTok,
}

impl Engine {
    /// Connect to the configured browser and open the pool.
    pub async fn start(config: &ServiceConfig) -> Result<Self> {
        let cookies = match &config.browser.cookies_path {
            Some(path) => cookies::load_cookie_file(path)
                .map_err(|e| MirageError::Connection(format!("cookie bootstrap failed: {e:#}")))?,
            None => Vec::new(),
        };
        let backend = ChromiumBackend::connect(&config.browser, &cookies).await?;
        Self::with_backend(Arc::new(backend), config).await
    }

    /// Build the engine on top of an already connected backend.
    pub async fn with_backend(backend: Arc<dyn Backend>, config: &ServiceConfig) -> Result<Self> {
        let pool = PagePool::initialize(backend, config.pool.clone()).await?;
        let race = Arc::new(ExtractionRace::new(Arc::clone(&pool), config.race.max_locks));
        let media = Arc::new(MediaRedistributor::new(
            config.base_url.clone(),
            config.media.max_entries,
        ));
        let instagram = Instagram::new(Arc::clone(&race), Arc::clone(&media), config.race.clone());
        let tiktok = TikTok::new(Arc::clone(&media), config.tiktok.clone());

        Ok(Self {
            pool,
            race,
            media,
            fetcher: MediaFetcher::new(config.media.fetch_timeout),
            instagram,
            tiktok,
        })
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            pool: self.pool.stats(),
            tracked_keys: self.race.tracked_keys(),
            media_entries: self.media.len(),
        }
    }

    /// Close every session and the backend connection.
    pub async fn shutdown(&self) -> Result<()> {
        self.pool.teardown().await
    }
}
