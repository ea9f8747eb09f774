//! Geocode backfill pipeline.
//!
//! One run fills in the location of every shop returned by
//! [`ShopStore::shop_missing_info`]:
//!
//! ```text
//! producer ──bounded──▶ N workers ──▶ collector ──▶ update_shop_info
//!                           │                         │
//!                           └──────── errors ◀────────┴── refresh_tags
//! ```
//!
//! Workers call the [`Geocoder`] under a per-call timeout. A failed lookup
//! is reported on the error stream and the worker moves on. The collector
//! writes everything it gathered in a single batch, then refreshes tags
//! if the backend supports it and flushes the query cache.
//!
//! A run can be cancelled. The producer stops, in-flight lookups are
//! dropped, and whatever was already collected is still written. Only one
//! run may be active per [`Enricher`]; a second start fails with
//! [`EnrichError::AlreadyRunning`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use shopfinder_core::models::Shop;
use shopfinder_core::store::ShopStore;
use shopfinder_core::StoreError;

use crate::cache::CachedStore;
use crate::config::EnrichConfig;
use crate::geocode::{GeocodeError, Geocoder};

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("failed to load shops missing info: {0}")]
    Fetch(#[source] StoreError),

    #[error("geocoding shop {shop_id} failed: {source}")]
    Geocode {
        shop_id: i64,
        #[source]
        source: GeocodeError,
    },

    #[error("failed to write enriched shops: {0}")]
    Write(#[source] StoreError),

    #[error("tag refresh failed: {0}")]
    TagRefresh(#[source] StoreError),

    #[error("an enrichment run is already in progress")]
    AlreadyRunning,

    #[error("{failed} of {total} shops could not be enriched")]
    PartialBatchFailure { failed: usize, total: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Cancelled,
}

/// Counts for one finished run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub candidates: usize,
    pub enriched: usize,
    pub failed: usize,
    pub written: u64,
    pub tagged: u64,
    pub cancelled: bool,
}

impl RunReport {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            finished_at: now,
            candidates: 0,
            enriched: 0,
            failed: 0,
            written: 0,
            tagged: 0,
            cancelled: false,
        }
    }

    /// `PartialBatchFailure` when any candidate was not enriched.
    pub fn check(&self) -> Result<(), EnrichError> {
        if self.failed > 0 {
            return Err(EnrichError::PartialBatchFailure {
                failed: self.failed,
                total: self.candidates,
            });
        }
        Ok(())
    }
}

/// Starts enrichment runs against one backend.
pub struct Enricher {
    store: Arc<dyn ShopStore>,
    geocoder: Arc<dyn Geocoder>,
    cache: Option<Arc<CachedStore>>,
    workers: usize,
    timeout: Duration,
    state: Arc<Mutex<RunState>>,
}

impl Enricher {
    pub fn new(store: Arc<dyn ShopStore>, geocoder: Arc<dyn Geocoder>, config: &EnrichConfig) -> Self {
        Self {
            store,
            geocoder,
            cache: None,
            workers: config.workers.max(1),
            timeout: Duration::from_secs(config.timeout_secs),
            state: Arc::new(Mutex::new(RunState::Idle)),
        }
    }

    /// Flush this cache after every successful write.
    pub fn with_cache(mut self, cache: Arc<CachedStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn state(&self) -> RunState {
        *self.state.lock()
    }

    /// Start a run in the background.
    pub fn start(&self) -> Result<EnrichRun, EnrichError> {
        {
            let mut state = self.state.lock();
            if *state == RunState::Running {
                return Err(EnrichError::AlreadyRunning);
            }
            *state = RunState::Running;
        }

        let (err_tx, err_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let run = Run {
            store: Arc::clone(&self.store),
            geocoder: Arc::clone(&self.geocoder),
            cache: self.cache.clone(),
            workers: self.workers,
            timeout: self.timeout,
            errors: err_tx,
            cancel: cancel_rx,
        };
        let state = Arc::clone(&self.state);
        let handle = tokio::spawn(async move {
            let _reset = ResetIfRunning(Arc::clone(&state));
            let mut report = run.execute().await;
            report.finished_at = Utc::now();
            *state.lock() = if report.cancelled {
                RunState::Cancelled
            } else {
                RunState::Completed
            };
            report
        });

        Ok(EnrichRun {
            errors: err_rx,
            cancel: cancel_tx,
            handle,
        })
    }
}

/// Puts the state back to `Idle` if the run task unwinds or is aborted
/// before it records an outcome.
struct ResetIfRunning(Arc<Mutex<RunState>>);

impl Drop for ResetIfRunning {
    fn drop(&mut self) {
        let mut state = self.0.lock();
        if *state == RunState::Running {
            *state = RunState::Idle;
        }
    }
}

/// Handle to a run in progress.
pub struct EnrichRun {
    errors: mpsc::UnboundedReceiver<EnrichError>,
    cancel: watch::Sender<bool>,
    handle: JoinHandle<RunReport>,
}

impl EnrichRun {
    /// Ask the run to stop. Results collected so far are still written.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Next error, or `None` once the run is over.
    pub async fn next_error(&mut self) -> Option<EnrichError> {
        self.errors.recv().await
    }

    /// Wait for the run to end, returning its report and every error not
    /// yet taken with [`next_error`](Self::next_error).
    pub async fn finish(mut self) -> anyhow::Result<(RunReport, Vec<EnrichError>)> {
        let mut errors = Vec::new();
        while let Some(e) = self.errors.recv().await {
            errors.push(e);
        }
        let report = self.handle.await?;
        Ok((report, errors))
    }
}

struct Run {
    store: Arc<dyn ShopStore>,
    geocoder: Arc<dyn Geocoder>,
    cache: Option<Arc<CachedStore>>,
    workers: usize,
    timeout: Duration,
    errors: mpsc::UnboundedSender<EnrichError>,
    cancel: watch::Receiver<bool>,
}

/// Resolves once the run is cancelled. Never resolves if the handle that
/// could cancel it was dropped.
async fn cancelled(mut cancel: watch::Receiver<bool>) {
    if cancel.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

impl Run {
    fn report_error(&self, err: EnrichError) {
        warn!(error = %err, "enrichment error");
        let _ = self.errors.send(err);
    }

    async fn execute(self) -> RunReport {
        let mut report = RunReport::new();

        let candidates = match self.store.shop_missing_info().await {
            Ok(c) => c,
            Err(e) => {
                self.report_error(EnrichError::Fetch(e));
                return report;
            }
        };
        report.candidates = candidates.len();
        info!(candidates = report.candidates, workers = self.workers, "enrichment run started");

        let (work_tx, work_rx) = mpsc::channel::<Shop>(self.workers);
        let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));
        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<Shop>();

        let cancel = self.cancel.clone();
        let producer = tokio::spawn(async move {
            for shop in candidates {
                tokio::select! {
                    biased;
                    _ = cancelled(cancel.clone()) => break,
                    sent = work_tx.send(shop) => if sent.is_err() { break },
                }
            }
        });

        let mut workers = JoinSet::new();
        for worker in 0..self.workers {
            let work_rx = Arc::clone(&work_rx);
            let results = result_tx.clone();
            let errors = self.errors.clone();
            let geocoder = Arc::clone(&self.geocoder);
            let cancel = self.cancel.clone();
            let timeout = self.timeout;

            workers.spawn(async move {
                let mut failed = 0usize;
                loop {
                    let next = tokio::select! {
                        biased;
                        _ = cancelled(cancel.clone()) => None,
                        shop = async { work_rx.lock().await.recv().await } => shop,
                    };
                    let Some(shop) = next else { break };

                    if shop.location.has_physical_location() {
                        let _ = results.send(shop);
                        continue;
                    }

                    let shop_id = shop.id;
                    let lookup = tokio::time::timeout(timeout, geocoder.fill_geocode(shop));
                    let outcome = tokio::select! {
                        biased;
                        _ = cancelled(cancel.clone()) => break,
                        outcome = lookup => outcome,
                    };

                    let err = match outcome {
                        Ok(Ok(found)) if found.location.has_physical_location() => {
                            debug!(worker, shop_id, "geocoded");
                            let _ = results.send(found);
                            continue;
                        }
                        Ok(Ok(_)) => GeocodeError::NoMatch("provider returned no location".into()),
                        Ok(Err(e)) => e,
                        Err(_) => GeocodeError::Timeout(timeout),
                    };
                    warn!(worker, shop_id, error = %err, "geocode failed");
                    failed += 1;
                    let _ = errors.send(EnrichError::Geocode { shop_id, source: err });
                }
                failed
            });
        }
        drop(result_tx);

        let mut enriched = Vec::new();
        while let Some(shop) = result_rx.recv().await {
            enriched.push(shop);
        }
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(failed) => report.failed += failed,
                Err(e) => warn!(error = %e, "enrichment worker panicked"),
            }
        }
        let _ = producer.await;

        report.cancelled = *self.cancel.borrow();
        report.enriched = enriched.len();
        if report.cancelled {
            info!(collected = enriched.len(), "enrichment cancelled, writing partial results");
        }

        if !enriched.is_empty() {
            match self.store.update_shop_info(&enriched).await {
                Ok(n) => report.written = n,
                Err(e) => {
                    self.report_error(EnrichError::Write(e));
                    return report;
                }
            }
        }

        if let Some(tags) = self.store.tag_maintenance() {
            match tags.refresh_tags().await {
                Ok(n) => report.tagged = n,
                Err(e) => self.report_error(EnrichError::TagRefresh(e)),
            }
        }

        if report.written > 0 || report.tagged > 0 {
            if let Some(cache) = &self.cache {
                cache.flush();
            }
        }

        info!(
            written = report.written,
            failed = report.failed,
            tagged = report.tagged,
            "enrichment run finished"
        );
        report
    }
}
