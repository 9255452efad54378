//! One-shot sync passes: walk listing pages, resolve every lot, record the
//! run.
//!
//! A pass is resilient to per-page and per-lot failures: a page that cannot
//! be fetched or parsed is skipped and counted as an error, a lot that fails
//! to resolve likewise. Only storage failures on the run record itself abort
//! the pass. A run finishes `Completed` only when it reached the natural end
//! of pagination with zero errors; anything else is `Partial`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lotsync_core::event::{Envelope, EventKind};
use lotsync_core::model::{Auction, PageKind, ParsedAuction, RunCounters, SyncRunStatus};
use lotsync_storage::store::{LotStore, StorageError};
use serde_json::json;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::events::EventBus;
use crate::importer::{PageFetcher, PageImporter};
use crate::resolver::{ResolveAction, UpsertResolver};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Per-pass knobs. `max_pages` bounds the walk even if the source keeps
/// advertising more pages; `None` trusts pagination alone.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub auction_code: String,
    pub max_pages: Option<u64>,
    pub dry_run: bool,
    /// Follow up changed lots with a detail-page fetch.
    pub fetch_details: bool,
    pub page_delay: Duration,
}

impl SyncOptions {
    pub fn for_auction(auction_code: impl Into<String>) -> Self {
        Self {
            auction_code: auction_code.into(),
            max_pages: None,
            dry_run: false,
            fetch_details: false,
            page_delay: Duration::ZERO,
        }
    }
}

/// Outcome of one finished pass.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSummary {
    pub run_id: String,
    pub auction_code: String,
    pub status: SyncRunStatus,
    pub counters: RunCounters,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Hook consulted at every page boundary. Returning `false` from `proceed`
/// ends the pass early; the run is then finalized as `Partial`.
#[async_trait]
pub trait RunControl: Send + Sync {
    async fn proceed(&self) -> bool;

    /// Called after each processed (or skipped) page with the counters so
    /// far and the time of the last successful fetch.
    fn on_progress(&self, _counters: &RunCounters, _last_fetch_at: Option<DateTime<Utc>>) {}
}

struct Unattended;

#[async_trait]
impl RunControl for Unattended {
    async fn proceed(&self) -> bool {
        true
    }
}

pub struct SyncEngine {
    store: LotStore,
    fetcher: Arc<dyn PageFetcher>,
    importer: Arc<dyn PageImporter>,
    events: EventBus,
    base_url: String,
}

impl SyncEngine {
    pub fn new(
        store: LotStore,
        fetcher: Arc<dyn PageFetcher>,
        importer: Arc<dyn PageImporter>,
        events: EventBus,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            fetcher,
            importer,
            events,
            base_url: base_url.into(),
        }
    }

    pub fn store(&self) -> &LotStore {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Run one full pass with no external control.
    pub async fn run_once(&self, options: &SyncOptions) -> Result<SyncSummary, SyncError> {
        self.run_controlled(options, &Unattended).await
    }

    /// Run one pass, consulting `control` at each page boundary.
    pub async fn run_controlled(
        &self,
        options: &SyncOptions,
        control: &dyn RunControl,
    ) -> Result<SyncSummary, SyncError> {
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let span = info_span!("sync_run", run_id = %run_id, auction_code = %options.auction_code);

        async {
            // Dry runs leave an audit row too; only lot data and events are
            // suppressed.
            self.store
                .create_sync_run(
                    &run_id,
                    Some(&options.auction_code),
                    started_at,
                    options.max_pages.map(|p| p as i64),
                    options.dry_run,
                )
                .await?;

            let resolver =
                UpsertResolver::new(self.store.clone(), self.events.clone(), options.dry_run);
            let mut counters = RunCounters::default();

            let outcome = self
                .walk_pages(options, control, &resolver, &mut counters)
                .await;

            let finished_at = Utc::now();
            match outcome {
                Ok(cancelled) => {
                    let status = if cancelled || counters.error_count > 0 {
                        SyncRunStatus::Partial
                    } else {
                        SyncRunStatus::Completed
                    };
                    self.store
                        .finalize_sync_run(&run_id, status, &counters, finished_at)
                        .await?;

                    if !options.dry_run {
                        self.events.publish(Envelope::new(
                            EventKind::SyncRunFinished,
                            json!({
                                "run_id": run_id,
                                "auction_code": options.auction_code,
                                "status": status,
                                "counters": counters,
                            }),
                        ));
                    }
                    info!(%status, ?counters, "sync run finished");
                    Ok(SyncSummary {
                        run_id: run_id.clone(),
                        auction_code: options.auction_code.clone(),
                        status,
                        counters,
                        started_at,
                        finished_at,
                    })
                }
                Err(err) => {
                    // Best effort: the original failure is the one to report.
                    let _ = self
                        .store
                        .finalize_sync_run(&run_id, SyncRunStatus::Failed, &counters, finished_at)
                        .await;
                    warn!(error = %err, "sync run failed");
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Walk listing pages until pagination ends, the page cap is reached, or
    /// control withdraws. Returns whether the pass was cancelled.
    async fn walk_pages(
        &self,
        options: &SyncOptions,
        control: &dyn RunControl,
        resolver: &UpsertResolver,
        counters: &mut RunCounters,
    ) -> Result<bool, SyncError> {
        let mut auction: Option<Auction> = None;
        let mut last_fetch_at: Option<DateTime<Utc>> = None;
        let mut page = 1u64;

        loop {
            if let Some(max) = options.max_pages {
                if page > max {
                    return Ok(false);
                }
            }
            if !control.proceed().await {
                return Ok(true);
            }
            if page > 1 && !options.page_delay.is_zero() {
                tokio::time::sleep(options.page_delay).await;
            }

            let url = self.listing_page_url(&options.auction_code, page);
            let parsed = match self.fetch_page(&url, PageKind::Listing).await {
                Some(parsed) => parsed,
                None => {
                    counters.error_count += 1;
                    control.on_progress(counters, last_fetch_at);
                    if options.max_pages.is_some() {
                        // The cap bounds the walk, so keep probing the
                        // remaining page numbers.
                        page += 1;
                        continue;
                    }
                    // Without a cap, pagination state is lost with the page.
                    return Ok(false);
                }
            };
            counters.pages_scanned += 1;
            last_fetch_at = Some(Utc::now());

            let auction_row = match auction.clone() {
                Some(a) => a,
                None => {
                    let a = self.ensure_auction(parsed.auction.as_ref(), options).await?;
                    auction = Some(a.clone());
                    a
                }
            };

            let mut changed_lots = Vec::new();
            for lot in &parsed.lots {
                counters.lots_scanned += 1;
                match resolver.resolve(&auction_row, lot, PageKind::Listing).await {
                    Ok(outcome) => {
                        if outcome.action != ResolveAction::Unchanged {
                            counters.lots_updated += 1;
                            if options.fetch_details {
                                changed_lots.push(lot.lot_code.clone());
                            }
                        }
                    }
                    Err(err) => {
                        warn!(lot_code = %lot.lot_code, error = %err, "lot resolution failed");
                        counters.error_count += 1;
                    }
                }
            }

            for lot_code in changed_lots {
                self.sync_detail(&auction_row, &lot_code, resolver, counters)
                    .await;
            }
            control.on_progress(counters, last_fetch_at);

            if !parsed.has_more {
                return Ok(false);
            }
            page += 1;
        }
    }

    /// Fetch and resolve one lot's detail page. Failures are counted, never
    /// fatal.
    async fn sync_detail(
        &self,
        auction: &Auction,
        lot_code: &str,
        resolver: &UpsertResolver,
        counters: &mut RunCounters,
    ) {
        let url = self.detail_url(&auction.code, lot_code);
        let parsed = match self.fetch_page(&url, PageKind::Detail).await {
            Some(parsed) => parsed,
            None => {
                counters.error_count += 1;
                return;
            }
        };
        counters.pages_scanned += 1;

        for lot in &parsed.lots {
            match resolver.resolve(auction, lot, PageKind::Detail).await {
                Ok(_) => {}
                Err(err) => {
                    warn!(lot_code = %lot.lot_code, error = %err, "detail resolution failed");
                    counters.error_count += 1;
                }
            }
        }
    }

    /// Fetch and parse one page; `None` means the page is skipped (already
    /// logged) and the caller should count an error.
    async fn fetch_page(
        &self,
        url: &str,
        kind: PageKind,
    ) -> Option<lotsync_core::model::ParsedPage> {
        let raw = match self.fetcher.fetch(url).await {
            Ok(raw) => raw,
            Err(err) => {
                warn!(url, error = %err, "page fetch failed, skipping");
                return None;
            }
        };
        match self.importer.parse(&raw, kind) {
            Ok(parsed) => Some(parsed),
            Err(err) => {
                warn!(url, error = %err, "page import failed, skipping");
                None
            }
        }
    }

    /// Make sure the auction row exists, creating it from the page header
    /// (or a minimal stub) on first sight.
    async fn ensure_auction(
        &self,
        header: Option<&ParsedAuction>,
        options: &SyncOptions,
    ) -> Result<Auction, SyncError> {
        let existing = self.store.get_auction(&options.auction_code).await?;

        if options.dry_run {
            // No writes: diff against the stored row if there is one,
            // otherwise against a stand-in that matches nothing.
            return Ok(existing.unwrap_or_else(|| {
                let now = Utc::now();
                Auction {
                    id: 0,
                    code: options.auction_code.clone(),
                    title: header.map(|h| h.title.clone()).unwrap_or_default(),
                    url: header.map(|h| h.url.clone()).unwrap_or_default(),
                    starts_at: None,
                    ends_at_planned: None,
                    created_at: now,
                    updated_at: now,
                }
            }));
        }

        let is_new = existing.is_none();
        let parsed = match header {
            Some(h) => h.clone(),
            None => match existing {
                // No header on this page and the row exists already.
                Some(a) => return Ok(a),
                None => ParsedAuction {
                    code: options.auction_code.clone(),
                    title: String::new(),
                    url: String::new(),
                    starts_at: None,
                    ends_at_planned: None,
                },
            },
        };

        let auction = self.store.upsert_auction(&parsed).await?;
        if is_new {
            self.events.publish(Envelope::new(
                EventKind::AuctionCreated,
                json!({
                    "auction_code": auction.code,
                    "title": auction.title,
                }),
            ));
        }
        Ok(auction)
    }

    fn listing_page_url(&self, auction_code: &str, page: u64) -> String {
        format!(
            "{}/auctions/{}/lots?page={}",
            self.base_url, auction_code, page
        )
    }

    fn detail_url(&self, auction_code: &str, lot_code: &str) -> String {
        format!("{}/auctions/{}/lots/{}", self.base_url, auction_code, lot_code)
    }
}
