//! Upsert/diff resolution: decide insert / update / no-op per lot.
//!
//! The fingerprint of the page kind just fetched is compared against the
//! stored slot of the same kind. A match refreshes only the matching
//! seen-at timestamp; a mismatch overwrites that page kind's fields and
//! fingerprint, leaving the other kind untouched, and publishes an event
//! before returning. Dry-run performs the same diffing with writes and
//! events suppressed.

use chrono::Utc;
use lotsync_core::event::{EventKind, LotChangePayload};
use lotsync_core::fingerprint::fingerprint;
use lotsync_core::model::{Auction, DetailFields, ListingFields, Lot, PageKind, ParsedLot};
use lotsync_storage::store::{LotStore, StorageError};
use thiserror::Error;
use tracing::{debug, warn};

use crate::events::EventBus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveAction {
    Inserted,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolveOutcome {
    pub action: ResolveAction,
    pub changed_fields: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("lot {lot_code} has no {kind} fields")]
    MissingFields { lot_code: String, kind: PageKind },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub struct UpsertResolver {
    store: LotStore,
    events: EventBus,
    dry_run: bool,
}

impl UpsertResolver {
    pub fn new(store: LotStore, events: EventBus, dry_run: bool) -> Self {
        Self {
            store,
            events,
            dry_run,
        }
    }

    /// Resolve one parsed lot against stored state for the given page kind.
    pub async fn resolve(
        &self,
        auction: &Auction,
        parsed: &ParsedLot,
        kind: PageKind,
    ) -> Result<ResolveOutcome, ResolveError> {
        let outcome = match kind {
            PageKind::Listing => {
                let fields = parsed.listing.as_ref().ok_or_else(|| {
                    ResolveError::MissingFields {
                        lot_code: parsed.lot_code.clone(),
                        kind,
                    }
                })?;
                self.resolve_listing(auction, &parsed.lot_code, fields).await?
            }
            PageKind::Detail => {
                let fields = parsed.detail.as_ref().ok_or_else(|| {
                    ResolveError::MissingFields {
                        lot_code: parsed.lot_code.clone(),
                        kind,
                    }
                })?;
                let outcome = self
                    .resolve_detail(auction, &parsed.lot_code, fields)
                    .await?;
                if !parsed.bids.is_empty() {
                    self.record_bids(auction, parsed).await?;
                }
                outcome
            }
        };
        Ok(outcome)
    }

    async fn resolve_listing(
        &self,
        auction: &Auction,
        lot_code: &str,
        fields: &ListingFields,
    ) -> Result<ResolveOutcome, ResolveError> {
        let hash = fingerprint(&fields.projection());
        let now = Utc::now();

        let Some(existing) = self.store.get_lot(auction.id, lot_code).await? else {
            if self.dry_run {
                return Ok(inserted());
            }
            return match self
                .store
                .insert_lot_listing(auction.id, lot_code, fields, &hash, now)
                .await
            {
                Ok(_) => {
                    self.publish_change(auction, lot_code, PageKind::Listing, vec![], &hash, true);
                    Ok(inserted())
                }
                Err(err) if err.is_constraint() => {
                    // Lost an insert race: the row exists now, retry once as
                    // an update. A second failure is fatal for this lot.
                    warn!(lot_code, "insert conflicted, retrying as update");
                    let lot = self.require_lot(auction.id, lot_code).await?;
                    self.apply_listing_update(auction, &lot, fields, &hash, now)
                        .await
                }
                Err(err) => Err(err.into()),
            };
        };

        if existing.listing_hash.as_deref() == Some(hash.as_str()) {
            debug!(lot_code, "listing unchanged");
            if !self.dry_run {
                self.store.touch_listing_seen(existing.id, now).await?;
            }
            return Ok(unchanged());
        }

        self.apply_listing_update(auction, &existing, fields, &hash, now)
            .await
    }

    async fn apply_listing_update(
        &self,
        auction: &Auction,
        lot: &Lot,
        fields: &ListingFields,
        hash: &str,
        now: chrono::DateTime<Utc>,
    ) -> Result<ResolveOutcome, ResolveError> {
        let changed = fields.changed_against(lot);
        if !self.dry_run {
            self.store
                .update_lot_listing(lot.id, fields, hash, now)
                .await?;
            self.publish_change(
                auction,
                &lot.lot_code,
                PageKind::Listing,
                changed.clone(),
                hash,
                false,
            );
        }
        Ok(ResolveOutcome {
            action: ResolveAction::Updated,
            changed_fields: changed,
        })
    }

    async fn resolve_detail(
        &self,
        auction: &Auction,
        lot_code: &str,
        fields: &DetailFields,
    ) -> Result<ResolveOutcome, ResolveError> {
        let hash = fingerprint(&fields.projection());
        let now = Utc::now();

        let Some(existing) = self.store.get_lot(auction.id, lot_code).await? else {
            if self.dry_run {
                return Ok(inserted());
            }
            return match self
                .store
                .insert_lot_detail(auction.id, lot_code, fields, &hash, now)
                .await
            {
                Ok(_) => {
                    self.publish_change(auction, lot_code, PageKind::Detail, vec![], &hash, true);
                    Ok(inserted())
                }
                Err(err) if err.is_constraint() => {
                    warn!(lot_code, "insert conflicted, retrying as update");
                    let lot = self.require_lot(auction.id, lot_code).await?;
                    self.apply_detail_update(auction, &lot, fields, &hash, now)
                        .await
                }
                Err(err) => Err(err.into()),
            };
        };

        if existing.detail_hash.as_deref() == Some(hash.as_str()) {
            debug!(lot_code, "detail unchanged");
            if !self.dry_run {
                self.store.touch_detail_seen(existing.id, now).await?;
            }
            return Ok(unchanged());
        }

        self.apply_detail_update(auction, &existing, fields, &hash, now)
            .await
    }

    async fn apply_detail_update(
        &self,
        auction: &Auction,
        lot: &Lot,
        fields: &DetailFields,
        hash: &str,
        now: chrono::DateTime<Utc>,
    ) -> Result<ResolveOutcome, ResolveError> {
        let changed = fields.changed_against(lot);
        if !self.dry_run {
            self.store
                .update_lot_detail(lot.id, fields, hash, now)
                .await?;
            self.publish_change(
                auction,
                &lot.lot_code,
                PageKind::Detail,
                changed.clone(),
                hash,
                false,
            );
        }
        Ok(ResolveOutcome {
            action: ResolveAction::Updated,
            changed_fields: changed,
        })
    }

    /// Insert bid tuples not already present; matching is by full-tuple
    /// equality because the source exposes no stable bid identifier. A tuple
    /// that matches except for a previously-null time gets the time
    /// backfilled.
    async fn record_bids(&self, auction: &Auction, parsed: &ParsedLot) -> Result<(), ResolveError> {
        if self.dry_run {
            return Ok(());
        }
        let Some(lot) = self.store.get_lot(auction.id, &parsed.lot_code).await? else {
            return Ok(());
        };

        let mut existing = self.store.list_bids(lot.id).await?;
        for bid in &parsed.bids {
            let full_match = existing.iter().any(|e| {
                e.bidder_label == bid.bidder_label
                    && e.amount == bid.amount
                    && e.bid_time == bid.bid_time
            });
            if full_match {
                continue;
            }

            if let Some(time) = bid.bid_time {
                // Same bid observed earlier without a timestamp.
                if let Some(open) = existing.iter_mut().find(|e| {
                    e.bidder_label == bid.bidder_label
                        && e.amount == bid.amount
                        && e.bid_time.is_none()
                }) {
                    self.store.set_bid_time(open.id, time).await?;
                    open.bid_time = Some(time);
                    continue;
                }
            }

            let id = self.store.insert_bid(lot.id, bid).await?;
            existing.push(lotsync_core::model::BidEntry {
                id,
                lot_id: lot.id,
                bidder_label: bid.bidder_label.clone(),
                amount: bid.amount,
                bid_time: bid.bid_time,
            });
        }
        Ok(())
    }

    async fn require_lot(&self, auction_id: i64, lot_code: &str) -> Result<Lot, ResolveError> {
        self.store
            .get_lot(auction_id, lot_code)
            .await?
            .ok_or_else(|| {
                ResolveError::Storage(StorageError::NotFound(format!(
                    "lot {lot_code} vanished during conflict retry"
                )))
            })
    }

    fn publish_change(
        &self,
        auction: &Auction,
        lot_code: &str,
        kind: PageKind,
        changed_fields: Vec<String>,
        hash: &str,
        created: bool,
    ) {
        let payload = LotChangePayload {
            auction_code: auction.code.clone(),
            lot_code: lot_code.to_string(),
            page_kind: kind,
            changed_fields,
            fingerprint: hash.to_string(),
        };
        let event_kind = if created {
            EventKind::LotCreated
        } else {
            EventKind::LotUpdated
        };
        self.events.publish(payload.into_envelope(event_kind));
    }
}

fn inserted() -> ResolveOutcome {
    ResolveOutcome {
        action: ResolveAction::Inserted,
        changed_fields: vec![],
    }
}

fn unchanged() -> ResolveOutcome {
    ResolveOutcome {
        action: ResolveAction::Unchanged,
        changed_fields: vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use lotsync_core::model::{ParsedAuction, ParsedBid};
    use lotsync_storage::migrate::apply_all;

    async fn harness(dry_run: bool) -> (LotStore, EventBus, UpsertResolver, Auction) {
        let store = LotStore::open_in_memory().await.unwrap();
        apply_all(store.pool()).await.unwrap();
        let auction = store
            .upsert_auction(&ParsedAuction {
                code: "A1-1000".into(),
                title: "Clearance".into(),
                url: "https://vendor.example/a1-1000".into(),
                starts_at: None,
                ends_at_planned: None,
            })
            .await
            .unwrap();
        let events = EventBus::default();
        let resolver = UpsertResolver::new(store.clone(), events.clone(), dry_run);
        (store, events, resolver, auction)
    }

    fn parsed_listing_lot(code: &str, bid: Option<f64>) -> ParsedLot {
        ParsedLot {
            lot_code: code.into(),
            listing: Some(ListingFields {
                title: format!("Lot {code}"),
                url: format!("https://vendor.example/a1-1000/{code}"),
                status: "open".into(),
                current_bid: bid,
                bid_count: bid.map_or(0, |_| 1),
                closes_at: None,
            }),
            detail: None,
            bids: vec![],
        }
    }

    fn parsed_detail_lot(code: &str, description: &str, bids: Vec<ParsedBid>) -> ParsedLot {
        ParsedLot {
            lot_code: code.into(),
            listing: None,
            detail: Some(DetailFields {
                description: Some(description.into()),
                location: Some("Hall B".into()),
                category: None,
                closes_at_planned: None,
            }),
            bids,
        }
    }

    #[tokio::test]
    async fn first_sight_inserts_and_fires_created_event() {
        let (store, events, resolver, auction) = harness(false).await;
        let mut rx = events.subscribe();

        let outcome = resolver
            .resolve(&auction, &parsed_listing_lot("L1", None), PageKind::Listing)
            .await
            .unwrap();
        assert_eq!(outcome.action, ResolveAction::Inserted);

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.kind, EventKind::LotCreated);
        let lot = store.get_lot(auction.id, "L1").await.unwrap().unwrap();
        assert!(lot.listing_hash.is_some());
    }

    #[tokio::test]
    async fn resolving_twice_converges_to_unchanged_with_one_row() {
        let (store, events, resolver, auction) = harness(false).await;
        let lot = parsed_listing_lot("L1", Some(50.0));

        let first = resolver
            .resolve(&auction, &lot, PageKind::Listing)
            .await
            .unwrap();
        assert_eq!(first.action, ResolveAction::Inserted);

        let second = resolver
            .resolve(&auction, &lot, PageKind::Listing)
            .await
            .unwrap();
        assert_eq!(second.action, ResolveAction::Unchanged);
        assert!(second.changed_fields.is_empty());

        let lots = store.list_lots(auction.id).await.unwrap();
        assert_eq!(lots.len(), 1);

        // Unchanged resolutions fire no event.
        let mut rx = events.subscribe();
        resolver
            .resolve(&auction, &lot, PageKind::Listing)
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unchanged_still_refreshes_seen_timestamp() {
        let (store, _events, resolver, auction) = harness(false).await;
        let lot = parsed_listing_lot("L1", Some(50.0));
        resolver
            .resolve(&auction, &lot, PageKind::Listing)
            .await
            .unwrap();
        let before = store
            .get_lot(auction.id, "L1")
            .await
            .unwrap()
            .unwrap()
            .last_seen_at
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        resolver
            .resolve(&auction, &lot, PageKind::Listing)
            .await
            .unwrap();
        let after = store.get_lot(auction.id, "L1").await.unwrap().unwrap();
        assert!(after.last_seen_at.unwrap() > before);
        assert_eq!(after.detail_last_seen_at, None);
    }

    #[tokio::test]
    async fn bid_change_updates_and_names_changed_fields() {
        let (store, events, resolver, auction) = harness(false).await;
        resolver
            .resolve(&auction, &parsed_listing_lot("L1", Some(50.0)), PageKind::Listing)
            .await
            .unwrap();

        let mut rx = events.subscribe();
        let outcome = resolver
            .resolve(&auction, &parsed_listing_lot("L1", Some(75.0)), PageKind::Listing)
            .await
            .unwrap();
        assert_eq!(outcome.action, ResolveAction::Updated);
        assert_eq!(outcome.changed_fields, vec!["current_bid".to_string()]);

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.kind, EventKind::LotUpdated);
        let payload: LotChangePayload = serde_json::from_value(envelope.payload).unwrap();
        assert_eq!(payload.changed_fields, vec!["current_bid".to_string()]);

        // The delivered fingerprint is the one stored for the lot: the write
        // happens before the event is published.
        let lot = store.get_lot(auction.id, "L1").await.unwrap().unwrap();
        assert_eq!(lot.listing_hash.as_deref(), Some(payload.fingerprint.as_str()));
    }

    #[tokio::test]
    async fn detail_resolution_keeps_listing_slot_independent() {
        let (store, _events, resolver, auction) = harness(false).await;
        resolver
            .resolve(&auction, &parsed_listing_lot("L1", Some(50.0)), PageKind::Listing)
            .await
            .unwrap();
        let listing_hash = store
            .get_lot(auction.id, "L1")
            .await
            .unwrap()
            .unwrap()
            .listing_hash;

        let outcome = resolver
            .resolve(
                &auction,
                &parsed_detail_lot("L1", "Diesel, 2011", vec![]),
                PageKind::Detail,
            )
            .await
            .unwrap();
        assert_eq!(outcome.action, ResolveAction::Updated);

        let lot = store.get_lot(auction.id, "L1").await.unwrap().unwrap();
        assert_eq!(lot.listing_hash, listing_hash);
        assert!(lot.detail_hash.is_some());
        assert_eq!(lot.description.as_deref(), Some("Diesel, 2011"));
    }

    #[tokio::test]
    async fn bid_tuples_deduplicate_and_backfill_times() {
        let (store, _events, resolver, auction) = harness(false).await;
        let t = Utc.with_ymd_and_hms(2026, 8, 29, 14, 0, 0).single().unwrap();

        let bids_v1 = vec![
            ParsedBid {
                bidder_label: "Bidder 2".into(),
                amount: 40.0,
                bid_time: None,
            },
            ParsedBid {
                bidder_label: "Bidder 7".into(),
                amount: 50.0,
                bid_time: Some(t),
            },
        ];
        resolver
            .resolve(
                &auction,
                &parsed_detail_lot("L1", "Desc", bids_v1),
                PageKind::Detail,
            )
            .await
            .unwrap();

        // Second observation: same tuples, one now carries its time, plus a
        // genuinely new bid.
        let bids_v2 = vec![
            ParsedBid {
                bidder_label: "Bidder 2".into(),
                amount: 40.0,
                bid_time: Some(t),
            },
            ParsedBid {
                bidder_label: "Bidder 7".into(),
                amount: 50.0,
                bid_time: Some(t),
            },
            ParsedBid {
                bidder_label: "Bidder 7".into(),
                amount: 60.0,
                bid_time: None,
            },
        ];
        resolver
            .resolve(
                &auction,
                &parsed_detail_lot("L1", "Desc", bids_v2),
                PageKind::Detail,
            )
            .await
            .unwrap();

        let lot = store.get_lot(auction.id, "L1").await.unwrap().unwrap();
        let bids = store.list_bids(lot.id).await.unwrap();
        assert_eq!(bids.len(), 3);
        assert!(bids
            .iter()
            .any(|b| b.bidder_label == "Bidder 2" && b.bid_time == Some(t)));
        assert!(bids
            .iter()
            .any(|b| b.bidder_label == "Bidder 7" && b.amount == 60.0 && b.bid_time.is_none()));
    }

    #[tokio::test]
    async fn bid_time_discovered_within_one_page_backfills_the_fresh_row() {
        let (store, _events, resolver, auction) = harness(false).await;
        let t = Utc.with_ymd_and_hms(2026, 8, 29, 14, 0, 0).single().unwrap();

        // One page carries the same tuple twice, first without its time.
        let bids = vec![
            ParsedBid {
                bidder_label: "Bidder 2".into(),
                amount: 40.0,
                bid_time: None,
            },
            ParsedBid {
                bidder_label: "Bidder 2".into(),
                amount: 40.0,
                bid_time: Some(t),
            },
        ];
        resolver
            .resolve(
                &auction,
                &parsed_detail_lot("L1", "Desc", bids),
                PageKind::Detail,
            )
            .await
            .unwrap();

        let lot = store.get_lot(auction.id, "L1").await.unwrap().unwrap();
        let stored = store.list_bids(lot.id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].bid_time, Some(t));
    }

    #[tokio::test]
    async fn dry_run_diffs_without_writing_or_publishing() {
        let (store, events, resolver, auction) = harness(true).await;
        let mut rx = events.subscribe();

        let outcome = resolver
            .resolve(&auction, &parsed_listing_lot("L1", Some(50.0)), PageKind::Listing)
            .await
            .unwrap();
        assert_eq!(outcome.action, ResolveAction::Inserted);

        assert!(store.get_lot(auction.id, "L1").await.unwrap().is_none());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn missing_fields_for_page_kind_is_an_error() {
        let (_store, _events, resolver, auction) = harness(false).await;
        let lot = ParsedLot {
            lot_code: "L1".into(),
            listing: None,
            detail: None,
            bids: vec![],
        };
        let err = resolver.resolve(&auction, &lot, PageKind::Listing).await;
        assert!(matches!(err, Err(ResolveError::MissingFields { .. })));
    }
}
