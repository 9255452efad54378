//! `LotStore`: typed accessors over the SQLite pool.
//!
//! All sync-core mutations flow through here. The pool is capped at one
//! connection, so a fingerprint comparison and the row write it guards are
//! never observed interleaved by another reader.

use std::path::Path;

use chrono::{DateTime, Utc};
use lotsync_core::model::{
    Auction, BidEntry, DetailFields, ListingFields, Lot, ParsedAuction, ParsedBid, RunCounters,
    SyncRunStatus,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("row not found: {0}")]
    NotFound(String),
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("database error: {0}")]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if db.is_unique_violation() {
                return Self::Constraint(db.message().to_string());
            }
        }
        Self::Database(err)
    }
}

impl StorageError {
    /// A concurrent insert of the same row is evidence the row now exists.
    pub fn is_constraint(&self) -> bool {
        matches!(self, Self::Constraint(_))
    }
}

/// One row of the sync run audit trail.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncRunRecord {
    pub run_id: String,
    pub auction_code: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: SyncRunStatus,
    pub counters: RunCounters,
    pub max_pages: Option<i64>,
    pub dry_run: bool,
}

#[derive(Clone)]
pub struct LotStore {
    pool: SqlitePool,
}

impl LotStore {
    /// Open (creating if missing) a store at the given filesystem path.
    pub async fn open_path(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Open an in-memory store (primarily for tests).
    pub async fn open_in_memory() -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // -- auctions ---------------------------------------------------------

    /// Insert the auction on first sight, otherwise overwrite its header
    /// fields. Sync never deletes auctions.
    pub async fn upsert_auction(&self, parsed: &ParsedAuction) -> Result<Auction, StorageError> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO auctions (code, title, url, starts_at, ends_at_planned, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT(code) DO UPDATE SET
                 title = excluded.title,
                 url = excluded.url,
                 starts_at = excluded.starts_at,
                 ends_at_planned = excluded.ends_at_planned,
                 updated_at = excluded.updated_at",
        )
        .bind(&parsed.code)
        .bind(&parsed.title)
        .bind(&parsed.url)
        .bind(parsed.starts_at)
        .bind(parsed.ends_at_planned)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_auction(&parsed.code)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("auction {}", parsed.code)))
    }

    pub async fn get_auction(&self, code: &str) -> Result<Option<Auction>, StorageError> {
        let row = sqlx::query("SELECT * FROM auctions WHERE code = ?1")
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| auction_from_row(&r)).transpose()
    }

    // -- lots -------------------------------------------------------------

    pub async fn get_lot(
        &self,
        auction_id: i64,
        lot_code: &str,
    ) -> Result<Option<Lot>, StorageError> {
        let row = sqlx::query("SELECT * FROM lots WHERE auction_id = ?1 AND lot_code = ?2")
            .bind(auction_id)
            .bind(lot_code)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| lot_from_row(&r)).transpose()
    }

    pub async fn list_lots(&self, auction_id: i64) -> Result<Vec<Lot>, StorageError> {
        let rows = sqlx::query("SELECT * FROM lots WHERE auction_id = ?1 ORDER BY lot_code")
            .bind(auction_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(lot_from_row).collect()
    }

    /// Insert a lot first seen on a listing page. A unique-constraint error
    /// here means a concurrent writer beat us to the insert.
    pub async fn insert_lot_listing(
        &self,
        auction_id: i64,
        lot_code: &str,
        fields: &ListingFields,
        hash: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<Lot, StorageError> {
        sqlx::query(
            "INSERT INTO lots (auction_id, lot_code, title, url, status, current_bid, bid_count,
                               closes_at, listing_hash, last_seen_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10, ?10)",
        )
        .bind(auction_id)
        .bind(lot_code)
        .bind(fields.title.trim())
        .bind(fields.url.trim())
        .bind(fields.status.trim())
        .bind(fields.current_bid)
        .bind(fields.bid_count)
        .bind(fields.closes_at)
        .bind(hash)
        .bind(seen_at)
        .execute(&self.pool)
        .await?;

        self.require_lot(auction_id, lot_code).await
    }

    /// Insert a lot first seen on a detail page.
    pub async fn insert_lot_detail(
        &self,
        auction_id: i64,
        lot_code: &str,
        fields: &DetailFields,
        hash: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<Lot, StorageError> {
        sqlx::query(
            "INSERT INTO lots (auction_id, lot_code, description, location, category,
                               closes_at_planned, detail_hash, detail_last_seen_at,
                               created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8, ?8)",
        )
        .bind(auction_id)
        .bind(lot_code)
        .bind(trimmed(fields.description.as_deref()))
        .bind(trimmed(fields.location.as_deref()))
        .bind(trimmed(fields.category.as_deref()))
        .bind(fields.closes_at_planned)
        .bind(hash)
        .bind(seen_at)
        .execute(&self.pool)
        .await?;

        self.require_lot(auction_id, lot_code).await
    }

    /// Overwrite a lot's listing-page fields and fingerprint, leaving
    /// detail-page fields untouched.
    pub async fn update_lot_listing(
        &self,
        lot_id: i64,
        fields: &ListingFields,
        hash: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "UPDATE lots SET title = ?2, url = ?3, status = ?4, current_bid = ?5,
                             bid_count = ?6, closes_at = ?7, listing_hash = ?8,
                             last_seen_at = ?9, updated_at = ?9
             WHERE id = ?1",
        )
        .bind(lot_id)
        .bind(fields.title.trim())
        .bind(fields.url.trim())
        .bind(fields.status.trim())
        .bind(fields.current_bid)
        .bind(fields.bid_count)
        .bind(fields.closes_at)
        .bind(hash)
        .bind(seen_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Overwrite a lot's detail-page fields and fingerprint, leaving
    /// listing-page fields untouched.
    pub async fn update_lot_detail(
        &self,
        lot_id: i64,
        fields: &DetailFields,
        hash: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "UPDATE lots SET description = ?2, location = ?3, category = ?4,
                             closes_at_planned = ?5, detail_hash = ?6,
                             detail_last_seen_at = ?7, updated_at = ?7
             WHERE id = ?1",
        )
        .bind(lot_id)
        .bind(trimmed(fields.description.as_deref()))
        .bind(trimmed(fields.location.as_deref()))
        .bind(trimmed(fields.category.as_deref()))
        .bind(fields.closes_at_planned)
        .bind(hash)
        .bind(seen_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Refresh `last_seen_at` only; no content write.
    pub async fn touch_listing_seen(
        &self,
        lot_id: i64,
        seen_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        sqlx::query("UPDATE lots SET last_seen_at = ?2 WHERE id = ?1")
            .bind(lot_id)
            .bind(seen_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Refresh `detail_last_seen_at` only; no content write.
    pub async fn touch_detail_seen(
        &self,
        lot_id: i64,
        seen_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        sqlx::query("UPDATE lots SET detail_last_seen_at = ?2 WHERE id = ?1")
            .bind(lot_id)
            .bind(seen_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn require_lot(&self, auction_id: i64, lot_code: &str) -> Result<Lot, StorageError> {
        self.get_lot(auction_id, lot_code).await?.ok_or_else(|| {
            StorageError::NotFound(format!("lot {lot_code} in auction {auction_id}"))
        })
    }

    // -- bid history ------------------------------------------------------

    pub async fn list_bids(&self, lot_id: i64) -> Result<Vec<BidEntry>, StorageError> {
        let rows = sqlx::query(
            "SELECT id, lot_id, bidder_label, amount, bid_time FROM bid_history
             WHERE lot_id = ?1 ORDER BY id",
        )
        .bind(lot_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(BidEntry {
                id: row.try_get("id").map_err(StorageError::Database)?,
                lot_id: row.try_get("lot_id").map_err(StorageError::Database)?,
                bidder_label: row.try_get("bidder_label").map_err(StorageError::Database)?,
                amount: row.try_get("amount").map_err(StorageError::Database)?,
                bid_time: row.try_get("bid_time").map_err(StorageError::Database)?,
            });
        }
        Ok(out)
    }

    /// Returns the rowid of the inserted entry so callers can backfill a
    /// time discovered later in the same pass.
    pub async fn insert_bid(&self, lot_id: i64, bid: &ParsedBid) -> Result<i64, StorageError> {
        let result = sqlx::query(
            "INSERT INTO bid_history (lot_id, bidder_label, amount, bid_time)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(lot_id)
        .bind(&bid.bidder_label)
        .bind(bid.amount)
        .bind(bid.bid_time)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Attach a newly discovered time to a bid that had none. The only
    /// mutation bid history permits.
    pub async fn set_bid_time(
        &self,
        bid_id: i64,
        bid_time: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        sqlx::query("UPDATE bid_history SET bid_time = ?2 WHERE id = ?1 AND bid_time IS NULL")
            .bind(bid_id)
            .bind(bid_time)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // -- sync runs --------------------------------------------------------

    pub async fn create_sync_run(
        &self,
        run_id: &str,
        auction_code: Option<&str>,
        started_at: DateTime<Utc>,
        max_pages: Option<i64>,
        dry_run: bool,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO sync_runs (run_id, auction_code, started_at, status, max_pages, dry_run)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(run_id)
        .bind(auction_code)
        .bind(started_at)
        .bind(SyncRunStatus::Running.as_str())
        .bind(max_pages)
        .bind(dry_run)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Finalize a run exactly once; the owning engine invocation is the only
    /// writer.
    pub async fn finalize_sync_run(
        &self,
        run_id: &str,
        status: SyncRunStatus,
        counters: &RunCounters,
        finished_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "UPDATE sync_runs SET status = ?2, finished_at = ?3, pages_scanned = ?4,
                                  lots_scanned = ?5, lots_updated = ?6, error_count = ?7
             WHERE run_id = ?1 AND finished_at IS NULL",
        )
        .bind(run_id)
        .bind(status.as_str())
        .bind(finished_at)
        .bind(counters.pages_scanned as i64)
        .bind(counters.lots_scanned as i64)
        .bind(counters.lots_updated as i64)
        .bind(counters.error_count as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_sync_run(&self, run_id: &str) -> Result<Option<SyncRunRecord>, StorageError> {
        let row = sqlx::query("SELECT * FROM sync_runs WHERE run_id = ?1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| sync_run_from_row(&r)).transpose()
    }

    pub async fn list_sync_runs(&self, limit: i64) -> Result<Vec<SyncRunRecord>, StorageError> {
        let rows = sqlx::query("SELECT * FROM sync_runs ORDER BY started_at DESC LIMIT ?1")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(sync_run_from_row).collect()
    }
}

fn trimmed(value: Option<&str>) -> Option<String> {
    value.map(|s| s.trim().to_string())
}

fn auction_from_row(row: &SqliteRow) -> Result<Auction, StorageError> {
    Ok(Auction {
        id: row.try_get("id").map_err(StorageError::Database)?,
        code: row.try_get("code").map_err(StorageError::Database)?,
        title: row.try_get("title").map_err(StorageError::Database)?,
        url: row.try_get("url").map_err(StorageError::Database)?,
        starts_at: row.try_get("starts_at").map_err(StorageError::Database)?,
        ends_at_planned: row
            .try_get("ends_at_planned")
            .map_err(StorageError::Database)?,
        created_at: row.try_get("created_at").map_err(StorageError::Database)?,
        updated_at: row.try_get("updated_at").map_err(StorageError::Database)?,
    })
}

fn lot_from_row(row: &SqliteRow) -> Result<Lot, StorageError> {
    Ok(Lot {
        id: row.try_get("id").map_err(StorageError::Database)?,
        auction_id: row.try_get("auction_id").map_err(StorageError::Database)?,
        lot_code: row.try_get("lot_code").map_err(StorageError::Database)?,
        title: row.try_get("title").map_err(StorageError::Database)?,
        url: row.try_get("url").map_err(StorageError::Database)?,
        status: row.try_get("status").map_err(StorageError::Database)?,
        current_bid: row.try_get("current_bid").map_err(StorageError::Database)?,
        bid_count: row.try_get("bid_count").map_err(StorageError::Database)?,
        closes_at: row.try_get("closes_at").map_err(StorageError::Database)?,
        description: row.try_get("description").map_err(StorageError::Database)?,
        location: row.try_get("location").map_err(StorageError::Database)?,
        category: row.try_get("category").map_err(StorageError::Database)?,
        closes_at_planned: row
            .try_get("closes_at_planned")
            .map_err(StorageError::Database)?,
        listing_hash: row.try_get("listing_hash").map_err(StorageError::Database)?,
        detail_hash: row.try_get("detail_hash").map_err(StorageError::Database)?,
        last_seen_at: row.try_get("last_seen_at").map_err(StorageError::Database)?,
        detail_last_seen_at: row
            .try_get("detail_last_seen_at")
            .map_err(StorageError::Database)?,
        created_at: row.try_get("created_at").map_err(StorageError::Database)?,
        updated_at: row.try_get("updated_at").map_err(StorageError::Database)?,
    })
}

fn sync_run_from_row(row: &SqliteRow) -> Result<SyncRunRecord, StorageError> {
    let status: String = row.try_get("status").map_err(StorageError::Database)?;
    let status = SyncRunStatus::parse(&status)
        .ok_or_else(|| StorageError::NotFound(format!("unknown sync run status {status}")))?;
    Ok(SyncRunRecord {
        run_id: row.try_get("run_id").map_err(StorageError::Database)?,
        auction_code: row.try_get("auction_code").map_err(StorageError::Database)?,
        started_at: row.try_get("started_at").map_err(StorageError::Database)?,
        finished_at: row.try_get("finished_at").map_err(StorageError::Database)?,
        status,
        counters: RunCounters {
            pages_scanned: row
                .try_get::<i64, _>("pages_scanned")
                .map_err(StorageError::Database)? as u64,
            lots_scanned: row
                .try_get::<i64, _>("lots_scanned")
                .map_err(StorageError::Database)? as u64,
            lots_updated: row
                .try_get::<i64, _>("lots_updated")
                .map_err(StorageError::Database)? as u64,
            error_count: row
                .try_get::<i64, _>("error_count")
                .map_err(StorageError::Database)? as u64,
        },
        max_pages: row.try_get("max_pages").map_err(StorageError::Database)?,
        dry_run: row.try_get("dry_run").map_err(StorageError::Database)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::apply_all;
    use chrono::TimeZone;
    use lotsync_core::fingerprint::fingerprint;

    async fn migrated_store() -> LotStore {
        let store = LotStore::open_in_memory().await.unwrap();
        apply_all(store.pool()).await.unwrap();
        store
    }

    fn parsed_auction() -> ParsedAuction {
        ParsedAuction {
            code: "A1-1000".into(),
            title: "Industrial clearance".into(),
            url: "https://vendor.example/a1-1000".into(),
            starts_at: Utc.with_ymd_and_hms(2026, 8, 1, 9, 0, 0).single(),
            ends_at_planned: Utc.with_ymd_and_hms(2026, 9, 1, 18, 0, 0).single(),
        }
    }

    fn listing_fields() -> ListingFields {
        ListingFields {
            title: "Forklift".into(),
            url: "https://vendor.example/a1-1000/l1".into(),
            status: "open".into(),
            current_bid: Some(120.0),
            bid_count: 3,
            closes_at: Utc.with_ymd_and_hms(2026, 9, 1, 17, 0, 0).single(),
        }
    }

    #[tokio::test]
    async fn path_backed_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lotsync.db");

        {
            let store = LotStore::open_path(&path).await.unwrap();
            apply_all(store.pool()).await.unwrap();
            store.upsert_auction(&parsed_auction()).await.unwrap();
        }

        let store = LotStore::open_path(&path).await.unwrap();
        apply_all(store.pool()).await.unwrap();
        let auction = store.get_auction("A1-1000").await.unwrap().unwrap();
        assert_eq!(auction.title, "Industrial clearance");
    }

    #[tokio::test]
    async fn auction_upsert_overwrites_header_fields() {
        let store = migrated_store().await;
        let first = store.upsert_auction(&parsed_auction()).await.unwrap();

        let mut changed = parsed_auction();
        changed.title = "Industrial clearance (extended)".into();
        let second = store.upsert_auction(&changed).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.title, "Industrial clearance (extended)");
    }

    #[tokio::test]
    async fn duplicate_lot_insert_is_a_constraint_error() {
        let store = migrated_store().await;
        let auction = store.upsert_auction(&parsed_auction()).await.unwrap();
        let fields = listing_fields();
        let hash = fingerprint(&fields.projection());
        let now = Utc::now();

        store
            .insert_lot_listing(auction.id, "L1", &fields, &hash, now)
            .await
            .unwrap();
        let err = store
            .insert_lot_listing(auction.id, "L1", &fields, &hash, now)
            .await
            .unwrap_err();
        assert!(err.is_constraint(), "expected constraint, got {err}");
    }

    #[tokio::test]
    async fn listing_update_leaves_detail_fields_untouched() {
        let store = migrated_store().await;
        let auction = store.upsert_auction(&parsed_auction()).await.unwrap();
        let fields = listing_fields();
        let hash = fingerprint(&fields.projection());
        let lot = store
            .insert_lot_listing(auction.id, "L1", &fields, &hash, Utc::now())
            .await
            .unwrap();

        let detail = DetailFields {
            description: Some("Diesel, 2011".into()),
            location: Some("Hall B".into()),
            category: Some("machinery".into()),
            closes_at_planned: None,
        };
        let detail_hash = fingerprint(&detail.projection());
        store
            .update_lot_detail(lot.id, &detail, &detail_hash, Utc::now())
            .await
            .unwrap();

        let mut updated_fields = listing_fields();
        updated_fields.current_bid = Some(140.0);
        let new_hash = fingerprint(&updated_fields.projection());
        store
            .update_lot_listing(lot.id, &updated_fields, &new_hash, Utc::now())
            .await
            .unwrap();

        let lot = store.get_lot(auction.id, "L1").await.unwrap().unwrap();
        assert_eq!(lot.current_bid, Some(140.0));
        assert_eq!(lot.listing_hash.as_deref(), Some(new_hash.as_str()));
        assert_eq!(lot.description.as_deref(), Some("Diesel, 2011"));
        assert_eq!(lot.detail_hash.as_deref(), Some(detail_hash.as_str()));
    }

    #[tokio::test]
    async fn touch_refreshes_only_the_matching_seen_timestamp() {
        let store = migrated_store().await;
        let auction = store.upsert_auction(&parsed_auction()).await.unwrap();
        let fields = listing_fields();
        let hash = fingerprint(&fields.projection());
        let t0 = Utc.with_ymd_and_hms(2026, 8, 30, 10, 0, 0).single().unwrap();
        let lot = store
            .insert_lot_listing(auction.id, "L1", &fields, &hash, t0)
            .await
            .unwrap();

        let t1 = Utc.with_ymd_and_hms(2026, 8, 30, 11, 0, 0).single().unwrap();
        store.touch_listing_seen(lot.id, t1).await.unwrap();

        let lot = store.get_lot(auction.id, "L1").await.unwrap().unwrap();
        assert_eq!(lot.last_seen_at, Some(t1));
        assert_eq!(lot.detail_last_seen_at, None);
        assert_eq!(lot.updated_at, t0);
    }

    #[tokio::test]
    async fn bid_time_backfill_only_fills_nulls() {
        let store = migrated_store().await;
        let auction = store.upsert_auction(&parsed_auction()).await.unwrap();
        let fields = listing_fields();
        let hash = fingerprint(&fields.projection());
        let lot = store
            .insert_lot_listing(auction.id, "L1", &fields, &hash, Utc::now())
            .await
            .unwrap();

        let t_known = Utc.with_ymd_and_hms(2026, 8, 29, 15, 0, 0).single().unwrap();
        store
            .insert_bid(
                lot.id,
                &ParsedBid {
                    bidder_label: "Bidder 4".into(),
                    amount: 120.0,
                    bid_time: None,
                },
            )
            .await
            .unwrap();
        store
            .insert_bid(
                lot.id,
                &ParsedBid {
                    bidder_label: "Bidder 2".into(),
                    amount: 100.0,
                    bid_time: Some(t_known),
                },
            )
            .await
            .unwrap();

        let bids = store.list_bids(lot.id).await.unwrap();
        let discovered = Utc.with_ymd_and_hms(2026, 8, 29, 15, 5, 0).single().unwrap();
        store.set_bid_time(bids[0].id, discovered).await.unwrap();
        store.set_bid_time(bids[1].id, discovered).await.unwrap();

        let bids = store.list_bids(lot.id).await.unwrap();
        assert_eq!(bids[0].bid_time, Some(discovered));
        // Already-known time is never overwritten.
        assert_eq!(bids[1].bid_time, Some(t_known));
    }

    #[tokio::test]
    async fn sync_run_lifecycle_finalizes_once() {
        let store = migrated_store().await;
        let started = Utc.with_ymd_and_hms(2026, 8, 30, 8, 0, 0).single().unwrap();
        store
            .create_sync_run("run-1", Some("A1-1000"), started, Some(5), false)
            .await
            .unwrap();

        let open = store.get_sync_run("run-1").await.unwrap().unwrap();
        assert_eq!(open.status, SyncRunStatus::Running);
        assert!(open.finished_at.is_none());

        let counters = RunCounters {
            pages_scanned: 5,
            lots_scanned: 40,
            lots_updated: 7,
            error_count: 0,
        };
        let finished = Utc.with_ymd_and_hms(2026, 8, 30, 8, 5, 0).single().unwrap();
        store
            .finalize_sync_run("run-1", SyncRunStatus::Completed, &counters, finished)
            .await
            .unwrap();

        // A second finalize is a no-op: the run is already closed.
        let late = RunCounters::default();
        store
            .finalize_sync_run("run-1", SyncRunStatus::Failed, &late, Utc::now())
            .await
            .unwrap();

        let done = store.get_sync_run("run-1").await.unwrap().unwrap();
        assert_eq!(done.status, SyncRunStatus::Completed);
        assert_eq!(done.counters, counters);
        assert_eq!(done.finished_at, Some(finished));
    }
}
