//! Ordered, idempotent schema migrations tracked by a name ledger.
//!
//! Each migration runs inside one transaction together with its ledger
//! insert, so a migration is either fully applied and recorded or absent.
//! A name already present in `schema_migrations` is skipped. Migrations with
//! an empty body are still recorded so fresh and upgraded stores converge to
//! the same history. Failures here are fatal to startup by contract.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::store::StorageError;

/// One named structural change.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub name: &'static str,
    pub notes: &'static str,
    pub statements: &'static [&'static str],
}

/// Ledger row for an applied migration.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedMigration {
    pub name: String,
    pub applied_at: DateTime<Utc>,
    pub notes: Option<String>,
}

/// The full ordered migration set for the lotsync store.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "0001_auctions_and_lots",
        notes: "auction, lot, and bid history tables",
        statements: &[
            "CREATE TABLE IF NOT EXISTS auctions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                code TEXT NOT NULL UNIQUE,
                title TEXT NOT NULL DEFAULT '',
                url TEXT NOT NULL DEFAULT '',
                starts_at TEXT,
                ends_at_planned TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS lots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                auction_id INTEGER NOT NULL REFERENCES auctions(id),
                lot_code TEXT NOT NULL,
                title TEXT NOT NULL DEFAULT '',
                url TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT '',
                current_bid REAL,
                bid_count INTEGER NOT NULL DEFAULT 0,
                closes_at TEXT,
                description TEXT,
                location TEXT,
                category TEXT,
                closes_at_planned TEXT,
                listing_hash TEXT,
                detail_hash TEXT,
                last_seen_at TEXT,
                detail_last_seen_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (auction_id, lot_code)
            )",
            "CREATE TABLE IF NOT EXISTS bid_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                lot_id INTEGER NOT NULL REFERENCES lots(id),
                bidder_label TEXT NOT NULL,
                amount REAL NOT NULL,
                bid_time TEXT
            )",
            "CREATE INDEX IF NOT EXISTS idx_bid_history_lot ON bid_history(lot_id)",
        ],
    },
    Migration {
        name: "0002_sync_runs",
        notes: "sync run audit trail",
        statements: &["CREATE TABLE IF NOT EXISTS sync_runs (
                run_id TEXT PRIMARY KEY,
                auction_code TEXT,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                status TEXT NOT NULL,
                pages_scanned INTEGER NOT NULL DEFAULT 0,
                lots_scanned INTEGER NOT NULL DEFAULT 0,
                lots_updated INTEGER NOT NULL DEFAULT 0,
                error_count INTEGER NOT NULL DEFAULT 0,
                max_pages INTEGER,
                dry_run INTEGER NOT NULL DEFAULT 0
            )"],
    },
    Migration {
        name: "0003_lot_seen_indexes",
        notes: "lookup indexes for seen-at sweeps",
        statements: &[
            "CREATE INDEX IF NOT EXISTS idx_lots_last_seen ON lots(last_seen_at)",
            "CREATE INDEX IF NOT EXISTS idx_sync_runs_started ON sync_runs(started_at)",
        ],
    },
];

async fn ensure_ledger(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            name TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL,
            notes TEXT
        )",
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Apply every not-yet-recorded migration from `migrations`, in order.
/// Returns the number applied this call.
pub async fn apply_migrations(
    pool: &SqlitePool,
    migrations: &[Migration],
) -> Result<usize, StorageError> {
    ensure_ledger(pool).await?;

    let mut applied = 0usize;
    for migration in migrations {
        let exists = sqlx::query("SELECT name FROM schema_migrations WHERE name = ?1")
            .bind(migration.name)
            .fetch_optional(pool)
            .await?
            .is_some();
        if exists {
            continue;
        }

        let mut tx = pool.begin().await?;
        for statement in migration.statements {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        sqlx::query("INSERT INTO schema_migrations (name, applied_at, notes) VALUES (?1, ?2, ?3)")
            .bind(migration.name)
            .bind(Utc::now())
            .bind(migration.notes)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!(name = migration.name, "applied migration");
        applied += 1;
    }
    Ok(applied)
}

/// Apply the standard lotsync migration set.
pub async fn apply_all(pool: &SqlitePool) -> Result<usize, StorageError> {
    apply_migrations(pool, MIGRATIONS).await
}

/// Read back the ledger, oldest first.
pub async fn applied_migrations(pool: &SqlitePool) -> Result<Vec<AppliedMigration>, StorageError> {
    ensure_ledger(pool).await?;
    let rows = sqlx::query("SELECT name, applied_at, notes FROM schema_migrations ORDER BY name")
        .fetch_all(pool)
        .await?;
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(AppliedMigration {
            name: row.try_get("name")?,
            applied_at: row.try_get("applied_at")?,
            notes: row.try_get("notes")?,
        });
    }
    Ok(out)
}
