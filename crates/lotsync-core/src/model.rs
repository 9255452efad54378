//! Persisted entities and the parsed-page handoff contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fingerprint::FieldProjection;

/// Which vendor page a field set was scraped from.
///
/// Listing and detail pages expose disjoint field sets, so each kind feeds
/// its own fingerprint slot on [`Lot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageKind {
    Listing,
    Detail,
}

impl std::fmt::Display for PageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Listing => write!(f, "listing"),
            Self::Detail => write!(f, "detail"),
        }
    }
}

/// Canonical persisted auction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Auction {
    pub id: i64,
    pub code: String,
    pub title: String,
    pub url: String,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at_planned: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Canonical persisted lot with its two fingerprint slots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lot {
    pub id: i64,
    pub auction_id: i64,
    pub lot_code: String,
    // Listing-page fields.
    pub title: String,
    pub url: String,
    pub status: String,
    pub current_bid: Option<f64>,
    pub bid_count: i64,
    pub closes_at: Option<DateTime<Utc>>,
    // Detail-page fields.
    pub description: Option<String>,
    pub location: Option<String>,
    pub category: Option<String>,
    pub closes_at_planned: Option<DateTime<Utc>>,
    // Change-detection state, one slot per page kind.
    pub listing_hash: Option<String>,
    pub detail_hash: Option<String>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub detail_last_seen_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only bid observation scraped from a detail page.
///
/// The source exposes no stable bid identifier, so entries are matched by
/// full-tuple equality. The only permitted mutation is backfilling a
/// `bid_time` that was previously unknown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BidEntry {
    pub id: i64,
    pub lot_id: i64,
    pub bidder_label: String,
    pub amount: f64,
    pub bid_time: Option<DateTime<Utc>>,
}

/// Terminal and in-flight states of a sync run record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRunStatus {
    Running,
    Completed,
    Partial,
    Failed,
}

impl SyncRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "partial" => Some(Self::Partial),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for SyncRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate counters accumulated over one sync pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub pages_scanned: u64,
    pub lots_scanned: u64,
    pub lots_updated: u64,
    pub error_count: u64,
}

fn push_opt_decimal(projection: &mut FieldProjection, key: &str, value: Option<f64>) {
    match value {
        Some(v) => projection.push(key, format!("{v:.2}")),
        None => projection.push(key, ""),
    }
}

fn push_opt_time(projection: &mut FieldProjection, key: &str, value: Option<DateTime<Utc>>) {
    match value {
        Some(t) => projection.push(key, t.to_rfc3339()),
        None => projection.push(key, ""),
    }
}

fn push_opt_str(projection: &mut FieldProjection, key: &str, value: Option<&str>) {
    projection.push(key, value.map(str::trim).unwrap_or_default());
}

/// Field set visible on a listing/search page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingFields {
    pub title: String,
    pub url: String,
    pub status: String,
    pub current_bid: Option<f64>,
    pub bid_count: i64,
    pub closes_at: Option<DateTime<Utc>>,
}

impl ListingFields {
    /// Canonical, order-stable projection of the comparable listing fields.
    pub fn projection(&self) -> FieldProjection {
        let mut p = FieldProjection::new();
        p.push("title", self.title.trim());
        p.push("url", self.url.trim());
        p.push("status", self.status.trim());
        push_opt_decimal(&mut p, "current_bid", self.current_bid);
        p.push("bid_count", self.bid_count.to_string());
        push_opt_time(&mut p, "closes_at", self.closes_at);
        p
    }

    /// Names of listing fields whose value differs from the stored lot.
    pub fn changed_against(&self, lot: &Lot) -> Vec<String> {
        let mut changed = Vec::new();
        if self.title.trim() != lot.title {
            changed.push("title".to_string());
        }
        if self.url.trim() != lot.url {
            changed.push("url".to_string());
        }
        if self.status.trim() != lot.status {
            changed.push("status".to_string());
        }
        if self.current_bid != lot.current_bid {
            changed.push("current_bid".to_string());
        }
        if self.bid_count != lot.bid_count {
            changed.push("bid_count".to_string());
        }
        if self.closes_at != lot.closes_at {
            changed.push("closes_at".to_string());
        }
        changed
    }
}

/// Field set visible only on the lot detail page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailFields {
    pub description: Option<String>,
    pub location: Option<String>,
    pub category: Option<String>,
    pub closes_at_planned: Option<DateTime<Utc>>,
}

impl DetailFields {
    /// Canonical, order-stable projection of the comparable detail fields.
    pub fn projection(&self) -> FieldProjection {
        let mut p = FieldProjection::new();
        push_opt_str(&mut p, "description", self.description.as_deref());
        push_opt_str(&mut p, "location", self.location.as_deref());
        push_opt_str(&mut p, "category", self.category.as_deref());
        push_opt_time(&mut p, "closes_at_planned", self.closes_at_planned);
        p
    }

    /// Names of detail fields whose value differs from the stored lot.
    pub fn changed_against(&self, lot: &Lot) -> Vec<String> {
        let mut changed = Vec::new();
        if self.description.as_deref().map(str::trim) != lot.description.as_deref() {
            changed.push("description".to_string());
        }
        if self.location.as_deref().map(str::trim) != lot.location.as_deref() {
            changed.push("location".to_string());
        }
        if self.category.as_deref().map(str::trim) != lot.category.as_deref() {
            changed.push("category".to_string());
        }
        if self.closes_at_planned != lot.closes_at_planned {
            changed.push("closes_at_planned".to_string());
        }
        changed
    }
}

/// Auction header as scraped from a page, before persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedAuction {
    pub code: String,
    pub title: String,
    pub url: String,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at_planned: Option<DateTime<Utc>>,
}

/// Bid tuple as scraped from a detail page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedBid {
    pub bidder_label: String,
    pub amount: f64,
    pub bid_time: Option<DateTime<Utc>>,
}

/// One lot's worth of parsed fields from a single page fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedLot {
    pub lot_code: String,
    #[serde(default)]
    pub listing: Option<ListingFields>,
    #[serde(default)]
    pub detail: Option<DetailFields>,
    #[serde(default)]
    pub bids: Vec<ParsedBid>,
}

/// Importer output for one fetched page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedPage {
    #[serde(default)]
    pub auction: Option<ParsedAuction>,
    #[serde(default)]
    pub lots: Vec<ParsedLot>,
    /// Whether the source advertises another page after this one.
    #[serde(default)]
    pub has_more: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::fingerprint;
    use chrono::TimeZone;

    fn listing() -> ListingFields {
        ListingFields {
            title: "Pallet racking".into(),
            url: "https://vendor.example/a1/l7".into(),
            status: "open".into(),
            current_bid: Some(80.0),
            bid_count: 4,
            closes_at: Utc.with_ymd_and_hms(2026, 9, 1, 18, 0, 0).single(),
        }
    }

    fn stored_lot() -> Lot {
        let now = Utc.with_ymd_and_hms(2026, 8, 30, 12, 0, 0).single().unwrap();
        Lot {
            id: 1,
            auction_id: 1,
            lot_code: "L7".into(),
            title: "Pallet racking".into(),
            url: "https://vendor.example/a1/l7".into(),
            status: "open".into(),
            current_bid: Some(80.0),
            bid_count: 4,
            closes_at: Utc.with_ymd_and_hms(2026, 9, 1, 18, 0, 0).single(),
            description: None,
            location: None,
            category: None,
            closes_at_planned: None,
            listing_hash: None,
            detail_hash: None,
            last_seen_at: None,
            detail_last_seen_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn listing_projection_is_stable_across_calls() {
        let fields = listing();
        assert_eq!(
            fingerprint(&fields.projection()),
            fingerprint(&fields.projection())
        );
    }

    #[test]
    fn bid_change_alters_listing_projection() {
        let a = listing();
        let mut b = listing();
        b.current_bid = Some(85.0);
        b.bid_count = 5;
        assert_ne!(fingerprint(&a.projection()), fingerprint(&b.projection()));
    }

    #[test]
    fn whitespace_is_normalized_out_of_projection() {
        let a = listing();
        let mut b = listing();
        b.title = "  Pallet racking ".into();
        assert_eq!(fingerprint(&a.projection()), fingerprint(&b.projection()));
    }

    #[test]
    fn changed_fields_name_exactly_the_differing_values() {
        let lot = stored_lot();
        let mut fields = listing();
        assert!(fields.changed_against(&lot).is_empty());

        fields.current_bid = Some(95.0);
        fields.status = "closing".into();
        let changed = fields.changed_against(&lot);
        assert_eq!(changed, vec!["status".to_string(), "current_bid".to_string()]);
    }

    #[test]
    fn detail_changes_do_not_touch_listing_comparisons() {
        let lot = stored_lot();
        let detail = DetailFields {
            description: Some("Heavy duty".into()),
            location: Some("Warehouse 3".into()),
            category: None,
            closes_at_planned: None,
        };
        let changed = detail.changed_against(&lot);
        assert_eq!(
            changed,
            vec!["description".to_string(), "location".to_string()]
        );
    }
}
