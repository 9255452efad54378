//! Core domain model, field projections, and fingerprinting for lotsync.

pub mod event;
pub mod fingerprint;
pub mod model;

pub use event::{Envelope, EventKind, LotChangePayload, PROTOCOL_VERSION};
pub use fingerprint::{fingerprint, FieldProjection};
pub use model::{
    Auction, BidEntry, DetailFields, ListingFields, Lot, PageKind, ParsedAuction, ParsedBid,
    ParsedLot, ParsedPage, RunCounters, SyncRunStatus,
};

pub const CRATE_NAME: &str = "lotsync-core";
