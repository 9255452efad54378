//! Seams to the external transport client and page importer.
//!
//! Vendor DOM parsing lives outside this core; the engine only requires
//! something that turns a URL into bytes and bytes into a [`ParsedPage`].
//! The JSON importer covers fixtures and tests.

use async_trait::async_trait;
use lotsync_core::model::{PageKind, ParsedPage};
use lotsync_storage::fetch::{FetchError, HttpFetcher};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImportError {
    /// Malformed content is never retried; refetching cannot fix it.
    #[error("malformed {kind} page: {message}")]
    Malformed { kind: PageKind, message: String },
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        Ok(self.fetch_bytes(url).await?.body)
    }
}

pub trait PageImporter: Send + Sync {
    fn parse(&self, raw: &[u8], kind: PageKind) -> Result<ParsedPage, ImportError>;
}

/// Importer for the typed JSON page format used by fixtures and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonImporter;

impl PageImporter for JsonImporter {
    fn parse(&self, raw: &[u8], kind: PageKind) -> Result<ParsedPage, ImportError> {
        let page: ParsedPage =
            serde_json::from_slice(raw).map_err(|err| ImportError::Malformed {
                kind,
                message: err.to_string(),
            })?;

        // A page that carries none of the field set for its kind is malformed.
        let missing = page.lots.iter().any(|lot| match kind {
            PageKind::Listing => lot.listing.is_none(),
            PageKind::Detail => lot.detail.is_none(),
        });
        if missing {
            return Err(ImportError::Malformed {
                kind,
                message: format!("page contains lots without {kind} fields"),
            });
        }
        Ok(page)
    }
}
