//! Paginated fetcher.
//!
//! Walks one entity type's history a page at a time through an adapter. The fetcher is a pull
//! iterator: the caller writes each page durably before asking for the next, and persists
//! [`FetchedPage::resume_from`] as its cursor so a restarted sync picks up where the last
//! durable page ended instead of at the beginning of the window.

use serde_json::Value;
use tracing::{debug, warn};

use crate::connectors::{
    ConnectionAdapter, ConnectionContext, ConnectorError, Cursor, PageRequest, PaginationStyle,
    SyncWindow,
};

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub records: Vec<Value>,
    /// Position to persist once `records` are written. `None` on the final page.
    pub resume_from: Option<Cursor>,
    pub is_last: bool,
}

pub struct PaginatedFetcher<'a> {
    adapter: &'a dyn ConnectionAdapter,
    ctx: &'a ConnectionContext,
    entity_type: String,
    window: SyncWindow,
    page_size: u32,
    style: PaginationStyle,
    cursor: Option<Cursor>,
    finished: bool,
    pages_fetched: u32,
    records_fetched: u64,
}

/// Start walking `entity_type` within `window`, resuming from `start_from` when a previous
/// run left a cursor behind.
pub fn fetch_all<'a>(
    adapter: &'a dyn ConnectionAdapter,
    ctx: &'a ConnectionContext,
    entity_type: &str,
    window: SyncWindow,
    start_from: Option<Cursor>,
    page_size: u32,
) -> PaginatedFetcher<'a> {
    PaginatedFetcher {
        adapter,
        ctx,
        entity_type: entity_type.to_string(),
        window,
        page_size: page_size.max(1),
        style: adapter.pagination_style(),
        cursor: start_from,
        finished: false,
        pages_fetched: 0,
        records_fetched: 0,
    }
}

impl PaginatedFetcher<'_> {
    /// Fetch the next page, or `None` once the provider has no more records.
    ///
    /// A failed fetch leaves the position untouched, so the same page can be requested again.
    pub async fn next_page(&mut self) -> Result<Option<FetchedPage>, ConnectorError> {
        if self.finished {
            return Ok(None);
        }

        let request = PageRequest {
            entity_type: self.entity_type.clone(),
            window: self.window,
            cursor: self.cursor.clone(),
            page_size: self.page_size,
        };
        let page = self.adapter.fetch_page(self.ctx, &request).await?;
        let count = page.records.len();

        let mut is_last = match self.style {
            PaginationStyle::Cursor => count == 0 || page.next_cursor.is_none(),
            PaginationStyle::SinceId => count < self.page_size as usize,
        };
        if !is_last && page.next_cursor == self.cursor {
            warn!(
                entity_type = %self.entity_type,
                provider = %self.adapter.provider(),
                "provider returned the same position twice; stopping pagination"
            );
            is_last = true;
        }

        self.finished = is_last;
        self.cursor = if is_last { None } else { page.next_cursor };
        self.pages_fetched += 1;
        self.records_fetched += count as u64;

        debug!(
            entity_type = %self.entity_type,
            page = self.pages_fetched,
            records = count,
            is_last,
            "page fetched"
        );

        if count == 0 {
            return Ok(None);
        }
        Ok(Some(FetchedPage {
            records: page.records,
            resume_from: self.cursor.clone(),
            is_last,
        }))
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn pages_fetched(&self) -> u32 {
        self.pages_fetched
    }

    pub fn records_fetched(&self) -> u64 {
        self.records_fetched
    }

    /// Drain every page into memory. Backfills write page by page instead; this is for
    /// small lookups and tests.
    pub async fn collect_all(mut self) -> Result<Vec<Value>, ConnectorError> {
        let mut records = Vec::new();
        while let Some(page) = self.next_page().await? {
            records.extend(page.records);
        }
        Ok(records)
    }
}
