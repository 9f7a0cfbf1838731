//! Pull-based pagination over store reads.

use std::sync::Arc;

use arcade_db::{Attributes, BatchSelect, IndexQuery, KvStore, Page, QueryRequest, StartKey};
use tracing::trace;

use crate::error::Result;

/// A read the paginator can resume.
#[derive(Debug, Clone)]
pub enum PageRequest {
    Query(QueryRequest),
    Index(IndexQuery),
    Batch(BatchSelect),
}

impl PageRequest {
    fn with_start(&self, start: Option<StartKey>) -> Self {
        match self {
            PageRequest::Query(q) => PageRequest::Query(q.clone().starting_after(start)),
            PageRequest::Index(q) => PageRequest::Index(q.clone().starting_after(start)),
            PageRequest::Batch(q) => PageRequest::Batch(q.clone().starting_after(start)),
        }
    }

    async fn fetch(&self, store: &dyn KvStore) -> Result<Page> {
        let page = match self {
            PageRequest::Query(q) => store.query(q).await?,
            PageRequest::Index(q) => store.query_index(q).await?,
            PageRequest::Batch(q) => store.batch_select(q).await?,
        };
        Ok(page)
    }

    fn start(&self) -> Option<&StartKey> {
        match self {
            PageRequest::Query(q) => q.exclusive_start.as_ref(),
            PageRequest::Index(q) => q.exclusive_start.as_ref(),
            PageRequest::Batch(q) => q.exclusive_start.as_ref(),
        }
    }
}

impl From<QueryRequest> for PageRequest {
    fn from(request: QueryRequest) -> Self {
        PageRequest::Query(request)
    }
}

impl From<IndexQuery> for PageRequest {
    fn from(request: IndexQuery) -> Self {
        PageRequest::Index(request)
    }
}

impl From<BatchSelect> for PageRequest {
    fn from(request: BatchSelect) -> Self {
        PageRequest::Batch(request)
    }
}

/// Lazily walks a read page by page, following the store's continuation key.
///
/// Nothing is fetched until [`Paginator::next_page`] is called. The current
/// [`Paginator::position`] can be handed to a new paginator to resume.
pub struct Paginator {
    store: Arc<dyn KvStore>,
    request: PageRequest,
    position: Option<StartKey>,
    pages: usize,
    exhausted: bool,
}

impl Paginator {
    pub fn new(store: Arc<dyn KvStore>, request: impl Into<PageRequest>) -> Self {
        let request = request.into();
        let position = request.start().cloned();
        Self {
            store,
            request,
            position,
            pages: 0,
            exhausted: false,
        }
    }

    /// Fetch the next page, or `None` once the read is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<Attributes>>> {
        if self.exhausted {
            return Ok(None);
        }
        let request = self.request.with_start(self.position.clone());
        let page = request.fetch(self.store.as_ref()).await?;
        self.pages += 1;
        trace!(
            page = self.pages,
            items = page.items.len(),
            more = page.last_evaluated.is_some(),
            "Fetched page"
        );
        match page.last_evaluated {
            Some(next) => self.position = Some(next),
            None => {
                self.position = None;
                self.exhausted = true;
            }
        }
        Ok(Some(page.items))
    }

    /// Resume point after the pages fetched so far; `None` once exhausted.
    pub fn position(&self) -> Option<&StartKey> {
        self.position.as_ref()
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Pages fetched so far.
    pub fn pages_fetched(&self) -> usize {
        self.pages
    }

    /// Drain every remaining page.
    pub async fn collect_all(mut self) -> Result<Vec<Attributes>> {
        let mut items = Vec::new();
        while let Some(page) = self.next_page().await? {
            items.extend(page);
        }
        Ok(items)
    }
}
