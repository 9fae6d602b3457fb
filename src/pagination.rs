//! Infinite-scroll feeds.
//!
//! A [`PaginatedFeed`] owns the cursor for one query context and never has
//! more than one page request in flight. Every reset bumps a generation
//! counter; a response tagged with an older generation is dropped on arrival
//! instead of being merged into the new cursor.
use crate::error::ClientError;
use crate::models::{MovieSummary, Page};
use crate::tmdb::MovieApi;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "query", rename_all = "snake_case")]
pub enum QueryContext {
    NowPlaying,
    Popular,
    Search(String),
}

impl QueryContext {
    pub fn slot(&self) -> FeedSlot {
        match self {
            QueryContext::NowPlaying => FeedSlot::NowPlaying,
            QueryContext::Popular => FeedSlot::Popular,
            QueryContext::Search(_) => FeedSlot::Search,
        }
    }
}

impl fmt::Display for QueryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryContext::NowPlaying => write!(f, "now-playing"),
            QueryContext::Popular => write!(f, "popular"),
            QueryContext::Search(q) => write!(f, "search '{q}'"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedSlot {
    NowPlaying,
    Popular,
    Search,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FeedStatus {
    Idle,
    Fetching { page: u32 },
    Ready { has_more: bool },
    Exhausted,
    Errored { page: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// Already fetching, already exhausted: nothing was requested.
    Skipped,
    Appended { page: u32, received: usize },
    /// The context changed while the request was in flight.
    Discarded,
    Failed(ClientError),
}

#[derive(Debug, Clone, Default)]
pub struct PaginationCursor {
    pub next_page: Option<u32>,
    pub accumulated_results: Vec<MovieSummary>,
    pub is_fetching: bool,
    pub is_exhausted: bool,
    pub total_results: u32,
    pub pages_loaded: u32,
    pub last_error: Option<ClientError>,
}

impl PaginationCursor {
    fn fresh() -> Self {
        Self {
            next_page: Some(1),
            ..Self::default()
        }
    }

    pub fn has_more(&self) -> bool {
        !self.is_exhausted && !self.is_fetching
    }

    fn status(&self) -> FeedStatus {
        let next = self.next_page.unwrap_or(1);
        if self.is_fetching {
            FeedStatus::Fetching { page: next }
        } else if self.last_error.is_some() {
            FeedStatus::Errored { page: next }
        } else if self.is_exhausted {
            FeedStatus::Exhausted
        } else if self.pages_loaded == 0 {
            FeedStatus::Idle
        } else {
            FeedStatus::Ready {
                has_more: self.has_more(),
            }
        }
    }

    /// Folds in the response to `requested`. Paging decisions use the page we
    /// asked for, not the number the upstream echoes back.
    fn merge(&mut self, requested: u32, page: Page<MovieSummary>) -> usize {
        if page.page != requested {
            debug!("Asked for page {} but upstream labelled it {}", requested, page.page);
        }
        let received = page.results.len();
        self.accumulated_results.extend(page.results);
        self.total_results = page.total_results;
        self.pages_loaded += 1;
        self.last_error = None;
        // Upstream totals may shrink between calls; only the latest one counts.
        self.next_page = requested
            .checked_add(1)
            .filter(|_| requested < page.total_pages);
        self.is_exhausted = self.next_page.is_none();
        received
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedSnapshot {
    pub context: QueryContext,
    #[serde(flatten)]
    pub status: FeedStatus,
    pub results: Vec<MovieSummary>,
    pub next_page: Option<u32>,
    pub has_more: bool,
    pub is_fetching: bool,
    pub is_exhausted: bool,
    pub total_results: u32,
    pub error: Option<String>,
}

impl FeedSnapshot {
    /// Exhausted with nothing to show: the "no results" state, not an error.
    pub fn is_empty_result(&self) -> bool {
        self.is_exhausted && self.results.is_empty()
    }
}

struct FeedInner {
    context: QueryContext,
    generation: u64,
    cursor: PaginationCursor,
}

impl FeedInner {
    fn reset(&mut self, context: QueryContext) {
        debug!("Resetting feed {} -> {}", self.context, context);
        self.generation += 1;
        self.context = context;
        self.cursor = PaginationCursor::fresh();
    }
}

pub struct PaginatedFeed {
    api: Arc<dyn MovieApi>,
    inner: Mutex<FeedInner>,
}

impl fmt::Debug for PaginatedFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaginatedFeed").finish_non_exhaustive()
    }
}

/// Marks one page request as in flight. If the request future is dropped
/// before it settles, the page is left errored so it can be retried.
struct PendingPage<'a> {
    feed: &'a PaginatedFeed,
    generation: u64,
    page: u32,
    settled: bool,
}

impl Drop for PendingPage<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut inner = self.feed.lock();
        if inner.generation != self.generation {
            return;
        }
        warn!("Page {} of {} abandoned mid-request", self.page, inner.context);
        inner.cursor.is_fetching = false;
        inner.cursor.last_error = Some(ClientError::Cancelled);
    }
}

impl PaginatedFeed {
    pub fn new(api: Arc<dyn MovieApi>, context: QueryContext) -> Self {
        Self {
            api,
            inner: Mutex::new(FeedInner {
                context,
                generation: 0,
                cursor: PaginationCursor::fresh(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FeedInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resets to `context` and requests its first page.
    pub async fn start(&self, context: QueryContext) -> FetchOutcome {
        self.reset(context).await;
        self.fetch_next().await
    }

    /// Drops the cursor and everything accumulated; in-flight results for the
    /// previous context will be discarded when they land.
    pub async fn reset(&self, context: QueryContext) {
        self.lock().reset(context);
    }

    /// Resets to `context` unless the feed already shows it. Returns whether
    /// a reset happened.
    pub fn ensure_context(&self, context: QueryContext) -> bool {
        let mut inner = self.lock();
        if inner.context == context {
            return false;
        }
        inner.reset(context);
        true
    }

    pub async fn fetch_next(&self) -> FetchOutcome {
        self.fetch(false).await
    }

    /// Requests page 1 only if nothing was loaded or attempted yet.
    pub async fn fetch_first(&self) -> FetchOutcome {
        self.fetch(true).await
    }

    async fn fetch(&self, only_if_idle: bool) -> FetchOutcome {
        let (context, generation, page) = {
            let mut inner = self.lock();
            if only_if_idle && inner.cursor.status() != FeedStatus::Idle {
                return FetchOutcome::Skipped;
            }
            let cursor = &mut inner.cursor;
            if cursor.is_fetching || cursor.is_exhausted {
                return FetchOutcome::Skipped;
            }
            let Some(page) = cursor.next_page else {
                return FetchOutcome::Skipped;
            };
            cursor.is_fetching = true;
            (inner.context.clone(), inner.generation, page)
        };

        let mut pending = PendingPage {
            feed: self,
            generation,
            page,
            settled: false,
        };
        debug!("Fetching page {} of {}", page, context);
        let result = self.request(&context, page).await;
        pending.settled = true;

        let mut inner = self.lock();
        if inner.generation != generation {
            debug!("Discarding page {} of stale {}", page, context);
            return FetchOutcome::Discarded;
        }
        let cursor = &mut inner.cursor;
        cursor.is_fetching = false;
        match result {
            Ok(data) => {
                let received = cursor.merge(page, data);
                if cursor.is_exhausted {
                    info!(
                        "Feed {} exhausted after {} result(s)",
                        context,
                        cursor.accumulated_results.len()
                    );
                }
                FetchOutcome::Appended { page, received }
            }
            Err(e) => {
                warn!("Page {} of {} failed: {}", page, context, e);
                cursor.last_error = Some(e.clone());
                FetchOutcome::Failed(e)
            }
        }
    }

    /// Re-requests the page that failed last; the cursor already points at it.
    pub async fn retry(&self) -> FetchOutcome {
        self.fetch_next().await
    }

    pub async fn context(&self) -> QueryContext {
        self.lock().context.clone()
    }

    pub async fn snapshot(&self) -> FeedSnapshot {
        let inner = self.lock();
        let cursor = &inner.cursor;
        FeedSnapshot {
            context: inner.context.clone(),
            status: cursor.status(),
            results: cursor.accumulated_results.clone(),
            next_page: cursor.next_page,
            has_more: cursor.has_more(),
            is_fetching: cursor.is_fetching,
            is_exhausted: cursor.is_exhausted,
            total_results: cursor.total_results,
            error: cursor.last_error.as_ref().map(|e| e.to_string()),
        }
    }

    async fn request(
        &self,
        context: &QueryContext,
        page: u32,
    ) -> Result<Page<MovieSummary>, ClientError> {
        match context {
            QueryContext::NowPlaying => self.api.now_playing(page).await,
            QueryContext::Popular => self.api.popular(page).await,
            QueryContext::Search(query) => self.api.search_movies(query, page).await,
        }
    }
}

/// One feed per slot. Asking for a context the slot is not currently showing
/// resets that slot.
pub struct FeedRegistry {
    api: Arc<dyn MovieApi>,
    feeds: Mutex<HashMap<FeedSlot, Arc<PaginatedFeed>>>,
}

impl fmt::Debug for FeedRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedRegistry").finish_non_exhaustive()
    }
}

impl FeedRegistry {
    pub fn new(api: Arc<dyn MovieApi>) -> Self {
        Self {
            api,
            feeds: Mutex::new(HashMap::new()),
        }
    }

    pub async fn feed_for(&self, context: QueryContext) -> Arc<PaginatedFeed> {
        let feed = {
            let mut feeds = self.feeds.lock().unwrap_or_else(PoisonError::into_inner);
            feeds
                .entry(context.slot())
                .or_insert_with(|| Arc::new(PaginatedFeed::new(self.api.clone(), context.clone())))
                .clone()
        };
        feed.ensure_context(context);
        feed
    }

    /// Feed for `context`, with its first page requested if nothing was loaded yet.
    pub async fn open(&self, context: QueryContext) -> Arc<PaginatedFeed> {
        let feed = self.feed_for(context).await;
        feed.fetch_first().await;
        feed
    }
}
