//! Keyed request cache standing between the view surface and the upstream client.
//!
//! Each key remembers its last value, whether a request is in flight, and the
//! last error. Callers asking for a key that is already being fetched wait for
//! that request instead of issuing their own. If the caller running the fetch
//! goes away, the key is released and one of the waiters takes over.
use crate::error::ClientError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryKey {
    Trending,
    Popular,
    NowPlaying,
    Search(String),
    Details(i64),
    Credits(i64),
    Videos(i64),
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryKey::Trending => write!(f, "movies/list/trending"),
            QueryKey::Popular => write!(f, "movies/list/popular"),
            QueryKey::NowPlaying => write!(f, "movies/list/infinite"),
            QueryKey::Search(q) => write!(f, "movies/list/search/{q}"),
            QueryKey::Details(id) => write!(f, "movies/detail/{id}"),
            QueryKey::Credits(id) => write!(f, "movies/detail/{id}/credits"),
            QueryKey::Videos(id) => write!(f, "movies/detail/{id}/videos"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryState<V> {
    pub data: Option<V>,
    pub fetched_at: Option<DateTime<Utc>>,
    pub is_fetching: bool,
    pub error: Option<ClientError>,
}

struct Entry<V> {
    value: Option<(V, DateTime<Utc>)>,
    error: Option<ClientError>,
    in_flight: bool,
    /// Bumped every time a fetch for this key settles with a result.
    settled: u64,
    /// Ticks whenever the in-flight request ends, settled or abandoned.
    wake: watch::Sender<u64>,
}

impl<V> Default for Entry<V> {
    fn default() -> Self {
        Self {
            value: None,
            error: None,
            in_flight: false,
            settled: 0,
            wake: watch::channel(0).0,
        }
    }
}

impl<V> Entry<V> {
    fn wake_waiters(&self) {
        self.wake.send_modify(|tick| *tick = tick.wrapping_add(1));
    }
}

enum Step<V> {
    Done(Result<V, ClientError>),
    Wait {
        seen: u64,
        wake: watch::Receiver<u64>,
    },
    Fetch,
}

pub struct QueryCache<V> {
    entries: Mutex<HashMap<QueryKey, Entry<V>>>,
    stale_after: Option<ChronoDuration>,
}

impl<V> fmt::Debug for QueryCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCache")
            .field("stale_after", &self.stale_after)
            .finish_non_exhaustive()
    }
}

impl<V> QueryCache<V> {
    fn lock(&self) -> MutexGuard<'_, HashMap<QueryKey, Entry<V>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Held by the caller running a fetch. Dropping it before [`InFlight::finish`]
/// frees the key so a waiter can retry.
struct InFlight<'a, V> {
    cache: &'a QueryCache<V>,
    key: QueryKey,
    finished: bool,
}

impl<V: Clone> InFlight<'_, V> {
    fn finish(mut self, result: &Result<V, ClientError>) {
        let mut entries = self.cache.lock();
        let entry = entries.entry(self.key.clone()).or_default();
        entry.in_flight = false;
        entry.settled += 1;
        match result {
            Ok(value) => {
                entry.value = Some((value.clone(), Utc::now()));
                entry.error = None;
            }
            Err(e) => {
                debug!(key = %self.key, "Query failed: {}", e);
                entry.error = Some(e.clone());
            }
        }
        entry.wake_waiters();
        self.finished = true;
    }
}

impl<V> Drop for InFlight<'_, V> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        debug!(key = %self.key, "Query abandoned mid-request");
        let mut entries = self.cache.lock();
        if let Some(entry) = entries.get_mut(&self.key) {
            entry.in_flight = false;
            entry.wake_waiters();
        }
    }
}

impl<V: Clone + Send> QueryCache<V> {
    /// Values never go stale; only [`QueryCache::invalidate`] drops them.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            stale_after: None,
        }
    }

    pub fn with_stale_time(stale_after: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            stale_after: ChronoDuration::from_std(stale_after).ok(),
        }
    }

    fn is_fresh(&self, fetched_at: DateTime<Utc>) -> bool {
        match self.stale_after {
            Some(window) => Utc::now() - fetched_at < window,
            None => true,
        }
    }

    fn next_step(&self, entry: &mut Entry<V>, waited_for: Option<u64>) -> Step<V> {
        if let Some(seen) = waited_for {
            if entry.settled > seen && !entry.in_flight {
                if let Some(err) = &entry.error {
                    return Step::Done(Err(err.clone()));
                }
                if let Some((value, _)) = &entry.value {
                    return Step::Done(Ok(value.clone()));
                }
            }
        }

        if let Some((value, fetched_at)) = &entry.value {
            if !entry.in_flight && entry.error.is_none() && self.is_fresh(*fetched_at) {
                return Step::Done(Ok(value.clone()));
            }
        }

        if entry.in_flight {
            return Step::Wait {
                seen: entry.settled,
                wake: entry.wake.subscribe(),
            };
        }

        entry.in_flight = true;
        Step::Fetch
    }

    /// Returns the cached value for `key` if still fresh, joins a request
    /// already in flight for it, or runs `fetch`.
    pub async fn get_or_fetch<F, Fut>(&self, key: QueryKey, fetch: F) -> Result<V, ClientError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, ClientError>>,
    {
        let mut waited_for: Option<u64> = None;
        loop {
            let step = {
                let mut entries = self.lock();
                let entry = entries.entry(key.clone()).or_default();
                self.next_step(entry, waited_for)
            };
            match step {
                Step::Done(result) => return result,
                Step::Wait { seen, mut wake } => {
                    debug!(key = %key, "Joining in-flight request");
                    // The receiver was taken under the lock, so a tick sent
                    // since then is still reported here.
                    let _ = wake.changed().await;
                    waited_for = Some(seen);
                }
                Step::Fetch => break,
            }
        }

        let in_flight = InFlight {
            cache: self,
            key,
            finished: false,
        };
        let result = fetch().await;
        in_flight.finish(&result);
        result
    }

    pub async fn state(&self, key: &QueryKey) -> QueryState<V> {
        let entries = self.lock();
        match entries.get(key) {
            Some(entry) => QueryState {
                data: entry.value.as_ref().map(|(v, _)| v.clone()),
                fetched_at: entry.value.as_ref().map(|(_, at)| *at),
                is_fetching: entry.in_flight,
                error: entry.error.clone(),
            },
            None => QueryState {
                data: None,
                fetched_at: None,
                is_fetching: false,
                error: None,
            },
        }
    }

    /// Forgets the stored value and error; an in-flight request still settles normally.
    pub async fn invalidate(&self, key: &QueryKey) {
        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(key) {
            entry.value = None;
            entry.error = None;
        }
    }
}

impl<V: Clone + Send> Default for QueryCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs `op` up to `retries + 1` times. `NotFound` is final and never retried.
pub async fn with_retry<T, F, Fut>(retries: u32, mut op: F) -> Result<T, ClientError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ClientError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_not_found() || attempt >= retries => return Err(e),
            Err(e) => {
                attempt += 1;
                warn!(attempt, retries, "Retrying after error: {}", e);
            }
        }
    }
}
