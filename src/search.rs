use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Last-call-wins settling window for search-as-you-type.
#[derive(Debug)]
pub struct SearchDebouncer {
    window: Duration,
    latest: AtomicU64,
}

impl SearchDebouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            latest: AtomicU64::new(0),
        }
    }

    /// Waits out the window; `false` if a newer call arrived meanwhile.
    pub async fn settle(&self) -> bool {
        let ticket = self.latest.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.window.is_zero() {
            tokio::time::sleep(self.window).await;
        }
        let current = self.latest.load(Ordering::SeqCst);
        if current != ticket {
            debug!(ticket, current, "Search superseded");
        }
        current == ticket
    }
}

/// Trimmed search term, or `None` when there is nothing to search for.
pub fn normalize_query(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
