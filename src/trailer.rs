use crate::models::Video;
use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

const YOUTUBE: &str = "YouTube";
const EMBED_BASE: &str = "https://www.youtube-nocookie.com/embed";
const EMBED_PARAMS: &str = "autoplay=1&rel=0&modestbranding=1&iv_load_policy=3";

/// Picks the trailer to play for a movie.
///
/// Tiers, each checked against the whole list before falling to the next:
/// official YouTube trailer, any YouTube trailer, any YouTube video. Within a
/// tier the earliest entry wins.
pub fn select_trailer(videos: &[Video]) -> Option<&Video> {
    videos
        .iter()
        .find(|v| is_youtube(v) && is_trailer(v) && v.official)
        .or_else(|| videos.iter().find(|v| is_youtube(v) && is_trailer(v)))
        .or_else(|| videos.iter().find(|v| is_youtube(v)))
}

fn is_youtube(video: &Video) -> bool {
    video.site == YOUTUBE
}

fn is_trailer(video: &Video) -> bool {
    video.video_type == "Trailer"
}

pub fn embed_url(video: &Video) -> String {
    format!("{EMBED_BASE}/{}?{EMBED_PARAMS}", video.key)
}

pub fn watch_url(video: &Video) -> String {
    format!("https://www.youtube.com/watch?v={}", video.key)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TrailerState {
    Closed,
    Open { movie_id: i64, movie_title: String },
}

/// Trailer overlay visibility, shared with whatever renders it.
#[derive(Debug)]
pub struct TrailerStore {
    tx: watch::Sender<TrailerState>,
}

impl TrailerStore {
    pub fn init() -> Self {
        let (tx, _rx) = watch::channel(TrailerState::Closed);
        Self { tx }
    }

    pub fn open(&self, movie_id: i64, movie_title: impl Into<String>) {
        let movie_title = movie_title.into();
        debug!(movie_id, title = %movie_title, "Opening trailer");
        self.tx.send_replace(TrailerState::Open {
            movie_id,
            movie_title,
        });
    }

    pub fn close(&self) {
        self.tx.send_replace(TrailerState::Closed);
    }

    pub fn current(&self) -> TrailerState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TrailerState> {
        self.tx.subscribe()
    }

    pub fn dispose(self) {
        self.close();
    }
}

impl Default for TrailerStore {
    fn default() -> Self {
        Self::init()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn video(id: &str, site: &str, kind: &str, official: bool) -> Video {
        Video {
            id: id.to_string(),
            key: format!("key-{id}"),
            name: format!("{kind} {id}"),
            site: site.to_string(),
            video_type: kind.to_string(),
            official,
            published_at: Utc::now(),
        }
    }

    fn fixture() -> Vec<Video> {
        vec![
            video("vimeo", "Vimeo", "Trailer", true),
            video("teaser", "YouTube", "Teaser", false),
            video("unofficial", "YouTube", "Trailer", false),
            video("official", "YouTube", "Trailer", true),
        ]
    }

    #[test]
    fn prefers_official_youtube_trailer() {
        let videos = fixture();
        assert_eq!(select_trailer(&videos).map(|v| v.id.as_str()), Some("official"));
    }

    fn permutations(items: Vec<Video>) -> Vec<Vec<Video>> {
        if items.len() <= 1 {
            return vec![items];
        }
        let mut out = Vec::new();
        for i in 0..items.len() {
            let mut rest = items.clone();
            let head = rest.remove(i);
            for mut tail in permutations(rest) {
                tail.insert(0, head.clone());
                out.push(tail);
            }
        }
        out
    }

    #[test]
    fn official_trailer_wins_in_every_order() {
        let all = permutations(fixture());
        assert_eq!(all.len(), 24);
        for videos in all {
            assert_eq!(select_trailer(&videos).unwrap().id, "official");
        }
    }

    #[test]
    fn falls_back_through_tiers() {
        let videos = vec![
            video("teaser", "YouTube", "Teaser", true),
            video("unofficial", "YouTube", "Trailer", false),
        ];
        assert_eq!(select_trailer(&videos).unwrap().id, "unofficial");

        let videos = vec![
            video("vimeo", "Vimeo", "Trailer", true),
            video("clip", "YouTube", "Clip", false),
            video("teaser", "YouTube", "Teaser", true),
        ];
        assert_eq!(select_trailer(&videos).unwrap().id, "clip");
    }

    #[test]
    fn first_entry_wins_within_a_tier() {
        let videos = vec![
            video("a", "YouTube", "Trailer", true),
            video("b", "YouTube", "Trailer", true),
        ];
        assert_eq!(select_trailer(&videos).unwrap().id, "a");
    }

    #[test]
    fn nothing_without_youtube() {
        assert!(select_trailer(&[]).is_none());
        let videos = vec![video("vimeo", "Vimeo", "Trailer", true)];
        assert!(select_trailer(&videos).is_none());
    }

    #[test]
    fn builds_embed_url() {
        let v = video("x", "YouTube", "Trailer", true);
        assert_eq!(
            embed_url(&v),
            "https://www.youtube-nocookie.com/embed/key-x?autoplay=1&rel=0&modestbranding=1&iv_load_policy=3"
        );
        assert_eq!(watch_url(&v), "https://www.youtube.com/watch?v=key-x");
    }

    #[test]
    fn store_tracks_open_and_close() {
        let store = TrailerStore::init();
        let rx = store.subscribe();
        store.open(7, "Heat");
        assert_eq!(
            *rx.borrow(),
            TrailerState::Open {
                movie_id: 7,
                movie_title: "Heat".to_string()
            }
        );
        store.close();
        assert_eq!(store.current(), TrailerState::Closed);
    }
}
