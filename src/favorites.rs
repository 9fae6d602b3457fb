//! Saved movies, kept as full summaries so the favorites view never refetches.
//!
//! [`FavoritesSet`] holds the pure transitions; [`FavoritesStorage`] is the
//! persistence effect; [`FavoritesStore`] ties them together as the injected
//! container the rest of the app talks to.
use crate::error::PersistenceError;
use crate::models::MovieSummary;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Storage key used by the web client; also the default file stem.
pub const STORAGE_KEY: &str = "movie-favorites";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FavoritesSet {
    entries: Vec<MovieSummary>,
}

impl FavoritesSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a set from stored entries; a repeated id keeps its first position
    /// and the last stored record.
    pub fn from_entries(entries: impl IntoIterator<Item = MovieSummary>) -> Self {
        entries
            .into_iter()
            .fold(Self::new(), |set, movie| set.with_added(movie))
    }

    /// Inserts `movie`, replacing any record with the same id in place.
    pub fn with_added(&self, movie: MovieSummary) -> Self {
        let mut entries = self.entries.clone();
        match entries.iter_mut().find(|m| m.id == movie.id) {
            Some(existing) => *existing = movie,
            None => entries.push(movie),
        }
        Self { entries }
    }

    pub fn with_removed(&self, movie_id: i64) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .filter(|m| m.id != movie_id)
                .cloned()
                .collect(),
        }
    }

    pub fn contains(&self, movie_id: i64) -> bool {
        self.entries.iter().any(|m| m.id == movie_id)
    }

    pub fn list(&self) -> &[MovieSummary] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub trait FavoritesStorage: Send + Sync {
    /// `Ok(None)` when nothing has been stored yet.
    fn load(&self) -> Result<Option<Vec<MovieSummary>>, PersistenceError>;
    fn save(&self, favorites: &[MovieSummary]) -> Result<(), PersistenceError>;
}

/// Accepts both the bare array this crate writes and the persisted-store
/// envelope the web client wrote (`{"state":{"favorites":[..]},"version":0}`).
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredFavorites {
    Bare(Vec<MovieSummary>),
    Envelope { state: EnvelopeState },
}

#[derive(Deserialize)]
struct EnvelopeState {
    #[serde(default)]
    favorites: Vec<MovieSummary>,
}

fn decode(raw: &str) -> Result<Vec<MovieSummary>, PersistenceError> {
    match serde_json::from_str::<StoredFavorites>(raw) {
        Ok(StoredFavorites::Bare(list)) => Ok(list),
        Ok(StoredFavorites::Envelope { state }) => Ok(state.favorites),
        Err(e) => Err(PersistenceError::Deserialize(e.to_string())),
    }
}

fn encode(favorites: &[MovieSummary]) -> Result<String, PersistenceError> {
    serde_json::to_string(favorites).map_err(|e| PersistenceError::Serialize(e.to_string()))
}

/// Durable JSON file. Writes go to a sibling temp file that is then renamed
/// over the target, so a crash mid-write leaves the previous contents intact.
#[derive(Debug, Clone)]
pub struct JsonFileStorage {
    path: PathBuf,
}

impl JsonFileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| STORAGE_KEY.into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl FavoritesStorage for JsonFileStorage {
    fn load(&self) -> Result<Option<Vec<MovieSummary>>, PersistenceError> {
        match fs::read_to_string(&self.path) {
            Ok(raw) if raw.trim().is_empty() => Ok(None),
            Ok(raw) => decode(&raw).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, favorites: &[MovieSummary]) -> Result<(), PersistenceError> {
        let body = encode(favorites)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.temp_path();
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Keeps the serialized form in memory, so round trips still go through JSON.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    slot: Mutex<Option<String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_raw(raw: impl Into<String>) -> Self {
        Self {
            slot: Mutex::new(Some(raw.into())),
        }
    }

    pub fn raw(&self) -> Option<String> {
        self.slot.lock().ok().and_then(|g| g.clone())
    }
}

impl FavoritesStorage for MemoryStorage {
    fn load(&self) -> Result<Option<Vec<MovieSummary>>, PersistenceError> {
        match self.raw() {
            Some(raw) => decode(&raw).map(Some),
            None => Ok(None),
        }
    }

    fn save(&self, favorites: &[MovieSummary]) -> Result<(), PersistenceError> {
        let body = encode(favorites)?;
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| PersistenceError::Serialize("memory slot poisoned".to_string()))?;
        *slot = Some(body);
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PersistenceHealth {
    pub failures: u64,
    pub last_error: Option<String>,
}

struct StoreState {
    set: Mutex<FavoritesSet>,
    storage: Box<dyn FavoritesStorage>,
    health: Mutex<PersistenceHealth>,
    tx: watch::Sender<FavoritesSet>,
}

/// Cheap to share; mutations run on the blocking pool and commit even if the
/// caller stops waiting for them.
pub struct FavoritesStore {
    shared: Arc<StoreState>,
}

impl std::fmt::Debug for FavoritesStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FavoritesStore")
            .field("len", &self.snapshot().len())
            .finish()
    }
}

impl FavoritesStore {
    /// Loads whatever the storage holds. An unreadable store is logged and the
    /// app starts with no favorites rather than failing to boot.
    pub fn init(storage: impl FavoritesStorage + 'static) -> Self {
        let mut health = PersistenceHealth::default();
        let initial = match storage.load() {
            Ok(Some(entries)) => FavoritesSet::from_entries(entries),
            Ok(None) => FavoritesSet::new(),
            Err(e) => {
                warn!("Failed to load favorites, starting empty: {}", e);
                health.failures += 1;
                health.last_error = Some(e.to_string());
                FavoritesSet::new()
            }
        };
        info!("Loaded {} favorite(s)", initial.len());
        let (tx, _rx) = watch::channel(initial.clone());
        Self {
            shared: Arc::new(StoreState {
                set: Mutex::new(initial),
                storage: Box::new(storage),
                health: Mutex::new(health),
                tx,
            }),
        }
    }

    pub async fn add(&self, movie: MovieSummary) {
        debug!(movie_id = movie.id, "Adding favorite");
        self.apply(move |set| set.with_added(movie)).await;
    }

    pub async fn remove(&self, movie_id: i64) {
        debug!(movie_id, "Removing favorite");
        self.apply(move |set| set.with_removed(movie_id)).await;
    }

    pub fn contains(&self, movie_id: i64) -> bool {
        self.snapshot().contains(movie_id)
    }

    pub fn list(&self) -> Vec<MovieSummary> {
        self.snapshot().list().to_vec()
    }

    pub fn snapshot(&self) -> FavoritesSet {
        lock(&self.shared.set).clone()
    }

    /// Receivers observe every committed state, already persisted.
    pub fn subscribe(&self) -> watch::Receiver<FavoritesSet> {
        self.shared.tx.subscribe()
    }

    pub fn persistence_health(&self) -> PersistenceHealth {
        lock(&self.shared.health).clone()
    }

    /// Flushes the current set one last time; subscribers then see the channel close.
    pub fn dispose(self) {
        let current = self.snapshot();
        self.shared.persist(&current);
        info!("Favorites store disposed ({} saved)", current.len());
    }

    /// Resolves once the new set is saved and published.
    async fn apply<F>(&self, transition: F)
    where
        F: FnOnce(&FavoritesSet) -> FavoritesSet + Send + 'static,
    {
        let shared = self.shared.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || shared.apply(transition)).await {
            warn!("Favorites update did not complete: {}", e);
        }
    }
}

impl StoreState {
    fn apply(&self, transition: impl FnOnce(&FavoritesSet) -> FavoritesSet) {
        let mut guard = lock(&self.set);
        let next = transition(&guard);
        self.persist(&next);
        *guard = next.clone();
        self.tx.send_replace(next);
    }

    fn persist(&self, set: &FavoritesSet) {
        if let Err(e) = self.storage.save(set.list()) {
            warn!("Failed to persist favorites, keeping in memory only: {}", e);
            let mut health = lock(&self.health);
            health.failures += 1;
            health.last_error = Some(e.to_string());
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn movie(id: i64, title: &str) -> MovieSummary {
        MovieSummary {
            id,
            title: title.to_string(),
            poster_path: Some(format!("/{id}.jpg")),
            backdrop_path: None,
            vote_average: 7.5,
            release_date: "2020-01-01".to_string(),
            overview: format!("About {title}"),
        }
    }

    struct FailingStorage {
        saves: Arc<AtomicUsize>,
    }

    impl FavoritesStorage for FailingStorage {
        fn load(&self) -> Result<Option<Vec<MovieSummary>>, PersistenceError> {
            Ok(None)
        }

        fn save(&self, _favorites: &[MovieSummary]) -> Result<(), PersistenceError> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            Err(PersistenceError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "quota exceeded",
            )))
        }
    }

    /// Shares one in-memory slot between store "processes".
    struct SharedMemory(Arc<MemoryStorage>);

    impl FavoritesStorage for SharedMemory {
        fn load(&self) -> Result<Option<Vec<MovieSummary>>, PersistenceError> {
            self.0.load()
        }

        fn save(&self, favorites: &[MovieSummary]) -> Result<(), PersistenceError> {
            self.0.save(favorites)
        }
    }

    #[test]
    fn add_overwrites_in_place() {
        let set = FavoritesSet::new()
            .with_added(movie(1, "Alien"))
            .with_added(movie(2, "Aliens"))
            .with_added(movie(1, "Alien (Director's Cut)"));
        let titles: Vec<_> = set.list().iter().map(|m| m.title.as_str()).collect();
        assert_eq!(titles, vec!["Alien (Director's Cut)", "Aliens"]);
    }

    #[test]
    fn last_operation_per_id_wins() {
        let ops: Vec<(bool, i64)> = vec![
            (true, 1),
            (true, 2),
            (false, 1),
            (true, 3),
            (true, 1),
            (false, 2),
            (false, 2),
            (true, 3),
            (false, 4),
        ];
        let mut set = FavoritesSet::new();
        for (add, id) in &ops {
            set = if *add {
                set.with_added(movie(*id, "m"))
            } else {
                set.with_removed(*id)
            };
        }
        for id in 1..=4 {
            let last = ops.iter().rev().find(|(_, i)| *i == id).map(|(a, _)| *a);
            assert_eq!(set.contains(id), last == Some(true), "id {id}");
        }
        let ids: Vec<_> = set.list().iter().map(|m| m.id).collect();
        let unique: std::collections::HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());
        assert_eq!(ids, vec![3, 1]);
    }

    #[test]
    fn removal_keeps_order_of_others() {
        let set = FavoritesSet::from_entries(vec![movie(1, "a"), movie(2, "b"), movie(3, "c")])
            .with_removed(2);
        let ids: Vec<_> = set.list().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[tokio::test]
    async fn remove_twice_is_harmless() {
        let store = FavoritesStore::init(MemoryStorage::new());
        store.add(movie(5, "Heat")).await;
        store.remove(5).await;
        let once = store.list();
        store.remove(5).await;
        assert_eq!(store.list(), once);
        assert!(!store.contains(5));
        assert_eq!(store.persistence_health().failures, 0);
    }

    #[tokio::test]
    async fn reload_yields_equal_set() {
        let memory = Arc::new(MemoryStorage::new());
        let store = FavoritesStore::init(SharedMemory(memory.clone()));
        store.add(movie(1, "Alien")).await;
        store.add(movie(2, "Aliens")).await;
        store.add(movie(3, "Alien 3")).await;
        store.remove(2).await;
        let before = store.snapshot();
        drop(store);

        let restarted = FavoritesStore::init(SharedMemory(memory));
        assert_eq!(restarted.snapshot(), before);
        assert!(restarted.contains(3));
    }

    #[tokio::test]
    async fn file_storage_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("movie-favorites.json");

        let store = FavoritesStore::init(JsonFileStorage::new(&path));
        store.add(movie(10, "Se7en")).await;
        store.add(movie(11, "Zodiac")).await;
        assert!(path.exists());
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.starts_with('['));
        let before = store.snapshot();
        store.dispose();

        let reloaded = FavoritesStore::init(JsonFileStorage::new(&path));
        assert_eq!(reloaded.snapshot(), before);
    }

    #[test]
    fn reads_web_client_envelope() {
        let raw = r#"{"state":{"favorites":[
            {"id":1,"title":"Alien","poster_path":null,"backdrop_path":null,"vote_average":8.1,"release_date":"1979-05-25","overview":"x"},
            {"id":1,"title":"Alien","poster_path":"/p.jpg","backdrop_path":null,"vote_average":8.1,"release_date":"1979-05-25","overview":"x"}
        ]},"version":0}"#;
        let store = FavoritesStore::init(MemoryStorage::with_raw(raw));
        let list = store.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].poster_path.as_deref(), Some("/p.jpg"));
    }

    #[test]
    fn unreadable_storage_starts_empty_and_is_reported() {
        let store = FavoritesStore::init(MemoryStorage::with_raw("{broken"));
        assert!(store.list().is_empty());
        let health = store.persistence_health();
        assert_eq!(health.failures, 1);
        assert!(health.last_error.unwrap().contains("unreadable"));
    }

    #[tokio::test]
    async fn save_failures_are_swallowed_but_recorded() {
        let saves = Arc::new(AtomicUsize::new(0));
        let store = FavoritesStore::init(FailingStorage {
            saves: saves.clone(),
        });
        store.add(movie(1, "Alien")).await;
        store.add(movie(2, "Aliens")).await;
        assert!(store.contains(1) && store.contains(2));
        assert_eq!(saves.load(Ordering::SeqCst), 2);
        let health = store.persistence_health();
        assert_eq!(health.failures, 2);
        assert!(health.last_error.unwrap().contains("quota exceeded"));
    }

    #[tokio::test]
    async fn subscribers_see_post_mutation_state() {
        let memory = Arc::new(MemoryStorage::new());
        let store = FavoritesStore::init(SharedMemory(memory.clone()));
        let mut rx = store.subscribe();
        store.add(movie(42, "Arrival")).await;
        assert!(rx.has_changed().unwrap());
        let seen = rx.borrow_and_update().clone();
        assert!(seen.contains(42));
        // Persisted before subscribers were notified.
        assert!(memory.raw().unwrap().contains("Arrival"));
    }

    #[tokio::test]
    async fn add_commits_even_if_the_caller_goes_away() {
        let store = FavoritesStore::init(MemoryStorage::new());
        let mut rx = store.subscribe();
        let pending = store.add(movie(7, "Ran"));
        // One poll hands the update to the blocking pool; then the caller gives up.
        let _ = tokio::time::timeout(Duration::ZERO, pending).await;
        rx.changed().await.unwrap();
        assert!(store.contains(7));
    }

    #[test]
    fn dispose_closes_subscriptions() {
        let store = FavoritesStore::init(MemoryStorage::new());
        let rx = store.subscribe();
        store.dispose();
        assert!(rx.has_changed().is_err());
    }
}
