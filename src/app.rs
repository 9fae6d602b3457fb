use crate::config::Config;
use crate::error::ClientError;
use crate::favorites::{FavoritesStore, JsonFileStorage};
use crate::models::{Credits, MovieDetails, MovieSummary, Video};
use crate::pagination::{FeedRegistry, FeedSnapshot, QueryContext};
use crate::query::{with_retry, QueryCache, QueryKey};
use crate::search::{normalize_query, SearchDebouncer};
use crate::tmdb::{MovieApi, TmdbClient};
use crate::trailer::{embed_url, select_trailer, watch_url, TrailerStore};
use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

const MAX_BODY_BYTES: usize = 64 * 1024;
const VIDEOS_STALE_TIME: Duration = Duration::from_secs(5 * 60);
const TRAILER_RETRIES: u32 = 2;

#[derive(Clone)]
pub struct AppState {
    pub api: Arc<dyn MovieApi>,
    pub feeds: Arc<FeedRegistry>,
    pub favorites: Arc<FavoritesStore>,
    pub trailer: Arc<TrailerStore>,
    pub lists: Arc<QueryCache<Vec<MovieSummary>>>,
    pub details: Arc<QueryCache<MovieDetails>>,
    pub credits: Arc<QueryCache<Credits>>,
    pub videos: Arc<QueryCache<Vec<Video>>>,
    pub debouncer: Arc<SearchDebouncer>,
}

impl AppState {
    pub fn new(api: Arc<dyn MovieApi>, favorites: FavoritesStore, search_debounce: Duration) -> Self {
        Self {
            feeds: Arc::new(FeedRegistry::new(api.clone())),
            api,
            favorites: Arc::new(favorites),
            trailer: Arc::new(TrailerStore::init()),
            lists: Arc::new(QueryCache::new()),
            details: Arc::new(QueryCache::new()),
            credits: Arc::new(QueryCache::new()),
            videos: Arc::new(QueryCache::with_stale_time(VIDEOS_STALE_TIME)),
            debouncer: Arc::new(SearchDebouncer::new(search_debounce)),
        }
    }
}

pub async fn run_server(config: Config) -> Result<()> {
    let api: Arc<dyn MovieApi> =
        Arc::new(TmdbClient::new(&config).context("Failed to build upstream client")?);
    let favorites = FavoritesStore::init(JsonFileStorage::new(&config.favorites_path));
    info!("Favorites stored at {}", config.favorites_path.display());

    let state = AppState::new(api, favorites, config.search_debounce);
    let favorites = state.favorites.clone();
    let trailer = state.trailer.clone();
    let app = build_router(state);

    info!("Listening on {}", config.bind_addr);
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Ok(trailer) = Arc::try_unwrap(trailer) {
        trailer.dispose();
    }
    match Arc::try_unwrap(favorites) {
        Ok(store) => store.dispose(),
        Err(_) => warn!("Favorites store still shared at shutdown; skipping final flush"),
    }
    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/movies/trending", get(trending))
        .route("/movies/popular", get(popular))
        .route("/movies/now-playing", get(now_playing))
        .route("/movies/now-playing/next", post(now_playing_next))
        .route("/movies/:id", get(movie_details))
        .route("/movies/:id/credits", get(movie_credits))
        .route("/movies/:id/videos", get(movie_videos))
        .route("/movies/:id/trailer", get(movie_trailer))
        .route("/search", get(search))
        .route("/search/next", post(search_next))
        .route("/favorites", get(list_favorites).put(add_favorite))
        .route(
            "/favorites/:id",
            get(favorite_status).delete(remove_favorite),
        )
        .route("/trailer", get(trailer_state))
        .route("/trailer/open", post(open_trailer))
        .route("/trailer/close", post(close_trailer))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

/// Full-page failure: the client offers retry and a way home.
fn page_error(err: &ClientError) -> Response {
    match err {
        ClientError::NotFound => (
            StatusCode::NOT_FOUND,
            Json(json!({"status": "not_found", "message": "Movie not found"})),
        )
            .into_response(),
        ClientError::Configuration(_) => {
            error!("Configuration problem: {}", err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"status": "error", "message": err.to_string()})),
            )
                .into_response()
        }
        _ => (
            StatusCode::BAD_GATEWAY,
            Json(json!({
                "status": "error",
                "message": err.to_string(),
                "actions": ["retry", "home"],
            })),
        )
            .into_response(),
    }
}

/// Secondary failure rendered in place; the rest of the page stays usable.
fn inline_error(err: &ClientError) -> Response {
    (
        StatusCode::BAD_GATEWAY,
        Json(json!({"status": "error", "scope": "inline", "message": err.to_string()})),
    )
        .into_response()
}

fn feed_response(snapshot: FeedSnapshot) -> Response {
    (StatusCode::OK, Json(snapshot)).into_response()
}

async fn trending(State(state): State<AppState>) -> Response {
    let api = state.api.clone();
    let result = state
        .lists
        .get_or_fetch(QueryKey::Trending, || async move {
            api.trending().await.map(|p| p.results)
        })
        .await;
    match result {
        Ok(movies) => Json(json!({ "results": movies })).into_response(),
        Err(e) => page_error(&e),
    }
}

async fn popular(State(state): State<AppState>) -> Response {
    let api = state.api.clone();
    let result = state
        .lists
        .get_or_fetch(QueryKey::Popular, || async move {
            api.popular(1).await.map(|p| p.results)
        })
        .await;
    match result {
        Ok(movies) => Json(json!({ "results": movies })).into_response(),
        Err(e) => page_error(&e),
    }
}

async fn now_playing(State(state): State<AppState>) -> Response {
    let feed = state.feeds.open(QueryContext::NowPlaying).await;
    feed_response(feed.snapshot().await)
}

async fn now_playing_next(State(state): State<AppState>) -> Response {
    let feed = state.feeds.feed_for(QueryContext::NowPlaying).await;
    feed.fetch_next().await;
    feed_response(feed.snapshot().await)
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    #[serde(default)]
    query: String,
}

fn empty_query() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"status": "error", "message": "query must not be empty"})),
    )
        .into_response()
}

async fn search(State(state): State<AppState>, Query(params): Query<SearchParams>) -> Response {
    let Some(term) = normalize_query(&params.query) else {
        return empty_query();
    };
    if !state.debouncer.settle().await {
        return (
            StatusCode::ACCEPTED,
            Json(json!({"status": "superseded", "query": term})),
        )
            .into_response();
    }
    info!("Searching for '{}'", term);
    let feed = state.feeds.open(QueryContext::Search(term)).await;
    feed_response(feed.snapshot().await)
}

async fn search_next(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Response {
    let Some(term) = normalize_query(&params.query) else {
        return empty_query();
    };
    let feed = state.feeds.feed_for(QueryContext::Search(term)).await;
    feed.fetch_next().await;
    feed_response(feed.snapshot().await)
}

async fn load_details(state: &AppState, id: i64) -> Result<MovieDetails, ClientError> {
    let api = state.api.clone();
    state
        .details
        .get_or_fetch(QueryKey::Details(id), || async move { api.movie_details(id).await })
        .await
}

async fn load_videos(state: &AppState, id: i64) -> Result<Vec<Video>, ClientError> {
    let api = state.api.clone();
    state
        .videos
        .get_or_fetch(QueryKey::Videos(id), || async move {
            with_retry(TRAILER_RETRIES, || {
                let api = api.clone();
                async move { api.movie_videos(id).await.map(|list| list.results) }
            })
            .await
        })
        .await
}

async fn movie_details(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match load_details(&state, id).await {
        Ok(movie) => Json(json!({
            "poster_url": movie.summary.poster_url(),
            "backdrop_url": movie.summary.backdrop_url(),
            "primary_genre": movie.primary_genre(),
            "is_favorite": state.favorites.contains(id),
            "movie": movie,
        }))
        .into_response(),
        Err(e) => page_error(&e),
    }
}

async fn movie_credits(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    let api = state.api.clone();
    let result = state
        .credits
        .get_or_fetch(QueryKey::Credits(id), || async move { api.movie_credits(id).await })
        .await;
    match result {
        Ok(credits) => Json(credits).into_response(),
        Err(e) => inline_error(&e),
    }
}

async fn movie_videos(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match load_videos(&state, id).await {
        Ok(videos) => Json(json!({ "results": videos })).into_response(),
        Err(e) => inline_error(&e),
    }
}

async fn movie_trailer(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match load_videos(&state, id).await {
        Ok(videos) => {
            let trailer = select_trailer(&videos).map(|v| {
                json!({
                    "video": v,
                    "embed_url": embed_url(v),
                    "watch_url": watch_url(v),
                })
            });
            Json(json!({ "movie_id": id, "trailer": trailer })).into_response()
        }
        Err(e) => inline_error(&e),
    }
}

async fn list_favorites(State(state): State<AppState>) -> Response {
    Json(json!({
        "favorites": state.favorites.list(),
        "persistence": state.favorites.persistence_health(),
    }))
    .into_response()
}

async fn add_favorite(State(state): State<AppState>, Json(movie): Json<MovieSummary>) -> Response {
    let id = movie.id;
    state.favorites.add(movie).await;
    Json(json!({ "movie_id": id, "is_favorite": true })).into_response()
}

async fn favorite_status(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    Json(json!({ "movie_id": id, "is_favorite": state.favorites.contains(id) })).into_response()
}

async fn remove_favorite(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    state.favorites.remove(id).await;
    Json(json!({ "movie_id": id, "is_favorite": false })).into_response()
}

#[derive(Debug, Deserialize)]
struct OpenTrailer {
    movie_id: i64,
    #[serde(default)]
    movie_title: String,
}

async fn trailer_state(State(state): State<AppState>) -> Response {
    Json(state.trailer.current()).into_response()
}

async fn open_trailer(State(state): State<AppState>, Json(req): Json<OpenTrailer>) -> Response {
    state.trailer.open(req.movie_id, req.movie_title);
    Json(state.trailer.current()).into_response()
}

async fn close_trailer(State(state): State<AppState>) -> Response {
    state.trailer.close();
    Json(state.trailer.current()).into_response()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        term.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Shutdown signal received (Ctrl+C)");
        }
        _ = terminate => {
            info!("Shutdown signal received (SIGTERM)");
        }
    }
}
