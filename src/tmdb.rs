use crate::config::Config;
use crate::error::ClientError;
use crate::models::{Credits, MovieDetails, MovieSummary, Page, TmdbErrorResponse, VideoList};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Upstream operations the browsing flows depend on. Implemented by
/// [`TmdbClient`] and by fakes in tests.
#[async_trait]
pub trait MovieApi: Send + Sync {
    async fn now_playing(&self, page: u32) -> Result<Page<MovieSummary>, ClientError>;
    async fn popular(&self, page: u32) -> Result<Page<MovieSummary>, ClientError>;
    async fn trending(&self) -> Result<Page<MovieSummary>, ClientError>;
    async fn search_movies(&self, query: &str, page: u32)
        -> Result<Page<MovieSummary>, ClientError>;
    async fn movie_details(&self, id: i64) -> Result<MovieDetails, ClientError>;
    async fn movie_credits(&self, id: i64) -> Result<Credits, ClientError>;
    async fn movie_videos(&self, id: i64) -> Result<VideoList, ClientError>;
}

#[derive(Debug, Clone)]
pub struct TmdbClient {
    client: Client,
    base_url: Url,
    access_token: Option<String>,
    timeout: Duration,
}

impl TmdbClient {
    pub fn new(config: &Config) -> Result<Self, ClientError> {
        let user_agent = format!("cinescope/{}", env!("CARGO_PKG_VERSION"));
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(config.request_timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| ClientError::Configuration(format!("failed to build HTTP client: {e}")))?;
        if config.access_token.is_none() {
            warn!("No upstream access token configured; requests will be rejected upstream");
        }
        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            access_token: config.access_token.clone(),
            timeout: config.request_timeout,
        })
    }

    /// GET `path` relative to the base URL and decode the JSON body.
    ///
    /// No retries happen here; callers decide on retry policy.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, ClientError> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| ClientError::Configuration(format!("bad request path '{path}': {e}")))?;

        let mut request = self.client.get(url).query(params);
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }
        debug!(path = %path, "Upstream request");

        let res = request.send().await.map_err(|e| self.transport_error(e))?;
        let status = res.status();
        let text = res.text().await.map_err(|e| self.transport_error(e))?;

        if !status.is_success() {
            let message = error_message(&text)
                .unwrap_or_else(|| format!("Request failed with status code {}", status.as_u16()));
            warn!("[API Error] {}: {}", path, message);
            return Err(ClientError::Http {
                status: status.as_u16(),
                message,
            });
        }

        serde_json::from_str(&text).map_err(|e| ClientError::Decode(format!("{path}: {e}")))
    }

    fn transport_error(&self, err: reqwest::Error) -> ClientError {
        if err.is_timeout() {
            ClientError::Timeout(self.timeout.as_secs())
        } else {
            ClientError::Network(err.to_string())
        }
    }

    async fn get_page(
        &self,
        path: &str,
        mut params: Vec<(&str, String)>,
        page: u32,
    ) -> Result<Page<MovieSummary>, ClientError> {
        params.push(("page", page.max(1).to_string()));
        self.get_json(path, &params).await
    }
}

#[async_trait]
impl MovieApi for TmdbClient {
    async fn now_playing(&self, page: u32) -> Result<Page<MovieSummary>, ClientError> {
        self.get_page("movie/now_playing", Vec::new(), page).await
    }

    async fn popular(&self, page: u32) -> Result<Page<MovieSummary>, ClientError> {
        self.get_page("movie/popular", Vec::new(), page).await
    }

    async fn trending(&self) -> Result<Page<MovieSummary>, ClientError> {
        self.get_json("trending/movie/day", &[]).await
    }

    async fn search_movies(
        &self,
        query: &str,
        page: u32,
    ) -> Result<Page<MovieSummary>, ClientError> {
        let params = vec![
            ("query", query.to_string()),
            ("include_adult", "false".to_string()),
        ];
        self.get_page("search/movie", params, page).await
    }

    async fn movie_details(&self, id: i64) -> Result<MovieDetails, ClientError> {
        let path = format!("movie/{id}");
        self.get_json(&path, &[]).await.map_err(not_found_on_404)
    }

    async fn movie_credits(&self, id: i64) -> Result<Credits, ClientError> {
        let path = format!("movie/{id}/credits");
        self.get_json(&path, &[]).await.map_err(not_found_on_404)
    }

    async fn movie_videos(&self, id: i64) -> Result<VideoList, ClientError> {
        let path = format!("movie/{id}/videos");
        self.get_json(&path, &[]).await.map_err(not_found_on_404)
    }
}

fn error_message(body: &str) -> Option<String> {
    serde_json::from_str::<TmdbErrorResponse>(body)
        .ok()
        .map(|e| e.status_message)
        .filter(|m| !m.trim().is_empty())
}

/// Single-resource endpoints answer 404 for unknown ids; list endpoints keep the raw status.
fn not_found_on_404(err: ClientError) -> ClientError {
    match err {
        ClientError::Http { status: 404, .. } => ClientError::NotFound,
        other => other,
    }
}
