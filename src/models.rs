use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

const IMAGE_BASE: &str = "https://image.tmdb.org/t/p";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovieSummary {
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub poster_path: Option<String>,
    #[serde(default)]
    pub backdrop_path: Option<String>,
    #[serde(default)]
    pub vote_average: f64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub release_date: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub overview: String,
}

impl MovieSummary {
    pub fn poster_url(&self) -> Option<String> {
        image_url(self.poster_path.as_deref(), ImageSize::W500)
    }

    pub fn backdrop_url(&self) -> Option<String> {
        image_url(self.backdrop_path.as_deref(), ImageSize::Original)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Genre {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovieDetails {
    #[serde(flatten)]
    pub summary: MovieSummary,
    #[serde(default)]
    pub genres: Vec<Genre>,
    /// Minutes; upstream reports `null` for unreleased titles.
    #[serde(default, deserialize_with = "null_as_default")]
    pub runtime: u32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tagline: String,
}

impl MovieDetails {
    pub fn primary_genre(&self) -> Option<&str> {
        self.genres.first().map(|g| g.name.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CastMember {
    pub id: i64,
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub character: String,
    #[serde(default)]
    pub profile_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credits {
    #[serde(default)]
    pub cast: Vec<CastMember>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Video {
    pub id: String,
    /// Identifier on the hosting site (the YouTube video id for YouTube entries).
    pub key: String,
    pub name: String,
    pub site: String,
    #[serde(rename = "type")]
    pub video_type: String,
    #[serde(default)]
    pub official: bool,
    pub published_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoList {
    #[serde(default)]
    pub results: Vec<Video>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub page: u32,
    #[serde(default = "Vec::new")]
    pub results: Vec<T>,
    #[serde(default)]
    pub total_pages: u32,
    #[serde(default)]
    pub total_results: u32,
}

impl<T> Page<T> {
    pub fn is_last(&self) -> bool {
        self.page >= self.total_pages
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TmdbErrorResponse {
    #[serde(default)]
    pub status_code: i64,
    pub status_message: String,
    #[serde(default)]
    pub success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSize {
    W185,
    W500,
    Original,
}

impl ImageSize {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageSize::W185 => "w185",
            ImageSize::W500 => "w500",
            ImageSize::Original => "original",
        }
    }
}

pub fn image_url(path: Option<&str>, size: ImageSize) -> Option<String> {
    path.filter(|p| !p.is_empty())
        .map(|p| format!("{IMAGE_BASE}/{}{p}", size.as_str()))
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn details_flatten_summary_and_tolerate_nulls() {
        let json = r#"{
            "id": 155,
            "title": "The Dark Knight",
            "poster_path": "/qJ2tW6WMUDux911r6m7haRef0WH.jpg",
            "backdrop_path": null,
            "vote_average": 8.5,
            "release_date": "2008-07-16",
            "overview": "Batman raises the stakes.",
            "genres": [{"id": 18, "name": "Drama"}, {"id": 28, "name": "Action"}],
            "runtime": null,
            "tagline": null
        }"#;
        let details: MovieDetails = serde_json::from_str(json).unwrap();
        assert_eq!(details.summary.id, 155);
        assert_eq!(details.summary.backdrop_path, None);
        assert_eq!(details.runtime, 0);
        assert_eq!(details.tagline, "");
        assert_eq!(details.primary_genre(), Some("Drama"));
        assert_eq!(
            details.summary.poster_url().as_deref(),
            Some("https://image.tmdb.org/t/p/w500/qJ2tW6WMUDux911r6m7haRef0WH.jpg")
        );
        assert_eq!(details.summary.backdrop_url(), None);
    }

    #[test]
    fn empty_image_path_is_absent() {
        assert_eq!(image_url(Some(""), ImageSize::Original), None);
        assert_eq!(image_url(None, ImageSize::W185), None);
    }

    #[test]
    fn empty_page_is_last() {
        let page: Page<MovieSummary> =
            serde_json::from_str(r#"{"page":1,"results":[],"total_pages":0,"total_results":0}"#)
                .unwrap();
        assert!(page.is_last());
        assert!(page.results.is_empty());
    }
}
