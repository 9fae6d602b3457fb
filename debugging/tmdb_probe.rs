//! Query TMDB through the library client and print what the app would show.
//! Usage:
//!   cargo run --bin tmdb_probe -- movie <tmdb_id>
//!   cargo run --bin tmdb_probe -- trailer <tmdb_id>
//!   cargo run --bin tmdb_probe -- search <query> [pages]
//!   cargo run --bin tmdb_probe -- now-playing [pages]
//! Requires TMDB_BASE_URL and TMDB_READ_ACCESS_TOKEN in the environment (.env supported).

use anyhow::{Context, Result};
use cinescope::config::Config;
use cinescope::pagination::{FetchOutcome, PaginatedFeed, QueryContext};
use cinescope::tmdb::{MovieApi, TmdbClient};
use cinescope::trailer::{embed_url, select_trailer, watch_url};
use dotenvy::dotenv;
use serde_json::json;
use std::env;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Command {
    Movie,
    Trailer,
    Search,
    NowPlaying,
}

impl FromStr for Command {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "movie" => Ok(Command::Movie),
            "trailer" => Ok(Command::Trailer),
            "search" => Ok(Command::Search),
            "now-playing" => Ok(Command::NowPlaying),
            _ => Err(anyhow::anyhow!(
                "command must be one of 'movie', 'trailer', 'search', 'now-playing'"
            )),
        }
    }
}

fn usage() -> ! {
    eprintln!("Usage: cargo run --bin tmdb_probe -- movie <tmdb_id>");
    eprintln!("       cargo run --bin tmdb_probe -- trailer <tmdb_id>");
    eprintln!("       cargo run --bin tmdb_probe -- search <query> [pages]");
    eprintln!("       cargo run --bin tmdb_probe -- now-playing [pages]");
    std::process::exit(1);
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        usage();
    }
    let command = Command::from_str(&args[1])?;

    let config = Config::from_env().context("Invalid configuration")?;
    let client = Arc::new(TmdbClient::new(&config)?);

    match command {
        Command::Movie => {
            let id = movie_id(args.get(2))?;
            print_movie(client.as_ref(), id).await?
        }
        Command::Trailer => {
            let id = movie_id(args.get(2))?;
            print_trailer(client.as_ref(), id).await?
        }
        Command::Search => {
            let query = args.get(2).cloned().unwrap_or_else(|| usage());
            let pages = page_count(args.get(3))?;
            print_feed(client, QueryContext::Search(query), pages).await?
        }
        Command::NowPlaying => {
            let pages = page_count(args.get(2))?;
            print_feed(client, QueryContext::NowPlaying, pages).await?
        }
    }

    Ok(())
}

fn movie_id(arg: Option<&String>) -> Result<i64> {
    arg.ok_or_else(|| anyhow::anyhow!("missing tmdb_id"))?
        .parse()
        .context("tmdb_id must be an integer")
}

fn page_count(arg: Option<&String>) -> Result<u32> {
    match arg {
        Some(raw) => raw.parse().context("pages must be a positive integer"),
        None => Ok(1),
    }
}

async fn print_movie(client: &dyn MovieApi, id: i64) -> Result<()> {
    let details = client.movie_details(id).await?;
    let credits = client.movie_credits(id).await?;
    let cast: Vec<_> = credits
        .cast
        .iter()
        .take(10)
        .map(|c| json!({ "name": c.name, "character": c.character }))
        .collect();

    let output = json!({
        "id": details.summary.id,
        "title": details.summary.title,
        "tagline": details.tagline,
        "release_date": details.summary.release_date,
        "runtime": details.runtime,
        "vote_average": details.summary.vote_average,
        "primary_genre": details.primary_genre(),
        "poster_url": details.summary.poster_url(),
        "backdrop_url": details.summary.backdrop_url(),
        "cast": cast,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn print_trailer(client: &dyn MovieApi, id: i64) -> Result<()> {
    let videos = client.movie_videos(id).await?.results;
    let output = match select_trailer(&videos) {
        Some(video) => json!({
            "candidates": videos.len(),
            "name": video.name,
            "type": video.video_type,
            "official": video.official,
            "published_at": video.published_at,
            "embed_url": embed_url(video),
            "watch_url": watch_url(video),
        }),
        None => json!({ "candidates": videos.len(), "trailer": null }),
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn print_feed(client: Arc<TmdbClient>, context: QueryContext, pages: u32) -> Result<()> {
    let feed = PaginatedFeed::new(client, context);
    for _ in 0..pages.max(1) {
        match feed.fetch_next().await {
            FetchOutcome::Failed(e) => return Err(e.into()),
            FetchOutcome::Skipped => break,
            FetchOutcome::Appended { .. } | FetchOutcome::Discarded => {}
        }
    }
    let snapshot = feed.snapshot().await;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}
