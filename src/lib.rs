pub mod app;
pub mod config;
pub mod error;
pub mod favorites;
pub mod models;
pub mod pagination;
pub mod query;
pub mod search;
pub mod tmdb;
pub mod trailer;
