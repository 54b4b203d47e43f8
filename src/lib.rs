//! Aggregates zsh extended-history files into one SQLite store with
//! full-text search, plus a cache of natural-language requests to the shell
//! commands they produced.

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod history;
pub mod ingest;
pub mod integration;
pub mod keywords;
pub mod llm;
pub mod models;
pub mod query;
pub mod selector;
pub mod wizard;

pub use error::{Error, Result};
