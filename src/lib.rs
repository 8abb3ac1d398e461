//! Gator - A command-line RSS feed aggregator
//!
//! Users register, add and follow feeds; the `agg` command polls the feed
//! that has waited longest on every tick and stores the new items as posts.

pub mod commands;
pub mod config;
pub mod db;
pub mod duration;
pub mod error;
pub mod fetcher;
pub mod scraper;

pub use error::{GatorError, Result};
