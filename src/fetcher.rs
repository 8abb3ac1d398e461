use std::time::Duration;

use chrono::{DateTime, Utc};
use feed_rs::parser;
use html_escape::decode_html_entities;
use reqwest::Client;
use tracing::debug;

use crate::error::{GatorError, Result};

/// User agent sent with every feed request unless configured otherwise.
pub const DEFAULT_USER_AGENT: &str = "gator";

/// A fetched feed, normalized to the RSS channel/item shape.
#[derive(Debug, Clone, PartialEq)]
pub struct RssFeed {
    pub title: String,
    pub link: String,
    pub description: String,
    pub items: Vec<RssItem>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RssItem {
    pub title: String,
    pub link: String,
    pub description: String,
    pub published: Option<DateTime<Utc>>,
}

pub struct Fetcher {
    client: Client,
}

impl Fetcher {
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| GatorError::Network(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    /// Download and parse one feed.
    ///
    /// Anything that goes wrong before the body is in hand is a
    /// [`GatorError::Network`]; a body that is not a readable feed is a
    /// [`GatorError::Parse`].
    pub async fn fetch(&self, url: &str) -> Result<RssFeed> {
        debug!(url, "requesting feed");

        let response = self.client.get(url).send().await?.error_for_status()?;
        let bytes = response.bytes().await?;

        Self::parse(&bytes)
    }

    pub fn parse(bytes: &[u8]) -> Result<RssFeed> {
        let parsed = parser::parse(bytes)?;

        let items = parsed
            .entries
            .into_iter()
            .map(|entry| RssItem {
                title: entry
                    .title
                    .map(|t| unescape_html(&t.content))
                    .unwrap_or_default(),
                link: entry
                    .links
                    .first()
                    .map(|l| l.href.clone())
                    .unwrap_or_default(),
                description: entry
                    .summary
                    .map(|t| unescape_html(&t.content))
                    .unwrap_or_default(),
                published: entry.published.or(entry.updated),
            })
            .collect();

        Ok(RssFeed {
            title: parsed
                .title
                .map(|t| unescape_html(&t.content))
                .unwrap_or_default(),
            link: parsed
                .links
                .first()
                .map(|l| l.href.clone())
                .unwrap_or_default(),
            description: parsed
                .description
                .map(|t| unescape_html(&t.content))
                .unwrap_or_default(),
            items,
        })
    }
}

/// Decode HTML entities left in feed text after XML parsing.
///
/// Each entity is decoded on its own; a bare `&` or an unknown entity is
/// left in place without affecting the rest of the text.
pub fn unescape_html(text: &str) -> String {
    decode_html_entities(text).into_owned()
}
