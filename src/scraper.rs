//! The aggregation loop.
//!
//! Every tick takes the feed that has waited longest, stamps it as fetched,
//! downloads it and reports what it found. One feed per tick: covering N
//! feeds takes at least N ticks.

use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::db::{Database, Feed};
use crate::error::{GatorError, Result};
use crate::fetcher::{Fetcher, RssFeed};

/// Cooperative stop signal for the scrape loop.
///
/// Triggering it aborts the wait between ticks. A tick that is already
/// running is allowed to finish.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// A signal plus the sender that triggers it.
    pub fn channel() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        let (_, shutdown) = Self::channel();
        shutdown
    }

    #[cfg(test)]
    pub(crate) fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the signal fires. Pends forever if the sender is gone
    /// without having fired.
    pub async fn wait(&mut self) {
        if self.rx.wait_for(|stop| *stop).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// What a single tick did.
#[derive(Debug)]
pub enum TickOutcome {
    /// No feeds registered; nothing to do.
    Idle,
    Fetched {
        feed_name: String,
        items: usize,
        new_posts: usize,
    },
    Failed(GatorError),
}

/// Running totals for one `run` of the loop.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScrapeStats {
    pub ticks: u64,
    pub idle: u64,
    pub fetched: u64,
    pub failed: u64,
    pub new_posts: u64,
}

impl ScrapeStats {
    fn record(&mut self, outcome: &TickOutcome) {
        self.ticks += 1;
        match outcome {
            TickOutcome::Idle => self.idle += 1,
            TickOutcome::Fetched { new_posts, .. } => {
                self.fetched += 1;
                self.new_posts += *new_posts as u64;
            }
            TickOutcome::Failed(_) => self.failed += 1,
        }
    }
}

pub struct Scraper {
    db: Arc<Database>,
    fetcher: Fetcher,
}

impl Scraper {
    pub fn new(db: Arc<Database>, fetcher: Fetcher) -> Self {
        Self { db, fetcher }
    }

    /// Tick every `interval` until `shutdown` fires.
    ///
    /// The first tick runs immediately. Missed ticks are skipped rather than
    /// replayed, so a slow fetch never causes a burst of catch-up work.
    pub async fn run(
        &self,
        interval: Duration,
        out: &mut (dyn Write + Send),
        mut shutdown: Shutdown,
    ) -> ScrapeStats {
        let mut stats = ScrapeStats::default();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(interval = ?interval, "scrape loop started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => {
                    info!(ticks = stats.ticks, "scrape loop shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let outcome = self.tick(out).await;
                    stats.record(&outcome);
                }
            }
        }

        stats
    }

    /// Run one Select, Mark, Fetch, Report cycle. Errors are logged and
    /// returned in the outcome; they never escape.
    pub async fn tick(&self, out: &mut (dyn Write + Send)) -> TickOutcome {
        let feed = match self.db.get_next_feed_to_fetch().await {
            Ok(feed) => feed,
            Err(GatorError::NoFeeds) => {
                info!("no feeds registered, waiting for the next tick");
                return TickOutcome::Idle;
            }
            Err(err) => {
                warn!(error = %err, retryable = err.is_retryable(), "feed selection failed");
                return TickOutcome::Failed(err);
            }
        };

        self.scrape_feed(&feed, out).await
    }

    /// Mark, fetch and report a single feed.
    async fn scrape_feed(&self, feed: &Feed, out: &mut (dyn Write + Send)) -> TickOutcome {
        match self.fetch_and_store(feed).await {
            Ok((document, new_posts)) => {
                if let Err(err) = print_items(feed, &document, out) {
                    warn!(feed = %feed.name, error = %err, "failed to print feed items");
                }
                TickOutcome::Fetched {
                    feed_name: feed.name.clone(),
                    items: document.items.len(),
                    new_posts,
                }
            }
            Err(err) => {
                warn!(
                    feed = %feed.name,
                    error = %err,
                    retryable = err.is_retryable(),
                    "scrape tick failed"
                );
                TickOutcome::Failed(err)
            }
        }
    }

    async fn fetch_and_store(&self, feed: &Feed) -> Result<(RssFeed, usize)> {
        // Claim before the network call so a hung feed drops to the back.
        self.db.mark_feed_fetched(feed.id).await?;

        info!(feed = %feed.name, url = %feed.url, "fetching feed");
        let document = self.fetcher.fetch(&feed.url).await?;

        let new_posts = self.store_posts(feed, &document).await;
        Ok((document, new_posts))
    }

    /// Store the items as posts. Returns how many were new.
    async fn store_posts(&self, feed: &Feed, document: &RssFeed) -> usize {
        let mut new_posts = 0;
        for item in &document.items {
            if item.link.is_empty() {
                warn!(feed = %feed.name, title = %item.title, "skipping item with no link");
                continue;
            }

            let description = Some(item.description.as_str()).filter(|d| !d.is_empty());
            match self
                .db
                .create_post(feed.id, &item.title, &item.link, description, item.published)
                .await
            {
                Ok(true) => new_posts += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(feed = %feed.name, link = %item.link, error = %e, "failed to save post")
                }
            }
        }

        info!(feed = %feed.name, items = document.items.len(), new_posts, "feed scraped");
        new_posts
    }
}

fn print_items(
    feed: &Feed,
    document: &RssFeed,
    out: &mut (dyn Write + Send),
) -> io::Result<()> {
    writeln!(
        out,
        "Found {} posts in feed '{}':",
        document.items.len(),
        feed.name
    )?;
    for item in &document.items {
        writeln!(out, "* {}", item.title)?;
    }
    Ok(())
}
