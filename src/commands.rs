//! Command registry and handlers.
//!
//! Each verb maps to a [`CommandKind`]. Kinds that act on behalf of the
//! logged-in user declare it through [`CommandKind::requires_login`], and the
//! dispatcher resolves that user once before calling the handler.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::config::Config;
use crate::db::{Database, User};
use crate::duration::parse_duration;
use crate::error::{GatorError, Result};
use crate::fetcher::Fetcher;
use crate::scraper::{Scraper, Shutdown};

const DEFAULT_BROWSE_LIMIT: i64 = 2;

/// Everything a handler may touch.
pub struct State {
    pub db: Arc<Database>,
    pub config: Config,
    /// Where `config` is persisted on login/register.
    pub config_path: PathBuf,
    pub shutdown: Shutdown,
}

impl State {
    pub fn new(
        db: Arc<Database>,
        config: Config,
        config_path: PathBuf,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            db,
            config,
            config_path,
            shutdown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Login,
    Register,
    Reset,
    Users,
    Agg,
    AddFeed,
    Feeds,
    Follow,
    Following,
    Unfollow,
    Browse,
}

impl CommandKind {
    pub fn requires_login(self) -> bool {
        matches!(
            self,
            CommandKind::AddFeed
                | CommandKind::Follow
                | CommandKind::Following
                | CommandKind::Unfollow
                | CommandKind::Browse
        )
    }
}

pub struct Commands {
    handlers: HashMap<String, CommandKind>,
}

impl Default for Commands {
    fn default() -> Self {
        let mut commands = Self::new();
        commands.register("login", CommandKind::Login);
        commands.register("register", CommandKind::Register);
        commands.register("reset", CommandKind::Reset);
        commands.register("users", CommandKind::Users);
        commands.register("agg", CommandKind::Agg);
        commands.register("addfeed", CommandKind::AddFeed);
        commands.register("feeds", CommandKind::Feeds);
        commands.register("follow", CommandKind::Follow);
        commands.register("following", CommandKind::Following);
        commands.register("unfollow", CommandKind::Unfollow);
        commands.register("browse", CommandKind::Browse);
        commands
    }
}

impl Commands {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: &str, kind: CommandKind) {
        self.handlers.insert(name.to_string(), kind);
    }

    /// Registered names, sorted.
    #[cfg(test)]
    pub(crate) fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub async fn run(
        &self,
        state: &mut State,
        name: &str,
        args: &[String],
        out: &mut (dyn Write + Send),
    ) -> Result<()> {
        let kind = *self
            .handlers
            .get(name)
            .ok_or_else(|| GatorError::UnknownCommand(name.to_string()))?;

        let user = if kind.requires_login() {
            Some(current_user(state).await?)
        } else {
            None
        };

        debug!(command = name, ?kind, "dispatching");

        match (kind, user) {
            (CommandKind::Login, _) => handle_login(state, args, out).await,
            (CommandKind::Register, _) => handle_register(state, args, out).await,
            (CommandKind::Reset, _) => handle_reset(state, out).await,
            (CommandKind::Users, _) => handle_users(state, out).await,
            (CommandKind::Agg, _) => handle_agg(state, args, out).await,
            (CommandKind::Feeds, _) => handle_feeds(state, out).await,
            (CommandKind::AddFeed, Some(user)) => {
                handle_add_feed(state, &user, args, out).await
            }
            (CommandKind::Follow, Some(user)) => handle_follow(state, &user, args, out).await,
            (CommandKind::Following, Some(user)) => handle_following(state, &user, out).await,
            (CommandKind::Unfollow, Some(user)) => {
                handle_unfollow(state, &user, args, out).await
            }
            (CommandKind::Browse, Some(user)) => handle_browse(state, &user, args, out).await,
            (_, None) => Err(GatorError::AuthRequired(format!(
                "'{}' needs a user",
                name
            ))),
        }
    }
}

/// Resolve the logged-in user from config and storage.
pub async fn current_user(state: &State) -> Result<User> {
    let name = state.config.current_user().ok_or_else(|| {
        GatorError::AuthRequired(
            "no user is logged in; run `register <name>` or `login <name>`".to_string(),
        )
    })?;

    match state.db.get_user(name).await {
        Ok(user) => Ok(user),
        Err(GatorError::NotFound(_)) => Err(GatorError::AuthRequired(format!(
            "current user '{}' no longer exists",
            name
        ))),
        Err(e) => Err(e),
    }
}

fn arg<'a>(args: &'a [String], index: usize, usage: &str) -> Result<&'a str> {
    args.get(index)
        .map(String::as_str)
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| GatorError::Usage(usage.to_string()))
}

async fn handle_login(
    state: &mut State,
    args: &[String],
    out: &mut (dyn Write + Send),
) -> Result<()> {
    let name = arg(args, 0, "login <username>")?;

    let user = state.db.get_user(name).await?;
    state.config.set_user(&user.name, &state.config_path)?;

    debug!(user = %user.name, "logged in");
    writeln!(out, "User set to {}", user.name)?;
    Ok(())
}

async fn handle_register(
    state: &mut State,
    args: &[String],
    out: &mut (dyn Write + Send),
) -> Result<()> {
    let name = arg(args, 0, "register <username>")?;

    let user = state.db.create_user(name).await?;
    state.config.set_user(&user.name, &state.config_path)?;

    debug!(user = %user.name, id = %user.id, "registered user");
    writeln!(out, "Username {} has been created!", user.name)?;
    Ok(())
}

async fn handle_reset(state: &mut State, out: &mut (dyn Write + Send)) -> Result<()> {
    state.db.reset().await?;
    writeln!(out, "Database reset successfully")?;
    Ok(())
}

async fn handle_users(state: &mut State, out: &mut (dyn Write + Send)) -> Result<()> {
    let current = state.config.current_user();
    for user in state.db.get_users().await? {
        if Some(user.name.as_str()) == current {
            writeln!(out, "* {} (current)", user.name)?;
        } else {
            writeln!(out, "* {}", user.name)?;
        }
    }
    Ok(())
}

async fn handle_agg(
    state: &mut State,
    args: &[String],
    out: &mut (dyn Write + Send),
) -> Result<()> {
    let interval = parse_duration(arg(args, 0, "agg <time_between_reqs>")?)?;
    if interval.is_zero() {
        return Err(GatorError::Usage(
            "agg <time_between_reqs> must be greater than zero".to_string(),
        ));
    }

    let fetcher = Fetcher::new(
        Duration::from_secs(state.config.request_timeout_secs),
        &state.config.user_agent,
    )?;
    let scraper = Scraper::new(state.db.clone(), fetcher);

    writeln!(out, "Collecting feeds every {:?}", interval)?;
    let stats = scraper.run(interval, out, state.shutdown.clone()).await;
    info!(?stats, "aggregation stopped");
    Ok(())
}

async fn handle_add_feed(
    state: &mut State,
    user: &User,
    args: &[String],
    out: &mut (dyn Write + Send),
) -> Result<()> {
    const USAGE: &str = "addfeed <name> <url>";
    let name = arg(args, 0, USAGE)?;
    let url = arg(args, 1, USAGE)?;

    let feed = state.db.create_feed(name, url, user.id).await?;
    writeln!(
        out,
        "Feed '{}' with URL '{}' has been created!",
        feed.name, feed.url
    )?;

    let follow = state.db.create_feed_follow(user.id, feed.id).await?;
    writeln!(out, "{} is now following '{}'", follow.user_name, follow.feed_name)?;
    Ok(())
}

async fn handle_feeds(state: &mut State, out: &mut (dyn Write + Send)) -> Result<()> {
    let feeds = state.db.get_feeds().await?;
    if feeds.is_empty() {
        writeln!(out, "No feeds yet. Add one with `addfeed <name> <url>`.")?;
        return Ok(());
    }
    for feed in feeds {
        writeln!(out, "* {} ({}) added by {}", feed.name, feed.url, feed.user_name)?;
    }
    Ok(())
}

async fn handle_follow(
    state: &mut State,
    user: &User,
    args: &[String],
    out: &mut (dyn Write + Send),
) -> Result<()> {
    let url = arg(args, 0, "follow <url>")?;

    let feed = state.db.get_feed_by_url(url).await?;
    let follow = state
        .db
        .create_feed_follow(user.id, feed.id)
        .await
        .map_err(|e| match e {
            GatorError::Conflict(_) => {
                GatorError::Conflict(format!("{}'s follow of '{}'", user.name, feed.name))
            }
            other => other,
        })?;

    writeln!(out, "{} is now following '{}'", follow.user_name, follow.feed_name)?;
    Ok(())
}

async fn handle_following(
    state: &mut State,
    user: &User,
    out: &mut (dyn Write + Send),
) -> Result<()> {
    let follows = state.db.get_feed_follows_for_user(user.id).await?;
    if follows.is_empty() {
        writeln!(out, "{} is not following any feeds", user.name)?;
        return Ok(());
    }

    writeln!(out, "Feeds followed by {}:", user.name)?;
    for follow in follows {
        writeln!(out, "* {}", follow.feed_name)?;
    }
    Ok(())
}

async fn handle_unfollow(
    state: &mut State,
    user: &User,
    args: &[String],
    out: &mut (dyn Write + Send),
) -> Result<()> {
    let url = arg(args, 0, "unfollow <url>")?;

    state.db.delete_feed_follow(user.id, url).await?;
    writeln!(out, "{} unfollowed {}", user.name, url)?;
    Ok(())
}

async fn handle_browse(
    state: &mut State,
    user: &User,
    args: &[String],
    out: &mut (dyn Write + Send),
) -> Result<()> {
    let limit = match args.first() {
        Some(raw) => raw
            .parse::<i64>()
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| GatorError::Usage("browse [limit]".to_string()))?,
        None => DEFAULT_BROWSE_LIMIT,
    };

    let posts = state.db.get_posts_for_user(user.id, limit).await?;
    writeln!(out, "Found {} posts for user {}:", posts.len(), user.name)?;
    for post in posts {
        let published = post
            .published_at
            .map(|p| p.format("%a %b %-d %Y").to_string())
            .unwrap_or_else(|| "undated".to_string());
        writeln!(out, "{} from {}", published, post.feed_name)?;
        writeln!(out, "--- {} ---", post.title)?;
        if let Some(description) = &post.description {
            writeln!(out, "    {}", description)?;
        }
        writeln!(out, "Link: {}", post.url)?;
        writeln!(out, "=====================================")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn create_state(current_user: Option<&str>) -> (State, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new("sqlite::memory:").await.unwrap();
        db.initialize().await.unwrap();

        let config = Config {
            db_url: "sqlite::memory:".to_string(),
            current_user_name: current_user.map(str::to_string),
            request_timeout_secs: 5,
            user_agent: "gator".to_string(),
        };
        let path = dir.path().join(".gatorconfig.json");
        config.save(&path).unwrap();

        let state = State::new(Arc::new(db), config, path, Shutdown::never());
        (state, dir)
    }

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    async fn run(state: &mut State, name: &str, values: &[&str]) -> Result<String> {
        let mut out = Vec::new();
        Commands::default()
            .run(state, name, &args(values), &mut out)
            .await?;
        Ok(String::from_utf8(out).unwrap())
    }

    mod registry_tests {
        use super::*;

        #[test]
        fn test_default_registers_all_verbs() {
            let commands = Commands::default();
            assert_eq!(
                commands.names(),
                vec![
                    "addfeed",
                    "agg",
                    "browse",
                    "feeds",
                    "follow",
                    "following",
                    "login",
                    "register",
                    "reset",
                    "unfollow",
                    "users"
                ]
            );
        }

        #[test]
        fn test_login_requirements() {
            assert!(!CommandKind::Login.requires_login());
            assert!(!CommandKind::Register.requires_login());
            assert!(!CommandKind::Agg.requires_login());
            assert!(!CommandKind::Feeds.requires_login());
            assert!(CommandKind::AddFeed.requires_login());
            assert!(CommandKind::Follow.requires_login());
            assert!(CommandKind::Following.requires_login());
            assert!(CommandKind::Unfollow.requires_login());
            assert!(CommandKind::Browse.requires_login());
        }

        #[tokio::test]
        async fn test_unknown_command() {
            let (mut state, _dir) = create_state(None).await;
            let result = run(&mut state, "frobnicate", &[]).await;
            assert!(matches!(
                result,
                Err(GatorError::UnknownCommand(name)) if name == "frobnicate"
            ));
        }

        #[tokio::test]
        async fn test_custom_registration() {
            let (mut state, _dir) = create_state(None).await;
            let mut commands = Commands::new();
            commands.register("signup", CommandKind::Register);

            let mut out = Vec::new();
            commands
                .run(&mut state, "signup", &args(&["dana"]), &mut out)
                .await
                .unwrap();
            assert_eq!(state.config.current_user(), Some("dana"));

            let missing = commands.run(&mut state, "register", &args(&["eve"]), &mut out).await;
            assert!(matches!(missing, Err(GatorError::UnknownCommand(_))));
        }
    }

    mod auth_tests {
        use super::*;

        #[tokio::test]
        async fn test_protected_command_without_user() {
            let (mut state, _dir) = create_state(None).await;
            let result = run(&mut state, "following", &[]).await;
            assert!(matches!(result, Err(GatorError::AuthRequired(_))));
        }

        #[tokio::test]
        async fn test_protected_command_with_deleted_user() {
            let (mut state, _dir) = create_state(Some("ghost")).await;
            let result = run(&mut state, "addfeed", &["Blog", "https://blog.com/rss"]).await;
            assert!(matches!(result, Err(GatorError::AuthRequired(_))));
        }

        #[tokio::test]
        async fn test_auth_checked_before_arguments() {
            let (mut state, _dir) = create_state(None).await;
            let result = run(&mut state, "follow", &[]).await;
            assert!(matches!(result, Err(GatorError::AuthRequired(_))));
        }
    }

    mod user_command_tests {
        use super::*;

        #[tokio::test]
        async fn test_register_sets_current_user_and_persists() {
            let (mut state, _dir) = create_state(None).await;

            let output = run(&mut state, "register", &["alice"]).await.unwrap();
            assert_eq!(output, "Username alice has been created!\n");
            assert_eq!(state.config.current_user(), Some("alice"));

            let saved = Config::load(&state.config_path).unwrap();
            assert_eq!(saved.current_user(), Some("alice"));
        }

        #[tokio::test]
        async fn test_register_duplicate_is_conflict() {
            let (mut state, _dir) = create_state(None).await;
            run(&mut state, "register", &["alice"]).await.unwrap();

            let result = run(&mut state, "register", &["alice"]).await;
            assert!(matches!(result, Err(GatorError::Conflict(_))));
        }

        #[tokio::test]
        async fn test_register_requires_name() {
            let (mut state, _dir) = create_state(None).await;
            let result = run(&mut state, "register", &[]).await;
            assert!(matches!(result, Err(GatorError::Usage(_))));
        }

        #[tokio::test]
        async fn test_login_switches_user() {
            let (mut state, _dir) = create_state(None).await;
            run(&mut state, "register", &["alice"]).await.unwrap();
            run(&mut state, "register", &["bob"]).await.unwrap();

            let output = run(&mut state, "login", &["alice"]).await.unwrap();
            assert_eq!(output, "User set to alice\n");
            assert_eq!(
                Config::load(&state.config_path).unwrap().current_user(),
                Some("alice")
            );
        }

        #[tokio::test]
        async fn test_login_unknown_user_keeps_config() {
            let (mut state, _dir) = create_state(Some("alice")).await;
            let result = run(&mut state, "login", &["nobody"]).await;

            assert!(matches!(result, Err(GatorError::NotFound(_))));
            assert_eq!(state.config.current_user(), Some("alice"));
        }

        #[tokio::test]
        async fn test_users_marks_current() {
            let (mut state, _dir) = create_state(None).await;
            run(&mut state, "register", &["alice"]).await.unwrap();
            run(&mut state, "register", &["bob"]).await.unwrap();

            let output = run(&mut state, "users", &[]).await.unwrap();
            assert_eq!(output, "* alice\n* bob (current)\n");
        }

        #[tokio::test]
        async fn test_reset_clears_users() {
            let (mut state, _dir) = create_state(None).await;
            run(&mut state, "register", &["alice"]).await.unwrap();

            run(&mut state, "reset", &[]).await.unwrap();
            let output = run(&mut state, "users", &[]).await.unwrap();
            assert!(output.is_empty());
        }
    }

    mod feed_command_tests {
        use super::*;

        #[tokio::test]
        async fn test_addfeed_creates_and_follows() {
            let (mut state, _dir) = create_state(None).await;
            run(&mut state, "register", &["alice"]).await.unwrap();

            let output = run(
                &mut state,
                "addfeed",
                &["Hacker News", "https://news.ycombinator.com/rss"],
            )
            .await
            .unwrap();
            assert!(output.contains(
                "Feed 'Hacker News' with URL 'https://news.ycombinator.com/rss' has been created!"
            ));
            assert!(output.contains("alice is now following 'Hacker News'"));

            let following = run(&mut state, "following", &[]).await.unwrap();
            assert_eq!(following, "Feeds followed by alice:\n* Hacker News\n");
        }

        #[tokio::test]
        async fn test_addfeed_needs_name_and_url() {
            let (mut state, _dir) = create_state(None).await;
            run(&mut state, "register", &["alice"]).await.unwrap();

            let result = run(&mut state, "addfeed", &["Only a name"]).await;
            assert!(matches!(result, Err(GatorError::Usage(_))));
        }

        #[tokio::test]
        async fn test_feeds_lists_owner() {
            let (mut state, _dir) = create_state(None).await;
            run(&mut state, "register", &["alice"]).await.unwrap();
            run(&mut state, "addfeed", &["Blog", "https://blog.com/rss"])
                .await
                .unwrap();

            let output = run(&mut state, "feeds", &[]).await.unwrap();
            assert_eq!(output, "* Blog (https://blog.com/rss) added by alice\n");
        }

        #[tokio::test]
        async fn test_follow_existing_feed() {
            let (mut state, _dir) = create_state(None).await;
            run(&mut state, "register", &["bob"]).await.unwrap();
            run(&mut state, "addfeed", &["Example", "https://example.com/feed.xml"])
                .await
                .unwrap();
            run(&mut state, "register", &["alice"]).await.unwrap();

            let output = run(&mut state, "follow", &["https://example.com/feed.xml"])
                .await
                .unwrap();
            assert_eq!(output, "alice is now following 'Example'\n");
        }

        #[tokio::test]
        async fn test_follow_twice_is_conflict() {
            let (mut state, _dir) = create_state(None).await;
            run(&mut state, "register", &["alice"]).await.unwrap();
            run(&mut state, "addfeed", &["Example", "https://example.com/feed.xml"])
                .await
                .unwrap();

            let result = run(&mut state, "follow", &["https://example.com/feed.xml"]).await;
            assert!(matches!(result, Err(GatorError::Conflict(_))));
        }

        #[tokio::test]
        async fn test_follow_unknown_feed() {
            let (mut state, _dir) = create_state(None).await;
            run(&mut state, "register", &["alice"]).await.unwrap();

            let result = run(&mut state, "follow", &["https://missing.com/rss"]).await;
            assert!(matches!(result, Err(GatorError::NotFound(_))));
        }

        #[tokio::test]
        async fn test_unfollow() {
            let (mut state, _dir) = create_state(None).await;
            run(&mut state, "register", &["alice"]).await.unwrap();
            run(&mut state, "addfeed", &["Example", "https://example.com/feed.xml"])
                .await
                .unwrap();

            let output = run(&mut state, "unfollow", &["https://example.com/feed.xml"])
                .await
                .unwrap();
            assert_eq!(output, "alice unfollowed https://example.com/feed.xml\n");

            let following = run(&mut state, "following", &[]).await.unwrap();
            assert_eq!(following, "alice is not following any feeds\n");

            let again = run(&mut state, "unfollow", &["https://example.com/feed.xml"]).await;
            assert!(matches!(again, Err(GatorError::NotFound(_))));
        }

        #[tokio::test]
        async fn test_browse_shows_followed_posts() {
            let (mut state, _dir) = create_state(None).await;
            run(&mut state, "register", &["alice"]).await.unwrap();
            run(&mut state, "addfeed", &["Example", "https://example.com/feed.xml"])
                .await
                .unwrap();

            let feed = state
                .db
                .get_feed_by_url("https://example.com/feed.xml")
                .await
                .unwrap();
            state
                .db
                .create_post(feed.id, "Hello", "https://example.com/hello", Some("Hi there"), None)
                .await
                .unwrap();

            let output = run(&mut state, "browse", &[]).await.unwrap();
            assert!(output.contains("Found 1 posts for user alice:"));
            assert!(output.contains("undated from Example"));
            assert!(output.contains("--- Hello ---"));
            assert!(output.contains("Link: https://example.com/hello"));
        }

        #[tokio::test]
        async fn test_browse_rejects_bad_limit() {
            let (mut state, _dir) = create_state(None).await;
            run(&mut state, "register", &["alice"]).await.unwrap();

            let result = run(&mut state, "browse", &["zero"]).await;
            assert!(matches!(result, Err(GatorError::Usage(_))));
        }
    }

    mod agg_command_tests {
        use super::*;

        #[tokio::test]
        async fn test_agg_requires_duration() {
            let (mut state, _dir) = create_state(None).await;
            let result = run(&mut state, "agg", &[]).await;
            assert!(matches!(result, Err(GatorError::Usage(_))));
        }

        #[tokio::test]
        async fn test_agg_rejects_bad_duration() {
            let (mut state, _dir) = create_state(None).await;
            let result = run(&mut state, "agg", &["soon"]).await;
            assert!(matches!(result, Err(GatorError::Usage(_))));

            let zero = run(&mut state, "agg", &["0s"]).await;
            assert!(matches!(zero, Err(GatorError::Usage(_))));
        }

        #[tokio::test]
        async fn test_agg_stops_on_shutdown() {
            let (mut state, _dir) = create_state(None).await;
            let (tx, shutdown) = Shutdown::channel();
            state.shutdown = shutdown;

            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                let _ = tx.send(true);
            });

            let output = run(&mut state, "agg", &["20ms"]).await.unwrap();
            assert!(output.starts_with("Collecting feeds every 20ms"));
        }
    }
}
