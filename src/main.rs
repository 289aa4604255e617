//! Command line interface: initialize a store, follow relays, ingest event
//! files, query the materialized board, and publish actions.

use std::{fs, path::Path, sync::Arc};

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use serde_json::json;

use relayboard::{
    config::Settings,
    event::Event,
    fanin,
    ingest::Ingestor,
    model::{Direction, PostFilter, PostOrder, PostScope, TreeOrder, VoteFilter, VoteOrder},
    publish::{Draft, Gateway, Published},
    signer::KeypairSigner,
    store::{SqliteStore, Store, StoreError},
    tree,
    visibility::Visibility,
};

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "relayboard",
    author,
    version,
    about = "Local materialized replica of a relay-hosted link board"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Create the database schema at `STORE_PATH`.
    Init,
    /// Subscribe to every configured relay until interrupted.
    Run,
    /// Run one or more JSON event files through the ingestion pipeline.
    Ingest {
        #[arg(required = true)]
        files: Vec<String>,
    },
    /// List posts and comments as JSON lines.
    Posts(PostsArgs),
    /// List votes as JSON lines.
    Votes(VotesArgs),
    /// Print a thread in display order with nesting depth.
    Tree {
        id: String,
        /// `ranking` or `score`; defaults to `TREE_ORDER`.
        #[arg(long)]
        order: Option<TreeOrder>,
    },
    /// Top-level post counts per channel.
    Channels,
    /// Reputation and profile of an author.
    User { pubkey: String },
    /// Sign and broadcast an action with `SECRET_KEY`.
    Publish {
        #[command(subcommand)]
        action: PublishAction,
    },
}

#[derive(Args)]
struct PostsArgs {
    /// Channel name, or `all`.
    #[arg(long, default_value = "all")]
    channel: String,
    #[arg(long)]
    author: Option<String>,
    /// Whole word to look for in titles and bodies.
    #[arg(long)]
    search: Option<String>,
    /// `all`, `posts` or `comments`.
    #[arg(long, default_value = "all")]
    scope: PostScope,
    /// Hide authors whose reputation was at or below the floor when posting.
    #[arg(long)]
    hide_low_reputation: bool,
    /// `created_at`, `score` or `ranking`, descending.
    #[arg(long)]
    order: Option<String>,
    #[arg(long)]
    limit: Option<u32>,
    #[arg(long, default_value_t = 0)]
    page: u32,
}

#[derive(Args)]
struct VotesArgs {
    #[arg(long)]
    voter: Option<String>,
    #[arg(long, default_value = "all")]
    channel: String,
    /// `created_at`, descending.
    #[arg(long)]
    order: Option<String>,
    #[arg(long)]
    limit: Option<u32>,
    #[arg(long, default_value_t = 0)]
    page: u32,
}

/// Actions available under `relayboard publish`.
#[derive(Subcommand)]
enum PublishAction {
    /// Submit a root post (followed by the author's own upvote).
    Post {
        #[arg(long)]
        title: String,
        #[arg(long)]
        body: String,
        #[arg(long, default_value = "")]
        channel: String,
    },
    /// Reply to a post or comment.
    Comment {
        #[arg(long)]
        parent: String,
        #[arg(long)]
        body: String,
    },
    /// Vote on a post; upvote unless `--down`.
    Vote {
        target: String,
        #[arg(long)]
        down: bool,
    },
    /// Publish display name and about text.
    Profile {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        about: Option<String>,
    },
    /// Retract one or more of your posts.
    Delete {
        #[arg(required = true)]
        ids: Vec<String>,
    },
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    ensure_env_file(&cli.env)?;
    let cfg = Settings::from_env(&cli.env)?;
    let store: Arc<dyn Store> = Arc::new(
        SqliteStore::open(&cfg.store_path)
            .with_context(|| format!("opening store {}", cfg.store_path.display()))?,
    );
    let ingestor = Ingestor::new(store.clone(), Visibility::new(), cfg.limits);

    match cli.command {
        Commands::Init => {
            tracing::info!(path = %cfg.store_path.display(), "store ready");
        }
        Commands::Run => {
            let handle = fanin::start(cfg.fanin(), ingestor).await?;
            tracing::info!(relays = handle.reachable(), "following relays; ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
            tracing::info!("shutting down");
            handle.shutdown().await?;
        }
        Commands::Ingest { files } => {
            for f in files {
                let data = fs::read_to_string(&f).with_context(|| format!("reading {f}"))?;
                let ev: Event =
                    serde_json::from_str(&data).with_context(|| format!("parsing {f}"))?;
                let outcome = ingestor.ingest(&ev)?;
                print_json(&json!({ "id": ev.id, "outcome": outcome.label() }))?;
            }
        }
        Commands::Posts(args) => {
            let order = args
                .order
                .as_deref()
                .map(str::parse::<PostOrder>)
                .transpose()
                .map_err(StoreError::from)?;
            let filter = PostFilter {
                channel: args.channel,
                author: args.author,
                contains: args.search,
                scope: args.scope,
                hide_low_reputation: args.hide_low_reputation,
                order,
                limit: args.limit,
                page: args.page,
                page_size: cfg.posts_per_page,
            };
            for post in store.fetch_posts(&filter)? {
                print_json(&post)?;
            }
        }
        Commands::Votes(args) => {
            let order = args
                .order
                .as_deref()
                .map(str::parse::<VoteOrder>)
                .transpose()
                .map_err(StoreError::from)?;
            let filter = VoteFilter {
                voter: args.voter,
                channel: args.channel,
                order,
                limit: args.limit,
                page: args.page,
                page_size: cfg.posts_per_page,
            };
            for vote in store.fetch_votes(&filter)? {
                print_json(&vote)?;
            }
        }
        Commands::Tree { id, order } => {
            let posts = store.get_post_tree(&id, order.unwrap_or(cfg.tree_order))?;
            if posts.is_empty() {
                bail!("post not found: {id}");
            }
            for (post, depth) in posts.iter().zip(tree::depths(&posts)) {
                let mut line = serde_json::to_value(post)?;
                line["depth"] = json!(depth);
                print_json(&line)?;
            }
        }
        Commands::Channels => {
            for count in store.channel_counts()? {
                print_json(&count)?;
            }
        }
        Commands::User { pubkey } => {
            let Some(user) = store.get_user(&pubkey)? else {
                bail!("unknown user: {pubkey}");
            };
            let meta = store.get_metadata(&pubkey)?;
            print_json(&json!({
                "pubkey": user.pubkey,
                "reputation": user.reputation,
                "name": meta.as_ref().map(|m| m.name.as_str()),
                "about": meta.as_ref().map(|m| m.about.as_str()),
            }))?;
        }
        Commands::Publish { action } => {
            let Some(secret) = cfg.secret_key.as_deref() else {
                bail!("SECRET_KEY is not set");
            };
            let signer = KeypairSigner::from_hex(secret)?;
            let gateway = Gateway::new(cfg.gateway(), ingestor, cfg.limits);
            let published = match action {
                PublishAction::Post {
                    title,
                    body,
                    channel,
                } => gateway.submit_post(&signer, title, body, channel).await?,
                PublishAction::Comment { parent, body } => {
                    gateway
                        .publish(&signer, Draft::Comment { parent, body })
                        .await?
                }
                PublishAction::Vote { target, down } => {
                    let direction = Direction::from_up(!down);
                    gateway
                        .publish(&signer, Draft::Vote { target, direction })
                        .await?
                }
                PublishAction::Profile { name, about } => {
                    gateway
                        .publish(&signer, Draft::Profile { name, about })
                        .await?
                }
                PublishAction::Delete { ids } => {
                    gateway
                        .publish(&signer, Draft::Delete { targets: ids })
                        .await?
                }
            };
            print_published(&published)?;
        }
    }
    Ok(())
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

fn print_published(published: &Published) -> anyhow::Result<()> {
    print_json(&json!({ "id": published.id(), "visible": published.is_visible() }))
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> anyhow::Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    if let Some(parent) = env_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let base_dir = match env_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    let store_path = base_dir.join("relayboard.db");
    let mut content = String::new();
    content.push_str(&format!("STORE_PATH={}\n", display_path(&store_path)));
    content.push_str("RELAYS=\n");
    content.push_str("TOR_SOCKS=\n");
    content.push_str("SUBSCRIBE_KINDS=0,1,5\n");
    content.push_str("TREE_ORDER=ranking\n");
    content.push_str("POSTS_PER_PAGE=25\n");
    content.push_str("ACK_TIMEOUT_MS=5000\n");
    content.push_str("VISIBILITY_TIMEOUT_MS=3000\n");
    content.push_str("RECONNECT_DELAY_MS=5000\n");
    content.push_str("SEEN_CAPACITY=100000\n");
    content.push_str("PENDING_VOTE_TTL_SECS=604800\n");
    content.push_str("SECRET_KEY=\n");
    fs::write(env_path, content)?;
    Ok(())
}

fn display_path(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "relayboard=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    run(cli).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, PoisonError};
    use tempfile::TempDir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn clear_env() {
        for v in [
            "STORE_PATH",
            "RELAYS",
            "TOR_SOCKS",
            "SUBSCRIBE_KINDS",
            "TREE_ORDER",
            "POSTS_PER_PAGE",
            "ACK_TIMEOUT_MS",
            "VISIBILITY_TIMEOUT_MS",
            "RECONNECT_DELAY_MS",
            "SEEN_CAPACITY",
            "PENDING_VOTE_TTL_SECS",
            "SECRET_KEY",
        ] {
            std::env::remove_var(v);
        }
    }

    #[tokio::test]
    async fn init_creates_default_env_and_store() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(PoisonError::into_inner);
        clear_env();
        let dir = TempDir::new().unwrap();
        let env_path = dir.path().join(".env");
        run(Cli {
            env: env_path.to_string_lossy().into_owned(),
            command: Commands::Init,
        })
        .await
        .unwrap();

        let data = fs::read_to_string(&env_path).unwrap();
        let expected = dir.path().join("relayboard.db");
        assert!(data.contains(&format!("STORE_PATH={}", expected.to_string_lossy())));
        assert!(data.contains("SUBSCRIBE_KINDS=0,1,5"));
        assert!(expected.exists());
    }

    #[tokio::test]
    async fn run_without_relays_fails() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(PoisonError::into_inner);
        clear_env();
        let dir = TempDir::new().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(&env_path, "STORE_PATH=:memory:\nRELAYS=\n").unwrap();
        let err = run(Cli {
            env: env_path.to_string_lossy().into_owned(),
            command: Commands::Run,
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("no relays"));
    }

    #[tokio::test]
    async fn publish_requires_a_secret_key() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(PoisonError::into_inner);
        clear_env();
        let dir = TempDir::new().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(&env_path, "STORE_PATH=:memory:\nRELAYS=ws://127.0.0.1:1\n").unwrap();
        let err = run(Cli {
            env: env_path.to_string_lossy().into_owned(),
            command: Commands::Publish {
                action: PublishAction::Vote {
                    target: "abc".into(),
                    down: false,
                },
            },
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("SECRET_KEY"));
    }

    #[tokio::test]
    async fn unknown_sort_column_is_rejected() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(PoisonError::into_inner);
        clear_env();
        let dir = TempDir::new().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(&env_path, "STORE_PATH=:memory:\n").unwrap();
        let err = run(Cli {
            env: env_path.to_string_lossy().into_owned(),
            command: Commands::Posts(PostsArgs {
                channel: "all".into(),
                author: None,
                search: None,
                scope: PostScope::All,
                hide_low_reputation: false,
                order: Some("pubkey; DROP TABLE posts".into()),
                limit: None,
                page: 0,
            }),
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("sort column not allowed"));
    }
}
