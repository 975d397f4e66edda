use std::{
    path::PathBuf,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use core_model::FeedError;
use feed_http::{FeedConfig, HttpThreadFeed, SessionFile};
use ingest::{SyncConfig, SyncPhase};
use owo_colors::OwoColorize;
use regex::Regex;
use store_json::ThreadStore;
use tracing::{info, warn};

mod config;

#[derive(Parser)]
#[command(name = "reelvault")]
#[command(about = "Incremental DM thread archiver and reel catalog builder")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pull new messages and continue the history backfill for a thread
    Sync(SyncArgs),
    /// Regenerate the reel catalog from the persisted thread log
    Catalog(CatalogArgs),
    /// Show reel activity for the persisted thread log
    Stats(StatsArgs),
}

#[derive(Args)]
struct ThreadArgs {
    #[arg(long)]
    thread_id: Option<String>,
    /// Thread URL, e.g. https://www.instagram.com/direct/t/123/
    #[arg(long)]
    thread_url: Option<String>,
    #[arg(long)]
    store_dir: Option<PathBuf>,
}

#[derive(Args)]
struct SyncArgs {
    #[command(flatten)]
    thread: ThreadArgs,
    /// Page size for backfill requests
    #[arg(long)]
    limit: Option<u32>,
    /// Base delay between page fetches, e.g. "500ms"
    #[arg(long)]
    delay: Option<String>,
    #[arg(long)]
    session_file: Option<PathBuf>,
}

#[derive(Args)]
struct CatalogArgs {
    #[command(flatten)]
    thread: ThreadArgs,
    #[arg(long)]
    users_file: Option<PathBuf>,
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Args)]
struct StatsArgs {
    #[command(flatten)]
    thread: ThreadArgs,
    #[arg(long)]
    users_file: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let config = config::Config::load()?;
    let t = Instant::now();

    match cli.command {
        Commands::Sync(args) => run_sync(args, &config, t)?,
        Commands::Catalog(args) => run_catalog(args, &config, t)?,
        Commands::Stats(args) => run_stats(args, &config)?,
    }

    Ok(())
}

fn run_sync(args: SyncArgs, config: &config::Config, t: Instant) -> anyhow::Result<()> {
    let thread_id = resolve_thread_id(&args.thread, config)?;
    let mut sync_config = SyncConfig::new(thread_id);
    if let Some(limit) = args
        .limit
        .or_else(|| config.sync.as_ref().and_then(|s| s.page_limit))
    {
        sync_config.page_limit = limit;
    }
    if let Some(delay) = &args.delay {
        sync_config.base_delay =
            humantime::parse_duration(delay).with_context(|| "invalid --delay")?;
    } else if let Some(ms) = config.sync.as_ref().and_then(|s| s.delay_ms) {
        sync_config.base_delay = Duration::from_millis(ms);
    }

    let store = open_store(&args.thread.store_dir)?;
    let session = args
        .session_file
        .as_ref()
        .map(SessionFile::at)
        .unwrap_or_else(SessionFile::default_path);
    let Some(token) = session.load() else {
        anyhow::bail!(
            "no session found at {}; provision one with your login tooling first",
            session.path().display()
        );
    };
    let feed = HttpThreadFeed::new(FeedConfig::new(token))?;

    let cancel = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&cancel);
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::SeqCst);
    })
    .context("setting ctrl-c handler")?;

    info!(thread = %sync_config.thread_title, "starting sync");
    let outcome = match ingest::sync_thread(&feed, &store, &sync_config, &cancel, log_phase) {
        Ok(outcome) => outcome,
        Err(err) => {
            if err
                .downcast_ref::<FeedError>()
                .is_some_and(FeedError::is_auth)
            {
                session.invalidate();
                warn!("stale session invalidated; the next run must re-authenticate");
            }
            return Err(err);
        }
    };

    info!(
        state = ?outcome.state,
        new_messages = outcome.new_messages,
        pages = outcome.pages_fetched,
        total = outcome.total_messages,
        elapsed = ?t.elapsed(),
        "sync finished"
    );
    println!(
        "{} messages in {}",
        outcome.total_messages,
        store.log_path(&sync_config.thread_title).display()
    );
    Ok(())
}

fn log_phase(phase: SyncPhase) {
    match phase {
        SyncPhase::Reconciling => info!("checking for new messages"),
        SyncPhase::Reconciled { new_messages } => info!(new_messages, "recent check done"),
        SyncPhase::Backfilling { page, total } => info!(page, total, "fetching older page"),
        SyncPhase::PagePersisted { page, total } => info!(page, total, "page persisted"),
        SyncPhase::Complete { total } => info!(total, "backfill complete"),
        SyncPhase::Aborted { total } => warn!(total, "backfill stopped early; progress saved"),
    }
}

fn run_catalog(args: CatalogArgs, config: &config::Config, t: Instant) -> anyhow::Result<()> {
    let thread_id = resolve_thread_id(&args.thread, config)?;
    let thread_title = format!("thread_{thread_id}");
    let store = open_store(&args.thread.store_dir)?;
    let (records, _) = store.load(&thread_title);
    if records.is_empty() {
        warn!(thread = %thread_title, "no persisted messages; run `reelvault sync` first");
    }

    let users_path = resolve_users_file(args.users_file, config, &store);
    let users = catalog::load_user_map(&users_path);
    let entries = catalog::project(&records, &users);

    let out = args
        .out
        .or_else(|| config.catalog.as_ref().and_then(|c| c.output.clone()))
        .unwrap_or_else(|| store.root().join("reels_data.js"));
    catalog::write_catalog(&out, &entries)?;
    info!(entries = entries.len(), elapsed = ?t.elapsed(), "catalog updated");
    println!("{}", out.display());
    Ok(())
}

fn run_stats(args: StatsArgs, config: &config::Config) -> anyhow::Result<()> {
    let thread_id = resolve_thread_id(&args.thread, config)?;
    let thread_title = format!("thread_{thread_id}");
    let store = open_store(&args.thread.store_dir)?;
    let (records, _) = store.load(&thread_title);

    let stats = catalog::reel_stats(&records, 10);
    if stats.total_reels == 0 {
        println!("No reels found in this thread.");
        return Ok(());
    }

    let users_path = resolve_users_file(args.users_file, config, &store);
    let users = catalog::load_user_map(&users_path);

    println!("{}", "Reels wrapped".bold());
    println!(
        "Total reels shared: {}",
        stats.total_reels.to_string().green()
    );
    println!("\nReels by user:");
    for (author, count) in &stats.by_author {
        println!(
            "  {}: {}",
            catalog::display_user(&users, author).cyan(),
            count
        );
    }
    if !stats.sample_links.is_empty() {
        println!("\nFirst links:");
        for url in &stats.sample_links {
            println!("  {url}");
        }
    } else {
        println!(
            "\n{}",
            "Found reels but no extractable links; check the raw log.".yellow()
        );
    }
    Ok(())
}

fn open_store(store_dir: &Option<PathBuf>) -> anyhow::Result<ThreadStore> {
    match store_dir {
        Some(dir) => ThreadStore::open(dir),
        None => ThreadStore::open_default(),
    }
}

fn resolve_thread_id(args: &ThreadArgs, config: &config::Config) -> anyhow::Result<String> {
    if let Some(url) = &args.thread_url {
        return thread_id_from_url(url)
            .with_context(|| format!("no thread id found in url {url}"));
    }
    if let Some(id) = &args.thread_id {
        return Ok(id.clone());
    }
    if let Some(id) = config.sync.as_ref().and_then(|s| s.thread_id.clone()) {
        return Ok(id);
    }
    anyhow::bail!("no thread specified; pass --thread-id / --thread-url or set [sync] thread_id")
}

fn thread_id_from_url(url: &str) -> Option<String> {
    static THREAD_URL_RE: OnceLock<Regex> = OnceLock::new();
    let re = THREAD_URL_RE
        .get_or_init(|| Regex::new(r"/direct/t/(\d+)").expect("valid thread url regex"));
    re.captures(url).map(|caps| caps[1].to_string())
}

fn resolve_users_file(
    explicit: Option<PathBuf>,
    config: &config::Config,
    store: &ThreadStore,
) -> PathBuf {
    explicit
        .or_else(|| config.catalog.as_ref().and_then(|c| c.users_file.clone()))
        .unwrap_or_else(|| store.root().join("users.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_id_from_direct_url() {
        assert_eq!(
            thread_id_from_url("https://www.instagram.com/direct/t/8335225369860838/"),
            Some("8335225369860838".to_string())
        );
    }

    #[test]
    fn thread_id_missing_from_other_urls() {
        assert!(thread_id_from_url("https://www.instagram.com/reels/ABC/").is_none());
    }
}
