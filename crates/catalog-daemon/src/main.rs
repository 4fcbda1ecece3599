//! catalog-daemon: command-line client for the AI tools catalog.
//!
//! Keeps the tools and news collections in sync with the hosted store and
//! runs mutations through the optimistic coordinator.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use catalog_core::{
    CatalogEvent, CollectionKind, CollectionSynchronizer, CollectionView, InMemoryStore,
    MutationCoordinator, NewsArticle, Record, RemoteStore, Tool, ToolCollections,
};
use catalog_daemon::{store_from_config, Config};

#[derive(Parser, Debug)]
#[command(name = "catalog-daemon")]
#[command(about = "Realtime client for the AI tools catalog")]
struct Args {
    /// Directory holding config.json
    #[arg(short, long, env = "CATALOG_CONFIG_DIR", default_value = ".catalog")]
    config: PathBuf,

    /// Use an in-process store with sample data instead of the hosted one
    #[arg(long)]
    demo: bool,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Follow both collections and log every snapshot until Ctrl+C
    Watch,
    /// Fetch a collection once and print it as JSON
    List { kind: CollectionKind },
    /// Add a record given as JSON
    Add { kind: CollectionKind, json: String },
    /// Replace a record given as JSON
    Update {
        kind: CollectionKind,
        id: String,
        json: String,
    },
    /// Delete a record
    Delete { kind: CollectionKind, id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,catalog_daemon=debug,catalog_core=debug"
    } else {
        "info,catalog_daemon=info,catalog_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let store: Arc<dyn RemoteStore> = if args.demo {
        info!("Demo mode: using in-process store");
        let store = InMemoryStore::new();
        store.seed(demo_records());
        Arc::new(store)
    } else {
        let mut config = Config::load(&args.config)?;
        config.apply_env();
        store_from_config(&config)?
    };

    let sync = CollectionSynchronizer::new(store);
    let coordinator = MutationCoordinator::new(sync.clone());

    match args.command {
        Command::Watch => watch(&sync).await,
        Command::List { kind } => {
            let records = sync
                .store()
                .fetch_all(kind)
                .await
                .with_context(|| format!("Failed to fetch {kind}"))?;
            println!("{}", serde_json::to_string_pretty(&records)?);
            Ok(())
        }
        Command::Add { kind, json } => {
            let record = parse_record(kind, &json)?;
            let stored = coordinator
                .add(record)
                .await
                .with_context(|| format!("Failed to add {kind}"))?;
            println!("{}", serde_json::to_string_pretty(&stored)?);
            Ok(())
        }
        Command::Update { kind, id, json } => {
            let record = parse_record(kind, &json)?;
            coordinator
                .update(&id, record)
                .await
                .with_context(|| format!("Failed to update {kind} {id}"))?;
            info!("Updated {} {}", kind, id);
            Ok(())
        }
        Command::Delete { kind, id } => {
            coordinator
                .delete(kind, &id)
                .await
                .with_context(|| format!("Failed to delete {kind} {id}"))?;
            info!("Deleted {} {}", kind, id);
            Ok(())
        }
    }
}

/// Parse a JSON object into a record of `kind`.
fn parse_record(kind: CollectionKind, json: &str) -> Result<Record> {
    let record = match kind {
        CollectionKind::Tools => Record::Tool(
            serde_json::from_str::<Tool>(json).context("Invalid tool JSON")?,
        ),
        CollectionKind::News => Record::News(
            serde_json::from_str::<NewsArticle>(json).context("Invalid news JSON")?,
        ),
    };
    Ok(record)
}

async fn watch(sync: &CollectionSynchronizer) -> Result<()> {
    let _events = sync.events().subscribe(|event| match event {
        CatalogEvent::FetchFailed { kind, error, .. } => {
            warn!("Refresh of {} failed, keeping last snapshot: {}", kind, error)
        }
        CatalogEvent::WatchFailed { kind, error, .. } => {
            warn!("No live updates for {}: {}", kind, error)
        }
        CatalogEvent::LocalMode { kind, .. } => info!("{} is local-only", kind),
        CatalogEvent::MutationFailed { kind, op, error, .. } => {
            error!("{:?} on {} failed: {}", op, kind, error)
        }
        _ => {}
    });

    let mut tools = CollectionView::<Tool>::bind(sync, |tools| {
        let shelves = ToolCollections::from_tools(tools);
        info!(
            "tools: {} (featured {}, free {}, creative {}, productivity {})",
            tools.len(),
            shelves.featured.len(),
            shelves.free.len(),
            shelves.creative.len(),
            shelves.productivity.len()
        );
    });
    let mut news = CollectionView::<NewsArticle>::bind(sync, |articles| {
        info!("news: {}", articles.len());
        if let Some(latest) = articles.first() {
            info!("latest: {}", latest.title);
        }
    });

    info!("Watching catalog, press Ctrl+C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    tools.dispose();
    news.dispose();
    Ok(())
}

fn demo_records() -> Vec<Record> {
    let tool = |name: &str, category: &str, price: &str, description: &str| {
        Record::Tool(Tool {
            name: name.into(),
            description: description.into(),
            category: category.into(),
            price: price.into(),
            tags: vec![category.to_lowercase()],
            ..Default::default()
        })
    };
    vec![
        tool("Quillmate", "Writing", "Free", "Drafts blog posts from outlines"),
        tool("Pixel Forge", "Image", "Free Trial", "Generates product shots"),
        tool("Clipwise", "Video", "Paid", "Cuts long videos into shorts"),
        tool("Pairbot", "Coding", "Freemium", "Reviews pull requests"),
        Record::News(NewsArticle {
            title: "Open-weight models close the gap".into(),
            description: "A round-up of this month's releases.".into(),
            category: "Industry".into(),
            source: "Catalog Weekly".into(),
            ..Default::default()
        }),
    ]
}
