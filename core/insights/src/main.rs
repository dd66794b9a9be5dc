use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use learntrail_indexing::{
    AiConfig, AiServiceClient, EmbeddingSync, EntityExtractor, GraphBuilder, GraphSessionHook,
    KnowledgeGraph, SqliteVectorStore,
};
use learntrail_ingestion::{
    ActivityClassifier, Clock, Database, FileContentExtractor, IngestionConfig, RuleEngine,
    RuleSet, SessionManager, SystemClock, Tracker, TrackerCommand, TrackerWorker,
};
use learntrail_insights::{router, AppState, InsightComposer};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Learntrail tracking daemon
#[derive(Debug, Parser)]
#[command(name = "learntrail", version, about)]
struct Cli {
    /// SQLite database file
    #[arg(long, env = "LEARNTRAIL_DB_PATH")]
    db_path: Option<PathBuf>,

    #[arg(long, env = "LEARNTRAIL_HTTP_ADDR", default_value = "127.0.0.1:21960")]
    http_addr: SocketAddr,

    /// Minutes between scheduled graph builds, 0 disables them
    #[arg(long, env = "LEARNTRAIL_GRAPH_INTERVAL_MINS", default_value_t = 30)]
    graph_interval_mins: u64,
}

fn default_db_path() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME is not set; pass --db-path")?;
    Ok(PathBuf::from(home).join(".learntrail").join("learntrail.db"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    info!("Learntrail v{}", env!("CARGO_PKG_VERSION"));

    let config = IngestionConfig::from_env()?;
    let ai_config = AiConfig::from_env()?;

    let db_path = match cli.db_path {
        Some(path) => path,
        None => default_db_path()?,
    };
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    info!("Database path: {}", db_path.display());

    // ------------------------------------------------------------------
    // Storage
    // ------------------------------------------------------------------
    let db = Database::new(&db_path)?;
    let mut whitelist = db.load_whitelist()?;
    for app in &config.whitelist_apps {
        db.add_whitelist_app(app)?;
        whitelist.add_app(app);
    }
    for domain in &config.whitelist_domains {
        db.add_whitelist_domain(domain)?;
        whitelist.add_domain(domain);
    }
    if whitelist.is_empty() {
        warn!("Whitelist is empty; nothing will be tracked until apps or domains are added");
    }
    let db = Arc::new(Mutex::new(db));
    let whitelist = Arc::new(RwLock::new(whitelist));

    let graph = Arc::new(Mutex::new(KnowledgeGraph::open(&db_path)?));
    let vectors = SqliteVectorStore::open(&db_path)?.shared();
    {
        let stats = graph.lock().await.graph_stats();
        info!(
            "Loaded knowledge graph: {} nodes, {} edges, {} vectors",
            stats.node_count,
            stats.edge_count,
            vectors.read().await.len()
        );
    }

    // ------------------------------------------------------------------
    // AI service and graph builder
    // ------------------------------------------------------------------
    let ai = Arc::new(AiServiceClient::new(&ai_config)?);
    if ai.health().await {
        info!("AI service reachable at {}", ai_config.base_url);
    } else {
        warn!(
            "AI service not reachable at {}; using rule-based fallbacks",
            ai_config.base_url
        );
    }

    let sync = Arc::new(EmbeddingSync::new(ai.clone(), vectors.clone()));
    let extractor = Arc::new(EntityExtractor::new(Some(ai.clone())));
    let builder = Arc::new(
        GraphBuilder::new(db.clone(), graph.clone(), vectors.clone(), extractor).with_sync(sync),
    );

    // ------------------------------------------------------------------
    // Tracker
    // ------------------------------------------------------------------
    let classifier = if config.use_ml_classifier {
        info!("ML classifier enabled");
        ActivityClassifier::with_ml(
            ai.clone(),
            Duration::from_secs(config.ml_timeout_secs),
            Duration::from_secs(config.ml_cache_ttl_secs),
        )
    } else {
        ActivityClassifier::rule_based()
    };

    let rules = match &config.rules_path {
        Some(path) => RuleSet::load(path)?,
        None => RuleSet::default(),
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let sessions = SessionManager::new(
        clock.clone(),
        chrono::Duration::minutes(config.session_timeout_mins),
    );

    let mut tracker = Tracker::new(
        db.clone(),
        whitelist.clone(),
        Arc::new(classifier),
        RuleEngine::new(rules),
        sessions,
    )
    .with_hook(Arc::new(GraphSessionHook::new(builder.clone())));
    if config.read_file_content {
        tracker = tracker.with_extractor(Arc::new(FileContentExtractor::new()));
    }

    let dangling = tracker.initialize().await?;
    if !dangling.is_empty() {
        info!("Closed {} session(s) left open by a previous run", dangling.len());
    }

    let (tracker_tx, tracker_rx) = mpsc::unbounded_channel();
    let worker = tokio::spawn(TrackerWorker::new(tracker, tracker_rx).run());

    // Idle sweep
    {
        let tx = tracker_tx.clone();
        let every = Duration::from_secs(config.track_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                if tx.send(TrackerCommand::Sweep).is_err() {
                    break;
                }
            }
        });
    }

    // Scheduled graph builds
    if cli.graph_interval_mins > 0 {
        let builder = builder.clone();
        let every = Duration::from_secs(cli.graph_interval_mins * 60);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                match builder.build_knowledge_graph(Utc::now()).await {
                    Ok(report) => info!(
                        "Scheduled graph build: {} activities, {} entities, {} new edges",
                        report.activities, report.entities, report.edges_created
                    ),
                    Err(e) => error!("Scheduled graph build failed: {}", e),
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // HTTP API
    // ------------------------------------------------------------------
    let composer = Arc::new(InsightComposer::new(db.clone(), graph.clone()));
    let state = AppState {
        db,
        graph,
        whitelist,
        builder,
        composer,
        tracker: tracker_tx.clone(),
        clock,
    };

    // CORS layer for the desktop UI
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    info!("Starting HTTP server on http://{}", cli.http_addr);
    let listener = tokio::net::TcpListener::bind(cli.http_addr)
        .await
        .with_context(|| format!("failed to bind {}", cli.http_addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Close the active session before exiting
    let (reply_tx, reply_rx) = oneshot::channel();
    if tracker_tx.send(TrackerCommand::Shutdown(reply_tx)).is_ok() {
        match reply_rx.await {
            Ok(Some(session)) => info!("Closed session {} on shutdown", session.id),
            Ok(None) => {}
            Err(_) => warn!("Tracker worker exited before confirming shutdown"),
        }
    }
    if let Err(e) = worker.await {
        error!("Tracker worker panicked: {}", e);
    }

    info!("Learntrail stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
