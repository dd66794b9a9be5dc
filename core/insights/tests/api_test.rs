use anyhow::Result;
use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use chrono::{DateTime, Duration, TimeZone, Utc};
use learntrail_indexing::{EntityExtractor, GraphBuilder, InMemoryVectorStore, KnowledgeGraph};
use learntrail_ingestion::{Database, ManualClock, TrackerCommand, Whitelist};
use learntrail_insights::{router, AppState, InsightComposer};
use learntrail_schemas::{
    generate_session_id, ActivityType, EdgeType, GraphNode, NodeLabel, Properties, Session,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::sync::{mpsc, Mutex, RwLock};
use tower::ServiceExt;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 20, 18, 0, 0).unwrap()
}

struct Fixture {
    _temp: NamedTempFile,
    app: Router,
    db: Arc<Mutex<Database>>,
    graph: Arc<Mutex<KnowledgeGraph>>,
    whitelist: Arc<RwLock<Whitelist>>,
    commands: mpsc::UnboundedReceiver<TrackerCommand>,
}

fn fixture() -> Result<Fixture> {
    let temp = NamedTempFile::new()?;
    let db = Arc::new(Mutex::new(Database::new(temp.path())?));
    let graph = Arc::new(Mutex::new(KnowledgeGraph::open(temp.path())?));
    let whitelist = Arc::new(RwLock::new(Whitelist::from_lists(
        &["visual studio code".to_string()],
        &[],
    )));
    let builder = Arc::new(GraphBuilder::new(
        db.clone(),
        graph.clone(),
        InMemoryVectorStore::new().shared(),
        Arc::new(EntityExtractor::new(None)),
    ));
    let (tx, rx) = mpsc::unbounded_channel();

    let state = AppState {
        db: db.clone(),
        graph: graph.clone(),
        whitelist: whitelist.clone(),
        builder,
        composer: Arc::new(InsightComposer::new(db.clone(), graph.clone())),
        tracker: tx,
        clock: Arc::new(ManualClock::new(now())),
    };

    Ok(Fixture {
        _temp: temp,
        app: router(state),
        db,
        graph,
        whitelist,
        commands: rx,
    })
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> Result<(StatusCode, Value)> {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body)?))?,
        None => request.body(Body::empty())?,
    };

    let response = app.clone().oneshot(request).await?;
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).to_string()))
    };
    Ok((status, value))
}

fn session(start: DateTime<Utc>, minutes: i64, open: bool) -> Session {
    Session {
        id: generate_session_id(),
        activity_type: ActivityType::Coding,
        app_name: Some("Visual Studio Code".to_string()),
        project_name: Some("learntrail".to_string()),
        start_time: start,
        end_time: (!open).then(|| start + Duration::minutes(minutes)),
        duration_seconds: (!open).then_some(minutes * 60),
        aggregated_files: vec!["main.rs".to_string()],
        aggregated_urls: Vec::new(),
        summary: None,
        concepts: Vec::new(),
        confidence: 0.8,
        activity_count: 4,
    }
}

#[tokio::test]
async fn test_health() -> Result<()> {
    let f = fixture()?;
    let (status, body) = call(&f.app, Method::GET, "/health", None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    Ok(())
}

#[tokio::test]
async fn test_observation_is_queued_for_tracker() -> Result<()> {
    let mut f = fixture()?;
    let observation = json!({
        "app_name": "Visual Studio Code",
        "window_title": "main.rs - learntrail - Visual Studio Code",
        "url": null,
        "file_path": "/home/me/code/learntrail/src/main.rs",
        "source_type": null,
        "timestamp": "2026-06-20T17:59:00Z"
    });

    let (status, body) = call(&f.app, Method::POST, "/observations", Some(observation)).await?;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["queued"], true);

    match f.commands.try_recv()? {
        TrackerCommand::Observe(observation) => {
            assert_eq!(observation.app_name, "Visual Studio Code");
        }
        other => panic!("expected an observation, got {:?}", other),
    }

    // Worker gone
    drop(f.commands);
    let blank = json!({
        "app_name": "Visual Studio Code",
        "window_title": "x",
        "timestamp": "2026-06-20T17:59:30Z"
    });
    let (status, _) = call(&f.app, Method::POST, "/observations", Some(blank)).await?;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    Ok(())
}

#[tokio::test]
async fn test_sessions_current_and_recent() -> Result<()> {
    let f = fixture()?;
    let (_, current) = call(&f.app, Method::GET, "/sessions/current", None).await?;
    assert!(current.is_null());

    {
        let db = f.db.lock().await;
        db.insert_session(&session(now() - Duration::hours(3), 40, false))?;
        db.insert_session(&session(now() - Duration::hours(2), 25, false))?;
        db.insert_session(&session(now() - Duration::minutes(10), 0, true))?;
    }

    let (status, current) = call(&f.app, Method::GET, "/sessions/current", None).await?;
    assert_eq!(status, StatusCode::OK);
    assert!(current["end_time"].is_null());

    let (_, recent) = call(&f.app, Method::GET, "/sessions/recent?limit=2", None).await?;
    let recent = recent.as_array().cloned().unwrap_or_default();
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0]["id"], current["id"]);
    Ok(())
}

#[tokio::test]
async fn test_whitelist_routes_update_store_and_memory() -> Result<()> {
    let f = fixture()?;

    let (status, body) = call(
        &f.app,
        Method::POST,
        "/whitelist/domains",
        Some(json!({"domain": "https://YouTube.com/"})),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["added"], true);

    let (_, body) = call(&f.app, Method::POST, "/whitelist/apps", Some(json!({"name": "Zed"}))).await?;
    assert_eq!(body["added"], true);

    let (_, listed) = call(&f.app, Method::GET, "/whitelist", None).await?;
    assert_eq!(listed["domains"], json!(["youtube.com"]));
    assert_eq!(listed["apps"], json!(["visual studio code", "zed"]));

    let stored = f.db.lock().await.load_whitelist()?;
    assert_eq!(stored.domains(), ["youtube.com".to_string()]);

    let (_, removed) = call(&f.app, Method::DELETE, "/whitelist/domains/youtube.com", None).await?;
    assert_eq!(removed["removed"], true);
    assert!(f.whitelist.read().await.domains().is_empty());
    assert!(f.db.lock().await.load_whitelist()?.domains().is_empty());

    let (status, _) = call(&f.app, Method::POST, "/whitelist/apps", Some(json!({"name": "  "}))).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn test_graph_and_insight_routes() -> Result<()> {
    let f = fixture()?;
    {
        let mut graph = f.graph.lock().await;
        let watched_at = now() - Duration::days(4);
        let activity = graph.merge_node(GraphNode::new(NodeLabel::Activity, "act_video"))?;
        let concept = graph.merge_node(
            GraphNode::new(NodeLabel::Concept, "Rust Lifetimes").with_property("name", "Rust Lifetimes"),
        )?;
        let mut properties = Properties::new();
        properties.insert(
            "timestamp".to_string(),
            Value::String(watched_at.to_rfc3339()),
        );
        graph.create_edge(&activity.id, &concept.id, EdgeType::Watched, properties, watched_at)?;
    }

    let (_, stats) = call(&f.app, Method::GET, "/graph/stats", None).await?;
    assert_eq!(stats["node_count"], 2);
    assert_eq!(stats["edges_by_type"]["WATCHED"], 1);

    let (status, neighbors) = call(
        &f.app,
        Method::GET,
        "/graph/nodes/concept_rust_lifetimes/neighbors?edge_type=watched",
        None,
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(neighbors["neighbors"][0]["id"], "activity_act_video");

    let (status, _) = call(&f.app, Method::GET, "/graph/nodes/concept_missing/neighbors", None).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = call(
        &f.app,
        Method::GET,
        "/graph/nodes/concept_rust_lifetimes/neighbors?edge_type=LIKES",
        None,
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, gaps) = call(&f.app, Method::GET, "/insights/gaps", None).await?;
    assert_eq!(gaps[0]["concept"], "Rust Lifetimes");
    assert_eq!(gaps[0]["days_since"], 4);

    f.db.lock()
        .await
        .insert_session(&session(now() - Duration::hours(5), 90, false))?;
    let (status, daily) = call(&f.app, Method::GET, "/insights/daily?date=2026-06-20&budget=100", None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(daily["style"], "short");
    assert_eq!(daily["time_spent"]["coding"], 90);
    assert!(daily["summary"].as_str().unwrap_or_default().starts_with("2026-06-20: 1h 30m tracked"));

    let (status, _) = call(&f.app, Method::GET, "/insights/daily?date=20-06-2026", None).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, report) = call(&f.app, Method::POST, "/graph/build", None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["activities"], 0);
    Ok(())
}
