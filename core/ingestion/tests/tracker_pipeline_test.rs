use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use learntrail_ingestion::{
    ActivityClassifier, ContentExtractor, Database, ExtractedContent, ManualClock, RuleEngine,
    SessionCloseHook, SessionManager, TickOutcome, Tracker, TrackerCommand, TrackerWorker,
    Whitelist,
};
use learntrail_schemas::{Activity, ActivityMetadata, Observation, Session, SessionId};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).unwrap()
}

fn coding(project: &str, at: DateTime<Utc>) -> Observation {
    Observation::new(
        "Visual Studio Code",
        &format!("main.rs - {} - Visual Studio Code", project),
        at,
    )
    .with_file_path(&format!("/home/me/code/{}/src/main.rs", project))
}

struct Harness {
    _temp: NamedTempFile,
    db: Arc<Mutex<Database>>,
    clock: Arc<ManualClock>,
}

impl Harness {
    fn new() -> Result<Self> {
        let temp = NamedTempFile::new()?;
        let db = Arc::new(Mutex::new(Database::new(temp.path())?));
        Ok(Self {
            _temp: temp,
            db,
            clock: Arc::new(ManualClock::new(base_time())),
        })
    }

    fn tracker(&self, whitelist: Whitelist) -> Tracker {
        Tracker::new(
            self.db.clone(),
            Arc::new(RwLock::new(whitelist)),
            Arc::new(ActivityClassifier::rule_based()),
            RuleEngine::default(),
            SessionManager::new(self.clock.clone(), Duration::minutes(30)),
        )
    }
}

fn default_whitelist() -> Whitelist {
    Whitelist::from_lists(
        &["visual studio code".to_string(), "chrome".to_string()],
        &["youtube.com".to_string()],
    )
}

#[tokio::test]
async fn test_project_change_yields_two_sessions() -> Result<()> {
    let harness = Harness::new()?;
    let mut tracker = harness.tracker(default_whitelist());
    let t0 = base_time();

    let first = tracker.process_observation(coding("ProjectX", t0)).await?;
    let first_session = match first {
        TickOutcome::Tracked { session_id, .. } => session_id,
        other => panic!("expected tracked, got {:?}", other),
    };

    harness.clock.set(t0 + Duration::seconds(10));
    let second = tracker
        .process_observation(coding("ProjectX", t0 + Duration::seconds(10)))
        .await?;
    assert_eq!(
        second,
        TickOutcome::Absorbed {
            session_id: first_session.clone()
        }
    );

    harness.clock.set(t0 + Duration::seconds(20));
    let third = tracker
        .process_observation(coding("ProjectY", t0 + Duration::seconds(20)))
        .await?;
    let second_session = match third {
        TickOutcome::Tracked { session_id, .. } => session_id,
        other => panic!("expected tracked, got {:?}", other),
    };
    assert_ne!(first_session, second_session);

    let db = harness.db.lock().await;
    let sessions = db.get_recent_sessions(10)?;
    assert_eq!(sessions.len(), 2);

    let closed = db.get_session(&first_session)?.unwrap();
    assert_eq!(closed.aggregated_files.len(), 1);
    assert_eq!(closed.activity_count, 2);
    assert_eq!(closed.duration_seconds, Some(20));
    assert_eq!(closed.project_name.as_deref(), Some("ProjectX"));

    let open = db.get_session(&second_session)?.unwrap();
    assert!(open.is_open());
    assert_eq!(open.project_name.as_deref(), Some("ProjectY"));
    assert_eq!(db.count_activities()?, 2);
    Ok(())
}

#[tokio::test]
async fn test_same_domain_after_timeout_opens_new_session() -> Result<()> {
    let harness = Harness::new()?;
    let mut tracker = harness.tracker(default_whitelist());
    let t0 = base_time();
    let page = |path: &str, at| {
        Observation::new("Google Chrome", "Module docs", at)
            .with_url(&format!("https://docs.rs/tokio/latest/tokio/{}", path))
    };

    let first_session = match tracker.process_observation(page("sync", t0)).await? {
        TickOutcome::Tracked { session_id, .. } => session_id,
        other => panic!("expected tracked, got {:?}", other),
    };
    let folded = tracker
        .process_observation(page("net", t0 + Duration::minutes(2)))
        .await?;
    assert_eq!(
        folded,
        TickOutcome::Absorbed {
            session_id: first_session.clone()
        }
    );

    // Same domain, but well past the session timeout
    let resumed_at = t0 + Duration::minutes(47);
    harness.clock.set(resumed_at);
    let second_session = match tracker.process_observation(page("fs", resumed_at)).await? {
        TickOutcome::Tracked { session_id, .. } => session_id,
        other => panic!("expected a new session, got {:?}", other),
    };
    assert_ne!(first_session, second_session);

    let next = tracker
        .process_observation(page("time", resumed_at + Duration::minutes(1)))
        .await?;
    assert_eq!(
        next,
        TickOutcome::Absorbed {
            session_id: second_session.clone()
        }
    );

    let db = harness.db.lock().await;
    assert_eq!(db.get_recent_sessions(10)?.len(), 2);
    let open = db.get_open_sessions()?;
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].id, second_session);

    let closed = db.get_session(&first_session)?.unwrap();
    assert_eq!(closed.end_time, Some(resumed_at));
    assert_eq!(closed.aggregated_urls.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_swept_session_reopens_on_same_domain() -> Result<()> {
    let harness = Harness::new()?;
    let mut tracker = harness.tracker(default_whitelist());
    let t0 = base_time();
    let page = |at| Observation::new("Google Chrome", "Module docs", at).with_url("https://docs.rs/serde");

    tracker.process_observation(page(t0)).await?;
    harness.clock.set(t0 + Duration::minutes(31));
    assert!(tracker.sweep_idle().await?.is_some());
    assert!(tracker.current_session().is_none());

    let outcome = tracker.process_observation(page(t0 + Duration::minutes(32))).await?;
    assert!(matches!(outcome, TickOutcome::Tracked { .. }));
    assert!(tracker.current_session().is_some());
    Ok(())
}

#[tokio::test]
async fn test_same_game_keeps_its_session() -> Result<()> {
    let harness = Harness::new()?;
    let whitelist = Whitelist::from_lists(&["steam".to_string()], &[]);
    let mut tracker = harness.tracker(whitelist);
    let t0 = base_time();

    let first = tracker.process_observation(Observation::new("Steam", "Factorio", t0)).await?;
    assert!(matches!(first, TickOutcome::Tracked { .. }));

    let again = tracker
        .process_observation(Observation::new("Steam", "Factorio", t0 + Duration::minutes(1)))
        .await?;
    assert_eq!(
        again,
        TickOutcome::Skipped {
            reason: "same game".to_string()
        }
    );

    let db = harness.db.lock().await;
    assert_eq!(db.get_recent_sessions(10)?.len(), 1);
    assert_eq!(db.get_open_sessions()?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_empty_whitelist_rejects_everything() -> Result<()> {
    let harness = Harness::new()?;
    let mut tracker = harness.tracker(Whitelist::new());

    let outcome = tracker.process_observation(coding("ProjectX", base_time())).await?;
    assert_eq!(outcome, TickOutcome::Rejected);
    assert_eq!(harness.db.lock().await.count_activities()?, 0);
    Ok(())
}

#[tokio::test]
async fn test_rewatch_within_minimum_is_not_tracked() -> Result<()> {
    let harness = Harness::new()?;
    let mut tracker = harness.tracker(default_whitelist());
    let t0 = base_time();
    let watch = |at| {
        Observation::new("Chrome", "Ownership explained - YouTube", at)
            .with_url("https://www.youtube.com/watch?v=abc")
    };

    let first = tracker.process_observation(watch(t0)).await?;
    assert!(matches!(first, TickOutcome::Tracked { .. }));

    let again = tracker.process_observation(watch(t0 + Duration::seconds(5))).await?;
    assert!(!matches!(again, TickOutcome::Tracked { .. }));
    assert_eq!(harness.db.lock().await.count_activities()?, 1);
    Ok(())
}

struct StaticExtractor;

#[async_trait]
impl ContentExtractor for StaticExtractor {
    async fn extract(&self, activity: &Activity) -> Result<Option<ExtractedContent>> {
        let mut metadata = ActivityMetadata::default();
        metadata.extra.insert("content_source".to_string(), "static".to_string());
        Ok(Some(ExtractedContent {
            text: format!("contents of {}", activity.title),
            metadata: Some(metadata),
        }))
    }
}

#[tokio::test]
async fn test_content_arrives_after_insert() -> Result<()> {
    let harness = Harness::new()?;
    let mut tracker = harness
        .tracker(default_whitelist())
        .with_extractor(Arc::new(StaticExtractor));

    let activity_id = match tracker.process_observation(coding("ProjectX", base_time())).await? {
        TickOutcome::Tracked { activity_id, .. } => activity_id,
        other => panic!("expected tracked, got {:?}", other),
    };

    let mut ready = false;
    for _ in 0..50 {
        let stored = harness.db.lock().await.get_activity(&activity_id)?.unwrap();
        if stored.content.is_ready() {
            assert!(stored.content.text().unwrap().starts_with("contents of"));
            // Written under the same lock as the content
            assert_eq!(
                stored.metadata.extra.get("content_source").map(String::as_str),
                Some("static")
            );
            ready = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(ready, "content never became ready");
    Ok(())
}

struct RecordingHook {
    closed: Mutex<Vec<SessionId>>,
}

#[async_trait]
impl SessionCloseHook for RecordingHook {
    async fn on_session_closed(&self, session: &Session) -> Result<()> {
        self.closed.lock().await.push(session.id.clone());
        Ok(())
    }
}

#[tokio::test]
async fn test_worker_shutdown_closes_session_and_runs_hooks() -> Result<()> {
    let harness = Harness::new()?;
    let hook = Arc::new(RecordingHook {
        closed: Mutex::new(Vec::new()),
    });
    let tracker = harness.tracker(default_whitelist()).with_hook(hook.clone());

    let (sender, receiver) = mpsc::unbounded_channel();
    let worker = tokio::spawn(TrackerWorker::new(tracker, receiver).run());

    sender.send(TrackerCommand::Observe(coding("ProjectX", base_time())))?;
    // Rejected observations leave the active session alone
    sender.send(TrackerCommand::Observe(Observation::new(
        "Slack",
        "general",
        base_time() + Duration::seconds(30),
    )))?;

    harness.clock.advance(Duration::seconds(90));
    let (reply, closed) = oneshot::channel();
    sender.send(TrackerCommand::Shutdown(reply))?;
    let closed = closed.await?.expect("a session was open");
    worker.await?;

    assert_eq!(closed.duration_seconds, Some(90));
    for _ in 0..50 {
        if !hook.closed.lock().await.is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert_eq!(hook.closed.lock().await.as_slice(), &[closed.id.clone()]);
    Ok(())
}
