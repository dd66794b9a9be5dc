use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use learntrail_schemas::{generate_session_id, Activity, ActivityType, Session, SessionId};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::aggregator::Aggregator;
use crate::clock::Clock;
use crate::database::Database;
use crate::enrich::domain_of;

/// What `get_or_create_session` did with the activity.
#[derive(Debug, Clone)]
pub enum SessionTransition {
    /// The activity extended the active session.
    Continued,
    /// A new session was opened, closing the previous one if there was one.
    Opened { closed: Option<Session> },
}

/// Why an activity cannot continue the active session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakReason {
    NoActiveSession,
    TimedOut,
    TypeChanged,
    KeyChanged,
}

impl BreakReason {
    /// No live session is left to fold into, so the activity has to open the next one.
    pub fn is_stale(self) -> bool {
        matches!(self, BreakReason::NoActiveSession | BreakReason::TimedOut)
    }
}

impl std::fmt::Display for BreakReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            BreakReason::NoActiveSession => "no active session",
            BreakReason::TimedOut => "session timed out",
            BreakReason::TypeChanged => "activity type changed",
            BreakReason::KeyChanged => "continuity key changed",
        };
        f.write_str(reason)
    }
}

/// What `absorb` did with an observation the rules chose not to track.
#[derive(Debug, Clone, PartialEq)]
pub enum AbsorbOutcome {
    Absorbed(SessionId),
    Refused(BreakReason),
}

#[derive(Debug, Clone)]
pub struct SessionDecision {
    pub session_id: SessionId,
    pub transition: SessionTransition,
}

/// Owns the single active-session slot.
///
/// States are `None` (no active session) and `Some(session)`. Closing is terminal:
/// a closed session is never reopened, a fresh one is created instead.
pub struct SessionManager {
    current: Option<Session>,
    last_activity_time: Option<DateTime<Utc>>,
    timeout: Duration,
    clock: Arc<dyn Clock>,
    aggregator: Aggregator,
}

impl SessionManager {
    pub fn new(clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        Self {
            current: None,
            last_activity_time: None,
            timeout,
            clock,
            aggregator: Aggregator::new(),
        }
    }

    pub fn current(&self) -> Option<&Session> {
        self.current.as_ref()
    }

    pub fn last_activity_time(&self) -> Option<DateTime<Utc>> {
        self.last_activity_time
    }

    /// Close every session left open by a previous process.
    pub fn initialize(&mut self, db: &Database) -> Result<Vec<Session>> {
        let dangling = db.get_open_sessions()?;
        let mut closed = Vec::with_capacity(dangling.len());

        for session in dangling {
            match self.close_session(db, &session.id) {
                Ok(Some(session)) => closed.push(session),
                Ok(None) => {}
                Err(e) => error!("Failed to close dangling session {}: {}", session.id, e),
            }
        }

        if !closed.is_empty() {
            info!("Closed {} dangling sessions on startup", closed.len());
        }
        self.current = None;
        self.last_activity_time = None;
        Ok(closed)
    }

    pub fn get_or_create_session(&mut self, db: &Database, activity: &Activity) -> Result<SessionDecision> {
        if let Some(reason) = self.break_reason(activity) {
            debug!("Starting new session for {}: {}", activity.id, reason);
            return self.rotate(db, activity);
        }

        let session_id = match self.current.as_mut() {
            Some(session) => {
                absorb_into(session, activity);
                if let Err(e) = db.update_session(session) {
                    error!("Failed to update session {}: {}", session.id, e);
                }
                session.id.clone()
            }
            None => return self.rotate(db, activity),
        };
        self.last_activity_time = Some(activity.timestamp);

        Ok(SessionDecision {
            session_id,
            transition: SessionTransition::Continued,
        })
    }

    /// Fold an untracked observation into the active session when it continues it.
    pub fn absorb(&mut self, db: &Database, activity: &Activity) -> AbsorbOutcome {
        if let Some(reason) = self.break_reason(activity) {
            return AbsorbOutcome::Refused(reason);
        }
        let Some(session) = self.current.as_mut() else {
            return AbsorbOutcome::Refused(BreakReason::NoActiveSession);
        };

        absorb_into(session, activity);
        self.last_activity_time = Some(activity.timestamp);
        if let Err(e) = db.update_session(session) {
            error!("Failed to update session {}: {}", session.id, e);
        }
        AbsorbOutcome::Absorbed(session.id.clone())
    }

    /// Why the activity cannot continue the active session, if it cannot.
    fn break_reason(&self, activity: &Activity) -> Option<BreakReason> {
        let Some(session) = &self.current else {
            return Some(BreakReason::NoActiveSession);
        };

        if let Some(last) = self.last_activity_time {
            if activity.timestamp - last > self.timeout {
                return Some(BreakReason::TimedOut);
            }
        }

        if session.activity_type != activity.activity_type {
            return Some(BreakReason::TypeChanged);
        }

        if !continues(session, activity) {
            return Some(BreakReason::KeyChanged);
        }

        None
    }

    fn rotate(&mut self, db: &Database, activity: &Activity) -> Result<SessionDecision> {
        // A failed close must not block the new session
        let closed = match self.close_current_session(db) {
            Ok(closed) => closed,
            Err(e) => {
                error!("Failed to close session: {}", e);
                self.current = None;
                None
            }
        };

        let mut session = Session {
            id: generate_session_id(),
            activity_type: activity.activity_type,
            app_name: Some(activity.app_name.clone()),
            project_name: activity.project_name.clone(),
            start_time: activity.timestamp,
            end_time: None,
            duration_seconds: None,
            aggregated_files: Vec::new(),
            aggregated_urls: Vec::new(),
            summary: None,
            concepts: Vec::new(),
            confidence: activity.confidence,
            activity_count: 0,
        };
        absorb_into(&mut session, activity);

        db.insert_session(&session)?;
        info!(
            "Opened session {} ({}, project={:?})",
            session.id, session.activity_type, session.project_name
        );

        let session_id = session.id.clone();
        self.current = Some(session);
        self.last_activity_time = Some(activity.timestamp);

        Ok(SessionDecision {
            session_id,
            transition: SessionTransition::Opened { closed },
        })
    }

    /// Close the active session when nothing continued it within the timeout.
    pub fn close_if_idle(&mut self, db: &Database) -> Result<Option<Session>> {
        let idle = match (&self.current, self.last_activity_time) {
            (Some(_), Some(last)) => self.clock.now() - last > self.timeout,
            _ => false,
        };
        if !idle {
            return Ok(None);
        }
        debug!("Active session idle for longer than {} minutes", self.timeout.num_minutes());
        self.close_current_session(db)
    }

    /// Close the active session, if any, and clear the slot.
    pub fn close_current_session(&mut self, db: &Database) -> Result<Option<Session>> {
        let Some(current) = self.current.take() else {
            return Ok(None);
        };
        self.last_activity_time = None;
        self.close_session(db, &current.id)
    }

    /// Close a session by id. Storage is authoritative: an already closed session is
    /// returned unchanged, a missing one is logged and yields `None`.
    pub fn close_session(&mut self, db: &Database, id: &SessionId) -> Result<Option<Session>> {
        if self.current.as_ref().map(|s| &s.id) == Some(id) {
            self.current = None;
            self.last_activity_time = None;
        }

        let Some(mut session) = db.get_session(id)? else {
            error!("Cannot close session {}: not found", id);
            return Ok(None);
        };

        if !session.is_open() {
            debug!("Session {} already closed", id);
            return Ok(Some(session));
        }

        let end_time = self.clock.now();
        let duration = (end_time - session.start_time).num_seconds();
        if duration < 0 {
            warn!("Session {} ends before it starts, clamping duration", id);
        }

        let activities = db.get_activities_by_session(id)?;
        let aggregation = self.aggregator.aggregate_session(&session, &activities);

        session.end_time = Some(end_time);
        session.duration_seconds = Some(duration.max(0));
        session.summary = Some(aggregation.summary);
        session.concepts = aggregation.concepts;
        if !activities.is_empty() {
            session.confidence = aggregation.confidence;
        }

        if !db.close_session(&session)? {
            // Closed concurrently, return what storage holds
            return db.get_session(id);
        }
        Ok(Some(session))
    }
}

fn absorb_into(session: &mut Session, activity: &Activity) {
    if let Some(path) = &activity.file_path {
        session.push_file(path);
    }
    if let Some(url) = &activity.url {
        session.push_url(url);
    }
    if session.project_name.is_none() {
        session.project_name = activity.project_name.clone();
    }
    session.activity_count += 1;
}

/// Continuity test against the session's key, not the previous raw activity.
fn continues(session: &Session, activity: &Activity) -> bool {
    match session.activity_type {
        ActivityType::Coding => session.project_name == activity.project_name,
        ActivityType::Browsing => {
            let session_domain = session.first_url().and_then(domain_of);
            let domain = activity.url.as_deref().and_then(domain_of);
            session_domain == domain
        }
        ActivityType::Reading => match (session.first_file(), activity.file_path.as_deref()) {
            (Some(first), Some(path)) => first == path,
            (None, None) => same_app(session, activity),
            _ => false,
        },
        ActivityType::Gaming => false,
        ActivityType::Watching
        | ActivityType::Shopping
        | ActivityType::Social
        | ActivityType::Entertainment
        | ActivityType::Work
        | ActivityType::Learning
        | ActivityType::Other => same_app(session, activity),
    }
}

fn same_app(session: &Session, activity: &Activity) -> bool {
    session
        .app_name
        .as_deref()
        .map(|app| app.eq_ignore_ascii_case(&activity.app_name))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use learntrail_schemas::{
        generate_activity_id, ActivityContent, ActivityMetadata, Classification,
    };
    use tempfile::NamedTempFile;

    fn coding(project: &str, ts: DateTime<Utc>) -> Activity {
        Activity {
            id: generate_activity_id(),
            source_type: None,
            activity_type: ActivityType::Coding,
            app_name: "Code".into(),
            title: format!("main.rs - {} - Visual Studio Code", project),
            content: ActivityContent::Pending,
            url: None,
            file_path: Some(format!("/code/{}/src/main.rs", project)),
            project_name: Some(project.into()),
            video_id: None,
            game_name: None,
            session_id: None,
            classification: Classification::Learning,
            confidence: 0.7,
            timestamp: ts,
            metadata: ActivityMetadata::default(),
        }
    }

    fn setup() -> (NamedTempFile, Database, Arc<ManualClock>, SessionManager) {
        let temp = NamedTempFile::new().unwrap();
        let db = Database::new(temp.path()).unwrap();
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()));
        let manager = SessionManager::new(clock.clone(), Duration::minutes(30));
        (temp, db, clock, manager)
    }

    #[test]
    fn test_first_activity_opens_session() {
        let (_temp, db, clock, mut manager) = setup();
        let decision = manager.get_or_create_session(&db, &coding("x", clock.now())).unwrap();

        assert!(matches!(decision.transition, SessionTransition::Opened { closed: None }));
        let stored = db.get_session(&decision.session_id).unwrap().unwrap();
        assert!(stored.is_open());
        assert_eq!(stored.activity_count, 1);
    }

    #[test]
    fn test_same_project_continues() {
        let (_temp, db, clock, mut manager) = setup();
        let start = clock.now();
        let first = manager.get_or_create_session(&db, &coding("x", start)).unwrap();
        let second = manager
            .get_or_create_session(&db, &coding("x", start + Duration::seconds(10)))
            .unwrap();

        assert!(matches!(second.transition, SessionTransition::Continued));
        assert_eq!(first.session_id, second.session_id);
        assert_eq!(manager.current().unwrap().aggregated_files.len(), 1);
    }

    #[test]
    fn test_timeout_rotates_with_exact_duration() {
        let (_temp, db, clock, mut manager) = setup();
        let start = clock.now();
        let first = manager.get_or_create_session(&db, &coding("x", start)).unwrap();

        let later = start + Duration::minutes(31);
        clock.set(later);
        let second = manager.get_or_create_session(&db, &coding("x", later)).unwrap();

        assert_ne!(first.session_id, second.session_id);
        let closed = match second.transition {
            SessionTransition::Opened { closed: Some(closed) } => closed,
            other => panic!("expected rotation, got {:?}", other),
        };
        let end = closed.end_time.unwrap();
        assert_eq!(end, later);
        assert_eq!(closed.duration_seconds, Some((end - closed.start_time).num_seconds()));
    }

    #[test]
    fn test_type_change_rotates() {
        let (_temp, db, clock, mut manager) = setup();
        let start = clock.now();
        manager.get_or_create_session(&db, &coding("x", start)).unwrap();

        let mut reading = coding("x", start + Duration::seconds(5));
        reading.activity_type = ActivityType::Reading;
        let decision = manager.get_or_create_session(&db, &reading).unwrap();
        assert!(matches!(decision.transition, SessionTransition::Opened { closed: Some(_) }));
        assert_eq!(manager.current().unwrap().activity_type, ActivityType::Reading);
    }

    #[test]
    fn test_close_is_idempotent() {
        let (_temp, db, clock, mut manager) = setup();
        let decision = manager.get_or_create_session(&db, &coding("x", clock.now())).unwrap();
        clock.advance(Duration::seconds(42));

        let first = manager.close_current_session(&db).unwrap().unwrap();
        assert!(manager.current().is_none());
        let second = manager.close_session(&db, &decision.session_id).unwrap().unwrap();

        assert_eq!(first.end_time, second.end_time);
        assert_eq!(second.duration_seconds, Some(42));
        assert_eq!(second.aggregated_files, first.aggregated_files);
        assert!(manager.close_current_session(&db).unwrap().is_none());
    }

    #[test]
    fn test_idle_sweep() {
        let (_temp, db, clock, mut manager) = setup();
        manager.get_or_create_session(&db, &coding("x", clock.now())).unwrap();

        clock.advance(Duration::minutes(10));
        assert!(manager.close_if_idle(&db).unwrap().is_none());

        clock.advance(Duration::minutes(25));
        let closed = manager.close_if_idle(&db).unwrap().unwrap();
        assert_eq!(closed.duration_seconds, Some(35 * 60));
        assert!(manager.current().is_none());
    }

    #[test]
    fn test_missing_session_close_returns_none() {
        let (_temp, db, _clock, mut manager) = setup();
        assert!(manager.close_session(&db, &generate_session_id()).unwrap().is_none());
    }

    #[test]
    fn test_absorb_only_when_continuing() {
        let (_temp, db, clock, mut manager) = setup();
        let start = clock.now();
        manager.get_or_create_session(&db, &coding("x", start)).unwrap();

        let mut other_file = coding("x", start + Duration::seconds(20));
        other_file.file_path = Some("/code/x/src/lib.rs".into());
        assert!(matches!(manager.absorb(&db, &other_file), AbsorbOutcome::Absorbed(_)));
        assert_eq!(
            manager.absorb(&db, &coding("y", start + Duration::seconds(30))),
            AbsorbOutcome::Refused(BreakReason::KeyChanged)
        );
        assert_eq!(
            manager.absorb(&db, &coding("x", start + Duration::minutes(45))),
            AbsorbOutcome::Refused(BreakReason::TimedOut)
        );

        let session = manager.current().unwrap();
        assert_eq!(session.aggregated_files.len(), 2);
        assert_eq!(session.activity_count, 2);
    }

    #[test]
    fn test_close_summary_covers_folded_files() {
        let (_temp, db, clock, mut manager) = setup();
        let start = clock.now();
        let decision = manager.get_or_create_session(&db, &coding("px", start)).unwrap();

        for (i, name) in ["lib.rs", "db.rs", "api.rs"].iter().enumerate() {
            let mut switch = coding("px", start + Duration::seconds(20 * (i as i64 + 1)));
            switch.title = format!("{} - px - Visual Studio Code", name);
            switch.file_path = Some(format!("/code/px/src/{}", name));
            assert!(matches!(manager.absorb(&db, &switch), AbsorbOutcome::Absorbed(_)));
        }

        clock.advance(Duration::minutes(2));
        let closed = manager.close_current_session(&db).unwrap().unwrap();
        assert_eq!(closed.id, decision.session_id);
        assert_eq!(closed.aggregated_files.len(), 4);
        assert_eq!(closed.summary.as_deref(), Some("Worked on px: 4 files"));
    }

    #[test]
    fn test_gaming_never_continues() {
        let (_temp, db, clock, mut manager) = setup();
        let start = clock.now();
        let mut game = coding("x", start);
        game.activity_type = ActivityType::Gaming;
        game.game_name = Some("Factorio".into());
        let first = manager.get_or_create_session(&db, &game).unwrap();

        game.timestamp = start + Duration::seconds(5);
        let second = manager.get_or_create_session(&db, &game).unwrap();
        assert_ne!(first.session_id, second.session_id);
    }

    #[test]
    fn test_initialize_closes_dangling_sessions() {
        let (temp, db, clock, mut manager) = setup();
        manager.get_or_create_session(&db, &coding("x", clock.now())).unwrap();
        drop(manager);

        let db = Database::new(temp.path()).unwrap();
        let mut restarted = SessionManager::new(clock.clone(), Duration::minutes(30));
        let closed = restarted.initialize(&db).unwrap();

        assert_eq!(closed.len(), 1);
        assert!(db.get_open_sessions().unwrap().is_empty());
        assert!(restarted.current().is_none());
    }
}
