use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use learntrail_schemas::{
    Activity, ActivityContent, ActivityId, ActivityMetadata, ActivityType, Classification,
    Session, SessionId,
};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::whitelist::{normalize_domain, Whitelist};

const ACTIVITY_COLUMNS: &str = "id, source_type, activity_type, app_name, title, content_state,
    content, url, file_path, project_name, video_id, game_name, session_id, classification,
    confidence, timestamp, metadata";

const SESSION_COLUMNS: &str = "id, activity_type, app_name, project_name, start_time, end_time,
    duration_seconds, aggregated_files, aggregated_urls, summary, concepts, confidence,
    activity_count";

/// Relational store for activities, sessions and the whitelist.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the database and make sure the schema exists
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        // Indexing opens its own connection to the same file
        conn.busy_timeout(Duration::from_secs(5))?;

        let db = Self { conn };
        db.init_schema()?;

        info!("Database initialized");
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS activities (
                id TEXT PRIMARY KEY,
                source_type TEXT,
                activity_type TEXT NOT NULL,
                app_name TEXT NOT NULL,
                title TEXT NOT NULL,
                content_state TEXT NOT NULL DEFAULT 'pending',
                content TEXT,
                content_version INTEGER NOT NULL DEFAULT 0,
                url TEXT,
                file_path TEXT,
                project_name TEXT,
                video_id TEXT,
                game_name TEXT,
                session_id TEXT,
                classification TEXT NOT NULL,
                confidence REAL NOT NULL,
                timestamp TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}'
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_activities_session ON activities(session_id)",
            [],
        )?;
        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_activities_timestamp ON activities(timestamp)",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                activity_type TEXT NOT NULL,
                app_name TEXT,
                project_name TEXT,
                start_time TEXT NOT NULL,
                end_time TEXT,
                duration_seconds INTEGER,
                aggregated_files TEXT NOT NULL DEFAULT '[]',
                aggregated_urls TEXT NOT NULL DEFAULT '[]',
                summary TEXT,
                concepts TEXT NOT NULL DEFAULT '[]',
                confidence REAL NOT NULL DEFAULT 0,
                activity_count INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_sessions_start ON sessions(start_time)",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS whitelist_apps (
                name TEXT PRIMARY KEY,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS whitelist_domains (
                domain TEXT PRIMARY KEY,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    // ========================================================================
    // Activities
    // ========================================================================

    pub fn insert_activity(&self, activity: &Activity) -> Result<()> {
        let metadata_json = serde_json::to_string(&activity.metadata)?;
        let (state, content) = match &activity.content {
            ActivityContent::Pending => ("pending", None),
            ActivityContent::Ready(text) => ("ready", Some(text.as_str())),
        };

        self.conn.execute(
            "INSERT INTO activities (id, source_type, activity_type, app_name, title, content_state,
                                     content, url, file_path, project_name, video_id, game_name,
                                     session_id, classification, confidence, timestamp, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                activity.id.0,
                activity.source_type,
                activity.activity_type.as_str(),
                activity.app_name,
                activity.title,
                state,
                content,
                activity.url,
                activity.file_path,
                activity.project_name,
                activity.video_id,
                activity.game_name,
                activity.session_id.as_ref().map(|s| s.0.as_str()),
                activity.classification.as_str(),
                activity.confidence,
                format_ts(activity.timestamp),
                metadata_json,
            ],
        )?;

        debug!("Inserted activity: {} ({})", activity.id, activity.activity_type);
        Ok(())
    }

    pub fn get_activity(&self, id: &ActivityId) -> Result<Option<Activity>> {
        let activity = self
            .conn
            .query_row(
                &format!("SELECT {} FROM activities WHERE id = ?1", ACTIVITY_COLUMNS),
                params![id.0],
                row_to_activity,
            )
            .optional()?;
        Ok(activity)
    }

    /// Current content version, used as the expected value of the compare-and-set.
    pub fn content_version(&self, id: &ActivityId) -> Result<Option<i64>> {
        let version = self
            .conn
            .query_row(
                "SELECT content_version FROM activities WHERE id = ?1",
                params![id.0],
                |row| row.get(0),
            )
            .optional()?;
        Ok(version)
    }

    /// Compare-and-set the content. Returns false when another writer got there first.
    pub fn update_activity_content(
        &self,
        id: &ActivityId,
        expected_version: i64,
        text: &str,
    ) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE activities
             SET content_state = 'ready', content = ?1, content_version = content_version + 1
             WHERE id = ?2 AND content_version = ?3",
            params![text, id.0, expected_version],
        )?;

        if changed == 0 {
            debug!(
                "Content update for {} lost the race (expected version {})",
                id, expected_version
            );
        }
        Ok(changed == 1)
    }

    /// Merge metadata into an existing activity. Returns false if the activity is unknown.
    pub fn merge_activity_metadata(&self, id: &ActivityId, patch: ActivityMetadata) -> Result<bool> {
        let tx = self.conn.unchecked_transaction()?;
        let current: Option<String> = tx
            .query_row(
                "SELECT metadata FROM activities WHERE id = ?1",
                params![id.0],
                |row| row.get(0),
            )
            .optional()?;

        let Some(current) = current else {
            return Ok(false);
        };

        let mut metadata: ActivityMetadata = serde_json::from_str(&current)?;
        metadata.merge(patch);
        tx.execute(
            "UPDATE activities SET metadata = ?1 WHERE id = ?2",
            params![serde_json::to_string(&metadata)?, id.0],
        )?;
        tx.commit()?;
        Ok(true)
    }

    pub fn get_activities_by_session(&self, session_id: &SessionId) -> Result<Vec<Activity>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM activities WHERE session_id = ?1 ORDER BY timestamp ASC",
            ACTIVITY_COLUMNS
        ))?;
        let activities = stmt
            .query_map(params![session_id.0], row_to_activity)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(activities)
    }

    /// Activities at or after `since`, oldest first, at most `limit`.
    pub fn get_activities_since(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<Activity>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM (
                 SELECT {} FROM activities WHERE timestamp >= ?1 ORDER BY timestamp DESC LIMIT ?2
             ) ORDER BY timestamp ASC",
            ACTIVITY_COLUMNS, ACTIVITY_COLUMNS
        ))?;
        let activities = stmt
            .query_map(params![format_ts(since), limit as i64], row_to_activity)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(activities)
    }

    pub fn get_recent_activities(&self, limit: usize) -> Result<Vec<Activity>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM activities ORDER BY timestamp DESC LIMIT ?1",
            ACTIVITY_COLUMNS
        ))?;
        let activities = stmt
            .query_map(params![limit as i64], row_to_activity)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(activities)
    }

    pub fn get_latest_activity(&self) -> Result<Option<Activity>> {
        Ok(self.get_recent_activities(1)?.into_iter().next())
    }

    pub fn count_activities(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM activities", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    pub fn insert_session(&self, session: &Session) -> Result<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO sessions ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                SESSION_COLUMNS
            ),
            params![
                session.id.0,
                session.activity_type.as_str(),
                session.app_name,
                session.project_name,
                format_ts(session.start_time),
                session.end_time.map(format_ts),
                session.duration_seconds,
                serde_json::to_string(&session.aggregated_files)?,
                serde_json::to_string(&session.aggregated_urls)?,
                session.summary,
                serde_json::to_string(&session.concepts)?,
                session.confidence,
                session.activity_count,
            ],
        )?;

        debug!("Inserted session: {} ({})", session.id, session.activity_type);
        Ok(())
    }

    /// Persist the running aggregation of an open session. Closed sessions are left untouched.
    pub fn update_session(&self, session: &Session) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE sessions
             SET project_name = ?1, aggregated_files = ?2, aggregated_urls = ?3, activity_count = ?4
             WHERE id = ?5 AND end_time IS NULL",
            params![
                session.project_name,
                serde_json::to_string(&session.aggregated_files)?,
                serde_json::to_string(&session.aggregated_urls)?,
                session.activity_count,
                session.id.0,
            ],
        )?;
        Ok(changed == 1)
    }

    /// Write the terminal fields. Only the first close of a session wins.
    pub fn close_session(&self, session: &Session) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE sessions
             SET end_time = ?1, duration_seconds = ?2, summary = ?3, concepts = ?4, confidence = ?5
             WHERE id = ?6 AND end_time IS NULL",
            params![
                session.end_time.map(format_ts),
                session.duration_seconds,
                session.summary,
                serde_json::to_string(&session.concepts)?,
                session.confidence,
                session.id.0,
            ],
        )?;

        if changed == 1 {
            info!(
                "Closed session {} ({}s)",
                session.id,
                session.duration_seconds.unwrap_or_default()
            );
        }
        Ok(changed == 1)
    }

    pub fn get_session(&self, id: &SessionId) -> Result<Option<Session>> {
        let session = self
            .conn
            .query_row(
                &format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS),
                params![id.0],
                row_to_session,
            )
            .optional()?;
        Ok(session)
    }

    pub fn get_open_sessions(&self) -> Result<Vec<Session>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM sessions WHERE end_time IS NULL ORDER BY start_time ASC",
            SESSION_COLUMNS
        ))?;
        let sessions = stmt
            .query_map([], row_to_session)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sessions)
    }

    pub fn get_recent_sessions(&self, limit: usize) -> Result<Vec<Session>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM sessions ORDER BY start_time DESC LIMIT ?1",
            SESSION_COLUMNS
        ))?;
        let sessions = stmt
            .query_map(params![limit as i64], row_to_session)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sessions)
    }

    /// Closed sessions that started inside `[start, end)`.
    pub fn get_closed_sessions_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Session>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM sessions
             WHERE start_time >= ?1 AND start_time < ?2 AND end_time IS NOT NULL
             ORDER BY start_time ASC",
            SESSION_COLUMNS
        ))?;
        let sessions = stmt
            .query_map(params![format_ts(start), format_ts(end)], row_to_session)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sessions)
    }

    // ========================================================================
    // Whitelist
    // ========================================================================

    pub fn load_whitelist(&self) -> Result<Whitelist> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM whitelist_apps ORDER BY created_at ASC")?;
        let apps = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = self
            .conn
            .prepare("SELECT domain FROM whitelist_domains ORDER BY created_at ASC")?;
        let domains = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Whitelist::from_lists(&apps, &domains))
    }

    pub fn add_whitelist_app(&self, name: &str) -> Result<bool> {
        let name = name.trim().to_lowercase();
        if name.is_empty() {
            return Ok(false);
        }
        let changed = self.conn.execute(
            "INSERT OR IGNORE INTO whitelist_apps (name, created_at) VALUES (?1, ?2)",
            params![name, format_ts(Utc::now())],
        )?;
        Ok(changed == 1)
    }

    pub fn remove_whitelist_app(&self, name: &str) -> Result<bool> {
        let changed = self.conn.execute(
            "DELETE FROM whitelist_apps WHERE name = ?1",
            params![name.trim().to_lowercase()],
        )?;
        Ok(changed == 1)
    }

    pub fn add_whitelist_domain(&self, domain: &str) -> Result<bool> {
        let domain = normalize_domain(domain);
        if domain.is_empty() {
            return Ok(false);
        }
        let changed = self.conn.execute(
            "INSERT OR IGNORE INTO whitelist_domains (domain, created_at) VALUES (?1, ?2)",
            params![domain, format_ts(Utc::now())],
        )?;
        Ok(changed == 1)
    }

    pub fn remove_whitelist_domain(&self, domain: &str) -> Result<bool> {
        let changed = self.conn.execute(
            "DELETE FROM whitelist_domains WHERE domain = ?1",
            params![normalize_domain(domain)],
        )?;
        Ok(changed == 1)
    }
}

// ============================================================================
// Row mapping
// ============================================================================

/// Fixed-width RFC3339 so that text ordering matches time ordering.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))
}

fn json_error(err: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(err))
}

fn parse_activity_type(raw: &str) -> rusqlite::Result<ActivityType> {
    raw.parse::<ActivityType>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, Type::Text, e.into())
    })
}

fn row_to_activity(row: &Row) -> rusqlite::Result<Activity> {
    let content_state: String = row.get(5)?;
    let content_text: Option<String> = row.get(6)?;
    let content = match (content_state.as_str(), content_text) {
        ("ready", Some(text)) => ActivityContent::Ready(text),
        _ => ActivityContent::Pending,
    };

    let activity_type: String = row.get(2)?;
    let classification: String = row.get(13)?;
    let timestamp: String = row.get(15)?;
    let metadata_json: String = row.get(16)?;

    Ok(Activity {
        id: ActivityId(row.get(0)?),
        source_type: row.get(1)?,
        activity_type: parse_activity_type(&activity_type)?,
        app_name: row.get(3)?,
        title: row.get(4)?,
        content,
        url: row.get(7)?,
        file_path: row.get(8)?,
        project_name: row.get(9)?,
        video_id: row.get(10)?,
        game_name: row.get(11)?,
        session_id: row.get::<_, Option<String>>(12)?.map(SessionId),
        classification: Classification::parse(&classification),
        confidence: row.get(14)?,
        timestamp: parse_ts(&timestamp)?,
        metadata: serde_json::from_str(&metadata_json).map_err(json_error)?,
    })
}

fn row_to_session(row: &Row) -> rusqlite::Result<Session> {
    let activity_type: String = row.get(1)?;
    let start_time: String = row.get(4)?;
    let end_time: Option<String> = row.get(5)?;
    let files: String = row.get(7)?;
    let urls: String = row.get(8)?;
    let concepts: String = row.get(10)?;

    Ok(Session {
        id: SessionId(row.get(0)?),
        activity_type: parse_activity_type(&activity_type)?,
        app_name: row.get(2)?,
        project_name: row.get(3)?,
        start_time: parse_ts(&start_time)?,
        end_time: end_time.as_deref().map(parse_ts).transpose()?,
        duration_seconds: row.get(6)?,
        aggregated_files: serde_json::from_str(&files).map_err(json_error)?,
        aggregated_urls: serde_json::from_str(&urls).map_err(json_error)?,
        summary: row.get(9)?,
        concepts: serde_json::from_str(&concepts).map_err(json_error)?,
        confidence: row.get(11)?,
        activity_count: row.get(12)?,
    })
}
