use anyhow::Result;
use async_trait::async_trait;
use learntrail_schemas::{Activity, ActivityId, Observation, Session, SessionId};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::classifier::ActivityClassifier;
use crate::content::ContentExtractor;
use crate::database::Database;
use crate::enrich::ActivityFactory;
use crate::rules::RuleEngine;
use crate::session::{AbsorbOutcome, SessionManager, SessionTransition};
use crate::whitelist::Whitelist;

/// Notified after a session is closed and persisted.
#[async_trait]
pub trait SessionCloseHook: Send + Sync {
    async fn on_session_closed(&self, session: &Session) -> Result<()>;
}

/// Outcome of one observation through the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Rejected,
    Absorbed { session_id: SessionId },
    Skipped { reason: String },
    Tracked { activity_id: ActivityId, session_id: SessionId },
}

/// Observation → whitelist → classifier → rules → session pipeline.
pub struct Tracker {
    db: Arc<Mutex<Database>>,
    whitelist: Arc<RwLock<Whitelist>>,
    classifier: Arc<ActivityClassifier>,
    rules: RuleEngine,
    sessions: SessionManager,
    last_tracked: Option<Activity>,
    extractor: Option<Arc<dyn ContentExtractor>>,
    hooks: Vec<Arc<dyn SessionCloseHook>>,
}

impl Tracker {
    pub fn new(
        db: Arc<Mutex<Database>>,
        whitelist: Arc<RwLock<Whitelist>>,
        classifier: Arc<ActivityClassifier>,
        rules: RuleEngine,
        sessions: SessionManager,
    ) -> Self {
        Self {
            db,
            whitelist,
            classifier,
            rules,
            sessions,
            last_tracked: None,
            extractor: None,
            hooks: Vec::new(),
        }
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn ContentExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn SessionCloseHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn current_session(&self) -> Option<&Session> {
        self.sessions.current()
    }

    /// Close dangling sessions from a previous run and restore the last tracked activity.
    pub async fn initialize(&mut self) -> Result<Vec<Session>> {
        let closed = {
            let db = self.db.lock().await;
            let closed = self.sessions.initialize(&db)?;
            self.last_tracked = db.get_latest_activity()?;
            closed
        };
        for session in &closed {
            self.notify_closed(session.clone());
        }
        Ok(closed)
    }

    pub async fn process_observation(&mut self, observation: Observation) -> Result<TickOutcome> {
        if !self.whitelist.read().await.check(&observation) {
            return Ok(TickOutcome::Rejected);
        }

        let classification = self.classifier.classify(&observation).await;
        let mut activity = ActivityFactory::from_observation(&observation, &classification);
        let decision = self.rules.apply_rules(&activity, self.last_tracked.as_ref());

        let mut closed = None;
        let outcome = {
            let db = self.db.lock().await;

            let untracked = if decision.should_track {
                None
            } else {
                match self.sessions.absorb(&db, &activity) {
                    AbsorbOutcome::Absorbed(session_id) => {
                        Some(TickOutcome::Absorbed { session_id })
                    }
                    // Nothing live to fold into: the observation opens the next session
                    AbsorbOutcome::Refused(reason) if reason.is_stale() => {
                        debug!(
                            "Rules skipped {} ({}), tracking it anyway: {}",
                            activity.id, decision.reason, reason
                        );
                        None
                    }
                    AbsorbOutcome::Refused(_) => Some(TickOutcome::Skipped {
                        reason: decision.reason.clone(),
                    }),
                }
            };

            if let Some(untracked) = untracked {
                untracked
            } else {
                let session = self.sessions.get_or_create_session(&db, &activity)?;
                if let SessionTransition::Opened { closed: Some(previous) } = session.transition {
                    closed = Some(previous);
                }

                activity.session_id = Some(session.session_id.clone());
                db.insert_activity(&activity)?;
                info!(
                    "Tracked {} activity {} in session {} ({})",
                    activity.activity_type, activity.id, session.session_id, decision.reason
                );

                TickOutcome::Tracked {
                    activity_id: activity.id.clone(),
                    session_id: session.session_id,
                }
            }
        };

        if let Some(session) = closed {
            self.notify_closed(session);
        }

        if matches!(outcome, TickOutcome::Tracked { .. }) {
            self.spawn_enrichment(activity.clone());
            self.last_tracked = Some(activity);
        }

        Ok(outcome)
    }

    /// Close the active session if it has been idle past the timeout.
    pub async fn sweep_idle(&mut self) -> Result<Option<Session>> {
        let closed = {
            let db = self.db.lock().await;
            self.sessions.close_if_idle(&db)?
        };
        if let Some(session) = &closed {
            self.notify_closed(session.clone());
        }
        Ok(closed)
    }

    pub async fn close_current_session(&mut self) -> Result<Option<Session>> {
        let closed = {
            let db = self.db.lock().await;
            self.sessions.close_current_session(&db)?
        };
        if let Some(session) = &closed {
            self.notify_closed(session.clone());
        }
        Ok(closed)
    }

    fn notify_closed(&self, session: Session) {
        for hook in &self.hooks {
            let hook = hook.clone();
            let session = session.clone();
            tokio::spawn(async move {
                if let Err(e) = hook.on_session_closed(&session).await {
                    error!("Session close hook failed for {}: {}", session.id, e);
                }
            });
        }
    }

    /// Fire-and-forget content extraction; the row stays `Pending` until this lands.
    fn spawn_enrichment(&self, activity: Activity) {
        let Some(extractor) = self.extractor.clone() else {
            return;
        };
        let db = self.db.clone();

        tokio::spawn(async move {
            // Freshly inserted rows start at version 0
            let expected_version = 0;
            match extractor.extract(&activity).await {
                Ok(Some(content)) => {
                    let db = db.lock().await;
                    match db.update_activity_content(&activity.id, expected_version, &content.text) {
                        Ok(true) => debug!("Content ready for {}", activity.id),
                        Ok(false) => debug!("Content for {} already written", activity.id),
                        Err(e) => error!("Failed to store content for {}: {}", activity.id, e),
                    }
                    if let Some(patch) = content.metadata {
                        if let Err(e) = db.merge_activity_metadata(&activity.id, patch) {
                            error!("Failed to merge metadata for {}: {}", activity.id, e);
                        }
                    }
                }
                Ok(None) => debug!("No content extracted for {}", activity.id),
                Err(e) => warn!("Content extraction failed for {}: {}", activity.id, e),
            }
        });
    }
}

// ============================================================================
// Worker
// ============================================================================

#[derive(Debug)]
pub enum TrackerCommand {
    Observe(Observation),
    /// Close the session if idle past the timeout.
    Sweep,
    /// Close the active session and stop the worker.
    Shutdown(oneshot::Sender<Option<Session>>),
}

/// Background worker that serialises pipeline runs through a channel
pub struct TrackerWorker {
    tracker: Tracker,
    receiver: mpsc::UnboundedReceiver<TrackerCommand>,
}

impl TrackerWorker {
    pub fn new(tracker: Tracker, receiver: mpsc::UnboundedReceiver<TrackerCommand>) -> Self {
        Self { tracker, receiver }
    }

    /// Processes commands until the channel closes or a shutdown arrives
    pub async fn run(mut self) {
        info!("Tracker worker started");

        while let Some(command) = self.receiver.recv().await {
            match command {
                TrackerCommand::Observe(observation) => {
                    let app = observation.app_name.clone();
                    match self.tracker.process_observation(observation).await {
                        Ok(outcome) => debug!("Observation from {}: {:?}", app, outcome),
                        // One bad observation must not stop the loop
                        Err(e) => error!("Failed to process observation from {}: {}", app, e),
                    }
                }
                TrackerCommand::Sweep => {
                    if let Err(e) = self.tracker.sweep_idle().await {
                        error!("Idle sweep failed: {}", e);
                    }
                }
                TrackerCommand::Shutdown(reply) => {
                    let closed = match self.tracker.close_current_session().await {
                        Ok(closed) => closed,
                        Err(e) => {
                            error!("Failed to close session on shutdown: {}", e);
                            None
                        }
                    };
                    let _ = reply.send(closed);
                    info!("Tracker worker shut down");
                    return;
                }
            }
        }

        warn!("Tracker worker stopped - channel closed");
    }
}
