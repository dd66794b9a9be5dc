pub mod aggregator;
pub mod classifier;
pub mod clock;
pub mod content;
pub mod config;
pub mod database;
pub mod enrich;
pub mod rules;
pub mod session;
pub mod significance;
pub mod tracker;
pub mod whitelist;

pub use aggregator::{filter_noise, AggregatedData, Aggregation, Aggregator};
pub use classifier::{classify_rules, ActivityClassifier, MlClassifier, MlPrediction};
pub use clock::{Clock, ManualClock, SystemClock};
pub use content::{ContentExtractor, ExtractedContent, FileContentExtractor};
pub use config::IngestionConfig;
pub use database::Database;
pub use enrich::{determine_activity_type, ActivityFactory};
pub use rules::{RuleConfig, RuleDecision, RuleEngine, RuleOverride, RuleSet};
pub use session::{
    AbsorbOutcome, BreakReason, SessionDecision, SessionManager, SessionTransition,
};
pub use significance::SignificanceFilter;
pub use tracker::{SessionCloseHook, TickOutcome, Tracker, TrackerCommand, TrackerWorker};
pub use whitelist::Whitelist;
