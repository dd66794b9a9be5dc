pub mod api;
pub mod composer;
pub mod templates;

pub use api::{router, AppState};
pub use composer::{DailySummary, GapInsight, InsightComposer, SessionDigest};
pub use templates::{SummaryRenderer, SummaryStyle};
