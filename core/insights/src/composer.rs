use anyhow::Result;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use learntrail_indexing::graph_store::edge_time;
use learntrail_indexing::{KnowledgeGraph, LearningGap};
use learntrail_ingestion::Database;
use learntrail_schemas::{ActivityType, NodeLabel, Session};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::templates::{describe_session, format_minutes, SummaryRenderer, SummaryStyle};

pub const DEFAULT_GAP_LOOKBACK_DAYS: i64 = 30;

/// A watched or read concept that has not shown up in code yet
#[derive(Debug, Clone, Serialize)]
pub struct GapInsight {
    pub concept: String,
    pub concept_id: String,
    pub activity_id: String,
    pub watched_date: NaiveDate,
    pub days_since: i64,
    pub recommendation: String,
}

impl From<LearningGap> for GapInsight {
    fn from(gap: LearningGap) -> Self {
        let recommendation = recommendation(&gap.concept, gap.days_since);
        Self {
            concept: gap.concept,
            concept_id: gap.concept_id,
            activity_id: gap.activity_id,
            watched_date: gap.watched_at.date_naive(),
            days_since: gap.days_since,
            recommendation,
        }
    }
}

pub fn recommendation(concept: &str, days_since: i64) -> String {
    let when = match days_since {
        d if d <= 0 => "today".to_string(),
        1 => "yesterday".to_string(),
        d => format!("{} days ago", d),
    };
    format!("Consider applying {} in a coding project (watched {})", concept, when)
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionDigest {
    pub session_id: String,
    pub activity_type: ActivityType,
    pub project_name: Option<String>,
    pub start_time: DateTime<Utc>,
    pub duration_minutes: i64,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DailySummary {
    pub date: NaiveDate,
    pub style: SummaryStyle,
    pub summary: String,
    pub activities: Vec<SessionDigest>,
    /// Minutes per activity type
    pub time_spent: BTreeMap<String, i64>,
    pub concepts_learned: Vec<String>,
    pub insights: Vec<String>,
}

impl DailySummary {
    pub fn total_minutes(&self) -> i64 {
        self.time_spent.values().sum()
    }

    /// Activity types by time spent, largest first
    pub fn time_by_activity(&self) -> Vec<(String, i64)> {
        let mut entries: Vec<(String, i64)> = self
            .time_spent
            .iter()
            .filter(|(_, minutes)| **minutes > 0)
            .map(|(kind, minutes)| (kind.clone(), *minutes))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        entries
    }

    pub fn top_activity(&self) -> Option<(String, i64)> {
        self.time_by_activity().into_iter().next()
    }

    pub fn longest_sessions(&self, n: usize) -> Vec<&SessionDigest> {
        let mut sessions: Vec<&SessionDigest> = self.activities.iter().collect();
        sessions.sort_by(|a, b| {
            b.duration_minutes
                .cmp(&a.duration_minutes)
                .then_with(|| a.start_time.cmp(&b.start_time))
        });
        sessions.truncate(n);
        sessions
    }
}

/// Builds learning-gap reports and daily summaries from sessions and the graph.
pub struct InsightComposer {
    db: Arc<Mutex<Database>>,
    graph: Arc<Mutex<KnowledgeGraph>>,
    renderer: SummaryRenderer,
    gap_lookback_days: i64,
}

impl InsightComposer {
    pub fn new(db: Arc<Mutex<Database>>, graph: Arc<Mutex<KnowledgeGraph>>) -> Self {
        Self {
            db,
            graph,
            renderer: SummaryRenderer::new(),
            gap_lookback_days: DEFAULT_GAP_LOOKBACK_DAYS,
        }
    }

    pub fn with_lookback_days(mut self, days: i64) -> Self {
        self.gap_lookback_days = days.max(1);
        self
    }

    pub async fn learning_gaps(&self, now: DateTime<Utc>) -> Vec<GapInsight> {
        let gaps = self.graph.lock().await.learning_gaps(now, self.gap_lookback_days);
        debug!("Found {} learning gaps", gaps.len());
        gaps.into_iter().map(GapInsight::from).collect()
    }

    /// Summary of the closed sessions that started on `date` (UTC).
    pub async fn daily_summary(&self, date: NaiveDate, budget_chars: usize) -> Result<DailySummary> {
        let start = Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN));
        let end = start + Duration::days(1);

        let sessions = {
            let db = self.db.lock().await;
            db.get_closed_sessions_between(start, end)?
        };

        let mut seconds_by_type: BTreeMap<String, i64> = BTreeMap::new();
        let activities: Vec<SessionDigest> = sessions
            .iter()
            .map(|session| {
                let seconds = session_seconds(session);
                *seconds_by_type
                    .entry(session.activity_type.as_str().to_string())
                    .or_default() += seconds;
                digest(session, seconds)
            })
            .collect();
        let time_spent: BTreeMap<String, i64> = seconds_by_type
            .into_iter()
            .map(|(kind, seconds)| (kind, to_minutes(seconds)))
            .collect();

        let (concepts_learned, open_gaps) = {
            let graph = self.graph.lock().await;
            let concepts = concepts_learned_between(&graph, start, end);
            let learned: BTreeSet<&str> = concepts.iter().map(String::as_str).collect();
            let open_gaps = graph
                .learning_gaps(end, self.gap_lookback_days)
                .into_iter()
                .filter(|gap| learned.contains(gap.concept.as_str()))
                .count();
            (concepts, open_gaps)
        };

        let style = SummaryStyle::for_budget(budget_chars);
        let mut summary = DailySummary {
            date,
            style,
            summary: String::new(),
            activities,
            time_spent,
            concepts_learned,
            insights: Vec::new(),
        };
        summary.insights = derive_insights(&summary, open_gaps);
        summary.summary = self.renderer.render(style, &summary);

        info!(
            "Daily summary for {}: {} sessions, {} concepts",
            date,
            summary.activities.len(),
            summary.concepts_learned.len()
        );
        Ok(summary)
    }
}

fn session_seconds(session: &Session) -> i64 {
    session
        .duration_seconds
        .or_else(|| session.end_time.map(|end| (end - session.start_time).num_seconds()))
        .unwrap_or(0)
        .max(0)
}

fn to_minutes(seconds: i64) -> i64 {
    (seconds + 30) / 60
}

fn digest(session: &Session, seconds: i64) -> SessionDigest {
    let mut digest = SessionDigest {
        session_id: session.id.0.clone(),
        activity_type: session.activity_type,
        project_name: session.project_name.clone(),
        start_time: session.start_time,
        duration_minutes: to_minutes(seconds),
        summary: String::new(),
    };
    digest.summary = match session.summary.as_deref().map(str::trim) {
        Some(text) if !text.is_empty() => text.to_string(),
        _ => describe_session(&digest),
    };
    digest
}

/// Names of concepts first watched or read inside `[start, end)`.
fn concepts_learned_between(
    graph: &KnowledgeGraph,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<String> {
    let mut names: Vec<String> = graph
        .nodes_with_label(NodeLabel::Concept)
        .into_iter()
        .filter(|concept| {
            graph.edges_to(&concept.id).iter().any(|edge| {
                let at = edge_time(edge);
                edge.edge_type.is_learning_input() && at >= start && at < end
            })
        })
        .map(|concept| concept.property_str("name").unwrap_or(&concept.id).to_string())
        .collect();
    names.sort_by_key(|name| name.to_lowercase());
    names.dedup();
    names
}

fn derive_insights(summary: &DailySummary, open_gaps: usize) -> Vec<String> {
    let mut insights = Vec::new();
    let total = summary.total_minutes();

    if let Some((kind, minutes)) = summary.top_activity() {
        insights.push(format!(
            "Most of the day went to {} ({})",
            kind,
            format_minutes(minutes)
        ));
    }

    let learning: i64 = summary
        .time_spent
        .iter()
        .filter(|(kind, _)| {
            kind.parse::<ActivityType>()
                .map(is_learning_type)
                .unwrap_or(false)
        })
        .map(|(_, minutes)| *minutes)
        .sum();
    if total > 0 && learning > 0 {
        insights.push(format!(
            "Learning activities took {}% of tracked time",
            learning * 100 / total
        ));
    }

    match summary.concepts_learned.len() {
        0 => {}
        1 => insights.push("Picked up 1 new concept".to_string()),
        n => insights.push(format!("Picked up {} new concepts", n)),
    }

    if open_gaps > 0 {
        insights.push(format!(
            "{} of today's concepts have not been applied in code yet",
            open_gaps
        ));
    }
    insights
}

fn is_learning_type(kind: ActivityType) -> bool {
    matches!(
        kind,
        ActivityType::Coding | ActivityType::Reading | ActivityType::Watching | ActivityType::Learning
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use learntrail_schemas::{
        generate_session_id, node_id, EdgeType, GraphNode, Properties,
    };
    use tempfile::NamedTempFile;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 6, 20).unwrap()
    }

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 20, hour, minute, 0).unwrap()
    }

    fn closed(kind: ActivityType, start: DateTime<Utc>, seconds: i64, summary: Option<&str>) -> Session {
        Session {
            id: generate_session_id(),
            activity_type: kind,
            app_name: None,
            project_name: Some("react-shop".to_string()),
            start_time: start,
            end_time: Some(start + Duration::seconds(seconds)),
            duration_seconds: Some(seconds),
            aggregated_files: Vec::new(),
            aggregated_urls: Vec::new(),
            summary: summary.map(str::to_string),
            concepts: Vec::new(),
            confidence: 0.8,
            activity_count: 2,
        }
    }

    fn watch(graph: &mut KnowledgeGraph, activity: &str, concept: &str, when: DateTime<Utc>) {
        let activity_node = graph
            .merge_node(GraphNode::new(NodeLabel::Activity, activity))
            .unwrap();
        let concept_node = graph
            .merge_node(GraphNode::new(NodeLabel::Concept, concept).with_property("name", concept))
            .unwrap();
        let mut properties = Properties::new();
        properties.insert(
            "timestamp".to_string(),
            serde_json::Value::String(learntrail_ingestion::database::format_ts(when)),
        );
        graph
            .create_edge(&activity_node.id, &concept_node.id, EdgeType::Watched, properties, when)
            .unwrap();
    }

    struct Fixture {
        _temp: NamedTempFile,
        db: Arc<Mutex<Database>>,
        graph: Arc<Mutex<KnowledgeGraph>>,
    }

    fn fixture() -> Fixture {
        let temp = NamedTempFile::new().unwrap();
        let db = Database::new(temp.path()).unwrap();
        let graph = KnowledgeGraph::open(temp.path()).unwrap();
        Fixture {
            _temp: temp,
            db: Arc::new(Mutex::new(db)),
            graph: Arc::new(Mutex::new(graph)),
        }
    }

    #[test]
    fn test_recommendation_wording() {
        assert_eq!(
            recommendation("React", 10),
            "Consider applying React in a coding project (watched 10 days ago)"
        );
        assert!(recommendation("Rust", 1).ends_with("(watched yesterday)"));
        assert!(recommendation("Rust", 0).ends_with("(watched today)"));
    }

    #[tokio::test]
    async fn test_daily_summary_aggregates_one_day() {
        let f = fixture();
        {
            let db = f.db.lock().await;
            db.insert_session(&closed(ActivityType::Coding, at(9, 0), 95 * 60, Some("Worked on react-shop")))
                .unwrap();
            db.insert_session(&closed(ActivityType::Watching, at(13, 0), 20 * 60, None))
                .unwrap();
            db.insert_session(&closed(ActivityType::Coding, at(16, 0), 25 * 60, None))
                .unwrap();
            // Next day, excluded
            db.insert_session(&closed(
                ActivityType::Gaming,
                at(9, 0) + Duration::days(1),
                3600,
                None,
            ))
            .unwrap();
        }
        {
            let mut graph = f.graph.lock().await;
            watch(&mut graph, "act_1", "React Hooks", at(13, 5));
            watch(&mut graph, "act_0", "Docker", at(13, 5) - Duration::days(2));
        }

        let composer = InsightComposer::new(f.db.clone(), f.graph.clone());
        let summary = composer.daily_summary(day(), 2000).await.unwrap();

        assert_eq!(summary.activities.len(), 3);
        assert_eq!(summary.time_spent.get("coding"), Some(&120));
        assert_eq!(summary.time_spent.get("watching"), Some(&20));
        assert!(!summary.time_spent.contains_key("gaming"));
        assert_eq!(summary.concepts_learned, vec!["React Hooks".to_string()]);
        assert_eq!(summary.style, SummaryStyle::Detailed);

        assert_eq!(summary.activities[1].summary, "watching on react-shop");
        assert!(summary.insights.contains(&"Most of the day went to coding (2h)".to_string()));
        assert!(summary
            .insights
            .contains(&"1 of today's concepts have not been applied in code yet".to_string()));
        assert!(summary.summary.contains("## Concepts Learned"));
    }

    #[tokio::test]
    async fn test_gaps_carry_recommendations() {
        let f = fixture();
        {
            let mut graph = f.graph.lock().await;
            watch(&mut graph, "act_1", "Kubernetes", at(10, 0) - Duration::days(10));

            // Applied concepts are not gaps
            watch(&mut graph, "act_2", "Docker", at(10, 0) - Duration::days(3));
            let code = graph
                .merge_node(GraphNode::new(NodeLabel::Activity, "act_3"))
                .unwrap();
            graph
                .create_edge(
                    &code.id,
                    &node_id(NodeLabel::Concept, "Docker"),
                    EdgeType::Applied,
                    Properties::new(),
                    at(9, 0),
                )
                .unwrap();
        }

        let composer = InsightComposer::new(f.db.clone(), f.graph.clone());
        let gaps = composer.learning_gaps(at(10, 0)).await;
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].concept, "Kubernetes");
        assert_eq!(gaps[0].days_since, 10);
        assert_eq!(gaps[0].activity_id, "act_1");
        assert_eq!(gaps[0].watched_date, NaiveDate::from_ymd_opt(2026, 6, 10).unwrap());
        assert!(gaps[0].recommendation.contains("watched 10 days ago"));
    }
}
