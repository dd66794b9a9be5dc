use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use learntrail_ingestion::database::format_ts;
use learntrail_ingestion::{Database, SessionCloseHook};
use learntrail_schemas::{
    node_id, Activity, ActivityType, EdgeType, Entity, GraphNode, NodeLabel, Properties, Session,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::entities::EntityExtractor;
use crate::graph_store::{GraphError, KnowledgeGraph};
use crate::sync::EmbeddingSync;
use crate::vector_store::{cosine_similarity, SharedVectorStore, VectorFilter};

#[derive(Debug, Clone)]
pub struct GraphBuilderConfig {
    /// Minimum similarity between a coding activity and earlier learning for APPLIED
    pub applied_similarity: f32,
    pub applied_lookback_days: i64,
    pub related_similarity: f32,
    pub prerequisite_similarity: f32,
    /// PREREQUISITE_OF needs the earlier concept to predate the later by more than this
    pub prerequisite_gap_days: i64,
    pub build_limit: usize,
    pub build_window_days: i64,
    pub neighbor_k: usize,
}

impl Default for GraphBuilderConfig {
    fn default() -> Self {
        Self {
            applied_similarity: 0.6,
            applied_lookback_days: 14,
            related_similarity: 0.7,
            prerequisite_similarity: 0.6,
            prerequisite_gap_days: 7,
            build_limit: 100,
            build_window_days: 7,
            neighbor_k: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildReport {
    pub activities: usize,
    pub entities: usize,
    pub edges_created: usize,
}

/// Turns activities into graph nodes and learning-flow, temporal, topic and project edges.
pub struct GraphBuilder {
    db: Arc<Mutex<Database>>,
    graph: Arc<Mutex<KnowledgeGraph>>,
    vectors: SharedVectorStore,
    extractor: Arc<EntityExtractor>,
    sync: Option<Arc<EmbeddingSync>>,
    config: GraphBuilderConfig,
}

impl GraphBuilder {
    pub fn new(
        db: Arc<Mutex<Database>>,
        graph: Arc<Mutex<KnowledgeGraph>>,
        vectors: SharedVectorStore,
        extractor: Arc<EntityExtractor>,
    ) -> Self {
        Self {
            db,
            graph,
            vectors,
            extractor,
            sync: None,
            config: GraphBuilderConfig::default(),
        }
    }

    pub fn with_sync(mut self, sync: Arc<EmbeddingSync>) -> Self {
        self.sync = Some(sync);
        self
    }

    pub fn with_config(mut self, config: GraphBuilderConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &GraphBuilderConfig {
        &self.config
    }

    /// Bulk pass over a bounded recent window rather than the whole history.
    pub async fn build_knowledge_graph(&self, now: DateTime<Utc>) -> Result<BuildReport> {
        let since = now - Duration::days(self.config.build_window_days);
        let activities = {
            let db = self.db.lock().await;
            db.get_activities_since(since, self.config.build_limit)?
        };
        info!("Building knowledge graph over {} activities", activities.len());
        self.process_activities(&activities).await
    }

    pub async fn process_session(&self, session: &Session) -> Result<BuildReport> {
        let activities = {
            let db = self.db.lock().await;
            db.get_activities_by_session(&session.id)?
        };
        self.process_activities(&activities).await
    }

    pub async fn process_activities(&self, activities: &[Activity]) -> Result<BuildReport> {
        let mut report = BuildReport {
            activities: activities.len(),
            ..Default::default()
        };
        if activities.is_empty() {
            return Ok(report);
        }

        if let Some(sync) = &self.sync {
            sync.sync_activities(activities).await;
        }

        let mut ordered: Vec<&Activity> = activities.iter().collect();
        ordered.sort_by_key(|a| a.timestamp);

        let mut touched: Vec<String> = Vec::new();
        for activity in &ordered {
            let entities = self.extractor.extract(activity).await;
            report.entities += entities.len();

            let learned_from = if activity.activity_type == ActivityType::Coding {
                self.similar_learning_activities(activity).await?
            } else {
                Vec::new()
            };

            let mut graph = self.graph.lock().await;
            graph.save_entities(&activity.id, &entities)?;
            let activity_node = merge_activity_node(&mut graph, activity)?;

            report.edges_created += match activity.activity_type {
                ActivityType::Watching | ActivityType::Reading => {
                    learning_flow_edges(&mut graph, activity, &activity_node, &entities, &mut touched)?
                }
                ActivityType::Coding => {
                    project_edges(&mut graph, activity, &activity_node)?
                        + applied_edges(&mut graph, activity, &activity_node, &entities, &learned_from)?
                }
                _ => 0,
            };
        }

        {
            let mut graph = self.graph.lock().await;
            report.edges_created += temporal_edges(&mut graph, &ordered)?;
        }
        report.edges_created += self.infer_topic_relations(&touched).await?;

        info!(
            "Graph build: {} activities, {} entities, {} new edges",
            report.activities, report.entities, report.edges_created
        );
        Ok(report)
    }

    /// Earlier watching/reading activities close to this one in embedding space.
    async fn similar_learning_activities(&self, activity: &Activity) -> Result<Vec<(String, f32)>> {
        let vectors = self.vectors.read().await;
        let Some(embedding) = vectors.get(&activity.id.0) else {
            debug!("No embedding for {}, skipping APPLIED search", activity.id);
            return Ok(Vec::new());
        };

        let filter = VectorFilter::new()
            .one_of("activity_type", &["watching", "reading"])
            .excluding(&activity.id.0);
        let window_start = activity.timestamp - Duration::days(self.config.applied_lookback_days);

        let hits: Vec<(String, f32)> = vectors
            .query(&embedding, self.config.neighbor_k, &filter)?
            .into_iter()
            .filter(|m| m.similarity() >= self.config.applied_similarity)
            .filter(|m| {
                m.metadata
                    .get("timestamp")
                    .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                    .map(|t| t.with_timezone(&Utc))
                    .map(|t| t >= window_start && t < activity.timestamp)
                    .unwrap_or(false)
            })
            .map(|m| {
                let similarity = m.similarity();
                (m.id, similarity)
            })
            .collect();
        Ok(hits)
    }

    /// RELATED_TO and PREREQUISITE_OF between the given concepts and every other concept,
    /// compared through the embeddings of the activities that introduced them.
    pub async fn infer_topic_relations(&self, concept_ids: &[String]) -> Result<usize> {
        if concept_ids.is_empty() {
            return Ok(0);
        }

        // (concept id, introducing activity, first seen)
        let concepts: Vec<(String, String, DateTime<Utc>)> = {
            let graph = self.graph.lock().await;
            graph
                .nodes_with_label(NodeLabel::Concept)
                .into_iter()
                .filter_map(|node| {
                    let activity = node.property_str("first_activity")?.to_string();
                    let seen = DateTime::parse_from_rfc3339(node.property_str("first_seen")?).ok()?;
                    Some((node.id.clone(), activity, seen.with_timezone(&Utc)))
                })
                .collect()
        };

        let wanted: HashSet<&str> = concept_ids.iter().map(String::as_str).collect();
        let mut planned: Vec<(String, String, EdgeType, Properties, DateTime<Utc>)> = Vec::new();
        let mut compared: HashSet<(String, String)> = HashSet::new();

        {
            let vectors = self.vectors.read().await;
            for a in concepts.iter().filter(|c| wanted.contains(c.0.as_str())) {
                let Some(a_vec) = vectors.get(&a.1) else { continue };

                for b in &concepts {
                    if a.0 == b.0 {
                        continue;
                    }
                    let pair = if a.0 < b.0 {
                        (a.0.clone(), b.0.clone())
                    } else {
                        (b.0.clone(), a.0.clone())
                    };
                    if !compared.insert(pair.clone()) {
                        continue;
                    }
                    let Some(b_vec) = vectors.get(&b.1) else { continue };

                    let similarity = cosine_similarity(&a_vec, &b_vec);
                    let (earlier, later) = if a.2 <= b.2 { (a, b) } else { (b, a) };

                    if similarity >= self.config.related_similarity {
                        let mut props = Properties::new();
                        props.insert("similarity".to_string(), similarity.into());
                        planned.push((pair.0, pair.1, EdgeType::RelatedTo, props, later.2));
                    }

                    let gap = later.2 - earlier.2;
                    if similarity >= self.config.prerequisite_similarity
                        && gap > Duration::days(self.config.prerequisite_gap_days)
                    {
                        let mut props = Properties::new();
                        props.insert("similarity".to_string(), similarity.into());
                        props.insert("days".to_string(), gap.num_days().into());
                        planned.push((
                            earlier.0.clone(),
                            later.0.clone(),
                            EdgeType::PrerequisiteOf,
                            props,
                            later.2,
                        ));
                    }
                }
            }
        }

        let mut graph = self.graph.lock().await;
        let mut created = 0;
        for (source, target, edge_type, props, at) in planned {
            if graph.create_edge(&source, &target, edge_type, props, at)? {
                created += 1;
            }
        }
        Ok(created)
    }
}

// ============================================================================
// Edge passes
// ============================================================================

fn activity_props(activity: &Activity) -> Properties {
    let mut props = Properties::new();
    props.insert("activity_id".to_string(), activity.id.0.clone().into());
    props.insert("timestamp".to_string(), format_ts(activity.timestamp).into());
    props
}

fn merge_activity_node(graph: &mut KnowledgeGraph, activity: &Activity) -> Result<String, GraphError> {
    let mut node = GraphNode::new(NodeLabel::Activity, &activity.id.0)
        .with_property("title", activity.title.clone())
        .with_property("activity_type", activity.activity_type.as_str())
        .with_property("app_name", activity.app_name.clone())
        .with_property("timestamp", format_ts(activity.timestamp));
    if let Some(session_id) = &activity.session_id {
        node = node.with_property("session_id", session_id.0.clone());
    }
    Ok(graph.merge_node(node)?.id)
}

/// Concept node for an entity; `first_seen` only ever moves earlier.
fn merge_concept_node(
    graph: &mut KnowledgeGraph,
    entity: &Entity,
    activity: &Activity,
) -> Result<String, GraphError> {
    let id = entity.concept_id();
    let first_seen = graph
        .get_node(&id)
        .and_then(|n| n.property_str("first_seen"))
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|t| t.with_timezone(&Utc));

    let mut node = GraphNode::new(NodeLabel::Concept, &entity.entity_name)
        .with_property("name", entity.entity_name.clone())
        .with_property("entity_type", entity.entity_type.as_str());
    if first_seen.map_or(true, |seen| activity.timestamp < seen) {
        node = node
            .with_property("first_seen", format_ts(activity.timestamp))
            .with_property("first_activity", activity.id.0.clone());
    }

    Ok(graph.merge_node(node)?.id)
}

fn learning_flow_edges(
    graph: &mut KnowledgeGraph,
    activity: &Activity,
    activity_node: &str,
    entities: &[Entity],
    touched: &mut Vec<String>,
) -> Result<usize, GraphError> {
    let edge_type = match activity.activity_type {
        ActivityType::Watching => EdgeType::Watched,
        _ => EdgeType::Read,
    };

    let mut created = 0;
    for entity in entities.iter().filter(|e| e.entity_type.is_learnable()) {
        let concept = merge_concept_node(graph, entity, activity)?;
        let mut props = activity_props(activity);
        props.insert("confidence".to_string(), entity.confidence.into());
        if graph.create_edge(activity_node, &concept, edge_type, props, activity.timestamp)? {
            created += 1;
        }
        if !touched.contains(&concept) {
            touched.push(concept);
        }
    }
    Ok(created)
}

/// APPLIED from a coding activity to every concept it shares with similar earlier learning.
fn applied_edges(
    graph: &mut KnowledgeGraph,
    activity: &Activity,
    activity_node: &str,
    entities: &[Entity],
    learned_from: &[(String, f32)],
) -> Result<usize, GraphError> {
    let topics: HashSet<String> = entities
        .iter()
        .filter(|e| e.entity_type.is_learnable())
        .map(Entity::concept_id)
        .collect();

    // concept -> (source activity, similarity); the most similar source wins
    let mut applied: BTreeMap<String, (String, f32)> = BTreeMap::new();
    for (learned_id, similarity) in learned_from {
        let learned_node = node_id(NodeLabel::Activity, learned_id);
        for edge in graph.edges_from(&learned_node) {
            if edge.edge_type.is_learning_input() && topics.contains(&edge.target) {
                let entry = applied
                    .entry(edge.target.clone())
                    .or_insert_with(|| (learned_id.clone(), *similarity));
                if *similarity > entry.1 {
                    *entry = (learned_id.clone(), *similarity);
                }
            }
        }
    }

    let mut created = 0;
    for (concept, (learned_id, similarity)) in applied {
        let mut props = activity_props(activity);
        props.insert("learned_from_activity".to_string(), learned_id.clone().into());
        props.insert("similarity".to_string(), similarity.into());
        if graph.create_edge(activity_node, &concept, EdgeType::Applied, props, activity.timestamp)? {
            info!("{} applied {} learned in {}", activity.id, concept, learned_id);
            created += 1;
        }
    }
    Ok(created)
}

fn project_edges(
    graph: &mut KnowledgeGraph,
    activity: &Activity,
    activity_node: &str,
) -> Result<usize, GraphError> {
    let Some(project) = &activity.project_name else {
        return Ok(0);
    };

    let project_node = graph
        .merge_node(GraphNode::new(NodeLabel::Project, project).with_property("name", project.clone()))?
        .id;

    let mut created = 0;
    if graph.create_edge(
        activity_node,
        &project_node,
        EdgeType::WorkedOn,
        activity_props(activity),
        activity.timestamp,
    )? {
        created += 1;
    }

    for framework in activity.metadata.frameworks() {
        let framework_node = graph
            .merge_node(
                GraphNode::new(NodeLabel::Framework, framework).with_property("name", framework.clone()),
            )?
            .id;
        if graph.create_edge(
            &project_node,
            &framework_node,
            EdgeType::UsedIn,
            activity_props(activity),
            activity.timestamp,
        )? {
            created += 1;
        }
    }
    Ok(created)
}

/// BEFORE edges between consecutive activities of each session.
fn temporal_edges(graph: &mut KnowledgeGraph, ordered: &[&Activity]) -> Result<usize, GraphError> {
    let mut by_session: BTreeMap<&str, Vec<&Activity>> = BTreeMap::new();
    for activity in ordered {
        if let Some(session_id) = &activity.session_id {
            by_session.entry(session_id.0.as_str()).or_default().push(*activity);
        }
    }

    let mut created = 0;
    for activities in by_session.values() {
        for pair in activities.windows(2) {
            let (earlier, later) = (pair[0], pair[1]);
            let mut props = Properties::new();
            props.insert(
                "time_gap_seconds".to_string(),
                (later.timestamp - earlier.timestamp).num_seconds().into(),
            );
            props.insert("session_id".to_string(), later.session_id.as_ref().map(|s| s.0.clone()).into());
            if graph.create_edge(
                &node_id(NodeLabel::Activity, &earlier.id.0),
                &node_id(NodeLabel::Activity, &later.id.0),
                EdgeType::Before,
                props,
                later.timestamp,
            )? {
                created += 1;
            }
        }
    }
    Ok(created)
}

// ============================================================================
// Session hook
// ============================================================================

/// Runs the graph passes over a session's activities once it closes.
pub struct GraphSessionHook {
    builder: Arc<GraphBuilder>,
}

impl GraphSessionHook {
    pub fn new(builder: Arc<GraphBuilder>) -> Self {
        Self { builder }
    }
}

#[async_trait]
impl SessionCloseHook for GraphSessionHook {
    async fn on_session_closed(&self, session: &Session) -> Result<()> {
        let report = self.builder.process_session(session).await?;
        debug!(
            "Session {} added {} edges to the graph",
            session.id, report.edges_created
        );
        Ok(())
    }
}
