use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use learntrail_ingestion::database::{format_ts, parse_ts};
use learntrail_schemas::{
    generate_edge_id, ActivityId, EdgeType, Entity, EntityType, GraphEdge, GraphNode, NodeLabel,
    Properties,
};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum GraphError {
    /// An edge referenced a node that was never created; this is a bug in the caller.
    #[error("Graph node not found: {0}")]
    MissingNode(String),

    #[error("Graph storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Graph serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct LearningGap {
    pub concept_id: String,
    pub concept: String,
    pub activity_id: String,
    pub watched_at: DateTime<Utc>,
    pub days_since: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GraphStats {
    pub node_count: usize,
    pub edge_count: usize,
    pub nodes_by_label: BTreeMap<String, usize>,
    pub edges_by_type: BTreeMap<String, usize>,
}

/// Knowledge graph with SQLite rows as the source of truth and a write-through
/// in-memory adjacency. Opening replays every row, O(nodes + edges).
pub struct KnowledgeGraph {
    conn: Connection,
    nodes: HashMap<String, GraphNode>,
    outgoing: HashMap<String, Vec<GraphEdge>>,
    incoming: HashMap<String, Vec<GraphEdge>>,
    edge_keys: HashSet<(String, String, EdgeType)>,
}

impl KnowledgeGraph {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        let mut graph = Self {
            conn,
            nodes: HashMap::new(),
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
            edge_keys: HashSet::new(),
        };
        graph.init_schema()?;
        graph.reload()?;
        Ok(graph)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS graph_nodes (
                id TEXT PRIMARY KEY,
                label TEXT NOT NULL,
                properties TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS graph_edges (
                id TEXT PRIMARY KEY,
                source_id TEXT NOT NULL,
                target_id TEXT NOT NULL,
                edge_type TEXT NOT NULL,
                properties TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                UNIQUE(source_id, target_id, edge_type)
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_graph_edges_source ON graph_edges(source_id)",
            [],
        )?;
        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_graph_edges_target ON graph_edges(target_id)",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS entities (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                activity_id TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                entity_name TEXT NOT NULL,
                confidence REAL NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                UNIQUE(activity_id, entity_type, entity_name)
            )",
            [],
        )?;

        Ok(())
    }

    /// Rebuild the in-memory adjacency from the tables.
    pub fn reload(&mut self) -> Result<()> {
        self.nodes.clear();
        self.outgoing.clear();
        self.incoming.clear();
        self.edge_keys.clear();

        let nodes: Vec<(String, String, String)> = {
            let mut stmt = self.conn.prepare("SELECT id, label, properties FROM graph_nodes")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        for (id, label, properties) in nodes {
            let Some(label) = NodeLabel::parse(&label) else {
                warn!("Skipping node {} with unknown label {}", id, label);
                continue;
            };
            let properties: Properties = serde_json::from_str(&properties).unwrap_or_default();
            self.nodes.insert(id.clone(), GraphNode { id, label, properties });
        }

        let edges: Vec<(String, String, String, String, String, String)> = {
            let mut stmt = self.conn.prepare(
                "SELECT id, source_id, target_id, edge_type, properties, created_at FROM graph_edges",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        for (id, source, target, edge_type, properties, created_at) in edges {
            let Some(edge_type) = EdgeType::parse(&edge_type) else {
                warn!("Skipping edge {} with unknown type {}", id, edge_type);
                continue;
            };
            let edge = GraphEdge {
                id,
                source,
                target,
                edge_type,
                properties: serde_json::from_str(&properties).unwrap_or_default(),
                created_at: parse_ts(&created_at)?,
            };
            self.index_edge(edge);
        }

        info!(
            "Knowledge graph loaded: {} nodes, {} edges",
            self.nodes.len(),
            self.edge_keys.len()
        );
        Ok(())
    }

    fn index_edge(&mut self, edge: GraphEdge) {
        self.edge_keys.insert(edge.key());
        self.incoming
            .entry(edge.target.clone())
            .or_default()
            .push(edge.clone());
        self.outgoing.entry(edge.source.clone()).or_default().push(edge);
    }

    // ========================================================================
    // Mutation
    // ========================================================================

    /// Create the node or merge its properties into the existing one.
    pub fn merge_node(&mut self, node: GraphNode) -> Result<GraphNode, GraphError> {
        let merged = match self.nodes.get(&node.id) {
            Some(existing) => {
                let mut merged = existing.clone();
                merged.properties.extend(node.properties);
                merged
            }
            None => node,
        };

        let now = format_ts(Utc::now());
        self.conn.execute(
            "INSERT INTO graph_nodes (id, label, properties, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(id) DO UPDATE SET
                properties = excluded.properties,
                updated_at = excluded.updated_at",
            params![
                merged.id,
                merged.label.as_str(),
                serde_json::to_string(&merged.properties)?,
                now,
            ],
        )?;

        self.nodes.insert(merged.id.clone(), merged.clone());
        Ok(merged)
    }

    /// Insert an edge unless `(source, target, type)` already exists.
    ///
    /// Returns `Ok(false)` for a duplicate; both ends must already exist.
    pub fn create_edge(
        &mut self,
        source: &str,
        target: &str,
        edge_type: EdgeType,
        properties: Properties,
        created_at: DateTime<Utc>,
    ) -> Result<bool, GraphError> {
        for id in [source, target] {
            if !self.nodes.contains_key(id) {
                return Err(GraphError::MissingNode(id.to_string()));
            }
        }

        let key = (source.to_string(), target.to_string(), edge_type);
        if self.edge_keys.contains(&key) {
            return Ok(false);
        }

        let edge = GraphEdge {
            id: generate_edge_id(),
            source: source.to_string(),
            target: target.to_string(),
            edge_type,
            properties,
            created_at,
        };

        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO graph_edges
                (id, source_id, target_id, edge_type, properties, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                edge.id,
                edge.source,
                edge.target,
                edge.edge_type.as_str(),
                serde_json::to_string(&edge.properties)?,
                format_ts(edge.created_at),
            ],
        )?;

        if inserted == 0 {
            // Written through another connection since our last reload
            debug!("Edge {} -[{}]-> {} already stored", source, edge_type.as_str(), target);
            return Ok(false);
        }

        self.index_edge(edge);
        Ok(true)
    }

    pub fn save_entities(&self, activity_id: &ActivityId, entities: &[Entity]) -> Result<usize, GraphError> {
        let mut saved = 0;
        for entity in entities {
            saved += self.conn.execute(
                "INSERT INTO entities (activity_id, entity_type, entity_name, confidence, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(activity_id, entity_type, entity_name) DO UPDATE SET
                    confidence = MAX(confidence, excluded.confidence),
                    metadata = excluded.metadata",
                params![
                    activity_id.0,
                    entity.entity_type.as_str(),
                    entity.entity_name,
                    entity.confidence as f64,
                    serde_json::to_string(&entity.metadata)?,
                ],
            )?;
        }
        Ok(saved)
    }

    pub fn entities_for_activity(&self, activity_id: &ActivityId) -> Result<Vec<Entity>, GraphError> {
        let mut stmt = self.conn.prepare(
            "SELECT entity_type, entity_name, confidence, metadata
             FROM entities WHERE activity_id = ?1 ORDER BY confidence DESC, id ASC",
        )?;
        let rows = stmt.query_map(params![activity_id.0], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut entities = Vec::new();
        for row in rows {
            let (entity_type, name, confidence, metadata) = row?;
            let Some(entity_type) = EntityType::parse(&entity_type) else {
                continue;
            };
            let mut entity = Entity::new(entity_type, &name, confidence as f32);
            entity.metadata = serde_json::from_str(&metadata).unwrap_or_default();
            entities.push(entity);
        }
        Ok(entities)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn get_node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.get(id)
    }

    pub fn has_node(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn nodes_with_label(&self, label: NodeLabel) -> Vec<&GraphNode> {
        let mut nodes: Vec<&GraphNode> = self.nodes.values().filter(|n| n.label == label).collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    pub fn edges_from(&self, id: &str) -> &[GraphEdge] {
        self.outgoing.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn edges_to(&self, id: &str) -> &[GraphEdge] {
        self.incoming.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_edge(&self, source: &str, target: &str, edge_type: EdgeType) -> bool {
        self.edge_keys
            .contains(&(source.to_string(), target.to_string(), edge_type))
    }

    /// Nodes adjacent in either direction, optionally through one edge type only
    pub fn neighbors(&self, id: &str, edge_type: Option<EdgeType>) -> Vec<GraphNode> {
        let wanted = |e: &&GraphEdge| edge_type.map_or(true, |t| e.edge_type == t);
        let mut seen = HashSet::new();

        self.edges_from(id)
            .iter()
            .filter(wanted)
            .map(|e| e.target.as_str())
            .chain(self.edges_to(id).iter().filter(wanted).map(|e| e.source.as_str()))
            .filter(|other| seen.insert(other.to_string()))
            .filter_map(|other| self.nodes.get(other).cloned())
            .collect()
    }

    /// Concepts watched or read inside the window with no APPLIED edge in the same window.
    pub fn learning_gaps(&self, now: DateTime<Utc>, lookback_days: i64) -> Vec<LearningGap> {
        let window_start = now - Duration::days(lookback_days);
        let mut gaps = Vec::new();

        for concept in self.nodes_with_label(NodeLabel::Concept) {
            let incoming = self.edges_to(&concept.id);

            let applied = incoming
                .iter()
                .any(|e| e.edge_type == EdgeType::Applied && edge_time(e) >= window_start);
            if applied {
                continue;
            }

            let first_watch = incoming
                .iter()
                .filter(|e| e.edge_type.is_learning_input())
                .filter(|e| {
                    let at = edge_time(e);
                    at >= window_start && at <= now
                })
                .min_by_key(|e| edge_time(e));

            if let Some(edge) = first_watch {
                let watched_at = edge_time(edge);
                gaps.push(LearningGap {
                    concept_id: concept.id.clone(),
                    concept: concept.property_str("name").unwrap_or(&concept.id).to_string(),
                    activity_id: edge_activity_id(edge),
                    watched_at,
                    days_since: (now - watched_at).num_days(),
                });
            }
        }

        gaps.sort_by(|a, b| b.days_since.cmp(&a.days_since).then_with(|| a.concept.cmp(&b.concept)));
        gaps
    }

    /// Transitive PREREQUISITE_OF predecessors of a concept, earliest first.
    pub fn learning_path(&self, concept_id: &str) -> Vec<GraphNode> {
        let mut depth: HashMap<&str, usize> = HashMap::new();
        let mut queue = VecDeque::from([(concept_id, 0usize)]);

        while let Some((id, d)) = queue.pop_front() {
            for edge in self.edges_to(id) {
                if edge.edge_type != EdgeType::PrerequisiteOf {
                    continue;
                }
                let source = edge.source.as_str();
                if source == concept_id || depth.contains_key(source) {
                    continue;
                }
                depth.insert(source, d + 1);
                queue.push_back((source, d + 1));
            }
        }

        let mut path: Vec<(&str, usize)> = depth.into_iter().collect();
        path.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        path.into_iter()
            .filter_map(|(id, _)| self.nodes.get(id).cloned())
            .collect()
    }

    pub fn graph_stats(&self) -> GraphStats {
        let mut stats = GraphStats {
            node_count: self.nodes.len(),
            edge_count: self.edge_keys.len(),
            ..Default::default()
        };
        for node in self.nodes.values() {
            *stats
                .nodes_by_label
                .entry(node.label.as_str().to_string())
                .or_default() += 1;
        }
        for (_, _, edge_type) in &self.edge_keys {
            *stats
                .edges_by_type
                .entry(edge_type.as_str().to_string())
                .or_default() += 1;
        }
        stats
    }
}

/// Activity time recorded on the edge, falling back to its creation time
pub fn edge_time(edge: &GraphEdge) -> DateTime<Utc> {
    edge.property_str("timestamp")
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or(edge.created_at)
}

fn edge_activity_id(edge: &GraphEdge) -> String {
    edge.property_str("activity_id")
        .map(str::to_string)
        .unwrap_or_else(|| {
            edge.source
                .strip_prefix(NodeLabel::Activity.id_prefix())
                .unwrap_or(&edge.source)
                .to_string()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::NamedTempFile;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, day, 12, 0, 0).unwrap()
    }

    fn watched_props(activity: &str, when: DateTime<Utc>) -> Properties {
        let mut p = Properties::new();
        p.insert("activity_id".to_string(), activity.into());
        p.insert("timestamp".to_string(), format_ts(when).into());
        p
    }

    fn seed(graph: &mut KnowledgeGraph) -> Result<()> {
        graph.merge_node(GraphNode::new(NodeLabel::Activity, "act_w").with_property("title", "Hooks"))?;
        graph.merge_node(GraphNode::new(NodeLabel::Activity, "act_c"))?;
        graph.merge_node(GraphNode::new(NodeLabel::Concept, "React").with_property("name", "React"))?;
        graph.merge_node(GraphNode::new(NodeLabel::Concept, "Docker").with_property("name", "Docker"))?;
        Ok(())
    }

    #[test]
    fn test_edges_are_unique_and_need_both_ends() -> Result<()> {
        let temp = NamedTempFile::new()?;
        let mut graph = KnowledgeGraph::open(temp.path())?;
        seed(&mut graph)?;

        let created = graph.create_edge(
            "activity_act_w",
            "concept_react",
            EdgeType::Watched,
            watched_props("act_w", at(1)),
            at(1),
        )?;
        assert!(created);
        let again = graph.create_edge(
            "activity_act_w",
            "concept_react",
            EdgeType::Watched,
            Properties::new(),
            at(2),
        )?;
        assert!(!again);

        let err = graph
            .create_edge("activity_act_w", "concept_missing", EdgeType::Watched, Properties::new(), at(1))
            .unwrap_err();
        assert!(matches!(err, GraphError::MissingNode(id) if id == "concept_missing"));

        assert_eq!(graph.graph_stats().edge_count, 1);
        Ok(())
    }

    #[test]
    fn test_reload_rebuilds_adjacency() -> Result<()> {
        let temp = NamedTempFile::new()?;
        {
            let mut graph = KnowledgeGraph::open(temp.path())?;
            seed(&mut graph)?;
            graph.merge_node(GraphNode::new(NodeLabel::Concept, "React").with_property("first_seen", "x"))?;
            graph.create_edge("activity_act_w", "concept_react", EdgeType::Watched, Properties::new(), at(1))?;
        }

        let graph = KnowledgeGraph::open(temp.path())?;
        let react = graph.get_node("concept_react").unwrap();
        assert_eq!(react.property_str("name"), Some("React"));
        assert_eq!(react.property_str("first_seen"), Some("x"));
        assert_eq!(graph.edges_to("concept_react").len(), 1);
        assert!(graph.has_edge("activity_act_w", "concept_react", EdgeType::Watched));

        let stats = graph.graph_stats();
        assert_eq!(stats.node_count, 4);
        assert_eq!(stats.nodes_by_label.get("Concept"), Some(&2));
        assert_eq!(stats.edges_by_type.get("WATCHED"), Some(&1));
        Ok(())
    }

    #[test]
    fn test_unknown_node_queries_are_empty() -> Result<()> {
        let temp = NamedTempFile::new()?;
        let graph = KnowledgeGraph::open(temp.path())?;
        assert!(graph.neighbors("concept_nothing", None).is_empty());
        assert!(graph.edges_from("concept_nothing").is_empty());
        assert!(graph.learning_path("concept_nothing").is_empty());
        Ok(())
    }

    #[test]
    fn test_learning_gaps() -> Result<()> {
        let temp = NamedTempFile::new()?;
        let mut graph = KnowledgeGraph::open(temp.path())?;
        seed(&mut graph)?;

        graph.create_edge("activity_act_w", "concept_react", EdgeType::Watched, watched_props("act_w", at(1)), at(1))?;
        graph.create_edge("activity_act_w", "concept_docker", EdgeType::Watched, watched_props("act_w", at(1)), at(1))?;
        let mut applied = watched_props("act_c", at(5));
        applied.insert("learned_from_activity".to_string(), "act_w".into());
        graph.create_edge("activity_act_c", "concept_docker", EdgeType::Applied, applied, at(5))?;

        let gaps = graph.learning_gaps(at(11), 30);
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].concept, "React");
        assert_eq!(gaps[0].activity_id, "act_w");
        assert_eq!(gaps[0].days_since, 10);

        // Outside the window nothing is reported
        assert!(graph.learning_gaps(at(11), 5).is_empty());

        let neighbors = graph.neighbors("concept_docker", Some(EdgeType::Applied));
        assert_eq!(neighbors.len(), 1);
        assert_eq!(neighbors[0].id, "activity_act_c");
        Ok(())
    }

    #[test]
    fn test_learning_path_orders_earliest_first() -> Result<()> {
        let temp = NamedTempFile::new()?;
        let mut graph = KnowledgeGraph::open(temp.path())?;
        for name in ["HTML", "JavaScript", "React"] {
            graph.merge_node(GraphNode::new(NodeLabel::Concept, name).with_property("name", name))?;
        }
        graph.create_edge("concept_html", "concept_javascript", EdgeType::PrerequisiteOf, Properties::new(), at(2))?;
        graph.create_edge("concept_javascript", "concept_react", EdgeType::PrerequisiteOf, Properties::new(), at(3))?;

        let path: Vec<String> = graph
            .learning_path("concept_react")
            .into_iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(path, vec!["concept_html", "concept_javascript"]);
        Ok(())
    }
}
