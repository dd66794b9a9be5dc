use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// ULID and ID Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActivityId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl fmt::Display for ActivityId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Observation Schema
// ============================================================================

/// A single sampled window snapshot, before any classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub app_name: String,
    pub window_title: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub file_path: Option<String>,
    /// Explicit activity tag from the sampler (e.g. a browser extension), wins over inference.
    #[serde(default)]
    pub source_type: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Observation {
    pub fn new(app_name: &str, window_title: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            app_name: app_name.to_string(),
            window_title: window_title.to_string(),
            url: None,
            file_path: None,
            source_type: None,
            timestamp,
        }
    }

    pub fn with_url(mut self, url: &str) -> Self {
        self.url = Some(url.to_string());
        self
    }

    pub fn with_file_path(mut self, path: &str) -> Self {
        self.file_path = Some(path.to_string());
        self
    }

    pub fn with_source_type(mut self, source_type: &str) -> Self {
        self.source_type = Some(source_type.to_string());
        self
    }
}

// ============================================================================
// Activity Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityType {
    Coding,
    Reading,
    Watching,
    Browsing,
    Gaming,
    Shopping,
    Social,
    Entertainment,
    Work,
    Learning,
    Other,
}

impl ActivityType {
    pub const ALL: [ActivityType; 11] = [
        ActivityType::Coding,
        ActivityType::Reading,
        ActivityType::Watching,
        ActivityType::Browsing,
        ActivityType::Gaming,
        ActivityType::Shopping,
        ActivityType::Social,
        ActivityType::Entertainment,
        ActivityType::Work,
        ActivityType::Learning,
        ActivityType::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityType::Coding => "coding",
            ActivityType::Reading => "reading",
            ActivityType::Watching => "watching",
            ActivityType::Browsing => "browsing",
            ActivityType::Gaming => "gaming",
            ActivityType::Shopping => "shopping",
            ActivityType::Social => "social",
            ActivityType::Entertainment => "entertainment",
            ActivityType::Work => "work",
            ActivityType::Learning => "learning",
            ActivityType::Other => "other",
        }
    }

    /// Watching and reading are the "learning input" side of the learn→apply trace.
    pub fn is_learning_input(&self) -> bool {
        matches!(self, ActivityType::Watching | ActivityType::Reading)
    }
}

impl fmt::Display for ActivityType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActivityType {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let lower = raw.trim().to_lowercase();
        ActivityType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == lower)
            .ok_or_else(|| format!("unknown activity type '{}'", raw))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Learning,
    Entertainment,
    Unknown,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Learning => "learning",
            Classification::Entertainment => "entertainment",
            Classification::Unknown => "unknown",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "learning" => Classification::Learning,
            "entertainment" => Classification::Entertainment,
            _ => Classification::Unknown,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub classification: Classification,
    pub confidence: f32,
    pub reason: String,
}

// ============================================================================
// Activity Metadata
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodingMetadata {
    pub language: Option<String>,
    #[serde(default)]
    pub frameworks: Vec<String>,
    pub project_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WatchingMetadata {
    pub video_id: Option<String>,
    pub channel: Option<String>,
    pub platform: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadingMetadata {
    pub document_type: Option<String>,
    pub page_count: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GamingMetadata {
    pub game_name: Option<String>,
    pub platform: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShoppingMetadata {
    pub category: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrowsingMetadata {
    pub domain: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetadataDetails {
    Coding(CodingMetadata),
    Watching(WatchingMetadata),
    Reading(ReadingMetadata),
    Gaming(GamingMetadata),
    Shopping(ShoppingMetadata),
    Browsing(BrowsingMetadata),
    #[default]
    None,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityMetadata {
    #[serde(default)]
    pub details: MetadataDetails,
    /// Free-form fields that have no typed home.
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl ActivityMetadata {
    pub fn frameworks(&self) -> &[String] {
        match &self.details {
            MetadataDetails::Coding(coding) => &coding.frameworks,
            _ => &[],
        }
    }

    pub fn language(&self) -> Option<&str> {
        match &self.details {
            MetadataDetails::Coding(coding) => coding.language.as_deref(),
            _ => None,
        }
    }

    /// Merge another metadata bag into this one. Typed details are replaced only
    /// when the incoming side carries some, extra keys are overwritten per key.
    pub fn merge(&mut self, other: ActivityMetadata) {
        if other.details != MetadataDetails::None {
            self.details = other.details;
        }
        self.extra.extend(other.extra);
    }
}

// ============================================================================
// Activity Schema
// ============================================================================

/// Content is written after the activity row exists, so readers see `Pending` first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "text", rename_all = "lowercase")]
pub enum ActivityContent {
    #[default]
    Pending,
    Ready(String),
}

impl ActivityContent {
    pub fn text(&self) -> Option<&str> {
        match self {
            ActivityContent::Pending => None,
            ActivityContent::Ready(text) => Some(text),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, ActivityContent::Ready(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub id: ActivityId,
    pub source_type: Option<String>,
    pub activity_type: ActivityType,
    pub app_name: String,
    pub title: String,
    pub content: ActivityContent,
    pub url: Option<String>,
    pub file_path: Option<String>,
    pub project_name: Option<String>,
    pub video_id: Option<String>,
    pub game_name: Option<String>,
    pub session_id: Option<SessionId>,
    pub classification: Classification,
    pub confidence: f32,
    pub timestamp: DateTime<Utc>,
    pub metadata: ActivityMetadata,
}

impl Activity {
    /// Text used for embeddings and concept extraction.
    pub fn semantic_text(&self) -> String {
        let mut parts = vec![self.title.clone()];
        if let Some(project) = &self.project_name {
            parts.push(project.clone());
        }
        if let Some(text) = self.content.text() {
            parts.push(text.chars().take(2000).collect());
        }
        parts.join("\n")
    }
}

// ============================================================================
// Session Schema
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub activity_type: ActivityType,
    pub app_name: Option<String>,
    pub project_name: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub aggregated_files: Vec<String>,
    pub aggregated_urls: Vec<String>,
    pub summary: Option<String>,
    pub concepts: Vec<String>,
    pub confidence: f32,
    pub activity_count: u32,
}

impl Session {
    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }

    pub fn first_url(&self) -> Option<&str> {
        self.aggregated_urls.first().map(String::as_str)
    }

    pub fn first_file(&self) -> Option<&str> {
        self.aggregated_files.first().map(String::as_str)
    }

    /// Append without duplicates, keeping first-seen order.
    pub fn push_file(&mut self, file: &str) -> bool {
        if file.is_empty() || self.aggregated_files.iter().any(|f| f == file) {
            return false;
        }
        self.aggregated_files.push(file.to_string());
        true
    }

    pub fn push_url(&mut self, url: &str) -> bool {
        if url.is_empty() || self.aggregated_urls.iter().any(|u| u == url) {
            return false;
        }
        self.aggregated_urls.push(url.to_string());
        true
    }
}

// ============================================================================
// Entity Schema
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Person,
    Organization,
    Topic,
    Location,
    Video,
    Game,
    Pdf,
    Project,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Person => "person",
            EntityType::Organization => "organization",
            EntityType::Topic => "topic",
            EntityType::Location => "location",
            EntityType::Video => "video",
            EntityType::Game => "game",
            EntityType::Pdf => "pdf",
            EntityType::Project => "project",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "person" => Some(EntityType::Person),
            "organization" => Some(EntityType::Organization),
            "topic" => Some(EntityType::Topic),
            "location" => Some(EntityType::Location),
            "video" => Some(EntityType::Video),
            "game" => Some(EntityType::Game),
            "pdf" => Some(EntityType::Pdf),
            "project" => Some(EntityType::Project),
            _ => None,
        }
    }

    /// Entity kinds that become Concept nodes on the learning-flow side of the graph.
    pub fn is_learnable(&self) -> bool {
        matches!(self, EntityType::Topic | EntityType::Video | EntityType::Pdf)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub entity_type: EntityType,
    pub entity_name: String,
    pub confidence: f32,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Entity {
    pub fn new(entity_type: EntityType, name: &str, confidence: f32) -> Self {
        Self {
            entity_type,
            entity_name: name.trim().to_string(),
            confidence: confidence.clamp(0.0, 1.0),
            metadata: BTreeMap::new(),
        }
    }

    pub fn concept_id(&self) -> String {
        node_id(NodeLabel::Concept, &self.entity_name)
    }
}

// ============================================================================
// Knowledge Graph Schema
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeLabel {
    Activity,
    Concept,
    Project,
    Framework,
    Topic,
}

impl NodeLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeLabel::Activity => "Activity",
            NodeLabel::Concept => "Concept",
            NodeLabel::Project => "Project",
            NodeLabel::Framework => "Framework",
            NodeLabel::Topic => "Topic",
        }
    }

    pub fn id_prefix(&self) -> &'static str {
        match self {
            NodeLabel::Activity => "activity_",
            NodeLabel::Concept => "concept_",
            NodeLabel::Project => "project_",
            NodeLabel::Framework => "framework_",
            NodeLabel::Topic => "topic_",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "Activity" => Some(NodeLabel::Activity),
            "Concept" => Some(NodeLabel::Concept),
            "Project" => Some(NodeLabel::Project),
            "Framework" => Some(NodeLabel::Framework),
            "Topic" => Some(NodeLabel::Topic),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeType {
    Watched,
    Read,
    Applied,
    Before,
    RelatedTo,
    PrerequisiteOf,
    WorkedOn,
    UsedIn,
    Contains,
    Connects,
}

impl EdgeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeType::Watched => "WATCHED",
            EdgeType::Read => "READ",
            EdgeType::Applied => "APPLIED",
            EdgeType::Before => "BEFORE",
            EdgeType::RelatedTo => "RELATED_TO",
            EdgeType::PrerequisiteOf => "PREREQUISITE_OF",
            EdgeType::WorkedOn => "WORKED_ON",
            EdgeType::UsedIn => "USED_IN",
            EdgeType::Contains => "CONTAINS",
            EdgeType::Connects => "CONNECTS",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "WATCHED" => Some(EdgeType::Watched),
            "READ" => Some(EdgeType::Read),
            "APPLIED" => Some(EdgeType::Applied),
            "BEFORE" => Some(EdgeType::Before),
            "RELATED_TO" => Some(EdgeType::RelatedTo),
            "PREREQUISITE_OF" => Some(EdgeType::PrerequisiteOf),
            "WORKED_ON" => Some(EdgeType::WorkedOn),
            "USED_IN" => Some(EdgeType::UsedIn),
            "CONTAINS" => Some(EdgeType::Contains),
            "CONNECTS" => Some(EdgeType::Connects),
            _ => None,
        }
    }

    pub fn is_learning_input(&self) -> bool {
        matches!(self, EdgeType::Watched | EdgeType::Read)
    }
}

pub type Properties = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub label: NodeLabel,
    pub properties: Properties,
}

impl GraphNode {
    pub fn new(label: NodeLabel, key: &str) -> Self {
        Self {
            id: node_id(label, key),
            label,
            properties: Properties::new(),
        }
    }

    pub fn with_property(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    pub edge_type: EdgeType,
    pub properties: Properties,
    pub created_at: DateTime<Utc>,
}

impl GraphEdge {
    pub fn key(&self) -> (String, String, EdgeType) {
        (self.source.clone(), self.target.clone(), self.edge_type)
    }

    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(|v| v.as_str())
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

pub fn generate_activity_id() -> ActivityId {
    ActivityId(format!("act_{}", ulid::Ulid::new()))
}

pub fn generate_session_id() -> SessionId {
    SessionId(format!("sess_{}", ulid::Ulid::new()))
}

pub fn generate_edge_id() -> String {
    format!("edge_{}", ulid::Ulid::new())
}

/// Lowercase, collapse runs of non-alphanumerics into `_`, trim the ends.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_sep = false;
    for ch in name.trim().chars() {
        if ch.is_alphanumeric() {
            if pending_sep && !slug.is_empty() {
                slug.push('_');
            }
            pending_sep = false;
            slug.extend(ch.to_lowercase());
        } else {
            pending_sep = true;
        }
    }
    slug
}

/// Type-prefixed, globally unique node id. Activity nodes key on the activity id verbatim.
pub fn node_id(label: NodeLabel, key: &str) -> String {
    match label {
        NodeLabel::Activity => format!("{}{}", label.id_prefix(), key),
        _ => format!("{}{}", label.id_prefix(), slugify(key)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_generation() {
        let activity_id = generate_activity_id();
        assert!(activity_id.0.starts_with("act_"));
        assert_eq!(activity_id.0.len(), 30); // "act_" + 26 chars

        let session_id = generate_session_id();
        assert!(session_id.0.starts_with("sess_"));

        assert!(generate_edge_id().starts_with("edge_"));
    }

    #[test]
    fn test_slug_and_node_ids() {
        assert_eq!(slugify("  React Hooks!  "), "react_hooks");
        assert_eq!(slugify("C++ / Rust"), "c_rust");
        assert_eq!(node_id(NodeLabel::Concept, "React"), "concept_react");
        assert_eq!(node_id(NodeLabel::Project, "My Project"), "project_my_project");
        assert_eq!(node_id(NodeLabel::Activity, "act_01ABC"), "activity_act_01ABC");
    }

    #[test]
    fn test_activity_type_parsing() {
        assert_eq!("Coding".parse::<ActivityType>(), Ok(ActivityType::Coding));
        assert_eq!("watching".parse::<ActivityType>(), Ok(ActivityType::Watching));
        assert!("cooking".parse::<ActivityType>().is_err());
        for kind in ActivityType::ALL {
            assert_eq!(kind.as_str().parse::<ActivityType>(), Ok(kind));
        }
    }

    #[test]
    fn test_metadata_serialization_is_tagged() {
        let metadata = ActivityMetadata {
            details: MetadataDetails::Coding(CodingMetadata {
                language: Some("rust".into()),
                frameworks: vec!["tokio".into()],
                project_type: None,
            }),
            extra: BTreeMap::new(),
        };

        let json = serde_json::to_value(&metadata).unwrap();
        assert_eq!(json["details"]["kind"], "coding");

        let restored: ActivityMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(restored.language(), Some("rust"));
        assert_eq!(restored.frameworks(), ["tokio".to_string()]);
    }

    #[test]
    fn test_metadata_merge_keeps_typed_details() {
        let mut base = ActivityMetadata {
            details: MetadataDetails::Watching(WatchingMetadata {
                video_id: Some("abc".into()),
                ..Default::default()
            }),
            extra: BTreeMap::new(),
        };
        let mut extra = BTreeMap::new();
        extra.insert("ocr".to_string(), "done".to_string());
        base.merge(ActivityMetadata {
            details: MetadataDetails::None,
            extra,
        });

        assert!(matches!(base.details, MetadataDetails::Watching(_)));
        assert_eq!(base.extra.get("ocr").map(String::as_str), Some("done"));
    }

    #[test]
    fn test_session_aggregation_dedupes() {
        let mut session = Session {
            id: generate_session_id(),
            activity_type: ActivityType::Coding,
            app_name: None,
            project_name: None,
            start_time: Utc::now(),
            end_time: None,
            duration_seconds: None,
            aggregated_files: Vec::new(),
            aggregated_urls: Vec::new(),
            summary: None,
            concepts: Vec::new(),
            confidence: 0.0,
            activity_count: 0,
        };

        assert!(session.push_file("main.rs"));
        assert!(!session.push_file("main.rs"));
        assert!(session.push_file("lib.rs"));
        assert_eq!(session.first_file(), Some("main.rs"));
        assert!(session.is_open());
    }

    #[test]
    fn test_content_states() {
        let pending = ActivityContent::Pending;
        assert!(!pending.is_ready());
        assert_eq!(pending.text(), None);

        let json = serde_json::to_string(&ActivityContent::Ready("hello".into())).unwrap();
        let restored: ActivityContent = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.text(), Some("hello"));
    }
}
