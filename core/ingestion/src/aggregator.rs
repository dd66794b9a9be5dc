use chrono::Duration;
use learntrail_schemas::{Activity, ActivityType, MetadataDetails, Session};
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::enrich::{detect_frameworks, domain_of};

const TOP_DOMAINS: usize = 5;

/// Session-level state that never reached an activity row.
#[derive(Default)]
struct Folded<'a> {
    files: &'a [String],
    urls: &'a [String],
    project: Option<&'a str>,
    count: usize,
}

/// Type-specific reduction of a session's activities.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AggregatedData {
    Coding {
        files: Vec<String>,
        languages: Vec<String>,
        frameworks: Vec<String>,
        project: Option<String>,
    },
    Browsing {
        urls: Vec<String>,
        top_domains: Vec<(String, usize)>,
    },
    Reading {
        documents: Vec<String>,
    },
    Watching {
        videos: Vec<String>,
    },
    Generic {
        count: usize,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct Aggregation {
    pub summary: String,
    pub data: AggregatedData,
    pub concepts: Vec<String>,
    pub confidence: f32,
}

pub struct Aggregator {
    filename_pattern: Regex,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl Aggregator {
    pub fn new() -> Self {
        Self {
            filename_pattern: Regex::new(
                r"([A-Za-z0-9_\-]+\.(?:rs|py|tsx?|jsx?|go|java|kt|swift|c|cc|cpp|h|hpp|rb|php|cs|html|s?css|sql|sh|md|json|toml|ya?ml))\b",
            )
            .expect("valid filename pattern"),
        }
    }

    pub fn aggregate(&self, activity_type: ActivityType, activities: &[Activity]) -> Aggregation {
        self.reduce(activity_type, activities, &Folded::default())
    }

    /// Reduce a session at close. Activity rows go through `filter_noise` first, then the
    /// files and urls the session folded in without writing a row are merged back.
    pub fn aggregate_session(&self, session: &Session, activities: &[Activity]) -> Aggregation {
        let activities = filter_noise(activities);
        let folded = Folded {
            files: &session.aggregated_files,
            urls: &session.aggregated_urls,
            project: session.project_name.as_deref(),
            count: session.activity_count as usize,
        };
        self.reduce(session.activity_type, &activities, &folded)
    }

    fn reduce(&self, activity_type: ActivityType, activities: &[Activity], folded: &Folded) -> Aggregation {
        let data = match activity_type {
            ActivityType::Coding => self.aggregate_coding(activities, folded),
            ActivityType::Browsing => Self::aggregate_browsing(activities, folded),
            ActivityType::Reading => Self::aggregate_reading(activities, folded),
            ActivityType::Watching => Self::aggregate_watching(activities),
            ActivityType::Gaming
            | ActivityType::Shopping
            | ActivityType::Social
            | ActivityType::Entertainment
            | ActivityType::Work
            | ActivityType::Learning
            | ActivityType::Other => AggregatedData::Generic {
                count: activities.len().max(folded.count),
            },
        };

        let summary = summarize(activity_type, &data);
        let concepts = collect_concepts(activities, &data);
        let confidence = if activities.is_empty() {
            0.0
        } else {
            activities.iter().map(|a| a.confidence).sum::<f32>() / activities.len() as f32
        };

        debug!(
            "Aggregated {} {} activities: {}",
            activities.len(),
            activity_type,
            summary
        );

        Aggregation {
            summary,
            data,
            concepts,
            confidence,
        }
    }

    fn aggregate_coding(&self, activities: &[Activity], folded: &Folded) -> AggregatedData {
        let mut files = Vec::new();
        let mut languages = BTreeSet::new();
        let mut frameworks = BTreeSet::new();
        let mut project = None;

        for activity in activities {
            for caps in self.filename_pattern.captures_iter(&activity.title) {
                push_unique(&mut files, &caps[1]);
            }
            if let Some(name) = activity.file_path.as_deref().and_then(file_name) {
                push_unique(&mut files, name);
            }
            if let MetadataDetails::Coding(coding) = &activity.metadata.details {
                languages.extend(coding.language.iter().cloned());
                frameworks.extend(coding.frameworks.iter().cloned());
            }
            if activity.project_name.is_some() {
                project = activity.project_name.clone();
            }
        }

        for name in folded.files.iter().filter_map(|f| file_name(f)) {
            push_unique(&mut files, name);
        }
        if project.is_none() {
            project = folded.project.map(str::to_string);
        }

        AggregatedData::Coding {
            files,
            languages: languages.into_iter().collect(),
            frameworks: frameworks.into_iter().collect(),
            project,
        }
    }

    fn aggregate_browsing(activities: &[Activity], folded: &Folded) -> AggregatedData {
        let mut urls = Vec::new();
        let mut counts: HashMap<String, usize> = HashMap::new();

        for url in activities.iter().filter_map(|a| a.url.as_deref()) {
            push_unique(&mut urls, url);
            if let Some(domain) = domain_of(url) {
                *counts.entry(domain).or_default() += 1;
            }
        }
        // Folded pages count once each
        for url in folded.urls {
            if push_unique(&mut urls, url) {
                if let Some(domain) = domain_of(url) {
                    *counts.entry(domain).or_default() += 1;
                }
            }
        }

        let mut top_domains: Vec<(String, usize)> = counts.into_iter().collect();
        top_domains.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top_domains.truncate(TOP_DOMAINS);

        AggregatedData::Browsing { urls, top_domains }
    }

    fn aggregate_reading(activities: &[Activity], folded: &Folded) -> AggregatedData {
        let mut documents = Vec::new();
        for activity in activities {
            let name = activity
                .file_path
                .as_deref()
                .and_then(file_name)
                .unwrap_or(activity.title.as_str());
            push_unique(&mut documents, name);
        }
        for name in folded.files.iter().filter_map(|f| file_name(f)) {
            push_unique(&mut documents, name);
        }
        AggregatedData::Reading { documents }
    }

    fn aggregate_watching(activities: &[Activity]) -> AggregatedData {
        let mut videos = Vec::new();
        for activity in activities {
            let key = activity.video_id.as_deref().unwrap_or(activity.title.as_str());
            push_unique(&mut videos, key);
        }
        AggregatedData::Watching { videos }
    }
}

fn push_unique(list: &mut Vec<String>, value: &str) -> bool {
    if value.is_empty() || list.iter().any(|v| v == value) {
        return false;
    }
    list.push(value.to_string());
    true
}

fn file_name(path: &str) -> Option<&str> {
    path.rsplit(['/', '\\']).next().filter(|name| !name.is_empty())
}

fn summarize(activity_type: ActivityType, data: &AggregatedData) -> String {
    match data {
        AggregatedData::Coding {
            files,
            languages,
            frameworks,
            project,
        } => {
            let mut summary = format!(
                "Worked on {}: {} file{}",
                project.as_deref().unwrap_or("unknown project"),
                files.len(),
                if files.len() == 1 { "" } else { "s" }
            );
            if !languages.is_empty() {
                summary.push_str(&format!(" in {}", languages.join(", ")));
            }
            if !frameworks.is_empty() {
                summary.push_str(&format!(" using {}", frameworks.join(", ")));
            }
            summary
        }
        AggregatedData::Browsing { urls, top_domains } => {
            let domains: Vec<&str> = top_domains.iter().map(|(d, _)| d.as_str()).collect();
            if domains.is_empty() {
                format!("Browsed {} pages", urls.len())
            } else {
                format!("Browsed {} pages on {}", urls.len(), domains.join(", "))
            }
        }
        AggregatedData::Reading { documents } => {
            format!("Reading: {}", documents.join(", "))
        }
        AggregatedData::Watching { videos } => format!("Watched {} videos", videos.len()),
        AggregatedData::Generic { count } => format!("{} session: {} activities", activity_type, count),
    }
}

fn collect_concepts(activities: &[Activity], data: &AggregatedData) -> Vec<String> {
    let mut concepts = BTreeSet::new();
    if let AggregatedData::Coding {
        languages,
        frameworks,
        ..
    } = data
    {
        concepts.extend(languages.iter().cloned());
        concepts.extend(frameworks.iter().cloned());
    }
    for activity in activities {
        concepts.extend(detect_frameworks(&activity.title));
    }
    concepts.into_iter().collect()
}

/// Dedup key: activity type plus its identifying field.
fn dedup_key(activity: &Activity) -> String {
    let identity = match activity.activity_type {
        ActivityType::Coding => activity.file_path.as_deref().or(activity.project_name.as_deref()),
        ActivityType::Reading => activity.file_path.as_deref().or(activity.url.as_deref()),
        ActivityType::Watching => activity.video_id.as_deref().or(activity.url.as_deref()),
        ActivityType::Browsing | ActivityType::Shopping => activity.url.as_deref(),
        ActivityType::Gaming => activity.game_name.as_deref(),
        ActivityType::Social
        | ActivityType::Entertainment
        | ActivityType::Work
        | ActivityType::Learning
        | ActivityType::Other => None,
    };
    format!(
        "{}:{}",
        activity.activity_type,
        identity.unwrap_or(activity.title.as_str())
    )
}

/// Drop activities whose dedup key was already seen within the last second.
pub fn filter_noise(activities: &[Activity]) -> Vec<Activity> {
    let window = Duration::seconds(1);
    let mut last_seen = HashMap::new();
    let mut kept = Vec::with_capacity(activities.len());

    for activity in activities {
        let key = dedup_key(activity);
        let duplicate = last_seen
            .get(&key)
            .map(|seen| activity.timestamp - *seen < window)
            .unwrap_or(false);
        last_seen.insert(key, activity.timestamp);
        if !duplicate {
            kept.push(activity.clone());
        }
    }

    if kept.len() != activities.len() {
        debug!("Noise filter dropped {} activities", activities.len() - kept.len());
    }
    kept
}
