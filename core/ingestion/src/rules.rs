use anyhow::{Context, Result};
use learntrail_schemas::{Activity, ActivityType, MetadataDetails};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::enrich::domain_of;
use crate::significance::SignificanceFilter;

/// Per-type tracking policy knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Fold repeated observations into the session instead of tracking each one.
    pub aggregate: bool,
    pub min_duration_secs: i64,
    pub track_individually: bool,
}

/// User override for one activity type; unset fields keep the default.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuleOverride {
    pub aggregate: Option<bool>,
    pub min_duration_secs: Option<i64>,
    pub track_individually: Option<bool>,
}

impl RuleConfig {
    fn merged(mut self, patch: &RuleOverride) -> Self {
        if let Some(aggregate) = patch.aggregate {
            self.aggregate = aggregate;
        }
        if let Some(min) = patch.min_duration_secs {
            self.min_duration_secs = min.max(0);
        }
        if let Some(individually) = patch.track_individually {
            self.track_individually = individually;
        }
        self
    }
}

#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: HashMap<ActivityType, RuleConfig>,
}

impl Default for RuleSet {
    fn default() -> Self {
        let mut rules = HashMap::new();
        let rule = |aggregate, min_duration_secs, track_individually| RuleConfig {
            aggregate,
            min_duration_secs,
            track_individually,
        };
        rules.insert(ActivityType::Coding, rule(true, 300, false));
        rules.insert(ActivityType::Reading, rule(false, 0, true));
        rules.insert(ActivityType::Watching, rule(false, 120, true));
        rules.insert(ActivityType::Browsing, rule(true, 0, false));
        rules.insert(ActivityType::Gaming, rule(false, 0, true));
        rules.insert(ActivityType::Shopping, rule(true, 0, false));
        rules.insert(ActivityType::Other, rule(false, 5, true));
        Self { rules }
    }
}

impl RuleSet {
    /// Merge overrides keyed by activity type name over the defaults table.
    pub fn with_overrides(overrides: &HashMap<String, RuleOverride>) -> Self {
        let mut set = Self::default();
        for (key, patch) in overrides {
            match key.parse::<ActivityType>() {
                Ok(kind) => {
                    let base = set.get(kind);
                    set.rules.insert(kind, base.merged(patch));
                }
                Err(e) => warn!("Skipping rule override: {}", e),
            }
        }
        set
    }

    /// Load overrides from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read rules file {}", path.display()))?;
        let overrides: HashMap<String, RuleOverride> = serde_json::from_str(&raw)
            .with_context(|| format!("invalid rules file {}", path.display()))?;
        info!("Loaded {} rule overrides from {}", overrides.len(), path.display());
        Ok(Self::with_overrides(&overrides))
    }

    /// Types without their own entry use the `other` rule.
    pub fn get(&self, activity_type: ActivityType) -> RuleConfig {
        self.rules
            .get(&activity_type)
            .or_else(|| self.rules.get(&ActivityType::Other))
            .copied()
            .unwrap_or(RuleConfig {
                aggregate: false,
                min_duration_secs: 5,
                track_individually: true,
            })
    }

    pub fn significance_filter(&self) -> SignificanceFilter {
        let thresholds = self
            .rules
            .iter()
            .map(|(kind, rule)| (*kind, rule.min_duration_secs))
            .collect();
        SignificanceFilter::new(thresholds, self.get(ActivityType::Other).min_duration_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleDecision {
    pub should_track: bool,
    pub reason: String,
}

impl RuleDecision {
    fn track(reason: impl Into<String>) -> Self {
        Self {
            should_track: true,
            reason: reason.into(),
        }
    }

    fn skip(reason: impl Into<String>) -> Self {
        Self {
            should_track: false,
            reason: reason.into(),
        }
    }
}

/// Dispatches an activity to its type policy against the last tracked activity.
pub struct RuleEngine {
    rules: RuleSet,
    significance: SignificanceFilter,
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new(RuleSet::default())
    }
}

impl RuleEngine {
    pub fn new(rules: RuleSet) -> Self {
        let significance = rules.significance_filter();
        Self {
            rules,
            significance,
        }
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn apply_rules(&self, activity: &Activity, last: Option<&Activity>) -> RuleDecision {
        let last = match last {
            Some(last) if last.activity_type == activity.activity_type => last,
            Some(last) => {
                return RuleDecision::track(format!(
                    "type changed from {} to {}",
                    last.activity_type, activity.activity_type
                ))
            }
            None => return RuleDecision::track("no previous activity"),
        };

        let rule = self.rules.get(activity.activity_type);
        let decision = match activity.activity_type {
            ActivityType::Coding => self.coding(activity, last, rule),
            ActivityType::Reading => Self::reading(activity, last),
            ActivityType::Watching => self.watching(activity, last),
            ActivityType::Browsing => Self::browsing(activity, last, rule),
            ActivityType::Gaming => Self::gaming(activity, last),
            ActivityType::Shopping => Self::shopping(activity, last),
            ActivityType::Social
            | ActivityType::Entertainment
            | ActivityType::Work
            | ActivityType::Learning
            | ActivityType::Other => self.generic(activity, last),
        };

        debug!(
            "Rule decision for {} ({}): track={} ({})",
            activity.id, activity.activity_type, decision.should_track, decision.reason
        );
        decision
    }

    fn significant(&self, activity: &Activity, last: &Activity) -> bool {
        self.significance
            .is_significant(activity.activity_type, activity.timestamp, Some(last.timestamp))
    }

    fn coding(&self, activity: &Activity, last: &Activity, rule: RuleConfig) -> RuleDecision {
        if activity.project_name != last.project_name {
            return RuleDecision::track("project changed");
        }
        if !rule.aggregate || rule.track_individually {
            return RuleDecision::track("coding tracked individually");
        }
        if self.significant(activity, last) {
            return RuleDecision::track("coding duration crossed threshold");
        }
        RuleDecision::skip("file switch aggregated into session")
    }

    fn reading(activity: &Activity, last: &Activity) -> RuleDecision {
        let current = activity.file_path.as_ref().or(activity.url.as_ref());
        let previous = last.file_path.as_ref().or(last.url.as_ref());
        match (current, previous) {
            (Some(current), Some(previous)) if current == previous => {
                RuleDecision::skip("document already tracked")
            }
            (None, None) if activity.title == last.title => {
                RuleDecision::skip("document already tracked")
            }
            _ => RuleDecision::track("new document"),
        }
    }

    fn watching(&self, activity: &Activity, last: &Activity) -> RuleDecision {
        let same_video = match (&activity.video_id, &last.video_id) {
            (Some(current), Some(previous)) => current == previous,
            _ => activity.url == last.url && activity.title == last.title,
        };
        if !same_video {
            return RuleDecision::track("new video");
        }
        if self.significant(activity, last) {
            RuleDecision::track("rewatch past minimum watch time")
        } else {
            RuleDecision::skip("same video below minimum watch time")
        }
    }

    fn browsing(activity: &Activity, last: &Activity, rule: RuleConfig) -> RuleDecision {
        if !rule.aggregate {
            return if activity.url != last.url {
                RuleDecision::track("new page")
            } else {
                RuleDecision::skip("same page")
            };
        }
        let current = activity.url.as_deref().and_then(domain_of);
        let previous = last.url.as_deref().and_then(domain_of);
        if current != previous {
            RuleDecision::track("first page of domain")
        } else {
            RuleDecision::skip("page folded into domain run")
        }
    }

    fn gaming(activity: &Activity, last: &Activity) -> RuleDecision {
        if activity.game_name != last.game_name {
            RuleDecision::track("new game")
        } else {
            RuleDecision::skip("same game")
        }
    }

    fn shopping(activity: &Activity, last: &Activity) -> RuleDecision {
        if shopping_category(activity) != shopping_category(last) {
            RuleDecision::track("new shopping category")
        } else {
            RuleDecision::skip("same shopping category")
        }
    }

    fn generic(&self, activity: &Activity, last: &Activity) -> RuleDecision {
        if self.significant(activity, last) {
            RuleDecision::track("dwell time above minimum")
        } else {
            RuleDecision::skip("dwell time below minimum")
        }
    }
}

fn shopping_category(activity: &Activity) -> Option<&str> {
    match &activity.metadata.details {
        MetadataDetails::Shopping(shopping) => shopping.category.as_deref(),
        _ => None,
    }
}
