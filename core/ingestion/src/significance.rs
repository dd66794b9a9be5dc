use chrono::{DateTime, Utc};
use learntrail_schemas::ActivityType;
use std::collections::HashMap;

/// Dwell-time gate that keeps fleeting focus changes out of the activity log.
#[derive(Debug, Clone)]
pub struct SignificanceFilter {
    thresholds: HashMap<ActivityType, i64>,
    fallback_secs: i64,
}

impl SignificanceFilter {
    pub fn new(thresholds: HashMap<ActivityType, i64>, fallback_secs: i64) -> Self {
        Self {
            thresholds,
            fallback_secs,
        }
    }

    pub fn threshold_secs(&self, activity_type: ActivityType) -> i64 {
        self.thresholds
            .get(&activity_type)
            .copied()
            .unwrap_or(self.fallback_secs)
    }

    /// Seconds between the two timestamps, never negative.
    pub fn elapsed_secs(current: DateTime<Utc>, previous: DateTime<Utc>) -> i64 {
        (current - previous).num_seconds().max(0)
    }

    pub fn is_significant(
        &self,
        activity_type: ActivityType,
        current: DateTime<Utc>,
        previous: Option<DateTime<Utc>>,
    ) -> bool {
        match previous {
            None => true,
            Some(previous) => {
                Self::elapsed_secs(current, previous) >= self.threshold_secs(activity_type)
            }
        }
    }
}
