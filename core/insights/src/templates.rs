use serde::Serialize;

use crate::composer::{DailySummary, SessionDigest};

/// Budgets below this render `Short`
pub const SHORT_BUDGET_CHARS: usize = 400;
/// Budgets below this render `Standard`
pub const STANDARD_BUDGET_CHARS: usize = 1200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryStyle {
    Short,
    Standard,
    Detailed,
}

impl SummaryStyle {
    pub fn for_budget(budget_chars: usize) -> Self {
        if budget_chars < SHORT_BUDGET_CHARS {
            SummaryStyle::Short
        } else if budget_chars < STANDARD_BUDGET_CHARS {
            SummaryStyle::Standard
        } else {
            SummaryStyle::Detailed
        }
    }
}

/// Template renderer for daily summaries
#[derive(Debug, Default)]
pub struct SummaryRenderer;

impl SummaryRenderer {
    pub fn new() -> Self {
        Self
    }

    pub fn render(&self, style: SummaryStyle, summary: &DailySummary) -> String {
        if summary.activities.is_empty() {
            return format!("{}: no tracked sessions.", summary.date);
        }
        match style {
            SummaryStyle::Short => self.render_short(summary),
            SummaryStyle::Standard => self.render_standard(summary),
            SummaryStyle::Detailed => self.render_detailed(summary),
        }
    }

    fn render_short(&self, summary: &DailySummary) -> String {
        // One or two sentences
        let mut parts = vec![format!(
            "{}: {} tracked",
            summary.date,
            format_minutes(summary.total_minutes())
        )];
        if let Some((kind, _)) = summary.top_activity() {
            parts[0].push_str(&format!(", mostly {}", kind));
        }

        if !summary.concepts_learned.is_empty() {
            let shown: Vec<&str> = summary
                .concepts_learned
                .iter()
                .take(3)
                .map(String::as_str)
                .collect();
            let more = summary.concepts_learned.len().saturating_sub(shown.len());
            let mut learned = format!("Learned: {}", shown.join(", "));
            if more > 0 {
                learned.push_str(&format!(" (+{} more)", more));
            }
            parts.push(learned);
        }

        format!("{}.", parts.join(". "))
    }

    fn render_standard(&self, summary: &DailySummary) -> String {
        let mut lines = vec![format!(
            "Daily summary for {} ({} tracked):",
            summary.date,
            format_minutes(summary.total_minutes())
        )];

        for (kind, minutes) in summary.time_by_activity() {
            lines.push(format!("• {}: {}", kind, format_minutes(minutes)));
        }

        if !summary.concepts_learned.is_empty() {
            lines.push(format!(
                "• Learned: {}",
                summary.concepts_learned.join(", ")
            ));
        }

        let highlights: Vec<String> = summary
            .longest_sessions(3)
            .into_iter()
            .map(|s| s.summary.clone())
            .collect();
        if !highlights.is_empty() {
            lines.push(format!("• Highlights: {}", highlights.join("; ")));
        }

        if let Some(insight) = summary.insights.first() {
            lines.push(format!("• {}", insight));
        }

        lines.join("\n")
    }

    fn render_detailed(&self, summary: &DailySummary) -> String {
        let mut lines = vec![
            format!("# Daily Summary: {}", summary.date),
            format!(
                "\nTracked {} across {} sessions.",
                format_minutes(summary.total_minutes()),
                summary.activities.len()
            ),
            "\n## Time Spent".to_string(),
        ];
        for (kind, minutes) in summary.time_by_activity() {
            lines.push(format!("- {}: {}", kind, format_minutes(minutes)));
        }

        lines.push("\n## Sessions".to_string());
        for session in &summary.activities {
            lines.push(format!(
                "- {} {} ({}): {}",
                session.start_time.format("%H:%M"),
                session.activity_type,
                format_minutes(session.duration_minutes),
                session.summary
            ));
        }

        if !summary.concepts_learned.is_empty() {
            lines.push("\n## Concepts Learned".to_string());
            for concept in &summary.concepts_learned {
                lines.push(format!("- {}", concept));
            }
        }

        if !summary.insights.is_empty() {
            lines.push("\n## Insights".to_string());
            for insight in &summary.insights {
                lines.push(format!("- {}", insight));
            }
        }

        lines.join("\n")
    }
}

pub fn format_minutes(minutes: i64) -> String {
    if minutes < 60 {
        format!("{}m", minutes)
    } else if minutes % 60 == 0 {
        format!("{}h", minutes / 60)
    } else {
        format!("{}h {}m", minutes / 60, minutes % 60)
    }
}

/// Fallback line for a session that closed without an aggregated summary
pub fn describe_session(session: &SessionDigest) -> String {
    match &session.project_name {
        Some(project) => format!("{} on {}", session.activity_type, project),
        None => format!("{} session", session.activity_type),
    }
}
